use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Router,
};
use cutsmith_engine::ColorResolver;
use serde_json::Value;
use std::sync::Arc;

use crate::db::Database;
use crate::export::ExportScheduler;
use crate::materializer::Materializer;

pub mod exports;
pub mod jobs;
pub mod plans;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub resolver: Arc<ColorResolver>,
    pub materializer: Arc<Materializer>,
    pub exports: Arc<ExportScheduler>,
    /// Frame rate of manual guide timecodes
    pub guide_fps: f64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/projects", plans::router(state.clone()))
        .nest("/timelines", exports::router(state.clone()))
        .nest("/jobs", jobs::router(state))
}

pub(crate) fn json_error(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

pub(crate) fn internal_error(err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "Request failed");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        serde_json::json!({ "error": err.to_string() }),
    )
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;

use super::{internal_error, json_error, AppState};
use crate::export::ExportError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
        .with_state(state)
}

fn export_error(err: ExportError) -> Response {
    match err {
        ExportError::UnknownJob(_) => json_error(StatusCode::NOT_FOUND, json!({ "error": err.to_string() })),
        other => internal_error(other),
    }
}

async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.exports.status(id) {
        Ok(job) => Json(job).into_response(),
        Err(e) => export_error(e),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if let Err(e) = state.exports.cancel(id) {
        return export_error(e);
    }
    match state.exports.status(id) {
        Ok(job) => Json(job).into_response(),
        Err(e) => export_error(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::api::router;
    use crate::export::RenderStatus;
    use crate::materializer::RecordState;
    use crate::testing::{store_timeline_record, test_state, MockBackend, MockSurface};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn call(app: &axum::Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_job_status_and_cancel() {
        let backend = Arc::new(MockBackend::default());
        backend.script("h264", vec![Ok(RenderStatus::Rendering { progress: 0.3 })]);
        let state = test_state(Arc::new(MockSurface::default()), backend);
        store_timeline_record(&state.db, "tl-1", RecordState::FullyApplied);
        let handles = state.exports.enqueue("tl-1", &["h264".to_string()], false).unwrap();
        let job_id = handles[0].job_id;
        let app = router(state.clone());

        let (status, body) = call(&app, "GET", &format!("/jobs/{job_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["preset"], "h264");
        assert_eq!(body["timeline_id"], "tl-1");

        let (status, _) = call(&app, "POST", &format!("/jobs/{job_id}/cancel")).await;
        assert_eq!(status, StatusCode::OK);
        let job = state.exports.wait(job_id).await.unwrap();
        assert_eq!(job.status, crate::jobs::JobStatus::Cancelled);

        let (status, body) = call(&app, "GET", "/jobs/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("999"));
        let (status, _) = call(&app, "POST", "/jobs/999/cancel").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

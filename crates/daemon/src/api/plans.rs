use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use cutsmith_engine::{compile_with, ClipFeedEntry, ClipRegistry, Constraints, EditPlan, ManualGuide};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{internal_error, json_error, AppState};
use crate::materializer::{timeline_name, MaterializationError};

#[derive(Deserialize)]
pub struct CreatePlanRequest {
    clips: Vec<ClipFeedEntry>,
    #[serde(default)]
    constraints: Constraints,
}

#[derive(Deserialize)]
pub struct GuideQuery {
    format: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/:project/plans", post(create_plan))
        .route("/:project/plans/:version", get(get_plan))
        .route("/:project/plans/:version/materialize", post(materialize))
        .route("/:project/plans/:version/record", get(get_record))
        .route("/:project/plans/:version/guide", get(get_guide))
        .with_state(state)
}

fn store_plan(state: &AppState, project: &str, plan: &EditPlan) -> anyhow::Result<String> {
    let version = plan.version();
    let plan_json = serde_json::to_string(plan)?;
    state.db.store_plan(project, &version, &plan_json)?;
    Ok(version)
}

fn load_plan(state: &AppState, project: &str, version: &str) -> Result<EditPlan, Response> {
    let plan_json = state
        .db
        .get_plan(project, version)
        .map_err(internal_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, json!({ "error": "plan not found" })))?;
    serde_json::from_str(&plan_json).map_err(internal_error)
}

fn applied_keys(state: &AppState, project: &str, version: &str) -> Vec<String> {
    state
        .materializer
        .load_record(project, version)
        .ok()
        .flatten()
        .map(|record| record.applied)
        .unwrap_or_default()
}

async fn create_plan(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(req): Json<CreatePlanRequest>,
) -> Response {
    let registry = match ClipRegistry::from_feed(req.clips) {
        Ok(registry) => registry,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() })),
    };

    match compile_with(&registry, &req.constraints, &state.resolver) {
        Ok(plan) => match store_plan(&state, &project, &plan) {
            Ok(version) => {
                info!(project = %project, version = %version, "Stored edit plan");
                Json(json!({ "version": version, "plan": plan })).into_response()
            }
            Err(e) => internal_error(e),
        },
        Err(err) => {
            // Best-effort plans are kept so the caller can accept them later
            let body = match err.plan() {
                Some(plan) => match store_plan(&state, &project, plan) {
                    Ok(version) => json!({ "error": err.to_string(), "version": version, "plan": plan }),
                    Err(e) => return internal_error(e),
                },
                None => json!({ "error": err.to_string() }),
            };
            json_error(StatusCode::UNPROCESSABLE_ENTITY, body)
        }
    }
}

async fn get_plan(State(state): State<AppState>, Path((project, version)): Path<(String, String)>) -> Response {
    match load_plan(&state, &project, &version) {
        Ok(plan) => Json(plan).into_response(),
        Err(response) => response,
    }
}

async fn materialize(State(state): State<AppState>, Path((project, version)): Path<(String, String)>) -> Response {
    let plan = match load_plan(&state, &project, &version) {
        Ok(plan) => plan,
        Err(response) => return response,
    };

    let err = match state.materializer.materialize(&project, &plan).await {
        Ok(record) => return Json(record).into_response(),
        Err(err) => err,
    };

    let status = match &err {
        MaterializationError::LockContention { .. } => {
            return json_error(StatusCode::CONFLICT, json!({ "error": err.to_string() }));
        }
        MaterializationError::Persistence(_) => return internal_error(&err),
        MaterializationError::SurfaceReadOnly(_) => StatusCode::SERVICE_UNAVAILABLE,
        MaterializationError::VerificationFailed(_) => StatusCode::BAD_GATEWAY,
    };

    let applied = applied_keys(&state, &project, &version);
    let guide = ManualGuide::from_plan(&plan, &timeline_name(&project, &version), state.guide_fps, &applied);
    json_error(
        status,
        json!({
            "error": err.to_string(),
            "report": err.report(),
            "guide": guide.to_markdown(),
        }),
    )
}

async fn get_record(State(state): State<AppState>, Path((project, version)): Path<(String, String)>) -> Response {
    match state.materializer.load_record(&project, &version) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, json!({ "error": "no materialization record" })),
        Err(e) => internal_error(e),
    }
}

async fn get_guide(
    State(state): State<AppState>,
    Path((project, version)): Path<(String, String)>,
    Query(query): Query<GuideQuery>,
) -> Response {
    let plan = match load_plan(&state, &project, &version) {
        Ok(plan) => plan,
        Err(response) => return response,
    };
    let applied = applied_keys(&state, &project, &version);
    let guide = ManualGuide::from_plan(&plan, &timeline_name(&project, &version), state.guide_fps, &applied);

    match query.format.as_deref().unwrap_or("markdown") {
        "markdown" => ([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], guide.to_markdown()).into_response(),
        "edl" => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], guide.to_edl()).into_response(),
        "json" => Json(guide).into_response(),
        other => json_error(
            StatusCode::BAD_REQUEST,
            json!({ "error": format!("unknown guide format: {}", other) }),
        ),
    }
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::json;

use super::{internal_error, json_error, AppState};
use crate::export::ExportError;

#[derive(Deserialize)]
pub struct ExportRequest {
    presets: Vec<String>,
    #[serde(default)]
    force: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/:timeline/exports", post(enqueue).get(list))
        .with_state(state)
}

async fn enqueue(
    State(state): State<AppState>,
    Path(timeline): Path<String>,
    Json(req): Json<ExportRequest>,
) -> Response {
    match state.exports.enqueue(&timeline, &req.presets, req.force) {
        Ok(jobs) => Json(json!({ "jobs": jobs })).into_response(),
        Err(ExportError::AlreadyRendered { timeline_id, presets }) => json_error(
            StatusCode::CONFLICT,
            json!({
                "error": "already rendered",
                "timeline_id": timeline_id,
                "presets": presets,
            }),
        ),
        // No record at all is a 404, a record in any other state a conflict
        Err(ExportError::TimelineNotMaterialized { timeline_id, state }) => json_error(
            if state.is_some() { StatusCode::CONFLICT } else { StatusCode::NOT_FOUND },
            json!({
                "error": "timeline not fully materialized",
                "timeline_id": timeline_id,
                "state": state,
            }),
        ),
        Err(ExportError::NoPresets) => json_error(
            StatusCode::BAD_REQUEST,
            json!({ "error": ExportError::NoPresets.to_string() }),
        ),
        Err(e) => internal_error(e),
    }
}

async fn list(State(state): State<AppState>, Path(timeline): Path<String>) -> Response {
    match state.exports.jobs_for_timeline(&timeline) {
        Ok(jobs) => Json(json!({ "jobs": jobs })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::api::router;
    use crate::materializer::RecordState;
    use crate::testing::{store_timeline_record, test_state, MockBackend, MockSurface};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn call(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_enqueue_then_reject_rendered_presets() {
        let state = test_state(Arc::new(MockSurface::default()), Arc::new(MockBackend::default()));
        store_timeline_record(&state.db, "promo-abc", RecordState::FullyApplied);
        let app = router(state.clone());

        let (status, body) = call(
            &app,
            "POST",
            "/timelines/promo-abc/exports",
            Some(json!({ "presets": ["h264", "prores", "h264"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["status"], "queued");

        for job in jobs {
            state.exports.wait(job["job_id"].as_i64().unwrap()).await.unwrap();
        }

        let (status, body) = call(
            &app,
            "POST",
            "/timelines/promo-abc/exports",
            Some(json!({ "presets": ["prores"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["presets"], json!(["prores"]));

        let (status, _) = call(
            &app,
            "POST",
            "/timelines/promo-abc/exports",
            Some(json!({ "presets": ["prores"], "force": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "GET", "/timelines/promo-abc/exports", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unmaterialized_timeline_is_not_rendered() {
        let backend = Arc::new(MockBackend::default());
        let state = test_state(Arc::new(MockSurface::default()), backend.clone());
        store_timeline_record(&state.db, "promo-half", RecordState::PartiallyApplied);
        let app = router(state);

        let (status, _) = call(
            &app,
            "POST",
            "/timelines/never-materialized/exports",
            Some(json!({ "presets": ["h264"] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            "POST",
            "/timelines/promo-half/exports",
            Some(json!({ "presets": ["h264"], "force": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["state"], "partially_applied");
        assert_eq!(backend.submitted(), 0);
    }

    #[tokio::test]
    async fn test_empty_preset_list_is_rejected() {
        let app = router(test_state(Arc::new(MockSurface::default()), Arc::new(MockBackend::default())));
        let (status, _) = call(&app, "POST", "/timelines/promo-abc/exports", Some(json!({ "presets": [] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

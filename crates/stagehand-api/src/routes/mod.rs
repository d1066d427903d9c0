//! API routes.

pub mod destroy;
pub mod health;
pub mod setup;
pub mod steps;
pub mod suspend;

use axum::Router;
use axum::routing::{get, post};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the agent router. Every request gets an `X-Request-ID` (UUID v4
/// when the caller did not send one) for log correlation.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/setup", post(setup::setup))
        .route("/destroy", post(destroy::destroy))
        .route("/start_step", post(steps::start_step))
        .route("/poll_step", post(steps::poll_step))
        .route("/stream_output", post(steps::stream_output))
        .route("/suspend", post(suspend::suspend))
        .route("/healthz", get(health::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use std::collections::HashMap;
    use tower::util::ServiceExt;

    fn app() -> Router {
        router(AppState::new(HashMap::new(), String::new()))
    }

    fn json_post(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthz_responds_ok() {
        let resp = app()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_request_id_is_stamped() {
        let resp = app()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_start_step_before_setup_is_bad_request() {
        let resp = app()
            .oneshot(json_post("/start_step", r#"{"id": "s1"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_poll_unknown_step_is_not_found() {
        let resp = app()
            .oneshot(json_post("/poll_step", r#"{"id": "ghost", "timeout_secs": 0}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_body_is_client_error() {
        let resp = app()
            .oneshot(json_post("/poll_step", "not json"))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_destroy_without_setup_succeeds() {
        let resp = app().oneshot(json_post("/destroy", "{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

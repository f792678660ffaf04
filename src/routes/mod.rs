pub mod datasets;
pub mod health;
pub mod query;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    // The chat front-end is a pure consumer of this API from another origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    // Multipart bodies carry framing overhead beyond the file itself.
    let body_limit = (state.config.max_upload_bytes as usize).saturating_add(1024 * 1024);
    Router::new()
        .merge(health::router())
        .nest(
            "/api/v1",
            Router::new()
                .merge(datasets::router())
                .merge(query::router())
                .merge(health::router())
                .merge(crate::openapi::router()),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod route_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::OnceLock;
    use tower::ServiceExt;

    static STATE: OnceLock<AppState> = OnceLock::new();

    fn state() -> AppState {
        STATE
            .get_or_init(|| {
                futures::executor::block_on(crate::test_support::test_state())
            })
            .clone()
    }

    #[tokio::test]
    async fn health_answers_ok_without_auth() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn jobs_listing_requires_bearer_auth() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/datasets/jobs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upload_requires_bearer_auth() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/datasets/upload")
                    .header("content-type", "multipart/form-data; boundary=deadbeef")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_admin_token_is_forbidden() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/datasets/jobs")
                    .header("authorization", "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn blank_query_is_a_400() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/query")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::insights::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Insights API
        .route(
            "/api/v1/insights/status",
            get(handlers::handle_insight_status),
        )
        .route(
            "/api/v1/insights/recent",
            get(handlers::handle_recent_insights),
        )
        .route(
            "/api/v1/insights/digest",
            post(handlers::handle_weekly_digest),
        )
        .route(
            "/api/v1/insights/:category/generate",
            post(handlers::handle_generate_insight),
        )
        .route(
            "/api/v1/insights/:category/stream",
            get(handlers::handle_stream_insight),
        )
        .route(
            "/api/v1/insights/:category",
            delete(handlers::handle_invalidate_insight),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::test_support::Harness;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn router(harness: &Harness) -> Router {
        build_router(AppState {
            coordinator: harness.coordinator.clone(),
        })
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_generate_then_cooldown() {
        let harness = Harness::new();
        let user_id = Uuid::new_v4();
        let body = serde_json::json!({ "user_id": user_id });

        let (status, first) = send(
            router(&harness),
            post_json("/api/v1/insights/emotional/generate", body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], true);
        assert_eq!(first["cached"], false);
        assert_eq!(first["category"], "emotional");
        assert!(first["insight"]["text"].is_string());

        let (status, second) = send(
            router(&harness),
            post_json("/api/v1/insights/emotional/generate", body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["success"], false);
        assert_eq!(second["error_code"], "COOLDOWN_ACTIVE");
        assert_eq!(second["cooldown"]["remaining_seconds"], 3 * 3600);
        assert_eq!(harness.generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_category_is_bad_request() {
        let harness = Harness::new();
        let (status, body) = send(
            router(&harness),
            post_json(
                "/api/v1/insights/astrology/generate",
                serde_json::json!({ "user_id": Uuid::new_v4() }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(harness.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_status_lists_every_category_without_generating() {
        let harness = Harness::new();
        let uri = format!("/api/v1/insights/status?user_id={}", Uuid::new_v4());
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();

        let (status, body) = send(router(&harness), request).await;

        assert_eq!(status, StatusCode::OK);
        let states = body["cooldown_status"].as_object().unwrap();
        assert_eq!(states.len(), 5);
        assert_eq!(states["growth"]["state"], "never_attempted");
        assert_eq!(body["recent_insights"].as_array().unwrap().len(), 0);
        assert_eq!(harness.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_missing_insight_is_not_found() {
        let harness = Harness::new();
        let uri = format!("/api/v1/insights/social?user_id={}", Uuid::new_v4());
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(router(&harness), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invalidate_active_insight() {
        let harness = Harness::new();
        let user_id = Uuid::new_v4();
        harness
            .coordinator
            .generate_category_insight(user_id, "social", false)
            .await;

        let uri = format!("/api/v1/insights/social?user_id={user_id}");
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .unwrap();

        let (status, _) = send(router(&harness), request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_stream_emits_status_insight_done() {
        let harness = Harness::new();
        let uri = format!(
            "/api/v1/insights/behavioral/stream?user_id={}",
            Uuid::new_v4()
        );
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();

        let response = router(&harness).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        let status_at = text.find("event: status").unwrap();
        let insight_at = text.find("event: insight").unwrap();
        let done_at = text.find("event: done").unwrap();
        assert!(status_at < insight_at && insight_at < done_at);
        assert!(!text.contains("event: error"));
        assert!(text.contains("data: [DONE]"));
    }

    #[tokio::test]
    async fn test_health_reports_categories() {
        let harness = Harness::new();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let (status, body) = send(router(&harness), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "insight-api");
        assert_eq!(body["categories"].as_array().unwrap().len(), 5);
    }
}

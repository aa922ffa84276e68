//! Application routing
//!
//! This module defines all HTTP routes for the application.

use axum::{
    http::HeaderName,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{chat_completions, credentials, health, metrics, models};
use crate::middleware::{
    auth::require_chat_token,
    logging::{log_request, REQUEST_ID_HEADER, TRACE_ID_HEADER},
};
use crate::server::state::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // Probes and scrape endpoint (no authentication required)
    let health_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness))
        .route("/liveness", get(health::liveness))
        .route("/metrics", get(metrics::metrics));

    // OpenAI API routes, bearer token protected
    let openai_routes = Router::new()
        .route("/chat/completions", post(chat_completions::chat_completions))
        .route("/models", get(models::list_models))
        .route("/models/:model_id", get(models::get_model))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_chat_token,
        ));

    // Admin surface; handlers resolve the Basic-auth capability themselves
    let admin_routes = Router::new()
        .route("/credentials", get(credentials::list_credentials))
        .route(
            "/credentials/:id",
            get(credentials::get_credential).post(credentials::update_credential),
        );

    Router::new()
        .nest("/v1", openai_routes)
        .nest("/api", admin_routes)
        .route("/logout", get(credentials::logout))
        .merge(health_routes)
        .layer(create_cors_layer())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(TRACE_ID_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, UserGroups};
    use crate::services::{
        CredentialSeed, EgressPath, TokenStream, Upstream, UpstreamError, UpstreamRequest,
    };
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    struct FixedUpstream(Result<Vec<&'static str>, UpstreamError>);

    #[async_trait]
    impl Upstream for FixedUpstream {
        async fn open(
            &self,
            _request: &UpstreamRequest,
            _secret: &str,
            _egress: EgressPath,
        ) -> Result<TokenStream, UpstreamError> {
            let tokens = self.0.clone()?;
            Ok(Box::pin(futures::stream::iter(
                tokens.into_iter().map(|t| Ok(t.to_string())),
            )))
        }
    }

    /// Accepts the request, yields one token, then drops the connection
    struct BrokenStreamUpstream;

    #[async_trait]
    impl Upstream for BrokenStreamUpstream {
        async fn open(
            &self,
            _request: &UpstreamRequest,
            _secret: &str,
            _egress: EgressPath,
        ) -> Result<TokenStream, UpstreamError> {
            Ok(Box::pin(futures::stream::iter(vec![
                Ok("a".to_string()),
                Err(UpstreamError::Transient("connection reset".into())),
            ])))
        }
    }

    fn app_with(seeds: Vec<CredentialSeed>, upstream: impl Upstream + 'static) -> Router {
        let settings = Settings {
            chat_token: Some(TOKEN.to_string()),
            users: UserGroups::new()
                .with_viewer("watcher", "look")
                .with_admin("root", "hunter2"),
            ..Settings::default()
        };
        let state = AppState::with_upstream(settings, seeds, Arc::new(upstream), None).unwrap();
        create_router(state)
    }

    fn app() -> Router {
        app_with(
            vec![
                CredentialSeed::new("a.txt", "sso=aaaaaaaaaaaa"),
                CredentialSeed::new("b.txt", "sso=bbbbbbbbbbbb"),
            ],
            FixedUpstream(Ok(vec!["Hel", "lo"])),
        )
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    fn chat(body: Value) -> Request<Body> {
        Request::post("/v1/chat/completions")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn hello(model: &str, stream: bool) -> Value {
        json!({
            "model": model,
            "stream": stream,
            "messages": [{"role": "user", "content": "hi"}]
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let app = app();
        let response = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(TRACE_ID_HEADER));
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["credentials"]["total"], 2);

        let response = send(&app, Request::get("/ready").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let empty = app_with(vec![], FixedUpstream(Ok(vec![])));
        let response = send(&empty, Request::get("/ready").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = send(&app, Request::get("/liveness").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_chat_requires_token() {
        let app = app();
        let response = send(&app, Request::get("/v1/models").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::get("/v1/models")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.status(), StatusCode::UNAUTHORIZED);

        let request = Request::get("/v1/models")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"][0]["id"], "grok-3");
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let response = send(&app(), chat(hello("grok-3", false))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "grok-3");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    }

    #[tokio::test]
    async fn test_chat_completion_stream() {
        let response = send(&app(), chat(hello("grok-3-reasoning", true))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = body_text(response).await;
        assert!(body.contains("chat.completion.chunk"));
        assert!(body.contains(r#""role":"assistant""#));
        assert!(body.contains(r#""content":"Hel""#));
        assert!(body.contains(r#""finish_reason":"stop""#));
        assert!(body.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn test_chat_stream_interrupted_mid_response() {
        let app = app_with(
            vec![CredentialSeed::new("a.txt", "sso=aaaaaaaaaaaa")],
            BrokenStreamUpstream,
        );
        let response = send(&app, chat(hello("grok-3", true))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        assert!(body.contains(r#""content":"a""#));
        assert!(body.contains("event: error"));
        assert!(body.contains("stream_interrupted"));
        assert!(!body.contains("[DONE]"));
        assert!(!body.contains(r#""finish_reason":"stop""#));
    }

    #[tokio::test]
    async fn test_chat_rejects_bad_requests() {
        let app = app();
        let response = send(&app, chat(json!({"model": "grok-3", "messages": []}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "invalid_request_error");

        let response = send(&app, chat(hello("gpt-4", false))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_terminal_failures() {
        let blocked = app_with(
            vec![CredentialSeed::new("a.txt", "sso=a")],
            FixedUpstream(Err(UpstreamError::Blocked("403 Forbidden".into()))),
        );
        let response = send(&blocked, chat(hello("grok-3", false))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error"]["code"], "upstream_error");

        let empty = app_with(vec![], FixedUpstream(Ok(vec!["unused"])));
        let response = send(&empty, chat(hello("grok-3", true))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["error"]["code"], "pool_exhausted");
    }

    #[tokio::test]
    async fn test_admin_list_by_capability() {
        let app = app();

        let response = send(&app, Request::get("/api/credentials").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let request = Request::get("/api/credentials")
            .header(header::AUTHORIZATION, basic("watcher", "look"))
            .body(Body::empty())
            .unwrap();
        let body = body_json(send(&app, request).await).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["credentials"][0]["secret"], "sso=aaaa...");

        let request = Request::get("/api/credentials?id=2")
            .header(header::AUTHORIZATION, basic("root", "hunter2"))
            .body(Body::empty())
            .unwrap();
        let body = body_json(send(&app, request).await).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["credentials"][0]["secret"], "sso=bbbbbbbbbbbb");

        let request = Request::get("/api/credentials/9")
            .header(header::AUTHORIZATION, basic("watcher", "look"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_update() {
        let app = app();
        let update = |auth: String, body: Value| {
            Request::post("/api/credentials/1")
                .header(header::AUTHORIZATION, auth)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let response = send(&app, update(basic("watcher", "look"), json!({"enabled": false}))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = send(&app, update(basic("root", "hunter2"), json!({"enabled": false}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["credential"]["enabled"], false);
        assert_eq!(body["persisted"], false);

        let request = Request::get("/api/credentials/1")
            .header(header::AUTHORIZATION, basic("watcher", "look"))
            .body(Body::empty())
            .unwrap();
        let body = body_json(send(&app, request).await).await;
        assert_eq!(body["enabled"], false);

        let response = send(&app, update(basic("root", "hunter2"), json!({}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_logout_challenges() {
        let response = send(&app(), Request::get("/logout").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers()[header::WWW_AUTHENTICATE]
            .to_str()
            .unwrap()
            .starts_with("Basic"));
    }

    #[tokio::test]
    async fn test_metrics_after_chat() {
        let app = app();
        send(&app, chat(hello("grok-3", false))).await;

        let response = send(&app, Request::get("/metrics").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("credentials_total 2"));
        assert!(text.contains(r#"gateway_requests_total{result="success"} 1"#));
        assert!(text.contains(r#"upstream_attempts_total{egress="direct",outcome="success"} 1"#));
    }
}

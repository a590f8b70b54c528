//! Axum-based moderation gateway for the Aula classroom chatbot platform.
//! Config-driven via `AulaConfig`; identity/role resolution is upstream (the
//! auth proxy injects `x-student-roll` / `x-student-role`), so this binary is
//! only the HTTP face of the moderation core: warnings, locks, appeals, the
//! authorization gate, and a live SSE event feed.

mod handlers;

use axum::http::Method;
use axum::routing::{delete, get, post};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aula_core::{
    AppealWorkflow, AulaConfig, AuthorizationGate, LockCache, ModerationEngine, ModerationStore,
    Notifier,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<AulaConfig>,
    pub(crate) store: Arc<ModerationStore>,
    pub(crate) cache: Arc<LockCache>,
    pub(crate) engine: Arc<ModerationEngine>,
    pub(crate) gate: Arc<AuthorizationGate>,
    pub(crate) appeals: Arc<AppealWorkflow>,
    pub(crate) notifier: Notifier,
}

impl AppState {
    /// Wires the core components against a store rooted under `storage_path`.
    fn build(config: AulaConfig, storage_path: PathBuf) -> Result<Self, aula_core::ModerationError> {
        let store = Arc::new(ModerationStore::open_path(storage_path)?);
        let cache = Arc::new(LockCache::new());
        let notifier = Notifier::new(config.event_capacity);
        let engine = Arc::new(ModerationEngine::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            notifier.clone(),
        ));
        let gate = Arc::new(AuthorizationGate::new(
            Arc::clone(&store),
            Arc::clone(&cache),
        ));
        let appeals = Arc::new(AppealWorkflow::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            notifier.clone(),
            Arc::clone(&engine),
        ));
        Ok(Self {
            config: Arc::new(config),
            store,
            cache,
            engine,
            gate,
            appeals,
            notifier,
        })
    }
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/admin/students", post(handlers::register_student))
        .route("/api/warning", post(handlers::post_warning))
        .route("/api/warning/:id", delete(handlers::delete_warning))
        .route("/api/admin/warnings/:roll", get(handlers::list_warnings))
        .route("/api/admin/lock", post(handlers::admin_lock))
        .route("/api/admin/unlock", post(handlers::admin_unlock))
        .route("/api/ops/global-lock", post(handlers::global_lock))
        .route("/api/ops/global-unlock", post(handlers::global_unlock))
        .route("/api/user/appeal", post(handlers::submit_appeal))
        .route("/api/admin/appeals", get(handlers::list_appeals))
        .route(
            "/api/admin/appeals/:id/respond",
            post(handlers::respond_appeal),
        )
        .route("/api/user/status/:roll", get(handlers::moderation_status))
        .route("/api/chat", post(handlers::chat))
        .route("/api/events", get(handlers::events_stream))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[aula-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match AulaConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[aula-gateway] config error: {}", e);
            std::process::exit(1);
        }
    };
    let storage = PathBuf::from(&config.storage_path).join("aula_moderation");
    let port = config.port;
    let app_name = config.app_name.clone();

    let state = match AppState::build(config, storage) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[aula-gateway] store error: {}", e);
            std::process::exit(1);
        }
    };

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("{} listening on {}", app_name, addr);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app(state)).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        AppState::build(AulaConfig::default(), dir.path().to_path_buf()).unwrap()
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        roll: Option<&str>,
        role: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(roll) = roll {
            builder = builder
                .header("x-student-roll", roll)
                .header("x-student-role", role);
        }
        let request = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn register(app: &Router, roll: &str) {
        let (status, _) = send(
            app,
            "POST",
            "/api/admin/students",
            Some("admin1"),
            "admin",
            Some(json!({ "roll": roll, "name": roll })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn health_reports_app_identity() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir));
        let (status, body) = send(&app, "GET", "/api/health", None, "", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["app_name"], "Aula Gateway");
    }

    #[tokio::test]
    async fn identity_header_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir));
        let (status, body) = send(
            &app,
            "POST",
            "/api/chat",
            None,
            "",
            Some(json!({ "message": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Missing identity");
    }

    #[tokio::test]
    async fn warning_routes_are_admin_only() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir));
        let (status, body) = send(
            &app,
            "POST",
            "/api/warning",
            Some("22CS101"),
            "student",
            Some(json!({ "roll": "22CS101", "reason": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Admin only");
    }

    #[tokio::test]
    async fn third_warning_locks_the_account_and_blocks_chat() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir));
        register(&app, "22CS101").await;

        for _ in 0..3 {
            let (status, _) = send(
                &app,
                "POST",
                "/api/warning",
                Some("admin1"),
                "admin",
                Some(json!({ "roll": "22CS101", "reason": "off-topic", "level": "low" })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) = send(
            &app,
            "GET",
            "/api/user/status/22CS101",
            Some("admin1"),
            "admin",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["warning_count"], 0);
        assert!(!body["locked_until"].is_null());
        assert_eq!(body["active_lock"]["reason"], "auto-lock after warnings");

        let (status, body) = send(
            &app,
            "POST",
            "/api/chat",
            Some("22CS101"),
            "student",
            Some(json!({ "message": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["reason"], "auto-lock after warnings");
        assert!(!body["locked_until"].is_null());
    }

    #[tokio::test]
    async fn clean_account_can_chat() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir));
        register(&app, "22CS102").await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/chat",
            Some("22CS102"),
            "student",
            Some(json!({ "message": "what is recursion?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["roll"], "22CS102");
    }

    #[tokio::test]
    async fn invalid_lock_duration_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir));
        register(&app, "22CS103").await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/admin/lock",
            Some("admin1"),
            "admin",
            Some(json!({ "roll": "22CS103", "reason": "x", "seconds": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn appeal_spam_is_rate_limited_with_a_retry_hint() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir));
        register(&app, "22CS104").await;
        for _ in 0..5 {
            let (status, _) = send(
                &app,
                "POST",
                "/api/user/appeal",
                Some("22CS104"),
                "student",
                Some(json!({ "message": "please review" })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
        let (status, body) = send(
            &app,
            "POST",
            "/api/user/appeal",
            Some("22CS104"),
            "student",
            Some(json!({ "message": "please review" })),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body["retry_after_secs"].is_u64());
    }

    #[tokio::test]
    async fn appeal_unlock_frees_the_account_but_keeps_the_appeal_open() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir));
        register(&app, "22CS105").await;

        let (status, _) = send(
            &app,
            "POST",
            "/api/admin/lock",
            Some("admin1"),
            "admin",
            Some(json!({ "roll": "22CS105", "reason": "misuse", "seconds": 3600 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/api/user/appeal",
            Some("22CS105"),
            "student",
            Some(json!({ "message": "it was course material" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let appeal_id = body["appeal_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/admin/appeals/{}/respond", appeal_id),
            Some("admin1"),
            "admin",
            Some(json!({ "action": "unlock", "response": "resolved" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["appeal"]["status"], "open");

        let (status, _) = send(
            &app,
            "POST",
            "/api/chat",
            Some("22CS105"),
            "student",
            Some(json!({ "message": "back again" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn students_cannot_read_other_students_status() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir));
        register(&app, "22CS106").await;
        let (status, _) = send(
            &app,
            "GET",
            "/api/user/status/22CS106",
            Some("22CS107"),
            "student",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}

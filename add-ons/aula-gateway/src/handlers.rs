//! Route handlers for the moderation API.
//!
//! Identity and role arrive pre-resolved from the upstream auth layer in the
//! `x-student-roll` / `x-student-role` headers; handlers trust them and only
//! enforce the admin gate where a route is admin-only. Every protected route
//! runs the authorization gate before its own logic; the appeal submission
//! route deliberately does not — a locked account must be able to appeal.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use uuid::Uuid;

use aula_core::{
    account_lock_key, AppealAction, Decision, ModerationError, ProtectedOp, Severity,
    StudentAccount,
};

use crate::AppState;

type ApiReply = (StatusCode, Json<Value>);

/// Resolved caller identity (upstream auth output).
pub(crate) struct Identity {
    pub roll: String,
    pub role: String,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Reads the identity headers the auth layer injects. Missing roll → 401.
pub(crate) fn identity(headers: &HeaderMap) -> Result<Identity, ApiReply> {
    let roll = headers
        .get("x-student-roll")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    match roll {
        Some(roll) => Ok(Identity {
            roll: roll.to_string(),
            role: headers
                .get("x-student-role")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("student")
                .to_string(),
        }),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Missing identity" })),
        )),
    }
}

fn require_admin(id: &Identity) -> Result<(), ApiReply> {
    if id.is_admin() {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Admin only" })),
        ))
    }
}

/// Maps core errors to HTTP replies. Store/codec failures are logged and
/// surfaced as a generic server error — the taxonomy details stay internal.
fn error_reply(err: ModerationError) -> ApiReply {
    match err {
        ModerationError::NotFound(what) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{} not found", what) })),
        ),
        ModerationError::Validation(msg) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
        }
        ModerationError::RateLimited { retry_after_secs } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too many appeals, try later",
                "retry_after_secs": retry_after_secs,
            })),
        ),
        err => {
            tracing::error!("moderation operation failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Server error" })),
            )
        }
    }
}

fn deny_reply(reason: String, until: Option<DateTime<Utc>>) -> ApiReply {
    let mut body = json!({ "error": "Account locked", "reason": reason });
    if let Some(until) = until {
        body["locked_until"] = json!(until);
    }
    (StatusCode::FORBIDDEN, Json(body))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// GET /api/health
pub(crate) async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "app_name": state.config.app_name }))
}

// ---------------------------------------------------------------------------
// Accounts (admin)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct RegisterStudentRequest {
    pub roll: String,
    #[serde(default)]
    pub name: String,
}

/// POST /api/admin/students — registers a student account.
pub(crate) async fn register_student(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterStudentRequest>,
) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&id) {
        return reply;
    }
    if req.roll.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "roll is required" })),
        );
    }
    match state.store.get_account(&req.roll) {
        Ok(Some(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "account already exists" })),
        ),
        Ok(None) => {
            let account = StudentAccount::new(req.roll.trim(), req.name.trim());
            match state.store.put_account(&account) {
                Ok(()) => (StatusCode::CREATED, Json(json!({ "ok": true, "roll": account.roll }))),
                Err(e) => error_reply(e),
            }
        }
        Err(e) => error_reply(e),
    }
}

// ---------------------------------------------------------------------------
// Warnings (admin)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct WarningRequest {
    pub roll: String,
    pub reason: String,
    #[serde(default)]
    pub level: Severity,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// POST /api/warning — records a violation; escalation runs implicitly.
pub(crate) async fn post_warning(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<WarningRequest>,
) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&id) {
        return reply;
    }
    match state
        .engine
        .record_violation(&req.roll, &req.reason, req.level, &id.roll, req.expires_at)
    {
        Ok(warning) => (
            StatusCode::CREATED,
            Json(json!({ "ok": true, "warning": warning })),
        ),
        Err(e) => error_reply(e),
    }
}

/// GET /api/admin/warnings/:roll
pub(crate) async fn list_warnings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(roll): Path<String>,
) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&id) {
        return reply;
    }
    match state.engine.ledger().list_for_roll(&roll) {
        Ok(warnings) => (StatusCode::OK, Json(json!(warnings))),
        Err(e) => error_reply(e),
    }
}

/// DELETE /api/warning/:id — removes a warning and reconciles the counter.
pub(crate) async fn delete_warning(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiReply {
    let caller = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&caller) {
        return reply;
    }
    let Ok(warning_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid warning id" })),
        );
    };
    match state.engine.remove_warning(warning_id) {
        Ok(_) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(e) => error_reply(e),
    }
}

// ---------------------------------------------------------------------------
// Locks (admin)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct LockRequest {
    pub roll: String,
    pub reason: String,
    pub seconds: u64,
}

/// POST /api/admin/lock
pub(crate) async fn admin_lock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LockRequest>,
) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&id) {
        return reply;
    }
    match state.engine.lock(&req.roll, &req.reason, req.seconds, &id.roll) {
        Ok(lock) => (StatusCode::OK, Json(json!({ "ok": true, "lock": lock }))),
        Err(e) => error_reply(e),
    }
}

#[derive(Deserialize)]
pub(crate) struct UnlockRequest {
    pub roll: String,
}

/// POST /api/admin/unlock
pub(crate) async fn admin_unlock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UnlockRequest>,
) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&id) {
        return reply;
    }
    match state.engine.unlock(&req.roll, &id.roll) {
        Ok(_) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(e) => error_reply(e),
    }
}

/// POST /api/ops/global-lock
pub(crate) async fn global_lock(State(state): State<AppState>, headers: HeaderMap) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&id) {
        return reply;
    }
    match state.engine.global_lock() {
        Ok(touched) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "accounts": touched })),
        ),
        Err(e) => error_reply(e),
    }
}

/// POST /api/ops/global-unlock
pub(crate) async fn global_unlock(State(state): State<AppState>, headers: HeaderMap) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&id) {
        return reply;
    }
    match state.engine.global_unlock() {
        Ok(touched) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "accounts": touched })),
        ),
        Err(e) => error_reply(e),
    }
}

// ---------------------------------------------------------------------------
// Appeals
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct AppealRequest {
    pub message: String,
    #[serde(default)]
    pub lock_id: Option<Uuid>,
}

/// POST /api/user/appeal — not gated: locked accounts must be able to appeal.
pub(crate) async fn submit_appeal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AppealRequest>,
) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.appeals.submit(&id.roll, &req.message, req.lock_id) {
        Ok(appeal) => (
            StatusCode::CREATED,
            Json(json!({ "ok": true, "appeal_id": appeal.id })),
        ),
        Err(e) => error_reply(e),
    }
}

/// GET /api/admin/appeals
pub(crate) async fn list_appeals(State(state): State<AppState>, headers: HeaderMap) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&id) {
        return reply;
    }
    match state.appeals.list() {
        Ok(appeals) => (StatusCode::OK, Json(json!(appeals))),
        Err(e) => error_reply(e),
    }
}

#[derive(Deserialize)]
pub(crate) struct AppealRespondRequest {
    pub action: AppealAction,
    #[serde(default)]
    pub response: String,
}

/// POST /api/admin/appeals/:id/respond
pub(crate) async fn respond_appeal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<AppealRespondRequest>,
) -> ApiReply {
    let caller = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if let Err(reply) = require_admin(&caller) {
        return reply;
    }
    let Ok(appeal_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid appeal id" })),
        );
    };
    match state
        .appeals
        .respond(appeal_id, req.action, &req.response, &caller.roll)
    {
        Ok(appeal) => (StatusCode::OK, Json(json!({ "ok": true, "appeal": appeal }))),
        Err(e) => error_reply(e),
    }
}

// ---------------------------------------------------------------------------
// Moderation status
// ---------------------------------------------------------------------------

/// GET /api/user/status/:roll — warnings plus the active lock summary.
/// Students may query themselves; admins may query anyone.
pub(crate) async fn moderation_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(roll): Path<String>,
) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    if !id.is_admin() && id.roll != roll {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Not your account" })),
        );
    }

    let account = match state.store.require_account(&roll) {
        Ok(acc) => acc,
        Err(e) => return error_reply(e),
    };
    let warnings = match state.engine.ledger().list_for_roll(&roll) {
        Ok(w) => w,
        Err(e) => return error_reply(e),
    };
    let now = Utc::now();

    // Prefer the latest non-expired lock row; fall back to the cache mirror
    // so cross-instance locks show up even before the store read catches up.
    let active_lock = match state.store.latest_active_lock(&roll, now) {
        Ok(Some(lock)) => Some(json!({
            "reason": lock.reason,
            "locked_by": lock.locked_by,
            "expires_at": lock.expires_at,
            "source": "store",
        })),
        Ok(None) => match state.cache.get(&account_lock_key(&roll)) {
            Ok(Some(reason)) => Some(json!({ "reason": reason, "source": "cache" })),
            _ => None,
        },
        Err(e) => return error_reply(e),
    };

    (
        StatusCode::OK,
        Json(json!({
            "roll": account.roll,
            "warning_count": account.warning_count,
            "locked_until": account.locked_until,
            "chatbot_locked_until": account.chatbot_locked_until,
            "chatbot_lock_reason": account.chatbot_lock_reason,
            "warnings": warnings,
            "active_lock": active_lock,
        })),
    )
}

// ---------------------------------------------------------------------------
// Chat (gated)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct ChatRequest {
    pub message: String,
}

/// POST /api/chat — runs the gate for the chatbot operation, then hands off.
/// Answer generation itself is a separate service; this returns an ack so the
/// gating behavior is fully exercised end to end.
pub(crate) async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> ApiReply {
    let id = match identity(&headers) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.gate.authorize(&id.roll, ProtectedOp::Chatbot) {
        Ok(Decision::Allow) => (
            StatusCode::OK,
            Json(json!({
                "roll": id.roll,
                "reply": format!("[aula] message received ({} chars)", req.message.chars().count()),
            })),
        ),
        Ok(Decision::Deny { reason, until }) => deny_reply(reason, until),
        Err(e) => error_reply(e),
    }
}

// ---------------------------------------------------------------------------
// Events (SSE)
// ---------------------------------------------------------------------------

/// GET /api/events — SSE stream of moderation events with a keepalive.
pub(crate) async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    use async_stream::stream;
    use tokio::sync::broadcast::error::RecvError;

    let mut rx = state.notifier.subscribe();
    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().event("moderation").data(json));
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    yield Ok(Event::default().comment(format!("{} events dropped", n)));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}

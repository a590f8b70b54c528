//! aula-core: moderation core for the Aula classroom chatbot platform.
//!
//! Warning ledger, lock state machine, authorization gate, and appeal
//! workflow over a sled-backed authoritative store with a best-effort TTL
//! cache mirror and a broadcast notification channel. The gateway add-on
//! exposes these operations over HTTP; this crate carries all the semantics.

mod appeals;
mod cache;
mod config;
mod engine;
mod error;
mod gate;
mod notify;
mod store;
mod types;
mod warnings;

pub use appeals::{AppealWorkflow, APPEAL_LIMIT, APPEAL_WINDOW_SECS, MAX_APPEAL_MESSAGE_CHARS};
pub use cache::{
    account_lock_key, appeal_rate_key, CacheUnavailable, LockCache, WindowCount, GLOBAL_LOCK_KEY,
};
pub use config::AulaConfig;
pub use engine::{
    ModerationEngine, AUTO_LOCK_HOURS, AUTO_LOCK_REASON, GLOBAL_LOCK_DAYS, MANUAL_UNLOCK_REASON,
    MAX_LOCK_SECS, SYSTEM_ISSUER, WARNING_THRESHOLD,
};
pub use error::ModerationError;
pub use gate::AuthorizationGate;
pub use notify::{ModerationEvent, Notifier};
pub use store::ModerationStore;
pub use types::{
    Appeal, AppealAction, AppealStatus, Decision, LockRecord, ProtectedOp, Severity,
    StudentAccount, Warning,
};
pub use warnings::{WarningLedger, HIGH_SEVERITY_CHATBOT_LOCK_HOURS};

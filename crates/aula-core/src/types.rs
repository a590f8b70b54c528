//! Shared record types for the moderation core.
//!
//! Accounts are keyed by roll number. Warnings, locks, and appeals are
//! append-mostly audit collections keyed by opaque UUIDs; the account document
//! carries the denormalized gate fields (`locked_until`, `chatbot_locked_until`)
//! that the [`crate::AuthorizationGate`] reads on the hot path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Violation severity. `High` restricts the chatbot immediately, independent of
/// the cumulative warning counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Low
    }
}

/// A student account as the moderation core sees it. Created on registration,
/// mutated by the warning ledger and the moderation engine, never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentAccount {
    /// Unique roll number (string key).
    pub roll: String,
    /// Display name, carried through for event payloads and the status endpoint.
    #[serde(default)]
    pub name: String,
    /// Role label resolved upstream ("student" or "admin").
    #[serde(default = "default_role")]
    pub role: String,
    /// Cumulative warning counter. Resets to 0 on threshold auto-lock and on
    /// every unlock.
    #[serde(default)]
    pub warning_count: u32,
    /// Account-level lock gate. Expired values are treated as inactive at read
    /// time; no sweeper clears them.
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    /// Chatbot-only restriction gate, orthogonal to the counter path.
    #[serde(default)]
    pub chatbot_locked_until: Option<DateTime<Utc>>,
    /// Reason attached to the chatbot restriction.
    #[serde(default)]
    pub chatbot_lock_reason: String,
}

fn default_role() -> String {
    "student".to_string()
}

impl StudentAccount {
    /// Creates a fresh, unrestricted account.
    pub fn new(roll: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            roll: roll.into(),
            name: name.into(),
            role: default_role(),
            warning_count: 0,
            locked_until: None,
            chatbot_locked_until: None,
            chatbot_lock_reason: String::new(),
        }
    }

    /// True when the account-level lock is active at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }

    /// True when the chatbot restriction is active at `now`.
    pub fn is_chatbot_locked_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.chatbot_locked_until, Some(until) if until > now)
    }

    /// Serializes to JSON bytes for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserializes from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// One violation entry in the warning ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: Uuid,
    /// Roll of the account the warning is against.
    pub roll: String,
    /// Who issued it — an admin roll, or "system" for automated paths.
    pub issuer_roll: String,
    pub reason: String,
    #[serde(default)]
    pub severity: Severity,
    /// Optional explicit expiry supplied by the issuer.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
}

/// One entry in the lock audit history. Multiple records may exist per account;
/// only the latest non-expired one is authoritative for display purposes.
/// "manual-unlock" rows are written with `expires_at = now` purely as audit
/// markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: Uuid,
    pub roll: String,
    pub reason: String,
    /// Issuing admin roll, or "system" for the auto-lock path.
    pub locked_by: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl LockRecord {
    /// True when this record still has effect at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Lifecycle state of an appeal. Mutated only by admin actions after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppealStatus {
    Open,
    InReview,
    Closed,
}

/// Admin resolution action on an appeal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealAction {
    Close,
    Review,
    Unlock,
}

/// A review request submitted by a restricted account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appeal {
    pub id: Uuid,
    pub roll: String,
    /// Optional reference to the lock being appealed.
    #[serde(default)]
    pub lock_id: Option<Uuid>,
    pub message: String,
    pub status: AppealStatus,
    #[serde(default)]
    pub admin_response: String,
    pub created_at: DateTime<Utc>,
}

/// The kind of protected operation being authorized. Account-level locks gate
/// everything; chatbot restrictions gate only [`ProtectedOp::Chatbot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectedOp {
    Account,
    Chatbot,
}

/// Outcome of an authorization check. `Deny` is the expected result for a
/// locked account — callers branch on it, they do not treat it as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny {
        reason: String,
        /// Expiry of the restriction, when known. Cache-sourced denials carry
        /// no expiry (the TTL lives in the cache).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<DateTime<Utc>>,
    },
}

impl Decision {
    /// True when the operation may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub(crate) fn deny(reason: impl Into<String>, until: Option<DateTime<Utc>>) -> Self {
        Self::Deny {
            reason: reason.into(),
            until,
        }
    }
}

//! Warning ledger: durable history of violations per account.
//!
//! The ledger owns the counter side effects: `record` bumps the account's
//! `warning_count` atomically, and a `high` severity entry restricts the
//! chatbot for 12 hours in the same atomic account update — one severe
//! violation is enough, without waiting for the counter threshold. Threshold
//! escalation itself lives in the engine (`evaluate`).
//!
//! `remove` decrements the counter (floored at zero) but never reverses a lock
//! the warning caused: removing a violation record is a correction of history,
//! not a retroactive pardon. Unlocking is a separate explicit action.

use crate::error::ModerationError;
use crate::store::ModerationStore;
use crate::types::{Severity, StudentAccount, Warning};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Chatbot restriction applied on a `high` severity violation.
pub const HIGH_SEVERITY_CHATBOT_LOCK_HOURS: i64 = 12;

/// Append-only violation history with counter maintenance.
pub struct WarningLedger {
    store: Arc<ModerationStore>,
}

impl WarningLedger {
    pub fn new(store: Arc<ModerationStore>) -> Self {
        Self { store }
    }

    /// Records a violation against `roll` and returns the new ledger entry
    /// together with the updated account.
    ///
    /// Fails with `NotFound` for an unknown roll and `Validation` for an empty
    /// reason; neither leaves side effects.
    pub fn record(
        &self,
        roll: &str,
        reason: &str,
        severity: Severity,
        issuer_roll: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(Warning, StudentAccount), ModerationError> {
        if reason.trim().is_empty() {
            return Err(ModerationError::Validation("reason is required".to_string()));
        }
        // Existence check before the insert so a bad roll has no side effects.
        self.store.require_account(roll)?;

        let now = Utc::now();
        let warning = Warning {
            id: Uuid::new_v4(),
            roll: roll.to_string(),
            issuer_roll: issuer_roll.to_string(),
            reason: reason.to_string(),
            severity,
            expires_at,
            issued_at: now,
        };
        self.store.insert_warning(&warning)?;

        let account = self.store.update_account(roll, |acc| {
            acc.warning_count += 1;
            if severity == Severity::High {
                acc.chatbot_locked_until =
                    Some(now + Duration::hours(HIGH_SEVERITY_CHATBOT_LOCK_HOURS));
                acc.chatbot_lock_reason = reason.to_string();
            }
        })?;

        tracing::info!(
            roll,
            severity = ?severity,
            warning_count = account.warning_count,
            "violation recorded"
        );
        Ok((warning, account))
    }

    /// Removes a warning by id and decrements the owner's counter, floored at
    /// zero. Best-effort reconciliation: a vanished account is tolerated, and
    /// any lock the warning caused stays in place.
    pub fn remove(&self, id: Uuid) -> Result<(Warning, Option<StudentAccount>), ModerationError> {
        let warning = self
            .store
            .remove_warning(id)?
            .ok_or(ModerationError::NotFound("warning"))?;

        let account = match self.store.update_account(&warning.roll, |acc| {
            acc.warning_count = acc.warning_count.saturating_sub(1);
        }) {
            Ok(acc) => Some(acc),
            Err(ModerationError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        tracing::info!(roll = %warning.roll, warning_id = %id, "warning removed");
        Ok((warning, account))
    }

    /// Ledger entries for one account, most recent first.
    pub fn list_for_roll(&self, roll: &str) -> Result<Vec<Warning>, ModerationError> {
        self.store.warnings_for_roll(roll)
    }
}

//! Appeal workflow: restricted subjects request review, admins close the loop.
//!
//! Submission is rate-limited through the cache layer's windowed counters
//! (spam control); when the cache is down the limit is simply not enforced —
//! losing rate limiting is safer than blocking every appeal. Resolving the
//! lock and resolving the appeal record are independent: an `unlock` action
//! releases the account but leaves the appeal's status untouched, so an admin
//! can unlock while keeping the appeal open for a different violation.

use crate::cache::{appeal_rate_key, LockCache};
use crate::engine::ModerationEngine;
use crate::error::ModerationError;
use crate::notify::{ModerationEvent, Notifier};
use crate::store::ModerationStore;
use crate::types::{Appeal, AppealAction, AppealStatus};
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Appeals allowed per roll within one rate window.
pub const APPEAL_LIMIT: u64 = 5;

/// Default rate window: one trailing hour.
pub const APPEAL_WINDOW_SECS: i64 = 3600;

/// Maximum appeal message length.
pub const MAX_APPEAL_MESSAGE_CHARS: usize = 2000;

/// Submission and resolution of lock appeals.
pub struct AppealWorkflow {
    store: Arc<ModerationStore>,
    cache: Arc<LockCache>,
    notifier: Notifier,
    engine: Arc<ModerationEngine>,
    rate_window: Duration,
}

impl AppealWorkflow {
    pub fn new(
        store: Arc<ModerationStore>,
        cache: Arc<LockCache>,
        notifier: Notifier,
        engine: Arc<ModerationEngine>,
    ) -> Self {
        Self {
            store,
            cache,
            notifier,
            engine,
            rate_window: Duration::seconds(APPEAL_WINDOW_SECS),
        }
    }

    /// Overrides the rate window (ops tuning and tests).
    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window = window;
        self
    }

    /// Submits an appeal for `roll`, optionally referencing the lock being
    /// contested. Fails with `RateLimited` past [`APPEAL_LIMIT`] submissions
    /// in the current window; a cache outage disables the limit (fail-open).
    pub fn submit(
        &self,
        roll: &str,
        message: &str,
        lock_id: Option<Uuid>,
    ) -> Result<Appeal, ModerationError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ModerationError::Validation(
                "appeal message is required".to_string(),
            ));
        }
        if message.chars().count() > MAX_APPEAL_MESSAGE_CHARS {
            return Err(ModerationError::Validation(format!(
                "appeal message exceeds {} characters",
                MAX_APPEAL_MESSAGE_CHARS
            )));
        }
        self.store.require_account(roll)?;

        match self.cache.incr_window(&appeal_rate_key(roll), self.rate_window) {
            Ok(wc) if wc.count > APPEAL_LIMIT => {
                return Err(ModerationError::RateLimited {
                    retry_after_secs: wc.retry_after_secs,
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(roll, "appeal rate limit skipped: {}", e),
        }

        let appeal = Appeal {
            id: Uuid::new_v4(),
            roll: roll.to_string(),
            lock_id,
            message: message.to_string(),
            status: AppealStatus::Open,
            admin_response: String::new(),
            created_at: Utc::now(),
        };
        self.store.put_appeal(&appeal)?;
        tracing::info!(roll, appeal_id = %appeal.id, "appeal submitted");
        self.notifier.publish(ModerationEvent::AppealNew {
            roll: roll.to_string(),
            appeal_id: appeal.id.to_string(),
        });
        Ok(appeal)
    }

    /// Resolves an appeal. `close` and `review` move the status; `unlock`
    /// releases the account through the engine and leaves the status as it
    /// was. The admin response text is recorded in every case.
    pub fn respond(
        &self,
        appeal_id: Uuid,
        action: AppealAction,
        response_text: &str,
        issuer_roll: &str,
    ) -> Result<Appeal, ModerationError> {
        let mut appeal = self
            .store
            .get_appeal(appeal_id)?
            .ok_or(ModerationError::NotFound("appeal"))?;

        match action {
            AppealAction::Close => appeal.status = AppealStatus::Closed,
            AppealAction::Review => appeal.status = AppealStatus::InReview,
            AppealAction::Unlock => match self.engine.unlock(&appeal.roll, issuer_roll) {
                Ok(_) => {}
                // The account vanished since the appeal was filed; the appeal
                // record itself is still resolvable.
                Err(ModerationError::NotFound(_)) => {
                    tracing::warn!(roll = %appeal.roll, "unlock target missing, appeal updated anyway");
                }
                Err(e) => return Err(e),
            },
        }
        appeal.admin_response = response_text.to_string();
        self.store.put_appeal(&appeal)?;
        tracing::info!(appeal_id = %appeal.id, action = ?action, "appeal resolved");
        Ok(appeal)
    }

    /// All appeals, most recent first (admin review queue).
    pub fn list(&self) -> Result<Vec<Appeal>, ModerationError> {
        self.store.list_appeals()
    }
}

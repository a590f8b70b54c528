//! Moderation engine: the lock state machine.
//!
//! Per-account states (independent, combinable): active, account-locked
//! (`locked_until`), chatbot-restricted (`chatbot_locked_until`). The engine
//! owns every transition: counter-threshold auto-locks, explicit admin
//! lock/unlock, and the administrative global lock. Each transition writes the
//! authoritative store first, then mirrors the fast cache (best-effort), then
//! publishes an event — notifications never fire for a change that did not
//! durably commit.
//!
//! Expired lock fields are never swept; every consumer treats a past expiry as
//! inactive at read time, so history stays behind for audit.

use crate::cache::{account_lock_key, LockCache, GLOBAL_LOCK_KEY};
use crate::error::ModerationError;
use crate::notify::{ModerationEvent, Notifier};
use crate::store::ModerationStore;
use crate::types::{LockRecord, Severity, StudentAccount, Warning};
use crate::warnings::WarningLedger;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Warnings needed before the automatic account lock fires.
pub const WARNING_THRESHOLD: u32 = 3;

/// Duration of the automatic account lock.
pub const AUTO_LOCK_HOURS: i64 = 24;

/// Manual lock durations must fall in `[1, MAX_LOCK_SECS]` seconds (1 year).
pub const MAX_LOCK_SECS: u64 = 365 * 24 * 3600;

/// Global lock horizon: effectively "until an admin unlocks".
pub const GLOBAL_LOCK_DAYS: i64 = 365;

/// Reason written on the counter-threshold transition.
pub const AUTO_LOCK_REASON: &str = "auto-lock after warnings";

/// Reason written on the unlock audit marker.
pub const MANUAL_UNLOCK_REASON: &str = "manual-unlock";

/// Issuer label for automated transitions.
pub const SYSTEM_ISSUER: &str = "system";

/// Accepts violation events and admin commands, decides transitions, and keeps
/// the store, the cache mirror, and connected clients in sync.
pub struct ModerationEngine {
    store: Arc<ModerationStore>,
    cache: Arc<LockCache>,
    notifier: Notifier,
    ledger: WarningLedger,
}

impl ModerationEngine {
    pub fn new(store: Arc<ModerationStore>, cache: Arc<LockCache>, notifier: Notifier) -> Self {
        let ledger = WarningLedger::new(Arc::clone(&store));
        Self {
            store,
            cache,
            notifier,
            ledger,
        }
    }

    /// The underlying warning ledger (listing, raw access).
    pub fn ledger(&self) -> &WarningLedger {
        &self.ledger
    }

    // ------------------------------------------------------------------
    // Violations
    // ------------------------------------------------------------------

    /// Records a violation and runs the escalation check. This is the composed
    /// entry point the warning route calls.
    pub fn record_violation(
        &self,
        roll: &str,
        reason: &str,
        severity: Severity,
        issuer_roll: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Warning, ModerationError> {
        let (warning, account) = self
            .ledger
            .record(roll, reason, severity, issuer_roll, expires_at)?;

        if severity == Severity::High {
            if let Some(until) = account.chatbot_locked_until {
                self.notifier.publish(ModerationEvent::ChatbotRestricted {
                    roll: roll.to_string(),
                    reason: account.chatbot_lock_reason.clone(),
                    expires_at: until,
                });
            }
        }

        let (account, _) = self.evaluate(roll, issuer_roll)?;
        self.notifier.publish(ModerationEvent::WarningUpdated {
            roll: roll.to_string(),
            warning_count: account.warning_count,
            locked_until: account.locked_until,
        });
        Ok(warning)
    }

    /// Removes a warning (admin reversal) and broadcasts the adjusted counter.
    /// Any lock the warning caused stays in place.
    pub fn remove_warning(&self, id: Uuid) -> Result<Warning, ModerationError> {
        let (warning, account) = self.ledger.remove(id)?;
        if let Some(account) = account {
            self.notifier.publish(ModerationEvent::WarningUpdated {
                roll: account.roll.clone(),
                warning_count: account.warning_count,
                locked_until: account.locked_until,
            });
        }
        Ok(warning)
    }

    /// Threshold check: when the counter has reached [`WARNING_THRESHOLD`],
    /// locks the account for [`AUTO_LOCK_HOURS`] and resets the counter.
    ///
    /// The check-reset-lock sequence runs inside one compare-and-swap update,
    /// so two racing violations cannot both observe a pre-threshold counter.
    /// Returns the account after the check and the lock record when one was
    /// written. The only automatic account-level transition.
    pub fn evaluate(
        &self,
        roll: &str,
        issuer_roll: &str,
    ) -> Result<(StudentAccount, Option<LockRecord>), ModerationError> {
        let now = Utc::now();
        let until = now + Duration::hours(AUTO_LOCK_HOURS);
        let mut tripped = false;
        let account = self.store.update_account(roll, |acc| {
            // The closure re-runs on CAS conflict; recompute from scratch.
            tripped = false;
            if acc.warning_count >= WARNING_THRESHOLD {
                acc.warning_count = 0;
                acc.locked_until = Some(until);
                tripped = true;
            }
        })?;

        if !tripped {
            return Ok((account, None));
        }

        let record = LockRecord {
            id: Uuid::new_v4(),
            roll: roll.to_string(),
            reason: AUTO_LOCK_REASON.to_string(),
            locked_by: issuer_roll.to_string(),
            expires_at: until,
            created_at: now,
        };
        self.store.insert_lock(&record)?;
        self.mirror_set(
            &account_lock_key(roll),
            AUTO_LOCK_REASON,
            Duration::hours(AUTO_LOCK_HOURS),
        );
        tracing::warn!(roll, until = %until, "warning threshold reached, account auto-locked");
        self.notifier.publish(ModerationEvent::StudentLocked {
            roll: roll.to_string(),
            reason: AUTO_LOCK_REASON.to_string(),
            expires_at: until,
        });
        Ok((account, Some(record)))
    }

    // ------------------------------------------------------------------
    // Explicit admin transitions
    // ------------------------------------------------------------------

    /// Explicit account lock for `duration_secs` in `[1, MAX_LOCK_SECS]`.
    /// Allowed from any state; overwrites a prior expiry.
    pub fn lock(
        &self,
        roll: &str,
        reason: &str,
        duration_secs: u64,
        issuer_roll: &str,
    ) -> Result<LockRecord, ModerationError> {
        if duration_secs == 0 || duration_secs > MAX_LOCK_SECS {
            return Err(ModerationError::Validation(format!(
                "lock duration must be between 1 and {} seconds",
                MAX_LOCK_SECS
            )));
        }
        if reason.trim().is_empty() {
            return Err(ModerationError::Validation("reason is required".to_string()));
        }

        let now = Utc::now();
        let until = now + Duration::seconds(duration_secs as i64);
        self.store
            .update_account(roll, |acc| acc.locked_until = Some(until))?;

        let record = LockRecord {
            id: Uuid::new_v4(),
            roll: roll.to_string(),
            reason: reason.to_string(),
            locked_by: issuer_roll.to_string(),
            expires_at: until,
            created_at: now,
        };
        self.store.insert_lock(&record)?;
        self.mirror_set(
            &account_lock_key(roll),
            reason,
            Duration::seconds(duration_secs as i64),
        );
        tracing::info!(roll, until = %until, issuer = issuer_roll, "account locked");
        self.notifier.publish(ModerationEvent::StudentLocked {
            roll: roll.to_string(),
            reason: reason.to_string(),
            expires_at: until,
        });
        Ok(record)
    }

    /// Transition to active: clears the account gate, resets the counter,
    /// appends a "manual-unlock" audit row with expiry = now, and clears the
    /// cache mirror. Allowed from any state — unlocking an already-active
    /// account is a no-op for the subject but still leaves the audit row.
    pub fn unlock(&self, roll: &str, issuer_roll: &str) -> Result<LockRecord, ModerationError> {
        let now = Utc::now();
        self.store.update_account(roll, |acc| {
            acc.locked_until = None;
            acc.warning_count = 0;
        })?;

        let record = LockRecord {
            id: Uuid::new_v4(),
            roll: roll.to_string(),
            reason: MANUAL_UNLOCK_REASON.to_string(),
            locked_by: issuer_roll.to_string(),
            expires_at: now,
            created_at: now,
        };
        self.store.insert_lock(&record)?;
        self.mirror_delete(&account_lock_key(roll));
        tracing::info!(roll, issuer = issuer_roll, "account unlocked");
        self.notifier.publish(ModerationEvent::StudentUnlocked {
            roll: roll.to_string(),
            by: issuer_roll.to_string(),
        });
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Global lock
    // ------------------------------------------------------------------

    /// Administrative "lock everyone": sets every account's gate one year out
    /// and raises the global cache flag the gate short-circuits on. Racing
    /// calls are last-write-wins by design. Returns accounts touched.
    pub fn global_lock(&self) -> Result<usize, ModerationError> {
        let until = Utc::now() + Duration::days(GLOBAL_LOCK_DAYS);
        let touched = self
            .store
            .for_each_account(|acc| acc.locked_until = Some(until))?;
        self.mirror_set(GLOBAL_LOCK_KEY, "1", Duration::days(GLOBAL_LOCK_DAYS));
        tracing::warn!(accounts = touched, "global chat lock engaged");
        self.notifier.publish(ModerationEvent::ChatLocked);
        Ok(touched)
    }

    /// Releases the global lock: clears every account's gate and the global
    /// cache flag. Returns accounts touched.
    pub fn global_unlock(&self) -> Result<usize, ModerationError> {
        let touched = self.store.for_each_account(|acc| acc.locked_until = None)?;
        self.mirror_delete(GLOBAL_LOCK_KEY);
        tracing::info!(accounts = touched, "global chat lock released");
        self.notifier.publish(ModerationEvent::ChatUnlocked);
        Ok(touched)
    }

    // ------------------------------------------------------------------
    // Cache mirror (best-effort by contract)
    // ------------------------------------------------------------------

    fn mirror_set(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.cache.set(key, value, ttl) {
            tracing::warn!(key, "lock cache mirror write skipped: {}", e);
        }
    }

    fn mirror_delete(&self, key: &str) {
        if let Err(e) = self.cache.delete(key) {
            tracing::warn!(key, "lock cache mirror delete skipped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, ModerationEngine, Arc<ModerationStore>, Arc<LockCache>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModerationStore::open_path(dir.path()).unwrap());
        let cache = Arc::new(LockCache::new());
        store
            .put_account(&StudentAccount::new("22CS101", "Asha"))
            .unwrap();
        let engine = ModerationEngine::new(Arc::clone(&store), Arc::clone(&cache), Notifier::new(64));
        (dir, engine, store, cache)
    }

    #[test]
    fn third_warning_auto_locks_and_resets_counter() {
        // Two warnings on file, then one more low-severity violation.
        let (_dir, engine, store, cache) = setup();
        engine
            .record_violation("22CS101", "off-topic", Severity::Low, "admin1", None)
            .unwrap();
        engine
            .record_violation("22CS101", "off-topic again", Severity::Low, "admin1", None)
            .unwrap();
        let acc = store.get_account("22CS101").unwrap().unwrap();
        assert_eq!(acc.warning_count, 2);
        assert!(acc.locked_until.is_none());

        let before = Utc::now();
        engine
            .record_violation("22CS101", "spamming", Severity::Low, "admin1", None)
            .unwrap();

        let acc = store.get_account("22CS101").unwrap().unwrap();
        assert_eq!(acc.warning_count, 0);
        let until = acc.locked_until.unwrap();
        assert!(until > before + Duration::hours(AUTO_LOCK_HOURS - 1));

        let lock = store
            .latest_active_lock("22CS101", Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(lock.reason, AUTO_LOCK_REASON);

        let mirrored = cache.get(&account_lock_key("22CS101")).unwrap();
        assert_eq!(mirrored.as_deref(), Some(AUTO_LOCK_REASON));
    }

    #[test]
    fn evaluate_below_threshold_is_a_no_op() {
        let (_dir, engine, store, _cache) = setup();
        engine
            .record_violation("22CS101", "off-topic", Severity::Low, "admin1", None)
            .unwrap();
        let (account, record) = engine.evaluate("22CS101", SYSTEM_ISSUER).unwrap();
        assert_eq!(account.warning_count, 1);
        assert!(record.is_none());
        assert!(store.locks_for_roll("22CS101").unwrap().is_empty());
    }

    #[test]
    fn lock_duration_boundaries() {
        let (_dir, engine, _store, _cache) = setup();
        assert!(matches!(
            engine.lock("22CS101", "test", 0, "admin1"),
            Err(ModerationError::Validation(_))
        ));
        assert!(matches!(
            engine.lock("22CS101", "test", MAX_LOCK_SECS + 1, "admin1"),
            Err(ModerationError::Validation(_))
        ));
        assert!(engine.lock("22CS101", "test", 1, "admin1").is_ok());
        assert!(engine.lock("22CS101", "test", MAX_LOCK_SECS, "admin1").is_ok());
    }

    #[test]
    fn invalid_lock_leaves_no_side_effects() {
        let (_dir, engine, store, cache) = setup();
        let _ = engine.lock("22CS101", "test", 0, "admin1");
        assert!(store.locks_for_roll("22CS101").unwrap().is_empty());
        assert!(cache.get(&account_lock_key("22CS101")).unwrap().is_none());
        let acc = store.get_account("22CS101").unwrap().unwrap();
        assert!(acc.locked_until.is_none());
    }

    #[test]
    fn lock_overwrites_prior_expiry() {
        let (_dir, engine, store, _cache) = setup();
        engine.lock("22CS101", "first", 3600, "admin1").unwrap();
        let first = store.get_account("22CS101").unwrap().unwrap().locked_until;
        engine.lock("22CS101", "second", 7200, "admin1").unwrap();
        let second = store.get_account("22CS101").unwrap().unwrap().locked_until;
        assert!(second.unwrap() > first.unwrap());
        // Both actions audited.
        assert_eq!(store.locks_for_roll("22CS101").unwrap().len(), 2);
    }

    #[test]
    fn unlock_is_idempotent_and_audited_each_time() {
        let (_dir, engine, store, cache) = setup();
        engine.lock("22CS101", "misuse", 3600, "admin1").unwrap();
        engine.unlock("22CS101", "admin1").unwrap();
        engine.unlock("22CS101", "admin1").unwrap();

        let acc = store.get_account("22CS101").unwrap().unwrap();
        assert!(acc.locked_until.is_none());
        assert_eq!(acc.warning_count, 0);
        assert!(cache.get(&account_lock_key("22CS101")).unwrap().is_none());

        let unlock_rows: Vec<_> = store
            .locks_for_roll("22CS101")
            .unwrap()
            .into_iter()
            .filter(|l| l.reason == MANUAL_UNLOCK_REASON)
            .collect();
        assert_eq!(unlock_rows.len(), 2);
    }

    #[test]
    fn unlock_resets_the_warning_counter() {
        let (_dir, engine, store, _cache) = setup();
        engine
            .record_violation("22CS101", "off-topic", Severity::Low, "admin1", None)
            .unwrap();
        engine
            .record_violation("22CS101", "off-topic", Severity::Low, "admin1", None)
            .unwrap();
        engine.unlock("22CS101", "admin1").unwrap();
        let acc = store.get_account("22CS101").unwrap().unwrap();
        assert_eq!(acc.warning_count, 0);
    }

    #[test]
    fn lock_succeeds_with_cache_offline() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModerationStore::open_path(dir.path()).unwrap());
        store
            .put_account(&StudentAccount::new("22CS101", "Asha"))
            .unwrap();
        let engine = ModerationEngine::new(
            Arc::clone(&store),
            Arc::new(LockCache::offline()),
            Notifier::new(8),
        );
        engine.lock("22CS101", "misuse", 3600, "admin1").unwrap();
        let acc = store.get_account("22CS101").unwrap().unwrap();
        assert!(acc.is_locked_at(Utc::now()));
    }

    #[test]
    fn global_lock_and_unlock_cover_every_account() {
        let (_dir, engine, store, cache) = setup();
        store.put_account(&StudentAccount::new("22CS102", "Ravi")).unwrap();

        let touched = engine.global_lock().unwrap();
        assert_eq!(touched, 2);
        assert_eq!(cache.get(GLOBAL_LOCK_KEY).unwrap().as_deref(), Some("1"));
        for roll in ["22CS101", "22CS102"] {
            assert!(store
                .get_account(roll)
                .unwrap()
                .unwrap()
                .is_locked_at(Utc::now()));
        }

        engine.global_unlock().unwrap();
        assert!(cache.get(GLOBAL_LOCK_KEY).unwrap().is_none());
        for roll in ["22CS101", "22CS102"] {
            assert!(!store
                .get_account(roll)
                .unwrap()
                .unwrap()
                .is_locked_at(Utc::now()));
        }
    }

    #[test]
    fn auto_lock_event_follows_the_durable_write() {
        let (_dir, engine, store, _cache) = setup();
        let notifier = Notifier::new(64);
        let mut rx = notifier.subscribe();
        let engine2 = ModerationEngine::new(
            Arc::clone(&store),
            Arc::new(LockCache::new()),
            notifier,
        );
        drop(engine);

        for _ in 0..3 {
            engine2
                .record_violation("22CS101", "off-topic", Severity::Low, "admin1", None)
                .unwrap();
        }
        // Lock record must already exist by the time the event is observed.
        let mut saw_locked = false;
        while let Ok(event) = rx.try_recv() {
            if let ModerationEvent::StudentLocked { roll, reason, .. } = event {
                assert_eq!(roll, "22CS101");
                assert_eq!(reason, AUTO_LOCK_REASON);
                saw_locked = true;
            }
        }
        assert!(saw_locked);
        assert!(store
            .latest_active_lock("22CS101", Utc::now())
            .unwrap()
            .is_some());
    }
}

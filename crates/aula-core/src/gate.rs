//! Authorization gate: "may this account perform this protected operation?"
//!
//! Check order, short-circuiting on the first denial:
//! 1. global lock flag (cache)
//! 2. authoritative account gate (`locked_until` on the store) — always
//!    consulted, never skipped for a cache hit
//! 3. per-account cache mirror — cross-process locks whose authoritative write
//!    may not be visible yet; consulted after step 2 so it can only add
//!    denials, never turn an authoritative "locked" into a stale allow
//! 4. chatbot restriction, for chatbot operations only
//! 5. allow
//!
//! Cache failures skip steps 1 and 3 (fail-open on the mirror alone); the
//! authoritative read in step 2 is mandatory, so a cache outage never lets a
//! genuinely locked account through and never fails the system closed.

use crate::cache::{account_lock_key, LockCache, GLOBAL_LOCK_KEY};
use crate::error::ModerationError;
use crate::store::ModerationStore;
use crate::types::{Decision, ProtectedOp};
use chrono::Utc;
use std::sync::Arc;

/// Fallback denial reason when no unexpired lock row carries one.
const ACCOUNT_LOCKED_REASON: &str = "account locked";

/// Fallback denial reason for a chatbot restriction without stored reason.
const CHATBOT_LOCKED_REASON: &str = "chatbot restricted";

/// Denial reason for the administrative global lock.
const GLOBAL_LOCK_REASON: &str = "global lock";

/// The check every protected route runs before its own logic.
pub struct AuthorizationGate {
    store: Arc<ModerationStore>,
    cache: Arc<LockCache>,
}

impl AuthorizationGate {
    pub fn new(store: Arc<ModerationStore>, cache: Arc<LockCache>) -> Self {
        Self { store, cache }
    }

    /// Resolves the decision for `roll` performing `op`. `Deny` is an expected
    /// outcome, not an error; `NotFound` fires only for an unknown roll.
    pub fn authorize(&self, roll: &str, op: ProtectedOp) -> Result<Decision, ModerationError> {
        let now = Utc::now();

        // 1. Global flag: cheapest check, gates every account at once.
        match self.cache.get(GLOBAL_LOCK_KEY) {
            Ok(Some(_)) => return Ok(Decision::deny(GLOBAL_LOCK_REASON, None)),
            Ok(None) => {}
            Err(e) => tracing::warn!("global lock check skipped: {}", e),
        }

        // 2. Authoritative account gate. Mandatory and synchronous.
        let account = self.store.require_account(roll)?;
        if let Some(until) = account.locked_until {
            if until > now {
                let reason = self
                    .store
                    .latest_active_lock(roll, now)?
                    .map(|l| l.reason)
                    .unwrap_or_else(|| ACCOUNT_LOCKED_REASON.to_string());
                return Ok(Decision::deny(reason, Some(until)));
            }
        }

        // 3. Cache mirror: adds denials for locks set cross-process ahead of
        //    the authoritative read. Skipped when the cache is down.
        match self.cache.get(&account_lock_key(roll)) {
            Ok(Some(reason)) => return Ok(Decision::deny(reason, None)),
            Ok(None) => {}
            Err(e) => tracing::warn!(roll, "account lock cache check skipped: {}", e),
        }

        // 4. Chatbot restriction applies to chatbot operations only.
        if op == ProtectedOp::Chatbot {
            if let Some(until) = account.chatbot_locked_until {
                if until > now {
                    let reason = if account.chatbot_lock_reason.is_empty() {
                        CHATBOT_LOCKED_REASON.to_string()
                    } else {
                        account.chatbot_lock_reason.clone()
                    };
                    return Ok(Decision::deny(reason, Some(until)));
                }
            }
        }

        Ok(Decision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ModerationEngine;
    use crate::notify::Notifier;
    use crate::types::{Severity, StudentAccount};
    use chrono::Duration;

    fn setup() -> (
        tempfile::TempDir,
        AuthorizationGate,
        ModerationEngine,
        Arc<ModerationStore>,
        Arc<LockCache>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModerationStore::open_path(dir.path()).unwrap());
        let cache = Arc::new(LockCache::new());
        store
            .put_account(&StudentAccount::new("22CS101", "Asha"))
            .unwrap();
        let gate = AuthorizationGate::new(Arc::clone(&store), Arc::clone(&cache));
        let engine = ModerationEngine::new(Arc::clone(&store), Arc::clone(&cache), Notifier::new(8));
        (dir, gate, engine, store, cache)
    }

    #[test]
    fn clean_account_is_allowed() {
        let (_dir, gate, _engine, _store, _cache) = setup();
        assert_eq!(
            gate.authorize("22CS101", ProtectedOp::Account).unwrap(),
            Decision::Allow
        );
        assert_eq!(
            gate.authorize("22CS101", ProtectedOp::Chatbot).unwrap(),
            Decision::Allow
        );
    }

    #[test]
    fn unknown_roll_is_not_found() {
        let (_dir, gate, _engine, _store, _cache) = setup();
        assert!(matches!(
            gate.authorize("ghost", ProtectedOp::Account),
            Err(ModerationError::NotFound("account"))
        ));
    }

    #[test]
    fn lock_then_authorize_round_trip() {
        let (_dir, gate, engine, _store, _cache) = setup();
        let before = Utc::now();
        engine.lock("22CS101", "spamming", 3600, "admin1").unwrap();

        match gate.authorize("22CS101", ProtectedOp::Account).unwrap() {
            Decision::Deny { reason, until } => {
                assert_eq!(reason, "spamming");
                let until = until.unwrap();
                // Expiry within clock-skew tolerance of now + 3600s.
                assert!(until >= before + Duration::seconds(3590));
                assert!(until <= Utc::now() + Duration::seconds(3610));
            }
            Decision::Allow => panic!("locked account was allowed"),
        }
    }

    #[test]
    fn account_lock_gates_chatbot_operations_too() {
        let (_dir, gate, engine, _store, _cache) = setup();
        engine.lock("22CS101", "misuse", 3600, "admin1").unwrap();
        assert!(!gate
            .authorize("22CS101", ProtectedOp::Chatbot)
            .unwrap()
            .is_allowed());
    }

    #[test]
    fn chatbot_restriction_leaves_account_operations_open() {
        let (_dir, gate, engine, _store, _cache) = setup();
        engine
            .record_violation("22CS101", "abusive prompt", Severity::High, "admin1", None)
            .unwrap();

        assert_eq!(
            gate.authorize("22CS101", ProtectedOp::Account).unwrap(),
            Decision::Allow
        );
        match gate.authorize("22CS101", ProtectedOp::Chatbot).unwrap() {
            Decision::Deny { reason, until } => {
                assert_eq!(reason, "abusive prompt");
                assert!(until.is_some());
            }
            Decision::Allow => panic!("restricted chatbot op was allowed"),
        }
    }

    #[test]
    fn cache_only_lock_still_denies() {
        // A lock set by another process whose store write we cannot see yet.
        let (_dir, gate, _engine, _store, cache) = setup();
        cache
            .set(&account_lock_key("22CS101"), "cross-instance", Duration::hours(1))
            .unwrap();
        match gate.authorize("22CS101", ProtectedOp::Account).unwrap() {
            Decision::Deny { reason, until } => {
                assert_eq!(reason, "cross-instance");
                assert!(until.is_none());
            }
            Decision::Allow => panic!("mirror-only lock ignored"),
        }
    }

    #[test]
    fn cache_outage_fails_open_on_the_mirror_only() {
        // The authoritative lock must hold with the cache down.
        let (_dir, _gate, engine, store, cache) = setup();
        engine.lock("22CS101", "misuse", 3600, "admin1").unwrap();
        cache.set_online(false);

        let gate = AuthorizationGate::new(Arc::clone(&store), Arc::clone(&cache));
        assert!(!gate
            .authorize("22CS101", ProtectedOp::Account)
            .unwrap()
            .is_allowed());

        // And a clean account proceeds despite the outage.
        store
            .put_account(&StudentAccount::new("22CS102", "Ravi"))
            .unwrap();
        assert_eq!(
            gate.authorize("22CS102", ProtectedOp::Account).unwrap(),
            Decision::Allow
        );
    }

    #[test]
    fn global_flag_denies_before_anything_else() {
        let (_dir, gate, engine, _store, _cache) = setup();
        engine.global_lock().unwrap();
        match gate.authorize("22CS101", ProtectedOp::Account).unwrap() {
            Decision::Deny { reason, .. } => assert_eq!(reason, "global lock"),
            Decision::Allow => panic!("global lock ignored"),
        }
    }

    #[test]
    fn expired_store_lock_reads_as_inactive() {
        let (_dir, gate, _engine, store, _cache) = setup();
        store
            .update_account("22CS101", |acc| {
                acc.locked_until = Some(Utc::now() - Duration::seconds(5));
            })
            .unwrap();
        assert_eq!(
            gate.authorize("22CS101", ProtectedOp::Account).unwrap(),
            Decision::Allow
        );
    }
}

//! Sled-backed authoritative store with one tree per moderation collection.
//!
//! The account document is the only shared mutable resource; `update_account`
//! wraps sled's `update_and_fetch`, a compare-and-swap retry loop, so
//! multi-field transitions (increment counter, check threshold, reset, set
//! lock expiry) are applied atomically per document. Two concurrent violations
//! can therefore never both observe the same counter value and skip the
//! threshold.
//!
//! Warnings, locks, and appeals are audit collections keyed by UUID; listings
//! scan the tree and filter by roll, newest first.

use crate::error::ModerationError;
use crate::types::{Appeal, LockRecord, StudentAccount, Warning};
use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use std::path::Path;
use uuid::Uuid;

const DEFAULT_PATH: &str = "./data/aula_moderation";

/// Tree names for the moderation collections.
const TREE_ACCOUNTS: &str = "accounts";
const TREE_WARNINGS: &str = "warnings";
const TREE_LOCKS: &str = "locks";
const TREE_APPEALS: &str = "appeals";

/// Durable source of truth for accounts, warnings, lock history, and appeals.
pub struct ModerationStore {
    #[allow(dead_code)]
    db: Db,
    accounts: Tree,
    warnings: Tree,
    locks: Tree,
    appeals: Tree,
}

impl ModerationStore {
    /// Opens or creates the store at `./data/aula_moderation`.
    pub fn new() -> Result<Self, ModerationError> {
        Self::open_path(DEFAULT_PATH)
    }

    /// Opens or creates the store at the given path.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, ModerationError> {
        let db = sled::open(path)?;
        let accounts = db.open_tree(TREE_ACCOUNTS)?;
        let warnings = db.open_tree(TREE_WARNINGS)?;
        let locks = db.open_tree(TREE_LOCKS)?;
        let appeals = db.open_tree(TREE_APPEALS)?;
        Ok(Self {
            db,
            accounts,
            warnings,
            locks,
            appeals,
        })
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Inserts or replaces an account document.
    pub fn put_account(&self, account: &StudentAccount) -> Result<(), ModerationError> {
        let bytes = serde_json::to_vec(account)?;
        self.accounts.insert(account.roll.as_bytes(), bytes)?;
        Ok(())
    }

    /// Fetches an account by roll.
    pub fn get_account(&self, roll: &str) -> Result<Option<StudentAccount>, ModerationError> {
        match self.accounts.get(roll.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetches an account or fails with `NotFound`.
    pub fn require_account(&self, roll: &str) -> Result<StudentAccount, ModerationError> {
        self.get_account(roll)?
            .ok_or(ModerationError::NotFound("account"))
    }

    /// Atomically mutates an account document and returns the updated value.
    ///
    /// The closure may run more than once: sled retries it on CAS conflict, so
    /// it must be a pure function of the value it is handed. Fails with
    /// `NotFound` when the roll does not exist. A stored value that no longer
    /// parses is left untouched and surfaced as a codec error.
    pub fn update_account<F>(&self, roll: &str, mut f: F) -> Result<StudentAccount, ModerationError>
    where
        F: FnMut(&mut StudentAccount),
    {
        let updated = self
            .accounts
            .update_and_fetch(roll.as_bytes(), |old| match old {
                None => None,
                Some(bytes) => match StudentAccount::from_bytes(bytes) {
                    Some(mut acc) => {
                        f(&mut acc);
                        Some(acc.to_bytes())
                    }
                    // Unparseable document: keep the bytes, report below.
                    None => Some(bytes.to_vec()),
                },
            })?;
        match updated {
            None => Err(ModerationError::NotFound("account")),
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }

    /// Applies a mutation to every account document (bulk lock/unlock).
    /// Returns the number of accounts touched.
    pub fn for_each_account<F>(&self, mut f: F) -> Result<usize, ModerationError>
    where
        F: FnMut(&mut StudentAccount),
    {
        let mut touched = 0usize;
        for item in self.accounts.iter() {
            let (key, bytes) = item?;
            let Some(mut acc) = StudentAccount::from_bytes(&bytes) else {
                continue;
            };
            f(&mut acc);
            self.accounts.insert(key, acc.to_bytes())?;
            touched += 1;
        }
        Ok(touched)
    }

    // ------------------------------------------------------------------
    // Warnings
    // ------------------------------------------------------------------

    /// Appends a warning to the ledger.
    pub fn insert_warning(&self, warning: &Warning) -> Result<(), ModerationError> {
        let bytes = serde_json::to_vec(warning)?;
        self.warnings.insert(warning.id.to_string().as_bytes(), bytes)?;
        Ok(())
    }

    /// Fetches a warning by id.
    pub fn get_warning(&self, id: Uuid) -> Result<Option<Warning>, ModerationError> {
        match self.warnings.get(id.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Deletes a warning by id. Returns the removed record, or `None` when the
    /// id did not exist.
    pub fn remove_warning(&self, id: Uuid) -> Result<Option<Warning>, ModerationError> {
        match self.warnings.remove(id.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All warnings against a roll, most recent first.
    pub fn warnings_for_roll(&self, roll: &str) -> Result<Vec<Warning>, ModerationError> {
        let mut out: Vec<Warning> = Vec::new();
        for item in self.warnings.iter() {
            let (_, bytes) = item?;
            if let Ok(w) = serde_json::from_slice::<Warning>(&bytes) {
                if w.roll == roll {
                    out.push(w);
                }
            }
        }
        out.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Lock history
    // ------------------------------------------------------------------

    /// Appends a lock record to the audit history.
    pub fn insert_lock(&self, lock: &LockRecord) -> Result<(), ModerationError> {
        let bytes = serde_json::to_vec(lock)?;
        self.locks.insert(lock.id.to_string().as_bytes(), bytes)?;
        Ok(())
    }

    /// Lock history for a roll, most recent first.
    pub fn locks_for_roll(&self, roll: &str) -> Result<Vec<LockRecord>, ModerationError> {
        let mut out: Vec<LockRecord> = Vec::new();
        for item in self.locks.iter() {
            let (_, bytes) = item?;
            if let Ok(l) = serde_json::from_slice::<LockRecord>(&bytes) {
                if l.roll == roll {
                    out.push(l);
                }
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// The most recent lock record that is still unexpired at `now`, if any.
    pub fn latest_active_lock(
        &self,
        roll: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, ModerationError> {
        Ok(self
            .locks_for_roll(roll)?
            .into_iter()
            .find(|l| l.is_active_at(now)))
    }

    // ------------------------------------------------------------------
    // Appeals
    // ------------------------------------------------------------------

    /// Inserts or replaces an appeal.
    pub fn put_appeal(&self, appeal: &Appeal) -> Result<(), ModerationError> {
        let bytes = serde_json::to_vec(appeal)?;
        self.appeals.insert(appeal.id.to_string().as_bytes(), bytes)?;
        Ok(())
    }

    /// Fetches an appeal by id.
    pub fn get_appeal(&self, id: Uuid) -> Result<Option<Appeal>, ModerationError> {
        match self.appeals.get(id.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All appeals, most recent first.
    pub fn list_appeals(&self) -> Result<Vec<Appeal>, ModerationError> {
        let mut out: Vec<Appeal> = Vec::new();
        for item in self.appeals.iter() {
            let (_, bytes) = item?;
            if let Ok(a) = serde_json::from_slice::<Appeal>(&bytes) {
                out.push(a);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }
}

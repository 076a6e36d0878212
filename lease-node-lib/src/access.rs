//! Node-side record of rotation messages received from the watchtower.

use blueprint_sdk::info;
use lease_runtime::error::Result;
use lease_runtime::store::{PersistentStore, state_dir};
use lease_runtime::util::now_ts;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::peers::{AccessGrant, AuthorityExchange};

/// How long an exchange without a following grant stays on record.
pub const EXCHANGE_TTL_SECS: u64 = 3600;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub auditor: String,
    pub token: String,
    pub received_at: u64,
    /// Set when this node received the grant itself (it is the auditor).
    #[serde(default)]
    pub grant: Option<AccessGrant>,
}

impl AccessRecord {
    /// Whether a received grant is still inside its dwell window.
    pub fn window_open(&self, now: u64) -> bool {
        self.grant.as_ref().is_some_and(|grant| {
            let granted_at = grant.granted_at.max(0) as u64;
            now < granted_at.saturating_add(grant.dwell_secs)
        })
    }

    pub fn is_stale(&self, now: u64) -> bool {
        match self.grant {
            Some(_) => !self.window_open(now),
            None => now >= self.received_at.saturating_add(EXCHANGE_TTL_SECS),
        }
    }
}

/// Persisted per-auditor records, keyed by auditor identity.
pub struct AccessLedger {
    store: PersistentStore<AccessRecord>,
}

impl AccessLedger {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            store: PersistentStore::open(path)?,
        })
    }

    /// Open `access.json` inside the state directory.
    pub fn open_default() -> Result<Self> {
        Self::open(state_dir().join("access.json"))
    }

    pub fn record_exchange(&self, message: &AuthorityExchange) -> Result<AccessRecord> {
        let now = now_ts();
        self.prune(now)?;
        let record = AccessRecord {
            auditor: message.auditor.clone(),
            token: message.token.clone(),
            received_at: now,
            grant: None,
        };
        self.store.insert(message.auditor.clone(), record.clone())?;
        Ok(record)
    }

    pub fn record_grant(&self, grant: &AccessGrant) -> Result<AccessRecord> {
        let now = now_ts();
        self.prune(now)?;
        let record = AccessRecord {
            auditor: grant.auditor.clone(),
            token: grant.token.clone(),
            received_at: now,
            grant: Some(grant.clone()),
        };
        self.store.insert(grant.auditor.clone(), record.clone())?;
        Ok(record)
    }

    pub fn get(&self, auditor: &str) -> Result<Option<AccessRecord>> {
        self.store.get(auditor)
    }

    pub fn records(&self) -> Result<Vec<AccessRecord>> {
        let mut records = self.store.values()?;
        records.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(records)
    }

    pub fn forget(&self, auditor: &str) -> Result<bool> {
        Ok(self.store.remove(auditor)?.is_some())
    }

    /// Drop records whose grant window has closed or whose exchange was
    /// never followed by a grant. Returns the number removed.
    pub fn prune(&self, now: u64) -> Result<usize> {
        let mut removed = 0;
        for record in self.store.values()? {
            if record.is_stale(now) && self.forget(&record.auditor)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("access-ledger: pruned {removed} stale records");
        }
        Ok(removed)
    }
}

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

pub use blueprint_sdk::stores::local_database::{Error as StoreError, LocalDatabase};

use crate::error::{LeaseError, Result};
use crate::lifecycle::SandboxKind;

impl From<StoreError> for LeaseError {
    fn from(err: StoreError) -> Self {
        LeaseError::Persistence(err.to_string())
    }
}

/// Resolve the state directory from `LEASE_STATE_DIR`, defaulting to
/// `./lease-state`.
///
/// Creates the directory with restrictive permissions (0o700) if it doesn't exist.
pub fn state_dir() -> PathBuf {
    let dir = std::env::var("LEASE_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("lease-state"));

    if !dir.exists() {
        std::fs::create_dir_all(&dir).ok();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }

    dir
}

/// Thin wrapper that bridges `LocalDatabase` to `LeaseError`.
pub struct PersistentStore<V> {
    db: LocalDatabase<V>,
}

impl<V> PersistentStore<V>
where
    V: Serialize + serde::de::DeserializeOwned + Clone,
{
    pub fn open(path: PathBuf) -> Result<Self> {
        let db = LocalDatabase::open(path)?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.db.get(key)?)
    }

    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.db.values()?)
    }

    pub fn insert(&self, key: String, value: V) -> Result<()> {
        Ok(self.db.set(&key, value)?)
    }

    pub fn remove(&self, key: &str) -> Result<Option<V>> {
        Ok(self.db.remove(key)?)
    }

    pub fn update<F>(&self, key: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut V),
    {
        Ok(self.db.update(key, f)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Allocation record
// ─────────────────────────────────────────────────────────────────────────────

const RECORD_KEY: &str = "allocation";

/// The single lease record of this node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Base64 of the renter public key as supplied at provisioning time.
    pub authorization_secret: String,
    pub kind: SandboxKind,
    pub created_at: u64,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl AllocationRecord {
    pub fn new(renter_key: &str, kind: SandboxKind) -> Self {
        Self {
            authorization_secret: STANDARD.encode(renter_key.as_bytes()),
            kind,
            created_at: crate::util::now_ts(),
            expires_at: None,
        }
    }

    /// Byte-exact, constant-time comparison against a caller-supplied key.
    pub fn matches(&self, renter_key: &str) -> Result<bool> {
        if self.authorization_secret.trim().is_empty() {
            return Err(LeaseError::Persistence("allocation record is empty".into()));
        }
        let stored = STANDARD
            .decode(self.authorization_secret.trim())
            .map_err(|err| LeaseError::Persistence(format!("corrupt allocation record: {err}")))?;
        Ok(bool::from(stored.as_slice().ct_eq(renter_key.as_bytes())))
    }
}

/// Persisted authorization record, stored under a single key.
pub struct AllocationStore {
    store: PersistentStore<AllocationRecord>,
}

impl AllocationStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            store: PersistentStore::open(path)?,
        })
    }

    /// Open `allocation.json` inside [`state_dir`].
    pub fn open_default() -> Result<Self> {
        Self::open(state_dir().join("allocation.json"))
    }

    pub fn load(&self) -> Result<Option<AllocationRecord>> {
        self.store.get(RECORD_KEY)
    }

    pub fn save(&self, record: AllocationRecord) -> Result<()> {
        self.store.insert(RECORD_KEY.to_string(), record)
    }

    /// Stamp the expiry of the current record. Returns false when no record exists.
    pub fn set_expiry(&self, expires_at: u64) -> Result<bool> {
        self.store
            .update(RECORD_KEY, |record| record.expires_at = Some(expires_at))
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(RECORD_KEY)?;
        Ok(())
    }

    /// Return the record if it exists and decodes to exactly `renter_key`.
    pub fn verify(&self, renter_key: &str) -> Result<AllocationRecord> {
        let record = self
            .load()?
            .ok_or_else(|| LeaseError::Persistence("no allocation record".into()))?;
        if !record.matches(renter_key)? {
            return Err(LeaseError::AuthMismatch(
                "renter key does not match the allocation record".into(),
            ));
        }
        Ok(record)
    }
}

//! Peer registry and transport used by the access rotation.
//!
//! The registry reports every known peer with its stake and endpoint plus
//! the identities currently holding a lease. The transport delivers the two
//! rotation messages: the authorization exchange (auditor to node) and the
//! access grant (to the auditor).

use lease_runtime::error::{LeaseError, Result};
use lease_runtime::http::{get_json, post_json};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const EXCHANGE_PATH: &str = "/api/rotation/exchange";
pub const GRANT_PATH: &str = "/api/rotation/grant";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub identity: String,
    pub stake: f64,
    /// Base URL of the peer's node API.
    pub endpoint: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub peers: Vec<Peer>,
    /// Identities currently holding a lease.
    #[serde(default)]
    pub leased: Vec<String>,
}

/// Sent to each eligible node: trust this auditor for the coming window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityExchange {
    pub auditor: String,
    pub token: String,
}

/// Sent to the auditor once nodes have accepted the exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub auditor: String,
    pub token: String,
    pub peers: Vec<String>,
    pub granted_at: i64,
    pub dwell_secs: u64,
}

#[async_trait::async_trait]
pub trait PeerRegistry: Send + Sync {
    async fn snapshot(&self) -> Result<PeerSnapshot>;
}

#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn exchange_authorization(&self, peer: &Peer, message: &AuthorityExchange) -> Result<()>;

    async fn grant_access(&self, auditor: &Peer, grant: &AccessGrant) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// Reads a [`PeerSnapshot`] JSON document from a URL.
pub struct HttpPeerRegistry {
    pub url: String,
    pub timeout: Duration,
}

#[async_trait::async_trait]
impl PeerRegistry for HttpPeerRegistry {
    async fn snapshot(&self) -> Result<PeerSnapshot> {
        let value = get_json(&self.url, "", self.timeout).await?;
        serde_json::from_value(value)
            .map_err(|err| LeaseError::Transport(format!("Invalid peer snapshot: {err}")))
    }
}

/// Posts rotation messages to peer node APIs, authenticating with the
/// shared node API token when one is set.
pub struct HttpPeerTransport {
    pub timeout: Duration,
    pub auth_token: Option<String>,
}

#[async_trait::async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn exchange_authorization(&self, peer: &Peer, message: &AuthorityExchange) -> Result<()> {
        let payload = serde_json::to_value(message)
            .map_err(|err| LeaseError::Validation(format!("exchange payload: {err}")))?;
        post_json(
            &peer.endpoint,
            EXCHANGE_PATH,
            payload,
            self.auth_token.as_deref(),
            self.timeout,
        ).await?;
        Ok(())
    }

    async fn grant_access(&self, auditor: &Peer, grant: &AccessGrant) -> Result<()> {
        let payload = serde_json::to_value(grant)
            .map_err(|err| LeaseError::Validation(format!("grant payload: {err}")))?;
        post_json(
            &auditor.endpoint,
            GRANT_PATH,
            payload,
            self.auth_token.as_deref(),
            self.timeout,
        ).await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct MockPeerRegistry {
        pub snapshot: Mutex<PeerSnapshot>,
        pub should_fail: AtomicBool,
    }

    impl MockPeerRegistry {
        pub fn new(snapshot: PeerSnapshot) -> Self {
            Self {
                snapshot: Mutex::new(snapshot),
                should_fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl PeerRegistry for MockPeerRegistry {
        async fn snapshot(&self) -> Result<PeerSnapshot> {
            if self.should_fail.load(Ordering::Relaxed) {
                return Err(LeaseError::Transport("mock registry failure".into()));
            }
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }

    /// Records every delivery attempt. Identities listed in `unreachable`
    /// time out on exchange; auditors listed in `refuse_grant` time out on
    /// grant.
    #[derive(Default)]
    pub struct MockPeerTransport {
        pub exchanges: Mutex<Vec<(String, AuthorityExchange)>>,
        pub grants: Mutex<Vec<(String, AccessGrant)>>,
        pub unreachable: Mutex<Vec<String>>,
        pub refuse_grant: Mutex<Vec<String>>,
        /// Fail the first N attempts per identity, then succeed.
        pub flaky: Mutex<HashMap<String, u32>>,
    }

    impl MockPeerTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn unreachable(self, identity: &str) -> Self {
            self.unreachable.lock().unwrap().push(identity.to_string());
            self
        }

        pub fn refusing_grant(self, identity: &str) -> Self {
            self.refuse_grant.lock().unwrap().push(identity.to_string());
            self
        }

        pub fn flaky(self, identity: &str, failures: u32) -> Self {
            self.flaky
                .lock()
                .unwrap()
                .insert(identity.to_string(), failures);
            self
        }

        pub fn exchange_attempts(&self, identity: &str) -> usize {
            self.exchanges
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == identity)
                .count()
        }

        pub fn grant_attempts(&self, identity: &str) -> usize {
            self.grants
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == identity)
                .count()
        }

        fn take_flaky(&self, identity: &str) -> bool {
            let mut flaky = self.flaky.lock().unwrap();
            match flaky.get_mut(identity) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        }
    }

    #[async_trait::async_trait]
    impl PeerTransport for MockPeerTransport {
        async fn exchange_authorization(
            &self,
            peer: &Peer,
            message: &AuthorityExchange,
        ) -> Result<()> {
            self.exchanges
                .lock()
                .unwrap()
                .push((peer.identity.clone(), message.clone()));
            if self.unreachable.lock().unwrap().contains(&peer.identity)
                || self.take_flaky(&peer.identity)
            {
                return Err(LeaseError::TransportTimeout(format!(
                    "{} did not answer",
                    peer.identity
                )));
            }
            Ok(())
        }

        async fn grant_access(&self, auditor: &Peer, grant: &AccessGrant) -> Result<()> {
            self.grants
                .lock()
                .unwrap()
                .push((auditor.identity.clone(), grant.clone()));
            if self.refuse_grant.lock().unwrap().contains(&auditor.identity)
                || self.take_flaky(&auditor.identity)
            {
                return Err(LeaseError::TransportTimeout(format!(
                    "{} did not accept the grant",
                    auditor.identity
                )));
            }
            Ok(())
        }
    }
}

//! Auditor access rotation.
//!
//! One cycle: compute the eligible set, then for each auditor in registry
//! order handshake with every candidate node, grant the auditor access to the
//! nodes that accepted, and dwell. A failed grant skips the dwell. The loop
//! pauses between cycles and stops when the shutdown signal flips to `true`.

use blueprint_sdk::{error, info, warn};
use chrono::{DateTime, Utc};
use lease_runtime::error::{LeaseError, Result};
use lease_runtime::util::generate_token;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::peers::{AccessGrant, AuthorityExchange, Peer, PeerRegistry, PeerSnapshot, PeerTransport};
use crate::retry::{RetryPolicy, retry};

pub const DEFAULT_STAKE_THRESHOLD: f64 = 10_000.0;

#[derive(Clone, Debug, PartialEq)]
pub struct RotationConfig {
    /// Peers with stake strictly above this are auditors.
    pub stake_threshold: f64,
    pub handshake: RetryPolicy,
    pub grant: RetryPolicy,
    pub dwell: Duration,
    pub cycle_pause: Duration,
    /// Upper bound on each exchange or grant round-trip.
    pub call_timeout: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            stake_threshold: DEFAULT_STAKE_THRESHOLD,
            handshake: RetryPolicy::new(3, Duration::from_secs(3)),
            grant: RetryPolicy::new(3, Duration::from_secs(10)),
            dwell: Duration::from_secs(300),
            cycle_pause: Duration::from_secs(100),
            call_timeout: Duration::from_secs(lease_runtime::DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl RotationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        Self {
            stake_threshold: std::env::var("WATCHTOWER_STAKE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(defaults.stake_threshold),
            handshake: defaults.handshake,
            grant: defaults.grant,
            dwell: secs("WATCHTOWER_DWELL_SECS", defaults.dwell),
            cycle_pause: secs("WATCHTOWER_CYCLE_PAUSE_SECS", defaults.cycle_pause),
            call_timeout: secs("WATCHTOWER_CALL_TIMEOUT_SECS", defaults.call_timeout),
        }
    }
}

/// The access window currently held by one auditor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessWindow {
    pub auditor: String,
    pub token: String,
    pub granted_at: DateTime<Utc>,
    pub dwell: Duration,
    pub peers: Vec<String>,
}

impl AccessWindow {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.dwell) {
            Ok(dwell) => now < self.granted_at + dwell,
            Err(_) => true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EligibleSet {
    pub auditors: Vec<Peer>,
    pub candidates: Vec<Peer>,
}

/// Split a snapshot into auditors and candidate nodes. Candidates exclude
/// auditors, leased peers and peers inside `open_window`.
pub fn eligible_set(
    snapshot: &PeerSnapshot,
    stake_threshold: f64,
    open_window: Option<&AccessWindow>,
) -> EligibleSet {
    let (auditors, others): (Vec<Peer>, Vec<Peer>) = snapshot
        .peers
        .iter()
        .cloned()
        .partition(|peer| peer.stake > stake_threshold);

    let candidates = others
        .into_iter()
        .filter(|peer| !snapshot.leased.contains(&peer.identity))
        .filter(|peer| open_window.is_none_or(|w| !w.peers.contains(&peer.identity)))
        .collect();

    EligibleSet {
        auditors,
        candidates,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub auditors: usize,
    pub candidates: usize,
    /// Auditors that received a grant, in order.
    pub granted: Vec<String>,
    /// Auditors whose grant failed after every attempt.
    pub abandoned: Vec<String>,
    /// `(auditor, peer)` handshakes that failed after every attempt.
    pub unreachable: Vec<(String, String)>,
    pub cancelled: bool,
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn with_timeout<F>(timeout: Duration, what: &str, call: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(LeaseError::TransportTimeout(format!(
            "{what} did not complete within {}s",
            timeout.as_secs()
        ))),
    }
}

pub struct AccessRotation {
    config: RotationConfig,
    registry: Arc<dyn PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    clock: Arc<dyn Clock>,
    window: Mutex<Option<AccessWindow>>,
}

impl AccessRotation {
    pub fn new(
        config: RotationConfig,
        registry: Arc<dyn PeerRegistry>,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            clock,
            window: Mutex::new(None),
        }
    }

    pub fn current_window(&self) -> Option<AccessWindow> {
        self.window.lock().ok().and_then(|w| w.clone())
    }

    fn set_window(&self, window: Option<AccessWindow>) {
        if let Ok(mut current) = self.window.lock() {
            *current = window;
        }
    }

    /// Sleep on the injected clock. Returns false if shutdown won.
    async fn sleep_or_shutdown(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => false,
            _ = self.clock.sleep(duration) => true,
        }
    }

    async fn handshake(&self, auditor: &Peer, peer: &Peer, message: &AuthorityExchange) -> Result<()> {
        let transport = self.transport.as_ref();
        let timeout = self.config.call_timeout;
        let label = format!("rotation: handshake {} -> {}", auditor.identity, peer.identity);
        retry(self.config.handshake, self.clock.as_ref(), &label, move |_| {
            with_timeout(timeout, "authorization exchange", transport.exchange_authorization(peer, message))
        })
        .await
    }

    async fn grant(&self, auditor: &Peer, grant: &AccessGrant) -> Result<()> {
        let transport = self.transport.as_ref();
        let timeout = self.config.call_timeout;
        let label = format!("rotation: grant to {}", auditor.identity);
        retry(self.config.grant, self.clock.as_ref(), &label, move |_| {
            with_timeout(timeout, "access grant", transport.grant_access(auditor, grant))
        })
        .await
    }

    /// Drive one rotation across every auditor.
    pub async fn run_cycle(&self, shutdown: &mut watch::Receiver<bool>) -> Result<CycleReport> {
        let snapshot = self.registry.snapshot().await?;
        let now = self.clock.now();
        let open_window = self.current_window().filter(|w| w.is_open(now));
        if open_window.is_none() {
            self.set_window(None);
        }
        let eligible = eligible_set(&snapshot, self.config.stake_threshold, open_window.as_ref());

        let mut report = CycleReport {
            auditors: eligible.auditors.len(),
            candidates: eligible.candidates.len(),
            ..Default::default()
        };
        info!(
            "rotation: cycle start ({} auditors, {} candidate nodes, {} leased)",
            report.auditors,
            report.candidates,
            snapshot.leased.len()
        );

        for auditor in &eligible.auditors {
            if stop_requested(shutdown) {
                report.cancelled = true;
                break;
            }

            let exchange = AuthorityExchange {
                auditor: auditor.identity.clone(),
                token: generate_token(),
            };
            let mut accepted = Vec::with_capacity(eligible.candidates.len());
            for peer in &eligible.candidates {
                match self.handshake(auditor, peer, &exchange).await {
                    Ok(()) => accepted.push(peer.identity.clone()),
                    Err(_) => {
                        report
                            .unreachable
                            .push((auditor.identity.clone(), peer.identity.clone()));
                    }
                }
            }

            if stop_requested(shutdown) {
                report.cancelled = true;
                break;
            }

            let granted_at = self.clock.now();
            let grant = AccessGrant {
                auditor: auditor.identity.clone(),
                token: exchange.token.clone(),
                peers: accepted,
                granted_at: granted_at.timestamp(),
                dwell_secs: self.config.dwell.as_secs(),
            };
            if self.grant(auditor, &grant).await.is_err() {
                warn!(
                    "rotation: abandoning auditor {} for this cycle",
                    auditor.identity
                );
                report.abandoned.push(auditor.identity.clone());
                continue;
            }

            info!(
                "rotation: auditor {} holds access to {} nodes for {}s",
                auditor.identity,
                grant.peers.len(),
                self.config.dwell.as_secs()
            );
            self.set_window(Some(AccessWindow {
                auditor: auditor.identity.clone(),
                token: grant.token,
                granted_at,
                dwell: self.config.dwell,
                peers: grant.peers,
            }));
            report.granted.push(auditor.identity.clone());

            if !self.sleep_or_shutdown(self.config.dwell, shutdown).await {
                report.cancelled = true;
                break;
            }
            self.set_window(None);
        }

        Ok(report)
    }

    /// Perpetual loop: cycle, pause, repeat until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "rotation: starting (stake threshold {}, dwell {}s, pause {}s)",
            self.config.stake_threshold,
            self.config.dwell.as_secs(),
            self.config.cycle_pause.as_secs()
        );
        loop {
            if stop_requested(&shutdown) {
                break;
            }
            match self.run_cycle(&mut shutdown).await {
                Ok(report) => {
                    info!(
                        "rotation: cycle done (granted {}, abandoned {}, unreachable {})",
                        report.granted.len(),
                        report.abandoned.len(),
                        report.unreachable.len()
                    );
                    if report.cancelled {
                        break;
                    }
                }
                Err(err) => error!("rotation: cycle failed: {err}"),
            }
            if !self
                .sleep_or_shutdown(self.config.cycle_pause, &mut shutdown)
                .await
            {
                break;
            }
        }
        info!("rotation: stopped");
    }
}

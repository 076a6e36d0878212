//! Sandbox lifecycle controller.
//!
//! Exactly two instance kinds exist, production and test, each under a fixed
//! container name taken from [`LifecycleConfig`]. Termination always targets
//! the test instance first when one exists.

use blueprint_sdk::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::{parse_renter_key, seal_for_renter};
use crate::error::{LeaseError, Result};
use crate::runtime::{ContainerRuntime, InstanceSummary, LaunchRequest, SandboxState};
use crate::store::{AllocationRecord, AllocationStore};
use crate::{DEFAULT_PRODUCTION_NAME, DEFAULT_SSH_USERNAME, DEFAULT_TEST_NAME};

const PASSWORD_LEN: usize = 16;
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Starts sshd after installing the renter key, login password and optional setup script.
const BOOTSTRAP_SCRIPT: &str = r#"set -e
echo "root:${LEASE_ROOT_PASSWORD}" | chpasswd
mkdir -p /root/.ssh
printf '%s\n' "${LEASE_SSH_KEY}" > /root/.ssh/authorized_keys
chmod 700 /root/.ssh && chmod 600 /root/.ssh/authorized_keys
if [ -n "${LEASE_SETUP_SCRIPT}" ]; then sh -c "${LEASE_SETUP_SCRIPT}"; fi
mkdir -p /run/sshd
exec /usr/sbin/sshd -D"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    Production,
    Test,
}

/// GPU request: every visible device, or an explicit count (0 = none).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGpuCapacity", into = "RawGpuCapacity")]
pub enum GpuCapacity {
    All,
    Count(u32),
}

impl Default for GpuCapacity {
    fn default() -> Self {
        GpuCapacity::Count(0)
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawGpuCapacity {
    Count(u32),
    Text(String),
}

impl TryFrom<RawGpuCapacity> for GpuCapacity {
    type Error = String;

    fn try_from(raw: RawGpuCapacity) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawGpuCapacity::Count(n) => Ok(GpuCapacity::Count(n)),
            RawGpuCapacity::Text(text) => {
                let text = text.trim();
                if text.eq_ignore_ascii_case("all") {
                    Ok(GpuCapacity::All)
                } else if text.is_empty() {
                    Ok(GpuCapacity::Count(0))
                } else {
                    text.parse::<u32>()
                        .map(GpuCapacity::Count)
                        .map_err(|_| format!("invalid gpu capacity '{text}'"))
                }
            }
        }
    }
}

impl From<GpuCapacity> for RawGpuCapacity {
    fn from(capacity: GpuCapacity) -> Self {
        match capacity {
            GpuCapacity::All => RawGpuCapacity::Text("all".into()),
            GpuCapacity::Count(n) => RawGpuCapacity::Count(n),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuAssignment {
    /// Docker cpuset string, e.g. `"0"` or `"0-3"`.
    pub assignment: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub capacity: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSpec {
    pub capacity: GpuCapacity,
}

/// Normalized resources handed to the runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu: CpuAssignment,
    pub ram: Capacity,
    pub hard_disk: Capacity,
    pub gpu: GpuSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub base_image: String,
    #[serde(default)]
    pub volume_path: String,
    pub ssh_key: String,
    pub ssh_port: u16,
    /// Shell script run inside the sandbox before sshd starts.
    #[serde(default)]
    pub dockerfile: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// Login details sealed to the renter key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginInfo {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub version: String,
}

#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    pub production_name: String,
    pub test_name: String,
    pub ssh_username: String,
    pub docker_host: Option<String>,
    pub pull_image: bool,
    /// Apply `hard_disk` as a per-container storage size (needs a quota-capable driver).
    pub enforce_disk_quota: bool,
    pub volume_target: String,
    /// How long terminate waits for a signalled instance before forcing removal.
    pub stop_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            production_name: DEFAULT_PRODUCTION_NAME.to_string(),
            test_name: DEFAULT_TEST_NAME.to_string(),
            ssh_username: DEFAULT_SSH_USERNAME.to_string(),
            docker_host: None,
            pull_image: true,
            enforce_disk_quota: false,
            volume_target: "/data".to_string(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl LifecycleConfig {
    /// Load from environment variables, falling back to [`Default`] per field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            production_name: env::var("LEASE_PRODUCTION_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.production_name),
            test_name: env::var("LEASE_TEST_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.test_name),
            ssh_username: env::var("LEASE_SSH_USERNAME").unwrap_or(defaults.ssh_username),
            docker_host: env::var("DOCKER_HOST").ok(),
            pull_image: env::var("LEASE_PULL_IMAGE")
                .ok()
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(defaults.pull_image),
            enforce_disk_quota: env::var("LEASE_DISK_QUOTA")
                .ok()
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(defaults.enforce_disk_quota),
            volume_target: env::var("LEASE_VOLUME_TARGET").unwrap_or(defaults.volume_target),
            stop_timeout: env::var("LEASE_STOP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_timeout),
        }
    }

    pub fn name_for(&self, kind: SandboxKind) -> &str {
        match kind {
            SandboxKind::Production => &self.production_name,
            SandboxKind::Test => &self.test_name,
        }
    }
}

pub struct LifecycleController {
    config: LifecycleConfig,
    runtime: Arc<dyn ContainerRuntime>,
    records: AllocationStore,
}

impl LifecycleController {
    pub fn new(
        config: LifecycleConfig,
        runtime: Arc<dyn ContainerRuntime>,
        records: AllocationStore,
    ) -> Self {
        Self {
            config,
            runtime,
            records,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn records(&self) -> &AllocationStore {
        &self.records
    }

    fn find<'a>(&self, instances: &'a [InstanceSummary], kind: SandboxKind) -> Option<&'a InstanceSummary> {
        let name = self.config.name_for(kind);
        instances.iter().find(|i| i.name == name)
    }

    // ── provision ───────────────────────────────────────────────────────────

    /// Start one instance of the requested kind, replacing any instance of the
    /// same kind, and return the login info sealed to `renter_key`.
    pub async fn try_provision(
        &self,
        resources: &ResourceSpec,
        renter_key: &str,
        spec: &SandboxSpec,
        is_test: bool,
    ) -> Result<String> {
        parse_renter_key(renter_key)?;
        if spec.base_image.trim().is_empty() {
            return Err(LeaseError::Validation("base_image is required".into()));
        }

        let kind = if is_test {
            SandboxKind::Test
        } else {
            SandboxKind::Production
        };
        let name = self.config.name_for(kind).to_string();

        let instances = self.runtime.list().await?;
        if self.find(&instances, kind).is_some() {
            info!("lifecycle: replacing existing {kind:?} instance {name}");
            self.runtime.remove(&name).await?;
        }

        let password = crate::util::generate_password(PASSWORD_LEN);
        let request = LaunchRequest {
            name: name.clone(),
            image: spec.base_image.clone(),
            cpuset: resources.cpu.assignment.clone(),
            memory_bytes: resources.ram.capacity,
            disk_bytes: if self.config.enforce_disk_quota {
                resources.hard_disk.capacity
            } else {
                0
            },
            gpu: resources.gpu.capacity,
            ssh_port: spec.ssh_port,
            volume: (!spec.volume_path.trim().is_empty())
                .then(|| (spec.volume_path.clone(), self.config.volume_target.clone())),
            env: vec![
                format!("LEASE_ROOT_PASSWORD={password}"),
                format!("LEASE_SSH_KEY={}", spec.ssh_key),
                format!("LEASE_SETUP_SCRIPT={}", spec.dockerfile),
            ],
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                BOOTSTRAP_SCRIPT.to_string(),
            ],
        };
        self.runtime.launch(&request).await?;
        self.ensure_running(kind).await?;

        let login = LoginInfo {
            username: self.config.ssh_username.clone(),
            password,
            port: spec.ssh_port,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let plaintext = serde_json::to_vec(&login)
            .map_err(|err| LeaseError::Validation(format!("login info: {err}")))?;
        let sealed = seal_for_renter(renter_key, &plaintext)?;

        self.records.save(AllocationRecord::new(renter_key, kind))?;
        info!(
            "lifecycle: provisioned {kind:?} instance {name} (cpuset={}, ssh_port={})",
            resources.cpu.assignment, spec.ssh_port
        );
        Ok(sealed)
    }

    /// An image missing the bootstrap tools exits straight away; catch that
    /// before the lease is recorded.
    async fn ensure_running(&self, kind: SandboxKind) -> Result<()> {
        let name = self.config.name_for(kind);
        let instances = self.runtime.list().await?;
        match self.find(&instances, kind).map(|i| i.state) {
            Some(SandboxState::Running) => Ok(()),
            state => {
                if let Err(err) = self.runtime.remove(name).await {
                    warn!("lifecycle: failed to remove dead instance {name}: {err}");
                }
                Err(LeaseError::ResourceUnavailable(format!(
                    "{name} did not stay running after launch ({state:?})"
                )))
            }
        }
    }

    pub async fn provision(
        &self,
        resources: &ResourceSpec,
        renter_key: &str,
        spec: &SandboxSpec,
        is_test: bool,
    ) -> ProvisionResponse {
        match self.try_provision(resources, renter_key, spec, is_test).await {
            Ok(info) => ProvisionResponse {
                status: true,
                info: Some(info),
            },
            Err(err) => {
                warn!("lifecycle: provision failed: {err}");
                ProvisionResponse::default()
            }
        }
    }

    // ── inspect ─────────────────────────────────────────────────────────────

    pub async fn try_inspect(&self) -> Result<bool> {
        let instances = self.runtime.list().await?;
        Ok([SandboxKind::Test, SandboxKind::Production]
            .into_iter()
            .filter_map(|kind| self.find(&instances, kind))
            .any(|i| i.state == SandboxState::Running))
    }

    /// True iff either instance kind is running. Enumeration failures read as false.
    pub async fn inspect(&self) -> bool {
        match self.try_inspect().await {
            Ok(running) => running,
            Err(err) => {
                warn!("lifecycle: inspect failed: {err}");
                false
            }
        }
    }

    // ── pause / resume ──────────────────────────────────────────────────────

    async fn transition(
        &self,
        authorization_secret: &str,
        from: SandboxState,
        pause: bool,
    ) -> Result<()> {
        let record = self.records.verify(authorization_secret)?;
        let name = self.config.name_for(record.kind);
        let instances = self.runtime.list().await?;
        match self.find(&instances, record.kind) {
            Some(instance) if instance.state == from => {}
            Some(instance) => {
                return Err(LeaseError::ResourceUnavailable(format!(
                    "{name} is {:?}, expected {from:?}",
                    instance.state
                )));
            }
            None => {
                return Err(LeaseError::ResourceUnavailable(format!("{name} not found")));
            }
        }
        if pause {
            self.runtime.pause(name).await
        } else {
            self.runtime.unpause(name).await
        }
    }

    pub async fn try_pause(&self, authorization_secret: &str) -> Result<()> {
        self.transition(authorization_secret, SandboxState::Running, true)
            .await
    }

    pub async fn try_resume(&self, authorization_secret: &str) -> Result<()> {
        self.transition(authorization_secret, SandboxState::Paused, false)
            .await
    }

    pub async fn pause(&self, authorization_secret: &str) -> bool {
        match self.try_pause(authorization_secret).await {
            Ok(()) => true,
            Err(err) => {
                warn!("lifecycle: pause refused: {err}");
                false
            }
        }
    }

    pub async fn resume(&self, authorization_secret: &str) -> bool {
        match self.try_resume(authorization_secret).await {
            Ok(()) => true,
            Err(err) => {
                warn!("lifecycle: resume refused: {err}");
                false
            }
        }
    }

    // ── terminate ───────────────────────────────────────────────────────────

    /// Tear down the test instance if present, else the production instance,
    /// then prune dangling images. Returns the kind that was removed.
    pub async fn try_terminate(&self) -> Result<Option<SandboxKind>> {
        let instances = self.runtime.list().await?;
        let target = [SandboxKind::Test, SandboxKind::Production]
            .into_iter()
            .find_map(|kind| self.find(&instances, kind).map(|i| (kind, i.clone())));

        if let Some((kind, instance)) = &target {
            if instance.state == SandboxState::Running {
                self.runtime.signal_shutdown(&instance.name).await?;
                let wait = self.runtime.wait_exit(&instance.name);
                match tokio::time::timeout(self.config.stop_timeout, wait).await {
                    Ok(result) => result?,
                    Err(_) => warn!(
                        "lifecycle: {} still running after {:?}, forcing removal",
                        instance.name, self.config.stop_timeout
                    ),
                }
            }
            self.runtime.remove(&instance.name).await?;
            info!("lifecycle: terminated {kind:?} instance {}", instance.name);
        }

        self.runtime.prune_dangling_images().await?;
        Ok(target.map(|(kind, _)| kind))
    }

    pub async fn terminate(&self) -> bool {
        match self.try_terminate().await {
            Ok(_) => true,
            Err(err) => {
                warn!("lifecycle: terminate failed: {err}");
                false
            }
        }
    }
}

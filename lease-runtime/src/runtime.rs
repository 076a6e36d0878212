//! Container runtime boundary.
//!
//! [`ContainerRuntime`] is the narrow set of calls the lifecycle controller
//! needs. [`DockerRuntime`] implements it over docktopus/bollard; tests use
//! [`mock::MockRuntime`].

use docktopus::DockerBuilder;
use docktopus::bollard::container::{
    Config as BollardConfig, ListContainersOptions, RemoveContainerOptions, WaitContainerOptions,
};
use docktopus::bollard::errors::Error as BollardError;
use docktopus::bollard::exec::{CreateExecOptions, StartExecOptions};
use docktopus::bollard::image::PruneImagesOptions;
use docktopus::bollard::models::{DeviceRequest, HostConfig, PortBinding, PortMap};
use docktopus::container::Container;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::OnceCell as AsyncOnceCell;

use crate::error::{LeaseError, Result};
use crate::lifecycle::GpuCapacity;

/// Observed state of a sandbox instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    #[default]
    Absent,
    Provisioning,
    Running,
    Paused,
    Exited,
}

impl SandboxState {
    /// Map a Docker state string (`running`, `paused`, `exited`, ...) onto our states.
    pub fn from_docker(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" => SandboxState::Running,
            "paused" => SandboxState::Paused,
            "created" | "restarting" => SandboxState::Provisioning,
            "exited" | "dead" | "removing" => SandboxState::Exited,
            _ => SandboxState::Absent,
        }
    }
}

/// One container as seen by the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSummary {
    pub name: String,
    pub state: SandboxState,
}

/// Everything needed to start one sandbox container.
#[derive(Clone, Debug, Default)]
pub struct LaunchRequest {
    pub name: String,
    pub image: String,
    pub cpuset: String,
    pub memory_bytes: u64,
    /// Per-container writable layer size; 0 leaves the daemon default.
    pub disk_bytes: u64,
    pub gpu: GpuCapacity,
    pub ssh_port: u16,
    pub volume: Option<(String, String)>,
    pub env: Vec<String>,
    pub command: Vec<String>,
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Every container known to the runtime, running or not.
    async fn list(&self) -> Result<Vec<InstanceSummary>>;

    /// Create and start a container. Returns the runtime's container id.
    async fn launch(&self, request: &LaunchRequest) -> Result<String>;

    /// Send SIGTERM to PID 1 inside the container.
    async fn signal_shutdown(&self, name: &str) -> Result<()>;

    /// Block until the container is no longer running.
    async fn wait_exit(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;

    async fn pause(&self, name: &str) -> Result<()>;

    async fn unpause(&self, name: &str) -> Result<()>;

    async fn prune_dangling_images(&self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Docker
// ─────────────────────────────────────────────────────────────────────────────

pub struct DockerRuntime {
    docker_host: Option<String>,
    pull_image: bool,
    builder: AsyncOnceCell<DockerBuilder>,
}

impl DockerRuntime {
    pub fn new(docker_host: Option<String>, pull_image: bool) -> Self {
        Self {
            docker_host,
            pull_image,
            builder: AsyncOnceCell::new(),
        }
    }

    async fn builder(&self) -> Result<&DockerBuilder> {
        self.builder
            .get_or_try_init(|| async {
                let builder = match self.docker_host.as_deref() {
                    Some(host) => DockerBuilder::with_address(host).await.map_err(|err| {
                        LeaseError::RuntimeAccess(format!(
                            "Failed to connect to docker at {host}: {err}"
                        ))
                    })?,
                    None => DockerBuilder::new().await.map_err(|err| {
                        LeaseError::RuntimeAccess(format!("Failed to connect to docker: {err}"))
                    })?,
                };
                Ok(builder)
            })
            .await
    }
}

/// Translate a launch request into the Docker create config override.
pub fn build_docker_config(request: &LaunchRequest) -> BollardConfig<String> {
    let mut port_bindings = PortMap::new();
    port_bindings.insert(
        "22/tcp".to_string(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(request.ssh_port.to_string()),
        }]),
    );
    let mut exposed_ports = HashMap::new();
    exposed_ports.insert("22/tcp".to_string(), HashMap::new());

    let mut host_config = HostConfig {
        port_bindings: Some(port_bindings),
        ..Default::default()
    };
    if !request.cpuset.is_empty() {
        host_config.cpuset_cpus = Some(request.cpuset.clone());
    }
    if request.memory_bytes > 0 {
        host_config.memory = Some(request.memory_bytes as i64);
    }
    if request.disk_bytes > 0 {
        let mut storage_opt = HashMap::new();
        storage_opt.insert("size".to_string(), request.disk_bytes.to_string());
        host_config.storage_opt = Some(storage_opt);
    }
    let gpu_count = match request.gpu {
        GpuCapacity::All => Some(-1),
        GpuCapacity::Count(0) => None,
        GpuCapacity::Count(n) => Some(n as i64),
    };
    if let Some(count) = gpu_count {
        host_config.device_requests = Some(vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            count: Some(count),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]);
    }
    if let Some((source, target)) = &request.volume {
        host_config.binds = Some(vec![format!("{source}:{target}")]);
    }

    BollardConfig {
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        cmd: (!request.command.is_empty()).then(|| request.command.clone()),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self) -> Result<Vec<InstanceSummary>> {
        let builder = self.builder().await?;
        let containers = builder
            .client()
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|err| LeaseError::RuntimeAccess(format!("Failed to list containers: {err}")))?;

        let mut instances = Vec::new();
        for summary in containers {
            let state = SandboxState::from_docker(summary.state.as_deref().unwrap_or_default());
            for name in summary.names.unwrap_or_default() {
                instances.push(InstanceSummary {
                    name: name.trim_start_matches('/').to_string(),
                    state,
                });
            }
        }
        Ok(instances)
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<String> {
        let builder = self.builder().await?;
        if self.pull_image {
            builder.pull_image(&request.image, None).await.map_err(|err| {
                LeaseError::ResourceUnavailable(format!(
                    "Failed to pull image {}: {err}",
                    request.image
                ))
            })?;
        }

        let mut container = Container::new(builder.client(), request.image.clone())
            .with_name(request.name.clone())
            .env(request.env.clone())
            .config_override(build_docker_config(request));

        container.start(false).await.map_err(|err| {
            LeaseError::ResourceUnavailable(format!(
                "Failed to start container {}: {err}",
                request.name
            ))
        })?;

        container
            .id()
            .map(|id| id.to_string())
            .ok_or_else(|| LeaseError::RuntimeAccess("Missing container id".into()))
    }

    async fn signal_shutdown(&self, name: &str) -> Result<()> {
        let builder = self.builder().await?;
        let exec = builder
            .client()
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(vec!["kill", "-15", "1"]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| LeaseError::RuntimeAccess(format!("Failed to create exec: {err}")))?;
        builder
            .client()
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| LeaseError::RuntimeAccess(format!("Failed to signal {name}: {err}")))?;
        Ok(())
    }

    async fn wait_exit(&self, name: &str) -> Result<()> {
        let builder = self.builder().await?;
        let mut stream = builder.client().wait_container(
            name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        while let Some(result) = stream.next().await {
            match result {
                Ok(_) => {}
                // Non-zero exit after SIGTERM is expected.
                Err(BollardError::DockerContainerWaitError { .. }) => {}
                Err(err) => {
                    return Err(LeaseError::RuntimeAccess(format!(
                        "Failed waiting for {name}: {err}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let builder = self.builder().await?;
        builder
            .client()
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| LeaseError::RuntimeAccess(format!("Failed to remove {name}: {err}")))
    }

    async fn pause(&self, name: &str) -> Result<()> {
        let builder = self.builder().await?;
        builder
            .client()
            .pause_container(name)
            .await
            .map_err(|err| LeaseError::RuntimeAccess(format!("Failed to pause {name}: {err}")))
    }

    async fn unpause(&self, name: &str) -> Result<()> {
        let builder = self.builder().await?;
        builder
            .client()
            .unpause_container(name)
            .await
            .map_err(|err| LeaseError::RuntimeAccess(format!("Failed to unpause {name}: {err}")))
    }

    async fn prune_dangling_images(&self) -> Result<()> {
        let builder = self.builder().await?;
        let mut filters = HashMap::new();
        filters.insert("dangling", vec!["true"]);
        builder
            .client()
            .prune_images(Some(PruneImagesOptions { filters }))
            .await
            .map_err(|err| LeaseError::RuntimeAccess(format!("Failed to prune images: {err}")))?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory container runtime.
    ///
    /// Containers are kept in insertion order. Every call is appended to
    /// `calls` as `"<op>:<name>"` so tests can assert on exact sequences.
    /// `fail_list` and `fail_remove` make the matching calls return
    /// `RuntimeAccess`; `fail_launch` makes `launch` return `ResourceUnavailable`.
    /// `exit_on_launch` starts containers already exited and `hang_wait`
    /// makes `wait_exit` never return.
    pub struct MockRuntime {
        pub containers: Mutex<Vec<InstanceSummary>>,
        pub launches: Mutex<Vec<LaunchRequest>>,
        pub calls: Mutex<Vec<String>>,
        pub prune_count: AtomicUsize,
        pub fail_list: AtomicBool,
        pub fail_launch: AtomicBool,
        pub fail_remove: AtomicBool,
        pub exit_on_launch: AtomicBool,
        pub hang_wait: AtomicBool,
    }

    impl Default for MockRuntime {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self {
                containers: Mutex::new(Vec::new()),
                launches: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                prune_count: AtomicUsize::new(0),
                fail_list: AtomicBool::new(false),
                fail_launch: AtomicBool::new(false),
                fail_remove: AtomicBool::new(false),
                exit_on_launch: AtomicBool::new(false),
                hang_wait: AtomicBool::new(false),
            }
        }

        pub fn with_containers(containers: &[(&str, SandboxState)]) -> Self {
            let mock = Self::new();
            for (name, state) in containers {
                mock.insert(name, *state);
            }
            mock
        }

        pub fn insert(&self, name: &str, state: SandboxState) {
            self.containers.lock().unwrap().push(InstanceSummary {
                name: name.to_string(),
                state,
            });
        }

        pub fn state_of(&self, name: &str) -> Option<SandboxState> {
            self.containers
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.state)
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, op: &str, name: &str) {
            self.calls.lock().unwrap().push(format!("{op}:{name}"));
        }

        fn set_state(&self, name: &str, from: SandboxState, to: SandboxState) -> Result<()> {
            let mut containers = self.containers.lock().unwrap();
            match containers.iter_mut().find(|c| c.name == name) {
                Some(c) if c.state == from => {
                    c.state = to;
                    Ok(())
                }
                Some(c) => Err(LeaseError::RuntimeAccess(format!(
                    "{name} is {:?}, expected {from:?}",
                    c.state
                ))),
                None => Err(LeaseError::RuntimeAccess(format!("no such container {name}"))),
            }
        }
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list(&self) -> Result<Vec<InstanceSummary>> {
            if self.fail_list.load(Ordering::Relaxed) {
                return Err(LeaseError::RuntimeAccess("mock list failure".into()));
            }
            Ok(self.containers.lock().unwrap().clone())
        }

        async fn launch(&self, request: &LaunchRequest) -> Result<String> {
            self.record("launch", &request.name);
            if self.fail_launch.load(Ordering::Relaxed) {
                return Err(LeaseError::ResourceUnavailable("mock launch failure".into()));
            }
            self.launches.lock().unwrap().push(request.clone());
            let mut containers = self.containers.lock().unwrap();
            containers.retain(|c| c.name != request.name);
            let state = if self.exit_on_launch.load(Ordering::Relaxed) {
                SandboxState::Exited
            } else {
                SandboxState::Running
            };
            containers.push(InstanceSummary {
                name: request.name.clone(),
                state,
            });
            Ok(format!("mock-{}", request.name))
        }

        async fn signal_shutdown(&self, name: &str) -> Result<()> {
            self.record("signal", name);
            self.set_state(name, SandboxState::Running, SandboxState::Exited)
        }

        async fn wait_exit(&self, name: &str) -> Result<()> {
            self.record("wait", name);
            if self.hang_wait.load(Ordering::Relaxed) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn remove(&self, name: &str) -> Result<()> {
            self.record("remove", name);
            if self.fail_remove.load(Ordering::Relaxed) {
                return Err(LeaseError::RuntimeAccess("mock remove failure".into()));
            }
            self.containers.lock().unwrap().retain(|c| c.name != name);
            Ok(())
        }

        async fn pause(&self, name: &str) -> Result<()> {
            self.record("pause", name);
            self.set_state(name, SandboxState::Running, SandboxState::Paused)
        }

        async fn unpause(&self, name: &str) -> Result<()> {
            self.record("unpause", name);
            self.set_state(name, SandboxState::Paused, SandboxState::Running)
        }

        async fn prune_dangling_images(&self) -> Result<()> {
            self.prune_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LaunchRequest {
        LaunchRequest {
            name: "container".into(),
            image: "ubuntu:22.04".into(),
            cpuset: "0-1".into(),
            memory_bytes: 1_073_741_824,
            gpu: GpuCapacity::All,
            ssh_port: 2222,
            volume: Some(("/srv/lease".into(), "/data".into())),
            command: vec!["/bin/sh".into(), "-c".into(), "true".into()],
            ..Default::default()
        }
    }

    #[test]
    fn docker_state_mapping() {
        assert_eq!(SandboxState::from_docker("running"), SandboxState::Running);
        assert_eq!(SandboxState::from_docker("Paused"), SandboxState::Paused);
        assert_eq!(SandboxState::from_docker("created"), SandboxState::Provisioning);
        assert_eq!(SandboxState::from_docker("exited"), SandboxState::Exited);
        assert_eq!(SandboxState::from_docker("dead"), SandboxState::Exited);
        assert_eq!(SandboxState::from_docker(""), SandboxState::Absent);
    }

    #[test]
    fn docker_config_maps_resources() {
        let config = build_docker_config(&request());
        let host = config.host_config.unwrap();

        assert_eq!(host.cpuset_cpus.as_deref(), Some("0-1"));
        assert_eq!(host.memory, Some(1_073_741_824));
        assert!(host.storage_opt.is_none());
        assert_eq!(host.binds, Some(vec!["/srv/lease:/data".to_string()]));

        let gpu = &host.device_requests.unwrap()[0];
        assert_eq!(gpu.count, Some(-1));
        assert_eq!(gpu.driver.as_deref(), Some("nvidia"));

        let ports = host.port_bindings.unwrap();
        let ssh = ports["22/tcp"].as_ref().unwrap();
        assert_eq!(ssh[0].host_port.as_deref(), Some("2222"));
        assert_eq!(config.cmd.unwrap()[0], "/bin/sh");
    }

    #[test]
    fn zero_gpu_requests_no_device() {
        let mut req = request();
        req.gpu = GpuCapacity::Count(0);
        req.disk_bytes = 5_000;
        let host = build_docker_config(&req).host_config.unwrap();
        assert!(host.device_requests.is_none());
        assert_eq!(host.storage_opt.unwrap()["size"], "5000");
    }

    #[test]
    fn counted_gpus_pass_through() {
        let mut req = request();
        req.gpu = GpuCapacity::Count(2);
        let host = build_docker_config(&req).host_config.unwrap();
        assert_eq!(host.device_requests.unwrap()[0].count, Some(2));
    }
}

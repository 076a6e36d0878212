//! Sandbox runtime for single-slot lease nodes.
//!
//! This crate owns the container lifecycle (production and test instances),
//! the persisted allocation record, and sealing of login details to the
//! renter's public key. The node library builds the allocation registry,
//! lease scheduler and access rotation on top of it.

pub mod crypto;
pub mod daemon_config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod runtime;
pub mod store;
pub mod util;

pub use error::LeaseError;
pub use lifecycle::{
    GpuCapacity, LifecycleConfig, LifecycleController, ProvisionResponse, ResourceSpec,
    SandboxKind, SandboxSpec,
};
pub use runtime::{ContainerRuntime, DockerRuntime, InstanceSummary, SandboxState};
pub use store::{AllocationRecord, AllocationStore};

pub const DEFAULT_PRODUCTION_NAME: &str = "container";
pub const DEFAULT_TEST_NAME: &str = "test_container";
pub const DEFAULT_SSH_USERNAME: &str = "root";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

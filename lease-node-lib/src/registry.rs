//! Allocation registry: the single-slot lease of this node.
//!
//! Every public operation returns a boolean `status`. The `try_*` forms keep
//! the tagged [`LeaseError`] for callers that need the reason.

use blueprint_sdk::{info, warn};
use lease_runtime::error::{LeaseError, Result};
use lease_runtime::lifecycle::{Capacity, CpuAssignment, GpuSpec};
use lease_runtime::{GpuCapacity, LifecycleController, ResourceSpec, SandboxSpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::scheduler::{LeaseScheduler, ScheduledJob, lease_duration};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuRequest {
    pub count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRequest {
    #[serde(default)]
    pub capacity: Option<GpuCapacity>,
}

/// Resources as a renter asks for them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: CpuRequest,
    #[serde(default)]
    pub gpu: Option<GpuRequest>,
    pub hard_disk: Capacity,
    pub ram: Capacity,
    /// Provision the test instance instead of the production one.
    #[serde(default)]
    pub testing: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: bool,
}

impl From<bool> for StatusResponse {
    fn from(status: bool) -> Self {
        Self { status }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RegisterOutcome {
    /// Login details sealed to the renter key, base64.
    pub info: String,
    pub job: ScheduledJob,
}

/// Pin `count` cores starting at core 0 and make an absent GPU an explicit zero.
pub fn normalize_resources(request: &ResourceRequest) -> Result<ResourceSpec> {
    let assignment = match request.cpu.count {
        0 => return Err(LeaseError::Validation("cpu count must be at least 1".into())),
        1 => "0".to_string(),
        n => format!("0-{}", n - 1),
    };
    let gpu = request
        .gpu
        .as_ref()
        .and_then(|gpu| gpu.capacity)
        .unwrap_or(GpuCapacity::Count(0));

    Ok(ResourceSpec {
        cpu: CpuAssignment { assignment },
        ram: request.ram.clone(),
        hard_disk: request.hard_disk.clone(),
        gpu: GpuSpec { capacity: gpu },
    })
}

pub struct AllocationRegistry {
    lifecycle: Arc<LifecycleController>,
    scheduler: LeaseScheduler,
}

impl AllocationRegistry {
    pub fn new(lifecycle: Arc<LifecycleController>, scheduler: LeaseScheduler) -> Self {
        Self {
            lifecycle,
            scheduler,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// Terminate whatever runs, normalize, provision, then arm expiry.
    /// Stops at the first failure; only the termination is never undone.
    pub async fn try_register(
        &self,
        lease_days: f64,
        request: &ResourceRequest,
        renter_key: &str,
        spec: &SandboxSpec,
    ) -> Result<RegisterOutcome> {
        self.lifecycle.try_terminate().await?;

        let resources = normalize_resources(request)?;
        let duration = lease_duration(lease_days)?;

        let info = self
            .lifecycle
            .try_provision(&resources, renter_key, spec, request.testing)
            .await?;

        let job = self.scheduler.arm(duration).await?;
        let expires_at = job.fire_at.timestamp().max(0) as u64;
        if let Err(err) = self.lifecycle.records().set_expiry(expires_at) {
            warn!("registry: failed to stamp lease expiry: {err}");
        }

        info!(
            "registry: lease registered (cpuset={}, gpu={:?}, expiry job {})",
            resources.cpu.assignment, resources.gpu.capacity, job.job_id
        );
        Ok(RegisterOutcome { info, job })
    }

    pub async fn register(
        &self,
        lease_days: f64,
        request: &ResourceRequest,
        renter_key: &str,
        spec: &SandboxSpec,
    ) -> RegisterResponse {
        match self.try_register(lease_days, request, renter_key, spec).await {
            Ok(outcome) => RegisterResponse {
                status: true,
                info: Some(outcome.info),
            },
            Err(err) => {
                warn!("registry: register failed ({}): {err}", err.kind());
                RegisterResponse::default()
            }
        }
    }

    /// Verify the caller owns the lease, terminate, clear the record, then
    /// cancel the pending expiry job.
    pub async fn try_deregister(&self, renter_key: &str) -> Result<()> {
        self.lifecycle.records().verify(renter_key)?;
        self.lifecycle.try_terminate().await?;
        self.lifecycle.records().clear()?;
        if let Err(err) = self.scheduler.disarm().await {
            warn!("registry: failed to cancel expiry job: {err}");
        }
        info!("registry: lease released by renter");
        Ok(())
    }

    pub async fn deregister(&self, renter_key: &str) -> StatusResponse {
        match self.try_deregister(renter_key).await {
            Ok(()) => true.into(),
            Err(err) => {
                warn!("registry: deregister refused ({}): {err}", err.kind());
                false.into()
            }
        }
    }

    /// Slot is free iff nothing is running. The lease terms are not evaluated.
    pub async fn check_allocation(
        &self,
        _lease_days: f64,
        _request: &ResourceRequest,
    ) -> StatusResponse {
        (!self.lifecycle.inspect().await).into()
    }

    pub async fn try_check_if_allocated(&self, renter_key: &str) -> Result<bool> {
        self.lifecycle.records().verify(renter_key)?;
        self.lifecycle.try_inspect().await
    }

    pub async fn check_if_allocated(&self, renter_key: &str) -> StatusResponse {
        match self.try_check_if_allocated(renter_key).await {
            Ok(running) => running.into(),
            Err(err) => {
                warn!("registry: allocation check failed ({}): {err}", err.kind());
                false.into()
            }
        }
    }

    pub async fn pause(&self, renter_key: &str) -> StatusResponse {
        self.lifecycle.pause(renter_key).await.into()
    }

    pub async fn resume(&self, renter_key: &str) -> StatusResponse {
        self.lifecycle.resume(renter_key).await.into()
    }

    /// Action of the deferred expiry job: terminate and drop the record.
    pub async fn expire(&self) -> bool {
        match self.lifecycle.try_terminate().await {
            Ok(kind) => {
                if let Err(err) = self.lifecycle.records().clear() {
                    warn!("registry: failed to clear allocation record: {err}");
                }
                info!("registry: lease expired (terminated {kind:?})");
                true
            }
            Err(err) => {
                warn!("registry: expiry terminate failed: {err}");
                false
            }
        }
    }
}

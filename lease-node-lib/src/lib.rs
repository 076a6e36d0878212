//! Lease node: allocation registry, lease expiry scheduling, auditor access
//! rotation and the HTTP surface that exposes them.

pub mod access;
pub mod auth;
pub mod clock;
pub mod node_api;
pub mod peers;
pub mod registry;
pub mod retry;
pub mod rotation;
pub mod scheduler;

pub use access::{AccessLedger, AccessRecord};
pub use auth::{NodeApiAuth, NodeAuth};
pub use clock::{Clock, SystemClock};
pub use node_api::{NodeApiConfig, NodeApiState, node_api_router};
pub use peers::{HttpPeerRegistry, HttpPeerTransport, Peer, PeerRegistry, PeerSnapshot, PeerTransport};
pub use registry::{AllocationRegistry, RegisterResponse, ResourceRequest, StatusResponse};
pub use retry::{RetryPolicy, retry};
pub use rotation::{AccessRotation, CycleReport, RotationConfig};
pub use scheduler::{AtJobQueue, JobQueue, LeaseScheduler, SchedulerConfig};

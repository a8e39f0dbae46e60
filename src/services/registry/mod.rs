//! Registry service module
//!
//! This module contains the service registry implementation split into logical components:
//! - `types`: ServiceInstance / RegisterRequest and their stored JSON encoding
//! - `keys`: key namespace under `/services/`
//! - `lease_tracker`: instance id -> lease bookkeeping
//! - `keepalive`: per-registration lease renewal task
//! - `heartbeat`: liveness deadline for instances registered over gRPC
//! - `service`: core registry operations
//! - `grpc_impl`: gRPC trait implementation

pub mod error;
pub mod grpc_impl;
pub mod heartbeat;
pub mod keepalive;
pub mod keys;
pub mod lease_tracker;
pub mod service;
pub mod types;

// Re-export public types for easier access
pub use error::RegistryError;
pub use grpc_impl::RegistryGrpcService;
pub use heartbeat::HeartbeatMonitor;
pub use keepalive::{KeepaliveHandle, KeepaliveState, StopReason};
pub use service::ServiceRegistry;
pub use types::{InstanceStatus, RegisterRequest, ServiceInstance};

//! Port-forward tunnel orchestration.
//!
//! This module provides:
//! - Supervision of kubectl port-forward and socat relay processes
//! - Classified streaming of helper process output
//! - Connection lifecycle, monitoring, and auto-reconnect
//! - Local port conflict resolution
//! - Connection configuration persistence and cluster discovery

pub mod classify;
pub mod discovery;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod resolver;
pub mod store;
pub mod supervisor;

// Re-export commonly used types
pub use classify::{classify, LineClass};
pub use discovery::{ClusterDiscovery, ClusterNamespace, ClusterService, ServicePort};
pub use errors::{ForwardError, Result};
pub use models::{
    ConnectionConfig, ConnectionState, ForwardNotification, ForwardStatus, ForwardsFile,
    ProcessRole, SpawnMode,
};
pub use orchestrator::{ForwardOrchestrator, OrchestratorTuning};
pub use resolver::ConflictResolver;
pub use store::ForwardStore;
pub use supervisor::{HelperPaths, ProcessSupervisor, Supervise, SupervisorEvent};

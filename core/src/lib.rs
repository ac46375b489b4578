//! PortBridge Core Library
//!
//! Manages local TCP tunnels into a Kubernetes cluster by supervising chains
//! of helper processes (kubectl port-forward plus an optional socat relay).
//! Provides functionality to:
//! - Start, monitor, reconnect, and tear down port-forward pipelines
//! - Resolve local port conflicts
//! - Stream and classify helper process output
//! - Discover namespaces/services and persist connection configs
//!
//! # Architecture
//! The [`forward::ForwardOrchestrator`] is the caller-facing surface: it owns
//! all connection state and drives the [`forward::ProcessSupervisor`], which
//! in turn exclusively owns the spawned OS processes and their output-reader
//! tasks. Callers poll/observe state; they never await process lifecycle
//! results directly.

pub mod error;
pub mod forward;
pub mod settings;

// Re-export commonly used types
pub use error::{Error, Result};
pub use forward::{
    ClusterDiscovery, ConflictResolver, ConnectionConfig, ConnectionState, ForwardNotification,
    ForwardOrchestrator, ForwardStatus, ForwardStore, HelperPaths, ProcessSupervisor, SpawnMode,
};
pub use settings::{Settings, SettingsStore};

//! Data model for port-forward connections.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Connection Configuration
// ============================================================================

/// How the tunnel pipeline for a connection is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnMode {
    /// kubectl port-forward on a fixed local port, plus an optional socat
    /// relay when a proxy port is configured.
    SimpleRelay,
    /// socat relay that EXECs a generated wrapper script which allocates an
    /// ephemeral local port per accepted connection. Avoids static port
    /// collisions when many connections run at once.
    #[default]
    EphemeralDirectExec,
}

impl SpawnMode {
    fn is_direct_exec(&self) -> bool {
        matches!(self, Self::EphemeralDirectExec)
    }
}

/// Configuration for one port-forward connection.
///
/// Immutable value supplied by the caller or built from cluster discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    pub is_enabled: bool,
    pub auto_reconnect: bool,
    /// Stored as the legacy `useDirectExec` boolean for config-file
    /// compatibility; exposed in memory as [`SpawnMode`].
    #[serde(
        rename = "useDirectExec",
        serialize_with = "spawn_mode_to_bool",
        deserialize_with = "spawn_mode_from_bool"
    )]
    pub spawn_mode: SpawnMode,
}

fn spawn_mode_to_bool<S: serde::Serializer>(mode: &SpawnMode, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_bool(mode.is_direct_exec())
}

fn spawn_mode_from_bool<'de, D: serde::Deserializer<'de>>(d: D) -> Result<SpawnMode, D::Error> {
    let direct: bool = Deserialize::deserialize(d)?;
    Ok(if direct {
        SpawnMode::EphemeralDirectExec
    } else {
        SpawnMode::SimpleRelay
    })
}

impl ConnectionConfig {
    /// Creates a configuration with default flags.
    pub fn new(
        name: String,
        namespace: String,
        service: String,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            namespace,
            service,
            local_port,
            remote_port,
            proxy_port: None,
            is_enabled: true,
            auto_reconnect: true,
            spawn_mode: SpawnMode::default(),
        }
    }

    /// The port clients actually connect to.
    pub fn effective_port(&self) -> u16 {
        self.proxy_port.unwrap_or(self.local_port)
    }

    /// Whether a relay process is part of this connection's pipeline.
    pub fn has_relay(&self) -> bool {
        self.spawn_mode.is_direct_exec() || self.proxy_port.is_some()
    }
}

// ============================================================================
// Runtime Status & State
// ============================================================================

/// Status of one process in a connection's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ForwardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

/// Role of a managed OS process within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// kubectl port-forward.
    Tunnel,
    /// socat relay (including direct-exec mode's outer socat).
    Relay,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tunnel => "tunnel",
            Self::Relay => "relay",
        }
    }
}

/// Runtime state of a connection. Never persisted; survives process
/// stop/restart cycles and is destroyed only when the config is removed.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub id: Uuid,
    pub tunnel_status: ForwardStatus,
    pub relay_status: ForwardStatus,
    pub last_error: Option<String>,
    /// True after a caller-initiated stop. Suppresses auto-reconnect and
    /// failure notifications until the next start.
    pub is_intentionally_stopped: bool,
}

impl ConnectionState {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            tunnel_status: ForwardStatus::Disconnected,
            relay_status: ForwardStatus::Disconnected,
            last_error: None,
            is_intentionally_stopped: false,
        }
    }

    /// Whether the whole pipeline is up: tunnel connected, and the relay
    /// connected too when one is configured.
    pub fn is_fully_connected(&self, has_relay: bool) -> bool {
        if has_relay {
            self.tunnel_status == ForwardStatus::Connected
                && self.relay_status == ForwardStatus::Connected
        } else {
            self.tunnel_status == ForwardStatus::Connected
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Connection lifecycle events surfaced to the external notification sink.
#[derive(Debug, Clone)]
pub enum ForwardNotification {
    Connected {
        connection_id: Uuid,
        connection_name: String,
    },
    Disconnected {
        connection_id: Uuid,
        connection_name: String,
    },
    Error {
        connection_id: Uuid,
        connection_name: String,
        message: String,
    },
}

impl ForwardNotification {
    pub fn connection_id(&self) -> Uuid {
        match self {
            Self::Connected { connection_id, .. }
            | Self::Disconnected { connection_id, .. }
            | Self::Error { connection_id, .. } => *connection_id,
        }
    }

    /// Title half of the `(title, body)` pair handed to the sink.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "Port forward connected",
            Self::Disconnected { .. } => "Port forward disconnected",
            Self::Error { .. } => "Port forward error",
        }
    }

    /// Body half of the `(title, body)` pair handed to the sink.
    pub fn body(&self) -> String {
        match self {
            Self::Connected {
                connection_name, ..
            } => format!("{} is ready", connection_name),
            Self::Disconnected {
                connection_name, ..
            } => format!("{} lost its connection", connection_name),
            Self::Error {
                connection_name,
                message,
                ..
            } => format!("{}: {}", connection_name, message),
        }
    }
}

/// On-disk shape of the connection store file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardsFile {
    pub connections: Vec<ConnectionConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(
            "api".to_string(),
            "default".to_string(),
            "api-svc".to_string(),
            8080,
            80,
        )
    }

    #[test]
    fn test_effective_port() {
        let mut c = config();
        assert_eq!(c.effective_port(), 8080);
        c.proxy_port = Some(9090);
        assert_eq!(c.effective_port(), 9090);
    }

    #[test]
    fn test_fully_connected_both_directions() {
        let mut state = ConnectionState::new(Uuid::new_v4());

        // Not connected at all.
        assert!(!state.is_fully_connected(false));
        assert!(!state.is_fully_connected(true));

        // Tunnel only: enough without a relay, not with one.
        state.tunnel_status = ForwardStatus::Connected;
        assert!(state.is_fully_connected(false));
        assert!(!state.is_fully_connected(true));

        // Both up.
        state.relay_status = ForwardStatus::Connected;
        assert!(state.is_fully_connected(true));

        // Relay up but tunnel down is never fully connected.
        state.tunnel_status = ForwardStatus::Error;
        assert!(!state.is_fully_connected(true));
        assert!(!state.is_fully_connected(false));
    }

    #[test]
    fn test_spawn_mode_serialized_as_legacy_bool() {
        let mut c = config();
        c.spawn_mode = SpawnMode::EphemeralDirectExec;
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["useDirectExec"], serde_json::Value::Bool(true));

        c.spawn_mode = SpawnMode::SimpleRelay;
        let json = serde_json::to_string(&c).unwrap();
        let back: ConnectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.spawn_mode, SpawnMode::SimpleRelay);
    }

    #[test]
    fn test_has_relay() {
        let mut c = config();
        c.spawn_mode = SpawnMode::SimpleRelay;
        assert!(!c.has_relay());
        c.proxy_port = Some(9090);
        assert!(c.has_relay());
        c.proxy_port = None;
        c.spawn_mode = SpawnMode::EphemeralDirectExec;
        assert!(c.has_relay());
    }
}

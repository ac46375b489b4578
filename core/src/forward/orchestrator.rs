//! Caller-facing connection orchestration.
//!
//! Owns every [`ConnectionConfig`]/[`ConnectionState`] pair, drives the
//! supervisor, and runs the periodic monitor loop. Callers never await
//! process teardown or spawn results: start/stop mutate status optimistically
//! and the OS-level work happens on per-connection worker tasks, which keeps
//! operations on the same connection in issue order while different
//! connections proceed independently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::classify::LineClass;
use super::errors::{ForwardError, Result};
use super::models::{
    ConnectionConfig, ConnectionState, ForwardNotification, ForwardStatus, ProcessRole, SpawnMode,
};
use super::resolver::ConflictResolver;
use super::store::ForwardStore;
use super::supervisor::{Supervise, SupervisorEvent};
use crate::settings::SettingsStore;

/// Timing knobs for the orchestrator. Defaults match interactive use; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct OrchestratorTuning {
    /// Settle time after spawning the tunnel before probing its port.
    pub tunnel_stabilization: Duration,
    /// Settle time after spawning a relay before probing its port.
    pub relay_stabilization: Duration,
    /// Fixed monitor tick; `None` uses the settings refresh interval.
    pub monitor_interval: Option<Duration>,
}

impl Default for OrchestratorTuning {
    fn default() -> Self {
        Self {
            tunnel_stabilization: Duration::from_secs(2),
            relay_stabilization: Duration::from_secs(1),
            monitor_interval: None,
        }
    }
}

/// Work items processed sequentially by a connection's worker task.
enum ConnOp {
    Start { config: ConnectionConfig, epoch: u64 },
    Kill,
}

struct Inner {
    configs: Vec<ConnectionConfig>,
    states: HashMap<Uuid, ConnectionState>,
    /// Bumped on every start/stop; async attempts only commit results while
    /// their epoch is still current.
    epochs: HashMap<Uuid, u64>,
    /// Connections that already got their one post-conflict retry.
    conflict_retried: HashSet<Uuid>,
    pending: Vec<ForwardNotification>,
    workers: HashMap<Uuid, UnboundedSender<ConnOp>>,
    monitor_cancel: Option<CancellationToken>,
}

/// Orchestrates the lifecycle of all port-forward connections.
pub struct ForwardOrchestrator {
    supervisor: Arc<dyn Supervise>,
    resolver: ConflictResolver,
    store: Arc<ForwardStore>,
    settings: Arc<SettingsStore>,
    tuning: OrchestratorTuning,
    inner: Mutex<Inner>,
    events: tokio::sync::Mutex<UnboundedReceiver<SupervisorEvent>>,
}

impl ForwardOrchestrator {
    pub fn new(
        supervisor: Arc<dyn Supervise>,
        events: UnboundedReceiver<SupervisorEvent>,
        store: Arc<ForwardStore>,
        settings: Arc<SettingsStore>,
    ) -> Arc<Self> {
        Self::with_tuning(supervisor, events, store, settings, OrchestratorTuning::default())
    }

    pub fn with_tuning(
        supervisor: Arc<dyn Supervise>,
        events: UnboundedReceiver<SupervisorEvent>,
        store: Arc<ForwardStore>,
        settings: Arc<SettingsStore>,
        tuning: OrchestratorTuning,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            resolver: ConflictResolver::new(),
            store,
            settings,
            tuning,
            inner: Mutex::new(Inner {
                configs: Vec::new(),
                states: HashMap::new(),
                epochs: HashMap::new(),
                conflict_retried: HashSet::new(),
                pending: Vec::new(),
                workers: HashMap::new(),
                monitor_cancel: None,
            }),
            events: tokio::sync::Mutex::new(events),
        })
    }

    // =========================================================================
    // Configuration CRUD
    // =========================================================================

    /// Loads all connections from the store, creating runtime state for any
    /// that are new.
    pub async fn load_connections(&self) -> Result<()> {
        let connections = self.store.get_connections().await?;

        let mut inner = self.inner.lock();
        for conn in &connections {
            inner
                .states
                .entry(conn.id)
                .or_insert_with(|| ConnectionState::new(conn.id));
        }
        inner.configs = connections;
        Ok(())
    }

    /// Registers a new connection. The store write happens first; in-memory
    /// state is only created once it succeeded.
    pub async fn add_connection(&self, config: ConnectionConfig) -> Result<()> {
        self.store.add_connection(config.clone()).await?;

        let mut inner = self.inner.lock();
        inner
            .states
            .insert(config.id, ConnectionState::new(config.id));
        inner.configs.push(config);
        Ok(())
    }

    /// Removes a connection. Teardown of its processes is unconditional, even
    /// mid-start; the store write is best-effort in the background.
    pub async fn remove_connection(self: &Arc<Self>, id: Uuid) -> Result<()> {
        self.stop(id);

        {
            let mut inner = self.inner.lock();
            if !inner.configs.iter().any(|c| c.id == id) {
                return Err(ForwardError::ConnectionNotFound(id.to_string()));
            }
            inner.configs.retain(|c| c.id != id);
            inner.states.remove(&id);
            inner.epochs.remove(&id);
            inner.conflict_retried.remove(&id);
            // Dropping the sender lets the worker drain its queued kill and exit.
            inner.workers.remove(&id);
        }

        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.remove_connection(id).await {
                warn!(connection = %id, error = %e, "failed to persist connection removal");
            }
        });
        Ok(())
    }

    /// Applies a changed configuration. A currently-running connection is
    /// stopped first and restarted only if it remains enabled.
    pub async fn update_connection(self: &Arc<Self>, config: ConnectionConfig) -> Result<()> {
        let id = config.id;

        let was_running = {
            let inner = self.inner.lock();
            if !inner.configs.iter().any(|c| c.id == id) {
                return Err(ForwardError::ConnectionNotFound(id.to_string()));
            }
            inner
                .states
                .get(&id)
                .map(|s| {
                    matches!(
                        s.tunnel_status,
                        ForwardStatus::Connecting | ForwardStatus::Connected
                    )
                })
                .unwrap_or(false)
        };

        if was_running {
            self.stop(id);
        }

        {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.configs.iter_mut().find(|c| c.id == id) {
                *existing = config.clone();
            }
        }

        let store = Arc::clone(&self.store);
        let stored = config.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_connection(stored).await {
                warn!(connection = %id, error = %e, "failed to persist connection update");
            }
        });

        if was_running && config.is_enabled {
            self.start(id);
        }
        Ok(())
    }

    /// All known connection configs.
    pub fn connections(&self) -> Vec<ConnectionConfig> {
        self.inner.lock().configs.clone()
    }

    /// A single connection config.
    pub fn connection(&self, id: Uuid) -> Option<ConnectionConfig> {
        self.inner.lock().configs.iter().find(|c| c.id == id).cloned()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Begins connecting. No-op when already connecting or connected; any
    /// spawn failure lands in the connection's status, not in a return value.
    pub fn start(self: &Arc<Self>, id: Uuid) {
        let (config, epoch) = {
            let mut inner = self.inner.lock();
            let Some(config) = inner.configs.iter().find(|c| c.id == id).cloned() else {
                warn!(connection = %id, "start requested for unknown connection");
                return;
            };

            let state = inner
                .states
                .entry(id)
                .or_insert_with(|| ConnectionState::new(id));
            if matches!(
                state.tunnel_status,
                ForwardStatus::Connecting | ForwardStatus::Connected
            ) {
                return;
            }

            state.tunnel_status = ForwardStatus::Connecting;
            state.relay_status = ForwardStatus::Disconnected;
            state.last_error = None;
            state.is_intentionally_stopped = false;
            inner.conflict_retried.remove(&id);
            let epoch = bump_epoch(&mut inner, id);
            (config, epoch)
        };

        self.ensure_monitor();
        let worker = self.ensure_worker(id);
        let _ = worker.send(ConnOp::Start { config, epoch });
    }

    /// Stops a connection. Optimistic: status flips to Disconnected right
    /// away and process teardown runs behind it. Idempotent.
    pub fn stop(self: &Arc<Self>, id: Uuid) {
        let (was_connected, name) = {
            let mut inner = self.inner.lock();
            bump_epoch(&mut inner, id);
            let name = inner.configs.iter().find(|c| c.id == id).map(|c| c.name.clone());
            match inner.states.get_mut(&id) {
                Some(state) => {
                    let was = state.tunnel_status == ForwardStatus::Connected;
                    state.tunnel_status = ForwardStatus::Disconnected;
                    state.relay_status = ForwardStatus::Disconnected;
                    state.is_intentionally_stopped = true;
                    (was, name)
                }
                None => (false, name),
            }
        };

        if was_connected {
            if let Some(name) = name {
                self.queue_notification(ForwardNotification::Disconnected {
                    connection_id: id,
                    connection_name: name,
                });
            }
        }

        let worker = self.ensure_worker(id);
        let _ = worker.send(ConnOp::Kill);
    }

    /// Stop followed by start, keeping the monitor loop alive and clearing
    /// the intentional-stop flag.
    pub fn restart(self: &Arc<Self>, id: Uuid) {
        self.restart_internal(id, true);
    }

    /// Starts every enabled connection.
    pub fn start_all(self: &Arc<Self>) {
        let ids: Vec<Uuid> = {
            let inner = self.inner.lock();
            inner
                .configs
                .iter()
                .filter(|c| c.is_enabled)
                .map(|c| c.id)
                .collect()
        };
        for id in ids {
            self.start(id);
        }
    }

    /// Stops every connection, halts the monitor loop, and sweeps any
    /// processes the supervisor still knows about.
    pub fn stop_all(self: &Arc<Self>) {
        let ids: Vec<Uuid> = {
            let inner = self.inner.lock();
            inner.configs.iter().map(|c| c.id).collect()
        };
        for id in ids {
            self.stop(id);
        }

        let cancel = self.inner.lock().monitor_cancel.take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            supervisor.kill_all_managed().await;
        });
    }

    /// Starts all enabled connections if the auto-start setting is on.
    pub fn run_auto_start(self: &Arc<Self>) {
        if self.settings.cached().auto_start {
            self.start_all();
        }
    }

    // =========================================================================
    // State Access
    // =========================================================================

    pub fn states(&self) -> Vec<ConnectionState> {
        self.inner.lock().states.values().cloned().collect()
    }

    pub fn state(&self, id: Uuid) -> Option<ConnectionState> {
        self.inner.lock().states.get(&id).cloned()
    }

    /// True when every registered connection is fully connected.
    pub fn all_connected(&self) -> bool {
        let inner = self.inner.lock();
        inner.configs.iter().all(|c| {
            inner
                .states
                .get(&c.id)
                .map(|s| s.is_fully_connected(c.has_relay()))
                .unwrap_or(false)
        })
    }

    /// Number of fully connected connections.
    pub fn connected_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .configs
            .iter()
            .filter(|c| {
                inner
                    .states
                    .get(&c.id)
                    .map(|s| s.is_fully_connected(c.has_relay()))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Whether the monitor loop is currently running.
    pub fn monitor_running(&self) -> bool {
        self.inner.lock().monitor_cancel.is_some()
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Drains the queued `(title, body)` events for the notification sink.
    pub fn take_pending_notifications(&self) -> Vec<ForwardNotification> {
        std::mem::take(&mut self.inner.lock().pending)
    }

    pub fn has_pending_notifications(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    fn queue_notification(&self, notification: ForwardNotification) {
        if !self.settings.cached().show_notifications {
            return;
        }

        let mut inner = self.inner.lock();
        // One pending event of a kind per connection.
        let duplicate = inner.pending.iter().any(|n| {
            n.connection_id() == notification.connection_id()
                && std::mem::discriminant(n) == std::mem::discriminant(&notification)
        });
        if !duplicate {
            inner.pending.push(notification);
        }
    }

    // =========================================================================
    // Start Attempts (run on worker tasks)
    // =========================================================================

    async fn run_start_attempt(self: Arc<Self>, config: ConnectionConfig, epoch: u64) {
        if !self.epoch_current(config.id, epoch) {
            return;
        }

        match config.spawn_mode {
            SpawnMode::EphemeralDirectExec => self.start_direct_exec(config, epoch).await,
            SpawnMode::SimpleRelay => self.start_simple(config, epoch).await,
        }
    }

    async fn start_direct_exec(&self, config: ConnectionConfig, epoch: u64) {
        let id = config.id;
        let port = config.effective_port();

        if let Err(e) = self
            .supervisor
            .start_direct_exec_relay(id, &config.namespace, &config.service, port, config.remote_port)
            .await
        {
            self.fail_attempt(id, epoch, &config.name, e.to_string());
            return;
        }

        tokio::time::sleep(self.tuning.relay_stabilization).await;
        if !self.epoch_current(id, epoch) {
            return;
        }

        if self.supervisor.is_port_open(port).await {
            self.commit_if_current(id, epoch, |state| {
                state.tunnel_status = ForwardStatus::Connected;
                state.relay_status = ForwardStatus::Connected;
            });
            self.queue_notification(ForwardNotification::Connected {
                connection_id: id,
                connection_name: config.name.clone(),
            });
        } else {
            self.fail_attempt(id, epoch, &config.name, "failed to establish connection".to_string());
        }
    }

    async fn start_simple(&self, config: ConnectionConfig, epoch: u64) {
        let id = config.id;

        if let Err(e) = self
            .supervisor
            .start_tunnel(
                id,
                &config.namespace,
                &config.service,
                config.local_port,
                config.remote_port,
            )
            .await
        {
            self.fail_attempt(id, epoch, &config.name, e.to_string());
            return;
        }

        tokio::time::sleep(self.tuning.tunnel_stabilization).await;
        if !self.epoch_current(id, epoch) {
            return;
        }

        if !self.supervisor.is_port_open(config.local_port).await {
            self.fail_attempt(
                id,
                epoch,
                &config.name,
                "port forward failed to establish".to_string(),
            );
            return;
        }

        self.commit_if_current(id, epoch, |state| {
            state.tunnel_status = ForwardStatus::Connected;
        });

        if let Some(proxy_port) = config.proxy_port {
            self.commit_if_current(id, epoch, |state| {
                state.relay_status = ForwardStatus::Connecting;
            });

            if let Err(e) = self
                .supervisor
                .start_relay(id, proxy_port, config.local_port)
                .await
            {
                self.commit_if_current(id, epoch, |state| {
                    state.relay_status = ForwardStatus::Error;
                    state.last_error = Some(e.to_string());
                });
                return;
            }

            tokio::time::sleep(self.tuning.relay_stabilization).await;
            if !self.epoch_current(id, epoch) {
                return;
            }

            if self.supervisor.is_port_open(proxy_port).await {
                self.commit_if_current(id, epoch, |state| {
                    state.relay_status = ForwardStatus::Connected;
                });
            } else {
                self.commit_if_current(id, epoch, |state| {
                    state.relay_status = ForwardStatus::Error;
                    state.last_error = Some("relay failed to start".to_string());
                });
                return;
            }
        }

        self.queue_notification(ForwardNotification::Connected {
            connection_id: id,
            connection_name: config.name.clone(),
        });
    }

    fn fail_attempt(&self, id: Uuid, epoch: u64, name: &str, message: String) {
        let committed = {
            let mut inner = self.inner.lock();
            if inner.epochs.get(&id) != Some(&epoch) {
                false
            } else if let Some(state) = inner.states.get_mut(&id) {
                state.tunnel_status = ForwardStatus::Error;
                state.last_error = Some(message.clone());
                true
            } else {
                false
            }
        };

        if committed {
            self.queue_notification(ForwardNotification::Error {
                connection_id: id,
                connection_name: name.to_string(),
                message,
            });
        }
    }

    fn commit_if_current<F: FnOnce(&mut ConnectionState)>(&self, id: Uuid, epoch: u64, f: F) {
        let mut inner = self.inner.lock();
        if inner.epochs.get(&id) != Some(&epoch) {
            return;
        }
        if let Some(state) = inner.states.get_mut(&id) {
            f(state);
        }
    }

    // =========================================================================
    // Monitor Loop
    // =========================================================================

    fn ensure_monitor(self: &Arc<Self>) {
        let cancel = {
            let mut inner = self.inner.lock();
            if inner.monitor_cancel.is_some() {
                return;
            }
            let cancel = CancellationToken::new();
            inner.monitor_cancel = Some(cancel.clone());
            cancel
        };

        debug!("starting connection monitor loop");
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let tick = match weak.upgrade() {
                    Some(orch) => orch.tick_interval(),
                    None => break,
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }

                let Some(orch) = weak.upgrade() else { break };
                orch.monitor_tick().await;
            }
            debug!("connection monitor loop stopped");
        });
    }

    fn tick_interval(&self) -> Duration {
        self.tuning.monitor_interval.unwrap_or_else(|| {
            Duration::from_secs(self.settings.cached().refresh_interval_secs.max(1))
        })
    }

    /// One reconciliation pass: drain supervisor events, re-check liveness
    /// and reachability, reconnect what should be reconnected.
    async fn monitor_tick(self: &Arc<Self>) {
        self.drain_events().await;

        let configs = { self.inner.lock().configs.clone() };
        for config in configs {
            let Some(state) = self.state(config.id) else { continue };

            if state.is_intentionally_stopped {
                continue;
            }
            // An in-flight attempt owns the state until it settles.
            if state.tunnel_status == ForwardStatus::Connecting
                || state.relay_status == ForwardStatus::Connecting
            {
                continue;
            }

            match state.tunnel_status {
                ForwardStatus::Connected => {
                    if self.check_health(&config).await {
                        continue;
                    }

                    self.queue_notification(ForwardNotification::Disconnected {
                        connection_id: config.id,
                        connection_name: config.name.clone(),
                    });

                    if config.auto_reconnect && config.is_enabled {
                        debug!(connection = %config.id, "connection lost, reconnecting");
                        self.restart_internal(config.id, false);
                    } else {
                        self.update_state(config.id, |s| {
                            s.tunnel_status = ForwardStatus::Error;
                            s.relay_status = ForwardStatus::Disconnected;
                            s.last_error = Some("connection lost".to_string());
                        });
                    }
                }
                ForwardStatus::Error => {
                    // Retry cadence equals the tick interval; no backoff.
                    if config.auto_reconnect && config.is_enabled {
                        debug!(connection = %config.id, "retrying errored connection");
                        self.restart_internal(config.id, false);
                    }
                }
                ForwardStatus::Disconnected | ForwardStatus::Connecting => {}
            }
        }
    }

    async fn check_health(&self, config: &ConnectionConfig) -> bool {
        if self.supervisor.has_recent_error(config.id) {
            return false;
        }

        match config.spawn_mode {
            SpawnMode::EphemeralDirectExec => {
                self.supervisor.is_running(config.id, ProcessRole::Relay)
                    && self.supervisor.is_port_open(config.effective_port()).await
            }
            SpawnMode::SimpleRelay => {
                if !self.supervisor.is_running(config.id, ProcessRole::Tunnel)
                    || !self.supervisor.is_port_open(config.local_port).await
                {
                    return false;
                }
                match config.proxy_port {
                    Some(proxy_port) => {
                        self.supervisor.is_running(config.id, ProcessRole::Relay)
                            && self.supervisor.is_port_open(proxy_port).await
                    }
                    None => true,
                }
            }
        }
    }

    /// Applies classified output accumulated since the last tick.
    async fn drain_events(self: &Arc<Self>) {
        let mut rx = self.events.lock().await;
        while let Ok(event) = rx.try_recv() {
            let id = event.connection_id;
            let Some(config) = self.connection(id) else { continue };
            if self.state(id).map(|s| s.is_intentionally_stopped).unwrap_or(true) {
                continue;
            }

            match event.class {
                LineClass::Normal => {}
                LineClass::ErrorLine => {
                    self.update_state(id, |s| {
                        match event.role {
                            ProcessRole::Tunnel => s.tunnel_status = ForwardStatus::Error,
                            ProcessRole::Relay => s.relay_status = ForwardStatus::Error,
                        }
                        s.last_error = Some(event.line.clone());
                    });
                    self.queue_notification(ForwardNotification::Error {
                        connection_id: id,
                        connection_name: config.name.clone(),
                        message: event.line.clone(),
                    });
                }
                LineClass::PortConflict(port) => {
                    // Clear the holder and retry once; a second conflict for
                    // the same attempt stays an error.
                    let first_conflict = self.inner.lock().conflict_retried.insert(id);
                    if first_conflict {
                        debug!(connection = %id, port, "port conflict, resolving and retrying");
                        let orch = Arc::clone(self);
                        tokio::spawn(async move {
                            orch.resolver.resolve_port(port).await;
                            orch.restart_internal(id, false);
                        });
                    } else {
                        let error = ForwardError::PortInUse(port);
                        self.update_state(id, |s| {
                            s.tunnel_status = ForwardStatus::Error;
                            s.last_error = Some(error.to_string());
                        });
                        self.queue_notification(ForwardNotification::Error {
                            connection_id: id,
                            connection_name: config.name.clone(),
                            message: error.to_string(),
                        });
                    }
                }
            }
        }
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    /// Forced stop-then-start on the connection's worker queue. Does nothing
    /// for intentionally stopped connections unless `clear_intentional`.
    fn restart_internal(self: &Arc<Self>, id: Uuid, clear_intentional: bool) {
        let (config, epoch) = {
            let mut inner = self.inner.lock();
            let Some(config) = inner.configs.iter().find(|c| c.id == id).cloned() else {
                return;
            };

            let state = inner
                .states
                .entry(id)
                .or_insert_with(|| ConnectionState::new(id));
            if state.is_intentionally_stopped && !clear_intentional {
                return;
            }
            state.tunnel_status = ForwardStatus::Connecting;
            state.relay_status = ForwardStatus::Disconnected;
            state.last_error = None;
            state.is_intentionally_stopped = false;
            // Only a user-initiated restart re-arms the conflict retry;
            // clearing it here would let the retry erase its own guard.
            if clear_intentional {
                inner.conflict_retried.remove(&id);
            }
            let epoch = bump_epoch(&mut inner, id);
            (config, epoch)
        };

        self.ensure_monitor();
        let worker = self.ensure_worker(id);
        let _ = worker.send(ConnOp::Kill);
        let _ = worker.send(ConnOp::Start { config, epoch });
    }

    fn update_state<F: FnOnce(&mut ConnectionState)>(&self, id: Uuid, f: F) {
        let mut inner = self.inner.lock();
        let state = inner
            .states
            .entry(id)
            .or_insert_with(|| ConnectionState::new(id));
        f(state);
    }

    fn epoch_current(&self, id: Uuid, epoch: u64) -> bool {
        self.inner.lock().epochs.get(&id) == Some(&epoch)
    }

    /// Returns the connection's worker sender, spawning the worker on first
    /// use. The worker applies ops strictly in the order they were queued.
    fn ensure_worker(self: &Arc<Self>, id: Uuid) -> UnboundedSender<ConnOp> {
        let mut inner = self.inner.lock();
        if let Some(tx) = inner.workers.get(&id) {
            return tx.clone();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        inner.workers.insert(id, tx.clone());
        drop(inner);

        let weak = Arc::downgrade(self);
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    ConnOp::Kill => supervisor.kill_processes(id).await,
                    ConnOp::Start { config, epoch } => {
                        let Some(orch) = weak.upgrade() else { break };
                        orch.run_start_attempt(config, epoch).await;
                    }
                }
            }
        });
        tx
    }
}

fn bump_epoch(inner: &mut Inner, id: Uuid) -> u64 {
    let epoch = inner.epochs.entry(id).or_insert(0);
    *epoch += 1;
    *epoch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use async_trait::async_trait;
    use tempfile::{tempdir, TempDir};

    /// In-memory supervisor: "processes" are entries in a set, "ports" open
    /// whenever their process is alive.
    #[derive(Default)]
    struct MockSupervisor {
        running: Mutex<HashSet<(Uuid, ProcessRole)>>,
        open_ports: Mutex<HashSet<u16>>,
        ports_by_id: Mutex<HashMap<Uuid, Vec<u16>>>,
        log: Mutex<Vec<(Uuid, &'static str)>>,
    }

    impl MockSupervisor {
        fn register(&self, id: Uuid, role: ProcessRole, port: u16, op: &'static str) {
            self.running.lock().insert((id, role));
            self.open_ports.lock().insert(port);
            self.ports_by_id.lock().entry(id).or_default().push(port);
            self.log.lock().push((id, op));
        }

        /// Simulates the processes dying on their own.
        fn die(&self, id: Uuid) {
            self.running.lock().retain(|(pid, _)| *pid != id);
            if let Some(ports) = self.ports_by_id.lock().remove(&id) {
                let mut open = self.open_ports.lock();
                for port in ports {
                    open.remove(&port);
                }
            }
        }

        fn ops_for(&self, id: Uuid) -> Vec<&'static str> {
            self.log
                .lock()
                .iter()
                .filter(|(lid, _)| *lid == id)
                .map(|(_, op)| *op)
                .collect()
        }

        fn tracked_count(&self) -> usize {
            self.running.lock().len()
        }
    }

    #[async_trait]
    impl Supervise for MockSupervisor {
        async fn start_tunnel(
            &self,
            id: Uuid,
            _namespace: &str,
            _service: &str,
            local_port: u16,
            _remote_port: u16,
        ) -> Result<()> {
            self.register(id, ProcessRole::Tunnel, local_port, "start_tunnel");
            Ok(())
        }

        async fn start_relay(&self, id: Uuid, external_port: u16, _internal_port: u16) -> Result<()> {
            self.register(id, ProcessRole::Relay, external_port, "start_relay");
            Ok(())
        }

        async fn start_direct_exec_relay(
            &self,
            id: Uuid,
            _namespace: &str,
            _service: &str,
            external_port: u16,
            _remote_port: u16,
        ) -> Result<()> {
            self.register(id, ProcessRole::Relay, external_port, "start_direct_exec");
            Ok(())
        }

        async fn kill_processes(&self, id: Uuid) {
            self.log.lock().push((id, "kill"));
            self.die(id);
        }

        fn is_running(&self, id: Uuid, role: ProcessRole) -> bool {
            self.running.lock().contains(&(id, role))
        }

        fn has_recent_error(&self, _id: Uuid) -> bool {
            false
        }

        async fn kill_all_managed(&self) {
            let ids: Vec<Uuid> = self.ports_by_id.lock().keys().copied().collect();
            for id in ids {
                self.die(id);
            }
        }

        async fn is_port_open(&self, port: u16) -> bool {
            self.open_ports.lock().contains(&port)
        }
    }

    struct Fixture {
        orch: Arc<ForwardOrchestrator>,
        mock: Arc<MockSupervisor>,
        settings: Arc<SettingsStore>,
        events: UnboundedSender<SupervisorEvent>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockSupervisor::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let store = Arc::new(ForwardStore::with_path(dir.path().join("forwards.json")));
        let settings = Arc::new(SettingsStore::with_path(dir.path().join("settings.json")));

        let orch = ForwardOrchestrator::with_tuning(
            Arc::clone(&mock) as Arc<dyn Supervise>,
            events_rx,
            store,
            Arc::clone(&settings),
            OrchestratorTuning {
                tunnel_stabilization: Duration::from_millis(10),
                relay_stabilization: Duration::from_millis(10),
                monitor_interval: Some(Duration::from_millis(40)),
            },
        );

        Fixture {
            orch,
            mock,
            settings,
            events: events_tx,
            _dir: dir,
        }
    }

    fn simple_config(name: &str, local_port: u16) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(
            name.to_string(),
            "default".to_string(),
            format!("{}-svc", name),
            local_port,
            80,
        );
        config.spawn_mode = SpawnMode::SimpleRelay;
        config
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_start_transitions_to_connected() {
        let f = fixture();
        let config = simple_config("api", 8080);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        assert_eq!(f.orch.state(id).unwrap().tunnel_status, ForwardStatus::Disconnected);

        f.orch.start(id);
        assert_eq!(f.orch.state(id).unwrap().tunnel_status, ForwardStatus::Connecting);

        settle().await;
        let state = f.orch.state(id).unwrap();
        assert_eq!(state.tunnel_status, ForwardStatus::Connected);
        assert!(f.orch.all_connected());
        assert_eq!(f.orch.connected_count(), 1);
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_start_then_immediate_stop_leaves_nothing() {
        let f = fixture();
        let config = simple_config("api", 8081);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        f.orch.stop(id);
        settle().await;

        let state = f.orch.state(id).unwrap();
        assert_eq!(state.tunnel_status, ForwardStatus::Disconnected);
        assert_eq!(state.relay_status, ForwardStatus::Disconnected);
        assert!(!f.mock.is_running(id, ProcessRole::Tunnel));
        assert!(!f.mock.is_running(id, ProcessRole::Relay));
        assert_eq!(f.mock.tracked_count(), 0);
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let f = fixture();
        let config = simple_config("api", 8082);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        settle().await;

        f.orch.stop(id);
        let first = f.orch.state(id).unwrap();
        f.orch.stop(id);
        let second = f.orch.state(id).unwrap();

        assert_eq!(first.tunnel_status, ForwardStatus::Disconnected);
        assert_eq!(second.tunnel_status, ForwardStatus::Disconnected);
        assert!(second.is_intentionally_stopped);
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_auto_reconnect_after_unintentional_death() {
        let f = fixture();
        let config = simple_config("api", 8083);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        settle().await;
        assert_eq!(f.orch.state(id).unwrap().tunnel_status, ForwardStatus::Connected);

        f.mock.die(id);
        settle().await;

        // The monitor must have driven it through Connecting back to Connected.
        assert_eq!(f.orch.state(id).unwrap().tunnel_status, ForwardStatus::Connected);
        let starts = f
            .mock
            .ops_for(id)
            .iter()
            .filter(|op| **op == "start_tunnel")
            .count();
        assert!(starts >= 2, "expected a reconnect start, saw {} starts", starts);
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_no_reconnect_when_auto_reconnect_disabled() {
        let f = fixture();
        let mut config = simple_config("api", 8084);
        config.auto_reconnect = false;
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        settle().await;

        f.mock.die(id);
        settle().await;

        let state = f.orch.state(id).unwrap();
        assert_eq!(state.tunnel_status, ForwardStatus::Error);
        assert!(!state.is_intentionally_stopped);
        assert_eq!(state.last_error.as_deref(), Some("connection lost"));
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_update_running_connection_stops_once_starts_once() {
        let f = fixture();
        let config = simple_config("api", 8085);
        let id = config.id;
        f.orch.add_connection(config.clone()).await.unwrap();

        f.orch.start(id);
        settle().await;
        assert_eq!(f.mock.ops_for(id), vec!["start_tunnel"]);

        let mut updated = config;
        updated.remote_port = 443;
        f.orch.update_connection(updated.clone()).await.unwrap();
        settle().await;

        assert_eq!(f.mock.ops_for(id), vec!["start_tunnel", "kill", "start_tunnel"]);
        assert_eq!(f.orch.state(id).unwrap().tunnel_status, ForwardStatus::Connected);
        assert_eq!(f.orch.connection(id).unwrap().remote_port, 443);
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_stop_all_halts_everything() {
        let f = fixture();
        let mut ids = Vec::new();
        for (i, name) in ["api", "db", "cache"].iter().enumerate() {
            let config = simple_config(name, 8090 + i as u16);
            ids.push(config.id);
            f.orch.add_connection(config).await.unwrap();
        }

        f.orch.start_all();
        settle().await;
        assert_eq!(f.orch.connected_count(), 3);
        assert!(f.orch.monitor_running());

        f.orch.stop_all();
        settle().await;

        for id in ids {
            assert_eq!(f.orch.state(id).unwrap().tunnel_status, ForwardStatus::Disconnected);
        }
        assert_eq!(f.mock.tracked_count(), 0);
        assert!(!f.orch.monitor_running());
    }

    #[tokio::test]
    async fn test_relay_required_for_fully_connected() {
        let f = fixture();
        let mut config = simple_config("api", 8095);
        config.proxy_port = Some(9095);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        settle().await;

        let state = f.orch.state(id).unwrap();
        assert_eq!(state.tunnel_status, ForwardStatus::Connected);
        assert_eq!(state.relay_status, ForwardStatus::Connected);
        assert!(f.orch.all_connected());
        assert!(f.mock.ops_for(id).contains(&"start_relay"));
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_direct_exec_marks_both_statuses() {
        let f = fixture();
        let mut config = simple_config("api", 8096);
        config.spawn_mode = SpawnMode::EphemeralDirectExec;
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        settle().await;

        let state = f.orch.state(id).unwrap();
        assert_eq!(state.tunnel_status, ForwardStatus::Connected);
        assert_eq!(state.relay_status, ForwardStatus::Connected);
        assert_eq!(f.mock.ops_for(id), vec!["start_direct_exec"]);
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_error_line_event_surfaces_as_error_status() {
        let f = fixture();
        let config = simple_config("api", 8097);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        settle().await;

        f.events
            .send(SupervisorEvent {
                connection_id: id,
                role: ProcessRole::Tunnel,
                line: "lost connection to pod".to_string(),
                class: LineClass::ErrorLine,
            })
            .unwrap();
        settle().await;

        // The drained error flips status; with auto_reconnect on, the next
        // tick retries, so either the error or the recovery may be visible.
        let notifications = f.orch.take_pending_notifications();
        assert!(notifications
            .iter()
            .any(|n| matches!(n, ForwardNotification::Error { message, .. } if message.contains("lost connection"))));
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_port_conflict_event_triggers_single_retry() {
        let f = fixture();
        // auto_reconnect off so only the conflict path itself produces starts.
        let mut config = simple_config("api", 8098);
        config.auto_reconnect = false;
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        let conflict = || SupervisorEvent {
            connection_id: id,
            role: ProcessRole::Tunnel,
            line: "listen tcp4 127.0.0.1:8098: bind: address already in use".to_string(),
            class: LineClass::PortConflict(8098),
        };
        let starts = |f: &Fixture| {
            f.mock
                .ops_for(id)
                .iter()
                .filter(|op| **op == "start_tunnel")
                .count()
        };

        f.orch.start(id);
        settle().await;
        let starts_before = starts(&f);

        f.events.send(conflict()).unwrap();
        settle().await;
        settle().await;
        assert_eq!(starts(&f), starts_before + 1);

        // A second conflict must not resolve-and-retry again: the retry does
        // not re-arm its own guard, so it lands as an error instead.
        f.events.send(conflict()).unwrap();
        settle().await;
        settle().await;

        assert_eq!(starts(&f), starts_before + 1);
        let state = f.orch.state(id).unwrap();
        assert_eq!(state.tunnel_status, ForwardStatus::Error);
        assert_eq!(
            state.last_error.as_deref(),
            Some("port 8098 is already in use")
        );
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_remove_connection_mid_start_cleans_up() {
        let f = fixture();
        let config = simple_config("api", 8099);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        f.orch.remove_connection(id).await.unwrap();
        settle().await;

        assert!(f.orch.state(id).is_none());
        assert!(f.orch.connection(id).is_none());
        assert_eq!(f.mock.tracked_count(), 0);
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_intentional_stop_suppresses_reconnect() {
        let f = fixture();
        let config = simple_config("api", 8100);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        settle().await;
        f.orch.stop(id);
        settle().await;
        settle().await;

        // Monitor keeps running until stop_all, but must not resurrect an
        // intentionally stopped connection.
        let state = f.orch.state(id).unwrap();
        assert_eq!(state.tunnel_status, ForwardStatus::Disconnected);
        assert!(state.is_intentionally_stopped);
        let starts = f
            .mock
            .ops_for(id)
            .iter()
            .filter(|op| **op == "start_tunnel")
            .count();
        assert_eq!(starts, 1);
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_auto_start_honors_setting() {
        let f = fixture();
        let config = simple_config("api", 8101);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.settings
            .save(&Settings {
                auto_start: false,
                ..Settings::default()
            })
            .await
            .unwrap();
        f.orch.run_auto_start();
        settle().await;
        assert_eq!(f.mock.ops_for(id), Vec::<&str>::new());

        f.settings.save(&Settings::default()).await.unwrap();
        f.orch.run_auto_start();
        settle().await;
        assert_eq!(f.orch.state(id).unwrap().tunnel_status, ForwardStatus::Connected);
        f.orch.stop_all();
    }

    #[tokio::test]
    async fn test_notifications_suppressed_by_setting() {
        let f = fixture();
        f.settings
            .save(&Settings {
                show_notifications: false,
                ..Settings::default()
            })
            .await
            .unwrap();

        let config = simple_config("api", 8102);
        let id = config.id;
        f.orch.add_connection(config).await.unwrap();

        f.orch.start(id);
        settle().await;
        assert_eq!(f.orch.state(id).unwrap().tunnel_status, ForwardStatus::Connected);
        assert!(!f.orch.has_pending_notifications());
        f.orch.stop_all();
    }
}

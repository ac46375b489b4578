//! Supervision of kubectl port-forward and socat relay processes.
//!
//! The supervisor is the only owner of spawned helper processes. Each process
//! gets a background reader task that classifies its output line by line and
//! forwards the result as [`SupervisorEvent`]s on a channel the orchestrator
//! drains.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::classify::{classify, LineClass};
use super::errors::{ForwardError, Result};
use super::models::ProcessRole;

/// Settle time after the pkill sweep in [`ProcessSupervisor::kill_all_managed`].
const KILL_ALL_SETTLE: Duration = Duration::from_millis(500);

/// Time window for considering an output error "recent".
const RECENT_ERROR_WINDOW: Duration = Duration::from_secs(10);

/// Connect timeout for local port liveness probes.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Validated paths to the helper binaries, supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct HelperPaths {
    pub kubectl: Option<PathBuf>,
    pub socat: Option<PathBuf>,
}

impl HelperPaths {
    pub fn new(kubectl: Option<PathBuf>, socat: Option<PathBuf>) -> Self {
        Self { kubectl, socat }
    }

    fn kubectl(&self) -> Result<&PathBuf> {
        self.kubectl
            .as_ref()
            .ok_or(ForwardError::DependencyMissing("kubectl"))
    }

    fn socat(&self) -> Result<&PathBuf> {
        self.socat
            .as_ref()
            .ok_or(ForwardError::DependencyMissing("socat"))
    }
}

/// One classified line of helper output.
#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub connection_id: Uuid,
    pub role: ProcessRole,
    pub line: String,
    pub class: LineClass,
}

/// A spawned helper process and its output-reader task.
struct ManagedProcess {
    child: Child,
    reader_cancel: CancellationToken,
}

/// The operations the orchestrator needs from a supervisor.
///
/// A trait seam so the orchestrator can be driven by a mock in tests.
#[async_trait]
pub trait Supervise: Send + Sync {
    /// Spawns kubectl port-forward for `service:remote_port` bound to
    /// `local_port` on loopback.
    async fn start_tunnel(
        &self,
        id: Uuid,
        namespace: &str,
        service: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<()>;

    /// Spawns a socat relay listening on `external_port`, forwarding each
    /// accepted connection to `internal_port` on loopback.
    async fn start_relay(&self, id: Uuid, external_port: u16, internal_port: u16) -> Result<()>;

    /// Spawns the direct-exec relay: socat EXECs a generated wrapper script
    /// that allocates an ephemeral local port and runs its own tunnel.
    async fn start_direct_exec_relay(
        &self,
        id: Uuid,
        namespace: &str,
        service: &str,
        external_port: u16,
        remote_port: u16,
    ) -> Result<()>;

    /// Terminates every process of a connection. Idempotent.
    async fn kill_processes(&self, id: Uuid);

    /// Whether the given process is currently alive.
    fn is_running(&self, id: Uuid, role: ProcessRole) -> bool;

    /// Whether a connection produced an error line recently.
    fn has_recent_error(&self, id: Uuid) -> bool;

    /// Best-effort system-wide sweep of tunnel/relay processes, tracked or not.
    async fn kill_all_managed(&self);

    /// Whether something accepts connections on the loopback port.
    async fn is_port_open(&self, port: u16) -> bool;
}

/// Owns all helper processes, keyed by connection id and role.
pub struct ProcessSupervisor {
    helpers: HelperPaths,
    processes: Mutex<HashMap<Uuid, HashMap<ProcessRole, ManagedProcess>>>,
    /// Timestamp of the last error-classified output line per connection.
    errors: Arc<Mutex<HashMap<Uuid, Instant>>>,
    events: UnboundedSender<SupervisorEvent>,
}

impl ProcessSupervisor {
    /// Creates a supervisor and the event channel its reader tasks feed.
    pub fn new(helpers: HelperPaths) -> (Self, UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                helpers,
                processes: Mutex::new(HashMap::new()),
                errors: Arc::new(Mutex::new(HashMap::new())),
                events,
            },
            rx,
        )
    }

    fn spawn_helper(&self, program: &Path, args: &[String]) -> std::io::Result<Child> {
        Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Registers a child under (id, role), killing any predecessor of the
    /// same role, and wires up its output reader.
    fn track(&self, id: Uuid, role: ProcessRole, mut child: Child) {
        let cancel = CancellationToken::new();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.spawn_reader(id, role, stdout, stderr, cancel.clone());

        let old = self.processes.lock().entry(id).or_default().insert(
            role,
            ManagedProcess {
                child,
                reader_cancel: cancel,
            },
        );

        if let Some(mut old) = old {
            old.reader_cancel.cancel();
            let _ = old.child.start_kill();
        }
    }

    /// Continuously reads a process's stdout/stderr, classifying and
    /// forwarding every non-empty line. Ends when both streams are exhausted
    /// (process exited) or the token is cancelled.
    fn spawn_reader(
        &self,
        id: Uuid,
        role: ProcessRole,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        cancel: CancellationToken,
    ) {
        let events = self.events.clone();
        let errors = Arc::clone(&self.errors);

        tokio::spawn(async move {
            let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
            let mut err_lines = stderr.map(|s| BufReader::new(s).lines());

            loop {
                let out_open = out_lines.is_some();
                let err_open = err_lines.is_some();
                if !out_open && !err_open {
                    break;
                }

                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = async { out_lines.as_mut().unwrap().next_line().await }, if out_open => {
                        match line {
                            Ok(Some(l)) => Some(l),
                            _ => {
                                out_lines = None;
                                None
                            }
                        }
                    }
                    line = async { err_lines.as_mut().unwrap().next_line().await }, if err_open => {
                        match line {
                            Ok(Some(l)) => Some(l),
                            _ => {
                                err_lines = None;
                                None
                            }
                        }
                    }
                };

                let Some(line) = line else { continue };
                if line.trim().is_empty() {
                    continue;
                }

                let class = classify(&line);
                debug!(connection = %id, role = role.as_str(), ?class, "{}", line);

                if class != LineClass::Normal {
                    errors.lock().insert(id, Instant::now());
                }

                // Receiver gone means the orchestrator shut down; stop reading.
                if events
                    .send(SupervisorEvent {
                        connection_id: id,
                        role,
                        line,
                        class,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    fn wrapper_script_path(id: Uuid) -> PathBuf {
        std::env::temp_dir().join(format!("pb-wrapper-{}.sh", id))
    }

    /// Clears the error stamp for a connection.
    pub fn clear_error(&self, id: Uuid) {
        self.errors.lock().remove(&id);
    }
}

#[async_trait]
impl Supervise for ProcessSupervisor {
    async fn start_tunnel(
        &self,
        id: Uuid,
        namespace: &str,
        service: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<()> {
        let kubectl = self.helpers.kubectl()?;

        let args = vec![
            "port-forward".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            format!("svc/{}", service),
            format!("{}:{}", local_port, remote_port),
            "--address=127.0.0.1".to_string(),
        ];

        let child = self
            .spawn_helper(kubectl, &args)
            .map_err(|e| ForwardError::SpawnFailure {
                helper: "kubectl",
                reason: e.to_string(),
            })?;

        self.track(id, ProcessRole::Tunnel, child);
        Ok(())
    }

    async fn start_relay(&self, id: Uuid, external_port: u16, internal_port: u16) -> Result<()> {
        let socat = self.helpers.socat()?;

        let args = vec![
            format!("TCP-LISTEN:{},fork,reuseaddr", external_port),
            format!("TCP:127.0.0.1:{}", internal_port),
        ];

        let child = self
            .spawn_helper(socat, &args)
            .map_err(|e| ForwardError::SpawnFailure {
                helper: "socat",
                reason: e.to_string(),
            })?;

        self.track(id, ProcessRole::Relay, child);
        Ok(())
    }

    async fn start_direct_exec_relay(
        &self,
        id: Uuid,
        namespace: &str,
        service: &str,
        external_port: u16,
        remote_port: u16,
    ) -> Result<()> {
        let kubectl = self.helpers.kubectl()?.clone();
        let socat = self.helpers.socat()?.clone();

        let script = wrapper_script(&kubectl, &socat, namespace, service, remote_port);
        let script_path = Self::wrapper_script_path(id);

        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| ForwardError::SpawnFailure {
                helper: "socat",
                reason: format!("failed to write wrapper script: {}", e),
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| ForwardError::SpawnFailure {
                    helper: "socat",
                    reason: format!("failed to mark wrapper script executable: {}", e),
                })?;
        }

        let args = vec![
            format!("TCP-LISTEN:{},fork,reuseaddr", external_port),
            format!("EXEC:{}", script_path.display()),
        ];

        let child = self
            .spawn_helper(&socat, &args)
            .map_err(|e| ForwardError::SpawnFailure {
                helper: "socat",
                reason: e.to_string(),
            })?;

        // Only the outer socat is tracked; the wrapper script owns the inner
        // kubectl and kills it through its exit trap.
        self.track(id, ProcessRole::Relay, child);
        Ok(())
    }

    async fn kill_processes(&self, id: Uuid) {
        let removed = self.processes.lock().remove(&id);

        if let Some(procs) = removed {
            for (role, mut managed) in procs {
                managed.reader_cancel.cancel();
                let _ = managed.child.start_kill();
                // Reap to avoid zombies.
                let _ = managed.child.wait().await;
                debug!(connection = %id, role = role.as_str(), "killed process");
            }
        }

        // The wrapper script forks per accepted connection; sweep those too.
        let script_path = Self::wrapper_script_path(id);
        let _ = Command::new("pkill")
            .args(["-f", &script_path.display().to_string()])
            .status()
            .await;
        let _ = tokio::fs::remove_file(&script_path).await;

        self.clear_error(id);
    }

    fn is_running(&self, id: Uuid, role: ProcessRole) -> bool {
        let mut processes = self.processes.lock();

        let Some(procs) = processes.get_mut(&id) else {
            return false;
        };
        let Some(managed) = procs.get_mut(&role) else {
            return false;
        };

        match managed.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => {
                // Exited; drop the handle so the map reflects reality.
                if let Some(managed) = procs.remove(&role) {
                    managed.reader_cancel.cancel();
                }
                false
            }
        }
    }

    fn has_recent_error(&self, id: Uuid) -> bool {
        self.errors
            .lock()
            .get(&id)
            .map(|t| t.elapsed() < RECENT_ERROR_WINDOW)
            .unwrap_or(false)
    }

    async fn kill_all_managed(&self) {
        warn!("force-killing all tunnel and relay processes");

        let _ = Command::new("pkill")
            .args(["-9", "-f", "kubectl.*port-forward"])
            .status()
            .await;
        let _ = Command::new("pkill")
            .args(["-9", "-f", "socat.*TCP-LISTEN"])
            .status()
            .await;
        let _ = Command::new("pkill")
            .args(["-f", "pb-wrapper-"])
            .status()
            .await;

        tokio::time::sleep(KILL_ALL_SETTLE).await;

        let drained: Vec<ManagedProcess> = {
            let mut processes = self.processes.lock();
            processes
                .drain()
                .flat_map(|(_, procs)| procs.into_values())
                .collect()
        };
        for mut managed in drained {
            managed.reader_cancel.cancel();
            let _ = managed.child.start_kill();
            let _ = managed.child.wait().await;
        }
        self.errors.lock().clear();

        // Sweep leftover wrapper scripts, including ones from earlier runs.
        if let Ok(mut entries) = tokio::fs::read_dir(std::env::temp_dir()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let is_wrapper = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("pb-wrapper-"))
                    .unwrap_or(false);
                if is_wrapper {
                    let _ = tokio::fs::remove_file(path).await;
                }
            }
        }
    }

    async fn is_port_open(&self, port: u16) -> bool {
        tokio::time::timeout(
            PORT_PROBE_TIMEOUT,
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }
}

/// Generates the direct-exec wrapper script.
///
/// The script picks an ephemeral local port from its own pid, probes upward
/// until the port is free, backgrounds kubectl port-forward on it, waits
/// (bounded) for the port to accept connections, and execs socat piping its
/// standard streams to the tunnel. The exit trap tears the tunnel down with it.
fn wrapper_script(
    kubectl: &Path,
    socat: &Path,
    namespace: &str,
    service: &str,
    remote_port: u16,
) -> String {
    format!(
        r#"#!/bin/bash
PORT=$((30000 + ($$ % 30000)))
while /usr/bin/nc -z 127.0.0.1 $PORT 2>/dev/null; do
    PORT=$((PORT + 1))
done
{kubectl} port-forward -n {namespace} svc/{service} $PORT:{remote_port} --address=127.0.0.1 >/dev/null 2>&1 &
KPID=$!
trap "kill $KPID 2>/dev/null" EXIT
for i in 1 2 3 4 5 6 7 8 9 10; do
    if /usr/bin/nc -z 127.0.0.1 $PORT 2>/dev/null; then break; fi
    sleep 0.5
done
{socat} - TCP:127.0.0.1:$PORT
"#,
        kubectl = kubectl.display(),
        socat = socat.display(),
        namespace = namespace,
        service = service,
        remote_port = remote_port
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_helpers() -> HelperPaths {
        HelperPaths::new(Some(PathBuf::from("/bin/echo")), Some(PathBuf::from("/bin/echo")))
    }

    #[test]
    fn test_wrapper_script_content() {
        let script = wrapper_script(
            &PathBuf::from("/usr/bin/kubectl"),
            &PathBuf::from("/usr/bin/socat"),
            "default",
            "my-service",
            80,
        );

        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("/usr/bin/kubectl port-forward"));
        assert!(script.contains("-n default"));
        assert!(script.contains("svc/my-service"));
        assert!(script.contains(":80"));
        assert!(script.contains("trap"));
        assert!(script.contains("/usr/bin/socat - TCP:127.0.0.1:$PORT"));
    }

    #[tokio::test]
    async fn test_missing_helper_is_dependency_error() {
        let (supervisor, _rx) = ProcessSupervisor::new(HelperPaths::default());
        let result = supervisor
            .start_tunnel(Uuid::new_v4(), "default", "svc", 8080, 80)
            .await;
        assert!(matches!(result, Err(ForwardError::DependencyMissing("kubectl"))));
    }

    #[tokio::test]
    async fn test_kill_unknown_id_is_idempotent() {
        let (supervisor, _rx) = ProcessSupervisor::new(echo_helpers());
        let id = Uuid::new_v4();
        supervisor.kill_processes(id).await;
        supervisor.kill_processes(id).await;
        assert!(!supervisor.is_running(id, ProcessRole::Tunnel));
    }

    #[tokio::test]
    async fn test_tunnel_output_is_streamed_and_classified() {
        // /bin/echo stands in for kubectl: it prints its args and exits, so
        // the reader task must surface exactly that line as Normal output.
        let (supervisor, mut rx) = ProcessSupervisor::new(echo_helpers());
        let id = Uuid::new_v4();

        supervisor
            .start_tunnel(id, "default", "api-svc", 8080, 80)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("reader task produced no event")
            .expect("event channel closed");

        assert_eq!(event.connection_id, id);
        assert_eq!(event.role, ProcessRole::Tunnel);
        assert_eq!(event.class, LineClass::Normal);
        assert!(event.line.contains("svc/api-svc"));
        assert!(event.line.contains("8080:80"));

        // echo exits on its own; the supervisor must notice.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!supervisor.is_running(id, ProcessRole::Tunnel));

        supervisor.kill_processes(id).await;
    }

    #[tokio::test]
    async fn test_port_probe_closed_port() {
        let (supervisor, _rx) = ProcessSupervisor::new(echo_helpers());
        // Reserved port with nothing listening in any sane test environment.
        assert!(!supervisor.is_port_open(1).await);
    }
}

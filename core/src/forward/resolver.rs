//! Frees local ports held by unrelated processes.
//!
//! When a tunnel or relay cannot bind its local port, the orchestrator asks
//! this resolver to clear the port before retrying. Everything here is
//! best-effort: if the holder survives, the next bind attempt fails again and
//! surfaces as a normal error status.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::sleep;
use tracing::debug;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE_PERIOD: Duration = Duration::from_millis(300);

/// Terminates whatever currently holds a local TCP port.
pub struct ConflictResolver {
    grace_period: Duration,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            grace_period: KILL_GRACE_PERIOD,
        }
    }

    /// Creates a resolver with a custom grace period.
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Terminates every process bound to `port`: SIGTERM first, then SIGKILL
    /// after the grace period for any that are still alive.
    pub async fn resolve_port(&self, port: u16) {
        let pids = match self.pids_on_port(port).await {
            Some(pids) if !pids.is_empty() => pids,
            _ => return,
        };

        debug!(port, ?pids, "resolving port conflict");

        for pid in &pids {
            let _ = signal(*pid, false);
        }

        sleep(self.grace_period).await;

        for pid in pids {
            if is_alive(pid) {
                let _ = signal(pid, true);
            }
        }
    }

    /// Enumerates PIDs bound to a local TCP port via lsof.
    async fn pids_on_port(&self, port: u16) -> Option<Vec<u32>> {
        let output = Command::new("lsof")
            .args(["-ti", &format!("tcp:{}", port)])
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let pids = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|l| l.trim().parse::<u32>().ok())
            .collect();
        Some(pids)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn signal(pid: u32, force: bool) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sig = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    kill(Pid::from_raw(pid as i32), sig).map_err(std::io::Error::from)
}

/// Signal 0 checks existence without delivering anything.
#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn signal(_pid: u32, _force: bool) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "port conflict resolution requires unix",
    ))
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grace_period() {
        let resolver = ConflictResolver::new();
        assert_eq!(resolver.grace_period, Duration::from_millis(300));
    }

    #[test]
    fn test_is_alive_nonexistent() {
        assert!(!is_alive(999_999_999));
    }

    #[tokio::test]
    async fn test_resolve_unused_port_is_noop() {
        // Nothing should be listening here; resolve must simply return.
        let resolver = ConflictResolver::with_grace_period(Duration::from_millis(10));
        resolver.resolve_port(59_999).await;
    }
}

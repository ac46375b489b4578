//! `portbridge list` - show configured connections.

use anyhow::{Context, Result};
use portbridge_core::forward::{ForwardStore, SpawnMode};

pub async fn run(json: bool) -> Result<()> {
    let store = ForwardStore::new().context("failed to locate config directory")?;
    let connections = store
        .get_connections()
        .await
        .context("failed to read connections")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&connections)?);
        return Ok(());
    }

    if connections.is_empty() {
        println!("No connections configured. Add one with `portbridge add`.");
        return Ok(());
    }

    println!(
        "{:<20} {:<16} {:<20} {:<14} {:<8} {:<10} {}",
        "NAME", "NAMESPACE", "SERVICE", "PORTS", "ENABLED", "MODE", "ID"
    );
    for conn in &connections {
        let ports = match conn.proxy_port {
            Some(proxy) => format!("{}:{} ({})", conn.local_port, conn.remote_port, proxy),
            None => format!("{}:{}", conn.local_port, conn.remote_port),
        };
        let mode = match conn.spawn_mode {
            SpawnMode::SimpleRelay => "simple",
            SpawnMode::EphemeralDirectExec => "direct",
        };
        println!(
            "{:<20} {:<16} {:<20} {:<14} {:<8} {:<10} {}",
            conn.name, conn.namespace, conn.service, ports, conn.is_enabled, mode, conn.id
        );
    }

    Ok(())
}

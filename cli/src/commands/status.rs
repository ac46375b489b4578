//! `portbridge status` - probe configured connections.

use std::time::Duration;

use anyhow::{Context, Result};
use portbridge_core::forward::ForwardStore;
use serde_json::json;
use tokio::net::TcpStream;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Whether something accepts connections on the loopback port. The process
/// serving it may belong to another portbridge run; this is a reachability
/// check, not ownership.
async fn port_open(port: u16) -> bool {
    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

pub async fn run(json: bool) -> Result<()> {
    let store = ForwardStore::new().context("failed to locate config directory")?;
    let connections = store
        .get_connections()
        .await
        .context("failed to read connections")?;

    if connections.is_empty() {
        if json {
            println!("[]");
        } else {
            println!("No connections configured.");
        }
        return Ok(());
    }

    let mut rows = Vec::with_capacity(connections.len());
    for conn in &connections {
        let port = conn.effective_port();
        rows.push((conn, port, port_open(port).await));
    }

    if json {
        let items: Vec<_> = rows
            .iter()
            .map(|(conn, port, open)| {
                json!({
                    "id": conn.id,
                    "name": conn.name,
                    "port": port,
                    "reachable": open,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    println!("{:<20} {:<8} {}", "NAME", "PORT", "REACHABLE");
    for (conn, port, open) in rows {
        println!(
            "{:<20} {:<8} {}",
            conn.name,
            port,
            if open { "yes" } else { "no" }
        );
    }
    Ok(())
}

//! `portbridge start` - run connections in the foreground.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use portbridge_core::forward::{ForwardOrchestrator, ForwardStore, ProcessSupervisor};
use portbridge_core::SettingsStore;

use crate::deps;

const NOTIFICATION_POLL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(700);

pub async fn run(connections: Vec<String>) -> Result<()> {
    let store = Arc::new(ForwardStore::new().context("failed to locate config directory")?);
    let settings = Arc::new(SettingsStore::new().context("failed to locate config directory")?);
    if let Err(err) = settings.load().await {
        tracing::warn!(error = %err, "failed to load settings, using defaults");
    }

    let (supervisor, events) = ProcessSupervisor::new(deps::locate_helpers());
    let orchestrator =
        ForwardOrchestrator::new(Arc::new(supervisor), events, store.clone(), settings);

    orchestrator
        .load_connections()
        .await
        .context("failed to load connections")?;

    if connections.is_empty() {
        if orchestrator.connections().is_empty() {
            bail!("no connections configured; add one with `portbridge add`");
        }
        orchestrator.start_all();
        println!("Starting all enabled connections. Press Ctrl-C to stop.");
    } else {
        for key in &connections {
            let conn = super::resolve_connection(&store, key).await?;
            orchestrator.start(conn.id);
            println!("Starting '{}'...", conn.name);
        }
        println!("Press Ctrl-C to stop.");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(NOTIFICATION_POLL) => {
                for notification in orchestrator.take_pending_notifications() {
                    println!("[{}] {}", notification.title(), notification.body());
                }
            }
        }
    }

    println!("Stopping...");
    orchestrator.stop_all();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    Ok(())
}

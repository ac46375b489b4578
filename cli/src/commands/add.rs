//! `portbridge add` - create a new connection.

use anyhow::{bail, Context, Result};
use portbridge_core::forward::{ConnectionConfig, ForwardStore, SpawnMode};

pub struct AddArgs {
    pub name: String,
    pub namespace: String,
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub proxy_port: Option<u16>,
    pub disabled: bool,
    pub no_reconnect: bool,
    pub simple: bool,
}

pub async fn run(args: AddArgs) -> Result<()> {
    if args.name.trim().is_empty() {
        bail!("connection name must not be empty");
    }

    let mut config = ConnectionConfig::new(
        args.name,
        args.namespace,
        args.service,
        args.local_port,
        args.remote_port,
    );
    config.proxy_port = args.proxy_port;
    config.is_enabled = !args.disabled;
    config.auto_reconnect = !args.no_reconnect;
    if args.simple {
        config.spawn_mode = SpawnMode::SimpleRelay;
    }

    let store = ForwardStore::new().context("failed to locate config directory")?;
    store
        .add_connection(config.clone())
        .await
        .context("failed to save connection")?;

    println!("Added '{}' ({})", config.name, config.id);
    Ok(())
}

//! `portbridge remove` - delete a connection.

use anyhow::{Context, Result};
use portbridge_core::forward::ForwardStore;

pub async fn run(key: &str) -> Result<()> {
    let store = ForwardStore::new().context("failed to locate config directory")?;
    let conn = super::resolve_connection(&store, key).await?;

    store
        .remove_connection(conn.id)
        .await
        .context("failed to remove connection")?;

    println!("Removed '{}' ({})", conn.name, conn.id);
    Ok(())
}

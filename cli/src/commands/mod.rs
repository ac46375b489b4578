//! CLI subcommand implementations.

pub mod add;
pub mod config;
pub mod discover;
pub mod list;
pub mod remove;
pub mod start;
pub mod status;

use anyhow::{bail, Context, Result};
use portbridge_core::forward::{ConnectionConfig, ForwardStore};
use uuid::Uuid;

/// Resolve a connection by id or by name.
///
/// Names are matched case-insensitively and must be unambiguous.
pub(crate) async fn resolve_connection(
    store: &ForwardStore,
    key: &str,
) -> Result<ConnectionConfig> {
    let connections = store
        .get_connections()
        .await
        .context("failed to read connections")?;

    if let Ok(id) = Uuid::parse_str(key) {
        if let Some(conn) = connections.iter().find(|c| c.id == id) {
            return Ok(conn.clone());
        }
    }

    let matches: Vec<&ConnectionConfig> = connections
        .iter()
        .filter(|c| c.name.eq_ignore_ascii_case(key))
        .collect();

    match matches.as_slice() {
        [only] => Ok((*only).clone()),
        [] => bail!("no connection named '{key}'"),
        _ => bail!("multiple connections named '{key}'; use the id instead"),
    }
}

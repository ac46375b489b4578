//! Persistence of connection configurations.
//!
//! Connections live in `~/.portbridge/forwards.json`. The orchestrator treats
//! this store as an external collaborator keyed by connection id.

use std::path::PathBuf;

use tokio::fs;
use uuid::Uuid;

use super::errors::{ForwardError, Result};
use super::models::{ConnectionConfig, ForwardsFile};

/// File-backed store of [`ConnectionConfig`]s.
pub struct ForwardStore {
    config_path: PathBuf,
}

impl ForwardStore {
    /// Creates a store at the default path (~/.portbridge/forwards.json).
    pub fn new() -> Result<Self> {
        let config_dir = dirs::home_dir()
            .ok_or_else(|| ForwardError::Store("could not find home directory".to_string()))?
            .join(".portbridge");

        Ok(Self {
            config_path: config_dir.join("forwards.json"),
        })
    }

    /// Creates a store at a custom path.
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Loads the full connection file from disk.
    pub async fn load(&self) -> Result<ForwardsFile> {
        if !self.config_path.exists() {
            return Ok(ForwardsFile::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| ForwardError::Store(format!("failed to read store: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| ForwardError::Store(format!("failed to parse store: {}", e)))
    }

    /// Writes the full connection file atomically (temp file + rename).
    pub async fn save(&self, file: &ForwardsFile) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ForwardError::Store(format!("failed to create store dir: {}", e)))?;
        }

        let temp_path = self.config_path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(file)
            .map_err(|e| ForwardError::Store(format!("failed to serialize store: {}", e)))?;

        fs::write(&temp_path, content)
            .await
            .map_err(|e| ForwardError::Store(format!("failed to write store: {}", e)))?;

        fs::rename(&temp_path, &self.config_path)
            .await
            .map_err(|e| ForwardError::Store(format!("failed to save store: {}", e)))?;

        Ok(())
    }

    /// Returns all stored connections.
    pub async fn get_connections(&self) -> Result<Vec<ConnectionConfig>> {
        Ok(self.load().await?.connections)
    }

    /// Returns a single connection by id.
    pub async fn get_connection(&self, id: Uuid) -> Result<Option<ConnectionConfig>> {
        Ok(self.load().await?.connections.into_iter().find(|c| c.id == id))
    }

    /// Adds a connection; rejects duplicate ids.
    pub async fn add_connection(&self, connection: ConnectionConfig) -> Result<()> {
        let mut file = self.load().await?;

        if file.connections.iter().any(|c| c.id == connection.id) {
            return Err(ForwardError::Store(format!(
                "connection with id {} already exists",
                connection.id
            )));
        }

        file.connections.push(connection);
        self.save(&file).await
    }

    /// Removes a connection by id.
    pub async fn remove_connection(&self, id: Uuid) -> Result<()> {
        let mut file = self.load().await?;
        let original_len = file.connections.len();

        file.connections.retain(|c| c.id != id);

        if file.connections.len() == original_len {
            return Err(ForwardError::ConnectionNotFound(id.to_string()));
        }

        self.save(&file).await
    }

    /// Replaces an existing connection.
    pub async fn update_connection(&self, connection: ConnectionConfig) -> Result<()> {
        let mut file = self.load().await?;

        let Some(existing) = file.connections.iter_mut().find(|c| c.id == connection.id) else {
            return Err(ForwardError::ConnectionNotFound(connection.id.to_string()));
        };

        *existing = connection;
        self.save(&file).await
    }
}

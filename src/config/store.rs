use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads; writers persist to disk first and
/// then swap the cache, so readers never observe an unsaved record.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change notification
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// Whitelist keys whose values changed
    pub fields: Vec<String>,
}

impl ConfigStore {
    /// Open the store, creating a default record if the file is missing
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let config = match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::persist(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// Write the record atomically (temp file + rename)
    async fn persist(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_vec_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get the current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the entire configuration
    pub async fn set(&self, config: AppConfig, changed_fields: Vec<String>) -> Result<()> {
        Self::persist(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            fields: changed_fields,
        });

        Ok(())
    }

    /// Update the configuration with a closure
    ///
    /// Read-modify-write; last writer wins, which is acceptable for
    /// user-initiated configuration changes.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        self.set(config, Vec::new()).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

// # File Config Store
//
// File-based implementation of ConfigStore with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: write to `.tmp`, then rename over the real file
// - Backup: the previous good file is copied to `.backup` before each rename
// - Recovery: a file that fails to parse is replaced from `.backup`
// - Both unreadable: treated as "nothing saved", the device boots from defaults
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "state": {
//     "active": {
//       "primary": { "host": "192.168.1.20", "port": 1883 },
//       "secondary": { "host": "192.168.1.20", "port": 5001 }
//     },
//     "last_applied_digest": 1311768467294899695,
//     "last_applied_at": "2026-01-09T12:00:00Z"
//   }
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::Error;
use crate::device::DeviceConfigState;
use crate::traits::config_store::ConfigStore;

/// State file format version
const STATE_FILE_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct StateFileFormat {
    version: String,
    state: DeviceConfigState,
}

enum Loaded {
    Missing,
    Found(DeviceConfigState),
    Corrupt(String),
}

/// File-based device config store
///
/// # Example
///
/// ```rust,no_run
/// use hostcfg_core::{ConfigStore, FileConfigStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileConfigStore::new("/var/lib/hostcfg/device.json").await?;
///     if let Some(state) = store.load().await? {
///         println!("last applied: {}", state.active.primary);
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    /// Create a store at `path`, creating parent directories if needed
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(path: &Path) -> Result<Loaded, Error> {
        if !path.exists() {
            return Ok(Loaded::Missing);
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::config_store(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let file: StateFileFormat = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => return Ok(Loaded::Corrupt(e.to_string())),
        };

        if file.version != STATE_FILE_VERSION {
            tracing::warn!(
                "State file version mismatch: expected {}, got {}. Attempting to load anyway.",
                STATE_FILE_VERSION,
                file.version
            );
        }

        Ok(Loaded::Found(file.state))
    }

    async fn recover_from_backup(&self, reason: &str) -> Result<Option<DeviceConfigState>, Error> {
        tracing::warn!(
            "State file {} appears corrupted ({}). Attempting recovery from backup.",
            self.path.display(),
            reason
        );

        let backup_path = Self::backup_path(&self.path);
        match Self::read_file(&backup_path).await? {
            Loaded::Found(state) => {
                if let Err(e) = fs::copy(&backup_path, &self.path).await {
                    tracing::error!("Failed to restore state file from backup: {}", e);
                } else {
                    tracing::info!("Restored state file from backup");
                }
                Ok(Some(state))
            }
            Loaded::Missing => {
                tracing::warn!("No backup file found. Booting from defaults.");
                Ok(None)
            }
            Loaded::Corrupt(e) => {
                tracing::error!("Backup also corrupted: {}. Booting from defaults.", e);
                Ok(None)
            }
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self) -> Result<Option<DeviceConfigState>, Error> {
        match Self::read_file(&self.path).await? {
            Loaded::Found(state) => {
                tracing::debug!("Loaded device config from {}", self.path.display());
                Ok(Some(state))
            }
            Loaded::Missing => Ok(None),
            Loaded::Corrupt(reason) => self.recover_from_backup(&reason).await,
        }
    }

    async fn save(&self, state: &DeviceConfigState) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;

        let json = serde_json::to_string_pretty(&StateFileFormat {
            version: STATE_FILE_VERSION.to_string(),
            state: state.clone(),
        })?;

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::config_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await
        {
            tracing::warn!("Failed to create backup: {}", e);
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::config_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("Device config written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ServiceEndpoints;
    use tempfile::tempdir;

    fn state_on(host: &str) -> DeviceConfigState {
        DeviceConfigState::from_defaults(ServiceEndpoints::colocated(host, 1883, 5001))
    }

    #[tokio::test]
    async fn missing_file_loads_nothing() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("nested/device.json"))
            .await
            .unwrap();

        assert!(store.load().await.unwrap().is_none());
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn saved_state_survives_a_new_instance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.json");

        let store = FileConfigStore::new(&path).await.unwrap();
        store.save(&state_on("E")).await.unwrap();

        let reopened = FileConfigStore::new(&path).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), Some(state_on("E")));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn corrupted_file_recovers_previous_state_from_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.json");

        let store = FileConfigStore::new(&path).await.unwrap();
        store.save(&state_on("A")).await.unwrap();
        store.save(&state_on("B")).await.unwrap();
        assert!(FileConfigStore::backup_path(&path).exists());

        fs::write(&path, b"corrupted json data").await.unwrap();

        // The backup holds the state before the last write
        assert_eq!(store.load().await.unwrap(), Some(state_on("A")));

        // And the main file was restored from it
        let content = fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("\"A\""));
    }

    #[tokio::test]
    async fn corrupted_without_backup_boots_from_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.json");
        fs::write(&path, b"{ not json").await.unwrap();

        let store = FileConfigStore::new(&path).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}

//! Configuration Storage
//!
//! Handles reading/writing JSON files under the podctl config directory.
//! Location: ~/.podctl, or `$PODCTL_CONFIG_DIR` when set.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the podctl configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = std::env::var_os("PODCTL_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".podctl"))
        .ok_or(StorageError::NoConfigDir)
}

/// User settings file
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Persisted pod table
pub fn state_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("state.json"))
}

/// Expand a leading `~/` against the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// JSON file store for one document type
pub struct JsonStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            _marker: PhantomData,
        }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load the document from disk.
    /// Returns the default if the file doesn't exist. A corrupted file is
    /// backed up and replaced by the default.
    pub async fn load(&self) -> Result<T, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<T>(&contents) {
                Ok(value) => Ok(value),
                Err(e) => {
                    tracing::warn!("{} is corrupted: {}", self.path.display(), e);
                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted file backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to back up corrupted file: {}", backup_err);
                        }
                    }
                    Ok(T::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save the document to disk (temp file + rename)
    pub async fn save(&self, value: &T) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(value)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Copy the current file to `<name>.bak`
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension("json.bak");
        fs::copy(&self.path, &backup_path).await?;
        Ok(backup_path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        #[serde(default)]
        name: String,
        #[serde(default)]
        count: u32,
    }

    #[tokio::test]
    async fn test_missing_file_yields_default() {
        let dir = tempdir().unwrap();
        let store: JsonStore<Doc> = JsonStore::with_path(dir.path().join("nope.json"));
        assert_eq!(store.load().await.unwrap(), Doc::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = JsonStore::with_path(dir.path().join("nested").join("doc.json"));
        let doc = Doc {
            name: "pod".into(),
            count: 3,
        };
        store.save(&doc).await.unwrap();
        assert_eq!(store.load().await.unwrap(), doc);
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupted_file_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store: JsonStore<Doc> = JsonStore::with_path(path.clone());
        assert_eq!(store.load().await.unwrap(), Doc::default());

        let backup = std::fs::read_to_string(dir.path().join("doc.json.bak")).unwrap();
        assert_eq!(backup, "{ not json");
    }

    #[test]
    fn test_expand_home_leaves_plain_paths() {
        assert_eq!(expand_home(Path::new("/tmp/key")), PathBuf::from("/tmp/key"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/.ssh/id")), home.join(".ssh/id"));
        }
    }
}

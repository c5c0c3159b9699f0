use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use super::{check_version, StorageError, StorageProvider, StoredState};
use crate::identity::{fnv1a, ActorIdentity};

/// Longest path component this provider writes.
const MAX_NAME: usize = 128;
/// Hex digits kept in front of the hash when a component is too long.
const HASHED_PREFIX: usize = 96;

/// Durable provider keeping one JSON file per grain.
///
/// Layout: `<root>/<kind>/<hex(key)>.json`, or
/// `<root>/<provider>/<kind>/<hex(key)>.json` when built with
/// [`for_provider`](Self::for_provider). A component whose hex form would
/// exceed 128 characters is cut to a 96-digit prefix followed by `~` and the
/// 64-bit FNV-1a hash of the full text.
///
/// Writes go to a sibling temp file that is then renamed over the target, so
/// a crash never leaves a torn record behind.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    // Serialises read-check-write sequences across await points.
    lock: Mutex<()>,
}

impl FileStorage {
    /// Store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store of provider `name` in its own directory under `root`, so
    /// several providers can share one root.
    pub fn for_provider(root: impl Into<PathBuf>, name: &str) -> Self {
        Self::new(root.into().join(segment(name)))
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, identity: &ActorIdentity) -> PathBuf {
        self.root
            .join(segment(identity.kind().as_str()))
            .join(format!("{}.json", bounded_hex(&identity.key().to_string())))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<StoredState>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, e)),
        }
    }
}

/// `text` itself when it is a short, plain name, its bounded hex otherwise.
fn segment(text: &str) -> String {
    let plain = !text.is_empty()
        && text.len() <= MAX_NAME
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if plain {
        text.to_string()
    } else {
        bounded_hex(text)
    }
}

fn bounded_hex(text: &str) -> String {
    let full: String = text.bytes().map(|b| format!("{b:02x}")).collect();
    if full.len() <= MAX_NAME {
        return full;
    }
    format!("{}~{:016x}", &full[..HASHED_PREFIX], fnv1a(text.as_bytes()))
}

fn io_error(path: &Path, err: std::io::Error) -> StorageError {
    StorageError::Io(format!("{}: {err}", path.display()))
}

#[async_trait::async_trait(?Send)]
impl StorageProvider for FileStorage {
    async fn read(&self, identity: &ActorIdentity) -> Result<Option<StoredState>, StorageError> {
        let _guard = self.lock.lock().await;
        self.read_record(&self.path_for(identity)).await
    }

    async fn write(
        &self,
        identity: &ActorIdentity,
        data: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(identity);
        let current = self.read_record(&path).await?.map_or(0, |s| s.version);
        check_version(current, expected_version)?;

        let record = StoredState {
            version: current + 1,
            data,
        };
        let bytes =
            serde_json::to_vec(&record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error(dir, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(record.version)
    }

    async fn clear(
        &self,
        identity: &ActorIdentity,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(identity);
        let current = self.read_record(&path).await?.map_or(0, |s| s.version);
        check_version(current, expected_version)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

use std::future::Future;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::Result;

pub const STORAGE_KEY: &str = "heatplant_learning";
pub const STORAGE_VERSION: u64 = 1;

/// Persistence for the versioned learning blob.
///
/// `load` returns the inner `data` payload of a blob written by this storage
/// version, or `None` when nothing usable is stored.
pub trait Storage: Send + Sync {
    fn load(&self) -> impl Future<Output = Result<Option<Value>>> + Send;

    fn save(&self, data: &Value) -> impl Future<Output = Result<()>> + Send;
}

fn envelope(data: &Value) -> Value {
    json!({
        "key": STORAGE_KEY,
        "version": STORAGE_VERSION,
        "data": data,
    })
}

/// Unwrap a stored envelope, rejecting other keys and versions.
fn open_envelope(blob: Value) -> Option<Value> {
    let version = blob.get("version").and_then(|v| v.as_u64());
    if version != Some(STORAGE_VERSION) {
        debug!(?version, "ignoring learning blob with unsupported version");
        return None;
    }
    if blob.get("key").and_then(|v| v.as_str()) != Some(STORAGE_KEY) {
        debug!("ignoring blob with foreign storage key");
        return None;
    }
    match blob {
        Value::Object(mut map) => map.remove("data"),
        _ => None,
    }
}

/// JSON file on disk; writes go through a temporary file and a rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Storage for JsonFileStore {
    async fn load(&self) -> Result<Option<Value>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(blob) => Ok(open_envelope(blob)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "learning store is not valid JSON; starting empty");
                Ok(None)
            }
        }
    }

    async fn save(&self, data: &Value) -> Result<()> {
        let line = serde_json::to_vec_pretty(&envelope(data))?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, line).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Process-local store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: Mutex<Option<Value>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with a raw blob, as if written by an earlier process.
    pub fn with_blob(blob: Value) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
            saves: Mutex::new(0),
        }
    }

    pub fn blob(&self) -> Option<Value> {
        self.blob.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl Storage for MemoryStore {
    async fn load(&self) -> Result<Option<Value>> {
        Ok(self.blob.lock().clone().and_then(open_envelope))
    }

    async fn save(&self, data: &Value) -> Result<()> {
        *self.blob.lock() = Some(envelope(data));
        *self.saves.lock() += 1;
        Ok(())
    }
}

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use snafu::prelude::*;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unsupported storage connection string {connection_string}"))]
    Unsupported { connection_string: String },

    #[snafu(display("Failed to initialize storage at {path}: {source}"))]
    Init {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write storage object {key}: {source}"))]
    Write {
        key: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to delete storage object {key}: {source}"))]
    Delete {
        key: String,
        source: std::io::Error,
    },

    #[snafu(display("Storage probe failed: {source}"))]
    Probe {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Failed to serialize storage payload: {message}"))]
    Serialize { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result of a storage write, reported in the listener response when the
/// `storage` field is returned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageWrite {
    pub path: String,
    pub size: u64,
}

/// The narrow object-store contract this crate consumes: write one object
/// per execution, delete for the compile-time probe.
#[async_trait]
pub trait ObjectStore: Send + Sync + Debug {
    async fn write(&self, key: &str, data: &[u8]) -> Result<StorageWrite>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Filesystem-backed store for `fs://` connection strings.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|_| InitSnafu {
                path: root.display().to_string(),
            })?;
        Ok(Self { root })
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn write(&self, key: &str, data: &[u8]) -> Result<StorageWrite> {
        let path = self.root.join(key);
        tokio::fs::write(&path, data)
            .await
            .with_context(|_| WriteSnafu {
                key: key.to_string(),
            })?;
        Ok(StorageWrite {
            path: path.display().to_string(),
            size: data.len() as u64,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.root.join(key);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|_| DeleteSnafu {
                key: key.to_string(),
            })
    }
}

/// Hands out storage handles memoized by connection string, so listeners
/// sharing a connection string share one handle.
#[derive(Debug, Default)]
pub struct StorageFactory {
    cache: tokio::sync::Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl StorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, connection_string: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut cache = self.cache.lock().await;
        if let Some(store) = cache.get(connection_string) {
            return Ok(store.clone());
        }

        let store: Arc<dyn ObjectStore> = match connection_string.strip_prefix("fs://") {
            Some(root) if root.starts_with('/') => Arc::new(FsStore::new(root).await?),
            _ => {
                return UnsupportedSnafu {
                    connection_string: connection_string.to_string(),
                }
                .fail();
            }
        };

        cache.insert(connection_string.to_string(), store.clone());
        Ok(store)
    }
}

/// Write-and-delete probe run once at listener compile time. A failure
/// here is fatal for startup.
pub async fn probe(store: &dyn ObjectStore) -> Result<()> {
    let key = format!(".magpie-probe-{}", random_suffix(8));
    let run = async {
        store.write(&key, b"probe").await?;
        store.delete(&key).await
    };
    run.await.context(ProbeSnafu)
}

/// Storage object key: `<sanitizedRoute>-<epochMs>[-error]-<rand8>.<ext>`
pub fn storage_key(route: &str, is_error: bool, as_yaml: bool) -> String {
    let sanitized = sanitize_token(route);
    let epoch_ms = chrono::Utc::now().timestamp_millis();
    let error_part = if is_error { "-error" } else { "" };
    let suffix = random_suffix(8);
    let ext = if as_yaml { "yaml" } else { "json" };
    format!("{sanitized}-{epoch_ms}{error_part}-{suffix}.{ext}")
}

/// Serializes the captured payload as JSON or YAML.
pub fn serialize_payload(
    payload: &serde_json::Map<String, serde_json::Value>,
    as_yaml: bool,
) -> Result<Vec<u8>> {
    if as_yaml {
        serde_yaml::to_string(payload)
            .map(String::into_bytes)
            .map_err(|e| Error::Serialize {
                message: e.to_string(),
            })
    } else {
        serde_json::to_vec(payload).map_err(|e| Error::Serialize {
            message: e.to_string(),
        })
    }
}

/// Replaces every non-word character with `_`, for file keys, env var
/// names and storage keys.
pub fn sanitize_token(value: &str) -> String {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r"\W").expect("invalid regex"));
    regex.replace_all(value, "_").to_string()
}

pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

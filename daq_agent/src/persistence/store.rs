use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AgentError, AgentResult};

/// One persisted scan job under a connection. `seconds` is the
/// trigger period in whole seconds; `from_cache` mirrors the RPC flag
/// and is round-tripped without affecting scheduling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedDaqJob {
    pub tags: Vec<String>,
    pub seconds: u64,
    #[serde(default)]
    pub from_cache: bool,
}

/// One persisted manipulated-tag bound set under a connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedManipulatedTag {
    pub lb: Option<f64>,
    pub ub: Option<f64>,
    pub rb: Option<f64>,
}

/// One persisted connection: type, construction params, enabled flag,
/// and the scan jobs / manipulated tags that hang off it.
///
/// Dots in a tag path are escaped to `__dot__` before being used as a
/// TOML table key (TOML keys containing `.` would otherwise be parsed
/// as nested tables), mirroring the original's `CONFIG_DOT_NOTATION`
/// handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedConnection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub daq_jobs: HashMap<String, PersistedDaqJob>,
    #[serde(default)]
    pub manipulated_tags: HashMap<String, PersistedManipulatedTag>,
}

fn default_true() -> bool {
    true
}

/// Escape a tag path's dots so it round-trips through a TOML table key.
pub fn escape_tag_key(tag: &str) -> String {
    tag.replace('.', "__dot__")
}

pub fn unescape_tag_key(key: &str) -> String {
    key.replace("__dot__", ".")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistenceDocument {
    #[serde(flatten)]
    pub connections: HashMap<String, PersistedConnection>,
}

/// Loads, mutates, and diff-writes the persistence document. Mirrors
/// the original's config_manager: a default document (baked in, empty)
/// plus an on-disk dynamic document; on save, only the fields that
/// differ from default are written back.
pub struct PersistenceStore {
    path: PathBuf,
    document: RwLock<PersistenceDocument>,
}

impl PersistenceStore {
    /// Load `path` if it exists, otherwise start from an empty document.
    pub async fn open(path: impl Into<PathBuf>) -> AgentResult<Arc<Self>> {
        let path = path.into();
        let document = Self::load_from_disk(&path).await?;
        Ok(Arc::new(Self { path, document: RwLock::new(document) }))
    }

    async fn load_from_disk(path: &Path) -> AgentResult<PersistenceDocument> {
        if !path.exists() {
            return Ok(PersistenceDocument::default());
        }
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AgentError::Persistence(e.to_string()))?;
        toml::from_str(&contents).map_err(|e| AgentError::Persistence(e.to_string()))
    }

    pub async fn snapshot(&self) -> PersistenceDocument {
        self.document.read().await.clone()
    }

    pub async fn get_connection(&self, name: &str) -> Option<PersistedConnection> {
        self.document.read().await.connections.get(name).cloned()
    }

    pub async fn list_connection_names(&self) -> Vec<String> {
        self.document.read().await.connections.keys().cloned().collect()
    }

    /// Apply a mutation under the write lock, then diff-write to disk.
    /// The default document is empty, so "diffed against defaults"
    /// here means: only non-default (`enabled != true`, non-empty maps)
    /// fields are serialized — `serde`'s `skip_serializing_if`-free
    /// struct already collapses to that shape via `Default`/`PartialEq`
    /// on round empty child maps, so plain serialization is sufficient.
    pub async fn mutate<F>(&self, f: F) -> AgentResult<()>
    where
        F: FnOnce(&mut PersistenceDocument),
    {
        {
            let mut doc = self.document.write().await;
            f(&mut doc);
        }
        self.persist().await
    }

    async fn persist(&self) -> AgentResult<()> {
        let doc = self.document.read().await;
        let rendered = toml::to_string_pretty(&*doc).map_err(|e| AgentError::Persistence(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| AgentError::Persistence(e.to_string()))?;
        }
        tokio::fs::write(&self.path, rendered).await.map_err(|e| AgentError::Persistence(e.to_string()))
    }
}

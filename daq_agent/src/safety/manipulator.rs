use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::ConnectionManager;
use crate::drivers::traits::{TagValue, TagValueRecord};
use crate::error::{AgentError, AgentResult};
use crate::persistence::{escape_tag_key, unescape_tag_key, PersistedManipulatedTag, PersistenceStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct Bound {
    pub lb: Option<f64>,
    pub ub: Option<f64>,
    /// Accepted but never enforced (see DESIGN.md Open Questions).
    pub rb: Option<f64>,
}

/// Guards writes to a fixed allow-list of tags per connection, each
/// with lower/upper bounds. Ported from `safe_manipulator.py`. The
/// allow-list is persistent: every register/unregister writes through
/// to the `manipulated_tags` persistence section, with tag paths
/// dot-escaped the same way connection/job persistence escapes them.
pub struct SafeManipulator {
    connections: Arc<ConnectionManager>,
    persistence: Arc<PersistenceStore>,
    registered: DashMap<String, HashMap<String, Bound>>,
}

impl SafeManipulator {
    /// Build a manipulator with its registered-tag map reloaded from
    /// the persistence document, mirroring `ConnectionManager::restore`.
    pub async fn restore(connections: Arc<ConnectionManager>, persistence: Arc<PersistenceStore>) -> AgentResult<Arc<Self>> {
        let manipulator = Arc::new(Self { connections, persistence, registered: DashMap::new() });

        let doc = manipulator.persistence.snapshot().await;
        for (conn_name, conn) in doc.connections {
            if conn.manipulated_tags.is_empty() {
                continue;
            }
            let mut bounds = HashMap::with_capacity(conn.manipulated_tags.len());
            for (key, persisted) in conn.manipulated_tags {
                bounds.insert(unescape_tag_key(&key), Bound { lb: persisted.lb, ub: persisted.ub, rb: persisted.rb });
            }
            manipulator.registered.insert(conn_name, bounds);
        }
        Ok(manipulator)
    }

    fn require_connection(&self, conn_name: &str) -> AgentResult<()> {
        self.connections.is_connected(conn_name).map(|_| ())
    }

    pub fn list_tags(&self, conn_name: &str) -> AgentResult<Vec<String>> {
        self.require_connection(conn_name)?;
        let mut tags: Vec<String> = self
            .registered
            .get(conn_name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        Ok(tags)
    }

    pub fn list_tags_with_bounds(&self, conn_name: &str) -> AgentResult<HashMap<String, Bound>> {
        self.require_connection(conn_name)?;
        Ok(self.registered.get(conn_name).map(|m| m.clone()).unwrap_or_default())
    }

    pub async fn register_tags(&self, conn_name: &str, tags: HashMap<String, Bound>) -> AgentResult<()> {
        self.require_connection(conn_name)?;

        {
            let mut entry = self.registered.entry(conn_name.to_string()).or_default();
            for (tag, bound) in &tags {
                entry.insert(tag.clone(), *bound);
            }
        }

        self.persistence
            .mutate(|doc| {
                let conn = doc.connections.entry(conn_name.to_string()).or_default();
                for (tag, bound) in &tags {
                    conn.manipulated_tags
                        .insert(escape_tag_key(tag), PersistedManipulatedTag { lb: bound.lb, ub: bound.ub, rb: bound.rb });
                }
            })
            .await
    }

    pub async fn unregister_tags(&self, conn_name: &str, tags: &[String]) -> AgentResult<()> {
        self.require_connection(conn_name)?;

        if let Some(mut entry) = self.registered.get_mut(conn_name) {
            for tag in tags {
                entry.remove(tag);
            }
        }

        self.persistence
            .mutate(|doc| {
                if let Some(conn) = doc.connections.get_mut(conn_name) {
                    for tag in tags {
                        conn.manipulated_tags.remove(&escape_tag_key(tag));
                    }
                }
            })
            .await
    }

    /// Remove every tag registered under `conn_name` (used for cascade
    /// delete when a connection is removed).
    pub async fn unregister_all(&self, conn_name: &str) -> AgentResult<()> {
        self.registered.remove(conn_name);
        self.persistence
            .mutate(|doc| {
                if let Some(conn) = doc.connections.get_mut(conn_name) {
                    conn.manipulated_tags.clear();
                }
            })
            .await
    }

    /// Validate each write against the registration/numeric/lb/ub
    /// chain, then issue a single batched write through the driver.
    pub async fn write_tags(
        &self,
        conn_name: &str,
        values: HashMap<String, TagValue>,
    ) -> AgentResult<HashMap<String, TagValueRecord>> {
        let bounds = self.registered.get(conn_name).map(|m| m.clone()).unwrap_or_default();

        for (tag, value) in &values {
            let bound = bounds.get(tag).ok_or_else(|| AgentError::TagNotRegistered(tag.clone()))?;
            let numeric = value.as_f64().ok_or_else(|| AgentError::TagNotNumeric(tag.clone()))?;

            if let Some(lb) = bound.lb {
                if numeric < lb {
                    return Err(AgentError::BelowLowerBound { tag: tag.clone(), value: numeric, bound: lb });
                }
            }
            if let Some(ub) = bound.ub {
                if numeric > ub {
                    return Err(AgentError::AboveUpperBound { tag: tag.clone(), value: numeric, bound: ub });
                }
            }
        }

        let driver = self.connections.connection(conn_name, true)?;
        driver.write_tag_values(values).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DriverRegistry;

    async fn setup() -> (Arc<ConnectionManager>, Arc<SafeManipulator>) {
        let dir = std::env::temp_dir().join(format!(
            "daq_agent_safety_test_{}",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let persistence = PersistenceStore::open(dir.join("p.toml")).await.unwrap();
        let manager = ConnectionManager::restore(DriverRegistry::with_builtins(), persistence.clone()).await.unwrap();
        manager.create_connection("plant1", "fake", Default::default(), true, false).await.unwrap();
        let manipulator = SafeManipulator::restore(manager.clone(), persistence).await.unwrap();
        (manager, manipulator)
    }

    #[tokio::test]
    async fn write_unregistered_tag_errors() {
        let (_m, manipulator) = setup().await;
        let mut values = HashMap::new();
        values.insert("Static.Int4".to_string(), TagValue::Int(1));
        let err = manipulator.write_tags("plant1", values).await.unwrap_err();
        assert!(matches!(err, AgentError::TagNotRegistered(_)));
    }

    #[tokio::test]
    async fn write_below_lower_bound_errors() {
        let (_m, manipulator) = setup().await;
        let mut tags = HashMap::new();
        tags.insert("Static.Int4".to_string(), Bound { lb: Some(0.0), ub: Some(100.0), rb: None });
        manipulator.register_tags("plant1", tags).await.unwrap();

        let mut values = HashMap::new();
        values.insert("Static.Int4".to_string(), TagValue::Int(-5));
        let err = manipulator.write_tags("plant1", values).await.unwrap_err();
        assert!(matches!(err, AgentError::BelowLowerBound { .. }));
    }

    #[tokio::test]
    async fn write_within_bounds_succeeds() {
        let (_m, manipulator) = setup().await;
        let mut tags = HashMap::new();
        tags.insert("Static.Int4".to_string(), Bound { lb: Some(0.0), ub: Some(100.0), rb: None });
        manipulator.register_tags("plant1", tags).await.unwrap();

        let mut values = HashMap::new();
        values.insert("Static.Int4".to_string(), TagValue::Int(42));
        let result = manipulator.write_tags("plant1", values).await.unwrap();
        assert_eq!(result["Static.Int4"].value, TagValue::Int(42));
    }

    #[tokio::test]
    async fn write_non_numeric_errors() {
        let (_m, manipulator) = setup().await;
        let mut tags = HashMap::new();
        tags.insert("Random.String".to_string(), Bound { lb: None, ub: None, rb: None });
        manipulator.register_tags("plant1", tags).await.unwrap();

        let mut values = HashMap::new();
        values.insert("Random.String".to_string(), TagValue::String("x".to_string()));
        let err = manipulator.write_tags("plant1", values).await.unwrap_err();
        assert!(matches!(err, AgentError::TagNotNumeric(_)));
    }

    #[tokio::test]
    async fn bounds_survive_restore() {
        let dir = std::env::temp_dir().join(format!(
            "daq_agent_safety_restore_test_{}",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let path = dir.join("p.toml");
        let persistence = PersistenceStore::open(&path).await.unwrap();
        let manager = ConnectionManager::restore(DriverRegistry::with_builtins(), persistence.clone()).await.unwrap();
        manager.create_connection("plant1", "fake", Default::default(), true, false).await.unwrap();
        let manipulator = SafeManipulator::restore(manager.clone(), persistence).await.unwrap();

        let mut tags = HashMap::new();
        tags.insert("Static.Float".to_string(), Bound { lb: Some(0.0), ub: Some(100.0), rb: None });
        manipulator.register_tags("plant1", tags).await.unwrap();

        let reloaded_persistence = PersistenceStore::open(&path).await.unwrap();
        let reloaded_manager = ConnectionManager::restore(DriverRegistry::with_builtins(), reloaded_persistence.clone()).await.unwrap();
        let reloaded = SafeManipulator::restore(reloaded_manager, reloaded_persistence).await.unwrap();
        assert_eq!(reloaded.list_tags("plant1").unwrap(), vec!["Static.Float".to_string()]);

        reloaded.unregister_tags("plant1", &["Static.Float".to_string()]).await.unwrap();
        assert!(reloaded.list_tags("plant1").unwrap().is_empty());
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info};

use crate::connection::model::{ConnectionDescriptor, SupportedConnector};
use crate::drivers::traits::Driver;
use crate::drivers::DriverRegistry;
use crate::error::{AgentError, AgentResult};
use crate::persistence::{PersistedConnection, PersistenceStore};

struct ConnectionEntry {
    driver: Arc<dyn Driver>,
    kind: String,
}

/// Owns the live, in-process driver handles and keeps the persistence
/// store in sync. Ported from `connection_manager.py`'s
/// `ConnectionManager`, with the entry_points plugin registry replaced
/// by the explicit [`DriverRegistry`].
pub struct ConnectionManager {
    registry: DriverRegistry,
    persistence: Arc<PersistenceStore>,
    connections: DashMap<String, ConnectionEntry>,
}

impl ConnectionManager {
    /// Recreate every connection recorded in `persistence`, connecting
    /// those marked `enabled`. Failures to enable are logged and
    /// otherwise ignored, matching the original's startup behavior.
    pub async fn restore(registry: DriverRegistry, persistence: Arc<PersistenceStore>) -> AgentResult<Arc<Self>> {
        let manager = Arc::new(Self { registry, persistence, connections: DashMap::new() });

        let doc = manager.persistence.snapshot().await;
        for (name, persisted) in doc.connections {
            if let Err(e) = manager.create_driver_entry(&name, &persisted.kind, persisted.params.clone()) {
                error!(connection = %name, error = %e, "failed to recreate connection from persistence");
                continue;
            }
            if persisted.enabled {
                if let Err(e) = manager.enable_connection(&name).await {
                    error!(connection = %name, error = %e, "error enabling connection at startup");
                }
            }
        }

        info!(
            supported = ?manager.registry.list_supported_connectors(),
            configured = ?manager.connection_names(),
            "ConnectionManager initialized"
        );
        Ok(manager)
    }

    pub fn list_supported_connectors(&self) -> HashMap<String, SupportedConnector> {
        self.registry
            .list_supported_connectors()
            .into_iter()
            .map(|kind| (kind, SupportedConnector::default()))
            .collect()
    }

    fn connection_names(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn list_connections(&self) -> Vec<ConnectionDescriptor> {
        self.connections
            .iter()
            .map(|e| ConnectionDescriptor {
                name: e.key().clone(),
                kind: e.value().kind.clone(),
                category: e.value().driver.category(),
                connected: e.value().driver.connected(),
            })
            .collect()
    }

    fn exists(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    fn require(&self, name: &str) -> AgentResult<()> {
        if self.exists(name) {
            Ok(())
        } else {
            Err(AgentError::ConnectionNotFound(name.to_string()))
        }
    }

    fn create_driver_entry(
        &self,
        name: &str,
        kind: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> AgentResult<()> {
        let cfg = crate::drivers::traits::DriverConfig { id: name.to_string(), kind: kind.to_string(), params };
        let driver = self.registry.build(&cfg)?;
        self.connections.insert(name.to_string(), ConnectionEntry { driver, kind: kind.to_string() });
        Ok(())
    }

    /// Define a new connection. If `ignore_existing` is set and a
    /// connection with the same name and type already exists, this is
    /// a no-op returning the existing descriptor (redefinition with a
    /// different type is always rejected).
    pub async fn create_connection(
        &self,
        name: &str,
        kind: &str,
        params: HashMap<String, serde_json::Value>,
        enabled: bool,
        ignore_existing: bool,
    ) -> AgentResult<ConnectionDescriptor> {
        if let Some(entry) = self.connections.get(name) {
            if !ignore_existing {
                return Err(AgentError::ConnectionAlreadyExists(name.to_string()));
            }
            if entry.kind != kind {
                return Err(AgentError::UnsupportedConnectorType(format!(
                    "connection '{name}' already exists with a different type"
                )));
            }
            return Ok(ConnectionDescriptor {
                name: name.to_string(),
                kind: entry.kind.clone(),
                category: entry.driver.category(),
                connected: entry.driver.connected(),
            });
        }

        self.create_driver_entry(name, kind, params.clone())?;
        if enabled {
            self.enable_connection(name).await?;
        }

        self.persistence
            .mutate(|doc| {
                doc.connections.insert(
                    name.to_string(),
                    PersistedConnection { kind: kind.to_string(), params, enabled, ..Default::default() },
                );
            })
            .await?;

        info!(connection = name, kind, "connection created");
        let entry = self.connections.get(name).unwrap();
        Ok(ConnectionDescriptor {
            name: name.to_string(),
            kind: entry.kind.clone(),
            category: entry.driver.category(),
            connected: entry.driver.connected(),
        })
    }

    pub async fn enable_connection(&self, name: &str) -> AgentResult<()> {
        self.require(name)?;
        let driver = self.connections.get(name).unwrap().driver.clone();
        if !driver.connected() {
            driver.connect().await?;
        }
        self.persistence
            .mutate(|doc| {
                if let Some(conn) = doc.connections.get_mut(name) {
                    conn.enabled = true;
                }
            })
            .await
    }

    pub async fn disable_connection(&self, name: &str) -> AgentResult<()> {
        self.require(name)?;
        let driver = self.connections.get(name).unwrap().driver.clone();
        if driver.connected() {
            driver.disconnect().await?;
        }
        self.persistence
            .mutate(|doc| {
                if let Some(conn) = doc.connections.get_mut(name) {
                    conn.enabled = false;
                }
            })
            .await
    }

    pub fn is_connected(&self, name: &str) -> AgentResult<bool> {
        self.require(name)?;
        Ok(self.connections.get(name).unwrap().driver.connected())
    }

    /// Fetch the live driver handle, optionally requiring it to be
    /// connected (the default for data operations).
    pub fn connection(&self, name: &str, check_enabled: bool) -> AgentResult<Arc<dyn Driver>> {
        self.require(name)?;
        let entry = self.connections.get(name).unwrap();
        if check_enabled && !entry.driver.connected() {
            return Err(AgentError::ConnectionDisabled(name.to_string()));
        }
        Ok(entry.driver.clone())
    }

    /// Disconnect and drop the live handle, then remove it from the
    /// persistence document. Callers that need cascade-delete of scan
    /// jobs / manipulated tags must do so before calling this (the
    /// facade owns that orchestration, as in the original's
    /// `ServiceApi.delete_connection`).
    pub async fn delete_connection(&self, name: &str) -> AgentResult<()> {
        self.require(name)?;
        if let Some((_, entry)) = self.connections.remove(name) {
            if entry.driver.connected() {
                debug!(connection = name, "disconnecting before delete");
                entry.driver.disconnect().await?;
            }
        }
        self.persistence
            .mutate(|doc| {
                doc.connections.remove(name);
            })
            .await
    }

    /// Remove every connection (used by `reset`/tests).
    pub async fn reset(&self) -> AgentResult<()> {
        let names: Vec<_> = self.connection_names();
        for name in names {
            self.delete_connection(&name).await?;
        }
        Ok(())
    }
}

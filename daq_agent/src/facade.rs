use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::bus::BusPublisher;
use crate::connection::{ConnectionDescriptor, ConnectionManager};
use crate::drivers::traits::{TagAttributes, TagValue, TagValueRecord};
use crate::error::AgentResult;
use crate::exchanger::DataExchanger;
use crate::harvester::HistoryHarvester;
use crate::persistence::PersistenceStore;
use crate::safety::{Bound, SafeManipulator};
use crate::scheduler::DaqScheduler;

/// Calls slower than this are logged at `warn` instead of `debug`.
/// Ported from `api.py`'s `traceapi` decorator.
const SLOW_CALL_THRESHOLD: Duration = Duration::from_millis(500);

async fn traced<T>(name: &str, fut: impl Future<Output = AgentResult<T>>) -> AgentResult<T> {
    let start = tokio::time::Instant::now();
    let result = fut.await;
    let elapsed = start.elapsed();
    match &result {
        Ok(_) if elapsed > SLOW_CALL_THRESHOLD => warn!(call = name, ?elapsed, "slow API call"),
        Ok(_) => debug!(call = name, ?elapsed, "API call"),
        Err(e) => error!(call = name, ?elapsed, error = %e, "API call failed"),
    }
    result
}

/// Thin dispatcher over the four subsystems. An external RPC binder
/// (out of scope for this crate) is expected to map inbound method
/// calls onto `ServiceApi` one-to-one. Ported from `api.py`'s
/// `ServiceApi`.
pub struct ServiceApi {
    connections: Arc<ConnectionManager>,
    scheduler: Arc<DaqScheduler>,
    harvester: Arc<HistoryHarvester>,
    manipulator: Arc<SafeManipulator>,
    exchanger: DataExchanger,
}

impl ServiceApi {
    pub fn new(
        connections: Arc<ConnectionManager>,
        scheduler: Arc<DaqScheduler>,
        harvester: Arc<HistoryHarvester>,
        manipulator: Arc<SafeManipulator>,
    ) -> Self {
        let exchanger = DataExchanger::new(connections.clone());
        Self { connections, scheduler, harvester, manipulator, exchanger }
    }

    pub async fn list_supported_connectors(&self) -> AgentResult<Vec<String>> {
        traced("list_supported_connectors", async {
            Ok(self.connections.list_supported_connectors().into_keys().collect())
        })
        .await
    }

    pub async fn list_connections(&self) -> AgentResult<Vec<ConnectionDescriptor>> {
        traced("list_connections", async { Ok(self.connections.list_connections()) }).await
    }

    pub async fn create_connection(
        &self,
        conn_name: &str,
        conn_type: &str,
        params: HashMap<String, serde_json::Value>,
        enabled: bool,
        ignore_existing: bool,
    ) -> AgentResult<ConnectionDescriptor> {
        traced("create_connection", self.connections.create_connection(conn_name, conn_type, params, enabled, ignore_existing)).await
    }

    /// Cascade delete: scan jobs, then manipulated tags, then the
    /// connection itself. Order matches `api.py`'s `delete_connection`.
    pub async fn delete_connection(&self, conn_name: &str) -> AgentResult<()> {
        traced("delete_connection", async {
            let jobs = self.scheduler.list_jobs(Some(conn_name));
            if !jobs.is_empty() {
                self.scheduler.remove_jobs(&jobs).await?;
            }

            self.manipulator.unregister_all(conn_name).await?;

            self.connections.delete_connection(conn_name).await
        })
        .await
    }

    pub async fn is_connected(&self, conn_name: &str) -> AgentResult<bool> {
        traced("is_connected", async { self.connections.is_connected(conn_name) }).await
    }

    pub async fn enable_connection(&self, conn_name: &str) -> AgentResult<()> {
        traced("enable_connection", self.connections.enable_connection(conn_name)).await
    }

    pub async fn disable_connection(&self, conn_name: &str) -> AgentResult<()> {
        traced("disable_connection", self.connections.disable_connection(conn_name)).await
    }

    pub async fn list_tags(&self, conn_name: &str, filter: &str, include_attributes: bool, recursive: bool, max_results: usize) -> AgentResult<HashMap<String, TagAttributes>> {
        traced("list_tags", async {
            let driver = self.connections.connection(conn_name, true)?;
            driver.list_tags(filter, include_attributes, recursive, max_results).await
        })
        .await
    }

    pub async fn read_tag_values(&self, conn_name: &str, tags: &[String]) -> AgentResult<HashMap<String, TagValueRecord>> {
        traced("read_tag_values", async {
            let driver = self.connections.connection(conn_name, true)?;
            driver.read_tag_values(tags).await
        })
        .await
    }

    pub async fn read_tag_values_period(
        &self,
        conn_name: &str,
        tags: &[String],
        first_timestamp: Option<DateTime<Utc>>,
        last_timestamp: Option<DateTime<Utc>>,
        max_results: Option<usize>,
    ) -> AgentResult<crate::codec::Frame> {
        traced("read_tag_values_period", async {
            let driver = self.connections.connection(conn_name, true)?;
            driver.read_tag_values_period(tags, first_timestamp, last_timestamp, max_results).await
        })
        .await
    }

    pub async fn list_manipulated_tags(&self, conn_name: &str) -> AgentResult<Vec<String>> {
        traced("list_manipulated_tags", async { self.manipulator.list_tags(conn_name) }).await
    }

    pub async fn register_manipulated_tags(&self, conn_name: &str, tags: HashMap<String, Bound>) -> AgentResult<()> {
        traced("register_manipulated_tags", self.manipulator.register_tags(conn_name, tags)).await
    }

    pub async fn unregister_manipulated_tags(&self, conn_name: &str, tags: &[String]) -> AgentResult<()> {
        traced("unregister_manipulated_tags", self.manipulator.unregister_tags(conn_name, tags)).await
    }

    pub async fn write_manipulated_tags(&self, conn_name: &str, values: HashMap<String, TagValue>) -> AgentResult<HashMap<String, TagValueRecord>> {
        traced("write_manipulated_tags", self.manipulator.write_tags(conn_name, values)).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_scan_job(
        &self,
        job_id: &str,
        conn_name: &str,
        tags: Vec<String>,
        seconds: u64,
        update_on_conflict: bool,
        from_cache: bool,
    ) -> AgentResult<()> {
        traced("create_scan_job", self.scheduler.create_scan_job(job_id, conn_name, tags, seconds, update_on_conflict, from_cache)).await
    }

    pub async fn remove_scan_jobs(&self, job_ids: &[String]) -> AgentResult<()> {
        traced("remove_scan_jobs", self.scheduler.remove_jobs(job_ids)).await
    }

    pub async fn list_scan_jobs(&self, conn_name: Option<&str>) -> AgentResult<Vec<String>> {
        traced("list_scan_jobs", async { Ok(self.scheduler.list_jobs(conn_name)) }).await
    }

    pub async fn create_delivery_job(
        &self,
        job_id: &str,
        conn_name: &str,
        tags: Vec<String>,
        first_timestamp: DateTime<Utc>,
        last_timestamp: DateTime<Utc>,
        batch_size: Duration,
    ) -> AgentResult<()> {
        traced("create_delivery_job", async {
            self.harvester.create_delivery_job(job_id, conn_name, tags, first_timestamp, last_timestamp, batch_size)
        })
        .await
    }

    pub async fn copy_period(&self, src_conn: &str, tags: &[String], dest_conn: &str, first_timestamp: DateTime<Utc>, last_timestamp: DateTime<Utc>) -> AgentResult<HashMap<String, TagValue>> {
        traced("copy_period", self.exchanger.copy_period(src_conn, tags, dest_conn, first_timestamp, last_timestamp)).await
    }

    pub async fn copy_attributes(&self, src_conn: &str, tags: &[String], attributes: Option<&[String]>) -> AgentResult<HashMap<String, TagAttributes>> {
        traced("copy_attributes", self.exchanger.copy_attributes(src_conn, tags, attributes)).await
    }

    /// Provision connections' scan jobs and manipulated tags from a
    /// single document. For a job that already exists, only tags
    /// missing from the live job are added — a sample-rate mismatch is
    /// logged and otherwise ignored (see DESIGN.md Open Questions,
    /// ported from `api.py`'s `provision_config` which carries the
    /// same TODO).
    pub async fn provision_config(&self, config: HashMap<String, ProvisionedConnection>) -> AgentResult<()> {
        traced("provision_config", async {
            for (conn_name, provisioned) in config {
                let existing_jobs = self.scheduler.list_jobs(None);
                for (job_id, job) in provisioned.daq_jobs {
                    if !existing_jobs.contains(&job_id) {
                        self.scheduler
                            .create_scan_job(&job_id, &conn_name, job.tags, job.seconds, false, job.from_cache)
                            .await?;
                    } else {
                        let existing_tags = self.scheduler.list_tags(&job_id)?;
                        let missing: Vec<String> = job.tags.into_iter().filter(|t| !existing_tags.contains(t)).collect();
                        if !missing.is_empty() {
                            warn!(job_id, "provision_config: job exists, adding missing tags; sample rate drift (if any) is not applied");
                            let mut merged = existing_tags;
                            merged.extend(missing);
                            self.scheduler.create_scan_job(&job_id, &conn_name, merged, job.seconds, true, job.from_cache).await?;
                        }
                    }
                }

                if !provisioned.manipulated_tags.is_empty() {
                    self.manipulator.register_tags(&conn_name, provisioned.manipulated_tags).await?;
                }
            }
            Ok(())
        })
        .await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionedJob {
    pub tags: Vec<String>,
    pub seconds: u64,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionedConnection {
    pub daq_jobs: HashMap<String, ProvisionedJob>,
    pub manipulated_tags: HashMap<String, Bound>,
}

/// Build the four subsystems from persistence + config, matching the
/// startup sequence in `main.rs`.
pub async fn build(
    persistence: Arc<PersistenceStore>,
    registry: crate::drivers::DriverRegistry,
    bus: Arc<dyn BusPublisher>,
) -> AgentResult<ServiceApi> {
    let connections = ConnectionManager::restore(registry, persistence.clone()).await?;
    let scheduler = DaqScheduler::restore(connections.clone(), persistence.clone(), bus.clone()).await?;
    let harvester = HistoryHarvester::new(connections.clone(), bus);
    let manipulator = SafeManipulator::restore(connections.clone(), persistence).await?;
    Ok(ServiceApi::new(connections, scheduler, harvester, manipulator))
}

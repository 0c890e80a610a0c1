use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusPublisher, Publication};
use crate::connection::ConnectionManager;
use crate::error::{AgentError, AgentResult};
use crate::persistence::{PersistedDaqJob, PersistenceStore};

struct JobHandle {
    conn_name: String,
    tags: Arc<RwLock<Vec<String>>>,
    interval_seconds: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Cooperative periodic scanner: one job per `(connection, tag set,
/// interval)`. Ported from `daq_scheduler.py`'s `DAQScheduler`, with
/// apscheduler's `coalesce=True, max_instances=1` semantics given by
/// a single per-job task looping on a skip-mode interval instead of a
/// central scheduler thread pool. The trigger period is stored in
/// whole seconds, matching the persisted job descriptor.
pub struct DaqScheduler {
    connections: Arc<ConnectionManager>,
    persistence: Arc<PersistenceStore>,
    bus: Arc<dyn BusPublisher>,
    jobs: DashMap<String, JobHandle>,
}

impl DaqScheduler {
    pub async fn restore(
        connections: Arc<ConnectionManager>,
        persistence: Arc<PersistenceStore>,
        bus: Arc<dyn BusPublisher>,
    ) -> AgentResult<Arc<Self>> {
        let scheduler = Arc::new(Self { connections, persistence, bus, jobs: DashMap::new() });

        let doc = scheduler.persistence.snapshot().await;
        for (conn_name, conn) in doc.connections {
            for (job_id, job) in conn.daq_jobs {
                debug!(job_id, connection = %conn_name, "starting preconfigured scan job");
                scheduler.spawn_job(&job_id, &conn_name, job.tags, job.seconds);
            }
        }
        Ok(scheduler)
    }

    pub fn list_jobs(&self, conn_name: Option<&str>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| conn_name.map(|c| c == e.value().conn_name).unwrap_or(true))
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn list_tags(&self, job_id: &str) -> AgentResult<Vec<String>> {
        let job = self.jobs.get(job_id).ok_or_else(|| AgentError::JobNotFound(job_id.to_string()))?;
        Ok(job.tags.read().unwrap().clone())
    }

    fn spawn_job(&self, job_id: &str, conn_name: &str, mut tags: Vec<String>, interval_seconds: u64) {
        tags.sort();
        let tags = Arc::new(RwLock::new(tags));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_job(
            job_id.to_string(),
            conn_name.to_string(),
            tags.clone(),
            interval_seconds,
            self.connections.clone(),
            self.bus.clone(),
            cancel.clone(),
        ));
        self.jobs.insert(
            job_id.to_string(),
            JobHandle { conn_name: conn_name.to_string(), tags, interval_seconds, cancel, task },
        );
    }

    /// Create or update (if `update_on_conflict`) a scan job. `seconds`
    /// is the whole-second trigger period; `from_cache` is persisted
    /// verbatim and otherwise has no effect on this driver model.
    pub async fn create_scan_job(
        &self,
        job_id: &str,
        conn_name: &str,
        mut tags: Vec<String>,
        seconds: u64,
        update_on_conflict: bool,
        from_cache: bool,
    ) -> AgentResult<()> {
        if seconds == 0 {
            return Err(AgentError::InvalidInterval(seconds));
        }
        tags.sort();

        if let Some(existing) = self.jobs.get(job_id) {
            if !update_on_conflict {
                return Err(AgentError::JobAlreadyExists(job_id.to_string()));
            }
            let changed = existing.interval_seconds != seconds
                || existing.conn_name != conn_name
                || *existing.tags.read().unwrap() != tags;
            drop(existing);
            if changed {
                self.stop_job_internal(job_id).await;
                self.spawn_job(job_id, conn_name, tags.clone(), seconds);
            }
            info!(job_id, connection = conn_name, seconds, "scan job modified");
        } else {
            self.spawn_job(job_id, conn_name, tags.clone(), seconds);
            info!(job_id, connection = conn_name, seconds, "scan job created");
        }

        self.persistence
            .mutate(|doc| {
                let conn = doc.connections.entry(conn_name.to_string()).or_default();
                conn.daq_jobs.insert(job_id.to_string(), PersistedDaqJob { tags, seconds, from_cache });
            })
            .await
    }

    async fn stop_job_internal(&self, job_id: &str) {
        if let Some((_, handle)) = self.jobs.remove(job_id) {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    /// Stop and forget one or more jobs, removing them from persistence.
    pub async fn remove_jobs(&self, job_ids: &[String]) -> AgentResult<()> {
        for job_id in job_ids {
            if !self.jobs.contains_key(job_id) {
                return Err(AgentError::JobNotFound(job_id.clone()));
            }
        }
        for job_id in job_ids {
            self.stop_job_internal(job_id).await;
        }
        self.persistence
            .mutate(|doc| {
                for conn in doc.connections.values_mut() {
                    for job_id in job_ids {
                        conn.daq_jobs.remove(job_id);
                    }
                }
            })
            .await
    }

    pub async fn reset(&self) -> AgentResult<()> {
        let ids = self.list_jobs(None);
        if ids.is_empty() {
            return Ok(());
        }
        self.remove_jobs(&ids).await
    }
}

async fn run_job(
    job_id: String,
    conn_name: String,
    tags: Arc<RwLock<Vec<String>>>,
    interval_seconds: u64,
    connections: Arc<ConnectionManager>,
    bus: Arc<dyn BusPublisher>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sample_id: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job_id, "scan job cancelled");
                break;
            }
            _ = interval.tick() => {
                let tag_list = tags.read().unwrap().clone();
                if tag_list.is_empty() {
                    continue;
                }
                match run_once(&conn_name, &tag_list, &connections).await {
                    Ok(values) => {
                        if values.is_empty() {
                            warn!(job_id, connection = %conn_name, "scan read returned no tags, skipping publish");
                            continue;
                        }
                        let payload = match serde_json::to_vec(&serde_json::json!({
                            "job_id": job_id,
                            "sample_id": sample_id,
                            "data": values,
                        })) {
                            Ok(p) => p,
                            Err(e) => {
                                error!(job_id, error = %e, "failed to encode scan publish");
                                continue;
                            }
                        };
                        match bus.publish(Publication {
                            connection: conn_name.clone(),
                            job_id: job_id.clone(),
                            payload,
                            ..Default::default()
                        }).await {
                            Ok(()) => sample_id += 1,
                            Err(e) => warn!(job_id, error = %e, "failed to publish scan data"),
                        }
                    }
                    Err(e) => error!(job_id, connection = %conn_name, error = %e, "scan job iteration failed"),
                }
            }
        }
    }
}

async fn run_once(
    conn_name: &str,
    tags: &[String],
    connections: &Arc<ConnectionManager>,
) -> AgentResult<std::collections::HashMap<String, crate::drivers::traits::TagValueRecord>> {
    let driver = connections.connection(conn_name, false)?;
    if !driver.connected() {
        info!(connection = conn_name, "reconnecting to target before scan");
        driver.connect().await?;
    }
    driver.read_tag_values(tags).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RecordingBusPublisher;
    use crate::drivers::DriverRegistry;
    use crate::persistence::PersistenceStore;

    async fn setup() -> (Arc<ConnectionManager>, Arc<PersistenceStore>, Arc<RecordingBusPublisher>) {
        let dir = std::env::temp_dir().join(format!(
            "daq_agent_sched_test_{}",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let persistence = PersistenceStore::open(dir.join("p.toml")).await.unwrap();
        let manager = ConnectionManager::restore(DriverRegistry::with_builtins(), persistence.clone()).await.unwrap();
        manager.create_connection("plant1", "fake", Default::default(), true, false).await.unwrap();
        (manager, persistence, Arc::new(RecordingBusPublisher::new()))
    }

    #[tokio::test]
    async fn create_job_then_list() {
        let (conns, persistence, bus) = setup().await;
        let scheduler = DaqScheduler::restore(conns, persistence, bus).await.unwrap();
        scheduler
            .create_scan_job("job1", "plant1", vec!["Static.Float".to_string()], 5, false, false)
            .await
            .unwrap();
        assert_eq!(scheduler.list_jobs(None), vec!["job1".to_string()]);
        assert_eq!(scheduler.list_tags("job1").unwrap(), vec!["Static.Float".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_job_without_update_errors() {
        let (conns, persistence, bus) = setup().await;
        let scheduler = DaqScheduler::restore(conns, persistence, bus).await.unwrap();
        scheduler.create_scan_job("job1", "plant1", vec![], 5, false, false).await.unwrap();
        let err = scheduler.create_scan_job("job1", "plant1", vec![], 5, false, false).await.unwrap_err();
        assert!(matches!(err, AgentError::JobAlreadyExists(_)));
    }

    #[tokio::test]
    async fn job_publishes_data_on_bus() {
        let (conns, persistence, bus) = setup().await;
        let scheduler = DaqScheduler::restore(conns, persistence, bus.clone()).await.unwrap();
        scheduler
            .create_scan_job("job1", "plant1", vec!["Static.Float".to_string()], 1, false, false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(bus.count() >= 1);
        scheduler.remove_jobs(&["job1".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn remove_unknown_job_errors() {
        let (conns, persistence, bus) = setup().await;
        let scheduler = DaqScheduler::restore(conns, persistence, bus).await.unwrap();
        let err = scheduler.remove_jobs(&["nope".to_string()]).await.unwrap_err();
        assert!(matches!(err, AgentError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let (conns, persistence, bus) = setup().await;
        let scheduler = DaqScheduler::restore(conns, persistence, bus).await.unwrap();
        let err = scheduler.create_scan_job("job1", "plant1", vec![], 0, false, false).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInterval(0)));
    }

    #[tokio::test]
    async fn empty_tag_set_never_publishes() {
        let (conns, persistence, bus) = setup().await;
        let scheduler = DaqScheduler::restore(conns, persistence, bus.clone()).await.unwrap();
        scheduler.create_scan_job("job1", "plant1", vec![], 1, false, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(bus.count(), 0);
        scheduler.remove_jobs(&["job1".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn from_cache_is_persisted() {
        let (conns, persistence, bus) = setup().await;
        let scheduler = DaqScheduler::restore(conns, persistence.clone(), bus).await.unwrap();
        scheduler
            .create_scan_job("job1", "plant1", vec!["Static.Float".to_string()], 5, false, true)
            .await
            .unwrap();
        let doc = persistence.snapshot().await;
        let job = &doc.connections["plant1"].daq_jobs["job1"];
        assert!(job.from_cache);
        assert_eq!(job.seconds, 5);
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::{BusPublisher, Publication};
use crate::codec;
use crate::connection::ConnectionManager;
use crate::error::{AgentError, AgentResult};

const DEFAULT_WORKER_POOL_SIZE: usize = 20;

struct JobHandle {
    task: JoinHandle<()>,
}

/// Batched historical backfill. Ported from `history_harvester.py`:
/// each job self-reschedules a new batch until the requested
/// `[first_timestamp, last_timestamp]` window is exhausted, bounded by
/// a shared worker pool (the Python implementation used a 20-thread
/// `ThreadPoolExecutor`; here a `Semaphore` of the same size bounds how
/// many batch reads may run concurrently across all jobs).
pub struct HistoryHarvester {
    connections: Arc<ConnectionManager>,
    bus: Arc<dyn BusPublisher>,
    pool: Arc<Semaphore>,
    jobs: DashMap<String, JobHandle>,
}

impl HistoryHarvester {
    pub fn new(connections: Arc<ConnectionManager>, bus: Arc<dyn BusPublisher>) -> Arc<Self> {
        Self::with_pool_size(connections, bus, DEFAULT_WORKER_POOL_SIZE)
    }

    pub fn with_pool_size(connections: Arc<ConnectionManager>, bus: Arc<dyn BusPublisher>, pool_size: usize) -> Arc<Self> {
        Arc::new(Self { connections, bus, pool: Arc::new(Semaphore::new(pool_size)), jobs: DashMap::new() })
    }

    pub fn list_jobs(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_delivery_job(
        &self,
        job_id: &str,
        conn_name: &str,
        mut tags: Vec<String>,
        first_timestamp: DateTime<Utc>,
        last_timestamp: DateTime<Utc>,
        batch_size: Duration,
    ) -> AgentResult<()> {
        if self.jobs.contains_key(job_id) {
            return Err(AgentError::HarvesterJobAlreadyExists(job_id.to_string()));
        }
        tags.sort();

        let task = tokio::spawn(run_job(
            job_id.to_string(),
            conn_name.to_string(),
            tags,
            first_timestamp,
            last_timestamp,
            batch_size,
            self.connections.clone(),
            self.bus.clone(),
            self.pool.clone(),
        ));
        self.jobs.insert(job_id.to_string(), JobHandle { task });
        Ok(())
    }

    /// Wait for a job to finish all of its batches (used by tests and
    /// by callers that want to block until a backfill completes).
    pub async fn join(&self, job_id: &str) -> AgentResult<()> {
        let handle = self
            .jobs
            .remove(job_id)
            .ok_or_else(|| AgentError::HarvesterJobNotFound(job_id.to_string()))?
            .1;
        handle.task.await.map_err(|e| AgentError::DriverOperationFailed(e.to_string()))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_job(
    job_id: String,
    conn_name: String,
    tags: Vec<String>,
    last_timestamp: DateTime<Utc>,
    final_timestamp: DateTime<Utc>,
    batch_size: Duration,
    connections: Arc<ConnectionManager>,
    bus: Arc<dyn BusPublisher>,
    pool: Arc<Semaphore>,
) {
    let mut cursor = last_timestamp;
    let mut iteration: u64 = 0;
    let batch_size = chrono::Duration::from_std(batch_size).unwrap_or(chrono::Duration::days(1));

    loop {
        let next_period_end = std::cmp::min(final_timestamp, cursor + batch_size);

        let _permit = match pool.acquire().await {
            Ok(p) => p,
            Err(_) => {
                error!(job_id, "harvester worker pool closed");
                return;
            }
        };

        let driver = match connections.connection(&conn_name, false) {
            Ok(d) => d,
            Err(e) => {
                error!(job_id, connection = %conn_name, error = %e, "harvester job failed to resolve connection");
                return;
            }
        };

        let start = tokio::time::Instant::now();
        let frame = driver
            .read_tag_values_period(&tags, Some(cursor), Some(next_period_end), None)
            .await;
        let read_time = start.elapsed();

        match frame {
            Ok(frame) if frame.num_rows() == 0 => {
                warn!(job_id, %cursor, %next_period_end, "no data read for period");
            }
            Ok(frame) => match codec::encode(&frame) {
                Ok(payload) => {
                    debug!(job_id, iteration, ?read_time, rows = frame.num_rows(), "harvester batch read");
                    if let Err(e) = bus
                        .publish(Publication {
                            connection: conn_name.clone(),
                            job_id: job_id.clone(),
                            payload,
                            data_category: Some("historical".to_string()),
                            batch_num: Some(iteration),
                        })
                        .await
                    {
                        warn!(job_id, error = %e, "failed to publish historical batch");
                    }
                }
                Err(e) => error!(job_id, error = %e, "failed to encode historical batch"),
            },
            Err(e) => {
                error!(job_id, connection = %conn_name, error = %e, "history harvester job iteration failed");
                return;
            }
        }

        if next_period_end >= final_timestamp {
            break;
        }
        cursor = next_period_end;
        iteration += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RecordingBusPublisher;
    use crate::drivers::DriverRegistry;
    use crate::persistence::PersistenceStore;

    async fn setup() -> (Arc<ConnectionManager>, Arc<RecordingBusPublisher>) {
        let dir = std::env::temp_dir().join(format!(
            "daq_agent_harvest_test_{}",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let persistence = PersistenceStore::open(dir.join("p.toml")).await.unwrap();
        let manager = ConnectionManager::restore(DriverRegistry::with_builtins(), persistence).await.unwrap();
        manager.create_connection("plant1", "fake", Default::default(), true, false).await.unwrap();
        (manager, Arc::new(RecordingBusPublisher::new()))
    }

    #[tokio::test]
    async fn single_batch_job_publishes_once() {
        let (conns, bus) = setup().await;
        let harvester = HistoryHarvester::new(conns, bus.clone());
        let first = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let last = first + chrono::Duration::hours(1);
        harvester
            .create_delivery_job(
                "job1",
                "plant1",
                vec!["Static.Float".to_string()],
                first,
                last,
                Duration::from_secs(3600 * 2),
            )
            .unwrap();
        harvester.join("job1").await.unwrap();
        assert_eq!(bus.count(), 1);
    }

    #[tokio::test]
    async fn multi_batch_job_rearms_until_exhausted() {
        let (conns, bus) = setup().await;
        let harvester = HistoryHarvester::new(conns, bus.clone());
        let first = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let last = first + chrono::Duration::hours(3);
        harvester
            .create_delivery_job(
                "job1",
                "plant1",
                vec!["Static.Float".to_string()],
                first,
                last,
                Duration::from_secs(3600),
            )
            .unwrap();
        harvester.join("job1").await.unwrap();
        assert_eq!(bus.count(), 3);
    }

    #[tokio::test]
    async fn duplicate_job_id_errors() {
        let (conns, bus) = setup().await;
        let harvester = HistoryHarvester::new(conns, bus);
        let first = Utc::now();
        harvester
            .create_delivery_job("job1", "plant1", vec![], first, first, Duration::from_secs(1))
            .unwrap();
        let err = harvester
            .create_delivery_job("job1", "plant1", vec![], first, first, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, AgentError::HarvesterJobAlreadyExists(_)));
        harvester.join("job1").await.unwrap();
    }

    #[tokio::test]
    async fn batches_carry_monotonic_batch_num_and_historical_category() {
        let (conns, bus) = setup().await;
        let harvester = HistoryHarvester::new(conns, bus.clone());
        let first = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let last = first + chrono::Duration::hours(3);
        harvester
            .create_delivery_job("job1", "plant1", vec!["Static.Float".to_string()], first, last, Duration::from_secs(3600))
            .unwrap();
        harvester.join("job1").await.unwrap();

        let published = bus.drain();
        assert_eq!(published.len(), 3);
        for (i, publication) in published.iter().enumerate() {
            assert_eq!(publication.data_category.as_deref(), Some("historical"));
            assert_eq!(publication.batch_num, Some(i as u64));
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use daq_agent::bus::{BusPublisher, RecordingBusPublisher};
use daq_agent::drivers::traits::TagValue;
use daq_agent::drivers::DriverRegistry;
use daq_agent::facade::{self, ProvisionedConnection, ProvisionedJob, ServiceApi};
use daq_agent::persistence::PersistenceStore;
use daq_agent::safety::Bound;

struct AgentFixture {
    api: ServiceApi,
    bus: Arc<RecordingBusPublisher>,
}

impl AgentFixture {
    async fn new() -> Self {
        let dir = std::env::temp_dir().join(format!(
            "daq_agent_e2e_{}",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let persistence = PersistenceStore::open(dir.join("persistence.toml")).await.unwrap();
        let bus = Arc::new(RecordingBusPublisher::new());
        let dyn_bus: Arc<dyn BusPublisher> = bus.clone();
        let api = facade::build(persistence, DriverRegistry::with_builtins(), dyn_bus).await.unwrap();
        Self { api, bus }
    }
}

#[tokio::test]
async fn connection_lifecycle_and_listing() {
    let fixture = AgentFixture::new().await;
    fixture.api.create_connection("plant1", "fake", HashMap::new(), true, false).await.unwrap();

    let connections = fixture.api.list_connections().await.unwrap();
    assert_eq!(connections.len(), 1);
    assert!(connections[0].connected);

    fixture.api.disable_connection("plant1").await.unwrap();
    assert!(!fixture.api.is_connected("plant1").await.unwrap());

    fixture.api.enable_connection("plant1").await.unwrap();
    assert!(fixture.api.is_connected("plant1").await.unwrap());
}

#[tokio::test]
async fn safe_write_enforces_bounds_before_reaching_driver() {
    let fixture = AgentFixture::new().await;
    fixture.api.create_connection("plant1", "fake", HashMap::new(), true, false).await.unwrap();

    let mut bounds = HashMap::new();
    bounds.insert("Static.Int4".to_string(), Bound { lb: Some(0.0), ub: Some(10.0), rb: None });
    fixture.api.register_manipulated_tags("plant1", bounds).await.unwrap();

    let mut values = HashMap::new();
    values.insert("Static.Int4".to_string(), TagValue::Int(999));
    let err = fixture.api.write_manipulated_tags("plant1", values).await.unwrap_err();
    assert!(err.to_string().contains("upper bound") || err.to_string().contains("above"));
}

#[tokio::test]
async fn scan_job_coalesces_and_publishes_to_bus() {
    let fixture = AgentFixture::new().await;
    fixture.api.create_connection("plant1", "fake", HashMap::new(), true, false).await.unwrap();
    fixture
        .api
        .create_scan_job("job1", "plant1", vec!["Static.Float".to_string()], 1, false, false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    fixture.api.remove_scan_jobs(&["job1".to_string()]).await.unwrap();

    // Coalescing guarantees at most one run per tick interval, not one
    // publish per millisecond slept; bounded by elapsed/tick not by
    // how many ticks were technically due.
    assert!(fixture.bus.count() >= 1);
    assert!(fixture.bus.count() <= 3);
}

#[tokio::test]
async fn delete_connection_cascades_jobs_and_manipulated_tags() {
    let fixture = AgentFixture::new().await;
    fixture.api.create_connection("plant1", "fake", HashMap::new(), true, false).await.unwrap();
    fixture.api.create_scan_job("job1", "plant1", vec!["Static.Float".to_string()], 60, false, false).await.unwrap();

    let mut bounds = HashMap::new();
    bounds.insert("Static.Int4".to_string(), Bound { lb: Some(0.0), ub: Some(1.0), rb: None });
    fixture.api.register_manipulated_tags("plant1", bounds).await.unwrap();

    fixture.api.delete_connection("plant1").await.unwrap();

    assert!(fixture.api.list_connections().await.unwrap().is_empty());
    assert!(fixture.api.list_scan_jobs(None).await.unwrap().is_empty());
    let err = fixture.api.list_manipulated_tags("plant1").await.unwrap_err();
    assert!(err.to_string().contains("plant1"));
}

#[tokio::test]
async fn harvester_batches_until_window_exhausted() {
    let fixture = AgentFixture::new().await;
    fixture.api.create_connection("plant1", "fake", HashMap::new(), true, false).await.unwrap();

    let first = Utc::now();
    let last = first + chrono::Duration::hours(2);
    fixture
        .api
        .create_delivery_job("hist1", "plant1", vec!["Static.Float".to_string()], first, last, Duration::from_secs(3600))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.bus.count(), 2);
}

#[tokio::test]
async fn provision_config_seeds_scan_jobs_and_bounds() {
    let fixture = AgentFixture::new().await;
    fixture.api.create_connection("plant1", "fake", HashMap::new(), true, false).await.unwrap();

    let mut daq_jobs = HashMap::new();
    daq_jobs.insert("job1".to_string(), ProvisionedJob { tags: vec!["Static.Float".to_string()], seconds: 30, from_cache: false });
    let mut manipulated = HashMap::new();
    manipulated.insert("Static.Int4".to_string(), Bound { lb: Some(0.0), ub: Some(5.0), rb: None });

    let mut config = HashMap::new();
    config.insert("plant1".to_string(), ProvisionedConnection { daq_jobs, manipulated_tags: manipulated });

    fixture.api.provision_config(config).await.unwrap();

    assert_eq!(fixture.api.list_scan_jobs(Some("plant1")).await.unwrap(), vec!["job1".to_string()]);
    assert_eq!(fixture.api.list_manipulated_tags("plant1").await.unwrap(), vec!["Static.Int4".to_string()]);
}

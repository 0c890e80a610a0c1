use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use daq_agent::api::status;
use daq_agent::bus::{AmqpBusPublisher, BusPublisher, RecordingBusPublisher};
use daq_agent::config::Settings;
use daq_agent::drivers::DriverRegistry;
use daq_agent::facade::{self, ServiceApi};
use daq_agent::logging;
use daq_agent::persistence::PersistenceStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(None);

    let config_path = Path::new("config.toml");
    let settings = match Settings::load(config_path) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, path = ?config_path, "failed to load configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(service_id = %settings.service.id, "data agent starting");

    let persistence = PersistenceStore::open(&settings.persistence.path).await?;

    let bus: Arc<dyn BusPublisher> = match AmqpBusPublisher::connect(&settings.broker.uri).await {
        Ok(publisher) => Arc::new(publisher),
        Err(e) => {
            tracing::warn!(error = %e, "could not reach AMQP broker, data publish is a no-op for this run");
            Arc::new(RecordingBusPublisher::new())
        }
    };

    let api = Arc::new(facade::build(persistence, DriverRegistry::with_builtins(), bus).await?);

    serve_status(api, &settings.status_server.bind).await
}

async fn serve_status(api: Arc<ServiceApi>, bind: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = bind.parse()?;
    let app = status::router(api);
    tracing::info!(%addr, "status server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

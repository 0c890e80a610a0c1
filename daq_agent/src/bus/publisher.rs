use std::sync::Mutex;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};

use crate::error::{AgentError, AgentResult};

/// One published message: a connection/job-scoped routing key plus a
/// compressed payload. `data_category`/`batch_num` are only set for
/// historical (harvester) publishes; a scan publish leaves both unset.
#[derive(Debug, Clone, Default)]
pub struct Publication {
    pub connection: String,
    pub job_id: String,
    pub payload: Vec<u8>,
    pub data_category: Option<String>,
    pub batch_num: Option<u64>,
}

/// The data bus: scan results and historical batches flow out through
/// a headers-matched exchange, one publish per job run.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, publication: Publication) -> AgentResult<()>;
}

const DATA_EXCHANGE: &str = "data_agent.data";

/// Real AMQP 0.9.1 publisher. The exchange is declared `headers` kind
/// so consumers can subscribe by `connection`/`job_id` header match
/// instead of a fixed routing-key hierarchy.
pub struct AmqpBusPublisher {
    channel: lapin::Channel,
}

impl AmqpBusPublisher {
    pub async fn connect(uri: &str) -> AgentResult<Self> {
        let conn = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| AgentError::Bus(e.to_string()))?;
        let channel = conn.create_channel().await.map_err(|e| AgentError::Bus(e.to_string()))?;
        channel
            .exchange_declare(
                DATA_EXCHANGE,
                ExchangeKind::Headers,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| AgentError::Bus(e.to_string()))?;
        Ok(Self { channel })
    }
}

#[async_trait]
impl BusPublisher for AmqpBusPublisher {
    async fn publish(&self, publication: Publication) -> AgentResult<()> {
        let mut headers = FieldTable::default();
        headers.insert("connection".into(), AMQPValue::LongString(publication.connection.clone().into()));
        headers.insert("job_id".into(), AMQPValue::LongString(publication.job_id.clone().into()));
        if let Some(category) = &publication.data_category {
            headers.insert("data_category".into(), AMQPValue::LongString(category.clone().into()));
        }
        if let Some(batch_num) = publication.batch_num {
            headers.insert("batch_num".into(), AMQPValue::LongLongInt(batch_num as i64));
        }

        self.channel
            .basic_publish(
                DATA_EXCHANGE,
                "",
                BasicPublishOptions::default(),
                &publication.payload,
                BasicProperties::default().with_headers(headers),
            )
            .await
            .map_err(|e| AgentError::Bus(e.to_string()))?
            .await
            .map_err(|e| AgentError::Bus(e.to_string()))?;
        Ok(())
    }
}

/// In-memory double used by tests and anywhere a broker isn't
/// available: records every publication instead of sending it.
#[derive(Default)]
pub struct RecordingBusPublisher {
    published: Mutex<Vec<Publication>>,
}

impl RecordingBusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Publication> {
        std::mem::take(&mut self.published.lock().unwrap())
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl BusPublisher for RecordingBusPublisher {
    async fn publish(&self, publication: Publication) -> AgentResult<()> {
        self.published.lock().unwrap().push(publication);
        Ok(())
    }
}

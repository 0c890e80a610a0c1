use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::codec::frame::Column;
use crate::connection::ConnectionManager;
use crate::drivers::traits::{TagAttributes, TagValue};
use crate::error::AgentResult;

/// Connection-to-connection data moves, bypassing the bus entirely.
/// Ported from `exchanger.py`'s `DataExchanger`. The original also
/// supports per-connection "groups" as copy destinations
/// (`write_group_values_period`/`write_tag_attributes`); this crate's
/// [`crate::drivers::traits::Driver`] intentionally drops the group
/// API (see DESIGN.md), so `copy_period` here replays the last sample
/// of each source tag as a scalar write to the same-named destination
/// tag, and `copy_attributes` is read-only.
pub struct DataExchanger {
    connections: Arc<ConnectionManager>,
}

impl DataExchanger {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    pub async fn copy_period(
        &self,
        src_conn: &str,
        tags: &[String],
        dest_conn: &str,
        first_timestamp: DateTime<Utc>,
        last_timestamp: DateTime<Utc>,
    ) -> AgentResult<HashMap<String, TagValue>> {
        let src = self.connections.connection(src_conn, true)?;
        let frame = src.read_tag_values_period(tags, Some(first_timestamp), Some(last_timestamp), None).await?;

        let mut last_values = HashMap::new();
        for (name, column) in &frame.columns {
            let value = match column {
                Column::Int(v) => v.last().map(|x| TagValue::Int(*x)),
                Column::Float(v) => v.last().map(|x| TagValue::Float(*x)),
                Column::Bool(v) => v.last().map(|x| TagValue::Bool(*x)),
                Column::Object(v) => v.last().and_then(value_to_tag_value),
            };
            if let Some(value) = value {
                last_values.insert(name.clone(), value);
            }
        }

        let dest = self.connections.connection(dest_conn, true)?;
        let written = dest.write_tag_values(last_values).await?;
        Ok(written.into_iter().map(|(k, v)| (k, v.value)).collect())
    }

    pub async fn copy_attributes(
        &self,
        src_conn: &str,
        tags: &[String],
        attributes: Option<&[String]>,
    ) -> AgentResult<HashMap<String, TagAttributes>> {
        let src = self.connections.connection(src_conn, true)?;
        src.read_tag_attributes(tags, attributes).await
    }
}

fn value_to_tag_value(value: &Value) -> Option<TagValue> {
    match value {
        Value::String(s) => Some(TagValue::String(s.clone())),
        Value::Bool(b) => Some(TagValue::Bool(*b)),
        Value::Number(n) => n.as_f64().map(TagValue::Float),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DriverRegistry;
    use crate::persistence::PersistenceStore;

    #[tokio::test]
    async fn copy_period_replays_last_sample() {
        let dir = std::env::temp_dir().join(format!(
            "daq_agent_exchanger_test_{}",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let persistence = PersistenceStore::open(dir.join("p.toml")).await.unwrap();
        let manager = ConnectionManager::restore(DriverRegistry::with_builtins(), persistence).await.unwrap();
        manager.create_connection("src", "fake", Default::default(), true, false).await.unwrap();
        manager.create_connection("dest", "fake", Default::default(), true, false).await.unwrap();

        let exchanger = DataExchanger::new(manager);
        let first = Utc::now();
        let last = first + chrono::Duration::hours(1);
        let written = exchanger
            .copy_period("src", &["Static.Int4".to_string()], "dest", first, last)
            .await
            .unwrap();
        assert!(written.contains_key("Static.Int4"));
    }
}

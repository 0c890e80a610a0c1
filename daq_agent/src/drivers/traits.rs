use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AgentResult;

/// Quality flag attached to every sampled or historical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    #[default]
    Initializing,
    CommFailure,
    ConfigError,
}

/// A scalar tag value. Numeric variants are what the Safe Manipulator
/// bound checks operate on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl TagValue {
    /// Numeric view used by the Safe Manipulator's bound checks.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Int(i) => Some(*i as f64),
            TagValue::Float(f) => Some(*f),
            TagValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// `{Value, Quality, Timestamp}` as read from a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagValueRecord {
    pub value: TagValue,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
}

impl TagValueRecord {
    pub fn good(value: TagValue, timestamp: DateTime<Utc>) -> Self {
        Self { value, quality: Quality::Good, timestamp }
    }

    pub fn bad(timestamp: DateTime<Utc>) -> Self {
        Self { value: TagValue::Null, quality: Quality::Bad, timestamp }
    }
}

/// Operations a driver kind may declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupportedOperation {
    ReadTagValues,
    ReadTagPeriod,
    ReadTagMeta,
    WriteTagValues,
}

/// Per-tag metadata returned by `list_tags`/`read_tag_attributes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagAttributes {
    pub display_name: Option<String>,
    pub has_children: bool,
    pub data_type: Option<String>,
    pub extra: HashMap<String, serde_json::Value>,
}

/// Connection parameters passed to a driver factory at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    pub id: String,
    pub kind: String,
    pub params: HashMap<String, serde_json::Value>,
}

/// Connectivity/session diagnostics returned by `connection_info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub target: String,
    pub details: HashMap<String, serde_json::Value>,
}

pub type DriverResult<T> = AgentResult<T>;

/// A pluggable data source. Implementations wrap whatever protocol
/// client is needed (OPC UA, a historian SDK, ...); this crate ships
/// only the `fake` reference implementation.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable, lower-case type name used in persistence and registry lookup.
    fn kind(&self) -> &'static str;

    fn category(&self) -> &'static str {
        "historian"
    }

    fn supported_operations(&self) -> &'static [SupportedOperation];

    /// Schema of the `params` map this driver's config accepts. Keys
    /// are parameter names, values are human-readable type hints.
    fn connection_fields(&self) -> HashMap<&'static str, &'static str> {
        HashMap::new()
    }

    async fn connect(&self) -> DriverResult<()>;
    async fn disconnect(&self) -> DriverResult<()>;
    fn connected(&self) -> bool;
    fn connection_info(&self) -> ConnectionInfo;

    async fn list_tags(
        &self,
        filter: &str,
        include_attributes: bool,
        recursive: bool,
        max_results: usize,
    ) -> DriverResult<HashMap<String, TagAttributes>>;

    async fn read_tag_attributes(
        &self,
        tags: &[String],
        attributes: Option<&[String]>,
    ) -> DriverResult<HashMap<String, TagAttributes>>;

    async fn read_tag_values(&self, tags: &[String]) -> DriverResult<HashMap<String, TagValueRecord>>;

    async fn read_tag_values_period(
        &self,
        tags: &[String],
        first_timestamp: Option<DateTime<Utc>>,
        last_timestamp: Option<DateTime<Utc>>,
        max_results: Option<usize>,
    ) -> DriverResult<crate::codec::frame::Frame>;

    async fn write_tag_values(
        &self,
        values: HashMap<String, TagValue>,
    ) -> DriverResult<HashMap<String, TagValueRecord>>;

    /// Static-ish target description; driver kinds that don't browse a
    /// remote target can return a fixed value as the fake driver does.
    fn target_info(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }
}

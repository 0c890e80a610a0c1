use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

/// A single typed column of a [`Frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
    /// Free-form column: strings, booleans mixed with nulls, etc.
    Object(Vec<serde_json::Value>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Object(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A historical tag-value table: one timestamp index plus one column
/// per requested tag, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub index_name: String,
    pub timestamps: Vec<DateTime<Utc>>,
    pub columns: Vec<(String, Column)>,
}

impl Frame {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self { index_name: index_name.into(), timestamps: Vec::new(), columns: Vec::new() }
    }

    pub fn num_rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn num_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }
}

/// On-wire representation. A thin, explicit decomposition of [`Frame`]
/// (timestamps, per-column data, column order, index name) serialized
/// with `rmp-serde` and compressed with `zstd` — the logical
/// equivalent of the original packer's timestamp/numeric/object/meta
/// split, without needing hand-rolled msgpack extension type codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncodedFrame {
    index_name: String,
    timestamps: Vec<i64>,
    columns: Vec<(String, Column)>,
}

/// Zstd compression level applied to the encoded frame payload.
const ZSTD_LEVEL: i32 = 3;

pub fn encode(frame: &Frame) -> AgentResult<Vec<u8>> {
    let encoded = EncodedFrame {
        index_name: frame.index_name.clone(),
        timestamps: frame.timestamps.iter().map(|t| t.timestamp_millis()).collect(),
        columns: frame.columns.clone(),
    };
    let packed = rmp_serde::to_vec(&encoded).map_err(|e| AgentError::Codec(e.to_string()))?;
    zstd::stream::encode_all(packed.as_slice(), ZSTD_LEVEL).map_err(|e| AgentError::Codec(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> AgentResult<Frame> {
    let packed = zstd::stream::decode_all(bytes).map_err(|e| AgentError::Codec(e.to_string()))?;
    let encoded: EncodedFrame =
        rmp_serde::from_slice(&packed).map_err(|e| AgentError::Codec(e.to_string()))?;
    let timestamps = encoded
        .timestamps
        .into_iter()
        .map(|ms| {
            DateTime::from_timestamp_millis(ms).ok_or_else(|| AgentError::Codec(format!("out of range timestamp: {ms}")))
        })
        .collect::<AgentResult<Vec<_>>>()?;
    Ok(Frame { index_name: encoded.index_name, timestamps, columns: encoded.columns })
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::codec::frame::{Column, Frame};
use crate::drivers::traits::{
    ConnectionInfo, Driver, DriverResult, Quality, SupportedOperation, TagAttributes, TagValue,
    TagValueRecord,
};
use crate::error::AgentError;

#[derive(Debug, Clone)]
struct Leaf {
    value: TagValue,
    quality: Quality,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf(Leaf),
    Branch(HashMap<String, Node>),
}

fn branch(children: Vec<(&str, Node)>) -> Node {
    Node::Branch(children.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn leaf(value: TagValue, ts: DateTime<Utc>) -> Node {
    Node::Leaf(Leaf { value, quality: Quality::Good, timestamp: ts })
}

const SUPPORTED_OPS: &[SupportedOperation] =
    &[SupportedOperation::ReadTagPeriod, SupportedOperation::ReadTagValues, SupportedOperation::ReadTagMeta];

/// Deterministic in-memory reference driver. Ported from the original
/// project's `fake_connector.py` — a static tree under `Static.*` and a
/// slowly-changing tree under `Random.*`, used for tests and demos.
pub struct FakeDriver {
    id: String,
    connected: AtomicBool,
    tags: Mutex<Node>,
}

impl FakeDriver {
    pub fn new(id: String) -> Self {
        let fixed_ts = Utc.with_ymd_and_hms(2021, 9, 2, 7, 42, 22).unwrap();
        let tags = branch(vec![
            ("Static", branch(vec![
                ("Float", leaf(TagValue::Float(83289.48243), fixed_ts)),
                ("Int4", leaf(TagValue::Int(12345), fixed_ts)),
            ])),
            ("Random", branch(vec![
                ("Real8", leaf(TagValue::Float(4289.84243), fixed_ts)),
                ("String", leaf(TagValue::String("Hello".to_string()), fixed_ts)),
            ])),
        ]);
        Self { id, connected: AtomicBool::new(false), tags: Mutex::new(tags) }
    }

    fn update_random(&self) {
        let now = Utc::now();
        let mut tags = self.tags.lock().unwrap();
        if let Node::Branch(root) = &mut *tags {
            if let Some(Node::Branch(random)) = root.get_mut("Random") {
                let tick = now.timestamp_millis() as u64;
                let value = ((tick % 1000) as f64) + 0.84243;
                if let Some(Node::Leaf(l)) = random.get_mut("Real8") {
                    l.value = TagValue::Float(value);
                    l.timestamp = now;
                }
                let words = ["We", "are", "going", "to", "win", "this", "race."];
                let word = words[(tick as usize) % words.len()];
                if let Some(Node::Leaf(l)) = random.get_mut("String") {
                    l.value = TagValue::String(word.to_string());
                    l.timestamp = now;
                }
            }
        }
    }

    fn lookup<'a>(root: &'a Node, path: &str) -> Option<&'a Node> {
        if path.is_empty() {
            return Some(root);
        }
        let mut node = root;
        for segment in path.split('.') {
            match node {
                Node::Branch(children) => node = children.get(segment)?,
                Node::Leaf(_) => return None,
            }
        }
        Some(node)
    }

    fn leaf_at(&self, path: &str) -> DriverResult<Leaf> {
        let tags = self.tags.lock().unwrap();
        match Self::lookup(&tags, path) {
            Some(Node::Leaf(l)) => Ok(l.clone()),
            Some(Node::Branch(_)) => Err(AgentError::TagNotRegistered(format!("{path} is not a leaf tag"))),
            None => Err(AgentError::TagNotRegistered(path.to_string())),
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn supported_operations(&self) -> &'static [SupportedOperation] {
        SUPPORTED_OPS
    }

    async fn connect(&self) -> DriverResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo { target: self.id.clone(), details: HashMap::new() }
    }

    async fn list_tags(
        &self,
        filter: &str,
        include_attributes: bool,
        _recursive: bool,
        max_results: usize,
    ) -> DriverResult<HashMap<String, TagAttributes>> {
        self.update_random();
        let tags = self.tags.lock().unwrap();
        let subtree = Self::lookup(&tags, filter)
            .ok_or_else(|| AgentError::TagNotRegistered(filter.to_string()))?;
        let children = match subtree {
            Node::Branch(children) => children,
            Node::Leaf(_) => return Err(AgentError::InvalidArgument(format!("{filter} is a leaf tag"))),
        };

        let mut out = HashMap::new();
        for (name, node) in children {
            let key = if filter.is_empty() { name.clone() } else { format!("{filter}.{name}") };
            let has_children = matches!(node, Node::Branch(_));
            let mut attrs = TagAttributes { display_name: Some(name.clone()), has_children, ..Default::default() };
            if include_attributes {
                if let Node::Leaf(l) = node {
                    attrs.extra.insert("value".to_string(), serde_json::to_value(&l.value).unwrap());
                    attrs.extra.insert("quality".to_string(), serde_json::to_value(l.quality).unwrap());
                }
            }
            out.insert(key, attrs);
            if max_results != 0 && out.len() >= max_results {
                break;
            }
        }
        Ok(out)
    }

    async fn read_tag_attributes(
        &self,
        tags: &[String],
        _attributes: Option<&[String]>,
    ) -> DriverResult<HashMap<String, TagAttributes>> {
        self.update_random();
        let mut out = HashMap::new();
        for tag in tags {
            let leaf = self.leaf_at(tag)?;
            out.insert(tag.clone(), TagAttributes {
                display_name: tag.rsplit('.').next().map(str::to_string),
                has_children: false,
                data_type: Some(match leaf.value {
                    TagValue::Int(_) => "Int4".to_string(),
                    TagValue::Float(_) => "Double Float".to_string(),
                    TagValue::String(_) => "String".to_string(),
                    TagValue::Bool(_) => "Bool".to_string(),
                    TagValue::Null => "Null".to_string(),
                }),
                extra: HashMap::new(),
            });
        }
        Ok(out)
    }

    async fn read_tag_values(&self, tags: &[String]) -> DriverResult<HashMap<String, TagValueRecord>> {
        self.update_random();
        let mut out = HashMap::new();
        for tag in tags {
            let leaf = self.leaf_at(tag)?;
            out.insert(tag.clone(), TagValueRecord { value: leaf.value, quality: leaf.quality, timestamp: leaf.timestamp });
        }
        Ok(out)
    }

    async fn read_tag_values_period(
        &self,
        tags: &[String],
        first_timestamp: Option<DateTime<Utc>>,
        _last_timestamp: Option<DateTime<Utc>>,
        max_results: Option<usize>,
    ) -> DriverResult<Frame> {
        self.update_random();
        for tag in tags {
            self.leaf_at(tag)?;
        }
        let rows = max_results.unwrap_or(100);
        let start = first_timestamp.unwrap_or_else(|| Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap());
        let timestamps: Vec<_> = (0..rows).map(|i| start + chrono::Duration::days(30 * i as i64)).collect();

        let mut frame = Frame::new("timestamp");
        frame.timestamps = timestamps;
        for (i, tag) in tags.iter().enumerate() {
            let values: Vec<f64> = (0..rows).map(|r| ((r * 7 + i * 13) % 997) as f64 / 997.0).collect();
            frame.columns.push((tag.clone(), Column::Float(values)));
        }
        Ok(frame)
    }

    async fn write_tag_values(
        &self,
        values: HashMap<String, TagValue>,
    ) -> DriverResult<HashMap<String, TagValueRecord>> {
        let now = Utc::now();
        let mut out = HashMap::new();
        let mut tags = self.tags.lock().unwrap();
        for (tag, value) in values {
            let path: Vec<&str> = tag.split('.').collect();
            let Some((last, parents)) = path.split_last() else { continue };
            let mut node = &mut *tags;
            let mut ok = true;
            for segment in parents {
                match node {
                    Node::Branch(children) => match children.get_mut(*segment) {
                        Some(child) => node = child,
                        None => {
                            ok = false;
                            break;
                        }
                    },
                    Node::Leaf(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                out.insert(tag.clone(), TagValueRecord::bad(now));
                continue;
            }
            if let Node::Branch(children) = node {
                if let Some(Node::Leaf(l)) = children.get_mut(*last) {
                    l.value = value.clone();
                    l.timestamp = now;
                    out.insert(tag, TagValueRecord::good(value, now));
                    continue;
                }
            }
            out.insert(tag.clone(), TagValueRecord::bad(now));
        }
        Ok(out)
    }

    fn target_info(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("Name".to_string(), serde_json::json!("absolute-fake"));
        map.insert("Endpoints".to_string(), serde_json::json!([]));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_then_read_static_tag() {
        let driver = FakeDriver::new("test".to_string());
        driver.connect().await.unwrap();
        assert!(driver.connected());
        let values = driver.read_tag_values(&["Static.Float".to_string()]).await.unwrap();
        let rec = values.get("Static.Float").unwrap();
        assert_eq!(rec.quality, Quality::Good);
        assert_eq!(rec.value, TagValue::Float(83289.48243));
    }

    #[tokio::test]
    async fn list_tags_reports_branches_and_leaves() {
        let driver = FakeDriver::new("test".to_string());
        let listed = driver.list_tags("", false, false, 0).await.unwrap();
        assert!(listed.contains_key("Static"));
        assert!(listed.contains_key("Random"));
        assert!(listed["Static"].has_children);
    }

    #[tokio::test]
    async fn read_unknown_tag_errors() {
        let driver = FakeDriver::new("test".to_string());
        let err = driver.read_tag_values(&["Nope.Tag".to_string()]).await.unwrap_err();
        assert!(matches!(err, AgentError::TagNotRegistered(_)));
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let driver = FakeDriver::new("test".to_string());
        let mut values = HashMap::new();
        values.insert("Static.Int4".to_string(), TagValue::Int(99));
        let result = driver.write_tag_values(values).await.unwrap();
        assert_eq!(result["Static.Int4"].quality, Quality::Good);
        let read_back = driver.read_tag_values(&["Static.Int4".to_string()]).await.unwrap();
        assert_eq!(read_back["Static.Int4"].value, TagValue::Int(99));
    }

    #[tokio::test]
    async fn read_period_returns_one_column_per_tag() {
        let driver = FakeDriver::new("test".to_string());
        let frame = driver
            .read_tag_values_period(&["Static.Float".to_string(), "Static.Int4".to_string()], None, None, Some(5))
            .await
            .unwrap();
        assert_eq!(frame.num_rows(), 5);
        assert_eq!(frame.num_cols(), 2);
    }
}

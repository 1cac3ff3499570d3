use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use fieldmq_codec::QoS;

use crate::error::EngineError;
use crate::value::ValueCodec;

/// Which way values flow between the field and its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
    ReadWrite,
}

impl Direction {
    #[inline]
    pub fn readable(self) -> bool {
        matches!(self, Direction::Read | Direction::ReadWrite)
    }

    #[inline]
    pub fn writable(self) -> bool {
        matches!(self, Direction::Write | Direction::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Bool,
    Number,
    Text,
}

/// Field definition as reported to the platform once per connection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub writable: bool,
}

/// One configured field-to-topic mapping. Immutable after configuration load.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FieldBinding {
    pub field: String,
    pub topic: String,
    #[serde(default = "FieldBinding::direction_default")]
    pub direction: Direction,
    #[serde(
        default = "FieldBinding::qos_default",
        deserialize_with = "FieldBinding::deserialize_qos",
        serialize_with = "FieldBinding::serialize_qos"
    )]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    /// Value published once per connection cycle, right after subscribing.
    #[serde(default)]
    pub seed: Option<String>,
    pub codec: ValueCodec,
}

impl FieldBinding {
    fn direction_default() -> Direction {
        Direction::Read
    }

    fn qos_default() -> QoS {
        QoS::AtMostOnce
    }

    #[inline]
    pub fn deserialize_qos<'de, D>(deserializer: D) -> Result<QoS, D::Error>
    where
        D: Deserializer<'de>,
    {
        match u8::deserialize(deserializer)? {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            _ => Err(de::Error::custom("binding qos must be 0 or 1")),
        }
    }

    #[inline]
    pub fn serialize_qos<S>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u8::from(*qos).serialize(serializer)
    }

    pub fn kind(&self) -> FieldKind {
        match self.codec {
            ValueCodec::Bool { .. } => FieldKind::Bool,
            ValueCodec::Number { .. } => FieldKind::Number,
            ValueCodec::Text | ValueCodec::Pattern { .. } => FieldKind::Text,
        }
    }
}

/// Immutable field-topic map built at configuration load.
///
/// Lookup goes both ways: by topic for inbound publishes (several read-only
/// fields may share one topic) and by field name for outbound writes.
#[derive(Debug, Clone)]
pub struct BindingTable {
    bindings: Arc<Vec<FieldBinding>>,
    by_field: HashMap<String, usize>,
    readers_by_topic: HashMap<String, Vec<usize>>,
    read_topics: Vec<String>,
}

impl BindingTable {
    pub fn build(bindings: Vec<FieldBinding>) -> Result<Self, EngineError> {
        let mut by_field = HashMap::new();
        let mut readers_by_topic: HashMap<String, Vec<usize>> = HashMap::new();
        let mut read_topics = Vec::new();
        let mut write_topics = HashSet::new();

        for (idx, b) in bindings.iter().enumerate() {
            if b.field.is_empty() {
                return Err(EngineError::Config(format!("binding {idx} has an empty field name")));
            }
            if b.topic.is_empty() {
                return Err(EngineError::Config(format!("field {:?} has an empty topic", b.field)));
            }
            if b.topic.contains(['+', '#']) {
                return Err(EngineError::Config(format!(
                    "field {:?}: wildcard topics are not supported, {:?}",
                    b.field, b.topic
                )));
            }
            if by_field.insert(b.field.clone(), idx).is_some() {
                return Err(EngineError::Config(format!("field {:?} is bound more than once", b.field)));
            }
            if b.direction.writable() && !write_topics.insert(b.topic.clone()) {
                return Err(EngineError::Config(format!(
                    "topic {:?} has more than one write-capable binding",
                    b.topic
                )));
            }
            if b.direction.readable() {
                let readers = readers_by_topic.entry(b.topic.clone()).or_default();
                if readers.is_empty() {
                    read_topics.push(b.topic.clone());
                }
                readers.push(idx);
            }
        }

        Ok(BindingTable { bindings: Arc::new(bindings), by_field, readers_by_topic, read_topics })
    }

    #[inline]
    pub fn get(&self, field: &str) -> Option<&FieldBinding> {
        self.by_field.get(field).map(|idx| &self.bindings[*idx])
    }

    #[inline]
    pub fn readers(&self, topic: &str) -> &[usize] {
        self.readers_by_topic.get(topic).map(Vec::as_slice).unwrap_or_default()
    }

    #[inline]
    pub fn binding(&self, idx: usize) -> &FieldBinding {
        &self.bindings[idx]
    }

    /// Unique read topics, in first-seen binding order.
    #[inline]
    pub fn read_topics(&self) -> &[String] {
        &self.read_topics
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &FieldBinding> {
        self.bindings.iter()
    }

    pub fn field_defs(&self) -> Vec<FieldDef> {
        self.bindings
            .iter()
            .map(|b| FieldDef { name: b.field.clone(), kind: b.kind(), writable: b.direction.writable() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(field: &str, topic: &str, direction: Direction) -> FieldBinding {
        FieldBinding {
            field: field.into(),
            topic: topic.into(),
            direction,
            qos: QoS::AtMostOnce,
            retain: false,
            seed: None,
            codec: ValueCodec::Text,
        }
    }

    #[test]
    fn test_lookup() {
        let table = BindingTable::build(vec![
            binding("Hall.Motion", "home/hall/motion", Direction::Read),
            binding("Hall.Motion.Raw", "home/hall/motion", Direction::Read),
            binding("Hall.Lamp", "home/hall/lamp/set", Direction::Write),
        ])
        .unwrap();

        assert_eq!(table.read_topics(), ["home/hall/motion"]);
        assert_eq!(table.readers("home/hall/motion").len(), 2);
        assert!(table.readers("home/hall/lamp/set").is_empty());
        assert_eq!(table.get("Hall.Lamp").unwrap().topic, "home/hall/lamp/set");
        assert!(table.get("Hall.Missing").is_none());
    }

    #[test]
    fn test_read_topics_unique_and_ordered() {
        let table = BindingTable::build(vec![
            binding("A", "t/1", Direction::Read),
            binding("B", "t/2", Direction::ReadWrite),
            binding("C", "t/1", Direction::Read),
        ])
        .unwrap();
        assert_eq!(table.read_topics(), ["t/1", "t/2"]);
    }

    #[test]
    fn test_rejects_duplicate_field() {
        let err = BindingTable::build(vec![
            binding("A", "t/1", Direction::Read),
            binding("A", "t/2", Direction::Read),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_rejects_shared_write_topic() {
        let err = BindingTable::build(vec![
            binding("A", "t/1", Direction::Write),
            binding("B", "t/1", Direction::ReadWrite),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_rejects_wildcard_topic() {
        let err = BindingTable::build(vec![binding("A", "t/#", Direction::Read)]).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_field_defs() {
        let mut b = binding("Hall.Temp", "home/hall/temp", Direction::Read);
        b.codec = ValueCodec::Number { min: None, max: None };
        let table = BindingTable::build(vec![b]).unwrap();
        let defs = table.field_defs();
        assert_eq!(
            defs,
            vec![FieldDef { name: "Hall.Temp".into(), kind: FieldKind::Number, writable: false }]
        );
    }
}

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::types::*;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    Rect,
    Ellipse,
    Line,
    Path,
    Text,
    Image,
}

/// Geometry and style of a shape. The format belongs to the renderer, so this
/// crate never looks inside it.
///
/// Human-readable formats carry the payload inline; binary formats (bincode)
/// carry it as a JSON string, since they cannot describe arbitrary values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Attributes(Value);

impl Attributes {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl From<Value> for Attributes {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl Serialize for Attributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            serializer.serialize_str(&self.0.to_string())
        }
    }
}

impl<'de> Deserialize<'de> for Attributes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            Value::deserialize(deserializer).map(Self)
        } else {
            let raw = String::deserialize(deserializer)?;
            serde_json::from_str(&raw)
                .map(Self)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub attributes: Attributes,
    pub last_modified_by: UserId,
    pub last_modified_seq: Seq,
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type Id = String;

/// Attribute map keyed by attribute key. Ordered so persisted documents and
/// reports are deterministic.
pub type SpecMap = BTreeMap<String, serde_json::Value>;

/// Reserved key carrying the overflow bucket, both in candidate maps and in
/// the persisted document.
pub const OVERFLOW_KEY: &str = "_overflow";

/// The two independent record namespaces that carry specs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Material,
    Equipment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Material => "material",
            EntityKind::Equipment => "equipment",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "material" => Ok(EntityKind::Material),
            "equipment" => Ok(EntityKind::Equipment),
            other => Err(anyhow::anyhow!("Unknown entity kind '{}'", other)),
        }
    }
}

/// A category within one namespace (e.g. equipment/pump)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CategoryRef {
    pub kind: EntityKind,
    pub name: String,
}

impl CategoryRef {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn material(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Material, name)
    }

    pub fn equipment(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Equipment, name)
    }
}

impl fmt::Display for CategoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Identity of a material or equipment record owning a spec document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceRef {
    pub kind: EntityKind,
    pub id: Id,
}

impl InstanceRef {
    pub fn new(kind: EntityKind, id: impl Into<Id>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn material(id: impl Into<Id>) -> Self {
        Self::new(EntityKind::Material, id)
    }

    pub fn equipment(id: impl Into<Id>) -> Self {
        Self::new(EntityKind::Equipment, id)
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Short human-readable rendering of a JSON value for error messages
pub fn describe_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => format!("\"{}\"", s),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

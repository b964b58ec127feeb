//! Schema declaration boundary: the `join` field of a mapping definition.
//!
//! ```json
//! {"properties": {"join_field": {
//!     "type": "join",
//!     "eager_global_ordinals": true,
//!     "relations": {"question": ["answer", "comment"], "answer": "vote"}
//! }}}
//! ```
//!
//! A relation value may be one child role or a list; both forms normalize to
//! an ordered list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{MappingError, SchemaError};

use super::RelationSchema;

const JOIN_TYPE: &str = "join";

/// Child roles as written in a mapping: a single name or a list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildRoles {
    /// `"parent": "child"`
    One(String),
    /// `"parent": ["child1", "child2"]`
    Many(Vec<String>),
}

impl ChildRoles {
    /// Normalizes both forms into an ordered list.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ChildRoles::One(role) => vec![role],
            ChildRoles::Many(roles) => roles,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMapping {
    #[serde(default)]
    properties: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawJoinField {
    #[serde(rename = "type")]
    _ty: String,
    #[serde(default = "default_eager")]
    eager_global_ordinals: bool,
    #[serde(default)]
    relations: BTreeMap<String, ChildRoles>,
}

fn default_eager() -> bool {
    true
}

/// Parsed declaration of a join field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinFieldMapping {
    /// Name of the join field inside document sources.
    pub field: String,
    /// Build ordinals on first write instead of first query.
    pub eager_global_ordinals: bool,
    /// `(parent, children)` pairs in declaration order.
    pub relations: Vec<(String, Vec<String>)>,
}

impl JoinFieldMapping {
    /// Creates a mapping from explicit relations.
    pub fn new(
        field: impl Into<String>,
        eager_global_ordinals: bool,
        relations: Vec<(String, Vec<String>)>,
    ) -> Self {
        Self {
            field: field.into(),
            eager_global_ordinals,
            relations,
        }
    }

    /// Builds a mapping from `(parent, "child1,child2")` pairs.
    pub fn from_simplified(field: &str, eager_global_ordinals: bool, pairs: &[(&str, &str)]) -> Self {
        let relations = pairs
            .iter()
            .map(|(parent, children)| {
                let children = children
                    .split(',')
                    .map(str::trim)
                    .filter(|child| !child.is_empty())
                    .map(str::to_string)
                    .collect();
                (parent.to_string(), children)
            })
            .collect();
        Self::new(field, eager_global_ordinals, relations)
    }

    /// Parses a mapping document and extracts its single join field.
    pub fn from_json_str(text: &str) -> Result<Self, MappingError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Extracts the join field from an already decoded mapping document.
    pub fn from_value(value: &Value) -> Result<Self, MappingError> {
        let raw = RawMapping::deserialize(value)?;
        let mut found: Option<Self> = None;
        for (name, field) in raw.properties {
            let is_join = field.get("type").and_then(Value::as_str) == Some(JOIN_TYPE);
            if !is_join {
                continue;
            }
            if let Some(first) = &found {
                return Err(MappingError::MultipleJoinFields {
                    first: first.field.clone(),
                    second: name,
                });
            }
            let join = RawJoinField::deserialize(&field)?;
            let relations = join
                .relations
                .into_iter()
                .map(|(parent, children)| (parent, children.into_vec()))
                .collect();
            found = Some(Self::new(name, join.eager_global_ordinals, relations));
        }
        let mapping = found.ok_or(MappingError::NoJoinField)?;
        mapping.schema()?;
        Ok(mapping)
    }

    /// Validates the relations into a [`RelationSchema`].
    pub fn schema(&self) -> Result<RelationSchema, SchemaError> {
        RelationSchema::from_relations(
            self.relations
                .iter()
                .map(|(parent, children)| (parent.as_str(), children.iter())),
        )
    }

    /// Renders the mapping back to its JSON declaration.
    ///
    /// Single-child relations are written as a plain string.
    pub fn to_value(&self) -> Value {
        let mut relations = Map::new();
        for (parent, children) in &self.relations {
            let value = match children.as_slice() {
                [only] => Value::String(only.clone()),
                many => Value::Array(many.iter().cloned().map(Value::String).collect()),
            };
            relations.insert(parent.clone(), value);
        }
        let mut properties = Map::new();
        properties.insert(
            self.field.clone(),
            json!({
                "type": JOIN_TYPE,
                "eager_global_ordinals": self.eager_global_ordinals,
                "relations": relations,
            }),
        );
        json!({ "properties": properties })
    }
}

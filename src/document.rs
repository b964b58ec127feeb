//! Indexing boundary: documents carrying a join-field object.
//!
//! A source names its role under the join field, either as an object
//! `{"name": "answer", "parent": "1"}` or, for documents without a parent, as
//! the shorthand string `"question"`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DocumentError;

const NAME_KEY: &str = "name";
const PARENT_KEY: &str = "parent";

/// Identity of a document in the join hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinDocument {
    /// Document identifier, unique within the index.
    pub id: String,
    /// Role drawn from the relation schema.
    pub role: String,
    /// Identifier of the parent document, for child roles.
    pub parent_id: Option<String>,
}

impl JoinDocument {
    /// Document without a parent.
    pub fn root(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            parent_id: None,
        }
    }

    /// Document pointing at `parent_id`.
    pub fn child(
        id: impl Into<String>,
        role: impl Into<String>,
        parent_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            parent_id: Some(parent_id.into()),
        }
    }

    /// Reads the join field `field` out of a document source.
    pub fn from_source(id: &str, field: &str, source: &Value) -> Result<Self, DocumentError> {
        let invalid = |reason| DocumentError::InvalidJoinField {
            id: id.to_string(),
            field: field.to_string(),
            reason,
        };
        let value = source
            .get(field)
            .ok_or_else(|| DocumentError::MissingJoinField {
                id: id.to_string(),
                field: field.to_string(),
            })?;
        match value {
            Value::String(role) => Ok(Self::root(id, role.as_str())),
            Value::Object(object) => {
                let role = object
                    .get(NAME_KEY)
                    .ok_or_else(|| invalid("missing [name]"))?
                    .as_str()
                    .ok_or_else(|| invalid("[name] must be a string"))?;
                let parent_id = match object.get(PARENT_KEY) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(parent)) => Some(parent.clone()),
                    Some(Value::Number(parent)) => Some(parent.to_string()),
                    Some(_) => return Err(invalid("[parent] must be a string or number")),
                };
                Ok(Self {
                    id: id.to_string(),
                    role: role.to_string(),
                    parent_id,
                })
            }
            _ => Err(invalid("expected a role name or an object")),
        }
    }
}

/// Request to index one document, as received from the storage layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexRequest {
    /// Document identifier.
    pub id: String,
    /// Caller-supplied routing value, checked against the join's routing.
    #[serde(default)]
    pub routing: Option<String>,
    /// Full document source including the join field.
    pub source: Value,
}

impl IndexRequest {
    /// Request with no routing override.
    pub fn new(id: impl Into<String>, source: Value) -> Self {
        Self {
            id: id.into(),
            routing: None,
            source,
        }
    }

    /// Sets the caller-declared routing value.
    pub fn with_routing(mut self, routing: impl Into<String>) -> Self {
        self.routing = Some(routing.into());
        self
    }

    /// Builds a request for `role`, embedding the join object under `field`.
    ///
    /// Children are routed by their parent identifier, the way a client
    /// library would do it.
    pub fn for_role(
        field: &str,
        id: impl Into<String>,
        role: &str,
        parent: Option<&str>,
        mut fields: Map<String, Value>,
    ) -> Self {
        let mut join = Map::new();
        join.insert(NAME_KEY.to_string(), Value::String(role.to_string()));
        if let Some(parent) = parent {
            join.insert(PARENT_KEY.to_string(), Value::String(parent.to_string()));
        }
        fields.insert(field.to_string(), Value::Object(join));
        Self {
            id: id.into(),
            routing: parent.map(str::to_string),
            source: Value::Object(fields),
        }
    }

    /// Extracts the join identity of this request.
    pub fn join_document(&self, field: &str) -> Result<JoinDocument, DocumentError> {
        JoinDocument::from_source(&self.id, field, &self.source)
    }
}

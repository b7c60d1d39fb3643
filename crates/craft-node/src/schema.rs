//! Message type schemas.
//!
//! A node may restrict what it accepts to a set of [`AcceptedType`]s. Each one
//! is either a bare JSON type (the whole payload must be, say, a string) or a
//! [`MessageSchema`] describing a JSON object tagged with a `message_type`.
//!
//! Schemas can be built in code or parsed from a JSON description:
//!
//! ```json
//! {
//!   "message_type": "Transfer",
//!   "mandatory_fields": { "from": "hash", "amount": "int", "sig": "signature" },
//!   "optional_fields": { "memo": "str", "tags": ["str"], "parent": "@Transfer" }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::error::{NodeError, NodeResult};

/// Plain JSON value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// JSON string.
    Str,
    /// JSON integer. Booleans do not count.
    Int,
    /// JSON number with a fractional or exponent part.
    Float,
    /// JSON boolean.
    Bool,
    /// JSON array of anything.
    List,
    /// JSON object of anything.
    Dict,
}

impl Primitive {
    /// Returns true if `value` is of this kind.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Str => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_f64(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Dict => value.is_object(),
        }
    }

    /// Name used in JSON descriptions.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Dict => "dict",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "str" => Self::Str,
            "int" => Self::Int,
            "float" => Self::Float,
            "bool" => Self::Bool,
            "list" => Self::List,
            "dict" => Self::Dict,
            _ => return None,
        })
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type of a single field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// A plain JSON kind.
    Primitive(Primitive),
    /// A string of exactly 64 characters.
    Hash,
    /// A string of 130, 132, 134, 136, 140 or 142 characters.
    Signature,
    /// An array whose elements all have the inner type.
    SequenceOf(Box<FieldType>),
    /// A nested object.
    Object(Box<ObjectSchema>),
    /// An object shaped like the registered message type of that name.
    Ref(String),
}

impl FieldType {
    /// String field.
    pub const STR: Self = Self::Primitive(Primitive::Str);
    /// Integer field.
    pub const INT: Self = Self::Primitive(Primitive::Int);
    /// Float field.
    pub const FLOAT: Self = Self::Primitive(Primitive::Float);
    /// Boolean field.
    pub const BOOL: Self = Self::Primitive(Primitive::Bool);

    /// Sequence of `inner`.
    #[must_use]
    pub fn sequence_of(inner: Self) -> Self {
        Self::SequenceOf(Box::new(inner))
    }

    /// Nested object.
    #[must_use]
    pub fn object(schema: ObjectSchema) -> Self {
        Self::Object(Box::new(schema))
    }

    /// Reference to a registered message type.
    #[must_use]
    pub fn reference(message_type: impl Into<String>) -> Self {
        Self::Ref(message_type.into())
    }

    /// Parses a field type description.
    pub fn from_json(value: &Value) -> NodeResult<Self> {
        match value {
            Value::String(name) => {
                if let Some(target) = name.strip_prefix('@') {
                    if target.is_empty() {
                        return Err(NodeError::Schema("empty type reference".into()));
                    }
                    return Ok(Self::Ref(target.to_string()));
                }
                match name.as_str() {
                    "hash" => Ok(Self::Hash),
                    "signature" => Ok(Self::Signature),
                    other => Primitive::from_name(other)
                        .map(Self::Primitive)
                        .ok_or_else(|| NodeError::Schema(format!("unknown field type {other:?}"))),
                }
            }
            Value::Array(items) => match items.as_slice() {
                [inner] => Ok(Self::sequence_of(Self::from_json(inner)?)),
                _ => Err(NodeError::Schema(
                    "sequence type must list exactly one element type".into(),
                )),
            },
            Value::Object(_) => Ok(Self::object(ObjectSchema::from_json(value)?)),
            other => Err(NodeError::Schema(format!("invalid field type {other}"))),
        }
    }
}

/// Mandatory and optional fields of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ObjectSchema {
    /// Fields that must be present and well typed.
    pub mandatory_fields: BTreeMap<String, FieldType>,
    /// Fields that must be well typed when present.
    pub optional_fields: BTreeMap<String, FieldType>,
}

impl ObjectSchema {
    /// Creates a schema with no fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mandatory field.
    #[must_use]
    pub fn mandatory(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.mandatory_fields.insert(name.into(), ty);
        self
    }

    /// Adds an optional field.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.optional_fields.insert(name.into(), ty);
        self
    }

    /// Parses `{"mandatory_fields": {..}, "optional_fields": {..}}`. Both
    /// keys may be omitted.
    pub fn from_json(value: &Value) -> NodeResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| NodeError::Schema("object schema must be a JSON object".into()))?;
        Ok(Self {
            mandatory_fields: parse_fields(map.get("mandatory_fields"), "mandatory_fields")?,
            optional_fields: parse_fields(map.get("optional_fields"), "optional_fields")?,
        })
    }
}

fn parse_fields(value: Option<&Value>, section: &str) -> NodeResult<BTreeMap<String, FieldType>> {
    let Some(value) = value else {
        return Ok(BTreeMap::new());
    };
    let map = value
        .as_object()
        .ok_or_else(|| NodeError::Schema(format!("{section} must be a JSON object")))?;
    map.iter()
        .map(|(name, ty)| {
            FieldType::from_json(ty)
                .map(|ty| (name.clone(), ty))
                .map_err(|e| NodeError::Schema(format!("{section}.{name}: {e}")))
        })
        .collect()
}

/// Schema for an object payload tagged with `"message_type": <name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageSchema {
    /// Required value of the payload's `message_type` field.
    pub message_type: String,
    /// Field layout.
    pub fields: ObjectSchema,
}

impl MessageSchema {
    /// Creates a message schema with no fields.
    #[must_use]
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            fields: ObjectSchema::new(),
        }
    }

    /// Adds a mandatory field.
    #[must_use]
    pub fn mandatory(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields = self.fields.mandatory(name, ty);
        self
    }

    /// Adds an optional field.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields = self.fields.optional(name, ty);
        self
    }
}

/// One entry of a node's accepted message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptedType {
    /// The whole payload must be of this JSON kind.
    Scalar(Primitive),
    /// The payload must be an object matching this schema.
    Message(MessageSchema),
}

impl AcceptedType {
    /// Parses an accepted type description: a bare primitive name, or an
    /// object with `message_type` and field sections.
    pub fn from_json(value: &Value) -> NodeResult<Self> {
        match value {
            Value::String(name) => Primitive::from_name(name).map(Self::Scalar).ok_or_else(|| {
                NodeError::Schema(format!("{name:?} is not a top-level message type"))
            }),
            Value::Object(map) => {
                let message_type = map
                    .get("message_type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| NodeError::Schema("message schema needs message_type".into()))?;
                Ok(Self::Message(MessageSchema {
                    message_type: message_type.to_string(),
                    fields: ObjectSchema::from_json(value)?,
                }))
            }
            other => Err(NodeError::Schema(format!("invalid accepted type {other}"))),
        }
    }
}

impl From<MessageSchema> for AcceptedType {
    fn from(schema: MessageSchema) -> Self {
        Self::Message(schema)
    }
}

impl From<Primitive> for AcceptedType {
    fn from(primitive: Primitive) -> Self {
        Self::Scalar(primitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(Primitive::Str, json!("a"), true ; "string")]
    #[test_case(Primitive::Int, json!(7), true ; "int")]
    #[test_case(Primitive::Int, json!(-7), true ; "negative int")]
    #[test_case(Primitive::Int, json!(true), false ; "bool is not int")]
    #[test_case(Primitive::Int, json!(1.5), false ; "float is not int")]
    #[test_case(Primitive::Float, json!(1.5), true ; "float")]
    #[test_case(Primitive::Float, json!(1), false ; "int is not float")]
    #[test_case(Primitive::Bool, json!(false), true ; "bool")]
    #[test_case(Primitive::List, json!([1, "a"]), true ; "list")]
    #[test_case(Primitive::Dict, json!({}), true ; "dict")]
    #[test_case(Primitive::Dict, json!([]), false ; "list is not dict")]
    fn primitive_matches(primitive: Primitive, value: Value, expected: bool) {
        assert_eq!(primitive.matches(&value), expected);
    }

    #[test_case(json!("str"), FieldType::STR ; "primitive")]
    #[test_case(json!("hash"), FieldType::Hash ; "hash")]
    #[test_case(json!("signature"), FieldType::Signature ; "signature")]
    #[test_case(json!(["int"]), FieldType::sequence_of(FieldType::INT) ; "sequence")]
    #[test_case(json!([["hash"]]), FieldType::sequence_of(FieldType::sequence_of(FieldType::Hash)) ; "nested sequence")]
    #[test_case(json!("@Block"), FieldType::reference("Block") ; "reference")]
    fn field_type_from_json(value: Value, expected: FieldType) {
        assert_eq!(FieldType::from_json(&value).unwrap(), expected);
    }

    #[test_case(json!("uint") ; "unknown name")]
    #[test_case(json!("@") ; "empty reference")]
    #[test_case(json!([]) ; "empty sequence")]
    #[test_case(json!(["int", "str"]) ; "two element sequence")]
    #[test_case(json!(5) ; "number")]
    fn field_type_from_json_rejects(value: Value) {
        assert!(matches!(FieldType::from_json(&value), Err(NodeError::Schema(_))));
    }

    #[test]
    fn message_schema_from_json() {
        let parsed = AcceptedType::from_json(&json!({
            "message_type": "Transfer",
            "mandatory_fields": {"from": "hash", "amount": "int"},
            "optional_fields": {"memo": "str", "meta": {"mandatory_fields": {"v": "int"}}}
        }))
        .unwrap();

        let expected = MessageSchema::new("Transfer")
            .mandatory("from", FieldType::Hash)
            .mandatory("amount", FieldType::INT)
            .optional("memo", FieldType::STR)
            .optional("meta", FieldType::object(ObjectSchema::new().mandatory("v", FieldType::INT)));
        assert_eq!(parsed, AcceptedType::Message(expected));
    }

    #[test]
    fn scalar_from_json() {
        assert_eq!(
            AcceptedType::from_json(&json!("str")).unwrap(),
            AcceptedType::Scalar(Primitive::Str)
        );
        assert!(AcceptedType::from_json(&json!("hash")).is_err());
    }

    #[test]
    fn message_schema_requires_type_name() {
        let err = AcceptedType::from_json(&json!({"mandatory_fields": {}})).unwrap_err();
        assert!(err.to_string().contains("message_type"));
    }

    #[test]
    fn bad_field_reports_its_path() {
        let err = AcceptedType::from_json(&json!({
            "message_type": "T",
            "optional_fields": {"x": "nope"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("optional_fields.x"));
    }
}

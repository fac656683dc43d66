//! # Schema Generation
//!
//! Walks a graph of protobuf descriptors and produces a JSON-serializable [`Schema`]: one list of
//! field definitions per message type and one list of values per enum type, keyed by fully
//! qualified name. A form renderer can build input widgets for any message from it without
//! knowing protobuf.
//!
//! The walk is an explicit worklist keyed by type name. Every message is described exactly once,
//! so self-referencing and mutually recursive messages terminate without depth limits.
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use prost_reflect::{
    Cardinality, EnumDescriptor, FieldDescriptor, FileDescriptor, Kind, MessageDescriptor,
    MethodDescriptor, Value,
};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};

/// Packages holding the server reflection service's own types.
const REFLECTION_PACKAGES: &[&str] = &["grpc.reflection.v1", "grpc.reflection.v1alpha"];

/// Which types the "all types" schema includes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReflectionTypes {
    /// Every message in the file set.
    #[default]
    Include,
    /// Skips messages declared by the reflection service's own packages.
    Exclude,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_stream: Option<bool>,
    pub message_types: BTreeMap<String, Vec<FieldDef>>,
    pub enum_types: BTreeMap<String, Vec<EnumValueDef>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub proto_name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub one_of_fields: Option<Vec<FieldDef>>,
    pub is_message: bool,
    pub is_enum: bool,
    pub is_array: bool,
    pub is_map: bool,
    pub is_required: bool,
    pub default_val: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumValueDef {
    pub num: i32,
    pub name: String,
}

/// Wire-level scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    String,
    Bytes,
    Int32,
    Int64,
    Sint32,
    Sint64,
    Uint32,
    Uint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Float,
    Double,
    Bool,
}

impl ScalarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Bytes => "bytes",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::Sint32 => "sint32",
            ScalarType::Sint64 => "sint64",
            ScalarType::Uint32 => "uint32",
            ScalarType::Uint64 => "uint64",
            ScalarType::Fixed32 => "fixed32",
            ScalarType::Fixed64 => "fixed64",
            ScalarType::Sfixed32 => "sfixed32",
            ScalarType::Sfixed64 => "sfixed64",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
            ScalarType::Bool => "bool",
        }
    }
}

/// The type tag of a field. Serialized as a single string: the scalar name, the referenced
/// type's fully qualified name, or `"oneof"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Scalar(ScalarType),
    Message(String),
    Enum(String),
    Oneof,
}

impl FieldType {
    /// The fixed mapping from a field kind to its type tag.
    pub fn from_kind(kind: &Kind) -> Self {
        let scalar = match kind {
            Kind::Message(message) => return FieldType::Message(message.full_name().to_string()),
            Kind::Enum(enum_desc) => return FieldType::Enum(enum_desc.full_name().to_string()),
            Kind::String => ScalarType::String,
            Kind::Bytes => ScalarType::Bytes,
            Kind::Int32 => ScalarType::Int32,
            Kind::Int64 => ScalarType::Int64,
            Kind::Sint32 => ScalarType::Sint32,
            Kind::Sint64 => ScalarType::Sint64,
            Kind::Uint32 => ScalarType::Uint32,
            Kind::Uint64 => ScalarType::Uint64,
            Kind::Fixed32 => ScalarType::Fixed32,
            Kind::Fixed64 => ScalarType::Fixed64,
            Kind::Sfixed32 => ScalarType::Sfixed32,
            Kind::Sfixed64 => ScalarType::Sfixed64,
            Kind::Float => ScalarType::Float,
            Kind::Double => ScalarType::Double,
            Kind::Bool => ScalarType::Bool,
        };
        FieldType::Scalar(scalar)
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Scalar(scalar) => scalar.as_str(),
            FieldType::Message(name) | FieldType::Enum(name) => name,
            FieldType::Oneof => "oneof",
        }
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Describes the input type of `method` and every type reachable from it.
pub fn schema_for_method(method: &MethodDescriptor) -> Schema {
    let input = method.input();
    let mut walker = SchemaWalker::default();

    walker.enqueue_message(&input);
    walker.drain();

    Schema {
        request_type: Some(input.full_name().to_string()),
        request_stream: Some(method.is_client_streaming()),
        message_types: walker.message_types,
        enum_types: walker.enum_types,
    }
}

/// Describes every message declared in `files`, including nested ones.
///
/// Used to offer candidate types for `google.protobuf.Any` values.
pub fn schema_for_all_types(files: &[FileDescriptor], policy: ReflectionTypes) -> Schema {
    let mut walker = SchemaWalker::default();

    for file in files {
        if policy == ReflectionTypes::Exclude && REFLECTION_PACKAGES.contains(&file.package_name())
        {
            continue;
        }

        let mut seeds: Vec<MessageDescriptor> = file.messages().collect();
        while let Some(message) = seeds.pop() {
            seeds.extend(message.child_messages());
            walker.enqueue_message(&message);
        }
    }

    walker.drain();

    Schema {
        request_type: None,
        request_stream: None,
        message_types: walker.message_types,
        enum_types: walker.enum_types,
    }
}

#[derive(Default)]
struct SchemaWalker {
    message_types: BTreeMap<String, Vec<FieldDef>>,
    enum_types: BTreeMap<String, Vec<EnumValueDef>>,
    pending: Vec<MessageDescriptor>,
}

impl SchemaWalker {
    /// Reserves an entry for `message` and schedules it, unless already seen.
    fn enqueue_message(&mut self, message: &MessageDescriptor) {
        if self.message_types.contains_key(message.full_name()) {
            return;
        }

        self.message_types
            .insert(message.full_name().to_string(), Vec::new());
        self.pending.push(message.clone());
    }

    fn drain(&mut self) {
        while let Some(message) = self.pending.pop() {
            let fields = self.describe_message(&message);
            self.message_types
                .insert(message.full_name().to_string(), fields);
        }
    }

    fn describe_message(&mut self, message: &MessageDescriptor) -> Vec<FieldDef> {
        let mut fields = Vec::new();
        let mut oneofs_seen = HashSet::new();

        for field in message.fields() {
            match field.containing_oneof().filter(|oneof| !oneof.is_synthetic()) {
                Some(oneof) => {
                    if !oneofs_seen.insert(oneof.full_name().to_string()) {
                        continue;
                    }

                    let choices = oneof.fields().map(|f| self.describe_field(&f)).collect();
                    fields.push(FieldDef {
                        name: oneof.name().to_string(),
                        proto_name: oneof.name().to_string(),
                        field_type: FieldType::Oneof,
                        one_of_fields: Some(choices),
                        is_message: false,
                        is_enum: false,
                        is_array: false,
                        is_map: false,
                        is_required: false,
                        default_val: serde_json::Value::Null,
                    });
                }
                None => fields.push(self.describe_field(&field)),
            }
        }

        fields
    }

    fn describe_field(&mut self, field: &FieldDescriptor) -> FieldDef {
        let kind = field.kind();

        match &kind {
            Kind::Message(message) => self.enqueue_message(message),
            Kind::Enum(enum_desc) => self.visit_enum(enum_desc),
            _ => {}
        }

        FieldDef {
            name: field.json_name().to_string(),
            proto_name: field.name().to_string(),
            field_type: FieldType::from_kind(&kind),
            one_of_fields: None,
            is_message: matches!(kind, Kind::Message(_)),
            is_enum: matches!(kind, Kind::Enum(_)),
            is_array: field.is_list(),
            is_map: field.is_map(),
            is_required: field.cardinality() == Cardinality::Required,
            default_val: default_value(field),
        }
    }

    fn visit_enum(&mut self, enum_desc: &EnumDescriptor) {
        if self.enum_types.contains_key(enum_desc.full_name()) {
            return;
        }

        let values = enum_desc
            .values()
            .map(|value| EnumValueDef {
                num: value.number(),
                name: value.name().to_string(),
            })
            .collect();

        self.enum_types
            .insert(enum_desc.full_name().to_string(), values);
    }
}

/// The JSON-safe default of a field.
fn default_value(field: &FieldDescriptor) -> serde_json::Value {
    use serde_json::Value as Json;

    if field.is_map() {
        return Json::Object(serde_json::Map::new());
    }
    if field.is_list() {
        return Json::Array(Vec::new());
    }

    match Value::default_value_for_field(field) {
        Value::Bool(v) => Json::Bool(v),
        Value::I32(v) => Json::from(v),
        Value::U32(v) => Json::from(v),
        Value::I64(v) => Json::String(v.to_string()),
        Value::U64(v) => Json::String(v.to_string()),
        // Widen through the shortest f32 text so 1.1 stays 1.1.
        Value::F32(v) => float_json(v.to_string().parse().unwrap_or(f64::from(v))),
        Value::F64(v) => float_json(v),
        Value::String(v) => Json::String(v),
        Value::Bytes(v) if v.is_empty() => Json::Array(Vec::new()),
        Value::Bytes(v) => Json::String(STANDARD.encode(v)),
        Value::EnumNumber(number) => match field.kind() {
            Kind::Enum(enum_desc) => enum_desc
                .get_value(number)
                .map(|value| Json::String(value.name().to_string()))
                .unwrap_or_else(|| Json::from(number)),
            _ => Json::from(number),
        },
        Value::Message(_) | Value::List(_) | Value::Map(_) => Json::Null,
    }
}

fn float_json(value: f64) -> serde_json::Value {
    if value.is_nan() {
        serde_json::Value::String("NaN".to_string())
    } else if value.is_infinite() {
        let text = if value > 0.0 { "Infinity" } else { "-Infinity" };
        serde_json::Value::String(text.to_string())
    } else {
        serde_json::Number::from_f64(value)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_kinds_map_to_tags() {
        assert_eq!(FieldType::from_kind(&Kind::Sfixed64).as_str(), "sfixed64");
        assert_eq!(FieldType::from_kind(&Kind::Bool).as_str(), "bool");
        assert_eq!(
            FieldType::from_kind(&Kind::Uint32),
            FieldType::Scalar(ScalarType::Uint32)
        );
    }

    #[test]
    fn test_field_type_serializes_as_string() {
        assert_eq!(
            serde_json::to_value(FieldType::Message("pkg.Msg".into())).unwrap(),
            json!("pkg.Msg")
        );
        assert_eq!(serde_json::to_value(FieldType::Oneof).unwrap(), json!("oneof"));
        assert_eq!(
            serde_json::to_value(FieldType::Scalar(ScalarType::Fixed32)).unwrap(),
            json!("fixed32")
        );
    }

    #[test]
    fn test_non_finite_floats_render_as_strings() {
        assert_eq!(float_json(f64::NAN), json!("NaN"));
        assert_eq!(float_json(f64::INFINITY), json!("Infinity"));
        assert_eq!(float_json(f64::NEG_INFINITY), json!("-Infinity"));
        assert_eq!(float_json(1.5), json!(1.5));
    }

    #[test]
    fn test_wildcard_schema_omits_request_fields() {
        let schema = schema_for_all_types(&[], ReflectionTypes::Include);
        let value = serde_json::to_value(&schema).unwrap();

        assert_eq!(value, json!({ "messageTypes": {}, "enumTypes": {} }));
    }
}

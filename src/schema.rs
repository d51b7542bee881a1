//! The typed JSON Schema tree the bundler operates on.
//!
//! A [`Schema`] is either an object schema or one of the boolean schemas
//! `true`/`false`. Boolean schemas carry no keywords: [`Schema::set_kind`]
//! clears every field, and the traversal in [`crate::keyword`] yields no
//! children for them.

use std::collections::BTreeMap;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

use crate::referrer::Referrer;

/// Whether a schema node is an object schema or a boolean schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchemaKind {
    #[default]
    Object,
    True,
    False,
}

impl SchemaKind {
    pub fn is_bool(self) -> bool {
        !matches!(self, SchemaKind::Object)
    }
}

/// Map-valued keywords (`properties`, `$defs`, ...).
///
/// Kept sorted so every pass enumerates children in the same order.
pub type SchemaMap = BTreeMap<String, Schema>;

/// One JSON Schema document or subschema.
///
/// `items` holds a single schema. The draft 2019-09 tuple form
/// (`"items": [...]`) is not supported and fails to decode; use
/// `prefixItems` instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase")]
pub struct Schema {
    #[serde(skip)]
    kind: SchemaKind,

    #[serde(default, rename = "$schema", skip_serializing_if = "String::is_empty")]
    pub schema: String,
    #[serde(default, rename = "$id", skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, rename = "$ref", skip_serializing_if = "String::is_empty")]
    pub r#ref: String,
    #[serde(skip)]
    pub ref_referrer: Referrer,
    #[serde(default, rename = "$dynamicRef", skip_serializing_if = "String::is_empty")]
    pub dynamic_ref: String,
    #[serde(skip)]
    pub dynamic_ref_referrer: Referrer,
    #[serde(default, rename = "$anchor", skip_serializing_if = "String::is_empty")]
    pub anchor: String,
    #[serde(default, rename = "$dynamicAnchor", skip_serializing_if = "String::is_empty")]
    pub dynamic_anchor: String,
    #[serde(default, rename = "$comment", skip_serializing_if = "String::is_empty")]
    pub comment: String,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub r#type: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub r#enum: Option<Vec<Value>>,
    #[serde(default, rename = "const", skip_serializing_if = "Option::is_none")]
    pub r#const: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub examples: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub write_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_minimum: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_maximum: Option<Number>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique_items: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_contains: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_contains: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_properties: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_properties: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependent_required: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_of: Vec<Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Schema>>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub r#if: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<Box<Schema>>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub r#else: Option<Box<Schema>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefix_items: Vec<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_items: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unevaluated_items: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<Box<Schema>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: SchemaMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pattern_properties: SchemaMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependent_schemas: SchemaMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unevaluated_properties: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_names: Option<Box<Schema>>,

    #[serde(default, rename = "$defs", skip_serializing_if = "BTreeMap::is_empty")]
    pub defs: SchemaMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub definitions: SchemaMap,

    /// Keywords without a dedicated field: vendor extensions such as
    /// `x-kubernetes-*`, `contentMediaType`, `$vocabulary`, ... Kept as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Schema {
    /// An empty object schema (`{}`).
    pub fn new() -> Self {
        Self::default()
    }

    /// The boolean schema `true` or `false`.
    pub fn from_bool(value: bool) -> Self {
        let mut schema = Self::default();
        schema.set_kind(if value {
            SchemaKind::True
        } else {
            SchemaKind::False
        });
        schema
    }

    /// An object schema holding only a `$ref`.
    pub fn with_ref(reference: impl Into<String>) -> Self {
        Self {
            r#ref: reference.into(),
            ..Self::default()
        }
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    pub fn is_bool(&self) -> bool {
        self.kind.is_bool()
    }

    /// Change the node's kind. Turning a node into a boolean schema drops
    /// every keyword it held.
    pub fn set_kind(&mut self, kind: SchemaKind) {
        if kind.is_bool() {
            *self = Self::default();
        }
        self.kind = kind;
    }

    /// Tag every `$ref` and `$dynamicRef` in this tree with `referrer`.
    pub fn set_referrer(&mut self, referrer: &Referrer) {
        if self.is_bool() {
            return;
        }
        if !self.r#ref.is_empty() {
            self.ref_referrer = referrer.clone();
        }
        if !self.dynamic_ref.is_empty() {
            self.dynamic_ref_referrer = referrer.clone();
        }
        for (_, child) in self.subschemas_mut() {
            child.set_referrer(referrer);
        }
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.kind {
            SchemaKind::True => serializer.serialize_bool(true),
            SchemaKind::False => serializer.serialize_bool(false),
            SchemaKind::Object => Schema::serialize(self, serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SchemaVisitor;

        impl<'de> Visitor<'de> for SchemaVisitor {
            type Value = Schema;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a boolean or an object schema")
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<Schema, E> {
                Ok(Schema::from_bool(value))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Schema, E> {
                // An empty YAML document or a bare `null`.
                Ok(Schema::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Schema, A::Error> {
                Schema::deserialize(de::value::MapAccessDeserializer::new(map))
            }
        }

        deserializer.deserialize_any(SchemaVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_kind_bool_resets_fields() {
        let mut schema = Schema {
            title: "values".into(),
            r#ref: "foo.json".into(),
            ..Schema::default()
        };
        schema
            .properties
            .insert("replicas".into(), Schema::from_bool(true));

        schema.set_kind(SchemaKind::False);

        assert_eq!(schema.kind(), SchemaKind::False);
        assert!(schema.title.is_empty());
        assert!(schema.r#ref.is_empty());
        assert!(schema.properties.is_empty());
        assert_eq!(schema.subschemas().count(), 0);
    }

    #[test]
    fn bool_schemas_round_trip() {
        let value = json!({
            "additionalProperties": false,
            "properties": { "any": true }
        });
        let schema: Schema = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(
            schema.additional_properties.as_deref().map(Schema::kind),
            Some(SchemaKind::False)
        );
        assert_eq!(serde_json::to_value(&schema).unwrap(), value);
    }

    #[test]
    fn serializes_keywords_with_json_schema_names() {
        let schema: Schema = serde_json::from_value(json!({
            "$id": "foo.json",
            "$ref": "#/$defs/bar",
            "type": "object",
            "minLength": 2,
            "patternProperties": { "^x-": { "type": "string" } },
            "$defs": { "bar": { "const": 1 } }
        }))
        .unwrap();

        assert_eq!(schema.id, "foo.json");
        assert_eq!(schema.r#ref, "#/$defs/bar");
        assert_eq!(schema.min_length, Some(2));
        assert!(schema.pattern_properties.contains_key("^x-"));
        assert_eq!(
            serde_json::to_value(&schema).unwrap()["$defs"]["bar"]["const"],
            1
        );
    }

    #[test]
    fn unknown_keywords_round_trip() {
        let value = json!({
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
            "contentMediaType": "application/json",
            "nullable": true,
            "properties": {
                "labels": { "x-kubernetes-map-type": "granular", "type": "object" }
            }
        });
        let schema: Schema = serde_json::from_value(value.clone()).unwrap();

        assert_eq!(schema.extra["contentMediaType"], "application/json");
        assert_eq!(
            schema.properties["labels"].extra["x-kubernetes-map-type"],
            "granular"
        );
        assert_eq!(serde_json::to_value(&schema).unwrap(), value);
    }

    #[test]
    fn set_kind_bool_drops_unknown_keywords() {
        let mut schema: Schema =
            serde_json::from_value(json!({ "$vocabulary": { "x": true } })).unwrap();
        assert!(!schema.extra.is_empty());

        schema.set_kind(SchemaKind::True);

        assert!(schema.extra.is_empty());
        assert_eq!(serde_json::to_value(&schema).unwrap(), json!(true));
    }

    #[test]
    fn tuple_items_is_a_decode_error() {
        let result = serde_json::from_value::<Schema>(json!({ "items": [{}, {}] }));
        assert!(result.is_err());
    }

    #[test]
    fn deserializes_yaml() {
        let schema: Schema = serde_yaml::from_str(
            "type: object\nproperties:\n  image:\n    $ref: image.yaml#/$defs/image\n",
        )
        .unwrap();
        assert_eq!(schema.properties["image"].r#ref, "image.yaml#/$defs/image");
    }

    #[test]
    fn empty_schema_serializes_as_empty_object() {
        assert_eq!(serde_json::to_value(Schema::new()).unwrap(), json!({}));
    }

    #[test]
    fn set_referrer_tags_nested_refs() {
        let mut schema: Schema = serde_json::from_value(json!({
            "items": { "$ref": "a.json" },
            "properties": { "b": { "$dynamicRef": "b.json" }, "c": {} }
        }))
        .unwrap();
        let referrer = Referrer::dir("charts/app");
        schema.set_referrer(&referrer);

        assert_eq!(schema.items.as_ref().unwrap().ref_referrer, referrer);
        assert_eq!(schema.properties["b"].dynamic_ref_referrer, referrer);
        assert_eq!(schema.properties["c"].ref_referrer, Referrer::None);
    }
}

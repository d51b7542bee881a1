//! The subschema keyword table.
//!
//! [`Keyword::ALL`] is the one ordered list of keywords that can hold child
//! schemas. Bundling, `$id` removal and dead-definition pruning all walk the
//! tree through [`Schema::subschemas`] / [`Schema::subschemas_mut`], which are
//! built on this table, so keyword coverage lives in exactly one place.
//!
//! Map keywords yield their entries in sorted key order. The order matters:
//! it decides which of two colliding definition names gets the bare name.

use std::collections::btree_map;
use std::iter::Enumerate;
use std::slice;

use crate::ptr::Ptr;
use crate::schema::{Schema, SchemaMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Not,
    If,
    Then,
    Else,
    Contains,
    Items,
    AdditionalItems,
    UnevaluatedItems,
    PropertyNames,
    AdditionalProperties,
    UnevaluatedProperties,
    Properties,
    PatternProperties,
    DependentSchemas,
    Defs,
    Definitions,
    AllOf,
    AnyOf,
    OneOf,
    PrefixItems,
}

impl Keyword {
    pub const ALL: [Keyword; 20] = [
        Keyword::Not,
        Keyword::If,
        Keyword::Then,
        Keyword::Else,
        Keyword::Contains,
        Keyword::Items,
        Keyword::AdditionalItems,
        Keyword::UnevaluatedItems,
        Keyword::PropertyNames,
        Keyword::AdditionalProperties,
        Keyword::UnevaluatedProperties,
        Keyword::Properties,
        Keyword::PatternProperties,
        Keyword::DependentSchemas,
        Keyword::Defs,
        Keyword::Definitions,
        Keyword::AllOf,
        Keyword::AnyOf,
        Keyword::OneOf,
        Keyword::PrefixItems,
    ];

    /// The keyword as it appears in a document and in pointers.
    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Not => "not",
            Keyword::If => "if",
            Keyword::Then => "then",
            Keyword::Else => "else",
            Keyword::Contains => "contains",
            Keyword::Items => "items",
            Keyword::AdditionalItems => "additionalItems",
            Keyword::UnevaluatedItems => "unevaluatedItems",
            Keyword::PropertyNames => "propertyNames",
            Keyword::AdditionalProperties => "additionalProperties",
            Keyword::UnevaluatedProperties => "unevaluatedProperties",
            Keyword::Properties => "properties",
            Keyword::PatternProperties => "patternProperties",
            Keyword::DependentSchemas => "dependentSchemas",
            Keyword::Defs => "$defs",
            Keyword::Definitions => "definitions",
            Keyword::AllOf => "allOf",
            Keyword::AnyOf => "anyOf",
            Keyword::OneOf => "oneOf",
            Keyword::PrefixItems => "prefixItems",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|keyword| keyword.as_str() == s)
    }

    /// `$defs` and its legacy spelling `definitions`.
    pub fn is_defs(self) -> bool {
        matches!(self, Keyword::Defs | Keyword::Definitions)
    }
}

/// Shared view of one keyword's children.
#[derive(Debug, Clone, Copy)]
pub enum Slot<'a> {
    Single(Option<&'a Schema>),
    Map(&'a SchemaMap),
    Array(&'a [Schema]),
}

/// Mutable view of one keyword's children.
#[derive(Debug)]
pub enum SlotMut<'a> {
    Single(Option<&'a mut Schema>),
    Map(&'a mut SchemaMap),
    Array(&'a mut [Schema]),
}

impl<'a> Slot<'a> {
    /// Children with their pointers relative to the owning node.
    pub fn children(self, keyword: Keyword) -> Children<'a> {
        let inner = match self {
            Slot::Single(child) => ChildrenInner::Single(child),
            Slot::Map(map) => ChildrenInner::Map(map.iter()),
            Slot::Array(items) => ChildrenInner::Array(items.iter().enumerate()),
        };
        Children { keyword, inner }
    }
}

impl<'a> SlotMut<'a> {
    pub fn children(self, keyword: Keyword) -> ChildrenMut<'a> {
        let inner = match self {
            SlotMut::Single(child) => ChildrenMutInner::Single(child),
            SlotMut::Map(map) => ChildrenMutInner::Map(map.iter_mut()),
            SlotMut::Array(items) => ChildrenMutInner::Array(items.iter_mut().enumerate()),
        };
        ChildrenMut { keyword, inner }
    }
}

pub struct Children<'a> {
    keyword: Keyword,
    inner: ChildrenInner<'a>,
}

enum ChildrenInner<'a> {
    Single(Option<&'a Schema>),
    Map(btree_map::Iter<'a, String, Schema>),
    Array(Enumerate<slice::Iter<'a, Schema>>),
}

impl<'a> Iterator for Children<'a> {
    type Item = (Ptr, &'a Schema);

    fn next(&mut self) -> Option<Self::Item> {
        let keyword = self.keyword.as_str();
        match &mut self.inner {
            ChildrenInner::Single(child) => child.take().map(|c| (Ptr::from_tokens([keyword]), c)),
            ChildrenInner::Map(iter) => iter
                .next()
                .map(|(key, c)| (Ptr::from_tokens([keyword, key.as_str()]), c)),
            ChildrenInner::Array(iter) => iter
                .next()
                .map(|(i, c)| (Ptr::from_tokens([keyword]).item([i]), c)),
        }
    }
}

pub struct ChildrenMut<'a> {
    keyword: Keyword,
    inner: ChildrenMutInner<'a>,
}

enum ChildrenMutInner<'a> {
    Single(Option<&'a mut Schema>),
    Map(btree_map::IterMut<'a, String, Schema>),
    Array(Enumerate<slice::IterMut<'a, Schema>>),
}

impl<'a> Iterator for ChildrenMut<'a> {
    type Item = (Ptr, &'a mut Schema);

    fn next(&mut self) -> Option<Self::Item> {
        let keyword = self.keyword.as_str();
        match &mut self.inner {
            ChildrenMutInner::Single(child) => {
                child.take().map(|c| (Ptr::from_tokens([keyword]), c))
            }
            ChildrenMutInner::Map(iter) => iter
                .next()
                .map(|(key, c)| (Ptr::from_tokens([keyword, key.as_str()]), c)),
            ChildrenMutInner::Array(iter) => iter
                .next()
                .map(|(i, c)| (Ptr::from_tokens([keyword]).item([i]), c)),
        }
    }
}

impl Schema {
    /// The children held by one keyword. Boolean schemas hold none.
    pub fn slot(&self, keyword: Keyword) -> Slot<'_> {
        if self.is_bool() {
            return Slot::Single(None);
        }
        match keyword {
            Keyword::Not => Slot::Single(self.not.as_deref()),
            Keyword::If => Slot::Single(self.r#if.as_deref()),
            Keyword::Then => Slot::Single(self.then.as_deref()),
            Keyword::Else => Slot::Single(self.r#else.as_deref()),
            Keyword::Contains => Slot::Single(self.contains.as_deref()),
            Keyword::Items => Slot::Single(self.items.as_deref()),
            Keyword::AdditionalItems => Slot::Single(self.additional_items.as_deref()),
            Keyword::UnevaluatedItems => Slot::Single(self.unevaluated_items.as_deref()),
            Keyword::PropertyNames => Slot::Single(self.property_names.as_deref()),
            Keyword::AdditionalProperties => Slot::Single(self.additional_properties.as_deref()),
            Keyword::UnevaluatedProperties => {
                Slot::Single(self.unevaluated_properties.as_deref())
            }
            Keyword::Properties => Slot::Map(&self.properties),
            Keyword::PatternProperties => Slot::Map(&self.pattern_properties),
            Keyword::DependentSchemas => Slot::Map(&self.dependent_schemas),
            Keyword::Defs => Slot::Map(&self.defs),
            Keyword::Definitions => Slot::Map(&self.definitions),
            Keyword::AllOf => Slot::Array(&self.all_of),
            Keyword::AnyOf => Slot::Array(&self.any_of),
            Keyword::OneOf => Slot::Array(&self.one_of),
            Keyword::PrefixItems => Slot::Array(&self.prefix_items),
        }
    }

    /// Mutable views of every keyword, in [`Keyword::ALL`] order.
    pub fn slots_mut(&mut self) -> impl Iterator<Item = (Keyword, SlotMut<'_>)> {
        let is_bool = self.is_bool();
        let Schema {
            not,
            r#if,
            then,
            r#else,
            contains,
            items,
            additional_items,
            unevaluated_items,
            property_names,
            additional_properties,
            unevaluated_properties,
            properties,
            pattern_properties,
            dependent_schemas,
            defs,
            definitions,
            all_of,
            any_of,
            one_of,
            prefix_items,
            ..
        } = self;

        let slots = [
            (Keyword::Not, SlotMut::Single(not.as_deref_mut())),
            (Keyword::If, SlotMut::Single(r#if.as_deref_mut())),
            (Keyword::Then, SlotMut::Single(then.as_deref_mut())),
            (Keyword::Else, SlotMut::Single(r#else.as_deref_mut())),
            (Keyword::Contains, SlotMut::Single(contains.as_deref_mut())),
            (Keyword::Items, SlotMut::Single(items.as_deref_mut())),
            (
                Keyword::AdditionalItems,
                SlotMut::Single(additional_items.as_deref_mut()),
            ),
            (
                Keyword::UnevaluatedItems,
                SlotMut::Single(unevaluated_items.as_deref_mut()),
            ),
            (
                Keyword::PropertyNames,
                SlotMut::Single(property_names.as_deref_mut()),
            ),
            (
                Keyword::AdditionalProperties,
                SlotMut::Single(additional_properties.as_deref_mut()),
            ),
            (
                Keyword::UnevaluatedProperties,
                SlotMut::Single(unevaluated_properties.as_deref_mut()),
            ),
            (Keyword::Properties, SlotMut::Map(properties)),
            (Keyword::PatternProperties, SlotMut::Map(pattern_properties)),
            (Keyword::DependentSchemas, SlotMut::Map(dependent_schemas)),
            (Keyword::Defs, SlotMut::Map(defs)),
            (Keyword::Definitions, SlotMut::Map(definitions)),
            (Keyword::AllOf, SlotMut::Array(all_of.as_mut_slice())),
            (Keyword::AnyOf, SlotMut::Array(any_of.as_mut_slice())),
            (Keyword::OneOf, SlotMut::Array(one_of.as_mut_slice())),
            (Keyword::PrefixItems, SlotMut::Array(prefix_items.as_mut_slice())),
        ];
        slots.into_iter().filter(move |_| !is_bool)
    }

    /// Every direct child schema with its pointer relative to this node.
    pub fn subschemas(&self) -> impl Iterator<Item = (Ptr, &Schema)> + '_ {
        Keyword::ALL
            .into_iter()
            .flat_map(move |keyword| self.slot(keyword).children(keyword))
    }

    pub fn subschemas_mut(&mut self) -> impl Iterator<Item = (Ptr, &mut Schema)> + '_ {
        self.slots_mut()
            .flat_map(|(keyword, slot)| slot.children(keyword))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keyword_names_round_trip() {
        for keyword in Keyword::ALL {
            assert_eq!(Keyword::parse(keyword.as_str()), Some(keyword));
        }
        assert_eq!(Keyword::parse("type"), None);
    }

    #[test]
    fn subschemas_follow_table_order_with_sorted_keys() {
        let schema: Schema = serde_json::from_value(json!({
            "allOf": [{}, {}],
            "properties": { "b": {}, "a": {} },
            "$defs": { "z": {}, "y": {} },
            "items": {},
            "not": {}
        }))
        .unwrap();

        let paths: Vec<String> = schema.subschemas().map(|(p, _)| p.to_string()).collect();
        assert_eq!(
            paths,
            [
                "/not",
                "/items",
                "/properties/a",
                "/properties/b",
                "/$defs/y",
                "/$defs/z",
                "/allOf/0",
                "/allOf/1",
            ]
        );
    }

    #[test]
    fn subschemas_mut_matches_subschemas() {
        let mut schema: Schema = serde_json::from_value(json!({
            "if": {}, "then": {}, "else": {},
            "prefixItems": [{}],
            "dependentSchemas": { "x": {} },
            "definitions": { "legacy": {} },
            "unevaluatedProperties": false
        }))
        .unwrap();

        let shared: Vec<Ptr> = schema.subschemas().map(|(p, _)| p).collect();
        let exclusive: Vec<Ptr> = schema.subschemas_mut().map(|(p, _)| p).collect();
        assert_eq!(shared, exclusive);
        assert_eq!(shared.len(), 7);
    }

    #[test]
    fn subschemas_is_restartable() {
        let schema: Schema =
            serde_json::from_value(json!({ "anyOf": [{}, {}, {}] })).unwrap();
        assert_eq!(schema.subschemas().count(), 3);
        assert_eq!(schema.subschemas().count(), 3);
    }
}

//! Typed names and values of the project document collections.
//!
//! All generic access to the project document (read, replace, observe) is
//! keyed by [`CollectionName`] and carries a [`CollectionValue`].

use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::{
    Element, ElementTypeSchema, PublishPlan, Relationship, RelationshipType, TagAssignment,
    TagDefinition,
};

/// The eight named collections of a project document, in published order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionName {
    Elements,
    PublishPlans,
    Relationships,
    CustomRelationshipTypes,
    Schemas,
    ElementTags,
    CustomTags,
    ProjectMeta,
}

impl CollectionName {
    pub const ALL: [CollectionName; 8] = [
        CollectionName::Elements,
        CollectionName::PublishPlans,
        CollectionName::Relationships,
        CollectionName::CustomRelationshipTypes,
        CollectionName::Schemas,
        CollectionName::ElementTags,
        CollectionName::CustomTags,
        CollectionName::ProjectMeta,
    ];

    /// Name of the collection inside the replicated document.
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionName::Elements => "elements",
            CollectionName::PublishPlans => "publishPlans",
            CollectionName::Relationships => "relationships",
            CollectionName::CustomRelationshipTypes => "customRelationshipTypes",
            CollectionName::Schemas => "schemas",
            CollectionName::ElementTags => "elementTags",
            CollectionName::CustomTags => "customTags",
            CollectionName::ProjectMeta => "projectMeta",
        }
    }

    /// `projectMeta` is a mapping; every other collection is a sequence.
    pub fn is_mapping(self) -> bool {
        matches!(self, CollectionName::ProjectMeta)
    }

    pub fn sequences() -> impl Iterator<Item = CollectionName> {
        Self::ALL.into_iter().filter(|name| !name.is_mapping())
    }
}

impl std::fmt::Display for CollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CollectionName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("Unknown collection: {}", s))
    }
}

/// Record type stored in a sequence-valued collection.
pub trait CollectionItem: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: CollectionName;

    /// Wrap a full sequence as a [`CollectionValue`].
    fn into_value(items: Vec<Self>) -> CollectionValue;
}

macro_rules! collection_items {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl CollectionItem for $ty {
                const COLLECTION: CollectionName = CollectionName::$variant;

                fn into_value(items: Vec<Self>) -> CollectionValue {
                    CollectionValue::$variant(items)
                }
            }
        )*
    };
}

collection_items! {
    Element => Elements,
    PublishPlan => PublishPlans,
    Relationship => Relationships,
    RelationshipType => CustomRelationshipTypes,
    ElementTypeSchema => Schemas,
    TagAssignment => ElementTags,
    TagDefinition => CustomTags,
}

/// Full value of one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionValue {
    Elements(Vec<Element>),
    PublishPlans(Vec<PublishPlan>),
    Relationships(Vec<Relationship>),
    CustomRelationshipTypes(Vec<RelationshipType>),
    Schemas(Vec<ElementTypeSchema>),
    ElementTags(Vec<TagAssignment>),
    CustomTags(Vec<TagDefinition>),
    ProjectMeta(IndexMap<String, String>),
}

impl CollectionValue {
    pub fn name(&self) -> CollectionName {
        match self {
            CollectionValue::Elements(_) => CollectionName::Elements,
            CollectionValue::PublishPlans(_) => CollectionName::PublishPlans,
            CollectionValue::Relationships(_) => CollectionName::Relationships,
            CollectionValue::CustomRelationshipTypes(_) => CollectionName::CustomRelationshipTypes,
            CollectionValue::Schemas(_) => CollectionName::Schemas,
            CollectionValue::ElementTags(_) => CollectionName::ElementTags,
            CollectionValue::CustomTags(_) => CollectionName::CustomTags,
            CollectionValue::ProjectMeta(_) => CollectionName::ProjectMeta,
        }
    }

    /// The empty value of a collection.
    pub fn empty(name: CollectionName) -> Self {
        match name {
            CollectionName::Elements => CollectionValue::Elements(Vec::new()),
            CollectionName::PublishPlans => CollectionValue::PublishPlans(Vec::new()),
            CollectionName::Relationships => CollectionValue::Relationships(Vec::new()),
            CollectionName::CustomRelationshipTypes => {
                CollectionValue::CustomRelationshipTypes(Vec::new())
            }
            CollectionName::Schemas => CollectionValue::Schemas(Vec::new()),
            CollectionName::ElementTags => CollectionValue::ElementTags(Vec::new()),
            CollectionName::CustomTags => CollectionValue::CustomTags(Vec::new()),
            CollectionName::ProjectMeta => CollectionValue::ProjectMeta(IndexMap::new()),
        }
    }

    /// Serialize every entry of a sequence as a JSON string.
    ///
    /// Returns `None` for the `projectMeta` mapping.
    pub fn to_json_items(&self) -> serde_json::Result<Option<Vec<String>>> {
        fn encode<T: Serialize>(items: &[T]) -> serde_json::Result<Option<Vec<String>>> {
            items
                .iter()
                .map(serde_json::to_string)
                .collect::<serde_json::Result<Vec<_>>>()
                .map(Some)
        }

        match self {
            CollectionValue::Elements(items) => encode(items),
            CollectionValue::PublishPlans(items) => encode(items),
            CollectionValue::Relationships(items) => encode(items),
            CollectionValue::CustomRelationshipTypes(items) => encode(items),
            CollectionValue::Schemas(items) => encode(items),
            CollectionValue::ElementTags(items) => encode(items),
            CollectionValue::CustomTags(items) => encode(items),
            CollectionValue::ProjectMeta(_) => Ok(None),
        }
    }

    /// Decode a sequence from JSON strings, skipping malformed entries.
    pub fn from_json_items<'a>(
        name: CollectionName,
        items: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        fn decode<'a, T: CollectionItem>(items: impl IntoIterator<Item = &'a str>) -> CollectionValue {
            let parsed = items
                .into_iter()
                .filter_map(|json| match serde_json::from_str::<T>(json) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        log::warn!("[ProjectDoc] Skipping malformed {} entry: {}", T::COLLECTION, e);
                        None
                    }
                })
                .collect();
            T::into_value(parsed)
        }

        match name {
            CollectionName::Elements => decode::<Element>(items),
            CollectionName::PublishPlans => decode::<PublishPlan>(items),
            CollectionName::Relationships => decode::<Relationship>(items),
            CollectionName::CustomRelationshipTypes => decode::<RelationshipType>(items),
            CollectionName::Schemas => decode::<ElementTypeSchema>(items),
            CollectionName::ElementTags => decode::<TagAssignment>(items),
            CollectionName::CustomTags => decode::<TagDefinition>(items),
            CollectionName::ProjectMeta => CollectionValue::empty(CollectionName::ProjectMeta),
        }
    }

    /// Decode a collection from its JSON representation (legacy payloads).
    pub fn from_json(name: CollectionName, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match name {
            CollectionName::Elements => CollectionValue::Elements(serde_json::from_value(value)?),
            CollectionName::PublishPlans => {
                CollectionValue::PublishPlans(serde_json::from_value(value)?)
            }
            CollectionName::Relationships => {
                CollectionValue::Relationships(serde_json::from_value(value)?)
            }
            CollectionName::CustomRelationshipTypes => {
                CollectionValue::CustomRelationshipTypes(serde_json::from_value(value)?)
            }
            CollectionName::Schemas => CollectionValue::Schemas(serde_json::from_value(value)?),
            CollectionName::ElementTags => {
                CollectionValue::ElementTags(serde_json::from_value(value)?)
            }
            CollectionName::CustomTags => {
                CollectionValue::CustomTags(serde_json::from_value(value)?)
            }
            CollectionName::ProjectMeta => {
                CollectionValue::ProjectMeta(serde_json::from_value(value)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ElementType;

    #[test]
    fn test_names_round_trip() {
        for name in CollectionName::ALL {
            assert_eq!(name.as_str().parse::<CollectionName>().unwrap(), name);
        }
        assert_eq!(CollectionName::sequences().count(), 7);
        assert!("files".parse::<CollectionName>().is_err());
    }

    #[test]
    fn test_json_items_skip_malformed() {
        let element = Element::new(ElementType::Item, "A");
        let encoded = CollectionValue::Elements(vec![element.clone()])
            .to_json_items()
            .unwrap()
            .unwrap();
        let mut raw: Vec<&str> = encoded.iter().map(String::as_str).collect();
        raw.push("{not json");

        let decoded = CollectionValue::from_json_items(CollectionName::Elements, raw);
        assert_eq!(decoded, CollectionValue::Elements(vec![element]));
    }

    #[test]
    fn test_mapping_has_no_json_items() {
        let value = CollectionValue::empty(CollectionName::ProjectMeta);
        assert!(value.to_json_items().unwrap().is_none());
        assert_eq!(value.name(), CollectionName::ProjectMeta);
    }
}

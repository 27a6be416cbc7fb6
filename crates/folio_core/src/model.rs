//! Project data model shared by the local and replicated providers.
//!
//! Every sequence-valued collection of the project document stores one of the
//! record types below; `projectMeta` is a plain string mapping projected onto
//! [`ProjectMeta`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Kind of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export, export_to = "bindings/")]
pub enum ElementType {
    Folder,
    Item,
    Worldbuilding,
}

impl ElementType {
    pub fn is_folder(self) -> bool {
        matches!(self, ElementType::Folder)
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementType::Folder => write!(f, "FOLDER"),
            ElementType::Item => write!(f, "ITEM"),
            ElementType::Worldbuilding => write!(f, "WORLDBUILDING"),
        }
    }
}

impl std::str::FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "folder" => Ok(ElementType::Folder),
            "item" => Ok(ElementType::Item),
            "worldbuilding" => Ok(ElementType::Worldbuilding),
            _ => Err(format!("Unknown element type: {}", s)),
        }
    }
}

/// A node of the project tree.
///
/// The `elements` collection is a preorder flattening: `level` is the depth
/// and the parent of an element is the nearest preceding element with a
/// smaller level. `parent_id` is kept for wire compatibility and is always
/// `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Element {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    pub level: u32,
    pub order: u32,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub expandable: bool,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub metadata: IndexMap<String, String>,
}

fn default_version() -> u32 {
    1
}

impl Element {
    /// Create a root-level element with a fresh uuid.
    pub fn new(element_type: ElementType, name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            element_type,
            schema_id: None,
            level: 0,
            order: 0,
            parent_id: None,
            expandable: element_type.is_folder(),
            version: 1,
            metadata: IndexMap::new(),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.element_type.is_folder()
    }
}

/// An export recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct PublishPlan {
    pub id: String,
    pub name: String,
    pub format: String,
    #[serde(default)]
    pub element_ids: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Directed link between two elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Relationship {
    pub id: String,
    pub source_element_id: String,
    pub target_element_id: String,
    pub relationship_type_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Relationship {
    /// Whether either endpoint is in `ids`.
    pub fn references_any(&self, ids: &[String]) -> bool {
        ids.iter()
            .any(|id| *id == self.source_element_id || *id == self.target_element_id)
    }
}

/// Project-defined link kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct RelationshipType {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Input kind of a template field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub enum FieldType {
    Text,
    Textarea,
    Number,
    Date,
    Select,
    Array,
}

/// A single field declared by a worldbuilding template.
///
/// `key` may be a dotted path (`appearance.height`) addressing a nested
/// mapping in the worldbuilding document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SchemaField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SchemaTab {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub fields: Vec<SchemaField>,
}

/// Worldbuilding template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ElementTypeSchema {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub tabs: Vec<SchemaTab>,
    /// Object of default values applied on element initialization.
    #[serde(default)]
    pub default_values: serde_json::Value,
    #[serde(default = "default_version")]
    pub version: u32,
}

impl ElementTypeSchema {
    /// All fields across every tab, in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &SchemaField> {
        self.tabs.iter().flat_map(|tab| tab.fields.iter())
    }
}

/// An `(elementId, tagId)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct TagAssignment {
    pub id: String,
    pub element_id: String,
    pub tag_id: String,
    pub created_at: String,
}

/// Entry of the project's tag palette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct TagDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Typed view over the `projectMeta` mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ProjectMeta {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cover_media_id: Option<String>,
    pub updated_at: Option<String>,
}

impl ProjectMeta {
    pub const NAME: &'static str = "name";
    pub const DESCRIPTION: &'static str = "description";
    pub const COVER_MEDIA_ID: &'static str = "coverMediaId";
    pub const UPDATED_AT: &'static str = "updatedAt";

    pub fn from_map(map: &IndexMap<String, String>) -> Self {
        let get = |key: &str| map.get(key).cloned();
        Self {
            name: get(Self::NAME),
            description: get(Self::DESCRIPTION),
            cover_media_id: get(Self::COVER_MEDIA_ID),
            updated_at: get(Self::UPDATED_AT),
        }
    }

    pub fn to_map(&self) -> IndexMap<String, String> {
        let mut map = IndexMap::new();
        let fields = [
            (Self::NAME, &self.name),
            (Self::DESCRIPTION, &self.description),
            (Self::COVER_MEDIA_ID, &self.cover_media_id),
            (Self::UPDATED_AT, &self.updated_at),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                map.insert(key.to_string(), value.clone());
            }
        }
        map
    }
}

/// Attachment and push capability of a project connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum SyncPhase {
    /// Not attached.
    #[default]
    Unavailable,
    /// Attached, no network push.
    Offline,
    /// Attached, handshake in progress or awaiting the first remote sync.
    Syncing,
    /// Attached and push-capable.
    Synced,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SyncPhase::Unavailable => "unavailable",
            SyncPhase::Offline => "offline",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Synced => "synced",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_wire_shape() {
        let mut element = Element::new(ElementType::Folder, "Chapters");
        element.id = "f1".to_string();
        let json = serde_json::to_value(&element).unwrap();
        assert_eq!(json["type"], "FOLDER");
        assert_eq!(json["parentId"], serde_json::Value::Null);
        assert_eq!(json["expandable"], true);
        assert!(json.get("schemaId").is_none());

        let back: Element = serde_json::from_value(json).unwrap();
        assert_eq!(back, element);
    }

    #[test]
    fn test_element_defaults_when_fields_missing() {
        let element: Element = serde_json::from_str(
            r#"{"id":"a","name":"A","type":"ITEM","level":0,"order":0,"expandable":false}"#,
        )
        .unwrap();
        assert_eq!(element.version, 1);
        assert!(element.metadata.is_empty());
        assert!(element.parent_id.is_none());
    }

    #[test]
    fn test_element_type_from_str() {
        assert_eq!("folder".parse::<ElementType>().unwrap(), ElementType::Folder);
        assert_eq!("ITEM".parse::<ElementType>().unwrap(), ElementType::Item);
        assert!("chapter".parse::<ElementType>().is_err());
    }

    #[test]
    fn test_project_meta_map_conversion() {
        let meta = ProjectMeta {
            name: Some("Novel".to_string()),
            description: None,
            cover_media_id: Some("m1".to_string()),
            updated_at: None,
        };
        let map = meta.to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["coverMediaId"], "m1");
        assert_eq!(ProjectMeta::from_map(&map), meta);
    }

    #[test]
    fn test_relationship_references() {
        let rel = Relationship {
            id: "r".to_string(),
            source_element_id: "a".to_string(),
            target_element_id: "b".to_string(),
            relationship_type_id: "t".to_string(),
            note: None,
        };
        assert!(rel.references_any(&["b".to_string()]));
        assert!(!rel.references_any(&["c".to_string()]));
    }
}

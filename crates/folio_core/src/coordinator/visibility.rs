use std::collections::HashSet;

use serde::Serialize;

use crate::model::Element;

/// An element the tree view should render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleElement {
    #[serde(flatten)]
    pub element: Element,
    /// Only folders can be expanded.
    pub expanded: bool,
}

/// Project `elements` through the expansion set.
///
/// An element is visible when every ancestor is expanded. Once an element is
/// found collapsed, everything deeper than it is skipped until the walk
/// returns to its level.
pub fn visible_elements(elements: &[Element], expanded: &HashSet<String>) -> Vec<VisibleElement> {
    let mut visible = Vec::with_capacity(elements.len());
    let mut collapsed_at: Option<u32> = None;

    for element in elements {
        if let Some(level) = collapsed_at {
            if element.level > level {
                continue;
            }
            collapsed_at = None;
        }
        let is_expanded = expanded.contains(&element.id);
        if !is_expanded {
            collapsed_at = Some(element.level);
        }
        visible.push(VisibleElement {
            element: element.clone(),
            expanded: element.is_folder() && is_expanded,
        });
    }
    visible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ElementType;

    fn el(id: &str, element_type: ElementType, level: u32) -> Element {
        let mut element = Element::new(element_type, id);
        element.id = id.to_string();
        element.level = level;
        element
    }

    fn tree() -> Vec<Element> {
        vec![
            el("a", ElementType::Folder, 0),
            el("b", ElementType::Folder, 1),
            el("c", ElementType::Item, 2),
            el("d", ElementType::Item, 1),
            el("e", ElementType::Item, 0),
        ]
    }

    fn visible_ids(expanded: &[&str]) -> Vec<String> {
        let expanded = expanded.iter().map(|s| s.to_string()).collect();
        visible_elements(&tree(), &expanded)
            .into_iter()
            .map(|v| v.element.id)
            .collect()
    }

    #[test]
    fn test_collapsed_hides_descendants() {
        assert_eq!(visible_ids(&[]), vec!["a", "e"]);
        assert_eq!(visible_ids(&["a"]), vec!["a", "b", "d", "e"]);
        assert_eq!(visible_ids(&["a", "b"]), vec!["a", "b", "c", "d", "e"]);
        // An expanded child under a collapsed ancestor stays hidden
        assert_eq!(visible_ids(&["b"]), vec!["a", "e"]);
    }

    #[test]
    fn test_expanded_flag_only_on_folders() {
        let expanded: HashSet<String> = ["a", "e"].iter().map(|s| s.to_string()).collect();
        let visible = visible_elements(&tree(), &expanded);
        assert!(visible[0].expanded);
        assert!(!visible[1].expanded);
        assert!(!visible.last().unwrap().expanded);
    }
}

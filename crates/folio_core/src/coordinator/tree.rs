//! Tree operations on the flattened `elements` sequence.
//!
//! The sequence is a preorder flattening: the subtree of the element at `i`
//! is the maximal run `i+1..j` whose levels are all greater than its own.
//! Every operation returns a fresh sequence with `order` renumbered.

use crate::error::{FolioError, Result};
use crate::model::Element;

/// Set `order` to each element's index.
pub fn renumber(elements: &mut [Element]) {
    for (index, element) in elements.iter_mut().enumerate() {
        element.order = index as u32;
    }
}

pub fn position(elements: &[Element], id: &str) -> Result<usize> {
    elements
        .iter()
        .position(|e| e.id == id)
        .ok_or_else(|| FolioError::ElementNotFound(id.to_string()))
}

/// Exclusive end of the subtree rooted at `index`.
pub fn subtree_end(elements: &[Element], index: usize) -> usize {
    let level = elements[index].level;
    elements[index + 1..]
        .iter()
        .position(|e| e.level <= level)
        .map_or(elements.len(), |offset| index + 1 + offset)
}

/// Check the preorder shape: the first element is a root and no element is
/// more than one level deeper than its predecessor.
pub fn validate_preorder(elements: &[Element]) -> Result<()> {
    if let Some(first) = elements.first() {
        if first.level != 0 {
            return Err(FolioError::InvalidTreeOperation(format!(
                "first element '{}' must be at level 0",
                first.id
            )));
        }
    }
    for pair in elements.windows(2) {
        if pair[1].level > pair[0].level + 1 {
            return Err(FolioError::InvalidTreeOperation(format!(
                "'{}' at level {} cannot follow '{}' at level {}",
                pair[1].id, pair[1].level, pair[0].id, pair[0].level
            )));
        }
    }
    Ok(())
}

/// Insert `element` as the first child of `parent_id`, or at the end when
/// there is no parent.
pub fn insert_element(
    elements: &[Element],
    mut element: Element,
    parent_id: Option<&str>,
) -> Result<Vec<Element>> {
    let mut next = elements.to_vec();
    element.order = next.len() as u32;
    element.expandable = element.is_folder();
    element.parent_id = None;
    match parent_id {
        Some(parent_id) => {
            let parent = position(&next, parent_id)?;
            element.level = next[parent].level + 1;
            next.insert(parent + 1, element);
        }
        None => {
            element.level = 0;
            next.push(element);
        }
    }
    renumber(&mut next);
    Ok(next)
}

/// Remove the element and its subtree. Returns the new sequence and the
/// removed ids.
pub fn remove_subtree(elements: &[Element], id: &str) -> Result<(Vec<Element>, Vec<String>)> {
    let start = position(elements, id)?;
    let end = subtree_end(elements, start);
    let mut next = elements.to_vec();
    let removed = next.drain(start..end).map(|e| e.id).collect();
    renumber(&mut next);
    Ok((next, removed))
}

/// Move the subtree rooted at `id` so its root lands at `target_index` with
/// level `new_level`.
///
/// `target_index` indexes the sequence with the subtree already removed and
/// is clamped to its length. Every member of the subtree shifts by the same
/// level delta. The moved root's `version` is bumped. The result must be a
/// valid preorder.
pub fn move_subtree(
    elements: &[Element],
    id: &str,
    target_index: usize,
    new_level: u32,
) -> Result<Vec<Element>> {
    let start = position(elements, id)?;
    let end = subtree_end(elements, start);
    let mut next = elements.to_vec();
    let mut subtree: Vec<Element> = next.drain(start..end).collect();

    let original_level = subtree[0].level;
    for element in &mut subtree {
        let shifted = i64::from(element.level) + i64::from(new_level) - i64::from(original_level);
        element.level = u32::try_from(shifted).map_err(|_| {
            FolioError::InvalidTreeOperation(format!("'{}' would move above the root", element.id))
        })?;
    }
    subtree[0].version += 1;

    let at = target_index.min(next.len());
    next.splice(at..at, subtree);
    validate_preorder(&next)?;
    renumber(&mut next);
    Ok(next)
}

pub fn rename_element(elements: &[Element], id: &str, name: &str) -> Result<Vec<Element>> {
    let index = position(elements, id)?;
    let mut next = elements.to_vec();
    let element = &mut next[index];
    element.name = name.to_string();
    element.version += 1;
    Ok(next)
}

/// Levels at which a dragged element may be dropped right after `above`.
///
/// `drop_index` is the insertion index in the visible list. Below a folder at
/// level `L` the drop may land beside it (`L`) or inside it (`L + 1`), whatever
/// element follows. Below an item at level `L` only `L` is legal. Level 0 is also
/// offered in the first two positions.
pub fn valid_drop_levels(above: Option<&Element>, drop_index: usize) -> Vec<u32> {
    let mut levels = match above {
        None => vec![0],
        Some(above) if above.is_folder() => vec![above.level, above.level + 1],
        Some(above) => vec![above.level],
    };
    if drop_index <= 1 && !levels.contains(&0) {
        levels.insert(0, 0);
    }
    levels
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

    /// ```text
    /// a (folder)
    ///   b
    ///   c (folder)
    ///     d
    /// e
    /// ```
    fn sample() -> Vec<Element> {
        let mut elements = vec![
            el("a", ElementType::Folder, 0),
            el("b", ElementType::Item, 1),
            el("c", ElementType::Folder, 1),
            el("d", ElementType::Item, 2),
            el("e", ElementType::Item, 0),
        ];
        renumber(&mut elements);
        elements
    }

    fn ids(elements: &[Element]) -> Vec<&str> {
        elements.iter().map(|e| e.id.as_str()).collect()
    }

    fn levels(elements: &[Element]) -> Vec<u32> {
        elements.iter().map(|e| e.level).collect()
    }

    fn assert_well_formed(elements: &[Element]) {
        validate_preorder(elements).unwrap();
        for (i, e) in elements.iter().enumerate() {
            assert_eq!(e.order, i as u32);
            assert_eq!(e.expandable, e.is_folder());
        }
    }

    #[test]
    fn test_subtree_end() {
        let elements = sample();
        assert_eq!(subtree_end(&elements, 0), 4);
        assert_eq!(subtree_end(&elements, 2), 4);
        assert_eq!(subtree_end(&elements, 4), 5);
    }

    #[test]
    fn test_insert_under_parent_and_at_root() {
        let elements = sample();
        let child = Element::new(ElementType::Item, "new");
        let child_id = child.id.clone();
        let next = insert_element(&elements, child, Some("c")).unwrap();
        assert_eq!(ids(&next)[3], child_id);
        assert_eq!(next[3].level, 2);
        assert_well_formed(&next);

        let root = Element::new(ElementType::Folder, "root");
        let next = insert_element(&next, root, None).unwrap();
        assert_eq!(next.last().unwrap().level, 0);
        assert!(next.last().unwrap().expandable);
        assert_well_formed(&next);

        let missing = insert_element(&elements, Element::new(ElementType::Item, "x"), Some("zz"));
        assert!(matches!(missing, Err(FolioError::ElementNotFound(_))));
    }

    #[test]
    fn test_add_then_delete_restores_sequence() {
        let elements = sample();
        let child = Element::new(ElementType::Item, "temp");
        let child_id = child.id.clone();
        let next = insert_element(&elements, child, Some("a")).unwrap();
        let (restored, removed) = remove_subtree(&next, &child_id).unwrap();
        assert_eq!(removed, vec![child_id]);
        assert_eq!(restored, elements);
    }

    #[test]
    fn test_remove_subtree() {
        let (next, removed) = remove_subtree(&sample(), "a").unwrap();
        assert_eq!(removed, vec!["a", "b", "c", "d"]);
        assert_eq!(ids(&next), vec!["e"]);
        assert_well_formed(&next);
    }

    #[test]
    fn test_move_subtree_shifts_levels() {
        // Move c (with d) to the root, after e
        let next = move_subtree(&sample(), "c", 3, 0).unwrap();
        assert_eq!(ids(&next), vec!["a", "b", "e", "c", "d"]);
        assert_eq!(levels(&next), vec![0, 1, 0, 0, 1]);
        assert_eq!(next[3].version, 2);
        assert_eq!(next[4].version, 1);
        assert_well_formed(&next);
    }

    #[test]
    fn test_move_rejects_broken_preorder() {
        // e cannot sit at level 2 directly under a
        let result = move_subtree(&sample(), "e", 1, 2);
        assert!(matches!(result, Err(FolioError::InvalidTreeOperation(_))));

        let next = move_subtree(&sample(), "c", 0, 0).unwrap();
        assert_eq!(ids(&next), vec!["c", "d", "a", "b", "e"]);
        assert_eq!(levels(&next), vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_move_clamps_target_index() {
        let next = move_subtree(&sample(), "b", 99, 0).unwrap();
        assert_eq!(ids(&next), vec!["a", "c", "d", "e", "b"]);
        assert_well_formed(&next);
    }

    #[test]
    fn test_rename_bumps_version() {
        let next = rename_element(&sample(), "b", "Bee").unwrap();
        assert_eq!(next[1].name, "Bee");
        assert_eq!(next[1].version, 2);
        assert!(rename_element(&sample(), "zz", "x").is_err());
    }

    #[test]
    fn test_drop_levels() {
        let elements = sample();
        // Top of the list
        assert_eq!(valid_drop_levels(None, 0), vec![0]);
        // Between folder a and its first child b
        assert_eq!(valid_drop_levels(Some(&elements[0]), 1), vec![0, 1]);
        // Between item b and folder c
        assert_eq!(valid_drop_levels(Some(&elements[1]), 2), vec![1]);
        // Between folder c and its child d: beside c or inside it
        assert_eq!(valid_drop_levels(Some(&elements[2]), 3), vec![1, 2]);
        // After the last element
        assert_eq!(valid_drop_levels(Some(&elements[4]), 5), vec![0]);

        let folder = el("f", ElementType::Folder, 1);
        assert_eq!(valid_drop_levels(Some(&folder), 4), vec![1, 2]);
    }

    #[test]
    fn test_validate_preorder() {
        assert!(validate_preorder(&[]).is_ok());
        assert!(validate_preorder(&[el("x", ElementType::Item, 1)]).is_err());
        assert!(
            validate_preorder(&[
                el("x", ElementType::Folder, 0),
                el("y", ElementType::Item, 2)
            ])
            .is_err()
        );
    }
}

use serde::Serialize;

use crate::model::{Element, ElementType};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTab {
    pub element_id: String,
    pub name: String,
    pub element_type: ElementType,
}

impl From<&Element> for OpenTab {
    fn from(element: &Element) -> Self {
        Self {
            element_id: element.id.clone(),
            name: element.name.clone(),
            element_type: element.element_type,
        }
    }
}

/// Open documents and the selected one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabState {
    pub tabs: Vec<OpenTab>,
    pub selected: usize,
}

impl TabState {
    pub fn selected_tab(&self) -> Option<&OpenTab> {
        self.tabs.get(self.selected)
    }

    pub fn index_of(&self, element_id: &str) -> Option<usize> {
        self.tabs.iter().position(|t| t.element_id == element_id)
    }

    /// Open `element`, or select it when it is already open.
    pub fn open(&mut self, element: &Element) {
        match self.index_of(&element.id) {
            Some(index) => self.selected = index,
            None => {
                self.tabs.push(OpenTab::from(element));
                self.selected = self.tabs.len() - 1;
            }
        }
    }

    /// Close the tab at `index`. Out-of-range indices are ignored.
    pub fn close(&mut self, index: usize) {
        if index >= self.tabs.len() {
            return;
        }
        self.tabs.remove(index);
        if self.selected >= index {
            self.selected = index.saturating_sub(1);
        }
    }

    pub fn select(&mut self, index: usize) -> bool {
        if index < self.tabs.len() {
            self.selected = index;
            true
        } else {
            false
        }
    }

    /// Close every tab showing one of `ids`.
    pub fn close_elements(&mut self, ids: &[String]) {
        while let Some(index) = self.tabs.iter().position(|t| ids.contains(&t.element_id)) {
            self.close(index);
        }
    }

    /// Refresh tab names after a rename.
    pub fn rename(&mut self, element_id: &str, name: &str) {
        for tab in self.tabs.iter_mut().filter(|t| t.element_id == element_id) {
            tab.name = name.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: &str) -> Element {
        let mut element = Element::new(ElementType::Item, id);
        element.id = id.to_string();
        element
    }

    fn ids(state: &TabState) -> Vec<&str> {
        state.tabs.iter().map(|t| t.element_id.as_str()).collect()
    }

    #[test]
    fn test_open_existing_only_selects() {
        let mut state = TabState::default();
        state.open(&element("a"));
        state.open(&element("b"));
        assert_eq!(state.selected, 1);
        state.open(&element("a"));
        assert_eq!(ids(&state), vec!["a", "b"]);
        assert_eq!(state.selected, 0);
    }

    #[test]
    fn test_close_clamps_selection() {
        let mut state = TabState::default();
        for id in ["a", "b", "c"] {
            state.open(&element(id));
        }
        // Selected c (2), close b (1): selection moves to a
        state.close(1);
        assert_eq!(ids(&state), vec!["a", "c"]);
        assert_eq!(state.selected, 0);

        // Selected before the closed tab is untouched
        state.open(&element("d"));
        state.select(0);
        state.close(2);
        assert_eq!(state.selected, 0);

        state.close(0);
        state.close(0);
        assert!(state.tabs.is_empty());
        assert_eq!(state.selected, 0);
        state.close(5);
    }

    #[test]
    fn test_close_elements_and_rename() {
        let mut state = TabState::default();
        for id in ["a", "b", "c"] {
            state.open(&element(id));
        }
        state.rename("b", "Bee");
        assert_eq!(state.tabs[1].name, "Bee");
        state.close_elements(&["a".to_string(), "c".to_string()]);
        assert_eq!(ids(&state), vec!["b"]);
        assert_eq!(state.selected_tab().map(|t| t.name.as_str()), Some("Bee"));
    }
}

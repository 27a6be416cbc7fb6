//! Project state coordinator.
//!
//! The single entry point above a [`SyncProvider`]. It loads projects
//! (always detaching the previous one first), applies tree operations to the
//! flattened `elements` sequence, and owns the UI-facing state derived from
//! it: the expansion set, the visible projection, and the open tabs.
//!
//! ```ignore
//! let coordinator = ProjectCoordinator::from_factory(&factory).with_api(api);
//! coordinator.load_project("alice", "novel").await;
//!
//! let folder = coordinator.add_element(NewElement::new(ElementType::Folder, "Chapters")).await?;
//! coordinator
//!     .add_element(NewElement::new(ElementType::Item, "Chapter 1").under(&folder.id))
//!     .await?;
//! ```

mod tabs;
mod tree;
mod visibility;

pub use tabs::{OpenTab, TabState};
pub use tree::{validate_preorder, valid_drop_levels};
pub use visibility::{VisibleElement, visible_elements};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::api::{ProjectApi, ProjectDescriptor};
use crate::config::SyncMode;
use crate::error::{FolioError, Result};
use crate::model::{
    Element, ElementType, ProjectMeta, Relationship, SyncPhase, TagAssignment,
};
use crate::observable::{Subject, Subscription};
use crate::project_key::ProjectKey;
use crate::provider::{
    ConnectOptions, ConnectResult, ProviderFactory, SyncProvider, SyncProviderExt,
};
use crate::task::CancellationFlag;
use crate::worldbuilding::{WorldbuildingConnections, WorldbuildingRemote};

/// Arguments of [`ProjectCoordinator::add_element`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewElement {
    pub element_type: ElementType,
    pub name: String,
    pub parent_id: Option<String>,
    pub metadata: IndexMap<String, String>,
    pub schema_id: Option<String>,
}

impl NewElement {
    pub fn new(element_type: ElementType, name: impl Into<String>) -> Self {
        Self {
            element_type,
            name: name.into(),
            parent_id: None,
            metadata: IndexMap::new(),
            schema_id: None,
        }
    }

    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_schema(mut self, schema_id: impl Into<String>) -> Self {
        self.schema_id = Some(schema_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: IndexMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

struct ViewState {
    expanded: Mutex<HashSet<String>>,
    visible: Subject<Vec<VisibleElement>>,
}

impl ViewState {
    fn refresh(&self, elements: &[Element]) {
        let expanded = self.expanded.lock().unwrap().clone();
        self.visible.next(visible_elements(elements, &expanded));
    }
}

struct LoadedProject {
    key: ProjectKey,
    descriptor: Option<ProjectDescriptor>,
}

pub struct ProjectCoordinator {
    provider: Arc<dyn SyncProvider>,
    api: Option<Arc<dyn ProjectApi>>,
    worldbuilding: Arc<WorldbuildingConnections>,
    view: Arc<ViewState>,
    tabs: Subject<TabState>,
    error: Arc<Subject<Option<String>>>,
    loading: Subject<bool>,
    project: Mutex<Option<LoadedProject>>,
    load_cancel: Mutex<CancellationFlag>,
    generation: AtomicU64,
    _subscriptions: Vec<Subscription>,
}

impl ProjectCoordinator {
    pub fn new(provider: Arc<dyn SyncProvider>, worldbuilding: Arc<WorldbuildingConnections>) -> Self {
        let view = Arc::new(ViewState {
            expanded: Mutex::new(HashSet::new()),
            visible: Subject::new(Vec::new()),
        });
        let error = Arc::new(Subject::new(None));

        let elements_view = Arc::clone(&view);
        let errors = Arc::clone(&error);
        let subscriptions = vec![
            provider.subscribe_elements(move |elements| elements_view.refresh(elements)),
            provider.subscribe_errors(Box::new(move |message| errors.next(Some(message.clone())))),
        ];

        Self {
            provider,
            api: None,
            worldbuilding,
            view,
            tabs: Subject::new(TabState::default()),
            error,
            loading: Subject::new(false),
            project: Mutex::new(None),
            load_cancel: Mutex::new(CancellationFlag::new()),
            generation: AtomicU64::new(0),
            _subscriptions: subscriptions,
        }
    }

    /// Build the provider and the worldbuilding connections for the
    /// factory's mode.
    pub fn from_factory(factory: &ProviderFactory) -> Self {
        let deps = factory.deps();
        let mut worldbuilding =
            WorldbuildingConnections::new(Arc::clone(&deps.store), deps.timings.clone());
        if let (SyncMode::Server, Some(url)) = (factory.mode(), factory.websocket_url()) {
            worldbuilding = worldbuilding.with_remote(WorldbuildingRemote {
                transport: Arc::clone(&deps.transport),
                tokens: Arc::clone(&deps.tokens),
                connectivity: deps.connectivity.clone(),
                base_url: url.to_string(),
            });
        }
        Self::new(factory.create(), Arc::new(worldbuilding))
    }

    /// Fetch project descriptors from `api` when loading.
    pub fn with_api(mut self, api: Arc<dyn ProjectApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn provider(&self) -> &Arc<dyn SyncProvider> {
        &self.provider
    }

    pub fn worldbuilding(&self) -> &Arc<WorldbuildingConnections> {
        &self.worldbuilding
    }

    pub fn project_key(&self) -> Option<ProjectKey> {
        self.project.lock().unwrap().as_ref().map(|p| p.key.clone())
    }

    /// Descriptor fetched from the project API during the last load.
    pub fn descriptor(&self) -> Option<ProjectDescriptor> {
        self.project
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|p| p.descriptor.clone())
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.provider.sync_phase()
    }

    pub fn is_loading(&self) -> bool {
        *self.loading.get()
    }

    /// Last load failure or provider error.
    pub fn error(&self) -> Option<String> {
        (*self.error.get()).clone()
    }

    pub fn subscribe_error(
        &self,
        callback: impl Fn(&Option<String>) + Send + Sync + 'static,
    ) -> Subscription {
        self.error.subscribe(move |error| callback(error))
    }

    pub fn elements(&self) -> Vec<Element> {
        self.provider.get_elements()
    }

    // ==================== Lifecycle ====================

    /// Detach from the current project and attach to `owner/slug`.
    ///
    /// A descriptor fetch failure is logged and the load continues from local
    /// data. A connect failure is recorded in [`error`](Self::error).
    pub async fn load_project(&self, owner: &str, slug: &str) -> ConnectResult {
        self.disconnect();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationFlag::new();
        *self.load_cancel.lock().unwrap() = cancel.clone();
        self.error.next(None);

        let key = match ProjectKey::new(owner, slug) {
            Ok(key) => key,
            Err(e) => return self.fail_load(e.to_string()),
        };
        log::info!("[ProjectCoordinator] Loading {}", key);
        self.loading.next(true);

        let descriptor = match &self.api {
            Some(api) => {
                let fetched = tokio::select! {
                    result = api.get_project(&key.owner, &key.slug) => result,
                    _ = cancel.cancelled() => return ConnectResult::failed(FolioError::Cancelled.to_string()),
                };
                match fetched {
                    Ok(descriptor) => Some(descriptor),
                    Err(e) => {
                        log::warn!("[ProjectCoordinator] Could not fetch {}: {}", key, e);
                        None
                    }
                }
            }
            None => None,
        };

        let result = self
            .provider
            .connect(ConnectOptions::new(key.owner.clone(), key.slug.clone()))
            .await;
        if cancel.is_cancelled() || self.generation.load(Ordering::SeqCst) != generation {
            return ConnectResult::failed(FolioError::Cancelled.to_string());
        }
        if !result.success {
            let message = result.error.clone().unwrap_or_else(|| "Connect failed".to_string());
            return self.fail_load(message);
        }

        if let Some(descriptor) = &descriptor {
            self.adopt_descriptor(descriptor);
        }
        *self.project.lock().unwrap() = Some(LoadedProject { key, descriptor });
        self.loading.next(false);
        result
    }

    fn fail_load(&self, message: String) -> ConnectResult {
        log::warn!("[ProjectCoordinator] Load failed: {}", message);
        self.error.next(Some(message.clone()));
        self.loading.next(false);
        ConnectResult::failed(message)
    }

    /// Fill an empty `projectMeta` from the server descriptor.
    fn adopt_descriptor(&self, descriptor: &ProjectDescriptor) {
        let meta = self.provider.get_project_meta();
        if meta.contains_key(ProjectMeta::NAME) {
            return;
        }
        let mut next = meta;
        next.insert(ProjectMeta::NAME.to_string(), descriptor.title.clone());
        if let Some(description) = &descriptor.description {
            next.insert(ProjectMeta::DESCRIPTION.to_string(), description.clone());
        }
        self.provider.update_project_meta(next);
    }

    /// Detach from the current project. Idempotent.
    pub fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.load_cancel.lock().unwrap().cancel();
        let project = self.project.lock().unwrap().take();

        self.provider.disconnect();
        if let Some(project) = project {
            log::info!("[ProjectCoordinator] Closed {}", project.key);
            self.worldbuilding.close_project(&project.key);
        }
        self.view.expanded.lock().unwrap().clear();
        self.view.refresh(&[]);
        self.tabs.next(TabState::default());
        self.loading.next(false);
    }

    fn require_project(&self, operation: &str) -> Result<ProjectKey> {
        match self.project_key() {
            Some(key) => Ok(key),
            None => {
                log::warn!("[ProjectCoordinator] {} ignored: no project loaded", operation);
                Err(FolioError::InvalidTreeOperation(format!(
                    "{}: no project loaded",
                    operation
                )))
            }
        }
    }

    // ==================== Tree ====================

    /// Insert a new element as the first child of its parent (or at the end)
    /// and expand the parent. Worldbuilding elements with a schema get their
    /// document stamped from the template.
    pub async fn add_element(&self, new: NewElement) -> Result<Element> {
        let key = self.require_project("addElement")?;
        let mut element = Element::new(new.element_type, new.name);
        element.metadata = new.metadata;
        element.schema_id = new.schema_id;
        let id = element.id.clone();

        let next = tree::insert_element(&self.provider.get_elements(), element, new.parent_id.as_deref())?;
        let created = next
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| FolioError::ElementNotFound(id.clone()))?;
        if let Some(parent_id) = &new.parent_id {
            self.view.expanded.lock().unwrap().insert(parent_id.clone());
        }
        self.provider.update_elements(next);

        if created.element_type == ElementType::Worldbuilding {
            self.initialize_worldbuilding(&key, &created).await;
        }
        Ok(created)
    }

    async fn initialize_worldbuilding(&self, key: &ProjectKey, element: &Element) {
        let Some(schema_id) = &element.schema_id else {
            return;
        };
        let Some(schema) = self
            .provider
            .get_schemas()
            .into_iter()
            .find(|s| &s.id == schema_id)
        else {
            log::warn!("[ProjectCoordinator] Unknown schema '{}'", schema_id);
            return;
        };
        if let Err(e) = self
            .worldbuilding
            .initialize(key, &element.id, &element.name, &schema)
            .await
        {
            log::warn!(
                "[ProjectCoordinator] Worldbuilding init of {} failed: {}",
                element.id,
                e
            );
        }
    }

    /// Remove an element with its subtree, plus every relationship and tag
    /// assignment touching a removed id. Returns the removed ids.
    pub fn delete_element(&self, id: &str) -> Result<Vec<String>> {
        self.require_project("deleteElement")?;
        let (next, removed) = tree::remove_subtree(&self.provider.get_elements(), id)?;

        {
            let mut expanded = self.view.expanded.lock().unwrap();
            for id in &removed {
                expanded.remove(id);
            }
        }
        self.provider.update_elements(next);

        let relationships = self.provider.get_relationships();
        if relationships.iter().any(|r| r.references_any(&removed)) {
            self.provider.update_relationships(
                relationships
                    .into_iter()
                    .filter(|r| !r.references_any(&removed))
                    .collect(),
            );
        }
        let tags = self.provider.get_element_tags();
        if tags.iter().any(|t| removed.contains(&t.element_id)) {
            self.provider.update_element_tags(
                tags.into_iter()
                    .filter(|t| !removed.contains(&t.element_id))
                    .collect(),
            );
        }
        self.update_tabs(|tabs| tabs.close_elements(&removed));
        Ok(removed)
    }

    /// Move an element with its subtree. `target_index` indexes the sequence
    /// with the subtree removed.
    pub fn move_element(&self, id: &str, target_index: usize, new_level: u32) -> Result<()> {
        self.require_project("moveElement")?;
        let next = tree::move_subtree(&self.provider.get_elements(), id, target_index, new_level)?;
        self.provider.update_elements(next);
        Ok(())
    }

    pub fn rename_element(&self, id: &str, name: &str) -> Result<()> {
        self.require_project("renameElement")?;
        let next = tree::rename_element(&self.provider.get_elements(), id, name)?;
        self.provider.update_elements(next);
        self.update_tabs(|tabs| tabs.rename(id, name));
        Ok(())
    }

    // ==================== Visibility ====================

    pub fn visible_elements(&self) -> Arc<Vec<VisibleElement>> {
        self.view.visible.get()
    }

    pub fn subscribe_visible(
        &self,
        callback: impl Fn(&Arc<Vec<VisibleElement>>) + Send + Sync + 'static,
    ) -> Subscription {
        self.view.visible.subscribe(callback)
    }

    pub fn is_expanded(&self, id: &str) -> bool {
        self.view.expanded.lock().unwrap().contains(id)
    }

    pub fn expanded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.view.expanded.lock().unwrap().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn set_expanded(&self, id: &str, expanded: bool) {
        {
            let mut set = self.view.expanded.lock().unwrap();
            if expanded {
                set.insert(id.to_string());
            } else {
                set.remove(id);
            }
        }
        self.view.refresh(&self.provider.get_elements());
    }

    pub fn toggle_expanded(&self, id: &str) {
        let expanded = self.is_expanded(id);
        self.set_expanded(id, !expanded);
    }

    /// Legal levels for a drop at `drop_index` of the visible list.
    pub fn drop_levels(&self, drop_index: usize) -> Vec<u32> {
        let visible = self.visible_elements();
        let above = drop_index
            .checked_sub(1)
            .and_then(|i| visible.get(i))
            .map(|v| &v.element);
        valid_drop_levels(above, drop_index)
    }

    // ==================== Tabs ====================

    pub fn tabs(&self) -> Arc<TabState> {
        self.tabs.get()
    }

    pub fn subscribe_tabs(&self, callback: impl Fn(&Arc<TabState>) + Send + Sync + 'static) -> Subscription {
        self.tabs.subscribe(callback)
    }

    fn update_tabs(&self, change: impl FnOnce(&mut TabState)) {
        let mut tabs = (*self.tabs.get()).clone();
        change(&mut tabs);
        self.tabs.next(tabs);
    }

    pub fn open_tab(&self, element_id: &str) -> Result<()> {
        let element = self
            .provider
            .get_elements()
            .into_iter()
            .find(|e| e.id == element_id)
            .ok_or_else(|| FolioError::ElementNotFound(element_id.to_string()))?;
        self.update_tabs(|tabs| tabs.open(&element));
        Ok(())
    }

    pub fn close_tab(&self, index: usize) {
        self.update_tabs(|tabs| tabs.close(index));
    }

    pub fn select_tab(&self, index: usize) -> bool {
        let mut selected = false;
        self.update_tabs(|tabs| selected = tabs.select(index));
        selected
    }

    // ==================== Project meta ====================

    pub fn project_meta(&self) -> ProjectMeta {
        ProjectMeta::from_map(&self.provider.get_project_meta())
    }

    /// Set or clear individual meta fields and stamp `updatedAt`. An empty
    /// value removes the field.
    pub fn update_project_meta(&self, fields: IndexMap<String, String>) -> Result<()> {
        self.require_project("updateProjectMeta")?;
        let mut meta = self.provider.get_project_meta();
        for (key, value) in fields {
            if value.is_empty() {
                meta.shift_remove(&key);
            } else {
                meta.insert(key, value);
            }
        }
        meta.insert(
            ProjectMeta::UPDATED_AT.to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
        self.provider.update_project_meta(meta);
        Ok(())
    }

    // ==================== Tags & relationships ====================

    fn require_element(&self, id: &str) -> Result<()> {
        if self.provider.get_elements().iter().any(|e| e.id == id) {
            Ok(())
        } else {
            Err(FolioError::ElementNotFound(id.to_string()))
        }
    }

    pub fn assign_tag(&self, element_id: &str, tag_id: &str) -> Result<TagAssignment> {
        self.require_project("assignTag")?;
        self.require_element(element_id)?;
        let mut tags = self.provider.get_element_tags();
        if tags
            .iter()
            .any(|t| t.element_id == element_id && t.tag_id == tag_id)
        {
            return Err(FolioError::AlreadyExists(format!(
                "tag {} on {}",
                tag_id, element_id
            )));
        }
        let assignment = TagAssignment {
            id: uuid::Uuid::new_v4().to_string(),
            element_id: element_id.to_string(),
            tag_id: tag_id.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        tags.push(assignment.clone());
        self.provider.update_element_tags(tags);
        Ok(assignment)
    }

    /// Returns whether an assignment was removed.
    pub fn remove_tag(&self, element_id: &str, tag_id: &str) -> Result<bool> {
        self.require_project("removeTag")?;
        let tags = self.provider.get_element_tags();
        let before = tags.len();
        let kept: Vec<TagAssignment> = tags
            .into_iter()
            .filter(|t| !(t.element_id == element_id && t.tag_id == tag_id))
            .collect();
        if kept.len() == before {
            return Ok(false);
        }
        self.provider.update_element_tags(kept);
        Ok(true)
    }

    pub fn add_relationship(
        &self,
        source_element_id: &str,
        target_element_id: &str,
        relationship_type_id: &str,
    ) -> Result<Relationship> {
        self.require_project("addRelationship")?;
        self.require_element(source_element_id)?;
        self.require_element(target_element_id)?;
        let relationship = Relationship {
            id: uuid::Uuid::new_v4().to_string(),
            source_element_id: source_element_id.to_string(),
            target_element_id: target_element_id.to_string(),
            relationship_type_id: relationship_type_id.to_string(),
            note: None,
        };
        let mut relationships = self.provider.get_relationships();
        relationships.push(relationship.clone());
        self.provider.update_relationships(relationships);
        Ok(relationship)
    }

    pub fn remove_relationship(&self, id: &str) -> Result<bool> {
        self.require_project("removeRelationship")?;
        let relationships = self.provider.get_relationships();
        let before = relationships.len();
        let kept: Vec<Relationship> = relationships.into_iter().filter(|r| r.id != id).collect();
        if kept.len() == before {
            return Ok(false);
        }
        self.provider.update_relationships(kept);
        Ok(true)
    }
}

impl Drop for ProjectCoordinator {
    fn drop(&mut self) {
        self.load_cancel.lock().unwrap().cancel();
    }
}

impl std::fmt::Debug for ProjectCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectCoordinator")
            .field("project", &self.project_key())
            .field("phase", &self.sync_phase())
            .finish_non_exhaustive()
    }
}

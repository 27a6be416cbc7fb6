//! In-process collaborators for tests and offline demos.
//!
//! [`MockProjectApi`] and [`MockMediaSync`] record every call and can be told
//! to fail for particular projects. Clones share state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;

use crate::BoxFuture;
use crate::api::{
    MediaInfo, MediaSyncReport, MediaSyncService, MediaSyncStatus, NewProject, ProjectApi,
    ProjectDescriptor, ProjectUpdate,
};
use crate::error::{FolioError, Result};
use crate::project_key::ProjectKey;

#[derive(Default)]
struct ApiState {
    projects: Mutex<IndexMap<ProjectKey, ProjectDescriptor>>,
    media: Mutex<IndexMap<ProjectKey, Vec<MediaInfo>>>,
    failing_get: Mutex<HashSet<ProjectKey>>,
    failing_media: Mutex<HashSet<ProjectKey>>,
    fail_create: AtomicBool,
    created: Mutex<Vec<NewProject>>,
    updated: Mutex<Vec<(ProjectKey, ProjectUpdate)>>,
    get_calls: AtomicUsize,
    next_id: AtomicUsize,
}

/// A project API holding its projects in memory.
#[derive(Clone)]
pub struct MockProjectApi {
    username: String,
    state: Arc<ApiState>,
}

impl MockProjectApi {
    /// `username` owns every project created through the API.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            state: Arc::default(),
        }
    }

    /// Add a project (builder pattern).
    pub fn with_project(self, project: ProjectDescriptor) -> Self {
        self.insert(project);
        self
    }

    pub fn insert(&self, project: ProjectDescriptor) {
        if let Ok(key) = project.key() {
            self.state.projects.lock().unwrap().insert(key, project);
        }
    }

    pub fn set_media(&self, key: &ProjectKey, media: Vec<MediaInfo>) {
        self.state.media.lock().unwrap().insert(key.clone(), media);
    }

    /// Make `get_project` fail for `key`.
    pub fn fail_get(&self, key: &ProjectKey) {
        self.state.failing_get.lock().unwrap().insert(key.clone());
    }

    /// Make `list_project_media` fail for `key`.
    pub fn fail_media(&self, key: &ProjectKey) {
        self.state.failing_media.lock().unwrap().insert(key.clone());
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn project(&self, key: &ProjectKey) -> Option<ProjectDescriptor> {
        self.state.projects.lock().unwrap().get(key).cloned()
    }

    /// Payloads of every create call, in order.
    pub fn created(&self) -> Vec<NewProject> {
        self.state.created.lock().unwrap().clone()
    }

    /// Every update call, in order.
    pub fn updated(&self) -> Vec<(ProjectKey, ProjectUpdate)> {
        self.state.updated.lock().unwrap().clone()
    }

    pub fn get_calls(&self) -> usize {
        self.state.get_calls.load(Ordering::SeqCst)
    }

    fn key(owner: &str, slug: &str) -> Result<ProjectKey> {
        ProjectKey::new(owner, slug)
    }
}

impl ProjectApi for MockProjectApi {
    fn list_projects(&self) -> BoxFuture<'_, Result<Vec<ProjectDescriptor>>> {
        Box::pin(async move { Ok(self.state.projects.lock().unwrap().values().cloned().collect()) })
    }

    fn get_project<'a>(
        &'a self,
        owner: &'a str,
        slug: &'a str,
    ) -> BoxFuture<'a, Result<ProjectDescriptor>> {
        Box::pin(async move {
            self.state.get_calls.fetch_add(1, Ordering::SeqCst);
            let key = Self::key(owner, slug)?;
            if self.state.failing_get.lock().unwrap().contains(&key) {
                return Err(FolioError::Api(format!("500 Internal Server Error for {}", key)));
            }
            self.project(&key)
                .ok_or_else(|| FolioError::Api(format!("404 Not Found: {}", key)))
        })
    }

    fn create_project<'a>(
        &'a self,
        project: &'a NewProject,
    ) -> BoxFuture<'a, Result<ProjectDescriptor>> {
        Box::pin(async move {
            self.state.created.lock().unwrap().push(project.clone());
            if self.state.fail_create.load(Ordering::SeqCst) {
                return Err(FolioError::Api("503 Service Unavailable".to_string()));
            }
            let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let now = chrono::Utc::now().to_rfc3339();
            let created = ProjectDescriptor {
                id: Some(format!("srv-{}", id)),
                username: self.username.clone(),
                slug: project.slug.clone(),
                title: project.title.clone(),
                description: project.description.clone(),
                cover_image: None,
                created_date: Some(now.clone()),
                updated_date: Some(now),
            };
            self.insert(created.clone());
            Ok(created)
        })
    }

    fn update_project<'a>(
        &'a self,
        owner: &'a str,
        slug: &'a str,
        update: &'a ProjectUpdate,
    ) -> BoxFuture<'a, Result<ProjectDescriptor>> {
        Box::pin(async move {
            let key = Self::key(owner, slug)?;
            self.state
                .updated
                .lock()
                .unwrap()
                .push((key.clone(), update.clone()));
            let mut projects = self.state.projects.lock().unwrap();
            let project = projects
                .get_mut(&key)
                .ok_or_else(|| FolioError::Api(format!("404 Not Found: {}", key)))?;
            if let Some(title) = &update.title {
                project.title = title.clone();
            }
            if let Some(description) = &update.description {
                project.description = Some(description.clone());
            }
            project.updated_date = Some(chrono::Utc::now().to_rfc3339());
            Ok(project.clone())
        })
    }

    fn list_project_media<'a>(
        &'a self,
        owner: &'a str,
        slug: &'a str,
    ) -> BoxFuture<'a, Result<Vec<MediaInfo>>> {
        Box::pin(async move {
            let key = Self::key(owner, slug)?;
            if self.state.failing_media.lock().unwrap().contains(&key) {
                return Err(FolioError::Api(format!("Media listing failed for {}", key)));
            }
            Ok(self
                .state
                .media
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or_default())
        })
    }
}

#[derive(Default)]
struct MediaState {
    syncs: Mutex<Vec<(ProjectKey, tokio::time::Instant)>>,
    status_checks: AtomicUsize,
    needs_sync: AtomicBool,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

/// A media service that only records calls.
#[derive(Clone, Default)]
pub struct MockMediaSync {
    state: Arc<MediaState>,
}

impl MockMediaSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make each full sync take `delay` (builder pattern).
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn set_needs_sync(&self, needs_sync: bool) {
        self.state.needs_sync.store(needs_sync, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn full_sync_count(&self) -> usize {
        self.state.syncs.lock().unwrap().len()
    }

    /// When each full sync started.
    pub fn full_sync_times(&self) -> Vec<tokio::time::Instant> {
        self.state
            .syncs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn synced_projects(&self) -> Vec<ProjectKey> {
        self.state
            .syncs
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn status_checks(&self) -> usize {
        self.state.status_checks.load(Ordering::SeqCst)
    }
}

impl MediaSyncService for MockMediaSync {
    fn full_sync<'a>(&'a self, project: &'a ProjectKey) -> BoxFuture<'a, Result<MediaSyncReport>> {
        Box::pin(async move {
            self.state
                .syncs
                .lock()
                .unwrap()
                .push((project.clone(), tokio::time::Instant::now()));
            let delay = *self.state.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.state.failing.load(Ordering::SeqCst) {
                return Err(FolioError::Api("Media sync failed".to_string()));
            }
            self.state.needs_sync.store(false, Ordering::SeqCst);
            Ok(MediaSyncReport::default())
        })
    }

    fn check_sync_status<'a>(
        &'a self,
        _project: &'a ProjectKey,
    ) -> BoxFuture<'a, Result<MediaSyncStatus>> {
        Box::pin(async move {
            self.state.status_checks.fetch_add(1, Ordering::SeqCst);
            Ok(MediaSyncStatus {
                needs_sync: self.state.needs_sync.load(Ordering::SeqCst),
                ..Default::default()
            })
        })
    }
}

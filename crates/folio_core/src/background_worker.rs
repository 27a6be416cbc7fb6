//! Retries project mutations made while offline.
//!
//! Projects created or edited without a connection are kept in the offline
//! project cache with `pendingCreation` / `pendingMetadata` flags. The worker
//! replays them against the project API on start and on every transition to
//! online. Only one run is in flight at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::api::{NewProject, ProjectApi, ProjectDescriptor, ProjectUpdate};
use crate::config::SyncMode;
use crate::connectivity::Connectivity;
use crate::crdt::DocumentStore;
use crate::error::{FolioError, Result};
use crate::project_key::ProjectKey;

/// Store key of the offline project cache.
pub const OFFLINE_PROJECTS_KEY: &str = "projects:offline";

/// A cached project plus its replay flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineProject {
    #[serde(flatten)]
    pub project: ProjectDescriptor,
    /// Created while offline; the server does not know it yet.
    #[serde(default)]
    pub pending_creation: bool,
    /// Title or description changed while offline.
    #[serde(default)]
    pub pending_metadata: bool,
}

impl OfflineProject {
    pub fn key(&self) -> Result<ProjectKey> {
        self.project.key()
    }

    pub fn is_pending(&self) -> bool {
        self.pending_creation || self.pending_metadata
    }
}

/// JSON list of [`OfflineProject`]s kept in the durable store.
#[derive(Clone)]
pub struct OfflineProjectStore {
    store: Arc<dyn DocumentStore>,
}

impl OfflineProjectStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<OfflineProject>> {
        match self.store.get_value(OFFLINE_PROJECTS_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn save_all(&self, projects: &[OfflineProject]) -> Result<()> {
        let json = serde_json::to_string(projects)?;
        self.store.set_value(OFFLINE_PROJECTS_KEY, &json)
    }

    pub fn get(&self, key: &ProjectKey) -> Result<Option<OfflineProject>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|p| p.key().ok().as_ref() == Some(key)))
    }

    /// Insert or replace the entry with the same key.
    pub fn upsert(&self, project: OfflineProject) -> Result<()> {
        let key = project.key()?;
        let mut projects = self.list()?;
        match projects
            .iter_mut()
            .find(|p| p.key().ok().as_ref() == Some(&key))
        {
            Some(existing) => *existing = project,
            None => projects.push(project),
        }
        self.save_all(&projects)
    }

    /// Apply `change` to the current entry for `sent`'s key.
    ///
    /// An entry removed in the meantime is left removed.
    fn modify(
        &self,
        sent: &ProjectDescriptor,
        change: impl FnOnce(&mut OfflineProject),
    ) -> Result<()> {
        let key = sent.key()?;
        match self.get(&key)? {
            Some(mut fresh) => {
                change(&mut fresh);
                self.upsert(fresh)
            }
            None => {
                log::debug!("[BackgroundSyncWorker] {} left the offline cache", key);
                Ok(())
            }
        }
    }

    /// Record a project created without a connection.
    pub fn create_offline(&self, project: ProjectDescriptor) -> Result<OfflineProject> {
        let key = project.key()?;
        if self.get(&key)?.is_some() {
            return Err(FolioError::AlreadyExists(format!("project {}", key)));
        }
        let offline = OfflineProject {
            project,
            pending_creation: true,
            pending_metadata: false,
        };
        self.upsert(offline.clone())?;
        Ok(offline)
    }

    /// Record an offline title/description edit.
    pub fn update_metadata(
        &self,
        key: &ProjectKey,
        title: Option<String>,
        description: Option<String>,
    ) -> Result<()> {
        let mut project = self
            .get(key)?
            .ok_or_else(|| FolioError::InvalidProjectKey(key.to_string()))?;
        if let Some(title) = title {
            project.project.title = title;
        }
        if description.is_some() {
            project.project.description = description;
        }
        if !project.pending_creation {
            project.pending_metadata = true;
        }
        self.upsert(project)
    }
}

/// Title and description match what was sent to the server.
fn same_metadata(current: &ProjectDescriptor, sent: &ProjectDescriptor) -> bool {
    current.title == sent.title && current.description == sent.description
}

/// Outcome of one [`BackgroundSyncWorker::sync_pending_items`] run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub all_success: bool,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    /// Error per project key (`owner/slug`).
    pub errors: IndexMap<String, String>,
}

/// Resets the in-flight flag when a run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BackgroundSyncWorker {
    projects: OfflineProjectStore,
    api: Arc<dyn ProjectApi>,
    connectivity: Connectivity,
    mode: SyncMode,
    running: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    last_report: Mutex<Option<SyncReport>>,
}

impl BackgroundSyncWorker {
    pub fn new(
        projects: OfflineProjectStore,
        api: Arc<dyn ProjectApi>,
        connectivity: Connectivity,
        mode: SyncMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            projects,
            api,
            connectivity,
            mode,
            running: AtomicBool::new(false),
            listener: Mutex::new(None),
            last_report: Mutex::new(None),
        })
    }

    pub fn projects(&self) -> &OfflineProjectStore {
        &self.projects
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.lock().unwrap().clone()
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Run once now (when online) and again on every transition to online.
    /// No-op in local mode.
    pub fn start(self: &Arc<Self>) {
        if self.mode != SyncMode::Server {
            log::debug!("[BackgroundSyncWorker] Local mode, not starting");
            return;
        }
        let mut listener = self.listener.lock().unwrap();
        if listener.is_some() {
            return;
        }

        let worker: Weak<Self> = Arc::downgrade(self);
        let mut online = self.connectivity.subscribe();
        *listener = Some(tokio::spawn(async move {
            let initially_online = *online.borrow_and_update();
            if initially_online {
                match worker.upgrade() {
                    Some(worker) => {
                        worker.sync_pending_items().await;
                    }
                    None => return,
                }
            }
            while online.changed().await.is_ok() {
                if !*online.borrow_and_update() {
                    continue;
                }
                let Some(worker) = worker.upgrade() else {
                    break;
                };
                log::info!("[BackgroundSyncWorker] Back online, syncing pending items");
                worker.sync_pending_items().await;
            }
        }));
    }

    /// Remove the online listener.
    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Replay pending creations and metadata edits.
    ///
    /// Returns `None` when another run is in flight or the host is offline.
    /// Per-project failures are recorded in the report and never stop the
    /// run.
    pub async fn sync_pending_items(&self) -> Option<SyncReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::debug!("[BackgroundSyncWorker] Run already in progress");
            return None;
        }
        let _guard = RunGuard(&self.running);
        if !self.connectivity.is_online() {
            return None;
        }

        let mut report = SyncReport {
            all_success: true,
            ..Default::default()
        };
        let projects = match self.projects.list() {
            Ok(projects) => projects,
            Err(e) => {
                log::error!("[BackgroundSyncWorker] Could not read offline projects: {}", e);
                report.all_success = false;
                report
                    .errors
                    .insert(OFFLINE_PROJECTS_KEY.to_string(), e.to_string());
                return Some(self.finish(report));
            }
        };

        for project in projects.iter().filter(|p| p.pending_creation) {
            self.create_pending(project, &mut report).await;
        }
        for project in projects
            .iter()
            .filter(|p| p.pending_metadata && !p.pending_creation)
        {
            self.push_metadata(project, &mut report).await;
        }
        // Media upload retries run through MediaAutoSync once a project is
        // opened; nothing is queued here.

        Some(self.finish(report))
    }

    fn finish(&self, report: SyncReport) -> SyncReport {
        log::info!(
            "[BackgroundSyncWorker] Done: {} created, {} updated, {} failed",
            report.created.len(),
            report.updated.len(),
            report.errors.len()
        );
        *self.last_report.lock().unwrap() = Some(report.clone());
        report
    }

    fn record_error(report: &mut SyncReport, key: String, error: impl std::fmt::Display) {
        log::warn!("[BackgroundSyncWorker] {}: {}", key, error);
        report.all_success = false;
        report.errors.insert(key, error.to_string());
    }

    async fn create_pending(&self, pending: &OfflineProject, report: &mut SyncReport) {
        let key = format!("{}/{}", pending.project.username, pending.project.slug);
        let created = match self.api.create_project(&NewProject::from(&pending.project)).await {
            Ok(created) => created,
            Err(e) => return Self::record_error(report, key, e),
        };

        // Re-read: the entry may have been edited while the call was in flight
        let result = self.projects.modify(&pending.project, |fresh| {
            fresh.project.id = created.id;
            fresh.project.created_date = created.created_date;
            fresh.project.updated_date = created.updated_date;
            if created.cover_image.is_some() {
                fresh.project.cover_image = created.cover_image;
            }
            fresh.pending_creation = false;
            fresh.pending_metadata = !same_metadata(&fresh.project, &pending.project);
        });
        match result {
            Ok(()) => report.created.push(key),
            Err(e) => Self::record_error(report, key, e),
        }
    }

    async fn push_metadata(&self, pending: &OfflineProject, report: &mut SyncReport) {
        let local = &pending.project;
        let key = format!("{}/{}", local.username, local.slug);
        let server = match self.api.get_project(&local.username, &local.slug).await {
            Ok(server) => server,
            Err(e) => return Self::record_error(report, key, e),
        };

        let update = ProjectUpdate {
            title: (local.title != server.title).then(|| local.title.clone()),
            description: (local.description != server.description)
                .then(|| local.description.clone().unwrap_or_default()),
        };
        let updated_date = if update.is_empty() {
            server.updated_date
        } else {
            match self
                .api
                .update_project(&local.username, &local.slug, &update)
                .await
            {
                Ok(updated) => updated.updated_date,
                Err(e) => return Self::record_error(report, key, e),
            }
        };

        let result = self.projects.modify(local, |fresh| {
            fresh.project.updated_date = updated_date;
            if same_metadata(&fresh.project, local) {
                fresh.pending_metadata = false;
            }
        });
        match result {
            Ok(()) => report.updated.push(key),
            Err(e) => Self::record_error(report, key, e),
        }
    }
}

impl Drop for BackgroundSyncWorker {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}

//! Staged bulk refresh of every project, one at a time.
//!
//! Each project walks `Metadata → Elements → Documents → Media →
//! Worldbuilding` and ends in `Completed` or `Failed`. An upstream failure is
//! recorded against the project and never stops the batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::api::ProjectApi;
use crate::config::{SyncMode, SyncTimings};
use crate::connectivity::Connectivity;
use crate::error::{FolioError, Result};
use crate::observable::{Subject, Subscription};
use crate::project_key::ProjectKey;
use crate::task::CancellationFlag;

const CANCELLED: &str = "Cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStage {
    Queued,
    Metadata,
    Elements,
    Documents,
    Media,
    Worldbuilding,
    Completed,
    Failed,
}

impl SyncStage {
    /// Working stages in the order a project passes through them.
    pub const PIPELINE: [SyncStage; 5] = [
        SyncStage::Metadata,
        SyncStage::Elements,
        SyncStage::Documents,
        SyncStage::Media,
        SyncStage::Worldbuilding,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, SyncStage::Completed | SyncStage::Failed)
    }

    /// Percentage of the pipeline done when entering this stage.
    fn progress(self) -> u8 {
        match self {
            SyncStage::Queued => 0,
            SyncStage::Completed => 100,
            stage => {
                let index = Self::PIPELINE
                    .iter()
                    .position(|s| *s == stage)
                    .unwrap_or_default();
                (index * 100 / Self::PIPELINE.len()) as u8
            }
        }
    }
}

/// Progress of one project in the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSyncStatus {
    pub key: String,
    pub stage: SyncStage,
    pub progress: u8,
    pub error: Option<String>,
    /// Number of media files reported by the server, once known.
    pub media_count: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProjectSyncStatus {
    fn queued(key: &ProjectKey) -> Self {
        Self {
            key: key.to_string(),
            stage: SyncStage::Queued,
            progress: 0,
            error: None,
            media_count: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Aggregate state of the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub is_active: bool,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub current_key: Option<String>,
}

type StatusMap = IndexMap<ProjectKey, Arc<Subject<ProjectSyncStatus>>>;

/// Runs bulk refreshes against the project API.
pub struct SyncQueue {
    api: Arc<dyn ProjectApi>,
    connectivity: Connectivity,
    mode: SyncMode,
    timings: SyncTimings,
    state: Subject<QueueState>,
    statuses: Mutex<StatusMap>,
    cancel: Mutex<Option<CancellationFlag>>,
    generation: AtomicU64,
}

impl SyncQueue {
    pub fn new(
        api: Arc<dyn ProjectApi>,
        connectivity: Connectivity,
        mode: SyncMode,
        timings: SyncTimings,
    ) -> Self {
        Self {
            api,
            connectivity,
            mode,
            timings,
            state: Subject::default(),
            statuses: Mutex::new(IndexMap::new()),
            cancel: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn queue_state(&self) -> Arc<QueueState> {
        self.state.get()
    }

    pub fn subscribe_queue(&self, callback: impl Fn(&Arc<QueueState>) + Send + Sync + 'static) -> Subscription {
        self.state.subscribe(callback)
    }

    pub fn project_status(&self, key: &ProjectKey) -> Option<ProjectSyncStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(key)
            .map(|s| s.get().as_ref().clone())
    }

    /// Watch one project of the current run. `None` if it is not queued.
    pub fn subscribe_project(
        &self,
        key: &ProjectKey,
        callback: impl Fn(&Arc<ProjectSyncStatus>) + Send + Sync + 'static,
    ) -> Option<Subscription> {
        let subject = self.statuses.lock().unwrap().get(key).cloned()?;
        Some(subject.subscribe(callback))
    }

    /// Every project status of the current run, sorted by key.
    pub fn summary(&self) -> Vec<ProjectSyncStatus> {
        let mut summary: Vec<_> = self
            .statuses
            .lock()
            .unwrap()
            .values()
            .map(|s| s.get().as_ref().clone())
            .collect();
        summary.sort_by(|a, b| a.key.cmp(&b.key));
        summary
    }

    /// Stop the running batch. Projects not yet finished end as `Failed`.
    pub fn cancel(&self) {
        if let Some(flag) = self.cancel.lock().unwrap().as_ref() {
            log::info!("[SyncQueue] Cancelling");
            flag.cancel();
        }
    }

    /// Refresh `projects` in order, replacing any previous queue state.
    ///
    /// A key listed more than once is synced once, at its first position, so
    /// `total` counts distinct projects and every one of them ends up in
    /// `completed` or `failed`. Returns the final state, or `None` when the
    /// queue cannot run (local mode or offline).
    pub async fn sync_all_projects(&self, projects: Vec<ProjectKey>) -> Option<QueueState> {
        if self.mode != SyncMode::Server {
            log::debug!("[SyncQueue] Local mode, nothing to sync");
            return None;
        }
        if !self.connectivity.is_online() {
            log::info!("[SyncQueue] Offline, not starting");
            return None;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationFlag::new();
        if let Some(previous) = self.cancel.lock().unwrap().replace(cancel.clone()) {
            previous.cancel();
        }

        let mut projects = projects;
        let mut seen = std::collections::HashSet::new();
        projects.retain(|key| seen.insert(key.clone()));

        let run: Vec<(ProjectKey, Arc<Subject<ProjectSyncStatus>>)> = projects
            .iter()
            .map(|key| (key.clone(), Arc::new(Subject::new(ProjectSyncStatus::queued(key)))))
            .collect();
        *self.statuses.lock().unwrap() = run.iter().cloned().collect();

        let mut state = QueueState {
            is_active: true,
            total: run.len(),
            ..Default::default()
        };
        self.publish(generation, &state);
        log::info!("[SyncQueue] Syncing {} projects", state.total);

        for (index, (key, status)) in run.iter().enumerate() {
            if cancel.is_cancelled() {
                fail(status, CANCELLED);
                state.failed += 1;
                continue;
            }

            state.current_key = Some(key.to_string());
            self.publish(generation, &state);

            match self.sync_project(key, status, &cancel).await {
                Ok(()) => state.completed += 1,
                Err(_) => state.failed += 1,
            }
            self.publish(generation, &state);

            if index + 1 < run.len() {
                tokio::select! {
                    _ = tokio::time::sleep(self.timings.queue_pacing) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        state.is_active = false;
        state.current_key = None;
        self.publish(generation, &state);
        log::info!(
            "[SyncQueue] Done: {} completed, {} failed",
            state.completed,
            state.failed
        );
        Some(state)
    }

    fn publish(&self, generation: u64, state: &QueueState) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.state.next(state.clone());
        }
    }

    async fn sync_project(
        &self,
        key: &ProjectKey,
        status: &Subject<ProjectSyncStatus>,
        cancel: &CancellationFlag,
    ) -> Result<()> {
        update(status, |s| s.started_at = Some(Utc::now()));

        for stage in SyncStage::PIPELINE {
            if cancel.is_cancelled() {
                fail(status, CANCELLED);
                return Err(FolioError::Cancelled);
            }
            update(status, |s| {
                s.stage = stage;
                s.progress = stage.progress();
            });

            let result = tokio::select! {
                result = self.run_stage(key, stage, status) => result,
                _ = cancel.cancelled() => Err(FolioError::Cancelled),
            };
            if let Err(e) = result {
                let message = match &e {
                    FolioError::Cancelled => CANCELLED.to_string(),
                    other => other.to_string(),
                };
                log::warn!("[SyncQueue] {} failed at {:?}: {}", key, stage, message);
                fail(status, &message);
                return Err(e);
            }
        }

        update(status, |s| {
            s.stage = SyncStage::Completed;
            s.progress = SyncStage::Completed.progress();
            s.completed_at = Some(Utc::now());
        });
        log::debug!("[SyncQueue] {} completed", key);
        Ok(())
    }

    async fn run_stage(
        &self,
        key: &ProjectKey,
        stage: SyncStage,
        status: &Subject<ProjectSyncStatus>,
    ) -> Result<()> {
        match stage {
            SyncStage::Metadata => {
                let project = self.api.get_project(&key.owner, &key.slug).await?;
                log::debug!("[SyncQueue] {} metadata: {}", key, project.title);
            }
            SyncStage::Media => {
                let count = match self.api.list_project_media(&key.owner, &key.slug).await {
                    Ok(media) => media.len(),
                    Err(e) => {
                        log::warn!("[SyncQueue] {} media listing failed, assuming none: {}", key, e);
                        0
                    }
                };
                update(status, |s| s.media_count = Some(count));
            }
            // Document content travels over the live replication channel;
            // these stages only require it to still be reachable.
            _ => {
                if !self.connectivity.is_online() {
                    return Err(FolioError::Transport("Connection lost".to_string()));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("mode", &self.mode)
            .field("state", &self.state.get())
            .finish()
    }
}

fn update(status: &Subject<ProjectSyncStatus>, change: impl FnOnce(&mut ProjectSyncStatus)) {
    let mut next = status.get().as_ref().clone();
    change(&mut next);
    status.next(next);
}

fn fail(status: &Subject<ProjectSyncStatus>, message: &str) {
    update(status, |s| {
        s.stage = SyncStage::Failed;
        s.error = Some(message.to_string());
        s.completed_at = Some(Utc::now());
    });
}

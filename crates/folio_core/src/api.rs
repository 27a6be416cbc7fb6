//! Interfaces of the server-side collaborators used by the sync orchestrators.
//!
//! The core never talks HTTP itself. Hosts implement [`ProjectApi`] and
//! [`MediaSyncService`] (the CLI ships a `reqwest` client) and hand them to
//! the coordinator, the background worker, the sync queue and media
//! auto-sync.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::BoxFuture;
use crate::error::Result;
use crate::project_key::ProjectKey;

/// A project as the project API describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ProjectDescriptor {
    /// Server-assigned id; absent for projects created offline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub username: String,
    pub slug: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_date: Option<String>,
}

impl ProjectDescriptor {
    pub fn new(username: impl Into<String>, slug: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: None,
            username: username.into(),
            slug: slug.into(),
            title: title.into(),
            description: None,
            cover_image: None,
            created_date: None,
            updated_date: None,
        }
    }

    pub fn key(&self) -> Result<ProjectKey> {
        ProjectKey::new(self.username.clone(), self.slug.clone())
    }
}

/// Payload of a create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub slug: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&ProjectDescriptor> for NewProject {
    fn from(project: &ProjectDescriptor) -> Self {
        Self {
            slug: project.slug.clone(),
            title: project.title.clone(),
            description: project.description.clone(),
        }
    }
}

/// Fields changed by an update call. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProjectUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none()
    }
}

/// A media file stored with a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct MediaInfo {
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// The project API.
pub trait ProjectApi: Send + Sync {
    /// Projects visible to the current user.
    fn list_projects(&self) -> BoxFuture<'_, Result<Vec<ProjectDescriptor>>>;

    fn get_project<'a>(&'a self, owner: &'a str, slug: &'a str)
    -> BoxFuture<'a, Result<ProjectDescriptor>>;

    fn create_project<'a>(&'a self, project: &'a NewProject) -> BoxFuture<'a, Result<ProjectDescriptor>>;

    fn update_project<'a>(
        &'a self,
        owner: &'a str,
        slug: &'a str,
        update: &'a ProjectUpdate,
    ) -> BoxFuture<'a, Result<ProjectDescriptor>>;

    fn list_project_media<'a>(&'a self, owner: &'a str, slug: &'a str)
    -> BoxFuture<'a, Result<Vec<MediaInfo>>>;
}

/// Outcome of a full media reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSyncReport {
    pub downloaded: usize,
    pub uploaded: usize,
}

/// Whether local and server media libraries differ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSyncStatus {
    pub needs_sync: bool,
    #[serde(default)]
    pub pending_uploads: usize,
    #[serde(default)]
    pub pending_downloads: usize,
}

/// Reconciles the local media library of a project with the server.
pub trait MediaSyncService: Send + Sync {
    fn full_sync<'a>(&'a self, project: &'a ProjectKey) -> BoxFuture<'a, Result<MediaSyncReport>>;

    fn check_sync_status<'a>(&'a self, project: &'a ProjectKey)
    -> BoxFuture<'a, Result<MediaSyncStatus>>;
}

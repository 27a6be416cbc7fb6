//! `reqwest` implementations of the project API and media sync services.
//!
//! Endpoints (all under `<api_url>/api/v1`, bearer-authenticated):
//!
//! - `GET    /projects`
//! - `POST   /projects`
//! - `GET    /projects/{owner}/{slug}`
//! - `PATCH  /projects/{owner}/{slug}`
//! - `GET    /projects/{owner}/{slug}/media`
//! - `GET|PUT /projects/{owner}/{slug}/media/{filename}`

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use folio_core::BoxFuture;
use folio_core::api::{
    MediaInfo, MediaSyncReport, MediaSyncService, MediaSyncStatus, NewProject, ProjectApi,
    ProjectDescriptor, ProjectUpdate,
};
use folio_core::error::{FolioError, Result};
use folio_core::project_key::ProjectKey;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

/// Project API client.
#[derive(Clone)]
pub struct HttpProjectApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpProjectApi {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    fn url(&self, segments: &[&str]) -> String {
        let mut url = format!("{}/api/v1", self.base_url);
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| FolioError::Api(format!("Request failed: {}", e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(FolioError::Api(format!("{} {}", status, body.trim())))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| FolioError::Api(format!("Invalid response: {}", e)))
    }

    async fn download(&self, key: &ProjectKey, filename: &str) -> Result<Vec<u8>> {
        let url = self.url(&["projects", &key.owner, &key.slug, "media", filename]);
        let bytes = self
            .send(self.client.get(url))
            .await?
            .bytes()
            .await
            .map_err(|e| FolioError::Api(format!("Download of {} failed: {}", filename, e)))?;
        Ok(bytes.to_vec())
    }

    async fn upload(&self, key: &ProjectKey, filename: &str, data: Vec<u8>) -> Result<()> {
        let url = self.url(&["projects", &key.owner, &key.slug, "media", filename]);
        self.send(self.client.put(url).body(data)).await?;
        Ok(())
    }
}

impl ProjectApi for HttpProjectApi {
    fn list_projects(&self) -> BoxFuture<'_, Result<Vec<ProjectDescriptor>>> {
        Box::pin(async move { self.json(self.client.get(self.url(&["projects"]))).await })
    }

    fn get_project<'a>(
        &'a self,
        owner: &'a str,
        slug: &'a str,
    ) -> BoxFuture<'a, Result<ProjectDescriptor>> {
        Box::pin(async move {
            self.json(self.client.get(self.url(&["projects", owner, slug])))
                .await
        })
    }

    fn create_project<'a>(
        &'a self,
        project: &'a NewProject,
    ) -> BoxFuture<'a, Result<ProjectDescriptor>> {
        Box::pin(async move {
            self.json(self.client.post(self.url(&["projects"])).json(project))
                .await
        })
    }

    fn update_project<'a>(
        &'a self,
        owner: &'a str,
        slug: &'a str,
        update: &'a ProjectUpdate,
    ) -> BoxFuture<'a, Result<ProjectDescriptor>> {
        Box::pin(async move {
            self.json(
                self.client
                    .patch(self.url(&["projects", owner, slug]))
                    .json(update),
            )
            .await
        })
    }

    fn list_project_media<'a>(
        &'a self,
        owner: &'a str,
        slug: &'a str,
    ) -> BoxFuture<'a, Result<Vec<MediaInfo>>> {
        Box::pin(async move {
            self.json(self.client.get(self.url(&["projects", owner, slug, "media"])))
                .await
        })
    }
}

/// Mirrors a project's media library into `<root>/<owner>/<slug>/`.
#[derive(Clone)]
pub struct DirectoryMediaSync {
    api: HttpProjectApi,
    root: PathBuf,
}

/// Files present on one side only.
#[derive(Debug, Default, PartialEq)]
struct MediaDiff {
    missing_locally: Vec<String>,
    missing_remotely: Vec<String>,
}

impl MediaDiff {
    fn between(remote: &[MediaInfo], local: &[String]) -> Self {
        let remote_names: HashSet<&str> = remote.iter().map(|m| m.filename.as_str()).collect();
        let local_names: HashSet<&str> = local.iter().map(String::as_str).collect();
        Self {
            missing_locally: remote
                .iter()
                .filter(|m| !local_names.contains(m.filename.as_str()))
                .map(|m| m.filename.clone())
                .collect(),
            missing_remotely: local
                .iter()
                .filter(|name| !remote_names.contains(name.as_str()))
                .cloned()
                .collect(),
        }
    }
}

impl DirectoryMediaSync {
    pub fn new(api: HttpProjectApi, root: impl Into<PathBuf>) -> Self {
        Self {
            api,
            root: root.into(),
        }
    }

    fn project_dir(&self, key: &ProjectKey) -> PathBuf {
        self.root.join(&key.owner).join(&key.slug)
    }

    fn local_files(dir: &Path) -> Result<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn diff(&self, key: &ProjectKey) -> Result<MediaDiff> {
        let remote = self.api.list_project_media(&key.owner, &key.slug).await?;
        let local = Self::local_files(&self.project_dir(key))?;
        Ok(MediaDiff::between(&remote, &local))
    }
}

impl MediaSyncService for DirectoryMediaSync {
    fn full_sync<'a>(&'a self, project: &'a ProjectKey) -> BoxFuture<'a, Result<MediaSyncReport>> {
        Box::pin(async move {
            let dir = self.project_dir(project);
            std::fs::create_dir_all(&dir)?;
            let diff = self.diff(project).await?;

            let mut report = MediaSyncReport::default();
            for filename in &diff.missing_locally {
                let data = self.api.download(project, filename).await?;
                std::fs::write(dir.join(filename), data)?;
                report.downloaded += 1;
            }
            for filename in &diff.missing_remotely {
                let data = std::fs::read(dir.join(filename))?;
                self.api.upload(project, filename, data).await?;
                report.uploaded += 1;
            }
            Ok(report)
        })
    }

    fn check_sync_status<'a>(
        &'a self,
        project: &'a ProjectKey,
    ) -> BoxFuture<'a, Result<MediaSyncStatus>> {
        Box::pin(async move {
            let diff = self.diff(project).await?;
            Ok(MediaSyncStatus {
                needs_sync: !diff.missing_locally.is_empty() || !diff.missing_remotely.is_empty(),
                pending_uploads: diff.missing_remotely.len(),
                pending_downloads: diff.missing_locally.len(),
            })
        })
    }
}

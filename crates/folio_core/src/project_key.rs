//! Project keys and document identifiers.
//!
//! A project is addressed by `(owner, slug)`. Two string encodings exist:
//! `owner/slug` (sync queue, media channel) and `owner:slug` (document ids).
//! Document ids add a suffix: `elements` for the main project document or an
//! element id for per-element worldbuilding documents.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FolioError, Result};

/// Suffix of the main project document id.
pub const ELEMENTS_SUFFIX: &str = "elements";

/// Prefix of per-element worldbuilding documents in the durable store.
const WORLDBUILDING_STORE_PREFIX: &str = "worldbuilding";

/// Prefix of the legacy flat-JSON bucket consumed by migration.
const LEGACY_STORE_PREFIX: &str = "legacy";

/// Separator used when a project key is rendered as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySeparator {
    /// `owner/slug`
    Slash,
    /// `owner:slug`
    Colon,
}

impl KeySeparator {
    fn as_char(self) -> char {
        match self {
            KeySeparator::Slash => '/',
            KeySeparator::Colon => ':',
        }
    }
}

/// Identifies a project by owner and slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey {
    pub owner: String,
    pub slug: String,
}

impl ProjectKey {
    /// Create a project key, rejecting empty components.
    pub fn new(owner: impl Into<String>, slug: impl Into<String>) -> Result<Self> {
        let owner = owner.into();
        let slug = slug.into();
        if owner.is_empty() || slug.is_empty() {
            return Err(FolioError::EmptyProjectKey);
        }
        Ok(Self { owner, slug })
    }

    /// Render with the given separator.
    pub fn encode(&self, separator: KeySeparator) -> String {
        format!("{}{}{}", self.owner, separator.as_char(), self.slug)
    }

    /// Parse `owner/slug` or `owner:slug` (with exactly one separator).
    pub fn parse(value: &str, separator: KeySeparator) -> Result<Self> {
        let mut parts = value.splitn(2, separator.as_char());
        let owner = parts.next().unwrap_or_default();
        let slug = parts.next().unwrap_or_default();
        if slug.contains(separator.as_char()) {
            return Err(FolioError::InvalidProjectKey(value.to_string()));
        }
        Self::new(owner, slug).map_err(|_| FolioError::InvalidProjectKey(value.to_string()))
    }

    /// The `owner/slug` form used by the sync queue and media channel.
    pub fn path_key(&self) -> String {
        self.encode(KeySeparator::Slash)
    }

    /// Document id of the main project document.
    pub fn elements_doc_id(&self) -> DocumentId {
        DocumentId {
            project: self.clone(),
            suffix: ELEMENTS_SUFFIX.to_string(),
        }
    }

    /// Document id of a worldbuilding element document.
    pub fn element_doc_id(&self, element_id: &str) -> DocumentId {
        DocumentId {
            project: self.clone(),
            suffix: element_id.to_string(),
        }
    }

    /// Durable store key of a per-element worldbuilding document.
    pub fn worldbuilding_store_key(&self, element_id: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            WORLDBUILDING_STORE_PREFIX, self.owner, self.slug, element_id
        )
    }

    /// Durable store key of the legacy flat-JSON payload.
    pub fn legacy_store_key(&self) -> String {
        format!("{}:{}:{}", LEGACY_STORE_PREFIX, self.owner, self.slug)
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.slug)
    }
}

impl FromStr for ProjectKey {
    type Err = FolioError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, KeySeparator::Slash)
    }
}

/// `<owner>:<slug>:<suffix>`, the unit of replication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    pub project: ProjectKey,
    pub suffix: String,
}

impl DocumentId {
    /// Whether this addresses the main project document.
    pub fn is_elements(&self) -> bool {
        self.suffix == ELEMENTS_SUFFIX
    }

    /// Parse `<owner>:<slug>:<suffix>`.
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.splitn(3, ':').collect();
        let [owner, slug, suffix] = parts.as_slice() else {
            return Err(FolioError::InvalidDocumentId(value.to_string()));
        };
        if suffix.is_empty() || suffix.contains(':') {
            return Err(FolioError::InvalidDocumentId(value.to_string()));
        }
        let project = ProjectKey::new(*owner, *slug)
            .map_err(|_| FolioError::InvalidDocumentId(value.to_string()))?;
        Ok(Self {
            project,
            suffix: suffix.to_string(),
        })
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.project.encode(KeySeparator::Colon),
            self.suffix
        )
    }
}

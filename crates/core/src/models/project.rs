//! Project aggregate and its lifecycle flags
//!
//! ```text
//! fresh ──mark_imported──▶ imported ──mark_analyzed──▶ analyzed
//!                             ▲                           │
//!                             └─────begin_reanalysis──────┘
//!
//! any state ──mark_deleted──▶ deleted
//! ```
//!
//! `imported` means raw interactions were persisted as purchases and
//! `analyzed` means a completed recommendation run exists. Projects are
//! never physically removed.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Role of an uploaded project file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Item metadata (one row per catalog item)
    Catalog,
    /// Raw user/item interaction log
    Interactions,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Catalog => "catalog",
            FileKind::Interactions => "interactions",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "catalog" => Some(FileKind::Catalog),
            "interactions" => Some(FileKind::Interactions),
            _ => None,
        }
    }
}

/// A file owned by a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    /// Original file name as uploaded
    pub name: String,
    /// Storage path relative to the upload root
    pub location: String,
    pub kind: FileKind,
}

/// Derived lifecycle state, for logging and inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Fresh,
    Imported,
    Analyzed,
    Deleted,
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProjectState::Fresh => "fresh",
            ProjectState::Imported => "imported",
            ProjectState::Analyzed => "analyzed",
            ProjectState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Flag update applied by the persistence coordinator after a batch write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectTransition {
    Imported,
    Analyzed,
}

impl ProjectTransition {
    pub fn apply(self, project: &mut Project) -> Result<(), CoreError> {
        match self {
            ProjectTransition::Imported => {
                project.mark_imported();
                Ok(())
            }
            ProjectTransition::Analyzed => project.mark_analyzed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub imported: bool,
    pub analyzed: bool,
    pub deleted: bool,
    pub files: Vec<FileLocation>,
    pub allowed_users: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            imported: false,
            analyzed: false,
            deleted: false,
            files: Vec::new(),
            allowed_users: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_file(mut self, file: FileLocation) -> Self {
        self.files.push(file);
        self
    }

    /// First file of the given kind
    pub fn file(&self, kind: FileKind) -> Option<&FileLocation> {
        self.files.iter().find(|f| f.kind == kind)
    }

    pub fn state(&self) -> ProjectState {
        if self.deleted {
            ProjectState::Deleted
        } else if self.analyzed {
            ProjectState::Analyzed
        } else if self.imported {
            ProjectState::Imported
        } else {
            ProjectState::Fresh
        }
    }

    pub fn mark_imported(&mut self) {
        self.imported = true;
        self.touch();
    }

    /// Clear `analyzed` so a new analysis run can start
    pub fn begin_reanalysis(&mut self) -> Result<(), CoreError> {
        if self.deleted {
            return Err(CoreError::InvalidTransition(format!(
                "project {} is deleted",
                self.id
            )));
        }
        if !self.imported {
            return Err(CoreError::InvalidTransition(format!(
                "project {} has not been imported",
                self.id
            )));
        }

        self.analyzed = false;
        self.touch();
        Ok(())
    }

    pub fn mark_analyzed(&mut self) -> Result<(), CoreError> {
        if !self.imported {
            return Err(CoreError::InvalidTransition(format!(
                "project {} cannot be analyzed before import",
                self.id
            )));
        }

        self.analyzed = true;
        self.touch();
        Ok(())
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.touch();
    }

    pub fn set_allowed_users(&mut self, users: impl IntoIterator<Item = Uuid>) {
        self.allowed_users = users.into_iter().collect();
        self.touch();
    }

    /// Staff see every project; other users only live projects they were
    /// granted access to.
    pub fn is_visible_to(&self, user_id: Uuid, is_staff: bool) -> bool {
        is_staff || (!self.deleted && self.allowed_users.contains(&user_id))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

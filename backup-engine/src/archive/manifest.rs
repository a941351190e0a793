//! Manifest embedded as the last entry of every archive.
//!
//! The manifest is the source of truth when an archive is listed or restored;
//! file names are only a convenience.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::schedule::{ComponentKind, DestinationId};

/// Tar entry name of the embedded manifest.
pub const MANIFEST_NAME: &str = "manifest.json";

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveType {
    Full,
    Incremental,
}

/// File count and payload bytes of one component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentEntry {
    pub files: u64,
    pub bytes: u64,
}

impl ComponentEntry {
    pub fn add(&mut self, files: u64, bytes: u64) {
        self.files += files;
        self.bytes += bytes;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub contains: BTreeSet<ComponentKind>,
    #[serde(rename = "type")]
    pub archive_type: ArchiveType,
    /// Uncompressed payload size, excluding the manifest itself.
    pub size_bytes: u64,
    pub destinations: Vec<DestinationId>,
    pub schedule_id: Option<String>,
    pub task_id: String,
    /// Archive an incremental builds on.
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<ComponentKind, ComponentEntry>,
}

impl Manifest {
    pub fn total_files(&self) -> u64 {
        self.entries.values().map(|e| e.files).sum()
    }

    pub fn is_incremental(&self) -> bool {
        self.archive_type == ArchiveType::Incremental
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

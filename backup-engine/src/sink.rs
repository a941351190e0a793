//! Destination sinks: where finished archives are shipped.
//!
//! A sink receives the path of a finished, possibly encrypted archive and
//! either accepts it or fails. The engine never retries a sink; that policy
//! belongs to the sink itself.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("destination '{0}' is not configured")]
    UnknownDestination(String),

    #[error("destination '{destination}' rejected the archive: {reason}")]
    Rejected { destination: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub trait DestinationSink: Send + Sync {
    fn id(&self) -> &str;

    fn deliver(&self, archive: &Path) -> Result<(), SinkError>;
}

/// Copies archives into a directory, publishing each with a rename.
#[derive(Debug, Clone)]
pub struct LocalDirectorySink {
    id: String,
    dir: PathBuf,
}

impl LocalDirectorySink {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            dir: dir.into(),
        }
    }
}

impl DestinationSink for LocalDirectorySink {
    fn id(&self) -> &str {
        &self.id
    }

    fn deliver(&self, archive: &Path) -> Result<(), SinkError> {
        let name = archive.file_name().ok_or_else(|| SinkError::Rejected {
            destination: self.id.clone(),
            reason: format!("{} has no file name", archive.display()),
        })?;
        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(name);
        let mut part = target.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);

        if let Err(e) = fs::copy(archive, &part) {
            let _ = fs::remove_file(&part);
            return Err(e.into());
        }
        fs::rename(&part, &target)?;
        tracing::info!(destination = %self.id, path = %target.display(), "Archive delivered");
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct SinkRegistry {
    sinks: BTreeMap<String, Arc<dyn DestinationSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink under its own id, replacing any previous one.
    pub fn register(&mut self, sink: Arc<dyn DestinationSink>) {
        self.sinks.insert(sink.id().to_string(), sink);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn DestinationSink>, SinkError> {
        self.sinks
            .get(id)
            .cloned()
            .ok_or_else(|| SinkError::UnknownDestination(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sinks.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sinks.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.sinks.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_sink_delivers() -> Result<(), SinkError> {
        let dir = TempDir::new()?;
        let archive = dir.path().join("backup.tar.zst");
        fs::write(&archive, b"archive")?;

        let sink = LocalDirectorySink::new("offsite", dir.path().join("offsite"));
        sink.deliver(&archive)?;
        assert_eq!(fs::read(dir.path().join("offsite/backup.tar.zst"))?, b"archive");
        assert!(!dir.path().join("offsite/backup.tar.zst.part").exists());
        Ok(())
    }

    #[test]
    fn test_missing_archive_fails() {
        let dir = TempDir::new().unwrap();
        let sink = LocalDirectorySink::new("offsite", dir.path().join("offsite"));
        assert!(matches!(sink.deliver(&dir.path().join("nope.tar.zst")), Err(SinkError::Io(_))));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = SinkRegistry::new();
        registry.register(Arc::new(LocalDirectorySink::new("a", "/tmp/a")));
        assert!(registry.contains("a"));
        assert!(registry.get("a").is_ok());
        assert!(matches!(registry.get("b"), Err(SinkError::UnknownDestination(_))));
        assert_eq!(registry.ids().collect::<Vec<_>>(), ["a"]);
    }
}

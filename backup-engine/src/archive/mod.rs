//! Archive assembly.
//!
//! A backup is staged as an uncompressed tar at `<work_dir>/<task_id>.tar`,
//! one step at a time. Every step first truncates the staging file back to
//! the offset recorded in the task checkpoint, so an interrupted step leaves
//! nothing behind. Finalizing appends `manifest.json`, compresses to
//! `<archive_dir>/<name>.part` and renames it into place only once the whole
//! write succeeded.

pub mod manifest;
pub mod reader;
pub mod walker;

pub use manifest::{ArchiveType, ComponentEntry, Manifest, MANIFEST_NAME};
pub use reader::{extract_component, list_archives, read_manifest, verify_archive, ArchiveListing};
pub use walker::{walk_directory, FileInfo, WalkOptions};

use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::content::{ContentError, ContentSource};
use crate::envelope::EnvelopeError;
use crate::schedule::ComponentKind;
use crate::utils::pulse::{Pulse, PulseWriter};

pub const ARCHIVE_EXTENSION: &str = "tar.zst";
pub const ENCRYPTED_EXTENSION: &str = "crypt";
pub const DATABASE_ENTRY: &str = "database/database.sql";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid pattern {0}")]
    Pattern(String),

    #[error("database dump failed: {0}")]
    Content(#[from] ContentError),

    #[error("archive {0} has no manifest")]
    ManifestMissing(PathBuf),

    #[error("manifest is not valid: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("refusing to extract unsafe path '{0}'")]
    UnsafePath(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Result of one staging step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedAppend {
    /// Length of the staging tar after the appended entries, without the
    /// end-of-archive blocks.
    pub staged_bytes: u64,
    pub files: u64,
    pub bytes: u64,
}

/// `backup_<YYYY-MM-DD-HHMM>_<label>_<id prefix>.tar.zst`
pub fn archive_file_name(created_at: DateTime<Utc>, label: &str, task_id: &str) -> String {
    let mut slug: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "backup" } else { slug };
    let slug: String = slug.chars().take(40).collect();
    let short_id: String = task_id.chars().filter(|c| *c != '-').take(8).collect();
    format!(
        "backup_{}_{}_{}.{ARCHIVE_EXTENSION}",
        created_at.format("%Y-%m-%d-%H%M"),
        slug,
        short_id
    )
}

pub fn encrypted_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(".");
    name.push(ENCRYPTED_EXTENSION);
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    work_dir: PathBuf,
    archive_dir: PathBuf,
    compression_level: i32,
}

impl ArchiveBuilder {
    pub fn new(work_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            archive_dir: archive_dir.into(),
            compression_level: 3,
        }
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn staging_path(&self, task_id: &str) -> PathBuf {
        self.work_dir.join(format!("{task_id}.tar"))
    }

    /// Scratch directory for a task, e.g. for restore extraction.
    pub fn scratch_dir(&self, task_id: &str) -> PathBuf {
        self.work_dir.join(task_id)
    }

    /// Open the staging tar positioned at the committed offset.
    fn open_staging(&self, task_id: &str, staged_bytes: u64) -> Result<File, ArchiveError> {
        fs::create_dir_all(&self.work_dir)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.staging_path(task_id))?;
        let current = file.metadata()?.len();
        if current < staged_bytes {
            return Err(ArchiveError::Verification(format!(
                "staging file is {current} bytes, checkpoint expects {staged_bytes}"
            )));
        }
        file.set_len(staged_bytes)?;
        file.seek(SeekFrom::Start(staged_bytes))?;
        Ok(file)
    }

    /// Run `append` against a tar builder over the staging file and report
    /// the new committed offset.
    fn stage<F>(&self, task_id: &str, staged_bytes: u64, append: F) -> Result<StagedAppend, ArchiveError>
    where
        F: FnOnce(&mut tar::Builder<File>) -> Result<(u64, u64), ArchiveError>,
    {
        let file = self.open_staging(task_id, staged_bytes)?;
        let mut builder = tar::Builder::new(file);
        let (files, bytes) = append(&mut builder)?;
        let staged_bytes = builder.get_mut().stream_position()?;
        builder.get_mut().sync_data()?;
        // Dropping the builder writes the end-of-archive blocks past
        // `staged_bytes`; the next step truncates them away.
        drop(builder);
        Ok(StagedAppend {
            staged_bytes,
            files,
            bytes,
        })
    }

    pub fn append_database(
        &self,
        task_id: &str,
        staged_bytes: u64,
        content: &dyn ContentSource,
        pulse: &mut Pulse<'_>,
    ) -> Result<StagedAppend, ArchiveError> {
        fs::create_dir_all(&self.work_dir)?;
        let dump_path = self.work_dir.join(format!("{task_id}.database.sql"));
        let dumped = {
            let mut dump = PulseWriter::new(io::BufWriter::new(File::create(&dump_path)?), &mut *pulse);
            let written = content.dump_database(&mut dump);
            dump.flush()?;
            written
        };
        let result = dumped.map_err(ArchiveError::from).and_then(|size| {
            self.stage(task_id, staged_bytes, |builder| {
                builder.append_path_with_name(&dump_path, DATABASE_ENTRY)?;
                Ok((1, size))
            })
        });
        let _ = fs::remove_file(&dump_path);
        result
    }

    pub fn append_files(
        &self,
        task_id: &str,
        staged_bytes: u64,
        kind: ComponentKind,
        files: &[FileInfo],
        pulse: &mut Pulse<'_>,
    ) -> Result<StagedAppend, ArchiveError> {
        self.stage(task_id, staged_bytes, |builder| {
            let (mut count, mut bytes) = (0, 0);
            for file in files {
                pulse()?;
                let name = format!("{}/{}", kind.as_str(), file.relative_path);
                match builder.append_path_with_name(&file.path, &name) {
                    Ok(()) => {
                        count += 1;
                        bytes += file.size;
                    }
                    // Files can vanish between listing and archiving.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::warn!(path = %file.path.display(), "File disappeared, skipping");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok((count, bytes))
        })
    }

    /// Embed the manifest, compress and publish the archive. Returns the
    /// final path; the staging file is removed.
    pub fn finalize(
        &self,
        task_id: &str,
        staged_bytes: u64,
        manifest: &Manifest,
        pulse: &mut Pulse<'_>,
    ) -> Result<PathBuf, ArchiveError> {
        let json = manifest.to_json()?;
        let file = self.open_staging(task_id, staged_bytes)?;
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(manifest.created_at.timestamp().max(0) as u64);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, MANIFEST_NAME, json.as_slice())?;
        let mut staged = builder.into_inner()?;
        staged.flush()?;

        fs::create_dir_all(&self.archive_dir)?;
        let target = self.archive_dir.join(&manifest.filename);
        let part = self.archive_dir.join(format!("{}.part", manifest.filename));

        let compressed = (|| -> Result<(), ArchiveError> {
            staged.seek(SeekFrom::Start(0))?;
            let out = File::create(&part)?;
            let mut encoder = zstd::stream::Encoder::new(out, self.compression_level)?;
            io::copy(&mut staged, &mut PulseWriter::new(&mut encoder, &mut *pulse))?;
            encoder.finish()?.sync_all()?;
            Ok(())
        })();

        if let Err(e) = compressed {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
        fs::rename(&part, &target)?;
        drop(staged);
        let _ = fs::remove_file(self.staging_path(task_id));

        tracing::info!(task_id, archive = %target.display(), "Archive finalized");
        Ok(target)
    }

    /// Remove every temporary file a task may have left.
    pub fn discard(&self, task_id: &str) {
        let _ = fs::remove_file(self.staging_path(task_id));
        let _ = fs::remove_file(self.work_dir.join(format!("{task_id}.database.sql")));
        let _ = fs::remove_dir_all(self.scratch_dir(task_id));
    }

    /// Withdraw an archive published by a backup that did not complete:
    /// the plain archive, its encrypted form and any half-written `.part`.
    /// Returns how many files were removed.
    pub fn unpublish(&self, filename: &str) -> usize {
        let target = self.archive_dir.join(filename);
        let sealed = encrypted_path(&target);
        let candidates = [
            self.archive_dir.join(format!("{filename}.part")),
            self.archive_dir.join(format!("{filename}.{ENCRYPTED_EXTENSION}.part")),
            sealed,
            target,
        ];
        let mut removed = 0;
        for path in candidates {
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(archive = %path.display(), "Withdrew unfinished archive");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(archive = %path.display(), error = %e, "Failed to withdraw archive"),
            }
        }
        removed
    }
}

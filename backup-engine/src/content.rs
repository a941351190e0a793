//! Access to the managed content store: the database dump and the component
//! directories under the content root.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use thiserror::Error;

use crate::schedule::ComponentKind;

/// File looked for under the content root when no dump command is set.
pub const DATABASE_FILE_NAME: &str = "database.sql";

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("Failed to run command `{command}`: {source}")]
    RunCommand {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Command `{command}` failed: {stderr}")]
    CommandErrored { command: String, stderr: String },

    #[error("No database dump command configured and no database.sql under the content root")]
    NoDatabaseSource,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What the archive builder reads from and restores into.
pub trait ContentSource: Send + Sync {
    /// Write a full database dump to `out`, returning the number of bytes.
    fn dump_database(&self, out: &mut dyn Write) -> Result<u64, ContentError>;

    /// Load a dump previously produced by [`ContentSource::dump_database`].
    fn restore_database(&self, dump: &Path) -> Result<(), ContentError>;

    /// Directory holding a file component. `None` for the database.
    fn component_root(&self, kind: ComponentKind) -> Option<PathBuf>;
}

/// Content laid out as `<root>/{plugins,themes,uploads,others}` with the
/// database reached through shell commands.
#[derive(Debug, Clone)]
pub struct DirectoryContentSource {
    root: PathBuf,
    dump_command: Option<String>,
    restore_command: Option<String>,
}

impl DirectoryContentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dump_command: None,
            restore_command: None,
        }
    }

    pub fn with_dump_command(mut self, command: Option<String>) -> Self {
        self.dump_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_restore_command(mut self, command: Option<String>) -> Self {
        self.restore_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shell(command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

impl ContentSource for DirectoryContentSource {
    fn dump_database(&self, out: &mut dyn Write) -> Result<u64, ContentError> {
        let Some(command) = &self.dump_command else {
            let fallback = self.root.join(DATABASE_FILE_NAME);
            if !fallback.is_file() {
                return Err(ContentError::NoDatabaseSource);
            }
            let mut file = File::open(fallback)?;
            return Ok(io::copy(&mut file, out)?);
        };

        let mut child = Self::shell(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ContentError::RunCommand {
                command: command.clone(),
                source,
            })?;

        // Drain stderr on the side so a chatty command cannot block on a
        // full pipe while stdout is being streamed.
        let stderr = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text);
            }
            text
        });

        let copied = match child.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, out),
            None => Ok(0),
        };
        if copied.is_err() {
            let _ = child.kill();
        }
        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        let written = copied?;

        if !status.success() {
            return Err(ContentError::CommandErrored {
                command: command.clone(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(written)
    }

    fn restore_database(&self, dump: &Path) -> Result<(), ContentError> {
        let Some(command) = &self.restore_command else {
            fs::create_dir_all(&self.root)?;
            fs::copy(dump, self.root.join(DATABASE_FILE_NAME))?;
            return Ok(());
        };

        let output = Self::shell(command)
            .stdin(Stdio::from(File::open(dump)?))
            .output()
            .map_err(|source| ContentError::RunCommand {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ContentError::CommandErrored {
                command: command.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn component_root(&self, kind: ComponentKind) -> Option<PathBuf> {
        kind.dir_name().map(|dir| self.root.join(dir))
    }
}

//! Component directory traversal.
//!
//! Produces a sorted, deterministic file list so a chunked backup step can
//! resume from a numeric cursor on the next invocation.

use chrono::{DateTime, Utc};
use glob::Pattern;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use super::ArchiveError;

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Only files matching one of these are kept (empty = everything)
    pub include: Vec<Pattern>,

    /// Files and whole directories matching one of these are skipped
    pub exclude: Vec<Pattern>,

    /// Incremental cut-off: only files modified strictly after this instant
    pub modified_after: Option<DateTime<Utc>>,
}

impl WalkOptions {
    pub fn from_patterns(include: &[String], exclude: &[String]) -> Result<Self, ArchiveError> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| Pattern::new(p).map_err(|e| ArchiveError::Pattern(format!("{p}: {e}"))))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            follow_links: false,
            include: compile(include)?,
            exclude: compile(exclude)?,
            modified_after: None,
        })
    }

    pub fn modified_after(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.modified_after = since;
        self
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub path: PathBuf,

    /// Relative path from the component root, `/`-separated
    pub relative_path: String,

    pub size: u64,

    pub modified: Option<DateTime<Utc>>,
}

impl FileInfo {
    /// For symlinks the target's metadata is used; links to directories and
    /// broken links are skipped.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved,
                _ => return Ok(None),
            }
        } else {
            entry.metadata()?
        };

        Ok(Some(Self {
            relative_path: relative_name(&path, root),
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            path,
        }))
    }
}

fn relative_name(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn matches_any(patterns: &[Pattern], relative: &str, file_name: &str) -> bool {
    patterns
        .iter()
        .any(|p| p.matches(relative) || p.matches(file_name))
}

/// Walk a component root and collect its files, sorted by relative path.
/// A missing root yields an empty list.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || {
                let relative = relative_name(entry.path(), root);
                !matches_any(&options.exclude, &relative, &entry.file_name().to_string_lossy())
            }
        });

    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }

        let Some(file) = FileInfo::from_entry(&entry, root)? else {
            continue;
        };
        let file_name = entry.file_name().to_string_lossy();
        if !options.include.is_empty()
            && !matches_any(&options.include, &file.relative_path, &file_name)
        {
            continue;
        }
        if let (Some(since), Some(modified)) = (options.modified_after, file.modified) {
            if modified <= since {
                continue;
            }
        }
        files.push(file);
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_missing_root() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(&temp_dir.path().join("nope"), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_sorted_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("b"))?;
        fs::write(temp_dir.path().join("b/file2.txt"), b"content2")?;
        fs::write(temp_dir.path().join("a.txt"), b"content1")?;
        fs::write(temp_dir.path().join("c.txt"), b"c")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        let names: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, ["a.txt", "b/file2.txt", "c.txt"]);
        assert_eq!(files[1].size, 8);
        Ok(())
    }

    #[test]
    fn test_include_and_exclude_patterns() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("cache/deep"))?;
        fs::write(temp_dir.path().join("cache/deep/x.jpg"), b"x")?;
        fs::write(temp_dir.path().join("photo.jpg"), b"keep")?;
        fs::write(temp_dir.path().join("notes.txt"), b"skip")?;
        fs::write(temp_dir.path().join("debug.log"), b"skip")?;

        let options = WalkOptions::from_patterns(
            &["*.jpg".to_string()],
            &["cache".to_string(), "*.log".to_string()],
        )
        .unwrap();
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "photo.jpg");
        Ok(())
    }

    #[test]
    fn test_modified_after_filters_old_files() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("old.txt"), b"old")?;

        let future = Utc::now() + chrono::Duration::hours(1);
        let options = WalkOptions::default().modified_after(Some(future));
        assert!(walk_directory(temp_dir.path(), &options)?.is_empty());

        let past = Utc::now() - chrono::Duration::hours(1);
        let options = WalkOptions::default().modified_after(Some(past));
        assert_eq!(walk_directory(temp_dir.path(), &options)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_bad_pattern_rejected() {
        assert!(matches!(
            WalkOptions::from_patterns(&["[".to_string()], &[]),
            Err(ArchiveError::Pattern(_))
        ));
    }
}

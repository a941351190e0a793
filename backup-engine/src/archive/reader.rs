//! Reading finished archives back: manifest lookup, verification, component
//! extraction and directory listing.

use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use super::manifest::{ComponentEntry, Manifest, MANIFEST_NAME};
use super::{ArchiveError, ARCHIVE_EXTENSION, ENCRYPTED_EXTENSION};
use crate::envelope::{self, KeySource};
use crate::schedule::ComponentKind;

type TarReader = tar::Archive<zstd::stream::Decoder<'static, BufReader<File>>>;

fn open_tar(path: &Path) -> Result<TarReader, ArchiveError> {
    let decoder = zstd::stream::Decoder::new(File::open(path)?)?;
    Ok(tar::Archive::new(decoder))
}

/// Read the embedded manifest of a plain (unencrypted) archive.
pub fn read_manifest(path: &Path) -> Result<Manifest, ArchiveError> {
    let mut archive = open_tar(path)?;
    let mut found = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_os_str() == MANIFEST_NAME {
            let mut json = Vec::new();
            entry.read_to_end(&mut json)?;
            found = Some(json);
        }
    }
    let json = found.ok_or_else(|| ArchiveError::ManifestMissing(path.to_path_buf()))?;
    Ok(Manifest::from_json(&json)?)
}

/// Decompress and read every entry. Returns the entry count.
pub fn verify_archive(path: &Path) -> Result<u64, ArchiveError> {
    let mut archive = open_tar(path)?;
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let expected = entry.header().size()?;
        let read = io::copy(&mut entry, &mut io::sink())?;
        if read != expected {
            return Err(ArchiveError::Verification(format!(
                "entry {} is short: {read} of {expected} bytes",
                entry.path()?.display()
            )));
        }
        count += 1;
    }
    if count == 0 {
        return Err(ArchiveError::Verification("archive has no entries".into()));
    }
    Ok(count)
}

fn safe_relative(name: &str) -> Result<&Path, ArchiveError> {
    let path = Path::new(name);
    let safe = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path)
    } else {
        Err(ArchiveError::UnsafePath(name.to_string()))
    }
}

/// Unpack the entries of one component under `dest`, stripping the
/// component prefix. Existing files are overwritten.
pub fn extract_component(
    archive_path: &Path,
    kind: ComponentKind,
    dest: &Path,
) -> Result<ComponentEntry, ArchiveError> {
    let prefix = format!("{}/", kind.as_str());
    let mut archive = open_tar(archive_path)?;
    let mut extracted = ComponentEntry::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let target = dest.join(safe_relative(rest)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let size = entry.header().size()?;
        entry.unpack(&target)?;
        extracted.add(1, size);
    }

    tracing::debug!(component = %kind, files = extracted.files, dest = %dest.display(), "Component extracted");
    Ok(extracted)
}

/// One archive found by [`list_archives`].
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveListing {
    pub path: PathBuf,
    pub encrypted: bool,
    pub file_size: u64,
    pub manifest: Option<Manifest>,
    /// Why the manifest could not be read.
    pub error: Option<String>,
}

fn is_archive_name(name: &str) -> bool {
    name.ends_with(&format!(".{ARCHIVE_EXTENSION}"))
        || name.ends_with(&format!(".{ARCHIVE_EXTENSION}.{ENCRYPTED_EXTENSION}"))
}

/// List the archives in `dir`, reading each embedded manifest. Encrypted
/// archives are opened with `key` when one is supplied.
pub fn list_archives(dir: &Path, key: Option<&KeySource>) -> Result<Vec<ArchiveListing>, ArchiveError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && is_archive_name(n))
        })
        .collect();
    paths.sort();

    let mut listings = Vec::with_capacity(paths.len());
    for path in paths {
        let file_size = fs::metadata(&path)?.len();
        let encrypted = envelope::is_envelope(&path)?;
        let manifest = if encrypted {
            match key {
                Some(key) => manifest_of_envelope(&path, key),
                None => Err(ArchiveError::Verification(
                    "archive is encrypted and no key was supplied".into(),
                )),
            }
        } else {
            read_manifest(&path)
        };

        let (manifest, error) = match manifest {
            Ok(manifest) => (Some(manifest), None),
            Err(e) => (None, Some(e.to_string())),
        };
        listings.push(ArchiveListing {
            path,
            encrypted,
            file_size,
            manifest,
            error,
        });
    }
    Ok(listings)
}

fn manifest_of_envelope(path: &Path, key: &KeySource) -> Result<Manifest, ArchiveError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let scratch = path.with_file_name(format!(".{name}.listing"));
    let result = envelope::decrypt_file(path, &scratch, key)
        .map_err(ArchiveError::from)
        .and_then(|_| read_manifest(&scratch));
    remove_scratch(&scratch);
    result
}

fn remove_scratch(scratch: &Path) {
    match fs::remove_file(scratch) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %scratch.display(), error = %e, "Failed to remove decrypted listing copy"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{
        archive_file_name, encrypted_path, walk_directory, ArchiveBuilder, ArchiveType, WalkOptions,
    };
    use crate::utils::pulse::quiet;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    fn build(dir: &Path, task_id: &str) -> PathBuf {
        let uploads = dir.join("site/uploads/2024");
        fs::create_dir_all(&uploads).unwrap();
        fs::write(uploads.join("photo.jpg"), b"jpeg-bytes").unwrap();

        let builder = ArchiveBuilder::new(dir.join("work"), dir.join("archives"));
        let files = walk_directory(&dir.join("site/uploads"), &WalkOptions::default()).unwrap();
        let staged = builder
            .append_files(task_id, 0, ComponentKind::Uploads, &files, &mut quiet())
            .unwrap();
        let manifest = Manifest {
            format_version: 1,
            filename: archive_file_name(Utc::now(), "site", task_id),
            created_at: Utc::now(),
            contains: BTreeSet::from([ComponentKind::Uploads]),
            archive_type: ArchiveType::Full,
            size_bytes: staged.bytes,
            destinations: Vec::new(),
            schedule_id: None,
            task_id: task_id.into(),
            base: None,
            entries: BTreeMap::from([(ComponentKind::Uploads, ComponentEntry { files: 1, bytes: 10 })]),
        };
        builder.finalize(task_id, staged.staged_bytes, &manifest, &mut quiet()).unwrap()
    }

    #[test]
    fn test_extract_component() -> Result<(), ArchiveError> {
        let dir = TempDir::new()?;
        let archive = build(dir.path(), "t1");
        let dest = dir.path().join("restored/uploads");
        let extracted = extract_component(&archive, ComponentKind::Uploads, &dest)?;
        assert_eq!(extracted, ComponentEntry { files: 1, bytes: 10 });
        assert_eq!(fs::read(dest.join("2024/photo.jpg"))?, b"jpeg-bytes");

        let none = extract_component(&archive, ComponentKind::Themes, &dir.path().join("t"))?;
        assert_eq!(none.files, 0);
        Ok(())
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        assert!(safe_relative("a/b.txt").is_ok());
        assert!(matches!(safe_relative("../etc/passwd"), Err(ArchiveError::UnsafePath(_))));
        assert!(safe_relative("/abs").is_err());
        assert!(safe_relative("").is_err());
    }

    #[test]
    fn test_list_plain_and_encrypted() -> Result<(), ArchiveError> {
        let dir = TempDir::new()?;
        let plain = build(dir.path(), "t1");
        let second = build(dir.path(), "t2");
        let key = KeySource::InstallationKey([9u8; 32]);
        let sealed = encrypted_path(&second);
        envelope::encrypt_file(&second, &sealed, &key)?;
        fs::remove_file(&second)?;
        fs::write(dir.path().join("archives/notes.txt"), b"ignored")?;

        let listed = list_archives(&dir.path().join("archives"), Some(&key))?;
        assert_eq!(listed.len(), 2);
        let by_path: BTreeMap<_, _> = listed.iter().map(|l| (l.path.clone(), l)).collect();
        assert!(!by_path[&plain].encrypted);
        assert_eq!(by_path[&plain].manifest.as_ref().map(|m| m.task_id.as_str()), Some("t1"));
        assert!(by_path[&sealed].encrypted);
        assert_eq!(by_path[&sealed].manifest.as_ref().map(|m| m.task_id.as_str()), Some("t2"));

        let without_key = list_archives(&dir.path().join("archives"), None)?;
        let sealed_listing = without_key.iter().find(|l| l.encrypted).unwrap();
        assert!(sealed_listing.manifest.is_none());
        assert!(sealed_listing.error.is_some());
        Ok(())
    }

    #[test]
    fn test_listing_leaves_no_decrypted_copy() -> Result<(), ArchiveError> {
        let dir = TempDir::new()?;
        let plain = build(dir.path(), "t3");
        let key = KeySource::InstallationKey([9u8; 32]);
        let sealed = encrypted_path(&plain);
        envelope::encrypt_file(&plain, &sealed, &key)?;
        fs::remove_file(&plain)?;

        let archives = dir.path().join("archives");
        list_archives(&archives, Some(&key))?;
        list_archives(&archives, Some(&KeySource::InstallationKey([1u8; 32])))?;

        let leftovers: Vec<_> = fs::read_dir(&archives)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".listing"))
            .collect();
        assert!(leftovers.is_empty());

        // A scratch path that cannot be removed is reported, not fatal.
        let stuck = archives.join(".stuck.listing");
        fs::create_dir(&stuck)?;
        remove_scratch(&stuck);
        remove_scratch(&archives.join(".missing.listing"));
        assert!(stuck.is_dir());
        Ok(())
    }

    #[test]
    fn test_verify_rejects_garbage() -> Result<(), ArchiveError> {
        let dir = TempDir::new()?;
        let bogus = dir.path().join("x.tar.zst");
        fs::write(&bogus, b"not zstd at all")?;
        assert!(verify_archive(&bogus).is_err());
        assert!(read_manifest(&bogus).is_err());
        Ok(())
    }
}

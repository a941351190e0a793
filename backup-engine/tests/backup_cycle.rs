//! Schedule → tick → advance → encrypt → deliver → restore, end to end.

use backup_engine::archive::{list_archives, ArchiveType};
use backup_engine::clock::ManualClock;
use backup_engine::config::{DestinationConfig, EngineConfig};
use backup_engine::content::DirectoryContentSource;
use backup_engine::keys;
use backup_engine::recurrence::RecurrenceSpec;
use backup_engine::schedule::{ComponentKind, NewSchedule, PostCheckKind};
use backup_engine::store::{MemoryStore, SettingsRepository, TaskStore};
use backup_engine::task::{RestoreRequest, StatusKind, TaskOrchestrator, TaskState, TaskStatus};
use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Site {
    dir: TempDir,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    orchestrator: TaskOrchestrator<MemoryStore>,
}

impl Site {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("site");
        write(&root.join("plugins/seo/seo.php"), "<?php // seo");
        write(&root.join("themes/classic/style.css"), "body { margin: 0 }");
        for i in 0..7 {
            write(&root.join(format!("uploads/2024/05/img-{i}.jpg")), &format!("image {i}"));
        }
        write(&root.join("uploads/cache/tmp.bin"), "scratch");
        write(&root.join("database.sql"), "INSERT INTO posts VALUES (1, 'hello');");

        let config = EngineConfig {
            work_dir: dir.path().join("work"),
            archive_dir: dir.path().join("archives"),
            content_root: root.clone(),
            files_per_step: 3,
            destinations: vec![DestinationConfig {
                id: "offsite".into(),
                path: dir.path().join("offsite"),
            }],
            ..EngineConfig::default()
        };
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = TaskOrchestrator::new(
            store.clone(),
            Arc::new(DirectoryContentSource::new(&root)),
            &config,
        )
        .with_clock(clock.clone());

        Self {
            dir,
            clock,
            store,
            orchestrator,
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("site")
    }

    fn finish(&self, task_id: &str) -> TaskStatus {
        for _ in 0..100 {
            let status = self.orchestrator.advance(task_id).unwrap();
            if status.status != StatusKind::Running {
                return status;
            }
        }
        panic!("task {task_id} did not finish");
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn daily_schedule() -> NewSchedule {
    let mut input = NewSchedule::new(
        "site-admin",
        "Nightly full",
        RecurrenceSpec::Cron {
            expression: "0 2 * * *".parse().unwrap(),
        },
    );
    input.encrypt = true;
    input.exclude_patterns = vec!["cache".into()];
    input.post_checks = BTreeSet::from([PostCheckKind::VerifyArchive, PostCheckKind::VerifyManifest]);
    input.secondary_destinations = vec!["offsite".into()];
    input
}

#[test]
fn scheduled_encrypted_backup_restores() {
    let site = Site::new();
    let schedule = site.orchestrator.create_schedule(daily_schedule()).unwrap();

    // 02:00 next day is the first occurrence.
    site.clock.advance(Duration::hours(15));
    let report = site.orchestrator.tick(None).unwrap();
    assert_eq!(report.created.len(), 1);
    let task_id = report.created[0].clone();

    let status = site.finish(&task_id);
    assert_eq!(status.status, StatusKind::Complete, "{}", status.status_text);
    assert_eq!(status.progress, 100.0);

    let task = site.store.get_task(&task_id).unwrap().unwrap();
    let result = task.result.unwrap();
    let archive = result.archive.unwrap();
    assert!(archive.to_string_lossy().ends_with(".tar.zst.crypt"));
    assert_eq!(result.delivered, vec!["offsite".to_string()]);
    assert!(site.dir.path().join("offsite").join(archive.file_name().unwrap()).is_file());

    let manifest = result.manifest.unwrap();
    assert_eq!(manifest.archive_type, ArchiveType::Full);
    assert_eq!(manifest.entries[&ComponentKind::Uploads].files, 7, "cache is excluded");
    assert_eq!(manifest.schedule_id.as_deref(), Some(schedule.id.as_str()));

    // The listing opens the envelope with the installation key.
    let key = keys::archive_key(&*site.store).unwrap();
    let listings = list_archives(&site.dir.path().join("archives"), Some(&key)).unwrap();
    assert_eq!(listings.len(), 1);
    assert!(listings[0].encrypted);
    assert_eq!(listings[0].manifest.as_ref().unwrap().task_id, task_id);

    // Wreck the site, then restore it into place.
    fs::remove_dir_all(site.root().join("uploads")).unwrap();
    fs::write(site.root().join("database.sql"), "garbage").unwrap();

    let restore_id = site
        .orchestrator
        .restore(RestoreRequest {
            owner: "site-admin".into(),
            archive: archive.clone(),
            components: BTreeSet::new(),
            target_root: None,
        })
        .unwrap();
    let status = site.finish(&restore_id);
    assert_eq!(status.status, StatusKind::Complete, "{}", status.status_text);

    assert_eq!(
        fs::read_to_string(site.root().join("uploads/2024/05/img-3.jpg")).unwrap(),
        "image 3"
    );
    assert_eq!(
        fs::read_to_string(site.root().join("database.sql")).unwrap(),
        "INSERT INTO posts VALUES (1, 'hello');"
    );
    assert!(!site.orchestrator.builder().scratch_dir(&restore_id).exists());
}

#[test]
fn restore_with_wrong_passphrase_fails_integrity() {
    let site = Site::new();
    site.store.set_setting(keys::ENCRYPTION_PASSPHRASE, "correct horse").unwrap();
    let schedule = site.orchestrator.create_schedule(daily_schedule()).unwrap();
    let task_id = site.orchestrator.run_now(&schedule.id, "site-admin").unwrap();
    assert_eq!(site.finish(&task_id).status, StatusKind::Complete);
    let archive = site
        .store
        .get_task(&task_id)
        .unwrap()
        .unwrap()
        .result
        .unwrap()
        .archive
        .unwrap();

    site.store.set_setting(keys::ENCRYPTION_PASSPHRASE, "battery staple").unwrap();
    let restore_id = site
        .orchestrator
        .restore(RestoreRequest {
            owner: "site-admin".into(),
            archive,
            components: BTreeSet::from([ComponentKind::Uploads]),
            target_root: Some(site.dir.path().join("restored")),
        })
        .unwrap();
    let status = site.finish(&restore_id);
    assert_eq!(status.status, StatusKind::Error);
    assert!(status.status_text.contains("Integrity"), "{}", status.status_text);
    assert!(!site.dir.path().join("restored").exists());
}

#[test]
fn incremental_backup_only_carries_changed_files() {
    let site = Site::new();
    let mut input = daily_schedule();
    input.encrypt = false;
    input.incremental = true;
    input.selected_components = BTreeSet::from([ComponentKind::Uploads, ComponentKind::Themes]);
    let schedule = site.orchestrator.create_schedule(input).unwrap();

    let first = site.orchestrator.run_now(&schedule.id, "site-admin").unwrap();
    assert_eq!(site.finish(&first).status, StatusKind::Complete);
    let first_manifest = site.store.get_task(&first).unwrap().unwrap().result.unwrap().manifest.unwrap();

    // File mtimes come from the real clock, so pin the previous run's start
    // between the existing files and the one written below.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let mut first_task = site.store.get_task(&first).unwrap().unwrap();
    first_task.started_at = Utc::now();
    site.store.save_task(&first_task).unwrap();
    site.clock.set(Utc::now());

    std::thread::sleep(std::time::Duration::from_millis(1100));
    write(&site.root().join("uploads/2024/05/new.jpg"), "fresh");

    let second = site.orchestrator.run_now(&schedule.id, "site-admin").unwrap();
    assert_eq!(site.finish(&second).status, StatusKind::Complete);
    let task = site.store.get_task(&second).unwrap().unwrap();
    let manifest = task.result.unwrap().manifest.unwrap();
    assert_eq!(manifest.archive_type, ArchiveType::Incremental);
    assert_eq!(manifest.base.as_deref(), Some(first_manifest.filename.as_str()));
    assert_eq!(manifest.entries[&ComponentKind::Uploads].files, 1);
    assert_eq!(task.state, TaskState::Completed);
}

//! Integration tests for crash recovery of the workflow state document.

use std::fs;

use cde_orchestrator::state::{
    FeatureRecord, FeatureStatus, PersistentStateStore, Phase, StateDocument, StateStoreConfig,
};
use serde_json::json;
use tempfile::TempDir;

fn store(temp_dir: &TempDir, max_backups: usize) -> PersistentStateStore {
    PersistentStateStore::new(
        StateStoreConfig::new(temp_dir.path().join(".cde").join("state.json"))
            .with_max_backups(max_backups),
    )
}

/// A feature walked through every phase survives a reload at each step.
#[test]
fn test_feature_lifecycle_survives_reload() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = store(&temp_dir, 3);

    store
        .update(|document| {
            document.upsert("feat-1", FeatureRecord::new("Add OAuth login"));
            Ok(())
        })
        .expect("create");

    for phase in [Phase::Decompose, Phase::Design, Phase::Implement, Phase::Test] {
        store
            .update(|document| {
                if let Some(record) = document.feature_mut("feat-1") {
                    record.advance(phase, None);
                }
                Ok(())
            })
            .expect("advance");

        let reloaded = PersistentStateStore::new(store.config().clone()).load();
        let record = reloaded.document.feature("feat-1").expect("feature");
        assert_eq!(record.current_phase, phase);
        assert_eq!(record.status, phase.working_status());
    }

    let done = store
        .update(|document| {
            if let Some(record) = document.feature_mut("feat-1") {
                record.advance(Phase::Review, Some(FeatureStatus::Completed));
            }
            Ok(())
        })
        .expect("complete");
    assert!(done.feature("feat-1").expect("feature").completed_at.is_some());
    assert_eq!(store.list_backups().expect("backups").len(), 3);
}

/// A corrupted primary file can be recovered from the newest backup.
#[test]
fn test_recover_from_backup_after_corruption() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = store(&temp_dir, 3);

    let mut document = StateDocument::new();
    document.upsert("feat-1", FeatureRecord::new("v1"));
    let first = store.save(&document).expect("save v1");
    document.upsert("feat-1", FeatureRecord::new("v2"));
    store.save(&document).expect("save v2");

    fs::write(store.path(), "{\"features\": {\"feat-1\": ").expect("corrupt");

    let loaded = store.load();
    assert!(loaded.document.is_empty());
    assert_eq!(loaded.diagnostics.len(), 1);

    let newest = store
        .list_backups()
        .expect("backups")
        .pop()
        .expect("a backup");
    let backup = PersistentStateStore::new(StateStoreConfig::new(newest)).load();
    assert!(backup.is_clean());
    assert_eq!(backup.document, first);
}

/// Legacy documents written by older tools load with defaults filled in and
/// keep their extra top-level keys through a save.
#[test]
fn test_legacy_document_migrates_on_load() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = store(&temp_dir, 3);
    fs::create_dir_all(temp_dir.path().join(".cde")).expect("mkdir");
    fs::write(
        store.path(),
        json!({
            "features": {
                "old": {"prompt": "Legacy feature", "status": "reviewing", "current_phase": "review"},
                "broken": {"status": "testing"}
            },
            "version": 1
        })
        .to_string(),
    )
    .expect("write legacy");

    let loaded = store.load();
    assert_eq!(loaded.diagnostics.len(), 1);
    let record = loaded.document.feature("old").expect("migrated");
    assert_eq!(record.workflow_type, "default");

    let written = store.save(&loaded.document).expect("save");
    assert_eq!(written.extra["version"], json!(1));
    assert!(written.feature("broken").is_none());
    assert_eq!(store.list_backups().expect("backups").len(), 1);
}

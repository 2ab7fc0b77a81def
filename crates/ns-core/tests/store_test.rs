use chrono::Utc;
use ns_core::store::{canonical_project_path, Store, MIGRATIONS};

#[tokio::test]
async fn open_creates_schema_and_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("nightshift.db");

    let store = Store::open(&db_path).await.expect("open db");
    assert_eq!(store.current_version().await.unwrap(), MIGRATIONS.last().unwrap().version);
    drop(store);

    // Reopening applies nothing new and keeps the version stable.
    let store = Store::open(&db_path).await.expect("reopen db");
    assert_eq!(store.current_version().await.unwrap(), MIGRATIONS.last().unwrap().version);
}

#[tokio::test]
async fn open_creates_private_parent_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("deep").join("nightshift.db");

    let _store = Store::open(&db_path).await.expect("open db");
    let parent = db_path.parent().unwrap();
    assert!(parent.is_dir());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(parent).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}

#[tokio::test]
async fn legacy_state_is_imported_once_and_renamed() {
    let tmp = tempfile::tempdir().unwrap();
    let state_dir = tmp.path().join("state");
    std::fs::create_dir_all(&state_dir).unwrap();
    let state_path = state_dir.join("state.json");
    std::fs::write(
        &state_path,
        r#"{
            "projects": {"/home/me/proj/": {"last_run": "2026-07-01T02:00:00Z", "run_count": 3}},
            "task_runs": {"/home/me/proj": {"lint-fix": "2026-07-01T02:10:00Z"}},
            "assigned_tasks": {
                "docs-backfill:/home/me/proj": {
                    "project": "/home/me/proj",
                    "task_type": "docs-backfill",
                    "assigned_at": "2026-07-01T02:05:00Z"
                }
            },
            "run_history": [{
                "start_time": "2026-07-01T02:00:00Z",
                "project": "/home/me/proj",
                "tokens_used": 9000,
                "status": "success"
            }]
        }"#,
    )
    .unwrap();

    let db_path = tmp.path().join("nightshift.db");
    let store = Store::open(&db_path).await.expect("open db");

    // Imported rows are visible, paths canonicalized.
    let project = store.get_project("/home/me/proj").await.unwrap().unwrap();
    assert_eq!(project.run_count, 3);
    assert!(store
        .last_task_run("/home/me/proj", "lint-fix")
        .await
        .unwrap()
        .is_some());
    assert!(store.is_assigned("docs-backfill:/home/me/proj").await.unwrap());
    assert_eq!(store.run_totals().await.unwrap().total_tokens, 9000);

    // File renamed; nothing to import on reopen.
    assert!(!state_path.exists());
    assert!(state_dir.join("state.json.migrated").exists());
    drop(store);
    let store = Store::open(&db_path).await.expect("reopen db");
    assert_eq!(store.get_project("/home/me/proj").await.unwrap().unwrap().run_count, 3);
}

#[tokio::test]
async fn corrupt_legacy_state_is_left_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let state_dir = tmp.path().join("state");
    std::fs::create_dir_all(&state_dir).unwrap();
    let state_path = state_dir.join("state.json");
    std::fs::write(&state_path, "{not json").unwrap();

    let db_path = tmp.path().join("nightshift.db");
    let _store = Store::open(&db_path).await.expect("open db survives bad legacy file");

    assert!(state_path.exists());
    assert!(!state_dir.join("state.json.migrated").exists());
}

#[tokio::test]
async fn selector_never_sees_an_assigned_key_twice() {
    let store = Store::in_memory().await.unwrap();
    let project = canonical_project_path("/p");
    let key = format!("lint-fix:{project}");

    assert!(store.mark_assigned(&key, &project, "lint-fix").await.unwrap());
    // Concurrent claimant loses.
    assert!(!store.mark_assigned(&key, &project, "lint-fix").await.unwrap());

    store.record_task_run(&project, "lint-fix").await.unwrap();
    store.clear_assigned(&key).await.unwrap();
    assert!(!store.is_assigned(&key).await.unwrap());

    let last = store.last_task_run(&project, "lint-fix").await.unwrap().unwrap();
    assert!((Utc::now() - last).num_seconds() < 5);
}

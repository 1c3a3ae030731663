use super::*;
use crate::sync::fs::{NativeFs, hash_bytes};
use crate::sync::test_support::{FakeRemote, record, vault_at};
use tempfile::tempdir;

const ME: &str = "u-me";
const OTHER: &str = "u-other";

fn ctx() -> DeriveContext {
    DeriveContext {
        current_user: ME.into(),
        cloud_new_after: Some(1_700_000_000),
    }
}

fn local_file(path: &str, bytes: &[u8]) -> LocalEntry {
    LocalEntry {
        relative_path: path.into(),
        is_directory: false,
        facts: LocalFacts {
            hash: Some(hash_bytes(bytes)),
            size: bytes.len() as u64,
            modified: 100,
        },
    }
}

fn local_dir(path: &str) -> LocalEntry {
    LocalEntry {
        relative_path: path.into(),
        is_directory: true,
        facts: LocalFacts {
            hash: None,
            size: 0,
            modified: 100,
        },
    }
}

fn inputs(path: &str) -> EntryInputs {
    EntryInputs {
        relative_path: path.into(),
        is_directory: false,
        local: None,
        server_record: None,
        has_server_descendants: false,
        previously_on_server: false,
        local_active_version: None,
        pending_metadata: None,
        ignored: false,
    }
}

fn facts(bytes: &[u8]) -> Option<LocalFacts> {
    Some(LocalFacts {
        hash: Some(hash_bytes(bytes)),
        size: bytes.len() as u64,
        modified: 100,
    })
}

fn build(
    local: &[LocalEntry],
    server: &[ServerFileMetadata],
    state: &WorkingCopyState,
) -> IndexSnapshot {
    rebuild(RebuildInput {
        vault_id: "v-1",
        local,
        server,
        state,
        ignore: &IgnoreRules::default(),
        ctx: &ctx(),
        built_at: 1,
    })
}

fn status_of(snapshot: &IndexSnapshot, path: &str) -> SyncStatus {
    snapshot.get(path).expect("entry exists").status()
}

fn install(index: &FileIndex, snapshot: IndexSnapshot, state: WorkingCopyState) {
    let mut inner = index.write();
    inner.snapshot = Arc::new(snapshot);
    inner.state = state;
    inner.ctx = ctx();
}

#[test]
fn local_only_file_is_added_unless_it_was_on_the_server() {
    let mut input = inputs("a.txt");
    input.local = facts(b"a");
    assert_eq!(derive_sync_status(&input, &ctx()), SyncStatus::Added);

    input.previously_on_server = true;
    assert_eq!(derive_sync_status(&input, &ctx()), SyncStatus::DeletedRemote);
}

#[test]
fn remote_only_file_is_cloud_new_after_threshold() {
    let mut input = inputs("a.txt");
    let mut server = record("f-1", "a.txt", b"a", 1);
    server.created_at = Some("2020-01-01T00:00:00Z".into());
    input.server_record = Some(server.clone());
    assert_eq!(derive_sync_status(&input, &ctx()), SyncStatus::CloudOnly);

    server.created_at = Some("2030-01-01T00:00:00Z".into());
    input.server_record = Some(server.clone());
    assert_eq!(derive_sync_status(&input, &ctx()), SyncStatus::CloudNew);

    let no_threshold = DeriveContext {
        current_user: ME.into(),
        cloud_new_after: None,
    };
    assert_eq!(
        derive_sync_status(&input, &no_threshold),
        SyncStatus::CloudOnly
    );
}

#[test]
fn present_both_follows_priority_order() {
    let mut input = inputs("parts/a.txt");
    input.local = facts(b"v1");
    input.local_active_version = Some(1);
    let mut server = record("f-1", "parts/a.txt", b"v1", 1);
    input.server_record = Some(server.clone());
    assert_eq!(derive_sync_status(&input, &ctx()), SyncStatus::Synced);

    // Local edit under my checkout.
    input.local = facts(b"edited");
    server.checked_out_by = Some(ME.into());
    input.server_record = Some(server.clone());
    assert_eq!(derive_sync_status(&input, &ctx()), SyncStatus::Modified);

    // Same content at a different path.
    input.local = facts(b"v1");
    input.relative_path = "archive/a.txt".into();
    assert_eq!(derive_sync_status(&input, &ctx()), SyncStatus::Moved);

    // Someone else published version 2.
    input.relative_path = "parts/a.txt".into();
    server = record("f-1", "parts/a.txt", b"v2", 2);
    input.server_record = Some(server);
    assert_eq!(derive_sync_status(&input, &ctx()), SyncStatus::Outdated);
}

#[test]
fn ignored_wins_over_everything() {
    let mut input = inputs("~$bracket.sldprt");
    input.local = facts(b"lock");
    input.server_record = Some(record("f-1", "~$bracket.sldprt", b"x", 1));
    input.ignored = true;
    assert_eq!(derive_sync_status(&input, &ctx()), SyncStatus::Ignored);
}

#[test]
fn derivation_is_deterministic() {
    let mut input = inputs("a.txt");
    input.local = facts(b"local");
    input.local_active_version = Some(2);
    let mut server = record("f-1", "a.txt", b"server", 3);
    server.checked_out_by = Some(OTHER.into());
    input.server_record = Some(server);

    let first = derive_sync_status(&input, &ctx());
    for _ in 0..32 {
        assert_eq!(derive_sync_status(&input.clone(), &ctx()), first);
    }
}

#[test]
fn rebuild_synthesizes_remote_folders() {
    let server = vec![record("f-1", "parts/sub/a.txt", b"a", 1)];
    let snapshot = build(&[], &server, &WorkingCopyState::default());

    assert_eq!(status_of(&snapshot, "parts"), SyncStatus::CloudOnly);
    assert!(snapshot.get("parts/sub").unwrap().is_directory());
    assert_eq!(status_of(&snapshot, "parts/sub/a.txt"), SyncStatus::CloudOnly);
}

#[test]
fn rebuild_marks_folders_by_server_presence() {
    let local = vec![
        local_dir("parts"),
        local_file("parts/a.txt", b"a"),
        local_dir("drafts"),
        local_file("drafts/b.txt", b"b"),
    ];
    let server = vec![record("f-1", "parts/a.txt", b"a", 1)];
    let mut state = WorkingCopyState::default();
    state.local_versions.insert("parts/a.txt".into(), 1);
    let snapshot = build(&local, &server, &state);

    assert_eq!(status_of(&snapshot, "parts"), SyncStatus::Synced);
    assert_eq!(status_of(&snapshot, "parts/a.txt"), SyncStatus::Synced);
    assert_eq!(status_of(&snapshot, "drafts"), SyncStatus::Added);
    assert_eq!(status_of(&snapshot, "drafts/b.txt"), SyncStatus::Added);
}

#[test]
fn rebuild_uses_known_server_paths_for_deleted_remote() {
    let local = vec![local_file("gone.txt", b"g"), local_file("fresh.txt", b"f")];
    let mut state = WorkingCopyState::default();
    state.known_server_paths.insert("gone.txt".into());
    let snapshot = build(&local, &[], &state);

    assert_eq!(status_of(&snapshot, "gone.txt"), SyncStatus::DeletedRemote);
    assert_eq!(status_of(&snapshot, "fresh.txt"), SyncStatus::Added);
}

#[test]
fn rebuild_joins_moved_files_through_the_ledger() {
    let local = vec![local_dir("archive"), local_file("archive/a.txt", b"a")];
    let server = vec![record("f-1", "parts/a.txt", b"a", 1)];
    let mut state = WorkingCopyState::default();
    state.moves.insert("archive/a.txt".into(), "f-1".into());
    state.local_versions.insert("archive/a.txt".into(), 1);
    let snapshot = build(&local, &server, &state);

    assert_eq!(status_of(&snapshot, "archive/a.txt"), SyncStatus::Moved);
    assert!(snapshot.get("parts/a.txt").is_none());
    assert!(snapshot.get("parts").is_none());
}

#[test]
fn status_counts_skip_ignored_and_folders() {
    let local = vec![
        local_dir("parts"),
        local_file("parts/a.txt", b"a"),
        local_file("parts/~$a.txt", b"lock"),
    ];
    let snapshot = build(&local, &[], &WorkingCopyState::default());
    let counts = snapshot.status_counts();

    assert_eq!(status_of(&snapshot, "parts/~$a.txt"), SyncStatus::Ignored);
    assert_eq!(counts.get(SyncStatus::Added), 1);
    assert_eq!(counts.get(SyncStatus::Ignored), 0);
    assert_eq!(counts.total(), 1);
}

#[test]
fn folder_checkout_status_reports_others() {
    let local = vec![
        local_dir("parts"),
        local_file("parts/a.txt", b"a"),
        local_file("parts/b.txt", b"b"),
        local_file("parts/c.txt", b"c"),
    ];
    let mut held = record("f-2", "parts/b.txt", b"b", 1);
    held.checked_out_by = Some(OTHER.into());
    let server = vec![
        record("f-1", "parts/a.txt", b"a", 1),
        held,
        record("f-3", "parts/c.txt", b"c", 1),
    ];
    let snapshot = build(&local, &server, &WorkingCopyState::default());

    assert_eq!(
        snapshot.folder_checkout_status("parts", ME),
        FolderCheckoutStatus::Others
    );
    assert_eq!(
        snapshot.folder_checkout_status("parts", OTHER),
        FolderCheckoutStatus::Mine
    );
    assert_eq!(snapshot.children("parts").len(), 3);
    assert_eq!(snapshot.children("").len(), 1);
}

#[tokio::test]
async fn checked_in_result_turns_added_into_synced() {
    let index = FileIndex::new(IndexConfig::default());
    let local = vec![local_file("a.txt", b"a")];
    install(
        &index,
        build(&local, &[], &WorkingCopyState::default()),
        WorkingCopyState::default(),
    );
    assert_eq!(status_of(&index.snapshot(), "a.txt"), SyncStatus::Added);

    let server = record("f-1", "a.txt", b"a", 1);
    index
        .apply(EntryUpdate::CheckedIn {
            path: "a.txt".into(),
            record: server,
            local: local[0].facts.clone(),
        })
        .await
        .unwrap();

    let file = index.get("a.txt").unwrap();
    assert_eq!(file.status(), SyncStatus::Synced);
    assert_eq!(file.server_record().unwrap().version, 1);
    assert_eq!(file.local_active_version(), Some(1));
}

#[tokio::test]
async fn checkin_after_edit_returns_to_synced() {
    let index = FileIndex::new(IndexConfig::default());
    let local = vec![local_file("b.txt", b"edited")];
    let mut server = record("f-1", "b.txt", b"original", 1);
    server.checked_out_by = Some(ME.into());
    let mut state = WorkingCopyState::default();
    state.local_versions.insert("b.txt".into(), 1);
    install(
        &index,
        build(&local, std::slice::from_ref(&server), &state),
        state,
    );
    assert_eq!(status_of(&index.snapshot(), "b.txt"), SyncStatus::Modified);

    let published = record("f-1", "b.txt", b"edited", 2);
    index
        .apply(EntryUpdate::CheckedIn {
            path: "b.txt".into(),
            record: published,
            local: local[0].facts.clone(),
        })
        .await
        .unwrap();

    let file = index.get("b.txt").unwrap();
    assert_eq!(file.status(), SyncStatus::Synced);
    assert_eq!(file.checked_out_by(), None);
    assert_eq!(file.server_record().unwrap().version, 2);
}

#[tokio::test]
async fn download_of_newer_version_clears_outdated() {
    let index = FileIndex::new(IndexConfig::default());
    let local = vec![local_file("c.txt", b"v3")];
    let server = record("f-1", "c.txt", b"v4", 4);
    let mut state = WorkingCopyState::default();
    state.local_versions.insert("c.txt".into(), 3);
    install(
        &index,
        build(&local, std::slice::from_ref(&server), &state),
        state,
    );
    assert_eq!(status_of(&index.snapshot(), "c.txt"), SyncStatus::Outdated);

    index
        .apply(EntryUpdate::Downloaded {
            path: "c.txt".into(),
            record: server,
            local: facts(b"v4").unwrap(),
        })
        .await
        .unwrap();

    let file = index.get("c.txt").unwrap();
    assert_eq!(file.status(), SyncStatus::Synced);
    assert_eq!(file.local_active_version(), Some(4));
}

#[tokio::test]
async fn moving_a_synced_file_records_the_ledger() {
    let index = FileIndex::new(IndexConfig::default());
    let local = vec![
        local_dir("parts"),
        local_file("parts/a.txt", b"a"),
        local_dir("archive"),
    ];
    let server = record("f-1", "parts/a.txt", b"a", 1);
    let mut state = WorkingCopyState::default();
    state.local_versions.insert("parts/a.txt".into(), 1);
    install(&index, build(&local, &[server], &state), state);
    let mut events = index.subscribe();

    index
        .apply(EntryUpdate::Moved {
            from: "parts/a.txt".into(),
            to: "archive/a.txt".into(),
        })
        .await
        .unwrap();

    let snapshot = index.snapshot();
    assert_eq!(status_of(&snapshot, "archive/a.txt"), SyncStatus::Moved);
    assert_eq!(status_of(&snapshot, "archive"), SyncStatus::Synced);
    assert_eq!(status_of(&snapshot, "parts"), SyncStatus::Added);
    assert!(snapshot.get("parts/a.txt").is_none());
    {
        let inner = index.read();
        assert_eq!(
            inner.state.moves.get("archive/a.txt").map(String::as_str),
            Some("f-1")
        );
        assert_eq!(inner.state.local_versions.get("archive/a.txt"), Some(&1));
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        IndexEvent::Updated { .. }
    ));
}

#[tokio::test]
async fn copies_are_new_local_files() {
    let index = FileIndex::new(IndexConfig::default());
    let local = vec![local_file("a.txt", b"a")];
    let server = record("f-1", "a.txt", b"a", 1);
    let mut state = WorkingCopyState::default();
    state.local_versions.insert("a.txt".into(), 1);
    install(&index, build(&local, &[server], &state), state);

    index
        .apply(EntryUpdate::Copied {
            from: "a.txt".into(),
            to: "a copy.txt".into(),
        })
        .await
        .unwrap();

    assert_eq!(status_of(&index.snapshot(), "a copy.txt"), SyncStatus::Added);
    assert_eq!(status_of(&index.snapshot(), "a.txt"), SyncStatus::Synced);
}

#[tokio::test]
async fn scan_reuses_cached_hashes_for_unchanged_files() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
    std::fs::write(dir.path().join("b.tmp"), b"scratch").unwrap();
    let ignore = IgnoreRules::default();
    let mut cache = HashCache::new();

    let first = scan_local(&NativeFs, dir.path(), &ignore, &mut cache, 2)
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache["a.txt"].hash, hash_bytes(b"alpha"));

    cache.get_mut("a.txt").unwrap().hash = "cached".into();
    let second = scan_local(&NativeFs, dir.path(), &ignore, &mut cache, 2)
        .await
        .unwrap();
    let a = second
        .iter()
        .find(|entry| entry.relative_path == "a.txt")
        .unwrap();
    assert_eq!(a.facts.hash.as_deref(), Some("cached"));
    let tmp = second
        .iter()
        .find(|entry| entry.relative_path == "b.tmp")
        .unwrap();
    assert_eq!(tmp.facts.hash, None);
}

#[tokio::test]
async fn refresh_swaps_snapshot_and_keeps_it_on_failure() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
    let remote = FakeRemote::new();
    remote.insert("a.txt", b"alpha", 1);
    remote.insert("cloud.txt", b"cloud", 1);
    let vault = vault_at(dir.path());
    let index = FileIndex::new(IndexConfig::default());

    let snapshot = index
        .refresh(&vault, ME, &NativeFs, remote.as_ref())
        .await
        .unwrap();
    assert_eq!(snapshot.vault_id, "v-1");
    assert_eq!(status_of(&snapshot, "cloud.txt"), SyncStatus::CloudOnly);
    // Matching content counts as synced even without a recorded version.
    assert_eq!(status_of(&snapshot, "a.txt"), SyncStatus::Synced);

    remote.set_offline(true);
    let err = index
        .refresh(&vault, ME, &NativeFs, remote.as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Remote(_)));
    assert_eq!(index.snapshot(), snapshot);
}

#[tokio::test]
async fn refresh_detects_files_deleted_on_server() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
    let remote = FakeRemote::new();
    remote.insert("a.txt", b"alpha", 1);
    let vault = vault_at(dir.path());
    let index = FileIndex::new(IndexConfig::default());

    index
        .refresh(&vault, ME, &NativeFs, remote.as_ref())
        .await
        .unwrap();
    remote.remove("a.txt");
    let snapshot = index
        .refresh(&vault, ME, &NativeFs, remote.as_ref())
        .await
        .unwrap();

    assert_eq!(status_of(&snapshot, "a.txt"), SyncStatus::DeletedRemote);
}

#[tokio::test]
async fn deleted_remote_survives_later_rebuilds_until_the_copy_is_gone() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
    let remote = FakeRemote::new();
    remote.insert("a.txt", b"alpha", 1);
    let vault = vault_at(dir.path());
    let index = FileIndex::new(IndexConfig::default());
    index
        .refresh(&vault, ME, &NativeFs, remote.as_ref())
        .await
        .unwrap();

    remote.remove("a.txt");
    for _ in 0..2 {
        let snapshot = index
            .refresh(&vault, ME, &NativeFs, remote.as_ref())
            .await
            .unwrap();
        assert_eq!(status_of(&snapshot, "a.txt"), SyncStatus::DeletedRemote);
    }

    std::fs::remove_file(dir.path().join("a.txt")).unwrap();
    index
        .refresh(&vault, ME, &NativeFs, remote.as_ref())
        .await
        .unwrap();
    std::fs::write(dir.path().join("a.txt"), b"fresh").unwrap();
    let snapshot = index
        .refresh(&vault, ME, &NativeFs, remote.as_ref())
        .await
        .unwrap();
    assert_eq!(status_of(&snapshot, "a.txt"), SyncStatus::Added);
}

#[tokio::test]
async fn only_a_full_sync_moves_the_cloud_new_threshold() {
    let dir = tempdir().unwrap();
    let store = Arc::new(crate::sync::test_support::memory_store().await);
    store
        .record_rebuild("v-1", &HashSet::new(), Some(1_000))
        .await
        .unwrap();
    let remote = FakeRemote::new();
    remote.insert("cloud.txt", b"cloud", 1);
    let vault = vault_at(dir.path());
    let index = FileIndex::new(IndexConfig::default()).with_store(store.clone());

    for _ in 0..2 {
        let snapshot = index
            .refresh(&vault, ME, &NativeFs, remote.as_ref())
            .await
            .unwrap();
        assert_eq!(status_of(&snapshot, "cloud.txt"), SyncStatus::CloudNew);
    }

    let snapshot = index
        .full_sync(&vault, ME, &NativeFs, remote.as_ref())
        .await
        .unwrap();
    assert_eq!(status_of(&snapshot, "cloud.txt"), SyncStatus::CloudNew);
    let snapshot = index
        .refresh(&vault, ME, &NativeFs, remote.as_ref())
        .await
        .unwrap();
    assert_eq!(status_of(&snapshot, "cloud.txt"), SyncStatus::CloudOnly);
    let state = store.load_working_state("v-1").await.unwrap();
    assert!(state.last_full_sync.is_some_and(|at| at > 1_000));
}

#[tokio::test]
async fn clear_empties_the_index() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
    let remote = FakeRemote::new();
    let index = FileIndex::new(IndexConfig::default());
    index
        .refresh(&vault_at(dir.path()), ME, &NativeFs, remote.as_ref())
        .await
        .unwrap();
    let mut events = index.subscribe();

    index.clear().await;

    assert!(index.snapshot().entries.is_empty());
    assert_eq!(index.vault_id(), "");
    assert_eq!(events.recv().await.unwrap(), IndexEvent::Cleared);
}

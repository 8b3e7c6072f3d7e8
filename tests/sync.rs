//! End-to-end tests driving a root through an in-memory filesystem and the
//! deterministic event injection it provides.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use pretty_assertions::assert_eq;
use watchfs::{InMemoryFs, InMemoryFsHandle, Vfs, VfsEvent};

use arbor::{
    ChangeDescriptor, Root, RootCallbacks, Sorter, SyncResponse, WorkspaceLoader,
    WorkspaceRegistry, MAX_CHANGE_QUEUE,
};

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    root: Root,
    handle: InMemoryFsHandle,
    changes: Receiver<PathBuf>,
    unlinks: Receiver<PathBuf>,
}

/// Opens `/ws` on an in-memory filesystem seeded with `files`, wiring the
/// callbacks to channels so tests can wait for commits deterministically.
fn open_fixture(files: &[(&str, &str)]) -> Fixture {
    let imfs = InMemoryFs::new();
    let handle = imfs.handle();
    handle.load_dir("/ws");
    for (path, contents) in files {
        handle.load_file(path, *contents);
    }

    let (change_tx, changes) = crossbeam_channel::unbounded();
    let (unlink_tx, unlinks) = crossbeam_channel::unbounded();
    let callbacks = RootCallbacks {
        on_change: Box::new(move |path| {
            let _ = change_tx.send(path.to_path_buf());
        }),
        on_unlink: Box::new(move |path| {
            let _ = unlink_tx.send(path.to_path_buf());
        }),
    };

    let root = Root::new(
        Arc::new(Vfs::new(imfs)),
        Arc::new(WorkspaceLoader),
        PathBuf::from("/ws"),
        Sorter::default(),
        callbacks,
    )
    .expect("root should open");

    Fixture {
        root,
        handle,
        changes,
        unlinks,
    }
}

fn wait_for_commits(fixture: &Fixture, count: usize) {
    for _ in 0..count {
        fixture
            .changes
            .recv_timeout(WAIT)
            .expect("change should be committed");
    }
}

fn change_paths(response: &SyncResponse) -> Vec<&Path> {
    match response {
        SyncResponse::Changes { changes } => changes.iter().map(|c| c.path()).collect(),
        SyncResponse::Reinitialize { .. } => panic!("expected changes, got reinitialize"),
    }
}

#[test]
fn events_flow_into_versioned_changes() {
    let fixture = open_fixture(&[("/ws/a.md", "# A")]);
    assert_eq!(fixture.root.current_version(), 0);

    fixture.handle.write_file("/ws/b.md", "# B");
    fixture.handle.remove("/ws/a.md");
    wait_for_commits(&fixture, 2);

    assert_eq!(fixture.root.current_version(), 2);

    let response = fixture.root.changes_since(0);
    assert_eq!(
        change_paths(&response),
        vec![Path::new("/ws/b.md"), Path::new("/ws/a.md")]
    );
    match &response {
        SyncResponse::Changes { changes } => {
            assert!(matches!(changes[0], ChangeDescriptor::Add { .. }));
            assert!(matches!(changes[1], ChangeDescriptor::Unlink { .. }));
        }
        _ => unreachable!(),
    }

    // A consumer already at the head gets nothing.
    assert_eq!(change_paths(&fixture.root.changes_since(2)), Vec::<&Path>::new());

    let tree = fixture.root.tree();
    assert!(tree.find(Path::new("/ws/b.md")).is_some());
    assert!(tree.find(Path::new("/ws/a.md")).is_none());
}

#[test]
fn bootstrap_then_catch_up_reconstructs_the_tree() {
    let fixture = open_fixture(&[("/ws/a.md", "# A")]);

    // A consumer bootstraps before any changes happen.
    let initial = fixture.root.initial_tree_data();
    assert_eq!(initial.current_version, 0);

    fixture.handle.write_file("/ws/b.md", "# B");
    fixture.handle.write_file("/ws/c.md", "# C");
    wait_for_commits(&fixture, 2);

    // Catching up by folding the returned changes yields the live tree.
    let response = fixture.root.changes_since(initial.current_version);
    let changes = match response {
        SyncResponse::Changes { changes } => changes,
        other => panic!("expected changes, got {:?}", other),
    };
    let mirrored =
        arbor::merge_changes_into_tree(&changes, initial.descriptor, &Sorter::default())
            .expect("changes should fold cleanly");

    assert_eq!(mirrored, fixture.root.tree());
}

#[test]
fn lagging_consumer_is_told_to_reinitialize() {
    let fixture = open_fixture(&[]);

    let total = MAX_CHANGE_QUEUE + 50;
    for i in 0..total {
        fixture.handle.write_file(format!("/ws/{i:03}.md"), "x");
    }
    wait_for_commits(&fixture, total);

    assert_eq!(fixture.root.current_version(), total as u64);

    // Version 0 fell out of the retained window.
    match fixture.root.changes_since(0) {
        SyncResponse::Reinitialize { data } => {
            assert_eq!(data.current_version, total as u64);
            assert_eq!(data.changes.len(), MAX_CHANGE_QUEUE);
            assert_eq!(
                data.descriptor.as_dir().expect("root is a dir").children.len(),
                total
            );
        }
        other => panic!("expected reinitialize, got {:?}", other),
    }

    // The oldest version still inside the window gets the full log.
    let oldest = fixture.root.current_version() - MAX_CHANGE_QUEUE as u64;
    assert_eq!(
        change_paths(&fixture.root.changes_since(oldest)).len(),
        MAX_CHANGE_QUEUE
    );
}

#[test]
fn indices_track_file_lifecycle() {
    let fixture = open_fixture(&[]);

    fixture.handle.write_file(
        "/ws/note.md",
        "# Note\n\n[[target]] #project\n\n20260823120000\n",
    );
    wait_for_commits(&fixture, 1);

    assert_eq!(
        fixture.root.files_with_tag("project"),
        vec![PathBuf::from("/ws/note.md")]
    );
    assert_eq!(
        fixture.root.file_with_id("20260823120000"),
        Some(PathBuf::from("/ws/note.md"))
    );
    assert_eq!(
        fixture.root.links().get(Path::new("/ws/note.md")),
        Some(&vec!["target".to_owned()])
    );

    // Rewriting without metadata keeps the file indexed with empty values;
    // the key staying present is what tells a consumer the file exists.
    fixture.handle.write_file("/ws/note.md", "plain text\n");
    wait_for_commits(&fixture, 1);
    assert_eq!(
        fixture.root.tags().get(Path::new("/ws/note.md")),
        Some(&Vec::new())
    );
    assert_eq!(
        fixture.root.links().get(Path::new("/ws/note.md")),
        Some(&Vec::new())
    );
    assert_eq!(
        fixture.root.ids().get(Path::new("/ws/note.md")).map(String::as_str),
        Some("")
    );
    assert_eq!(fixture.root.files_with_tag("project"), Vec::<PathBuf>::new());
    assert_eq!(fixture.root.file_with_id(""), None);

    // Unlinking removes the key entirely.
    fixture.handle.remove("/ws/note.md");
    wait_for_commits(&fixture, 1);
    assert!(fixture.root.tags().is_empty());
    assert!(fixture.root.links().is_empty());
    assert!(fixture.root.ids().is_empty());
}

#[test]
fn files_without_metadata_are_still_indexed() {
    let fixture = open_fixture(&[("/ws/plain.md", "no metadata here")]);

    let links = fixture.root.links();
    let tags = fixture.root.tags();
    let ids = fixture.root.ids();
    assert!(links.contains_key(Path::new("/ws/plain.md")));
    assert!(tags.contains_key(Path::new("/ws/plain.md")));
    assert!(ids.contains_key(Path::new("/ws/plain.md")));
}

#[test]
fn duplicate_add_is_a_recorded_no_op() {
    let fixture = open_fixture(&[("/ws/a.md", "# A")]);
    let before = fixture.root.tree();

    // Watchers sometimes deliver a creation for a path already in the tree.
    fixture
        .handle
        .raise(VfsEvent::Add(PathBuf::from("/ws/a.md")));
    wait_for_commits(&fixture, 1);

    assert_eq!(fixture.root.current_version(), 1);
    assert_eq!(fixture.root.tree(), before);
}

#[test]
fn failed_changes_do_not_advance_the_version() {
    let fixture = open_fixture(&[]);

    // An add under a directory the tree has never seen cannot be applied.
    fixture
        .handle
        .raise(VfsEvent::Unlink(PathBuf::from("/ws/never-existed.md")));
    fixture.handle.write_file("/ws/real.md", "x");
    wait_for_commits(&fixture, 1);

    // Only the valid change was committed.
    assert_eq!(fixture.root.current_version(), 1);
    assert_eq!(
        change_paths(&fixture.root.changes_since(0)),
        vec![Path::new("/ws/real.md")]
    );
}

#[test]
fn add_of_vanished_path_is_dropped() {
    let fixture = open_fixture(&[]);

    // The path disappeared between the watcher notification and the load:
    // the event must be dropped, not folded as a phantom entry.
    fixture
        .handle
        .raise(VfsEvent::Add(PathBuf::from("/ws/ghost.md")));
    fixture.handle.write_file("/ws/real.md", "x");
    wait_for_commits(&fixture, 1);

    assert_eq!(fixture.root.current_version(), 1);
    let tree = fixture.root.tree();
    assert!(tree.find(Path::new("/ws/ghost.md")).is_none());
    assert!(tree.find(Path::new("/ws/real.md")).is_some());
    assert_eq!(
        change_paths(&fixture.root.changes_since(0)),
        vec![Path::new("/ws/real.md")]
    );
}

#[test]
fn events_outside_the_root_are_ignored() {
    let fixture = open_fixture(&[("/ws/a.md", "")]);

    // A watch on a shared ancestor can deliver events for sibling trees.
    fixture.handle.load_file("/elsewhere/b.md", "");
    fixture
        .handle
        .raise(VfsEvent::Add(PathBuf::from("/elsewhere/b.md")));
    fixture
        .handle
        .raise(VfsEvent::Unlink(PathBuf::from("/elsewhere/b.md")));
    fixture.handle.write_file("/ws/c.md", "");
    wait_for_commits(&fixture, 1);

    assert_eq!(fixture.root.current_version(), 1);
    assert_eq!(
        change_paths(&fixture.root.changes_since(0)),
        vec![Path::new("/ws/c.md")]
    );
}

#[test]
fn sort_preference_change_invalidates_the_log() {
    let fixture = open_fixture(&[("/ws/a.md", ""), ("/ws/b.md", "")]);

    fixture.handle.write_file("/ws/c.md", "");
    wait_for_commits(&fixture, 1);
    let seen = fixture.root.current_version();

    fixture.root.set_sort_preferences(Sorter {
        folders_first: false,
        ..Sorter::default()
    });

    // The re-sort cannot be expressed as changes, so even a consumer that
    // was fully caught up must reinitialize.
    assert!(matches!(
        fixture.root.changes_since(seen),
        SyncResponse::Reinitialize { .. }
    ));
}

#[test]
fn root_unlink_fires_once_and_registry_reaps() {
    let imfs = InMemoryFs::new();
    let handle = imfs.handle();
    handle.load_file("/ws/a.md", "# A");
    let vfs = Arc::new(Vfs::new(imfs));

    let (unlink_tx, unlinks) = crossbeam_channel::unbounded();
    let callbacks = RootCallbacks {
        on_change: Box::new(|_| {}),
        on_unlink: Box::new(move |path: &Path| {
            let _ = unlink_tx.send(path.to_path_buf());
        }),
    };

    let mut registry = WorkspaceRegistry::new(Arc::new(WorkspaceLoader), Sorter::default());
    registry
        .open_with_vfs(vfs, PathBuf::from("/ws"), callbacks)
        .expect("root should open");

    handle.remove("/ws");

    let gone = unlinks.recv_timeout(WAIT).expect("unlink should fire");
    assert_eq!(gone, PathBuf::from("/ws"));

    assert_eq!(registry.reap_unlinked(), vec![PathBuf::from("/ws")]);
    assert!(registry.is_empty());
    assert!(unlinks.try_recv().is_err());
}

#[test]
fn missing_root_opens_as_missing_directory() {
    let vfs = Arc::new(Vfs::new(InMemoryFs::new()));

    let root = Root::new(
        vfs,
        Arc::new(WorkspaceLoader),
        PathBuf::from("/gone"),
        Sorter::default(),
        RootCallbacks::default(),
    )
    .expect("missing root should still open");

    let tree = root.tree();
    let dir = tree.as_dir().expect("missing root is a directory");
    assert!(dir.missing);
    assert!(dir.children.is_empty());
}

#[test]
fn directory_events_update_nested_structure() {
    let fixture = open_fixture(&[]);

    fixture.handle.create_dir("/ws/sub");
    fixture.handle.write_file("/ws/sub/inner.md", "# Inner");
    wait_for_commits(&fixture, 2);

    let tree = fixture.root.tree();
    let sub = tree
        .find(Path::new("/ws/sub"))
        .expect("subdirectory should be in the tree");
    assert!(sub.is_dir());
    assert_eq!(
        sub.as_dir().unwrap().children[0].path(),
        Path::new("/ws/sub/inner.md")
    );

    fixture.handle.remove("/ws/sub");
    wait_for_commits(&fixture, 1);
    assert!(fixture.root.tree().find(Path::new("/ws/sub")).is_none());
}

#[test]
fn shutdown_drains_and_stops() {
    let mut fixture = open_fixture(&[]);

    fixture.handle.write_file("/ws/a.md", "x");
    wait_for_commits(&fixture, 1);

    fixture.root.prepare_shutdown();

    // Events raised after shutdown are never committed.
    fixture.handle.write_file("/ws/b.md", "x");
    assert!(fixture.changes.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(fixture.root.current_version(), 1);
    assert!(fixture.unlinks.try_recv().is_err());
}

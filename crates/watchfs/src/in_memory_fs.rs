use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::{DirEntry, Metadata, ReadDir, VfsBackend, VfsEvent};

#[derive(Debug, Clone)]
enum Entry {
    File {
        contents: Vec<u8>,
        modified_ms: i64,
        created_ms: i64,
    },
    Dir,
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("path not found: {}", path.display()),
    )
}

/// `VfsBackend` that holds all of its contents in memory.
///
/// Intended for testing: contents are seeded or mutated through an
/// [`InMemoryFsHandle`], which also lets tests inject watcher events
/// deterministically, without real-filesystem timing.
pub struct InMemoryFs {
    state: Arc<Mutex<BTreeMap<PathBuf, Entry>>>,
    event_tx: Sender<VfsEvent>,
    event_rx: Receiver<VfsEvent>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        Self {
            state: Arc::new(Mutex::new(BTreeMap::new())),
            event_tx,
            event_rx,
        }
    }

    /// Returns a handle that can mutate this filesystem and raise events
    /// after the backend has been moved into a `Vfs`.
    pub fn handle(&self) -> InMemoryFsHandle {
        InMemoryFsHandle {
            state: Arc::clone(&self.state),
            event_tx: self.event_tx.clone(),
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to an [`InMemoryFs`].
///
/// The `load_*` methods seed contents silently; the `write_file`,
/// `create_dir` and `remove` methods mutate contents *and* emit the watcher
/// event a real backend would produce.
#[derive(Clone)]
pub struct InMemoryFsHandle {
    state: Arc<Mutex<BTreeMap<PathBuf, Entry>>>,
    event_tx: Sender<VfsEvent>,
}

impl InMemoryFsHandle {
    fn insert_ancestors(state: &mut BTreeMap<PathBuf, Entry>, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            state
                .entry(ancestor.to_path_buf())
                .or_insert(Entry::Dir);
        }
    }

    /// Seed a directory (and its ancestors) without raising an event.
    pub fn load_dir<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        let mut state = self.state.lock().unwrap();
        Self::insert_ancestors(&mut state, path);
        state.insert(path.to_path_buf(), Entry::Dir);
    }

    /// Seed a file (and its ancestor directories) without raising an event.
    pub fn load_file<P: AsRef<Path>, C: Into<Vec<u8>>>(&self, path: P, contents: C) {
        self.load_file_with_times(path, contents, 0, 0);
    }

    /// Seed a file with explicit timestamps, without raising an event.
    pub fn load_file_with_times<P: AsRef<Path>, C: Into<Vec<u8>>>(
        &self,
        path: P,
        contents: C,
        modified_ms: i64,
        created_ms: i64,
    ) {
        let path = path.as_ref();
        let mut state = self.state.lock().unwrap();
        Self::insert_ancestors(&mut state, path);
        state.insert(
            path.to_path_buf(),
            Entry::File {
                contents: contents.into(),
                modified_ms,
                created_ms,
            },
        );
    }

    /// Write a file and emit the event a watcher would deliver: `Add` for a
    /// new path, `Change` for an existing one.
    pub fn write_file<P: AsRef<Path>, C: Into<Vec<u8>>>(&self, path: P, contents: C) {
        let path = path.as_ref();
        let existed = {
            let mut state = self.state.lock().unwrap();
            Self::insert_ancestors(&mut state, path);
            let (modified_ms, created_ms) = match state.get(path) {
                Some(Entry::File {
                    modified_ms,
                    created_ms,
                    ..
                }) => (*modified_ms, *created_ms),
                _ => (0, 0),
            };
            let existed = state.contains_key(path);
            state.insert(
                path.to_path_buf(),
                Entry::File {
                    contents: contents.into(),
                    modified_ms,
                    created_ms,
                },
            );
            existed
        };

        let event = if existed {
            VfsEvent::Change(path.to_path_buf())
        } else {
            VfsEvent::Add(path.to_path_buf())
        };
        let _ = self.event_tx.send(event);
    }

    /// Create a directory and emit an `AddDir` event.
    pub fn create_dir<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        {
            let mut state = self.state.lock().unwrap();
            Self::insert_ancestors(&mut state, path);
            state.insert(path.to_path_buf(), Entry::Dir);
        }
        let _ = self.event_tx.send(VfsEvent::AddDir(path.to_path_buf()));
    }

    /// Remove a path (and any descendants) and emit the matching `Unlink` or
    /// `UnlinkDir` event. Removing a missing path is a no-op.
    pub fn remove<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        let was_dir = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.remove(path) else {
                return;
            };
            let was_dir = matches!(entry, Entry::Dir);
            if was_dir {
                state.retain(|key, _| !key.starts_with(path));
            }
            was_dir
        };

        let event = if was_dir {
            VfsEvent::UnlinkDir(path.to_path_buf())
        } else {
            VfsEvent::Unlink(path.to_path_buf())
        };
        let _ = self.event_tx.send(event);
    }

    /// Inject an arbitrary watcher event without touching the contents.
    /// Useful for simulating duplicate or out-of-order notifications.
    pub fn raise(&self, event: VfsEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl VfsBackend for InMemoryFs {
    fn read(&mut self, path: &Path) -> io::Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        match state.get(path) {
            Some(Entry::File { contents, .. }) => Ok(contents.clone()),
            Some(Entry::Dir) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot read a directory: {}", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn exists(&mut self, path: &Path) -> io::Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.contains_key(path))
    }

    fn read_dir(&mut self, path: &Path) -> io::Result<ReadDir> {
        let state = self.state.lock().unwrap();
        match state.get(path) {
            Some(Entry::Dir) => {}
            Some(Entry::File { .. }) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("not a directory: {}", path.display()),
                ))
            }
            None => return Err(not_found(path)),
        }

        // BTreeMap order makes directory listings deterministic.
        let children: Vec<PathBuf> = state
            .keys()
            .filter(|key| key.parent() == Some(path))
            .cloned()
            .collect();

        let inner = children.into_iter().map(|path| Ok(DirEntry { path }));

        Ok(ReadDir {
            inner: Box::new(inner),
        })
    }

    fn metadata(&mut self, path: &Path) -> io::Result<Metadata> {
        let state = self.state.lock().unwrap();
        match state.get(path) {
            Some(Entry::File {
                modified_ms,
                created_ms,
                ..
            }) => Ok(Metadata {
                is_file: true,
                modified_ms: *modified_ms,
                created_ms: *created_ms,
            }),
            Some(Entry::Dir) => Ok(Metadata {
                is_file: false,
                modified_ms: 0,
                created_ms: 0,
            }),
            None => Err(not_found(path)),
        }
    }

    fn event_receiver(&self) -> Receiver<VfsEvent> {
        self.event_rx.clone()
    }

    fn watch(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn unwatch(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Vfs;

    #[test]
    fn read_and_metadata() {
        let imfs = InMemoryFs::new();
        let handle = imfs.handle();
        handle.load_file_with_times("/ws/a.md", "hello", 100, 50);

        let vfs = Vfs::new(imfs);

        assert_eq!(vfs.read_to_string("/ws/a.md").unwrap().as_str(), "hello");

        let meta = vfs.metadata("/ws/a.md").unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.modified_ms(), 100);
        assert_eq!(meta.created_ms(), 50);

        // Ancestors were created implicitly.
        assert!(vfs.metadata("/ws").unwrap().is_dir());
    }

    #[test]
    fn read_dir_lists_direct_children_only() {
        let imfs = InMemoryFs::new();
        let handle = imfs.handle();
        handle.load_file("/ws/a.md", "a");
        handle.load_file("/ws/sub/b.md", "b");

        let vfs = Vfs::new(imfs);

        let children: Vec<PathBuf> = vfs
            .read_dir("/ws")
            .unwrap()
            .map(|entry| entry.unwrap().path().to_path_buf())
            .collect();

        assert_eq!(
            children,
            vec![PathBuf::from("/ws/a.md"), PathBuf::from("/ws/sub")]
        );
    }

    #[test]
    fn write_file_emits_add_then_change() {
        let imfs = InMemoryFs::new();
        let handle = imfs.handle();
        let events = imfs.event_receiver();

        handle.write_file("/ws/a.md", "one");
        handle.write_file("/ws/a.md", "two");

        assert_eq!(
            events.try_recv().unwrap(),
            VfsEvent::Add(PathBuf::from("/ws/a.md"))
        );
        assert_eq!(
            events.try_recv().unwrap(),
            VfsEvent::Change(PathBuf::from("/ws/a.md"))
        );
    }

    #[test]
    fn remove_dir_drops_descendants() {
        let imfs = InMemoryFs::new();
        let handle = imfs.handle();
        handle.load_file("/ws/sub/a.md", "a");
        let events = imfs.event_receiver();

        handle.remove("/ws/sub");

        assert_eq!(
            events.try_recv().unwrap(),
            VfsEvent::UnlinkDir(PathBuf::from("/ws/sub"))
        );

        let vfs = Vfs::new(imfs);
        assert!(!vfs.exists("/ws/sub/a.md").unwrap());
        assert!(!vfs.exists("/ws/sub").unwrap());
        assert!(vfs.exists("/ws").unwrap());
    }

    #[test]
    fn events_preserve_order() {
        let imfs = InMemoryFs::new();
        let handle = imfs.handle();
        handle.load_file("/ws/a.md", "a");
        let events = imfs.event_receiver();

        handle.raise(VfsEvent::Unlink(PathBuf::from("/ws/a.md")));
        handle.raise(VfsEvent::Add(PathBuf::from("/ws/b.md")));

        assert_eq!(
            events.try_recv().unwrap(),
            VfsEvent::Unlink(PathBuf::from("/ws/a.md"))
        );
        assert_eq!(
            events.try_recv().unwrap(),
            VfsEvent::Add(PathBuf::from("/ws/b.md"))
        );
    }
}

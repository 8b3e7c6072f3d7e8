//! The workspace registry: a thin map from opened root paths to their
//! [`Root`] controllers, sharing one loader and one set of sort preferences.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use watchfs::Vfs;

use crate::loader::PathLoader;
use crate::root::{Root, RootCallbacks, RootError};
use crate::sorter::Sorter;

/// Owns every opened root.
///
/// Each root runs its own change processor over its own `Vfs`; the registry
/// only routes by path and fans preference changes out.
pub struct WorkspaceRegistry {
    loader: Arc<dyn PathLoader>,
    sorter: Sorter,
    roots: HashMap<PathBuf, Root>,

    /// Paths whose backing directory disappeared, recorded from the
    /// processor thread. A root cannot tear itself down from its own
    /// `on_unlink` (the worker would join itself), so removal is deferred to
    /// [`reap_unlinked`](Self::reap_unlinked) on the owner's thread.
    unlinked: Arc<Mutex<Vec<PathBuf>>>,
}

impl WorkspaceRegistry {
    pub fn new(loader: Arc<dyn PathLoader>, sorter: Sorter) -> Self {
        Self {
            loader,
            sorter,
            roots: HashMap::new(),
            unlinked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Opens a root backed by the real filesystem.
    pub fn open(&mut self, path: PathBuf, callbacks: RootCallbacks) -> Result<&Root, RootError> {
        self.open_with_vfs(Arc::new(Vfs::new_default()), path, callbacks)
    }

    /// Opens a root on an explicit `Vfs`, which tests use to substitute an
    /// in-memory backend.
    ///
    /// The `Vfs` must not back another live root: a backend has a single
    /// event stream, and two processors draining it would steal each other's
    /// events.
    pub fn open_with_vfs(
        &mut self,
        vfs: Arc<Vfs>,
        path: PathBuf,
        callbacks: RootCallbacks,
    ) -> Result<&Root, RootError> {
        let unlinked = Arc::clone(&self.unlinked);
        let user_on_unlink = callbacks.on_unlink;
        let callbacks = RootCallbacks {
            on_change: callbacks.on_change,
            on_unlink: Box::new(move |root_path: &Path| {
                unlinked
                    .lock()
                    .expect("unlinked list poisoned")
                    .push(root_path.to_path_buf());
                user_on_unlink(root_path);
            }),
        };

        // Reopening a path replaces the previous root. Stop it first so two
        // processors never drain the same event stream.
        if let Some(mut previous) = self.roots.remove(&path) {
            previous.prepare_shutdown();
        }

        let root = Root::new(
            vfs,
            Arc::clone(&self.loader),
            path.clone(),
            self.sorter.clone(),
            callbacks,
        )?;

        self.roots.insert(path.clone(), root);
        Ok(&self.roots[&path])
    }

    pub fn get(&self, path: &Path) -> Option<&Root> {
        self.roots.get(path)
    }

    /// Closes a root, blocking until its processor has stopped.
    pub fn close(&mut self, path: &Path) -> bool {
        match self.roots.remove(path) {
            Some(mut root) => {
                root.prepare_shutdown();
                true
            }
            None => false,
        }
    }

    /// Removes every root whose backing directory has disappeared since the
    /// last call. Returns the affected paths.
    pub fn reap_unlinked(&mut self) -> Vec<PathBuf> {
        let paths: Vec<PathBuf> = self
            .unlinked
            .lock()
            .expect("unlinked list poisoned")
            .drain(..)
            .collect();

        for path in &paths {
            // The processor already stopped itself; removal just drops the
            // remaining handle.
            self.roots.remove(path);
        }

        paths
    }

    /// Replaces the sort preferences on the registry and every open root.
    pub fn set_sort_preferences(&mut self, sorter: Sorter) {
        self.sorter = sorter.clone();
        for root in self.roots.values() {
            root.set_sort_preferences(sorter.clone());
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.roots.keys().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

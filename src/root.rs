//! One opened workspace root: the live tree, its change processor thread,
//! the versioned change log, and the auxiliary indices.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{select, RecvError, Sender};
use jod_thread::JoinHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use watchfs::{Vfs, VfsEvent};

use crate::descriptor::{ChangeDescriptor, Descriptor, FileDescriptor};
use crate::loader::{LoaderError, PathLoader};
use crate::merge::apply_change;
use crate::sorter::{resort_tree, Sorter};

/// Maximum number of change descriptors retained for lagging consumers.
/// A consumer further behind than this has to reinitialize from a full
/// snapshot.
pub const MAX_CHANGE_QUEUE: usize = 100;

#[derive(Debug, Error)]
pub enum RootError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Loader(#[from] LoaderError),
}

/// Everything a consumer needs to start mirroring a root: the full tree
/// snapshot, the retained change log, and the version the snapshot is at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialTreeData {
    pub descriptor: Descriptor,
    pub changes: Vec<ChangeDescriptor>,
    pub current_version: u64,
}

/// Answer to [`Root::changes_since`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SyncResponse {
    /// The consumer's version is recent enough: apply these changes in order.
    Changes { changes: Vec<ChangeDescriptor> },
    /// The consumer fell too far behind (or holds a version from before a
    /// re-sort); it must replace its mirror with this snapshot.
    Reinitialize { data: InitialTreeData },
}

/// Hooks fired from the change processor thread.
///
/// `on_change` runs after a change has been committed; `on_unlink` runs once
/// when the root directory itself disappears, after which the processor
/// stops. Both must be cheap and non-blocking.
pub struct RootCallbacks {
    pub on_change: Box<dyn Fn(&Path) + Send + Sync>,
    pub on_unlink: Box<dyn Fn(&Path) + Send + Sync>,
}

impl Default for RootCallbacks {
    fn default() -> Self {
        Self {
            on_change: Box::new(|_| {}),
            on_unlink: Box::new(|_| {}),
        }
    }
}

/// State shared between a [`Root`] and its change processor thread.
///
/// The processor is the only writer; readers always see a fully committed
/// version.
struct RootState {
    tree: Descriptor,
    sorter: Sorter,
    current_version: u64,
    change_queue: VecDeque<ChangeDescriptor>,
    link_map: HashMap<PathBuf, Vec<String>>,
    tag_map: HashMap<PathBuf, Vec<String>>,
    id_map: HashMap<PathBuf, String>,
}

impl RootState {
    fn new(tree: Descriptor, sorter: Sorter) -> Self {
        let mut state = Self {
            tree,
            sorter,
            current_version: 0,
            change_queue: VecDeque::new(),
            link_map: HashMap::new(),
            tag_map: HashMap::new(),
            id_map: HashMap::new(),
        };
        state.rebuild_indices();
        state
    }

    /// Commits a change to the log and advances the version.
    fn record_change(&mut self, change: ChangeDescriptor) {
        self.change_queue.push_back(change);
        self.current_version += 1;
        while self.change_queue.len() > MAX_CHANGE_QUEUE {
            self.change_queue.pop_front();
        }
    }

    fn changes_since(&self, version: u64) -> SyncResponse {
        let oldest = self.current_version - self.change_queue.len() as u64;

        if version < oldest || version > self.current_version {
            return SyncResponse::Reinitialize {
                data: self.initial_tree_data(),
            };
        }

        let skip = (version - oldest) as usize;
        SyncResponse::Changes {
            changes: self.change_queue.iter().skip(skip).cloned().collect(),
        }
    }

    fn initial_tree_data(&self) -> InitialTreeData {
        InitialTreeData {
            descriptor: self.tree.clone(),
            changes: self.change_queue.iter().cloned().collect(),
            current_version: self.current_version,
        }
    }

    /// Every file in the tree has an entry in all three maps, empty values
    /// included: consumers rely on key presence to distinguish "file with no
    /// links" from "file not indexed".
    fn index_file(&mut self, file: &FileDescriptor) {
        self.link_map.insert(file.path.clone(), file.links.clone());
        self.tag_map.insert(file.path.clone(), file.tags.clone());
        self.id_map.insert(file.path.clone(), file.id.clone());
    }

    /// Drops index entries for exactly this path. Used on `change`, where the
    /// path may have turned from a file into a directory.
    fn deindex_exact(&mut self, path: &Path) {
        self.link_map.remove(path);
        self.tag_map.remove(path);
        self.id_map.remove(path);
    }

    /// Drops index entries for a path and everything beneath it. Used on
    /// `unlink`, where a removed directory takes its subtree with it.
    /// `Path::starts_with` compares whole components, so `/ws/a` does not
    /// shadow `/ws/ab`.
    fn deindex_subtree(&mut self, path: &Path) {
        self.link_map.retain(|key, _| !key.starts_with(path));
        self.tag_map.retain(|key, _| !key.starts_with(path));
        self.id_map.retain(|key, _| !key.starts_with(path));
    }

    fn rebuild_indices(&mut self) {
        self.link_map.clear();
        self.tag_map.clear();
        self.id_map.clear();

        // Walk first, index after; indexing borrows self mutably.
        let mut files = Vec::new();
        self.tree.for_each_file(&mut |file| files.push(file.clone()));
        for file in &files {
            self.index_file(file);
        }
    }

    fn apply_indexed(&mut self, change: &ChangeDescriptor) {
        match change {
            ChangeDescriptor::Add { descriptor, .. } => {
                if let Descriptor::File(file) = descriptor {
                    self.index_file(file);
                }
            }
            ChangeDescriptor::Change { path, descriptor } => {
                self.deindex_exact(path);
                if let Descriptor::File(file) = descriptor {
                    self.index_file(file);
                }
            }
            ChangeDescriptor::Unlink { path } => {
                self.deindex_subtree(path);
            }
        }
    }
}

/// An opened workspace root.
///
/// Owns the change processor thread that keeps the in-memory tree in sync
/// with the watched directory. All accessors return committed state.
pub struct Root {
    path: PathBuf,
    vfs: Arc<Vfs>,
    state: Arc<Mutex<RootState>>,

    /// `None` after `prepare_shutdown`.
    processor: Option<ChangeProcessor>,
}

impl Root {
    /// Opens a root: loads the full tree, sorts it, starts watching the path
    /// and spins up the change processor.
    ///
    /// A path that does not exist on disk still opens, as a tree whose root
    /// descriptor is marked missing; the watcher cannot be attached in that
    /// case, so the root stays static until reopened.
    pub fn new(
        vfs: Arc<Vfs>,
        loader: Arc<dyn PathLoader>,
        path: PathBuf,
        sorter: Sorter,
        callbacks: RootCallbacks,
    ) -> Result<Self, RootError> {
        let mut tree = loader.load(&vfs, &path, false)?;
        resort_tree(&mut tree, &sorter);

        let missing = tree.as_dir().map(|dir| dir.missing).unwrap_or(false);
        if !missing {
            vfs.watch(&path)?;
        }

        let state = Arc::new(Mutex::new(RootState::new(tree, sorter)));

        let processor = ChangeProcessor::start(
            path.clone(),
            Arc::clone(&state),
            Arc::clone(&vfs),
            loader,
            callbacks,
        );

        Ok(Self {
            path,
            vfs,
            state,
            processor: Some(processor),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the whole tree plus the retained change log.
    pub fn initial_tree_data(&self) -> InitialTreeData {
        self.lock_state().initial_tree_data()
    }

    /// Changes committed after `version`, or a full snapshot when the
    /// consumer is too far behind.
    pub fn changes_since(&self, version: u64) -> SyncResponse {
        self.lock_state().changes_since(version)
    }

    pub fn current_version(&self) -> u64 {
        self.lock_state().current_version
    }

    /// A committed snapshot of the tree.
    pub fn tree(&self) -> Descriptor {
        self.lock_state().tree.clone()
    }

    /// Outbound links per file, for files that have any.
    pub fn links(&self) -> HashMap<PathBuf, Vec<String>> {
        self.lock_state().link_map.clone()
    }

    /// Tags per file, for files that have any.
    pub fn tags(&self) -> HashMap<PathBuf, Vec<String>> {
        self.lock_state().tag_map.clone()
    }

    /// Identifier per file, for files that carry one.
    pub fn ids(&self) -> HashMap<PathBuf, String> {
        self.lock_state().id_map.clone()
    }

    /// Files currently carrying the given tag.
    pub fn files_with_tag(&self, tag: &str) -> Vec<PathBuf> {
        let state = self.lock_state();
        let mut paths: Vec<PathBuf> = state
            .tag_map
            .iter()
            .filter(|(_, tags)| tags.iter().any(|t| t == tag))
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// The file carrying the given identifier, if any.
    pub fn file_with_id(&self, id: &str) -> Option<PathBuf> {
        // Files without an identifier are indexed with an empty string; an
        // empty query must not match them.
        if id.is_empty() {
            return None;
        }
        let state = self.lock_state();
        state
            .id_map
            .iter()
            .find(|(_, file_id)| file_id.as_str() == id)
            .map(|(path, _)| path.clone())
    }

    /// Replaces the sort preferences, re-sorts the whole tree and invalidates
    /// the change log.
    ///
    /// A re-sort cannot be expressed as change descriptors, so the retained
    /// log is cleared and the version bumped; every lagging consumer's next
    /// `changes_since` answers with a full snapshot.
    pub fn set_sort_preferences(&self, sorter: Sorter) {
        let mut state = self.lock_state();
        state.sorter = sorter;
        let state = &mut *state;
        resort_tree(&mut state.tree, &state.sorter);
        state.change_queue.clear();
        state.current_version += 1;
    }

    /// Stops the change processor and detaches the watcher. Blocks until the
    /// processor thread has drained its current event.
    pub fn prepare_shutdown(&mut self) {
        self.processor.take();
        if let Err(err) = self.vfs.unwatch(&self.path) {
            log::warn!("failed to unwatch {}: {}", self.path.display(), err);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RootState> {
        self.state.lock().expect("root state poisoned")
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        if self.processor.is_some() {
            self.prepare_shutdown();
        }
    }
}

/// Processes watcher events for one root, folds them into the shared state
/// and notifies the callbacks.
///
/// Owns the worker thread; there is exactly one per root, so at most one
/// mutation is ever in flight and the change log stays strictly ordered.
struct ChangeProcessor {
    /// Signaled before the join handle is dropped, otherwise the worker's
    /// event loop would never end.
    shutdown_sender: Sender<()>,

    /// Dropping this blocks until the worker has finished.
    #[allow(unused)]
    job_thread: JoinHandle<Result<(), RecvError>>,
}

impl ChangeProcessor {
    fn start(
        root_path: PathBuf,
        state: Arc<Mutex<RootState>>,
        vfs: Arc<Vfs>,
        loader: Arc<dyn PathLoader>,
        callbacks: RootCallbacks,
    ) -> Self {
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);
        let vfs_receiver = vfs.event_receiver();
        let task = JobThreadContext {
            root_path,
            state,
            vfs,
            loader,
            callbacks,
        };

        let job_thread = jod_thread::Builder::new()
            .name("root change processor".to_owned())
            .spawn(move || {
                log::trace!("change processor started for {}", task.root_path.display());

                loop {
                    select! {
                        recv(vfs_receiver) -> event => {
                            if task.handle_vfs_event(event?) == Flow::Stop {
                                return Ok(());
                            }
                        },
                        recv(shutdown_receiver) -> _ => {
                            log::trace!(
                                "change processor shutting down for {}",
                                task.root_path.display()
                            );
                            return Ok(());
                        },
                    }
                }
            })
            .expect("could not start change processor thread");

        Self {
            shutdown_sender,
            job_thread,
        }
    }
}

impl Drop for ChangeProcessor {
    fn drop(&mut self) {
        // Without this the join below would wait forever on the event loop.
        let _ = self.shutdown_sender.send(());
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct JobThreadContext {
    root_path: PathBuf,
    state: Arc<Mutex<RootState>>,
    vfs: Arc<Vfs>,
    loader: Arc<dyn PathLoader>,
    callbacks: RootCallbacks,
}

impl JobThreadContext {
    fn handle_vfs_event(&self, event: VfsEvent) -> Flow {
        log::trace!("vfs event: {:?}", event);

        // The root itself going away is terminal: announce it once and stop.
        if matches!(event, VfsEvent::Unlink(_) | VfsEvent::UnlinkDir(_))
            && event.path() == self.root_path
        {
            (self.callbacks.on_unlink)(&self.root_path);
            return Flow::Stop;
        }

        // Events outside the root can arrive when a watch covers an ancestor
        // directory shared with another root.
        if !event.path().starts_with(&self.root_path) {
            return Flow::Continue;
        }

        let change = match &event {
            VfsEvent::Unlink(path) | VfsEvent::UnlinkDir(path) => ChangeDescriptor::Unlink {
                path: path.clone(),
            },
            VfsEvent::Add(path) | VfsEvent::AddDir(path) | VfsEvent::Change(path) => {
                let descriptor = match self.loader.load(&self.vfs, path, true) {
                    Ok(descriptor) => descriptor,
                    Err(err) => {
                        // The path may already be gone again; the follow-up
                        // unlink event will reconcile the tree.
                        log::warn!("could not load {}: {}", path.display(), err);
                        return Flow::Continue;
                    }
                };

                match &event {
                    VfsEvent::Change(_) => ChangeDescriptor::Change {
                        path: path.clone(),
                        descriptor,
                    },
                    _ => ChangeDescriptor::Add {
                        path: path.clone(),
                        descriptor,
                    },
                }
            }
            _ => return Flow::Continue,
        };

        self.fold(change);
        Flow::Continue
    }

    /// Applies one change under the state lock, then notifies outside of it.
    fn fold(&self, change: ChangeDescriptor) {
        let path = change.path().to_path_buf();

        {
            let mut guard = self.state.lock().expect("root state poisoned");
            let state = &mut *guard;

            match apply_change(&mut state.tree, &change, &state.sorter) {
                Ok(()) => {
                    state.apply_indexed(&change);
                    state.record_change(change);
                }
                Err(err) => {
                    log::error!(
                        "cannot apply {} for {}: {}",
                        change.kind(),
                        path.display(),
                        err
                    );
                    return;
                }
            }
        }

        (self.callbacks.on_change)(&path);
    }
}

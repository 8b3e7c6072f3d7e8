use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{collections::HashSet, io};

use crossbeam_channel::{Receiver, Sender};
use notify::RecursiveMode;
use notify_debouncer_full::{
    new_debouncer,
    notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode},
    DebounceEventResult, Debouncer, RecommendedCache,
};

use crate::{DirEntry, Metadata, ReadDir, VfsBackend, VfsEvent};

fn to_unix_ms(time: io::Result<SystemTime>) -> i64 {
    time.ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// `VfsBackend` that uses `std::fs` and the `notify` crate.
pub struct StdBackend {
    debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
    watcher_receiver: Receiver<VfsEvent>,
    watches: HashSet<PathBuf>,
}

impl StdBackend {
    pub fn new() -> StdBackend {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let debouncer = Self::create_debouncer(event_tx);

        Self {
            debouncer,
            watcher_receiver: event_rx,
            watches: HashSet::new(),
        }
    }

    fn create_debouncer(
        event_tx: Sender<VfsEvent>,
    ) -> Debouncer<notify::RecommendedWatcher, RecommendedCache> {
        // Short debounce keeps change batches together without adding
        // user-visible latency.
        let debounce_timeout = Duration::from_millis(50);

        new_debouncer(
            debounce_timeout,
            None, // Use default tick rate
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        for vfs_event in Self::convert_event(&event.event) {
                            if event_tx.send(vfs_event).is_err() {
                                // Receiver hung up; the owning Vfs is gone.
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        if error.paths.is_empty() {
                            log::warn!(
                                "File watcher requested rescan due to rapid changes. \
                                 Some file events may have been missed."
                            );
                        } else {
                            log::error!(
                                "File watcher error: {:?} (path: {:?})",
                                error.kind,
                                error.paths.first()
                            );
                        }
                    }
                }
            },
        )
        .expect("Failed to create file watcher debouncer")
    }

    /// Classify an added or renamed-to path as file or directory by statting
    /// it. Events can outlive the paths they describe, so a failed stat falls
    /// back to the plain file variant.
    fn classify_added(path: &Path) -> VfsEvent {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => VfsEvent::AddDir(path.to_path_buf()),
            _ => VfsEvent::Add(path.to_path_buf()),
        }
    }

    /// Convert a notify event to our VfsEvent(s).
    fn convert_event(event: &notify::Event) -> Vec<VfsEvent> {
        let mut vfs_events = Vec::new();

        match &event.kind {
            EventKind::Create(CreateKind::Folder) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::AddDir(path.clone()));
                }
            }
            EventKind::Create(CreateKind::File) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Add(path.clone()));
                }
            }
            EventKind::Create(CreateKind::Any) | EventKind::Create(CreateKind::Other) => {
                for path in &event.paths {
                    vfs_events.push(Self::classify_added(path));
                }
            }

            EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Other) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Change(path.clone()));
                }
            }

            // Metadata changes carry nothing a tree mirror cares about.
            EventKind::Modify(ModifyKind::Metadata(_)) => {}

            // Renames are reported as an independent removal and addition;
            // the debouncer tracks both halves when it can.
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if event.paths.len() >= 2 {
                    let removed = &event.paths[0];
                    let added = &event.paths[1];
                    let added_event = Self::classify_added(added);
                    vfs_events.push(if matches!(added_event, VfsEvent::AddDir(_)) {
                        VfsEvent::UnlinkDir(removed.clone())
                    } else {
                        VfsEvent::Unlink(removed.clone())
                    });
                    vfs_events.push(added_event);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                // Only the old path is known; the entry itself is gone so it
                // cannot be statted any more.
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Unlink(path.clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    vfs_events.push(Self::classify_added(path));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Any))
            | EventKind::Modify(ModifyKind::Name(RenameMode::Other)) => {
                // Ambiguous rename half: the path either appeared or
                // disappeared. Stat decides which.
                for path in &event.paths {
                    if path.exists() {
                        vfs_events.push(VfsEvent::Change(path.clone()));
                    } else {
                        vfs_events.push(VfsEvent::Unlink(path.clone()));
                    }
                }
            }

            EventKind::Remove(RemoveKind::Folder) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::UnlinkDir(path.clone()));
                }
            }
            EventKind::Remove(RemoveKind::File)
            | EventKind::Remove(RemoveKind::Any)
            | EventKind::Remove(RemoveKind::Other) => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Unlink(path.clone()));
                }
            }

            EventKind::Access(_) => {}

            EventKind::Other | EventKind::Any => {
                for path in &event.paths {
                    vfs_events.push(VfsEvent::Change(path.clone()));
                }
            }
        }

        vfs_events
    }
}

impl VfsBackend for StdBackend {
    fn read(&mut self, path: &Path) -> io::Result<Vec<u8>> {
        fs_err::read(path)
    }

    fn exists(&mut self, path: &Path) -> io::Result<bool> {
        std::fs::exists(path)
    }

    fn read_dir(&mut self, path: &Path) -> io::Result<ReadDir> {
        let entries: Result<Vec<_>, _> = fs_err::read_dir(path)?.collect();
        let mut entries = entries?;

        entries.sort_by_cached_key(|entry| entry.file_name());

        let inner = entries
            .into_iter()
            .map(|entry| Ok(DirEntry { path: entry.path() }));

        Ok(ReadDir {
            inner: Box::new(inner),
        })
    }

    fn metadata(&mut self, path: &Path) -> io::Result<Metadata> {
        let inner = fs_err::metadata(path)?;

        Ok(Metadata {
            is_file: inner.is_file(),
            modified_ms: to_unix_ms(inner.modified()),
            created_ms: to_unix_ms(inner.created()),
        })
    }

    fn event_receiver(&self) -> crossbeam_channel::Receiver<VfsEvent> {
        self.watcher_receiver.clone()
    }

    fn watch(&mut self, path: &Path) -> io::Result<()> {
        if self.watches.contains(path)
            || path
                .ancestors()
                .any(|ancestor| self.watches.contains(ancestor))
        {
            Ok(())
        } else {
            // Only record the watch after it succeeds, so a failed watch
            // does not permanently mark the path as watched.
            match self.debouncer.watch(path, RecursiveMode::Recursive) {
                Ok(()) => {
                    log::trace!("Watching path: {}", path.display());
                    self.watches.insert(path.to_path_buf());
                    Ok(())
                }
                Err(err) => {
                    log::warn!("Failed to watch path {}: {:?}", path.display(), err);
                    Err(io::Error::other(format!("{:?}", err)))
                }
            }
        }
    }

    fn unwatch(&mut self, path: &Path) -> io::Result<()> {
        match self.debouncer.unwatch(path) {
            Ok(()) => {
                log::trace!("Unwatched path: {}", path.display());
                self.watches.remove(path);
                Ok(())
            }
            Err(err) => {
                // The path may have been covered by a watched ancestor rather
                // than watched directly.
                if matches!(
                    err.kind,
                    notify::ErrorKind::WatchNotFound | notify::ErrorKind::PathNotFound
                ) {
                    self.watches.remove(path);
                    Ok(())
                } else {
                    log::warn!("Failed to unwatch path {}: {:?}", path.display(), err);
                    Err(io::Error::other(format!("{:?}", err)))
                }
            }
        }
    }
}

impl Default for StdBackend {
    fn default() -> Self {
        Self::new()
    }
}

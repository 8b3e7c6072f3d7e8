//! The descriptor data model: immutable value snapshots of files and
//! directories, plus the change descriptors that mutate a tree of them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sorter::SortMode;

/// Snapshot of one file or directory at a point in time.
///
/// Descriptors are value types: applying a change replaces a descriptor
/// rather than mutating it, with one deliberate exception — the child list of
/// a directory, which the merge algorithm assigns in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Descriptor {
    Directory(DirDescriptor),
    File(FileDescriptor),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirDescriptor {
    /// Absolute path of this directory.
    pub path: PathBuf,
    /// Path of the containing directory.
    pub dir: PathBuf,
    /// Directory name, the last path component.
    pub name: String,
    /// The sort mode applied to this directory's children.
    pub sorting: SortMode,
    /// Last modification time in unix milliseconds.
    pub modtime: i64,
    /// Creation time in unix milliseconds, zero when unavailable.
    pub creationtime: i64,
    /// Set when the directory does not currently exist on disk (an opened
    /// root whose backing folder is gone).
    pub missing: bool,
    pub children: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Absolute path of this file.
    pub path: PathBuf,
    /// Path of the containing directory.
    pub dir: PathBuf,
    /// File name, the last path component.
    pub name: String,
    /// Display title extracted by the loader, if the file carries one.
    pub title: Option<String>,
    /// Outbound links extracted by the loader. Opaque to the engine.
    pub links: Vec<String>,
    /// Tags extracted by the loader. Opaque to the engine.
    pub tags: Vec<String>,
    /// Stable identifier extracted by the loader, empty when none.
    pub id: String,
    /// Last modification time in unix milliseconds.
    pub modtime: i64,
    /// Creation time in unix milliseconds, zero when unavailable.
    pub creationtime: i64,
}

impl Descriptor {
    pub fn path(&self) -> &Path {
        match self {
            Descriptor::Directory(dir) => &dir.path,
            Descriptor::File(file) => &file.path,
        }
    }

    /// Path of the containing directory.
    pub fn dir(&self) -> &Path {
        match self {
            Descriptor::Directory(dir) => &dir.dir,
            Descriptor::File(file) => &file.dir,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Descriptor::Directory(dir) => &dir.name,
            Descriptor::File(file) => &file.name,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Descriptor::Directory(_))
    }

    pub fn modtime(&self) -> i64 {
        match self {
            Descriptor::Directory(dir) => dir.modtime,
            Descriptor::File(file) => file.modtime,
        }
    }

    pub fn creationtime(&self) -> i64 {
        match self {
            Descriptor::Directory(dir) => dir.creationtime,
            Descriptor::File(file) => file.creationtime,
        }
    }

    pub fn as_dir(&self) -> Option<&DirDescriptor> {
        match self {
            Descriptor::Directory(dir) => Some(dir),
            Descriptor::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileDescriptor> {
        match self {
            Descriptor::Directory(_) => None,
            Descriptor::File(file) => Some(file),
        }
    }

    /// Finds the descriptor with the given path anywhere in this subtree.
    pub fn find(&self, path: &Path) -> Option<&Descriptor> {
        if self.path() == path {
            return Some(self);
        }

        match self {
            Descriptor::File(_) => None,
            Descriptor::Directory(dir) => {
                // Paths outside this subtree can never match below it.
                if !path.starts_with(&dir.path) {
                    return None;
                }
                dir.children.iter().find_map(|child| child.find(path))
            }
        }
    }

    /// Finds the directory descriptor with the given path, mutably.
    pub fn find_dir_mut(&mut self, path: &Path) -> Option<&mut DirDescriptor> {
        match self {
            Descriptor::File(_) => None,
            Descriptor::Directory(dir) => {
                if dir.path == path {
                    return Some(dir);
                }
                if !path.starts_with(&dir.path) {
                    return None;
                }
                dir.children
                    .iter_mut()
                    .find_map(|child| child.find_dir_mut(path))
            }
        }
    }

    /// Calls `visit` for every file descriptor in this subtree.
    pub fn for_each_file<F: FnMut(&FileDescriptor)>(&self, visit: &mut F) {
        match self {
            Descriptor::File(file) => visit(file),
            Descriptor::Directory(dir) => {
                for child in &dir.children {
                    child.for_each_file(visit);
                }
            }
        }
    }
}

/// One unit of tree mutation, produced by folding a raw filesystem
/// notification. Also the wire unit of the consumer diff protocol, so the
/// order of a batch is significant and must never be reshuffled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeDescriptor {
    Add {
        path: PathBuf,
        descriptor: Descriptor,
    },
    Change {
        path: PathBuf,
        descriptor: Descriptor,
    },
    Unlink {
        path: PathBuf,
    },
}

impl ChangeDescriptor {
    pub fn path(&self) -> &Path {
        match self {
            ChangeDescriptor::Add { path, .. }
            | ChangeDescriptor::Change { path, .. }
            | ChangeDescriptor::Unlink { path } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeDescriptor::Add { .. } => "add",
            ChangeDescriptor::Change { .. } => "change",
            ChangeDescriptor::Unlink { .. } => "unlink",
        }
    }
}

//! arbor keeps an in-memory mirror of one or more workspace directories and
//! hands consumers a versioned change feed to keep their own copies in sync.
//!
//! Each opened root loads its directory into a tree of [`Descriptor`]s,
//! watches the path through [`watchfs`], and folds filesystem events into the
//! tree on a dedicated processor thread. Consumers bootstrap from
//! [`InitialTreeData`] and poll [`Root::changes_since`] with their last seen
//! version; if they fall behind the bounded change log they receive a fresh
//! snapshot instead.

pub mod descriptor;
pub mod loader;
pub mod merge;
pub mod registry;
pub mod root;
pub mod sorter;

pub use descriptor::{ChangeDescriptor, Descriptor, DirDescriptor, FileDescriptor};
pub use loader::{LoaderError, PathLoader, WorkspaceLoader};
pub use merge::{apply_change, merge_changes_into_tree, MergeError};
pub use registry::WorkspaceRegistry;
pub use root::{InitialTreeData, Root, RootCallbacks, RootError, SyncResponse, MAX_CHANGE_QUEUE};
pub use sorter::{resort_tree, DisplayMode, SortMode, Sorter, TimeField};

//! The tree merge algorithm: folds change descriptors into a tree snapshot.
//!
//! Merging is deterministic and order-sensitive. A batch is applied strictly
//! in array order; the algorithm never reorders events, because an
//! `Unlink(a)` followed by `Add(a')` means something different from the
//! reverse.

use std::mem;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::descriptor::{ChangeDescriptor, Descriptor, DirDescriptor};
use crate::sorter::Sorter;

/// An integrity failure while folding a single change into the tree.
///
/// These indicate that the notification stream and the tree have diverged
/// (e.g. a child arriving before its parent). The change that caused one is
/// unrecoverable, but the tree itself is left exactly as it was.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cannot {action} {path}: parent directory {parent} is not in the tree")]
    ParentNotFound {
        action: &'static str,
        path: PathBuf,
        parent: PathBuf,
    },

    #[error("cannot {action} {path}: {parent} is not a directory")]
    NotADirectory {
        action: &'static str,
        path: PathBuf,
        parent: PathBuf,
    },

    #[error("cannot {action} {path}: no such child in {parent}")]
    ChildNotFound {
        action: &'static str,
        path: PathBuf,
        parent: PathBuf,
    },
}

/// Applies a batch of changes to a tree snapshot, strictly in order, and
/// returns the new snapshot.
///
/// The first integrity failure aborts the batch; changes already folded at
/// that point are lost with the consumed snapshot, which is why the root
/// controller folds one change at a time via [`apply_change`].
pub fn merge_changes_into_tree(
    changes: &[ChangeDescriptor],
    mut tree: Descriptor,
    sorter: &Sorter,
) -> Result<Descriptor, MergeError> {
    for change in changes {
        apply_change(&mut tree, change, sorter)?;
    }
    Ok(tree)
}

/// Applies one change to the tree.
///
/// Atomic with respect to failure: every integrity check happens before any
/// mutation, so an `Err` leaves the tree untouched.
pub fn apply_change(
    tree: &mut Descriptor,
    change: &ChangeDescriptor,
    sorter: &Sorter,
) -> Result<(), MergeError> {
    match change {
        ChangeDescriptor::Add { path, descriptor } => apply_add(tree, path, descriptor, sorter),
        ChangeDescriptor::Change { path, descriptor } => {
            apply_replace(tree, path, descriptor, sorter)
        }
        ChangeDescriptor::Unlink { path } => apply_unlink(tree, path),
    }
}

fn apply_add(
    tree: &mut Descriptor,
    path: &Path,
    descriptor: &Descriptor,
    sorter: &Sorter,
) -> Result<(), MergeError> {
    if tree.find(path).is_some() {
        // Watchers can deliver the same creation twice; the duplicate is
        // suppressed rather than treated as corruption.
        log::warn!("ignoring duplicate add for {}", path.display());
        return Ok(());
    }

    let parent = locate_parent(tree, "add", path, descriptor.dir())?;
    parent.children.push(descriptor.clone());

    let children = mem::take(&mut parent.children);
    parent.children = sorter.sort(children, parent.sorting);

    Ok(())
}

fn apply_replace(
    tree: &mut Descriptor,
    path: &Path,
    descriptor: &Descriptor,
    sorter: &Sorter,
) -> Result<(), MergeError> {
    // The root itself changed. Loaders produce shallow directory
    // descriptors, so the existing children are carried over; a type change
    // replaces the root wholesale.
    if tree.path() == path {
        let mut incoming = descriptor.clone();
        if let (Descriptor::Directory(old_root), Descriptor::Directory(new_root)) =
            (&mut *tree, &mut incoming)
        {
            let children = mem::take(&mut old_root.children);
            new_root.children = sorter.sort(children, new_root.sorting);
        }
        *tree = incoming;
        return Ok(());
    }

    let parent = locate_parent(tree, "change", path, descriptor.dir())?;
    let index = parent
        .children
        .iter()
        .position(|child| child.path() == path)
        .ok_or_else(|| MergeError::ChildNotFound {
            action: "change",
            path: path.to_path_buf(),
            parent: descriptor.dir().to_path_buf(),
        })?;

    let mut incoming = descriptor.clone();
    if let (Descriptor::Directory(new_child), Descriptor::Directory(old_child)) =
        (&mut incoming, &mut parent.children[index])
    {
        // Same shallow-descriptor rule as the root case. The position is kept
        // as-is: a metadata change does not move an existing entry, so only
        // adds and whole-root changes re-sort.
        new_child.children = mem::take(&mut old_child.children);
    }
    parent.children[index] = incoming;

    Ok(())
}

fn apply_unlink(tree: &mut Descriptor, path: &Path) -> Result<(), MergeError> {
    // Unlink events carry no descriptor, so the parent comes from the path
    // itself rather than from a tree lookup.
    let parent_path = path.parent().ok_or_else(|| MergeError::ParentNotFound {
        action: "unlink",
        path: path.to_path_buf(),
        parent: PathBuf::new(),
    })?;

    let parent = locate_parent(tree, "unlink", path, parent_path)?;
    let index = parent
        .children
        .iter()
        .position(|child| child.path() == path)
        .ok_or_else(|| MergeError::ChildNotFound {
            action: "unlink",
            path: path.to_path_buf(),
            parent: parent_path.to_path_buf(),
        })?;

    parent.children.remove(index);

    Ok(())
}

fn locate_parent<'a>(
    tree: &'a mut Descriptor,
    action: &'static str,
    path: &Path,
    parent_path: &Path,
) -> Result<&'a mut DirDescriptor, MergeError> {
    match tree.find(parent_path) {
        None => {
            return Err(MergeError::ParentNotFound {
                action,
                path: path.to_path_buf(),
                parent: parent_path.to_path_buf(),
            })
        }
        Some(found) if !found.is_dir() => {
            return Err(MergeError::NotADirectory {
                action,
                path: path.to_path_buf(),
                parent: parent_path.to_path_buf(),
            })
        }
        Some(_) => {}
    }

    Ok(tree
        .find_dir_mut(parent_path)
        .expect("parent directory located above"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::test::{dir, file};
    use pretty_assertions::assert_eq;

    fn child_names(tree: &Descriptor) -> Vec<&str> {
        tree.as_dir()
            .unwrap()
            .children
            .iter()
            .map(|child| child.name())
            .collect()
    }

    fn add(path: &str) -> ChangeDescriptor {
        ChangeDescriptor::Add {
            path: PathBuf::from(path),
            descriptor: file(path),
        }
    }

    fn unlink(path: &str) -> ChangeDescriptor {
        ChangeDescriptor::Unlink {
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn add_inserts_sorted() {
        let tree = dir("/ws", vec![file("/ws/c.md")]);
        let sorter = Sorter::default();

        let tree = merge_changes_into_tree(&[add("/ws/a.md")], tree, &sorter).unwrap();
        assert_eq!(child_names(&tree), vec!["a.md", "c.md"]);
    }

    #[test]
    fn add_is_idempotent() {
        let tree = dir("/ws", vec![]);
        let sorter = Sorter::default();

        let once = merge_changes_into_tree(&[add("/ws/a.md")], tree.clone(), &sorter).unwrap();
        let twice =
            merge_changes_into_tree(&[add("/ws/a.md"), add("/ws/a.md")], tree, &sorter).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn add_without_parent_fails() {
        let tree = dir("/ws", vec![]);
        let sorter = Sorter::default();

        let err =
            merge_changes_into_tree(&[add("/ws/missing/a.md")], tree.clone(), &sorter).unwrap_err();
        assert!(matches!(err, MergeError::ParentNotFound { .. }));

        // A failed change leaves the tree untouched.
        let mut unchanged = tree.clone();
        let result = apply_change(&mut unchanged, &add("/ws/missing/a.md"), &sorter);
        assert!(result.is_err());
        assert_eq!(unchanged, tree);
    }

    #[test]
    fn add_under_file_fails() {
        let tree = dir("/ws", vec![file("/ws/a.md")]);
        let sorter = Sorter::default();

        let err = merge_changes_into_tree(&[add("/ws/a.md/b.md")], tree, &sorter).unwrap_err();
        assert!(matches!(err, MergeError::NotADirectory { .. }));
    }

    #[test]
    fn unlink_removes_child() {
        let tree = dir("/ws", vec![file("/ws/a.md"), file("/ws/b.md")]);
        let sorter = Sorter::default();

        let tree = merge_changes_into_tree(&[unlink("/ws/a.md")], tree, &sorter).unwrap();
        assert_eq!(child_names(&tree), vec!["b.md"]);
    }

    #[test]
    fn unlink_missing_child_fails() {
        let tree = dir("/ws", vec![]);
        let sorter = Sorter::default();

        let err = merge_changes_into_tree(&[unlink("/ws/a.md")], tree, &sorter).unwrap_err();
        assert!(matches!(err, MergeError::ChildNotFound { .. }));
    }

    #[test]
    fn merge_is_order_sensitive() {
        let sorter = Sorter::default();
        let tree = dir("/ws", vec![file("/ws/a.md")]);

        // Unlink then add: the original is gone, the replacement present.
        let replaced = merge_changes_into_tree(
            &[unlink("/ws/a.md"), add("/ws/a2.md")],
            tree.clone(),
            &sorter,
        )
        .unwrap();
        assert_eq!(child_names(&replaced), vec!["a2.md"]);

        // Reversed: both exist momentarily, then the original is removed.
        // Same end state here, but the intermediate tree differs, which is
        // exactly why batches must never be reordered.
        let mut intermediate = tree.clone();
        apply_change(&mut intermediate, &add("/ws/a2.md"), &sorter).unwrap();
        assert_eq!(child_names(&intermediate), vec!["a.md", "a2.md"]);
        apply_change(&mut intermediate, &unlink("/ws/a.md"), &sorter).unwrap();
        assert_eq!(child_names(&intermediate), vec!["a2.md"]);
    }

    #[test]
    fn change_of_root_directory_preserves_children() {
        let tree = dir("/ws", vec![file("/ws/a.md"), file("/ws/b.md")]);
        let sorter = Sorter::default();

        // Shallow reload of the root, as the loader would produce it.
        let change = ChangeDescriptor::Change {
            path: PathBuf::from("/ws"),
            descriptor: dir("/ws", vec![]),
        };

        let tree = merge_changes_into_tree(&[change], tree, &sorter).unwrap();
        assert_eq!(child_names(&tree), vec!["a.md", "b.md"]);
    }

    #[test]
    fn change_of_root_to_file_replaces_wholesale() {
        let tree = dir("/ws", vec![file("/ws/a.md")]);
        let sorter = Sorter::default();

        let change = ChangeDescriptor::Change {
            path: PathBuf::from("/ws"),
            descriptor: file("/ws"),
        };

        let tree = merge_changes_into_tree(&[change], tree, &sorter).unwrap();
        assert!(!tree.is_dir());
    }

    #[test]
    fn change_of_nested_directory_carries_children_and_position() {
        let tree = dir(
            "/ws",
            vec![
                dir("/ws/sub", vec![file("/ws/sub/inner.md")]),
                file("/ws/a.md"),
            ],
        );
        let sorter = Sorter::default();

        let change = ChangeDescriptor::Change {
            path: PathBuf::from("/ws/sub"),
            descriptor: dir("/ws/sub", vec![]),
        };

        let tree = merge_changes_into_tree(&[change], tree, &sorter).unwrap();
        assert_eq!(child_names(&tree), vec!["sub", "a.md"]);

        let sub = tree.find(Path::new("/ws/sub")).unwrap();
        assert_eq!(
            sub.as_dir().unwrap().children[0].path(),
            Path::new("/ws/sub/inner.md")
        );
    }

    #[test]
    fn change_of_missing_child_fails() {
        let tree = dir("/ws", vec![]);
        let sorter = Sorter::default();

        let change = ChangeDescriptor::Change {
            path: PathBuf::from("/ws/a.md"),
            descriptor: file("/ws/a.md"),
        };

        let err = merge_changes_into_tree(&[change], tree, &sorter).unwrap_err();
        assert!(matches!(err, MergeError::ChildNotFound { .. }));
    }

    #[test]
    fn change_of_file_updates_in_place() {
        let tree = dir("/ws", vec![file("/ws/a.md"), file("/ws/b.md")]);
        let sorter = Sorter::default();

        let mut updated = file("/ws/a.md");
        if let Descriptor::File(f) = &mut updated {
            f.tags = vec!["updated".to_owned()];
        }
        let change = ChangeDescriptor::Change {
            path: PathBuf::from("/ws/a.md"),
            descriptor: updated,
        };

        let tree = merge_changes_into_tree(&[change], tree, &sorter).unwrap();
        let a = tree.find(Path::new("/ws/a.md")).unwrap();
        assert_eq!(a.as_file().unwrap().tags, vec!["updated".to_owned()]);
    }
}

//! Turning filesystem paths into descriptors.
//!
//! The engine never reads the disk directly; it asks a [`PathLoader`] for a
//! snapshot of a path. The default [`WorkspaceLoader`] understands Markdown
//! files and extracts the metadata the auxiliary indices are built from.

use std::io;
use std::path::Path;

use thiserror::Error;
use watchfs::{IoResultExt, Vfs};

use crate::descriptor::{Descriptor, DirDescriptor, FileDescriptor};
use crate::sorter::SortMode;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Produces a descriptor snapshot for a path.
///
/// `shallow` controls directory loading: a shallow load returns the directory
/// with an empty child list, which is what the change processor wants when it
/// folds a single event. The initial load of a root is deep.
pub trait PathLoader: Send + Sync + 'static {
    fn load(&self, vfs: &Vfs, path: &Path, shallow: bool) -> Result<Descriptor, LoaderError>;
}

/// The default loader: plain descriptors for directories and unknown files,
/// link/tag/id/title extraction for Markdown.
///
/// Entries whose names start with a dot are skipped, as are children that
/// fail to load (logged and dropped rather than failing the whole directory).
#[derive(Debug, Default)]
pub struct WorkspaceLoader;

impl PathLoader for WorkspaceLoader {
    fn load(&self, vfs: &Vfs, path: &Path, shallow: bool) -> Result<Descriptor, LoaderError> {
        // Shallow loads serve single watcher events; a path that vanished
        // between the notification and the load must fail so the caller
        // drops the event instead of folding a phantom entry.
        if shallow {
            let meta = vfs.metadata(path)?;
            return self.load_with_meta(vfs, path, meta, true);
        }

        match vfs.metadata(path).with_not_found()? {
            Some(meta) => self.load_with_meta(vfs, path, meta, false),
            // An opened root whose backing directory is gone is represented
            // as a missing directory rather than an error.
            None => Ok(Descriptor::Directory(DirDescriptor {
                path: path.to_path_buf(),
                dir: parent_of(path),
                name: name_of(path),
                sorting: SortMode::default(),
                modtime: 0,
                creationtime: 0,
                missing: true,
                children: Vec::new(),
            })),
        }
    }
}

impl WorkspaceLoader {
    fn load_with_meta(
        &self,
        vfs: &Vfs,
        path: &Path,
        meta: watchfs::Metadata,
        shallow: bool,
    ) -> Result<Descriptor, LoaderError> {
        if meta.is_dir() {
            let children = if shallow {
                Vec::new()
            } else {
                self.load_children(vfs, path)?
            };

            Ok(Descriptor::Directory(DirDescriptor {
                path: path.to_path_buf(),
                dir: parent_of(path),
                name: name_of(path),
                sorting: SortMode::default(),
                modtime: meta.modified_ms(),
                creationtime: meta.created_ms(),
                missing: false,
                children,
            }))
        } else {
            let mut descriptor = FileDescriptor {
                path: path.to_path_buf(),
                dir: parent_of(path),
                name: name_of(path),
                title: None,
                links: Vec::new(),
                tags: Vec::new(),
                id: String::new(),
                modtime: meta.modified_ms(),
                creationtime: meta.created_ms(),
            };

            if is_markdown(path) {
                let contents = vfs.read_to_string(path)?;
                descriptor.title = extract_title(&contents);
                descriptor.links = extract_links(&contents);
                descriptor.tags = extract_tags(&contents);
                descriptor.id = extract_id(&contents).unwrap_or_default();
            }

            Ok(Descriptor::File(descriptor))
        }
    }

    fn load_children(&self, vfs: &Vfs, path: &Path) -> Result<Vec<Descriptor>, LoaderError> {
        let mut children = Vec::new();

        for entry in vfs.read_dir(path)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("skipping unreadable entry in {}: {}", path.display(), err);
                    continue;
                }
            };

            if name_of(entry.path()).starts_with('.') {
                continue;
            }

            // Children load strictly: an entry disappearing mid-scan errors
            // and is skipped here rather than turning into a phantom missing
            // directory. The watcher will deliver the matching unlink anyway.
            let loaded = vfs
                .metadata(entry.path())
                .map_err(LoaderError::from)
                .and_then(|meta| self.load_with_meta(vfs, entry.path(), meta, false));

            match loaded {
                Ok(child) => children.push(child),
                Err(err) => {
                    log::warn!("skipping {}: {}", entry.path().display(), err);
                }
            }
        }

        Ok(children)
    }
}

fn parent_of(path: &Path) -> std::path::PathBuf {
    path.parent().unwrap_or(Path::new("")).to_path_buf()
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_markdown(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("md") | Some("markdown")
    )
}

/// Extracts wiki-style `[[target]]` links. An alias after `|` is not part of
/// the target.
fn extract_links(contents: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = contents;

    while let Some(start) = rest.find("[[") {
        rest = &rest[start + 2..];
        let Some(end) = rest.find("]]") else { break };
        let inner = &rest[..end];
        rest = &rest[end + 2..];

        if inner.is_empty() || inner.contains('\n') {
            continue;
        }
        let target = inner.split('|').next().unwrap_or(inner).trim();
        if !target.is_empty() {
            links.push(target.to_owned());
        }
    }

    links
}

/// Extracts `#tag` occurrences. A `#` counts as a tag marker only at the
/// start of a line or after whitespace, and only when followed by a non-space
/// character, so Markdown headings (`# Title`) are not tags.
fn extract_tags(contents: &str) -> Vec<String> {
    let mut tags = Vec::new();

    for line in contents.lines() {
        let mut prev_is_boundary = true;
        let mut chars = line.char_indices().peekable();

        while let Some((index, c)) = chars.next() {
            if c == '#' && prev_is_boundary {
                let tag_start = index + 1;
                let tag_end = line[tag_start..]
                    .find(|c: char| !is_tag_char(c))
                    .map(|offset| tag_start + offset)
                    .unwrap_or(line.len());
                let tag = &line[tag_start..tag_end];
                if !tag.is_empty() {
                    tags.push(tag.to_owned());
                }
                // Skip past the tag body.
                while let Some((i, _)) = chars.peek() {
                    if *i < tag_end {
                        chars.next();
                    } else {
                        break;
                    }
                }
                prev_is_boundary = false;
            } else {
                prev_is_boundary = c.is_whitespace();
            }
        }
    }

    tags.sort();
    tags.dedup();
    tags
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '/')
}

/// Extracts the first 14-digit identifier, the timestamp-style id scheme
/// (`YYYYMMDDhhmmss`).
fn extract_id(contents: &str) -> Option<String> {
    let bytes = contents.as_bytes();
    let mut run_start = None;

    for (index, byte) in bytes.iter().enumerate() {
        if byte.is_ascii_digit() {
            run_start.get_or_insert(index);
        } else {
            if let Some(start) = run_start.take() {
                if index - start == 14 {
                    return Some(contents[start..index].to_owned());
                }
            }
        }
    }

    if let Some(start) = run_start {
        if bytes.len() - start == 14 {
            return Some(contents[start..].to_owned());
        }
    }

    None
}

/// Extracts a display title: the `title:` entry of a leading YAML frontmatter
/// block if there is one, otherwise the first level-one heading.
fn extract_title(contents: &str) -> Option<String> {
    let mut lines = contents.lines();

    if let Some(first) = lines.clone().next() {
        if first.trim_end() == "---" {
            for line in lines.by_ref().skip(1) {
                if line.trim_end() == "---" {
                    break;
                }
                if let Some(value) = line.strip_prefix("title:") {
                    let value = value.trim().trim_matches('"').trim_matches('\'');
                    if !value.is_empty() {
                        return Some(value.to_owned());
                    }
                }
            }
        }
    }

    contents
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|heading| heading.trim().to_owned())
        .filter(|heading| !heading.is_empty())
}

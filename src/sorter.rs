//! Pluggable ordering for a directory's children.
//!
//! Every directory carries its own [`SortMode`]; the [`Sorter`] closes over
//! the user-level preferences (folders first, display name source, locale,
//! which timestamp "time" means) and turns a mode into a concrete ordering.

use std::cmp::Ordering;
use std::mem;

use serde::{Deserialize, Serialize};

use crate::descriptor::Descriptor;

/// How a single directory orders its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortMode {
    #[default]
    NameAscending,
    NameDescending,
    TimeAscending,
    TimeDescending,
}

/// Which name is compared when sorting by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayMode {
    /// Compare raw file names.
    #[default]
    Filename,
    /// Compare a file's extracted title when it has one, its file name
    /// otherwise. Directories always compare by name.
    Title,
}

/// Which descriptor timestamp time-based sorting reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeField {
    #[default]
    Modtime,
    Creationtime,
}

/// A comparator factory closed over the user's sort preferences.
///
/// `sort` never mutates its input in place; it consumes the child list and
/// returns a new ordering that the caller assigns back onto the owning
/// directory. The underlying sort is stable, so sorting an already-sorted
/// list is a no-op.
#[derive(Debug, Clone)]
pub struct Sorter {
    /// Group directories ahead of files as the primary key.
    pub folders_first: bool,
    pub display_mode: DisplayMode,
    /// BCP 47 tag of the user's language, carried with the preferences.
    /// Name comparison is currently locale-independent (Unicode case folding
    /// plus numeric-run comparison).
    pub locale: String,
    pub time_field: TimeField,
}

impl Default for Sorter {
    fn default() -> Self {
        Self {
            folders_first: true,
            display_mode: DisplayMode::default(),
            locale: "en-US".to_owned(),
            time_field: TimeField::default(),
        }
    }
}

impl Sorter {
    /// Returns the children reordered according to `mode` and this sorter's
    /// preferences.
    pub fn sort(&self, mut children: Vec<Descriptor>, mode: SortMode) -> Vec<Descriptor> {
        children.sort_by(|a, b| self.compare(a, b, mode));
        children
    }

    fn compare(&self, a: &Descriptor, b: &Descriptor, mode: SortMode) -> Ordering {
        if self.folders_first {
            match (a.is_dir(), b.is_dir()) {
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                _ => {}
            }
        }

        match mode {
            SortMode::NameAscending => self.compare_names(a, b),
            SortMode::NameDescending => self.compare_names(a, b).reverse(),
            SortMode::TimeAscending => self.compare_times(a, b),
            SortMode::TimeDescending => self.compare_times(a, b).reverse(),
        }
    }

    fn compare_names(&self, a: &Descriptor, b: &Descriptor) -> Ordering {
        natural_compare(self.display_name(a), self.display_name(b))
    }

    fn compare_times(&self, a: &Descriptor, b: &Descriptor) -> Ordering {
        let (ta, tb) = match self.time_field {
            TimeField::Modtime => (a.modtime(), b.modtime()),
            TimeField::Creationtime => (a.creationtime(), b.creationtime()),
        };
        // Equal timestamps fall back to names so the order stays total.
        ta.cmp(&tb).then_with(|| self.compare_names(a, b))
    }

    fn display_name<'a>(&self, descriptor: &'a Descriptor) -> &'a str {
        if self.display_mode == DisplayMode::Title {
            if let Some(file) = descriptor.as_file() {
                if let Some(title) = &file.title {
                    return title;
                }
            }
        }
        descriptor.name()
    }
}

/// Re-sorts every directory in the subtree with the given sorter.
///
/// Each directory is sorted independently as it is loaded, so a preference
/// change has to walk the whole snapshot.
pub fn resort_tree(tree: &mut Descriptor, sorter: &Sorter) {
    if let Descriptor::Directory(dir) = tree {
        let children = mem::take(&mut dir.children);
        dir.children = sorter.sort(children, dir.sorting);
        for child in &mut dir.children {
            resort_tree(child, sorter);
        }
    }
}

/// Natural comparison: runs of ascii digits compare numerically, everything
/// else compares case-insensitively. Falls back to a case-sensitive
/// comparison to keep the ordering total.
fn natural_compare(a: &str, b: &str) -> Ordering {
    natural_compare_folded(a, b).then_with(|| a.cmp(b))
}

fn natural_compare_folded(a: &str, b: &str) -> Ordering {
    let mut a_rest = a;
    let mut b_rest = b;

    loop {
        match (a_rest.chars().next(), b_rest.chars().next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ac), Some(bc)) => {
                if ac.is_ascii_digit() && bc.is_ascii_digit() {
                    let (a_num, a_tail) = split_digit_run(a_rest);
                    let (b_num, b_tail) = split_digit_run(b_rest);
                    match compare_digit_runs(a_num, b_num) {
                        Ordering::Equal => {
                            a_rest = a_tail;
                            b_rest = b_tail;
                        }
                        other => return other,
                    }
                } else {
                    match ac.to_lowercase().cmp(bc.to_lowercase()) {
                        Ordering::Equal => {
                            a_rest = &a_rest[ac.len_utf8()..];
                            b_rest = &b_rest[bc.len_utf8()..];
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn split_digit_run(s: &str) -> (&str, &str) {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s.split_at(end)
}

/// Compares two ascii digit runs numerically without parsing, so arbitrarily
/// long runs cannot overflow.
fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

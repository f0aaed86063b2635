//! The table mapping container-side ("inside") paths to host-side
//! ("outside") paths.
//!
//! Entries are kept sorted by descending inside-path length so that the
//! longest matching prefix wins a plain linear scan. Only absolute paths are
//! translated; relative paths pass through untouched.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// How requests under a table entry are treated by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    /// Outside any mapped region; operate on the path as given.
    Untranslated,
    /// A host subtree shown to the container; ownership of the invoker's
    /// own files is reported as the interior identity.
    Mapped,
    /// The forged root subtree; ownership and mode come from sidecar files.
    Emulated,
}

#[derive(Debug, Clone)]
pub struct MapEntry {
    pub attr: AttrType,
    pub inside: String,
    pub outside: String,
}

#[derive(Debug, Clone, Default)]
pub struct PathMap {
    entries: Vec<MapEntry>,
}

fn canonicalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() }
}

fn prefix_matches(prefix: &str, path: &[u8]) -> bool {
    let p = prefix.as_bytes();
    if prefix.ends_with('/') {
        return path.starts_with(p);
    }
    path == p || (path.starts_with(p) && path.get(p.len()) == Some(&b'/'))
}

impl PathMap {
    pub fn new() -> PathMap {
        PathMap::default()
    }

    /// Inserts a mapping, keeping the longest inside paths first. Trailing
    /// slashes are stripped on insertion (except for the root itself).
    pub fn add_mapping(&mut self, attr: AttrType, inside: &str, outside: &str) {
        let entry = MapEntry {
            attr,
            inside: canonicalize(inside),
            outside: canonicalize(outside),
        };
        let at = self
            .entries
            .iter()
            .position(|e| e.inside.len() < entry.inside.len())
            .unwrap_or(self.entries.len());
        self.entries.insert(at, entry);
    }

    /// The entry governing `path`, if any. Relative paths never match.
    pub fn entry_for(&self, path: &Path) -> Option<&MapEntry> {
        let bytes = path.as_os_str().as_bytes();
        if bytes.first() != Some(&b'/') {
            return None;
        }
        self.entries.iter().find(|e| prefix_matches(&e.inside, bytes))
    }

    pub fn classify(&self, path: &Path) -> AttrType {
        self.entry_for(path).map_or(AttrType::Untranslated, |e| e.attr)
    }

    /// Replaces the matched inside prefix with the entry's outside path,
    /// collapsing the slashes at the seam to exactly one.
    pub fn translate_with(entry: &MapEntry, path: &Path) -> PathBuf {
        let bytes = path.as_os_str().as_bytes();
        let suffix = &bytes[entry.inside.len().min(bytes.len())..];
        let suffix: &[u8] = {
            let mut s = suffix;
            while s.first() == Some(&b'/') {
                s = &s[1..];
            }
            s
        };
        let mut out = entry.outside.as_bytes().to_vec();
        if !suffix.is_empty() {
            if out.last() != Some(&b'/') {
                out.push(b'/');
            }
            out.extend_from_slice(suffix);
        }
        if out.is_empty() {
            out.push(b'/');
        }
        PathBuf::from(OsString::from_vec(out))
    }

    pub fn translate(&self, path: &Path) -> PathBuf {
        match self.entry_for(path) {
            Some(entry) => Self::translate_with(entry, path),
            None => path.to_path_buf(),
        }
    }
}

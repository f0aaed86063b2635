//! UID/GID translation across the user-namespace boundary.
//!
//! A map is an ordered list of `(inner, outer, count)` ranges. Lookup in
//! either direction answers the translated id on a hit and the kernel's
//! overflow id on a miss, the same value an unmapped id shows up as inside
//! the namespace.

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use nix::unistd::{self, Uid};

/// nobody/nogroup, the kernel's default `overflowuid`.
pub const OVERFLOW_ID: u32 = 65534;

/// Width of the range installed by automatic subordinate-id mapping.
pub const AUTO_RANGE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub inner: u32,
    pub outer: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    ranges: Vec<IdRange>,
}

impl IdMap {
    pub fn new() -> IdMap {
        IdMap::default()
    }

    /// The single-id map `(inner, outer, 1)` installed when no explicit
    /// ranges are given.
    pub fn single(inner: u32, outer: u32) -> IdMap {
        let mut map = IdMap::new();
        map.add(inner, outer, 1);
        map
    }

    pub fn add(&mut self, inner: u32, outer: u32, count: u32) -> &mut Self {
        self.ranges.push(IdRange { inner, outer, count });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[IdRange] {
        &self.ranges
    }

    /// Inner id to outer id; `OVERFLOW_ID` when no range covers `inner`.
    pub fn lookup(&self, inner: u32) -> u32 {
        for r in &self.ranges {
            if inner.wrapping_sub(r.inner) < r.count {
                return r.outer + (inner - r.inner);
            }
        }
        OVERFLOW_ID
    }

    /// Outer id to inner id; `OVERFLOW_ID` when no range covers `outer`.
    pub fn inverse_lookup(&self, outer: u32) -> u32 {
        for r in &self.ranges {
            if outer.wrapping_sub(r.outer) < r.count {
                return r.inner + (outer - r.outer);
            }
        }
        OVERFLOW_ID
    }

    /// Whether some range covers the inner id `inner`.
    pub fn covers_inner(&self, inner: u32) -> bool {
        self.ranges.iter().any(|r| inner.wrapping_sub(r.inner) < r.count)
    }

    /// A map the invoker may write to `/proc/<pid>/{uid,gid}_map` itself:
    /// one range, one id, and the outer id is the invoker's own.
    pub fn directly_writable(&self, invoker: u32) -> bool {
        matches!(self.ranges.as_slice(),
                 [IdRange { outer, count: 1, .. }] if *outer == invoker)
    }

    /// Argument list for `newuidmap`/`newgidmap`: `inner outer count` per range.
    pub fn helper_args(&self) -> Vec<String> {
        self.ranges
            .iter()
            .flat_map(|r| [r.inner.to_string(), r.outer.to_string(), r.count.to_string()])
            .collect()
    }

    /// Content for a direct `/proc/<pid>/{uid,gid}_map` write.
    pub fn map_file(&self) -> String {
        self.ranges
            .iter()
            .map(|r| format!("{} {} {}\n", r.inner, r.outer, r.count))
            .collect()
    }
}

/// Names under which the invoker may appear in `/etc/sub{u,g}id`: the passwd
/// names of the real and effective uid, plus the numeric ids themselves
/// (subid files accept either form).
pub fn invoker_subid_names() -> Vec<String> {
    let mut names = Vec::new();
    let mut ids = vec![unistd::getuid()];
    if unistd::geteuid() != unistd::getuid() {
        ids.push(unistd::geteuid());
    }
    for id in ids {
        if let Ok(Some(user)) = unistd::User::from_uid(Uid::from_raw(id.as_raw())) {
            if !names.contains(&user.name) {
                names.push(user.name);
            }
        }
        let numeric = id.as_raw().to_string();
        if !names.contains(&numeric) {
            names.push(numeric);
        }
    }
    names
}

/// Scans a subordinate-id file for the first range belonging to one of
/// `names` that is wide enough for a full automatic mapping, and returns it
/// as `(0, start, AUTO_RANGE)`.
pub fn automatic_range(path: &Path, names: &[String]) -> io::Result<Option<IdRange>> {
    let file = fs::File::open(path)?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let (Some(name), Some(start), Some(count)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !names.iter().any(|n| n == name) {
            continue;
        }
        let (Ok(start), Ok(count)) = (start.parse::<u32>(), count.parse::<u32>()) else {
            continue;
        };
        if count >= AUTO_RANGE {
            return Ok(Some(IdRange { inner: 0, outer: start, count: AUTO_RANGE }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_args_order() {
        let mut map = IdMap::new();
        map.add(0, 1000, 1).add(1, 100000, 65536);
        assert_eq!(
            map.helper_args(),
            ["0", "1000", "1", "1", "100000", "65536"]
        );
    }

    #[test]
    fn map_file_lines() {
        let mut map = IdMap::new();
        map.add(0, 1000, 1).add(1, 100000, 65536);
        assert_eq!(map.map_file(), "0 1000 1\n1 100000 65536\n");
    }

    #[test]
    fn direct_write_predicate() {
        assert!(IdMap::single(0, 1000).directly_writable(1000));
        assert!(!IdMap::single(0, 1000).directly_writable(1001));
        let mut multi = IdMap::single(0, 1000);
        multi.add(1, 100000, 65536);
        assert!(!multi.directly_writable(1000));
        let mut wide = IdMap::new();
        wide.add(0, 1000, 2);
        assert!(!wide.directly_writable(1000));
    }
}

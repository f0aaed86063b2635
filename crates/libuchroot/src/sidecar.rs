//! Sidecar files holding forged ownership and permission bits.
//!
//! A directory `D` keeps its own attributes in `D/.erlent`; a non-directory
//! entry `D/name` keeps them in `D/.erlent.name`. The content is three
//! big-endian 32-bit words: uid, gid, mode. Only the setuid/setgid/sticky
//! and rwx bits of the mode are significant. A missing sidecar is not an
//! error; defaults are derived from the entry on disk.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub const SIDECAR_PREFIX: &str = ".erlent";

/// The mode bits a sidecar can forge.
pub const ATTR_MASK: u32 = (libc::S_ISUID
    | libc::S_ISGID
    | libc::S_ISVTX
    | libc::S_IRWXU
    | libc::S_IRWXG
    | libc::S_IRWXO) as u32;

/// Mode given to the real file behind an emulated create.
pub const FILE_MODE: u32 = 0o600;
/// Mode given to the real directory behind an emulated mkdir.
pub const DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attrs {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

pub fn kind_of_mode(mode: u32) -> EntryKind {
    if mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
        EntryKind::Dir
    } else {
        EntryKind::File
    }
}

/// Parent directory of `pathname`; `/` for top-level paths. Assumes the
/// path does not end with `/`.
pub fn dir_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("/"),
    }
}

pub fn file_of(path: &Path) -> &OsStr {
    path.file_name().unwrap_or_else(|| OsStr::new(""))
}

/// The sidecar location for `path`, given what kind of entry it is.
pub fn sidecar_path(path: &Path, kind: EntryKind) -> PathBuf {
    match kind {
        EntryKind::Dir => path.join(SIDECAR_PREFIX),
        EntryKind::File => {
            let mut name = OsString::from(format!("{SIDECAR_PREFIX}."));
            name.push(file_of(path));
            dir_of(path).join(name)
        }
    }
}

/// Whether a directory entry name belongs to the sidecar namespace and must
/// be hidden from readdir.
pub fn is_sidecar_name(name: &OsStr) -> bool {
    name.as_bytes().starts_with(SIDECAR_PREFIX.as_bytes())
}

/// Whether a path's basename may never be addressed from inside the
/// container: the directory sidecar itself, or any `.erlent.<name>` file.
pub fn is_guarded_path(path: &Path) -> bool {
    let name = file_of(path).as_bytes();
    name == SIDECAR_PREFIX.as_bytes()
        || name.starts_with(format!("{SIDECAR_PREFIX}.").as_bytes())
}

impl Attrs {
    pub fn encode(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.uid.to_be_bytes());
        buf[4..8].copy_from_slice(&self.gid.to_be_bytes());
        buf[8..12].copy_from_slice(&self.mode.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; 12]) -> Attrs {
        Attrs {
            uid: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            gid: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            mode: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// Reads the forged attributes of `path`. When the sidecar does not exist
/// the defaults are root-owned with the on-disk permission bits, taken from
/// `lstat` of the entry itself.
pub fn read_attrs(path: &Path, kind: EntryKind) -> io::Result<Attrs> {
    match fs::File::open(sidecar_path(path, kind)) {
        Ok(mut file) => {
            let mut buf = [0u8; 12];
            file.read_exact(&mut buf)?;
            Ok(Attrs::decode(&buf))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let meta = fs::symlink_metadata(path)?;
            Ok(Attrs {
                uid: 0,
                gid: 0,
                mode: meta.permissions().mode() & ATTR_MASK,
            })
        }
        Err(e) => Err(e),
    }
}

/// Writes (creating if necessary) the sidecar of `path`. The stored mode is
/// masked down to the forgeable bits.
pub fn write_attrs(path: &Path, kind: EntryKind, attrs: &Attrs) -> io::Result<()> {
    let masked = Attrs { mode: attrs.mode & ATTR_MASK, ..*attrs };
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(sidecar_path(path, kind))?;
    file.write_all(&masked.encode())
}

/// Removes the sidecar of `path`, treating "already gone" as success.
pub fn remove_attrs(path: &Path, kind: EntryKind) -> io::Result<()> {
    match fs::remove_file(sidecar_path(path, kind)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Number of directory entries that are visible from inside, i.e. everything
/// `read_dir` yields except sidecars. Used to synthesize directory sizes.
pub fn visible_entry_count(dir: &Path) -> io::Result<u64> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !is_sidecar_name(&entry.file_name()) {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_naming() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/t/sub"), EntryKind::Dir),
            Path::new("/tmp/t/sub/.erlent")
        );
        assert_eq!(
            sidecar_path(Path::new("/tmp/t/file"), EntryKind::File),
            Path::new("/tmp/t/.erlent.file")
        );
        assert_eq!(
            sidecar_path(Path::new("/file"), EntryKind::File),
            Path::new("/.erlent.file")
        );
    }

    #[test]
    fn guarded_names() {
        assert!(is_guarded_path(Path::new("/a/.erlent")));
        assert!(is_guarded_path(Path::new("/a/.erlent.x")));
        assert!(!is_guarded_path(Path::new("/a/.erlentish")));
        assert!(!is_guarded_path(Path::new("/a/x")));
        assert!(is_sidecar_name(OsStr::new(".erlentish")));
    }

    #[test]
    fn encode_decode() {
        let attrs = Attrs { uid: 7, gid: 8, mode: 0o4755 };
        assert_eq!(Attrs::decode(&attrs.encode()), attrs);
        assert_eq!(
            Attrs { uid: 1000, gid: 1000, mode: 0o644 }.encode(),
            [0, 0, 3, 232, 0, 0, 3, 232, 0, 0, 1, 0xa4]
        );
    }
}

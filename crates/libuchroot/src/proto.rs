//! The closed set of filesystem operation messages exchanged between the
//! overlay front-end and the request processor.
//!
//! Each operation is a numeric tag plus a payload record; shared payload
//! fragments (ownership, a second pathname) are named sub-records. A reply
//! carries a signed result -- `0` on success, a positive count where a count
//! is the answer, a negated errno on failure -- plus an optional typed body.
//!
//! `perform_locally` executes the already-path-translated operation with the
//! corresponding system call. The `serve` loop makes the same messages work
//! across a pipe to a remote executor.

use std::ffi::CString;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use nix::errno::Errno;
use thiserror::Error;

use crate::wire::{self, CodecError, Timespec};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The receiver cannot continue after a tag it does not know.
    #[error("unknown message tag {0}")]
    UnknownTag(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Op {
    Getattr = 0,
    Access = 1,
    Readdir = 2,
    Readlink = 3,
    Read = 4,
    Write = 5,
    Open = 6,
    Creat = 7,
    Mknod = 8,
    Truncate = 9,
    Chmod = 10,
    Chown = 11,
    Mkdir = 12,
    Unlink = 13,
    Rmdir = 14,
    Symlink = 15,
    Link = 16,
    Rename = 17,
    Utimens = 18,
    Statfs = 19,
}

impl Op {
    pub fn tag(self) -> u64 {
        self as u64
    }

    pub fn from_tag(tag: u64) -> Option<Op> {
        use Op::*;
        Some(match tag {
            0 => Getattr,
            1 => Access,
            2 => Readdir,
            3 => Readlink,
            4 => Read,
            5 => Write,
            6 => Open,
            7 => Creat,
            8 => Mknod,
            9 => Truncate,
            10 => Chmod,
            11 => Chown,
            12 => Mkdir,
            13 => Unlink,
            14 => Rmdir,
            15 => Symlink,
            16 => Link,
            17 => Rename,
            18 => Utimens,
            19 => Statfs,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use Op::*;
        match self {
            Getattr => "getattr",
            Access => "access",
            Readdir => "readdir",
            Readlink => "readlink",
            Read => "read",
            Write => "write",
            Open => "open",
            Creat => "creat",
            Mknod => "mknod",
            Truncate => "truncate",
            Chmod => "chmod",
            Chown => "chown",
            Mkdir => "mkdir",
            Unlink => "unlink",
            Rmdir => "rmdir",
            Symlink => "symlink",
            Link => "link",
            Rename => "rename",
            Utimens => "utimens",
            Statfs => "statfs",
        }
    }
}

/// The identity an operation should credit as the creator or new owner.
/// `u32::MAX` in either field means "no change", as with `chown(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Getattr { path: PathBuf },
    Access { path: PathBuf, mask: i32 },
    Readdir { path: PathBuf },
    Readlink { path: PathBuf },
    Read { path: PathBuf, size: u64, offset: i64 },
    Write { path: PathBuf, data: Vec<u8>, offset: i64 },
    Open { path: PathBuf, flags: i32, mode: u32 },
    Creat { path: PathBuf, owner: Owner, mode: u32 },
    Mknod { path: PathBuf, rdev: u64, owner: Owner, mode: u32 },
    Truncate { path: PathBuf, length: i64 },
    Chmod { path: PathBuf, mode: u32 },
    Chown { path: PathBuf, owner: Owner },
    Mkdir { path: PathBuf, owner: Owner, mode: u32 },
    Unlink { path: PathBuf },
    Rmdir { path: PathBuf },
    /// Creates the symlink `path` with content `target`. The target string
    /// is container-side data and is never path-translated.
    Symlink { target: PathBuf, path: PathBuf, owner: Owner },
    Link { path: PathBuf, path2: PathBuf },
    Rename { path: PathBuf, path2: PathBuf },
    Utimens { path: PathBuf, atime: Timespec, mtime: Timespec },
    Statfs { path: PathBuf },
}

/// The stat fields carried in a getattr reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatRecord {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl From<libc::stat> for StatRecord {
    fn from(st: libc::stat) -> StatRecord {
        StatRecord {
            ino: st.st_ino,
            mode: st.st_mode,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev,
            size: st.st_size,
            blksize: st.st_blksize as i64,
            blocks: st.st_blocks,
            atime: Timespec::new(st.st_atime, st.st_atime_nsec),
            mtime: Timespec::new(st.st_mtime, st.st_mtime_nsec),
            ctime: Timespec::new(st.st_ctime, st.st_ctime_nsec),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatfsRecord {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u64,
    pub namemax: u64,
    pub frsize: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplyBody {
    #[default]
    None,
    Stat(StatRecord),
    Names(Vec<std::ffi::OsString>),
    Target(std::ffi::OsString),
    Data(Vec<u8>),
    Statfs(StatfsRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub result: i32,
    pub body: ReplyBody,
}

impl Reply {
    pub fn new(result: i32) -> Reply {
        Reply { result, body: ReplyBody::None }
    }

    pub fn ok() -> Reply {
        Reply::new(0)
    }

    pub fn errno(err: Errno) -> Reply {
        Reply::new(-(err as i32))
    }

    pub fn is_ok(&self) -> bool {
        self.result >= 0
    }
}

impl Request {
    pub fn op(&self) -> Op {
        use Request::*;
        match self {
            Getattr { .. } => Op::Getattr,
            Access { .. } => Op::Access,
            Readdir { .. } => Op::Readdir,
            Readlink { .. } => Op::Readlink,
            Read { .. } => Op::Read,
            Write { .. } => Op::Write,
            Open { .. } => Op::Open,
            Creat { .. } => Op::Creat,
            Mknod { .. } => Op::Mknod,
            Truncate { .. } => Op::Truncate,
            Chmod { .. } => Op::Chmod,
            Chown { .. } => Op::Chown,
            Mkdir { .. } => Op::Mkdir,
            Unlink { .. } => Op::Unlink,
            Rmdir { .. } => Op::Rmdir,
            Symlink { .. } => Op::Symlink,
            Link { .. } => Op::Link,
            Rename { .. } => Op::Rename,
            Utimens { .. } => Op::Utimens,
            Statfs { .. } => Op::Statfs,
        }
    }

    /// The primary pathname. For symlink this is the new link itself, not
    /// the target string.
    pub fn path(&self) -> &Path {
        use Request::*;
        match self {
            Getattr { path }
            | Access { path, .. }
            | Readdir { path }
            | Readlink { path }
            | Read { path, .. }
            | Write { path, .. }
            | Open { path, .. }
            | Creat { path, .. }
            | Mknod { path, .. }
            | Truncate { path, .. }
            | Chmod { path, .. }
            | Chown { path, .. }
            | Mkdir { path, .. }
            | Unlink { path }
            | Rmdir { path }
            | Symlink { path, .. }
            | Link { path, .. }
            | Rename { path, .. }
            | Utimens { path, .. }
            | Statfs { path } => path,
        }
    }

    pub fn path_mut(&mut self) -> &mut PathBuf {
        use Request::*;
        match self {
            Getattr { path }
            | Access { path, .. }
            | Readdir { path }
            | Readlink { path }
            | Read { path, .. }
            | Write { path, .. }
            | Open { path, .. }
            | Creat { path, .. }
            | Mknod { path, .. }
            | Truncate { path, .. }
            | Chmod { path, .. }
            | Chown { path, .. }
            | Mkdir { path, .. }
            | Unlink { path }
            | Rmdir { path }
            | Symlink { path, .. }
            | Link { path, .. }
            | Rename { path, .. }
            | Utimens { path, .. }
            | Statfs { path } => path,
        }
    }

    /// The second pathname of link and rename, translated and guarded along
    /// with the first.
    pub fn second_path_mut(&mut self) -> Option<&mut PathBuf> {
        use Request::*;
        match self {
            Link { path2, .. } | Rename { path2, .. } => Some(path2),
            _ => None,
        }
    }

    pub fn second_path(&self) -> Option<&Path> {
        use Request::*;
        match self {
            Link { path2, .. } | Rename { path2, .. } => Some(path2.as_path()),
            _ => None,
        }
    }

    /// The identity payload of the operations that carry one.
    pub fn owner_mut(&mut self) -> Option<&mut Owner> {
        use Request::*;
        match self {
            Creat { owner, .. }
            | Mknod { owner, .. }
            | Chown { owner, .. }
            | Mkdir { owner, .. }
            | Symlink { owner, .. } => Some(owner),
            _ => None,
        }
    }
}

fn cpath(path: &Path) -> Result<CString, Reply> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Reply::errno(Errno::EINVAL))
}

fn io_result(e: &io::Error) -> i32 {
    -(e.raw_os_error().unwrap_or(libc::EIO))
}

fn last_errno() -> Reply {
    Reply::errno(Errno::last())
}

/// Executes the operation on the host filesystem. Paths are expected to be
/// translated already; no policy (sidecars, identity mapping, guards) is
/// applied here.
pub fn perform_locally(req: &Request) -> Reply {
    use Request::*;
    match req {
        Getattr { path } => match nix::sys::stat::lstat(path.as_path()) {
            Ok(st) => Reply { result: 0, body: ReplyBody::Stat(StatRecord::from(st)) },
            Err(e) => Reply::errno(e),
        },
        Access { path, mask } => {
            let flags = nix::unistd::AccessFlags::from_bits_truncate(*mask);
            match nix::unistd::access(path.as_path(), flags) {
                Ok(()) => Reply::ok(),
                Err(e) => Reply::errno(e),
            }
        }
        Readdir { path } => match fs::read_dir(path) {
            Ok(iter) => {
                let mut names = vec![".".into(), "..".into()];
                for entry in iter {
                    match entry {
                        Ok(entry) => names.push(entry.file_name()),
                        Err(e) => return Reply::new(io_result(&e)),
                    }
                }
                Reply { result: 0, body: ReplyBody::Names(names) }
            }
            Err(e) => Reply::new(io_result(&e)),
        },
        Readlink { path } => match nix::fcntl::readlink(path.as_path()) {
            Ok(target) => Reply { result: 0, body: ReplyBody::Target(target) },
            Err(e) => Reply::errno(e),
        },
        Read { path, size, offset } => match fs::File::open(path) {
            Ok(file) => {
                let mut buf = vec![0u8; *size as usize];
                match file.read_at(&mut buf, *offset as u64) {
                    Ok(n) => {
                        buf.truncate(n);
                        Reply { result: n as i32, body: ReplyBody::Data(buf) }
                    }
                    Err(e) => Reply::new(io_result(&e)),
                }
            }
            Err(e) => Reply::new(io_result(&e)),
        },
        Write { path, data, offset } => {
            match fs::OpenOptions::new().write(true).open(path) {
                Ok(file) => match file.write_all_at(data, *offset as u64) {
                    Ok(()) => Reply::new(data.len() as i32),
                    Err(e) => Reply::new(io_result(&e)),
                },
                Err(e) => Reply::new(io_result(&e)),
            }
        }
        Open { path, flags, mode } => {
            // Probes reachability under the given flags; the data path goes
            // through read/write requests, so the descriptor is not kept.
            let path = match cpath(path) {
                Ok(p) => p,
                Err(r) => return r,
            };
            let fd = unsafe { libc::open(path.as_ptr(), *flags, *mode as libc::c_uint) };
            if fd == -1 {
                return last_errno();
            }
            unsafe { libc::close(fd) };
            Reply::ok()
        }
        Creat { path, mode, .. } => {
            let cp = match cpath(path) {
                Ok(p) => p,
                Err(r) => return r,
            };
            let fd = unsafe {
                libc::open(
                    cp.as_ptr(),
                    libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
                    *mode as libc::c_uint,
                )
            };
            if fd == -1 {
                return last_errno();
            }
            unsafe { libc::close(fd) };
            // open() honors the umask; put the requested bits in place.
            if unsafe { libc::chmod(cp.as_ptr(), *mode as libc::mode_t) } == -1 {
                return last_errno();
            }
            Reply::ok()
        }
        Mknod { path, rdev, mode, .. } => {
            let cp = match cpath(path) {
                Ok(p) => p,
                Err(r) => return r,
            };
            if unsafe { libc::mknod(cp.as_ptr(), *mode as libc::mode_t, *rdev as libc::dev_t) }
                == -1
            {
                return last_errno();
            }
            Reply::ok()
        }
        Truncate { path, length } => match nix::unistd::truncate(path.as_path(), *length) {
            Ok(()) => Reply::ok(),
            Err(e) => Reply::errno(e),
        },
        Chmod { path, mode } => {
            let cp = match cpath(path) {
                Ok(p) => p,
                Err(r) => return r,
            };
            if unsafe { libc::chmod(cp.as_ptr(), *mode as libc::mode_t) } == -1 {
                return last_errno();
            }
            Reply::ok()
        }
        Chown { path, owner } => {
            let cp = match cpath(path) {
                Ok(p) => p,
                Err(r) => return r,
            };
            if unsafe { libc::chown(cp.as_ptr(), owner.uid, owner.gid) } == -1 {
                return last_errno();
            }
            Reply::ok()
        }
        Mkdir { path, mode, .. } => {
            let cp = match cpath(path) {
                Ok(p) => p,
                Err(r) => return r,
            };
            if unsafe { libc::mkdir(cp.as_ptr(), *mode as libc::mode_t) } == -1 {
                return last_errno();
            }
            Reply::ok()
        }
        Unlink { path } => match nix::unistd::unlink(path.as_path()) {
            Ok(()) => Reply::ok(),
            Err(e) => Reply::errno(e),
        },
        Rmdir { path } => {
            let cp = match cpath(path) {
                Ok(p) => p,
                Err(r) => return r,
            };
            if unsafe { libc::rmdir(cp.as_ptr()) } == -1 {
                return last_errno();
            }
            Reply::ok()
        }
        Symlink { target, path, .. } => {
            let (ct, cp) = match (cpath(target), cpath(path)) {
                (Ok(t), Ok(p)) => (t, p),
                (Err(r), _) | (_, Err(r)) => return r,
            };
            if unsafe { libc::symlink(ct.as_ptr(), cp.as_ptr()) } == -1 {
                return last_errno();
            }
            Reply::ok()
        }
        Link { path, path2 } => {
            let (cp, cp2) = match (cpath(path), cpath(path2)) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(r), _) | (_, Err(r)) => return r,
            };
            if unsafe { libc::link(cp.as_ptr(), cp2.as_ptr()) } == -1 {
                return last_errno();
            }
            Reply::ok()
        }
        Rename { path, path2 } => {
            let (cp, cp2) = match (cpath(path), cpath(path2)) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(r), _) | (_, Err(r)) => return r,
            };
            if unsafe { libc::rename(cp.as_ptr(), cp2.as_ptr()) } == -1 {
                return last_errno();
            }
            Reply::ok()
        }
        Utimens { path, atime, mtime } => {
            let cp = match cpath(path) {
                Ok(p) => p,
                Err(r) => return r,
            };
            let times = [
                libc::timespec { tv_sec: atime.sec, tv_nsec: atime.nsec },
                libc::timespec { tv_sec: mtime.sec, tv_nsec: mtime.nsec },
            ];
            let res = unsafe {
                libc::utimensat(
                    libc::AT_FDCWD,
                    cp.as_ptr(),
                    times.as_ptr(),
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            };
            if res == -1 {
                return last_errno();
            }
            Reply::ok()
        }
        Statfs { path } => match nix::sys::statvfs::statvfs(path.as_path()) {
            Ok(vfs) => Reply {
                result: 0,
                body: ReplyBody::Statfs(StatfsRecord {
                    blocks: vfs.blocks() as u64,
                    bfree: vfs.blocks_free() as u64,
                    bavail: vfs.blocks_available() as u64,
                    files: vfs.files() as u64,
                    ffree: vfs.files_free() as u64,
                    bsize: vfs.block_size() as u64,
                    namemax: vfs.name_max() as u64,
                    frsize: vfs.fragment_size() as u64,
                }),
            },
            Err(e) => Reply::errno(e),
        },
    }
}

// Wire form. A request is its tag followed by the payload fields in
// declaration order; a reply is the signed result followed by the body the
// operation defines (stat record, name list, target, raw read data, statvfs
// record), present only on success.

fn write_path<W: Write>(w: &mut W, path: &Path) -> wire::Result<()> {
    wire::write_os_str(w, path.as_os_str())
}

fn read_path<R: Read>(r: &mut R) -> wire::Result<PathBuf> {
    Ok(PathBuf::from(wire::read_os_string(r)?))
}

fn write_owner<W: Write>(w: &mut W, owner: &Owner) -> wire::Result<()> {
    wire::write_u32(w, owner.uid)?;
    wire::write_u32(w, owner.gid)
}

fn read_owner<R: Read>(r: &mut R) -> wire::Result<Owner> {
    let uid = wire::read_u32(r)?;
    let gid = wire::read_u32(r)?;
    Ok(Owner { uid, gid })
}

impl Request {
    pub fn encode<W: Write>(&self, w: &mut W) -> wire::Result<()> {
        use Request::*;
        wire::write_u64(w, self.op().tag())?;
        match self {
            Getattr { path } | Readdir { path } | Readlink { path } | Unlink { path }
            | Rmdir { path } | Statfs { path } => write_path(w, path),
            Access { path, mask } => {
                write_path(w, path)?;
                wire::write_i32(w, *mask)
            }
            Read { path, size, offset } => {
                write_path(w, path)?;
                wire::write_u64(w, *size)?;
                wire::write_i64(w, *offset)
            }
            Write { path, data, offset } => {
                write_path(w, path)?;
                wire::write_bytes(w, data)?;
                wire::write_i64(w, *offset)
            }
            Open { path, flags, mode } => {
                write_path(w, path)?;
                wire::write_i32(w, *flags)?;
                wire::write_u32(w, *mode)
            }
            Creat { path, owner, mode } => {
                write_path(w, path)?;
                write_owner(w, owner)?;
                wire::write_u32(w, *mode)
            }
            Mknod { path, rdev, owner, mode } => {
                write_path(w, path)?;
                wire::write_u64(w, *rdev)?;
                write_owner(w, owner)?;
                wire::write_u32(w, *mode)
            }
            Truncate { path, length } => {
                write_path(w, path)?;
                wire::write_i64(w, *length)
            }
            Chmod { path, mode } => {
                write_path(w, path)?;
                wire::write_u32(w, *mode)
            }
            Chown { path, owner } => {
                write_path(w, path)?;
                write_owner(w, owner)
            }
            Mkdir { path, owner, mode } => {
                write_path(w, path)?;
                write_owner(w, owner)?;
                wire::write_u32(w, *mode)
            }
            Symlink { target, path, owner } => {
                write_path(w, target)?;
                write_path(w, path)?;
                write_owner(w, owner)
            }
            Link { path, path2 } | Rename { path, path2 } => {
                write_path(w, path)?;
                write_path(w, path2)
            }
            Utimens { path, atime, mtime } => {
                write_path(w, path)?;
                wire::write_timespec(w, *atime)?;
                wire::write_timespec(w, *mtime)
            }
        }
    }

    /// Decodes one request. A clean end of stream before the tag yields
    /// `None`; a short read anywhere later is an error.
    pub fn receive<R: Read>(r: &mut R) -> Result<Option<Request>, ProtoError> {
        let Some(first) = wire::read_byte_or_eof(r)? else {
            return Ok(None);
        };
        // The tag number's first byte is already in hand.
        let mut tag: u64 = 0;
        let mut byte = first;
        loop {
            match byte {
                0 => break,
                c @ b'0'..=b'9' => tag = tag.wrapping_mul(10).wrapping_add((c - b'0') as u64),
                _ => {}
            }
            byte = match wire::read_byte_or_eof(r)? {
                Some(b) => b,
                None => return Err(CodecError::UnexpectedEof.into()),
            };
        }
        let op = Op::from_tag(tag).ok_or(ProtoError::UnknownTag(tag))?;
        Ok(Some(Request::decode_body(op, r)?))
    }

    fn decode_body<R: Read>(op: Op, r: &mut R) -> wire::Result<Request> {
        use Request::*;
        Ok(match op {
            Op::Getattr => Getattr { path: read_path(r)? },
            Op::Access => Access { path: read_path(r)?, mask: wire::read_i32(r)? },
            Op::Readdir => Readdir { path: read_path(r)? },
            Op::Readlink => Readlink { path: read_path(r)? },
            Op::Read => Read {
                path: read_path(r)?,
                size: wire::read_u64(r)?,
                offset: wire::read_i64(r)?,
            },
            Op::Write => Write {
                path: read_path(r)?,
                data: wire::read_bytes(r)?,
                offset: wire::read_i64(r)?,
            },
            Op::Open => Open {
                path: read_path(r)?,
                flags: wire::read_i32(r)?,
                mode: wire::read_u32(r)?,
            },
            Op::Creat => Creat {
                path: read_path(r)?,
                owner: read_owner(r)?,
                mode: wire::read_u32(r)?,
            },
            Op::Mknod => Mknod {
                path: read_path(r)?,
                rdev: wire::read_u64(r)?,
                owner: read_owner(r)?,
                mode: wire::read_u32(r)?,
            },
            Op::Truncate => Truncate { path: read_path(r)?, length: wire::read_i64(r)? },
            Op::Chmod => Chmod { path: read_path(r)?, mode: wire::read_u32(r)? },
            Op::Chown => Chown { path: read_path(r)?, owner: read_owner(r)? },
            Op::Mkdir => Mkdir {
                path: read_path(r)?,
                owner: read_owner(r)?,
                mode: wire::read_u32(r)?,
            },
            Op::Unlink => Unlink { path: read_path(r)? },
            Op::Rmdir => Rmdir { path: read_path(r)? },
            Op::Symlink => Symlink {
                target: read_path(r)?,
                path: read_path(r)?,
                owner: read_owner(r)?,
            },
            Op::Link => Link { path: read_path(r)?, path2: read_path(r)? },
            Op::Rename => Rename { path: read_path(r)?, path2: read_path(r)? },
            Op::Utimens => Utimens {
                path: read_path(r)?,
                atime: wire::read_timespec(r)?,
                mtime: wire::read_timespec(r)?,
            },
            Op::Statfs => Statfs { path: read_path(r)? },
        })
    }
}

impl Reply {
    pub fn encode<W: Write>(&self, op: Op, w: &mut W) -> wire::Result<()> {
        wire::write_i32(w, self.result)?;
        match (&self.body, op) {
            (ReplyBody::Stat(st), Op::Getattr) if self.result == 0 => {
                wire::write_u64(w, st.ino)?;
                wire::write_u32(w, st.mode)?;
                wire::write_u64(w, st.nlink)?;
                wire::write_u32(w, st.uid)?;
                wire::write_u32(w, st.gid)?;
                wire::write_u64(w, st.rdev)?;
                wire::write_i64(w, st.size)?;
                wire::write_i64(w, st.blksize)?;
                wire::write_i64(w, st.blocks)?;
                wire::write_timespec(w, st.atime)?;
                wire::write_timespec(w, st.mtime)?;
                wire::write_timespec(w, st.ctime)
            }
            (ReplyBody::Names(names), Op::Readdir) if self.result == 0 => {
                wire::write_u64(w, names.len() as u64)?;
                for name in names {
                    wire::write_os_str(w, name)?;
                }
                Ok(())
            }
            (ReplyBody::Target(target), Op::Readlink) if self.result == 0 => {
                wire::write_os_str(w, target)
            }
            (ReplyBody::Data(data), Op::Read) if self.result > 0 => {
                w.write_all(&data[..self.result as usize])?;
                Ok(())
            }
            (ReplyBody::Statfs(sf), Op::Statfs) if self.result == 0 => {
                wire::write_u64(w, sf.blocks)?;
                wire::write_u64(w, sf.bfree)?;
                wire::write_u64(w, sf.bavail)?;
                wire::write_u64(w, sf.files)?;
                wire::write_u64(w, sf.ffree)?;
                wire::write_u64(w, sf.bsize)?;
                wire::write_u64(w, sf.namemax)?;
                wire::write_u64(w, sf.frsize)
            }
            _ => Ok(()),
        }
    }

    pub fn decode<R: Read>(op: Op, r: &mut R) -> wire::Result<Reply> {
        let result = wire::read_i32(r)?;
        let body = match op {
            Op::Getattr if result == 0 => {
                let mut st = StatRecord {
                    ino: wire::read_u64(r)?,
                    mode: wire::read_u32(r)?,
                    nlink: wire::read_u64(r)?,
                    uid: wire::read_u32(r)?,
                    gid: wire::read_u32(r)?,
                    rdev: wire::read_u64(r)?,
                    size: wire::read_i64(r)?,
                    blksize: wire::read_i64(r)?,
                    blocks: wire::read_i64(r)?,
                    ..StatRecord::default()
                };
                st.atime = wire::read_timespec(r)?;
                st.mtime = wire::read_timespec(r)?;
                st.ctime = wire::read_timespec(r)?;
                ReplyBody::Stat(st)
            }
            Op::Readdir if result == 0 => {
                let n = wire::read_u64(r)?;
                let mut names = Vec::with_capacity(n.min(4096) as usize);
                for _ in 0..n {
                    names.push(wire::read_os_string(r)?);
                }
                ReplyBody::Names(names)
            }
            Op::Readlink if result == 0 => ReplyBody::Target(wire::read_os_string(r)?),
            Op::Read if result > 0 => {
                let mut data = vec![0u8; result as usize];
                match r.read_exact(&mut data) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        return Err(CodecError::UnexpectedEof);
                    }
                    Err(e) => return Err(e.into()),
                }
                ReplyBody::Data(data)
            }
            Op::Statfs if result == 0 => ReplyBody::Statfs(StatfsRecord {
                blocks: wire::read_u64(r)?,
                bfree: wire::read_u64(r)?,
                bavail: wire::read_u64(r)?,
                files: wire::read_u64(r)?,
                ffree: wire::read_u64(r)?,
                bsize: wire::read_u64(r)?,
                namemax: wire::read_u64(r)?,
                frsize: wire::read_u64(r)?,
            }),
            _ => ReplyBody::None,
        };
        Ok(Reply { result, body })
    }
}

/// Serves decoded requests from `r`, writing one reply per request to `w`.
/// Ends cleanly when the peer closes the stream between messages.
pub fn serve<R: Read, W: Write>(
    processor: &crate::processor::Processor,
    r: &mut R,
    w: &mut W,
) -> Result<(), ProtoError> {
    while let Some(mut req) = Request::receive(r)? {
        trace!("serving {} '{}'", req.op().name(), req.path().display());
        let op = req.op();
        let reply = processor.process(&mut req);
        debug!("{} -> {}", op.name(), reply.result);
        reply.encode(op, w)?;
        w.flush().map_err(CodecError::from)?;
    }
    Ok(())
}

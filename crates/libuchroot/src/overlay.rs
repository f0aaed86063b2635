//! The overlay front-end: adapts kernel VFS upcalls into requests for the
//! processor and feeds the results back through the kernel interface.
//!
//! The kernel side speaks inodes while the processor speaks paths, so the
//! front-end keeps a bidirectional inode/path table, remapping it on rename
//! so cached inodes stay valid. The identity for the creating operations
//! (mkdir, creat, mknod, symlink) comes from the per-request kernel context,
//! because the creator matters there, not the server process.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use log::{debug, error};
use std::os::unix::ffi::OsStrExt;

use crate::launcher;
use crate::processor::Processor;
use crate::proto::{self, Owner, ReplyBody, StatRecord};
use crate::wire::Timespec;

const TTL: Duration = Duration::from_secs(1);

struct InodeTable {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> InodeTable {
        let root = PathBuf::from("/");
        InodeTable {
            by_ino: HashMap::from([(fuser::FUSE_ROOT_ID, root.clone())]),
            by_path: HashMap::from([(root, fuser::FUSE_ROOT_ID)]),
            next: fuser::FUSE_ROOT_ID + 1,
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.by_ino.get(&ino).cloned()
    }

    fn ino_for(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_path_buf());
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    fn forget_path(&mut self, path: &Path) {
        if let Some(ino) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }

    /// Moves the whole subtree at `from` to `to`, dropping whatever the
    /// rename clobbered at the destination.
    fn remap(&mut self, from: &Path, to: &Path) {
        let clobbered: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|p| p.starts_with(to))
            .cloned()
            .collect();
        for path in clobbered {
            self.forget_path(&path);
        }
        let moved: Vec<(u64, PathBuf)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, &i)| (i, p.clone()))
            .collect();
        for (ino, old) in moved {
            self.by_path.remove(&old);
            let rel = old.strip_prefix(from).unwrap_or(&old);
            let new = if rel.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rel)
            };
            self.by_path.insert(new.clone(), ino);
            self.by_ino.insert(ino, new);
        }
    }
}

/// Announcement to the blocked supervisor that the mount is live.
struct Handover {
    fd: OwnedFd,
    newroot: PathBuf,
}

pub struct Overlay {
    processor: Processor,
    inodes: InodeTable,
    handover: Option<Handover>,
}

impl Overlay {
    fn new(processor: Processor, handover: Option<Handover>) -> Overlay {
        Overlay {
            processor,
            inodes: InodeTable::new(),
            handover,
        }
    }

    /// Runs a getattr through the processor and converts the answer into
    /// the kernel's attribute record, registering the path's inode.
    fn attr_of(&mut self, path: &Path) -> std::result::Result<FileAttr, i32> {
        let mut req = proto::Request::Getattr { path: path.to_path_buf() };
        let reply = self.processor.process(&mut req);
        if reply.result != 0 {
            return Err(-reply.result);
        }
        let ReplyBody::Stat(st) = reply.body else {
            return Err(libc::EIO);
        };
        let ino = self.inodes.ino_for(path);
        Ok(file_attr(ino, &st))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.inodes.path_of(parent).map(|p| p.join(name))
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time(ts: Timespec) -> SystemTime {
    if ts.sec >= 0 {
        UNIX_EPOCH + Duration::new(ts.sec as u64, ts.nsec.clamp(0, 999_999_999) as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(ts.sec.unsigned_abs())
    }
}

fn to_timespec(t: Option<TimeOrNow>) -> Timespec {
    match t {
        None => Timespec::OMIT,
        Some(TimeOrNow::Now) => Timespec::NOW,
        Some(TimeOrNow::SpecificTime(st)) => match st.duration_since(UNIX_EPOCH) {
            Ok(d) => Timespec::new(d.as_secs() as i64, d.subsec_nanos() as i64),
            Err(e) => Timespec::new(-(e.duration().as_secs() as i64), 0),
        },
    }
}

fn file_attr(ino: u64, st: &StatRecord) -> FileAttr {
    FileAttr {
        ino,
        size: st.size.max(0) as u64,
        blocks: st.blocks.max(0) as u64,
        atime: system_time(st.atime),
        mtime: system_time(st.mtime),
        ctime: system_time(st.ctime),
        crtime: UNIX_EPOCH,
        kind: file_type(st.mode),
        perm: (st.mode & 0o7777) as u16,
        nlink: st.nlink as u32,
        uid: st.uid,
        gid: st.gid,
        rdev: st.rdev as u32,
        blksize: st.blksize.max(0) as u32,
        flags: 0,
    }
}

impl Filesystem for Overlay {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        if let Some(handover) = self.handover.take() {
            if let Err(e) = launcher::send_enter_fd(&handover.fd, &handover.newroot) {
                error!("could not release the supervisor: {e:#}");
            }
        }
        Ok(())
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_of(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_of(&path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // The kernel folds chmod/chown/truncate/utimens into one upcall;
        // unfold it into the separate operations the processor knows.
        let mut steps: Vec<proto::Request> = Vec::new();
        if let Some(mode) = mode {
            steps.push(proto::Request::Chmod { path: path.clone(), mode });
        }
        if uid.is_some() || gid.is_some() {
            steps.push(proto::Request::Chown {
                path: path.clone(),
                owner: Owner {
                    uid: uid.unwrap_or(u32::MAX),
                    gid: gid.unwrap_or(u32::MAX),
                },
            });
        }
        if let Some(size) = size {
            steps.push(proto::Request::Truncate { path: path.clone(), length: size as i64 });
        }
        if atime.is_some() || mtime.is_some() {
            steps.push(proto::Request::Utimens {
                path: path.clone(),
                atime: to_timespec(atime),
                mtime: to_timespec(mtime),
            });
        }
        for mut step in steps {
            let res = self.processor.process(&mut step);
            if res.result < 0 {
                reply.error(-res.result);
                return;
            }
        }
        match self.attr_of(&path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut req = proto::Request::Readlink { path };
        let res = self.processor.process(&mut req);
        match res.body {
            ReplyBody::Target(target) if res.result == 0 => reply.data(target.as_bytes()),
            _ => reply.error(-res.result),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Mknod {
            path: path.clone(),
            rdev: rdev as u64,
            owner: Owner { uid: req.uid(), gid: req.gid() },
            mode,
        };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
            return;
        }
        match self.attr_of(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Mkdir {
            path: path.clone(),
            owner: Owner { uid: req.uid(), gid: req.gid() },
            mode,
        };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
            return;
        }
        match self.attr_of(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Unlink { path: path.clone() };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
        } else {
            self.inodes.forget_path(&path);
            reply.ok();
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Rmdir { path: path.clone() };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
        } else {
            self.inodes.forget_path(&path);
            reply.ok();
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Symlink {
            target: target.to_path_buf(),
            path: path.clone(),
            owner: Owner { uid: req.uid(), gid: req.gid() },
        };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
            return;
        }
        match self.attr_of(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) =
            (self.child_path(parent, name), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Rename { path: from.clone(), path2: to.clone() };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
        } else {
            self.inodes.remap(&from, &to);
            reply.ok();
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(from), Some(to)) =
            (self.inodes.path_of(ino), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Link { path: from, path2: to.clone() };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
            return;
        }
        match self.attr_of(&to) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Open { path, flags, mode: 0 };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
        } else {
            reply.opened(0, 0);
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Read { path, size: size as u64, offset };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
            return;
        }
        match res.body {
            ReplyBody::Data(data) => reply.data(&data),
            _ => reply.data(&[]),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Write { path, data: data.to_vec(), offset };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
        } else {
            reply.written(res.result as u32);
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Readdir { path: path.clone() };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
            return;
        }
        let ReplyBody::Names(names) = res.body else {
            reply.error(libc::EIO);
            return;
        };
        for (i, name) in names.iter().enumerate().skip(offset as usize) {
            let (entry_ino, kind) = if name == "." {
                (ino, FileType::Directory)
            } else if name == ".." {
                let parent = crate::sidecar::dir_of(&path);
                (self.inodes.ino_for(&parent), FileType::Directory)
            } else {
                let child = path.join(name);
                match self.attr_of(&child) {
                    Ok(attr) => (attr.ino, attr.kind),
                    Err(_) => (self.inodes.ino_for(&child), FileType::RegularFile),
                }
            };
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Statfs { path };
        let res = self.processor.process(&mut request);
        match res.body {
            ReplyBody::Statfs(sf) if res.result == 0 => reply.statfs(
                sf.blocks,
                sf.bfree,
                sf.bavail,
                sf.files,
                sf.ffree,
                sf.bsize as u32,
                sf.namemax as u32,
                sf.frsize as u32,
            ),
            _ => reply.error(-res.result),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Access { path, mask };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
        } else {
            reply.ok();
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut request = proto::Request::Creat {
            path: path.clone(),
            owner: Owner { uid: req.uid(), gid: req.gid() },
            mode,
        };
        let res = self.processor.process(&mut request);
        if res.result < 0 {
            reply.error(-res.result);
            return;
        }
        match self.attr_of(&path) {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(err) => reply.error(err),
        }
    }
}

/// Entry point of the filesystem server process: mounts the overlay at the
/// temporary root and serves until it is detached everywhere. The init
/// callback releases the supervisor once the mount is live.
pub fn serve(processor: Processor, mountpoint: &Path, release: OwnedFd) -> Result<()> {
    debug!("mounting overlay at {}", mountpoint.display());
    let overlay = Overlay::new(
        processor,
        Some(Handover { fd: release, newroot: mountpoint.to_path_buf() }),
    );
    let options = [
        MountOption::FSName("uchroot".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AllowOther,
        MountOption::AutoUnmount,
    ];
    fuser::mount2(overlay, mountpoint, &options)
        .with_context(|| format!("mounting the overlay at '{}'", mountpoint.display()))
}

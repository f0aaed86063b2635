//! The request processor: rewrites paths through the mapping table, applies
//! the attribute-emulation policy for `Emulated` regions and the identity
//! substitution for `Mapped` regions, and executes the real operation.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Mutex;

use log::debug;
use nix::errno::Errno;
use nix::unistd;

use crate::idmap::IdMap;
use crate::pathmap::{AttrType, PathMap};
use crate::proto::{Op, Owner, Reply, ReplyBody, Request, perform_locally};
use crate::sidecar::{self, ATTR_MASK, Attrs, DIR_MODE, EntryKind, FILE_MODE};

/// Open flags the emulated layer lets through to the host. Everything else
/// is stripped; in particular nothing may create a file behind the sidecar
/// logic's back (`O_TMPFILE`) and nothing host-kernel-specific survives.
pub const ALLOWED_OPEN_FLAGS: i32 = libc::O_ACCMODE
    | libc::O_APPEND
    | libc::O_TRUNC
    | libc::O_CREAT
    | libc::O_EXCL
    | libc::O_NOFOLLOW
    | libc::O_DIRECTORY
    | libc::O_PATH
    | libc::O_CLOEXEC
    | libc::O_NONBLOCK;

/// What chown in an emulated region does when the target entry itself is
/// gone from the underlying filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChownPolicy {
    /// Treat the entry as a file, derive defaults where possible and write
    /// the sidecar anyway.
    #[default]
    CreateMissing,
    /// Surface the `lstat` failure to the caller.
    RequireTarget,
}

/// The invoker's host-side identity, consulted for `Mapped` getattr.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
    pub groups: Vec<u32>,
}

impl HostIdentity {
    pub fn current() -> HostIdentity {
        let groups = unistd::getgroups()
            .map(|gs| gs.iter().map(|g| g.as_raw()).collect())
            .unwrap_or_default();
        HostIdentity {
            uid: unistd::getuid().as_raw(),
            euid: unistd::geteuid().as_raw(),
            gid: unistd::getgid().as_raw(),
            egid: unistd::getegid().as_raw(),
            groups,
        }
    }

    fn owns_gid(&self, gid: u32) -> bool {
        gid == self.gid || gid == self.egid || self.groups.contains(&gid)
    }
}

pub struct Processor {
    paths: PathMap,
    uid_map: IdMap,
    gid_map: IdMap,
    initial_uid: u32,
    initial_gid: u32,
    host: HostIdentity,
    chown_policy: ChownPolicy,
    // Serializes every sidecar read-modify-write against the others; the
    // read-path operations are exempt (see is_mutating).
    lock: Mutex<()>,
}

fn is_mutating(op: Op) -> bool {
    !matches!(
        op,
        Op::Open | Op::Read | Op::Readdir | Op::Readlink | Op::Statfs | Op::Truncate | Op::Write
    )
}

impl Processor {
    pub fn new(
        paths: PathMap,
        uid_map: IdMap,
        gid_map: IdMap,
        initial_uid: u32,
        initial_gid: u32,
    ) -> Processor {
        Processor {
            paths,
            uid_map,
            gid_map,
            initial_uid,
            initial_gid,
            host: HostIdentity::current(),
            chown_policy: ChownPolicy::default(),
            lock: Mutex::new(()),
        }
    }

    pub fn with_chown_policy(mut self, policy: ChownPolicy) -> Processor {
        self.chown_policy = policy;
        self
    }

    pub fn with_host_identity(mut self, host: HostIdentity) -> Processor {
        self.host = host;
        self
    }

    // chown(2) uses (id_t)-1 for "leave alone"; it must not be translated.
    fn uid_to_inner(&self, uid: u32) -> u32 {
        if uid == u32::MAX { uid } else { self.uid_map.inverse_lookup(uid) }
    }

    fn gid_to_inner(&self, gid: u32) -> u32 {
        if gid == u32::MAX { gid } else { self.gid_map.inverse_lookup(gid) }
    }

    fn uid_to_outer(&self, uid: u32) -> u32 {
        if uid == u32::MAX { uid } else { self.uid_map.lookup(uid) }
    }

    fn gid_to_outer(&self, gid: u32) -> u32 {
        if gid == u32::MAX { gid } else { self.gid_map.lookup(gid) }
    }

    /// Translates the request's paths, applies the policy of the governing
    /// table entry, and executes. The reply's result is the operation's
    /// signed outcome; errors never propagate any other way.
    pub fn process(&self, req: &mut Request) -> Reply {
        let entry = self.paths.entry_for(req.path()).cloned();
        if let Some(entry) = &entry {
            let translated = PathMap::translate_with(entry, req.path());
            *req.path_mut() = translated;
            if let Some(path2) = req.second_path_mut() {
                let translated = PathMap::translate_with(entry, path2);
                *path2 = translated;
            }
        }
        debug!("{} '{}'", req.op().name(), req.path().display());

        let _guard = if is_mutating(req.op()) {
            Some(self.lock.lock().unwrap_or_else(|e| e.into_inner()))
        } else {
            None
        };

        let attr = entry.map_or(AttrType::Untranslated, |e| e.attr);
        let reply = match attr {
            AttrType::Emulated => self.process_emulated(req),
            AttrType::Mapped => self.process_mapped(req),
            AttrType::Untranslated => perform_locally(req),
        };
        debug!(
            "{} '{}' -> {}",
            req.op().name(),
            req.path().display(),
            reply.result
        );
        reply
    }

    fn process_mapped(&self, req: &Request) -> Reply {
        let mut reply = perform_locally(req);
        if req.op() == Op::Getattr && reply.result == 0 {
            if let ReplyBody::Stat(st) = &mut reply.body {
                // Files the invoker owns appear as the interior identity;
                // anything else keeps its host ownership.
                if st.uid == self.host.uid || st.uid == self.host.euid {
                    st.uid = self.uid_map.lookup(self.initial_uid);
                }
                if self.host.owns_gid(st.gid) {
                    st.gid = self.gid_map.lookup(self.initial_gid);
                }
            }
        }
        reply
    }

    fn process_emulated(&self, req: &mut Request) -> Reply {
        // Sidecars must stay invisible and immutable from inside.
        if sidecar::is_guarded_path(req.path())
            || req.second_path().is_some_and(sidecar::is_guarded_path)
        {
            return Reply::errno(Errno::EPERM);
        }

        if let Some(owner) = req.owner_mut() {
            owner.uid = self.uid_to_inner(owner.uid);
            owner.gid = self.gid_to_inner(owner.gid);
        }

        match req.op() {
            Op::Chown => {
                let (path, owner) = match req {
                    Request::Chown { path, owner } => (path.clone(), *owner),
                    _ => unreachable!(),
                };
                self.emu_chown(&path, owner)
            }
            Op::Chmod => {
                let (path, mode) = match req {
                    Request::Chmod { path, mode } => (path.clone(), *mode),
                    _ => unreachable!(),
                };
                self.emu_chmod(&path, mode)
            }
            Op::Creat | Op::Mkdir | Op::Mknod | Op::Symlink => self.emu_create_family(req),
            Op::Getattr => self.emu_getattr(req),
            Op::Readdir => {
                let mut reply = perform_locally(req);
                if let ReplyBody::Names(names) = &mut reply.body {
                    names.retain(|name| !sidecar::is_sidecar_name(name));
                }
                reply
            }
            Op::Open => {
                if let Request::Open { flags, .. } = req {
                    *flags &= ALLOWED_OPEN_FLAGS;
                }
                perform_locally(req)
            }
            Op::Unlink => {
                let reply = perform_locally(req);
                if reply.result == 0 {
                    let _ = sidecar::remove_attrs(req.path(), EntryKind::File);
                }
                reply
            }
            Op::Rmdir => self.emu_rmdir(req),
            Op::Link => {
                let reply = perform_locally(req);
                if reply.result == 0 {
                    let from = sidecar::sidecar_path(req.path(), EntryKind::File);
                    let to =
                        sidecar::sidecar_path(req.second_path().unwrap(), EntryKind::File);
                    if fs::hard_link(&from, &to).is_err() {
                        // The caller must learn the two names no longer
                        // share forged attributes.
                        return Reply::errno(Errno::EIO);
                    }
                }
                reply
            }
            Op::Rename => {
                let reply = perform_locally(req);
                if reply.result == 0 {
                    let dest = req.second_path().unwrap();
                    let is_dir = fs::symlink_metadata(dest)
                        .map(|m| m.is_dir())
                        .unwrap_or(false);
                    if !is_dir {
                        let from = sidecar::sidecar_path(req.path(), EntryKind::File);
                        let to = sidecar::sidecar_path(dest, EntryKind::File);
                        let _ = fs::rename(from, to);
                    }
                }
                reply
            }
            _ => perform_locally(req),
        }
    }

    fn emu_chown(&self, path: &Path, owner: Owner) -> Reply {
        let kind = match fs::symlink_metadata(path) {
            Ok(meta) => sidecar::kind_of_mode(meta.mode()),
            Err(e) => match self.chown_policy {
                ChownPolicy::RequireTarget => {
                    return Reply::new(-(e.raw_os_error().unwrap_or(libc::ENOENT)));
                }
                ChownPolicy::CreateMissing => EntryKind::File,
            },
        };
        let Ok(mut attrs) = sidecar::read_attrs(path, kind) else {
            return Reply::errno(Errno::EIO);
        };
        if owner.uid != u32::MAX {
            attrs.uid = owner.uid;
        }
        if owner.gid != u32::MAX {
            attrs.gid = owner.gid;
        }
        match sidecar::write_attrs(path, kind, &attrs) {
            Ok(()) => Reply::ok(),
            Err(_) => Reply::errno(Errno::EIO),
        }
    }

    fn emu_chmod(&self, path: &Path, mode: u32) -> Reply {
        let kind = match fs::symlink_metadata(path) {
            Ok(meta) => sidecar::kind_of_mode(meta.mode()),
            Err(_) => EntryKind::File,
        };
        let Ok(mut attrs) = sidecar::read_attrs(path, kind) else {
            return Reply::errno(Errno::EIO);
        };
        attrs.mode = mode & ATTR_MASK;
        match sidecar::write_attrs(path, kind, &attrs) {
            Ok(()) => Reply::ok(),
            Err(_) => Reply::errno(Errno::EIO),
        }
    }

    /// creat/mkdir/mknod/symlink: the on-disk entry is created with a
    /// restricted mode under the invoker's identity; the requested mode and
    /// the requesting identity go into the sidecar. A setgid parent passes
    /// its group on, like the kernel would.
    fn emu_create_family(&self, req: &mut Request) -> Reply {
        let (kind, requested_mode, owner) = match req {
            Request::Creat { owner, mode, .. } => {
                let requested = *mode;
                *mode = FILE_MODE;
                (EntryKind::File, requested, *owner)
            }
            Request::Mkdir { owner, mode, .. } => {
                let requested = *mode;
                *mode = DIR_MODE;
                (EntryKind::Dir, requested, *owner)
            }
            Request::Mknod { owner, mode, .. } => {
                let requested = *mode;
                *mode = (*mode & !ATTR_MASK) | FILE_MODE;
                (EntryKind::File, requested, *owner)
            }
            // Symlink modes are ignored by the kernel; forge them wide open.
            Request::Symlink { owner, .. } => (EntryKind::File, 0o777, *owner),
            _ => unreachable!(),
        };
        let target = req.path().to_path_buf();
        let mut reply = perform_locally(req);
        if reply.result == 0 {
            self.finish_create(&mut reply, &target, kind, requested_mode, owner);
        }
        reply
    }

    fn finish_create(
        &self,
        reply: &mut Reply,
        path: &Path,
        kind: EntryKind,
        mode: u32,
        owner: Owner,
    ) {
        let Ok(dir_attrs) = sidecar::read_attrs(&sidecar::dir_of(path), EntryKind::Dir) else {
            return;
        };
        let gid = if dir_attrs.mode & libc::S_ISGID as u32 != 0 {
            dir_attrs.gid
        } else {
            owner.gid
        };
        let attrs = Attrs { uid: owner.uid, gid, mode: mode & ATTR_MASK };
        if sidecar::write_attrs(path, kind, &attrs).is_err() {
            reply.result = -(Errno::EIO as i32);
        }
    }

    fn emu_getattr(&self, req: &Request) -> Reply {
        let mut reply = perform_locally(req);
        if reply.result != 0 {
            return reply;
        }
        if let ReplyBody::Stat(st) = &mut reply.body {
            let kind = sidecar::kind_of_mode(st.mode);
            match sidecar::read_attrs(req.path(), kind) {
                Ok(attrs) => {
                    st.uid = self.uid_to_outer(attrs.uid);
                    st.gid = self.gid_to_outer(attrs.gid);
                    st.mode = (st.mode & !ATTR_MASK) | (attrs.mode & ATTR_MASK);
                }
                Err(_) => {
                    // A missing sidecar already yields defaults, so this is a
                    // genuinely broken entry: claim it for (outer) root and
                    // keep everyone else out.
                    st.uid = 0;
                    st.gid = 0;
                    st.mode &= !(libc::S_IRWXG | libc::S_IRWXO) as u32;
                }
            }
            if kind == EntryKind::Dir {
                if let Ok(n) = sidecar::visible_entry_count(req.path()) {
                    st.size = n as i64;
                }
            }
        }
        reply
    }

    /// The directory sidecar would keep rmdir from ever succeeding, so it is
    /// removed first and restored if the rmdir fails.
    fn emu_rmdir(&self, req: &Request) -> Reply {
        let path = req.path();
        let saved = sidecar::read_attrs(path, EntryKind::Dir).ok();
        let _ = sidecar::remove_attrs(path, EntryKind::Dir);
        let reply = perform_locally(req);
        if reply.result != 0 {
            if let Some(attrs) = saved {
                let _ = sidecar::write_attrs(path, EntryKind::Dir, &attrs);
            }
        }
        reply
    }
}

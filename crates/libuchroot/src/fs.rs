//! Mount plumbing for the container root: bind mounts, the pseudo
//! filesystems under the new root, and the teardown retry policy.

use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use thiserror::Error;

/// Reserved launcher exit codes, one per mount phase, so the parent can tell
/// which phase failed apart from ordinary program exit codes.
pub const EXIT_MOUNT_FAILED: i32 = 71;
pub const EXIT_MOUNT_DEV: i32 = 72;
pub const EXIT_MOUNT_SYS: i32 = 73;
pub const EXIT_MOUNT_PROC: i32 = 74;
pub const EXIT_MOUNT_PTS: i32 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPhase {
    Generic,
    Dev,
    Sys,
    Proc,
    Pts,
}

impl MountPhase {
    pub fn exit_code(self) -> i32 {
        match self {
            MountPhase::Generic => EXIT_MOUNT_FAILED,
            MountPhase::Dev => EXIT_MOUNT_DEV,
            MountPhase::Sys => EXIT_MOUNT_SYS,
            MountPhase::Proc => EXIT_MOUNT_PROC,
            MountPhase::Pts => EXIT_MOUNT_PTS,
        }
    }

    fn name(self) -> &'static str {
        match self {
            MountPhase::Generic => "mount",
            MountPhase::Dev => "mount-dev",
            MountPhase::Sys => "mount-sys",
            MountPhase::Proc => "mount-proc",
            MountPhase::Pts => "mount-pts",
        }
    }
}

impl std::fmt::Display for MountPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("{phase}: {src} -> {dst} ({fstype}): {errno}")]
pub struct MountError {
    pub phase: MountPhase,
    pub src: String,
    pub dst: String,
    pub fstype: String,
    pub errno: Errno,
}

fn mount_err(phase: MountPhase, src: &Path, dst: &Path, fstype: &str, errno: Errno) -> MountError {
    MountError {
        phase,
        src: src.display().to_string(),
        dst: dst.display().to_string(),
        fstype: fstype.to_string(),
        errno,
    }
}

/// Recursive bind of a host path onto a target, as used for `/dev`, `/sys`
/// and the user-requested bind mounts.
pub fn bind_mount(phase: MountPhase, src: &Path, dst: &Path) -> Result<(), MountError> {
    debug!("bind {} -> {}", src.display(), dst.display());
    mount(
        Some(src),
        dst,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err(phase, src, dst, "bind", e))
}

/// Mounts proc at `target`. A freshly unshared PID namespace sometimes
/// answers `EINVAL` transiently; retry a few times before giving up.
pub fn mount_proc(target: &Path) -> Result<(), MountError> {
    let mut tries = 3;
    loop {
        let res = mount(
            Some("proc"),
            target,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None::<&str>,
        );
        match res {
            Ok(()) => return Ok(()),
            Err(Errno::EINVAL) if tries > 1 => {
                tries -= 1;
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(mount_err(MountPhase::Proc, Path::new("proc"), target, "proc", e));
            }
        }
    }
}

/// Mounts a private devpts instance at `target` and binds its `ptmx` over
/// `/dev/ptmx`. The tty group option is only passed when a gid mapping for
/// group 5 exists; the kernel rejects an unmapped gid.
pub fn mount_devpts(target: &Path, with_tty_gid: bool) -> Result<(), MountError> {
    let data = if with_tty_gid {
        "newinstance,ptmxmode=0666,gid=5,mode=620"
    } else {
        "newinstance,ptmxmode=0666"
    };
    mount(
        Some("devpts"),
        target,
        Some("devpts"),
        MsFlags::empty(),
        Some(data),
    )
    .map_err(|e| mount_err(MountPhase::Pts, Path::new("devpts"), target, "devpts", e))?;

    let ptmx = target.join("ptmx");
    mount(
        Some(&ptmx),
        "/dev/ptmx",
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| mount_err(MountPhase::Pts, &ptmx, Path::new("/dev/ptmx"), "bind", e))
}

/// Lazily detaches the overlay from the parent's namespace via fusermount,
/// the same helper the filesystem library itself uses.
pub fn detach_overlay(mountpoint: &Path) {
    debug!("detaching overlay at {}", mountpoint.display());
    match Command::new("/bin/fusermount")
        .arg("-u")
        .arg("-q")
        .arg(mountpoint)
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => debug!("fusermount exited with {status}"),
        Err(e) => warn!("could not run fusermount: {e}"),
    }
}

/// Removes the temporary root directory. The overlay may still be winding
/// down, so `EBUSY` is retried with a short back-off; a directory that is
/// already gone counts as removed.
pub fn remove_dir_retry(path: &Path) {
    let mut tries = 10;
    loop {
        match std::fs::remove_dir(path) {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && tries > 1 => {
                tries -= 1;
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                warn!("could not remove '{}': {}", path.display(), e);
                return;
            }
        }
    }
}

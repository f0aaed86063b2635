//! The container launcher: a parent/supervisor/grandchild phase machine
//! that unshares namespaces, installs identity maps, enters the new root
//! and finally executes the user command behind an exec gate.
//!
//! Phase synchronization runs over two pipes carrying single-byte tokens:
//! the supervisor announces `'U'` after unsharing, the parent (or the
//! filesystem server once its mount is live) answers `'I'` followed by the
//! wire-encoded new-root path, and the supervisor reports `'C'` when the
//! root is in use. A broken pipe while waiting on the parent means the
//! parent is gone and the supervisor leaves quietly.

use std::ffi::CString;
use std::io::{self, IsTerminal};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{Command, exit};

use anyhow::{Context, Result, bail};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::pty::{ForkptyResult, forkpty};
use nix::sched::{CloneFlags, unshare};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::sys::wait::{WaitStatus, wait, waitpid};
use nix::unistd::{ForkResult, Pid, chdir, chroot, execvp, fork, getegid, geteuid, pipe, read,
                  write};

use crate::fs::{self, EXIT_MOUNT_FAILED, MountPhase};
use crate::idmap::IdMap;
use crate::overlay;
use crate::pathmap::PathMap;
use crate::processor::{ChownPolicy, Processor};
use crate::pty;
use crate::relay;
use crate::wire;

const TOKEN_UNSHARED: u8 = b'U';
const TOKEN_ENTER: u8 = b'I';
const TOKEN_CHROOTED: u8 = b'C';
const TOKEN_GO: u8 = b'G';

pub const NEWUIDMAP: &str = "/usr/bin/newuidmap";
pub const NEWGIDMAP: &str = "/usr/bin/newgidmap";

#[derive(Debug, Clone)]
pub struct BindMount {
    pub outside: PathBuf,
    pub inside: PathBuf,
}

/// Everything the supervisor needs to set up the interior; immutable once
/// the launcher starts.
#[derive(Debug, Clone)]
pub struct ChildParams {
    pub new_root: PathBuf,
    pub new_workdir: PathBuf,
    pub devprocsys: bool,
    pub unshare_net: bool,
    pub bind_mounts: Vec<BindMount>,
    pub uid_map: IdMap,
    pub gid_map: IdMap,
    pub initial_uid: u32,
    pub initial_gid: u32,
}

impl Default for ChildParams {
    fn default() -> ChildParams {
        ChildParams {
            new_root: PathBuf::from("/"),
            new_workdir: PathBuf::from("/"),
            devprocsys: false,
            unshare_net: false,
            bind_mounts: Vec::new(),
            uid_map: IdMap::new(),
            gid_map: IdMap::new(),
            initial_uid: 0,
            initial_gid: 0,
        }
    }
}

impl ChildParams {
    pub fn validate(&self) -> Result<()> {
        if !self.new_root.is_absolute() {
            bail!("new root '{}' is not absolute", self.new_root.display());
        }
        if !self.new_workdir.is_absolute() {
            bail!("working directory '{}' is not absolute", self.new_workdir.display());
        }
        for bm in &self.bind_mounts {
            if !bm.outside.is_absolute() || !bm.inside.is_absolute() {
                bail!(
                    "bind mount '{}:{}' must use absolute paths",
                    bm.outside.display(),
                    bm.inside.display()
                );
            }
        }
        Ok(())
    }
}

/// Configuration of the attribute-emulating overlay; absent for a plain
/// chroot run.
pub struct OverlayParams {
    pub paths: PathMap,
    pub chown_policy: ChownPolicy,
}

pub struct LaunchConfig {
    pub params: ChildParams,
    pub overlay: Option<OverlayParams>,
    pub command: Vec<String>,
}

/// Runs the whole launch and returns the exit status to report: the user
/// program's status, `128 + signal`, or one of the reserved mount codes.
pub fn launch(cfg: LaunchConfig) -> Result<i32> {
    cfg.params.validate()?;
    if cfg.command.is_empty() {
        bail!("no command given");
    }

    let (child_rx, parent_tx) = pipe().context("pipe/tochild")?;
    let (parent_rx, child_tx) = pipe().context("pipe/toparent")?;

    // The overlay mounts at a fresh temporary root; a plain chroot enters
    // the requested root directly.
    let tempdir = match cfg.overlay {
        Some(_) => Some(
            tempfile::Builder::new()
                .prefix("uchroot.")
                .tempdir()
                .context("creating temporary root directory")?,
        ),
        None => None,
    };
    let newroot = match &tempdir {
        Some(dir) => {
            let root = dir.path().join("newroot");
            std::fs::create_dir(&root)
                .with_context(|| format!("creating '{}'", root.display()))?;
            root
        }
        None => cfg.params.new_root.clone(),
    };

    match unsafe { fork() }.context("fork/supervisor")? {
        ForkResult::Child => {
            drop(parent_tx);
            drop(parent_rx);
            exit(supervisor(&cfg, child_rx, child_tx));
        }
        ForkResult::Parent { child } => {
            drop(child_rx);
            drop(child_tx);
            parent(cfg, child, parent_rx, parent_tx, newroot)
        }
    }
}

// ---------------------------------------------------------------------------
// parent side

fn parent(
    cfg: LaunchConfig,
    child: Pid,
    from_child: OwnedFd,
    to_child: OwnedFd,
    newroot: PathBuf,
) -> Result<i32> {
    debug!("supervisor forked as {child}, new root {}", newroot.display());

    match wait_token(&from_child) {
        Ok(Some(TOKEN_UNSHARED)) => {}
        other => {
            let _ = kill(child, Signal::SIGKILL);
            bail!("handshake: expected 'U', got {other:?}");
        }
    }

    if let Err(e) = install_id_maps(child, &cfg.params) {
        let _ = kill(child, Signal::SIGKILL);
        return Err(e);
    }

    let overlay_active = cfg.overlay.is_some();
    match cfg.overlay {
        Some(ov) => {
            // The filesystem server releases the supervisor itself, once the
            // overlay is actually mounted.
            match unsafe { fork() }.context("fork/fs-server")? {
                ForkResult::Child => {
                    drop(from_child);
                    let processor = Processor::new(
                        ov.paths,
                        cfg.params.uid_map.clone(),
                        cfg.params.gid_map.clone(),
                        cfg.params.initial_uid,
                        cfg.params.initial_gid,
                    )
                    .with_chown_policy(ov.chown_policy);
                    let code = match overlay::serve(processor, &newroot, to_child) {
                        Ok(()) => 0,
                        Err(e) => {
                            error!("filesystem server: {e:#}");
                            1
                        }
                    };
                    exit(code);
                }
                ForkResult::Parent { child: server } => {
                    debug!("filesystem server forked as {server}");
                    drop(to_child);
                }
            }
        }
        None => {
            send_enter_fd(&to_child, &newroot)?;
            drop(to_child);
        }
    }

    match wait_token(&from_child) {
        Ok(Some(TOKEN_CHROOTED)) => debug!("new root is in use"),
        Ok(None) => debug!("supervisor exited before entering the new root"),
        Ok(Some(other)) => warn!("handshake: expected 'C', got '{}'", other as char),
        Err(e) => warn!("handshake: {e}"),
    }

    // Pre-clean: the supervisor's mount namespace keeps its own view alive,
    // so the overlay can be detached from out here while the container is
    // still running.
    if overlay_active {
        fs::detach_overlay(&newroot);
        fs::remove_dir_retry(&newroot);
    }

    relay::install(&[child]).context("installing signal relay")?;

    let status = wait_for(child);
    // Reap whatever else is left (filesystem server, fusermount).
    loop {
        match wait() {
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    Ok(status)
}

fn install_id_maps(child: Pid, params: &ChildParams) -> Result<()> {
    let euid = geteuid().as_raw();
    let egid = getegid().as_raw();

    // gid first: once both maps are written the order no longer matters,
    // but newgidmap is the one that cares about setgroups state.
    if params.gid_map.directly_writable(egid) {
        std::fs::write(format!("/proc/{child}/setgroups"), "deny")
            .context("writing setgroups")?;
        std::fs::write(format!("/proc/{child}/gid_map"), params.gid_map.map_file())
            .context("writing gid_map")?;
    } else {
        run_map_helper(NEWGIDMAP, child, &params.gid_map)?;
    }
    if params.uid_map.directly_writable(euid) {
        std::fs::write(format!("/proc/{child}/uid_map"), params.uid_map.map_file())
            .context("writing uid_map")?;
    } else {
        run_map_helper(NEWUIDMAP, child, &params.uid_map)?;
    }
    Ok(())
}

fn run_map_helper(helper: &str, child: Pid, map: &IdMap) -> Result<()> {
    debug!("{helper} {child} {}", map.helper_args().join(" "));
    let status = Command::new(helper)
        .arg(child.to_string())
        .args(map.helper_args())
        .status()
        .with_context(|| format!("running {helper}"))?;
    if !status.success() {
        bail!("{helper} failed with {status}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// supervisor (the namespaced child)

fn supervisor(cfg: &LaunchConfig, from_parent: OwnedFd, to_parent: OwnedFd) -> i32 {
    let params = &cfg.params;

    let mut flags = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS;
    if params.unshare_net {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if let Err(e) = unshare(flags) {
        error!("unshare: {e}");
        return 1;
    }
    if send_token(&to_parent, TOKEN_UNSHARED).is_err() {
        return 1;
    }

    let newroot = match recv_enter(&from_parent) {
        Ok(Some(path)) => path,
        Ok(None) => {
            // Parent went away; nothing to report.
            debug!("parent exited before handover");
            return 0;
        }
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    if params.devprocsys {
        if let Err(e) = fs::bind_mount(MountPhase::Dev, Path::new("/dev"), &newroot.join("dev")) {
            error!("{e}");
            return e.phase.exit_code();
        }
        if let Err(e) = fs::bind_mount(MountPhase::Sys, Path::new("/sys"), &newroot.join("sys")) {
            error!("{e}");
            return e.phase.exit_code();
        }
    }
    for bm in &params.bind_mounts {
        let inside = bm.inside.strip_prefix("/").unwrap_or(&bm.inside);
        let target = newroot.join(inside);
        if let Err(e) = fs::bind_mount(MountPhase::Generic, &bm.outside, &target) {
            error!("{e}");
            return EXIT_MOUNT_FAILED;
        }
    }

    if let Err(e) = chroot(&newroot) {
        error!("chroot '{}': {e}", newroot.display());
        return 1;
    }
    if send_token(&to_parent, TOKEN_CHROOTED).is_err() {
        return 1;
    }

    if params.devprocsys {
        let with_tty_gid = params.gid_map.covers_inner(5);
        if let Err(e) = fs::mount_devpts(Path::new("/dev/pts"), with_tty_gid) {
            error!("{e}");
            return e.phase.exit_code();
        }
    }

    if let Err(e) = chdir(&params.new_workdir) {
        warn!("chdir '{}': {e}", params.new_workdir.display());
    }
    drop_identity(params);

    // wait() below needs SIGCHLD back at its default in case the invoker
    // started us with it ignored.
    let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGCHLD, &dfl);
    }

    let (gate_rx, gate_tx) = match pipe() {
        Ok(fds) => fds,
        Err(e) => {
            error!("pipe/gate: {e}");
            return 1;
        }
    };

    let interactive = params.devprocsys && io::stdin().is_terminal();
    if interactive {
        match unsafe { forkpty(None::<&nix::pty::Winsize>, None::<&nix::sys::termios::Termios>) } {
            Ok(ForkptyResult::Child) => grandchild(cfg, gate_rx),
            Ok(ForkptyResult::Parent { child, master }) => {
                if let Err(e) = relay::install(&[child]) {
                    warn!("signal relay: {e}");
                }
                let _ = send_token(&gate_tx, TOKEN_GO);
                if let Err(e) = pty::proxy(master) {
                    debug!("pty proxy: {e}");
                }
                wait_for(child)
            }
            Err(e) => {
                error!("forkpty: {e}");
                1
            }
        }
    } else {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => grandchild(cfg, gate_rx),
            Ok(ForkResult::Parent { child }) => {
                if let Err(e) = relay::install(&[child]) {
                    warn!("signal relay: {e}");
                }
                let _ = send_token(&gate_tx, TOKEN_GO);
                wait_for(child)
            }
            Err(e) => {
                error!("fork: {e}");
                1
            }
        }
    }
}

fn drop_identity(params: &ChildParams) {
    unsafe {
        if libc::setreuid(params.initial_uid, params.initial_uid) == -1 {
            warn!("setreuid({}): {}", params.initial_uid, Errno::last());
        }
        if libc::setregid(params.initial_gid, params.initial_gid) == -1 {
            warn!("setregid({}): {}", params.initial_gid, Errno::last());
        }
        if libc::setgroups(0, std::ptr::null()) == -1 {
            // Expected when setgroups was denied for the direct map write.
            debug!("setgroups: {}", Errno::last());
        }
    }
}

/// The process that becomes the user command: pid 1 of the new PID
/// namespace mounts its own proc, waits for the supervisor's go, and execs.
fn grandchild(cfg: &LaunchConfig, gate: OwnedFd) -> ! {
    if cfg.params.devprocsys {
        if let Err(e) = fs::mount_proc(Path::new("/proc")) {
            error!("{e}");
            exit(e.phase.exit_code());
        }
    }
    match wait_token(&gate) {
        Ok(Some(TOKEN_GO)) => {}
        _ => exit(1),
    }
    drop(gate);

    let args: Vec<CString> = cfg
        .command
        .iter()
        .filter_map(|a| CString::new(a.as_str()).ok())
        .collect();
    if args.len() != cfg.command.len() || args.is_empty() {
        error!("command contains an embedded NUL");
        exit(127);
    }
    let err = execvp(&args[0], &args).unwrap_err();
    error!("could not execute '{}': {}", cfg.command[0], err);
    exit(127);
}

// ---------------------------------------------------------------------------
// pipe tokens and status plumbing

fn send_token(fd: &OwnedFd, token: u8) -> nix::Result<()> {
    loop {
        match write(fd, &[token]) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Reads one token byte; `None` means the peer closed its end.
fn wait_token(fd: &OwnedFd) -> nix::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match read(fd, &mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

struct FdReader<'a>(&'a OwnedFd);

impl io::Read for FdReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match read(self.0, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// `'I'` plus the new-root path: the handover that unblocks the supervisor.
pub(crate) fn send_enter_fd(fd: &OwnedFd, newroot: &Path) -> Result<()> {
    let mut msg = vec![TOKEN_ENTER];
    wire::write_os_str(&mut msg, newroot.as_os_str()).context("encoding new root path")?;
    let mut rest: &[u8] = &msg;
    while !rest.is_empty() {
        match write(fd, rest) {
            Ok(n) => rest = &rest[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("sending new root path"),
        }
    }
    Ok(())
}

fn recv_enter(fd: &OwnedFd) -> Result<Option<PathBuf>> {
    match wait_token(fd)? {
        None => Ok(None),
        Some(TOKEN_ENTER) => {
            let mut reader = FdReader(fd);
            let path = wire::read_os_string(&mut reader).context("reading new root path")?;
            Ok(Some(PathBuf::from(path)))
        }
        Some(other) => bail!(
            "communication error in wait_parent: expected 'I', got '{}'",
            other as char
        ),
    }
}

/// Exit-status mapping: exit code, `128 + signal`, `0` for a child that was
/// already reaped, `255` for anything unaccountable.
pub fn wait_for(child: Pid) -> i32 {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, sig, _)) => return 128 + sig as i32,
            Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::Continued(..)) => continue,
            Ok(_) => return 255,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return 0,
            Err(e) => {
                error!("waitpid: {e}");
                return 255;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_relative_paths() {
        let mut params = ChildParams::default();
        params.new_root = PathBuf::from("root");
        assert!(params.validate().is_err());

        let mut params = ChildParams::default();
        params.bind_mounts.push(BindMount {
            outside: PathBuf::from("/x"),
            inside: PathBuf::from("y"),
        });
        assert!(params.validate().is_err());

        assert!(ChildParams::default().validate().is_ok());
    }
}

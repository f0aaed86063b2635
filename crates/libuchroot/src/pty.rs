//! The proxy between the invoker's terminal and the container's controlling
//! pseudo-terminal: raw-mode byte forwarding in both directions plus window
//! size propagation on `SIGWINCH`.

use std::io::{self, stdin, stdout};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use log::debug;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use nix::unistd::{read, write};

static MASTER_FD: AtomicI32 = AtomicI32::new(-1);

// The terminal size only exists behind TIOCGWINSZ, so the copy has to happen
// in the handler itself; both ioctls are async-signal-safe.
extern "C" fn winch_handler(_sig: libc::c_int) {
    let master = MASTER_FD.load(Ordering::Relaxed);
    if master < 0 {
        return;
    }
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    unsafe {
        if libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) == 0 {
            libc::ioctl(master, libc::TIOCSWINSZ, &ws);
        }
    }
}

fn install_winch(master: &OwnedFd) -> nix::Result<()> {
    MASTER_FD.store(master.as_raw_fd(), Ordering::Relaxed);
    let action = SigAction::new(
        SigHandler::Handler(winch_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGWINCH, &action)?;
    }
    // Sync the slave's idea of the size once at startup.
    winch_handler(0);
    Ok(())
}

/// Restores the saved terminal state when the proxy winds down, on success
/// and on error alike.
struct TermiosGuard {
    saved: Termios,
}

impl Drop for TermiosGuard {
    fn drop(&mut self) {
        let _ = tcsetattr(stdin(), SetArg::TCSANOW, &self.saved);
    }
}

/// Runs the byte pump between the invoker's terminal and the PTY master
/// until either side closes. The controlling terminal is switched to raw
/// mode for the duration.
pub fn proxy(master: OwnedFd) -> io::Result<()> {
    let saved = tcgetattr(stdin()).map_err(io::Error::from)?;
    let _guard = TermiosGuard { saved: saved.clone() };
    let mut raw = saved;
    cfmakeraw(&mut raw);
    tcsetattr(stdin(), SetArg::TCSANOW, &raw).map_err(io::Error::from)?;

    install_winch(&master).map_err(io::Error::from)?;

    let mut buf = [0u8; 4096];
    loop {
        let stdin_fd = stdin();
        let mut fds = [
            PollFd::new(stdin_fd.as_fd(), PollFlags::POLLIN),
            PollFd::new(master.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        let stdin_ready = fds[0].revents().unwrap_or(PollFlags::empty());
        let master_ready = fds[1].revents().unwrap_or(PollFlags::empty());

        if stdin_ready.intersects(PollFlags::POLLIN) {
            match read(stdin(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if write_full(&master, &buf[..n]).is_err() {
                        break;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        } else if stdin_ready.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            break;
        }

        if master_ready.intersects(PollFlags::POLLIN) {
            match read(&master, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if write_full(&stdout(), &buf[..n]).is_err() {
                        break;
                    }
                }
                Err(Errno::EINTR) => continue,
                // The slave side went away; the pump is done.
                Err(Errno::EIO) => break,
                Err(e) => return Err(e.into()),
            }
        } else if master_ready.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            break;
        }
    }
    debug!("pty proxy finished");
    Ok(())
}

fn write_full<F: AsFd>(fd: &F, mut data: &[u8]) -> nix::Result<()> {
    while !data.is_empty() {
        match write(fd, data) {
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

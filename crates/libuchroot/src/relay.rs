//! Forwards termination-class signals from a supervising process to its
//! children, so an operator signal to the launcher reaches the program
//! inside the container.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow, sigaction, sigprocmask,
};
use nix::unistd::Pid;

pub const RELAYED_SIGNALS: [Signal; 4] =
    [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGQUIT];

const MAX_TARGETS: usize = 4;

// Read from the signal handler; 0 means an empty slot.
static TARGETS: [AtomicI32; MAX_TARGETS] = [const { AtomicI32::new(0) }; MAX_TARGETS];

extern "C" fn relay_handler(sig: libc::c_int) {
    for slot in &TARGETS {
        let pid = slot.load(Ordering::Relaxed);
        if pid > 0 {
            unsafe {
                libc::kill(pid, sig);
            }
        }
    }
}

/// Installs (or re-targets) the relay for `children`. Installation is
/// idempotent; calling again replaces the target set. The relayed signals
/// are also unblocked in case the caller inherited a mask that blocks them.
pub fn install(children: &[Pid]) -> nix::Result<()> {
    for (i, slot) in TARGETS.iter().enumerate() {
        let pid = children.get(i).map_or(0, |p| p.as_raw());
        slot.store(pid, Ordering::Relaxed);
    }

    let action = SigAction::new(
        SigHandler::Handler(relay_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let mut set = SigSet::empty();
    for sig in RELAYED_SIGNALS {
        unsafe {
            sigaction(sig, &action)?;
        }
        set.add(sig);
    }
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)?;
    Ok(())
}

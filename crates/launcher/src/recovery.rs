//! The recovery process: a watchdog forked alongside the hypervisor whose
//! only job is to kill it if the library process dies abnormally, so a
//! crashed caller never leaves an orphaned VM behind.

use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{setpgid, sysconf, Pid, SysconfVar};
use std::time::Duration;

/// How often the watchdog checks whether either side is still alive.
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Body of the watchdog child. Never returns.
///
/// `parent_pid` is the library process, captured before the fork so the
/// check is not confused by reparenting. The loop polls both PIDs with
/// `kill(pid, 0)`. A PID may be reused by an unrelated process between
/// polls; that race is accepted in exchange for not needing any
/// platform-specific process handle. Either way the watchdog exits within
/// one poll interval of a target disappearing.
pub(crate) fn run_watchdog(
    vm_pid: Pid,
    parent_pid: Pid,
    poll_interval: Duration,
    new_process_group: bool,
) -> ! {
    reset_signal_handlers();
    close_inherited_fds();

    // Joining the hypervisor's process group would be nicer, but there is
    // no guarantee it has started yet.
    if new_process_group {
        let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    }

    loop {
        if kill(vm_pid, None).is_err() {
            // The hypervisor is gone, nothing left to guard.
            unsafe { libc::_exit(0) }
        }
        if kill(parent_pid, None).is_err() {
            // The library process is gone but the hypervisor is still
            // around: kill it.
            let _ = kill(vm_pid, Signal::SIGKILL);
            unsafe { libc::_exit(0) }
        }
        std::thread::sleep(poll_interval);
    }
}

/// Put every signal back to its default disposition. Handlers inherited
/// from the library (or whatever embeds it) must not run here.
fn reset_signal_handlers() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in Signal::iterator() {
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        let _ = unsafe { sigaction(signal, &default) };
    }
}

/// Close every descriptor we may have inherited, so the watchdog does not
/// hold open pipe ends or sockets belonging to the parent. The ceiling is
/// bounded to keep the work finite on hosts with huge fd limits.
fn close_inherited_fds() {
    let max_fd = match sysconf(SysconfVar::OPEN_MAX) {
        Ok(Some(max)) => max.min(65_536),
        _ => 1024,
    };
    #[allow(clippy::cast_possible_truncation)]
    for fd in 0..max_fd as i32 {
        unsafe {
            libc::close(fd);
        }
    }
}

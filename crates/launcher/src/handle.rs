use crate::appliance::DUMMY_APPLIANCE_DRIVE;
use crate::capability::Capabilities;
use crate::config::LaunchConfig;
use crate::drive::Drive;
use crate::error::{Error, Result};
use crate::peer::{PeerCredentialLookup, ProcNetTcp};
use nix::unistd::Pid;
use std::net::TcpStream;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Instant;
use tracing::debug;

/// Where the handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Accepting configuration and drives; nothing is running.
    Config,
    /// The hypervisor has been forked but the daemon has not checked in.
    Launching,
    /// Handshake complete; the data socket is live.
    Ready,
    /// The handle is being torn down.
    NoHandle,
}

/// Progress milestones reported during launch, on a 0..=12 scale.
pub const PROGRESS_TOTAL: u64 = 12;

pub type ProgressCallback = Box<dyn FnMut(u64) + Send>;

/// One appliance instance: configuration, drives, and (after a successful
/// launch) the running hypervisor with its authenticated daemon socket.
///
/// A handle drives at most one VM at a time and is owned by a single
/// thread; concurrent launches need distinct handles.
pub struct Handle {
    pub(crate) config: LaunchConfig,
    pub(crate) drives: Vec<Drive>,
    /// `(flag, value)` pairs appended to the hypervisor command line after
    /// everything else, in registration order, so they can override.
    pub(crate) extra_params: Vec<(String, Option<String>)>,
    pub(crate) state: HandleState,
    pub(crate) caps: Capabilities,

    /// Authenticated connection from the in-guest daemon, non-blocking.
    pub(crate) data_sock: Option<TcpStream>,
    /// Parent ends of the child's stdio pipes: (its stdin, its stdout;
    /// stderr shares the stdout pipe). Absent in direct mode.
    pub(crate) stdio: Option<(OwnedFd, OwnedFd)>,
    pub(crate) vm_pid: Option<Pid>,
    pub(crate) recovery_pid: Option<Pid>,
    pub(crate) launch_start: Option<Instant>,

    pub(crate) progress: Option<ProgressCallback>,
    pub(crate) peer_lookup: Box<dyn PeerCredentialLookup + Send>,
}

impl Handle {
    #[must_use]
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            drives: Vec::new(),
            extra_params: Vec::new(),
            state: HandleState::Config,
            caps: Capabilities::default(),
            data_sock: None,
            stdio: None,
            vm_pid: None,
            recovery_pid: None,
            launch_start: None,
            progress: None,
            peer_lookup: Box::new(ProcNetTcp::new()),
        }
    }

    /// Register a drive. Drives must be added before launch; hotplug is
    /// not supported.
    pub fn add_drive(&mut self, drive: Drive) {
        self.drives.push(drive);
    }

    #[must_use]
    pub fn drives(&self) -> &[Drive] {
        &self.drives
    }

    /// Append a raw hypervisor parameter, with an optional value.
    pub fn add_param(&mut self, flag: impl Into<String>, value: Option<String>) {
        self.extra_params.push((flag.into(), value));
    }

    #[must_use]
    pub fn state(&self) -> HandleState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// PID of the running hypervisor.
    ///
    /// # Errors
    ///
    /// [`Error::NoSubprocess`] when nothing is running.
    pub fn pid(&self) -> Result<Pid> {
        self.vm_pid.ok_or(Error::NoSubprocess)
    }

    /// The authenticated daemon socket, once the handle is ready.
    #[must_use]
    pub fn data_socket(&self) -> Option<&TcpStream> {
        self.data_sock.as_ref()
    }

    /// Parent ends of the child's stdio pipes (its stdin, its stdout).
    #[must_use]
    pub fn stdio(&self) -> Option<(BorrowedFd<'_>, BorrowedFd<'_>)> {
        self.stdio
            .as_ref()
            .map(|(stdin, stdout)| (stdin.as_fd(), stdout.as_fd()))
    }

    /// How many drives the hypervisor can address on the chosen bus.
    pub fn max_disks(&mut self) -> u32 {
        self.caps.max_disks(&self.config.hypervisor)
    }

    /// Called at each launch milestone with a position on a 0..=[`PROGRESS_TOTAL`] scale.
    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    /// Substitute the peer-credential source. Useful on platforms with a
    /// real peer-credential syscall, and in tests.
    pub fn set_peer_lookup(&mut self, lookup: Box<dyn PeerCredentialLookup + Send>) {
        self.peer_lookup = lookup;
    }

    pub(crate) fn send_progress(&mut self, position: u64) {
        if let Some(callback) = self.progress.as_mut() {
            callback(position);
        }
    }

    /// Verbose-mode breadcrumb, stamped with milliseconds since launch
    /// began.
    pub(crate) fn timestamped_message(&self, message: &str) {
        if !self.config.verbose {
            return;
        }
        let elapsed_ms = self
            .launch_start
            .map_or(0, |start| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
        debug!(elapsed_ms, "{message}");
    }

    /// Register a placeholder for the appliance disk so drive indices
    /// handed out after launch line up with what the guest sees.
    pub(crate) fn add_dummy_appliance_drive(&mut self) {
        let mut dummy = Drive::new(DUMMY_APPLIANCE_DRIVE);
        dummy.readonly = true;
        self.drives.push(dummy);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.vm_pid.is_some() || self.recovery_pid.is_some() {
            self.state = HandleState::NoHandle;
            let _ = self.shutdown_internal();
        }
    }
}

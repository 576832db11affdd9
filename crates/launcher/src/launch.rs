//! The launch state machine: probe the hypervisor, fork it with the
//! appliance attached, fork the recovery watchdog, then wait for the
//! in-guest daemon to dial back over loopback TCP and authenticate it.
//!
//! The callback channel is a "null vmchannel": the host listens on an
//! ephemeral loopback port, the guest reaches it through user-mode
//! networking, and security comes from checking that the connecting
//! process belongs to our own UID rather than from channel topology.

use crate::appliance::{appliance_command_line, ApplianceBuilder, ApplianceBundle};
use crate::capability::DiskBus;
use crate::cmdline::ArgvBuilder;
use crate::drive::{appliance_dev, drive_param};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleState};
use crate::recovery;
use guestkit_protocol::{accept_from_daemon, recv_from_daemon, DaemonMessage};
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{
    bind, getsockname, listen, socket, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{
    dup2_stderr, dup2_stdin, dup2_stdout, execve, fork, geteuid, getpid, pipe, pipe2, setpgid,
    ForkResult, Pid,
};
use std::convert::Infallible;
use std::ffi::CString;
use std::io::Write;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::time::Instant;
use tracing::{debug, warn};

/// Fixed user-mode network the guest lives on, with the host reachable at
/// the router address.
const NETWORK: &str = "10.0.2.0/24";
const ROUTER: &str = "10.0.2.2";

const KVM_DEVICE: &str = "/dev/kvm";

/// First byte written to the exec-status pipe by a failing child, so the
/// parent can tell a command-line parse error from any other pre-exec
/// failure.
const STATUS_TAG_CMDLINE: u8 = b'Q';
const STATUS_TAG_SETUP: u8 = b'E';

/// Both ends of both stdio pipes. The parent keeps `stdin_write` and
/// `stdout_read`; the child dup2s the other two over its stdio (stderr
/// shares the stdout pipe) and closes everything before exec.
struct StdioPipes {
    stdin_read: OwnedFd,
    stdin_write: OwnedFd,
    stdout_read: OwnedFd,
    stdout_write: OwnedFd,
}

impl StdioPipes {
    fn new() -> Result<Self> {
        let (stdin_read, stdin_write) = pipe()?;
        let (stdout_read, stdout_write) = pipe()?;
        Ok(Self {
            stdin_read,
            stdin_write,
            stdout_read,
            stdout_write,
        })
    }
}

impl Handle {
    /// Boot the appliance and wait for its daemon to check in.
    ///
    /// On success the handle is [`HandleState::Ready`] and
    /// [`Handle::data_socket`] carries the authenticated connection. On
    /// any failure every process and descriptor created along the way is
    /// torn down and the handle returns to [`HandleState::Config`].
    ///
    /// # Errors
    ///
    /// See [`Error`]; the variant identifies the phase that failed.
    pub fn launch(&mut self, appliance: &dyn ApplianceBuilder) -> Result<()> {
        // Drives cannot be hotplugged, so they must all be here already.
        if self.drives.is_empty() {
            return Err(Error::NoDrives);
        }
        if self.state != HandleState::Config {
            return Err(Error::WrongState(self.state));
        }

        self.launch_start = Some(Instant::now());
        match self.launch_inner(appliance) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.launch_cleanup();
                Err(e)
            }
        }
    }

    fn launch_inner(&mut self, appliance: &dyn ApplianceBuilder) -> Result<()> {
        self.send_progress(0);

        let bundle = appliance
            .build()
            .map_err(|e| Error::Appliance(e.to_string()))?;

        self.send_progress(3);
        self.timestamped_message("begin testing hypervisor features");

        // First-time probe; all capability decisions below read the cache.
        self.caps.supports_option(&self.config.hypervisor, None)?;

        // The daemon connects back to an ephemeral loopback port. Any
        // local process could do the same, hence the peer-UID check in the
        // accept loop below.
        let (listener, port) = listen_on_loopback()?;
        debug!(port, "vmchannel listening port");

        let pipes = if self.config.direct {
            None
        } else {
            Some(StdioPipes::new()?)
        };

        self.timestamped_message("finished testing hypervisor features");

        let bus = self.caps.disk_bus(&self.config.hypervisor);
        let envp = child_environment();

        let (status_read, status_write) = pipe2(OFlag::O_CLOEXEC)?;

        let vm_pid = match unsafe { fork() }.map_err(Error::Fork)? {
            ForkResult::Child => {
                drop(status_read);
                self.run_vm_child(&bundle, bus, port, pipes, status_write, &envp)
            }
            ForkResult::Parent { child } => child,
        };
        self.vm_pid = Some(vm_pid);
        drop(status_write);

        if self.config.recovery_proc {
            self.fork_recovery(vm_pid);
        }

        if let Some(pipes) = pipes {
            drop(pipes.stdin_read);
            drop(pipes.stdout_write);
            set_nonblocking(&pipes.stdin_write)?;
            set_nonblocking(&pipes.stdout_read)?;
            self.stdio = Some((pipes.stdin_write, pipes.stdout_read));
        }

        self.state = HandleState::Launching;

        // Accept until the connection provably comes from our own UID.
        // Retries are bounded only by the launch deadline; strangers get
        // their connection closed and we keep listening.
        let deadline = Instant::now() + self.config.launch_timeout;
        let our_uid = geteuid().as_raw();
        let mut status_read = Some(status_read);

        let stream = loop {
            let (stream, _) = accept_from_daemon(&listener, deadline, &mut status_read)
                .map_err(accept_error)?;
            let peer_uid = self.peer_lookup.peer_uid(&stream)?;
            if peer_uid != our_uid {
                warn!(peer_uid, port, "unexpected connection from another user, rejecting");
                drop(stream);
                continue;
            }
            break stream;
        };

        drop(listener);

        stream.set_nonblocking(true).map_err(|e| Error::Socket {
            op: "set_nonblocking",
            source: e,
        })?;

        // The daemon's first frame must be the launch sentinel.
        match recv_from_daemon(&stream, deadline) {
            Ok(DaemonMessage::Launch) => {}
            Ok(DaemonMessage::Frame(_)) => {
                return Err(Error::Handshake(
                    "guest daemon sent an unexpected message in place of the launch flag".into(),
                ));
            }
            Err(e) => return Err(Error::Handshake(e.to_string())),
        }

        self.timestamped_message("appliance is up");

        // The daemon can check in and the hypervisor still die straight
        // away (e.g. a bad drive). Callers expect to talk to the guest
        // after this returns, so verify the child is actually running.
        match waitpid(vm_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                self.vm_pid = None; // already reaped
                return Err(Error::Handshake(format!(
                    "hypervisor contacted the daemon but then {}",
                    describe_wait_status(&status)
                )));
            }
            Err(e) => return Err(Error::Handshake(e.to_string())),
        }

        self.data_sock = Some(stream);
        self.state = HandleState::Ready;
        self.send_progress(12);

        if bundle.root_image.is_some() {
            self.add_dummy_appliance_drive();
        }

        Ok(())
    }

    /// Reverse everything a partial launch may have set up. Closes the
    /// parent ends of both stdio pipes, kills and reaps both children,
    /// drops any sockets and resets the handle to the configuration state.
    fn launch_cleanup(&mut self) {
        self.stdio = None;

        if let Some(pid) = self.vm_pid {
            let _ = kill(pid, Signal::SIGKILL);
        }
        if let Some(pid) = self.recovery_pid {
            let _ = kill(pid, Signal::SIGKILL);
        }
        if let Some(pid) = self.vm_pid.take() {
            let _ = waitpid(pid, None);
        }
        if let Some(pid) = self.recovery_pid.take() {
            let _ = waitpid(pid, None);
        }

        self.data_sock = None;
        self.launch_start = None;
        self.state = HandleState::Config;
    }

    /// Fork the watchdog. Not having one is survivable, so failure only
    /// warns.
    fn fork_recovery(&mut self, vm_pid: Pid) {
        let parent_pid = getpid();
        let process_group = self.config.process_group;

        match unsafe { fork() } {
            Ok(ForkResult::Child) => recovery::run_watchdog(
                vm_pid,
                parent_pid,
                recovery::DEFAULT_POLL_INTERVAL,
                process_group,
            ),
            Ok(ForkResult::Parent { child }) => self.recovery_pid = Some(child),
            Err(e) => warn!(error = %e, "failed to fork the recovery process, continuing without it"),
        }
    }

    /// The hypervisor child. Builds argv from the pre-fork decisions,
    /// plumbs stdio, and execs. Never returns: any failure is written to
    /// the status pipe (and stderr) before exiting.
    fn run_vm_child(
        &self,
        bundle: &ApplianceBundle,
        bus: DiskBus,
        port: u16,
        pipes: Option<StdioPipes>,
        status_write: OwnedFd,
        envp: &[CString],
    ) -> ! {
        let err = match self.exec_vm(bundle, bus, port, pipes, envp) {
            Ok(never) => match never {},
            Err(e) => e,
        };

        let tag = match &err {
            Error::CmdlineParse(_) => STATUS_TAG_CMDLINE,
            _ => STATUS_TAG_SETUP,
        };
        let message = err.to_string();
        let _ = nix::unistd::write(&status_write, &[tag]);
        let _ = nix::unistd::write(&status_write, message.as_bytes());
        let _ = writeln!(std::io::stderr(), "guestkit: {message}");

        unsafe { libc::_exit(1) }
    }

    fn exec_vm(
        &self,
        bundle: &ApplianceBundle,
        bus: DiskBus,
        port: u16,
        pipes: Option<StdioPipes>,
        envp: &[CString],
    ) -> Result<Infallible> {
        let argv = self.build_child_argv(bundle, bus, port)?;

        if let Some(pipes) = pipes {
            dup2_stdin(&pipes.stdin_read)?;
            dup2_stdout(&pipes.stdout_write)?;
            // The hypervisor spews useful debug output on stderr; capture
            // it on the same pipe rather than confusing casual users.
            dup2_stderr(&pipes.stdout_write)?;
            drop(pipes);
        }

        // After the stderr plumbing, so the dump travels with the
        // hypervisor's own output.
        if self.config.verbose {
            let elapsed_ms = self
                .launch_start
                .map_or(0, |start| start.elapsed().as_millis());
            argv.dump(elapsed_ms);
        }

        if self.config.process_group {
            let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
        }

        let program = CString::new(self.config.hypervisor.as_os_str().as_bytes())
            .map_err(|_| Error::CmdlineParse("hypervisor path contains an embedded NUL".into()))?;
        let argv = argv.finalize()?;

        execve(&program, &argv, envp).map_err(|e| Error::CommandFailed {
            program: self.config.hypervisor.clone(),
            detail: format!("exec failed: {e}"),
        })?;
        unreachable!("execve returned without an error")
    }

    /// Assemble the child's command line. Every conditional reads the
    /// capability cache populated before the fork.
    fn build_child_argv(&self, bundle: &ApplianceBundle, bus: DiskBus, port: u16) -> Result<ArgvBuilder> {
        let caps = &self.caps;
        let mut argv = ArgvBuilder::new(&self.config.hypervisor);

        // CVE-2011-4127 mitigation: disable SCSI ioctls on virtio-blk
        // devices. -global accepts arbitrary strings, so only the option
        // itself needs to exist.
        if caps.has_option("-global") {
            argv.push("-global");
            argv.push("virtio-blk-pci.scsi=off");
        }

        if caps.has_option("-nodefconfig") {
            argv.push("-nodefconfig");
        }

        // Without -nodefaults, newer hypervisors assume an implicit
        // monitor on stdio in -nographic mode, which collides with the
        // -serial stdio below.
        if caps.has_option("-nodefaults") {
            argv.push("-nodefaults");
        }

        argv.push("-nographic");

        if caps.has_option("-machine") {
            // -machine falls back through the acceleration modes itself.
            argv.push("-machine");
            argv.push("accel=kvm:tcg");
        } else if caps.has_option("-enable-kvm") && is_openable(KVM_DEVICE) {
            // Some builds advertise -enable-kvm yet fail outright when
            // hardware virtualization is unavailable, so at least check
            // that the KVM device node can be opened.
            argv.push("-enable-kvm");
        }

        if self.config.smp > 1 {
            argv.push("-smp");
            argv.push(self.config.smp.to_string());
        }

        argv.push("-m");
        argv.push(self.config.memsize_mib.to_string());

        // Force exit instead of reboot on panic.
        argv.push("-no-reboot");

        // qemu-system-arm advertises -no-hpet but rejects it when used.
        if !cfg!(target_arch = "arm") && caps.has_option("-no-hpet") {
            argv.push("-no-hpet");
        }

        if caps.has_option("-rtc-td-hack") {
            argv.push("-rtc-td-hack");
        }

        argv.push("-kernel");
        argv.push(&bundle.kernel);
        argv.push("-initrd");
        argv.push(&bundle.initrd);

        if bus == DiskBus::VirtioScsi {
            argv.push("-device");
            argv.push("virtio-scsi-pci,id=scsi");
        }

        for (index, drive) in self.drives.iter().enumerate() {
            argv.push("-drive");
            argv.push(drive_param(drive, bus));

            if bus == DiskBus::VirtioScsi && drive.iface.is_none() {
                argv.push("-device");
                argv.push(format!("scsi-hd,drive=hd{index}"));
            }
        }

        // The appliance disk rides after all user drives, always as a
        // snapshot. Its data is disposable, so the loosest cache mode the
        // hypervisor understands is fine.
        let mut appliance_root = None;
        if let Some(root_image) = &bundle.root_image {
            let cachemode = if caps.has_option("cache=") {
                if caps.has_option("unsafe") {
                    ",cache=unsafe"
                } else if caps.has_option("writeback") {
                    ",cache=writeback"
                } else {
                    ""
                }
            } else {
                ""
            };

            argv.push("-drive");
            argv.push(format!(
                "file={},snapshot=on,if={}{}",
                root_image.to_string_lossy(),
                if bus == DiskBus::VirtioScsi { "none" } else { "virtio" },
                cachemode
            ));

            if bus == DiskBus::VirtioScsi {
                argv.push("-device");
                argv.push("scsi-hd,drive=appliance");
            }

            appliance_root = Some(appliance_dev(&self.drives, bus));
        }

        argv.push("-serial");
        argv.push("stdio");

        argv.push("-net");
        argv.push(format!("user,vlan=0,net={NETWORK}"));
        argv.push("-net");
        argv.push("nic,model=virtio,vlan=0");

        let vmchannel = format!("guestfs_vmchannel=tcp:{ROUTER}:{port}");
        argv.push("-append");
        argv.push(appliance_command_line(
            appliance_root.as_deref(),
            &vmchannel,
            self.config.verbose,
        ));

        // User-supplied options come last so the hypervisor's -set can
        // modify anything added above.
        if !self.config.hypervisor_options.is_empty() {
            argv.push_shell(&self.config.hypervisor_options)?;
        }

        for (flag, value) in &self.extra_params {
            argv.push(flag);
            if let Some(value) = value {
                argv.push(value);
            }
        }

        Ok(argv)
    }

    /// Tear the appliance down.
    ///
    /// SIGTERM asks the hypervisor to exit cleanly; the watchdog is simply
    /// killed. Re-entry after a completed shutdown is a no-op returning
    /// `Ok`.
    ///
    /// # Errors
    ///
    /// [`Error::CommandFailed`] when the hypervisor did not exit with
    /// status zero.
    pub fn shutdown(&mut self) -> Result<()> {
        self.shutdown_internal()
    }

    pub(crate) fn shutdown_internal(&mut self) -> Result<()> {
        if self.vm_pid.is_none() && self.recovery_pid.is_none() && self.state == HandleState::Config
        {
            return Ok(());
        }

        let mut result = Ok(());

        if let Some(pid) = self.vm_pid {
            debug!(pid = pid.as_raw(), "sending SIGTERM to hypervisor");
            let _ = kill(pid, Signal::SIGTERM);
        }
        if let Some(pid) = self.recovery_pid {
            let _ = kill(pid, Signal::SIGKILL);
        }

        // When the recovery process is disabled the embedding application
        // may be reaping children itself, so only wait when it is ours to
        // wait for.
        if self.config.recovery_proc {
            if let Some(pid) = self.vm_pid.take() {
                match waitpid(pid, None) {
                    Err(e) => result = Err(e.into()),
                    Ok(WaitStatus::Exited(_, 0)) => {}
                    Ok(status) => {
                        result = Err(Error::CommandFailed {
                            program: self.config.hypervisor.clone(),
                            detail: describe_wait_status(&status),
                        });
                    }
                }
            }
        }
        if let Some(pid) = self.recovery_pid.take() {
            let _ = waitpid(pid, None);
        }

        self.vm_pid = None;
        self.recovery_pid = None;
        self.data_sock = None;
        self.stdio = None;
        self.launch_start = None;
        self.caps.clear();
        self.state = HandleState::Config;

        result
    }
}

/// Loopback listener on a kernel-assigned port, non-blocking, with a
/// backlog wide enough that a burst of strangers cannot crowd out the
/// daemon.
fn listen_on_loopback() -> Result<(TcpListener, u16)> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| socket_error("socket", e))?;

    let addr = SockaddrIn::new(127, 0, 0, 1, 0);
    bind(fd.as_raw_fd(), &addr).map_err(|e| socket_error("bind", e))?;
    listen(&fd, Backlog::new(256).unwrap()).map_err(|e| socket_error("listen", e))?;

    let bound: SockaddrIn = getsockname(fd.as_raw_fd()).map_err(|e| socket_error("getsockname", e))?;

    let listener = TcpListener::from(fd);
    listener.set_nonblocking(true).map_err(|e| Error::Socket {
        op: "set_nonblocking",
        source: e,
    })?;

    Ok((listener, bound.port()))
}

fn socket_error(op: &'static str, errno: nix::errno::Errno) -> Error {
    Error::Socket {
        op,
        source: std::io::Error::from_raw_os_error(errno as i32),
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(|e| socket_error("fcntl", e))?;
    Ok(())
}

/// Map an accept failure onto the launch error taxonomy. A child that
/// died before exec reports through the status pipe; the tag byte says
/// whether it was a command-line parse error.
fn accept_error(e: guestkit_protocol::Error) -> Error {
    match e {
        guestkit_protocol::Error::Aborted(raw) => match raw.as_bytes().first() {
            Some(&STATUS_TAG_CMDLINE) => Error::CmdlineParse(raw[1..].to_string()),
            Some(&STATUS_TAG_SETUP) => Error::ChildSetup(raw[1..].to_string()),
            _ => Error::ChildSetup(raw),
        },
        other => Error::Handshake(other.to_string()),
    }
}

fn describe_wait_status(status: &WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exited with status {code}"),
        WaitStatus::Signaled(_, signal, _) => format!("was killed by signal {signal}"),
        other => format!("changed state unexpectedly ({other:?})"),
    }
}

/// Whether `path` can be opened for read/write. Used to sanity-check the
/// KVM device node before passing -enable-kvm.
fn is_openable(path: &str) -> bool {
    match std::fs::OpenOptions::new().read(true).write(true).open(path) {
        Ok(_) => true,
        Err(e) => {
            debug!(path, error = %e, "not openable");
            false
        }
    }
}

fn child_environment() -> Vec<CString> {
    let mut env: Vec<CString> = std::env::vars_os()
        .filter(|(key, _)| key != "LC_ALL")
        .filter_map(|(key, value)| {
            let mut bytes = key.into_vec();
            bytes.push(b'=');
            bytes.extend(value.into_vec());
            CString::new(bytes).ok()
        })
        .collect();
    env.push(c"LC_ALL=C".to_owned());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchConfig;
    use crate::drive::Drive;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Fake hypervisor answering the probe invocations, so argv assembly
    /// can be exercised against a known feature set.
    fn fake_hypervisor(dir: &tempfile::TempDir, help: &str, devices: &str) -> PathBuf {
        let path = dir.path().join("fake-hv");
        let script = format!(
            "#!/bin/sh\n\
             case \"$1\" in\n\
             -nographic) cat <<'HELP_EOF'\n{help}\nHELP_EOF\n;;\n\
             -version) echo \"Fake hypervisor version 2.1.0\" ;;\n\
             -device) cat <<'DEV_EOF'\n{devices}\nDEV_EOF\n;;\n\
             esac\n\
             exit 0\n"
        );
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(script.as_bytes()).unwrap();
        file.set_permissions(std::fs::Permissions::from_mode(0o755))
            .unwrap();
        path
    }

    fn probed_handle(dir: &tempfile::TempDir, help: &str, devices: &str) -> Handle {
        let config = LaunchConfig::default().with_hypervisor(fake_hypervisor(dir, help, devices));
        let mut handle = Handle::new(config);
        handle
            .caps
            .supports_option(&handle.config.hypervisor.clone(), None)
            .unwrap();
        handle
    }

    fn bundle(root: Option<&str>) -> ApplianceBundle {
        ApplianceBundle {
            kernel: PathBuf::from("/appliance/kernel"),
            initrd: PathBuf::from("/appliance/initrd"),
            root_image: root.map(PathBuf::from),
        }
    }

    #[test]
    fn argv_for_plain_virtio_blk_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = probed_handle(
            &dir,
            "-machine -nodefaults -nodefconfig cache= unsafe writeback",
            "name \"e1000\"",
        );
        handle.config.memsize_mib = 512;
        handle.add_drive(Drive::new("/a/b.img"));

        let bus = handle.caps.disk_bus(&handle.config.hypervisor.clone());
        assert_eq!(bus, DiskBus::VirtioBlk);

        let argv = handle
            .build_child_argv(&bundle(Some("/appliance/root")), bus, 4321)
            .unwrap();
        let tokens = argv.tokens();

        let count = |t: &str| tokens.iter().filter(|x| x.as_str() == t).count();
        assert_eq!(count("file=/a/b.img,if=virtio"), 1);
        assert_eq!(count("accel=kvm:tcg"), 1);
        assert_eq!(count("-machine"), 1);
        assert_eq!(count("-no-reboot"), 1);

        let m = tokens.iter().position(|t| t == "-m").unwrap();
        assert_eq!(tokens[m + 1], "512");

        // smp == 1 stays off the command line.
        assert_eq!(count("-smp"), 0);

        assert_eq!(
            count("file=/appliance/root,snapshot=on,if=virtio,cache=unsafe"),
            1
        );
        assert!(!tokens.iter().any(|t| t.contains("virtio-scsi-pci")));

        let append = tokens.iter().position(|t| t == "-append").unwrap();
        assert!(tokens[append + 1].contains("root=/dev/vdb"));
        assert!(tokens[append + 1].contains("guestfs_vmchannel=tcp:10.0.2.2:4321"));
    }

    #[test]
    fn argv_for_virtio_scsi_with_mixed_legacy_ifaces() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = probed_handle(
            &dir,
            "-machine -nodefaults cache= unsafe",
            "name \"virtio-scsi-pci\", bus PCI",
        );

        let mut ide = Drive::new("/d0");
        ide.iface = Some("ide".into());
        handle.add_drive(ide);
        handle.add_drive(Drive::new("/d1"));
        let mut virtio = Drive::new("/d2");
        virtio.iface = Some("virtio".into());
        handle.add_drive(virtio);

        assert_eq!(handle.caps.version(), (2, 1));
        let bus = handle.caps.disk_bus(&handle.config.hypervisor.clone());
        assert_eq!(bus, DiskBus::VirtioScsi);

        let argv = handle
            .build_child_argv(&bundle(Some("/appliance/root")), bus, 9000)
            .unwrap();
        let tokens = argv.tokens();

        let count = |t: &str| tokens.iter().filter(|x| x.as_str() == t).count();
        assert_eq!(count("virtio-scsi-pci,id=scsi"), 1);
        assert_eq!(count("file=/d0,if=ide"), 1);
        assert_eq!(count("file=/d1,if=none"), 1);
        assert_eq!(count("file=/d2,if=virtio"), 1);
        // Only the iface-less drive gets a scsi-hd device.
        assert_eq!(count("scsi-hd,drive=hd1"), 1);
        assert_eq!(count("scsi-hd,drive=hd0"), 0);
        assert_eq!(count("scsi-hd,drive=hd2"), 0);
        assert_eq!(count("scsi-hd,drive=appliance"), 1);

        // Two drives (unset + ide) share the appliance bus, so the
        // appliance disk is the third device.
        let append = tokens.iter().position(|t| t == "-append").unwrap();
        assert!(tokens[append + 1].contains("root=/dev/sdc"));
    }

    #[test]
    fn extra_params_land_last_in_registration_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = probed_handle(&dir, "-machine", "none");
        handle.add_drive(Drive::new("/a.img"));
        handle.config.hypervisor_options = "-set 'drive.hd0.file=/x y'".to_string();
        handle.add_param("-cpu", Some("host".to_string()));
        handle.add_param("-S", None);

        let argv = handle
            .build_child_argv(&bundle(None), DiskBus::VirtioBlk, 1)
            .unwrap();
        let tokens = argv.tokens();

        let n = tokens.len();
        assert_eq!(tokens[n - 1], "-S");
        assert_eq!(tokens[n - 2], "host");
        assert_eq!(tokens[n - 3], "-cpu");
        assert_eq!(tokens[n - 4], "drive.hd0.file=/x y");
        assert_eq!(tokens[n - 5], "-set");

        // No appliance root image, so no root= in the kernel command line.
        let append = tokens.iter().position(|t| t == "-append").unwrap();
        assert!(!tokens[append + 1].contains("root="));
    }

    #[test]
    fn child_environment_pins_locale() {
        let env = child_environment();
        let lc_all: Vec<_> = env
            .iter()
            .filter(|e| e.to_bytes().starts_with(b"LC_ALL="))
            .collect();
        assert_eq!(lc_all.len(), 1);
        assert_eq!(lc_all[0].to_bytes(), b"LC_ALL=C");
    }

    #[test]
    fn listener_is_loopback_ephemeral_and_nonblocking() {
        let (listener, port) = listen_on_loopback().unwrap();
        assert_ne!(port, 0);
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), port);

        // Non-blocking: accept with no pending connection returns
        // WouldBlock instead of hanging.
        match listener.accept() {
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock),
            Ok(_) => panic!("unexpected connection"),
        }
    }

    #[test]
    fn wait_status_descriptions() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            describe_wait_status(&WaitStatus::Exited(pid, 3)),
            "exited with status 3"
        );
        assert!(
            describe_wait_status(&WaitStatus::Signaled(pid, Signal::SIGKILL, false))
                .contains("SIGKILL")
        );
    }

    #[test]
    fn accept_error_classification() {
        let parse = accept_error(guestkit_protocol::Error::Aborted("Qunclosed quote".into()));
        assert!(matches!(parse, Error::CmdlineParse(msg) if msg == "unclosed quote"));

        let setup = accept_error(guestkit_protocol::Error::Aborted("Eexec failed".into()));
        assert!(matches!(setup, Error::ChildSetup(msg) if msg == "exec failed"));

        let timeout = accept_error(guestkit_protocol::Error::Timeout("waiting"));
        assert!(matches!(timeout, Error::Handshake(_)));
    }
}

use guestkit_protocol::DEFAULT_LAUNCH_TIMEOUT;
use std::path::PathBuf;
use std::time::Duration;

/// Environment override for the hypervisor binary, checked once when the
/// configuration is created.
pub const HYPERVISOR_ENV: &str = "GUESTKIT_HYPERVISOR";

const DEFAULT_HYPERVISOR: &str = "qemu-system-x86_64";

/// Launch-time configuration, snapshotted by the handle when it is created.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the hypervisor binary (qemu or a compatible wrapper).
    pub hypervisor: PathBuf,
    /// Guest memory in MiB.
    pub memsize_mib: u32,
    /// Number of virtual CPUs. Only emitted on the command line when > 1.
    pub smp: u32,
    /// Emit timestamped breadcrumbs and dump the child command line.
    pub verbose: bool,
    /// Let the child inherit our stdio instead of wiring it through pipes.
    pub direct: bool,
    /// Put the hypervisor and the recovery process in their own process
    /// groups.
    pub process_group: bool,
    /// Fork a watchdog that kills the hypervisor if this process dies.
    pub recovery_proc: bool,
    /// Extra options appended to the command line, split with shell-style
    /// quoting. Applied after everything else so they can override.
    pub hypervisor_options: String,
    /// How long the whole rendezvous may take.
    pub launch_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        let hypervisor = std::env::var_os(HYPERVISOR_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_HYPERVISOR), PathBuf::from);

        Self {
            hypervisor,
            memsize_mib: 500,
            smp: 1,
            verbose: false,
            direct: false,
            process_group: false,
            recovery_proc: true,
            hypervisor_options: String::new(),
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
        }
    }
}

impl LaunchConfig {
    #[must_use]
    pub fn with_hypervisor(mut self, path: impl Into<PathBuf>) -> Self {
        self.hypervisor = path.into();
        self
    }

    #[must_use]
    pub fn with_memsize_mib(mut self, mib: u32) -> Self {
        self.memsize_mib = mib;
        self
    }

    #[must_use]
    pub fn with_smp(mut self, smp: u32) -> Self {
        self.smp = smp;
        self
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    #[must_use]
    pub fn with_direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    #[must_use]
    pub fn with_process_group(mut self, process_group: bool) -> Self {
        self.process_group = process_group;
        self
    }

    #[must_use]
    pub fn with_recovery_proc(mut self, recovery_proc: bool) -> Self {
        self.recovery_proc = recovery_proc;
        self
    }

    #[must_use]
    pub fn with_hypervisor_options(mut self, options: impl Into<String>) -> Self {
        self.hypervisor_options = options.into();
        self
    }

    #[must_use]
    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }
}

use crate::error::{Error, Result};
use regex::Regex;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use tracing::debug;

/// Compiled once on first use and shared by every handle; the regex
/// runtime is documented as thread-safe.
static RE_MAJOR_MINOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)").unwrap());

/// Which bus the appliance disk (and iface-less user drives) ride on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskBus {
    VirtioScsi,
    VirtioBlk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum VirtioScsi {
    #[default]
    Untested,
    Supported,
    Unsupported,
    ProbeFailed,
}

/// What the hypervisor binary can do, learned by running it.
///
/// The hypervisor's command-line grammar shifts between versions, so every
/// feature decision greps the captured help/device listings instead of
/// assuming. All fields are populated together by one probe and stay
/// valid until [`Capabilities::clear`], which shutdown calls so a swapped
/// binary cannot inherit stale claims.
#[derive(Debug, Default)]
pub(crate) struct Capabilities {
    help: Option<String>,
    version_text: Option<String>,
    devices: Option<String>,
    version: (u32, u32),
    virtio_scsi: VirtioScsi,
}

impl Capabilities {
    /// Is `option` mentioned in the hypervisor's help text?
    ///
    /// Runs the probe on first use. `None` just forces that first run,
    /// answering whether the binary works at all.
    pub(crate) fn supports_option(&mut self, hypervisor: &Path, option: Option<&str>) -> Result<bool> {
        if self.help.is_none() {
            self.probe(hypervisor)?;
        }
        match option {
            None => Ok(true),
            Some(option) => Ok(self.has_option(option)),
        }
    }

    /// Is `device` mentioned in the hypervisor's device listing?
    pub(crate) fn supports_device(&mut self, hypervisor: &Path, device: &str) -> Result<bool> {
        if self.devices.is_none() {
            self.probe(hypervisor)?;
        }
        Ok(self.has_device(device))
    }

    /// Cache-only lookup. Used by the forked child, which must not spawn
    /// further probes; the launch path populates the cache first.
    pub(crate) fn has_option(&self, option: &str) -> bool {
        self.help.as_deref().is_some_and(|help| help.contains(option))
    }

    pub(crate) fn has_device(&self, device: &str) -> bool {
        self.devices
            .as_deref()
            .is_some_and(|devices| devices.contains(device))
    }

    pub(crate) fn version(&self) -> (u32, u32) {
        self.version
    }

    /// Pick the disk bus. The answer is sticky for the life of the cache.
    ///
    /// Version 1.1 claims virtio-scsi support but the implementation is
    /// broken, so it is treated as unsupported. A failed device probe also
    /// falls back to virtio-blk.
    pub(crate) fn disk_bus(&mut self, hypervisor: &Path) -> DiskBus {
        if self.help.is_none() && self.probe(hypervisor).is_err() {
            return DiskBus::VirtioBlk;
        }

        if self.virtio_scsi == VirtioScsi::Untested {
            self.virtio_scsi = if self.broken_virtio_scsi() {
                VirtioScsi::Unsupported
            } else {
                match self.supports_device(hypervisor, "virtio-scsi-pci") {
                    Ok(true) => VirtioScsi::Supported,
                    Ok(false) => VirtioScsi::Unsupported,
                    Err(e) => {
                        debug!(error = %e, "virtio-scsi probe failed, using virtio-blk");
                        VirtioScsi::ProbeFailed
                    }
                }
            };
        }

        if self.virtio_scsi == VirtioScsi::Supported {
            DiskBus::VirtioScsi
        } else {
            DiskBus::VirtioBlk
        }
    }

    /// Ceiling on the number of drives the chosen bus can address.
    pub(crate) fn max_disks(&mut self, hypervisor: &Path) -> u32 {
        match self.disk_bus(hypervisor) {
            DiskBus::VirtioScsi => 255,
            // Conservative estimate for virtio-blk.
            DiskBus::VirtioBlk => 27,
        }
    }

    /// Forget everything learned about the binary.
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    fn broken_virtio_scsi(&self) -> bool {
        self.version.0 == 1 && self.version.1 < 2
    }

    /// Run the binary and capture help, version and device listings.
    ///
    /// Only the help run is load-bearing: if it cannot be spawned or exits
    /// non-zero the probe fails (and with it the launch). Version and
    /// device output are best-effort and may legitimately be empty. The
    /// cache is committed in one piece so a half-probed state is never
    /// observable.
    fn probe(&mut self, hypervisor: &Path) -> Result<()> {
        let help_out = run_probe(hypervisor, &["-nographic", "-help"]).map_err(|e| Error::Probe {
            hypervisor: hypervisor.to_path_buf(),
            detail: e.to_string(),
        })?;
        if !help_out.status.success() {
            return Err(Error::Probe {
                hypervisor: hypervisor.to_path_buf(),
                detail: format!(
                    "`-help` {}: {}",
                    help_out.status,
                    String::from_utf8_lossy(&help_out.stderr).trim()
                ),
            });
        }
        let help = String::from_utf8_lossy(&help_out.stdout).into_owned();

        let version_text = match run_probe(hypervisor, &["-version"]) {
            Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
            Err(e) => {
                debug!(error = %e, "version probe failed");
                String::new()
            }
        };

        // Old hypervisors print the device list on stderr, newer ones on
        // stdout; take both. A non-zero exit here is not a failure.
        let devices = match run_probe(hypervisor, &["-device", "?"]) {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                text
            }
            Err(e) => {
                debug!(error = %e, "device probe failed");
                String::new()
            }
        };

        let version = parse_version(&version_text);
        debug!(major = version.0, minor = version.1, "hypervisor version");

        self.help = Some(help);
        self.version_text = Some(version_text);
        self.devices = Some(devices);
        self.version = version;
        Ok(())
    }
}

fn run_probe(hypervisor: &Path, args: &[&str]) -> std::io::Result<std::process::Output> {
    Command::new(hypervisor)
        .args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .output()
}

/// First `major.minor` in the version text; 0.0 when there is none.
fn parse_version(version_text: &str) -> (u32, u32) {
    let Some(caps) = RE_MAJOR_MINOR.captures(version_text) else {
        debug!(version_text, "failed to parse hypervisor version string");
        return (0, 0);
    };
    // Both groups are all-digits; overflow of u32 is the only way the
    // parse can fail, and such a version string deserves (0, 0) too.
    match (caps[1].parse(), caps[2].parse()) {
        (Ok(major), Ok(minor)) => (major, minor),
        _ => {
            debug!(version_text, "failed to parse hypervisor version string");
            (0, 0)
        }
    }
}

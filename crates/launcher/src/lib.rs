//! Boot a minimal guest appliance under a qemu-like hypervisor and
//! establish a trusted channel to the daemon running inside it.
//!
//! The [`Handle`] owns the whole lifecycle: it probes what the hypervisor
//! binary can do (its command-line grammar is not stable across
//! versions), forks the VM with the appliance kernel/initrd and the
//! caller's drives attached, forks a recovery watchdog so a crashed
//! caller cannot leak a running VM, and then waits on a loopback TCP
//! socket for the in-guest daemon to dial back. The connecting process is
//! authenticated by effective UID before the socket is published.
//!
//! ```no_run
//! use guestkit_launcher::{Drive, FixedAppliance, Handle, LaunchConfig};
//!
//! # fn main() -> guestkit_launcher::Result<()> {
//! let mut handle = Handle::new(LaunchConfig::default());
//! handle.add_drive(Drive::new("/var/lib/guests/disk.img"));
//!
//! let appliance = FixedAppliance {
//!     kernel: "/var/lib/guestkit/kernel".into(),
//!     initrd: "/var/lib/guestkit/initrd".into(),
//!     root_image: Some("/var/lib/guestkit/root".into()),
//! };
//!
//! handle.launch(&appliance)?;
//! // ... talk to the daemon over handle.data_socket() ...
//! handle.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod appliance;
mod capability;
mod cmdline;
pub mod config;
mod drive;
pub mod error;
mod handle;
mod launch;
pub mod peer;
mod recovery;

pub use appliance::{ApplianceBuilder, ApplianceBundle, FixedAppliance};
pub use capability::DiskBus;
pub use config::LaunchConfig;
pub use drive::Drive;
pub use error::{Error, Result};
pub use handle::{Handle, HandleState, ProgressCallback, PROGRESS_TOTAL};
pub use peer::{PeerCredentialLookup, ProcNetTcp};

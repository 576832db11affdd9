use crate::error::{Error, Result};
use std::fmt::Write;
use std::path::PathBuf;

/// What the appliance builder hands back: a bootable kernel and initrd,
/// plus the root filesystem image when the build produces one.
#[derive(Debug, Clone)]
pub struct ApplianceBundle {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub root_image: Option<PathBuf>,
}

/// Locates or builds the appliance. The real builder lives outside this
/// crate; the launcher only cares that it yields a bundle or an error.
pub trait ApplianceBuilder {
    /// # Errors
    ///
    /// Any failure here fails the launch with the builder's message.
    fn build(&self) -> Result<ApplianceBundle>;
}

/// An appliance whose pieces already exist on disk.
#[derive(Debug, Clone)]
pub struct FixedAppliance {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub root_image: Option<PathBuf>,
}

impl ApplianceBuilder for FixedAppliance {
    fn build(&self) -> Result<ApplianceBundle> {
        for path in [Some(&self.kernel), Some(&self.initrd), self.root_image.as_ref()]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                return Err(Error::Appliance(format!(
                    "appliance file `{}` does not exist",
                    path.display()
                )));
            }
        }

        Ok(ApplianceBundle {
            kernel: self.kernel.clone(),
            initrd: self.initrd.clone(),
            root_image: self.root_image.clone(),
        })
    }
}

/// Kernel command line for the appliance.
///
/// `vmchannel` arrives fully formed (`guestfs_vmchannel=tcp:...`) because
/// the listening port is only known at launch time.
pub(crate) fn appliance_command_line(
    root_device: Option<&str>,
    vmchannel: &str,
    verbose: bool,
) -> String {
    let mut cmdline = String::from(
        "panic=1 console=ttyS0 udevtimeout=600 no_timer_check acpi=off printk.time=1",
    );

    write!(cmdline, " {vmchannel}").unwrap();

    if let Some(root) = root_device {
        write!(cmdline, " root={root}").unwrap();
    }
    cmdline.push_str(" selinux=0");
    if verbose {
        cmdline.push_str(" guestfs_verbose=1");
    }
    cmdline.push_str(" TERM=xterm");

    cmdline
}

/// Placeholder path used for the dummy drive registered after launch so
/// later drive indices stay aligned with the appliance disk.
pub(crate) const DUMMY_APPLIANCE_DRIVE: &str = "/dev/null";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_carries_vmchannel_and_root() {
        let cmdline = appliance_command_line(
            Some("/dev/vda"),
            "guestfs_vmchannel=tcp:10.0.2.2:4321",
            false,
        );
        assert!(cmdline.contains("guestfs_vmchannel=tcp:10.0.2.2:4321"));
        assert!(cmdline.contains("root=/dev/vda"));
        assert!(cmdline.starts_with("panic=1"));
        assert!(!cmdline.contains("guestfs_verbose"));
    }

    #[test]
    fn command_line_without_root_image() {
        let cmdline = appliance_command_line(None, "guestfs_vmchannel=tcp:10.0.2.2:1", true);
        assert!(!cmdline.contains("root="));
        assert!(cmdline.contains("guestfs_verbose=1"));
    }

    #[test]
    fn fixed_appliance_requires_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("kernel");
        let initrd = dir.path().join("initrd");
        std::fs::write(&kernel, b"k").unwrap();

        let appliance = FixedAppliance {
            kernel: kernel.clone(),
            initrd: initrd.clone(),
            root_image: None,
        };
        assert!(matches!(appliance.build(), Err(Error::Appliance(_))));

        std::fs::write(&initrd, b"i").unwrap();
        let bundle = appliance.build().unwrap();
        assert_eq!(bundle.kernel, kernel);
        assert!(bundle.root_image.is_none());
    }
}

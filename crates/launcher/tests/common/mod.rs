//! Helpers shared by the launcher integration tests: fake hypervisor
//! scripts that answer the capability probes, and on-disk appliance
//! pieces.

use guestkit_launcher::FixedAppliance;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Route launcher tracing through the test harness; filter with
/// `RUST_LOG` as usual.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Help text that steers the launcher down the modern option paths.
pub const DEFAULT_HELP: &str =
    "-machine -nodefaults -nodefconfig -no-reboot -serial -net -kernel cache= unsafe writeback";

/// Write an executable fake hypervisor. It answers the three probe
/// invocations (`-nographic -help`, `-version`, `-device ?`) from the
/// given strings and otherwise runs `body` with the full launch argv.
pub fn fake_hypervisor(
    dir: &Path,
    interpreter: &str,
    help: &str,
    devices: &str,
    body: &str,
) -> PathBuf {
    let path = dir.join("fake-hypervisor");
    let script = format!(
        "#!{interpreter}\n\
         case \"$1\" in\n\
         -nographic) if [ \"$2\" = \"-help\" ]; then cat <<'HELP_EOF'\n{help}\nHELP_EOF\n\
         exit 0; fi ;;\n\
         -version) echo \"Fake hypervisor version 2.1.0\"; exit 0 ;;\n\
         -device) cat <<'DEV_EOF'\n{devices}\nDEV_EOF\n\
         exit 0 ;;\n\
         esac\n\
         {body}\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Kernel + initrd (+ optional root image) as real files in `dir`.
pub fn appliance_on_disk(dir: &Path, with_root: bool) -> FixedAppliance {
    let kernel = dir.join("kernel");
    let initrd = dir.join("initrd");
    std::fs::write(&kernel, b"fake kernel").unwrap();
    std::fs::write(&initrd, b"fake initrd").unwrap();

    let root_image = with_root.then(|| {
        let root = dir.join("root");
        std::fs::write(&root, b"fake root").unwrap();
        root
    });

    FixedAppliance {
        kernel,
        initrd,
        root_image,
    }
}

/// A drive backing file the handle can register.
pub fn drive_file(dir: &Path) -> PathBuf {
    let path = dir.join("disk.img");
    std::fs::write(&path, b"disk").unwrap();
    path
}

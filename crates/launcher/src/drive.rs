use crate::capability::DiskBus;
use std::path::PathBuf;

/// One backing file exposed to the guest as a virtual disk.
///
/// `iface` is a legacy knob. Its format was never pinned down, but existing
/// usage only ever produced three values: unset, `"ide"` or `"virtio"`
/// (meaning virtio-blk). Anything else is passed through to the hypervisor
/// verbatim and treated as not-`"virtio"` when device names are computed.
#[derive(Debug, Clone)]
pub struct Drive {
    pub path: PathBuf,
    pub iface: Option<String>,
    pub format: Option<String>,
    pub disk_label: Option<String>,
    pub readonly: bool,
    pub use_cache_none: bool,
}

impl Drive {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            iface: None,
            format: None,
            disk_label: None,
            readonly: false,
            use_cache_none: false,
        }
    }
}

/// Double every `,` so the value survives qemu's comma-separated option
/// grammar. Nothing else needs escaping.
pub(crate) fn escape_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == ',' {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
pub(crate) fn unescape_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' && chars.peek() == Some(&',') {
            chars.next();
        }
        out.push(c);
    }
    out
}

/// Build the `-drive` parameter for one user drive.
pub(crate) fn drive_param(drive: &Drive, bus: DiskBus) -> String {
    let mut param = String::from("file=");
    param.push_str(&escape_commas(&drive.path.to_string_lossy()));

    if drive.readonly {
        param.push_str(",snapshot=on");
    }
    if drive.use_cache_none {
        param.push_str(",cache=none");
    }
    if let Some(format) = &drive.format {
        param.push_str(",format=");
        param.push_str(format);
    }
    if let Some(label) = &drive.disk_label {
        param.push_str(",serial=");
        param.push_str(label);
    }

    let iface = match &drive.iface {
        Some(iface) => iface.as_str(),
        // Under virtio-scsi the drive is attached through a separate
        // scsi-hd device, so the drive itself gets if=none.
        None if bus == DiskBus::VirtioScsi => "none",
        None => "virtio",
    };
    param.push_str(",if=");
    param.push_str(iface);

    param
}

/// Map a drive index to its letter suffix: 0 is `a`, 25 is `z`, 26 is
/// `aa` and so on, matching how the guest kernel names the disks.
pub(crate) fn drive_name(mut index: usize) -> String {
    let mut name = String::new();
    loop {
        #[allow(clippy::cast_possible_truncation)]
        name.insert(0, (b'a' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    name
}

/// Guest device path of the appliance disk.
///
/// Counting all user drives would be enough if nobody used the legacy
/// `iface` parameter; since some do, only the drives that land on the same
/// bus as the appliance disk are counted, in order.
pub(crate) fn appliance_dev(drives: &[Drive], bus: DiskBus) -> String {
    let index = drives
        .iter()
        .filter(|d| match bus {
            DiskBus::VirtioScsi => matches!(d.iface.as_deref(), None | Some("ide")),
            DiskBus::VirtioBlk => d.iface.as_deref() != Some("virtio"),
        })
        .count();

    let prefix = match bus {
        DiskBus::VirtioScsi => "sd",
        DiskBus::VirtioBlk => "vd",
    };
    format!("/dev/{}{}", prefix, drive_name(index))
}

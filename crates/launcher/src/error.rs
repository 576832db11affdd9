use crate::handle::HandleState;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no drives have been added; add at least one drive before launching")]
    NoDrives,
    #[error("launch requires a freshly configured handle (current state: {0:?})")]
    WrongState(HandleState),

    #[error("appliance preparation failed: {0}")]
    Appliance(String),

    #[error("failed to probe `{}`: {}", hypervisor.display(), detail)]
    Probe { hypervisor: PathBuf, detail: String },

    #[error("socket setup failed ({op}): {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fork the hypervisor child: {0}")]
    Fork(#[source] nix::errno::Errno),

    #[error("peer authentication failed: {0}")]
    PeerAuth(String),

    #[error("launch handshake failed: {0}")]
    Handshake(String),

    /// Malformed quoting in user-supplied hypervisor options. Detected in
    /// the child while it assembles its command line and relayed to the
    /// parent over the exec-status pipe.
    #[error("{0}")]
    CmdlineParse(String),

    /// The child died between fork and exec for a reason other than
    /// command-line parsing (bad descriptors, exec failure, ...).
    #[error("hypervisor child failed before exec: {0}")]
    ChildSetup(String),

    #[error("`{}` {}", program.display(), detail)]
    CommandFailed { program: PathBuf, detail: String },

    #[error("no hypervisor subprocess is running")]
    NoSubprocess,

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

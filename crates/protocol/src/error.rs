pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("unexpected end of file while {0}")]
    Eof(&'static str),
    #[error("message size {size:#010x} exceeds the {max:#010x} byte limit")]
    TooBig { size: u32, max: u32 },
    /// The watched abort descriptor delivered data before the wait finished.
    /// The payload is whatever the writer sent, lossily decoded.
    #[error("{0}")]
    Aborted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

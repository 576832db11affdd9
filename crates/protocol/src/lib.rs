//! Wire-level plumbing between the guestkit library and the guest daemon.
//!
//! The full RPC stack lives elsewhere; this crate only carries what the
//! launch rendezvous needs: the handshake sentinel the daemon sends as its
//! first frame, a framed-message reader, and a poll(2)-based wait helper
//! that keeps working on the non-blocking sockets the launcher uses.

pub mod error;
pub use error::{Error, Result};

mod framing;
pub use framing::{
    accept_from_daemon, recv_from_daemon, DaemonMessage, DEFAULT_LAUNCH_TIMEOUT, LAUNCH_FLAG,
    MAX_MESSAGE_SIZE,
};

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};
use tracing::trace;

/// Sentinel the daemon sends as the "size" word of its very first frame.
pub const LAUNCH_FLAG: u32 = 0xf5f5_5ff5;

/// Upper bound on a single framed message.
pub const MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

/// How long a launch is allowed to take before the rendezvous gives up.
/// Slow hosts can take several minutes to boot the appliance.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Poll in short slices so deadlines stay responsive and keepalive traces
/// show the wait is still alive.
const POLL_SLICE: Duration = Duration::from_millis(500);

/// One framed message from the daemon, as seen during the rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMessage {
    /// The frame header carried [`LAUNCH_FLAG`]: the daemon is up.
    Launch,
    /// An ordinary frame with its payload.
    Frame(Vec<u8>),
}

/// Accept one connection from the non-blocking `listener`.
///
/// While waiting, an optional `abort` descriptor is watched alongside the
/// listener. Data arriving on it fails the wait with [`Error::Aborted`]
/// carrying the bytes read; end-of-file on it just stops the watch (the
/// descriptor is dropped). The launcher threads its child's exec-status
/// pipe through here so a child that dies before exec fails the accept
/// immediately instead of after the full timeout.
///
/// # Errors
///
/// [`Error::Timeout`] once `deadline` passes, [`Error::Aborted`] as above,
/// or the underlying socket error.
pub fn accept_from_daemon(
    listener: &TcpListener,
    deadline: Instant,
    abort: &mut Option<OwnedFd>,
) -> Result<(TcpStream, SocketAddr)> {
    loop {
        match listener.accept() {
            Ok(pair) => return Ok(pair),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        wait_readable(
            listener.as_fd(),
            abort,
            deadline,
            "waiting for a connection from the guest daemon",
        )?;
    }
}

/// Receive one framed message from the non-blocking data socket.
///
/// Reads the 4-byte big-endian header; [`LAUNCH_FLAG`] yields
/// [`DaemonMessage::Launch`] with no payload, anything else is a frame
/// length to be read in full.
///
/// # Errors
///
/// [`Error::Timeout`], [`Error::Eof`] if the peer closes mid-message,
/// [`Error::TooBig`] for oversized frames, or the socket error.
pub fn recv_from_daemon(stream: &TcpStream, deadline: Instant) -> Result<DaemonMessage> {
    let mut header = [0_u8; 4];
    read_exact_by(stream, &mut header, deadline)?;

    let word = u32::from_be_bytes(header);
    if word == LAUNCH_FLAG {
        return Ok(DaemonMessage::Launch);
    }

    if word > MAX_MESSAGE_SIZE {
        return Err(Error::TooBig {
            size: word,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0_u8; word as usize];
    read_exact_by(stream, &mut payload, deadline)?;
    Ok(DaemonMessage::Frame(payload))
}

fn read_exact_by(mut stream: &TcpStream, buf: &mut [u8], deadline: Instant) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::Eof("reading a message from the guest daemon")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                wait_readable(
                    stream.as_fd(),
                    &mut None,
                    deadline,
                    "reading a message from the guest daemon",
                )?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Block until `fd` is readable, the deadline passes, or the abort
/// descriptor fires.
fn wait_readable(
    fd: BorrowedFd<'_>,
    abort: &mut Option<OwnedFd>,
    deadline: Instant,
    what: &'static str,
) -> Result<()> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(what));
        }
        let slice = deadline.duration_since(now).min(POLL_SLICE);

        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(fd, PollFlags::POLLIN));
        if let Some(a) = abort.as_ref() {
            fds.push(PollFd::new(a.as_fd(), PollFlags::POLLIN));
        }

        // POLL_SLICE keeps each slice well under u16::MAX milliseconds.
        let timeout = PollTimeout::from(u16::try_from(slice.as_millis()).unwrap_or(u16::MAX));
        match poll(&mut fds, timeout) {
            Ok(0) => {
                trace!(what, "still waiting");
                continue;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        let abort_fired = fds.get(1).is_some_and(|p| {
            p.revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
        });
        let ready = fds[0]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR));
        drop(fds);

        if abort_fired {
            let taken = abort.take();
            if let Some(a) = taken {
                let data = drain_fd(&a)?;
                if !data.is_empty() {
                    return Err(Error::Aborted(String::from_utf8_lossy(&data).into_owned()));
                }
                // EOF with no data: the writer went away cleanly, stop
                // watching and keep waiting on the main descriptor.
            }
        }

        if ready {
            return Ok(());
        }
    }
}

/// Read everything currently buffered on `fd` until end-of-file.
fn drain_fd(fd: &OwnedFd) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0_u8; 256];
    loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => return Ok(data),
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

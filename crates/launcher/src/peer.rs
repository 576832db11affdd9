use crate::error::{Error, Result};
use std::io::BufRead;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::path::PathBuf;

const PROC_NET_TCP: &str = "/proc/net/tcp";

/// Resolves the effective UID that owns the far end of an accepted
/// loopback TCP connection.
///
/// There is no portable peer-credential call for TCP sockets, so the
/// production implementation greps the kernel's connection table. Ports
/// that do have a direct syscall can substitute their own implementation
/// on the handle.
pub trait PeerCredentialLookup {
    /// # Errors
    ///
    /// [`Error::PeerAuth`] when the peer is not IPv4 loopback or no
    /// matching connection is found.
    fn peer_uid(&self, stream: &TcpStream) -> Result<u32>;
}

/// [`PeerCredentialLookup`] backed by the `/proc/net/tcp` text table.
#[derive(Debug, Clone)]
pub struct ProcNetTcp {
    table: PathBuf,
}

impl Default for ProcNetTcp {
    fn default() -> Self {
        Self {
            table: PathBuf::from(PROC_NET_TCP),
        }
    }
}

impl ProcNetTcp {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from an alternate table, for tests and ports.
    #[must_use]
    pub fn with_table(table: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
        }
    }

    fn scan(
        reader: impl BufRead,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> Result<u32> {
        let mut lines = reader.lines();

        // One header line precedes the entries.
        if lines.next().transpose()?.is_none() {
            return Err(Error::PeerAuth(
                "unexpected end of file in TCP connection table".into(),
            ));
        }

        for line in lines {
            let Some(entry) = TcpTableEntry::parse(&line?) else {
                continue;
            };
            if entry.describes_peer_socket(local, peer) {
                return Ok(entry.uid);
            }
        }

        Err(Error::PeerAuth(
            "no matching TCP connection found in connection table".into(),
        ))
    }
}

impl PeerCredentialLookup for ProcNetTcp {
    fn peer_uid(&self, stream: &TcpStream) -> Result<u32> {
        let peer = require_loopback_v4(stream.peer_addr()?)?;
        let local = match stream.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(Error::PeerAuth(format!(
                    "unexpected IPv6 local address {addr}"
                )));
            }
        };

        let file = std::fs::File::open(&self.table)?;
        Self::scan(std::io::BufReader::new(file), local, peer)
    }
}

fn require_loopback_v4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) if *v4.ip() == Ipv4Addr::LOCALHOST => Ok(v4),
        other => Err(Error::PeerAuth(format!(
            "unexpected connection from non-IPv4, non-loopback peer {other}"
        ))),
    }
}

/// One row of the kernel table. The address columns hold the raw 32-bit
/// word in network byte order; the port columns are host byte order. Both
/// are printed as hex. The socket API hands addresses back the same way
/// but ports in network order, so only the ports get byte-swapped before
/// comparing.
#[derive(Debug, PartialEq, Eq)]
struct TcpTableEntry {
    local_addr: u32,
    local_port: u16,
    peer_addr: u32,
    peer_port: u16,
    uid: u32,
}

impl TcpTableEntry {
    /// `None` for the header or any line that does not parse; the scan
    /// just skips those.
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();

        let slot = fields.next()?;
        if !slot.ends_with(':') {
            return None;
        }

        let (local_addr, local_port) = parse_addr_port(fields.next()?)?;
        let (peer_addr, peer_port) = parse_addr_port(fields.next()?)?;

        // state, tx/rx queues, tr:tm->when, retrnsmt.
        let mut fields = fields.skip(4);
        let uid = fields.next()?.parse().ok()?;

        Some(Self {
            local_addr,
            local_port,
            peer_addr,
            peer_port,
            uid,
        })
    }

    /// A loopback connection appears in the table twice, once per
    /// endpoint socket. The row that identifies the caller is the one
    /// for the peer's own socket: its local columns equal the peer
    /// endpoint, its remote columns equal ours, and its uid column names
    /// the peer's owner. Matching our own socket's row instead would
    /// always report our own UID and make the check vacuous.
    fn describes_peer_socket(&self, local: SocketAddrV4, peer: SocketAddrV4) -> bool {
        self.local_addr == addr_word(*peer.ip())
            && self.local_port == peer.port()
            && self.peer_addr == addr_word(*local.ip())
            && self.peer_port == local.port()
    }
}

fn parse_addr_port(field: &str) -> Option<(u32, u16)> {
    let (addr, port) = field.split_once(':')?;
    Some((
        u32::from_str_radix(addr, 16).ok()?,
        u16::from_str_radix(port, 16).ok()?,
    ))
}

/// The address exactly as the kernel stores (and prints) it: four
/// network-ordered bytes reinterpreted as a native word.
fn addr_word(ip: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(ip.octets())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// One table row for the socket whose local endpoint is `row_local`.
    fn table_line(row_local: SocketAddrV4, row_remote: SocketAddrV4, uid: u32) -> String {
        format!(
            "   1: {:08X}:{:04X} {:08X}:{:04X} 01 00000000:00000000 00:00000000 00000000 {uid:5} 0 12345 1 0000000000000000 20 4 30 10 -1",
            addr_word(*row_local.ip()),
            row_local.port(),
            addr_word(*row_remote.ip()),
            row_remote.port(),
        )
    }

    fn sock(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    #[test]
    fn finds_the_callers_socket_row() {
        // Our socket: local 8080, peer 5678. The caller's row is the
        // mirror image, and carries the caller's uid; our own row
        // carries ours and must not match.
        let table = format!(
            "{HEADER}\n{}\n{}\n{}\n",
            table_line(sock(9999), sock(1234), 42),
            table_line(sock(8080), sock(5678), 0),
            table_line(sock(5678), sock(8080), 1000),
        );
        let uid = ProcNetTcp::scan(Cursor::new(table), sock(8080), sock(5678)).unwrap();
        assert_eq!(uid, 1000);
    }

    #[test]
    fn no_match_is_an_error() {
        let table = format!("{HEADER}\n{}\n", table_line(sock(9999), sock(1234), 42));
        let err = ProcNetTcp::scan(Cursor::new(table), sock(8080), sock(5678)).unwrap_err();
        assert!(matches!(err, Error::PeerAuth(_)));
    }

    #[test]
    fn empty_table_is_an_error() {
        let err = ProcNetTcp::scan(Cursor::new(""), sock(8080), sock(5678)).unwrap_err();
        assert!(matches!(err, Error::PeerAuth(_)));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let table = format!(
            "{HEADER}\ngarbage line\n1234 no colon slot\n{}\n",
            table_line(sock(5678), sock(8080), 7),
        );
        let uid = ProcNetTcp::scan(Cursor::new(table), sock(8080), sock(5678)).unwrap();
        assert_eq!(uid, 7);
    }

    #[test]
    fn header_alone_means_no_match() {
        let err = ProcNetTcp::scan(Cursor::new(format!("{HEADER}\n")), sock(1), sock(2)).unwrap_err();
        assert!(matches!(err, Error::PeerAuth(_)));
    }

    #[test]
    fn parses_realistic_line() {
        // Caller's socket: 127.0.0.1:49664 connected to our 127.0.0.1:8080.
        let our = sock(8080);
        let caller = sock(49664);
        let line = table_line(caller, our, 1000);
        let entry = TcpTableEntry::parse(&line).unwrap();
        assert_eq!(entry.local_port, 49664);
        assert_eq!(entry.peer_port, 8080);
        assert_eq!(entry.uid, 1000);
        assert!(entry.describes_peer_socket(our, caller));
        assert!(!entry.describes_peer_socket(our, sock(49665)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resolves_own_uid_for_live_loopback_socket() {
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let uid = ProcNetTcp::new().peer_uid(&accepted).unwrap();
        assert_eq!(uid, nix::unistd::geteuid().as_raw());
        drop(client);
    }
}

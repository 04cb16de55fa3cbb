mod codec;
mod relay;
mod server;
mod socks5;

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use compact_str::CompactString;

pub use server::Server;

const SOCKS5: u8 = 5;

const COMMAND_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

// VER CMD RSV ATYP, a zero-length domain, and the port.
const MIN_REQUEST_LEN: usize = 7;

/// Size of the buffer both handshake messages are read into.
const HANDSHAKE_BUF_LEN: usize = 256;

type Bytes = smallvec::SmallVec<[u8; 32]>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Address {
    IPv4([u8; 4]),
    IPv6([u8; 16]),
    Domain(CompactString),
}

// Request represents a decoded CONNECT request from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Request {
    address: Address,
    port: u16,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Granted = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// What the client is told when a request or dial fails.
///
/// `Silent` closes the connection without writing anything, which is not what
/// RFC 1928 asks for but is what clients of this proxy expect. `Reply` sends
/// the RFC 1928 reply code first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    Silent,
    Reply,
}

/// Reasons a connection is dropped before the relay starts.
#[derive(Debug, thiserror::Error)]
enum Rejection {
    #[error("client closed before completing the handshake")]
    Closed,
    #[error("unsupported SOCKS version: {0}")]
    BadVersion(u8),
    #[error("request too short: {0} bytes")]
    Truncated(usize),
    #[error("command not supported: {0}")]
    UnsupportedCommand(u8),
    #[error("unknown address type: {0}")]
    UnsupportedAddressType(u8),
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
    #[error("failed to resolve {0}")]
    Unresolved(CompactString, #[source] io::Error),
    #[error("failed to connect to upstream")]
    Connect(#[source] io::Error),
    #[error("timed out")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Rejection {
    /// The reply code sent under [`FailurePolicy::Reply`]. `None` means the
    /// connection is always dropped silently.
    fn status(&self) -> Option<Status> {
        match self {
            Rejection::Closed | Rejection::BadVersion(_) | Rejection::Io(_) => None,
            Rejection::UnsupportedCommand(_) => Some(Status::CommandNotSupported),
            Rejection::UnsupportedAddressType(_) => Some(Status::AddressTypeNotSupported),
            Rejection::Truncated(_) | Rejection::InvalidDomain | Rejection::TimedOut => {
                Some(Status::GeneralFailure)
            }
            Rejection::Unresolved(..) => Some(Status::HostUnreachable),
            Rejection::Connect(e) => Some(match e.kind() {
                io::ErrorKind::ConnectionRefused => Status::ConnectionRefused,
                _ => Status::HostUnreachable,
            }),
        }
    }
}

impl Request {
    /// Parses a decoded CONNECT request. `buf` holds exactly the bytes of one
    /// read; the port is always its last two bytes.
    fn parse(buf: &[u8]) -> Result<Request, Rejection> {
        let n = buf.len();
        if n < MIN_REQUEST_LEN {
            return Err(Rejection::Truncated(n));
        }
        if buf[1] != COMMAND_CONNECT {
            return Err(Rejection::UnsupportedCommand(buf[1]));
        }
        let address = match buf[3] {
            ATYP_IPV4 => {
                let octets = fixed_addr::<4>(buf)?;
                Address::IPv4(octets)
            }
            ATYP_DOMAIN => {
                // the length byte at offset 4 is not consulted
                let name = std::str::from_utf8(&buf[5..n - 2])
                    .map_err(|_| Rejection::InvalidDomain)?;
                Address::Domain(CompactString::from(name))
            }
            ATYP_IPV6 => {
                let octets = fixed_addr::<16>(buf)?;
                Address::IPv6(octets)
            }
            x => return Err(Rejection::UnsupportedAddressType(x)),
        };
        let port = u16::from_be_bytes([buf[n - 2], buf[n - 1]]);
        Ok(Request { address, port })
    }
}

fn fixed_addr<const N: usize>(buf: &[u8]) -> Result<[u8; N], Rejection> {
    if buf.len() < 4 + N + 2 {
        return Err(Rejection::Truncated(buf.len()));
    }
    let mut octets = [0u8; N];
    octets.copy_from_slice(&buf[4..4 + N]);
    Ok(octets)
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip) => Ipv4Addr::from(*ip).fmt(f),
            Address::IPv6(ip) => Ipv6Addr::from(*ip).fmt(f),
            Address::Domain(d) => f.write_str(d),
        }
    }
}

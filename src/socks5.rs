//! # SOCKS5 Front-End Protocol
//!
//! Sans-IO implementation of the RFC 1928 subset the gateway speaks. The
//! [`Socks5Connection`] state machine is fed raw bytes as they arrive and
//! yields [`SocksEvent`]s once a complete message is buffered; it never
//! touches a socket.
//!
//! ```text
//! BEFORE_METHOD_REQUEST --method request--> METHOD_REQUESTED --reply sent--> CONNECTED
//! CONNECTED --request--> REQUEST_RECEIVED --CONNECT ok--> TCP_RELAY
//!                                         --UDP ASSOCIATE ok--> REQUEST_ACCEPTED
//! ```
//!
//! | Supported | Value |
//! |-----------|-------|
//! | Methods | `0x00` no authentication |
//! | Commands | `CONNECT`, `UDP ASSOCIATE` (`BIND` answered with `0x07`) |
//! | Address types | IPv4, domain name (IPv6 refused) |
//! | Replies | `0x00`, `0x01`, `0x04`, `0x07` |
//!
//! The UDP datagram header of RFC 1928 §7 is handled by [`decode_udp`] and
//! [`encode_udp`]; fragmented datagrams are refused.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::messages::{Endpoint, MAX_DOMAIN_LEN};

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Largest request: header (4) + length byte + 255-byte domain + port.
pub const MAX_REQUEST_LEN: usize = 4 + 1 + MAX_DOMAIN_LEN + 2;

/// Largest method request: version, count and 255 methods.
const MAX_METHOD_REQUEST_LEN: usize = 2 + 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocksState {
    BeforeMethodRequest,
    MethodRequested,
    Connected,
    RequestReceived,
    RequestAccepted,
    TcpRelay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    BadVersion(u8),
    AddressTypeNotSupported(u8),
    BadAddress,
    Fragmented(u8),
    Truncated,
    /// Domain name longer than the one-byte length field can carry.
    DomainTooLong(usize),
    /// Input arrived in a state that does not accept any.
    UnexpectedData(SocksState),
}

impl Socks5Error {
    /// Reply sent before closing, when the client is owed one.
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            Socks5Error::AddressTypeNotSupported(_) | Socks5Error::BadAddress => {
                Some(ReplyCode::GeneralFailure)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Socks5Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Socks5Error::BadVersion(v) => write!(f, "unsupported SOCKS version {v:#04x}"),
            Socks5Error::AddressTypeNotSupported(t) => write!(f, "address type {t:#04x} not supported"),
            Socks5Error::BadAddress => write!(f, "malformed address"),
            Socks5Error::Fragmented(n) => write!(f, "fragmented datagram (frag {n})"),
            Socks5Error::Truncated => write!(f, "truncated message"),
            Socks5Error::DomainTooLong(n) => {
                write!(f, "domain name of {n} bytes exceeds {MAX_DOMAIN_LEN}")
            }
            Socks5Error::UnexpectedData(state) => write!(f, "unexpected data in state {state:?}"),
        }
    }
}

impl std::error::Error for Socks5Error {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
    Bind,
    Unknown(u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocksEvent {
    /// A method request was parsed. Write `reply`, then call
    /// [`Socks5Connection::method_reply_sent`] if `accepted`, else close.
    MethodSelected { accepted: bool, reply: [u8; 2] },
    /// A full REQUEST was parsed.
    Request { command: Command, destination: Endpoint },
}

// ============================================================================
// Address codec
// ============================================================================

/// Parse `ATYP ADDR PORT` at the start of `buf`. `Ok(None)` means more bytes
/// are needed. Returns the endpoint and the number of bytes consumed.
fn parse_address(buf: &[u8]) -> Result<Option<(Endpoint, usize)>, Socks5Error> {
    let Some(&atyp) = buf.first() else {
        return Ok(None);
    };
    match atyp {
        ATYP_IPV4 => {
            if buf.len() < 1 + 4 + 2 {
                return Ok(None);
            }
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok(Some((Endpoint::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))), 7)))
        }
        ATYP_DOMAIN => {
            let Some(&len) = buf.get(1) else {
                return Ok(None);
            };
            let len = len as usize;
            if len == 0 {
                return Err(Socks5Error::BadAddress);
            }
            if buf.len() < 2 + len + 2 {
                return Ok(None);
            }
            let host = std::str::from_utf8(&buf[2..2 + len])
                .map_err(|_| Socks5Error::BadAddress)?
                .to_string();
            let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
            Ok(Some((Endpoint::Domain { host, port }, 2 + len + 2)))
        }
        other => Err(Socks5Error::AddressTypeNotSupported(other)),
    }
}

fn write_socket_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.ip().octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

fn write_address(out: &mut Vec<u8>, endpoint: &Endpoint) -> Result<(), Socks5Error> {
    match endpoint {
        Endpoint::Ip(addr) => write_socket_addr(out, *addr),
        Endpoint::Domain { host, port } => {
            let bytes = host.as_bytes();
            let len = u8::try_from(bytes.len())
                .map_err(|_| Socks5Error::DomainTooLong(bytes.len()))?;
            out.push(ATYP_DOMAIN);
            out.push(len);
            out.extend_from_slice(bytes);
            out.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(())
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT`
pub fn encode_reply(code: ReplyCode, bound: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[SOCKS_VERSION, code as u8, 0x00]);
    write_socket_addr(&mut out, bound);
    out
}

/// Reply for failures, with an all-zero bound address.
pub fn encode_failure(code: ReplyCode) -> Vec<u8> {
    encode_reply(code, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
}

// ============================================================================
// UDP datagram header (RFC 1928 §7)
// ============================================================================

/// Split a client datagram into destination and payload.
pub fn decode_udp(datagram: &[u8]) -> Result<(Endpoint, &[u8]), Socks5Error> {
    if datagram.len() < 4 {
        return Err(Socks5Error::Truncated);
    }
    let frag = datagram[2];
    if frag != 0 {
        return Err(Socks5Error::Fragmented(frag));
    }
    match parse_address(&datagram[3..])? {
        Some((endpoint, used)) => Ok((endpoint, &datagram[3 + used..])),
        None => Err(Socks5Error::Truncated),
    }
}

/// Wrap a payload coming back from `origin` for the client. Fails when the
/// origin cannot be expressed in the header.
pub fn encode_udp(origin: &Endpoint, payload: &[u8]) -> Result<Vec<u8>, Socks5Error> {
    let mut out = Vec::with_capacity(10 + payload.len());
    out.extend_from_slice(&[0x00, 0x00, 0x00]);
    write_address(&mut out, origin)?;
    out.extend_from_slice(payload);
    Ok(out)
}

// ============================================================================
// Connection state machine
// ============================================================================

#[derive(Debug)]
pub struct Socks5Connection {
    state: SocksState,
    buffer: Vec<u8>,
}

impl Default for Socks5Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Socks5Connection {
    pub fn new() -> Self {
        Self {
            state: SocksState::BeforeMethodRequest,
            buffer: Vec::with_capacity(MAX_METHOD_REQUEST_LEN),
        }
    }

    pub fn state(&self) -> SocksState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append bytes read from the client.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Parse the next complete message. `Ok(None)` means more input is
    /// needed (or none is expected in this state).
    pub fn poll(&mut self) -> Result<Option<SocksEvent>, Socks5Error> {
        match self.state {
            SocksState::BeforeMethodRequest => self.parse_method_request(),
            SocksState::Connected => self.parse_request(),
            SocksState::MethodRequested | SocksState::RequestReceived => {
                if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(Socks5Error::UnexpectedData(self.state))
                }
            }
            SocksState::RequestAccepted | SocksState::TcpRelay => Ok(None),
        }
    }

    fn parse_method_request(&mut self) -> Result<Option<SocksEvent>, Socks5Error> {
        let Some(&version) = self.buffer.first() else {
            return Ok(None);
        };
        if version != SOCKS_VERSION {
            return Err(Socks5Error::BadVersion(version));
        }
        let Some(&count) = self.buffer.get(1) else {
            return Ok(None);
        };
        let total = 2 + count as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let accepted = self.buffer[2..total].contains(&METHOD_NO_AUTH);
        self.buffer.drain(..total);
        self.state = SocksState::MethodRequested;
        let method = if accepted { METHOD_NO_AUTH } else { METHOD_NO_ACCEPTABLE };
        Ok(Some(SocksEvent::MethodSelected {
            accepted,
            reply: [SOCKS_VERSION, method],
        }))
    }

    fn parse_request(&mut self) -> Result<Option<SocksEvent>, Socks5Error> {
        let Some(&version) = self.buffer.first() else {
            return Ok(None);
        };
        if version != SOCKS_VERSION {
            return Err(Socks5Error::BadVersion(version));
        }
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let command = match self.buffer[1] {
            CMD_CONNECT => Command::Connect,
            CMD_UDP_ASSOCIATE => Command::UdpAssociate,
            CMD_BIND => Command::Bind,
            other => Command::Unknown(other),
        };
        let Some((destination, used)) = parse_address(&self.buffer[3..])? else {
            if self.buffer.len() >= MAX_REQUEST_LEN {
                return Err(Socks5Error::Truncated);
            }
            return Ok(None);
        };
        self.buffer.drain(..3 + used);
        self.state = SocksState::RequestReceived;
        Ok(Some(SocksEvent::Request { command, destination }))
    }

    /// The NO-AUTH reply went out; requests may follow.
    pub fn method_reply_sent(&mut self) {
        if self.state == SocksState::MethodRequested {
            self.state = SocksState::Connected;
        }
    }

    /// A UDP ASSOCIATE succeeded. The TCP connection now only keeps the
    /// association alive.
    pub fn udp_accepted(&mut self) {
        if self.state == SocksState::RequestReceived {
            self.state = SocksState::RequestAccepted;
        }
    }

    /// A CONNECT succeeded. Returns bytes the client sent after the request,
    /// which belong to the relayed stream.
    pub fn start_relay(&mut self) -> Vec<u8> {
        self.state = SocksState::TcpRelay;
        std::mem::take(&mut self.buffer)
    }
}

//! Values exchanged between a SOCKS client, the two proxy halves and the
//! destination.
//!
//! ```text
//! client          frontend           backend          destination
//!   |                 |                  |                  |
//!   |---------------->|                  |                  |
//!   |  auth handshake |                  |                  |
//!   |<----------------|                  |                  |
//!   |  auth response  |                  |                  |
//!   |---------------->|                  |                  |
//!   |  socks request  |----------------->|                  |
//!   |                 |  Request (json)  |----------------->|
//!   |                 |                  |   tcp connect    |
//!   |                 |<-----------------|                  |
//!   |<----------------| Response (json)  |                  |
//!   |  socks reply    |                  |                  |
//!   | - - - - - - - ->| - - - - - - - - >| - - - - - - - - >|
//!   |           [[ binary frames over a virtual channel ]]  |
//!   |<- - - - - - - - |< - - - - - - - - |< - - - - - - - - |
//! ```
use std::convert::TryFrom;
use std::fmt;
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::raw_message::TryFromU8Error;

/// Host and port.
///
/// `address` is an IPv4/IPv6 literal or a domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(address: S, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Placeholder used in replies when no bound endpoint is known.
    pub fn unspecified() -> Self {
        Self::new("0.0.0.0", 0)
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    pub fn is_valid(&self) -> bool {
        !self.address.is_empty()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum SocksVersion {
    #[display(fmt = "SOCKS4")]
    V4 = 0x04,
    #[display(fmt = "SOCKS5")]
    V5 = 0x05,
}

/// Authentication methods offered in the version negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Auth {
    /// No authentication
    NoAuth,
    GssApi,
    /// Username / password (RFC 1929)
    UserPass,
    /// IANA assigned method
    #[display(fmt = "IANAMethod({:#x})", _0)]
    IANAMethod(u8),
    /// Reserved for private methods
    #[display(fmt = "Private({:#x})", _0)]
    Private(u8),
    /// No acceptable method
    NoMethods,
}

impl Auth {
    pub fn code(&self) -> u8 {
        use Auth::*;
        match self {
            NoAuth => 0x00,
            GssApi => 0x01,
            UserPass => 0x02,
            IANAMethod(c) => *c,
            Private(c) => *c,
            NoMethods => 0xff,
        }
    }
}

impl From<u8> for Auth {
    fn from(code: u8) -> Self {
        use Auth::*;
        match code {
            0x00 => NoAuth,
            0x01 => GssApi,
            0x02 => UserPass,
            0x03..=0x7f => IANAMethod(code),
            0x80..=0xfe => Private(code),
            0xff => NoMethods,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = TryFromU8Error;
    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(TryFromU8Error::new(n, "Command")),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> Self {
        cmd as u8
    }
}

/// SOCKS5 reply field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Reply {
    Succeeded = 0x00,
    Failure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    UnsupportedCommand = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl TryFrom<u8> for Reply {
    type Error = TryFromU8Error;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use Reply::*;
        match code {
            0 => Ok(Succeeded),
            1 => Ok(Failure),
            2 => Ok(NotAllowed),
            3 => Ok(NetworkUnreachable),
            4 => Ok(HostUnreachable),
            5 => Ok(ConnectionRefused),
            6 => Ok(TtlExpired),
            7 => Ok(UnsupportedCommand),
            8 => Ok(AddressTypeNotSupported),
            c => Err(TryFromU8Error::new(c, "Reply")),
        }
    }
}

impl From<Reply> for u8 {
    fn from(reply: Reply) -> Self {
        reply as u8
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Reply::*;
        match self {
            Succeeded => write!(f, "succeeded"),
            Failure => write!(f, "general SOCKS server failure"),
            NotAllowed => write!(f, "connection not allowed by ruleset"),
            NetworkUnreachable => write!(f, "network unreachable"),
            HostUnreachable => write!(f, "host unreachable"),
            ConnectionRefused => write!(f, "connection refused"),
            TtlExpired => write!(f, "TTL expired"),
            UnsupportedCommand => write!(f, "command not supported"),
            AddressTypeNotSupported => write!(f, "address type not supported"),
        }
    }
}

/// A client's request, as forwarded from the frontend to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub command: Command,
    pub endpoint: Endpoint,
}

impl Request {
    pub fn connect(endpoint: Endpoint) -> Self {
        Self {
            command: Command::Connect,
            endpoint,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.endpoint.is_valid()
    }
}

/// The backend's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Response {
    pub reply: Reply,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
}

impl Response {
    pub fn new(reply: Reply, endpoint: Option<Endpoint>) -> Self {
        Self { reply, endpoint }
    }

    pub fn failure() -> Self {
        Self::new(Reply::Failure, None)
    }

    /// A successful response must name the bound endpoint.
    pub fn is_valid(&self) -> bool {
        match (&self.reply, &self.endpoint) {
            (Reply::Succeeded, None) => false,
            (_, Some(endpoint)) => endpoint.is_valid(),
            _ => true,
        }
    }
}

/// ATYP
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressType {
    Ipv4 = 0x01,
    Dns = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = TryFromU8Error;
    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Dns),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(TryFromU8Error::new(n, "AddressType")),
        }
    }
}

/// Address sub-field of a request, reply or UDP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address_type: AddressType,
    pub endpoint: Endpoint,
    /// bytes taken on the wire by ATYP, address and port together
    pub address_byte_length: usize,
}

/// SOCKS5 UDP datagram with its header parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage<'a> {
    pub frag: u8,
    pub destination: Destination,
    pub data: &'a [u8],
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_json() {
        let request = Request::connect(Endpoint::new("93.184.216.34", 80));
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"command":1,"endpoint":{"address":"93.184.216.34","port":80}}"#
        );
        assert_eq!(serde_json::from_str::<Request>(&json).unwrap(), request);
    }

    #[test]
    fn malformed_request_json() {
        for json in [
            r#"{"command":9,"endpoint":{"address":"a","port":80}}"#,
            r#"{"command":1,"endpoint":{"address":"a","port":70000}}"#,
            r#"{"command":1,"endpoint":{"address":"a","port":80},"extra":0}"#,
            r#"{"command":1}"#,
        ] {
            assert!(serde_json::from_str::<Request>(json).is_err(), "{}", json);
        }
        let empty: Request =
            serde_json::from_str(r#"{"command":1,"endpoint":{"address":"","port":80}}"#).unwrap();
        assert!(!empty.is_valid());
    }

    #[test]
    fn response_validity() {
        let ok: Response = serde_json::from_str(r#"{"reply":0}"#).unwrap();
        assert!(!ok.is_valid());
        let failure: Response = serde_json::from_str(r#"{"reply":1}"#).unwrap();
        assert!(failure.is_valid());
        assert_eq!(serde_json::to_string(&failure).unwrap(), r#"{"reply":1}"#);
        let bound = Response::new(Reply::Succeeded, Some(Endpoint::new("127.0.0.1", 1080)));
        assert!(bound.is_valid());
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::new("::1", 80).to_string(), "[::1]:80");
        assert_eq!(Endpoint::new("example.com", 443).to_string(), "example.com:443");
        assert_eq!(
            Endpoint::from("10.1.2.3:8080".parse::<SocketAddr>().unwrap()),
            Endpoint::new("10.1.2.3", 8080)
        );
    }
}

//! Wire-level constants of SOCKS4/4a (de facto), SOCKS5 (RFC 1928) and
//! username/password authentication (RFC 1929).
use std::fmt;

pub const RESERVED: u8 = 0x00;

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;
/// first byte of a SOCKS4 reply
pub const SOCKS4_REPLY_VERSION: u8 = 0x00;
pub const USERPASS_VERSION: u8 = 0x01;

pub const USERPASS_SUCCESS: u8 = 0x00;
pub const USERPASS_FAILURE: u8 = 0xff;

/// SOCKS4 command byte for CONNECT
pub const SOCKS4_CONNECT: u8 = 0x01;

/// VER, CMD, PORT, IP and the NUL of an empty USERID
pub const SOCKS4_MIN_REQUEST_LEN: usize = 9;
/// VER, CMD, RSV, ATYP, a one letter domain name, PORT
pub const SOCKS5_MIN_REQUEST_LEN: usize = 8;
/// RSV, FRAG, ATYP, IPv4 address, PORT
pub const UDP_MIN_HEADER_LEN: usize = 10;

/// SOCKS4 reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResultCode4 {
    Granted = 90,
    Failed = 91,
}

impl ResultCode4 {
    pub fn from_u8(code: u8) -> Result<Self, TryFromU8Error> {
        match code {
            90 => Ok(ResultCode4::Granted),
            91 => Ok(ResultCode4::Failed),
            c => Err(TryFromU8Error::new(c, "ResultCode4")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TryFromU8Error {
    /// source value
    value: u8,
    /// target type
    to: &'static str,
}

impl TryFromU8Error {
    pub fn new(value: u8, to: &'static str) -> Self {
        Self { value, to }
    }

    pub fn value(&self) -> u8 {
        self.value
    }
}

impl fmt::Display for TryFromU8Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "try from u8({:#X}) error to {}", self.value, self.to)
    }
}

impl std::error::Error for TryFromU8Error {}

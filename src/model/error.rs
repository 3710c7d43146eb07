use std::fmt;
use std::io;

use crate::model::*;
use crate::raw_message::TryFromU8Error;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Failure to encode or decode a SOCKS message.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("truncated message")]
    Truncated,
    #[error("message format error: {}", message)]
    MessageFormat { message: String },
    #[error("unsupported version: {:#x}", _0)]
    UnsupportedVersion(u8),
    #[error("command not supported: {:?}", cmd)]
    CommandNotSupported { cmd: Command },
    #[error("authentication error: no acceptable method")]
    NoAcceptableMethod,
    #[error("fragmented udp datagram: {}", frag)]
    Fragmented { frag: u8 },
    #[error(transparent)]
    Code(#[from] TryFromU8Error),
}

impl Error {
    pub fn message_fmt(message: fmt::Arguments) -> Self {
        Self::MessageFormat {
            message: message.to_string(),
        }
    }

    pub fn command_not_supported(cmd: Command) -> Self {
        Self::CommandNotSupported { cmd }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::Truncated,
            _ => Error::message_fmt(format_args!("{}", err)),
        }
    }
}

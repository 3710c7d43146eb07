use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::*;
use thiserror::Error;
use tokio::net::{self, TcpStream};

use crate::model::{Endpoint, Reply};

/// Why an outbound connection could not be made.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error("connection timed out")]
    TimedOut,
    #[error("network changed")]
    NetworkChanged,
    #[error("name not resolved")]
    NameNotResolved,
    #[error("connection refused")]
    Refused,
    #[error("connection reset")]
    Reset,
    #[error("invalid endpoint")]
    InvalidEndpoint,
    #[error("connection failed")]
    Other,
}

impl ConnectFailure {
    pub fn from_io(err: &io::Error) -> Self {
        use ConnectFailure::*;
        match err.kind() {
            io::ErrorKind::TimedOut => TimedOut,
            io::ErrorKind::ConnectionRefused => Refused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Reset,
            _ => match err.raw_os_error() {
                Some(libc::ENETUNREACH) | Some(libc::ENETDOWN) | Some(libc::ENETRESET) => {
                    NetworkChanged
                }
                _ => Other,
            },
        }
    }

    /// Reply reported to the peer for this failure.
    ///
    /// Refusals are only reported as such when non-unicast destinations are
    /// allowed anyway, otherwise they would reveal which local ports are
    /// open.
    pub fn reply(&self, allow_non_unicast: bool) -> Reply {
        use ConnectFailure::*;
        match self {
            TimedOut => Reply::TtlExpired,
            NetworkChanged => Reply::NetworkUnreachable,
            NameNotResolved => Reply::HostUnreachable,
            Refused | Reset if allow_non_unicast => Reply::ConnectionRefused,
            _ => Reply::Failure,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream, ConnectFailure>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect_any(endpoint: &Endpoint) -> Result<TcpStream, ConnectFailure> {
        let addrs: Vec<SocketAddr> = net::lookup_host((endpoint.address.as_str(), endpoint.port))
            .await
            .map_err(|err| {
                debug!("resolve error: {}: {}", endpoint, err);
                ConnectFailure::NameNotResolved
            })?
            .collect();
        let mut failure = ConnectFailure::NameNotResolved;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(strm) => return Ok(strm),
                Err(err) => {
                    debug!("connect error: {}: {}", addr, err);
                    failure = ConnectFailure::from_io(&err);
                }
            }
        }
        Err(failure)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream, ConnectFailure> {
        if !endpoint.is_valid() {
            return Err(ConnectFailure::InvalidEndpoint);
        }
        tokio::time::timeout(self.timeout, Self::connect_any(endpoint))
            .await
            .map_err(|_| ConnectFailure::TimedOut)?
    }
}

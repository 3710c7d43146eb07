use thiserror::Error;

use crate::handler_queue::QueueError;
use crate::model;
use crate::pool::PoolError;
use crate::session::SessionError;
use crate::tcp::SocketError;
use crate::transport::TransportError;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("codec error: {0}")]
    Codec(#[from] model::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("already started")]
    AlreadyStarted,
    #[error("stopped")]
    Stopped,
}

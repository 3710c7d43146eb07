//! Interface of the peer transport joining the two proxy halves.
//!
//! A transport carries any number of independently closable, ordered data
//! channels between two peers. How the peers reach each other is up to the
//! implementation; [`crate::loopback`] provides an in-process one.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::handler_queue::HandlerQueue;

/// One message on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("data channel {label} is closed")]
    ChannelClosed { label: String },
    #[error("transport is closed")]
    Closed,
    #[error("failed to open data channel {label}: {message}")]
    OpenFailed { label: String, message: String },
}

impl TransportError {
    pub fn channel_closed(label: &str) -> Self {
        TransportError::ChannelClosed {
            label: label.to_owned(),
        }
    }
}

/// Called with `true` when a channel's send buffer crosses its high
/// watermark and with `false` once it drains below the low watermark.
pub type OverflowListener = Arc<dyn Fn(bool) + Send + Sync>;

pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Queues `frame` for delivery. Frames arrive in the order they were sent.
    ///
    /// Delivery happens later: no handler of either end runs before `send`
    /// returns.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Frames received from the peer.
    fn data_from_peer(&self) -> &HandlerQueue<Frame>;

    fn close(&self);

    /// Cancelled once the channel is closed by either side.
    fn closed(&self) -> CancellationToken;

    fn is_in_overflow(&self) -> bool;

    fn set_overflow_listener(&self, listener: Option<OverflowListener>);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Channels opened by the peer, already open.
    fn peer_opened_channels(&self) -> &HandlerQueue<Arc<dyn DataChannel>>;

    async fn once_connected(&self) -> Result<(), TransportError>;

    fn close(&self);

    fn closed(&self) -> CancellationToken;
}

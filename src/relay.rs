//! Byte forwarding between a socket and a virtual channel.
//!
//! Once a session is linked, every buffer read from the socket is sent on the
//! channel as a binary frame and every binary frame from the channel is
//! written to the socket. Reading from the socket is paused while the channel
//! is in overflow or the session is throttled, and resumed only when neither
//! holds.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::*;
use serde::Serialize;

use crate::handler_queue::HandlerQueue;
use crate::tcp::Connection;
use crate::transport::{DataChannel, Frame};

/// Byte counters of one session.
#[derive(Debug, Default)]
pub struct Traffic {
    /// written to the socket
    pub socket_sent: AtomicU64,
    /// read from the socket
    pub socket_received: AtomicU64,
    pub channel_sent: AtomicU64,
    pub channel_received: AtomicU64,
}

impl Traffic {
    /// Bytes moved in either direction so far.
    pub fn transferred(&self) -> u64 {
        self.channel_sent.load(Ordering::Relaxed) + self.channel_received.load(Ordering::Relaxed)
    }

    pub fn counts(&self) -> TrafficCounts {
        TrafficCounts {
            socket_sent: self.socket_sent.load(Ordering::Relaxed),
            socket_received: self.socket_received.load(Ordering::Relaxed),
            channel_sent: self.channel_sent.load(Ordering::Relaxed),
            channel_received: self.channel_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficCounts {
    pub socket_sent: u64,
    pub socket_received: u64,
    pub channel_sent: u64,
    pub channel_received: u64,
}

/// Payload byte counts shared by all sessions of one side. Each forwarded
/// buffer pushes its length onto one of the queues.
///
/// The queues hold every length until a handler drains them.
/// [`PeerTraffic::count_totals`] installs handlers adding them up; the
/// orchestrators call it when they start.
#[derive(Debug, Clone, Default)]
pub struct PeerTraffic {
    pub bytes_sent_to_peer: HandlerQueue<usize>,
    pub bytes_received_from_peer: HandlerQueue<usize>,
    sent_total: Arc<AtomicU64>,
    received_total: Arc<AtomicU64>,
}

impl PeerTraffic {
    /// Drains both queues into the running totals. Setting another handler
    /// on a queue stops its total.
    pub fn count_totals(&self) {
        let sent = self.sent_total.clone();
        self.bytes_sent_to_peer.set_sync_handler(move |len| {
            sent.fetch_add(len as u64, Ordering::Relaxed);
        });
        let received = self.received_total.clone();
        self.bytes_received_from_peer.set_sync_handler(move |len| {
            received.fetch_add(len as u64, Ordering::Relaxed);
        });
    }

    pub fn total_sent_to_peer(&self) -> u64 {
        self.sent_total.load(Ordering::Relaxed)
    }

    pub fn total_received_from_peer(&self) -> u64 {
        self.received_total.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct FlowState {
    overflow: bool,
    throttled: bool,
    /// bumped by every throttle so an older timer cannot end a newer one
    throttle_epoch: u64,
}

/// Pauses and resumes reading from a socket on two independent signals.
#[derive(Debug)]
pub struct FlowControl {
    conn: Connection,
    label: String,
    state: Mutex<FlowState>,
}

impl FlowControl {
    pub fn new(conn: Connection, label: &str) -> Arc<Self> {
        Arc::new(Self {
            conn,
            label: label.to_owned(),
            state: Mutex::new(FlowState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, state: &FlowState) {
        if self.conn.is_closed() {
            return;
        }
        if state.overflow || state.throttled {
            self.conn.pause();
        } else {
            self.conn.resume();
        }
    }

    pub fn set_overflow(&self, overflow: bool) {
        let mut state = self.lock();
        if overflow {
            debug!("{}: hit overflow, pausing socket", self.label);
        } else if state.overflow {
            debug!("{}: exited overflow", self.label);
        }
        state.overflow = overflow;
        self.apply(&state);
    }

    pub fn is_throttled(&self) -> bool {
        self.lock().throttled
    }

    /// Pauses the socket for `pause`, unless the channel keeps it paused
    /// longer.
    pub fn throttle(self: &Arc<Self>, pause: Duration) {
        let epoch = {
            let mut state = self.lock();
            state.throttled = true;
            state.throttle_epoch += 1;
            self.apply(&state);
            state.throttle_epoch
        };
        trace!("{}: throttled for {:?}", self.label, pause);
        let flow = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(pause).await;
            let mut state = flow.lock();
            if state.throttle_epoch == epoch {
                state.throttled = false;
                flow.apply(&state);
            }
        });
    }
}

/// Starts forwarding between `conn` and `channel`.
///
/// The socket is expected to be paused; it is resumed here unless the
/// channel is already in overflow.
pub fn link(
    conn: &Connection,
    channel: &Arc<dyn DataChannel>,
    flow: &Arc<FlowControl>,
    traffic: &Arc<Traffic>,
    totals: &PeerTraffic,
) {
    {
        let channel = channel.clone();
        let traffic = traffic.clone();
        let sent_to_peer = totals.bytes_sent_to_peer.clone();
        conn.data_from_socket().set_sync_handler(move |data| {
            let len = data.len();
            traffic.socket_received.fetch_add(len as u64, Ordering::Relaxed);
            match channel.send(Frame::Binary(data)) {
                Ok(()) => {
                    traffic.channel_sent.fetch_add(len as u64, Ordering::Relaxed);
                    let _ = sent_to_peer.handle(len);
                }
                Err(err) => debug!("{}: dropping {} bytes: {}", channel.label(), len, err),
            }
        });
    }
    {
        let conn = conn.clone();
        let traffic = traffic.clone();
        let received_from_peer = totals.bytes_received_from_peer.clone();
        let label = channel.label().to_owned();
        channel.data_from_peer().set_handler(move |frame| {
            let written = match frame {
                Frame::Binary(data) => {
                    let len = data.len() as u64;
                    traffic.channel_received.fetch_add(len, Ordering::Relaxed);
                    let _ = received_from_peer.handle(data.len());
                    let traffic = traffic.clone();
                    let send = conn.send(data);
                    Some(async move {
                        match send.await {
                            Ok(()) => {
                                traffic.socket_sent.fetch_add(len, Ordering::Relaxed);
                            }
                            Err(err) => trace!("write after close: {}", err),
                        }
                    })
                }
                Frame::Text(text) => {
                    warn!("{}: unexpected text from peer ({} bytes)", label, text.len());
                    None
                }
            };
            async move {
                if let Some(written) = written {
                    written.await;
                }
            }
        });
    }

    flow.set_overflow(channel.is_in_overflow());
    let flow = flow.clone();
    channel.set_overflow_listener(Some(Arc::new(move |overflow| flow.set_overflow(overflow))));
}

/// Stops forwarding. Queued but unhandled data stays queued.
pub fn unlink(conn: &Connection, channel: &Arc<dyn DataChannel>) {
    conn.data_from_socket().stop_handling();
    channel.data_from_peer().stop_handling();
    channel.set_overflow_listener(None);
}

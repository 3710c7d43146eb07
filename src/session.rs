//! State shared by the sessions of both proxy halves.
//!
//! A session pairs one socket with one virtual channel for the lifetime of a
//! proxied flow. Every wait during its handshake races against the session's
//! stop signal and the closing of its channel, so stopping never blocks on a
//! silent peer.
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::*;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::connector::ConnectFailure;
use crate::handler_queue::QueueError;
use crate::model::{self, Reply};
use crate::relay::{self, FlowControl, PeerTraffic, Traffic};
use crate::tcp::{Connection, SocketError};
use crate::transport::{DataChannel, TransportError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session stopped")]
    Stopped,
    #[error("channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Protocol(#[from] model::Error),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("unexpected message from peer: {message}")]
    Peer { message: String },
    #[error("connect error: {0}")]
    Connect(ConnectFailure),
    #[error("destination not allowed")]
    NotAllowed,
    #[error("handshake failed with reply: {0}")]
    Rejected(Reply),
}

impl SessionError {
    pub fn peer(message: fmt::Arguments) -> Self {
        SessionError::Peer {
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Handshaking,
    Linked,
    Stopping,
    Stopped,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub name: String,
    /// seconds since the unix epoch
    pub timestamp: f64,
    pub state: SessionState,
    pub channel_sent: u64,
    pub channel_received: u64,
    pub channel_in_overflow: bool,
    pub channel_queue_size: usize,
    pub channel_queue_handling: bool,
    pub socket_sent: u64,
    pub socket_received: u64,
    pub socket_queue_size: usize,
    pub socket_queue_handling: bool,
}

struct Parts {
    state: SessionState,
    conn: Option<Connection>,
    flow: Option<Arc<FlowControl>>,
}

/// One proxied flow.
pub struct Session {
    id: u64,
    label: String,
    channel: Arc<dyn DataChannel>,
    traffic: Arc<Traffic>,
    parts: Mutex<Parts>,
    stopping: CancellationToken,
    stopped: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(channel: Arc<dyn DataChannel>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            label: channel.label().to_owned(),
            channel,
            traffic: Arc::new(Traffic::default()),
            parts: Mutex::new(Parts {
                state: SessionState::Handshaking,
                conn: None,
                flow: None,
            }),
            stopping: CancellationToken::new(),
            stopped: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Parts> {
        self.parts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unique for the life of the process, unlike the label.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }

    pub fn traffic(&self) -> &Arc<Traffic> {
        &self.traffic
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn long_id(&self) -> String {
        match &self.lock().conn {
            Some(conn) => format!(
                "session {} (socket {} {})",
                self.label,
                conn.id(),
                if conn.is_closed() { "closed" } else { "open" }
            ),
            None => format!("session {}", self.label),
        }
    }

    /// Requests the session to stop.
    pub fn stop(&self) {
        if !self.stopping.is_cancelled() {
            debug!("{}: stop requested", self.long_id());
            self.stopping.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Resolves once the socket and channel have been released.
    pub async fn once_stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Pauses reading from the socket for `pause`. Ignored before linking.
    pub fn throttle(&self, pause: Duration) {
        let flow = self.lock().flow.clone();
        if let Some(flow) = flow {
            flow.throttle(pause);
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.lock().flow.as_ref().map_or(false, |flow| flow.is_throttled())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (state, conn) = {
            let parts = self.lock();
            (parts.state, parts.conn.clone())
        };
        let counts = self.traffic.counts();
        let queue = self.channel.data_from_peer();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        SessionSnapshot {
            name: self.label.clone(),
            timestamp,
            state,
            channel_sent: counts.channel_sent,
            channel_received: counts.channel_received,
            channel_in_overflow: self.channel.is_in_overflow(),
            channel_queue_size: queue.len(),
            channel_queue_handling: queue.is_handling(),
            socket_sent: counts.socket_sent,
            socket_received: counts.socket_received,
            socket_queue_size: conn.as_ref().map_or(0, |c| c.data_from_socket().len()),
            socket_queue_handling: conn
                .as_ref()
                .map_or(false, |c| c.data_from_socket().is_handling()),
        }
    }

    pub(crate) fn set_connection(&self, conn: &Connection) {
        self.lock().conn = Some(conn.clone());
    }

    /// Runs `fut` unless the session is stopped or its channel closes first.
    pub(crate) async fn guard<T, F>(&self, fut: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, SessionError>>,
    {
        let closed = self.channel.closed();
        tokio::select! {
            biased;
            _ = self.stopping.cancelled() => Err(SessionError::Stopped),
            _ = closed.cancelled() => Err(SessionError::ChannelClosed),
            res = fut => res,
        }
    }

    /// Starts forwarding between `conn` and the channel.
    pub(crate) fn link(&self, conn: &Connection, totals: &PeerTraffic) {
        debug!("{}: linking socket and channel", self.long_id());
        let flow = FlowControl::new(conn.clone(), &self.label);
        {
            let mut parts = self.lock();
            parts.state = SessionState::Linked;
            parts.conn = Some(conn.clone());
            parts.flow = Some(flow.clone());
        }
        relay::link(conn, &self.channel, &flow, &self.traffic, totals);
    }

    /// Waits until the socket or the channel terminates, or a stop is
    /// requested.
    pub(crate) async fn wait_terminated(&self, conn: &Connection) {
        let closed = self.channel.closed();
        tokio::select! {
            kind = conn.once_closed() => info!("{}: socket closed ({:?})", self.long_id(), kind),
            _ = closed.cancelled() => {
                let unprocessed = self.channel.data_from_peer().len();
                if unprocessed > 0 {
                    warn!(
                        "{}: channel closed with {} unprocessed incoming messages",
                        self.long_id(),
                        unprocessed
                    );
                } else {
                    info!("{}: channel closed", self.long_id());
                }
            }
            _ = self.stopping.cancelled() => {}
        }
    }

    /// Closes the socket and the channel if still open, then reports the
    /// session stopped.
    pub(crate) async fn release(&self) {
        debug!("{}: freeing resources", self.long_id());
        let (conn, linked) = {
            let mut parts = self.lock();
            let linked = parts.state == SessionState::Linked;
            parts.state = SessionState::Stopping;
            parts.flow = None;
            (parts.conn.clone(), linked)
        };
        self.stopping.cancel();
        if let (Some(conn), true) = (&conn, linked) {
            relay::unlink(conn, &self.channel);
        }
        self.channel.close();
        if let Some(conn) = conn {
            conn.close().await;
        }
        self.lock().state = SessionState::Stopped;
        self.stopped.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::test::MockChannel;

    #[tokio::test]
    async fn guard_races_stop_and_close() {
        let mock = MockChannel::new("p1");
        let session = Session::new(mock.clone());
        assert_eq!(session.label(), "p1");
        assert_eq!(session.state(), SessionState::Handshaking);

        let res = session.guard(async { Ok::<_, SessionError>(7) }).await;
        assert_eq!(res.unwrap(), 7);

        mock.close();
        let res: Result<(), _> = session.guard(futures_util::future::pending()).await;
        assert!(matches!(res, Err(SessionError::ChannelClosed)));

        let session = Session::new(MockChannel::new("p2"));
        session.stop();
        let res: Result<(), _> = session.guard(futures_util::future::pending()).await;
        assert!(matches!(res, Err(SessionError::Stopped)));
    }

    #[tokio::test]
    async fn release_without_socket() {
        let mock = MockChannel::new("p1");
        let session = Session::new(mock.clone());
        session.release().await;
        session.once_stopped().await;
        assert!(session.is_stopped());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(mock.closed().is_cancelled());

        let snapshot = session.snapshot();
        assert_eq!(snapshot.name, "p1");
        assert_eq!(snapshot.socket_queue_size, 0);
        assert!(!snapshot.socket_queue_handling);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "Stopped");
        assert_eq!(json["channel_sent"], 0);
    }
}

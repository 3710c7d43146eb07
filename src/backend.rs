//! Half of the proxy connecting to destinations.
//!
//! Every virtual channel the frontend opens becomes a [`Session`] that
//! connects to the requested destination, unless the user already has as
//! many sessions as the [`SessionLimiter`] allows. Optionally, a global
//! bandwidth limit is shared fairly between all sessions.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future;
use log::*;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::connector::{Connector, TcpConnector};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::relay::PeerTraffic;
use crate::session::{Session, SessionSnapshot};
use crate::transport::{DataChannel, Transport};

pub mod bandwidth;
pub mod limiter;
pub mod policy;
pub mod session;

pub use self::limiter::SessionLimiter;

#[derive(Default)]
struct State {
    started: bool,
    pool: Option<Arc<Pool>>,
    sessions: HashMap<String, Arc<Session>>,
}

struct Inner {
    config: BackendConfig,
    user: Option<String>,
    limiter: Arc<SessionLimiter>,
    context: Arc<session::Context>,
    state: Mutex<State>,
    stopping: CancellationToken,
    stopped: CancellationToken,
}

/// Serves the requests of one peer.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

impl Backend {
    /// `user` identifies the peer to `limiter`; sessions of an anonymous peer
    /// are not limited.
    pub fn new(config: BackendConfig, user: Option<String>, limiter: Arc<SessionLimiter>) -> Self {
        let connector = Arc::new(TcpConnector::new(config.connect_timeout));
        Self::with_connector(config, user, limiter, connector)
    }

    pub fn with_connector(
        config: BackendConfig,
        user: Option<String>,
        limiter: Arc<SessionLimiter>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let context = Arc::new(session::Context {
            allow_non_unicast: config.allow_non_unicast,
            reproxy: config.reproxy.clone(),
            connector,
            totals: PeerTraffic::default(),
        });
        Self {
            inner: Arc::new(Inner {
                config,
                user,
                limiter,
                context,
                state: Mutex::new(State::default()),
                stopping: CancellationToken::new(),
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// Byte counts of all sessions. Once started, the queues are drained
    /// into the totals.
    pub fn traffic(&self) -> &PeerTraffic {
        &self.inner.context.totals
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.inner.snapshot()
    }

    /// Starts serving channels opened by the peer and waits for the
    /// transport to connect.
    pub async fn start(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let pool = {
            let mut state = self.inner.lock();
            if state.started {
                return Err(Error::AlreadyStarted);
            }
            if self.inner.stopping.is_cancelled() {
                return Err(Error::Stopped);
            }
            state.started = true;
            self.inner.context.totals.count_totals();
            let pool = Arc::new(Pool::new(transport.clone(), "backend"));
            state.pool = Some(pool.clone());
            pool
        };
        {
            let inner = self.inner.clone();
            pool.peer_opened_channels()
                .set_sync_handler(move |channel| inner.on_peer_opened(channel));
        }
        tokio::spawn(self.inner.clone().watch(transport.clone()));
        if let Some(limit) = self.inner.config.bandwidth_limit {
            let interval = self.inner.config.bandwidth_interval;
            if interval.is_zero() {
                warn!("bandwidth interval is zero, not limiting bandwidth");
            } else {
                tokio::spawn(self.inner.clone().monitor_bandwidth(limit, interval));
            }
        }
        match self.inner.config.snapshot_interval {
            Some(interval) if interval.is_zero() => {
                warn!("snapshot interval is zero, not logging snapshots")
            }
            Some(interval) => {
                tokio::spawn(self.inner.clone().log_snapshots(interval));
            }
            None => {}
        }

        let res = tokio::select! {
            res = transport.once_connected() => res.map_err(Error::from),
            _ = self.inner.stopping.cancelled() => Err(Error::Stopped),
        };
        match &res {
            Ok(()) => info!("backend ready"),
            Err(err) => {
                error!("backend failed to start: {}", err);
                self.inner.stopping.cancel();
            }
        }
        res
    }

    pub fn stop(&self) {
        let started = self.inner.lock().started;
        self.inner.stopping.cancel();
        if !started {
            self.inner.stopped.cancel();
        }
    }

    /// Resolves once the transport is closed and all sessions are discarded.
    pub async fn once_stopped(&self) {
        self.inner.stopped.cancelled().await
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions().iter().map(|s| s.snapshot()).collect()
    }

    fn on_peer_opened(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        let label = channel.label().to_owned();
        if self.stopping.is_cancelled() {
            channel.close();
            return;
        }
        if !self.limiter.try_acquire(self.user()) {
            warn!(
                "user {} reached the limit of {} sessions, closing channel {}",
                self.user().unwrap_or_default(),
                self.limiter.limit(),
                label
            );
            channel.close();
            return;
        }

        info!("associating session {} with new peer channel", label);
        let session = Session::new(channel);
        {
            let mut state = self.lock();
            if self.stopping.is_cancelled() {
                drop(state);
                self.limiter.release(self.user());
                session.channel().close();
                return;
            }
            state.sessions.insert(label.clone(), session.clone());
        }

        let inner = self.clone();
        tokio::spawn(async move {
            session::run(session.clone(), inner.context.clone()).await;
            inner.discard(&label, &session);
        });
    }

    fn discard(&self, label: &str, session: &Arc<Session>) {
        let remaining = {
            let mut state = self.lock();
            if let Some(current) = state.sessions.get(label) {
                if Arc::ptr_eq(current, session) {
                    state.sessions.remove(label);
                }
            }
            state.sessions.len()
        };
        self.limiter.release(self.user());
        info!("discarded session {} ({} remaining)", label, remaining);
    }

    async fn watch(self: Arc<Self>, transport: Arc<dyn Transport>) {
        let transport_closed = transport.closed();
        tokio::select! {
            _ = self.stopping.cancelled() => debug!("backend: stop requested"),
            _ = transport_closed.cancelled() => info!("backend: peer transport closed"),
        }
        self.stopping.cancel();
        transport.close();

        let sessions: Vec<Arc<Session>> = {
            let mut state = self.lock();
            state.pool = None;
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        debug!("backend: stopping {} sessions", sessions.len());
        for session in &sessions {
            session.stop();
        }
        future::join_all(sessions.iter().map(|s| s.once_stopped())).await;
        info!("backend: stopped");
        self.stopped.cancel();
    }

    /// Every `interval`, pauses the sessions that used more than their share
    /// of `limit` bytes per second.
    async fn monitor_bandwidth(self: Arc<Self>, limit: u64, interval: Duration) {
        let budget = (limit as f64 * interval.as_secs_f64()) as u64;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last: HashMap<u64, u64> = HashMap::new();
        loop {
            tokio::select! {
                _ = self.stopping.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sessions = self.sessions();
            let mut totals = HashMap::with_capacity(sessions.len());
            let used: Vec<u64> = sessions
                .iter()
                .map(|session| {
                    let total = session.traffic().transferred();
                    totals.insert(session.id(), total);
                    total.saturating_sub(last.get(&session.id()).copied().unwrap_or(0))
                })
                .collect();
            last = totals;

            let allowed = bandwidth::allocate(budget, &used);
            for ((session, used), allowed) in sessions.iter().zip(&used).zip(&allowed) {
                trace!(
                    "{}: {:.0} bytes/s",
                    session.label(),
                    *used as f64 / interval.as_secs_f64()
                );
                if let Some(pause) = bandwidth::pause_for(*used, *allowed, interval) {
                    debug!(
                        "{}: used {} of {} bytes, pausing for {:?}",
                        session.label(),
                        used,
                        allowed,
                        pause
                    );
                    session.throttle(pause);
                }
            }
        }
    }

    async fn log_snapshots(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.stopping.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match serde_json::to_string(&self.snapshot()) {
                Ok(json) => info!("backend snapshot: {}", json),
                Err(err) => warn!("cannot serialize snapshot: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connector::test::RedirectConnector;
    use crate::loopback;
    use crate::model::{Endpoint, Reply, Request, Response};
    use crate::transport::Frame;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn eventually<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met");
    }

    fn request(endpoint: Endpoint) -> Frame {
        Frame::Text(serde_json::to_string(&Request::connect(endpoint)).unwrap())
    }

    async fn response(channel: &Arc<dyn DataChannel>) -> Response {
        match channel.data_from_peer().next_item().await.unwrap() {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            frame => panic!("unexpected frame {:?}", frame),
        }
    }

    #[tokio::test]
    async fn session_limit_closes_channels() {
        let (a, b) = loopback::pair();
        let limiter = Arc::new(SessionLimiter::new(1));
        let backend = Backend::with_connector(
            BackendConfig::default(),
            Some("alice".into()),
            limiter.clone(),
            Arc::new(RedirectConnector::default()),
        );
        backend.start(b).await.unwrap();
        let peer = Pool::new(a.clone(), "frontend");

        let first = peer.open_data_channel().await.unwrap();
        eventually(|| backend.session_count() == 1).await;
        let second = peer.open_data_channel().await.unwrap();
        second.closed().cancelled().await;
        assert_eq!(backend.session_count(), 1);
        assert_eq!(limiter.count("alice"), 1);

        first.close();
        first.closed().cancelled().await;
        eventually(|| limiter.count("alice") == 0).await;
        assert_eq!(backend.session_count(), 0);

        // the freed slot can be used again, on a reused channel
        let third = peer.open_data_channel().await.unwrap();
        eventually(|| backend.session_count() == 1).await;
        assert_eq!(peer.local_channel_count(), 2);
        third.close();

        backend.stop();
        backend.once_stopped().await;
        assert!(a.closed().is_cancelled());
    }

    #[tokio::test]
    async fn relays_through_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Endpoint::new("example.com", 80);
        let connector: RedirectConnector = vec![(target.clone(), Ok(listener.local_addr().unwrap()))]
            .into_iter()
            .collect();
        let mut config = BackendConfig::default();
        config.set_allow_non_unicast(true);
        let (a, b) = loopback::pair();
        let backend = Backend::with_connector(
            config,
            None,
            Arc::new(SessionLimiter::default()),
            Arc::new(connector),
        );
        backend.start(b).await.unwrap();
        let peer = Pool::new(a, "frontend");

        let channel = peer.open_data_channel().await.unwrap();
        channel.send(request(target)).unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(response(&channel).await.reply, Reply::Succeeded);

        channel.send(Frame::Binary(Bytes::from_static(b"abc"))).unwrap();
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        server.write_all(b"xyz").await.unwrap();
        assert_eq!(
            channel.data_from_peer().next_item().await.unwrap(),
            Frame::Binary(Bytes::from_static(b"xyz"))
        );

        let snapshot = backend.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, channel.label());
        assert_eq!(snapshot[0].channel_received, 3);
        assert_eq!(snapshot[0].socket_sent, 3);
        assert_eq!(snapshot[0].channel_sent, 3);

        drop(server);
        channel.closed().cancelled().await;
        eventually(|| backend.session_count() == 0).await;
        backend.stop();
        backend.once_stopped().await;
    }

    #[tokio::test]
    async fn start_twice() {
        let (_a, b) = loopback::pair();
        let backend = Backend::new(BackendConfig::default(), None, Arc::new(SessionLimiter::default()));
        backend.start(b.clone()).await.unwrap();
        assert!(matches!(backend.start(b).await, Err(Error::AlreadyStarted)));
        backend.stop();
        backend.once_stopped().await;
    }

    #[tokio::test]
    async fn bandwidth_monitor_throttles_heavy_sessions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Endpoint::new("example.com", 80);
        let connector: RedirectConnector = vec![(target.clone(), Ok(listener.local_addr().unwrap()))]
            .into_iter()
            .collect();
        let mut config = BackendConfig::default();
        config
            .set_allow_non_unicast(true)
            .set_bandwidth_limit(Some(100), Duration::from_millis(500));
        let (a, b) = loopback::pair();
        let backend = Backend::with_connector(
            config,
            None,
            Arc::new(SessionLimiter::default()),
            Arc::new(connector),
        );
        backend.start(b).await.unwrap();
        let peer = Pool::new(a, "frontend");

        let channel = peer.open_data_channel().await.unwrap();
        channel.send(request(target)).unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(response(&channel).await.reply, Reply::Succeeded);
        let session = backend.inner.sessions().remove(0);
        assert!(!session.is_throttled());

        // 50 bytes allowed per interval
        server.write_all(&[0u8; 1000]).await.unwrap();
        eventually(|| session.is_throttled()).await;

        backend.stop();
        backend.once_stopped().await;
    }
}

//! Half of the proxy facing SOCKS clients.
//!
//! Every accepted client gets a fresh virtual channel to the backend and a
//! [`Session`] running its handshake and relay.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future;
use log::*;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::FrontendConfig;
use crate::error::{Error, Result};
use crate::model::{Endpoint, Response};
use crate::pool::Pool;
use crate::relay::PeerTraffic;
use crate::session::Session;
use crate::tcp::{Connection, Server};
use crate::transport::Transport;

pub mod session;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    started: bool,
    sessions: HashMap<String, Arc<Session>>,
}

struct Inner {
    config: FrontendConfig,
    state: Mutex<State>,
    totals: PeerTraffic,
    stopping: CancellationToken,
    stopped: CancellationToken,
}

/// Accepts SOCKS clients and forwards their flows to the peer.
#[derive(Clone)]
pub struct Frontend {
    inner: Arc<Inner>,
}

impl Frontend {
    pub fn new(config: FrontendConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                totals: PeerTraffic::default(),
                stopping: CancellationToken::new(),
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// Byte counts of all sessions. Once started, the queues are drained
    /// into the totals.
    pub fn traffic(&self) -> &PeerTraffic {
        &self.inner.totals
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Listens for SOCKS clients and waits for the transport to connect.
    /// Resolves to the bound endpoint.
    ///
    /// The frontend stops once the transport closes, whether or not it ever
    /// became ready.
    pub async fn start(&self, transport: Arc<dyn Transport>) -> Result<Endpoint> {
        {
            let mut state = self.inner.lock();
            if state.started {
                return Err(Error::AlreadyStarted);
            }
            if self.inner.stopping.is_cancelled() {
                return Err(Error::Stopped);
            }
            state.started = true;
        }

        let server = Server::with_max_connections(
            self.inner.config.listen_endpoint(),
            self.inner.config.max_connections,
        );
        self.inner.totals.count_totals();
        let pool = Arc::new(Pool::new(transport.clone(), "frontend"));
        {
            let inner = self.inner.clone();
            server.connections_queue().set_sync_handler(move |conn| {
                tokio::spawn(inner.clone().on_connection(pool.clone(), conn));
            });
        }
        tokio::spawn(self.inner.clone().watch(transport.clone(), server.clone()));

        let ready = async {
            let endpoint = server.listen().await?;
            transport.once_connected().await?;
            Ok::<_, Error>(endpoint)
        };
        let res = tokio::select! {
            res = ready => res,
            _ = self.inner.stopping.cancelled() => Err(Error::Stopped),
        };
        match &res {
            Ok(endpoint) => info!("frontend ready on {}", endpoint),
            Err(err) => {
                error!("frontend failed to start: {}", err);
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

    async fn watch(self: Arc<Self>, transport: Arc<dyn Transport>, server: Server) {
        let transport_closed = transport.closed();
        tokio::select! {
            _ = self.stopping.cancelled() => debug!("frontend: stop requested"),
            _ = server.once_shutdown() => info!("frontend: server shut down"),
            _ = transport_closed.cancelled() => info!("frontend: peer transport closed"),
        }
        self.stopping.cancel();
        transport.close();

        let sessions: Vec<Arc<Session>> = self.lock().sessions.drain().map(|(_, s)| s).collect();
        debug!("frontend: stopping {} sessions", sessions.len());
        for session in &sessions {
            session.stop();
        }
        future::join_all(sessions.iter().map(|s| s.once_stopped())).await;
        server.shutdown().await;
        info!("frontend: stopped");
        self.stopped.cancel();
    }

    async fn on_connection(self: Arc<Self>, pool: Arc<Pool>, conn: Connection) {
        if self.stopping.is_cancelled() {
            conn.close().await;
            return;
        }
        let channel = match pool.open_data_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!("failed to open channel for new SOCKS client: {}", err);
                if let Ok(reply) = codec::compose_response(&Response::failure()) {
                    let _ = tokio::time::timeout(REPLY_TIMEOUT, conn.send(Bytes::from(reply))).await;
                }
                conn.close().await;
                return;
            }
        };
        info!(
            "associating channel {} with new SOCKS client {}",
            channel.label(),
            conn.id()
        );
        let session = Session::new(channel);
        let label = session.label().to_owned();
        {
            let mut state = self.lock();
            if self.stopping.is_cancelled() {
                session.stop();
            } else {
                state.sessions.insert(label.clone(), session.clone());
            }
        }

        session::run(session.clone(), conn, self.totals.clone()).await;

        let mut state = self.lock();
        if let Some(current) = state.sessions.get(&label) {
            if Arc::ptr_eq(current, &session) {
                state.sessions.remove(&label);
            }
        }
        debug!("frontend: {} sessions left", state.sessions.len());
    }
}

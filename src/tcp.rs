//! TCP sockets seen through handler queues.
//!
//! A [`Connection`] owns one TCP stream. Bytes read from it are pushed onto
//! [`Connection::data_from_socket`]; [`Connection::send`] queues bytes for
//! writing. A [`Server`] owns a listening socket and pushes every accepted
//! connection onto its [`Server::connections_queue`].
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future;
use log::*;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::connector::{ConnectFailure, Connector};
use crate::handler_queue::HandlerQueue;
use crate::model::Endpoint;

pub const DEFAULT_MAX_CONNECTIONS: usize = 1_048_576;
const READ_BUFFER_SIZE: usize = 16 * 1024;
/// time given to queued writes once a connection is closing
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    #[error("connect error: {0}")]
    Connect(ConnectFailure),
    #[error("socket closed")]
    Closed,
    #[error("address already in use: {addr}")]
    AddressInUse { addr: Endpoint },
    #[error("address not available: {addr}")]
    AddressNotAvailable { addr: Endpoint },
    #[error("io error: {message}")]
    Io { message: String },
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        SocketError::Io {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCloseKind {
    WeClosedIt,
    RemotelyClosed,
    NeverConnected,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Error,
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub bound: Endpoint,
    pub remote: Endpoint,
}

impl ConnectionInfo {
    fn of(stream: &TcpStream) -> Result<Self, SocketError> {
        Ok(Self {
            bound: stream.local_addr()?.into(),
            remote: stream.peer_addr()?.into(),
        })
    }
}

type WriteRequest = (Bytes, oneshot::Sender<Result<(), SocketError>>);

struct ConnInner {
    id: String,
    state: Mutex<ConnectionState>,
    data_from_socket: HandlerQueue<Bytes>,
    data_to_socket: HandlerQueue<Bytes, Result<(), SocketError>>,
    paused: watch::Sender<bool>,
    connected: watch::Sender<Option<Result<ConnectionInfo, SocketError>>>,
    closed: watch::Sender<Option<SocketCloseKind>>,
    close_requested: CancellationToken,
}

impl ConnInner {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, kind: SocketCloseKind) {
        *self.lock_state() = ConnectionState::Closed;
        self.closed.send_replace(Some(kind));
        debug!("{}: closed ({:?})", self.id, kind);
    }

    fn finish_unconnected(&self, err: SocketError) {
        self.connected.send_replace(Some(Err(err)));
        self.finish(SocketCloseKind::NeverConnected);
    }
}

enum Source {
    Accepted(TcpStream),
    Connect(Arc<dyn Connector>, Endpoint),
}

/// One TCP connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    fn new(start_paused: bool) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Arc::new(ConnInner {
                id: format!("N{}", id),
                state: Mutex::new(ConnectionState::Connecting),
                data_from_socket: HandlerQueue::new(),
                data_to_socket: HandlerQueue::new(),
                paused: watch::channel(start_paused).0,
                connected: watch::channel(None).0,
                closed: watch::channel(None).0,
                close_requested: CancellationToken::new(),
            }),
        }
    }

    /// Wraps a stream accepted by a listening socket.
    pub fn accepted(stream: TcpStream) -> Self {
        let conn = Self::new(false);
        tokio::spawn(drive(conn.inner.clone(), Source::Accepted(stream)));
        conn
    }

    /// Connects to `endpoint`. A paused connection does not read from the
    /// socket until [`Connection::resume`] is called.
    pub fn connect(connector: Arc<dyn Connector>, endpoint: Endpoint, start_paused: bool) -> Self {
        let conn = Self::new(start_paused);
        if !endpoint.is_valid() {
            error!("{}: invalid endpoint: {:?}", conn.id(), endpoint);
            *conn.inner.lock_state() = ConnectionState::Error;
            conn.inner
                .connected
                .send_replace(Some(Err(SocketError::Connect(ConnectFailure::InvalidEndpoint))));
            conn.inner
                .closed
                .send_replace(Some(SocketCloseKind::NeverConnected));
            return conn;
        }
        tokio::spawn(drive(conn.inner.clone(), Source::Connect(connector, endpoint)));
        conn
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.lock_state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }

    pub fn data_from_socket(&self) -> &HandlerQueue<Bytes> {
        &self.inner.data_from_socket
    }

    /// Writes `data`. Resolves once the bytes are handed to the OS.
    pub fn send(&self, data: Bytes) -> impl Future<Output = Result<(), SocketError>> {
        let handled = {
            let state = self.inner.lock_state();
            match *state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    Some(self.inner.data_to_socket.handle(data))
                }
                _ => None,
            }
        };
        async move {
            match handled {
                Some(handled) => handled.await.unwrap_or(Err(SocketError::Closed)),
                None => Err(SocketError::Closed),
            }
        }
    }

    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub async fn once_connected(&self) -> Result<ConnectionInfo, SocketError> {
        let mut rx = self.inner.connected.subscribe();
        let res = match rx.wait_for(Option::is_some).await {
            Ok(res) => (*res).clone(),
            Err(_) => None,
        };
        res.unwrap_or(Err(SocketError::Closed))
    }

    pub async fn once_closed(&self) -> SocketCloseKind {
        let mut rx = self.inner.closed.subscribe();
        let kind = match rx.wait_for(Option::is_some).await {
            Ok(kind) => *kind,
            Err(_) => None,
        };
        kind.unwrap_or(SocketCloseKind::Unknown)
    }

    /// Closes the connection and waits until it is closed. Calling it again
    /// returns the same kind.
    pub async fn close(&self) -> SocketCloseKind {
        {
            let mut state = self.inner.lock_state();
            if let ConnectionState::Connecting | ConnectionState::Connected = *state {
                *state = ConnectionState::Closing;
            }
        }
        self.inner.close_requested.cancel();
        self.once_closed().await
    }

    /// Next chunk of bytes read from the socket. Fails once the socket is
    /// closed and nothing is left to read.
    pub async fn receive_next(&self) -> Result<Bytes, SocketError> {
        let next = self.inner.data_from_socket.next_item();
        tokio::select! {
            biased;
            item = next => item.map_err(|_| SocketError::Closed),
            _ = self.once_closed() => Err(SocketError::Closed),
        }
    }
}

async fn drive(inner: Arc<ConnInner>, source: Source) {
    let stream = match source {
        Source::Accepted(stream) => stream,
        Source::Connect(connector, endpoint) => {
            tokio::select! {
                res = connector.connect(&endpoint) => match res {
                    Ok(stream) => stream,
                    Err(failure) => {
                        debug!("{}: connect error: {}", inner.id, failure);
                        inner.finish_unconnected(SocketError::Connect(failure));
                        return;
                    }
                },
                _ = inner.close_requested.cancelled() => {
                    inner.finish_unconnected(SocketError::Closed);
                    return;
                }
            }
        }
    };
    let info = match ConnectionInfo::of(&stream) {
        Ok(info) => info,
        Err(err) => {
            inner.finish_unconnected(err);
            return;
        }
    };
    {
        let mut state = inner.lock_state();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
        }
    }
    trace!("{}: connected: {:?}", inner.id, info);
    inner.connected.send_replace(Some(Ok(info)));

    let (rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<WriteRequest>();
    let write_failed = CancellationToken::new();
    let writer = tokio::spawn(write_loop(inner.id.clone(), wr, rx, write_failed.clone()));
    let abort_writer = writer.abort_handle();
    inner.data_to_socket.set_handler(move |data: Bytes| {
        let (ack, done) = oneshot::channel();
        let queued = tx.send((data, ack)).is_ok();
        async move {
            if !queued {
                return Err(SocketError::Closed);
            }
            done.await.unwrap_or(Err(SocketError::Closed))
        }
    });

    let kind = read_loop(&inner, rd, &write_failed).await;

    *inner.lock_state() = ConnectionState::Closing;
    // dropping the handler lets the writer finish what is already queued
    inner.data_to_socket.stop_handling();
    inner.data_to_socket.clear();
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        warn!("{}: pending writes abandoned", inner.id);
        abort_writer.abort();
    }
    inner.finish(kind);
}

async fn read_loop(
    inner: &ConnInner,
    mut rd: OwnedReadHalf,
    write_failed: &CancellationToken,
) -> SocketCloseKind {
    let mut paused = inner.paused.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let read = async {
            let _ = paused.wait_for(|paused| !*paused).await;
            rd.read_buf(&mut buf).await
        };
        tokio::select! {
            biased;
            _ = inner.close_requested.cancelled() => return SocketCloseKind::WeClosedIt,
            _ = write_failed.cancelled() => return SocketCloseKind::Unknown,
            res = read => match res {
                Ok(0) => return SocketCloseKind::RemotelyClosed,
                Ok(n) => {
                    trace!("{}: read {} bytes", inner.id, n);
                    let _ = inner.data_from_socket.handle(buf.split().freeze());
                }
                Err(err) => {
                    debug!("{}: read error: {}", inner.id, err);
                    return match err.kind() {
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                            SocketCloseKind::RemotelyClosed
                        }
                        _ => SocketCloseKind::Unknown,
                    };
                }
            }
        }
    }
}

async fn write_loop(
    id: String,
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    failed: CancellationToken,
) {
    while let Some((data, ack)) = rx.recv().await {
        match wr.write_all(&data).await {
            Ok(()) => {
                ack.send(Ok(())).ok();
            }
            Err(err) => {
                debug!("{}: write error: {}", id, err);
                ack.send(Err(err.into())).ok();
                failed.cancel();
                return;
            }
        }
    }
    wr.shutdown().await.ok();
}

struct ServerInner {
    endpoint: Endpoint,
    max_connections: usize,
    connections_queue: HandlerQueue<Connection>,
    connections: Mutex<HashMap<String, Connection>>,
    listening: watch::Sender<Option<Result<Endpoint, SocketError>>>,
    stop_listening: CancellationToken,
    shutdown: CancellationToken,
}

impl ServerInner {
    fn lock_connections(&self) -> MutexGuard<'_, HashMap<String, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn on_accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let count = self.lock_connections().len();
        if count >= self.max_connections {
            warn!("too many connections ({}), closing {}", count, addr);
            return;
        }
        let conn = Connection::accepted(stream);
        info!("connected: {}: {}", conn.id(), addr);
        self.lock_connections()
            .insert(conn.id().to_owned(), conn.clone());

        let server = Arc::downgrade(self);
        let closing = conn.clone();
        tokio::spawn(async move {
            closing.once_closed().await;
            if let Some(server) = server.upgrade() {
                server.lock_connections().remove(closing.id());
            }
        });
        let _ = self.connections_queue.handle(conn);
    }
}

/// A listening TCP socket.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_max_connections(endpoint, DEFAULT_MAX_CONNECTIONS)
    }

    /// Connections accepted beyond `max_connections` are closed right away.
    pub fn with_max_connections(endpoint: Endpoint, max_connections: usize) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                endpoint,
                max_connections,
                connections_queue: HandlerQueue::new(),
                connections: Mutex::new(HashMap::new()),
                listening: watch::channel(None).0,
                stop_listening: CancellationToken::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn connections_queue(&self) -> &HandlerQueue<Connection> {
        &self.inner.connections_queue
    }

    pub fn connections_count(&self) -> usize {
        self.inner.lock_connections().len()
    }

    /// Binds and starts accepting. Resolves to the bound endpoint.
    pub async fn listen(&self) -> Result<Endpoint, SocketError> {
        if self.inner.listening.borrow().is_some() {
            return self.once_listening().await;
        }
        let res = bind_listener(&self.inner.endpoint).and_then(|listener| {
            let bound = Endpoint::from(listener.local_addr()?);
            info!("listening on {}", bound);
            tokio::spawn(accept_loop(self.inner.clone(), listener));
            Ok(bound)
        });
        if let Err(err) = &res {
            error!("listen error: {}: {}", self.inner.endpoint, err);
        }
        self.inner.listening.send_replace(Some(res.clone()));
        res
    }

    pub async fn once_listening(&self) -> Result<Endpoint, SocketError> {
        let mut rx = self.inner.listening.subscribe();
        let res = match rx.wait_for(Option::is_some).await {
            Ok(res) => (*res).clone(),
            Err(_) => None,
        };
        res.unwrap_or(Err(SocketError::Closed))
    }

    /// Stops accepting; open connections are left alone.
    pub fn stop_listening(&self) {
        self.inner.stop_listening.cancel();
    }

    pub async fn close_all(&self) {
        let conns: Vec<Connection> = self.inner.lock_connections().values().cloned().collect();
        future::join_all(conns.iter().map(Connection::close)).await;
    }

    pub async fn shutdown(&self) {
        self.stop_listening();
        self.close_all().await;
        self.inner.shutdown.cancel();
    }

    pub async fn once_shutdown(&self) {
        self.inner.shutdown.cancelled().await
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.stop_listening.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, addr)) => inner.on_accept(stream, addr),
                Err(err) => {
                    error!("accept error: {}", err);
                    trace!("accept error: {:?}", err);
                    break;
                }
            }
        }
    }
    debug!("stopped listening on {}", inner.endpoint);
}

fn bind_listener(endpoint: &Endpoint) -> Result<TcpListener, SocketError> {
    let addr = endpoint
        .socket_addr()
        .ok_or_else(|| SocketError::AddressNotAvailable {
            addr: endpoint.clone(),
        })?;
    let tcp = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    tcp.set_reuse_address(true)
        .map_err(|err| addr_error(err, endpoint))?;
    tcp.bind(&addr.into())
        .map_err(|err| addr_error(err, endpoint))?;

    // `backlog` is passed straight to listen(2); too small a value makes
    // clients fail to connect(2) under load.
    tcp.listen(256)?;
    tcp.set_nonblocking(true)?;
    Ok(TcpListener::from_std(tcp.into())?)
}

fn addr_error(io_err: io::Error, endpoint: &Endpoint) -> SocketError {
    match io_err.kind() {
        io::ErrorKind::AddrInUse => SocketError::AddressInUse {
            addr: endpoint.clone(),
        },
        io::ErrorKind::AddrNotAvailable => SocketError::AddressNotAvailable {
            addr: endpoint.clone(),
        },
        _ => io_err.into(),
    }
}

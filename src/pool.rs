//! Virtual channels multiplexed over the data channels of a [`Transport`].
//!
//! Closing a virtual channel leaves the underlying data channel open. The
//! close is negotiated in band instead, and the data channel goes back to a
//! reuse list from which later calls to [`Pool::open_data_channel`] are
//! served. Text frames on the underlying channel carry JSON:
//!
//! ```text
//! {"control":"OPEN"}    the peer starts a new session on this channel
//! {"control":"CLOSE"}   close request, or the acknowledgement of one
//! {"data":"..."}        application text
//! ```
//!
//! Binary frames carry application data as-is.
//!
//! Every open/close cycle of a channel hands out a fresh [`VirtualChannel`]
//! lease. A lease whose cycle has ended reports itself closed and never sees
//! data of a later cycle.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use futures_util::future::{FutureExt, Shared};
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::handler_queue::{Handled, HandlerQueue};
use crate::transport::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlMessage {
    Open,
    Close,
}

/// A frame of the underlying channel, decoded once on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Control(ControlMessage),
    Text(String),
    Binary(Bytes),
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum Envelope {
    Control(ControlMessage),
    Data(String),
}

impl ChannelFrame {
    pub fn decode(frame: Frame) -> Result<Self, PoolError> {
        match frame {
            Frame::Binary(data) => Ok(ChannelFrame::Binary(data)),
            Frame::Text(text) => match serde_json::from_str(&text) {
                Ok(Envelope::Control(control)) => Ok(ChannelFrame::Control(control)),
                Ok(Envelope::Data(data)) => Ok(ChannelFrame::Text(data)),
                Err(err) => Err(PoolError::Malformed {
                    message: format!("{}: {:?}", err, text),
                }),
            },
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            ChannelFrame::Control(control) => Frame::Text(json!({ "control": control }).to_string()),
            ChannelFrame::Text(data) => Frame::Text(json!({ "data": data }).to_string()),
            ChannelFrame::Binary(data) => Frame::Binary(data),
        }
    }
}

impl From<Frame> for ChannelFrame {
    /// Wraps application data.
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => ChannelFrame::Text(text),
            Frame::Binary(data) => ChannelFrame::Binary(data),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("{label}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        label: String,
        from: ChannelState,
        to: ChannelState,
    },
    #[error("malformed channel message: {message}")]
    Malformed { message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Life cycle of a pooled channel.
///
/// ```text
///  Closed --open--> Open --close--> Closing --drained/acked--> Closed
///     \               |                |
///      +--------------+----------------+--> PermanentlyClosed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// waiting for the peer's acknowledgement, or draining before sending ours
    Closing,
    Closed,
    /// the underlying channel is gone
    PermanentlyClosed,
}

impl ChannelState {
    pub fn can_become(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Closed, Open)
                | (Open, Closing)
                | (Closing, Closed)
                | (Open, PermanentlyClosed)
                | (Closing, PermanentlyClosed)
                | (Closed, PermanentlyClosed)
        )
    }
}

/// One open/close cycle of a pooled channel.
struct Cycle {
    id: u64,
    data_from_peer: HandlerQueue<Frame>,
    closed: CancellationToken,
}

impl Cycle {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            data_from_peer: HandlerQueue::new(),
            closed: CancellationToken::new(),
        })
    }
}

struct ChannelInner {
    state: ChannelState,
    cycle: Arc<Cycle>,
    /// completion of the most recent frame given to the current cycle
    last_handled: Option<Shared<Handled<()>>>,
    /// an OPEN arrived while closing
    reopen_pending: bool,
}

impl ChannelInner {
    fn transition(&mut self, label: &str, to: ChannelState) -> Result<(), PoolError> {
        if !self.state.can_become(to) {
            return Err(PoolError::IllegalTransition {
                label: label.to_owned(),
                from: self.state,
                to,
            });
        }
        debug!("{}: {:?} -> {:?}", label, self.state, to);
        self.state = to;
        Ok(())
    }
}

enum Owner {
    Local(Weak<LocalPool>),
    Remote(Weak<RemotePool>),
}

/// An underlying data channel together with its control protocol state.
struct PoolChannel {
    dc: Arc<dyn DataChannel>,
    owner: Owner,
    inner: Mutex<ChannelInner>,
}

impl PoolChannel {
    fn new(dc: Arc<dyn DataChannel>, owner: Owner) -> Arc<Self> {
        let channel = Arc::new(Self {
            dc,
            owner,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Closed,
                cycle: Cycle::new(0),
                last_handled: None,
                reopen_pending: false,
            }),
        });
        let closed = channel.dc.closed();
        let weak = Arc::downgrade(&channel);
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(channel) = weak.upgrade() {
                channel.on_underlying_closed();
            }
        });
        channel.listen();
        channel
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn label(&self) -> &str {
        self.dc.label()
    }

    /// (Re)installs the handler of the underlying channel.
    fn listen(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.dc.data_from_peer().set_handler(move |frame| {
            let handled = weak
                .upgrade()
                .and_then(|channel| channel.on_data_from_peer(frame));
            async move {
                if let Some(handled) = handled {
                    let _ = handled.await;
                }
            }
        });
    }

    fn on_data_from_peer(self: &Arc<Self>, frame: Frame) -> Option<Shared<Handled<()>>> {
        match ChannelFrame::decode(frame) {
            Ok(ChannelFrame::Control(ControlMessage::Open)) => {
                self.on_open();
                None
            }
            Ok(ChannelFrame::Control(ControlMessage::Close)) => {
                self.on_close();
                None
            }
            Ok(ChannelFrame::Text(text)) => self.deliver(Frame::Text(text)),
            Ok(ChannelFrame::Binary(data)) => self.deliver(Frame::Binary(data)),
            Err(err) => {
                error!("{}: {}", self.label(), err);
                None
            }
        }
    }

    fn deliver(&self, frame: Frame) -> Option<Shared<Handled<()>>> {
        let cycle = {
            let inner = self.lock();
            match inner.state {
                ChannelState::Open | ChannelState::Closing => inner.cycle.clone(),
                state => {
                    warn!("{}: dropping data received while {:?}", self.label(), state);
                    return None;
                }
            }
        };
        let handled = cycle.data_from_peer.handle(frame).shared();
        let mut inner = self.lock();
        if inner.cycle.id == cycle.id {
            inner.last_handled = Some(handled.clone());
        }
        Some(handled)
    }

    fn send_control(&self, control: ControlMessage) -> Result<(), TransportError> {
        debug!("{}: sending control message: {:?}", self.label(), control);
        self.dc.send(ChannelFrame::Control(control).into_frame())
    }

    /// Opens a new cycle, returning its lease.
    fn begin_cycle(self: &Arc<Self>, inner: &mut ChannelInner) -> Result<VirtualChannel, PoolError> {
        inner.transition(self.label(), ChannelState::Open)?;
        Ok(VirtualChannel {
            channel: self.clone(),
            cycle: inner.cycle.clone(),
        })
    }

    /// Opens the channel from this side.
    fn open(self: &Arc<Self>) -> Result<VirtualChannel, PoolError> {
        let mut inner = self.lock();
        let lease = self.begin_cycle(&mut inner)?;
        // there is no open acknowledgement
        self.send_control(ControlMessage::Open)?;
        Ok(lease)
    }

    fn on_open(self: &Arc<Self>) {
        if let Owner::Local(_) = self.owner {
            warn!("{}: peer tried to open a locally opened channel", self.label());
            return;
        }
        let mut inner = self.lock();
        match inner.state {
            ChannelState::Closed => {
                drop(inner);
                self.do_open();
            }
            ChannelState::Closing => {
                debug!("{}: OPEN while closing, deferred", self.label());
                inner.reopen_pending = true;
            }
            ChannelState::Open => warn!("{}: redundant open message", self.label()),
            ChannelState::PermanentlyClosed => {
                warn!("{}: open message on permanently closed channel", self.label())
            }
        }
    }

    /// Opens the channel on the peer's request.
    fn do_open(self: &Arc<Self>) {
        let lease = match self.begin_cycle(&mut self.lock()) {
            Ok(lease) => lease,
            Err(err) => {
                warn!("{}", err);
                return;
            }
        };
        if let Owner::Remote(pool) = &self.owner {
            if let Some(pool) = pool.upgrade() {
                let _ = pool.peer_opened_channels.handle(Arc::new(lease));
            }
        }
    }

    fn on_close(self: &Arc<Self>) {
        let mut inner = self.lock();
        match inner.state {
            ChannelState::Open => {
                // OPEN and data of the next cycle wait until this one is over
                self.dc.data_from_peer().stop_handling();
                if let Err(err) = inner.transition(self.label(), ChannelState::Closing) {
                    warn!("{}", err);
                    return;
                }
                let last = inner.last_handled.take();
                drop(inner);
                match last {
                    None => self.finish_drain(),
                    Some(mut last) => {
                        if (&mut last).now_or_never().is_some() {
                            self.finish_drain();
                        } else {
                            debug!("{}: draining before close", self.label());
                            let channel = self.clone();
                            let closed = self.dc.closed();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = last => channel.finish_drain(),
                                    _ = closed.cancelled() => {}
                                }
                            });
                        }
                    }
                }
            }
            ChannelState::Closing => {
                // acknowledgement, or both sides closed at once
                self.dc.data_from_peer().stop_handling();
                drop(inner);
                self.do_close();
            }
            ChannelState::Closed => warn!("{}: redundant close message", self.label()),
            ChannelState::PermanentlyClosed => {
                warn!("{}: close message on permanently closed channel", self.label())
            }
        }
    }

    /// Acknowledges the peer's close once its data has been consumed.
    fn finish_drain(self: &Arc<Self>) {
        {
            let inner = self.lock();
            if inner.state == ChannelState::PermanentlyClosed {
                warn!("{}: underlying channel closed while draining", self.label());
                return;
            }
            if let Err(err) = self.send_control(ControlMessage::Close) {
                warn!("{}: {}", self.label(), err);
            }
        }
        self.do_close();
    }

    fn do_close(self: &Arc<Self>) {
        let (old, reopen) = {
            let mut inner = self.lock();
            if let Err(err) = inner.transition(self.label(), ChannelState::Closed) {
                warn!("{}", err);
                return;
            }
            let next = Cycle::new(inner.cycle.id + 1);
            inner.last_handled = None;
            (
                std::mem::replace(&mut inner.cycle, next),
                std::mem::take(&mut inner.reopen_pending),
            )
        };
        self.dc.set_overflow_listener(None);
        old.closed.cancel();
        if reopen {
            debug!("{}: reopening after close", self.label());
            self.do_open();
        }
        self.listen();
        if !reopen {
            if let Owner::Local(pool) = &self.owner {
                if let Some(pool) = pool.upgrade() {
                    pool.give_back(self);
                }
            }
        }
    }

    fn on_underlying_closed(self: &Arc<Self>) {
        let old = {
            let mut inner = self.lock();
            if inner.transition(self.label(), ChannelState::PermanentlyClosed).is_err() {
                return;
            }
            inner.last_handled = None;
            inner.cycle.clone()
        };
        info!("{}: underlying channel closed", self.label());
        self.dc.data_from_peer().stop_handling();
        self.dc.set_overflow_listener(None);
        old.closed.cancel();
        match &self.owner {
            Owner::Local(pool) => {
                if let Some(pool) = pool.upgrade() {
                    pool.forget(self.label());
                }
            }
            Owner::Remote(pool) => {
                if let Some(pool) = pool.upgrade() {
                    pool.forget(self.label());
                }
            }
        }
    }

    fn is_current(&self, inner: &ChannelInner, cycle: &Cycle) -> bool {
        inner.cycle.id == cycle.id && inner.state != ChannelState::PermanentlyClosed
    }

    fn send_in(&self, cycle: &Cycle, frame: Frame) -> Result<(), TransportError> {
        let inner = self.lock();
        if !self.is_current(&inner, cycle) || inner.state != ChannelState::Open {
            return Err(TransportError::channel_closed(self.label()));
        }
        // sent under the lock so a concurrent close cannot overtake it
        self.dc.send(ChannelFrame::from(frame).into_frame())
    }

    fn close_in(&self, cycle: &Cycle) {
        let mut inner = self.lock();
        if !self.is_current(&inner, cycle) {
            return;
        }
        if inner.state == ChannelState::Open {
            if let Err(err) = inner.transition(self.label(), ChannelState::Closing) {
                warn!("{}", err);
                return;
            }
            if let Err(err) = self.send_control(ControlMessage::Close) {
                warn!("{}: {}", self.label(), err);
            }
        } else {
            drop(inner);
            // the consumer is gone, nothing left to drain
            cycle.data_from_peer.clear();
        }
    }

    fn set_overflow_listener_in(&self, cycle: &Cycle, listener: Option<OverflowListener>) {
        let inner = self.lock();
        if self.is_current(&inner, cycle) {
            self.dc.set_overflow_listener(listener);
        }
    }
}

/// Lease on one open/close cycle of a pooled channel.
pub struct VirtualChannel {
    channel: Arc<PoolChannel>,
    cycle: Arc<Cycle>,
}

impl DataChannel for VirtualChannel {
    fn label(&self) -> &str {
        self.channel.label()
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.channel.send_in(&self.cycle, frame)
    }

    fn data_from_peer(&self) -> &HandlerQueue<Frame> {
        &self.cycle.data_from_peer
    }

    /// Starts the close handshake. The lease reports closed once the peer
    /// acknowledges.
    fn close(&self) {
        self.channel.close_in(&self.cycle)
    }

    fn closed(&self) -> CancellationToken {
        self.cycle.closed.clone()
    }

    fn is_in_overflow(&self) -> bool {
        self.channel.dc.is_in_overflow()
    }

    fn set_overflow_listener(&self, listener: Option<OverflowListener>) {
        self.channel.set_overflow_listener_in(&self.cycle, listener)
    }
}

struct LocalState {
    next_channel_id: u64,
    channels: HashMap<String, Arc<PoolChannel>>,
    /// closed channels ready to be opened again
    reusable: VecDeque<Arc<PoolChannel>>,
}

/// Channels opened by this peer.
struct LocalPool {
    transport: Arc<dyn Transport>,
    name: String,
    state: Mutex<LocalState>,
}

impl LocalPool {
    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_data_channel(self: &Arc<Self>) -> Result<Arc<dyn DataChannel>, PoolError> {
        loop {
            let reused = self.lock().reusable.pop_front();
            let Some(channel) = reused else {
                break;
            };
            match channel.open() {
                Ok(lease) => {
                    let (idle, total) = {
                        let state = self.lock();
                        (state.reusable.len(), state.channels.len())
                    };
                    debug!(
                        "{}: re-using channel {} ({}/{})",
                        self.name,
                        channel.label(),
                        idle,
                        total
                    );
                    return Ok(Arc::new(lease));
                }
                Err(err) => warn!("{}: {}", self.name, err),
            }
        }

        let id = {
            let mut state = self.lock();
            state.next_channel_id += 1;
            state.next_channel_id
        };
        let label = format!("p{}", id);
        info!("{}: opening channel {}", self.name, label);
        let dc = match self.transport.open_data_channel(&label).await {
            Ok(dc) => dc,
            Err(err) => {
                let mut state = self.lock();
                // unless a later open already took the next id
                if state.next_channel_id == id {
                    state.next_channel_id -= 1;
                }
                return Err(err.into());
            }
        };
        let channel = PoolChannel::new(dc, Owner::Local(Arc::downgrade(self)));
        self.lock().channels.insert(label, channel.clone());
        Ok(Arc::new(channel.open()?))
    }

    fn give_back(&self, channel: &Arc<PoolChannel>) {
        let mut state = self.lock();
        if !state.channels.contains_key(channel.label()) {
            return;
        }
        state.reusable.push_back(channel.clone());
        debug!(
            "{}: returned channel {} to the pool ({}/{})",
            self.name,
            channel.label(),
            state.reusable.len(),
            state.channels.len()
        );
    }

    fn forget(&self, label: &str) {
        let mut state = self.lock();
        state.channels.remove(label);
        state.reusable.retain(|channel| channel.label() != label);
    }
}

/// Channels opened by the peer.
struct RemotePool {
    name: String,
    channels: Mutex<HashMap<String, Arc<PoolChannel>>>,
    peer_opened_channels: HandlerQueue<Arc<dyn DataChannel>>,
}

impl RemotePool {
    fn new(transport: &dyn Transport, name: &str) -> Arc<Self> {
        let pool = Arc::new(Self {
            name: name.to_owned(),
            channels: Mutex::new(HashMap::new()),
            peer_opened_channels: HandlerQueue::new(),
        });
        let weak = Arc::downgrade(&pool);
        transport.peer_opened_channels().set_sync_handler(move |dc| {
            if let Some(pool) = weak.upgrade() {
                pool.on_new_channel(dc);
            }
        });
        pool
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<PoolChannel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_new_channel(self: &Arc<Self>, dc: Arc<dyn DataChannel>) {
        debug!("{}: remote side created new channel: {}", self.name, dc.label());
        let label = dc.label().to_owned();
        let channel = PoolChannel::new(dc, Owner::Remote(Arc::downgrade(self)));
        self.lock().insert(label, channel);
    }

    fn forget(&self, label: &str) {
        self.lock().remove(label);
    }
}

/// Virtual channels over one transport, opened by either peer.
///
/// Both peers draw data channel ids from disjoint ranges, so the local and
/// the remote half never share an underlying channel.
pub struct Pool {
    local: Arc<LocalPool>,
    remote: Arc<RemotePool>,
}

impl Pool {
    pub fn new(transport: Arc<dyn Transport>, name: &str) -> Self {
        let remote = RemotePool::new(transport.as_ref(), name);
        let local = Arc::new(LocalPool {
            transport,
            name: name.to_owned(),
            state: Mutex::new(LocalState {
                next_channel_id: 0,
                channels: HashMap::new(),
                reusable: VecDeque::new(),
            }),
        });
        Self { local, remote }
    }

    /// Opens a virtual channel, reusing a closed one when available.
    pub async fn open_data_channel(&self) -> Result<Arc<dyn DataChannel>, PoolError> {
        self.local.open_data_channel().await
    }

    /// Virtual channels opened by the peer.
    pub fn peer_opened_channels(&self) -> &HandlerQueue<Arc<dyn DataChannel>> {
        &self.remote.peer_opened_channels
    }

    /// Number of underlying channels opened by this side, idle or not.
    pub fn local_channel_count(&self) -> usize {
        self.local.lock().channels.len()
    }

    pub fn idle_channel_count(&self) -> usize {
        self.local.lock().reusable.len()
    }
}

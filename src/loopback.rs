//! In-process [`Transport`] joining two peers through memory.
//!
//! Each side allocates channel ids from its own parity (odd for the first
//! side, even for the second) so channels opened concurrently by both peers
//! never share an id. A channel reports overflow while more than the high
//! watermark of sent bytes are still waiting to be handled by the peer, and
//! clears it once the backlog falls to the low watermark. Frames are
//! delivered asynchronously, never from within [`DataChannel::send`].
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;
use log::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::handler_queue::HandlerQueue;
use crate::transport::*;

pub const DEFAULT_HIGH_WATERMARK: usize = 256 * 1024;
pub const DEFAULT_LOW_WATERMARK: usize = 64 * 1024;

struct Link {
    peer_opened: [HandlerQueue<Arc<dyn DataChannel>>; 2],
    next_ids: [AtomicU64; 2],
    closed: CancellationToken,
    high_watermark: usize,
    low_watermark: usize,
}

/// One side of an in-memory peer connection.
pub struct LoopbackTransport {
    link: Arc<Link>,
    side: usize,
}

/// Returns two connected transports.
pub fn pair() -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
    pair_with_watermarks(DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)
}

pub fn pair_with_watermarks(
    high_watermark: usize,
    low_watermark: usize,
) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
    let link = Arc::new(Link {
        peer_opened: [HandlerQueue::new(), HandlerQueue::new()],
        next_ids: [AtomicU64::new(1), AtomicU64::new(2)],
        closed: CancellationToken::new(),
        high_watermark,
        low_watermark: low_watermark.min(high_watermark),
    });
    (
        Arc::new(LoopbackTransport {
            link: link.clone(),
            side: 0,
        }),
        Arc::new(LoopbackTransport { link, side: 1 }),
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        if self.link.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let id = self.link.next_ids[self.side].fetch_add(2, Ordering::SeqCst);
        let closed = self.link.closed.child_token();
        let queues: [HandlerQueue<Frame>; 2] = [HandlerQueue::new(), HandlerQueue::new()];
        let make_end = |end: usize| {
            let (outbox, rx) = mpsc::unbounded_channel();
            let flow = Arc::new(Flow {
                label: label.to_owned(),
                buffered: AtomicUsize::new(0),
                in_overflow: AtomicBool::new(false),
                listener: Mutex::new(None),
                high_watermark: self.link.high_watermark,
                low_watermark: self.link.low_watermark,
            });
            tokio::spawn(forward(
                rx,
                queues[1 - end].clone(),
                flow.clone(),
                closed.clone(),
            ));
            End {
                data_from_peer: queues[end].clone(),
                outbox,
                flow,
            }
        };
        let pipe = Arc::new(Pipe {
            label: label.to_owned(),
            id,
            ends: [make_end(0), make_end(1)],
            closed: closed.clone(),
        });
        debug!("loopback: open channel {} (id {})", label, id);
        let local = LoopbackChannel {
            pipe: pipe.clone(),
            end: self.side,
        };
        let remote = LoopbackChannel {
            pipe,
            end: 1 - self.side,
        };
        // the peer learns about the channel whether or not it is listening yet
        let _ = self.link.peer_opened[1 - self.side].handle(Arc::new(remote));
        Ok(Arc::new(local))
    }

    fn peer_opened_channels(&self) -> &HandlerQueue<Arc<dyn DataChannel>> {
        &self.link.peer_opened[self.side]
    }

    async fn once_connected(&self) -> Result<(), TransportError> {
        if self.link.closed.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn close(&self) {
        self.link.closed.cancel();
    }

    fn closed(&self) -> CancellationToken {
        self.link.closed.clone()
    }
}

/// Send-side accounting of one direction of a channel.
struct Flow {
    label: String,
    /// bytes sent but not yet handled by the peer
    buffered: AtomicUsize,
    in_overflow: AtomicBool,
    listener: Mutex<Option<OverflowListener>>,
    high_watermark: usize,
    low_watermark: usize,
}

impl Flow {
    fn notify(&self, overflow: bool) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(overflow);
        }
    }

    fn grow(&self, len: usize) {
        let buffered = self.buffered.fetch_add(len, Ordering::SeqCst) + len;
        if buffered > self.high_watermark && !self.in_overflow.swap(true, Ordering::SeqCst) {
            trace!("loopback: {} overflow ({} bytes)", self.label, buffered);
            self.notify(true);
        }
    }

    fn shrink(&self, len: usize) {
        let buffered = self.buffered.fetch_sub(len, Ordering::SeqCst) - len;
        if buffered <= self.low_watermark && self.in_overflow.swap(false, Ordering::SeqCst) {
            trace!("loopback: {} drained ({} bytes)", self.label, buffered);
            self.notify(false);
        }
    }
}

/// Delivers frames to the peer's queue on a task of its own, so a send
/// never runs the peer's handlers.
async fn forward(
    mut rx: mpsc::UnboundedReceiver<Frame>,
    target: HandlerQueue<Frame>,
    flow: Arc<Flow>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = closed.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        let len = frame.len();
        let mut handled = target.handle(frame);
        if (&mut handled).now_or_never().is_some() {
            flow.shrink(len);
        } else {
            let flow = flow.clone();
            tokio::spawn(async move {
                // cleared or dropped frames count as handled
                let _ = handled.await;
                flow.shrink(len);
            });
        }
    }
}

struct End {
    /// frames received by this end
    data_from_peer: HandlerQueue<Frame>,
    outbox: mpsc::UnboundedSender<Frame>,
    flow: Arc<Flow>,
}

struct Pipe {
    label: String,
    id: u64,
    ends: [End; 2],
    closed: CancellationToken,
}

/// A data channel of a [`LoopbackTransport`].
pub struct LoopbackChannel {
    pipe: Arc<Pipe>,
    end: usize,
}

impl LoopbackChannel {
    pub fn id(&self) -> u64 {
        self.pipe.id
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.pipe.label
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.pipe.closed.is_cancelled() {
            return Err(TransportError::channel_closed(&self.pipe.label));
        }
        let this = &self.pipe.ends[self.end];
        this.flow.grow(frame.len());
        this.outbox
            .send(frame)
            .map_err(|_| TransportError::channel_closed(&self.pipe.label))
    }

    fn data_from_peer(&self) -> &HandlerQueue<Frame> {
        &self.pipe.ends[self.end].data_from_peer
    }

    fn close(&self) {
        if !self.pipe.closed.is_cancelled() {
            debug!("loopback: close channel {}", self.pipe.label);
            self.pipe.closed.cancel();
        }
    }

    fn closed(&self) -> CancellationToken {
        self.pipe.closed.clone()
    }

    fn is_in_overflow(&self) -> bool {
        self.pipe.ends[self.end]
            .flow
            .in_overflow
            .load(Ordering::SeqCst)
    }

    fn set_overflow_listener(&self, listener: Option<OverflowListener>) {
        *self.pipe.ends[self.end]
            .flow
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = listener;
    }
}

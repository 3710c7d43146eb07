//! Ordered hand-off between producers of events and a single consumer.
//!
//! A [`HandlerQueue`] buffers items until a handler is installed and then feeds
//! them to that handler one at a time, in arrival order. Every item given to
//! [`HandlerQueue::handle`] yields a [`Handled`] future resolving to the
//! handler's result, or to a [`QueueError`] when the item is discarded.
//!
//! Dispatch is cooperative: the synchronous part of a handler runs inside the
//! call that dispatched it, and a handler future that does not complete on
//! its first poll is finished on the tokio runtime.
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("cancelled by a call to set_handler")]
    Cancelled,
    #[error("cleared by handler queue")]
    Cleared,
    #[error("handler queue dropped")]
    Dropped,
}

/// Increment-only counters describing how a queue has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HandlerQueueStats {
    pub total_events: u64,
    pub queued_events: u64,
    /// handed straight to an installed handler
    pub immediately_handled_events: u64,
    /// handled after waiting in the queue
    pub queued_handled_events: u64,
    pub rejected_events: u64,
    pub handler_set_count: u64,
    pub handler_change_count: u64,
    pub handler_clear_count: u64,
    pub handler_rejections: u64,
}

type Reply<R> = oneshot::Sender<Result<R, QueueError>>;

enum Handler<T, R> {
    Every(Box<dyn FnMut(T) -> BoxFuture<'static, R> + Send>),
    Next(Box<dyn FnOnce(T) -> BoxFuture<'static, R> + Send>, Reply<R>),
}

struct Pending<T, R> {
    item: T,
    reply: Reply<R>,
    immediate: bool,
}

struct Inner<T, R> {
    queue: VecDeque<Pending<T, R>>,
    handler: Option<Handler<T, R>>,
    /// bumped whenever the handler slot is replaced or cleared
    generation: u64,
    /// an `Every` handler is out of its slot running an item
    lent: bool,
    dispatching: bool,
    stats: HandlerQueueStats,
}

impl<T, R> Inner<T, R> {
    fn cancel_next(&mut self) {
        if let Some(Handler::Next(..)) = self.handler {
            if let Some(Handler::Next(_, reply)) = self.handler.take() {
                self.stats.handler_rejections += 1;
                reply.send(Err(QueueError::Cancelled)).ok();
            }
        }
    }

    fn has_handler(&self) -> bool {
        self.handler.is_some() || self.lent
    }
}

/// FIFO queue of events with one replaceable consumer.
///
/// Cloning a `HandlerQueue` yields another handle to the same queue.
pub struct HandlerQueue<T, R = ()> {
    inner: Arc<Mutex<Inner<T, R>>>,
}

impl<T, R> Clone for HandlerQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, R> Default for HandlerQueue<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> fmt::Debug for HandlerQueue<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("HandlerQueue")
            .field("len", &inner.queue.len())
            .field("handling", &inner.has_handler())
            .finish()
    }
}

impl<T, R> HandlerQueue<T, R> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                handler: None,
                generation: 0,
                lent: false,
                dispatching: false,
                stats: HandlerQueueStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T, R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of items waiting for a handler.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn is_handling(&self) -> bool {
        self.lock().has_handler()
    }

    pub fn stats(&self) -> HandlerQueueStats {
        self.lock().stats
    }

    /// Pauses handling. Queued items stay queued and a pending next-item
    /// subscription is cancelled.
    pub fn stop_handling(&self) {
        let mut inner = self.lock();
        inner.cancel_next();
        if inner.has_handler() {
            inner.handler = None;
            inner.stats.handler_clear_count += 1;
        }
        inner.lent = false;
        inner.generation += 1;
    }

    /// Drops every queued item, failing its future with [`QueueError::Cleared`].
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.stats.rejected_events += inner.queue.len() as u64;
            inner.queue.drain(..).collect()
        };
        for pending in drained {
            pending.reply.send(Err(QueueError::Cleared)).ok();
        }
    }

    /// Removes a next-item subscription installed at `generation` if it has
    /// not fired yet.
    fn withdraw(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation {
            if let Some(Handler::Next(..)) = inner.handler {
                inner.handler = None;
                inner.generation += 1;
                inner.stats.handler_clear_count += 1;
            }
        }
    }
}

impl<T, R> HandlerQueue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Hands `item` to the current handler, or queues it until one is set.
    pub fn handle(&self, item: T) -> Handled<R> {
        let (reply, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            inner.stats.total_events += 1;
            let immediate = inner.handler.is_some() && inner.queue.is_empty() && !inner.dispatching;
            if immediate {
                inner.stats.immediately_handled_events += 1;
            } else {
                inner.stats.queued_events += 1;
            }
            inner.queue.push_back(Pending {
                item,
                reply,
                immediate,
            });
        }
        self.process();
        Handled { rx }
    }

    pub fn set_handler<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.install(Handler::Every(Box::new(move |item| handler(item).boxed())));
    }

    pub fn set_sync_handler<F>(&self, mut handler: F)
    where
        F: FnMut(T) -> R + Send + 'static,
    {
        self.install(Handler::Every(Box::new(move |item| {
            future::ready(handler(item)).boxed()
        })));
    }

    /// Handles exactly one item with `handler`, then stops handling.
    ///
    /// The returned future resolves with the handler's result, or with
    /// [`QueueError::Cancelled`] if another handler is installed first.
    pub fn set_next_handler<F, Fut>(&self, handler: F) -> Handled<R>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.install_next(handler).0
    }

    pub fn set_sync_next_handler<F>(&self, handler: F) -> Handled<R>
    where
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.set_next_handler(move |item| future::ready(handler(item)))
    }

    fn install_next<F, Fut>(&self, handler: F) -> (Handled<R>, u64)
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let generation = self.install(Handler::Next(
            Box::new(move |item| handler(item).boxed()),
            reply,
        ));
        (Handled { rx }, generation)
    }

    fn install(&self, handler: Handler<T, R>) -> u64 {
        let generation = {
            let mut inner = self.lock();
            inner.cancel_next();
            if inner.has_handler() {
                inner.stats.handler_change_count += 1;
            } else {
                inner.stats.handler_set_count += 1;
            }
            inner.lent = false;
            inner.generation += 1;
            inner.handler = Some(handler);
            inner.generation
        };
        self.process();
        generation
    }

    fn process(&self) {
        loop {
            let (handler, pending, generation) = {
                let mut inner = self.lock();
                if inner.dispatching || inner.handler.is_none() || inner.queue.is_empty() {
                    return;
                }
                let (Some(handler), Some(pending)) = (inner.handler.take(), inner.queue.pop_front())
                else {
                    return;
                };
                if !pending.immediate {
                    inner.stats.queued_handled_events += 1;
                }
                match handler {
                    Handler::Every(_) => inner.lent = true,
                    Handler::Next(..) => {
                        inner.generation += 1;
                        inner.stats.handler_clear_count += 1;
                    }
                }
                inner.dispatching = true;
                (handler, pending, inner.generation)
            };

            let Pending { item, reply, .. } = pending;
            match handler {
                Handler::Every(mut f) => {
                    let fut = f(item);
                    {
                        let mut inner = self.lock();
                        inner.dispatching = false;
                        // the handler may have been replaced or stopped while it ran
                        if inner.generation == generation && inner.lent {
                            inner.lent = false;
                            inner.handler = Some(Handler::Every(f));
                        }
                    }
                    settle(fut, reply, None);
                }
                Handler::Next(f, next_reply) => {
                    let fut = f(item);
                    self.lock().dispatching = false;
                    settle(fut, reply, Some(next_reply));
                }
            }
        }
    }
}

impl<T, R> HandlerQueue<T, R>
where
    T: Send + 'static,
    R: Clone + Default + Send + 'static,
{
    /// Takes the next item out of the queue, waiting for one if needed.
    ///
    /// Dropping the returned future before it resolves withdraws the
    /// subscription, so no item is lost.
    pub fn next_item(&self) -> NextItem<T, R> {
        let (tx, rx) = oneshot::channel();
        let (_, generation) = self.install_next(move |item| {
            tx.send(item).ok();
            future::ready(R::default())
        });
        NextItem {
            rx,
            queue: self.clone(),
            generation,
            done: false,
        }
    }
}

fn settle<R>(mut fut: BoxFuture<'static, R>, reply: Reply<R>, next: Option<Reply<R>>)
where
    R: Clone + Send + 'static,
{
    match (&mut fut).now_or_never() {
        Some(result) => deliver(result, reply, next),
        None => {
            tokio::spawn(async move {
                let result = fut.await;
                deliver(result, reply, next);
            });
        }
    }
}

fn deliver<R: Clone>(result: R, reply: Reply<R>, next: Option<Reply<R>>) {
    if let Some(next) = next {
        next.send(Ok(result.clone())).ok();
    }
    reply.send(Ok(result)).ok();
}

/// Result of handling one item.
#[derive(Debug)]
pub struct Handled<R> {
    rx: oneshot::Receiver<Result<R, QueueError>>,
}

impl<R> Future for Handled<R> {
    type Output = Result<R, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(QueueError::Dropped)))
    }
}

/// Future of [`HandlerQueue::next_item`].
pub struct NextItem<T, R> {
    rx: oneshot::Receiver<T>,
    queue: HandlerQueue<T, R>,
    generation: u64,
    done: bool,
}

impl<T, R> Future for NextItem<T, R> {
    type Output = Result<T, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(res) => {
                this.done = true;
                Poll::Ready(res.map_err(|_| QueueError::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, R> Drop for NextItem<T, R> {
    fn drop(&mut self) {
        if !self.done {
            self.queue.withdraw(self.generation);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn queued_items_are_handled_in_order() {
        let queue: HandlerQueue<u32, u32> = HandlerQueue::new();
        let first = queue.handle(1);
        let second = queue.handle(2);
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_handling());

        let seen = Arc::new(Mutex::new(vec![]));
        let seen_ = seen.clone();
        queue.set_sync_handler(move |x| {
            seen_.lock().unwrap().push(x);
            x * 10
        });
        assert_eq!(first.await, Ok(10));
        assert_eq!(second.await, Ok(20));
        assert_eq!(queue.handle(3).await, Ok(30));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

        let stats = queue.stats();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.queued_events, 2);
        assert_eq!(stats.queued_handled_events, 2);
        assert_eq!(stats.immediately_handled_events, 1);
        assert_eq!(stats.handler_set_count, 1);
    }

    #[tokio::test]
    async fn async_handler_result() {
        let queue: HandlerQueue<u32, u32> = HandlerQueue::new();
        queue.set_handler(|x| async move {
            tokio::task::yield_now().await;
            x + 1
        });
        assert_eq!(queue.handle(41).await, Ok(42));
    }

    #[tokio::test]
    async fn stop_handling_keeps_items() {
        let queue: HandlerQueue<u32> = HandlerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_ = count.clone();
        queue.set_sync_handler(move |_| {
            count_.fetch_add(1, Ordering::SeqCst);
        });
        queue.handle(1);
        queue.stop_handling();
        queue.handle(2);
        queue.handle(3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().handler_clear_count, 1);
    }

    #[tokio::test]
    async fn clear_rejects_queued_items() {
        let queue: HandlerQueue<u32> = HandlerQueue::new();
        let pending = queue.handle(1);
        queue.clear();
        assert_eq!(pending.await, Err(QueueError::Cleared));
        assert!(queue.is_empty());
        assert_eq!(queue.stats().rejected_events, 1);
    }

    #[tokio::test]
    async fn set_handler_cancels_next_handler() {
        let queue: HandlerQueue<u32, u32> = HandlerQueue::new();
        let next = queue.set_sync_next_handler(|x| x);
        queue.set_sync_handler(|x| x * 2);
        assert_eq!(next.await, Err(QueueError::Cancelled));
        assert_eq!(queue.handle(2).await, Ok(4));
        assert_eq!(queue.stats().handler_rejections, 1);
    }

    #[tokio::test]
    async fn next_handler_handles_one_item() {
        let queue: HandlerQueue<u32, u32> = HandlerQueue::new();
        let next = queue.set_sync_next_handler(|x| x + 100);
        let first = queue.handle(1);
        let second = queue.handle(2);
        assert_eq!(next.await, Ok(101));
        assert_eq!(first.await, Ok(101));
        assert!(!queue.is_handling());
        assert_eq!(queue.len(), 1);
        queue.set_sync_handler(|x| x);
        assert_eq!(second.await, Ok(2));
    }

    #[tokio::test]
    async fn next_item_takes_queued_item() {
        let queue: HandlerQueue<&'static str> = HandlerQueue::new();
        queue.handle("a");
        queue.handle("b");
        assert_eq!(queue.next_item().await, Ok("a"));
        assert_eq!(queue.next_item().await, Ok("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dropped_next_item_loses_nothing() {
        let queue: HandlerQueue<u32> = HandlerQueue::new();
        drop(queue.next_item());
        assert!(!queue.is_handling());
        queue.handle(7);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_item().await, Ok(7));
    }

    #[tokio::test]
    async fn handler_may_stop_itself() {
        let queue: HandlerQueue<u32> = HandlerQueue::new();
        let handled = Arc::new(AtomicUsize::new(0));
        let (queue_, handled_) = (queue.clone(), handled.clone());
        queue.set_sync_handler(move |x| {
            handled_.fetch_add(1, Ordering::SeqCst);
            if x == 2 {
                queue_.stop_handling();
            }
        });
        for x in 1..=4 {
            queue.handle(x);
        }
        assert_eq!(handled.load(Ordering::SeqCst), 2);
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_handling());
    }
}

//! Multicast broadcast with replay of the last value.
//!
//! Every subscriber gets its own unbounded queue, so no value is ever
//! dropped for a slow subscriber, and a late subscriber first receives the
//! most recent value before anything newer.

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

enum Signal<T> {
    Value(T),
    Fault(Error),
    Closed(Option<Error>),
}

struct Inner<T> {
    latest: Option<T>,
    subscribers: Vec<mpsc::UnboundedSender<Signal<T>>>,
    closed: Option<Option<Error>>,
}

/// Sender side of a replaying multicast channel.
pub struct ReplayBroadcast<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for ReplayBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for ReplayBroadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> ReplayBroadcast<T> {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::seeded(None)
    }

    /// Create a channel that already holds `latest`.
    pub fn seeded(latest: Option<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                latest,
                subscribers: Vec::new(),
                closed: None,
            })),
        }
    }

    /// Publish a value to every subscriber and remember it.
    ///
    /// Returns the number of subscribers reached. Publishing to a closed
    /// channel is a no-op.
    pub fn publish(&self, value: T) -> usize {
        let mut inner = self.inner.lock();
        if inner.closed.is_some() {
            return 0;
        }
        inner
            .subscribers
            .retain(|tx| tx.send(Signal::Value(value.clone())).is_ok());
        inner.latest = Some(value);
        inner.subscribers.len()
    }

    /// Publish `value` only if nothing has been observed yet.
    pub fn publish_if_empty(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed.is_some() || inner.latest.is_some() {
            return false;
        }
        inner
            .subscribers
            .retain(|tx| tx.send(Signal::Value(value.clone())).is_ok());
        inner.latest = Some(value);
        true
    }

    /// Deliver a non-terminal error to every subscriber. The last value is
    /// left untouched.
    pub fn publish_error(&self, error: Error) {
        let mut inner = self.inner.lock();
        if inner.closed.is_some() {
            return;
        }
        inner
            .subscribers
            .retain(|tx| tx.send(Signal::Fault(error.clone())).is_ok());
    }

    /// Close the channel. Subscribers drain what they already have, then
    /// receive `error` (if any) and end.
    pub fn close(&self, error: Option<Error>) {
        let mut inner = self.inner.lock();
        if inner.closed.is_some() {
            return;
        }
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(Signal::Closed(error.clone()));
        }
        inner.closed = Some(error);
    }

    /// Subscribe. The last value, if any, is the first item received.
    pub fn subscribe(&self) -> ReplayReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        if let Some(error) = &inner.closed {
            let _ = tx.send(Signal::Closed(error.clone()));
        } else {
            if let Some(latest) = &inner.latest {
                let _ = tx.send(Signal::Value(latest.clone()));
            }
            inner.subscribers.push(tx);
        }

        ReplayReceiver { rx, done: false }
    }

    /// The most recent value.
    pub fn latest(&self) -> Option<T> {
        self.inner.lock().latest.clone()
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

/// Receiver side of a [`ReplayBroadcast`].
///
/// Yields `Ok` values in publication order, `Err` for non-terminal faults,
/// and a final `Err` if the channel was closed with an error.
pub struct ReplayReceiver<T> {
    rx: mpsc::UnboundedReceiver<Signal<T>>,
    done: bool,
}

impl<T> ReplayReceiver<T> {
    /// Receive the next item; `None` once the channel has ended.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        futures::future::poll_fn(|cx| self.poll_item(cx)).await
    }

    fn poll_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<T>>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Signal::Value(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Signal::Fault(error))) => Poll::Ready(Some(Err(error))),
            Poll::Ready(Some(Signal::Closed(error))) => {
                self.done = true;
                self.rx.close();
                Poll::Ready(error.map(Err))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<T> Stream for ReplayReceiver<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_item(cx)
    }
}

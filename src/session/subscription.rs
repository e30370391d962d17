//! Ordered item stream with a terminal error slot.
//!
//! The producer half pushes items and, when done, closes the stream with an optional
//! error. The consumer reads until `next` yields `None`, then asks for the error.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use super::SessionError;

type ErrSlot = Arc<Mutex<Option<SessionError>>>;

/// Reading half: a single-reader, non-restartable sequence of `T`.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    err: ErrSlot,
}

/// Writing half, held by the session.
#[derive(Debug)]
pub struct SubscriptionSender<T> {
    tx: mpsc::Sender<T>,
    err: ErrSlot,
}

/// Create a subscription buffering at most `buffer` undelivered items.
pub fn channel<T>(buffer: usize) -> (SubscriptionSender<T>, Subscription<T>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let err = ErrSlot::default();
    (
        SubscriptionSender {
            tx,
            err: err.clone(),
        },
        Subscription { rx, err },
    )
}

impl<T> Subscription<T> {
    /// Next item, or `None` once the producer closed the stream.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Terminal error. Only meaningful after `next` returned `None`.
    pub fn take_err(&mut self) -> Option<SessionError> {
        self.err
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

// Manual impl: cloning the sender does not need `T: Clone`.
impl<T> Clone for SubscriptionSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            err: Arc::clone(&self.err),
        }
    }
}

impl<T> SubscriptionSender<T> {
    /// Deliver one item, waiting for buffer space. Returns `false` when the reader is gone.
    pub async fn send(&self, item: T) -> bool {
        self.tx.send(item).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// End the stream. The error, if any, is visible to the reader once it drains
    /// and every clone of this sender is gone.
    pub fn close(self, err: Option<SessionError>) {
        if let Some(err) = err {
            *self.err.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        }
        drop(self.tx);
    }
}

//! Single-fire completion channels.
//!
//! Every asynchronous operation hands back a [`Pending`] that resolves exactly
//! once with the result, or with `None` if the operation was dropped without
//! producing one (the "never" case).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Receiving half of a single-fire completion.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

/// Sending half. Consumed by [`Completer::complete`], so it fires at most once.
#[derive(Debug)]
pub(crate) struct Completer<T> {
    tx: oneshot::Sender<T>,
}

pub(crate) fn pending<T>() -> (Completer<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Pending { rx })
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, value: T) {
        // Receiver gone means the caller stopped listening.
        let _ = self.tx.send(value);
    }
}

impl<T> Pending<T> {
    /// An already-resolved completion.
    pub fn ready(value: T) -> Self {
        let (completer, pending) = pending();
        completer.complete(value);
        pending
    }

    /// Run `fut` on the runtime and resolve with its output.
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (completer, pending) = pending();
        tokio::spawn(async move {
            completer.complete(fut.await);
        });
        pending
    }
}

impl<T> Future for Pending<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

//! Callback races.
//!
//! Engines report results through callbacks: a request fires either its
//! success or its error callback, a transaction fires either "complete" or
//! "abort". [`Race`] turns such a set of callbacks into a single future: the
//! first [`Arm`] to fire wins, every later fire is ignored.
//!
//! [`Request`] and [`OutcomeSignal`] are the two races the rest of the crate
//! works with.

use crate::backend::BackendError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// The first arm to fire wins.
pub struct Race<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<T>>>>,
    receiver: oneshot::Receiver<T>,
}

/// One callback taking part in a [`Race`].
pub struct Arm<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceError {
    #[error("every arm was dropped before one fired")]
    Closed,
}

impl<T> Default for Race<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Race<T> {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    /// Register another callback.
    pub fn arm(&self) -> Arm<T> {
        Arm {
            sender: self.sender.clone(),
        }
    }

    /// Wait for the winner.
    pub async fn recv(self) -> Result<T, RaceError> {
        let Race { sender, receiver } = self;
        // Only the arms keep the channel open from here on
        drop(sender);
        receiver.await.map_err(|_| RaceError::Closed)
    }
}

impl<T> Arm<T> {
    /// Fire this arm. Returns `false` when another arm already won.
    pub fn fire(&self, value: T) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    /// Whether some arm of the race has fired.
    pub fn is_settled(&self) -> bool {
        match self.sender.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl<T> Clone for Arm<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Create a request and the responder an engine settles it with.
pub fn request<T: Send + 'static>() -> (Responder<T>, Request<T>) {
    let race = Race::new();
    let responder = Responder { arm: race.arm() };
    let Race { sender, receiver } = race;
    drop(sender);

    (
        responder,
        Request {
            receiver,
            keepalive: None,
        },
    )
}

/// Engine side of a [`Request`]: exactly one of `succeed` or `fail` takes
/// effect.
pub struct Responder<T> {
    arm: Arm<Result<T, BackendError>>,
}

impl<T> Clone for Responder<T> {
    fn clone(&self) -> Self {
        Self {
            arm: self.arm.clone(),
        }
    }
}

impl<T> Responder<T> {
    pub fn succeed(&self, value: T) -> bool {
        self.arm.fire(Ok(value))
    }

    pub fn fail(&self, error: BackendError) -> bool {
        self.arm.fire(Err(error))
    }

    pub fn settle(&self, result: Result<T, BackendError>) -> bool {
        self.arm.fire(result)
    }

    pub fn is_settled(&self) -> bool {
        self.arm.is_settled()
    }
}

/// A pending engine request.
///
/// Resolves with the engine's result. If the engine drops every responder
/// without settling, the request fails with an `AbortError`.
pub struct Request<T> {
    receiver: oneshot::Receiver<Result<T, BackendError>>,
    /// Engine resources that must outlive the pending request
    keepalive: Option<Box<dyn Any + Send>>,
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Request<T> {
    /// A request that has already settled.
    pub fn ready(result: Result<T, BackendError>) -> Self {
        let (responder, request) = request();
        responder.settle(result);
        request
    }

    /// Keep `resources` alive until this request is dropped.
    pub fn with_keepalive(mut self, resources: impl Any + Send) -> Self {
        self.keepalive = Some(Box::new(resources));
        self
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T, BackendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(BackendError::abort(
                    "request was dropped by the engine before it settled",
                ))
            })
        })
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    Aborted(BackendError),
}

/// Create a transaction outcome signal and the notifier that fires it.
pub fn outcome() -> (OutcomeNotifier, OutcomeSignal) {
    let race = Race::new();
    let notifier = OutcomeNotifier { arm: race.arm() };
    let signal = async move {
        race.recv().await.unwrap_or_else(|_| {
            TxOutcome::Aborted(BackendError::abort(
                "transaction was dropped before it completed",
            ))
        })
    }
    .boxed()
    .shared();

    (notifier, OutcomeSignal(signal))
}

/// Engine side of an [`OutcomeSignal`]. "Complete" and "abort" are mutually
/// exclusive: whichever fires first is the outcome.
#[derive(Clone)]
pub struct OutcomeNotifier {
    arm: Arm<TxOutcome>,
}

impl OutcomeNotifier {
    pub fn complete(&self) -> bool {
        self.arm.fire(TxOutcome::Committed)
    }

    pub fn abort(&self, error: BackendError) -> bool {
        self.arm.fire(TxOutcome::Aborted(error))
    }

    pub fn is_settled(&self) -> bool {
        self.arm.is_settled()
    }
}

/// Resolves once a transaction has committed or aborted. Cheap to clone;
/// every clone observes the same outcome.
#[derive(Clone)]
pub struct OutcomeSignal(Shared<BoxFuture<'static, TxOutcome>>);

impl OutcomeSignal {
    /// The outcome, if it is already known and has been polled.
    pub fn peek(&self) -> Option<TxOutcome> {
        self.0.peek().cloned()
    }
}

impl Future for OutcomeSignal {
    type Output = TxOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}

impl std::fmt::Debug for OutcomeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OutcomeSignal").field(&self.peek()).finish()
    }
}

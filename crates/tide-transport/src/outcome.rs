//! Delivery outcome vocabulary shared by both transports.
//!
//! Every send owns one [`DeliveryPromise`] / [`DeliveryFuture`] pair. The
//! promise is consumed by `resolve`, and dropping it unresolved resolves the
//! future to `Error` (transport shut down), so a future can neither resolve
//! twice nor hang forever.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::TideTransportError;

/// Classification of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryResult {
    /// Written to a connected stream.
    Success,
    Error,
    TimeOut,
    Unreachable,
    /// Left the host as a datagram; the network gives no confirmation.
    Uncertain,
    /// Still in flight. Only observable through [`DeliveryFuture::try_result`].
    UnFinished,
}

impl DeliveryResult {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryResult::UnFinished)
    }

    /// `Success` and `Uncertain` both mean the message left this host.
    pub fn is_success_class(self) -> bool {
        matches!(self, DeliveryResult::Success | DeliveryResult::Uncertain)
    }
}

/// Terminal result of a send plus its cause or note.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    result: DeliveryResult,
    cause: Option<Arc<anyhow::Error>>,
    note: Option<String>,
}

impl DeliveryOutcome {
    fn with(result: DeliveryResult, cause: Option<anyhow::Error>) -> Self {
        Self {
            result,
            cause: cause.map(Arc::new),
            note: None,
        }
    }

    pub fn success() -> Self {
        Self::with(DeliveryResult::Success, None)
    }

    pub fn uncertain(note: impl Into<String>) -> Self {
        Self {
            result: DeliveryResult::Uncertain,
            cause: None,
            note: Some(note.into()),
        }
    }

    pub fn error(cause: impl Into<anyhow::Error>) -> Self {
        Self::with(DeliveryResult::Error, Some(cause.into()))
    }

    pub fn time_out(cause: impl Into<anyhow::Error>) -> Self {
        Self::with(DeliveryResult::TimeOut, Some(cause.into()))
    }

    pub fn unreachable(cause: impl Into<anyhow::Error>) -> Self {
        Self::with(DeliveryResult::Unreachable, Some(cause.into()))
    }

    pub fn result(&self) -> DeliveryResult {
        self.result
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    pub fn is_success_class(&self) -> bool {
        self.result.is_success_class()
    }

    /// Invoke exactly one callback of `listener`, chosen by the result.
    pub fn notify(&self, listener: &dyn DeliveryListener) {
        match self.result {
            DeliveryResult::Success => listener.on_success(),
            DeliveryResult::Error => match self.cause() {
                Some(cause) => listener.on_error(cause),
                None => listener.on_error(&anyhow::anyhow!("delivery failed")),
            },
            DeliveryResult::TimeOut => listener.on_time_out(),
            DeliveryResult::Unreachable => listener.on_unreachable(),
            DeliveryResult::Uncertain => listener.on_uncertain(self.note().unwrap_or_default()),
            DeliveryResult::UnFinished => {
                listener.on_error(&anyhow::anyhow!("delivery unfinished"))
            }
        }
    }
}

impl From<TideTransportError> for DeliveryOutcome {
    fn from(err: TideTransportError) -> Self {
        match err {
            TideTransportError::ConnectTimeout { .. } => DeliveryOutcome::time_out(err),
            TideTransportError::Unreachable { .. } | TideTransportError::Resolve { .. } => {
                DeliveryOutcome::unreachable(err)
            }
            other => DeliveryOutcome::error(other),
        }
    }
}

/// Five-way callback view of a [`DeliveryOutcome`].
pub trait DeliveryListener: Send + Sync {
    fn on_success(&self);
    fn on_error(&self, cause: &anyhow::Error);
    fn on_time_out(&self);
    fn on_unreachable(&self);
    fn on_uncertain(&self, note: &str);
}

/// Create a linked promise/future pair for one send.
pub fn delivery_channel() -> (DeliveryPromise, DeliveryFuture) {
    let (tx, rx) = oneshot::channel();
    (
        DeliveryPromise { tx: Some(tx) },
        DeliveryFuture {
            state: FutureState::Pending(rx),
        },
    )
}

/// Write side of a delivery. Resolving consumes it.
#[derive(Debug)]
pub struct DeliveryPromise {
    tx: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl DeliveryPromise {
    pub fn resolve(mut self, outcome: DeliveryOutcome) {
        debug_assert!(outcome.result().is_terminal());
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for DeliveryPromise {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(DeliveryOutcome::error(TideTransportError::Shutdown));
        }
    }
}

#[derive(Debug)]
enum FutureState {
    Pending(oneshot::Receiver<DeliveryOutcome>),
    Ready(Option<DeliveryOutcome>),
}

/// Read side of a delivery; resolves to the terminal [`DeliveryOutcome`].
#[derive(Debug)]
pub struct DeliveryFuture {
    state: FutureState,
}

impl DeliveryFuture {
    /// A future that is already resolved.
    pub fn ready(outcome: DeliveryOutcome) -> Self {
        Self {
            state: FutureState::Ready(Some(outcome)),
        }
    }

    /// Peek without waiting. `UnFinished` while the send is in flight.
    pub fn try_result(&mut self) -> DeliveryResult {
        match &mut self.state {
            FutureState::Ready(Some(outcome)) => outcome.result(),
            FutureState::Ready(None) => DeliveryResult::UnFinished,
            FutureState::Pending(rx) => match rx.try_recv() {
                Ok(outcome) => {
                    let result = outcome.result();
                    self.state = FutureState::Ready(Some(outcome));
                    result
                }
                Err(oneshot::error::TryRecvError::Empty) => DeliveryResult::UnFinished,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.state = FutureState::Ready(Some(DeliveryOutcome::error(
                        TideTransportError::Shutdown,
                    )));
                    DeliveryResult::Error
                }
            },
        }
    }

    /// Wait for the outcome, then hand it to `f`.
    pub async fn then<F>(self, f: F) -> DeliveryOutcome
    where
        F: FnOnce(&DeliveryOutcome),
    {
        let outcome = self.await;
        f(&outcome);
        outcome
    }

    /// Wait for the outcome and fire the matching listener callback.
    pub async fn notify(self, listener: &dyn DeliveryListener) -> DeliveryOutcome {
        self.then(|outcome| outcome.notify(listener)).await
    }
}

impl Future for DeliveryFuture {
    type Output = DeliveryOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let polled = match &mut this.state {
            FutureState::Ready(outcome) => {
                return Poll::Ready(outcome.take().unwrap_or_else(|| {
                    DeliveryOutcome::error(anyhow::anyhow!(
                        "delivery future polled after completion"
                    ))
                }));
            }
            FutureState::Pending(rx) => Pin::new(rx).poll(cx),
        };
        match polled {
            Poll::Ready(received) => {
                this.state = FutureState::Ready(None);
                Poll::Ready(received.unwrap_or_else(|_| {
                    DeliveryOutcome::error(TideTransportError::Shutdown)
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
        fn push(&self, s: String) {
            self.0.lock().unwrap().push(s);
        }
    }

    impl DeliveryListener for Recorder {
        fn on_success(&self) {
            self.push("success".into());
        }
        fn on_error(&self, cause: &anyhow::Error) {
            self.push(format!("error: {cause}"));
        }
        fn on_time_out(&self) {
            self.push("timeout".into());
        }
        fn on_unreachable(&self) {
            self.push("unreachable".into());
        }
        fn on_uncertain(&self, note: &str) {
            self.push(format!("uncertain: {note}"));
        }
    }

    #[test]
    fn each_result_maps_to_one_callback() {
        let cases = [
            (DeliveryOutcome::success(), "success"),
            (DeliveryOutcome::error(anyhow::anyhow!("boom")), "error: boom"),
            (DeliveryOutcome::time_out(anyhow::anyhow!("slow")), "timeout"),
            (DeliveryOutcome::unreachable(anyhow::anyhow!("gone")), "unreachable"),
            (DeliveryOutcome::uncertain("datagram"), "uncertain: datagram"),
        ];
        for (outcome, expected) in cases {
            let rec = Recorder::default();
            outcome.notify(&rec);
            assert_eq!(rec.calls(), vec![expected.to_string()]);
        }
    }

    #[test]
    fn success_class() {
        assert!(DeliveryResult::Success.is_success_class());
        assert!(DeliveryResult::Uncertain.is_success_class());
        assert!(!DeliveryResult::Error.is_success_class());
        assert!(!DeliveryResult::TimeOut.is_success_class());
        assert!(!DeliveryResult::Unreachable.is_success_class());
        assert!(!DeliveryResult::UnFinished.is_success_class());
        assert!(!DeliveryResult::UnFinished.is_terminal());
    }

    #[test]
    fn transport_errors_classify() {
        let timeout: DeliveryOutcome = TideTransportError::ConnectTimeout {
            endpoint: crate::Endpoint::new("10.0.0.1", 1),
            millis: 10,
        }
        .into();
        assert_eq!(timeout.result(), DeliveryResult::TimeOut);

        let unreachable: DeliveryOutcome = TideTransportError::Unreachable {
            endpoint: crate::Endpoint::new("10.0.0.1", 1),
            source: std::io::ErrorKind::ConnectionRefused.into(),
        }
        .into();
        assert_eq!(unreachable.result(), DeliveryResult::Unreachable);

        let unresolved: DeliveryOutcome = TideTransportError::Resolve {
            endpoint: crate::Endpoint::new("no-such-host.invalid", 1),
        }
        .into();
        assert_eq!(unresolved.result(), DeliveryResult::Unreachable);
        assert!(unresolved.cause().is_some());

        let err: DeliveryOutcome = TideTransportError::NotRunning.into();
        assert_eq!(err.result(), DeliveryResult::Error);
        assert!(err.cause().is_some());
    }

    #[tokio::test]
    async fn pending_until_resolved() {
        let (promise, mut future) = delivery_channel();
        assert_eq!(future.try_result(), DeliveryResult::UnFinished);
        promise.resolve(DeliveryOutcome::success());
        assert_eq!(future.try_result(), DeliveryResult::Success);
        assert_eq!(future.await.result(), DeliveryResult::Success);
    }

    #[tokio::test]
    async fn dropped_promise_resolves_to_error() {
        let (promise, future) = delivery_channel();
        drop(promise);
        let outcome = future.await;
        assert_eq!(outcome.result(), DeliveryResult::Error);
        assert!(outcome
            .cause()
            .unwrap()
            .to_string()
            .contains("shut down"));
    }

    #[tokio::test]
    async fn notify_fires_exactly_once() {
        let (promise, future) = delivery_channel();
        let rec = Recorder::default();
        let waiter = async { future.notify(&rec).await };
        promise.resolve(DeliveryOutcome::uncertain("no ack"));
        let outcome = waiter.await;
        assert_eq!(outcome.result(), DeliveryResult::Uncertain);
        assert_eq!(rec.calls(), vec!["uncertain: no ack".to_string()]);
    }

    #[tokio::test]
    async fn then_composes() {
        let seen = Mutex::new(None);
        let outcome = DeliveryFuture::ready(DeliveryOutcome::success())
            .then(|o| *seen.lock().unwrap() = Some(o.result()))
            .await;
        assert_eq!(outcome.result(), DeliveryResult::Success);
        assert_eq!(*seen.lock().unwrap(), Some(DeliveryResult::Success));
    }
}

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{Endpoint, TransportKind};

/// One unit of inbound data as seen by the transport.
///
/// Listeners receive it alongside the decoded message, with `payload` set to
/// that message's exact frame bytes.
#[derive(Debug, Clone)]
pub struct ReceptionEvent {
    pub source: Endpoint,
    pub payload: Bytes,
    pub received_at_nanos: u64,
    pub is_end_of_stream: bool,
    pub transport: TransportKind,
}

impl ReceptionEvent {
    pub fn new(source: Endpoint, payload: Bytes, transport: TransportKind) -> Self {
        Self {
            source,
            payload,
            received_at_nanos: crate::now_nanos(),
            is_end_of_stream: false,
            transport,
        }
    }
}

/// Receives every decoded inbound message of a transport.
///
/// Called synchronously on the transport's own task, so implementations
/// must not block. Errors and panics are contained per listener.
pub trait MessageListener<M>: Send + Sync {
    fn on_message(&self, event: &ReceptionEvent, message: &M) -> anyhow::Result<()>;

    /// A stream peer went away. `event.is_end_of_stream` is set and the
    /// payload is empty. Never called by the datagram transport.
    fn on_end_of_stream(&self, _event: &ReceptionEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handle returned by `add_listener`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener registry shared by the receive path and add/remove calls.
pub(crate) struct ListenerSet<M> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn MessageListener<M>>)>>,
}

impl<M> ListenerSet<M> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<dyn MessageListener<M>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Deliver to every listener registered at call time. Returns how many
    /// listeners failed.
    pub fn dispatch(&self, event: &ReceptionEvent, message: &M) -> usize {
        self.each(event, |listener| listener.on_message(event, message))
    }

    pub fn dispatch_end_of_stream(&self, event: &ReceptionEvent) -> usize {
        self.each(event, |listener| listener.on_end_of_stream(event))
    }

    fn each<F>(&self, event: &ReceptionEvent, call: F) -> usize
    where
        F: Fn(&dyn MessageListener<M>) -> anyhow::Result<()>,
    {
        let snapshot: Vec<_> = self.lock().iter().map(|(_, l)| l.clone()).collect();
        let mut failures = 0;
        for listener in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(source = %event.source, error = %e, "listener failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::error!(source = %event.source, "listener panicked");
                }
            }
        }
        failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Arc<dyn MessageListener<M>>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Listener that forwards every message into an unbounded channel.
pub struct ChannelListener<M> {
    tx: mpsc::UnboundedSender<(ReceptionEvent, M)>,
}

impl<M: Clone + Send + Sync + 'static> ChannelListener<M> {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(ReceptionEvent, M)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl<M: Clone + Send + Sync + 'static> MessageListener<M> for ChannelListener<M> {
    fn on_message(&self, event: &ReceptionEvent, message: &M) -> anyhow::Result<()> {
        self.tx
            .send((event.clone(), message.clone()))
            .map_err(|_| anyhow::anyhow!("receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;
    impl MessageListener<u32> for Failing {
        fn on_message(&self, _: &ReceptionEvent, _: &u32) -> anyhow::Result<()> {
            anyhow::bail!("refused")
        }
    }

    struct Panicking;
    impl MessageListener<u32> for Panicking {
        fn on_message(&self, _: &ReceptionEvent, _: &u32) -> anyhow::Result<()> {
            panic!("listener bug")
        }
    }

    fn event() -> ReceptionEvent {
        ReceptionEvent::new(
            Endpoint::new("10.0.0.1", 6001),
            Bytes::from_static(b"x"),
            TransportKind::Datagram,
        )
    }

    #[test]
    fn failing_listeners_do_not_stop_delivery() {
        let set = ListenerSet::new();
        let (chan, mut rx) = ChannelListener::<u32>::new();
        set.add(Arc::new(Failing));
        set.add(Arc::new(Panicking));
        set.add(chan);

        let failures = set.dispatch(&event(), &42);
        assert_eq!(failures, 2);
        let (ev, msg) = rx.try_recv().unwrap();
        assert_eq!(msg, 42);
        assert_eq!(ev.source, Endpoint::new("10.0.0.1", 6001));
    }

    #[test]
    fn end_of_stream_defaults_to_noop() {
        struct Eos(std::sync::atomic::AtomicUsize);
        impl MessageListener<u32> for Eos {
            fn on_message(&self, _: &ReceptionEvent, _: &u32) -> anyhow::Result<()> {
                Ok(())
            }
            fn on_end_of_stream(&self, event: &ReceptionEvent) -> anyhow::Result<()> {
                assert!(event.is_end_of_stream);
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let set = ListenerSet::new();
        let eos = Arc::new(Eos(Default::default()));
        set.add(eos.clone());
        set.add(Arc::new(Failing));

        let mut ev = event();
        ev.is_end_of_stream = true;
        assert_eq!(set.dispatch_end_of_stream(&ev), 0);
        assert_eq!(eos.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_by_id() {
        let set = ListenerSet::<u32>::new();
        let (chan, mut rx) = ChannelListener::new();
        let id = set.add(chan);
        assert_eq!(set.len(), 1);
        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.dispatch(&event(), &1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn listener_may_register_during_dispatch() {
        struct Adder(Arc<ListenerSet<u32>>);
        impl MessageListener<u32> for Adder {
            fn on_message(&self, _: &ReceptionEvent, _: &u32) -> anyhow::Result<()> {
                let (chan, _rx) = ChannelListener::new();
                self.0.add(chan);
                Ok(())
            }
        }
        let set = Arc::new(ListenerSet::new());
        set.add(Arc::new(Adder(set.clone())));
        set.dispatch(&event(), &1);
        assert_eq!(set.len(), 2);
    }
}

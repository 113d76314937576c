//! The pipeline event bus, built on crossbeam-channel.
//!
//! Pipeline threads and export workers publish; observers (the CLI, a
//! status view, tests) subscribe. Publishing never blocks: an object moving
//! through a pipeline must not wait on whoever is watching, so an event is
//! dropped when the receiver is gone or a bounded channel is full.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use super::Event;

/// Publishing end, cloned into every pipeline and export worker.
#[derive(Clone, Debug)]
pub struct EventSender {
    inner: Sender<Event>,
}

impl EventSender {
    /// Publish without blocking; dropped if nobody can take it.
    pub fn send(&self, event: Event) {
        let _ = self.inner.try_send(event);
    }
}

/// Subscribing end. It ends once every pipeline and worker holding a
/// sender has exited.
pub struct EventReceiver {
    inner: Receiver<Event>,
}

impl EventReceiver {
    /// Wait for the next event; `None` once all senders are gone.
    pub fn recv(&self) -> Option<Event> {
        self.inner.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.inner.try_recv().ok()
    }

    /// Events until all senders are gone
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter()
    }

    /// Events already published, without waiting for more
    pub fn try_iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.try_iter()
    }
}

/// Constructors for a connected sender and receiver.
pub struct EventChannel;

impl EventChannel {
    /// A channel that keeps every event until it is read.
    pub fn new() -> (EventSender, EventReceiver) {
        connect(unbounded())
    }

    /// A channel holding at most `capacity` unread events; the rest are
    /// dropped so a slow observer cannot grow memory without bound.
    pub fn bounded(capacity: usize) -> (EventSender, EventReceiver) {
        connect(bounded(capacity))
    }
}

fn connect((sender, receiver): (Sender<Event>, Receiver<Event>)) -> (EventSender, EventReceiver) {
    (
        EventSender { inner: sender },
        EventReceiver { inner: receiver },
    )
}

/// A sender whose events go nowhere, for stages built before they are
/// linked into a pipeline and for runs nobody observes.
pub fn null_sender() -> EventSender {
    EventChannel::new().0
}

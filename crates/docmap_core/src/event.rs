//! Lifecycle events.
//!
//! Listeners observe documents as they move through a unit of work:
//! persisted, updated, removed, loaded, and each flush. Two styles are
//! supported:
//! - [`EventListener`] callbacks, invoked synchronously (a `PrePersist` or
//!   `PreUpdate` listener may still modify the document)
//! - [`EventManager::subscribe`], a channel of [`EventNotice`]s for
//!   observers that only need to know what happened
//!
//! # Usage
//!
//! ```rust
//! use docmap_core::{EventManager, LifecycleEvent};
//!
//! let events = EventManager::new();
//! let notices = events.subscribe();
//! // ... hand `events` to a Configuration, persist and flush ...
//! assert!(notices.try_recv().is_err());
//! ```

use crate::document::DocumentRef;
use crate::types::Oid;
use parking_lot::RwLock;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// A per-document lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// A NEW document is about to be scheduled for insertion.
    PrePersist,
    /// A document was inserted or upserted.
    PostPersist,
    /// A document is about to be updated. The change set is recomputed
    /// after listeners run.
    PreUpdate,
    /// A document was updated.
    PostUpdate,
    /// A managed document was scheduled for deletion.
    PreRemove,
    /// A document was deleted.
    PostRemove,
    /// A document was hydrated from storage.
    PostLoad,
}

/// A flush-level event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushEvent {
    /// Before change sets are computed.
    PreFlush,
    /// After change sets are computed, before any write.
    OnFlush,
    /// After every write succeeded.
    PostFlush,
}

/// Receives lifecycle and flush events.
pub trait EventListener: Send + Sync {
    /// Called for every lifecycle event.
    fn lifecycle(&self, event: LifecycleEvent, document: &DocumentRef) {
        let _ = (event, document);
    }

    /// Called for every flush event.
    fn flush(&self, event: FlushEvent) {
        let _ = event;
    }
}

/// A lifecycle event as delivered to channel subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotice {
    /// What happened.
    pub event: LifecycleEvent,
    /// Class of the document.
    pub class: String,
    /// Session identity of the document.
    pub document: Oid,
}

/// Dispatches events to listeners and subscribers.
///
/// Clones share the same listeners.
#[derive(Clone, Default)]
pub struct EventManager {
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
    subscribers: Arc<RwLock<Vec<Sender<EventNotice>>>>,
}

impl EventManager {
    /// Creates a manager with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Returns the number of listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Subscribes to lifecycle notices.
    ///
    /// Dropped receivers are pruned on the next dispatch.
    pub fn subscribe(&self) -> Receiver<EventNotice> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Dispatches a lifecycle event.
    pub fn dispatch(&self, event: LifecycleEvent, document: &DocumentRef) {
        // Snapshot so listeners may register further listeners.
        let listeners: Vec<Arc<dyn EventListener>> = self.listeners.read().clone();
        for listener in &listeners {
            listener.lifecycle(event, document);
        }

        let mut subscribers = self.subscribers.write();
        if subscribers.is_empty() {
            return;
        }
        let notice = EventNotice {
            event,
            class: document.class(),
            document: document.oid(),
        };
        subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    /// Dispatches a flush event.
    pub fn dispatch_flush(&self, event: FlushEvent) {
        let listeners: Vec<Arc<dyn EventListener>> = self.listeners.read().clone();
        for listener in &listeners {
            listener.flush(event);
        }
    }
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

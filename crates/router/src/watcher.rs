//! Routing table watchers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use tokio::sync::Notify;
use tracing::trace;
use uuid::Uuid;

use crate::error::RouterError;
use crate::event::Event;

/// Per-watcher event buffer capacity. When a watcher falls this far behind,
/// its oldest events are dropped; the producer never blocks.
pub(crate) const WATCHER_BUFFER: usize = 128;

/// Options for [`RoutingTable::watch`](crate::RoutingTable::watch).
#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    /// Restrict the stream to events for a single service.
    pub service: Option<String>,
}

impl WatchOptions {
    /// Restricts the stream to events for `service`.
    #[must_use]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }
}

pub(crate) type WatcherRegistry = StdRwLock<HashMap<Uuid, WatcherHandle>>;

/// The producer-side handle the table dispatches events through.
pub(crate) struct WatcherHandle {
    options: WatchOptions,
    shared: Arc<WatcherShared>,
}

impl WatcherHandle {
    pub(crate) fn deliver(&self, event: &Event) {
        if let Some(service) = &self.options.service {
            if service != &event.route.service {
                return;
            }
        }
        self.shared.push(event.clone());
    }
}

pub(crate) struct WatcherShared {
    queue: StdMutex<VecDeque<Event>>,
    notify: Notify,
    stopped: AtomicBool,
}

impl WatcherShared {
    fn push(&self, event: Event) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock().expect("watcher queue poisoned");
            if queue.len() == WATCHER_BUFFER {
                queue.pop_front();
                trace!(service = %event.route.service, "watcher backlog full, dropping oldest event");
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }
}

/// A stream of routing table events.
///
/// The watcher is a single-consumer stream: `next` takes `&mut self`. Events
/// arrive in the order their mutations were applied; a watcher that cannot
/// keep up loses its oldest buffered events first.
pub struct TableWatcher {
    id: Uuid,
    shared: Arc<WatcherShared>,
    registry: Weak<WatcherRegistry>,
}

impl TableWatcher {
    pub(crate) fn register(
        registry: &Arc<WatcherRegistry>,
        options: WatchOptions,
    ) -> Self {
        let shared = Arc::new(WatcherShared {
            queue: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
        });
        let id = Uuid::new_v4();
        registry
            .write()
            .expect("watcher registry poisoned")
            .insert(
                id,
                WatcherHandle {
                    options,
                    shared: Arc::clone(&shared),
                },
            );

        Self {
            id,
            shared,
            registry: Arc::downgrade(registry),
        }
    }

    /// Returns the next table event, or [`RouterError::WatcherStopped`] once
    /// the watcher has been stopped and its buffer drained.
    pub async fn next(&mut self) -> Result<Event, RouterError> {
        loop {
            {
                let mut queue = self.shared.queue.lock().expect("watcher queue poisoned");
                if let Some(event) = queue.pop_front() {
                    return Ok(event);
                }
            }
            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(RouterError::WatcherStopped);
            }
            self.shared.notify.notified().await;
        }
    }

    /// Stops the watcher and unregisters it from the table. Idempotent.
    pub fn stop(&mut self) {
        self.shared.stop();
        if let Some(registry) = self.registry.upgrade() {
            registry
                .write()
                .expect("watcher registry poisoned")
                .remove(&self.id);
        }
    }
}

impl Drop for TableWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

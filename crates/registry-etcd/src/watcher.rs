//! Change stream over the etcd key space.

use std::collections::VecDeque;

use async_trait::async_trait;
use etcd_client::{Event, EventType, WatchStream, Watcher as EtcdStreamHandle};
use switchyard_registry::{RegistryError, WatchAction, WatchResult, Watcher};
use tracing::trace;

use crate::decode;

/// Watcher over an [`EtcdRegistry`](crate::EtcdRegistry) prefix.
///
/// A single etcd watch response can carry several events; they are buffered
/// and handed out one at a time by [`Watcher::next`].
pub struct EtcdWatcher {
    handle: EtcdStreamHandle,
    stream: WatchStream,
    pending: VecDeque<WatchResult>,
    stopped: bool,
}

impl EtcdWatcher {
    pub(crate) fn new(handle: EtcdStreamHandle, stream: WatchStream) -> Self {
        Self {
            handle,
            stream,
            pending: VecDeque::new(),
            stopped: false,
        }
    }
}

/// Maps an etcd event onto a registry change.
///
/// A put whose create revision equals its mod revision is a fresh key; any
/// later put is an update. Deletions recover the payload from the previous
/// KV, which the watch was opened with.
fn map_event(event: &Event) -> Option<WatchResult> {
    match event.event_type() {
        EventType::Put => {
            let kv = event.kv()?;
            let action = if kv.create_revision() == kv.mod_revision() {
                WatchAction::Create
            } else {
                WatchAction::Update
            };
            decode(kv.value()).map(|service| WatchResult { action, service })
        }
        EventType::Delete => {
            let prev = event.prev_kv()?;
            decode(prev.value()).map(|service| WatchResult {
                action: WatchAction::Delete,
                service,
            })
        }
    }
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next(&mut self) -> Result<WatchResult, RegistryError> {
        loop {
            if let Some(result) = self.pending.pop_front() {
                return Ok(result);
            }
            if self.stopped {
                return Err(RegistryError::WatcherStopped);
            }

            let response = self
                .stream
                .message()
                .await
                .map_err(|error| RegistryError::Backend(error.to_string()))?;

            let Some(response) = response else {
                return Err(RegistryError::WatcherStopped);
            };
            if response.canceled() {
                return Err(RegistryError::WatcherStopped);
            }

            trace!(events = response.events().len(), "etcd watch response");
            self.pending.extend(response.events().iter().filter_map(map_event));
        }
    }

    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        // best effort; the server drops the watch when the stream closes
        let _ = self.handle.cancel().await;
    }
}

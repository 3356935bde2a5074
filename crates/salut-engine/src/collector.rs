//! Cross-stream packet collectors.
//!
//! A collector subscribes a filter to the service's dispatcher, which
//! funnels stanzas from *every* stream — including streams opened after
//! the collector was created. This is what lets a request on one TCP
//! connection be answered on another: the reply is matched by filter,
//! not by connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;

use salut_core::filter::StanzaFilter;
use salut_core::Stanza;

use crate::service::ServiceInner;

pub(crate) struct CollectorInner {
    filter: StanzaFilter,
    queue: Mutex<VecDeque<Stanza>>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl CollectorInner {
    pub(crate) fn new(filter: StanzaFilter) -> Arc<CollectorInner> {
        Arc::new(CollectorInner {
            filter,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Called by the dispatcher for every inbound stanza. Only matches
    /// are queued.
    pub(crate) fn offer(&self, stanza: &Stanza) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if (self.filter)(stanza) {
            self.queue
                .lock()
                .expect("collector queue poisoned")
                .push_back(stanza.clone());
            self.notify.notify_one();
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Handle returned by `LLService::create_collector`.
pub struct PacketCollector {
    inner: Arc<CollectorInner>,
    service: Weak<ServiceInner>,
}

impl PacketCollector {
    pub(crate) fn new(inner: Arc<CollectorInner>, service: Weak<ServiceInner>) -> PacketCollector {
        PacketCollector { inner, service }
    }

    /// The next matching stanza from any stream, or `None` once `timeout`
    /// elapses (a zero timeout polls the queue without waiting).
    pub async fn next(&self, timeout: Duration) -> Option<Stanza> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(stanza) = self
                .inner
                .queue
                .lock()
                .expect("collector queue poisoned")
                .pop_front()
            {
                return Some(stanza);
            }
            if self.inner.cancelled.load(Ordering::Acquire) {
                return None;
            }
            if tokio::time::timeout_at(deadline, self.inner.notify.notified())
                .await
                .is_err()
            {
                // Deadline hit; one last poll in case a stanza raced in.
                return self
                    .inner
                    .queue
                    .lock()
                    .expect("collector queue poisoned")
                    .pop_front();
            }
        }
    }

    /// Stop collecting and detach from the service.
    pub fn cancel(&self) {
        if let Some(service) = self.service.upgrade() {
            service.remove_collector(&self.inner);
        }
        self.inner.cancel();
    }
}

impl Drop for PacketCollector {
    fn drop(&mut self) {
        self.cancel();
    }
}

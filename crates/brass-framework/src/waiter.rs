//! Waiting for future events.
//!
//! A handler that needs a follow-up from the user ("what's your name?")
//! registers a waiter with a predicate. The dispatcher offers every inbound
//! event to pending waiters before it touches the registry; the first waiter
//! (in registration order) whose predicate holds receives the event, and the
//! event is not dispatched to plugins.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use brass_core::Event;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type WaitPredicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct Waiter {
    id: u64,
    predicate: WaitPredicate,
    tx: oneshot::Sender<Event>,
}

#[derive(Default)]
struct WaitersInner {
    next_id: u64,
    waiters: Vec<Waiter>,
}

/// Pending event waiters.
#[derive(Default)]
pub struct EventWaiters {
    inner: Mutex<WaitersInner>,
}

impl EventWaiters {
    /// Creates an empty waiter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers an event to pending waiters.
    ///
    /// Returns `true` if a waiter claimed it.
    pub fn offer(&self, event: &Event) -> bool {
        let mut inner = self.inner.lock();
        inner.waiters.retain(|w| !w.tx.is_closed());

        let mut index = 0;
        while index < inner.waiters.len() {
            let waiter = &inner.waiters[index];
            let matched = match catch_unwind(AssertUnwindSafe(|| (waiter.predicate)(event))) {
                Ok(matched) => matched,
                Err(_) => {
                    warn!(waiter = waiter.id, "event waiter predicate panicked; dropping waiter");
                    inner.waiters.remove(index);
                    continue;
                }
            };
            if !matched {
                index += 1;
                continue;
            }

            let waiter = inner.waiters.remove(index);
            if waiter.tx.send(event.clone()).is_ok() {
                debug!(waiter = waiter.id, event_id = %event.id(), "event claimed by waiter");
                return true;
            }
        }
        false
    }

    /// Waits up to `timeout` for the next event matching `predicate`.
    ///
    /// Returns `None` on timeout. The waiter is removed either way.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Option<Event>
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.waiters.push(Waiter {
                id,
                predicate: Box::new(predicate),
                tx,
            });
            id
        };

        let _remove = RemoveOnDrop { waiters: self, id };
        tokio::time::timeout(timeout, rx).await.ok()?.ok()
    }

    /// Number of pending waiters.
    pub fn pending(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

struct RemoveOnDrop<'a> {
    waiters: &'a EventWaiters,
    id: u64,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        self.waiters
            .inner
            .lock()
            .waiters
            .retain(|w| w.id != self.id);
    }
}

impl std::fmt::Debug for EventWaiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWaiters")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brass_core::EventKind;
    use std::sync::Arc;

    fn message(text: &str) -> Event {
        Event::builder("test", EventKind::Message).text(text).build()
    }

    #[tokio::test]
    async fn test_offer_without_waiters() {
        let waiters = EventWaiters::new();
        assert!(!waiters.offer(&message("hi")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_event_is_claimed() {
        let waiters = Arc::new(EventWaiters::new());

        let task = {
            let waiters = Arc::clone(&waiters);
            tokio::spawn(async move {
                waiters
                    .wait_for(|e| e.plain_text() == "yes", Duration::from_secs(10))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(waiters.pending(), 1);

        assert!(!waiters.offer(&message("no")));
        assert!(waiters.offer(&message("yes")));

        let event = task.await.unwrap().unwrap();
        assert_eq!(event.plain_text(), "yes");
        assert_eq!(waiters.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_waiter() {
        let waiters = EventWaiters::new();
        let got = waiters.wait_for(|_| true, Duration::from_secs(1)).await;
        assert!(got.is_none());
        assert_eq!(waiters.pending(), 0);
        assert!(!waiters.offer(&message("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_predicate_is_dropped() {
        let waiters = Arc::new(EventWaiters::new());
        let task = {
            let waiters = Arc::clone(&waiters);
            tokio::spawn(async move {
                waiters
                    .wait_for(|_| panic!("bad predicate"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert!(!waiters.offer(&message("x")));
        assert_eq!(waiters.pending(), 0);
        assert!(task.await.unwrap().is_none());
    }
}

//! Event feed abstraction shared by the relay pool and test doubles.

use anyhow::Result;
use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{event::Event, filter::Filter};

/// Item delivered on a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// A stored or freshly published event.
    Event(Event),
    /// The named relay finished replaying stored events.
    Eose(String),
}

/// Publish/subscribe feed of signed events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// One-shot batch of events matching `filter`.
    async fn fetch_events(&self, filter: &Filter) -> Result<Vec<Event>>;

    /// Open a live subscription. Dropping or stopping the handle ends it.
    fn subscribe(&self, filters: Vec<Filter>) -> Subscription;
}

/// Handle to a running subscription.
pub struct Subscription {
    rx: mpsc::Receiver<FeedMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiver together with the tasks feeding it.
    pub fn new(rx: mpsc::Receiver<FeedMessage>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { rx, tasks }
    }

    /// Next message, or `None` once every feeding task has finished.
    pub async fn recv(&mut self) -> Option<FeedMessage> {
        self.rx.recv().await
    }

    /// Next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<FeedMessage> {
        self.rx.try_recv().ok()
    }

    /// Stop feeding tasks and close the channel.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broadcast::RelayPublisher;
    use anyhow::bail;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory relay: serves stored events, accepts publishes and feeds
    /// live subscribers.
    #[derive(Default)]
    pub(crate) struct MemorySource {
        pub events: Mutex<Vec<Event>>,
        pub failing: AtomicBool,
        pub rejecting: AtomicBool,
        pub fetches: AtomicUsize,
        subscribers: Mutex<Vec<(Vec<Filter>, mpsc::Sender<FeedMessage>)>>,
    }

    impl MemorySource {
        pub(crate) fn new(events: Vec<Event>) -> Self {
            Self {
                events: Mutex::new(events),
                ..Default::default()
            }
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub(crate) fn set_rejecting(&self, rejecting: bool) {
            self.rejecting.store(rejecting, Ordering::SeqCst);
        }

        /// Store `ev` and deliver it to matching subscribers.
        pub(crate) fn push(&self, ev: Event) {
            self.events.lock().push(ev.clone());
            let subs = self.subscribers.lock();
            for (filters, tx) in subs.iter() {
                if filters.iter().any(|f| f.matches(&ev)) {
                    let _ = tx.try_send(FeedMessage::Event(ev.clone()));
                }
            }
        }

        pub(crate) fn has(&self, pred: impl Fn(&Event) -> bool) -> bool {
            self.events.lock().iter().any(pred)
        }
    }

    #[async_trait]
    impl EventSource for MemorySource {
        async fn fetch_events(&self, filter: &Filter) -> Result<Vec<Event>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                bail!("relays unreachable");
            }
            let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
            Ok(self
                .events
                .lock()
                .iter()
                .filter(|e| filter.matches(e))
                .take(limit)
                .cloned()
                .collect())
        }

        fn subscribe(&self, filters: Vec<Filter>) -> Subscription {
            let (tx, rx) = mpsc::channel(64);
            self.subscribers.lock().push((filters, tx));
            Subscription::new(rx, vec![])
        }
    }

    #[async_trait]
    impl RelayPublisher for MemorySource {
        fn relays(&self) -> Vec<String> {
            vec!["memory://relay".into()]
        }

        async fn publish_to(&self, _relay: &str, event: &Event) -> Result<()> {
            if self.rejecting.load(Ordering::SeqCst) {
                bail!("blocked");
            }
            self.push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn subscription_stops_on_drop_of_sender() {
        let (tx, rx) = mpsc::channel(1);
        let mut sub = Subscription::new(rx, vec![]);
        tx.send(FeedMessage::Eose("r".into())).await.unwrap();
        assert_eq!(sub.try_recv(), Some(FeedMessage::Eose("r".into())));
        drop(tx);
        assert_eq!(sub.recv().await, None);
    }
}

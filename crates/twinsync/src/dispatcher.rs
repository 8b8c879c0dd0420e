use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use twinsync_protocol::{Property, TwinCollection};

/// Callback for changes to a single desired property.
pub type PropertyCallback = Arc<dyn Fn(Property) + Send + Sync>;

/// Callback for every applied desired delta.
pub type DocumentCallback = Arc<dyn Fn(&DesiredUpdate) + Send + Sync>;

pub type SubscriptionId = u64;

/// One applied delta as seen by whole-document subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredUpdate {
    pub version: Option<u64>,
    pub changes: Vec<Property>,
    /// Desired properties right after the delta was committed.
    pub desired: TwinCollection,
}

#[derive(Clone)]
struct KeyEntry {
    id: SubscriptionId,
    callback: PropertyCallback,
}

#[derive(Clone)]
struct DocumentEntry {
    id: SubscriptionId,
    callback: DocumentCallback,
}

#[derive(Default)]
struct Registry {
    by_key: HashMap<String, KeyEntry>,
    documents: Vec<DocumentEntry>,
}

enum Job {
    Property(PropertyCallback, Property),
    Document(DocumentCallback, Arc<DesiredUpdate>),
}

/// Routes committed desired-property changes to subscribers.
///
/// Lookups are exact-key only and at most one callback exists per key.
/// Callbacks run one at a time, in delivery order, on a dedicated worker
/// task, never on the caller of [`dispatch`](Self::dispatch).
pub struct PropertyDispatcher {
    registry: Arc<RwLock<Registry>>,
    next_id: AtomicU64,
    jobs: mpsc::UnboundedSender<Job>,
}

impl PropertyDispatcher {
    /// Spawns the dispatch worker; must be called within a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx));
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            next_id: AtomicU64::new(1),
            jobs,
        }
    }

    fn next_id(&self) -> SubscriptionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Installs `callback` for `key`, replacing any previous one.
    pub fn subscribe<F>(&self, key: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(Property) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let key = key.into();
        let replaced = self.registry.write().by_key.insert(
            key.clone(),
            KeyEntry {
                id,
                callback: Arc::new(callback),
            },
        );
        if replaced.is_some() {
            debug!(key, "Replaced desired property subscription");
        }
        id
    }

    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DesiredUpdate) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.registry.write().documents.push(DocumentEntry {
            id,
            callback: Arc::new(callback),
        });
        id
    }

    /// Delivers changes to `key` through a channel instead of a callback.
    pub fn subscribe_stream(&self, key: impl Into<String>) -> mpsc::UnboundedReceiver<Property> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(key, move |property| {
            let _ = tx.send(property);
        });
        rx
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        self.registry.write().by_key.remove(key).is_some()
    }

    pub fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.write();
        let before = registry.by_key.len() + registry.documents.len();
        registry.by_key.retain(|_, entry| entry.id != id);
        registry.documents.retain(|entry| entry.id != id);
        registry.by_key.len() + registry.documents.len() < before
    }

    #[must_use]
    pub fn is_subscribed(&self, key: &str) -> bool {
        self.registry.read().by_key.contains_key(key)
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let registry = self.registry.read();
        registry.by_key.len() + registry.documents.len()
    }

    pub fn clear(&self) {
        let mut registry = self.registry.write();
        registry.by_key.clear();
        registry.documents.clear();
    }

    /// Queues callbacks for `update`. Keys without a subscriber are skipped.
    pub fn dispatch(&self, update: DesiredUpdate) {
        let mut jobs = Vec::new();
        {
            let registry = self.registry.read();
            for change in &update.changes {
                if let Some(entry) = registry.by_key.get(&change.key) {
                    jobs.push(Job::Property(Arc::clone(&entry.callback), change.clone()));
                } else {
                    trace!(key = %change.key, "No subscriber for desired property");
                }
            }
            if !registry.documents.is_empty() {
                let update = Arc::new(update.clone());
                for entry in &registry.documents {
                    jobs.push(Job::Document(Arc::clone(&entry.callback), Arc::clone(&update)));
                }
            }
        }

        for job in jobs {
            if self.jobs.send(job).is_err() {
                error!("Dispatch worker has stopped");
                return;
            }
        }
    }
}

impl Default for PropertyDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let outcome = match job {
            Job::Property(callback, property) => {
                catch_unwind(AssertUnwindSafe(|| callback(property)))
            }
            Job::Document(callback, update) => catch_unwind(AssertUnwindSafe(|| callback(&update))),
        };
        if outcome.is_err() {
            error!("Desired property callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use twinsync_protocol::TwinValue;

    fn update(changes: &[(&str, &str)], version: u64) -> DesiredUpdate {
        DesiredUpdate {
            version: Some(version),
            changes: changes
                .iter()
                .map(|(k, v)| Property {
                    key: (*k).to_string(),
                    value: TwinValue::from(*v),
                    version: Some(version),
                })
                .collect(),
            desired: TwinCollection::new(),
        }
    }

    #[tokio::test]
    async fn test_exact_key_match_only() {
        let dispatcher = PropertyDispatcher::new();
        let mut conf = dispatcher.subscribe_stream("conf");

        dispatcher.dispatch(update(&[("conf", "v1"), ("config", "x")], 2));

        let property = conf.recv().await.unwrap();
        assert_eq!(property.key, "conf");
        assert_eq!(property.value, TwinValue::from("v1"));
        assert_eq!(property.version, Some(2));
        assert!(conf.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces() {
        let dispatcher = PropertyDispatcher::new();
        let mut first = dispatcher.subscribe_stream("conf");
        let mut second = dispatcher.subscribe_stream("conf");
        assert_eq!(dispatcher.subscription_count(), 1);

        dispatcher.dispatch(update(&[("conf", "v1")], 1));

        assert_eq!(second.recv().await.unwrap().value, TwinValue::from("v1"));
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_document_subscribers_see_every_update() {
        let dispatcher = PropertyDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe_all(move |update: &DesiredUpdate| {
            let _ = tx.send(update.changes.len());
        });

        dispatcher.dispatch(update(&[("a", "1"), ("b", "2")], 1));
        dispatcher.dispatch(update(&[("c", "3")], 2));

        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_worker() {
        let dispatcher = PropertyDispatcher::new();
        dispatcher.subscribe("boom", |_| panic!("callback failure"));
        let mut ok = dispatcher.subscribe_stream("ok");

        dispatcher.dispatch(update(&[("boom", "1")], 1));
        dispatcher.dispatch(update(&[("ok", "2")], 2));

        assert_eq!(ok.recv().await.unwrap().value, TwinValue::from("2"));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let dispatcher = PropertyDispatcher::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let id = dispatcher.subscribe("conf", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(dispatcher.unsubscribe_id(id));
        assert!(!dispatcher.unsubscribe("conf"));
        dispatcher.dispatch(update(&[("conf", "v1")], 1));

        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

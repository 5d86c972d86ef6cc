use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::error::StorageResult;
use super::types::ChangeEvent;

/// Receives the full ordered result set of a live query.
///
/// Invoked from a backend listener task, so it must not block and must not release
/// its own subscription from inside the call.
pub type SnapshotCallback<T> = Box<dyn Fn(Vec<T>) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "sub-{}", self.0)
    }
}

/// Serializes snapshot delivery against release: once `close` returns, no callback is
/// running and none will start.
#[derive(Debug, Clone)]
struct DeliveryGate {
    open: Arc<Mutex<bool>>,
}

impl DeliveryGate {
    fn new() -> Self {
        Self {
            open: Arc::new(Mutex::new(true)),
        }
    }

    fn deliver(&self, deliver: impl FnOnce()) -> bool {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if *open {
            deliver();
        }
        *open
    }

    fn close(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Tracks live listeners so leaks are observable.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    next_id: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
}

impl SubscriptionRegistry {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Spawns a listener that re-runs `query` after every relevant change and hands the
    /// result to `callback`. The initial snapshot is the caller's job.
    pub(crate) fn open<T, Q, F>(
        &self,
        label: &'static str,
        mut changes: broadcast::Receiver<ChangeEvent>,
        relevant: impl Fn(&ChangeEvent) -> bool + Send + 'static,
        query: Q,
        callback: SnapshotCallback<T>,
    ) -> Subscription
    where
        T: Send + 'static,
        Q: Fn() -> F + Send + 'static,
        F: Future<Output = StorageResult<Vec<T>>> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let gate = DeliveryGate::new();
        let listener_gate = gate.clone();

        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) if relevant(&event) => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(%id, label, skipped, "listener lagged, re-querying");
                    }
                    Err(RecvError::Closed) => break,
                }

                match query().await {
                    Ok(snapshot) => {
                        if !listener_gate.deliver(|| callback(snapshot)) {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::error!(%id, label, "live query failed: {error}");
                    }
                }
            }
        });

        self.active.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(%id, label, "subscription opened");

        Subscription {
            id,
            label,
            gate,
            task,
            active: Arc::clone(&self.active),
        }
    }
}

/// Handle for one live query.
///
/// Released exactly once: either by [`Subscription::unsubscribe`], which consumes the
/// handle, or by dropping it on any other exit path.
#[must_use = "dropping a subscription releases it immediately"]
pub struct Subscription {
    id: SubscriptionId,
    label: &'static str,
    gate: DeliveryGate,
    task: JoinHandle<()>,
    active: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.gate.close();
        self.task.abort();
        self.active.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(id = %self.id, label = self.label, "subscription released");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;

    fn counting_callback(seen: Arc<StdMutex<Vec<usize>>>) -> SnapshotCallback<usize> {
        Box::new(move |snapshot: Vec<usize>| {
            seen.lock().expect("seen lock").push(snapshot.len());
        })
    }

    #[tokio::test]
    async fn listener_requeries_only_on_relevant_changes() {
        let registry = SubscriptionRegistry::default();
        let (sender, receiver) = broadcast::channel(16);
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let subscription = registry.open(
            "test",
            receiver,
            |event| matches!(event, ChangeEvent::Conversations),
            || async { Ok(vec![1_usize, 2, 3]) },
            counting_callback(Arc::clone(&seen)),
        );

        sender
            .send(ChangeEvent::Messages(crate::ConversationId::new_v7()))
            .expect("send irrelevant");
        sender.send(ChangeEvent::Conversations).expect("send relevant");

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().expect("seen lock").is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("relevant change is delivered");

        assert_eq!(seen.lock().expect("seen lock").as_slice(), &[3]);
        assert_eq!(registry.active(), 1);
        subscription.unsubscribe();
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn released_subscription_delivers_nothing() {
        let registry = SubscriptionRegistry::default();
        let (sender, receiver) = broadcast::channel(16);
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let subscription = registry.open(
            "test",
            receiver,
            |_| true,
            || async { Ok(vec![0_usize]) },
            counting_callback(Arc::clone(&seen)),
        );
        subscription.unsubscribe();

        let _ = sender.send(ChangeEvent::Conversations);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(seen.lock().expect("seen lock").is_empty());
        assert_eq!(registry.active(), 0);
    }
}

//! Change notification for document consumers, and the injected notice sink.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use super::Document;

/// Events a live subscriber may fall behind by before it starts skipping.
const SUBSCRIPTION_BUFFER: usize = 16;

/// Delivered after the filesystem and the data mirror agree on the new state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentEvent {
    /// A mutation validated. `preview` is the SVG from the validation render.
    Updated { preview: String },
    /// A checkpoint was restored. No preview when the compiler is not loaded.
    Restored {
        checkpoint: String,
        preview: Option<String>,
    },
}

impl DocumentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DocumentEvent::Updated { .. } => "updated",
            DocumentEvent::Restored { .. } => "restored",
        }
    }
}

pub trait DocumentObserver: Send + Sync {
    fn on_event(&self, event: &DocumentEvent);
}

impl<F> DocumentObserver for F
where
    F: Fn(&DocumentEvent) + Send + Sync,
{
    fn on_event(&self, event: &DocumentEvent) {
        self(event)
    }
}

/// Observer set keyed by `Arc` allocation.
#[derive(Default)]
pub struct ObserverSet {
    observers: Mutex<Vec<Arc<dyn DocumentObserver>>>,
}

fn same_observer(a: &Arc<dyn DocumentObserver>, b: &Arc<dyn DocumentObserver>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl ObserverSet {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn DocumentObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` if `observer` was already subscribed.
    pub fn subscribe(&self, observer: Arc<dyn DocumentObserver>) -> bool {
        let mut observers = self.lock();
        if observers.iter().any(|o| same_observer(o, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn DocumentObserver>) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|o| !same_observer(o, observer));
        observers.len() != before
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn notify(&self, event: &DocumentEvent) {
        let snapshot = self.lock().clone();
        for observer in snapshot {
            if catch_unwind(AssertUnwindSafe(|| observer.on_event(event))).is_err() {
                error!("Document observer panicked while handling {event:?}");
            }
        }
    }
}

/// User-facing notices. Replaces toasts pushed into a global UI store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    ReadyToLoad,
    ReadyToCompile,
    CheckpointCreated { id: String },
    NothingToCommit,
    CheckpointRestored { id: String, removed_entries: usize },
    BuildFailed { path: String, message: String },
    StoreReset,
}

pub trait EventSink: Send + Sync {
    fn notice(&self, notice: Notice);
}

/// Sink that only logs.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notice(&self, notice: Notice) {
        match notice {
            Notice::ReadyToLoad => info!("Document files ready"),
            Notice::ReadyToCompile => info!("Compiler ready"),
            Notice::CheckpointCreated { id } => info!("Checkpoint created: {id}"),
            Notice::NothingToCommit => info!("No changes to commit"),
            Notice::CheckpointRestored {
                id,
                removed_entries,
            } => info!("Restored checkpoint {id} ({removed_entries} transcript entries dropped)"),
            Notice::BuildFailed { path, message } => warn!("Build failed at {path}: {message}"),
            Notice::StoreReset => info!("Document store reset"),
        }
    }
}

/// Owned feed of document events, unsubscribed on drop.
pub struct Subscription {
    document: Arc<Document>,
    observer: Arc<dyn DocumentObserver>,
    receiver: broadcast::Receiver<DocumentEvent>,
}

impl Subscription {
    pub(super) fn new(document: Arc<Document>) -> Self {
        let (sender, receiver) = broadcast::channel(SUBSCRIPTION_BUFFER);
        let observer: Arc<dyn DocumentObserver> = Arc::new(move |event: &DocumentEvent| {
            // No receiver means the subscription is being dropped.
            let _ = sender.send(event.clone());
        });
        document.subscribe(observer.clone());
        Self {
            document,
            observer,
            receiver,
        }
    }

    /// Next event. Events missed while the subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<DocumentEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged; skipped {skipped} events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.document.unsubscribe(&self.observer);
        debug!("Event subscriber disconnected");
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    notices: Mutex<Vec<Notice>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn notice(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn DocumentObserver>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        let observer: Arc<dyn DocumentObserver> = Arc::new(move |_: &DocumentEvent| {
            handle.fetch_add(1, Ordering::SeqCst);
        });
        (count, observer)
    }

    fn updated() -> DocumentEvent {
        DocumentEvent::Updated {
            preview: "<svg/>".to_string(),
        }
    }

    #[test]
    fn test_double_subscribe_fires_once() {
        let set = ObserverSet::default();
        let (count, observer) = counter();

        assert!(set.subscribe(observer.clone()));
        assert!(!set.subscribe(observer.clone()));
        set.notify(&updated());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let set = ObserverSet::default();
        let (count, observer) = counter();
        set.subscribe(observer.clone());

        assert!(set.unsubscribe(&observer));
        assert!(!set.unsubscribe(&observer));
        set.notify(&updated());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        let set = ObserverSet::default();
        let panicking: Arc<dyn DocumentObserver> =
            Arc::new(|_: &DocumentEvent| panic!("observer bug"));
        let (count, observer) = counter();
        set.subscribe(panicking);
        set.subscribe(observer);

        set.notify(&updated());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

//! Snapshot subscriptions.
//!
//! Subscribers are kept in an ordered list and notified synchronously, in
//! subscription order, after every transition. The list lock is never held
//! while a callback runs, so callbacks may unsubscribe themselves or others.

use crate::instance::Snapshot;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Callback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

struct Entry {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

impl Inner {
    fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }
}

/// Ordered list of snapshot callbacks.
#[derive(Clone, Default)]
pub(crate) struct SubscriberList {
    inner: Arc<Mutex<Inner>>,
}

impl SubscriberList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, callback: Callback) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry { id, callback });

        Subscription {
            id,
            list: Arc::downgrade(&self.inner),
        }
    }

    /// Invokes every live callback in subscription order.
    pub(crate) fn notify(&self, snapshot: &Snapshot) {
        let entries: Vec<(u64, Callback)> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|e| (e.id, e.callback.clone()))
            .collect();

        for (id, callback) in entries {
            // Skip subscribers removed by an earlier callback in this round.
            if !self.inner.lock().contains(id) {
                continue;
            }
            callback(snapshot);
        }
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    list: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Removes the callback. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(list) = self.list.upgrade() {
            list.lock().entries.retain(|e| e.id != self.id);
        }
    }

    /// Returns true while the callback is still registered.
    pub fn is_active(&self) -> bool {
        self.list
            .upgrade()
            .map(|list| list.lock().contains(self.id))
            .unwrap_or(false)
    }
}

/// Wraps a selector so the callback only fires when the selected value changes.
pub(crate) fn select<T, S, F>(initial: T, selector: S, callback: F) -> Callback
where
    T: PartialEq + Send + 'static,
    S: Fn(&Snapshot) -> T + Send + Sync + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    let last = Mutex::new(initial);
    Arc::new(move |snapshot: &Snapshot| {
        let selected = selector(snapshot);
        let mut last = last.lock();
        if *last != selected {
            *last = selected;
            callback(&*last);
        }
    })
}

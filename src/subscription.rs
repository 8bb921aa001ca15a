//! Subscription registry: which configuration entries are watched, the last
//! synced snapshot for each, and the callbacks to run on change.
//!
//! Callbacks are stored as an ordered list keyed by a [`CallbackId`], so a
//! single registration can be removed without disturbing its siblings. The
//! same callback can be registered twice and will then run twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{join_all, BoxFuture};
use tracing::error;

use crate::descriptor::{ConfigDescriptor, ConfigIdentity};

/// Error type subscriber callbacks may return; failures are logged and never
/// affect the stored snapshot.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// A change callback. Receives the freshly fetched descriptor.
pub type ChangeCallback =
    Arc<dyn Fn(ConfigDescriptor) -> BoxFuture<'static, Result<(), CallbackError>> + Send + Sync>;

/// Wraps an async closure as a [`ChangeCallback`].
pub fn callback<F, Fut>(f: F) -> ChangeCallback
where
    F: Fn(ConfigDescriptor) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    Arc::new(
        move |descriptor| -> BoxFuture<'static, Result<(), CallbackError>> {
            Box::pin(f(descriptor))
        },
    )
}

/// Identifies one callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct Entry {
    descriptor: ConfigDescriptor,
    callbacks: Vec<(CallbackId, ChangeCallback)>,
}

/// Watched entries, keyed by the identity's canonical key.
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a callback. Returns the registration id and whether this is
    /// the first callback for the entry (the caller then sets up the wire
    /// listen / poll loop). An existing entry keeps its descriptor snapshot;
    /// the caller's descriptor only seeds brand-new entries.
    pub fn add(&self, descriptor: &ConfigDescriptor, callback: ChangeCallback) -> (CallbackId, bool) {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(descriptor.unique_key())
            .or_insert_with(|| Entry {
                descriptor: descriptor.clone(),
                callbacks: Vec::new(),
            });
        entry.callbacks.push((id, callback));
        (id, entry.callbacks.len() == 1)
    }

    /// Removes one registration. Returns `true` when the entry held no other
    /// callbacks and was dropped entirely (the caller then tears down the
    /// wire listen / poll loop). Unknown ids are a quiet no-op.
    pub fn remove(&self, identity: &ConfigIdentity, id: CallbackId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let key = identity.unique_key();
        let Some(entry) = entries.get_mut(&key) else {
            return false;
        };
        entry.callbacks.retain(|(cid, _)| *cid != id);
        if entry.callbacks.is_empty() {
            entries.remove(&key);
            return true;
        }
        false
    }

    /// Snapshot of the stored descriptor for `identity`.
    pub fn descriptor(&self, identity: &ConfigIdentity) -> Option<ConfigDescriptor> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&identity.unique_key())
            .map(|e| e.descriptor.clone())
    }

    /// Stored descriptor plus a snapshot of the callback list, for fan-out.
    pub fn callbacks_for(
        &self,
        identity: &ConfigIdentity,
    ) -> Option<(ConfigDescriptor, Vec<ChangeCallback>)> {
        let entries = self.entries.lock().unwrap();
        entries.get(&identity.unique_key()).map(|e| {
            (
                e.descriptor.clone(),
                e.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            )
        })
    }

    /// Replaces the stored snapshot after a successful sync. A no-op when
    /// the entry was unsubscribed in the meantime.
    pub fn update_descriptor(&self, descriptor: &ConfigDescriptor) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&descriptor.unique_key()) {
            entry.descriptor = descriptor.clone();
        }
    }

    /// Descriptor snapshots of every watched entry.
    pub fn descriptors(&self) -> Vec<ConfigDescriptor> {
        let entries = self.entries.lock().unwrap();
        entries.values().map(|e| e.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Runs every callback with its own clone of the descriptor. All callbacks
/// are attempted; failures are logged and do not stop the others.
pub async fn fan_out(callbacks: &[ChangeCallback], descriptor: &ConfigDescriptor) {
    let results = join_all(callbacks.iter().map(|cb| cb(descriptor.clone()))).await;
    for result in results {
        if let Err(err) = result {
            error!(%err, key = %descriptor.unique_key(), "change callback failed");
        }
    }
}

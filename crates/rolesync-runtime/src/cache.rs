//! Watch caches: local, indexed mirrors of a Kubernetes resource collection
//!
//! A [`WatchCache`] owns nothing but its snapshot. [`WatchCache::run`] drives
//! a kube-rs watcher (initial list followed by incremental watch events) and
//! feeds each event to [`WatchCache::apply`], which updates the snapshot and
//! notifies subscribed [`ResourceEventHandler`]s. Reads are synchronous and
//! never block on the API server.
//!
//! A relist (`Init`, `InitApply*`, `InitDone`) replaces the snapshot as a
//! whole. Objects that disappeared while the watch was down produce delete
//! notifications, so subscribers never miss a removal.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::{Stream, StreamExt};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives change notifications from a [`WatchCache`]
///
/// Handlers run on the cache's task and must not block.
pub trait ResourceEventHandler<K>: Send + Sync {
    /// An object appeared
    fn on_add(&self, obj: &K);
    /// An object changed (or was re-observed during a relist)
    fn on_update(&self, old: &K, new: &K);
    /// An object was removed; `obj` is its last known state
    fn on_delete(&self, obj: &K);
}

type AddFn<K> = Box<dyn Fn(&K) + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&K, &K) + Send + Sync>;
type DeleteFn<K> = Box<dyn Fn(&K) + Send + Sync>;

/// A handler built from three optional closures
pub struct EventHandlerFns<K> {
    /// Called for added objects
    pub add: Option<AddFn<K>>,
    /// Called for updated objects
    pub update: Option<UpdateFn<K>>,
    /// Called for deleted objects
    pub delete: Option<DeleteFn<K>>,
}

impl<K> Default for EventHandlerFns<K> {
    fn default() -> Self {
        Self {
            add: None,
            update: None,
            delete: None,
        }
    }
}

impl<K> ResourceEventHandler<K> for EventHandlerFns<K> {
    fn on_add(&self, obj: &K) {
        if let Some(f) = &self.add {
            f(obj);
        }
    }

    fn on_update(&self, old: &K, new: &K) {
        if let Some(f) = &self.update {
            f(old, new);
        }
    }

    fn on_delete(&self, obj: &K) {
        if let Some(f) = &self.delete {
            f(obj);
        }
    }
}

/// Anything that reports whether its initial list has been consumed
pub trait HasSynced: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;
    /// Whether the initial list has been consumed
    fn has_synced(&self) -> bool;
    /// Resolves once the initial list has been consumed
    fn wait_for_sync(&self) -> BoxFuture<'_, ()>;
}

/// Cache key of an object: `namespace/name`, or `name` if cluster-scoped
///
/// Delete events carry the object's last known state, so this works for
/// deletions too. Returns `None` for objects without a name.
pub fn object_key<K: Resource>(obj: &K) -> Option<String> {
    let meta = obj.meta();
    let name = meta.name.as_deref()?;
    Some(match meta.namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    })
}

enum Notification<K> {
    Added(Arc<K>),
    Updated(Arc<K>, Arc<K>),
    Deleted(Arc<K>),
}

/// Eventually consistent local mirror of one resource collection
pub struct WatchCache<K> {
    name: String,
    store: RwLock<HashMap<String, Arc<K>>>,
    relist: Mutex<Option<HashMap<String, Arc<K>>>>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler<K>>>>,
    synced: AtomicBool,
    synced_notify: Notify,
}

impl<K> WatchCache<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Create an empty, unsynced cache
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: RwLock::new(HashMap::new()),
            relist: Mutex::new(None),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
            synced_notify: Notify::new(),
        }
    }

    /// Subscribe to change notifications
    ///
    /// Register handlers before [`WatchCache::run`] so the initial list is
    /// delivered as adds.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.write().push(handler);
    }

    /// Look up an object by `namespace/name` key
    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.store.read().get(key).cloned()
    }

    /// Snapshot of every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Snapshot of every cached key, sorted
    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.store.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether the cache holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch `api` until `cancel` fires, mirroring it into this cache
    pub async fn run(&self, api: Api<K>, config: watcher::Config, cancel: CancellationToken) {
        let stream = watcher::watcher(api, config).default_backoff();
        self.run_stream(stream, cancel).await;
    }

    /// Consume an event stream until it ends or `cancel` fires
    pub async fn run_stream<S>(&self, stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<Event<K>, watcher::Error>>,
    {
        info!(cache = %self.name, "Starting watch cache");
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => {
                        warn!(cache = %self.name, error = %e, "Watch error, will retry")
                    }
                    None => {
                        warn!(cache = %self.name, "Watch stream ended");
                        break;
                    }
                },
            }
        }
        info!(cache = %self.name, "Stopped watch cache");
    }

    /// Apply one watch event to the snapshot and notify handlers
    pub fn apply(&self, event: Event<K>) {
        let notifications = match event {
            Event::Init => {
                debug!(cache = %self.name, "Relist started");
                *self.relist.lock() = Some(HashMap::new());
                Vec::new()
            }
            Event::InitApply(obj) => {
                let Some(key) = self.key_of(&obj) else {
                    return;
                };
                {
                    let mut relist = self.relist.lock();
                    if let Some(buffer) = relist.as_mut() {
                        buffer.insert(key, Arc::new(obj));
                        return;
                    }
                }
                self.upsert(key, obj)
            }
            Event::InitDone => {
                let buffer = self.relist.lock().take().unwrap_or_default();
                let notifications = self.replace(buffer);
                if !self.synced.swap(true, Ordering::AcqRel) {
                    info!(cache = %self.name, objects = self.len(), "Watch cache synced");
                }
                self.synced_notify.notify_waiters();
                notifications
            }
            Event::Apply(obj) => match self.key_of(&obj) {
                Some(key) => self.upsert(key, obj),
                None => return,
            },
            Event::Delete(obj) => match self.key_of(&obj) {
                Some(key) => {
                    self.store.write().remove(&key);
                    vec![Notification::Deleted(Arc::new(obj))]
                }
                None => return,
            },
        };

        self.dispatch(notifications);
    }

    fn key_of(&self, obj: &K) -> Option<String> {
        let key = object_key(obj);
        if key.is_none() {
            warn!(cache = %self.name, ?obj, "Dropping event for object without a name");
        }
        key
    }

    fn upsert(&self, key: String, obj: K) -> Vec<Notification<K>> {
        let new = Arc::new(obj);
        let old = self.store.write().insert(key, new.clone());
        vec![match old {
            Some(old) => Notification::Updated(old, new),
            None => Notification::Added(new),
        }]
    }

    fn replace(&self, buffer: HashMap<String, Arc<K>>) -> Vec<Notification<K>> {
        let mut store = self.store.write();

        let mut changes: Vec<(String, Notification<K>)> = Vec::new();
        for (key, new) in &buffer {
            let notification = match store.get(key) {
                Some(old) => Notification::Updated(old.clone(), new.clone()),
                None => Notification::Added(new.clone()),
            };
            changes.push((key.clone(), notification));
        }
        for (key, old) in store.iter() {
            if !buffer.contains_key(key) {
                changes.push((key.clone(), Notification::Deleted(old.clone())));
            }
        }

        *store = buffer;
        changes.sort_by(|a, b| a.0.cmp(&b.0));
        changes.into_iter().map(|(_, n)| n).collect()
    }

    fn dispatch(&self, notifications: Vec<Notification<K>>) {
        if notifications.is_empty() {
            return;
        }
        let handlers = self.handlers.read().clone();
        for notification in &notifications {
            for handler in &handlers {
                match notification {
                    Notification::Added(obj) => handler.on_add(obj),
                    Notification::Updated(old, new) => handler.on_update(old, new),
                    Notification::Deleted(obj) => handler.on_delete(obj),
                }
            }
        }
    }
}

impl<K> HasSynced for WatchCache<K>
where
    K: Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn wait_for_sync(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let notified = self.synced_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.synced.load(Ordering::Acquire) {
                    return;
                }
                notified.await;
            }
        })
    }
}

/// Wait until every cache has synced
///
/// Returns the names of the caches still unsynced when `timeout` elapsed or
/// `cancel` fired; an empty list means success.
pub async fn wait_for_cache_sync(
    caches: &[&dyn HasSynced],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Vec<String> {
    let all_synced = join_all(caches.iter().map(|c| c.wait_for_sync()));
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::timeout(timeout, all_synced) => {}
    }
    caches
        .iter()
        .filter(|c| !c.has_synced())
        .map(|c| c.name().to_string())
        .collect()
}

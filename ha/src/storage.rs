use crate::{
    error::{Error, Result},
    record::Annotations,
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// A named string map plus the opaque version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub name: String,
    pub version: String,
    pub data: Annotations,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectEvent {
    Added(StoredObject),
    Updated { old: StoredObject, new: StoredObject },
    Deleted(StoredObject),
}

impl ObjectEvent {
    pub fn name(&self) -> &str {
        match self {
            ObjectEvent::Added(obj) | ObjectEvent::Deleted(obj) => &obj.name,
            ObjectEvent::Updated { new, .. } => &new.name,
        }
    }
}

/// Versioned key/value objects with single-writer-per-key optimistic
/// concurrency. This is the only coordination primitive the controller needs.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> &'static str;

    async fn get(&self, name: &str) -> Result<Option<StoredObject>>;

    /// Fails with `Conflict` when the object already exists.
    async fn create(&self, name: &str, data: Annotations) -> Result<StoredObject>;

    /// Writes the keys in `data` and leaves any other keys on the object
    /// alone. Fails with `Conflict` unless `version` is the current version,
    /// and with `NotFound` when the object is gone.
    async fn update(&self, name: &str, data: Annotations, version: &str) -> Result<StoredObject>;

    /// Deleting a missing object is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Change notifications for the given object names.
    async fn watch(&self, names: Vec<String>) -> Result<mpsc::UnboundedReceiver<ObjectEvent>>;
}

#[derive(Debug)]
struct Watcher {
    names: Vec<String>,
    tx: mpsc::UnboundedSender<ObjectEvent>,
}

/// Process-local store. Versions come from one counter shared by every key,
/// like a control-plane resource version.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    revision: AtomicU64,
    watchers: parking_lot::Mutex<Vec<Watcher>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            revision: AtomicU64::new(0),
            watchers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn next_version(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self, event: ObjectEvent) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|watcher| !watcher.tx.is_closed());
        for watcher in watchers.iter() {
            if watcher.names.iter().any(|name| name == event.name()) {
                let _ = watcher.tx.send(event.clone());
            }
        }
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, name: &str) -> Result<Option<StoredObject>> {
        Ok(self.objects.get(name).map(|obj| obj.clone()))
    }

    async fn create(&self, name: &str, data: Annotations) -> Result<StoredObject> {
        let created = match self.objects.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(Error::Conflict { key: name.to_string() }),
            Entry::Vacant(slot) => {
                let obj = StoredObject {
                    name: name.to_string(),
                    version: self.next_version(),
                    data,
                };
                slot.insert(obj.clone());
                obj
            }
        };
        self.notify(ObjectEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, name: &str, data: Annotations, version: &str) -> Result<StoredObject> {
        let (old, new) = {
            let mut current = self
                .objects
                .get_mut(name)
                .ok_or_else(|| Error::NotFound { key: name.to_string() })?;
            if current.version != version {
                return Err(Error::Conflict { key: name.to_string() });
            }
            let old = current.clone();
            current.version = self.next_version();
            current.data.extend(data);
            (old, current.clone())
        };
        self.notify(ObjectEvent::Updated { old, new: new.clone() });
        Ok(new)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if let Some((_, removed)) = self.objects.remove(name) {
            self.notify(ObjectEvent::Deleted(removed));
        }
        Ok(())
    }

    async fn watch(&self, names: Vec<String>) -> Result<mpsc::UnboundedReceiver<ObjectEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(Watcher { names, tx });
        Ok(rx)
    }
}

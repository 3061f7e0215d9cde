use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Synchronous string key/value storage, the shape of the Web Storage API.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str);
}

/// Notification delivered to the *other* contexts sharing a storage area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// `None` when the whole area was cleared
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Context that made the change
    pub source: Uuid,
}

#[derive(Debug, Default)]
struct Items {
    entries: BTreeMap<String, String>,
    quota_bytes: Option<usize>,
}

impl Items {
    fn check_quota(&self, key: &str, value: &str) -> Result<()> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };
        let used: usize = self
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        if used + key.len() + value.len() > quota {
            bail!("storage quota of {} bytes exceeded writing '{}'", quota, key);
        }
        Ok(())
    }
}

fn lock(items: &Mutex<Items>) -> MutexGuard<'_, Items> {
    items.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Origin-wide `localStorage`: one area shared by every context (tab) that
/// opens it.
#[derive(Clone)]
pub struct StorageArea {
    items: Arc<Mutex<Items>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Default for StorageArea {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageArea {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { items: Arc::new(Mutex::new(Items::default())), events }
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        let area = Self::new();
        lock(&area.items).quota_bytes = Some(quota_bytes);
        area
    }

    /// Opens a handle for a new browsing context.
    pub fn open(&self) -> LocalStorage {
        LocalStorage { area: self.clone(), context: Uuid::new_v4() }
    }

    fn publish(&self, event: StorageEvent) {
        // No receiver simply means no other context is listening.
        let _ = self.events.send(event);
    }
}

/// One context's view of a [`StorageArea`].
#[derive(Clone)]
pub struct LocalStorage {
    area: StorageArea,
    context: Uuid,
}

impl LocalStorage {
    pub fn context(&self) -> Uuid {
        self.context
    }

    /// Storage changes made by other contexts. Subscribe before the changes
    /// you want to see.
    pub fn subscribe(&self) -> StorageEvents {
        StorageEvents { receiver: self.area.events.subscribe(), context: self.context }
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.area.items).entries.keys().cloned().collect()
    }

    pub fn clear(&self) {
        let had_entries = {
            let mut items = lock(&self.area.items);
            let had_entries = !items.entries.is_empty();
            items.entries.clear();
            had_entries
        };
        if had_entries {
            self.area.publish(StorageEvent {
                key: None,
                old_value: None,
                new_value: None,
                source: self.context,
            });
        }
    }
}

impl KeyValueStore for LocalStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        lock(&self.area.items).entries.get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let old_value = {
            let mut items = lock(&self.area.items);
            items.check_quota(key, value)?;
            items.entries.insert(key.to_string(), value.to_string())
        };
        if old_value.as_deref() != Some(value) {
            self.area.publish(StorageEvent {
                key: Some(key.to_string()),
                old_value,
                new_value: Some(value.to_string()),
                source: self.context,
            });
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        let old_value = lock(&self.area.items).entries.remove(key);
        if old_value.is_some() {
            self.area.publish(StorageEvent {
                key: Some(key.to_string()),
                old_value,
                new_value: None,
                source: self.context,
            });
        }
    }
}

/// Receiver of storage events, skipping the owning context's own writes.
pub struct StorageEvents {
    receiver: broadcast::Receiver<StorageEvent>,
    context: Uuid,
}

impl StorageEvents {
    /// Next pending event without waiting.
    pub fn try_next(&mut self) -> Option<StorageEvent> {
        use broadcast::error::TryRecvError;
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.source == self.context => continue,
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Storage events dropped, consumer lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub async fn next(&mut self) -> Option<StorageEvent> {
        use broadcast::error::RecvError;
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.source == self.context => continue,
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Storage events dropped, consumer lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Per-context storage without change events, the shape of `sessionStorage`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<Items>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: Mutex::new(Items { entries: BTreeMap::new(), quota_bytes: Some(quota_bytes) }),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Option<String> {
        lock(&self.items).entries.get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = lock(&self.items);
        items.check_quota(key, value)?;
        items.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        lock(&self.items).entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_share_items_but_not_their_own_events() {
        let area = StorageArea::new();
        let first = area.open();
        let second = area.open();
        let mut first_events = first.subscribe();
        let mut second_events = second.subscribe();

        first.set_item("k", "v").unwrap();
        assert_eq!(second.get_item("k").as_deref(), Some("v"));
        assert_eq!(first_events.try_next(), None);

        let event = second_events.try_next().unwrap();
        assert_eq!(event.key.as_deref(), Some("k"));
        assert_eq!(event.old_value, None);
        assert_eq!(event.new_value.as_deref(), Some("v"));
        assert_eq!(event.source, first.context());
    }

    #[test]
    fn unchanged_writes_and_missing_removals_are_silent() {
        let area = StorageArea::new();
        let writer = area.open();
        let mut events = area.open().subscribe();
        writer.set_item("k", "v").unwrap();
        writer.set_item("k", "v").unwrap();
        writer.remove_item("absent");
        writer.remove_item("k");
        let seen: Vec<Option<String>> =
            std::iter::from_fn(|| events.try_next()).map(|e| e.new_value).collect();
        assert_eq!(seen, vec![Some("v".to_string()), None]);
    }

    #[test]
    fn clear_emits_keyless_event() {
        let area = StorageArea::new();
        let writer = area.open();
        let mut events = area.open().subscribe();
        writer.set_item("a", "1").unwrap();
        writer.clear();
        writer.clear();
        assert!(events.try_next().is_some());
        assert_eq!(events.try_next().map(|e| e.key), Some(None));
        assert_eq!(events.try_next(), None);
        assert!(writer.keys().is_empty());
    }

    #[test]
    fn quota_rejects_oversized_writes() {
        let area = StorageArea::with_quota(8);
        let storage = area.open();
        storage.set_item("ab", "cdef").unwrap();
        storage.set_item("ab", "cdefgh").unwrap();
        let err = storage.set_item("xyz", "1").unwrap_err();
        assert!(err.to_string().contains("quota"));
        assert_eq!(storage.get_item("xyz"), None);

        let session = MemoryStore::with_quota(4);
        assert!(session.set_item("key", "value").is_err());
        assert!(session.set_item("k", "v").is_ok());
    }

    #[tokio::test]
    async fn async_receiver_skips_own_writes() {
        let area = StorageArea::new();
        let mine = area.open();
        let theirs = area.open();
        let mut events = mine.subscribe();
        mine.set_item("own", "1").unwrap();
        theirs.set_item("other", "2").unwrap();
        let event = events.next().await.unwrap();
        assert_eq!(event.key.as_deref(), Some("other"));
    }
}

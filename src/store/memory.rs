//! In-memory backing store

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::{glob_to_regex, BackingStore, StoreError, StoreMessage, Subscription};

type ChannelRegistry = HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<StoreMessage>>>;

#[derive(Debug, Clone)]
struct StoredValue {
  value: String,
  expires_at: Option<Instant>,
}

impl StoredValue {
  /// A TTL too large to represent never expires
  fn new(value: &str, ttl: Duration) -> Self {
    Self {
      value: value.to_string(),
      expires_at: Instant::now().checked_add(ttl),
    }
  }

  fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|at| Instant::now() >= at)
      .unwrap_or(false)
  }
}

/// Process-local [`BackingStore`].
///
/// Expired keys read as absent and are purged lazily on access, or in bulk by
/// [`InMemoryStore::evict_expired`]. Pub/sub fans out to every live subscription
/// on the channel.
pub struct InMemoryStore {
  data: RwLock<HashMap<String, StoredValue>>,
  channels: Arc<RwLock<ChannelRegistry>>,
  hits: AtomicU64,
  misses: AtomicU64,
  expired: AtomicU64,
  published: AtomicU64,
}

impl Default for InMemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self {
      data: RwLock::new(HashMap::new()),
      channels: Arc::new(RwLock::new(HashMap::new())),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      expired: AtomicU64::new(0),
      published: AtomicU64::new(0),
    }
  }

  /// Remove every expired key, returning how many were purged
  pub fn evict_expired(&self) -> usize {
    let mut data = self.data.write();
    let before = data.len();
    data.retain(|_, stored| !stored.is_expired());
    let count = before - data.len();
    self.expired.fetch_add(count as u64, Ordering::Relaxed);
    count
  }

  /// Number of live subscriptions on a channel
  pub fn subscriber_count(&self, channel: &str) -> usize {
    self
      .channels
      .read()
      .get(channel)
      .map(|subs| subs.len())
      .unwrap_or(0)
  }

  fn live_key_count(&self) -> usize {
    self.data.read().values().filter(|v| !v.is_expired()).count()
  }
}

#[async_trait]
impl BackingStore for InMemoryStore {
  async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let mut data = self.data.write();

    match data.get(key) {
      Some(stored) if !stored.is_expired() => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        return Ok(Some(stored.value.clone()));
      }
      Some(_) => {}
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        return Ok(None);
      }
    }

    // Expired: purge on access
    data.remove(key);
    self.expired.fetch_add(1, Ordering::Relaxed);
    self.misses.fetch_add(1, Ordering::Relaxed);
    Ok(None)
  }

  async fn set_with_expiry(
    &self,
    key: &str,
    value: &str,
    ttl: Duration,
  ) -> Result<(), StoreError> {
    self
      .data
      .write()
      .insert(key.to_string(), StoredValue::new(value, ttl));
    Ok(())
  }

  async fn set_if_absent_with_expiry(
    &self,
    key: &str,
    value: &str,
    ttl: Duration,
  ) -> Result<bool, StoreError> {
    let mut data = self.data.write();
    if data.get(key).is_some_and(|stored| !stored.is_expired()) {
      return Ok(false);
    }
    data.insert(key.to_string(), StoredValue::new(value, ttl));
    Ok(true)
  }

  async fn delete(&self, key: &str) -> Result<u64, StoreError> {
    let removed = self.data.write().remove(key);
    Ok(match removed {
      Some(stored) if !stored.is_expired() => 1,
      _ => 0,
    })
  }

  async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
    let mut data = self.data.write();
    let removed = keys
      .iter()
      .filter_map(|key| data.remove(key))
      .filter(|stored| !stored.is_expired())
      .count();
    Ok(removed as u64)
  }

  async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
    let regex = glob_to_regex(pattern)?;
    let data = self.data.read();
    Ok(
      data
        .iter()
        .filter(|(k, v)| !v.is_expired() && regex.is_match(k))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }

  async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError> {
    let channels = self.channels.read();
    let Some(subscribers) = channels.get(channel) else {
      return Ok(0);
    };

    let mut delivered = 0;
    for sender in subscribers.values() {
      let msg = StoreMessage {
        channel: channel.to_string(),
        payload: message.to_string(),
      };
      if sender.send(msg).is_ok() {
        delivered += 1;
      }
    }
    self.published.fetch_add(1, Ordering::Relaxed);
    Ok(delivered)
  }

  async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();

    self
      .channels
      .write()
      .entry(channel.to_string())
      .or_default()
      .insert(id, tx);

    let messages = stream::unfold(rx, |mut rx| async move {
      rx.recv().await.map(|msg| (msg, rx))
    });

    let registry = self.channels.clone();
    let name = channel.to_string();
    let on_cancel = move || {
      let mut channels = registry.write();
      if let Some(subscribers) = channels.get_mut(&name) {
        subscribers.remove(&id);
        if subscribers.is_empty() {
          channels.remove(&name);
        }
      }
    };

    Ok(Subscription::new(channel, messages, on_cancel))
  }

  async fn info(&self) -> Result<BTreeMap<String, String>, StoreError> {
    let mut info = BTreeMap::new();
    info.insert("backend".to_string(), "memory".to_string());
    info.insert("keys".to_string(), self.live_key_count().to_string());
    info.insert(
      "keyspace_hits".to_string(),
      self.hits.load(Ordering::Relaxed).to_string(),
    );
    info.insert(
      "keyspace_misses".to_string(),
      self.misses.load(Ordering::Relaxed).to_string(),
    );
    info.insert(
      "expired_keys".to_string(),
      self.expired.load(Ordering::Relaxed).to_string(),
    );
    info.insert(
      "pubsub_channels".to_string(),
      self.channels.read().len().to_string(),
    );
    info.insert(
      "published_messages".to_string(),
      self.published.load(Ordering::Relaxed).to_string(),
    );
    Ok(info)
  }
}

/// Periodically purge expired keys from an [`InMemoryStore`]
pub async fn run_expiration_task(store: Arc<InMemoryStore>, interval: Duration) {
  loop {
    tokio::time::sleep(interval).await;
    let expired = store.evict_expired();
    if expired > 0 {
      tracing::debug!("Evicted {} expired keys", expired);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_set_and_get() {
    let store = InMemoryStore::new();
    store
      .set_with_expiry("page:home", "<h1>hi</h1>", Duration::from_secs(60))
      .await
      .unwrap();

    assert_eq!(
      store.get("page:home").await.unwrap().as_deref(),
      Some("<h1>hi</h1>")
    );
    assert_eq!(store.get("page:missing").await.unwrap(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_key_reads_absent() {
    let store = InMemoryStore::new();
    store
      .set_with_expiry("k", "v", Duration::from_millis(50))
      .await
      .unwrap();

    tokio::time::advance(Duration::from_millis(60)).await;
    assert_eq!(store.get("k").await.unwrap(), None);

    let info = store.info().await.unwrap();
    assert_eq!(info.get("expired_keys").map(String::as_str), Some("1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_set_if_absent() {
    let store = InMemoryStore::new();
    let ttl = Duration::from_millis(100);

    assert!(store.set_if_absent_with_expiry("lock:a", "locked", ttl).await.unwrap());
    assert!(!store.set_if_absent_with_expiry("lock:a", "locked", ttl).await.unwrap());

    // An expired marker no longer blocks acquisition
    tokio::time::advance(Duration::from_millis(150)).await;
    assert!(store.set_if_absent_with_expiry("lock:a", "locked", ttl).await.unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn test_unbounded_ttl_never_expires() {
    let store = InMemoryStore::new();
    store.set_with_expiry("k", "v", Duration::MAX).await.unwrap();
    assert!(!store
      .set_if_absent_with_expiry("k", "other", Duration::MAX)
      .await
      .unwrap());

    tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    assert_eq!(store.evict_expired(), 0);
  }

  #[tokio::test]
  async fn test_delete_and_delete_many() {
    let store = InMemoryStore::new();
    let ttl = Duration::from_secs(60);
    for key in ["a", "b", "c"] {
      store.set_with_expiry(key, "x", ttl).await.unwrap();
    }

    assert_eq!(store.delete("a").await.unwrap(), 1);
    assert_eq!(store.delete("a").await.unwrap(), 0);

    let keys = vec!["b".to_string(), "c".to_string(), "zzz".to_string()];
    assert_eq!(store.delete_many(&keys).await.unwrap(), 2);
    assert!(store.list_keys("*").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_list_keys_pattern() {
    let store = InMemoryStore::new();
    let ttl = Duration::from_secs(60);
    store.set_with_expiry("page:home", "x", ttl).await.unwrap();
    store.set_with_expiry("page:about", "x", ttl).await.unwrap();
    store.set_with_expiry("lock:page:home", "locked", ttl).await.unwrap();

    let mut keys = store.list_keys("page:*").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["page:about", "page:home"]);
    assert_eq!(store.list_keys("*").await.unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_publish_fans_out() {
    let store = InMemoryStore::new();
    let mut first = store.subscribe("cache:a").await.unwrap();
    let mut second = store.subscribe("cache:a").await.unwrap();
    let _other = store.subscribe("cache:b").await.unwrap();

    assert_eq!(store.publish("cache:a", "hello").await.unwrap(), 2);

    let msg = first.next().await.unwrap();
    assert_eq!(msg.channel, "cache:a");
    assert_eq!(msg.payload, "hello");
    assert_eq!(second.next().await.unwrap().payload, "hello");
  }

  #[tokio::test]
  async fn test_cancel_releases_channel() {
    let store = InMemoryStore::new();
    let mut sub = store.subscribe("cache:a").await.unwrap();
    assert_eq!(store.subscriber_count("cache:a"), 1);

    sub.cancel();
    assert_eq!(store.subscriber_count("cache:a"), 0);
    assert_eq!(store.publish("cache:a", "hello").await.unwrap(), 0);

    let dropped = store.subscribe("cache:a").await.unwrap();
    drop(dropped);
    assert_eq!(store.subscriber_count("cache:a"), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_evict_expired() {
    let store = InMemoryStore::new();
    store
      .set_with_expiry("short", "x", Duration::from_millis(10))
      .await
      .unwrap();
    store
      .set_with_expiry("long", "x", Duration::from_secs(60))
      .await
      .unwrap();

    tokio::time::advance(Duration::from_millis(20)).await;
    assert_eq!(store.evict_expired(), 1);
    assert_eq!(store.list_keys("*").await.unwrap(), vec!["long"]);
  }
}

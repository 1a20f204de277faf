//! Administrative queries over cached entries

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::entry::{decode_or_warn, CacheEntry};
use crate::store::{BackingStore, StoreError};

const LOCK_PREFIX: &str = "lock:";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyListing {
  pub keys: Vec<String>,
  /// Union of every listed entry's tags, sorted and deduplicated
  pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  pub total_keys: usize,
  pub store_info: BTreeMap<String, String>,
}

/// Read and delete operations for operators. Lock keys are never listed or
/// deleted through this layer.
#[derive(Clone)]
pub struct CacheAdmin {
  store: Arc<dyn BackingStore>,
}

impl CacheAdmin {
  pub fn new(store: Arc<dyn BackingStore>) -> Self {
    Self { store }
  }

  async fn entry_keys(&self) -> Result<Vec<String>, StoreError> {
    let mut keys: Vec<String> = self
      .store
      .list_keys("*")
      .await?
      .into_iter()
      .filter(|k| !k.starts_with(LOCK_PREFIX))
      .collect();
    keys.sort();
    Ok(keys)
  }

  /// Every cached entry alongside its key. Keys that vanish or fail to decode
  /// between listing and reading are skipped.
  async fn entries(&self) -> Result<Vec<(String, CacheEntry)>, StoreError> {
    let mut entries = Vec::new();
    for key in self.entry_keys().await? {
      if let Some(entry) = self.get_entry(&key).await? {
        entries.push((key, entry));
      }
    }
    Ok(entries)
  }

  pub async fn list_keys(&self) -> Result<KeyListing, StoreError> {
    let entries = self.entries().await?;
    let tags: BTreeSet<String> = entries
      .iter()
      .flat_map(|(_, entry)| entry.tags.iter().cloned())
      .collect();

    Ok(KeyListing {
      keys: entries.into_iter().map(|(key, _)| key).collect(),
      tags: tags.into_iter().collect(),
    })
  }

  pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    Ok(
      self
        .store
        .get(key)
        .await?
        .and_then(|raw| decode_or_warn(key, &raw)),
    )
  }

  pub async fn delete_entry(&self, key: &str) -> Result<u64, StoreError> {
    let deleted = self.store.delete(key).await?;
    tracing::info!(key = %key, deleted, "Deleted cache entry");
    Ok(deleted)
  }

  /// Delete every entry carrying at least one of `tags`
  pub async fn delete_by_tags(&self, tags: &[String]) -> Result<u64, StoreError> {
    if tags.is_empty() {
      return Ok(0);
    }

    let doomed: Vec<String> = self
      .entries()
      .await?
      .into_iter()
      .filter(|(_, entry)| entry.has_any_tag(tags))
      .map(|(key, _)| key)
      .collect();

    let deleted = self.store.delete_many(&doomed).await?;
    tracing::info!(?tags, deleted, "Deleted cache entries by tag");
    Ok(deleted)
  }

  /// Delete every non-lock key
  pub async fn clear_all(&self) -> Result<u64, StoreError> {
    let keys = self.entry_keys().await?;
    let deleted = self.store.delete_many(&keys).await?;
    tracing::info!(deleted, "Cleared render cache");
    Ok(deleted)
  }

  pub async fn get_stats(&self) -> Result<CacheStats, StoreError> {
    Ok(CacheStats {
      total_keys: self.entry_keys().await?.len(),
      store_info: self.store.info().await?,
    })
  }
}

//! Per-key distributed lock built on set-if-absent

use std::sync::Arc;
use std::time::Duration;

use crate::store::{BackingStore, StoreError};

const LOCK_MARKER: &str = "locked";

pub fn lock_key(key: &str) -> String {
  format!("lock:{}", key)
}

/// Acquires TTL-bounded locks. No reentrancy and no ownership tokens: whoever
/// holds a guard with `acquired == true` may release it, and an expired lock can
/// be taken over by the next caller.
#[derive(Clone)]
pub struct LockManager {
  store: Arc<dyn BackingStore>,
}

impl LockManager {
  pub fn new(store: Arc<dyn BackingStore>) -> Self {
    Self { store }
  }

  pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, StoreError> {
    let lock_key = lock_key(key);
    let acquired = self
      .store
      .set_if_absent_with_expiry(&lock_key, LOCK_MARKER, ttl)
      .await?;

    tracing::debug!(lock = %lock_key, acquired, "lock attempt");

    Ok(LockGuard {
      acquired,
      lock_key,
      store: self.store.clone(),
    })
  }
}

/// Outcome of a lock attempt
pub struct LockGuard {
  acquired: bool,
  lock_key: String,
  store: Arc<dyn BackingStore>,
}

impl LockGuard {
  pub fn acquired(&self) -> bool {
    self.acquired
  }

  pub fn lock_key(&self) -> &str {
    &self.lock_key
  }

  /// Delete the lock key. Does not touch the store when the lock was not acquired.
  pub async fn release(&self) -> Result<(), StoreError> {
    if !self.acquired {
      return Ok(());
    }
    self.store.delete(&self.lock_key).await?;
    tracing::debug!(lock = %self.lock_key, "lock released");
    Ok(())
  }
}

impl std::fmt::Debug for LockGuard {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LockGuard")
      .field("acquired", &self.acquired)
      .field("lock_key", &self.lock_key)
      .finish()
  }
}

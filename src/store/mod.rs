//! Backing store contract
//!
//! The coordinator only ever talks to a shared key-value service through
//! [`BackingStore`]. Two adapters ship with the crate:
//! - [`InMemoryStore`]: process-local, used by tests and the daemon's `memory` backend
//! - [`RedisStore`]: a shared Redis server (requires the `redis` feature)

mod memory;
#[cfg(feature = "redis")]
mod redis;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub use memory::{run_expiration_task, InMemoryStore};
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Store operation error
#[derive(Debug, Clone, Error)]
pub enum StoreError {
  /// The store is unreachable or rejected the command
  #[error("backing store unavailable: {0}")]
  Unavailable(String),
  /// A key pattern could not be compiled
  #[error("invalid key pattern: {0}")]
  InvalidPattern(String),
}

impl StoreError {
  pub fn unavailable(msg: impl std::fmt::Display) -> Self {
    StoreError::Unavailable(msg.to_string())
  }
}

/// A message delivered on a pub/sub channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
  pub channel: String,
  pub payload: String,
}

/// Cancellable handle over one channel subscription.
///
/// Messages are pulled with [`Subscription::next`]. Calling [`Subscription::cancel`]
/// (or dropping the handle) stops delivery and releases the channel on the store.
pub struct Subscription {
  channel: String,
  messages: BoxStream<'static, StoreMessage>,
  on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
  pub fn new<S, F>(channel: impl Into<String>, messages: S, on_cancel: F) -> Self
  where
    S: futures_util::Stream<Item = StoreMessage> + Send + 'static,
    F: FnOnce() + Send + 'static,
  {
    Self {
      channel: channel.into(),
      messages: messages.boxed(),
      on_cancel: Some(Box::new(on_cancel)),
    }
  }

  pub fn channel(&self) -> &str {
    &self.channel
  }

  /// Next message, or `None` once the subscription is cancelled or the store
  /// closed the channel.
  pub async fn next(&mut self) -> Option<StoreMessage> {
    self.messages.next().await
  }

  pub fn is_cancelled(&self) -> bool {
    self.on_cancel.is_none()
  }

  /// Stop delivery and release the channel. Idempotent.
  pub fn cancel(&mut self) {
    if let Some(on_cancel) = self.on_cancel.take() {
      self.messages = stream::empty().boxed();
      on_cancel();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.cancel();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("channel", &self.channel)
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

/// Key-value + pub/sub service shared by every worker.
///
/// All operations may fail with [`StoreError::Unavailable`]; callers decide whether
/// to retry.
#[async_trait]
pub trait BackingStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

  /// Unconditional overwrite; resets the expiry.
  async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), StoreError>;

  /// Atomic set-if-absent. Returns true only when the key did not exist.
  async fn set_if_absent_with_expiry(
    &self,
    key: &str,
    value: &str,
    ttl: Duration,
  ) -> Result<bool, StoreError>;

  /// Returns the number of keys removed (0 or 1)
  async fn delete(&self, key: &str) -> Result<u64, StoreError>;

  async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
    let mut removed = 0;
    for key in keys {
      removed += self.delete(key).await?;
    }
    Ok(removed)
  }

  /// Glob-style enumeration (`*` and `?`)
  async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

  /// Returns the number of subscribers that received the message
  async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError>;

  async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

  /// Store-native statistics as flat key/value pairs
  async fn info(&self) -> Result<BTreeMap<String, String>, StoreError>;
}

/// Convert a glob pattern to a regex
pub(crate) fn glob_to_regex(pattern: &str) -> Result<regex::Regex, StoreError> {
  let mut regex_str = String::with_capacity(pattern.len() * 2);
  regex_str.push('^');

  for c in pattern.chars() {
    match c {
      '*' => regex_str.push_str(".*"),
      '?' => regex_str.push('.'),
      c => regex_str.push_str(&regex::escape(&c.to_string())),
    }
  }

  regex_str.push('$');
  regex::Regex::new(&regex_str).map_err(|e| StoreError::InvalidPattern(e.to_string()))
}

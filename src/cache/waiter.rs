//! Wait for another worker's in-flight production

use std::sync::Arc;
use std::time::Duration;

use super::entry::{decode_or_warn, CacheEntry};
use crate::store::{BackingStore, StoreError};

pub fn channel_name(key: &str) -> String {
  format!("cache:{}", key)
}

/// Resolves when a fresher entry for a key shows up, or gives up after a deadline.
#[derive(Clone)]
pub struct NotificationWaiter {
  store: Arc<dyn BackingStore>,
}

impl NotificationWaiter {
  pub fn new(store: Arc<dyn BackingStore>) -> Self {
    Self { store }
  }

  /// Subscribe to the key's channel and race three outcomes:
  /// - `max_wait` elapses: `Ok(None)`
  /// - a published entry decodes: that entry
  /// - a single re-read of the store finds an entry newer than `fallback`
  ///
  /// The subscription is cancelled whichever outcome wins.
  pub async fn wait(
    &self,
    key: &str,
    fallback: Option<&CacheEntry>,
    max_wait: Duration,
  ) -> Result<Option<CacheEntry>, StoreError> {
    let channel = channel_name(key);
    let mut subscription = self.store.subscribe(&channel).await?;

    let baseline = fallback.map(|entry| entry.created_at);
    let reread = async {
      match self.store.get(key).await {
        Ok(Some(raw)) => {
          if let Some(entry) = decode_or_warn(key, &raw) {
            if baseline.map_or(true, |at| entry.created_at > at) {
              return entry;
            }
          }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(key = %key, "Re-read while waiting failed: {}", e),
      }
      // Lost the race; leave it to the channel or the timer
      std::future::pending::<CacheEntry>().await
    };
    tokio::pin!(reread);

    let deadline = tokio::time::sleep(max_wait);
    tokio::pin!(deadline);

    let outcome = loop {
      tokio::select! {
        _ = &mut deadline => break Ok(None),
        entry = &mut reread => break Ok(Some(entry)),
        msg = subscription.next() => match msg {
          Some(msg) => {
            if let Some(entry) = decode_or_warn(key, &msg.payload) {
              break Ok(Some(entry));
            }
          }
          None => {
            break Err(StoreError::unavailable(format!(
              "subscription to {} closed",
              channel
            )))
          }
        },
      }
    };

    subscription.cancel();
    outcome
  }
}

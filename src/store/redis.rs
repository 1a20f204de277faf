//! Redis backing store

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, RedisError};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{BackingStore, StoreError, StoreMessage, Subscription};

impl From<RedisError> for StoreError {
  fn from(e: RedisError) -> Self {
    StoreError::unavailable(e)
  }
}

/// [`BackingStore`] over a shared Redis server.
///
/// Commands go through a [`ConnectionManager`], which reconnects on failure.
/// Every subscription opens its own pub/sub connection since Redis does not
/// allow regular commands on a subscribed connection.
pub struct RedisStore {
  client: Client,
  connection: ConnectionManager,
}

impl RedisStore {
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let client = Client::open(url)?;
    let connection = ConnectionManager::new(client.clone()).await?;
    Ok(Self { client, connection })
  }

  /// Round-trip a PING to verify the server is reachable
  pub async fn ping(&self) -> Result<(), StoreError> {
    let mut conn = self.connection.clone();
    ::redis::cmd("PING").query_async::<()>(&mut conn).await?;
    Ok(())
  }
}

/// Redis rejects `PX 0` and expiries past `i64::MAX` milliseconds
fn ttl_millis(ttl: Duration) -> u64 {
  i64::try_from(ttl.as_millis()).map_or(i64::MAX as u64, |ms| ms as u64).max(1)
}

/// Parse `INFO` output: `key:value` lines, `#` section headers skipped
fn parse_info(raw: &str) -> BTreeMap<String, String> {
  raw
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty() && !line.starts_with('#'))
    .filter_map(|line| line.split_once(':'))
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[async_trait]
impl BackingStore for RedisStore {
  async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let mut conn = self.connection.clone();
    Ok(conn.get(key).await?)
  }

  async fn set_with_expiry(
    &self,
    key: &str,
    value: &str,
    ttl: Duration,
  ) -> Result<(), StoreError> {
    let mut conn = self.connection.clone();
    ::redis::cmd("SET")
      .arg(key)
      .arg(value)
      .arg("PX")
      .arg(ttl_millis(ttl))
      .query_async::<()>(&mut conn)
      .await?;
    Ok(())
  }

  async fn set_if_absent_with_expiry(
    &self,
    key: &str,
    value: &str,
    ttl: Duration,
  ) -> Result<bool, StoreError> {
    let mut conn = self.connection.clone();
    // Nil reply when the key already exists
    let reply: Option<String> = ::redis::cmd("SET")
      .arg(key)
      .arg(value)
      .arg("NX")
      .arg("PX")
      .arg(ttl_millis(ttl))
      .query_async(&mut conn)
      .await?;
    Ok(reply.is_some())
  }

  async fn delete(&self, key: &str) -> Result<u64, StoreError> {
    let mut conn = self.connection.clone();
    Ok(conn.del(key).await?)
  }

  async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
    if keys.is_empty() {
      return Ok(0);
    }
    let mut conn = self.connection.clone();
    Ok(conn.del(keys.to_vec()).await?)
  }

  async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
    let mut conn = self.connection.clone();
    Ok(conn.keys(pattern).await?)
  }

  async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError> {
    let mut conn = self.connection.clone();
    Ok(conn.publish(channel, message).await?)
  }

  async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
    let mut pubsub = self.client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;

    let messages = pubsub.into_on_message().filter_map(|msg| async move {
      match msg.get_payload::<String>() {
        Ok(payload) => Some(StoreMessage {
          channel: msg.get_channel_name().to_string(),
          payload,
        }),
        Err(e) => {
          tracing::warn!("Dropping non-UTF-8 pub/sub payload: {}", e);
          None
        }
      }
    });

    // Dropping the stream closes the dedicated connection
    let name = channel.to_string();
    Ok(Subscription::new(channel, messages, move || {
      tracing::trace!(channel = %name, "pub/sub connection released");
    }))
  }

  async fn info(&self) -> Result<BTreeMap<String, String>, StoreError> {
    let mut conn = self.connection.clone();
    let raw: String = ::redis::cmd("INFO").query_async(&mut conn).await?;
    let dbsize: u64 = ::redis::cmd("DBSIZE").query_async(&mut conn).await?;

    let mut info = parse_info(&raw);
    info.insert("backend".to_string(), "redis".to_string());
    info.insert("keys".to_string(), dbsize.to_string());
    Ok(info)
  }
}

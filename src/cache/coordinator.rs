//! Two-tier TTL render coordination
//!
//! Every call reads the stored entry and decides between:
//! - fresh hit: age within the soft TTL, return it
//! - soft-expired: return the stale payload, refresh in the background if the
//!   key's lock is free
//! - hard-expired or absent: produce under the key's lock, or wait for whoever
//!   holds it to publish a fresher entry

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::Instrument;

use super::entry::{decode_or_warn, encode, CacheEntry};
use super::lock::{LockGuard, LockManager};
use super::waiter::{channel_name, NotificationWaiter};
use crate::clock::{Clock, SystemClock};
use crate::store::{BackingStore, StoreError};

const REFRESH_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum RenderError {
  #[error("timed out after {waited:?} waiting for '{key}' to be produced elsewhere")]
  ProductionTimeout { key: String, waited: Duration },

  #[error("producing '{key}' failed: {source}")]
  Production {
    key: String,
    #[source]
    source: anyhow::Error,
  },

  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Outcome of a background refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
  Refreshed { key: String, created_at: i64 },
  Failed { key: String, error: String },
}

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
  /// Expiry of the per-key production lock
  pub lock_ttl: Duration,
  /// How long a caller waits for another worker's production
  pub max_wait: Duration,
  pub default_soft_ttl: Duration,
  pub default_hard_ttl: Duration,
}

impl Default for CoordinatorConfig {
  fn default() -> Self {
    Self {
      lock_ttl: Duration::from_secs(5),
      max_wait: Duration::from_secs(5),
      default_soft_ttl: Duration::from_secs(1),
      default_hard_ttl: Duration::from_secs(1),
    }
  }
}

/// A single render call. Unset TTLs fall back to the coordinator defaults.
#[derive(Debug, Clone)]
pub struct RenderRequest {
  key: String,
  hard_ttl: Option<Duration>,
  soft_ttl: Option<Duration>,
  tags: Vec<String>,
}

impl RenderRequest {
  pub fn new(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      hard_ttl: None,
      soft_ttl: None,
      tags: Vec::new(),
    }
  }

  pub fn hard_ttl(mut self, ttl: Duration) -> Self {
    self.hard_ttl = Some(ttl);
    self
  }

  pub fn soft_ttl(mut self, ttl: Duration) -> Self {
    self.soft_ttl = Some(ttl);
    self
  }

  pub fn tags<I, S>(mut self, tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.tags = tags.into_iter().map(Into::into).collect();
    self
  }

  pub fn key(&self) -> &str {
    &self.key
  }
}

/// Request with TTLs resolved against the defaults
struct ResolvedRequest {
  key: String,
  hard_ttl: Duration,
  soft_ttl: Duration,
  tags: Vec<String>,
}

fn is_older_than(entry: &CacheEntry, now: i64, ttl: Duration) -> bool {
  entry.age_millis(now) > i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Stampede-safe render cache over a shared [`BackingStore`].
///
/// Cheap to clone; clones share the store, clock and refresh event channel.
#[derive(Clone)]
pub struct CacheCoordinator {
  store: Arc<dyn BackingStore>,
  locks: LockManager,
  waiter: NotificationWaiter,
  clock: Arc<dyn Clock>,
  config: CoordinatorConfig,
  refresh_tx: broadcast::Sender<RefreshEvent>,
}

impl CacheCoordinator {
  pub fn new(store: Arc<dyn BackingStore>, config: CoordinatorConfig) -> Self {
    let (refresh_tx, _) = broadcast::channel(REFRESH_EVENT_CAPACITY);
    Self {
      locks: LockManager::new(store.clone()),
      waiter: NotificationWaiter::new(store.clone()),
      store,
      clock: Arc::new(SystemClock),
      config,
      refresh_tx,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn config(&self) -> &CoordinatorConfig {
    &self.config
  }

  /// Subscribe to background refresh outcomes
  pub fn refresh_events(&self) -> broadcast::Receiver<RefreshEvent> {
    self.refresh_tx.subscribe()
  }

  /// Return the cached payload for `request`, producing it with `produce` when
  /// needed.
  ///
  /// `produce` runs at most once per call, either inline (hard-expired path) or
  /// on a detached task (soft-expired path).
  ///
  /// Dropping the returned future while it holds the key's lock leaves the lock
  /// in place until `lock_ttl` expires it.
  pub async fn render<F, Fut>(&self, request: RenderRequest, produce: F) -> Result<String, RenderError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
  {
    let request = self.resolve(request);
    if request.soft_ttl > request.hard_ttl {
      tracing::debug!(
        key = %request.key,
        "soft TTL {:?} exceeds hard TTL {:?}; entries hard-expire first",
        request.soft_ttl,
        request.hard_ttl
      );
    }

    let current = self
      .store
      .get(&request.key)
      .await?
      .and_then(|raw| decode_or_warn(&request.key, &raw));
    let now = self.clock.now_millis();

    match current {
      Some(entry) if !is_older_than(&entry, now, request.hard_ttl) => {
        if is_older_than(&entry, now, request.soft_ttl) {
          self.serve_stale(request, entry, produce).await
        } else {
          tracing::debug!(key = %request.key, "fresh hit");
          Ok(entry.payload)
        }
      }
      expired => self.render_hard(request, expired, produce).await,
    }
  }

  fn resolve(&self, request: RenderRequest) -> ResolvedRequest {
    ResolvedRequest {
      hard_ttl: request.hard_ttl.unwrap_or(self.config.default_hard_ttl),
      soft_ttl: request.soft_ttl.unwrap_or(self.config.default_soft_ttl),
      key: request.key,
      tags: request.tags,
    }
  }

  /// `baseline` is the entry read before the lock attempt (hard-expired or
  /// absent). Anything stored after that read, even before the waiter
  /// subscribes, counts as newer.
  async fn render_hard<F, Fut>(
    &self,
    request: ResolvedRequest,
    baseline: Option<CacheEntry>,
    produce: F,
  ) -> Result<String, RenderError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
  {
    let guard = self.locks.acquire(&request.key, self.config.lock_ttl).await?;

    if guard.acquired() {
      let entry = self.produce_locked(&request, guard, produce).await?;
      return Ok(entry.payload);
    }

    tracing::debug!(key = %request.key, "production in flight elsewhere, waiting");
    match self
      .waiter
      .wait(&request.key, baseline.as_ref(), self.config.max_wait)
      .await?
    {
      Some(entry) => Ok(entry.payload),
      None => Err(RenderError::ProductionTimeout {
        key: request.key,
        waited: self.config.max_wait,
      }),
    }
  }

  async fn serve_stale<F, Fut>(
    &self,
    request: ResolvedRequest,
    stale: CacheEntry,
    produce: F,
  ) -> Result<String, RenderError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
  {
    let guard = self.locks.acquire(&request.key, self.config.lock_ttl).await?;
    if !guard.acquired() {
      tracing::debug!(key = %request.key, "stale hit, refresh already in flight");
      return Ok(stale.payload);
    }

    tracing::debug!(key = %request.key, "stale hit, refreshing in background");
    let span = tracing::info_span!("background_refresh", key = %request.key);
    let this = self.clone();
    tokio::spawn(
      async move {
        let event = match this.produce_locked(&request, guard, produce).await {
          Ok(entry) => RefreshEvent::Refreshed {
            key: request.key,
            created_at: entry.created_at,
          },
          Err(e) => {
            tracing::error!("Background refresh failed: {}", e);
            RefreshEvent::Failed {
              key: request.key,
              error: e.to_string(),
            }
          }
        };
        // No receivers is fine
        let _ = this.refresh_tx.send(event);
      }
      .instrument(span),
    );

    Ok(stale.payload)
  }

  /// Produce, persist and publish while holding `guard`, then release it.
  async fn produce_locked<F, Fut>(
    &self,
    request: &ResolvedRequest,
    guard: LockGuard,
    produce: F,
  ) -> Result<CacheEntry, RenderError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
  {
    let outcome = self.produce_and_store(request, produce).await;

    match (outcome, guard.release().await) {
      (Ok(entry), Ok(())) => Ok(entry),
      (Ok(_), Err(e)) => Err(RenderError::Store(e)),
      (Err(e), Err(release_err)) => {
        tracing::warn!(
          lock = %guard.lock_key(),
          "Lock release failed after unsuccessful production: {}",
          release_err
        );
        Err(e)
      }
      (Err(e), Ok(())) => Err(e),
    }
  }

  async fn produce_and_store<F, Fut>(
    &self,
    request: &ResolvedRequest,
    produce: F,
  ) -> Result<CacheEntry, RenderError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
  {
    let started = Instant::now();
    let payload = produce().await.map_err(|source| RenderError::Production {
      key: request.key.clone(),
      source,
    })?;

    let entry = CacheEntry::new(payload, self.clock.now_millis(), request.tags.clone());
    let encoded = encode(&entry);
    self
      .store
      .set_with_expiry(&request.key, &encoded, request.hard_ttl)
      .await?;
    let receivers = self
      .store
      .publish(&channel_name(&request.key), &encoded)
      .await?;

    tracing::info!(
      key = %request.key,
      receivers,
      "Produced entry in {:?}",
      started.elapsed()
    );
    Ok(entry)
  }
}

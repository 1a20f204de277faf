use std::sync::Arc;
use tokio::sync::broadcast;

use super::api::{router, AppState};
use crate::cache::CacheAdmin;
use crate::config::{BackendType, Config};
use crate::store::{run_expiration_task, BackingStore, InMemoryStore, RedisStore};

/// Connect the configured backing store. The memory backend also gets its
/// periodic expiry task.
pub async fn connect_store(config: &Config) -> Result<Arc<dyn BackingStore>, anyhow::Error> {
  match config.backend {
    BackendType::Redis => {
      let store = RedisStore::connect(&config.redis.url).await?;
      store.ping().await?;
      tracing::info!("Connected to Redis at {}", config.redis.url);
      Ok(Arc::new(store))
    }
    BackendType::Memory => {
      let store = Arc::new(InMemoryStore::new());
      tokio::spawn(run_expiration_task(
        store.clone(),
        config.expiration_interval(),
      ));
      tracing::warn!(
        "Using a process-local in-memory store (expiry sweep every {:?}); no render worker shares it, so the admin API will only see an empty cache",
        config.expiration_interval()
      );
      Ok(store)
    }
  }
}

pub struct Daemon {
  config: Config,
  store: Arc<dyn BackingStore>,
  shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
  pub fn new(config: Config, store: Arc<dyn BackingStore>) -> Self {
    let (shutdown_tx, _) = broadcast::channel(1);
    Self {
      config,
      store,
      shutdown_tx,
    }
  }

  /// Trigger graceful shutdown of the admin server
  pub fn shutdown(&self) {
    tracing::info!("Initiating graceful shutdown...");
    let _ = self.shutdown_tx.send(());
  }

  pub async fn run(&self) -> Result<(), anyhow::Error> {
    if self.config.auth.enabled && self.config.auth.api_token.is_none() {
      tracing::warn!("Auth is enabled but no api_token is configured; every admin request will be rejected");
    }

    let state = AppState {
      admin: CacheAdmin::new(self.store.clone()),
      auth: self.config.auth.clone(),
    };
    let app = router(state);

    let addr = self.config.address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Render cache admin API at http://{}/api/render-cache", addr);

    let mut shutdown_rx = self.shutdown_tx.subscribe();
    axum::serve(listener, app.into_make_service())
      .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
        tracing::info!("Admin server shutting down");
      })
      .await?;
    Ok(())
  }
}

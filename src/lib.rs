//! Stampede-safe, two-tier TTL render caching shared by many workers through a
//! key-value store with atomic conditional writes and publish/subscribe.
//!
//! ```ignore
//! let store = Arc::new(InMemoryStore::new());
//! let cache = CacheCoordinator::new(store, CoordinatorConfig::default());
//! let html = cache
//!   .render(
//!     RenderRequest::new("page:home")
//!       .hard_ttl(Duration::from_secs(60))
//!       .soft_ttl(Duration::from_secs(10)),
//!     || async { Ok(render_home().await?) },
//!   )
//!   .await?;
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod store;

// Admin HTTP API and daemon (only compiled with server feature)
#[cfg(feature = "server")]
pub mod server;

pub use cache::{
  CacheAdmin, CacheCoordinator, CacheEntry, CoordinatorConfig, RefreshEvent, RenderError,
  RenderRequest,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use store::{BackingStore, InMemoryStore, StoreError, Subscription};

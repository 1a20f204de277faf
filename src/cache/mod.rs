//! Render cache coordination

pub mod admin;
pub mod coordinator;
pub mod entry;
pub mod lock;
pub mod waiter;

pub use admin::{CacheAdmin, CacheStats, KeyListing};
pub use coordinator::{CacheCoordinator, CoordinatorConfig, RefreshEvent, RenderError, RenderRequest};
pub use entry::{decode, encode, CacheEntry, DecodeError};
pub use lock::{LockGuard, LockManager};
pub use waiter::NotificationWaiter;

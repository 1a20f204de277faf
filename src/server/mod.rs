mod api;
mod daemon;

pub use api::{router, AppState, API_TOKEN_HEADER};
pub use daemon::{connect_store, Daemon};

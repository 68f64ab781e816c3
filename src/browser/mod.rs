//! Persistent browser sessions and the page pool built on them

pub mod pool;
pub mod rotation;
pub mod session;

pub use pool::{DISABLED_NS, PageGuard, SESSIONS_NS, SessionPool};
pub use rotation::Rotation;
pub use session::{BrowserSession, StorageState, capture_state};

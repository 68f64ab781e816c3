pub mod audit;
pub mod auth;
pub mod blob;
pub mod browser;
pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod http;
pub mod kv;
pub mod render;
pub mod shutdown;

pub use audit::{AuditLog, RequestRecord};
pub use auth::Verifier;
pub use blob::BlobStore;
pub use browser::{PageGuard, SessionPool};
pub use cache::{CacheBackend, LockMap, Memoize, TtlCache, fingerprint, fingerprint_str};
pub use config::Settings;
pub use error::{ApiError, ApiResult};
pub use extract::Extractors;
pub use http::{Context, router};
pub use kv::KvStore;
pub use render::{RenderOptions, RenderRunner, target_filename};
pub use shutdown::Shutdown;

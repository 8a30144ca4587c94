//! # coord-kit
//!
//! Distributed coordination primitives for backend services sharing one
//! key/value + pub/sub store.
//!
//! ## Features
//!
//! - **Two-tier cache:** local tier in front of the shared store, with
//!   request collapsing, a circuit breaker and pub/sub invalidation
//! - **Distributed lock:** lease-based, token-checked release, expires on
//!   its own if the holder dies
//! - **Rate limiter:** nested windows evaluated atomically in one
//!   server-side script
//! - **Backend agnostic:** in-process store for tests and single nodes,
//!   Redis behind the `redis` feature, or any custom [`RemoteStore`]
//!
//! ## Quick Start
//!
//! ```
//! use coord_kit::{CacheValue, CoordConfig, Coordinator};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     id: String,
//!     name: String,
//! }
//!
//! impl CacheValue for User {}
//!
//! # #[tokio::main]
//! # async fn main() -> coord_kit::Result<()> {
//! let coordinator = Coordinator::in_memory(&CoordConfig::default())?;
//!
//! let user = coordinator
//!     .cache()
//!     .get_or_create("user:1", Duration::from_secs(300), || async {
//!         // load from the database
//!         Ok::<_, std::io::Error>(User { id: "1".into(), name: "Ada".into() })
//!     })
//!     .await?;
//! assert_eq!(user.name, "Ada");
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod builder;
pub mod cache;
pub mod collapse;
pub mod config;
pub mod entity;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod local;
pub mod lock;
pub mod memory;
pub mod observability;
pub mod rate_limit;
pub mod resilience;
pub mod serialization;
pub mod service;

// Re-exports for convenience
pub use backend::RemoteStore;
pub use builder::ManagedCacheBuilder;
pub use cache::ManagedCache;
pub use config::CoordConfig;
pub use entity::CacheValue;
pub use error::{Error, Result};
pub use lock::{DistributedLock, LockHandle};
pub use rate_limit::{RateLimitResult, RateLimitWindow, RateLimiter, WindowEntry};
pub use service::Coordinator;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

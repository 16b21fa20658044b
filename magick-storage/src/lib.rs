//! # Magick Storage
//!
//! The tiered storage registry for the magick feature-flag engine: a
//! process-local cache fronting a shared Redis store fronting a durable
//! SQL store, with circuit-broken Remote writes and cross-process cache
//! invalidation over pub/sub.
//!
//! ## Quick Start
//!
//! ```no_run
//! use magick_core::EngineConfig;
//! use magick_storage::StoreRegistry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), magick_core::AdapterError> {
//!     let config = EngineConfig::builder()
//!         .redis_url("redis://localhost:6379")
//!         .database_url("sqlite://flags.db")
//!         .build();
//!
//!     let registry = StoreRegistry::from_config(&config).await?;
//!     registry.set("dark_mode", "value", "true").await?;
//!     assert_eq!(
//!         registry.get("dark_mode", "value").await?,
//!         Some("true".to_string())
//!     );
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod durable;
pub mod local;
pub mod memory;
pub mod registry;
pub mod remote;
pub mod subscriber;
pub mod traits;

pub use breaker::{Circuit, CircuitBreaker};
pub use durable::DurableStore;
pub use local::LocalStore;
pub use memory::{MemoryDurable, MemoryRemote};
pub use registry::StoreRegistry;
pub use remote::RedisStore;
pub use subscriber::{FlagReloader, InvalidationListener, DEBOUNCE_WINDOW};
pub use traits::{DurableBackend, RemoteBackend, StoreResult, Subscription};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::breaker::{Circuit, CircuitBreaker};
    pub use crate::registry::StoreRegistry;
    pub use crate::subscriber::{FlagReloader, InvalidationListener};
    pub use crate::traits::{DurableBackend, RemoteBackend, StoreResult, Subscription};
}

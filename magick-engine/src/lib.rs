//! # Magick Engine
//!
//! The `Flag` object and `Engine` façade of the magick feature-flag
//! engine: typed flag state with invariants, targeting mutators,
//! dependency semantics, weighted variants, and the process-wide flag
//! registry with `is_enabled`/`value`/`enabled_for` entry points.
//!
//! ## Quick Start
//!
//! ```no_run
//! use magick_core::{Context, EngineConfig};
//! use magick_engine::{Engine, FlagOptions};
//!
//! #[tokio::main]
//! async fn main() -> magick_core::Result<()> {
//!     let config = EngineConfig::builder()
//!         .redis_url("redis://localhost:6379")
//!         .database_url("sqlite://flags.db")
//!         .build();
//!     let engine = Engine::new(config).await?;
//!
//!     engine.register("dark_mode", FlagOptions::boolean(false)).await?;
//!
//!     let ctx = Context::new().with_user_id(42);
//!     if engine.is_enabled("dark_mode", &ctx).await {
//!         // render dark
//!     }
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod flag;

pub use engine::{Engine, FlagOptions};
pub use flag::{Flag, TargetingUpdate};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::engine::{Engine, FlagOptions};
    pub use crate::flag::{Flag, TargetingUpdate};
    pub use magick_core::prelude::*;
}

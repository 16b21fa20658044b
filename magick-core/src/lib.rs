//! # Magick Core
//!
//! Core types for the magick feature-flag engine: typed flag values,
//! evaluation contexts, targeting rules and the rule matcher, the flag
//! state projection with its storage codecs, and engine configuration.
//!
//! This crate is I/O-free. The storage tiers live in `magick-storage`,
//! the metrics pipeline in `magick-metrics`, and the `Flag`/`Engine`
//! objects that tie them together in `magick-engine`.
//!
//! ## Quick Start
//!
//! ```
//! use magick_core::{Context, MatchOutcome, Targeting};
//!
//! let mut targeting = Targeting::new();
//! targeting.roles.insert("admin".to_string());
//!
//! let ctx = Context::new().with_user_id(42).with_role("admin");
//! assert_eq!(targeting.evaluate("premium", &ctx), MatchOutcome::Match);
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod state;
pub mod targeting;
pub mod value;

pub use config::{
    BreakerConfig, DatabaseConfig, EngineConfig, EngineConfigBuilder, MetricsConfig, RedisConfig,
    DEFAULT_NAMESPACE, INVALIDATION_CHANNEL,
};
pub use context::{Context, Subject};
pub use error::{AdapterError, MagickError, Result};
pub use state::{attr, FlagState, Variant};
pub use targeting::{
    AttributeOperator, AttributePredicate, ComplexConditions, Condition, ConditionKind, DateRange,
    LogicalOperator, MatchOutcome, Targeting,
};
pub use value::{FlagStatus, FlagType, FlagValue};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{EngineConfig, EngineConfigBuilder};
    pub use crate::context::{Context, Subject};
    pub use crate::error::{AdapterError, MagickError, Result};
    pub use crate::state::{FlagState, Variant};
    pub use crate::targeting::{MatchOutcome, Targeting};
    pub use crate::value::{FlagStatus, FlagType, FlagValue};
}

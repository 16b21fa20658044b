// Magick - an embedded feature-flag evaluation engine
//
// Answers "is feature F enabled for this context?" in-process, backed
// by a tiered storage registry (local cache, Redis, SQL) with live
// cross-process invalidation and asynchronous usage metrics.

// Re-export the engine surface
pub use magick_engine::{Engine, Flag, FlagOptions, TargetingUpdate};

// Re-export the member crates
pub use magick_core;
pub use magick_engine;
pub use magick_metrics;
pub use magick_storage;

// Re-export core types at the crate root for ergonomic call sites
pub use magick_core::{
    AdapterError, AttributeOperator, AttributePredicate, ComplexConditions, Condition,
    ConditionKind, Context, DateRange, EngineConfig, EngineConfigBuilder, FlagState, FlagStatus,
    FlagType, FlagValue, LogicalOperator, MagickError, MatchOutcome, Result, Subject, Targeting,
    Variant,
};
pub use magick_metrics::{MetricsPipeline, Operation};
pub use magick_storage::{
    Circuit, CircuitBreaker, DurableStore, LocalStore, MemoryDurable, MemoryRemote, RedisStore,
    StoreRegistry,
};

// Prelude for common imports
pub mod prelude {
    pub use magick_core::prelude::*;
    pub use magick_engine::{Engine, Flag, FlagOptions, TargetingUpdate};
    pub use magick_metrics::{MetricsPipeline, Operation};
    pub use magick_storage::prelude::*;
}

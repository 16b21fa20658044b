//! The engine façade.
//!
//! A process-wide registry of flags over the tiered storage registry
//! and the metrics pipeline. There is no global instance: construct an
//! [`Engine`] at startup and pass it (it is cheaply cloneable) to
//! consumers. Flags hold a non-owning handle back to the engine for
//! dependency cascades, so dropping the last `Engine` clone drops
//! everything.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use magick_core::{
    Context, EngineConfig, FlagState, FlagType, FlagValue, MagickError, Result, Subject, Variant,
};
use magick_metrics::MetricsPipeline;
use magick_storage::{CircuitBreaker, FlagReloader, InvalidationListener, StoreRegistry};

use crate::flag::Flag;

/// Options for [`Engine::register`].
#[derive(Debug, Clone)]
pub struct FlagOptions {
    pub flag_type: FlagType,
    pub default_value: FlagValue,
    pub description: Option<String>,
    pub display_name: Option<String>,
    pub group: Option<String>,
    pub dependencies: Vec<String>,
    pub variants: Vec<Variant>,
}

impl FlagOptions {
    fn new(flag_type: FlagType, default_value: FlagValue) -> Self {
        Self {
            flag_type,
            default_value,
            description: None,
            display_name: None,
            group: None,
            dependencies: Vec::new(),
            variants: Vec::new(),
        }
    }

    pub fn boolean(default_value: bool) -> Self {
        Self::new(FlagType::Boolean, FlagValue::Boolean(default_value))
    }

    pub fn string(default_value: impl Into<String>) -> Self {
        Self::new(FlagType::String, FlagValue::String(default_value.into()))
    }

    pub fn number(default_value: f64) -> Self {
        Self::new(FlagType::Number, FlagValue::Number(default_value))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_dependencies<I, T>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_variants(mut self, variants: Vec<Variant>) -> Self {
        self.variants = variants;
        self
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) registry: StoreRegistry,
    pub(crate) metrics: Arc<MetricsPipeline>,
    flags: RwLock<HashMap<String, Arc<Flag>>>,
    listener: Mutex<Option<InvalidationListener>>,
}

impl EngineInner {
    fn registered(&self, name: &str) -> Option<Arc<Flag>> {
        self.flags.read().get(name).cloned()
    }

    fn registered_flags(&self) -> Vec<Arc<Flag>> {
        self.flags.read().values().cloned().collect()
    }

    /// A registered flag that lists `name` as a dependency and is
    /// currently off, if any. Such a parent blocks `enable(name)`.
    pub(crate) async fn disabled_parent_of(&self, name: &str) -> Option<String> {
        for flag in self.registered_flags() {
            let state = match flag.snapshot().await {
                Ok(state) => state,
                Err(err) => {
                    debug!(flag = %flag.name(), error = %err, "skipping dependency check");
                    continue;
                }
            };
            if state.dependencies.iter().any(|dep| dep == name) && !parent_is_on(&state) {
                return Some(flag.name().to_string());
            }
        }
        None
    }

    /// One-level disable sweep over every registered flag that lists
    /// `name` as a dependency.
    pub(crate) async fn cascade_disable(&self, name: &str) {
        for flag in self.registered_flags() {
            if flag.name() == name {
                continue;
            }
            let depends = match flag.snapshot().await {
                Ok(state) => state.dependencies.iter().any(|dep| dep == name),
                Err(_) => false,
            };
            if depends {
                if let Err(err) = flag.disable_without_cascade().await {
                    warn!(flag = %flag.name(), error = %err, "cascade disable failed");
                } else {
                    debug!(flag = %flag.name(), parent = %name, "cascade disabled");
                }
            }
        }
    }
}

fn parent_is_on(state: &FlagState) -> bool {
    state.status == magick_core::FlagStatus::Active && state.value.is_truthy()
}

/// Reload hook handed to the invalidation listener. Holds a weak
/// handle so the listener never keeps the engine alive.
struct ReloaderHandle {
    engine: std::sync::Weak<EngineInner>,
}

#[async_trait]
impl FlagReloader for ReloaderHandle {
    async fn reload_flag(&self, name: &str) {
        let Some(inner) = self.engine.upgrade() else {
            return;
        };
        if let Some(flag) = inner.registered(name) {
            if let Err(err) = flag.reload().await {
                debug!(flag = %name, error = %err, "invalidation reload failed");
            }
        }
    }
}

/// The feature-flag engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Connect the configured storage tiers and start the background
    /// machinery.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let registry = StoreRegistry::from_config(&config).await?;
        Ok(Self::with_registry(config, registry))
    }

    /// Build over an existing registry. Used with in-memory backends
    /// for tests and embedded deployments.
    pub fn with_registry(config: EngineConfig, registry: StoreRegistry) -> Self {
        let metrics = MetricsPipeline::new(config.metrics.clone(), registry.remote().cloned());

        let inner = Arc::new(EngineInner {
            config,
            registry,
            metrics,
            flags: RwLock::new(HashMap::new()),
            listener: Mutex::new(None),
        });

        if let Some(remote) = inner.registry.remote() {
            let listener = InvalidationListener::spawn(
                Arc::clone(remote),
                Arc::clone(inner.registry.local()),
                Arc::new(ReloaderHandle {
                    engine: Arc::downgrade(&inner),
                }),
            );
            *inner.listener.lock() = Some(listener);
        }

        info!("feature-flag engine started");
        Self { inner }
    }

    /// Register a flag. Idempotent by name: a flag already present in
    /// storage keeps its value, status, and targeting, and only the
    /// metadata is rebound. The declared type is immutable.
    pub async fn register(&self, name: &str, options: FlagOptions) -> Result<Arc<Flag>> {
        let name = name.to_lowercase();
        options.default_value.check_type(&name, options.flag_type)?;

        let mut state = match self.inner.registry.get_fields(&name).await? {
            Some(fields) => {
                let existing = FlagState::from_fields(&name, &fields)?;
                if existing.flag_type != options.flag_type {
                    return Err(MagickError::invalid_value(
                        &name,
                        format!(
                            "type is immutable: registered as {}, requested {}",
                            existing.flag_type.as_str(),
                            options.flag_type.as_str()
                        ),
                    ));
                }
                existing
            }
            None => FlagState::new(options.flag_type, options.default_value.clone()),
        };

        state.default_value = options.default_value;
        state.description = options.description;
        state.display_name = options.display_name;
        state.group = options.group;
        state.dependencies = options.dependencies;
        if !options.variants.is_empty() {
            state.variants = options.variants;
        }

        self.inner
            .registry
            .set_fields(&name, &state.to_fields()?)
            .await?;

        let flag = Arc::new(Flag::with_state(
            name.clone(),
            state,
            Arc::downgrade(&self.inner),
        ));
        self.inner.flags.write().insert(name, Arc::clone(&flag));
        Ok(flag)
    }

    /// Look up a flag. An unregistered name yields a transient flag
    /// that evaluates against storage (or, failing that, as a disabled
    /// boolean); it is not added to the registry.
    pub fn get(&self, name: &str) -> Arc<Flag> {
        let name = name.to_lowercase();
        if let Some(flag) = self.inner.registered(&name) {
            return flag;
        }
        Arc::new(Flag::new(name, Arc::downgrade(&self.inner)))
    }

    /// Strict lookup: errors when the flag is neither registered in
    /// this process nor present in storage.
    pub async fn try_get(&self, name: &str) -> Result<Arc<Flag>> {
        let name = name.to_lowercase();
        if let Some(flag) = self.inner.registered(&name) {
            return Ok(flag);
        }
        if self.inner.registry.exists(&name).await? {
            return Ok(Arc::new(Flag::new(name, Arc::downgrade(&self.inner))));
        }
        Err(MagickError::NotFound(name))
    }

    /// Is the flag enabled for this context?
    pub async fn is_enabled(&self, name: &str, ctx: &Context) -> bool {
        self.get(name).is_enabled(ctx).await
    }

    pub async fn is_disabled(&self, name: &str, ctx: &Context) -> bool {
        !self.is_enabled(name, ctx).await
    }

    /// The flag's value for this context.
    pub async fn value(&self, name: &str, ctx: &Context) -> FlagValue {
        self.get(name).value(ctx).await
    }

    /// Evaluate against a domain object implementing [`Subject`],
    /// overlaying `extra` on the derived context.
    pub async fn enabled_for<S>(&self, name: &str, subject: &S, extra: Option<Context>) -> bool
    where
        S: Subject + ?Sized,
    {
        let mut ctx = Context::from_subject(subject);
        if let Some(extra) = &extra {
            ctx = ctx.merged_with(extra);
        }
        self.is_enabled(name, &ctx).await
    }

    /// Evaluate against a plain attribute mapping.
    pub async fn enabled_for_map(
        &self,
        name: &str,
        map: &HashMap<String, JsonValue>,
        extra: Option<Context>,
    ) -> bool {
        let mut ctx = Context::from_map(map);
        if let Some(extra) = &extra {
            ctx = ctx.merged_with(extra);
        }
        self.is_enabled(name, &ctx).await
    }

    /// Weighted variant selection for a flag.
    pub async fn variant(&self, name: &str, ctx: &Context) -> Option<String> {
        match self.get(name).variant(ctx).await {
            Ok(variant) => variant,
            Err(err) => {
                debug!(flag = %name, error = %err, "variant selection failed");
                None
            }
        }
    }

    /// Enable every named boolean flag. Non-boolean flags and flags
    /// blocked by a disabled dependent are skipped.
    pub async fn bulk_enable<I, T>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        for name in names {
            let flag = self.get(name.as_ref());
            if flag.snapshot().await?.flag_type == FlagType::Boolean {
                flag.enable().await?;
            }
        }
        Ok(())
    }

    /// Disable every named boolean flag (with the usual one-level
    /// cascade). Non-boolean flags are skipped.
    pub async fn bulk_disable<I, T>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        for name in names {
            let flag = self.get(name.as_ref());
            if flag.snapshot().await?.flag_type == FlagType::Boolean {
                flag.disable().await?;
            }
        }
        Ok(())
    }

    /// Force a re-read of the flag's projection from storage.
    pub async fn reload(&self, name: &str) -> Result<()> {
        let name = name.to_lowercase();
        if let Some(flag) = self.inner.registered(&name) {
            flag.reload().await?;
        } else {
            self.inner.registry.evict_local(&name);
        }
        Ok(())
    }

    /// Delete a flag from every storage tier and the registry.
    /// Subsequent lookups yield a transient default-valued flag.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let name = name.to_lowercase();
        self.inner.registry.delete(&name).await?;
        self.inner.flags.write().remove(&name);
        Ok(())
    }

    /// Names of the flags registered in this process, sorted.
    pub fn features(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.flags.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a flag is registered here or present in storage.
    pub async fn exists(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        if self.inner.registered(&name).is_some() {
            return true;
        }
        self.inner.registry.exists(&name).await.unwrap_or(false)
    }

    /// The metrics pipeline, for usage queries.
    pub fn metrics(&self) -> &Arc<MetricsPipeline> {
        &self.inner.metrics
    }

    /// The storage registry.
    pub fn registry(&self) -> &StoreRegistry {
        &self.inner.registry
    }

    /// The circuit breaker guarding Remote writes.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.inner.registry.breaker()
    }

    /// Drop the flag registry and all storage tiers. Test support.
    pub async fn reset(&self) -> Result<()> {
        self.inner.flags.write().clear();
        self.inner.registry.clear().await?;
        self.inner.metrics.reset();
        Ok(())
    }

    /// Stop the background tasks, flushing pending metrics.
    pub async fn shutdown(&self) {
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop().await;
        }
        self.inner.metrics.shutdown().await;
        info!("feature-flag engine stopped");
    }
}

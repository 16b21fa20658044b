//! The flag object.
//!
//! A [`Flag`] pairs a name with its in-memory state projection and a
//! non-owning handle back to the engine. Evaluation reads the cached
//! projection, loading it lazily through the storage registry on first
//! access; mutators write through the registry (which publishes the
//! invalidation) and then refresh the projection. Locks are never held
//! across awaits: state is cloned out, transformed, persisted, and
//! swapped back in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

use magick_core::state::attr;
use magick_core::{
    AttributePredicate, ComplexConditions, Context, DateRange, FlagState, FlagStatus, FlagType,
    FlagValue, MagickError, MatchOutcome, Result, Variant,
};

use crate::engine::EngineInner;

/// Compound targeting change applied as a diff by
/// [`Flag::apply_targeting_update`]. `None` fields leave the
/// corresponding rule untouched; an empty selection or a percentage of
/// zero or less disables the rule; a percentage above 100 is invalid.
#[derive(Debug, Clone, Default)]
pub struct TargetingUpdate {
    /// Replacement role set.
    pub roles: Option<Vec<String>>,
    /// Comma-separated user ids (whitespace tolerated); blank clears
    /// the user rule.
    pub user_ids: Option<String>,
    pub percentage_of_users: Option<f64>,
    pub percentage_of_requests: Option<f64>,
}

/// A named feature flag.
pub struct Flag {
    name: String,
    state: RwLock<Option<FlagState>>,
    /// Whether a full row for this flag exists in storage. A transient
    /// flag's first mutation writes the whole state, so single-attribute
    /// updates never create a row missing its `type` anchor.
    persisted: AtomicBool,
    engine: Weak<EngineInner>,
}

impl Flag {
    pub(crate) fn new(name: impl Into<String>, engine: Weak<EngineInner>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(None),
            persisted: AtomicBool::new(false),
            engine,
        }
    }

    pub(crate) fn with_state(
        name: impl Into<String>,
        state: FlagState,
        engine: Weak<EngineInner>,
    ) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(Some(state)),
            persisted: AtomicBool::new(true),
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> Result<Arc<EngineInner>> {
        self.engine
            .upgrade()
            .ok_or_else(|| MagickError::invalid_value(&self.name, "engine has been dropped"))
    }

    pub(crate) fn cached_state(&self) -> Option<FlagState> {
        self.state.read().clone()
    }

    pub(crate) fn replace_state(&self, state: Option<FlagState>) {
        *self.state.write() = state;
    }

    /// Current projection, loading it through the registry on first
    /// access. An unknown flag projects as a boolean defaulting to
    /// `false`.
    pub async fn snapshot(&self) -> Result<FlagState> {
        if let Some(state) = self.cached_state() {
            return Ok(state);
        }

        let engine = self.engine()?;
        let state = match engine.registry.get_fields(&self.name).await? {
            Some(fields) => {
                self.persisted.store(true, Ordering::SeqCst);
                FlagState::from_fields(&self.name, &fields)?
            }
            None => FlagState::new(FlagType::Boolean, FlagValue::Boolean(false)),
        };
        *self.state.write() = Some(state.clone());
        Ok(state)
    }

    /// Re-read the projection from Remote → Durable, bypassing Local.
    pub async fn reload(&self) -> Result<()> {
        let engine = self.engine()?;
        let state = match engine.registry.refresh_fields(&self.name).await? {
            Some(fields) => Some(FlagState::from_fields(&self.name, &fields)?),
            None => None,
        };
        self.persisted.store(state.is_some(), Ordering::SeqCst);
        *self.state.write() = state;
        Ok(())
    }

    /// Read-only view of the flag's targeting rules.
    pub async fn targeting(&self) -> Result<magick_core::Targeting> {
        Ok(self.snapshot().await?.targeting)
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Is the flag on for this context? Never fails: any internal error
    /// is logged and reads as `false`.
    pub async fn is_enabled(&self, ctx: &Context) -> bool {
        let start = Instant::now();
        let outcome = self.try_is_enabled(ctx).await;
        let success = outcome.is_ok();
        let enabled = outcome.unwrap_or_else(|err| {
            debug!(flag = %self.name, error = %err, "evaluation failed, returning false");
            false
        });
        if let Ok(engine) = self.engine() {
            engine.metrics.record(
                &self.name,
                magick_metrics::Operation::Enabled,
                elapsed_ms(start),
                success,
            );
        }
        enabled
    }

    async fn try_is_enabled(&self, ctx: &Context) -> Result<bool> {
        let state = self.snapshot().await?;

        if state.status == FlagStatus::Inactive {
            return Ok(false);
        }
        if state.status == FlagStatus::Deprecated && !ctx.allow_deprecated() {
            if self.engine()?.config.warn_on_deprecated {
                warn!(flag = %self.name, "deprecated feature accessed without allow_deprecated");
            }
            return Ok(false);
        }

        if !state.targeting.is_empty() {
            match state.targeting.evaluate(&self.name, ctx) {
                MatchOutcome::NoMatch => return Ok(false),
                MatchOutcome::Match if state.flag_type == FlagType::Boolean => return Ok(true),
                // A matching string/number flag still answers by its
                // value's truthiness.
                MatchOutcome::Match | MatchOutcome::NoRules => {}
            }
        }

        Ok(state.value.is_truthy())
    }

    /// The flag's value for this context: the stored value on a match
    /// (or with no rules), the default on a miss. Never fails: errors
    /// read as the last known default.
    pub async fn value(&self, ctx: &Context) -> FlagValue {
        let start = Instant::now();
        let outcome = self.try_value(ctx).await;
        let success = outcome.is_ok();
        let value = outcome.unwrap_or_else(|err| {
            debug!(flag = %self.name, error = %err, "value read failed, returning default");
            self.cached_state()
                .map(|state| state.default_value)
                .unwrap_or(FlagValue::Boolean(false))
        });
        if let Ok(engine) = self.engine() {
            engine.metrics.record(
                &self.name,
                magick_metrics::Operation::Value,
                elapsed_ms(start),
                success,
            );
        }
        value
    }

    async fn try_value(&self, ctx: &Context) -> Result<FlagValue> {
        let state = self.snapshot().await?;
        if state.targeting.is_empty() {
            return Ok(state.value);
        }
        match state.targeting.evaluate(&self.name, ctx) {
            MatchOutcome::Match | MatchOutcome::NoRules => Ok(state.value),
            MatchOutcome::NoMatch => Ok(state.default_value),
        }
    }

    /// Weighted variant selection. Zero total weight picks the first
    /// variant; no variants picks nothing.
    pub async fn variant(&self, ctx: &Context) -> Result<Option<String>> {
        let start = Instant::now();
        let outcome = self.try_variant(ctx).await;
        if let Ok(engine) = self.engine() {
            engine.metrics.record(
                &self.name,
                magick_metrics::Operation::Variant,
                elapsed_ms(start),
                outcome.is_ok(),
            );
        }
        outcome
    }

    async fn try_variant(&self, _ctx: &Context) -> Result<Option<String>> {
        let state = self.snapshot().await?;
        if state.variants.is_empty() {
            return Ok(None);
        }

        let total: f64 = state.variants.iter().map(|v| v.weight.max(0.0)).sum();
        if total <= 0.0 {
            return Ok(Some(state.variants[0].name.clone()));
        }

        let draw = rand::thread_rng().gen_range(0.0..total);
        let mut running = 0.0;
        for variant in &state.variants {
            running += variant.weight.max(0.0);
            if running > draw {
                return Ok(Some(variant.name.clone()));
            }
        }
        Ok(state.variants.last().map(|v| v.name.clone()))
    }

    // ------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------

    /// Set the global value. The value must match the flag's type.
    pub async fn set_value(&self, value: impl Into<FlagValue>) -> Result<()> {
        let mut state = self.snapshot().await?;
        let value = value.into();
        value.check_type(&self.name, state.flag_type)?;
        state.value = value;

        if !self.persisted.load(Ordering::SeqCst) {
            return self.persist_state(&state).await;
        }

        let engine = self.engine()?;
        engine
            .registry
            .set(&self.name, attr::VALUE, &state.value.encode())
            .await?;
        self.replace_state(Some(state));
        Ok(())
    }

    /// Turn a boolean flag on, clearing its targeting.
    ///
    /// Returns `Ok(false)` without mutating when a flag that lists this
    /// one as a dependency is currently disabled: the parent must come
    /// back first.
    pub async fn enable(&self) -> Result<bool> {
        let engine = self.engine()?;
        let mut state = self.snapshot().await?;

        if state.flag_type != FlagType::Boolean {
            return Err(MagickError::invalid_value(
                &self.name,
                "enable() only applies to boolean flags; use set_value",
            ));
        }

        if let Some(parent) = engine.disabled_parent_of(&self.name).await {
            debug!(flag = %self.name, parent = %parent, "enable blocked by disabled dependent flag");
            return Ok(false);
        }

        state.targeting.clear();
        state.value = FlagValue::Boolean(true);
        state.status = FlagStatus::Active;
        self.persist_state(&state).await?;
        Ok(true)
    }

    /// Turn the flag off: clear targeting, write the type's off value,
    /// and disable every flag that lists this one as a dependency (one
    /// level; repeated disables propagate further).
    pub async fn disable(&self) -> Result<()> {
        let engine = self.engine()?;
        self.disable_without_cascade().await?;
        engine.cascade_disable(&self.name).await;
        Ok(())
    }

    pub(crate) async fn disable_without_cascade(&self) -> Result<()> {
        let mut state = self.snapshot().await?;
        state.targeting.clear();
        state.value = FlagValue::off_value(state.flag_type);
        self.persist_state(&state).await
    }

    /// Change the lifecycle status.
    pub async fn set_status(&self, status: FlagStatus) -> Result<()> {
        let mut state = self.snapshot().await?;
        state.status = status;

        if !self.persisted.load(Ordering::SeqCst) {
            return self.persist_state(&state).await;
        }

        let engine = self.engine()?;
        engine
            .registry
            .set(&self.name, attr::STATUS, status.as_str())
            .await?;
        self.replace_state(Some(state));
        Ok(())
    }

    /// Replace the variant list. Weights must be non-negative and
    /// variant values must match the flag's type.
    pub async fn set_variants(&self, variants: Vec<Variant>) -> Result<()> {
        let mut state = self.snapshot().await?;
        for variant in &variants {
            if variant.weight < 0.0 || !variant.weight.is_finite() {
                return Err(MagickError::invalid_value(
                    &self.name,
                    format!("variant '{}' has a negative weight", variant.name),
                ));
            }
            variant.value.check_type(&self.name, state.flag_type)?;
        }
        state.variants = variants;
        self.persist_state(&state).await
    }

    // Targeting mutators. Each edits one rule and persists the whole
    // targeting attribute.

    pub async fn enable_for_user(&self, user_id: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.users.insert(user_id.to_string());
        })
        .await
    }

    pub async fn disable_for_user(&self, user_id: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.users.remove(&user_id.to_string());
        })
        .await
    }

    pub async fn enable_for_group(&self, group: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.groups.insert(group.to_string());
        })
        .await
    }

    pub async fn disable_for_group(&self, group: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.groups.remove(&group.to_string());
        })
        .await
    }

    pub async fn enable_for_role(&self, role: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.roles.insert(role.to_string());
        })
        .await
    }

    pub async fn disable_for_role(&self, role: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.roles.remove(&role.to_string());
        })
        .await
    }

    pub async fn enable_for_tag(&self, tag: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.tags.insert(tag.to_string());
        })
        .await
    }

    pub async fn disable_for_tag(&self, tag: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.tags.remove(&tag.to_string());
        })
        .await
    }

    /// Deterministic rollout to a percentage of users, in (0, 100].
    pub async fn enable_percentage_of_users(&self, percentage: f64) -> Result<()> {
        self.check_percentage(percentage)?;
        self.update_targeting(|t| t.percentage_users = Some(percentage))
            .await
    }

    pub async fn disable_percentage_of_users(&self) -> Result<()> {
        self.update_targeting(|t| t.percentage_users = None).await
    }

    /// Random sampling of a percentage of requests, in (0, 100].
    pub async fn enable_percentage_of_requests(&self, percentage: f64) -> Result<()> {
        self.check_percentage(percentage)?;
        self.update_targeting(|t| t.percentage_requests = Some(percentage))
            .await
    }

    pub async fn disable_percentage_of_requests(&self) -> Result<()> {
        self.update_targeting(|t| t.percentage_requests = None).await
    }

    pub async fn set_date_range(&self, range: DateRange) -> Result<()> {
        self.update_targeting(|t| t.date_range = Some(range)).await
    }

    pub async fn clear_date_range(&self) -> Result<()> {
        self.update_targeting(|t| t.date_range = None).await
    }

    pub async fn enable_for_ip(&self, cidr: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.ip_addresses.insert(cidr.to_string());
        })
        .await
    }

    pub async fn disable_for_ip(&self, cidr: impl ToString) -> Result<()> {
        self.update_targeting(|t| {
            t.ip_addresses.remove(&cidr.to_string());
        })
        .await
    }

    pub async fn set_custom_attribute_rule(
        &self,
        attribute: impl Into<String>,
        predicate: AttributePredicate,
    ) -> Result<()> {
        self.update_targeting(|t| {
            t.custom_attributes.insert(attribute.into(), predicate);
        })
        .await
    }

    pub async fn remove_custom_attribute_rule(&self, attribute: &str) -> Result<()> {
        let attribute = attribute.to_string();
        self.update_targeting(move |t| {
            t.custom_attributes.remove(&attribute);
        })
        .await
    }

    pub async fn set_complex_conditions(&self, conditions: ComplexConditions) -> Result<()> {
        self.update_targeting(|t| t.complex_conditions = Some(conditions))
            .await
    }

    pub async fn clear_complex_conditions(&self) -> Result<()> {
        self.update_targeting(|t| t.complex_conditions = None).await
    }

    pub async fn clear_targeting(&self) -> Result<()> {
        self.update_targeting(|t| t.clear()).await
    }

    /// Apply a compound targeting diff in one write (one invalidation),
    /// as the admin surface submits it.
    pub async fn apply_targeting_update(&self, update: TargetingUpdate) -> Result<()> {
        for pct in [update.percentage_of_users, update.percentage_of_requests]
            .into_iter()
            .flatten()
        {
            if pct > 100.0 {
                return Err(MagickError::invalid_value(
                    &self.name,
                    format!("percentage {pct} above 100"),
                ));
            }
        }

        self.update_targeting(|t| {
            if let Some(roles) = update.roles {
                t.roles = roles.into_iter().filter(|r| !r.is_empty()).collect();
            }
            if let Some(ids) = update.user_ids {
                t.users = ids
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            if let Some(pct) = update.percentage_of_users {
                t.percentage_users = (pct > 0.0).then_some(pct);
            }
            if let Some(pct) = update.percentage_of_requests {
                t.percentage_requests = (pct > 0.0).then_some(pct);
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_percentage(&self, percentage: f64) -> Result<()> {
        if !(percentage > 0.0 && percentage <= 100.0) {
            return Err(MagickError::invalid_value(
                &self.name,
                format!("percentage {percentage} outside (0, 100]"),
            ));
        }
        Ok(())
    }

    async fn update_targeting<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut magick_core::Targeting),
    {
        let mut state = self.snapshot().await?;
        mutate(&mut state.targeting);

        if !self.persisted.load(Ordering::SeqCst) {
            return self.persist_state(&state).await;
        }

        let engine = self.engine()?;
        engine
            .registry
            .set(&self.name, attr::TARGETING, &state.targeting.to_json()?)
            .await?;
        self.replace_state(Some(state));
        Ok(())
    }

    /// Persist the whole projection in one write (one invalidation).
    async fn persist_state(&self, state: &FlagState) -> Result<()> {
        let engine = self.engine()?;
        engine
            .registry
            .set_fields(&self.name, &state.to_fields()?)
            .await?;
        self.persisted.store(true, Ordering::SeqCst);
        self.replace_state(Some(state.clone()));
        Ok(())
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

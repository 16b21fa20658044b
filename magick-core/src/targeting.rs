//! Targeting rules and the rule matcher.
//!
//! A flag's targeting map overrides its global value for some contexts.
//! Rules split into two groups evaluated in order: gating rules, where
//! any failure vetoes the flag for this context, and selection rules,
//! where any match activates it. An empty map means "no filter" and the
//! caller falls back to the global value.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::context::Context;
use crate::error::{AdapterError, Result};

/// Outcome of running the matcher against a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A selection rule matched; the flag applies to this context.
    Match,
    /// Rules exist but none selected this context.
    NoMatch,
    /// The targeting map is empty; evaluate the global value.
    NoRules,
}

/// Operator for a custom-attribute predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeOperator {
    Eq,
    Ne,
    In,
    NotIn,
    Gt,
    Lt,
}

/// Predicate over one context attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributePredicate {
    pub operator: AttributeOperator,
    pub values: Vec<String>,
}

impl AttributePredicate {
    pub fn new(operator: AttributeOperator, values: Vec<String>) -> Self {
        Self { operator, values }
    }

    /// Evaluate against the stringified attribute value, if present.
    /// Membership operators treat a missing attribute as non-membership,
    /// so `ne`/`not_in` pass when the attribute is absent.
    fn matches(&self, actual: Option<&str>) -> bool {
        match self.operator {
            AttributeOperator::Eq | AttributeOperator::In => actual
                .map(|v| self.values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
            AttributeOperator::Ne | AttributeOperator::NotIn => actual
                .map(|v| !self.values.iter().any(|candidate| candidate == v))
                .unwrap_or(true),
            AttributeOperator::Gt => self.numeric(actual, |a, b| a > b),
            AttributeOperator::Lt => self.numeric(actual, |a, b| a < b),
        }
    }

    fn numeric(&self, actual: Option<&str>, cmp: fn(f64, f64) -> bool) -> bool {
        let Some(lhs) = actual.and_then(|v| v.parse::<f64>().ok()) else {
            return false;
        };
        self.values
            .first()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|rhs| cmp(lhs, rhs))
            .unwrap_or(false)
    }
}

/// Aggregation operator for complex conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
}

/// Kind of a complex-condition leaf. Each mirrors a selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    User,
    Group,
    Role,
    Tag,
    PercentageUsers,
    PercentageRequests,
}

/// One leaf of a complex condition: a rule kind plus its parameters
/// (`values` for membership kinds, `percentage` for percentage kinds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default)]
    pub params: JsonValue,
}

impl Condition {
    fn matches(&self, flag_name: &str, ctx: &Context) -> bool {
        match self.kind {
            ConditionKind::User => self.value_set_contains(ctx.user_id()),
            ConditionKind::Group => self.value_set_contains(ctx.group()),
            ConditionKind::Role => self.value_set_contains(ctx.role()),
            ConditionKind::Tag => {
                let values = self.param_values();
                ctx.tags().iter().any(|t| values.iter().any(|v| v == t))
            }
            ConditionKind::PercentageUsers => match (ctx.user_id(), self.param_percentage()) {
                (Some(user_id), Some(pct)) => user_in_percentage(flag_name, user_id, pct),
                _ => false,
            },
            ConditionKind::PercentageRequests => self
                .param_percentage()
                .map(request_in_percentage)
                .unwrap_or(false),
        }
    }

    fn value_set_contains(&self, actual: Option<&str>) -> bool {
        let Some(actual) = actual else { return false };
        self.param_values().iter().any(|v| v == actual)
    }

    fn param_values(&self) -> Vec<String> {
        match self.params.get("values") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    JsonValue::String(s) => Some(s.clone()),
                    JsonValue::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn param_percentage(&self) -> Option<f64> {
        self.params.get("percentage").and_then(JsonValue::as_f64)
    }
}

/// `and`/`or` aggregate over condition leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexConditions {
    pub operator: LogicalOperator,
    pub conditions: Vec<Condition>,
}

impl ComplexConditions {
    fn matches(&self, flag_name: &str, ctx: &Context) -> bool {
        match self.operator {
            LogicalOperator::And => self.conditions.iter().all(|c| c.matches(flag_name, ctx)),
            LogicalOperator::Or => self.conditions.iter().any(|c| c.matches(flag_name, ctx)),
        }
    }
}

/// Inclusive activity window for a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

/// The targeting map: every rule a flag may carry, all optional.
///
/// Serializes to a single JSON object keyed by targeting kind, which is
/// the composite encoding used across all storage tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Targeting {
    #[serde(rename = "user", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub users: BTreeSet<String>,

    #[serde(rename = "group", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub groups: BTreeSet<String>,

    #[serde(rename = "role", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub roles: BTreeSet<String>,

    #[serde(rename = "tag", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage_users: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage_requests: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,

    #[serde(rename = "ip_address", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ip_addresses: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_attributes: BTreeMap<String, AttributePredicate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complex_conditions: Option<ComplexConditions>,
}

impl Targeting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.groups.is_empty()
            && self.roles.is_empty()
            && self.tags.is_empty()
            && self.percentage_users.is_none()
            && self.percentage_requests.is_none()
            && self.date_range.is_none()
            && self.ip_addresses.is_empty()
            && self.custom_attributes.is_empty()
            && self.complex_conditions.is_none()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Composite wire encoding shared by all storage tiers.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(AdapterError::from)
            .map_err(Into::into)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(AdapterError::from)
            .map_err(Into::into)
    }

    /// Run the matcher. Gating rules first (any failure vetoes), then
    /// selection rules (any match selects); empty map is `NoRules`.
    pub fn evaluate(&self, flag_name: &str, ctx: &Context) -> MatchOutcome {
        self.evaluate_at(flag_name, ctx, Utc::now())
    }

    /// Matcher with an explicit clock, used by the date-range tests.
    pub fn evaluate_at(&self, flag_name: &str, ctx: &Context, now: DateTime<Utc>) -> MatchOutcome {
        if self.is_empty() {
            return MatchOutcome::NoRules;
        }

        if let Some(range) = &self.date_range {
            if !range.contains(now) {
                return MatchOutcome::NoMatch;
            }
        }
        if !self.ip_addresses.is_empty() {
            let in_any = ctx
                .ip_address()
                .and_then(|raw| raw.parse::<IpAddr>().ok())
                .map(|ip| self.ip_addresses.iter().any(|cidr| ip_in_cidr(ip, cidr)))
                .unwrap_or(false);
            if !in_any {
                return MatchOutcome::NoMatch;
            }
        }
        if !self.custom_attributes.is_empty() {
            let all_pass = self
                .custom_attributes
                .iter()
                .all(|(attr, predicate)| predicate.matches(ctx.get(attr)));
            if !all_pass {
                return MatchOutcome::NoMatch;
            }
        }
        if let Some(complex) = &self.complex_conditions {
            if !complex.matches(flag_name, ctx) {
                return MatchOutcome::NoMatch;
            }
        }

        if let Some(user_id) = ctx.user_id() {
            if self.users.contains(user_id) {
                return MatchOutcome::Match;
            }
        }
        if let Some(group) = ctx.group() {
            if self.groups.contains(group) {
                return MatchOutcome::Match;
            }
        }
        if let Some(role) = ctx.role() {
            if self.roles.contains(role) {
                return MatchOutcome::Match;
            }
        }
        if ctx.tags().iter().any(|t| self.tags.contains(t)) {
            return MatchOutcome::Match;
        }
        if let (Some(pct), Some(user_id)) = (self.percentage_users, ctx.user_id()) {
            if user_in_percentage(flag_name, user_id, pct) {
                return MatchOutcome::Match;
            }
        }
        if let Some(pct) = self.percentage_requests {
            if request_in_percentage(pct) {
                return MatchOutcome::Match;
            }
        }

        MatchOutcome::NoMatch
    }
}

/// Deterministic percentage bucket for a (flag, user) pair, in 0..100.
///
/// The first four bytes of `MD5("{flag_name}:{user_id}")` read big-endian
/// (equivalently, the first eight hex characters as a u32), modulo 100.
/// Stable across processes and re-evaluations.
pub fn user_bucket(flag_name: &str, user_id: &str) -> u32 {
    let mut hasher = Md5::new();
    hasher.update(flag_name.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();

    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    head % 100
}

fn user_in_percentage(flag_name: &str, user_id: &str, percentage: f64) -> bool {
    (user_bucket(flag_name, user_id) as f64) < percentage
}

fn request_in_percentage(percentage: f64) -> bool {
    rand::thread_rng().gen_range(0.0..100.0) < percentage
}

/// CIDR inclusion over IPv4 and IPv6 with prefix masking. A bare
/// address is a full-length prefix; malformed entries never match.
fn ip_in_cidr(ip: IpAddr, cidr: &str) -> bool {
    let (network, prefix) = match cidr.split_once('/') {
        Some((network, len)) => match len.parse::<u32>() {
            Ok(len) => (network, Some(len)),
            Err(_) => return false,
        },
        None => (cidr, None),
    };
    let Ok(network) = network.parse::<IpAddr>() else {
        return false;
    };

    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(network)) => {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            (u32::from(ip) & mask) == (u32::from(network) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(network)) => {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            (u128::from(ip) & mask) == (u128::from(network) & mask)
        }
        _ => false,
    }
}

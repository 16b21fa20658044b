//! Evaluation context and subject extraction.
//!
//! A [`Context`] carries the per-evaluation attributes targeting rules
//! match against. Callers either build one directly, or derive one from
//! a domain object through the [`Subject`] capability trait.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

/// Attribute keys with first-class accessors.
pub const USER_ID: &str = "user_id";
pub const GROUP: &str = "group";
pub const ROLE: &str = "role";
pub const IP_ADDRESS: &str = "ip_address";

/// Per-evaluation caller-supplied attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    attributes: HashMap<String, String>,
    tags: Vec<String>,
    allow_deprecated: bool,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user identifier. Any displayable id is accepted and
    /// stringified, so numeric ids match string-configured rules.
    pub fn with_user_id(mut self, user_id: impl ToString) -> Self {
        self.attributes
            .insert(USER_ID.to_string(), user_id.to_string());
        self
    }

    pub fn with_group(mut self, group: impl ToString) -> Self {
        self.attributes.insert(GROUP.to_string(), group.to_string());
        self
    }

    pub fn with_role(mut self, role: impl ToString) -> Self {
        self.attributes.insert(ROLE.to_string(), role.to_string());
        self
    }

    pub fn with_ip_address(mut self, ip: impl ToString) -> Self {
        self.attributes
            .insert(IP_ADDRESS.to_string(), ip.to_string());
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.tags = tags.into_iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_tag(mut self, tag: impl ToString) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    /// Opt in to reading deprecated flags.
    pub fn with_allow_deprecated(mut self, allow: bool) -> Self {
        self.allow_deprecated = allow;
        self
    }

    /// Set an arbitrary attribute for custom-attribute matching.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(key.into(), value.to_string());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get(USER_ID)
    }

    pub fn group(&self) -> Option<&str> {
        self.get(GROUP)
    }

    pub fn role(&self) -> Option<&str> {
        self.get(ROLE)
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.get(IP_ADDRESS)
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn allow_deprecated(&self) -> bool {
        self.allow_deprecated
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.tags.is_empty() && !self.allow_deprecated
    }

    /// Overlay `extra` on top of this context. Attributes, tags, and the
    /// deprecation opt-in from `extra` win on conflict.
    pub fn merged_with(mut self, extra: &Context) -> Self {
        for (k, v) in &extra.attributes {
            self.attributes.insert(k.clone(), v.clone());
        }
        if !extra.tags.is_empty() {
            self.tags = extra.tags.clone();
        }
        self.allow_deprecated = self.allow_deprecated || extra.allow_deprecated;
        self
    }

    /// Derive a context from anything implementing [`Subject`].
    pub fn from_subject<S: Subject + ?Sized>(subject: &S) -> Self {
        let mut ctx = Context::new();
        if let Some(id) = subject.user_id() {
            ctx = ctx.with_user_id(id);
        }
        if let Some(group) = subject.group() {
            ctx = ctx.with_group(group);
        }
        if let Some(role) = subject.role() {
            ctx = ctx.with_role(role);
        }
        if let Some(ip) = subject.ip_address() {
            ctx = ctx.with_ip_address(ip);
        }
        let tags = subject.tags();
        if !tags.is_empty() {
            ctx = ctx.with_tags(tags);
        }
        for (key, value) in subject.custom_attributes() {
            ctx = ctx.with_attribute(key, value);
        }
        ctx
    }

    /// Derive a context from a plain JSON mapping. Recognized keys are
    /// `id`/`user_id`, `group`, `role`, `ip_address`, and
    /// `tags`/`tag_ids`/`tag_names`; every remaining scalar is copied
    /// verbatim for custom-attribute matching.
    pub fn from_map(map: &HashMap<String, JsonValue>) -> Self {
        let mut ctx = Context::new();

        if let Some(id) = map.get("user_id").or_else(|| map.get("id")) {
            if let Some(text) = scalar_text(id) {
                ctx = ctx.with_user_id(text);
            }
        }
        if let Some(text) = map.get(GROUP).and_then(scalar_text) {
            ctx = ctx.with_group(text);
        }
        if let Some(text) = map.get(ROLE).and_then(scalar_text) {
            ctx = ctx.with_role(text);
        }
        if let Some(text) = map.get(IP_ADDRESS).and_then(scalar_text) {
            ctx = ctx.with_ip_address(text);
        }

        for tags_key in ["tags", "tag_ids", "tag_names"] {
            if let Some(JsonValue::Array(items)) = map.get(tags_key) {
                let tags: Vec<String> = items.iter().filter_map(scalar_text).collect();
                if !tags.is_empty() {
                    ctx = ctx.with_tags(tags);
                    break;
                }
            }
        }

        if let Some(allow) = map.get("allow_deprecated").and_then(JsonValue::as_bool) {
            ctx = ctx.with_allow_deprecated(allow);
        }

        const RESERVED: [&str; 9] = [
            "id",
            "user_id",
            "group",
            "role",
            "ip_address",
            "tags",
            "tag_ids",
            "tag_names",
            "allow_deprecated",
        ];
        for (key, value) in map {
            if RESERVED.contains(&key.as_str()) {
                continue;
            }
            if let Some(text) = scalar_text(value) {
                ctx = ctx.with_attribute(key.clone(), text);
            }
        }

        ctx
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Capability interface for deriving a [`Context`] from a domain object.
///
/// Implement the accessors your type can answer; the rest default to
/// absent. Integer-like scalars already implement this as a bare
/// `user_id`, so `engine.enabled_for("beta", &42, None)` works out of
/// the box.
pub trait Subject {
    fn user_id(&self) -> Option<String> {
        None
    }

    fn group(&self) -> Option<String> {
        None
    }

    fn role(&self) -> Option<String> {
        None
    }

    fn ip_address(&self) -> Option<String> {
        None
    }

    fn tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Additional attributes exposed to custom-attribute rules.
    fn custom_attributes(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

macro_rules! impl_subject_for_integer {
    ($($ty:ty),+) => {
        $(
            impl Subject for $ty {
                fn user_id(&self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )+
    };
}

impl_subject_for_integer!(u32, u64, i32, i64, usize);

impl Subject for str {
    fn user_id(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl Subject for String {
    fn user_id(&self) -> Option<String> {
        Some(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_accessors() {
        let ctx = Context::new()
            .with_user_id(42)
            .with_role("admin")
            .with_tags(["beta", "internal"])
            .with_attribute("plan", "pro");

        assert_eq!(ctx.user_id(), Some("42"));
        assert_eq!(ctx.role(), Some("admin"));
        assert_eq!(ctx.tags(), ["beta", "internal"]);
        assert_eq!(ctx.get("plan"), Some("pro"));
        assert!(!ctx.allow_deprecated());
    }

    #[test]
    fn test_from_map_recognized_and_custom_keys() {
        let map: HashMap<String, serde_json::Value> = [
            ("id".to_string(), json!(7)),
            ("role".to_string(), json!("editor")),
            ("tag_names".to_string(), json!(["alpha", "beta"])),
            ("plan".to_string(), json!("enterprise")),
            ("seats".to_string(), json!(25)),
        ]
        .into();

        let ctx = Context::from_map(&map);
        assert_eq!(ctx.user_id(), Some("7"));
        assert_eq!(ctx.role(), Some("editor"));
        assert_eq!(ctx.tags(), ["alpha", "beta"]);
        assert_eq!(ctx.get("plan"), Some("enterprise"));
        assert_eq!(ctx.get("seats"), Some("25"));
    }

    #[test]
    fn test_user_id_key_wins_over_id() {
        let map: HashMap<String, serde_json::Value> =
            [("id".to_string(), json!(1)), ("user_id".to_string(), json!(2))].into();
        assert_eq!(Context::from_map(&map).user_id(), Some("2"));
    }

    #[test]
    fn test_scalar_subject() {
        let ctx = Context::from_subject(&42_u64);
        assert_eq!(ctx.user_id(), Some("42"));

        let ctx = Context::from_subject("alice");
        assert_eq!(ctx.user_id(), Some("alice"));
    }

    #[test]
    fn test_custom_subject_with_tag_objects() {
        struct Account {
            id: u64,
            labels: Vec<String>,
        }

        impl Subject for Account {
            fn user_id(&self) -> Option<String> {
                Some(self.id.to_string())
            }

            fn group(&self) -> Option<String> {
                Some("accounts".to_string())
            }

            fn tags(&self) -> Vec<String> {
                self.labels.clone()
            }
        }

        let account = Account {
            id: 9,
            labels: vec!["vip".to_string()],
        };
        let ctx = Context::from_subject(&account);
        assert_eq!(ctx.user_id(), Some("9"));
        assert_eq!(ctx.group(), Some("accounts"));
        assert_eq!(ctx.tags(), ["vip"]);
    }

    #[test]
    fn test_extra_wins_on_merge() {
        let base = Context::new().with_user_id(1).with_role("user");
        let extra = Context::new().with_role("admin").with_allow_deprecated(true);

        let merged = base.merged_with(&extra);
        assert_eq!(merged.user_id(), Some("1"));
        assert_eq!(merged.role(), Some("admin"));
        assert!(merged.allow_deprecated());
    }
}

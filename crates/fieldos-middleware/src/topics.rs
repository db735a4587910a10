//! Topic names, wildcard filters and the topic registry.
//!
//! Topics are `/`-separated hierarchies such as `sensors/tof/data`.  Filters
//! may use two wildcards, each occupying a whole segment:
//!
//! | Wildcard | Matches |
//! |---|---|
//! | `+` | exactly one segment |
//! | `#` | zero or more trailing segments (last segment only) |
//!
//! Topics whose first segment starts with `$` are not matched by a leading
//! wildcard.
//!
//! Filters are compiled once into a [`TopicTrie`]; routing a message is a
//! walk down the trie rather than a per-filter string comparison.

use std::cmp::Ordering;
use std::collections::HashMap;

use fieldos_types::{FieldError, MessagePriority, QoS};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Well-known topics
// ────────────────────────────────────────────────────────────────────────────

pub const SYSTEM_HEALTH: &str = "system/health";
pub const SYSTEM_STATE: &str = "system/state";
pub const EMERGENCY_STOP: &str = "safety/emergency_stop";
pub const HEARTBEAT_FILTER: &str = "system/heartbeat/+";
pub const SAFETY_ALERTS_FILTER: &str = "safety/alerts/+";
pub const ORCHESTRATOR_COMMANDS: &str = "commands/orchestrator";
pub const ORCHESTRATOR_RESPONSES: &str = "responses/orchestrator";

pub fn heartbeat(service_id: &str) -> String {
    format!("system/heartbeat/{service_id}")
}

pub fn service_status(service_id: &str) -> String {
    format!("system/services/{service_id}/status")
}

pub fn system_event(kind: &str) -> String {
    format!("system/events/{kind}")
}

pub fn safety_alert(kind: &str) -> String {
    format!("safety/alerts/{kind}")
}

pub fn command(service: &str) -> String {
    format!("commands/{service}")
}

pub fn response(service: &str) -> String {
    format!("responses/{service}")
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

fn invalid(topic: &str, reason: &str) -> FieldError {
    FieldError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}

/// Validate a concrete topic name (no wildcards).
pub fn validate_topic_name(topic: &str) -> Result<(), FieldError> {
    if topic.is_empty() {
        return Err(invalid(topic, "empty topic"));
    }
    if topic.contains(['+', '#']) {
        return Err(invalid(topic, "wildcards are not allowed in topic names"));
    }
    if topic.contains('\0') {
        return Err(invalid(topic, "NUL character"));
    }
    Ok(())
}

/// Validate a subscription filter.
pub fn validate_filter(filter: &str) -> Result<(), FieldError> {
    if filter.is_empty() {
        return Err(invalid(filter, "empty filter"));
    }
    if filter.contains('\0') {
        return Err(invalid(filter, "NUL character"));
    }
    let segments: Vec<&str> = filter.split('/').collect();
    let last = segments.len() - 1;
    for (i, seg) in segments.iter().enumerate() {
        if seg.contains('#') && (*seg != "#" || i != last) {
            return Err(invalid(filter, "'#' must be the whole last segment"));
        }
        if seg.contains('+') && *seg != "+" {
            return Err(invalid(filter, "'+' must occupy a whole segment"));
        }
    }
    Ok(())
}

/// Returns `true` when `topic` is matched by `filter`.
///
/// Both arguments are assumed valid; see [`validate_filter`].
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let levels: Vec<&str> = topic.split('/').collect();
    let dollar = topic.starts_with('$');

    for (i, seg) in filter.split('/').enumerate() {
        let leading_wildcard_blocked = i == 0 && dollar;
        match (seg, levels.get(i)) {
            ("#", _) => return !leading_wildcard_blocked,
            ("+", Some(_)) if !leading_wildcard_blocked => {}
            (literal, Some(level)) if literal == *level => {}
            _ => return false,
        }
    }
    levels.len() == filter.split('/').count()
}

/// Order two filters that both match the same topic by specificity.
///
/// Segments are compared left to right: a literal beats `+`, and `+` beats
/// `#`.  A pattern that ends where the other continues with `#` is the more
/// specific of the two.
pub fn compare_specificity(a: &str, b: &str) -> Ordering {
    specificity_key(a).cmp(&specificity_key(b))
}

fn specificity_key(filter: &str) -> Vec<u8> {
    let mut key: Vec<u8> = filter
        .split('/')
        .map(|seg| match seg {
            "#" => 0,
            "+" => 2,
            _ => 3,
        })
        .collect();
    key.push(1);
    key
}

// ────────────────────────────────────────────────────────────────────────────
// Matcher trie
// ────────────────────────────────────────────────────────────────────────────

struct TrieNode<T> {
    children: HashMap<String, TrieNode<T>>,
    single: Option<Box<TrieNode<T>>>,
    /// Values registered with a trailing `#` at this level.
    multi: Vec<T>,
    /// Values whose filter ends exactly here.
    values: Vec<T>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            single: None,
            multi: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<T> TrieNode<T> {
    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.single.is_none()
            && self.multi.is_empty()
            && self.values.is_empty()
    }
}

/// Compiled set of wildcard filters, each carrying one or more values.
pub struct TopicTrie<T> {
    root: TrieNode<T>,
    len: usize,
}

impl<T> Default for TopicTrie<T> {
    fn default() -> Self {
        Self {
            root: TrieNode::default(),
            len: 0,
        }
    }
}

impl<T> TopicTrie<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of values stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `value` under `filter`.  The filter must be valid.
    pub fn insert(&mut self, filter: &str, value: T) {
        let mut node = &mut self.root;
        for seg in filter.split('/') {
            node = match seg {
                "#" => {
                    node.multi.push(value);
                    self.len += 1;
                    return;
                }
                "+" => node.single.get_or_insert_with(Default::default).as_mut(),
                literal => node.children.entry(literal.to_string()).or_default(),
            };
        }
        node.values.push(value);
        self.len += 1;
    }

    /// Remove every value under exactly `filter` for which `pred` holds.
    ///
    /// Returns the number of values removed.  Empty branches are pruned.
    pub fn remove_where(&mut self, filter: &str, mut pred: impl FnMut(&T) -> bool) -> usize {
        let segments: Vec<&str> = filter.split('/').collect();
        let removed = Self::remove_in(&mut self.root, &segments, &mut pred);
        self.len -= removed;
        removed
    }

    fn remove_in(node: &mut TrieNode<T>, segs: &[&str], pred: &mut impl FnMut(&T) -> bool) -> usize {
        fn retain<T>(list: &mut Vec<T>, pred: &mut impl FnMut(&T) -> bool) -> usize {
            let before = list.len();
            list.retain(|v| !pred(v));
            before - list.len()
        }

        let Some((head, rest)) = segs.split_first() else {
            return retain(&mut node.values, pred);
        };
        match *head {
            "#" => retain(&mut node.multi, pred),
            "+" => {
                let Some(child) = node.single.as_mut() else {
                    return 0;
                };
                let n = Self::remove_in(child, rest, pred);
                if child.is_empty() {
                    node.single = None;
                }
                n
            }
            literal => {
                let Some(child) = node.children.get_mut(literal) else {
                    return 0;
                };
                let n = Self::remove_in(child, rest, pred);
                if child.is_empty() {
                    node.children.remove(literal);
                }
                n
            }
        }
    }

    /// All values whose filter matches `topic`.
    pub fn matches(&self, topic: &str) -> Vec<&T> {
        let segments: Vec<&str> = topic.split('/').collect();
        let dollar = topic.starts_with('$');
        let mut out = Vec::new();
        Self::collect(&self.root, &segments, 0, dollar, &mut out);
        out
    }

    fn collect<'a>(node: &'a TrieNode<T>, segs: &[&str], depth: usize, dollar: bool, out: &mut Vec<&'a T>) {
        let wildcards_allowed = !(depth == 0 && dollar);
        if wildcards_allowed {
            out.extend(node.multi.iter());
        }
        let Some((head, rest)) = segs.split_first() else {
            out.extend(node.values.iter());
            return;
        };
        if let Some(child) = node.children.get(*head) {
            Self::collect(child, rest, depth + 1, dollar, out);
        }
        if wildcards_allowed {
            if let Some(child) = node.single.as_deref() {
                Self::collect(child, rest, depth + 1, dollar, out);
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// Delivery rule for every topic matched by `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDefinition {
    pub pattern: String,
    pub qos: QoS,
    pub retained: bool,
    /// Token-bucket limit shared by every topic matched by `pattern`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub priority: MessagePriority,
}

impl TopicDefinition {
    pub fn new(pattern: impl Into<String>, qos: QoS, retained: bool) -> Self {
        Self {
            pattern: pattern.into(),
            qos,
            retained,
            rate_limit_per_minute: None,
            priority: MessagePriority::Standard,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }
}

/// Catalogue of topic rules, resolved by most-specific match.
///
/// Unknown topics resolve to a conservative default (`qos=1`, not retained,
/// standard priority, unlimited) so producers are never blocked by gaps in
/// the catalogue.
pub struct TopicRegistry {
    rules: TopicTrie<TopicDefinition>,
    version: u64,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl TopicRegistry {
    /// A registry with no rules at all.
    pub fn empty() -> Self {
        Self {
            rules: TopicTrie::new(),
            version: 0,
        }
    }

    /// The standard FieldOS topic hierarchy.
    pub fn with_defaults() -> Self {
        use MessagePriority::*;
        use QoS::*;

        let mut registry = Self::empty();
        let defaults = [
            TopicDefinition::new("sensors/+/data", AtLeastOnce, false)
                .with_priority(Telemetry)
                .with_rate_limit(600),
            TopicDefinition::new("sensors/+/status", AtLeastOnce, true),
            TopicDefinition::new("safety/alerts/+", ExactlyOnce, true).with_priority(Safety),
            TopicDefinition::new(EMERGENCY_STOP, ExactlyOnce, true).with_priority(Safety),
            TopicDefinition::new("safety/#", ExactlyOnce, false).with_priority(Safety),
            TopicDefinition::new("power/#", AtLeastOnce, true),
            TopicDefinition::new("commands/+", ExactlyOnce, false).with_priority(Command),
            TopicDefinition::new("responses/+", ExactlyOnce, false).with_priority(Command),
            TopicDefinition::new(SYSTEM_HEALTH, AtLeastOnce, true),
            TopicDefinition::new("system/services/+/status", AtLeastOnce, true),
            TopicDefinition::new("system/events/+", AtLeastOnce, false),
            TopicDefinition::new(HEARTBEAT_FILTER, AtLeastOnce, false),
            TopicDefinition::new(SYSTEM_STATE, ExactlyOnce, true).with_priority(Command),
            TopicDefinition::new("vision/#", AtMostOnce, false)
                .with_priority(Telemetry)
                .with_rate_limit(120),
            TopicDefinition::new("weather/#", AtLeastOnce, true),
            TopicDefinition::new("navigation/#", AtLeastOnce, false),
        ];
        for def in defaults {
            registry
                .register(def)
                .expect("built-in topic patterns are valid filters");
        }
        registry.version = 1;
        registry
    }

    /// Add or overwrite the rule for `def.pattern`.
    pub fn register(&mut self, def: TopicDefinition) -> Result<(), FieldError> {
        validate_filter(&def.pattern)?;
        let pattern = def.pattern.clone();
        self.rules.remove_where(&pattern, |existing| existing.pattern == pattern);
        self.rules.insert(&pattern, def);
        self.version += 1;
        Ok(())
    }

    /// The most specific rule matching `topic`, if any.
    pub fn resolve(&self, topic: &str) -> Option<&TopicDefinition> {
        self.rules
            .matches(topic)
            .into_iter()
            .max_by(|a, b| compare_specificity(&a.pattern, &b.pattern))
    }

    /// [`resolve`](Self::resolve), falling back to the conservative default.
    pub fn resolve_or_default(&self, topic: &str) -> TopicDefinition {
        self.resolve(topic)
            .cloned()
            .unwrap_or_else(|| TopicDefinition::new(topic, QoS::AtLeastOnce, false))
    }

    pub fn recommended_qos(&self, topic: &str) -> QoS {
        self.resolve(topic).map_or(QoS::AtLeastOnce, |d| d.qos)
    }

    pub fn should_retain(&self, topic: &str) -> bool {
        self.resolve(topic).is_some_and(|d| d.retained)
    }

    pub fn priority(&self, topic: &str) -> MessagePriority {
        self.resolve(topic).map_or(MessagePriority::Standard, |d| d.priority)
    }

    /// Incremented on every registration.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

//! Mock rules and the matcher that picks one for a request.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a rule's `path` is compared against the request path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    #[default]
    Exact,
    Prefix,
    /// Unanchored regular expression
    Regex,
}

impl MatchKind {
    /// Tie-breaker between rules of equal priority. Higher wins.
    pub fn specificity(self) -> u8 {
        match self {
            MatchKind::Exact => 3,
            MatchKind::Prefix => 2,
            MatchKind::Regex => 1,
        }
    }
}

/// A canned response served instead of the local service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockRule {
    #[serde(default = "new_rule_id")]
    pub id: String,

    /// `*` or an HTTP method, compared case-insensitively
    #[serde(default = "any_method")]
    pub method: String,

    pub path: String,

    #[serde(default, alias = "path_type")]
    pub match_kind: MatchKind,

    #[serde(default = "default_status")]
    pub status_code: u16,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub delay_ms: u64,

    /// Higher wins
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub description: Option<String>,
}

fn new_rule_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn any_method() -> String {
    "*".to_string()
}

fn default_status() -> u16 {
    200
}

fn default_true() -> bool {
    true
}

impl MockRule {
    fn accepts_method(&self, method: &str) -> bool {
        self.method == "*" || self.method.eq_ignore_ascii_case(method)
    }

    fn accepts_path(&self, path: &str) -> bool {
        match self.match_kind {
            MatchKind::Exact => self.path == path,
            MatchKind::Prefix => path.starts_with(&self.path),
            MatchKind::Regex => regex_lite::Regex::new(&self.path)
                .map(|re| re.is_match(path))
                .unwrap_or(false),
        }
    }
}

/// Best rule for a request, or `None`.
///
/// The query string is ignored. Among matching rules the highest priority
/// wins, then the most specific kind, then the earliest rule.
pub fn find_match<'a>(rules: &'a [MockRule], method: &str, path: &str) -> Option<&'a MockRule> {
    let path = path.split('?').next().unwrap_or(path);
    rules
        .iter()
        .filter(|r| r.enabled && r.accepts_method(method) && r.accepts_path(path))
        .min_by_key(|r| (Reverse(r.priority), Reverse(r.match_kind.specificity())))
}

/// Read-only source of mock rules.
pub trait MockStore: Send + Sync {
    fn list_enabled_rules(&self) -> Vec<MockRule>;
}

/// Rules fixed at startup, usually from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticMockStore {
    rules: Vec<MockRule>,
}

impl StaticMockStore {
    pub fn new(rules: Vec<MockRule>) -> Self {
        Self { rules }
    }
}

impl MockStore for StaticMockStore {
    fn list_enabled_rules(&self) -> Vec<MockRule> {
        self.rules.iter().filter(|r| r.enabled).cloned().collect()
    }
}

//! Identity and access-control data model.
//!
//! Everything here is plain data. Persistence lives in [`super::store`],
//! decisions in [`super::access`].

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Well-known name of the anonymous identity.
pub const EVERYONE: &str = "*";

/// Marker that turns a topic pattern into a prefix match.
pub const WILDCARD: char = '*';

/// Maximum length of a topic name or topic pattern.
pub const MAX_TOPIC_LEN: usize = 64;

static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-_.@a-zA-Z0-9]+$").unwrap());
static TOPIC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-_A-Za-z0-9]{1,64}$").unwrap());
static TOPIC_PATTERN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-_A-Za-z0-9]*\*?$").unwrap());

/// Returns true if `name` is a valid username. The anonymous marker is not.
pub fn allowed_username(name: &str) -> bool {
    USERNAME_RE.is_match(name)
}

/// Like [`allowed_username`], but also accepts the anonymous marker.
pub fn allowed_grant_owner(name: &str) -> bool {
    name == EVERYONE || allowed_username(name)
}

/// Returns true if `topic` is a valid concrete topic name (no wildcard).
pub fn allowed_topic(topic: &str) -> bool {
    TOPIC_RE.is_match(topic)
}

/// Returns true if `pattern` is a valid topic pattern: a topic name, optionally
/// ending in a single wildcard marker.
pub fn allowed_topic_pattern(pattern: &str) -> bool {
    !pattern.is_empty() && pattern.len() <= MAX_TOPIC_LEN && TOPIC_PATTERN_RE.is_match(pattern)
}

/// Role of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Passes every authorization check.
    Admin,
    /// Regular account, governed by grants.
    User,
    /// Reserved for the [`EVERYONE`] identity.
    Anonymous,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Anonymous => "anonymous",
        }
    }

    /// Whether the role may be given to an account via add/change-role.
    pub fn is_assignable(&self) -> bool {
        matches!(self, Self::Admin | Self::User)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            "anonymous" => Ok(Self::Anonymous),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Kind of access requested on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// A stored permission binding one identity to one topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub topic_pattern: String,
    pub allow_read: bool,
    pub allow_write: bool,
    pub is_wildcard: bool,
}

impl Grant {
    pub fn new(topic_pattern: impl Into<String>, allow_read: bool, allow_write: bool) -> Self {
        let topic_pattern = topic_pattern.into();
        let is_wildcard = topic_pattern.ends_with(WILDCARD);
        Self {
            topic_pattern,
            allow_read,
            allow_write,
            is_wildcard,
        }
    }

    /// Exact, non-wildcard match on `topic`.
    pub fn matches_exact(&self, topic: &str) -> bool {
        !self.is_wildcard && self.topic_pattern == topic
    }

    /// Prefix match for wildcard grants; false for exact grants.
    pub fn matches_wildcard(&self, topic: &str) -> bool {
        self.is_wildcard && topic.starts_with(self.topic_pattern.trim_end_matches(WILDCARD))
    }

    pub fn allows(&self, perm: Permission) -> bool {
        match perm {
            Permission::Read => self.allow_read,
            Permission::Write => self.allow_write,
        }
    }
}

/// A grant the user provisioned for themselves, together with the anonymous
/// identity's flags on the same pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub topic_pattern: String,
    pub allow_read: bool,
    pub allow_write: bool,
    pub allow_everyone_read: bool,
    pub allow_everyone_write: bool,
}

/// A session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub expires: DateTime<Utc>,
}

/// Usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub messages: i64,
    pub emails: i64,
}

/// Per-user client settings. Stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationPrefs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(default)]
    pub min_priority: i32,
    #[serde(default)]
    pub delete_after: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub base_url: String,
    pub topic: String,
    #[serde(default)]
    pub display_name: String,
}

/// Account type and its limits. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "name")]
    pub code: String,
    #[serde(default)]
    pub upgradable: bool,
    #[serde(default)]
    pub messages_limit: i64,
    #[serde(default)]
    pub emails_limit: i64,
    #[serde(default)]
    pub topics_limit: i64,
    #[serde(default)]
    pub attachment_file_size_limit: i64,
    #[serde(default)]
    pub attachment_total_size_limit: i64,
}

/// An identity as reconstructed from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub name: String,
    /// PHC-format password hash; empty for the anonymous identity.
    pub hash: String,
    /// Set only when the user authenticated with a token.
    pub token: Option<String>,
    pub role: Role,
    /// Always empty for admins.
    pub grants: Vec<Grant>,
    pub stats: Stats,
    pub prefs: Option<Prefs>,
    pub plan: Option<Plan>,
}

impl User {
    /// The anonymous identity with no grants loaded.
    pub fn everyone() -> Self {
        Self {
            name: EVERYONE.to_string(),
            hash: String::new(),
            token: None,
            role: Role::Anonymous,
            grants: Vec::new(),
            stats: Stats::default(),
            prefs: None,
            plan: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_grammar() {
        assert!(allowed_username("phil"));
        assert!(allowed_username("first.last@example.com"));
        assert!(allowed_username("a-b_c"));
        assert!(!allowed_username(""));
        assert!(!allowed_username("  invalid  "));
        assert!(!allowed_username(EVERYONE));
        assert!(allowed_grant_owner(EVERYONE));
    }

    #[test]
    fn topic_grammar() {
        assert!(allowed_topic("mytopic"));
        assert!(allowed_topic(&"a".repeat(64)));
        assert!(!allowed_topic(&"a".repeat(65)));
        assert!(!allowed_topic("up*"));
        assert!(!allowed_topic(""));
        assert!(!allowed_topic("with space"));
    }

    #[test]
    fn topic_pattern_grammar() {
        assert!(allowed_topic_pattern("up*"));
        assert!(allowed_topic_pattern("*"));
        assert!(allowed_topic_pattern("exact"));
        assert!(allowed_topic_pattern(&"a".repeat(64)));
        assert!(allowed_topic_pattern(&format!("{}*", "a".repeat(63))));
        assert!(!allowed_topic_pattern(&format!("{}*", "a".repeat(64))));
        assert!(!allowed_topic_pattern("a*b"));
        assert!(!allowed_topic_pattern("**"));
        assert!(!allowed_topic_pattern(""));
    }

    #[test]
    fn grant_matching() {
        let wildcard = Grant::new("up*", false, true);
        assert!(wildcard.is_wildcard);
        assert!(wildcard.matches_wildcard("up1234"));
        assert!(wildcard.matches_wildcard("up"));
        assert!(!wildcard.matches_wildcard("down1"));
        assert!(!wildcard.matches_exact("up*"));

        let exact = Grant::new("mytopic", true, false);
        assert!(!exact.is_wildcard);
        assert!(exact.matches_exact("mytopic"));
        assert!(!exact.matches_wildcard("mytopic"));
        assert!(exact.allows(Permission::Read));
        assert!(!exact.allows(Permission::Write));

        assert!(Grant::new("*", true, true).matches_wildcard("anything"));
    }

    #[test]
    fn role_parsing_and_assignability() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert!("invalid-role".parse::<Role>().is_err());
        assert!(Role::Admin.is_assignable());
        assert!(Role::User.is_assignable());
        assert!(!Role::Anonymous.is_assignable());
    }

    #[test]
    fn prefs_json_shape() {
        let prefs: Prefs = serde_json::from_str(
            r#"{"language":"de","notification":{"sound":"ding","min_priority":2}}"#,
        )
        .unwrap();
        assert_eq!(prefs.language.as_deref(), Some("de"));
        let notification = prefs.notification.unwrap();
        assert_eq!(notification.min_priority, 2);
        assert_eq!(notification.delete_after, 0);
        assert!(prefs.subscriptions.is_empty());
    }
}

//! Access resolution.
//!
//! A decision looks at exactly one grant, chosen by fixed precedence:
//!
//! 1. the caller's own exact grant on the topic
//! 2. the caller's own wildcard grant covering the topic
//! 3. the anonymous identity's exact grant
//! 4. the anonymous identity's wildcard grant
//!
//! If nothing matches, the deployment's default policy applies. Flags of
//! lower-priority matches are never merged in, so a user-specific deny beats
//! a broader anonymous allow.

use super::types::{Grant, Permission, Role};

/// Outcome when no grant matches a topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultAccess {
    pub read: bool,
    pub write: bool,
}

impl DefaultAccess {
    pub fn allows(&self, perm: Permission) -> bool {
        match perm {
            Permission::Read => self.read,
            Permission::Write => self.write,
        }
    }
}

/// Pick the grant that decides access to `topic`, if any.
pub fn winning_grant<'a>(own: &'a [Grant], everyone: &'a [Grant], topic: &str) -> Option<&'a Grant> {
    own.iter()
        .find(|g| g.matches_exact(topic))
        .or_else(|| most_specific_wildcard(own, topic))
        .or_else(|| everyone.iter().find(|g| g.matches_exact(topic)))
        .or_else(|| most_specific_wildcard(everyone, topic))
}

/// Longest covering wildcard, so `up1*` wins over `up*` within one owner.
fn most_specific_wildcard<'a>(grants: &'a [Grant], topic: &str) -> Option<&'a Grant> {
    grants
        .iter()
        .filter(|g| g.matches_wildcard(topic))
        .max_by_key(|g| g.topic_pattern.len())
}

/// Decide whether an identity with `role` and grants `own` may use `topic`
/// with `perm`. Pass `role = None` for an unauthenticated caller.
pub fn authorize(
    role: Option<Role>,
    own: &[Grant],
    everyone: &[Grant],
    topic: &str,
    perm: Permission,
    defaults: DefaultAccess,
) -> bool {
    if role == Some(Role::Admin) {
        return true;
    }
    match winning_grant(own, everyone, topic) {
        Some(grant) => grant.allows(perm),
        None => defaults.allows(perm),
    }
}

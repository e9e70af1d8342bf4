//! Identity and access control for a topic-based publish/subscribe service.
//!
//! Provides:
//! - User accounts with roles (admin, user, and the built-in anonymous identity `*`)
//! - Password authentication with PBKDF2 hashes and timing-uniform failures
//! - Per-user topic grants with trailing-wildcard patterns and fixed precedence
//! - Opaque, expiring session tokens (several per user)
//! - Buffered per-user usage stats, written in batches
//! - A SQLite store that migrates older layouts in place
//!
//! [`Manager`] ties these together; request handlers usually only need the
//! [`Auther`] trait.

pub mod access;
pub mod error;
pub mod manager;
pub mod migration;
pub mod password;
pub mod stats;
pub mod store;
pub mod tokens;
pub mod types;

pub use access::DefaultAccess;
pub use error::{AuthError, Result};
pub use manager::{Auther, Manager};
pub use store::IdentityStore;
pub use types::{
    NotificationPrefs, Permission, Plan, Prefs, Reservation, Role, Stats, Subscription, Token,
    User, EVERYONE,
};

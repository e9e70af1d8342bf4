//! Public facade over the identity store, authenticator, token manager and
//! stats queue.

use super::access::{self, DefaultAccess};
use super::error::{AuthError, Result};
use super::password::CredentialHasher;
use super::stats::StatsQueue;
use super::store::IdentityStore;
use super::tokens::TokenManager;
use super::types::{
    allowed_grant_owner, allowed_topic_pattern, allowed_username, Permission, Plan, Reservation,
    Role, Token, User,
};
use crate::config::AuthConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Authentication and authorization as consumed by request handlers.
pub trait Auther: Send + Sync {
    /// Check a username and password. Unknown users and wrong passwords fail
    /// identically and take the same time.
    fn authenticate(&self, username: &str, password: &str) -> Result<User>;

    /// `Ok(())` if `user` (or an anonymous caller, for `None`) may use `topic`
    /// with `perm`.
    fn authorize(&self, user: Option<&User>, topic: &str, perm: Permission) -> Result<()>;
}

pub struct Manager {
    store: Arc<IdentityStore>,
    hasher: CredentialHasher,
    tokens: Arc<TokenManager>,
    stats: Arc<StatsQueue>,
    defaults: DefaultAccess,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Open the store named in `config`, migrate it, and start the background
    /// stats writer (and token sweeper, if configured).
    pub fn open(config: &AuthConfig) -> Result<Self> {
        let store = IdentityStore::open(&config.database_path)?;
        Self::with_store(Arc::new(store), config)
    }

    /// Build a manager around an already-open store.
    ///
    /// Background work is spawned onto the current Tokio runtime. Outside a
    /// runtime nothing is spawned and stats are only written by
    /// [`Manager::flush_stats`] or [`Manager::shutdown`].
    pub fn with_store(store: Arc<IdentityStore>, config: &AuthConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AuthError::invalid(e.to_string()))?;

        let hasher = CredentialHasher::new(config.password_hash_rounds)?;
        let tokens = Arc::new(TokenManager::new(Arc::clone(&store), config.token_ttl_secs));
        let stats = Arc::new(StatsQueue::new());

        let background = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(run_background(
                Arc::clone(&store),
                Arc::clone(&stats),
                Arc::clone(&tokens),
                config.stats_flush_interval(),
                config.token_sweep_interval(),
            ))),
            Err(_) => {
                tracing::warn!("No Tokio runtime; stats are written only on explicit flush");
                None
            }
        };

        Ok(Self {
            store,
            hasher,
            tokens,
            stats,
            defaults: DefaultAccess {
                read: config.default_read,
                write: config.default_write,
            },
            background: Mutex::new(background),
        })
    }

    // ── Users ───────────────────────────────────────────────────────

    pub fn add_user(&self, name: &str, password: &str, role: Role) -> Result<()> {
        if !allowed_username(name) {
            return Err(AuthError::invalid(format!("invalid username '{name}'")));
        }
        if !role.is_assignable() {
            return Err(AuthError::invalid(format!("role '{role}' cannot be assigned")));
        }
        let hash = self.hasher.hash(password)?;
        self.store.insert_user(name, &hash, role)?;
        tracing::info!(user = name, role = %role, "User added");
        Ok(())
    }

    pub fn remove_user(&self, name: &str) -> Result<()> {
        require_username(name)?;
        self.store.remove_user(name)?;
        tracing::info!(user = name, "User removed");
        Ok(())
    }

    pub fn change_role(&self, name: &str, role: Role) -> Result<()> {
        require_username(name)?;
        if !role.is_assignable() {
            return Err(AuthError::invalid(format!("role '{role}' cannot be assigned")));
        }
        self.store.change_role(name, role)?;
        tracing::info!(user = name, role = %role, "User role changed");
        Ok(())
    }

    pub fn change_password(&self, name: &str, password: &str) -> Result<()> {
        require_username(name)?;
        let hash = self.hasher.hash(password)?;
        self.store.change_password(name, &hash)
    }

    /// Persist `user.prefs` verbatim.
    pub fn change_settings(&self, user: &User) -> Result<()> {
        require_username(&user.name)?;
        self.store.change_prefs(&user.name, user.prefs.as_ref())
    }

    pub fn change_plan(&self, name: &str, plan: Option<&Plan>) -> Result<()> {
        require_username(name)?;
        self.store.change_plan(name, plan)
    }

    pub fn user(&self, name: &str) -> Result<User> {
        self.store.user(name)?.ok_or(AuthError::NotFound)
    }

    pub fn users(&self) -> Result<Vec<User>> {
        self.store.users()
    }

    // ── Grants ──────────────────────────────────────────────────────

    /// Grant `username` read/write access to `topic_pattern`, overwriting any
    /// existing grant on the same pattern. `owner` names the user who
    /// provisioned the grant (a topic reservation), if any.
    pub fn allow_access(
        &self,
        owner: Option<&str>,
        username: &str,
        topic_pattern: &str,
        read: bool,
        write: bool,
    ) -> Result<()> {
        let owner = owner.filter(|o| !o.is_empty());
        if let Some(owner) = owner {
            require_username(owner)?;
        }
        if !allowed_grant_owner(username) {
            return Err(AuthError::invalid(format!("invalid username '{username}'")));
        }
        require_topic_pattern(topic_pattern)?;
        self.store
            .upsert_grant(username, topic_pattern, read, write, owner)?;
        tracing::info!(user = username, topic = topic_pattern, read, write, "Access granted");
        Ok(())
    }

    /// Remove the grant on `topic_pattern`, or every grant of `username` when
    /// no pattern is given. Missing grants are not an error.
    pub fn reset_access(&self, username: &str, topic_pattern: Option<&str>) -> Result<()> {
        if !allowed_grant_owner(username) {
            return Err(AuthError::invalid(format!("invalid username '{username}'")));
        }
        let topic_pattern = topic_pattern.filter(|p| !p.is_empty());
        if let Some(pattern) = topic_pattern {
            require_topic_pattern(pattern)?;
        }
        let removed = self.store.delete_grants(username, topic_pattern)?;
        tracing::info!(user = username, removed, "Access reset");
        Ok(())
    }

    pub fn reservations(&self, username: &str) -> Result<Vec<Reservation>> {
        require_username(username)?;
        self.store.reservations(username)
    }

    // ── Tokens ──────────────────────────────────────────────────────

    pub fn authenticate_token(&self, value: &str) -> Result<User> {
        self.tokens.authenticate(value)
    }

    pub fn create_token(&self, user: &User) -> Result<Token> {
        self.tokens.create(user)
    }

    pub fn extend_token(&self, user: &User) -> Result<Token> {
        self.tokens.extend(user)
    }

    pub fn remove_token(&self, user: &User) -> Result<()> {
        self.tokens.remove(user)
    }

    pub fn remove_expired_tokens(&self) -> Result<usize> {
        self.tokens.remove_expired()
    }

    // ── Stats ───────────────────────────────────────────────────────

    /// Queue the user's current stats for the next flush. Never blocks on
    /// the store.
    pub fn enqueue_stats(&self, user: &User) {
        self.stats.enqueue(user);
    }

    /// Write all pending stats now.
    pub fn flush_stats(&self) -> Result<usize> {
        self.stats.flush(&self.store)
    }

    /// Stop background work and write whatever stats are still pending.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.background.lock().take() {
            handle.abort();
        }
        self.flush_stats()?;
        Ok(())
    }
}

impl Auther for Manager {
    fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        // Malformed names cannot exist; they take the unknown-user path.
        let user = if allowed_username(username) {
            self.store.user(username)?
        } else {
            None
        };

        // One verification on every path, outside the store lock.
        let stored = user.as_ref().map(|u| u.hash.as_str());
        if !self.hasher.verify(password, stored) {
            return Err(AuthError::Unauthenticated);
        }
        let mut user = user.ok_or(AuthError::Unauthenticated)?;

        if self.hasher.needs_rehash(&user.hash) {
            self.upgrade_hash(&mut user, password);
        }
        Ok(user)
    }

    fn authorize(&self, user: Option<&User>, topic: &str, perm: Permission) -> Result<()> {
        if user.is_some_and(User::is_admin) {
            return Ok(());
        }
        let grants = self.store.access_grants(user.map(|u| u.name.as_str()))?;
        let allowed = access::authorize(
            user.map(|u| u.role),
            &grants.own,
            &grants.everyone,
            topic,
            perm,
            self.defaults,
        );
        if allowed {
            Ok(())
        } else {
            Err(AuthError::Unauthorized)
        }
    }
}

impl Manager {
    /// Replace a legacy or outdated hash after a successful login. Failure
    /// leaves the old hash in place and does not fail the login.
    fn upgrade_hash(&self, user: &mut User, password: &str) {
        let upgraded = self
            .hasher
            .hash(password)
            .and_then(|hash| self.store.change_password(&user.name, &hash).map(|()| hash));
        match upgraded {
            Ok(hash) => {
                user.hash = hash;
                tracing::info!(user = %user.name, "Upgraded password hash");
            }
            Err(e) => tracing::warn!(user = %user.name, "Failed to upgrade password hash: {e}"),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Some(handle) = self.background.get_mut().take() {
            handle.abort();
        }
    }
}

fn require_username(name: &str) -> Result<()> {
    if allowed_username(name) {
        Ok(())
    } else {
        Err(AuthError::invalid(format!("invalid username '{name}'")))
    }
}

fn require_topic_pattern(pattern: &str) -> Result<()> {
    if allowed_topic_pattern(pattern) {
        Ok(())
    } else {
        Err(AuthError::invalid(format!("invalid topic pattern '{pattern}'")))
    }
}

/// Periodic stats flush plus the optional token sweep.
async fn run_background(
    store: Arc<IdentityStore>,
    stats: Arc<StatsQueue>,
    tokens: Arc<TokenManager>,
    flush_every: Duration,
    sweep_every: Option<Duration>,
) {
    let mut flush = tokio::time::interval_at(Instant::now() + flush_every, flush_every);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = sweep_every.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = flush.tick() => {
                let (store, stats) = (Arc::clone(&store), Arc::clone(&stats));
                match tokio::task::spawn_blocking(move || stats.flush(&store)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("Failed to write user stats: {e}"),
                    Err(e) => tracing::warn!("Stats writer task failed: {e}"),
                }
            }
            _ = async {
                match sweep.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let tokens = Arc::clone(&tokens);
                match tokio::task::spawn_blocking(move || tokens.remove_expired()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("Failed to remove expired tokens: {e}"),
                    Err(e) => tracing::warn!("Token sweep task failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::EVERYONE;

    fn test_manager() -> Manager {
        let config = AuthConfig {
            password_hash_rounds: 1_000,
            ..AuthConfig::default()
        };
        Manager::with_store(Arc::new(IdentityStore::open_in_memory().unwrap()), &config).unwrap()
    }

    #[test]
    fn add_user_validates_name_and_role() {
        let manager = test_manager();
        assert!(matches!(
            manager.add_user("  invalid  ", "pass", Role::Admin),
            Err(AuthError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.add_user(EVERYONE, "pass", Role::User),
            Err(AuthError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.add_user("validuser", "pass", Role::Anonymous),
            Err(AuthError::InvalidArgument(_))
        ));
        manager.add_user("validuser", "pass", Role::User).unwrap();
        assert!(matches!(
            manager.add_user("validuser", "pass", Role::User),
            Err(AuthError::Conflict(_))
        ));
    }

    #[test]
    fn anonymous_identity_is_protected() {
        let manager = test_manager();
        for result in [
            manager.remove_user(EVERYONE),
            manager.change_role(EVERYONE, Role::User),
            manager.change_password(EVERYONE, "pass"),
        ] {
            assert!(matches!(result, Err(AuthError::InvalidArgument(_))));
        }
        assert_eq!(manager.user(EVERYONE).unwrap().role, Role::Anonymous);
    }

    #[test]
    fn anonymous_name_never_authenticates() {
        let manager = test_manager();
        assert!(matches!(
            manager.authenticate(EVERYONE, ""),
            Err(AuthError::Unauthenticated)
        ));
    }

    #[test]
    fn allow_access_validates_grammar() {
        let manager = test_manager();
        manager.add_user("ben", "ben", Role::User).unwrap();
        let too_long = "x".repeat(65);
        for pattern in ["", "a*b", "with space", too_long.as_str()] {
            assert!(matches!(
                manager.allow_access(None, "ben", pattern, true, true),
                Err(AuthError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            manager.allow_access(None, "bad name", "topic", true, true),
            Err(AuthError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.allow_access(Some(EVERYONE), "ben", "topic", true, true),
            Err(AuthError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.allow_access(None, "ghost", "topic", true, true),
            Err(AuthError::NotFound)
        ));
        manager.allow_access(Some(""), "ben", "topic", true, true).unwrap();
        manager.allow_access(None, EVERYONE, "up*", false, true).unwrap();
    }

    #[test]
    fn change_settings_requires_existing_user() {
        let manager = test_manager();
        let mut ghost = User::everyone();
        ghost.name = "ghost".into();
        assert!(matches!(manager.change_settings(&ghost), Err(AuthError::NotFound)));
    }

    #[test]
    fn plan_round_trip() {
        let manager = test_manager();
        manager.add_user("ben", "ben", Role::User).unwrap();
        let plan = Plan {
            code: "pro".into(),
            upgradable: true,
            messages_limit: 10_000,
            emails_limit: 100,
            topics_limit: 10,
            attachment_file_size_limit: 1 << 20,
            attachment_total_size_limit: 1 << 30,
        };
        manager.change_plan("ben", Some(&plan)).unwrap();
        assert_eq!(manager.user("ben").unwrap().plan, Some(plan));
        manager.change_plan("ben", None).unwrap();
        assert!(manager.user("ben").unwrap().plan.is_none());
    }

    #[test]
    fn shutdown_flushes_pending_stats_without_runtime() {
        let manager = test_manager();
        manager.add_user("ben", "ben", Role::User).unwrap();
        let mut ben = manager.user("ben").unwrap();
        ben.stats.messages = 4;
        manager.enqueue_stats(&ben);
        assert_eq!(manager.user("ben").unwrap().stats.messages, 0);

        manager.shutdown().unwrap();
        assert_eq!(manager.user("ben").unwrap().stats.messages, 4);
    }

    #[test]
    fn login_upgrades_hash_to_configured_rounds() {
        let store = Arc::new(IdentityStore::open_in_memory().unwrap());
        let weak = AuthConfig {
            password_hash_rounds: 1_000,
            ..AuthConfig::default()
        };
        Manager::with_store(Arc::clone(&store), &weak)
            .unwrap()
            .add_user("ben", "ben", Role::User)
            .unwrap();

        let strong = AuthConfig {
            password_hash_rounds: 2_000,
            ..AuthConfig::default()
        };
        let manager = Manager::with_store(store, &strong).unwrap();
        assert!(manager.user("ben").unwrap().hash.contains("i=1000"));

        let ben = manager.authenticate("ben", "ben").unwrap();
        assert!(ben.hash.contains("i=2000"));
        assert_eq!(manager.user("ben").unwrap().hash, ben.hash);
        manager.authenticate("ben", "ben").unwrap();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = AuthConfig {
            stats_flush_interval_secs: 0,
            ..AuthConfig::default()
        };
        let store = Arc::new(IdentityStore::open_in_memory().unwrap());
        assert!(matches!(
            Manager::with_store(store, &config),
            Err(AuthError::InvalidArgument(_))
        ));
    }
}

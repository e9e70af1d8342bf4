//! SQLite-backed identity store.
//!
//! Tables (see [`super::migration`] for the full layout):
//! - `user`: name, password hash, role, plan
//! - `user_grant`: owner, topic pattern, read/write flags, wildcard flag
//! - `user_token`: token value, owner, expiry
//! - `user_stats`, `user_prefs`: per-user counters and settings
//!
//! Every statement runs under one connection mutex, and multi-statement
//! updates run in a transaction, so writes to the same row never interleave.

use super::error::{AuthError, Result};
use super::migration;
use super::types::{Grant, Plan, Prefs, Reservation, Role, Stats, User, EVERYONE};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::collections::HashMap;
use std::path::Path;

/// Grants of one identity plus those of the anonymous identity, read together.
#[derive(Debug, Clone, Default)]
pub struct AccessGrants {
    pub own: Vec<Grant>,
    pub everyone: Vec<Grant>,
}

/// Durable store of users, grants, tokens, stats and preferences.
pub struct IdentityStore {
    conn: Mutex<Connection>,
}

impl IdentityStore {
    /// Open (or create) the store at `db_path` and migrate it to the current
    /// schema version.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let store = Self::init(conn)?;
        tracing::info!(path = %db_path.display(), "Identity store opened");
        Ok(store)
    }

    /// In-memory store, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        // Foreign keys stay off while migrating so table rebuilds cannot cascade.
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        migration::setup(&mut conn)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// The stored schema version marker.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let version = conn.query_row("SELECT version FROM schemaVersion WHERE id = 1", [], |row| {
            row.get(0)
        })?;
        Ok(version)
    }

    // ── Users ───────────────────────────────────────────────────────

    /// Insert a new user. Fails with [`AuthError::Conflict`] if the name is taken.
    pub fn insert_user(&self, name: &str, hash: &str, role: Role) -> Result<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO user (name, pass, role) VALUES (?1, ?2, ?3)",
            params![name, hash, role],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(AuthError::Conflict(format!("user '{name}' already exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a user together with its grants, tokens, stats and preferences.
    pub fn remove_user(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM user WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    /// Change a user's role. Switching to admin drops the user's grants.
    pub fn change_role(&self, name: &str, role: Role) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE user SET role = ?1 WHERE name = ?2",
            params![role, name],
        )?;
        if updated == 0 {
            return Err(AuthError::NotFound);
        }
        if role == Role::Admin {
            tx.execute("DELETE FROM user_grant WHERE owner = ?1", params![name])?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn change_password(&self, name: &str, hash: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE user SET pass = ?1 WHERE name = ?2",
            params![hash, name],
        )?;
        if updated == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    /// Replace a user's preferences. `None` clears them.
    pub fn change_prefs(&self, name: &str, prefs: Option<&Prefs>) -> Result<()> {
        let encoded = prefs.map(serde_json::to_string).transpose()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if !user_exists(&tx, name)? {
            return Err(AuthError::NotFound);
        }
        match encoded {
            Some(json) => {
                tx.execute(
                    "INSERT INTO user_prefs (owner, prefs) VALUES (?1, ?2)
                     ON CONFLICT(owner) DO UPDATE SET prefs = excluded.prefs",
                    params![name, json],
                )?;
            }
            None => {
                tx.execute("DELETE FROM user_prefs WHERE owner = ?1", params![name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace a user's plan. `None` clears it.
    pub fn change_plan(&self, name: &str, plan: Option<&Plan>) -> Result<()> {
        let encoded = plan.map(serde_json::to_string).transpose()?;

        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE user SET plan = ?1 WHERE name = ?2",
            params![encoded, name],
        )?;
        if updated == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    /// Look up a user with grants, stats, preferences and plan.
    pub fn user(&self, name: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        read_user(&conn, name)
    }

    /// All users: admins, then regular users, then the anonymous identity,
    /// by name within each role.
    pub fn users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let names = {
            let mut stmt = conn.prepare(
                "SELECT name FROM user
                 ORDER BY CASE role WHEN 'admin' THEN 0 WHEN 'user' THEN 1 ELSE 2 END, name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            names
        };

        let mut users = Vec::with_capacity(names.len() + 1);
        for name in &names {
            if let Some(user) = read_user(&conn, name)? {
                users.push(user);
            }
        }
        if !users.iter().any(|u| u.name == EVERYONE) {
            let mut everyone = User::everyone();
            everyone.grants = read_grants(&conn, EVERYONE)?;
            users.push(everyone);
        }
        Ok(users)
    }

    // ── Grants ──────────────────────────────────────────────────────

    /// Insert or overwrite the grant of `owner` on `topic_pattern`.
    pub fn upsert_grant(
        &self,
        owner: &str,
        topic_pattern: &str,
        allow_read: bool,
        allow_write: bool,
        provisioned_by: Option<&str>,
    ) -> Result<()> {
        let grant = Grant::new(topic_pattern, allow_read, allow_write);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if !user_exists(&tx, owner)? {
            return Err(AuthError::NotFound);
        }
        if let Some(provisioner) = provisioned_by {
            if !user_exists(&tx, provisioner)? {
                return Err(AuthError::NotFound);
            }
        }
        tx.execute(
            "INSERT INTO user_grant (owner, topic_pattern, allow_read, allow_write, is_wildcard, provisioned_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(owner, topic_pattern) DO UPDATE SET
                allow_read = excluded.allow_read,
                allow_write = excluded.allow_write,
                is_wildcard = excluded.is_wildcard,
                provisioned_by = excluded.provisioned_by",
            params![
                owner,
                grant.topic_pattern,
                grant.allow_read,
                grant.allow_write,
                grant.is_wildcard,
                provisioned_by,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete one grant, or every grant of `owner` when `topic_pattern` is `None`.
    /// Returns the number of rows removed.
    pub fn delete_grants(&self, owner: &str, topic_pattern: Option<&str>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = match topic_pattern {
            Some(pattern) => conn.execute(
                "DELETE FROM user_grant WHERE owner = ?1 AND topic_pattern = ?2",
                params![owner, pattern],
            )?,
            None => conn.execute("DELETE FROM user_grant WHERE owner = ?1", params![owner])?,
        };
        Ok(deleted)
    }

    /// Grants of `owner` (or none, for an anonymous caller) and of the anonymous
    /// identity, read under one lock.
    pub fn access_grants(&self, owner: Option<&str>) -> Result<AccessGrants> {
        let conn = self.conn.lock();
        let own = match owner {
            Some(name) if name != EVERYONE => read_grants(&conn, name)?,
            _ => Vec::new(),
        };
        let everyone = read_grants(&conn, EVERYONE)?;
        Ok(AccessGrants { own, everyone })
    }

    /// Grants that `owner` provisioned for itself, with the anonymous flags on
    /// the same pattern.
    pub fn reservations(&self, owner: &str) -> Result<Vec<Reservation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT g.topic_pattern, g.allow_read, g.allow_write,
                    COALESCE(e.allow_read, 0), COALESCE(e.allow_write, 0)
             FROM user_grant g
             LEFT JOIN user_grant e ON e.topic_pattern = g.topic_pattern AND e.owner = ?2
             WHERE g.owner = ?1 AND g.provisioned_by = ?1
             ORDER BY g.topic_pattern",
        )?;
        let reservations = stmt
            .query_map(params![owner, EVERYONE], |row| {
                Ok(Reservation {
                    topic_pattern: row.get(0)?,
                    allow_read: row.get(1)?,
                    allow_write: row.get(2)?,
                    allow_everyone_read: row.get(3)?,
                    allow_everyone_write: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(reservations)
    }

    // ── Tokens ──────────────────────────────────────────────────────

    /// Insert a token row. Returns `false` if the value is already taken.
    pub fn insert_token(&self, value: &str, owner: &str, expires: i64) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if !user_exists(&tx, owner)? {
            return Err(AuthError::NotFound);
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO user_token (token, owner, expires) VALUES (?1, ?2, ?3)",
            params![value, owner, expires],
        )?;
        tx.commit()?;
        Ok(inserted > 0)
    }

    /// Owner of a token that expires strictly after `now`.
    pub fn token_owner(&self, value: &str, now: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let owner = conn
            .query_row(
                "SELECT owner FROM user_token WHERE token = ?1 AND expires > ?2",
                params![value, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    /// Move a token's expiry. Returns `false` if no such row exists.
    pub fn update_token_expiry(&self, value: &str, owner: &str, expires: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE user_token SET expires = ?1 WHERE token = ?2 AND owner = ?3",
            params![expires, value, owner],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_token(&self, value: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM user_token WHERE token = ?1", params![value])?;
        Ok(deleted > 0)
    }

    /// Delete every token that expires at or before `now`.
    pub fn delete_expired_tokens(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM user_token WHERE expires <= ?1", params![now])?;
        Ok(deleted)
    }

    // ── Stats ───────────────────────────────────────────────────────

    /// Persist a batch of stats snapshots in one transaction. Users removed in
    /// the meantime are skipped. Returns the number of rows written.
    pub fn write_stats(&self, batch: &HashMap<String, Stats>) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO user_stats (owner, messages, emails)
                 SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM user WHERE name = ?1)
                 ON CONFLICT(owner) DO UPDATE SET
                    messages = excluded.messages,
                    emails = excluded.emails",
            )?;
            for (name, stats) in batch {
                written += stmt.execute(params![name, stats.messages, stats.emails])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }
}

// ── Row helpers ─────────────────────────────────────────────────────

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

fn user_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM user WHERE name = ?1", params![name], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn read_user(conn: &Connection, name: &str) -> Result<Option<User>> {
    let row = conn
        .query_row(
            "SELECT u.name, u.pass, u.role, u.plan,
                    COALESCE(s.messages, 0), COALESCE(s.emails, 0), p.prefs
             FROM user u
             LEFT JOIN user_stats s ON s.owner = u.name
             LEFT JOIN user_prefs p ON p.owner = u.name
             WHERE u.name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Role>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    Stats {
                        messages: row.get(4)?,
                        emails: row.get(5)?,
                    },
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((name, hash, role, plan, stats, prefs)) = row else {
        return Ok(None);
    };

    // Admins pass every check; persisted grants are ignored.
    let grants = if role == Role::Admin {
        Vec::new()
    } else {
        read_grants(conn, &name)?
    };

    Ok(Some(User {
        name,
        hash,
        token: None,
        role,
        grants,
        stats,
        prefs: prefs.as_deref().map(serde_json::from_str).transpose()?,
        plan: plan.as_deref().map(serde_json::from_str).transpose()?,
    }))
}

fn read_grants(conn: &Connection, owner: &str) -> Result<Vec<Grant>> {
    let mut stmt = conn.prepare(
        "SELECT topic_pattern, allow_read, allow_write, is_wildcard
         FROM user_grant WHERE owner = ?1
         ORDER BY allow_write DESC, allow_read DESC, topic_pattern",
    )?;
    let grants = stmt
        .query_map(params![owner], |row| {
            Ok(Grant {
                topic_pattern: row.get(0)?,
                allow_read: row.get(1)?,
                allow_write: row.get(2)?,
                is_wildcard: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(grants)
}

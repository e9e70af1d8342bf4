//! Schema versioning for the identity store.
//!
//! Version history:
//! - 0: legacy layout, `user(user, pass, role)` + flat `access(user, topic, read, write)`,
//!   no version marker
//! - 1: same tables plus `schemaVersion`
//! - 2: normalized layout (`user`, `user_grant`, `user_token`, `user_stats`, `user_prefs`)
//!
//! All steps from the stored version up to [`CURRENT_SCHEMA_VERSION`] run in one
//! immediate transaction. Either every step commits or the file is untouched.

use super::error::{AuthError, Result};
use super::types::EVERYONE;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

/// Layout version this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

type Step = fn(&Transaction<'_>) -> Result<()>;

/// `(from_version, step)`; each step lifts the store by exactly one version.
const MIGRATIONS: &[(i64, Step)] = &[(0, migrate_0_to_1), (1, migrate_1_to_2)];

const CREATE_CURRENT_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS user (
        name    TEXT NOT NULL PRIMARY KEY,
        pass    TEXT NOT NULL,
        role    TEXT NOT NULL CHECK (role IN ('admin', 'user', 'anonymous')),
        plan    TEXT
    );
    CREATE TABLE IF NOT EXISTS user_grant (
        owner          TEXT NOT NULL REFERENCES user(name) ON DELETE CASCADE,
        topic_pattern  TEXT NOT NULL,
        allow_read     INTEGER NOT NULL,
        allow_write    INTEGER NOT NULL,
        is_wildcard    INTEGER NOT NULL,
        provisioned_by TEXT REFERENCES user(name) ON DELETE CASCADE,
        PRIMARY KEY (owner, topic_pattern)
    );
    CREATE INDEX IF NOT EXISTS idx_user_grant_provisioned_by ON user_grant(provisioned_by);
    CREATE TABLE IF NOT EXISTS user_token (
        token   TEXT NOT NULL PRIMARY KEY,
        owner   TEXT NOT NULL REFERENCES user(name) ON DELETE CASCADE,
        expires INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_user_token_owner ON user_token(owner);
    CREATE INDEX IF NOT EXISTS idx_user_token_expires ON user_token(expires);
    CREATE TABLE IF NOT EXISTS user_stats (
        owner    TEXT NOT NULL PRIMARY KEY REFERENCES user(name) ON DELETE CASCADE,
        messages INTEGER NOT NULL DEFAULT 0,
        emails   INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS user_prefs (
        owner TEXT NOT NULL PRIMARY KEY REFERENCES user(name) ON DELETE CASCADE,
        prefs TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS schemaVersion (
        id      INTEGER PRIMARY KEY,
        version INTEGER NOT NULL
    );
";

/// Bring the store at `conn` up to [`CURRENT_SCHEMA_VERSION`].
///
/// Fails with [`AuthError::IncompatibleSchema`] if the store was written by a
/// newer build.
pub fn setup(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    match stored_version(&tx)? {
        None => {
            tracing::info!(version = CURRENT_SCHEMA_VERSION, "Creating identity store schema");
            tx.execute_batch(CREATE_CURRENT_SCHEMA)?;
            ensure_everyone(&tx)?;
            write_version(&tx, CURRENT_SCHEMA_VERSION)?;
        }
        Some(version) if version == CURRENT_SCHEMA_VERSION => {
            ensure_everyone(&tx)?;
        }
        Some(version) if version > CURRENT_SCHEMA_VERSION => {
            return Err(AuthError::IncompatibleSchema {
                found: version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        Some(version) => {
            for (from, step) in MIGRATIONS.iter().filter(|(from, _)| *from >= version) {
                tracing::info!(from = *from, to = *from + 1, "Migrating identity store");
                step(&tx)?;
            }
            write_version(&tx, CURRENT_SCHEMA_VERSION)?;
        }
    }

    tx.commit()?;
    Ok(())
}

/// Version marker of an open store, or `None` for a store with no tables at all.
fn stored_version(conn: &Connection) -> Result<Option<i64>> {
    if table_exists(conn, "schemaVersion")? {
        let version: Option<i64> = conn
            .query_row("SELECT version FROM schemaVersion WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        return Ok(Some(version.unwrap_or(0)));
    }
    if table_exists(conn, "user")? {
        return Ok(Some(0));
    }
    Ok(None)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn write_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO schemaVersion (id, version) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        params![version],
    )?;
    Ok(())
}

fn ensure_everyone(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user (name, pass, role) VALUES (?1, '', 'anonymous')",
        params![EVERYONE],
    )?;
    Ok(())
}

/// 0 -> 1: add the version table. A legacy store may lack `access` entirely.
fn migrate_0_to_1(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS access (
            user  TEXT NOT NULL,
            topic TEXT NOT NULL,
            read  INT NOT NULL,
            write INT NOT NULL,
            PRIMARY KEY (topic, user)
        );
        CREATE TABLE IF NOT EXISTS schemaVersion (
            id      INTEGER PRIMARY KEY,
            version INTEGER NOT NULL
        );",
    )?;
    write_version(tx, 1)
}

/// 1 -> 2: normalize users and turn every flat access row into an exact grant.
fn migrate_1_to_2(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch("ALTER TABLE user RENAME TO user_v1;")?;
    tx.execute_batch(CREATE_CURRENT_SCHEMA)?;

    let users = tx.execute(
        "INSERT INTO user (name, pass, role)
         SELECT user, pass, CASE role WHEN 'admin' THEN 'admin' ELSE 'user' END
         FROM user_v1 WHERE user != ?1",
        params![EVERYONE],
    )?;
    ensure_everyone(tx)?;

    let orphaned: i64 = tx.query_row(
        "SELECT COUNT(*) FROM access WHERE user NOT IN (SELECT name FROM user)",
        [],
        |row| row.get(0),
    )?;
    if orphaned > 0 {
        tracing::warn!(orphaned, "Dropping legacy access rows without a matching user");
    }

    let grants = tx.execute(
        "INSERT INTO user_grant (owner, topic_pattern, allow_read, allow_write, is_wildcard)
         SELECT user, topic, read != 0, write != 0, 0
         FROM access WHERE user IN (SELECT name FROM user)",
        [],
    )?;

    tx.execute_batch("DROP TABLE access; DROP TABLE user_v1;")?;
    tracing::info!(users, grants, "Converted legacy users and access rows");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(conn: &Connection) -> i64 {
        conn.query_row("SELECT version FROM schemaVersion", [], |row| row.get(0))
            .unwrap()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn seed_v1(conn: &Connection) {
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE user (user TEXT NOT NULL PRIMARY KEY, pass TEXT NOT NULL, role TEXT NOT NULL);
            CREATE TABLE access (
                user TEXT NOT NULL, topic TEXT NOT NULL, read INT NOT NULL, write INT NOT NULL,
                PRIMARY KEY (topic, user)
            );
            CREATE TABLE schemaVersion (id INT PRIMARY KEY, version INT NOT NULL);
            INSERT INTO schemaVersion (id, version) VALUES (1, 1);
            INSERT INTO user (user, pass, role) VALUES ('ben', 'x', 'user');
            INSERT INTO user (user, pass, role) VALUES ('phil', 'y', 'admin');
            INSERT INTO access (user, topic, read, write) VALUES ('ben', 'stats', 1, 1);
            INSERT INTO access (user, topic, read, write) VALUES ('ben', 'secret', 1, 0);
            INSERT INTO access (user, topic, read, write) VALUES ('*', 'stats', 1, 0);
            COMMIT;",
        )
        .unwrap();
    }

    #[test]
    fn fresh_store_is_stamped_with_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup(&mut conn).unwrap();
        assert_eq!(version(&conn), CURRENT_SCHEMA_VERSION);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM user WHERE name = '*'"), 1);
    }

    #[test]
    fn setup_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO user (name, pass, role) VALUES ('ben', 'h', 'user')",
            [],
        )
        .unwrap();
        setup(&mut conn).unwrap();
        assert_eq!(version(&conn), CURRENT_SCHEMA_VERSION);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM user"), 2);
    }

    #[test]
    fn v1_access_rows_become_exact_grants() {
        let mut conn = Connection::open_in_memory().unwrap();
        seed_v1(&conn);
        setup(&mut conn).unwrap();

        assert_eq!(version(&conn), CURRENT_SCHEMA_VERSION);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM user_grant"), 3);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM user_grant WHERE is_wildcard != 0"), 0);
        assert_eq!(
            count(
                &conn,
                "SELECT COUNT(*) FROM user_grant
                 WHERE owner = 'ben' AND topic_pattern = 'secret' AND allow_read = 1 AND allow_write = 0"
            ),
            1
        );
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM user WHERE name = 'phil' AND role = 'admin'"), 1);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM sqlite_master WHERE name IN ('access', 'user_v1')"),
            0
        );
    }

    #[test]
    fn v0_store_without_version_table_is_migrated() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE user (user TEXT NOT NULL PRIMARY KEY, pass TEXT NOT NULL, role TEXT NOT NULL);
             INSERT INTO user (user, pass, role) VALUES ('ben', 'x', 'user');",
        )
        .unwrap();
        setup(&mut conn).unwrap();
        assert_eq!(version(&conn), CURRENT_SCHEMA_VERSION);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM user"), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM user_grant"), 0);
    }

    #[test]
    fn orphaned_access_rows_are_dropped() {
        let mut conn = Connection::open_in_memory().unwrap();
        seed_v1(&conn);
        conn.execute(
            "INSERT INTO access (user, topic, read, write) VALUES ('ghost', 'stats', 1, 1)",
            [],
        )
        .unwrap();
        setup(&mut conn).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM user_grant"), 3);
    }

    #[test]
    fn newer_store_is_rejected_and_untouched() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup(&mut conn).unwrap();
        conn.execute("UPDATE schemaVersion SET version = 99", []).unwrap();

        let err = setup(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            AuthError::IncompatibleSchema { found: 99, supported: CURRENT_SCHEMA_VERSION }
        ));
        assert_eq!(version(&conn), 99);
    }

    #[test]
    fn failed_migration_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        seed_v1(&conn);
        // A stray table with the target name makes the 1 -> 2 rename fail halfway.
        conn.execute_batch("CREATE TABLE user_v1 (x INT);").unwrap();

        assert!(setup(&mut conn).is_err());
        assert_eq!(version(&conn), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM access"), 3);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM user"), 2);
    }
}

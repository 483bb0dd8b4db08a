//! Versioned schema migrations.
//!
//! Each migration is a static SQL batch keyed by a strictly increasing
//! version. Applied versions are recorded in `_migrations`, so running the
//! full set again is a no-op.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Schema version produced by the last entry in [`MIGRATIONS`].
pub const LATEST_VERSION: u32 = 2;

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "secrets, append-only version history, access grants, policy rules",
        sql: r#"
            CREATE TABLE secrets (
                id             TEXT PRIMARY KEY,
                name           TEXT NOT NULL,
                description    TEXT NOT NULL DEFAULT '',
                kind           TEXT NOT NULL CHECK(kind IN ('password','api_key','access_key','ssh_key','certificate','token','custom')),
                category       TEXT NOT NULL DEFAULT '',
                environment    TEXT NOT NULL DEFAULT '',
                tags           TEXT NOT NULL DEFAULT '[]',
                sealed_payload TEXT NOT NULL,
                expires_at     INTEGER NOT NULL DEFAULT 0,
                version        INTEGER NOT NULL CHECK(version >= 1),
                owner_id       TEXT NOT NULL,
                updated_by     TEXT NOT NULL,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL,
                deleted_at     INTEGER
            );
            CREATE INDEX idx_secrets_owner ON secrets(owner_id);
            CREATE INDEX idx_secrets_expiry ON secrets(expires_at) WHERE expires_at > 0;

            CREATE TABLE secret_versions (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                secret_id      TEXT NOT NULL REFERENCES secrets(id),
                version        INTEGER NOT NULL CHECK(version >= 1),
                name           TEXT NOT NULL,
                description    TEXT NOT NULL,
                kind           TEXT NOT NULL,
                category       TEXT NOT NULL,
                environment    TEXT NOT NULL,
                tags           TEXT NOT NULL,
                sealed_payload TEXT NOT NULL,
                expires_at     INTEGER NOT NULL,
                change_kind    TEXT NOT NULL CHECK(change_kind IN ('created','updated','deleted','restored')),
                change_reason  TEXT NOT NULL DEFAULT '',
                actor_id       TEXT NOT NULL,
                captured_at    INTEGER NOT NULL,
                UNIQUE(secret_id, version)
            );

            CREATE TRIGGER secret_versions_no_update
            BEFORE UPDATE ON secret_versions
            BEGIN
                SELECT RAISE(ABORT, 'secret_versions is append-only');
            END;

            CREATE TRIGGER secret_versions_no_delete
            BEFORE DELETE ON secret_versions
            BEGIN
                SELECT RAISE(ABORT, 'secret_versions is append-only');
            END;

            CREATE TABLE access_grants (
                id               TEXT PRIMARY KEY,
                secret_id        TEXT NOT NULL REFERENCES secrets(id),
                applicant_id     TEXT NOT NULL,
                reason           TEXT NOT NULL,
                status           TEXT NOT NULL CHECK(status IN ('pending','approved','rejected','expired','revoked')),
                approver_id      TEXT,
                decided_at       INTEGER,
                valid_from       INTEGER,
                valid_until      INTEGER,
                note             TEXT,
                access_count     INTEGER NOT NULL DEFAULT 0,
                last_accessed_at INTEGER,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            );
            CREATE INDEX idx_access_grants_status ON access_grants(status);
            CREATE INDEX idx_access_grants_applicant ON access_grants(applicant_id);
            CREATE UNIQUE INDEX idx_access_grants_open
                ON access_grants(secret_id, applicant_id)
                WHERE status IN ('pending','approved');

            CREATE TABLE policy_rules (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                ptype      TEXT NOT NULL CHECK(ptype IN ('p','g')),
                subject    TEXT NOT NULL,
                object     TEXT NOT NULL,
                action     TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                UNIQUE(ptype, subject, object, action)
            );
        "#,
    },
    Migration {
        version: 2,
        description: "audit log, notification inbox, expiry notice log",
        sql: r#"
            CREATE TABLE audit_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                actor_id    TEXT NOT NULL,
                action      TEXT NOT NULL,
                resource    TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                timestamp   INTEGER NOT NULL
            );
            CREATE INDEX idx_audit_log_actor ON audit_log(actor_id);
            CREATE INDEX idx_audit_log_timestamp ON audit_log(timestamp);

            CREATE TABLE notifications (
                id         TEXT PRIMARY KEY,
                recipient  TEXT NOT NULL,
                kind       TEXT NOT NULL,
                related_id TEXT NOT NULL,
                title      TEXT NOT NULL,
                body       TEXT NOT NULL,
                is_read    BOOLEAN NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                read_at    INTEGER
            );
            CREATE INDEX idx_notifications_recipient ON notifications(recipient, is_read);

            CREATE TABLE notice_log (
                kind       TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                sent_at    INTEGER NOT NULL,
                PRIMARY KEY (kind, subject_id)
            );
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Apply every migration newer than the recorded version.
///
/// Synchronous; call it from `spawn_blocking` (see
/// [`Database::run_migrations`](crate::Database::run_migrations)).
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    info!(new_version = LATEST_VERSION, "all migrations applied");
    Ok(())
}

/// Latest applied migration version, or 0 when none has run.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    ensure_migrations_table(conn)?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    let fail = |stage: &str, e: rusqlite::Error| StoreError::Migration {
        version: migration.version,
        message: format!("{stage}: {e}"),
    };

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail("begin", e))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| fail("execute", e))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    chrono::Utc::now().timestamp_millis()
                ],
            )
            .map(|_| ())
            .map_err(|e| fail("record", e))
        });

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT;").map_err(|e| fail("commit", e))?;
            Ok(())
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "crm_and_rules",
        sql: r#"
            CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                instance TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_connections_owner ON connections(owner_id);

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                name TEXT,
                email TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                origin_id TEXT,
                profile_picture TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (owner_id, phone)
            );

            CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                color TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (owner_id, name)
            );

            CREATE TABLE IF NOT EXISTS contact_tags (
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (contact_id, tag_id)
            );

            CREATE TABLE IF NOT EXISTS origins (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS deals (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                funnel_name TEXT NOT NULL,
                stage TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deals_contact ON deals(contact_id, updated_at);

            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                kind TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                trigger_type TEXT,
                trigger_config TEXT NOT NULL DEFAULT '{}',
                responses TEXT NOT NULL DEFAULT '[]',
                relay_enabled INTEGER NOT NULL DEFAULT 0,
                relay_url TEXT,
                relay_custom_fields TEXT NOT NULL DEFAULT '{}',
                tags_to_add TEXT NOT NULL DEFAULT '[]',
                origin_id TEXT,
                execution_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rules_owner_kind ON rules(owner_id, kind, active);

            CREATE TABLE IF NOT EXISTS webhooks (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                connection_id TEXT,
                field_mappings TEXT NOT NULL DEFAULT '[]',
                actions TEXT NOT NULL DEFAULT '[]',
                total_received INTEGER NOT NULL DEFAULT 0,
                last_payload TEXT,
                last_received_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_settings (
                contact_id TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                toggled_at TEXT NOT NULL,
                disabled_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sequence_enrollments (
                sequence_id TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                contact_id TEXT NOT NULL,
                enrolled_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (sequence_id, contact_id)
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                key TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        "#,
    },
    Migration {
        version: 2,
        name: "delivery_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduled_responses (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                instance TEXT,
                step INTEGER NOT NULL,
                order_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                delay_seconds INTEGER NOT NULL DEFAULT 0,
                due_at_ms INTEGER,
                status TEXT NOT NULL,
                last_error TEXT,
                finished_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (execution_id, step)
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_responses_due
                ON scheduled_responses(status, due_at_ms);

            CREATE TABLE IF NOT EXISTS relay_outbox (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                url TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_ms INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT,
                created_at TEXT NOT NULL,
                delivered_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_relay_outbox_due
                ON relay_outbox(status, next_attempt_ms);
        "#,
    },
    Migration {
        version: 3,
        name: "delivery_leases",
        sql: r#"
            ALTER TABLE scheduled_responses ADD COLUMN claimed_at_ms INTEGER;
            CREATE INDEX IF NOT EXISTS idx_scheduled_responses_execution
                ON scheduled_responses(execution_id, step);
        "#,
    },
];

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!("Database migrations complete (at V{})", get_current_version(conn).await?);
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

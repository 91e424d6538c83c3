//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

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
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                url TEXT NOT NULL,
                title TEXT,
                description TEXT,
                attachments TEXT NOT NULL DEFAULT '[]',
                budget_type TEXT,
                budget_min REAL,
                budget_max REAL,
                client_country TEXT,
                client_spent REAL,
                client_hires INTEGER,
                payment_verified INTEGER NOT NULL DEFAULT 0,
                fit_score INTEGER,
                fit_reasoning TEXT,
                proposal_doc_url TEXT,
                proposal_text TEXT,
                video_url TEXT,
                pdf_url TEXT,
                cover_letter TEXT,
                boost_decision INTEGER,
                boost_reasoning TEXT,
                pricing_proposed REAL,
                approval_ref TEXT,
                approved_at TEXT,
                submitted_at TEXT,
                error_log TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_source ON jobs(source);
            CREATE INDEX IF NOT EXISTS idx_jobs_updated ON jobs(updated_at);

            CREATE TABLE IF NOT EXISTS processed_ids (
                job_id TEXT NOT NULL,
                source TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                PRIMARY KEY (job_id, source)
            );
            CREATE INDEX IF NOT EXISTS idx_processed_source ON processed_ids(source);
        "#,
    },
    Migration {
        version: 2,
        name: "approval_ref_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_approval_ref ON jobs(approval_ref);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` tracking table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                StoreError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

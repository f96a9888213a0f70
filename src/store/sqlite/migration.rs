//! SQLite schema migrations.

use rusqlite::Connection;
use tracing::info;

/// Run all database migrations.
pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let applied: Vec<String> = {
        let mut stmt = conn.prepare("SELECT name FROM migrations")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let mut applied_count = 0;

    // Migration 1: jobs table plus the two indexes that keep claim_next cheap.
    if !applied.contains(&"001_create_jobs".to_string()) {
        conn.execute_batch(
            "CREATE TABLE jobs (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT 'default',
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'waiting',
                priority INTEGER NOT NULL DEFAULT 0,
                attempts_made INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                retry_policy TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                process_at INTEGER NOT NULL,
                locked_by TEXT,
                lock_expires_at INTEGER,
                progress INTEGER NOT NULL DEFAULT 0,
                return_value TEXT,
                failed_reason TEXT,
                stacktrace TEXT,
                remove_on_complete INTEGER NOT NULL DEFAULT 0,
                remove_on_fail INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_jobs_status_process_at ON jobs(status, process_at);
            CREATE INDEX idx_jobs_claim ON jobs(queue_name, priority DESC, created_at ASC);
            CREATE INDEX idx_jobs_lock_expires ON jobs(queue_name, status, lock_expires_at);

            INSERT INTO migrations (name, applied_at) VALUES ('001_create_jobs', strftime('%s', 'now'));
            ",
        )?;
        applied_count += 1;
    }

    if applied_count > 0 {
        info!(count = applied_count, "Applied SQLite migrations");
    }

    Ok(())
}

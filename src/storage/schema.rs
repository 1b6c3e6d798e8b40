//! Database schema and migrations.

use rusqlite::Connection;

use crate::error::StoreError;

pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS builds (
            id INTEGER PRIMARY KEY,
            version TEXT NOT NULL,
            start_time TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS suites (
            id INTEGER PRIMARY KEY,
            build_id INTEGER NOT NULL,
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            group_id INTEGER,
            group_name TEXT,
            host_name TEXT NOT NULL DEFAULT '',
            jdk_version TEXT NOT NULL DEFAULT '',
            jdk_vendor TEXT NOT NULL DEFAULT '',
            os_name TEXT NOT NULL DEFAULT '',
            os_arch TEXT NOT NULL DEFAULT '',
            os_version TEXT NOT NULL DEFAULT '',
            start_time TEXT,
            end_time TEXT,
            elapsed_ms INTEGER,
            test_count INTEGER NOT NULL DEFAULT 0,
            options TEXT,
            FOREIGN KEY (build_id) REFERENCES builds(id)
        );

        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY,
            suite_id INTEGER NOT NULL,
            class_name TEXT NOT NULL,
            method_name TEXT,
            group_name TEXT,
            start_time TEXT,
            end_time TEXT,
            status TEXT NOT NULL DEFAULT 'UNKNOWN',
            message TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (suite_id) REFERENCES suites(id)
        );

        CREATE INDEX IF NOT EXISTS idx_suites_build ON suites(build_id, category);
        CREATE INDEX IF NOT EXISTS idx_executions_suite ON executions(suite_id);
        CREATE INDEX IF NOT EXISTS idx_executions_identity
            ON executions(class_name, method_name, start_time);",
    )?;

    // Migration: per-test generation group, added after the first release
    let has_test_group: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('executions') WHERE name='group_name'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_test_group == 0 {
        conn.execute("ALTER TABLE executions ADD COLUMN group_name TEXT", [])?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

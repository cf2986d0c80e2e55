use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Open the site database with the session pragmas every command relies on.
pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    apply_session_pragmas(&connection)?;
    Ok(connection)
}

/// Session pragmas shared by file-backed and in-memory connections.
/// `case_sensitive_like` keeps the scanner's LIKE pushdown aligned with the
/// decoder's exact-match semantics.
pub fn apply_session_pragmas(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    connection
        .pragma_update(None, "case_sensitive_like", "ON")
        .context("failed to enable case_sensitive_like pragma")?;
    Ok(())
}

pub fn table_exists(connection: &Connection, table: &str) -> Result<bool> {
    let count: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check for table {table}"))?;
    Ok(count > 0)
}

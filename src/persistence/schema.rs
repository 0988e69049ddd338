//! `SQLite` schema bootstrap logic.
//!
//! Table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every server startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the session record table to the connected `SQLite` database.
///
/// The `UNIQUE` constraint on `port` backs up the in-process allocator
/// lock: a double assignment surfaces as a constraint violation instead
/// of two users sharing a server port.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session_record (
    user_id         TEXT PRIMARY KEY NOT NULL,
    port            INTEGER NOT NULL UNIQUE CHECK(port BETWEEN 1 AND 65535),
    pid             INTEGER,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}

//! Session record repository for `SQLite` persistence.
//!
//! This is the session registry: the only owner of durable per-user
//! state. Every method is a single statement, so each call is atomic on
//! its own but nothing spans calls.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::models::session::SessionRecord;
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    user_id: String,
    port: i64,
    pid: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_record(self) -> Result<SessionRecord> {
        let port = u16::try_from(self.port)
            .map_err(|_| AppError::Db(format!("invalid port: {}", self.port)))?;
        let pid = self
            .pid
            .map(|raw| u32::try_from(raw).map_err(|_| AppError::Db(format!("invalid pid: {raw}"))))
            .transpose()?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);
        let updated_at = chrono::DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| AppError::Db(format!("invalid updated_at: {e}")))?
            .with_timezone(&Utc);

        Ok(SessionRecord {
            user_id: self.user_id,
            port,
            pid,
            created_at,
            updated_at,
        })
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Retrieve the record for a user.
    ///
    /// Returns `Ok(None)` if the user has never logged in.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find(&self, user_id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM session_record WHERE user_id = ?1")
                .bind(user_id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(SessionRow::into_record).transpose()
    }

    /// Insert or update a record keyed by `user_id`.
    ///
    /// An existing record keeps its original `port` and `created_at`;
    /// only `pid` and `updated_at` are overwritten.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PortConflict` if another user already holds the
    /// port, or `AppError::Db` if the statement fails.
    pub async fn save(&self, record: &SessionRecord) -> Result<SessionRecord> {
        let pid = record.pid.map(i64::from);

        let result = sqlx::query(
            "INSERT INTO session_record (user_id, port, pid, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                 pid = excluded.pid,
                 updated_at = excluded.updated_at",
        )
        .bind(&record.user_id)
        .bind(i64::from(record.port))
        .bind(pid)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(AppError::PortConflict(format!(
                    "port {} already assigned",
                    record.port
                )));
            }
            Err(err) => return Err(err.into()),
        }

        self.find(&record.user_id)
            .await?
            .ok_or_else(|| AppError::Db("failed to read back session record".into()))
    }

    /// Remove the record for a user.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists, or `AppError::Db`
    /// if the statement fails.
    pub async fn delete(&self, user_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM session_record WHERE user_id = ?1")
            .bind(user_id)
            .execute(self.db.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "no session record for {user_id}"
            )));
        }
        Ok(())
    }

    /// Every port currently held by a record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a stored port is out of range.
    pub async fn assigned_ports(&self) -> Result<BTreeSet<u16>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT port FROM session_record")
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter()
            .map(|(port,)| {
                u16::try_from(port).map_err(|_| AppError::Db(format!("invalid port: {port}")))
            })
            .collect()
    }

    /// List all records ordered by port.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as("SELECT * FROM session_record ORDER BY port")
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(SessionRow::into_record).collect()
    }
}

//! Session record model and user identifier rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Durable per-user session state.
///
/// `port` is fixed for the lifetime of the record; only `pid` changes
/// when a dead server is replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Owning user identifier; immutable after creation.
    pub user_id: String,
    /// Port assigned from the pool at creation.
    pub port: u16,
    /// Process currently serving the session, if one was ever spawned.
    pub pid: Option<u32>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time `pid` was replaced.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Construct a record for a first login, with no process yet.
    #[must_use]
    pub fn new(user_id: String, port: u16) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            port,
            pid: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a freshly spawned server process.
    pub fn attach_process(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.updated_at = Utc::now();
    }
}

/// Address a user is sent to once their session is live.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Endpoint {
    /// Configured base address without a port.
    pub base_url: String,
    /// The user's assigned port.
    pub port: u16,
}

impl Endpoint {
    /// Redirect target, `<base_url>:<port>`.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}:{}", self.base_url, self.port)
    }
}

/// Check that `user_id` is a non-empty ASCII alphanumeric string.
///
/// The identifier becomes a directory name under the data dir, so
/// anything else is refused before it reaches the supervisor.
///
/// # Errors
///
/// Returns `AppError::InvalidUser` when the identifier is empty or contains
/// any non-alphanumeric character.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if !user_id.is_empty() && user_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(AppError::InvalidUser(format!(
            "user id must be alphanumeric: {user_id:?}"
        )))
    }
}

//! Session get-or-create and administrative deletion.
//!
//! Two locks close the races between concurrent requests:
//!
//! - the allocation lock wraps "pick a free port, persist the record" so
//!   two new users never leave with the same port;
//! - a per-user lock wraps the whole get-or-create sequence so two
//!   requests for one user never both provision or both spawn.
//!
//! Provisioning and spawning only ever hold the per-user lock, so a slow
//! start for one user does not stall anyone else.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::GlobalConfig;
use crate::models::session::{validate_user_id, Endpoint, SessionRecord};
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

use super::liveness::LivenessProbe;
use super::port_allocator::PortAllocator;
use super::readiness;
use super::spawner::SessionSpawner;
use super::workspace::{Provisioner, WorkspaceLayout};

/// How long a killed server's process group gets to disappear.
const KILL_GRACE: Duration = Duration::from_secs(1);

const TERMINATE_POLL: Duration = Duration::from_millis(100);

/// Per-user serialization locks, keyed by user id.
type UserLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// A session record together with the current liveness of its process.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Stored record.
    #[serde(flatten)]
    pub record: SessionRecord,
    /// Whether the recorded process currently exists.
    pub alive: bool,
}

/// Registry state observed at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records whose process is still running.
    pub alive: usize,
    /// Records with no process or a process that has exited.
    pub stale: usize,
}

/// Supervisor for per-user notebook sessions.
pub struct SessionManager {
    config: Arc<GlobalConfig>,
    repo: SessionRepo,
    provisioner: Provisioner,
    liveness: Arc<dyn LivenessProbe>,
    spawner: Arc<dyn SessionSpawner>,
    allocator: Mutex<PortAllocator>,
    user_locks: UserLocks,
}

impl SessionManager {
    /// Build a manager and seed the port allocator from the registry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the configuration template cannot be
    /// loaded, or `AppError::Db` if the assigned ports cannot be read.
    pub async fn new(
        config: Arc<GlobalConfig>,
        repo: SessionRepo,
        liveness: Arc<dyn LivenessProbe>,
        spawner: Arc<dyn SessionSpawner>,
    ) -> Result<Self> {
        let provisioner = Provisioner::from_config(&config)?;
        let mut allocator = PortAllocator::new(config.port_pool.range());
        allocator.refresh(repo.assigned_ports().await?);

        Ok(Self {
            config,
            repo,
            provisioner,
            liveness,
            spawner,
            allocator: Mutex::new(allocator),
            user_locks: UserLocks::default(),
        })
    }

    /// Return a live, reachable endpoint for `user_id`, creating whatever is missing.
    ///
    /// On first login a port is assigned and a record created. The
    /// workspace is provisioned if any part of it is missing. A server is
    /// spawned if none was recorded or the recorded one has exited; the
    /// user keeps the same port across respawns.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidUser` if `user_id` is not alphanumeric.
    /// - `AppError::AllocationExhausted` if a new user finds no free port.
    /// - `AppError::Provisioning` if the workspace cannot be created.
    /// - `AppError::Spawn` if the server cannot be launched or never becomes reachable.
    /// - `AppError::Db` on registry failures.
    #[instrument(name = "ensure_session", skip(self))]
    pub async fn ensure_session(&self, user_id: &str) -> Result<Endpoint> {
        validate_user_id(user_id)?;

        let lock = self.user_lock(user_id);
        let result = {
            let _held = lock.lock().await;
            self.ensure_locked(user_id).await
        };
        drop(lock);
        self.forget_user_lock(user_id);
        result
    }

    async fn ensure_locked(&self, user_id: &str) -> Result<Endpoint> {
        let mut record = match self.repo.find(user_id).await? {
            Some(record) => record,
            None => self.create_record(user_id).await?,
        };

        let layout = self.ensure_workspace(user_id, record.port).await?;

        if self.liveness.is_alive(record.pid) {
            debug!(pid = record.pid, port = record.port, "reusing live session server");
        } else {
            if let Some(stale) = record.pid {
                info!(stale_pid = stale, port = record.port, "recorded session server is gone");
            }
            record = self.spawn_and_record(record, &layout).await?;
            readiness::wait_until_ready(&self.config.readiness, record.port).await?;
        }

        Ok(Endpoint {
            base_url: self.config.base_url.clone(),
            port: record.port,
        })
    }

    /// Run [`Self::ensure_session`] on its own task.
    ///
    /// If the caller stops waiting (e.g., the HTTP client disconnects), the
    /// spawn and persistence still run to completion.
    ///
    /// # Errors
    ///
    /// Returns whatever `ensure_session` returns, or `AppError::Spawn` if
    /// the task itself panicked.
    pub async fn ensure_session_detached(self: Arc<Self>, user_id: String) -> Result<Endpoint> {
        tokio::spawn(async move { self.ensure_session(&user_id).await })
            .await
            .map_err(|err| AppError::Spawn(format!("session task failed: {err}")))?
    }

    /// Administrative delete: stop the server, drop the record, free the
    /// port, and remove the workspace tree. Irreversible.
    ///
    /// A server that ignores SIGTERM for the configured grace period is
    /// killed along with its process group. If it still exists after that,
    /// the record and port are kept and the delete fails.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidUser` if `user_id` is not alphanumeric.
    /// - `AppError::NotFound` if the user has no record.
    /// - `AppError::Spawn` if the running server cannot be signalled or stopped.
    /// - `AppError::Provisioning` if the workspace is missing or cannot be removed.
    #[instrument(name = "delete_session", skip(self))]
    pub async fn delete_session(&self, user_id: &str) -> Result<()> {
        validate_user_id(user_id)?;

        let lock = self.user_lock(user_id);
        let result = {
            let _held = lock.lock().await;
            self.delete_locked(user_id).await
        };
        drop(lock);
        self.forget_user_lock(user_id);
        result
    }

    /// All records with their current liveness, ordered by port.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be read.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let records = self.repo.list().await?;
        Ok(records
            .into_iter()
            .map(|record| SessionSummary {
                alive: self.liveness.is_alive(record.pid),
                record,
            })
            .collect())
    }

    /// Re-seed the allocator from the registry and report which recorded
    /// sessions survived a supervisor restart. Stale sessions are left for
    /// the next login to respawn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be read.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let records = self.repo.list().await?;
        let mut allocator = self.allocator.lock().await;
        allocator.refresh(records.iter().map(|r| r.port).collect());
        drop(allocator);

        let mut report = ReconcileReport::default();
        for record in &records {
            if self.liveness.is_alive(record.pid) {
                report.alive += 1;
            } else {
                report.stale += 1;
            }
        }

        info!(
            alive = report.alive,
            stale = report.stale,
            "session registry reconciled"
        );
        Ok(report)
    }

    /// Number of users with a request in flight.
    #[must_use]
    pub fn active_user_locks(&self) -> usize {
        self.user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Layout of `user_id`'s workspace.
    #[must_use]
    pub fn workspace(&self, user_id: &str) -> WorkspaceLayout {
        self.provisioner.layout(user_id)
    }

    async fn create_record(&self, user_id: &str) -> Result<SessionRecord> {
        let mut allocator = self.allocator.lock().await;
        loop {
            let port = allocator.allocate()?;
            match self
                .repo
                .save(&SessionRecord::new(user_id.to_owned(), port))
                .await
            {
                Ok(record) => {
                    info!(port, "port assigned");
                    return Ok(record);
                }
                // Another writer holds the port; it stays marked and the next one is tried.
                Err(AppError::PortConflict(msg)) => {
                    warn!(port, %msg, "port taken in registry, trying next");
                }
                Err(err) => {
                    allocator.release(port);
                    return Err(err);
                }
            }
        }
    }

    async fn ensure_workspace(&self, user_id: &str, port: u16) -> Result<WorkspaceLayout> {
        let provisioner = self.provisioner.clone();
        let user = user_id.to_owned();

        tokio::task::spawn_blocking(move || {
            let layout = provisioner.layout(&user);
            if layout.is_ready() {
                return Ok(layout);
            }
            if layout.exists() {
                warn!(root = %layout.root.display(), "workspace incomplete, recreating missing paths");
                return provisioner.repair(&user, port);
            }
            provisioner.provision(&user, port)
        })
        .await
        .map_err(|err| AppError::Provisioning(format!("provisioning task failed: {err}")))?
    }

    async fn spawn_and_record(
        &self,
        mut record: SessionRecord,
        layout: &WorkspaceLayout,
    ) -> Result<SessionRecord> {
        let pid = self.spawner.spawn(layout, record.port)?;
        record.attach_process(pid);

        match self.repo.save(&record).await {
            Ok(saved) => Ok(saved),
            Err(err) => {
                // An untracked server would hold the port forever.
                if let Err(term_err) = self.spawner.terminate(pid) {
                    warn!(pid, %term_err, "failed to stop unrecorded session server");
                }
                Err(err)
            }
        }
    }

    async fn delete_locked(&self, user_id: &str) -> Result<()> {
        let record = self
            .repo
            .find(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no session for {user_id}")))?;

        if let Some(pid) = record.pid.filter(|&pid| self.liveness.is_alive(Some(pid))) {
            self.stop_server(pid).await?;
        }

        self.repo.delete(user_id).await?;
        self.allocator.lock().await.release(record.port);
        info!(port = record.port, "session record deleted");

        let provisioner = self.provisioner.clone();
        let user = user_id.to_owned();
        tokio::task::spawn_blocking(move || provisioner.deprovision(&user))
            .await
            .map_err(|err| AppError::Provisioning(format!("deprovision task failed: {err}")))?
    }

    /// SIGTERM, then SIGKILL once the grace period runs out.
    async fn stop_server(&self, pid: u32) -> Result<()> {
        self.spawner.terminate(pid)?;
        if self
            .wait_for_exit(pid, self.config.server.terminate_grace())
            .await
        {
            return Ok(());
        }

        warn!(pid, "session server ignored SIGTERM, killing");
        self.spawner.kill(pid)?;
        if self.wait_for_exit(pid, KILL_GRACE).await {
            return Ok(());
        }

        Err(AppError::Spawn(format!(
            "session server {pid} still running after SIGKILL"
        )))
    }

    async fn wait_for_exit(&self, pid: u32, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.liveness.is_alive(Some(pid)) {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(TERMINATE_POLL).await;
        }
        debug!(pid, "session server exited");
        true
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(user_id.to_owned()).or_default())
    }

    /// Drop the lock entry once nobody else holds or waits on it.
    fn forget_user_lock(&self, user_id: &str) {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(user_id);
        }
        drop(locks);
        debug!(in_flight = self.active_user_locks(), "user lock released");
    }
}

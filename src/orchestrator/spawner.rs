//! Notebook server process spawner.
//!
//! Spawns one long-running notebook server per user session, rooted in
//! the user's workspace and bound to the user's port. The server must
//! outlive the request that started it, so children are not killed on
//! drop; a detached task waits on each child instead so an exited server
//! is reaped and never lingers as a zombie that still reads as alive.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, info_span, warn};

use crate::config::ServerConfig;
use crate::{AppError, Result};

use super::workspace::WorkspaceLayout;

/// Launches and stops session server processes.
pub trait SessionSpawner: Send + Sync {
    /// Start a server for the workspace bound to `port` and return its pid.
    ///
    /// Returns as soon as the process has been created; it does not wait
    /// for the server to accept connections.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the executable cannot be launched.
    fn spawn(&self, layout: &WorkspaceLayout, port: u16) -> Result<u32>;

    /// Ask the process to shut down. A pid with no process is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the signal cannot be delivered.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Forcibly stop the process and everything in its process group.
    /// A pid with no process is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the signal cannot be delivered.
    fn kill(&self, pid: u32) -> Result<()>;
}

/// [`SessionSpawner`] that launches the configured notebook server program.
#[derive(Debug, Clone)]
pub struct NotebookSpawner {
    config: ServerConfig,
}

impl NotebookSpawner {
    /// Create a spawner for the given server settings.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Full argument list passed to the server program.
    #[must_use]
    pub fn command_args(&self, layout: &WorkspaceLayout, port: u16) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.config.args.iter().map(OsString::from).collect();
        args.push(format!("--profile={}", self.config.profile).into());

        let mut notebook_dir = OsString::from("--notebook-dir=");
        notebook_dir.push(&layout.notebook_dir);
        args.push(notebook_dir);

        args.push(format!("--NotebookApp.port={port}").into());

        let mut ipython_dir = OsString::from("--NotebookApp.ipython_dir=");
        ipython_dir.push(&layout.ipython_dir);
        args.push(ipython_dir);

        args
    }

    fn log_stdio(layout: &WorkspaceLayout) -> Result<(Stdio, Stdio)> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&layout.log_file)
            .map_err(|err| {
                AppError::Spawn(format!(
                    "failed to open server log {}: {err}",
                    layout.log_file.display()
                ))
            })?;
        let log_err = log
            .try_clone()
            .map_err(|err| AppError::Spawn(format!("failed to clone log handle: {err}")))?;
        Ok((Stdio::from(log), Stdio::from(log_err)))
    }
}

impl SessionSpawner for NotebookSpawner {
    fn spawn(&self, layout: &WorkspaceLayout, port: u16) -> Result<u32> {
        let span = info_span!("spawn_server", port, program = %self.config.program);
        let _guard = span.enter();

        let (stdout, stderr) = Self::log_stdio(layout)?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.command_args(layout, port))
            .current_dir(&layout.root)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);

        // Own process group: a Ctrl-C aimed at the supervisor must not take
        // user sessions down with it.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!(
                "failed to launch {}: {err}",
                self.config.program
            ))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Spawn("server exited before its pid was read".into()))?;

        info!(pid, port, "session server spawned");
        reap(child, pid);
        Ok(pid)
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| AppError::Spawn(format!("pid out of range: {pid}")))?;

        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => {
                info!(pid, "sent SIGTERM to session server");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(AppError::Spawn(format!("failed to signal pid {pid}: {err}"))),
        }
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| AppError::Spawn(format!("pid out of range: {pid}")))?;

        // Servers lead their own process group, so kernels go down with them.
        match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => {
                warn!(pid, "sent SIGKILL to session server process group");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(AppError::Spawn(format!("failed to kill pid {pid}: {err}"))),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> Result<()> {
        Err(AppError::Spawn(format!(
            "terminating pid {pid} is not supported on this platform"
        )))
    }

    #[cfg(not(unix))]
    fn kill(&self, pid: u32) -> Result<()> {
        Err(AppError::Spawn(format!(
            "killing pid {pid} is not supported on this platform"
        )))
    }
}

/// Wait on the child in the background and log how it ended.
fn reap(mut child: Child, pid: u32) {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                info!(pid, "session server exited normally");
            }
            Ok(status) => {
                warn!(pid, %status, "session server exited");
            }
            Err(err) => {
                warn!(pid, %err, "failed to wait on session server");
            }
        }
    });
}

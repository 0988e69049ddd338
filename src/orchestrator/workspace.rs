//! Per-user workspace provisioning.
//!
//! A workspace is laid out as:
//!
//! ```text
//! <data_dir>/<user_id>/
//!     .ipython/profile_<profile>/ipython_notebook_config.py
//!     notebooks/
//! ```
//!
//! All functions here do blocking file-system I/O; async callers should
//! run them on the blocking pool.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// Name of the rendered configuration file inside the profile directory.
pub const CONFIG_FILE_NAME: &str = "ipython_notebook_config.py";

/// Name of the server log file at the workspace root.
pub const LOG_FILE_NAME: &str = "nbserver.log";

/// Built-in configuration template used when none is configured.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r"# Notebook server configuration for {{user_id}}.
c = get_config()

c.NotebookApp.ip = '*'
c.NotebookApp.port = {{port}}
c.NotebookApp.open_browser = False
c.NotebookApp.notebook_dir = u'{{nb_dir}}'
c.NotebookApp.ipython_dir = u'{{ip_dir}}'
";

/// Resolved paths of one user's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    /// Workspace root, `<data_dir>/<user_id>`.
    pub root: PathBuf,
    /// IPython directory passed to the server.
    pub ipython_dir: PathBuf,
    /// Dedicated profile directory holding the rendered config.
    pub profile_dir: PathBuf,
    /// Rendered configuration file.
    pub config_file: PathBuf,
    /// Notebook (content) directory.
    pub notebook_dir: PathBuf,
    /// Server stdout/stderr log.
    pub log_file: PathBuf,
}

impl WorkspaceLayout {
    /// Compute the layout for `user_id` under `data_dir`.
    #[must_use]
    pub fn new(data_dir: &Path, user_id: &str, profile: &str) -> Self {
        let root = data_dir.join(user_id);
        let ipython_dir = root.join(".ipython");
        let profile_dir = ipython_dir.join(format!("profile_{profile}"));
        let config_file = profile_dir.join(CONFIG_FILE_NAME);
        let notebook_dir = root.join("notebooks");
        let log_file = root.join(LOG_FILE_NAME);
        Self {
            root,
            ipython_dir,
            profile_dir,
            config_file,
            notebook_dir,
            log_file,
        }
    }

    /// Whether every expected path is present.
    ///
    /// A tree left behind by a failed provision is not ready even when
    /// the root exists.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.root.is_dir()
            && self.ipython_dir.is_dir()
            && self.profile_dir.is_dir()
            && self.config_file.is_file()
            && self.notebook_dir.is_dir()
    }

    /// Whether anything exists at the workspace root.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }
}

/// Substitute the workspace parameters into a configuration template.
///
/// Recognized placeholders: `{{user_id}}`, `{{ip_dir}}`, `{{nb_dir}}`, `{{port}}`.
#[must_use]
pub fn render_config(template: &str, user_id: &str, layout: &WorkspaceLayout, port: u16) -> String {
    template
        .replace("{{user_id}}", user_id)
        .replace("{{ip_dir}}", &layout.ipython_dir.to_string_lossy())
        .replace("{{nb_dir}}", &layout.notebook_dir.to_string_lossy())
        .replace("{{port}}", &port.to_string())
}

/// Creates, repairs and removes user workspaces under the configured data dir.
#[derive(Debug, Clone)]
pub struct Provisioner {
    data_dir: PathBuf,
    profile: String,
    template: String,
    init_data_dir: Option<PathBuf>,
    profile_program: Option<String>,
}

impl Provisioner {
    /// Build a provisioner with an explicit template.
    #[must_use]
    pub fn new(
        data_dir: PathBuf,
        profile: String,
        template: String,
        init_data_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            data_dir,
            profile,
            template,
            init_data_dir,
            profile_program: None,
        }
    }

    /// Run `<program> profile create <profile> --ipython-dir=<dir>` whenever
    /// the profile directory has to be created.
    #[must_use]
    pub fn with_profile_program(mut self, program: impl Into<String>) -> Self {
        self.profile_program = Some(program.into());
        self
    }

    /// Build a provisioner from the global config, loading the template file if one is set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the configured template cannot be read.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        let template = match config.server.config_template {
            Some(ref path) => fs::read_to_string(path).map_err(|err| {
                AppError::Config(format!(
                    "failed to read config template {}: {err}",
                    path.display()
                ))
            })?,
            None => DEFAULT_CONFIG_TEMPLATE.to_owned(),
        };

        let provisioner = Self::new(
            config.data_dir.clone(),
            config.server.profile.clone(),
            template,
            config.init_data_dir.clone(),
        );
        Ok(if config.server.create_profile {
            provisioner.with_profile_program(config.server.program.clone())
        } else {
            provisioner
        })
    }

    /// Layout for `user_id`.
    #[must_use]
    pub fn layout(&self, user_id: &str) -> WorkspaceLayout {
        WorkspaceLayout::new(&self.data_dir, user_id, &self.profile)
    }

    /// Create the workspace tree for `user_id`.
    ///
    /// Not idempotent: callers check [`WorkspaceLayout::exists`] first and
    /// use [`Self::repair`] for a tree that is already there.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Provisioning` if the root already exists or any
    /// directory creation, config write, or initial-data copy fails.
    pub fn provision(&self, user_id: &str, port: u16) -> Result<WorkspaceLayout> {
        let layout = self.layout(user_id);

        fs::create_dir_all(&self.data_dir).map_err(|err| {
            provisioning_error("create data dir", &self.data_dir, &err)
        })?;

        fs::create_dir(&layout.root).map_err(|err| {
            if err.kind() == ErrorKind::AlreadyExists {
                AppError::Provisioning(format!(
                    "workspace already exists: {}",
                    layout.root.display()
                ))
            } else {
                provisioning_error("create workspace root", &layout.root, &err)
            }
        })?;

        self.fill_missing(user_id, &layout, port)?;
        info!(user_id, root = %layout.root.display(), "workspace provisioned");
        Ok(layout)
    }

    /// Recreate whatever is missing from an existing workspace.
    ///
    /// Paths that are present are left alone, so notebooks and other user
    /// content survive a repair.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Provisioning` if the workspace root does not
    /// exist or a missing piece cannot be recreated.
    pub fn repair(&self, user_id: &str, port: u16) -> Result<WorkspaceLayout> {
        let layout = self.layout(user_id);
        if !layout.root.is_dir() {
            return Err(AppError::Provisioning(format!(
                "workspace missing: {}",
                layout.root.display()
            )));
        }

        self.fill_missing(user_id, &layout, port)?;
        info!(user_id, root = %layout.root.display(), "workspace repaired");
        Ok(layout)
    }

    /// Recursively delete the workspace for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Provisioning` if the workspace does not exist or
    /// cannot be removed.
    pub fn deprovision(&self, user_id: &str) -> Result<()> {
        let layout = self.layout(user_id);
        fs::remove_dir_all(&layout.root)
            .map_err(|err| provisioning_error("remove workspace", &layout.root, &err))?;
        info!(user_id, root = %layout.root.display(), "workspace removed");
        Ok(())
    }

    fn fill_missing(&self, user_id: &str, layout: &WorkspaceLayout, port: u16) -> Result<()> {
        if !layout.profile_dir.is_dir() {
            if let Some(ref program) = self.profile_program {
                create_profile(program, &self.profile, layout)?;
            }
            fs::create_dir_all(&layout.profile_dir).map_err(|err| {
                provisioning_error("create profile dir", &layout.profile_dir, &err)
            })?;
        }

        if !layout.config_file.is_file() {
            let rendered = render_config(&self.template, user_id, layout, port);
            fs::write(&layout.config_file, rendered)
                .map_err(|err| provisioning_error("write config", &layout.config_file, &err))?;
        }

        if !layout.notebook_dir.is_dir() {
            match self.init_data_dir {
                Some(ref source) => copy_tree(source, &layout.notebook_dir)?,
                None => fs::create_dir(&layout.notebook_dir).map_err(|err| {
                    provisioning_error("create notebook dir", &layout.notebook_dir, &err)
                })?,
            }
        }
        Ok(())
    }
}

/// Let the server program lay down its default profile files.
fn create_profile(program: &str, profile: &str, layout: &WorkspaceLayout) -> Result<()> {
    let mut ipython_dir = OsString::from("--ipython-dir=");
    ipython_dir.push(&layout.ipython_dir);

    let output = Command::new(program)
        .args(["profile", "create", profile])
        .arg(ipython_dir)
        .current_dir(&layout.root)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| {
            AppError::Provisioning(format!("failed to run {program} profile create: {err}"))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Provisioning(format!(
            "{program} profile create exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    debug!(program, profile, "profile created");
    Ok(())
}

/// Copy `source` into a new directory `dest`, following symlinks.
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|err| {
            AppError::Provisioning(format!("walk {}: {err}", source.display()))
        })?;
        let relative = entry.path().strip_prefix(source).map_err(|err| {
            AppError::Provisioning(format!("copy {}: {err}", entry.path().display()))
        })?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| provisioning_error("create dir", &target, &err))?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|err| provisioning_error("copy file", &target, &err))?;
        }
    }
    debug!(source = %source.display(), dest = %dest.display(), "initial data copied");
    Ok(())
}

fn provisioning_error(action: &str, path: &Path, err: &std::io::Error) -> AppError {
    AppError::Provisioning(format!("{action} {}: {err}", path.display()))
}

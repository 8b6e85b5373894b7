//! The agent running next to the Subversion server.
//!
//! It provisions the repositories named in the mounted manifest and reloads
//! the web server whenever the authentication or authorization file changes.
//! The mounted configuration is the only input; the updater never talks to
//! the API server.
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;

use crate::config::UpdaterConfig;
use crate::error::SvnOperatorError;
use crate::fsext::{self, Uid};
use crate::svnconfig::{ReposManifest, AUTHZ_SVN_ACCESS_FILE, AUTH_USER_FILE, REPOS_MANIFEST};
use crate::updater::command::run_command;

pub mod command;
pub mod watch;

lazy_static! {
    static ref REPOSITORY_NAME: Regex =
        Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap();
}

pub fn is_valid_repository_name(name: &str) -> bool {
    REPOSITORY_NAME.is_match(name)
}

#[derive(Clone)]
pub struct Updater {
    initd_script: PathBuf,
    svnadmin: PathBuf,
    config_dir: PathBuf,
    repos_dir: PathBuf,
    timeout: Option<Duration>,
    repository_owner: Option<Uid>,
}

impl Updater {
    pub fn new(config: &UpdaterConfig) -> Result<Self, SvnOperatorError> {
        let repository_owner = match &config.repository_owner {
            Some(name) => Some(Uid::require(name)?),
            None => None,
        };
        Ok(Updater {
            initd_script: config.initd_script.clone(),
            svnadmin: config.svnadmin.clone(),
            config_dir: config.config_dir.clone(),
            repos_dir: config.repos_dir.clone(),
            timeout: config.exec_timeout(),
            repository_owner,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self, key: &str) -> PathBuf {
        self.config_dir.join(key)
    }

    pub async fn on_auth_user_file_changed(&self) -> Result<(), SvnOperatorError> {
        info!("[{}] changed, reloading server", AUTH_USER_FILE);
        self.reload_server().await
    }

    pub async fn on_authz_svn_access_file_changed(&self) -> Result<(), SvnOperatorError> {
        info!("[{}] changed, reloading server", AUTHZ_SVN_ACCESS_FILE);
        self.reload_server().await
    }

    pub async fn on_repos_config_changed(&self) -> Result<(), SvnOperatorError> {
        info!("[{}] changed, provisioning repositories", REPOS_MANIFEST);
        let created = self.create_repositories().await?;
        if !created.is_empty() {
            info!("Created repositories {:?}", created);
        }
        Ok(())
    }

    async fn reload_server(&self) -> Result<(), SvnOperatorError> {
        run_command(&self.initd_script, &["reload"], self.timeout).await
    }

    /// Creates every repository of the manifest which does not exist yet and
    /// returns the names of those that were created.
    ///
    /// A failing repository does not stop the others from being provisioned;
    /// all failures are reported together afterwards.
    pub async fn create_repositories(&self) -> Result<Vec<String>, SvnOperatorError> {
        let content = tokio::fs::read_to_string(self.config_file(REPOS_MANIFEST)).await?;
        let manifest = ReposManifest::parse(&content)?;
        tokio::fs::create_dir_all(&self.repos_dir).await?;

        let mut created = vec![];
        let mut failed = vec![];
        for entry in manifest.repositories {
            match self.create_repository(&entry.name).await {
                Ok(true) => created.push(entry.name),
                Ok(false) => {}
                Err(error) => {
                    error!("Unable to provision repository [{}]: {}", entry.name, error);
                    failed.push(entry.name);
                }
            }
        }

        if failed.is_empty() {
            Ok(created)
        } else {
            Err(SvnOperatorError::RepositoryProvisioningFailed { failed })
        }
    }

    /// Creates the repository `name` unless its directory already exists.
    /// Returns whether it was created.
    pub async fn create_repository(&self, name: &str) -> Result<bool, SvnOperatorError> {
        if !is_valid_repository_name(name) {
            return Err(SvnOperatorError::InvalidRepositoryName {
                name: name.to_string(),
            });
        }

        let path = self.repos_dir.join(name);
        if fsext::exists(&path) {
            debug!("Repository [{}] already exists at [{}]", name, path.display());
            return Ok(false);
        }

        info!("Creating repository [{}] at [{}]", name, path.display());
        run_command(
            &self.svnadmin,
            &[OsStr::new("create"), path.as_os_str()],
            self.timeout,
        )
        .await?;

        // A repository left behind here would be skipped from now on and
        // never reach its owner
        if let Some(owner) = &self.repository_owner {
            if let Err(error) = fsext::change_owner_recursively(&path, owner) {
                warn!(
                    "Repository [{}] could not be handed over to its owner, removing it: {}",
                    name, error
                );
                if let Err(remove_error) = tokio::fs::remove_dir_all(&path).await {
                    error!(
                        "Unable to remove repository [{}] at [{}]: {}",
                        name,
                        path.display(),
                        remove_error
                    );
                }
                return Err(error);
            }
        }
        Ok(true)
    }
}

//! Command line and environment configuration of the binaries.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_SERVER_IMAGE: &str = "svn-server:latest";

/// Runs Subversion servers and keeps their access control in sync with
/// SVNRepository, SVNGroup and SVNUser objects.
#[derive(Parser, Clone, Debug)]
#[command(name = "svn-operator", version)]
pub struct OperatorConfig {
    /// Image of the server container for servers which do not name one.
    #[arg(long, env = "SVN_SERVER_IMAGE", default_value = DEFAULT_SERVER_IMAGE)]
    pub default_server_image: String,

    /// Restricts the operator to a single namespace. All namespaces are
    /// watched if this is not set.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,
}

/// Provisions repositories and reloads the server whenever the mounted
/// configuration changes.
#[derive(Parser, Clone, Debug)]
#[command(name = "svn-server-updater", version)]
pub struct UpdaterConfig {
    /// Init script of the web server, called with `reload`.
    #[arg(long, env = "SVN_INITD_SCRIPT", default_value = "/etc/init.d/apache2", value_parser = expand_path)]
    pub initd_script: PathBuf,

    /// The `svnadmin` executable.
    #[arg(long, env = "SVN_SVNADMIN", default_value = "/usr/bin/svnadmin", value_parser = expand_path)]
    pub svnadmin: PathBuf,

    /// Directory the generated configuration is mounted to.
    #[arg(long, env = "SVN_CONFIG_DIR", default_value = "/etc/svn-config/", value_parser = expand_path)]
    pub config_dir: PathBuf,

    /// Directory repositories are created in.
    #[arg(long, env = "SVN_REPOS_DIR", default_value = "/svn/repos", value_parser = expand_path)]
    pub repos_dir: PathBuf,

    /// Timeout for external commands in milliseconds, 0 disables it.
    #[arg(long, env = "SVN_EXEC_TIMEOUT", default_value_t = 10000)]
    pub exec_timeout: u64,

    /// User which newly created repositories are handed over to.
    #[arg(long, env = "SVN_REPOSITORY_OWNER")]
    pub repository_owner: Option<String>,
}

impl UpdaterConfig {
    pub fn exec_timeout(&self) -> Option<Duration> {
        match self.exec_timeout {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }
}

/// Expands `~` and environment variables in a path argument.
fn expand_path(value: &str) -> Result<PathBuf, String> {
    shellexpand::full(value)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|error| error.to_string())
}

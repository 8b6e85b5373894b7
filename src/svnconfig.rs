//! Generates the configuration files consumed by the Subversion server.
//!
//! The [`ConfigGenerator`] turns a [`Snapshot`] into the `AuthUserFile` for
//! `mod_authn_file`, the `AuthzSVNAccessFile` for `mod_authz_svn` and a
//! repository manifest which tells the server updater which repositories have
//! to exist on disk.
//!
//! # Safety of the generated files
//!
//! The generator does not validate or escape anything. All names and
//! credentials are written verbatim, so they have to be validated before they
//! reach the snapshot (Kubernetes object names and the CRD schema do this for
//! objects coming from the API server). Never feed untrusted input into the
//! generator directly.
use std::collections::BTreeMap;

use handlebars::Handlebars;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::crd::Access;
use crate::error::SvnOperatorError;

/// Key of the authentication file in the configuration artifact.
pub const AUTH_USER_FILE: &str = "AuthUserFile";
/// Key of the authorization file in the configuration artifact.
pub const AUTHZ_SVN_ACCESS_FILE: &str = "AuthzSVNAccessFile";
/// Key of the repository manifest in the configuration artifact.
pub const REPOS_MANIFEST: &str = "Repos";

/// Directory the configuration artifact is mounted to inside the server pod.
pub const CONFIG_MOUNT_PATH: &str = "/etc/svn-config/";
/// Directory the repository storage is mounted to inside the server pod.
pub const REPOS_MOUNT_PATH: &str = "/svn";

const AUTHZ_TEMPLATE_NAME: &str = "AuthzSVNAccessFile";
const AUTHN_TEMPLATE_NAME: &str = "AuthUserFile";

// Lines are terminated inside the loops so that no block tag ever stands
// alone on a line; handlebars would otherwise swallow the line break.
const AUTHZ_TEMPLATE: &str = concat!(
    "[groups]\n",
    "{{#each groups}}{{name}} = {{#each users}}{{#unless @first}}, {{/unless}}{{this}}{{/each}}\n{{/each}}",
    "{{#each repositories}}[{{name}}:/]\n* = \n",
    "{{#each permissions}}{{group}} = {{permission}}\n{{/each}}{{/each}}",
);

const AUTHN_TEMPLATE: &str = "{{#each users}}{{name}}:{{encrypted_password}}\n{{/each}}";

/// Denormalized view of everything that references one server.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub repositories: Vec<Repository>,
    pub groups: Vec<Group>,
    pub users: Vec<User>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Repository {
    pub name: String,
    pub permissions: Vec<RepositoryPermission>,
}

/// Access of one group to the repository it is listed under.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RepositoryPermission {
    pub group: String,
    pub permission: Access,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Group {
    pub name: String,
    pub users: Vec<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct User {
    pub name: String,
    pub encrypted_password: String,
}

/// Structured list of repositories which have to be provisioned.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ReposManifest {
    pub repositories: Vec<RepoEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RepoEntry {
    pub name: String,
}

impl ReposManifest {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        ReposManifest {
            repositories: snapshot
                .repositories
                .iter()
                .map(|repository| RepoEntry {
                    name: repository.name.clone(),
                })
                .collect(),
        }
    }

    pub fn parse(content: &str) -> Result<Self, SvnOperatorError> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Renders the server configuration files.
///
/// Templates are compiled once in [`ConfigGenerator::new`]; the generator is
/// meant to be built at startup and shared.
pub struct ConfigGenerator {
    handlebars: Handlebars<'static>,
}

impl ConfigGenerator {
    pub fn new() -> Result<Self, SvnOperatorError> {
        let mut handlebars = Handlebars::new();
        // Fail instead of rendering empty strings if the snapshot misses a field
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_template_string(AUTHZ_TEMPLATE_NAME, AUTHZ_TEMPLATE)?;
        handlebars.register_template_string(AUTHN_TEMPLATE_NAME, AUTHN_TEMPLATE)?;
        Ok(ConfigGenerator { handlebars })
    }

    /// Authorization file for `mod_authz_svn`.
    pub fn authz_svn_access_file(&self, snapshot: &Snapshot) -> Result<String, SvnOperatorError> {
        Ok(self.handlebars.render(AUTHZ_TEMPLATE_NAME, snapshot)?)
    }

    /// Password file for `mod_authn_file`.
    pub fn auth_user_file(&self, snapshot: &Snapshot) -> Result<String, SvnOperatorError> {
        Ok(self.handlebars.render(AUTHN_TEMPLATE_NAME, snapshot)?)
    }

    pub fn repos_manifest(&self, snapshot: &Snapshot) -> Result<String, SvnOperatorError> {
        Ok(serde_yaml::to_string(&ReposManifest::from_snapshot(
            snapshot,
        ))?)
    }

    /// Renders all files, keyed by their name in the configuration artifact.
    pub fn generate(
        &self,
        snapshot: &Snapshot,
    ) -> Result<BTreeMap<String, String>, SvnOperatorError> {
        debug!(
            "Generating configuration for {} repositories, {} groups and {} users",
            snapshot.repositories.len(),
            snapshot.groups.len(),
            snapshot.users.len()
        );
        let mut files = BTreeMap::new();
        files.insert(
            String::from(AUTH_USER_FILE),
            self.auth_user_file(snapshot)?,
        );
        files.insert(
            String::from(AUTHZ_SVN_ACCESS_FILE),
            self.authz_svn_access_file(snapshot)?,
        );
        files.insert(String::from(REPOS_MANIFEST), self.repos_manifest(snapshot)?);
        trace!("Generated configuration files: {:?}", files);
        Ok(files)
    }
}

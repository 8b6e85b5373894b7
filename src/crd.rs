//! Custom resources describing a Subversion server and its access control.
//!
//! An [`SvnServer`] owns the runtime objects. [`SvnRepository`], [`SvnGroup`] and
//! [`SvnUser`] objects reference a server by name within their own namespace.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, LocalObjectReference, PersistentVolumeClaimSpec, Toleration,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub const API_GROUP: &str = "svn.k8s.oyasumi.club";

/// Objects which are bound to exactly one [`SvnServer`].
pub trait ReferencesServer {
    /// Name of the referenced server, in the namespace of the object itself.
    fn server_name(&self) -> &str;
}

#[derive(CustomResource, Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "SVNServer",
    root = "SvnServer",
    group = "svn.k8s.oyasumi.club",
    version = "v1alpha1",
    namespaced,
    status = "SvnServerStatus",
    shortname = "svn"
)]
#[serde(rename_all = "camelCase")]
pub struct SvnServerSpec {
    #[serde(default)]
    pub pod_template: PodTemplate,
    #[serde(default)]
    pub volume_claim_template: PersistentVolumeClaimSpec,
}

/// Overrides for the pod running the server process.
///
/// Empty fields leave the corresponding field of the running template alone.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
pub struct SvnServerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl SvnServerStatus {
    pub fn latest_condition(&self) -> Option<&Condition> {
        self.conditions.last()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    pub transition_time: String,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, JsonSchema,
)]
pub enum ConditionType {
    #[serde(rename = "")]
    #[strum(serialize = "")]
    None,
    Synced,
    Failed,
}

impl Default for ConditionType {
    fn default() -> Self {
        ConditionType::None
    }
}

#[derive(CustomResource, Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "SVNRepository",
    root = "SvnRepository",
    group = "svn.k8s.oyasumi.club",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SvnRepositorySpec {
    pub svn_server: String,
}

impl ReferencesServer for SvnRepository {
    fn server_name(&self) -> &str {
        &self.spec.svn_server
    }
}

#[derive(CustomResource, Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "SVNGroup",
    root = "SvnGroup",
    group = "svn.k8s.oyasumi.club",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SvnGroupSpec {
    pub svn_server: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl ReferencesServer for SvnGroup {
    fn server_name(&self) -> &str {
        &self.spec.svn_server
    }
}

/// Access of a group to one repository.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
pub struct Permission {
    pub repository: String,
    #[serde(default)]
    pub permission: Access,
}

/// Access levels understood by `mod_authz_svn`.
///
/// The serialized form is exactly what ends up in the authorization file.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, JsonSchema,
)]
pub enum Access {
    #[serde(rename = "")]
    #[strum(serialize = "")]
    None,
    #[serde(rename = "r")]
    #[strum(serialize = "r")]
    Read,
    #[serde(rename = "rw")]
    #[strum(serialize = "rw")]
    ReadWrite,
}

impl Default for Access {
    fn default() -> Self {
        Access::None
    }
}

#[derive(CustomResource, Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "SVNUser",
    root = "SvnUser",
    group = "svn.k8s.oyasumi.club",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SvnUserSpec {
    pub svn_server: String,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Already hashed password as it should appear in the `AuthUserFile`.
    #[serde(default)]
    #[schemars(regex(pattern = r"^[^\s:]*$"))]
    pub encrypted_password: String,
}

impl ReferencesServer for SvnUser {
    fn server_name(&self) -> &str {
        &self.spec.svn_server
    }
}

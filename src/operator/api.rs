//! Access to the control plane as needed by a convergence pass.
//!
//! [`KubeClusterApi`] talks to the API server, tests substitute an in-memory
//! implementation.
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

use crate::crd::{SvnGroup, SvnRepository, SvnServer, SvnServerStatus, SvnUser};
use crate::error::SvnOperatorError;
use crate::operator::index::{ServerKey, ServerRefIndex};
use crate::operator::snapshot::build_snapshot;
use crate::svnconfig::Snapshot;

/// Number of objects referencing a server, per kind.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReferenceCounts {
    pub repositories: usize,
    pub groups: usize,
    pub users: usize,
}

impl ReferenceCounts {
    pub fn is_empty(&self) -> bool {
        self.repositories == 0 && self.groups == 0 && self.users == 0
    }
}

/// Operations of a convergence pass. `get_*` return `Ok(None)` for objects
/// which do not exist; `replace_*` must fail with a conflict if the object
/// changed since it was read.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_server(&self, key: &ServerKey) -> Result<Option<SvnServer>, SvnOperatorError>;

    async fn get_service(&self, key: &ServerKey) -> Result<Option<Service>, SvnOperatorError>;
    async fn create_service(&self, service: &Service) -> Result<(), SvnOperatorError>;

    async fn get_stateful_set(
        &self,
        key: &ServerKey,
    ) -> Result<Option<StatefulSet>, SvnOperatorError>;
    async fn create_stateful_set(&self, stateful_set: &StatefulSet)
        -> Result<(), SvnOperatorError>;
    async fn replace_stateful_set(
        &self,
        stateful_set: &StatefulSet,
    ) -> Result<(), SvnOperatorError>;

    async fn get_config_map(&self, key: &ServerKey)
        -> Result<Option<ConfigMap>, SvnOperatorError>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), SvnOperatorError>;
    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<(), SvnOperatorError>;

    /// The relational snapshot of everything currently referencing the server.
    async fn snapshot(&self, key: &ServerKey) -> Result<Snapshot, SvnOperatorError>;

    fn reference_counts(&self, key: &ServerKey) -> ReferenceCounts;

    async fn update_server_status(
        &self,
        key: &ServerKey,
        status: &SvnServerStatus,
    ) -> Result<(), SvnOperatorError>;
}

/// Indexes of all kinds referencing a server.
#[derive(Clone)]
pub struct ServerIndexes {
    pub repositories: ServerRefIndex<SvnRepository>,
    pub groups: ServerRefIndex<SvnGroup>,
    pub users: ServerRefIndex<SvnUser>,
}

impl ServerIndexes {
    pub fn new() -> Self {
        ServerIndexes {
            repositories: ServerRefIndex::new("SVNRepository"),
            groups: ServerRefIndex::new("SVNGroup"),
            users: ServerRefIndex::new("SVNUser"),
        }
    }

    pub fn snapshot(&self, key: &ServerKey) -> Result<Snapshot, SvnOperatorError> {
        let repositories = owned(self.repositories.referencing(key)?);
        let groups = owned(self.groups.referencing(key)?);
        let users = owned(self.users.referencing(key)?);
        Ok(build_snapshot(&repositories, &groups, &users))
    }

    pub fn reference_counts(&self, key: &ServerKey) -> ReferenceCounts {
        ReferenceCounts {
            repositories: self.repositories.count(key),
            groups: self.groups.count(key),
            users: self.users.count(key),
        }
    }
}

impl Default for ServerIndexes {
    fn default() -> Self {
        ServerIndexes::new()
    }
}

fn owned<K: Clone>(objects: Vec<std::sync::Arc<K>>) -> Vec<K> {
    objects.iter().map(|object| object.as_ref().clone()).collect()
}

pub struct KubeClusterApi {
    client: Client,
    indexes: ServerIndexes,
}

impl KubeClusterApi {
    pub fn new(client: Client, indexes: ServerIndexes) -> Self {
        KubeClusterApi { client, indexes }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: ResourceExt>(object: &K) -> Result<String, SvnOperatorError> {
    object
        .namespace()
        .ok_or(SvnOperatorError::MissingObjectKey {
            key: "metadata.namespace",
        })
}

#[async_trait::async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_server(&self, key: &ServerKey) -> Result<Option<SvnServer>, SvnOperatorError> {
        Ok(self
            .api::<SvnServer>(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn get_service(&self, key: &ServerKey) -> Result<Option<Service>, SvnOperatorError> {
        Ok(self.api::<Service>(&key.namespace).get_opt(&key.name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<(), SvnOperatorError> {
        self.api::<Service>(&namespace_of(service)?)
            .create(&PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn get_stateful_set(
        &self,
        key: &ServerKey,
    ) -> Result<Option<StatefulSet>, SvnOperatorError> {
        Ok(self
            .api::<StatefulSet>(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn create_stateful_set(
        &self,
        stateful_set: &StatefulSet,
    ) -> Result<(), SvnOperatorError> {
        self.api::<StatefulSet>(&namespace_of(stateful_set)?)
            .create(&PostParams::default(), stateful_set)
            .await?;
        Ok(())
    }

    async fn replace_stateful_set(
        &self,
        stateful_set: &StatefulSet,
    ) -> Result<(), SvnOperatorError> {
        // The resourceVersion of the object that was read is sent along, so
        // this fails with a conflict if someone else modified it meanwhile
        self.api::<StatefulSet>(&namespace_of(stateful_set)?)
            .replace(
                &stateful_set.name_any(),
                &PostParams::default(),
                stateful_set,
            )
            .await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        key: &ServerKey,
    ) -> Result<Option<ConfigMap>, SvnOperatorError> {
        Ok(self
            .api::<ConfigMap>(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), SvnOperatorError> {
        self.api::<ConfigMap>(&namespace_of(config_map)?)
            .create(&PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<(), SvnOperatorError> {
        self.api::<ConfigMap>(&namespace_of(config_map)?)
            .replace(&config_map.name_any(), &PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn snapshot(&self, key: &ServerKey) -> Result<Snapshot, SvnOperatorError> {
        self.indexes.snapshot(key)
    }

    fn reference_counts(&self, key: &ServerKey) -> ReferenceCounts {
        self.indexes.reference_counts(key)
    }

    async fn update_server_status(
        &self,
        key: &ServerKey,
        status: &SvnServerStatus,
    ) -> Result<(), SvnOperatorError> {
        let patch = json!({ "status": status });
        self.api::<SvnServer>(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

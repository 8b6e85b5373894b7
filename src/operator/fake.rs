//! In-memory [`ClusterApi`] used by the tests of the convergence pass.
//!
//! Objects get a resourceVersion which is bumped on every write, and
//! replacements carrying an outdated version fail with a conflict just like
//! on a real API server.
use std::collections::HashMap;
use std::sync::Mutex;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::error::ErrorResponse;
use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};

use crate::crd::{SvnGroup, SvnRepository, SvnServer, SvnServerStatus, SvnUser};
use crate::error::SvnOperatorError;
use crate::operator::api::{ClusterApi, ReferenceCounts, ServerIndexes};
use crate::operator::index::ServerKey;
use crate::svnconfig::Snapshot;

#[derive(Default)]
struct Objects {
    servers: HashMap<ServerKey, SvnServer>,
    services: HashMap<ServerKey, Service>,
    stateful_sets: HashMap<ServerKey, StatefulSet>,
    config_maps: HashMap<ServerKey, ConfigMap>,
    next_version: u64,
    child_mutations: usize,
    status_updates: usize,
    fail_next_create: bool,
    bump_config_map_on_read: bool,
}

impl Objects {
    fn stamp<K: Resource>(&mut self, object: &mut K) {
        self.next_version += 1;
        object.meta_mut().resource_version = Some(self.next_version.to_string());
    }
}

pub struct FakeCluster {
    objects: Mutex<Objects>,
    indexes: ServerIndexes,
}

fn api_error(code: u16, reason: &str) -> SvnOperatorError {
    SvnOperatorError::KubeError {
        source: kube::Error::Api(ErrorResponse {
            status: String::from("Failure"),
            message: format!("fake cluster says {}", reason),
            reason: reason.to_string(),
            code,
        }),
    }
}

fn key_of<K: Resource>(object: &K) -> ServerKey {
    ServerKey::new(&object.namespace().unwrap_or_default(), &object.name_any())
}

fn create<K: Resource + Clone>(
    objects: &mut Objects,
    select: impl Fn(&mut Objects) -> &mut HashMap<ServerKey, K>,
    object: &K,
) -> Result<(), SvnOperatorError> {
    if objects.fail_next_create {
        objects.fail_next_create = false;
        return Err(api_error(409, "AlreadyExists"));
    }
    let key = key_of(object);
    if select(objects).contains_key(&key) {
        return Err(api_error(409, "AlreadyExists"));
    }
    let mut object = object.clone();
    objects.stamp(&mut object);
    objects.child_mutations += 1;
    select(objects).insert(key, object);
    Ok(())
}

fn replace<K: Resource + Clone>(
    objects: &mut Objects,
    select: impl Fn(&mut Objects) -> &mut HashMap<ServerKey, K>,
    object: &K,
) -> Result<(), SvnOperatorError> {
    let key = key_of(object);
    let stored_version = match select(objects).get(&key) {
        Some(stored) => stored.meta().resource_version.clone(),
        None => return Err(api_error(404, "NotFound")),
    };
    if stored_version != object.meta().resource_version {
        return Err(api_error(409, "Conflict"));
    }
    let mut object = object.clone();
    objects.stamp(&mut object);
    objects.child_mutations += 1;
    select(objects).insert(key, object);
    Ok(())
}

impl FakeCluster {
    pub fn new() -> Self {
        let indexes = ServerIndexes::new();
        indexes.repositories.apply(Event::Restarted(vec![]));
        indexes.groups.apply(Event::Restarted(vec![]));
        indexes.users.apply(Event::Restarted(vec![]));
        FakeCluster {
            objects: Mutex::new(Objects::default()),
            indexes,
        }
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, Objects> {
        self.objects.lock().unwrap()
    }

    /// Creates or overwrites a server, as `kubectl apply` would.
    pub fn put_server(&self, mut server: SvnServer) {
        let mut objects = self.objects();
        objects.stamp(&mut server);
        objects.servers.insert(key_of(&server), server);
    }

    pub fn put_repository(&self, repository: SvnRepository) {
        self.indexes.repositories.apply(Event::Applied(repository));
    }

    pub fn put_group(&self, group: SvnGroup) {
        self.indexes.groups.apply(Event::Applied(group));
    }

    pub fn put_user(&self, user: SvnUser) {
        self.indexes.users.apply(Event::Applied(user));
    }

    pub fn server(&self, key: &ServerKey) -> Option<SvnServer> {
        self.objects().servers.get(key).cloned()
    }

    pub fn stateful_set(&self, key: &ServerKey) -> Option<StatefulSet> {
        self.objects().stateful_sets.get(key).cloned()
    }

    pub fn config_map(&self, key: &ServerKey) -> Option<ConfigMap> {
        self.objects().config_maps.get(key).cloned()
    }

    /// Modifies a StatefulSet behind the back of the operator.
    pub fn edit_stateful_set(&self, key: &ServerKey, edit: impl FnOnce(&mut StatefulSet)) {
        let mut objects = self.objects();
        let mut stateful_set = objects.stateful_sets[key].clone();
        edit(&mut stateful_set);
        objects.stamp(&mut stateful_set);
        objects.stateful_sets.insert(key.clone(), stateful_set);
    }

    pub fn fail_next_create_with_already_exists(&self) {
        self.objects().fail_next_create = true;
    }

    /// Simulates a concurrent writer modifying the ConfigMap right after the
    /// next read of it.
    pub fn bump_config_map_version_on_next_read(&self) {
        self.objects().bump_config_map_on_read = true;
    }

    /// Creates and replacements of children.
    pub fn child_mutations(&self) -> usize {
        self.objects().child_mutations
    }

    /// All writes, including status updates.
    pub fn mutations(&self) -> usize {
        let objects = self.objects();
        objects.child_mutations + objects.status_updates
    }
}

#[async_trait::async_trait]
impl ClusterApi for FakeCluster {
    async fn get_server(&self, key: &ServerKey) -> Result<Option<SvnServer>, SvnOperatorError> {
        Ok(self.server(key))
    }

    async fn get_service(&self, key: &ServerKey) -> Result<Option<Service>, SvnOperatorError> {
        Ok(self.objects().services.get(key).cloned())
    }

    async fn create_service(&self, service: &Service) -> Result<(), SvnOperatorError> {
        create(&mut self.objects(), |objects| &mut objects.services, service)
    }

    async fn get_stateful_set(
        &self,
        key: &ServerKey,
    ) -> Result<Option<StatefulSet>, SvnOperatorError> {
        Ok(self.stateful_set(key))
    }

    async fn create_stateful_set(
        &self,
        stateful_set: &StatefulSet,
    ) -> Result<(), SvnOperatorError> {
        create(
            &mut self.objects(),
            |objects| &mut objects.stateful_sets,
            stateful_set,
        )
    }

    async fn replace_stateful_set(
        &self,
        stateful_set: &StatefulSet,
    ) -> Result<(), SvnOperatorError> {
        replace(
            &mut self.objects(),
            |objects| &mut objects.stateful_sets,
            stateful_set,
        )
    }

    async fn get_config_map(
        &self,
        key: &ServerKey,
    ) -> Result<Option<ConfigMap>, SvnOperatorError> {
        let mut objects = self.objects();
        let config_map = objects.config_maps.get(key).cloned();
        if config_map.is_some() && objects.bump_config_map_on_read {
            objects.bump_config_map_on_read = false;
            let mut stored = objects.config_maps[key].clone();
            objects.stamp(&mut stored);
            objects.config_maps.insert(key.clone(), stored);
        }
        Ok(config_map)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), SvnOperatorError> {
        create(
            &mut self.objects(),
            |objects| &mut objects.config_maps,
            config_map,
        )
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<(), SvnOperatorError> {
        replace(
            &mut self.objects(),
            |objects| &mut objects.config_maps,
            config_map,
        )
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
        let mut objects = self.objects();
        let mut server = match objects.servers.get(key) {
            Some(server) => server.clone(),
            None => return Err(api_error(404, "NotFound")),
        };
        server.status = Some(status.clone());
        objects.stamp(&mut server);
        objects.status_updates += 1;
        objects.servers.insert(key.clone(), server);
        Ok(())
    }
}

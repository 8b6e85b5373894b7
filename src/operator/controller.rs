//! Runs the convergence pass for every server whenever the server, one of its
//! children or one of the objects referencing it changes.
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::controller::{Action, Error as ControllerError};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{predicates, watcher, Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;

use crate::config::OperatorConfig;
use crate::crd::{ReferencesServer, SvnServer};
use crate::error::SvnOperatorError;
use crate::operator::api::{ClusterApi, KubeClusterApi, ServerIndexes};
use crate::operator::index::{ServerKey, ServerRefIndex};
use crate::operator::synthesizer::{report_missing_server, Synthesizer};
use crate::svnconfig::ConfigGenerator;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Converged servers are checked again after this interval even without events.
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

pub struct Context<A> {
    synthesizer: Synthesizer<A>,
    failures: Mutex<HashMap<ServerKey, u32>>,
}

impl<A: ClusterApi> Context<A> {
    pub fn new(synthesizer: Synthesizer<A>) -> Self {
        Context {
            synthesizer,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn reset_backoff(&self, key: &ServerKey) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Records a failure and returns how long to wait before the next pass.
    fn next_backoff(&self, key: &ServerKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = backoff_for(*count);
        *count = count.saturating_add(1);
        delay
    }
}

fn backoff_for(previous_failures: u32) -> Duration {
    INITIAL_BACKOFF
        .checked_mul(2u32.saturating_pow(previous_failures))
        .map(|delay| delay.min(MAX_BACKOFF))
        .unwrap_or(MAX_BACKOFF)
}

fn key_of(server: &SvnServer) -> ServerKey {
    ServerKey::new(&server.namespace().unwrap_or_default(), &server.name_any())
}

pub async fn reconcile<A: ClusterApi>(
    server: Arc<SvnServer>,
    ctx: Arc<Context<A>>,
) -> Result<Action, SvnOperatorError> {
    let key = key_of(&server);
    debug!("Reconciling SVNServer [{}]", key);
    let outcome = ctx.synthesizer.converge(&key).await?;
    ctx.reset_backoff(&key);
    if outcome.needs_another_pass() {
        debug!("SVNServer [{}]: {}, scheduling next pass", key, outcome);
        Ok(Action::requeue(Duration::ZERO))
    } else {
        Ok(Action::requeue(RESYNC_INTERVAL))
    }
}

pub fn error_policy<A: ClusterApi>(
    server: Arc<SvnServer>,
    error: &SvnOperatorError,
    ctx: Arc<Context<A>>,
) -> Action {
    let key = key_of(&server);
    let delay = ctx.next_backoff(&key);
    warn!(
        "Reconciling SVNServer [{}] failed, retrying in {:?}: {}",
        key, delay, error
    );
    Action::requeue(delay)
}

/// Watches one referencing kind, keeps `index` up to date and yields the
/// servers whose configuration may have changed.
fn reference_triggers<K>(
    api: Api<K>,
    index: ServerRefIndex<K>,
    indexes: ServerIndexes,
    servers: Store<SvnServer>,
) -> impl Stream<Item = ObjectRef<SvnServer>> + Send + 'static
where
    K: Resource + ReferencesServer + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .flat_map(move |event| {
            let affected = match event {
                Ok(event) => index.apply(event),
                Err(error) => {
                    warn!("Watch of {} objects failed: {}", index.kind(), error);
                    vec![]
                }
            };
            stream::iter(existing_servers(affected, &indexes, &servers))
        })
}

/// Keeps the servers known to the controller. The controller never runs a
/// pass for a server missing from its store, so references to such servers
/// are reported here instead. Creating the server triggers its first pass.
fn existing_servers(
    affected: Vec<ServerKey>,
    indexes: &ServerIndexes,
    servers: &Store<SvnServer>,
) -> Vec<ObjectRef<SvnServer>> {
    affected
        .into_iter()
        .filter_map(|key| {
            let reference = ObjectRef::new(&key.name).within(&key.namespace);
            if servers.get(&reference).is_some() {
                Some(reference)
            } else {
                report_missing_server(&key, indexes.reference_counts(&key));
                None
            }
        })
        .collect()
}

fn api_for<K>(client: &Client, namespace: &Option<String>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Runs the operator until a termination signal is received.
pub async fn run(client: Client, config: OperatorConfig) -> Result<(), SvnOperatorError> {
    let indexes = ServerIndexes::new();
    let synthesizer = Synthesizer::new(
        KubeClusterApi::new(client.clone(), indexes.clone()),
        ConfigGenerator::new()?,
        config.default_server_image.clone(),
    );
    let ctx = Arc::new(Context::new(synthesizer));

    match &config.namespace {
        Some(namespace) => info!("Watching namespace [{}]", namespace),
        None => info!("Watching all namespaces"),
    }

    let namespace = &config.namespace;
    let (servers, writer) = reflector::store();
    // Status writes of a pass leave the generation alone and must not
    // trigger the next pass, which would bypass the backoff
    let server_changes = watcher(
        api_for::<SvnServer>(&client, namespace),
        watcher::Config::default(),
    )
    .default_backoff()
    .reflect(writer)
    .applied_objects()
    .predicate_filter(predicates::generation);

    Controller::for_stream(server_changes, servers.clone())
        .owns(api_for::<Service>(&client, namespace), watcher::Config::default())
        .owns(api_for::<StatefulSet>(&client, namespace), watcher::Config::default())
        .owns(api_for::<ConfigMap>(&client, namespace), watcher::Config::default())
        .reconcile_on(reference_triggers(
            api_for(&client, namespace),
            indexes.repositories.clone(),
            indexes.clone(),
            servers.clone(),
        ))
        .reconcile_on(reference_triggers(
            api_for(&client, namespace),
            indexes.groups.clone(),
            indexes.clone(),
            servers.clone(),
        ))
        .reconcile_on(reference_triggers(
            api_for(&client, namespace),
            indexes.users.clone(),
            indexes,
            servers,
        ))
        .shutdown_on_signal()
        .run(
            reconcile::<KubeClusterApi>,
            error_policy::<KubeClusterApi>,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((server, _)) => debug!("Reconciled SVNServer [{}]", server),
                // Deleted between being scheduled and being picked up
                Err(ControllerError::ObjectNotFound(server)) => {
                    debug!("SVNServer [{}] is gone, skipping it", server)
                }
                Err(error) => error!("Reconciliation failed: {}", error),
            }
        })
        .await;

    info!("Operator shut down");
    Ok(())
}

//! In-memory index of objects by the server they reference.
//!
//! The API server cannot select custom resources by a spec field, so the
//! operator keeps its own index, fed by a watch on each referencing kind.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};
use log::{debug, trace};

use crate::crd::ReferencesServer;
use crate::error::SvnOperatorError;

/// Namespace and name of a server.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ServerKey {
    pub namespace: String,
    pub name: String,
}

impl ServerKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        ServerKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Namespace and name of an indexed object.
type ObjectKey = (String, String);

struct IndexState<K> {
    ready: bool,
    by_server: HashMap<ServerKey, BTreeMap<String, Arc<K>>>,
    server_of: HashMap<ObjectKey, ServerKey>,
}

impl<K> Default for IndexState<K> {
    fn default() -> Self {
        IndexState {
            ready: false,
            by_server: HashMap::new(),
            server_of: HashMap::new(),
        }
    }
}

/// Cheaply cloneable handle; all clones share the same index.
pub struct ServerRefIndex<K> {
    kind: &'static str,
    state: Arc<RwLock<IndexState<K>>>,
}

impl<K> Clone for ServerRefIndex<K> {
    fn clone(&self) -> Self {
        ServerRefIndex {
            kind: self.kind,
            state: Arc::clone(&self.state),
        }
    }
}

impl<K> ServerRefIndex<K>
where
    K: Resource + ReferencesServer,
{
    pub fn new(kind: &'static str) -> Self {
        ServerRefIndex {
            kind,
            state: Arc::new(RwLock::new(IndexState::default())),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Applies a watch event and returns every server whose set of
    /// referencing objects may have changed.
    pub fn apply(&self, event: Event<K>) -> Vec<ServerKey> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut affected = HashSet::new();

        match event {
            Event::Applied(object) => {
                affected.extend(state.remove(&object_key(&object)));
                affected.insert(state.insert(object));
            }
            Event::Deleted(object) => {
                affected.extend(state.remove(&object_key(&object)));
            }
            Event::Restarted(objects) => {
                affected.extend(state.by_server.keys().cloned());
                state.by_server.clear();
                state.server_of.clear();
                for object in objects {
                    affected.insert(state.insert(object));
                }
                if !state.ready {
                    debug!("Index of {} objects received initial listing", self.kind);
                }
                state.ready = true;
            }
        }

        trace!(
            "{} event affected servers: {:?}",
            self.kind,
            affected.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        let mut affected: Vec<ServerKey> = affected.into_iter().collect();
        affected.sort();
        affected
    }

    /// All objects referencing `server`, ordered by name.
    pub fn referencing(&self, server: &ServerKey) -> Result<Vec<Arc<K>>, SvnOperatorError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if !state.ready {
            return Err(SvnOperatorError::IndexNotReady { kind: self.kind });
        }
        Ok(state
            .by_server
            .get(server)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Number of objects referencing `server`, zero before the initial listing.
    pub fn count(&self, server: &ServerKey) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.by_server.get(server).map(BTreeMap::len).unwrap_or(0)
    }
}

impl<K> IndexState<K>
where
    K: Resource + ReferencesServer,
{
    fn insert(&mut self, object: K) -> ServerKey {
        let (namespace, name) = object_key(&object);
        let server = ServerKey::new(&namespace, object.server_name());
        self.server_of
            .insert((namespace, name.clone()), server.clone());
        self.by_server
            .entry(server.clone())
            .or_default()
            .insert(name, Arc::new(object));
        server
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<ServerKey> {
        let server = self.server_of.remove(key)?;
        if let Some(objects) = self.by_server.get_mut(&server) {
            objects.remove(&key.1);
            if objects.is_empty() {
                self.by_server.remove(&server);
            }
        }
        Some(server)
    }
}

fn object_key<K: Resource>(object: &K) -> ObjectKey {
    (object.namespace().unwrap_or_default(), object.name_any())
}

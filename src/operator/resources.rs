//! Child resources of an [`SvnServer`] and how the server's overrides are
//! merged into them.
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction,
    PersistentVolumeClaim, PodSpec, PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::{SvnServer, API_GROUP};
use crate::error::SvnOperatorError;
use crate::error::SvnOperatorError::MissingObjectKey;
use crate::svnconfig::{CONFIG_MOUNT_PATH, REPOS_MOUNT_PATH};

pub const VOLUME_NAME_REPOS: &str = "repos";
pub const VOLUME_NAME_CONFIG: &str = "config";
pub const CONTAINER_NAME_SVN: &str = "svn";

pub const LABEL_APP_KEY: &str = "app";
pub const LABEL_APP_VALUE: &str = "subversion";

const HTTP_PORT_NAME: &str = "http";
const HTTP_PORT: i32 = 80;

pub fn labels_for(server: &SvnServer) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(String::from(LABEL_APP_KEY), String::from(LABEL_APP_VALUE));
    labels.insert(format!("{}/name", API_GROUP), server.name_any());
    labels
}

/// Metadata shared by all children: same name and namespace as the server and
/// a controller reference so that they are garbage collected with it.
fn child_metadata(server: &SvnServer) -> Result<ObjectMeta, SvnOperatorError> {
    let owner = server
        .controller_owner_ref(&())
        .ok_or(MissingObjectKey { key: "metadata.uid" })?;
    Ok(ObjectMeta {
        name: Some(server.name_any()),
        namespace: server.namespace(),
        owner_references: Some(vec![owner]),
        ..ObjectMeta::default()
    })
}

/// Headless service giving the server pod a stable network identity.
pub fn service_for(server: &SvnServer) -> Result<Service, SvnOperatorError> {
    Ok(Service {
        metadata: child_metadata(server)?,
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(String::from(HTTP_PORT_NAME)),
                port: HTTP_PORT,
                ..ServicePort::default()
            }]),
            selector: Some(labels_for(server)),
            cluster_ip: Some(String::from("None")),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    })
}

pub fn config_map_for(
    server: &SvnServer,
    data: BTreeMap<String, String>,
) -> Result<ConfigMap, SvnOperatorError> {
    Ok(ConfigMap {
        metadata: child_metadata(server)?,
        data: Some(data),
        ..ConfigMap::default()
    })
}

pub fn stateful_set_for(
    server: &SvnServer,
    default_image: &str,
) -> Result<StatefulSet, SvnOperatorError> {
    let labels = labels_for(server);
    let mut stateful_set = StatefulSet {
        metadata: child_metadata(server)?,
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec::default()),
            },
            service_name: server.name_any(),
            ..StatefulSetSpec::default()
        }),
        ..StatefulSet::default()
    };
    override_with_pod_template(server, &mut stateful_set, default_image);
    Ok(stateful_set)
}

fn svn_container(default_image: &str) -> Container {
    let http_probe = || Probe {
        http_get: Some(HTTPGetAction {
            path: Some(String::from("/")),
            port: IntOrString::Int(HTTP_PORT),
            ..HTTPGetAction::default()
        }),
        ..Probe::default()
    };

    Container {
        name: String::from(CONTAINER_NAME_SVN),
        image: Some(default_image.to_string()),
        ports: Some(vec![ContainerPort {
            container_port: HTTP_PORT,
            name: Some(String::from(HTTP_PORT_NAME)),
            ..ContainerPort::default()
        }]),
        readiness_probe: Some(http_probe()),
        liveness_probe: Some(http_probe()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: String::from(VOLUME_NAME_REPOS),
                mount_path: String::from(REPOS_MOUNT_PATH),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: String::from(VOLUME_NAME_CONFIG),
                mount_path: String::from(CONFIG_MOUNT_PATH),
                ..VolumeMount::default()
            },
        ]),
        ..Container::default()
    }
}

/// Returns the element named `name`, appending `create()` first if there is none.
fn find_or_append<'a, T>(
    items: &'a mut Vec<T>,
    name_of: impl Fn(&T) -> Option<&str>,
    name: &str,
    create: impl FnOnce() -> T,
) -> &'a mut T {
    let index = match items.iter().position(|item| name_of(item) == Some(name)) {
        Some(index) => index,
        None => {
            items.push(create());
            items.len() - 1
        }
    };
    &mut items[index]
}

/// Merges the server's pod template into `stateful_set` in place.
///
/// The repository claim, the config volume and the `svn` container are always
/// forced into shape. The remaining overrides are only copied when they are
/// set on the server, so fields tuned by hand on the StatefulSet survive.
pub fn override_with_pod_template(
    server: &SvnServer,
    stateful_set: &mut StatefulSet,
    default_image: &str,
) {
    let template = &server.spec.pod_template;
    let spec = stateful_set
        .spec
        .get_or_insert_with(StatefulSetSpec::default);

    let claims = spec.volume_claim_templates.get_or_insert_with(Vec::new);
    let claim = find_or_append(
        claims,
        |claim| claim.metadata.name.as_deref(),
        VOLUME_NAME_REPOS,
        PersistentVolumeClaim::default,
    );
    *claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(String::from(VOLUME_NAME_REPOS)),
            ..ObjectMeta::default()
        },
        spec: Some(server.spec.volume_claim_template.clone()),
        ..PersistentVolumeClaim::default()
    };

    let pod_spec = spec.template.spec.get_or_insert_with(PodSpec::default);

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    let volume = find_or_append(
        volumes,
        |volume| Some(volume.name.as_str()),
        VOLUME_NAME_CONFIG,
        Volume::default,
    );
    *volume = Volume {
        name: String::from(VOLUME_NAME_CONFIG),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(server.name_any()),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    };

    let container = find_or_append(
        &mut pod_spec.containers,
        |container| Some(container.name.as_str()),
        CONTAINER_NAME_SVN,
        || svn_container(default_image),
    );
    if !template.image.is_empty() {
        container.image = Some(template.image.clone());
    } else if container.image.as_deref().unwrap_or_default().is_empty() {
        container.image = Some(default_image.to_string());
    }

    if !template.node_selector.is_empty() {
        pod_spec.node_selector = Some(template.node_selector.clone());
    }
    if !template.service_account_name.is_empty() {
        pod_spec.service_account_name = Some(template.service_account_name.clone());
    }
    if !template.image_pull_secrets.is_empty() {
        pod_spec.image_pull_secrets = Some(template.image_pull_secrets.clone());
    }
    if let Some(affinity) = &template.affinity {
        pod_spec.affinity = Some(affinity.clone());
    }
    if !template.tolerations.is_empty() {
        pod_spec.tolerations = Some(template.tolerations.clone());
    }
}

//! The convergence pass of a single server.
//!
//! A pass performs at most one create or update of a child resource and then
//! reports that another pass is needed. Nothing is carried over in memory from
//! one pass to the next, so an interrupted pass is simply resumed by the next
//! one.
use chrono::{SecondsFormat, Utc};
use log::{debug, info, warn};
use strum::Display;

use crate::crd::{Condition, ConditionType, SvnServer, SvnServerStatus};
use crate::error::SvnOperatorError;
use crate::operator::api::{ClusterApi, ReferenceCounts};
use crate::operator::drift::{config_map_drifted, stateful_set_drifted};
use crate::operator::index::ServerKey;
use crate::operator::resources::{
    config_map_for, override_with_pod_template, service_for, stateful_set_for,
};
use crate::svnconfig::ConfigGenerator;

/// Maximum number of conditions kept in the status of a server.
pub const MAX_CONDITIONS: usize = 10;

/// Result of a single pass, named after the state the server was found in.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PassOutcome {
    /// The server does not exist (anymore), nothing to do.
    ServerMissing,
    ServiceCreated,
    StatefulSetCreated,
    ConfigMapCreated,
    StatefulSetUpdated,
    ConfigMapUpdated,
    Converged,
}

impl PassOutcome {
    pub fn needs_another_pass(self) -> bool {
        !matches!(self, PassOutcome::ServerMissing | PassOutcome::Converged)
    }
}

pub struct Synthesizer<A> {
    api: A,
    generator: ConfigGenerator,
    default_image: String,
}

impl<A: ClusterApi> Synthesizer<A> {
    pub fn new(api: A, generator: ConfigGenerator, default_image: String) -> Self {
        Synthesizer {
            api,
            generator,
            default_image,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Runs one pass and records its result in the status of the server.
    ///
    /// Benign errors (objects vanishing or appearing concurrently) are
    /// swallowed inside the pass; every other error is returned so the caller
    /// can retry with backoff.
    pub async fn converge(&self, key: &ServerKey) -> Result<PassOutcome, SvnOperatorError> {
        let server = match self.api.get_server(key).await? {
            Some(server) => server,
            None => {
                report_missing_server(key, self.api.reference_counts(key));
                return Ok(PassOutcome::ServerMissing);
            }
        };

        match self.run_pass(key, &server).await {
            Ok(outcome) => {
                if outcome == PassOutcome::Converged {
                    self.record_condition(key, &server, ConditionType::Synced, String::new())
                        .await;
                }
                Ok(outcome)
            }
            // The indexes fill up right after startup, that is no failure of the server
            Err(error @ SvnOperatorError::IndexNotReady { .. }) => Err(error),
            Err(error) => {
                self.record_condition(key, &server, ConditionType::Failed, error.to_string())
                    .await;
                Err(error)
            }
        }
    }

    async fn run_pass(
        &self,
        key: &ServerKey,
        server: &SvnServer,
    ) -> Result<PassOutcome, SvnOperatorError> {
        if self.api.get_service(key).await?.is_none() {
            info!("Creating Service [{}]", key);
            let service = service_for(server)?;
            swallow_benign(self.api.create_service(&service).await)?;
            return Ok(PassOutcome::ServiceCreated);
        }

        let stateful_set = match self.api.get_stateful_set(key).await? {
            Some(stateful_set) => stateful_set,
            None => {
                info!("Creating StatefulSet [{}]", key);
                let stateful_set = stateful_set_for(server, &self.default_image)?;
                swallow_benign(self.api.create_stateful_set(&stateful_set).await)?;
                return Ok(PassOutcome::StatefulSetCreated);
            }
        };

        let snapshot = self.api.snapshot(key).await?;
        let desired_files = self.generator.generate(&snapshot)?;

        let config_map = match self.api.get_config_map(key).await? {
            Some(config_map) => config_map,
            None => {
                info!("Creating ConfigMap [{}]", key);
                let config_map = config_map_for(server, desired_files)?;
                swallow_benign(self.api.create_config_map(&config_map).await)?;
                return Ok(PassOutcome::ConfigMapCreated);
            }
        };

        let mut desired_stateful_set = stateful_set.clone();
        override_with_pod_template(server, &mut desired_stateful_set, &self.default_image);
        if stateful_set_drifted(&stateful_set, &desired_stateful_set)? {
            info!("Updating StatefulSet [{}] to match the server template", key);
            swallow_benign(self.api.replace_stateful_set(&desired_stateful_set).await)?;
            return Ok(PassOutcome::StatefulSetUpdated);
        }

        if config_map_drifted(&config_map, &desired_files) {
            info!("Updating ConfigMap [{}] with regenerated configuration", key);
            let mut desired_config_map = config_map;
            desired_config_map.data = Some(desired_files);
            swallow_benign(self.api.replace_config_map(&desired_config_map).await)?;
            return Ok(PassOutcome::ConfigMapUpdated);
        }

        debug!("SVNServer [{}] is converged", key);
        Ok(PassOutcome::Converged)
    }

    /// Appends a condition unless the latest one already says the same.
    /// Failures are logged only; the status is informational.
    async fn record_condition(
        &self,
        key: &ServerKey,
        server: &SvnServer,
        type_: ConditionType,
        reason: String,
    ) {
        let mut status = server.status.clone().unwrap_or_default();
        if let Some(latest) = status.latest_condition() {
            if latest.type_ == type_ && latest.reason == reason {
                return;
            }
        }

        status.conditions.push(Condition {
            type_,
            reason,
            transition_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        truncate_conditions(&mut status);

        debug!("Recording condition [{}] for SVNServer [{}]", type_, key);
        if let Err(error) = self.api.update_server_status(key, &status).await {
            warn!(
                "Status of SVNServer [{}] could not be updated. {}",
                key, error
            );
        }
    }
}

fn truncate_conditions(status: &mut SvnServerStatus) {
    let excess = status.conditions.len().saturating_sub(MAX_CONDITIONS);
    status.conditions.drain(..excess);
}

fn swallow_benign(result: Result<(), SvnOperatorError>) -> Result<(), SvnOperatorError> {
    match result {
        Err(error) if error.is_benign() => {
            debug!("Ignoring benign error, the next pass will pick up the change: {}", error);
            Ok(())
        }
        other => other,
    }
}

/// Objects referencing a server that does not exist have no effect. This is
/// reported in the log only, as there is no server to carry a status.
pub(crate) fn report_missing_server(key: &ServerKey, references: ReferenceCounts) {
    if references.is_empty() {
        info!("SVNServer [{}] not found; ignoring", key);
    } else {
        warn!(
            "SVNServer [{}] not found, but it is referenced by {} repositories, {} groups \
            and {} users; these have no effect until the server exists",
            key, references.repositories, references.groups, references.users
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{Access, PodTemplate};
    use crate::operator::fake::FakeCluster;
    use crate::operator::resources::test::{server, DEFAULT_IMAGE};
    use crate::operator::snapshot::test::{group, repository, user};
    use crate::svnconfig::AUTHZ_SVN_ACCESS_FILE;
    use k8s_openapi::api::core::v1::PodSpec;
    use std::collections::BTreeMap;

    fn synthesizer(cluster: FakeCluster) -> Synthesizer<FakeCluster> {
        Synthesizer::new(
            cluster,
            ConfigGenerator::new().unwrap(),
            DEFAULT_IMAGE.to_string(),
        )
    }

    fn main_key() -> ServerKey {
        ServerKey::new("default", "main")
    }

    fn stored_pod_spec(cluster: &FakeCluster) -> PodSpec {
        cluster
            .stateful_set(&main_key())
            .unwrap()
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
    }

    #[tokio::test]
    async fn should_converge_in_four_passes() {
        let cluster = FakeCluster::new();
        cluster.put_server(server("main", PodTemplate::default()));
        let synthesizer = synthesizer(cluster);
        let key = main_key();

        let mut outcomes = vec![];
        for _ in 0..4 {
            outcomes.push(synthesizer.converge(&key).await.unwrap());
        }

        assert_eq!(
            vec![
                PassOutcome::ServiceCreated,
                PassOutcome::StatefulSetCreated,
                PassOutcome::ConfigMapCreated,
                PassOutcome::Converged,
            ],
            outcomes
        );
        assert_eq!(3, synthesizer.api().child_mutations());

        // Recording the Synced condition changed the server, the next pass
        // must not touch anything
        let calls = synthesizer.api().mutations();
        assert_eq!(PassOutcome::Converged, synthesizer.converge(&key).await.unwrap());
        assert_eq!(calls, synthesizer.api().mutations());

        let status = synthesizer.api().server(&key).unwrap().status.unwrap();
        assert_eq!(1, status.conditions.len());
        assert_eq!(ConditionType::Synced, status.conditions[0].type_);
    }

    #[tokio::test]
    async fn missing_server_should_be_a_no_op() {
        let cluster = FakeCluster::new();
        cluster.put_repository(repository("trunk", "main"));
        let synthesizer = synthesizer(cluster);

        assert_eq!(
            PassOutcome::ServerMissing,
            synthesizer.converge(&main_key()).await.unwrap()
        );
        assert_eq!(0, synthesizer.api().mutations());
    }

    #[tokio::test]
    async fn changed_references_should_update_config_map_once() {
        let cluster = FakeCluster::new();
        cluster.put_server(server("main", PodTemplate::default()));
        let synthesizer = synthesizer(cluster);
        let key = main_key();
        while synthesizer.converge(&key).await.unwrap().needs_another_pass() {}

        synthesizer.api().put_repository(repository("trunk", "main"));
        synthesizer
            .api()
            .put_group(group("devs", "main", &[("trunk", Access::ReadWrite)]));
        synthesizer.api().put_user(user("gura", "main", &["devs"]));
        // Objects of other servers must not leak into this configuration
        synthesizer.api().put_user(user("ame", "other", &["devs"]));

        assert_eq!(
            PassOutcome::ConfigMapUpdated,
            synthesizer.converge(&key).await.unwrap()
        );
        let mutations = synthesizer.api().child_mutations();
        assert_eq!(PassOutcome::Converged, synthesizer.converge(&key).await.unwrap());
        assert_eq!(mutations, synthesizer.api().child_mutations());

        let data = synthesizer.api().config_map(&key).unwrap().data.unwrap();
        assert_eq!(
            "[groups]\ndevs = gura\n[trunk:/]\n* = \ndevs = rw\n",
            data[AUTHZ_SVN_ACCESS_FILE]
        );
    }

    #[tokio::test]
    async fn hand_set_node_selector_should_survive_convergence() {
        let cluster = FakeCluster::new();
        cluster.put_server(server("main", PodTemplate::default()));
        let synthesizer = synthesizer(cluster);
        let key = main_key();
        while synthesizer.converge(&key).await.unwrap().needs_another_pass() {}

        let mut node_selector = BTreeMap::new();
        node_selector.insert(String::from("disk"), String::from("ssd"));
        synthesizer.api().edit_stateful_set(&key, |stateful_set| {
            stateful_set
                .spec
                .as_mut()
                .unwrap()
                .template
                .spec
                .as_mut()
                .unwrap()
                .node_selector = Some(node_selector.clone());
        });

        assert_eq!(PassOutcome::Converged, synthesizer.converge(&key).await.unwrap());
        assert_eq!(
            Some(node_selector),
            stored_pod_spec(synthesizer.api()).node_selector
        );
    }

    #[tokio::test]
    async fn changed_template_should_update_stateful_set() {
        let cluster = FakeCluster::new();
        cluster.put_server(server("main", PodTemplate::default()));
        let synthesizer = synthesizer(cluster);
        let key = main_key();
        while synthesizer.converge(&key).await.unwrap().needs_another_pass() {}

        synthesizer.api().put_server(server(
            "main",
            PodTemplate {
                image: String::from("svn-server:custom"),
                ..PodTemplate::default()
            },
        ));

        assert_eq!(
            PassOutcome::StatefulSetUpdated,
            synthesizer.converge(&key).await.unwrap()
        );
        assert_eq!(PassOutcome::Converged, synthesizer.converge(&key).await.unwrap());
        assert_eq!(
            Some("svn-server:custom"),
            stored_pod_spec(synthesizer.api()).containers[0].image.as_deref()
        );
    }

    #[tokio::test]
    async fn create_race_should_be_benign() {
        let cluster = FakeCluster::new();
        cluster.put_server(server("main", PodTemplate::default()));
        cluster.fail_next_create_with_already_exists();
        let synthesizer = synthesizer(cluster);

        assert_eq!(
            PassOutcome::ServiceCreated,
            synthesizer.converge(&main_key()).await.unwrap()
        );
    }

    #[tokio::test]
    async fn stale_update_should_fail_and_record_condition() {
        let cluster = FakeCluster::new();
        cluster.put_server(server("main", PodTemplate::default()));
        let synthesizer = synthesizer(cluster);
        let key = main_key();
        while synthesizer.converge(&key).await.unwrap().needs_another_pass() {}

        synthesizer.api().put_repository(repository("trunk", "main"));
        synthesizer.api().bump_config_map_version_on_next_read();

        let error = synthesizer.converge(&key).await.unwrap_err();
        assert!(error.is_conflict());
        let status = synthesizer.api().server(&key).unwrap().status.unwrap();
        assert_eq!(
            ConditionType::Failed,
            status.latest_condition().unwrap().type_
        );

        // The retry succeeds and flips the condition back
        assert_eq!(
            PassOutcome::ConfigMapUpdated,
            synthesizer.converge(&key).await.unwrap()
        );
        assert_eq!(PassOutcome::Converged, synthesizer.converge(&key).await.unwrap());
        let status = synthesizer.api().server(&key).unwrap().status.unwrap();
        assert_eq!(
            ConditionType::Synced,
            status.latest_condition().unwrap().type_
        );
    }

    #[test]
    fn should_keep_only_the_latest_conditions() {
        let mut status = SvnServerStatus::default();
        for i in 0..(MAX_CONDITIONS + 3) {
            status.conditions.push(Condition {
                type_: ConditionType::Failed,
                reason: i.to_string(),
                transition_time: String::new(),
            });
        }

        truncate_conditions(&mut status);

        assert_eq!(MAX_CONDITIONS, status.conditions.len());
        assert_eq!("3", status.conditions[0].reason);
    }
}

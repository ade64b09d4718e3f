//! # Status module
//!
//! This module provides the health observer, a driver walking the registry
//! of known clusters every few seconds, probing every ready pod and
//! maintaining the observed state of each cluster object

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{api::ListParams, Api, ResourceExt};
use tracing::{debug, error, info};

use crate::svc::{
    cluster::{self, ResourceName},
    cluster::builder::secret::{METRICS_PASSWORD_KEY, METRICS_USER_KEY},
    crd::{
        admission,
        cluster::{ClusterCondition, ClusterConditionType, ClusterState, ConditionStatus, MysqlCluster},
    },
    k8s::{resource, Context},
    status::registry::ClusterKey,
};

pub mod node;
pub mod registry;

// -----------------------------------------------------------------------------
// Constants

/// period between two walks over the registry
pub const OBSERVE_INTERVAL: Duration = Duration::from_secs(5);

/// how long a pod must stay unschedulable before the reconciliation driver
/// degrades the cluster, the observer reports it immediately
pub const UNSCHEDULABLE_GRACE: Duration = Duration::from_secs(60);

pub const UNSCHEDULABLE_REASON: &str = "Unschedulable";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Kube(err)
    }
}

// -----------------------------------------------------------------------------
// Driver

/// walk the registry on a fixed interval and observe every known cluster.
/// Failures are recorded and retried on the next tick
pub async fn run(ctx: Arc<Context>) {
    let mut ticker = tokio::time::interval(OBSERVE_INTERVAL);

    loop {
        ticker.tick().await;

        for (key, entry) in ctx.registry.snapshot() {
            let _guard = entry.lock().await;

            debug!(
                namespace = &key.namespace,
                name = &key.name,
                "Observe health of cluster",
            );

            if let Err(err) = observe_cluster(&ctx, &key).await {
                error!(
                    namespace = &key.namespace,
                    name = &key.name,
                    error = err.to_string(),
                    "Failed to observe health of cluster",
                );
            }
        }
    }
}

/// observe one cluster, refreshing its cluster condition and its per-node
/// statuses
async fn observe_cluster(ctx: &Context, key: &ClusterKey) -> Result<(), Error> {
    let api: Api<MysqlCluster> = Api::namespaced(ctx.kube.to_owned(), &key.namespace);

    let mut cluster = match api.get_opt(&key.name).await? {
        Some(cluster) => cluster,
        None => {
            // the parent is gone, children follow through garbage collection
            info!(
                namespace = &key.namespace,
                name = &key.name,
                "Cluster is gone, purge it from the registry",
            );
            ctx.registry.unregister(key);
            return Ok(());
        }
    };

    admission::apply_defaults(&mut cluster);

    let name = cluster.name_any();
    let replicas = cluster.spec.replicas.unwrap_or_default();
    let service = cluster::name_for_resource(ResourceName::HeadlessService, &name);
    let selector = cluster::selector(&cluster);
    let previous = cluster.status.to_owned();

    let pods = Api::<Pod>::namespaced(ctx.kube.to_owned(), &key.namespace)
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    let ready = ready_pods(&pods);
    let credentials = metrics_credentials(ctx, key, &name).await?;

    {
        let status = cluster.status.get_or_insert_with(Default::default);

        status.ready_nodes = ready.len() as i32;

        let (state, condition) = compose_cluster_condition(&pods, status.ready_nodes, replicas);
        status.state = state;
        status.push_condition(condition);

        for pod in &ready {
            node::observe_node(
                ctx,
                &key.namespace,
                &service,
                status,
                credentials.as_ref(),
                pod,
            )
            .await;
        }
    }

    if cluster.status != previous {
        resource::patch_status(
            ctx.kube.to_owned(),
            &cluster,
            serde_json::json!(cluster.status),
        )
        .await?;
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// Helper functions

/// returns the pods whose containers-ready condition is true
pub fn ready_pods(pods: &[Pod]) -> Vec<Pod> {
    pods.iter()
        .filter(|pod| {
            pod.status
                .as_ref()
                .and_then(|status| status.conditions.as_ref())
                .map(|conditions| {
                    conditions
                        .iter()
                        .any(|cond| cond.type_ == "ContainersReady" && cond.status == "True")
                })
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// returns the message of a pod stuck unschedulable, when `older_than` is
/// given the condition must have lasted at least that long
pub fn unschedulable_message(pods: &[Pod], older_than: Option<Duration>) -> Option<String> {
    let now = Utc::now();

    pods.iter()
        .filter_map(|pod| pod.status.as_ref())
        .filter_map(|status| status.conditions.as_ref())
        .flatten()
        .find(|cond| {
            if cond.type_ != "PodScheduled" || cond.reason.as_deref() != Some(UNSCHEDULABLE_REASON)
            {
                return false;
            }

            match older_than {
                None => true,
                Some(age) => cond
                    .last_transition_time
                    .as_ref()
                    .map(|transition| {
                        now.signed_duration_since(transition.0).num_seconds()
                            >= age.as_secs() as i64
                    })
                    .unwrap_or(false),
            }
        })
        .map(|cond| cond.message.to_owned().unwrap_or_default())
}

/// compose the cluster state and condition of one observer tick. An
/// unschedulable pod takes precedence, then the all-replicas-ready
/// promotion, everything else keeps the cluster initializing
pub fn compose_cluster_condition(
    pods: &[Pod],
    ready_nodes: i32,
    replicas: i32,
) -> (ClusterState, ClusterCondition) {
    if let Some(message) = unschedulable_message(pods, None) {
        let mut condition =
            ClusterCondition::new(ClusterConditionType::Error, ConditionStatus::True);
        condition.reason = UNSCHEDULABLE_REASON.to_string();
        condition.message = message;

        return (ClusterState::Error, condition);
    }

    if ready_nodes == replicas {
        return (
            ClusterState::Ready,
            ClusterCondition::new(ClusterConditionType::Ready, ConditionStatus::True),
        );
    }

    (
        ClusterState::Initializing,
        ClusterCondition::new(ClusterConditionType::Initializing, ConditionStatus::True),
    )
}

/// fetch the metrics credentials from the identity store, both keys must be
/// present and filled for the sql probe to run
async fn metrics_credentials(
    ctx: &Context,
    key: &ClusterKey,
    name: &str,
) -> Result<Option<(String, String)>, Error> {
    let api: Api<Secret> = Api::namespaced(ctx.kube.to_owned(), &key.namespace);
    let secret = api
        .get_opt(&cluster::name_for_resource(ResourceName::Secret, name))
        .await?;

    let credentials = secret
        .and_then(|secret| secret.data)
        .and_then(|data| {
            let user = data.get(METRICS_USER_KEY)?.0.to_owned();
            let password = data.get(METRICS_PASSWORD_KEY)?.0.to_owned();

            Some((
                String::from_utf8_lossy(&user).to_string(),
                String::from_utf8_lossy(&password).to_string(),
            ))
        })
        .filter(|(user, password)| !user.is_empty() && !password.is_empty());

    Ok(credentials)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{PodCondition, PodStatus},
        apimachinery::pkg::apis::meta::v1::Time,
    };

    use super::*;
    use crate::svc::crd::cluster::ClusterStatus;

    fn pod(conditions: Vec<PodCondition>) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn condition(r#type: &str, status: &str) -> PodCondition {
        PodCondition {
            type_: r#type.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn ready_pods_require_containers_ready() {
        let pods = vec![
            pod(vec![condition("ContainersReady", "True")]),
            pod(vec![condition("ContainersReady", "False")]),
            pod(vec![condition("PodScheduled", "True")]),
        ];

        assert_eq!(ready_pods(&pods).len(), 1);
    }

    #[test]
    fn unschedulable_pod_degrades_the_cluster() {
        let mut unschedulable = condition("PodScheduled", "False");
        unschedulable.reason = Some(UNSCHEDULABLE_REASON.to_string());
        unschedulable.message = Some("0/3 nodes available".to_string());

        let pods = vec![pod(vec![unschedulable])];
        let (state, condition) = compose_cluster_condition(&pods, 2, 3);

        assert_eq!(state, ClusterState::Error);
        assert_eq!(condition.r#type, ClusterConditionType::Error);
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, UNSCHEDULABLE_REASON);
        assert_eq!(condition.message, "0/3 nodes available");
    }

    #[test]
    fn all_replicas_ready_promotes_the_cluster() {
        let pods = vec![
            pod(vec![condition("ContainersReady", "True")]),
            pod(vec![condition("ContainersReady", "True")]),
            pod(vec![condition("ContainersReady", "True")]),
        ];

        let (state, condition) = compose_cluster_condition(&pods, 3, 3);
        assert_eq!(state, ClusterState::Ready);
        assert_eq!(condition.r#type, ClusterConditionType::Ready);

        let (state, condition) = compose_cluster_condition(&pods, 2, 3);
        assert_eq!(state, ClusterState::Initializing);
        assert_eq!(condition.r#type, ClusterConditionType::Initializing);
    }

    #[test]
    fn the_grace_period_holds_back_fresh_unschedulable_conditions() {
        let mut unschedulable = condition("PodScheduled", "False");
        unschedulable.reason = Some(UNSCHEDULABLE_REASON.to_string());
        unschedulable.message = Some("0/3 nodes available".to_string());
        unschedulable.last_transition_time = Some(Time(Utc::now()));

        let pods = vec![pod(vec![unschedulable.to_owned()])];
        assert!(unschedulable_message(&pods, Some(UNSCHEDULABLE_GRACE)).is_none());
        assert!(unschedulable_message(&pods, None).is_some());

        unschedulable.last_transition_time =
            Some(Time(Utc::now() - chrono::Duration::seconds(120)));
        let pods = vec![pod(vec![unschedulable])];
        assert_eq!(
            unschedulable_message(&pods, Some(UNSCHEDULABLE_GRACE)).as_deref(),
            Some("0/3 nodes available")
        );
    }

    #[test]
    fn conditions_settle_across_repeated_ticks() {
        let mut status = ClusterStatus::default();

        for _ in 0..5 {
            let (state, condition) = compose_cluster_condition(&[], 0, 3);
            status.state = state;
            status.push_condition(condition);
        }

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.state, ClusterState::Initializing);
    }
}

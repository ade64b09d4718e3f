//! # Node observer
//!
//! This module provides the per-pod probing of the health observer, asking
//! the raft supervisor for the node role, inspecting replication and
//! read-only state over sql and mirroring the verdict as a pod label

use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Patch, PatchParams},
    Api, ResourceExt,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::svc::{
    cluster::{CONTAINER_MYSQL, CONTAINER_XENON, LABEL_HEALTHY, MYSQL_PORT},
    crd::cluster::{ClusterStatus, ConditionStatus, NodeConditionType, NodeStatus},
    k8s::{exec, Context},
    mysql::SqlRunner,
};

// -----------------------------------------------------------------------------
// Constants

/// attempts of the replication probe before giving up for this tick
const SLAVE_STATUS_RETRY: u32 = 3;

const RAFT_LEADER: &str = "LEADER";
const RAFT_FOLLOWER: &str = "FOLLOWER";

// -----------------------------------------------------------------------------
// RaftStatus structure

/// payload of `xenoncli raft status`
#[derive(Deserialize, Debug)]
struct RaftStatus {
    #[serde(default)]
    state: String,
}

// -----------------------------------------------------------------------------
// Observation

/// observe one ready pod, resolving its node status entry by stable host
/// name, refreshing the four conditions and mirroring the health verdict as
/// a pod label.
///
/// Probe failures land in the node message and leave the related conditions
/// unknown, the cluster level state is not affected
pub async fn observe_node(
    ctx: &Context,
    namespace: &str,
    service: &str,
    status: &mut ClusterStatus,
    credentials: Option<&(String, String)>,
    pod: &Pod,
) {
    let pod_name = pod.name_any();
    let host = format!("{}.{}.{}", pod_name, service, namespace);
    let index = status.node_index(&host);

    status.nodes[index].message.clear();

    // -------------------------------------------------------------------------
    // Step 1: role probe through the raft supervisor

    let leader = match raft_role(ctx, namespace, &pod_name).await {
        Ok(role) => role,
        Err(message) => {
            status.nodes[index].message = message;
            ConditionStatus::Unknown
        }
    };
    status.nodes[index].set_condition(NodeConditionType::Leader, leader);

    // -------------------------------------------------------------------------
    // Step 2: replication and read-only probes over sql

    let mut lagged = ConditionStatus::Unknown;
    let mut replicating = ConditionStatus::Unknown;
    let mut read_only = ConditionStatus::Unknown;

    let mut runner = match credentials {
        None => {
            status.nodes[index].message =
                "metrics credentials are not available yet".to_string();
            None
        }
        Some((user, password)) => {
            match SqlRunner::connect(user, password, &host, MYSQL_PORT as u16).await {
                Ok(runner) => Some(runner),
                Err(err) => {
                    status.nodes[index].message = err.to_string();
                    None
                }
            }
        }
    };

    if let Some(runner) = runner.as_mut() {
        match runner.check_slave_status_with_retry(SLAVE_STATUS_RETRY).await {
            Ok(slave) => {
                lagged = slave.lagged;
                replicating = slave.replicating;
                if let Some(message) = slave.message {
                    status.nodes[index].message = message;
                }
            }
            Err(err) => status.nodes[index].message = err.to_string(),
        }

        match runner.check_read_only().await {
            Ok(probed) => read_only = probed,
            Err(err) => status.nodes[index].message = err.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Step 3: a leader still read-only is a split, force it writable. The
    // probe connection is preferred, the in-container exec is the fallback

    if leader == ConditionStatus::True && read_only != ConditionStatus::False {
        info!(
            namespace = namespace,
            pod = &pod_name,
            "Leader node is read-only, forcing it writable",
        );

        if let Err(message) = correct_leader(ctx, namespace, &pod_name, runner.as_mut()).await {
            warn!(
                namespace = namespace,
                pod = &pod_name,
                error = &message,
                "Failed to force leader node writable",
            );
            status.nodes[index].message = message;
        }
    }

    if let Some(runner) = runner.take() {
        if let Err(err) = runner.close().await {
            debug!(error = err.to_string(), "failed to close probe connection");
        }
    }

    // -------------------------------------------------------------------------
    // Step 4: record conditions at their positional indices

    status.nodes[index].set_condition(NodeConditionType::Lagged, lagged);
    status.nodes[index].set_condition(NodeConditionType::Replicating, replicating);
    status.nodes[index].set_condition(NodeConditionType::ReadOnly, read_only);

    // -------------------------------------------------------------------------
    // Step 5: mirror the verdict as a pod label, only on change

    let verdict = if is_healthy(&status.nodes[index]) {
        "yes"
    } else {
        "no"
    };

    if pod.labels().get(LABEL_HEALTHY).map(String::as_str) != Some(verdict) {
        let api: Api<Pod> = Api::namespaced(ctx.kube.to_owned(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "labels": {
                    LABEL_HEALTHY: verdict,
                }
            }
        });

        if let Err(err) = api
            .patch(&pod_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(
                namespace = namespace,
                pod = &pod_name,
                error = err.to_string(),
                "Failed to update the healthy label of pod",
            );
        }
    }
}

/// returns whether the node derived conditions describe a healthy member, a
/// writable non-replicating leader or a read-only replicating follower,
/// neither of them lagging
pub fn is_healthy(node: &NodeStatus) -> bool {
    use ConditionStatus::{False, True};
    use NodeConditionType::{Lagged, Leader, ReadOnly, Replicating};

    node.condition(Lagged) == False
        && ((node.condition(Leader) == False
            && node.condition(ReadOnly) == True
            && node.condition(Replicating) == True)
            || (node.condition(Leader) == True
                && node.condition(ReadOnly) == False
                && node.condition(Replicating) == False))
}

// -----------------------------------------------------------------------------
// Helper functions

/// ask the raft supervisor for the node role
async fn raft_role(
    ctx: &Context,
    namespace: &str,
    pod_name: &str,
) -> Result<ConditionStatus, String> {
    let output = exec::command_stdout(
        ctx.kube.to_owned(),
        namespace,
        pod_name,
        CONTAINER_XENON,
        &["xenoncli", "raft", "status"],
    )
    .await
    .map_err(|err| err.to_string())?;

    let raft: RaftStatus = serde_json::from_str(&output)
        .map_err(|err| format!("failed to parse raft status, {}", err))?;

    Ok(match raft.state.as_str() {
        RAFT_LEADER => ConditionStatus::True,
        RAFT_FOLLOWER => ConditionStatus::False,
        _ => ConditionStatus::Unknown,
    })
}

/// issue the two statements turning a split leader writable, in order
async fn correct_leader(
    ctx: &Context,
    namespace: &str,
    pod_name: &str,
    runner: Option<&mut SqlRunner>,
) -> Result<(), String> {
    match runner {
        Some(runner) => {
            runner
                .run_query("SET GLOBAL read_only=off")
                .await
                .map_err(|err| err.to_string())?;
            runner
                .run_query("SET GLOBAL super_read_only=off")
                .await
                .map_err(|err| err.to_string())?;
        }
        None => {
            for statement in ["SET GLOBAL read_only=off", "SET GLOBAL super_read_only=off"] {
                exec::command_stdout(
                    ctx.kube.to_owned(),
                    namespace,
                    pod_name,
                    CONTAINER_MYSQL,
                    &[
                        "sh",
                        "-c",
                        &format!(
                            r#"mysql -uroot -p"${{MYSQL_ROOT_PASSWORD}}" -e "{}""#,
                            statement
                        ),
                    ],
                )
                .await
                .map_err(|err| err.to_string())?;
            }
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use ConditionStatus::{False, True, Unknown};

    fn node(
        lagged: ConditionStatus,
        leader: ConditionStatus,
        read_only: ConditionStatus,
        replicating: ConditionStatus,
    ) -> NodeStatus {
        let mut node = NodeStatus::new("demo-mysql-0.demo-mysql.ns1".to_string());
        node.set_condition(NodeConditionType::Lagged, lagged);
        node.set_condition(NodeConditionType::Leader, leader);
        node.set_condition(NodeConditionType::ReadOnly, read_only);
        node.set_condition(NodeConditionType::Replicating, replicating);
        node
    }

    #[test]
    fn only_two_condition_rows_are_healthy() {
        let all = [True, False, Unknown];

        for lagged in all {
            for leader in all {
                for read_only in all {
                    for replicating in all {
                        let expected = lagged == False
                            && ((leader == False && read_only == True && replicating == True)
                                || (leader == True
                                    && read_only == False
                                    && replicating == False));

                        assert_eq!(
                            is_healthy(&node(lagged, leader, read_only, replicating)),
                            expected,
                            "lagged={:?} leader={:?} read_only={:?} replicating={:?}",
                            lagged,
                            leader,
                            read_only,
                            replicating,
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn healthy_follower_and_healthy_leader() {
        assert!(is_healthy(&node(False, False, True, True)));
        assert!(is_healthy(&node(False, True, False, False)));
        assert!(!is_healthy(&node(True, False, True, True)));
        assert!(!is_healthy(&node(False, True, True, False)));
    }

    #[test]
    fn raft_states_collapse_to_the_three_roles() {
        let parse = |payload: &str| -> ConditionStatus {
            let raft: RaftStatus = serde_json::from_str(payload).unwrap();
            match raft.state.as_str() {
                RAFT_LEADER => ConditionStatus::True,
                RAFT_FOLLOWER => ConditionStatus::False,
                _ => ConditionStatus::Unknown,
            }
        };

        assert_eq!(parse(r#"{"state": "LEADER"}"#), True);
        assert_eq!(parse(r#"{"state": "FOLLOWER"}"#), False);
        assert_eq!(parse(r#"{"state": "CANDIDATE"}"#), Unknown);
        assert_eq!(parse(r#"{}"#), Unknown);
    }
}

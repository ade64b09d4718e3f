//! # MySQL cluster custom resource
//!
//! This module provides the mysql cluster custom resource, the observed
//! status carried by its status sub-resource and the condition records
//! shared by the reconciliation driver and the health observer

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{Affinity, ResourceRequirements, Toleration},
    apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// MysqlConf type

/// extra `[mysqld]` options forwarded to the generated node.cnf, keyed by
/// option name
pub type MysqlConf = BTreeMap<String, IntOrString>;

// -----------------------------------------------------------------------------
// MysqlOpts structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct MysqlOpts {
    /// Password for the root user
    #[serde(rename = "rootPassword", default)]
    pub root_password: String,
    /// Username of the application user to create
    #[serde(rename = "user", default)]
    pub user: String,
    /// Password for the application user
    #[serde(rename = "password", default)]
    pub password: String,
    /// Name of the application database to create
    #[serde(rename = "database", default)]
    pub database: String,
    /// Install the tokudb storage engine
    #[serde(rename = "initTokudb", default)]
    pub init_tokudb: bool,
    #[serde(rename = "conf", default)]
    pub conf: MysqlConf,
    #[serde(rename = "resources", default)]
    pub resources: ResourceRequirements,
}

// -----------------------------------------------------------------------------
// XenonOpts structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct XenonOpts {
    #[serde(rename = "image", default)]
    pub image: String,
    /// Number of missed heartbeats after which the raft supervisor admits
    /// defeat, at least 1
    #[serde(rename = "admitDefeatHearbeatCount")]
    pub admit_defeat_hearbeat_count: Option<i32>,
    /// Raft election timeout in milliseconds, at least the heartbeat count
    #[serde(rename = "electionTimeout")]
    pub election_timeout: Option<i32>,
    #[serde(rename = "resources", default)]
    pub resources: ResourceRequirements,
}

// -----------------------------------------------------------------------------
// MetricsOpts structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct MetricsOpts {
    #[serde(rename = "image", default)]
    pub image: String,
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
    #[serde(rename = "resources", default)]
    pub resources: ResourceRequirements,
}

// -----------------------------------------------------------------------------
// PodPolicy structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PodPolicy {
    #[serde(rename = "imagePullPolicy", default)]
    pub image_pull_policy: String,
    #[serde(rename = "labels", default)]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "annotations", default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "affinity")]
    pub affinity: Option<Affinity>,
    #[serde(rename = "tolerations", default)]
    pub tolerations: Vec<Toleration>,
    #[serde(rename = "schedulerName", default)]
    pub scheduler_name: String,
    #[serde(rename = "priorityClassName", default)]
    pub priority_class_name: String,
    /// Service account used by the pods, between 1 and 63 characters
    #[serde(rename = "serviceAccountName", default)]
    pub service_account_name: String,
    #[serde(rename = "resources", default)]
    pub resources: ResourceRequirements,
    /// Image providing the `sidecar` binary used by the init container and
    /// the log tail containers
    #[serde(rename = "sidecarImage", default)]
    pub sidecar_image: String,
}

// -----------------------------------------------------------------------------
// Persistence structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Persistence {
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
    #[serde(rename = "accessModes", default)]
    pub access_modes: Vec<String>,
    /// Storage class of the data volume claims, the literal "-" meaning "no
    /// class"
    #[serde(rename = "storageClass")]
    pub storage_class: Option<String>,
    #[serde(rename = "size", default)]
    pub size: String,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            enabled: true,
            access_modes: vec![],
            storage_class: None,
            size: String::new(),
        }
    }
}

// -----------------------------------------------------------------------------
// ClusterSpec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "mysql.radondb.io")]
#[kube(version = "v1alpha1")]
#[kube(kind = "MysqlCluster")]
#[kube(singular = "mysqlcluster")]
#[kube(plural = "mysqlclusters")]
#[kube(shortname = "mysql")]
#[kube(status = "ClusterStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct ClusterSpec {
    /// Number of pods, one of 0, 2, 3 or 5. Defaults to 3
    #[serde(rename = "replicas")]
    pub replicas: Option<i32>,
    /// Short mysql version tag resolved through a compiled-in alias table,
    /// e.g. "5.7"
    #[serde(rename = "mysqlVersion", default)]
    pub mysql_version: String,
    #[serde(rename = "mysql", default)]
    pub mysql: MysqlOpts,
    #[serde(rename = "xenon", default)]
    pub xenon: XenonOpts,
    #[serde(rename = "metrics", default)]
    pub metrics: MetricsOpts,
    #[serde(rename = "pod", default)]
    pub pod: PodPolicy,
    #[serde(rename = "persistence", default)]
    pub persistence: Persistence,
}

// -----------------------------------------------------------------------------
// ConditionStatus enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Default for ConditionStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Display for ConditionStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

// -----------------------------------------------------------------------------
// ClusterState enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ClusterState {
    Initializing,
    Ready,
    Error,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::Initializing
    }
}

// -----------------------------------------------------------------------------
// ClusterConditionType enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ClusterConditionType {
    Initializing,
    Ready,
    Error,
}

// -----------------------------------------------------------------------------
// ClusterCondition structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub r#type: ClusterConditionType,
    #[serde(rename = "status")]
    pub status: ConditionStatus,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: Time,
    #[serde(rename = "reason", default)]
    pub reason: String,
    #[serde(rename = "message", default)]
    pub message: String,
}

impl ClusterCondition {
    pub fn new(r#type: ClusterConditionType, status: ConditionStatus) -> Self {
        Self {
            r#type,
            status,
            last_transition_time: Time(Utc::now()),
            reason: String::new(),
            message: String::new(),
        }
    }
}

// -----------------------------------------------------------------------------
// NodeConditionType enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum NodeConditionType {
    Lagged,
    Leader,
    ReadOnly,
    Replicating,
}

/// wire order of the per-node condition vector, indices are positional and
/// never re-ordered
pub const NODE_CONDITION_ORDER: [NodeConditionType; 4] = [
    NodeConditionType::Lagged,
    NodeConditionType::Leader,
    NodeConditionType::ReadOnly,
    NodeConditionType::Replicating,
];

impl NodeConditionType {
    pub const fn index(self) -> usize {
        match self {
            Self::Lagged => 0,
            Self::Leader => 1,
            Self::ReadOnly => 2,
            Self::Replicating => 3,
        }
    }
}

// -----------------------------------------------------------------------------
// NodeCondition structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub r#type: NodeConditionType,
    #[serde(rename = "status")]
    pub status: ConditionStatus,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: Time,
}

// -----------------------------------------------------------------------------
// NodeStatus structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct NodeStatus {
    /// Fully qualified host of the observed pod,
    /// `<pod>.<service>.<namespace>`
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "message", default)]
    pub message: String,
    #[serde(rename = "conditions")]
    pub conditions: Vec<NodeCondition>,
}

impl NodeStatus {
    pub fn new(name: String) -> Self {
        let now = Time(Utc::now());

        Self {
            name,
            message: String::new(),
            conditions: NODE_CONDITION_ORDER
                .iter()
                .map(|r#type| NodeCondition {
                    r#type: *r#type,
                    status: ConditionStatus::Unknown,
                    last_transition_time: now.to_owned(),
                })
                .collect(),
        }
    }

    pub fn condition(&self, r#type: NodeConditionType) -> ConditionStatus {
        self.conditions[r#type.index()].status
    }

    /// update the condition at its positional index, touching the transition
    /// time only when the value actually changes
    pub fn set_condition(&mut self, r#type: NodeConditionType, status: ConditionStatus) {
        let condition = &mut self.conditions[r#type.index()];
        if condition.status != status {
            condition.status = status;
            condition.last_transition_time = Time(Utc::now());
        }
    }
}

// -----------------------------------------------------------------------------
// ClusterStatus structure

pub const MAX_STATUSES_QUANTITY: usize = 10;

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct ClusterStatus {
    #[serde(rename = "state", default)]
    pub state: ClusterState,
    /// Number of pods whose containers-ready condition is true
    #[serde(rename = "readyNodes", default)]
    pub ready_nodes: i32,
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<ClusterCondition>,
    #[serde(rename = "nodes", default)]
    pub nodes: Vec<NodeStatus>,
}

impl ClusterStatus {
    /// append the condition unless the last recorded entry already carries
    /// its type, then truncate the history to the most recent entries
    pub fn push_condition(&mut self, condition: ClusterCondition) {
        match self.conditions.last() {
            Some(last) if last.r#type == condition.r#type => {}
            _ => self.conditions.push(condition),
        }

        if self.conditions.len() > MAX_STATUSES_QUANTITY {
            let skip = self.conditions.len() - MAX_STATUSES_QUANTITY;
            self.conditions.drain(..skip);
        }
    }

    /// resolve the node status entry for the given host, appending a fresh
    /// entry on first sight. Entries are append-only for the lifetime of the
    /// cluster
    pub fn node_index(&mut self, name: &str) -> usize {
        if let Some(index) = self.nodes.iter().position(|node| node.name == name) {
            return index;
        }

        self.nodes.push(NodeStatus::new(name.to_string()));
        self.nodes.len() - 1
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_are_bounded_and_deduplicated() {
        let mut status = ClusterStatus::default();
        let sequence = [
            ClusterConditionType::Initializing,
            ClusterConditionType::Initializing,
            ClusterConditionType::Ready,
            ClusterConditionType::Ready,
            ClusterConditionType::Error,
            ClusterConditionType::Ready,
        ];

        for r#type in sequence {
            status.push_condition(ClusterCondition::new(r#type, ConditionStatus::True));
        }

        let recorded = status
            .conditions
            .iter()
            .map(|condition| condition.r#type)
            .collect::<Vec<_>>();

        assert_eq!(
            recorded,
            vec![
                ClusterConditionType::Initializing,
                ClusterConditionType::Ready,
                ClusterConditionType::Error,
                ClusterConditionType::Ready,
            ]
        );

        for _ in 0..20 {
            status.push_condition(ClusterCondition::new(
                ClusterConditionType::Error,
                ConditionStatus::True,
            ));
            status.push_condition(ClusterCondition::new(
                ClusterConditionType::Ready,
                ConditionStatus::True,
            ));
        }

        assert_eq!(status.conditions.len(), MAX_STATUSES_QUANTITY);
        for window in status.conditions.windows(2) {
            assert_ne!(window[0].r#type, window[1].r#type);
        }
    }

    #[test]
    fn node_conditions_keep_their_positional_order() {
        let node = NodeStatus::new("demo-mysql-0.demo-mysql.ns1".to_string());

        assert_eq!(node.conditions.len(), 4);
        assert_eq!(node.conditions[0].r#type, NodeConditionType::Lagged);
        assert_eq!(node.conditions[1].r#type, NodeConditionType::Leader);
        assert_eq!(node.conditions[2].r#type, NodeConditionType::ReadOnly);
        assert_eq!(node.conditions[3].r#type, NodeConditionType::Replicating);

        for r#type in NODE_CONDITION_ORDER {
            assert_eq!(node.conditions[r#type.index()].r#type, r#type);
        }
    }

    #[test]
    fn node_condition_transition_time_moves_only_on_change() {
        let mut node = NodeStatus::new("demo-mysql-0.demo-mysql.ns1".to_string());

        node.set_condition(NodeConditionType::Leader, ConditionStatus::True);
        let stamped = node.conditions[NodeConditionType::Leader.index()]
            .last_transition_time
            .to_owned();

        node.set_condition(NodeConditionType::Leader, ConditionStatus::True);
        assert_eq!(
            node.conditions[NodeConditionType::Leader.index()].last_transition_time,
            stamped
        );
    }

    #[test]
    fn node_entries_are_appended_once() {
        let mut status = ClusterStatus::default();

        let first = status.node_index("demo-mysql-0.demo-mysql.ns1");
        let second = status.node_index("demo-mysql-1.demo-mysql.ns1");
        let again = status.node_index("demo-mysql-0.demo-mysql.ns1");

        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(again, 0);
        assert_eq!(status.nodes.len(), 2);
    }
}

//! # Cluster module
//!
//! This module provides the deterministic naming, labelling and addressing
//! derived from a mysql cluster object, together with the builders producing
//! the desired shape of every child resource

use std::collections::BTreeMap;

use kube::ResourceExt;
use semver::Version;

use crate::svc::crd::cluster::MysqlCluster;

pub mod builder;
pub mod reconciler;
pub mod xenon;

// -----------------------------------------------------------------------------
// Ports

pub const MYSQL_PORT_NAME: &str = "mysql";
pub const MYSQL_PORT: i32 = 3306;

pub const METRICS_PORT_NAME: &str = "metrics";
pub const METRICS_PORT: i32 = 9104;

pub const XENON_PORT_NAME: &str = "xenon";
pub const XENON_PORT: i32 = 8801;

// -----------------------------------------------------------------------------
// Container names

pub const CONTAINER_INIT_MYSQL: &str = "init-mysql";
pub const CONTAINER_MYSQL: &str = "mysql";
pub const CONTAINER_XENON: &str = "xenon";
pub const CONTAINER_METRICS: &str = "metrics";
pub const CONTAINER_SLOWLOG: &str = "slowlog";
pub const CONTAINER_AUDITLOG: &str = "auditlog";

// -----------------------------------------------------------------------------
// Volume names

pub const CONF_VOLUME: &str = "conf";
pub const CONF_MAP_VOLUME: &str = "config-map";
pub const SCRIPTS_VOLUME: &str = "scripts";
pub const LOGS_VOLUME: &str = "logs";
pub const DATA_VOLUME: &str = "data";
pub const XENON_VOLUME: &str = "xenon";
pub const INIT_FILE_VOLUME: &str = "init-file";
pub const SYS_VOLUME: &str = "host-sys";

// -----------------------------------------------------------------------------
// Defaults

pub const DEFAULT_REPLICAS: i32 = 3;
pub const DEFAULT_MYSQL_VERSION_TAG: &str = "5.7";
pub const DEFAULT_MYSQL_USER: &str = "qc_usr";
pub const DEFAULT_MYSQL_USER_PASSWORD: &str = "Qing@123";
pub const DEFAULT_DATABASE: &str = "qingcloud";
pub const DEFAULT_REPLICATION_USER: &str = "qc_repl";
pub const DEFAULT_METRICS_USER: &str = "qc_metrics";
pub const DEFAULT_HEARBEAT_COUNT: i32 = 5;
pub const DEFAULT_ELECTION_TIMEOUT: i32 = 10000;
pub const DEFAULT_XENON_IMAGE: &str = "radondb/xenon:1.1.5-alpha";
pub const DEFAULT_METRICS_IMAGE: &str = "prom/mysqld-exporter:v0.12.1";
pub const DEFAULT_SIDECAR_IMAGE: &str = "radondb/mysql-sidecar:v1.0";
pub const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";
pub const DEFAULT_PERSISTENCE_SIZE: &str = "10Gi";

/// version every unknown tag falls back to
pub const MYSQL_DEFAULT_VERSION: &str = "5.7.33";

/// simple tag to full semantic version alias table
pub const MYSQL_TAGS_TO_SEMVER: [(&str, &str); 1] = [("5.7", "5.7.33")];

/// supported mysql versions and their images
pub const MYSQL_IMAGE_VERSIONS: [(&str, &str); 1] = [("5.7.33", "kryptondb/percona:5.7.33")];

// -----------------------------------------------------------------------------
// Labels

pub const MANAGED_BY: &str = "mysql.radondb.io";

pub const LABEL_CLUSTER: &str = "mysql.radondb.io/cluster";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_VERSION: &str = "app.kubernetes.io/version";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// label mirrored on every pod from the health observer verdict
pub const LABEL_HEALTHY: &str = "healthy";
/// label patched by the raft leader start and stop hooks
pub const LABEL_ROLE: &str = "role";

// -----------------------------------------------------------------------------
// ResourceName enumeration

/// aliases of the child resources derived from a cluster
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ResourceName {
    /// the ordered pod set
    StatefulSet,
    /// the configuration artifact mounted in every pod
    ConfigMap,
    /// the anonymous pod-discovery service
    HeadlessService,
    /// the service routing to the raft leader
    LeaderService,
    /// the service routing to the followers
    FollowerService,
    /// the identity store holding operator credentials
    Secret,
    /// the scoped permission role
    Role,
    /// the binding of the role onto the pod service account
    RoleBinding,
}

// -----------------------------------------------------------------------------
// Naming and labelling helpers

/// returns the name of a child resource for the given cluster name
pub fn name_for_resource(name: ResourceName, cluster_name: &str) -> String {
    match name {
        ResourceName::StatefulSet | ResourceName::ConfigMap | ResourceName::HeadlessService => {
            format!("{}-mysql", cluster_name)
        }
        ResourceName::LeaderService => format!("{}-leader", cluster_name),
        ResourceName::FollowerService => format!("{}-follower", cluster_name),
        ResourceName::Secret => format!("{}-secret", cluster_name),
        ResourceName::Role => format!("{}-role", cluster_name),
        ResourceName::RoleBinding => format!("{}-rolebinding", cluster_name),
    }
}

/// returns the resolved full mysql version of the cluster, falling back to
/// the compiled-in default for unknown tags
pub fn mysql_version(cluster: &MysqlCluster) -> String {
    MYSQL_TAGS_TO_SEMVER
        .iter()
        .find(|(tag, _)| *tag == cluster.spec.mysql_version)
        .map(|(_, version)| version.to_string())
        .unwrap_or_else(|| MYSQL_DEFAULT_VERSION.to_string())
}

/// returns the resolved mysql version as a semantic version
pub fn mysql_semver(cluster: &MysqlCluster) -> Version {
    Version::parse(&mysql_version(cluster))
        .unwrap_or_else(|_| Version::parse(MYSQL_DEFAULT_VERSION).expect("default mysql version to be a valid semver"))
}

/// returns the image running the mysql server container
pub fn mysql_image(cluster: &MysqlCluster) -> String {
    let version = mysql_version(cluster);

    MYSQL_IMAGE_VERSIONS
        .iter()
        .find(|(v, _)| *v == version)
        .map(|(_, image)| image.to_string())
        .unwrap_or_else(|| format!("percona:{}", version))
}

/// returns the labels carried by every child resource of the cluster
pub fn labels(cluster: &MysqlCluster) -> BTreeMap<String, String> {
    let name = cluster.name_any();
    let annotations = cluster.annotations();

    let instance = annotations
        .get(LABEL_INSTANCE)
        .cloned()
        .unwrap_or_else(|| name.to_owned());
    let component = annotations
        .get(LABEL_COMPONENT)
        .cloned()
        .unwrap_or_else(|| "database".to_string());

    let mut labels = BTreeMap::from([
        (LABEL_CLUSTER.to_string(), name),
        (LABEL_NAME.to_string(), "mysql".to_string()),
        (LABEL_INSTANCE.to_string(), instance),
        (LABEL_VERSION.to_string(), mysql_version(cluster)),
        (LABEL_COMPONENT.to_string(), component),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ]);

    if let Some(part_of) = annotations.get(LABEL_PART_OF) {
        labels.insert(LABEL_PART_OF.to_string(), part_of.to_owned());
    }

    labels
}

/// returns the strict subset of [`labels`] used as pod selector
pub fn selector_labels(cluster: &MysqlCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.name_any()),
        (LABEL_NAME.to_string(), "mysql".to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

/// returns the selector labels as a kubernetes list selector string
pub fn selector(cluster: &MysqlCluster) -> String {
    selector_labels(cluster)
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

/// returns the stable fully qualified host of the pod at the given ordinal,
/// `<cluster>-mysql-<i>.<cluster>-mysql.<namespace>`
pub fn pod_hostname(cluster_name: &str, namespace: &str, ordinal: i32) -> String {
    let service = name_for_resource(ResourceName::StatefulSet, cluster_name);

    format!("{}-{}.{}.{}", service, ordinal, service, namespace)
}

/// returns the ordered comma separated peer list handed to the raft
/// supervisor cluster-add command
pub fn xenon_peers(cluster_name: &str, namespace: &str, replicas: i32) -> String {
    (0..replicas)
        .map(|ordinal| format!("{}:{}", pod_hostname(cluster_name, namespace, ordinal), XENON_PORT))
        .collect::<Vec<_>>()
        .join(",")
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use kube::core::ObjectMeta;

    use super::*;

    fn cluster() -> MysqlCluster {
        let mut cluster = MysqlCluster::new("demo", Default::default());
        cluster.metadata.namespace = Some("ns1".to_string());
        cluster.spec.mysql_version = "5.7".to_string();
        cluster
    }

    #[test]
    fn child_resources_are_named_deterministically() {
        assert_eq!(name_for_resource(ResourceName::StatefulSet, "demo"), "demo-mysql");
        assert_eq!(name_for_resource(ResourceName::ConfigMap, "demo"), "demo-mysql");
        assert_eq!(name_for_resource(ResourceName::HeadlessService, "demo"), "demo-mysql");
        assert_eq!(name_for_resource(ResourceName::LeaderService, "demo"), "demo-leader");
        assert_eq!(name_for_resource(ResourceName::FollowerService, "demo"), "demo-follower");
        assert_eq!(name_for_resource(ResourceName::Secret, "demo"), "demo-secret");
        assert_eq!(name_for_resource(ResourceName::Role, "demo"), "demo-role");
        assert_eq!(name_for_resource(ResourceName::RoleBinding, "demo"), "demo-rolebinding");
    }

    #[test]
    fn unknown_version_tags_fall_back_to_the_default() {
        let mut cluster = cluster();
        cluster.spec.mysql_version = "4.0".to_string();

        assert_eq!(mysql_version(&cluster), MYSQL_DEFAULT_VERSION);
    }

    #[test]
    fn labels_cover_the_selector_subset() {
        let cluster = cluster();
        let labels = labels(&cluster);
        let selector = selector_labels(&cluster);

        assert_eq!(labels.get(LABEL_CLUSTER).map(String::as_str), Some("demo"));
        assert_eq!(labels.get(LABEL_NAME).map(String::as_str), Some("mysql"));
        assert_eq!(labels.get(LABEL_INSTANCE).map(String::as_str), Some("demo"));
        assert_eq!(labels.get(LABEL_VERSION).map(String::as_str), Some("5.7.33"));
        assert_eq!(labels.get(LABEL_COMPONENT).map(String::as_str), Some("database"));
        assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some(MANAGED_BY));

        for (key, value) in &selector {
            assert_eq!(labels.get(key), Some(value));
        }
        assert_eq!(selector.len(), 3);
    }

    #[test]
    fn annotations_override_instance_and_component() {
        let mut cluster = cluster();
        cluster.metadata = ObjectMeta {
            name: Some("demo".to_string()),
            namespace: Some("ns1".to_string()),
            annotations: Some(
                [
                    (LABEL_INSTANCE.to_string(), "shop".to_string()),
                    (LABEL_COMPONENT.to_string(), "backend".to_string()),
                    (LABEL_PART_OF.to_string(), "commerce".to_string()),
                ]
                .into(),
            ),
            ..Default::default()
        };

        let labels = labels(&cluster);
        assert_eq!(labels.get(LABEL_INSTANCE).map(String::as_str), Some("shop"));
        assert_eq!(labels.get(LABEL_COMPONENT).map(String::as_str), Some("backend"));
        assert_eq!(labels.get(LABEL_PART_OF).map(String::as_str), Some("commerce"));
    }

    #[test]
    fn peer_list_is_ordered_and_fully_qualified() {
        assert_eq!(
            xenon_peers("demo", "ns1", 3),
            "demo-mysql-0.demo-mysql.ns1:8801,demo-mysql-1.demo-mysql.ns1:8801,demo-mysql-2.demo-mysql.ns1:8801"
        );
        assert_eq!(xenon_peers("demo", "ns1", 0), "");
    }

    #[test]
    fn pod_hostnames_are_bit_exact() {
        assert_eq!(pod_hostname("demo", "ns1", 2), "demo-mysql-2.demo-mysql.ns1");
    }
}

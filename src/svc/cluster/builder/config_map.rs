//! # Configuration artifact builder
//!
//! This module provides the builder of the config map mounted in every pod,
//! carrying the generated node.cnf, the raft supervisor configuration
//! template and the leader election hooks

use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::util::intstr::IntOrString};
use kube::ResourceExt;

use crate::svc::{
    cluster::{
        self,
        builder::Error,
        xenon::{
            XenonTemplate, HOSTNAME_PLACEHOLDER, REPL_PASSWD_PLACEHOLDER, REPL_USER_PLACEHOLDER,
            ROOT_PASSWD_PLACEHOLDER,
        },
        ResourceName, DEFAULT_ELECTION_TIMEOUT, DEFAULT_HEARBEAT_COUNT, LABEL_ROLE,
    },
    crd::cluster::MysqlCluster,
};

// -----------------------------------------------------------------------------
// Variables

/// options every node.cnf starts from, overridable by the user
const MYSQL_COMMON_CONFIGS: &[(&str, &str)] = &[
    ("character_set_server", "utf8mb4"),
    ("interactive_timeout", "3600"),
    ("default-time-zone", "+08:00"),
    ("expire_logs_days", "7"),
    ("key_buffer_size", "33554432"),
    ("log_bin_trust_function_creators", "1"),
    ("long_query_time", "3"),
    ("binlog_cache_size", "32768"),
    ("binlog_stmt_cache_size", "32768"),
    ("max_connections", "1024"),
    ("max_connect_errors", "655360"),
    ("query_cache_size", "0"),
    ("sync_master_info", "1000"),
    ("sync_relay_log", "1000"),
    ("sync_relay_log_info", "1000"),
    ("table_open_cache", "2000"),
    ("thread_cache_size", "128"),
    ("wait_timeout", "3600"),
    ("group_concat_max_len", "1024"),
    ("slave_rows_search_algorithms", "INDEX_SCAN,HASH_SCAN"),
    ("max_allowed_packet", "1073741824"),
    ("event_scheduler", "OFF"),
    ("innodb_print_all_deadlocks", "0"),
    ("autocommit", "1"),
    ("transaction-isolation", "READ-COMMITTED"),
    ("audit_log_policy", "NONE"),
    ("audit_log_rotate_on_size", "104857600"),
    ("audit_log_rotations", "6"),
    ("validate_password_policy", "MEDIUM"),
    ("validate_password_length", "8"),
    ("connection_control_failed_connections_threshold", "3"),
    ("connection_control_min_connection_delay", "1000"),
    ("connection_control_max_connection_delay", "2147483647"),
    ("explicit_defaults_for_timestamp", "0"),
    ("innodb_adaptive_hash_index", "0"),
];

/// options pinned by the operator, applied over the common layer
const MYSQL_STATIC_CONFIGS: &[(&str, &str)] = &[
    ("audit_log_format", "OLD"),
    ("default-storage-engine", "InnoDB"),
    ("back_log", "2048"),
    ("ft_min_word_len", "4"),
    ("lower_case_table_names", "0"),
    ("query_cache_type", "OFF"),
    ("innodb_ft_max_token_size", "84"),
    ("innodb_ft_min_token_size", "3"),
    ("sql_mode", "STRICT_TRANS_TABLES,NO_ENGINE_SUBSTITUTION"),
    ("slave_parallel_workers", "8"),
    ("slave_pending_jobs_size_max", "1073741824"),
    ("innodb_log_buffer_size", "16777216"),
    ("innodb_log_file_size", "1073741824"),
    ("innodb_log_files_in_group", "2"),
    ("innodb_flush_method", "O_DIRECT"),
    ("innodb_use_native_aio", "1"),
    ("innodb_autoinc_lock_mode", "2"),
    ("performance_schema", "1"),
];

// -----------------------------------------------------------------------------
// Builder

/// converge the configuration artifact of the cluster
pub fn mutate(cluster: &MysqlCluster, config_map: &mut ConfigMap) -> Result<(), Error> {
    let namespace = cluster
        .namespace()
        .expect("cluster to be owned by a namespace");

    config_map.metadata.labels = Some(cluster::labels(cluster));

    let data = config_map.data.get_or_insert_with(Default::default);

    data.insert("node.cnf".to_string(), build_mysql_conf(cluster));
    data.insert("xenon.json".to_string(), build_xenon_conf(cluster, &namespace));
    data.insert(
        "leader-start.sh".to_string(),
        role_patch_script(&namespace, "leader"),
    );
    data.insert(
        "leader-stop.sh".to_string(),
        role_patch_script(&namespace, "follower"),
    );

    Ok(())
}

/// render the `[mysqld]` section of node.cnf, union of the common layer, the
/// static layer and the user options, later layers overriding earlier ones.
/// Keys are sorted for reproducibility
pub fn build_mysql_conf(cluster: &MysqlCluster) -> String {
    let mut options: BTreeMap<String, String> = BTreeMap::new();

    for (key, value) in MYSQL_COMMON_CONFIGS {
        options.insert(key.to_string(), value.to_string());
    }

    for (key, value) in MYSQL_STATIC_CONFIGS {
        options.insert(key.to_string(), value.to_string());
    }

    if cluster.spec.mysql.init_tokudb {
        options.insert("loose_tokudb_directio".to_string(), "ON".to_string());
    }

    for (key, value) in &cluster.spec.mysql.conf {
        let value = match value {
            IntOrString::Int(int) => int.to_string(),
            IntOrString::String(string) => string.to_owned(),
        };
        options.insert(key.to_owned(), value);
    }

    let mut conf = String::from("[mysqld]\n");
    for (key, value) in &options {
        conf.push_str(&format!("{}={}\n", key, value));
    }

    conf
}

/// render the raft supervisor configuration template with credential
/// placeholders, substituted in-pod by the bootstrap agent
fn build_xenon_conf(cluster: &MysqlCluster, namespace: &str) -> String {
    let host = format!(
        "{}.{}.{}",
        HOSTNAME_PLACEHOLDER,
        cluster::name_for_resource(ResourceName::HeadlessService, &cluster.name_any()),
        namespace
    );

    XenonTemplate {
        host: &host,
        replication_user: REPL_USER_PLACEHOLDER,
        replication_password: REPL_PASSWD_PLACEHOLDER,
        root_password: ROOT_PASSWD_PLACEHOLDER,
        mysql_version: &cluster::mysql_semver(cluster),
        admit_defeat_hearbeat_count: cluster
            .spec
            .xenon
            .admit_defeat_hearbeat_count
            .unwrap_or(DEFAULT_HEARBEAT_COUNT),
        election_timeout: cluster
            .spec
            .xenon
            .election_timeout
            .unwrap_or(DEFAULT_ELECTION_TIMEOUT),
        init_tokudb: cluster.spec.mysql.init_tokudb,
    }
    .render()
}

/// render the hook invoked by the raft supervisor on a role change, patching
/// the pod role label through the api server with the pod service account
fn role_patch_script(namespace: &str, role: &str) -> String {
    format!(
        r#"#!/bin/sh
token=/var/run/secrets/kubernetes.io/serviceaccount/token
cacert=/var/run/secrets/kubernetes.io/serviceaccount/ca.crt
url="https://$KUBERNETES_SERVICE_HOST:$KUBERNETES_SERVICE_PORT/api/v1/namespaces/{namespace}/pods/$HOSTNAME"
until [ "$(curl -s -o /dev/null -w '%{{http_code}}' -X PATCH \
    --cacert $cacert \
    -H "Authorization: Bearer $(cat $token)" \
    -H 'Content-Type: application/json-patch+json' \
    "$url" \
    -d '[{{"op": "add", "path": "/metadata/labels/{label}", "value": "{role}"}}]')" = "200" ]; do
    sleep 2
done
"#,
        namespace = namespace,
        label = LABEL_ROLE,
        role = role,
    )
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> MysqlCluster {
        let mut cluster = MysqlCluster::new("demo", Default::default());
        cluster.metadata.namespace = Some("ns1".to_string());
        cluster
    }

    #[test]
    fn node_cnf_is_a_sorted_mysqld_section() {
        let conf = build_mysql_conf(&cluster());
        let mut lines = conf.lines();

        assert_eq!(lines.next(), Some("[mysqld]"));

        let keys = lines
            .map(|line| line.split('=').next().unwrap().to_string())
            .collect::<Vec<_>>();
        let mut sorted = keys.to_owned();
        sorted.sort();
        assert_eq!(keys, sorted);

        assert!(conf.contains("character_set_server=utf8mb4\n"));
        assert!(conf.contains("sql_mode=STRICT_TRANS_TABLES,NO_ENGINE_SUBSTITUTION\n"));
        assert!(!conf.contains("loose_tokudb_directio"));
    }

    #[test]
    fn user_options_override_the_compiled_layers() {
        let mut cluster = cluster();
        cluster
            .spec
            .mysql
            .conf
            .insert("max_connections".to_string(), IntOrString::Int(512));

        let conf = build_mysql_conf(&cluster);
        assert!(conf.contains("max_connections=512\n"));
        assert!(!conf.contains("max_connections=1024\n"));
    }

    #[test]
    fn tokudb_appends_the_directio_flag() {
        let mut cluster = cluster();
        cluster.spec.mysql.init_tokudb = true;

        assert!(build_mysql_conf(&cluster).contains("loose_tokudb_directio=ON\n"));
    }

    #[test]
    fn artifact_carries_the_supervisor_template_with_placeholders() {
        let mut config_map = ConfigMap::default();
        mutate(&cluster(), &mut config_map).unwrap();

        let data = config_map.data.unwrap();
        assert!(data.contains_key("node.cnf"));
        assert!(data.contains_key("leader-start.sh"));
        assert!(data.contains_key("leader-stop.sh"));

        let xenon = &data["xenon.json"];
        assert!(xenon.contains(REPL_USER_PLACEHOLDER));
        assert!(xenon.contains(REPL_PASSWD_PLACEHOLDER));
        assert!(xenon.contains(ROOT_PASSWD_PLACEHOLDER));
        assert!(xenon.contains("@@HOSTNAME@@.demo-mysql.ns1:8801"));
    }

    #[test]
    fn role_hooks_patch_the_pod_role_label() {
        let start = role_patch_script("ns1", "leader");
        assert!(start.contains("/api/v1/namespaces/ns1/pods/$HOSTNAME"));
        assert!(start.contains(r#""value": "leader""#));

        let stop = role_patch_script("ns1", "follower");
        assert!(stop.contains(r#""value": "follower""#));
    }
}

//! # Container recipes
//!
//! This module provides the dispatcher yielding the shape of every container
//! of the workload set by name

use k8s_openapi::{
    api::core::v1::{
        Container, ContainerPort, ExecAction, HTTPGetAction, Lifecycle, LifecycleHandler, Probe,
        VolumeMount,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;

use crate::svc::{
    cluster::{
        self,
        builder::{env_from_field, env_from_secret, env_value, secret, Error},
        ResourceName, CONF_MAP_VOLUME, CONF_VOLUME, CONTAINER_AUDITLOG, CONTAINER_INIT_MYSQL,
        CONTAINER_METRICS, CONTAINER_MYSQL, CONTAINER_SLOWLOG, CONTAINER_XENON, DATA_VOLUME,
        DEFAULT_ELECTION_TIMEOUT, DEFAULT_HEARBEAT_COUNT, DEFAULT_REPLICAS, INIT_FILE_VOLUME,
        LOGS_VOLUME, METRICS_PORT, METRICS_PORT_NAME, MYSQL_PORT, MYSQL_PORT_NAME, SCRIPTS_VOLUME,
        SYS_VOLUME, XENON_PORT, XENON_PORT_NAME, XENON_VOLUME,
    },
    crd::cluster::MysqlCluster,
};

// -----------------------------------------------------------------------------
// Mount paths

pub const CONF_VOLUME_MOUNT_PATH: &str = "/mnt/conf.d";
pub const CONF_MAP_VOLUME_MOUNT_PATH: &str = "/mnt/config-map";
pub const SCRIPTS_VOLUME_MOUNT_PATH: &str = "/mnt/scripts";
pub const XENON_VOLUME_MOUNT_PATH: &str = "/mnt/xenon";
pub const INIT_FILE_VOLUME_MOUNT_PATH: &str = "/mnt/init-file";
pub const SYS_VOLUME_MOUNT_PATH: &str = "/host-sys";
pub const DATA_VOLUME_MOUNT_PATH: &str = "/var/lib/mysql";
pub const LOGS_VOLUME_MOUNT_PATH: &str = "/var/log/mysql";

const MYSQL_CONF_MOUNT_PATH: &str = "/etc/mysql/conf.d";
const INIT_DB_MOUNT_PATH: &str = "/docker-entrypoint-initdb.d";
const XENON_CONF_MOUNT_PATH: &str = "/etc/xenon";
const XENON_SCRIPTS_MOUNT_PATH: &str = "/scripts";

// -----------------------------------------------------------------------------
// Dispatcher

/// returns the shape of the container registered under the given name.
///
/// An unknown name is a programmer error, it aborts the reconcile without
/// crashing the process
pub fn ensure_container(name: &str, cluster: &MysqlCluster) -> Result<Container, Error> {
    let mut container = match name {
        CONTAINER_INIT_MYSQL => init_mysql(cluster),
        CONTAINER_MYSQL => mysql(cluster),
        CONTAINER_XENON => xenon(cluster),
        CONTAINER_METRICS => metrics(cluster),
        CONTAINER_SLOWLOG => slowlog(cluster),
        CONTAINER_AUDITLOG => auditlog(cluster),
        _ => return Err(Error::UnknownContainer(name.to_string())),
    };

    container.name = name.to_string();
    container.image_pull_policy = Some(cluster.spec.pod.image_pull_policy.to_owned());

    Ok(container)
}

// -----------------------------------------------------------------------------
// Recipes

fn init_mysql(cluster: &MysqlCluster) -> Container {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .expect("cluster to be owned by a namespace");
    let secret_name = cluster::name_for_resource(ResourceName::Secret, &name);

    let mut env = vec![
        env_from_field("POD_HOSTNAME", "metadata.name"),
        env_value("NAMESPACE", &namespace),
        env_value(
            "SERVICE_NAME",
            &cluster::name_for_resource(ResourceName::HeadlessService, &name),
        ),
        env_value(
            "ADMIT_DEFEAT_HEARBEAT_COUNT",
            &cluster
                .spec
                .xenon
                .admit_defeat_hearbeat_count
                .unwrap_or(DEFAULT_HEARBEAT_COUNT)
                .to_string(),
        ),
        env_value(
            "ELECTION_TIMEOUT",
            &cluster
                .spec
                .xenon
                .election_timeout
                .unwrap_or(DEFAULT_ELECTION_TIMEOUT)
                .to_string(),
        ),
        env_value("MYSQL_VERSION", &cluster::mysql_version(cluster)),
        env_from_secret(
            &secret_name,
            "MYSQL_ROOT_PASSWORD",
            secret::ROOT_PASSWORD_KEY,
            false,
        ),
        env_from_secret(
            &secret_name,
            "MYSQL_REPL_USER",
            secret::REPLICATION_USER_KEY,
            true,
        ),
        env_from_secret(
            &secret_name,
            "MYSQL_REPL_PASSWORD",
            secret::REPLICATION_PASSWORD_KEY,
            true,
        ),
    ];

    if cluster.spec.metrics.enabled {
        env.push(env_from_secret(
            &secret_name,
            "METRICS_USER",
            secret::METRICS_USER_KEY,
            true,
        ));
        env.push(env_from_secret(
            &secret_name,
            "METRICS_PASSWORD",
            secret::METRICS_PASSWORD_KEY,
            true,
        ));
    }

    if cluster.spec.mysql.init_tokudb {
        env.push(env_value("INIT_TOKUDB", "1"));
    }

    let mut volume_mounts = vec![
        mount(CONF_VOLUME, CONF_VOLUME_MOUNT_PATH),
        mount(CONF_MAP_VOLUME, CONF_MAP_VOLUME_MOUNT_PATH),
        mount(SCRIPTS_VOLUME, SCRIPTS_VOLUME_MOUNT_PATH),
        mount(XENON_VOLUME, XENON_VOLUME_MOUNT_PATH),
        mount(INIT_FILE_VOLUME, INIT_FILE_VOLUME_MOUNT_PATH),
    ];

    if cluster.spec.mysql.init_tokudb {
        volume_mounts.push(mount(SYS_VOLUME, SYS_VOLUME_MOUNT_PATH));
    }

    if cluster.spec.persistence.enabled {
        volume_mounts.push(mount(DATA_VOLUME, DATA_VOLUME_MOUNT_PATH));
    }

    Container {
        image: Some(cluster.spec.pod.sidecar_image.to_owned()),
        command: Some(vec!["sidecar".to_string(), "init".to_string()]),
        env: Some(env),
        resources: Some(cluster.spec.pod.resources.to_owned()),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

fn mysql(cluster: &MysqlCluster) -> Container {
    let secret_name = cluster::name_for_resource(ResourceName::Secret, &cluster.name_any());

    let mut env = vec![
        env_from_secret(
            &secret_name,
            "MYSQL_ROOT_PASSWORD",
            secret::ROOT_PASSWORD_KEY,
            false,
        ),
        env_from_secret(
            &secret_name,
            "MYSQL_REPL_USER",
            secret::REPLICATION_USER_KEY,
            true,
        ),
        env_from_secret(
            &secret_name,
            "MYSQL_REPL_PASSWORD",
            secret::REPLICATION_PASSWORD_KEY,
            true,
        ),
        env_from_secret(&secret_name, "MYSQL_USER", secret::MYSQL_USER_KEY, true),
        env_from_secret(
            &secret_name,
            "MYSQL_PASSWORD",
            secret::MYSQL_PASSWORD_KEY,
            true,
        ),
        env_from_secret(
            &secret_name,
            "MYSQL_DATABASE",
            secret::MYSQL_DATABASE_KEY,
            true,
        ),
    ];

    if cluster.spec.mysql.init_tokudb {
        env.push(env_value("INIT_TOKUDB", "1"));
    }

    Container {
        image: Some(cluster::mysql_image(cluster)),
        env: Some(env),
        resources: Some(cluster.spec.mysql.resources.to_owned()),
        ports: Some(vec![ContainerPort {
            name: Some(MYSQL_PORT_NAME.to_string()),
            container_port: MYSQL_PORT,
            ..Default::default()
        }]),
        liveness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "mysqladmin ping -uroot -p${MYSQL_ROOT_PASSWORD}".to_string(),
                ]),
            }),
            initial_delay_seconds: Some(30),
            timeout_seconds: Some(5),
            period_seconds: Some(10),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    r#"mysql -uroot -p${MYSQL_ROOT_PASSWORD} -e "SELECT 1""#.to_string(),
                ]),
            }),
            initial_delay_seconds: Some(10),
            timeout_seconds: Some(1),
            period_seconds: Some(10),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            mount(CONF_VOLUME, MYSQL_CONF_MOUNT_PATH),
            mount(DATA_VOLUME, DATA_VOLUME_MOUNT_PATH),
            mount(LOGS_VOLUME, LOGS_VOLUME_MOUNT_PATH),
            mount(INIT_FILE_VOLUME, INIT_DB_MOUNT_PATH),
        ]),
        ..Default::default()
    }
}

fn xenon(cluster: &MysqlCluster) -> Container {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .expect("cluster to be owned by a namespace");
    let secret_name = cluster::name_for_resource(ResourceName::Secret, &name);
    let replicas = cluster.spec.replicas.unwrap_or(DEFAULT_REPLICAS);

    let (master_sysvars, slave_sysvars) = if cluster.spec.mysql.init_tokudb {
        (
            "tokudb_fsync_log_period=default;sync_binlog=default;innodb_flush_log_at_trx_commit=default",
            "tokudb_fsync_log_period=1000;sync_binlog=1000;innodb_flush_log_at_trx_commit=1",
        )
    } else {
        (
            "sync_binlog=default;innodb_flush_log_at_trx_commit=default",
            "sync_binlog=1000;innodb_flush_log_at_trx_commit=1",
        )
    };

    let env = vec![
        env_from_secret(
            &secret_name,
            "MYSQL_ROOT_PASSWORD",
            secret::ROOT_PASSWORD_KEY,
            false,
        ),
        env_from_secret(
            &secret_name,
            "MYSQL_REPL_USER",
            secret::REPLICATION_USER_KEY,
            true,
        ),
        env_from_secret(
            &secret_name,
            "MYSQL_REPL_PASSWORD",
            secret::REPLICATION_PASSWORD_KEY,
            true,
        ),
        env_from_field("POD_HOSTNAME", "metadata.name"),
        env_value(
            "HOST",
            &format!(
                "$(POD_HOSTNAME).{}.{}",
                cluster::name_for_resource(ResourceName::HeadlessService, &name),
                namespace
            ),
        ),
        env_value("Master_SysVars", master_sysvars),
        env_value("Slave_SysVars", slave_sysvars),
    ];

    Container {
        image: Some(cluster.spec.xenon.image.to_owned()),
        env: Some(env),
        resources: Some(cluster.spec.xenon.resources.to_owned()),
        lifecycle: Some(Lifecycle {
            post_start: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!(
                            r#"until (xenoncli xenon ping && xenoncli cluster add "{}") > /dev/null 2>&1; do sleep 2; done"#,
                            cluster::xenon_peers(&name, &namespace, replicas)
                        ),
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ports: Some(vec![ContainerPort {
            name: Some(XENON_PORT_NAME.to_string()),
            container_port: XENON_PORT,
            ..Default::default()
        }]),
        liveness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec!["pgrep".to_string(), "xenon".to_string()]),
            }),
            initial_delay_seconds: Some(30),
            timeout_seconds: Some(5),
            period_seconds: Some(10),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "xenoncli xenon ping".to_string(),
                ]),
            }),
            initial_delay_seconds: Some(10),
            timeout_seconds: Some(1),
            period_seconds: Some(10),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            mount(SCRIPTS_VOLUME, XENON_SCRIPTS_MOUNT_PATH),
            mount(XENON_VOLUME, XENON_CONF_MOUNT_PATH),
        ]),
        ..Default::default()
    }
}

fn metrics(cluster: &MysqlCluster) -> Container {
    let secret_name = cluster::name_for_resource(ResourceName::Secret, &cluster.name_any());

    let probe = |initial_delay, timeout| Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(METRICS_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        timeout_seconds: Some(timeout),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    };

    Container {
        image: Some(cluster.spec.metrics.image.to_owned()),
        env: Some(vec![env_from_secret(
            &secret_name,
            "DATA_SOURCE_NAME",
            secret::DATA_SOURCE_KEY,
            true,
        )]),
        resources: Some(cluster.spec.metrics.resources.to_owned()),
        ports: Some(vec![ContainerPort {
            name: Some(METRICS_PORT_NAME.to_string()),
            container_port: METRICS_PORT,
            ..Default::default()
        }]),
        liveness_probe: Some(probe(15, 5)),
        readiness_probe: Some(probe(5, 1)),
        ..Default::default()
    }
}

fn slowlog(cluster: &MysqlCluster) -> Container {
    tail_log(cluster, "mysql-slow.log")
}

fn auditlog(cluster: &MysqlCluster) -> Container {
    tail_log(cluster, "mysql-audit.log")
}

fn tail_log(cluster: &MysqlCluster, file: &str) -> Container {
    Container {
        image: Some(cluster.spec.pod.sidecar_image.to_owned()),
        command: Some(vec![
            "sidecar".to_string(),
            "tail".to_string(),
            format!("{}/{}", LOGS_VOLUME_MOUNT_PATH, file),
        ]),
        resources: Some(cluster.spec.pod.resources.to_owned()),
        volume_mounts: Some(vec![mount(LOGS_VOLUME, LOGS_VOLUME_MOUNT_PATH)]),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> MysqlCluster {
        let mut cluster = MysqlCluster::new("demo", Default::default());
        cluster.metadata.namespace = Some("ns1".to_string());
        cluster.spec.replicas = Some(3);
        cluster.spec.pod.sidecar_image = "radondb/mysql-sidecar:v1.0".to_string();
        cluster.spec.pod.image_pull_policy = "IfNotPresent".to_string();
        cluster
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            ensure_container("proxysql", &cluster()),
            Err(Error::UnknownContainer(_))
        ));
    }

    #[test]
    fn init_container_runs_the_sidecar() {
        let container = ensure_container(CONTAINER_INIT_MYSQL, &cluster()).unwrap();

        assert_eq!(container.command, Some(vec!["sidecar".to_string(), "init".to_string()]));
        assert_eq!(container.image.as_deref(), Some("radondb/mysql-sidecar:v1.0"));

        let env = container.env.unwrap();
        let names = env.iter().map(|var| var.name.as_str()).collect::<Vec<_>>();
        assert!(names.contains(&"POD_HOSTNAME"));
        assert!(names.contains(&"SERVICE_NAME"));
        assert!(names.contains(&"ADMIT_DEFEAT_HEARBEAT_COUNT"));
        assert!(names.contains(&"MYSQL_ROOT_PASSWORD"));
        assert!(!names.contains(&"INIT_TOKUDB"));
        assert!(!names.contains(&"METRICS_USER"));
    }

    #[test]
    fn xenon_post_start_joins_every_peer() {
        let container = ensure_container(CONTAINER_XENON, &cluster()).unwrap();
        let command = container
            .lifecycle
            .unwrap()
            .post_start
            .unwrap()
            .exec
            .unwrap()
            .command
            .unwrap();

        assert!(command[2].contains("xenoncli cluster add"));
        assert!(command[2].contains("demo-mysql-0.demo-mysql.ns1:8801"));
        assert!(command[2].contains("demo-mysql-2.demo-mysql.ns1:8801"));
    }

    #[test]
    fn mysql_probes_use_the_root_credentials() {
        let container = ensure_container(CONTAINER_MYSQL, &cluster()).unwrap();

        let liveness = container.liveness_probe.unwrap().exec.unwrap().command.unwrap();
        assert!(liveness[2].contains("mysqladmin ping"));

        let readiness = container.readiness_probe.unwrap().exec.unwrap().command.unwrap();
        assert!(readiness[2].contains("SELECT 1"));

        let mounts = container.volume_mounts.unwrap();
        let paths = mounts
            .iter()
            .map(|mount| mount.mount_path.as_str())
            .collect::<Vec<_>>();
        assert!(paths.contains(&"/etc/mysql/conf.d"));
        assert!(paths.contains(&"/var/lib/mysql"));
        assert!(paths.contains(&"/var/log/mysql"));
        assert!(paths.contains(&"/docker-entrypoint-initdb.d"));
    }

    #[test]
    fn log_tails_follow_their_files() {
        let slowlog = ensure_container(CONTAINER_SLOWLOG, &cluster()).unwrap();
        assert_eq!(
            slowlog.command,
            Some(vec![
                "sidecar".to_string(),
                "tail".to_string(),
                "/var/log/mysql/mysql-slow.log".to_string(),
            ])
        );

        let auditlog = ensure_container(CONTAINER_AUDITLOG, &cluster()).unwrap();
        assert_eq!(
            auditlog.command.unwrap()[2],
            "/var/log/mysql/mysql-audit.log"
        );
    }

    #[test]
    fn metrics_container_reads_the_composed_data_source() {
        let mut cluster = cluster();
        cluster.spec.metrics.enabled = true;
        cluster.spec.metrics.image = "prom/mysqld-exporter:v0.12.1".to_string();

        let container = ensure_container(CONTAINER_METRICS, &cluster).unwrap();
        let env = container.env.unwrap();

        assert_eq!(env[0].name, "DATA_SOURCE_NAME");
        assert_eq!(
            env[0]
                .value_from
                .as_ref()
                .unwrap()
                .secret_key_ref
                .as_ref()
                .unwrap()
                .key,
            "data-source"
        );
        assert_eq!(container.ports.unwrap()[0].container_port, 9104);
    }
}

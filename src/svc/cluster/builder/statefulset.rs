//! # Workload set builder
//!
//! This module provides the builder of the ordered pod set running mysql,
//! the raft supervisor and the log tail containers

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            ConfigMapVolumeSource, EmptyDirVolumeSource, HostPathVolumeSource,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Volume,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector},
};
use kube::{api::ObjectMeta, ResourceExt};

use crate::svc::{
    cluster::{
        self,
        builder::{container, Error},
        ResourceName, CONF_MAP_VOLUME, CONF_VOLUME, CONTAINER_AUDITLOG, CONTAINER_INIT_MYSQL,
        CONTAINER_METRICS, CONTAINER_MYSQL, CONTAINER_SLOWLOG, CONTAINER_XENON, DATA_VOLUME,
        INIT_FILE_VOLUME, LOGS_VOLUME, METRICS_PORT, SCRIPTS_VOLUME, SYS_VOLUME, XENON_VOLUME,
    },
    crd::admission::quantity_bytes,
    crd::cluster::MysqlCluster,
};

// -----------------------------------------------------------------------------
// Constants

const TRANSPARENT_HUGEPAGE_HOST_PATH: &str = "/sys/kernel/mm/transparent_hugepage";

// -----------------------------------------------------------------------------
// Builder

/// converge the workload set of the cluster
pub fn mutate(cluster: &MysqlCluster, statefulset: &mut StatefulSet) -> Result<(), Error> {
    let name = cluster.name_any();

    statefulset.metadata.labels = Some(cluster::labels(cluster));

    let mut template_labels = cluster::labels(cluster);
    template_labels.extend(
        cluster
            .spec
            .pod
            .labels
            .iter()
            .map(|(key, value)| (key.to_owned(), value.to_owned())),
    );

    let mut template_annotations = cluster.spec.pod.annotations.to_owned();
    if cluster.spec.metrics.enabled {
        template_annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
        template_annotations.insert(
            "prometheus.io/port".to_string(),
            METRICS_PORT.to_string(),
        );
    }

    statefulset.spec = Some(StatefulSetSpec {
        service_name: cluster::name_for_resource(ResourceName::HeadlessService, &name),
        replicas: cluster.spec.replicas,
        selector: LabelSelector {
            match_labels: Some(cluster::selector_labels(cluster)),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(template_labels),
                annotations: if template_annotations.is_empty() {
                    None
                } else {
                    Some(template_annotations)
                },
                ..Default::default()
            }),
            spec: Some(pod_spec(cluster)?),
        },
        volume_claim_templates: if cluster.spec.persistence.enabled {
            Some(vec![claim_template(cluster)?])
        } else {
            None
        },
        ..Default::default()
    });

    Ok(())
}

fn pod_spec(cluster: &MysqlCluster) -> Result<PodSpec, Error> {
    let mut containers = vec![
        container::ensure_container(CONTAINER_MYSQL, cluster)?,
        container::ensure_container(CONTAINER_XENON, cluster)?,
        container::ensure_container(CONTAINER_SLOWLOG, cluster)?,
        container::ensure_container(CONTAINER_AUDITLOG, cluster)?,
    ];

    if cluster.spec.metrics.enabled {
        containers.push(container::ensure_container(CONTAINER_METRICS, cluster)?);
    }

    Ok(PodSpec {
        init_containers: Some(vec![container::ensure_container(
            CONTAINER_INIT_MYSQL,
            cluster,
        )?]),
        containers,
        volumes: Some(volumes(cluster)),
        service_account_name: Some(cluster.spec.pod.service_account_name.to_owned()),
        affinity: cluster.spec.pod.affinity.to_owned(),
        scheduler_name: if cluster.spec.pod.scheduler_name.is_empty() {
            None
        } else {
            Some(cluster.spec.pod.scheduler_name.to_owned())
        },
        priority_class_name: if cluster.spec.pod.priority_class_name.is_empty() {
            None
        } else {
            Some(cluster.spec.pod.priority_class_name.to_owned())
        },
        tolerations: if cluster.spec.pod.tolerations.is_empty() {
            None
        } else {
            Some(cluster.spec.pod.tolerations.to_owned())
        },
        ..Default::default()
    })
}

fn volumes(cluster: &MysqlCluster) -> Vec<Volume> {
    let mut volumes = vec![
        empty_dir(CONF_VOLUME),
        config_map_volume(cluster),
        empty_dir(LOGS_VOLUME),
        empty_dir(SCRIPTS_VOLUME),
        empty_dir(XENON_VOLUME),
        empty_dir(INIT_FILE_VOLUME),
    ];

    if !cluster.spec.persistence.enabled {
        volumes.push(empty_dir(DATA_VOLUME));
    }

    if cluster.spec.mysql.init_tokudb {
        volumes.push(Volume {
            name: SYS_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: TRANSPARENT_HUGEPAGE_HOST_PATH.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    volumes
}

fn claim_template(cluster: &MysqlCluster) -> Result<PersistentVolumeClaim, Error> {
    let size = &cluster.spec.persistence.size;
    let quantity = Quantity(size.to_owned());

    if quantity_bytes(&quantity).is_none() {
        return Err(Error::InvalidPersistenceSize(size.to_owned()));
    }

    // the literal "-" storage class disables dynamic provisioning
    let storage_class_name = match cluster.spec.persistence.storage_class.as_deref() {
        Some("-") => Some(String::new()),
        Some(class) => Some(class.to_string()),
        None => None,
    };

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(cluster.spec.persistence.access_modes.to_owned()),
            storage_class_name,
            resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                requests: Some([("storage".to_string(), quantity)].into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn config_map_volume(cluster: &MysqlCluster) -> Volume {
    Volume {
        name: CONF_MAP_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(cluster::name_for_resource(
                ResourceName::ConfigMap,
                &cluster.name_any(),
            )),
            ..Default::default()
        }),
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
        cluster.spec.pod.service_account_name = "default".to_string();
        cluster.spec.pod.sidecar_image = "radondb/mysql-sidecar:v1.0".to_string();
        cluster.spec.persistence.size = "10Gi".to_string();
        cluster.spec.persistence.access_modes = vec!["ReadWriteOnce".to_string()];
        cluster
    }

    #[test]
    fn default_cluster_runs_four_containers_and_one_init() {
        let mut statefulset = StatefulSet::default();
        mutate(&cluster(), &mut statefulset).unwrap();

        let spec = statefulset.spec.unwrap();
        assert_eq!(spec.service_name, "demo-mysql");
        assert_eq!(spec.replicas, Some(3));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.init_containers.as_ref().unwrap().len(), 1);
        assert_eq!(pod.init_containers.unwrap()[0].name, "init-mysql");

        let names = pod
            .containers
            .iter()
            .map(|container| container.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["mysql", "xenon", "slowlog", "auditlog"]);

        // prometheus annotations only appear with metrics
        assert!(spec.template.metadata.unwrap().annotations.is_none());
    }

    #[test]
    fn metrics_adds_a_container_and_the_scrape_annotations() {
        let mut cluster = cluster();
        cluster.spec.metrics.enabled = true;

        let mut statefulset = StatefulSet::default();
        mutate(&cluster, &mut statefulset).unwrap();

        let spec = statefulset.spec.unwrap();
        let annotations = spec.template.metadata.unwrap().annotations.unwrap();
        assert_eq!(
            annotations.get("prometheus.io/scrape").map(String::as_str),
            Some("true")
        );
        assert_eq!(
            annotations.get("prometheus.io/port").map(String::as_str),
            Some("9104")
        );

        let names = spec
            .template
            .spec
            .unwrap()
            .containers
            .iter()
            .map(|container| container.name.to_owned())
            .collect::<Vec<_>>();
        assert!(names.contains(&"metrics".to_string()));
    }

    #[test]
    fn persistence_switches_between_claim_and_empty_dir() {
        let mut statefulset = StatefulSet::default();
        mutate(&cluster(), &mut statefulset).unwrap();

        let spec = statefulset.spec.unwrap();
        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.name.as_deref(), Some("data"));

        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        assert!(!volumes.iter().any(|volume| volume.name == "data"));

        let mut ephemeral = cluster();
        ephemeral.spec.persistence.enabled = false;

        let mut statefulset = StatefulSet::default();
        mutate(&ephemeral, &mut statefulset).unwrap();

        let spec = statefulset.spec.unwrap();
        assert!(spec.volume_claim_templates.is_none());
        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().any(|volume| volume.name == "data"));
    }

    #[test]
    fn invalid_persistence_size_is_a_build_error() {
        let mut cluster = cluster();
        cluster.spec.persistence.size = "ten gigs".to_string();

        let mut statefulset = StatefulSet::default();
        assert!(matches!(
            mutate(&cluster, &mut statefulset),
            Err(Error::InvalidPersistenceSize(_))
        ));
    }

    #[test]
    fn dashed_storage_class_means_no_class() {
        let mut cluster = cluster();
        cluster.spec.persistence.storage_class = Some("-".to_string());

        let claim = claim_template(&cluster).unwrap();
        assert_eq!(
            claim.spec.unwrap().storage_class_name.as_deref(),
            Some("")
        );
    }

    #[test]
    fn tokudb_mounts_the_transparent_hugepage_host_path() {
        let mut cluster = cluster();
        cluster.spec.mysql.init_tokudb = true;

        let mut statefulset = StatefulSet::default();
        mutate(&cluster, &mut statefulset).unwrap();

        let volumes = statefulset
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .volumes
            .unwrap();
        let sys = volumes
            .iter()
            .find(|volume| volume.name == "host-sys")
            .unwrap();
        assert_eq!(
            sys.host_path.as_ref().unwrap().path,
            "/sys/kernel/mm/transparent_hugepage"
        );
    }

    #[test]
    fn converging_twice_yields_the_same_shape() {
        let mut first = StatefulSet::default();
        mutate(&cluster(), &mut first).unwrap();

        let mut second = first.to_owned();
        mutate(&cluster(), &mut second).unwrap();

        assert_eq!(first, second);
    }
}

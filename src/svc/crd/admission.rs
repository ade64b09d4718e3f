//! # Admission module
//!
//! This module provides the defaulting applied to a mysql cluster before a
//! reconciliation proceeds and the advisory validation slots

use k8s_openapi::apimachinery::pkg::{api::resource::Quantity, util::intstr::IntOrString};

use crate::svc::{
    cluster::{
        DEFAULT_DATABASE, DEFAULT_ELECTION_TIMEOUT, DEFAULT_HEARBEAT_COUNT,
        DEFAULT_IMAGE_PULL_POLICY, DEFAULT_METRICS_IMAGE, DEFAULT_MYSQL_USER,
        DEFAULT_MYSQL_USER_PASSWORD, DEFAULT_MYSQL_VERSION_TAG, DEFAULT_PERSISTENCE_SIZE,
        DEFAULT_REPLICAS, DEFAULT_SERVICE_ACCOUNT, DEFAULT_SIDECAR_IMAGE, DEFAULT_XENON_IMAGE,
    },
    crd::cluster::MysqlCluster,
};

// -----------------------------------------------------------------------------
// Constants

// nolint equivalent of the original's iota ladder, 1 << (10 * n)
const KIB: i64 = 1 << 10;
const MIB: i64 = KIB << 10;
const GIB: i64 = MIB << 10;

/// lower bound of the derived innodb buffer pool
const BUFFER_POOL_FLOOR: i64 = 128 * MIB;

// -----------------------------------------------------------------------------
// Error enumeration

/// errors the validation slots may surface once they stop being advisory
#[derive(thiserror::Error, Debug)]
pub enum Error {}

// -----------------------------------------------------------------------------
// Defaulting

/// fill every optional field of the cluster specification and derive the
/// innodb tuning, in memory. The object stored in the api server is left
/// untouched, mutating the spec from the operator leads to non-deterministic
/// reconciliation loops
pub fn apply_defaults(cluster: &mut MysqlCluster) {
    let spec = &mut cluster.spec;

    if spec.replicas.is_none() {
        spec.replicas = Some(DEFAULT_REPLICAS);
    }

    if spec.mysql_version.is_empty() {
        spec.mysql_version = DEFAULT_MYSQL_VERSION_TAG.to_string();
    }

    if spec.mysql.user.is_empty() {
        spec.mysql.user = DEFAULT_MYSQL_USER.to_string();
    }

    if spec.mysql.password.is_empty() {
        spec.mysql.password = DEFAULT_MYSQL_USER_PASSWORD.to_string();
    }

    if spec.mysql.database.is_empty() {
        spec.mysql.database = DEFAULT_DATABASE.to_string();
    }

    if spec.xenon.image.is_empty() {
        spec.xenon.image = DEFAULT_XENON_IMAGE.to_string();
    }

    if spec.xenon.admit_defeat_hearbeat_count.is_none() {
        spec.xenon.admit_defeat_hearbeat_count = Some(DEFAULT_HEARBEAT_COUNT);
    }

    if spec.xenon.election_timeout.is_none() {
        spec.xenon.election_timeout = Some(DEFAULT_ELECTION_TIMEOUT);
    }

    if spec.metrics.image.is_empty() {
        spec.metrics.image = DEFAULT_METRICS_IMAGE.to_string();
    }

    if spec.pod.image_pull_policy.is_empty() {
        spec.pod.image_pull_policy = DEFAULT_IMAGE_PULL_POLICY.to_string();
    }

    if spec.pod.service_account_name.is_empty() {
        spec.pod.service_account_name = DEFAULT_SERVICE_ACCOUNT.to_string();
    }

    if spec.pod.sidecar_image.is_empty() {
        spec.pod.sidecar_image = DEFAULT_SIDECAR_IMAGE.to_string();
    }

    if spec.persistence.access_modes.is_empty() {
        spec.persistence.access_modes = vec!["ReadWriteOnce".to_string()];
    }

    if spec.persistence.size.is_empty() {
        spec.persistence.size = DEFAULT_PERSISTENCE_SIZE.to_string();
    }

    let memory = spec
        .mysql
        .resources
        .requests
        .as_ref()
        .and_then(|requests| requests.get("memory"))
        .and_then(quantity_bytes)
        .unwrap_or(0);

    let cpu_millis = spec
        .pod
        .resources
        .limits
        .as_ref()
        .and_then(|limits| limits.get("cpu"))
        .and_then(quantity_milli_cpus)
        .unwrap_or(0);

    let (default_size, max_size) = if memory <= GIB {
        ((0.45 * memory as f64) as i64, (0.60 * memory as f64) as i64)
    } else {
        ((0.60 * memory as f64) as i64, (0.80 * memory as f64) as i64)
    };

    let pool = match spec
        .mysql
        .conf
        .get("innodb_buffer_pool_size")
        .and_then(int_or_string_value)
    {
        None => default_size.max(BUFFER_POOL_FLOOR),
        Some(requested) => requested.max(BUFFER_POOL_FLOOR).min(max_size),
    };

    let instances = ((cpu_millis as f64 / 1000.0).ceil() as i64)
        .min(pool / GIB)
        .max(1);

    spec.mysql.conf.insert(
        "innodb_buffer_pool_size".to_string(),
        IntOrString::String(pool.to_string()),
    );
    spec.mysql.conf.insert(
        "innodb_buffer_pool_instances".to_string(),
        IntOrString::Int(instances as i32),
    );
}

fn int_or_string_value(value: &IntOrString) -> Option<i64> {
    match value {
        IntOrString::Int(int) => Some(*int as i64),
        IntOrString::String(string) => string.trim().parse().ok(),
    }
}

// -----------------------------------------------------------------------------
// Quantity helpers

/// returns the byte value of a kubernetes resource quantity, e.g. "512Mi"
pub fn quantity_bytes(quantity: &Quantity) -> Option<i64> {
    quantity_value(&quantity.0).map(|value| value.round() as i64)
}

/// returns the millicpu value of a kubernetes resource quantity, e.g.
/// "1500m" or "2"
pub fn quantity_milli_cpus(quantity: &Quantity) -> Option<i64> {
    quantity_value(&quantity.0).map(|value| (value * 1000.0).round() as i64)
}

fn quantity_value(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (mantissa, suffix) = raw.split_at(split);

    let factor: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => (KIB) as f64,
        "Mi" => (MIB) as f64,
        "Gi" => (GIB) as f64,
        "Ti" => (GIB * KIB) as f64,
        "Pi" => (GIB * MIB) as f64,
        "Ei" => (GIB * GIB) as f64,
        _ => return None,
    };

    mantissa.parse::<f64>().ok().map(|value| value * factor)
}

// -----------------------------------------------------------------------------
// Validation slots

/// validate a cluster at creation time.
///
/// Validation is currently advisory, the slot is where a future validator
/// may reject a replica count outside of {0, 2, 3, 5}, a service account
/// name longer than 63 characters or an election timeout smaller than the
/// admit-defeat heartbeat count
pub fn validate_create(_cluster: &MysqlCluster) -> Result<(), Error> {
    Ok(())
}

/// validate a cluster at update time, see [`validate_create`]
pub fn validate_update(_cluster: &MysqlCluster) -> Result<(), Error> {
    Ok(())
}

/// validate a cluster at deletion time, see [`validate_create`]
pub fn validate_delete(_cluster: &MysqlCluster) -> Result<(), Error> {
    Ok(())
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ResourceRequirements;

    use super::*;

    fn cluster_with(memory: Option<&str>, cpu: Option<&str>) -> MysqlCluster {
        let mut cluster = MysqlCluster::new("demo", Default::default());

        if let Some(memory) = memory {
            cluster.spec.mysql.resources = ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "memory".to_string(),
                    Quantity(memory.to_string()),
                )])),
                ..Default::default()
            };
        }

        if let Some(cpu) = cpu {
            cluster.spec.pod.resources = ResourceRequirements {
                limits: Some(BTreeMap::from([(
                    "cpu".to_string(),
                    Quantity(cpu.to_string()),
                )])),
                ..Default::default()
            };
        }

        cluster
    }

    fn pool_of(cluster: &MysqlCluster) -> i64 {
        int_or_string_value(&cluster.spec.mysql.conf["innodb_buffer_pool_size"]).unwrap()
    }

    fn instances_of(cluster: &MysqlCluster) -> i64 {
        int_or_string_value(&cluster.spec.mysql.conf["innodb_buffer_pool_instances"]).unwrap()
    }

    #[test]
    fn quantities_parse_binary_decimal_and_milli_suffixes() {
        assert_eq!(quantity_bytes(&Quantity("128Mi".to_string())), Some(128 * MIB));
        assert_eq!(quantity_bytes(&Quantity("1Gi".to_string())), Some(GIB));
        assert_eq!(quantity_bytes(&Quantity("1073741824".to_string())), Some(GIB));
        assert_eq!(quantity_bytes(&Quantity("2G".to_string())), Some(2_000_000_000));
        assert_eq!(quantity_milli_cpus(&Quantity("1500m".to_string())), Some(1500));
        assert_eq!(quantity_milli_cpus(&Quantity("2".to_string())), Some(2000));
        assert_eq!(quantity_milli_cpus(&Quantity("0.5".to_string())), Some(500));
        assert_eq!(quantity_value("12x"), None);
    }

    #[test]
    fn small_memory_uses_the_forty_five_percent_default() {
        let mut cluster = cluster_with(Some("512Mi"), None);
        apply_defaults(&mut cluster);

        assert_eq!(pool_of(&cluster), (0.45 * (512 * MIB) as f64) as i64);
        assert_eq!(instances_of(&cluster), 1);
    }

    #[test]
    fn large_memory_uses_the_sixty_percent_default() {
        let mut cluster = cluster_with(Some("4Gi"), Some("2"));
        apply_defaults(&mut cluster);

        assert_eq!(pool_of(&cluster), (0.60 * (4 * GIB) as f64) as i64);
        assert_eq!(instances_of(&cluster), 2);
    }

    #[test]
    fn user_value_is_clamped_between_floor_and_cap() {
        let mut cluster = cluster_with(Some("4Gi"), None);
        cluster
            .spec
            .mysql
            .conf
            .insert("innodb_buffer_pool_size".to_string(), IntOrString::Int(64 * MIB as i32));
        apply_defaults(&mut cluster);
        assert_eq!(pool_of(&cluster), BUFFER_POOL_FLOOR);

        let mut cluster = cluster_with(Some("4Gi"), None);
        cluster.spec.mysql.conf.insert(
            "innodb_buffer_pool_size".to_string(),
            IntOrString::String((10 * GIB).to_string()),
        );
        apply_defaults(&mut cluster);
        assert_eq!(pool_of(&cluster), (0.80 * (4 * GIB) as f64) as i64);
    }

    #[test]
    fn derived_pool_stays_within_documented_bounds() {
        for memory in ["256Mi", "1Gi", "2Gi", "8Gi", "31Gi"] {
            for cpu in ["250m", "1", "4", "16"] {
                let mut cluster = cluster_with(Some(memory), Some(cpu));
                apply_defaults(&mut cluster);

                let memory_bytes =
                    quantity_bytes(&Quantity(memory.to_string())).unwrap();
                let pool = pool_of(&cluster);
                let instances = instances_of(&cluster);

                assert!(pool >= BUFFER_POOL_FLOOR);
                assert!(pool <= ((0.80 * memory_bytes as f64) as i64).max(BUFFER_POOL_FLOOR));
                assert!(instances >= 1);
                assert!(instances <= (pool / GIB).max(1));
            }
        }
    }

    #[test]
    fn optional_fields_receive_their_documented_defaults() {
        let mut cluster = cluster_with(None, None);
        apply_defaults(&mut cluster);

        assert_eq!(cluster.spec.replicas, Some(3));
        assert_eq!(cluster.spec.mysql_version, "5.7");
        assert_eq!(cluster.spec.mysql.user, "qc_usr");
        assert_eq!(cluster.spec.mysql.database, "qingcloud");
        assert_eq!(cluster.spec.xenon.admit_defeat_hearbeat_count, Some(5));
        assert_eq!(cluster.spec.xenon.election_timeout, Some(10000));
        assert_eq!(cluster.spec.pod.service_account_name, "default");
        assert_eq!(cluster.spec.persistence.size, "10Gi");
        assert!(cluster.spec.persistence.enabled);
    }
}

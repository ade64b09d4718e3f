//! # Identity store builder
//!
//! This module provides the builder of the secret holding the operator
//! credentials of a cluster. Generated passwords are alphanumeric only, the
//! values end up unescaped inside mysql statements

use k8s_openapi::{api::core::v1::Secret, ByteString};
use rand::{distr::Alphanumeric, Rng};

use crate::svc::{
    cluster::{self, DEFAULT_METRICS_USER, DEFAULT_REPLICATION_USER},
    cluster::builder::Error,
    crd::cluster::MysqlCluster,
};

// -----------------------------------------------------------------------------
// Constants

pub const ROOT_PASSWORD_KEY: &str = "root-password";
pub const REPLICATION_USER_KEY: &str = "replication-user";
pub const REPLICATION_PASSWORD_KEY: &str = "replication-password";
pub const MYSQL_USER_KEY: &str = "mysql-user";
pub const MYSQL_PASSWORD_KEY: &str = "mysql-password";
pub const MYSQL_DATABASE_KEY: &str = "mysql-database";
pub const METRICS_USER_KEY: &str = "metrics-user";
pub const METRICS_PASSWORD_KEY: &str = "metrics-password";
pub const DATA_SOURCE_KEY: &str = "data-source";

const GENERATED_PASSWORD_LEN: usize = 12;

// -----------------------------------------------------------------------------
// Builder

/// converge the identity store content. User supplied credentials are copied
/// verbatim on every pass while generated passwords are only minted when the
/// key is absent or empty
pub fn mutate(cluster: &MysqlCluster, secret: &mut Secret) -> Result<(), Error> {
    secret.metadata.labels = Some(cluster::labels(cluster));

    let data = secret.data.get_or_insert_with(Default::default);

    data.insert(
        ROOT_PASSWORD_KEY.to_string(),
        bytes(&cluster.spec.mysql.root_password),
    );
    data.insert(MYSQL_USER_KEY.to_string(), bytes(&cluster.spec.mysql.user));
    data.insert(
        MYSQL_PASSWORD_KEY.to_string(),
        bytes(&cluster.spec.mysql.password),
    );
    data.insert(
        MYSQL_DATABASE_KEY.to_string(),
        bytes(&cluster.spec.mysql.database),
    );

    data.insert(
        REPLICATION_USER_KEY.to_string(),
        bytes(DEFAULT_REPLICATION_USER),
    );
    if is_empty(data.get(REPLICATION_PASSWORD_KEY)) {
        data.insert(
            REPLICATION_PASSWORD_KEY.to_string(),
            bytes(&random_alphanumeric(GENERATED_PASSWORD_LEN)),
        );
    }

    if cluster.spec.metrics.enabled {
        data.insert(METRICS_USER_KEY.to_string(), bytes(DEFAULT_METRICS_USER));
        if is_empty(data.get(METRICS_PASSWORD_KEY)) {
            data.insert(
                METRICS_PASSWORD_KEY.to_string(),
                bytes(&random_alphanumeric(GENERATED_PASSWORD_LEN)),
            );
        }

        let user = string(data.get(METRICS_USER_KEY));
        let password = string(data.get(METRICS_PASSWORD_KEY));
        data.insert(
            DATA_SOURCE_KEY.to_string(),
            bytes(&format!("{}:{}@tcp(localhost:3306)/", user, password)),
        );
    }

    Ok(())
}

/// returns a random alphanumeric string of the given length
pub fn random_alphanumeric(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn bytes(value: &str) -> ByteString {
    ByteString(value.as_bytes().to_vec())
}

fn string(value: Option<&ByteString>) -> String {
    value
        .map(|value| String::from_utf8_lossy(&value.0).to_string())
        .unwrap_or_default()
}

fn is_empty(value: Option<&ByteString>) -> bool {
    value.map(|value| value.0.is_empty()).unwrap_or(true)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> MysqlCluster {
        let mut cluster = MysqlCluster::new("demo", Default::default());
        cluster.metadata.namespace = Some("ns1".to_string());
        cluster.spec.mysql.root_password = "rootpw".to_string();
        cluster.spec.mysql.user = "qc_usr".to_string();
        cluster.spec.mysql.password = "Qing@123".to_string();
        cluster.spec.mysql.database = "qingcloud".to_string();
        cluster
    }

    #[test]
    fn user_supplied_credentials_are_copied_verbatim() {
        let mut secret = Secret::default();
        mutate(&cluster(), &mut secret).unwrap();

        let data = secret.data.unwrap();
        assert_eq!(data[ROOT_PASSWORD_KEY].0, b"rootpw");
        assert_eq!(data[MYSQL_USER_KEY].0, b"qc_usr");
        assert_eq!(data[MYSQL_PASSWORD_KEY].0, b"Qing@123");
        assert_eq!(data[MYSQL_DATABASE_KEY].0, b"qingcloud");
        assert_eq!(data[REPLICATION_USER_KEY].0, b"qc_repl");
    }

    #[test]
    fn generated_passwords_are_alphanumeric_and_stable() {
        let mut secret = Secret::default();
        mutate(&cluster(), &mut secret).unwrap();

        let generated = secret.data.as_ref().unwrap()[REPLICATION_PASSWORD_KEY].to_owned();
        assert_eq!(generated.0.len(), GENERATED_PASSWORD_LEN);
        assert!(generated.0.iter().all(|byte| byte.is_ascii_alphanumeric()));

        // a second pass keeps the minted password
        mutate(&cluster(), &mut secret).unwrap();
        assert_eq!(
            secret.data.as_ref().unwrap()[REPLICATION_PASSWORD_KEY],
            generated
        );
    }

    #[test]
    fn metrics_keys_appear_with_the_composed_data_source() {
        let mut cluster = cluster();
        cluster.spec.metrics.enabled = true;

        let mut secret = Secret::default();
        mutate(&cluster, &mut secret).unwrap();

        let data = secret.data.unwrap();
        assert_eq!(data[METRICS_USER_KEY].0, b"qc_metrics");

        let password = String::from_utf8(data[METRICS_PASSWORD_KEY].0.to_owned()).unwrap();
        let source = String::from_utf8(data[DATA_SOURCE_KEY].0.to_owned()).unwrap();
        assert_eq!(
            source,
            format!("qc_metrics:{}@tcp(localhost:3306)/", password)
        );
    }

    #[test]
    fn metrics_keys_are_not_minted_when_disabled() {
        let mut secret = Secret::default();
        mutate(&cluster(), &mut secret).unwrap();

        let data = secret.data.unwrap();
        assert!(!data.contains_key(METRICS_USER_KEY));
        assert!(!data.contains_key(DATA_SOURCE_KEY));
    }
}

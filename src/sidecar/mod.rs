//! # Sidecar module
//!
//! This module provides the in-pod agent, a one-shot bootstrap command
//! preparing configuration and host state before mysql starts and a
//! long-running command streaming a log file to the standard output

use std::path::PathBuf;

use semver::Version;
use tracing::debug;

use crate::svc::cluster::MYSQL_DEFAULT_VERSION;

pub mod init;
pub mod tail;

// -----------------------------------------------------------------------------
// Constants

/// offset added to the pod ordinal, server-id 0 is reserved by mysql
pub const SERVER_ID_OFFSET: i32 = 100;

pub const DEFAULT_ADMIT_DEFEAT_HEARBEAT_COUNT: i32 = 5;
pub const DEFAULT_ELECTION_TIMEOUT: i32 = 10000;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to derive the server identity from hostname '{0}'")]
    MissingOrdinal(String),
    #[error("failed to remove lost+found, {0}")]
    RemoveLostFound(std::io::Error),
    #[error("failed to write the server identity, {0}")]
    WriteServerId(std::io::Error),
    #[error("failed to copy the mysql configuration, {0}")]
    CopyConfiguration(std::io::Error),
    #[error("failed to install scripts, {0}")]
    InstallScripts(std::io::Error),
    #[error("failed to disable transparent hugepages, {0}")]
    TransparentHugepage(std::io::Error),
    #[error("failed to write the supervisor configuration, {0}")]
    WriteXenonConfiguration(std::io::Error),
    #[error("failed to write the initialization statements, {0}")]
    WriteInitSql(std::io::Error),
    #[error("cannot find the file '{0}'")]
    FileNotFound(PathBuf),
    #[error("failed to follow the file, {0}")]
    Follow(std::io::Error),
}

// -----------------------------------------------------------------------------
// Paths structure

/// on-disk layout inside the pod, overridable for tests
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Paths {
    pub conf: PathBuf,
    pub config_map: PathBuf,
    pub scripts: PathBuf,
    pub xenon: PathBuf,
    pub init_file: PathBuf,
    pub data: PathBuf,
    pub sys: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            conf: PathBuf::from("/mnt/conf.d"),
            config_map: PathBuf::from("/mnt/config-map"),
            scripts: PathBuf::from("/mnt/scripts"),
            xenon: PathBuf::from("/mnt/xenon"),
            init_file: PathBuf::from("/mnt/init-file"),
            data: PathBuf::from("/var/lib/mysql"),
            sys: PathBuf::from("/host-sys/kernel/mm/transparent_hugepage"),
        }
    }
}

// -----------------------------------------------------------------------------
// Config structure

/// environment handed to the agent by the init container recipe
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Config {
    pub hostname: String,
    pub namespace: String,
    pub service_name: String,

    pub root_password: String,

    pub replication_user: String,
    pub replication_password: String,

    pub metrics_user: String,
    pub metrics_password: String,

    pub init_tokudb: bool,

    pub mysql_version: Version,

    pub admit_defeat_hearbeat_count: i32,
    pub election_timeout: i32,
}

impl Config {
    /// assemble the configuration from the environment, every missing value
    /// falls back to a deterministic default
    pub fn from_env() -> Self {
        let hostname = match env_value("POD_HOSTNAME") {
            value if !value.is_empty() => value,
            _ => hostname::get()
                .map(|host| host.to_string_lossy().to_string())
                .unwrap_or_default(),
        };

        let mysql_version = Version::parse(&env_value("MYSQL_VERSION")).unwrap_or_else(|_| {
            debug!("MYSQL_VERSION is not a semver version, use the default");
            Version::parse(MYSQL_DEFAULT_VERSION)
                .expect("default mysql version to be a valid semver")
        });

        Self {
            hostname,
            namespace: env_value("NAMESPACE"),
            service_name: env_value("SERVICE_NAME"),
            root_password: env_value("MYSQL_ROOT_PASSWORD"),
            replication_user: env_value("MYSQL_REPL_USER"),
            replication_password: env_value("MYSQL_REPL_PASSWORD"),
            metrics_user: env_value("METRICS_USER"),
            metrics_password: env_value("METRICS_PASSWORD"),
            init_tokudb: !env_value("INIT_TOKUDB").is_empty(),
            mysql_version,
            admit_defeat_hearbeat_count: env_value("ADMIT_DEFEAT_HEARBEAT_COUNT")
                .parse()
                .unwrap_or(DEFAULT_ADMIT_DEFEAT_HEARBEAT_COUNT),
            election_timeout: env_value("ELECTION_TIMEOUT")
                .parse()
                .unwrap_or(DEFAULT_ELECTION_TIMEOUT),
        }
    }

    /// returns the stable fully qualified host of this pod
    pub fn own_hostname(&self) -> String {
        format!("{}.{}.{}", self.hostname, self.service_name, self.namespace)
    }

    /// derive the numeric server identity from the pod ordinal, the integer
    /// suffix after the last dash of the hostname
    pub fn server_id(&self) -> Result<i32, Error> {
        self.hostname
            .rsplit('-')
            .next()
            .and_then(|ordinal| ordinal.parse::<i32>().ok())
            .map(|ordinal| SERVER_ID_OFFSET + ordinal)
            .ok_or_else(|| Error::MissingOrdinal(self.hostname.to_owned()))
    }
}

fn env_value(key: &str) -> String {
    match std::env::var(key) {
        Ok(value) => value,
        Err(_) => {
            debug!(key = key, "environment is not set");
            String::new()
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn config() -> Config {
        Config {
            hostname: "demo-mysql-2".to_string(),
            namespace: "ns1".to_string(),
            service_name: "demo-mysql".to_string(),
            root_password: "root".to_string(),
            replication_user: "qc_repl".to_string(),
            replication_password: "replpw".to_string(),
            metrics_user: String::new(),
            metrics_password: String::new(),
            init_tokudb: false,
            mysql_version: Version::parse("5.7.33").unwrap(),
            admit_defeat_hearbeat_count: 5,
            election_timeout: 10000,
        }
    }

    #[test]
    fn server_id_offsets_the_pod_ordinal() {
        assert_eq!(config().server_id().unwrap(), 102);

        let mut config = config();
        config.hostname = "demo-mysql-0".to_string();
        assert_eq!(config.server_id().unwrap(), 100);

        config.hostname = "demo".to_string();
        assert!(matches!(config.server_id(), Err(Error::MissingOrdinal(_))));
    }

    #[test]
    fn own_hostname_is_fully_qualified() {
        assert_eq!(config().own_hostname(), "demo-mysql-2.demo-mysql.ns1");
    }
}

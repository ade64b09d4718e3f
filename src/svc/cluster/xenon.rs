//! # Xenon configuration module
//!
//! This module renders the raft supervisor json configuration. The operator
//! stores a placeholder variant in the configuration artifact while the
//! sidecar renders the literal variant inside the pod, both from the same
//! template

use semver::Version;
use serde_json::json;

use crate::svc::cluster::{MYSQL_PORT, XENON_PORT};

// -----------------------------------------------------------------------------
// Constants

/// placeholders substituted in-pod by the bootstrap agent
pub const REPL_USER_PLACEHOLDER: &str = "@@REPL_USER@@";
pub const REPL_PASSWD_PLACEHOLDER: &str = "@@REPL_PASSWD@@";
pub const ROOT_PASSWD_PLACEHOLDER: &str = "@@ROOT_PASSWD@@";
pub const HOSTNAME_PLACEHOLDER: &str = "@@HOSTNAME@@";

const MASTER_SYSVARS: &str = "sync_binlog=default;innodb_flush_log_at_trx_commit=default";
const SLAVE_SYSVARS: &str = "sync_binlog=1000;innodb_flush_log_at_trx_commit=1";
const MASTER_SYSVARS_TOKUDB: &str =
    "tokudb_fsync_log_period=default;sync_binlog=default;innodb_flush_log_at_trx_commit=default";
const SLAVE_SYSVARS_TOKUDB: &str =
    "tokudb_fsync_log_period=1000;sync_binlog=1000;innodb_flush_log_at_trx_commit=1";

// -----------------------------------------------------------------------------
// XenonTemplate structure

/// inputs of the raft supervisor configuration
#[derive(PartialEq, Clone, Debug)]
pub struct XenonTemplate<'a> {
    /// `<host>` part of the supervisor endpoint, the xenon port is appended
    pub host: &'a str,
    pub replication_user: &'a str,
    pub replication_password: &'a str,
    pub root_password: &'a str,
    pub mysql_version: &'a Version,
    pub admit_defeat_hearbeat_count: i32,
    pub election_timeout: i32,
    pub init_tokudb: bool,
}

impl XenonTemplate<'_> {
    /// render the supervisor configuration. The ping, heartbeat and request
    /// timeouts all derive from the election timeout divided by the
    /// admit-defeat heartbeat count
    pub fn render(&self) -> String {
        let timeout = self.election_timeout / self.admit_defeat_hearbeat_count.max(1);

        let (master_sysvars, slave_sysvars) = if self.init_tokudb {
            (MASTER_SYSVARS_TOKUDB, SLAVE_SYSVARS_TOKUDB)
        } else {
            (MASTER_SYSVARS, SLAVE_SYSVARS)
        };

        let conf = json!({
            "log": {
                "level": "INFO"
            },
            "server": {
                "endpoint": format!("{}:{}", self.host, XENON_PORT)
            },
            "replication": {
                "passwd": self.replication_password,
                "user": self.replication_user
            },
            "rpc": {
                "request-timeout": timeout
            },
            "mysql": {
                "admit-defeat-ping-count": 3,
                "admin": "root",
                "ping-timeout": timeout,
                "passwd": self.root_password,
                "host": "localhost",
                "version": version_tag(self.mysql_version),
                "master-sysvars": master_sysvars,
                "slave-sysvars": slave_sysvars,
                "port": MYSQL_PORT,
                "monitor-disabled": true
            },
            "raft": {
                "election-timeout": self.election_timeout,
                "admit-defeat-hearbeat-count": self.admit_defeat_hearbeat_count,
                "heartbeat-timeout": timeout,
                "meta-datadir": "/var/lib/xenon/",
                "leader-start-command": "/scripts/leader-start.sh",
                "leader-stop-command": "/scripts/leader-stop.sh",
                "semi-sync-degrade": true,
                "purge-binlog-disabled": true,
                "super-idle": false
            }
        });

        let mut rendered = serde_json::to_string_pretty(&conf)
            .expect("xenon configuration template to serialize to json");
        rendered.push('\n');
        rendered
    }
}

/// returns the version family understood by the supervisor, one of mysql56,
/// mysql57 or mysql80
pub fn version_tag(version: &Version) -> &'static str {
    if version.major == 5 {
        if version.minor == 6 {
            "mysql56"
        } else {
            "mysql57"
        }
    } else {
        "mysql80"
    }
}

// -----------------------------------------------------------------------------
// Tests

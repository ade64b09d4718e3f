//! # Bootstrap command
//!
//! This module provides the one-shot initialization run by the init
//! container, every step is idempotent so a restarted pod converges onto the
//! same files

use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use tracing::info;

use crate::{
    sidecar::{Config, Error, Paths},
    svc::cluster::xenon::XenonTemplate,
};

// -----------------------------------------------------------------------------
// Entrypoint

/// prepare the pod before mysql starts
pub fn run(cfg: &Config, paths: &Paths) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Step 1: a fresh filesystem carries a lost+found directory mysql
    // refuses to start over

    if paths.data.exists() {
        match fs::remove_dir_all(paths.data.join("lost+found")) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                return Err(Error::RemoveLostFound(err));
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Step 2: derive the stable server identity from the pod ordinal

    let server_id = cfg.server_id()?;
    fs::write(
        paths.conf.join("server-id.cnf"),
        format!("[mysqld]\nserver-id={}\n", server_id),
    )
    .map_err(Error::WriteServerId)?;

    // -------------------------------------------------------------------------
    // Step 3: copy the generated mysql configuration from the configuration
    // artifact

    fs::copy(
        paths.config_map.join("node.cnf"),
        paths.conf.join("node.cnf"),
    )
    .map_err(Error::CopyConfiguration)?;

    // -------------------------------------------------------------------------
    // Step 4: install the shell hooks shipped with the configuration
    // artifact, the raft supervisor invokes them on role changes

    install_scripts(&paths.config_map, &paths.scripts).map_err(Error::InstallScripts)?;

    // -------------------------------------------------------------------------
    // Step 5: the tokudb engine requires transparent hugepages to be off on
    // the host

    if cfg.init_tokudb {
        fs::write(paths.sys.join("enabled"), "never").map_err(Error::TransparentHugepage)?;
    }

    // -------------------------------------------------------------------------
    // Step 6: render the raft supervisor configuration with literal
    // credentials

    fs::write(paths.xenon.join("xenon.json"), build_xenon_conf(cfg))
        .map_err(Error::WriteXenonConfiguration)?;

    // -------------------------------------------------------------------------
    // Step 7: emit the statements mysql applies on its first start

    if !cfg.replication_user.is_empty() {
        fs::write(paths.init_file.join("init.sql"), build_init_sql(cfg))
            .map_err(Error::WriteInitSql)?;
    }

    info!(server_id = server_id, "init command success");
    Ok(())
}

// -----------------------------------------------------------------------------
// Helper functions

/// copy every shell script of the configuration artifact into the scripts
/// volume and make it executable
fn install_scripts(config_map: &Path, scripts: &Path) -> Result<(), std::io::Error> {
    for entry in fs::read_dir(config_map)? {
        let path = entry?.path();

        if path.extension().map(|ext| ext == "sh").unwrap_or(false) {
            let file_name = match path.file_name() {
                Some(file_name) => file_name.to_owned(),
                None => continue,
            };
            let target = scripts.join(file_name);

            fs::copy(&path, &target)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
        }
    }

    Ok(())
}

/// render the supervisor configuration from the shared template, literal
/// credentials in place of the operator placeholders
fn build_xenon_conf(cfg: &Config) -> String {
    XenonTemplate {
        host: &cfg.own_hostname(),
        replication_user: &cfg.replication_user,
        replication_password: &cfg.replication_password,
        root_password: &cfg.root_password,
        mysql_version: &cfg.mysql_version,
        admit_defeat_hearbeat_count: cfg.admit_defeat_hearbeat_count,
        election_timeout: cfg.election_timeout,
        init_tokudb: cfg.init_tokudb,
    }
    .render()
}

/// render the statements resetting replication state and recreating the
/// operator users with their grants
fn build_init_sql(cfg: &Config) -> String {
    let mut sql = format!(
        "RESET MASTER;\n\
         SET @@SESSION.SQL_LOG_BIN=0;\n\
         DELETE FROM mysql.user WHERE user='{user}';\n\
         GRANT REPLICATION SLAVE, REPLICATION CLIENT ON *.* to '{user}'@'%' IDENTIFIED BY '{password}';\n",
        user = cfg.replication_user,
        password = cfg.replication_password,
    );

    if !cfg.metrics_user.is_empty() {
        sql.push_str(&format!(
            "DELETE FROM mysql.user WHERE user='{user}';\n\
             GRANT SELECT, PROCESS, REPLICATION CLIENT ON *.* to '{user}'@'localhost' IDENTIFIED BY '{password}';\n",
            user = cfg.metrics_user,
            password = cfg.metrics_password,
        ));
    }

    sql.push_str("FLUSH PRIVILEGES;");
    sql
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn config() -> Config {
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
            mysql_version: semver::Version::parse("5.7.33").unwrap(),
            admit_defeat_hearbeat_count: 5,
            election_timeout: 10000,
        }
    }

    fn paths(root: &Path) -> Paths {
        let paths = Paths {
            conf: root.join("conf.d"),
            config_map: root.join("config-map"),
            scripts: root.join("scripts"),
            xenon: root.join("xenon"),
            init_file: root.join("init-file"),
            data: root.join("data"),
            sys: root.join("sys"),
        };

        for dir in [
            &paths.conf,
            &paths.config_map,
            &paths.scripts,
            &paths.xenon,
            &paths.init_file,
            &paths.data,
            &paths.sys,
        ] {
            fs::create_dir_all(dir).unwrap();
        }

        fs::write(paths.config_map.join("node.cnf"), "[mysqld]\n").unwrap();
        fs::write(paths.config_map.join("leader-start.sh"), "#!/bin/sh\n").unwrap();
        fs::write(paths.config_map.join("leader-stop.sh"), "#!/bin/sh\n").unwrap();

        paths
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let paths = paths(root.path());

        fs::create_dir_all(paths.data.join("lost+found")).unwrap();

        run(&config(), &paths).unwrap();

        let server_id = fs::read(paths.conf.join("server-id.cnf")).unwrap();
        let node_cnf = fs::read(paths.conf.join("node.cnf")).unwrap();
        let xenon = fs::read(paths.xenon.join("xenon.json")).unwrap();
        let init_sql = fs::read(paths.init_file.join("init.sql")).unwrap();

        assert!(!paths.data.join("lost+found").exists());

        run(&config(), &paths).unwrap();

        assert_eq!(fs::read(paths.conf.join("server-id.cnf")).unwrap(), server_id);
        assert_eq!(fs::read(paths.conf.join("node.cnf")).unwrap(), node_cnf);
        assert_eq!(fs::read(paths.xenon.join("xenon.json")).unwrap(), xenon);
        assert_eq!(fs::read(paths.init_file.join("init.sql")).unwrap(), init_sql);
    }

    #[test]
    fn server_identity_follows_the_ordinal() {
        let root = tempfile::tempdir().unwrap();
        let paths = paths(root.path());

        run(&config(), &paths).unwrap();

        let content = fs::read_to_string(paths.conf.join("server-id.cnf")).unwrap();
        assert_eq!(content, "[mysqld]\nserver-id=102\n");
    }

    #[test]
    fn scripts_are_installed_executable() {
        let root = tempfile::tempdir().unwrap();
        let paths = paths(root.path());

        run(&config(), &paths).unwrap();

        for script in ["leader-start.sh", "leader-stop.sh"] {
            let metadata = fs::metadata(paths.scripts.join(script)).unwrap();
            assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
        }

        // node.cnf is not a script and stays out of the scripts volume
        assert!(!paths.scripts.join("node.cnf").exists());
    }

    #[test]
    fn supervisor_configuration_carries_literal_credentials() {
        let root = tempfile::tempdir().unwrap();
        let paths = paths(root.path());

        run(&config(), &paths).unwrap();

        let xenon = fs::read_to_string(paths.xenon.join("xenon.json")).unwrap();
        assert!(xenon.contains(r#""endpoint": "demo-mysql-2.demo-mysql.ns1:8801""#));
        assert!(xenon.contains(r#""user": "qc_repl""#));
        assert!(!xenon.contains("@@"));
    }

    #[test]
    fn init_statements_cover_the_metrics_user_when_configured() {
        let mut cfg = config();
        cfg.metrics_user = "qc_metrics".to_string();
        cfg.metrics_password = "metricspw".to_string();

        let sql = build_init_sql(&cfg);
        assert!(sql.starts_with("RESET MASTER;\n"));
        assert!(sql.contains("GRANT REPLICATION SLAVE, REPLICATION CLIENT ON *.* to 'qc_repl'@'%'"));
        assert!(sql.contains("GRANT SELECT, PROCESS, REPLICATION CLIENT ON *.* to 'qc_metrics'@'localhost'"));
        assert!(sql.ends_with("FLUSH PRIVILEGES;"));

        let without_metrics = build_init_sql(&config());
        assert!(!without_metrics.contains("qc_metrics"));
    }

    #[test]
    fn tokudb_disables_transparent_hugepages() {
        let root = tempfile::tempdir().unwrap();
        let paths = paths(root.path());

        let mut cfg = config();
        cfg.init_tokudb = true;

        run(&cfg, &paths).unwrap();

        assert_eq!(
            fs::read_to_string(paths.sys.join("enabled")).unwrap(),
            "never"
        );
    }
}

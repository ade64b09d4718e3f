//! # Service builders
//!
//! This module provides the builders of the anonymous pod-discovery service
//! and of the two role-routing services

use k8s_openapi::{
    api::core::v1::Service, apimachinery::pkg::util::intstr::IntOrString,
};

use crate::svc::{
    cluster::{
        self, builder::Error, LABEL_ROLE, METRICS_PORT, METRICS_PORT_NAME, MYSQL_PORT,
        MYSQL_PORT_NAME,
    },
    crd::cluster::MysqlCluster,
};

// -----------------------------------------------------------------------------
// Builders

/// converge the anonymous service publishing every pod address, ready or
/// not, so peers can resolve each other while mysql is still initializing
pub fn headless(cluster: &MysqlCluster, service: &mut Service) -> Result<(), Error> {
    service.metadata.labels = Some(cluster::labels(cluster));

    let spec = service.spec.get_or_insert_with(Default::default);

    spec.cluster_ip = Some("None".to_string());
    spec.selector = Some(cluster::selector_labels(cluster));
    spec.publish_not_ready_addresses = Some(true);

    let count = if cluster.spec.metrics.enabled { 2 } else { 1 };
    let ports = spec.ports.get_or_insert_with(Default::default);
    ports.resize_with(count, Default::default);

    ports[0].name = Some(MYSQL_PORT_NAME.to_string());
    ports[0].port = MYSQL_PORT;
    if cluster.spec.metrics.enabled {
        ports[1].name = Some(METRICS_PORT_NAME.to_string());
        ports[1].port = METRICS_PORT;
    }

    Ok(())
}

/// converge the service routing to the raft leader
pub fn leader(cluster: &MysqlCluster, service: &mut Service) -> Result<(), Error> {
    role_routing(cluster, service, "leader")
}

/// converge the service routing to the followers
pub fn follower(cluster: &MysqlCluster, service: &mut Service) -> Result<(), Error> {
    role_routing(cluster, service, "follower")
}

fn role_routing(cluster: &MysqlCluster, service: &mut Service, role: &str) -> Result<(), Error> {
    service.metadata.labels = Some(cluster::labels(cluster));

    let spec = service.spec.get_or_insert_with(Default::default);

    spec.type_ = Some("ClusterIP".to_string());

    let mut selector = cluster::selector_labels(cluster);
    selector.insert(LABEL_ROLE.to_string(), role.to_string());
    spec.selector = Some(selector);

    let ports = spec.ports.get_or_insert_with(Default::default);
    ports.resize_with(1, Default::default);

    ports[0].name = Some(MYSQL_PORT_NAME.to_string());
    ports[0].port = MYSQL_PORT;
    ports[0].target_port = Some(IntOrString::Int(MYSQL_PORT));

    Ok(())
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
    fn headless_service_publishes_not_ready_addresses() {
        let mut service = Service::default();
        headless(&cluster(), &mut service).unwrap();

        let spec = service.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("mysql"));
        assert_eq!(ports[0].port, 3306);
    }

    #[test]
    fn headless_service_grows_a_metrics_port_when_enabled() {
        let mut cluster = cluster();
        cluster.spec.metrics.enabled = true;

        let mut service = Service::default();
        headless(&cluster, &mut service).unwrap();

        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].name.as_deref(), Some("metrics"));
        assert_eq!(ports[1].port, 9104);
    }

    #[test]
    fn routing_services_select_on_the_role_label() {
        let mut service = Service::default();
        leader(&cluster(), &mut service).unwrap();
        let selector = service.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get("role").map(String::as_str), Some("leader"));

        let mut service = Service::default();
        follower(&cluster(), &mut service).unwrap();
        let selector = service.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get("role").map(String::as_str), Some("follower"));
        assert_eq!(
            selector.get("app.kubernetes.io/name").map(String::as_str),
            Some("mysql")
        );
    }

    #[test]
    fn converging_twice_yields_the_same_shape() {
        let mut first = Service::default();
        headless(&cluster(), &mut first).unwrap();

        let mut second = first.to_owned();
        headless(&cluster(), &mut second).unwrap();

        assert_eq!(first, second);
    }
}

//! # Permission builders
//!
//! This module provides the builders of the role and role binding allowing
//! the pods to patch their own role and health labels

use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::ResourceExt;

use crate::svc::{
    cluster::{self, builder::Error, ResourceName},
    crd::cluster::MysqlCluster,
};

// -----------------------------------------------------------------------------
// Builders

/// converge the role granting read and patch access on pods
pub fn role(cluster: &MysqlCluster, role: &mut Role) -> Result<(), Error> {
    role.metadata.labels = Some(cluster::labels(cluster));
    role.rules = Some(vec![PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(vec!["pods".to_string()]),
        verbs: vec!["get".to_string(), "patch".to_string()],
        ..Default::default()
    }]);

    Ok(())
}

/// converge the binding of the role onto the pod service account
pub fn role_binding(cluster: &MysqlCluster, binding: &mut RoleBinding) -> Result<(), Error> {
    binding.metadata.labels = Some(cluster::labels(cluster));
    binding.role_ref = RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "Role".to_string(),
        name: cluster::name_for_resource(ResourceName::Role, &cluster.name_any()),
    };
    binding.subjects = Some(vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: cluster.spec.pod.service_account_name.to_owned(),
        namespace: cluster.namespace(),
        ..Default::default()
    }]);

    Ok(())
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_permits_get_and_patch_on_pods() {
        let mut cluster = MysqlCluster::new("demo", Default::default());
        cluster.metadata.namespace = Some("ns1".to_string());
        cluster.spec.pod.service_account_name = "default".to_string();

        let mut subject = Role::default();
        role(&cluster, &mut subject).unwrap();

        let rules = subject.rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].verbs, vec!["get", "patch"]);
        assert_eq!(rules[0].resources, Some(vec!["pods".to_string()]));

        let mut binding = RoleBinding::default();
        role_binding(&cluster, &mut binding).unwrap();

        assert_eq!(binding.role_ref.name, "demo-role");
        assert_eq!(binding.subjects.unwrap()[0].name, "default");
    }
}

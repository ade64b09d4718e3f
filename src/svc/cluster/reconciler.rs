//! # Reconciliation driver
//!
//! This module provides the reconciler converging every child resource of a
//! mysql cluster in dependency order and maintaining the observed state of
//! the cluster object

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{ConfigMap, Pod, Secret, Service},
    rbac::v1::{Role, RoleBinding},
};
use kube::{
    api::ListParams,
    runtime::{controller, watcher, Controller},
    Api, Resource, ResourceExt,
};
use tracing::{debug, error, info};

use crate::svc::{
    cluster::{self, builder, ResourceName},
    crd::{
        admission,
        cluster::{
            ClusterCondition, ClusterConditionType, ClusterState, ConditionStatus, MysqlCluster,
        },
    },
    k8s::{self, resource, sync, Context, ControllerBuilder},
    status::{self, registry::ClusterKey},
};

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to synchronize child resource, {0}")]
    Sync(sync::Error),
    #[error("failed to validate custom resource, {0}")]
    Admission(admission::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<sync::Error> for ReconcilerError {
    fn from(err: sync::Error) -> Self {
        Self::Sync(err)
    }
}

impl From<controller::Error<Self, watcher::Error>> for ReconcilerError {
    fn from(err: controller::Error<ReconcilerError, watcher::Error>) -> Self {
        Self::Reconcile(err.to_string())
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<MysqlCluster> for Reconciler {
    fn build(&self, context: Arc<Context>) -> Controller<MysqlCluster> {
        Controller::new(Api::all(context.kube.to_owned()), watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<MysqlCluster> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, origin: Arc<MysqlCluster>) -> Result<(), ReconcilerError> {
        let kind = MysqlCluster::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);

        // ---------------------------------------------------------------------
        // Step 1: register the cluster for the health observer and take the
        // per-cluster lock so a key is never processed by both drivers at
        // once

        let entry = ctx.registry.register(ClusterKey::new(&namespace, &name));
        let _guard = entry.lock().await;

        // ---------------------------------------------------------------------
        // Step 2: validate and default the specification in memory

        let mut cluster = (*origin).to_owned();

        match cluster.status {
            None => admission::validate_create(&cluster).map_err(ReconcilerError::Admission)?,
            Some(_) => admission::validate_update(&cluster).map_err(ReconcilerError::Admission)?,
        }
        admission::apply_defaults(&mut cluster);

        let previous = cluster.status.to_owned();

        // ---------------------------------------------------------------------
        // Step 3: converge children in dependency order

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            "Synchronize child resources of custom resource",
        );
        let result = sync_children(&ctx, &mut cluster).await;

        // ---------------------------------------------------------------------
        // Step 4: compose the observed state, best effort even when a child
        // failed, and write it back when it moved

        if let Err(err) = update_status(&ctx, &mut cluster, result.as_ref().err()).await {
            error!(
                kind = &kind,
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Failed to compose status of custom resource",
            );
        }

        if cluster.status != previous {
            debug!(
                kind = &kind,
                namespace = &namespace,
                name = &name,
                "Update status of custom resource",
            );
            if let Err(err) = resource::patch_status(
                ctx.kube.to_owned(),
                &cluster,
                serde_json::json!(cluster.status),
            )
            .await
            {
                error!(
                    kind = &kind,
                    namespace = &namespace,
                    name = &name,
                    error = err.to_string(),
                    "Failed to update status of custom resource",
                );
            }
        }

        result
    }

    async fn delete(ctx: Arc<Context>, origin: Arc<MysqlCluster>) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(&*origin);

        // children carry an owner reference and are garbage collected by the
        // platform, only the observer registration is ours to release
        ctx.registry.unregister(&ClusterKey::new(&namespace, &name));

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// converge every child resource, strictly in dependency order, aborting on
/// the first failure so the event source re-queues the cluster
async fn sync_children(ctx: &Context, cluster: &mut MysqlCluster) -> Result<(), ReconcilerError> {
    let name = cluster.name_any();

    sync::sync::<ConfigMap, _>(
        ctx,
        cluster,
        &cluster::name_for_resource(ResourceName::ConfigMap, &name),
        |config_map| builder::config_map::mutate(cluster, config_map),
    )
    .await?;

    sync::sync::<Secret, _>(
        ctx,
        cluster,
        &cluster::name_for_resource(ResourceName::Secret, &name),
        |secret| builder::secret::mutate(cluster, secret),
    )
    .await?;

    sync::sync::<Role, _>(
        ctx,
        cluster,
        &cluster::name_for_resource(ResourceName::Role, &name),
        |role| builder::rbac::role(cluster, role),
    )
    .await?;

    sync::sync::<RoleBinding, _>(
        ctx,
        cluster,
        &cluster::name_for_resource(ResourceName::RoleBinding, &name),
        |binding| builder::rbac::role_binding(cluster, binding),
    )
    .await?;

    sync::sync::<Service, _>(
        ctx,
        cluster,
        &cluster::name_for_resource(ResourceName::HeadlessService, &name),
        |service| builder::service::headless(cluster, service),
    )
    .await?;

    sync::sync::<Service, _>(
        ctx,
        cluster,
        &cluster::name_for_resource(ResourceName::LeaderService, &name),
        |service| builder::service::leader(cluster, service),
    )
    .await?;

    sync::sync::<Service, _>(
        ctx,
        cluster,
        &cluster::name_for_resource(ResourceName::FollowerService, &name),
        |service| builder::service::follower(cluster, service),
    )
    .await?;

    let statefulset = sync::sync::<StatefulSet, _>(
        ctx,
        cluster,
        &cluster::name_for_resource(ResourceName::StatefulSet, &name),
        |statefulset| builder::statefulset::mutate(cluster, statefulset),
    )
    .await?;

    cluster
        .status
        .get_or_insert_with(Default::default)
        .ready_nodes = statefulset
        .status
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);

    Ok(())
}

/// compose the cluster condition of this reconcile, following the observed
/// ready nodes, the reconcile outcome and the scheduling state of the pods
async fn update_status(
    ctx: &Context,
    cluster: &mut MysqlCluster,
    reconcile_err: Option<&ReconcilerError>,
) -> Result<(), ReconcilerError> {
    let namespace = cluster
        .namespace()
        .expect("cluster to be owned by a namespace");
    let replicas = cluster.spec.replicas.unwrap_or_default();
    let selector = cluster::selector(cluster);

    let status = cluster.status.get_or_insert_with(Default::default);

    if let Some(err) = reconcile_err {
        let mut condition =
            ClusterCondition::new(ClusterConditionType::Error, ConditionStatus::True);
        condition.reason = "ErrorReconcile".to_string();
        condition.message = err.to_string();

        status.state = ClusterState::Error;
        status.push_condition(condition);
        return Ok(());
    }

    if status.ready_nodes == replicas {
        status.state = ClusterState::Ready;
        status.push_condition(ClusterCondition::new(
            ClusterConditionType::Ready,
            ConditionStatus::True,
        ));
        return Ok(());
    }

    let pods = Api::<Pod>::namespaced(ctx.kube.to_owned(), &namespace)
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    match status::unschedulable_message(&pods, Some(status::UNSCHEDULABLE_GRACE)) {
        Some(message) => {
            let mut condition =
                ClusterCondition::new(ClusterConditionType::Error, ConditionStatus::True);
            condition.reason = status::UNSCHEDULABLE_REASON.to_string();
            condition.message = message;

            status.state = ClusterState::Error;
            status.push_condition(condition);
        }
        None => {
            status.state = ClusterState::Initializing;
            status.push_condition(ClusterCondition::new(
                ClusterConditionType::Initializing,
                ConditionStatus::True,
            ));
        }
    }

    Ok(())
}

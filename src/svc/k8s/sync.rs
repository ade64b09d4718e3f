//! # Sync module
//!
//! This module provides the read-modify-write primitive converging one child
//! resource onto its desired shape. It is the only place where side effects
//! on children happen, every create or update stamps an owner reference to
//! the cluster and each outcome is reported as a structured event

use std::fmt::{self, Debug, Display, Formatter};

use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::PostParams,
    Api, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::svc::{
    cluster::builder,
    crd::cluster::MysqlCluster,
    k8s::{recorder, resource, Context},
};

// -----------------------------------------------------------------------------
// Outcome enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    Failed,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Updated => write!(f, "Updated"),
            Self::Unchanged => write!(f, "Unchanged"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
    #[error("failed to build desired resource, {0}")]
    Build(builder::Error),
    #[error("failed to compute diff between the live and desired object, {0}")]
    Diff(serde_json::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Kube(err)
    }
}

impl From<builder::Error> for Error {
    fn from(err: builder::Error) -> Self {
        Self::Build(err)
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// converge the child resource named `name` of the cluster onto the shape
/// produced by the `mutate` closure.
///
/// The live object is fetched first so the closure only overwrites the
/// fields the builder owns, anything else the platform wrote stays
/// untouched. A missing object is created from scratch
pub async fn sync<T, F>(
    ctx: &Context,
    owner: &MysqlCluster,
    name: &str,
    mutate: F,
) -> Result<T, Error>
where
    T: Resource<Scope = NamespaceResourceScope>
        + Default
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug,
    <T as Resource>::DynamicType: Default,
    F: FnOnce(&mut T) -> Result<(), builder::Error>,
{
    let namespace = owner
        .namespace()
        .expect("cluster to be owned by a namespace");
    let kind = T::kind(&<T as Resource>::DynamicType::default()).to_string();
    let api: Api<T> = Api::namespaced(ctx.kube.to_owned(), &namespace);

    let result = match api.get_opt(name).await? {
        Some(live) => update(ctx, owner, &kind, name, live, mutate).await,
        None => create(&api, owner, &kind, name, mutate).await,
    };

    match &result {
        Ok((_, outcome)) => {
            info!(
                kind = &kind,
                namespace = &namespace,
                name = name,
                outcome = outcome.to_string(),
                "Synchronized child resource of cluster",
            );

            if *outcome != Outcome::Unchanged {
                let message = &format!("{} {} '{}'", outcome, kind, name);
                if let Err(err) =
                    recorder::normal(ctx.kube.to_owned(), owner, outcome, message).await
                {
                    debug!(
                        error = err.to_string(),
                        "could not record event for child resource",
                    );
                }
            }
        }
        Err(err) => {
            let message = &format!("{} {} '{}', {}", Outcome::Failed, kind, name, err);
            if let Err(err) =
                recorder::warning(ctx.kube.to_owned(), owner, &Outcome::Failed, message).await
            {
                debug!(
                    error = err.to_string(),
                    "could not record event for child resource",
                );
            }
        }
    }

    result.map(|(obj, _)| obj)
}

async fn create<T, F>(
    api: &Api<T>,
    owner: &MysqlCluster,
    kind: &str,
    name: &str,
    mutate: F,
) -> Result<(T, Outcome), Error>
where
    T: Resource<Scope = NamespaceResourceScope>
        + Default
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug,
    <T as Resource>::DynamicType: Default,
    F: FnOnce(&mut T) -> Result<(), builder::Error>,
{
    debug!(kind = kind, name = name, "create child resource of cluster");

    let mut desired = T::default();

    desired.meta_mut().name = Some(name.to_string());
    desired.meta_mut().namespace = owner.namespace();
    mutate(&mut desired)?;
    stamp_owner(&mut desired, owner);

    let created = api.create(&PostParams::default(), &desired).await?;
    Ok((created, Outcome::Created))
}

async fn update<T, F>(
    ctx: &Context,
    owner: &MysqlCluster,
    kind: &str,
    name: &str,
    live: T,
    mutate: F,
) -> Result<(T, Outcome), Error>
where
    T: Resource<Scope = NamespaceResourceScope>
        + Default
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug,
    <T as Resource>::DynamicType: Default,
    F: FnOnce(&mut T) -> Result<(), builder::Error>,
{
    let mut desired = live.to_owned();

    mutate(&mut desired)?;
    stamp_owner(&mut desired, owner);

    let patch = resource::diff(&live, &desired).map_err(Error::Diff)?;
    if patch.0.is_empty() {
        debug!(kind = kind, name = name, "child resource of cluster is up to date");
        return Ok((live, Outcome::Unchanged));
    }

    let patched = resource::patch(ctx.kube.to_owned(), &desired, patch).await?;
    Ok((patched, Outcome::Updated))
}

/// add an owner reference to the cluster on the object unless one is already
/// there
fn stamp_owner<T>(obj: &mut T, owner: &MysqlCluster)
where
    T: Resource,
{
    let reference = resource::owner_reference(owner);
    let references = obj.meta_mut().owner_references.get_or_insert_with(Vec::new);

    if !references.iter().any(|r| r.uid == reference.uid) {
        references.push(reference);
    }
}

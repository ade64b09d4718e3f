//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{path::PathBuf, process::abort, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};

use crate::svc::{
    cfg::Configuration,
    cluster::reconciler::Reconciler,
    http,
    k8s::{client, Context, Watcher},
    status::{self, registry::Registry},
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// CommandError enum

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<CommandError>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::CustomResourceDefinitionError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with the custom resource definition
    #[command(name = "custom-resource-definition", alias = "crd", subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
}

#[async_trait]
impl Executor for Command {
    type Error = CommandError;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(CommandError::CustomResourceDefinition)
                .map_err(|err| {
                    CommandError::Execution("custom-resource-definition".into(), Arc::new(err))
                }),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to handle termination signal, {0}")]
    SigTerm(std::io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Create the context shared by the reconciliation driver and the health
    // observer, the registry carries the per-cluster locks between them
    let context = Arc::new(Context::new(
        kube_client,
        config.to_owned(),
        Registry::default(),
    ));

    // -------------------------------------------------------------------------
    // Create drivers
    let reconciler_context = context.to_owned();
    let observer_context = context.to_owned();

    let handles = vec![
        tokio::spawn(async move {
            let reconciler = Reconciler::default();

            info!("Start to listen for events of mysql cluster custom resource");
            if let Err(err) = reconciler.watch(reconciler_context).await {
                error!(
                    error = err.to_string(),
                    "Could not reconcile mysql cluster custom resource",
                );
            }

            abort();
        }),
        tokio::spawn(async move {
            info!("Start the cluster health observer");
            status::run(observer_context).await;
        }),
    ];

    // -------------------------------------------------------------------------
    // Create http server
    let server = tokio::spawn(async move {
        if let Err(err) = http::serve(config).await {
            error!(error = err.to_string(), "Could not serve http server");
            abort();
        }
    });

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c()
        .await
        .map_err(DaemonError::SigTerm)?;

    // -------------------------------------------------------------------------
    // Cancel drivers
    handles.iter().for_each(|handle| handle.abort());

    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(
                    error = err.to_string(),
                    "Could not wait for the task to complete",
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cancel http server
    server.abort();
    if let Err(err) = server.await {
        if !err.is_cancelled() {
            error!(
                error = err.to_string(),
                "Could not wait for the http server to gracefully close",
            );
        }
    }

    Ok(())
}

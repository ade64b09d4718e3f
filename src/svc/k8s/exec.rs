//! # Exec module
//!
//! This module provides the in-pod command executor used by the health
//! observer to query the raft supervisor and to apply remediations

use k8s_openapi::api::core::v1::Pod;
use kube::{api::AttachParams, Api, Client};
use tokio::io::AsyncReadExt;
use tracing::debug;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command in pod, {0}")]
    Kube(kube::Error),
    #[error("failed to read command output, {0}")]
    Read(std::io::Error),
    #[error("command exited unsuccessfully, {0}")]
    Failed(String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Kube(err)
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// execute the command in the given container of the pod and return its
/// standard output
pub async fn command_stdout(
    client: Client,
    namespace: &str,
    pod: &str,
    container: &str,
    command: &[&str],
) -> Result<String, Error> {
    debug!(
        namespace = namespace,
        pod = pod,
        container = container,
        command = command.join(" "),
        "execute command in pod",
    );

    let api: Api<Pod> = Api::namespaced(client, namespace);
    let params = AttachParams::default()
        .container(container)
        .stdout(true)
        .stderr(false);

    let mut attached = api.exec(pod, command.iter().copied(), &params).await?;

    let mut output = String::new();
    if let Some(mut stdout) = attached.stdout() {
        stdout
            .read_to_string(&mut output)
            .await
            .map_err(Error::Read)?;
    }

    let status = match attached.take_status() {
        Some(status) => status.await,
        None => None,
    };

    attached
        .join()
        .await
        .map_err(|err| Error::Failed(err.to_string()))?;

    if let Some(status) = status {
        if status.status.as_deref() != Some("Success") {
            return Err(Error::Failed(
                status
                    .message
                    .unwrap_or_else(|| "command returned a non-success status".to_string()),
            ));
        }
    }

    Ok(output)
}

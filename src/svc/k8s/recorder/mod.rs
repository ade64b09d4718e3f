//! # Event recorder module
//!
//! This module provide an alternative to the golang EventRecorder structure
//!
//! See following links for more details:
//! - <https://book-v1.book.kubebuilder.io/beyond_basics/creating_events.html>
//! - <https://github.com/kubernetes/client-go/blob/master/tools/record/event.go#L56>

use std::fmt::{self, Debug, Display, Formatter};

use k8s_openapi::api::core::v1::Event;
use kube::{
    api::PostParams,
    Api, Client, CustomResourceExt, ResourceExt,
};
use tracing::debug;

pub mod event;

// -----------------------------------------------------------------------------
// Level enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper methods

/// record an event for the given object
pub async fn record<T, U>(
    client: Client,
    obj: &T,
    kind: &Level,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + CustomResourceExt + Debug,
    U: ToString + Debug,
{
    let namespace = obj
        .namespace()
        .expect("resource to be owned by a namespace");

    debug!(
        "Create '{}' event for resource '{}/{}', {}",
        action.to_string(),
        &namespace,
        &obj.name_any(),
        message
    );

    let event = event::new(obj, kind, action, message);
    let api: Api<Event> = Api::namespaced(client, &namespace);

    match api.create(&PostParams::default(), &event).await {
        // another worker already recorded the very same event in the same
        // second, keep the first one
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(event),
        result => result,
    }
}

/// shortcut for the [`record`] method with the 'Normal' [`Level`]
pub async fn normal<T, U>(
    client: Client,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + CustomResourceExt + Debug,
    U: ToString + Debug,
{
    record(client, obj, &Level::Normal, action, message).await
}

/// shortcut for the [`record`] method with the 'Warning' [`Level`]
pub async fn warning<T, U>(
    client: Client,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: ResourceExt + CustomResourceExt + Debug,
    U: ToString + Debug,
{
    record(client, obj, &Level::Warning, action, message).await
}

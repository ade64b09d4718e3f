//! # Builder module
//!
//! This module provides the builders producing the desired shape of every
//! child resource of a cluster. Builders only mutate the fields they own on
//! a possibly live object, all side effects live in the sync primitive

use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, ObjectFieldSelector, SecretKeySelector,
};

pub mod config_map;
pub mod container;
pub mod rbac;
pub mod secret;
pub mod service;
pub mod statefulset;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse persistence size '{0}' as a kubernetes quantity")]
    InvalidPersistenceSize(String),
    #[error("no container recipe is registered under the name '{0}'")]
    UnknownContainer(String),
}

// -----------------------------------------------------------------------------
// Helper functions

/// returns an environment variable fed from a key of the identity store
pub(crate) fn env_from_secret(secret: &str, name: &str, key: &str, optional: bool) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: Some(optional),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// returns an environment variable fed from a field of the pod itself
pub(crate) fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// returns a plain environment variable
pub(crate) fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

//! # Service module
//!
//! This module provides the operator services, from the custom resource and
//! its builders to the kubernetes plumbing and the health observer

pub mod cfg;
pub mod cluster;
pub mod crd;
pub mod http;
pub mod k8s;
pub mod mysql;
pub mod status;

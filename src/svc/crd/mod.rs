//! # Custom resource module
//!
//! This module provides the mysql cluster custom resource, its defaulting
//! logic and the admission slots

pub mod admission;
pub mod cluster;

//! # MySQL operator
//!
//! A kubernetes operator that deploys highly-available mysql clusters driven
//! by the xenon raft supervisor, alongside the in-pod sidecar that prepares
//! each node before mysql starts

pub mod cmd;
pub mod logging;
pub mod sidecar;
pub mod svc;

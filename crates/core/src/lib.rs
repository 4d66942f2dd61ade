//! The chainrunner core library.
//!
//! This crate manages clusters of local nodes: bootstrapping a chain, configuring and starting
//! its nodes and waiting for the cluster to converge.

pub mod cluster;
pub mod wait;

pub use cluster::{BootstrapConfiguration, Cluster, FlagValue};
pub use wait::{FinalizationMode, WaitOptions};

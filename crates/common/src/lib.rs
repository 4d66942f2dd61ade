//! This crate provides the error taxonomy, polling, allocation and file system helpers that the
//! other crates in the workspace share.

pub mod error;
pub mod fs;
pub mod futures;
pub mod types;

pub use error::{Error, Result};

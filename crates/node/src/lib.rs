//! This crate implements the control of single nodes: their processes, flags, RPC status, keys
//! and chain specs.

pub mod chainspec;
pub mod flags;
pub mod keys;
pub mod node;
pub mod process;
pub mod status;

pub use flags::{Flags, NodeFlag};
pub use keys::{AccountId, AccountKeys, generate_keys};
pub use node::Node;
pub use status::{NodeStatus, Observed, StatusCache};

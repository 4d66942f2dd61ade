//! This crate implements all interactions with a running node: plain JSON-RPC requests over
//! HTTP and sudo extrinsics submitted over the websocket endpoint.

pub mod rpc;
pub mod sudo;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use rpc::{RpcClient, RpcErrorObject, RpcResponse};
pub use sudo::{ExtrinsicReceipt, SudoClient};

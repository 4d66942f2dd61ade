use std::time::Duration;

use thiserror::Error;

/// The errors that the cluster, the node controllers and the chain-spec mutator can report.
///
/// Transient RPC failures observed while polling node status never surface as an [`Error`]; they
/// are answered from the node's status cache instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A required flag or port is missing from a node's configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The operation is not valid for the current running or stopped state of the node.
    #[error("invalid operation for the current process state: {0}")]
    ProcessLifecycle(String),

    /// The RPC endpoint could not be reached.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The endpoint answered with a malformed response or with an application level error.
    #[error("rpc request failed: {message}")]
    RpcProtocol { code: Option<i64>, message: String },

    /// A wait routine exhausted its time budget.
    #[error("timed out after {elapsed:?} while waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// The chain spec is not valid JSON or lacks a field that is being edited.
    #[error("chain spec error: {0}")]
    ChainSpec(String),

    /// An auxiliary invocation of the node binary failed.
    #[error("`{command}` failed: {reason}")]
    Process { command: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn process_lifecycle(message: impl Into<String>) -> Self {
        Self::ProcessLifecycle(message.into())
    }

    pub fn chain_spec(message: impl Into<String>) -> Self {
        Self::ChainSpec(message.into())
    }

    /// Returns `true` for the errors that a later attempt of the same read could recover from.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::RpcProtocol { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rpc_failures_are_transient() {
        let connection = Error::Connection {
            endpoint: "http://localhost:9944/".into(),
            reason: "connection refused".into(),
        };
        let protocol = Error::RpcProtocol {
            code: Some(-32601),
            message: "Method not found".into(),
        };

        assert!(connection.is_transient());
        assert!(protocol.is_transient());
        assert!(!Error::configuration("rpc port unknown").is_transient());
        assert!(!Error::chain_spec("missing genesis").is_transient());
    }

    #[test]
    fn timeout_message_names_the_wait() {
        let error = Error::Timeout {
            what: "finalization".into(),
            elapsed: Duration::from_secs(3),
        };

        assert_eq!(
            error.to_string(),
            "timed out after 3s while waiting for finalization"
        );
    }
}

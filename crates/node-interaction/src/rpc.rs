//! A minimal JSON-RPC 2.0 client.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chainrunner_common::{Error, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::trace;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// The error object of a JSON-RPC response.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A well formed JSON-RPC response: either a result (which may be `null`) or an error object.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcResponse {
    Ok(Value),
    Error(RpcErrorObject),
}

impl RpcResponse {
    /// Interprets a decoded response body.
    pub fn from_body(mut body: Value) -> Result<Self> {
        let Some(object) = body.as_object_mut() else {
            return Err(malformed(format!("expected an object, got {body}")));
        };
        if let Some(result) = object.remove("result") {
            return Ok(Self::Ok(result));
        }
        match object.remove("error") {
            Some(error) => serde_json::from_value(error)
                .map(Self::Error)
                .map_err(|error| malformed(format!("invalid error object: {error}"))),
            None => Err(malformed(format!(
                "response carries neither result nor error: {body}"
            ))),
        }
    }

    /// Turns an error response into [`Error::RpcProtocol`].
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Error(RpcErrorObject { code, message, .. }) => Err(Error::RpcProtocol {
                code: Some(code),
                message,
            }),
        }
    }
}

/// Sends requests to a single HTTP endpoint.
#[derive(Debug)]
pub struct RpcClient {
    endpoint: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        }
    }

    /// A client for the RPC server of a node listening on `localhost:{port}`.
    pub fn localhost(port: u16) -> Self {
        Self::new(format!("http://localhost:{port}/"))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends one request and returns the response as is.
    ///
    /// Transport failures (refused connection, timeout) become [`Error::Connection`], bodies that
    /// are not JSON-RPC responses become [`Error::RpcProtocol`]. An error object sent back by the
    /// node is a successful call that yields [`RpcResponse::Error`].
    pub async fn request(&self, method: &str, params: Value) -> Result<RpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if !params.is_null() {
            request["params"] = params;
        }
        trace!(endpoint = %self.endpoint, %method, id, "Sending rpc request");

        let response = HTTP_CLIENT
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|error| self.connection_error(error))?;
        let body = response
            .bytes()
            .await
            .map_err(|error| self.connection_error(error))?;
        let body: Value = serde_json::from_slice(&body)
            .map_err(|error| malformed(format!("{method}: response is not json: {error}")))?;

        RpcResponse::from_body(body)
    }

    /// Sends one request and returns the result, treating an error object as a failure.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.request(method, params).await?.into_result()
    }

    /// Like [`RpcClient::call`] but decodes the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|error| malformed(format!("{method}: unexpected result: {error}")))
    }

    fn connection_error(&self, error: reqwest::Error) -> Error {
        Error::Connection {
            endpoint: self.endpoint.clone(),
            reason: error.to_string(),
        }
    }
}

fn malformed(message: String) -> Error {
    Error::RpcProtocol {
        code: None,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RpcStub;

    #[test]
    fn null_result_is_a_valid_response() {
        let response = RpcResponse::from_body(json!({"jsonrpc": "2.0", "id": 1, "result": null}))
            .expect("well formed");
        assert_eq!(response, RpcResponse::Ok(Value::Null));
    }

    #[test]
    fn error_object_is_kept_apart_from_results() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32601, "message": "Method not found"}
        });
        let response = RpcResponse::from_body(body).expect("well formed");
        let RpcResponse::Error(error) = &response else {
            panic!("expected an error response, got {response:?}");
        };
        assert_eq!(error.code, -32601);
        assert_eq!(error.data, None);

        match response.into_result() {
            Err(Error::RpcProtocol { code, message }) => {
                assert_eq!(code, Some(-32601));
                assert_eq!(message, "Method not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bodies_without_result_or_error_are_protocol_errors() {
        for body in [json!({"jsonrpc": "2.0", "id": 1}), json!([1, 2]), json!("text")] {
            assert!(matches!(
                RpcResponse::from_body(body),
                Err(Error::RpcProtocol { code: None, .. })
            ));
        }
    }

    #[tokio::test]
    async fn results_and_error_objects_are_read_from_the_server() {
        let stub = RpcStub::serve(|method, params| match method {
            "chain_getBlockHash" => Ok(json!(format!("0xhash{}", params[0]))),
            "system_version" if params.is_null() => Ok(json!("5.0.0-dev")),
            other => Err(format!("{other} is not served")),
        })
        .unwrap();
        let client = RpcClient::localhost(stub.port());

        assert_eq!(
            client.call("chain_getBlockHash", json!([7])).await.unwrap(),
            json!("0xhash7")
        );
        let version: String = client.call_as("system_version", Value::Null).await.unwrap();
        assert_eq!(version, "5.0.0-dev");

        let error = match client.request("author_rotateKeys", Value::Null).await {
            Ok(RpcResponse::Error(error)) => error,
            other => panic!("expected an error object, got {other:?}"),
        };
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "author_rotateKeys is not served");
    }

    #[tokio::test]
    async fn refused_connection_is_reported_as_connection_error() {
        let client = RpcClient::localhost(1);
        let error = client
            .call("chain_getFinalizedHead", Value::Null)
            .await
            .expect_err("nothing listens on port 1");
        assert!(error.is_transient());
        assert!(matches!(
            error,
            Error::Connection { endpoint, .. } if endpoint == "http://localhost:1/"
        ));
    }
}

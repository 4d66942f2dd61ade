//! Sudo extrinsics submitted through a node's websocket RPC endpoint.

use chainrunner_common::{Error, Result};
use serde::Serialize;
use subxt::dynamic::Value;
use subxt::tx::TxStatus;
use subxt::{OnlineClient, SubstrateConfig};
use subxt_signer::SecretUri;
use subxt_signer::sr25519::Keypair;
use tracing::{debug, info, instrument, warn};

/// The outcome of a submitted extrinsic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExtrinsicReceipt {
    pub success: bool,
    pub extrinsic_hash: Option<String>,
    pub block_hash: Option<String>,
    pub error_message: Option<String>,
}

impl ExtrinsicReceipt {
    fn included(extrinsic_hash: String, block_hash: String) -> Self {
        Self {
            success: true,
            extrinsic_hash: Some(extrinsic_hash),
            block_hash: Some(block_hash),
            error_message: None,
        }
    }

    fn failed(
        extrinsic_hash: Option<String>,
        block_hash: Option<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            extrinsic_hash,
            block_hash,
            error_message: Some(error_message.into()),
        }
    }
}

/// A connection to one node, signing with the sudo key.
pub struct SudoClient {
    endpoint: String,
    api: OnlineClient<SubstrateConfig>,
    signer: Keypair,
}

impl SudoClient {
    /// Connects to `endpoint` (a `ws://` url) and derives the sudo key from `sudo_phrase`, which
    /// may be a dev phrase such as `//Alice` or a mnemonic with optional derivation junctions.
    pub async fn connect(endpoint: impl Into<String>, sudo_phrase: &str) -> Result<Self> {
        let endpoint = endpoint.into();
        let signer = keypair_from_phrase(sudo_phrase)?;
        let api = OnlineClient::<SubstrateConfig>::from_url(&endpoint)
            .await
            .map_err(|error| Error::Connection {
                endpoint: endpoint.clone(),
                reason: error.to_string(),
            })?;
        Ok(Self {
            endpoint,
            api,
            signer,
        })
    }

    /// A client for the node whose RPC server listens on `localhost:{port}`.
    pub async fn localhost(port: u16, sudo_phrase: &str) -> Result<Self> {
        Self::connect(format!("ws://localhost:{port}"), sudo_phrase).await
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Replaces the runtime code with `runtime`.
    #[instrument(level = "info", skip_all, fields(endpoint = %self.endpoint, size = runtime.len()))]
    pub async fn set_code(&self, runtime: &[u8]) -> Result<ExtrinsicReceipt> {
        let call = runtime_call("System", "set_code", [("code", Value::from_bytes(runtime))]);
        self.submit_as_sudo(call).await
    }

    /// The finality version currently stored on chain.
    pub async fn finality_version(&self) -> Result<u32> {
        let address = subxt::dynamic::storage("Aleph", "FinalityVersion", ());
        let stored = self
            .api
            .storage()
            .at_latest()
            .await
            .map_err(protocol_error)?
            .fetch(&address)
            .await
            .map_err(protocol_error)?;
        let Some(stored) = stored else {
            return Ok(0);
        };
        let value = stored.to_value().map_err(protocol_error)?;
        value
            .as_u128()
            .and_then(|version| u32::try_from(version).ok())
            .ok_or_else(|| Error::RpcProtocol {
                code: None,
                message: format!("unexpected finality version {value}"),
            })
    }

    /// Schedules a change to the next finality version at the start of `session`.
    #[instrument(level = "info", skip(self), fields(endpoint = %self.endpoint))]
    pub async fn schedule_finality_version_change(&self, session: u32) -> Result<ExtrinsicReceipt> {
        let current = self.finality_version().await?;
        let next = current.saturating_add(1);
        info!(current, next, "Scheduling finality version change");
        let call = runtime_call(
            "Aleph",
            "schedule_finality_version_change",
            [
                ("version_incoming", Value::u128(next.into())),
                ("session", Value::u128(session.into())),
            ],
        );
        self.submit_as_sudo(call).await
    }

    /// Wraps `call` in `Sudo::sudo_unchecked_weight` with zero weight, submits it and follows it
    /// until it lands in a block or is rejected.
    async fn submit_as_sudo(&self, call: Value) -> Result<ExtrinsicReceipt> {
        let zero_weight = Value::named_composite([
            ("ref_time", Value::u128(0)),
            ("proof_size", Value::u128(0)),
        ]);
        let payload =
            subxt::dynamic::tx("Sudo", "sudo_unchecked_weight", vec![call, zero_weight]);

        let mut progress = match self
            .api
            .tx()
            .sign_and_submit_then_watch_default(&payload, &self.signer)
            .await
        {
            Ok(progress) => progress,
            Err(error) => {
                warn!(%error, "Extrinsic submission failed");
                return Ok(ExtrinsicReceipt::failed(None, None, error.to_string()));
            }
        };
        let extrinsic_hash = format!("{:?}", progress.extrinsic_hash());
        debug!(%extrinsic_hash, "Extrinsic submitted");

        while let Some(status) = progress.next().await {
            let status = match status {
                Ok(status) => status,
                Err(error) => {
                    return Ok(ExtrinsicReceipt::failed(
                        Some(extrinsic_hash),
                        None,
                        error.to_string(),
                    ));
                }
            };
            match status {
                TxStatus::InBestBlock(in_block) | TxStatus::InFinalizedBlock(in_block) => {
                    let block_hash = format!("{:?}", in_block.block_hash());
                    let receipt = match in_block.wait_for_success().await {
                        Ok(_) => ExtrinsicReceipt::included(extrinsic_hash, block_hash),
                        Err(error) => ExtrinsicReceipt::failed(
                            Some(extrinsic_hash),
                            Some(block_hash),
                            error.to_string(),
                        ),
                    };
                    info!(?receipt, "Extrinsic included");
                    return Ok(receipt);
                }
                TxStatus::Error { message }
                | TxStatus::Invalid { message }
                | TxStatus::Dropped { message } => {
                    warn!(%extrinsic_hash, %message, "Extrinsic rejected");
                    return Ok(ExtrinsicReceipt::failed(Some(extrinsic_hash), None, message));
                }
                _ => {}
            }
        }

        Ok(ExtrinsicReceipt::failed(
            Some(extrinsic_hash),
            None,
            "status subscription ended before the extrinsic was included",
        ))
    }
}

/// Builds a runtime call value: the pallet variant wrapping the call variant with named fields.
fn runtime_call<const N: usize>(
    pallet: &str,
    call: &str,
    fields: [(&str, Value); N],
) -> Value {
    Value::unnamed_variant(pallet, [Value::named_variant(call, fields)])
}

fn keypair_from_phrase(phrase: &str) -> Result<Keypair> {
    let uri: SecretUri = phrase
        .parse()
        .map_err(|error| Error::configuration(format!("invalid sudo phrase: {error}")))?;
    Keypair::from_uri(&uri)
        .map_err(|error| Error::configuration(format!("invalid sudo phrase: {error}")))
}

fn protocol_error(error: impl std::fmt::Display) -> Error {
    Error::RpcProtocol {
        code: None,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use subxt::ext::scale_value::{Composite, ValueDef};

    use super::*;

    #[test]
    fn dev_phrases_derive_keys() {
        let alice = keypair_from_phrase("//Alice").expect("valid dev phrase");
        let bob = keypair_from_phrase("//Bob").expect("valid dev phrase");
        assert_ne!(alice.public_key().0, bob.public_key().0);
    }

    #[test]
    fn runtime_call_nests_call_inside_pallet_variant() {
        let call = runtime_call("System", "set_code", [("code", Value::from_bytes([0u8, 1]))]);
        let ValueDef::Variant(pallet) = &call.value else {
            panic!("expected a variant, got {call:?}");
        };
        assert_eq!(pallet.name, "System");
        let Composite::Unnamed(inner) = &pallet.values else {
            panic!("pallet variant must wrap the call positionally");
        };
        let ValueDef::Variant(set_code) = &inner[0].value else {
            panic!("expected the call variant");
        };
        assert_eq!(set_code.name, "set_code");
        assert!(matches!(&set_code.values, Composite::Named(fields) if fields[0].0 == "code"));
    }

    #[test]
    fn failed_receipt_carries_the_message() {
        let receipt = ExtrinsicReceipt::failed(Some("0x01".into()), None, "Invalid");
        assert!(!receipt.success);
        assert_eq!(receipt.error_message.as_deref(), Some("Invalid"));
        assert_eq!(receipt.block_hash, None);
    }
}

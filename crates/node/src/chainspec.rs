//! Edits of chain spec files. An edited spec is always written to a new file so that the source
//! spec stays available; every field other than the edited one is written back untouched.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use chainrunner_common::{Error, Result};
use serde_json::{Map, Value as JsonValue};
use tracing::info;

/// Storage key of the runtime code, `:code` hex encoded.
pub const CODE_STORAGE_KEY: &str = "0x3a636f6465";

/// Writes to `output_path` a copy of the spec at `spec_path` whose `codeSubstitutes` map holds
/// exactly one entry: `block` mapped to `runtime`.
pub fn set_code_substitute(
    spec_path: &Path,
    block: &str,
    runtime: &[u8],
    output_path: &Path,
) -> Result<()> {
    let mut chainspec = read_chainspec(spec_path)?;
    with_code_substitute(&mut chainspec, block, runtime)?;
    write_chainspec(&chainspec, output_path)?;
    info!(block, output = %output_path.display(), "Code substitute set");
    Ok(())
}

/// Writes to `output_path` a copy of the spec at `spec_path` with its genesis runtime code
/// replaced by `runtime`.
pub fn set_genesis_code(spec_path: &Path, runtime: &[u8], output_path: &Path) -> Result<()> {
    let mut chainspec = read_chainspec(spec_path)?;
    with_genesis_code(&mut chainspec, runtime)?;
    write_chainspec(&chainspec, output_path)?;
    info!(output = %output_path.display(), "Genesis code set");
    Ok(())
}

pub fn with_code_substitute(chainspec: &mut JsonValue, block: &str, runtime: &[u8]) -> Result<()> {
    let root = chainspec
        .as_object_mut()
        .ok_or_else(|| Error::chain_spec("the chain spec is not a json object"))?;
    let mut substitutes = Map::new();
    substitutes.insert(block.to_owned(), JsonValue::String(encode(runtime)));
    root.insert("codeSubstitutes".to_owned(), JsonValue::Object(substitutes));
    Ok(())
}

/// Replaces the genesis code of a plain spec (`genesis.runtime.system.code` or
/// `genesis.runtimeGenesis.code`) or of a raw one (`genesis.raw.top[":code"]`).
pub fn with_genesis_code(chainspec: &mut JsonValue, runtime: &[u8]) -> Result<()> {
    let code = JsonValue::String(encode(runtime));
    let genesis = chainspec
        .get_mut("genesis")
        .and_then(JsonValue::as_object_mut)
        .ok_or_else(|| Error::chain_spec("missing `genesis` object"))?;

    if let Some(system) = genesis
        .get_mut("runtime")
        .and_then(|runtime| runtime.get_mut("system"))
        .and_then(JsonValue::as_object_mut)
    {
        system.insert("code".to_owned(), code);
    } else if let Some(runtime_genesis) = genesis
        .get_mut("runtimeGenesis")
        .and_then(JsonValue::as_object_mut)
    {
        runtime_genesis.insert("code".to_owned(), code);
    } else if let Some(top) = genesis
        .get_mut("raw")
        .and_then(|raw| raw.get_mut("top"))
        .and_then(JsonValue::as_object_mut)
    {
        top.insert(CODE_STORAGE_KEY.to_owned(), code);
    } else {
        return Err(Error::chain_spec(
            "genesis carries neither `runtime.system`, `runtimeGenesis` nor `raw.top`",
        ));
    }
    Ok(())
}

fn encode(runtime: &[u8]) -> String {
    format!("0x{}", hex::encode(runtime))
}

fn read_chainspec(path: &Path) -> Result<JsonValue> {
    let content = std::fs::read(path).map_err(|error| {
        Error::chain_spec(format!("failed to read {}: {error}", path.display()))
    })?;
    serde_json::from_slice(&content).map_err(|error| {
        Error::chain_spec(format!("{} is not valid json: {error}", path.display()))
    })
}

fn write_chainspec(chainspec: &JsonValue, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, chainspec).map_err(|error| {
        Error::chain_spec(format!("failed to write {}: {error}", path.display()))
    })?;
    writer.flush()?;
    Ok(())
}

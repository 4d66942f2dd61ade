use std::path::Path;

use anyhow::{Context, bail};
use chainrunner_config::{Arguments, Command, RunArguments, SudoArguments};
use chainrunner_core::{BootstrapConfiguration, Cluster, FinalizationMode, FlagValue};
use chainrunner_node::{AccountId, chainspec, generate_keys};
use chainrunner_node_interaction::{ExtrinsicReceipt, SudoClient};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let arguments = Arguments::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build the tokio runtime")?
        .block_on(execute(arguments))
}

async fn execute(arguments: Arguments) -> anyhow::Result<()> {
    let binary = arguments.binary();
    match &arguments.command {
        Command::Run(run) => run_cluster(arguments.directory(), &binary, run).await,
        Command::Keys { phrases } => {
            let keys = generate_keys(&binary, phrases)?;
            for (phrase, account) in keys.iter() {
                println!("{phrase}: {account}");
            }
            Ok(())
        }
        Command::SetCodeSubstitute {
            old_chainspec,
            new_chainspec,
            block,
            runtime,
        } => {
            let runtime = read_runtime(runtime)?;
            chainspec::set_code_substitute(old_chainspec, block, &runtime, new_chainspec)?;
            Ok(())
        }
        Command::SetGenesisCode {
            chainspec: path,
            runtime,
            output,
        } => {
            let runtime = read_runtime(runtime)?;
            chainspec::set_genesis_code(path, &runtime, output)?;
            Ok(())
        }
        Command::SendRuntime { runtime, sudo } => {
            let runtime = read_runtime(runtime)?;
            let receipt = sudo_client(sudo).await?.set_code(&runtime).await?;
            report(receipt)
        }
        Command::BumpFinalityVersion { session, sudo } => {
            let receipt = sudo_client(sudo)
                .await?
                .schedule_finality_version_change(*session)
                .await?;
            report(receipt)
        }
    }
}

/// Bootstraps a chain of validators (and optional non-validators), starts it, waits for the
/// first finalized blocks and leaves the nodes running.
async fn run_cluster(
    working_directory: &Path,
    binary: &Path,
    run: &RunArguments,
) -> anyhow::Result<()> {
    let total = run.nodes + run.nonvalidators;
    if run.nodes == 0 {
        bail!("at least one validator is needed");
    }
    if run.phrases.len() < total {
        bail!(
            "{total} nodes requested but only {} seed phrases given",
            run.phrases.len()
        );
    }

    let keys = generate_keys(binary, &run.phrases[..total])?;
    let accounts: Vec<AccountId> = keys.accounts().cloned().collect();

    let mut cluster = Cluster::new(working_directory)?;
    let configuration = BootstrapConfiguration {
        binary: binary.to_path_buf(),
        validators: accounts[..run.nodes].to_vec(),
        nonvalidators: accounts[run.nodes..].to_vec(),
        sudo_account: accounts.first().cloned(),
        chain_type: Some(run.chain_type),
        millisecs_per_block: run.millisecs_per_block,
        session_period: run.session_period,
        ports: run.ports,
    };
    info!(validators = run.nodes, nonvalidators = run.nonvalidators, "Bootstrapping the chain");
    cluster.bootstrap(&configuration)?;

    cluster.set_validator_flags([("validator", FlagValue::Switch)])?;
    cluster.set_flags([
        ("no-mdns", FlagValue::Switch),
        ("rpc-cors", FlagValue::value("all")),
        ("rpc-methods", FlagValue::value("Unsafe")),
        ("pruning", FlagValue::value("archive")),
        (
            "unit-creation-delay",
            FlagValue::value(run.unit_creation_delay),
        ),
    ])?;

    let addresses = cluster
        .nodes()
        .iter()
        .map(|node| node.address(None))
        .collect::<Result<Option<Vec<String>>, _>>()?
        .context("every node has a p2p port after bootstrap")?;
    let validator_addresses = cluster
        .nodes()
        .iter()
        .map(|node| node.validator_address(None))
        .collect::<Option<Vec<String>>>()
        .context("every node has a validator port after bootstrap")?;
    cluster.set_flags([
        ("bootnodes", FlagValue::Value(addresses[0].clone())),
        ("public-addr", FlagValue::PerNode(addresses)),
    ])?;
    cluster.set_validator_flags([(
        "public-validator-addresses",
        FlagValue::PerNode(validator_addresses),
    )])?;

    info!(name = %run.name, "Starting the chain");
    cluster.start(&run.name, None)?;

    let finalized = cluster
        .wait_for_finalization(
            0,
            run.wait.finalized_delta,
            None,
            FinalizationMode::Absolute,
            (&run.wait).into(),
        )
        .await
        .context("The chain did not finalize in time")?;
    info!(?finalized, "Chain is finalizing");
    cluster.check_finalized(None).await?;

    let pids = cluster.detach();
    info!(?pids, "Leaving the nodes running in the background");
    Ok(())
}

fn read_runtime(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read the runtime {}", path.display()))
}

async fn sudo_client(sudo: &SudoArguments) -> anyhow::Result<SudoClient> {
    SudoClient::localhost(sudo.rpc_port, &sudo.sudo_phrase)
        .await
        .context("Failed to connect to the node")
}

fn report(receipt: ExtrinsicReceipt) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    if !receipt.success {
        bail!(
            "extrinsic failed: {}",
            receipt.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

//! The configuration of the `chainrunner` driver and the defaults shared with the cluster manager.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

/// The name of the node binary looked up inside the working directory when no binary was given.
pub const DEFAULT_BINARY_NAME: &str = "aleph-node";

/// Seed phrases of the well known development accounts, in the order nodes are assigned.
pub const DEFAULT_PHRASES: [&str; 8] = [
    "//Alice", "//Bob", "//Charlie", "//Dave", "//Ezekiel", "//Fanny", "//George", "//Hugo",
];

#[derive(Debug, Parser, Clone)]
#[command(
    name = "chainrunner",
    version,
    about = "Run and drive local clusters of blockchain nodes",
    after_help = concat!("Source: ", env!("CARGO_PKG_REPOSITORY"))
)]
pub struct Arguments {
    /// The directory where the chain spec, the logs and the databases of the nodes are written.
    #[arg(
        long = "workdir",
        short,
        env = "WORKDIR",
        default_value = "/tmp/workdir",
        global = true
    )]
    pub working_directory: PathBuf,

    /// The path to the node binary.
    ///
    /// By default the `aleph-node` binary inside the working directory is used.
    #[arg(long = "binary", short, env = "NODE_BINARY", global = true)]
    pub binary: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Arguments {
    /// Return the node binary with the following precedence:
    /// 1. `self.binary` if it was provided.
    /// 2. [`DEFAULT_BINARY_NAME`] inside the working directory.
    pub fn binary(&self) -> PathBuf {
        match &self.binary {
            Some(binary) => binary.clone(),
            None => self.working_directory.join(DEFAULT_BINARY_NAME),
        }
    }

    pub fn directory(&self) -> &Path {
        self.working_directory.as_path()
    }
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Bootstrap a chain, start its nodes, wait for finalization and leave them running.
    Run(RunArguments),

    /// Print the account ids derived from the given seed phrases.
    Keys {
        /// The seed phrases, `//Alice` style.
        #[arg(required = true)]
        phrases: Vec<String>,
    },

    /// Write a copy of a chain spec with a code substitute for the given block.
    SetCodeSubstitute {
        /// Path to the chain spec to be extended.
        old_chainspec: PathBuf,
        /// Path of the chain spec to be created.
        new_chainspec: PathBuf,
        /// The block (hash or number) from which the runtime is substituted.
        block: String,
        /// Path to the substituting runtime.
        runtime: PathBuf,
    },

    /// Write a copy of a chain spec with different genesis runtime code.
    SetGenesisCode {
        /// Path to the chain spec to be changed.
        chainspec: PathBuf,
        /// Path to the runtime.
        runtime: PathBuf,
        /// Path of the chain spec to be created.
        output: PathBuf,
    },

    /// Replace the runtime of a running chain with a sudo `set_code` call.
    SendRuntime {
        /// Path to the new runtime.
        runtime: PathBuf,

        #[command(flatten)]
        sudo: SudoArguments,
    },

    /// Schedule a finality version bump at the given session with a sudo call.
    BumpFinalityVersion {
        /// The session at which the new finality version becomes active.
        session: u32,

        #[command(flatten)]
        sudo: SudoArguments,
    },
}

#[derive(Debug, Args, Clone)]
pub struct RunArguments {
    /// The number of validator nodes to run.
    #[arg(long = "nodes", default_value_t = 4)]
    pub nodes: usize,

    /// The number of non-validator nodes to run next to the validators.
    #[arg(long = "nonvalidators", default_value_t = 0)]
    pub nonvalidators: usize,

    /// The seed phrases of the node accounts. The first one becomes the sudo account.
    #[arg(long = "phrase", default_values_t = DEFAULT_PHRASES.map(String::from))]
    pub phrases: Vec<String>,

    /// The kind of chain to bootstrap.
    #[arg(long = "chain-type", default_value = "local")]
    pub chain_type: ChainType,

    /// The block time of the chain.
    #[arg(long = "millisecs-per-block")]
    pub millisecs_per_block: Option<u64>,

    /// The length of a session in blocks.
    #[arg(long = "session-period")]
    pub session_period: Option<u32>,

    /// The delay between consecutive units created by a validator.
    #[arg(long = "unit-creation-delay", default_value_t = 500)]
    pub unit_creation_delay: u64,

    /// The name prefix of the node processes and their log files.
    #[arg(long = "name", default_value = "node")]
    pub name: String,

    #[command(flatten)]
    pub ports: PortConfiguration,

    #[command(flatten)]
    pub wait: WaitConfiguration,
}

#[derive(Debug, Args, Clone)]
pub struct SudoArguments {
    /// The rpc port of the node the extrinsic is submitted through.
    #[arg(long = "rpc-port", default_value_t = 9944)]
    pub rpc_port: u16,

    /// The seed phrase of the sudo account.
    #[arg(long = "sudo-phrase", default_value = "//Alice")]
    pub sudo_phrase: String,
}

/// The first port of every per-node port sequence. Node `i` gets `base + i`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Args, Serialize, Deserialize)]
pub struct PortConfiguration {
    /// The first p2p port.
    #[arg(long = "port", default_value_t = 30334)]
    pub port: u16,

    /// The first validator network port.
    #[arg(long = "validator-port", default_value_t = 30343)]
    pub validator_port: u16,

    /// The first rpc port.
    #[arg(long = "rpc-port", default_value_t = 9944)]
    pub rpc_port: u16,
}

impl Default for PortConfiguration {
    fn default() -> Self {
        Self {
            port: 30334,
            validator_port: 30343,
            rpc_port: 9944,
        }
    }
}

/// How long and how often the cluster is polled while waiting for a condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Args, Serialize, Deserialize)]
pub struct WaitConfiguration {
    /// Wait until this many blocks are finalized.
    #[arg(long = "finalized-delta", default_value_t = 1)]
    pub finalized_delta: u64,

    /// The time budget of a wait in seconds.
    #[arg(long = "wait-timeout", default_value_t = 600)]
    pub timeout_seconds: u64,

    /// The interval between two polls in milliseconds.
    #[arg(long = "poll-interval", default_value_t = 1000)]
    pub interval_milliseconds: u64,
}

impl WaitConfiguration {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_milliseconds)
    }
}

impl Default for WaitConfiguration {
    fn default() -> Self {
        Self {
            finalized_delta: 1,
            timeout_seconds: 600,
            interval_milliseconds: 1000,
        }
    }
}

/// The kind of chain the node binary bootstraps.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, ValueEnum, Serialize, Deserialize)]
#[clap(rename_all = "lower")]
pub enum ChainType {
    Development,
    #[default]
    Local,
    Live,
}

impl Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => f.write_str("dev"),
            Self::Local => f.write_str("local"),
            Self::Live => f.write_str("live"),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn help_points_at_the_source_repository() {
        let help = Arguments::command().render_long_help().to_string();
        assert!(help.contains("Source: https://github.com/Cardinal-Cryptography/aleph-node.git"));
    }

    #[test]
    fn binary_defaults_to_the_working_directory() {
        let arguments = Arguments::try_parse_from([
            "chainrunner",
            "--workdir",
            "/tmp/cluster",
            "keys",
            "//Alice",
        ])
        .unwrap();

        assert_eq!(arguments.binary(), PathBuf::from("/tmp/cluster/aleph-node"));
    }

    #[test]
    fn run_defaults_match_the_port_configuration() {
        let arguments = Arguments::try_parse_from(["chainrunner", "run"]).unwrap();

        let Command::Run(run) = arguments.command else {
            panic!("expected the run command");
        };
        assert_eq!(run.ports, PortConfiguration::default());
        assert_eq!(run.wait, WaitConfiguration::default());
        assert_eq!(run.nodes, 4);
        assert_eq!(run.phrases.len(), DEFAULT_PHRASES.len());
        assert_eq!(run.chain_type.to_string(), "local");
    }

    #[test]
    fn set_code_substitute_takes_positional_paths() {
        let arguments = Arguments::try_parse_from([
            "chainrunner",
            "set-code-substitute",
            "chainspec.json",
            "chainspec-new.json",
            "0xab",
            "fix.wasm",
        ])
        .unwrap();

        let Command::SetCodeSubstitute { block, runtime, .. } = arguments.command else {
            panic!("expected the set-code-substitute command");
        };
        assert_eq!(block, "0xab");
        assert_eq!(runtime, PathBuf::from("fix.wasm"));
    }
}

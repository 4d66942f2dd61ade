//! The controller of a single node process.

use std::{
    cell::Cell,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use chainrunner_common::{Error, Result, fs::ensure_file};
use chainrunner_node_interaction::{ExtrinsicReceipt, RpcClient, RpcResponse, SudoClient};
use regex::Regex;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, instrument, warn};

use crate::{
    flags::{Flags, NodeFlag},
    keys::peer_id,
    process::{Process, run_to_completion},
    status::{NodeStatus, Observed, StatusCache},
};

static AUTHORITIES_KNOWN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)/(\d+) authorities known for session").expect("valid regex")
});

/// A single node of a local chain: the binary, its storage, its flags and, while running, its
/// process.
#[derive(Debug)]
pub struct Node {
    index: usize,
    binary: PathBuf,
    chainspec: PathBuf,
    base_path: PathBuf,
    log_directory: PathBuf,
    log_file: Option<PathBuf>,
    flags: Flags,
    /// The live process. Present exactly while the node is considered running.
    process: Option<Process>,
    /// A process that has been asked to stop and may not have exited yet.
    stopping: Option<Process>,
    /// Whether the latest start kept a backup stash. Restarts keep the setting.
    enable_backup: bool,
    /// Written only by this node's own status reads, which take `&self`.
    status: Cell<StatusCache>,
}

impl Node {
    /// How long [`Node::change_binary`] lets the old process shut down before killing it.
    pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

    const NODE_KEY_FILE: &str = "p2p_secret";
    const BACKUP_DIRECTORY: &str = "backup-stash";

    pub fn new(
        index: usize,
        binary: impl Into<PathBuf>,
        chainspec: impl Into<PathBuf>,
        base_path: impl Into<PathBuf>,
        log_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            index,
            binary: binary.into(),
            chainspec: chainspec.into(),
            base_path: base_path.into(),
            log_directory: log_directory.into(),
            log_file: None,
            flags: Flags::default(),
            process: None,
            stopping: None,
            enable_backup: true,
            status: Cell::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn chainspec(&self) -> &Path {
        &self.chainspec
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// The log file of the latest start, if the node has been started.
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn set_flag(&mut self, key: impl Into<String>, flag: NodeFlag) {
        self.flags.set(key, flag);
    }

    pub fn set_binary(&mut self, binary: impl Into<PathBuf>) {
        self.binary = binary.into();
    }

    pub fn set_chainspec(&mut self, chainspec: impl Into<PathBuf>) {
        self.chainspec = chainspec.into();
    }

    /// The last known `(highest_block, highest_finalized)` without asking the node.
    pub fn cached_status(&self) -> (Option<u64>, Option<u64>) {
        let status = self.status.get();
        (status.highest_block(), status.highest_finalized())
    }

    fn node_key_file(&self) -> PathBuf {
        self.base_path.join(Self::NODE_KEY_FILE)
    }

    fn storage_arguments(&self) -> Vec<OsString> {
        vec![
            "--base-path".into(),
            self.base_path.clone().into(),
            "--chain".into(),
            self.chainspec.clone().into(),
        ]
    }

    /// The full argument list of a start under `{name}{index}`.
    pub fn start_arguments(&self, name: &str, enable_backup: bool) -> Vec<OsString> {
        let mut arguments: Vec<OsString> =
            vec!["--name".into(), format!("{name}{}", self.index).into()];
        arguments.extend(self.storage_arguments());
        arguments.extend([
            "--node-key-file".into(),
            self.node_key_file().into(),
            "--enable-log-reloading".into(),
        ]);
        if enable_backup {
            arguments.extend([
                "--backup-path".into(),
                self.base_path.join(Self::BACKUP_DIRECTORY).into(),
            ]);
        }
        arguments.extend(self.flags.to_arguments().into_iter().map(OsString::from));
        arguments
    }

    /// Starts the node under the name `{name}{index}`, logging to
    /// `{log_directory}/{name}{index}.log`. Does nothing if the node is already running.
    #[instrument(level = "info", skip_all, fields(node_index = self.index))]
    pub fn start(&mut self, name: &str, enable_backup: bool) -> Result<()> {
        if self.is_running() {
            info!("Node already running");
            return Ok(());
        }

        let log_file = self.log_directory.join(format!("{name}{}.log", self.index));
        let process = Process::spawn(
            &self.binary,
            self.start_arguments(name, enable_backup),
            &log_file,
        )?;
        info!(pid = process.id(), log_file = %log_file.display(), "Node started");

        self.log_file = Some(log_file);
        self.process = Some(process);
        self.enable_backup = enable_backup;
        Ok(())
    }

    /// Sends SIGTERM and marks the node stopped right away. Use [`Node::await_exit`] to wait for
    /// the process to be gone.
    #[instrument(level = "info", skip_all, fields(node_index = self.index))]
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };
        let result = process.terminate();
        self.stopping = Some(process);
        result?;
        info!("Stop requested");
        Ok(())
    }

    /// Same as [`Node::stop`].
    pub fn request_stop(&mut self) -> Result<()> {
        self.stop()
    }

    /// Waits up to `timeout` for a stopped node's process to exit. Returns `true` when no process
    /// of this node is left behind.
    pub async fn await_exit(&mut self, timeout: Duration) -> Result<bool> {
        let Some(process) = self.stopping.as_mut() else {
            return Ok(true);
        };
        if process.await_exit(timeout).await?.is_none() {
            return Ok(false);
        }
        self.stopping = None;
        Ok(true)
    }

    /// Kills the process of a stopped node that did not exit on its own.
    pub fn kill(&mut self) -> Result<()> {
        if let Some(mut process) = self.stopping.take() {
            warn!(node_index = self.index, pid = process.id(), "Killing the node process");
            process.kill()?;
        }
        Ok(())
    }

    /// Lets the process outlive this controller. The node is considered stopped afterwards.
    pub fn detach(&mut self) -> Option<u32> {
        self.process.take().map(Process::detach)
    }

    /// Deletes the node's database with `purge-chain`. The heights cached for the old database
    /// are forgotten.
    #[instrument(level = "info", skip_all, fields(node_index = self.index))]
    pub fn purge(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::process_lifecycle(format!(
                "node {} is running and cannot be purged",
                self.index
            )));
        }
        let mut arguments: Vec<OsString> = vec!["purge-chain".into(), "-y".into()];
        arguments.extend(self.storage_arguments());
        run_to_completion(&self.binary, arguments)?;
        self.status.set(StatusCache::default());
        info!("Database purged");
        Ok(())
    }

    /// Exports the chain state after `at_block`, or after the best block when `None`.
    #[instrument(level = "info", skip_all, fields(node_index = self.index))]
    pub fn export_state(&self, at_block: Option<u64>) -> Result<JsonValue> {
        if self.is_running() {
            return Err(Error::process_lifecycle(format!(
                "node {} is running, state can only be exported from a stopped node",
                self.index
            )));
        }
        let mut arguments: Vec<OsString> = vec!["export-state".into()];
        arguments.extend(self.storage_arguments());
        if let Some(block) = at_block {
            arguments.push(block.to_string().into());
        }
        let output = run_to_completion(&self.binary, arguments)?;
        serde_json::from_slice(&output.stdout).map_err(|error| Error::Process {
            command: format!("{} export-state", self.binary.display()),
            reason: format!("output is not json: {error}"),
        })
    }

    /// The port of the node's RPC server, from the `rpc-port` or `rpc_port` flag.
    pub fn rpc_port(&self) -> Result<u16> {
        const KEYS: [&str; 2] = ["rpc-port", "rpc_port"];
        let Some(port) = self.flags.value_of(&KEYS) else {
            let message = match KEYS.iter().find(|key| self.flags.get(key).is_some()) {
                Some(key) => format!("node {}: {key} is set without a port", self.index),
                None => format!(
                    "rpc port of node {} unknown, set the rpc-port flag",
                    self.index
                ),
            };
            return Err(Error::configuration(message));
        };
        port.parse().map_err(|_| {
            Error::configuration(format!("node {}: invalid rpc port {port}", self.index))
        })
    }

    /// Sends one JSON-RPC request to the running node.
    pub async fn rpc(&self, method: &str, params: JsonValue) -> Result<RpcResponse> {
        if !self.is_running() {
            return Err(Error::process_lifecycle(format!(
                "node {} is not running, cannot call {method}",
                self.index
            )));
        }
        RpcClient::localhost(self.rpc_port()?)
            .request(method, params)
            .await
    }

    async fn rpc_result(&self, method: &str, params: JsonValue) -> Result<JsonValue> {
        self.rpc(method, params).await?.into_result()
    }

    /// Hash of the best block, unknown on any failure.
    pub async fn highest_hash(&self) -> Option<String> {
        self.hash_from("chain_getBlockHash", JsonValue::Null).await
    }

    /// Hash of the finalized head, unknown on any failure.
    pub async fn highest_finalized_hash(&self) -> Option<String> {
        self.hash_from("chain_getFinalizedHead", JsonValue::Null).await
    }

    async fn hash_from(&self, method: &str, params: JsonValue) -> Option<String> {
        match self.rpc_result(method, params).await {
            Ok(JsonValue::String(hash)) => Some(hash),
            Ok(other) => {
                debug!(node_index = self.index, method, %other, "No hash returned");
                None
            }
            Err(error) => {
                debug!(node_index = self.index, method, %error, "Hash request failed");
                None
            }
        }
    }

    /// Height of the block with `hash`, unknown on any failure.
    pub async fn block_number(&self, hash: &str) -> Option<u64> {
        let block = self
            .rpc_result("chain_getBlock", json!([hash]))
            .await
            .inspect_err(|error| debug!(node_index = self.index, %error, "Block request failed"))
            .ok()?;
        parse_block_number(&block)
    }

    /// Hash of the block at `height` on the node's best chain, if the node knows one.
    pub async fn block_hash_at(&self, height: u64) -> Result<Option<String>> {
        match self.rpc_result("chain_getBlockHash", json!([height])).await? {
            JsonValue::String(hash) => Ok(Some(hash)),
            _ => Ok(None),
        }
    }

    /// Reads both heights from the node, tagging each with its freshness. Legs that cannot be read
    /// are answered from the cache.
    pub async fn observe_status(&self) -> NodeStatus {
        let highest_hash = self.highest_hash().await;
        let highest_finalized_hash = self.highest_finalized_hash().await;
        let highest_block = match highest_hash {
            Some(hash) => self.block_number(&hash).await,
            None => None,
        };
        let highest_finalized = match highest_finalized_hash {
            Some(hash) => self.block_number(&hash).await,
            None => None,
        };
        let mut cache = self.status.get();
        let status = cache.record(highest_block, highest_finalized);
        self.status.set(cache);
        status
    }

    /// `(highest_block, highest_finalized)`, falling back to the last known heights for the legs
    /// the node did not answer. Heights never decrease between calls.
    pub async fn highest_block(&self) -> (Option<u64>, Option<u64>) {
        self.observe_status().await.heights()
    }

    /// Like [`Node::highest_block`] but fails unless both heights were read just now.
    pub async fn highest_block_fresh(&self) -> Result<(u64, u64)> {
        let status = self.observe_status().await;
        match (status.highest_block, status.highest_finalized) {
            (Observed::Fresh(best), Observed::Fresh(finalized)) => Ok((best, finalized)),
            (best, finalized) => Err(Error::RpcProtocol {
                code: None,
                message: format!(
                    "node {} gave no fresh status: best {best:?}, finalized {finalized:?}",
                    self.index
                ),
            }),
        }
    }

    /// All matches of `pattern` in the current log file. Each match is given as its capture
    /// groups, or as the whole match when the pattern has no groups.
    pub fn greplog(&self, pattern: &Regex) -> Result<Vec<Vec<String>>> {
        let Some(log_file) = &self.log_file else {
            return Ok(Vec::new());
        };
        let log = std::fs::read_to_string(log_file)?;
        Ok(pattern
            .captures_iter(&log)
            .map(|captures| {
                let skip = usize::from(captures.len() > 1);
                captures
                    .iter()
                    .skip(skip)
                    .map(|group| group.map_or_else(String::new, |group| group.as_str().to_owned()))
                    .collect()
            })
            .collect())
    }

    /// `true` when the last authorities report in the log shows every authority known.
    pub fn check_authorities(&self) -> bool {
        let matches = match self.greplog(&AUTHORITIES_KNOWN) {
            Ok(matches) => matches,
            Err(error) => {
                debug!(node_index = self.index, %error, "Could not read the log");
                return false;
            }
        };
        matches
            .last()
            .is_some_and(|groups| groups.len() == 2 && groups[0] == groups[1])
    }

    /// The p2p multiaddress of the node, on `port` or the `port` flag.
    pub fn address(&self, port: Option<u16>) -> Result<Option<String>> {
        let Some(port) = port
            .map(|port| port.to_string())
            .or_else(|| self.flags.value_of(&["port"]).map(str::to_owned))
        else {
            return Ok(None);
        };
        let peer_id = peer_id(&self.binary, &self.node_key_file())?;
        Ok(Some(format!("/dns4/localhost/tcp/{port}/p2p/{peer_id}")))
    }

    /// The validator network address of the node, on `port` or the `validator-port` flag.
    pub fn validator_address(&self, port: Option<u16>) -> Option<String> {
        let port = port
            .map(|port| port.to_string())
            .or_else(|| {
                self.flags
                    .value_of(&["validator-port", "validator_port"])
                    .map(str::to_owned)
            })?;
        Some(format!("localhost:{port}"))
    }

    /// Restarts the node under `name` with `new_binary`, optionally purging its database first.
    /// The backup setting of the previous start is kept. Returns the finalized height known before
    /// the swap.
    #[instrument(level = "info", skip_all, fields(node_index = self.index))]
    pub async fn change_binary(
        &mut self,
        new_binary: &Path,
        name: &str,
        purge: bool,
    ) -> Result<Option<u64>> {
        ensure_file(new_binary)?;
        self.stop()?;
        if !self.await_exit(Self::SHUTDOWN_GRACE_PERIOD).await? {
            self.kill()?;
        }

        let (_, highest_finalized) = self.highest_block().await;
        info!(?highest_finalized, binary = %new_binary.display(), "Swapping binary");

        if purge {
            self.purge()?;
        }
        self.binary = new_binary.to_path_buf();
        self.start(name, self.enable_backup)?;
        Ok(highest_finalized)
    }

    /// Changes the log level of `target` on the running node.
    pub async fn set_log_level(&self, target: &str, level: &str) -> Result<()> {
        self.rpc_result("system_addLogFilter", json!([format!("{target}={level}")]))
            .await?;
        Ok(())
    }

    /// The node's host version and runtime spec version.
    pub async fn runtime_version(&self) -> Result<(String, u64)> {
        let system_version = self.rpc_result("system_version", JsonValue::Null).await?;
        let runtime_version = self
            .rpc_result("state_getRuntimeVersion", JsonValue::Null)
            .await?;
        let spec_version = runtime_version["specVersion"]
            .as_u64()
            .ok_or_else(|| Error::RpcProtocol {
                code: None,
                message: format!("runtime version without specVersion: {runtime_version}"),
            })?;
        let system_version = system_version.as_str().unwrap_or_default().to_owned();
        Ok((system_version, spec_version))
    }

    async fn sudo_client(&self, sudo_phrase: &str) -> Result<SudoClient> {
        SudoClient::localhost(self.rpc_port()?, sudo_phrase).await
    }

    /// Schedules the next finality version for `session`, signed by `sudo_phrase`.
    #[instrument(level = "info", skip_all, fields(node_index = self.index, session = session))]
    pub async fn update_finality_version(
        &self,
        session: u32,
        sudo_phrase: &str,
    ) -> Result<ExtrinsicReceipt> {
        self.sudo_client(sudo_phrase)
            .await?
            .schedule_finality_version_change(session)
            .await
    }

    /// Submits `System::set_code` with `runtime`, signed by `sudo_phrase`.
    #[instrument(level = "info", skip_all, fields(node_index = self.index))]
    pub async fn update_runtime(
        &self,
        runtime: &[u8],
        sudo_phrase: &str,
    ) -> Result<ExtrinsicReceipt> {
        self.sudo_client(sudo_phrase).await?.set_code(runtime).await
    }
}

/// Decodes the hex `block.header.number` of a `chain_getBlock` result.
fn parse_block_number(block: &JsonValue) -> Option<u64> {
    let number = block["block"]["header"]["number"].as_str()?;
    u64::from_str_radix(number.trim_start_matches("0x"), 16).ok()
}

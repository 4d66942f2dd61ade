//! A local chain made of several nodes sharing one chain spec.

use std::{
    ffi::OsString,
    fs::create_dir_all,
    ops::{ControlFlow, Index},
    path::{Path, PathBuf},
};

use chainrunner_common::{
    Error, Result,
    fs::{ensure_empty_directory, ensure_file},
    futures::{PollingWaitBehavior, poll},
    types::Sequence,
};
use chainrunner_config::{ChainType, PortConfiguration};
use chainrunner_node::{AccountId, Node, NodeFlag, process::run_to_completion};
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::wait::{FinalizationMode, WaitOptions, finalization_reached, imported_reached};

/// The value of a flag set on several nodes at once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlagValue {
    /// A flag without a value.
    Switch,
    /// The same value on every node.
    Value(String),
    /// `start + index` on the node at `index`.
    Sequence(u64),
    /// The value at `index` on the node at `index`.
    PerNode(Vec<String>),
}

impl FlagValue {
    pub fn value(value: impl ToString) -> Self {
        Self::Value(value.to_string())
    }
}

/// What `bootstrap-chain` is asked to generate.
#[derive(Clone, Debug)]
pub struct BootstrapConfiguration {
    pub binary: PathBuf,
    pub validators: Vec<AccountId>,
    pub nonvalidators: Vec<AccountId>,
    pub sudo_account: Option<AccountId>,
    pub chain_type: Option<ChainType>,
    pub millisecs_per_block: Option<u64>,
    pub session_period: Option<u32>,
    pub ports: PortConfiguration,
}

impl BootstrapConfiguration {
    pub fn new(binary: impl Into<PathBuf>, validators: Vec<AccountId>) -> Self {
        Self {
            binary: binary.into(),
            validators,
            nonvalidators: Vec::new(),
            sudo_account: None,
            chain_type: None,
            millisecs_per_block: None,
            session_period: None,
            ports: PortConfiguration::default(),
        }
    }

    fn accounts(&self) -> impl Iterator<Item = &AccountId> {
        self.validators.iter().chain(&self.nonvalidators)
    }

    /// The arguments of the `bootstrap-chain` invocation writing into `working_directory`.
    pub fn arguments(&self, working_directory: &Path) -> Vec<OsString> {
        let mut arguments: Vec<OsString> = vec![
            "bootstrap-chain".into(),
            "--base-path".into(),
            working_directory.into(),
            "--account-ids".into(),
            join_accounts(self.accounts()).into(),
            "--authorities-account-ids".into(),
            join_accounts(&self.validators).into(),
        ];
        if let Some(sudo_account) = &self.sudo_account {
            arguments.extend(["--sudo-account-id".into(), sudo_account.as_str().into()]);
        }
        if let Some(chain_type) = self.chain_type {
            arguments.extend(["--chain-type".into(), chain_type.to_string().into()]);
        }
        if let Some(millisecs_per_block) = self.millisecs_per_block {
            arguments.extend([
                "--millisecs-per-block".into(),
                millisecs_per_block.to_string().into(),
            ]);
        }
        if let Some(session_period) = self.session_period {
            arguments.extend(["--session-period".into(), session_period.to_string().into()]);
        }
        arguments.push("--raw".into());
        arguments
    }
}

fn join_accounts<'a>(accounts: impl IntoIterator<Item = &'a AccountId>) -> String {
    accounts
        .into_iter()
        .map(AccountId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// The per-node flags that `value` resolves to on a cluster of `count` nodes.
fn resolve_flag(key: &str, value: &FlagValue, count: usize) -> Result<Vec<NodeFlag>> {
    match value {
        FlagValue::Switch => Ok(vec![NodeFlag::Switch; count]),
        FlagValue::Value(value) => Ok(vec![NodeFlag::Value(value.clone()); count]),
        FlagValue::Sequence(start) => Ok(Sequence::new(*start)
            .take(count)
            .map(NodeFlag::value)
            .collect()),
        FlagValue::PerNode(values) if values.len() >= count => Ok(values[..count]
            .iter()
            .cloned()
            .map(NodeFlag::Value)
            .collect()),
        FlagValue::PerNode(values) => Err(Error::configuration(format!(
            "flag {key} has {} values but there are {count} nodes",
            values.len()
        ))),
    }
}

/// The nodes of one local chain, driven from a single task.
#[derive(Debug)]
pub struct Cluster {
    working_directory: PathBuf,
    chainspec: Option<PathBuf>,
    nodes: Vec<Node>,
    accounts: Vec<AccountId>,
    validators: usize,
    enable_backup: bool,
}

impl Cluster {
    pub const CHAINSPEC_FILE: &str = "chainspec.json";

    /// A cluster without nodes rooted at `working_directory`, which is created if missing.
    pub fn new(working_directory: impl AsRef<Path>) -> Result<Self> {
        let working_directory = working_directory.as_ref();
        create_dir_all(working_directory)?;
        Ok(Self {
            working_directory: std::path::absolute(working_directory)?,
            chainspec: None,
            nodes: Vec::new(),
            accounts: Vec::new(),
            validators: 0,
            enable_backup: true,
        })
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// The chain spec shared by the nodes, once the chain has been bootstrapped.
    pub fn chainspec(&self) -> Option<&Path> {
        self.chainspec.as_deref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index)
    }

    pub fn accounts(&self) -> &[AccountId] {
        &self.accounts
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn validator_count(&self) -> usize {
        self.validators
    }

    /// Whether started nodes keep a backup stash under their base path. On by default.
    pub fn set_backup(&mut self, enable_backup: bool) {
        self.enable_backup = enable_backup;
    }

    /// Generates the chain spec and the node directories with `bootstrap-chain` and creates one
    /// node per account, validators first. Every node gets its own `port`, `validator-port` and
    /// `rpc-port`, counting up from the configured bases.
    #[instrument(
        level = "info",
        skip_all,
        fields(working_directory = %self.working_directory.display())
    )]
    pub fn bootstrap(&mut self, configuration: &BootstrapConfiguration) -> Result<()> {
        ensure_file(&configuration.binary)?;
        if configuration.validators.is_empty() {
            return Err(Error::configuration("a chain needs at least one validator"));
        }

        for account in configuration.accounts() {
            ensure_empty_directory(self.working_directory.join(account.as_str()))?;
        }
        let output = run_to_completion(
            &configuration.binary,
            configuration.arguments(&self.working_directory),
        )?;
        let chainspec = self.working_directory.join(Self::CHAINSPEC_FILE);
        std::fs::write(&chainspec, &output.stdout)?;
        info!(chainspec = %chainspec.display(), "Chain spec generated");

        let mut ports = Sequence::ports(configuration.ports.port);
        let mut validator_ports = Sequence::ports(configuration.ports.validator_port);
        let mut rpc_ports = Sequence::ports(configuration.ports.rpc_port);

        let mut nodes = Vec::new();
        for (index, account) in configuration.accounts().enumerate() {
            let mut node = Node::new(
                index,
                &configuration.binary,
                &chainspec,
                self.working_directory.join(account.as_str()),
                &self.working_directory,
            );
            node.set_flag("port", NodeFlag::value(ports.allocate()?));
            node.set_flag("validator-port", NodeFlag::value(validator_ports.allocate()?));
            node.set_flag("rpc-port", NodeFlag::value(rpc_ports.allocate()?));
            nodes.push(node);
        }

        self.nodes = nodes;
        self.accounts = configuration.accounts().cloned().collect();
        self.validators = configuration.validators.len();
        self.chainspec = Some(chainspec);
        info!(
            validators = self.validators,
            nodes = self.nodes.len(),
            "Chain bootstrapped"
        );
        Ok(())
    }

    /// Adds an already configured node. Its index must be the next free one.
    pub fn push_node(&mut self, node: Node, validator: bool) -> Result<()> {
        if node.index() != self.nodes.len() {
            return Err(Error::configuration(format!(
                "node index {} does not follow the {} existing nodes",
                node.index(),
                self.nodes.len()
            )));
        }
        if validator {
            if self.validators != self.nodes.len() {
                return Err(Error::configuration(
                    "validators must come before the other nodes",
                ));
            }
            self.validators += 1;
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Sets `flags` on every node.
    pub fn set_flags<K: Into<String>>(
        &mut self,
        flags: impl IntoIterator<Item = (K, FlagValue)>,
    ) -> Result<()> {
        self.set_flags_where(flags, |_, _| true)
    }

    /// Sets `flags` on validator nodes only.
    pub fn set_validator_flags<K: Into<String>>(
        &mut self,
        flags: impl IntoIterator<Item = (K, FlagValue)>,
    ) -> Result<()> {
        let validators = self.validators;
        self.set_flags_where(flags, move |_, index| index < validators)
    }

    /// Sets `flags` on the nodes for which `predicate(node, index)` holds. Sequence and per-node
    /// values are resolved by node index, whether or not a node is selected.
    pub fn set_flags_where<K: Into<String>>(
        &mut self,
        flags: impl IntoIterator<Item = (K, FlagValue)>,
        predicate: impl Fn(&Node, usize) -> bool,
    ) -> Result<()> {
        for (key, value) in flags {
            let key = key.into();
            let resolved = resolve_flag(&key, &value, self.nodes.len())?;
            for (index, (node, flag)) in self.nodes.iter_mut().zip(resolved).enumerate() {
                if predicate(node, index) {
                    node.set_flag(key.clone(), flag);
                }
            }
        }
        Ok(())
    }

    /// Resolves an optional node selection into indices; `None` selects every node.
    fn targets(&self, nodes: Option<&[usize]>) -> Result<Vec<usize>> {
        let Some(nodes) = nodes else {
            return Ok((0..self.nodes.len()).collect());
        };
        if let Some(index) = nodes.iter().find(|index| **index >= self.nodes.len()) {
            return Err(Error::configuration(format!(
                "there is no node {index}, the cluster has {} nodes",
                self.nodes.len()
            )));
        }
        Ok(nodes.to_vec())
    }

    /// Points the selected nodes at `binary`, effective from their next start.
    pub fn set_binary(&mut self, binary: impl AsRef<Path>, nodes: Option<&[usize]>) -> Result<()> {
        let binary = binary.as_ref();
        ensure_file(binary)?;
        for index in self.targets(nodes)? {
            self.nodes[index].set_binary(binary);
        }
        Ok(())
    }

    /// Points the selected nodes at `chainspec`, effective from their next start.
    pub fn set_chainspec(
        &mut self,
        chainspec: impl AsRef<Path>,
        nodes: Option<&[usize]>,
    ) -> Result<()> {
        let chainspec = chainspec.as_ref();
        ensure_file(chainspec)?;
        for index in self.targets(nodes)? {
            self.nodes[index].set_chainspec(chainspec);
        }
        if nodes.is_none() {
            self.chainspec = Some(chainspec.to_path_buf());
        }
        Ok(())
    }

    /// Sets `target=level` in the `log` flag of the selected nodes and applies it right away to
    /// those that are running.
    pub async fn set_log_level(
        &mut self,
        target: &str,
        level: &str,
        nodes: Option<&[usize]>,
    ) -> Result<()> {
        let directive = format!("{target}={level}");
        for index in self.targets(nodes)? {
            let node = &mut self.nodes[index];
            let mut directives: Vec<String> = node
                .flags()
                .value_of(&["log"])
                .map(|value| {
                    value
                        .split(',')
                        .filter(|existing| existing.split('=').next() != Some(target))
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            directives.push(directive.clone());
            node.set_flag("log", NodeFlag::Value(directives.join(",")));

            if node.is_running() {
                if let Err(error) = node.set_log_level(target, level).await {
                    warn!(node_index = index, %error, "Failed to change the log level");
                }
            }
        }
        Ok(())
    }

    /// Starts the selected nodes under `name`; node `i` logs to `{name}{i}.log`.
    pub fn start(&mut self, name: &str, nodes: Option<&[usize]>) -> Result<()> {
        let enable_backup = self.enable_backup;
        for index in self.targets(nodes)? {
            self.nodes[index].start(name, enable_backup)?;
        }
        Ok(())
    }

    /// Asks the selected nodes to stop without waiting for their processes.
    pub fn stop(&mut self, nodes: Option<&[usize]>) -> Result<()> {
        for index in self.targets(nodes)? {
            self.nodes[index].stop()?;
        }
        Ok(())
    }

    /// Waits for the processes of the selected stopped nodes to exit, killing whatever is still
    /// alive after `timeout`.
    pub async fn await_exit(
        &mut self,
        timeout: std::time::Duration,
        nodes: Option<&[usize]>,
    ) -> Result<()> {
        let targets = self.targets(nodes)?;
        let exited = join_all(
            self.nodes
                .iter_mut()
                .enumerate()
                .filter(|(index, _)| targets.contains(index))
                .map(|(_, node)| async move {
                    if node.await_exit(timeout).await? {
                        Ok(())
                    } else {
                        node.kill()
                    }
                }),
        )
        .await;
        exited.into_iter().collect()
    }

    /// Deletes the databases of the selected nodes.
    pub fn purge(&mut self, nodes: Option<&[usize]>) -> Result<()> {
        for index in self.targets(nodes)? {
            self.nodes[index].purge()?;
        }
        Ok(())
    }

    /// Lets the processes of all nodes outlive the cluster. Returns their process ids.
    pub fn detach(&mut self) -> Vec<u32> {
        self.nodes.iter_mut().filter_map(Node::detach).collect()
    }

    async fn finalized_heights(&self) -> Vec<Option<u64>> {
        join_all(
            self.nodes
                .iter()
                .map(|node| async move { node.highest_block().await.1 }),
        )
        .await
    }

    async fn best_heights(&self) -> Vec<Option<u64>> {
        join_all(
            self.nodes
                .iter()
                .map(|node| async move { node.highest_block().await.0 }),
        )
        .await
    }

    /// Waits until the selected nodes have finalized `old_finalized + finalized_delta` blocks, and
    /// in catch-up mode until each is close enough to the rest of the cluster. Returns the
    /// finalized heights of all nodes at that point.
    #[instrument(
        level = "info",
        skip_all,
        fields(old_finalized = old_finalized, finalized_delta = finalized_delta, mode = ?mode)
    )]
    pub async fn wait_for_finalization(
        &self,
        old_finalized: u64,
        finalized_delta: u64,
        nodes: Option<&[usize]>,
        mode: FinalizationMode,
        options: WaitOptions,
    ) -> Result<Vec<Option<u64>>> {
        let targets = self.targets(nodes)?;
        let floor = old_finalized.saturating_add(finalized_delta);
        let targets = &targets;

        let heights = poll(
            "finalization",
            options.timeout,
            PollingWaitBehavior::Constant(options.interval),
            move || async move {
                let heights = self.finalized_heights().await;
                if finalization_reached(&heights, targets, floor, mode) {
                    Ok(ControlFlow::Break(heights))
                } else {
                    debug!(?heights, floor, "Finalization not reached yet");
                    Ok(ControlFlow::Continue(()))
                }
            },
        )
        .await?;
        info!(?heights, "Finalization reached");
        Ok(heights)
    }

    /// Waits until the selected nodes have imported a block at `height` or above.
    pub async fn wait_for_imported_at_height(
        &self,
        height: u64,
        nodes: Option<&[usize]>,
        options: WaitOptions,
    ) -> Result<Vec<Option<u64>>> {
        let targets = self.targets(nodes)?;
        let targets = &targets;

        poll(
            "block import",
            options.timeout,
            PollingWaitBehavior::Constant(options.interval),
            move || async move {
                let heights = self.best_heights().await;
                if imported_reached(&heights, targets, height) {
                    Ok(ControlFlow::Break(heights))
                } else {
                    debug!(?heights, height, "Import height not reached yet");
                    Ok(ControlFlow::Continue(()))
                }
            },
        )
        .await
    }

    /// Waits until the log of every selected node reports all authorities known.
    pub async fn wait_for_authorities(
        &self,
        nodes: Option<&[usize]>,
        options: WaitOptions,
    ) -> Result<()> {
        let targets = self.targets(nodes)?;
        let targets = &targets;

        poll(
            "authorities",
            options.timeout,
            PollingWaitBehavior::Constant(options.interval),
            move || async move {
                let missing: Vec<usize> = targets
                    .iter()
                    .copied()
                    .filter(|index| !self.nodes[*index].check_authorities())
                    .collect();
                if missing.is_empty() {
                    Ok(ControlFlow::Break(()))
                } else {
                    debug!(?missing, "Nodes still missing authorities");
                    Ok(ControlFlow::Continue(()))
                }
            },
        )
        .await?;
        info!("All authorities known");
        Ok(())
    }

    /// The highest finalized height among the selected nodes.
    pub async fn highest_finalized(&self, nodes: Option<&[usize]>) -> Result<Option<u64>> {
        let heights = self.check_finalized(nodes).await?;
        Ok(heights
            .into_iter()
            .filter_map(|(_, finalized)| finalized)
            .max())
    }

    /// Reads and logs `(highest_block, highest_finalized)` of the selected nodes.
    pub async fn check_finalized(
        &self,
        nodes: Option<&[usize]>,
    ) -> Result<Vec<(Option<u64>, Option<u64>)>> {
        let targets = self.targets(nodes)?;
        let heights = join_all(
            targets
                .iter()
                .map(|index| self.nodes[*index].highest_block()),
        )
        .await;
        for (index, (highest, finalized)) in targets.iter().zip(&heights) {
            info!(node_index = index, ?highest, ?finalized, "Blocks seen by node");
        }
        Ok(heights)
    }

    /// Queries the host and runtime versions of the selected nodes and returns the highest
    /// runtime spec version. Disagreeing nodes are reported.
    pub async fn runtime_versions(&self, nodes: Option<&[usize]>) -> Result<Option<u64>> {
        let targets = self.targets(nodes)?;
        let versions = join_all(
            targets
                .iter()
                .map(|index| self.nodes[*index].runtime_version()),
        )
        .await;

        let mut spec_versions = Vec::new();
        for (index, version) in targets.iter().zip(versions) {
            match version {
                Ok((host, spec_version)) => {
                    info!(node_index = index, %host, spec_version, "Node version");
                    spec_versions.push(spec_version);
                }
                Err(error) => warn!(node_index = index, %error, "Failed to query the version"),
            }
        }
        spec_versions.sort_unstable();
        spec_versions.dedup();
        if spec_versions.len() > 1 {
            warn!(?spec_versions, "Nodes report different runtime versions");
        }
        Ok(spec_versions.last().copied())
    }
}

impl Index<usize> for Cluster {
    type Output = Node;

    fn index(&self, index: usize) -> &Self::Output {
        &self.nodes[index]
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chainrunner_common::Error;
    use temp_dir::TempDir;

    use super::*;

    fn cluster_of(directory: &TempDir, count: usize, validators: usize) -> Cluster {
        let mut cluster = Cluster::new(directory.path()).unwrap();
        for index in 0..count {
            let node = Node::new(
                index,
                directory.child("aleph-node"),
                directory.child("chainspec.json"),
                directory.child(format!("account{index}")),
                directory.path(),
            );
            cluster.push_node(node, index < validators).unwrap();
        }
        cluster
    }

    fn flag(cluster: &Cluster, index: usize, key: &str) -> Option<NodeFlag> {
        cluster[index].flags().get(key).cloned()
    }

    #[test]
    fn bootstrap_arguments_list_validators_first() {
        let mut configuration = BootstrapConfiguration::new(
            "/opt/aleph-node",
            vec![AccountId::from("5Alice"), AccountId::from("5Bob")],
        );
        configuration.nonvalidators = vec![AccountId::from("5Charlie")];
        configuration.sudo_account = Some(AccountId::from("5Alice"));
        configuration.chain_type = Some(ChainType::Local);
        configuration.session_period = Some(40);

        let arguments: Vec<_> = configuration
            .arguments(Path::new("/work"))
            .into_iter()
            .map(|argument| argument.into_string().unwrap())
            .collect();

        assert_eq!(
            arguments,
            [
                "bootstrap-chain",
                "--base-path",
                "/work",
                "--account-ids",
                "5Alice,5Bob,5Charlie",
                "--authorities-account-ids",
                "5Alice,5Bob",
                "--sudo-account-id",
                "5Alice",
                "--chain-type",
                "local",
                "--session-period",
                "40",
                "--raw",
            ]
        );
    }

    #[test]
    fn sequences_count_up_from_their_start_per_node() {
        let directory = TempDir::new().unwrap();
        let mut cluster = cluster_of(&directory, 3, 3);

        cluster
            .set_flags([
                ("validator", FlagValue::Switch),
                ("unit-creation-delay", FlagValue::value(200)),
                ("ws_port", FlagValue::Sequence(9944)),
            ])
            .unwrap();

        for index in 0..3 {
            assert_eq!(flag(&cluster, index, "validator"), Some(NodeFlag::Switch));
            assert_eq!(
                flag(&cluster, index, "unit-creation-delay"),
                Some(NodeFlag::value(200))
            );
            assert_eq!(
                flag(&cluster, index, "ws_port"),
                Some(NodeFlag::value(9944 + index))
            );
        }
    }

    #[test]
    fn predicates_and_validator_flags_select_nodes() {
        let directory = TempDir::new().unwrap();
        let mut cluster = cluster_of(&directory, 4, 2);

        cluster
            .set_validator_flags([("validator", FlagValue::Switch)])
            .unwrap();
        cluster
            .set_flags_where(
                [("public-addr", FlagValue::PerNode(
                    ["a", "b", "c", "d"].map(String::from).to_vec(),
                ))],
                |_, index| index % 2 == 1,
            )
            .unwrap();

        assert_eq!(flag(&cluster, 1, "validator"), Some(NodeFlag::Switch));
        assert_eq!(flag(&cluster, 2, "validator"), None);
        assert_eq!(flag(&cluster, 0, "public-addr"), None);
        assert_eq!(flag(&cluster, 3, "public-addr"), Some(NodeFlag::value("d")));
    }

    #[test]
    fn per_node_values_must_cover_every_node() {
        let directory = TempDir::new().unwrap();
        let mut cluster = cluster_of(&directory, 3, 3);

        let result = cluster.set_flags([(
            "public-addr",
            FlagValue::PerNode(vec!["a".into(), "b".into()]),
        )]);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn selections_must_name_existing_nodes() {
        let directory = TempDir::new().unwrap();
        let mut cluster = cluster_of(&directory, 2, 2);

        assert!(matches!(
            cluster.stop(Some(&[2])),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            cluster.set_chainspec(directory.child("missing.json"), None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn chainspec_swaps_can_target_a_subset() {
        let directory = TempDir::new().unwrap();
        let mut cluster = cluster_of(&directory, 3, 3);
        let new_spec = directory.child("chainspec-new.json");
        std::fs::write(&new_spec, "{}").unwrap();

        cluster.set_chainspec(&new_spec, Some(&[1])).unwrap();
        assert_eq!(cluster[1].chainspec(), new_spec.as_path());
        assert_eq!(cluster[0].chainspec(), directory.child("chainspec.json").as_path());

        cluster.set_chainspec(&new_spec, None).unwrap();
        assert_eq!(cluster.chainspec(), Some(new_spec.as_path()));
    }

    #[tokio::test]
    async fn log_levels_are_kept_in_the_log_flag() {
        let directory = TempDir::new().unwrap();
        let mut cluster = cluster_of(&directory, 2, 2);

        cluster.set_log_level("afa", "debug", None).await.unwrap();
        cluster
            .set_log_level("wasm_substitutes", "trace", Some(&[1]))
            .await
            .unwrap();
        cluster.set_log_level("afa", "info", Some(&[1])).await.unwrap();

        assert_eq!(flag(&cluster, 0, "log"), Some(NodeFlag::value("afa=debug")));
        assert_eq!(
            flag(&cluster, 1, "log"),
            Some(NodeFlag::value("wasm_substitutes=trace,afa=info"))
        );
    }

    #[tokio::test]
    async fn unreachable_nodes_time_out_the_finalization_wait() {
        let directory = TempDir::new().unwrap();
        let cluster = cluster_of(&directory, 3, 3);

        let options = WaitOptions {
            timeout: Duration::from_millis(300),
            interval: Duration::from_millis(50),
        };
        let result = cluster
            .wait_for_finalization(100, 50, None, FinalizationMode::Absolute, options)
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(cluster.highest_finalized(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn authorities_wait_times_out_without_logs() {
        let directory = TempDir::new().unwrap();
        let cluster = cluster_of(&directory, 1, 1);

        let result = cluster
            .wait_for_authorities(None, WaitOptions::with_timeout(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[cfg(unix)]
    mod with_served_heights {
        use std::{
            os::unix::fs::PermissionsExt,
            sync::{Arc, Mutex},
        };

        use chainrunner_node_interaction::test_utils::{RpcStub, StubChain};

        use super::*;

        const OPTIONS: WaitOptions = WaitOptions {
            timeout: Duration::from_secs(20),
            interval: Duration::from_millis(50),
        };

        /// A started cluster of stand-in nodes, node `i` reporting the heights in `chains[i]`.
        fn running_cluster(directory: &TempDir, chains: &[Arc<Mutex<StubChain>>]) -> Cluster {
            let binary = directory.child("aleph-node");
            std::fs::write(&binary, "#!/bin/sh\nsleep 30\n").unwrap();
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

            let mut cluster = cluster_of(directory, chains.len(), chains.len());
            let ports = chains
                .iter()
                .map(|chain| RpcStub::chain(Arc::clone(chain)).unwrap().port().to_string())
                .collect();
            cluster
                .set_flags([("rpc-port", FlagValue::PerNode(ports))])
                .unwrap();
            cluster.set_backup(false);
            cluster.start("alpha", None).unwrap();
            cluster
        }

        /// Sets the heights of `chain` to `(best, finalized)` after `delay`.
        fn advance_later(
            chain: &Arc<Mutex<StubChain>>,
            delay: Duration,
            best: u64,
            finalized: u64,
        ) {
            let chain = Arc::clone(chain);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                *chain.lock().unwrap() = StubChain::new(best, finalized);
            });
        }

        #[tokio::test]
        async fn finalization_wait_ends_once_every_node_reaches_the_floor() {
            let directory = TempDir::new().unwrap();
            let chains = [StubChain::shared(4, 2), StubChain::shared(6, 4)];
            let mut cluster = running_cluster(&directory, &chains);

            advance_later(&chains[0], Duration::from_millis(200), 13, 11);
            advance_later(&chains[1], Duration::from_millis(300), 14, 12);
            let heights = cluster
                .wait_for_finalization(2, 8, None, FinalizationMode::Absolute, OPTIONS)
                .await
                .unwrap();

            assert_eq!(heights, [Some(11), Some(12)]);
            assert_eq!(cluster.highest_finalized(None).await.unwrap(), Some(12));
            let imported = cluster
                .wait_for_imported_at_height(13, None, OPTIONS)
                .await
                .unwrap();
            assert_eq!(imported, [Some(13), Some(14)]);
            cluster.stop(None).unwrap();
        }

        #[tokio::test]
        async fn catch_up_wait_ends_once_the_node_is_close_to_its_peers() {
            let directory = TempDir::new().unwrap();
            let chains = [StubChain::shared(102, 100), StubChain::shared(22, 20)];
            let mut cluster = running_cluster(&directory, &chains);

            advance_later(&chains[1], Duration::from_millis(200), 60, 58);
            advance_later(&chains[1], Duration::from_millis(400), 99, 97);
            let heights = cluster
                .wait_for_finalization(
                    0,
                    10,
                    Some(&[1]),
                    FinalizationMode::CatchUp { catchup_delta: 5 },
                    OPTIONS,
                )
                .await
                .unwrap();

            assert_eq!(heights, [Some(100), Some(97)]);
            cluster.stop(None).unwrap();
        }
    }

    #[cfg(unix)]
    #[test]
    fn bootstrap_creates_one_node_per_account_with_sequential_ports() {
        use std::os::unix::fs::PermissionsExt;

        let directory = TempDir::new().unwrap();
        let binary = directory.child("aleph-node");
        std::fs::write(
            &binary,
            "#!/bin/sh\n[ \"$1\" = bootstrap-chain ] || exit 1\necho '{\"name\": \"Local\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let workdir = directory.child("workdir");
        let mut cluster = Cluster::new(&workdir).unwrap();
        let mut configuration = BootstrapConfiguration::new(
            &binary,
            vec![AccountId::from("5Alice"), AccountId::from("5Bob")],
        );
        configuration.nonvalidators = vec![AccountId::from("5Charlie")];

        cluster.bootstrap(&configuration).unwrap();

        assert_eq!(cluster.len(), 3);
        assert_eq!(cluster.validator_count(), 2);
        let chainspec = workdir.join(Cluster::CHAINSPEC_FILE);
        assert_eq!(
            std::fs::read_to_string(&chainspec).unwrap(),
            "{\"name\": \"Local\"}\n"
        );
        assert_eq!(cluster[2].base_path(), workdir.join("5Charlie").as_path());
        assert!(workdir.join("5Charlie").is_dir());
        for index in 0..3 {
            assert_eq!(cluster[index].chainspec(), chainspec.as_path());
            assert_eq!(cluster[index].rpc_port().unwrap(), 9944 + index as u16);
            assert_eq!(
                flag(&cluster, index, "port"),
                Some(NodeFlag::value(30334 + index))
            );
            assert_eq!(
                flag(&cluster, index, "validator-port"),
                Some(NodeFlag::value(30343 + index))
            );
        }
    }
}

//! Linux iptables/ip6tables firewall backend.

use crate::network::{
    firewall::{
        rules::{link_rules, network_rules, port_rules, Family, Rule},
        ExposedPort, Firewaller, FirewallNetworkConfig, ReloadEvent, RuleStage, DOCKER_CHAIN,
        EXT_BRIDGES_V4, EXT_BRIDGES_V6, ISOLATION_STAGE_1, ISOLATION_STAGE_2,
        LEGACY_ISOLATION_CHAIN,
    },
    port::binding::PortBinding,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender};
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::Getters;
use log::{debug, trace, warn};
use std::{
    collections::HashMap,
    fmt::{self, Debug},
    net::IpAddr,
    path::PathBuf,
    process::Output,
    sync::{Arc, Mutex},
};
use tokio::process::Command;

#[async_trait]
/// Seam between rule construction and the firewall management binaries.
/// Tests swap this out to capture the exact command lines instead of
/// mutating kernel state.
trait CommandRunner: DynClone + Send + Sync {
    /// Spawn the prepared command and wait for its output.
    async fn run(&self, command: &mut Command) -> Result<Output>;
}

clone_trait_object!(CommandRunner);

#[derive(Clone, Default)]
/// Runs firewall commands on the host, unmodified.
struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, command: &mut Command) -> Result<Output> {
        command.output().await.context("spawn firewall command")
    }
}

/// State the firewaller keeps per network for replay after a firewalld
/// restart.
#[derive(Debug, Default)]
struct State {
    networks: HashMap<String, (FirewallNetworkConfig, RuleStage)>,
}

#[derive(Builder, Clone, Getters)]
#[builder(pattern = "owned", setter(into))]
/// The iptables-legacy firewall backend.
pub struct IptablesFirewaller {
    #[get]
    /// Path to the `iptables` binary.
    iptables_binary: PathBuf,

    #[get]
    /// Path to the `ip6tables` binary.
    ip6tables_binary: PathBuf,

    #[get]
    /// Path to the `ipset` binary.
    ipset_binary: PathBuf,

    #[builder(default = "false")]
    /// Whether the SCTP checksum workaround rule is installed per binding.
    sctp_checksum: bool,

    #[builder(default = "false")]
    /// Whether WSL2 mirrored networking was detected at driver creation.
    wsl2_mirrored: bool,

    #[builder(private, default = "Box::new(HostRunner)")]
    /// Executes the firewall management binaries.
    runner: Box<dyn CommandRunner>,

    #[builder(private, default)]
    /// Per-network replay state.
    state: Arc<Mutex<State>>,

    #[builder(private, default)]
    /// Reload event subscribers.
    subscribers: Arc<Mutex<Vec<Sender<ReloadEvent>>>>,
}

impl Debug for IptablesFirewaller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IptablesFirewaller")
            .field("iptables_binary", self.iptables_binary())
            .field("ip6tables_binary", self.ip6tables_binary())
            .field("ipset_binary", self.ipset_binary())
            .finish()
    }
}

impl IptablesFirewaller {
    /// Create a firewaller resolving the required binaries from `$PATH`.
    pub fn new(sctp_checksum: bool, wsl2_mirrored: bool) -> Result<Self> {
        IptablesFirewallerBuilder::default()
            .iptables_binary(which::which("iptables").context("find iptables binary in $PATH")?)
            .ip6tables_binary(
                which::which("ip6tables").context("find ip6tables binary in $PATH")?,
            )
            .ipset_binary(which::which("ipset").context("find ipset binary in $PATH")?)
            .sctp_checksum(sctp_checksum)
            .wsl2_mirrored(wsl2_mirrored)
            .build()
            .context("create iptables firewaller")
    }

    /// Run an iptables command of the provided family and retrieve its
    /// output.
    async fn run(&self, family: Family, args: &[&str]) -> Result<String> {
        let binary = match family {
            Family::V4 => self.iptables_binary(),
            Family::V6 => self.ip6tables_binary(),
        };
        trace!("Running: {} {}", binary.display(), args.join(" "));

        let output = self
            .runner
            .run(Command::new(binary).arg("--wait").args(args))
            .await
            .context("run iptables")?;

        if !output.status.success() {
            bail!(
                "command {} {} failed with error: {}",
                binary.display(),
                args.join(" "),
                String::from_utf8(output.stderr).context("convert stderr to string")?
            )
        }

        Ok(String::from_utf8(output.stdout)
            .context("convert stdout to string")?
            .trim()
            .into())
    }

    /// Run an ipset command.
    async fn ipset(&self, args: &[&str]) -> Result<()> {
        trace!(
            "Running: {} {}",
            self.ipset_binary().display(),
            args.join(" ")
        );

        let output = self
            .runner
            .run(Command::new(self.ipset_binary()).args(args))
            .await
            .context("run ipset")?;

        if !output.status.success() {
            bail!(
                "command ipset {} failed with error: {}",
                args.join(" "),
                String::from_utf8(output.stderr).context("convert stderr to string")?
            )
        }
        Ok(())
    }

    /// Checks if the given rulespec exists in the provided table/chain.
    async fn rule_exists(&self, family: Family, table: &str, chain: &str, rule: &[&str]) -> bool {
        let mut args = vec!["-t", table, "-C", chain];
        args.extend_from_slice(rule);
        self.run(family, &args).await.is_ok()
    }

    /// Add a rule to a chain if it does not already exist. By default the
    /// rule is appended, unless `prepend` is true.
    async fn rule_ensure(
        &self,
        family: Family,
        table: &str,
        chain: &str,
        rule: &[&str],
        prepend: bool,
    ) -> Result<()> {
        if self.rule_exists(family, table, chain, rule).await {
            return Ok(());
        }

        let mut args = if prepend {
            vec!["-t", table, "-I", chain, "1"]
        } else {
            vec!["-t", table, "-A", chain]
        };
        args.extend_from_slice(rule);
        self.run(family, &args).await.context("insert rule")?;
        Ok(())
    }

    /// Delete a rule from a chain. A no-op if the rule does not exist.
    async fn rule_delete(
        &self,
        family: Family,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<()> {
        if !self.rule_exists(family, table, chain, rule).await {
            return Ok(());
        }

        let mut args = vec!["-t", table, "-D", chain];
        args.extend_from_slice(rule);
        self.run(family, &args).await.context("delete rule")?;
        Ok(())
    }

    /// List all available iptables chain names for the provided `table`.
    async fn chain_names(&self, family: Family, table: &str) -> Result<Vec<String>> {
        let output = self.run(family, &["-t", table, "-S"]).await?;

        // Chain definitions always come before rules, one of:
        // -P OUTPUT ACCEPT
        // -N Custom
        let mut chains = vec![];
        for line in output.lines() {
            match (line.strip_prefix("-P"), line.strip_prefix("-N")) {
                (Some(chain), _) | (_, Some(chain)) => chains.push(
                    chain
                        .trim()
                        .split_whitespace()
                        .next()
                        .with_context(|| format!("invalid chain output format: {}", line))?
                        .into(),
                ),
                _ => break,
            }
        }

        Ok(chains)
    }

    /// Checks if the provided chain exists.
    async fn chain_exists(&self, family: Family, table: &str, chain: &str) -> Result<bool> {
        Ok(self
            .chain_names(family, table)
            .await
            .context("list chains")?
            .iter()
            .any(|name| name == chain))
    }

    /// Check whether the provided chain exists in the table and create it if
    /// not.
    async fn chain_ensure(&self, family: Family, table: &str, chain: &str) -> Result<()> {
        if !self
            .chain_exists(family, table, chain)
            .await
            .context("check if chain exists")?
        {
            self.run(family, &["-t", table, "-N", chain])
                .await
                .context("create new chain")?;
        }
        Ok(())
    }

    /// Flush and delete a chain. A no-op if the chain does not exist.
    async fn chain_remove(&self, family: Family, table: &str, chain: &str) -> Result<()> {
        if !self
            .chain_exists(family, table, chain)
            .await
            .context("check if chain exists")?
        {
            return Ok(());
        }
        self.run(family, &["-t", table, "-F", chain])
            .await
            .context("flush chain")?;
        self.run(family, &["-t", table, "-X", chain])
            .await
            .context("delete chain")?;
        Ok(())
    }

    /// Install a constructed rule.
    async fn apply(&self, rule: &Rule) -> Result<()> {
        let spec: Vec<&str> = rule.spec.iter().map(AsRef::as_ref).collect();
        self.rule_ensure(rule.family, rule.table, rule.chain, &spec, rule.prepend)
            .await
            .with_context(|| format!("install rule {}", rule.to_line()))
    }

    /// Remove a constructed rule.
    async fn remove(&self, rule: &Rule) -> Result<()> {
        let spec: Vec<&str> = rule.spec.iter().map(AsRef::as_ref).collect();
        self.rule_delete(rule.family, rule.table, rule.chain, &spec)
            .await
            .with_context(|| format!("remove rule {}", rule.to_line()))
    }

    /// The external-bridges ipset name of one family.
    fn ipset_name(family: Family) -> &'static str {
        match family {
            Family::V4 => EXT_BRIDGES_V4,
            Family::V6 => EXT_BRIDGES_V6,
        }
    }

    /// Add or remove the network's subnets in the external-bridges ipsets.
    async fn ipset_membership(&self, config: &FirewallNetworkConfig, add: bool) -> Result<()> {
        let mut members = vec![];
        if let Some(net) = config.ipv4 {
            members.push((Family::V4, net.to_string()));
        }
        if let Some(net) = config.ipv6 {
            members.push((Family::V6, net.to_string()));
        }

        for (family, subnet) in members {
            let name = Self::ipset_name(family);
            if add {
                self.ipset(&["add", name, &subnet, "-exist"])
                    .await
                    .context("add ipset member")?;
            } else {
                self.ipset(&["del", name, &subnet, "-exist"])
                    .await
                    .context("del ipset member")?;
            }
        }
        Ok(())
    }

    /// Base chain and jump rule setup of one address family.
    async fn init_family(&self, family: Family) -> Result<()> {
        self.chain_ensure(family, "nat", DOCKER_CHAIN).await?;
        self.chain_ensure(family, "filter", DOCKER_CHAIN).await?;
        self.chain_ensure(family, "filter", ISOLATION_STAGE_1).await?;
        self.chain_ensure(family, "filter", ISOLATION_STAGE_2).await?;

        // One-shot upgrade: the single stage isolation chain is superseded.
        // A sibling tool's chain of the same name would be removed too.
        self.rule_delete(family, "filter", "FORWARD", &["-j", LEGACY_ISOLATION_CHAIN])
            .await?;
        self.chain_remove(family, "filter", LEGACY_ISOLATION_CHAIN)
            .await?;

        let set = Self::ipset_name(family);
        let set_family = match family {
            Family::V4 => "inet",
            Family::V6 => "inet6",
        };
        self.ipset(&["create", set, "hash:net", "family", set_family, "-exist"])
            .await
            .context("create ipset")?;

        // Jump order in FORWARD: isolation first, then the DOCKER chain for
        // externally reachable bridges, then the conntrack shortcut.
        self.rule_ensure(
            family,
            "filter",
            "FORWARD",
            &[
                "-m",
                "set",
                "--match-set",
                set,
                "dst",
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
            true,
        )
        .await?;
        self.rule_ensure(
            family,
            "filter",
            "FORWARD",
            &["-m", "set", "--match-set", set, "dst", "-j", DOCKER_CHAIN],
            true,
        )
        .await?;
        self.rule_ensure(
            family,
            "filter",
            "FORWARD",
            &["-j", ISOLATION_STAGE_1],
            true,
        )
        .await?;

        if family == Family::V4 && self.wsl2_mirrored {
            // WSL2 mirrored networking loops host traffic through loopback0;
            // it must bypass the DNAT rules.
            self.rule_ensure(
                family,
                "nat",
                DOCKER_CHAIN,
                &["-i", "loopback0", "-d", "127.0.0.0/8", "-j", "RETURN"],
                true,
            )
            .await?;
        }

        Ok(())
    }

    /// Remove per-bridge FORWARD jump rules superseded by the ipset variants.
    async fn remove_legacy_bridge_rules(&self, config: &FirewallNetworkConfig) -> Result<()> {
        let br = config.bridge_name.as_str();
        for family in [Family::V4, Family::V6] {
            self.rule_delete(family, "filter", "FORWARD", &["-o", br, "-j", DOCKER_CHAIN])
                .await?;
            self.rule_delete(
                family,
                "filter",
                "FORWARD",
                &[
                    "-o",
                    br,
                    "-m",
                    "conntrack",
                    "--ctstate",
                    "RELATED,ESTABLISHED",
                    "-j",
                    "ACCEPT",
                ],
            )
            .await?;
        }
        Ok(())
    }

    fn set_stage(&self, bridge: &str, config: &FirewallNetworkConfig, stage: RuleStage) {
        let mut state = self.state.lock().expect("lock firewaller state");
        match stage {
            RuleStage::Deleted => {
                state.networks.remove(bridge);
            }
            _ => {
                state
                    .networks
                    .insert(bridge.into(), (config.clone(), stage));
            }
        }
    }
}

#[async_trait]
impl Firewaller for IptablesFirewaller {
    async fn init(&self) -> Result<()> {
        debug!("Initializing firewall base chains");
        self.init_family(Family::V4).await.context("init IPv4")?;
        self.init_family(Family::V6).await.context("init IPv6")?;
        Ok(())
    }

    async fn add_network(&self, config: &FirewallNetworkConfig) -> Result<()> {
        debug!("Installing firewall rules for bridge {}", config.bridge_name);
        self.set_stage(&config.bridge_name, config, RuleStage::ChainsReady);

        self.remove_legacy_bridge_rules(config)
            .await
            .context("remove legacy bridge rules")?;

        if !config.internal {
            self.ipset_membership(config, true)
                .await
                .context("register bridge subnets")?;
        }

        for rule in network_rules(config) {
            self.apply(&rule).await?;
        }

        self.set_stage(&config.bridge_name, config, RuleStage::RulesReady);
        Ok(())
    }

    async fn del_network(&self, config: &FirewallNetworkConfig) -> Result<()> {
        debug!("Removing firewall rules for bridge {}", config.bridge_name);

        for rule in network_rules(config).iter().rev() {
            self.remove(rule).await?;
        }

        if !config.internal {
            self.ipset_membership(config, false)
                .await
                .context("deregister bridge subnets")?;
        }

        self.set_stage(&config.bridge_name, config, RuleStage::Deleted);
        Ok(())
    }

    async fn add_ports(
        &self,
        config: &FirewallNetworkConfig,
        bindings: &[PortBinding],
    ) -> Result<()> {
        for binding in bindings {
            for rule in port_rules(config, binding, self.sctp_checksum) {
                self.apply(&rule).await?;
            }
        }
        Ok(())
    }

    async fn del_ports(
        &self,
        config: &FirewallNetworkConfig,
        bindings: &[PortBinding],
    ) -> Result<()> {
        for binding in bindings {
            for rule in port_rules(config, binding, self.sctp_checksum).iter().rev() {
                self.remove(rule).await?;
            }
        }
        Ok(())
    }

    async fn add_link(
        &self,
        _config: &FirewallNetworkConfig,
        parent_ip: IpAddr,
        child_ip: IpAddr,
        exposed_ports: &[ExposedPort],
    ) -> Result<()> {
        for rule in link_rules(parent_ip, child_ip, exposed_ports) {
            self.apply(&rule).await?;
        }
        Ok(())
    }

    async fn del_link(
        &self,
        _config: &FirewallNetworkConfig,
        parent_ip: IpAddr,
        child_ip: IpAddr,
        exposed_ports: &[ExposedPort],
    ) -> Result<()> {
        for rule in link_rules(parent_ip, child_ip, exposed_ports).iter().rev() {
            self.remove(rule).await?;
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        debug!("Replaying firewall rules after reload");
        self.init().await.context("replay base chains")?;

        let networks: Vec<FirewallNetworkConfig> = {
            let state = self.state.lock().expect("lock firewaller state");
            state
                .networks
                .values()
                .filter(|(_, stage)| *stage == RuleStage::RulesReady)
                .map(|(config, _)| config.clone())
                .collect()
        };
        for config in networks {
            if let Err(e) = self.add_network(&config).await {
                warn!(
                    "Replay of network rules for {} failed: {}",
                    config.bridge_name,
                    crate::error::chain(e)
                );
            }
        }

        // Subscribers replay their per-port rules; dead subscribers are
        // dropped.
        let mut subscribers = self.subscribers.lock().expect("lock subscribers");
        subscribers.retain(|tx| tx.send(ReloadEvent).is_ok());
        Ok(())
    }

    fn subscribe_reload(&self) -> Receiver<ReloadEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .expect("lock subscribers")
            .push(tx);
        rx
    }
}

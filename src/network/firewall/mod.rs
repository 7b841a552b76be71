//! Kernel firewall programming for bridge networks.

use crate::network::{
    port::binding::{PortBinding, Protocol},
    types::GwMode,
};
use anyhow::Result;
use async_trait::async_trait;
use crossbeam_channel::Receiver;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use ipnetwork::{Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub mod iptables;
pub mod rules;

/// Chain receiving per-port DNAT (nat table) and ACCEPT (filter table) rules.
pub const DOCKER_CHAIN: &str = "DOCKER";

/// First stage of the inter-network isolation chain pair.
pub const ISOLATION_STAGE_1: &str = "DOCKER-ISOLATION-STAGE-1";

/// Second stage of the inter-network isolation chain pair.
pub const ISOLATION_STAGE_2: &str = "DOCKER-ISOLATION-STAGE-2";

/// Obsolete single stage isolation chain, removed on startup.
pub const LEGACY_ISOLATION_CHAIN: &str = "DOCKER-ISOLATION";

/// ipset holding the IPv4 subnets of externally reachable bridges.
pub const EXT_BRIDGES_V4: &str = "docker-ext-bridges-v4";

/// ipset holding the IPv6 subnets of externally reachable bridges.
pub const EXT_BRIDGES_V6: &str = "docker-ext-bridges-v6";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// A firewalld style reload happened; network scope chains were replayed and
/// per-port rules of active bindings must be replayed by the subscriber.
pub struct ReloadEvent;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Rule programming state of one network, advanced by the firewaller.
pub enum RuleStage {
    New,
    ChainsReady,
    RulesReady,
    Deleted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// A port exposed by an endpoint, used by the legacy container links ACLs.
pub struct ExposedPort {
    /// Transport protocol of the exposed port.
    pub proto: Protocol,

    /// The port number inside the container.
    pub port: u16,
}

#[derive(Builder, Clone, Debug, Default)]
#[builder(default, pattern = "owned", setter(into))]
/// Everything the firewaller needs to know about one bridge network.
pub struct FirewallNetworkConfig {
    /// Name of the bridge device.
    pub bridge_name: String,

    /// The IPv4 subnet on the bridge, if any.
    pub ipv4: Option<Ipv4Network>,

    /// The IPv6 subnet on the bridge, if any.
    pub ipv6: Option<Ipv6Network>,

    /// Whether containers on this bridge may talk to each other.
    pub icc: bool,

    /// Whether traffic leaving the bridge is masqueraded.
    pub masquerade: bool,

    /// Whether the bridge is isolated from every other interface.
    pub internal: bool,

    /// IPv4 gateway mode.
    pub gw_mode_v4: GwMode,

    /// IPv6 gateway mode.
    pub gw_mode_v6: GwMode,

    /// Explicit IPv4 SNAT source address.
    pub host_ipv4: Option<Ipv4Addr>,

    /// Explicit IPv6 SNAT source address.
    pub host_ipv6: Option<Ipv6Addr>,

    /// Hairpin NAT is in effect (no userland proxy); DNAT rules then also
    /// match traffic originating on the bridge itself.
    pub hairpin: bool,
}

impl FirewallNetworkConfig {
    /// The gateway mode of the provided address family.
    pub fn gw_mode(&self, ipv6: bool) -> GwMode {
        if ipv6 {
            self.gw_mode_v6
        } else {
            self.gw_mode_v4
        }
    }

    /// Whether the provided host address family is NATed.
    pub fn nat(&self, ipv6: bool) -> bool {
        self.gw_mode(ipv6).nat()
    }
}

#[async_trait]
/// Firewall backend behavior trait, pluggable between iptables-legacy and
/// nftables style implementations.
pub trait Firewaller: DynClone + Send + Sync {
    /// Create the process wide chains, ipsets and jump rules, and remove
    /// superseded legacy rules. Called once at driver creation.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Install the network scope rules (isolation, NAT, ICC) for a bridge.
    async fn add_network(&self, _config: &FirewallNetworkConfig) -> Result<()> {
        Ok(())
    }

    /// Remove the network scope rules of a bridge.
    async fn del_network(&self, _config: &FirewallNetworkConfig) -> Result<()> {
        Ok(())
    }

    /// Install the per-port rules of the provided bindings.
    async fn add_ports(
        &self,
        _config: &FirewallNetworkConfig,
        _bindings: &[PortBinding],
    ) -> Result<()> {
        Ok(())
    }

    /// Remove the per-port rules of the provided bindings.
    async fn del_ports(
        &self,
        _config: &FirewallNetworkConfig,
        _bindings: &[PortBinding],
    ) -> Result<()> {
        Ok(())
    }

    /// Permit the parent to reach the child's exposed ports.
    async fn add_link(
        &self,
        _config: &FirewallNetworkConfig,
        _parent_ip: IpAddr,
        _child_ip: IpAddr,
        _exposed_ports: &[ExposedPort],
    ) -> Result<()> {
        Ok(())
    }

    /// Remove the parent/child ACLs again.
    async fn del_link(
        &self,
        _config: &FirewallNetworkConfig,
        _parent_ip: IpAddr,
        _child_ip: IpAddr,
        _exposed_ports: &[ExposedPort],
    ) -> Result<()> {
        Ok(())
    }

    /// Replay every network scope rule, then notify subscribers so they can
    /// replay their per-port rules. Invoked on firewalld restart.
    async fn reload(&self) -> Result<()> {
        Ok(())
    }

    /// Subscribe to reload events. The default implementation returns an
    /// already disconnected channel which never fires.
    fn subscribe_reload(&self) -> Receiver<ReloadEvent> {
        let (_, rx) = crossbeam_channel::unbounded();
        rx
    }
}

clone_trait_object!(Firewaller);

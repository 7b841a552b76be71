//! The bridge network driver: network and endpoint lifecycle plus external
//! connectivity.

pub mod bridge;
pub mod endpoint;
pub mod firewall;
pub mod netlink;
pub mod port;
pub mod sysctl;
pub mod types;

use crate::{
    config::DriverConfig,
    error::{chain, ErrorAccumulator, NetworkError},
    network::{
        bridge::Bridge,
        endpoint::{Endpoint, EndpointConfig},
        firewall::{Firewaller, FirewallNetworkConfig, FirewallNetworkConfigBuilder},
        netlink::Netlink,
        port::{
            allocator::PortAllocator,
            binding::{FamilySupport, PortBinding, PortBindingRequest},
            driver::PortDriver,
            proxy::ProxySupervisor,
            PortMapper,
        },
        sysctl::SysctlSet,
        types::NetworkConfig,
    },
    storage::{EndpointStore, KeyValueStorage},
};
use anyhow::{Context, Error, Result};
use derive_builder::Builder;
use getset::Getters;
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::{Arc, Mutex, Weak},
};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Builder, Clone, Getters)]
#[builder(pattern = "owned", setter(into))]
/// The collaborators a driver is constructed from. Tests inject mocks here;
/// nothing in the driver reaches for process wide singletons.
pub struct DriverContext {
    #[get = "pub"]
    /// Netlink interface used for all link and address operations.
    netlink: Box<dyn Netlink>,

    #[get = "pub"]
    /// Firewall backend.
    firewaller: Box<dyn Firewaller>,

    #[get = "pub"]
    /// Host port arbiter.
    allocator: Arc<PortAllocator>,

    #[builder(default)]
    #[get = "pub"]
    /// Rootless port driver, if the daemon runs in a user namespace.
    port_driver: Option<Box<dyn PortDriver>>,

    #[builder(default)]
    #[get = "pub"]
    /// Process wide configuration.
    config: DriverConfig,

    #[builder(default)]
    #[get = "pub"]
    /// Endpoint record persistence.
    store: Option<EndpointStore>,
}

/// One managed network and everything scoped to it.
struct Network {
    config: NetworkConfig,
    fw_config: FirewallNetworkConfig,
    bridge: Bridge,
    endpoints: HashMap<String, Endpoint>,
    sysctls: SysctlSet,
}

type NetworkHandle = Arc<AsyncMutex<Network>>;

/// The driver wide network table. The outer lock is held only to insert,
/// look up or remove entries; all real work happens under the per-network
/// async lock.
type NetworkMap = Arc<Mutex<HashMap<String, (NetworkConfig, NetworkHandle)>>>;

/// Addresses and interface name handed to the runtime when a container
/// joins.
#[derive(Clone, Debug, Getters)]
pub struct JoinInfo {
    #[get = "pub"]
    /// Container side interface name to move into the sandbox.
    src_name: String,

    #[get = "pub"]
    /// Name prefix for the interface inside the sandbox.
    dst_prefix: String,

    #[get = "pub"]
    /// IPv4 gateway of the network.
    gateway_v4: Option<Ipv4Addr>,

    #[get = "pub"]
    /// IPv6 gateway of the network.
    gateway_v6: Option<Ipv6Addr>,
}

/// The Linux bridge network driver.
pub struct BridgeDriver {
    ctx: DriverContext,
    mapper: Arc<PortMapper>,
    networks: NetworkMap,
}

impl BridgeDriver {
    /// Create the driver: initialize the firewall base chains and start
    /// listening for firewall reload events.
    pub async fn new(ctx: DriverContext) -> Result<Self> {
        ctx.firewaller()
            .init()
            .await
            .context("initialize firewaller")?;

        let proxy = match (ctx.config().userland_proxy(), ctx.config().userland_proxy_path()) {
            (true, Some(path)) => Some(ProxySupervisor::new(path)),
            _ => None,
        };
        let mapper = Arc::new(PortMapper::new(
            Arc::clone(ctx.allocator()),
            ctx.firewaller().clone(),
            ctx.port_driver().clone(),
            proxy,
        ));

        let driver = Self {
            ctx,
            mapper,
            networks: Arc::default(),
        };
        driver.spawn_reload_listener();
        Ok(driver)
    }

    /// Replay per-port rules of all active bindings whenever the firewaller
    /// reports a reload. Replay failures are logged and never fail bindings.
    fn spawn_reload_listener(&self) {
        let rx = self.ctx.firewaller().subscribe_reload();
        let networks: Weak<_> = Arc::downgrade(&self.networks);
        let firewaller = self.ctx.firewaller().clone();

        // A plain thread bridges the blocking channel into the runtime, so
        // runtime shutdown never waits on an idle subscription.
        let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
        std::thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                if events.recv().await.is_none() {
                    break;
                }
                let networks = match networks.upgrade() {
                    Some(networks) => networks,
                    None => break,
                };

                let handles: Vec<NetworkHandle> = networks
                    .lock()
                    .expect("lock network map")
                    .values()
                    .map(|(_, handle)| Arc::clone(handle))
                    .collect();
                for handle in handles {
                    let network = handle.lock().await;
                    let bindings: Vec<PortBinding> = network
                        .endpoints
                        .values()
                        .flat_map(|ep| ep.port_bindings().iter().map(|a| a.binding().clone()))
                        .collect();
                    if bindings.is_empty() {
                        continue;
                    }
                    if let Err(e) = firewaller.add_ports(&network.fw_config, &bindings).await {
                        warn!(
                            "Replaying port rules for {} failed: {}",
                            network.config.id(),
                            chain(e)
                        );
                    }
                }
            }
        });
    }

    /// Whether the userland proxy handles published ports.
    fn proxy_enabled(&self) -> bool {
        self.ctx.config().userland_proxy() && self.ctx.config().userland_proxy_path().is_some()
    }

    /// Create a network: validate, set up the bridge device, flip the kernel
    /// toggles and install the network scope firewall rules. Any failure
    /// unwinds the steps already taken.
    pub async fn create_network(&self, config: NetworkConfig) -> Result<()> {
        config.validate()?;
        {
            let networks = self.networks.lock().expect("lock network map");
            if networks.contains_key(config.id()) {
                return Err(Error::new(NetworkError::Forbidden(format!(
                    "network {} already exists",
                    config.id()
                ))));
            }
            for (other, _) in networks.values() {
                if config.conflicts_with(other) {
                    return Err(Error::new(NetworkError::Conflict(format!(
                        "network {} conflicts with {}",
                        config.id(),
                        other.id()
                    ))));
                }
            }
        }

        info!("Creating network {}", config.id());
        let bridge = Bridge::ensure(self.ctx.netlink().clone(), &config).await?;

        let mut sysctls = SysctlSet::default();
        match self.setup_network(&bridge, &config, &mut sysctls).await {
            Ok(fw_config) => {
                let handle = Arc::new(AsyncMutex::new(Network {
                    config: config.clone(),
                    fw_config,
                    bridge,
                    endpoints: HashMap::new(),
                    sysctls,
                }));
                self.networks
                    .lock()
                    .expect("lock network map")
                    .insert(config.id().clone(), (config, handle));
                Ok(())
            }
            Err(e) => {
                sysctls.revert();
                if let Err(cleanup) = bridge.delete().await {
                    warn!("Removing bridge after failed create: {}", chain(cleanup));
                }
                Err(e)
            }
        }
    }

    /// The fallible middle part of network creation, separated so its caller
    /// can unwind the bridge and sysctls in one place.
    async fn setup_network(
        &self,
        bridge: &Bridge,
        config: &NetworkConfig,
        sysctls: &mut SysctlSet,
    ) -> Result<FirewallNetworkConfig> {
        if let Some(cidr) = config.ipv4_cidr() {
            let gateway = config
                .effective_gateway_v4()
                .context("no usable IPv4 gateway")?;
            bridge.program_ipv4(gateway, cidr.prefix()).await?;
        }
        if let Some(cidr) = config.ipv6_cidr() {
            let gateway = config
                .effective_gateway_v6()
                .context("no usable IPv6 gateway")?;
            bridge.program_ipv6(gateway, cidr.prefix()).await?;
        }
        bridge.set_mtu(config.mtu()).await?;
        bridge.up().await?;

        let hairpin = !self.proxy_enabled();
        if self.ctx.config().manage_sysctls() {
            if config.ipv4_cidr().is_some() && !config.internal() {
                sysctls.enable_ip_forward()?;
            }
            if config.ipv6_cidr().is_some() {
                sysctls.enable_ipv6_forwarding()?;
                sysctls.prepare_bridge_ipv6(bridge.name())?;
            }
            // Without br_netfilter the bridge cannot run traffic through the
            // chains; published ports still work through the proxy.
            if let Err(e) = sysctls.enable_bridge_nf_call(config.ipv6_cidr().is_some()) {
                warn!("Cannot enable bridge-nf-call: {}", chain(e));
            }
            if hairpin && config.ipv4_cidr().is_some() {
                sysctls.enable_route_localnet(bridge.name())?;
            }
        }

        let fw_config = FirewallNetworkConfigBuilder::default()
            .bridge_name(bridge.name().clone())
            .ipv4(config.ipv4_cidr())
            .ipv6(config.ipv6_cidr())
            .icc(config.icc())
            .masquerade(config.ip_masquerade())
            .internal(config.internal())
            .gw_mode_v4(config.gw_mode_v4())
            .gw_mode_v6(config.gw_mode_v6())
            .host_ipv4(config.host_ipv4())
            .host_ipv6(config.host_ipv6())
            .hairpin(hairpin)
            .build()
            .map_err(|e| Error::new(NetworkError::Internal(e.to_string())))?;

        self.ctx
            .firewaller()
            .add_network(&fw_config)
            .await
            .context("install network firewall rules")?;

        Ok(fw_config)
    }

    /// Delete a network. All teardown steps run; their failures are combined.
    pub async fn delete_network(&self, id: &str) -> Result<()> {
        let handle = self.network_handle(id)?;
        let mut network = handle.lock().await;

        if !network.endpoints.is_empty() {
            return Err(Error::new(NetworkError::Forbidden(format!(
                "network {} still has {} endpoints",
                id,
                network.endpoints.len()
            ))));
        }

        info!("Deleting network {}", id);
        let mut acc = ErrorAccumulator::default();
        acc.push(
            self.ctx
                .firewaller()
                .del_network(&network.fw_config)
                .await
                .context("remove network firewall rules"),
        );
        acc.push(network.bridge.delete().await);
        network.sysctls.revert();

        self.networks.lock().expect("lock network map").remove(id);
        acc.into_result()
    }

    /// Create an endpoint on a network.
    pub async fn create_endpoint(&self, nid: &str, config: EndpointConfig) -> Result<()> {
        let handle = self.network_handle(nid)?;
        let mut network = handle.lock().await;

        if network.endpoints.contains_key(config.id()) {
            return Err(Error::new(NetworkError::Forbidden(format!(
                "endpoint {} already exists",
                config.id()
            ))));
        }

        // Addresses come from IPAM and must lie on the bridge subnets.
        if let Some(addr) = config.addr_v4() {
            let contained = network
                .config
                .ipv4_cidr()
                .map(|cidr| cidr.contains(addr.ip()))
                .unwrap_or(false);
            if !contained {
                return Err(Error::new(NetworkError::InvalidParameter(format!(
                    "address {} is outside the network subnet",
                    addr
                ))));
            }
        }
        if let Some(addr) = config.addr_v6() {
            let contained = network
                .config
                .ipv6_cidr()
                .map(|cidr| cidr.contains(addr.ip()))
                .unwrap_or(false);
            if !contained {
                return Err(Error::new(NetworkError::InvalidParameter(format!(
                    "address {} is outside the network subnet",
                    addr
                ))));
            }
        }

        let hairpin = !self.proxy_enabled();
        let endpoint = Endpoint::create(
            self.ctx.netlink().as_ref(),
            &network.bridge.name().clone(),
            network.bridge.index(),
            network.config.mtu(),
            hairpin,
            &config,
        )
        .await?;

        self.persist_endpoint(nid, &endpoint);
        network.endpoints.insert(endpoint.id().clone(), endpoint);
        Ok(())
    }

    /// Delete an endpoint: revoke its ports, drop its link ACLs and remove
    /// the veth pair. Cleanup is best-effort across all steps.
    pub async fn delete_endpoint(&self, nid: &str, eid: &str) -> Result<()> {
        let handle = self.network_handle(nid)?;
        let mut network = handle.lock().await;

        let mut endpoint = network
            .endpoints
            .remove(eid)
            .with_context(|| not_found(nid, eid))?;

        let mut acc = ErrorAccumulator::default();

        let bindings = std::mem::take(endpoint.port_bindings_mut());
        if !bindings.is_empty() {
            acc.push(
                self.mapper
                    .release_port_bindings(&network.fw_config, bindings)
                    .await
                    .context("release port bindings"),
            );
        }
        if !network.config.icc() {
            acc.push(
                self.apply_links(&network, &endpoint, false)
                    .await
                    .context("remove link rules"),
            );
        }
        endpoint.delete(self.ctx.netlink().as_ref()).await;

        if let Some(store) = self.ctx.store() {
            let mut store = store.clone();
            acc.push(store.remove(eid).context("remove endpoint record"));
        }

        acc.into_result()
    }

    /// Realize the provided port binding requests for an endpoint. The
    /// resulting binding set is visible only after complete success; any
    /// failure leaves the endpoint unchanged.
    pub async fn program_external_connectivity(
        &self,
        nid: &str,
        eid: &str,
        requests: &[PortBindingRequest],
        default_host_ip: IpAddr,
    ) -> Result<Vec<PortBinding>> {
        let handle = self.network_handle(nid)?;
        let mut network = handle.lock().await;

        let endpoint = network
            .endpoints
            .get(eid)
            .with_context(|| not_found(nid, eid))?;
        if !endpoint.port_bindings().is_empty() {
            return Err(Error::new(NetworkError::Forbidden(format!(
                "endpoint {} already has published ports, revoke them first",
                eid
            ))));
        }

        let support = FamilySupport {
            addr_v4: endpoint.addr_v4().map(|a| a.ip()),
            addr_v6: endpoint.addr_v6().map(|a| a.ip()),
            nat_v4: network.config.gw_mode_v4().nat(),
            nat_v6: network.config.gw_mode_v6().nat(),
            proxy: self.proxy_enabled(),
        };

        let active = self
            .mapper
            .add_port_mappings(&network.fw_config, support, requests, default_host_ip)
            .await?;
        let bindings: Vec<PortBinding> = active.iter().map(|a| a.binding().clone()).collect();

        let endpoint = network
            .endpoints
            .get_mut(eid)
            .with_context(|| not_found(nid, eid))?;
        *endpoint.port_bindings_mut() = active;
        *endpoint.publish_requests_mut() = requests.to_vec();

        let endpoint = network.endpoints.get(eid).expect("endpoint just updated");
        self.persist_endpoint(nid, endpoint);
        Ok(bindings)
    }

    /// Release every published port of an endpoint.
    pub async fn revoke_external_connectivity(&self, nid: &str, eid: &str) -> Result<()> {
        let handle = self.network_handle(nid)?;
        let mut network = handle.lock().await;

        let endpoint = network
            .endpoints
            .get_mut(eid)
            .with_context(|| not_found(nid, eid))?;
        let bindings = std::mem::take(endpoint.port_bindings_mut());
        endpoint.publish_requests_mut().clear();

        let res = self
            .mapper
            .release_port_bindings(&network.fw_config, bindings)
            .await;

        let endpoint = network.endpoints.get(eid).expect("endpoint still present");
        self.persist_endpoint(nid, endpoint);
        res
    }

    /// Hand the container side interface and gateways to the runtime, and
    /// install the legacy link ACLs when ICC is disabled.
    pub async fn join(&self, nid: &str, eid: &str) -> Result<JoinInfo> {
        let handle = self.network_handle(nid)?;
        let network = handle.lock().await;

        let endpoint = network
            .endpoints
            .get(eid)
            .with_context(|| not_found(nid, eid))?;

        if !network.config.icc() {
            self.apply_links(&network, endpoint, true)
                .await
                .context("install link rules")?;
        }

        Ok(JoinInfo {
            src_name: endpoint.src_name().clone(),
            dst_prefix: "eth".into(),
            gateway_v4: network.config.effective_gateway_v4(),
            gateway_v6: network.config.effective_gateway_v6(),
        })
    }

    /// Remove the link ACLs installed at join time.
    pub async fn leave(&self, nid: &str, eid: &str) -> Result<()> {
        let handle = self.network_handle(nid)?;
        let network = handle.lock().await;

        let endpoint = network
            .endpoints
            .get(eid)
            .with_context(|| not_found(nid, eid))?;

        if !network.config.icc() {
            self.apply_links(&network, endpoint, false)
                .await
                .context("remove link rules")?;
        }
        Ok(())
    }

    /// Install or remove the parent/child ACLs of an endpoint's legacy
    /// links: parents reach this endpoint's exposed ports, this endpoint
    /// reaches its children's.
    async fn apply_links(&self, network: &Network, endpoint: &Endpoint, add: bool) -> Result<()> {
        let ip = match endpoint.addr_v4() {
            Some(addr) => IpAddr::V4(addr.ip()),
            None => return Ok(()),
        };
        let mut acc = ErrorAccumulator::default();

        for parent_id in &endpoint.container_config().parent_endpoints {
            let parent = match network.endpoints.get(parent_id) {
                Some(parent) => parent,
                None => {
                    debug!("Link parent {} not on this network", parent_id);
                    continue;
                }
            };
            let parent_ip = match parent.addr_v4() {
                Some(addr) => IpAddr::V4(addr.ip()),
                None => continue,
            };
            let ports = endpoint.exposed_ports();
            let res = if add {
                self.ctx
                    .firewaller()
                    .add_link(&network.fw_config, parent_ip, ip, ports)
                    .await
            } else {
                self.ctx
                    .firewaller()
                    .del_link(&network.fw_config, parent_ip, ip, ports)
                    .await
            };
            acc.push(res);
        }

        for child_id in &endpoint.container_config().child_endpoints {
            let child = match network.endpoints.get(child_id) {
                Some(child) => child,
                None => {
                    debug!("Link child {} not on this network", child_id);
                    continue;
                }
            };
            let child_ip = match child.addr_v4() {
                Some(addr) => IpAddr::V4(addr.ip()),
                None => continue,
            };
            let ports = child.exposed_ports();
            let res = if add {
                self.ctx
                    .firewaller()
                    .add_link(&network.fw_config, ip, child_ip, ports)
                    .await
            } else {
                self.ctx
                    .firewaller()
                    .del_link(&network.fw_config, ip, child_ip, ports)
                    .await
            };
            acc.push(res);
        }

        acc.into_result()
    }

    /// Look up a network handle, holding the map lock only briefly.
    fn network_handle(&self, id: &str) -> Result<NetworkHandle> {
        self.networks
            .lock()
            .expect("lock network map")
            .get(id)
            .map(|(_, handle)| Arc::clone(handle))
            .ok_or_else(|| Error::new(NetworkError::NotFound(format!("network {}", id))))
    }

    /// Write the endpoint record, if a store is configured. Persistence
    /// failures are logged, not fatal.
    fn persist_endpoint(&self, nid: &str, endpoint: &Endpoint) {
        if let Some(store) = self.ctx.store() {
            let mut store = store.clone();
            let record = endpoint.to_record(nid);
            if let Err(e) = store.insert(endpoint.id(), &record) {
                warn!("Persisting endpoint {} failed: {}", endpoint.id(), chain(e));
            }
        }
    }
}

fn not_found(nid: &str, eid: &str) -> String {
    format!("endpoint {} not found on network {}", eid, nid)
}

/// Whether WSL2 mirrored networking is active: a `loopback0` link exists and
/// the wslinfo helper binary is executable. The firewaller then installs its
/// loopback bypass rule.
pub async fn detect_wsl2_mirrored(netlink: &dyn Netlink) -> bool {
    DriverConfig::wslinfo_executable() && netlink.link_by_name("loopback0").await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{
        bridge::tests::NetlinkMock,
        port::binding::{PortBindingRequestBuilder, Protocol},
        types::tests::config as network_config,
        types::NetworkConfigBuilder,
    };
    use async_trait::async_trait;
    use crate::config::DriverConfigBuilder;
    use crate::network::endpoint::EndpointConfigBuilder;

    #[derive(Clone, Default)]
    struct FirewallerMock {
        networks_added: Arc<Mutex<Vec<String>>>,
        networks_deleted: Arc<Mutex<Vec<String>>>,
        ports_added: Arc<Mutex<Vec<PortBinding>>>,
        ports_deleted: Arc<Mutex<Vec<PortBinding>>>,
        links: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Firewaller for FirewallerMock {
        async fn add_network(&self, config: &FirewallNetworkConfig) -> Result<()> {
            self.networks_added
                .lock()
                .expect("lock")
                .push(config.bridge_name.clone());
            Ok(())
        }

        async fn del_network(&self, config: &FirewallNetworkConfig) -> Result<()> {
            self.networks_deleted
                .lock()
                .expect("lock")
                .push(config.bridge_name.clone());
            Ok(())
        }

        async fn add_ports(
            &self,
            _config: &FirewallNetworkConfig,
            bindings: &[PortBinding],
        ) -> Result<()> {
            self.ports_added
                .lock()
                .expect("lock")
                .extend_from_slice(bindings);
            Ok(())
        }

        async fn del_ports(
            &self,
            _config: &FirewallNetworkConfig,
            bindings: &[PortBinding],
        ) -> Result<()> {
            self.ports_deleted
                .lock()
                .expect("lock")
                .extend_from_slice(bindings);
            Ok(())
        }

        async fn add_link(
            &self,
            _config: &FirewallNetworkConfig,
            parent_ip: IpAddr,
            child_ip: IpAddr,
            _exposed_ports: &[firewall::ExposedPort],
        ) -> Result<()> {
            self.links
                .lock()
                .expect("lock")
                .push(format!("add {} -> {}", parent_ip, child_ip));
            Ok(())
        }

        async fn del_link(
            &self,
            _config: &FirewallNetworkConfig,
            parent_ip: IpAddr,
            child_ip: IpAddr,
            _exposed_ports: &[firewall::ExposedPort],
        ) -> Result<()> {
            self.links
                .lock()
                .expect("lock")
                .push(format!("del {} -> {}", parent_ip, child_ip));
            Ok(())
        }
    }

    async fn driver(netlink: NetlinkMock, fw: FirewallerMock) -> Result<BridgeDriver> {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = DriverContextBuilder::default()
            .netlink(Box::new(netlink) as Box<dyn Netlink>)
            .firewaller(Box::new(fw) as Box<dyn Firewaller>)
            .allocator(Arc::new(PortAllocator::new(43100, 43199)))
            .config(
                DriverConfigBuilder::default()
                    .manage_sysctls(false)
                    .build()?,
            )
            .build()?;
        BridgeDriver::new(ctx).await
    }

    fn endpoint_config(id: &str, last_octet: u8) -> EndpointConfig {
        EndpointConfigBuilder::default()
            .id(id)
            .addr_v4(Some(
                format!("172.19.0.{}/16", last_octet)
                    .parse::<ipnetwork::Ipv4Network>()
                    .unwrap(),
            ))
            .addr_v6(Some(
                format!("fdf8:b88e:bb5c:3483::{:x}/64", last_octet)
                    .parse::<ipnetwork::Ipv6Network>()
                    .unwrap(),
            ))
            .build()
            .expect("build endpoint config")
    }

    #[tokio::test]
    async fn network_lifecycle() -> Result<()> {
        let fw = FirewallerMock::default();
        let driver = driver(NetlinkMock::default(), fw.clone()).await?;

        driver.create_network(network_config()).await?;
        assert_eq!(
            *fw.networks_added.lock().expect("lock"),
            vec!["br-0123456789ab"]
        );

        // The same id again is refused.
        let err = driver.create_network(network_config()).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        driver.delete_network("0123456789abcdef").await?;
        assert_eq!(
            *fw.networks_deleted.lock().expect("lock"),
            vec!["br-0123456789ab"]
        );
        assert!(driver.delete_network("0123456789abcdef").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_subnets_are_refused() -> Result<()> {
        let driver = driver(NetlinkMock::default(), FirewallerMock::default()).await?;
        driver.create_network(network_config()).await?;

        let other = NetworkConfigBuilder::default()
            .id("fedcba98")
            .ipv4_cidr(Some("172.19.128.0/17".parse::<ipnetwork::Ipv4Network>()?))
            .build()?;
        let err = driver.create_network(other).await.unwrap_err();
        assert!(err.to_string().contains("conflicts"));
        Ok(())
    }

    #[tokio::test]
    async fn endpoint_lifecycle_with_ports() -> Result<()> {
        let fw = FirewallerMock::default();
        let driver = driver(NetlinkMock::default(), fw.clone()).await?;
        driver.create_network(network_config()).await?;
        let nid = "0123456789abcdef";

        driver
            .create_endpoint(nid, endpoint_config("ep1", 2))
            .await?;

        // Addresses outside the subnet are refused.
        let err = driver
            .create_endpoint(
                nid,
                EndpointConfigBuilder::default()
                    .id("ep2")
                    .addr_v4(Some("10.9.0.2/24".parse::<ipnetwork::Ipv4Network>()?))
                    .build()?,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the network subnet"));

        let requests = vec![PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(80u16)
            .build()?];
        let bindings = driver
            .program_external_connectivity(nid, "ep1", &requests, "0.0.0.0".parse()?)
            .await?;
        assert_eq!(bindings.len(), 2, "v4 and v6 of the one request");
        assert!(bindings.iter().all(|b| b.host_port() == 43100));

        // Programming twice without a revoke is refused.
        let err = driver
            .program_external_connectivity(nid, "ep1", &requests, "0.0.0.0".parse()?)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("revoke"));

        driver.revoke_external_connectivity(nid, "ep1").await?;
        assert_eq!(
            fw.ports_added.lock().expect("lock").len(),
            fw.ports_deleted.lock().expect("lock").len()
        );

        // A network with endpoints cannot be deleted.
        assert!(driver.delete_network(nid).await.is_err());
        driver.delete_endpoint(nid, "ep1").await?;
        driver.delete_network(nid).await?;
        Ok(())
    }

    #[tokio::test]
    async fn join_returns_gateways_and_links_follow_icc() -> Result<()> {
        let fw = FirewallerMock::default();
        let driver = driver(NetlinkMock::default(), fw.clone()).await?;

        let config = NetworkConfigBuilder::default()
            .id("noicc")
            .ipv4_cidr(Some("172.20.0.0/16".parse::<ipnetwork::Ipv4Network>()?))
            .icc(false)
            .build()?;
        driver.create_network(config).await?;

        driver
            .create_endpoint(
                "noicc",
                EndpointConfigBuilder::default()
                    .id("parent")
                    .addr_v4(Some("172.20.0.2/16".parse::<ipnetwork::Ipv4Network>()?))
                    .build()?,
            )
            .await?;
        driver
            .create_endpoint(
                "noicc",
                EndpointConfigBuilder::default()
                    .id("child")
                    .addr_v4(Some("172.20.0.3/16".parse::<ipnetwork::Ipv4Network>()?))
                    .exposed_ports(vec![firewall::ExposedPort {
                        proto: Protocol::Tcp,
                        port: 5432,
                    }])
                    .container_config(crate::storage::ContainerConfig {
                        parent_endpoints: vec!["parent".into()],
                        child_endpoints: vec![],
                    })
                    .build()?,
            )
            .await?;

        let info = driver.join("noicc", "child").await?;
        assert!(info.src_name().starts_with("veth"));
        assert_eq!(info.dst_prefix(), "eth");
        assert_eq!(*info.gateway_v4(), Some("172.20.0.1".parse()?));

        assert_eq!(
            *fw.links.lock().expect("lock"),
            vec!["add 172.20.0.2 -> 172.20.0.3"]
        );

        driver.leave("noicc", "child").await?;
        assert_eq!(fw.links.lock().expect("lock").len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() -> Result<()> {
        let driver = driver(NetlinkMock::default(), FirewallerMock::default()).await?;

        assert!(driver.delete_network("nope").await.is_err());
        assert!(driver.join("nope", "ep").await.is_err());

        driver.create_network(network_config()).await?;
        let err = driver
            .revoke_external_connectivity("0123456789abcdef", "ghost")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        Ok(())
    }
}

//! Endpoint lifecycle: veth pair creation, addressing and teardown.

use crate::{
    error::{chain, NetworkError},
    network::{
        firewall::ExposedPort,
        netlink::{netlink_errno, Netlink},
        port::{binding::PortBindingRequest, ActivePortBinding},
    },
    storage::{ContainerConfig, EndpointRecord},
};
use anyhow::{Context, Error, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters, MutGetters};
use ipnetwork::{Ipv4Network, Ipv6Network};
use log::{debug, warn};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::{IpAddr, Ipv4Addr},
    sync::atomic::{AtomicU64, Ordering},
};

/// Prefix of generated veth device names.
const VETH_PREFIX: &str = "veth";

static IFNAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a `veth`-prefixed interface name unlikely to collide.
fn random_ifname(seed: &str) -> String {
    let mut hasher = DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    seed.hash(&mut hasher);
    IFNAME_COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    format!("{}{:07x}", VETH_PREFIX, hasher.finish() & 0x0fff_ffff)
}

/// Derive a locally administered MAC address from an IPv4 address.
fn derive_mac(ip: Ipv4Addr) -> Vec<u8> {
    let octets = ip.octets();
    vec![0x02, 0x42, octets[0], octets[1], octets[2], octets[3]]
}

/// Colon separated notation of a hardware address.
fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse colon separated hardware address notation.
fn parse_mac(mac: &str) -> Result<Vec<u8>> {
    let bytes = mac
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|e| Error::new(NetworkError::InvalidParameter(format!("mac {}: {}", mac, e))))?;
    if bytes.len() != 6 {
        return Err(Error::new(NetworkError::InvalidParameter(format!(
            "mac {} must have 6 octets",
            mac
        ))));
    }
    Ok(bytes)
}

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// Creation parameters of one endpoint, addresses supplied by IPAM.
pub struct EndpointConfig {
    #[get = "pub"]
    /// Endpoint id.
    id: String,

    #[get = "pub"]
    /// IPv4 address and on-bridge prefix of the endpoint.
    addr_v4: Option<Ipv4Network>,

    #[get = "pub"]
    /// IPv6 address and on-bridge prefix of the endpoint.
    addr_v6: Option<Ipv6Network>,

    #[get = "pub"]
    /// Explicit MAC address; derived from the IPv4 address if absent.
    mac: Option<String>,

    #[get = "pub"]
    /// Ports the container exposes, consumed by the legacy links ACLs.
    exposed_ports: Vec<ExposedPort>,

    #[get = "pub"]
    /// Legacy parent/child link configuration.
    container_config: ContainerConfig,
}

#[derive(CopyGetters, Getters, MutGetters)]
/// A created endpoint and the interfaces it owns.
pub struct Endpoint {
    #[get = "pub"]
    /// Endpoint id.
    id: String,

    #[get = "pub"]
    /// Container side interface name of the veth pair.
    src_name: String,

    #[get = "pub"]
    /// Host side interface name, attached to the bridge.
    host_ifname: String,

    #[get_copy = "pub"]
    /// Host side interface index.
    host_index: u32,

    #[get = "pub"]
    /// MAC address of the container side interface.
    mac: String,

    #[get = "pub"]
    /// IPv4 address of the endpoint.
    addr_v4: Option<Ipv4Network>,

    #[get = "pub"]
    /// IPv6 address of the endpoint.
    addr_v6: Option<Ipv6Network>,

    #[get = "pub"]
    /// Ports the container exposes.
    exposed_ports: Vec<ExposedPort>,

    #[get = "pub"]
    /// Legacy parent/child link configuration.
    container_config: ContainerConfig,

    #[getset(get = "pub", get_mut = "pub")]
    /// Published ports, populated by the port mapping engine only.
    port_bindings: Vec<ActivePortBinding>,

    #[getset(get = "pub", get_mut = "pub")]
    /// The user requests behind the current `port_bindings`, kept so a
    /// restarted daemon knows what was asked for, not just what the engine
    /// resolved.
    publish_requests: Vec<PortBindingRequest>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("src_name", &self.src_name)
            .field("host_ifname", &self.host_ifname)
            .field("mac", &self.mac)
            .finish()
    }
}

impl Endpoint {
    /// Create the veth pair of an endpoint, attach the host side to the
    /// bridge and assign the container side addresses. The container side is
    /// handed over to the runtime afterwards.
    pub async fn create(
        netlink: &dyn Netlink,
        bridge_name: &str,
        bridge_index: u32,
        mtu: u32,
        hairpin: bool,
        config: &EndpointConfig,
    ) -> Result<Self> {
        let (host_name, container_name) = Self::add_veth_pair(netlink, config.id()).await?;

        let host = netlink
            .link_by_name(&host_name)
            .await
            .context("look up host side veth")?;
        let container = netlink
            .link_by_name(&container_name)
            .await
            .context("look up container side veth")?;

        netlink
            .set_link_master(host.index(), bridge_index)
            .await
            .with_context(|| format!("attach {} to bridge {}", host_name, bridge_name))?;

        if hairpin {
            Self::set_hairpin(bridge_name, &host_name)
                .await
                .context("enable hairpin mode")?;
        }

        if mtu != 0 {
            netlink
                .set_link_mtu(host.index(), mtu)
                .await
                .context("set host side mtu")?;
            netlink
                .set_link_mtu(container.index(), mtu)
                .await
                .context("set container side mtu")?;
        }

        let mac = match config.mac() {
            Some(mac) => parse_mac(mac)?,
            None => match config.addr_v4() {
                Some(addr) => derive_mac(addr.ip()),
                None => {
                    let mut hasher = DefaultHasher::new();
                    config.id().hash(&mut hasher);
                    let h = hasher.finish().to_be_bytes();
                    vec![0x02, 0x42, h[0], h[1], h[2], h[3]]
                }
            },
        };
        netlink
            .set_link_address(container.index(), mac.clone())
            .await
            .context("set container side mac")?;

        if let Some(addr) = config.addr_v4() {
            netlink
                .address_add(container.index(), IpAddr::V4(addr.ip()), addr.prefix())
                .await
                .context("assign IPv4 address")?;
        }
        if let Some(addr) = config.addr_v6() {
            netlink
                .address_add(container.index(), IpAddr::V6(addr.ip()), addr.prefix())
                .await
                .context("assign IPv6 address")?;
        }

        netlink
            .set_link_up(host.index())
            .await
            .context("set host side up")?;

        debug!(
            "Created endpoint {} ({} on bridge {}, {} in container)",
            config.id(),
            host_name,
            bridge_name,
            container_name
        );

        Ok(Self {
            id: config.id().clone(),
            src_name: container_name,
            host_ifname: host_name,
            host_index: host.index(),
            mac: format_mac(&mac),
            addr_v4: *config.addr_v4(),
            addr_v6: *config.addr_v6(),
            exposed_ports: config.exposed_ports().clone(),
            container_config: config.container_config().clone(),
            port_bindings: vec![],
            publish_requests: vec![],
        })
    }

    /// Add the veth pair, retrying once with fresh names when a generated
    /// name is already taken. Any other failure propagates immediately.
    async fn add_veth_pair(netlink: &dyn Netlink, seed: &str) -> Result<(String, String)> {
        for attempt in 0..2 {
            let host_name = random_ifname(seed);
            let container_name = random_ifname(seed);
            match netlink.link_add_veth(&host_name, &container_name).await {
                Ok(()) => return Ok((host_name, container_name)),
                Err(e) if attempt == 0 && netlink_errno(&e) == Some(libc::EEXIST) => {
                    warn!(
                        "Veth name {} or {} already taken, retrying with fresh names",
                        host_name, container_name
                    )
                }
                Err(e) => return Err(e.context("add veth pair")),
            }
        }
        unreachable!("veth creation either returned or failed")
    }

    /// Enable hairpin forwarding on the bridge port backing this endpoint.
    async fn set_hairpin(bridge: &str, port: &str) -> Result<()> {
        let path = format!("/sys/class/net/{}/brif/{}/hairpin_mode", bridge, port);
        tokio::fs::write(&path, "1\n")
            .await
            .with_context(|| format!("write {}", path))
    }

    /// Remove the host side interface, which tears down the pair. Kept
    /// best-effort; a missing link is not an error worth failing deletion.
    pub async fn delete(&mut self, netlink: &dyn Netlink) {
        if let Err(e) = netlink.link_del(self.host_index).await {
            warn!(
                "Removing veth {} of endpoint {} failed: {}",
                self.host_ifname,
                self.id,
                chain(e)
            );
        }
    }

    /// The serialized shape of this endpoint.
    pub fn to_record(&self, nid: &str) -> EndpointRecord {
        EndpointRecord {
            id: self.id.clone(),
            nid: nid.into(),
            src_name: self.src_name.clone(),
            mac: self.mac.clone(),
            addr_v4: self.addr_v4.map(|a| a.ip()),
            addr_v6: self.addr_v6.map(|a| a.ip()),
            container_config: self.container_config.clone(),
            ext_conn_config: self.publish_requests.clone(),
            port_mapping: self
                .port_bindings
                .iter()
                .map(|a| a.binding().clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{
        bridge::tests::NetlinkMock,
        port::binding::{PortBindingRequestBuilder, Protocol},
    };
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn config() -> EndpointConfig {
        EndpointConfigBuilder::default()
            .id("ep1")
            .addr_v4(Some("172.19.0.2/16".parse::<Ipv4Network>().unwrap()))
            .addr_v6(Some(
                "fdf8:b88e:bb5c:3483::2/64".parse::<Ipv6Network>().unwrap(),
            ))
            .build()
            .expect("build endpoint config")
    }

    #[tokio::test]
    async fn create_wires_the_veth_to_the_bridge() -> Result<()> {
        let mock = NetlinkMock::default();
        let endpoint = Endpoint::create(&mock, "br-test0", 7, 1400, false, &config()).await?;

        assert!(endpoint.host_ifname().starts_with(VETH_PREFIX));
        assert!(endpoint.src_name().starts_with(VETH_PREFIX));
        assert_ne!(endpoint.host_ifname(), endpoint.src_name());
        assert_eq!(endpoint.mac(), "02:42:ac:13:00:02");

        let calls = mock.recorded();
        assert!(calls.iter().any(|c| c.starts_with("add-veth")));
        assert!(calls.iter().any(|c| c.ends_with(" 7") && c.starts_with("master")));
        assert!(calls.iter().filter(|c| c.starts_with("mtu")).count() == 2);
        assert!(calls
            .iter()
            .any(|c| c.starts_with("addr-add") && c.ends_with("172.19.0.2/16")));
        assert!(calls
            .iter()
            .any(|c| c.starts_with("addr-add") && c.ends_with("fdf8:b88e:bb5c:3483::2/64")));
        assert!(calls.iter().any(|c| c.starts_with("up")));
        Ok(())
    }

    #[tokio::test]
    async fn explicit_mac_wins_over_derivation() -> Result<()> {
        let mock = NetlinkMock::default();
        let config = EndpointConfigBuilder::default()
            .id("ep2")
            .addr_v4(Some("172.19.0.3/16".parse::<Ipv4Network>()?))
            .mac(Some("02:42:de:ad:be:ef".to_string()))
            .build()?;

        let endpoint = Endpoint::create(&mock, "br-test0", 7, 0, false, &config).await?;
        assert_eq!(endpoint.mac(), "02:42:de:ad:be:ef");
        assert!(!mock.recorded().iter().any(|c| c.starts_with("mtu")));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_mac_is_rejected() -> Result<()> {
        let mock = NetlinkMock::default();
        let config = EndpointConfigBuilder::default()
            .id("ep3")
            .mac(Some("not-a-mac".to_string()))
            .build()?;

        assert!(Endpoint::create(&mock, "br-test0", 7, 0, false, &config)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn record_shape_carries_the_addresses() -> Result<()> {
        let mock = NetlinkMock::default();
        let endpoint = Endpoint::create(&mock, "br-test0", 7, 0, false, &config()).await?;

        let record = endpoint.to_record("net1");
        assert_eq!(record.nid, "net1");
        assert_eq!(record.addr_v4, Some("172.19.0.2".parse()?));
        assert_eq!(record.addr_v6, Some("fdf8:b88e:bb5c:3483::2".parse()?));
        assert_eq!(record.src_name, *endpoint.src_name());
        Ok(())
    }

    #[tokio::test]
    async fn record_carries_the_publish_requests() -> Result<()> {
        let mock = NetlinkMock::default();
        let mut endpoint = Endpoint::create(&mock, "br-test0", 7, 0, false, &config()).await?;

        *endpoint.publish_requests_mut() = vec![PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(80u16)
            .build()?];

        let record = endpoint.to_record("net1");
        assert_eq!(record.ext_conn_config.len(), 1);
        assert_eq!(record.ext_conn_config[0].container_port(), 80);

        endpoint.publish_requests_mut().clear();
        assert!(endpoint.to_record("net1").ext_conn_config.is_empty());
        Ok(())
    }

    /// Fails every veth creation with an error unrelated to name collisions.
    #[derive(Clone, Default)]
    struct VethPermissionDenied {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Netlink for VethPermissionDenied {
        async fn link_add_veth(&self, _name: &str, _peer_name: &str) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            bail!("operation not permitted")
        }
    }

    #[tokio::test]
    async fn veth_errors_other_than_collisions_do_not_retry() -> Result<()> {
        let mock = VethPermissionDenied::default();
        let res = Endpoint::create(&mock, "br-test0", 7, 0, false, &config()).await;

        assert!(res.is_err());
        assert_eq!(
            mock.attempts.load(Ordering::Relaxed),
            1,
            "only a name collision earns a second attempt"
        );
        Ok(())
    }

    #[test]
    fn generated_names_differ() {
        let a = random_ifname("seed");
        let b = random_ifname("seed");
        assert_ne!(a, b);
        assert!(a.len() <= 15);
    }

    #[test]
    fn mac_roundtrip() -> Result<()> {
        let mac = parse_mac("02:42:ac:13:00:02")?;
        assert_eq!(format_mac(&mac), "02:42:ac:13:00:02");
        assert!(parse_mac("02:42").is_err());
        assert!(parse_mac("zz:zz:zz:zz:zz:zz").is_err());
        Ok(())
    }
}

//! Typed network configuration and its validation.

use crate::{config::DriverConfig, error::NetworkError};
use anyhow::{Error, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use ipnetwork::{Ipv4Network, Ipv6Network};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr},
};
use strum::{Display, EnumString};

lazy_static! {
    /// The IPv6 link-local space.
    static ref LINK_LOCAL_V6: Ipv6Network = "fe80::/64".parse().expect("parse link-local net");
}

/// Maximum length of a Linux interface name (IFNAMSIZ minus the NUL byte).
const MAX_IFACE_NAME: usize = 15;

/// Label keys understood by the typed option parser.
const LABEL_BRIDGE_NAME: &str = "com.docker.network.bridge.name";
const LABEL_ICC: &str = "com.docker.network.bridge.enable_icc";
const LABEL_MASQUERADE: &str = "com.docker.network.bridge.enable_ip_masquerade";
const LABEL_HOST_IPV4: &str = "com.docker.network.bridge.host_binding_ipv4";
const LABEL_GW_MODE_V4: &str = "com.docker.network.bridge.gateway_mode_ipv4";
const LABEL_GW_MODE_V6: &str = "com.docker.network.bridge.gateway_mode_ipv6";
const LABEL_DEFAULT_BRIDGE: &str = "com.docker.network.bridge.default_bridge";
const LABEL_MTU: &str = "com.docker.network.driver.mtu";

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "kebab_case")]
#[serde(rename_all = "kebab-case")]
/// Per address family gateway behavior of a bridge network.
pub enum GwMode {
    /// Published ports are NATed and direct container access is blocked.
    Nat,

    /// NATed, but the containers are also directly reachable.
    NatUnprotected,

    /// No NAT; the subnet is routed to the host.
    Routed,

    /// The family has no gateway at all.
    Isolated,
}

impl Default for GwMode {
    fn default() -> Self {
        Self::Nat
    }
}

impl GwMode {
    /// Whether this mode translates addresses.
    pub fn nat(self) -> bool {
        matches!(self, Self::Nat | Self::NatUnprotected)
    }
}

#[derive(Builder, Clone, Debug, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// The strongly typed configuration of one bridge network.
pub struct NetworkConfig {
    #[get = "pub"]
    /// Opaque stable identifier of the network.
    id: String,

    #[get = "pub"]
    /// Explicit bridge device name. `None` derives one from the id, or the
    /// historical default name for the default bridge.
    bridge_name: Option<String>,

    #[get_copy = "pub"]
    /// Whether this is the one historical default bridge.
    default_bridge: bool,

    #[get_copy = "pub"]
    /// The IPv4 subnet on the bridge.
    ipv4_cidr: Option<Ipv4Network>,

    #[get_copy = "pub"]
    /// Explicit IPv4 gateway, defaults to the first usable host address.
    gateway_v4: Option<Ipv4Addr>,

    #[get_copy = "pub"]
    /// The IPv6 subnet on the bridge.
    ipv6_cidr: Option<Ipv6Network>,

    #[get_copy = "pub"]
    /// Explicit IPv6 gateway, defaults to the first usable host address.
    gateway_v6: Option<Ipv6Addr>,

    #[get_copy = "pub"]
    /// Inter-container communication on this bridge.
    icc: bool,

    #[get_copy = "pub"]
    /// Masquerade traffic leaving the bridge.
    ip_masquerade: bool,

    #[get_copy = "pub"]
    /// Isolate the bridge from every other interface.
    internal: bool,

    #[get_copy = "pub"]
    /// IPv4 gateway mode.
    gw_mode_v4: GwMode,

    #[get_copy = "pub"]
    /// IPv6 gateway mode.
    gw_mode_v6: GwMode,

    #[get_copy = "pub"]
    /// MTU of the bridge and its ports, 0 for the kernel default.
    mtu: u32,

    #[get_copy = "pub"]
    /// Explicit IPv4 SNAT source address.
    host_ipv4: Option<Ipv4Addr>,

    #[get_copy = "pub"]
    /// Explicit IPv6 SNAT source address.
    host_ipv6: Option<Ipv6Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            bridge_name: None,
            default_bridge: false,
            ipv4_cidr: None,
            gateway_v4: None,
            ipv6_cidr: None,
            gateway_v6: None,
            icc: true,
            ip_masquerade: true,
            internal: false,
            gw_mode_v4: GwMode::default(),
            gw_mode_v6: GwMode::default(),
            mtu: 0,
            host_ipv4: None,
            host_ipv6: None,
        }
    }
}

fn invalid(msg: String) -> Error {
    Error::new(NetworkError::InvalidParameter(msg))
}

impl NetworkConfig {
    /// Parse untyped driver labels into a typed configuration, rejecting
    /// unknown keys.
    pub fn from_labels<I: Into<String>>(id: I, labels: &HashMap<String, String>) -> Result<Self> {
        let mut builder = NetworkConfigBuilder::default().id(id.into());

        for (key, value) in labels {
            builder = match key.as_str() {
                LABEL_BRIDGE_NAME => builder.bridge_name(Some(value.clone())),
                LABEL_ICC => builder.icc(parse_bool(key, value)?),
                LABEL_MASQUERADE => builder.ip_masquerade(parse_bool(key, value)?),
                LABEL_DEFAULT_BRIDGE => builder.default_bridge(parse_bool(key, value)?),
                LABEL_HOST_IPV4 => builder.host_ipv4(Some(
                    value
                        .parse::<Ipv4Addr>()
                        .map_err(|e| invalid(format!("label {}: {}", key, e)))?,
                )),
                LABEL_GW_MODE_V4 => builder.gw_mode_v4(
                    value
                        .parse::<GwMode>()
                        .map_err(|e| invalid(format!("label {}: {}", key, e)))?,
                ),
                LABEL_GW_MODE_V6 => builder.gw_mode_v6(
                    value
                        .parse::<GwMode>()
                        .map_err(|e| invalid(format!("label {}: {}", key, e)))?,
                ),
                LABEL_MTU => builder.mtu(
                    value
                        .parse::<u32>()
                        .map_err(|e| invalid(format!("label {}: {}", key, e)))?,
                ),
                unknown => return Err(invalid(format!("unknown network label {}", unknown))),
            };
        }

        builder.build().map_err(|e| invalid(e.to_string()))
    }

    /// Check the internal consistency of this configuration.
    pub fn validate(&self) -> Result<()> {
        if self.ipv4_cidr.is_none() && self.ipv6_cidr.is_none() {
            return Err(invalid(format!(
                "network {} needs at least one subnet",
                self.id
            )));
        }

        if let Some(name) = &self.bridge_name {
            validate_bridge_name(name)?;
        }

        if self.mtu != 0 && self.mtu < 68 {
            return Err(invalid(format!("mtu {} is below the IPv4 minimum", self.mtu)));
        }

        if let (Some(gateway), Some(cidr)) = (self.gateway_v4, self.ipv4_cidr) {
            if !cidr.contains(gateway) {
                return Err(invalid(format!(
                    "gateway {} is outside subnet {}",
                    gateway, cidr
                )));
            }
        }

        if let Some(cidr) = self.ipv6_cidr {
            validate_ipv6_subnet(cidr)?;
            if let Some(gateway) = self.gateway_v6 {
                if !cidr.contains(gateway) {
                    return Err(invalid(format!(
                        "gateway {} is outside subnet {}",
                        gateway, cidr
                    )));
                }
            }
        }

        Ok(())
    }

    /// The name of the bridge device backing this network.
    pub fn effective_bridge_name(&self) -> String {
        match &self.bridge_name {
            Some(name) => name.clone(),
            None if self.default_bridge => DriverConfig::default_bridge_name(),
            None => {
                let short: String = self.id.chars().take(12).collect();
                format!("br-{}", short)
            }
        }
    }

    /// Whether the driver is expected to create the bridge device itself.
    /// An explicitly named non-default bridge must already exist.
    pub fn owns_bridge(&self) -> bool {
        self.bridge_name.is_none() || self.default_bridge
    }

    /// The IPv4 gateway, explicit or the first usable host address.
    pub fn effective_gateway_v4(&self) -> Option<Ipv4Addr> {
        self.gateway_v4
            .or_else(|| self.ipv4_cidr.and_then(|cidr| cidr.nth(1)))
    }

    /// The IPv6 gateway, explicit or the first usable host address.
    pub fn effective_gateway_v6(&self) -> Option<Ipv6Addr> {
        self.gateway_v6.or_else(|| {
            self.ipv6_cidr
                .filter(|cidr| cidr.prefix() < 128)
                .map(|cidr| Ipv6Addr::from(u128::from(cidr.network()) + 1))
        })
    }

    /// Whether two networks compete for a bridge name or address space.
    pub fn conflicts_with(&self, other: &Self) -> bool {
        if self.effective_bridge_name() == other.effective_bridge_name() {
            return true;
        }
        if let (Some(a), Some(b)) = (self.ipv4_cidr, other.ipv4_cidr) {
            if a.contains(b.network()) || b.contains(a.network()) {
                return true;
            }
        }
        if let (Some(a), Some(b)) = (self.ipv6_cidr, other.ipv6_cidr) {
            if a.contains(b.network()) || b.contains(a.network()) {
                return true;
            }
        }
        false
    }
}

/// Validate a bridge interface name.
pub fn validate_bridge_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFACE_NAME {
        return Err(invalid(format!(
            "bridge name {:?} must be 1..={} bytes",
            name, MAX_IFACE_NAME
        )));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains(char::is_whitespace) {
        return Err(invalid(format!("bridge name {:?} contains invalid characters", name)));
    }
    Ok(())
}

/// Validate an on-bridge IPv6 subnet: it must not be multicast and must not
/// overlap the link-local space, unless it is `fe80::/64` itself or lies
/// entirely inside it.
pub fn validate_ipv6_subnet(subnet: Ipv6Network) -> Result<()> {
    if subnet.network().is_multicast() {
        return Err(invalid(format!("multicast subnet {} is not usable", subnet)));
    }

    if subnet.prefix() >= LINK_LOCAL_V6.prefix() && LINK_LOCAL_V6.contains(subnet.network()) {
        // Entirely inside the link-local space, including fe80::/64 itself.
        return Ok(());
    }

    if subnet.contains(LINK_LOCAL_V6.network()) || LINK_LOCAL_V6.contains(subnet.network()) {
        return Err(invalid(format!(
            "subnet {} overlaps the link-local space {}",
            subnet, *LINK_LOCAL_V6
        )));
    }

    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value
        .parse::<bool>()
        .map_err(|e| invalid(format!("label {}: {}", key, e)))
}

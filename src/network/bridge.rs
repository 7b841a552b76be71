//! Lifecycle of the L2 bridge device backing a network.

use crate::{
    error::NetworkError,
    network::{
        netlink::{address_of, netlink_errno, Netlink},
        types::NetworkConfig,
    },
};
use anyhow::{Context, Error, Result};
use getset::{CopyGetters, Getters};
use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The link-local gateway address every IPv6 bridge carries.
const LINK_LOCAL_GATEWAY: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);

/// Largest MTU older kernels may reject with EINVAL for bridge devices.
const MAX_TOLERATED_MTU: u32 = 0xffff;

/// Whether the address lies in `fe80::/64`.
fn in_link_local(ip: Ipv6Addr) -> bool {
    ip.segments()[..4] == [0xfe80, 0, 0, 0]
}

#[derive(CopyGetters, Getters)]
/// An adopted or freshly created bridge device.
pub struct Bridge {
    #[get = "pub"]
    /// Interface name of the bridge.
    name: String,

    #[get_copy = "pub"]
    /// Interface index of the bridge.
    index: u32,

    #[get_copy = "pub"]
    /// Whether this instance created the device and therefore owns it.
    created: bool,

    netlink: Box<dyn Netlink>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("created", &self.created)
            .finish()
    }
}

impl Bridge {
    /// Adopt an existing bridge of the configured name or create a new one.
    /// An existing non-bridge interface of that name is refused, and a
    /// missing device is only created when the driver owns the name.
    pub async fn ensure(netlink: Box<dyn Netlink>, config: &NetworkConfig) -> Result<Self> {
        let name = config.effective_bridge_name();

        if let Ok(link) = netlink.link_by_name(&name).await {
            if !link.is_bridge() {
                return Err(Error::new(NetworkError::Forbidden(format!(
                    "interface {} exists but is not a bridge",
                    name
                ))));
            }
            debug!("Adopting existing bridge {}", name);
            return Ok(Self {
                name,
                index: link.index(),
                created: false,
                netlink,
            });
        }

        if !config.owns_bridge() {
            return Err(Error::new(NetworkError::NotFound(format!(
                "non-default bridge {} does not exist",
                name
            ))));
        }

        debug!("Creating bridge {}", name);
        netlink
            .link_add_bridge(&name)
            .await
            .with_context(|| format!("create bridge {}", name))?;
        let link = netlink
            .link_by_name(&name)
            .await
            .context("look up created bridge")?;

        Ok(Self {
            name,
            index: link.index(),
            created: true,
            netlink,
        })
    }

    /// Bring the bridge up.
    pub async fn up(&self) -> Result<()> {
        self.netlink
            .set_link_up(self.index)
            .await
            .with_context(|| format!("set bridge {} up", self.name))
    }

    /// Ensure the bridge carries the configured IPv4 gateway address. An
    /// existing different address is a hard mismatch.
    pub async fn program_ipv4(&self, gateway: Ipv4Addr, prefix_len: u8) -> Result<()> {
        let existing: Vec<(IpAddr, u8)> = self
            .netlink
            .address_list(self.index)
            .await
            .context("list bridge addresses")?
            .iter()
            .filter_map(address_of)
            .filter(|(ip, _)| ip.is_ipv4())
            .collect();

        match existing.first() {
            None => self
                .netlink
                .address_add(self.index, IpAddr::V4(gateway), prefix_len)
                .await
                .context("add IPv4 gateway address"),
            Some((ip, plen)) if *ip == IpAddr::V4(gateway) && *plen == prefix_len => Ok(()),
            Some((ip, plen)) => Err(Error::new(NetworkError::InvalidParameter(format!(
                "bridge {} carries {}/{} which does not match the configured {}/{}",
                self.name, ip, plen, gateway, prefix_len
            )))),
        }
    }

    /// Reconcile the bridge's IPv6 addresses with the required set: the
    /// link-local gateway plus the configured address. Others are removed,
    /// except kernel assigned link-local addresses while the configured
    /// prefix itself lies in link-local space.
    pub async fn program_ipv6(&self, gateway: Ipv6Addr, prefix_len: u8) -> Result<()> {
        let mut required = vec![(LINK_LOCAL_GATEWAY, 64u8), (gateway, prefix_len)];
        required.dedup();
        let config_in_ll = in_link_local(gateway);

        let messages = self
            .netlink
            .address_list(self.index)
            .await
            .context("list bridge addresses")?;

        let mut present = vec![];
        let mut stale = vec![];
        for message in messages {
            let (ip, plen) = match address_of(&message) {
                Some((IpAddr::V6(ip), plen)) => (ip, plen),
                _ => continue,
            };
            if required.contains(&(ip, plen)) {
                present.push((ip, plen));
            } else if config_in_ll && in_link_local(ip) {
                // The kernel assigned link-local address stays untouched.
            } else {
                stale.push(message);
            }
        }

        // Adding before removing keeps a prefix-length-only change
        // non-disruptive.
        for (ip, plen) in required {
            if !present.contains(&(ip, plen)) {
                self.netlink
                    .address_add(self.index, IpAddr::V6(ip), plen)
                    .await
                    .with_context(|| format!("add IPv6 address {}/{}", ip, plen))?;
            }
        }
        for message in stale {
            self.netlink
                .address_del(message)
                .await
                .context("remove stale IPv6 address")?;
        }

        Ok(())
    }

    /// Apply the configured MTU. Older kernels reject jumbo MTUs on bridges
    /// with EINVAL; that is tolerated.
    pub async fn set_mtu(&self, mtu: u32) -> Result<()> {
        if mtu == 0 {
            return Ok(());
        }

        match self.netlink.set_link_mtu(self.index, mtu).await {
            Ok(()) => Ok(()),
            Err(e)
                if netlink_errno(&e) == Some(libc::EINVAL)
                    && mtu > 1500
                    && mtu <= MAX_TOLERATED_MTU =>
            {
                warn!(
                    "Kernel refused mtu {} on bridge {}, keeping the default",
                    mtu, self.name
                );
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("set mtu of bridge {}", self.name)),
        }
    }

    /// Delete the device if this instance created it; an adopted bridge is
    /// left intact.
    pub async fn delete(&self) -> Result<()> {
        if !self.created {
            debug!("Leaving adopted bridge {} in place", self.name);
            return Ok(());
        }
        self.netlink
            .link_del(self.index)
            .await
            .with_context(|| format!("delete bridge {}", self.name))
    }
}

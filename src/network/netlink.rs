//! Netlink related helpers and structures.

use anyhow::{bail, Context, Error, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use futures_util::stream::TryStreamExt;
use getset::Getters;
use log::{debug, trace};
use netlink_packet_route::rtnl::AddressMessage;
use rtnetlink::packet::rtnl::{
    address::nlas::Nla as AddressNla,
    link::nlas::{Info, InfoKind, Nla},
    LinkMessage,
};
use std::{
    convert::TryInto,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

#[async_trait]
/// The netlink behavior trait.
pub trait Netlink: DynClone + Send + Sync {
    /// Get a link referenced by its name.
    async fn link_by_name(&self, _name: &str) -> Result<Link> {
        bail!("no link for name")
    }

    /// Create a bridge device.
    async fn link_add_bridge(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Create a veth pair.
    async fn link_add_veth(&self, _name: &str, _peer_name: &str) -> Result<()> {
        Ok(())
    }

    /// Delete a link.
    async fn link_del(&self, _index: u32) -> Result<()> {
        Ok(())
    }

    /// Set a link up.
    async fn set_link_up(&self, _index: u32) -> Result<()> {
        Ok(())
    }

    /// Set the MTU of a link.
    async fn set_link_mtu(&self, _index: u32, _mtu: u32) -> Result<()> {
        Ok(())
    }

    /// Enslave a link to a master device.
    async fn set_link_master(&self, _index: u32, _master: u32) -> Result<()> {
        Ok(())
    }

    /// Set the hardware address of a link.
    async fn set_link_address(&self, _index: u32, _address: Vec<u8>) -> Result<()> {
        Ok(())
    }

    /// List the addresses of a link.
    async fn address_list(&self, _index: u32) -> Result<Vec<AddressMessage>> {
        Ok(vec![])
    }

    /// Add an address to a link. A no-op if the address is already present.
    async fn address_add(&self, _index: u32, _address: IpAddr, _prefix_len: u8) -> Result<()> {
        Ok(())
    }

    /// Delete an address from a link.
    async fn address_del(&self, _message: AddressMessage) -> Result<()> {
        Ok(())
    }
}

clone_trait_object!(Netlink);

#[derive(Clone, Debug, Getters)]
/// The default Netlink interface implementation.
pub struct DefaultNetlink {
    #[get]
    handle: rtnetlink::Handle,
}

#[derive(Builder, Clone, Debug, Getters, Default)]
#[builder(default, pattern = "owned", setter(into))]
/// A link returned by netlink usage.
pub struct Link {
    #[get = "pub"]
    name: String,

    #[get = "pub"]
    message: LinkMessage,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Link {
    /// The interface index of this link.
    pub fn index(&self) -> u32 {
        self.message.header.index
    }

    /// Whether the link is a bridge device.
    pub fn is_bridge(&self) -> bool {
        self.message.nlas.iter().any(|nla| match nla {
            Nla::Info(infos) => infos
                .iter()
                .any(|info| matches!(info, Info::Kind(InfoKind::Bridge))),
            _ => false,
        })
    }
}

/// The errno of a netlink level failure buried in an error chain, if any.
pub fn netlink_errno(err: &Error) -> Option<i32> {
    err.chain().find_map(|e| match e.downcast_ref() {
        Some(rtnetlink::Error::NetlinkError(msg)) => Some(-msg.code),
        _ => None,
    })
}

/// Decode the address and prefix length of an address message.
pub fn address_of(message: &AddressMessage) -> Option<(IpAddr, u8)> {
    let prefix_len = message.header.prefix_len;
    for nla in &message.nlas {
        if let AddressNla::Address(bytes) = nla {
            match bytes.len() {
                4 => {
                    let octets: [u8; 4] = bytes.as_slice().try_into().ok()?;
                    return Some((IpAddr::V4(Ipv4Addr::from(octets)), prefix_len));
                }
                16 => {
                    let octets: [u8; 16] = bytes.as_slice().try_into().ok()?;
                    return Some((IpAddr::V6(Ipv6Addr::from(octets)), prefix_len));
                }
                _ => return None,
            }
        }
    }
    None
}

impl DefaultNetlink {
    /// Create a new netlink instance.
    pub async fn new() -> Result<Self> {
        debug!("Creating new netlink connection");

        let (connection, handle, _) =
            rtnetlink::new_connection().context("create new netlink connection")?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }
}

#[async_trait]
impl Netlink for DefaultNetlink {
    /// Get a link referenced by its name.
    async fn link_by_name(&self, name: &str) -> Result<Link> {
        let link = Link {
            name: name.into(),
            message: self
                .handle()
                .link()
                .get()
                .set_name_filter(name.into())
                .execute()
                .try_next()
                .await
                .context("get links")?
                .with_context(|| format!("no link found for name {}", name))?,
        };
        trace!("Got link by name {}: {:?}", name, link.message.header);
        Ok(link)
    }

    /// Create a bridge device.
    async fn link_add_bridge(&self, name: &str) -> Result<()> {
        trace!("Adding bridge {}", name);
        self.handle()
            .link()
            .add()
            .bridge(name.into())
            .execute()
            .await
            .context("add bridge link")
    }

    /// Create a veth pair.
    async fn link_add_veth(&self, name: &str, peer_name: &str) -> Result<()> {
        trace!("Adding veth pair {} <-> {}", name, peer_name);
        self.handle()
            .link()
            .add()
            .veth(name.into(), peer_name.into())
            .execute()
            .await
            .context("add veth pair")
    }

    /// Delete a link.
    async fn link_del(&self, index: u32) -> Result<()> {
        trace!("Deleting link {}", index);
        self.handle()
            .link()
            .del(index)
            .execute()
            .await
            .context("delete link")
    }

    /// Set a link up.
    async fn set_link_up(&self, index: u32) -> Result<()> {
        trace!("Setting link {} up", index);
        self.handle()
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .context("set link up")
    }

    /// Set the MTU of a link.
    async fn set_link_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        trace!("Setting link {} mtu to {}", index, mtu);
        self.handle()
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .context("set link mtu")
    }

    /// Enslave a link to a master device.
    async fn set_link_master(&self, index: u32, master: u32) -> Result<()> {
        trace!("Setting master of link {} to {}", index, master);
        self.handle()
            .link()
            .set(index)
            .master(master)
            .execute()
            .await
            .context("set link master")
    }

    /// Set the hardware address of a link.
    async fn set_link_address(&self, index: u32, address: Vec<u8>) -> Result<()> {
        trace!("Setting hardware address of link {}", index);
        self.handle()
            .link()
            .set(index)
            .address(address)
            .execute()
            .await
            .context("set link address")
    }

    /// List the addresses of a link.
    async fn address_list(&self, index: u32) -> Result<Vec<AddressMessage>> {
        self.handle()
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect::<Vec<_>>()
            .await
            .context("list addresses")
    }

    /// Add an address to a link. A no-op if the address is already present.
    async fn address_add(&self, index: u32, address: IpAddr, prefix_len: u8) -> Result<()> {
        trace!("Adding address {}/{} to link {}", address, prefix_len, index);
        match self
            .handle()
            .address()
            .add(index, address, prefix_len)
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(ref e)) if e.code == -libc::EEXIST => Ok(()),
            Err(e) => Err(e).context("add address"),
        }
    }

    /// Delete an address from a link.
    async fn address_del(&self, message: AddressMessage) -> Result<()> {
        self.handle()
            .address()
            .del(message)
            .execute()
            .await
            .context("delete address")
    }
}

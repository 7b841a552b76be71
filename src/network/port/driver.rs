//! Rootless port driver abstraction.

use crate::network::port::binding::Protocol;
use anyhow::Result;
use async_trait::async_trait;
use dyn_clone::{clone_trait_object, DynClone};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
/// Failures reported by a rootless port driver.
pub enum PortDriverError {
    #[error("protocol {0} is not supported by the port driver")]
    /// The driver cannot forward the requested protocol. Non-fatal; the
    /// binding stays functional through the firewall rules alone.
    ProtocolUnsupported(Protocol),

    #[error("port driver failure: {0}")]
    /// Any other driver failure, fatal for the binding.
    Other(String),
}

#[async_trait]
/// Translates daemon view bindings to outer host bindings when the daemon
/// runs inside a user namespace.
pub trait PortDriver: DynClone + Send + Sync {
    /// Expose `host_ip:host_port` on the outer host, forwarding to
    /// `child_host_ip` inside the namespace. Returns a removal handle which
    /// undoes the mapping.
    async fn add_port(
        &self,
        proto: Protocol,
        host_ip: IpAddr,
        child_host_ip: IpAddr,
        host_port: u16,
    ) -> Result<Box<dyn PortRemoval>, PortDriverError>;

    /// The address inside the namespace which corresponds to the provided
    /// host address.
    fn child_host_ip(&self, host_ip: IpAddr) -> IpAddr;
}

clone_trait_object!(PortDriver);

#[async_trait]
/// Undo handle of a single port driver mapping.
pub trait PortRemoval: Send + Sync {
    /// Remove the mapping from the outer host.
    async fn remove(&self) -> Result<()>;
}

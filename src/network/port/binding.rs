//! Port binding types and the request normalization pipeline.

use crate::error::NetworkError;
use anyhow::{Error, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use strum::{Display, EnumString};

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// Transport protocol of a port binding. The declaration order defines the
/// sort order used when grouping bindings.
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Tcp
    }
}

#[derive(Builder, Clone, Debug, Deserialize, CopyGetters, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
/// A user supplied request to publish one container port.
pub struct PortBindingRequest {
    #[get_copy = "pub"]
    /// The transport protocol to publish.
    proto: Protocol,

    #[get_copy = "pub"]
    /// The port number inside the container.
    container_port: u16,

    #[get = "pub"]
    /// Host address to bind. `None` means the driver wide default address.
    host_ip: Option<IpAddr>,

    #[get_copy = "pub"]
    /// Requested host port, or 0 to allocate any.
    host_port: u16,

    #[get_copy = "pub"]
    /// End of the requested host port range. 0 means `host_port`.
    host_port_end: u16,
}

impl Default for PortBindingRequest {
    fn default() -> Self {
        Self {
            proto: Protocol::Tcp,
            container_port: 0,
            host_ip: None,
            host_port: 0,
            host_port_end: 0,
        }
    }
}

#[derive(
    Builder, Clone, Debug, Deserialize, CopyGetters, Getters, Setters, PartialEq, Serialize,
)]
#[builder(default, pattern = "owned", setter(into))]
/// An operational port binding, one address family wide. Before allocation
/// `host_port..host_port_end` is the requested range; afterwards both carry
/// the chosen port.
pub struct PortBinding {
    #[get_copy = "pub"]
    /// The transport protocol of the binding.
    proto: Protocol,

    #[get_copy = "pub"]
    /// The endpoint address the traffic is delivered to.
    container_ip: IpAddr,

    #[get_copy = "pub"]
    /// The port number inside the container.
    container_port: u16,

    #[get_copy = "pub"]
    /// The resolved host address of the binding.
    host_ip: IpAddr,

    #[getset(get_copy = "pub", set = "pub")]
    /// The host port, or 0 when NAT is disabled for this family.
    host_port: u16,

    #[getset(get_copy = "pub", set = "pub")]
    /// End of the host port range, equal to `host_port` once allocated.
    host_port_end: u16,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// The host address as seen from inside a rootless daemon namespace.
    child_host_ip: Option<IpAddr>,

    #[get_copy = "pub"]
    #[serde(default)]
    /// NAT is bypassed for this family; only the firewall is opened.
    disable_nat: bool,

    #[get_copy = "pub"]
    #[serde(default)]
    /// The rootless port driver rejected the protocol; the binding stays
    /// functional through the firewall rules alone.
    rootless_unsupported: bool,
}

impl Default for PortBinding {
    fn default() -> Self {
        Self {
            proto: Protocol::Tcp,
            container_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            container_port: 0,
            host_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            host_port: 0,
            host_port_end: 0,
            child_host_ip: None,
            disable_nat: false,
            rootless_unsupported: false,
        }
    }
}

impl PortBinding {
    /// Whether the host side of this binding is IPv6.
    pub fn is_ipv6(&self) -> bool {
        self.host_ip.is_ipv6()
    }

    /// Whether the request did not pin a single exact host port.
    pub fn is_range(&self) -> bool {
        self.host_port != self.host_port_end
    }

    /// Whether host and container address families differ, meaning the
    /// binding is served exclusively by the userland proxy.
    pub fn is_proxy_only(&self) -> bool {
        self.host_ip.is_ipv6() != self.container_ip.is_ipv6()
    }

    /// Mark the rootless port driver as unsupported for this binding.
    pub fn set_rootless_unsupported(&mut self) {
        self.rootless_unsupported = true;
    }

    /// Set the translated host address of a rootless setup.
    pub fn set_child_host_ip(&mut self, ip: IpAddr) {
        self.child_host_ip = Some(ip);
    }

    /// The sort key which makes bindings that must share one host port
    /// adjacent in a sorted sequence.
    fn sort_key(&self) -> (bool, bool, u16, Protocol, u16, u16, IpAddr, IpAddr) {
        (
            self.disable_nat,
            self.is_range(),
            self.container_port,
            self.proto,
            self.host_port,
            self.host_port_end,
            self.container_ip,
            self.host_ip,
        )
    }

    /// Two bindings share one host port iff they agree on every field except
    /// the host address.
    pub fn same_group(&self, other: &Self) -> bool {
        self.disable_nat == other.disable_nat
            && self.container_port == other.container_port
            && self.proto == other.proto
            && self.host_port == other.host_port
            && self.host_port_end == other.host_port_end
            && self.container_ip == other.container_ip
    }
}

/// Address family knobs of the owning network, as needed by normalization.
#[derive(Clone, Copy, Debug)]
pub struct FamilySupport {
    /// The endpoint's IPv4 address, if any.
    pub addr_v4: Option<Ipv4Addr>,

    /// The endpoint's IPv6 address, if any.
    pub addr_v6: Option<Ipv6Addr>,

    /// Whether IPv4 traffic is NATed (gateway mode nat or nat-unprotected).
    pub nat_v4: bool,

    /// Whether IPv6 traffic is NATed.
    pub nat_v6: bool,

    /// Whether the userland proxy is available.
    pub proxy: bool,
}

/// Normalize and expand user requests into per-family operational bindings,
/// then sort them so that bindings which must share a host port are adjacent.
pub fn expand_and_sort(
    requests: &[PortBindingRequest],
    support: FamilySupport,
    default_host_ip: IpAddr,
) -> Result<Vec<PortBinding>> {
    let mut out = Vec::with_capacity(requests.len() * 2);

    for req in requests {
        let (begin, end) = normalize_range(req)?;

        let (want_v4, want_v6, explicit_host) = match req.host_ip() {
            Some(ip) => (ip.is_ipv4(), ip.is_ipv6(), Some(*ip)),
            None if default_host_ip.is_unspecified() => (true, true, None),
            None => (
                default_host_ip.is_ipv4(),
                default_host_ip.is_ipv6(),
                Some(default_host_ip),
            ),
        };

        if want_v4 {
            match support.addr_v4 {
                Some(addr) => out.push(family_binding(
                    req,
                    IpAddr::V4(addr),
                    explicit_host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                    begin,
                    end,
                    support.nat_v4,
                )),
                None => debug!(
                    "Dropping IPv4 binding for {}/{}, endpoint has no IPv4 address",
                    req.container_port(),
                    req.proto()
                ),
            }
        }

        if want_v6 {
            match (support.addr_v6, support.addr_v4) {
                (Some(addr), _) => out.push(family_binding(
                    req,
                    IpAddr::V6(addr),
                    explicit_host.unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
                    begin,
                    end,
                    support.nat_v6,
                )),
                // An IPv4-only container can still publish on IPv6 hosts as
                // long as the proxy crosses the family boundary.
                (None, Some(addr)) if support.proxy => out.push(family_binding(
                    req,
                    IpAddr::V4(addr),
                    explicit_host.unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
                    begin,
                    end,
                    support.nat_v6,
                )),
                (None, _) => warn!(
                    "Dropping IPv6 binding for {}/{}, endpoint has no IPv6 address and no userland proxy is available",
                    req.container_port(),
                    req.proto()
                ),
            }
        }
    }

    out.sort_by_key(PortBinding::sort_key);
    Ok(out)
}

/// Normalize the requested host port range of a single request.
fn normalize_range(req: &PortBindingRequest) -> Result<(u16, u16)> {
    if req.container_port() == 0 {
        return Err(Error::new(NetworkError::InvalidParameter(format!(
            "container port must not be 0 in {:?}",
            req
        ))));
    }

    let begin = req.host_port();
    let end = match req.host_port_end() {
        0 => begin,
        end if end < begin => {
            return Err(Error::new(NetworkError::InvalidParameter(format!(
                "host port range {}..{} is inverted",
                begin, end
            ))))
        }
        end => end,
    };
    Ok((begin, end))
}

/// Build the operational binding of one address family. With NAT bypassed a
/// specific host address is meaningless, so the address is zeroed and no host
/// port is carried; the container port is still opened in the firewall.
fn family_binding(
    req: &PortBindingRequest,
    container_ip: IpAddr,
    host_ip: IpAddr,
    begin: u16,
    end: u16,
    nat: bool,
) -> PortBinding {
    let mut binding = PortBinding {
        proto: req.proto(),
        container_ip,
        container_port: req.container_port(),
        host_ip,
        host_port: begin,
        host_port_end: end,
        ..Default::default()
    };

    if !nat {
        binding.disable_nat = true;
        binding.host_port = 0;
        binding.host_port_end = 0;
        binding.host_ip = if host_ip.is_ipv6() {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
    }

    binding
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn dual_stack() -> FamilySupport {
        FamilySupport {
            addr_v4: Some("172.19.0.2".parse().unwrap()),
            addr_v6: Some("fdf8:b88e:bb5c:3483::2".parse().unwrap()),
            nat_v4: true,
            nat_v6: true,
            proxy: true,
        }
    }

    fn request(proto: Protocol, container_port: u16) -> PortBindingRequest {
        PortBindingRequestBuilder::default()
            .proto(proto)
            .container_port(container_port)
            .build()
            .unwrap()
    }

    #[test]
    fn any_address_expands_to_both_families() -> Result<()> {
        let bindings = expand_and_sort(
            &[request(Protocol::Tcp, 22), request(Protocol::Tcp, 80)],
            dual_stack(),
            "0.0.0.0".parse()?,
        )?;

        assert_eq!(bindings.len(), 4);
        // Sorted by container port first, v4 before v6 within a group.
        assert_eq!(bindings[0].container_port(), 22);
        assert!(bindings[0].host_ip().is_ipv4());
        assert_eq!(bindings[1].container_port(), 22);
        assert!(bindings[1].host_ip().is_ipv6());
        assert!(bindings[0].same_group(&bindings[1]));
        assert!(!bindings[1].same_group(&bindings[2]));
        assert_eq!(bindings[2].container_port(), 80);
        Ok(())
    }

    #[test]
    fn specific_host_address_stays_single_family() -> Result<()> {
        let req = PortBindingRequestBuilder::default()
            .proto(Protocol::Udp)
            .container_port(53u16)
            .host_ip(Some("192.0.2.10".parse::<IpAddr>()?))
            .build()?;

        let bindings = expand_and_sort(&[req], dual_stack(), "0.0.0.0".parse()?)?;
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].host_ip(), "192.0.2.10".parse::<IpAddr>()?);
        Ok(())
    }

    #[test]
    fn v4_only_container_keeps_v6_through_proxy() -> Result<()> {
        let mut support = dual_stack();
        support.addr_v6 = None;

        let req = PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(80u16)
            .host_ip(Some("::".parse::<IpAddr>()?))
            .build()?;

        let bindings = expand_and_sort(&[req.clone()], support, "0.0.0.0".parse()?)?;
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].host_ip().is_ipv6());
        assert!(bindings[0].container_ip().is_ipv4());
        assert!(bindings[0].is_proxy_only());

        // Without the proxy the request is dropped entirely.
        support.proxy = false;
        let bindings = expand_and_sort(&[req], support, "0.0.0.0".parse()?)?;
        assert!(bindings.is_empty());
        Ok(())
    }

    #[test]
    fn disabled_nat_zeroes_host_side() -> Result<()> {
        let mut support = dual_stack();
        support.nat_v6 = false;

        let req = PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(22u16)
            .host_ip(Some("2001:db8::1".parse::<IpAddr>()?))
            .host_port(2222u16)
            .build()?;

        let bindings = expand_and_sort(&[req], support, "0.0.0.0".parse()?)?;
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].disable_nat());
        assert_eq!(bindings[0].host_port(), 0);
        assert_eq!(
            bindings[0].host_ip(),
            "::".parse::<IpAddr>()?,
            "specific host address makes no sense without NAT"
        );
        Ok(())
    }

    #[test]
    fn inverted_range_is_rejected() {
        let req = PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(80u16)
            .host_port(9000u16)
            .host_port_end(8000u16)
            .build()
            .unwrap();

        assert!(expand_and_sort(&[req], dual_stack(), "0.0.0.0".parse().unwrap()).is_err());
    }

    #[test]
    fn zero_container_port_is_rejected() {
        let req = PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .build()
            .unwrap();

        assert!(expand_and_sort(&[req], dual_stack(), "0.0.0.0".parse().unwrap()).is_err());
    }

    #[test]
    fn protocol_order_and_parse() -> Result<()> {
        assert!(Protocol::Tcp < Protocol::Udp);
        assert!(Protocol::Udp < Protocol::Sctp);
        assert_eq!(Protocol::Sctp.to_string(), "sctp");
        assert_eq!("udp".parse::<Protocol>()?, Protocol::Udp);
        Ok(())
    }

    #[test]
    fn ranges_sort_after_exact_ports() -> Result<()> {
        let range = PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(80u16)
            .host_port(8080u16)
            .host_port_end(8083u16)
            .build()?;
        let exact = PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(443u16)
            .host_port(8443u16)
            .build()?;

        let bindings = expand_and_sort(&[range, exact], dual_stack(), "0.0.0.0".parse()?)?;
        assert!(!bindings[0].is_range());
        assert_eq!(bindings[0].container_port(), 443);
        assert!(bindings[2].is_range());
        Ok(())
    }
}

//! Realization of published ports as bound sockets, firewall rules and
//! userland proxies, with complete rollback on any failure.

pub mod allocator;
pub mod binding;
pub mod driver;
pub mod proxy;

use crate::{
    error::{chain, ErrorAccumulator, NetworkError},
    network::{
        firewall::{Firewaller, FirewallNetworkConfig},
        port::{
            allocator::PortAllocator,
            binding::{expand_and_sort, FamilySupport, PortBinding, PortBindingRequest, Protocol},
            driver::{PortDriver, PortDriverError, PortRemoval},
            proxy::{ProxyHandle, ProxySupervisor},
        },
    },
};
use anyhow::{Context, Error, Result};
use log::{debug, warn};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::{
    io,
    net::{IpAddr, SocketAddr},
    os::unix::io::{AsRawFd, RawFd},
    path::PathBuf,
    sync::Arc,
};
use tokio::process::Command;

/// How often a range request may retry allocation after losing the bind race.
pub const MAX_ALLOCATE_PORT_ATTEMPTS: usize = 10;

const SOL_SCTP: libc::c_int = 132;
const SCTP_INITMSG: libc::c_int = 2;
const SCTP_MAX_STREAM: u16 = 0xffff;

#[repr(C)]
#[derive(Default)]
struct SctpInitMsg {
    sinit_num_ostreams: u16,
    sinit_max_instreams: u16,
    sinit_max_attempts: u16,
    sinit_max_init_timeo: u16,
}

#[derive(Debug)]
/// A host socket held open for the lifetime of a binding. The descriptor is
/// owned exclusively and closed on drop.
pub struct HostBoundSocket {
    socket: Socket,
    proto: Protocol,
}

impl HostBoundSocket {
    /// Create and bind the socket of one binding without listening yet.
    fn bind(proto: Protocol, addr: SocketAddr) -> Result<Self> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let (socket_type, socket_proto) = match proto {
            Protocol::Tcp => (Type::STREAM, SockProtocol::TCP),
            Protocol::Udp => (Type::DGRAM, SockProtocol::UDP),
            Protocol::Sctp => (Type::STREAM, SockProtocol::from(libc::IPPROTO_SCTP)),
        };

        // Close-on-exec is set by the socket constructor; the proxy handoff
        // dups the descriptor past it explicitly.
        let socket =
            Socket::new(domain, socket_type, Some(socket_proto)).context("create socket")?;
        socket
            .set_reuse_address(true)
            .context("set SO_REUSEADDR")?;
        if addr.is_ipv6() {
            socket.set_only_v6(true).context("set IPV6_V6ONLY")?;
        }

        match proto {
            Protocol::Udp => {
                // The proxy needs the original destination to answer from the
                // right source address.
                if addr.is_ipv6() {
                    nix::sys::socket::setsockopt(
                        socket.as_raw_fd(),
                        nix::sys::socket::sockopt::Ipv6RecvPacketInfo,
                        &true,
                    )
                    .context("set IPV6_RECVPKTINFO")?;
                } else {
                    nix::sys::socket::setsockopt(
                        socket.as_raw_fd(),
                        nix::sys::socket::sockopt::Ipv4PacketInfo,
                        &true,
                    )
                    .context("set IP_PKTINFO")?;
                }
            }
            Protocol::Sctp => {
                let init = SctpInitMsg {
                    sinit_num_ostreams: SCTP_MAX_STREAM,
                    ..Default::default()
                };
                let res = unsafe {
                    libc::setsockopt(
                        socket.as_raw_fd(),
                        SOL_SCTP,
                        SCTP_INITMSG,
                        &init as *const _ as *const libc::c_void,
                        std::mem::size_of::<SctpInitMsg>() as libc::socklen_t,
                    )
                };
                if res != 0 {
                    return Err(Error::new(io::Error::last_os_error()).context("set SCTP_INITMSG"));
                }
            }
            Protocol::Tcp => {}
        }

        socket
            .bind(&addr.into())
            .with_context(|| format!("bind {}/{}", addr, proto))?;
        Ok(Self { socket, proto })
    }

    /// Start listening. Deferred until the firewall rules are in place so no
    /// connection is accepted while DNAT rules are missing.
    fn listen(&self) -> Result<()> {
        match self.proto {
            Protocol::Udp => Ok(()),
            _ => self.socket.listen(libc::SOMAXCONN).context("listen"),
        }
    }

    /// The raw descriptor, used for the proxy handoff.
    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// An operational binding together with the host resources it owns.
pub struct ActivePortBinding {
    binding: PortBinding,
    socket: Option<HostBoundSocket>,
    proxy: Option<ProxyHandle>,
    driver_removal: Option<Box<dyn PortRemoval>>,
}

impl ActivePortBinding {
    fn passive(binding: PortBinding) -> Self {
        Self {
            binding,
            socket: None,
            proxy: None,
            driver_removal: None,
        }
    }

    /// The operational data of this binding.
    pub fn binding(&self) -> &PortBinding {
        &self.binding
    }
}

impl std::fmt::Debug for ActivePortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ActivePortBinding")
            .field("binding", &self.binding)
            .field("socket", &self.socket)
            .field("proxy", &self.proxy.is_some())
            .finish()
    }
}

/// Orchestrates allocator, sockets, port driver, firewall and proxies to
/// realize a set of published ports.
pub struct PortMapper {
    allocator: Arc<PortAllocator>,
    firewaller: Box<dyn Firewaller>,
    port_driver: Option<Box<dyn PortDriver>>,
    proxy: Option<ProxySupervisor>,
    conntrack_binary: Option<PathBuf>,
}

impl PortMapper {
    /// Create a mapper from its collaborators.
    pub fn new(
        allocator: Arc<PortAllocator>,
        firewaller: Box<dyn Firewaller>,
        port_driver: Option<Box<dyn PortDriver>>,
        proxy: Option<ProxySupervisor>,
    ) -> Self {
        Self {
            allocator,
            firewaller,
            port_driver,
            proxy,
            conntrack_binary: which::which("conntrack").ok(),
        }
    }

    /// Realize the provided requests. On any failure every side effect taken
    /// so far is rolled back and the error propagated; on success the caller
    /// owns the returned bindings and must release them eventually.
    pub async fn add_port_mappings(
        &self,
        config: &FirewallNetworkConfig,
        support: FamilySupport,
        requests: &[PortBindingRequest],
        default_host_ip: IpAddr,
    ) -> Result<Vec<ActivePortBinding>> {
        let expanded = expand_and_sort(requests, support, default_host_ip)
            .context("normalize port binding requests")?;

        let mut active: Vec<ActivePortBinding> = Vec::with_capacity(expanded.len());
        let mut groups = expanded.into_iter().peekable();
        while groups.peek().is_some() {
            // Collect one run of bindings which must share a host port.
            let first = groups.next().expect("peeked group start");
            let mut group = vec![first];
            while matches!(groups.peek(), Some(next) if group[0].same_group(next)) {
                group.push(groups.next().expect("peeked group member"));
            }

            match self.realize_group(config, group).await {
                Ok(mut realized) => active.append(&mut realized),
                Err(e) => {
                    // Unwind completed groups; their rules and reservations
                    // must not survive a failed publish.
                    if let Err(cleanup) = self.release_resources(config, active, false).await {
                        warn!("Rollback of completed groups failed: {}", chain(cleanup));
                    }
                    return Err(e);
                }
            }
        }

        Ok(active)
    }

    /// Release every resource of the provided bindings. All steps are
    /// attempted; failures are combined into a single error.
    pub async fn release_port_bindings(
        &self,
        config: &FirewallNetworkConfig,
        bindings: Vec<ActivePortBinding>,
    ) -> Result<()> {
        self.release_resources(config, bindings, true).await
    }

    /// Realize one group of bindings sharing a single host port. Any failure
    /// unwinds the group's own resources before propagating.
    async fn realize_group(
        &self,
        config: &FirewallNetworkConfig,
        group: Vec<PortBinding>,
    ) -> Result<Vec<ActivePortBinding>> {
        let mut active = if group[0].disable_nat() {
            // NAT bypassed: no host port, no socket, no proxy. The container
            // port is still opened in the firewall below.
            group.into_iter().map(ActivePortBinding::passive).collect()
        } else {
            self.allocate_and_bind(group).await?
        };

        if let Err(e) = self.attach_group(config, &mut active).await {
            if let Err(cleanup) = self.release_resources(config, active, false).await {
                warn!("Rollback of failed group failed: {}", chain(cleanup));
            }
            return Err(e);
        }
        Ok(active)
    }

    /// Reserve one port valid across the group's host addresses and bind all
    /// sockets, retrying range requests which lose the race to the kernel.
    async fn allocate_and_bind(&self, group: Vec<PortBinding>) -> Result<Vec<ActivePortBinding>> {
        let proto = group[0].proto();
        let (begin, end) = (group[0].host_port(), group[0].host_port_end());
        let exact = begin == end && begin != 0;
        let addrs: Vec<IpAddr> = group.iter().map(|b| b.host_ip()).collect();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let port = self
                .allocator
                .request_ports_in_range(&addrs, proto, begin, end)
                .context("allocate group host port")?;

            match self.bind_group_sockets(&group, port) {
                Ok(sockets) => {
                    let mut active = Vec::with_capacity(group.len());
                    for (mut binding, socket) in group.into_iter().zip(sockets) {
                        binding.set_host_port(port);
                        binding.set_host_port_end(port);
                        active.push(ActivePortBinding {
                            binding,
                            socket: Some(socket),
                            proxy: None,
                            driver_removal: None,
                        });
                    }
                    return Ok(active);
                }
                Err(e) => {
                    for addr in &addrs {
                        self.allocator.release_port(*addr, proto, port);
                    }

                    let lost_race = e
                        .chain()
                        .filter_map(|c| c.downcast_ref::<io::Error>())
                        .any(|io| io.kind() == io::ErrorKind::AddrInUse);
                    if exact && lost_race {
                        return Err(Error::new(NetworkError::BusyPort {
                            addr: addrs[0],
                            proto: proto.to_string(),
                            port,
                        })
                        .context(e));
                    }
                    if !lost_race || attempt >= MAX_ALLOCATE_PORT_ATTEMPTS {
                        return Err(e);
                    }
                    debug!(
                        "Port {}/{} raced with another process, retrying (attempt {})",
                        port, proto, attempt
                    );
                }
            }
        }
    }

    /// Bind the sockets of every group member, closing all of them on the
    /// first failure.
    fn bind_group_sockets(&self, group: &[PortBinding], port: u16) -> Result<Vec<HostBoundSocket>> {
        let mut sockets = Vec::with_capacity(group.len());
        for binding in group {
            let addr = SocketAddr::new(binding.host_ip(), port);
            sockets.push(HostBoundSocket::bind(binding.proto(), addr)?);
        }
        Ok(sockets)
    }

    /// Run the post-bind phases of one group: port driver, firewall rules,
    /// listen and proxy startup.
    async fn attach_group(
        &self,
        config: &FirewallNetworkConfig,
        active: &mut [ActivePortBinding],
    ) -> Result<()> {
        if let Some(port_driver) = &self.port_driver {
            for entry in active.iter_mut() {
                if entry.binding.disable_nat() {
                    continue;
                }
                let host_ip = entry.binding.host_ip();
                let child_ip = port_driver.child_host_ip(host_ip);
                match port_driver
                    .add_port(
                        entry.binding.proto(),
                        host_ip,
                        child_ip,
                        entry.binding.host_port(),
                    )
                    .await
                {
                    Ok(removal) => {
                        entry.binding.set_child_host_ip(child_ip);
                        entry.driver_removal = Some(removal);
                    }
                    Err(PortDriverError::ProtocolUnsupported(proto)) => {
                        warn!(
                            "Port driver does not support {}, binding {}:{} relies on firewall rules only",
                            proto,
                            host_ip,
                            entry.binding.host_port()
                        );
                        entry.binding.set_rootless_unsupported();
                    }
                    Err(e) => return Err(Error::new(e).context("add port driver mapping")),
                }
            }
        }

        let bindings: Vec<PortBinding> = active.iter().map(|a| a.binding.clone()).collect();
        self.firewaller
            .add_ports(config, &bindings)
            .await
            .context("install per-port firewall rules")?;

        for entry in active.iter() {
            if let Some(socket) = &entry.socket {
                socket.listen()?;
            }
        }

        if let Some(supervisor) = &self.proxy {
            for entry in active.iter_mut() {
                let socket = match &entry.socket {
                    Some(socket) => socket,
                    None => continue,
                };
                let handle = supervisor
                    .start(&entry.binding, socket.raw_fd())
                    .await
                    .context("start userland proxy")?;
                entry.proxy = Some(handle);

                // The proxy owns the descriptor now, except for SCTP where it
                // cannot inherit it yet.
                if entry.binding.proto() != Protocol::Sctp {
                    entry.socket = None;
                }
            }
        }

        Ok(())
    }

    /// Shared teardown of rollback and release: close sockets, undo port
    /// driver mappings, stop proxies, drop firewall rules and return the
    /// ports to the allocator. Never aborts early.
    async fn release_resources(
        &self,
        config: &FirewallNetworkConfig,
        bindings: Vec<ActivePortBinding>,
        flush_conntrack: bool,
    ) -> Result<()> {
        let mut acc = ErrorAccumulator::default();
        let mut released = Vec::with_capacity(bindings.len());

        for mut entry in bindings {
            // Closes the descriptor.
            entry.socket.take();

            if let Some(removal) = entry.driver_removal.take() {
                acc.push(removal.remove().await.context("remove port driver mapping"));
            }
            if let Some(proxy) = entry.proxy.take() {
                acc.push(proxy.stop().await.context("stop userland proxy"));
            }
            released.push(entry.binding);
        }

        acc.push(
            self.firewaller
                .del_ports(config, &released)
                .await
                .context("remove per-port firewall rules"),
        );

        for binding in &released {
            if !binding.disable_nat() && binding.host_port() != 0 {
                self.allocator
                    .release_port(binding.host_ip(), binding.proto(), binding.host_port());
            }
        }

        if flush_conntrack {
            for binding in released.iter().filter(|b| b.proto() == Protocol::Udp) {
                self.flush_conntrack(binding).await;
            }
        }

        acc.into_result()
    }

    /// Drop stale NAT flows of a released UDP binding so they cannot shadow
    /// a future binding of the same port. Best effort.
    async fn flush_conntrack(&self, binding: &PortBinding) {
        let binary = match &self.conntrack_binary {
            Some(binary) => binary,
            None => {
                debug!("No conntrack binary found, skipping flow cleanup");
                return;
            }
        };

        let mut command = Command::new(binary);
        command
            .arg("-D")
            .arg("-p")
            .arg("udp")
            .arg("--orig-port-dst")
            .arg(binding.host_port().to_string());
        if binding.container_ip().is_ipv6() {
            command.arg("-f").arg("ipv6");
        }

        // conntrack exits non-zero when no flow matched; that is fine.
        if let Err(e) = command.output().await {
            debug!("Conntrack cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{
        firewall::FirewallNetworkConfigBuilder, port::binding::PortBindingRequestBuilder,
        types::GwMode,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockFirewaller {
        added: Arc<Mutex<Vec<PortBinding>>>,
        deleted: Arc<Mutex<Vec<PortBinding>>>,
        fail_on_container_port: Option<u16>,
    }

    #[async_trait]
    impl Firewaller for MockFirewaller {
        async fn add_ports(
            &self,
            _config: &FirewallNetworkConfig,
            bindings: &[PortBinding],
        ) -> Result<()> {
            if let Some(port) = self.fail_on_container_port {
                if bindings.iter().any(|b| b.container_port() == port) {
                    anyhow::bail!("injected firewall failure for container port {}", port)
                }
            }
            self.added
                .lock()
                .expect("lock added")
                .extend_from_slice(bindings);
            Ok(())
        }

        async fn del_ports(
            &self,
            _config: &FirewallNetworkConfig,
            bindings: &[PortBinding],
        ) -> Result<()> {
            self.deleted
                .lock()
                .expect("lock deleted")
                .extend_from_slice(bindings);
            Ok(())
        }
    }

    fn config() -> FirewallNetworkConfig {
        FirewallNetworkConfigBuilder::default()
            .bridge_name("br-test0")
            .ipv4(Some("172.19.0.0/16".parse::<ipnetwork::Ipv4Network>().unwrap()))
            .ipv6(Some(
                "fdf8:b88e:bb5c:3483::/64"
                    .parse::<ipnetwork::Ipv6Network>()
                    .unwrap(),
            ))
            .icc(true)
            .masquerade(true)
            .build()
            .expect("build firewall config")
    }

    fn support() -> FamilySupport {
        FamilySupport {
            addr_v4: Some("172.19.0.2".parse().unwrap()),
            addr_v6: Some("fdf8:b88e:bb5c:3483::2".parse().unwrap()),
            nat_v4: true,
            nat_v6: true,
            proxy: true,
        }
    }

    fn mapper(
        allocator: Arc<PortAllocator>,
        firewaller: MockFirewaller,
        proxy: Option<ProxySupervisor>,
    ) -> PortMapper {
        PortMapper::new(allocator, Box::new(firewaller), None, proxy)
    }

    fn tcp(container_port: u16) -> PortBindingRequest {
        PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(container_port)
            .build()
            .expect("build request")
    }

    fn any4() -> IpAddr {
        "0.0.0.0".parse().expect("parse any address")
    }

    #[tokio::test]
    async fn ephemeral_pairs_share_one_port_per_container_port() -> Result<()> {
        let allocator = Arc::new(PortAllocator::new(42100, 42120));
        let fw = MockFirewaller::default();
        let mapper = mapper(Arc::clone(&allocator), fw.clone(), None);

        let active = mapper
            .add_port_mappings(&config(), support(), &[tcp(22), tcp(80)], any4())
            .await?;

        assert_eq!(active.len(), 4);
        let b: Vec<&PortBinding> = active.iter().map(ActivePortBinding::binding).collect();

        // First group: container port 22 on v4 and v6, same host port.
        assert_eq!(b[0].container_port(), 22);
        assert!(b[0].host_ip().is_ipv4());
        assert!(b[1].host_ip().is_ipv6());
        assert_eq!(b[0].host_port(), 42100);
        assert_eq!(b[1].host_port(), 42100);

        // Second group gets the next ephemeral port.
        assert_eq!(b[2].container_port(), 80);
        assert_eq!(b[2].host_port(), 42101);
        assert_eq!(b[3].host_port(), 42101);

        assert_eq!(fw.added.lock().expect("lock added").len(), 4);
        mapper.release_port_bindings(&config(), active).await
    }

    #[tokio::test]
    async fn busy_exact_port_fails_without_retry() -> Result<()> {
        let allocator = Arc::new(PortAllocator::default());
        let fw = MockFirewaller::default();
        let mapper = mapper(Arc::clone(&allocator), fw.clone(), None);

        // Another process already listens on the port, without SO_REUSEADDR.
        let blocker = std::net::TcpListener::bind("0.0.0.0:42200")?;

        let req = PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(80u16)
            .host_ip(Some(any4()))
            .host_port(42200u16)
            .build()?;

        let err = mapper
            .add_port_mappings(&config(), support(), &[req], any4())
            .await
            .unwrap_err();

        assert!(NetworkError::is_busy_port(&err));
        assert!(fw.added.lock().expect("lock added").is_empty());
        // The reservation was rolled back inside the allocator too.
        drop(blocker);
        allocator.request_ports_in_range(&[any4()], Protocol::Tcp, 42200, 42200)?;
        Ok(())
    }

    #[tokio::test]
    async fn range_requests_skip_ports_bound_elsewhere() -> Result<()> {
        let allocator = Arc::new(PortAllocator::default());
        let fw = MockFirewaller::default();
        let mapper = mapper(Arc::clone(&allocator), fw.clone(), None);

        // 42302 is taken for both protocols by other processes.
        let _tcp_blocker = std::net::TcpListener::bind("0.0.0.0:42302")?;
        let _udp_blocker = std::net::UdpSocket::bind("0.0.0.0:42302")?;

        let mut requests = vec![];
        for proto in [Protocol::Tcp, Protocol::Udp] {
            for container_port in [80u16, 81, 82] {
                requests.push(
                    PortBindingRequestBuilder::default()
                        .proto(proto)
                        .container_port(container_port)
                        .host_port(42300u16)
                        .host_port_end(42303u16)
                        .build()?,
                );
            }
        }

        let active = mapper
            .add_port_mappings(&config(), support(), &requests, any4())
            .await?;

        // 3 container ports * 2 protocols * 2 families.
        assert_eq!(active.len(), 12);
        for entry in &active {
            let b = entry.binding();
            let expected = match b.container_port() {
                80 => 42300,
                81 => 42301,
                82 => 42303, // 42302 skipped for all pairs
                other => panic!("unexpected container port {}", other),
            };
            assert_eq!(
                b.host_port(),
                expected,
                "container port {} of {}",
                b.container_port(),
                b.proto()
            );
        }

        mapper.release_port_bindings(&config(), active).await
    }

    #[tokio::test]
    async fn v4_only_container_publishes_v6_through_proxy_config() -> Result<()> {
        let allocator = Arc::new(PortAllocator::new(42400, 42410));
        let fw = MockFirewaller::default();
        let mapper = mapper(Arc::clone(&allocator), fw.clone(), None);

        let mut support = support();
        support.addr_v6 = None;

        let req = PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(80u16)
            .host_ip(Some("::".parse::<IpAddr>()?))
            .build()?;

        let active = mapper
            .add_port_mappings(&config(), support, &[req.clone()], any4())
            .await?;
        assert_eq!(active.len(), 1);
        assert!(active[0].binding().host_ip().is_ipv6());
        assert!(active[0].binding().container_ip().is_ipv4());
        mapper.release_port_bindings(&config(), active).await?;

        // Without the proxy the request is dropped, with a log line only.
        support.proxy = false;
        let active = mapper
            .add_port_mappings(&config(), support, &[req], any4())
            .await?;
        assert!(active.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn routed_mode_opens_firewall_without_binding_sockets() -> Result<()> {
        let allocator = Arc::new(PortAllocator::default());
        let fw = MockFirewaller::default();
        let mapper = mapper(Arc::clone(&allocator), fw.clone(), None);

        let mut config = config();
        config.gw_mode_v6 = GwMode::Routed;
        let mut support = support();
        support.nat_v6 = false;

        let active = mapper
            .add_port_mappings(&config, support, &[tcp(22)], any4())
            .await?;

        let v6 = active
            .iter()
            .find(|a| a.binding().container_ip().is_ipv6())
            .expect("v6 binding");
        assert!(v6.binding().disable_nat());
        assert_eq!(v6.binding().host_port(), 0);
        assert!(v6.socket.is_none());
        assert!(v6.proxy.is_none());

        // The firewall still saw the binding so the ACCEPT rule exists.
        assert!(fw
            .added
            .lock()
            .expect("lock added")
            .iter()
            .any(|b| b.disable_nat()));
        mapper.release_port_bindings(&config, active).await
    }

    #[tokio::test]
    async fn failing_group_rolls_back_everything() -> Result<()> {
        let allocator = Arc::new(PortAllocator::default());
        let fw = MockFirewaller {
            fail_on_container_port: Some(80),
            ..Default::default()
        };
        let mapper = mapper(Arc::clone(&allocator), fw.clone(), None);

        let req = |container: u16, host: u16| {
            PortBindingRequestBuilder::default()
                .proto(Protocol::Tcp)
                .container_port(container)
                .host_port(host)
                .build()
                .expect("build request")
        };

        // Container port 22 realizes fully, then container port 80 fails in
        // the firewall phase.
        let err = mapper
            .add_port_mappings(
                &config(),
                support(),
                &[req(80, 42500), req(22, 42501)],
                any4(),
            )
            .await
            .unwrap_err();
        assert!(chain(err).contains("injected firewall failure"));

        // The completed group's rules were removed again.
        assert!(fw
            .deleted
            .lock()
            .expect("lock deleted")
            .iter()
            .any(|b| b.container_port() == 22));

        // Both ports are free again, in the allocator and the kernel.
        for port in [42500u16, 42501] {
            allocator.request_ports_in_range(&[any4()], Protocol::Tcp, port, port)?;
            allocator.release_port(any4(), Protocol::Tcp, port);
            drop(HostBoundSocket::bind(
                Protocol::Tcp,
                SocketAddr::new(any4(), port),
            )?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn failing_proxy_start_rolls_back_the_group() -> Result<()> {
        let allocator = Arc::new(PortAllocator::default());
        let fw = MockFirewaller::default();
        let proxy = ProxySupervisor::new("/nonexistent/proxy-binary");
        let mapper = mapper(Arc::clone(&allocator), fw.clone(), Some(proxy));

        let req = PortBindingRequestBuilder::default()
            .proto(Protocol::Tcp)
            .container_port(80u16)
            .host_port(42600u16)
            .build()?;

        let err = mapper
            .add_port_mappings(&config(), support(), &[req], any4())
            .await
            .unwrap_err();
        assert!(chain(err).contains("userland proxy"));

        // Rules installed before the proxy phase were removed again.
        assert!(!fw.deleted.lock().expect("lock deleted").is_empty());
        allocator.request_ports_in_range(&[any4()], Protocol::Tcp, 42600, 42600)?;
        Ok(())
    }

    #[tokio::test]
    async fn release_returns_the_system_to_its_previous_state() -> Result<()> {
        let allocator = Arc::new(PortAllocator::new(42700, 42710));
        let fw = MockFirewaller::default();
        let mapper = mapper(Arc::clone(&allocator), fw.clone(), None);

        let active = mapper
            .add_port_mappings(&config(), support(), &[tcp(80)], any4())
            .await?;
        let ports: Vec<u16> = active.iter().map(|a| a.binding().host_port()).collect();

        mapper.release_port_bindings(&config(), active).await?;

        assert_eq!(
            fw.added.lock().expect("lock added").len(),
            fw.deleted.lock().expect("lock deleted").len()
        );
        for port in ports {
            // Free in the allocator and bindable again.
            allocator.request_ports_in_range(&[any4()], Protocol::Tcp, port, port)?;
            allocator.release_port(any4(), Protocol::Tcp, port);
            drop(HostBoundSocket::bind(
                Protocol::Tcp,
                SocketAddr::new(any4(), port),
            )?);
        }
        Ok(())
    }
}

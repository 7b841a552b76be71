//! Construction of the individual iptables rules.

use crate::network::{
    firewall::{
        ExposedPort, FirewallNetworkConfig, DOCKER_CHAIN, ISOLATION_STAGE_1, ISOLATION_STAGE_2,
    },
    port::binding::PortBinding,
    types::GwMode,
};
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
/// Address family a rule belongs to, selecting iptables or ip6tables.
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// The family of the provided address.
    pub fn of(addr: IpAddr) -> Self {
        if addr.is_ipv6() {
            Self::V6
        } else {
            Self::V4
        }
    }

    /// The "match anything" destination of this family.
    fn any_destination(self) -> &'static str {
        match self {
            Self::V4 => "0.0.0.0/0",
            Self::V6 => "::/0",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
/// One fully specified firewall rule.
pub struct Rule {
    /// The address family the rule applies to.
    pub family: Family,

    /// The iptables table holding the chain.
    pub table: &'static str,

    /// The chain the rule lives in.
    pub chain: &'static str,

    /// The rule specification, one token per element.
    pub spec: Vec<String>,

    /// Whether the rule is inserted at the head instead of appended.
    pub prepend: bool,
}

impl Rule {
    fn new(family: Family, table: &'static str, chain: &'static str, spec: Vec<String>) -> Self {
        Self {
            family,
            table,
            chain,
            spec,
            prepend: false,
        }
    }

    fn prepended(mut self) -> Self {
        self.prepend = true;
        self
    }

    /// The rule as a single space separated line, mainly for logs and tests.
    pub fn to_line(&self) -> String {
        format!("-t {} {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

/// Format a DNAT target, bracketing IPv6 addresses.
fn nat_destination(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

fn tokens(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

/// The per-port rules of one operational binding. Bindings whose host and
/// container families differ are served exclusively by the userland proxy and
/// get no kernel rules.
pub fn port_rules(
    config: &FirewallNetworkConfig,
    binding: &PortBinding,
    sctp_checksum: bool,
) -> Vec<Rule> {
    if binding.is_proxy_only() {
        return vec![];
    }

    let family = Family::of(binding.host_ip());
    let br = config.bridge_name.as_str();
    let proto = binding.proto().to_string();
    let container_ip = binding.container_ip().to_string();
    let container_port = binding.container_port().to_string();
    let mut rules = vec![];

    // Direct access to the published container port, inserted ahead of the
    // per-network terminal rule.
    rules.push(
        Rule::new(
            family,
            "filter",
            DOCKER_CHAIN,
            tokens(&[
                "!",
                "-i",
                br,
                "-o",
                br,
                "-p",
                &proto,
                "-d",
                &container_ip,
                "--dport",
                &container_port,
                "-j",
                "ACCEPT",
            ]),
        )
        .prepended(),
    );

    if !binding.disable_nat() && binding.host_port() != 0 {
        let host_port = binding.host_port().to_string();
        let destination = if binding.host_ip().is_unspecified() {
            family.any_destination().to_string()
        } else {
            binding.host_ip().to_string()
        };

        let mut spec = vec![];
        // With hairpin NAT the bridge's own traffic must hit the DNAT rule
        // too, so the ingress exception is dropped.
        if !config.hairpin {
            spec.extend(tokens(&["!", "-i", br]));
        }
        spec.extend(tokens(&[
            "-p",
            &proto,
            "-d",
            &destination,
            "--dport",
            &host_port,
            "-j",
            "DNAT",
            "--to-destination",
            &nat_destination(binding.container_ip(), binding.container_port()),
        ]));
        rules.push(Rule::new(family, "nat", DOCKER_CHAIN, spec));

        // The kernel does not fill SCTP checksums for NATed packets on all
        // paths; a mangle rule repairs them when the workaround is enabled.
        if binding.proto() == crate::network::port::binding::Protocol::Sctp && sctp_checksum {
            rules.push(Rule::new(
                family,
                "mangle",
                "POSTROUTING",
                tokens(&[
                    "-p",
                    "sctp",
                    "--sport",
                    &container_port,
                    "-j",
                    "CHECKSUM",
                    "--checksum-fill",
                ]),
            ));
        }

        // A binding on a loopback address must not be reachable from other
        // hosts which route 127/8 at us.
        if family == Family::V4 && binding.host_ip().is_loopback() {
            rules.push(Rule::new(
                family,
                "raw",
                "PREROUTING",
                tokens(&[
                    "-p",
                    &proto,
                    "-d",
                    &binding.host_ip().to_string(),
                    "--dport",
                    &host_port,
                    "!",
                    "-i",
                    "lo",
                    "-j",
                    "DROP",
                ]),
            ));
        }
    }

    // Protected NAT mode: remote peers must not bypass the DNAT by targeting
    // the container address directly.
    if config.gw_mode(family == Family::V6) == GwMode::Nat {
        rules.push(Rule::new(
            family,
            "raw",
            "PREROUTING",
            tokens(&[
                "-p",
                &proto,
                "-d",
                &container_ip,
                "--dport",
                &container_port,
                "!",
                "-i",
                br,
                "-j",
                "DROP",
            ]),
        ));
    }

    rules
}

/// The network scope rules of one bridge: isolation pair, internal network
/// confinement, masquerading, the terminal publish policy and ICC.
pub fn network_rules(config: &FirewallNetworkConfig) -> Vec<Rule> {
    let br = config.bridge_name.as_str();
    let mut rules = vec![];

    let subnets: Vec<(Family, String, GwMode, Option<String>)> = config
        .ipv4
        .iter()
        .map(|net| {
            (
                Family::V4,
                net.to_string(),
                config.gw_mode_v4,
                config.host_ipv4.map(|ip| ip.to_string()),
            )
        })
        .chain(config.ipv6.iter().map(|net| {
            (
                Family::V6,
                net.to_string(),
                config.gw_mode_v6,
                config.host_ipv6.map(|ip| ip.to_string()),
            )
        }))
        .collect();

    for (family, subnet, gw_mode, host_ip) in &subnets {
        // Isolation stage pair: traffic leaving this bridge for another one
        // is handed to stage 2, which drops anything entering a bridge.
        rules.push(
            Rule::new(
                *family,
                "filter",
                ISOLATION_STAGE_1,
                tokens(&["-i", br, "!", "-o", br, "-j", ISOLATION_STAGE_2]),
            )
            .prepended(),
        );
        rules.push(
            Rule::new(
                *family,
                "filter",
                ISOLATION_STAGE_2,
                tokens(&["-o", br, "-j", "DROP"]),
            )
            .prepended(),
        );

        if config.internal {
            // Internal bridges additionally drop anything whose source or
            // destination lies outside the bridge's own subnet.
            rules.push(
                Rule::new(
                    *family,
                    "filter",
                    ISOLATION_STAGE_1,
                    tokens(&["!", "-s", subnet, "-o", br, "-j", "DROP"]),
                )
                .prepended(),
            );
            rules.push(
                Rule::new(
                    *family,
                    "filter",
                    ISOLATION_STAGE_1,
                    tokens(&["!", "-d", subnet, "-i", br, "-j", "DROP"]),
                )
                .prepended(),
            );
        }

        if config.masquerade && gw_mode.nat() && !config.internal {
            let mut spec = tokens(&["-s", subnet, "!", "-o", br]);
            match host_ip {
                Some(ip) => spec.extend(tokens(&["-j", "SNAT", "--to-source", ip])),
                None => spec.extend(tokens(&["-j", "MASQUERADE"])),
            }
            rules.push(Rule::new(*family, "nat", "POSTROUTING", spec));
        }

        // Terminal publish policy of the DOCKER chain; the per-port ACCEPT
        // rules are inserted ahead of it.
        match gw_mode {
            GwMode::Nat => rules.push(Rule::new(
                *family,
                "filter",
                DOCKER_CHAIN,
                tokens(&["!", "-i", br, "-o", br, "-j", "DROP"]),
            )),
            GwMode::NatUnprotected => rules.push(Rule::new(
                *family,
                "filter",
                DOCKER_CHAIN,
                tokens(&["!", "-i", br, "-o", br, "-j", "ACCEPT"]),
            )),
            GwMode::Routed | GwMode::Isolated => {}
        }

        // Outbound traffic from the bridge and the ICC policy.
        rules.push(Rule::new(
            *family,
            "filter",
            "FORWARD",
            tokens(&["-i", br, "!", "-o", br, "-j", "ACCEPT"]),
        ));
        rules.push(Rule::new(
            *family,
            "filter",
            "FORWARD",
            tokens(&[
                "-i",
                br,
                "-o",
                br,
                "-j",
                if config.icc { "ACCEPT" } else { "DROP" },
            ]),
        ));
    }

    rules
}

/// ACLs of one legacy container link: the parent may reach each exposed port
/// of the child, and the child may answer.
pub fn link_rules(
    parent_ip: IpAddr,
    child_ip: IpAddr,
    exposed_ports: &[ExposedPort],
) -> Vec<Rule> {
    let family = Family::of(child_ip);
    let parent = parent_ip.to_string();
    let child = child_ip.to_string();
    let mut rules = vec![];

    for exposed in exposed_ports {
        let proto = exposed.proto.to_string();
        let port = exposed.port.to_string();
        rules.push(
            Rule::new(
                family,
                "filter",
                DOCKER_CHAIN,
                tokens(&[
                    "-s", &parent, "-d", &child, "-p", &proto, "--dport", &port, "-j", "ACCEPT",
                ]),
            )
            .prepended(),
        );
        rules.push(
            Rule::new(
                family,
                "filter",
                DOCKER_CHAIN,
                tokens(&[
                    "-s", &child, "-d", &parent, "-p", &proto, "--sport", &port, "-j", "ACCEPT",
                ]),
            )
            .prepended(),
        );
    }

    rules
}

//! Kernel tunables flipped during network setup, tracked for revert.

use anyhow::{format_err, Result};
use log::{debug, warn};
use sysctl::{Ctl, Sysctl};

/// Records every sysctl this process changed so that deleting the network
/// restores the previous values, and only those this process touched.
#[derive(Debug, Default)]
pub struct SysctlSet {
    changed: Vec<(String, String)>,
}

impl SysctlSet {
    /// Set a sysctl, remembering the previous value when it differs.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let ctl = Ctl::new(key).map_err(|e| format_err!("get sysctl {}: {}", key, e))?;
        let previous = ctl
            .value_string()
            .map_err(|e| format_err!("read sysctl {}: {}", key, e))?;

        if previous.trim() == value {
            return Ok(());
        }

        ctl.set_value_string(value)
            .map_err(|e| format_err!("set sysctl {}: {}", key, e))?;
        debug!("Set sysctl {} = {} (was {})", key, value, previous.trim());
        self.changed.push((key.into(), previous));
        Ok(())
    }

    /// Restore every changed sysctl, in reverse order. Failures are logged
    /// and do not abort the remaining restores.
    pub fn revert(&mut self) {
        for (key, previous) in self.changed.drain(..).rev() {
            match Ctl::new(&key) {
                Ok(ctl) => {
                    if let Err(e) = ctl.set_value_string(previous.trim()) {
                        warn!("Reverting sysctl {} failed: {}", key, e);
                    }
                }
                Err(e) => warn!("Reverting sysctl {} failed: {}", key, e),
            }
        }
    }

    /// Enable IPv4 forwarding.
    pub fn enable_ip_forward(&mut self) -> Result<()> {
        self.set("net.ipv4.ip_forward", "1")
    }

    /// Enable IPv6 forwarding for current and future interfaces.
    pub fn enable_ipv6_forwarding(&mut self) -> Result<()> {
        self.set("net.ipv6.conf.default.forwarding", "1")?;
        self.set("net.ipv6.conf.all.forwarding", "1")
    }

    /// Allow IPv6 on the bridge and stop it from accepting router
    /// advertisements.
    pub fn prepare_bridge_ipv6(&mut self, bridge: &str) -> Result<()> {
        self.set(&format!("net.ipv6.conf.{}.disable_ipv6", bridge), "0")?;
        self.set(&format!("net.ipv6.conf.{}.accept_ra", bridge), "0")
    }

    /// Send bridged traffic through the iptables chains.
    pub fn enable_bridge_nf_call(&mut self, ipv6: bool) -> Result<()> {
        self.set("net.bridge.bridge-nf-call-iptables", "1")?;
        if ipv6 {
            self.set("net.bridge.bridge-nf-call-ip6tables", "1")?;
        }
        Ok(())
    }

    /// Allow 127/8 to cross the routing boundary into the bridge, needed for
    /// hairpin NAT of loopback bindings.
    pub fn enable_route_localnet(&mut self, bridge: &str) -> Result<()> {
        self.set(&format!("net.ipv4.conf.{}.route_localnet", bridge), "1")
    }
}

//! Driver configuration related structures.

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::{env, os::unix::fs::PermissionsExt, path::PathBuf};

/// Historical name of the default bridge device.
pub const DEFAULT_BRIDGE_NAME: &str = "docker0";

/// Environment variable overriding the default bridge name, used by tests.
pub const ENV_DEFAULT_BRIDGE: &str = "DOCKER_TEST_CREATE_DEFAULT_BRIDGE";

/// Environment variable enabling the SCTP checksum workaround rule.
pub const ENV_SCTP_CHECKSUM: &str = "DOCKER_IPTABLES_SCTP_CHECKSUM";

/// Default beginning of the ephemeral host port range.
pub const EPHEMERAL_PORT_BEGIN: u16 = 49153;

/// Default end of the ephemeral host port range.
pub const EPHEMERAL_PORT_END: u16 = 65535;

#[derive(Builder, Clone, Debug, CopyGetters, Getters, Deserialize, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
/// Process wide configuration of the bridge driver.
pub struct DriverConfig {
    #[get = "pub"]
    /// Path to the userland proxy binary. `None` disables spawning proxies
    /// even when `userland_proxy` is set.
    userland_proxy_path: Option<PathBuf>,

    #[get_copy = "pub"]
    /// Whether published ports are additionally served by a userland proxy.
    /// Disabling this enables hairpin NAT on the bridge ports instead.
    userland_proxy: bool,

    #[get_copy = "pub"]
    /// First port of the range used for "allocate any" host port requests.
    ephemeral_port_begin: u16,

    #[get_copy = "pub"]
    /// Last port of the range used for "allocate any" host port requests.
    ephemeral_port_end: u16,

    #[get_copy = "pub"]
    /// Whether the driver flips the kernel forwarding and bridge-nf sysctls
    /// itself. Disabled when an operator manages them externally.
    manage_sysctls: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            userland_proxy_path: None,
            userland_proxy: true,
            ephemeral_port_begin: EPHEMERAL_PORT_BEGIN,
            ephemeral_port_end: EPHEMERAL_PORT_END,
            manage_sysctls: true,
        }
    }
}

impl DriverConfig {
    /// The name used for the default bridge, honoring the test override
    /// environment variable.
    pub fn default_bridge_name() -> String {
        env::var(ENV_DEFAULT_BRIDGE).unwrap_or_else(|_| DEFAULT_BRIDGE_NAME.into())
    }

    /// Whether the SCTP checksum workaround rule should be installed.
    pub fn sctp_checksum_enabled() -> bool {
        env::var(ENV_SCTP_CHECKSUM).map(|v| v == "1").unwrap_or(false)
    }

    /// Whether the WSL2 `wslinfo` helper binary is present and executable.
    /// Together with a `loopback0` link this indicates mirrored networking.
    pub fn wslinfo_executable() -> bool {
        std::fs::metadata("/usr/bin/wslinfo")
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
}

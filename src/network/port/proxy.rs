//! Supervision of userland proxy child processes.

use crate::network::port::binding::PortBinding;
use anyhow::{bail, Context, Result};
use getset::Getters;
use log::{debug, warn};
use nix::{
    sys::signal::{kill, Signal},
    unistd::{dup2, Pid},
};
use std::{
    os::unix::io::RawFd,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::{Child, Command};

/// The file descriptor number the bound socket is handed to the proxy on.
const PROXY_SOCKET_FD: RawFd = 3;

/// How long a proxy child may take to exit after SIGTERM before it is killed.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Getters)]
/// Starts and stops one userland proxy process per published port.
pub struct ProxySupervisor {
    #[get]
    /// Path to the proxy binary.
    binary: PathBuf,
}

#[derive(Debug)]
/// A running proxy child. Dropping the handle leaves the child running; call
/// `stop` to terminate it.
pub struct ProxyHandle {
    child: Child,
}

impl ProxySupervisor {
    /// Create a supervisor for the provided proxy binary.
    pub fn new<P: AsRef<Path>>(binary: P) -> Self {
        Self {
            binary: binary.as_ref().into(),
        }
    }

    /// Spawn a proxy for the provided binding, inheriting the bound socket.
    /// The parent keeps its copy of the descriptor; the caller decides
    /// whether to close it after the handoff.
    pub async fn start(&self, binding: &PortBinding, socket_fd: RawFd) -> Result<ProxyHandle> {
        debug!(
            "Starting userland proxy for {}:{} -> {}:{} ({})",
            binding.host_ip(),
            binding.host_port(),
            binding.container_ip(),
            binding.container_port(),
            binding.proto()
        );

        let mut command = Command::new(self.binary());
        command
            .arg("-proto")
            .arg(binding.proto().to_string())
            .arg("-host-ip")
            .arg(binding.host_ip().to_string())
            .arg("-host-port")
            .arg(binding.host_port().to_string())
            .arg("-container-ip")
            .arg(binding.container_ip().to_string())
            .arg("-container-port")
            .arg(binding.container_port().to_string())
            .arg("-sock-fd")
            .arg(PROXY_SOCKET_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // The child finds the listening socket on a fixed descriptor. dup2
        // clears close-on-exec on the duplicate.
        unsafe {
            command.pre_exec(move || {
                dup2(socket_fd, PROXY_SOCKET_FD)
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawn userland proxy {}", self.binary().display()))?;

        Ok(ProxyHandle { child })
    }
}

impl ProxyHandle {
    /// Terminate the proxy with SIGTERM and reap it, escalating to SIGKILL
    /// after a timeout.
    pub async fn stop(mut self) -> Result<()> {
        let pid = match self.child.id() {
            Some(pid) => Pid::from_raw(pid as i32),
            None => return Ok(()), // already reaped
        };

        kill(pid, Signal::SIGTERM).context("signal userland proxy")?;

        match tokio::time::timeout(STOP_TIMEOUT, self.child.wait()).await {
            Ok(status) => {
                let status = status.context("wait for userland proxy")?;
                // Dying from the SIGTERM just sent is a clean shutdown.
                let terminated = status.signal() == Some(Signal::SIGTERM as i32);
                if !status.success() && !terminated {
                    bail!("userland proxy exited with {}", status)
                }
                Ok(())
            }
            Err(_) => {
                warn!("Userland proxy did not exit on SIGTERM, killing it");
                self.child.kill().await.context("kill userland proxy")?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::port::binding::{PortBindingBuilder, Protocol};
    use std::net::IpAddr;

    fn binding() -> Result<PortBinding> {
        Ok(PortBindingBuilder::default()
            .proto(Protocol::Tcp)
            .container_ip("172.19.0.2".parse::<IpAddr>()?)
            .container_port(80u16)
            .host_ip("127.0.0.1".parse::<IpAddr>()?)
            .host_port(0u16)
            .host_port_end(0u16)
            .build()?)
    }

    #[tokio::test]
    async fn spawn_failure_for_missing_binary() -> Result<()> {
        let supervisor = ProxySupervisor::new("/nonexistent/proxy-binary");
        assert!(supervisor.start(&binding()?, 0).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn stop_reaps_a_real_child() -> Result<()> {
        // `sleep` stands in for a proxy which exits on SIGTERM.
        let sleep = which::which("sleep")?;
        let child = Command::new(sleep).arg("30").spawn()?;
        let handle = ProxyHandle { child };

        handle.stop().await
    }
}

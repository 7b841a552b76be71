//! Host port arbitration across concurrent callers.

use crate::{config::DriverConfig, error::NetworkError, network::port::binding::Protocol};
use anyhow::{Error, Result};
use log::trace;
use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::Mutex,
};

/// Arbitrates host port numbers per (address, protocol). All checks and
/// reservations for one request happen under a single lock, so two concurrent
/// requests observing an address overlap can never both succeed on the same
/// port.
#[derive(Debug)]
pub struct PortAllocator {
    ephemeral_begin: u16,
    ephemeral_end: u16,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    /// Which addresses currently hold a given (protocol, port).
    allocated: HashMap<(Protocol, u16), HashSet<IpAddr>>,

    /// Scan cursor per (protocol, range), so consecutive requests walk the
    /// range instead of re-probing its beginning.
    cursors: HashMap<(Protocol, u16, u16), u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        let config = DriverConfig::default();
        Self::new(config.ephemeral_port_begin(), config.ephemeral_port_end())
    }
}

impl PortAllocator {
    /// Create an allocator with the provided ephemeral range for "any port"
    /// requests.
    pub fn new(ephemeral_begin: u16, ephemeral_end: u16) -> Self {
        Self {
            ephemeral_begin,
            ephemeral_end,
            state: Mutex::new(State::default()),
        }
    }

    /// Reserve one port which is simultaneously free on every provided
    /// address. `begin == end == 0` selects from the ephemeral range,
    /// `begin == end != 0` is an exact request which never scans.
    pub fn request_ports_in_range(
        &self,
        addrs: &[IpAddr],
        proto: Protocol,
        begin: u16,
        end: u16,
    ) -> Result<u16> {
        let (begin, end) = if begin == 0 && end == 0 {
            (self.ephemeral_begin, self.ephemeral_end)
        } else {
            (begin, end)
        };

        let mut state = self.state.lock().expect("lock allocator state");

        if begin == end {
            if state.conflicts(proto, begin, addrs) {
                return Err(busy(addrs, proto, begin));
            }
            state.reserve(proto, begin, addrs);
            trace!("Reserved exact port {}/{} for {:?}", begin, proto, addrs);
            return Ok(begin);
        }

        let span = u32::from(end) - u32::from(begin) + 1;
        let cursor = state
            .cursors
            .get(&(proto, begin, end))
            .copied()
            .unwrap_or(end);
        for step in 1..=span {
            let offset = (u32::from(cursor) - u32::from(begin) + step) % span;
            let port = begin + offset as u16;
            if state.conflicts(proto, port, addrs) {
                continue;
            }
            state.reserve(proto, port, addrs);
            state.cursors.insert((proto, begin, end), port);
            trace!("Reserved port {}/{} for {:?}", port, proto, addrs);
            return Ok(port);
        }

        Err(busy(addrs, proto, begin))
    }

    /// Return a port to the pool. A no-op if the reservation is already gone.
    pub fn release_port(&self, addr: IpAddr, proto: Protocol, port: u16) {
        let mut state = self.state.lock().expect("lock allocator state");
        if let Some(holders) = state.allocated.get_mut(&(proto, port)) {
            holders.remove(&addr);
            if holders.is_empty() {
                state.allocated.remove(&(proto, port));
            }
        }
        trace!("Released port {}/{} on {}", port, proto, addr);
    }

    /// Drop every reservation and scan cursor.
    pub fn release_all(&self) {
        let mut state = self.state.lock().expect("lock allocator state");
        state.allocated.clear();
        state.cursors.clear();
    }
}

impl State {
    /// Whether any requested address collides with a holder of the port. The
    /// unspecified address of a family aliases every specific address of the
    /// same family.
    fn conflicts(&self, proto: Protocol, port: u16, addrs: &[IpAddr]) -> bool {
        match self.allocated.get(&(proto, port)) {
            None => false,
            Some(holders) => addrs.iter().any(|addr| {
                holders.iter().any(|held| {
                    held.is_ipv6() == addr.is_ipv6()
                        && (held == addr || held.is_unspecified() || addr.is_unspecified())
                })
            }),
        }
    }

    fn reserve(&mut self, proto: Protocol, port: u16, addrs: &[IpAddr]) {
        self.allocated
            .entry((proto, port))
            .or_insert_with(HashSet::new)
            .extend(addrs.iter().copied());
    }
}

fn busy(addrs: &[IpAddr], proto: Protocol, port: u16) -> Error {
    Error::new(NetworkError::BusyPort {
        addr: addrs
            .first()
            .copied()
            .unwrap_or_else(|| "0.0.0.0".parse().expect("parse unspecified address")),
        proto: proto.to_string(),
        port,
    })
}

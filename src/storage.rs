//! Persistence of endpoint records across daemon restarts.

use crate::network::port::binding::{PortBinding, PortBindingRequest};
use anyhow::{Context, Result};
use getset::Getters;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sled::Db;
use std::{
    net::{Ipv4Addr, Ipv6Addr},
    path::Path,
};

/// Persistence seam for the driver's endpoint records. An implementation is
/// nothing more than a durable, string-keyed blob store; serialization of
/// the records happens on this side of the seam, so alternative backends do
/// not need to know the record layout.
pub trait KeyValueStorage {
    /// Open or create the store below the provided directory.
    fn open(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Read and deserialize the value stored under `key`, if present.
    fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>>;

    /// Serialize `value` and write it under `key`, replacing any existing
    /// entry.
    fn insert<V: Serialize>(&mut self, key: &str, value: &V) -> Result<()>;

    /// Forget the entry stored under `key`. Unknown keys are not an error.
    fn remove(&mut self, key: &str) -> Result<()>;

    /// Block until earlier writes have reached disk, so the daemon can stop
    /// without losing records.
    fn persist(&mut self) -> Result<()>;
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
/// Parent and child endpoint ids of the legacy container links feature.
pub struct ContainerConfig {
    /// Endpoints allowed to reach this endpoint's exposed ports.
    pub parent_endpoints: Vec<String>,

    /// Endpoints this endpoint is allowed to reach.
    pub child_endpoints: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// The serialized shape of an endpoint, sufficient to restore its operational
/// state after a daemon restart.
pub struct EndpointRecord {
    /// Endpoint id.
    pub id: String,

    /// Owning network id.
    pub nid: String,

    /// Container side interface name of the veth pair.
    pub src_name: String,

    /// MAC address in colon separated notation.
    pub mac: String,

    /// IPv4 address of the endpoint, if assigned.
    pub addr_v4: Option<Ipv4Addr>,

    /// IPv6 address of the endpoint, if assigned.
    pub addr_v6: Option<Ipv6Addr>,

    /// Legacy link configuration.
    pub container_config: ContainerConfig,

    /// The port binding requests as published by the user.
    pub ext_conn_config: Vec<PortBindingRequest>,

    /// The operational bindings realized for this endpoint.
    pub port_mapping: Vec<PortBinding>,
}

impl EndpointRecord {
    /// Fix up a freshly deserialized record. Reloaded bindings pin their range
    /// end to the chosen port so a restart cannot move a published port to a
    /// different spot in the original range.
    pub fn restored(mut self) -> Self {
        for binding in &mut self.port_mapping {
            binding.set_host_port_end(binding.host_port());
        }
        self
    }
}

#[derive(Clone, Debug, Getters)]
/// Sled backed endpoint record storage.
pub struct EndpointStore {
    #[get]
    /// The internal database.
    db: Db,
}

impl EndpointStore {
    /// Retrieve an endpoint record, applying the restore fixups.
    pub fn load_endpoint(&self, id: &str) -> Result<Option<EndpointRecord>> {
        Ok(self
            .get::<EndpointRecord>(id)?
            .map(EndpointRecord::restored))
    }
}

impl KeyValueStorage for EndpointStore {
    /// Open the sled database in the provided directory.
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)
                .with_context(|| format!("open storage path {}", path.display()))?,
        })
    }

    fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.db().get(key).context("read record")? {
            None => Ok(None),
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).context("decode record")?,
            )),
        }
    }

    fn insert<V: Serialize>(&mut self, key: &str, value: &V) -> Result<()> {
        let raw = serde_json::to_vec(value).context("encode record")?;
        self.db().insert(key, raw).context("write record")?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.db().remove(key).context("drop record")?;
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        self.db().flush().context("flush records to disk")?;
        Ok(())
    }
}

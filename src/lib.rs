//! This is the main library interface for this project

pub mod config;
pub mod error;
pub mod network;
pub mod storage;

pub use config::{DriverConfig, DriverConfigBuilder};
pub use network::{BridgeDriver, DriverContext, DriverContextBuilder, JoinInfo};

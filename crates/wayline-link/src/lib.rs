pub mod doctor;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod store;

use serde::Deserialize;
use std::time::Duration;

pub use endpoint::{Connector, Endpoint, SerialConnector, UsbId};
pub use error::LinkError;
pub use manager::{
    ConnectMode, ConnectOutcome, ConnectionManager, ConnectionState, Inbound, LossReason,
    ManagerConfig, SendOutcome,
};
pub use store::LinkStore;

/// `[link]` section of the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Fixed port; when absent the operator is prompted.
    pub port: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_stale_after_s")]
    pub stale_after_s: u64,
}

fn default_baud() -> u32 { 115_200 }
fn default_state_file() -> String { "wayline-link.toml".into() }
fn default_backoff_ms() -> u64 { 1000 }
fn default_stale_after_s() -> u64 { 10 }

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: default_baud(),
            state_file: default_state_file(),
            reconnect_backoff_ms: default_backoff_ms(),
            stale_after_s: default_stale_after_s(),
        }
    }
}

impl From<&LinkConfig> for ManagerConfig {
    fn from(cfg: &LinkConfig) -> Self {
        ManagerConfig {
            reconnect_backoff: Duration::from_millis(cfg.reconnect_backoff_ms),
            stale_after: Duration::from_secs(cfg.stale_after_s),
            ..ManagerConfig::default()
        }
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Persisted {
    #[serde(default = "default_true")]
    auto_reconnect: bool,
    #[serde(default)]
    last_device: Option<Endpoint>,
}

fn default_true() -> bool { true }

impl Default for Persisted {
    fn default() -> Self {
        Self { auto_reconnect: true, last_device: None }
    }
}

/// Operator-side link memory that survives restarts: the last endpoint we
/// connected to and the auto-reconnect preference.
#[derive(Debug)]
pub struct LinkStore {
    path: Option<PathBuf>,
    data: Persisted,
}

impl LinkStore {
    /// Loads `path` if it exists. An unreadable file is logged and replaced
    /// by defaults on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(s) => toml::from_str(&s).unwrap_or_else(|e| {
                warn!("link store: ignoring unreadable {}: {}", path.display(), e);
                Persisted::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Persisted::default(),
            Err(e) => {
                warn!("link store: cannot read {}: {}", path.display(), e);
                Persisted::default()
            }
        };
        Self { path: Some(path), data }
    }

    pub fn in_memory() -> Self {
        Self { path: None, data: Persisted::default() }
    }

    pub fn last_device(&self) -> Option<&Endpoint> {
        self.data.last_device.as_ref()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.data.auto_reconnect
    }

    pub fn remember(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.data.last_device.as_ref() == Some(endpoint) {
            return Ok(());
        }
        self.data.last_device = Some(endpoint.clone());
        self.persist()
    }

    pub fn forget(&mut self) -> Result<()> {
        if self.data.last_device.take().is_none() {
            return Ok(());
        }
        self.persist()
    }

    pub fn set_auto_reconnect(&mut self, on: bool) -> Result<()> {
        self.data.auto_reconnect = on;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()); };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let body = toml::to_string_pretty(&self.data).context("encode link store")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        debug!("link store: saved {}", path.display());
        Ok(())
    }
}

use anyhow::Result;
use std::path::Path;

use crate::LinkConfig;

pub fn check_link(cfg: &LinkConfig) -> Result<()> {
    if let Some(port) = &cfg.port {
        anyhow::ensure!(!port.trim().is_empty(), "link.port is empty; remove it to be prompted");
    }
    anyhow::ensure!(cfg.baud >= 9600, "link.baud too low: {}", cfg.baud);
    anyhow::ensure!(cfg.reconnect_backoff_ms > 0, "link.reconnect_backoff_ms must be > 0");
    anyhow::ensure!(cfg.stale_after_s >= 2, "link.stale_after_s too short; telemetry arrives every second");
    check_state_file(&cfg.state_file)
}

pub fn check_state_file(state_file: &str) -> Result<()> {
    let p = Path::new(state_file);
    if p.exists() {
        anyhow::ensure!(p.is_file(), "link.state_file is not a file: {}", state_file);
    }
    if let Some(dir) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
        if dir.exists() {
            anyhow::ensure!(dir.is_dir(), "link.state_file parent is not a dir: {}", dir.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        assert!(check_link(&LinkConfig::default()).is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = LinkConfig { baud: 1200, ..LinkConfig::default() };
        assert!(check_link(&cfg).is_err());
        let cfg = LinkConfig { port: Some(" ".into()), ..LinkConfig::default() };
        assert!(check_link(&cfg).is_err());
        let cfg = LinkConfig { stale_after_s: 1, ..LinkConfig::default() };
        assert!(check_link(&cfg).is_err());
    }

    #[test]
    fn state_file_must_not_be_a_dir() {
        let dir = std::env::temp_dir();
        assert!(check_state_file(dir.to_str().unwrap()).is_err());
    }
}

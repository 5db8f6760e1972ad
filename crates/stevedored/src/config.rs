//! Daemon configuration, loaded from an optional TOML file.

use std::path::Path;

use serde::Deserialize;

/// Top-level `stevedored.toml` layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Seconds between fleet-wide task reconciliations.
    pub reconcile_interval_secs: u64,
    /// Seconds between background scale passes over the group tree.
    pub scale_interval_secs: u64,
    /// Event bus capacity.
    pub event_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 300,
            scale_interval_secs: 30,
            event_capacity: 256,
        }
    }
}

impl DaemonConfig {
    /// Read a config file, or fall back to defaults when absent.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.reconcile_interval_secs, 300);
        assert_eq!(config.scale_interval_secs, 30);
    }

    #[test]
    fn parses_partial_overrides() {
        let config: DaemonConfig = toml::from_str("scale_interval_secs = 5").unwrap();
        assert_eq!(config.scale_interval_secs, 5);
        assert_eq!(config.reconcile_interval_secs, 300);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<DaemonConfig>("bogus = true").is_err());
    }
}

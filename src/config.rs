//! Module configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
}

fn default_qp_size() -> u16 {
    crate::constants::DEFAULT_QP_SIZE
}

fn default_cq_size() -> u16 {
    crate::constants::DEFAULT_CQ_SIZE
}

fn default_num_requests() -> u32 {
    crate::constants::DEFAULT_NUM_REQUESTS
}

/// Engine options. Field semantics follow the scan parameters of the
/// original module; unset fields take the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Send queue depth in WRs.
    pub qp_size: u16,
    /// Completion queue depth.
    pub cq_size: u16,
    /// MKey pool size per device.
    pub num_requests: u32,
    /// Cap on blocks per multi-block crypto sub-request; 0 collapses the
    /// whole task into one sub-request.
    pub split_mb_blocks: u32,
    /// Batch WQEs and signal only the last one.
    pub siglast: bool,
    /// Fuse adjacent encrypt+CRC and CRC+decrypt task pairs. Signature
    /// MKeys are then created with the crypto bit set and standalone CRC
    /// opcodes become unavailable.
    pub merge: bool,
    /// One QP per (device, memory domain) pair.
    pub qp_per_domain: bool,
    /// Comma-separated NIC names allowed to do crypto; empty allows all.
    pub allowed_crypto_devs: Option<String>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            qp_size: default_qp_size(),
            cq_size: default_cq_size(),
            num_requests: default_num_requests(),
            split_mb_blocks: 0,
            siglast: false,
            merge: false,
            qp_per_domain: false,
            allowed_crypto_devs: None,
        }
    }
}

impl ModuleConfig {
    /// Loads the configuration from a TOML file.
    pub fn load_from_path(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub(crate) fn allowed_crypto_devs(&self) -> Vec<String> {
        self.allowed_crypto_devs
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_module_constants() {
        let cfg = ModuleConfig::default();
        assert_eq!(cfg.qp_size, 256);
        assert_eq!(cfg.cq_size, 256);
        assert_eq!(cfg.num_requests, 2048);
        assert_eq!(cfg.split_mb_blocks, 0);
        assert!(!cfg.siglast);
        assert!(!cfg.merge);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: ModuleConfig = toml::from_str("qp_size = 64\nsiglast = true\n").unwrap();
        assert_eq!(cfg.qp_size, 64);
        assert!(cfg.siglast);
        assert_eq!(cfg.num_requests, 2048);
    }

    #[test]
    fn allow_list_parses_comma_separated_names() {
        let cfg = ModuleConfig {
            allowed_crypto_devs: Some("mlx5_0, mlx5_1,,mlx5_2".into()),
            ..Default::default()
        };
        assert_eq!(cfg.allowed_crypto_devs(), vec!["mlx5_0", "mlx5_1", "mlx5_2"]);
        assert!(ModuleConfig::default().allowed_crypto_devs().is_empty());
    }
}

//! Module init: device discovery, capability gating, pool creation,
//! crypto key management and the config dump surface.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use serde_json::json;

use crate::channel::Channel;
use crate::config::ModuleConfig;
use crate::device::{Device, DeviceContext};
use crate::domain::{DomainId, MemMap};
use crate::error::{AccelError, Result};
use crate::hw::{MkeyFlavor, NicBackend};
use crate::mkey::{CryptoMkeyPool, PsvPool, SigMkeyPool};
use crate::stats::DeviceStats;
use crate::task::{CryptoKey, OpCode, Task};

/// XTS tweak derivation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TweakMode {
    SimpleLba,
    Incr512UpperLba,
}

pub(crate) struct ModuleShared {
    pub(crate) config: ModuleConfig,
    pub(crate) backend: Arc<dyn NicBackend>,
    pub(crate) dev_ctxs: Vec<Arc<DeviceContext>>,
    pub(crate) crypto_supported: bool,
    pub(crate) crc_supported: bool,
    /// Device names allowed to do crypto; guarded for reconfiguration.
    pub(crate) allowed_crypto_devs: Mutex<Vec<String>>,
    /// Stats of destroyed channels, merged under the module lock.
    pub(crate) total_stats: Mutex<DeviceStats>,
}

/// The acceleration engine module. One per process; hands out
/// per-thread channels.
pub struct AccelModule {
    shared: Arc<ModuleShared>,
}

impl AccelModule {
    pub fn new(backend: Arc<dyn NicBackend>, config: ModuleConfig) -> Result<Self> {
        let devices = backend.devices();
        if devices.is_empty() {
            return Err(AccelError::Unsupported("no devices found".into()));
        }

        let allowed = config.allowed_crypto_devs();
        let crypto_devs: Vec<_> = devices
            .iter()
            .filter(|d| d.crypto.is_some())
            .filter(|d| allowed.is_empty() || allowed.iter().any(|a| *a == d.name))
            .cloned()
            .collect();

        let crypto_supported = !crypto_devs.is_empty();
        // CRC offload stays enabled only when every crypto device has it.
        let crc_supported = crypto_supported
            && crypto_devs
                .iter()
                .all(|d| d.crypto.is_some_and(|c| c.crc32c));

        let selected = if crypto_supported {
            crypto_devs
        } else {
            info!("No crypto devs found, only memory operations will be supported");
            vec![devices[0].clone()]
        };

        let mut dev_ctxs = Vec::with_capacity(selected.len());
        for (i, dev) in selected.iter().enumerate() {
            let caps = dev.crypto;
            let crypto_multi_block = caps.is_some_and(|c| c.multi_block_be_tweak);
            if !crypto_multi_block && config.split_mb_blocks > 0 {
                warn!(
                    "\"split_mb_blocks\" is set but dev {} doesn't support multi block crypto",
                    dev.name
                );
            }
            let map = MemMap::new(backend.create_mkey(&dev.name, MkeyFlavor::Direct)?);
            let mkey_pool = if crypto_supported {
                Some(CryptoMkeyPool::create(
                    backend.as_ref(),
                    &dev.name,
                    config.num_requests,
                    MkeyFlavor::Crypto,
                )?)
            } else {
                None
            };
            let (sig_mkey_pool, psv_pool) = if crc_supported {
                let sig = SigMkeyPool::create(
                    backend.as_ref(),
                    &dev.name,
                    config.num_requests,
                    config.merge && crypto_supported,
                )?;
                let psv = PsvPool::create(backend.as_ref(), &dev.name, config.num_requests, &map)?;
                (Some(sig), Some(psv))
            } else {
                (None, None)
            };
            if let Some(caps) = caps {
                info!(
                    "Crypto dev {}, aes_xts: single block {}, mb_be {}, mb_le {}, inc_64 {}, crc32c {}",
                    dev.name,
                    caps.single_block_le_tweak,
                    caps.multi_block_be_tweak,
                    caps.multi_block_le_tweak,
                    caps.tweak_inc_64,
                    crc_supported
                );
            }
            dev_ctxs.push(Arc::new(DeviceContext::new(
                dev.name.clone(),
                DomainId(i as u64 + 1),
                map,
                mkey_pool,
                sig_mkey_pool,
                psv_pool,
                crypto_multi_block,
                caps,
            )));
        }

        info!("Accel engine initialized, {} device(s)", dev_ctxs.len());
        Ok(Self {
            shared: Arc::new(ModuleShared {
                config,
                backend,
                dev_ctxs,
                crypto_supported,
                crc_supported,
                allowed_crypto_devs: Mutex::new(allowed),
                total_stats: Mutex::new(DeviceStats::default()),
            }),
        })
    }

    pub fn supports_opcode(&self, opc: OpCode) -> bool {
        match opc {
            OpCode::Copy => true,
            OpCode::Encrypt | OpCode::Decrypt => self.shared.crypto_supported,
            OpCode::Crc32c | OpCode::CheckCrc32c | OpCode::CopyCrc32c => {
                // With merge enabled, signature MKeys carry the crypto
                // bit and cannot serve standalone CRC tasks.
                self.shared.crc_supported && !self.shared.config.merge
            }
        }
    }

    /// Create the per-thread channel owning one QP and CQ per device.
    pub fn get_io_channel(&self) -> Result<Channel> {
        let mut devs = Vec::with_capacity(self.shared.dev_ctxs.len());
        for ctx in &self.shared.dev_ctxs {
            devs.push(Device::new(Arc::clone(ctx), Arc::clone(&self.shared))?);
        }
        Ok(Channel::new(devs, Arc::clone(&self.shared)))
    }

    /// Extra bytes a caller should reserve per task allocation.
    pub fn task_ctx_size(&self) -> usize {
        std::mem::size_of::<Task>()
    }

    /// Derive a per-key NIC DEK on every crypto device. The combined
    /// key buffer is wiped before returning.
    pub fn crypto_key_init(
        &self,
        key: &[u8],
        key2: &[u8],
        tweak_mode: TweakMode,
    ) -> Result<Arc<CryptoKey>> {
        if key.is_empty() || key2.is_empty() {
            return Err(AccelError::InvalidInput("empty crypto key".into()));
        }
        if !self.shared.crypto_supported {
            return Err(AccelError::Unsupported("crypto is disabled".into()));
        }
        let mut dek = Vec::with_capacity(key.len() + key2.len());
        dek.extend_from_slice(key);
        dek.extend_from_slice(key2);

        let mut deks = BTreeMap::new();
        let mut rc = Ok(());
        for ctx in &self.shared.dev_ctxs {
            match self.shared.backend.create_dek(
                &ctx.name,
                &dek,
                tweak_mode == TweakMode::Incr512UpperLba,
            ) {
                Ok(id) => {
                    deks.insert(ctx.name.clone(), id);
                }
                Err(e) => {
                    rc = Err(e);
                    break;
                }
            }
        }
        dek.fill(0);
        if let Err(e) = rc {
            for (dev, id) in deks {
                self.shared.backend.destroy_dek(&dev, id);
            }
            return Err(e);
        }
        Ok(Arc::new(CryptoKey { deks }))
    }

    pub fn crypto_key_deinit(&self, key: &CryptoKey) {
        for (dev, id) in &key.deks {
            self.shared.backend.destroy_dek(dev, *id);
        }
    }

    /// Device-level RDMA memory domains, one per device. Returns the
    /// total count and fills up to `out.len()` entries.
    pub fn get_memory_domains(&self, out: &mut [DomainId]) -> usize {
        for (slot, ctx) in out.iter_mut().zip(self.shared.dev_ctxs.iter()) {
            *slot = ctx.domain;
        }
        self.shared.dev_ctxs.len()
    }

    pub fn crypto_supports_tweak_mode(&self, mode: TweakMode) -> bool {
        if !self.shared.crypto_supported {
            return false;
        }
        match mode {
            TweakMode::SimpleLba => true,
            TweakMode::Incr512UpperLba => self
                .shared
                .dev_ctxs
                .iter()
                .all(|ctx| ctx.caps.is_some_and(|c| c.tweak_inc_64)),
        }
    }

    /// Restrict crypto use to the given comma-separated device names.
    /// Takes effect for subsequent key creation.
    pub fn set_allowed_crypto_devs(&self, devs: Option<&str>) {
        let parsed = devs
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        *self.shared.allowed_crypto_devs.lock() = parsed;
    }

    /// Emit the scan parameters that reproduce this configuration.
    pub fn write_config_json(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let cfg = &self.shared.config;
        let mut params = json!({
            "qp_size": cfg.qp_size,
            "cq_size": cfg.cq_size,
            "num_requests": cfg.num_requests,
            "merge": cfg.merge,
            "split_mb_blocks": cfg.split_mb_blocks,
            "siglast": cfg.siglast,
            "qp_per_domain": cfg.qp_per_domain,
        });
        if let Some(devs) = &cfg.allowed_crypto_devs {
            params["allowed_crypto_devs"] = json!(devs);
        }
        let doc = json!({
            "method": "mlx5_scan_accel_module",
            "params": params,
        });
        serde_json::to_writer(w, &doc).map_err(io::Error::other)
    }

    /// Accumulated stats of destroyed channels.
    pub fn total_stats(&self) -> DeviceStats {
        *self.shared.total_stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedNic;
    use crate::hw::{CryptoCaps, DeviceInfo};

    fn full_caps() -> CryptoCaps {
        CryptoCaps {
            single_block_le_tweak: true,
            multi_block_be_tweak: true,
            multi_block_le_tweak: true,
            tweak_inc_64: true,
            crc32c: true,
        }
    }

    #[test]
    fn opcode_support_follows_device_caps() {
        let backend = Arc::new(EmulatedNic::new(vec![DeviceInfo {
            name: "mlx5_0".into(),
            crypto: Some(CryptoCaps {
                crc32c: false,
                ..full_caps()
            }),
        }]));
        let module = AccelModule::new(
            backend,
            ModuleConfig {
                num_requests: 16,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(module.supports_opcode(OpCode::Copy));
        assert!(module.supports_opcode(OpCode::Encrypt));
        assert!(!module.supports_opcode(OpCode::Crc32c));
        assert!(!module.supports_opcode(OpCode::CheckCrc32c));
    }

    #[test]
    fn merge_disables_standalone_crc() {
        let backend = Arc::new(EmulatedNic::single_full_featured("mlx5_0"));
        let module = AccelModule::new(
            backend,
            ModuleConfig {
                num_requests: 16,
                merge: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(module.supports_opcode(OpCode::Encrypt));
        assert!(!module.supports_opcode(OpCode::Crc32c));
    }

    #[test]
    fn allow_list_excludes_crypto_devs() {
        let backend = Arc::new(EmulatedNic::new(vec![
            DeviceInfo {
                name: "mlx5_0".into(),
                crypto: Some(full_caps()),
            },
            DeviceInfo {
                name: "mlx5_1".into(),
                crypto: Some(full_caps()),
            },
        ]));
        let module = AccelModule::new(
            backend,
            ModuleConfig {
                num_requests: 16,
                allowed_crypto_devs: Some("mlx5_1".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let mut domains = [DomainId(0); 4];
        assert_eq!(module.get_memory_domains(&mut domains), 1);
        assert!(module.supports_opcode(OpCode::Encrypt));
    }

    #[test]
    fn tweak_mode_queries() {
        let backend = Arc::new(EmulatedNic::new(vec![DeviceInfo {
            name: "mlx5_0".into(),
            crypto: Some(CryptoCaps {
                tweak_inc_64: false,
                ..full_caps()
            }),
        }]));
        let module = AccelModule::new(
            backend,
            ModuleConfig {
                num_requests: 16,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(module.crypto_supports_tweak_mode(TweakMode::SimpleLba));
        assert!(!module.crypto_supports_tweak_mode(TweakMode::Incr512UpperLba));
    }

    #[test]
    fn config_json_round_trips() {
        let backend = Arc::new(EmulatedNic::single_full_featured("mlx5_0"));
        let module = AccelModule::new(
            backend,
            ModuleConfig {
                num_requests: 16,
                siglast: true,
                allowed_crypto_devs: Some("mlx5_0".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let mut buf = Vec::new();
        module.write_config_json(&mut buf).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(doc["method"], "mlx5_scan_accel_module");
        assert_eq!(doc["params"]["qp_size"], 256);
        assert_eq!(doc["params"]["siglast"], true);
        assert_eq!(doc["params"]["allowed_crypto_devs"], "mlx5_0");
    }
}

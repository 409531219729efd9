//! Device contexts: the per-NIC objects created once at module init and
//! the per-channel view holding the CQ, the QPs and the task queues.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use log::info;

use crate::config::ModuleConfig;
use crate::constants::MAX_WC;
use crate::domain::{DomainId, MemMap};
use crate::error::{AccelError, Result};
use crate::hw::{CqId, CryptoCaps, NicBackend, QpId, RawCqe};
use crate::mkey::{CryptoMkeyPool, PsvPool, SigMkeyPool};
use crate::module::ModuleShared;
use crate::qp::QueuePair;
use crate::stats::DeviceStats;
use crate::task::{OpCode, QpSel, Task};

/// Per-NIC context, read-only after module init and shared by reference
/// from every channel.
pub(crate) struct DeviceContext {
    pub(crate) name: String,
    /// The device-level RDMA memory domain.
    pub(crate) domain: DomainId,
    pub(crate) map: MemMap,
    mkey_pool: Option<CryptoMkeyPool>,
    sig_mkey_pool: Option<SigMkeyPool>,
    psv_pool: Option<PsvPool>,
    pub(crate) crypto_multi_block: bool,
    pub(crate) caps: Option<CryptoCaps>,
}

impl DeviceContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        domain: DomainId,
        map: MemMap,
        mkey_pool: Option<CryptoMkeyPool>,
        sig_mkey_pool: Option<SigMkeyPool>,
        psv_pool: Option<PsvPool>,
        crypto_multi_block: bool,
        caps: Option<CryptoCaps>,
    ) -> Self {
        Self {
            name,
            domain,
            map,
            mkey_pool,
            sig_mkey_pool,
            psv_pool,
            crypto_multi_block,
            caps,
        }
    }

    pub(crate) fn mkey_pool(&self) -> Result<&CryptoMkeyPool> {
        self.mkey_pool
            .as_ref()
            .ok_or_else(|| AccelError::Unsupported("crypto is disabled on this device".into()))
    }

    pub(crate) fn sig_mkey_pool(&self) -> Result<&SigMkeyPool> {
        self.sig_mkey_pool
            .as_ref()
            .ok_or_else(|| AccelError::Unsupported("crc32c is disabled on this device".into()))
    }

    pub(crate) fn psv_pool(&self) -> Result<&PsvPool> {
        self.psv_pool
            .as_ref()
            .ok_or_else(|| AccelError::Unsupported("crc32c is disabled on this device".into()))
    }
}

/// Per-channel device: one CQ, the default QP, lazily created
/// domain-indexed QPs and the software task queues.
pub(crate) struct Device {
    pub(crate) ctx: Arc<DeviceContext>,
    pub(crate) shared: Arc<ModuleShared>,
    pub(crate) cq: CqId,
    pub(crate) qp: QueuePair,
    pub(crate) domain_qps: BTreeMap<DomainId, QueuePair>,
    /// Tasks awaiting resources.
    pub(crate) nomem: VecDeque<Box<Task>>,
    /// Merged tasks awaiting their callback dispatch.
    pub(crate) merged: VecDeque<Box<Task>>,
    pub(crate) stats: DeviceStats,
    pub(crate) cqe_buf: Vec<RawCqe>,
}

impl Device {
    pub(crate) fn new(ctx: Arc<DeviceContext>, shared: Arc<ModuleShared>) -> Result<Self> {
        let backend = shared.backend.as_ref();
        let cfg: &ModuleConfig = &shared.config;
        let cq = backend.create_cq(&ctx.name, cfg.cq_size)?;
        let qp = match QueuePair::create(backend, &ctx.name, cq, cfg.qp_size, cfg.siglast, None) {
            Ok(qp) => qp,
            Err(e) => {
                backend.destroy_cq(cq);
                return Err(e);
            }
        };
        Ok(Self {
            ctx,
            shared,
            cq,
            qp,
            domain_qps: BTreeMap::new(),
            nomem: VecDeque::new(),
            merged: VecDeque::new(),
            stats: DeviceStats::default(),
            cqe_buf: Vec::with_capacity(MAX_WC),
        })
    }

    pub(crate) fn qp(&self, sel: QpSel) -> Result<&QueuePair> {
        match sel {
            QpSel::Default => Ok(&self.qp),
            QpSel::Domain(id) => self
                .domain_qps
                .get(&id)
                .ok_or_else(|| AccelError::WrPost("domain qp is gone".into())),
        }
    }

    pub(crate) fn qp_mut(&mut self, sel: QpSel) -> Result<&mut QueuePair> {
        match sel {
            QpSel::Default => Ok(&mut self.qp),
            QpSel::Domain(id) => self
                .domain_qps
                .get_mut(&id)
                .ok_or_else(|| AccelError::WrPost("domain qp is gone".into())),
        }
    }

    pub(crate) fn qp_by_id_mut(&mut self, id: QpId) -> Option<(&mut QueuePair, QpSel)> {
        if self.qp.id == id {
            return Some((&mut self.qp, QpSel::Default));
        }
        self.domain_qps
            .iter_mut()
            .find(|(_, qp)| qp.id == id)
            .map(|(domain, qp)| (qp, QpSel::Domain(*domain)))
    }

    fn get_or_create_domain_qp(&mut self, id: DomainId) -> Result<()> {
        if self.domain_qps.contains_key(&id) {
            return Ok(());
        }
        let cfg = &self.shared.config;
        let qp = QueuePair::create(
            self.shared.backend.as_ref(),
            &self.ctx.name,
            self.cq,
            cfg.qp_size,
            cfg.siglast,
            Some(id),
        )?;
        info!(
            "created new qp num {} for domain {:?} on dev {}",
            qp.id.0, id, self.ctx.name
        );
        self.domain_qps.insert(id, qp);
        Ok(())
    }

    /// Route the task to the default QP, or to the QP dedicated to its
    /// driving memory domain when per-domain QPs are enabled.
    pub(crate) fn assign_qp(&mut self, task: &Task) -> Result<QpSel> {
        if !self.shared.config.qp_per_domain {
            return Ok(QpSel::Default);
        }
        let domain = match task.op {
            OpCode::Encrypt => task.src_domain.as_ref(),
            OpCode::Decrypt | OpCode::CheckCrc32c => task.dst_domain.as_ref(),
            OpCode::Copy | OpCode::CopyCrc32c => task.dst_domain.as_ref(),
            OpCode::Crc32c => task.src_domain.as_ref(),
        };
        match domain {
            None => Ok(QpSel::Default),
            Some(domain) => {
                let id = domain.id();
                self.get_or_create_domain_qp(id)?;
                Ok(QpSel::Domain(id))
            }
        }
    }

    pub(crate) fn poll_cq(&mut self) -> usize {
        self.stats.polls += 1;
        self.cqe_buf.clear();
        let reaped =
            self.shared
                .backend
                .poll_cq(self.cq, &mut self.cqe_buf, MAX_WC);
        if reaped == 0 {
            self.stats.idle_polls += 1;
        } else {
            self.stats.completions += reaped as u64;
        }
        reaped
    }

    /// Batch boundary: push pending doorbells of every QP.
    pub(crate) fn flush_dbs(&mut self) {
        let backend = self.shared.backend.as_ref();
        self.qp.flush_db(backend);
        for qp in self.domain_qps.values_mut() {
            qp.flush_db(backend);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let backend = self.shared.backend.clone();
        self.qp.destroy(backend.as_ref());
        for qp in self.domain_qps.values_mut() {
            qp.destroy(backend.as_ref());
        }
        backend.destroy_cq(self.cq);
    }
}

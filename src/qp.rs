//! Queue pair: WR posting surface and per-QP accounting.

use std::collections::VecDeque;
use std::time::Instant;

use crate::constants::{MAX_SGE, SQ_BB_PER_WR};
use crate::domain::DomainId;
use crate::error::Result;
use crate::hw::{CqId, NicBackend, QpId, QpInitAttr, Sge};
use crate::sq::SendQueue;
use crate::task::Task;
use crate::wqe::{CryptoBsfAttr, SigBsfAttr, WqeOpcode};

pub(crate) struct QueuePair {
    pub(crate) id: QpId,
    sq: SendQueue,
    /// Memory domain this QP serves, `None` for the device default QP.
    pub(crate) domain: Option<DomainId>,
    /// Outstanding WRs counted against `max_wrs`.
    pub(crate) wrs_submitted: u16,
    pub(crate) max_wrs: u16,
    pub(crate) recovering: bool,
    /// Deadline for retrying a failed rebuild.
    pub(crate) recover_retry_at: Option<Instant>,
    /// Tasks with at least one signaled WR on the wire, submission order.
    pub(crate) in_hw: VecDeque<Box<Task>>,
}

impl QueuePair {
    pub(crate) fn create(
        backend: &dyn NicBackend,
        dev: &str,
        cq: CqId,
        qp_size: u16,
        siglast: bool,
        domain: Option<DomainId>,
    ) -> Result<Self> {
        let wqe_cnt = (qp_size.max(1)).next_power_of_two().saturating_mul(SQ_BB_PER_WR);
        let mut sq = SendQueue::new(wqe_cnt, MAX_SGE, true, siglast);
        let attr = QpInitAttr {
            wqe_cnt,
            max_sge: MAX_SGE as u16,
            siglast,
        };
        let id = backend.create_qp(dev, cq, &attr, sq.mem())?;
        sq.set_qp_num(id.0);
        Ok(Self {
            id,
            sq,
            domain,
            wrs_submitted: 0,
            max_wrs: qp_size,
            recovering: false,
            recover_retry_at: None,
            in_hw: VecDeque::new(),
        })
    }

    /// Free WR slots.
    pub(crate) fn qp_slot(&self) -> u16 {
        self.max_wrs - self.wrs_submitted
    }

    pub(crate) fn rdma_read(
        &mut self,
        sges: &[Sge],
        raddr: u64,
        rkey: u32,
        wr_id: u64,
        flags: u8,
    ) -> Result<()> {
        self.sq
            .post_rdma(WqeOpcode::RdmaRead, sges, raddr, rkey, wr_id, flags)
    }

    pub(crate) fn rdma_write(
        &mut self,
        sges: &[Sge],
        raddr: u64,
        rkey: u32,
        wr_id: u64,
        flags: u8,
    ) -> Result<()> {
        self.sq
            .post_rdma(WqeOpcode::RdmaWrite, sges, raddr, rkey, wr_id, flags)
    }

    pub(crate) fn umr_configure_crypto(
        &mut self,
        mkey_id: u32,
        sges: &[Sge],
        umr_len: u64,
        cattr: &CryptoBsfAttr,
    ) -> Result<()> {
        self.sq.post_umr(mkey_id, sges, umr_len, Some(cattr), None)
    }

    pub(crate) fn umr_configure_sig(
        &mut self,
        mkey_id: u32,
        sges: &[Sge],
        umr_len: u64,
        sattr: &SigBsfAttr,
    ) -> Result<()> {
        self.sq.post_umr(mkey_id, sges, umr_len, None, Some(sattr))
    }

    pub(crate) fn umr_configure_sig_crypto(
        &mut self,
        mkey_id: u32,
        sges: &[Sge],
        umr_len: u64,
        sattr: &SigBsfAttr,
        cattr: &CryptoBsfAttr,
    ) -> Result<()> {
        self.sq
            .post_umr(mkey_id, sges, umr_len, Some(cattr), Some(sattr))
    }

    pub(crate) fn set_psv(&mut self, psv_index: u32, transient_seed: u32) -> Result<()> {
        self.sq.post_set_psv(psv_index, transient_seed)
    }

    pub(crate) fn on_cqe(&mut self, wqe_counter: u16) -> u64 {
        self.sq.on_cqe(wqe_counter)
    }

    pub(crate) fn flush_db(&mut self, backend: &dyn NicBackend) {
        self.sq.ring_db_if_needed(backend, self.id);
    }

    pub(crate) fn destroy(&mut self, backend: &dyn NicBackend) {
        backend.destroy_qp(self.id);
    }
}

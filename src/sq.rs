//! Send queue: WQE layout into a ring of 64-byte building blocks.
//!
//! The ring is shared with the device: the engine produces WQEs and
//! publishes the producer index through the doorbell record, the device
//! consumes them after a doorbell ring. A WQE whose tail would run past
//! the ring end wraps segment-wise back to the ring base; only the
//! control segment is guaranteed to sit at a building block boundary.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use crate::constants::WQE_BB_SIZE;
use crate::error::{AccelError, Result};
use crate::hw::{NicBackend, QpId, Sge};
use crate::wqe::{
    CryptoBsfAttr, CryptoBsfSeg, CtrlSeg, DataSeg, MkeyCtxSeg, RaddrSeg, SetPsvSeg, SigBsfAttr,
    SigBsfSeg, UmrCtrlSeg, WqeOpcode, UMR_FLAG_CRYPTO_BSF, UMR_FLAG_SIG_BSF,
};

struct SqMemInner {
    buf: UnsafeCell<Box<[u8]>>,
    /// Doorbell record: the last published producer index.
    dbr: AtomicU32,
}

// The producer publishes every WQE store before the doorbell record
// (release fence in `ring_db_if_needed`); the device only reads below
// the published index.
#[allow(unsafe_code)]
unsafe impl Send for SqMemInner {}
#[allow(unsafe_code)]
unsafe impl Sync for SqMemInner {}

/// Send queue memory shared between the engine and the device.
#[derive(Clone)]
pub struct SqMem {
    inner: Arc<SqMemInner>,
}

#[allow(unsafe_code)]
impl SqMem {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            inner: Arc::new(SqMemInner {
                buf: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
                dbr: AtomicU32::new(0),
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        unsafe { (&*self.inner.buf.get()).len() }
    }

    fn write(&self, offset: usize, bytes: &[u8]) {
        unsafe {
            let buf = &mut *self.inner.buf.get();
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    pub(crate) fn read(&self, offset: usize, out: &mut [u8]) {
        unsafe {
            let buf = &*self.inner.buf.get();
            out.copy_from_slice(&buf[offset..offset + out.len()]);
        }
    }

    fn write_dbr(&self, pi: u16) {
        self.inner.dbr.store(u32::from(pi), Ordering::Release);
    }

    pub(crate) fn dbr(&self) -> u16 {
        self.inner.dbr.load(Ordering::Acquire) as u16
    }
}

/// Parallel completion descriptor for each building block position.
#[derive(Debug, Default, Clone, Copy)]
struct CompSlot {
    wr_id: u64,
    /// Building blocks returned to `tx_available` when this slot's CQE
    /// arrives: accumulated unsignaled blocks plus this WQE's own.
    completions: u16,
}

pub(crate) struct SendQueue {
    mem: SqMem,
    /// Ring length in building blocks, power of two.
    wqe_cnt: u16,
    /// Wrapping producer counter.
    pi: u16,
    /// Free building blocks.
    tx_available: u16,
    nonsignaled_outstanding: u16,
    comps: Box<[CompSlot]>,
    need_ring_db: bool,
    /// The UAR is mapped write-combined and needs a trailing store fence.
    db_write_combined: bool,
    /// Collapse a batch into a single CQE: all signaled WQEs but the
    /// last are rewritten unsignaled when the doorbell rings.
    siglast: bool,
    /// Producer indices of signaled WQEs in the current batch.
    pending_signaled: Vec<u16>,
    max_sge: usize,
    qp_num: u32,
}

impl SendQueue {
    pub(crate) fn new(
        wqe_cnt: u16,
        max_sge: usize,
        db_write_combined: bool,
        siglast: bool,
    ) -> Self {
        assert!(wqe_cnt.is_power_of_two(), "sq length must be a power of two");
        Self {
            mem: SqMem::new(usize::from(wqe_cnt) * WQE_BB_SIZE),
            wqe_cnt,
            pi: 0,
            tx_available: wqe_cnt,
            nonsignaled_outstanding: 0,
            comps: vec![CompSlot::default(); usize::from(wqe_cnt)].into_boxed_slice(),
            need_ring_db: false,
            db_write_combined,
            siglast,
            pending_signaled: Vec::new(),
            max_sge,
            qp_num: 0,
        }
    }

    pub(crate) fn set_qp_num(&mut self, qp_num: u32) {
        self.qp_num = qp_num;
    }

    pub(crate) fn mem(&self) -> SqMem {
        self.mem.clone()
    }

    pub(crate) fn tx_available(&self) -> u16 {
        self.tx_available
    }

    fn mask(&self) -> u16 {
        self.wqe_cnt - 1
    }

    /// Building blocks an RDMA WQE occupies: one block holds the control
    /// and remote address segments plus two data segments, each further
    /// block holds four more.
    fn rdma_bb_count(sge_count: usize) -> u16 {
        if sge_count <= 2 {
            1
        } else {
            1 + (sge_count as u16 - 2).div_ceil(4)
        }
    }

    fn check_room(&self, bb_count: u16, sge_count: usize) -> Result<()> {
        if sge_count > self.max_sge {
            return Err(AccelError::TooManySge(sge_count));
        }
        if bb_count > self.tx_available {
            return Err(AccelError::ResourceExhausted("send queue full"));
        }
        Ok(())
    }

    pub(crate) fn post_rdma(
        &mut self,
        opcode: WqeOpcode,
        sges: &[Sge],
        raddr: u64,
        rkey: u32,
        wr_id: u64,
        flags: u8,
    ) -> Result<()> {
        debug_assert!(matches!(opcode, WqeOpcode::RdmaRead | WqeOpcode::RdmaWrite));
        let bb_count = Self::rdma_bb_count(sges.len());
        self.check_room(bb_count, sges.len())?;

        let ds = 2 + sges.len() as u8;
        let mut w = SqWriter::new(&self.mem, self.pi, self.wqe_cnt);
        w.put(&CtrlSeg::new(opcode, ds, self.pi, self.qp_num, flags, 0).to_bytes());
        w.put(&RaddrSeg::new(raddr, rkey).to_bytes());
        for sge in sges {
            w.put(&DataSeg::new(sge).to_bytes());
        }

        self.finish(wr_id, flags, bb_count);
        Ok(())
    }

    pub(crate) fn post_umr(
        &mut self,
        mkey_id: u32,
        sges: &[Sge],
        umr_len: u64,
        crypto: Option<&CryptoBsfAttr>,
        sig: Option<&SigBsfAttr>,
    ) -> Result<()> {
        let klm_pad = sges.len().div_ceil(4).max(1) * 4;
        let mut wqe_bytes = 16 + UmrCtrlSeg::SIZE + MkeyCtxSeg::SIZE + klm_pad * 16;
        let mut umr_flags = 0u8;
        if crypto.is_some() {
            umr_flags |= UMR_FLAG_CRYPTO_BSF;
            wqe_bytes += CryptoBsfSeg::SIZE;
        }
        if sig.is_some() {
            umr_flags |= UMR_FLAG_SIG_BSF;
            wqe_bytes += SigBsfSeg::SIZE;
        }
        let bb_count = (wqe_bytes.div_ceil(WQE_BB_SIZE)) as u16;
        self.check_room(bb_count, sges.len())?;

        let ds = (wqe_bytes / 16) as u8;
        let mut w = SqWriter::new(&self.mem, self.pi, self.wqe_cnt);
        w.put(&CtrlSeg::new(WqeOpcode::Umr, ds, self.pi, self.qp_num, 0, 0).to_bytes());
        w.put(&UmrCtrlSeg::new(mkey_id, sges.len() as u16, umr_flags).to_bytes());
        w.put(&MkeyCtxSeg::new(umr_len).to_bytes());
        for sge in sges {
            w.put(&DataSeg::new(sge).to_bytes());
        }
        for _ in sges.len()..klm_pad {
            w.put(&[0u8; 16]);
        }
        if let Some(cattr) = crypto {
            w.put(&CryptoBsfSeg::new(cattr, umr_len as u32).to_bytes());
        }
        if let Some(sattr) = sig {
            w.put(&SigBsfSeg::new(sattr).to_bytes());
        }

        self.finish(0, 0, bb_count);
        Ok(())
    }

    pub(crate) fn post_set_psv(&mut self, psv_index: u32, transient_seed: u32) -> Result<()> {
        self.check_room(1, 0)?;
        let mut w = SqWriter::new(&self.mem, self.pi, self.wqe_cnt);
        w.put(&CtrlSeg::new(WqeOpcode::SetPsv, 2, self.pi, self.qp_num, 0, 0).to_bytes());
        w.put(&SetPsvSeg::new(psv_index, transient_seed).to_bytes());
        self.finish(0, 0, 1);
        Ok(())
    }

    fn finish(&mut self, wr_id: u64, flags: u8, bb_count: u16) {
        let start_pi = self.pi;
        let slot = &mut self.comps[usize::from(start_pi & (self.wqe_cnt - 1))];
        slot.wr_id = wr_id;
        if flags & crate::wqe::WQE_CTRL_CQ_UPDATE == 0 {
            self.nonsignaled_outstanding += bb_count;
            slot.completions = 0;
        } else {
            slot.completions = self.nonsignaled_outstanding + bb_count;
            self.nonsignaled_outstanding = 0;
            if self.siglast {
                self.pending_signaled.push(start_pi);
            }
        }
        self.pi = self.pi.wrapping_add(bb_count);
        debug_assert!(self.tx_available >= bb_count);
        self.tx_available -= bb_count;
        self.need_ring_db = true;
    }

    /// Signal-last batching: rewrite every signaled WQE of the batch but
    /// the final one to be unsignaled, moving their reclaim counts onto
    /// the final slot. The WR ids stay so an errored WQE still resolves
    /// to its task.
    fn collapse_batch_signals(&mut self) {
        if self.pending_signaled.len() < 2 {
            self.pending_signaled.clear();
            return;
        }
        let last = *self.pending_signaled.last().unwrap();
        let mask = self.wqe_cnt - 1;
        let mut extra = 0;
        for &pi in &self.pending_signaled[..self.pending_signaled.len() - 1] {
            let slot = &mut self.comps[usize::from(pi & mask)];
            extra += slot.completions;
            slot.completions = 0;
            let flags_off = usize::from(pi & mask) * WQE_BB_SIZE + 8;
            let mut byte = [0u8; 1];
            self.mem.read(flags_off, &mut byte);
            byte[0] &= !crate::wqe::WQE_CTRL_CQ_UPDATE;
            self.mem.write(flags_off, &byte);
        }
        self.comps[usize::from(last & mask)].completions += extra;
        self.pending_signaled.clear();
    }

    /// Resolve a CQE to the WR id stored at post time and reclaim the
    /// building blocks accumulated on this slot.
    pub(crate) fn on_cqe(&mut self, wqe_counter: u16) -> u64 {
        let slot = &self.comps[usize::from(wqe_counter & self.mask())];
        self.tx_available += slot.completions;
        slot.wr_id
    }

    /// Deferred doorbell: store fence, publish the producer index in the
    /// doorbell record, fence again, then the UAR write. Write-combined
    /// UAR mappings need one more trailing fence to force the flush.
    pub(crate) fn ring_db_if_needed(&mut self, backend: &dyn NicBackend, qp: QpId) {
        if !self.need_ring_db {
            return;
        }
        self.need_ring_db = false;
        if self.siglast {
            self.collapse_batch_signals();
        }
        fence(Ordering::Release);
        self.mem.write_dbr(self.pi);
        fence(Ordering::SeqCst);
        backend.ring_doorbell(qp);
        if self.db_write_combined {
            fence(Ordering::SeqCst);
        }
    }
}

/// Cursor writing 16-byte segments into the ring with wrap-around.
struct SqWriter<'a> {
    mem: &'a SqMem,
    pos: usize,
    to_end: usize,
}

impl<'a> SqWriter<'a> {
    fn new(mem: &'a SqMem, pi: u16, wqe_cnt: u16) -> Self {
        let pos = usize::from(pi & (wqe_cnt - 1)) * WQE_BB_SIZE;
        Self {
            mem,
            pos,
            to_end: mem.len() - pos,
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len() % 16, 0);
        for seg in bytes.chunks_exact(16) {
            self.mem.write(self.pos, seg);
            self.pos += 16;
            self.to_end -= 16;
            if self.to_end == 0 {
                self.pos = 0;
                self.to_end = self.mem.len();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wqe::WQE_CTRL_CQ_UPDATE;

    fn sge(addr: u64, len: u32) -> Sge {
        Sge { lkey: 1, addr, len }
    }

    #[test]
    fn rdma_bb_counts() {
        assert_eq!(SendQueue::rdma_bb_count(1), 1);
        assert_eq!(SendQueue::rdma_bb_count(2), 1);
        assert_eq!(SendQueue::rdma_bb_count(3), 2);
        assert_eq!(SendQueue::rdma_bb_count(6), 2);
        assert_eq!(SendQueue::rdma_bb_count(7), 3);
        assert_eq!(SendQueue::rdma_bb_count(16), 5);
    }

    #[test]
    fn rejects_oversized_sge_list() {
        let mut sq = SendQueue::new(16, 16, true, false);
        let sges: Vec<_> = (0..17).map(|i| sge(i * 64, 64)).collect();
        assert!(matches!(
            sq.post_rdma(WqeOpcode::RdmaWrite, &sges, 0, 1, 1, 0),
            Err(AccelError::TooManySge(17))
        ));
    }

    #[test]
    fn exhausts_ring_capacity() {
        let mut sq = SendQueue::new(4, 16, true, false);
        for _ in 0..4 {
            sq.post_rdma(WqeOpcode::RdmaWrite, &[sge(0, 8)], 0, 1, 0, 0)
                .unwrap();
        }
        assert!(matches!(
            sq.post_rdma(WqeOpcode::RdmaWrite, &[sge(0, 8)], 0, 1, 0, 0),
            Err(AccelError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn signaled_cqe_reclaims_accumulated_blocks() {
        let mut sq = SendQueue::new(16, 16, true, false);
        sq.post_rdma(WqeOpcode::RdmaWrite, &[sge(0, 8)], 0, 1, 0, 0)
            .unwrap();
        sq.post_rdma(WqeOpcode::RdmaWrite, &[sge(8, 8)], 0, 1, 0, 0)
            .unwrap();
        sq.post_rdma(WqeOpcode::RdmaWrite, &[sge(16, 8)], 0, 1, 0x99, WQE_CTRL_CQ_UPDATE)
            .unwrap();
        assert_eq!(sq.tx_available(), 13);
        // The signaled WQE sits at pi 2 and reclaims all three blocks.
        assert_eq!(sq.on_cqe(2), 0x99);
        assert_eq!(sq.tx_available(), 16);
    }

    #[test]
    fn wqe_wraps_segment_wise_to_ring_base() {
        let mut sq = SendQueue::new(8, 16, true, false);
        // Advance the producer to block 6 of 8 and reclaim the blocks.
        for i in 0..6 {
            sq.post_rdma(WqeOpcode::RdmaWrite, &[sge(0, 8)], 0, 1, 1, WQE_CTRL_CQ_UPDATE)
                .unwrap();
            sq.on_cqe(i);
        }
        assert_eq!(sq.tx_available(), 8);
        let sges: Vec<_> = (0..10).map(|i| sge(0x4000 + i * 64, 64)).collect();
        sq.post_rdma(WqeOpcode::RdmaRead, &sges, 0x9000, 7, 1, WQE_CTRL_CQ_UPDATE)
            .unwrap();

        // Blocks 6 and 7 hold ctrl + raddr + six data segments; the last
        // four data segments land at the ring base.
        let mem = sq.mem();
        let mut buf = [0u8; 16];
        mem.read(6 * WQE_BB_SIZE, &mut buf);
        let ctrl = CtrlSeg::from_bytes(buf);
        assert_eq!(ctrl.opcode(), Some(WqeOpcode::RdmaRead));
        assert_eq!(ctrl.ds(), 12);
        for i in 0..4 {
            mem.read(i * 16, &mut buf);
            assert_eq!(DataSeg::from_bytes(buf).sge(), sges[6 + i]);
        }
    }

    #[test]
    fn siglast_collapses_batch_to_one_signal() {
        use crate::emulated::EmulatedNic;
        use crate::hw::{NicBackend, QpId};

        let mut sq = SendQueue::new(16, 16, true, true);
        for i in 0..3u64 {
            sq.post_rdma(
                WqeOpcode::RdmaWrite,
                &[sge(i * 8, 8)],
                0,
                1,
                (i << 1) | 1,
                WQE_CTRL_CQ_UPDATE,
            )
            .unwrap();
        }
        // The ring target does not matter; the batch collapse happens
        // before the UAR write.
        let nic = EmulatedNic::new(vec![]);
        sq.ring_db_if_needed(&nic as &dyn NicBackend, QpId(99));

        let mem = sq.mem();
        let mut buf = [0u8; 16];
        for pi in [0u16, 1] {
            mem.read(usize::from(pi) * WQE_BB_SIZE, &mut buf);
            assert_eq!(CtrlSeg::from_bytes(buf).flags() & WQE_CTRL_CQ_UPDATE, 0);
            assert_eq!(sq.comps[usize::from(pi)].completions, 0);
        }
        mem.read(2 * WQE_BB_SIZE, &mut buf);
        assert_ne!(CtrlSeg::from_bytes(buf).flags() & WQE_CTRL_CQ_UPDATE, 0);
        // The final slot reclaims the whole batch, ids survive the strip.
        assert_eq!(sq.on_cqe(2), (2 << 1) | 1);
        assert_eq!(sq.tx_available(), 16);
        assert_eq!(sq.comps[0].wr_id, 1);
    }
}

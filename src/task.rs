//! Task state machine: opcode dispatch, resource sizing, fusion,
//! continuation and completion.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use crate::constants::{MAX_MKEYS_IN_TASK, MAX_SGE};
use crate::device::Device;
use crate::domain::{DomainId, MemoryDomain};
use crate::error::{AccelError, Result};
use crate::hw::DekId;
use crate::iov::{compare_iovs, copy_task_count, crc_task_count, total_len, IoVec, IovCursor};
use crate::mkey::take_sigerr;
use crate::process;
use crate::wqe::{bs_to_bs_selector, EncOrder};

/// Accelerator opcodes accepted at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Copy,
    Encrypt,
    Decrypt,
    Crc32c,
    CheckCrc32c,
    CopyCrc32c,
}

/// Engine opcode a task executes as, after fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum EngineOpcode {
    Copy = 0,
    Crypto = 1,
    Crc32c = 2,
    EncryptAndCrc32c = 3,
    Crc32cAndDecrypt = 4,
}

/// Which QP of the assigned device carries the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QpSel {
    Default,
    Domain(DomainId),
}

/// Per-key NIC DEK handles, one per crypto-capable device.
pub struct CryptoKey {
    pub(crate) deks: BTreeMap<String, DekId>,
}

impl CryptoKey {
    pub(crate) fn dek_for(&self, dev: &str) -> Result<DekId> {
        self.deks
            .get(dev)
            .copied()
            .ok_or_else(|| AccelError::InvalidInput(format!("no DEK for device {dev}")))
    }
}

pub type TaskCallback = Box<dyn FnOnce(Result<()>)>;

/// A single accelerator operation handed to [`crate::Channel::submit`].
pub struct TaskRequest {
    pub op: OpCode,
    pub src: Vec<IoVec>,
    pub dst: Vec<IoVec>,
    pub src_domain: Option<Arc<dyn MemoryDomain>>,
    pub dst_domain: Option<Arc<dyn MemoryDomain>>,
    /// Cipher block size (crypto opcodes).
    pub block_size: u32,
    /// XTS initial tweak; advances by one per data block.
    pub iv: u64,
    pub crypto_key: Option<Arc<CryptoKey>>,
    /// CRC seed (signature opcodes).
    pub seed: u32,
    /// Expected value for CRC checks.
    pub crc_expected: Option<u32>,
    /// Address of the `u32` receiving a generated CRC. Must stay valid
    /// until the completion callback fires.
    pub crc_dst: Option<u64>,
    /// Translation cache slot shared with the submitter; invalidated
    /// during QP recovery.
    pub cached_lkey: Option<Arc<AtomicU32>>,
    pub cb: Option<TaskCallback>,
}

impl TaskRequest {
    fn base(op: OpCode) -> Self {
        Self {
            op,
            src: Vec::new(),
            dst: Vec::new(),
            src_domain: None,
            dst_domain: None,
            block_size: 0,
            iv: 0,
            crypto_key: None,
            seed: 0,
            crc_expected: None,
            crc_dst: None,
            cached_lkey: None,
            cb: None,
        }
    }

    pub fn copy(src: Vec<IoVec>, dst: Vec<IoVec>) -> Self {
        Self {
            src,
            dst,
            ..Self::base(OpCode::Copy)
        }
    }

    pub fn encrypt(
        src: Vec<IoVec>,
        dst: Vec<IoVec>,
        key: Arc<CryptoKey>,
        block_size: u32,
        iv: u64,
    ) -> Self {
        Self {
            src,
            dst,
            crypto_key: Some(key),
            block_size,
            iv,
            ..Self::base(OpCode::Encrypt)
        }
    }

    pub fn decrypt(
        src: Vec<IoVec>,
        dst: Vec<IoVec>,
        key: Arc<CryptoKey>,
        block_size: u32,
        iv: u64,
    ) -> Self {
        Self {
            src,
            dst,
            crypto_key: Some(key),
            block_size,
            iv,
            ..Self::base(OpCode::Decrypt)
        }
    }

    pub fn crc32c(src: Vec<IoVec>, crc_dst: u64, seed: u32) -> Self {
        Self {
            src,
            crc_dst: Some(crc_dst),
            seed,
            ..Self::base(OpCode::Crc32c)
        }
    }

    pub fn check_crc32c(src: Vec<IoVec>, expected: u32, seed: u32) -> Self {
        Self {
            src,
            crc_expected: Some(expected),
            seed,
            ..Self::base(OpCode::CheckCrc32c)
        }
    }

    pub fn copy_crc32c(src: Vec<IoVec>, dst: Vec<IoVec>, crc_dst: u64, seed: u32) -> Self {
        Self {
            src,
            dst,
            crc_dst: Some(crc_dst),
            seed,
            ..Self::base(OpCode::CopyCrc32c)
        }
    }

    pub fn with_callback(mut self, cb: TaskCallback) -> Self {
        self.cb = Some(cb);
        self
    }

    pub fn with_src_domain(mut self, domain: Arc<dyn MemoryDomain>) -> Self {
        self.src_domain = Some(domain);
        self
    }

    pub fn with_dst_domain(mut self, domain: Arc<dyn MemoryDomain>) -> Self {
        self.dst_domain = Some(domain);
        self
    }

    pub fn with_cached_lkey(mut self, slot: Arc<AtomicU32>) -> Self {
        self.cached_lkey = Some(slot);
        self
    }
}

pub(crate) struct Task {
    pub(crate) op: OpCode,
    pub(crate) engine_op: EngineOpcode,
    pub(crate) src_iovs: Box<[IoVec]>,
    pub(crate) dst_iovs: Box<[IoVec]>,
    pub(crate) src: IovCursor,
    pub(crate) dst: IovCursor,
    pub(crate) src_domain: Option<Arc<dyn MemoryDomain>>,
    pub(crate) dst_domain: Option<Arc<dyn MemoryDomain>>,
    pub(crate) block_size: u32,
    pub(crate) iv: u64,
    pub(crate) key: Option<Arc<CryptoKey>>,
    pub(crate) seed: u32,
    pub(crate) crc_expected: Option<u32>,
    pub(crate) crc_dst: Option<u64>,
    pub(crate) cached_lkey: Option<Arc<AtomicU32>>,
    pub(crate) cb: Option<TaskCallback>,
    pub(crate) enc_order: EncOrder,
    pub(crate) inplace: bool,
    /// Executed as part of the preceding task; never touches the NIC.
    pub(crate) merged: bool,
    pub(crate) qp_sel: QpSel,
    pub(crate) num_reqs: u16,
    pub(crate) num_submitted_reqs: u16,
    pub(crate) num_completed_reqs: u16,
    /// MKeys reserved for the current batch.
    pub(crate) num_ops: u16,
    /// WRs charged to the QP for the current batch.
    pub(crate) num_wrs: u16,
    pub(crate) blocks_per_req: u16,
    pub(crate) num_blocks: u16,
    pub(crate) nbytes: u32,
    pub(crate) last_umr_len: u64,
    pub(crate) last_mkey_idx: u16,
    pub(crate) mkeys: Vec<u16>,
    pub(crate) psv: Option<u16>,
    /// Stable end-of-task WR id; bit 0 marks a signaled write.
    pub(crate) token: u64,
    /// Fusion sibling completed in lockstep with this task.
    pub(crate) sibling: Option<Box<Task>>,
}

impl Task {
    pub(crate) fn from_request(req: TaskRequest, seq: u64) -> Box<Self> {
        let (engine_op, enc_order, inplace) = match req.op {
            OpCode::Copy => (EngineOpcode::Copy, EncOrder::EncryptedRawWire, false),
            OpCode::Encrypt => (EngineOpcode::Crypto, EncOrder::EncryptedRawWire, false),
            OpCode::Decrypt => (EngineOpcode::Crypto, EncOrder::EncryptedRawMemory, false),
            OpCode::Crc32c | OpCode::CheckCrc32c => {
                (EngineOpcode::Crc32c, EncOrder::EncryptedRawWire, true)
            }
            OpCode::CopyCrc32c => (EngineOpcode::Crc32c, EncOrder::EncryptedRawWire, false),
        };
        Box::new(Self {
            op: req.op,
            engine_op,
            src_iovs: req.src.into_boxed_slice(),
            dst_iovs: req.dst.into_boxed_slice(),
            src: IovCursor::default(),
            dst: IovCursor::default(),
            src_domain: req.src_domain,
            dst_domain: req.dst_domain,
            block_size: req.block_size,
            iv: req.iv,
            key: req.crypto_key,
            seed: req.seed,
            crc_expected: req.crc_expected,
            crc_dst: req.crc_dst,
            cached_lkey: req.cached_lkey,
            cb: req.cb,
            enc_order,
            inplace,
            merged: false,
            qp_sel: QpSel::Default,
            num_reqs: 0,
            num_submitted_reqs: 0,
            num_completed_reqs: 0,
            num_ops: 0,
            num_wrs: 0,
            blocks_per_req: 0,
            num_blocks: 0,
            nbytes: 0,
            last_umr_len: 0,
            last_mkey_idx: 0,
            mkeys: Vec::new(),
            psv: None,
            token: (seq << 1) | 1,
            sibling: None,
        })
    }

    /// True when `next` can be executed as a side effect of `self`.
    pub(crate) fn fusable(&self, next: &Task) -> bool {
        match (self.op, next.op) {
            (OpCode::Encrypt, OpCode::Crc32c) => {
                let crypto_dst: &[IoVec] = if self.dst_iovs.is_empty()
                    || compare_iovs(&self.dst_iovs, &self.src_iovs)
                {
                    &self.src_iovs
                } else {
                    &self.dst_iovs
                };
                compare_iovs(crypto_dst, &next.src_iovs)
            }
            (OpCode::CheckCrc32c, OpCode::Decrypt) => compare_iovs(&next.src_iovs, &self.src_iovs),
            _ => false,
        }
    }

    /// Upgrade `self` to the fused opcode, taking ownership of `next` as
    /// the merged sibling.
    pub(crate) fn fuse(&mut self, mut next: Box<Task>) {
        debug_assert!(self.fusable(&next));
        next.merged = true;
        match self.op {
            OpCode::Encrypt => {
                self.engine_op = EngineOpcode::EncryptAndCrc32c;
                self.inplace =
                    self.dst_iovs.is_empty() || compare_iovs(&self.dst_iovs, &self.src_iovs);
                // The signature side of the fused task comes from the
                // CRC sibling.
                self.seed = next.seed;
            }
            OpCode::CheckCrc32c => {
                self.engine_op = EngineOpcode::Crc32cAndDecrypt;
                self.enc_order = EncOrder::EncryptedRawMemory;
                self.inplace =
                    next.dst_iovs.is_empty() || compare_iovs(&next.dst_iovs, &next.src_iovs);
                // The data path of the fused task is the decrypt's.
                self.src_iovs = next.src_iovs.clone();
                self.dst_iovs = next.dst_iovs.clone();
                self.block_size = next.block_size;
                self.iv = next.iv;
                self.key = next.key.clone();
                self.src_domain = next.src_domain.clone();
                self.dst_domain = next.dst_domain.clone();
                self.cached_lkey = next.cached_lkey.clone();
            }
            _ => unreachable!("fusable() gated"),
        }
        self.sibling = Some(next);
    }

    pub(crate) fn remaining_reqs(&self) -> u16 {
        self.num_reqs - self.num_completed_reqs
    }
}

type TaskFn = fn(&mut Task, &mut Device) -> Result<()>;
/// Terminal handler; may hand back a sibling to resubmit standalone.
type CompleteFn = fn(&mut Task, &mut Device, Result<()>) -> Option<Box<Task>>;

/// Per-opcode dispatch, indexed by [`EngineOpcode`].
pub(crate) struct TaskOps {
    pub(crate) init: TaskFn,
    pub(crate) process: TaskFn,
    pub(crate) cont: TaskFn,
    pub(crate) complete: CompleteFn,
}

static TASK_OPS: [TaskOps; 5] = [
    TaskOps {
        init: copy_init,
        process: process::copy_task_process,
        cont: task_continue,
        complete: copy_complete,
    },
    TaskOps {
        init: crypto_init,
        process: process::crypto_task_process,
        cont: task_continue,
        complete: crypto_complete,
    },
    TaskOps {
        init: crc_init,
        process: process::crc_task_process,
        cont: task_continue,
        complete: crc_complete,
    },
    TaskOps {
        init: fused_init,
        process: process::crypto_and_crc_task_process,
        cont: task_continue,
        complete: fused_complete,
    },
    TaskOps {
        init: fused_init,
        process: process::crypto_and_crc_task_process,
        cont: task_continue,
        complete: fused_complete,
    },
];

pub(crate) fn ops(op: EngineOpcode) -> &'static TaskOps {
    &TASK_OPS[op as usize]
}

fn copy_init(task: &mut Task, dev: &mut Device) -> Result<()> {
    if total_len(&task.src_iovs) == 0 || total_len(&task.src_iovs) != total_len(&task.dst_iovs) {
        return Err(AccelError::InvalidInput(
            "copy source and destination sizes differ".into(),
        ));
    }
    task.inplace = false;
    task.num_reqs = copy_task_count(&task.src_iovs, &task.dst_iovs);
    let qp_slot = dev.qp(task.qp_sel)?.qp_slot();
    task.num_ops = qp_slot.min(task.num_reqs);
    if task.num_ops == 0 {
        return Err(AccelError::ResourceExhausted("qp slots"));
    }
    debug!(
        "copy task num_reqs {}, num_ops {}",
        task.num_reqs, task.num_ops
    );
    Ok(())
}

fn crypto_sizing(task: &mut Task, dev: &Device) -> Result<()> {
    let src_nbytes = total_len(&task.src_iovs);
    let bs = task.block_size as usize;
    if bs == 0 || src_nbytes == 0 || src_nbytes % bs != 0 {
        return Err(AccelError::InvalidInput(format!(
            "payload of {src_nbytes} bytes is not a multiple of block size {bs}"
        )));
    }
    if bs_to_bs_selector(task.block_size) == 0 {
        return Err(AccelError::InvalidInput(format!(
            "unsupported block size {bs}"
        )));
    }
    let num_blocks = src_nbytes / bs;
    if num_blocks > usize::from(u16::MAX) {
        return Err(AccelError::InvalidInput("too many data blocks".into()));
    }
    task.num_blocks = num_blocks as u16;

    let split = dev.shared.config.split_mb_blocks as usize;
    if dev.ctx.crypto_multi_block {
        if split > 0 {
            task.num_reqs = num_blocks.div_ceil(split) as u16;
            // The last request may consume fewer blocks.
            task.blocks_per_req = num_blocks.min(split) as u16;
        } else {
            task.num_reqs = 1;
            task.blocks_per_req = task.num_blocks;
        }
    } else {
        task.num_reqs = task.num_blocks;
        task.blocks_per_req = 1;
    }
    Ok(())
}

fn crypto_init(task: &mut Task, dev: &mut Device) -> Result<()> {
    crypto_sizing(task, dev)?;
    if task.dst_iovs.is_empty() || compare_iovs(&task.dst_iovs, &task.src_iovs) {
        task.inplace = true;
    } else {
        task.inplace = false;
    }
    alloc_mkeys(task, dev, false)?;
    debug!(
        "crypto task num_reqs {}, num_ops {}, num_blocks {}",
        task.num_reqs, task.num_ops, task.num_blocks
    );
    Ok(())
}

fn fused_init(task: &mut Task, dev: &mut Device) -> Result<()> {
    // Geometry and in-place flag were fixed at fusion time.
    crypto_sizing(task, dev)?;
    alloc_crc_ctx(task, dev)?;
    debug!(
        "fused task num_reqs {}, num_ops {}, num_blocks {}",
        task.num_reqs, task.num_ops, task.num_blocks
    );
    Ok(())
}

fn crc_init(task: &mut Task, dev: &mut Device) -> Result<()> {
    let nbytes = total_len(&task.src_iovs);
    if nbytes == 0 {
        return Err(AccelError::InvalidInput("empty scatter list".into()));
    }
    task.nbytes = nbytes as u32;
    if task.inplace {
        // One entry is reserved for the CRC tail.
        task.num_reqs = (task.src_iovs.len() + 1).div_ceil(MAX_SGE) as u16;
    } else {
        if total_len(&task.dst_iovs) != nbytes {
            return Err(AccelError::InvalidInput(
                "source and destination sizes differ".into(),
            ));
        }
        task.num_reqs = crc_task_count(&task.src_iovs, &task.dst_iovs);
    }
    alloc_crc_ctx(task, dev)?;
    Ok(())
}

/// Reserve MKeys for the remaining requests, clamped by free QP slots.
/// Each request costs one UMR plus one RDMA.
pub(crate) fn alloc_mkeys(task: &mut Task, dev: &mut Device, sig: bool) -> Result<()> {
    debug_assert!(task.mkeys.is_empty());
    let qp_slot = u32::from(dev.qp(task.qp_sel)?.qp_slot());
    let mut num_ops = u32::from(task.remaining_reqs()) * 2;
    num_ops = num_ops.min(qp_slot).min(MAX_MKEYS_IN_TASK as u32 * 2);
    if num_ops < 2 {
        // At least one UMR and one RDMA must fit.
        task.num_ops = 0;
        return Err(AccelError::ResourceExhausted("qp slots"));
    }
    let num_mkeys = (num_ops / 2) as usize;
    let res = if sig {
        dev.ctx.sig_mkey_pool()?.get_bulk(num_mkeys, &mut task.mkeys)
    } else {
        dev.ctx.mkey_pool()?.get_bulk(num_mkeys, &mut task.mkeys)
    };
    if let Err(e) = res {
        task.num_ops = 0;
        return Err(e);
    }
    task.num_ops = num_mkeys as u16;
    Ok(())
}

/// Reserve signature MKeys and a PSV. A PSV whose error latch is set
/// needs one extra WQE slot for the SET_PSV reset.
pub(crate) fn alloc_crc_ctx(task: &mut Task, dev: &mut Device) -> Result<()> {
    alloc_mkeys(task, dev, true)?;
    let psv_pool = dev.ctx.psv_pool()?;
    let psv_idx = match psv_pool.get() {
        Ok(idx) => idx,
        Err(e) => {
            dev.ctx.sig_mkey_pool()?.put_bulk(&task.mkeys);
            task.mkeys.clear();
            task.num_ops = 0;
            return Err(e);
        }
    };
    task.psv = Some(psv_idx);
    if psv_pool.entry(psv_idx).error.load(Ordering::Relaxed) {
        let qp_slot = dev.qp(task.qp_sel)?.qp_slot();
        let n_slots = task.num_ops * 2 + 1;
        if qp_slot < n_slots {
            psv_pool.put(psv_idx);
            task.psv = None;
            dev.ctx.sig_mkey_pool()?.put_bulk(&task.mkeys);
            task.mkeys.clear();
            task.num_ops = 0;
            return Err(AccelError::ResourceExhausted("qp slots for psv reset"));
        }
    }
    Ok(())
}

/// Return all pool objects held by the task.
pub(crate) fn release_mkeys(task: &mut Task, dev: &mut Device) {
    if task.num_ops == 0 {
        return;
    }
    match task.engine_op {
        EngineOpcode::Crypto => {
            if let Ok(pool) = dev.ctx.mkey_pool() {
                pool.put_bulk(&task.mkeys);
            }
        }
        EngineOpcode::Crc32c | EngineOpcode::EncryptAndCrc32c | EngineOpcode::Crc32cAndDecrypt => {
            if let Ok(pool) = dev.ctx.sig_mkey_pool() {
                pool.put_bulk(&task.mkeys);
            }
            if let (Some(idx), Ok(pool)) = (task.psv.take(), dev.ctx.psv_pool()) {
                pool.put(idx);
            }
        }
        EngineOpcode::Copy => {}
    }
    task.mkeys.clear();
    task.num_ops = 0;
}

/// Inspect and clear the signature shadow of every held MKey. On a
/// mismatch the PSV is latched stale so the next user resets it.
pub(crate) fn check_sigerr(task: &mut Task, dev: &mut Device) -> bool {
    if task.op != OpCode::CheckCrc32c {
        return false;
    }
    let Ok(pool) = dev.ctx.sig_mkey_pool() else {
        return false;
    };
    let mut failed = false;
    for &idx in &task.mkeys {
        if take_sigerr(pool.entry(idx)) {
            failed = true;
        }
    }
    if failed {
        if let (Some(idx), Ok(psv_pool)) = (task.psv, dev.ctx.psv_pool()) {
            psv_pool.entry(idx).error.store(true, Ordering::Relaxed);
        }
    }
    failed
}

/// Re-drive a partially drained task: replenish resources if they were
/// released, make sure the next batch fits into the QP, then submit.
///
/// # Errors
///
/// `ResourceExhausted` means "queue me on nomem", anything else fails
/// the task.
pub(crate) fn task_continue(task: &mut Task, dev: &mut Device) -> Result<()> {
    if dev.qp(task.qp_sel)?.recovering {
        return Err(AccelError::ResourceExhausted("qp recovering"));
    }
    match task.engine_op {
        EngineOpcode::Crypto => {
            if task.num_ops == 0 {
                alloc_mkeys(task, dev, false)?;
            } else {
                check_qp_room(task, dev)?;
            }
            process::crypto_task_process(task, dev)
        }
        EngineOpcode::Crc32c => {
            if task.num_ops == 0 {
                alloc_crc_ctx(task, dev)?;
            } else {
                check_qp_room(task, dev)?;
            }
            process::crc_task_process(task, dev)
        }
        EngineOpcode::EncryptAndCrc32c | EngineOpcode::Crc32cAndDecrypt => {
            if task.num_ops == 0 {
                alloc_crc_ctx(task, dev)?;
            } else {
                check_qp_room(task, dev)?;
            }
            process::crypto_and_crc_task_process(task, dev)
        }
        EngineOpcode::Copy => {
            let qp_slot = dev.qp(task.qp_sel)?.qp_slot();
            task.num_ops = qp_slot.min(task.remaining_reqs());
            if task.num_ops == 0 {
                return Err(AccelError::ResourceExhausted("qp slots"));
            }
            process::copy_task_process(task, dev)
        }
    }
}

fn check_qp_room(task: &mut Task, dev: &mut Device) -> Result<()> {
    let qp_slot = u32::from(dev.qp(task.qp_sel)?.qp_slot());
    let num_ops =
        (u32::from(task.remaining_reqs()) * 2).min(2 * u32::from(task.num_ops));
    if num_ops > qp_slot {
        return Err(AccelError::ResourceExhausted("qp slots"));
    }
    Ok(())
}

fn fire_cb(task: &mut Task, rc: Result<()>) {
    if let Some(cb) = task.cb.take() {
        cb(rc);
    }
}

#[allow(unsafe_code)]
fn store_crc(addr: u64, value: u32) {
    // The submitter keeps the destination word alive until the callback.
    unsafe { std::ptr::write_volatile(addr as *mut u32, value) }
}

fn copy_complete(task: &mut Task, _dev: &mut Device, rc: Result<()>) -> Option<Box<Task>> {
    if task.merged {
        task.merged = false;
        fire_cb(task, rc);
        return None;
    }
    fire_cb(task, rc);
    None
}

fn crypto_complete(task: &mut Task, dev: &mut Device, rc: Result<()>) -> Option<Box<Task>> {
    if task.merged {
        task.merged = false;
        fire_cb(task, rc);
        return None;
    }
    release_mkeys(task, dev);
    fire_cb(task, rc);
    None
}

fn crc_complete(task: &mut Task, dev: &mut Device, rc: Result<()>) -> Option<Box<Task>> {
    if task.merged {
        task.merged = false;
        fire_cb(task, rc);
        return None;
    }
    let sig_failed = check_sigerr(task, dev);
    let rc = match rc {
        Ok(()) if sig_failed => Err(AccelError::Io),
        rc => rc,
    };
    if rc.is_ok() && task.op != OpCode::CheckCrc32c {
        if let (Some(dst), Some(psv_idx)) = (task.crc_dst, task.psv) {
            if let Ok(pool) = dev.ctx.psv_pool() {
                store_crc(dst, pool.entry(psv_idx).read_crc() ^ u32::MAX);
            }
        }
    }
    release_mkeys(task, dev);
    fire_cb(task, rc);
    None
}

/// Fused completion: settle the parent, then either queue the merged
/// sibling for its own callback or, on failure, clear its merged flag
/// and hand it back for a standalone resubmission.
fn fused_complete(task: &mut Task, dev: &mut Device, rc: Result<()>) -> Option<Box<Task>> {
    if task.merged {
        task.merged = false;
        fire_cb(task, rc);
        return None;
    }
    let sig_failed = check_sigerr(task, dev);
    let rc = match rc {
        Ok(()) if sig_failed => Err(AccelError::Io),
        rc => rc,
    };
    let mut sibling = task.sibling.take();
    if rc.is_ok() && task.engine_op == EngineOpcode::EncryptAndCrc32c {
        if let Some(sib) = sibling.as_deref() {
            if let (Some(dst), Some(psv_idx)) = (sib.crc_dst, task.psv) {
                if let Ok(pool) = dev.ctx.psv_pool() {
                    store_crc(dst, pool.entry(psv_idx).read_crc() ^ u32::MAX);
                }
            }
        }
    }
    release_mkeys(task, dev);
    let failed = rc.is_err();
    fire_cb(task, rc);
    match sibling.take() {
        Some(mut sib) if failed => {
            // The sibling was never executed; resubmit it standalone.
            sib.merged = false;
            Some(sib)
        }
        Some(sib) => {
            dev.merged.push_back(sib);
            None
        }
        None => None,
    }
}

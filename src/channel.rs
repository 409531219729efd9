//! Per-thread channel: task submission, the completion poller, nomem
//! backpressure, merged-task dispatch and QP recovery.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::constants::RECOVER_RETRY_DELAY;
use crate::device::Device;
use crate::domain::DomainId;
use crate::error::{AccelError, Result};
use crate::hw::CqeStatus;
use crate::module::ModuleShared;
use crate::qp::QueuePair;
use crate::task::{ops, release_mkeys, check_sigerr, EngineOpcode, QpSel, Task, TaskRequest};

/// Per-thread handle to the engine. Owns one view of every device and
/// must be polled from the owning thread.
pub struct Channel {
    devs: Vec<Device>,
    /// Round-robin device index for task placement.
    dev_idx: usize,
    shared: Arc<ModuleShared>,
    next_seq: u64,
}

impl Channel {
    pub(crate) fn new(devs: Vec<Device>, shared: Arc<ModuleShared>) -> Self {
        Self {
            devs,
            dev_idx: 0,
            shared,
            next_seq: 1,
        }
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Submit a sequence of tasks. Adjacent encrypt+CRC and CRC+decrypt
    /// pairs fuse into a single hardware task when merging is enabled.
    ///
    /// `Ok` is returned even when tasks are queued waiting for
    /// resources; hard failures are reported synchronously and do not
    /// invoke the task callback.
    pub fn submit(&mut self, reqs: Vec<TaskRequest>) -> Result<()> {
        let mut tasks = Vec::with_capacity(reqs.len());
        for req in reqs {
            let seq = self.alloc_seq();
            tasks.push(Task::from_request(req, seq));
        }

        let mut pending: Option<Box<Task>> = None;
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            match pending.take() {
                None => pending = Some(task),
                Some(mut prev) => {
                    if self.shared.config.merge && prev.fusable(&task) {
                        prev.fuse(task);
                        out.push(prev);
                    } else {
                        out.push(prev);
                        pending = Some(task);
                    }
                }
            }
        }
        if let Some(task) = pending {
            out.push(task);
        }

        let mut rc = Ok(());
        for task in out {
            if let Err((_task, e)) = self.submit_task(task) {
                rc = Err(e);
                break;
            }
        }
        for dev in &mut self.devs {
            dev.flush_dbs();
        }
        rc
    }

    fn submit_task(
        &mut self,
        mut task: Box<Task>,
    ) -> std::result::Result<(), (Box<Task>, AccelError)> {
        let dev_idx = self.dev_idx;
        self.dev_idx = (self.dev_idx + 1) % self.devs.len();
        let dev = &mut self.devs[dev_idx];

        if task.merged {
            // Executed as part of its fusion parent; only the callback
            // dispatch is left.
            task.qp_sel = QpSel::Default;
            dev.merged.push_back(task);
            return Ok(());
        }

        match task.engine_op {
            EngineOpcode::Crypto
            | EngineOpcode::EncryptAndCrc32c
            | EngineOpcode::Crc32cAndDecrypt => {
                if !self.shared.crypto_supported {
                    return Err((task, AccelError::Unsupported("crypto is disabled".into())));
                }
                if task.key.is_none() {
                    return Err((task, AccelError::InvalidInput("missing crypto key".into())));
                }
            }
            EngineOpcode::Crc32c => {
                if !self.shared.crc_supported {
                    return Err((task, AccelError::Unsupported("crc32c is disabled".into())));
                }
                if self.shared.config.merge {
                    // Signature MKeys carry the crypto bit; a UMR cannot
                    // disable it again for a plain CRC transfer.
                    return Err((
                        task,
                        AccelError::Unsupported("standalone crc32c is unavailable with merge".into()),
                    ));
                }
            }
            EngineOpcode::Copy => {}
        }

        task.qp_sel = match dev.assign_qp(&task) {
            Ok(sel) => sel,
            Err(e) => return Err((task, e)),
        };

        match (ops(task.engine_op).init)(&mut task, dev) {
            Ok(()) => {}
            Err(e) if e.is_nomem() => {
                debug!("no resources for new task, queueing");
                dev.stats.nomem += 1;
                dev.nomem.push_back(task);
                return Ok(());
            }
            Err(e) => return Err((task, e)),
        }

        if dev.qp(task.qp_sel).map(|qp| qp.recovering).unwrap_or(true) {
            dev.nomem.push_back(task);
            return Ok(());
        }

        match (ops(task.engine_op).process)(&mut task, dev) {
            Ok(()) => {
                let sel = task.qp_sel;
                match dev.qp_mut(sel) {
                    Ok(qp) => {
                        qp.in_hw.push_back(task);
                        Ok(())
                    }
                    Err(e) => Err((task, e)),
                }
            }
            Err(e) => {
                release_mkeys(&mut task, dev);
                Err((task, e))
            }
        }
    }

    /// Drive one poller iteration over all devices. Returns the number
    /// of reaped completions.
    pub fn poll(&mut self) -> u64 {
        let mut completions = 0u64;
        for i in 0..self.devs.len() {
            self.devs[i].flush_dbs();
            let reaped = self.devs[i].poll_cq();
            completions += reaped as u64;
            if reaped > 0 {
                if self.shared.config.siglast {
                    self.process_cpls_siglast(i);
                } else {
                    self.process_cpls(i);
                }
            }
            self.complete_merged(i);
            self.resubmit_nomem(i);
            self.check_recovery(i);
            self.devs[i].flush_dbs();
        }
        completions
    }

    /// Strict FIFO dispatch: every signaled CQE matches the head of the
    /// QP's `in_hw` queue.
    fn process_cpls(&mut self, di: usize) {
        let cqes = std::mem::take(&mut self.devs[di].cqe_buf);
        for cqe in &cqes {
            self.process_one_cqe(di, cqe, false);
        }
        self.devs[di].cqe_buf = cqes;
    }

    /// Signal-last dispatch: a CQE may account several batched tasks;
    /// walk `in_hw` up to and including the one it names.
    fn process_cpls_siglast(&mut self, di: usize) {
        let cqes = std::mem::take(&mut self.devs[di].cqe_buf);
        for cqe in &cqes {
            self.process_one_cqe(di, cqe, true);
        }
        self.devs[di].cqe_buf = cqes;
    }

    fn process_one_cqe(&mut self, di: usize, cqe: &crate::hw::RawCqe, siglast: bool) {
        if cqe.status == CqeStatus::SigErr {
            // Not a task failure yet; the paired WR completion follows.
            // Shadow the error on the MKey so completion sees it.
            if let Ok(pool) = self.devs[di].ctx.sig_mkey_pool() {
                if let Some(entry) = pool.resolve(cqe.mkey) {
                    entry.sigerr_count.fetch_add(1, Ordering::Relaxed);
                    entry.sigerr.store(true, Ordering::Relaxed);
                }
            }
            return;
        }

        let mut batch = Vec::new();
        {
            let dev = &mut self.devs[di];
            let Some((qp, _sel)) = dev.qp_by_id_mut(cqe.qp) else {
                return;
            };
            let wr_id = qp.on_cqe(cqe.wqe_counter);
            if wr_id & 1 == 0 {
                // Unsignaled completion, possibly with error; the next
                // signaled CQE surfaces it.
                return;
            }
            loop {
                let Some(mut task) = qp.in_hw.pop_front() else {
                    break;
                };
                let is_last = task.token == wr_id;
                if !siglast {
                    debug_assert!(is_last, "submission mismatch");
                }
                let completed = task.num_submitted_reqs - task.num_completed_reqs;
                debug_assert!(qp.wrs_submitted >= task.num_wrs);
                qp.wrs_submitted -= task.num_wrs;
                task.num_completed_reqs += completed;
                debug!(
                    "task {:#x}, remaining {}",
                    task.token,
                    task.num_reqs - task.num_completed_reqs
                );
                batch.push((task, is_last));
                if is_last {
                    break;
                }
            }
        }

        for (task, is_last) in batch {
            if cqe.status.is_ok() {
                self.dispatch_task(di, task);
            } else if is_last {
                self.handle_wr_error(di, task, cqe.status);
            } else if task.num_completed_reqs < task.num_reqs {
                // The erroring QP stops posting, so a predecessor that
                // still owes sub-requests can never finish; it fails
                // together with the erroring task.
                self.fail_errored_task(di, task, cqe.status);
            } else {
                // Fully drained before the erroring WR; completes as
                // usual even though the NIC may have flushed it.
                self.dispatch_task(di, task);
            }
        }
    }

    fn dispatch_task(&mut self, di: usize, mut task: Box<Task>) {
        if task.num_completed_reqs == task.num_reqs {
            self.finish_task(di, task, Ok(()));
        } else if task.num_completed_reqs == task.num_submitted_reqs {
            match (ops(task.engine_op).cont)(&mut task, &mut self.devs[di]) {
                Ok(()) => {
                    let sel = task.qp_sel;
                    if let Ok(qp) = self.devs[di].qp_mut(sel) {
                        qp.in_hw.push_back(task);
                    }
                }
                Err(e) if e.is_nomem() => {
                    self.devs[di].stats.nomem += 1;
                    self.devs[di].nomem.push_back(task);
                }
                Err(e) => self.finish_task(di, task, Err(e)),
            }
        } else {
            // Still draining earlier sub-requests.
            let sel = task.qp_sel;
            if let Ok(qp) = self.devs[di].qp_mut(sel) {
                qp.in_hw.push_front(task);
            }
        }
    }

    fn handle_wr_error(&mut self, di: usize, task: Box<Task>, status: CqeStatus) {
        let sel = task.qp_sel;
        self.fail_errored_task(di, task, status);
        let idle = self.devs[di]
            .qp(sel)
            .map(|qp| qp.wrs_submitted == 0 && qp.in_hw.is_empty())
            .unwrap_or(false);
        if idle {
            self.recover_qp(di, sel);
        }
    }

    /// Fail one task of an erroring batch: latch the QP as recovering,
    /// sync the signature shadows, complete with `Io`. Recovery itself
    /// is triggered once, by the signaled task of the batch.
    fn fail_errored_task(&mut self, di: usize, mut task: Box<Task>, status: CqeStatus) {
        let sel = task.qp_sel;
        if status.is_flush() {
            debug!("RDMA: task {:#x} flushed, WC status {status:?}", task.token);
        } else {
            warn!("RDMA: task {:#x}, WC status {status:?}", task.token);
        }
        if let Ok(qp) = self.devs[di].qp_mut(sel) {
            qp.recovering = true;
        }
        // A SIGERR CQE may have preceded the failure; sync the MKey and
        // PSV shadows before completing.
        check_sigerr(&mut task, &mut self.devs[di]);
        if task.num_completed_reqs == task.num_submitted_reqs {
            self.finish_task(di, task, Err(AccelError::Io));
        } else if let Ok(qp) = self.devs[di].qp_mut(sel) {
            qp.in_hw.push_front(task);
        }
    }

    fn finish_task(&mut self, di: usize, mut task: Box<Task>, rc: Result<()>) {
        debug!("Complete task {:#x}, rc {:?}", task.token, rc.is_ok());
        let resubmit = (ops(task.engine_op).complete)(&mut task, &mut self.devs[di], rc);
        if let Some(sibling) = resubmit {
            if let Err((mut sibling, e)) = self.submit_task(sibling) {
                if let Some(cb) = sibling.cb.take() {
                    cb(Err(e));
                }
            }
        }
    }

    /// Dispatch callbacks of tasks completed implicitly by their fusion
    /// parent.
    fn complete_merged(&mut self, di: usize) {
        while let Some(task) = self.devs[di].merged.pop_front() {
            self.finish_task(di, task, Ok(()));
        }
    }

    /// Re-drive tasks parked for resources, in arrival order, stopping
    /// at the first one that still does not fit.
    fn resubmit_nomem(&mut self, di: usize) {
        let parked = self.devs[di].nomem.len();
        for _ in 0..parked {
            let Some(mut task) = self.devs[di].nomem.pop_front() else {
                break;
            };
            match (ops(task.engine_op).cont)(&mut task, &mut self.devs[di]) {
                Ok(()) => {
                    let sel = task.qp_sel;
                    if let Ok(qp) = self.devs[di].qp_mut(sel) {
                        qp.in_hw.push_back(task);
                    }
                }
                Err(e) if e.is_nomem() => {
                    self.devs[di].nomem.push_back(task);
                    break;
                }
                Err(e) => self.finish_task(di, task, Err(e)),
            }
        }
    }

    fn check_recovery(&mut self, di: usize) {
        let due = self.devs[di].qp.recovering
            && self.devs[di]
                .qp
                .recover_retry_at
                .is_some_and(|at| Instant::now() >= at);
        if due {
            self.devs[di].qp.recover_retry_at = None;
            self.recover_qp(di, QpSel::Default);
        }
    }

    /// Tear down and rebuild a failed QP. Stale cached translation keys
    /// are the most likely cause of spurious WR errors, so every parked
    /// task bound to this QP drops its cache slot.
    fn recover_qp(&mut self, di: usize, sel: QpSel) {
        let dev = &mut self.devs[di];
        dev.stats.recoveries += 1;
        info!("Recovering qp on dev {}", dev.ctx.name);

        for task in dev.nomem.iter_mut() {
            if task.qp_sel != sel {
                continue;
            }
            if let Some(cache) = &task.cached_lkey {
                cache.store(0, Ordering::Relaxed);
            }
            if let Some(cache) = task.sibling.as_ref().and_then(|s| s.cached_lkey.as_ref()) {
                cache.store(0, Ordering::Relaxed);
            }
        }

        let backend = dev.shared.backend.clone();
        match sel {
            QpSel::Domain(id) => {
                // No need to rebuild a per-domain QP; the next task for
                // the same domain recreates it.
                if let Some(mut qp) = dev.domain_qps.remove(&id) {
                    qp.destroy(backend.as_ref());
                }
            }
            QpSel::Default => {
                dev.qp.destroy(backend.as_ref());
                let cfg = &dev.shared.config;
                match QueuePair::create(
                    backend.as_ref(),
                    &dev.ctx.name,
                    dev.cq,
                    cfg.qp_size,
                    cfg.siglast,
                    None,
                ) {
                    Ok(qp) => dev.qp = qp,
                    Err(e) => {
                        warn!("Failed to recreate qp: {e}, retrying shortly");
                        dev.qp.recover_retry_at = Some(Instant::now() + RECOVER_RETRY_DELAY);
                    }
                }
            }
        }
    }

    /// The runtime is deleting a memory domain: idle QPs bound to it go
    /// away immediately, busy ones are flushed and reaped by the normal
    /// completion drain.
    pub fn domain_invalidated(&mut self, id: DomainId) {
        for dev in &mut self.devs {
            let Some(qp) = dev.domain_qps.get(&id) else {
                continue;
            };
            debug_assert_eq!(qp.domain, Some(id));
            if qp.wrs_submitted == 0 {
                if let Some(mut qp) = dev.domain_qps.remove(&id) {
                    qp.destroy(dev.shared.backend.as_ref());
                }
            } else {
                dev.shared.backend.qp_set_error_state(qp.id);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let mut total = self.shared.total_stats.lock();
        for dev in &self.devs {
            info!(
                "dev {} channel stats: tasks {}, umrs {}, rdma_reads {}, rdma_writes {}, polls {}, idle_polls {}, completions {}",
                dev.ctx.name,
                dev.stats.tasks,
                dev.stats.umrs,
                dev.stats.rdma_reads,
                dev.stats.rdma_writes,
                dev.stats.polls,
                dev.stats.idle_polls,
                dev.stats.completions
            );
            total.merge(&dev.stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crc::{Crc, CRC_32_ISCSI};

    use crate::config::ModuleConfig;
    use crate::emulated::EmulatedNic;
    use crate::hw::NicBackend;
    use crate::iov::IoVec;
    use crate::module::{AccelModule, TweakMode};
    use crate::task::{CryptoKey, TaskCallback, TaskRequest};

    const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

    fn setup(cfg: ModuleConfig) -> (Arc<EmulatedNic>, AccelModule, Channel) {
        let backend = Arc::new(EmulatedNic::single_full_featured("mlx5_0"));
        let module = AccelModule::new(backend.clone() as Arc<dyn NicBackend>, cfg).unwrap();
        let ch = module.get_io_channel().unwrap();
        (backend, module, ch)
    }

    fn small_cfg() -> ModuleConfig {
        ModuleConfig {
            num_requests: 32,
            ..Default::default()
        }
    }

    type Slot = Rc<RefCell<Option<Result<()>>>>;

    fn cb_slot() -> (Slot, TaskCallback) {
        let slot: Slot = Rc::new(RefCell::new(None));
        let inner = Rc::clone(&slot);
        (
            slot,
            Box::new(move |rc| {
                *inner.borrow_mut() = Some(rc);
            }),
        )
    }

    fn poll_until_set(ch: &mut Channel, slot: &Slot) {
        for _ in 0..64 {
            ch.poll();
            if slot.borrow().is_some() {
                return;
            }
        }
        panic!("task did not complete");
    }

    fn assert_ok(slot: &Slot) {
        assert!(slot.borrow().as_ref().unwrap().is_ok());
    }

    fn assert_io_err(slot: &Slot) {
        assert!(matches!(
            slot.borrow().as_ref().unwrap(),
            Err(AccelError::Io)
        ));
    }

    fn test_key(module: &AccelModule) -> Arc<CryptoKey> {
        module
            .crypto_key_init(&[0x11; 32], &[0x22; 32], TweakMode::SimpleLba)
            .unwrap()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn copy_scatter_to_gather() {
        let (backend, _module, mut ch) = setup(small_cfg());
        let a = pattern(5, 1);
        let b = pattern(7, 2);
        let mut c = vec![0u8; 3];
        let mut d = vec![0u8; 9];
        let src = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let dst = vec![IoVec::from_mut_slice(&mut c), IoVec::from_mut_slice(&mut d)];

        let (slot, cb) = cb_slot();
        ch.submit(vec![TaskRequest::copy(src, dst).with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch, &slot);

        assert_ok(&slot);
        assert_eq!(&c[..], &a[0..3]);
        assert_eq!(&d[0..2], &a[3..5]);
        assert_eq!(&d[2..9], &b[..]);
        // One RDMA_WRITE per boundary-delimited range.
        assert_eq!(backend.stats().rdma_writes, 3);
    }

    #[test]
    fn crypto_single_block_round_trips() {
        let (backend, module, mut ch) = setup(small_cfg());
        let key = test_key(&module);
        let plain = pattern(512, 7);
        let mut cipher = vec![0u8; 512];
        let mut out = vec![0u8; 512];
        let cipher_iov = IoVec::from_mut_slice(&mut cipher);
        let out_iov = IoVec::from_mut_slice(&mut out);

        let (slot, cb) = cb_slot();
        ch.submit(vec![TaskRequest::encrypt(
            vec![IoVec::from_slice(&plain)],
            vec![cipher_iov],
            Arc::clone(&key),
            512,
            0x1000,
        )
        .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);
        assert_ne!(cipher, plain);
        let stats = backend.stats();
        assert_eq!(stats.umrs, 1);
        assert_eq!(stats.rdma_reads, 1);

        let (slot, cb) = cb_slot();
        ch.submit(vec![TaskRequest::decrypt(
            vec![cipher_iov],
            vec![out_iov],
            key,
            512,
            0x1000,
        )
        .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);
        assert_eq!(out, plain);
    }

    #[test]
    fn crypto_multi_block_split_keeps_iv_sequence() {
        // 8 blocks of 4096 split 3 per request: {3, 3, 2} with the tweak
        // advancing by the block count of each request.
        let (backend, module, mut ch) = setup(ModuleConfig {
            num_requests: 32,
            split_mb_blocks: 3,
            ..Default::default()
        });
        let key = test_key(&module);
        let plain = pattern(8 * 4096, 3);
        let mut cipher = vec![0u8; 8 * 4096];
        let cipher_iov = IoVec::from_mut_slice(&mut cipher);

        let (slot, cb) = cb_slot();
        ch.submit(vec![TaskRequest::encrypt(
            vec![IoVec::from_slice(&plain)],
            vec![cipher_iov],
            key,
            4096,
            0x80,
        )
        .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);
        assert_eq!(backend.stats().umrs, 3);

        // A decryption without splitting must restore the plaintext,
        // which only holds if each split carried the right tweak base.
        let module2 =
            AccelModule::new(backend.clone() as Arc<dyn NicBackend>, small_cfg()).unwrap();
        let mut ch2 = module2.get_io_channel().unwrap();
        let key2 = test_key(&module2);
        let mut out = vec![0u8; 8 * 4096];
        let out_iov = IoVec::from_mut_slice(&mut out);
        let (slot, cb) = cb_slot();
        ch2.submit(vec![TaskRequest::decrypt(
            vec![cipher_iov],
            vec![out_iov],
            key2,
            4096,
            0x80,
        )
        .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch2, &slot);
        assert_ok(&slot);
        assert_eq!(out, plain);
    }

    #[test]
    fn crc_generate_matches_software_reference() {
        let (_backend, _module, mut ch) = setup(small_cfg());
        let mut p = pattern(1000, 9);
        let reference = CASTAGNOLI.checksum(&p);
        let p_iov = IoVec::from_mut_slice(&mut p);
        let mut crc_out = 0u32;

        let (slot, cb) = cb_slot();
        ch.submit(vec![TaskRequest::crc32c(
            vec![p_iov],
            &mut crc_out as *mut u32 as u64,
            0,
        )
        .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);
        assert_eq!(crc_out, reference);
    }

    #[test]
    fn crc_check_round_trip_and_bit_flip() {
        let (_backend, _module, mut ch) = setup(small_cfg());
        let mut p = pattern(600, 4);
        let expected = CASTAGNOLI.checksum(&p);

        let p_iov = IoVec::from_mut_slice(&mut p);
        let (slot, cb) = cb_slot();
        ch.submit(vec![
            TaskRequest::check_crc32c(vec![p_iov], expected, 0).with_callback(cb),
        ])
        .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);

        p[17] ^= 0x04;
        let p_iov = IoVec::from_mut_slice(&mut p);
        let (slot, cb) = cb_slot();
        ch.submit(vec![
            TaskRequest::check_crc32c(vec![p_iov], expected, 0).with_callback(cb),
        ])
        .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_io_err(&slot);
    }

    #[test]
    fn crc_generate_scattered_multi_request() {
        // 40 fragments force several signature UMRs chained on one PSV.
        let (_backend, _module, mut ch) = setup(small_cfg());
        let mut frags: Vec<Vec<u8>> = (0..40).map(|i| pattern(33, i as u8)).collect();
        let flat: Vec<u8> = frags.iter().flatten().copied().collect();
        let iovs: Vec<IoVec> = frags
            .iter_mut()
            .map(|f| IoVec::from_mut_slice(f))
            .collect();
        let mut crc_out = 0u32;

        let (slot, cb) = cb_slot();
        ch.submit(vec![TaskRequest::crc32c(
            iovs,
            &mut crc_out as *mut u32 as u64,
            0,
        )
        .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);
        assert_eq!(crc_out, CASTAGNOLI.checksum(&flat));
    }

    #[test]
    fn fused_encrypt_and_crc() {
        let (backend, module, mut ch) = setup(ModuleConfig {
            num_requests: 32,
            merge: true,
            ..Default::default()
        });
        let key = test_key(&module);
        let plain = pattern(1024, 5);
        let mut cipher = vec![0u8; 1024];
        let cipher_iov = IoVec::from_mut_slice(&mut cipher);
        let mut crc_out = 0u32;

        let (enc_slot, enc_cb) = cb_slot();
        let (crc_slot, crc_cb) = cb_slot();
        ch.submit(vec![
            TaskRequest::encrypt(
                vec![IoVec::from_slice(&plain)],
                vec![cipher_iov],
                key,
                512,
                0x42,
            )
            .with_callback(enc_cb),
            TaskRequest::crc32c(vec![cipher_iov], &mut crc_out as *mut u32 as u64, 0)
                .with_callback(crc_cb),
        ])
        .unwrap();
        poll_until_set(&mut ch, &crc_slot);

        assert_ok(&enc_slot);
        assert_ok(&crc_slot);
        assert_ne!(cipher, plain);
        assert_eq!(crc_out, CASTAGNOLI.checksum(&cipher));
        // The CRC task never reached the device on its own.
        let stats = backend.stats();
        assert_eq!(stats.umrs, 1);
        assert_eq!(stats.rdma_reads, 1);
    }

    #[test]
    fn fused_check_and_decrypt() {
        let backend = Arc::new(EmulatedNic::single_full_featured("mlx5_0"));
        // Produce ciphertext with a plain module first.
        let enc_module =
            AccelModule::new(backend.clone() as Arc<dyn NicBackend>, small_cfg()).unwrap();
        let mut enc_ch = enc_module.get_io_channel().unwrap();
        let enc_key = test_key(&enc_module);
        let plain = pattern(1024, 6);
        let mut cipher = vec![0u8; 1024];
        let cipher_iov = IoVec::from_mut_slice(&mut cipher);
        let (slot, cb) = cb_slot();
        enc_ch
            .submit(vec![TaskRequest::encrypt(
                vec![IoVec::from_slice(&plain)],
                vec![cipher_iov],
                enc_key,
                512,
                0x99,
            )
            .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut enc_ch, &slot);
        let cipher_crc = CASTAGNOLI.checksum(&cipher);

        let module = AccelModule::new(
            backend.clone() as Arc<dyn NicBackend>,
            ModuleConfig {
                num_requests: 32,
                merge: true,
                ..Default::default()
            },
        )
        .unwrap();
        let mut ch = module.get_io_channel().unwrap();
        let key = test_key(&module);
        let mut out = vec![0u8; 1024];
        let out_iov = IoVec::from_mut_slice(&mut out);

        let (check_slot, check_cb) = cb_slot();
        let (dec_slot, dec_cb) = cb_slot();
        ch.submit(vec![
            TaskRequest::check_crc32c(vec![cipher_iov], cipher_crc, 0).with_callback(check_cb),
            TaskRequest::decrypt(vec![cipher_iov], vec![out_iov], key, 512, 0x99)
                .with_callback(dec_cb),
        ])
        .unwrap();
        poll_until_set(&mut ch, &dec_slot);

        assert_ok(&check_slot);
        assert_ok(&dec_slot);
        assert_eq!(out, plain);
    }

    #[test]
    fn sigerr_latches_psv_and_forces_set_psv() {
        let (backend, _module, mut ch) = setup(small_cfg());
        let mut p = pattern(512, 8);
        let good = CASTAGNOLI.checksum(&p);
        let p_iov = IoVec::from_mut_slice(&mut p);

        let (slot, cb) = cb_slot();
        ch.submit(vec![
            TaskRequest::check_crc32c(vec![p_iov], good ^ 0x1, 0).with_callback(cb),
        ])
        .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_io_err(&slot);
        assert_eq!(backend.stats().set_psvs, 0);

        // The stale PSV must be reset before its next use.
        let (slot, cb) = cb_slot();
        ch.submit(vec![
            TaskRequest::check_crc32c(vec![p_iov], good, 0).with_callback(cb),
        ])
        .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);
        assert_eq!(backend.stats().set_psvs, 1);
    }

    #[test]
    fn wr_error_fails_tasks_and_rebuilds_qp() {
        let (backend, _module, mut ch) = setup(small_cfg());
        let src = pattern(64, 1);
        let mut dst = vec![0u8; 64];
        let dst_iov = IoVec::from_mut_slice(&mut dst);

        backend.inject_wr_error_after_rdmas(0);
        let (slot1, cb1) = cb_slot();
        let (slot2, cb2) = cb_slot();
        ch.submit(vec![
            TaskRequest::copy(vec![IoVec::from_slice(&src)], vec![dst_iov]).with_callback(cb1),
            TaskRequest::copy(vec![IoVec::from_slice(&src)], vec![dst_iov]).with_callback(cb2),
        ])
        .unwrap();
        poll_until_set(&mut ch, &slot2);
        assert_io_err(&slot1);
        // The second task was flushed by the erroring QP.
        assert_io_err(&slot2);

        // The QP was rebuilt; new work flows again.
        let (slot3, cb3) = cb_slot();
        ch.submit(vec![
            TaskRequest::copy(vec![IoVec::from_slice(&src)], vec![dst_iov]).with_callback(cb3),
        ])
        .unwrap();
        poll_until_set(&mut ch, &slot3);
        assert_ok(&slot3);
        assert_eq!(&dst[..], &src[..]);
    }

    #[test]
    fn nomem_tasks_drain_after_completions() {
        // One MKey in the pool: tasks beyond the first wait on nomem and
        // drain as completions return resources.
        let (_backend, module, mut ch) = setup(ModuleConfig {
            num_requests: 1,
            ..Default::default()
        });
        let key = test_key(&module);
        let srcs: Vec<Vec<u8>> = (0..3).map(|i| pattern(512, i as u8)).collect();
        let mut dsts: Vec<Vec<u8>> = (0..3).map(|_| vec![0u8; 512]).collect();

        let mut slots = Vec::new();
        for (src, dst) in srcs.iter().zip(dsts.iter_mut()) {
            let (slot, cb) = cb_slot();
            ch.submit(vec![TaskRequest::encrypt(
                vec![IoVec::from_slice(src)],
                vec![IoVec::from_mut_slice(dst)],
                Arc::clone(&key),
                512,
                0,
            )
            .with_callback(cb)])
                .unwrap();
            slots.push(slot);
        }
        for slot in &slots {
            poll_until_set(&mut ch, slot);
            assert_ok(slot);
        }
        // Pool conservation at the quiescent point.
        let dev = &ch.devs[0];
        let pool = dev.ctx.mkey_pool().unwrap();
        assert_eq!(pool.free_count(), pool.size());
        assert_eq!(dev.ctx.psv_pool().unwrap().free_count(), 1);
    }

    #[test]
    fn siglast_batches_tasks_into_one_cqe() {
        let (_backend, _module, mut ch) = setup(ModuleConfig {
            num_requests: 32,
            siglast: true,
            ..Default::default()
        });
        let src = pattern(64, 2);
        let mut dsts: Vec<Vec<u8>> = (0..3).map(|_| vec![0u8; 64]).collect();

        let mut reqs = Vec::new();
        let mut slots = Vec::new();
        for dst in dsts.iter_mut() {
            let (slot, cb) = cb_slot();
            reqs.push(
                TaskRequest::copy(
                    vec![IoVec::from_slice(&src)],
                    vec![IoVec::from_mut_slice(dst)],
                )
                .with_callback(cb),
            );
            slots.push(slot);
        }
        ch.submit(reqs).unwrap();
        for slot in &slots {
            poll_until_set(&mut ch, slot);
            assert_ok(slot);
        }
        for dst in &dsts {
            assert_eq!(&dst[..], &src[..]);
        }
        // All three tasks were reaped through a single signaled CQE.
        assert_eq!(ch.devs[0].stats.completions, 1);
    }

    #[test]
    fn siglast_error_completes_drained_predecessors() {
        let (backend, _module, mut ch) = setup(ModuleConfig {
            num_requests: 32,
            siglast: true,
            ..Default::default()
        });
        let src = pattern(64, 3);
        let mut dsts: Vec<Vec<u8>> = (0..3).map(|_| vec![0u8; 64]).collect();

        // Fail the second RDMA: the first task is already fully drained
        // and still completes, the second errors, the third is flushed.
        backend.inject_wr_error_after_rdmas(1);
        let mut slots = Vec::new();
        let mut reqs = Vec::new();
        for dst in dsts.iter_mut() {
            let (slot, cb) = cb_slot();
            reqs.push(
                TaskRequest::copy(
                    vec![IoVec::from_slice(&src)],
                    vec![IoVec::from_mut_slice(dst)],
                )
                .with_callback(cb),
            );
            slots.push(slot);
        }
        ch.submit(reqs).unwrap();
        for slot in &slots {
            poll_until_set(&mut ch, slot);
        }
        assert_ok(&slots[0]);
        assert_io_err(&slots[1]);
        assert_io_err(&slots[2]);
    }

    #[test]
    fn siglast_error_fails_mid_submission_predecessor() {
        // One batch of three tasks: a fully drained copy, a 20-request
        // crypto task that can only submit 16 requests (MKey cap per
        // batch), and a copy carrying the erroring WR. The drained
        // predecessor still completes; the mid-submission one can never
        // finish on the dead QP and must fail with the batch.
        let (backend, module, mut ch) = setup(ModuleConfig {
            num_requests: 32,
            siglast: true,
            split_mb_blocks: 1,
            ..Default::default()
        });
        let key = test_key(&module);
        let src1 = pattern(64, 1);
        let mut dst1 = vec![0u8; 64];
        let dst1_iov = IoVec::from_mut_slice(&mut dst1);
        let plain = pattern(20 * 512, 2);
        let mut cipher = vec![0u8; 20 * 512];
        let cipher_iov = IoVec::from_mut_slice(&mut cipher);
        let src3 = pattern(64, 3);
        let mut dst3 = vec![0u8; 64];
        let dst3_iov = IoVec::from_mut_slice(&mut dst3);

        // RDMAs in batch order: 1 (copy) + 16 (crypto) precede the
        // erroring one on the last copy.
        backend.inject_wr_error_after_rdmas(17);
        let (slot1, cb1) = cb_slot();
        let (slot2, cb2) = cb_slot();
        let (slot3, cb3) = cb_slot();
        ch.submit(vec![
            TaskRequest::copy(vec![IoVec::from_slice(&src1)], vec![dst1_iov]).with_callback(cb1),
            TaskRequest::encrypt(
                vec![IoVec::from_slice(&plain)],
                vec![cipher_iov],
                key,
                512,
                0x30,
            )
            .with_callback(cb2),
            TaskRequest::copy(vec![IoVec::from_slice(&src3)], vec![dst3_iov]).with_callback(cb3),
        ])
        .unwrap();
        for slot in [&slot1, &slot2, &slot3] {
            poll_until_set(&mut ch, slot);
        }

        assert_ok(&slot1);
        assert_eq!(&dst1[..], &src1[..]);
        assert_io_err(&slot2);
        assert_io_err(&slot3);
        // The failed crypto task returned its MKeys and the QP was
        // rebuilt exactly once.
        let pool = ch.devs[0].ctx.mkey_pool().unwrap();
        assert_eq!(pool.free_count(), pool.size());
        assert_eq!(ch.devs[0].stats.recoveries, 1);
    }

    #[test]
    fn fused_parent_failure_resubmits_sibling() {
        // A fused check+decrypt whose CRC does not match: the check
        // fails with Io, the decrypt sibling is resubmitted standalone
        // and still produces plaintext.
        let backend = Arc::new(EmulatedNic::single_full_featured("mlx5_0"));
        let enc_module =
            AccelModule::new(backend.clone() as Arc<dyn NicBackend>, small_cfg()).unwrap();
        let mut enc_ch = enc_module.get_io_channel().unwrap();
        let plain = pattern(512, 11);
        let mut cipher = vec![0u8; 512];
        let cipher_iov = IoVec::from_mut_slice(&mut cipher);
        let (slot, cb) = cb_slot();
        enc_ch
            .submit(vec![TaskRequest::encrypt(
                vec![IoVec::from_slice(&plain)],
                vec![cipher_iov],
                test_key(&enc_module),
                512,
                0x7,
            )
            .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut enc_ch, &slot);

        let module = AccelModule::new(
            backend.clone() as Arc<dyn NicBackend>,
            ModuleConfig {
                num_requests: 32,
                merge: true,
                ..Default::default()
            },
        )
        .unwrap();
        let mut ch = module.get_io_channel().unwrap();
        let mut out = vec![0u8; 512];
        let out_iov = IoVec::from_mut_slice(&mut out);
        let bad_crc = CASTAGNOLI.checksum(&cipher) ^ 0x10;

        let (check_slot, check_cb) = cb_slot();
        let (dec_slot, dec_cb) = cb_slot();
        ch.submit(vec![
            TaskRequest::check_crc32c(vec![cipher_iov], bad_crc, 0).with_callback(check_cb),
            TaskRequest::decrypt(
                vec![cipher_iov],
                vec![out_iov],
                test_key(&module),
                512,
                0x7,
            )
            .with_callback(dec_cb),
        ])
        .unwrap();
        poll_until_set(&mut ch, &dec_slot);

        assert_io_err(&check_slot);
        assert_ok(&dec_slot);
        assert_eq!(out, plain);
    }

    struct TestDomain {
        id: u64,
        lkey: u32,
        fail: bool,
    }

    impl crate::domain::MemoryDomain for TestDomain {
        fn id(&self) -> DomainId {
            DomainId(self.id)
        }

        fn translate(&self, addr: u64, len: usize) -> Result<crate::hw::Sge> {
            if self.fail {
                Err(AccelError::Translation { addr, len })
            } else {
                Ok(crate::hw::Sge {
                    lkey: self.lkey,
                    addr,
                    len: len as u32,
                })
            }
        }
    }

    #[test]
    fn domain_qp_is_created_lazily_and_invalidated() {
        let (_backend, _module, mut ch) = setup(ModuleConfig {
            num_requests: 32,
            qp_per_domain: true,
            ..Default::default()
        });
        let domain = Arc::new(TestDomain {
            id: 7,
            lkey: 0x55,
            fail: false,
        });
        let src = pattern(128, 13);
        let mut dst = vec![0u8; 128];
        let dst_iov = IoVec::from_mut_slice(&mut dst);

        let (slot, cb) = cb_slot();
        ch.submit(vec![TaskRequest::copy(
            vec![IoVec::from_slice(&src)],
            vec![dst_iov],
        )
        .with_dst_domain(domain)
        .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);
        assert_eq!(&dst[..], &src[..]);
        assert_eq!(ch.devs[0].domain_qps.len(), 1);

        ch.domain_invalidated(DomainId(7));
        assert!(ch.devs[0].domain_qps.is_empty());
    }

    #[test]
    fn translation_failure_is_reported_synchronously() {
        let (_backend, _module, mut ch) = setup(small_cfg());
        let domain = Arc::new(TestDomain {
            id: 9,
            lkey: 0,
            fail: true,
        });
        let src = pattern(64, 14);
        let mut dst = vec![0u8; 64];
        let dst_iov = IoVec::from_mut_slice(&mut dst);

        let rc = ch.submit(vec![TaskRequest::copy(
            vec![IoVec::from_slice(&src)],
            vec![dst_iov],
        )
        .with_src_domain(domain)]);
        assert!(matches!(rc, Err(AccelError::Translation { .. })));
    }

    #[test]
    fn domain_translation_fills_lkey_cache() {
        let (_backend, module, mut ch) = setup(small_cfg());
        let key = test_key(&module);
        let domain = Arc::new(TestDomain {
            id: 3,
            lkey: 0x77,
            fail: false,
        });
        let cache = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let plain = pattern(512, 15);
        let mut cipher = vec![0u8; 512];
        let cipher_iov = IoVec::from_mut_slice(&mut cipher);

        let (slot, cb) = cb_slot();
        ch.submit(vec![TaskRequest::encrypt(
            vec![IoVec::from_slice(&plain)],
            vec![cipher_iov],
            key,
            512,
            0,
        )
        .with_src_domain(domain)
        .with_cached_lkey(Arc::clone(&cache))
        .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);
        assert_eq!(cache.load(Ordering::Relaxed), 0x77);
    }

    #[test]
    fn copy_crc32c_copies_and_generates() {
        let (_backend, _module, mut ch) = setup(small_cfg());
        let src = pattern(300, 12);
        let mut dst = vec![0u8; 300];
        let dst_iov = IoVec::from_mut_slice(&mut dst);
        let mut crc_out = 0u32;

        let (slot, cb) = cb_slot();
        ch.submit(vec![TaskRequest::copy_crc32c(
            vec![IoVec::from_slice(&src)],
            vec![dst_iov],
            &mut crc_out as *mut u32 as u64,
            0,
        )
        .with_callback(cb)])
            .unwrap();
        poll_until_set(&mut ch, &slot);
        assert_ok(&slot);
        assert_eq!(&dst[..], &src[..]);
        assert_eq!(crc_out, CASTAGNOLI.checksum(&src));
    }
}

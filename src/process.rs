//! Per-opcode submission paths: SGE composition and UMR/RDMA posting.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;

use crate::constants::{MAX_MKEYS_IN_TASK, MAX_SGE};
use crate::device::{Device, DeviceContext};
use crate::domain::{translate_addr, MemMap, MemoryDomain};
use crate::error::{AccelError, Result};
use crate::hw::Sge;
use crate::iov::{IoVec, IovCursor};
use crate::qp::QueuePair;
use crate::stats::DeviceStats;
use crate::task::{OpCode, QpSel, Task};
use crate::wqe::{
    bs_to_bs_selector, CryptoBsfAttr, SigBsfAttr, SigDomain, WQE_CTRL_CQ_UPDATE,
    WQE_CTRL_SMALL_FENCE, WQE_CTRL_STRONG_ORDERING,
};

/// Split the device into the task's QP, the shared context and the
/// stats counters.
fn split<'a>(
    dev: &'a mut Device,
    sel: QpSel,
) -> Result<(&'a mut QueuePair, &'a Arc<DeviceContext>, &'a mut DeviceStats)> {
    let Device {
        ctx,
        qp,
        domain_qps,
        stats,
        ..
    } = dev;
    let qp = match sel {
        QpSel::Default => qp,
        QpSel::Domain(id) => domain_qps
            .get_mut(&id)
            .ok_or_else(|| AccelError::WrPost("domain qp is gone".into()))?,
    };
    Ok((qp, ctx, stats))
}

/// SQ-level post errors are fatal for the task.
fn wr_post(e: AccelError) -> AccelError {
    match e {
        AccelError::ResourceExhausted(m) => AccelError::WrPost(m.into()),
        AccelError::TooManySge(n) => AccelError::WrPost(format!("{n} scatter entries")),
        e => e,
    }
}

/// Compose up to 16 SGEs covering `block_len` bytes from the cursor,
/// translating each range unless a pre-resolved `lkey` is given.
/// Returns the leftover byte count when the SGE cap cuts the walk short.
fn fill_block_sge(
    out: &mut Vec<Sge>,
    iovs: &[IoVec],
    cur: &mut IovCursor,
    domain: Option<&Arc<dyn MemoryDomain>>,
    map: &MemMap,
    lkey: u32,
    block_len: u32,
) -> Result<u32> {
    let mut remaining = block_len as usize;
    let mut count = 0;
    while remaining > 0 && count < MAX_SGE && !cur.is_exhausted(iovs) {
        let size = remaining.min(cur.cur_remnant(iovs));
        let addr = cur.cur_addr(iovs);
        let sge = if lkey == 0 {
            translate_addr(addr, size, domain, map)?
        } else {
            Sge {
                lkey,
                addr,
                len: size as u32,
            }
        };
        debug!("\t sge[{count}] lkey {}, addr {addr:#x}, len {size}", sge.lkey);
        out.push(sge);
        cur.advance(iovs, size);
        count += 1;
        remaining -= size;
    }
    if count == 0 {
        return Err(AccelError::InvalidInput("empty scatter walk".into()));
    }
    Ok(remaining as u32)
}

/// Pre-resolve a single translation key for a payload that lives in one
/// contiguous range, consulting the submitter's cache slot when a
/// domain is present.
fn single_lkey(
    cache: Option<&Arc<std::sync::atomic::AtomicU32>>,
    domain: Option<&Arc<dyn MemoryDomain>>,
    iov0: IoVec,
    map: &MemMap,
) -> Result<u32> {
    if let (Some(cache), Some(_)) = (cache, domain) {
        let cached = cache.load(Ordering::Relaxed);
        if cached != 0 {
            return Ok(cached);
        }
    }
    let sge = translate_addr(iov0.addr, iov0.len, domain, map)?;
    if let (Some(cache), Some(_)) = (cache, domain) {
        cache.store(sge.lkey, Ordering::Relaxed);
    }
    Ok(sge.lkey)
}

fn copy_one(
    task: &mut Task,
    qp: &mut QueuePair,
    map: &MemMap,
    wr_id: u64,
    flags: u8,
) -> Result<()> {
    // One request moves one contiguous source range into one contiguous
    // destination range; either side may end at this boundary.
    let req_len = task
        .src
        .cur_remnant(&task.src_iovs)
        .min(task.dst.cur_remnant(&task.dst_iovs));
    let src_sge = translate_addr(
        task.src.cur_addr(&task.src_iovs),
        req_len,
        task.src_domain.as_ref(),
        map,
    )?;
    let dst_sge = translate_addr(
        task.dst.cur_addr(&task.dst_iovs),
        req_len,
        task.dst_domain.as_ref(),
        map,
    )?;
    qp.rdma_write(&[src_sge], dst_sge.addr, dst_sge.lkey, wr_id, flags)
        .map_err(wr_post)?;
    task.src.advance(&task.src_iovs, req_len);
    task.dst.advance(&task.dst_iovs, req_len);
    Ok(())
}

pub(crate) fn copy_task_process(task: &mut Task, dev: &mut Device) -> Result<()> {
    let (qp, ctx, stats) = split(dev, task.qp_sel)?;
    stats.tasks += 1;
    task.num_wrs = 0;
    let num_ops = task.num_ops.min(task.remaining_reqs());
    debug_assert!(num_ops > 0);

    for i in 0..num_ops {
        let (wr_id, flags) = if i + 1 == num_ops {
            (task.token, WQE_CTRL_CQ_UPDATE)
        } else {
            (0, 0)
        };
        copy_one(task, qp, &ctx.map, wr_id, flags)?;
        stats.rdma_writes += 1;
        debug_assert!(qp.wrs_submitted < qp.max_wrs);
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
        task.num_submitted_reqs += 1;
    }
    debug!("end, copy task, token {:#x}", task.token);
    Ok(())
}

pub(crate) fn crypto_task_process(task: &mut Task, dev: &mut Device) -> Result<()> {
    let (qp, ctx, stats) = split(dev, task.qp_sel)?;
    let num_ops = task.remaining_reqs().min(task.num_ops);
    if num_ops == 0 {
        return Err(AccelError::InvalidInput("no requests to submit".into()));
    }
    stats.tasks += 1;

    let bs = task.block_size;
    let ops_len = task.blocks_per_req as usize * num_ops as usize * bs as usize;
    let mut src_lkey = 0;
    let mut dst_lkey = 0;
    if ops_len <= task.src.cur_remnant(&task.src_iovs) || task.src_iovs.len() == 1 {
        src_lkey = single_lkey(
            task.cached_lkey.as_ref(),
            task.src_domain.as_ref(),
            task.src_iovs[0],
            &ctx.map,
        )?;
    }
    if !task.inplace
        && (ops_len <= task.dst.cur_remnant(&task.dst_iovs) || task.dst_iovs.len() == 1)
    {
        dst_lkey = single_lkey(
            task.cached_lkey.as_ref(),
            task.dst_domain.as_ref(),
            task.dst_iovs[0],
            &ctx.map,
        )?;
    }

    let mut blocks_processed = u32::from(task.num_submitted_reqs) * u32::from(task.blocks_per_req);
    let mut iv = task.iv.wrapping_add(u64::from(blocks_processed));
    let dek = task
        .key
        .as_ref()
        .ok_or_else(|| AccelError::InvalidInput("missing crypto key".into()))?
        .dek_for(&ctx.name)?;
    let bs_selector = bs_to_bs_selector(bs);

    debug!(
        "begin, crypto task, reqs: total {}, submitted {}, completed {}",
        task.num_reqs, task.num_submitted_reqs, task.num_completed_reqs
    );
    task.num_wrs = 0;
    let mut klms: Vec<(Vec<Sge>, Vec<Sge>)> = Vec::with_capacity(usize::from(num_ops));
    for i in 0..num_ops {
        let req_len = if task.num_submitted_reqs + i + 1 == task.num_reqs {
            // The last request may consume fewer blocks.
            (u32::from(task.num_blocks) - blocks_processed) * bs
        } else {
            u32::from(task.blocks_per_req) * bs
        };
        let mut src_sges = Vec::new();
        let remaining = fill_block_sge(
            &mut src_sges,
            &task.src_iovs,
            &mut task.src,
            task.src_domain.as_ref(),
            &ctx.map,
            src_lkey,
            req_len,
        )?;
        if remaining != 0 {
            return Err(AccelError::InvalidInput(
                "source scatter list too fragmented for one request".into(),
            ));
        }
        let mut dst_sges = Vec::new();
        if !task.inplace {
            let remaining = fill_block_sge(
                &mut dst_sges,
                &task.dst_iovs,
                &mut task.dst,
                task.dst_domain.as_ref(),
                &ctx.map,
                dst_lkey,
                req_len,
            )?;
            if remaining != 0 {
                return Err(AccelError::InvalidInput(
                    "destination scatter list too fragmented for one request".into(),
                ));
            }
        }
        let cattr = CryptoBsfAttr {
            enc_order: task.enc_order,
            bs_selector,
            xts_iv: iv,
            dek_obj_id: dek.0,
            keytag: 0,
        };
        let mkey = ctx.mkey_pool()?.id(task.mkeys[usize::from(i)]);
        qp.umr_configure_crypto(mkey, &src_sges, u64::from(req_len), &cattr)
            .map_err(wr_post)?;
        blocks_processed += u32::from(task.blocks_per_req);
        iv = iv.wrapping_add(u64::from(task.blocks_per_req));
        stats.umrs += 1;
        debug_assert!(qp.wrs_submitted < qp.max_wrs);
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
        klms.push((src_sges, dst_sges));
    }

    // XTS is applied while the data moves from the MKey into the plain
    // SGEs; the first RDMA after the UMR chain carries a small fence.
    let mut fence = WQE_CTRL_SMALL_FENCE;
    for i in 0..num_ops {
        let last = i + 1 == num_ops;
        let (wr_id, flags) = if last {
            (task.token, fence | WQE_CTRL_CQ_UPDATE)
        } else {
            (0, fence)
        };
        let (src_sges, dst_sges) = &klms[usize::from(i)];
        let sges = if task.inplace { src_sges } else { dst_sges };
        let mkey = ctx.mkey_pool()?.id(task.mkeys[usize::from(i)]);
        qp.rdma_read(sges, 0, mkey, wr_id, flags).map_err(wr_post)?;
        fence = 0;
        stats.rdma_reads += 1;
        task.num_submitted_reqs += 1;
        debug_assert!(task.num_submitted_reqs <= task.num_reqs);
        debug_assert!(qp.wrs_submitted < qp.max_wrs);
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
    }
    debug!(
        "end, crypto task, reqs: total {}, submitted {}, completed {}",
        task.num_reqs, task.num_submitted_reqs, task.num_completed_reqs
    );
    Ok(())
}

pub(crate) fn crypto_and_crc_task_process(task: &mut Task, dev: &mut Device) -> Result<()> {
    let (qp, ctx, stats) = split(dev, task.qp_sel)?;
    let num_ops = task.remaining_reqs().min(task.num_ops);
    if num_ops == 0 {
        return Err(AccelError::InvalidInput("no requests to submit".into()));
    }
    stats.tasks += 1;

    let encrypt = task.op == OpCode::Encrypt;
    let sig_domain = if encrypt {
        SigDomain::Wire
    } else {
        SigDomain::Memory
    };
    let bs = task.block_size;
    let ops_len = task.blocks_per_req as usize * num_ops as usize * bs as usize;
    let mut src_lkey = 0;
    let mut dst_lkey = 0;
    if ops_len <= task.src.cur_remnant(&task.src_iovs) || task.src_iovs.len() == 1 {
        src_lkey = single_lkey(
            task.cached_lkey.as_ref(),
            task.src_domain.as_ref(),
            task.src_iovs[0],
            &ctx.map,
        )?;
    }
    if !task.inplace
        && (ops_len <= task.dst.cur_remnant(&task.dst_iovs) || task.dst_iovs.len() == 1)
    {
        dst_lkey = single_lkey(
            task.cached_lkey.as_ref(),
            task.dst_domain.as_ref(),
            task.dst_iovs[0],
            &ctx.map,
        )?;
    }

    let mut blocks_processed = u32::from(task.num_submitted_reqs) * u32::from(task.blocks_per_req);
    let mut iv = task.iv.wrapping_add(u64::from(blocks_processed));
    let dek = task
        .key
        .as_ref()
        .ok_or_else(|| AccelError::InvalidInput("missing crypto key".into()))?
        .dek_for(&ctx.name)?;
    let bs_selector = bs_to_bs_selector(bs);
    let psv_idx = task
        .psv
        .ok_or_else(|| AccelError::InvalidInput("missing psv".into()))?;
    let psv = ctx.psv_pool()?.entry(psv_idx);

    debug!(
        "begin, crypto and crc task, reqs: total {}, submitted {}, completed {}",
        task.num_reqs, task.num_submitted_reqs, task.num_completed_reqs
    );
    task.num_wrs = 0;
    let mut klms: Vec<(Vec<Sge>, Vec<Sge>)> = Vec::with_capacity(usize::from(num_ops));
    for i in 0..num_ops {
        let init_signature = task.num_submitted_reqs + i == 0;
        let last_overall = task.num_submitted_reqs + i + 1 == task.num_reqs;
        let req_len = if last_overall {
            (u32::from(task.num_blocks) - blocks_processed) * bs
        } else {
            u32::from(task.blocks_per_req) * bs
        };
        let mut src_sges = Vec::new();
        let remaining = fill_block_sge(
            &mut src_sges,
            &task.src_iovs,
            &mut task.src,
            task.src_domain.as_ref(),
            &ctx.map,
            src_lkey,
            req_len,
        )?;
        if remaining != 0 {
            return Err(AccelError::InvalidInput(
                "source scatter list too fragmented for one request".into(),
            ));
        }
        let mut dst_sges = Vec::new();
        if !task.inplace {
            let remaining = fill_block_sge(
                &mut dst_sges,
                &task.dst_iovs,
                &mut task.dst,
                task.dst_domain.as_ref(),
                &ctx.map,
                dst_lkey,
                req_len,
            )?;
            if remaining != 0 {
                return Err(AccelError::InvalidInput(
                    "destination scatter list too fragmented for one request".into(),
                ));
            }
        }

        // Strip-decrypt keeps the signature on the memory side: the
        // expected CRC rides as one more translation entry and the MKey
        // length grows past the raw data.
        let mut umr_sges = src_sges.clone();
        let mut umr_len = u64::from(req_len);
        if last_overall && !encrypt {
            if umr_sges.len() >= MAX_SGE {
                return Err(AccelError::InvalidInput(
                    "no scatter entry left for the crc tail".into(),
                ));
            }
            psv.preload_crc(task.crc_expected.unwrap_or(0) ^ u32::MAX);
            umr_sges.push(Sge {
                lkey: psv.crc_lkey,
                addr: psv.crc_addr(),
                len: 4,
            });
            umr_len += 4;
        }

        let entry = ctx.sig_mkey_pool()?.entry(task.mkeys[usize::from(i)]);
        let sattr = SigBsfAttr {
            seed: task.seed ^ u32::MAX,
            psv_index: psv.index,
            domain: sig_domain,
            sigerr_count: entry.sigerr_count.load(Ordering::Relaxed),
            raw_data_size: req_len,
            init: init_signature,
            check_gen: last_overall,
        };
        let cattr = CryptoBsfAttr {
            enc_order: task.enc_order,
            bs_selector,
            xts_iv: iv,
            dek_obj_id: dek.0,
            keytag: 0,
        };
        qp.umr_configure_sig_crypto(entry.id, &umr_sges, umr_len, &sattr, &cattr)
            .map_err(wr_post)?;
        blocks_processed += u32::from(task.blocks_per_req);
        iv = iv.wrapping_add(u64::from(task.blocks_per_req));
        stats.umrs += 1;
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
        klms.push((src_sges, dst_sges));
    }

    if psv.error.load(Ordering::Relaxed) {
        qp.set_psv(psv.index, task.seed ^ u32::MAX).map_err(wr_post)?;
        psv.error.store(false, Ordering::Relaxed);
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
    }

    let mut fence = WQE_CTRL_SMALL_FENCE;
    for i in 0..num_ops {
        let last = i + 1 == num_ops;
        let last_overall = task.num_submitted_reqs + 1 == task.num_reqs;
        let (src_sges, dst_sges) = &klms[usize::from(i)];
        let mut sges = if task.inplace {
            src_sges.clone()
        } else {
            dst_sges.clone()
        };
        // Append-encrypt lands the generated CRC right after the
        // ciphertext, into the PSV scratch.
        if last && last_overall && encrypt {
            if sges.len() >= MAX_SGE {
                return Err(AccelError::InvalidInput(
                    "no scatter entry left for the crc tail".into(),
                ));
            }
            sges.push(Sge {
                lkey: psv.crc_lkey,
                addr: psv.crc_addr(),
                len: 4,
            });
        }
        let (wr_id, flags) = if last {
            (task.token, fence | WQE_CTRL_CQ_UPDATE)
        } else {
            (0, fence)
        };
        let mkey = ctx.sig_mkey_pool()?.entry(task.mkeys[usize::from(i)]).id;
        qp.rdma_read(&sges, 0, mkey, wr_id, flags).map_err(wr_post)?;
        // Successive signature updates must not be reordered.
        fence = WQE_CTRL_STRONG_ORDERING;
        stats.rdma_reads += 1;
        task.num_submitted_reqs += 1;
        debug_assert!(task.num_submitted_reqs <= task.num_reqs);
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
    }
    debug!(
        "end, crypto and crc task, reqs: total {}, submitted {}, completed {}",
        task.num_reqs, task.num_submitted_reqs, task.num_completed_reqs
    );
    Ok(())
}

pub(crate) fn crc_task_process(task: &mut Task, dev: &mut Device) -> Result<()> {
    dev.stats.tasks += 1;
    debug!(
        "begin, crc task, reqs: total {}, submitted {}, completed {}",
        task.num_reqs, task.num_submitted_reqs, task.num_completed_reqs
    );
    if task.num_reqs == 1 {
        crc_task_process_one_req(task, dev)
    } else {
        crc_task_process_multi_req(task, dev)
    }
}

fn crc_task_process_one_req(task: &mut Task, dev: &mut Device) -> Result<()> {
    let (qp, ctx, stats) = split(dev, task.qp_sel)?;
    let num_ops = task.remaining_reqs().min(task.num_ops);
    if num_ops == 0 {
        return Err(AccelError::InvalidInput("no requests to submit".into()));
    }
    let check_op = task.op == OpCode::CheckCrc32c;

    let mut src_sges = Vec::new();
    let remaining = fill_block_sge(
        &mut src_sges,
        &task.src_iovs,
        &mut task.src,
        task.src_domain.as_ref(),
        &ctx.map,
        0,
        task.nbytes,
    )?;
    if remaining != 0 {
        return Err(AccelError::InvalidInput(
            "source scatter list too fragmented for one request".into(),
        ));
    }
    let mut dst_sges = Vec::new();
    if !task.inplace {
        let remaining = fill_block_sge(
            &mut dst_sges,
            &task.dst_iovs,
            &mut task.dst,
            task.dst_domain.as_ref(),
            &ctx.map,
            0,
            task.nbytes,
        )?;
        if remaining != 0 {
            return Err(AccelError::InvalidInput(
                "destination scatter list too fragmented for one request".into(),
            ));
        }
    }

    let psv_idx = task
        .psv
        .ok_or_else(|| AccelError::InvalidInput("missing psv".into()))?;
    let psv = ctx.psv_pool()?.entry(psv_idx);
    let entry = ctx.sig_mkey_pool()?.entry(task.mkeys[0]);
    let sattr = SigBsfAttr {
        seed: task.seed ^ u32::MAX,
        psv_index: psv.index,
        domain: SigDomain::Wire,
        sigerr_count: entry.sigerr_count.load(Ordering::Relaxed),
        raw_data_size: task.nbytes,
        init: true,
        check_gen: true,
    };
    qp.umr_configure_sig(entry.id, &src_sges, u64::from(task.nbytes), &sattr)
        .map_err(wr_post)?;
    stats.umrs += 1;
    qp.wrs_submitted += 1;
    task.num_wrs = 1;

    let mut sges = if task.inplace { src_sges } else { dst_sges };
    // The init path reserved a scatter entry for the CRC tail.
    if sges.len() >= MAX_SGE {
        return Err(AccelError::InvalidInput(
            "no scatter entry left for the crc tail".into(),
        ));
    }
    if check_op {
        psv.preload_crc(task.crc_expected.unwrap_or(0) ^ u32::MAX);
    }
    sges.push(Sge {
        lkey: psv.crc_lkey,
        addr: psv.crc_addr(),
        len: 4,
    });

    if psv.error.load(Ordering::Relaxed) {
        qp.set_psv(psv.index, task.seed ^ u32::MAX).map_err(wr_post)?;
        psv.error.store(false, Ordering::Relaxed);
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
    }

    let flags = WQE_CTRL_STRONG_ORDERING | WQE_CTRL_CQ_UPDATE;
    if check_op {
        // Check runs in place; the expected value rides in the tail.
        debug_assert!(task.inplace);
        qp.rdma_write(&sges, 0, entry.id, task.token, flags)
            .map_err(wr_post)?;
        stats.rdma_writes += 1;
    } else {
        qp.rdma_read(&sges, 0, entry.id, task.token, flags)
            .map_err(wr_post)?;
        stats.rdma_reads += 1;
    }
    task.num_submitted_reqs += 1;
    qp.wrs_submitted += 1;
    task.num_wrs += 1;
    Ok(())
}

/// Compose the translation entries of one signature UMR: walk the UMR
/// side up to 16 entries, splitting at the boundaries of the RDMA-side
/// scatter list so each later RDMA stays within its own 16-SGE cap.
fn crc_fill_umr_sge(
    out: &mut Vec<Sge>,
    umr_iovs: &[IoVec],
    umr_cur: &mut IovCursor,
    domain: Option<&Arc<dyn MemoryDomain>>,
    map: &MemMap,
    align_iovs: &[IoVec],
    align_cur: &mut IovCursor,
) -> Result<u64> {
    let u_budget = umr_cur.remaining_cnt(umr_iovs).min(MAX_SGE);
    let a_budget = align_cur.remaining_cnt(align_iovs).min(MAX_SGE);
    let mut u_idx = umr_cur.idx;
    let mut u_off = umr_cur.offset;
    let mut a_idx = align_cur.idx;
    let mut a_off = align_cur.offset;
    let mut u_used = 0;
    let mut a_used = 0;
    let mut umr_len = 0u64;

    while u_used < u_budget && a_used < a_budget {
        let u_rem = umr_iovs[u_idx].len - u_off;
        let a_rem = align_iovs[a_idx].len - a_off;
        let addr = umr_iovs[u_idx].addr + u_off as u64;
        let klm_len;
        if u_rem == a_rem {
            klm_len = u_rem;
            u_idx += 1;
            u_off = 0;
            a_idx += 1;
            a_off = 0;
            a_used += 1;
        } else if u_rem < a_rem {
            klm_len = u_rem;
            u_idx += 1;
            u_off = 0;
            a_off += klm_len;
        } else {
            // The UMR entry spans several RDMA-side entries; stop at the
            // RDMA SGE budget.
            let mut left = u_rem - a_rem;
            a_idx += 1;
            a_off = 0;
            a_used += 1;
            while left > 0 && a_used < a_budget {
                let a_len = align_iovs[a_idx].len;
                if left == a_len {
                    a_idx += 1;
                    a_used += 1;
                    left = 0;
                } else if left < a_len {
                    a_off = left;
                    left = 0;
                } else {
                    left -= a_len;
                    a_idx += 1;
                    a_used += 1;
                }
            }
            klm_len = u_rem - left;
            u_off += klm_len;
            if u_off == umr_iovs[u_idx].len {
                u_idx += 1;
                u_off = 0;
            }
        }
        let sge = translate_addr(addr, klm_len, domain, map)?;
        out.push(sge);
        umr_len += klm_len as u64;
        u_used += 1;
    }

    umr_cur.advance(umr_iovs, umr_len as usize);
    align_cur.advance(align_iovs, umr_len as usize);
    Ok(umr_len)
}

fn crc_task_process_multi_req(task: &mut Task, dev: &mut Device) -> Result<()> {
    let (qp, ctx, stats) = split(dev, task.qp_sel)?;
    let num_ops = task.remaining_reqs().min(task.num_ops);
    if num_ops == 0 {
        return Err(AccelError::InvalidInput("no requests to submit".into()));
    }
    let check_op = task.op == OpCode::CheckCrc32c;
    let psv_idx = task
        .psv
        .ok_or_else(|| AccelError::InvalidInput("missing psv".into()))?;
    let psv = ctx.psv_pool()?.entry(psv_idx);

    // The UMR fill and the RDMA fill advance their scatter cursors
    // independently, so the in-place path walks the source three times
    // and needs private copies for the first two walks.
    let mut umr_cur_copy = task.src;
    let mut align_cur = if task.inplace { task.src } else { task.dst };

    let mut sig_init = task.num_submitted_reqs == 0;
    let mut sig_check_gen = false;
    let mut umr_lens = [0u64; MAX_MKEYS_IN_TASK];
    task.num_wrs = 0;

    for i in 0..usize::from(num_ops) {
        let umr_exhausted = if task.inplace {
            umr_cur_copy.is_exhausted(&task.src_iovs)
        } else {
            task.src.is_exhausted(&task.src_iovs)
        };
        if umr_exhausted {
            // The last request carries only the CRC; it reuses the MKey
            // of the previous request and posts no UMR.
            debug_assert_eq!(task.num_completed_reqs + i as u16 + 1, task.num_reqs);
            break;
        }
        let mut klms = Vec::new();
        let umr_len = if task.inplace {
            crc_fill_umr_sge(
                &mut klms,
                &task.src_iovs,
                &mut umr_cur_copy,
                task.src_domain.as_ref(),
                &ctx.map,
                &task.src_iovs,
                &mut align_cur,
            )?
        } else {
            crc_fill_umr_sge(
                &mut klms,
                &task.src_iovs,
                &mut task.src,
                task.src_domain.as_ref(),
                &ctx.map,
                &task.dst_iovs,
                &mut align_cur,
            )?
        };
        umr_lens[i] = umr_len;
        let now_exhausted = if task.inplace {
            umr_cur_copy.is_exhausted(&task.src_iovs)
        } else {
            task.src.is_exhausted(&task.src_iovs)
        };
        if now_exhausted {
            // The tail-only request may be postponed to a later batch;
            // keep what it needs on the task.
            task.last_umr_len = umr_len;
            task.last_mkey_idx = i as u16;
            sig_check_gen = true;
        }
        let entry = ctx.sig_mkey_pool()?.entry(task.mkeys[i]);
        let sattr = SigBsfAttr {
            seed: task.seed ^ u32::MAX,
            psv_index: psv.index,
            domain: SigDomain::Wire,
            sigerr_count: entry.sigerr_count.load(Ordering::Relaxed),
            raw_data_size: umr_len as u32,
            init: sig_init,
            check_gen: sig_check_gen,
        };
        qp.umr_configure_sig(entry.id, &klms, umr_len, &sattr)
            .map_err(wr_post)?;
        sig_init = false;
        stats.umrs += 1;
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
    }

    if psv.error.load(Ordering::Relaxed) {
        qp.set_psv(psv.index, task.seed ^ u32::MAX).map_err(wr_post)?;
        psv.error.store(false, Ordering::Relaxed);
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
    }

    let mut fence = WQE_CTRL_SMALL_FENCE;
    for i in 0..usize::from(num_ops) - 1 {
        let mut klms = Vec::new();
        let remaining = if task.inplace {
            fill_block_sge(
                &mut klms,
                &task.src_iovs,
                &mut task.src,
                task.src_domain.as_ref(),
                &ctx.map,
                0,
                umr_lens[i] as u32,
            )?
        } else {
            fill_block_sge(
                &mut klms,
                &task.dst_iovs,
                &mut task.dst,
                task.dst_domain.as_ref(),
                &ctx.map,
                0,
                umr_lens[i] as u32,
            )?
        };
        if remaining != 0 {
            return Err(AccelError::InvalidInput(
                "scatter list too fragmented for one request".into(),
            ));
        }
        let mkey = ctx.sig_mkey_pool()?.entry(task.mkeys[i]).id;
        if check_op {
            debug_assert!(task.inplace);
            qp.rdma_write(&klms, 0, mkey, 0, fence).map_err(wr_post)?;
            stats.rdma_writes += 1;
        } else {
            qp.rdma_read(&klms, 0, mkey, 0, fence).map_err(wr_post)?;
            stats.rdma_reads += 1;
        }
        fence = WQE_CTRL_STRONG_ORDERING;
        task.num_submitted_reqs += 1;
        qp.wrs_submitted += 1;
        task.num_wrs += 1;
    }

    let i = usize::from(num_ops) - 1;
    let rdma_exhausted = if task.inplace {
        task.src.is_exhausted(&task.src_iovs)
    } else {
        task.dst.is_exhausted(&task.dst_iovs)
    };
    let mut klms = Vec::new();
    let umr_offset;
    if rdma_exhausted {
        // Only the CRC is left; it lives past the previous MKey's data.
        umr_offset = task.last_umr_len;
    } else {
        umr_offset = 0;
        task.last_mkey_idx = i as u16;
        let remaining = if task.inplace {
            fill_block_sge(
                &mut klms,
                &task.src_iovs,
                &mut task.src,
                task.src_domain.as_ref(),
                &ctx.map,
                0,
                umr_lens[i] as u32,
            )?
        } else {
            fill_block_sge(
                &mut klms,
                &task.dst_iovs,
                &mut task.dst,
                task.dst_domain.as_ref(),
                &ctx.map,
                0,
                umr_lens[i] as u32,
            )?
        };
        if remaining != 0 {
            return Err(AccelError::InvalidInput(
                "scatter list too fragmented for one request".into(),
            ));
        }
    }
    if task.num_completed_reqs + num_ops == task.num_reqs {
        if klms.len() >= MAX_SGE {
            return Err(AccelError::InvalidInput(
                "no scatter entry left for the crc tail".into(),
            ));
        }
        if check_op {
            psv.preload_crc(task.crc_expected.unwrap_or(0) ^ u32::MAX);
        }
        klms.push(Sge {
            lkey: psv.crc_lkey,
            addr: psv.crc_addr(),
            len: 4,
        });
    }
    let flags = fence | WQE_CTRL_CQ_UPDATE;
    let mkey = ctx
        .sig_mkey_pool()?
        .entry(task.mkeys[usize::from(task.last_mkey_idx)])
        .id;
    if check_op {
        debug_assert!(task.inplace);
        qp.rdma_write(&klms, umr_offset, mkey, task.token, flags)
            .map_err(wr_post)?;
        stats.rdma_writes += 1;
    } else {
        qp.rdma_read(&klms, umr_offset, mkey, task.token, flags)
            .map_err(wr_post)?;
        stats.rdma_reads += 1;
    }
    task.num_submitted_reqs += 1;
    qp.wrs_submitted += 1;
    task.num_wrs += 1;
    Ok(())
}

//! NIC vendor interface.
//!
//! The engine builds WQEs itself; the backend owns the hardware objects
//! (CQs, QPs, MKeys, PSVs, DEKs), consumes doorbell rings and produces
//! raw CQEs. `crate::emulated` implements this in software.

use crate::error::Result;
use crate::sq::SqMem;

/// Scatter/gather element.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub lkey: u32,
    pub addr: u64,
    pub len: u32,
}

/// Per-device crypto capabilities.
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptoCaps {
    pub single_block_le_tweak: bool,
    pub multi_block_be_tweak: bool,
    pub multi_block_le_tweak: bool,
    pub tweak_inc_64: bool,
    pub crc32c: bool,
}

/// One NIC as reported by the backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    /// `None` when the device has no crypto engine at all.
    pub crypto: Option<CryptoCaps>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QpId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CqId(pub u32);

/// NIC-resident data encryption key handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DekId(pub u32);

/// Flavors of MKeys the backend can create. The BSF space reserved on the
/// key determines which transforms a UMR may attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkeyFlavor {
    /// Plain translation key covering host memory (the device map key).
    Direct,
    Crypto,
    Signature,
    SignatureCrypto,
}

#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr {
    /// Send queue length in 64-byte building blocks, power of two.
    pub wqe_cnt: u16,
    pub max_sge: u16,
    /// Batch CQE generation: only the last WQE of a batch is signaled.
    pub siglast: bool,
}

/// CQE delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeStatus {
    Ok,
    /// The device detected a signature mismatch.
    SigErr,
    /// WR flushed because the QP is in error state.
    WrFlush,
    /// Any other completion error, carrying the syndrome.
    Err(u8),
}

impl CqeStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, CqeStatus::Ok)
    }

    pub fn is_flush(self) -> bool {
        matches!(self, CqeStatus::WrFlush)
    }
}

/// Raw completion as delivered by the device, before the send queue
/// resolves the `wr_id` and reclaims slots.
#[derive(Debug, Clone, Copy)]
pub struct RawCqe {
    pub qp: QpId,
    /// Producer index of the first building block of the completed WQE.
    pub wqe_counter: u16,
    pub status: CqeStatus,
    /// MKey id for signature-error CQEs, 0 otherwise.
    pub mkey: u32,
}

/// Operations the NIC vendor library must provide.
pub trait NicBackend: Send + Sync {
    fn devices(&self) -> Vec<DeviceInfo>;

    fn create_cq(&self, dev: &str, cqe_cnt: u16) -> Result<CqId>;
    fn destroy_cq(&self, cq: CqId);

    /// Create a send-only QP whose WQEs the device reads from `sq_mem`.
    fn create_qp(&self, dev: &str, cq: CqId, attr: &QpInitAttr, sq_mem: SqMem) -> Result<QpId>;
    fn destroy_qp(&self, qp: QpId);
    /// Move the QP to error state, flushing outstanding WQEs.
    fn qp_set_error_state(&self, qp: QpId);

    fn create_mkey(&self, dev: &str, flavor: MkeyFlavor) -> Result<u32>;
    fn destroy_mkey(&self, dev: &str, mkey: u32);

    fn create_psv(&self, dev: &str) -> Result<u32>;
    fn destroy_psv(&self, dev: &str, psv_index: u32);

    /// Import key material as a device DEK. The caller wipes its copy.
    fn create_dek(&self, dev: &str, key_material: &[u8], tweak_upper_lba: bool) -> Result<DekId>;
    fn destroy_dek(&self, dev: &str, dek: DekId);

    /// The UAR write. The device picks up everything published through
    /// the doorbell record of the QP's send queue memory.
    fn ring_doorbell(&self, qp: QpId);

    /// Drain up to `max` CQEs into `out`.
    fn poll_cq(&self, cq: CqId, out: &mut Vec<RawCqe>, max: usize) -> usize;
}

//! WQE segment layouts.
//!
//! Every work request is assembled from 16-byte segments placed into
//! 64-byte send queue building blocks. The bitfield chunks below define
//! the exact wire layout; the send queue writes them and the device
//! parses them back.

use bilge::prelude::*;

use crate::hw::Sge;

/// Request a CQE for this WQE.
pub(crate) const WQE_CTRL_CQ_UPDATE: u8 = 0x08;
/// Wait for previous WQEs on the same QP to be scheduled.
pub(crate) const WQE_CTRL_SMALL_FENCE: u8 = 0x20;
/// Wait for previous WQEs on the same QP to fully complete.
pub(crate) const WQE_CTRL_STRONG_ORDERING: u8 = 0x40;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub(crate) enum WqeOpcode {
    Nop = 0x00,
    RdmaWrite = 0x08,
    RdmaRead = 0x10,
    SetPsv = 0x20,
    Umr = 0x25,
}

impl WqeOpcode {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Nop),
            0x08 => Some(Self::RdmaWrite),
            0x10 => Some(Self::RdmaRead),
            0x20 => Some(Self::SetPsv),
            0x25 => Some(Self::Umr),
            _ => None,
        }
    }
}

/// XTS encryption order carried in the crypto BSF.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub(crate) enum EncOrder {
    /// Raw data lives in memory, the wire side is encrypted.
    #[default]
    EncryptedRawWire = 0,
    /// Raw data lives on the wire, the memory side is encrypted.
    EncryptedRawMemory = 1,
}

/// Which side of the transfer carries the signature.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub(crate) enum SigDomain {
    Wire = 0,
    Memory = 1,
}

/// Crypto attributes attached to a UMR.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CryptoBsfAttr {
    pub(crate) enc_order: EncOrder,
    pub(crate) bs_selector: u8,
    pub(crate) xts_iv: u64,
    pub(crate) dek_obj_id: u32,
    pub(crate) keytag: u32,
}

/// Signature attributes attached to a UMR.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SigBsfAttr {
    pub(crate) seed: u32,
    pub(crate) psv_index: u32,
    pub(crate) domain: SigDomain,
    pub(crate) sigerr_count: u32,
    /// Size of the data covered by the transaction signature, without
    /// the signature itself.
    pub(crate) raw_data_size: u32,
    pub(crate) init: bool,
    pub(crate) check_gen: bool,
}

pub(crate) fn bs_to_bs_selector(bs: u32) -> u8 {
    match bs {
        512 => 1,
        520 => 2,
        4048 => 6,
        4096 => 3,
        4160 => 4,
        _ => 0,
    }
}

pub(crate) fn bs_selector_to_size(sel: u8) -> Option<u32> {
    match sel {
        1 => Some(512),
        2 => Some(520),
        6 => Some(4048),
        3 => Some(4096),
        4 => Some(4160),
        _ => None,
    }
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct CtrlChunk0 {
    pub opcode: u8,
    pub ds: u8,
    pub wr_idx: u16,
    pub qp_num: u32,
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct CtrlChunk1 {
    pub flags: u8,
    pub opmod: u8,
    reserved0: u16,
    pub imm: u32,
}

/// Control segment, the first 16 bytes of every WQE.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CtrlSeg {
    c0: CtrlChunk0,
    c1: CtrlChunk1,
}

impl CtrlSeg {
    pub(crate) fn new(
        opcode: WqeOpcode,
        ds: u8,
        wr_idx: u16,
        qp_num: u32,
        flags: u8,
        imm: u32,
    ) -> Self {
        Self {
            c0: CtrlChunk0::new(opcode as u8, ds, wr_idx, qp_num),
            c1: CtrlChunk1::new(flags, 0, 0, imm),
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; 16] {
        chunks_to_bytes(&[u64::from(self.c0), u64::from(self.c1)])
    }

    pub(crate) fn from_bytes(bytes: [u8; 16]) -> Self {
        let c = bytes_to_chunks::<2>(&bytes);
        Self {
            c0: CtrlChunk0::from(c[0]),
            c1: CtrlChunk1::from(c[1]),
        }
    }

    pub(crate) fn opcode(&self) -> Option<WqeOpcode> {
        WqeOpcode::from_u8(self.c0.opcode())
    }

    pub(crate) fn ds(&self) -> u8 {
        self.c0.ds()
    }

    pub(crate) fn wr_idx(&self) -> u16 {
        self.c0.wr_idx()
    }

    pub(crate) fn flags(&self) -> u8 {
        self.c1.flags()
    }
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct RaddrChunk1 {
    pub rkey: u32,
    reserved0: u32,
}

/// Remote address segment of an RDMA WQE.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RaddrSeg {
    raddr: u64,
    c1: RaddrChunk1,
}

impl RaddrSeg {
    pub(crate) fn new(raddr: u64, rkey: u32) -> Self {
        Self {
            raddr,
            c1: RaddrChunk1::new(rkey, 0),
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; 16] {
        chunks_to_bytes(&[self.raddr, u64::from(self.c1)])
    }

    pub(crate) fn from_bytes(bytes: [u8; 16]) -> Self {
        let c = bytes_to_chunks::<2>(&bytes);
        Self {
            raddr: c[0],
            c1: RaddrChunk1::from(c[1]),
        }
    }

    pub(crate) fn raddr(&self) -> u64 {
        self.raddr
    }

    pub(crate) fn rkey(&self) -> u32 {
        self.c1.rkey()
    }
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct DataChunk0 {
    pub byte_count: u32,
    pub lkey: u32,
}

/// Scatter/gather data segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataSeg {
    c0: DataChunk0,
    addr: u64,
}

impl DataSeg {
    pub(crate) fn new(sge: &Sge) -> Self {
        Self {
            c0: DataChunk0::new(sge.len, sge.lkey),
            addr: sge.addr,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; 16] {
        chunks_to_bytes(&[u64::from(self.c0), self.addr])
    }

    pub(crate) fn from_bytes(bytes: [u8; 16]) -> Self {
        let c = bytes_to_chunks::<2>(&bytes);
        Self {
            c0: DataChunk0::from(c[0]),
            addr: c[1],
        }
    }

    pub(crate) fn sge(&self) -> Sge {
        Sge {
            lkey: self.c0.lkey(),
            addr: self.addr,
            len: self.c0.byte_count(),
        }
    }
}

/// UMR control flag: a 64-byte crypto BSF follows the translation entries.
pub(crate) const UMR_FLAG_CRYPTO_BSF: u8 = 0x01;
/// UMR control flag: a 64-byte signature BSF follows the translation entries.
pub(crate) const UMR_FLAG_SIG_BSF: u8 = 0x02;

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct UmrCtrlChunk0 {
    pub flags: u8,
    reserved0: u8,
    pub klm_count: u16,
    pub bsf_octowords: u16,
    reserved1: u16,
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct UmrCtrlChunk1 {
    pub mkey_id: u32,
    reserved0: u32,
}

/// UMR control segment, 48 bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UmrCtrlSeg {
    c0: UmrCtrlChunk0,
    c1: UmrCtrlChunk1,
}

impl UmrCtrlSeg {
    pub(crate) const SIZE: usize = 48;

    pub(crate) fn new(mkey_id: u32, klm_count: u16, flags: u8) -> Self {
        let bsf_octowords = (u16::from(flags & UMR_FLAG_CRYPTO_BSF != 0)
            + u16::from(flags & UMR_FLAG_SIG_BSF != 0))
            * 4;
        Self {
            c0: UmrCtrlChunk0::new(flags, 0, klm_count, bsf_octowords, 0),
            c1: UmrCtrlChunk1::new(mkey_id, 0),
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&u64::from(self.c0).to_le_bytes());
        out[8..16].copy_from_slice(&u64::from(self.c1).to_le_bytes());
        out
    }

    pub(crate) fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let c = bytes_to_chunks::<6>(&bytes);
        Self {
            c0: UmrCtrlChunk0::from(c[0]),
            c1: UmrCtrlChunk1::from(c[1]),
        }
    }

    pub(crate) fn flags(&self) -> u8 {
        self.c0.flags()
    }

    pub(crate) fn klm_count(&self) -> u16 {
        self.c0.klm_count()
    }

    pub(crate) fn mkey_id(&self) -> u32 {
        self.c1.mkey_id()
    }
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct MkeyCtxChunk0 {
    pub access_flags: u8,
    reserved0: u8,
    reserved1: u16,
    reserved2: u32,
}

/// MKey context segment, 64 bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MkeyCtxSeg {
    c0: MkeyCtxChunk0,
    len: u64,
}

impl MkeyCtxSeg {
    pub(crate) const SIZE: usize = 64;

    pub(crate) fn new(umr_len: u64) -> Self {
        Self {
            c0: MkeyCtxChunk0::new(0, 0, 0, 0),
            len: umr_len,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&u64::from(self.c0).to_le_bytes());
        out[8..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub(crate) fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let c = bytes_to_chunks::<8>(&bytes);
        Self {
            c0: MkeyCtxChunk0::from(c[0]),
            len: c[1],
        }
    }

    pub(crate) fn umr_len(&self) -> u64 {
        self.len
    }
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct CryptoBsfChunk0 {
    pub size_type: u8,
    pub enc_order: u8,
    pub bs_selector: u8,
    reserved0: u8,
    pub raw_data_size: u32,
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct CryptoBsfChunk1 {
    pub dek_obj_id: u32,
    pub keytag: u32,
}

/// Inline crypto BSF, 64 bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CryptoBsfSeg {
    c0: CryptoBsfChunk0,
    c1: CryptoBsfChunk1,
    xts_iv: u64,
}

impl CryptoBsfSeg {
    pub(crate) const SIZE: usize = 64;

    pub(crate) fn new(attr: &CryptoBsfAttr, raw_data_size: u32) -> Self {
        Self {
            c0: CryptoBsfChunk0::new(0, attr.enc_order as u8, attr.bs_selector, 0, raw_data_size),
            c1: CryptoBsfChunk1::new(attr.dek_obj_id, attr.keytag),
            xts_iv: attr.xts_iv,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&u64::from(self.c0).to_le_bytes());
        out[8..16].copy_from_slice(&u64::from(self.c1).to_le_bytes());
        out[16..24].copy_from_slice(&self.xts_iv.to_le_bytes());
        out
    }

    pub(crate) fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let c = bytes_to_chunks::<8>(&bytes);
        Self {
            c0: CryptoBsfChunk0::from(c[0]),
            c1: CryptoBsfChunk1::from(c[1]),
            xts_iv: c[2],
        }
    }

    pub(crate) fn enc_order(&self) -> EncOrder {
        if self.c0.enc_order() == 0 {
            EncOrder::EncryptedRawWire
        } else {
            EncOrder::EncryptedRawMemory
        }
    }

    pub(crate) fn bs_selector(&self) -> u8 {
        self.c0.bs_selector()
    }

    pub(crate) fn dek_obj_id(&self) -> u32 {
        self.c1.dek_obj_id()
    }

    pub(crate) fn xts_iv(&self) -> u64 {
        self.xts_iv
    }
}

/// Signature BSF flag bits.
pub(crate) const SIG_BSF_INIT: u8 = 0x01;
pub(crate) const SIG_BSF_CHECK_GEN: u8 = 0x02;

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct SigBsfChunk0 {
    pub size_type: u8,
    pub domain: u8,
    pub flags: u8,
    reserved0: u8,
    pub raw_data_size: u32,
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct SigBsfChunk1 {
    pub seed: u32,
    pub psv_index: u32,
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct SigBsfChunk2 {
    pub sigerr_count: u32,
    reserved0: u32,
}

/// Inline signature BSF, 64 bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SigBsfSeg {
    c0: SigBsfChunk0,
    c1: SigBsfChunk1,
    c2: SigBsfChunk2,
}

impl SigBsfSeg {
    pub(crate) const SIZE: usize = 64;

    pub(crate) fn new(attr: &SigBsfAttr) -> Self {
        let flags =
            u8::from(attr.init) * SIG_BSF_INIT + u8::from(attr.check_gen) * SIG_BSF_CHECK_GEN;
        Self {
            c0: SigBsfChunk0::new(0, attr.domain as u8, flags, 0, attr.raw_data_size),
            c1: SigBsfChunk1::new(attr.seed, attr.psv_index),
            c2: SigBsfChunk2::new(attr.sigerr_count, 0),
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&u64::from(self.c0).to_le_bytes());
        out[8..16].copy_from_slice(&u64::from(self.c1).to_le_bytes());
        out[16..24].copy_from_slice(&u64::from(self.c2).to_le_bytes());
        out
    }

    pub(crate) fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let c = bytes_to_chunks::<8>(&bytes);
        Self {
            c0: SigBsfChunk0::from(c[0]),
            c1: SigBsfChunk1::from(c[1]),
            c2: SigBsfChunk2::from(c[2]),
        }
    }

    pub(crate) fn domain(&self) -> SigDomain {
        if self.c0.domain() == 0 {
            SigDomain::Wire
        } else {
            SigDomain::Memory
        }
    }

    pub(crate) fn init(&self) -> bool {
        self.c0.flags() & SIG_BSF_INIT != 0
    }

    pub(crate) fn check_gen(&self) -> bool {
        self.c0.flags() & SIG_BSF_CHECK_GEN != 0
    }

    pub(crate) fn seed(&self) -> u32 {
        self.c1.seed()
    }

    pub(crate) fn psv_index(&self) -> u32 {
        self.c1.psv_index()
    }

    pub(crate) fn raw_data_size(&self) -> u32 {
        self.c0.raw_data_size()
    }
}

#[bitsize(64)]
#[derive(Clone, Copy, DebugBits, FromBits)]
struct SetPsvChunk0 {
    pub psv_index: u32,
    pub transient_seed: u32,
}

/// SET_PSV segment resetting in-flight signature state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SetPsvSeg {
    c0: SetPsvChunk0,
}

impl SetPsvSeg {
    pub(crate) fn new(psv_index: u32, transient_seed: u32) -> Self {
        Self {
            c0: SetPsvChunk0::new(psv_index, transient_seed),
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; 16] {
        chunks_to_bytes(&[u64::from(self.c0), 0])
    }

    pub(crate) fn from_bytes(bytes: [u8; 16]) -> Self {
        let c = bytes_to_chunks::<2>(&bytes);
        Self {
            c0: SetPsvChunk0::from(c[0]),
        }
    }

    pub(crate) fn psv_index(&self) -> u32 {
        self.c0.psv_index()
    }

    pub(crate) fn transient_seed(&self) -> u32 {
        self.c0.transient_seed()
    }
}

fn chunks_to_bytes(chunks: &[u64; 2]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&chunks[0].to_le_bytes());
    out[8..].copy_from_slice(&chunks[1].to_le_bytes());
    out
}

fn bytes_to_chunks<const N: usize>(bytes: &[u8]) -> [u64; N] {
    let mut out = [0u64; N];
    for (i, chunk) in out.iter_mut().enumerate() {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
        *chunk = u64::from_le_bytes(b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_seg_round_trip() {
        let seg = CtrlSeg::new(WqeOpcode::RdmaRead, 5, 0x1234, 42, WQE_CTRL_CQ_UPDATE, 0);
        let decoded = CtrlSeg::from_bytes(seg.to_bytes());
        assert_eq!(decoded.opcode(), Some(WqeOpcode::RdmaRead));
        assert_eq!(decoded.ds(), 5);
        assert_eq!(decoded.wr_idx(), 0x1234);
        assert_eq!(decoded.flags(), WQE_CTRL_CQ_UPDATE);
    }

    #[test]
    fn sig_bsf_round_trip() {
        let attr = SigBsfAttr {
            seed: 0xdead_beef,
            psv_index: 7,
            domain: SigDomain::Memory,
            sigerr_count: 3,
            raw_data_size: 4096,
            init: true,
            check_gen: false,
        };
        let decoded = SigBsfSeg::from_bytes(SigBsfSeg::new(&attr).to_bytes());
        assert_eq!(decoded.seed(), 0xdead_beef);
        assert_eq!(decoded.psv_index(), 7);
        assert_eq!(decoded.domain(), SigDomain::Memory);
        assert!(decoded.init());
        assert!(!decoded.check_gen());
        assert_eq!(decoded.raw_data_size(), 4096);
    }

    #[test]
    fn block_size_selectors() {
        for bs in [512, 520, 4048, 4096, 4160] {
            let sel = bs_to_bs_selector(bs);
            assert_ne!(sel, 0);
            assert_eq!(bs_selector_to_size(sel), Some(bs));
        }
        assert_eq!(bs_to_bs_selector(1024), 0);
    }
}

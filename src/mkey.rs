//! Preallocated MKey and PSV pools.
//!
//! All pool objects are created once at module init and cycle between
//! the free list and at most one owning task. Bulk checkout succeeds
//! atomically or not at all.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::domain::MemMap;
use crate::error::{AccelError, Result};
use crate::hw::{MkeyFlavor, NicBackend};

/// Pool of crypto-enabled indirect MKeys.
pub(crate) struct CryptoMkeyPool {
    ids: Box<[u32]>,
    free: Mutex<Vec<u16>>,
}

impl CryptoMkeyPool {
    pub(crate) fn create(
        backend: &dyn NicBackend,
        dev: &str,
        count: u32,
        flavor: MkeyFlavor,
    ) -> Result<Self> {
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(backend.create_mkey(dev, flavor)?);
        }
        let free = (0..count as u16).rev().collect();
        Ok(Self {
            ids: ids.into_boxed_slice(),
            free: Mutex::new(free),
        })
    }

    pub(crate) fn get_bulk(&self, n: usize, out: &mut Vec<u16>) -> Result<()> {
        let mut free = self.free.lock();
        if free.len() < n {
            return Err(AccelError::ResourceExhausted("crypto mkey pool"));
        }
        let at = free.len() - n;
        out.extend(free.drain(at..));
        Ok(())
    }

    pub(crate) fn put_bulk(&self, keys: &[u16]) {
        self.free.lock().extend_from_slice(keys);
    }

    pub(crate) fn id(&self, idx: u16) -> u32 {
        self.ids[usize::from(idx)]
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn size(&self) -> usize {
        self.ids.len()
    }
}

/// Signature MKey with its locally shadowed error state. The shadow is
/// embedded in the pool entry; the ordered id map below is only walked
/// on the SIGERR path.
pub(crate) struct SigMkey {
    pub(crate) id: u32,
    /// Bumped on every SIGERR CQE, fed back into the next signature UMR.
    pub(crate) sigerr_count: AtomicU32,
    /// Latch cleared when the owning task completes.
    pub(crate) sigerr: AtomicBool,
}

pub(crate) struct SigMkeyPool {
    entries: Box<[SigMkey]>,
    free: Mutex<Vec<u16>>,
    by_id: BTreeMap<u32, u16>,
}

impl SigMkeyPool {
    pub(crate) fn create(
        backend: &dyn NicBackend,
        dev: &str,
        count: u32,
        crypto_enabled: bool,
    ) -> Result<Self> {
        let flavor = if crypto_enabled {
            MkeyFlavor::SignatureCrypto
        } else {
            MkeyFlavor::Signature
        };
        let mut entries = Vec::with_capacity(count as usize);
        let mut by_id = BTreeMap::new();
        for idx in 0..count as u16 {
            let id = backend.create_mkey(dev, flavor)?;
            entries.push(SigMkey {
                id,
                sigerr_count: AtomicU32::new(1),
                sigerr: AtomicBool::new(false),
            });
            by_id.insert(id, idx);
        }
        let free = (0..count as u16).rev().collect();
        Ok(Self {
            entries: entries.into_boxed_slice(),
            free: Mutex::new(free),
            by_id,
        })
    }

    pub(crate) fn get_bulk(&self, n: usize, out: &mut Vec<u16>) -> Result<()> {
        let mut free = self.free.lock();
        if free.len() < n {
            return Err(AccelError::ResourceExhausted("signature mkey pool"));
        }
        let at = free.len() - n;
        out.extend(free.drain(at..));
        Ok(())
    }

    pub(crate) fn put_bulk(&self, keys: &[u16]) {
        self.free.lock().extend_from_slice(keys);
    }

    pub(crate) fn entry(&self, idx: u16) -> &SigMkey {
        &self.entries[usize::from(idx)]
    }

    /// Resolve a SIGERR CQE's MKey id to its pool entry.
    pub(crate) fn resolve(&self, mkey_id: u32) -> Option<&SigMkey> {
        self.by_id.get(&mkey_id).map(|&idx| self.entry(idx))
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn size(&self) -> usize {
        self.entries.len()
    }
}

/// 4-byte CRC scratch the device writes through DMA.
struct CrcScratch(Box<UnsafeCell<u32>>);

// Written by the device only while the owning task is in flight on its
// single-threaded channel; the engine reads it after the completion.
#[allow(unsafe_code)]
unsafe impl Send for CrcScratch {}
#[allow(unsafe_code)]
unsafe impl Sync for CrcScratch {}

/// PSV wrapper: the NIC object index, the DMA-mapped CRC scratch and the
/// stale-state latch.
pub(crate) struct Psv {
    pub(crate) index: u32,
    /// Set when the last use left the NIC's view of this PSV stale; the
    /// next user must issue SET_PSV before its signature WRs.
    pub(crate) error: AtomicBool,
    scratch: CrcScratch,
    pub(crate) crc_lkey: u32,
}

#[allow(unsafe_code)]
impl Psv {
    pub(crate) fn crc_addr(&self) -> u64 {
        self.scratch.0.get() as u64
    }

    pub(crate) fn read_crc(&self) -> u32 {
        unsafe { std::ptr::read_volatile(self.scratch.0.get()) }
    }

    pub(crate) fn preload_crc(&self, value: u32) {
        unsafe { std::ptr::write_volatile(self.scratch.0.get(), value) }
    }
}

pub(crate) struct PsvPool {
    entries: Box<[Psv]>,
    free: Mutex<Vec<u16>>,
}

impl PsvPool {
    pub(crate) fn create(
        backend: &dyn NicBackend,
        dev: &str,
        count: u32,
        map: &MemMap,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let index = backend.create_psv(dev)?;
            let scratch = CrcScratch(Box::new(UnsafeCell::new(0)));
            let crc_lkey = map.translate(scratch.0.get() as u64, 4)?.lkey;
            entries.push(Psv {
                index,
                error: AtomicBool::new(false),
                scratch,
                crc_lkey,
            });
        }
        let free = (0..count as u16).rev().collect();
        Ok(Self {
            entries: entries.into_boxed_slice(),
            free: Mutex::new(free),
        })
    }

    pub(crate) fn get(&self) -> Result<u16> {
        self.free
            .lock()
            .pop()
            .ok_or(AccelError::ResourceExhausted("psv pool"))
    }

    pub(crate) fn put(&self, idx: u16) {
        self.free.lock().push(idx);
    }

    pub(crate) fn entry(&self, idx: u16) -> &Psv {
        &self.entries[usize::from(idx)]
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// Clear a signature MKey's latch, reporting whether it had fired.
pub(crate) fn take_sigerr(mkey: &SigMkey) -> bool {
    mkey.sigerr.swap(false, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedNic;
    use crate::hw::DeviceInfo;

    fn backend() -> EmulatedNic {
        EmulatedNic::new(vec![DeviceInfo {
            name: "mlx5_0".into(),
            crypto: Some(Default::default()),
        }])
    }

    #[test]
    fn bulk_checkout_is_atomic() {
        let nic = backend();
        let pool = CryptoMkeyPool::create(&nic, "mlx5_0", 4, MkeyFlavor::Crypto).unwrap();
        let mut keys = Vec::new();
        pool.get_bulk(3, &mut keys).unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(pool.free_count(), 1);

        let mut more = Vec::new();
        assert!(pool.get_bulk(2, &mut more).is_err());
        assert!(more.is_empty());
        assert_eq!(pool.free_count(), 1);

        pool.put_bulk(&keys);
        assert_eq!(pool.free_count(), pool.size());
    }

    #[test]
    fn sig_pool_resolves_by_nic_id() {
        let nic = backend();
        let pool = SigMkeyPool::create(&nic, "mlx5_0", 8, false).unwrap();
        let mut keys = Vec::new();
        pool.get_bulk(1, &mut keys).unwrap();
        let id = pool.entry(keys[0]).id;
        let entry = pool.resolve(id).unwrap();
        assert_eq!(entry.id, id);
        assert!(pool.resolve(0xdead_0000).is_none());
        pool.put_bulk(&keys);
        assert_eq!(pool.free_count(), pool.size());
    }

    #[test]
    fn psv_scratch_round_trips() {
        let nic = backend();
        let map = MemMap::new(0x11);
        let pool = PsvPool::create(&nic, "mlx5_0", 2, &map).unwrap();
        let idx = pool.get().unwrap();
        let psv = pool.entry(idx);
        psv.preload_crc(0xaabb_ccdd);
        assert_eq!(psv.read_crc(), 0xaabb_ccdd);
        assert_eq!(psv.crc_lkey, 0x11);
        pool.put(idx);
        assert_eq!(pool.free_count(), 2);
    }
}

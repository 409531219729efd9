//! Memory domains and address translation.

use std::sync::Arc;

use crate::error::{AccelError, Result};
use crate::hw::Sge;

/// Identity of a memory domain. Domain-indexed QPs are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u64);

/// A registered memory domain able to translate virtual ranges into
/// device-addressable SGEs.
pub trait MemoryDomain: Send + Sync {
    fn id(&self) -> DomainId;

    /// Translate one contiguous range. The translation must cover the
    /// whole range with a single SGE.
    ///
    /// # Errors
    ///
    /// Returns `AccelError::Translation` when the domain does not map
    /// the range.
    fn translate(&self, addr: u64, len: usize) -> Result<Sge>;
}

/// Device-level translation map. Host memory registered with the device
/// at module init resolves through a single direct key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemMap {
    lkey: u32,
}

impl MemMap {
    pub(crate) fn new(lkey: u32) -> Self {
        Self { lkey }
    }

    pub(crate) fn translate(&self, addr: u64, len: usize) -> Result<Sge> {
        if len == 0 {
            return Err(AccelError::Translation { addr, len });
        }
        Ok(Sge {
            lkey: self.lkey,
            addr,
            len: len as u32,
        })
    }
}

/// Translate through the task's memory domain when one is present, else
/// through the device map.
pub(crate) fn translate_addr(
    addr: u64,
    len: usize,
    domain: Option<&Arc<dyn MemoryDomain>>,
    map: &MemMap,
) -> Result<Sge> {
    match domain {
        Some(domain) => {
            let sge = domain.translate(addr, len)?;
            if sge.len as usize != len {
                log::error!("domain translation split the range, addr {addr:#x}, len {len}");
                return Err(AccelError::Translation { addr, len });
            }
            Ok(sge)
        }
        None => map.translate(addr, len),
    }
}

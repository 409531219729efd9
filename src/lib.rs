//! Data-plane acceleration engine for Mellanox-class NICs.
//!
//! Executes composable offload tasks (memory copy, AES-XTS
//! encrypt/decrypt, CRC-32C generate/check and the fused
//! encrypt+CRC / CRC+decrypt variants) by binding indirect MKeys
//! through UMR work requests and driving local RDMA READ/WRITE
//! transfers whose source or destination is such an MKey. The cipher
//! and signature run inside the NIC as a side effect of the transfer.
//!
//! The engine is cooperative and single-threaded per [`Channel`]:
//! submit tasks, then call [`Channel::poll`] until their callbacks
//! fire. Hardware access goes through the [`hw::NicBackend`] trait;
//! [`emulated::EmulatedNic`] provides an in-process software device.

mod channel;
mod config;
mod constants;
mod device;
mod domain;
pub mod emulated;
mod error;
pub mod hw;
mod iov;
mod mkey;
mod module;
mod process;
mod qp;
mod sq;
mod stats;
mod task;
mod wqe;

pub use channel::Channel;
pub use config::{ConfigError, ModuleConfig};
pub use domain::{DomainId, MemoryDomain};
pub use error::{AccelError, Result};
pub use iov::IoVec;
pub use module::{AccelModule, TweakMode};
pub use sq::SqMem;
pub use stats::DeviceStats;
pub use task::{CryptoKey, OpCode, TaskCallback, TaskRequest};

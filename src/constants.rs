use std::time::Duration;

/// Maximum number of scatter/gather entries in a single work request.
pub(crate) const MAX_SGE: usize = 16;
/// Maximum number of MKeys a task may hold at once.
pub(crate) const MAX_MKEYS_IN_TASK: usize = 16;
/// Completion queue entries drained per poll invocation.
pub(crate) const MAX_WC: usize = 32;

/// Size of one send queue building block in bytes.
pub(crate) const WQE_BB_SIZE: usize = 64;
/// Send queue building blocks provisioned per accounted work request.
/// The largest WQE pair (a 16-SGE UMR carrying both BSFs plus a 16-SGE
/// RDMA) occupies 13 blocks, so 8 blocks per WR keeps the ring from
/// underrunning while `wrs_submitted` stays below `max_wrs`.
pub(crate) const SQ_BB_PER_WR: u16 = 8;

pub(crate) const DEFAULT_QP_SIZE: u16 = 256;
pub(crate) const DEFAULT_CQ_SIZE: u16 = 256;
pub(crate) const DEFAULT_NUM_REQUESTS: u32 = 2048;

/// Delay before retrying a failed queue pair rebuild.
pub(crate) const RECOVER_RETRY_DELAY: Duration = Duration::from_millis(10);

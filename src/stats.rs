//! Per-device counters.

use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DeviceStats {
    pub tasks: u64,
    pub umrs: u64,
    pub rdma_reads: u64,
    pub rdma_writes: u64,
    pub polls: u64,
    pub idle_polls: u64,
    pub completions: u64,
    pub nomem: u64,
    pub recoveries: u64,
}

impl DeviceStats {
    pub(crate) fn merge(&mut self, other: &DeviceStats) {
        self.tasks += other.tasks;
        self.umrs += other.umrs;
        self.rdma_reads += other.rdma_reads;
        self.rdma_writes += other.rdma_writes;
        self.polls += other.polls;
        self.idle_polls += other.idle_polls;
        self.completions += other.completions;
        self.nomem += other.nomem;
        self.recoveries += other.recoveries;
    }
}

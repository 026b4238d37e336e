use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::BindingId;
use crate::DeviceId;
use crate::WorkloadId;

/// Scheduler-wide counters, shared by every context.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) devices: AtomicU64,
    pub(crate) workloads: AtomicU64,
    pub(crate) bindings: AtomicU64,
    pub(crate) anonymous_submissions: AtomicU64,
    pub(crate) rate_limit_events: AtomicU64,
    pub(crate) submitted: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) withdrawn: AtomicU64,
}

impl Counters {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn sub(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SchedulerStats {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        SchedulerStats {
            device_contexts: read(&self.devices),
            workload_contexts: read(&self.workloads),
            bindings: read(&self.bindings),
            rate_limited_bindings: 0,
            anonymous_submissions: read(&self.anonymous_submissions),
            rate_limit_events: read(&self.rate_limit_events),
            submitted: read(&self.submitted),
            dispatched: read(&self.dispatched),
            completed: read(&self.completed),
            failed: read(&self.failed),
            withdrawn: read(&self.withdrawn),
        }
    }
}

/// Point-in-time view of scheduler-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    /// Live device contexts, including ones still being torn down.
    pub device_contexts: u64,
    pub workload_contexts: u64,
    pub bindings: u64,
    /// Bindings that currently carry an admission cap.
    pub rate_limited_bindings: u64,
    /// Requests submitted without a workload context.
    pub anonymous_submissions: u64,
    /// Times a binding was newly capped or had its cap tightened.
    pub rate_limit_events: u64,
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    /// Requests failed because their device was deregistered.
    pub withdrawn: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub device: DeviceId,
    pub busy_percent: u32,
    pub prev_full: bool,
    pub last_full: bool,
    pub in_flight: u64,
    /// Per-priority latency budgets, in microseconds of service time.
    pub budgets: Vec<u64>,
    pub bindings: Vec<BindingStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingStats {
    pub binding: BindingId,
    pub workload: Option<WorkloadId>,
    pub priority: usize,
    pub queue_length: usize,
    pub issued: u64,
    /// `None` while the binding is not rate limited.
    pub max_throughput: Option<u64>,
    pub interval_avg_latency_us: u64,
    pub interval_transactions: u64,
    pub rate_limit_events: u64,
}

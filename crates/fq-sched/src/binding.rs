use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use tracing::debug;

use crate::device::DeviceContext;
use crate::lifecycle::RefCount;
use crate::lifecycle::Release;
use crate::request::QueuedIo;
use crate::stats::BindingStats;
use crate::stats::Counters;
use crate::sync::lock;
use crate::workload::WorkloadContext;
use crate::DeviceId;
use crate::WorkloadId;

pub type BindingId = u64;

/// Per-(workload, device) queue and accounting.
///
/// Owners are the device's binding list, the workload's binding list (when
/// there is a workload), and any task briefly holding it to enqueue. The
/// binding keeps its device and workload alive until it is torn down.
pub struct Binding {
    id: BindingId,
    device: Arc<DeviceContext>,
    workload: Option<Arc<WorkloadContext>>,
    priority: usize,
    refs: RefCount,
    state: Mutex<BindingState>,
}

pub(crate) struct BindingState {
    pub(crate) queue: VecDeque<QueuedIo>,
    /// Requests dispatched since the last balance.
    pub(crate) issued: u64,
    /// Admission cap per balance interval, `None` when not rate limited.
    pub(crate) max_throughput: Option<u64>,
    pub(crate) avg_latency_us: u64,
    pub(crate) transactions: u64,
    /// Snapshot of the two fields above taken by the last balance.
    pub(crate) interval_avg_latency_us: u64,
    pub(crate) interval_transactions: u64,
    pub(crate) rebalance: bool,
    pub(crate) linked_device: bool,
    pub(crate) linked_workload: bool,
    pub(crate) rate_limit_events: u64,
}

impl BindingState {
    pub(crate) fn new(linked_workload: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            issued: 0,
            max_throughput: None,
            avg_latency_us: 0,
            transactions: 0,
            interval_avg_latency_us: 0,
            interval_transactions: 0,
            rebalance: false,
            linked_device: true,
            linked_workload,
            rate_limit_events: 0,
        }
    }

    pub(crate) fn has_cap_room(&self) -> bool {
        self.max_throughput.map_or(true, |cap| self.issued < cap)
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        !self.has_cap_room()
    }

    fn record_latency(&mut self, latency_us: u64) {
        let n = u128::from(self.transactions);
        let total = u128::from(self.avg_latency_us) * n + u128::from(latency_us);
        self.avg_latency_us = u64::try_from(total / (n + 1)).unwrap_or(u64::MAX);
        self.transactions += 1;
    }

    /// Fails every queued request with a withdrawal error.
    pub(crate) fn withdraw_all(&mut self, device: DeviceId) -> u64 {
        let mut withdrawn = 0;
        while let Some(io) = self.queue.pop_front() {
            io.withdraw(device);
            withdrawn += 1;
        }
        withdrawn
    }
}

impl Binding {
    /// Creates a binding owned by its device list and, if present, its
    /// workload list. The caller links it into those lists.
    pub(crate) fn new(
        id: BindingId,
        device: Arc<DeviceContext>,
        workload: Option<Arc<WorkloadContext>>,
        priority: usize,
    ) -> Arc<Self> {
        device.refs().retain();
        if let Some(workload) = &workload {
            workload.refs().retain();
        }
        let links = if workload.is_some() { 2 } else { 1 };
        Counters::add(&device.counters().bindings, 1);
        debug!(
            binding = id,
            device = device.id(),
            workload = ?workload.as_ref().map(|w| w.id()),
            priority,
            "binding created"
        );
        let linked_workload = workload.is_some();
        Arc::new(Self {
            id,
            device,
            workload,
            priority,
            refs: RefCount::new("binding", links),
            state: Mutex::new(BindingState::new(linked_workload)),
        })
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    pub fn workload_id(&self) -> Option<WorkloadId> {
        self.workload.as_ref().map(|w| w.id())
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    pub(crate) fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub(crate) fn workload(&self) -> Option<&Arc<WorkloadContext>> {
        self.workload.as_ref()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BindingState> {
        lock(&self.state)
    }

    /// Whether the workload this binding belonged to has exited.
    pub(crate) fn is_orphaned(&self, state: &BindingState) -> bool {
        self.workload.is_some() && !state.linked_workload
    }

    #[cfg(test)]
    pub(crate) fn owners(&self) -> u32 {
        self.refs.owners()
    }

    pub(crate) fn retain(&self) {
        self.refs.retain();
    }

    /// Drops one owner, tearing the binding down if it was the last.
    /// Must be called without holding any scheduler lock.
    pub(crate) fn release(&self) {
        if self.refs.release() == Release::Destroy {
            self.destroy();
        }
    }

    fn destroy(&self) {
        let withdrawn = {
            let mut state = self.lock_state();
            assert!(
                !state.linked_device && !state.linked_workload,
                "binding {} torn down while still linked",
                self.id
            );
            state.withdraw_all(self.device.id())
        };
        let counters = self.device.counters();
        Counters::add(&counters.withdrawn, withdrawn);
        Counters::sub(&counters.bindings);
        debug!(binding = self.id, device = self.device.id(), "binding destroyed");
        if let Some(workload) = &self.workload {
            workload.release();
        }
        self.device.release();
    }

    pub(crate) fn complete_io(&self, dispatched_at: Duration, ok: bool) {
        let now = self.device.clock().now();
        let latency_us =
            u64::try_from(now.saturating_sub(dispatched_at).as_micros()).unwrap_or(u64::MAX);
        self.lock_state().record_latency(latency_us);
        self.device.note_completion(now);
        let counters = self.device.counters();
        if ok {
            Counters::add(&counters.completed, 1);
        } else {
            Counters::add(&counters.failed, 1);
        }
    }

    pub(crate) fn stats(&self) -> BindingStats {
        let state = self.lock_state();
        BindingStats {
            binding: self.id,
            workload: self.workload_id(),
            priority: self.priority,
            queue_length: state.queue.len(),
            issued: state.issued,
            max_throughput: state.max_throughput,
            interval_avg_latency_us: state.interval_avg_latency_us,
            interval_transactions: state.interval_transactions,
            rate_limit_events: state.rate_limit_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn running_average_latency() {
        let mut state = BindingState::new(true);
        state.record_latency(1_000);
        state.record_latency(3_000);
        state.record_latency(2_000);
        assert_eq!(state.transactions, 3);
        assert_eq!(state.avg_latency_us, 2_000);
    }

    #[test]
    fn cap_room() {
        let mut state = BindingState::new(false);
        state.issued = 1_000;
        assert!(state.has_cap_room());
        state.max_throughput = Some(1_000);
        assert!(state.is_exhausted());
        state.max_throughput = Some(1_001);
        assert!(state.has_cap_room());
    }
}

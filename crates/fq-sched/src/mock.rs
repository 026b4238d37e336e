//! In-memory doubles for driving the scheduler without real hardware.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::device::BlockDevice;
use crate::request::DispatchedIo;
use crate::sync::lock;
use crate::workload::Workload;
use crate::WorkloadId;

/// What the device saw for one forwarded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedIo {
    pub workload: Option<WorkloadId>,
    pub request_id: u64,
    pub dispatched_at: Duration,
}

/// Block device that keeps forwarded requests pending until the test
/// completes them.
#[derive(Debug, Default)]
pub struct MockDevice {
    pending: Mutex<VecDeque<DispatchedIo>>,
    forwarded: Mutex<Vec<ForwardedIo>>,
    idle_override: Mutex<Option<bool>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every request forwarded so far, in arrival order.
    pub fn forwarded(&self) -> Vec<ForwardedIo> {
        lock(&self.forwarded).clone()
    }

    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Forces what [`BlockDevice::report_idle`] returns; `None` derives it
    /// from the pending queue.
    pub fn set_idle(&self, idle: Option<bool>) {
        *lock(&self.idle_override) = idle;
    }

    /// Completes every pending request successfully.
    pub fn complete_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain(..).collect();
        let n = drained.len();
        drained.into_iter().for_each(DispatchedIo::succeed);
        n
    }

    /// Completes pending requests dispatched strictly before `cutoff`.
    pub fn complete_dispatched_before(&self, cutoff: Duration) -> usize {
        let ready: Vec<_> = {
            let mut pending = lock(&self.pending);
            let (ready, keep): (VecDeque<_>, VecDeque<_>) = pending
                .drain(..)
                .partition(|io| io.dispatched_at() < cutoff);
            *pending = keep;
            ready.into_iter().collect()
        };
        let n = ready.len();
        ready.into_iter().for_each(DispatchedIo::succeed);
        n
    }

    /// Fails the oldest pending request.
    pub fn fail_next(&self, reason: &str) -> Option<u64> {
        let io = lock(&self.pending).pop_front()?;
        let id = io.request().id;
        io.fail(reason);
        Some(id)
    }
}

impl BlockDevice for MockDevice {
    fn submit_request(&self, io: DispatchedIo) {
        lock(&self.forwarded).push(ForwardedIo {
            workload: io.workload(),
            request_id: io.request().id,
            dispatched_at: io.dispatched_at(),
        });
        lock(&self.pending).push_back(io);
    }

    fn report_idle(&self) -> bool {
        let forced = *lock(&self.idle_override);
        forced.unwrap_or_else(|| lock(&self.pending).is_empty())
    }
}

/// Fixed-priority workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestWorkload {
    pub id: WorkloadId,
    pub priority: i32,
}

impl TestWorkload {
    pub fn new(id: WorkloadId, priority: i32) -> Self {
        Self { id, priority }
    }
}

impl Workload for TestWorkload {
    fn id(&self) -> WorkloadId {
        self.id
    }

    fn priority_class(&self) -> i32 {
        self.priority
    }
}

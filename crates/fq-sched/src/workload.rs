use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tracing::debug;
use tracing::warn;

use crate::binding::Binding;
use crate::lifecycle::RefCount;
use crate::lifecycle::Release;
use crate::stats::Counters;
use crate::sync::lock;
use crate::WorkloadId;
use crate::MAX_PRIORITY;

/// A process (or similar) issuing I/O through the scheduler.
pub trait Workload: Send + Sync {
    fn id(&self) -> WorkloadId;

    /// Raw priority class. Values outside `0..=MAX_PRIORITY` are clamped.
    fn priority_class(&self) -> i32;
}

/// Scheduler-side state of a workload: its priority and its bindings.
pub struct WorkloadContext {
    id: WorkloadId,
    priority: usize,
    refs: RefCount,
    counters: Arc<Counters>,
    bindings: Mutex<Vec<Arc<Binding>>>,
}

impl WorkloadContext {
    /// Creates a context owned by the scheduler registry.
    pub(crate) fn new(id: WorkloadId, raw_priority: i32, counters: Arc<Counters>) -> Arc<Self> {
        let priority = clamp_priority(id, raw_priority);
        Counters::add(&counters.workloads, 1);
        debug!(workload = id, priority, "workload context created");
        Arc::new(Self {
            id,
            priority,
            refs: RefCount::new("workload", 1),
            counters,
            bindings: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> WorkloadId {
        self.id
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    pub fn binding_count(&self) -> usize {
        self.bindings().len()
    }

    pub(crate) fn refs(&self) -> &RefCount {
        &self.refs
    }

    pub(crate) fn bindings(&self) -> MutexGuard<'_, Vec<Arc<Binding>>> {
        lock(&self.bindings)
    }

    /// Must be called without holding any scheduler lock.
    pub(crate) fn release(&self) {
        if self.refs.release() == Release::Destroy {
            let linked = self.bindings().len();
            assert!(
                linked == 0,
                "workload {} torn down with {linked} linked bindings",
                self.id
            );
            Counters::sub(&self.counters.workloads);
            debug!(workload = self.id, "workload context destroyed");
        }
    }
}

fn clamp_priority(workload: WorkloadId, raw: i32) -> usize {
    let clamped = raw.clamp(0, MAX_PRIORITY as i32);
    if clamped != raw {
        warn!(
            workload,
            requested = raw,
            used = clamped,
            "priority class out of range, clamping"
        );
    }
    clamped as usize
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn priorities_are_clamped() {
        assert_eq!(clamp_priority(1, -4), 0);
        assert_eq!(clamp_priority(1, 0), 0);
        assert_eq!(clamp_priority(1, 7), 7);
        assert_eq!(clamp_priority(1, 10), 10);
        assert_eq!(clamp_priority(1, 42), 10);
    }

    #[test]
    fn context_counts_itself() {
        let counters = Arc::new(Counters::default());
        let workload = WorkloadContext::new(9, 3, Arc::clone(&counters));
        assert_eq!(workload.priority(), 3);
        assert_eq!(counters.snapshot().workload_contexts, 1);
        workload.release();
        assert_eq!(counters.snapshot().workload_contexts, 0);
        assert!(workload.refs().is_destroying());
    }
}

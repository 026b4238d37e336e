use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use error_stack::report;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use crate::balancer;
use crate::binding::Binding;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::dispatcher;
use crate::error::SchedError;
use crate::lifecycle::RefCount;
use crate::lifecycle::Release;
use crate::request::Completion;
use crate::request::DispatchedIo;
use crate::request::IoRequest;
use crate::request::QueuedIo;
use crate::stats::Counters;
use crate::stats::DeviceStats;
use crate::sync::lock;
use crate::DeviceId;
use crate::Result;
use crate::PRIORITY_CLASSES;

/// A block device the scheduler admits requests into.
pub trait BlockDevice: Send + Sync {
    /// Accepts an admitted request. The device must complete it eventually
    /// through [`DispatchedIo::complete`].
    fn submit_request(&self, io: DispatchedIo);

    /// Whether the device has nothing outstanding right now.
    fn report_idle(&self) -> bool;
}

/// Per-device scheduling state plus the handles of its two background tasks.
pub struct DeviceContext {
    id: DeviceId,
    device: Arc<dyn BlockDevice>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    refs: RefCount,
    closing: AtomicBool,
    pub(crate) wake: Notify,
    pub(crate) shutdown: CancellationToken,
    tasks_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<DeviceState>,
}

pub(crate) struct DeviceState {
    pub(crate) bindings: Vec<Arc<Binding>>,
    /// Per-priority service-time budgets, in microseconds.
    pub(crate) budgets: [u64; PRIORITY_CLASSES],
    pub(crate) busy_percent: u32,
    pub(crate) prev_full: bool,
    pub(crate) last_full: bool,
    /// Idle time accumulated since the last balance.
    pub(crate) idle_time: Duration,
    /// Start of the current idle stretch, `None` while requests are in flight.
    pub(crate) idle_since: Option<Duration>,
    pub(crate) in_flight: u64,
    pub(crate) last_balance: Duration,
    rr_cursor: usize,
}

impl DeviceState {
    pub(crate) fn new(now: Duration) -> Self {
        Self {
            bindings: Vec::new(),
            budgets: [0; PRIORITY_CLASSES],
            busy_percent: 0,
            prev_full: false,
            last_full: false,
            idle_time: Duration::ZERO,
            idle_since: Some(now),
            in_flight: 0,
            last_balance: now,
            rr_cursor: 0,
        }
    }

    /// Bindings in dispatch order; the starting point advances every round.
    pub(crate) fn rotation(&mut self) -> Vec<Arc<Binding>> {
        let n = self.bindings.len();
        if n == 0 {
            return Vec::new();
        }
        let start = self.rr_cursor % n;
        self.rr_cursor = (start + 1) % n;
        self.bindings[start..]
            .iter()
            .chain(&self.bindings[..start])
            .cloned()
            .collect()
    }

    pub(crate) fn note_dispatch(&mut self, now: Duration, count: u64) {
        if count == 0 {
            return;
        }
        if self.in_flight == 0 {
            if let Some(since) = self.idle_since.take() {
                self.idle_time += now.saturating_sub(since);
            }
        }
        self.in_flight += count;
    }

    fn note_completion(&mut self, now: Duration) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 {
            self.idle_since = Some(now);
        }
    }

    /// Moves the current idle stretch, if any, into `idle_time`.
    pub(crate) fn fold_idle(&mut self, now: Duration) {
        if let Some(since) = self.idle_since.as_mut() {
            self.idle_time += now.saturating_sub(*since);
            *since = now;
        }
    }
}

impl DeviceContext {
    /// Creates a context owned by the scheduler registry.
    pub(crate) fn new(
        id: DeviceId,
        device: Arc<dyn BlockDevice>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        let now = clock.now();
        Counters::add(&counters.devices, 1);
        Arc::new(Self {
            id,
            device,
            config,
            clock,
            counters,
            refs: RefCount::new("device", 1),
            closing: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            tasks_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            state: Mutex::new(DeviceState::new(now)),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn binding_count(&self) -> usize {
        self.lock_state().bindings.len()
    }

    pub fn stats(&self) -> DeviceStats {
        let state = self.lock_state();
        DeviceStats {
            device: self.id,
            busy_percent: state.busy_percent,
            prev_full: state.prev_full,
            last_full: state.last_full,
            in_flight: state.in_flight,
            budgets: state.budgets.to_vec(),
            bindings: state.bindings.iter().map(|b| b.stats()).collect(),
        }
    }

    pub fn rate_limited_bindings(&self) -> u64 {
        let state = self.lock_state();
        state
            .bindings
            .iter()
            .filter(|b| b.lock_state().max_throughput.is_some())
            .count() as u64
    }

    pub(crate) fn refs(&self) -> &RefCount {
        &self.refs
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn block_device(&self) -> &dyn BlockDevice {
        self.device.as_ref()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.state)
    }

    /// Wakes the dispatcher ahead of its next tick.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn note_completion(&self, now: Duration) {
        self.lock_state().note_completion(now);
    }

    /// Appends a request to `binding`'s queue.
    pub(crate) fn enqueue(
        &self,
        binding: &Binding,
        request: IoRequest,
    ) -> Result<Completion, SchedError> {
        let state = self.lock_state();
        let mut queue = binding.lock_state();
        if self.is_closing() || !queue.linked_device {
            return Err(report!(SchedError::withdrawn(self.id)));
        }
        let (io, completion) = QueuedIo::new(request);
        queue.queue.push_back(io);
        Counters::add(&self.counters.submitted, 1);
        if queue.rebalance {
            balancer::self_balance(self, &state, binding, &mut queue);
        }
        Ok(completion)
    }

    /// Finds the binding used for requests without a workload, adding a
    /// transient owner for the caller.
    pub(crate) fn retain_anonymous(&self) -> Option<Arc<Binding>> {
        let state = self.lock_state();
        let binding = state
            .bindings
            .iter()
            .find(|b| b.workload_id().is_none())?;
        binding.retain();
        Some(Arc::clone(binding))
    }

    pub(crate) fn link(&self, binding: Arc<Binding>) {
        self.lock_state().bindings.push(binding);
    }

    /// Marks the device as closing and stops both tasks.
    pub(crate) fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.shutdown.cancel();
        self.wake.notify_one();
    }

    /// Withdraws every queued request without unlinking any binding.
    pub(crate) fn drain_all(&self) -> u64 {
        let state = self.lock_state();
        let withdrawn: u64 = state
            .bindings
            .iter()
            .map(|b| b.lock_state().withdraw_all(self.id))
            .sum();
        Counters::add(&self.counters.withdrawn, withdrawn);
        withdrawn
    }

    /// Withdraws every queued request and unlinks all bindings from the
    /// device. The caller owns the returned device links.
    pub(crate) fn detach_all(&self) -> Vec<Arc<Binding>> {
        let mut state = self.lock_state();
        let bindings = std::mem::take(&mut state.bindings);
        let mut withdrawn = 0;
        for binding in &bindings {
            let mut queue = binding.lock_state();
            withdrawn += queue.withdraw_all(self.id);
            queue.linked_device = false;
        }
        Counters::add(&self.counters.withdrawn, withdrawn);
        bindings
    }

    /// Starts the dispatcher and balancer on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Registering the timers of one device twice panics.
    pub(crate) fn spawn_tasks(ctx: &Arc<Self>) -> Result<(), SchedError> {
        let handle = Handle::try_current().map_err(|e| {
            report!(SchedError::task_failed(format!(
                "no tokio runtime to run device {} tasks: {e}",
                ctx.id
            )))
        })?;
        assert!(
            !ctx.tasks_started.swap(true, Ordering::AcqRel),
            "device {} timers registered twice",
            ctx.id
        );
        let dispatcher = dispatcher::spawn(&handle, Arc::clone(ctx));
        let balancer = balancer::spawn(&handle, Arc::clone(ctx));
        lock(&ctx.tasks).extend([dispatcher, balancer]);
        Ok(())
    }

    pub(crate) async fn join_tasks(&self) -> Result<(), SchedError> {
        let handles = std::mem::take(&mut *lock(&self.tasks));
        let mut failure = None;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(device = self.id, error = %e, "device task did not finish cleanly");
                failure.get_or_insert_with(|| e.to_string());
            }
        }
        match failure {
            Some(reason) => Err(report!(SchedError::task_failed(reason))),
            None => Ok(()),
        }
    }

    /// Drops one owner, tearing the context down if it was the last.
    /// Must be called without holding any scheduler lock.
    pub(crate) fn release(&self) {
        if self.refs.release() == Release::Destroy {
            let linked = self.lock_state().bindings.len();
            assert!(
                linked == 0,
                "device {} torn down with {linked} linked bindings",
                self.id
            );
            Counters::sub(&self.counters.devices);
            info!(device = self.id, "device context destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::MockDevice;

    #[test]
    fn idle_accounting_tracks_gaps_between_work() {
        let mut state = DeviceState::new(Duration::ZERO);
        // idle from registration until the first dispatch
        state.note_dispatch(Duration::from_millis(10), 2);
        assert_eq!(state.idle_time, Duration::from_millis(10));
        state.note_completion(Duration::from_millis(12));
        state.note_completion(Duration::from_millis(15));
        assert_eq!(state.idle_since, Some(Duration::from_millis(15)));
        state.note_dispatch(Duration::from_millis(40), 1);
        assert_eq!(state.idle_time, Duration::from_millis(35));
        // a dispatch while busy does not add idle time
        state.note_dispatch(Duration::from_millis(45), 1);
        assert_eq!(state.idle_time, Duration::from_millis(35));
        assert_eq!(state.in_flight, 2);
    }

    #[tokio::test]
    #[should_panic(expected = "registered twice")]
    async fn timers_cannot_be_registered_twice() {
        let ctx = DeviceContext::new(
            4,
            MockDevice::new(),
            SchedulerConfig::default(),
            Arc::new(ManualClock::new()),
            Arc::new(Counters::default()),
        );
        DeviceContext::spawn_tasks(&ctx).expect("first registration");
        let _ = DeviceContext::spawn_tasks(&ctx);
    }

    #[test]
    fn retained_anonymous_binding_is_shared() {
        let ctx = DeviceContext::new(
            4,
            MockDevice::new(),
            SchedulerConfig::default(),
            Arc::new(ManualClock::new()),
            Arc::new(Counters::default()),
        );
        assert!(ctx.retain_anonymous().is_none());
        let binding = Binding::new(1, Arc::clone(&ctx), None, crate::DEFAULT_PRIORITY);
        ctx.link(Arc::clone(&binding));
        let found = ctx.retain_anonymous().expect("linked");
        assert!(Arc::ptr_eq(&found, &binding));
        // one owner for the device link, one for the lookup
        assert_eq!(found.owners(), 2);
    }

    #[test]
    fn fold_idle_only_counts_open_stretch() {
        let mut state = DeviceState::new(Duration::ZERO);
        state.fold_idle(Duration::from_millis(100));
        assert_eq!(state.idle_time, Duration::from_millis(100));
        state.fold_idle(Duration::from_millis(150));
        assert_eq!(state.idle_time, Duration::from_millis(150));

        state.note_dispatch(Duration::from_millis(150), 1);
        state.fold_idle(Duration::from_millis(300));
        assert_eq!(state.idle_time, Duration::from_millis(150));
    }
}

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use error_stack::report;
use error_stack::ResultExt;
use tracing::info;
use tracing::warn;

use crate::binding::Binding;
use crate::binding::BindingId;
use crate::clock::Clock;
use crate::clock::MonotonicClock;
use crate::config::SchedulerConfig;
use crate::device::BlockDevice;
use crate::device::DeviceContext;
use crate::error::SchedError;
use crate::request::Completion;
use crate::request::IoRequest;
use crate::stats::Counters;
use crate::stats::DeviceStats;
use crate::stats::SchedulerStats;
use crate::sync::lock;
use crate::workload::Workload;
use crate::workload::WorkloadContext;
use crate::DeviceId;
use crate::Result;
use crate::WorkloadId;
use crate::DEFAULT_PRIORITY;

/// How a registered device's dispatch and balance cycles are driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskMode {
    /// Spawn a dispatcher and a balancer task on the current tokio runtime.
    #[default]
    Background,
    /// No tasks; the caller drives [`DeviceContext::dispatch`] and
    /// [`DeviceContext::balance`].
    Manual,
}

#[derive(Default)]
struct Registry {
    devices: HashMap<DeviceId, Arc<DeviceContext>>,
    workloads: HashMap<WorkloadId, Arc<WorkloadContext>>,
}

/// Entry point: registers devices, admits requests, and tracks workloads.
///
/// Locks are always taken in the order registry, workload, device, binding.
/// Requests are handed to the block device only after every lock is dropped.
pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    next_binding: AtomicU64,
    registry: Mutex<Registry>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedError> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Result<Self, SchedError> {
        config.validate()?;
        info!(
            dispatch_interval_ms = config.dispatch_interval_ms,
            balance_interval_ms = config.balance_interval_ms,
            priority_bias = config.priority_bias,
            "scheduler initialized"
        );
        Ok(Self {
            config,
            clock,
            counters: Arc::new(Counters::default()),
            next_binding: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn register_device(
        &self,
        id: DeviceId,
        device: Arc<dyn BlockDevice>,
    ) -> Result<Arc<DeviceContext>, SchedError> {
        self.register_device_with(id, device, TaskMode::Background)
    }

    pub fn register_device_with(
        &self,
        id: DeviceId,
        device: Arc<dyn BlockDevice>,
        mode: TaskMode,
    ) -> Result<Arc<DeviceContext>, SchedError> {
        let mut registry = lock(&self.registry);
        if registry.devices.contains_key(&id) {
            return Err(report!(SchedError::DuplicateDevice { device: id }));
        }
        let ctx = DeviceContext::new(
            id,
            device,
            self.config.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.counters),
        );
        if mode == TaskMode::Background {
            if let Err(report) = DeviceContext::spawn_tasks(&ctx) {
                drop(registry);
                ctx.release();
                return Err(report);
            }
        }
        registry.devices.insert(id, Arc::clone(&ctx));
        info!(device = id, ?mode, "device registered");
        Ok(ctx)
    }

    /// Withdraws a device.
    ///
    /// Stops both tasks, fails every queued request with
    /// [`IoError::DeviceWithdrawn`](crate::IoError::DeviceWithdrawn), unlinks
    /// all bindings, waits for the tasks to finish, and drops the registry's
    /// hold on the context. Requests already forwarded to the device complete
    /// normally.
    pub async fn deregister_device(&self, id: DeviceId) -> Result<(), SchedError> {
        let ctx = lock(&self.registry)
            .devices
            .remove(&id)
            .ok_or_else(|| report!(SchedError::UnknownDevice { device: id }))?;
        info!(device = id, "deregistering device");

        ctx.begin_close();
        let bindings = ctx.detach_all();
        let detached = bindings.len();
        let workload_links = unlink_from_workloads(&bindings);
        for binding in workload_links.iter().chain(&bindings) {
            binding.release();
        }

        let joined = ctx
            .join_tasks()
            .await
            .attach_printable_lazy(|| format!("while deregistering device {id}"));
        ctx.release();
        info!(device = id, bindings = detached, "device deregistered");
        joined
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<DeviceContext>> {
        lock(&self.registry).devices.get(&id).cloned()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = lock(&self.registry).devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Queues a request on `device` on behalf of `workload`.
    ///
    /// Requests without a workload go through the device's anonymous binding.
    pub fn submit(
        &self,
        workload: Option<&dyn Workload>,
        device: DeviceId,
        request: IoRequest,
    ) -> Result<Completion, SchedError> {
        let binding = self.acquire_binding(workload, device)?;
        let ctx = Arc::clone(binding.device());
        let queued = ctx.enqueue(&binding, request);
        binding.release();
        let completion = queued?;
        ctx.wake();
        Ok(completion)
    }

    /// Looks up or creates the binding for `(workload, device)` and adds a
    /// transient owner for the caller.
    fn acquire_binding(
        &self,
        workload: Option<&dyn Workload>,
        device_id: DeviceId,
    ) -> Result<Arc<Binding>, SchedError> {
        let mut registry = lock(&self.registry);
        let device = registry
            .devices
            .get(&device_id)
            .cloned()
            .ok_or_else(|| report!(SchedError::withdrawn(device_id)))?;
        if device.is_closing() {
            return Err(report!(SchedError::withdrawn(device_id)));
        }

        let Some(workload) = workload else {
            Counters::add(&self.counters.anonymous_submissions, 1);
            if let Some(binding) = device.retain_anonymous() {
                return Ok(binding);
            }
            let binding = Binding::new(
                self.next_binding_id(),
                Arc::clone(&device),
                None,
                DEFAULT_PRIORITY,
            );
            binding.retain();
            device.link(Arc::clone(&binding));
            return Ok(binding);
        };

        let context = Arc::clone(registry.workloads.entry(workload.id()).or_insert_with(|| {
            WorkloadContext::new(
                workload.id(),
                workload.priority_class(),
                Arc::clone(&self.counters),
            )
        }));
        let mut bindings = context.bindings();
        if let Some(binding) = bindings
            .iter()
            .find(|b| Arc::ptr_eq(b.device(), &device))
        {
            binding.retain();
            return Ok(Arc::clone(binding));
        }
        let binding = Binding::new(
            self.next_binding_id(),
            Arc::clone(&device),
            Some(Arc::clone(&context)),
            context.priority(),
        );
        binding.retain();
        bindings.push(Arc::clone(&binding));
        device.link(Arc::clone(&binding));
        Ok(binding)
    }

    fn next_binding_id(&self) -> BindingId {
        self.next_binding.fetch_add(1, Ordering::Relaxed)
    }

    /// Handles a workload exiting.
    ///
    /// Its bindings are unlinked from the workload. Bindings with an empty
    /// queue are also unlinked from their device and destroyed; the rest stay
    /// on the device until the dispatcher has drained them. Returns `false`
    /// if the workload never submitted anything.
    pub fn exit_workload(&self, id: WorkloadId) -> bool {
        let Some(context) = lock(&self.registry).workloads.remove(&id) else {
            return false;
        };
        let bindings = std::mem::take(&mut *context.bindings());

        let mut device_links = Vec::new();
        for binding in &bindings {
            let device = binding.device();
            let mut state = device.lock_state();
            let mut queue = binding.lock_state();
            queue.linked_workload = false;
            if queue.queue.is_empty() && queue.linked_device {
                queue.linked_device = false;
                drop(queue);
                state.bindings.retain(|b| !Arc::ptr_eq(b, binding));
                device_links.push(Arc::clone(binding));
            }
        }

        let reaped = device_links.len();
        for binding in bindings.iter().chain(&device_links) {
            binding.release();
        }
        context.release();
        info!(
            workload = id,
            bindings = bindings.len(),
            reaped,
            "workload exited"
        );
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        let devices: Vec<_> = lock(&self.registry).devices.values().cloned().collect();
        let mut stats = self.counters.snapshot();
        stats.rate_limited_bindings = devices.iter().map(|d| d.rate_limited_bindings()).sum();
        stats
    }

    pub fn device_stats(&self, id: DeviceId) -> Option<DeviceStats> {
        self.device(id).map(|device| device.stats())
    }

    /// Deregisters every device and exits every workload.
    pub async fn shutdown(&self) -> Result<(), SchedError> {
        let mut result = Ok(());
        for id in self.device_ids() {
            if let Err(report) = self.deregister_device(id).await {
                warn!(device = id, error = %report, "device did not shut down cleanly");
                if result.is_ok() {
                    result = Err(report);
                }
            }
        }
        let workloads: Vec<_> = lock(&self.registry).workloads.keys().copied().collect();
        for id in workloads {
            self.exit_workload(id);
        }
        info!("scheduler shut down");
        result
    }
}

/// Removes detached bindings from their workloads' lists and returns the
/// bindings whose workload link the caller now has to release.
fn unlink_from_workloads(bindings: &[Arc<Binding>]) -> Vec<Arc<Binding>> {
    let mut unlinked = Vec::new();
    for binding in bindings {
        let Some(workload) = binding.workload() else {
            continue;
        };
        let mut list = workload.bindings();
        if let Some(pos) = list.iter().position(|b| Arc::ptr_eq(b, binding)) {
            list.remove(pos);
            binding.lock_state().linked_workload = false;
            unlinked.push(Arc::clone(binding));
        }
    }
    unlinked
}

//! Fair-queuing disk I/O admission scheduler.
//!
//! Workloads submit requests against a device through a [`Scheduler`]. Each
//! (workload, device) pair gets a [`Binding`] that queues its requests. Per
//! device, two background tasks cooperate:
//! - the dispatcher drains bindings into the [`BlockDevice`], honouring each
//!   binding's admission cap;
//! - the balancer measures how busy the device was over the last interval,
//!   splits the observed service time into per-priority budgets, and flags
//!   every binding to recompute its cap before it dispatches again.
//!
//! Both cycles are plain methods on [`DeviceContext`] ([`DeviceContext::dispatch`]
//! and [`DeviceContext::balance`]), so they can be driven by hand with a
//! [`ManualClock`] instead of the background tasks.

use error_stack::Report;

mod accumulator;
mod balancer;
mod binding;
mod clock;
mod config;
mod device;
mod dispatcher;
mod error;
mod lifecycle;
pub mod mock;
mod request;
mod scheduler;
mod stats;
mod sync;
mod workload;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

/// Identifier of a registered block device.
pub type DeviceId = u32;

/// Identifier of a workload (process) issuing I/O.
pub type WorkloadId = u32;

/// Highest priority class a workload can be scheduled at.
pub const MAX_PRIORITY: usize = 10;

/// Number of priority classes, `0..=MAX_PRIORITY`.
pub const PRIORITY_CLASSES: usize = MAX_PRIORITY + 1;

/// Priority class used for I/O that arrives without a workload context.
pub const DEFAULT_PRIORITY: usize = 5;

pub use accumulator::ScaledSum;
pub use balancer::BalanceSummary;
pub use binding::{Binding, BindingId};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::SchedulerConfig;
pub use device::{BlockDevice, DeviceContext};
pub use error::{IoError, SchedError};
pub use lifecycle::{RefCount, Release};
pub use request::{Completion, DispatchedIo, IoOp, IoRequest, IoResult};
pub use scheduler::{Scheduler, TaskMode};
pub use stats::{BindingStats, DeviceStats, SchedulerStats};
pub use workload::{Workload, WorkloadContext};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;

use crate::accumulator::ScaledSum;
use crate::binding::Binding;
use crate::binding::BindingState;
use crate::config::SchedulerConfig;
use crate::device::DeviceContext;
use crate::device::DeviceState;
use crate::stats::Counters;
use crate::PRIORITY_CLASSES;

/// What one balance pass measured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSummary {
    pub busy_percent: u32,
    pub saturated: bool,
    /// Bindings that completed at least one request in the interval.
    pub contributors: u64,
    /// Total service time of the interval, in microseconds.
    pub total_latency_us: u128,
    pub lost_bits: u32,
}

impl DeviceContext {
    /// Closes the current balance interval.
    ///
    /// Measures how busy the device was, snapshots and resets every
    /// binding's latency accounting, splits the interval's total service time
    /// into per-priority budgets weighted by `priority_bias + priority`, and
    /// flags every binding to recompute its cap.
    pub fn balance(&self) -> BalanceSummary {
        let now = self.clock().now();
        let config = self.config();
        let mut state = self.lock_state();

        let interval = now.saturating_sub(state.last_balance);
        state.fold_idle(now);
        let busy_percent = if interval.is_zero() {
            state.busy_percent
        } else {
            busy_percent(interval, state.idle_time)
        };
        state.idle_time = Duration::ZERO;
        state.last_balance = now;

        let mut total = ScaledSum::new();
        let mut contributors = [0u64; PRIORITY_CLASSES];
        for binding in &state.bindings {
            let mut queue = binding.lock_state();
            queue.interval_avg_latency_us = std::mem::take(&mut queue.avg_latency_us);
            queue.interval_transactions = std::mem::take(&mut queue.transactions);
            queue.issued = 0;
            queue.rebalance = true;
            if queue.interval_transactions > 0 {
                total.add_product(queue.interval_avg_latency_us, queue.interval_transactions);
                contributors[binding.priority()] += 1;
            }
        }

        let bias = config.priority_bias;
        let weight_sum = contributors
            .iter()
            .enumerate()
            .map(|(priority, &n)| u128::from(bias + priority as u64) * u128::from(n))
            .sum::<u128>()
            .max(1);
        for (priority, &n) in contributors.iter().enumerate() {
            if n == 0 {
                continue;
            }
            let share = u128::from(bias + priority as u64) * u128::from(total.total()) / weight_sum;
            state.budgets[priority] = scale_up(share, total.lost_bits());
        }

        record_busy(&mut state, busy_percent, config);

        let summary = BalanceSummary {
            busy_percent,
            saturated: state.last_full,
            contributors: contributors.iter().sum(),
            total_latency_us: total.value(),
            lost_bits: total.lost_bits(),
        };
        debug!(
            device = self.id(),
            busy_percent,
            contributors = summary.contributors,
            lost_bits = summary.lost_bits,
            "balance interval closed"
        );
        summary
    }
}

fn busy_percent(interval: Duration, idle: Duration) -> u32 {
    let busy = interval.saturating_sub(idle);
    let percent = busy.as_micros() * 100 / interval.as_micros().max(1);
    percent.min(100) as u32
}

/// Shifts a scaled budget back into microseconds, saturating.
fn scale_up(value: u128, bits: u32) -> u64 {
    if value == 0 {
        return 0;
    }
    if value.leading_zeros() < bits {
        return u64::MAX;
    }
    u64::try_from(value << bits).unwrap_or(u64::MAX)
}

/// Shifts the saturation history by one interval.
fn record_busy(state: &mut DeviceState, busy_percent: u32, config: &SchedulerConfig) {
    state.busy_percent = busy_percent;
    state.prev_full = state.last_full;
    state.last_full = busy_percent >= config.saturated_percent;
}

/// Recomputes a binding's admission cap from the last balance.
///
/// A binding that used more than its class budget on a saturated device is
/// capped at `budget / avg_latency` requests per interval. The cap is lifted
/// only once the binding is well under budget or the device is relaxed, and
/// neither of the last two intervals was saturated.
pub(crate) fn self_balance(
    ctx: &DeviceContext,
    device: &DeviceState,
    binding: &Binding,
    queue: &mut BindingState,
) {
    let budget = device.budgets[binding.priority()];
    match adjust_cap(queue, budget, device, ctx.config()) {
        CapChange::Limited(cap) => {
            Counters::add(&ctx.counters().rate_limit_events, 1);
            debug!(
                device = ctx.id(),
                binding = binding.id(),
                cap,
                budget,
                "binding rate limited"
            );
        }
        CapChange::Lifted => {
            debug!(device = ctx.id(), binding = binding.id(), "binding rate limit lifted");
        }
        CapChange::Unchanged => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapChange {
    Limited(u64),
    Lifted,
    Unchanged,
}

fn adjust_cap(
    queue: &mut BindingState,
    budget: u64,
    device: &DeviceState,
    config: &SchedulerConfig,
) -> CapChange {
    queue.rebalance = false;
    let avg = queue.interval_avg_latency_us;
    let used = avg.saturating_mul(queue.interval_transactions);

    if used > budget && device.busy_percent >= config.saturated_percent {
        let cap = (budget / avg.max(1)).max(1);
        queue.max_throughput = Some(cap);
        queue.rate_limit_events += 1;
        return CapChange::Limited(cap);
    }

    let relaxed =
        used.saturating_mul(2) < budget || device.busy_percent < config.relaxed_percent;
    if relaxed && !device.prev_full && !device.last_full && queue.max_throughput.take().is_some() {
        return CapChange::Lifted;
    }
    CapChange::Unchanged
}

pub(crate) fn spawn(handle: &Handle, ctx: Arc<DeviceContext>) -> JoinHandle<()> {
    ctx.refs().retain();
    handle.spawn(async move {
        let period = ctx.config().balance_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(device = ctx.id(), "balancer started");

        loop {
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            ctx.balance();
        }

        info!(device = ctx.id(), "balancer stopped");
        ctx.release();
    })
}

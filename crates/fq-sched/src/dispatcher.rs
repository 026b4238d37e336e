use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing::trace;

use crate::balancer;
use crate::device::DeviceContext;
use crate::stats::Counters;

impl DeviceContext {
    /// Runs one dispatch round and returns how many requests were forwarded.
    ///
    /// Bindings are visited round-robin. Each non-empty binding recomputes
    /// its cap if the balancer asked it to, reclaims idle capacity if its cap
    /// is exhausted while the device sits idle, then forwards queued requests
    /// in FIFO order while it stays under its cap. Orphaned bindings whose
    /// queue has drained are unlinked and released.
    pub fn dispatch(&self) -> usize {
        if self.is_closing() {
            return 0;
        }
        let idle = self.block_device().report_idle();
        let now = self.clock().now();
        let increment = self.config().idle_increment;

        let mut batch = Vec::new();
        let mut reaped = Vec::new();
        {
            let mut state = self.lock_state();
            for binding in state.rotation() {
                let mut queue = binding.lock_state();
                if !queue.queue.is_empty() {
                    if queue.rebalance {
                        balancer::self_balance(self, &state, &binding, &mut queue);
                    }
                    if idle && queue.is_exhausted() {
                        queue.max_throughput = queue.max_throughput.map(|cap| cap + increment);
                    }
                    while queue.has_cap_room() {
                        let Some(io) = queue.queue.pop_front() else {
                            break;
                        };
                        queue.issued += 1;
                        batch.push(io.into_dispatched(Arc::clone(&binding), now));
                    }
                }
                if queue.queue.is_empty() && binding.is_orphaned(&queue) {
                    queue.linked_device = false;
                    drop(queue);
                    reaped.push(binding);
                }
            }
            if !reaped.is_empty() {
                state
                    .bindings
                    .retain(|b| !reaped.iter().any(|r| Arc::ptr_eq(r, b)));
            }
            state.note_dispatch(now, batch.len() as u64);
        }

        for binding in reaped {
            trace!(device = self.id(), binding = binding.id(), "reaped orphaned binding");
            binding.release();
        }

        let forwarded = batch.len();
        Counters::add(&self.counters().dispatched, forwarded as u64);
        for io in batch {
            self.block_device().submit_request(io);
        }
        forwarded
    }
}

pub(crate) fn spawn(handle: &Handle, ctx: Arc<DeviceContext>) -> JoinHandle<()> {
    ctx.refs().retain();
    handle.spawn(async move {
        let mut ticker = interval(ctx.config().dispatch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(device = ctx.id(), "dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = ctx.wake.notified() => {}
            }
            let forwarded = ctx.dispatch();
            if forwarded > 0 {
                trace!(device = ctx.id(), forwarded, "dispatch round");
            }
        }

        let withdrawn = ctx.drain_all();
        info!(device = ctx.id(), withdrawn, "dispatcher stopped");
        ctx.release();
    })
}

use std::sync::Arc;
use std::time::Duration;

use fq_sched::DeviceId;
use fq_sched::IoError;
use fq_sched::IoOp;
use fq_sched::IoRequest;
use fq_sched::IoResult;
use fq_sched::Scheduler;
use fq_sched::Workload;
use fq_sched::WorkloadId;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::scenario::WorkloadSpec;

/// A simulated process with a fixed priority class.
#[derive(Debug, Clone, Copy)]
pub struct SimWorkload {
    id: WorkloadId,
    priority: i32,
}

impl Workload for SimWorkload {
    fn id(&self) -> WorkloadId {
        self.id
    }

    fn priority_class(&self) -> i32 {
        self.priority
    }
}

/// What one workload saw during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReport {
    pub workload: WorkloadId,
    pub priority: i32,
    pub device: DeviceId,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub withdrawn: u64,
    /// Submissions refused because the device was already gone.
    pub rejected: u64,
    pub avg_latency_us: u64,
    pub throughput_per_sec: f64,
}

impl WorkloadReport {
    fn record(&mut self, result: IoResult, latency: Duration, latency_sum: &mut u128) {
        match result {
            Ok(()) => {
                self.completed += 1;
                *latency_sum += latency.as_micros();
            }
            Err(IoError::DeviceWithdrawn { .. }) => self.withdrawn += 1,
            Err(IoError::Device { .. }) => self.failed += 1,
        }
    }
}

fn request_for(spec: &WorkloadSpec, seq: u64) -> IoRequest {
    let id = (u64::from(spec.id) << 32) | (seq & u64::from(u32::MAX));
    let offset = seq * u64::from(spec.request_size);
    match spec.op {
        IoOp::Read => IoRequest::read(id, offset, spec.request_size),
        IoOp::Write => IoRequest::write(id, offset, spec.request_size),
        IoOp::Flush => IoRequest::flush(id),
    }
}

/// Submits requests at the workload's rate until `cancel` fires, then waits
/// for everything it submitted to resolve.
pub async fn drive(
    scheduler: Arc<Scheduler>,
    spec: WorkloadSpec,
    cancel: CancellationToken,
) -> WorkloadReport {
    let workload = SimWorkload {
        id: spec.id,
        priority: spec.priority,
    };
    let mut report = WorkloadReport {
        workload: spec.id,
        priority: spec.priority,
        device: spec.device,
        ..Default::default()
    };

    let period = Duration::from_nanos((1_000_000_000 / spec.requests_per_sec).max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let started = Instant::now();
    let mut pending = FuturesUnordered::new();
    let mut latency_sum = 0u128;
    let mut seq = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some((result, latency)) = pending.next(), if !pending.is_empty() => {
                report.record(result, latency, &mut latency_sum);
            }
            _ = ticker.tick() => {
                let request = request_for(&spec, seq);
                seq += 1;
                match scheduler.submit(Some(&workload), spec.device, request) {
                    Ok(completion) => {
                        report.submitted += 1;
                        let issued = Instant::now();
                        pending.push(async move {
                            let result = completion.await;
                            (result, issued.elapsed())
                        });
                    }
                    Err(error) => {
                        debug!(workload = spec.id, %error, "submission rejected");
                        report.rejected += 1;
                    }
                }
            }
        }
    }
    let active = started.elapsed();

    debug!(
        workload = spec.id,
        outstanding = pending.len(),
        "workload stopped, waiting for outstanding requests"
    );
    while let Some((result, latency)) = pending.next().await {
        report.record(result, latency, &mut latency_sum);
    }

    if report.completed > 0 {
        report.avg_latency_us = u64::try_from(latency_sum / u128::from(report.completed))
            .unwrap_or(u64::MAX);
    }
    let secs = active.as_secs_f64();
    if secs > 0.0 {
        report.throughput_per_sec = report.completed as f64 / secs;
    }
    info!(
        workload = spec.id,
        submitted = report.submitted,
        completed = report.completed,
        withdrawn = report.withdrawn,
        "workload finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn spec(op: IoOp) -> WorkloadSpec {
        WorkloadSpec {
            id: 3,
            priority: 2,
            device: 1,
            requests_per_sec: 100,
            request_size: 8192,
            op,
        }
    }

    #[test]
    fn request_ids_carry_the_workload() {
        let request = request_for(&spec(IoOp::Write), 5);
        assert_eq!(request.id, (3u64 << 32) | 5);
        assert_eq!(request.op, IoOp::Write);
        assert_eq!(request.offset, 5 * 8192);
        assert_eq!(request.length, 8192);

        let flush = request_for(&spec(IoOp::Flush), 1);
        assert_eq!(flush, IoRequest::flush((3u64 << 32) | 1));
    }

    #[test]
    fn results_are_classified() {
        let mut report = WorkloadReport::default();
        let mut sum = 0;
        report.record(Ok(()), Duration::from_micros(40), &mut sum);
        report.record(Ok(()), Duration::from_micros(60), &mut sum);
        report.record(
            Err(IoError::DeviceWithdrawn { device: 1 }),
            Duration::ZERO,
            &mut sum,
        );
        report.record(Err(IoError::device("media error")), Duration::ZERO, &mut sum);

        assert_eq!(report.completed, 2);
        assert_eq!(report.withdrawn, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(sum, 100);
    }
}

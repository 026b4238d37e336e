use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use fq_sched::DeviceStats;
use fq_sched::Scheduler;
use fq_sched::SchedulerStats;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use utils::logging::STATS_TARGET;

use crate::scenario::Scenario;
use crate::sim_device::LatencyDevice;
use crate::workload;
use crate::workload::WorkloadReport;

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub duration: Duration,
    /// `None` disables periodic stats.
    pub stats_interval: Option<Duration>,
}

impl RunOptions {
    pub fn for_scenario(scenario: &Scenario) -> Self {
        Self {
            duration: Duration::from_millis(scenario.duration_ms),
            stats_interval: Some(Duration::from_secs(1)),
        }
    }
}

/// Periodic snapshot written to the stats log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsSnapshot {
    elapsed_ms: u128,
    scheduler: SchedulerStats,
    devices: Vec<DeviceStats>,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimReport {
    pub duration_ms: u64,
    pub scheduler: SchedulerStats,
    /// Device state captured just before shutdown.
    pub devices: Vec<DeviceStats>,
    pub workloads: Vec<WorkloadReport>,
}

fn device_snapshots(scheduler: &Scheduler) -> Vec<DeviceStats> {
    scheduler
        .device_ids()
        .into_iter()
        .filter_map(|id| scheduler.device_stats(id))
        .collect()
}

fn spawn_reporter(
    scheduler: Arc<Scheduler>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = StatsSnapshot {
                        elapsed_ms: started.elapsed().as_millis(),
                        scheduler: scheduler.stats(),
                        devices: device_snapshots(&scheduler),
                    };
                    match serde_json::to_string(&snapshot) {
                        Ok(line) => info!(target: STATS_TARGET, "{line}"),
                        Err(e) => warn!("failed to serialize stats snapshot: {e}"),
                    }
                }
            }
        }
    })
}

/// Runs `scenario` to completion on the current runtime.
pub async fn run(scenario: &Scenario, options: RunOptions) -> Result<SimReport> {
    let scheduler = Scheduler::new(scenario.scheduler.clone())
        .map_err(|report| anyhow!("{report:?}"))
        .context("failed to create scheduler")?;
    let scheduler = Arc::new(scheduler);

    for spec in &scenario.devices {
        let device = LatencyDevice::new(spec.id, Duration::from_micros(spec.service_time_us));
        scheduler
            .register_device(spec.id, device)
            .map_err(|report| anyhow!("{report:?}"))
            .with_context(|| format!("failed to register device {}", spec.id))?;
    }

    let cancel = CancellationToken::new();
    let drivers: Vec<_> = scenario
        .workloads
        .iter()
        .map(|spec| {
            tokio::spawn(workload::drive(
                Arc::clone(&scheduler),
                spec.clone(),
                cancel.child_token(),
            ))
        })
        .collect();
    let reporter = options
        .stats_interval
        .map(|interval| spawn_reporter(Arc::clone(&scheduler), interval, cancel.child_token()));

    info!(
        devices = scenario.devices.len(),
        workloads = scenario.workloads.len(),
        duration_ms = options.duration.as_millis(),
        "simulation started"
    );
    tokio::time::sleep(options.duration).await;
    cancel.cancel();

    let devices = device_snapshots(&scheduler);
    scheduler
        .shutdown()
        .await
        .map_err(|report| anyhow!("{report:?}"))
        .context("scheduler did not shut down cleanly")?;

    let mut workloads = Vec::with_capacity(drivers.len());
    for driver in drivers {
        workloads.push(driver.await.context("workload task panicked")?);
    }
    if let Some(reporter) = reporter {
        reporter.await.context("stats reporter panicked")?;
    }

    let report = SimReport {
        duration_ms: u64::try_from(options.duration.as_millis()).unwrap_or(u64::MAX),
        scheduler: scheduler.stats(),
        devices,
        workloads,
    };
    info!(
        completed = report.scheduler.completed,
        withdrawn = report.scheduler.withdrawn,
        "simulation finished"
    );
    Ok(report)
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.scheduler;
        writeln!(f, "simulated {} ms", self.duration_ms)?;
        writeln!(
            f,
            "requests: submitted={} dispatched={} completed={} failed={} withdrawn={}",
            s.submitted, s.dispatched, s.completed, s.failed, s.withdrawn
        )?;
        writeln!(f, "rate limit events: {}", s.rate_limit_events)?;
        for device in &self.devices {
            writeln!(
                f,
                "device {}: busy={}% bindings={}",
                device.device,
                device.busy_percent,
                device.bindings.len()
            )?;
        }
        writeln!(
            f,
            "{:>8} {:>4} {:>6} {:>9} {:>9} {:>9} {:>12} {:>10}",
            "workload", "prio", "device", "submitted", "completed", "withdrawn", "avg_lat_us", "iops"
        )?;
        for w in &self.workloads {
            writeln!(
                f,
                "{:>8} {:>4} {:>6} {:>9} {:>9} {:>9} {:>12} {:>10.1}",
                w.workload,
                w.priority,
                w.device,
                w.submitted,
                w.completed,
                w.withdrawn,
                w.avg_latency_us,
                w.throughput_per_sec
            )?;
        }
        Ok(())
    }
}

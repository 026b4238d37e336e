//! Deterministic scheduling runs: a manual clock, a mock device, and the
//! dispatch and balance cycles driven by hand one millisecond at a time.

use std::sync::Arc;
use std::time::Duration;

use fq_sched::mock::MockDevice;
use fq_sched::mock::TestWorkload;
use fq_sched::DeviceContext;
use fq_sched::IoError;
use fq_sched::IoRequest;
use fq_sched::ManualClock;
use fq_sched::Scheduler;
use fq_sched::SchedulerConfig;
use fq_sched::TaskMode;
use fq_sched::WorkloadId;
use similar_asserts::assert_eq;
use test_log::test;

const DEVICE: u32 = 1;

struct Harness {
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
    device: Arc<MockDevice>,
    ctx: Arc<DeviceContext>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new());
        let scheduler = Scheduler::with_clock(SchedulerConfig::default(), clock.clone())
            .expect("default config is valid");
        let device = MockDevice::new();
        let ctx = scheduler
            .register_device_with(DEVICE, device.clone(), TaskMode::Manual)
            .expect("register device");
        Self {
            clock,
            scheduler,
            device,
            ctx,
        }
    }

    /// One millisecond: close the balance interval on 500ms boundaries, let
    /// every submitter queue one request, run a dispatch round, then complete
    /// whatever was dispatched before this millisecond.
    fn tick(&self, ms: u64, submitters: &[&TestWorkload]) {
        let now = Duration::from_millis(ms);
        self.clock.set(now);
        if ms > 0 && ms % 500 == 0 {
            self.ctx.balance();
        }
        for workload in submitters {
            let id = ms * 100 + u64::from(workload.id);
            self.scheduler
                .submit(Some(*workload), DEVICE, IoRequest::read(id, id * 4096, 4096))
                .expect("submit");
        }
        self.ctx.dispatch();
        self.device.complete_dispatched_before(now);
    }

    fn cap_of(&self, workload: WorkloadId) -> Option<u64> {
        self.scheduler
            .device_stats(DEVICE)
            .expect("device registered")
            .bindings
            .iter()
            .find(|b| b.workload == Some(workload))
            .expect("binding exists")
            .max_throughput
    }

    fn dispatched_between(&self, workload: WorkloadId, from_ms: u64, to_ms: u64) -> usize {
        let from = Duration::from_millis(from_ms);
        let to = Duration::from_millis(to_ms);
        self.device
            .forwarded()
            .iter()
            .filter(|f| f.workload == Some(workload))
            .filter(|f| f.dispatched_at >= from && f.dispatched_at < to)
            .count()
    }
}

#[test]
fn saturated_device_converges_to_priority_share() {
    let h = Harness::new();
    let low = TestWorkload::new(1, 0);
    let high = TestWorkload::new(2, 10);

    for ms in 0..2500 {
        h.tick(ms, &[&low, &high]);
        match ms {
            500 => assert_eq!(h.cap_of(1), Some(249)),
            1000 => assert_eq!(h.cap_of(1), Some(187)),
            1500 => assert_eq!(h.cap_of(1), Some(171)),
            2000 => assert_eq!(h.cap_of(1), Some(167)),
            _ => {}
        }
        assert_eq!(h.cap_of(2), None);
    }

    let low_share = h.dispatched_between(1, 2000, 2500);
    let high_share = h.dispatched_between(2, 2000, 2500);
    assert_eq!(low_share, 167);
    assert_eq!(high_share, 500);
    let ratio = high_share as f64 / low_share as f64;
    assert!((2.7..=3.3).contains(&ratio), "ratio {ratio}");

    let stats = h.scheduler.stats();
    assert_eq!(stats.rate_limited_bindings, 1);
    assert_eq!(stats.rate_limit_events, 4);

    let device = h.scheduler.device_stats(DEVICE).expect("device");
    assert_eq!(device.busy_percent, 100);
    assert!(device.last_full && device.prev_full);
}

#[test]
fn higher_priority_never_gets_a_tighter_cap() {
    let h = Harness::new();
    let lower = TestWorkload::new(3, 2);
    let higher = TestWorkload::new(4, 8);

    for ms in 0..2001 {
        h.tick(ms, &[&lower, &higher]);
        let lower_cap = h.cap_of(3).unwrap_or(u64::MAX);
        let higher_cap = h.cap_of(4).unwrap_or(u64::MAX);
        assert!(
            higher_cap >= lower_cap,
            "at {ms}ms: priority 8 cap {higher_cap} below priority 2 cap {lower_cap}"
        );
    }
    assert!(h.cap_of(3).is_some());
}

#[test]
fn idle_device_reclaims_capacity() {
    let h = Harness::new();
    let low = TestWorkload::new(1, 0);
    let high = TestWorkload::new(2, 10);

    for ms in 0..=1000 {
        h.tick(ms, &[&low, &high]);
    }
    assert_eq!(h.cap_of(1), Some(187));

    // Load stops; the backlog left behind the cap drains in idle increments.
    for ms in 1001..1500 {
        h.tick(ms, &[]);
    }
    assert_eq!(h.cap_of(1), Some(252));
    let idle_forwarded = h.dispatched_between(1, 1001, 1500);
    assert_eq!(idle_forwarded, 65);

    // The previous interval was still saturated, so the cap holds.
    h.tick(1500, &[&low]);
    assert_eq!(h.cap_of(1), Some(252));
    let device = h.scheduler.device_stats(DEVICE).expect("device");
    assert!(device.busy_percent < 80);
    assert!(device.prev_full && !device.last_full);

    for ms in 1501..2000 {
        h.tick(ms, &[]);
    }
    // Two quiet intervals in a row: the next self-balance lifts the cap.
    h.tick(2000, &[&low]);
    assert_eq!(h.cap_of(1), None);
    assert_eq!(h.scheduler.stats().rate_limited_bindings, 0);
}

#[test]
fn requests_leave_each_binding_in_fifo_order() {
    let h = Harness::new();
    let first = TestWorkload::new(5, 1);
    let second = TestWorkload::new(6, 9);

    for ms in 0..1200 {
        let submitters: &[&TestWorkload] = if ms % 3 == 0 {
            &[&first, &second]
        } else {
            &[&first]
        };
        h.tick(ms, submitters);
    }

    for workload in [5, 6] {
        let ids: Vec<u64> = h
            .device
            .forwarded()
            .iter()
            .filter(|f| f.workload == Some(workload))
            .map(|f| f.request_id)
            .collect();
        assert!(!ids.is_empty());
        assert!(
            ids.windows(2).all(|w| w[0] < w[1]),
            "workload {workload} dispatched out of order"
        );
    }
}

#[test]
fn dispatch_rotates_between_bindings() {
    let h = Harness::new();
    let a = TestWorkload::new(1, 5);
    let b = TestWorkload::new(2, 5);
    for i in 0..2 {
        h.scheduler
            .submit(Some(&a), DEVICE, IoRequest::read(10 + i, 0, 512))
            .expect("submit a");
        h.scheduler
            .submit(Some(&b), DEVICE, IoRequest::read(20 + i, 0, 512))
            .expect("submit b");
    }
    assert_eq!(h.ctx.dispatch(), 4);
    h.scheduler
        .submit(Some(&a), DEVICE, IoRequest::read(12, 0, 512))
        .expect("submit a");
    h.scheduler
        .submit(Some(&b), DEVICE, IoRequest::read(22, 0, 512))
        .expect("submit b");
    assert_eq!(h.ctx.dispatch(), 2);

    let order: Vec<u64> = h.device.forwarded().iter().map(|f| f.request_id).collect();
    assert_eq!(order, vec![10, 11, 20, 21, 22, 12]);
}

#[test]
fn device_errors_only_fail_their_own_request() {
    let h = Harness::new();
    let workload = TestWorkload::new(8, 4);
    let mut completions: Vec<_> = (0..3)
        .map(|i| {
            h.scheduler
                .submit(Some(&workload), DEVICE, IoRequest::write(i, i * 512, 512))
                .expect("submit")
        })
        .collect();
    h.ctx.dispatch();

    assert_eq!(h.device.fail_next("media error"), Some(0));
    assert_eq!(h.device.complete_all(), 2);

    let results: Vec<_> = completions
        .iter_mut()
        .map(|c| c.try_result().expect("completed"))
        .collect();
    assert_eq!(
        results,
        vec![Err(IoError::device("media error")), Ok(()), Ok(())]
    );
    let stats = h.scheduler.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.dispatched, 3);
}

#[test]
fn exited_workload_bindings_are_reaped_once_drained() {
    let h = Harness::new();
    let busy = TestWorkload::new(11, 3);
    let done = TestWorkload::new(12, 3);

    let mut queued: Vec<_> = (0..3)
        .map(|i| {
            h.scheduler
                .submit(Some(&busy), DEVICE, IoRequest::read(i, 0, 4096))
                .expect("submit")
        })
        .collect();
    h.scheduler
        .submit(Some(&done), DEVICE, IoRequest::read(100, 0, 4096))
        .expect("submit");
    h.ctx.dispatch();
    let late = h
        .scheduler
        .submit(Some(&busy), DEVICE, IoRequest::read(3, 0, 4096))
        .expect("submit");
    queued.push(late);

    // `done` has nothing queued and goes right away; `busy` still has work.
    assert!(h.scheduler.exit_workload(12));
    assert!(h.scheduler.exit_workload(11));
    assert!(!h.scheduler.exit_workload(11));
    assert_eq!(h.ctx.binding_count(), 1);
    assert_eq!(h.scheduler.stats().workload_contexts, 1);

    assert_eq!(h.ctx.dispatch(), 1);
    assert_eq!(h.ctx.binding_count(), 0);
    let stats = h.scheduler.stats();
    assert_eq!(stats.bindings, 0);
    assert_eq!(stats.workload_contexts, 0);

    // In-flight requests of exited workloads still complete.
    assert_eq!(h.device.complete_all(), 5);
    for completion in &mut queued {
        assert_eq!(completion.try_result(), Some(Ok(())));
    }
}

#[test]
fn anonymous_requests_share_one_binding() {
    let h = Harness::new();
    for i in 0..4 {
        h.scheduler
            .submit(None, DEVICE, IoRequest::flush(i))
            .expect("anonymous submit");
    }
    assert_eq!(h.ctx.binding_count(), 1);
    assert_eq!(h.ctx.dispatch(), 4);
    assert!(h.device.forwarded().iter().all(|f| f.workload.is_none()));
    assert_eq!(h.scheduler.stats().anonymous_submissions, 4);
}

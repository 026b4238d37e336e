use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use fq_sched::BlockDevice;
use fq_sched::DeviceId;
use fq_sched::DispatchedIo;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::trace;
use tracing::warn;

/// A disk that serves admitted requests one after another, each taking a
/// fixed service time.
#[derive(Debug)]
pub struct LatencyDevice {
    id: DeviceId,
    service_time: Duration,
    next_free: Mutex<Instant>,
    in_flight: Arc<AtomicUsize>,
}

impl LatencyDevice {
    pub fn new(id: DeviceId, service_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            service_time,
            next_free: Mutex::new(Instant::now()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Reserves the next service slot and returns when it finishes.
    fn reserve_slot(&self) -> Instant {
        let mut next_free = self.next_free.lock().unwrap_or_else(PoisonError::into_inner);
        let start = (*next_free).max(Instant::now());
        *next_free = start + self.service_time;
        *next_free
    }
}

impl BlockDevice for LatencyDevice {
    fn submit_request(&self, io: DispatchedIo) {
        let Ok(handle) = Handle::try_current() else {
            warn!(device = self.id, "no runtime to serve request on");
            io.fail("simulated device has no runtime");
            return;
        };
        let done_at = self.reserve_slot();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);
        trace!(device = self.id, request = io.request().id, "request accepted");
        handle.spawn(async move {
            tokio::time::sleep_until(done_at).await;
            in_flight.fetch_sub(1, Ordering::AcqRel);
            io.succeed();
        });
    }

    fn report_idle(&self) -> bool {
        self.in_flight() == 0
    }
}

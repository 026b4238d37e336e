use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::binding::Binding;
use crate::error::IoError;
use crate::DeviceId;
use crate::WorkloadId;

/// Outcome of one request.
pub type IoResult = core::result::Result<(), IoError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoOp {
    Read,
    Write,
    Flush,
}

/// A block I/O request as submitted by a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    pub id: u64,
    pub op: IoOp,
    pub offset: u64,
    pub length: u32,
}

impl IoRequest {
    pub fn read(id: u64, offset: u64, length: u32) -> Self {
        Self {
            id,
            op: IoOp::Read,
            offset,
            length,
        }
    }

    pub fn write(id: u64, offset: u64, length: u32) -> Self {
        Self {
            id,
            op: IoOp::Write,
            offset,
            length,
        }
    }

    pub fn flush(id: u64) -> Self {
        Self {
            id,
            op: IoOp::Flush,
            offset: 0,
            length: 0,
        }
    }
}

/// Resolves once the request has been completed, failed, or withdrawn.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<IoResult>,
}

impl Completion {
    /// Returns the result if it is already available.
    pub fn try_result(&mut self) -> Option<IoResult> {
        self.rx.try_recv().ok()
    }
}

impl Future for Completion {
    type Output = IoResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(IoError::device("completion channel closed")))
        })
    }
}

/// A request waiting in a binding's queue.
pub(crate) struct QueuedIo {
    request: IoRequest,
    done: oneshot::Sender<IoResult>,
}

impl QueuedIo {
    pub(crate) fn new(request: IoRequest) -> (Self, Completion) {
        let (done, rx) = oneshot::channel();
        (Self { request, done }, Completion { rx })
    }

    pub(crate) fn withdraw(self, device: DeviceId) {
        let _ = self.done.send(Err(IoError::DeviceWithdrawn { device }));
    }

    pub(crate) fn into_dispatched(self, binding: Arc<Binding>, now: Duration) -> DispatchedIo {
        DispatchedIo {
            request: self.request,
            binding,
            dispatched_at: now,
            done: Some(self.done),
        }
    }
}

/// A request admitted to the device.
///
/// The device must eventually call [`DispatchedIo::complete`]. Dropping it
/// without doing so fails the request with a device error.
pub struct DispatchedIo {
    request: IoRequest,
    binding: Arc<Binding>,
    dispatched_at: Duration,
    done: Option<oneshot::Sender<IoResult>>,
}

impl DispatchedIo {
    pub fn request(&self) -> &IoRequest {
        &self.request
    }

    pub fn workload(&self) -> Option<WorkloadId> {
        self.binding.workload_id()
    }

    pub fn device(&self) -> DeviceId {
        self.binding.device_id()
    }

    /// Scheduler time at which the request left its queue.
    pub fn dispatched_at(&self) -> Duration {
        self.dispatched_at
    }

    pub fn complete(mut self, result: IoResult) {
        self.finish(result);
    }

    pub fn succeed(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.complete(Err(IoError::device(reason)));
    }

    fn finish(&mut self, result: IoResult) {
        if let Some(done) = self.done.take() {
            self.binding.complete_io(self.dispatched_at, result.is_ok());
            let _ = done.send(result);
        }
    }
}

impl Drop for DispatchedIo {
    fn drop(&mut self) {
        if self.done.is_some() {
            self.finish(Err(IoError::device("request dropped by device")));
        }
    }
}

impl fmt::Debug for DispatchedIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchedIo")
            .field("request", &self.request)
            .field("binding", &self.binding.id())
            .field("dispatched_at", &self.dispatched_at)
            .finish()
    }
}

//! Durability-completion notifications keyed by log position.
//!
//! A caller that needs to know when its commit is durable registers a
//! token; the token's sink is invoked once the log's flushed position
//! passes the position captured at registration time.

use std::collections::VecDeque;
use std::sync::Arc;

use ironbase_common::Lsn;
use parking_lot::Mutex;

use crate::kernel::StorageKernel;

/// Opaque completion cookie supplied by the caller.
pub type CheckpointToken = u64;

/// Receives durability notifications. Implementations must not block: the
/// notifier calls this outside its queue mutex but on the flushing thread.
pub trait CheckpointSink: Send + Sync {
    fn durable(&self, token: CheckpointToken);
}

struct CheckpointRequest {
    lsn: Lsn,
    token: CheckpointToken,
}

/// Queue of pending durability notifications.
///
/// The queue is append-only in enqueue order and is *not* sorted by LSN:
/// the captured position is sampled before the queue mutex is taken, so a
/// later entry may carry a smaller LSN. [`Self::on_log_flushed`] scans
/// from the head and stops at the first entry that is still unflushed; an
/// out-of-order entry behind it is simply notified on a later flush.
pub struct CheckpointNotifier {
    kernel: Arc<dyn StorageKernel>,
    sink: Arc<dyn CheckpointSink>,
    pending: Mutex<VecDeque<CheckpointRequest>>,
}

impl CheckpointNotifier {
    pub fn new(kernel: Arc<dyn StorageKernel>, sink: Arc<dyn CheckpointSink>) -> Self {
        Self {
            kernel,
            sink,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Request a notification once the log written so far is durable.
    ///
    /// If the flushed position has already passed the current written
    /// position, the token is notified immediately. Queue-space exhaustion
    /// degrades the same way instead of failing the request.
    pub fn request_checkpoint(&self, token: CheckpointToken) {
        let target = self.kernel.current_log_position();
        if self.kernel.flushed_log_position() >= target {
            self.sink.durable(token);
            return;
        }

        let mut pending = self.pending.lock();
        // The flush may have advanced while we were taking the mutex; a
        // queued entry would then wait for a flush that already happened.
        if self.kernel.flushed_log_position() >= target {
            drop(pending);
            self.sink.durable(token);
            return;
        }
        if pending.try_reserve(1).is_err() {
            log::warn!("checkpoint queue allocation failed, notifying token {token} immediately");
            drop(pending);
            self.sink.durable(token);
            return;
        }
        pending.push_back(CheckpointRequest { lsn: target, token });
    }

    /// Called by the log subsystem whenever the flushed position advances.
    ///
    /// Notifies, in enqueue order, every head entry whose target is now
    /// durable, and stops at the first that is not. Each token is notified
    /// exactly once.
    pub fn on_log_flushed(&self, flushed: Lsn) {
        let mut ready = Vec::new();
        {
            let mut pending = self.pending.lock();
            while let Some(front) = pending.front() {
                if front.lsn > flushed {
                    break;
                }
                if let Some(request) = pending.pop_front() {
                    ready.push(request.token);
                }
            }
        }
        // Notify outside the mutex: the sink may do real work.
        for token in ready {
            self.sink.durable(token);
        }
    }

    /// Number of requests still waiting for a flush.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Enqueue a request with an explicit target, bypassing the position
    /// sampling. Used by tests to construct the out-of-order queues that
    /// normally only arise from racing registrations.
    #[cfg(test)]
    fn enqueue_at(&self, lsn: Lsn, token: CheckpointToken) {
        self.pending
            .lock()
            .push_back(CheckpointRequest { lsn, token });
    }
}

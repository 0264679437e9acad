//! Garbage-collection coalescing: a single trace queue batches
//! `(hash, EntryOperation, Reason)` events with bounded parallelism and a
//! periodic flush, ordered best-effort (§4.1 "Garbage-collection
//! coalescing"). Ported from the teacher's `ParallelHandler`/
//! `proxmox-rrd::cache` journal-batching idiom: a bounded channel feeding a
//! background thread that drains either on a size threshold or a timeout.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};

use fc_api_types::ShortHash;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryOperation {
    Deleted,
    Updated,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcReason {
    GarbageCollect,
    Explicit,
}

#[derive(Clone, Copy, Debug)]
pub struct GcTraceEvent {
    pub hash: ShortHash,
    pub op: EntryOperation,
    pub reason: GcReason,
}

/// Sink invoked with a batch of coalesced events. Tests substitute an
/// in-memory sink; production wires this to the structured logger.
pub trait GcTraceSink: Send + Sync + 'static {
    fn flush_batch(&self, batch: &[GcTraceEvent]);
}

pub struct LoggingTraceSink;

impl GcTraceSink for LoggingTraceSink {
    fn flush_batch(&self, batch: &[GcTraceEvent]) {
        for event in batch {
            log::debug!(
                "gc: {:?} {:?} ({:?})",
                event.hash,
                event.op,
                event.reason
            );
        }
    }
}

pub struct GcTraceQueue {
    sender: Mutex<Option<Sender<GcTraceEvent>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

const MAX_BATCH: usize = 256;

impl GcTraceQueue {
    pub fn start(sink: Arc<dyn GcTraceSink>, flush_interval: Duration) -> Self {
        let (sender, receiver): (Sender<GcTraceEvent>, Receiver<GcTraceEvent>) = bounded(4096);

        let handle = std::thread::Builder::new()
            .name("gc-trace-queue".into())
            .spawn(move || Self::run(receiver, sink, flush_interval))
            .expect("failed to spawn gc trace queue thread");

        Self { sender: Mutex::new(Some(sender)), handle: Mutex::new(Some(handle)) }
    }

    pub fn record(&self, event: GcTraceEvent) {
        // Best-effort: a full queue or a closed receiver must never block
        // or fail the GC pass that produced the event.
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.try_send(event);
        }
    }

    fn run(receiver: Receiver<GcTraceEvent>, sink: Arc<dyn GcTraceSink>, flush_interval: Duration) {
        let ticker = tick(flush_interval);
        let mut batch = Vec::with_capacity(MAX_BATCH);

        loop {
            select! {
                recv(receiver) -> msg => {
                    match msg {
                        Ok(event) => {
                            batch.push(event);
                            if batch.len() >= MAX_BATCH {
                                sink.flush_batch(&batch);
                                batch.clear();
                            }
                        }
                        Err(_) => {
                            if !batch.is_empty() {
                                sink.flush_batch(&batch);
                            }
                            return;
                        }
                    }
                }
                recv(ticker) -> _ => {
                    if !batch.is_empty() {
                        sink.flush_batch(&batch);
                        batch.clear();
                    }
                }
            }
        }
    }

    /// Stops accepting new events and waits for the background thread to
    /// drain whatever remains.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSink(Arc<AtomicUsize>);

    impl GcTraceSink for CountingSink {
        fn flush_batch(&self, batch: &[GcTraceEvent]) {
            self.0.fetch_add(batch.len(), Ordering::SeqCst);
        }
    }

    #[test]
    fn batches_flush_on_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let queue = GcTraceQueue::start(Arc::new(CountingSink(Arc::clone(&count))), Duration::from_millis(20));

        for i in 0..10 {
            queue.record(GcTraceEvent {
                hash: ShortHash([i as u8; 12]),
                op: EntryOperation::Deleted,
                reason: GcReason::GarbageCollect,
            });
        }

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn shutdown_drains_whatever_is_still_queued() {
        let count = Arc::new(AtomicUsize::new(0));
        // A flush interval far longer than the test: anything that reaches
        // the sink only got there because `shutdown` closed the channel and
        // joined the thread, not because the timer fired.
        let queue = GcTraceQueue::start(Arc::new(CountingSink(Arc::clone(&count))), Duration::from_secs(60));

        for i in 0..5 {
            queue.record(GcTraceEvent {
                hash: ShortHash([i as u8; 12]),
                op: EntryOperation::Updated,
                reason: GcReason::Explicit,
            });
        }

        queue.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}

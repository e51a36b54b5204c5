//! Lock-free output channel for emitted event records
//!
//! This module decouples the hot path (handlers running on traced threads)
//! from the cold path (decoding, rendering and writing events).
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ TRACED THREAD (Hot Path)                                        │
//! │   nfs4_file_open returns → decide() → channel.push(record)      │
//! │   Lock-free enqueue, never blocks                               │
//! └─────────────────────────────────────────────────────────────────┘
//!                          │
//!                          │ Lock-free ArrayQueue
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ SIDECAR THREAD (Cold Path)                                      │
//! │   loop {                                                        │
//! │     batch = channel.drain(100);                                 │
//! │     sink.consume(batch);        // decode + render + write      │
//! │     sleep(10ms) if idle;                                        │
//! │   }                                                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Backpressure
//!
//! A full channel drops the record. Observation must never stall the open
//! call it observes; the consumer treats a missing record as silent loss.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::event_record::EventBytes;

/// Receives drained batches on the sidecar thread
pub trait RecordSink: Send + 'static {
    fn consume(&mut self, batch: &[EventBytes]);

    /// Called once after the final batch
    fn finish(&mut self) {}
}

/// Bounded multi-producer single-consumer channel of encoded records
pub struct OutputChannel {
    /// Lock-free bounded queue (crossbeam::ArrayQueue)
    queue: ArrayQueue<EventBytes>,

    /// Metrics: total records pushed
    total_pushed: AtomicU64,

    /// Metrics: total records dropped (backpressure)
    total_dropped: AtomicU64,
}

impl OutputChannel {
    /// Create a channel holding at most `capacity` records
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Output channel capacity must be > 0");

        Self {
            queue: ArrayQueue::new(capacity),
            total_pushed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Push a record (hot path)
    ///
    /// Returns false if the channel was full and the record was dropped.
    pub fn push(&self, record: EventBytes) -> bool {
        self.total_pushed.fetch_add(1, Ordering::Relaxed);

        match self.queue.push(record) {
            Ok(()) => true,
            Err(_dropped) => {
                self.total_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop one record (consumer side)
    pub fn pop(&self) -> Option<EventBytes> {
        self.queue.pop()
    }

    /// Pop up to `max` records (consumer side)
    pub fn drain(&self, max: usize) -> Vec<EventBytes> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        while batch.len() < max {
            match self.queue.pop() {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        batch
    }

    /// Get channel statistics
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    /// Start the sidecar thread draining this channel into `sink`
    pub fn spawn_consumer<S: RecordSink>(self: &Arc<Self>, sink: S) -> ConsumerHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let channel = Arc::clone(self);
        let shutdown_clone = shutdown.clone();
        let handle = thread::spawn(move || {
            sidecar_worker(&channel, &shutdown_clone, sink);
        });

        ConsumerHandle {
            handle: Some(handle),
            shutdown,
        }
    }
}

/// Sidecar worker thread (cold path)
fn sidecar_worker<S: RecordSink>(channel: &OutputChannel, shutdown: &AtomicBool, mut sink: S) {
    const BATCH_SIZE: usize = 100;
    const SLEEP_MS: u64 = 10;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            // Drain remaining records before shutting down
            loop {
                let batch = channel.drain(BATCH_SIZE);
                if batch.is_empty() {
                    break;
                }
                sink.consume(&batch);
            }
            sink.finish();
            break;
        }

        let batch = channel.drain(BATCH_SIZE);
        if batch.is_empty() {
            // Sleep if channel empty (prevent busy-wait)
            thread::sleep(Duration::from_millis(SLEEP_MS));
        } else {
            sink.consume(&batch);
        }
    }
}

/// Owns the sidecar thread; dropping it drains and joins
pub struct ConsumerHandle {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ConsumerHandle {
    /// Drain what is left, then stop the sidecar thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("event consumer thread panicked");
            }
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Channel statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl ChannelStats {
    /// Calculate drop rate (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        if self.total_pushed == 0 {
            0.0
        } else {
            self.total_dropped as f64 / self.total_pushed as f64
        }
    }

    /// Calculate channel utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.current_size as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_record::EVENT_RECORD_SIZE;
    use std::sync::Mutex;

    fn record(tag: u8) -> EventBytes {
        [tag; EVENT_RECORD_SIZE]
    }

    #[test]
    fn test_channel_creation() {
        let channel = OutputChannel::new(1024);
        let stats = channel.stats();
        assert_eq!(stats.capacity, 1024);
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.total_pushed, 0);
        assert_eq!(stats.total_dropped, 0);
    }

    #[test]
    #[should_panic(expected = "Output channel capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = OutputChannel::new(0);
    }

    #[test]
    fn test_full_channel_drops() {
        let channel = OutputChannel::new(2);
        assert!(channel.push(record(1)));
        assert!(channel.push(record(2)));
        assert!(!channel.push(record(3)));

        let stats = channel.stats();
        assert_eq!(stats.total_pushed, 3);
        assert_eq!(stats.total_dropped, 1);

        // Oldest records survive, the overflow is lost
        let drained = channel.drain(10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0][0], 1);
        assert_eq!(drained[1][0], 2);
    }

    #[derive(Clone, Default)]
    struct CollectSink {
        seen: Arc<Mutex<Vec<u8>>>,
        finished: Arc<AtomicBool>,
    }

    impl RecordSink for CollectSink {
        fn consume(&mut self, batch: &[EventBytes]) {
            self.seen.lock().unwrap().extend(batch.iter().map(|r| r[0]));
        }

        fn finish(&mut self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_consumer_drains_on_shutdown() {
        let channel = Arc::new(OutputChannel::new(512));
        for i in 0..250u32 {
            channel.push(record((i % 251) as u8));
        }

        let sink = CollectSink::default();
        let handle = channel.spawn_consumer(sink.clone());
        handle.shutdown();

        assert_eq!(sink.seen.lock().unwrap().len(), 250);
        assert!(sink.finished.load(Ordering::SeqCst));
        assert_eq!(channel.stats().current_size, 0);
    }

    #[test]
    fn test_drop_rate_calculation() {
        let stats = ChannelStats {
            total_pushed: 100,
            total_dropped: 5,
            current_size: 50,
            capacity: 1024,
        };

        assert_eq!(stats.drop_rate(), 0.05);
        assert_eq!(stats.utilization(), 50.0 / 1024.0);
    }
}

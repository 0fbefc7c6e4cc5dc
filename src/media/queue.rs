//! Bounded frame hand-off between the pump and an output thread
//!
//! The queue never blocks the producer: when full, the oldest frame is
//! evicted so the consumer always sees the freshest ones.

use super::{Frame, FrameSink, MediaError};
use crossbeam::queue::ArrayQueue;
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bounded drop-oldest queue
pub struct FrameQueue<T> {
    items: ArrayQueue<T>,
    lock: Mutex<()>,
    ready: Condvar,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    /// A zero capacity is raised to 1
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            lock: Mutex::new(()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push, evicting and returning the oldest item if the queue was full
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = self.items.force_push(item);
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        let _guard = self.lock.lock();
        self.ready.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.pop()
    }

    /// Wait up to `timeout` for an item. Returns `None` on timeout or once
    /// the queue is closed and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if let Some(item) = self.items.pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            if self.ready.wait_until(&mut guard, deadline).timed_out() {
                return self.items.pop();
            }
        }
    }

    /// Wake every waiter; items already queued can still be popped
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Items evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Display sink that writes frame payloads from a dedicated thread
pub struct QueuedSink {
    queue: Arc<FrameQueue<Frame>>,
    writer: Option<JoinHandle<std::io::Result<u64>>>,
}

impl QueuedSink {
    pub fn spawn<W>(capacity: usize, mut out: W) -> std::io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let queue = Arc::new(FrameQueue::<Frame>::new(capacity));
        let consumer = queue.clone();

        let writer = std::thread::Builder::new()
            .name("frame-writer".to_string())
            .spawn(move || {
                let mut written = 0u64;
                loop {
                    match consumer.pop_timeout(Duration::from_millis(100)) {
                        Some(frame) => {
                            out.write_all(&frame.data)?;
                            written += 1;
                        }
                        None if consumer.is_closed() => break,
                        None => {}
                    }
                }
                out.flush()?;
                Ok(written)
            })?;

        Ok(Self {
            queue,
            writer: Some(writer),
        })
    }

    pub fn queue(&self) -> &Arc<FrameQueue<Frame>> {
        &self.queue
    }
}

impl FrameSink for QueuedSink {
    fn deliver(&mut self, frame: Frame) -> Result<(), MediaError> {
        if self.queue.is_closed() {
            return Err(MediaError::SinkClosed);
        }
        if self.writer.as_ref().map_or(true, |w| w.is_finished()) {
            self.close();
            return Err(MediaError::SinkClosed);
        }
        if let Some(old) = self.queue.push(frame) {
            debug!("Output behind, dropped {}", old);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.queue.close();
        let Some(writer) = self.writer.take() else {
            return;
        };
        match writer.join() {
            Ok(Ok(written)) => info!(
                "Frame writer finished: {} written, {} dropped",
                written,
                self.queue.dropped()
            ),
            Ok(Err(e)) => error!("Frame writer failed: {}", e),
            Err(_) => error!("Frame writer panicked"),
        }
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        FrameSink::close(self);
    }
}

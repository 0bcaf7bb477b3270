use std::{
    collections::VecDeque,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use air_brakes_flight_core::{QueueMetrics, SensorSample};
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, time};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Bounded FIFO between the sensor producers and the control loop.
///
/// When full the oldest unread sample is evicted. Depth and drop count are
/// atomics so any thread can read them without taking the lock.
pub struct PacketQueue {
    buffer: Mutex<VecDeque<SensorSample>>,
    capacity: usize,
    depth: AtomicUsize,
    dropped: AtomicU64,
    pushed: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            depth: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            pushed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Never blocks on the consumer. Returns true if an old sample was evicted.
    pub fn push(&self, sample: SensorSample) -> bool {
        let evicted = {
            let mut buffer = self.lock();
            let evicted = if buffer.len() >= self.capacity {
                buffer.pop_front();
                true
            } else {
                false
            };
            buffer.push_back(sample);
            self.depth.store(buffer.len(), Ordering::Release);
            evicted
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 1000 == 0 {
                log::warn!("packet queue full, {} samples dropped so far", dropped);
            }
        }
        self.notify.notify_one();
        evicted
    }

    /// Everything buffered, oldest first. With `blocking` waits until at least
    /// one sample is available or the queue is closed.
    pub async fn drain(&self, blocking: bool) -> Vec<SensorSample> {
        loop {
            let notified = self.notify.notified();
            let batch = self.take_all();
            if !batch.is_empty() || !blocking || self.is_closed() {
                return batch;
            }
            notified.await;
        }
    }

    /// Blocking drain that gives up after `budget` with an empty batch.
    pub async fn drain_within(&self, budget: Duration) -> Vec<SensorSample> {
        time::timeout(budget, self.drain(true))
            .await
            .unwrap_or_default()
    }

    /// Mark the producer side as finished and wake any waiting drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            depth: self.depth() as u32,
            dropped: self.dropped(),
        }
    }

    fn take_all(&self) -> Vec<SensorSample> {
        // swap the deque out so producers only wait for a pointer swap
        let batch = {
            let mut buffer = self.lock();
            self.depth.store(0, Ordering::Release);
            std::mem::take(&mut *buffer)
        };
        batch.into()
    }

    // a producer that panicked mid-push leaves a valid deque behind
    fn lock(&self) -> MutexGuard<'_, VecDeque<SensorSample>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

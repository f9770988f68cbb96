//! Bounded single-producer/single-consumer sample queue.
//!
//! Storage and index bookkeeping come from `ringbuf`'s `HeapRb`, which is
//! wait-free on both halves. On top of that each half can park: a full producer
//! waits for "space available", an empty consumer waits for "data available".
//!
//! The audio callback only ever uses the `try_*` operations and `clear`, which
//! never park and never take a lock.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;

use crate::signal::Signal;

#[derive(Default)]
struct RingSignals {
    space: Signal,
    data: Signal,
}

/// Creates a ring holding at most `capacity` samples.
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    let rb = HeapRb::<f32>::new(capacity.max(1));
    let (producer, consumer) = rb.split();
    let signals = Arc::new(RingSignals::default());
    (
        RingProducer {
            inner: producer,
            signals: Arc::clone(&signals),
        },
        RingConsumer {
            inner: consumer,
            signals,
        },
    )
}

/// Wakes whichever side of a ring is parked, from any thread that does not own it.
#[derive(Clone)]
pub struct RingWaker {
    signals: Arc<RingSignals>,
}

impl RingWaker {
    pub fn wake_producer(&self) {
        self.signals.space.notify();
    }

    pub fn wake_consumer(&self) {
        self.signals.data.notify();
    }

    pub fn producer_parked(&self) -> bool {
        self.signals.space.waiters() > 0
    }

    pub fn consumer_parked(&self) -> bool {
        self.signals.data.waiters() > 0
    }
}

pub struct RingProducer {
    inner: HeapProd<f32>,
    signals: Arc<RingSignals>,
}

impl RingProducer {
    /// Pushes one sample, parking while the ring is full.
    pub fn enqueue(&mut self, sample: f32) {
        // `|| false` never cancels, so this only returns once the sample is in.
        let _ = self.enqueue_unless(sample, || false);
    }

    /// Like [`enqueue`](Self::enqueue), but gives up as soon as `cancelled()` is
    /// true and hands the sample back.
    pub fn enqueue_unless(
        &mut self,
        sample: f32,
        cancelled: impl Fn() -> bool,
    ) -> Result<(), f32> {
        let mut pending = sample;
        loop {
            match self.inner.try_push(pending) {
                Ok(()) => {
                    self.signals.data.notify();
                    return Ok(());
                }
                Err(rejected) => pending = rejected,
            }
            if cancelled() {
                return Err(pending);
            }
            let inner = &self.inner;
            self.signals
                .space
                .wait_until(|| !inner.is_full() || cancelled());
        }
    }

    /// Parks until at least one slot is free or `cancelled()` is true.
    pub fn wait_vacant(&self, cancelled: impl Fn() -> bool) {
        let inner = &self.inner;
        self.signals
            .space
            .wait_until(|| !inner.is_full() || cancelled());
    }

    /// Non-blocking push, safe on the audio thread.
    pub fn try_enqueue(&mut self, sample: f32) -> Result<(), f32> {
        self.inner.try_push(sample)?;
        self.signals.data.notify_rt();
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn size(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn vacant(&self) -> usize {
        self.inner.vacant_len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    pub fn waker(&self) -> RingWaker {
        RingWaker {
            signals: Arc::clone(&self.signals),
        }
    }
}

pub struct RingConsumer {
    inner: HeapCons<f32>,
    signals: Arc<RingSignals>,
}

impl RingConsumer {
    /// Pops one sample, parking while the ring is empty.
    pub fn dequeue(&mut self) -> f32 {
        loop {
            if let Some(sample) = self.dequeue_unless(|| false) {
                return sample;
            }
        }
    }

    /// Like [`dequeue`](Self::dequeue), but returns `None` as soon as
    /// `cancelled()` is true.
    pub fn dequeue_unless(&mut self, cancelled: impl Fn() -> bool) -> Option<f32> {
        loop {
            if let Some(sample) = self.inner.try_pop() {
                self.signals.space.notify();
                return Some(sample);
            }
            if cancelled() {
                return None;
            }
            let inner = &self.inner;
            self.signals
                .data
                .wait_until(|| !inner.is_empty() || cancelled());
        }
    }

    /// Non-blocking pop, safe on the audio thread.
    pub fn try_dequeue(&mut self) -> Option<f32> {
        let sample = self.inner.try_pop()?;
        self.signals.space.notify_rt();
        Some(sample)
    }

    /// Discards everything buffered. Returns how many samples were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.inner.clear();
        self.signals.space.notify_rt();
        dropped
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn size(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    pub fn waker(&self) -> RingWaker {
        RingWaker {
            signals: Arc::clone(&self.signals),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_capacity_items_fit_without_blocking() {
        let (mut producer, consumer) = ring_buffer(4);
        for i in 0..4 {
            producer.enqueue(i as f32);
        }
        assert!(producer.is_full());
        assert!(consumer.is_full());
        assert_eq!(consumer.size(), 4);
        assert_eq!(producer.capacity(), 4);
    }

    #[test]
    fn test_enqueue_on_full_blocks_until_one_dequeue() {
        let (mut producer, mut consumer) = ring_buffer(2);
        producer.enqueue(1.0);
        producer.enqueue(2.0);
        let waker = producer.waker();

        let done = std::sync::Arc::new(AtomicBool::new(false));
        let done_flag = std::sync::Arc::clone(&done);
        let handle = thread::spawn(move || {
            producer.enqueue(3.0);
            done_flag.store(true, Ordering::SeqCst);
            producer
        });

        while !waker.producer_parked() {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));

        assert_eq!(consumer.dequeue(), 1.0);
        let producer = handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(producer.size(), 2);
        assert_eq!(consumer.dequeue(), 2.0);
        assert_eq!(consumer.dequeue(), 3.0);
    }

    #[test]
    fn test_dequeue_on_empty_blocks_until_one_enqueue() {
        let (mut producer, mut consumer) = ring_buffer(8);
        let waker = consumer.waker();
        let handle = thread::spawn(move || consumer.dequeue());

        while !waker.consumer_parked() {
            thread::yield_now();
        }
        producer.enqueue(0.25);
        assert_eq!(handle.join().unwrap(), 0.25);
    }

    #[test]
    fn test_size_tracks_enqueues_minus_dequeues() {
        let (mut producer, mut consumer) = ring_buffer(16);
        let mut expected = 0usize;
        for round in 0..5 {
            for _ in 0..(round + 2) {
                producer.enqueue(0.0);
                expected += 1;
            }
            assert_eq!(consumer.size(), expected);
            consumer.dequeue();
            expected -= 1;
            assert_eq!(producer.size(), expected);
        }
    }

    #[test]
    fn test_try_operations_never_block() {
        let (mut producer, mut consumer) = ring_buffer(1);
        assert_eq!(consumer.try_dequeue(), None);
        assert!(producer.try_enqueue(0.5).is_ok());
        assert_eq!(producer.try_enqueue(0.75), Err(0.75));
        assert_eq!(consumer.try_dequeue(), Some(0.5));
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_cancelled_enqueue_returns_sample() {
        let (mut producer, _consumer) = ring_buffer(1);
        producer.enqueue(1.0);
        let cancel = std::sync::Arc::new(AtomicBool::new(false));
        let waker = producer.waker();

        let flag = std::sync::Arc::clone(&cancel);
        let handle =
            thread::spawn(move || producer.enqueue_unless(2.0, || flag.load(Ordering::SeqCst)));

        while !waker.producer_parked() {
            thread::yield_now();
        }
        cancel.store(true, Ordering::SeqCst);
        waker.wake_producer();
        assert_eq!(handle.join().unwrap(), Err(2.0));
    }

    #[test]
    fn test_clear_drops_everything_and_frees_space() {
        let (mut producer, mut consumer) = ring_buffer(3);
        for _ in 0..3 {
            producer.enqueue(0.1);
        }
        assert_eq!(consumer.clear(), 3);
        assert!(consumer.is_empty());
        assert_eq!(producer.vacant(), 3);
    }
}

//! Frame and event delivery across the capture/consumer boundary.
//!
//! Frames flow through a bounded [`FrameQueue`]. With the default drop-oldest
//! policy a slow consumer loses the stalest frames and the first drop of each
//! burst is reported as [`CameraEvent::StreamDegraded`]; drops never surface
//! as session errors.

use crate::types::CameraFrame;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::errors::CameraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "policy")]
pub enum BufferPolicy {
    DropOldest { capacity: usize },
    /// Producer waits for space.
    Block { capacity: usize },
}

impl BufferPolicy {
    pub fn capacity(&self) -> usize {
        match self {
            BufferPolicy::DropOldest { capacity } | BufferPolicy::Block { capacity } => *capacity,
        }
    }
}

impl Default for BufferPolicy {
    fn default() -> Self {
        BufferPolicy::DropOldest { capacity: 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest item.
    DroppedOldest,
    /// Not queued: the queue closed or the producer was told to stop.
    Rejected,
}

pub struct FrameQueue<T> {
    inner: Mutex<QueueInner<T>>,
    cv: Condvar,
    notify: Notify,
    policy: BufferPolicy,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
    closed: bool,
}

impl<T> FrameQueue<T> {
    pub fn new(policy: BufferPolicy) -> Self {
        let capacity = policy.capacity().max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                dropped: 0,
                closed: false,
            }),
            cv: Condvar::new(),
            notify: Notify::new(),
            policy,
        }
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    /// Push according to the queue policy. `stop` lets a blocked producer
    /// give up when its owner shuts down.
    pub fn push(&self, item: T, stop: &AtomicBool) -> Result<PushOutcome, CameraError> {
        match self.policy {
            BufferPolicy::DropOldest { .. } => self.push_drop_oldest(item),
            BufferPolicy::Block { .. } => self.push_blocking(item, stop),
        }
    }

    fn push_drop_oldest(&self, item: T) -> Result<PushOutcome, CameraError> {
        self.push_coalescing(item, |_| false)
    }

    /// Drop-oldest push that overwrites the newest queued item instead when
    /// `same` matches it, so a run of equivalent items occupies one slot.
    pub fn push_coalescing<F>(&self, item: T, same: F) -> Result<PushOutcome, CameraError>
    where
        F: Fn(&T) -> bool,
    {
        let mut g = self.inner.lock().map_err(|_| CameraError::poisoned_lock())?;
        if g.closed {
            return Ok(PushOutcome::Rejected);
        }

        let mut outcome = PushOutcome::Queued;
        match g.items.back_mut() {
            Some(back) if same(back) => *back = item,
            _ => {
                if g.items.len() >= g.capacity {
                    g.items.pop_front();
                    g.dropped = g.dropped.saturating_add(1);
                    outcome = PushOutcome::DroppedOldest;
                }
                g.items.push_back(item);
            }
        }
        drop(g);

        self.cv.notify_one();
        self.notify.notify_one();
        Ok(outcome)
    }

    fn push_blocking(&self, item: T, stop: &AtomicBool) -> Result<PushOutcome, CameraError> {
        let mut g = self.inner.lock().map_err(|_| CameraError::poisoned_lock())?;
        loop {
            if g.closed || stop.load(Ordering::Relaxed) {
                return Ok(PushOutcome::Rejected);
            }
            if g.items.len() < g.capacity {
                break;
            }
            let (ng, _) = self
                .cv
                .wait_timeout(g, Duration::from_millis(50))
                .map_err(|_| CameraError::poisoned_lock())?;
            g = ng;
        }
        g.items.push_back(item);
        drop(g);

        self.cv.notify_all();
        self.notify.notify_one();
        Ok(PushOutcome::Queued)
    }

    pub fn try_pop(&self) -> Result<Option<T>, CameraError> {
        let mut g = self.inner.lock().map_err(|_| CameraError::poisoned_lock())?;
        let item = g.items.pop_front();
        drop(g);
        if item.is_some() {
            self.cv.notify_all();
        }
        Ok(item)
    }

    /// Wait up to `timeout` for an item. `Ok(None)` on timeout; an error
    /// once the queue is closed and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>, CameraError> {
        let mut g = self.inner.lock().map_err(|_| CameraError::poisoned_lock())?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = g.items.pop_front() {
                drop(g);
                self.cv.notify_all();
                return Ok(Some(item));
            }
            if g.closed {
                return Err(CameraError::InvalidSessionState(
                    "frame stream is closed".to_string(),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let remaining = deadline - now;
            let (ng, _) = self
                .cv
                .wait_timeout(g, remaining)
                .map_err(|_| CameraError::poisoned_lock())?;
            g = ng;
        }
    }

    /// Await the next item; `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            match self.try_pop() {
                Ok(Some(item)) => return Some(item),
                Ok(None) => {}
                Err(_) => return None,
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().map(|g| g.dropped).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|g| g.closed).unwrap_or(true)
    }

    pub fn close(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.closed = true;
        }
        self.cv.notify_all();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Events pushed to the host for one camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum CameraEvent {
    #[serde(rename_all = "camelCase")]
    FrameAvailable {
        sequence: u64,
        width: u32,
        height: u32,
        timestamp_us: u64,
    },
    #[serde(rename_all = "camelCase")]
    DeviceError { code: String, message: String },
    SessionInterrupted { message: String },
    /// Consumer fell behind and frames were discarded.
    StreamDegraded { dropped: u64 },
    Closed,
}

/// Events held per camera before the oldest are discarded.
pub const EVENT_CAPACITY: usize = 64;

/// Bounded, thread-safe event queue. Clones share one queue.
///
/// Consecutive `FrameAvailable` announcements collapse into the newest one,
/// so a host that only pulls frames never grows the queue past
/// [`EVENT_CAPACITY`].
#[derive(Clone)]
pub struct EventChannel {
    queue: Arc<FrameQueue<CameraEvent>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(FrameQueue::new(BufferPolicy::DropOldest {
                capacity: EVENT_CAPACITY,
            })),
        }
    }

    /// Usable from any thread, including capture threads outside the runtime.
    pub fn send(&self, event: CameraEvent) {
        let coalesce = matches!(event, CameraEvent::FrameAvailable { .. });
        let pushed = self.queue.push_coalescing(event, |queued| {
            coalesce && matches!(queued, CameraEvent::FrameAvailable { .. })
        });
        match pushed {
            Ok(PushOutcome::DroppedOldest) => log::debug!("Event queue full, oldest event discarded"),
            Ok(_) => {}
            Err(e) => log::warn!("Event dropped: {}", e),
        }
    }

    /// Next event without waiting.
    pub async fn poll_event(&self) -> Option<CameraEvent> {
        self.queue.try_pop().ok().flatten()
    }

    pub async fn wait_for_event(&self) -> Option<CameraEvent> {
        self.queue.recv().await
    }

    pub async fn wait_for_event_timeout(&self, timeout: Duration) -> Option<CameraEvent> {
        tokio::time::timeout(timeout, self.wait_for_event())
            .await
            .ok()
            .flatten()
    }

    /// Events waiting to be read.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of the video data output.
#[derive(Clone)]
pub struct ImageStreamHandler {
    queue: Arc<FrameQueue<CameraFrame>>,
    events: EventChannel,
    in_drop_burst: Arc<AtomicBool>,
}

impl ImageStreamHandler {
    pub fn new(policy: BufferPolicy, events: EventChannel) -> Self {
        Self {
            queue: Arc::new(FrameQueue::new(policy)),
            events,
            in_drop_burst: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Producer side: queue a frame and announce it.
    pub fn deliver(&self, frame: CameraFrame, stop: &AtomicBool) -> Result<PushOutcome, CameraError> {
        let announcement = CameraEvent::FrameAvailable {
            sequence: frame.sequence,
            width: frame.width,
            height: frame.height,
            timestamp_us: frame.timestamp_us,
        };

        let outcome = self.queue.push(frame, stop)?;
        match outcome {
            PushOutcome::Queued => {
                self.in_drop_burst.store(false, Ordering::Relaxed);
                self.events.send(announcement);
            }
            PushOutcome::DroppedOldest => {
                if !self.in_drop_burst.swap(true, Ordering::Relaxed) {
                    let dropped = self.queue.dropped();
                    log::debug!("Frame consumer behind, {} frames dropped so far", dropped);
                    self.events.send(CameraEvent::StreamDegraded { dropped });
                }
                self.events.send(announcement);
            }
            PushOutcome::Rejected => {}
        }
        Ok(outcome)
    }

    pub fn next_frame(&self, timeout: Duration) -> Result<Option<CameraFrame>, CameraError> {
        self.queue.pop_timeout(timeout)
    }

    pub async fn recv_frame(&self) -> Option<CameraFrame> {
        self.queue.recv().await
    }

    pub async fn recv_frame_timeout(&self, timeout: Duration) -> Option<CameraFrame> {
        tokio::time::timeout(timeout, self.recv_frame())
            .await
            .ok()
            .flatten()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    pub fn close(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::synthetic_video_frame;

    fn frame(seq: u64) -> CameraFrame {
        let mut f = synthetic_video_frame(seq, 4, 4);
        f.sequence = seq;
        f
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let queue = FrameQueue::new(BufferPolicy::DropOldest { capacity: 2 });
        let stop = AtomicBool::new(false);
        for i in 0..5u64 {
            queue.push(i, &stop).unwrap();
        }
        assert_eq!(queue.dropped(), 3);
        assert_eq!(queue.try_pop().unwrap(), Some(3));
        assert_eq!(queue.try_pop().unwrap(), Some(4));
        assert_eq!(queue.try_pop().unwrap(), None);
    }

    #[test]
    fn test_pop_timeout_returns_none_when_empty() {
        let queue: FrameQueue<u64> = FrameQueue::new(BufferPolicy::default());
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_closed_queue_errors_after_drain() {
        let queue = FrameQueue::new(BufferPolicy::default());
        let stop = AtomicBool::new(false);
        queue.push(1u64, &stop).unwrap();
        queue.close();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)).unwrap(), Some(1));
        assert!(queue.pop_timeout(Duration::from_millis(10)).is_err());
        assert_eq!(queue.push(2, &stop).unwrap(), PushOutcome::Rejected);
    }

    #[test]
    fn test_block_policy_waits_for_consumer() {
        let queue = Arc::new(FrameQueue::new(BufferPolicy::Block { capacity: 1 }));
        let stop = Arc::new(AtomicBool::new(false));
        queue.push(1u64, &stop).unwrap();

        let producer = {
            let queue = queue.clone();
            let stop = stop.clone();
            std::thread::spawn(move || queue.push(2u64, &stop).unwrap())
        };

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop().unwrap(), Some(1));
        assert_eq!(producer.join().unwrap(), PushOutcome::Queued);
        assert_eq!(queue.try_pop().unwrap(), Some(2));
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_block_policy_releases_on_stop() {
        let queue = Arc::new(FrameQueue::new(BufferPolicy::Block { capacity: 1 }));
        let stop = Arc::new(AtomicBool::new(false));
        queue.push(1u64, &stop).unwrap();

        let producer = {
            let queue = queue.clone();
            let stop = stop.clone();
            std::thread::spawn(move || queue.push(2u64, &stop).unwrap())
        };
        stop.store(true, Ordering::Relaxed);
        assert_eq!(producer.join().unwrap(), PushOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_async_recv_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(BufferPolicy::default()));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(7u64, &AtomicBool::new(false)).unwrap();
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_async_recv_ends_on_close() {
        let queue: Arc<FrameQueue<u64>> = Arc::new(FrameQueue::new(BufferPolicy::default()));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_degraded_signal_once_per_burst() {
        let events = EventChannel::new();
        let handler = ImageStreamHandler::new(BufferPolicy::DropOldest { capacity: 1 }, events.clone());
        let stop = AtomicBool::new(false);

        for seq in 0..4 {
            handler.deliver(frame(seq), &stop).unwrap();
        }

        let mut degraded = 0;
        let mut available = 0;
        while let Some(event) = events.poll_event().await {
            match event {
                CameraEvent::StreamDegraded { .. } => degraded += 1,
                CameraEvent::FrameAvailable { .. } => available += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(degraded, 1);
        // Announcements after the degraded signal collapse into the newest.
        assert_eq!(available, 2);
        assert_eq!(handler.dropped_frames(), 3);
    }

    #[tokio::test]
    async fn test_unread_frame_events_stay_bounded() {
        let events = EventChannel::new();
        let handler = ImageStreamHandler::new(BufferPolicy::DropOldest { capacity: 2 }, events.clone());
        let stop = AtomicBool::new(false);

        for seq in 0..1000 {
            handler.deliver(frame(seq), &stop).unwrap();
            handler.next_frame(Duration::ZERO).unwrap();
        }

        assert_eq!(events.pending(), 1);
        assert!(matches!(
            events.poll_event().await,
            Some(CameraEvent::FrameAvailable { sequence: 999, .. })
        ));
    }

    #[tokio::test]
    async fn test_event_queue_discards_oldest_when_full() {
        let events = EventChannel::new();
        for i in 0..(EVENT_CAPACITY as u64 + 10) {
            events.send(CameraEvent::StreamDegraded { dropped: i });
        }
        assert_eq!(events.pending(), EVENT_CAPACITY);
        assert_eq!(events.dropped_events(), 10);
        assert_eq!(
            events.poll_event().await,
            Some(CameraEvent::StreamDegraded { dropped: 10 })
        );
    }

    #[test]
    fn test_coalescing_push_overwrites_matching_tail() {
        let queue = FrameQueue::new(BufferPolicy::DropOldest { capacity: 4 });
        let odd = |n: &u64| n % 2 == 1;
        queue.push_coalescing(2u64, odd).unwrap();
        queue.push_coalescing(3u64, odd).unwrap();
        queue.push_coalescing(5u64, odd).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap(), Some(2));
        assert_eq!(queue.try_pop().unwrap(), Some(5));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(CameraEvent::StreamDegraded { dropped: 3 }).unwrap();
        assert_eq!(json["event"], "streamDegraded");
        assert_eq!(json["dropped"], 3);
    }
}

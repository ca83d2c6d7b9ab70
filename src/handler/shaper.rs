//! Traffic shaping: bandwidth limits and reordering.
//!
//! Both shapers queue frames in `handle_traffic` and release them from a
//! worker thread, so the pushing thread never waits. Queues are bounded and
//! overflow is tail-dropped with a notification.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, trace};

use crate::error::Result;
use crate::frame::Frame;
use crate::handler::{HandlerCore, TrafficHandler};
use crate::worker::{StopSignal, Worker};

/// Default bound of a shaper's queue, in frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How long an idle reorderer sleeps between stop checks.
const IDLE_WAIT: Duration = Duration::from_millis(10);

struct BucketState {
    queue: VecDeque<Frame>,
    credit: usize,
}

struct ConstrainerInner {
    core: HandlerCore,
    bytes_per_tick: usize,
    capacity: usize,
    state: Mutex<BucketState>,
}

impl ConstrainerInner {
    /// Adds one tick of credit and releases the frames it covers.
    fn tick(&self) {
        if !self.core.is_running() {
            return;
        }
        let released: Vec<Frame> = {
            let mut state = self.state.lock();
            state.credit = state.credit.saturating_add(self.bytes_per_tick);
            let mut released = Vec::new();
            while let Some(frame) = state.queue.front() {
                let length = frame.len();
                if length > state.credit {
                    break;
                }
                state.credit -= length;
                if let Some(frame) = state.queue.pop_front() {
                    released.push(frame);
                }
            }
            if state.queue.is_empty() {
                // idle links do not save up bursts
                state.credit = state.credit.min(self.bytes_per_tick);
            }
            released
        };
        for frame in released {
            self.core.notify_next(frame);
        }
    }
}

/// Limits throughput with a token bucket.
///
/// Every `tick` the bucket gains `bytes_per_tick` bytes of credit and
/// releases queued frames, in arrival order, while the credit covers them.
/// Frames larger than one tick's credit wait until enough has built up.
/// While paused no credit is added.
pub struct SpeedConstrainer {
    inner: Arc<ConstrainerInner>,
    tick: Duration,
    ticker: Mutex<Option<Worker>>,
}

impl SpeedConstrainer {
    pub fn new(name: impl Into<String>, bytes_per_tick: usize, tick: Duration) -> Self {
        Self::with_capacity(name, bytes_per_tick, tick, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, bytes_per_tick: usize, tick: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(ConstrainerInner {
                core: HandlerCore::new(name),
                bytes_per_tick,
                capacity,
                state: Mutex::new(BucketState {
                    queue: VecDeque::new(),
                    credit: 0,
                }),
            }),
            tick,
            ticker: Mutex::new(None),
        }
    }

    /// Throughput in bytes per second.
    pub fn rate(&self) -> f64 {
        self.inner.bytes_per_tick as f64 / self.tick.as_secs_f64()
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl TrafficHandler for SpeedConstrainer {
    fn core(&self) -> &HandlerCore {
        &self.inner.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        let accepted = {
            let mut state = self.inner.state.lock();
            if state.queue.len() >= self.inner.capacity {
                false
            } else {
                state.queue.push_back(frame);
                true
            }
        };
        if !accepted {
            self.inner.core.drop_frame("shaper queue full");
        }
        Ok(())
    }

    fn on_start(&self) -> Result<()> {
        let inner = self.inner.clone();
        let worker = Worker::periodic(format!("{}-ticker", self.name()), self.tick, move || inner.tick())?;
        *self.ticker.lock() = Some(worker);
        Ok(())
    }

    fn on_stop(&self) {
        let worker = self.ticker.lock().take();
        drop(worker);
        let discarded = {
            let mut state = self.inner.state.lock();
            state.credit = 0;
            std::mem::take(&mut state.queue)
        };
        for _ in &discarded {
            self.inner.core.drop_frame("shaper stopped");
        }
    }
}

struct Delayed {
    due: Instant,
    sequence: u64,
    frame: Frame,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.sequence).cmp(&(other.due, other.sequence))
    }
}

#[derive(Default)]
struct DelayQueue {
    heap: BinaryHeap<Reverse<Delayed>>,
    sequence: u64,
}

struct ReordererInner {
    core: HandlerCore,
    max_jitter: Duration,
    capacity: usize,
    queue: Mutex<DelayQueue>,
    arrived: Condvar,
}

impl ReordererInner {
    fn release_loop(&self, signal: &StopSignal) {
        while !signal.is_stopped() {
            let due: Vec<Frame> = {
                let mut queue = self.queue.lock();
                if !self.core.is_running() {
                    // paused: frames keep their due times until resumed
                    self.arrived.wait_for(&mut queue, IDLE_WAIT);
                    continue;
                }
                let now = Instant::now();
                let mut due = Vec::new();
                while queue.heap.peek().is_some_and(|Reverse(next)| next.due <= now) {
                    if let Some(Reverse(delayed)) = queue.heap.pop() {
                        due.push(delayed.frame);
                    }
                }
                if due.is_empty() {
                    let wait = queue
                        .heap
                        .peek()
                        .map_or(IDLE_WAIT, |Reverse(next)| next.due.saturating_duration_since(now).min(IDLE_WAIT));
                    self.arrived.wait_for(&mut queue, wait);
                }
                due
            };
            for frame in due {
                trace!(handler = %self.core.name(), "Releasing delayed frame");
                self.core.notify_next(frame);
            }
        }
    }
}

/// Delays every frame by a random amount up to `max_jitter`.
///
/// Frames leave in the order their delays expire, which reorders traffic
/// whose inter-arrival gaps are shorter than the jitter.
pub struct PacketReorderer {
    inner: Arc<ReordererInner>,
    releaser: Mutex<Option<Worker>>,
}

impl PacketReorderer {
    pub fn new(name: impl Into<String>, max_jitter: Duration) -> Self {
        Self::with_capacity(name, max_jitter, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, max_jitter: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(ReordererInner {
                core: HandlerCore::new(name),
                max_jitter,
                capacity,
                queue: Mutex::new(DelayQueue::default()),
                arrived: Condvar::new(),
            }),
            releaser: Mutex::new(None),
        }
    }

    pub fn max_jitter(&self) -> Duration {
        self.inner.max_jitter
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().heap.len()
    }
}

impl TrafficHandler for PacketReorderer {
    fn core(&self) -> &HandlerCore {
        &self.inner.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        let jitter_micros = self.inner.max_jitter.as_micros().min(u64::MAX as u128) as u64;
        let delay = Duration::from_micros(rand::thread_rng().gen_range(0..=jitter_micros));
        let accepted = {
            let mut queue = self.inner.queue.lock();
            if queue.heap.len() >= self.inner.capacity {
                false
            } else {
                queue.sequence += 1;
                let sequence = queue.sequence;
                queue.heap.push(Reverse(Delayed {
                    due: Instant::now() + delay,
                    sequence,
                    frame,
                }));
                true
            }
        };
        if accepted {
            self.inner.arrived.notify_one();
        } else {
            self.inner.core.drop_frame("reorder queue full");
        }
        Ok(())
    }

    fn on_start(&self) -> Result<()> {
        let inner = self.inner.clone();
        let worker = Worker::spawn(format!("{}-releaser", self.name()), move |signal| {
            inner.release_loop(&signal)
        })?;
        *self.releaser.lock() = Some(worker);
        Ok(())
    }

    fn on_stop(&self) {
        let worker = self.releaser.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
            self.inner.arrived.notify_all();
            worker.stop_and_join();
        }
        let discarded = std::mem::take(&mut self.inner.queue.lock().heap);
        if !discarded.is_empty() {
            debug!(handler = %self.name(), frames = discarded.len(), "Discarding delayed frames");
        }
        for _ in discarded {
            self.inner.core.drop_frame("reorderer stopped");
        }
    }
}

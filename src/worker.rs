//! Background worker threads.
//!
//! Every I/O source and timer in the crate runs on its own named thread.
//! A [`Worker`] pairs the thread with a [`StopSignal`] so that stopping is
//! always signal first, then join.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Cooperative stop flag a worker loop polls or sleeps on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the stop and wakes every sleeper.
    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps for `timeout` or until stopped.
    ///
    /// # Returns
    /// `true` if the stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.condvar.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

/// A named thread with a stop signal.
///
/// Dropping a worker stops and joins it.
#[derive(Debug)]
pub struct Worker {
    name: String,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `body` on a new thread named `name`.
    ///
    /// The body receives the worker's stop signal and should return soon
    /// after it fires.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<StopSignal>) + Send + 'static,
    {
        let name = name.into();
        let signal = Arc::new(StopSignal::new());
        let thread_signal = signal.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(thread_signal))?;
        debug!("Worker '{}' started", name);
        Ok(Self {
            name,
            signal,
            handle: Some(handle),
        })
    }

    /// Spawns a timer calling `tick` every `interval` until stopped.
    pub fn periodic<F>(name: impl Into<String>, interval: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn(name, move |signal| {
            while !signal.wait_timeout(interval) {
                tick();
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self) -> &Arc<StopSignal> {
        &self.signal
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signals the worker to stop without waiting for it.
    pub fn stop(&self) {
        self.signal.stop();
    }

    /// Signals the worker and waits for its thread to exit.
    ///
    /// Calling this from the worker's own thread only signals; the thread
    /// exits once the caller returns to its loop.
    pub fn stop_and_join(&mut self) {
        self.signal.stop();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("Worker '{}' panicked", self.name);
        } else {
            debug!("Worker '{}' stopped", self.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_stop_wakes_sleeping_worker() {
        let mut worker = Worker::spawn("sleeper", |signal| {
            while !signal.wait_timeout(Duration::from_secs(60)) {}
        })
        .unwrap();

        let started = Instant::now();
        worker.stop_and_join();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(worker.is_finished());
    }

    #[test]
    fn test_periodic_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut timer = Worker::periodic("ticker", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        timer.stop_and_join();
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_stop_signal_is_sticky() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
        signal.stop();
        assert!(signal.is_stopped());
        assert!(signal.wait_timeout(Duration::from_secs(60)));
    }
}

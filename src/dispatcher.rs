//! The receive worker.
//!
//! One dispatcher runs per gateway on its own thread. It keeps a listening
//! channel open, decodes every frame that reaches it and hands events to an
//! [`EventSink`] in arrival order. Malformed frames and isolated read errors
//! are logged and skipped. A channel that keeps failing, or reports itself
//! closed, is dropped and reopened at once. Only failed opens are retried
//! after [`Timing::reopen_delay`].

use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, error, info, trace, warn};

use crate::bus::{open_listener, Bus, BusError, Channel};
use crate::config::Timing;
use crate::event::Event;
use crate::frame::Frame;
use crate::handlers::EventSink;
use crate::identifier::NodeAddress;

/// Consecutive read errors tolerated before the listening channel is
/// considered broken and reopened.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DispatcherState {
    Stopped = 0,
    Opening = 1,
    Listening = 2,
}

/// Cooperative stop request shared between the worker and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        let (stopped, changed) = &*self.inner;
        *stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        changed.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for up to `timeout`, waking early on a stop request. Returns
    /// whether a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (stopped, changed) = &*self.inner;
        let guard = stopped.lock().unwrap_or_else(PoisonError::into_inner);

        let (guard, _) = changed
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);

        *guard
    }
}

/// Liveness and counters of a dispatcher, readable from any thread.
#[derive(Debug, Default)]
pub struct DispatcherStatus {
    state: AtomicU8,
    last_heartbeat_ms: AtomicU64,
    frames: AtomicU64,
    dropped: AtomicU64,
    read_errors: AtomicU64,
}

impl DispatcherStatus {
    pub fn state(&self) -> DispatcherState {
        DispatcherState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(DispatcherState::Stopped)
    }

    /// Wall time of the last heartbeat, `None` before the first one.
    pub fn last_heartbeat(&self) -> Option<SystemTime> {
        match self.last_heartbeat_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Frames received on the listening channel.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Frames dropped as malformed or undecodable.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Read errors reported by the listening channel.
    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.store(state.into(), Ordering::Release);
    }

    fn beat(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(1, |elapsed| elapsed.as_millis().max(1) as u64);

        self.last_heartbeat_ms.store(now, Ordering::Release);
    }
}

pub struct Dispatcher<B: Bus, S: EventSink> {
    bus: Arc<B>,
    own_address: NodeAddress,
    sink: S,
    timing: Timing,
    stop: StopSignal,
    status: Arc<DispatcherStatus>,
}

impl<B: Bus, S: EventSink> Dispatcher<B, S> {
    pub fn new(bus: Arc<B>, own_address: NodeAddress, sink: S) -> Self {
        Self {
            bus,
            own_address,
            sink,
            timing: Timing::default(),
            stop: StopSignal::new(),
            status: Arc::default(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn status(&self) -> Arc<DispatcherStatus> {
        Arc::clone(&self.status)
    }

    /// Runs the loop on the calling thread until a stop is requested.
    pub fn run(&mut self) {
        info!(
            interface = self.bus.interface(),
            address = %self.own_address,
            "Receive worker started"
        );

        let mut channel: Option<B::Channel> = None;
        let mut last_heartbeat: Option<Instant> = None;
        let mut read_errors = 0;

        while !self.stop.is_requested() {
            if channel.is_none() {
                self.status.set_state(DispatcherState::Opening);

                match open_listener(&*self.bus, self.own_address) {
                    Ok(opened) => {
                        debug!(interface = self.bus.interface(), "Listening channel open");
                        channel = Some(opened);
                        self.status.set_state(DispatcherState::Listening);
                    }
                    Err(err) => {
                        error!(
                            interface = self.bus.interface(),
                            error = %err,
                            retry_in = ?self.timing.reopen_delay,
                            "Failed to open listening channel"
                        );

                        if self.stop.wait(self.timing.reopen_delay) {
                            break;
                        }

                        continue;
                    }
                }
            }

            let Some(listening) = channel.as_mut() else {
                continue;
            };

            if last_heartbeat.map_or(true, |at| at.elapsed() >= self.timing.heartbeat_interval) {
                self.status.beat();
                last_heartbeat = Some(Instant::now());
            }

            match listening.receive(self.timing.poll_timeout) {
                Ok(Some(frame)) => {
                    read_errors = 0;
                    self.dispatch(&frame);
                }
                Ok(None) => read_errors = 0,
                Err(err @ BusError::Frame(_)) => {
                    read_errors = 0;

                    if err.is_short_frame() {
                        warn!(error = %err, "Dropping short frame");
                    } else {
                        warn!(error = %err, "Dropping malformed frame");
                    }
                    self.status.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(BusError::Read(err)) if read_errors < MAX_CONSECUTIVE_READ_ERRORS => {
                    read_errors += 1;
                    self.status.read_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, consecutive = read_errors, "Failed to read from listening channel");

                    if self.stop.wait(self.timing.poll_timeout) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Listening channel failed, reopening");
                    listening.close();
                    channel = None;
                    read_errors = 0;
                    self.status.set_state(DispatcherState::Opening);
                }
            }
        }

        if let Some(mut listening) = channel.take() {
            listening.close();
        }

        self.status.set_state(DispatcherState::Stopped);
        info!(interface = self.bus.interface(), "Receive worker stopped");
    }

    fn dispatch(&mut self, frame: &Frame) {
        self.status.frames.fetch_add(1, Ordering::Relaxed);

        match Event::from_frame(frame) {
            Ok(Some(event)) => {
                trace!(
                    node = %event.source,
                    function = ?event.function(),
                    kind = ?event.kind,
                    "Event received"
                );
                self.sink.handle(&event);
            }
            Ok(None) => {
                trace!(function = frame.identifier().function, "Ignoring frame");
            }
            Err(err) => {
                debug!(error = %err, "Dropping undecodable frame");
                self.status.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<B, S> Dispatcher<B, S>
where
    B: Bus + 'static,
    S: EventSink + 'static,
{
    /// Moves the dispatcher onto its own thread.
    pub fn spawn(mut self) -> io::Result<DispatcherHandle> {
        let stop = self.stop_signal();
        let status = self.status();

        let thread = thread::Builder::new()
            .name("domocan-rx".into())
            .spawn(move || self.run())?;

        Ok(DispatcherHandle {
            stop,
            status,
            thread: Some(thread),
        })
    }
}

/// Owner side of a spawned dispatcher. Dropping it stops the worker.
pub struct DispatcherHandle {
    stop: StopSignal,
    status: Arc<DispatcherStatus>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn status(&self) -> &DispatcherStatus {
        &self.status
    }

    /// Requests a stop and waits for the worker to exit. Calling it again is
    /// a no-op.
    pub fn stop(&mut self) {
        self.stop.request();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Receive worker panicked");
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

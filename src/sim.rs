//! In-memory CAN bus for exercising the gateway without hardware.
//!
//! Channels follow SocketCAN semantics closely enough for protocol tests:
//! each channel has its own acceptance filters, a frame sent on one channel
//! is looped back to every *other* open channel whose filters pass it, and
//! simulated nodes (responders) may answer any transmitted frame.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::bus::{Bus, BusError, Channel, Filter};
use crate::frame::Frame;

type Responder = Box<dyn FnMut(&Frame) -> Option<Reply> + Send>;

/// What a simulated node puts back on the bus after seeing a frame.
pub enum Reply {
    Frame(Frame),
    /// Raw bytes handed to every open channel unfiltered, e.g. a truncated frame.
    Raw(Vec<u8>),
}

#[derive(Clone, Default)]
pub struct SimBus {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    arrived: Condvar,
}

#[derive(Default)]
struct State {
    next_channel: u64,
    channels: HashMap<u64, Inbox>,
    sent: Vec<Frame>,
    responders: Vec<Responder>,
    failing_opens: usize,
    failing_receives: usize,
    reject_filters: bool,
    opens: usize,
}

struct Inbox {
    filters: Vec<Filter>,
    queue: VecDeque<Vec<u8>>,
}

impl Inbox {
    fn accepts(&self, raw_id: u32) -> bool {
        self.filters.iter().any(|filter| filter.matches(raw_id))
    }
}

impl State {
    fn deliver(&mut self, bytes: &[u8], raw_id: Option<u32>, skip: Option<u64>) {
        for (id, inbox) in self.channels.iter_mut() {
            if Some(*id) == skip {
                continue;
            }

            if raw_id.map_or(true, |raw_id| inbox.accepts(raw_id)) {
                inbox.queue.push_back(bytes.to_vec());
            }
        }
    }
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a simulated node which sees every transmitted frame and may
    /// answer it. Responders run while the bus is locked and must not call
    /// back into it.
    pub fn add_responder(
        &self,
        mut responder: impl FnMut(&Frame) -> Option<Frame> + Send + 'static,
    ) {
        self.lock()
            .responders
            .push(Box::new(move |frame: &Frame| responder(frame).map(Reply::Frame)));
    }

    /// Like [`SimBus::add_responder`] but the node answers with raw bytes.
    pub fn add_raw_responder(
        &self,
        responder: impl FnMut(&Frame) -> Option<Reply> + Send + 'static,
    ) {
        self.lock().responders.push(Box::new(responder));
    }

    /// Puts a frame on the bus as if a remote node had sent it.
    pub fn inject(&self, frame: &Frame) {
        self.lock()
            .deliver(&frame.as_bytes(), Some(frame.identifier().encode()), None);
        self.shared.arrived.notify_all();
    }

    /// Hands raw bytes to every open channel, bypassing filters. Used to
    /// simulate partial reads.
    pub fn inject_raw(&self, bytes: &[u8]) {
        self.lock().deliver(bytes, None, None);
        self.shared.arrived.notify_all();
    }

    /// Makes the next `count` calls to [`Bus::open`] fail.
    pub fn fail_opens(&self, count: usize) {
        self.lock().failing_opens = count;
    }

    /// Makes the next `count` receives, on whichever channels, fail with a
    /// read error.
    pub fn fail_receives(&self, count: usize) {
        self.lock().failing_receives = count;
    }

    /// Makes filter installation fail, as on kernels without CAN_RAW_FILTER.
    pub fn reject_filters(&self, reject: bool) {
        self.lock().reject_filters = reject;
    }

    /// Every frame transmitted through any channel, in order.
    pub fn sent(&self) -> Vec<Frame> {
        self.lock().sent.clone()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Number of open attempts, successful or not.
    pub fn opens(&self) -> usize {
        self.lock().opens
    }
}

impl Bus for SimBus {
    type Channel = SimChannel;

    fn open(&self, filters: &[Filter]) -> Result<Self::Channel, BusError> {
        let mut state = self.lock();
        state.opens += 1;

        if state.failing_opens > 0 {
            state.failing_opens -= 1;

            return Err(BusError::Open {
                interface: self.interface().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
            });
        }

        if state.reject_filters {
            return Err(BusError::FilterUnsupported(io::Error::new(
                io::ErrorKind::InvalidInput,
                "CAN_RAW_FILTER not supported",
            )));
        }

        let id = state.next_channel;
        state.next_channel += 1;
        state.channels.insert(
            id,
            Inbox {
                filters: filters.to_vec(),
                queue: VecDeque::new(),
            },
        );

        Ok(SimChannel {
            id,
            shared: Arc::clone(&self.shared),
            closed: false,
        })
    }

    fn interface(&self) -> &str {
        "sim0"
    }
}

pub struct SimChannel {
    id: u64,
    shared: Arc<Shared>,
    closed: bool,
}

impl SimChannel {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Channel for SimChannel {
    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        if state.failing_receives > 0 {
            state.failing_receives -= 1;

            return Err(BusError::Read(io::Error::new(
                io::ErrorKind::Other,
                "simulated read failure",
            )));
        }

        loop {
            let next = state
                .channels
                .get_mut(&self.id)
                .ok_or(BusError::Closed)?
                .queue
                .pop_front();

            if let Some(bytes) = next {
                return Ok(Some(Frame::from_bytes(&bytes)?));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                return Ok(None);
            }

            state = self
                .shared
                .arrived
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }

        let mut state = self.lock();
        state.sent.push(frame.clone());
        state.deliver(&frame.as_bytes(), Some(frame.identifier().encode()), Some(self.id));

        let mut responders = std::mem::take(&mut state.responders);
        for responder in responders.iter_mut() {
            match responder(frame) {
                Some(Reply::Frame(reply)) => {
                    state.deliver(&reply.as_bytes(), Some(reply.identifier().encode()), None)
                }
                Some(Reply::Raw(bytes)) => state.deliver(&bytes, None, None),
                None => {}
            }
        }
        responders.append(&mut state.responders);
        state.responders = responders;

        drop(state);
        self.shared.arrived.notify_all();

        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.lock().channels.remove(&self.id);
        }
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        self.close();
    }
}

//! Interrupt-side receive path: one call per falling clock edge, one byte per
//! 11-bit frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::bus::{Edge, Line};
use crate::error::Ps2Error;
use crate::ring::{RING_SIZE, RingBuffer};

/// Position inside the frame currently being clocked in. `Init` means the next
/// falling edge carries the start bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    Init,
    Start,
    Bit(u8),
    Parity,
    Stop,
}

impl FrameState {
    fn next(self) -> Self {
        match self {
            FrameState::Init => FrameState::Start,
            FrameState::Start => FrameState::Bit(0),
            FrameState::Bit(7) => FrameState::Parity,
            FrameState::Bit(n) => FrameState::Bit(n + 1),
            FrameState::Parity => FrameState::Stop,
            FrameState::Stop => FrameState::Init,
        }
    }
}

/// Bit-sampling state machine for device-to-host frames.
///
/// Frame: start (0), 8 data bits LSB first, odd parity, stop (1).
#[derive(Debug, Default)]
pub struct FrameReceiver {
    state: FrameState,
    data: u8,
    ones: u8,
}

impl FrameReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Feed the data line level sampled at a falling clock edge.
    ///
    /// Returns the completed byte after the stop bit. Any rule violation
    /// discards the partial byte and returns to `Init`.
    pub fn clock_falling(&mut self, data: bool) -> Result<Option<u8>, Ps2Error> {
        self.state = self.state.next();
        match self.state {
            FrameState::Start => {
                if data {
                    return Err(self.fail(Ps2Error::BadStart));
                }
            }
            FrameState::Bit(_) => {
                self.data >>= 1;
                if data {
                    self.data |= 0x80;
                    self.ones += 1;
                }
            }
            FrameState::Parity => {
                if (self.ones + data as u8) & 1 == 0 {
                    return Err(self.fail(Ps2Error::Parity));
                }
            }
            FrameState::Stop => {
                if !data {
                    return Err(self.fail(Ps2Error::Framing));
                }
                let byte = self.data;
                self.reset();
                return Ok(Some(byte));
            }
            FrameState::Init => return Err(self.fail(Ps2Error::Framing)),
        }
        Ok(None)
    }

    fn fail(&mut self, err: Ps2Error) -> Ps2Error {
        self.reset();
        err
    }

    fn reset(&mut self) {
        self.state = FrameState::Init;
        self.data = 0;
        self.ones = 0;
    }
}

/// State shared between the clock interrupt and the task.
pub struct Shared {
    pub(crate) ring: RingBuffer<RING_SIZE>,
    error: AtomicU8,
    discard_frame: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            ring: RingBuffer::new(),
            error: AtomicU8::new(0),
            discard_frame: AtomicBool::new(false),
        }
    }

    /// Called by the task after it took over the bus. A device frame cut
    /// short by the inhibit must not be merged with the next one.
    pub(crate) fn discard_partial_frame(&self) {
        self.discard_frame.store(true, Ordering::Release);
    }

    fn record(&self, err: Ps2Error) {
        self.error.store(err.code(), Ordering::Release);
    }

    /// Take and clear the last recorded receive error.
    pub(crate) fn take_error(&self) -> Option<Ps2Error> {
        match self.error.swap(0, Ordering::AcqRel) {
            0 => None,
            code => Ps2Error::from_code(code),
        }
    }
}

/// Handle the platform calls from its GPIO interrupt. Created together with
/// the driver by [`Ps2Host::new`](crate::Ps2Host::new).
pub struct Ps2Interrupt {
    frame: FrameReceiver,
    shared: Arc<Shared>,
}

impl Ps2Interrupt {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            frame: FrameReceiver::new(),
            shared,
        }
    }

    /// Interrupt entry point. `data` is the data line level sampled by the
    /// platform. Anything but a falling edge on the clock line is ignored.
    /// Never blocks.
    pub fn on_edge(&mut self, line: Line, edge: Edge, data: bool) {
        if line != Line::Clock || edge != Edge::Falling {
            return;
        }
        if self.shared.discard_frame.swap(false, Ordering::AcqRel) {
            self.frame = FrameReceiver::new();
        }
        match self.frame.clock_falling(data) {
            Ok(Some(byte)) => {
                // Dropped when full; the task is expected to keep up.
                let _ = self.shared.ring.put(byte);
            }
            Ok(None) => {}
            Err(err) => self.shared.record(err),
        }
    }

    pub fn frame_state(&self) -> FrameState {
        self.frame.state()
    }
}

/// Bit levels of the 11-bit frame carrying `byte`, in wire order.
pub fn frame_bits(byte: u8) -> [bool; 11] {
    let mut bits = [false; 11];
    for i in 0..8 {
        bits[1 + i] = byte & (1 << i) != 0;
    }
    bits[9] = byte.count_ones() % 2 == 0;
    bits[10] = true;
    bits
}

use std::sync::Arc;

use crate::bus::{Bus, Clock, Line};
use crate::config::Ps2Config;
use crate::cs2::Cs2Decoder;
use crate::error::Ps2Error;
use crate::report::{HidTransport, KeyboardReport};
use crate::rx::{Ps2Interrupt, Shared};
use crate::session::Leds;

/// PS/2 keyboard host.
///
/// Owns the bus lines, the decoder, the session state and the key report.
/// The matching [`Ps2Interrupt`] is handed to the platform's clock-edge
/// interrupt; the two halves only share the receive queue and the last
/// receive error.
pub struct Ps2Host<B, C, H> {
    pub(crate) bus: B,
    pub(crate) clock: C,
    pub(crate) config: Ps2Config,
    pub(crate) shared: Arc<Shared>,
    pub(crate) decoder: Cs2Decoder,
    pub(crate) keyboard: KeyboardReport<H>,
    /// `None` until the detection handshake succeeds.
    pub(crate) kbd_id: Option<u16>,
    pub(crate) last_probe_ms: Option<u32>,
    /// LED state requested by the host, applied once a keyboard is present.
    pub(crate) led: Option<Leds>,
    pub(crate) last_error: Option<Ps2Error>,
}

impl<B: Bus, C: Clock, H: HidTransport> Ps2Host<B, C, H> {
    /// Release both lines and arm the receive interrupt.
    pub fn new(mut bus: B, clock: C, transport: H, config: Ps2Config) -> (Self, Ps2Interrupt) {
        let shared = Arc::new(Shared::new());
        let interrupt = Ps2Interrupt::new(shared.clone());
        bus.release(Line::Clock);
        bus.release(Line::Data);
        bus.set_rx_interrupt(true);
        (
            Self {
                bus,
                clock,
                config,
                shared,
                decoder: Cs2Decoder::new(),
                keyboard: KeyboardReport::new(transport),
                kbd_id: None,
                last_probe_ms: None,
                led: None,
                last_error: None,
            },
            interrupt,
        )
    }

    /// Keyboard ID read during detection, if a keyboard is present.
    pub fn keyboard_id(&self) -> Option<u16> {
        self.kbd_id
    }

    pub fn is_detected(&self) -> bool {
        self.kbd_id.is_some()
    }

    pub fn requested_leds(&self) -> Option<Leds> {
        self.led
    }

    /// Most recent bus error seen by either direction.
    pub fn last_error(&self) -> Option<Ps2Error> {
        self.last_error
    }

    pub fn report(&self) -> &KeyboardReport<H> {
        &self.keyboard
    }

    pub fn transport(&self) -> &H {
        self.keyboard.transport()
    }

    pub fn transport_mut(&mut self) -> &mut H {
        self.keyboard.transport_mut()
    }

    pub fn queued(&self) -> usize {
        self.shared.ring.len()
    }
}

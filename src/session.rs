//! Keyboard detection, LED state and the polled task loop.

use std::fmt;
use std::ops::BitOr;

use tracing::{debug, info};

use crate::bus::{Bus, Clock};
use crate::driver::Ps2Host;
use crate::error::Ps2Error;
use crate::report::HidTransport;

/// Acknowledge byte sent by the keyboard after each command.
pub const ACK: u8 = 0xFA;

/// Commands sent from the host to the keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Followed by an LED mask byte.
    SetLeds = 0xED,
    /// Keyboard answers with two ID bytes after the ack.
    ReadId = 0xF2,
    /// Keyboard answers with ack, then 0xAA once self-test passes.
    Reset = 0xFF,
}

/// PS/2 LED mask, as carried by the set-LED command.
///
/// - Bit 0 (0x01): Scroll Lock
/// - Bit 1 (0x02): Num Lock
/// - Bit 2 (0x04): Caps Lock
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Leds(u8);

impl Leds {
    pub const SCROLL_LOCK: Leds = Leds(0x01);
    pub const NUM_LOCK: Leds = Leds(0x02);
    pub const CAPS_LOCK: Leds = Leds(0x04);

    pub fn new(byte: u8) -> Self {
        Leds(byte & 0x07)
    }

    /// Translate a USB HID LED output report (Num=0x01, Caps=0x02,
    /// Scroll=0x04) into the PS/2 layout.
    pub fn from_hid(report: u8) -> Self {
        let mut leds = Leds::default();
        if report & 0x01 != 0 {
            leds = leds | Leds::NUM_LOCK;
        }
        if report & 0x02 != 0 {
            leds = leds | Leds::CAPS_LOCK;
        }
        if report & 0x04 != 0 {
            leds = leds | Leds::SCROLL_LOCK;
        }
        leds
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_scroll_lock(&self) -> bool {
        self.0 & 0x01 == 0x01
    }

    pub fn is_num_lock(&self) -> bool {
        self.0 & 0x02 == 0x02
    }

    pub fn is_caps_lock(&self) -> bool {
        self.0 & 0x04 == 0x04
    }
}

impl BitOr for Leds {
    type Output = Leds;

    fn bitor(self, rhs: Leds) -> Leds {
        Leds(self.0 | rhs.0)
    }
}

impl fmt::Debug for Leds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Leds({:02X}=", self.0)?;
        let mut first = true;
        for led in [
            ("Scroll", self.is_scroll_lock()),
            ("Num", self.is_num_lock()),
            ("Caps", self.is_caps_lock()),
        ] {
            if led.1 {
                if first {
                    first = false;
                } else {
                    write!(f, "+")?;
                }
                write!(f, "{}", led.0)?;
            }
        }
        write!(f, ")")?;
        Ok(())
    }
}

impl<B: Bus, C: Clock, H: HidTransport> Ps2Host<B, C, H> {
    /// Poll once per main-loop iteration.
    ///
    /// Without a keyboard this probes at most once per `probe_interval_ms`.
    /// With one it decodes at most one queued byte; a decode error drops the
    /// session and the keyboard is detected again from scratch.
    pub fn task(&mut self) {
        if self.kbd_id.is_none() {
            let now = self.clock.millis();
            if let Some(last) = self.last_probe_ms {
                if now.wrapping_sub(last) < self.config.probe_interval_ms {
                    return;
                }
            }
            self.last_probe_ms = Some(now);
            if self.detect().is_none() {
                return;
            }
        }

        let Some(byte) = self.recv() else {
            return;
        };

        if self.keyboard.transport().is_suspended() {
            self.keyboard.transport_mut().remote_wakeup();
        }

        match self.decoder.process(byte) {
            Ok(Some(event)) => self.keyboard.register(event),
            Ok(None) => {}
            Err(err) => {
                info!("keyboard out of sync ({err}), detecting again");
                self.kbd_id = None;
            }
        }
    }

    /// Request an LED state. Applied now if a keyboard is present, otherwise
    /// after the next successful detection.
    pub fn set_led(&mut self, leds: Leds) -> Result<(), Ps2Error> {
        self.led = Some(leds);
        if self.kbd_id.is_none() {
            return Ok(());
        }
        self.apply_led(leds)
    }

    fn apply_led(&mut self, leds: Leds) -> Result<(), Ps2Error> {
        let response = self.send(Command::SetLeds as u8)?;
        if response != ACK {
            debug!("set LED refused: {response:02X}");
            return Ok(());
        }
        self.clock.delay_us(self.config.led_gap_us);
        self.send(leds.bits())?;
        Ok(())
    }

    /// Reset, then read the two-byte ID. Any unexpected answer abandons the
    /// attempt; the caller retries on its next probe.
    fn detect(&mut self) -> Option<u16> {
        if self.send(Command::Reset as u8).ok()? != ACK {
            return None;
        }
        self.clock.delay_ms(self.config.self_test_ms);

        if self.send(Command::ReadId as u8).ok()? != ACK {
            return None;
        }
        self.clock.delay_ms(self.config.id_byte_ms);
        let hi = self.recv()?;
        self.clock.delay_ms(self.config.id_byte_ms);
        let lo = self.recv()?;

        let id = u16::from(hi) << 8 | u16::from(lo);
        if id == 0xFFFF {
            return None;
        }
        info!("keyboard detected, id {id:04X}");
        self.kbd_id = Some(id);

        if let Some(leds) = self.led {
            if let Err(err) = self.apply_led(leds) {
                debug!("deferred LED update failed: {err}");
            }
        }
        Some(id)
    }
}

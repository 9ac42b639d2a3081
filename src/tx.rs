//! Host-to-device command transmission and response polling.
//!
//! Host-to-device frame timing is described in
//! <http://www.burtonsys.com/ps2_chapweske.htm>: the host inhibits, requests
//! to send, and then the device clocks each bit in.

use paste::paste;
use tracing::{debug, trace};

use crate::bus::{Bus, Clock, Line, wait_clock_hi, wait_clock_lo, wait_data_hi, wait_data_lo};
use crate::driver::Ps2Host;
use crate::error::{ClockPhase, Ps2Error};
use crate::report::HidTransport;

/// Bounded wait on a line; bails out of the enclosing phase with `$err`.
macro_rules! wait {
    ($self:ident, $what:ident, $us:expr, $err:expr) => {
        let left = paste!([<wait_ $what>](&mut $self.bus, &mut $self.clock, $us));
        if left == 0 {
            return Err($err);
        }
    };
}

impl<B: Bus, C: Clock, H: HidTransport> Ps2Host<B, C, H> {
    /// Send one command byte and return the device's response byte.
    ///
    /// Blocking. The receive interrupt is disabled for the whole handshake
    /// and re-armed before returning, whether or not the send succeeded.
    pub fn send(&mut self, byte: u8) -> Result<u8, Ps2Error> {
        trace!("s{byte:02X}");
        self.bus.set_rx_interrupt(false);

        if let Err(err) = self.clock_out(byte) {
            self.idle();
            self.int_on();
            return Err(self.record(err));
        }

        // Anything queued before the command is stale now.
        self.shared.ring.reset();
        self.idle();
        self.int_on();
        self.recv_response().map_err(|err| self.record(err))
    }

    /// Pop one received byte, if any.
    pub fn recv(&mut self) -> Option<u8> {
        let shared = &self.shared;
        let byte = self.bus.without_interrupts(|| shared.ring.get());
        if let Some(byte) = byte {
            trace!("r{byte:02X}");
        }
        if let Some(err) = shared.take_error() {
            self.record(err);
        }
        byte
    }

    fn record(&mut self, err: Ps2Error) -> Ps2Error {
        debug!("e{:02X} {err}", err.code());
        self.last_error = Some(err);
        err
    }

    /// Wait for the response to a command. Devices may take 20-25 ms.
    fn recv_response(&mut self) -> Result<u8, Ps2Error> {
        for _ in 0..self.config.response_timeout_ms {
            if let Some(byte) = self.recv() {
                return Ok(byte);
            }
            self.clock.delay_ms(1);
        }
        Err(Ps2Error::NoResponse)
    }

    fn clock_out(&mut self, byte: u8) -> Result<(), Ps2Error> {
        let cfg = self.config;

        // Abort whatever the device may be sending.
        self.inhibit();
        self.clock.delay_us(cfg.inhibit_us);

        // Request-to-send; data low doubles as the start bit.
        self.bus.drive(Line::Data, false);
        self.clock.delay_us(cfg.request_to_send_us);
        self.bus.drive(Line::Clock, true);
        wait!(self, clock_lo, cfg.rts_timeout_us, Ps2Error::RequestToSend);

        let mut parity = true;
        for bit in 0..8u8 {
            self.clock.delay_us(cfg.bit_setup_us);
            let level = byte & (1 << bit) != 0;
            parity ^= level;
            self.bus.drive(Line::Data, level);
            wait!(self, clock_hi, cfg.bit_timeout_us, Ps2Error::DataBit { bit, phase: ClockPhase::High });
            wait!(self, clock_lo, cfg.bit_timeout_us, Ps2Error::DataBit { bit, phase: ClockPhase::Low });
        }

        self.clock.delay_us(cfg.bit_setup_us);
        self.bus.drive(Line::Data, parity);
        wait!(self, clock_hi, cfg.bit_timeout_us, Ps2Error::ParityBit { phase: ClockPhase::High });
        wait!(self, clock_lo, cfg.bit_timeout_us, Ps2Error::ParityBit { phase: ClockPhase::Low });

        // Stop bit, then the device acknowledges by pulling data low.
        self.clock.delay_us(cfg.bit_setup_us);
        self.bus.drive(Line::Data, true);
        wait!(self, data_lo, cfg.bit_timeout_us, Ps2Error::AckDataLow);
        wait!(self, data_hi, cfg.bit_timeout_us, Ps2Error::AckDataHigh);
        wait!(self, clock_hi, cfg.bit_timeout_us, Ps2Error::AckClockHigh);
        Ok(())
    }

    fn inhibit(&mut self) {
        self.bus.drive(Line::Clock, false);
        self.bus.drive(Line::Data, true);
    }

    fn idle(&mut self) {
        self.bus.drive(Line::Clock, true);
        self.bus.drive(Line::Data, true);
    }

    fn int_on(&mut self) {
        self.bus.release(Line::Clock);
        self.bus.release(Line::Data);
        self.shared.discard_partial_frame();
        self.bus.set_rx_interrupt(true);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use super::*;
    use crate::config::Ps2Config;
    use crate::report::Protocol;
    use crate::rx::Shared;
    use crate::sim::{CaptureTransport, Fault, Sim, SimBus, SimKeyboard};

    /// What happened inside `without_interrupts`.
    #[derive(Default)]
    struct Masked {
        sections: u32,
        popped: usize,
        shared: Option<Arc<Shared>>,
    }

    impl Masked {
        fn queued(&self) -> usize {
            self.shared.as_ref().map_or(0, |s| s.ring.len())
        }
    }

    /// Simulated bus that tracks its interrupt-masked sections.
    struct MaskingBus {
        inner: SimBus,
        masked: Rc<RefCell<Masked>>,
    }

    impl Bus for MaskingBus {
        fn release(&mut self, line: Line) {
            self.inner.release(line);
        }

        fn drive(&mut self, line: Line, level: bool) {
            self.inner.drive(line, level);
        }

        fn read(&mut self, line: Line) -> bool {
            self.inner.read(line)
        }

        fn set_rx_interrupt(&mut self, enabled: bool) {
            self.inner.set_rx_interrupt(enabled);
        }

        fn without_interrupts<R>(&mut self, f: impl FnOnce() -> R) -> R {
            let before = self.masked.borrow().queued();
            let result = f();
            let mut masked = self.masked.borrow_mut();
            masked.sections += 1;
            masked.popped += before - masked.queued();
            result
        }
    }

    fn host(keyboard: SimKeyboard) -> (Sim, Ps2Host<crate::sim::SimBus, crate::sim::SimClock, CaptureTransport>) {
        Sim::host(keyboard, CaptureTransport::new(Protocol::Boot), Ps2Config::default())
    }

    #[test]
    fn test_send_is_acknowledged() {
        let (sim, mut host) = host(SimKeyboard::new());
        assert_eq!(host.send(0xEE), Ok(0xEE));
        assert_eq!(host.send(0xF4), Ok(0xFA));
        assert_eq!(sim.keyboard(|kb| kb.received().to_vec()), vec![0xEE, 0xF4]);
        assert!(sim.rx_interrupt_enabled());
        assert_eq!(host.last_error(), None);
    }

    #[test]
    fn test_every_byte_reaches_device_intact() {
        let (sim, mut host) = host(SimKeyboard::new());
        for byte in [0x00, 0x01, 0x55, 0xAA, 0x7F, 0x80, 0xED, 0xF3] {
            host.send(byte).unwrap();
        }
        assert_eq!(
            sim.keyboard(|kb| kb.received().to_vec()),
            vec![0x00, 0x01, 0x55, 0xAA, 0x7F, 0x80, 0xED, 0xF3]
        );
        assert_eq!(sim.keyboard(|kb| kb.rejected()), 0);
    }

    #[test]
    fn test_absent_device_times_out_request_to_send() {
        let (sim, mut host) = host(SimKeyboard::absent());
        let start = sim.now_us();
        assert_eq!(host.send(0xFF), Err(Ps2Error::RequestToSend));
        let elapsed = sim.now_us() - start;
        let cfg = Ps2Config::default();
        let budget = (cfg.inhibit_us + cfg.request_to_send_us + cfg.rts_timeout_us) as u64;
        assert!(elapsed <= budget + 10, "took {elapsed} us");
        assert!(elapsed >= cfg.rts_timeout_us as u64);
        assert!(sim.rx_interrupt_enabled());
        assert_eq!(host.last_error(), Some(Ps2Error::RequestToSend));
        assert_eq!(host.last_error().map(|e| e.code()), Some(0x01));
    }

    #[test]
    fn test_device_stalls_mid_byte() {
        let (sim, mut host) = host(SimKeyboard::new());
        sim.keyboard(|kb| kb.inject_fault(Fault::StallReceive { clocks: 3 }));
        let err = host.send(0xF4).unwrap_err();
        assert_eq!(
            err,
            Ps2Error::DataBit {
                bit: 2,
                phase: ClockPhase::Low
            }
        );
        assert_eq!(err.code(), 0x23);
        assert!(sim.rx_interrupt_enabled());

        // The bus recovers for the next command.
        assert_eq!(host.send(0xF4), Ok(0xFA));
    }

    #[test]
    fn test_missing_acknowledge() {
        let (sim, mut host) = host(SimKeyboard::new());
        sim.keyboard(|kb| kb.inject_fault(Fault::NoAck));
        assert_eq!(host.send(0xF4), Err(Ps2Error::AckDataLow));
        assert!(sim.rx_interrupt_enabled());
    }

    #[test]
    fn test_silent_device_reports_no_response() {
        let (sim, mut host) = host(SimKeyboard::new());
        sim.keyboard(|kb| kb.inject_fault(Fault::Mute));
        let start = sim.now_us();
        assert_eq!(host.send(0xF4), Err(Ps2Error::NoResponse));
        let waited = sim.now_us() - start;
        assert!(waited >= 25_000, "waited {waited} us");
        assert!(waited < 30_000, "waited {waited} us");
        assert_eq!(host.last_error(), Some(Ps2Error::NoResponse));
        assert_eq!(host.last_error().map(|e| e.code()), Some(0x0F));
    }

    #[test]
    fn test_recv_pops_with_interrupts_masked() {
        let sim = Sim::new(SimKeyboard::new());
        let masked = Rc::new(RefCell::new(Masked::default()));
        let bus = MaskingBus {
            inner: sim.bus(),
            masked: masked.clone(),
        };
        let (mut host, interrupt) = Ps2Host::new(
            bus,
            sim.clock(),
            CaptureTransport::new(Protocol::Boot),
            Ps2Config::default(),
        );
        sim.attach(interrupt);
        masked.borrow_mut().shared = Some(host.shared.clone());

        sim.keyboard(|kb| kb.inject(&[0x1C, 0x32]));
        sim.run_us(3_000);
        assert_eq!(host.queued(), 2);

        assert_eq!(host.recv(), Some(0x1C));
        assert_eq!(host.recv(), Some(0x32));
        assert_eq!(host.recv(), None);
        let masked = masked.borrow();
        assert_eq!(masked.sections, 3);
        // Every byte left the ring inside a masked section.
        assert_eq!(masked.popped, 2);
        assert_eq!(host.queued(), 0);
    }

    #[test]
    fn test_stale_bytes_are_flushed() {
        let (sim, mut host) = host(SimKeyboard::new());
        sim.keyboard(|kb| kb.inject(&[0x1C, 0xF0, 0x1C]));
        sim.run_us(5_000);
        assert_eq!(host.queued(), 3);
        assert_eq!(host.send(0xF4), Ok(0xFA));
        assert_eq!(host.recv(), None);
    }
}

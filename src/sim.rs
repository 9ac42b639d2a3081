//! Cycle-level model of a PS/2 bus with a keyboard attached, for tests and
//! the `ps2kbd-sim` binary.
//!
//! Time is virtual and counted in microseconds. Both ends are open-drain: a
//! line reads high only when neither the host nor the keyboard pulls it low.
//! The keyboard clocks at ~12.5 kHz and answers the commands a standard MF2
//! keyboard answers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::trace;

use crate::bus::{Bus, Clock, Edge, Line};
use crate::config::Ps2Config;
use crate::cs2::codes;
use crate::driver::Ps2Host;
use crate::report::{HidTransport, Protocol};
use crate::rx::{Ps2Interrupt, frame_bits};
use crate::session::ACK;

const CLOCK_PERIOD_US: u64 = 80;
const CLOCK_HALF_US: u64 = CLOCK_PERIOD_US / 2;
const FRAME_US: u64 = 11 * CLOCK_PERIOD_US;
/// Host-to-device: how long the keyboard holds data low for the ack.
const ACK_US: u64 = 50;
/// Delay between the host releasing clock and the first keyboard clock.
const RTS_LATENCY_US: u64 = 100;
const RESPONSE_LATENCY_US: u64 = 500;
const BYTE_GAP_US: u64 = 100;
const SELF_TEST_US: u64 = 300_000;

const RESEND: u8 = 0xFE;
const ECHO: u8 = 0xEE;
const KEYBOARD_ID: [u8; 2] = [0xAB, 0x83];

pub type SimHost<H> = Ps2Host<SimBus, SimClock, H>;

/// One-shot misbehaviour applied to the next frame in the matching direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Next host-to-device frame: stop clocking after `clocks` pulses.
    StallReceive { clocks: u8 },
    /// Next host-to-device frame: clock it in but never acknowledge.
    NoAck,
    /// Next host-to-device frame: accept it, then send no response.
    Mute,
    /// Next device-to-host frame: wrong parity bit.
    BadParity,
    /// Next device-to-host frame: stop bit low.
    BadStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Idle,
    /// Host holds clock low.
    Inhibited,
    /// Clocking in a host byte. The first pulse starts at `t0`.
    Receiving {
        t0: u64,
        bits: u16,
        stall: Option<u8>,
        ack: bool,
    },
    /// Clocking out the byte at the head of the output queue.
    Sending { t0: u64, bits: [bool; 11] },
}

/// MF2 keyboard on the far end of the bus.
#[derive(Debug)]
pub struct SimKeyboard {
    present: bool,
    state: DeviceState,
    now: u64,
    /// Bytes to send, each not before the given time.
    out: VecDeque<(u8, u64)>,
    ready_at: u64,
    fault: Option<Fault>,
    /// Next byte is the argument of a set-LED command.
    expecting_leds: bool,
    received: Vec<u8>,
    rejected: usize,
    leds: u8,
}

impl Default for SimKeyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKeyboard {
    /// A keyboard that is plugged in and past its power-on self-test.
    pub fn new() -> Self {
        Self {
            present: true,
            state: DeviceState::Idle,
            now: 0,
            out: VecDeque::new(),
            ready_at: 0,
            fault: None,
            expecting_leds: false,
            received: Vec::new(),
            rejected: 0,
            leds: 0,
        }
    }

    /// Nothing connected: both lines float high.
    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new()
        }
    }

    /// Connect the keyboard. It reports its self-test result shortly after.
    pub fn plug_in(&mut self) {
        if self.present {
            return;
        }
        self.present = true;
        self.state = DeviceState::Idle;
        self.out.push_back((codes::SELF_TEST_PASSED, self.now + SELF_TEST_US));
    }

    pub fn unplug(&mut self) {
        self.present = false;
        self.state = DeviceState::Idle;
        self.out.clear();
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Queue raw scan code bytes for transmission to the host.
    pub fn inject(&mut self, bytes: &[u8]) {
        self.out.extend(bytes.iter().map(|&b| (b, 0)));
    }

    pub fn inject_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// Every byte the host sent that arrived intact, commands and arguments.
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    /// Host frames dropped for bad parity or stop bit.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn leds(&self) -> u8 {
        self.leds
    }

    pub fn pending(&self) -> usize {
        self.out.len()
    }

    /// Levels the keyboard puts on (clock, data); `true` is released.
    fn outputs(&self, now: u64) -> (bool, bool) {
        match self.state {
            DeviceState::Receiving {
                t0, stall, ack, ..
            } => {
                if now < t0 {
                    return (true, true);
                }
                let dt = now - t0;
                let pulse = dt / CLOCK_PERIOD_US;
                let phase = dt % CLOCK_PERIOD_US;
                if pulse > 10 || stall.is_some_and(|n| pulse >= n as u64) {
                    return (true, true);
                }
                let data = !(pulse == 10 && ack && phase < ACK_US);
                (phase >= CLOCK_HALF_US, data)
            }
            DeviceState::Sending { t0, bits } => {
                let dt = now.saturating_sub(t0);
                let bit = (dt / CLOCK_PERIOD_US) as usize;
                let phase = dt % CLOCK_PERIOD_US;
                if bit >= bits.len() {
                    return (true, true);
                }
                let clock = !(20..60).contains(&phase);
                (clock, bits[bit])
            }
            _ => (true, true),
        }
    }

    /// Advance the device state machine given the current line levels.
    fn observe(&mut self, now: u64, clock: bool, data: bool) {
        self.now = now;
        if !self.present {
            return;
        }
        let (own_clock, _) = self.outputs(now);

        match self.state {
            DeviceState::Idle => {
                if !clock {
                    self.state = DeviceState::Inhibited;
                } else if !data {
                    self.start_receive(now);
                } else if let Some(&(byte, at)) = self.out.front() {
                    if now >= at.max(self.ready_at) {
                        self.start_send(now, byte);
                    }
                }
            }
            DeviceState::Inhibited => {
                if clock {
                    if data {
                        self.state = DeviceState::Idle;
                    } else {
                        self.start_receive(now);
                    }
                }
            }
            DeviceState::Receiving {
                t0,
                ref mut bits,
                stall,
                ack,
            } => {
                if own_clock && !clock {
                    // Host took the bus back; the byte is lost.
                    self.state = DeviceState::Inhibited;
                    return;
                }
                if now < t0 {
                    return;
                }
                let dt = now - t0;
                let pulse = dt / CLOCK_PERIOD_US;
                if dt % CLOCK_PERIOD_US == CLOCK_HALF_US && pulse <= 9 {
                    if data {
                        *bits |= 1 << pulse;
                    } else {
                        *bits &= !(1 << pulse);
                    }
                }
                if dt >= FRAME_US {
                    let bits = *bits;
                    self.state = DeviceState::Idle;
                    if stall.is_some() || !ack {
                        return;
                    }
                    self.finish_receive(bits);
                }
            }
            DeviceState::Sending { t0, .. } => {
                if own_clock && !clock {
                    // Inhibited mid-frame: the byte stays queued and is sent
                    // again from the start.
                    self.state = DeviceState::Inhibited;
                    return;
                }
                if now >= t0 + FRAME_US {
                    self.out.pop_front();
                    self.ready_at = now + BYTE_GAP_US;
                    self.state = DeviceState::Idle;
                }
            }
        }
    }

    fn start_receive(&mut self, now: u64) {
        let mut stall = None;
        let mut ack = true;
        match self.fault {
            Some(Fault::StallReceive { clocks }) => {
                stall = Some(clocks);
                self.fault = None;
            }
            Some(Fault::NoAck) => {
                ack = false;
                self.fault = None;
            }
            _ => {}
        }
        self.state = DeviceState::Receiving {
            t0: now + RTS_LATENCY_US,
            bits: 0,
            stall,
            ack,
        };
    }

    fn start_send(&mut self, now: u64, byte: u8) {
        let mut bits = frame_bits(byte);
        match self.fault {
            Some(Fault::BadParity) => {
                bits[9] = !bits[9];
                self.fault = None;
            }
            Some(Fault::BadStop) => {
                bits[10] = false;
                self.fault = None;
            }
            _ => {}
        }
        self.state = DeviceState::Sending { t0: now, bits };
    }

    fn finish_receive(&mut self, bits: u16) {
        let byte = (bits & 0xFF) as u8;
        let parity = bits & (1 << 8) != 0;
        let stop = bits & (1 << 9) != 0;
        if (byte.count_ones() + parity as u32) % 2 == 0 || !stop {
            trace!("kbd rejected {bits:03X}");
            self.rejected += 1;
            self.respond(&[RESEND]);
            return;
        }
        trace!("kbd <- {byte:02X}");
        self.received.push(byte);
        if self.fault == Some(Fault::Mute) {
            self.fault = None;
            return;
        }
        self.command(byte);
    }

    fn command(&mut self, byte: u8) {
        if self.expecting_leds {
            self.expecting_leds = false;
            self.leds = byte & 0x07;
            self.respond(&[ACK]);
            return;
        }

        match byte {
            0xED => {
                self.expecting_leds = true;
                self.respond(&[ACK]);
            }
            ECHO => self.respond(&[ECHO]),
            0xF2 => self.respond(&[ACK, KEYBOARD_ID[0], KEYBOARD_ID[1]]),
            0xFF => {
                self.leds = 0;
                self.out.clear();
                self.respond(&[ACK]);
                self.out
                    .push_back((codes::SELF_TEST_PASSED, self.now + SELF_TEST_US));
            }
            // Everything else is acknowledged and otherwise ignored.
            _ => self.respond(&[ACK]),
        }
    }

    /// Command responses go ahead of queued scan codes.
    fn respond(&mut self, bytes: &[u8]) {
        let at = self.now + RESPONSE_LATENCY_US;
        for (i, &b) in bytes.iter().enumerate() {
            self.out.insert(i, (b, at));
        }
    }
}

struct SimWorld {
    now_us: u64,
    host_clock: Option<bool>,
    host_data: Option<bool>,
    rx_irq: bool,
    last_clock: bool,
    interrupt: Option<Ps2Interrupt>,
    keyboard: SimKeyboard,
}

impl SimWorld {
    fn lines(&self) -> (bool, bool) {
        let (clock, data) = self.keyboard.outputs(self.now_us);
        (
            self.host_clock.unwrap_or(true) && clock,
            self.host_data.unwrap_or(true) && data,
        )
    }

    fn host_line(&mut self, line: Line) -> &mut Option<bool> {
        match line {
            Line::Clock => &mut self.host_clock,
            Line::Data => &mut self.host_data,
        }
    }

    fn settle(&mut self) {
        let (clock, data) = self.lines();
        self.keyboard.observe(self.now_us, clock, data);
        let (clock, data) = self.lines();
        if self.last_clock && !clock && self.rx_irq {
            if let Some(irq) = self.interrupt.as_mut() {
                irq.on_edge(Line::Clock, Edge::Falling, data);
            }
        }
        self.last_clock = clock;
    }

    fn advance(&mut self, us: u64) {
        for _ in 0..us {
            self.now_us += 1;
            self.settle();
        }
    }
}

/// Host side of the simulated lines.
pub struct SimBus(Rc<RefCell<SimWorld>>);

impl Bus for SimBus {
    fn release(&mut self, line: Line) {
        let mut world = self.0.borrow_mut();
        *world.host_line(line) = None;
        world.settle();
    }

    fn drive(&mut self, line: Line, level: bool) {
        let mut world = self.0.borrow_mut();
        *world.host_line(line) = Some(level);
        world.settle();
    }

    fn read(&mut self, line: Line) -> bool {
        let mut world = self.0.borrow_mut();
        *world.host_line(line) = None;
        world.settle();
        let (clock, data) = world.lines();
        match line {
            Line::Clock => clock,
            Line::Data => data,
        }
    }

    fn set_rx_interrupt(&mut self, enabled: bool) {
        self.0.borrow_mut().rx_irq = enabled;
    }
}

/// Virtual time source; every delay runs the bus forward.
pub struct SimClock(Rc<RefCell<SimWorld>>);

impl Clock for SimClock {
    fn delay_us(&mut self, us: u32) {
        self.0.borrow_mut().advance(us as u64);
    }

    fn millis(&self) -> u32 {
        (self.0.borrow().now_us / 1000) as u32
    }
}

/// Handle on the simulated world, shared with the bus and clock it hands out.
#[derive(Clone)]
pub struct Sim(Rc<RefCell<SimWorld>>);

impl Sim {
    pub fn new(keyboard: SimKeyboard) -> Self {
        Sim(Rc::new(RefCell::new(SimWorld {
            now_us: 0,
            host_clock: None,
            host_data: None,
            rx_irq: false,
            last_clock: true,
            interrupt: None,
            keyboard,
        })))
    }

    /// Build a host on a fresh bus and wire its interrupt to the clock line.
    pub fn host<H: HidTransport>(
        keyboard: SimKeyboard,
        transport: H,
        config: Ps2Config,
    ) -> (Sim, SimHost<H>) {
        let sim = Sim::new(keyboard);
        let (host, interrupt) = Ps2Host::new(sim.bus(), sim.clock(), transport, config);
        sim.attach(interrupt);
        (sim, host)
    }

    pub fn bus(&self) -> SimBus {
        SimBus(self.0.clone())
    }

    pub fn clock(&self) -> SimClock {
        SimClock(self.0.clone())
    }

    pub fn attach(&self, interrupt: Ps2Interrupt) {
        self.0.borrow_mut().interrupt = Some(interrupt);
    }

    pub fn now_us(&self) -> u64 {
        self.0.borrow().now_us
    }

    pub fn run_us(&self, us: u64) {
        self.0.borrow_mut().advance(us);
    }

    pub fn rx_interrupt_enabled(&self) -> bool {
        self.0.borrow().rx_irq
    }

    pub fn keyboard<R>(&self, f: impl FnOnce(&mut SimKeyboard) -> R) -> R {
        f(&mut self.0.borrow_mut().keyboard)
    }
}

/// Records everything sent to the USB side.
#[derive(Debug)]
pub struct CaptureTransport {
    pub protocol: Protocol,
    pub keyboard: Vec<Vec<u8>>,
    pub consumer: Vec<u16>,
    pub system: Vec<u8>,
    pub suspended: bool,
    pub wakeups: u32,
}

impl CaptureTransport {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            keyboard: Vec::new(),
            consumer: Vec::new(),
            system: Vec::new(),
            suspended: false,
            wakeups: 0,
        }
    }
}

impl HidTransport for CaptureTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn send_keyboard(&mut self, report: &[u8]) {
        self.keyboard.push(report.to_vec());
    }

    fn send_consumer(&mut self, usage: u16) {
        self.consumer.push(usage);
    }

    fn send_system(&mut self, report: u8) {
        self.system.push(report);
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn remote_wakeup(&mut self) {
        self.wakeups += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Ps2Error;

    fn host(keyboard: SimKeyboard) -> (Sim, SimHost<CaptureTransport>) {
        Sim::host(keyboard, CaptureTransport::new(Protocol::Boot), Ps2Config::default())
    }

    #[test]
    fn test_lines_idle_high() {
        let sim = Sim::new(SimKeyboard::new());
        let mut bus = sim.bus();
        assert!(bus.read(Line::Clock));
        assert!(bus.read(Line::Data));
        bus.drive(Line::Clock, false);
        assert!(!sim.0.borrow().lines().0);
    }

    #[test]
    fn test_injected_bytes_arrive_in_order() {
        let (sim, mut host) = host(SimKeyboard::new());
        sim.keyboard(|kb| kb.inject(&[0xE0, 0x75, 0xE0, 0xF0, 0x75]));
        sim.run_us(10_000);
        let got: Vec<u8> = std::iter::from_fn(|| host.recv()).collect();
        assert_eq!(got, vec![0xE0, 0x75, 0xE0, 0xF0, 0x75]);
        assert_eq!(host.last_error(), None);
    }

    #[test]
    fn test_low_stop_bit_is_a_framing_error() {
        let (sim, mut host) = host(SimKeyboard::new());
        sim.keyboard(|kb| {
            kb.inject_fault(Fault::BadStop);
            kb.inject(&[0x1C, 0x32]);
        });
        sim.run_us(5_000);
        assert_eq!(host.recv(), Some(0x32));
        assert_eq!(host.recv(), None);
        assert_eq!(host.last_error(), Some(Ps2Error::Framing));
    }

    #[test]
    fn test_command_interrupts_scan_code() {
        let (sim, mut host) = host(SimKeyboard::new());
        sim.keyboard(|kb| kb.inject(&[0x1C]));
        // Part-way through the frame.
        sim.run_us(300);
        assert_eq!(host.send(0xF4), Ok(ACK));
        sim.run_us(3_000);
        assert_eq!(host.recv(), Some(0x1C));
        assert_eq!(host.last_error(), None);
    }

    #[test]
    fn test_other_commands_are_only_acknowledged() {
        let (sim, mut host) = host(SimKeyboard::new());
        for byte in [0xF0, 0xF3, 0xF5] {
            assert_eq!(host.send(byte), Ok(ACK));
        }
        sim.run_us(3_000);
        assert_eq!(host.recv(), None);

        // No argument byte is expected after them.
        assert_eq!(host.send(0xED), Ok(ACK));
        assert_eq!(host.send(0x05), Ok(ACK));
        assert_eq!(sim.keyboard(|kb| kb.leds()), 0x05);

        // Scan codes keep flowing.
        sim.keyboard(|kb| kb.inject(&[0x1C]));
        sim.run_us(3_000);
        assert_eq!(host.recv(), Some(0x1C));
    }

    #[test]
    fn test_reset_reports_self_test() {
        let (sim, mut host) = host(SimKeyboard::new());
        host.send(0xED).unwrap();
        host.send(0x07).unwrap();
        assert_eq!(sim.keyboard(|kb| kb.leds()), 0x07);
        assert_eq!(host.send(0xFF), Ok(ACK));
        assert_eq!(sim.keyboard(|kb| kb.leds()), 0);
        sim.run_us(SELF_TEST_US + 2_000);
        assert_eq!(host.recv(), Some(codes::SELF_TEST_PASSED));
    }

    #[test]
    fn test_unplugged_keyboard_is_silent() {
        let (sim, mut host) = host(SimKeyboard::new());
        sim.keyboard(|kb| kb.unplug());
        assert_eq!(host.send(0xF4), Err(Ps2Error::RequestToSend));
        assert!(!sim.keyboard(|kb| kb.is_present()));
    }
}

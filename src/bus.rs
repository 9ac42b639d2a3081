//! Open-drain clock/data line access and the bounded busy-waits the protocol
//! is built on.
//!
//! Both PS/2 lines are open-drain with pull-ups: a released line floats high
//! unless the other side pulls it low. The driver owns both lines exclusively.

use paste::paste;

/// One of the two PS/2 signal lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Clock,
    Data,
}

/// Edge reported by the platform's GPIO interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Falling,
    Rising,
}

/// Pin-level access to the two bus lines.
pub trait Bus {
    /// Switch `line` to input with pull-up (high impedance).
    fn release(&mut self, line: Line);

    /// Switch `line` to output and drive `level`.
    fn drive(&mut self, line: Line, level: bool);

    /// Sample `line`. The line is switched to input first, so reading a line
    /// the host was driving releases it.
    fn read(&mut self, line: Line) -> bool;

    /// Arm or disarm the falling-edge interrupt on the clock line.
    fn set_rx_interrupt(&mut self, enabled: bool);

    /// Run `f` with interrupts masked. Platforms without a real interrupt
    /// controller can keep the default.
    fn without_interrupts<R>(&mut self, f: impl FnOnce() -> R) -> R {
        f()
    }
}

/// Time source used for protocol delays and the session's probe schedule.
pub trait Clock {
    /// Busy-wait for `us` microseconds.
    fn delay_us(&mut self, us: u32);

    /// Busy-wait for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32) {
        for _ in 0..ms {
            self.delay_us(1000);
        }
    }

    /// Free-running millisecond counter. Wraps.
    fn millis(&self) -> u32;
}

/// Busy-poll `cond` at 1 µs granularity for at most `timeout_us`.
///
/// Returns the number of microseconds left when `cond` became true, or 0 on
/// timeout. A zero timeout always reports a timeout.
pub fn wait_until<C: Clock>(clock: &mut C, timeout_us: u32, mut cond: impl FnMut() -> bool) -> u32 {
    let mut remaining = timeout_us;
    while remaining > 0 && !cond() {
        clock.delay_us(1);
        remaining -= 1;
    }
    remaining
}

/// Wait for `line` to reach `level`. See [`wait_until`] for the return value.
pub fn wait_for<B: Bus, C: Clock>(
    bus: &mut B,
    clock: &mut C,
    line: Line,
    level: bool,
    timeout_us: u32,
) -> u32 {
    wait_until(clock, timeout_us, || bus.read(line) == level)
}

macro_rules! def_line_waits {
    ($($name:ident => $line:expr;)*) => {
        paste! {
            $(
                #[doc = concat!("Wait for the ", stringify!($name), " line to go low.")]
                pub fn [<wait_ $name _lo>]<B: Bus, C: Clock>(bus: &mut B, clock: &mut C, timeout_us: u32) -> u32 {
                    wait_for(bus, clock, $line, false, timeout_us)
                }

                #[doc = concat!("Wait for the ", stringify!($name), " line to go high.")]
                pub fn [<wait_ $name _hi>]<B: Bus, C: Clock>(bus: &mut B, clock: &mut C, timeout_us: u32) -> u32 {
                    wait_for(bus, clock, $line, true, timeout_us)
                }
            )*
        }
    };
}

def_line_waits!(
    clock => Line::Clock;
    data => Line::Data;
);

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    /// Clock whose ticks are visible to a [`RampBus`].
    struct TickClock(Rc<Cell<u32>>);

    impl Clock for TickClock {
        fn delay_us(&mut self, us: u32) {
            self.0.set(self.0.get() + us);
        }

        fn millis(&self) -> u32 {
            self.0.get() / 1000
        }
    }

    /// Clock goes high once `rise_at` microseconds have elapsed; data stays low.
    struct RampBus {
        now: Rc<Cell<u32>>,
        rise_at: u32,
        reads: u32,
    }

    impl Bus for RampBus {
        fn release(&mut self, _line: Line) {}

        fn drive(&mut self, _line: Line, _level: bool) {}

        fn read(&mut self, line: Line) -> bool {
            self.reads += 1;
            line == Line::Clock && self.now.get() >= self.rise_at
        }

        fn set_rx_interrupt(&mut self, _enabled: bool) {}
    }

    fn setup(rise_at: u32) -> (RampBus, TickClock) {
        let now = Rc::new(Cell::new(0));
        (
            RampBus {
                now: now.clone(),
                rise_at,
                reads: 0,
            },
            TickClock(now),
        )
    }

    #[test]
    fn test_immediate_level_keeps_full_budget() {
        let (mut bus, mut clock) = setup(0);
        assert_eq!(wait_clock_hi(&mut bus, &mut clock, 100), 100);
        assert_eq!(clock.0.get(), 0);
    }

    #[test]
    fn test_level_reached_reports_remaining() {
        let (mut bus, mut clock) = setup(30);
        assert_eq!(wait_clock_hi(&mut bus, &mut clock, 100), 70);
        assert_eq!(clock.0.get(), 30);
    }

    #[test]
    fn test_timeout_returns_zero() {
        let (mut bus, mut clock) = setup(500);
        assert_eq!(wait_clock_hi(&mut bus, &mut clock, 100), 0);
        assert_eq!(clock.0.get(), 100);
        assert_eq!(wait_data_hi(&mut bus, &mut clock, 10), 0);
    }

    #[test]
    fn test_zero_timeout_never_polls() {
        let (mut bus, mut clock) = setup(0);
        assert_eq!(wait_clock_hi(&mut bus, &mut clock, 0), 0);
        assert_eq!(bus.reads, 0);
    }

    #[test]
    fn test_wait_until_arbitrary_condition() {
        let mut clock = TickClock(Rc::new(Cell::new(0)));
        let mut polls = 0;
        let left = wait_until(&mut clock, 50, || {
            polls += 1;
            polls == 5
        });
        assert_eq!(left, 46);
    }
}

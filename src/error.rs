use std::fmt;

use thiserror::Error;

/// Which clock transition a transmit wait was expecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockPhase {
    /// Waiting for the device to release the clock (rising edge).
    High,
    /// Waiting for the device to pull the clock low (falling edge).
    Low,
}

impl fmt::Display for ClockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockPhase::High => write!(f, "high"),
            ClockPhase::Low => write!(f, "low"),
        }
    }
}

/// A bus-level protocol failure. Each variant names the exact phase that
/// failed; [`Ps2Error::code`] gives the compact diagnostic number printed in
/// the `e..` trace token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Ps2Error {
    #[error("start bit was high")]
    BadStart,
    #[error("parity mismatch")]
    Parity,
    #[error("stop bit was low")]
    Framing,
    #[error("device did not answer request-to-send")]
    RequestToSend,
    #[error("timed out waiting for clock {phase} on data bit {bit}")]
    DataBit { bit: u8, phase: ClockPhase },
    #[error("timed out waiting for clock {phase} on parity bit")]
    ParityBit { phase: ClockPhase },
    #[error("device did not pull data low to acknowledge")]
    AckDataLow,
    #[error("device did not release data after acknowledge")]
    AckDataHigh,
    #[error("device did not release clock after acknowledge")]
    AckClockHigh,
    #[error("no response byte from device")]
    NoResponse,
}

impl Ps2Error {
    pub fn code(&self) -> u8 {
        match *self {
            Ps2Error::RequestToSend => 0x01,
            Ps2Error::DataBit { bit, phase } => {
                (bit << 4)
                    + match phase {
                        ClockPhase::High => 0x02,
                        ClockPhase::Low => 0x03,
                    }
            }
            Ps2Error::ParityBit {
                phase: ClockPhase::High,
            } => 0x04,
            Ps2Error::ParityBit {
                phase: ClockPhase::Low,
            } => 0x05,
            Ps2Error::AckDataLow => 0x06,
            Ps2Error::AckDataHigh => 0x07,
            Ps2Error::AckClockHigh => 0x08,
            Ps2Error::NoResponse => 0x0F,
            // Receive errors are 0xF0 + the frame position that failed.
            Ps2Error::BadStart => 0xF1,
            Ps2Error::Parity => 0xFA,
            Ps2Error::Framing => 0xFB,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Ps2Error::RequestToSend,
            0x04 => Ps2Error::ParityBit {
                phase: ClockPhase::High,
            },
            0x05 => Ps2Error::ParityBit {
                phase: ClockPhase::Low,
            },
            0x06 => Ps2Error::AckDataLow,
            0x07 => Ps2Error::AckDataHigh,
            0x08 => Ps2Error::AckClockHigh,
            0x0F => Ps2Error::NoResponse,
            0xF1 => Ps2Error::BadStart,
            0xFA => Ps2Error::Parity,
            0xFB => Ps2Error::Framing,
            c if c >> 4 < 8 && (c & 0x0F == 0x02 || c & 0x0F == 0x03) => Ps2Error::DataBit {
                bit: c >> 4,
                phase: if c & 0x0F == 0x02 {
                    ClockPhase::High
                } else {
                    ClockPhase::Low
                },
            },
            _ => return None,
        })
    }

    /// True for errors raised by the interrupt-side frame receiver.
    pub fn is_receive(&self) -> bool {
        matches!(
            self,
            Ps2Error::BadStart | Ps2Error::Parity | Ps2Error::Framing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_bit_codes() {
        let err = Ps2Error::DataBit {
            bit: 0,
            phase: ClockPhase::High,
        };
        assert_eq!(err.code(), 0x02);
        let err = Ps2Error::DataBit {
            bit: 7,
            phase: ClockPhase::Low,
        };
        assert_eq!(err.code(), 0x73);
        assert_eq!(Ps2Error::from_code(0x73), Some(err));
        assert_eq!(Ps2Error::from_code(0x53).map(|e| e.code()), Some(0x53));
    }

    #[test]
    fn test_every_code_is_distinct() {
        let mut all = vec![
            Ps2Error::BadStart,
            Ps2Error::Parity,
            Ps2Error::Framing,
            Ps2Error::RequestToSend,
            Ps2Error::ParityBit {
                phase: ClockPhase::High,
            },
            Ps2Error::ParityBit {
                phase: ClockPhase::Low,
            },
            Ps2Error::AckDataLow,
            Ps2Error::AckDataHigh,
            Ps2Error::AckClockHigh,
            Ps2Error::NoResponse,
        ];
        for bit in 0..8 {
            for phase in [ClockPhase::High, ClockPhase::Low] {
                all.push(Ps2Error::DataBit { bit, phase });
            }
        }
        let mut codes: Vec<u8> = all.iter().map(Ps2Error::code).collect();
        for err in &all {
            assert_eq!(Ps2Error::from_code(err.code()), Some(*err));
        }
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(Ps2Error::from_code(0x00), None);
        assert_eq!(Ps2Error::from_code(0x82), None);
        assert_eq!(Ps2Error::from_code(0xF2), None);
    }

    #[test]
    fn test_display() {
        let err = Ps2Error::DataBit {
            bit: 3,
            phase: ClockPhase::Low,
        };
        assert_eq!(err.to_string(), "timed out waiting for clock low on data bit 3");
        assert!(Ps2Error::Parity.is_receive());
        assert!(!Ps2Error::AckDataLow.is_receive());
    }
}

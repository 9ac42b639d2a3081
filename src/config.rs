/// Protocol timing. The defaults follow the IBM PC/AT keyboard timing budget
/// with some slack for slow devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ps2Config {
    /// Clock held low to abort a transmission in flight.
    pub inhibit_us: u32,
    /// Data held low before releasing the clock (request-to-send).
    pub request_to_send_us: u32,
    /// How long the device may take to start clocking after request-to-send.
    /// The protocol allows 10 ms.
    pub rts_timeout_us: u32,
    /// Settling time after a clock edge before the host changes data.
    pub bit_setup_us: u32,
    /// Timeout for each device clock edge and each acknowledge phase.
    pub bit_timeout_us: u32,
    /// Command response window, polled at 1 ms granularity.
    pub response_timeout_ms: u32,
    /// Minimum spacing between detection attempts.
    pub probe_interval_ms: u32,
    /// Self-test time granted after a reset command.
    pub self_test_ms: u32,
    /// Delay before reading each keyboard ID byte.
    pub id_byte_ms: u32,
    /// Gap between the set-LED command and its mask byte.
    pub led_gap_us: u32,
}

impl Default for Ps2Config {
    fn default() -> Self {
        Self {
            inhibit_us: 200,
            request_to_send_us: 200,
            rts_timeout_us: 15_000,
            bit_setup_us: 15,
            bit_timeout_us: 100,
            response_timeout_ms: 25,
            probe_interval_ms: 1000,
            self_test_ms: 500,
            id_byte_ms: 500,
            led_gap_us: 100,
        }
    }
}

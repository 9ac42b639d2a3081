//! HID keyboard report assembly.
//!
//! Boot protocol report (8 bytes):
//! ```text
//! Byte 0:   modifier bits (LCtrl, LShift, LAlt, LGui, RCtrl, RShift, RAlt, RGui)
//! Byte 1:   reserved
//! Byte 2-7: up to six pressed usage IDs
//! ```
//! Report protocol (NKRO) replaces bytes 1.. with a bitmap over usage IDs.

use bytemuck::{Pod, Zeroable};
use tracing::trace;

use crate::cs2::{KeyEvent, Usage, UsagePage};

pub const KEYBOARD_REPORT_KEYS: usize = 6;
/// Bytes of NKRO bitmap; covers usage IDs 0x00..=0xF7.
pub const KEYBOARD_REPORT_BITS: usize = 31;

/// First and last modifier usage IDs (Left Control .. Right GUI).
const MODIFIER_FIRST: u8 = 0xE0;
const MODIFIER_LAST: u8 = 0xE7;

/// Generic Desktop system control usages forwarded to the host.
const SYSTEM_POWER_DOWN: u16 = 0x81;
const SYSTEM_SLEEP: u16 = 0x82;
const SYSTEM_WAKE_UP: u16 = 0x83;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BootReport {
    pub modifier: u8,
    pub reserved: u8,
    pub keys: [u8; KEYBOARD_REPORT_KEYS],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct NkroReport {
    pub modifier: u8,
    pub bits: [u8; KEYBOARD_REPORT_BITS],
}

/// Which report layout the USB host selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// 6-key boot protocol.
    Boot,
    /// N-key rollover report protocol.
    Report,
}

/// Outgoing HID side. Reports are pushed on every change; nothing is polled.
pub trait HidTransport {
    fn protocol(&self) -> Protocol;

    fn send_keyboard(&mut self, report: &[u8]);

    /// Consumer control usage, 0 when released.
    fn send_consumer(&mut self, usage: u16);

    /// System control report, 0 when released.
    fn send_system(&mut self, report: u8);

    fn is_suspended(&self) -> bool {
        false
    }

    fn remote_wakeup(&mut self) {}
}

/// Current key state plus the transport it is reported to.
pub struct KeyboardReport<H> {
    boot: BootReport,
    nkro: NkroReport,
    transport: H,
}

impl<H: HidTransport> KeyboardReport<H> {
    pub fn new(transport: H) -> Self {
        Self {
            boot: BootReport::default(),
            nkro: NkroReport::default(),
            transport,
        }
    }

    pub fn transport(&self) -> &H {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut H {
        &mut self.transport
    }

    pub fn boot(&self) -> &BootReport {
        &self.boot
    }

    pub fn nkro(&self) -> &NkroReport {
        &self.nkro
    }

    /// Wire bytes for the active protocol.
    pub fn as_bytes(&self) -> &[u8] {
        report_bytes(self.transport.protocol(), &self.boot, &self.nkro)
    }

    pub fn add_key(&mut self, key: u8) {
        self.update(key, true);
        self.send();
    }

    pub fn del_key(&mut self, key: u8) {
        self.update(key, false);
        self.send();
    }

    pub fn register(&mut self, event: KeyEvent) {
        self.register_code(event.usage, event.make);
    }

    /// Route a usage to the report for its page.
    pub fn register_code(&mut self, usage: Usage, make: bool) {
        match usage.page() {
            UsagePage::Keyboard => {
                let key = usage.id() as u8;
                if make {
                    self.add_key(key);
                } else {
                    self.del_key(key);
                }
            }
            UsagePage::Consumer => {
                let report = if make { usage.id() } else { 0 };
                trace!("consumer {report:03X}");
                self.transport.send_consumer(report);
            }
            UsagePage::GenericDesktop => {
                let id = usage.id();
                if !matches!(id, SYSTEM_POWER_DOWN | SYSTEM_SLEEP | SYSTEM_WAKE_UP) {
                    return;
                }
                let report = if make { (id & 0x3) as u8 } else { 0 };
                trace!("system {report:02X}");
                self.transport.send_system(report);
            }
            UsagePage::Other(_) => {}
        }
    }

    fn update(&mut self, key: u8, pressed: bool) {
        if (MODIFIER_FIRST..=MODIFIER_LAST).contains(&key) {
            let bit = 1 << (key & 0x7);
            let modifier = if pressed {
                self.boot.modifier | bit
            } else {
                self.boot.modifier & !bit
            };
            self.boot.modifier = modifier;
            self.nkro.modifier = modifier;
            return;
        }
        // Usage 0 is "no event"; it would read as an empty slot.
        if key == 0 {
            return;
        }

        match self.transport.protocol() {
            Protocol::Report => {
                let Some(byte) = self.nkro.bits.get_mut(key as usize >> 3) else {
                    return;
                };
                let bit = 1 << (key & 0x7);
                if pressed {
                    *byte |= bit;
                } else {
                    *byte &= !bit;
                }
            }
            Protocol::Boot => {
                let keys = &mut self.boot.keys;
                if pressed {
                    if keys.contains(&key) {
                        return;
                    }
                    // Six keys down already: the extra key is not reported.
                    if let Some(slot) = keys.iter_mut().find(|k| **k == 0) {
                        *slot = key;
                    }
                } else if let Some(slot) = keys.iter_mut().find(|k| **k == key) {
                    *slot = 0;
                }
            }
        }
    }

    fn send(&mut self) {
        let bytes = report_bytes(self.transport.protocol(), &self.boot, &self.nkro);
        trace!("report {:02X?}", bytes);
        self.transport.send_keyboard(bytes);
    }
}

/// Wire bytes of whichever report `protocol` selects.
fn report_bytes<'a>(protocol: Protocol, boot: &'a BootReport, nkro: &'a NkroReport) -> &'a [u8] {
    match protocol {
        Protocol::Boot => bytemuck::bytes_of(boot),
        Protocol::Report => bytemuck::bytes_of(nkro),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::cs2::lookup;
    use crate::sim::CaptureTransport;

    fn report(protocol: Protocol) -> KeyboardReport<CaptureTransport> {
        KeyboardReport::new(CaptureTransport::new(protocol))
    }

    #[test]
    fn test_boot_report_layout() {
        let mut kb = report(Protocol::Boot);
        kb.add_key(0xE1); // left shift
        kb.add_key(0x04);
        kb.add_key(0x05);
        assert_eq!(kb.as_bytes(), &[0x02, 0x00, 0x04, 0x05, 0, 0, 0, 0]);
        assert_eq!(kb.transport().keyboard.len(), 3);
        assert_eq!(kb.transport().keyboard[2], kb.as_bytes());
    }

    #[test]
    fn test_nkro_report_layout() {
        let mut kb = report(Protocol::Report);
        kb.add_key(0xE4); // right ctrl
        kb.add_key(0x04);
        kb.add_key(0x52);
        let bytes = kb.as_bytes();
        assert_eq!(bytes.len(), 1 + KEYBOARD_REPORT_BITS);
        assert_eq!(bytes[0], 0x10);
        assert_eq!(bytes[1], 0x10); // 0x04 -> byte 0, bit 4
        assert_eq!(bytes[1 + (0x52 >> 3)], 1 << (0x52 & 7));
        // What was sent is what the report holds.
        assert_eq!(kb.transport().keyboard.len(), 3);
        assert_eq!(kb.transport().keyboard.last().map(Vec::as_slice), Some(bytes));
    }

    #[rstest]
    fn test_add_then_del_restores(
        #[values(Protocol::Boot, Protocol::Report)] protocol: Protocol,
        #[values(0x04, 0x28, 0x52, 0x93, 0xE0, 0xE7)] key: u8,
    ) {
        let mut kb = report(protocol);
        kb.add_key(0x1E);
        kb.add_key(0xE2);
        let before = kb.as_bytes().to_vec();
        kb.add_key(key);
        kb.del_key(key);
        assert_eq!(kb.as_bytes(), before.as_slice());
    }

    #[test]
    fn test_six_key_saturation() {
        let mut kb = report(Protocol::Boot);
        for key in 0x04..0x0A {
            kb.add_key(key);
        }
        let full = *kb.boot();
        kb.add_key(0x0A);
        assert_eq!(*kb.boot(), full);
        // Still reported, unchanged.
        assert_eq!(kb.transport().keyboard.len(), 7);
        assert_eq!(kb.transport().keyboard[6], bytemuck::bytes_of(&full));
    }

    #[test]
    fn test_duplicate_add_and_slot_reuse() {
        let mut kb = report(Protocol::Boot);
        kb.add_key(0x04);
        kb.add_key(0x04);
        assert_eq!(kb.boot().keys, [0x04, 0, 0, 0, 0, 0]);
        kb.add_key(0x05);
        kb.del_key(0x04);
        kb.add_key(0x06);
        assert_eq!(kb.boot().keys, [0x06, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn test_consumer_and_system_pages() {
        let mut kb = report(Protocol::Boot);
        // E0 34: play/pause
        kb.register_code(lookup(0xB4), true);
        kb.register_code(lookup(0xB4), false);
        assert_eq!(kb.transport().consumer, vec![0x0CD, 0]);

        // E0 3F: system sleep
        kb.register_code(lookup(0xBF), true);
        kb.register_code(lookup(0xBF), false);
        assert_eq!(kb.transport().system, vec![0x02, 0]);

        // Other system usages are dropped.
        kb.register_code(Usage::new(0x1084), true);
        assert_eq!(kb.transport().system.len(), 2);
        assert!(kb.transport().keyboard.is_empty());
    }

    #[test]
    fn test_unmapped_usage_is_ignored() {
        let mut kb = report(Protocol::Report);
        kb.register_code(lookup(0x00), true);
        assert_eq!(kb.as_bytes(), &[0u8; 1 + KEYBOARD_REPORT_BITS][..]);
    }
}

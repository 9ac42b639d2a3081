//! Code Set 2 scancode decoding.
//!
//! Scancode reference:
//! <https://github.com/tmk/tmk_keyboard/wiki/IBM-PC-AT-Keyboard-Protocol#code-set-2-to-hid-usage>

use thiserror::Error;
use tracing::debug;

/// A HID usage encoded as `page << 12 | id`. Page 0 is shorthand for the
/// keyboard page.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Usage(u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePage {
    Keyboard,
    Consumer,
    GenericDesktop,
    Other(u8),
}

impl Usage {
    pub const fn new(raw: u16) -> Self {
        Usage(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn page(self) -> UsagePage {
        match (self.0 >> 12) as u8 {
            0x0 | 0x7 => UsagePage::Keyboard,
            0xC => UsagePage::Consumer,
            0x1 => UsagePage::GenericDesktop,
            other => UsagePage::Other(other),
        }
    }

    /// Usage ID within the page.
    pub const fn id(self) -> u16 {
        self.0 & 0x0FFF
    }
}

impl std::fmt::Debug for Usage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Usage({:?}:{:03X})", self.page(), self.id())
    }
}

/// Code Set 2 to HID usage. Index `code | 0x80` holds the E0-prefixed key
/// for `code`; `0xF7` is Pause.
#[rustfmt::skip]
pub const CS2_TO_HID: [u16; 256] = [
//  0       1       2       3       4       5       6       7       8       9       A       B       C       D       E       F
    0x0000, 0x0042, 0x0000, 0x003E, 0x003C, 0x003A, 0x003B, 0x0045, 0x0068, 0x0043, 0x0041, 0x003F, 0x003D, 0x002B, 0x0035, 0x0067, // 0
    0x0069, 0x00E2, 0x00E1, 0x0088, 0x00E0, 0x0014, 0x001E, 0x0000, 0x006A, 0x0000, 0x001D, 0x0016, 0x0004, 0x001A, 0x001F, 0x0000, // 1
    0x006B, 0x0006, 0x001B, 0x0007, 0x0008, 0x0021, 0x0020, 0x008C, 0x006C, 0x002C, 0x0019, 0x0009, 0x0017, 0x0015, 0x0022, 0x0000, // 2
    0x006D, 0x0011, 0x0005, 0x000B, 0x000A, 0x001C, 0x0023, 0x0000, 0x006E, 0x0000, 0x0010, 0x000D, 0x0018, 0x0024, 0x0025, 0x0000, // 3
    0x006F, 0x0036, 0x000E, 0x000C, 0x0012, 0x0027, 0x0026, 0x0000, 0x0070, 0x0037, 0x0038, 0x000F, 0x0033, 0x0013, 0x002D, 0x0000, // 4
    0x0071, 0x0087, 0x0034, 0x0000, 0x002F, 0x002E, 0x0000, 0x0072, 0x0039, 0x00E5, 0x0028, 0x0030, 0x0000, 0x0031, 0x0000, 0x0073, // 5
    0x0000, 0x0064, 0x0093, 0x0092, 0x008A, 0x0000, 0x002A, 0x008B, 0x0000, 0x0059, 0x0089, 0x005C, 0x005F, 0x0085, 0x0000, 0x0000, // 6
    0x0062, 0x0063, 0x005A, 0x005D, 0x005E, 0x0060, 0x0029, 0x0053, 0x0044, 0x0057, 0x005B, 0x0056, 0x0055, 0x0061, 0x0047, 0x0046, // 7
    0x0000, 0x0000, 0x0000, 0x0040, 0x0046, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, // 8
    0xC221, 0x00E6, 0x0000, 0x0000, 0x00E4, 0xC0B6, 0x0000, 0x0000, 0xC22A, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x00E3, // 9
    0xC227, 0xC0EA, 0x0000, 0xC0E2, 0x0000, 0x0000, 0x0000, 0x00E7, 0xC226, 0x0000, 0x0000, 0xC192, 0x0000, 0x0000, 0x0000, 0x0065, // A
    0xC225, 0x0000, 0xC0E9, 0x0000, 0xC0CD, 0x0000, 0x0000, 0x1081, 0xC224, 0x0000, 0xC223, 0xC0B7, 0x0000, 0x0000, 0x0000, 0x1082, // B
    0xC194, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0xC18A, 0x0000, 0x0054, 0x0000, 0x0000, 0xC0B5, 0x0000, 0x0000, // C
    0xC183, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0058, 0x0000, 0x0000, 0x0000, 0x1083, 0x0000, // D
    0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x004D, 0x0000, 0x0050, 0x004A, 0x0000, 0x0000, 0x0000, // E
    0x0049, 0x004C, 0x0051, 0x0000, 0x004F, 0x0052, 0x0000, 0x0048, 0x0000, 0x0000, 0x004E, 0x0000, 0x0046, 0x004B, 0x0048, 0x0000, // F
];

pub fn lookup(index: u8) -> Usage {
    Usage(CS2_TO_HID[index as usize])
}

/// Prefix bytes and special codes.
pub mod codes {
    pub const EXTENDED: u8 = 0xE0;
    pub const PAUSE: u8 = 0xE1;
    pub const BREAK: u8 = 0xF0;
    /// F7 sits outside the 0x00..=0x7F block.
    pub const F7: u8 = 0x83;
    /// Alt'd PrintScreen (SysRq).
    pub const ALT_PRINT_SCREEN: u8 = 0x84;
    /// Power-on self-test passed.
    pub const SELF_TEST_PASSED: u8 = 0xAA;
    /// Power-on self-test failed.
    pub const SELF_TEST_FAILED: u8 = 0xFC;
}

/// E0-prefixed fake shifts some keyboards emit around navigation keys.
const IGNORED_EXTENDED: [u8; 2] = [0x12, 0x59];

/// Korean Hanja and Hangul/English keys; no HID mapping.
const IGNORED_KOREAN: [u8; 2] = [0xF1, 0xF2];

fn is_plain(code: u8) -> bool {
    code <= 0x7F || code == codes::F7 || code == codes::ALT_PRINT_SCREEN
}

/// Decoder position. Persists across bytes of a multi-byte scancode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cs2State {
    #[default]
    Init,
    /// After `F0`.
    Break,
    /// After `E0`.
    Extended,
    /// After `E0 F0`.
    ExtendedBreak,
    /// After `E1`.
    Pause,
    /// After `E1 14`.
    PauseMake14,
    /// After `E1 F0`.
    PauseBreak,
    /// After `E1 F0 14`.
    PauseBreak14,
    /// After `E1 F0 14 F0`.
    PauseBreak14F0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub usage: Usage,
    /// True for key down, false for key up.
    pub make: bool,
}

impl KeyEvent {
    fn make(index: u8) -> Self {
        KeyEvent {
            usage: lookup(index),
            make: true,
        }
    }

    fn brk(index: u8) -> Self {
        KeyEvent {
            usage: lookup(index),
            make: false,
        }
    }
}

/// The byte stream no longer makes sense; the host should re-detect the
/// keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unexpected byte {byte:#04X} in {state:?} state")]
pub struct DecodeError {
    pub state: Cs2State,
    pub byte: u8,
}

#[derive(Debug, Default)]
pub struct Cs2Decoder {
    state: Cs2State,
}

impl Cs2Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Cs2State {
        self.state
    }

    /// Consume one byte. Yields at most one key event.
    ///
    /// A broken Pause sequence returns to `Init` without an error; every
    /// other unexpected byte is a [`DecodeError`].
    pub fn process(&mut self, code: u8) -> Result<Option<KeyEvent>, DecodeError> {
        use Cs2State::*;

        let state = std::mem::take(&mut self.state);
        let event = match (state, code) {
            (Init, codes::EXTENDED) => {
                self.state = Extended;
                None
            }
            (Init, codes::BREAK) => {
                self.state = Break;
                None
            }
            (Init, codes::PAUSE) => {
                self.state = Pause;
                None
            }
            (Init, c) if is_plain(c) => Some(KeyEvent::make(c)),
            (Init, c) if IGNORED_KOREAN.contains(&c) => None,

            (Break, c) if is_plain(c) => Some(KeyEvent::brk(c)),

            (Extended | ExtendedBreak, c) if IGNORED_EXTENDED.contains(&c) => None,
            (Extended, codes::BREAK) => {
                self.state = ExtendedBreak;
                None
            }
            (Extended, c) if c < 0x80 => Some(KeyEvent::make(c | 0x80)),
            (ExtendedBreak, c) if c < 0x80 => Some(KeyEvent::brk(c | 0x80)),

            // Pause make: E1 14 77
            (Pause, 0x14) => {
                self.state = PauseMake14;
                None
            }
            (Pause, codes::BREAK) => {
                self.state = PauseBreak;
                None
            }
            (PauseMake14, 0x77) => Some(KeyEvent::make(0x77 | 0x80)),
            // Pause break: E1 F0 14 F0 77
            (PauseBreak, 0x14) => {
                self.state = PauseBreak14;
                None
            }
            (PauseBreak14, codes::BREAK) => {
                self.state = PauseBreak14F0;
                None
            }
            (PauseBreak14F0, 0x77) => Some(KeyEvent::brk(0x77 | 0x80)),
            (Pause | PauseMake14 | PauseBreak | PauseBreak14 | PauseBreak14F0, _) => None,

            (state @ (Init | Break | Extended | ExtendedBreak), byte) => {
                debug!("CS2: unexpected {byte:02X} in {state:?}");
                return Err(DecodeError { state, byte });
            }
        };
        Ok(event)
    }
}

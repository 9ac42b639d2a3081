//! PS/2 keyboard host driver.
//!
//! The platform supplies a [`Bus`] (the two open-drain lines) and a
//! [`Clock`], and forwards every falling clock edge to the [`Ps2Interrupt`]
//! handle. The main loop calls [`Ps2Host::task`], which detects the keyboard,
//! decodes Code Set 2 scan codes and pushes HID reports to a
//! [`HidTransport`].
//!
//! ```text
//! clock edge -> Ps2Interrupt -> ring -> Ps2Host::task -> Cs2Decoder -> KeyboardReport -> HidTransport
//! ```

pub mod bus;
pub mod config;
pub mod cs2;
mod driver;
pub mod error;
pub mod report;
pub mod ring;
pub mod rx;
pub mod session;
pub mod sim;
mod tx;

pub use bus::{Bus, Clock, Edge, Line};
pub use config::Ps2Config;
pub use cs2::{Cs2Decoder, DecodeError, KeyEvent, Usage};
pub use driver::Ps2Host;
pub use error::Ps2Error;
pub use report::{HidTransport, KeyboardReport, Protocol};
pub use rx::Ps2Interrupt;
pub use session::Leds;

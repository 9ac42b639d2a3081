use std::path::PathBuf;

use clap::Parser;
use tracing::{Level, info, warn};

use ps2kbd::report::{HidTransport, Protocol};
use ps2kbd::sim::{Sim, SimKeyboard};
use ps2kbd::{Leds, Ps2Config};

mod host;

/// Main-loop period of the replay, in simulated microseconds.
const TICK_US: u64 = 250;

/// PS/2 keyboard replay
/// Runs the host driver against a simulated keyboard and prints the USB
/// reports it produces
#[derive(Parser, Debug)]
#[command(name = "ps2kbd-sim")]
#[command(about = "Replay Code Set 2 scan codes through the PS/2 host driver")]
struct Args {
    /// Scan code bytes sent by the keyboard once detected, parsed as hex
    #[arg(value_parser = parse_hex_byte)]
    scancodes: Vec<u8>,

    /// Use the N-key rollover report protocol instead of the boot protocol
    #[arg(long)]
    nkro: bool,

    /// USB HID LED output report to apply, parsed as hex
    #[arg(long, value_parser = parse_hex_byte)]
    led: Option<u8>,

    /// Keep the keyboard unplugged for this many milliseconds
    #[arg(long, default_value_t = 0)]
    unplugged_ms: u64,

    /// Simulated run time in milliseconds
    #[arg(long, default_value_t = 3000)]
    duration_ms: u64,

    /// Write the log to a file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Enable verbose output (per-byte traces)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex_byte(s: &str) -> Result<u8, Box<dyn std::error::Error + Send + Sync>> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    Ok(u8::from_str_radix(s, 16)?)
}

/// Stands in for the USB stack: every report is logged.
struct LogTransport {
    protocol: Protocol,
    reports: usize,
}

impl HidTransport for LogTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn send_keyboard(&mut self, report: &[u8]) {
        self.reports += 1;
        info!("keyboard {report:02X?}");
    }

    fn send_consumer(&mut self, usage: u16) {
        self.reports += 1;
        info!("consumer {usage:03X}");
    }

    fn send_system(&mut self, report: u8) {
        self.reports += 1;
        info!("system {report:02X}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::TRACE
    } else {
        Level::INFO
    };
    match &args.log_file {
        Some(path) => host::logging::setup_logging_file(level, path)?,
        None => host::logging::setup_logging_stdio(level),
    }

    let keyboard = if args.unplugged_ms > 0 {
        SimKeyboard::absent()
    } else {
        SimKeyboard::new()
    };
    let protocol = if args.nkro {
        Protocol::Report
    } else {
        Protocol::Boot
    };
    let transport = LogTransport {
        protocol,
        reports: 0,
    };
    let (sim, mut host) = Sim::host(keyboard, transport, Ps2Config::default());

    if let Some(report) = args.led {
        let leds = Leds::from_hid(report);
        info!("LED request {leds:?}");
        host.set_led(leds)?;
    }

    let mut injected = false;
    while sim.now_us() < args.duration_ms * 1000 {
        if sim.now_us() >= args.unplugged_ms * 1000 && !sim.keyboard(|kb| kb.is_present()) {
            info!("keyboard plugged in at {} ms", sim.now_us() / 1000);
            sim.keyboard(|kb| kb.plug_in());
        }
        if !injected && host.is_detected() {
            sim.keyboard(|kb| kb.inject(&args.scancodes));
            injected = true;
        }
        host.task();
        sim.run_us(TICK_US);
    }

    if let Some(err) = host.last_error() {
        warn!("last bus error e{:02X}: {err}", err.code());
    }
    match host.keyboard_id() {
        Some(id) => {
            let pending = sim.keyboard(|kb| kb.pending());
            if pending > 0 {
                warn!("{pending} scan code bytes not delivered, try a longer --duration-ms");
            }
            info!(
                "keyboard {id:04X}: {} reports, LEDs {:?}, final {:02X?}",
                host.transport().reports,
                Leds::new(sim.keyboard(|kb| kb.leds())),
                host.report().as_bytes()
            );
        }
        None => warn!("no keyboard detected"),
    }
    Ok(())
}

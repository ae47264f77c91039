use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use clap::error::ErrorKind;
use hidflash_core::events::{FlashEvent, FlashObserver, FlashPhase, TracingObserver};
use hidflash_core::{EXIT_UNKNOWN_COMMAND, EXIT_USAGE, FlashSession, SessionConfig};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Microchip HID bootloader utility (Pure Rust)", long_about = None)]
struct Args {
    /// Write hex file to device (will erase first)
    #[arg(short, long, value_name = "FILE")]
    write: Option<PathBuf>,

    /// Erase device code space (implicit if -w)
    #[arg(short, long)]
    erase: bool,

    /// Reset device on program exit
    #[arg(short, long)]
    reset: bool,

    /// No verify after write
    #[arg(short = 'n', long)]
    no_verify: bool,

    /// Unlock configuration memory before erase/write
    #[arg(short, long)]
    unlock: bool,

    /// Sign flash (required by later bootloader versions)
    #[arg(short, long)]
    sign: bool,

    /// USB device vendor ID [default: 04D8]
    #[arg(short = 'v', long = "vendor", value_name = "HEX", value_parser = parse_hex_id)]
    vendor_id: Option<u16>,

    /// USB device product ID [default: 003C]
    #[arg(short = 'p', long = "product", value_name = "HEX", value_parser = parse_hex_id)]
    product_id: Option<u16>,

    /// Load session settings from a TOML file; flags override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// Parse a USB id given in hex, with or without a `0x` prefix.
fn parse_hex_id(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("'{}' is not a 16-bit hex value: {}", s, e))
}

impl Args {
    /// Merge the optional config file with the command line.
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load_from_file(path)?,
            None => SessionConfig::default(),
        };

        if let Some(vid) = self.vendor_id {
            config.vendor_id = vid;
        }
        if let Some(pid) = self.product_id {
            config.product_id = pid;
        }
        if let Some(path) = &self.write {
            config.hex_path = Some(path.to_string_lossy().into_owned());
        }
        config.unlock |= self.unlock;
        config.erase |= self.erase;
        config.sign |= self.sign;
        config.reset |= self.reset;
        if self.no_verify {
            config.verify = false;
        }
        Ok(config)
    }
}

/// Prints one dot per block on stdout and forwards everything to tracing.
struct ProgressObserver {
    inner: TracingObserver,
}

/// Progress text printed for `event`, if any.
fn progress_text(event: &FlashEvent) -> Option<&'static str> {
    match event {
        FlashEvent::PhaseChanged { to, .. } => match to {
            FlashPhase::Writing => Some("Writing hex file:"),
            FlashPhase::Verifying => Some("\nVerifying:"),
            FlashPhase::Signing | FlashPhase::Resetting | FlashPhase::Complete
            | FlashPhase::Error => Some("\n"),
            _ => None,
        },
        FlashEvent::BlockIssued { .. } => Some("."),
        _ => None,
    }
}

/// Write progress text to `out`. Failures are logged at debug level only.
fn emit(out: &mut impl Write, text: &str) {
    if let Err(e) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
        debug!("Progress output failed: {}", e);
    }
}

impl FlashObserver for ProgressObserver {
    fn on_event(&self, event: &FlashEvent) {
        if let Some(text) = progress_text(event) {
            emit(&mut std::io::stdout().lock(), text);
        }
        self.inner.on_event(event);
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                ErrorKind::UnknownArgument | ErrorKind::InvalidSubcommand => EXIT_UNKNOWN_COMMAND,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to install log subscriber");
    }

    let config = match args.session_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(EXIT_USAGE);
        }
    };

    info!(
        vid = %format!("{:04X}", config.vendor_id),
        pid = %format!("{:04X}", config.product_id),
        "Starting hidflash (nusb backend)..."
    );

    if !config.has_work() {
        warn!("No action requested; the device will only be queried");
    }

    let observer = Arc::new(ProgressObserver {
        inner: TracingObserver,
    });

    let result = FlashSession::open_with_observer(config.vendor_id, config.product_id, observer)
        .and_then(|mut session| session.run(&config));

    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

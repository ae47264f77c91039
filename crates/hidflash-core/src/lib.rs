//! hidflash-core: USB HID bootloader programming in Rust.
//!
//! This crate writes Intel HEX firmware images to microcontrollers running a
//! Microchip-style HID bootloader, and verifies them afterwards.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Hex**: Record decoding, linear address walking, file buffer
//! - **Device**: Reported memory map and region clipping
//! - **Protocol**: Command codes and 64-byte report framing
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Engine**: Write/verify passes over the hex stream
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use hidflash_core::session::{FlashSession, SessionConfig};
//!
//! let config = SessionConfig {
//!     hex_path: Some("firmware.hex".to_string()),
//!     reset: true,
//!     ..Default::default()
//! };
//!
//! let mut session = FlashSession::open(config.vendor_id, config.product_id)
//!     .expect("device not found");
//! session.run(&config).expect("programming failed");
//! ```

pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod hex;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use device::{DeviceFamily, DeviceMemoryMap, MemoryKind, MemoryRegion, QueryError, Span};
pub use engine::{Mode, PassStats, ProgramVerifyEngine};
pub use error::{EXIT_UNKNOWN_COMMAND, EXIT_USAGE, FlashError, ProtocolError};
pub use events::{FlashEvent, FlashObserver, FlashPhase, LogLevel, NullObserver, TracingObserver};
pub use hex::{HexError, HexRecord, HexSource, Run, Segment, SourceError};
pub use session::{FlashSession, ProgramReport, SessionConfig};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};

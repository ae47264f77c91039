//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for HID report exchange,
//! allowing different implementations (nusb, mock, etc.).

use crate::protocol::{Frame, REPORT_SIZE};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("USB enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Short report: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract USB transport interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send + Sync {
    /// Write one report to the OUT endpoint.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read one report from the IN endpoint.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Send the first `out_len` bytes of `frame`; when `expect_reply` is set,
    /// read a full report back into the same frame.
    fn exchange(
        &self,
        frame: &mut Frame,
        out_len: usize,
        expect_reply: bool,
    ) -> Result<(), TransportError> {
        let sent = self.write(&frame.as_bytes()[..out_len])?;
        if sent != out_len {
            return Err(TransportError::WriteFailed(format!(
                "sent {} of {} bytes",
                sent, out_len
            )));
        }

        if expect_reply {
            let reply = self.read(REPORT_SIZE)?;
            if reply.len() < REPORT_SIZE {
                return Err(TransportError::ShortRead {
                    expected: REPORT_SIZE,
                    actual: reply.len(),
                });
            }
            frame.load(&reply);
        }
        Ok(())
    }

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}

//! Fixed-size report framing for bootloader commands.
//!
//! All traffic is exchanged as 64-byte HID reports. The layout of a data
//! request is:
//!
//! ```text
//! [0]      command
//! [1..5]   address in device units (u32 LE)
//! [5]      payload length
//! [6..64]  payload, right-justified (ends at byte 63)
//! ```
//!
//! GetData replies use the same layout, with the returned bytes also
//! right-justified.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use super::constants::*;

/// Bootloader command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    QueryDevice,
    UnlockConfig,
    EraseDevice,
    ProgramDevice,
    ProgramComplete,
    GetData,
    ResetDevice,
    SignFlash,
}

impl Command {
    pub const fn code(self) -> u8 {
        match self {
            Command::QueryDevice => CMD_QUERY_DEVICE,
            Command::UnlockConfig => CMD_UNLOCK_CONFIG,
            Command::EraseDevice => CMD_ERASE_DEVICE,
            Command::ProgramDevice => CMD_PROGRAM_DEVICE,
            Command::ProgramComplete => CMD_PROGRAM_COMPLETE,
            Command::GetData => CMD_GET_DATA,
            Command::ResetDevice => CMD_RESET_DEVICE,
            Command::SignFlash => CMD_SIGN_FLASH,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            CMD_QUERY_DEVICE => Some(Command::QueryDevice),
            CMD_UNLOCK_CONFIG => Some(Command::UnlockConfig),
            CMD_ERASE_DEVICE => Some(Command::EraseDevice),
            CMD_PROGRAM_DEVICE => Some(Command::ProgramDevice),
            CMD_PROGRAM_COMPLETE => Some(Command::ProgramComplete),
            CMD_GET_DATA => Some(Command::GetData),
            CMD_RESET_DEVICE => Some(Command::ResetDevice),
            CMD_SIGN_FLASH => Some(Command::SignFlash),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::QueryDevice => "QUERY_DEVICE",
            Command::UnlockConfig => "UNLOCK_CONFIG",
            Command::EraseDevice => "ERASE_DEVICE",
            Command::ProgramDevice => "PROGRAM_DEVICE",
            Command::ProgramComplete => "PROGRAM_COMPLETE",
            Command::GetData => "GET_DATA",
            Command::ResetDevice => "RESET_DEVICE",
            Command::SignFlash => "SIGN_FLASH",
        };
        f.write_str(name)
    }
}

/// One 64-byte report buffer, reused for every exchange of a session.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    bytes: [u8; REPORT_SIZE],
}

impl Frame {
    pub const SIZE: usize = REPORT_SIZE;

    pub const fn new() -> Self {
        Self {
            bytes: [0; REPORT_SIZE],
        }
    }

    /// Clear the frame and start a new request with `command`.
    pub fn begin(&mut self, command: Command) {
        self.bytes = [0; REPORT_SIZE];
        self.bytes[0] = command.code();
    }

    pub fn command_code(&self) -> u8 {
        self.bytes[0]
    }

    pub fn set_byte(&mut self, offset: usize, value: u8) {
        self.bytes[offset] = value;
    }

    pub fn set_address(&mut self, address: u32) {
        LittleEndian::write_u32(
            &mut self.bytes[ADDRESS_OFFSET..ADDRESS_OFFSET + 4],
            address,
        );
    }

    pub fn address(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[ADDRESS_OFFSET..ADDRESS_OFFSET + 4])
    }

    pub fn set_length(&mut self, len: u8) {
        self.bytes[LENGTH_OFFSET] = len;
    }

    pub fn length(&self) -> u8 {
        self.bytes[LENGTH_OFFSET]
    }

    /// Place `data` so that it ends at the last byte of the report.
    pub fn put_tail(&mut self, data: &[u8]) {
        let start = REPORT_SIZE - data.len();
        self.bytes[start..].copy_from_slice(data);
    }

    /// The last `len` bytes of the report.
    pub fn tail(&self, len: usize) -> &[u8] {
        &self.bytes[REPORT_SIZE - len..]
    }

    /// Overwrite the frame with a received report. Bytes past the end of
    /// `report` keep their previous value.
    pub fn load(&mut self, report: &[u8]) {
        let n = report.len().min(REPORT_SIZE);
        self.bytes[..n].copy_from_slice(&report[..n]);
    }

    pub fn as_bytes(&self) -> &[u8; REPORT_SIZE] {
        &self.bytes
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(")?;
        for b in &self.bytes[..DATA_HEADER_SIZE] {
            write!(f, "{:02X}", b)?;
        }
        write!(f, " ..)")
    }
}

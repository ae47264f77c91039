//! Session-level errors and their process exit codes.

use thiserror::Error;

use crate::device::QueryError;
use crate::hex::{DecodeError, HexError, SourceError};
use crate::protocol::Command;
use crate::transport::TransportError;

/// Failures of the bootloader protocol itself.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{command} at 0x{address:08X} failed: {source}")]
    Transport {
        command: Command,
        address: u32,
        #[source]
        source: TransportError,
    },

    #[error("Verification failed at 0x{address:08X}: expected {expected:02X?}, device has {actual:02X?}")]
    VerificationMismatch {
        address: u32,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },

    #[error("Sign flash failed: {source}")]
    SignFlashFailed {
        #[source]
        source: TransportError,
    },
}

/// Any failure of a flashing session.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Hex(#[from] HexError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Exit code for a missing or malformed command line argument.
pub const EXIT_USAGE: i32 = 1;

/// Exit code for an unrecognized command line option.
pub const EXIT_UNKNOWN_COMMAND: i32 = 2;

impl FlashError {
    /// Distinct non-zero process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            FlashError::Transport(e) => transport_exit_code(e),
            FlashError::Source(e) => match e {
                SourceError::Open { .. } => 9,
                SourceError::Stat { .. } => 10,
                SourceError::Read { .. } => 11,
            },
            FlashError::Hex(e) => match e {
                HexError::Record {
                    source: DecodeError::Syntax,
                    ..
                } => 12,
                HexError::Record {
                    source: DecodeError::Checksum { .. },
                    ..
                } => 13,
                HexError::UnsupportedRecord { .. } => 14,
            },
            FlashError::Protocol(e) => match e {
                ProtocolError::Transport { source, .. } => transport_exit_code(source),
                ProtocolError::VerificationMismatch { .. } => 15,
                ProtocolError::SignFlashFailed { .. } => 24,
            },
            FlashError::Query(e) => match e {
                QueryError::BadRegionKind { .. } => 16,
                QueryError::BadRegionLength { .. } => 17,
                QueryError::MisalignedRegionLength { .. } => 18,
                QueryError::OverlappingRegions { .. } => 19,
                QueryError::DuplicateRegionKind { .. } => 20,
                QueryError::NoProgramMemory => 21,
                QueryError::WrongCommand { .. } => 22,
                QueryError::UnexpectedPacketSize { .. } => 23,
                QueryError::ShortResponse { .. } => 8,
            },
        }
    }
}

fn transport_exit_code(e: &TransportError) -> i32 {
    match e {
        TransportError::DeviceNotFound { .. } => 3,
        TransportError::EnumerationFailed(_) => 4,
        TransportError::ClaimInterfaceFailed { .. } | TransportError::EndpointNotFound { .. } => 5,
        TransportError::OpenFailed(_) => 6,
        TransportError::WriteFailed(_) => 7,
        TransportError::ReadFailed(_)
        | TransportError::ShortRead { .. }
        | TransportError::Disconnected
        | TransportError::Timeout { .. }
        | TransportError::Io(_) => 8,
    }
}

//! Intel HEX input: record decoding, address walking and the file buffer.

pub mod record;
pub mod source;
pub mod walker;

pub use record::{DecodeError, HexError, HexRecord, HexRecords, RecordKind, hex_pair};
pub use source::{HexSource, SourceError};
pub use walker::{Run, RunWalker, Segment, walk};

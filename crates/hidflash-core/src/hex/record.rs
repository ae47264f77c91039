//! Intel HEX record decoding.
//!
//! A record is one `:LLAAAATT<data>CC` line. The length, address and type
//! fields are validated strictly; data and checksum characters go through
//! [`hex_pair`], which does not reject non-hex characters and relies on the
//! line checksum to catch corruption.

use std::fmt;
use thiserror::Error;

/// Colon + length + address + type.
const HEADER_CHARS: usize = 9;

/// Errors raised while decoding a single record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid record syntax")]
    Syntax,
    #[error("Checksum mismatch: computed 0x{computed:02X}, record has 0x{found:02X}")]
    Checksum { computed: u8, found: u8 },
}

/// Errors raised while walking a hex stream. Carries the 1-based record number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    #[error("Hex record {line}: {source}")]
    Record {
        line: usize,
        #[source]
        source: DecodeError,
    },
    #[error("Hex record {line}: unsupported record type 0x{kind:02X}")]
    UnsupportedRecord { line: usize, kind: u8 },
}

/// Record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Data,
    EndOfFile,
    ExtendedLinearAddress,
    StartAddress,
    /// Any other tag. Decodes fine, but the walker refuses it.
    Other(u8),
}

impl RecordKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => RecordKind::Data,
            0x01 => RecordKind::EndOfFile,
            0x04 => RecordKind::ExtendedLinearAddress,
            0x05 => RecordKind::StartAddress,
            other => RecordKind::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RecordKind::Data => 0x00,
            RecordKind::EndOfFile => 0x01,
            RecordKind::ExtendedLinearAddress => 0x04,
            RecordKind::StartAddress => 0x05,
            RecordKind::Other(code) => code,
        }
    }
}

/// One decoded hex line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub offset: u16,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

impl HexRecord {
    /// Build a record and compute its checksum.
    pub fn new(kind: RecordKind, offset: u16, payload: Vec<u8>) -> Self {
        let checksum = compute_checksum(payload.len() as u8, offset, kind.code(), &payload);
        Self {
            offset,
            kind,
            payload,
            checksum,
        }
    }

    /// Decode the record starting at `line[0]`. Trailing bytes after the
    /// checksum are ignored.
    pub fn decode(line: &[u8]) -> Result<Self, DecodeError> {
        if line.len() < HEADER_CHARS + 2 || line[0] != b':' {
            return Err(DecodeError::Syntax);
        }

        let length = strict_pair(&line[1..3])?;
        let offset = u16::from_be_bytes([strict_pair(&line[3..5])?, strict_pair(&line[5..7])?]);
        let kind_code = strict_pair(&line[7..9])?;

        let end = HEADER_CHARS + 2 * length as usize;
        if line.len() < end + 2 {
            return Err(DecodeError::Syntax);
        }

        let payload: Vec<u8> = line[HEADER_CHARS..end]
            .chunks_exact(2)
            .map(|pair| hex_pair(pair[0], pair[1]))
            .collect();
        let found = hex_pair(line[end], line[end + 1]);
        let computed = compute_checksum(length, offset, kind_code, &payload);

        if computed != found {
            return Err(DecodeError::Checksum { computed, found });
        }

        Ok(Self {
            offset,
            kind: RecordKind::from_code(kind_code),
            payload,
            checksum: found,
        })
    }

    /// Payload length as carried in the LL field.
    pub fn length(&self) -> u8 {
        self.payload.len() as u8
    }

    /// Number of characters the record occupies on its line.
    pub fn encoded_len(&self) -> usize {
        HEADER_CHARS + 2 * self.payload.len() + 2
    }

    /// Render the record as an uppercase hex line (no line terminator).
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.encoded_len());
        out.push_str(&format!(
            ":{:02X}{:04X}{:02X}",
            self.length(),
            self.offset,
            self.kind.code()
        ));
        for b in &self.payload {
            out.push_str(&format!("{:02X}", b));
        }
        out.push_str(&format!("{:02X}", self.checksum));
        out
    }
}

impl fmt::Display for HexRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Two's-complement of the byte sum of every field before the checksum.
pub fn compute_checksum(length: u8, offset: u16, kind: u8, payload: &[u8]) -> u8 {
    let [hi, lo] = offset.to_be_bytes();
    let sum = payload
        .iter()
        .fold(length.wrapping_add(hi).wrapping_add(lo).wrapping_add(kind), |acc, &b| {
            acc.wrapping_add(b)
        });
    sum.wrapping_neg()
}

/// Decode two hex characters into a byte.
///
/// Anything above `'9'` is taken as a letter `A`..`F` (either case) without
/// range checking. Garbage characters produce garbage values, which the
/// line checksum is expected to reject.
pub fn hex_pair(hi: u8, lo: u8) -> u8 {
    (nibble(hi) << 4) | nibble(lo)
}

fn nibble(c: u8) -> u8 {
    if c <= b'9' {
        c.wrapping_sub(b'0')
    } else {
        c.to_ascii_uppercase().wrapping_sub(b'A').wrapping_add(0x0A)
    }
}

fn strict_pair(pair: &[u8]) -> Result<u8, DecodeError> {
    if pair.iter().all(u8::is_ascii_hexdigit) {
        Ok(hex_pair(pair[0], pair[1]))
    } else {
        Err(DecodeError::Syntax)
    }
}

/// Iterator over the records of an in-memory hex file.
///
/// The first record must start at byte 0; each following record is found by
/// scanning for the next `:` after the previous checksum, so any line
/// terminator style is accepted. Iteration stops after the first error.
#[derive(Debug)]
pub struct HexRecords<'a> {
    data: &'a [u8],
    pos: Option<usize>,
    line: usize,
}

impl<'a> HexRecords<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: Some(0),
            line: 0,
        }
    }
}

impl Iterator for HexRecords<'_> {
    /// `(record number, record)`
    type Item = Result<(usize, HexRecord), HexError>;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.pos.take()?;
        self.line += 1;

        let record = match HexRecord::decode(&self.data[pos..]) {
            Ok(r) => r,
            Err(source) => {
                return Some(Err(HexError::Record {
                    line: self.line,
                    source,
                }));
            }
        };

        let end = pos + record.encoded_len();
        self.pos = self.data[end..]
            .iter()
            .position(|&b| b == b':')
            .map(|i| end + i);

        Some(Ok((self.line, record)))
    }
}

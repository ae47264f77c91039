//! Linear address tracking and run coalescing.
//!
//! Turns a record stream into [`Segment`]s: contiguous byte runs no larger
//! than one transport payload, separated by explicit breaks wherever the
//! file jumps to an unrelated address.

use std::collections::VecDeque;

use super::record::{DecodeError, HexError, HexRecord, HexRecords, RecordKind};
use crate::protocol::constants::PAYLOAD_CAPACITY;

/// Contiguous bytes destined for consecutive addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Run {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Output of the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Run(Run),
    /// The stream moved to a non-contiguous address (data record jump or
    /// extended linear address record). Buffered device writes must be
    /// committed before the next run.
    Break,
}

/// Lazy walker over a record stream.
///
/// Stops at the first error or at the EndOfFile record. Runs are closed
/// when the address jumps, when they reach `capacity`, and when the 32-bit
/// address wraps from 0xFFFFFFFF to 0.
#[derive(Debug)]
pub struct RunWalker<I> {
    records: I,
    capacity: usize,
    extended_base: u32,
    cursor: u32,
    run_start: u32,
    buf: Vec<u8>,
    pending: VecDeque<Segment>,
    finished: bool,
}

impl<I> RunWalker<I>
where
    I: Iterator<Item = Result<(usize, HexRecord), HexError>>,
{
    pub fn new(records: I) -> Self {
        Self::with_capacity(records, PAYLOAD_CAPACITY)
    }

    pub fn with_capacity(records: I, capacity: usize) -> Self {
        Self {
            records,
            capacity,
            extended_base: 0,
            cursor: 0,
            run_start: 0,
            buf: Vec::with_capacity(capacity),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    fn close_run(&mut self) {
        if !self.buf.is_empty() {
            let data = std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity));
            self.pending.push_back(Segment::Run(Run {
                address: self.run_start,
                data,
            }));
        }
    }

    fn jump_to(&mut self, address: u32) {
        self.close_run();
        self.pending.push_back(Segment::Break);
        self.cursor = address;
    }

    fn absorb(&mut self, line: usize, record: HexRecord) -> Result<(), HexError> {
        match record.kind {
            RecordKind::Data => {
                let address = self.extended_base.wrapping_add(u32::from(record.offset));
                if address != self.cursor {
                    self.jump_to(address);
                }

                for byte in record.payload {
                    if self.buf.is_empty() {
                        self.run_start = self.cursor;
                    }
                    self.buf.push(byte);
                    if self.buf.len() == self.capacity {
                        self.close_run();
                    }

                    if self.cursor == u32::MAX {
                        self.close_run();
                        self.cursor = 0;
                    } else {
                        self.cursor += 1;
                    }
                }
            }
            RecordKind::ExtendedLinearAddress => {
                if record.payload.len() != 2 {
                    return Err(HexError::Record {
                        line,
                        source: DecodeError::Syntax,
                    });
                }
                let upper = u16::from_be_bytes([record.payload[0], record.payload[1]]);
                self.extended_base = u32::from(upper) << 16;
                let base = self.extended_base;
                self.jump_to(base);
            }
            RecordKind::StartAddress => {}
            RecordKind::EndOfFile => {
                self.close_run();
                self.finished = true;
            }
            RecordKind::Other(kind) => {
                return Err(HexError::UnsupportedRecord { line, kind });
            }
        }
        Ok(())
    }
}

impl<I> Iterator for RunWalker<I>
where
    I: Iterator<Item = Result<(usize, HexRecord), HexError>>,
{
    type Item = Result<Segment, HexError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(segment) = self.pending.pop_front() {
                return Some(Ok(segment));
            }
            if self.finished {
                return None;
            }

            match self.records.next() {
                None => {
                    self.finished = true;
                    self.close_run();
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Some(Ok((line, record))) => {
                    if let Err(e) = self.absorb(line, record) {
                        self.finished = true;
                        self.pending.clear();
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

/// Walk an in-memory hex file with the default payload capacity.
pub fn walk(data: &[u8]) -> RunWalker<HexRecords<'_>> {
    RunWalker::new(HexRecords::new(data))
}

//! Program/verify engine.
//!
//! Drives one pass over the walker's segments: each run is clipped against
//! the device memory map, padded to an even length and sent as one
//! ProgramDevice (write) or GetData (verify) report. Short write blocks are
//! committed with a ProgramComplete right away; full blocks stay buffered on
//! the device until the next short block, a break in the address stream, or
//! the end of the pass.

use std::fmt;

use tracing::{debug, info, instrument, trace};

use crate::device::DeviceMemoryMap;
use crate::error::{FlashError, ProtocolError};
use crate::events::{FlashEvent, FlashObserver};
use crate::hex::{HexError, Segment};
use crate::protocol::constants::{DATA_HEADER_SIZE, PAD_BYTE, PAYLOAD_CAPACITY, REPORT_SIZE};
use crate::protocol::{Command, Frame};
use crate::transport::UsbTransport;

/// Pass type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Write,
    Verify,
}

impl Mode {
    /// Request command used for data blocks in this mode.
    pub fn command(self) -> Command {
        match self {
            Mode::Write => Command::ProgramDevice,
            Mode::Verify => Command::GetData,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Write => write!(f, "Write"),
            Mode::Verify => write!(f, "Verify"),
        }
    }
}

/// Counters for one finished pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    /// Data reports sent.
    pub blocks: usize,
    /// File bytes covered, padding excluded.
    pub bytes: usize,
    /// ProgramComplete reports sent.
    pub completions: usize,
}

/// Engine state for one pass. Borrows the session's report buffer.
pub struct ProgramVerifyEngine<'a, T: UsbTransport, O: FlashObserver> {
    transport: &'a T,
    map: &'a DeviceMemoryMap,
    observer: &'a O,
    frame: &'a mut Frame,
    /// No full-capacity block is waiting on the device for a completion.
    flushed: bool,
    last_address: u32,
}

impl<'a, T: UsbTransport, O: FlashObserver> ProgramVerifyEngine<'a, T, O> {
    pub fn new(
        transport: &'a T,
        map: &'a DeviceMemoryMap,
        observer: &'a O,
        frame: &'a mut Frame,
    ) -> Self {
        Self {
            transport,
            map,
            observer,
            frame,
            flushed: true,
            last_address: 0,
        }
    }

    /// Run one pass over `segments`.
    ///
    /// Any hex, transport or verification error aborts the pass at once.
    /// Blocks already written stay written.
    #[instrument(level = "info", skip(self, segments), fields(mode = %mode))]
    pub fn run<I>(&mut self, mode: Mode, segments: I) -> Result<PassStats, FlashError>
    where
        I: IntoIterator<Item = Result<Segment, HexError>>,
    {
        self.flushed = true;
        let mut stats = PassStats::default();

        for segment in segments {
            match segment? {
                Segment::Break => self.flush(&mut stats)?,
                Segment::Run(run) => {
                    let spans = self.map.clip(run.address, run.len() as u32);
                    if spans.is_empty() {
                        trace!(address = %format!("0x{:08X}", run.address), len = run.len(), "Skipping unprogrammable run");
                    }
                    for span in spans {
                        let start = (span.address - run.address) as usize;
                        let data = &run.data[start..start + span.length as usize];
                        self.issue_block(mode, span.address, data, &mut stats)?;
                    }
                }
            }
        }
        self.flush(&mut stats)?;

        info!(
            blocks = stats.blocks,
            bytes = stats.bytes,
            completions = stats.completions,
            "Pass complete"
        );
        Ok(stats)
    }

    fn issue_block(
        &mut self,
        mode: Mode,
        address: u32,
        data: &[u8],
        stats: &mut PassStats,
    ) -> Result<(), FlashError> {
        let mut block = data.to_vec();
        if block.len() % 2 == 1 {
            block.push(PAD_BYTE);
        }
        let len = block.len();
        let device_address = address / u32::from(self.map.granularity());

        self.observer.on_event(&FlashEvent::BlockIssued {
            mode,
            address,
            length: len,
        });
        debug!(
            address = %format!("0x{:08X}", address),
            device_address = %format!("0x{:08X}", device_address),
            len,
            "Issuing block"
        );

        self.frame.begin(mode.command());
        self.frame.set_address(device_address);
        self.frame.set_length(len as u8);
        self.last_address = address;

        match mode {
            Mode::Write => {
                // The bootloader expects the payload to end at the last byte
                // of the report.
                self.frame.put_tail(&block);
                self.exchange(Command::ProgramDevice, REPORT_SIZE, false)?;
                if len < PAYLOAD_CAPACITY {
                    self.complete(stats)?;
                }
                self.flushed = len < PAYLOAD_CAPACITY;
            }
            Mode::Verify => {
                self.exchange(Command::GetData, DATA_HEADER_SIZE, true)?;
                let actual = self.frame.tail(len);
                if actual != block.as_slice() {
                    return Err(ProtocolError::VerificationMismatch {
                        address,
                        expected: block,
                        actual: actual.to_vec(),
                    }
                    .into());
                }
            }
        }

        stats.blocks += 1;
        stats.bytes += data.len();
        Ok(())
    }

    /// Commit a buffered full block, if there is one.
    fn flush(&mut self, stats: &mut PassStats) -> Result<(), FlashError> {
        if !self.flushed {
            self.complete(stats)?;
            self.flushed = true;
        }
        Ok(())
    }

    fn complete(&mut self, stats: &mut PassStats) -> Result<(), FlashError> {
        trace!("Completing");
        self.frame.begin(Command::ProgramComplete);
        self.exchange(Command::ProgramComplete, 1, false)?;
        stats.completions += 1;
        Ok(())
    }

    fn exchange(
        &mut self,
        command: Command,
        out_len: usize,
        expect_reply: bool,
    ) -> Result<(), FlashError> {
        self.transport
            .exchange(&mut *self.frame, out_len, expect_reply)
            .map_err(|source| {
                FlashError::from(ProtocolError::Transport {
                    command,
                    address: self.last_address,
                    source,
                })
            })
    }
}

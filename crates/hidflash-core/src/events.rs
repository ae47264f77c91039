//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow a flashing session
//! without tight coupling to the core logic.

use std::fmt;

use crate::device::{DeviceFamily, MemoryRegion};
use crate::engine::Mode;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    /// Opening the device.
    Connecting,
    /// Reading the memory map.
    Querying,
    /// Unlocking configuration memory.
    Unlocking,
    /// Bulk erase in progress.
    Erasing,
    /// Write pass.
    Writing,
    /// Verify pass.
    Verifying,
    /// Sign-flash in progress.
    Signing,
    /// Reset command issued.
    Resetting,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Connecting => write!(f, "Connecting"),
            FlashPhase::Querying => write!(f, "Querying"),
            FlashPhase::Unlocking => write!(f, "Unlocking"),
            FlashPhase::Erasing => write!(f, "Erasing"),
            FlashPhase::Writing => write!(f, "Writing"),
            FlashPhase::Verifying => write!(f, "Verifying"),
            FlashPhase::Signing => write!(f, "Signing"),
            FlashPhase::Resetting => write!(f, "Resetting"),
            FlashPhase::Complete => write!(f, "Complete"),
            FlashPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the flash session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Device opened.
    DeviceConnected { vid: u16, pid: u16 },
    /// Phase changed.
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// Memory map reported by the device.
    MemoryReport {
        family: DeviceFamily,
        granularity: u8,
        regions: Vec<MemoryRegion>,
    },
    /// One write or verify request sent for a clipped block.
    BlockIssued {
        mode: Mode,
        address: u32,
        length: usize,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// USB report sent/received.
    Packet {
        direction: PacketDirection,
        packet_type: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// All operations completed successfully.
    Complete,
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::MemoryReport {
                family,
                granularity,
                regions,
            } => {
                tracing::info!(family = %family, bytes_per_address = granularity, "Device family");
                for region in regions {
                    tracing::info!(
                        kind = %region.kind,
                        address = %format!("0x{:08X}", region.address),
                        length = %format!("0x{:08X}", region.length),
                        "Memory region"
                    );
                }
            }
            FlashEvent::BlockIssued {
                mode,
                address,
                length,
            } => {
                tracing::debug!(mode = %mode, address = %format!("0x{:08X}", address), len = length, "Block");
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Packet {
                direction,
                packet_type,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    type_ = %packet_type,
                    len = length,
                    "USB Packet"
                );
            }
            FlashEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

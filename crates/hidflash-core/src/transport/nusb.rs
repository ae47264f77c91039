//! nusb-based HID transport implementation.
//!
//! The bootloader exposes a single HID interface with one interrupt IN and
//! one interrupt OUT endpoint. Reports are exchanged raw on those endpoints,
//! bypassing the OS HID stack.

use nusb::transfer::{Buffer, In, Interrupt, Out, TransferError};
use nusb::{Interface, MaybeFuture, list_devices};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{OPEN_ATTEMPTS, OPEN_RETRY_DELAY_MS, TRANSFER_TIMEOUT_MS};

const HID_INTERFACE: u8 = 0;

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first device with the given VID/PID.
    ///
    /// A device that was just plugged in (or just reset into the bootloader)
    /// is often not enumerated yet, so a missing device is retried a few
    /// times before giving up.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::try_open(vid, pid) {
                Err(TransportError::DeviceNotFound { .. }) if attempt < OPEN_ATTEMPTS => {
                    debug!(attempt, "Device not present yet, retrying");
                    thread::sleep(Duration::from_millis(OPEN_RETRY_DELAY_MS));
                }
                Ok(t) => {
                    if attempt > 1 {
                        info!(
                            waited_ms = u64::from(attempt - 1) * OPEN_RETRY_DELAY_MS,
                            "Device appeared"
                        );
                    }
                    return Ok(t);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_open(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // The OS HID driver normally owns the interface.
        let interface = device
            .detach_and_claim_interface(HID_INTERFACE)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: HID_INTERFACE,
                message: e.to_string(),
            })?;

        // Find INTERRUPT endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == HID_INTERFACE {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Interrupt {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Interrupt".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Interrupt".into(),
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
        })
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut ep = self
            .interface
            .endpoint::<Interrupt, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);

        ep.transfer_blocking(buf, Duration::from_millis(TRANSFER_TIMEOUT_MS))
            .into_result()
            .map_err(|e| transfer_error(e, TransportError::WriteFailed))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(level = "trace", skip(self), fields(max_len))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut ep = self
            .interface
            .endpoint::<Interrupt, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        // Request length must be a multiple of the max packet size.
        let max_packet_size = ep.max_packet_size();
        let request_len = max_len.max(1).div_ceil(max_packet_size) * max_packet_size;
        let mut buf = Buffer::new(request_len);
        buf.set_requested_len(request_len);

        let data = ep
            .transfer_blocking(buf, Duration::from_millis(TRANSFER_TIMEOUT_MS))
            .into_result()
            .map_err(|e| transfer_error(e, TransportError::ReadFailed))?;

        let n = data.len().min(max_len);
        if n == 0 {
            warn!("Empty report from device");
        }
        debug!(bytes_read = n, "Read complete");
        Ok(data[..n].to_vec())
    }

    fn is_connected(&self) -> bool {
        // nusb doesn't provide a direct "is connected" check.
        true
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

/// Map a failed transfer. A timed-out blocking transfer is cancelled by nusb.
fn transfer_error(e: TransferError, other: fn(String) -> TransportError) -> TransportError {
    match e {
        TransferError::Cancelled => TransportError::Timeout {
            timeout_ms: TRANSFER_TIMEOUT_MS,
        },
        TransferError::Disconnected => TransportError::Disconnected,
        e => other(e.to_string()),
    }
}

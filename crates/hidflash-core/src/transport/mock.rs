//! Mock USB transport for testing.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::*;
use crate::protocol::{Command, Frame};

/// In-memory stand-in for a bootloader's flash.
///
/// Memory is keyed by byte address (device address times granularity);
/// unwritten bytes read back as the erased value 0xFF.
#[derive(Debug, Clone)]
struct EmulatedDevice {
    query_report: [u8; REPORT_SIZE],
    granularity: u32,
    memory: BTreeMap<u32, u8>,
}

impl EmulatedDevice {
    /// Apply one request. Returns the reply report for commands that have one.
    fn handle(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let mut frame = Frame::new();
        frame.load(request);

        match Command::from_code(frame.command_code())? {
            Command::QueryDevice => Some(self.query_report.to_vec()),
            Command::EraseDevice => {
                self.memory.clear();
                None
            }
            Command::ProgramDevice => {
                let base = frame.address().wrapping_mul(self.granularity);
                let len = usize::from(frame.length());
                for (i, &b) in frame.tail(len).iter().enumerate() {
                    self.memory.insert(base.wrapping_add(i as u32), b);
                }
                None
            }
            Command::GetData => {
                let base = frame.address().wrapping_mul(self.granularity);
                let len = usize::from(frame.length());
                let data: Vec<u8> = (0..len)
                    .map(|i| {
                        *self
                            .memory
                            .get(&base.wrapping_add(i as u32))
                            .unwrap_or(&PAD_BYTE)
                    })
                    .collect();
                frame.put_tail(&data);
                Some(frame.as_bytes().to_vec())
            }
            Command::UnlockConfig
            | Command::ProgramComplete
            | Command::ResetDevice
            | Command::SignFlash => None,
        }
    }
}

/// Mock transport for unit testing the engine and session logic.
pub struct MockTransport {
    /// Queued reports to return on read. Take priority over emulator replies.
    reply_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Optional flash emulator answering requests.
    device: Arc<Mutex<Option<EmulatedDevice>>>,
    /// Replies produced by the emulator, waiting to be read.
    device_replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            reply_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            device: Arc::new(Mutex::new(None)),
            device_replies: Arc::new(Mutex::new(VecDeque::new())),
            vid: MICROCHIP_VENDOR_ID,
            pid: HID_BOOTLOADER_PRODUCT_ID,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// A mock backed by an emulated bootloader that answers QueryDevice
    /// with `query_report` and stores programmed bytes.
    pub fn with_device(query_report: [u8; REPORT_SIZE], granularity: u8) -> Self {
        let mock = Self::new();
        *mock.device.lock().unwrap() = Some(EmulatedDevice {
            query_report,
            granularity: u32::from(granularity.max(1)),
            memory: BTreeMap::new(),
        });
        mock
    }

    /// Queue a report to be returned on next read.
    pub fn queue_reply(&self, report: &[u8]) {
        self.reply_queue.lock().unwrap().push_back(report.to_vec());
    }

    /// Emulated flash contents, keyed by byte address.
    pub fn memory(&self) -> BTreeMap<u32, u8> {
        self.device
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.memory.clone())
            .unwrap_or_default()
    }

    /// Preload emulated flash starting at byte address `address`.
    pub fn set_memory(&self, address: u32, data: &[u8]) {
        if let Some(dev) = self.device.lock().unwrap().as_mut() {
            for (i, &b) in data.iter().enumerate() {
                dev.memory.insert(address.wrapping_add(i as u32), b);
            }
        }
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Command codes of all captured writes, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|w| w.first().copied())
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());

        if let Some(dev) = self.device.lock().unwrap().as_mut()
            && let Some(reply) = dev.handle(data)
        {
            self.device_replies.lock().unwrap().push_back(reply);
        }
        Ok(data.len())
    }

    fn read(&self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        // Emulator replies are consumed even when a queued report overrides
        // them, so request and reply stay paired.
        let emulated = self.device_replies.lock().unwrap().pop_front();
        self.reply_queue
            .lock()
            .unwrap()
            .pop_front()
            .or(emulated)
            .ok_or(TransportError::Timeout {
                timeout_ms: TRANSFER_TIMEOUT_MS,
            })
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceFamily, MemoryKind, MemoryRegion, encode_query_response};

    fn emulator() -> MockTransport {
        let report = encode_query_response(
            DeviceFamily::Pic24,
            &[MemoryRegion::new(MemoryKind::Program, 0x0000, 0x1000)],
        );
        MockTransport::with_device(report, 2)
    }

    #[test]
    fn test_mock_reply_queue() {
        let mock = MockTransport::new();
        mock.queue_reply(&[CMD_QUERY_DEVICE; REPORT_SIZE]);
        mock.queue_reply(&[CMD_GET_DATA; REPORT_SIZE]);

        assert_eq!(mock.read(REPORT_SIZE).unwrap()[0], CMD_QUERY_DEVICE);
        assert_eq!(mock.read(REPORT_SIZE).unwrap()[0], CMD_GET_DATA);

        // Queue is empty now
        assert!(matches!(
            mock.read(REPORT_SIZE),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(&[CMD_ERASE_DEVICE]).unwrap();
        mock.write(&[CMD_RESET_DEVICE]).unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], vec![CMD_ERASE_DEVICE]);
        assert_eq!(mock.commands(), vec![CMD_ERASE_DEVICE, CMD_RESET_DEVICE]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(matches!(
            mock.write(&[CMD_QUERY_DEVICE]),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_emulator_program_then_read_back() {
        let mock = emulator();

        let mut frame = Frame::new();
        frame.begin(Command::ProgramDevice);
        frame.set_address(0x10);
        frame.set_length(4);
        frame.put_tail(&[1, 2, 3, 4]);
        mock.exchange(&mut frame, REPORT_SIZE, false).unwrap();

        // Word-addressed: device address 0x10 is byte 0x20.
        let memory = mock.memory();
        assert_eq!(memory.get(&0x20), Some(&1));
        assert_eq!(memory.get(&0x23), Some(&4));

        frame.begin(Command::GetData);
        frame.set_address(0x10);
        frame.set_length(6);
        mock.exchange(&mut frame, DATA_HEADER_SIZE, true).unwrap();
        assert_eq!(frame.tail(6), &[1, 2, 3, 4, 0xFF, 0xFF]);
        assert_eq!(frame.command_code(), CMD_GET_DATA);
    }

    #[test]
    fn test_emulator_erase_clears_memory() {
        let mock = emulator();
        mock.set_memory(0, &[0x12, 0x34]);
        assert_eq!(mock.memory().len(), 2);

        mock.write(&[CMD_ERASE_DEVICE]).unwrap();
        assert!(mock.memory().is_empty());
    }

    #[test]
    fn test_emulator_answers_query() {
        let mock = emulator();
        let mut frame = Frame::new();
        frame.begin(Command::QueryDevice);
        mock.exchange(&mut frame, 1, true).unwrap();
        assert_eq!(frame.as_bytes()[QUERY_FAMILY_OFFSET], FAMILY_PIC24);
    }

    #[test]
    fn test_queued_reply_overrides_emulator() {
        let mock = emulator();
        let mut bogus = [0u8; REPORT_SIZE];
        bogus[0] = CMD_GET_DATA;
        mock.queue_reply(&bogus);

        let mut frame = Frame::new();
        frame.begin(Command::QueryDevice);
        mock.exchange(&mut frame, 1, true).unwrap();
        assert_eq!(frame.command_code(), CMD_GET_DATA);
        // The emulator's own reply was discarded with it.
        assert!(mock.read(REPORT_SIZE).is_err());
    }
}

//! Flash session - high-level orchestrator for one programming run.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::device::{DeviceFamily, DeviceMemoryMap, MemoryKind};
use crate::engine::{Mode, PassStats, ProgramVerifyEngine};
use crate::error::{FlashError, ProtocolError};
use crate::events::{
    FlashEvent, FlashObserver, FlashPhase, LogLevel, PacketDirection, TracingObserver,
};
use crate::hex::HexSource;
use crate::protocol::constants::{
    HID_BOOTLOADER_PRODUCT_ID, MICROCHIP_VENDOR_ID, REPORT_SIZE, SUBCMD_UNLOCK,
};
use crate::protocol::{Command, Frame};
use crate::transport::{NusbTransport, TransportError, UsbTransport};

/// Configuration for a flash session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// USB vendor ID of the bootloader.
    pub vendor_id: u16,
    /// USB product ID of the bootloader.
    pub product_id: u16,
    /// Intel HEX file to write.
    pub hex_path: Option<String>,
    /// Unlock configuration memory before erasing/writing.
    pub unlock: bool,
    /// Erase the device. Implied when a hex file is written.
    pub erase: bool,
    /// Verify after writing.
    pub verify: bool,
    /// Sign flash after writing.
    pub sign: bool,
    /// Reset the device when done.
    pub reset: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: MICROCHIP_VENDOR_ID,
            product_id: HID_BOOTLOADER_PRODUCT_ID,
            hex_path: None,
            unlock: false,
            erase: false,
            verify: true,
            sign: false,
            reset: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Writing always erases first.
    pub fn erase_requested(&self) -> bool {
        self.erase || self.hex_path.is_some()
    }

    /// True when the configuration asks the device to do anything at all.
    pub fn has_work(&self) -> bool {
        self.unlock || self.erase_requested() || self.sign || self.reset
    }
}

/// Result of a program call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgramReport {
    pub write: PassStats,
    pub verify: Option<PassStats>,
}

/// Flash session - owns the device connection and its memory map.
pub struct FlashSession<T: UsbTransport, O: FlashObserver> {
    transport: T,
    observer: Arc<O>,
    map: Option<DeviceMemoryMap>,
    frame: Frame,
    phase: FlashPhase,
}

impl FlashSession<NusbTransport, TracingObserver> {
    /// Open the bootloader with the default tracing observer.
    pub fn open(vid: u16, pid: u16) -> Result<Self, FlashError> {
        Self::open_with_observer(vid, pid, Arc::new(TracingObserver))
    }
}

impl<O: FlashObserver> FlashSession<NusbTransport, O> {
    /// Open the bootloader over USB and report to a custom observer.
    #[instrument(level = "info", skip(observer), fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_observer(vid: u16, pid: u16, observer: Arc<O>) -> Result<Self, FlashError> {
        let transport = NusbTransport::open(vid, pid)?;
        Ok(Self::with_transport(transport, observer))
    }
}

impl<T: UsbTransport, O: FlashObserver> FlashSession<T, O> {
    /// Wrap an already open transport.
    pub fn with_transport(transport: T, observer: Arc<O>) -> Self {
        observer.on_event(&FlashEvent::DeviceConnected {
            vid: transport.vendor_id(),
            pid: transport.product_id(),
        });
        Self {
            transport,
            observer,
            map: None,
            frame: Frame::new(),
            phase: FlashPhase::Connecting,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The memory map from the last successful query.
    pub fn memory_map(&self) -> Option<&DeviceMemoryMap> {
        self.map.as_ref()
    }

    /// Bytes per device address, once the device has been queried.
    pub fn granularity(&self) -> Option<u8> {
        self.map.as_ref().map(DeviceMemoryMap::granularity)
    }

    /// Override the family-derived address granularity.
    pub fn set_granularity(&mut self, granularity: u8) {
        if let Some(map) = self.map.as_mut() {
            map.set_granularity(granularity);
        }
    }

    fn set_phase(&mut self, to: FlashPhase) {
        if self.phase != to {
            self.observer.on_event(&FlashEvent::PhaseChanged {
                from: self.phase,
                to,
            });
            self.phase = to;
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        self.observer.on_event(&FlashEvent::Log { level, message });
    }

    /// Send the current frame through the observed transport.
    fn send(
        &mut self,
        command: Command,
        out_len: usize,
        expect_reply: bool,
    ) -> Result<(), TransportError> {
        let transport = ObservableTransport {
            inner: &self.transport,
            observer: self.observer.as_ref(),
        };
        self.frame.begin(command);
        if command == Command::UnlockConfig {
            self.frame.set_byte(1, SUBCMD_UNLOCK);
        }
        transport.exchange(&mut self.frame, out_len, expect_reply)
    }

    fn command(
        &mut self,
        command: Command,
        out_len: usize,
        expect_reply: bool,
    ) -> Result<(), FlashError> {
        self.send(command, out_len, expect_reply).map_err(|source| {
            FlashError::from(ProtocolError::Transport {
                command,
                address: 0,
                source,
            })
        })
    }

    /// Ask the device for its memory layout and replace the current map.
    #[instrument(level = "debug", skip(self))]
    pub fn query_device(&mut self) -> Result<&DeviceMemoryMap, FlashError> {
        let map = self.read_memory_map()?;
        Ok(self.map.insert(map))
    }

    fn read_memory_map(&mut self) -> Result<DeviceMemoryMap, FlashError> {
        self.set_phase(FlashPhase::Querying);
        self.command(Command::QueryDevice, 1, true)?;
        let map = DeviceMemoryMap::from_response(self.frame.as_bytes())?;

        if let DeviceFamily::Unknown(code) = map.family() {
            self.log(
                LogLevel::Warn,
                format!("Unknown device family 0x{:02X}, assuming byte addressing", code),
            );
        }
        self.observer.on_event(&FlashEvent::MemoryReport {
            family: map.family(),
            granularity: map.granularity(),
            regions: map.regions().to_vec(),
        });

        Ok(map)
    }

    /// Unlock configuration memory, then re-read the map.
    ///
    /// Some bootloaders only report their configuration region once
    /// unlocked.
    #[instrument(level = "debug", skip(self))]
    pub fn unlock_config(&mut self) -> Result<(), FlashError> {
        self.set_phase(FlashPhase::Unlocking);
        self.command(Command::UnlockConfig, 2, false)?;
        if !self.query_device()?.has_kind(MemoryKind::ConfigWords) {
            self.log(
                LogLevel::Warn,
                "No configuration memory found after unlocking".to_string(),
            );
        }
        Ok(())
    }

    /// Keep the map from ever selecting configuration memory.
    pub fn disable_config_memory(&mut self) -> usize {
        let disabled = self
            .map
            .as_mut()
            .map(DeviceMemoryMap::disable_config_words)
            .unwrap_or(0);
        if disabled > 0 {
            info!(regions = disabled, "Configuration memory locked, skipping it");
        }
        disabled
    }

    /// Bulk erase. Returns once the device answers the follow-up query.
    #[instrument(level = "debug", skip(self))]
    pub fn erase(&mut self) -> Result<(), FlashError> {
        self.set_phase(FlashPhase::Erasing);
        self.command(Command::EraseDevice, 1, false)?;
        // The bootloader does not answer queries until the erase is done.
        self.command(Command::QueryDevice, 1, true)
    }

    /// Write `source` and optionally verify it. Queries the device first if
    /// no map is known yet.
    #[instrument(level = "info", skip(self, source), fields(path = %source.path().display()))]
    pub fn program(&mut self, source: &HexSource, verify: bool) -> Result<ProgramReport, FlashError> {
        let map = match self.map.take() {
            Some(map) => map,
            None => self.read_memory_map()?,
        };
        let report = self.program_with_map(&map, source, verify);
        self.map = Some(map);
        report
    }

    fn program_with_map(
        &mut self,
        map: &DeviceMemoryMap,
        source: &HexSource,
        verify: bool,
    ) -> Result<ProgramReport, FlashError> {
        self.set_phase(FlashPhase::Writing);
        let write = self.pass(map, Mode::Write, source)?;

        let verify = if verify {
            self.set_phase(FlashPhase::Verifying);
            Some(self.pass(map, Mode::Verify, source)?)
        } else {
            None
        };

        Ok(ProgramReport { write, verify })
    }

    fn pass(
        &mut self,
        map: &DeviceMemoryMap,
        mode: Mode,
        source: &HexSource,
    ) -> Result<PassStats, FlashError> {
        let transport = ObservableTransport {
            inner: &self.transport,
            observer: self.observer.as_ref(),
        };
        ProgramVerifyEngine::new(&transport, map, self.observer.as_ref(), &mut self.frame)
            .run(mode, source.segments())
    }

    /// Sign the flash image and wait for the device to finish.
    #[instrument(level = "debug", skip(self))]
    pub fn sign_flash(&mut self) -> Result<(), FlashError> {
        self.set_phase(FlashPhase::Signing);
        self.send(Command::SignFlash, 1, false)
            .and_then(|()| self.send(Command::QueryDevice, 1, true))
            .map_err(|source| ProtocolError::SignFlashFailed { source }.into())
    }

    /// Reset the device into its application.
    #[instrument(level = "debug", skip(self))]
    pub fn reset(&mut self) -> Result<(), FlashError> {
        self.set_phase(FlashPhase::Resetting);
        self.command(Command::ResetDevice, 1, false)
    }

    /// Run every step `config` asks for, in fixed order.
    #[instrument(skip(self, config))]
    pub fn run(&mut self, config: &SessionConfig) -> Result<(), FlashError> {
        let result = self.run_steps(config);
        match &result {
            Ok(()) => {
                self.set_phase(FlashPhase::Complete);
                self.observer.on_event(&FlashEvent::Complete);
            }
            Err(_) => self.set_phase(FlashPhase::Error),
        }
        result
    }

    fn run_steps(&mut self, config: &SessionConfig) -> Result<(), FlashError> {
        self.query_device()?;

        if config.unlock {
            self.unlock_config()?;
        } else {
            self.disable_config_memory();
        }

        // Open the file before erasing so a bad path does not cost the
        // device its contents.
        let source = config
            .hex_path
            .as_ref()
            .map(HexSource::open)
            .transpose()?;

        if config.erase_requested() {
            self.erase()?;
        }

        if let Some(source) = source {
            let report = self.program(&source, config.verify)?;
            info!(
                blocks = report.write.blocks,
                bytes = report.write.bytes,
                verified = report.verify.is_some(),
                "Programming complete"
            );
        }

        if config.sign {
            self.sign_flash()?;
        }

        if config.reset {
            self.reset()?;
        }

        Ok(())
    }
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<'a, T: UsbTransport, O: FlashObserver> {
    inner: &'a T,
    observer: &'a O,
}

impl<T: UsbTransport, O: FlashObserver> UsbTransport for ObservableTransport<'_, T, O> {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            let packet_type = data
                .first()
                .and_then(|&code| Command::from_code(code))
                .map(|c| c.to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            self.observer.on_event(&FlashEvent::Packet {
                direction: PacketDirection::Tx,
                packet_type,
                length: data.len(),
                data: Some(data.iter().take(REPORT_SIZE).cloned().collect()),
            });
        }
        res
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read(max_len);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.observer.on_event(&FlashEvent::Packet {
                direction: PacketDirection::Rx,
                packet_type: "Reply".to_string(),
                length: data.len(),
                data: Some(data.clone()),
            });
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryRegion, encode_query_response};
    use crate::events::NullObserver;
    use crate::hex::{HexRecord, RecordKind};
    use crate::protocol::constants::*;
    use crate::transport::MockTransport;
    use std::sync::Mutex;

    const PROGRAM_BASE: u32 = 0x0000;
    const CONFIG_BASE: u32 = 0x30_0000;

    fn regions(with_config: bool) -> Vec<MemoryRegion> {
        let mut regions = vec![MemoryRegion::new(MemoryKind::Program, PROGRAM_BASE, 0x8000)];
        if with_config {
            regions.push(MemoryRegion::new(MemoryKind::ConfigWords, CONFIG_BASE, 0x10));
        }
        regions
    }

    fn device(with_config: bool) -> MockTransport {
        MockTransport::with_device(
            encode_query_response(DeviceFamily::Pic18, &regions(with_config)),
            1,
        )
    }

    fn session(mock: MockTransport) -> FlashSession<MockTransport, NullObserver> {
        FlashSession::with_transport(mock, Arc::new(NullObserver))
    }

    /// Hex file with 4 program bytes at 0 and 2 config bytes.
    fn hex_source() -> HexSource {
        let lines = [
            HexRecord::new(RecordKind::Data, 0x0000, vec![0xDE, 0xAD, 0xBE, 0xEF]).encode(),
            HexRecord::new(RecordKind::ExtendedLinearAddress, 0, vec![0x00, 0x30]).encode(),
            HexRecord::new(RecordKind::Data, 0x0000, vec![0x12, 0x34]).encode(),
            ":00000001FF".to_string(),
        ];
        HexSource::from_bytes("test.hex", lines.join("\r\n").into_bytes())
    }

    #[test]
    fn test_full_run_follows_fixed_order() {
        let mut session = session(device(true));
        let source = hex_source();

        // Flags are applied in precedence order whatever their origin.
        session.query_device().unwrap();
        session.unlock_config().unwrap();
        session.erase().unwrap();
        session.program(&source, true).unwrap();
        session.sign_flash().unwrap();
        session.reset().unwrap();

        assert_eq!(
            session.transport().commands(),
            vec![
                CMD_QUERY_DEVICE,
                CMD_UNLOCK_CONFIG,
                CMD_QUERY_DEVICE,
                CMD_ERASE_DEVICE,
                CMD_QUERY_DEVICE,
                CMD_PROGRAM_DEVICE,
                CMD_PROGRAM_COMPLETE,
                CMD_PROGRAM_DEVICE,
                CMD_PROGRAM_COMPLETE,
                CMD_GET_DATA,
                CMD_GET_DATA,
                CMD_SIGN_FLASH,
                CMD_QUERY_DEVICE,
                CMD_RESET_DEVICE,
            ]
        );

        let writes = session.transport().get_writes();
        assert_eq!(writes[1], vec![CMD_UNLOCK_CONFIG, SUBCMD_UNLOCK]);
        assert_eq!(session.transport().memory().get(&CONFIG_BASE), Some(&0x12));
    }

    #[test]
    fn test_program_queries_map_when_none_known() {
        let mut session = session(device(false));
        assert!(session.memory_map().is_none());

        let report = session.program(&hex_source(), true).unwrap();

        let commands = session.transport().commands();
        assert_eq!(commands[0], CMD_QUERY_DEVICE);
        assert_eq!(commands[1], CMD_PROGRAM_DEVICE);
        assert_eq!(report.write.blocks, 1);
        assert_eq!(report.verify.map(|v| v.blocks), Some(1));
        assert_eq!(session.transport().memory().get(&0), Some(&0xDE));
        assert!(session.memory_map().is_some());
    }

    #[test]
    fn test_run_with_config_matches_manual_steps() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tmp = temp_dir.path().join("app.hex");
        std::fs::write(&tmp, hex_source().as_bytes()).unwrap();

        let mut session = session(device(true));
        let config = SessionConfig {
            hex_path: Some(tmp.to_string_lossy().into_owned()),
            unlock: true,
            sign: true,
            reset: true,
            ..Default::default()
        };
        session.run(&config).unwrap();

        let commands = session.transport().commands();
        assert_eq!(commands.first(), Some(&CMD_QUERY_DEVICE));
        assert_eq!(commands[1], CMD_UNLOCK_CONFIG);
        assert_eq!(commands[3], CMD_ERASE_DEVICE);
        assert_eq!(commands.last(), Some(&CMD_RESET_DEVICE));
        assert_eq!(session.transport().memory().get(&0), Some(&0xDE));
    }

    #[test]
    fn test_locked_config_is_not_written() {
        let mut session = session(device(true));
        session.query_device().unwrap();
        assert_eq!(session.disable_config_memory(), 1);
        session.program(&hex_source(), true).unwrap();

        let memory = session.transport().memory();
        assert_eq!(memory.get(&0), Some(&0xDE));
        assert!(!memory.contains_key(&CONFIG_BASE));
        assert!(!session.memory_map().unwrap().has_kind(MemoryKind::ConfigWords));
    }

    #[test]
    fn test_unlock_requeries_map() {
        let mock = device(true);
        // First answer hides the config region, as a locked bootloader does.
        mock.queue_reply(&encode_query_response(DeviceFamily::Pic18, &regions(false)));
        let mut session = session(mock);

        session.query_device().unwrap();
        assert!(!session.memory_map().unwrap().has_kind(MemoryKind::ConfigWords));

        session.unlock_config().unwrap();
        assert!(session.memory_map().unwrap().has_kind(MemoryKind::ConfigWords));
    }

    #[test]
    fn test_missing_hex_file_fails_before_erase() {
        let mut session = session(device(false));
        let config = SessionConfig {
            hex_path: Some("/nonexistent/firmware.hex".to_string()),
            ..Default::default()
        };
        let err = session.run(&config).unwrap_err();
        assert_eq!(err.exit_code(), 9);
        assert!(!session.transport().commands().contains(&CMD_ERASE_DEVICE));
    }

    #[test]
    fn test_sign_failure_is_reported() {
        // No emulator: the query after SignFlash never gets an answer.
        let mock = MockTransport::new();
        let mut session = session(mock);
        match session.sign_flash() {
            Err(FlashError::Protocol(ProtocolError::SignFlashFailed {
                source: TransportError::Timeout { .. },
            })) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.transport().commands(), vec![CMD_SIGN_FLASH, CMD_QUERY_DEVICE]);
    }

    #[test]
    fn test_bad_query_response() {
        let mock = MockTransport::new();
        let mut report = encode_query_response(DeviceFamily::Pic18, &regions(false));
        report[QUERY_PAYLOAD_SIZE_OFFSET] = 64;
        mock.queue_reply(&report);

        let mut session = session(mock);
        let err = session.query_device().unwrap_err();
        assert_eq!(err.exit_code(), 23);
    }

    #[test]
    fn test_granularity_accessors() {
        let mut session = session(device(false));
        assert_eq!(session.granularity(), None);
        session.query_device().unwrap();
        assert_eq!(session.granularity(), Some(1));
        session.set_granularity(2);
        assert_eq!(session.granularity(), Some(2));
    }

    #[test]
    fn test_observer_sees_phases_and_packets() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<FlashEvent>>);
        impl FlashObserver for Recorder {
            fn on_event(&self, event: &FlashEvent) {
                self.0.lock().unwrap().push(event.clone());
            }
        }

        let recorder = Arc::new(Recorder::default());
        let mut session = FlashSession::with_transport(device(false), recorder.clone());
        session.query_device().unwrap();
        session.erase().unwrap();
        session.program(&hex_source(), false).unwrap();

        let events = recorder.0.lock().unwrap();
        assert!(matches!(events[0], FlashEvent::DeviceConnected { .. }));
        assert!(events.iter().any(|e| matches!(
            e,
            FlashEvent::PhaseChanged {
                from: FlashPhase::Erasing,
                to: FlashPhase::Writing
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            FlashEvent::Packet {
                direction: PacketDirection::Tx,
                packet_type,
                ..
            } if packet_type == "PROGRAM_DEVICE"
        )));
        let blocks = events
            .iter()
            .filter(|e| matches!(e, FlashEvent::BlockIssued { .. }))
            .count();
        assert_eq!(blocks, 1);
    }

    #[test]
    fn test_config_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("hidflash.toml");
        let config = SessionConfig {
            vendor_id: 0x1234,
            hex_path: Some("app.hex".to_string()),
            verify: false,
            reset: true,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();

        assert_eq!(loaded.vendor_id, 0x1234);
        assert_eq!(loaded.product_id, HID_BOOTLOADER_PRODUCT_ID);
        assert_eq!(loaded.hex_path.as_deref(), Some("app.hex"));
        assert!(!loaded.verify);
        assert!(loaded.reset);
        assert!(loaded.erase_requested());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig = toml::from_str("reset = true\n").unwrap();
        assert_eq!(config.vendor_id, MICROCHIP_VENDOR_ID);
        assert!(config.verify);
        assert!(config.reset);
        assert!(!config.erase_requested());
        assert!(config.has_work());
    }
}

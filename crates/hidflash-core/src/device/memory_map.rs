//! Device memory map decoded from the QueryDevice response.
//!
//! Response layout (64 bytes):
//!
//! ```text
//! [0]       command echo (QUERY_DEVICE)
//! [1]       payload size per packet (must be 56)
//! [2]       device family
//! [3..57]   up to 6 x { kind: u8, address: u32 LE, length: u32 LE }
//!           a kind of 0xFF ends the list early
//! [57]      region count (filled by the host)
//! [58..64]  unused
//! ```

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use thiserror::Error;

use crate::protocol::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Device response has unexpected command 0x{actual:02X} (expected 0x{expected:02X})")]
    WrongCommand { expected: u8, actual: u8 },
    #[error("Device reports unexpected packet data field size {actual} (expected {expected})")]
    UnexpectedPacketSize { expected: usize, actual: u8 },
    #[error("Device response too short: {actual} bytes, expected {expected}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("Memory region {index} has bad type 0")]
    BadRegionKind { index: usize },
    #[error("Memory region {index} has zero length")]
    BadRegionLength { index: usize },
    #[error("Memory region {index} length {length} is not a multiple of {granularity}")]
    MisalignedRegionLength {
        index: usize,
        length: u32,
        granularity: u8,
    },
    #[error("Memory region type {kind} is defined more than once")]
    DuplicateRegionKind { kind: MemoryKind },
    #[error("Memory regions {first} and {second} overlap")]
    OverlappingRegions { first: usize, second: usize },
    #[error("Device has no program memory region")]
    NoProgramMemory,
}

/// Memory region type as reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Not programmable in this session.
    Disabled,
    Program,
    Eeprom,
    ConfigWords,
    UserId,
    Unknown(u8),
}

impl MemoryKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            REGION_DISABLED => MemoryKind::Disabled,
            REGION_PROGRAM => MemoryKind::Program,
            REGION_EEPROM => MemoryKind::Eeprom,
            REGION_CONFIG_WORDS => MemoryKind::ConfigWords,
            REGION_USER_ID => MemoryKind::UserId,
            other => MemoryKind::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            MemoryKind::Disabled => REGION_DISABLED,
            MemoryKind::Program => REGION_PROGRAM,
            MemoryKind::Eeprom => REGION_EEPROM,
            MemoryKind::ConfigWords => REGION_CONFIG_WORDS,
            MemoryKind::UserId => REGION_USER_ID,
            MemoryKind::Unknown(code) => code,
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Disabled => write!(f, "Disabled"),
            MemoryKind::Program => write!(f, "Program"),
            MemoryKind::Eeprom => write!(f, "EEPROM"),
            MemoryKind::ConfigWords => write!(f, "Config"),
            MemoryKind::UserId => write!(f, "User ID"),
            MemoryKind::Unknown(code) => write!(f, "Unknown (type id {})", code),
        }
    }
}

/// Device family; decides how many flash bytes one device address covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Pic18,
    Pic24,
    Pic32,
    Pic16,
    Unknown(u8),
}

impl DeviceFamily {
    pub fn from_code(code: u8) -> Self {
        match code {
            FAMILY_PIC18 => DeviceFamily::Pic18,
            FAMILY_PIC24 => DeviceFamily::Pic24,
            FAMILY_PIC32 => DeviceFamily::Pic32,
            FAMILY_PIC16 => DeviceFamily::Pic16,
            other => DeviceFamily::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DeviceFamily::Pic18 => FAMILY_PIC18,
            DeviceFamily::Pic24 => FAMILY_PIC24,
            DeviceFamily::Pic32 => FAMILY_PIC32,
            DeviceFamily::Pic16 => FAMILY_PIC16,
            DeviceFamily::Unknown(code) => code,
        }
    }

    /// Bytes of flash per device address unit.
    pub fn bytes_per_address(self) -> u8 {
        match self {
            DeviceFamily::Pic24 | DeviceFamily::Pic16 => 2,
            DeviceFamily::Pic18 | DeviceFamily::Pic32 | DeviceFamily::Unknown(_) => 1,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Pic18 => write!(f, "PIC18 (or PIC16)"),
            DeviceFamily::Pic24 => write!(f, "PIC24 or dsPIC33"),
            DeviceFamily::Pic32 => write!(f, "PIC32"),
            DeviceFamily::Pic16 => write!(f, "PIC16"),
            DeviceFamily::Unknown(code) => write!(f, "Unknown (0x{:02X})", code),
        }
    }
}

/// One programmable memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: MemoryKind,
    pub address: u32,
    pub length: u32,
}

impl MemoryRegion {
    pub fn new(kind: MemoryKind, address: u32, length: u32) -> Self {
        Self {
            kind,
            address,
            length,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != MemoryKind::Disabled
    }

    /// Exclusive end in device address units.
    fn unit_end(&self, granularity: u8) -> u64 {
        u64::from(self.address) + u64::from(self.length / u32::from(granularity.max(1)))
    }
}

/// Validated set of regions reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMemoryMap {
    family: DeviceFamily,
    granularity: u8,
    regions: Vec<MemoryRegion>,
}

impl DeviceMemoryMap {
    /// Build and validate a map from explicit regions.
    pub fn new(family: DeviceFamily, regions: Vec<MemoryRegion>) -> Result<Self, QueryError> {
        let map = Self {
            family,
            granularity: family.bytes_per_address(),
            regions,
        };
        map.validate()?;
        Ok(map)
    }

    /// Decode and validate a QueryDevice response report.
    pub fn from_response(report: &[u8]) -> Result<Self, QueryError> {
        if report.len() < REPORT_SIZE {
            return Err(QueryError::ShortResponse {
                expected: REPORT_SIZE,
                actual: report.len(),
            });
        }
        if report[0] != CMD_QUERY_DEVICE {
            return Err(QueryError::WrongCommand {
                expected: CMD_QUERY_DEVICE,
                actual: report[0],
            });
        }
        if usize::from(report[QUERY_PAYLOAD_SIZE_OFFSET]) != PAYLOAD_CAPACITY {
            return Err(QueryError::UnexpectedPacketSize {
                expected: PAYLOAD_CAPACITY,
                actual: report[QUERY_PAYLOAD_SIZE_OFFSET],
            });
        }

        let family = DeviceFamily::from_code(report[QUERY_FAMILY_OFFSET]);

        let regions = report[QUERY_REGIONS_OFFSET..]
            .chunks_exact(QUERY_REGION_SIZE)
            .take(MAX_MEMORY_REGIONS)
            .take_while(|d| d[0] != REGION_END_OF_LIST)
            .map(|d| MemoryRegion {
                kind: MemoryKind::from_code(d[0]),
                address: LittleEndian::read_u32(&d[1..5]),
                length: LittleEndian::read_u32(&d[5..9]),
            })
            .collect();

        Self::new(family, regions)
    }

    /// Check the region list for consistency.
    pub fn validate(&self) -> Result<(), QueryError> {
        let granularity = self.granularity;

        for (i, region) in self.regions.iter().enumerate() {
            // Type 0 is never reported by a bootloader; it is how the host
            // marks a region as disabled.
            if region.kind == MemoryKind::Disabled {
                return Err(QueryError::BadRegionKind { index: i });
            }
            if region.length == 0 {
                return Err(QueryError::BadRegionLength { index: i });
            }
            if granularity > 1 && region.length % u32::from(granularity) != 0 {
                return Err(QueryError::MisalignedRegionLength {
                    index: i,
                    length: region.length,
                    granularity,
                });
            }

            for (j, other) in self.regions[..i].iter().enumerate() {
                if region.kind == other.kind {
                    return Err(QueryError::DuplicateRegionKind { kind: region.kind });
                }
                let overlaps = u64::from(region.address) < other.unit_end(granularity)
                    && u64::from(other.address) < region.unit_end(granularity);
                if overlaps {
                    return Err(QueryError::OverlappingRegions {
                        first: j,
                        second: i,
                    });
                }
            }
        }

        if !self.has_kind(MemoryKind::Program) {
            return Err(QueryError::NoProgramMemory);
        }
        Ok(())
    }

    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    /// Bytes of flash per device address unit.
    pub fn granularity(&self) -> u8 {
        self.granularity
    }

    pub fn set_granularity(&mut self, granularity: u8) {
        self.granularity = granularity.max(1);
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn enabled_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(|r| r.is_enabled())
    }

    pub fn has_kind(&self, kind: MemoryKind) -> bool {
        self.regions.iter().any(|r| r.kind == kind)
    }

    /// Mark every ConfigWords region as disabled so nothing is written there.
    /// Returns the number of regions disabled.
    pub fn disable_config_words(&mut self) -> usize {
        let mut disabled = 0;
        for region in &mut self.regions {
            if region.kind == MemoryKind::ConfigWords {
                region.kind = MemoryKind::Disabled;
                disabled += 1;
            }
        }
        disabled
    }
}

/// Encode a QueryDevice response, as a bootloader would send it.
pub fn encode_query_response(family: DeviceFamily, regions: &[MemoryRegion]) -> [u8; REPORT_SIZE] {
    let mut report = [0u8; REPORT_SIZE];
    report[0] = CMD_QUERY_DEVICE;
    report[QUERY_PAYLOAD_SIZE_OFFSET] = PAYLOAD_CAPACITY as u8;
    report[QUERY_FAMILY_OFFSET] = family.code();

    let mut pos = QUERY_REGIONS_OFFSET;
    for region in regions.iter().take(MAX_MEMORY_REGIONS) {
        report[pos] = region.kind.code();
        LittleEndian::write_u32(&mut report[pos + 1..pos + 5], region.address);
        LittleEndian::write_u32(&mut report[pos + 5..pos + 9], region.length);
        pos += QUERY_REGION_SIZE;
    }
    if regions.len() < MAX_MEMORY_REGIONS {
        report[pos] = REGION_END_OF_LIST;
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(address: u32, length: u32) -> MemoryRegion {
        MemoryRegion::new(MemoryKind::Program, address, length)
    }

    #[test]
    fn test_decode_pic32_response() {
        let regions = [
            program(0x1D00_0000, 0x0007_F000),
            MemoryRegion::new(MemoryKind::ConfigWords, 0x1FC0_2FF0, 0x10),
        ];
        let report = encode_query_response(DeviceFamily::Pic32, &regions);
        let map = DeviceMemoryMap::from_response(&report).unwrap();

        assert_eq!(map.family(), DeviceFamily::Pic32);
        assert_eq!(map.granularity(), 1);
        assert_eq!(map.regions(), &regions);
    }

    #[test]
    fn test_byte_order_is_little_endian() {
        let report = encode_query_response(DeviceFamily::Pic18, &[program(0x0000_1000, 0x7000)]);
        assert_eq!(&report[4..8], &[0x00, 0x10, 0x00, 0x00]);
        assert_eq!(&report[8..12], &[0x00, 0x70, 0x00, 0x00]);
        assert_eq!(report[12], REGION_END_OF_LIST);
    }

    #[test]
    fn test_family_granularity() {
        assert_eq!(DeviceFamily::from_code(0x01).bytes_per_address(), 1);
        assert_eq!(DeviceFamily::from_code(0x02).bytes_per_address(), 2);
        assert_eq!(DeviceFamily::from_code(0x03).bytes_per_address(), 1);
        assert_eq!(DeviceFamily::from_code(0x04).bytes_per_address(), 2);
        assert_eq!(DeviceFamily::from_code(0x7E).bytes_per_address(), 1);
    }

    #[test]
    fn test_wrong_command_echo() {
        let mut report = encode_query_response(DeviceFamily::Pic18, &[program(0, 0x100)]);
        report[0] = CMD_GET_DATA;
        assert_eq!(
            DeviceMemoryMap::from_response(&report),
            Err(QueryError::WrongCommand {
                expected: CMD_QUERY_DEVICE,
                actual: CMD_GET_DATA
            })
        );
    }

    #[test]
    fn test_unexpected_packet_size() {
        let mut report = encode_query_response(DeviceFamily::Pic18, &[program(0, 0x100)]);
        report[1] = 58;
        assert!(matches!(
            DeviceMemoryMap::from_response(&report),
            Err(QueryError::UnexpectedPacketSize { actual: 58, .. })
        ));
    }

    #[test]
    fn test_short_response() {
        assert!(matches!(
            DeviceMemoryMap::from_response(&[CMD_QUERY_DEVICE, 56]),
            Err(QueryError::ShortResponse { actual: 2, .. })
        ));
    }

    #[test]
    fn test_zero_kind_rejected() {
        let mut report = encode_query_response(DeviceFamily::Pic18, &[program(0, 0x100)]);
        report[3] = REGION_DISABLED;
        assert_eq!(
            DeviceMemoryMap::from_response(&report),
            Err(QueryError::BadRegionKind { index: 0 })
        );
    }

    #[test]
    fn test_zero_length_rejected() {
        let result = DeviceMemoryMap::new(DeviceFamily::Pic18, vec![program(0, 0)]);
        assert_eq!(result, Err(QueryError::BadRegionLength { index: 0 }));
    }

    #[test]
    fn test_misaligned_length_rejected() {
        let result = DeviceMemoryMap::new(DeviceFamily::Pic24, vec![program(0x400, 0x101)]);
        assert!(matches!(
            result,
            Err(QueryError::MisalignedRegionLength {
                index: 0,
                length: 0x101,
                granularity: 2
            })
        ));
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let result = DeviceMemoryMap::new(
            DeviceFamily::Pic18,
            vec![program(0, 0x100), program(0x1000, 0x100)],
        );
        assert_eq!(
            result,
            Err(QueryError::DuplicateRegionKind {
                kind: MemoryKind::Program
            })
        );
    }

    #[test]
    fn test_overlap_rejected() {
        let result = DeviceMemoryMap::new(
            DeviceFamily::Pic18,
            vec![
                program(0x100, 0x100),
                MemoryRegion::new(MemoryKind::Eeprom, 0x1F0, 0x20),
            ],
        );
        assert_eq!(
            result,
            Err(QueryError::OverlappingRegions {
                first: 0,
                second: 1
            })
        );
    }

    #[test]
    fn test_overlap_uses_address_units() {
        // 0x200 bytes at 2 bytes per address end at unit 0x100 + 0x100.
        let ok = DeviceMemoryMap::new(
            DeviceFamily::Pic24,
            vec![
                program(0x100, 0x200),
                MemoryRegion::new(MemoryKind::ConfigWords, 0x200, 0x10),
            ],
        );
        assert!(ok.is_ok());

        let clash = DeviceMemoryMap::new(
            DeviceFamily::Pic24,
            vec![
                program(0x100, 0x202),
                MemoryRegion::new(MemoryKind::ConfigWords, 0x200, 0x10),
            ],
        );
        assert!(matches!(clash, Err(QueryError::OverlappingRegions { .. })));
    }

    #[test]
    fn test_adjacent_regions_accepted() {
        let map = DeviceMemoryMap::new(
            DeviceFamily::Pic18,
            vec![
                program(0x0, 0x100),
                MemoryRegion::new(MemoryKind::Eeprom, 0x100, 0x100),
            ],
        );
        assert!(map.is_ok());
    }

    #[test]
    fn test_no_program_memory() {
        let report = encode_query_response(
            DeviceFamily::Pic18,
            &[MemoryRegion::new(MemoryKind::Eeprom, 0xF0_0000, 0x100)],
        );
        assert_eq!(
            DeviceMemoryMap::from_response(&report),
            Err(QueryError::NoProgramMemory)
        );
    }

    #[test]
    fn test_unknown_kind_is_kept() {
        let map = DeviceMemoryMap::new(
            DeviceFamily::Pic32,
            vec![
                program(0x1D00_0000, 0x1000),
                MemoryRegion::new(MemoryKind::Unknown(0x20), 0x1E00_0000, 0x40),
            ],
        )
        .unwrap();
        assert_eq!(map.enabled_regions().count(), 2);
    }

    #[test]
    fn test_six_regions_without_terminator() {
        let regions: Vec<_> = [
            MemoryKind::Program,
            MemoryKind::Eeprom,
            MemoryKind::ConfigWords,
            MemoryKind::UserId,
            MemoryKind::Unknown(5),
            MemoryKind::Unknown(6),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, kind)| MemoryRegion::new(kind, (i as u32) * 0x1000, 0x100))
        .collect();
        let report = encode_query_response(DeviceFamily::Pic18, &regions);
        let map = DeviceMemoryMap::from_response(&report).unwrap();
        assert_eq!(map.regions().len(), MAX_MEMORY_REGIONS);
    }

    #[test]
    fn test_disable_config_words() {
        let mut map = DeviceMemoryMap::new(
            DeviceFamily::Pic32,
            vec![
                program(0x1D00_0000, 0x1000),
                MemoryRegion::new(MemoryKind::ConfigWords, 0x1FC0_2FF0, 0x10),
            ],
        )
        .unwrap();

        assert_eq!(map.disable_config_words(), 1);
        assert_eq!(map.regions()[1].kind, MemoryKind::Disabled);
        assert_eq!(map.enabled_regions().count(), 1);
        assert!(!map.has_kind(MemoryKind::ConfigWords));
    }
}

//! Protocol constants for the Microchip USB HID bootloader.
//!
//! Values follow Microchip's HID bootloader firmware sources.

// ============================================================================
// Device Identification
// ============================================================================

/// Microchip Technology vendor ID.
pub const MICROCHIP_VENDOR_ID: u16 = 0x04D8;

/// Product ID used by the stock HID bootloader.
pub const HID_BOOTLOADER_PRODUCT_ID: u16 = 0x003C;

/// Attempts made to find a freshly attached device before giving up.
pub const OPEN_ATTEMPTS: u32 = 6;

/// Delay between open attempts.
pub const OPEN_RETRY_DELAY_MS: u64 = 100;

/// Timeout applied to every interrupt transfer.
pub const TRANSFER_TIMEOUT_MS: u64 = 5000;

// ============================================================================
// Frame Layout
// ============================================================================

/// Every HID report exchanged with the bootloader is 64 bytes.
pub const REPORT_SIZE: usize = 64;

/// Data bytes carried by one ProgramDevice / GetData packet.
pub const PAYLOAD_CAPACITY: usize = 56;

/// Offset of the 32-bit address field.
pub const ADDRESS_OFFSET: usize = 1;

/// Offset of the payload length field.
pub const LENGTH_OFFSET: usize = 5;

/// Size of the ProgramDevice / GetData request header.
pub const DATA_HEADER_SIZE: usize = 6;

/// Pad byte used to make odd-length payloads even (erased flash value).
pub const PAD_BYTE: u8 = 0xFF;

// ============================================================================
// Commands (Host -> Device)
// ============================================================================

pub const CMD_QUERY_DEVICE: u8 = 0x02;
pub const CMD_UNLOCK_CONFIG: u8 = 0x03;
pub const CMD_ERASE_DEVICE: u8 = 0x04;
pub const CMD_PROGRAM_DEVICE: u8 = 0x05;
pub const CMD_PROGRAM_COMPLETE: u8 = 0x06;
pub const CMD_GET_DATA: u8 = 0x07;
pub const CMD_RESET_DEVICE: u8 = 0x08;
pub const CMD_SIGN_FLASH: u8 = 0x09;

/// UnlockConfig sub-command: unlock configuration memory.
pub const SUBCMD_UNLOCK: u8 = 0x00;

// ============================================================================
// QueryDevice Response
// ============================================================================

/// Offset of the reported payload size.
pub const QUERY_PAYLOAD_SIZE_OFFSET: usize = 1;

/// Offset of the device family code.
pub const QUERY_FAMILY_OFFSET: usize = 2;

/// Offset of the first memory region descriptor.
pub const QUERY_REGIONS_OFFSET: usize = 3;

/// Each descriptor: kind (1) + address (4) + length (4).
pub const QUERY_REGION_SIZE: usize = 9;

/// Maximum number of region descriptors in one response.
pub const MAX_MEMORY_REGIONS: usize = 6;

/// Region kind marking the end of the descriptor list.
pub const REGION_END_OF_LIST: u8 = 0xFF;

pub const REGION_DISABLED: u8 = 0x00;
pub const REGION_PROGRAM: u8 = 0x01;
pub const REGION_EEPROM: u8 = 0x02;
pub const REGION_CONFIG_WORDS: u8 = 0x03;
pub const REGION_USER_ID: u8 = 0x04;

// ============================================================================
// Device Families
// ============================================================================

pub const FAMILY_PIC18: u8 = 0x01;
pub const FAMILY_PIC24: u8 = 0x02;
pub const FAMILY_PIC32: u8 = 0x03;
pub const FAMILY_PIC16: u8 = 0x04;

//! Protocol constants for the RP2040/RP2350 PICOBOOT interface.
//!
//! Derived from the bootrom's `boot/picoboot.h` and the UF2 and binary info
//! layouts emitted by the Pico SDK.

// ============================================================================
// Device Identification
// ============================================================================

/// Raspberry Pi Vendor ID
pub const RPI_VENDOR_ID: u16 = 0x2E8A;

/// RP2040 in BOOTSEL mode
pub const RP2040_BOOT_PID: u16 = 0x0003;
/// RP2350 in BOOTSEL mode
pub const RP2350_BOOT_PID: u16 = 0x000F;

/// All product ids that designate "device in bootloader mode"
pub const SUPPORTED_PIDS: &[u16] = &[RP2040_BOOT_PID, RP2350_BOOT_PID];

/// Vendor-specific interface class carrying the PICOBOOT endpoints
pub const PICOBOOT_INTERFACE_CLASS: u8 = 0xFF;

// ============================================================================
// Command Frame
// ============================================================================

pub const PICOBOOT_MAGIC: u32 = 0x431F_D10B;

/// Size of a command frame on the wire.
pub const COMMAND_SIZE: usize = 32;
/// Maximum argument block length.
pub const MAX_ARGS_SIZE: usize = 16;

/// Set in the command id when the data phase is device-to-host.
pub const CMD_DIR_IN: u8 = 0x80;

pub const CMD_EXCLUSIVE_ACCESS: u8 = 0x01;
pub const CMD_REBOOT: u8 = 0x02;
pub const CMD_FLASH_ERASE: u8 = 0x03;
pub const CMD_READ: u8 = 0x04 | CMD_DIR_IN;
pub const CMD_WRITE: u8 = 0x05;
pub const CMD_EXIT_XIP: u8 = 0x06;
/// RP2350 only.
pub const CMD_REBOOT2: u8 = 0x0A;

/// Exclusive access argument values.
pub const EXCLUSIVE_NOT: u8 = 0;
pub const EXCLUSIVE: u8 = 1;
pub const EXCLUSIVE_AND_EJECT: u8 = 2;

// ============================================================================
// Control Requests
// ============================================================================

/// Vendor OUT: reset the PICOBOOT interface state (clears a stalled command).
pub const PICOBOOT_IF_RESET: u8 = 0x41;
/// Vendor IN: report last command status (16 bytes).
pub const PICOBOOT_IF_CMD_STATUS: u8 = 0x42;
pub const CMD_STATUS_SIZE: usize = 16;

// ============================================================================
// Memory Layout
// ============================================================================

pub const FLASH_START: u32 = 0x1000_0000;
/// Second-stage bootloader at the start of flash, never metadata.
pub const BOOT2_SIZE: u32 = 0x100;

/// Flash program granularity.
pub const PAGE_SIZE: u32 = 0x100;
/// Flash erase granularity.
pub const SECTOR_SIZE: u32 = 0x1000;

/// Initial stack pointer used when rebooting an RP2040 (end of SRAM).
pub const RP2040_STACK_POINTER: u32 = 0x2004_2000;

/// REBOOT2 flags: boot normally from flash.
pub const REBOOT2_TYPE_NORMAL: u32 = 0x0;

// ============================================================================
// UF2 Container
// ============================================================================

pub const UF2_MAGIC_START0: u32 = 0x0A32_4655;
pub const UF2_MAGIC_START1: u32 = 0x9E5D_5157;
pub const UF2_MAGIC_END: u32 = 0x0AB1_6F30;

pub const UF2_BLOCK_SIZE: usize = 512;
pub const UF2_HEADER_SIZE: usize = 32;
pub const UF2_DATA_SIZE: usize = 476;
pub const UF2_MAGIC_END_OFFSET: usize = UF2_BLOCK_SIZE - 4;

pub const UF2_FLAG_NOT_MAIN_FLASH: u32 = 0x0000_0001;
pub const UF2_FLAG_FILE_CONTAINER: u32 = 0x0000_1000;
pub const UF2_FLAG_FAMILY_ID_PRESENT: u32 = 0x0000_2000;

pub const RP2040_FAMILY_ID: u32 = 0xE48B_FF56;
pub const ABSOLUTE_FAMILY_ID: u32 = 0xE48B_FF57;
pub const RP2350_ARM_S_FAMILY_ID: u32 = 0xE48B_FF59;
pub const RP2350_RISCV_FAMILY_ID: u32 = 0xE48B_FF5A;
pub const RP2350_ARM_NS_FAMILY_ID: u32 = 0xE48B_FF5B;

/// Family ids this tool accepts.
pub const KNOWN_FAMILY_IDS: &[u32] = &[
    RP2040_FAMILY_ID,
    ABSOLUTE_FAMILY_ID,
    RP2350_ARM_S_FAMILY_ID,
    RP2350_RISCV_FAMILY_ID,
    RP2350_ARM_NS_FAMILY_ID,
];

// ============================================================================
// Binary Info
// ============================================================================

pub const BINARY_INFO_MARKER_START: u32 = 0x7188_EBF2;
pub const BINARY_INFO_MARKER_END: u32 = 0xE71A_A390;

/// Number of words searched for the binary info header.
pub const BINARY_INFO_SCAN_WORDS: u32 = 64;
pub const MAX_REMAP_ENTRIES: usize = 10;
pub const MAX_BINARY_INFO_ENTRIES: u32 = 1000;
pub const MAX_STRING_LEN: usize = 512;

pub const BINARY_INFO_TYPE_ID_AND_STRING: u16 = 6;
/// `BINARY_INFO_MAKE_TAG('R', 'P')`
pub const BINARY_INFO_TAG_RASPBERRY_PI: u16 = 0x5052;

pub const BINARY_INFO_ID_PROGRAM_NAME: u32 = 0x0203_1C86;
pub const BINARY_INFO_ID_PROGRAM_VERSION_STRING: u32 = 0x11A9_BC3A;
pub const BINARY_INFO_ID_PROGRAM_FEATURE: u32 = 0xA1F4_B453;
pub const BINARY_INFO_ID_SDK_VERSION: u32 = 0x5360_B3AB;
pub const BINARY_INFO_ID_PICO_BOARD: u32 = 0xB63C_FFBB;

//! Protocol constants for the Signet device command API.
//!
//! Derived from the signetdev host library headers.

use std::time::Duration;

// ============================================================================
// Block Storage
// ============================================================================

/// Size of one addressable storage block in bytes.
pub const BLOCK_SIZE: usize = 2048;

/// Highest addressable block id. Backups cover `0..=MAX_BLOCK_ID`.
pub const MAX_BLOCK_ID: u16 = 126;

/// Largest encoded entry the device accepts in a single update.
pub const MAX_ENTRY_DATA_SIZE: usize = 1536;

// ============================================================================
// Flash Layout (firmware update)
// ============================================================================

/// Address of flash page 0.
pub const FLASH_BASE_ADDRESS: u32 = 0x0800_0000;

/// Size of one erasable flash page.
pub const FLASH_PAGE_SIZE: u32 = 2048;

/// Pages with an index at or above this value are never erased.
pub const FLASH_ERASABLE_PAGES: i64 = 511;

/// Maximum payload of a single `write_flash` command.
pub const FLASH_WRITE_CHUNK_SIZE: usize = 1024;

// ============================================================================
// Timing
// ============================================================================

/// Delay before re-trying to open the device connection.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Delay between `reset_device` and reopening the connection.
pub const RESET_SETTLE_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Raw Result Codes (device -> host)
// ============================================================================

pub const RESP_OKAY: i32 = 0;
pub const RESP_BAD_PASSWORD: i32 = 2;
pub const RESP_BUTTON_PRESS_CANCELED: i32 = 3;
pub const RESP_BUTTON_PRESS_TIMEOUT: i32 = 4;
pub const RESP_NOT_ENOUGH_SPACE: i32 = 7;
pub const RESP_INVALID_STATE: i32 = 8;

/// Host-side pseudo codes reported by the transport layer.
pub const RESP_ERROR_DISCONNECT: i32 = -1;
pub const RESP_ERROR_QUIT: i32 = -2;

// ============================================================================
// Device Modes (startup response)
// ============================================================================

pub const MODE_LOGGED_OUT: u8 = 2;
pub const MODE_UNINITIALIZED: u8 = 3;

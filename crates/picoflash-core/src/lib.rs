//! picoflash-core: PICOBOOT flashing client for RP2040/RP2350 in Rust.
//!
//! This crate programs the flash of a Raspberry Pi microcontroller held in
//! BOOTSEL mode, using the vendor USB interface exposed by its boot ROM and
//! firmware packaged as UF2.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, command frames, command status
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Channel**: Command/data/ack exchange with stall recovery
//! - **Image**: UF2 parsing and encoding
//! - **Memory / Binary Info**: Address-indexed reads and build identity
//! - **Planner**: Sector erase ranges and page writes
//! - **State / Events**: Session phases and the observer pattern for UIs
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use picoflash_core::events::TracingObserver;
//! use picoflash_core::session::{FlashSession, SessionConfig};
//!
//! let image = std::fs::read("blink.uf2").expect("read image");
//! let mut session = FlashSession::connect_usb(SessionConfig::default(), Arc::new(TracingObserver))
//!     .expect("no device");
//! let report = session.flash_bytes(&image).expect("flash failed");
//! println!("wrote {} bytes", report.bytes_written);
//! ```

pub mod binary_info;
pub mod channel;
pub mod events;
pub mod image;
pub mod memory;
pub mod planner;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use binary_info::{Identity, extract_identity};
pub use channel::{ChannelError, PicobootClient};
pub use events::{ChannelObserver, FlashEvent, FlashObserver, FlashPhase, LogLevel, TracingObserver};
pub use image::{ImageError, ParsedImage, TransferBlock, parse as parse_image};
pub use memory::{DeviceMemory, MemoryMap, MemorySource};
pub use planner::{EraseRange, WriteChunk, plan_erase, plan_write};
pub use protocol::{CommandStatus, StatusCode};
pub use session::{CancelToken, FlashReport, FlashSession, SessionConfig, SessionError};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};

//! Flash session - high-level orchestrator for one connection.
//!
//! A session owns the protocol client for a connected device and drives the
//! phase sequence of a flash:
//!
//! 1. **Parsing**: validate the image, plan erases and writes.
//! 2. **Preparing**: acquire exclusive access, leave XIP mode.
//! 3. **Erasing** and **Writing**: one exchange per range or page.
//! 4. **Rebooting**: start the new firmware (optional).
//!
//! Any failure moves the session to `Error` and releases exclusive access on
//! a best-effort basis. Nothing is rolled back; the remedy is to flash again.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::binary_info::{self, DEFAULT_PRODUCT_TOKENS, Identity};
use crate::channel::{ChannelError, DEFAULT_MAX_ATTEMPTS, PicobootClient};
use crate::events::{FlashEvent, FlashObserver, FlashPhase, LogLevel, TracingObserver};
use crate::image::{self, ImageError, ParsedImage};
use crate::memory::{DeviceMemory, MemoryMap};
use crate::planner::{EraseRange, erase_len, plan_erase, plan_write};
use crate::protocol::constants::*;
use crate::protocol::{CommandStatus, ExclusiveMode};
use crate::state::{FlashStateMachine, InvalidTransition};
use crate::transport::nusb::DEFAULT_TIMEOUT_MS;
use crate::transport::{Direction, NusbTransport, TransportError, UsbTransport};

/// Configuration for a flash session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Attempts per command exchange, including the first.
    pub max_attempts: u32,
    /// Per-transfer timeout in milliseconds.
    pub timeout_ms: u64,
    /// Reboot into the new firmware after writing.
    pub reboot: bool,
    pub reboot_delay_ms: u32,
    pub reboot_stack_pointer: u32,
    /// Read back every page after programming it.
    pub verify: bool,
    /// Size of the flash window read when identifying device firmware.
    pub flash_size: u32,
    /// Board-name fragments that mark firmware as belonging to this product.
    pub product_tokens: Vec<String>,
    /// Seconds to wait for a device to appear. Zero fails immediately.
    pub wait_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            reboot: true,
            reboot_delay_ms: 500,
            reboot_stack_pointer: RP2040_STACK_POINTER,
            verify: false,
            flash_size: 16 * 1024 * 1024,
            product_tokens: DEFAULT_PRODUCT_TOKENS.iter().map(|s| s.to_string()).collect(),
            wait_timeout_secs: 0,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Cooperative cancellation flag, checked between exchanges.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Cannot start: session is {0}")]
    Busy(FlashPhase),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("Image contains no main-flash data")]
    EmptyImage,

    #[error("{phase} failed at 0x{addr:08X}: {source}")]
    Device {
        phase: FlashPhase,
        addr: u32,
        #[source]
        source: ChannelError,
    },

    #[error("{phase} failed: {source}")]
    Command {
        phase: FlashPhase,
        #[source]
        source: ChannelError,
    },

    #[error("Verify failed at 0x{addr:08X}: {mismatches} bytes differ")]
    VerifyMismatch { addr: u32, mismatches: usize },

    #[error("Cancelled during {phase}")]
    Cancelled { phase: FlashPhase },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// True when the device dropped off the bus.
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Device { source, .. } | SessionError::Command { source, .. } => {
                source.is_disconnect()
            }
            SessionError::Transport(TransportError::Disconnected) => true,
            _ => false,
        }
    }
}

/// Summary of a completed flash.
#[derive(Debug, Clone)]
pub struct FlashReport {
    /// Identity of the image that was written.
    pub identity: Identity,
    pub erase_ranges: Vec<EraseRange>,
    pub bytes_erased: u64,
    pub bytes_written: u64,
    pub pages_written: usize,
    pub verified: bool,
    pub rebooted: bool,
}

/// Flash session - one per connection.
pub struct FlashSession<T: UsbTransport, O: FlashObserver = TracingObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    client: PicobootClient<ObservableTransport<T, O>>,
    state: FlashStateMachine,
    cancel: CancelToken,
    exclusive_held: bool,
}

impl<T: UsbTransport> FlashSession<T, TracingObserver> {
    /// Create a session with the default tracing observer.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self::connect(transport, config, Arc::new(TracingObserver))
    }
}

impl<O: FlashObserver> FlashSession<NusbTransport, O> {
    /// Open the first BOOTSEL device on the bus, waiting for one to appear if
    /// the config allows.
    pub fn connect_usb(config: SessionConfig, observer: Arc<O>) -> Result<Self, SessionError> {
        let transport = wait_for_device(&config)?;
        Ok(Self::connect(transport, config, observer))
    }
}

fn wait_for_device(config: &SessionConfig) -> Result<NusbTransport, TransportError> {
    let timeout = Duration::from_secs(config.wait_timeout_secs);
    let start = Instant::now();
    let mut poll_count = 0u64;

    loop {
        poll_count += 1;
        match NusbTransport::open_with_timeout(config.timeout_ms) {
            Ok(t) => {
                info!(
                    vid = format!("{:04X}", t.vendor_id()),
                    pid = format!("{:04X}", t.product_id()),
                    "Device found after {} polls",
                    poll_count
                );
                return Ok(t);
            }
            Err(TransportError::DeviceNotFound { .. }) if start.elapsed() < timeout => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e),
        }
    }
}

impl<T: UsbTransport, O: FlashObserver> FlashSession<T, O> {
    /// Start a session on an opened transport.
    pub fn connect(transport: T, config: SessionConfig, observer: Arc<O>) -> Self {
        observer.on_event(&FlashEvent::DeviceConnected {
            vid: transport.vendor_id(),
            pid: transport.product_id(),
        });
        let transport = ObservableTransport {
            inner: transport,
            observer: observer.clone(),
        };
        Self {
            client: PicobootClient::with_max_attempts(transport, config.max_attempts),
            config,
            observer,
            state: FlashStateMachine::new(),
            cancel: CancelToken::new(),
            exclusive_held: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> FlashPhase {
        self.state.phase()
    }

    pub fn transport(&self) -> &T {
        &self.client.transport().inner
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Handle for cancelling the running flash from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// End the session and release the device.
    pub fn disconnect(mut self) {
        if self.exclusive_held && self.client.is_connected() {
            self.release_exclusive();
        }
        self.emit(FlashEvent::DeviceDisconnected);
    }

    /// Parse a UF2 file and flash it.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn flash_bytes(&mut self, data: &[u8]) -> Result<FlashReport, SessionError> {
        self.begin()?;
        let image = match image::parse(data) {
            Ok(image) => image,
            Err(e) => return Err(self.fail(e.into())),
        };
        self.run(&image)
    }

    /// Flash an already parsed image.
    #[instrument(skip(self, image), fields(blocks = image.blocks.len()))]
    pub fn flash(&mut self, image: &ParsedImage) -> Result<FlashReport, SessionError> {
        self.begin()?;
        self.run(image)
    }

    /// Identify the firmware currently in the device's flash.
    pub fn read_identity(&mut self) -> Result<Identity, SessionError> {
        self.ensure_idle()?;
        self.client
            .exit_xip()
            .map_err(|source| SessionError::Command {
                phase: self.state.phase(),
                source,
            })?;
        let memory = DeviceMemory::new(&mut self.client, self.config.flash_size);
        let identity = binary_info::identify(&memory, &self.config.product_tokens);
        debug!(pages = memory.pages_read(), "Read device identity");
        Ok(identity)
    }

    /// Reboot into the application in flash. The device leaves the bus.
    ///
    /// RP2350 devices boot normally via REBOOT2; the configured stack
    /// pointer applies to RP2040 only.
    pub fn reboot(&mut self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.client.reboot(
            0,
            self.config.reboot_stack_pointer,
            self.config.reboot_delay_ms,
        );
        self.exclusive_held = false;
        Ok(())
    }

    /// Status of the last command the device executed.
    pub fn command_status(&mut self) -> Result<CommandStatus, SessionError> {
        let phase = self.state.phase();
        self.client
            .command_status()
            .map_err(|source| SessionError::Command { phase, source })
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.state.is_busy() {
            return Err(SessionError::Busy(self.state.phase()));
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.cancel.reset();
        self.transition(FlashPhase::Parsing)
    }

    fn run(&mut self, image: &ParsedImage) -> Result<FlashReport, SessionError> {
        match self.execute(image) {
            Ok(report) => Ok(report),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn execute(&mut self, image: &ParsedImage) -> Result<FlashReport, SessionError> {
        // Parsing
        if image.blocks.is_empty() {
            return Err(SessionError::EmptyImage);
        }
        let identity = binary_info::identify(
            &MemoryMap::from_blocks(&image.blocks),
            &self.config.product_tokens,
        );
        let ranges = plan_erase(&image.blocks);
        let chunks = plan_write(&image.blocks);
        let records = image.records.len() as u64;
        self.progress(
            FlashPhase::Parsing,
            records,
            records,
            format!(
                "{} records, {} erase ranges, {} pages",
                records,
                ranges.len(),
                chunks.len()
            ),
        );
        if !identity.recognized_as_target {
            self.log(
                LogLevel::Warn,
                "Image does not identify as firmware for this product",
            );
        }
        self.check_cancelled()?;

        // Preparing
        self.transition(FlashPhase::Preparing)?;
        self.client
            .exclusive_access(ExclusiveMode::Exclusive)
            .map_err(|source| SessionError::Command {
                phase: FlashPhase::Preparing,
                source,
            })?;
        self.exclusive_held = true;
        self.client
            .exit_xip()
            .map_err(|source| SessionError::Command {
                phase: FlashPhase::Preparing,
                source,
            })?;
        self.check_cancelled()?;

        // Erasing
        self.transition(FlashPhase::Erasing)?;
        let erase_total = erase_len(&ranges);
        let mut erased = 0u64;
        self.progress(FlashPhase::Erasing, 0, erase_total, "Erasing".to_string());
        for range in &ranges {
            self.check_cancelled()?;
            self.client
                .flash_erase(range.start, range.len)
                .map_err(|source| SessionError::Device {
                    phase: FlashPhase::Erasing,
                    addr: range.start,
                    source,
                })?;
            erased += range.len as u64;
            self.progress(
                FlashPhase::Erasing,
                erased,
                erase_total,
                format!("Erased {}", range),
            );
        }

        // Writing
        self.transition(FlashPhase::Writing)?;
        let write_total: u64 = chunks.iter().map(|c| c.data.len() as u64).sum();
        let mut written = 0u64;
        self.progress(FlashPhase::Writing, 0, write_total, "Writing".to_string());
        for chunk in &chunks {
            self.check_cancelled()?;
            let (page, data) = chunk.padded_page();
            self.client
                .flash_write(page, &data)
                .map_err(|source| SessionError::Device {
                    phase: FlashPhase::Writing,
                    addr: page,
                    source,
                })?;
            if self.config.verify {
                self.verify_chunk(chunk.address, &chunk.data)?;
            }
            written += chunk.data.len() as u64;
            self.progress(
                FlashPhase::Writing,
                written,
                write_total,
                format!("Wrote 0x{:08X}", chunk.address),
            );
        }

        // Rebooting
        let rebooted = self.config.reboot;
        if rebooted {
            self.transition(FlashPhase::Rebooting)?;
            self.client.reboot(
                0,
                self.config.reboot_stack_pointer,
                self.config.reboot_delay_ms,
            );
            self.exclusive_held = false;
        } else {
            self.release_exclusive();
        }

        self.transition(FlashPhase::Done)?;
        self.emit(FlashEvent::Complete);
        info!(
            erased = erase_total,
            written = write_total,
            rebooted,
            "Flash complete"
        );

        Ok(FlashReport {
            identity,
            bytes_erased: erase_total,
            erase_ranges: ranges,
            bytes_written: write_total,
            pages_written: chunks.len(),
            verified: self.config.verify,
            rebooted,
        })
    }

    fn verify_chunk(&mut self, addr: u32, expected: &[u8]) -> Result<(), SessionError> {
        let actual = self
            .client
            .flash_read(addr, expected.len() as u32)
            .map_err(|source| SessionError::Device {
                phase: FlashPhase::Writing,
                addr,
                source,
            })?;
        let mismatches = actual
            .iter()
            .zip(expected)
            .filter(|(a, e)| a != e)
            .count();
        if mismatches > 0 {
            return Err(SessionError::VerifyMismatch { addr, mismatches });
        }
        Ok(())
    }

    /// Move to `Error`, report, and release exclusive access if still held.
    fn fail(&mut self, err: SessionError) -> SessionError {
        let phase = self.state.phase();
        if let Ok(from) = self.state.goto_state(FlashPhase::Error) {
            self.emit(FlashEvent::PhaseChanged {
                from,
                to: FlashPhase::Error,
            });
        }
        self.emit(FlashEvent::Error {
            phase,
            message: err.to_string(),
        });

        if err.is_disconnect() || !self.client.is_connected() {
            self.exclusive_held = false;
            self.emit(FlashEvent::DeviceDisconnected);
        } else if self.exclusive_held {
            self.release_exclusive();
        }
        err
    }

    /// Best effort; a failure is logged and otherwise ignored.
    fn release_exclusive(&mut self) {
        if let Err(e) = self.client.exclusive_access(ExclusiveMode::Release) {
            warn!(error = %e, "Failed to release exclusive access");
        }
        self.exclusive_held = false;
    }

    fn check_cancelled(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled {
                phase: self.state.phase(),
            });
        }
        Ok(())
    }

    fn transition(&mut self, to: FlashPhase) -> Result<(), SessionError> {
        let from = self.state.goto_state(to)?;
        self.emit(FlashEvent::PhaseChanged { from, to });
        Ok(())
    }

    fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(FlashEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn progress(&self, phase: FlashPhase, current: u64, total: u64, message: String) {
        self.emit(FlashEvent::Progress {
            phase,
            current,
            total,
            message,
        });
    }
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<T: UsbTransport, O: FlashObserver> {
    inner: T,
    observer: Arc<O>,
}

impl<T: UsbTransport, O: FlashObserver> ObservableTransport<T, O> {
    fn packet(&self, direction: Direction, data: &[u8]) {
        self.observer.on_event(&FlashEvent::Packet {
            direction,
            length: data.len(),
            head: data.iter().take(COMMAND_SIZE).copied().collect(),
        });
    }
}

impl<T: UsbTransport, O: FlashObserver> UsbTransport for ObservableTransport<T, O> {
    fn bulk_out(&self, data: &[u8]) -> Result<usize, TransportError> {
        let res = self.inner.bulk_out(data);
        if res.is_ok() {
            self.packet(Direction::Out, data);
        }
        res
    }

    fn bulk_in(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.bulk_in(len);
        if let Ok(data) = &res {
            self.packet(Direction::In, data);
        }
        res
    }

    fn control_out(&self, request: u8) -> Result<(), TransportError> {
        self.inner.control_out(request)
    }

    fn control_in(&self, request: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        self.inner.control_in(request, len)
    }

    fn clear_halt(&self, direction: Direction) -> Result<(), TransportError> {
        self.inner.clear_halt(direction)
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

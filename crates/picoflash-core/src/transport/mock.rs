//! Mock USB transport for testing.
//!
//! Behaves like a minimal PICOBOOT device: it decodes command frames,
//! serves READ data phases from a sparse memory image, stores WRITE data,
//! and acknowledges in the direction the protocol expects. Faults (stalls,
//! timeouts, disconnects) are scripted per command-frame ordinal.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use super::traits::{Direction, TransportError, UsbTransport};
use crate::protocol::constants::*;
use crate::protocol::{Command, CommandFrame};

/// Where the simulated device is within one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a command frame.
    Command,
    /// Expecting `len` bytes of host data for `addr`.
    DataOut { addr: u32, len: u32 },
    /// Serving `len` bytes from `addr`.
    DataIn { addr: u32, len: u32 },
    /// Device will send the ack (zero-length IN).
    AckIn,
    /// Host must send the ack (zero-length OUT).
    AckOut,
}

#[derive(Debug)]
struct MockDevice {
    phase: Phase,
    /// Every bulk OUT payload, including stalled attempts.
    writes: Vec<Vec<u8>>,
    /// Frames the device accepted.
    frames: Vec<CommandFrame>,
    /// Number of frame writes attempted so far.
    frame_attempts: usize,
    stall_on: HashSet<usize>,
    timeout_on: HashSet<usize>,
    drop_on_command: Option<u8>,
    control_requests: Vec<u8>,
    halt_clears: Vec<Direction>,
    status_responses: VecDeque<Vec<u8>>,
    memory: BTreeMap<u32, u8>,
    /// Bytes that read back with a fixed value whatever was programmed.
    stuck: BTreeMap<u32, u8>,
    connected: bool,
}

/// Mock transport for unit testing channel and session logic.
#[derive(Clone)]
pub struct MockTransport {
    device: Arc<Mutex<MockDevice>>,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            device: Arc::new(Mutex::new(MockDevice {
                phase: Phase::Command,
                writes: Vec::new(),
                frames: Vec::new(),
                frame_attempts: 0,
                stall_on: HashSet::new(),
                timeout_on: HashSet::new(),
                drop_on_command: None,
                control_requests: Vec::new(),
                halt_clears: Vec::new(),
                status_responses: VecDeque::new(),
                memory: BTreeMap::new(),
                stuck: BTreeMap::new(),
                connected: true,
            })),
            pid: RP2040_BOOT_PID,
        }
    }

    /// Stall the command-frame writes with these zero-based attempt ordinals.
    pub fn stall_on_frames(&self, ordinals: &[usize]) {
        self.device.lock().unwrap().stall_on.extend(ordinals);
    }

    /// Time out the command-frame writes with these attempt ordinals.
    pub fn timeout_on_frames(&self, ordinals: &[usize]) {
        self.device.lock().unwrap().timeout_on.extend(ordinals);
    }

    /// Drop off the bus as soon as a frame with this command id is accepted.
    pub fn disconnect_on_command(&self, id: u8) {
        self.device.lock().unwrap().drop_on_command = Some(id);
    }

    /// Preload device memory.
    pub fn load_memory(&self, addr: u32, data: &[u8]) {
        let mut dev = self.device.lock().unwrap();
        for (i, &b) in data.iter().enumerate() {
            dev.memory.insert(addr + i as u32, b);
        }
    }

    /// Make one flash byte read back as `value` regardless of programming.
    pub fn stick_byte(&self, addr: u32, value: u8) {
        self.device.lock().unwrap().stuck.insert(addr, value);
    }

    /// Read back device memory; unwritten bytes read as erased (0xFF).
    pub fn memory(&self, addr: u32, len: usize) -> Vec<u8> {
        let dev = self.device.lock().unwrap();
        dev.read_memory(addr, len as u32)
    }

    /// Queue a raw response for the command status request.
    pub fn queue_status(&self, raw: &[u8]) {
        self.device
            .lock()
            .unwrap()
            .status_responses
            .push_back(raw.to_vec());
    }

    /// Frames accepted by the device, in order.
    pub fn frames(&self) -> Vec<CommandFrame> {
        self.device.lock().unwrap().frames.clone()
    }

    /// Total frame writes attempted, including stalled ones.
    pub fn frame_attempts(&self) -> usize {
        self.device.lock().unwrap().frame_attempts
    }

    /// Get all captured bulk OUT writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.device.lock().unwrap().writes.clone()
    }

    pub fn control_requests(&self) -> Vec<u8> {
        self.device.lock().unwrap().control_requests.clone()
    }

    pub fn halt_clears(&self) -> Vec<Direction> {
        self.device.lock().unwrap().halt_clears.clone()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.device.lock().unwrap().connected = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.device.lock().unwrap().connected = true;
    }

    /// Present as a different BOOTSEL product, e.g. an RP2350.
    pub fn with_product_id(mut self, pid: u16) -> Self {
        self.pid = pid;
        self
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    fn read_memory(&self, addr: u32, len: u32) -> Vec<u8> {
        (0..len)
            .map(|i| addr + i)
            .map(|a| {
                self.stuck
                    .get(&a)
                    .or_else(|| self.memory.get(&a))
                    .copied()
                    .unwrap_or(0xFF)
            })
            .collect()
    }

    /// Programming only clears bits, as on NOR flash.
    fn program(&mut self, addr: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            let cell = self.memory.entry(addr + i as u32).or_insert(0xFF);
            *cell &= b;
        }
    }

    fn accept_frame(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let ordinal = self.frame_attempts;
        self.frame_attempts += 1;

        if self.stall_on.contains(&ordinal) {
            return Err(TransportError::Stall {
                direction: Direction::Out,
            });
        }
        if self.timeout_on.contains(&ordinal) {
            return Err(TransportError::Timeout { timeout_ms: 5000 });
        }

        let frame = CommandFrame::from_bytes(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.frames.push(frame);

        if self.drop_on_command == Some(frame.command.id) {
            self.connected = false;
            return Ok(data.len());
        }

        self.apply(&frame.command);
        Ok(data.len())
    }

    fn apply(&mut self, cmd: &Command) {
        let addr = cmd.arg_u32(0);
        let len = cmd.transfer_length;
        self.phase = match cmd.id {
            CMD_FLASH_ERASE => {
                let size = cmd.arg_u32(1);
                let end = addr.saturating_add(size);
                let keys: Vec<u32> = self.memory.range(addr..end).map(|(k, _)| *k).collect();
                for k in keys {
                    self.memory.remove(&k);
                }
                Phase::AckIn
            }
            _ if len == 0 => Phase::AckIn,
            _ if cmd.is_device_to_host() => Phase::DataIn { addr, len },
            _ => Phase::DataOut { addr, len },
        };
    }
}

impl UsbTransport for MockTransport {
    fn bulk_out(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut dev = self.device.lock().unwrap();
        if !dev.connected {
            return Err(TransportError::Disconnected);
        }
        dev.writes.push(data.to_vec());

        match dev.phase {
            Phase::Command => dev.accept_frame(data),
            Phase::DataOut { addr, len } => {
                let n = data.len().min(len as usize);
                dev.program(addr, &data[..n]);
                dev.phase = Phase::AckIn;
                Ok(data.len())
            }
            Phase::AckOut if data.is_empty() => {
                dev.phase = Phase::Command;
                Ok(0)
            }
            _ => Err(TransportError::Stall {
                direction: Direction::Out,
            }),
        }
    }

    fn bulk_in(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut dev = self.device.lock().unwrap();
        if !dev.connected {
            return Err(TransportError::Disconnected);
        }

        match dev.phase {
            Phase::DataIn { addr, len } => {
                let n = len.min(max_len as u32);
                let data = dev.read_memory(addr, n);
                dev.phase = Phase::AckOut;
                Ok(data)
            }
            Phase::AckIn => {
                dev.phase = Phase::Command;
                Ok(Vec::new())
            }
            _ => Err(TransportError::Stall {
                direction: Direction::In,
            }),
        }
    }

    fn control_out(&self, request: u8) -> Result<(), TransportError> {
        let mut dev = self.device.lock().unwrap();
        if !dev.connected {
            return Err(TransportError::Disconnected);
        }
        dev.control_requests.push(request);
        if request == PICOBOOT_IF_RESET {
            dev.phase = Phase::Command;
        }
        Ok(())
    }

    fn control_in(&self, request: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut dev = self.device.lock().unwrap();
        if !dev.connected {
            return Err(TransportError::Disconnected);
        }
        dev.control_requests.push(request);
        let mut raw = dev
            .status_responses
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms: 5000 })?;
        raw.truncate(len);
        Ok(raw)
    }

    fn clear_halt(&self, direction: Direction) -> Result<(), TransportError> {
        let mut dev = self.device.lock().unwrap();
        if !dev.connected {
            return Err(TransportError::Disconnected);
        }
        dev.halt_clears.push(direction);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.device.lock().unwrap().connected
    }

    fn vendor_id(&self) -> u16 {
        RPI_VENDOR_ID
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

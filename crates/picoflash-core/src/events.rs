//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI follow a flash session without coupling to the core
//! logic. Observers are called synchronously from the session's thread.

use std::fmt;
use std::sync::mpsc::Sender;

use crate::transport::Direction;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Flash session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashPhase {
    /// Connected, nothing in progress.
    Idle,
    /// Validating the image and planning the transfer.
    Parsing,
    /// Acquiring exclusive access and leaving XIP mode.
    Preparing,
    Erasing,
    Writing,
    /// Reboot requested; the device leaves the bus.
    Rebooting,
    Done,
    Error,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Idle => write!(f, "Idle"),
            FlashPhase::Parsing => write!(f, "Parsing"),
            FlashPhase::Preparing => write!(f, "Preparing"),
            FlashPhase::Erasing => write!(f, "Erasing"),
            FlashPhase::Writing => write!(f, "Writing"),
            FlashPhase::Rebooting => write!(f, "Rebooting"),
            FlashPhase::Done => write!(f, "Done"),
            FlashPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the flash session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    DeviceConnected { vid: u16, pid: u16 },
    /// The device dropped off the bus; the session is no longer usable.
    DeviceDisconnected,
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// Progress within a phase. `current` never decreases within a phase.
    Progress {
        phase: FlashPhase,
        current: u64,
        total: u64,
        message: String,
    },
    Log { level: LogLevel, message: String },
    Error { phase: FlashPhase, message: String },
    /// Bulk packet sent or received.
    Packet {
        direction: Direction,
        length: usize,
        /// First bytes of the packet.
        head: Vec<u8>,
    },
    /// The flash completed successfully.
    Complete,
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { vid, pid } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    "Device connected"
                );
            }
            FlashEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::Progress {
                phase,
                current,
                total,
                message,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    100
                };
                tracing::debug!(phase = %phase, progress = %format!("{}%", pct), "{}", message);
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Error { phase, message } => {
                tracing::error!(phase = %phase, "Error: {}", message);
            }
            FlashEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "USB packet");
            }
            FlashEvent::Complete => {
                tracing::info!("Flash complete");
            }
        }
    }
}

/// Observer that forwards events over a channel, for sessions run on a
/// worker thread.
///
/// Send failures (receiver dropped) are ignored.
pub struct ChannelObserver {
    sender: Sender<FlashEvent>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<FlashEvent>) -> Self {
        Self { sender }
    }
}

impl FlashObserver for ChannelObserver {
    fn on_event(&self, event: &FlashEvent) {
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_observer_forwards() {
        let (tx, rx) = mpsc::channel();
        let observer = ChannelObserver::new(tx);
        observer.on_event(&FlashEvent::PhaseChanged {
            from: FlashPhase::Idle,
            to: FlashPhase::Parsing,
        });
        observer.on_event(&FlashEvent::Complete);

        let events: Vec<FlashEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            FlashEvent::PhaseChanged {
                to: FlashPhase::Parsing,
                ..
            }
        ));
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ChannelObserver::new(tx).on_event(&FlashEvent::Complete);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(FlashPhase::Erasing.to_string(), "Erasing");
        assert_eq!(FlashPhase::Rebooting.to_string(), "Rebooting");
    }
}

//! Protocol module - PICOBOOT protocol definitions.

pub mod command;
pub mod constants;
pub mod status;

pub use command::{Command, CommandFrame, ExclusiveMode, FrameError};
pub use constants::*;
pub use status::{CommandStatus, StatusCode};

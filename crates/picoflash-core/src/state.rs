//! Flash session state machine.
//!
//! ```text
//! Idle -> Parsing -> Preparing -> Erasing -> Writing -> Rebooting -> Done
//!                                                   \-> Done (no reboot)
//! ```
//!
//! `Error` is reachable from every state except `Done`. A new flash may start
//! from `Idle`, `Done` or `Error`.

use thiserror::Error;

use crate::events::FlashPhase;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: FlashPhase,
    pub to: FlashPhase,
}

/// Tracks the current phase and rejects out-of-sequence transitions.
#[derive(Debug)]
pub struct FlashStateMachine {
    phase: FlashPhase,
}

impl Default for FlashStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashStateMachine {
    pub fn new() -> Self {
        Self {
            phase: FlashPhase::Idle,
        }
    }

    pub fn phase(&self) -> FlashPhase {
        self.phase
    }

    /// Whether a new flash may begin.
    pub fn can_start(&self) -> bool {
        matches!(
            self.phase,
            FlashPhase::Idle | FlashPhase::Done | FlashPhase::Error
        )
    }

    /// Whether an operation is in progress.
    pub fn is_busy(&self) -> bool {
        !self.can_start()
    }

    pub fn is_allowed(from: FlashPhase, to: FlashPhase) -> bool {
        use FlashPhase::*;
        match (from, to) {
            (Idle | Done | Error, Parsing) => true,
            (Parsing, Preparing) => true,
            (Preparing, Erasing) => true,
            (Erasing, Writing) => true,
            (Writing, Rebooting | Done) => true,
            (Rebooting, Done) => true,
            (Done, _) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    /// Move to `to`, returning the phase left behind.
    pub fn goto_state(&mut self, to: FlashPhase) -> Result<FlashPhase, InvalidTransition> {
        let from = self.phase;
        if !Self::is_allowed(from, to) {
            return Err(InvalidTransition { from, to });
        }
        tracing::info!(from = %from, to = %to, "State transition");
        self.phase = to;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FlashPhase::*;

    #[test]
    fn test_happy_path() {
        let mut sm = FlashStateMachine::new();
        assert!(sm.can_start());
        for to in [Parsing, Preparing, Erasing, Writing, Rebooting, Done] {
            assert!(sm.goto_state(to).is_ok(), "transition to {}", to);
        }
        assert!(sm.can_start());
        assert_eq!(sm.goto_state(Parsing), Ok(Done));
    }

    #[test]
    fn test_error_reachable_from_non_terminal() {
        for from in [Idle, Parsing, Preparing, Erasing, Writing, Rebooting, Error] {
            assert!(FlashStateMachine::is_allowed(from, Error), "{} -> Error", from);
        }
        assert!(!FlashStateMachine::is_allowed(Done, Error));
    }

    #[test]
    fn test_rejects_out_of_sequence() {
        let mut sm = FlashStateMachine::new();
        assert_eq!(
            sm.goto_state(Writing),
            Err(InvalidTransition {
                from: Idle,
                to: Writing
            })
        );
        sm.goto_state(Parsing).unwrap();
        assert!(sm.is_busy());
        assert!(sm.goto_state(Parsing).is_err());
        assert!(sm.goto_state(Erasing).is_err());
        assert_eq!(sm.phase(), Parsing);
    }

    #[test]
    fn test_write_may_finish_without_reboot() {
        assert!(FlashStateMachine::is_allowed(Writing, Done));
        assert!(!FlashStateMachine::is_allowed(Erasing, Done));
    }
}

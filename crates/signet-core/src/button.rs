//! Pending physical button confirmations.

use std::fmt;

use crate::events::Operation;
use crate::protocol::ResultCode;
use crate::token::CommandToken;

/// Resolution of a button wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonOutcome {
    Confirmed,
    Cancelled,
    TimedOut,
}

impl fmt::Display for ButtonOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ButtonOutcome::Confirmed => write!(f, "confirmed"),
            ButtonOutcome::Cancelled => write!(f, "cancelled"),
            ButtonOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// A command the device holds until the user presses its button.
///
/// The timeout runs on the device and is reported as `ButtonPressTimeout`.
/// Cancelling is an explicit device call, sent at most once per wait.
#[derive(Debug, Clone)]
pub struct PendingButtonConfirmation {
    pub operation: Operation,
    pub token: CommandToken,
    cancel_sent: bool,
}

impl PendingButtonConfirmation {
    pub fn new(operation: Operation, token: CommandToken) -> Self {
        Self {
            operation,
            token,
            cancel_sent: false,
        }
    }

    /// Mark the wait as cancelled. Returns `false` if it already was.
    pub fn request_cancel(&mut self) -> bool {
        if self.cancel_sent {
            return false;
        }
        self.cancel_sent = true;
        true
    }

    pub fn cancel_sent(&self) -> bool {
        self.cancel_sent
    }

    /// Interpret the held command's result code.
    ///
    /// Any answer other than a cancel/timeout means the user pressed the
    /// button; connection loss leaves the wait unresolved.
    pub fn resolve(&self, code: ResultCode) -> Option<ButtonOutcome> {
        match code {
            ResultCode::ButtonPressCanceled => Some(ButtonOutcome::Cancelled),
            ResultCode::ButtonPressTimeout => Some(ButtonOutcome::TimedOut),
            ResultCode::Disconnected | ResultCode::Quit => None,
            _ => Some(ButtonOutcome::Confirmed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_sent_once() {
        let mut wait = PendingButtonConfirmation::new(Operation::Wipe, CommandToken::from_raw(1));
        assert!(wait.request_cancel());
        assert!(!wait.request_cancel());
        assert!(wait.cancel_sent());
    }

    #[test]
    fn test_resolution() {
        let wait = PendingButtonConfirmation::new(Operation::Login, CommandToken::from_raw(3));
        assert_eq!(wait.resolve(ResultCode::Okay), Some(ButtonOutcome::Confirmed));
        assert_eq!(
            wait.resolve(ResultCode::BadPassword),
            Some(ButtonOutcome::Confirmed)
        );
        assert_eq!(
            wait.resolve(ResultCode::ButtonPressTimeout),
            Some(ButtonOutcome::TimedOut)
        );
        assert_eq!(wait.resolve(ResultCode::Disconnected), None);
    }
}

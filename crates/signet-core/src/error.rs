//! Session error taxonomy.

use thiserror::Error;

use crate::device::DeviceError;
use crate::events::Operation;
use crate::payload::FirmwareError;
use crate::protocol::{CommandKind, ResultCode};
use crate::state::{DeviceState, Request};
use crate::transfer::TransferError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{request} is not permitted while the device is {state}")]
    NotPermitted { request: Request, state: DeviceState },

    #[error("Session is busy with {0}")]
    Busy(Operation),

    #[error("Illegal state transition: {from} -> {to}")]
    IllegalTransition { from: DeviceState, to: DeviceState },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Protocol violation: {command} answered with {code}")]
    UnexpectedResult { command: CommandKind, code: ResultCode },

    #[error("Protocol violation: {command}: {detail}")]
    MalformedResponse { command: CommandKind, detail: String },

    #[error("Session aborted after a fatal protocol error")]
    Aborted,

    #[error("Entry is {size} bytes, maximum is {max}")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Firmware error: {0}")]
    Firmware(#[from] FirmwareError),
}

impl SessionError {
    /// Protocol violations end the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::UnexpectedResult { .. }
                | SessionError::MalformedResponse { .. }
                | SessionError::InvariantViolation(_)
        )
    }

    pub(crate) fn malformed(command: CommandKind, detail: impl Into<String>) -> Self {
        SessionError::MalformedResponse {
            command,
            detail: detail.into(),
        }
    }
}

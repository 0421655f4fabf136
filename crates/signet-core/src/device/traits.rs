//! Device command API abstraction.
//!
//! Defines the `DeviceApi` trait the session drives, allowing different
//! implementations (USB/serial driver, mock, etc.). Commands return as soon
//! as they are queued; results arrive later as [`CommandResponse`] events
//! that the host feeds into the session.
//!
//! [`CommandResponse`]: crate::protocol::CommandResponse

use thiserror::Error;

use crate::protocol::Command;
use crate::token::CommandToken;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device not found")]
    NotFound,

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Device connection is not open")]
    NotConnected,

    #[error("Failed to send {command}: {message}")]
    SendFailed { command: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract device command interface.
pub trait DeviceApi {
    /// Open the connection to the device.
    fn open_connection(&mut self) -> Result<(), DeviceError>;

    /// Close the connection. Outstanding commands are abandoned.
    fn close_connection(&mut self);

    /// Queue `command` under `token`. The response arrives asynchronously.
    fn issue_command(&mut self, token: CommandToken, command: &Command) -> Result<(), DeviceError>;

    /// Ask the device to stop waiting for a button press.
    ///
    /// Out of band: carries no token and gets no response of its own; the
    /// held command answers with `ButtonPressCanceled`.
    fn cancel_button_wait(&mut self);
}

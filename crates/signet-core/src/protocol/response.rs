//! Responses delivered by the device command API.
//!
//! Responses arrive asynchronously and are matched back to the issuing
//! command through their [`CommandToken`].

use std::fmt;

use super::command::CommandKind;
use super::constants::*;
use crate::token::CommandToken;

/// Result code carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Okay,
    BadPassword,
    ButtonPressCanceled,
    ButtonPressTimeout,
    NotEnoughSpace,
    InvalidState,
    Disconnected,
    Quit,
    /// Any raw code the host does not know.
    OtherFatal,
}

impl ResultCode {
    /// Map a raw code from the device library.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            RESP_OKAY => ResultCode::Okay,
            RESP_BAD_PASSWORD => ResultCode::BadPassword,
            RESP_BUTTON_PRESS_CANCELED => ResultCode::ButtonPressCanceled,
            RESP_BUTTON_PRESS_TIMEOUT => ResultCode::ButtonPressTimeout,
            RESP_NOT_ENOUGH_SPACE => ResultCode::NotEnoughSpace,
            RESP_INVALID_STATE => ResultCode::InvalidState,
            RESP_ERROR_DISCONNECT => ResultCode::Disconnected,
            RESP_ERROR_QUIT => ResultCode::Quit,
            other => {
                tracing::debug!(raw = other, "Unknown result code");
                ResultCode::OtherFatal
            }
        }
    }

    /// Connection-level codes end the session regardless of the command.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ResultCode::Disconnected | ResultCode::Quit)
    }

    /// The user abandoned a button confirmation.
    pub fn is_declined(&self) -> bool {
        matches!(
            self,
            ResultCode::ButtonPressCanceled | ResultCode::ButtonPressTimeout
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Okay => "OKAY",
            ResultCode::BadPassword => "BAD_PASSWORD",
            ResultCode::ButtonPressCanceled => "BUTTON_PRESS_CANCELED",
            ResultCode::ButtonPressTimeout => "BUTTON_PRESS_TIMEOUT",
            ResultCode::NotEnoughSpace => "NOT_ENOUGH_SPACE",
            ResultCode::InvalidState => "INVALID_STATE",
            ResultCode::Disconnected => "DISCONNECTED",
            ResultCode::Quit => "QUIT",
            ResultCode::OtherFatal => "OTHER_FATAL",
        };
        f.write_str(name)
    }
}

impl CommandKind {
    /// Result codes this command may legitimately answer with.
    ///
    /// Anything outside this set is a protocol violation.
    pub fn accepts(&self, code: ResultCode) -> bool {
        match code {
            ResultCode::Okay | ResultCode::Disconnected | ResultCode::Quit => true,
            // The device may also report these for startup and read_block
            // while a confirmation is still being dismissed.
            ResultCode::ButtonPressCanceled | ResultCode::ButtonPressTimeout => {
                self.requires_button()
                    || matches!(self, CommandKind::Startup | CommandKind::ReadBlock)
            }
            ResultCode::BadPassword => *self == CommandKind::Login,
            ResultCode::NotEnoughSpace => *self == CommandKind::UpdateEntry,
            ResultCode::InvalidState => *self == CommandKind::GetProgress,
            ResultCode::OtherFatal => false,
        }
    }
}

/// Logical mode reported by the device at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    LoggedOut,
    Uninitialized,
    Unknown(u8),
}

impl DeviceMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            MODE_LOGGED_OUT => DeviceMode::LoggedOut,
            MODE_UNINITIALIZED => DeviceMode::Uninitialized,
            other => DeviceMode::Unknown(other),
        }
    }
}

/// Startup handshake data. `hashfn` and `salt` feed the external key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub mode: DeviceMode,
    pub hashfn: Vec<u8>,
    pub salt: Vec<u8>,
}

/// Progress snapshot for a device-side long operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressReport {
    pub total_progress: u32,
    pub total_progress_maximum: u32,
}

/// Optional data attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResponsePayload {
    #[default]
    None,
    Block(Vec<u8>),
    Startup(DeviceInfo),
    Progress(ProgressReport),
}

/// A response event from the device command API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub token: CommandToken,
    pub kind: CommandKind,
    pub code: ResultCode,
    pub payload: ResponsePayload,
}

impl CommandResponse {
    pub fn new(token: CommandToken, kind: CommandKind, code: ResultCode) -> Self {
        Self {
            token,
            kind,
            code,
            payload: ResponsePayload::None,
        }
    }

    pub fn with_payload(mut self, payload: ResponsePayload) -> Self {
        self.payload = payload;
        self
    }
}

//! Protocol module - device command vocabulary.

pub mod command;
pub mod constants;
pub mod response;

pub use command::{Command, CommandKind, ProgressPhase};
pub use constants::*;
pub use response::{
    CommandResponse, DeviceInfo, DeviceMode, ProgressReport, ResponsePayload, ResultCode,
};

//! Response handlers - per-operation continuation logic.
//!
//! This module is split into submodules by functionality:
//! - `connection`: open/startup handshake, connection loss, device reset
//! - `account`: login, logout, entry updates
//! - `transfer`: backup and restore block streaming
//! - `maintenance`: wipe and initialize with progress polling
//! - `firmware`: firmware erase/write/reset sequence
//!
//! Every handler consumes the active operation and either hands it back
//! with the next command already issued, or ends it.

mod account;
mod connection;
mod firmware;
mod maintenance;
mod transfer;

use std::time::Duration;

use tracing::{debug, info};

use crate::button::{ButtonOutcome, PendingButtonConfirmation};
use crate::device::DeviceApi;
use crate::error::SessionError;
use crate::events::{EventBus, LogLevel, Operation, Outcome, SessionEvent};
use crate::protocol::{Command, CommandKind, CommandResponse, DeviceInfo, ResultCode};
use crate::session::{PendingTimer, SessionConfig, TimerKind};
use crate::state::machine::{DeviceState, StateMachine};
use crate::token::{CommandToken, TokenRegistry};
use crate::transfer::BlockTransferJob;
use crate::update::FirmwareUpdateJob;

pub(crate) use account::{start_login, start_logout, start_update_entry};
pub(crate) use connection::{begin_connect, handle_connection_loss};
pub(crate) use firmware::start_firmware_update;
pub(crate) use maintenance::{start_initialize, start_reset, start_wipe};
pub(crate) use transfer::start_transfer;

/// The long-running operation that owns the outstanding command.
#[derive(Debug)]
pub enum ActiveOperation {
    Startup,
    Login,
    Logout,
    UpdateEntry,
    Transfer(BlockTransferJob),
    Wipe,
    Initialize,
    FirmwareUpdate(FirmwareUpdateJob),
    ResetDevice,
}

impl ActiveOperation {
    pub fn operation(&self) -> Operation {
        match self {
            ActiveOperation::Startup => Operation::Startup,
            ActiveOperation::Login => Operation::Login,
            ActiveOperation::Logout => Operation::Logout,
            ActiveOperation::UpdateEntry => Operation::UpdateEntry,
            ActiveOperation::Transfer(job) => job.direction().operation(),
            ActiveOperation::Wipe => Operation::Wipe,
            ActiveOperation::Initialize => Operation::Initialize,
            ActiveOperation::FirmwareUpdate(_) => Operation::FirmwareUpdate,
            ActiveOperation::ResetDevice => Operation::ResetDevice,
        }
    }
}

/// Result of handling a response.
#[derive(Debug)]
pub enum HandleResult {
    /// Next command issued; the operation stays active.
    Continue(ActiveOperation),
    /// Operation over; nothing outstanding.
    Idle,
}

/// Handler context containing all session resources except the active operation.
pub struct HandlerContext<'a, D: DeviceApi> {
    pub device: &'a mut D,
    pub machine: &'a mut StateMachine,
    pub tokens: &'a mut TokenRegistry,
    pub events: &'a EventBus,
    pub config: &'a SessionConfig,
    pub button: &'a mut Option<PendingButtonConfirmation>,
    pub timer: &'a mut Option<PendingTimer>,
    pub device_info: &'a mut Option<DeviceInfo>,
}

impl<'a, D: DeviceApi> HandlerContext<'a, D> {
    pub(crate) fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.events.log(level, message);
    }

    /// Mint a token and hand `command` to the device.
    pub(crate) fn issue(&mut self, command: Command) -> Result<CommandToken, SessionError> {
        let kind = command.kind();
        let token = self.tokens.issue(kind)?;
        if let Err(e) = self.device.issue_command(token, &command) {
            self.tokens.release();
            return Err(e.into());
        }
        debug!(token = %token, kind = %kind, "Command issued");
        self.emit(SessionEvent::CommandIssued { token, kind });
        Ok(token)
    }

    /// Issue a command the device holds until its button is pressed.
    pub(crate) fn issue_with_button(
        &mut self,
        command: Command,
        operation: Operation,
    ) -> Result<CommandToken, SessionError> {
        let token = self.issue(command)?;
        *self.button = Some(PendingButtonConfirmation::new(operation, token));
        self.emit(SessionEvent::ButtonWaitStarted { operation });
        Ok(token)
    }

    /// Resolve the pending button wait with the held command's code.
    pub(crate) fn end_button_wait(&mut self, code: ResultCode) -> Option<ButtonOutcome> {
        let wait = self.button.take()?;
        let outcome = wait.resolve(code)?;
        self.emit(SessionEvent::ButtonWaitEnded {
            operation: wait.operation,
            outcome,
        });
        Some(outcome)
    }

    /// Transition the state machine and publish the change.
    pub(crate) fn enter(&mut self, to: DeviceState) -> Result<(), SessionError> {
        let from = self.machine.goto_state(to)?;
        self.emit(SessionEvent::StateChanged { from, to });
        Ok(())
    }

    pub(crate) fn finish(&self, operation: Operation, outcome: Outcome) {
        info!(operation = %operation, outcome = %outcome, "Operation finished");
        self.emit(SessionEvent::OperationFinished { operation, outcome });
    }

    pub(crate) fn progress(&self, operation: Operation, current: u64, total: u64) {
        self.emit(SessionEvent::Progress {
            operation,
            current,
            total,
        });
    }

    pub(crate) fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        debug!(timer = ?kind, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        *self.timer = Some(PendingTimer { kind, delay });
    }
}

/// Outcome for a declined button confirmation, `None` for any other code.
pub(crate) fn declined(code: ResultCode) -> Option<Outcome> {
    match code {
        ResultCode::ButtonPressCanceled => Some(Outcome::Declined(ButtonOutcome::Cancelled)),
        ResultCode::ButtonPressTimeout => Some(Outcome::Declined(ButtonOutcome::TimedOut)),
        _ => None,
    }
}

/// Settle a button-confirmed command. Returns `false` if the user declined,
/// in which case the operation has already been finished.
pub(crate) fn confirmed<D: DeviceApi>(
    operation: Operation,
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<bool, SessionError> {
    ctx.end_button_wait(response.code);
    if let Some(outcome) = declined(response.code) {
        ctx.finish(operation, outcome);
        return Ok(false);
    }
    if response.code != ResultCode::Okay {
        return Err(SessionError::UnexpectedResult {
            command: response.kind,
            code: response.code,
        });
    }
    Ok(true)
}

/// A response arrived for a command this operation never issues.
pub(crate) fn unexpected(operation: Operation, kind: CommandKind) -> SessionError {
    SessionError::InvariantViolation(format!("{} does not issue {}", operation, kind))
}

/// Continue `op` with an already-correlated and code-checked response.
pub fn handle_response<D: DeviceApi>(
    op: ActiveOperation,
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    if response.code.is_connection_loss() {
        let reconnect = response.code == ResultCode::Disconnected;
        return handle_connection_loss(Some(op), reconnect, ctx);
    }

    match op {
        ActiveOperation::Startup => connection::handle_startup(response, ctx),
        ActiveOperation::Login => account::handle_login(response, ctx),
        ActiveOperation::Logout => account::handle_logout(response, ctx),
        ActiveOperation::UpdateEntry => account::handle_update_entry(response, ctx),
        ActiveOperation::Transfer(job) => transfer::handle_transfer(job, response, ctx),
        ActiveOperation::Wipe => maintenance::handle_wipe(response, ctx),
        ActiveOperation::Initialize => maintenance::handle_initialize(response, ctx),
        ActiveOperation::ResetDevice => maintenance::handle_reset(response, ctx),
        ActiveOperation::FirmwareUpdate(job) => firmware::handle_firmware(job, response, ctx),
    }
}

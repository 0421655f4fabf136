//! Connection handlers (open, startup handshake, connection loss, reset).

use tracing::{info, warn};

use crate::device::DeviceApi;
use crate::error::SessionError;
use crate::events::{LogLevel, Operation, Outcome};
use crate::protocol::{Command, CommandKind, CommandResponse, DeviceMode, ResponsePayload, ResultCode};
use crate::session::TimerKind;
use crate::state::machine::DeviceState;

use super::{ActiveOperation, HandleResult, HandlerContext, declined, unexpected};

/// Enter `Connecting` and try to open the device.
///
/// On success the startup handshake is issued. On failure a retry timer is
/// scheduled and the session stays in `Connecting`.
pub(crate) fn begin_connect<D: DeviceApi>(
    ctx: &mut HandlerContext<'_, D>,
) -> Result<Option<ActiveOperation>, SessionError> {
    ctx.enter(DeviceState::Connecting)?;
    if let Err(e) = ctx.device.open_connection() {
        retry_connect(&SessionError::from(e), ctx);
        return Ok(None);
    }
    match ctx.issue(Command::Startup) {
        Ok(_) => {
            info!("Device connection opened");
            Ok(Some(ActiveOperation::Startup))
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            ctx.device.close_connection();
            retry_connect(&e, ctx);
            Ok(None)
        }
    }
}

/// Stay in `Connecting` and try again after the retry delay.
fn retry_connect<D: DeviceApi>(err: &SessionError, ctx: &mut HandlerContext<'_, D>) {
    let delay = ctx.config.connect_retry_delay();
    warn!(error = %err, retry_ms = delay.as_millis() as u64, "Failed to open device");
    ctx.log(LogLevel::Warn, format!("Failed to open device: {}", err));
    ctx.schedule(TimerKind::ConnectRetry, delay);
}

/// Startup handshake answered.
pub(crate) fn handle_startup<D: DeviceApi>(
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    if response.kind != CommandKind::Startup {
        return Err(unexpected(Operation::Startup, response.kind));
    }
    if let Some(outcome) = declined(response.code) {
        // Startup was dismissed without an answer; reopen and ask again.
        warn!(code = %response.code, "Startup dismissed, retrying connection");
        ctx.finish(Operation::Startup, outcome);
        ctx.device.close_connection();
        if ctx.machine.state() != DeviceState::Connecting {
            ctx.enter(DeviceState::Disconnected)?;
        }
        let delay = ctx.config.connect_retry_delay();
        ctx.schedule(TimerKind::ConnectRetry, delay);
        return Ok(HandleResult::Idle);
    }
    if response.code != ResultCode::Okay {
        return Err(SessionError::UnexpectedResult {
            command: response.kind,
            code: response.code,
        });
    }

    let ResponsePayload::Startup(info) = &response.payload else {
        return Err(SessionError::malformed(
            CommandKind::Startup,
            "missing startup payload",
        ));
    };
    let to = match info.mode {
        DeviceMode::LoggedOut => DeviceState::LoggedOut,
        DeviceMode::Uninitialized => DeviceState::Uninitialized,
        DeviceMode::Unknown(raw) => {
            return Err(SessionError::malformed(
                CommandKind::Startup,
                format!("unknown device mode {}", raw),
            ));
        }
    };

    info!(mode = ?info.mode, "Device startup complete");
    *ctx.device_info = Some(info.clone());
    ctx.enter(to)?;
    ctx.finish(Operation::Startup, Outcome::Completed);
    Ok(HandleResult::Idle)
}

/// The connection went away, either reported by a response or by the host.
///
/// The active operation is marked incomplete and nothing more is sent; a
/// transfer in progress does not get its end command. With `reconnect` and
/// auto-reconnect enabled a connect retry is scheduled.
pub(crate) fn handle_connection_loss<D: DeviceApi>(
    op: Option<ActiveOperation>,
    reconnect: bool,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    warn!(state = %ctx.machine.state(), "Device connection lost");
    *ctx.button = None;
    ctx.tokens.release();

    if let Some(op) = op {
        let operation = op.operation();
        let outcome = match op {
            ActiveOperation::Transfer(job) => job.abandon(),
            _ => Outcome::Incomplete,
        };
        ctx.finish(operation, outcome);
    }

    ctx.device.close_connection();
    ctx.enter(DeviceState::Disconnected)?;

    if reconnect && ctx.config.auto_reconnect {
        let delay = ctx.config.connect_retry_delay();
        ctx.schedule(TimerKind::ConnectRetry, delay);
    } else {
        *ctx.timer = None;
    }
    Ok(HandleResult::Idle)
}

/// `reset_device` acknowledged: close the connection and wait for the device
/// to come back.
pub(crate) fn enter_reset_pending<D: DeviceApi>(
    operation: Operation,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    ctx.enter(DeviceState::ResetPending)?;
    ctx.device.close_connection();
    let delay = ctx.config.reset_settle_delay();
    ctx.schedule(TimerKind::ResetSettle, delay);
    ctx.log(LogLevel::Info, "Device resetting");
    ctx.finish(operation, Outcome::Completed);
    Ok(HandleResult::Idle)
}

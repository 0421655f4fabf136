//! Maintenance handlers (wipe, initialize, reset).
//!
//! Wipe and initialize run on the device for a while; their completion is
//! observed by polling `get_progress` until the device answers
//! `InvalidState`.

use tracing::info;

use crate::device::DeviceApi;
use crate::error::SessionError;
use crate::events::{Operation, Outcome};
use crate::protocol::{
    Command, CommandKind, CommandResponse, ProgressPhase, ResponsePayload, ResultCode,
};
use crate::state::machine::DeviceState;

use super::connection::enter_reset_pending;
use super::{ActiveOperation, HandleResult, HandlerContext, confirmed, unexpected};

pub(crate) fn start_wipe<D: DeviceApi>(
    ctx: &mut HandlerContext<'_, D>,
) -> Result<ActiveOperation, SessionError> {
    ctx.issue_with_button(Command::Wipe, Operation::Wipe)?;
    Ok(ActiveOperation::Wipe)
}

pub(crate) fn handle_wipe<D: DeviceApi>(
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    match response.kind {
        CommandKind::Wipe => {
            if !confirmed(Operation::Wipe, response, ctx)? {
                return Ok(HandleResult::Idle);
            }
            ctx.enter(DeviceState::Wiping)?;
            poll(ProgressPhase::Wiping, 0, ctx)?;
            Ok(HandleResult::Continue(ActiveOperation::Wipe))
        }
        CommandKind::GetProgress => {
            if !on_progress(Operation::Wipe, ProgressPhase::Wiping, response, ctx)? {
                return Ok(HandleResult::Continue(ActiveOperation::Wipe));
            }
            info!("Device wiped");
            ctx.enter(DeviceState::Uninitialized)?;
            ctx.finish(Operation::Wipe, Outcome::Completed);
            Ok(HandleResult::Idle)
        }
        other => Err(unexpected(Operation::Wipe, other)),
    }
}

pub(crate) fn start_initialize<D: DeviceApi>(
    ctx: &mut HandlerContext<'_, D>,
    key: Vec<u8>,
    hashfn: Vec<u8>,
    salt: Vec<u8>,
) -> Result<ActiveOperation, SessionError> {
    ctx.issue_with_button(Command::Initialize { key, hashfn, salt }, Operation::Initialize)?;
    Ok(ActiveOperation::Initialize)
}

pub(crate) fn handle_initialize<D: DeviceApi>(
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    match response.kind {
        CommandKind::Initialize => {
            if !confirmed(Operation::Initialize, response, ctx)? {
                return Ok(HandleResult::Idle);
            }
            ctx.enter(DeviceState::Initializing)?;
            poll(ProgressPhase::Initializing, 0, ctx)?;
            Ok(HandleResult::Continue(ActiveOperation::Initialize))
        }
        CommandKind::GetProgress => {
            if !on_progress(
                Operation::Initialize,
                ProgressPhase::Initializing,
                response,
                ctx,
            )? {
                return Ok(HandleResult::Continue(ActiveOperation::Initialize));
            }
            info!("Device initialized");
            ctx.finish(Operation::Initialize, Outcome::Completed);
            ctx.issue(Command::Startup)?;
            Ok(HandleResult::Continue(ActiveOperation::Startup))
        }
        other => Err(unexpected(Operation::Initialize, other)),
    }
}

pub(crate) fn start_reset<D: DeviceApi>(
    ctx: &mut HandlerContext<'_, D>,
) -> Result<ActiveOperation, SessionError> {
    ctx.issue(Command::ResetDevice)?;
    Ok(ActiveOperation::ResetDevice)
}

pub(crate) fn handle_reset<D: DeviceApi>(
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    if response.kind != CommandKind::ResetDevice {
        return Err(unexpected(Operation::ResetDevice, response.kind));
    }
    enter_reset_pending(Operation::ResetDevice, ctx)
}

fn poll<D: DeviceApi>(
    phase: ProgressPhase,
    since: u32,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<(), SessionError> {
    ctx.issue(Command::GetProgress { since, phase })?;
    Ok(())
}

/// One `get_progress` answer. Returns `true` once the phase has finished;
/// otherwise publishes progress and polls again.
fn on_progress<D: DeviceApi>(
    operation: Operation,
    phase: ProgressPhase,
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<bool, SessionError> {
    match response.code {
        ResultCode::InvalidState => Ok(true),
        ResultCode::Okay => {
            let ResponsePayload::Progress(report) = &response.payload else {
                return Err(SessionError::malformed(
                    CommandKind::GetProgress,
                    "missing progress report",
                ));
            };
            ctx.progress(
                operation,
                u64::from(report.total_progress),
                u64::from(report.total_progress_maximum),
            );
            poll(phase, report.total_progress, ctx)?;
            Ok(false)
        }
        code => Err(SessionError::UnexpectedResult {
            command: response.kind,
            code,
        }),
    }
}

//! Backup/restore handlers.

use tracing::debug;

use crate::device::DeviceApi;
use crate::error::SessionError;
use crate::protocol::{Command, CommandKind, CommandResponse, ResponsePayload, ResultCode};
use crate::state::machine::DeviceState;
use crate::transfer::{BlockTransferJob, Direction};

use super::{ActiveOperation, HandleResult, HandlerContext, declined, unexpected};

/// Issue the begin command for a prepared job.
pub(crate) fn start_transfer<D: DeviceApi>(
    ctx: &mut HandlerContext<'_, D>,
    mut job: BlockTransferJob,
) -> Result<ActiveOperation, SessionError> {
    let operation = job.direction().operation();
    let command = job.start();
    ctx.issue_with_button(command, operation)?;
    Ok(ActiveOperation::Transfer(job))
}

pub(crate) fn handle_transfer<D: DeviceApi>(
    mut job: BlockTransferJob,
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    let operation = job.direction().operation();

    let next = match response.kind {
        CommandKind::BeginBackup | CommandKind::BeginRestore => {
            ctx.end_button_wait(response.code);
            if let Some(outcome) = declined(response.code) {
                // Nothing was opened on the device, so there is nothing to end.
                ctx.finish(operation, outcome);
                return Ok(HandleResult::Idle);
            }
            if response.code != ResultCode::Okay {
                return Err(SessionError::UnexpectedResult {
                    command: response.kind,
                    code: response.code,
                });
            }
            ctx.enter(match job.direction() {
                Direction::Backup => DeviceState::BackingUp,
                Direction::Restore => DeviceState::Restoring,
            })?;
            job.on_begin_confirmed()
        }
        CommandKind::ReadBlock if response.code.is_declined() => {
            debug!(code = %response.code, "Block read dismissed");
            job.repeat_read()
        }
        CommandKind::ReadBlock => {
            let ResponsePayload::Block(data) = &response.payload else {
                return Err(SessionError::malformed(
                    CommandKind::ReadBlock,
                    "missing block data",
                ));
            };
            job.on_block_read(data)
        }
        CommandKind::WriteBlock => job.on_block_written(),
        CommandKind::EndBackup | CommandKind::EndRestore => {
            let direction = job.direction();
            let outcome = job.finish();
            ctx.finish(operation, outcome);
            return match direction {
                Direction::Backup => {
                    ctx.enter(DeviceState::LoggedIn)?;
                    Ok(HandleResult::Idle)
                }
                Direction::Restore => {
                    // The restored image decides the device mode.
                    ctx.issue(Command::Startup)?;
                    Ok(HandleResult::Continue(ActiveOperation::Startup))
                }
            };
        }
        other => return Err(unexpected(operation, other)),
    };

    let (current, total) = job.progress();
    ctx.progress(operation, current, total);
    debug!(next = %next.kind(), block = current, "Transfer step");
    ctx.issue(next)?;
    Ok(HandleResult::Continue(ActiveOperation::Transfer(job)))
}

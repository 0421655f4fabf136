//! Firmware update handlers (begin, erase, poll, write, reset).

use tracing::info;

use crate::device::DeviceApi;
use crate::error::SessionError;
use crate::events::{LogLevel, Operation};
use crate::protocol::{CommandKind, CommandResponse, ResponsePayload, ResultCode};
use crate::state::machine::DeviceState;
use crate::update::FirmwareUpdateJob;

use super::connection::enter_reset_pending;
use super::{ActiveOperation, HandleResult, HandlerContext, confirmed, unexpected};

/// Issue `begin_firmware_update` for a validated image.
pub(crate) fn start_firmware_update<D: DeviceApi>(
    ctx: &mut HandlerContext<'_, D>,
    mut job: FirmwareUpdateJob,
) -> Result<ActiveOperation, SessionError> {
    let command = job.start();
    ctx.issue_with_button(command, Operation::FirmwareUpdate)?;
    Ok(ActiveOperation::FirmwareUpdate(job))
}

pub(crate) fn handle_firmware<D: DeviceApi>(
    mut job: FirmwareUpdateJob,
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    let next = match response.kind {
        CommandKind::BeginFirmwareUpdate => {
            if !confirmed(Operation::FirmwareUpdate, response, ctx)? {
                return Ok(HandleResult::Idle);
            }
            ctx.enter(DeviceState::UpdatingFirmware)?;
            info!(pages = ?job.erase_pages(), "Erasing firmware pages");
            job.on_begin_confirmed()
        }
        CommandKind::ErasePages => job.on_erase_started(),
        CommandKind::GetProgress => match response.code {
            ResultCode::Okay => {
                let ResponsePayload::Progress(report) = &response.payload else {
                    return Err(SessionError::malformed(
                        CommandKind::GetProgress,
                        "missing progress report",
                    ));
                };
                ctx.progress(
                    Operation::FirmwareUpdate,
                    u64::from(report.total_progress),
                    u64::from(report.total_progress_maximum),
                );
                job.on_erase_progress(report)
            }
            ResultCode::InvalidState => {
                ctx.log(LogLevel::Info, "Flash erased, writing firmware");
                let (current, total) = job.progress();
                ctx.progress(Operation::FirmwareUpdate, current, total);
                job.on_erase_complete()
            }
            code => {
                return Err(SessionError::UnexpectedResult {
                    command: response.kind,
                    code,
                });
            }
        },
        CommandKind::WriteFlash => {
            let next = job.on_chunk_written();
            let (current, total) = job.progress();
            ctx.progress(Operation::FirmwareUpdate, current, total);
            next
        }
        CommandKind::ResetDevice => {
            return enter_reset_pending(Operation::FirmwareUpdate, ctx);
        }
        other => return Err(unexpected(Operation::FirmwareUpdate, other)),
    };

    ctx.issue(next)?;
    Ok(HandleResult::Continue(ActiveOperation::FirmwareUpdate(job)))
}

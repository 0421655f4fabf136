//! Account handlers (login, logout, entry update).

use tracing::{info, warn};

use crate::device::DeviceApi;
use crate::error::SessionError;
use crate::events::{LogLevel, Operation, Outcome};
use crate::protocol::{Command, CommandKind, CommandResponse, ResultCode};
use crate::state::machine::DeviceState;

use super::{ActiveOperation, HandleResult, HandlerContext, declined, unexpected};

/// Send the derived key and wait for the button.
pub(crate) fn start_login<D: DeviceApi>(
    ctx: &mut HandlerContext<'_, D>,
    key: Vec<u8>,
) -> Result<ActiveOperation, SessionError> {
    ctx.issue_with_button(Command::Login { key }, Operation::Login)?;
    ctx.enter(DeviceState::LoggingIn)?;
    Ok(ActiveOperation::Login)
}

pub(crate) fn handle_login<D: DeviceApi>(
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    if response.kind != CommandKind::Login {
        return Err(unexpected(Operation::Login, response.kind));
    }
    ctx.end_button_wait(response.code);

    match response.code {
        ResultCode::Okay => {
            info!("Login accepted, loading accounts");
            ctx.enter(DeviceState::LoggedInLoadingAccounts)?;
            ctx.finish(Operation::Login, Outcome::Completed);
        }
        ResultCode::BadPassword => {
            warn!("Login rejected: bad password");
            ctx.enter(DeviceState::LoggedOut)?;
            ctx.finish(Operation::Login, Outcome::BadPassword);
        }
        code => {
            let Some(outcome) = declined(code) else {
                return Err(SessionError::UnexpectedResult {
                    command: response.kind,
                    code,
                });
            };
            ctx.enter(DeviceState::LoggedOut)?;
            ctx.finish(Operation::Login, outcome);
        }
    }
    Ok(HandleResult::Idle)
}

pub(crate) fn start_logout<D: DeviceApi>(
    ctx: &mut HandlerContext<'_, D>,
) -> Result<ActiveOperation, SessionError> {
    ctx.issue(Command::Logout)?;
    Ok(ActiveOperation::Logout)
}

pub(crate) fn handle_logout<D: DeviceApi>(
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    if response.kind != CommandKind::Logout {
        return Err(unexpected(Operation::Logout, response.kind));
    }
    ctx.enter(DeviceState::LoggedOut)?;
    ctx.finish(Operation::Logout, Outcome::Completed);
    Ok(HandleResult::Idle)
}

/// Store an encoded entry. Oversized entries are refused locally.
pub(crate) fn start_update_entry<D: DeviceApi>(
    ctx: &mut HandlerContext<'_, D>,
    id: u16,
    data: Vec<u8>,
    mask: Vec<u8>,
) -> Result<ActiveOperation, SessionError> {
    let max = ctx.config.max_entry_data_size;
    if data.len() > max {
        return Err(SessionError::EntryTooLarge {
            size: data.len(),
            max,
        });
    }
    ctx.issue_with_button(Command::UpdateEntry { id, data, mask }, Operation::UpdateEntry)?;
    Ok(ActiveOperation::UpdateEntry)
}

pub(crate) fn handle_update_entry<D: DeviceApi>(
    response: &CommandResponse,
    ctx: &mut HandlerContext<'_, D>,
) -> Result<HandleResult, SessionError> {
    if response.kind != CommandKind::UpdateEntry {
        return Err(unexpected(Operation::UpdateEntry, response.kind));
    }
    ctx.end_button_wait(response.code);

    let outcome = match response.code {
        ResultCode::Okay => Outcome::Completed,
        ResultCode::NotEnoughSpace => {
            ctx.log(
                LogLevel::Warn,
                "Entry too large; remove some data and try again",
            );
            Outcome::NotEnoughSpace
        }
        code => declined(code).ok_or(SessionError::UnexpectedResult {
            command: response.kind,
            code,
        })?,
    };
    ctx.finish(Operation::UpdateEntry, outcome);
    Ok(HandleResult::Idle)
}

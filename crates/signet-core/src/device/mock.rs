//! Mock device for testing and simulation.
//!
//! Behaves like a cooperative Signet token: it keeps a block store, records
//! every command, and answers asynchronously through a response queue that
//! the host drains with [`MockDevice::next_response`].

use std::collections::VecDeque;

use super::traits::{DeviceApi, DeviceError};
use crate::error::SessionError;
use crate::protocol::{
    BLOCK_SIZE, Command, CommandKind, CommandResponse, DeviceInfo, DeviceMode, MAX_BLOCK_ID,
    MAX_ENTRY_DATA_SIZE, ProgressPhase, ProgressReport, ResponsePayload, ResultCode,
};
use crate::session::DeviceSession;
use crate::token::CommandToken;

/// What the simulated user does when the device asks for a button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonBehavior {
    /// Confirm immediately.
    Press,
    /// Keep the command pending until the test resolves it.
    Hold,
}

/// Mock device for unit testing session logic.
pub struct MockDevice {
    mode: DeviceMode,
    key: Vec<u8>,
    hashfn: Vec<u8>,
    salt: Vec<u8>,
    blocks: Vec<Vec<u8>>,
    flash_writes: Vec<(u32, Vec<u8>)>,
    erased_pages: Vec<u16>,
    progress_steps: u32,
    progress_remaining: u32,
    progress_phase: Option<ProgressPhase>,
    connected: bool,
    open_failures: usize,
    open_calls: usize,
    reopen_calls: usize,
    close_calls: usize,
    cancel_calls: usize,
    button: ButtonBehavior,
    held: Option<(CommandToken, Command)>,
    injected: VecDeque<(CommandKind, ResultCode)>,
    failing_issues: Vec<CommandKind>,
    issued: Vec<(CommandToken, Command)>,
    responses: VecDeque<CommandResponse>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_geometry(BLOCK_SIZE, MAX_BLOCK_ID)
    }

    /// Device with `max_block_id + 1` blocks of `block_size` bytes.
    /// Block `n` is filled with the byte `n`.
    pub fn with_geometry(block_size: usize, max_block_id: u16) -> Self {
        let blocks = (0..=max_block_id)
            .map(|id| vec![id as u8; block_size])
            .collect();
        Self {
            mode: DeviceMode::LoggedOut,
            key: b"correct horse".to_vec(),
            hashfn: vec![1, 12, 0, 0],
            salt: vec![0x5A; 16],
            blocks,
            flash_writes: Vec::new(),
            erased_pages: Vec::new(),
            progress_steps: 3,
            progress_remaining: 0,
            progress_phase: None,
            connected: false,
            open_failures: 0,
            open_calls: 0,
            reopen_calls: 0,
            close_calls: 0,
            cancel_calls: 0,
            button: ButtonBehavior::Press,
            held: None,
            injected: VecDeque::new(),
            failing_issues: Vec::new(),
            issued: Vec::new(),
            responses: VecDeque::new(),
        }
    }

    pub fn set_mode(&mut self, mode: DeviceMode) {
        self.mode = mode;
    }

    pub fn set_key(&mut self, key: &[u8]) {
        self.key = key.to_vec();
    }

    pub fn set_button(&mut self, behavior: ButtonBehavior) {
        self.button = behavior;
    }

    /// Number of `get_progress` polls reporting `Okay` before a phase ends.
    pub fn set_progress_steps(&mut self, steps: u32) {
        self.progress_steps = steps;
    }

    /// Make the next `count` open attempts fail.
    pub fn fail_next_opens(&mut self, count: usize) {
        self.open_failures = count;
    }

    /// Refuse to send the next command of `kind`.
    pub fn fail_next_issue(&mut self, kind: CommandKind) {
        self.failing_issues.push(kind);
    }

    /// Answer the next command of `kind` with `code` instead of executing it.
    pub fn inject(&mut self, kind: CommandKind, code: ResultCode) {
        self.injected.push_back((kind, code));
    }

    /// Queue an arbitrary response, e.g. a stale one.
    pub fn push_response(&mut self, response: CommandResponse) {
        self.responses.push_back(response);
    }

    /// Confirm the held command.
    pub fn press_button(&mut self) {
        if let Some((token, command)) = self.held.take() {
            let response = self.execute(token, &command);
            self.responses.push_back(response);
        }
    }

    /// Let the held command time out.
    pub fn time_out_button(&mut self) {
        if let Some((token, command)) = self.held.take() {
            self.responses.push_back(CommandResponse::new(
                token,
                command.kind(),
                ResultCode::ButtonPressTimeout,
            ));
        }
    }

    /// Next queued response, in issue order.
    pub fn next_response(&mut self) -> Option<CommandResponse> {
        self.responses.pop_front()
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    pub fn is_holding_button(&self) -> bool {
        self.held.is_some()
    }

    /// Every command received, in order.
    pub fn issued(&self) -> &[(CommandToken, Command)] {
        &self.issued
    }

    pub fn issued_kinds(&self) -> Vec<CommandKind> {
        self.issued.iter().map(|(_, c)| c.kind()).collect()
    }

    pub fn clear_issued(&mut self) {
        self.issued.clear();
    }

    pub fn blocks(&self) -> &[Vec<u8>] {
        &self.blocks
    }

    pub fn flash_writes(&self) -> &[(u32, Vec<u8>)] {
        &self.flash_writes
    }

    pub fn erased_pages(&self) -> &[u16] {
        &self.erased_pages
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls
    }

    /// Opens attempted while the connection was already open.
    pub fn reopen_calls(&self) -> usize {
        self.reopen_calls
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls
    }

    fn start_progress(&mut self, phase: ProgressPhase) {
        self.progress_phase = Some(phase);
        self.progress_remaining = self.progress_steps;
    }

    fn finish_progress(&mut self, phase: ProgressPhase) {
        match phase {
            ProgressPhase::Wiping => {
                self.mode = DeviceMode::Uninitialized;
                for block in &mut self.blocks {
                    block.fill(0);
                }
            }
            ProgressPhase::Initializing => self.mode = DeviceMode::LoggedOut,
            ProgressPhase::ErasingPages => {}
        }
        self.progress_phase = None;
    }

    fn execute(&mut self, token: CommandToken, command: &Command) -> CommandResponse {
        let kind = command.kind();
        let okay = CommandResponse::new(token, kind, ResultCode::Okay);
        match command {
            Command::Startup => okay.with_payload(ResponsePayload::Startup(DeviceInfo {
                mode: self.mode,
                hashfn: self.hashfn.clone(),
                salt: self.salt.clone(),
            })),
            Command::Login { key } => {
                if *key == self.key {
                    okay
                } else {
                    CommandResponse::new(token, kind, ResultCode::BadPassword)
                }
            }
            Command::ReadBlock { index } => match self.blocks.get(*index as usize) {
                Some(block) => okay.with_payload(ResponsePayload::Block(block.clone())),
                None => CommandResponse::new(token, kind, ResultCode::OtherFatal),
            },
            Command::WriteBlock { index, data } => {
                if let Some(block) = self.blocks.get_mut(*index as usize) {
                    *block = data.clone();
                }
                okay
            }
            Command::EndRestore => {
                let blank = self.blocks.iter().all(|b| b.iter().all(|&byte| byte == 0));
                self.mode = if blank {
                    DeviceMode::Uninitialized
                } else {
                    DeviceMode::LoggedOut
                };
                okay
            }
            Command::ErasePages { pages } => {
                self.erased_pages = pages.clone();
                self.start_progress(ProgressPhase::ErasingPages);
                okay
            }
            Command::WriteFlash { address, data } => {
                self.flash_writes.push((*address, data.clone()));
                okay
            }
            Command::Wipe => {
                self.start_progress(ProgressPhase::Wiping);
                okay
            }
            Command::GetProgress { phase, .. } => {
                if self.progress_phase == Some(*phase) && self.progress_remaining > 0 {
                    self.progress_remaining -= 1;
                    okay.with_payload(ResponsePayload::Progress(ProgressReport {
                        total_progress: self.progress_steps - self.progress_remaining,
                        total_progress_maximum: self.progress_steps,
                    }))
                } else {
                    self.finish_progress(*phase);
                    CommandResponse::new(token, kind, ResultCode::InvalidState)
                }
            }
            Command::Initialize { key, hashfn, salt } => {
                self.key = key.clone();
                self.hashfn = hashfn.clone();
                self.salt = salt.clone();
                self.start_progress(ProgressPhase::Initializing);
                okay
            }
            Command::UpdateEntry { data, .. } => {
                if data.len() > MAX_ENTRY_DATA_SIZE {
                    CommandResponse::new(token, kind, ResultCode::NotEnoughSpace)
                } else {
                    okay
                }
            }
            Command::Logout
            | Command::BeginBackup
            | Command::EndBackup
            | Command::BeginRestore
            | Command::ResetDevice
            | Command::BeginFirmwareUpdate => okay,
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceApi for MockDevice {
    fn open_connection(&mut self) -> Result<(), DeviceError> {
        self.open_calls += 1;
        if self.connected {
            self.reopen_calls += 1;
        }
        if self.open_failures > 0 {
            self.open_failures -= 1;
            return Err(DeviceError::NotFound);
        }
        self.connected = true;
        Ok(())
    }

    fn close_connection(&mut self) {
        self.close_calls += 1;
        self.connected = false;
        self.held = None;
        self.responses.clear();
    }

    fn issue_command(&mut self, token: CommandToken, command: &Command) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        let kind = command.kind();
        if let Some(pos) = self.failing_issues.iter().position(|k| *k == kind) {
            self.failing_issues.remove(pos);
            return Err(DeviceError::SendFailed {
                command: kind.to_string(),
                message: "simulated send failure".into(),
            });
        }
        self.issued.push((token, command.clone()));

        if let Some(pos) = self.injected.iter().position(|(k, _)| *k == kind)
            && let Some((_, code)) = self.injected.remove(pos)
        {
            self.responses
                .push_back(CommandResponse::new(token, kind, code));
            return Ok(());
        }

        if kind.requires_button() && self.button == ButtonBehavior::Hold {
            self.held = Some((token, command.clone()));
            return Ok(());
        }

        let response = self.execute(token, command);
        self.responses.push_back(response);
        Ok(())
    }

    fn cancel_button_wait(&mut self) {
        self.cancel_calls += 1;
        if let Some((token, command)) = self.held.take() {
            self.responses.push_back(CommandResponse::new(
                token,
                command.kind(),
                ResultCode::ButtonPressCanceled,
            ));
        }
    }
}

const MAX_DRIVE_STEPS: usize = 100_000;

/// Feed queued responses and fire pending timers until the session goes quiet.
///
/// Timers fire immediately; simulated time does not advance. Returns the
/// number of responses handled.
pub fn run_until_idle(session: &mut DeviceSession<MockDevice>) -> Result<usize, SessionError> {
    let mut handled = 0;
    for _ in 0..MAX_DRIVE_STEPS {
        if let Some(response) = session.device_mut().next_response() {
            session.handle_response(response)?;
            handled += 1;
            continue;
        }
        match session.pending_timer() {
            Some(timer) => session.on_timer(timer.kind)?,
            None => return Ok(handled),
        }
    }
    Err(SessionError::InvariantViolation(format!(
        "mock session did not settle after {} steps",
        MAX_DRIVE_STEPS
    )))
}

//! Signet Session - the single entry point for hosts driving a device.
//!
//! The session is an event-driven reactor. Requests issue at most one
//! command and return immediately; the host feeds every device response
//! back through [`DeviceSession::handle_response`] and fires the pending
//! timer through [`DeviceSession::on_timer`]. Nothing here blocks or sleeps.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::button::PendingButtonConfirmation;
use crate::device::DeviceApi;
use crate::error::SessionError;
use crate::events::{EventBus, Operation, SessionEvent, SessionObserver, TracingObserver};
use crate::payload::FirmwareImage;
use crate::protocol::{
    BLOCK_SIZE, CONNECT_RETRY_DELAY, CommandResponse, DeviceInfo, MAX_BLOCK_ID,
    MAX_ENTRY_DATA_SIZE, RESET_SETTLE_DELAY,
};
use crate::state::handlers::{
    self, ActiveOperation, HandleResult, HandlerContext, begin_connect, handle_connection_loss,
};
use crate::state::machine::{DeviceState, Request, StateMachine};
use crate::token::{PendingCommand, TokenRegistry};
use crate::transfer::{BlockGeometry, BlockTransferJob};
use crate::update::FirmwareUpdateJob;

/// Configuration for a Signet session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bytes per storage block.
    pub block_size: usize,
    /// Highest block id; backups cover `0..=max_block_id`.
    pub max_block_id: u16,
    /// Largest encoded entry accepted by `update_entry`.
    pub max_entry_data_size: usize,
    /// Delay before re-trying to open the device.
    pub connect_retry_ms: u64,
    /// Delay between a device reset and reopening the connection.
    pub reset_settle_ms: u64,
    /// Reconnect after the device reports a disconnect.
    pub auto_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            max_block_id: MAX_BLOCK_ID,
            max_entry_data_size: MAX_ENTRY_DATA_SIZE,
            connect_retry_ms: CONNECT_RETRY_DELAY.as_millis() as u64,
            reset_settle_ms: RESET_SETTLE_DELAY.as_millis() as u64,
            auto_reconnect: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn geometry(&self) -> BlockGeometry {
        BlockGeometry {
            block_size: self.block_size,
            max_block_id: self.max_block_id,
        }
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn reset_settle_delay(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}

/// Delayed actions the host must schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Re-try opening the device connection.
    ConnectRetry,
    /// Reopen the connection after a device reset.
    ResetSettle,
}

/// A timer the host should fire with [`DeviceSession::on_timer`] after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub kind: TimerKind,
    pub delay: Duration,
}

/// Session over one device connection.
pub struct DeviceSession<D: DeviceApi> {
    config: SessionConfig,
    device: D,
    machine: StateMachine,
    tokens: TokenRegistry,
    events: EventBus,
    button: Option<PendingButtonConfirmation>,
    timer: Option<PendingTimer>,
    device_info: Option<DeviceInfo>,
    active: Option<ActiveOperation>,
    aborted: bool,
}

impl<D: DeviceApi> DeviceSession<D> {
    /// Create a session that logs events through tracing.
    pub fn new(config: SessionConfig, device: D) -> Self {
        let mut events = EventBus::new();
        events.subscribe(Arc::new(TracingObserver));
        Self {
            config,
            device,
            machine: StateMachine::new(),
            tokens: TokenRegistry::new(),
            events,
            button: None,
            timer: None,
            device_info: None,
            active: None,
            aborted: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_state(config: SessionConfig, device: D, state: DeviceState) -> Self {
        let mut session = Self::new(config, device);
        session.machine = StateMachine::with_state(state);
        session
    }

    /// Add an observer for session events.
    pub fn subscribe(&mut self, observer: Arc<dyn SessionObserver>) {
        self.events.subscribe(observer);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.machine.state()
    }

    /// Hash function and salt reported by the last startup handshake.
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    pub fn pending_timer(&self) -> Option<PendingTimer> {
        self.timer
    }

    pub fn current_operation(&self) -> Option<Operation> {
        self.active.as_ref().map(ActiveOperation::operation)
    }

    /// Command currently awaiting a response.
    pub fn outstanding(&self) -> Option<PendingCommand> {
        self.tokens.outstanding().copied()
    }

    pub fn is_awaiting_button(&self) -> bool {
        self.button.is_some()
    }

    /// A fatal protocol error ended the session.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    fn context(&mut self) -> HandlerContext<'_, D> {
        HandlerContext {
            device: &mut self.device,
            machine: &mut self.machine,
            tokens: &mut self.tokens,
            events: &self.events,
            config: &self.config,
            button: &mut self.button,
            timer: &mut self.timer,
            device_info: &mut self.device_info,
        }
    }

    /// Refuse a request before anything reaches the device.
    fn admit(&self, request: Request) -> Result<(), SessionError> {
        if self.aborted {
            return Err(SessionError::Aborted);
        }
        if let Some(active) = &self.active {
            return Err(SessionError::Busy(active.operation()));
        }
        self.machine.check(request)
    }

    fn start<F>(&mut self, request: Request, begin: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut HandlerContext<'_, D>) -> Result<ActiveOperation, SessionError>,
    {
        self.admit(request)?;
        info!(request = %request, state = %self.state(), "Request accepted");
        let result = {
            let mut ctx = self.context();
            begin(&mut ctx)
        };
        match result {
            Ok(op) => {
                self.active = Some(op);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(self.abort(e)),
            Err(e) => Err(e),
        }
    }

    /// Open the device and run the startup handshake.
    ///
    /// An open failure is not an error: the session stays in `Connecting`
    /// with a retry timer pending.
    #[instrument(skip(self))]
    pub fn connect(&mut self) -> Result<(), SessionError> {
        self.admit(Request::Connect)?;
        self.reconnect()
    }

    fn reconnect(&mut self) -> Result<(), SessionError> {
        let result = {
            let mut ctx = self.context();
            begin_connect(&mut ctx)
        };
        match result {
            Ok(op) => {
                self.active = op;
                Ok(())
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    /// Log in with a key derived from the user's password.
    #[instrument(skip(self, key))]
    pub fn login(&mut self, key: &[u8]) -> Result<(), SessionError> {
        let key = key.to_vec();
        self.start(Request::Login, |ctx| handlers::start_login(ctx, key))
    }

    #[instrument(skip(self))]
    pub fn logout(&mut self) -> Result<(), SessionError> {
        self.start(Request::Logout, |ctx| handlers::start_logout(ctx))
    }

    /// The entry layer finished loading accounts after login.
    pub fn accounts_loaded(&mut self) -> Result<(), SessionError> {
        self.admit(Request::FinishLoading)?;
        let mut ctx = self.context();
        ctx.enter(DeviceState::LoggedIn)
    }

    /// Back up every block into `destination`.
    #[instrument(skip(self), fields(path = %destination.display()))]
    pub fn backup(&mut self, destination: &Path) -> Result<(), SessionError> {
        self.start(Request::Backup, |ctx| {
            let job = BlockTransferJob::backup(destination, ctx.config.geometry())?;
            handlers::start_transfer(ctx, job)
        })
    }

    /// Restore every block from `source`. The file size is checked before
    /// the device is contacted.
    #[instrument(skip(self), fields(path = %source.display()))]
    pub fn restore(&mut self, source: &Path) -> Result<(), SessionError> {
        self.start(Request::Restore, |ctx| {
            let job = BlockTransferJob::restore(source, ctx.config.geometry())?;
            handlers::start_transfer(ctx, job)
        })
    }

    /// Erase the whole device.
    #[instrument(skip(self))]
    pub fn wipe(&mut self) -> Result<(), SessionError> {
        self.start(Request::Wipe, |ctx| handlers::start_wipe(ctx))
    }

    /// Initialize the device with a new key and its derivation parameters.
    #[instrument(skip(self, key, hashfn, salt))]
    pub fn initialize(
        &mut self,
        key: &[u8],
        hashfn: &[u8],
        salt: &[u8],
    ) -> Result<(), SessionError> {
        let (key, hashfn, salt) = (key.to_vec(), hashfn.to_vec(), salt.to_vec());
        self.start(Request::Initialize, |ctx| {
            handlers::start_initialize(ctx, key, hashfn, salt)
        })
    }

    /// Reset the device and reconnect once it settles.
    #[instrument(skip(self))]
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.start(Request::Reset, |ctx| handlers::start_reset(ctx))
    }

    /// Flash a validated firmware image.
    #[instrument(skip(self, image), fields(sections = image.sections().len()))]
    pub fn update_firmware(&mut self, image: FirmwareImage) -> Result<(), SessionError> {
        self.start(Request::UpdateFirmware, |ctx| {
            handlers::start_firmware_update(ctx, FirmwareUpdateJob::new(image))
        })
    }

    /// Parse a firmware file and flash it. Nothing is sent unless the whole
    /// file is valid.
    pub fn update_firmware_from_file(&mut self, path: &Path) -> Result<(), SessionError> {
        self.admit(Request::UpdateFirmware)?;
        let image = FirmwareImage::from_file(path)?;
        self.update_firmware(image)
    }

    /// Store an encoded entry.
    #[instrument(skip(self, data, mask), fields(len = data.len()))]
    pub fn update_entry(&mut self, id: u16, data: &[u8], mask: &[u8]) -> Result<(), SessionError> {
        let (data, mask) = (data.to_vec(), mask.to_vec());
        self.start(Request::UpdateEntry, |ctx| {
            handlers::start_update_entry(ctx, id, data, mask)
        })
    }

    /// Cancel the current button wait or transfer.
    ///
    /// Returns `true` if this call changed anything; a repeated cancel is a
    /// no-op returning `false`.
    pub fn cancel(&mut self) -> Result<bool, SessionError> {
        if self.aborted {
            return Err(SessionError::Aborted);
        }
        let mut acted = false;
        if let Some(wait) = self.button.as_mut()
            && wait.request_cancel()
        {
            info!(operation = %wait.operation, "Cancelling button wait");
            self.device.cancel_button_wait();
            acted = true;
        }
        if let Some(ActiveOperation::Transfer(job)) = self.active.as_mut()
            && job.request_cancel()
        {
            acted = true;
        }
        if !acted {
            debug!("Nothing to cancel");
        }
        Ok(acted)
    }

    /// Feed a device response into the session.
    ///
    /// Late or duplicate responses are dropped. A protocol violation aborts
    /// the session and is returned as the error.
    #[instrument(skip(self, response), fields(token = %response.token, kind = %response.kind, code = %response.code))]
    pub fn handle_response(&mut self, response: CommandResponse) -> Result<(), SessionError> {
        let token = response.token;
        if self.aborted {
            self.events.emit(SessionEvent::StaleResponse { token });
            return Ok(());
        }
        let Some(pending) = self.tokens.resolve(token) else {
            self.events.emit(SessionEvent::StaleResponse { token });
            return Ok(());
        };
        self.events.emit(SessionEvent::ResponseReceived {
            token,
            kind: response.kind,
            code: response.code,
        });

        if pending.kind != response.kind {
            let err = SessionError::malformed(
                response.kind,
                format!("answer to {} {}", pending.kind, pending.token),
            );
            return Err(self.abort(err));
        }
        if !response.kind.accepts(response.code) {
            return Err(self.abort(SessionError::UnexpectedResult {
                command: response.kind,
                code: response.code,
            }));
        }
        let Some(op) = self.active.take() else {
            return Err(self.abort(SessionError::InvariantViolation(format!(
                "{} answered with no active operation",
                response.kind
            ))));
        };

        let result = {
            let mut ctx = self.context();
            handlers::handle_response(op, &response, &mut ctx)
        };
        match result {
            Ok(HandleResult::Continue(op)) => {
                self.active = Some(op);
                Ok(())
            }
            Ok(HandleResult::Idle) => Ok(()),
            Err(e) => Err(self.abort(e)),
        }
    }

    /// Fire the pending timer. A timer that is not pending is ignored.
    pub fn on_timer(&mut self, kind: TimerKind) -> Result<(), SessionError> {
        if self.aborted {
            return Err(SessionError::Aborted);
        }
        match self.timer {
            Some(pending) if pending.kind == kind => self.timer = None,
            _ => {
                debug!(timer = ?kind, "Ignoring timer that is not pending");
                return Ok(());
            }
        }
        match (kind, self.state()) {
            (TimerKind::ConnectRetry, DeviceState::Connecting | DeviceState::Disconnected)
            | (TimerKind::ResetSettle, DeviceState::ResetPending)
                if self.active.is_none() =>
            {
                self.reconnect()
            }
            (_, state) => {
                debug!(timer = ?kind, state = %state, "Timer no longer applies");
                Ok(())
            }
        }
    }

    /// The host observed the connection closing outside any command.
    pub fn on_connection_closed(&mut self) -> Result<(), SessionError> {
        if self.aborted {
            return Ok(());
        }
        if matches!(
            self.state(),
            DeviceState::Disconnected | DeviceState::ResetPending
        ) {
            return Ok(());
        }
        let op = self.active.take();
        let result = {
            let mut ctx = self.context();
            handle_connection_loss(op, true, &mut ctx)
        };
        result.map(|_| ()).map_err(|e| self.abort(e))
    }

    /// Tear the session down after a fatal error.
    fn abort(&mut self, err: SessionError) -> SessionError {
        error!(error = %err, state = %self.state(), "Aborting session");
        self.events.emit(SessionEvent::Fatal {
            message: err.to_string(),
        });
        self.tokens.release();
        self.button = None;
        self.timer = None;
        self.active = None;
        self.device.close_connection();
        let from = self.machine.state();
        if from != DeviceState::Disconnected
            && self.machine.goto_state(DeviceState::Disconnected).is_ok()
        {
            self.events.emit(SessionEvent::StateChanged {
                from,
                to: DeviceState::Disconnected,
            });
        }
        self.aborted = true;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ButtonBehavior, MockDevice, run_until_idle};
    use crate::events::{Outcome, RecordingObserver};
    use crate::protocol::{CommandKind, ResultCode};
    use crate::token::CommandToken;
    use base64::{Engine, engine::general_purpose::STANDARD};

    fn small_config() -> SessionConfig {
        SessionConfig {
            block_size: 16,
            max_block_id: 3,
            ..Default::default()
        }
    }

    fn session_in(state: DeviceState) -> DeviceSession<MockDevice> {
        let config = small_config();
        let mut device = MockDevice::with_geometry(config.block_size, config.max_block_id);
        device.open_connection().unwrap();
        DeviceSession::with_state(config, device, state)
    }

    fn tiny_image() -> FirmwareImage {
        let json = format!(
            r#"{{"sections": {{"a": {{"lma": 134217728, "size": 4, "contents": "{}"}}}}}}"#,
            STANDARD.encode([1u8, 2, 3, 4])
        );
        FirmwareImage::from_json(json.as_bytes()).unwrap()
    }

    fn attempt(
        session: &mut DeviceSession<MockDevice>,
        request: Request,
        dir: &Path,
    ) -> Result<(), SessionError> {
        match request {
            Request::Connect => session.connect(),
            Request::Login => session.login(b"key"),
            Request::Logout => session.logout(),
            Request::FinishLoading => session.accounts_loaded(),
            Request::Backup => session.backup(&dir.join("out.bak")),
            Request::Restore => session.restore(&dir.join("in.bak")),
            Request::Wipe => session.wipe(),
            Request::Initialize => session.initialize(b"key", b"h", b"s"),
            Request::Reset => session.reset(),
            Request::UpdateFirmware => session.update_firmware(tiny_image()),
            Request::UpdateEntry => session.update_entry(1, &[0; 4], &[]),
            Request::Cancel => session.cancel().map(|_| ()),
        }
    }

    #[test]
    fn test_illegal_requests_never_reach_device() {
        let dir = tempfile::tempdir().unwrap();
        for state in DeviceState::ALL {
            for request in Request::ALL {
                if state.permits(request) {
                    continue;
                }
                let mut session = session_in(state);
                let opens = session.device().open_calls();
                let err = attempt(&mut session, request, dir.path()).unwrap_err();
                assert!(
                    matches!(err, SessionError::NotPermitted { .. }),
                    "{} in {}: {:?}",
                    request,
                    state,
                    err
                );
                assert!(session.device().issued().is_empty());
                assert_eq!(session.device().open_calls(), opens);
                assert_eq!(session.state(), state);
            }
        }
    }

    #[test]
    fn test_busy_while_operation_active() {
        let mut session = session_in(DeviceState::LoggedIn);
        session.device_mut().set_button(ButtonBehavior::Hold);
        let dir = tempfile::tempdir().unwrap();
        session.backup(&dir.path().join("out.bak")).unwrap();

        let err = session.logout().unwrap_err();
        assert!(matches!(err, SessionError::Busy(Operation::Backup)));
        assert_eq!(session.device().issued().len(), 1);
    }

    #[test]
    fn test_stale_response_ignored() {
        let mut session = session_in(DeviceState::LoggedIn);
        let recorder = Arc::new(RecordingObserver::new());
        session.subscribe(recorder.clone());
        session.logout().unwrap();

        let stale = CommandResponse::new(
            CommandToken::from_raw(999),
            CommandKind::Logout,
            ResultCode::Okay,
        );
        session.handle_response(stale).unwrap();
        assert_eq!(session.state(), DeviceState::LoggedIn);
        assert!(session.outstanding().is_some());
        assert!(
            recorder
                .events()
                .contains(&SessionEvent::StaleResponse {
                    token: CommandToken::from_raw(999)
                })
        );

        run_until_idle(&mut session).unwrap();
        assert_eq!(session.state(), DeviceState::LoggedOut);
    }

    #[test]
    fn test_unrecognized_code_aborts_session() {
        let mut session = session_in(DeviceState::LoggedIn);
        session
            .device_mut()
            .inject(CommandKind::Logout, ResultCode::BadPassword);
        session.logout().unwrap();

        let err = run_until_idle(&mut session).unwrap_err();
        assert!(err.is_fatal());
        assert!(session.is_aborted());
        assert_eq!(session.state(), DeviceState::Disconnected);
        assert!(session.outstanding().is_none());
        assert!(matches!(session.wipe(), Err(SessionError::Aborted)));
    }

    #[test]
    fn test_mismatched_kind_aborts_session() {
        let mut session = session_in(DeviceState::LoggedIn);
        session.logout().unwrap();
        let token = session.outstanding().unwrap().token;
        let err = session
            .handle_response(CommandResponse::new(
                token,
                CommandKind::Wipe,
                ResultCode::Okay,
            ))
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedResponse { .. }));
        assert!(session.is_aborted());
    }

    #[test]
    fn test_cancel_with_nothing_pending() {
        let mut session = session_in(DeviceState::LoggedOut);
        assert!(!session.cancel().unwrap());
        assert_eq!(session.device().cancel_calls(), 0);
    }

    #[test]
    fn test_unexpected_timer_ignored() {
        let mut session = session_in(DeviceState::LoggedOut);
        session.on_timer(TimerKind::ResetSettle).unwrap();
        assert_eq!(session.state(), DeviceState::LoggedOut);
        assert!(session.device().issued().is_empty());
    }

    #[test]
    fn test_entry_too_large_rejected_locally() {
        let mut session = session_in(DeviceState::LoggedIn);
        let max = session.config().max_entry_data_size;
        let err = session.update_entry(3, &vec![0; max + 1], &[]).unwrap_err();
        assert!(matches!(err, SessionError::EntryTooLarge { .. }));
        assert!(session.device().issued().is_empty());
        assert!(session.current_operation().is_none());
    }

    #[test]
    fn test_update_entry_not_enough_space() {
        let mut session = session_in(DeviceState::LoggedIn);
        let recorder = Arc::new(RecordingObserver::new());
        session.subscribe(recorder.clone());
        session
            .device_mut()
            .inject(CommandKind::UpdateEntry, ResultCode::NotEnoughSpace);
        session.update_entry(3, &[1; 32], &[0; 4]).unwrap();
        run_until_idle(&mut session).unwrap();

        assert_eq!(
            recorder.outcomes(),
            vec![(Operation::UpdateEntry, Outcome::NotEnoughSpace)]
        );
        assert_eq!(session.state(), DeviceState::LoggedIn);
    }

    #[test]
    fn test_accounts_loaded_handoff() {
        let mut session = session_in(DeviceState::LoggedInLoadingAccounts);
        session.accounts_loaded().unwrap();
        assert_eq!(session.state(), DeviceState::LoggedIn);
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signet.toml");
        let config = SessionConfig {
            connect_retry_ms: 250,
            auto_reconnect: false,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.connect_retry_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: SessionConfig = toml::from_str("max_block_id = 7").unwrap();
        assert_eq!(config.max_block_id, 7);
        assert_eq!(config.block_size, BLOCK_SIZE);
        assert!(config.auto_reconnect);
    }
}

//! Device state machine.
//!
//! [`DeviceState`] is the authoritative logical mode of the device. The
//! transition table and the request table below are the only source of
//! legality decisions; nothing else in the crate mutates the state.

use std::fmt;

use tracing::info;

use crate::error::SessionError;

/// Logical mode of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Disconnected,
    Connecting,
    Uninitialized,
    LoggedOut,
    LoggingIn,
    LoggedIn,
    LoggedInLoadingAccounts,
    BackingUp,
    Restoring,
    Wiping,
    Initializing,
    UpdatingFirmware,
    ResetPending,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Disconnected => write!(f, "DISCONNECTED"),
            DeviceState::Connecting => write!(f, "CONNECTING"),
            DeviceState::Uninitialized => write!(f, "UNINITIALIZED"),
            DeviceState::LoggedOut => write!(f, "LOGGED_OUT"),
            DeviceState::LoggingIn => write!(f, "LOGGING_IN"),
            DeviceState::LoggedIn => write!(f, "LOGGED_IN"),
            DeviceState::LoggedInLoadingAccounts => write!(f, "LOGGED_IN_LOADING_ACCOUNTS"),
            DeviceState::BackingUp => write!(f, "BACKING_UP"),
            DeviceState::Restoring => write!(f, "RESTORING"),
            DeviceState::Wiping => write!(f, "WIPING"),
            DeviceState::Initializing => write!(f, "INITIALIZING"),
            DeviceState::UpdatingFirmware => write!(f, "UPDATING_FIRMWARE"),
            DeviceState::ResetPending => write!(f, "RESET_PENDING"),
        }
    }
}

impl DeviceState {
    pub const ALL: [DeviceState; 13] = [
        DeviceState::Disconnected,
        DeviceState::Connecting,
        DeviceState::Uninitialized,
        DeviceState::LoggedOut,
        DeviceState::LoggingIn,
        DeviceState::LoggedIn,
        DeviceState::LoggedInLoadingAccounts,
        DeviceState::BackingUp,
        DeviceState::Restoring,
        DeviceState::Wiping,
        DeviceState::Initializing,
        DeviceState::UpdatingFirmware,
        DeviceState::ResetPending,
    ];

    /// Transition table.
    pub fn can_transition_to(self, to: DeviceState) -> bool {
        use DeviceState::*;
        match (self, to) {
            // Connection loss is legal from anywhere.
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connecting | Uninitialized | LoggedOut) => true,
            (
                LoggedOut,
                LoggingIn | Restoring | Wiping | Initializing | UpdatingFirmware | ResetPending,
            ) => true,
            (Uninitialized, Restoring | Initializing | UpdatingFirmware | ResetPending) => true,
            (LoggingIn, LoggedOut | LoggedInLoadingAccounts) => true,
            (LoggedInLoadingAccounts, LoggedIn) => true,
            (LoggedIn, BackingUp | LoggedOut) => true,
            (BackingUp, LoggedIn) => true,
            // Settled by a fresh startup query.
            (Restoring | Initializing, LoggedOut | Uninitialized) => true,
            (Wiping, Uninitialized) => true,
            (UpdatingFirmware, ResetPending) => true,
            (ResetPending, Connecting) => true,
            _ => false,
        }
    }

    /// Request table.
    pub fn permits(self, request: Request) -> bool {
        use DeviceState::*;
        match request {
            Request::Connect => self == Disconnected,
            Request::Login => self == LoggedOut,
            Request::Logout => self == LoggedIn,
            Request::FinishLoading => self == LoggedInLoadingAccounts,
            Request::Backup => self == LoggedIn,
            Request::Restore => matches!(self, LoggedOut | Uninitialized),
            Request::Wipe => self == LoggedOut,
            Request::Initialize => matches!(self, LoggedOut | Uninitialized),
            Request::Reset => matches!(self, LoggedOut | Uninitialized),
            Request::UpdateFirmware => matches!(self, LoggedOut | Uninitialized),
            Request::UpdateEntry => self == LoggedIn,
            Request::Cancel => true,
        }
    }

    pub fn is_logged_in(self) -> bool {
        matches!(
            self,
            DeviceState::LoggedIn | DeviceState::LoggedInLoadingAccounts | DeviceState::BackingUp
        )
    }
}

/// External requests accepted by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Connect,
    Login,
    Logout,
    FinishLoading,
    Backup,
    Restore,
    Wipe,
    Initialize,
    Reset,
    UpdateFirmware,
    UpdateEntry,
    Cancel,
}

impl Request {
    pub const ALL: [Request; 12] = [
        Request::Connect,
        Request::Login,
        Request::Logout,
        Request::FinishLoading,
        Request::Backup,
        Request::Restore,
        Request::Wipe,
        Request::Initialize,
        Request::Reset,
        Request::UpdateFirmware,
        Request::UpdateEntry,
        Request::Cancel,
    ];
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Request::Connect => "connect",
            Request::Login => "login",
            Request::Logout => "logout",
            Request::FinishLoading => "finish loading",
            Request::Backup => "backup",
            Request::Restore => "restore",
            Request::Wipe => "wipe",
            Request::Initialize => "initialize",
            Request::Reset => "reset",
            Request::UpdateFirmware => "update firmware",
            Request::UpdateEntry => "update entry",
            Request::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Owner of the current [`DeviceState`].
#[derive(Debug, Default)]
pub struct StateMachine {
    state: DeviceState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn with_state(state: DeviceState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Check a request against the current state.
    pub fn check(&self, request: Request) -> Result<(), SessionError> {
        if self.state.permits(request) {
            Ok(())
        } else {
            Err(SessionError::NotPermitted {
                request,
                state: self.state,
            })
        }
    }

    /// Transition to a new state, returning the previous one.
    pub fn goto_state(&mut self, to: DeviceState) -> Result<DeviceState, SessionError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(SessionError::IllegalTransition { from, to });
        }
        info!(from = %from, to = %to, "State transition");
        self.state = to;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        assert_eq!(StateMachine::new().state(), DeviceState::Disconnected);
    }

    #[test]
    fn test_login_path() {
        let mut machine = StateMachine::new();
        for to in [
            DeviceState::Connecting,
            DeviceState::LoggedOut,
            DeviceState::LoggingIn,
            DeviceState::LoggedInLoadingAccounts,
            DeviceState::LoggedIn,
            DeviceState::BackingUp,
            DeviceState::LoggedIn,
        ] {
            machine.goto_state(to).unwrap();
        }
        assert_eq!(machine.state(), DeviceState::LoggedIn);
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let mut machine = StateMachine::with_state(DeviceState::LoggedOut);
        let err = machine.goto_state(DeviceState::BackingUp).unwrap_err();
        assert!(matches!(err, SessionError::IllegalTransition { .. }));
        assert_eq!(machine.state(), DeviceState::LoggedOut);
    }

    #[test]
    fn test_every_state_can_disconnect() {
        for state in DeviceState::ALL {
            assert!(state.can_transition_to(DeviceState::Disconnected));
        }
    }

    #[test]
    fn test_firmware_update_path() {
        let mut machine = StateMachine::with_state(DeviceState::Uninitialized);
        machine.goto_state(DeviceState::UpdatingFirmware).unwrap();
        machine.goto_state(DeviceState::ResetPending).unwrap();
        machine.goto_state(DeviceState::Connecting).unwrap();
        machine.goto_state(DeviceState::Connecting).unwrap();
    }

    #[test]
    fn test_request_table() {
        assert!(DeviceState::LoggedIn.permits(Request::Backup));
        assert!(!DeviceState::LoggedOut.permits(Request::Backup));
        assert!(DeviceState::Uninitialized.permits(Request::Restore));
        assert!(!DeviceState::LoggedIn.permits(Request::Restore));
        assert!(DeviceState::LoggedOut.permits(Request::Wipe));
        assert!(!DeviceState::Uninitialized.permits(Request::Wipe));
        assert!(DeviceState::Disconnected.permits(Request::Connect));
        assert!(!DeviceState::Connecting.permits(Request::Connect));
        for state in DeviceState::ALL {
            assert!(state.permits(Request::Cancel));
        }
    }

    #[test]
    fn test_check_reports_state() {
        let machine = StateMachine::with_state(DeviceState::Wiping);
        match machine.check(Request::Login) {
            Err(SessionError::NotPermitted { request, state }) => {
                assert_eq!(request, Request::Login);
                assert_eq!(state, DeviceState::Wiping);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}

//! Event system for UI decoupling.
//!
//! Presentation layers (desktop UI, CLI, tests) subscribe to session events
//! without the core knowing anything about rendering.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::button::ButtonOutcome;
use crate::protocol::{CommandKind, ResultCode};
use crate::state::DeviceState;
use crate::token::CommandToken;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Logical operations driven by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Startup,
    Login,
    Logout,
    Backup,
    Restore,
    Wipe,
    Initialize,
    FirmwareUpdate,
    ResetDevice,
    UpdateEntry,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Startup => write!(f, "Startup"),
            Operation::Login => write!(f, "Login"),
            Operation::Logout => write!(f, "Logout"),
            Operation::Backup => write!(f, "Backup"),
            Operation::Restore => write!(f, "Restore"),
            Operation::Wipe => write!(f, "Wipe"),
            Operation::Initialize => write!(f, "Initialize"),
            Operation::FirmwareUpdate => write!(f, "Firmware Update"),
            Operation::ResetDevice => write!(f, "Reset Device"),
            Operation::UpdateEntry => write!(f, "Update Entry"),
        }
    }
}

/// How an operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// User cancelled or let the button confirmation time out.
    Declined(ButtonOutcome),
    BadPassword,
    /// Entry does not fit on the device.
    NotEnoughSpace,
    /// Stopped on request; the device session was closed cleanly.
    Cancelled,
    /// Local failure (file I/O); the device session was closed cleanly.
    Failed(String),
    /// Connection lost mid-operation.
    Incomplete,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed)
    }

    /// Failures the user can fix and retry.
    pub fn is_soft_failure(&self) -> bool {
        matches!(
            self,
            Outcome::Declined(_) | Outcome::BadPassword | Outcome::NotEnoughSpace
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Declined(button) => write!(f, "declined ({})", button),
            Outcome::BadPassword => write!(f, "incorrect password"),
            Outcome::NotEnoughSpace => {
                write!(f, "entry too large; remove some data and try again")
            }
            Outcome::Cancelled => write!(f, "cancelled"),
            Outcome::Failed(message) => write!(f, "failed: {}", message),
            Outcome::Incomplete => write!(f, "incomplete (device disconnected)"),
        }
    }
}

/// Events emitted by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Device state changed (self-transitions included).
    StateChanged { from: DeviceState, to: DeviceState },
    /// Progress update for the current operation.
    Progress {
        operation: Operation,
        current: u64,
        total: u64,
    },
    /// Device is waiting for the user to press its button.
    ButtonWaitStarted { operation: Operation },
    /// Button wait resolved.
    ButtonWaitEnded {
        operation: Operation,
        outcome: ButtonOutcome,
    },
    /// An operation ended.
    OperationFinished {
        operation: Operation,
        outcome: Outcome,
    },
    /// Command sent to the device.
    CommandIssued {
        token: CommandToken,
        kind: CommandKind,
    },
    /// Response consumed by the session.
    ResponseReceived {
        token: CommandToken,
        kind: CommandKind,
        code: ResultCode,
    },
    /// Late or duplicate response, ignored.
    StaleResponse { token: CommandToken },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Fatal protocol error; the host must terminate the session.
    Fatal { message: String },
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait SessionObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &SessionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_event(&self, _event: &SessionEvent) {}
}

/// Observer that keeps every event, for tests and embedding hosts.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events seen so far.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Outcomes of finished operations, in order.
    pub fn outcomes(&self) -> Vec<(Operation, Outcome)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::OperationFinished { operation, outcome } => {
                    Some((operation, outcome))
                }
                _ => None,
            })
            .collect()
    }

    /// Sequence of states entered.
    pub fn states(&self) -> Vec<DeviceState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl SessionObserver for RecordingObserver {
    fn on_event(&self, event: &SessionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Device state changed");
            }
            SessionEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            SessionEvent::ButtonWaitStarted { operation } => {
                tracing::info!(operation = %operation, "Press the device button to confirm");
            }
            SessionEvent::ButtonWaitEnded { operation, outcome } => {
                tracing::info!(operation = %operation, outcome = %outcome, "Button wait ended");
            }
            SessionEvent::OperationFinished { operation, outcome } => {
                if outcome.is_success() {
                    tracing::info!(operation = %operation, "Operation completed");
                } else {
                    tracing::warn!(operation = %operation, outcome = %outcome, "Operation did not complete");
                }
            }
            SessionEvent::CommandIssued { token, kind } => {
                tracing::trace!(token = %token, kind = %kind, "Command issued");
            }
            SessionEvent::ResponseReceived { token, kind, code } => {
                tracing::trace!(token = %token, kind = %kind, code = %code, "Response received");
            }
            SessionEvent::StaleResponse { token } => {
                tracing::debug!(token = %token, "Stale response dropped");
            }
            SessionEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            SessionEvent::Fatal { message } => {
                tracing::error!("Fatal: {}", message);
            }
        }
    }
}

/// Fan-out of events to all subscribers.
#[derive(Default, Clone)]
pub struct EventBus {
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn emit(&self, event: SessionEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Log {
            level,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_fans_out() {
        let first = Arc::new(RecordingObserver::new());
        let second = Arc::new(RecordingObserver::new());
        let mut bus = EventBus::new();
        bus.subscribe(first.clone());
        bus.subscribe(second.clone());
        bus.subscribe(Arc::new(NullObserver));

        bus.emit(SessionEvent::StateChanged {
            from: DeviceState::Disconnected,
            to: DeviceState::Connecting,
        });
        bus.log(LogLevel::Info, "hello");

        assert_eq!(first.events().len(), 2);
        assert_eq!(second.states(), vec![DeviceState::Connecting]);
    }

    #[test]
    fn test_outcome_classification() {
        assert!(Outcome::BadPassword.is_soft_failure());
        assert!(Outcome::Declined(ButtonOutcome::TimedOut).is_soft_failure());
        assert!(!Outcome::Incomplete.is_soft_failure());
        assert!(Outcome::NotEnoughSpace.to_string().contains("too large"));
    }
}

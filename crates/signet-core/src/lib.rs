//! Signet-Core: host-side session controller for Signet hardware password tokens.
//!
//! This crate owns the device's logical state, correlates asynchronous
//! command responses with the operation that issued them, and drives the
//! multi-step protocols (backup, restore, wipe, firmware update) one
//! response at a time.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Command vocabulary, result codes, constants
//! - **Device**: Device command API abstraction (plus a scripted mock)
//! - **Token**: Single-slot command token registry
//! - **State**: Device state machine and response handlers
//! - **Transfer / Update**: Backup/restore and firmware update orchestrators
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: The facade hosts talk to
//!
//! # Example
//!
//! ```no_run
//! use signet_core::device::{MockDevice, run_until_idle};
//! use signet_core::session::{DeviceSession, SessionConfig};
//!
//! let mut session = DeviceSession::new(SessionConfig::default(), MockDevice::new());
//! session.connect()?;
//! run_until_idle(&mut session)?;
//! session.login(b"correct horse")?;
//! run_until_idle(&mut session)?;
//! # Ok::<(), signet_core::SessionError>(())
//! ```

pub mod button;
pub mod device;
pub mod error;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod token;
pub mod transfer;
pub mod update;

// Re-exports for convenience
pub use button::{ButtonOutcome, PendingButtonConfirmation};
pub use device::{DeviceApi, DeviceError, MockDevice};
pub use error::SessionError;
pub use events::{
    EventBus, LogLevel, NullObserver, Operation, Outcome, RecordingObserver, SessionEvent,
    SessionObserver, TracingObserver,
};
pub use payload::{FirmwareError, FirmwareImage, FirmwareSection, FirmwareWriteCursor};
pub use protocol::{Command, CommandKind, CommandResponse, ResponsePayload, ResultCode};
pub use session::{DeviceSession, PendingTimer, SessionConfig, TimerKind};
pub use state::{DeviceState, Request};
pub use token::{CommandToken, TokenRegistry};
pub use transfer::{BlockGeometry, BlockTransferJob, TransferError};
pub use update::FirmwareUpdateJob;

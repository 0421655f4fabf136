//! Device command API module.

pub mod mock;
pub mod traits;

pub use mock::{ButtonBehavior, MockDevice, run_until_idle};
pub use traits::{DeviceApi, DeviceError};

//! Terminal front ends used by the binaries.

mod device_selector;
mod error;
mod monitor;

pub use device_selector::device_selector;
pub use error::TuiError;
pub use monitor::{monitor_until_keypress, MonitorState};

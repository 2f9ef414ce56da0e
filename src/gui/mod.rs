mod dashboard;
mod device_selector;
mod error;

pub use dashboard::dashboard;
pub use device_selector::{device_selector, PortChoice};
pub use error::GazeGuiError;

//! Environmental inputs that gate zone demand.

pub mod presence;
pub mod window;

pub use presence::{PresenceDetector, PresenceState};
pub use window::{WindowDetector, WindowState};

pub mod controller;
pub mod state;

pub use controller::{SessionController, SessionOptions};
pub use state::{Session, SessionEvent, SessionState, DEFAULT_SIGNAL_QUALITY};

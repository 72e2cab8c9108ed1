//! Background worker threads.

pub mod mode_listener;

pub use mode_listener::{ModeListener, WorkerHandle};

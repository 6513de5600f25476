//! Streaming session lifecycle

pub mod engine;
pub mod state;

pub use engine::{SessionDeps, SessionEngine};
pub use state::SessionState;

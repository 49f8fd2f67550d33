//! Error types for cartcall-session

use thiserror::Error;

use crate::machine::Phase;

/// Result type alias using cartcall-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the session control surface
#[derive(Error, Debug)]
pub enum Error {
    /// `start_call` while a call is still live
    #[error("A call is already in progress (phase: {0})")]
    CallInProgress(Phase),

    /// `cancel_call` outside of `Connecting`
    #[error("No call is connecting (phase: {0})")]
    NotConnecting(Phase),

    /// The orchestrator task is gone
    #[error("Session orchestrator has shut down")]
    Closed,
}

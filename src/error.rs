// Error taxonomy for pipeline construction and dispatch recording.
//
// Recoverable errors surface synchronously from constructors or `run`
// before any dispatch is recorded. Once a dispatch is recorded only device
// loss remains, which wgpu reports through its own channels.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WrsError {
    /// Invalid configuration combination, rejected at construction.
    #[error("invalid config: {0}")]
    Config(String),

    /// Input exceeds what the configured pipeline can process, rejected at `run`.
    #[error("capacity exceeded: {what} = {got} but the configured maximum is {max}")]
    Capacity {
        what: &'static str,
        got: u64,
        max: u64,
    },

    /// The device lacks a capability this pipeline requires.
    #[error("missing device feature: {0}")]
    Feature(String),

    /// A state combination that should be impossible. Not recoverable.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// No usable adapter/device could be acquired.
    #[error("device acquisition failed: {0}")]
    NoDevice(String),
}

pub type Result<T, E = WrsError> = std::result::Result<T, E>;

impl WrsError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        WrsError::Config(msg.into())
    }

    pub(crate) fn feature(msg: impl Into<String>) -> Self {
        WrsError::Feature(msg.into())
    }
}

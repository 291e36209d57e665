//! Bridge errors

use thiserror::Error;

/// Errors raised by the shared linear memory.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("address range {addr:#x}+{len} out of bounds (memory is {size} bytes)")]
    OutOfBounds { addr: u32, len: u32, size: usize },

    #[error("cannot grow memory past {max_pages} pages")]
    OutOfMemory { max_pages: u32 },
}

/// Errors raised while installing a code unit into the shared table.
///
/// A load that fails with any of these leaves the table length unchanged.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("missing code unit magic")]
    BadMagic,

    #[error("unsupported code unit version {0}")]
    UnsupportedVersion(u8),

    #[error("truncated code unit")]
    Truncated,

    #[error("unexpected trailing bytes in code unit")]
    TrailingGarbage,

    #[error("invalid opcode {0:#04x} in code unit")]
    InvalidOpcode(u8),

    #[error("call target {target} out of range (table would have {limit} entries)")]
    InvalidCallTarget { target: u32, limit: u32 },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors raised by a bound host function during a named call.
///
/// These never escape the dispatcher: sync failures are logged and absorbed,
/// async failures become a zero success flag on the VM stack.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("stack underflow in host call")]
    StackUnderflow,

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl CallError {
    /// Create a failure with a custom message
    pub fn failed(message: impl Into<String>) -> Self {
        CallError::Failed(message.into())
    }
}

//! The VM seam
//!
//! The embedded stack machine is opaque to the bridge: it sits behind the
//! `Vm` trait, which exposes exactly the low-level ABI the bridge consumes
//! (stack access, the run entrypoint and the error accessor). Host services
//! the VM consumes during a run (character I/O, input refill, dynamic
//! loading and named calls) are supplied through the `Host` trait, passed
//! to `run` the same way on every invocation.
//!
//! Any conforming implementation can stand behind `Vm`; this crate ships
//! `crate::machine::Machine` as its reference implementation.

use thiserror::Error;

use crate::error::LoadError;
use crate::shared::SharedEnv;

/// The VM's cell type: one 32-bit stack slot
pub type Cell = i32;

/// Canonical true flag on the VM stack
pub const TRUE: Cell = -1;

/// Canonical false flag on the VM stack
pub const FALSE: Cell = 0;

/// Abnormal termination signal raised by a VM run.
///
/// Deliberately opaque: the categorized status behind it is read through
/// `Vm::error`, so control exits and genuine faults travel the same path.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct VmTrap(pub String);

impl VmTrap {
    pub fn new(message: impl Into<String>) -> Self {
        VmTrap(message.into())
    }
}

/// Stack and marshalling primitives of the VM.
///
/// This is the part of the ABI host functions may use while the VM is
/// quiesced during a named call.
pub trait VmAccess {
    /// Push a value onto the data stack
    fn push(&mut self, value: Cell);

    /// Pop the top of the data stack, `None` when empty
    fn pop(&mut self) -> Option<Cell>;

    /// The VM's current data-space pointer
    fn here(&self) -> Cell;
}

/// Host services consumed by the VM during a run
pub trait Host {
    /// Emit one byte of character output
    fn emit(&mut self, byte: u8);

    /// Fill `dest` with the next chunk of source text. Returns the number of
    /// bytes written; 0 means the input is exhausted.
    fn read(&mut self, dest: &mut [u8]) -> usize;

    /// Read one byte of keyboard input
    fn key(&mut self) -> u8;

    /// Install the code unit at `offset`/`length` in shared memory into the
    /// shared table
    fn load(&mut self, env: &mut SharedEnv, offset: u32, length: u32) -> Result<(), LoadError>;

    /// Dispatch a named call. The name's (addr, len) pair is on the VM stack.
    fn call(&mut self, vm: &mut dyn VmAccess, env: &mut SharedEnv);
}

/// The embedded VM behind its fixed low-level ABI
pub trait Vm: VmAccess {
    /// Run the interpretation loop until input drains or a control condition
    /// fires. A normal return carries the VM's own status code; an abnormal
    /// signal is raised as a trap and categorized through `error`.
    fn run(&mut self, env: &mut SharedEnv, host: &mut dyn Host, silent: bool)
    -> Result<Cell, VmTrap>;

    /// Status code of the most recent termination
    fn error(&self) -> Cell;
}

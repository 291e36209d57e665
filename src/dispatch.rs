//! Foreign call dispatch
//!
//! The name registry and the handle a bound host function receives while the
//! VM is quiesced inside a named call. The dispatch itself lives in the
//! session's host state (`crate::session`), which owns the registry and the
//! pending-completion queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::PAD_OFFSET;
use crate::error::CallError;
use crate::memory::Memory;
use crate::session::InputBuffer;
use crate::shared::SharedEnv;
use crate::vm::{Cell, VmAccess};

/// Future returned by an async binding. Resolves to the cells to push under
/// the success flag when the VM is resumed.
pub type HostFuture = Pin<Box<dyn Future<Output = Result<Vec<Cell>, CallError>>>>;

/// A synchronous host function
pub type SyncHostFn = Box<dyn FnMut(&mut Caller<'_>) -> Result<(), CallError>>;

/// An asynchronous host function: pops its arguments synchronously, then
/// returns the future performing the host-side work
pub type AsyncHostFn = Box<dyn FnMut(&mut Caller<'_>) -> Result<HostFuture, CallError>>;

/// A registered host function
pub enum Binding {
    Sync(SyncHostFn),
    Async(AsyncHostFn),
}

/// Name -> host function registry, owned by the session.
///
/// Names are unique; rebinding a name replaces the previous function.
/// Bindings are never removed.
#[derive(Default)]
pub struct Registry {
    fns: HashMap<String, Binding>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            fns: HashMap::new(),
        }
    }

    /// Insert a binding under `name`; last bind wins
    pub fn insert(&mut self, name: impl Into<String>, binding: Binding) {
        self.fns.insert(name.into(), binding);
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.fns.get_mut(name)
    }
}

/// Handle to the quiesced VM, passed to bound host functions.
///
/// Exposes the VM's stack primitives, the (addr, len) string marshalling
/// convention over shared memory, and input-buffer append for functions that
/// feed source back into the interpreter.
pub struct Caller<'a> {
    vm: &'a mut dyn VmAccess,
    env: &'a mut SharedEnv,
    input: &'a mut InputBuffer,
}

impl<'a> Caller<'a> {
    pub(crate) fn new(
        vm: &'a mut dyn VmAccess,
        env: &'a mut SharedEnv,
        input: &'a mut InputBuffer,
    ) -> Self {
        Caller { vm, env, input }
    }

    /// Push a value onto the VM stack
    pub fn push(&mut self, value: Cell) {
        self.vm.push(value);
    }

    /// Pop the top of the VM stack
    pub fn pop(&mut self) -> Result<Cell, CallError> {
        self.vm.pop().ok_or(CallError::StackUnderflow)
    }

    /// The VM's current data-space pointer
    pub fn here(&self) -> Cell {
        self.vm.here()
    }

    /// Pop an (addr, len) pair and decode it as text
    pub fn pop_string(&mut self) -> Result<String, CallError> {
        let len = self.pop()?;
        let addr = self.pop()?;
        Ok(self.env.memory.load_string(addr as u32, len as u32)?)
    }

    /// Write `s` into the transient region past the data-space pointer and
    /// push its (addr, len) pair. Returns the address written.
    pub fn push_string(&mut self, s: &str) -> Result<Cell, CallError> {
        let addr = self.vm.here() + PAD_OFFSET;
        let len = self.env.memory.save_string(s, addr as u32)?;
        self.push(addr);
        self.push(len as Cell);
        Ok(addr)
    }

    /// The shared linear memory
    pub fn memory(&self) -> &Memory {
        &self.env.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.env.memory
    }

    /// Queue `text` into the input buffer, to be interpreted after the
    /// input already buffered. A trailing newline is forced so the queued
    /// source cannot fuse with whatever is queued next.
    pub fn feed(&mut self, text: &str) {
        self.input.push_line(text);
    }
}

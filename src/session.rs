//! Interpreter session
//!
//! Owns the VM, the shared memory/table substrate, the input buffer, the
//! name registry and the async runtime, and wires them together into the
//! host side of the bridge: `interpret`/`read` feed source text in,
//! `bind`/`bind_async` extend the VM's vocabulary with host functions, and
//! the session's host state services the VM's emit/read/key/load/call
//! imports during a run.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use tracing::error;

use crate::PAD_OFFSET;
use crate::alloc::Allocator;
use crate::dispatch::{Binding, Caller, HostFuture, Registry};
use crate::error::{CallError, LoadError};
use crate::loader::{self, LoaderCaps};
use crate::machine::Machine;
use crate::memory::{Memory, MemoryConfig};
use crate::shared::SharedEnv;
use crate::status::Status;
use crate::vm::{Cell, FALSE, Host, TRUE, Vm, VmAccess};

/// Session-wide configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    pub memory: MemoryConfig,
}

/// Queue of source bytes not yet consumed by the VM.
///
/// Only the VM's read callback dequeues, one line at a time (or everything
/// left, if no newline is present).
pub struct InputBuffer {
    bytes: Vec<u8>,
}

impl InputBuffer {
    pub fn new() -> Self {
        InputBuffer { bytes: Vec::new() }
    }

    pub fn push(&mut self, text: &str) {
        self.bytes.extend_from_slice(text.as_bytes());
    }

    /// Append `text`, forcing a trailing newline so the VM never blocks
    /// waiting for the end of a line that will not come
    pub fn push_line(&mut self, text: &str) {
        self.push(text);
        if !text.ends_with('\n') {
            self.bytes.push(b'\n');
        }
    }

    /// Dequeue up to one line into `dest`, returning the byte count.
    /// A line longer than `dest` is delivered across successive calls.
    pub fn fill(&mut self, dest: &mut [u8]) -> usize {
        if self.bytes.is_empty() {
            return 0;
        }
        let line_end = match self.bytes.iter().position(|&b| b == b'\n') {
            Some(i) => i + 1,
            None => self.bytes.len(),
        };
        let n = line_end.min(dest.len());
        dest[..n].copy_from_slice(&self.bytes[..n]);
        self.bytes.drain(..n);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// An async foreign call waiting to be settled after the run loop returns
struct PendingCall {
    name: String,
    token: Cell,
    future: HostFuture,
}

/// The session's implementation of the VM's host imports
struct HostState {
    input: InputBuffer,
    registry: Registry,
    on_emit: Box<dyn FnMut(u8)>,
    key_source: Box<dyn FnMut() -> u8>,
    caps: LoaderCaps,
    pending: VecDeque<PendingCall>,
}

impl Host for HostState {
    fn emit(&mut self, byte: u8) {
        (self.on_emit)(byte);
    }

    fn read(&mut self, dest: &mut [u8]) -> usize {
        self.input.fill(dest)
    }

    fn key(&mut self) -> u8 {
        (self.key_source)()
    }

    fn load(&mut self, env: &mut SharedEnv, offset: u32, length: u32) -> Result<(), LoadError> {
        loader::load(env, &self.caps, offset, length).map(|_| ())
    }

    fn call(&mut self, vm: &mut dyn VmAccess, env: &mut SharedEnv) {
        self.dispatch(vm, env);
    }
}

impl HostState {
    /// Resolve and invoke a named call. The VM has pushed the name's
    /// (addr, len) pair; an unresolved name is a soft failure: one
    /// diagnostic, no replacement values, and the session continues.
    fn dispatch(&mut self, vm: &mut dyn VmAccess, env: &mut SharedEnv) {
        let (Some(len), Some(addr)) = (vm.pop(), vm.pop()) else {
            error!("named call without a name on the stack");
            return;
        };
        let name = match env.memory.load_string(addr as u32, len as u32) {
            Ok(name) => name,
            Err(e) => {
                error!("named call with unreadable name: {e}");
                return;
            }
        };

        match self.registry.get_mut(&name) {
            None => error!("unbound host call: {name}"),
            Some(Binding::Sync(f)) => {
                let mut caller = Caller::new(vm, env, &mut self.input);
                if let Err(e) = f(&mut caller) {
                    error!("host call {name} failed: {e}");
                }
            }
            Some(Binding::Async(f)) => {
                // by convention the VM pushed an execution token right
                // before issuing the call
                let Some(token) = vm.pop() else {
                    error!("async host call {name}: missing continuation token");
                    return;
                };
                let mut caller = Caller::new(vm, env, &mut self.input);
                let future = match f(&mut caller) {
                    Ok(future) => future,
                    // the token is already ours; fail through the normal
                    // resume path so it is still triggered exactly once
                    Err(e) => {
                        let failed: HostFuture = Box::pin(async move { Err(e) });
                        failed
                    }
                };
                self.pending.push_back(PendingCall {
                    name,
                    token,
                    future,
                });
            }
        }
    }
}

/// One live interpreter: a VM instance plus the host bridge around it
pub struct Session {
    vm: Box<dyn Vm>,
    env: SharedEnv,
    host: HostState,
    runtime: tokio::runtime::Runtime,
}

impl Session {
    /// Create a session around the reference machine
    pub fn new(config: SessionConfig) -> io::Result<Self> {
        Self::with_vm(config, |env| Box::new(Machine::boot(env)))
    }

    /// Create a session around a custom VM implementation.
    ///
    /// The factory receives the freshly created shared environment so the
    /// VM can seed the dispatch table with its own words.
    pub fn with_vm(
        config: SessionConfig,
        vm: impl FnOnce(&mut SharedEnv) -> Box<dyn Vm>,
    ) -> io::Result<Self> {
        let mut env = SharedEnv::new(&config.memory);
        let caps = LoaderCaps::detect(&env.memory);
        let vm = vm(&mut env);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        Ok(Session {
            vm,
            env,
            host: HostState {
                input: InputBuffer::new(),
                registry: Registry::new(),
                on_emit: Box::new(default_emit),
                key_source: Box::new(|| 0),
                caps,
                pending: VecDeque::new(),
            },
            runtime,
        })
    }

    /// Append `text` to the input buffer and run the VM over it.
    ///
    /// Returns the status of this run; control exits are ordinary results,
    /// only uncategorized faults are logged.
    pub fn interpret(&mut self, text: &str, silent: bool) -> Status {
        let status = self.run_text(text, silent);
        self.settle_pending();
        status
    }

    /// Append `text` to the input buffer without starting the interpreter,
    /// for producers preloading input ahead of a later `interpret`
    pub fn read(&mut self, text: &str) {
        self.host.input.push(text);
    }

    /// Bind a synchronous host function under `name`.
    ///
    /// A named call for `name` invokes `f` with a handle to the quiesced VM;
    /// `f` pops its arguments and pushes its results there. Rebinding a name
    /// replaces the previous function.
    pub fn bind<F>(&mut self, name: &str, f: F)
    where
        F: FnMut(&mut Caller<'_>) -> Result<(), CallError> + 'static,
    {
        self.host.registry.insert(name, Binding::Sync(Box::new(f)));
    }

    /// Bind an asynchronous host function under `name`.
    ///
    /// The VM must push an execution token immediately before issuing the
    /// named call. `f` pops its arguments synchronously and returns the
    /// future doing the host-side work; once it completes the VM resumes
    /// exactly once through that token, with a success flag on top of the
    /// future's result cells.
    pub fn bind_async<F>(&mut self, name: &str, f: F)
    where
        F: FnMut(&mut Caller<'_>) -> Result<HostFuture, CallError> + 'static,
    {
        self.host.registry.insert(name, Binding::Async(Box::new(f)));
    }

    /// Replace the byte-level output handler
    pub fn set_emit(&mut self, f: impl FnMut(u8) + 'static) {
        self.host.on_emit = Box::new(f);
    }

    /// Replace the keyboard input source
    pub fn set_key(&mut self, f: impl FnMut() -> u8 + 'static) {
        self.host.key_source = Box::new(f);
    }

    /// Install the code unit at `offset`/`length` in shared memory,
    /// returning the execution token of its first word
    pub fn load(&mut self, offset: u32, length: u32) -> Result<u32, LoadError> {
        loader::load(&mut self.env, &self.host.caps, offset, length)
    }

    /// Push a value onto the VM stack
    pub fn push(&mut self, value: Cell) {
        self.vm.push(value);
    }

    /// Pop the top of the VM stack
    pub fn pop(&mut self) -> Option<Cell> {
        self.vm.pop()
    }

    /// The VM's current data-space pointer
    pub fn here(&self) -> Cell {
        self.vm.here()
    }

    /// Write `s` into the transient region past the data-space pointer and
    /// push its (addr, len) pair
    pub fn push_string(&mut self, s: &str) -> Result<Cell, CallError> {
        let addr = self.vm.here() + PAD_OFFSET;
        let len = self.env.memory.save_string(s, addr as u32)?;
        self.vm.push(addr);
        self.vm.push(len as Cell);
        Ok(addr)
    }

    /// Pop an (addr, len) pair off the VM stack and decode it as text
    pub fn pop_string(&mut self) -> Result<String, CallError> {
        let len = self.vm.pop().ok_or(CallError::StackUnderflow)?;
        let addr = self.vm.pop().ok_or(CallError::StackUnderflow)?;
        Ok(self.env.memory.load_string(addr as u32, len as u32)?)
    }

    /// The shared memory/table substrate
    pub fn env(&self) -> &SharedEnv {
        &self.env
    }

    /// The shared linear memory
    pub fn memory(&self) -> &Memory {
        &self.env.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.env.memory
    }

    /// Bind `ALLOCATE` / `FREE` over a heap managed in the region above the
    /// session's initial memory, and define the interpreter-side words that
    /// reach them through named calls
    pub fn bind_memory_words(&mut self) {
        let base = self.env.memory.size() as u32;
        let alloc = Rc::new(RefCell::new(Allocator::new(base)));

        let a = Rc::clone(&alloc);
        self.bind("ALLOCATE", move |caller| {
            let size = caller.pop()?;
            let size =
                u32::try_from(size).map_err(|_| CallError::failed("negative allocation size"))?;
            let addr = a.borrow_mut().allocate(caller.memory_mut(), size)?;
            caller.push(addr as Cell);
            Ok(())
        });
        self.bind("FREE", move |caller| {
            let addr = caller.pop()?;
            let ior = alloc.borrow_mut().free(addr as u32);
            caller.push(ior);
            Ok(())
        });

        let _ = self.interpret(
            ": ALLOCATE S\" ALLOCATE\" SCALL ; : FREE S\" FREE\" SCALL ;",
            true,
        );
    }

    /// Bind the file words over a caller-supplied include callback.
    ///
    /// `INCLUDED` queues the resolved source into the input buffer;
    /// `OPEN-FILE` resolves the name and discards the handle.
    pub fn bind_file_words<F>(&mut self, include: F)
    where
        F: FnMut(&str) -> Result<String, CallError> + 'static,
    {
        let include = Rc::new(RefCell::new(include));

        let inc = Rc::clone(&include);
        self.bind("INCLUDED", move |caller| {
            let name = caller.pop_string()?;
            let source = (inc.borrow_mut())(&name)?;
            caller.feed(&source);
            Ok(())
        });
        self.bind("OPEN-FILE", move |caller| {
            let _mode = caller.pop()?;
            let name = caller.pop_string()?;
            let _ = (include.borrow_mut())(&name)?;
            Ok(())
        });

        let _ = self.interpret(": INCLUDED S\" INCLUDED\" SCALL ;", true);
    }

    fn run_text(&mut self, text: &str, silent: bool) -> Status {
        self.host.input.push_line(text);
        match self.vm.run(&mut self.env, &mut self.host, silent) {
            Ok(code) => Status::from_code(code).unwrap_or(Status::Unknown),
            Err(trap) => {
                let status = Status::from_code(self.vm.error()).unwrap_or(Status::Unknown);
                if status == Status::Unknown {
                    error!("vm fault: {trap}");
                }
                status
            }
        }
    }

    /// Settle async completions queued during the last run, in the order
    /// the VM issued the calls. Completions queued by a resumed
    /// continuation are settled by the same loop.
    fn settle_pending(&mut self) {
        while let Some(call) = self.host.pending.pop_front() {
            self.resume(call);
        }
    }

    /// Drive one async completion and splice its result back into the VM
    fn resume(&mut self, call: PendingCall) {
        let PendingCall {
            name,
            token,
            future,
        } = call;

        // fires on every exit path, so the VM resumes exactly once no
        // matter how the future ends
        struct ResumeGuard<'a> {
            session: &'a mut Session,
            token: Cell,
            flag: Cell,
            results: Vec<Cell>,
        }

        impl Drop for ResumeGuard<'_> {
            fn drop(&mut self) {
                for value in self.results.drain(..) {
                    self.session.vm.push(value);
                }
                self.session.vm.push(self.flag);
                self.session.vm.push(self.token);
                let _ = self.session.run_text("EXECUTE", true);
            }
        }

        let mut guard = ResumeGuard {
            session: self,
            token,
            flag: FALSE,
            results: Vec::new(),
        };
        match guard.session.runtime.block_on(future) {
            Ok(values) => {
                guard.results = values;
                guard.flag = TRUE;
            }
            Err(e) => error!("async host call {name} failed: {e}"),
        }
    }
}

fn default_emit(byte: u8) {
    use std::io::Write as _;
    let _ = io::stdout().write_all(std::slice::from_ref(&byte));
}

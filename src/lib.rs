//! Host shell around an embedded stack-machine VM.
//!
//! The VM itself (its arithmetic, dictionary search, number parsing and
//! control-flow compilation) is an opaque collaborator behind the `Vm`
//! trait. This crate is the bridge that makes it usable from a host
//! process: feeding it source text, reassembling its byte-at-a-time
//! character output, extending its vocabulary with host functions (sync or
//! async), and dynamically linking new compiled code units into the running
//! instance.
//!
//! # Architecture
//!
//! - **Shared substrate**: one linear memory and one dispatch table per
//!   session, shared by the VM, the allocator and every loaded code unit
//! - **Sessions**: a `Session` owns the VM, the input buffer, the name
//!   registry and the async runtime; `interpret` drives the VM's run loop
//!   and maps its termination into a `Status`
//! - **Named calls**: the VM reaches host functions through a string name
//!   popped off its own stack; unresolved names are soft failures
//! - **Async continuations**: an async binding captures an execution token
//!   from the stack and the session resumes the VM through it exactly once,
//!   after the host-side future settles
//! - **Dynamic loading**: code units staged in shared memory are validated
//!   and appended to the dispatch table, all or nothing
//!
//! # Example
//!
//! ```
//! use vmshell::{Session, SessionConfig};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut session = Session::new(SessionConfig::default())?;
//! session.bind("HOST-ADD", |caller| {
//!     let b = caller.pop()?;
//!     let a = caller.pop()?;
//!     caller.push(a + b);
//!     Ok(())
//! });
//! session.interpret(": HOST-ADD S\" HOST-ADD\" SCALL ;", true);
//! let status = session.interpret("1 2 HOST-ADD .", true);
//! assert!(status.is_success());
//! # Ok(())
//! # }
//! ```

pub mod alloc;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod machine;
pub mod memory;
pub mod session;
pub mod shared;
pub mod status;
pub mod table;
pub mod textbuf;
pub mod unit;
pub mod vm;

pub use alloc::Allocator;
pub use dispatch::{AsyncHostFn, Binding, Caller, HostFuture, Registry, SyncHostFn};
pub use error::{CallError, LoadError, MemoryError};
pub use loader::LoaderCaps;
pub use machine::Machine;
pub use memory::{Memory, MemoryConfig, PAGE_SIZE};
pub use session::{InputBuffer, Session, SessionConfig};
pub use shared::SharedEnv;
pub use status::Status;
pub use table::DispatchTable;
pub use textbuf::{CharAssembler, LineAssembler, TextHandler};
pub use unit::{CodeBlock, CodeUnit, Op, UNIT_MAGIC, UNIT_VERSION};
pub use vm::{Cell, FALSE, Host, TRUE, Vm, VmAccess, VmTrap};

/// Offset past the data-space pointer where transient strings are staged
/// when crossing the VM boundary
pub const PAD_OFFSET: Cell = 400;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::cell::{Cell as StdCell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    fn test_session() -> (Session, Rc<RefCell<Vec<u8>>>) {
        let config = SessionConfig {
            memory: MemoryConfig {
                initial_pages: 16,
                max_pages: 32,
            },
        };
        let mut session = Session::new(config).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&out);
        session.set_emit(move |byte| sink.borrow_mut().push(byte));
        (session, out)
    }

    fn emitted(out: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&out.borrow()).into_owned()
    }

    // ===== Concrete Scenarios =====

    #[test]
    fn test_arithmetic_emits_result_and_succeeds() {
        let (mut session, out) = test_session();
        let status = session.interpret("1 2 + .", true);
        assert_eq!(status, Status::EndOfInput);
        assert!(status.is_success());
        assert_eq!(emitted(&out), "3 ");
    }

    #[test]
    fn test_invalid_load_is_fatal_and_leaves_table_unchanged() {
        let (mut session, _) = test_session();
        let before = session.env().table.len();
        session.memory_mut().write(0x2000, b"garbage!").unwrap();
        assert!(session.load(0x2000, 8).is_err());
        assert_eq!(session.env().table.len(), before);
    }

    #[test]
    fn test_bye_returns_bye_status() {
        let (mut session, out) = test_session();
        let status = session.interpret("BYE", true);
        assert_eq!(status, Status::Bye);
        assert!(status.is_success());
        assert_eq!(emitted(&out), "");
    }

    #[test]
    fn test_unbound_named_call_is_soft() {
        let (mut session, out) = test_session();
        let status = session.interpret("7 S\" NOPE\" SCALL .", true);
        // execution continues past the failed lookup with the stack as the
        // lookup left it
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "7 ");
    }

    // ===== Foreign Call Dispatch =====

    #[test]
    fn test_bind_round_trip() {
        let (mut session, out) = test_session();
        let calls = Rc::new(StdCell::new(0));
        let counter = Rc::clone(&calls);
        session.bind("ECHO", move |caller| {
            counter.set(counter.get() + 1);
            let value = caller.pop()?;
            caller.push(value * 2);
            Ok(())
        });
        session.interpret(": ECHO S\" ECHO\" SCALL ;", true);

        let status = session.interpret("21 ECHO .", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(calls.get(), 1);
        assert_eq!(emitted(&out), "42 ");
        // net stack effect is exactly the binding's pops and pushes
        assert_eq!(session.pop(), None);
    }

    #[test]
    fn test_rebinding_a_name_replaces_it() {
        let (mut session, out) = test_session();
        session.bind("WHICH", |caller| {
            caller.push(1);
            Ok(())
        });
        session.bind("WHICH", |caller| {
            caller.push(2);
            Ok(())
        });
        session.interpret("S\" WHICH\" SCALL .", true);
        assert_eq!(emitted(&out), "2 ");
    }

    #[test]
    fn test_failing_sync_binding_is_absorbed() {
        let (mut session, out) = test_session();
        session.bind("BAD", |_caller| Err(CallError::failed("nope")));
        let status = session.interpret("S\" BAD\" SCALL 1 .", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "1 ");
    }

    #[test]
    fn test_binding_can_feed_source() {
        let (mut session, out) = test_session();
        session.bind("INJECT", |caller| {
            caller.feed("40 2 + .");
            Ok(())
        });
        let status = session.interpret("S\" INJECT\" SCALL", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "42 ");
    }

    // ===== Async Continuation Bridge =====

    #[test]
    fn test_async_success_pushes_results_then_flag() {
        let (mut session, out) = test_session();
        session.bind_async("XDOUBLE", |caller| {
            let value = caller.pop()?;
            let future: HostFuture = Box::pin(async move { Ok(vec![value * 2]) });
            Ok(future)
        });
        session.interpret(": ON-DONE . . ;", true);

        let status = session.interpret("21 ' ON-DONE S\" XDOUBLE\" SCALL", true);
        assert_eq!(status, Status::EndOfInput);
        // the continuation sees the success flag on top of the result
        assert_eq!(emitted(&out), "-1 42 ");
        assert_eq!(session.pop(), None);
    }

    #[test]
    fn test_async_failure_resumes_with_zero_flag() {
        let (mut session, out) = test_session();
        session.bind_async("DOOMED", |_caller| {
            let future: HostFuture = Box::pin(async { Err(CallError::failed("boom")) });
            Ok(future)
        });
        session.interpret(": ON-DONE . ;", true);

        let status = session.interpret("' ON-DONE S\" DOOMED\" SCALL", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "0 ");
        assert_eq!(session.pop(), None);
    }

    #[test]
    fn test_async_early_error_still_resumes_exactly_once() {
        let (mut session, out) = test_session();
        // pops an argument that is not there, so the binding fails before
        // producing a future
        session.bind_async("NEEDS-ARG", |caller| {
            let value = caller.pop()?;
            let future: HostFuture = Box::pin(async move { Ok(vec![value]) });
            Ok(future)
        });
        session.interpret(": ON-DONE . ;", true);

        let status = session.interpret("' ON-DONE S\" NEEDS-ARG\" SCALL", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "0 ");
        assert_eq!(session.pop(), None);
    }

    #[test]
    fn test_async_with_real_timer() {
        let (mut session, out) = test_session();
        session.bind_async("NAP", |_caller| {
            let future: HostFuture = Box::pin(async {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(vec![7])
            });
            Ok(future)
        });
        session.interpret(": ON-DONE . . ;", true);

        let status = session.interpret("' ON-DONE S\" NAP\" SCALL", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "-1 7 ");
    }

    #[test]
    fn test_timeout_inside_binding_surfaces_as_failure() {
        let (mut session, out) = test_session();
        session.bind_async("STALL", |_caller| {
            let future: HostFuture = Box::pin(async {
                let slow = tokio::time::sleep(Duration::from_secs(3600));
                match tokio::time::timeout(Duration::from_millis(2), slow).await {
                    Ok(()) => Ok(vec![]),
                    Err(_) => Err(CallError::failed("timed out")),
                }
            });
            Ok(future)
        });
        session.interpret(": ON-DONE . ;", true);

        let status = session.interpret("' ON-DONE S\" STALL\" SCALL", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "0 ");
    }

    #[test]
    fn test_continuation_may_issue_another_async_call() {
        let (mut session, out) = test_session();
        session.bind_async("NAP", |_caller| {
            let future: HostFuture = Box::pin(async { Ok(vec![7]) });
            Ok(future)
        });
        session.interpret(": STEP2 . . ;", true);
        session.interpret(": STEP1 DROP ' STEP2 S\" NAP\" SCALL ;", true);

        let status = session.interpret("' STEP1 S\" NAP\" SCALL", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "-1 7 ");
        // first completion's result is still on the stack, second's was
        // consumed by STEP2
        assert_eq!(session.pop(), Some(7));
        assert_eq!(session.pop(), None);
    }

    // ===== Dynamic Loading =====

    #[test]
    fn test_loaded_unit_is_executable_by_token() {
        let (mut session, out) = test_session();
        session.interpret("' .", true);
        let dot = session.pop().unwrap() as u32;

        let unit = CodeUnit::new(vec![CodeBlock::new(vec![Op::Lit(42), Op::Call(dot)])]);
        let bytes = unit.encode();
        session.memory_mut().write(0x8000, &bytes).unwrap();
        let token = session.load(0x8000, bytes.len() as u32).unwrap();

        session.push(token as Cell);
        let status = session.interpret("EXECUTE", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "42 ");
    }

    #[test]
    fn test_colon_definition_grows_table() {
        let (mut session, _) = test_session();
        let before = session.env().table.len();
        session.interpret(": TRIPLE DUP DUP + + ;", true);
        assert_eq!(session.env().table.len(), before + 1);
    }

    // ===== Supplemented Words =====

    #[test]
    fn test_memory_words() {
        let (mut session, out) = test_session();
        session.bind_memory_words();

        let heap_base = session.memory().size() as Cell;
        let status = session.interpret("64 ALLOCATE", true);
        assert_eq!(status, Status::EndOfInput);
        let addr = session.pop().unwrap();
        assert_eq!(addr, heap_base);

        session.push(addr);
        session.interpret("FREE .", true);
        assert_eq!(emitted(&out), "0 ");
    }

    #[test]
    fn test_included_queues_source() {
        let (mut session, out) = test_session();
        session.bind_file_words(|name| {
            if name == "lib.fs" {
                Ok(": TRIPLE DUP DUP + + ;".to_string())
            } else {
                Err(CallError::failed(format!("no such file: {name}")))
            }
        });

        let status = session.interpret("S\" lib.fs\" INCLUDED", true);
        assert_eq!(status, Status::EndOfInput);
        session.interpret("5 TRIPLE .", true);
        assert_eq!(emitted(&out), "15 ");
    }

    #[test]
    fn test_open_file_discards_handle() {
        let (mut session, _) = test_session();
        let opened = Rc::new(StdCell::new(false));
        let flag = Rc::clone(&opened);
        session.bind_file_words(move |_name| {
            flag.set(true);
            Ok(String::new())
        });

        let status = session.interpret("S\" lib.fs\" 0 S\" OPEN-FILE\" SCALL", true);
        assert_eq!(status, Status::EndOfInput);
        assert!(opened.get());
        // nothing pushed back: the handle is discarded
        assert_eq!(session.pop(), None);
    }

    // ===== Session Plumbing =====

    #[test]
    fn test_string_marshalling_round_trip() {
        let (mut session, _) = test_session();
        session.push_string("héllo").unwrap();
        assert_eq!(session.pop_string().unwrap(), "héllo");
    }

    #[test]
    fn test_read_preloads_without_running() {
        let (mut session, out) = test_session();
        session.read("2 3 +\n");
        assert_eq!(emitted(&out), "");
        let status = session.interpret(".", true);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), "5 ");
    }

    #[test]
    fn test_non_silent_run_echoes_ok() {
        let (mut session, out) = test_session();
        let status = session.interpret("1 2 +", false);
        assert_eq!(status, Status::EndOfInput);
        assert_eq!(emitted(&out), " ok\n");
    }

    #[test]
    fn test_fault_statuses() {
        let (mut session, out) = test_session();
        assert_eq!(session.interpret("1 0 /", true), Status::Unknown);
        assert_eq!(session.interpret("QUIT", true), Status::Quit);
        assert_eq!(session.interpret("ABORT", true), Status::Abort);
        assert_eq!(session.interpret("NO-SUCH-WORD", true), Status::Abort);
        // the session survives all of the above
        assert_eq!(session.interpret("1 1 + .", true), Status::EndOfInput);
        assert!(emitted(&out).ends_with("2 "));
    }

    #[test]
    fn test_custom_key_source() {
        let (mut session, out) = test_session();
        let keys = Rc::new(RefCell::new(vec![b'!', b'y']));
        let source = Rc::clone(&keys);
        session.set_key(move || source.borrow_mut().pop().unwrap_or(0));
        session.interpret("KEY EMIT KEY EMIT", true);
        assert_eq!(emitted(&out), "y!");
    }

    #[test]
    fn test_emit_through_character_assembler() {
        let (mut session, _) = test_session();
        let chars = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&chars);
        let mut assembler =
            CharAssembler::new(Box::new(move |c| sink.borrow_mut().push(c.to_string())));
        session.set_emit(move |byte| assembler.accept(byte));

        session.interpret("19990 EMIT 33 EMIT", true);
        assert_eq!(*chars.borrow(), vec!["世".to_string(), "!".to_string()]);
    }
}

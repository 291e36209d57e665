use crate::vm::Cell;

/// Termination status of a VM run.
///
/// Every status except `Unknown` and `Abort` is an ordinary control exit:
/// the VM stopped on purpose and the session may keep feeding it input.
/// `Unknown` marks an uncategorized internal fault.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Uncategorized fault inside the VM
    Unknown = 1,

    /// The QUIT word was executed
    Quit = 2,

    /// The ABORT word was executed (or an abort-class error occurred)
    Abort = 3,

    /// The input buffer drained
    EndOfInput = 4,

    /// The BYE word was executed
    Bye = 5,
}

impl Status {
    /// Try to map a raw VM status code to a `Status`
    pub fn from_code(code: Cell) -> Option<Self> {
        match code {
            1 => Some(Status::Unknown),
            2 => Some(Status::Quit),
            3 => Some(Status::Abort),
            4 => Some(Status::EndOfInput),
            5 => Some(Status::Bye),
            _ => None,
        }
    }

    /// The raw code for this status, as the VM reports it
    pub fn code(self) -> Cell {
        self as Cell
    }

    /// Whether this status counts as a successful run
    pub fn is_success(self) -> bool {
        !matches!(self, Status::Unknown | Status::Abort)
    }
}

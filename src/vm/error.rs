// Lightweight execution signal - only one byte.
// The thrown value itself lives in the VM's exception slot; the fatal
// message lives in the VM's fatal_message.

/// How the interpreter unwinds the Rust call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// A Croc exception is in flight (value in the VM exception slot).
    Exception,
    /// The thread was marked for halting; uncatchable by user code.
    Halt,
    /// A coroutine yielded (transfer values in the thread).
    Yield,
    /// The VM is no longer usable (e.g. finalizable cycle).
    Fatal,
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Exception => write!(f, "exception"),
            ExecError::Halt => write!(f, "halt"),
            ExecError::Yield => write!(f, "yield"),
            ExecError::Fatal => write!(f, "fatal vm error"),
        }
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

//! Trap codes.
//!
//! A trap is fatal to the invocation that raised it and surfaces to the
//! embedder; it is distinct from in-band results like `DROPPED` or a
//! `CANCELLED` copy, which flow back to guest code as ordinary values.
//!
//! Traps travel as the error of an `anyhow::Result` with the `Trap` code as
//! the root cause, so embedders and tests can recover the code with
//! `err.downcast_ref::<Trap>()`.

use anyhow::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Trap {
    #[error("out of bounds memory access")]
    MemoryOutOfBounds,
    #[error("misaligned pointer")]
    MisalignedPointer,
    #[error("invalid discriminant for variant")]
    InvalidDiscriminant,
    #[error("invalid boolean value")]
    InvalidBool,
    #[error("invalid char value")]
    InvalidChar,
    #[error("integer out of range for target type")]
    IntegerOutOfRange,
    #[error("invalid string encoding")]
    InvalidStringEncoding,
    #[error("string or list too long")]
    LengthOverflow,
    #[error("invalid set bits in flags")]
    InvalidFlagBits,
    #[error("unknown handle index")]
    UnknownHandleIndex,
    #[error("handle has wrong type")]
    HandleTypeMismatch,
    #[error("handle table full")]
    TableFull,
    #[error("resource still has outstanding loans")]
    OutstandingLoans,
    #[error("borrow handles outstanding at end of call")]
    BorrowsOutstanding,
    #[error("cannot enter component instance")]
    CannotEnter,
    #[error("cannot leave component instance")]
    CannotLeave,
    #[error("task did not return a value before exiting")]
    NoReturnValue,
    #[error("task already returned")]
    AlreadyReturned,
    #[error("task.return type or options mismatch")]
    ReturnMismatch,
    #[error("subtask has not resolved")]
    SubtaskNotResolved,
    #[error("cancellation has not been requested")]
    CancellationNotRequested,
    #[error("wait on an empty waitable set can never complete")]
    EmptyWaitableSet,
    #[error("waitable set still has members")]
    WaitableSetNotEmpty,
    #[error("copy already in progress for this stream or future end")]
    CopyInProgress,
    #[error("no copy in progress for this stream or future end")]
    NoCopyInProgress,
    #[error("stream or future end dropped with an outstanding copy")]
    DroppedWithPendingCopy,
    #[error("future has already been written")]
    FutureAlreadyWritten,
    #[error("future has already been read")]
    FutureAlreadyRead,
    #[error("backpressure counter out of range")]
    BackpressureOverflow,
    #[error("context-local storage index out of range")]
    ContextOutOfRange,
    #[error("no runnable thread can make progress")]
    Deadlock,
    #[error("realloc returned an invalid pointer")]
    BadRealloc,
}

impl Trap {
    pub(crate) fn err(self) -> Error {
        Error::new(self)
    }
}

/// `trap_if!(cond, Trap::...)` raises the given trap when `cond` holds.
macro_rules! trap_if {
    ($cond:expr, $trap:expr) => {
        if $cond {
            return Err($trap.err());
        }
    };
}
pub(crate) use trap_if;

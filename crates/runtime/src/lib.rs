//! Canonical ABI runtime: value lifting and lowering between component-level
//! values and core scalar values or linear memory, plus the cooperative task
//! runtime behind the asynchronous canonical builtins (tasks, subtasks,
//! waitable sets, streams, futures, and resource tables).
//!
//! The embedder supplies linear memory, `realloc`, and optional
//! `post_return`/`callback` hooks through [`CanonicalOptions`]; guest core
//! functions are closures over flat values that call back into the [`canon`]
//! builtins. A [`Store`] owns every instance and drives all of their tasks
//! on a single-threaded cooperative run loop.

pub mod canon;
pub mod flat;
pub mod memory;
mod options;
mod resources;
mod store;
mod streams;
mod strings;
mod table;
mod task;
mod trap;
mod values;
mod waitable;

pub use canon_abi_types as types;

pub use memory::{load, store, CANONICAL_FLOAT32_NAN, CANONICAL_FLOAT64_NAN};
pub use options::{
    CallbackFn, CanonicalOptions, CoreFn, LiftLowerCx, Memory, PostReturnFn, ReallocFn,
    StringEncoding,
};
pub use resources::DtorFn;
pub use store::{InstanceFlags, InstanceId, PipeId, Store, TaskCx, TaskId};
pub use streams::{host_read, host_write, CopyResult, Side};
pub use strings::{MAX_STRING_BYTE_LENGTH, UTF16_TAG};
pub use task::{Callee, OnResolve, OnStart, SubtaskState, TaskState};
pub use trap::Trap;
pub use values::{
    BorrowTransfer, CoreValue, CoreValueIter, EndTransfer, ErrorContextTransfer, FlatValues,
    OwnTransfer, Val, WasmStr,
};
pub use waitable::EventCode;

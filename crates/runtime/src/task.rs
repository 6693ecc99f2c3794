//! Tasks and subtasks.
//!
//! A `Task` is one lifted invocation running in a component instance; a
//! `Subtask` is the caller's table-resident view of a lowered call. The two
//! state machines are linked: transitions of the callee task surface as
//! events on the caller's subtask handle.

use crate::options::CanonicalOptions;
use crate::store::{InstanceId, Store, TaskId, ThreadId};
use crate::table::TableEntry;
use crate::values::Val;
use anyhow::Result;
use canon_abi_types::FuncType;
use std::rc::Rc;

/// Slots of context-local storage per task.
pub const CONTEXT_LENGTH: usize = 1;

/// Lifecycle of a lifted task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Initial,
    /// Waiting out backpressure, queue order, or instance exclusivity.
    Starting,
    Started,
    /// Cancellation was requested by the caller and has surfaced; the task
    /// must finish with `task.return` or `task.cancel`.
    PendingCancel,
    Returned,
    CancelledBeforeStarted,
    Cancelled,
}

impl TaskState {
    pub fn resolved(&self) -> bool {
        matches!(
            self,
            TaskState::Returned | TaskState::CancelledBeforeStarted | TaskState::Cancelled
        )
    }
}

/// Subtask states as the caller observes them, in wire encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SubtaskState {
    Starting = 0,
    Started = 1,
    Returned = 2,
    CancelledBeforeStarted = 3,
    CancelledBeforeReturned = 4,
}

impl SubtaskState {
    pub fn resolved(&self) -> bool {
        !matches!(self, SubtaskState::Starting | SubtaskState::Started)
    }
}

/// Produces the caller's lifted arguments when the callee actually starts.
/// Receives the callee task so lent handles can be tied to its resolution.
pub type OnStart = Box<dyn FnOnce(&Store, TaskId) -> Result<Vec<Val>>>;

/// Consumes the callee's results at resolution; `None` means the callee was
/// cancelled without returning.
pub type OnResolve = Box<dyn FnOnce(&Store, Option<Vec<Val>>) -> Result<()>>;

/// A callable callee: a lifted guest export or a host function. Invoking it
/// creates the callee task and runs it until its first suspension.
pub type Callee = Rc<dyn Fn(&Store, Option<TaskId>, OnStart, OnResolve) -> Result<TaskId>>;

pub(crate) struct TaskData {
    pub instance: InstanceId,
    pub opts: Option<Rc<CanonicalOptions>>,
    pub ft: Option<Rc<FuncType>>,
    pub state: TaskState,
    pub thread: Option<ThreadId>,
    /// Weak parent link for cancellation propagation; a task id lookup,
    /// never an owning edge.
    pub caller: Option<TaskId>,
    pub on_resolve: Option<OnResolve>,
    pub cancel_requested: bool,
    pub cancel_delivered: bool,
    pub context: [u32; CONTEXT_LENGTH],
    /// Live borrow handles lowered into this task's call scope.
    pub num_borrows: u32,
    /// Caller-side handles lent across this call, released at resolution.
    pub lenders: Vec<(InstanceId, u32)>,
    /// The caller-side subtask entry observing this task, if any.
    pub watcher: Option<(InstanceId, u32)>,
    /// Sync-lifted and callback-mode tasks serialize on the instance.
    pub needs_exclusive: bool,
}

impl TaskData {
    pub fn new(instance: InstanceId, caller: Option<TaskId>, on_resolve: OnResolve) -> TaskData {
        TaskData {
            instance,
            opts: None,
            ft: None,
            state: TaskState::Initial,
            thread: None,
            caller,
            on_resolve: Some(on_resolve),
            cancel_requested: false,
            cancel_delivered: false,
            context: [0; CONTEXT_LENGTH],
            num_borrows: 0,
            lenders: Vec::new(),
            watcher: None,
            needs_exclusive: false,
        }
    }
}

/// The caller's table entry for a lowered call in flight.
pub(crate) struct SubtaskData {
    pub task: TaskId,
    pub set: Option<u32>,
    pub event_pending: bool,
}

/// Maps the callee task's state onto what its caller observes.
pub(crate) fn subtask_state(store: &crate::store::StoreInner, task: TaskId) -> SubtaskState {
    match store.task(task).state {
        TaskState::Initial | TaskState::Starting => SubtaskState::Starting,
        TaskState::Started | TaskState::PendingCancel => SubtaskState::Started,
        TaskState::Returned => SubtaskState::Returned,
        TaskState::CancelledBeforeStarted => SubtaskState::CancelledBeforeStarted,
        TaskState::Cancelled => SubtaskState::CancelledBeforeReturned,
    }
}

pub(crate) enum Resolution {
    Returned(Vec<Val>),
    Cancelled,
}

/// Resolves a task: fixes its terminal state, hands results to the caller's
/// `on_resolve`, releases lent handles, and raises the subtask event.
pub(crate) fn resolve_task(store: &Store, task: TaskId, results: Option<Vec<Val>>) -> Result<()> {
    let resolution = match results {
        Some(vs) => Resolution::Returned(vs),
        None => Resolution::Cancelled,
    };
    let (on_resolve, results) = {
        let mut inner = store.borrow_mut();
        let t = inner.task_mut(task);
        debug_assert!(!t.state.resolved());
        let results = match resolution {
            Resolution::Returned(vs) => {
                t.state = TaskState::Returned;
                Some(vs)
            }
            Resolution::Cancelled => {
                t.state = match t.state {
                    TaskState::Initial | TaskState::Starting => TaskState::CancelledBeforeStarted,
                    _ => TaskState::Cancelled,
                };
                None
            }
        };
        t.cancel_requested = false;
        let on_resolve = t.on_resolve.take();
        let lenders = std::mem::take(&mut t.lenders);
        for (inst, idx) in lenders {
            if let Ok(TableEntry::Resource(h)) = inner.instance_mut(inst).table.get_mut(idx) {
                h.release_lend();
            }
        }
        (on_resolve, results)
    };
    log::trace!("task {task:?} resolved");
    // Lowering results into the caller happens with no store borrow held.
    if let Some(on_resolve) = on_resolve {
        on_resolve(store, results)?;
    }
    notify_watcher(store, task);
    Ok(())
}

/// Raises (or re-raises) the pending event on the subtask entry watching
/// `task`, if one exists. The payload is computed at consumption time from
/// the task's then-current state, so a `STARTED` that was never observed is
/// naturally superseded by the terminal state.
pub(crate) fn notify_watcher(store: &Store, task: TaskId) {
    let mut inner = store.borrow_mut();
    let Some((inst, idx)) = inner.task(task).watcher else {
        return;
    };
    if let Ok(TableEntry::Subtask(s)) = inner.instance_mut(inst).table.get_mut(idx) {
        s.event_pending = true;
    }
}

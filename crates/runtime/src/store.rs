//! The store: owner of every instance, task, thread, and pipe, and the
//! single-threaded cooperative run loop that drives them.
//!
//! Guest continuations are plain futures polled by the store itself with a
//! no-op waker; readiness is tracked by per-thread wait predicates evaluated
//! each tick, never by wakers. Concurrency is interleaving of resumptions,
//! never parallelism.

use crate::options::CanonicalOptions;
use crate::streams::PipeState;
use crate::table::Table;
use crate::task::{TaskData, TaskState};
use crate::trap::Trap;
use anyhow::Result;
use bitflags::bitflags;
use futures::future::LocalBoxFuture;
use futures::task::noop_waker;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(pub(crate) u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThreadId(pub(crate) u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipeId(pub(crate) u32);

bitflags! {
    /// Per-instance reentrancy conditions.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct InstanceFlags: u8 {
        /// New tasks may start in this instance. Cleared while a
        /// synchronously-lifted task is live.
        const MAY_ENTER = 0b01;
        /// Calls may leave this instance. Cleared around lifting/lowering
        /// that could reenter it.
        const MAY_LEAVE = 0b10;
    }
}

pub(crate) struct InstanceData {
    pub table: Table,
    pub flags: InstanceFlags,
    /// Explicit backpressure counter; entry is gated while non-zero.
    pub backpressure: u32,
    /// Task currently holding exclusive core-code access (sync-lifted and
    /// callback-mode tasks take this while executing).
    pub exclusive: Option<TaskId>,
    /// Tasks waiting to move STARTING -> STARTED, in arrival order.
    pub pending: VecDeque<TaskId>,
}

pub(crate) type ThreadFuture = LocalBoxFuture<'static, Result<()>>;

pub(crate) type WaitPredicate = Rc<dyn Fn(&StoreInner) -> bool>;

pub(crate) enum ThreadState {
    Runnable,
    Suspended(WaitPredicate),
    Done,
}

pub(crate) struct ThreadData {
    pub task: Option<TaskId>,
    pub future: Option<ThreadFuture>,
    pub state: ThreadState,
}

pub struct StoreInner {
    pub(crate) instances: Vec<InstanceData>,
    pub(crate) tasks: Vec<TaskData>,
    pub(crate) threads: Vec<ThreadData>,
    pub(crate) pipes: Vec<PipeState>,
    pub(crate) resource_types: Vec<crate::resources::ResourceTypeData>,
    fatal: Option<anyhow::Error>,
}

/// A cheaply clonable handle on the store. All runtime state hangs off of
/// one of these; guest futures capture clones.
#[derive(Clone)]
pub struct Store {
    inner: Rc<RefCell<StoreInner>>,
}

impl Default for Store {
    fn default() -> Store {
        Store::new()
    }
}

impl Store {
    pub fn new() -> Store {
        Store {
            inner: Rc::new(RefCell::new(StoreInner {
                instances: Vec::new(),
                tasks: Vec::new(),
                threads: Vec::new(),
                pipes: Vec::new(),
                resource_types: Vec::new(),
                fatal: None,
            })),
        }
    }

    pub(crate) fn borrow(&self) -> Ref<'_, StoreInner> {
        self.inner.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, StoreInner> {
        self.inner.borrow_mut()
    }

    pub fn add_instance(&self) -> InstanceId {
        let mut inner = self.borrow_mut();
        let id = InstanceId(inner.instances.len() as u32);
        inner.instances.push(InstanceData {
            table: Table::new(),
            flags: InstanceFlags::MAY_ENTER | InstanceFlags::MAY_LEAVE,
            backpressure: 0,
            exclusive: None,
            pending: VecDeque::new(),
        });
        id
    }

    /// Embedder-level backpressure control; guest code uses
    /// `canon::backpressure_inc`/`dec`.
    pub fn set_backpressure(&self, instance: InstanceId, on: bool) {
        self.borrow_mut().instance_mut(instance).backpressure = on as u32;
    }

    pub(crate) fn spawn(&self, task: Option<TaskId>, future: ThreadFuture) -> ThreadId {
        let mut inner = self.borrow_mut();
        let id = ThreadId(inner.threads.len() as u32);
        inner.threads.push(ThreadData {
            task,
            future: Some(future),
            state: ThreadState::Runnable,
        });
        if let Some(task) = task {
            inner.task_mut(task).thread = Some(id);
        }
        log::trace!("spawned thread {id:?} for task {task:?}");
        id
    }

    /// Polls one thread once. A trap raised by the thread is returned to the
    /// poller (the run loop, or the builtin that started the thread inline).
    pub(crate) fn poll_thread(&self, tid: ThreadId) -> Result<()> {
        let mut fut = {
            let mut inner = self.borrow_mut();
            let t = inner.thread_mut(tid);
            match t.future.take() {
                Some(f) => {
                    t.state = ThreadState::Runnable;
                    f
                }
                None => return Ok(()),
            }
        };
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let result = fut.as_mut().poll(&mut cx);
        let mut inner = self.borrow_mut();
        let t = inner.thread_mut(tid);
        match result {
            Poll::Pending => {
                t.future = Some(fut);
                // The suspension point registered a predicate; a future that
                // returned Pending without one stays runnable.
                Ok(())
            }
            Poll::Ready(Ok(())) => {
                t.state = ThreadState::Done;
                log::trace!("thread {tid:?} finished");
                Ok(())
            }
            Poll::Ready(Err(e)) => {
                t.state = ThreadState::Done;
                log::debug!("thread {tid:?} trapped: {e:#}");
                Err(e)
            }
        }
    }

    pub(crate) fn record_fatal(&self, e: anyhow::Error) {
        let mut inner = self.borrow_mut();
        if inner.fatal.is_none() {
            inner.fatal = Some(e);
        }
    }

    /// Advances every thread that can run, once each, in thread order.
    /// Returns whether any thread was polled.
    pub fn tick(&self) -> Result<bool> {
        let n = self.borrow().threads.len();
        let mut progressed = false;
        for i in 0..n {
            let tid = ThreadId(i as u32);
            if self.borrow().fatal.is_some() {
                break;
            }
            let ready = {
                let inner = self.borrow();
                match &inner.threads[i].state {
                    ThreadState::Runnable => inner.threads[i].future.is_some(),
                    ThreadState::Suspended(pred) => pred(&inner),
                    ThreadState::Done => false,
                }
            };
            if ready {
                progressed = true;
                if let Err(e) = self.poll_thread(tid) {
                    self.record_fatal(e);
                }
            }
        }
        // Newly spawned threads run next tick; count them as progress so the
        // loop doesn't declare deadlock under their feet.
        progressed |= self.borrow().threads.len() > n;
        if let Some(e) = self.borrow_mut().fatal.take() {
            return Err(e);
        }
        Ok(progressed)
    }

    /// Drives the run loop until the given task's thread has exited. Traps
    /// with a deadlock when no thread can make progress first.
    pub fn run_until_done(&self, task: TaskId) -> Result<()> {
        loop {
            if self.task_thread_done(task) {
                return Ok(());
            }
            let progressed = self.tick()?;
            if !progressed {
                if self.task_thread_done(task) {
                    return Ok(());
                }
                return Err(Trap::Deadlock.err());
            }
        }
    }

    /// Runs until no thread can make progress. Used by embedders pumping
    /// host-side work between calls.
    pub fn run_until_quiescent(&self) -> Result<()> {
        while self.tick()? {}
        Ok(())
    }

    fn task_thread_done(&self, task: TaskId) -> bool {
        let inner = self.borrow();
        match inner.task(task).thread {
            Some(tid) => matches!(inner.threads[tid.0 as usize].state, ThreadState::Done),
            None => true,
        }
    }

    pub fn task_state(&self, task: TaskId) -> TaskState {
        self.borrow().task(task).state
    }

    pub(crate) fn suspend_until(
        &self,
        thread: ThreadId,
        pred: WaitPredicate,
    ) -> SuspendUntil {
        SuspendUntil {
            store: self.clone(),
            thread,
            pred,
        }
    }
}

impl StoreInner {
    pub(crate) fn instance(&self, id: InstanceId) -> &InstanceData {
        &self.instances[id.0 as usize]
    }

    pub(crate) fn instance_mut(&mut self, id: InstanceId) -> &mut InstanceData {
        &mut self.instances[id.0 as usize]
    }

    pub(crate) fn task(&self, id: TaskId) -> &TaskData {
        &self.tasks[id.0 as usize]
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> &mut TaskData {
        &mut self.tasks[id.0 as usize]
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> &mut ThreadData {
        &mut self.threads[id.0 as usize]
    }

    pub(crate) fn thread_done(&self, id: ThreadId) -> bool {
        matches!(self.threads[id.0 as usize].state, ThreadState::Done)
    }

    pub(crate) fn add_task(&mut self, task: TaskData) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(task);
        id
    }
}

/// Suspends the current thread until a predicate over store state holds.
/// Completes immediately (without suspending) when it already holds.
pub(crate) struct SuspendUntil {
    store: Store,
    thread: ThreadId,
    pred: WaitPredicate,
}

impl Future for SuspendUntil {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let ready = {
            let inner = self.store.borrow();
            (self.pred)(&inner)
        };
        if ready {
            Poll::Ready(())
        } else {
            let mut inner = self.store.borrow_mut();
            let pred = self.pred.clone();
            inner.thread_mut(self.thread).state = ThreadState::Suspended(pred);
            Poll::Pending
        }
    }
}

/// Suspends the current thread for one scheduler pass.
pub(crate) struct YieldNow {
    store: Store,
    thread: ThreadId,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        let mut inner = self.store.borrow_mut();
        inner.thread_mut(self.thread).state = ThreadState::Suspended(Rc::new(|_| true));
        Poll::Pending
    }
}

/// The identity of the currently running guest activation: the store, the
/// task it belongs to, and the thread driving it. Guest core functions and
/// host task bodies receive one of these and pass it to every builtin.
#[derive(Clone)]
pub struct TaskCx {
    pub store: Store,
    pub task: TaskId,
    pub(crate) thread: ThreadId,
}

impl TaskCx {
    pub(crate) fn new(store: &Store, task: TaskId, thread: ThreadId) -> TaskCx {
        TaskCx {
            store: store.clone(),
            task,
            thread,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.store.borrow().task(self.task).instance
    }

    pub fn opts(&self) -> Option<Rc<CanonicalOptions>> {
        self.store.borrow().task(self.task).opts.clone()
    }

    /// Suspends until an external condition holds; the host side of a
    /// blocking call uses this the way a real embedder would block on I/O.
    pub async fn suspend_until(&self, pred: impl Fn() -> bool + 'static) {
        self.store
            .suspend_until(self.thread, Rc::new(move |_| pred()))
            .await
    }

    pub(crate) async fn suspend_until_inner(&self, pred: WaitPredicate) {
        self.store.suspend_until(self.thread, pred).await
    }

    pub(crate) async fn yield_now(&self) {
        YieldNow {
            store: self.store.clone(),
            thread: self.thread,
            yielded: false,
        }
        .await
    }

    /// Whether the caller has requested cancellation and the request has not
    /// yet been delivered to this task.
    pub fn cancellation_requested(&self) -> bool {
        let inner = self.store.borrow();
        let t = inner.task(self.task);
        t.cancel_requested && !t.cancel_delivered
    }

    pub fn state(&self) -> TaskState {
        self.store.borrow().task(self.task).state
    }

    /// Resolves a host task with its results, the host-side equivalent of
    /// `task.return`.
    pub fn host_return(&self, results: Vec<crate::values::Val>) -> Result<()> {
        crate::task::resolve_task(&self.store, self.task, Some(results))
    }
}

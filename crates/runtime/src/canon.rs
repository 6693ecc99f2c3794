//! The canonical builtins: `canon lift`/`canon lower` and the intrinsic
//! surface exported to core code (task, waitable, subtask, stream, future,
//! resource, and error-context operations).
//!
//! Builtins that can suspend are `async fn`s; the suspension only ever
//! happens at the store's scheduling points, so plain builtins stay ordinary
//! functions.

use crate::flat;
use crate::memory;
use crate::options::{CallbackFn, CanonicalOptions, CoreFn, LiftLowerCx, Memory};
use crate::store::{InstanceFlags, InstanceId, Store, StoreInner, TaskCx, TaskId};
use crate::streams::{
    self, cancel_copy, consume_copy_event, end_op_finished, guest_buffer, issue_copy,
    pack_copy_result, CopyStatus, Side,
};
use crate::strings;
use crate::table::{ErrorContextData, TableEntry};
use crate::task::{
    resolve_task, subtask_state, Callee, OnResolve, OnStart, SubtaskData, SubtaskState, TaskData,
    TaskState, CONTEXT_LENGTH,
};
use crate::trap::{trap_if, Trap};
use crate::values::{CoreValue, CoreValueIter, FlatValues, Val};
use crate::waitable::{self, EventCode};
use anyhow::{bail, Result};
use canon_abi_types::{
    align_to, alignment, flatten_types, CoreType, FuncType, ValType, MAX_FLAT_ASYNC_PARAMS,
    MAX_FLAT_PARAMS, MAX_FLAT_RESULTS,
};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::cell::RefCell;
use std::rc::Rc;

/// Returned by asynchronous builtins whose operation could not complete
/// immediately; the outcome arrives later as an event.
pub const BLOCKED: u32 = 0xffff_ffff;

/// Callback codes returned by callback-mode core functions, packed with a
/// waitable-set index shifted left by four.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CallbackCode {
    Exit = 0,
    Yield = 1,
    Wait = 2,
}

pub fn callback_wait(set: u32) -> u32 {
    CallbackCode::Wait as u32 | (set << 4)
}

pub fn pack_subtask_result(state: SubtaskState, subi: u32) -> u32 {
    debug_assert!(subi < (1 << 28));
    state as u32 | (subi << 4)
}

/// Splits a packed `(result, n)` or `(state, subtask)` return.
pub fn unpack_result(packed: u32) -> (u32, u32) {
    debug_assert_ne!(packed, BLOCKED);
    (packed & 0xf, packed >> 4)
}

/// Splits the packed `i64` of `stream.new`/`future.new` into
/// `(readable, writable)`.
pub fn unpack_new_ends(packed: u64) -> (u32, u32) {
    (packed as u32, (packed >> 32) as u32)
}

fn set_may_leave(store: &Store, instance: InstanceId, on: bool) {
    let mut inner = store.borrow_mut();
    inner
        .instance_mut(instance)
        .flags
        .set(InstanceFlags::MAY_LEAVE, on);
}

// ===== canon lift =====

/// Produces the callable form of a lifted export: invoking it creates the
/// callee task, runs it until its first suspension, and returns the task.
pub fn lifted(
    opts: Rc<CanonicalOptions>,
    instance: InstanceId,
    ft: Rc<FuncType>,
    core: CoreFn,
) -> Callee {
    Rc::new(move |store, caller, on_start, on_resolve| {
        trap_if!(
            !store
                .borrow()
                .instance(instance)
                .flags
                .contains(InstanceFlags::MAY_ENTER),
            Trap::CannotEnter
        );
        let task = {
            let mut inner = store.borrow_mut();
            let mut data = TaskData::new(instance, caller, on_resolve);
            data.opts = Some(opts.clone());
            data.ft = Some(ft.clone());
            data.needs_exclusive = opts.sync || opts.callback.is_some();
            data.state = TaskState::Starting;
            let task = inner.add_task(data);
            inner.instance_mut(instance).pending.push_back(task);
            task
        };
        let thread = store.spawn(Some(task), {
            let store = store.clone();
            let opts = opts.clone();
            let ft = ft.clone();
            let core = core.clone();
            async move { run_lifted_task(store, task, opts, ft, core, on_start).await }
                .boxed_local()
        });
        store.poll_thread(thread)?;
        Ok(task)
    })
}

async fn run_lifted_task(
    store: Store,
    task: TaskId,
    opts: Rc<CanonicalOptions>,
    ft: Rc<FuncType>,
    core: CoreFn,
    on_start: OnStart,
) -> Result<()> {
    let thread = store.borrow().task(task).thread.unwrap();
    let cx = TaskCx::new(&store, task, thread);
    if !wait_for_entry(&cx).await? {
        return Ok(());
    }
    let args = on_start(&store, task)?;
    let instance = store.borrow().task(task).instance;
    // Core code must not be reentered from inside argument lowering.
    set_may_leave(&store, instance, false);
    let flat_params = {
        let mut lcx = LiftLowerCx::new(&store, &opts, instance);
        lcx.call = Some(task);
        flat::lower(&lcx, MAX_FLAT_PARAMS, &args, &ft.params, None)
    };
    set_may_leave(&store, instance, true);
    let flat_results = core(cx.clone(), flat_params?.into_vec()).await?;
    if let Some(callback) = opts.callback.clone() {
        let mut vi = CoreValueIter::new(flat_results);
        let code = vi.next_u32()?;
        callback_loop(&cx, &callback, code).await?;
    } else if opts.sync {
        let mut vi = CoreValueIter::new(flat_results);
        let mut lcx = LiftLowerCx::new(&store, &opts, instance);
        lcx.call = Some(task);
        lcx.allow_borrow = false;
        let tys: Vec<ValType> = ft.result.iter().cloned().collect();
        let vals = flat::lift(&lcx, MAX_FLAT_RESULTS, &mut vi, &tys)?;
        resolve_task(&store, task, Some(vals))?;
    } else {
        trap_if!(
            !store.borrow().task(task).state.resolved(),
            Trap::NoReturnValue
        );
        trap_if!(!CoreValueIter::new(flat_results).is_empty(), Trap::NoReturnValue);
    }
    exit_task(&store, task, &opts)
}

fn entry_ready(inner: &StoreInner, instance: InstanceId, task: TaskId, needs_exclusive: bool) -> bool {
    let inst = inner.instance(instance);
    inst.backpressure == 0
        && inst.pending.front() == Some(&task)
        && (!needs_exclusive || inst.exclusive.is_none())
}

/// Gates STARTING -> STARTED on backpressure, queue order, and instance
/// exclusivity. Returns `false` when the task was cancelled before starting.
async fn wait_for_entry(cx: &TaskCx) -> Result<bool> {
    let task = cx.task;
    let store = cx.store.clone();
    let (instance, needs_exclusive) = {
        let inner = store.borrow();
        let t = inner.task(task);
        (t.instance, t.needs_exclusive)
    };
    loop {
        {
            let mut inner = store.borrow_mut();
            if inner.task(task).state.resolved() {
                return Ok(false);
            }
            if inner.task(task).cancel_requested {
                let pending = &mut inner.instance_mut(instance).pending;
                if let Some(p) = pending.iter().position(|&t| t == task) {
                    pending.remove(p);
                }
                drop(inner);
                resolve_task(&store, task, None)?;
                return Ok(false);
            }
            if entry_ready(&inner, instance, task, needs_exclusive) {
                let inst = inner.instance_mut(instance);
                inst.pending.pop_front();
                if needs_exclusive {
                    inst.exclusive = Some(task);
                }
                inner.task_mut(task).state = TaskState::Started;
                break;
            }
        }
        cx.suspend_until_inner(Rc::new(move |inner| {
            entry_ready(inner, instance, task, needs_exclusive)
                || inner.task(task).cancel_requested
                || inner.task(task).state.resolved()
        }))
        .await;
    }
    crate::task::notify_watcher(&store, task);
    log::trace!("task {task:?} started");
    Ok(true)
}

fn exit_task(store: &Store, task: TaskId, opts: &CanonicalOptions) -> Result<()> {
    {
        let mut inner = store.borrow_mut();
        trap_if!(inner.task(task).num_borrows > 0, Trap::BorrowsOutstanding);
        let instance = inner.task(task).instance;
        let inst = inner.instance_mut(instance);
        if inst.exclusive == Some(task) {
            inst.exclusive = None;
        }
    }
    if let Some(post_return) = &opts.post_return {
        post_return()?;
    }
    Ok(())
}

fn release_exclusive(store: &Store, task: TaskId) {
    let mut inner = store.borrow_mut();
    let instance = inner.task(task).instance;
    let inst = inner.instance_mut(instance);
    if inst.exclusive == Some(task) {
        inst.exclusive = None;
    }
}

async fn acquire_exclusive(cx: &TaskCx) {
    let task = cx.task;
    let instance = cx.instance();
    loop {
        {
            let mut inner = cx.store.borrow_mut();
            let inst = inner.instance_mut(instance);
            if inst.exclusive.is_none() || inst.exclusive == Some(task) {
                inst.exclusive = Some(task);
                return;
            }
        }
        cx.suspend_until_inner(Rc::new(move |inner| {
            inner.instance(instance).exclusive.is_none()
        }))
        .await;
    }
}

/// Consumes an undelivered cancellation request, if any.
fn take_cancel(cx: &TaskCx) -> bool {
    let mut inner = cx.store.borrow_mut();
    let t = inner.task_mut(cx.task);
    if t.cancel_requested && !t.cancel_delivered {
        t.cancel_delivered = true;
        true
    } else {
        false
    }
}

async fn callback_loop(cx: &TaskCx, callback: &CallbackFn, mut code: u32) -> Result<()> {
    loop {
        let cmd = code & 0xf;
        let arg = code >> 4;
        match cmd {
            x if x == CallbackCode::Exit as u32 => {
                trap_if!(
                    !cx.store.borrow().task(cx.task).state.resolved(),
                    Trap::NoReturnValue
                );
                return Ok(());
            }
            x if x == CallbackCode::Yield as u32 => {
                release_exclusive(&cx.store, cx.task);
                cx.yield_now().await;
                let event = if take_cancel(cx) {
                    EventCode::TaskCancelled
                } else {
                    EventCode::None
                };
                acquire_exclusive(cx).await;
                code = callback(cx.clone(), event as u32, 0, 0).await?;
            }
            x if x == CallbackCode::Wait as u32 => {
                release_exclusive(&cx.store, cx.task);
                let (event, index, payload) = wait_on_set(cx, arg).await?;
                acquire_exclusive(cx).await;
                code = callback(cx.clone(), event as u32, index, payload).await?;
            }
            _ => bail!("invalid callback code {code:#x}"),
        }
    }
}

// ===== canon lower =====

/// Lowers a call to `callee`. Synchronous lowering suspends until the callee
/// resolves and returns its flat results; asynchronous lowering returns the
/// packed `(state, subtask)` status, with `subtask == 0` when the callee
/// resolved during its synchronous prefix.
pub async fn lower(
    cx: &TaskCx,
    opts: &Rc<CanonicalOptions>,
    ft: &Rc<FuncType>,
    callee: &Callee,
    flat_args: Vec<CoreValue>,
) -> Result<Vec<CoreValue>> {
    let store = cx.store.clone();
    let caller_instance = cx.instance();
    trap_if!(
        !store
            .borrow()
            .instance(caller_instance)
            .flags
            .contains(InstanceFlags::MAY_LEAVE),
        Trap::CannotLeave
    );
    let sync = opts.sync;
    let cap = if sync { MAX_FLAT_PARAMS } else { MAX_FLAT_ASYNC_PARAMS };

    // Split the flat arguments into the parameter values and the optional
    // trailing return-area pointer.
    let flat_param_tys: Vec<CoreType> = {
        let flat = flatten_types(&ft.params);
        if flat.len() > cap {
            vec![CoreType::I32]
        } else {
            flat.into_vec()
        }
    };
    let mut vi = CoreValueIter::new(flat_args);
    let mut params = FlatValues::new();
    for t in &flat_param_tys {
        params.push(vi.next(*t)?);
    }
    let result_flat_len = flatten_types(ft.result.as_slice()).len();
    let needs_retp = if sync {
        result_flat_len > MAX_FLAT_RESULTS
    } else {
        result_flat_len > 0
    };
    let retp = if needs_retp { Some(vi.next_u32()?) } else { None };

    let result_slot: Rc<RefCell<Option<Vec<CoreValue>>>> = Rc::new(RefCell::new(None));

    let on_start: OnStart = {
        let opts = opts.clone();
        let ft = ft.clone();
        Box::new(move |store, callee_task| {
            let mut lcx = LiftLowerCx::new(store, &opts, caller_instance);
            lcx.call = Some(callee_task);
            let mut vi = CoreValueIter::new(params);
            flat::lift(&lcx, cap, &mut vi, &ft.params)
        })
    };
    let on_resolve: OnResolve = {
        let opts = opts.clone();
        let ft = ft.clone();
        let result_slot = result_slot.clone();
        Box::new(move |store, results| {
            let Some(vals) = results else {
                return Ok(());
            };
            set_may_leave(store, caller_instance, false);
            let lowered = (|| {
                let mut lcx = LiftLowerCx::new(store, &opts, caller_instance);
                lcx.allow_borrow = false;
                let tys: Vec<ValType> = ft.result.iter().cloned().collect();
                if sync {
                    let mut out_iter = retp.map(|p| CoreValueIter::new(vec![CoreValue::I32(p)]));
                    let flat =
                        flat::lower(&lcx, MAX_FLAT_RESULTS, &vals, &tys, out_iter.as_mut())?;
                    *result_slot.borrow_mut() = Some(flat.into_vec());
                } else if let Some(t) = &ft.result {
                    let retp = retp.unwrap();
                    trap_if!(retp != align_to(retp, alignment(t)), Trap::MisalignedPointer);
                    memory::store(&lcx, &vals[0], t, retp)?;
                }
                Ok(())
            })();
            set_may_leave(store, caller_instance, true);
            lowered
        })
    };

    let callee_task = callee(&store, Some(cx.task), on_start, on_resolve)?;
    if sync {
        if !store.borrow().task(callee_task).state.resolved() {
            cx.suspend_until_inner(Rc::new(move |inner| {
                inner.task(callee_task).state.resolved()
            }))
            .await;
        }
        Ok(result_slot.borrow_mut().take().unwrap_or_default())
    } else {
        let state = subtask_state(&store.borrow(), callee_task);
        if state.resolved() {
            return Ok(vec![CoreValue::I32(state as u32)]);
        }
        let mut inner = store.borrow_mut();
        let subi = inner
            .instance_mut(caller_instance)
            .table
            .add(TableEntry::Subtask(SubtaskData {
                task: callee_task,
                set: None,
                event_pending: false,
            }))?;
        inner.task_mut(callee_task).watcher = Some((caller_instance, subi));
        let state = subtask_state(&inner, callee_task);
        Ok(vec![CoreValue::I32(pack_subtask_result(state, subi))])
    }
}

// ===== host imports =====

/// An asynchronous host function body: receives the lifted arguments and
/// either returns the results, or `None` after resolving early through
/// [`TaskCx::host_return`] (it may keep running afterwards).
pub type HostBody =
    Rc<dyn Fn(TaskCx, Vec<Val>) -> LocalBoxFuture<'static, Result<Option<Vec<Val>>>>>;

/// Wraps a host body in the callee calling convention. Each invocation runs
/// as a task on a fresh host-side instance.
pub fn host_import(body: HostBody) -> Callee {
    Rc::new(move |store, caller, on_start, on_resolve| {
        let instance = store.add_instance();
        let task = {
            let mut inner = store.borrow_mut();
            let mut data = TaskData::new(instance, caller, on_resolve);
            data.state = TaskState::Started;
            inner.add_task(data)
        };
        let thread = store.spawn(Some(task), {
            let store = store.clone();
            let body = body.clone();
            async move {
                let thread = store.borrow().task(task).thread.unwrap();
                let cx = TaskCx::new(&store, task, thread);
                let args = on_start(&store, task)?;
                if let Some(results) = body(cx, args).await? {
                    resolve_task(&store, task, Some(results))?;
                }
                Ok(())
            }
            .boxed_local()
        });
        store.poll_thread(thread)?;
        Ok(task)
    })
}

impl Store {
    /// Invokes a lifted function from the embedder: the host analogue of a
    /// lowered call.
    pub fn invoke(
        &self,
        callee: &Callee,
        on_start: OnStart,
        on_resolve: OnResolve,
    ) -> Result<TaskId> {
        callee(self, None, on_start, on_resolve)
    }

    pub fn subtask_state(&self, instance: InstanceId, subi: u32) -> Result<SubtaskState> {
        let inner = self.borrow();
        match inner.instance(instance).table.get(subi)? {
            TableEntry::Subtask(s) => Ok(subtask_state(&inner, s.task)),
            _ => Err(Trap::HandleTypeMismatch.err()),
        }
    }

    pub fn has_pending_event(&self, instance: InstanceId, idx: u32) -> bool {
        waitable::has_pending_event(&self.borrow(), instance, idx)
    }

    /// Raw slot count of an instance's handle table (including slot zero).
    pub fn table_len(&self, instance: InstanceId) -> usize {
        self.borrow().instance(instance).table.len()
    }

    pub fn table_free_count(&self, instance: InstanceId) -> usize {
        self.borrow().instance(instance).table.free_count()
    }

    pub fn table_slot_occupied(&self, instance: InstanceId, idx: u32) -> bool {
        self.borrow().instance(instance).table.get(idx).is_ok()
    }
}

// ===== task builtins =====

/// `task.return`: lifts the results from the given flat values and resolves
/// the current task.
pub fn task_return(
    cx: &TaskCx,
    opts: &Rc<CanonicalOptions>,
    result: Option<&ValType>,
    flat: Vec<CoreValue>,
) -> Result<()> {
    let (instance, declared) = {
        let inner = cx.store.borrow();
        let t = inner.task(cx.task);
        trap_if!(t.state.resolved(), Trap::AlreadyReturned);
        trap_if!(
            !matches!(t.state, TaskState::Started | TaskState::PendingCancel),
            Trap::AlreadyReturned
        );
        (t.instance, t.ft.as_ref().map(|ft| ft.result.clone()))
    };
    if let Some(declared) = declared {
        trap_if!(declared.as_ref() != result, Trap::ReturnMismatch);
    }
    let mut lcx = LiftLowerCx::new(&cx.store, opts, instance);
    lcx.call = Some(cx.task);
    lcx.allow_borrow = false;
    let tys: Vec<ValType> = result.into_iter().cloned().collect();
    let mut vi = CoreValueIter::new(flat);
    let vals = flat::lift(&lcx, MAX_FLAT_PARAMS, &mut vi, &tys)?;
    resolve_task(&cx.store, cx.task, Some(vals))
}

/// `task.cancel`: acknowledges a delivered cancellation request without
/// returning a value.
pub fn task_cancel(cx: &TaskCx) -> Result<()> {
    {
        let inner = cx.store.borrow();
        let t = inner.task(cx.task);
        trap_if!(t.state.resolved(), Trap::AlreadyReturned);
        trap_if!(!t.cancel_delivered, Trap::CancellationNotRequested);
    }
    resolve_task(&cx.store, cx.task, None)
}

pub fn backpressure_inc(cx: &TaskCx) -> Result<()> {
    let instance = cx.instance();
    let mut inner = cx.store.borrow_mut();
    let inst = inner.instance_mut(instance);
    trap_if!(inst.backpressure == u32::MAX, Trap::BackpressureOverflow);
    inst.backpressure += 1;
    Ok(())
}

pub fn backpressure_dec(cx: &TaskCx) -> Result<()> {
    let instance = cx.instance();
    let mut inner = cx.store.borrow_mut();
    let inst = inner.instance_mut(instance);
    trap_if!(inst.backpressure == 0, Trap::BackpressureOverflow);
    inst.backpressure -= 1;
    Ok(())
}

/// `yield`: reschedules the current task. Returns 1 (without suspending)
/// when a cancellation request was pending, consuming its delivery.
pub async fn yield_(cx: &TaskCx, _sync: bool) -> Result<u32> {
    if take_cancel(cx) {
        return Ok(1);
    }
    cx.yield_now().await;
    if take_cancel(cx) {
        return Ok(1);
    }
    Ok(0)
}

pub fn context_get(cx: &TaskCx, i: u32) -> Result<u32> {
    trap_if!(i as usize >= CONTEXT_LENGTH, Trap::ContextOutOfRange);
    Ok(cx.store.borrow().task(cx.task).context[i as usize])
}

pub fn context_set(cx: &TaskCx, i: u32, v: u32) -> Result<()> {
    trap_if!(i as usize >= CONTEXT_LENGTH, Trap::ContextOutOfRange);
    cx.store.borrow_mut().task_mut(cx.task).context[i as usize] = v;
    Ok(())
}

// ===== waitable sets =====

pub fn waitable_set_new(cx: &TaskCx) -> Result<u32> {
    let instance = cx.instance();
    let mut inner = cx.store.borrow_mut();
    inner
        .instance_mut(instance)
        .table
        .add(TableEntry::WaitableSet(waitable::WaitableSetData::new()))
}

pub fn waitable_set_drop(cx: &TaskCx, set: u32) -> Result<()> {
    let instance = cx.instance();
    let mut inner = cx.store.borrow_mut();
    waitable::check_set_droppable(&inner, instance, set)?;
    inner.instance_mut(instance).table.remove(set)?;
    Ok(())
}

pub fn waitable_join(cx: &TaskCx, waitable: u32, set: u32) -> Result<()> {
    waitable::join(&cx.store, cx.instance(), waitable, set)
}

/// Blocks until a member of `set` has an event (or cancellation surfaces),
/// writing `(index, payload)` to `outp` and returning the event code.
pub async fn waitable_set_wait(
    cx: &TaskCx,
    _sync: bool,
    mem: &Memory,
    set: u32,
    outp: u32,
) -> Result<u32> {
    let (code, index, payload) = wait_on_set(cx, set).await?;
    mem.write_u32_le(outp, index)?;
    mem.write_u32_le(outp + 4, payload)?;
    Ok(code as u32)
}

/// Non-blocking variant of `wait`: yields once, then reports a pending event
/// or `NONE`.
pub async fn waitable_set_poll(
    cx: &TaskCx,
    sync: bool,
    mem: &Memory,
    set: u32,
    outp: u32,
) -> Result<u32> {
    let instance = cx.instance();
    {
        let inner = cx.store.borrow();
        let t = inner.task(cx.task);
        let cancel_pending = t.cancel_requested && !t.cancel_delivered;
        // No member and no possible cancellation means the poll could never
        // report progress; that's a deadlock in the making.
        trap_if!(
            waitable::set_is_empty(&inner, instance, set)? && !cancel_pending,
            Trap::EmptyWaitableSet
        );
    }
    if sync {
        cx.yield_now().await;
    }
    if take_cancel(cx) {
        mem.write_u32_le(outp, 0)?;
        mem.write_u32_le(outp + 4, 0)?;
        return Ok(EventCode::TaskCancelled as u32);
    }
    let pending = {
        let inner = cx.store.borrow();
        waitable::first_pending(&inner, instance, set)
    };
    match pending {
        Some(idx) => {
            let (code, index, payload) = waitable::consume_event(&cx.store, instance, idx)?;
            mem.write_u32_le(outp, index)?;
            mem.write_u32_le(outp + 4, payload)?;
            Ok(code as u32)
        }
        None => {
            mem.write_u32_le(outp, 0)?;
            mem.write_u32_le(outp + 4, 0)?;
            Ok(EventCode::None as u32)
        }
    }
}

async fn wait_on_set(cx: &TaskCx, set: u32) -> Result<(EventCode, u32, u32)> {
    let instance = cx.instance();
    let task = cx.task;
    {
        let inner = cx.store.borrow();
        let t = inner.task(task);
        let cancel_pending = t.cancel_requested && !t.cancel_delivered;
        trap_if!(
            waitable::set_is_empty(&inner, instance, set)? && !cancel_pending,
            Trap::EmptyWaitableSet
        );
    }
    loop {
        if take_cancel(cx) {
            return Ok((EventCode::TaskCancelled, 0, 0));
        }
        let pending = {
            let inner = cx.store.borrow();
            waitable::first_pending(&inner, instance, set)
        };
        if let Some(idx) = pending {
            return waitable::consume_event(&cx.store, instance, idx);
        }
        cx.suspend_until_inner(Rc::new(move |inner| {
            let t = inner.task(task);
            (t.cancel_requested && !t.cancel_delivered)
                || waitable::first_pending(inner, instance, set).is_some()
        }))
        .await;
    }
}

// ===== subtasks =====

/// Requests cancellation of a lowered call. The callee gets one chance to
/// run to an acknowledgement; if it doesn't resolve promptly the result is
/// `BLOCKED` (async) or a suspension until resolution (sync).
pub async fn subtask_cancel(cx: &TaskCx, sync: bool, subi: u32) -> Result<u32> {
    let instance = cx.instance();
    let store = cx.store.clone();
    let callee = {
        let inner = store.borrow();
        match inner.instance(instance).table.get(subi)? {
            TableEntry::Subtask(s) => s.task,
            _ => return Err(Trap::HandleTypeMismatch.err()),
        }
    };
    let state = subtask_state(&store.borrow(), callee);
    if state.resolved() {
        consume_subtask_event(&store, instance, subi);
        return Ok(state as u32);
    }
    // Deliver the request.
    {
        let mut inner = store.borrow_mut();
        let t = inner.task_mut(callee);
        t.cancel_requested = true;
        if t.state == TaskState::Started {
            t.state = TaskState::PendingCancel;
        }
    }
    if state == SubtaskState::Starting {
        // Still gated on entry: resolve it on the spot.
        let (inst, pending_pos) = {
            let inner = store.borrow();
            let inst = inner.task(callee).instance;
            let pos = inner
                .instance(inst)
                .pending
                .iter()
                .position(|&t| t == callee);
            (inst, pos)
        };
        if let Some(p) = pending_pos {
            store.borrow_mut().instance_mut(inst).pending.remove(p);
        }
        resolve_task(&store, callee, None)?;
        consume_subtask_event(&store, instance, subi);
        return Ok(SubtaskState::CancelledBeforeStarted as u32);
    }
    // Let the callee observe the cancellation at its current suspension
    // point, once.
    let callee_thread = store.borrow().task(callee).thread;
    if let Some(tid) = callee_thread {
        if !store.borrow().thread_done(tid) {
            store.poll_thread(tid)?;
        }
    }
    let state = subtask_state(&store.borrow(), callee);
    if state.resolved() {
        consume_subtask_event(&store, instance, subi);
        return Ok(state as u32);
    }
    if !sync {
        return Ok(BLOCKED);
    }
    cx.suspend_until_inner(Rc::new(move |inner| inner.task(callee).state.resolved()))
        .await;
    let state = subtask_state(&store.borrow(), callee);
    consume_subtask_event(&store, instance, subi);
    Ok(state as u32)
}

/// A cancellation that reports a terminal state is itself the notification;
/// swallow the subtask event it would otherwise double-deliver.
fn consume_subtask_event(store: &Store, instance: InstanceId, subi: u32) {
    let mut inner = store.borrow_mut();
    if let Ok(TableEntry::Subtask(s)) = inner.instance_mut(instance).table.get_mut(subi) {
        s.event_pending = false;
    }
}

pub fn subtask_drop(cx: &TaskCx, subi: u32) -> Result<()> {
    let instance = cx.instance();
    let mut inner = cx.store.borrow_mut();
    let task = match inner.instance(instance).table.get(subi)? {
        TableEntry::Subtask(s) => s.task,
        _ => return Err(Trap::HandleTypeMismatch.err()),
    };
    trap_if!(!subtask_state(&inner, task).resolved(), Trap::SubtaskNotResolved);
    waitable::leave_set(&mut inner, instance, subi);
    inner.instance_mut(instance).table.remove(subi)?;
    inner.task_mut(task).watcher = None;
    Ok(())
}

// ===== streams and futures =====

fn stream_payload(ty: &ValType) -> Result<Option<ValType>> {
    match ty {
        ValType::Stream(p) => Ok(p.as_deref().cloned()),
        _ => Err(Trap::HandleTypeMismatch.err()),
    }
}

fn future_payload(ty: &ValType) -> Result<Option<ValType>> {
    match ty {
        ValType::Future(p) => Ok(p.as_deref().cloned()),
        _ => Err(Trap::HandleTypeMismatch.err()),
    }
}

pub fn stream_new(cx: &TaskCx, ty: &ValType) -> Result<u64> {
    let payload = stream_payload(ty)?;
    new_ends(cx, payload, false)
}

pub fn future_new(cx: &TaskCx, ty: &ValType) -> Result<u64> {
    let payload = future_payload(ty)?;
    new_ends(cx, payload, true)
}

fn new_ends(cx: &TaskCx, payload: Option<ValType>, is_future: bool) -> Result<u64> {
    let instance = cx.instance();
    let pipe = streams::new_pipe(&cx.store, payload, is_future);
    let mut inner = cx.store.borrow_mut();
    let table = &mut inner.instance_mut(instance).table;
    let (readable, writable) = if is_future {
        let r = table.add(TableEntry::FutureEnd(streams::FutureEndData {
            pipe,
            side: Side::Read,
            set: None,
        }))?;
        let w = table.add(TableEntry::FutureEnd(streams::FutureEndData {
            pipe,
            side: Side::Write,
            set: None,
        }))?;
        (r, w)
    } else {
        let r = table.add(TableEntry::StreamEnd(streams::StreamEndData {
            pipe,
            side: Side::Read,
            set: None,
        }))?;
        let w = table.add(TableEntry::StreamEnd(streams::StreamEndData {
            pipe,
            side: Side::Write,
            set: None,
        }))?;
        (r, w)
    };
    Ok(readable as u64 | ((writable as u64) << 32))
}

fn lookup_end(
    inner: &StoreInner,
    instance: InstanceId,
    idx: u32,
    is_future: bool,
    side: Side,
    payload: Option<&Option<ValType>>,
) -> Result<crate::store::PipeId> {
    let (pipe, have_side) = match (inner.instance(instance).table.get(idx)?, is_future) {
        (TableEntry::StreamEnd(e), false) => (e.pipe, e.side),
        (TableEntry::FutureEnd(e), true) => (e.pipe, e.side),
        _ => return Err(Trap::HandleTypeMismatch.err()),
    };
    trap_if!(have_side != side, Trap::HandleTypeMismatch);
    if let Some(p) = payload {
        trap_if!(inner.pipes[pipe.0 as usize].payload != *p, Trap::HandleTypeMismatch);
    }
    Ok(pipe)
}

async fn copy_impl(
    cx: &TaskCx,
    opts: &Rc<CanonicalOptions>,
    payload: Option<ValType>,
    is_future: bool,
    side: Side,
    idx: u32,
    ptr: u32,
    count: u32,
) -> Result<u32> {
    let instance = cx.instance();
    let store = cx.store.clone();
    let pipe = {
        let inner = store.borrow();
        let pipe = lookup_end(&inner, instance, idx, is_future, side, Some(&payload))?;
        trap_if!(
            inner.pipes[pipe.0 as usize].ends[side as usize].op.is_some(),
            Trap::CopyInProgress
        );
        pipe
    };
    if is_future {
        streams::check_future_reuse(&store.borrow(), pipe, side)?;
    }
    let buffer = guest_buffer(&store, opts, instance, &payload, ptr, count)?;
    let pack = |result, n| {
        if is_future {
            result as u32
        } else {
            pack_copy_result(result, n)
        }
    };
    match issue_copy(&store, pipe, side, buffer)? {
        CopyStatus::Done { result, n, .. } => Ok(pack(result, n)),
        CopyStatus::Parked => {
            if !opts.sync {
                return Ok(BLOCKED);
            }
            cx.suspend_until_inner(Rc::new(move |inner| end_op_finished(inner, pipe, side)))
                .await;
            let (result, n) = consume_copy_event(&mut store.borrow_mut(), pipe, side)?;
            Ok(pack(result, n))
        }
    }
}

pub async fn stream_read(
    cx: &TaskCx,
    ty: &ValType,
    opts: &Rc<CanonicalOptions>,
    idx: u32,
    ptr: u32,
    count: u32,
) -> Result<u32> {
    let payload = stream_payload(ty)?;
    copy_impl(cx, opts, payload, false, Side::Read, idx, ptr, count).await
}

pub async fn stream_write(
    cx: &TaskCx,
    ty: &ValType,
    opts: &Rc<CanonicalOptions>,
    idx: u32,
    ptr: u32,
    count: u32,
) -> Result<u32> {
    let payload = stream_payload(ty)?;
    copy_impl(cx, opts, payload, false, Side::Write, idx, ptr, count).await
}

pub async fn future_read(
    cx: &TaskCx,
    ty: &ValType,
    opts: &Rc<CanonicalOptions>,
    idx: u32,
    ptr: u32,
) -> Result<u32> {
    let payload = future_payload(ty)?;
    copy_impl(cx, opts, payload, true, Side::Read, idx, ptr, 1).await
}

pub async fn future_write(
    cx: &TaskCx,
    ty: &ValType,
    opts: &Rc<CanonicalOptions>,
    idx: u32,
    ptr: u32,
) -> Result<u32> {
    let payload = future_payload(ty)?;
    copy_impl(cx, opts, payload, true, Side::Write, idx, ptr, 1).await
}

fn cancel_impl(cx: &TaskCx, is_future: bool, side: Side, idx: u32) -> Result<u32> {
    let instance = cx.instance();
    let pipe = lookup_end(&cx.store.borrow(), instance, idx, is_future, side, None)?;
    let (result, n) = cancel_copy(&cx.store, pipe, side)?;
    Ok(if is_future {
        result as u32
    } else {
        pack_copy_result(result, n)
    })
}

pub async fn stream_cancel_read(cx: &TaskCx, _sync: bool, idx: u32) -> Result<u32> {
    cancel_impl(cx, false, Side::Read, idx)
}

pub async fn stream_cancel_write(cx: &TaskCx, _sync: bool, idx: u32) -> Result<u32> {
    cancel_impl(cx, false, Side::Write, idx)
}

pub async fn future_cancel_read(cx: &TaskCx, _sync: bool, idx: u32) -> Result<u32> {
    cancel_impl(cx, true, Side::Read, idx)
}

pub async fn future_cancel_write(cx: &TaskCx, _sync: bool, idx: u32) -> Result<u32> {
    cancel_impl(cx, true, Side::Write, idx)
}

fn drop_end_impl(cx: &TaskCx, is_future: bool, side: Side, idx: u32) -> Result<()> {
    let instance = cx.instance();
    let mut inner = cx.store.borrow_mut();
    let pipe = lookup_end(&inner, instance, idx, is_future, side, None)?;
    streams::drop_end(&mut inner, pipe, side)?;
    waitable::leave_set(&mut inner, instance, idx);
    inner.instance_mut(instance).table.remove(idx)?;
    Ok(())
}

pub fn stream_drop_readable(cx: &TaskCx, idx: u32) -> Result<()> {
    drop_end_impl(cx, false, Side::Read, idx)
}

pub fn stream_drop_writable(cx: &TaskCx, idx: u32) -> Result<()> {
    drop_end_impl(cx, false, Side::Write, idx)
}

pub fn future_drop_readable(cx: &TaskCx, idx: u32) -> Result<()> {
    drop_end_impl(cx, true, Side::Read, idx)
}

pub fn future_drop_writable(cx: &TaskCx, idx: u32) -> Result<()> {
    drop_end_impl(cx, true, Side::Write, idx)
}

// ===== error contexts =====

pub fn error_context_new(
    cx: &TaskCx,
    opts: &Rc<CanonicalOptions>,
    ptr: u32,
    tagged_code_units: u32,
) -> Result<u32> {
    let instance = cx.instance();
    let message = if tagged_code_units == 0 {
        String::new()
    } else {
        let lcx = LiftLowerCx::new(&cx.store, opts, instance);
        strings::load_string_from_range(&lcx, ptr, tagged_code_units)?.value
    };
    let mut inner = cx.store.borrow_mut();
    inner
        .instance_mut(instance)
        .table
        .add(TableEntry::ErrorContext(ErrorContextData {
            message: message.into(),
        }))
}

pub fn error_context_drop(cx: &TaskCx, idx: u32) -> Result<()> {
    let instance = cx.instance();
    let mut inner = cx.store.borrow_mut();
    match inner.instance_mut(instance).table.remove(idx)? {
        TableEntry::ErrorContext(_) => Ok(()),
        _ => Err(Trap::HandleTypeMismatch.err()),
    }
}

pub use crate::resources::{resource_drop, resource_new, resource_rep};

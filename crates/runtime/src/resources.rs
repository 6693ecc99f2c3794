//! Resource types, own/borrow handles, and destructor scheduling.

use crate::options::LiftLowerCx;
use crate::store::{InstanceId, Store, TaskCx, TaskId};
use crate::table::TableEntry;
use crate::task::{subtask_state, SubtaskData, TaskData};
use crate::trap::{trap_if, Trap};
use crate::values::{BorrowTransfer, OwnTransfer, Val};
use anyhow::Result;
use canon_abi_types::ResourceId;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::rc::Rc;

/// A resource destructor: receives the representation value, runs in the
/// resource type's implementing instance, and may block.
pub type DtorFn = Rc<dyn Fn(TaskCx, u32) -> LocalBoxFuture<'static, Result<()>>>;

pub(crate) struct ResourceTypeData {
    pub instance: InstanceId,
    pub dtor: Option<DtorFn>,
}

pub(crate) enum ResourceHandle {
    Own {
        rt: ResourceId,
        rep: u32,
        lend_count: u32,
    },
    Borrow {
        rt: ResourceId,
        rep: u32,
        scope: TaskId,
    },
}

impl ResourceHandle {
    pub fn rt(&self) -> ResourceId {
        match self {
            ResourceHandle::Own { rt, .. } | ResourceHandle::Borrow { rt, .. } => *rt,
        }
    }

    pub fn rep(&self) -> u32 {
        match self {
            ResourceHandle::Own { rep, .. } | ResourceHandle::Borrow { rep, .. } => *rep,
        }
    }

    pub fn release_lend(&mut self) {
        if let ResourceHandle::Own { lend_count, .. } = self {
            debug_assert!(*lend_count > 0);
            *lend_count -= 1;
        }
    }
}

impl Store {
    /// Declares a resource type implemented by `instance`, with an optional
    /// destructor to run when own handles are dropped.
    pub fn register_resource_type(
        &self,
        instance: InstanceId,
        dtor: Option<DtorFn>,
    ) -> ResourceId {
        let mut inner = self.borrow_mut();
        let id = ResourceId(inner.resource_types.len() as u32);
        inner.resource_types.push(ResourceTypeData { instance, dtor });
        id
    }
}

/// Lifting an own handle transfers the representation out of the table; the
/// handle must not be lent out.
pub(crate) fn lift_own(cx: &LiftLowerCx, rt: ResourceId, idx: u32) -> Result<Val> {
    let mut inner = cx.store.borrow_mut();
    let table = &mut inner.instance_mut(cx.instance).table;
    match table.get(idx)? {
        TableEntry::Resource(ResourceHandle::Own { rt: have, lend_count, .. }) => {
            trap_if!(*have != rt, Trap::HandleTypeMismatch);
            trap_if!(*lend_count > 0, Trap::OutstandingLoans);
        }
        _ => return Err(Trap::HandleTypeMismatch.err()),
    }
    match table.remove(idx)? {
        TableEntry::Resource(ResourceHandle::Own { rep, .. }) => {
            Ok(Val::Own(OwnTransfer { rt, rep }))
        }
        _ => unreachable!(),
    }
}

/// Lifting a borrow lends the handle across the call: the source handle's
/// lend count rises until the callee resolves.
pub(crate) fn lift_borrow(cx: &LiftLowerCx, rt: ResourceId, idx: u32) -> Result<Val> {
    trap_if!(!cx.allow_borrow, Trap::HandleTypeMismatch);
    let mut inner = cx.store.borrow_mut();
    let rep = match inner.instance_mut(cx.instance).table.get_mut(idx)? {
        TableEntry::Resource(h) => {
            trap_if!(h.rt() != rt, Trap::HandleTypeMismatch);
            if let ResourceHandle::Own { lend_count, rep, .. } = h {
                *lend_count += 1;
                *rep
            } else {
                h.rep()
            }
        }
        _ => return Err(Trap::HandleTypeMismatch.err()),
    };
    if let Some(call) = cx.call {
        inner.task_mut(call).lenders.push((cx.instance, idx));
    }
    Ok(Val::Borrow(BorrowTransfer { rt, rep }))
}

pub(crate) fn lower_own(cx: &LiftLowerCx, rt: ResourceId, o: &OwnTransfer) -> Result<u32> {
    trap_if!(o.rt != rt, Trap::HandleTypeMismatch);
    let mut inner = cx.store.borrow_mut();
    inner
        .instance_mut(cx.instance)
        .table
        .add(TableEntry::Resource(ResourceHandle::Own {
            rt,
            rep: o.rep,
            lend_count: 0,
        }))
}

/// Lowering a borrow into the instance that implements the resource passes
/// the representation through directly; any other instance gets a scoped
/// borrow handle that must be dropped before the call ends.
pub(crate) fn lower_borrow(cx: &LiftLowerCx, rt: ResourceId, b: &BorrowTransfer) -> Result<u32> {
    trap_if!(b.rt != rt, Trap::HandleTypeMismatch);
    let mut inner = cx.store.borrow_mut();
    if inner.resource_types[rt.0 as usize].instance == cx.instance {
        return Ok(b.rep);
    }
    let scope = match cx.call {
        Some(t) => t,
        None => return Err(Trap::HandleTypeMismatch.err()),
    };
    let idx = inner
        .instance_mut(cx.instance)
        .table
        .add(TableEntry::Resource(ResourceHandle::Borrow {
            rt,
            rep: b.rep,
            scope,
        }))?;
    inner.task_mut(scope).num_borrows += 1;
    Ok(idx)
}

pub fn resource_new(cx: &TaskCx, rt: ResourceId, rep: u32) -> Result<u32> {
    let instance = cx.instance();
    let mut inner = cx.store.borrow_mut();
    inner
        .instance_mut(instance)
        .table
        .add(TableEntry::Resource(ResourceHandle::Own {
            rt,
            rep,
            lend_count: 0,
        }))
}

pub fn resource_rep(cx: &TaskCx, rt: ResourceId, idx: u32) -> Result<u32> {
    let instance = cx.instance();
    let inner = cx.store.borrow();
    match inner.instance(instance).table.get(idx)? {
        TableEntry::Resource(h) => {
            trap_if!(h.rt() != rt, Trap::HandleTypeMismatch);
            Ok(h.rep())
        }
        _ => Err(Trap::HandleTypeMismatch.err()),
    }
}

/// Drops a handle. Own handles run the resource's destructor; a destructor
/// that blocks turns the drop into a subtask on the asynchronous path (the
/// packed `(state, subtask)` return), or suspends the caller on the
/// synchronous one.
pub async fn resource_drop(
    cx: &TaskCx,
    rt: ResourceId,
    sync: bool,
    idx: u32,
) -> Result<Option<u32>> {
    let instance = cx.instance();
    let handle = {
        let mut inner = cx.store.borrow_mut();
        match inner.instance_mut(instance).table.remove(idx)? {
            TableEntry::Resource(h) => h,
            _ => return Err(Trap::HandleTypeMismatch.err()),
        }
    };
    let not_blocked = if sync { None } else { Some(0) };
    match handle {
        ResourceHandle::Borrow { rt: have, scope, .. } => {
            trap_if!(have != rt, Trap::HandleTypeMismatch);
            let mut inner = cx.store.borrow_mut();
            let t = inner.task_mut(scope);
            debug_assert!(t.num_borrows > 0);
            t.num_borrows -= 1;
            Ok(not_blocked)
        }
        ResourceHandle::Own {
            rt: have,
            rep,
            lend_count,
        } => {
            trap_if!(have != rt, Trap::HandleTypeMismatch);
            trap_if!(lend_count > 0, Trap::OutstandingLoans);
            let dtor = {
                let inner = cx.store.borrow();
                let rtd = &inner.resource_types[rt.0 as usize];
                rtd.dtor.clone().map(|d| (d, rtd.instance))
            };
            let Some((dtor, dtor_instance)) = dtor else {
                return Ok(not_blocked);
            };
            // The destructor runs as its own task in the implementing
            // instance, with this task as the (weak) parent.
            let dtor_task = {
                let mut inner = cx.store.borrow_mut();
                let data = TaskData::new(dtor_instance, Some(cx.task), Box::new(|_, _| Ok(())));
                inner.add_task(data)
            };
            let thread = cx.store.spawn(Some(dtor_task), {
                let store = cx.store.clone();
                async move {
                    let thread = store.borrow().task(dtor_task).thread.unwrap();
                    let dcx = TaskCx::new(&store, dtor_task, thread);
                    let mut inner = store.borrow_mut();
                    inner.task_mut(dtor_task).state = crate::task::TaskState::Started;
                    drop(inner);
                    dtor(dcx, rep).await?;
                    crate::task::resolve_task(&store, dtor_task, Some(Vec::new()))?;
                    Ok(())
                }
                .boxed_local()
            });
            cx.store.poll_thread(thread)?;
            let resolved = cx.store.borrow().task(dtor_task).state.resolved();
            if resolved {
                return Ok(not_blocked);
            }
            if sync {
                cx.suspend_until_inner(Rc::new(move |inner| {
                    inner.task(dtor_task).state.resolved()
                }))
                .await;
                return Ok(None);
            }
            // Hand the caller a subtask to watch the destructor through.
            let mut inner = cx.store.borrow_mut();
            let subi = inner
                .instance_mut(instance)
                .table
                .add(TableEntry::Subtask(SubtaskData {
                    task: dtor_task,
                    set: None,
                    event_pending: false,
                }))?;
            inner.task_mut(dtor_task).watcher = Some((instance, subi));
            let state = subtask_state(&inner, dtor_task);
            Ok(Some(crate::canon::pack_subtask_result(state, subi)))
        }
    }
}

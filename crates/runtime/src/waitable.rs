//! Waitables and waitable sets.
//!
//! A waitable is any table entry that can raise an event: a subtask, or a
//! stream/future end. Each holds at most one pending event whose payload is
//! computed when the event is consumed, not when it is raised. A waitable
//! set is a bag of waitables a task can block on; delivery scans members in
//! join order.

use crate::store::{InstanceId, Store, StoreInner};
use crate::streams;
use crate::table::TableEntry;
use crate::task::subtask_state;
use crate::trap::{trap_if, Trap};
use anyhow::Result;
use indexmap::IndexSet;

/// Event codes delivered by `waitable-set.wait`/`poll` and callback-mode
/// reentry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EventCode {
    None = 0,
    Subtask = 1,
    StreamRead = 2,
    StreamWrite = 3,
    FutureRead = 4,
    FutureWrite = 5,
    TaskCancelled = 6,
}

/// One delivered event: `(code, waitable index, payload)`.
pub(crate) type Event = (EventCode, u32, u32);

pub(crate) struct WaitableSetData {
    pub members: IndexSet<u32>,
}

impl WaitableSetData {
    pub fn new() -> WaitableSetData {
        WaitableSetData {
            members: IndexSet::new(),
        }
    }
}

fn membership(entry: &mut TableEntry) -> Result<&mut Option<u32>> {
    match entry {
        TableEntry::Subtask(s) => Ok(&mut s.set),
        TableEntry::StreamEnd(e) => Ok(&mut e.set),
        TableEntry::FutureEnd(e) => Ok(&mut e.set),
        _ => Err(Trap::HandleTypeMismatch.err()),
    }
}

/// Moves a waitable into a set (or out of any set when `set_idx` is 0).
pub(crate) fn join(
    store: &Store,
    instance: InstanceId,
    waitable_idx: u32,
    set_idx: u32,
) -> Result<()> {
    let mut inner = store.borrow_mut();
    let table = &mut inner.instance_mut(instance).table;
    let current = *membership(table.get_mut(waitable_idx)?)?;
    if let Some(old) = current {
        if let Ok(TableEntry::WaitableSet(s)) = table.get_mut(old) {
            s.members.shift_remove(&waitable_idx);
        }
    }
    if set_idx == 0 {
        *membership(table.get_mut(waitable_idx)?)? = None;
        return Ok(());
    }
    match table.get_mut(set_idx)? {
        TableEntry::WaitableSet(s) => {
            s.members.insert(waitable_idx);
        }
        _ => return Err(Trap::HandleTypeMismatch.err()),
    }
    *membership(table.get_mut(waitable_idx)?)? = Some(set_idx);
    Ok(())
}

/// Removes a dropped waitable from whatever set it joined.
pub(crate) fn leave_set(inner: &mut StoreInner, instance: InstanceId, waitable_idx: u32) {
    let table = &mut inner.instance_mut(instance).table;
    let current = match table.get_mut(waitable_idx) {
        Ok(e) => match membership(e) {
            Ok(m) => m.take(),
            Err(_) => None,
        },
        Err(_) => None,
    };
    if let Some(set) = current {
        if let Ok(TableEntry::WaitableSet(s)) = table.get_mut(set) {
            s.members.shift_remove(&waitable_idx);
        }
    }
}

/// Whether the waitable at `idx` has an undelivered event.
pub(crate) fn has_pending_event(inner: &StoreInner, instance: InstanceId, idx: u32) -> bool {
    match inner.instance(instance).table.get(idx) {
        Ok(TableEntry::Subtask(s)) => s.event_pending,
        Ok(TableEntry::StreamEnd(e)) => streams::end_has_event(inner, e.pipe, e.side),
        Ok(TableEntry::FutureEnd(e)) => streams::end_has_event(inner, e.pipe, e.side),
        _ => false,
    }
}

/// Finds the first member of `set` with a pending event, in join order.
pub(crate) fn first_pending(
    inner: &StoreInner,
    instance: InstanceId,
    set_idx: u32,
) -> Option<u32> {
    match inner.instance(instance).table.get(set_idx) {
        Ok(TableEntry::WaitableSet(s)) => s
            .members
            .iter()
            .copied()
            .find(|&i| has_pending_event(inner, instance, i)),
        _ => None,
    }
}

pub(crate) fn set_is_empty(inner: &StoreInner, instance: InstanceId, set_idx: u32) -> Result<bool> {
    match inner.instance(instance).table.get(set_idx)? {
        TableEntry::WaitableSet(s) => Ok(s.members.is_empty()),
        _ => Err(Trap::HandleTypeMismatch.err()),
    }
}

/// Consumes the pending event of the waitable at `idx`, producing the
/// delivered tuple. Copy events retire their underlying copy here.
pub(crate) fn consume_event(store: &Store, instance: InstanceId, idx: u32) -> Result<Event> {
    enum Kind {
        Subtask,
        Stream(crate::store::PipeId, streams::Side),
        Future(crate::store::PipeId, streams::Side),
    }
    let mut inner = store.borrow_mut();
    let kind = match inner.instance(instance).table.get(idx)? {
        TableEntry::Subtask(_) => Kind::Subtask,
        TableEntry::StreamEnd(e) => Kind::Stream(e.pipe, e.side),
        TableEntry::FutureEnd(e) => Kind::Future(e.pipe, e.side),
        _ => return Err(Trap::HandleTypeMismatch.err()),
    };
    match kind {
        Kind::Subtask => {
            let task = match inner.instance_mut(instance).table.get_mut(idx)? {
                TableEntry::Subtask(s) => {
                    debug_assert!(s.event_pending);
                    s.event_pending = false;
                    s.task
                }
                _ => unreachable!(),
            };
            let state = subtask_state(&inner, task);
            Ok((EventCode::Subtask, idx, state as u32))
        }
        Kind::Stream(pipe, side) => {
            let (result, progress) = streams::consume_copy_event(&mut inner, pipe, side)?;
            let code = match side {
                streams::Side::Read => EventCode::StreamRead,
                streams::Side::Write => EventCode::StreamWrite,
            };
            Ok((code, idx, streams::pack_copy_result(result, progress)))
        }
        Kind::Future(pipe, side) => {
            let (result, _progress) = streams::consume_copy_event(&mut inner, pipe, side)?;
            let code = match side {
                streams::Side::Read => EventCode::FutureRead,
                streams::Side::Write => EventCode::FutureWrite,
            };
            Ok((code, idx, result as u32))
        }
    }
}

/// Raises the waitable-set drop trap when members remain.
pub(crate) fn check_set_droppable(inner: &StoreInner, instance: InstanceId, set_idx: u32) -> Result<()> {
    match inner.instance(instance).table.get(set_idx)? {
        TableEntry::WaitableSet(s) => {
            trap_if!(!s.members.is_empty(), Trap::WaitableSetNotEmpty);
            Ok(())
        }
        _ => Err(Trap::HandleTypeMismatch.err()),
    }
}

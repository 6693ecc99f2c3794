//! Streams and futures: two table-resident ends sharing a pipe, with a
//! rendezvous copy engine.
//!
//! A copy arriving at a pipe whose partner has no copy outstanding parks.
//! A copy arriving opposite a parked partner transfers `min` of the two
//! remaining budgets and completes immediately; the parked side accrues
//! progress and holds a lazily-packed event that retires its copy when
//! consumed. Dropping an end resolves the partner's parked copy as
//! `DROPPED` with whatever progress it had.

use crate::memory;
use crate::options::{CanonicalOptions, LiftLowerCx};
use crate::store::{PipeId, Store, StoreInner, TaskCx};
use crate::table::{ErrorContextData, TableEntry};
use crate::trap::{trap_if, Trap};
use crate::values::{EndTransfer, ErrorContextTransfer, Val};
use anyhow::Result;
use canon_abi_types::{align_to, alignment, size, ValType};
use std::collections::VecDeque;
use std::rc::Rc;

/// In-band outcome of a copy operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CopyResult {
    Completed = 0,
    Dropped = 1,
    Cancelled = 2,
}

/// Stream copy results pack the element count alongside the result code.
pub(crate) fn pack_copy_result(result: CopyResult, n: u32) -> u32 {
    debug_assert!(n < (1 << 28));
    result as u32 | (n << 4)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Read = 0,
    Write = 1,
}

impl Side {
    pub(crate) fn other(self) -> Side {
        match self {
            Side::Read => Side::Write,
            Side::Write => Side::Read,
        }
    }
}

pub(crate) struct StreamEndData {
    pub pipe: PipeId,
    pub side: Side,
    pub set: Option<u32>,
}

pub(crate) struct FutureEndData {
    pub pipe: PipeId,
    pub side: Side,
    pub set: Option<u32>,
}

/// One end's buffer for an outstanding copy.
pub(crate) enum CopyBuffer {
    /// A typed window onto guest linear memory.
    Guest {
        cx: LiftLowerCx,
        ty: ValType,
        ptr: u32,
        count: u32,
    },
    /// Pure element accounting for empty-payload pipes, and for guest ends
    /// of `stream<>`/`future<>` (the address is ignored).
    Counter { count: u32 },
    /// Host-held values waiting to be written into the pipe.
    HostSource { values: VecDeque<Val> },
    /// Host-side sink collecting values read from the pipe.
    HostSink { capacity: u32, values: Vec<Val> },
}

pub(crate) struct CopyOp {
    pub buffer: CopyBuffer,
    pub progress: u32,
    /// Terminal result recorded by drop or cancellation; `None` while the
    /// copy can still make progress.
    pub done: Option<CopyResult>,
    pub event_pending: bool,
}

impl CopyOp {
    fn new(buffer: CopyBuffer) -> CopyOp {
        CopyOp {
            buffer,
            progress: 0,
            done: None,
            event_pending: false,
        }
    }

    fn remain(&self) -> u32 {
        match &self.buffer {
            CopyBuffer::Guest { count, .. } | CopyBuffer::Counter { count } => {
                count - self.progress
            }
            CopyBuffer::HostSource { values } => values.len() as u32,
            CopyBuffer::HostSink { capacity, values } => capacity - values.len() as u32,
        }
    }
}

pub(crate) struct EndState {
    pub dropped: bool,
    pub op: Option<CopyOp>,
}

pub(crate) struct PipeState {
    pub payload: Option<ValType>,
    pub is_future: bool,
    /// Indexed by `Side`.
    pub ends: [EndState; 2],
    /// Futures transfer exactly one value, once.
    pub value_transferred: bool,
}

impl PipeState {
    fn end(&self, side: Side) -> &EndState {
        &self.ends[side as usize]
    }

    fn end_mut(&mut self, side: Side) -> &mut EndState {
        &mut self.ends[side as usize]
    }
}

pub(crate) fn new_pipe(store: &Store, payload: Option<ValType>, is_future: bool) -> PipeId {
    let mut inner = store.borrow_mut();
    let id = PipeId(inner.pipes.len() as u32);
    inner.pipes.push(PipeState {
        payload,
        is_future,
        ends: [
            EndState {
                dropped: false,
                op: None,
            },
            EndState {
                dropped: false,
                op: None,
            },
        ],
        value_transferred: false,
    });
    id
}

pub(crate) enum CopyStatus {
    /// The arriving copy completed immediately; the op carries its buffer
    /// (host sinks recover their values from it) and final progress.
    Done {
        result: CopyResult,
        n: u32,
        op: CopyOp,
    },
    Parked,
}

/// Issues a copy on `side` of `pipe`.
///
/// A parked write acts as available data, a parked read as available
/// capacity. Zero-length copies are probes: a zero read completes once data
/// is present, a zero write once a reader is; a probe with no counterpart
/// parks. A parked copy whose budget is exhausted by a rendezvous is retired
/// on the spot with a pending `COMPLETED` event.
pub(crate) fn issue_copy(
    store: &Store,
    pipe: PipeId,
    side: Side,
    buffer: CopyBuffer,
) -> Result<CopyStatus> {
    let mut op = CopyOp::new(buffer);
    let (partner_active, partner_dropped, partner_remain) = {
        let inner = store.borrow();
        let p = &inner.pipes[pipe.0 as usize];
        debug_assert!(p.end(side).op.is_none());
        let partner = p.end(side.other());
        (
            partner
                .op
                .as_ref()
                .map(|op| op.done.is_none())
                .unwrap_or(false),
            partner.dropped,
            partner.op.as_ref().map(|op| op.remain()).unwrap_or(0),
        )
    };

    if partner_dropped {
        return Ok(CopyStatus::Done {
            result: CopyResult::Dropped,
            n: 0,
            op,
        });
    }
    if !partner_active {
        park(store, pipe, side, op);
        return Ok(CopyStatus::Parked);
    }

    let write_remain = match side {
        Side::Write => op.remain(),
        Side::Read => partner_remain,
    };
    if write_remain == 0 {
        // The write side is a zero-length probe. A parked reader satisfies
        // an arriving probe immediately; an arriving read retires a parked
        // probe and takes its place.
        match side {
            Side::Write => {
                op.progress = 0;
                return Ok(CopyStatus::Done {
                    result: CopyResult::Completed,
                    n: 0,
                    op,
                });
            }
            Side::Read => {
                finish_parked(
                    &mut store.borrow_mut(),
                    pipe,
                    side.other(),
                    CopyResult::Completed,
                );
                park(store, pipe, side, op);
                return Ok(CopyStatus::Parked);
            }
        }
    }
    let read_remain = match side {
        Side::Read => op.remain(),
        Side::Write => partner_remain,
    };
    if read_remain == 0 {
        // Data is available; a zero-length read probe learns that and
        // completes, a parked one is retired so the writer can park.
        match side {
            Side::Read => {
                return Ok(CopyStatus::Done {
                    result: CopyResult::Completed,
                    n: 0,
                    op,
                });
            }
            Side::Write => {
                finish_parked(
                    &mut store.borrow_mut(),
                    pipe,
                    side.other(),
                    CopyResult::Completed,
                );
                park(store, pipe, side, op);
                return Ok(CopyStatus::Parked);
            }
        }
    }

    let n = op.remain().min(partner_remain);
    debug_assert!(n > 0);
    let mut partner_op = {
        let mut inner = store.borrow_mut();
        inner.pipes[pipe.0 as usize]
            .end_mut(side.other())
            .op
            .take()
            .unwrap()
    };
    let payload = store.borrow().pipes[pipe.0 as usize].payload.clone();
    let res = match side {
        Side::Read => transfer(&payload, &mut partner_op, &mut op, n),
        Side::Write => transfer(&payload, &mut op, &mut partner_op, n),
    };
    partner_op.event_pending = true;
    let mut inner = store.borrow_mut();
    let p = &mut inner.pipes[pipe.0 as usize];
    if p.is_future {
        partner_op.done = Some(CopyResult::Completed);
        p.value_transferred = true;
    } else if partner_op.remain() == 0 {
        // The partner's budget is spent; retire its copy now so later
        // arrivals park instead of rendezvousing with a finished op.
        partner_op.done = Some(CopyResult::Completed);
    }
    p.end_mut(side.other()).op = Some(partner_op);
    drop(inner);
    res?;
    log::trace!("pipe {pipe:?} moved {n} element(s) to satisfy a {side:?}");
    Ok(CopyStatus::Done {
        result: CopyResult::Completed,
        n,
        op,
    })
}

fn park(store: &Store, pipe: PipeId, side: Side, op: CopyOp) {
    let mut inner = store.borrow_mut();
    inner.pipes[pipe.0 as usize].end_mut(side).op = Some(op);
}

fn finish_parked(inner: &mut StoreInner, pipe: PipeId, side: Side, result: CopyResult) {
    let end = inner.pipes[pipe.0 as usize].end_mut(side);
    if let Some(op) = &mut end.op {
        if op.done.is_none() {
            op.done = Some(result);
            op.event_pending = true;
        }
    }
}

/// Moves `n` elements from the write-side op to the read-side op, updating
/// both progress counters.
fn transfer(payload: &Option<ValType>, src: &mut CopyOp, dst: &mut CopyOp, n: u32) -> Result<()> {
    if let Some(ty) = payload {
        let vals = take_values(src, ty, n)?;
        put_values(dst, ty, vals)?;
    }
    src.progress += n;
    dst.progress += n;
    Ok(())
}

fn take_values(op: &mut CopyOp, ty: &ValType, n: u32) -> Result<Vec<Val>> {
    match &mut op.buffer {
        CopyBuffer::Guest { cx, ty: elem, ptr, .. } => {
            debug_assert_eq!(elem, ty);
            let mut vals = Vec::with_capacity(n as usize);
            for i in 0..n {
                let at = *ptr + (op.progress + i) * size(ty);
                vals.push(memory::load(cx, at, ty)?);
            }
            Ok(vals)
        }
        CopyBuffer::HostSource { values } => {
            Ok(values.drain(..n as usize).collect())
        }
        CopyBuffer::Counter { .. } | CopyBuffer::HostSink { .. } => {
            unreachable!("not a source buffer")
        }
    }
}

fn put_values(op: &mut CopyOp, ty: &ValType, vals: Vec<Val>) -> Result<()> {
    match &mut op.buffer {
        CopyBuffer::Guest { cx, ty: elem, ptr, .. } => {
            debug_assert_eq!(elem, ty);
            for (i, v) in vals.iter().enumerate() {
                let at = *ptr + (op.progress + i as u32) * size(ty);
                memory::store(cx, v, ty, at)?;
            }
            Ok(())
        }
        CopyBuffer::HostSink { values, .. } => {
            values.extend(vals);
            Ok(())
        }
        CopyBuffer::Counter { .. } | CopyBuffer::HostSource { .. } => {
            unreachable!("not a sink buffer")
        }
    }
}

pub(crate) fn end_has_event(inner: &StoreInner, pipe: PipeId, side: Side) -> bool {
    inner.pipes[pipe.0 as usize]
        .end(side)
        .op
        .as_ref()
        .map(|op| op.event_pending)
        .unwrap_or(false)
}

pub(crate) fn end_op_finished(inner: &StoreInner, pipe: PipeId, side: Side) -> bool {
    let end = inner.pipes[pipe.0 as usize].end(side);
    match &end.op {
        Some(op) => op.event_pending || op.done.is_some(),
        None => true,
    }
}

/// Consumes the pending event on an end, retiring the copy. The result is
/// the recorded terminal result, or `COMPLETED` with accrued progress for a
/// copy retired by consumption — downgraded to `DROPPED` when the opposite
/// stream end has closed in the meantime (futures keep their fixed result:
/// their value transferred in full).
pub(crate) fn consume_copy_event(
    inner: &mut StoreInner,
    pipe: PipeId,
    side: Side,
) -> Result<(CopyResult, u32)> {
    let partner_dropped = inner.pipes[pipe.0 as usize].end(side.other()).dropped;
    let is_future = inner.pipes[pipe.0 as usize].is_future;
    let end = inner.pipes[pipe.0 as usize].end_mut(side);
    let op = match end.op.take() {
        Some(op) => op,
        None => return Err(Trap::NoCopyInProgress.err()),
    };
    let mut result = op.done.unwrap_or(CopyResult::Completed);
    if result == CopyResult::Completed && partner_dropped && !is_future {
        result = CopyResult::Dropped;
    }
    Ok((result, op.progress))
}

/// Cancels an end's outstanding copy. An already-finished or progressed copy
/// reports its (possibly complete) outcome; an idle parked copy reports
/// `CANCELLED`. Cancellation never blocks: the pipe is store-local, so the
/// outcome is always immediately known.
pub(crate) fn cancel_copy(store: &Store, pipe: PipeId, side: Side) -> Result<(CopyResult, u32)> {
    let mut inner = store.borrow_mut();
    let finished = {
        let end = inner.pipes[pipe.0 as usize].end(side);
        match &end.op {
            None => return Err(Trap::NoCopyInProgress.err()),
            Some(op) => op.event_pending || op.done.is_some(),
        }
    };
    if finished {
        return consume_copy_event(&mut inner, pipe, side);
    }
    let op = inner.pipes[pipe.0 as usize].end_mut(side).op.take().unwrap();
    debug_assert_eq!(op.progress, 0);
    Ok((CopyResult::Cancelled, op.progress))
}

/// Drops one end of a pipe. The partner's parked copy (if any) resolves as
/// `DROPPED` with its progress so far.
pub(crate) fn drop_end(inner: &mut StoreInner, pipe: PipeId, side: Side) -> Result<()> {
    let end = inner.pipes[pipe.0 as usize].end_mut(side);
    trap_if!(end.op.is_some(), Trap::DroppedWithPendingCopy);
    end.dropped = true;
    finish_parked(inner, pipe, side.other(), CopyResult::Dropped);
    Ok(())
}

/// Builds the buffer for a guest copy, trapping on misalignment or
/// out-of-bounds windows up front.
pub(crate) fn guest_buffer(
    store: &Store,
    opts: &Rc<CanonicalOptions>,
    instance: crate::store::InstanceId,
    payload: &Option<ValType>,
    ptr: u32,
    count: u32,
) -> Result<CopyBuffer> {
    match payload {
        None => Ok(CopyBuffer::Counter { count }),
        // Zero-length copies ignore the address entirely.
        Some(_) if count == 0 => Ok(CopyBuffer::Counter { count }),
        Some(t) => {
            trap_if!(ptr != align_to(ptr, alignment(t)), Trap::MisalignedPointer);
            let byte_len = count as u64 * size(t) as u64;
            trap_if!(
                ptr as u64 + byte_len > opts.memory()?.len() as u64,
                Trap::MemoryOutOfBounds
            );
            Ok(CopyBuffer::Guest {
                cx: LiftLowerCx::new(store, opts, instance),
                ty: t.clone(),
                ptr,
                count,
            })
        }
    }
}

/// Future ends must not start a second copy after the value moved.
pub(crate) fn check_future_reuse(inner: &StoreInner, pipe: PipeId, side: Side) -> Result<()> {
    let p = &inner.pipes[pipe.0 as usize];
    if p.is_future && p.value_transferred {
        return Err(match side {
            Side::Write => Trap::FutureAlreadyWritten.err(),
            Side::Read => Trap::FutureAlreadyRead.err(),
        });
    }
    Ok(())
}

// ===== end transfer (lift/lower) and error contexts =====

/// Lifting a stream value detaches the readable end from the table; the
/// writable end never transfers.
pub(crate) fn lift_stream(cx: &LiftLowerCx, idx: u32) -> Result<Val> {
    let mut inner = cx.store.borrow_mut();
    match inner.instance(cx.instance).table.get(idx)? {
        TableEntry::StreamEnd(e) => {
            trap_if!(e.side != Side::Read, Trap::HandleTypeMismatch);
            trap_if!(
                inner.pipes[e.pipe.0 as usize].end(e.side).op.is_some(),
                Trap::CopyInProgress
            );
        }
        _ => return Err(Trap::HandleTypeMismatch.err()),
    }
    crate::waitable::leave_set(&mut inner, cx.instance, idx);
    match inner.instance_mut(cx.instance).table.remove(idx)? {
        TableEntry::StreamEnd(e) => Ok(Val::Stream(EndTransfer { pipe: e.pipe })),
        _ => unreachable!(),
    }
}

pub(crate) fn lower_stream(cx: &LiftLowerCx, t: &EndTransfer) -> Result<u32> {
    let mut inner = cx.store.borrow_mut();
    debug_assert!(!inner.pipes[t.pipe.0 as usize].is_future);
    inner
        .instance_mut(cx.instance)
        .table
        .add(TableEntry::StreamEnd(StreamEndData {
            pipe: t.pipe,
            side: Side::Read,
            set: None,
        }))
}

pub(crate) fn lift_future(cx: &LiftLowerCx, idx: u32) -> Result<Val> {
    let mut inner = cx.store.borrow_mut();
    match inner.instance(cx.instance).table.get(idx)? {
        TableEntry::FutureEnd(e) => {
            trap_if!(e.side != Side::Read, Trap::HandleTypeMismatch);
            trap_if!(
                inner.pipes[e.pipe.0 as usize].end(e.side).op.is_some(),
                Trap::CopyInProgress
            );
        }
        _ => return Err(Trap::HandleTypeMismatch.err()),
    }
    crate::waitable::leave_set(&mut inner, cx.instance, idx);
    match inner.instance_mut(cx.instance).table.remove(idx)? {
        TableEntry::FutureEnd(e) => Ok(Val::Future(EndTransfer { pipe: e.pipe })),
        _ => unreachable!(),
    }
}

pub(crate) fn lower_future(cx: &LiftLowerCx, t: &EndTransfer) -> Result<u32> {
    let mut inner = cx.store.borrow_mut();
    debug_assert!(inner.pipes[t.pipe.0 as usize].is_future);
    inner
        .instance_mut(cx.instance)
        .table
        .add(TableEntry::FutureEnd(FutureEndData {
            pipe: t.pipe,
            side: Side::Read,
            set: None,
        }))
}

pub(crate) fn lift_error_context(cx: &LiftLowerCx, idx: u32) -> Result<Val> {
    let mut inner = cx.store.borrow_mut();
    match inner.instance_mut(cx.instance).table.remove(idx)? {
        TableEntry::ErrorContext(e) => Ok(Val::ErrorContext(ErrorContextTransfer {
            message: e.message,
        })),
        _ => Err(Trap::HandleTypeMismatch.err()),
    }
}

pub(crate) fn lower_error_context(cx: &LiftLowerCx, t: &ErrorContextTransfer) -> Result<u32> {
    let mut inner = cx.store.borrow_mut();
    inner
        .instance_mut(cx.instance)
        .table
        .add(TableEntry::ErrorContext(ErrorContextData {
            message: t.message.clone(),
        }))
}

// ===== host-side pipe access =====

impl Store {
    /// Creates a pipe whose ends start out host-held; hand either end to a
    /// guest by passing `Val::Stream`/`Val::Future` across a call boundary.
    pub fn new_stream(&self, payload: Option<ValType>) -> PipeId {
        new_pipe(self, payload, false)
    }

    pub fn new_future(&self, payload: Option<ValType>) -> PipeId {
        new_pipe(self, payload, true)
    }

    pub fn drop_host_end(&self, pipe: PipeId, side: Side) -> Result<()> {
        drop_end(&mut self.borrow_mut(), pipe, side)
    }
}

/// Host-side write: blocks the host task until the write fully completes or
/// resolves terminally, and reports how many elements moved.
pub async fn host_write(cx: &TaskCx, pipe: PipeId, values: Vec<Val>) -> Result<(CopyResult, u32)> {
    check_future_reuse(&cx.store.borrow(), pipe, Side::Write)?;
    let buffer = CopyBuffer::HostSource {
        values: values.into(),
    };
    match issue_copy(&cx.store, pipe, Side::Write, buffer)? {
        CopyStatus::Done { result, n, .. } => Ok((result, n)),
        CopyStatus::Parked => {
            let store = cx.store.clone();
            cx.suspend_until_inner(Rc::new(move |inner| {
                end_op_finished(inner, pipe, Side::Write)
            }))
            .await;
            let mut inner = store.borrow_mut();
            consume_copy_event(&mut inner, pipe, Side::Write)
        }
    }
}

/// Host-side read of up to `capacity` elements.
pub async fn host_read(
    cx: &TaskCx,
    pipe: PipeId,
    capacity: u32,
) -> Result<(CopyResult, Vec<Val>)> {
    check_future_reuse(&cx.store.borrow(), pipe, Side::Read)?;
    let buffer = CopyBuffer::HostSink {
        capacity,
        values: Vec::new(),
    };
    match issue_copy(&cx.store, pipe, Side::Read, buffer)? {
        CopyStatus::Done { result, op, .. } => match op.buffer {
            CopyBuffer::HostSink { values, .. } => Ok((result, values)),
            _ => unreachable!(),
        },
        CopyStatus::Parked => {
            let store = cx.store.clone();
            cx.suspend_until_inner(Rc::new(move |inner| {
                end_op_finished(inner, pipe, Side::Read)
            }))
            .await;
            let mut inner = store.borrow_mut();
            let end = inner.pipes[pipe.0 as usize].end_mut(Side::Read);
            let op = end.op.take().ok_or_else(|| Trap::NoCopyInProgress.err())?;
            let result = op.done.unwrap_or(CopyResult::Completed);
            match op.buffer {
                CopyBuffer::HostSink { values, .. } => Ok((result, values)),
                _ => unreachable!(),
            }
        }
    }
}

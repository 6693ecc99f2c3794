//! Stream and future transmission: rendezvous copies, partial transfers,
//! zero-length probes, drop propagation, and the degenerate single-value
//! future rules.

use super::{init_logging, one_u32};
use anyhow::Result;
use canon_abi::canon::{self, unpack_new_ends, unpack_result, BLOCKED};
use canon_abi::types::{FuncType, ValType as T};
use canon_abi::CoreValue::I32;
use canon_abi::{
    host_read, host_write, CopyResult, EndTransfer, EventCode, Memory, Store, SubtaskState,
    Trap, Val,
};
use canon_abi_test_util::{bare_opts, core_fn, host_fn, mem_opts, run_lift, Flag};
use std::cell::RefCell;
use std::rc::Rc;

fn u8_stream() -> T {
    T::stream(Some(T::U8))
}

#[test]
fn wasm_to_wasm_stream() -> Result<()> {
    init_logging();
    let store = Store::new();
    let (fut1, fut2, fut3, fut4) = (Flag::new(), Flag::new(), Flag::new(), Flag::new());

    let inst1 = store.add_instance();
    let mem1 = Memory::new(24);
    let opts1 = mem_opts(&mem1, false);
    let ft1 = Rc::new(FuncType::new([], Some(u8_stream())));
    let func1 = canon::lifted(
        opts1.clone(),
        inst1,
        ft1.clone(),
        core_fn({
            let opts = opts1.clone();
            let mem = mem1.clone();
            let fut1 = fut1.clone();
            let fut2 = fut2.clone();
            let fut3 = fut3.clone();
            let fut4 = fut4.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                let fut1 = fut1.clone();
                let fut2 = fut2.clone();
                let fut3 = fut3.clone();
                let fut4 = fut4.clone();
                async move {
                    let sty = u8_stream();
                    let (rsi, wsi) = unpack_new_ends(canon::stream_new(&cx, &sty)?);
                    canon::task_return(&cx, &opts, Some(&sty), vec![I32(rsi)])?;

                    fut1.wait(&cx).await;

                    mem.write_bytes(0, &[1, 2, 3, 4])?;
                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 0, 4).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 4));
                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 0, 4).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 4));

                    // The reader's budget is spent; even a zero-length write
                    // has nobody to rendezvous with.
                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 0, 0).await?;
                    assert_eq!(ret, BLOCKED);
                    let ret = canon::stream_cancel_write(&cx, false, wsi).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Cancelled as u32, 0));

                    fut2.wait(&cx).await;

                    mem.write_bytes(0, &[5, 6, 7, 8, 9, 10, 11, 12])?;
                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 0, 8).await?;
                    assert_eq!(ret, BLOCKED);

                    fut3.set();

                    let retp = 16;
                    let seti = canon::waitable_set_new(&cx)?;
                    canon::waitable_join(&cx, wsi, seti)?;
                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                    assert_eq!(ev, EventCode::StreamWrite as u32);
                    assert_eq!(mem.read_u32_le(retp)?, wsi);
                    assert_eq!(
                        unpack_result(mem.read_u32_le(retp + 4)?),
                        (CopyResult::Completed as u32, 4)
                    );

                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 12345, 0).await?;
                    assert_eq!(ret, BLOCKED);

                    fut4.set();

                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                    assert_eq!(ev, EventCode::StreamWrite as u32);
                    assert_eq!(mem.read_u32_le(retp)?, wsi);
                    assert_eq!(mem.read_u32_le(retp + 4)?, 0);

                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 12345, 0).await?;
                    assert_eq!(ret, 0);

                    let errctxi = canon::error_context_new(&cx, &opts, 0, 0)?;
                    canon::stream_drop_writable(&cx, wsi)?;
                    canon::waitable_set_drop(&cx, seti)?;
                    canon::error_context_drop(&cx, errctxi)?;
                    Ok(vec![])
                }
            }
        }),
    );

    let inst2 = store.add_instance();
    let mem2 = Memory::new(24);
    let opts2 = mem_opts(&mem2, false);
    let func2 = canon::lifted(
        opts2.clone(),
        inst2,
        Rc::new(FuncType::new([], None)),
        core_fn({
            let opts = opts2.clone();
            let mem = mem2.clone();
            let ft1 = ft1.clone();
            let func1 = func1.clone();
            let fut1 = fut1.clone();
            let fut2 = fut2.clone();
            let fut3 = fut3.clone();
            let fut4 = fut4.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                let ft1 = ft1.clone();
                let func1 = func1.clone();
                let fut1 = fut1.clone();
                let fut2 = fut2.clone();
                let fut3 = fut3.clone();
                let fut4 = fut4.clone();
                async move {
                    let sty = u8_stream();
                    canon::task_return(&cx, &opts, None, vec![])?;

                    let retp = 16;
                    let ret = canon::lower(&cx, &opts, &ft1, &func1, vec![I32(retp)]).await?;
                    assert_eq!(one_u32(&ret), SubtaskState::Returned as u32);
                    let rsi = mem.read_u32_le(retp)?;
                    assert_eq!(rsi, 1);

                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 0, 8).await?;
                    assert_eq!(ret, BLOCKED);

                    fut1.set();

                    let seti = canon::waitable_set_new(&cx)?;
                    canon::waitable_join(&cx, rsi, seti)?;
                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                    assert_eq!(ev, EventCode::StreamRead as u32);
                    assert_eq!(mem.read_u32_le(retp)?, rsi);
                    assert_eq!(
                        unpack_result(mem.read_u32_le(retp + 4)?),
                        (CopyResult::Completed as u32, 8)
                    );
                    assert_eq!(mem.read_bytes(0, 8)?, *b"\x01\x02\x03\x04\x01\x02\x03\x04");

                    fut2.set();
                    fut3.wait(&cx).await;

                    // Data is parked on the other side: a zero-length read
                    // probe learns that without consuming anything.
                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 12345, 0).await?;
                    assert_eq!(ret, 0);

                    mem.write_bytes(0, &[0; 8])?;
                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 0, 2).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));
                    assert_eq!(mem.read_bytes(0, 6)?, *b"\x05\x06\x00\x00\x00\x00");
                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 2, 2).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));
                    assert_eq!(mem.read_bytes(0, 6)?, *b"\x05\x06\x07\x08\x00\x00");

                    fut4.wait(&cx).await;

                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 12345, 0).await?;
                    assert_eq!(ret, BLOCKED);

                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                    assert_eq!(ev, EventCode::StreamRead as u32);
                    assert_eq!(mem.read_u32_le(retp)?, rsi);
                    assert_eq!(
                        unpack_result(mem.read_u32_le(retp + 4)?),
                        (CopyResult::Dropped as u32, 0)
                    );

                    canon::stream_drop_readable(&cx, rsi)?;
                    canon::waitable_set_drop(&cx, seti)?;
                    Ok(vec![])
                }
            }
        }),
    );

    run_lift(&store, &func2, vec![])?;
    store.run_until_quiescent()?;
    Ok(())
}

#[test]
fn wasm_to_wasm_stream_empty_payload() -> Result<()> {
    init_logging();
    let store = Store::new();
    let (fut1, fut2, fut3, fut4) = (Flag::new(), Flag::new(), Flag::new(), Flag::new());

    let inst1 = store.add_instance();
    let mem1 = Memory::new(24);
    let opts1 = mem_opts(&mem1, false);
    let sty = T::stream(None);
    let ft1 = Rc::new(FuncType::new([], Some(sty.clone())));
    let func1 = canon::lifted(
        opts1.clone(),
        inst1,
        ft1.clone(),
        core_fn({
            let opts = opts1.clone();
            let mem = mem1.clone();
            let fut1 = fut1.clone();
            let fut2 = fut2.clone();
            let fut3 = fut3.clone();
            let fut4 = fut4.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                let fut1 = fut1.clone();
                let fut2 = fut2.clone();
                let fut3 = fut3.clone();
                let fut4 = fut4.clone();
                async move {
                    let sty = T::stream(None);
                    let (rsi, wsi) = unpack_new_ends(canon::stream_new(&cx, &sty)?);
                    canon::task_return(&cx, &opts, Some(&sty), vec![I32(rsi)])?;

                    fut1.wait(&cx).await;

                    // The address is ignored for empty payloads; only counts
                    // transfer.
                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 10000, 2).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));
                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 10000, 2).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));

                    fut2.wait(&cx).await;

                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 0, 8).await?;
                    assert_eq!(ret, BLOCKED);

                    fut3.set();

                    let retp = 16;
                    let seti = canon::waitable_set_new(&cx)?;
                    canon::waitable_join(&cx, wsi, seti)?;
                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                    assert_eq!(ev, EventCode::StreamWrite as u32);
                    assert_eq!(mem.read_u32_le(retp)?, wsi);
                    assert_eq!(
                        unpack_result(mem.read_u32_le(retp + 4)?),
                        (CopyResult::Completed as u32, 4)
                    );

                    fut4.set();

                    canon::stream_drop_writable(&cx, wsi)?;
                    canon::waitable_set_drop(&cx, seti)?;
                    Ok(vec![])
                }
            }
        }),
    );

    let inst2 = store.add_instance();
    let mem2 = Memory::new(16);
    let opts2 = mem_opts(&mem2, false);
    let func2 = canon::lifted(
        opts2.clone(),
        inst2,
        Rc::new(FuncType::new([], None)),
        core_fn({
            let opts = opts2.clone();
            let mem = mem2.clone();
            let ft1 = ft1.clone();
            let func1 = func1.clone();
            let fut1 = fut1.clone();
            let fut2 = fut2.clone();
            let fut3 = fut3.clone();
            let fut4 = fut4.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                let ft1 = ft1.clone();
                let func1 = func1.clone();
                let fut1 = fut1.clone();
                let fut2 = fut2.clone();
                let fut3 = fut3.clone();
                let fut4 = fut4.clone();
                async move {
                    let sty = T::stream(None);
                    canon::task_return(&cx, &opts, None, vec![])?;

                    let retp = 0;
                    let ret = canon::lower(&cx, &opts, &ft1, &func1, vec![I32(retp)]).await?;
                    assert_eq!(one_u32(&ret), SubtaskState::Returned as u32);
                    let rsi = mem.read_u32_le(retp)?;

                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 0, 8).await?;
                    assert_eq!(ret, BLOCKED);

                    fut1.set();

                    let seti = canon::waitable_set_new(&cx)?;
                    canon::waitable_join(&cx, rsi, seti)?;
                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                    assert_eq!(ev, EventCode::StreamRead as u32);
                    assert_eq!(mem.read_u32_le(retp)?, rsi);
                    assert_eq!(
                        unpack_result(mem.read_u32_le(retp + 4)?),
                        (CopyResult::Completed as u32, 4)
                    );

                    fut2.set();
                    fut3.wait(&cx).await;

                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 1_000_000, 2).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));
                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 1_000_000, 2).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));

                    fut4.wait(&cx).await;

                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 1_000_000, 2).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Dropped as u32, 0));
                    canon::stream_drop_readable(&cx, rsi)?;
                    canon::waitable_set_drop(&cx, seti)?;
                    Ok(vec![])
                }
            }
        }),
    );

    run_lift(&store, &func2, vec![])?;
    store.run_until_quiescent()?;
    Ok(())
}

/// One task holding both ends of its own pipes: a pure-signal future and an
/// empty-payload stream, with the stream's writer observing `DROPPED` with
/// its full progress once the reader closes.
#[test]
fn self_ping_empty_payloads() -> Result<()> {
    init_logging();
    let store = Store::new();
    let inst = store.add_instance();
    let mem = Memory::new(24);
    let sync_opts = mem_opts(&mem, true);
    let async_opts = mem_opts(&mem, false);

    let func = canon::lifted(
        sync_opts.clone(),
        inst,
        Rc::new(FuncType::new([], None)),
        core_fn({
            let async_opts = async_opts.clone();
            let mem = mem.clone();
            move |cx, _args| {
                let async_opts = async_opts.clone();
                let mem = mem.clone();
                async move {
                    let fty = T::future(None);
                    let sty = T::stream(None);
                    let seti = canon::waitable_set_new(&cx)?;

                    let (rfi, wfi) = unpack_new_ends(canon::future_new(&cx, &fty)?);
                    let ret =
                        canon::future_write(&cx, &fty, &async_opts, wfi, 0xdead_beef).await?;
                    assert_eq!(ret, BLOCKED);
                    let ret =
                        canon::future_read(&cx, &fty, &async_opts, rfi, 0xdead_beef).await?;
                    assert_eq!(ret, CopyResult::Completed as u32);
                    canon::future_drop_readable(&cx, rfi)?;

                    canon::waitable_join(&cx, wfi, seti)?;
                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, 0).await?;
                    assert_eq!(ev, EventCode::FutureWrite as u32);
                    assert_eq!(mem.read_u32_le(0)?, wfi);
                    assert_eq!(mem.read_u32_le(4)?, CopyResult::Completed as u32);
                    canon::future_drop_writable(&cx, wfi)?;

                    let (rsi, wsi) = unpack_new_ends(canon::stream_new(&cx, &sty)?);
                    let ret =
                        canon::stream_write(&cx, &sty, &async_opts, wsi, 10000, 3).await?;
                    assert_eq!(ret, BLOCKED);

                    let ret = canon::stream_read(&cx, &sty, &async_opts, rsi, 2000, 1).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 1));
                    let ret = canon::stream_read(&cx, &sty, &async_opts, rsi, 2000, 4).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));
                    canon::stream_drop_readable(&cx, rsi)?;

                    canon::waitable_join(&cx, wsi, seti)?;
                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, 0).await?;
                    assert_eq!(ev, EventCode::StreamWrite as u32);
                    assert_eq!(mem.read_u32_le(0)?, wsi);
                    assert_eq!(
                        unpack_result(mem.read_u32_le(4)?),
                        (CopyResult::Dropped as u32, 3)
                    );
                    canon::stream_drop_writable(&cx, wsi)?;

                    canon::waitable_set_drop(&cx, seti)?;
                    Ok(vec![])
                }
            }
        }),
    );

    run_lift(&store, &func, vec![])?;
    Ok(())
}

#[test]
fn future_exchange_with_host() -> Result<()> {
    init_logging();
    let store = Store::new();
    let inst = store.add_instance();
    let mem = Memory::new(24);
    let lower_opts = mem_opts(&mem, false);
    let fty = T::future(Some(T::U8));

    let host_ft = Rc::new(FuncType::new([fty.clone()], Some(fty.clone())));
    let host_func = host_fn({
        let store = store.clone();
        move |cx, args| {
            let store = store.clone();
            async move {
                let Val::Future(incoming) = &args[0] else { panic!() };
                let incoming = incoming.pipe;
                let outgoing = store.new_future(Some(T::U8));
                cx.host_return(vec![Val::Future(EndTransfer { pipe: outgoing })])?;
                let (result, vals) = host_read(&cx, incoming, 1).await?;
                assert_eq!(result, CopyResult::Completed);
                assert_eq!(vals, vec![Val::U8(42)]);
                let (result, _) = host_write(&cx, outgoing, vec![Val::U8(43)]).await?;
                assert_eq!(result, CopyResult::Completed);
                Ok(None)
            }
        }
    });

    let func = canon::lifted(
        bare_opts(true),
        inst,
        Rc::new(FuncType::new([], None)),
        core_fn({
            let opts = lower_opts.clone();
            let mem = mem.clone();
            let host_ft = host_ft.clone();
            let host_func = host_func.clone();
            let store2 = store.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                let host_ft = host_ft.clone();
                let host_func = host_func.clone();
                let store2 = store2.clone();
                async move {
                    let fty = T::future(Some(T::U8));
                    let instance = cx.instance();

                    // Round one: wait for the reply through a waitable set.
                    let (rfi, wfi) = unpack_new_ends(canon::future_new(&cx, &fty)?);
                    let retp = 16;
                    let ret = canon::lower(
                        &cx,
                        &opts,
                        &host_ft,
                        &host_func,
                        vec![I32(rfi), I32(retp)],
                    )
                    .await?;
                    assert_eq!(one_u32(&ret), SubtaskState::Returned as u32);
                    let rfi2 = mem.read_u32_le(retp)?;

                    let readp = 0;
                    let ret = canon::future_read(&cx, &fty, &opts, rfi2, readp).await?;
                    assert_eq!(ret, BLOCKED);

                    let writep = 8;
                    mem.set(writep, 42);
                    let ret = canon::future_write(&cx, &fty, &opts, wfi, writep).await?;
                    assert_eq!(ret, CopyResult::Completed as u32);

                    let seti = canon::waitable_set_new(&cx)?;
                    canon::waitable_join(&cx, rfi2, seti)?;
                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                    assert_eq!(ev, EventCode::FutureRead as u32);
                    assert_eq!(mem.read_u32_le(retp)?, rfi2);
                    assert_eq!(mem.read_u32_le(retp + 4)?, CopyResult::Completed as u32);
                    assert_eq!(mem.get(readp), 43);

                    canon::future_drop_writable(&cx, wfi)?;
                    canon::future_drop_readable(&cx, rfi2)?;
                    canon::waitable_set_drop(&cx, seti)?;

                    // Round two: cancel a read whose completion is already
                    // pending; the value is delivered as COMPLETED.
                    let (rfi, wfi) = unpack_new_ends(canon::future_new(&cx, &fty)?);
                    let ret = canon::lower(
                        &cx,
                        &opts,
                        &host_ft,
                        &host_func,
                        vec![I32(rfi), I32(retp)],
                    )
                    .await?;
                    assert_eq!(one_u32(&ret), SubtaskState::Returned as u32);
                    let rfi2 = mem.read_u32_le(retp)?;

                    let ret = canon::future_read(&cx, &fty, &opts, rfi2, readp).await?;
                    assert_eq!(ret, BLOCKED);
                    mem.set(writep, 42);
                    let ret = canon::future_write(&cx, &fty, &opts, wfi, writep).await?;
                    assert_eq!(ret, CopyResult::Completed as u32);

                    while !store2.has_pending_event(instance, rfi2) {
                        canon::yield_(&cx, true).await?;
                    }
                    let ret = canon::future_cancel_read(&cx, true, rfi2).await?;
                    assert_eq!(ret, CopyResult::Completed as u32);
                    assert_eq!(mem.get(readp), 43);

                    canon::future_drop_writable(&cx, wfi)?;
                    canon::future_drop_readable(&cx, rfi2)?;
                    Ok(vec![])
                }
            }
        }),
    );

    run_lift(&store, &func, vec![])?;
    store.run_until_quiescent()?;
    Ok(())
}

#[test]
fn future_drop_rules() -> Result<()> {
    init_logging();
    let store = Store::new();
    let inst = store.add_instance();
    let mem = Memory::new(8);
    let opts = mem_opts(&mem, false);

    let func = canon::lifted(
        bare_opts(true),
        inst,
        Rc::new(FuncType::new([], None)),
        core_fn({
            let opts = opts.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                async move {
                    let fty = T::future(Some(T::U8));

                    // Dropping an unwritten writable is allowed; the reader
                    // then observes DROPPED.
                    let (rfi, wfi) = unpack_new_ends(canon::future_new(&cx, &fty)?);
                    canon::future_drop_writable(&cx, wfi)?;
                    let ret = canon::future_read(&cx, &fty, &opts, rfi, 0).await?;
                    assert_eq!(ret, CopyResult::Dropped as u32);
                    canon::future_drop_readable(&cx, rfi)?;

                    // Dropping a writable with a write in flight traps.
                    let (rfi, wfi) = unpack_new_ends(canon::future_new(&cx, &fty)?);
                    mem.set(0, 7);
                    let ret = canon::future_write(&cx, &fty, &opts, wfi, 0).await?;
                    assert_eq!(ret, BLOCKED);
                    let err = canon::future_drop_writable(&cx, wfi).unwrap_err();
                    assert_eq!(
                        err.downcast_ref::<Trap>(),
                        Some(&Trap::DroppedWithPendingCopy)
                    );
                    let ret = canon::future_cancel_write(&cx, true, wfi).await?;
                    assert_eq!(ret, CopyResult::Cancelled as u32);
                    canon::future_drop_writable(&cx, wfi)?;
                    canon::future_drop_readable(&cx, rfi)?;

                    // A future carries exactly one value: writing again
                    // after a completed transfer traps.
                    let (rfi, wfi) = unpack_new_ends(canon::future_new(&cx, &fty)?);
                    let ret = canon::future_read(&cx, &fty, &opts, rfi, 4).await?;
                    assert_eq!(ret, BLOCKED);
                    mem.set(0, 9);
                    let ret = canon::future_write(&cx, &fty, &opts, wfi, 0).await?;
                    assert_eq!(ret, CopyResult::Completed as u32);
                    let err = canon::future_write(&cx, &fty, &opts, wfi, 0)
                        .await
                        .unwrap_err();
                    assert_eq!(
                        err.downcast_ref::<Trap>(),
                        Some(&Trap::FutureAlreadyWritten)
                    );
                    // The parked read finished; consume its event via cancel
                    // and clean up.
                    let ret = canon::future_cancel_read(&cx, true, rfi).await?;
                    assert_eq!(ret, CopyResult::Completed as u32);
                    assert_eq!(mem.get(4), 9);
                    canon::future_drop_readable(&cx, rfi)?;
                    canon::future_drop_writable(&cx, wfi)?;
                    Ok(vec![])
                }
            }
        }),
    );

    run_lift(&store, &func, vec![])?;
    Ok(())
}

#[test]
fn stream_forward_is_identity() -> Result<()> {
    init_logging();
    let store = Store::new();
    let inst = store.add_instance();
    let pipe = store.new_stream(Some(T::U8));

    let sty = u8_stream();
    let func = canon::lifted(
        bare_opts(true),
        inst,
        Rc::new(FuncType::new([sty.clone()], Some(sty.clone()))),
        core_fn(|_cx, args| async move {
            assert_eq!(args, vec![I32(1)]);
            Ok(vec![I32(1)])
        }),
    );

    let got = run_lift(&store, &func, vec![Val::Stream(EndTransfer { pipe })])?;
    assert_eq!(got, vec![Val::Stream(EndTransfer { pipe })]);
    Ok(())
}

#[test]
fn receive_own_stream_back() -> Result<()> {
    init_logging();
    let store = Store::new();
    let inst = store.add_instance();
    let mem = Memory::new(16);
    let opts = mem_opts(&mem, false);

    let host_ft = Rc::new(FuncType::new([u8_stream()], Some(u8_stream())));
    let host_echo = host_fn(|_cx, args| async move { Ok(Some(args)) });

    let func = canon::lifted(
        bare_opts(true),
        inst,
        Rc::new(FuncType::new([], None)),
        core_fn({
            let opts = opts.clone();
            let mem = mem.clone();
            let host_ft = host_ft.clone();
            let host_echo = host_echo.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                let host_ft = host_ft.clone();
                let host_echo = host_echo.clone();
                async move {
                    let sty = u8_stream();
                    let (rsi, wsi) = unpack_new_ends(canon::stream_new(&cx, &sty)?);
                    assert_eq!((rsi, wsi), (1, 2));
                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 0, 4).await?;
                    assert_eq!(ret, BLOCKED);

                    // Sending the readable end away frees its slot; getting
                    // it back re-occupies the same one.
                    let retp = 8;
                    let ret = canon::lower(
                        &cx,
                        &opts,
                        &host_ft,
                        &host_echo,
                        vec![I32(rsi), I32(retp)],
                    )
                    .await?;
                    assert_eq!(one_u32(&ret), SubtaskState::Returned as u32);
                    let rsi2 = mem.read_u32_le(retp)?;
                    assert_eq!(rsi2, 1);

                    let ret = canon::stream_cancel_write(&cx, true, wsi).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Cancelled as u32, 0));
                    canon::stream_drop_writable(&cx, wsi)?;
                    let ret = canon::stream_read(&cx, &sty, &opts, rsi2, 0, 1).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Dropped as u32, 0));
                    canon::stream_drop_readable(&cx, rsi2)?;
                    Ok(vec![])
                }
            }
        }),
    );

    run_lift(&store, &func, vec![])?;
    Ok(())
}

#[test]
fn host_partial_reads_and_writes() -> Result<()> {
    init_logging();
    let store = Store::new();
    let inst = store.add_instance();
    let mem = Memory::new(20);
    let opts = mem_opts(&mem, false);

    // Source side: the host trickles out two elements at a time.
    let src_pipe = store.new_stream(Some(T::U8));
    let src_more = Flag::new();
    let host_source = host_fn({
        let src_more = src_more.clone();
        move |cx, args| {
            let src_more = src_more.clone();
            async move {
                assert!(args.is_empty());
                cx.host_return(vec![Val::Stream(EndTransfer { pipe: src_pipe })])?;
                for chunk in [[1u8, 2], [3, 4]] {
                    let (result, n) =
                        host_write(&cx, src_pipe, chunk.iter().map(|&b| Val::U8(b)).collect())
                            .await?;
                    assert_eq!((result, n), (CopyResult::Completed, 2));
                }
                src_more.wait(&cx).await;
                let (result, n) =
                    host_write(&cx, src_pipe, vec![Val::U8(5), Val::U8(6)]).await?;
                assert_eq!((result, n), (CopyResult::Completed, 2));
                Ok(None)
            }
        }
    });
    let source_ft = Rc::new(FuncType::new([], Some(u8_stream())));

    // Sink side: the host accepts two, then four more when prodded.
    let sink_more = Flag::new();
    let sink_got: Rc<RefCell<Vec<Val>>> = Rc::new(RefCell::new(Vec::new()));
    let sink_closed = Flag::new();
    let host_sink = host_fn({
        let sink_more = sink_more.clone();
        let sink_got = sink_got.clone();
        let sink_closed = sink_closed.clone();
        move |cx, args| {
            let sink_more = sink_more.clone();
            let sink_got = sink_got.clone();
            let sink_closed = sink_closed.clone();
            async move {
                let Val::Stream(t) = &args[0] else { panic!() };
                let pipe = t.pipe;
                cx.host_return(vec![])?;
                let (result, vals) = host_read(&cx, pipe, 2).await?;
                assert_eq!(result, CopyResult::Completed);
                sink_got.borrow_mut().extend(vals);
                sink_more.wait(&cx).await;
                let (result, vals) = host_read(&cx, pipe, 4).await?;
                assert_eq!(result, CopyResult::Completed);
                sink_got.borrow_mut().extend(vals);
                let (result, vals) = host_read(&cx, pipe, 1).await?;
                assert_eq!(result, CopyResult::Dropped);
                assert!(vals.is_empty());
                sink_closed.set();
                Ok(None)
            }
        }
    });
    let sink_ft = Rc::new(FuncType::new([u8_stream()], None));

    let func = canon::lifted(
        bare_opts(true),
        inst,
        Rc::new(FuncType::new([], None)),
        core_fn({
            let opts = opts.clone();
            let mem = mem.clone();
            let host_source = host_source.clone();
            let source_ft = source_ft.clone();
            let host_sink = host_sink.clone();
            let sink_ft = sink_ft.clone();
            let src_more = src_more.clone();
            let sink_more = sink_more.clone();
            let sink_got = sink_got.clone();
            let sink_closed = sink_closed.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                let host_source = host_source.clone();
                let source_ft = source_ft.clone();
                let host_sink = host_sink.clone();
                let sink_ft = sink_ft.clone();
                let src_more = src_more.clone();
                let sink_more = sink_more.clone();
                let sink_got = sink_got.clone();
                let sink_closed = sink_closed.clone();
                async move {
                    let sty = u8_stream();
                    let retp = 4;
                    let ret =
                        canon::lower(&cx, &opts, &source_ft, &host_source, vec![I32(retp)])
                            .await?;
                    assert_eq!(one_u32(&ret), SubtaskState::Returned as u32);
                    let rsi = mem.read_u32_le(retp)?;

                    // Host writes arrive in chunks smaller than our reads:
                    // each read completes with what is parked.
                    let mut yielded = 0;
                    while yielded < 2 {
                        canon::yield_(&cx, true).await?;
                        yielded += 1;
                    }
                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 0, 4).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));
                    assert_eq!(mem.read_bytes(0, 2)?, *b"\x01\x02");
                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 0, 4).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));
                    assert_eq!(mem.read_bytes(0, 2)?, *b"\x03\x04");
                    let ret = canon::stream_read(&cx, &sty, &opts, rsi, 0, 4).await?;
                    assert_eq!(ret, BLOCKED);
                    src_more.set();

                    let seti = canon::waitable_set_new(&cx)?;
                    canon::waitable_join(&cx, rsi, seti)?;
                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                    assert_eq!(ev, EventCode::StreamRead as u32);
                    assert_eq!(mem.read_u32_le(retp)?, rsi);
                    assert_eq!(
                        unpack_result(mem.read_u32_le(retp + 4)?),
                        (CopyResult::Completed as u32, 2)
                    );
                    canon::stream_drop_readable(&cx, rsi)?;

                    // Now the mirror image: our writes against a slower
                    // reader complete partially.
                    let (rsi2, wsi) = unpack_new_ends(canon::stream_new(&cx, &sty)?);
                    let ret =
                        canon::lower(&cx, &opts, &sink_ft, &host_sink, vec![I32(rsi2)]).await?;
                    assert_eq!(one_u32(&ret), SubtaskState::Returned as u32);
                    mem.write_bytes(0, &[1, 2, 3, 4, 5, 6])?;
                    // Give the sink's first two-element read a chance to
                    // park.
                    canon::yield_(&cx, true).await?;
                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 0, 6).await?;
                    assert_eq!(unpack_result(ret), (CopyResult::Completed as u32, 2));
                    let ret = canon::stream_write(&cx, &sty, &opts, wsi, 2, 4).await?;
                    assert_eq!(ret, BLOCKED);
                    sink_more.set();

                    canon::waitable_join(&cx, wsi, seti)?;
                    let ev = canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                    assert_eq!(ev, EventCode::StreamWrite as u32);
                    assert_eq!(mem.read_u32_le(retp)?, wsi);
                    assert_eq!(
                        unpack_result(mem.read_u32_le(retp + 4)?),
                        (CopyResult::Completed as u32, 4)
                    );
                    canon::stream_drop_writable(&cx, wsi)?;
                    canon::waitable_set_drop(&cx, seti)?;

                    while !sink_closed.is_set() {
                        canon::yield_(&cx, true).await?;
                    }
                    assert_eq!(
                        *sink_got.borrow(),
                        (1..=6).map(Val::U8).collect::<Vec<_>>()
                    );
                    Ok(vec![])
                }
            }
        }),
    );

    run_lift(&store, &func, vec![])?;
    store.run_until_quiescent()?;
    Ok(())
}

/// Producer/consumer over a `stream<u8>`: eight elements in two chunks of
/// four, transformed by +10 on the consuming side.
#[test]
fn producer_consumer_with_transform() -> Result<()> {
    init_logging();
    let store = Store::new();

    let producer_inst = store.add_instance();
    let producer_mem = Memory::new(16);
    let producer_opts = mem_opts(&producer_mem, false);
    let sty = u8_stream();
    let producer_ft = Rc::new(FuncType::new([], Some(sty.clone())));
    let producer = canon::lifted(
        producer_opts.clone(),
        producer_inst,
        producer_ft.clone(),
        core_fn({
            let opts = producer_opts.clone();
            let mem = producer_mem.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                async move {
                    let sty = u8_stream();
                    let (rsi, wsi) = unpack_new_ends(canon::stream_new(&cx, &sty)?);
                    canon::task_return(&cx, &opts, Some(&sty), vec![I32(rsi)])?;
                    for chunk in [[1u8, 2, 3, 4], [5, 6, 7, 8]] {
                        mem.write_bytes(0, &chunk)?;
                        let mut sent = 0;
                        while sent < 4 {
                            let ret =
                                canon::stream_write(&cx, &sty, &opts, wsi, sent, 4 - sent)
                                    .await?;
                            if ret == BLOCKED {
                                canon::yield_(&cx, true).await?;
                                let ret =
                                    canon::stream_cancel_write(&cx, true, wsi).await?;
                                let (_result, n) = unpack_result(ret);
                                sent += n;
                            } else {
                                let (result, n) = unpack_result(ret);
                                assert_eq!(result, CopyResult::Completed as u32);
                                sent += n;
                            }
                        }
                    }
                    canon::stream_drop_writable(&cx, wsi)?;
                    Ok(vec![])
                }
            }
        }),
    );

    let consumer_inst = store.add_instance();
    let consumer_mem = Memory::new(16);
    let consumer_opts = mem_opts(&consumer_mem, false);
    let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let consumer = canon::lifted(
        consumer_opts.clone(),
        consumer_inst,
        Rc::new(FuncType::new([], None)),
        core_fn({
            let opts = consumer_opts.clone();
            let mem = consumer_mem.clone();
            let producer_ft = producer_ft.clone();
            let producer = producer.clone();
            let got = got.clone();
            move |cx, _args| {
                let opts = opts.clone();
                let mem = mem.clone();
                let producer_ft = producer_ft.clone();
                let producer = producer.clone();
                let got = got.clone();
                async move {
                    let sty = u8_stream();
                    canon::task_return(&cx, &opts, None, vec![])?;
                    let retp = 8;
                    let ret =
                        canon::lower(&cx, &opts, &producer_ft, &producer, vec![I32(retp)])
                            .await?;
                    assert_eq!(one_u32(&ret), SubtaskState::Returned as u32);
                    let rsi = mem.read_u32_le(retp)?;

                    loop {
                        let ret = canon::stream_read(&cx, &sty, &opts, rsi, 0, 4).await?;
                        let packed = if ret == BLOCKED {
                            let seti = canon::waitable_set_new(&cx)?;
                            canon::waitable_join(&cx, rsi, seti)?;
                            let ev =
                                canon::waitable_set_wait(&cx, true, &mem, seti, retp).await?;
                            assert_eq!(ev, EventCode::StreamRead as u32);
                            canon::waitable_join(&cx, rsi, 0)?;
                            canon::waitable_set_drop(&cx, seti)?;
                            mem.read_u32_le(retp + 4)?
                        } else {
                            ret
                        };
                        let (result, n) = unpack_result(packed);
                        for i in 0..n {
                            got.borrow_mut().push(mem.get(i) + 10);
                        }
                        if result == CopyResult::Dropped as u32 {
                            break;
                        }
                    }
                    canon::stream_drop_readable(&cx, rsi)?;
                    Ok(vec![])
                }
            }
        }),
    );

    run_lift(&store, &consumer, vec![])?;
    store.run_until_quiescent()?;
    assert_eq!(*got.borrow(), (11..=18).collect::<Vec<u8>>());
    Ok(())
}

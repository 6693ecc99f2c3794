//! Shared pieces for canon-abi tests: a bump-allocating heap with canonical
//! `realloc` semantics, host-settable flags, and adapters that turn async
//! closures into guest core functions and host imports.

use anyhow::{anyhow, Result};
use canon_abi::canon;
use canon_abi::{
    Callee, CanonicalOptions, CoreFn, CoreValue, LiftLowerCx, Memory, ReallocFn, Store,
    StringEncoding, TaskCx, Val,
};
use canon_abi_types::align_to;
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

/// A test heap: linear memory plus a bump allocator exposed through the
/// canonical `realloc` signature. Shrinking returns the (re-aligned)
/// original pointer; growing bumps and copies.
pub struct Heap {
    pub memory: Memory,
    last_alloc: Cell<u32>,
}

impl Heap {
    pub fn new(size: usize) -> Rc<Heap> {
        Rc::new(Heap {
            memory: Memory::new(size),
            last_alloc: Cell::new(0),
        })
    }

    pub fn realloc_fn(self: &Rc<Heap>) -> ReallocFn {
        let heap = self.clone();
        Rc::new(move |original_ptr, original_size, align, new_size| {
            heap.realloc(original_ptr, original_size, align, new_size)
        })
    }

    fn realloc(&self, original_ptr: u32, original_size: u32, align: u32, new_size: u32) -> Result<u32> {
        if original_ptr != 0 && new_size < original_size {
            return Ok(align_to(original_ptr, align));
        }
        let ret = align_to(self.last_alloc.get(), align);
        self.last_alloc.set(ret + new_size);
        if self.last_alloc.get() as usize > self.memory.len() {
            return Err(anyhow!("test heap exhausted"));
        }
        let keep = original_size.min(new_size);
        if original_ptr != 0 && keep > 0 {
            let bytes = self.memory.read_bytes(original_ptr, keep)?;
            self.memory.write_bytes(ret, &bytes)?;
        }
        Ok(ret)
    }
}

/// A host-settable condition for gating guest progress from test code, in
/// the role a real embedder's I/O readiness would play.
#[derive(Clone, Default)]
pub struct Flag(Rc<Cell<bool>>);

impl Flag {
    pub fn new() -> Flag {
        Flag::default()
    }

    pub fn set(&self) {
        self.0.set(true);
    }

    pub fn clear(&self) {
        self.0.set(false);
    }

    pub fn is_set(&self) -> bool {
        self.0.get()
    }

    /// Suspends the given task until this flag is set.
    pub async fn wait(&self, cx: &TaskCx) {
        let flag = self.clone();
        cx.suspend_until(move || flag.is_set()).await
    }
}

pub fn bare_opts(sync: bool) -> Rc<CanonicalOptions> {
    Rc::new(CanonicalOptions {
        sync,
        ..CanonicalOptions::default()
    })
}

pub fn mem_opts(memory: &Memory, sync: bool) -> Rc<CanonicalOptions> {
    Rc::new(CanonicalOptions {
        memory: Some(memory.clone()),
        sync,
        ..CanonicalOptions::default()
    })
}

pub fn heap_opts(heap: &Rc<Heap>, encoding: StringEncoding, sync: bool) -> Rc<CanonicalOptions> {
    Rc::new(CanonicalOptions {
        memory: Some(heap.memory.clone()),
        realloc: Some(heap.realloc_fn()),
        string_encoding: encoding,
        sync,
        ..CanonicalOptions::default()
    })
}

/// A lift/lower context over a fresh store and instance, for codec-level
/// tests that don't need a running task.
pub fn mk_cx(opts: Rc<CanonicalOptions>) -> LiftLowerCx {
    let store = Store::new();
    let instance = store.add_instance();
    LiftLowerCx::new(&store, &opts, instance)
}

/// Adapts an async closure into a guest core function.
pub fn core_fn<F, Fut>(f: F) -> CoreFn
where
    F: Fn(TaskCx, Vec<CoreValue>) -> Fut + 'static,
    Fut: Future<Output = Result<Vec<CoreValue>>> + 'static,
{
    Rc::new(move |cx, args| f(cx, args).boxed_local())
}

/// Adapts an async closure into a callback-mode callback.
pub fn callback_fn<F, Fut>(f: F) -> canon_abi::CallbackFn
where
    F: Fn(TaskCx, u32, u32, u32) -> Fut + 'static,
    Fut: Future<Output = Result<u32>> + 'static,
{
    Rc::new(move |cx, event, index, payload| f(cx, event, index, payload).boxed_local())
}

/// Adapts an async closure into a host import. Returning `Some(results)`
/// resolves the call; return `None` after resolving early with
/// `cx.host_return` (the body may keep running).
pub fn host_fn<F, Fut>(f: F) -> Callee
where
    F: Fn(TaskCx, Vec<Val>) -> Fut + 'static,
    Fut: Future<Output = Result<Option<Vec<Val>>>> + 'static,
{
    canon::host_import(Rc::new(move |cx, args| f(cx, args).boxed_local()))
}

/// Invokes a lifted function with the given arguments and runs the store
/// until the call's thread exits, returning the results.
pub fn run_lift(store: &Store, callee: &Callee, args: Vec<Val>) -> Result<Vec<Val>> {
    let got: Rc<RefCell<Option<Option<Vec<Val>>>>> = Rc::new(RefCell::new(None));
    let task = store.invoke(
        callee,
        Box::new(move |_, _| Ok(args)),
        {
            let got = got.clone();
            Box::new(move |_, results| {
                *got.borrow_mut() = Some(results);
                Ok(())
            })
        },
    )?;
    store.run_until_done(task)?;
    let outcome = got
        .borrow_mut()
        .take()
        .ok_or_else(|| anyhow!("lifted call never resolved"))?;
    outcome.ok_or_else(|| anyhow!("lifted call was cancelled"))
}

/// Structural equality that ignores how strings were encoded on the way in.
pub fn equal_modulo_string_encoding(a: &Val, b: &Val) -> bool {
    match (a, b) {
        (Val::String(x), Val::String(y)) => x.value == y.value,
        (Val::List(xs), Val::List(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|(x, y)| equal_modulo_string_encoding(x, y))
        }
        (Val::Record(xs), Val::Record(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|((nx, x), (ny, y))| nx == ny && equal_modulo_string_encoding(x, y))
        }
        (Val::Variant(lx, px), Val::Variant(ly, py)) => {
            lx == ly
                && match (px, py) {
                    (Some(x), Some(y)) => equal_modulo_string_encoding(x, y),
                    (None, None) => true,
                    _ => false,
                }
        }
        (a, b) => a == b,
    }
}

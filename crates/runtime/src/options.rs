//! Canonical options: the host-provided knobs attached to every lifted or
//! lowered function, plus the context threaded through every lift/lower.

use crate::store::{InstanceId, Store, TaskCx, TaskId};
use crate::trap::{trap_if, Trap};
use crate::values::CoreValue;
use anyhow::Result;
use futures::future::LocalBoxFuture;
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StringEncoding {
    Utf8,
    Utf16,
    Latin1Utf16,
}

/// A linear memory shared between the host, guest code, and the runtime.
#[derive(Clone)]
pub struct Memory(Rc<RefCell<Vec<u8>>>);

impl Memory {
    pub fn new(size: usize) -> Memory {
        Memory(Rc::new(RefCell::new(vec![0; size])))
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Memory {
        Memory(Rc::new(RefCell::new(bytes.into())))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> Ref<'_, Vec<u8>> {
        self.0.borrow()
    }

    pub fn bytes_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.0.borrow_mut()
    }

    /// Grows the memory to at least `len` bytes. Test heaps use this; real
    /// embedders grow through their own `realloc`.
    pub fn grow_to(&self, len: usize) {
        let mut bytes = self.0.borrow_mut();
        if bytes.len() < len {
            bytes.resize(len, 0);
        }
    }

    pub fn get(&self, ptr: u32) -> u8 {
        self.0.borrow()[ptr as usize]
    }

    pub fn set(&self, ptr: u32, v: u8) {
        self.0.borrow_mut()[ptr as usize] = v;
    }

    pub(crate) fn check_bounds(&self, ptr: u32, len: u32) -> Result<()> {
        let end = (ptr as u64) + (len as u64);
        trap_if!(end > self.len() as u64, Trap::MemoryOutOfBounds);
        Ok(())
    }

    pub fn read_bytes(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        self.check_bounds(ptr, len)?;
        let bytes = self.0.borrow();
        Ok(bytes[ptr as usize..(ptr + len) as usize].to_vec())
    }

    pub fn write_bytes(&self, ptr: u32, data: &[u8]) -> Result<()> {
        self.check_bounds(ptr, data.len() as u32)?;
        let mut bytes = self.0.borrow_mut();
        bytes[ptr as usize..ptr as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32_le(&self, ptr: u32) -> Result<u32> {
        let b = self.read_bytes(ptr, 4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn write_u32_le(&self, ptr: u32, v: u32) -> Result<()> {
        self.write_bytes(ptr, &v.to_le_bytes())
    }
}

/// `realloc(old_ptr, old_size, align, new_size) -> new_ptr`.
pub type ReallocFn = Rc<dyn Fn(u32, u32, u32, u32) -> Result<u32>>;

pub type PostReturnFn = Rc<dyn Fn() -> Result<()>>;

/// A guest core function: receives flat arguments, returns flat results,
/// suspending at explicit builtin calls only.
pub type CoreFn = Rc<dyn Fn(TaskCx, Vec<CoreValue>) -> LocalBoxFuture<'static, Result<Vec<CoreValue>>>>;

/// A guest callback for callback-mode async lifts: `(event, index, payload)`
/// in, packed callback code out.
pub type CallbackFn = Rc<dyn Fn(TaskCx, u32, u32, u32) -> LocalBoxFuture<'static, Result<u32>>>;

/// The canonical options of one `canon lift` or `canon lower` definition.
#[derive(Clone)]
pub struct CanonicalOptions {
    pub memory: Option<Memory>,
    pub realloc: Option<ReallocFn>,
    pub post_return: Option<PostReturnFn>,
    pub string_encoding: StringEncoding,
    pub sync: bool,
    pub callback: Option<CallbackFn>,
}

impl Default for CanonicalOptions {
    fn default() -> CanonicalOptions {
        CanonicalOptions {
            memory: None,
            realloc: None,
            post_return: None,
            string_encoding: StringEncoding::Utf8,
            sync: true,
            callback: None,
        }
    }
}

impl CanonicalOptions {
    pub(crate) fn memory(&self) -> Result<&Memory> {
        match &self.memory {
            Some(m) => Ok(m),
            None => Err(Trap::MemoryOutOfBounds.err()),
        }
    }

    pub(crate) fn realloc(&self, old: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32> {
        let f = self
            .realloc
            .as_ref()
            .ok_or_else(|| Trap::BadRealloc.err())?;
        let ptr = f(old, old_size, align, new_size)?;
        // The returned region must be in bounds and aligned.
        trap_if!(ptr % align != 0, Trap::BadRealloc);
        self.memory()?.check_bounds(ptr, new_size)?;
        Ok(ptr)
    }
}

/// Everything a single lift or lower operation needs: the options of the
/// boundary, the instance whose table handles go in and out of, and the call
/// whose borrow scope is in effect.
#[derive(Clone)]
pub struct LiftLowerCx {
    pub store: Store,
    pub opts: Rc<CanonicalOptions>,
    pub instance: InstanceId,
    /// The task forming the call boundary, when lifting or lowering call
    /// arguments/results. Lender and borrow accounting attaches here.
    pub call: Option<TaskId>,
    /// Borrow handles may only cross as call arguments.
    pub allow_borrow: bool,
}

impl LiftLowerCx {
    pub fn new(store: &Store, opts: &Rc<CanonicalOptions>, instance: InstanceId) -> LiftLowerCx {
        LiftLowerCx {
            store: store.clone(),
            opts: opts.clone(),
            instance,
            call: None,
            allow_borrow: true,
        }
    }
}

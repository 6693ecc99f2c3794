//! Runtime representation of component-level and core values.

use crate::options::StringEncoding;
use crate::store::PipeId;
use anyhow::{bail, Result};
use canon_abi_types::{CoreType, ResourceId, MAX_FLAT_PARAMS};
use smallvec::SmallVec;
use std::rc::Rc;

/// A core scalar value. `i32`/`i64` are carried as raw unsigned bit patterns;
/// signedness is applied by the lift/lower rules for the declared type.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CoreValue {
    I32(u32),
    I64(u64),
    F32(f32),
    F64(f64),
}

impl CoreValue {
    pub fn ty(&self) -> CoreType {
        match self {
            CoreValue::I32(_) => CoreType::I32,
            CoreValue::I64(_) => CoreType::I64,
            CoreValue::F32(_) => CoreType::F32,
            CoreValue::F64(_) => CoreType::F64,
        }
    }
}

/// A flat core value sequence. Signatures are capped at
/// [`MAX_FLAT_PARAMS`] slots before they spill to memory, so the common
/// case stays inline.
pub type FlatValues = SmallVec<[CoreValue; MAX_FLAT_PARAMS]>;

/// An iterator over the flat core values of a call boundary.
pub struct CoreValueIter {
    values: FlatValues,
    next: usize,
}

impl CoreValueIter {
    pub fn new(values: impl Into<FlatValues>) -> CoreValueIter {
        CoreValueIter {
            values: values.into(),
            next: 0,
        }
    }

    pub fn next(&mut self, want: CoreType) -> Result<CoreValue> {
        let Some(v) = self.values.get(self.next) else {
            bail!("flat value sequence exhausted (wanted {want:?})");
        };
        self.next += 1;
        if v.ty() != want {
            bail!("flat value type mismatch: have {:?}, want {want:?}", v.ty());
        }
        Ok(*v)
    }

    pub fn next_u32(&mut self) -> Result<u32> {
        match self.next(CoreType::I32)? {
            CoreValue::I32(i) => Ok(i),
            _ => unreachable!(),
        }
    }

    pub fn next_u64(&mut self) -> Result<u64> {
        match self.next(CoreType::I64)? {
            CoreValue::I64(i) => Ok(i),
            _ => unreachable!(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.next == self.values.len()
    }
}

/// A lifted string. The decoded scalar values are kept together with the
/// source encoding and tagged code-unit count so that lowering can replay the
/// encoding-specific allocation behavior exactly.
#[derive(Clone, Debug, PartialEq)]
pub struct WasmStr {
    pub value: String,
    pub encoding: StringEncoding,
    pub tagged_code_units: u32,
}

impl WasmStr {
    /// A string as produced by a UTF-8 host: code units are its UTF-8 byte
    /// length.
    pub fn utf8(s: impl Into<String>) -> WasmStr {
        let value = s.into();
        WasmStr {
            tagged_code_units: value.len() as u32,
            value,
            encoding: StringEncoding::Utf8,
        }
    }
}

/// Payload of a lifted `own<R>` handle: the representation value in flight
/// between tables.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnTransfer {
    pub rt: ResourceId,
    pub rep: u32,
}

/// Payload of a lifted `borrow<R>` handle. Only the representation travels;
/// the lender bookkeeping stays on the lifting side's subtask.
#[derive(Clone, Debug, PartialEq)]
pub struct BorrowTransfer {
    pub rt: ResourceId,
    pub rep: u32,
}

/// A readable stream or future end in flight between tables.
#[derive(Clone, Debug, PartialEq)]
pub struct EndTransfer {
    pub pipe: PipeId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorContextTransfer {
    pub message: Rc<str>,
}

/// A component-level value in its canonical (despecialized) shape: tuples
/// appear as records with numeric labels, enums as payload-less variants,
/// `option`/`result` as their two-case variants.
#[derive(Clone, Debug, PartialEq)]
pub enum Val {
    Bool(bool),
    S8(i8),
    U8(u8),
    S16(i16),
    U16(u16),
    S32(i32),
    U32(u32),
    S64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Char(char),
    String(WasmStr),
    List(Vec<Val>),
    Record(Vec<(String, Val)>),
    /// The label is the pipe-joined `defaults_to` chain when the decoded case
    /// defaults to another.
    Variant(String, Option<Box<Val>>),
    Flags(Vec<(String, bool)>),
    Own(OwnTransfer),
    Borrow(BorrowTransfer),
    Stream(EndTransfer),
    Future(EndTransfer),
    ErrorContext(ErrorContextTransfer),
}

impl Val {
    pub fn string(s: impl Into<String>) -> Val {
        Val::String(WasmStr::utf8(s))
    }

    pub fn variant(label: impl Into<String>, payload: Option<Val>) -> Val {
        Val::Variant(label.into(), payload.map(Box::new))
    }

    pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, Val)>) -> Val {
        Val::Record(
            fields
                .into_iter()
                .map(|(name, v)| (name.to_string(), v))
                .collect(),
        )
    }

    /// A tuple value in canonical shape: a record with numeric labels.
    pub fn tuple(vs: impl IntoIterator<Item = Val>) -> Val {
        Val::Record(
            vs.into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        )
    }
}

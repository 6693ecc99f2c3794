//! Alignment, size, and flat-shape computation.
//!
//! Everything here is defined on the despecialized form of a type; the public
//! entry points despecialize on the way in so callers don't have to.

use crate::{types_of, Case, FuncType, ValType};
use smallvec::SmallVec;

/// Flat parameter cap for synchronous calls and for lifted entrypoints.
/// Beyond this, parameters are bundled into a tuple passed by pointer.
pub const MAX_FLAT_PARAMS: usize = 16;

/// Flat result cap. Beyond this, results travel through memory: a returned
/// pointer when lifting, a caller-provided out pointer when lowering.
pub const MAX_FLAT_RESULTS: usize = 1;

/// Flat parameter cap for asynchronous lowered calls.
pub const MAX_FLAT_ASYNC_PARAMS: usize = 4;

/// A core scalar value type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoreType {
    I32,
    I64,
    F32,
    F64,
}

impl CoreType {
    /// The unification rule for variant payload slots: equal types unify to
    /// themselves, `i32` and `f32` unify to `i32`, everything else widens to
    /// `i64`.
    pub fn join(self, other: CoreType) -> CoreType {
        use CoreType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (I32, F32) | (F32, I32) => I32,
            _ => I64,
        }
    }
}

/// The core signature of a canonical function.
#[derive(Clone, Debug, PartialEq)]
pub struct CoreFuncType {
    pub params: Vec<CoreType>,
    pub results: Vec<CoreType>,
}

/// Which canonical definition a function type is being flattened for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlattenMode {
    SyncLift,
    SyncLower,
    AsyncLift { callback: bool },
    AsyncLower,
}

pub fn align_to(ptr: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (ptr + alignment - 1) & !(alignment - 1)
}

pub fn alignment(ty: &ValType) -> u32 {
    match &*ty.despecialize() {
        ValType::Bool | ValType::S8 | ValType::U8 => 1,
        ValType::S16 | ValType::U16 => 2,
        ValType::S32 | ValType::U32 | ValType::F32 | ValType::Char => 4,
        ValType::S64 | ValType::U64 | ValType::F64 => 8,
        ValType::String | ValType::List(_) => 4,
        ValType::FixedList(t, _) => alignment(t),
        ValType::Record(fields) => fields.iter().map(|f| alignment(&f.ty)).max().unwrap_or(1),
        ValType::Variant(cases) => alignment_variant(cases),
        ValType::Flags(labels) => alignment_flags(labels.len()),
        ValType::Own(_)
        | ValType::Borrow(_)
        | ValType::Stream(_)
        | ValType::Future(_)
        | ValType::ErrorContext => 4,
        ValType::Tuple(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result(..) => {
            unreachable!("despecialized")
        }
    }
}

fn alignment_variant(cases: &[Case]) -> u32 {
    let disc = alignment(&discriminant_type(cases));
    types_of(cases)
        .map(alignment)
        .fold(disc, |a, b| a.max(b))
}

fn alignment_flags(n: usize) -> u32 {
    if n <= 8 {
        1
    } else if n <= 16 {
        2
    } else {
        4
    }
}

/// The `u8`/`u16`/`u32` type used for a variant's discriminant, chosen by
/// `ceil(log2(n)/8)`.
pub fn discriminant_type(cases: &[Case]) -> ValType {
    let n = cases.len();
    assert!(n > 0 && (n as u64) < (1 << 32));
    match (usize::BITS - (n - 1).leading_zeros()).div_ceil(8) {
        0 | 1 => ValType::U8,
        2 => ValType::U16,
        3 | 4 => ValType::U32,
        _ => unreachable!(),
    }
}

pub fn size(ty: &ValType) -> u32 {
    match &*ty.despecialize() {
        ValType::Bool | ValType::S8 | ValType::U8 => 1,
        ValType::S16 | ValType::U16 => 2,
        ValType::S32 | ValType::U32 | ValType::F32 | ValType::Char => 4,
        ValType::S64 | ValType::U64 | ValType::F64 => 8,
        ValType::String | ValType::List(_) => 8,
        ValType::FixedList(t, n) => size(t) * n,
        ValType::Record(fields) => {
            let mut s = 0;
            for f in fields {
                s = align_to(s, alignment(&f.ty));
                s += size(&f.ty);
            }
            align_to(s, alignment(ty))
        }
        ValType::Variant(cases) => size_variant(cases),
        ValType::Flags(labels) => size_flags(labels.len()),
        ValType::Own(_)
        | ValType::Borrow(_)
        | ValType::Stream(_)
        | ValType::Future(_)
        | ValType::ErrorContext => 4,
        ValType::Tuple(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result(..) => {
            unreachable!("despecialized")
        }
    }
}

fn size_variant(cases: &[Case]) -> u32 {
    let mut s = size(&discriminant_type(cases));
    s = align_to(s, types_of(cases).map(alignment).max().unwrap_or(1));
    s += types_of(cases).map(size).max().unwrap_or(0);
    align_to(s, alignment_variant(cases))
}

fn size_flags(n: usize) -> u32 {
    if n <= 8 {
        1
    } else if n <= 16 {
        2
    } else {
        4 * num_i32_flags(n)
    }
}

/// How many packed `i32` words a flags type with `n` labels occupies when
/// flattened.
pub fn num_i32_flags(n: usize) -> u32 {
    n.div_ceil(32) as u32
}

pub fn flatten_type(ty: &ValType) -> SmallVec<[CoreType; 4]> {
    use CoreType::*;
    match &*ty.despecialize() {
        ValType::Bool
        | ValType::S8
        | ValType::U8
        | ValType::S16
        | ValType::U16
        | ValType::S32
        | ValType::U32
        | ValType::Char => SmallVec::from_slice(&[I32]),
        ValType::S64 | ValType::U64 => SmallVec::from_slice(&[I64]),
        ValType::F32 => SmallVec::from_slice(&[F32]),
        ValType::F64 => SmallVec::from_slice(&[F64]),
        ValType::String | ValType::List(_) => SmallVec::from_slice(&[I32, I32]),
        ValType::FixedList(t, n) => {
            let elem = flatten_type(t);
            let mut flat = SmallVec::new();
            for _ in 0..*n {
                flat.extend_from_slice(&elem);
            }
            flat
        }
        ValType::Record(fields) => {
            let mut flat = SmallVec::new();
            for f in fields {
                flat.extend_from_slice(&flatten_type(&f.ty));
            }
            flat
        }
        ValType::Variant(cases) => flatten_variant(cases),
        ValType::Flags(labels) => {
            let mut flat = SmallVec::new();
            for _ in 0..num_i32_flags(labels.len()) {
                flat.push(I32);
            }
            flat
        }
        ValType::Own(_)
        | ValType::Borrow(_)
        | ValType::Stream(_)
        | ValType::Future(_)
        | ValType::ErrorContext => SmallVec::from_slice(&[I32]),
        ValType::Tuple(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result(..) => {
            unreachable!("despecialized")
        }
    }
}

pub fn flatten_types<'a>(
    tys: impl IntoIterator<Item = &'a ValType>,
) -> SmallVec<[CoreType; 16]> {
    let mut flat = SmallVec::new();
    for t in tys {
        flat.extend_from_slice(&flatten_type(t));
    }
    flat
}

/// The joined payload shape of a variant: discriminant first, then for each
/// payload slot position the join of every case's type at that position.
pub fn flatten_variant(cases: &[Case]) -> SmallVec<[CoreType; 4]> {
    let mut payload: SmallVec<[CoreType; 4]> = SmallVec::new();
    for case in cases {
        if let Some(t) = &case.ty {
            for (i, ft) in flatten_type(t).into_iter().enumerate() {
                if i < payload.len() {
                    payload[i] = payload[i].join(ft);
                } else {
                    payload.push(ft);
                }
            }
        }
    }
    let mut flat = SmallVec::new();
    flat.push(CoreType::I32);
    flat.extend(payload);
    flat
}

/// Computes the core signature of a canonical function. Parameter overflow
/// collapses to a single tuple-by-pointer `i32`; result overflow goes through
/// memory per `mode`.
pub fn flatten_functype(ft: &FuncType, mode: FlattenMode) -> CoreFuncType {
    let mut params: Vec<CoreType> = flatten_types(&ft.params).into_vec();
    let mut results: Vec<CoreType> = flatten_types(ft.result.as_slice()).into_vec();
    match mode {
        FlattenMode::SyncLift | FlattenMode::SyncLower => {
            if params.len() > MAX_FLAT_PARAMS {
                params = vec![CoreType::I32];
            }
            if results.len() > MAX_FLAT_RESULTS {
                match mode {
                    FlattenMode::SyncLift => results = vec![CoreType::I32],
                    FlattenMode::SyncLower => {
                        params.push(CoreType::I32);
                        results = Vec::new();
                    }
                    _ => unreachable!(),
                }
            }
        }
        FlattenMode::AsyncLift { callback } => {
            if params.len() > MAX_FLAT_PARAMS {
                params = vec![CoreType::I32];
            }
            // Results travel through `task.return`; the core return value is
            // the callback code when a callback is configured.
            results = if callback {
                vec![CoreType::I32]
            } else {
                Vec::new()
            };
        }
        FlattenMode::AsyncLower => {
            if params.len() > MAX_FLAT_ASYNC_PARAMS {
                params = vec![CoreType::I32];
            }
            if !results.is_empty() {
                params.push(CoreType::I32);
            }
            // The core return value is the packed subtask status.
            results = vec![CoreType::I32];
        }
    }
    CoreFuncType { params, results }
}

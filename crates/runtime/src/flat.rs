//! The flat codec: lifting and lowering component values through core scalar
//! value sequences, including the flattening caps that spill wide signatures
//! into linear memory.

use crate::memory::{self, bool_from_u32, canonicalize_f32, canonicalize_f64, char_from_u32};
use crate::options::LiftLowerCx;
use crate::resources;
use crate::streams;
use crate::strings;
use crate::trap::{trap_if, Trap};
use crate::values::{CoreValue, CoreValueIter, FlatValues, Val};
use anyhow::{bail, Result};
use canon_abi_types::{
    align_to, alignment, flatten_types, flatten_variant, num_i32_flags, size, Case, CoreType,
    ValType,
};
use smallvec::smallvec;

/// A source of flat core values. The plain implementation is a value
/// iterator; variant lifting layers a coercing adapter on top that narrows
/// the joined slot types back to the selected case's shape.
pub(crate) trait FlatSource {
    fn next(&mut self, want: CoreType) -> Result<CoreValue>;
}

impl FlatSource for CoreValueIter {
    fn next(&mut self, want: CoreType) -> Result<CoreValue> {
        CoreValueIter::next(self, want)
    }
}

struct CoerceSource<'a> {
    inner: &'a mut dyn FlatSource,
    joined: &'a [CoreType],
    consumed: usize,
}

impl FlatSource for CoerceSource<'_> {
    fn next(&mut self, want: CoreType) -> Result<CoreValue> {
        let have = self.joined[self.consumed];
        self.consumed += 1;
        let v = self.inner.next(have)?;
        coerce_flat(v, want)
    }
}

/// Narrows a value read at a joined slot type back to the shape a variant
/// case expects.
fn coerce_flat(v: CoreValue, want: CoreType) -> Result<CoreValue> {
    use CoreValue::*;
    Ok(match (v, want) {
        (I32(x), CoreType::F32) => F32(f32::from_bits(x)),
        (I64(x), CoreType::I32) => I32(narrow_i64_to_i32(x)?),
        (I64(x), CoreType::F32) => F32(f32::from_bits(narrow_i64_to_i32(x)?)),
        (I64(x), CoreType::F64) => F64(f64::from_bits(x)),
        (v, want) => {
            debug_assert_eq!(v.ty(), want);
            v
        }
    })
}

fn narrow_i64_to_i32(x: u64) -> Result<u32> {
    trap_if!(x >= (1 << 32), Trap::IntegerOutOfRange);
    Ok(x as u32)
}

fn lift_flat_unsigned(vi: &mut dyn FlatSource, core: CoreType, t_bits: u32) -> Result<u64> {
    let u = match vi.next(core)? {
        CoreValue::I32(x) => x as u64,
        CoreValue::I64(x) => x,
        _ => unreachable!(),
    };
    if t_bits < 64 {
        trap_if!(u >= (1 << t_bits), Trap::IntegerOutOfRange);
    }
    Ok(u)
}

fn lift_flat_signed(
    vi: &mut dyn FlatSource,
    core: CoreType,
    core_bits: u32,
    t_bits: u32,
) -> Result<i64> {
    let u = match vi.next(core)? {
        CoreValue::I32(x) => x as u64,
        CoreValue::I64(x) => x,
        _ => unreachable!(),
    };
    // The carrier holds a sign-extended two's-complement value; reinterpret
    // the high bit and range-check against the declared width.
    let half = 1i128 << (t_bits - 1);
    let u = u as i128;
    if u >= half {
        let v = u - (1i128 << core_bits);
        trap_if!(v < -half, Trap::IntegerOutOfRange);
        Ok(v as i64)
    } else {
        Ok(u as i64)
    }
}

pub fn lift_flat(cx: &LiftLowerCx, vi: &mut CoreValueIter, ty: &ValType) -> Result<Val> {
    lift_flat_from(cx, vi, ty)
}

pub(crate) fn lift_flat_from(
    cx: &LiftLowerCx,
    vi: &mut dyn FlatSource,
    ty: &ValType,
) -> Result<Val> {
    use CoreType::*;
    match &*ty.despecialize() {
        ValType::Bool => Ok(Val::Bool(bool_from_u32(next_u32(vi)?)?)),
        ValType::U8 => Ok(Val::U8(lift_flat_unsigned(vi, I32, 8)? as u8)),
        ValType::U16 => Ok(Val::U16(lift_flat_unsigned(vi, I32, 16)? as u16)),
        ValType::U32 => Ok(Val::U32(lift_flat_unsigned(vi, I32, 32)? as u32)),
        ValType::U64 => Ok(Val::U64(lift_flat_unsigned(vi, I64, 64)?)),
        ValType::S8 => Ok(Val::S8(lift_flat_signed(vi, I32, 32, 8)? as i8)),
        ValType::S16 => Ok(Val::S16(lift_flat_signed(vi, I32, 32, 16)? as i16)),
        ValType::S32 => Ok(Val::S32(lift_flat_signed(vi, I32, 32, 32)? as i32)),
        ValType::S64 => Ok(Val::S64(lift_flat_signed(vi, I64, 64, 64)?)),
        ValType::F32 => match vi.next(F32)? {
            CoreValue::F32(f) => Ok(Val::F32(canonicalize_f32(f))),
            _ => unreachable!(),
        },
        ValType::F64 => match vi.next(F64)? {
            CoreValue::F64(f) => Ok(Val::F64(canonicalize_f64(f))),
            _ => unreachable!(),
        },
        ValType::Char => Ok(Val::Char(char_from_u32(next_u32(vi)?)?)),
        ValType::String => {
            let ptr = next_u32(vi)?;
            let tagged = next_u32(vi)?;
            Ok(Val::String(strings::load_string_from_range(cx, ptr, tagged)?))
        }
        ValType::List(t) => {
            let ptr = next_u32(vi)?;
            let length = next_u32(vi)?;
            Ok(Val::List(memory::load_list_from_range(cx, ptr, length, t)?))
        }
        ValType::FixedList(t, n) => {
            let mut elems = Vec::with_capacity(*n as usize);
            for _ in 0..*n {
                elems.push(lift_flat_from(cx, vi, t)?);
            }
            Ok(Val::List(elems))
        }
        ValType::Record(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for f in fields {
                out.push((f.name.to_string(), lift_flat_from(cx, vi, &f.ty)?));
            }
            Ok(Val::Record(out))
        }
        ValType::Variant(cases) => lift_flat_variant(cx, vi, cases),
        ValType::Flags(labels) => {
            let mut packed: u64 = 0;
            for word in 0..num_i32_flags(labels.len()) {
                packed |= (next_u32(vi)? as u64) << (32 * word);
            }
            Ok(Val::Flags(memory::unpack_flags(packed, labels)?))
        }
        ValType::Own(rt) => resources::lift_own(cx, *rt, next_u32(vi)?),
        ValType::Borrow(rt) => resources::lift_borrow(cx, *rt, next_u32(vi)?),
        ValType::Stream(_) => streams::lift_stream(cx, next_u32(vi)?),
        ValType::Future(_) => streams::lift_future(cx, next_u32(vi)?),
        ValType::ErrorContext => streams::lift_error_context(cx, next_u32(vi)?),
        ValType::Tuple(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result(..) => {
            unreachable!("despecialized")
        }
    }
}

fn next_u32(vi: &mut dyn FlatSource) -> Result<u32> {
    match vi.next(CoreType::I32)? {
        CoreValue::I32(x) => Ok(x),
        _ => unreachable!(),
    }
}

fn lift_flat_variant(cx: &LiftLowerCx, vi: &mut dyn FlatSource, cases: &[Case]) -> Result<Val> {
    let flat = flatten_variant(cases);
    debug_assert_eq!(flat[0], CoreType::I32);
    let joined = &flat[1..];
    let disc = next_u32(vi)? as usize;
    trap_if!(disc >= cases.len(), Trap::InvalidDiscriminant);
    let case = &cases[disc];
    let mut consumed = 0;
    let payload = match &case.ty {
        Some(t) => {
            let mut coerce = CoerceSource {
                inner: vi,
                joined,
                consumed: 0,
            };
            let v = lift_flat_from(cx, &mut coerce, t)?;
            consumed = coerce.consumed;
            Some(Box::new(v))
        }
        None => None,
    };
    // Drain the joined slots the selected case didn't use.
    for have in &joined[consumed..] {
        vi.next(*have)?;
    }
    Ok(Val::Variant(
        canon_abi_types::case_label_with_defaults(case, cases),
        payload,
    ))
}

pub fn lower_flat(cx: &LiftLowerCx, v: &Val, ty: &ValType) -> Result<FlatValues> {
    use CoreValue::*;
    match (&*ty.despecialize(), v) {
        (ValType::Bool, Val::Bool(b)) => Ok(smallvec![I32(*b as u32)]),
        (ValType::U8, Val::U8(i)) => Ok(smallvec![I32(*i as u32)]),
        (ValType::U16, Val::U16(i)) => Ok(smallvec![I32(*i as u32)]),
        (ValType::U32, Val::U32(i)) => Ok(smallvec![I32(*i)]),
        (ValType::U64, Val::U64(i)) => Ok(smallvec![I64(*i)]),
        (ValType::S8, Val::S8(i)) => Ok(smallvec![I32(*i as i32 as u32)]),
        (ValType::S16, Val::S16(i)) => Ok(smallvec![I32(*i as i32 as u32)]),
        (ValType::S32, Val::S32(i)) => Ok(smallvec![I32(*i as u32)]),
        (ValType::S64, Val::S64(i)) => Ok(smallvec![I64(*i as u64)]),
        (ValType::F32, Val::F32(f)) => Ok(smallvec![F32(canonicalize_f32(*f))]),
        (ValType::F64, Val::F64(f)) => Ok(smallvec![F64(canonicalize_f64(*f))]),
        (ValType::Char, Val::Char(c)) => Ok(smallvec![I32(*c as u32)]),
        (ValType::String, Val::String(s)) => {
            let (ptr, tagged) = strings::store_string_into_range(cx, s)?;
            Ok(smallvec![I32(ptr), I32(tagged)])
        }
        (ValType::List(t), Val::List(vs)) => {
            let (ptr, length) = memory::store_list_into_range(cx, vs, t)?;
            Ok(smallvec![I32(ptr), I32(length)])
        }
        (ValType::FixedList(t, n), Val::List(vs)) => {
            if vs.len() != *n as usize {
                bail!("fixed list value has {} elements, type wants {n}", vs.len());
            }
            let mut flat = FlatValues::new();
            for e in vs {
                flat.extend(lower_flat(cx, e, t)?);
            }
            Ok(flat)
        }
        (ValType::Record(fields), Val::Record(vs)) => {
            let mut flat = FlatValues::new();
            for (f, (_, v)) in fields.iter().zip(vs) {
                flat.extend(lower_flat(cx, v, &f.ty)?);
            }
            Ok(flat)
        }
        (ValType::Variant(cases), Val::Variant(label, payload)) => {
            lower_flat_variant(cx, label, payload.as_deref(), cases)
        }
        (ValType::Flags(labels), Val::Flags(vs)) => {
            let mut packed = memory::pack_flags(vs, labels)?;
            let mut flat = FlatValues::new();
            for _ in 0..num_i32_flags(labels.len()) {
                flat.push(I32(packed as u32));
                packed >>= 32;
            }
            debug_assert_eq!(packed, 0);
            Ok(flat)
        }
        (ValType::Own(rt), Val::Own(o)) => Ok(smallvec![I32(resources::lower_own(cx, *rt, o)?)]),
        (ValType::Borrow(rt), Val::Borrow(b)) => {
            Ok(smallvec![I32(resources::lower_borrow(cx, *rt, b)?)])
        }
        (ValType::Stream(_), Val::Stream(t)) => Ok(smallvec![I32(streams::lower_stream(cx, t)?)]),
        (ValType::Future(_), Val::Future(t)) => Ok(smallvec![I32(streams::lower_future(cx, t)?)]),
        (ValType::ErrorContext, Val::ErrorContext(e)) => {
            Ok(smallvec![I32(streams::lower_error_context(cx, e)?)])
        }
        (ty, v) => bail!("value {v:?} does not have type {ty:?}"),
    }
}

fn lower_flat_variant(
    cx: &LiftLowerCx,
    label: &str,
    payload: Option<&Val>,
    cases: &[Case],
) -> Result<FlatValues> {
    use CoreValue::*;
    let (case_index, case) = memory::match_case(label, cases)?;
    let flat = flatten_variant(cases);
    let joined = &flat[1..];
    let mut lowered = match (&case.ty, payload) {
        (Some(t), Some(v)) => lower_flat(cx, v, t)?,
        (None, None) => FlatValues::new(),
        _ => bail!("variant payload does not match case `{label}`"),
    };
    // Widen each payload slot to its joined type, bit-preserving.
    for (v, want) in lowered.iter_mut().zip(joined) {
        *v = match (*v, want) {
            (F32(f), CoreType::I32) => I32(f.to_bits()),
            (I32(x), CoreType::I64) => I64(x as u64),
            (F32(f), CoreType::I64) => I64(f.to_bits() as u64),
            (F64(f), CoreType::I64) => I64(f.to_bits()),
            (v, want) => {
                debug_assert_eq!(v.ty(), *want);
                v
            }
        };
    }
    // Unused joined slots are zero-filled.
    for want in &joined[lowered.len()..] {
        lowered.push(match want {
            CoreType::I32 => I32(0),
            CoreType::I64 => I64(0),
            CoreType::F32 => F32(0.0),
            CoreType::F64 => F64(0.0),
        });
    }
    let mut flat_vals: FlatValues = smallvec![I32(case_index as u32)];
    flat_vals.extend(lowered);
    Ok(flat_vals)
}

/// Lifts a parameter or result list, spilling through a pointer to an
/// in-memory tuple when the flat form exceeds `max_flat`.
pub fn lift(
    cx: &LiftLowerCx,
    max_flat: usize,
    vi: &mut CoreValueIter,
    tys: &[ValType],
) -> Result<Vec<Val>> {
    if flatten_types(tys).len() > max_flat {
        let ptr = vi.next_u32()?;
        let tuple_ty = ValType::Tuple(tys.to_vec());
        trap_if!(
            ptr != align_to(ptr, alignment(&tuple_ty)),
            Trap::MisalignedPointer
        );
        trap_if!(
            ptr as u64 + size(&tuple_ty) as u64 > cx.opts.memory()?.len() as u64,
            Trap::MemoryOutOfBounds
        );
        match memory::load(cx, ptr, &tuple_ty)? {
            Val::Record(fields) => Ok(fields.into_iter().map(|(_, v)| v).collect()),
            _ => unreachable!(),
        }
    } else {
        tys.iter().map(|t| lift_flat_from(cx, vi, t)).collect()
    }
}

/// Lowers a parameter or result list, spilling into memory when the flat form
/// exceeds `max_flat`: through a fresh `realloc` allocation, or into the
/// caller-provided out pointer when one is given.
pub fn lower(
    cx: &LiftLowerCx,
    max_flat: usize,
    vs: &[Val],
    tys: &[ValType],
    out_param: Option<&mut CoreValueIter>,
) -> Result<FlatValues> {
    if flatten_types(tys).len() > max_flat {
        let tuple_ty = ValType::Tuple(tys.to_vec());
        let tuple_val = Val::tuple(vs.iter().cloned());
        let ptr = match out_param {
            None => cx
                .opts
                .realloc(0, 0, alignment(&tuple_ty), size(&tuple_ty))?,
            Some(vi) => vi.next_u32()?,
        };
        trap_if!(
            ptr != align_to(ptr, alignment(&tuple_ty)),
            Trap::MisalignedPointer
        );
        trap_if!(
            ptr as u64 + size(&tuple_ty) as u64 > cx.opts.memory()?.len() as u64,
            Trap::MemoryOutOfBounds
        );
        memory::store(cx, &tuple_val, &tuple_ty, ptr)?;
        Ok(smallvec![CoreValue::I32(ptr)])
    } else {
        let mut flat = FlatValues::new();
        for (v, t) in vs.iter().zip(tys) {
            flat.extend(lower_flat(cx, v, t)?);
        }
        Ok(flat)
    }
}

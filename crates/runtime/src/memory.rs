//! The memory codec: `load` and `store` of component values against linear
//! memory, with the canonical ABI's layout, bounds, and validation rules.

use crate::options::LiftLowerCx;
use crate::resources;
use crate::streams;
use crate::strings;
use crate::trap::{trap_if, Trap};
use crate::values::Val;
use anyhow::{bail, Result};
use canon_abi_types::{
    align_to, alignment, case_label_with_defaults, discriminant_type, find_case, size, Case,
    ValType,
};

pub const CANONICAL_FLOAT32_NAN: u32 = 0x7fc0_0000;
pub const CANONICAL_FLOAT64_NAN: u64 = 0x7ff8_0000_0000_0000;

/// NaN payloads are not preserved across the boundary: every NaN maps to the
/// canonical quiet bit pattern.
pub fn canonicalize_f32(f: f32) -> f32 {
    if f.is_nan() {
        f32::from_bits(CANONICAL_FLOAT32_NAN)
    } else {
        f
    }
}

pub fn canonicalize_f64(f: f64) -> f64 {
    if f.is_nan() {
        f64::from_bits(CANONICAL_FLOAT64_NAN)
    } else {
        f
    }
}

pub(crate) fn char_from_u32(i: u32) -> Result<char> {
    trap_if!(i >= 0x11_0000, Trap::InvalidChar);
    trap_if!((0xd800..=0xdfff).contains(&i), Trap::InvalidChar);
    Ok(char::from_u32(i).expect("checked scalar value"))
}

pub(crate) fn bool_from_u32(i: u32) -> Result<bool> {
    trap_if!(i > 1, Trap::InvalidBool);
    Ok(i == 1)
}

fn load_int(cx: &LiftLowerCx, ptr: u32, nbytes: u32) -> Result<u64> {
    let bytes = cx.opts.memory()?.read_bytes(ptr, nbytes)?;
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(buf))
}

fn store_int(cx: &LiftLowerCx, v: u64, ptr: u32, nbytes: u32) -> Result<()> {
    cx.opts
        .memory()?
        .write_bytes(ptr, &v.to_le_bytes()[..nbytes as usize])
}

fn sign_extend(v: u64, nbytes: u32) -> i64 {
    let shift = 64 - nbytes * 8;
    ((v << shift) as i64) >> shift
}

/// Loads a value of type `ty` at `ptr`, which the caller has already aligned.
pub fn load(cx: &LiftLowerCx, ptr: u32, ty: &ValType) -> Result<Val> {
    debug_assert_eq!(ptr, align_to(ptr, alignment(ty)));
    match &*ty.despecialize() {
        ValType::Bool => Ok(Val::Bool(bool_from_u32(load_int(cx, ptr, 1)? as u32)?)),
        ValType::U8 => Ok(Val::U8(load_int(cx, ptr, 1)? as u8)),
        ValType::U16 => Ok(Val::U16(load_int(cx, ptr, 2)? as u16)),
        ValType::U32 => Ok(Val::U32(load_int(cx, ptr, 4)? as u32)),
        ValType::U64 => Ok(Val::U64(load_int(cx, ptr, 8)?)),
        ValType::S8 => Ok(Val::S8(sign_extend(load_int(cx, ptr, 1)?, 1) as i8)),
        ValType::S16 => Ok(Val::S16(sign_extend(load_int(cx, ptr, 2)?, 2) as i16)),
        ValType::S32 => Ok(Val::S32(sign_extend(load_int(cx, ptr, 4)?, 4) as i32)),
        ValType::S64 => Ok(Val::S64(load_int(cx, ptr, 8)? as i64)),
        ValType::F32 => Ok(Val::F32(canonicalize_f32(f32::from_bits(
            load_int(cx, ptr, 4)? as u32,
        )))),
        ValType::F64 => Ok(Val::F64(canonicalize_f64(f64::from_bits(load_int(
            cx, ptr, 8,
        )?)))),
        ValType::Char => Ok(Val::Char(char_from_u32(load_int(cx, ptr, 4)? as u32)?)),
        ValType::String => {
            let begin = load_int(cx, ptr, 4)? as u32;
            let tagged_code_units = load_int(cx, ptr + 4, 4)? as u32;
            Ok(Val::String(strings::load_string_from_range(
                cx,
                begin,
                tagged_code_units,
            )?))
        }
        ValType::List(t) => {
            let begin = load_int(cx, ptr, 4)? as u32;
            let length = load_int(cx, ptr + 4, 4)? as u32;
            Ok(Val::List(load_list_from_range(cx, begin, length, t)?))
        }
        ValType::FixedList(t, n) => {
            let mut elems = Vec::with_capacity(*n as usize);
            for i in 0..*n {
                elems.push(load(cx, ptr + i * size(t), t)?);
            }
            Ok(Val::List(elems))
        }
        ValType::Record(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            let mut offset = ptr;
            for f in fields {
                offset = align_to(offset, alignment(&f.ty));
                out.push((f.name.to_string(), load(cx, offset, &f.ty)?));
                offset += size(&f.ty);
            }
            Ok(Val::Record(out))
        }
        ValType::Variant(cases) => load_variant(cx, ptr, cases),
        ValType::Flags(labels) => {
            let packed = load_int(cx, ptr, size(ty))?;
            Ok(Val::Flags(unpack_flags(packed, labels)?))
        }
        ValType::Own(rt) => resources::lift_own(cx, *rt, load_int(cx, ptr, 4)? as u32),
        ValType::Borrow(rt) => resources::lift_borrow(cx, *rt, load_int(cx, ptr, 4)? as u32),
        ValType::Stream(_) => streams::lift_stream(cx, load_int(cx, ptr, 4)? as u32),
        ValType::Future(_) => streams::lift_future(cx, load_int(cx, ptr, 4)? as u32),
        ValType::ErrorContext => streams::lift_error_context(cx, load_int(cx, ptr, 4)? as u32),
        ValType::Tuple(_) | ValType::Enum(_) | ValType::Option(_) | ValType::Result(..) => {
            unreachable!("despecialized")
        }
    }
}

pub(crate) fn load_list_from_range(
    cx: &LiftLowerCx,
    ptr: u32,
    length: u32,
    elem: &ValType,
) -> Result<Vec<Val>> {
    trap_if!(ptr != align_to(ptr, alignment(elem)), Trap::MisalignedPointer);
    let byte_len = (length as u64) * (size(elem) as u64);
    trap_if!(
        (ptr as u64) + byte_len > cx.opts.memory()?.len() as u64,
        Trap::MemoryOutOfBounds
    );
    let mut out = Vec::with_capacity(length as usize);
    for i in 0..length {
        out.push(load(cx, ptr + i * size(elem), elem)?);
    }
    Ok(out)
}

fn load_variant(cx: &LiftLowerCx, ptr: u32, cases: &[Case]) -> Result<Val> {
    let disc_ty = discriminant_type(cases);
    let disc_size = size(&disc_ty);
    let disc = load_int(cx, ptr, disc_size)? as usize;
    trap_if!(disc >= cases.len(), Trap::InvalidDiscriminant);
    let case = &cases[disc];
    let payload_ptr = align_to(ptr + disc_size, max_case_alignment(cases));
    let payload = match &case.ty {
        Some(t) => Some(Box::new(load(cx, payload_ptr, t)?)),
        None => None,
    };
    Ok(Val::Variant(case_label_with_defaults(case, cases), payload))
}

pub(crate) fn max_case_alignment(cases: &[Case]) -> u32 {
    cases
        .iter()
        .filter_map(|c| c.ty.as_ref())
        .map(alignment)
        .max()
        .unwrap_or(1)
}

pub(crate) fn unpack_flags(mut packed: u64, labels: &[Box<str>]) -> Result<Vec<(String, bool)>> {
    let mut out = Vec::with_capacity(labels.len());
    for l in labels {
        out.push((l.to_string(), packed & 1 != 0));
        packed >>= 1;
    }
    trap_if!(packed != 0, Trap::InvalidFlagBits);
    Ok(out)
}

pub(crate) fn pack_flags(v: &[(String, bool)], labels: &[Box<str>]) -> Result<u64> {
    let mut packed = 0u64;
    for (shift, l) in labels.iter().enumerate() {
        let set = v
            .iter()
            .find(|(name, _)| name.as_str() == &**l)
            .map(|(_, b)| *b)
            .ok_or_else(|| anyhow::anyhow!("flags value missing label `{l}`"))?;
        packed |= (set as u64) << shift;
    }
    Ok(packed)
}

/// Stores `v` of type `ty` at `ptr`, which the caller has already aligned.
pub fn store(cx: &LiftLowerCx, v: &Val, ty: &ValType, ptr: u32) -> Result<()> {
    debug_assert_eq!(ptr, align_to(ptr, alignment(ty)));
    match (&*ty.despecialize(), v) {
        (ValType::Bool, Val::Bool(b)) => store_int(cx, *b as u64, ptr, 1),
        (ValType::U8, Val::U8(i)) => store_int(cx, *i as u64, ptr, 1),
        (ValType::U16, Val::U16(i)) => store_int(cx, *i as u64, ptr, 2),
        (ValType::U32, Val::U32(i)) => store_int(cx, *i as u64, ptr, 4),
        (ValType::U64, Val::U64(i)) => store_int(cx, *i, ptr, 8),
        (ValType::S8, Val::S8(i)) => store_int(cx, *i as u8 as u64, ptr, 1),
        (ValType::S16, Val::S16(i)) => store_int(cx, *i as u16 as u64, ptr, 2),
        (ValType::S32, Val::S32(i)) => store_int(cx, *i as u32 as u64, ptr, 4),
        (ValType::S64, Val::S64(i)) => store_int(cx, *i as u64, ptr, 8),
        (ValType::F32, Val::F32(f)) => store_int(cx, canonicalize_f32(*f).to_bits() as u64, ptr, 4),
        (ValType::F64, Val::F64(f)) => store_int(cx, canonicalize_f64(*f).to_bits(), ptr, 8),
        (ValType::Char, Val::Char(c)) => store_int(cx, *c as u64, ptr, 4),
        (ValType::String, Val::String(s)) => {
            let (begin, tagged_code_units) = strings::store_string_into_range(cx, s)?;
            store_int(cx, begin as u64, ptr, 4)?;
            store_int(cx, tagged_code_units as u64, ptr + 4, 4)
        }
        (ValType::List(t), Val::List(vs)) => {
            let (begin, length) = store_list_into_range(cx, vs, t)?;
            store_int(cx, begin as u64, ptr, 4)?;
            store_int(cx, length as u64, ptr + 4, 4)
        }
        (ValType::FixedList(t, n), Val::List(vs)) => {
            if vs.len() != *n as usize {
                bail!("fixed list value has {} elements, type wants {n}", vs.len());
            }
            for (i, e) in vs.iter().enumerate() {
                store(cx, e, t, ptr + i as u32 * size(t))?;
            }
            Ok(())
        }
        (ValType::Record(fields), Val::Record(vs)) => {
            let mut offset = ptr;
            for (f, (label, v)) in fields.iter().zip(vs) {
                debug_assert_eq!(&*f.name, label.as_str());
                offset = align_to(offset, alignment(&f.ty));
                store(cx, v, &f.ty, offset)?;
                offset += size(&f.ty);
            }
            Ok(())
        }
        (ValType::Variant(cases), Val::Variant(label, payload)) => {
            let (case_index, case) = match_case(label, cases)?;
            let disc_size = size(&discriminant_type(cases));
            store_int(cx, case_index as u64, ptr, disc_size)?;
            let payload_ptr = align_to(ptr + disc_size, max_case_alignment(cases));
            match (&case.ty, payload) {
                (Some(t), Some(v)) => store(cx, v, t, payload_ptr),
                (None, None) => Ok(()),
                _ => bail!("variant payload does not match case `{label}`"),
            }
        }
        (ValType::Flags(labels), Val::Flags(vs)) => {
            store_int(cx, pack_flags(vs, labels)?, ptr, size(ty))
        }
        (ValType::Own(rt), Val::Own(o)) => {
            let idx = resources::lower_own(cx, *rt, o)?;
            store_int(cx, idx as u64, ptr, 4)
        }
        (ValType::Borrow(rt), Val::Borrow(b)) => {
            let idx = resources::lower_borrow(cx, *rt, b)?;
            store_int(cx, idx as u64, ptr, 4)
        }
        (ValType::Stream(_), Val::Stream(t)) => {
            let idx = streams::lower_stream(cx, t)?;
            store_int(cx, idx as u64, ptr, 4)
        }
        (ValType::Future(_), Val::Future(t)) => {
            let idx = streams::lower_future(cx, t)?;
            store_int(cx, idx as u64, ptr, 4)
        }
        (ValType::ErrorContext, Val::ErrorContext(e)) => {
            let idx = streams::lower_error_context(cx, e)?;
            store_int(cx, idx as u64, ptr, 4)
        }
        (ty, v) => bail!("value {v:?} does not have type {ty:?}"),
    }
}

pub(crate) fn store_list_into_range(
    cx: &LiftLowerCx,
    vs: &[Val],
    elem: &ValType,
) -> Result<(u32, u32)> {
    let byte_len = (vs.len() as u64) * (size(elem) as u64);
    trap_if!(byte_len >= (1 << 32), Trap::LengthOverflow);
    let ptr = cx
        .opts
        .realloc(0, 0, alignment(elem), byte_len as u32)?;
    trap_if!(ptr != align_to(ptr, alignment(elem)), Trap::MisalignedPointer);
    for (i, e) in vs.iter().enumerate() {
        store(cx, e, elem, ptr + i as u32 * size(elem))?;
    }
    Ok((ptr, vs.len() as u32))
}

/// Resolves a variant value's label (possibly a pipe-joined default chain) to
/// the first case it names.
pub(crate) fn match_case<'a>(label: &str, cases: &'a [Case]) -> Result<(usize, &'a Case)> {
    for part in label.split('|') {
        if let Some(i) = find_case(part, cases) {
            return Ok((i, &cases[i]));
        }
    }
    bail!("variant value label `{label}` matches no case")
}

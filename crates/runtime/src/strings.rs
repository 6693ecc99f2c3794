//! The string transcoder.
//!
//! Strings cross the boundary in the encoding each side declared, so a copy
//! is also a transcode. Allocation goes through the destination's `realloc`
//! with a fixed grow/shrink sequence: optimistic first guesses, worst-case
//! growth only when needed, and a final shrink to fit.

use crate::options::{LiftLowerCx, StringEncoding};
use crate::trap::{trap_if, Trap};
use crate::values::WasmStr;
use anyhow::Result;

/// High bit of the length field: under `latin1+utf16` it marks the string as
/// UTF-16; the remaining bits count code units.
pub const UTF16_TAG: u32 = 1 << 31;

pub const MAX_STRING_BYTE_LENGTH: u32 = (1 << 31) - 1;

pub(crate) fn load_string_from_range(
    cx: &LiftLowerCx,
    ptr: u32,
    tagged_code_units: u32,
) -> Result<WasmStr> {
    enum Enc {
        Utf8,
        Utf16,
        Latin1,
    }
    let (enc, byte_length) = match cx.opts.string_encoding {
        StringEncoding::Utf8 => (Enc::Utf8, tagged_code_units as u64),
        StringEncoding::Utf16 => (Enc::Utf16, 2 * tagged_code_units as u64),
        StringEncoding::Latin1Utf16 => {
            if tagged_code_units & UTF16_TAG != 0 {
                (Enc::Utf16, 2 * (tagged_code_units ^ UTF16_TAG) as u64)
            } else {
                (Enc::Latin1, tagged_code_units as u64)
            }
        }
    };
    trap_if!(byte_length > MAX_STRING_BYTE_LENGTH as u64, Trap::LengthOverflow);
    let memory = cx.opts.memory()?;
    trap_if!(
        ptr as u64 + byte_length > memory.len() as u64,
        Trap::MemoryOutOfBounds
    );
    let bytes = memory.read_bytes(ptr, byte_length as u32)?;
    let value = match enc {
        Enc::Utf8 => match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => return Err(Trap::InvalidStringEncoding.err()),
        },
        Enc::Utf16 => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            match String::from_utf16(&units) {
                Ok(s) => s,
                Err(_) => return Err(Trap::InvalidStringEncoding.err()),
            }
        }
        Enc::Latin1 => bytes.iter().map(|&b| b as char).collect(),
    };
    Ok(WasmStr {
        value,
        encoding: cx.opts.string_encoding,
        tagged_code_units,
    })
}

fn encode_utf16_le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

fn encode_latin1(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| {
            debug_assert!((c as u32) < 0x100);
            c as u8
        })
        .collect()
}

/// Stores `v` in the destination encoding, returning `(ptr, tagged length)`.
pub(crate) fn store_string_into_range(cx: &LiftLowerCx, v: &WasmStr) -> Result<(u32, u32)> {
    // Split the source's tagged form back into a simple encoding plus a
    // plain code-unit count.
    let (src_utf16, src_code_units) = match v.encoding {
        StringEncoding::Latin1Utf16 => {
            if v.tagged_code_units & UTF16_TAG != 0 {
                (true, v.tagged_code_units ^ UTF16_TAG)
            } else {
                (false, v.tagged_code_units)
            }
        }
        StringEncoding::Utf16 => (true, v.tagged_code_units),
        StringEncoding::Utf8 => (false, v.tagged_code_units),
    };
    let src_latin1 = match v.encoding {
        StringEncoding::Utf8 => false,
        StringEncoding::Utf16 => false,
        StringEncoding::Latin1Utf16 => !src_utf16,
    };

    let s = v.value.as_str();
    match cx.opts.string_encoding {
        StringEncoding::Utf8 => {
            if src_latin1 {
                store_string_to_utf8(cx, s, src_code_units, 2 * src_code_units as u64)
            } else if src_utf16 {
                store_string_to_utf8(cx, s, src_code_units, 3 * src_code_units as u64)
            } else {
                store_string_copy(cx, s.as_bytes(), src_code_units, 1)
            }
        }
        StringEncoding::Utf16 => {
            if v.encoding == StringEncoding::Utf8 {
                store_utf8_to_utf16(cx, s, src_code_units)
            } else {
                store_string_copy(cx, &encode_utf16_le(s), src_code_units, 2)
            }
        }
        StringEncoding::Latin1Utf16 => match v.encoding {
            StringEncoding::Utf8 | StringEncoding::Utf16 => {
                store_string_to_latin1_or_utf16(cx, s, src_code_units)
            }
            StringEncoding::Latin1Utf16 => {
                if src_latin1 {
                    store_string_copy(cx, &encode_latin1(s), src_code_units, 1)
                } else {
                    store_probably_utf16_to_latin1_or_utf16(cx, s, src_code_units)
                }
            }
        },
    }
}

/// Source and destination encodings agree: one allocation, one copy.
fn store_string_copy(
    cx: &LiftLowerCx,
    encoded: &[u8],
    src_code_units: u32,
    dst_code_unit_size: u32,
) -> Result<(u32, u32)> {
    let dst_byte_length = dst_code_unit_size as u64 * src_code_units as u64;
    trap_if!(dst_byte_length > MAX_STRING_BYTE_LENGTH as u64, Trap::LengthOverflow);
    let ptr = cx
        .opts
        .realloc(0, 0, dst_code_unit_size, dst_byte_length as u32)?;
    debug_assert_eq!(dst_byte_length as usize, encoded.len());
    cx.opts.memory()?.write_bytes(ptr, encoded)?;
    Ok((ptr, src_code_units))
}

/// Allocate exactly one byte per source code unit on the optimistic guess
/// that the string is ASCII; grow to the worst case only when the encoding
/// turns out longer, and shrink back if the worst case overshot.
fn store_string_to_utf8(
    cx: &LiftLowerCx,
    s: &str,
    src_code_units: u32,
    worst_case_size: u64,
) -> Result<(u32, u32)> {
    debug_assert!(src_code_units <= MAX_STRING_BYTE_LENGTH);
    let mut ptr = cx.opts.realloc(0, 0, 1, src_code_units)?;
    let encoded = s.as_bytes();
    debug_assert!(src_code_units as usize <= encoded.len());
    let memory = cx.opts.memory()?.clone();
    memory.write_bytes(ptr, &encoded[..src_code_units as usize])?;
    if (src_code_units as usize) < encoded.len() {
        trap_if!(worst_case_size > MAX_STRING_BYTE_LENGTH as u64, Trap::LengthOverflow);
        ptr = cx
            .opts
            .realloc(ptr, src_code_units, 1, worst_case_size as u32)?;
        memory.write_bytes(ptr + src_code_units, &encoded[src_code_units as usize..])?;
        if worst_case_size > encoded.len() as u64 {
            ptr = cx
                .opts
                .realloc(ptr, worst_case_size as u32, 1, encoded.len() as u32)?;
        }
    }
    Ok((ptr, encoded.len() as u32))
}

fn store_utf8_to_utf16(cx: &LiftLowerCx, s: &str, src_code_units: u32) -> Result<(u32, u32)> {
    let worst_case_size = 2 * src_code_units as u64;
    trap_if!(worst_case_size > MAX_STRING_BYTE_LENGTH as u64, Trap::LengthOverflow);
    let mut ptr = cx.opts.realloc(0, 0, 2, worst_case_size as u32)?;
    let encoded = encode_utf16_le(s);
    cx.opts.memory()?.write_bytes(ptr, &encoded)?;
    if (encoded.len() as u64) < worst_case_size {
        ptr = cx
            .opts
            .realloc(ptr, worst_case_size as u32, 2, encoded.len() as u32)?;
    }
    Ok((ptr, encoded.len() as u32 / 2))
}

/// Streaming attempt at latin-1: write bytes until the first scalar that
/// doesn't fit, then widen what's been written in place (in reverse, so the
/// bytes don't clobber each other) and finish as UTF-16 with the tag bit set.
fn store_string_to_latin1_or_utf16(
    cx: &LiftLowerCx,
    s: &str,
    src_code_units: u32,
) -> Result<(u32, u32)> {
    debug_assert!(src_code_units <= MAX_STRING_BYTE_LENGTH);
    let mut ptr = cx.opts.realloc(0, 0, 1, src_code_units)?;
    let memory = cx.opts.memory()?.clone();
    let mut dst_byte_length: u32 = 0;
    for usv in s.chars() {
        if (usv as u32) < (1 << 8) {
            memory.set(ptr + dst_byte_length, usv as u8);
            dst_byte_length += 1;
        } else {
            let worst_case_size = 2 * src_code_units as u64;
            trap_if!(worst_case_size > MAX_STRING_BYTE_LENGTH as u64, Trap::LengthOverflow);
            ptr = cx
                .opts
                .realloc(ptr, src_code_units, 2, worst_case_size as u32)?;
            for j in (0..dst_byte_length).rev() {
                let b = memory.get(ptr + j);
                memory.set(ptr + 2 * j, b);
                memory.set(ptr + 2 * j + 1, 0);
            }
            let encoded = encode_utf16_le(s);
            memory.write_bytes(
                ptr + 2 * dst_byte_length,
                &encoded[2 * dst_byte_length as usize..],
            )?;
            if worst_case_size > encoded.len() as u64 {
                ptr = cx
                    .opts
                    .realloc(ptr, worst_case_size as u32, 2, encoded.len() as u32)?;
            }
            let tagged_code_units = encoded.len() as u32 / 2 | UTF16_TAG;
            return Ok((ptr, tagged_code_units));
        }
    }
    if dst_byte_length < src_code_units {
        ptr = cx.opts.realloc(ptr, src_code_units, 1, dst_byte_length)?;
    }
    Ok((ptr, dst_byte_length))
}

/// The source claimed UTF-16 under `latin1+utf16`; if every scalar fits in
/// latin-1 after all, compact the copy in place and return the untagged form.
fn store_probably_utf16_to_latin1_or_utf16(
    cx: &LiftLowerCx,
    s: &str,
    src_code_units: u32,
) -> Result<(u32, u32)> {
    let src_byte_length = 2 * src_code_units as u64;
    trap_if!(src_byte_length > MAX_STRING_BYTE_LENGTH as u64, Trap::LengthOverflow);
    let mut ptr = cx.opts.realloc(0, 0, 2, src_byte_length as u32)?;
    let encoded = encode_utf16_le(s);
    let memory = cx.opts.memory()?.clone();
    memory.write_bytes(ptr, &encoded)?;
    if s.chars().any(|c| (c as u32) >= (1 << 8)) {
        let tagged_code_units = encoded.len() as u32 / 2 | UTF16_TAG;
        return Ok((ptr, tagged_code_units));
    }
    let latin1_size = encoded.len() as u32 / 2;
    for i in 0..latin1_size {
        let b = memory.get(ptr + 2 * i);
        memory.set(ptr + i, b);
    }
    ptr = cx
        .opts
        .realloc(ptr, src_byte_length as u32, 1, latin1_size)?;
    Ok((ptr, latin1_size))
}

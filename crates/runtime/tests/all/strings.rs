//! The transcoder matrix: every source/destination encoding combination over
//! a set of strings chosen to hit the latin-1 upgrade, the optimistic UTF-8
//! allocation, and the UTF-16 compaction paths.

use canon_abi::types::ValType as T;
use canon_abi::CoreValue::I32;
use canon_abi::{
    flat, CanonicalOptions, CoreValueIter, LiftLowerCx, Memory, StringEncoding, Trap, Val,
    WasmStr, UTF16_TAG,
};
use canon_abi_test_util::{heap_opts, mk_cx, Heap};
use std::rc::Rc;

const ENCODINGS: [StringEncoding; 3] = [
    StringEncoding::Utf8,
    StringEncoding::Utf16,
    StringEncoding::Latin1Utf16,
];

const FUN_STRINGS: [&str; 15] = [
    "",
    "a",
    "hi",
    "\u{0}",
    "a\u{0}b",
    "\u{80}",
    "\u{80}b",
    "ab\u{ef}c",
    "\u{1ff}y",
    "xy\u{1ff}",
    "a\u{d7ff}b",
    "a\u{2ff}\u{3ff}\u{4ff}bc",
    "\u{f123}",
    "\u{f123}\u{f123}abc",
    "abcdef\u{f123}",
];

fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn encode_latin1(s: &str) -> Option<Vec<u8>> {
    s.chars()
        .map(|c| if (c as u32) < 0x100 { Some(c as u8) } else { None })
        .collect()
}

fn src_cx(bytes: Vec<u8>, encoding: StringEncoding) -> LiftLowerCx {
    mk_cx(Rc::new(CanonicalOptions {
        memory: Some(Memory::from_bytes(bytes)),
        string_encoding: encoding,
        ..CanonicalOptions::default()
    }))
}

fn lift_str(cx: &LiftLowerCx, tagged: u32) -> WasmStr {
    let mut vi = CoreValueIter::new(vec![I32(0), I32(tagged)]);
    match flat::lift_flat(cx, &mut vi, &T::String).unwrap() {
        Val::String(s) => s,
        other => panic!("expected string, got {other:?}"),
    }
}

fn check_transcode(src: StringEncoding, dst: StringEncoding, s: &str, encoded: Vec<u8>, tagged: u32) {
    let cx = src_cx(encoded.clone(), src);
    let lifted = lift_str(&cx, tagged);
    assert_eq!(lifted.value, s);
    assert_eq!(lifted.encoding, src);
    assert_eq!(lifted.tagged_code_units, tagged);

    let heap = Heap::new(8 * encoded.len() + 64);
    let dst_cx = mk_cx(heap_opts(&heap, dst, true));
    let lowered = flat::lower_flat(&dst_cx, &Val::String(lifted), &T::String).unwrap();
    assert_eq!(lowered.len(), 2);
    let I32(dst_tagged) = lowered[1] else { panic!() };

    // A purely-ASCII string always lands in the untagged latin-1 form.
    if dst == StringEncoding::Latin1Utf16 && s.chars().all(|c| (c as u32) < 0x100) {
        assert_eq!(dst_tagged & UTF16_TAG, 0, "{s:?} should stay latin-1");
    }
    if dst == StringEncoding::Latin1Utf16 && s.chars().any(|c| (c as u32) >= 0x100) {
        assert_eq!(dst_tagged & UTF16_TAG, UTF16_TAG, "{s:?} should upgrade");
    }

    let mut vi = CoreValueIter::new(lowered);
    let relifted = match flat::lift_flat(&dst_cx, &mut vi, &T::String).unwrap() {
        Val::String(s) => s,
        other => panic!("expected string, got {other:?}"),
    };
    assert_eq!(relifted.value, s, "{src:?} -> {dst:?}");
}

#[test]
fn encoding_matrix() {
    for src in ENCODINGS {
        for dst in ENCODINGS {
            for s in FUN_STRINGS {
                match src {
                    StringEncoding::Utf8 => {
                        let encoded = s.as_bytes().to_vec();
                        let tagged = encoded.len() as u32;
                        check_transcode(src, dst, s, encoded, tagged);
                    }
                    StringEncoding::Utf16 => {
                        let encoded = encode_utf16le(s);
                        let tagged = encoded.len() as u32 / 2;
                        check_transcode(src, dst, s, encoded, tagged);
                    }
                    StringEncoding::Latin1Utf16 => {
                        if let Some(encoded) = encode_latin1(s) {
                            let tagged = encoded.len() as u32;
                            check_transcode(src, dst, s, encoded, tagged);
                        }
                        let encoded = encode_utf16le(s);
                        let tagged = encoded.len() as u32 / 2 | UTF16_TAG;
                        check_transcode(src, dst, s, encoded, tagged);
                    }
                }
            }
        }
    }
}

#[test]
fn decode_errors_trap() {
    // Invalid UTF-8.
    let cx = src_cx(vec![0xff, 0xfe, 0xfd], StringEncoding::Utf8);
    let mut vi = CoreValueIter::new(vec![I32(0), I32(3)]);
    let err = flat::lift_flat(&cx, &mut vi, &T::String).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::InvalidStringEncoding));

    // A lone surrogate in UTF-16.
    let cx = src_cx(vec![0x00, 0xd8], StringEncoding::Utf16);
    let mut vi = CoreValueIter::new(vec![I32(0), I32(1)]);
    let err = flat::lift_flat(&cx, &mut vi, &T::String).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::InvalidStringEncoding));

    // Out of bounds.
    let cx = src_cx(vec![b'h', b'i'], StringEncoding::Utf8);
    let mut vi = CoreValueIter::new(vec![I32(0), I32(3)]);
    let err = flat::lift_flat(&cx, &mut vi, &T::String).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::MemoryOutOfBounds));
}

#[test]
fn list_of_strings_through_heap() {
    let heap = Heap::new(4096);
    let cx = mk_cx(heap_opts(&heap, StringEncoding::Utf8, true));
    let v = Val::List(vec![Val::string("hi"), Val::string("wat"), Val::string("")]);
    let lowered = flat::lower_flat(&cx, &v, &T::list(T::String)).unwrap();
    let mut vi = CoreValueIter::new(lowered);
    let got = flat::lift_flat(&cx, &mut vi, &T::list(T::String)).unwrap();
    assert_eq!(got, v);
}

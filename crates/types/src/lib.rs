//! Component-level type definitions and the canonical ABI layout rules that
//! hang off of them.
//!
//! This crate is purely computational: it knows what types look like and how
//! they map onto linear memory and core scalar values, but it holds no
//! runtime state. The `canon-abi` crate layers codecs, tables, and the task
//! runtime on top.

mod abi;

pub use abi::{
    align_to, alignment, discriminant_type, flatten_functype, flatten_type, flatten_types,
    flatten_variant, num_i32_flags, size, CoreFuncType, CoreType, FlattenMode,
    MAX_FLAT_ASYNC_PARAMS, MAX_FLAT_PARAMS, MAX_FLAT_RESULTS,
};

use std::borrow::Cow;

/// Identifies a runtime resource type. Minted by the embedder; two handle
/// types refer to the same resource iff their ids are equal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

/// A named field of a record type.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: Box<str>,
    pub ty: ValType,
}

/// One case of a variant type. `ty` is `None` for payload-less cases. A case
/// may name an earlier case it `defaults_to`; decoders report the label of a
/// defaulting case as the pipe-joined chain (`"a|b"`).
#[derive(Clone, Debug, PartialEq)]
pub struct Case {
    pub name: Box<str>,
    pub ty: Option<ValType>,
    pub defaults_to: Option<Box<str>>,
}

/// A component-model value type.
#[derive(Clone, Debug, PartialEq)]
pub enum ValType {
    Bool,
    S8,
    U8,
    S16,
    U16,
    S32,
    U32,
    S64,
    U64,
    F32,
    F64,
    Char,
    String,
    List(Box<ValType>),
    FixedList(Box<ValType>, u32),
    Record(Vec<Field>),
    Tuple(Vec<ValType>),
    Variant(Vec<Case>),
    Enum(Vec<Box<str>>),
    Option(Box<ValType>),
    Result(Option<Box<ValType>>, Option<Box<ValType>>),
    Flags(Vec<Box<str>>),
    Own(ResourceId),
    Borrow(ResourceId),
    /// `stream<T>`; `None` is the empty payload (`stream<>`), a pure
    /// synchronization channel.
    Stream(Option<Box<ValType>>),
    /// `future<T>`; `None` as for streams.
    Future(Option<Box<ValType>>),
    ErrorContext,
}

impl ValType {
    /// Rewrites derived forms (`tuple`, `enum`, `option`, `result`) into
    /// their canonical `record`/`variant` shapes. All layout and codec rules
    /// consume the despecialized form.
    pub fn despecialize(&self) -> Cow<'_, ValType> {
        match self {
            ValType::Tuple(ts) => Cow::Owned(ValType::Record(
                ts.iter()
                    .enumerate()
                    .map(|(i, t)| Field {
                        name: i.to_string().into(),
                        ty: t.clone(),
                    })
                    .collect(),
            )),
            ValType::Enum(labels) => Cow::Owned(ValType::Variant(
                labels
                    .iter()
                    .map(|l| Case {
                        name: l.clone(),
                        ty: None,
                        defaults_to: None,
                    })
                    .collect(),
            )),
            ValType::Option(t) => Cow::Owned(ValType::Variant(vec![
                Case {
                    name: "none".into(),
                    ty: None,
                    defaults_to: None,
                },
                Case {
                    name: "some".into(),
                    ty: Some((**t).clone()),
                    defaults_to: None,
                },
            ])),
            ValType::Result(ok, err) => Cow::Owned(ValType::Variant(vec![
                Case {
                    name: "ok".into(),
                    ty: ok.as_deref().cloned(),
                    defaults_to: None,
                },
                Case {
                    name: "error".into(),
                    ty: err.as_deref().cloned(),
                    defaults_to: None,
                },
            ])),
            other => Cow::Borrowed(other),
        }
    }

    pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, ValType)>) -> ValType {
        ValType::Record(
            fields
                .into_iter()
                .map(|(name, ty)| Field {
                    name: name.into(),
                    ty,
                })
                .collect(),
        )
    }

    pub fn tuple(ts: impl IntoIterator<Item = ValType>) -> ValType {
        ValType::Tuple(ts.into_iter().collect())
    }

    pub fn variant<'a>(
        cases: impl IntoIterator<Item = (&'a str, Option<ValType>)>,
    ) -> ValType {
        ValType::Variant(
            cases
                .into_iter()
                .map(|(name, ty)| Case {
                    name: name.into(),
                    ty,
                    defaults_to: None,
                })
                .collect(),
        )
    }

    pub fn enum_ty<'a>(labels: impl IntoIterator<Item = &'a str>) -> ValType {
        ValType::Enum(labels.into_iter().map(|l| l.into()).collect())
    }

    pub fn flags<'a>(labels: impl IntoIterator<Item = &'a str>) -> ValType {
        ValType::Flags(labels.into_iter().map(|l| l.into()).collect())
    }

    pub fn option(t: ValType) -> ValType {
        ValType::Option(Box::new(t))
    }

    pub fn result(ok: Option<ValType>, err: Option<ValType>) -> ValType {
        ValType::Result(ok.map(Box::new), err.map(Box::new))
    }

    pub fn list(t: ValType) -> ValType {
        ValType::List(Box::new(t))
    }

    pub fn fixed_list(t: ValType, n: u32) -> ValType {
        ValType::FixedList(Box::new(t), n)
    }

    pub fn stream(t: Option<ValType>) -> ValType {
        ValType::Stream(t.map(Box::new))
    }

    pub fn future(t: Option<ValType>) -> ValType {
        ValType::Future(t.map(Box::new))
    }
}

/// A component-level function type.
#[derive(Clone, Debug, PartialEq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub result: Option<ValType>,
}

impl FuncType {
    pub fn new(params: impl IntoIterator<Item = ValType>, result: Option<ValType>) -> FuncType {
        FuncType {
            params: params.into_iter().collect(),
            result,
        }
    }
}

pub(crate) fn types_of<'a>(cases: &'a [Case]) -> impl Iterator<Item = &'a ValType> + 'a {
    cases.iter().filter_map(|c| c.ty.as_ref())
}

/// Finds the index of a case by label, if present.
pub fn find_case(label: &str, cases: &[Case]) -> Option<usize> {
    cases.iter().position(|c| &*c.name == label)
}

/// The label reported for a decoded case: its own label followed by the
/// labels of the cases it transitively defaults to, pipe-joined.
pub fn case_label_with_defaults(case: &Case, cases: &[Case]) -> String {
    let mut label = case.name.to_string();
    let mut cur = case;
    while let Some(target) = &cur.defaults_to {
        let i = find_case(target, cases).expect("defaults_to names an existing case");
        cur = &cases[i];
        label.push('|');
        label.push_str(&cur.name);
    }
    label
}

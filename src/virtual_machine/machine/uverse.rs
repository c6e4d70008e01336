//! Builtin scope.
//!
//! The builtins live in a bootstrap package whose block is the outermost
//! lexical parent of every package block. Bootstrap objects are never charged
//! and never walked by the collector.

use super::Machine;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::gas::GasCategory;
use crate::virtual_machine::isa::Op;
use crate::virtual_machine::nodes::{BlockNode, Slot};
use crate::virtual_machine::types::{FuncType, Kind, Type};
use crate::virtual_machine::values::{
    Block, FuncBody, FuncValue, MapKey, NativeFn, PackageValue, TypedValue, Value, default_value,
};
use std::rc::{Rc, Weak};

/// Builtins in slot order.
pub const BUILTINS: [&str; 6] = ["panic", "recover", "len", "cap", "append", "delete"];

/// Slot of a builtin in the builtin block.
pub fn index_of(name: &str) -> Option<u16> {
    BUILTINS.iter().position(|b| *b == name).map(|i| i as u16)
}

pub(super) fn package() -> Rc<PackageValue> {
    let natives: [(NativeFn, Vec<Type>, Vec<Type>); 6] = [
        (builtin_panic, vec![Type::Interface], vec![]),
        (builtin_recover, vec![], vec![Type::Interface]),
        (builtin_len, vec![Type::Interface], vec![Type::Int]),
        (builtin_cap, vec![Type::Interface], vec![Type::Int]),
        (builtin_append, vec![Type::Interface], vec![Type::Interface]),
        (builtin_delete, vec![Type::Interface, Type::Interface], vec![]),
    ];
    let mut slots = Vec::with_capacity(BUILTINS.len());
    let mut values = Vec::with_capacity(BUILTINS.len());
    for (name, (native, params, results)) in BUILTINS.iter().zip(natives) {
        let ty = Rc::new(FuncType { params, results });
        slots.push(Slot::new(name, Type::Func(ty.clone())));
        let func = FuncValue::new(
            (*name).into(),
            "".into(),
            ty.clone(),
            FuncBody::Native(native),
            Vec::new(),
            None,
            Weak::new(),
        );
        values.push(TypedValue {
            t: Some(Type::Func(ty)),
            v: Value::Func(Rc::new(func)),
            n: [0; 8],
        });
    }
    let block = Rc::new(Block::new_bootstrap(BlockNode::new(slots), values));
    Rc::new(PackageValue::new(
        "uverse".into(),
        "".into(),
        block,
        None,
        true,
    ))
}

fn first(args: Vec<TypedValue>) -> TypedValue {
    args.into_iter().next().unwrap_or_default()
}

fn builtin_panic(m: &mut Machine, args: Vec<TypedValue>) -> Result<Vec<TypedValue>, VMError> {
    m.push_value(first(args));
    m.ops.push(Op::Panic1);
    Ok(Vec::new())
}

fn builtin_recover(m: &mut Machine, _args: Vec<TypedValue>) -> Result<Vec<TypedValue>, VMError> {
    Ok(vec![m.recover()])
}

fn builtin_len(_m: &mut Machine, args: Vec<TypedValue>) -> Result<Vec<TypedValue>, VMError> {
    let x = first(args);
    let n = match &x.v {
        Value::Array(av) => av.len(),
        Value::Slice(sv) => sv.len,
        Value::String(s) => s.len(),
        Value::Map(mv) => mv.len(),
        Value::None if matches!(x.kind(), Some(Kind::Slice | Kind::Map | Kind::String)) => 0,
        _ => {
            return Err(VMError::TypeMismatch {
                op: "len",
                expected: "array, slice, string or map",
                actual: x.type_name(),
            });
        }
    };
    Ok(vec![TypedValue::int(n as i64)])
}

fn builtin_cap(_m: &mut Machine, args: Vec<TypedValue>) -> Result<Vec<TypedValue>, VMError> {
    let x = first(args);
    let n = match &x.v {
        Value::Array(av) => av.len(),
        Value::Slice(sv) => sv.cap,
        Value::None if x.kind() == Some(Kind::Slice) => 0,
        _ => {
            return Err(VMError::TypeMismatch {
                op: "cap",
                expected: "array or slice",
                actual: x.type_name(),
            });
        }
    };
    Ok(vec![TypedValue::int(n as i64)])
}

/// `append(s, elems...)`. Writes in place while capacity allows, otherwise
/// moves to a new backing array of twice the capacity.
fn builtin_append(m: &mut Machine, args: Vec<TypedValue>) -> Result<Vec<TypedValue>, VMError> {
    let mut args = args.into_iter();
    let s = args.next().unwrap_or_default();
    let extra: Vec<TypedValue> = args.collect();
    let elem = match &s.t {
        Some(Type::Slice(elem)) => elem.as_ref().clone(),
        _ => {
            return Err(VMError::TypeMismatch {
                op: "append",
                expected: "slice",
                actual: s.type_name(),
            });
        }
    };
    let slice_t = s.t.clone();
    let (base, offset, len, cap) = match &s.v {
        Value::Slice(sv) => (Some(sv.base.clone()), sv.offset, sv.len, sv.cap),
        Value::None => (None, 0, 0, 0),
        _ => {
            return Err(VMError::TypeMismatch {
                op: "append",
                expected: "slice",
                actual: s.type_name(),
            });
        }
    };
    if extra.is_empty() {
        return Ok(vec![s]);
    }
    m.consume_gas(extra.len() as u64, GasCategory::NativeCall)?;
    let mut copied = Vec::with_capacity(extra.len());
    for e in &extra {
        let value = m.copy_value(e)?;
        m.retain_held(&value);
        copied.push(value);
    }
    let new_len = len + copied.len();

    if let Some(base) = base.as_ref().filter(|_| new_len <= cap) {
        for (i, v) in copied.into_iter().enumerate() {
            base.set(offset + len + i, v);
        }
        let tv = m
            .alloc
            .new_slice(slice_t, base.clone(), offset, new_len, cap)?;
        return Ok(vec![tv]);
    }

    m.consume_gas(len as u64, GasCategory::NativeCall)?;
    let new_cap = (cap * 2).max(new_len);
    let mut list = Vec::with_capacity(new_cap);
    if let Some(base) = &base {
        list.extend_from_slice(&base.list()[offset..offset + len]);
    }
    list.extend(copied);
    while list.len() < new_cap {
        list.push(default_value(&mut m.alloc, &elem)?);
    }
    let array = m
        .alloc
        .new_array(Some(Type::array(new_cap, elem)), list)?;
    let Value::Array(grown) = array.v else {
        return Err(VMError::UnexpectedEntry {
            op: "append",
            found: array.type_name(),
        });
    };
    let tv = m.alloc.new_slice(slice_t, grown, 0, new_len, new_cap)?;
    Ok(vec![tv])
}

fn builtin_delete(_m: &mut Machine, args: Vec<TypedValue>) -> Result<Vec<TypedValue>, VMError> {
    let mut args = args.into_iter();
    let map = args.next().unwrap_or_default();
    let key = args.next().unwrap_or_default();
    match &map.v {
        Value::Map(mv) => {
            mv.delete(&MapKey::of(&key)?);
        }
        Value::None if map.kind() == Some(Kind::Map) => {}
        _ => {
            return Err(VMError::TypeMismatch {
                op: "delete",
                expected: "map",
                actual: map.type_name(),
            });
        }
    }
    Ok(Vec::new())
}

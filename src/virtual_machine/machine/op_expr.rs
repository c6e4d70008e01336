use super::Machine;
use super::op_exec::NIL_DEREF;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Op;
use crate::virtual_machine::nodes::{Expr, Selection};
use crate::virtual_machine::types::{Kind, Type};
use crate::virtual_machine::values::{
    FuncBody, FuncValue, MapKey, PointerBase, PointerValue, TypedValue, Value, default_value,
};
use std::rc::{Rc, Weak};

impl Machine {
    pub(super) fn do_eval(&mut self) -> Result<(), VMError> {
        let expr = self.pop_expr()?;
        match expr.as_ref() {
            Expr::Const(tv) => self.values.push(tv.clone()),
            Expr::Name { path, .. } => {
                let tv = self.get_path(*path)?;
                self.values.push(tv);
            }
            Expr::Unary { op, x } => {
                self.ops.push(op.op());
                self.push_expr_eval(x.clone());
            }
            Expr::Binary { op, x, y } => {
                if op.is_short_circuit() {
                    self.exprs.push(expr.clone());
                    self.ops.push(Op::Binary1);
                } else {
                    self.ops.push(op.op());
                    self.push_expr_eval(y.clone());
                }
                self.push_expr_eval(x.clone());
            }
            Expr::Call { func, args } => {
                self.exprs.push(expr.clone());
                self.ops.push(Op::Precall);
                for arg in args.iter().rev() {
                    self.push_expr_eval(arg.clone());
                }
                self.push_expr_eval(func.clone());
            }
            Expr::Index { x, index, comma_ok } => {
                self.ops.push(if *comma_ok { Op::Index2 } else { Op::Index1 });
                self.push_expr_eval(index.clone());
                self.push_expr_eval(x.clone());
            }
            Expr::Selector { x, .. } => {
                self.exprs.push(expr.clone());
                self.ops.push(Op::Selector);
                self.push_expr_eval(x.clone());
            }
            Expr::Slice { x, low, high } => {
                self.exprs.push(expr.clone());
                self.ops.push(Op::Slice);
                if let Some(high) = high {
                    self.push_expr_eval(high.clone());
                }
                if let Some(low) = low {
                    self.push_expr_eval(low.clone());
                }
                self.push_expr_eval(x.clone());
            }
            Expr::Star(x) => {
                self.ops.push(Op::Star);
                self.push_expr_eval(x.clone());
            }
            Expr::Ref(x) => {
                self.exprs.push(expr.clone());
                self.ops.push(Op::Ref);
                if matches!(x.as_ref(), Expr::Composite { .. }) {
                    self.push_expr_eval(x.clone());
                } else {
                    self.push_lhs_parts(x)?;
                }
            }
            Expr::Composite { ty, elts } => {
                let op = match ty.kind() {
                    Kind::Array => Op::ArrayLit,
                    Kind::Slice => Op::SliceLit,
                    Kind::Map => Op::MapLit,
                    Kind::Struct => Op::StructLit,
                    _ => {
                        return Err(VMError::TypeMismatch {
                            op: "composite",
                            expected: "array, slice, map or struct type",
                            actual: ty.to_string(),
                        });
                    }
                };
                self.exprs.push(expr.clone());
                self.ops.push(op);
                for elt in elts.iter().rev() {
                    self.push_expr_eval(elt.value.clone());
                    if let Some(key) = &elt.key {
                        self.push_expr_eval(key.clone());
                    }
                }
            }
            Expr::FuncLit { .. } => {
                self.exprs.push(expr.clone());
                self.ops.push(Op::FuncLit);
            }
        }
        Ok(())
    }

    /// Short-circuit point of `&&` and `||`.
    pub(super) fn do_binary1(&mut self) -> Result<(), VMError> {
        let expr = self.pop_expr()?;
        let Expr::Binary { op, y, .. } = expr.as_ref() else {
            return Err(unexpected("binary1", &expr));
        };
        let x = self.pop_value()?;
        let truth = x.expect_bool(op.op().mnemonic())?;
        let decided = match op.op() {
            Op::Lor => truth,
            _ => !truth,
        };
        if decided {
            self.values.push(TypedValue::boolean(truth));
        } else {
            self.values.push(x);
            self.ops.push(op.op());
            self.push_expr_eval(y.clone());
        }
        Ok(())
    }

    pub(super) fn do_index(&mut self, comma_ok: bool) -> Result<(), VMError> {
        let index = self.pop_value()?;
        let x = self.pop_value()?;
        match &x.v {
            Value::Array(av) => {
                if let Some(i) = self.check_index(&index, av.len())? {
                    let elem = av.get(i).unwrap_or_default();
                    self.values.push(elem);
                }
            }
            Value::Slice(sv) => {
                if let Some(i) = self.check_index(&index, sv.len)? {
                    let elem = sv.get(i).unwrap_or_default();
                    self.values.push(elem);
                }
            }
            Value::String(s) => {
                if let Some(i) = self.check_index(&index, s.len())? {
                    self.values.push(TypedValue::uint8(s[i]));
                }
            }
            Value::Map(map) => {
                let found = map.get(&MapKey::of(&index)?);
                self.push_map_lookup(&x, found, comma_ok)?;
            }
            Value::None if x.kind() == Some(Kind::Map) => {
                MapKey::of(&index)?;
                self.push_map_lookup(&x, None, comma_ok)?;
            }
            Value::None if matches!(x.kind(), Some(Kind::Slice | Kind::String)) => {
                self.check_index(&index, 0)?;
            }
            _ => {
                return Err(VMError::TypeMismatch {
                    op: "index",
                    expected: "array, slice, string or map",
                    actual: x.type_name(),
                });
            }
        }
        Ok(())
    }

    fn push_map_lookup(
        &mut self,
        map: &TypedValue,
        found: Option<TypedValue>,
        comma_ok: bool,
    ) -> Result<(), VMError> {
        let ok = found.is_some();
        let value = match found {
            Some(v) => v,
            None => {
                let value_ty = match &map.t {
                    Some(Type::Map(mt)) => mt.value.clone(),
                    _ => Type::Interface,
                };
                default_value(&mut self.alloc, &value_ty)?
            }
        };
        self.values.push(value);
        if comma_ok {
            self.values.push(TypedValue::boolean(ok));
        }
        Ok(())
    }

    pub(super) fn do_selector(&mut self) -> Result<(), VMError> {
        let expr = self.pop_expr()?;
        let Expr::Selector { sel, .. } = expr.as_ref() else {
            return Err(unexpected("selector", &expr));
        };
        let x = self.pop_value()?;
        match sel {
            Selection::Field(i) => {
                let target = if let Value::Pointer(ptr) = &x.v {
                    ptr.deref()?
                } else if x.kind() == Some(Kind::Pointer) {
                    return self.raise(NIL_DEREF);
                } else {
                    x
                };
                let Value::Struct(sv) = &target.v else {
                    return Err(VMError::TypeMismatch {
                        op: "selector",
                        expected: "struct",
                        actual: target.type_name(),
                    });
                };
                let field = sv.get(*i).ok_or(VMError::UnexpectedEntry {
                    op: "selector",
                    found: format!("field {} of {}", i, target.type_name()),
                })?;
                self.values.push(field);
            }
            Selection::Method(path) => {
                let method = self.get_path(*path)?;
                let Value::Func(fv) = &method.v else {
                    return Err(VMError::TypeMismatch {
                        op: "selector",
                        expected: "func",
                        actual: method.type_name(),
                    });
                };
                let bound = self.alloc.new_bound_method(fv.clone(), x)?;
                self.values.push(bound);
            }
        }
        Ok(())
    }

    pub(super) fn do_slice(&mut self) -> Result<(), VMError> {
        let expr = self.pop_expr()?;
        let Expr::Slice { low, high, .. } = expr.as_ref() else {
            return Err(unexpected("slice", &expr));
        };
        let high = match high {
            Some(_) => Some(self.pop_value()?.expect_int("slice")?),
            None => None,
        };
        let low = match low {
            Some(_) => Some(self.pop_value()?.expect_int("slice")?),
            None => None,
        };
        let x = self.pop_value()?;
        let (len, cap) = match &x.v {
            Value::Array(av) => (av.len(), av.len()),
            Value::Slice(sv) => (sv.len, sv.cap),
            Value::String(s) => (s.len(), s.len()),
            Value::None if matches!(x.kind(), Some(Kind::Slice | Kind::String)) => (0, 0),
            _ => {
                return Err(VMError::TypeMismatch {
                    op: "slice",
                    expected: "array, slice or string",
                    actual: x.type_name(),
                });
            }
        };
        let lo = low.unwrap_or(0);
        let hi = high.unwrap_or(len as i64);
        if lo < 0 || hi < lo || hi > cap as i64 {
            return self.raise(&format!(
                "runtime error: slice bounds out of range [{}:{}] with capacity {}",
                lo, hi, cap
            ));
        }
        let (lo, hi) = (lo as usize, hi as usize);
        let result = match &x.v {
            Value::Array(av) => {
                let elem = x.t.as_ref().and_then(Type::elem).cloned().unwrap_or(Type::Interface);
                self.alloc
                    .new_slice(Some(Type::slice(elem)), av.clone(), lo, hi - lo, cap - lo)?
            }
            Value::Slice(sv) => self.alloc.new_slice(
                x.t.clone(),
                sv.base.clone(),
                sv.offset + lo,
                hi - lo,
                sv.cap - lo,
            )?,
            Value::String(s) => self.alloc.new_string(&s[lo..hi])?,
            _ => x.clone(),
        };
        self.values.push(result);
        Ok(())
    }

    pub(super) fn do_star(&mut self) -> Result<(), VMError> {
        let x = self.pop_value()?;
        match &x.v {
            Value::Pointer(ptr) => {
                let target = ptr.deref()?;
                self.values.push(target);
                Ok(())
            }
            _ if x.is_nil() => self.raise(NIL_DEREF),
            _ => Err(VMError::TypeMismatch {
                op: "star",
                expected: "pointer",
                actual: x.type_name(),
            }),
        }
    }

    /// `&x`. Taking the address of an escaped local starts tracking its heap
    /// item; the pointer roots it once stored.
    pub(super) fn do_ref(&mut self) -> Result<(), VMError> {
        let expr = self.pop_expr()?;
        let Expr::Ref(inner) = expr.as_ref() else {
            return Err(unexpected("ref", &expr));
        };
        if let Expr::Composite { ty, .. } = inner.as_ref() {
            let value = self.pop_value()?;
            let item = self.alloc.new_heap_item(value)?;
            let size = self.alloc.costs().heap_item_size();
            self.heap.track(item.clone(), size, self.alloc.collections());
            let ptr = PointerValue {
                base: PointerBase::HeapItem(item),
                index: 0,
            };
            let tv = self.alloc.new_pointer(Type::pointer(ty.clone()), ptr)?;
            self.values.push(tv);
            return Ok(());
        }
        let Some((ptr, elem)) = self.pop_as_pointer(inner)? else {
            return Ok(());
        };
        if matches!(ptr.base, PointerBase::MapEntry { .. }) {
            return Err(VMError::TypeMismatch {
                op: "ref",
                expected: "addressable operand",
                actual: "map entry".into(),
            });
        }
        if let Some(item) = ptr.heap_item() {
            self.track_escape(item);
            self.escapes += 1;
        }
        let tv = self.alloc.new_pointer(Type::pointer(elem), ptr)?;
        self.values.push(tv);
        Ok(())
    }

    pub(super) fn do_composite_lit(&mut self, op: Op) -> Result<(), VMError> {
        let expr = self.pop_expr()?;
        let Expr::Composite { ty, elts } = expr.as_ref() else {
            return Err(unexpected(op.mnemonic(), &expr));
        };
        let result = match ty {
            Type::Array(at) => {
                let list = self.pop_copied(elts.len())?;
                let list = self.fill_zero(list, at.len, &at.elem)?;
                self.alloc.new_array(Some(ty.clone()), list)?
            }
            Type::Slice(elem) => {
                let list = self.pop_copied(elts.len())?;
                let n = list.len();
                let array = self
                    .alloc
                    .new_array(Some(Type::array(n, elem.as_ref().clone())), list)?;
                let Value::Array(base) = array.v else {
                    return Err(unexpected(op.mnemonic(), &expr));
                };
                self.alloc.new_slice(Some(ty.clone()), base, 0, n, n)?
            }
            Type::Map(_) => {
                let pairs = self.pop_values(elts.len() * 2)?;
                let tv = self.alloc.new_map(Some(ty.clone()))?;
                let Value::Map(map) = &tv.v else {
                    return Err(unexpected(op.mnemonic(), &expr));
                };
                for pair in pairs.chunks(2) {
                    let key = MapKey::of(&pair[0])?;
                    if !map.contains(&key) {
                        self.alloc.allocate_map_entries(1)?;
                    }
                    let value = self.copy_value(&pair[1])?;
                    self.retain_held(&value);
                    map.set(key, pair[0].clone(), value);
                }
                tv
            }
            Type::Struct(st) => {
                let fields = self.pop_copied(elts.len())?;
                let mut filled = fields;
                for field in st.fields.iter().skip(filled.len()) {
                    filled.push(default_value(&mut self.alloc, &field.ty)?);
                }
                self.alloc.new_struct(Some(ty.clone()), filled)?
            }
            _ => return Err(unexpected(op.mnemonic(), &expr)),
        };
        self.values.push(result);
        Ok(())
    }

    /// Copies `n` operands into a new aggregate. Elements never let go of
    /// what they hold, so their heap items stay rooted.
    fn pop_copied(&mut self, n: usize) -> Result<Vec<TypedValue>, VMError> {
        let values = self.pop_values(n)?;
        let mut copied = Vec::with_capacity(n);
        for v in &values {
            let value = self.copy_value(v)?;
            self.retain_held(&value);
            copied.push(value);
        }
        Ok(copied)
    }

    fn fill_zero(
        &mut self,
        mut list: Vec<TypedValue>,
        len: usize,
        elem: &Type,
    ) -> Result<Vec<TypedValue>, VMError> {
        if list.len() > len {
            return Err(VMError::UnexpectedEntry {
                op: "array_lit",
                found: format!("{} elements for length {}", list.len(), len),
            });
        }
        while list.len() < len {
            list.push(default_value(&mut self.alloc, elem)?);
        }
        Ok(list)
    }

    /// Builds a closure over the current block and the captured heap items.
    pub(super) fn do_func_lit(&mut self) -> Result<(), VMError> {
        let expr = self.pop_expr()?;
        let Expr::FuncLit { decl, captures } = expr.as_ref() else {
            return Err(unexpected("func_lit", &expr));
        };
        let mut captured = Vec::with_capacity(captures.len());
        for path in captures {
            let block = self.block_at(path.depth)?;
            let raw = block
                .values()
                .get(path.index as usize)
                .cloned()
                .ok_or(VMError::InvalidPath {
                    depth: path.depth,
                    index: path.index,
                })?;
            if !matches!(raw.v, Value::HeapItem(_)) {
                return Err(VMError::UnexpectedEntry {
                    op: "func_lit",
                    found: format!("non-heap capture {}", raw.type_name()),
                });
            }
            captured.push(raw);
        }
        let parent = self.last_block()?;
        let (pkg_path, package) = match self.active_package() {
            Some(pkg) => (pkg.path.clone(), Rc::downgrade(&pkg)),
            None => ("".into(), Weak::new()),
        };
        let func = FuncValue::new(
            decl.name.clone(),
            pkg_path,
            decl.ty.clone(),
            FuncBody::Source(decl.clone()),
            captured,
            Some(parent),
            package,
        );
        let tv = self.alloc.new_func(func)?;
        self.values.push(tv);
        Ok(())
    }
}

fn unexpected(op: &'static str, expr: &Expr) -> VMError {
    VMError::UnexpectedEntry {
        op,
        found: format!("{} expression", expr.label()),
    }
}

use super::{LoopPhase, Machine, StmtEntry};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Op;
use crate::virtual_machine::machine::frame::{Defer, Frame};
use crate::virtual_machine::nodes::{AssignOp, Body, Expr, ForStmt, Selection, Stmt};
use crate::virtual_machine::types::{Kind, Type};
use crate::virtual_machine::values::{
    BlockParent, MapKey, PointerBase, PointerValue, TypedValue, Value, default_value,
};
use num_bigint::BigInt;
use std::rc::Rc;

pub(super) const NIL_DEREF: &str = "runtime error: invalid memory address or nil pointer dereference";

impl Machine {
    pub(super) fn do_exec(&mut self) -> Result<(), VMError> {
        let stmt = match self.pop_stmt()? {
            StmtEntry::Stmt(stmt) => stmt,
            other => {
                return Err(VMError::UnexpectedEntry {
                    op: "exec",
                    found: format!("{:?}", other),
                });
            }
        };
        match stmt.as_ref() {
            Stmt::Expr(x) => {
                if matches!(x.as_ref(), Expr::Call { .. }) {
                    self.ops.push(Op::PopResults);
                } else {
                    self.ops.push(Op::PopValue);
                }
                self.push_expr_eval(x.clone());
            }
            Stmt::Assign { op, lhs, rhs } => {
                self.ops.push(op.op());
                if matches!(op, AssignOp::Assign | AssignOp::Define) {
                    for x in rhs.iter().rev() {
                        self.push_expr_eval(x.clone());
                    }
                } else if let Some(x) = rhs.first() {
                    self.push_expr_eval(x.clone());
                }
                for x in lhs.iter().rev() {
                    self.push_lhs_parts(x)?;
                }
                self.stmts.push(StmtEntry::Stmt(stmt.clone()));
            }
            Stmt::Inc(x) | Stmt::Dec(x) => {
                let op = if matches!(stmt.as_ref(), Stmt::Inc(_)) {
                    Op::Inc
                } else {
                    Op::Dec
                };
                self.stmts.push(StmtEntry::Stmt(stmt.clone()));
                self.ops.push(op);
                self.push_lhs_parts(x)?;
            }
            Stmt::If { cond, .. } => {
                self.stmts.push(StmtEntry::Stmt(stmt.clone()));
                self.ops.push(Op::IfCond);
                self.push_expr_eval(cond.clone());
            }
            Stmt::For(fs) => self.exec_for(fs.clone())?,
            Stmt::Block(body) => self.enter_body(body)?,
            Stmt::Return(results) => {
                if results.is_empty() {
                    self.unwind_return()?;
                } else {
                    self.ops.push(Op::ReturnToBlock);
                    for x in results.iter().rev() {
                        self.push_expr_eval(x.clone());
                    }
                }
            }
            Stmt::Break => match self.last_frame() {
                Ok(frame) if frame.is_loop => self.ops.push(Op::PopFrameAndReset),
                _ => {
                    return Err(VMError::UnexpectedEntry {
                        op: "break",
                        found: "no enclosing loop".into(),
                    });
                }
            },
            Stmt::Continue => self.exec_continue()?,
            Stmt::Defer { func, args } => {
                self.stmts.push(StmtEntry::Stmt(stmt.clone()));
                self.ops.push(Op::Defer);
                for x in args.iter().rev() {
                    self.push_expr_eval(x.clone());
                }
                self.push_expr_eval(func.clone());
            }
            Stmt::Go { .. } => self.ops.push(Op::Go),
            Stmt::Select => self.ops.push(Op::Select),
        }
        Ok(())
    }

    /// Schedules evaluation of the operands an assignment target needs.
    /// Names need none; `x[i]` evaluates `x` then `i`.
    pub(super) fn push_lhs_parts(&mut self, lhs: &Rc<Expr>) -> Result<(), VMError> {
        match lhs.as_ref() {
            Expr::Name { .. } => {}
            Expr::Index { x, index, .. } => {
                self.push_expr_eval(index.clone());
                self.push_expr_eval(x.clone());
            }
            Expr::Selector {
                x,
                sel: Selection::Field(_),
            } => self.push_expr_eval(x.clone()),
            Expr::Star(x) => self.push_expr_eval(x.clone()),
            other => {
                return Err(VMError::UnexpectedEntry {
                    op: "assign",
                    found: format!("{} target", other.label()),
                });
            }
        }
        Ok(())
    }

    /// Turns an assignment target and its evaluated operands into a pointer
    /// plus the static type of what it points at. Returns `None` after
    /// raising a runtime error.
    pub(super) fn pop_as_pointer(
        &mut self,
        lhs: &Expr,
    ) -> Result<Option<(PointerValue, Type)>, VMError> {
        match lhs {
            Expr::Name { path, .. } => {
                let block = self.block_at(path.depth)?;
                let index = path.index as usize;
                let ty = block
                    .source()
                    .slots
                    .get(index)
                    .map(|s| s.ty.clone())
                    .ok_or(VMError::InvalidPath {
                        depth: path.depth,
                        index: path.index,
                    })?;
                Ok(Some((block.pointer_to(index), ty)))
            }
            Expr::Index { .. } => {
                let index = self.pop_value()?;
                let x = self.pop_value()?;
                self.index_pointer(x, index)
            }
            Expr::Selector {
                sel: Selection::Field(i),
                ..
            } => {
                let x = self.pop_value()?;
                self.field_pointer(x, *i)
            }
            Expr::Star(_) => {
                let x = self.pop_value()?;
                let elem = x.t.as_ref().and_then(Type::elem).cloned();
                match (&x.v, elem) {
                    (Value::Pointer(ptr), Some(elem)) => Ok(Some((ptr.clone(), elem))),
                    _ if x.is_nil() => {
                        self.raise(NIL_DEREF)?;
                        Ok(None)
                    }
                    _ => Err(VMError::TypeMismatch {
                        op: "star",
                        expected: "pointer",
                        actual: x.type_name(),
                    }),
                }
            }
            other => Err(VMError::UnexpectedEntry {
                op: "assign",
                found: format!("{} target", other.label()),
            }),
        }
    }

    fn index_pointer(
        &mut self,
        x: TypedValue,
        index: TypedValue,
    ) -> Result<Option<(PointerValue, Type)>, VMError> {
        let elem = x.t.as_ref().and_then(Type::elem).cloned().unwrap_or(Type::Interface);
        match &x.v {
            Value::Array(av) => {
                let Some(i) = self.check_index(&index, av.len())? else {
                    return Ok(None);
                };
                Ok(Some((
                    PointerValue {
                        base: PointerBase::Array(av.clone()),
                        index: i,
                    },
                    elem,
                )))
            }
            Value::Slice(sv) => {
                let Some(i) = self.check_index(&index, sv.len)? else {
                    return Ok(None);
                };
                Ok(Some((
                    PointerValue {
                        base: PointerBase::Array(sv.base.clone()),
                        index: sv.offset + i,
                    },
                    elem,
                )))
            }
            Value::Map(map) => {
                MapKey::of(&index)?;
                let value_ty = match &x.t {
                    Some(Type::Map(mt)) => mt.value.clone(),
                    _ => Type::Interface,
                };
                Ok(Some((
                    PointerValue {
                        base: PointerBase::MapEntry {
                            map: map.clone(),
                            key: Box::new(index),
                        },
                        index: 0,
                    },
                    value_ty,
                )))
            }
            Value::None if x.kind() == Some(Kind::Map) => {
                self.raise("assignment to entry in nil map")?;
                Ok(None)
            }
            Value::None if x.kind() == Some(Kind::Slice) => {
                self.check_index(&index, 0)?;
                Ok(None)
            }
            _ => Err(VMError::TypeMismatch {
                op: "index",
                expected: "array, slice or map",
                actual: x.type_name(),
            }),
        }
    }

    fn field_pointer(
        &mut self,
        x: TypedValue,
        field: usize,
    ) -> Result<Option<(PointerValue, Type)>, VMError> {
        let target = if let Value::Pointer(ptr) = &x.v {
            ptr.deref()?
        } else if x.kind() == Some(Kind::Pointer) {
            self.raise(NIL_DEREF)?;
            return Ok(None);
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
        Ok(Some((
            PointerValue {
                base: PointerBase::Struct(sv.clone()),
                index: field,
            },
            field_type(target.t.as_ref(), field),
        )))
    }

    /// Validates an index operand against `len`, raising on failure.
    pub(super) fn check_index(
        &mut self,
        index: &TypedValue,
        len: usize,
    ) -> Result<Option<usize>, VMError> {
        let i = match index.kind() {
            Some(Kind::Uint8) => index.get_uint8() as i64,
            _ => index.expect_int("index")?,
        };
        if i < 0 || i as usize >= len {
            self.raise(&format!(
                "runtime error: index out of range [{}] with length {}",
                i, len
            ))?;
            return Ok(None);
        }
        Ok(Some(i as usize))
    }

    /// Current value behind `ptr`; missing map entries read as the zero value.
    pub(super) fn deref_or_zero(
        &mut self,
        ptr: &PointerValue,
        ty: &Type,
    ) -> Result<TypedValue, VMError> {
        let tv = ptr.deref()?;
        if tv.t.is_none() && matches!(ptr.base, PointerBase::MapEntry { .. }) {
            return default_value(&mut self.alloc, ty);
        }
        Ok(tv)
    }

    fn assign_target_name(stmt: &Stmt, i: usize) -> Option<&str> {
        match stmt {
            Stmt::Assign { lhs, .. } => match lhs.get(i).map(|x| x.as_ref()) {
                Some(Expr::Name { name, .. }) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    fn pop_assign_stmt(&mut self, op: &'static str) -> Result<Rc<Stmt>, VMError> {
        match self.pop_stmt()? {
            StmtEntry::Stmt(stmt) if matches!(stmt.as_ref(), Stmt::Assign { .. }) => Ok(stmt),
            StmtEntry::Stmt(stmt) if matches!(stmt.as_ref(), Stmt::Inc(_) | Stmt::Dec(_)) => {
                Ok(stmt)
            }
            other => Err(VMError::UnexpectedEntry {
                op,
                found: format!("{:?}", other),
            }),
        }
    }

    pub(super) fn do_define(&mut self) -> Result<(), VMError> {
        self.assign_values("define")
    }

    pub(super) fn do_assign(&mut self) -> Result<(), VMError> {
        self.assign_values("assign")
    }

    fn assign_values(&mut self, op: &'static str) -> Result<(), VMError> {
        let stmt = self.pop_assign_stmt(op)?;
        let Stmt::Assign { lhs, .. } = stmt.as_ref() else {
            return Err(VMError::UnexpectedEntry {
                op,
                found: "non-assignment".into(),
            });
        };
        let rhs = self.pop_values(lhs.len())?;
        for (i, (target, value)) in lhs.iter().zip(rhs).enumerate().rev() {
            let Some((ptr, _)) = self.pop_as_pointer(target)? else {
                return Ok(());
            };
            let value = self.copy_value(&value)?;
            if let Some(name) = Self::assign_target_name(&stmt, i) {
                self.claim_root(name, &value);
            }
            self.store_through(&ptr, value)?;
        }
        Ok(())
    }

    pub(super) fn do_op_assign(&mut self, op: Op) -> Result<(), VMError> {
        let stmt = self.pop_assign_stmt(op.mnemonic())?;
        let Stmt::Assign { lhs, .. } = stmt.as_ref() else {
            return Err(VMError::UnexpectedEntry {
                op: op.mnemonic(),
                found: "non-assignment".into(),
            });
        };
        let rhs = self.pop_value()?;
        let target = lhs.first().ok_or(VMError::UnexpectedEntry {
            op: op.mnemonic(),
            found: "empty assignment".into(),
        })?;
        let Some((ptr, ty)) = self.pop_as_pointer(target)? else {
            return Ok(());
        };
        let current = self.deref_or_zero(&ptr, &ty)?;
        let binary = match op {
            Op::AddAssign => Op::Add,
            Op::SubAssign => Op::Sub,
            _ => Op::Mul,
        };
        if let Some(fault) = self.runtime_fault(binary, &current, &rhs) {
            return self.raise(fault);
        }
        let result = self.apply_binary(binary, &current, &rhs)?;
        self.store_through(&ptr, result)
    }

    pub(super) fn do_inc_dec(&mut self, op: Op) -> Result<(), VMError> {
        let stmt = self.pop_assign_stmt(op.mnemonic())?;
        let (Stmt::Inc(target) | Stmt::Dec(target)) = stmt.as_ref() else {
            return Err(VMError::UnexpectedEntry {
                op: op.mnemonic(),
                found: "non-increment".into(),
            });
        };
        let Some((ptr, ty)) = self.pop_as_pointer(target)? else {
            return Ok(());
        };
        let current = self.deref_or_zero(&ptr, &ty)?;
        let delta = if op == Op::Inc { 1 } else { -1 };
        let result = match current.kind() {
            Some(Kind::Int) => TypedValue::int(current.get_int().wrapping_add(delta)),
            Some(Kind::Uint8) => TypedValue::uint8(current.get_uint8().wrapping_add(delta as u8)),
            Some(Kind::BigInt) => self.alloc.new_bigint(current.get_bigint() + BigInt::from(delta))?,
            _ => {
                return Err(VMError::TypeMismatch {
                    op: op.mnemonic(),
                    expected: "numeric",
                    actual: current.type_name(),
                });
            }
        };
        self.store_through(&ptr, result)
    }

    pub(super) fn do_if_cond(&mut self) -> Result<(), VMError> {
        let stmt = match self.pop_stmt()? {
            StmtEntry::Stmt(stmt) => stmt,
            other => {
                return Err(VMError::UnexpectedEntry {
                    op: "if_cond",
                    found: format!("{:?}", other),
                });
            }
        };
        let Stmt::If { then, els, .. } = stmt.as_ref() else {
            return Err(VMError::UnexpectedEntry {
                op: "if_cond",
                found: "non-if statement".into(),
            });
        };
        let cond = self.pop_value()?.expect_bool("if")?;
        if cond {
            self.enter_body(then)
        } else if let Some(els) = els {
            self.enter_body(els)
        } else {
            Ok(())
        }
    }

    /// Opens a block for `body` and schedules its statements.
    fn enter_body(&mut self, body: &Body) -> Result<(), VMError> {
        let parent = self.last_block()?;
        let block = self
            .alloc
            .new_block(body.block.clone(), BlockParent::Block(parent))?;
        self.push_block(block);
        self.ops.push(Op::PopBlock);
        self.push_body(body.stmts.clone());
        Ok(())
    }

    pub(super) fn do_body(&mut self) -> Result<(), VMError> {
        let next = match self.stmts.last_mut() {
            Some(StmtEntry::Body { stmts, next }) => {
                let stmt = stmts.get(*next).cloned();
                *next += 1;
                stmt
            }
            other => {
                return Err(VMError::UnexpectedEntry {
                    op: "body",
                    found: format!("{:?}", other),
                });
            }
        };
        match next {
            Some(stmt) => self.push_stmt_exec(stmt),
            None => {
                self.pop_op()?;
                self.pop_stmt()?;
            }
        }
        Ok(())
    }

    pub(super) fn do_pop_block(&mut self) -> Result<(), VMError> {
        let len = self.roots.blocks.borrow().len();
        if len == 0 {
            return Err(VMError::StackUnderflow { stack: "block" });
        }
        self.truncate_blocks(len - 1);
        Ok(())
    }

    pub(super) fn do_pop_frame_and_reset(&mut self) -> Result<(), VMError> {
        self.pop_frame()?;
        Ok(())
    }

    fn exec_for(&mut self, stmt: Rc<ForStmt>) -> Result<(), VMError> {
        let parent = self.last_block()?;
        let block = self
            .alloc
            .new_block(stmt.block.clone(), BlockParent::Block(parent))?;
        self.push_frame(Frame {
            is_loop: true,
            num_values: self.values.len(),
            ..Frame::default()
        });
        self.push_block(block);
        self.stmts.push(StmtEntry::ForLoop {
            stmt,
            phase: LoopPhase::Init,
        });
        self.ops.push(Op::ForLoop);
        Ok(())
    }

    fn set_loop_phase(&mut self, to: LoopPhase) {
        if let Some(StmtEntry::ForLoop { phase, .. }) = self.stmts.last_mut() {
            *phase = to;
        }
    }

    pub(super) fn do_for_loop(&mut self) -> Result<(), VMError> {
        let (stmt, phase) = match self.stmts.last() {
            Some(StmtEntry::ForLoop { stmt, phase }) => (stmt.clone(), *phase),
            other => {
                return Err(VMError::UnexpectedEntry {
                    op: "for_loop",
                    found: format!("{:?}", other),
                });
            }
        };
        match phase {
            LoopPhase::Init => {
                self.set_loop_phase(LoopPhase::Cond);
                if let Some(init) = &stmt.init {
                    self.push_stmt_exec(init.clone());
                }
            }
            LoopPhase::Cond => match &stmt.cond {
                Some(cond) => {
                    self.set_loop_phase(LoopPhase::CheckCond);
                    self.push_expr_eval(cond.clone());
                }
                None => self.set_loop_phase(LoopPhase::Body),
            },
            LoopPhase::CheckCond => {
                if self.pop_value()?.expect_bool("for")? {
                    self.set_loop_phase(LoopPhase::Body);
                } else {
                    self.pop_frame()?;
                }
            }
            LoopPhase::Body => {
                self.set_loop_phase(LoopPhase::Post);
                self.enter_body(&stmt.body)?;
            }
            LoopPhase::Post => {
                self.set_loop_phase(LoopPhase::Cond);
                if let Some(post) = &stmt.post {
                    self.push_stmt_exec(post.clone());
                }
            }
        }
        Ok(())
    }

    /// Drops the rest of the iteration and resumes at the post statement.
    fn exec_continue(&mut self) -> Result<(), VMError> {
        let frame = match self.last_frame() {
            Ok(frame) if frame.is_loop => frame,
            _ => {
                return Err(VMError::UnexpectedEntry {
                    op: "continue",
                    found: "no enclosing loop".into(),
                });
            }
        };
        self.ops.truncate(frame.num_ops + 1);
        self.values.truncate(frame.num_values);
        self.exprs.truncate(frame.num_exprs);
        self.stmts.truncate(frame.num_stmts + 1);
        self.truncate_blocks(frame.num_blocks + 1);
        self.set_loop_phase(LoopPhase::Post);
        Ok(())
    }

    /// Leaves the current function: loops are abandoned, then deferred calls
    /// run, then the results are pushed for the caller.
    pub(super) fn unwind_return(&mut self) -> Result<(), VMError> {
        if !self.unwind_to_call_frame()? {
            return Err(VMError::UnexpectedEntry {
                op: "return",
                found: "no enclosing call".into(),
            });
        }
        self.ops.push(Op::ReturnFromBlock);
        self.ops.push(Op::ReturnCallDefers);
        Ok(())
    }

    pub(super) fn do_defer(&mut self) -> Result<(), VMError> {
        let stmt = match self.pop_stmt()? {
            StmtEntry::Stmt(stmt) => stmt,
            other => {
                return Err(VMError::UnexpectedEntry {
                    op: "defer",
                    found: format!("{:?}", other),
                });
            }
        };
        let Stmt::Defer { args, .. } = stmt.as_ref() else {
            return Err(VMError::UnexpectedEntry {
                op: "defer",
                found: "non-defer statement".into(),
            });
        };
        let args = self.pop_values(args.len())?;
        let func = self.pop_value()?;
        let parent = self.last_block().ok();
        let index = self.last_call_frame_index().ok_or(VMError::UnexpectedEntry {
            op: "defer",
            found: "no enclosing call".into(),
        })?;
        self.roots.frames.borrow_mut()[index]
            .defers
            .push(Defer { func, args, parent });
        Ok(())
    }
}

/// Declared type of field `index` of a struct or pointer-to-struct type.
pub(super) fn field_type(t: Option<&Type>, index: usize) -> Type {
    let st = match t {
        Some(Type::Struct(st)) => Some(st),
        Some(Type::Pointer(elem)) => match elem.as_ref() {
            Type::Struct(st) => Some(st),
            _ => None,
        },
        _ => None,
    };
    st.and_then(|st| st.fields.get(index))
        .map(|f| f.ty.clone())
        .unwrap_or(Type::Interface)
}

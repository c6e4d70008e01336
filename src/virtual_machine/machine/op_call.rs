use super::Machine;
use super::op_exec::NIL_DEREF;
use crate::{debug, info};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Op;
use crate::virtual_machine::machine::frame::{Exception, Frame};
use crate::virtual_machine::nodes::Expr;
use crate::virtual_machine::types::Type;
use crate::virtual_machine::values::{Block, BlockParent, FuncBody, TypedValue, Value};
use std::rc::Rc;

impl Machine {
    pub(super) fn do_precall(&mut self) -> Result<(), VMError> {
        let expr = self.pop_expr()?;
        let Expr::Call { args, .. } = expr.as_ref() else {
            return Err(VMError::UnexpectedEntry {
                op: "precall",
                found: format!("{} expression", expr.label()),
            });
        };
        self.precall(args.len(), false)
    }

    /// Schedules a call of the callee sitting below `num_args` arguments on
    /// the value stack. Bound methods are unpacked into their function with
    /// the receiver as first argument.
    pub(super) fn precall(&mut self, num_args: usize, is_defer: bool) -> Result<(), VMError> {
        let len = self.values.len();
        if len < num_args + 1 {
            return Err(VMError::StackUnderflow { stack: "value" });
        }
        let callee_at = len - num_args - 1;
        let callee = self.values[callee_at].clone();
        let (func, receiver, num_args) = match &callee.v {
            Value::Func(fv) => (fv.clone(), TypedValue::nil(), num_args),
            Value::BoundMethod(bm) => {
                self.values[callee_at] = TypedValue {
                    t: Some(Type::Func(bm.func.ty.clone())),
                    v: Value::Func(bm.func.clone()),
                    n: [0; 8],
                };
                self.values.insert(callee_at + 1, bm.receiver.clone());
                (bm.func.clone(), bm.receiver.clone(), num_args + 1)
            }
            _ if callee.is_nil() => return self.raise(NIL_DEREF),
            _ => {
                return Err(VMError::TypeMismatch {
                    op: "precall",
                    expected: "func",
                    actual: callee.type_name(),
                });
            }
        };
        if func.is_native() {
            self.native_args = num_args;
            self.ops.push(Op::CallNativeBody);
        } else {
            self.push_frame(Frame {
                num_values: callee_at,
                func: Some(func),
                receiver,
                num_args,
                is_defer,
                ..Frame::default()
            });
            self.ops.push(Op::Call);
        }
        Ok(())
    }

    pub(super) fn do_call(&mut self) -> Result<(), VMError> {
        let frame = self.last_frame()?;
        let func = frame.func.clone().ok_or(VMError::UnexpectedEntry {
            op: "call",
            found: "loop frame".into(),
        })?;
        let FuncBody::Source(decl) = &func.body else {
            return Err(VMError::UnexpectedEntry {
                op: "call",
                found: format!("native {}", func.name),
            });
        };
        let args = self.pop_values(frame.num_args)?;
        self.pop_value()?;

        let parent = func
            .parent
            .clone()
            .or_else(|| func.package.upgrade().map(|pkg| pkg.block.clone()))
            .unwrap_or_else(|| self.uverse.block.clone());
        let block = self
            .alloc
            .new_block(decl.block.clone(), BlockParent::Block(parent))?;
        for (i, arg) in args.iter().enumerate() {
            let value = self.copy_value(arg)?;
            self.bind_slot(&block, i, value)?;
        }
        let first_capture = block.len().saturating_sub(func.captures.len());
        for (i, item) in func.captures.iter().enumerate() {
            block.set_raw(first_capture + i, item.clone());
        }
        self.push_block(block);

        let last_package = self.active_package();
        let last_realm = self.realm.clone();
        let mut did_cross = false;
        if let Some(pkg) = func.package.upgrade() {
            let same_realm = match (&pkg.realm, &self.realm) {
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if !same_realm {
                did_cross = true;
                self.realm = pkg.realm.clone();
            }
            *self.roots.package.borrow_mut() = Some(pkg);
        }
        if let Some(top) = self.roots.frames.borrow_mut().last_mut() {
            top.last_package = last_package;
            top.last_realm = last_realm;
            top.did_cross = did_cross;
        }

        let implicit_return = self.implicit_return.clone();
        self.push_stmt_exec(implicit_return);
        self.push_body(decl.body.clone());
        Ok(())
    }

    pub(super) fn do_call_native_body(&mut self) -> Result<(), VMError> {
        let args = self.pop_values(self.native_args)?;
        self.native_args = 0;
        let callee = self.pop_value()?;
        let native = match &callee.v {
            Value::Func(fv) => match &fv.body {
                FuncBody::Native(native) => *native,
                FuncBody::Source(_) => {
                    return Err(VMError::UnexpectedEntry {
                        op: "call_native_body",
                        found: format!("source func {}", fv.name),
                    });
                }
            },
            _ => {
                return Err(VMError::TypeMismatch {
                    op: "call_native_body",
                    expected: "func",
                    actual: callee.type_name(),
                });
            }
        };
        let results = native(self, args)?;
        self.values.extend(results);
        Ok(())
    }

    /// Copies `return` operands into the function block's result slots.
    pub(super) fn do_return_to_block(&mut self) -> Result<(), VMError> {
        let (frame, block) = self.call_frame_and_block("return_to_block")?;
        let func = frame.func.ok_or(VMError::StackUnderflow { stack: "frame" })?;
        let num_params = func.ty.params.len();
        let results = self.pop_values(func.ty.results.len())?;
        for (i, result) in results.iter().enumerate() {
            let value = self.copy_value(result)?;
            self.bind_slot(&block, num_params + i, value)?;
        }
        self.unwind_return()
    }

    /// Pops the call frame and pushes the function's results for the caller.
    pub(super) fn do_return_from_block(&mut self) -> Result<(), VMError> {
        let (frame, block) = self.call_frame_and_block("return_from_block")?;
        let func = frame.func.ok_or(VMError::StackUnderflow { stack: "frame" })?;
        let num_params = func.ty.params.len();
        let results: Vec<TypedValue> = (0..func.ty.results.len())
            .map(|i| block.get(num_params + i).unwrap_or_default())
            .collect();
        self.pop_frame()?;
        self.values.extend(results);
        self.sweep_heap()
    }

    fn call_frame_and_block(
        &self,
        op: &'static str,
    ) -> Result<(Frame, Rc<Block>), VMError> {
        let frame = {
            let frames = self.roots.frames.borrow();
            let index = frames
                .iter()
                .rposition(Frame::is_call)
                .ok_or(VMError::UnexpectedEntry {
                    op,
                    found: "no enclosing call".into(),
                })?;
            frames[index].clone()
        };
        let block = self
            .roots
            .blocks
            .borrow()
            .get(frame.num_blocks)
            .cloned()
            .ok_or(VMError::StackUnderflow { stack: "block" })?;
        Ok((frame, block))
    }

    /// Releases the cost of escaped locals no root reaches any more. Only
    /// nodes tracked since the last deep collection are released; older ones
    /// were already recounted by it.
    fn sweep_heap(&mut self) -> Result<(), VMError> {
        let extra = self.scoped_heap_roots();
        let epoch = self.alloc.collections();
        let mut released = 0;
        let mut dropped = 0;
        for node in self.heap.mark_and_sweep(&extra) {
            dropped += 1;
            if node.epoch == epoch {
                self.alloc.deallocate(node.size)?;
                released += node.size;
            }
        }
        if dropped > 0 {
            debug!(
                target: "heap",
                "swept {} escaped locals, released {} bytes",
                dropped,
                released
            );
        }
        Ok(())
    }

    /// Runs the innermost call frame's deferred calls, last registered first.
    pub(super) fn do_return_call_defers(&mut self) -> Result<(), VMError> {
        let index = self
            .last_call_frame_index()
            .ok_or(VMError::UnexpectedEntry {
                op: "return_call_defers",
                found: "no enclosing call".into(),
            })?;
        let next = self.roots.frames.borrow_mut()[index].defers.pop();
        match next {
            None => {
                self.pop_op()?;
            }
            Some(defer) => {
                let num_args = defer.args.len();
                self.ops.push(Op::PopResults);
                self.values.push(defer.func);
                self.values.extend(defer.args);
                self.precall(num_args, true)?;
            }
        }
        Ok(())
    }

    pub(super) fn do_pop_results(&mut self) {
        let base = self.value_base();
        self.values.truncate(base);
    }

    /// Starts a language panic with the value on top of the value stack.
    pub(super) fn do_panic1(&mut self) -> Result<(), VMError> {
        let value = self.pop_value()?;
        let stacktrace = self.roots.stacktrace().join("\n");
        self.roots.exceptions.borrow_mut().push(Exception {
            value,
            stacktrace,
            recovered: false,
        });
        if !self.unwind_to_call_frame()? {
            return Err(self.unhandled_panic());
        }
        self.ops.push(Op::Panic2);
        self.ops.push(Op::ReturnCallDefers);
        Ok(())
    }

    /// Runs after a panicking frame's deferred calls. A recovered panic
    /// returns normally from that frame; otherwise unwinding moves on to the
    /// caller.
    pub(super) fn do_panic2(&mut self) -> Result<(), VMError> {
        let recovered = self.roots.exceptions.borrow().iter().all(|e| e.recovered);
        if recovered {
            self.roots.exceptions.borrow_mut().clear();
            self.ops.push(Op::ReturnFromBlock);
            return Ok(());
        }
        self.pop_frame()?;
        if !self.unwind_to_call_frame()? {
            return Err(self.unhandled_panic());
        }
        self.ops.push(Op::Panic2);
        self.ops.push(Op::ReturnCallDefers);
        Ok(())
    }

    /// Value of the panic in flight, marking it recovered. Nil unless called
    /// directly from a deferred function.
    pub(super) fn recover(&mut self) -> TypedValue {
        let in_defer = self
            .roots
            .frames
            .borrow()
            .iter()
            .rev()
            .find(|f| f.is_call())
            .is_some_and(|f| f.is_defer);
        if !in_defer {
            return TypedValue::nil();
        }
        let mut exceptions = self.roots.exceptions.borrow_mut();
        match exceptions.iter_mut().rev().find(|e| !e.recovered) {
            Some(exception) => {
                exception.recovered = true;
                exception.value.clone()
            }
            None => TypedValue::nil(),
        }
    }

    fn unhandled_panic(&self) -> VMError {
        let exceptions = self.roots.exceptions.borrow();
        let descriptor = exceptions
            .iter()
            .map(|e| {
                let suffix = if e.recovered { " [recovered]" } else { "" };
                format!("panic: {}{}", e.value, suffix)
            })
            .collect::<Vec<_>>()
            .join("\n\t");
        let stacktrace = exceptions
            .first()
            .map(|e| e.stacktrace.clone())
            .unwrap_or_default();
        info!(target: "machine", "unhandled {}", descriptor);
        VMError::UnhandledPanic {
            descriptor,
            stacktrace,
        }
    }
}

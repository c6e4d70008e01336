//! The interpreter.
//!
//! A [`Machine`] runs pre-resolved syntax trees with five parallel stacks:
//! opcodes, expressions, statements, operand values and lexical blocks, plus a
//! stack of [`Frame`]s recording each stack's depth at the time a call or loop
//! began. One opcode runs per step. Every step is charged its fixed CPU cost
//! against the cycle limit and the gas meter, and any collection visits the
//! step caused are charged right after it.
//!
//! Language panics unwind through frames and deferred calls and can be
//! recovered by the program. Resource exhaustion and broken invariants are
//! [`VMError`]s and end the execution.

pub mod frame;
mod op_binary;
mod op_call;
mod op_exec;
mod op_expr;
pub mod uverse;

#[cfg(test)]
mod tests;

use crate::virtual_machine::alloc::{AllocCosts, Allocator};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::gas::{GAS_FACTOR_CPU, GasCategory, GasMeter};
use crate::virtual_machine::gc::DeepCollector;
use crate::virtual_machine::heap::{HeapTracker, NodeId};
use crate::virtual_machine::isa::Op;
use crate::virtual_machine::nodes::{BlockNode, Expr, ForStmt, Stmt, ValuePath};
use crate::virtual_machine::profile::AllocObserver;
use crate::virtual_machine::store::Store;
use crate::virtual_machine::types::Type;
use crate::virtual_machine::values::{
    Block, BlockParent, HeapItemValue, MapKey, PackageValue, PointerBase, PointerValue, Realm,
    TypedValue, Value,
};
use frame::{Exception, Frame, LiveRoots};
use std::rc::Rc;

/// Construction parameters of a [`Machine`].
#[derive(Clone, Debug)]
pub struct MachineOptions {
    /// Allocation ceiling in bytes; 0 disables accounting.
    pub max_alloc_bytes: i64,
    /// Growth below which no proactive collection runs.
    pub min_gc_interval: i64,
    /// Opcode cycle limit; 0 means unlimited.
    pub max_cycles: u64,
    pub costs: AllocCosts,
    /// CPU cycles charged per value visited by a collection pass.
    pub visit_cpu_factor: u64,
    /// Largest big integer, in bits, that shifts and products may build.
    pub max_bigint_bits: u64,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            max_alloc_bytes: 500_000_000,
            min_gc_interval: 10_000_000,
            max_cycles: 0,
            costs: AllocCosts::default(),
            visit_cpu_factor: 8,
            max_bigint_bits: 1 << 16,
        }
    }
}

/// Progress of a for loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopPhase {
    Init,
    Cond,
    CheckCond,
    Body,
    Post,
}

/// Entry of the statement stack.
#[derive(Clone, Debug)]
pub(crate) enum StmtEntry {
    Stmt(Rc<Stmt>),
    /// Statements of a body still to run, driven by the sticky `Body` op.
    Body {
        stmts: Rc<Vec<Rc<Stmt>>>,
        next: usize,
    },
    ForLoop {
        stmt: Rc<ForStmt>,
        phase: LoopPhase,
    },
}

pub struct Machine {
    ops: Vec<Op>,
    values: Vec<TypedValue>,
    exprs: Vec<Rc<Expr>>,
    stmts: Vec<StmtEntry>,
    /// Blocks, frames, packages and exceptions; shared with the collector.
    roots: Rc<LiveRoots>,

    alloc: Allocator,
    heap: HeapTracker,
    gas: Option<Box<dyn GasMeter>>,
    store: Option<Rc<dyn Store>>,

    uverse: Rc<PackageValue>,
    realm: Option<Rc<Realm>>,
    /// Argument count of the native call scheduled by the last precall.
    native_args: usize,
    implicit_return: Rc<Stmt>,

    cycles: u64,
    max_cycles: u64,
    visit_cpu_factor: u64,
    max_bigint_bits: u64,
    escapes: u64,
}

impl Machine {
    pub fn new(options: MachineOptions) -> Self {
        let roots = Rc::new(LiveRoots::default());
        let mut alloc = Allocator::new(
            options.max_alloc_bytes,
            options.min_gc_interval,
            options.costs,
        );
        alloc.set_collector(Box::new(DeepCollector::new(roots.clone())));
        alloc.set_stack_probe(roots.clone());
        Self {
            ops: Vec::new(),
            values: Vec::new(),
            exprs: Vec::new(),
            stmts: Vec::new(),
            roots,
            alloc,
            heap: HeapTracker::new(),
            gas: None,
            store: None,
            uverse: uverse::package(),
            realm: None,
            native_args: 0,
            implicit_return: Rc::new(Stmt::Return(Vec::new())),
            cycles: 0,
            max_cycles: options.max_cycles,
            visit_cpu_factor: options.visit_cpu_factor,
            max_bigint_bits: options.max_bigint_bits,
            escapes: 0,
        }
    }

    pub fn with_gas_meter(mut self, meter: Box<dyn GasMeter>) -> Self {
        self.gas = Some(meter);
        self
    }

    pub fn set_gas_meter(&mut self, meter: Box<dyn GasMeter>) {
        self.gas = Some(meter);
    }

    pub fn gas_meter(&self) -> Option<&dyn GasMeter> {
        self.gas.as_deref()
    }

    pub fn set_store(&mut self, store: Rc<dyn Store>) {
        self.store = Some(store);
    }

    pub fn set_alloc_observer(&mut self, observer: Box<dyn AllocObserver>) {
        self.alloc.set_observer(observer);
    }

    pub fn take_alloc_observer(&mut self) -> Option<Box<dyn AllocObserver>> {
        self.alloc.take_observer()
    }

    /// Makes `pkg` the active package; its block becomes the outermost block.
    pub fn set_active_package(&mut self, pkg: Rc<PackageValue>) {
        {
            let mut blocks = self.roots.blocks.borrow_mut();
            blocks.clear();
            blocks.push(pkg.block.clone());
        }
        self.realm = pkg.realm.clone();
        *self.roots.package.borrow_mut() = Some(pkg);
    }

    /// Package being built and not yet active; kept alive across collections.
    pub fn set_staging_package(&mut self, pkg: Option<Rc<PackageValue>>) {
        *self.roots.staging.borrow_mut() = pkg;
    }

    pub fn active_package(&self) -> Option<Rc<PackageValue>> {
        self.roots.package.borrow().clone()
    }

    pub fn realm(&self) -> Option<&Rc<Realm>> {
        self.realm.as_ref()
    }

    /// The builtin package.
    pub fn uverse(&self) -> &Rc<PackageValue> {
        &self.uverse
    }

    /// Creates a charged package whose block is built from `source` and whose
    /// parent scope is the builtin block.
    pub fn new_package(
        &mut self,
        name: &str,
        path: &str,
        source: Rc<BlockNode>,
        realm: Option<Rc<Realm>>,
    ) -> Result<Rc<PackageValue>, VMError> {
        let block = self
            .alloc
            .new_block(source, BlockParent::Block(self.uverse.block.clone()))?;
        self.alloc
            .new_package(name.into(), path.into(), block, realm)
    }

    pub fn alloc(&self) -> &Allocator {
        &self.alloc
    }

    pub fn alloc_mut(&mut self) -> &mut Allocator {
        &mut self.alloc
    }

    pub fn heap(&self) -> &HeapTracker {
        &self.heap
    }

    /// CPU cycles consumed since the last reset.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Addresses taken of heap-escaped locals since the last reset.
    pub fn escape_count(&self) -> u64 {
        self.escapes
    }

    /// Exceptions in flight, oldest first.
    pub fn exceptions(&self) -> Vec<Exception> {
        self.roots.exceptions.borrow().clone()
    }

    // ---- entry points ----

    /// Evaluates `expr` in the innermost block and returns every value it produced.
    pub fn eval(&mut self, expr: Rc<Expr>) -> Result<Vec<TypedValue>, VMError> {
        self.ensure_idle("eval")?;
        let base = self.values.len();
        self.ops.push(Op::Halt);
        self.exprs.push(expr);
        self.ops.push(Op::Eval);
        self.run()?;
        Ok(self.values.split_off(base))
    }

    /// Executes one statement in the innermost block.
    pub fn run_stmt(&mut self, stmt: Rc<Stmt>) -> Result<(), VMError> {
        self.ensure_idle("run_stmt")?;
        self.ops.push(Op::Halt);
        self.stmts.push(StmtEntry::Stmt(stmt));
        self.ops.push(Op::Exec);
        self.run()
    }

    /// Calls a function value with already evaluated arguments.
    pub fn call(
        &mut self,
        func: TypedValue,
        args: Vec<TypedValue>,
    ) -> Result<Vec<TypedValue>, VMError> {
        self.ensure_idle("call")?;
        let base = self.values.len();
        let num_args = args.len();
        self.ops.push(Op::Halt);
        self.values.push(func);
        self.values.extend(args);
        self.precall(num_args, false)?;
        self.run()?;
        Ok(self.values.split_off(base))
    }

    /// Runs a deep collection pass now and pays for it.
    pub fn garbage_collect(&mut self) -> Result<(), VMError> {
        self.alloc.collect()?;
        self.pay_gc_visits()
    }

    /// Fails unless every stack is drained. Only package blocks may remain.
    pub fn check_empty(&self) -> Result<(), VMError> {
        let leftover = if !self.ops.is_empty() {
            Some("op")
        } else if !self.values.is_empty() {
            Some("value")
        } else if !self.exprs.is_empty() {
            Some("expr")
        } else if !self.stmts.is_empty() {
            Some("stmt")
        } else if self.has_non_package_blocks() {
            Some("(non-package) block")
        } else if !self.roots.frames.borrow().is_empty() {
            Some("frame")
        } else if !self.roots.exceptions.borrow().is_empty() {
            Some("exception")
        } else {
            None
        };
        match leftover {
            Some(what) => Err(VMError::MachineNotEmpty {
                details: format!("found leftover {what}"),
            }),
            None => Ok(()),
        }
    }

    /// Restores the machine to its freshly built state for a new execution.
    ///
    /// Clears the five stacks, frames, exceptions, active and staging
    /// packages, realm, pending native call, cycle and escape counters, the
    /// gas meter, the root tracker and the allocator's counters. The
    /// collector's cycle stamp keeps counting up.
    pub fn reset(&mut self) {
        self.ops.clear();
        self.values.clear();
        self.exprs.clear();
        self.stmts.clear();
        self.roots.clear();
        self.alloc.reset();
        self.heap.clear();
        self.gas = None;
        self.realm = None;
        self.native_args = 0;
        self.cycles = 0;
        self.escapes = 0;
    }

    fn has_non_package_blocks(&self) -> bool {
        let package = self.roots.package.borrow();
        self.roots.blocks.borrow().iter().any(|b| match package.as_ref() {
            Some(pkg) => {
                !Rc::ptr_eq(b, &pkg.block)
                    && !pkg.file_blocks().iter().any(|fb| Rc::ptr_eq(b, fb))
            }
            None => true,
        })
    }

    fn ensure_idle(&self, what: &'static str) -> Result<(), VMError> {
        if self.ops.is_empty() {
            Ok(())
        } else {
            Err(VMError::MachineBusy(what))
        }
    }

    // ---- run loop ----

    fn run(&mut self) -> Result<(), VMError> {
        loop {
            let op = self.next_op()?;
            self.incr_cpu(op.cpu_cost())?;
            match op {
                Op::Halt => return Ok(()),
                Op::Noop => {}
                Op::Exec => self.do_exec()?,
                Op::Precall => self.do_precall()?,
                Op::Call => self.do_call()?,
                Op::CallNativeBody => self.do_call_native_body()?,
                Op::ReturnFromBlock => self.do_return_from_block()?,
                Op::ReturnToBlock => self.do_return_to_block()?,
                Op::Defer => self.do_defer()?,
                Op::Go => return Err(VMError::NotImplemented { op: "go" }),
                Op::Select => return Err(VMError::NotImplemented { op: "select" }),
                Op::IfCond => self.do_if_cond()?,
                Op::PopValue => {
                    self.pop_value()?;
                }
                Op::PopResults => self.do_pop_results(),
                Op::PopBlock => self.do_pop_block()?,
                Op::PopFrameAndReset => self.do_pop_frame_and_reset()?,
                Op::Panic1 => self.do_panic1()?,
                Op::Panic2 => self.do_panic2()?,
                Op::Upos | Op::Uneg | Op::Unot | Op::Uxor => self.do_unary(op)?,
                Op::Lor
                | Op::Land
                | Op::Eql
                | Op::Neq
                | Op::Lss
                | Op::Leq
                | Op::Gtr
                | Op::Geq
                | Op::Add
                | Op::Sub
                | Op::Bor
                | Op::Xor
                | Op::Mul
                | Op::Quo
                | Op::Rem
                | Op::Shl
                | Op::Shr
                | Op::Band
                | Op::Bandn => self.do_binary(op)?,
                Op::Eval => self.do_eval()?,
                Op::Binary1 => self.do_binary1()?,
                Op::Index1 => self.do_index(false)?,
                Op::Index2 => self.do_index(true)?,
                Op::Selector => self.do_selector()?,
                Op::Slice => self.do_slice()?,
                Op::Star => self.do_star()?,
                Op::Ref => self.do_ref()?,
                Op::ArrayLit | Op::SliceLit | Op::MapLit | Op::StructLit => {
                    self.do_composite_lit(op)?
                }
                Op::FuncLit => self.do_func_lit()?,
                Op::Assign => self.do_assign()?,
                Op::AddAssign | Op::SubAssign | Op::MulAssign => self.do_op_assign(op)?,
                Op::Define => self.do_define()?,
                Op::Inc | Op::Dec => self.do_inc_dec(op)?,
                Op::Body => self.do_body()?,
                Op::ForLoop => self.do_for_loop()?,
                Op::ReturnCallDefers => self.do_return_call_defers()?,
            }
            self.pay_gc_visits()?;
        }
    }

    /// Pops the next op, or peeks it if sticky.
    fn next_op(&mut self) -> Result<Op, VMError> {
        match self.ops.last().copied() {
            Some(op) if op.is_sticky() => Ok(op),
            Some(_) => self.pop_op(),
            None => Err(VMError::StackUnderflow { stack: "op" }),
        }
    }

    fn incr_cpu(&mut self, cycles: u64) -> Result<(), VMError> {
        self.cycles = self.cycles.saturating_add(cycles);
        if self.max_cycles != 0 && self.cycles > self.max_cycles {
            return Err(VMError::CpuCycleOverrun {
                cycles: self.cycles,
                limit: self.max_cycles,
            });
        }
        self.consume_gas(cycles.saturating_mul(GAS_FACTOR_CPU), GasCategory::OpcodeCpu)
    }

    pub(crate) fn consume_gas(&mut self, amount: u64, reason: GasCategory) -> Result<(), VMError> {
        match self.gas.as_mut() {
            Some(meter) => meter.consume(amount, reason),
            None => Ok(()),
        }
    }

    /// Charges the visits of any collection the last step triggered.
    fn pay_gc_visits(&mut self) -> Result<(), VMError> {
        let visits = self.alloc.take_gc_visits();
        if visits == 0 {
            return Ok(());
        }
        let cycles = visits.saturating_mul(self.visit_cpu_factor);
        self.cycles = self.cycles.saturating_add(cycles);
        self.consume_gas(cycles, GasCategory::GarbageCollection)
    }

    // ---- stack primitives ----

    fn pop_op(&mut self) -> Result<Op, VMError> {
        self.ops.pop().ok_or(VMError::StackUnderflow { stack: "op" })
    }

    pub(crate) fn push_value(&mut self, tv: TypedValue) {
        self.values.push(tv);
    }

    pub(crate) fn pop_value(&mut self) -> Result<TypedValue, VMError> {
        self.values
            .pop()
            .ok_or(VMError::StackUnderflow { stack: "value" })
    }

    /// Pops the top `n` values, deepest first.
    fn pop_values(&mut self, n: usize) -> Result<Vec<TypedValue>, VMError> {
        if self.values.len() < n {
            return Err(VMError::StackUnderflow { stack: "value" });
        }
        Ok(self.values.split_off(self.values.len() - n))
    }

    fn push_expr_eval(&mut self, expr: Rc<Expr>) {
        self.exprs.push(expr);
        self.ops.push(Op::Eval);
    }

    fn pop_expr(&mut self) -> Result<Rc<Expr>, VMError> {
        self.exprs
            .pop()
            .ok_or(VMError::StackUnderflow { stack: "expr" })
    }

    fn pop_stmt(&mut self) -> Result<StmtEntry, VMError> {
        self.stmts
            .pop()
            .ok_or(VMError::StackUnderflow { stack: "stmt" })
    }

    fn push_stmt_exec(&mut self, stmt: Rc<Stmt>) {
        self.stmts.push(StmtEntry::Stmt(stmt));
        self.ops.push(Op::Exec);
    }

    /// Schedules `stmts` to run in order, driven by the sticky `Body` op.
    fn push_body(&mut self, stmts: Rc<Vec<Rc<Stmt>>>) {
        self.stmts.push(StmtEntry::Body { stmts, next: 0 });
        self.ops.push(Op::Body);
    }

    pub(crate) fn last_block(&self) -> Result<Rc<Block>, VMError> {
        self.roots
            .blocks
            .borrow()
            .last()
            .cloned()
            .ok_or(VMError::StackUnderflow { stack: "block" })
    }

    fn push_block(&mut self, block: Rc<Block>) {
        self.roots.blocks.borrow_mut().push(block);
    }

    /// Pops blocks down to `len`, releasing the heap pointers they held.
    fn truncate_blocks(&mut self, len: usize) {
        let popped = {
            let mut blocks = self.roots.blocks.borrow_mut();
            if blocks.len() <= len {
                return;
            }
            blocks.split_off(len)
        };
        for block in popped.iter().rev() {
            self.release_block_pointers(block);
        }
    }

    /// Drops the holds of a popped block's own slots. Escaped slots keep
    /// their contents, which may outlive the block.
    fn release_block_pointers(&mut self, block: &Block) {
        let held: Vec<TypedValue> = block
            .values()
            .iter()
            .filter(|tv| !matches!(tv.v, Value::HeapItem(_)))
            .cloned()
            .collect();
        for tv in &held {
            self.release_held(tv);
        }
    }

    /// Block `depth` levels up the lexical chain (1 = innermost). Persisted
    /// parents are loaded from the store, charged, and cached.
    fn block_at(&mut self, depth: u8) -> Result<Rc<Block>, VMError> {
        let mut block = self.last_block()?;
        for _ in 1..depth {
            block = match block.parent() {
                BlockParent::Block(parent) => parent,
                BlockParent::Stored(id) => {
                    let stored = self
                        .store
                        .as_ref()
                        .and_then(|s| s.get_block(id))
                        .ok_or(VMError::MissingBlock(id.0))?;
                    self.alloc.new_amino(stored.encoded_len)?;
                    block.set_parent(BlockParent::Block(stored.block.clone()));
                    stored.block
                }
                BlockParent::None => {
                    return Err(VMError::InvalidPath { depth, index: 0 });
                }
            };
        }
        Ok(block)
    }

    fn get_path(&mut self, path: ValuePath) -> Result<TypedValue, VMError> {
        self.block_at(path.depth)?
            .get(path.index as usize)
            .ok_or(VMError::InvalidPath {
                depth: path.depth,
                index: path.index,
            })
    }

    fn pointer_to_path(&mut self, path: ValuePath) -> Result<PointerValue, VMError> {
        let block = self.block_at(path.depth)?;
        if path.index as usize >= block.len() {
            return Err(VMError::InvalidPath {
                depth: path.depth,
                index: path.index,
            });
        }
        Ok(block.pointer_to(path.index as usize))
    }

    // ---- frames ----

    fn push_frame(&mut self, mut frame: Frame) {
        frame.num_ops = self.ops.len();
        frame.num_exprs = self.exprs.len();
        frame.num_stmts = self.stmts.len();
        frame.num_blocks = self.roots.blocks.borrow().len();
        self.roots.frames.borrow_mut().push(frame);
    }

    fn last_frame(&self) -> Result<Frame, VMError> {
        self.roots
            .frames
            .borrow()
            .last()
            .cloned()
            .ok_or(VMError::StackUnderflow { stack: "frame" })
    }

    fn last_call_frame_index(&self) -> Option<usize> {
        self.roots.frames.borrow().iter().rposition(Frame::is_call)
    }

    /// Base of the value stack for the innermost frame.
    fn value_base(&self) -> usize {
        self.roots
            .frames
            .borrow()
            .last()
            .map_or(0, |f| f.num_values)
    }

    /// Truncates every stack back to where `frame` began and pops it. Call
    /// frames also restore the caller's package and realm.
    fn pop_frame(&mut self) -> Result<Frame, VMError> {
        let frame = self
            .roots
            .frames
            .borrow_mut()
            .pop()
            .ok_or(VMError::StackUnderflow { stack: "frame" })?;
        self.ops.truncate(frame.num_ops);
        self.values.truncate(frame.num_values);
        self.exprs.truncate(frame.num_exprs);
        self.stmts.truncate(frame.num_stmts);
        self.truncate_blocks(frame.num_blocks);
        if frame.is_call() {
            *self.roots.package.borrow_mut() = frame.last_package.clone();
            if frame.did_cross {
                self.realm = frame.last_realm.clone();
            }
        }
        Ok(frame)
    }

    /// Pops loop frames until a call frame is on top, then truncates every
    /// stack to that frame's start while keeping its function block. Returns
    /// `false` if there is no call frame.
    fn unwind_to_call_frame(&mut self) -> Result<bool, VMError> {
        let Some(index) = self.last_call_frame_index() else {
            return Ok(false);
        };
        let frame = {
            let mut frames = self.roots.frames.borrow_mut();
            frames.truncate(index + 1);
            frames[index].clone()
        };
        self.ops.truncate(frame.num_ops);
        self.values.truncate(frame.num_values);
        self.exprs.truncate(frame.num_exprs);
        self.stmts.truncate(frame.num_stmts);
        self.truncate_blocks(frame.num_blocks + 1);
        Ok(true)
    }

    // ---- helpers shared by the op handlers ----

    /// Raises a runtime error as a language panic carrying `msg`.
    fn raise(&mut self, msg: &str) -> Result<(), VMError> {
        let value = self.alloc.new_string(msg)?;
        self.values.push(value);
        self.ops.push(Op::Panic1);
        Ok(())
    }

    /// Copies aggregates so the stored value does not alias its source.
    fn copy_value(&mut self, tv: &TypedValue) -> Result<TypedValue, VMError> {
        tv.copy(&mut self.alloc)
    }

    /// Stores `tv` through `ptr`, charging new map entries and keeping the
    /// root tracker in step. A pointer stored inside a tracked heap item is
    /// that node's edge; anywhere else it holds its target, and the value it
    /// overwrites lets go.
    fn store_through(&mut self, ptr: &PointerValue, tv: TypedValue) -> Result<(), VMError> {
        let old = match &ptr.base {
            PointerBase::MapEntry { map, key } => {
                let key = MapKey::of(key)?;
                if !map.contains(&key) {
                    self.alloc.allocate_map_entries(1)?;
                }
                map.get(&key)
            }
            _ => Some(ptr.deref()?),
        };
        let owner = ptr.heap_item().and_then(|item| self.heap.find_by_item(item));
        match owner {
            Some(from) => {
                let to = match &tv.v {
                    Value::Pointer(target) => target
                        .heap_item()
                        .and_then(|item| self.heap.find_by_item(item)),
                    _ => None,
                };
                match to {
                    Some(to) => self.heap.link(from, to),
                    None => {
                        self.heap.unlink(from);
                        self.retain_held(&tv);
                    }
                }
            }
            None => {
                self.retain_held(&tv);
                if let Some(old) = &old {
                    self.release_held(old);
                }
            }
        }
        ptr.store(tv)
    }

    /// Writes slot `index` of a fresh call block.
    fn bind_slot(&mut self, block: &Rc<Block>, index: usize, tv: TypedValue) -> Result<(), VMError> {
        self.store_through(&block.pointer_to(index), tv)
    }

    /// Heap items `tv` holds directly: a pointer's base, a closure's
    /// captures, or those of a bound receiver.
    fn held_items(tv: &TypedValue) -> Vec<Rc<HeapItemValue>> {
        match &tv.v {
            Value::Pointer(ptr) => ptr.heap_item().cloned().into_iter().collect(),
            Value::Func(fv) => fv
                .captures
                .iter()
                .filter_map(|c| match &c.v {
                    Value::HeapItem(item) => Some(item.clone()),
                    _ => None,
                })
                .collect(),
            Value::BoundMethod(bm) => Self::held_items(&bm.receiver),
            _ => Vec::new(),
        }
    }

    fn held_nodes(&self, tv: &TypedValue) -> Vec<NodeId> {
        Self::held_items(tv)
            .iter()
            .filter_map(|item| self.heap.find_by_item(item))
            .collect()
    }

    /// Counts a stored `tv` as one more holder of its tracked heap items.
    fn retain_held(&mut self, tv: &TypedValue) {
        for id in self.held_nodes(tv) {
            self.heap.retain(id);
        }
    }

    fn release_held(&mut self, tv: &TypedValue) {
        for id in self.held_nodes(tv) {
            self.heap.release_pointer(id);
        }
    }

    /// Package and file blocks live as long as their package.
    fn is_package_block(&self, block: &Rc<Block>) -> bool {
        if let BlockParent::Block(parent) = block.parent() {
            if Rc::ptr_eq(&parent, &self.uverse.block) {
                return true;
            }
        }
        self.roots.package.borrow().as_ref().is_some_and(|pkg| {
            Rc::ptr_eq(block, &pkg.block) || pkg.file_blocks().iter().any(|fb| Rc::ptr_eq(block, fb))
        })
    }

    /// Starts tracking the heap item behind a new pointer. Items that no
    /// scoped block on the stack owns, like package variables, are pinned.
    fn track_escape(&mut self, item: &Rc<HeapItemValue>) {
        if self.heap.find_by_item(item).is_some() {
            return;
        }
        let size = self.alloc.costs().heap_item_size();
        let id = self.heap.track(item.clone(), size, self.alloc.collections());
        let scoped = self
            .roots
            .blocks
            .borrow()
            .iter()
            .filter(|b| !self.is_package_block(b))
            .any(|b| {
                b.values()
                    .iter()
                    .any(|tv| matches!(&tv.v, Value::HeapItem(i) if Rc::ptr_eq(i, item)))
            });
        if !scoped {
            self.heap.pin(id);
        }
    }

    /// Tracked nodes held by live state the tracker does not count: escaped
    /// slots of scoped blocks, operand values, frame receivers, deferred
    /// calls and exceptions in flight.
    fn scoped_heap_roots(&self) -> Vec<NodeId> {
        let mut ids = Vec::new();
        for block in self.roots.blocks.borrow().iter() {
            if self.is_package_block(block) {
                continue;
            }
            for tv in block.values().iter() {
                if let Value::HeapItem(item) = &tv.v {
                    ids.extend(self.heap.find_by_item(item));
                }
            }
        }
        for tv in &self.values {
            ids.extend(self.held_nodes(tv));
        }
        for frame in self.roots.frames.borrow().iter() {
            ids.extend(self.held_nodes(&frame.receiver));
            for defer in &frame.defers {
                ids.extend(self.held_nodes(&defer.func));
                for arg in &defer.args {
                    ids.extend(self.held_nodes(arg));
                }
            }
        }
        for exception in self.roots.exceptions.borrow().iter() {
            ids.extend(self.held_nodes(&exception.value));
        }
        ids
    }

    /// Names the tracker root of a pointer bound to the variable `name`.
    fn claim_root(&mut self, name: &str, tv: &TypedValue) {
        if let Value::Pointer(ptr) = &tv.v {
            if let Some(id) = ptr.heap_item().and_then(|item| self.heap.find_by_item(item)) {
                self.heap.claim(id, name);
            }
        }
    }

    /// Elements of an array or slice operand, with its element type.
    fn list_of(&self, tv: &TypedValue) -> Option<(Vec<TypedValue>, Type)> {
        let elem = tv.t.as_ref().and_then(Type::elem).cloned().unwrap_or(Type::Interface);
        match &tv.v {
            Value::Array(av) => Some((av.list().clone(), elem)),
            Value::Slice(sv) => Some((sv.to_vec(), elem)),
            _ => None,
        }
    }
}

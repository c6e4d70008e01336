//! Reachability-based recount of the allocator's total.
//!
//! A pass zeroes the ledger, bumps the cycle stamp and walks every root the
//! machine holds: active blocks, call frames (receivers, deferred calls and
//! the package they return to), the active and staging packages, and every
//! exception in flight. Each value reached is re-charged its shallow size.
//!
//! Shared values carry the stamp of the last pass that counted them, so a
//! value reached twice in one pass is charged once and reference cycles
//! terminate without a visited set. Builtin scopes, realms, persisted parents
//! that were never loaded, and type descriptors are not walked.

use crate::debug;
use crate::virtual_machine::alloc::{CollectReport, CollectStrategy, Ledger};
use crate::virtual_machine::machine::frame::LiveRoots;
use crate::virtual_machine::values::{
    Block, BlockParent, PackageValue, PointerBase, TypedValue, Value,
};
use std::rc::Rc;

/// The machine's collection strategy.
pub struct DeepCollector {
    roots: Rc<LiveRoots>,
    cycle: u64,
}

impl DeepCollector {
    pub fn new(roots: Rc<LiveRoots>) -> Self {
        Self { roots, cycle: 0 }
    }

    /// Stamp of the most recent pass.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

impl CollectStrategy for DeepCollector {
    fn collect(&mut self, ledger: &mut Ledger) -> CollectReport {
        let before = ledger.bytes();
        ledger.reset();
        self.cycle += 1;
        let mut pass = Pass {
            ledger,
            cycle: self.cycle,
            visits: 0,
        };
        let completed = pass.visit_roots(&self.roots);
        debug!(
            target: "gc",
            "cycle {}: {} -> {} bytes in {} visits{}",
            self.cycle,
            before,
            pass.ledger.bytes(),
            pass.visits,
            if completed { "" } else { " (aborted at ceiling)" }
        );
        CollectReport {
            completed,
            visits: pass.visits,
        }
    }
}

/// One walk. Every `visit_*` returns `false` once the ceiling is hit, and the
/// walk unwinds without visiting anything else.
struct Pass<'a> {
    ledger: &'a mut Ledger,
    cycle: u64,
    visits: u64,
}

impl Pass<'_> {
    fn visit_roots(&mut self, roots: &LiveRoots) -> bool {
        for block in roots.blocks.borrow().iter() {
            if !self.visit_block(block) {
                return false;
            }
        }
        for frame in roots.frames.borrow().iter() {
            if let Some(func) = &frame.func {
                if !self.visit(&Value::Func(func.clone())) {
                    return false;
                }
            }
            if !self.visit_value(&frame.receiver) {
                return false;
            }
            for defer in &frame.defers {
                if !self.visit_value(&defer.func) {
                    return false;
                }
                for arg in &defer.args {
                    if !self.visit_value(arg) {
                        return false;
                    }
                }
                if let Some(parent) = &defer.parent {
                    if !self.visit_block(parent) {
                        return false;
                    }
                }
            }
            if let Some(pkg) = &frame.last_package {
                if !self.visit_package(pkg) {
                    return false;
                }
            }
        }
        if let Some(pkg) = roots.package.borrow().as_ref() {
            if !self.visit_package(pkg) {
                return false;
            }
        }
        if let Some(pkg) = roots.staging.borrow().as_ref() {
            if !self.visit_package(pkg) {
                return false;
            }
        }
        for exception in roots.exceptions.borrow().iter() {
            if !self.visit_value(&exception.value) {
                return false;
            }
        }
        true
    }

    fn visit_block(&mut self, block: &Rc<Block>) -> bool {
        self.visit(&Value::Block(block.clone()))
    }

    fn visit_package(&mut self, pkg: &Rc<PackageValue>) -> bool {
        self.visit(&Value::Package(pkg.clone()))
    }

    fn visit_value(&mut self, tv: &TypedValue) -> bool {
        self.visit(&tv.v)
    }

    fn visit(&mut self, v: &Value) -> bool {
        self.visits += 1;
        match v {
            Value::Block(b) if b.is_bootstrap() => return true,
            Value::Package(p) if p.is_bootstrap() => return true,
            _ => {}
        }
        if let Some(info) = v.object_info() {
            if info.last_gc_cycle() == self.cycle {
                return true;
            }
            info.set_last_gc_cycle(self.cycle);
        }
        let size = self.ledger.costs().shallow_size(v);
        if !self.ledger.recount(size) {
            return false;
        }
        self.visit_associated(v)
    }

    /// Recurses into exactly what `v` owns.
    fn visit_associated(&mut self, v: &Value) -> bool {
        match v {
            Value::None | Value::String(_) | Value::BigInt(_) | Value::Type(_) => true,
            Value::Pointer(ptr) => match &ptr.base {
                PointerBase::Block(b) => self.visit_block(b),
                PointerBase::HeapItem(item) => self.visit(&Value::HeapItem(item.clone())),
                PointerBase::Array(av) => self.visit(&Value::Array(av.clone())),
                PointerBase::Struct(sv) => self.visit(&Value::Struct(sv.clone())),
                PointerBase::MapEntry { map, .. } => self.visit(&Value::Map(map.clone())),
            },
            Value::Array(av) => av.list().iter().all(|e| self.visit_value(e)),
            Value::Slice(sv) => self.visit(&Value::Array(sv.base.clone())),
            Value::Struct(sv) => sv.fields().iter().all(|f| self.visit_value(f)),
            Value::Func(fv) => {
                if !fv.captures.iter().all(|c| self.visit_value(c)) {
                    return false;
                }
                match &fv.parent {
                    Some(parent) => self.visit_block(parent),
                    None => true,
                }
            }
            Value::Map(mv) => mv
                .entries()
                .iter()
                .all(|(k, val)| self.visit_value(k) && self.visit_value(val)),
            Value::BoundMethod(bm) => {
                self.visit_value(&bm.receiver) && self.visit(&Value::Func(bm.func.clone()))
            }
            Value::Package(pv) => {
                if !self.visit_block(&pv.block) {
                    return false;
                }
                pv.file_blocks().iter().all(|b| self.visit_block(b))
            }
            Value::Block(b) => {
                if !b.values().iter().all(|slot| self.visit_value(slot)) {
                    return false;
                }
                match b.parent() {
                    BlockParent::Block(parent) => self.visit_block(&parent),
                    BlockParent::None | BlockParent::Stored(_) => true,
                }
            }
            Value::HeapItem(item) => {
                let inner = item.get();
                self.visit_value(&inner)
            }
        }
    }
}

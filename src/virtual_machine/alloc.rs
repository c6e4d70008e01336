//! Deterministic allocation accounting.
//!
//! The allocator never owns memory. It keeps a running byte total against a
//! ceiling, and every value the machine builds is charged a fixed, per-kind
//! cost from [`AllocCosts`] before it exists. The costs are a calibrated model
//! rather than a measured footprint, so every host charges the same amount.
//!
//! When a charge pushes the total over the ceiling the allocator runs the
//! [`CollectStrategy`] its owner supplied, which recomputes the total from the
//! reachable values. A charge that is still over after that pass raises a
//! one-shot near-fatal flag; the next over-ceiling charge that a collection
//! cannot rescue fails with [`VMError::AllocationLimitExceeded`].

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::nodes::BlockNode;
use crate::virtual_machine::profile::{AllocEvent, AllocObserver, StackProbe};
use crate::virtual_machine::types::{Name, Type};
use crate::virtual_machine::values::{
    ArrayValue, Block, BlockParent, BoundMethodValue, FuncValue, HeapItemValue, MapValue,
    PackageValue, PointerValue, Realm, SliceValue, StructValue, TypedValue, Value,
    default_value,
};
use crate::{debug, warn};
use num_bigint::BigInt;
use std::fmt;
use std::rc::Rc;

/// Per-kind byte costs charged by the construction helpers.
///
/// Object kinds (arrays, slices, structs, functions, maps, bound methods,
/// blocks, heap items, packages) also pay `base + pointer` on top of their
/// own cost.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocCosts {
    pub base: i64,
    pub pointer: i64,
    pub typed_value: i64,
    pub string: i64,
    pub string_byte: i64,
    pub bigint: i64,
    pub bigint_byte: i64,
    pub pointer_value: i64,
    pub array: i64,
    pub array_elem: i64,
    pub slice: i64,
    pub structure: i64,
    pub struct_field: i64,
    pub func: i64,
    pub map: i64,
    pub map_entry: i64,
    pub bound_method: i64,
    pub block: i64,
    pub block_slot: i64,
    pub heap_item: i64,
    pub type_value: i64,
    pub package: i64,
    pub amino: i64,
    pub amino_byte: i64,
}

impl Default for AllocCosts {
    fn default() -> Self {
        let typed_value = 40;
        Self {
            base: 24,
            pointer: 8,
            typed_value,
            string: 16,
            string_byte: 1,
            bigint: 8,
            bigint_byte: 1,
            pointer_value: typed_value,
            array: 200,
            array_elem: typed_value,
            slice: 40,
            structure: 160,
            struct_field: typed_value,
            func: 196,
            map: 144,
            // key, value and the list node
            map_entry: 3 * typed_value,
            bound_method: 176,
            block: 464,
            block_slot: typed_value,
            heap_item: typed_value,
            type_value: 200,
            package: 266,
            amino: 200,
            amino_byte: 10,
        }
    }
}

impl AllocCosts {
    #[inline]
    fn object(&self, own: i64) -> i64 {
        self.base + self.pointer + own
    }

    pub fn string_size(&self, len: usize) -> i64 {
        self.string + self.string_byte * len as i64
    }

    pub fn bigint_size(&self, b: &BigInt) -> i64 {
        self.bigint + self.bigint_byte * b.bits().div_ceil(8) as i64
    }

    pub fn array_size(&self, len: usize) -> i64 {
        self.object(self.array + self.array_elem * len as i64)
    }

    pub fn slice_size(&self) -> i64 {
        self.object(self.slice)
    }

    pub fn struct_size(&self, fields: usize) -> i64 {
        self.object(self.structure + self.struct_field * fields as i64)
    }

    pub fn func_size(&self) -> i64 {
        self.object(self.func)
    }

    pub fn map_size(&self, entries: usize) -> i64 {
        self.object(self.map + self.map_entry * entries as i64)
    }

    pub fn bound_method_size(&self) -> i64 {
        self.object(self.bound_method)
    }

    pub fn block_size(&self, slots: usize) -> i64 {
        self.object(self.block + self.block_slot * slots as i64)
    }

    pub fn heap_item_size(&self) -> i64 {
        self.object(self.heap_item)
    }

    pub fn package_size(&self) -> i64 {
        self.object(self.package)
    }

    pub fn amino_size(&self, len: usize) -> i64 {
        self.amino + self.amino_byte * len as i64
    }

    /// Shallow size of a payload: its own cost, excluding what it references.
    /// Types are shared and never charged to a value.
    pub fn shallow_size(&self, v: &Value) -> i64 {
        match v {
            Value::None => 0,
            Value::String(s) => self.string_size(s.len()),
            Value::BigInt(b) => self.bigint_size(b),
            Value::Pointer(_) => self.pointer_value,
            Value::Array(av) => self.array_size(av.len()),
            Value::Slice(_) => self.slice_size(),
            Value::Struct(sv) => self.struct_size(sv.fields().len()),
            Value::Func(_) => self.func_size(),
            Value::Map(mv) => self.map_size(mv.len()),
            Value::BoundMethod(_) => self.bound_method_size(),
            Value::Type(_) => self.type_value,
            Value::Package(_) => self.package_size(),
            Value::Block(b) => self.block_size(b.len()),
            Value::HeapItem(_) => self.heap_item_size(),
        }
    }
}

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// `false` when the pass stopped because the recount hit the ceiling.
    pub completed: bool,
    /// Values visited, paid for in gas by the machine.
    pub visits: u64,
}

/// The allocator's view handed to a collection pass.
#[derive(Debug)]
pub struct Ledger {
    bytes: i64,
    max: i64,
    costs: AllocCosts,
}

impl Ledger {
    /// Zeroes the running total before a recount.
    pub fn reset(&mut self) {
        self.bytes = 0;
    }

    /// Re-charges `size` bytes of a reachable value. Returns `false` without
    /// charging when that would cross the ceiling.
    pub fn recount(&mut self, size: i64) -> bool {
        if self.bytes + size > self.max {
            return false;
        }
        self.bytes += size;
        true
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn costs(&self) -> &AllocCosts {
        &self.costs
    }
}

/// Collection logic supplied by the allocator's owner.
pub trait CollectStrategy {
    fn collect(&mut self, ledger: &mut Ledger) -> CollectReport;
}

/// Snapshot of an allocator's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocStatus {
    pub bytes: i64,
    pub max_bytes: i64,
    pub collections: u64,
    pub near_fatal: bool,
}

impl fmt::Display for AllocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Allocator{{maxBytes:{}, bytes:{}}}",
            self.max_bytes, self.bytes
        )
    }
}

/// State of an allocator with a ceiling.
pub struct MeteredAllocator {
    ledger: Ledger,
    min_interval: i64,
    last_gc_bytes: i64,
    near_fatal: bool,
    collections: u64,
    unpaid_visits: u64,
    /// Total at the time this allocator was forked, if it was.
    fork_base: Option<i64>,
    collector: Option<Box<dyn CollectStrategy>>,
    observer: Option<Box<dyn AllocObserver>>,
    probe: Option<Rc<dyn StackProbe>>,
}

impl MeteredAllocator {
    fn over_ceiling(&self) -> bool {
        self.ledger.bytes > self.ledger.max
    }

    fn wants_proactive_collection(&self) -> bool {
        self.collector.is_some()
            && self.ledger.bytes >= 2 * self.last_gc_bytes
            && self.ledger.bytes >= self.min_interval
    }

    fn allocate(&mut self, size: i64) -> Result<(), VMError> {
        self.ledger.bytes += size;
        if !self.over_ceiling() && !self.wants_proactive_collection() {
            return Ok(());
        }
        let completed = self.collect(size);
        if completed && !self.over_ceiling() {
            self.near_fatal = false;
            return Ok(());
        }
        if self.near_fatal {
            return Err(VMError::AllocationLimitExceeded {
                allocated: self.ledger.bytes,
                limit: self.ledger.max,
            });
        }
        self.near_fatal = true;
        warn!(
            target: "alloc",
            "allocation ceiling reached: {} of {} bytes, next overrun is fatal",
            self.ledger.bytes,
            self.ledger.max
        );
        Ok(())
    }

    /// Runs the registered collector. On success the total becomes the
    /// reachable bytes plus the pending `size`.
    fn collect(&mut self, size: i64) -> bool {
        let Some(mut collector) = self.collector.take() else {
            return true;
        };
        let before = self.ledger.bytes;
        let report = collector.collect(&mut self.ledger);
        self.collector = Some(collector);
        self.collections += 1;
        self.unpaid_visits += report.visits;
        if report.completed {
            self.ledger.bytes += size;
            self.last_gc_bytes = self.ledger.bytes;
        } else {
            self.ledger.bytes = before;
        }
        debug!(
            target: "alloc",
            "collection {}: {} -> {} bytes, {} visits, completed={}",
            self.collections,
            before,
            self.ledger.bytes,
            report.visits,
            report.completed
        );
        report.completed
    }

    fn deallocate(&mut self, size: i64) -> Result<(), VMError> {
        if size > self.ledger.bytes {
            return Err(VMError::NegativeAllocation {
                bytes: self.ledger.bytes,
                released: size,
            });
        }
        self.ledger.bytes -= size;
        Ok(())
    }

    fn notify(&mut self, kind: &'static str, bytes: i64, objects: u64) {
        let Some(observer) = self.observer.as_mut() else {
            return;
        };
        let stack = match (&self.probe, observer.wants_stack()) {
            (Some(probe), true) => probe.stack(),
            _ => Vec::new(),
        };
        observer.on_alloc(&AllocEvent {
            bytes,
            objects,
            kind,
            stack,
        });
    }
}

/// Byte accounting for one machine; [`Allocator::Inert`] accepts every call
/// and does nothing.
#[derive(Default)]
pub enum Allocator {
    #[default]
    Inert,
    Metered(Box<MeteredAllocator>),
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Allocator::Inert => f.write_str("Allocator(inert)"),
            Allocator::Metered(m) => write!(
                f,
                "Allocator{{maxBytes:{}, bytes:{}}}",
                m.ledger.max, m.ledger.bytes
            ),
        }
    }
}

impl Allocator {
    /// An allocator with `max_bytes` ceiling; 0 yields an inert allocator.
    pub fn new(max_bytes: i64, min_interval: i64, costs: AllocCosts) -> Self {
        if max_bytes <= 0 {
            return Allocator::Inert;
        }
        Allocator::Metered(Box::new(MeteredAllocator {
            ledger: Ledger {
                bytes: 0,
                max: max_bytes,
                costs,
            },
            min_interval,
            last_gc_bytes: 0,
            near_fatal: false,
            collections: 0,
            unpaid_visits: 0,
            fork_base: None,
            collector: None,
            observer: None,
            probe: None,
        }))
    }

    pub fn inert() -> Self {
        Allocator::Inert
    }

    pub fn is_inert(&self) -> bool {
        matches!(self, Allocator::Inert)
    }

    /// Registers the collection strategy. Ignored on an inert allocator.
    pub fn set_collector(&mut self, collector: Box<dyn CollectStrategy>) {
        if let Allocator::Metered(m) = self {
            m.collector = Some(collector);
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn AllocObserver>) {
        if let Allocator::Metered(m) = self {
            m.observer = Some(observer);
        }
    }

    /// Detaches the observer, returning it to the caller.
    pub fn take_observer(&mut self) -> Option<Box<dyn AllocObserver>> {
        match self {
            Allocator::Metered(m) => m.observer.take(),
            Allocator::Inert => None,
        }
    }

    pub fn set_stack_probe(&mut self, probe: Rc<dyn StackProbe>) {
        if let Allocator::Metered(m) = self {
            m.probe = Some(probe);
        }
    }

    /// Charges `size` bytes.
    pub fn allocate(&mut self, size: i64) -> Result<(), VMError> {
        match self {
            Allocator::Inert => Ok(()),
            Allocator::Metered(m) => m.allocate(size),
        }
    }

    /// Releases `size` bytes. Releasing more than is charged is an accounting bug.
    pub fn deallocate(&mut self, size: i64) -> Result<(), VMError> {
        match self {
            Allocator::Inert => Ok(()),
            Allocator::Metered(m) => m.deallocate(size),
        }
    }

    /// Runs a collection pass outside of any charge.
    pub fn collect(&mut self) -> Result<(), VMError> {
        match self {
            Allocator::Inert => Ok(()),
            Allocator::Metered(m) => {
                if m.collect(0) && !m.over_ceiling() {
                    m.near_fatal = false;
                    Ok(())
                } else if m.near_fatal {
                    Err(VMError::AllocationLimitExceeded {
                        allocated: m.ledger.bytes,
                        limit: m.ledger.max,
                    })
                } else {
                    m.near_fatal = true;
                    Ok(())
                }
            }
        }
    }

    /// Independent allocator seeded with the current total and no collector.
    pub fn fork(&self) -> Allocator {
        match self {
            Allocator::Inert => Allocator::Inert,
            Allocator::Metered(m) => Allocator::Metered(Box::new(MeteredAllocator {
                ledger: Ledger {
                    bytes: m.ledger.bytes,
                    max: m.ledger.max,
                    costs: m.ledger.costs.clone(),
                },
                min_interval: m.min_interval,
                last_gc_bytes: m.last_gc_bytes,
                near_fatal: false,
                collections: 0,
                unpaid_visits: 0,
                fork_base: Some(m.ledger.bytes),
                collector: None,
                observer: None,
                probe: None,
            })),
        }
    }

    /// Applies a forked child's net change to this allocator.
    pub fn commit(&mut self, child: Allocator) -> Result<(), VMError> {
        let Allocator::Metered(c) = child else {
            return Ok(());
        };
        let delta = c.ledger.bytes - c.fork_base.unwrap_or(0);
        if delta >= 0 {
            self.allocate(delta)
        } else {
            self.deallocate(-delta)
        }
    }

    /// Zeroes every counter for a new top-level execution. The collector,
    /// observer and probe stay registered.
    pub fn reset(&mut self) {
        if let Allocator::Metered(m) = self {
            m.ledger.bytes = 0;
            m.last_gc_bytes = 0;
            m.near_fatal = false;
            m.collections = 0;
            m.unpaid_visits = 0;
        }
    }

    pub fn bytes(&self) -> i64 {
        match self {
            Allocator::Inert => 0,
            Allocator::Metered(m) => m.ledger.bytes,
        }
    }

    pub fn max_bytes(&self) -> i64 {
        match self {
            Allocator::Inert => 0,
            Allocator::Metered(m) => m.ledger.max,
        }
    }

    /// Number of collection passes run since the last reset.
    pub fn collections(&self) -> u64 {
        match self {
            Allocator::Inert => 0,
            Allocator::Metered(m) => m.collections,
        }
    }

    pub fn status(&self) -> AllocStatus {
        match self {
            Allocator::Inert => AllocStatus {
                bytes: 0,
                max_bytes: 0,
                collections: 0,
                near_fatal: false,
            },
            Allocator::Metered(m) => AllocStatus {
                bytes: m.ledger.bytes,
                max_bytes: m.ledger.max,
                collections: m.collections,
                near_fatal: m.near_fatal,
            },
        }
    }

    /// Collection visits not yet converted into gas.
    pub fn take_gc_visits(&mut self) -> u64 {
        match self {
            Allocator::Inert => 0,
            Allocator::Metered(m) => std::mem::take(&mut m.unpaid_visits),
        }
    }

    /// The cost table; inert allocators report the defaults.
    pub fn costs(&self) -> AllocCosts {
        match self {
            Allocator::Inert => AllocCosts::default(),
            Allocator::Metered(m) => m.ledger.costs.clone(),
        }
    }

    /// Charges `size` and reports it to the observer.
    fn charge(&mut self, kind: &'static str, size: i64, objects: u64) -> Result<(), VMError> {
        let Allocator::Metered(m) = self else {
            return Ok(());
        };
        m.allocate(size)?;
        m.notify(kind, size, objects);
        Ok(())
    }

    fn cost<F: FnOnce(&AllocCosts) -> i64>(&self, f: F) -> i64 {
        match self {
            Allocator::Inert => 0,
            Allocator::Metered(m) => f(&m.ledger.costs),
        }
    }

    // ---- construction helpers: charge first, then build ----

    pub fn new_string(&mut self, s: impl AsRef<[u8]>) -> Result<TypedValue, VMError> {
        let bytes = s.as_ref();
        let size = self.cost(|c| c.string_size(bytes.len()));
        self.charge("string", size, 0)?;
        Ok(TypedValue::byte_string(bytes))
    }

    pub fn new_bigint(&mut self, b: BigInt) -> Result<TypedValue, VMError> {
        let size = self.cost(|c| c.bigint_size(&b));
        self.charge("bigint", size, 0)?;
        Ok(TypedValue::bigint(b))
    }

    pub fn new_array(
        &mut self,
        t: Option<Type>,
        list: Vec<TypedValue>,
    ) -> Result<TypedValue, VMError> {
        let size = self.cost(|c| c.array_size(list.len()));
        self.charge("array", size, 1)?;
        Ok(TypedValue {
            t,
            v: Value::Array(Rc::new(ArrayValue::new(list))),
            n: [0; 8],
        })
    }

    pub fn new_slice(
        &mut self,
        t: Option<Type>,
        base: Rc<ArrayValue>,
        offset: usize,
        len: usize,
        cap: usize,
    ) -> Result<TypedValue, VMError> {
        let size = self.cost(AllocCosts::slice_size);
        self.charge("slice", size, 1)?;
        Ok(TypedValue {
            t,
            v: Value::Slice(Rc::new(SliceValue::new(base, offset, len, cap))),
            n: [0; 8],
        })
    }

    pub fn new_struct(
        &mut self,
        t: Option<Type>,
        fields: Vec<TypedValue>,
    ) -> Result<TypedValue, VMError> {
        let size = self.cost(|c| c.struct_size(fields.len()));
        self.charge("struct", size, 1)?;
        Ok(TypedValue {
            t,
            v: Value::Struct(Rc::new(StructValue::new(fields))),
            n: [0; 8],
        })
    }

    /// Empty map. Entries are charged as they are inserted.
    pub fn new_map(&mut self, t: Option<Type>) -> Result<TypedValue, VMError> {
        let size = self.cost(|c| c.map_size(0));
        self.charge("map", size, 1)?;
        Ok(TypedValue {
            t,
            v: Value::Map(Rc::new(MapValue::new())),
            n: [0; 8],
        })
    }

    /// Charges `count` new map entries.
    pub fn allocate_map_entries(&mut self, count: usize) -> Result<(), VMError> {
        let size = self.cost(|c| c.map_entry * count as i64);
        self.charge("map entry", size, 0)
    }

    pub fn new_func(&mut self, func: FuncValue) -> Result<TypedValue, VMError> {
        let size = self.cost(AllocCosts::func_size);
        self.charge("func", size, 1)?;
        Ok(TypedValue {
            t: Some(Type::Func(func.ty.clone())),
            v: Value::Func(Rc::new(func)),
            n: [0; 8],
        })
    }

    pub fn new_bound_method(
        &mut self,
        func: Rc<FuncValue>,
        receiver: TypedValue,
    ) -> Result<TypedValue, VMError> {
        let size = self.cost(AllocCosts::bound_method_size);
        self.charge("bound method", size, 1)?;
        Ok(TypedValue {
            t: Some(Type::Func(func.ty.clone())),
            v: Value::BoundMethod(Rc::new(BoundMethodValue::new(func, receiver))),
            n: [0; 8],
        })
    }

    /// Block for `source`, its slots set to their zero values. Heap slots
    /// are boxed in fresh heap items.
    pub fn new_block(
        &mut self,
        source: Rc<BlockNode>,
        parent: BlockParent,
    ) -> Result<Rc<Block>, VMError> {
        let size = self.cost(|c| c.block_size(source.len()));
        self.charge("block", size, 1)?;
        let mut values = Vec::with_capacity(source.len());
        for slot in &source.slots {
            let zero = default_value(self, &slot.ty)?;
            if slot.heap {
                let item = self.new_heap_item(zero)?;
                values.push(TypedValue {
                    t: Some(Type::HeapItem),
                    v: Value::HeapItem(item),
                    n: [0; 8],
                });
            } else {
                values.push(zero);
            }
        }
        Ok(Rc::new(Block::new(source, values, parent)))
    }

    pub fn new_pointer(&mut self, t: Type, ptr: PointerValue) -> Result<TypedValue, VMError> {
        let size = self.cost(|c| c.pointer_value);
        self.charge("pointer", size, 0)?;
        Ok(TypedValue {
            t: Some(t),
            v: Value::Pointer(ptr),
            n: [0; 8],
        })
    }

    pub fn new_heap_item(&mut self, value: TypedValue) -> Result<Rc<HeapItemValue>, VMError> {
        let size = self.cost(AllocCosts::heap_item_size);
        self.charge("heap item", size, 1)?;
        Ok(Rc::new(HeapItemValue::new(value)))
    }

    pub fn new_type(&mut self, t: Type) -> Result<TypedValue, VMError> {
        let size = self.cost(|c| c.type_value);
        self.charge("type", size, 0)?;
        Ok(TypedValue {
            t: Some(Type::TypeType),
            v: Value::Type(t),
            n: [0; 8],
        })
    }

    pub fn new_package(
        &mut self,
        name: Name,
        path: Name,
        block: Rc<Block>,
        realm: Option<Rc<Realm>>,
    ) -> Result<Rc<PackageValue>, VMError> {
        let size = self.cost(AllocCosts::package_size);
        self.charge("package", size, 1)?;
        Ok(Rc::new(PackageValue::new(name, path, block, realm, false)))
    }

    /// Charges a wire-encoded blob read from the store.
    pub fn new_amino(&mut self, encoded_len: usize) -> Result<(), VMError> {
        let size = self.cost(|c| c.amino_size(encoded_len));
        self.charge("amino", size, 0)
    }
}

//! Runtime values.
//!
//! Every slot, stack entry and container element holds a [`TypedValue`]: a
//! type tag, a payload, and eight inline bytes for scalars. Payloads that can
//! be shared (arrays, structs, closures, blocks, ...) are reference counted
//! objects carrying an [`ObjectInfo`] with the stamp of the last collection
//! pass that counted them.

use crate::virtual_machine::alloc::Allocator;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::machine::Machine;
use crate::virtual_machine::nodes::{BlockNode, FuncDecl};
use crate::virtual_machine::store::ObjectId;
use crate::virtual_machine::types::{FuncType, Kind, Name, Type};
use num_bigint::BigInt;
use std::borrow::Cow;
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Bookkeeping shared by every object kind.
#[derive(Debug, Default)]
pub struct ObjectInfo {
    last_gc_cycle: Cell<u64>,
}

impl ObjectInfo {
    /// Cycle stamp of the last deep collection that counted this object.
    pub fn last_gc_cycle(&self) -> u64 {
        self.last_gc_cycle.get()
    }

    pub(crate) fn set_last_gc_cycle(&self, cycle: u64) {
        self.last_gc_cycle.set(cycle);
    }
}

/// The (type, payload, inline bytes) triple.
#[derive(Clone, Debug, Default)]
pub struct TypedValue {
    pub t: Option<Type>,
    pub v: Value,
    pub n: [u8; 8],
}

impl TypedValue {
    /// Untyped nil.
    pub fn nil() -> Self {
        Self::default()
    }

    /// Nil of a pointer, slice, map, func or interface type.
    pub fn typed_nil(t: Type) -> Self {
        Self {
            t: Some(t),
            ..Self::default()
        }
    }

    pub fn int(v: i64) -> Self {
        Self {
            t: Some(Type::Int),
            v: Value::None,
            n: v.to_le_bytes(),
        }
    }

    pub fn uint8(v: u8) -> Self {
        let mut n = [0u8; 8];
        n[0] = v;
        Self {
            t: Some(Type::Uint8),
            v: Value::None,
            n,
        }
    }

    pub fn boolean(v: bool) -> Self {
        let mut n = [0u8; 8];
        n[0] = v as u8;
        Self {
            t: Some(Type::Bool),
            v: Value::None,
            n,
        }
    }

    /// String constant. Strings built at run time go through the allocator.
    pub fn string(s: &str) -> Self {
        Self::byte_string(s.as_bytes())
    }

    /// String holding raw bytes, which need not be valid UTF-8.
    pub fn byte_string(b: &[u8]) -> Self {
        Self {
            t: Some(Type::String),
            v: Value::String(b.into()),
            n: [0; 8],
        }
    }

    /// Big integer constant.
    pub fn bigint(b: BigInt) -> Self {
        Self {
            t: Some(Type::BigInt),
            v: Value::BigInt(Rc::new(b)),
            n: [0; 8],
        }
    }

    pub fn kind(&self) -> Option<Kind> {
        self.t.as_ref().map(Type::kind)
    }

    pub fn type_name(&self) -> String {
        match &self.t {
            Some(t) => t.to_string(),
            None => "nil".to_string(),
        }
    }

    /// Whether the value is a nil reference (or untyped nil).
    pub fn is_nil(&self) -> bool {
        match self.kind() {
            None => true,
            Some(Kind::Pointer | Kind::Slice | Kind::Map | Kind::Func | Kind::Interface) => {
                matches!(self.v, Value::None)
            }
            Some(_) => false,
        }
    }

    pub fn get_int(&self) -> i64 {
        i64::from_le_bytes(self.n)
    }

    pub fn set_int(&mut self, v: i64) {
        self.n = v.to_le_bytes();
    }

    pub fn get_uint8(&self) -> u8 {
        self.n[0]
    }

    pub fn get_bool(&self) -> bool {
        self.n[0] != 0
    }

    /// String bytes; the zero string has no payload.
    pub fn get_bytes(&self) -> &[u8] {
        match &self.v {
            Value::String(s) => s,
            _ => &[],
        }
    }

    /// String payload for display. Invalid UTF-8 is replaced.
    pub fn get_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.get_bytes())
    }

    pub fn get_bigint(&self) -> BigInt {
        match &self.v {
            Value::BigInt(b) => b.as_ref().clone(),
            _ => BigInt::default(),
        }
    }

    /// Fails with [`VMError::TypeMismatch`] unless the value has kind `kind`.
    pub fn expect_kind(&self, op: &'static str, kind: Kind) -> Result<(), VMError> {
        if self.kind() == Some(kind) {
            Ok(())
        } else {
            Err(VMError::TypeMismatch {
                op,
                expected: kind.as_str(),
                actual: self.type_name(),
            })
        }
    }

    pub fn expect_int(&self, op: &'static str) -> Result<i64, VMError> {
        self.expect_kind(op, Kind::Int)?;
        Ok(self.get_int())
    }

    pub fn expect_bool(&self, op: &'static str) -> Result<bool, VMError> {
        self.expect_kind(op, Kind::Bool)?;
        Ok(self.get_bool())
    }

    /// Copies arrays and structs element by element, charging the copy.
    /// Every other kind is shared.
    pub fn copy(&self, alloc: &mut Allocator) -> Result<TypedValue, VMError> {
        match &self.v {
            Value::Array(av) => {
                let elems: Vec<TypedValue> = av.list().clone();
                let mut copied = Vec::with_capacity(elems.len());
                for elem in &elems {
                    copied.push(elem.copy(alloc)?);
                }
                alloc.new_array(self.t.clone(), copied)
            }
            Value::Struct(sv) => {
                let fields: Vec<TypedValue> = sv.fields().clone();
                let mut copied = Vec::with_capacity(fields.len());
                for field in &fields {
                    copied.push(field.copy(alloc)?);
                }
                alloc.new_struct(self.t.clone(), copied)
            }
            _ => Ok(self.clone()),
        }
    }

    /// Language equality. Only comparable kinds are accepted.
    pub fn equals(&self, other: &TypedValue) -> Result<bool, VMError> {
        if self.is_nil() || other.is_nil() {
            return Ok(self.is_nil() && other.is_nil());
        }
        match (&self.v, &other.v) {
            (Value::None, Value::None) => Ok(self.n == other.n),
            (Value::String(a), Value::String(b)) => Ok(a == b),
            (Value::String(s), Value::None) | (Value::None, Value::String(s)) => Ok(s.is_empty()),
            (Value::BigInt(a), Value::BigInt(b)) => Ok(a == b),
            (Value::Pointer(a), Value::Pointer(b)) => Ok(a.same_target(b)),
            (Value::Struct(a), Value::Struct(b)) => {
                let (fa, fb) = (a.fields().clone(), b.fields().clone());
                elementwise_equal(&fa, &fb)
            }
            (Value::Array(a), Value::Array(b)) => {
                let (la, lb) = (a.list().clone(), b.list().clone());
                elementwise_equal(&la, &lb)
            }
            (Value::Type(a), Value::Type(b)) => Ok(a == b),
            _ => Err(VMError::TypeMismatch {
                op: "eql",
                expected: "comparable operands",
                actual: format!("{} and {}", self.type_name(), other.type_name()),
            }),
        }
    }
}

fn elementwise_equal(a: &[TypedValue], b: &[TypedValue]) -> Result<bool, VMError> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b) {
        if !x.equals(y)? {
            return Ok(false);
        }
    }
    Ok(true)
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(t) = &self.t else {
            return f.write_str("nil");
        };
        match (&self.v, t.kind()) {
            (Value::None, Kind::Bool) => write!(f, "{}", self.get_bool()),
            (Value::None, Kind::Int) => write!(f, "{}", self.get_int()),
            (Value::None, Kind::Uint8) => write!(f, "{}", self.get_uint8()),
            (Value::None, Kind::String) => Ok(()),
            (Value::None, Kind::BigInt) => f.write_str("0"),
            (Value::None, _) => f.write_str("nil"),
            (Value::String(s), _) => f.write_str(&String::from_utf8_lossy(s)),
            (Value::BigInt(b), _) => write!(f, "{}", b),
            (Value::Array(av), _) => write_list(f, &av.list()),
            (Value::Slice(sv), _) => write_list(f, &sv.to_vec()),
            (Value::Struct(sv), _) => {
                f.write_str("{")?;
                for (i, field) in sv.fields().iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", field)?;
                }
                f.write_str("}")
            }
            (Value::Map(mv), _) => {
                f.write_str("map[")?;
                for (i, (k, v)) in mv.entries().iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}:{}", k, v)?;
                }
                f.write_str("]")
            }
            (Value::Pointer(_), _) => write!(f, "({})", t),
            (Value::Func(fv), _) => write!(f, "func {}", fv.name),
            (Value::BoundMethod(bm), _) => write!(f, "method {}", bm.func.name),
            (Value::Type(ty), _) => write!(f, "{}", ty),
            (Value::Package(pv), _) => write!(f, "package({} {})", pv.name, pv.path),
            (Value::Block(_), _) => f.write_str("block"),
            (Value::HeapItem(item), _) => write!(f, "{}", item.get()),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, list: &[TypedValue]) -> fmt::Result {
    f.write_str("[")?;
    for (i, elem) in list.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{}", elem)?;
    }
    f.write_str("]")
}

/// Payload of a [`TypedValue`]. Scalars use [`Value::None`] and the inline bytes.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    String(Rc<[u8]>),
    BigInt(Rc<BigInt>),
    Pointer(PointerValue),
    Array(Rc<ArrayValue>),
    Slice(Rc<SliceValue>),
    Struct(Rc<StructValue>),
    Func(Rc<FuncValue>),
    Map(Rc<MapValue>),
    BoundMethod(Rc<BoundMethodValue>),
    Type(Type),
    Package(Rc<PackageValue>),
    Block(Rc<Block>),
    HeapItem(Rc<HeapItemValue>),
}

impl Value {
    /// Object header of shareable kinds; `None` for leaves and pointers.
    pub fn object_info(&self) -> Option<&ObjectInfo> {
        match self {
            Value::Array(v) => Some(&v.info),
            Value::Slice(v) => Some(&v.info),
            Value::Struct(v) => Some(&v.info),
            Value::Func(v) => Some(&v.info),
            Value::Map(v) => Some(&v.info),
            Value::BoundMethod(v) => Some(&v.info),
            Value::Package(v) => Some(&v.info),
            Value::Block(v) => Some(&v.info),
            Value::HeapItem(v) => Some(&v.info),
            Value::None
            | Value::String(_)
            | Value::BigInt(_)
            | Value::Pointer(_)
            | Value::Type(_) => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::String(s) => write!(f, "String({:?})", String::from_utf8_lossy(s)),
            Value::BigInt(b) => write!(f, "BigInt({})", b),
            Value::Pointer(p) => write!(f, "Pointer({:?}, {})", p.base.label(), p.index),
            Value::Array(v) => write!(f, "Array(len={})", v.len()),
            Value::Slice(v) => write!(f, "Slice(len={}, cap={})", v.len, v.cap),
            Value::Struct(v) => write!(f, "Struct(fields={})", v.fields().len()),
            Value::Func(v) => write!(f, "Func({})", v.name),
            Value::Map(v) => write!(f, "Map(len={})", v.len()),
            Value::BoundMethod(v) => write!(f, "BoundMethod({})", v.func.name),
            Value::Type(t) => write!(f, "Type({})", t),
            Value::Package(v) => write!(f, "Package({})", v.path),
            Value::Block(v) => write!(f, "Block(len={})", v.len()),
            Value::HeapItem(_) => f.write_str("HeapItem"),
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block(len={}, bootstrap={})", self.len(), self.bootstrap)
    }
}

impl fmt::Debug for FuncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Func({})", self.qualified_name())
    }
}

impl fmt::Debug for PackageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Package({})", self.path)
    }
}

impl fmt::Debug for HeapItemValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapItem({})", self.value().type_name())
    }
}

/// Fixed-length array.
pub struct ArrayValue {
    pub(crate) info: ObjectInfo,
    list: RefCell<Vec<TypedValue>>,
}

impl ArrayValue {
    pub(crate) fn new(list: Vec<TypedValue>) -> Self {
        Self {
            info: ObjectInfo::default(),
            list: RefCell::new(list),
        }
    }

    pub fn len(&self) -> usize {
        self.list.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<TypedValue> {
        self.list.borrow().get(index).cloned()
    }

    pub(crate) fn set(&self, index: usize, tv: TypedValue) -> bool {
        match self.list.borrow_mut().get_mut(index) {
            Some(slot) => {
                *slot = tv;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Ref<'_, Vec<TypedValue>> {
        self.list.borrow()
    }
}

/// A window onto a backing array.
pub struct SliceValue {
    pub(crate) info: ObjectInfo,
    pub base: Rc<ArrayValue>,
    pub offset: usize,
    pub len: usize,
    pub cap: usize,
}

impl SliceValue {
    pub(crate) fn new(base: Rc<ArrayValue>, offset: usize, len: usize, cap: usize) -> Self {
        Self {
            info: ObjectInfo::default(),
            base,
            offset,
            len,
            cap,
        }
    }

    pub fn get(&self, index: usize) -> Option<TypedValue> {
        if index >= self.len {
            return None;
        }
        self.base.get(self.offset + index)
    }

    pub fn to_vec(&self) -> Vec<TypedValue> {
        self.base.list()[self.offset..self.offset + self.len].to_vec()
    }
}

pub struct StructValue {
    pub(crate) info: ObjectInfo,
    fields: RefCell<Vec<TypedValue>>,
}

impl StructValue {
    pub(crate) fn new(fields: Vec<TypedValue>) -> Self {
        Self {
            info: ObjectInfo::default(),
            fields: RefCell::new(fields),
        }
    }

    pub fn get(&self, index: usize) -> Option<TypedValue> {
        self.fields.borrow().get(index).cloned()
    }

    pub(crate) fn set(&self, index: usize, tv: TypedValue) -> bool {
        match self.fields.borrow_mut().get_mut(index) {
            Some(slot) => {
                *slot = tv;
                true
            }
            None => false,
        }
    }

    pub fn fields(&self) -> Ref<'_, Vec<TypedValue>> {
        self.fields.borrow()
    }
}

/// Host implementation of a builtin. Receives the evaluated arguments and
/// returns the results to push.
pub type NativeFn = fn(&mut Machine, Vec<TypedValue>) -> Result<Vec<TypedValue>, VMError>;

#[derive(Clone)]
pub enum FuncBody {
    Source(Rc<FuncDecl>),
    Native(NativeFn),
}

/// A function or closure.
pub struct FuncValue {
    pub(crate) info: ObjectInfo,
    pub name: Name,
    pub pkg_path: Name,
    pub ty: Rc<FuncType>,
    pub body: FuncBody,
    /// Heap items shared with the enclosing scope, copied into the trailing
    /// slots of every call block.
    pub captures: Vec<TypedValue>,
    /// Lexical parent of the function's blocks.
    pub parent: Option<Rc<Block>>,
    /// Package that becomes active while the function runs.
    pub package: Weak<PackageValue>,
}

impl FuncValue {
    pub(crate) fn new(
        name: Name,
        pkg_path: Name,
        ty: Rc<FuncType>,
        body: FuncBody,
        captures: Vec<TypedValue>,
        parent: Option<Rc<Block>>,
        package: Weak<PackageValue>,
    ) -> Self {
        Self {
            info: ObjectInfo::default(),
            name,
            pkg_path,
            ty,
            body,
            captures,
            parent,
            package,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, FuncBody::Native(_))
    }

    /// `pkg.name` as shown in stack traces.
    pub fn qualified_name(&self) -> String {
        if self.pkg_path.is_empty() {
            self.name.to_string()
        } else {
            format!("{}.{}", self.pkg_path, self.name)
        }
    }
}

/// Hashable projection of a comparable key.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum MapKey {
    Nil,
    Bool(bool),
    Int(i64),
    Uint8(u8),
    String(Rc<[u8]>),
    BigInt(BigInt),
}

impl MapKey {
    pub fn of(tv: &TypedValue) -> Result<MapKey, VMError> {
        match tv.kind() {
            None => Ok(MapKey::Nil),
            Some(Kind::Bool) => Ok(MapKey::Bool(tv.get_bool())),
            Some(Kind::Int) => Ok(MapKey::Int(tv.get_int())),
            Some(Kind::Uint8) => Ok(MapKey::Uint8(tv.get_uint8())),
            Some(Kind::String) => Ok(MapKey::String(tv.get_bytes().into())),
            Some(Kind::BigInt) => Ok(MapKey::BigInt(tv.get_bigint())),
            Some(_) => Err(VMError::TypeMismatch {
                op: "map key",
                expected: "comparable scalar",
                actual: tv.type_name(),
            }),
        }
    }
}

#[derive(Default)]
pub(crate) struct MapEntries {
    list: Vec<(TypedValue, TypedValue)>,
    index: HashMap<MapKey, usize>,
}

/// Insertion-ordered map.
pub struct MapValue {
    pub(crate) info: ObjectInfo,
    entries: RefCell<MapEntries>,
}

impl MapValue {
    pub(crate) fn new() -> Self {
        Self {
            info: ObjectInfo::default(),
            entries: RefCell::new(MapEntries::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &MapKey) -> bool {
        self.entries.borrow().index.contains_key(key)
    }

    pub fn get(&self, key: &MapKey) -> Option<TypedValue> {
        let entries = self.entries.borrow();
        entries
            .index
            .get(key)
            .map(|&i| entries.list[i].1.clone())
    }

    /// Inserts or overwrites; returns whether a new entry was created.
    pub(crate) fn set(&self, key: MapKey, k: TypedValue, v: TypedValue) -> bool {
        let mut entries = self.entries.borrow_mut();
        if let Some(&i) = entries.index.get(&key) {
            entries.list[i].1 = v;
            return false;
        }
        let i = entries.list.len();
        entries.list.push((k, v));
        entries.index.insert(key, i);
        true
    }

    /// Removes an entry, keeping the remaining ones in insertion order.
    pub(crate) fn delete(&self, key: &MapKey) -> bool {
        let mut entries = self.entries.borrow_mut();
        let Some(i) = entries.index.remove(key) else {
            return false;
        };
        entries.list.remove(i);
        for slot in entries.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        true
    }

    /// Key/value pairs in insertion order.
    pub fn entries(&self) -> Ref<'_, Vec<(TypedValue, TypedValue)>> {
        Ref::map(self.entries.borrow(), |e| &e.list)
    }
}

pub struct BoundMethodValue {
    pub(crate) info: ObjectInfo,
    pub func: Rc<FuncValue>,
    pub receiver: TypedValue,
}

impl BoundMethodValue {
    pub(crate) fn new(func: Rc<FuncValue>, receiver: TypedValue) -> Self {
        Self {
            info: ObjectInfo::default(),
            func,
            receiver,
        }
    }
}

/// Persistence boundary a package belongs to. Never owned by the package's
/// memory, so collection does not follow it.
#[derive(Debug)]
pub struct Realm {
    pub path: Name,
    pub id: u64,
}

pub struct PackageValue {
    pub(crate) info: ObjectInfo,
    pub name: Name,
    pub path: Name,
    pub block: Rc<Block>,
    file_blocks: RefCell<Vec<Rc<Block>>>,
    pub realm: Option<Rc<Realm>>,
    bootstrap: bool,
}

impl PackageValue {
    pub(crate) fn new(
        name: Name,
        path: Name,
        block: Rc<Block>,
        realm: Option<Rc<Realm>>,
        bootstrap: bool,
    ) -> Self {
        Self {
            info: ObjectInfo::default(),
            name,
            path,
            block,
            file_blocks: RefCell::new(Vec::new()),
            realm,
            bootstrap,
        }
    }

    /// The builtin package: permanently alive and never charged.
    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    pub(crate) fn add_file_block(&self, block: Rc<Block>) {
        self.file_blocks.borrow_mut().push(block);
    }

    pub fn file_blocks(&self) -> Ref<'_, Vec<Rc<Block>>> {
        self.file_blocks.borrow()
    }
}

/// Link from a block to its lexical parent.
#[derive(Clone)]
pub enum BlockParent {
    None,
    Block(Rc<Block>),
    /// Parent that lives in the store and has not been loaded yet.
    Stored(ObjectId),
}

/// A lexical scope instance.
pub struct Block {
    pub(crate) info: ObjectInfo,
    source: Rc<BlockNode>,
    values: RefCell<Vec<TypedValue>>,
    parent: RefCell<BlockParent>,
    bootstrap: bool,
}

impl Block {
    pub(crate) fn new(source: Rc<BlockNode>, values: Vec<TypedValue>, parent: BlockParent) -> Self {
        Self {
            info: ObjectInfo::default(),
            source,
            values: RefCell::new(values),
            parent: RefCell::new(parent),
            bootstrap: false,
        }
    }

    /// Root scope of the builtin package.
    pub(crate) fn new_bootstrap(source: Rc<BlockNode>, values: Vec<TypedValue>) -> Self {
        Self {
            bootstrap: true,
            ..Self::new(source, values, BlockParent::None)
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    pub fn source(&self) -> &Rc<BlockNode> {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parent(&self) -> BlockParent {
        self.parent.borrow().clone()
    }

    pub(crate) fn set_parent(&self, parent: BlockParent) {
        *self.parent.borrow_mut() = parent;
    }

    /// Raw slot contents; heap slots hold their [`HeapItemValue`].
    pub fn values(&self) -> Ref<'_, Vec<TypedValue>> {
        self.values.borrow()
    }

    /// Heap item stored in slot `index`, if the slot escaped.
    pub fn heap_item(&self, index: usize) -> Option<Rc<HeapItemValue>> {
        match self.values.borrow().get(index) {
            Some(TypedValue {
                v: Value::HeapItem(item),
                ..
            }) => Some(item.clone()),
            _ => None,
        }
    }

    /// Reads slot `index`, looking through heap items.
    pub fn get(&self, index: usize) -> Option<TypedValue> {
        let values = self.values.borrow();
        match values.get(index)? {
            TypedValue {
                v: Value::HeapItem(item),
                ..
            } => Some(item.get()),
            tv => Some(tv.clone()),
        }
    }

    /// Writes slot `index`, writing through heap items.
    pub(crate) fn set(&self, index: usize, tv: TypedValue) -> bool {
        if let Some(item) = self.heap_item(index) {
            item.set(tv);
            return true;
        }
        match self.values.borrow_mut().get_mut(index) {
            Some(slot) => {
                *slot = tv;
                true
            }
            None => false,
        }
    }

    /// Replaces slot `index` itself, heap item included.
    pub(crate) fn set_raw(&self, index: usize, tv: TypedValue) -> bool {
        match self.values.borrow_mut().get_mut(index) {
            Some(slot) => {
                *slot = tv;
                true
            }
            None => false,
        }
    }

    /// Pointer to slot `index`; escaped slots point at their heap item.
    pub fn pointer_to(self: &Rc<Self>, index: usize) -> PointerValue {
        match self.heap_item(index) {
            Some(item) => PointerValue {
                base: PointerBase::HeapItem(item),
                index: 0,
            },
            None => PointerValue {
                base: PointerBase::Block(self.clone()),
                index,
            },
        }
    }
}

/// Box for a value whose address outlived its block.
pub struct HeapItemValue {
    pub(crate) info: ObjectInfo,
    value: RefCell<TypedValue>,
}

impl HeapItemValue {
    pub(crate) fn new(value: TypedValue) -> Self {
        Self {
            info: ObjectInfo::default(),
            value: RefCell::new(value),
        }
    }

    pub fn get(&self) -> TypedValue {
        self.value.borrow().clone()
    }

    pub(crate) fn set(&self, tv: TypedValue) {
        *self.value.borrow_mut() = tv;
    }

    pub fn value(&self) -> Ref<'_, TypedValue> {
        self.value.borrow()
    }
}

/// What a pointer points into.
#[derive(Clone)]
pub enum PointerBase {
    Block(Rc<Block>),
    HeapItem(Rc<HeapItemValue>),
    Array(Rc<ArrayValue>),
    Struct(Rc<StructValue>),
    /// Assignment target `m[k]`; never materialized as a language value.
    MapEntry {
        map: Rc<MapValue>,
        key: Box<TypedValue>,
    },
}

impl PointerBase {
    pub fn label(&self) -> &'static str {
        match self {
            PointerBase::Block(_) => "block",
            PointerBase::HeapItem(_) => "heapitem",
            PointerBase::Array(_) => "array",
            PointerBase::Struct(_) => "struct",
            PointerBase::MapEntry { .. } => "mapentry",
        }
    }
}

#[derive(Clone)]
pub struct PointerValue {
    pub base: PointerBase,
    pub index: usize,
}

impl PointerValue {
    pub fn deref(&self) -> Result<TypedValue, VMError> {
        let found = match &self.base {
            PointerBase::Block(b) => b.get(self.index),
            PointerBase::HeapItem(item) => Some(item.get()),
            PointerBase::Array(av) => av.get(self.index),
            PointerBase::Struct(sv) => sv.get(self.index),
            PointerBase::MapEntry { map, key } => {
                Some(map.get(&MapKey::of(key)?).unwrap_or_default())
            }
        };
        found.ok_or(VMError::UnexpectedEntry {
            op: "deref",
            found: format!("{} index {}", self.base.label(), self.index),
        })
    }

    /// Stores through the pointer. New map entries must already be charged.
    pub(crate) fn store(&self, tv: TypedValue) -> Result<(), VMError> {
        let stored = match &self.base {
            PointerBase::Block(b) => b.set(self.index, tv),
            PointerBase::HeapItem(item) => {
                item.set(tv);
                true
            }
            PointerBase::Array(av) => av.set(self.index, tv),
            PointerBase::Struct(sv) => sv.set(self.index, tv),
            PointerBase::MapEntry { map, key } => {
                map.set(MapKey::of(key)?, key.as_ref().clone(), tv);
                true
            }
        };
        if stored {
            Ok(())
        } else {
            Err(VMError::UnexpectedEntry {
                op: "store",
                found: format!("{} index {}", self.base.label(), self.index),
            })
        }
    }

    pub fn heap_item(&self) -> Option<&Rc<HeapItemValue>> {
        match &self.base {
            PointerBase::HeapItem(item) => Some(item),
            _ => None,
        }
    }

    /// Whether both pointers address the same slot.
    pub fn same_target(&self, other: &PointerValue) -> bool {
        let same_base = match (&self.base, &other.base) {
            (PointerBase::Block(a), PointerBase::Block(b)) => Rc::ptr_eq(a, b),
            (PointerBase::HeapItem(a), PointerBase::HeapItem(b)) => Rc::ptr_eq(a, b),
            (PointerBase::Array(a), PointerBase::Array(b)) => Rc::ptr_eq(a, b),
            (PointerBase::Struct(a), PointerBase::Struct(b)) => Rc::ptr_eq(a, b),
            _ => false,
        };
        same_base && self.index == other.index
    }
}

/// Zero value of `ty`. Arrays and structs are built (and charged) eagerly.
pub fn default_value(alloc: &mut Allocator, ty: &Type) -> Result<TypedValue, VMError> {
    match ty {
        Type::Array(at) => {
            let mut list = Vec::with_capacity(at.len);
            for _ in 0..at.len {
                list.push(default_value(alloc, &at.elem)?);
            }
            alloc.new_array(Some(ty.clone()), list)
        }
        Type::Struct(st) => {
            let mut fields = Vec::with_capacity(st.fields.len());
            for field in &st.fields {
                fields.push(default_value(alloc, &field.ty)?);
            }
            alloc.new_struct(Some(ty.clone()), fields)
        }
        Type::Interface => Ok(TypedValue::nil()),
        other => Ok(TypedValue::typed_nil(other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_live_in_inline_bytes() {
        let tv = TypedValue::int(-42);
        assert!(matches!(tv.v, Value::None));
        assert_eq!(tv.get_int(), -42);
        assert_eq!(TypedValue::boolean(true).n[0], 1);
        assert_eq!(TypedValue::uint8(200).get_uint8(), 200);
    }

    #[test]
    fn nil_detection() {
        assert!(TypedValue::nil().is_nil());
        assert!(TypedValue::typed_nil(Type::pointer(Type::Int)).is_nil());
        assert!(!TypedValue::int(0).is_nil());
        assert!(!TypedValue::typed_nil(Type::String).is_nil());
    }

    #[test]
    fn equality_of_scalars_and_strings() {
        assert!(TypedValue::int(3).equals(&TypedValue::int(3)).unwrap());
        assert!(!TypedValue::int(3).equals(&TypedValue::int(4)).unwrap());
        assert!(
            TypedValue::string("a")
                .equals(&TypedValue::string("a"))
                .unwrap()
        );
        assert!(
            TypedValue::typed_nil(Type::String)
                .equals(&TypedValue::string(""))
                .unwrap()
        );
    }

    #[test]
    fn map_preserves_insertion_order_across_deletes() {
        let map = MapValue::new();
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            let key = TypedValue::string(k);
            map.set(MapKey::of(&key).unwrap(), key, TypedValue::int(i as i64));
        }
        assert!(map.delete(&MapKey::String(Rc::from(b"a".as_slice()))));
        assert!(!map.delete(&MapKey::String(Rc::from(b"a".as_slice()))));
        let keys: Vec<String> = map.entries().iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(
            map.get(&MapKey::String(Rc::from(b"c".as_slice()))).unwrap().get_int(),
            2
        );
    }

    #[test]
    fn heap_slots_are_read_and_written_through() {
        let item = Rc::new(HeapItemValue::new(TypedValue::int(1)));
        let block = Rc::new(Block::new(
            BlockNode::empty(),
            vec![TypedValue {
                t: Some(Type::HeapItem),
                v: Value::HeapItem(item.clone()),
                n: [0; 8],
            }],
            BlockParent::None,
        ));
        assert_eq!(block.get(0).unwrap().get_int(), 1);
        assert!(block.set(0, TypedValue::int(9)));
        assert_eq!(item.get().get_int(), 9);

        let ptr = block.pointer_to(0);
        assert!(ptr.heap_item().is_some());
        ptr.store(TypedValue::int(5)).unwrap();
        assert_eq!(block.get(0).unwrap().get_int(), 5);
    }

    #[test]
    fn pointers_compare_by_target() {
        let block = Rc::new(Block::new(
            BlockNode::empty(),
            vec![TypedValue::int(1), TypedValue::int(2)],
            BlockParent::None,
        ));
        assert!(block.pointer_to(0).same_target(&block.pointer_to(0)));
        assert!(!block.pointer_to(0).same_target(&block.pointer_to(1)));
    }

    #[test]
    fn display_renders_nested_values() {
        let arr = Rc::new(ArrayValue::new(vec![TypedValue::int(1), TypedValue::int(2)]));
        let tv = TypedValue {
            t: Some(Type::array(2, Type::Int)),
            v: Value::Array(arr),
            n: [0; 8],
        };
        assert_eq!(tv.to_string(), "[1 2]");
        assert_eq!(TypedValue::nil().to_string(), "nil");
        assert_eq!(TypedValue::string("boom").to_string(), "boom");
    }
}

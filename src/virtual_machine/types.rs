//! Type descriptors.
//!
//! Types are produced by the preprocessor and shared between every value of
//! that type, so the allocator never charges a value for its type component.

use std::fmt;
use std::rc::Rc;

/// Interned identifier used for names, paths and struct fields.
pub type Name = Rc<str>;

/// The closed set of value kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Kind {
    Bool,
    Int,
    Uint8,
    String,
    BigInt,
    Array,
    Slice,
    Pointer,
    Struct,
    Func,
    Map,
    Interface,
    Type,
    Package,
    Block,
    HeapItem,
}

impl Kind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Uint8 => "uint8",
            Kind::String => "string",
            Kind::BigInt => "bigint",
            Kind::Array => "array",
            Kind::Slice => "slice",
            Kind::Pointer => "pointer",
            Kind::Struct => "struct",
            Kind::Func => "func",
            Kind::Map => "map",
            Kind::Interface => "interface",
            Kind::Type => "type",
            Kind::Package => "package",
            Kind::Block => "block",
            Kind::HeapItem => "heapitem",
        }
    }

    /// Kinds whose whole value fits in the inline numeric bytes.
    pub const fn is_scalar(&self) -> bool {
        matches!(self, Kind::Bool | Kind::Int | Kind::Uint8)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayType {
    pub len: usize,
    pub elem: Type,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldType {
    pub name: Name,
    pub ty: Type,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructType {
    /// Declared name, empty for anonymous structs.
    pub name: Name,
    pub fields: Vec<FieldType>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FuncType {
    pub params: Vec<Type>,
    pub results: Vec<Type>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MapType {
    pub key: Type,
    pub value: Type,
}

/// A type descriptor.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Bool,
    Int,
    Uint8,
    String,
    BigInt,
    Array(Rc<ArrayType>),
    Slice(Rc<Type>),
    Pointer(Rc<Type>),
    Struct(Rc<StructType>),
    Func(Rc<FuncType>),
    Map(Rc<MapType>),
    /// The empty interface; values stored in it keep their dynamic type.
    Interface,
    /// The type of a type value.
    TypeType,
    Package,
    Block,
    /// Marks a block slot whose value was moved onto the heap.
    HeapItem,
}

impl Type {
    pub fn kind(&self) -> Kind {
        match self {
            Type::Bool => Kind::Bool,
            Type::Int => Kind::Int,
            Type::Uint8 => Kind::Uint8,
            Type::String => Kind::String,
            Type::BigInt => Kind::BigInt,
            Type::Array(_) => Kind::Array,
            Type::Slice(_) => Kind::Slice,
            Type::Pointer(_) => Kind::Pointer,
            Type::Struct(_) => Kind::Struct,
            Type::Func(_) => Kind::Func,
            Type::Map(_) => Kind::Map,
            Type::Interface => Kind::Interface,
            Type::TypeType => Kind::Type,
            Type::Package => Kind::Package,
            Type::Block => Kind::Block,
            Type::HeapItem => Kind::HeapItem,
        }
    }

    pub fn array(len: usize, elem: Type) -> Type {
        Type::Array(Rc::new(ArrayType { len, elem }))
    }

    pub fn slice(elem: Type) -> Type {
        Type::Slice(Rc::new(elem))
    }

    pub fn pointer(elem: Type) -> Type {
        Type::Pointer(Rc::new(elem))
    }

    pub fn map(key: Type, value: Type) -> Type {
        Type::Map(Rc::new(MapType { key, value }))
    }

    pub fn func(params: Vec<Type>, results: Vec<Type>) -> Type {
        Type::Func(Rc::new(FuncType { params, results }))
    }

    pub fn structure(name: &str, fields: Vec<(&str, Type)>) -> Type {
        Type::Struct(Rc::new(StructType {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(name, ty)| FieldType {
                    name: name.into(),
                    ty,
                })
                .collect(),
        }))
    }

    /// Element type of arrays, slices and pointers.
    pub fn elem(&self) -> Option<&Type> {
        match self {
            Type::Array(at) => Some(&at.elem),
            Type::Slice(elem) | Type::Pointer(elem) => Some(elem),
            _ => None,
        }
    }

    /// Whether values of this type are copied element by element on assignment.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Array(_) | Type::Struct(_))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Array(at) => write!(f, "[{}]{}", at.len, at.elem),
            Type::Slice(elem) => write!(f, "[]{}", elem),
            Type::Pointer(elem) => write!(f, "*{}", elem),
            Type::Map(mt) => write!(f, "map[{}]{}", mt.key, mt.value),
            Type::Struct(st) if !st.name.is_empty() => f.write_str(&st.name),
            Type::Struct(st) => {
                f.write_str("struct{")?;
                for (i, field) in st.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{} {}", field.name, field.ty)?;
                }
                f.write_str("}")
            }
            Type::Func(ft) => {
                f.write_str("func(")?;
                for (i, p) in ft.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                f.write_str(")")?;
                match ft.results.as_slice() {
                    [] => Ok(()),
                    [single] => write!(f, " {}", single),
                    many => {
                        f.write_str(" (")?;
                        for (i, r) in many.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "{}", r)?;
                        }
                        f.write_str(")")
                    }
                }
            }
            Type::Interface => f.write_str("interface{}"),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

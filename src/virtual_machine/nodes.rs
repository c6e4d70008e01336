//! Pre-resolved syntax tree executed by the machine.
//!
//! Nodes arrive from the preprocessor with every name already resolved to a
//! [`ValuePath`] and every scope already described by a [`BlockNode`], so the
//! machine never looks a name up by string.

use crate::virtual_machine::isa::Op;
use crate::virtual_machine::types::{FuncType, Name, Type};
use crate::virtual_machine::values::TypedValue;
use std::rc::Rc;

/// Location of a name: `depth` blocks up from the innermost one (1 = innermost),
/// then `index` into that block's slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ValuePath {
    pub depth: u8,
    pub index: u16,
}

impl ValuePath {
    pub const fn new(depth: u8, index: u16) -> Self {
        Self { depth, index }
    }
}

/// One named slot of a scope.
#[derive(Clone, Debug)]
pub struct Slot {
    pub name: Name,
    pub ty: Type,
    /// The slot's address outlives the block, so it lives in a heap item.
    pub heap: bool,
}

impl Slot {
    pub fn new(name: &str, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            heap: false,
        }
    }

    pub fn heap(name: &str, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            heap: true,
        }
    }
}

/// Static description of a scope: the slots a block built from it holds.
#[derive(Clone, Debug, Default)]
pub struct BlockNode {
    pub slots: Vec<Slot>,
}

impl BlockNode {
    pub fn new(slots: Vec<Slot>) -> Rc<Self> {
        Rc::new(Self { slots })
    }

    pub fn empty() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn name_of(&self, index: usize) -> Option<&Name> {
        self.slots.get(index).map(|s| &s.name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnaryOp {
    Pos,
    Neg,
    Not,
    Xor,
}

impl UnaryOp {
    pub const fn op(&self) -> Op {
        match self {
            UnaryOp::Pos => Op::Upos,
            UnaryOp::Neg => Op::Uneg,
            UnaryOp::Not => Op::Unot,
            UnaryOp::Xor => Op::Uxor,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinaryOp {
    Lor,
    Land,
    Eql,
    Neq,
    Lss,
    Leq,
    Gtr,
    Geq,
    Add,
    Sub,
    Bor,
    Xor,
    Mul,
    Quo,
    Rem,
    Shl,
    Shr,
    Band,
    Bandn,
}

impl BinaryOp {
    pub const fn op(&self) -> Op {
        match self {
            BinaryOp::Lor => Op::Lor,
            BinaryOp::Land => Op::Land,
            BinaryOp::Eql => Op::Eql,
            BinaryOp::Neq => Op::Neq,
            BinaryOp::Lss => Op::Lss,
            BinaryOp::Leq => Op::Leq,
            BinaryOp::Gtr => Op::Gtr,
            BinaryOp::Geq => Op::Geq,
            BinaryOp::Add => Op::Add,
            BinaryOp::Sub => Op::Sub,
            BinaryOp::Bor => Op::Bor,
            BinaryOp::Xor => Op::Xor,
            BinaryOp::Mul => Op::Mul,
            BinaryOp::Quo => Op::Quo,
            BinaryOp::Rem => Op::Rem,
            BinaryOp::Shl => Op::Shl,
            BinaryOp::Shr => Op::Shr,
            BinaryOp::Band => Op::Band,
            BinaryOp::Bandn => Op::Bandn,
        }
    }

    pub const fn is_short_circuit(&self) -> bool {
        matches!(self, BinaryOp::Lor | BinaryOp::Land)
    }
}

/// What a selector expression picks out of its operand.
#[derive(Clone, Debug)]
pub enum Selection {
    /// Struct field by index; pointers to structs are dereferenced implicitly.
    Field(usize),
    /// Method bound to the operand; the path locates the method's function value.
    Method(ValuePath),
}

#[derive(Clone, Debug)]
pub struct KeyValueExpr {
    /// Only map literals carry keys.
    pub key: Option<Rc<Expr>>,
    pub value: Rc<Expr>,
}

#[derive(Clone, Debug)]
pub enum Expr {
    Const(TypedValue),
    Name {
        name: Name,
        path: ValuePath,
    },
    Unary {
        op: UnaryOp,
        x: Rc<Expr>,
    },
    Binary {
        op: BinaryOp,
        x: Rc<Expr>,
        y: Rc<Expr>,
    },
    Call {
        func: Rc<Expr>,
        args: Vec<Rc<Expr>>,
    },
    Index {
        x: Rc<Expr>,
        index: Rc<Expr>,
        /// `v, ok := m[k]`
        comma_ok: bool,
    },
    Selector {
        x: Rc<Expr>,
        sel: Selection,
    },
    Slice {
        x: Rc<Expr>,
        low: Option<Rc<Expr>>,
        high: Option<Rc<Expr>>,
    },
    Star(Rc<Expr>),
    Ref(Rc<Expr>),
    Composite {
        ty: Type,
        elts: Vec<KeyValueExpr>,
    },
    FuncLit {
        decl: Rc<FuncDecl>,
        /// Heap-slot paths captured by the closure, in capture order.
        captures: Vec<ValuePath>,
    },
}

impl Expr {
    pub fn constant(tv: TypedValue) -> Rc<Expr> {
        Rc::new(Expr::Const(tv))
    }

    pub fn int(v: i64) -> Rc<Expr> {
        Self::constant(TypedValue::int(v))
    }

    pub fn boolean(v: bool) -> Rc<Expr> {
        Self::constant(TypedValue::boolean(v))
    }

    pub fn string(v: &str) -> Rc<Expr> {
        Self::constant(TypedValue::string(v))
    }

    pub fn name(name: &str, depth: u8, index: u16) -> Rc<Expr> {
        Rc::new(Expr::Name {
            name: name.into(),
            path: ValuePath::new(depth, index),
        })
    }

    pub fn unary(op: UnaryOp, x: Rc<Expr>) -> Rc<Expr> {
        Rc::new(Expr::Unary { op, x })
    }

    pub fn binary(op: BinaryOp, x: Rc<Expr>, y: Rc<Expr>) -> Rc<Expr> {
        Rc::new(Expr::Binary { op, x, y })
    }

    pub fn call(func: Rc<Expr>, args: Vec<Rc<Expr>>) -> Rc<Expr> {
        Rc::new(Expr::Call { func, args })
    }

    pub fn index(x: Rc<Expr>, index: Rc<Expr>) -> Rc<Expr> {
        Rc::new(Expr::Index {
            x,
            index,
            comma_ok: false,
        })
    }

    pub fn index_ok(x: Rc<Expr>, index: Rc<Expr>) -> Rc<Expr> {
        Rc::new(Expr::Index {
            x,
            index,
            comma_ok: true,
        })
    }

    pub fn field(x: Rc<Expr>, index: usize) -> Rc<Expr> {
        Rc::new(Expr::Selector {
            x,
            sel: Selection::Field(index),
        })
    }

    pub fn method(x: Rc<Expr>, func: ValuePath) -> Rc<Expr> {
        Rc::new(Expr::Selector {
            x,
            sel: Selection::Method(func),
        })
    }

    pub fn slice(x: Rc<Expr>, low: Option<Rc<Expr>>, high: Option<Rc<Expr>>) -> Rc<Expr> {
        Rc::new(Expr::Slice { x, low, high })
    }

    pub fn star(x: Rc<Expr>) -> Rc<Expr> {
        Rc::new(Expr::Star(x))
    }

    pub fn reference(x: Rc<Expr>) -> Rc<Expr> {
        Rc::new(Expr::Ref(x))
    }

    /// Array, slice or struct literal with positional elements.
    pub fn composite(ty: Type, elts: Vec<Rc<Expr>>) -> Rc<Expr> {
        Rc::new(Expr::Composite {
            ty,
            elts: elts
                .into_iter()
                .map(|value| KeyValueExpr { key: None, value })
                .collect(),
        })
    }

    pub fn map_lit(ty: Type, pairs: Vec<(Rc<Expr>, Rc<Expr>)>) -> Rc<Expr> {
        Rc::new(Expr::Composite {
            ty,
            elts: pairs
                .into_iter()
                .map(|(key, value)| KeyValueExpr {
                    key: Some(key),
                    value,
                })
                .collect(),
        })
    }

    pub fn func_lit(decl: Rc<FuncDecl>, captures: Vec<ValuePath>) -> Rc<Expr> {
        Rc::new(Expr::FuncLit { decl, captures })
    }

    /// Short label used in stack traces and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            Expr::Const(_) => "const",
            Expr::Name { .. } => "name",
            Expr::Unary { .. } => "unary",
            Expr::Binary { .. } => "binary",
            Expr::Call { .. } => "call",
            Expr::Index { .. } => "index",
            Expr::Selector { .. } => "selector",
            Expr::Slice { .. } => "slice",
            Expr::Star(_) => "star",
            Expr::Ref(_) => "ref",
            Expr::Composite { .. } => "composite",
            Expr::FuncLit { .. } => "funclit",
        }
    }
}

/// A list of statements executed in a fresh block built from `block`.
#[derive(Clone, Debug)]
pub struct Body {
    pub block: Rc<BlockNode>,
    pub stmts: Rc<Vec<Rc<Stmt>>>,
}

impl Body {
    pub fn new(block: Rc<BlockNode>, stmts: Vec<Rc<Stmt>>) -> Self {
        Self {
            block,
            stmts: Rc::new(stmts),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssignOp {
    Assign,
    Define,
    Add,
    Sub,
    Mul,
}

impl AssignOp {
    pub const fn op(&self) -> Op {
        match self {
            AssignOp::Assign => Op::Assign,
            AssignOp::Define => Op::Define,
            AssignOp::Add => Op::AddAssign,
            AssignOp::Sub => Op::SubAssign,
            AssignOp::Mul => Op::MulAssign,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ForStmt {
    /// Scope holding the loop's init variables.
    pub block: Rc<BlockNode>,
    pub init: Option<Rc<Stmt>>,
    pub cond: Option<Rc<Expr>>,
    pub post: Option<Rc<Stmt>>,
    pub body: Body,
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Expr(Rc<Expr>),
    Assign {
        op: AssignOp,
        lhs: Vec<Rc<Expr>>,
        rhs: Vec<Rc<Expr>>,
    },
    Inc(Rc<Expr>),
    Dec(Rc<Expr>),
    If {
        cond: Rc<Expr>,
        then: Body,
        els: Option<Body>,
    },
    For(Rc<ForStmt>),
    Block(Body),
    Return(Vec<Rc<Expr>>),
    Break,
    Continue,
    Defer {
        func: Rc<Expr>,
        args: Vec<Rc<Expr>>,
    },
    Go {
        func: Rc<Expr>,
        args: Vec<Rc<Expr>>,
    },
    Select,
}

impl Stmt {
    pub fn expr(x: Rc<Expr>) -> Rc<Stmt> {
        Rc::new(Stmt::Expr(x))
    }

    pub fn assign(lhs: Vec<Rc<Expr>>, rhs: Vec<Rc<Expr>>) -> Rc<Stmt> {
        Rc::new(Stmt::Assign {
            op: AssignOp::Assign,
            lhs,
            rhs,
        })
    }

    pub fn define(lhs: Vec<Rc<Expr>>, rhs: Vec<Rc<Expr>>) -> Rc<Stmt> {
        Rc::new(Stmt::Assign {
            op: AssignOp::Define,
            lhs,
            rhs,
        })
    }

    pub fn op_assign(op: AssignOp, lhs: Rc<Expr>, rhs: Rc<Expr>) -> Rc<Stmt> {
        Rc::new(Stmt::Assign {
            op,
            lhs: vec![lhs],
            rhs: vec![rhs],
        })
    }

    pub fn ret(results: Vec<Rc<Expr>>) -> Rc<Stmt> {
        Rc::new(Stmt::Return(results))
    }

    pub fn if_else(cond: Rc<Expr>, then: Body, els: Option<Body>) -> Rc<Stmt> {
        Rc::new(Stmt::If { cond, then, els })
    }

    pub fn defer(func: Rc<Expr>, args: Vec<Rc<Expr>>) -> Rc<Stmt> {
        Rc::new(Stmt::Defer { func, args })
    }
}

/// A function declaration or literal.
///
/// The function block lays out parameters first, then results, then locals,
/// then captured heap items.
#[derive(Debug)]
pub struct FuncDecl {
    pub name: Name,
    pub ty: Rc<FuncType>,
    pub block: Rc<BlockNode>,
    pub body: Rc<Vec<Rc<Stmt>>>,
    pub num_captures: usize,
}

impl FuncDecl {
    pub fn new(
        name: &str,
        ty: FuncType,
        block: Rc<BlockNode>,
        body: Vec<Rc<Stmt>>,
        num_captures: usize,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            ty: Rc::new(ty),
            block,
            body: Rc::new(body),
            num_captures,
        })
    }

    pub fn num_params(&self) -> usize {
        self.ty.params.len()
    }

    pub fn num_results(&self) -> usize {
        self.ty.results.len()
    }
}

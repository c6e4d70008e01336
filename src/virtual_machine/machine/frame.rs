use crate::virtual_machine::profile::StackProbe;
use crate::virtual_machine::values::{Block, FuncValue, PackageValue, Realm, TypedValue};
use std::cell::RefCell;
use std::rc::Rc;

/// A call recorded by `defer`, run when its frame returns or unwinds.
#[derive(Clone, Debug)]
pub struct Defer {
    pub func: TypedValue,
    pub args: Vec<TypedValue>,
    /// Block active when the defer statement ran.
    pub parent: Option<Rc<Block>>,
}

/// A language-level panic in flight.
#[derive(Clone, Debug)]
pub struct Exception {
    pub value: TypedValue,
    pub stacktrace: String,
    /// Set once a deferred call recovered it.
    pub recovered: bool,
}

/// Activation record for a call or a loop.
///
/// The `num_*` fields are stack depths at push time; unwinding truncates each
/// stack back to them.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub num_ops: usize,
    pub num_values: usize,
    pub num_exprs: usize,
    pub num_stmts: usize,
    pub num_blocks: usize,

    /// Callee; `None` for loop frames.
    pub func: Option<Rc<FuncValue>>,
    pub receiver: TypedValue,
    pub num_args: usize,
    pub defers: Vec<Defer>,

    pub last_package: Option<Rc<PackageValue>>,
    pub last_realm: Option<Rc<Realm>>,
    /// The call entered a different realm.
    pub did_cross: bool,
    /// The frame runs a deferred call; `recover` only works here.
    pub is_defer: bool,
    pub is_loop: bool,
}

impl Frame {
    pub fn is_call(&self) -> bool {
        self.func.is_some()
    }

    pub fn name(&self) -> String {
        match &self.func {
            Some(fv) => fv.qualified_name(),
            None => "<loop>".to_string(),
        }
    }
}

/// Everything the deep collector treats as a root.
///
/// Shared between the machine, which mutates it, and the collector registered
/// in the allocator, which only reads it during a pass. The machine never
/// holds a mutable borrow across a charge.
#[derive(Default)]
pub struct LiveRoots {
    pub blocks: RefCell<Vec<Rc<Block>>>,
    pub frames: RefCell<Vec<Frame>>,
    pub package: RefCell<Option<Rc<PackageValue>>>,
    pub staging: RefCell<Option<Rc<PackageValue>>>,
    pub exceptions: RefCell<Vec<Exception>>,
}

impl LiveRoots {
    /// Call-frame names, innermost first.
    pub fn stacktrace(&self) -> Vec<String> {
        self.frames
            .borrow()
            .iter()
            .rev()
            .filter(|f| f.is_call())
            .map(Frame::name)
            .collect()
    }

    pub fn clear(&self) {
        self.blocks.borrow_mut().clear();
        self.frames.borrow_mut().clear();
        self.package.borrow_mut().take();
        self.staging.borrow_mut().take();
        self.exceptions.borrow_mut().clear();
    }
}

impl StackProbe for LiveRoots {
    fn stack(&self) -> Vec<String> {
        self.stacktrace()
    }
}

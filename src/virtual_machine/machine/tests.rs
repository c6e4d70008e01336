use super::*;
use crate::utils::test_utils::utils::{
    builtin, closure_decl, declare, func_decl, ints, machine, machine_with, realm,
};
use crate::virtual_machine::gas::{BasicGasMeter, GasProfile};
use crate::virtual_machine::nodes::{AssignOp, BinaryOp, Body, Slot};
use crate::virtual_machine::profile::AllocEvent;
use crate::virtual_machine::store::{MemStore, ObjectId};
use crate::virtual_machine::types::FuncType;
use crate::virtual_machine::values::{FuncBody, FuncValue};
use num_bigint::BigInt;
use std::cell::RefCell;
use std::rc::Weak;

fn int_slot(name: &str) -> Slot {
    Slot::new(name, Type::Int)
}

fn bin(op: BinaryOp, x: Rc<Expr>, y: Rc<Expr>) -> Rc<Expr> {
    Expr::binary(op, x, y)
}

fn inc(x: Rc<Expr>) -> Rc<Stmt> {
    Rc::new(Stmt::Inc(x))
}

fn body(stmts: Vec<Rc<Stmt>>) -> Body {
    Body::new(BlockNode::empty(), stmts)
}

fn infinite_loop() -> Rc<Stmt> {
    Rc::new(Stmt::For(Rc::new(ForStmt {
        block: BlockNode::empty(),
        init: None,
        cond: None,
        post: None,
        body: body(vec![]),
    })))
}

/// `for i := 0; i < limit; i++ { <stmts> }` with `i` in the loop block.
fn counting_loop(limit: Rc<Expr>, body: Body) -> Rc<Stmt> {
    let i = Expr::name("i", 1, 0);
    Rc::new(Stmt::For(Rc::new(ForStmt {
        block: BlockNode::new(vec![int_slot("i")]),
        init: Some(Stmt::define(vec![i.clone()], vec![Expr::int(0)])),
        cond: Some(bin(BinaryOp::Lss, i.clone(), limit)),
        post: Some(inc(i)),
        body,
    })))
}

fn panic_descriptor(err: VMError) -> String {
    match err {
        VMError::UnhandledPanic { descriptor, .. } => descriptor,
        other => panic!("expected an unhandled panic, got {other:?}"),
    }
}

/// Meter sharing its profile with the test.
struct SharedMeter {
    used: u64,
    profile: Rc<RefCell<GasProfile>>,
}

impl GasMeter for SharedMeter {
    fn consume(&mut self, amount: u64, reason: GasCategory) -> Result<(), VMError> {
        self.used += amount;
        self.profile.borrow_mut().add(reason, amount);
        Ok(())
    }

    fn consumed(&self) -> u64 {
        self.used
    }

    fn limit(&self) -> u64 {
        u64::MAX
    }
}

struct Recorder(Rc<RefCell<Vec<AllocEvent>>>);

impl AllocObserver for Recorder {
    fn on_alloc(&mut self, event: &AllocEvent) {
        self.0.borrow_mut().push(event.clone());
    }

    fn wants_stack(&self) -> bool {
        true
    }
}

#[test]
fn evaluates_arithmetic() {
    let (mut m, _) = machine(vec![]);
    let expr = bin(
        BinaryOp::Add,
        Expr::int(1),
        bin(BinaryOp::Mul, Expr::int(2), Expr::int(3)),
    );
    assert_eq!(ints(&m.eval(expr).unwrap()), vec![7]);

    let shifted = bin(BinaryOp::Shl, Expr::int(1), Expr::int(70));
    assert_eq!(ints(&m.eval(shifted).unwrap()), vec![0]);

    let cmp = bin(BinaryOp::Land, Expr::boolean(true), bin(BinaryOp::Lss, Expr::int(2), Expr::int(1)));
    assert!(!m.eval(cmp).unwrap()[0].get_bool());
    m.check_empty().unwrap();
    assert!(m.cycles() > 0);
}

#[test]
fn concatenates_strings() {
    let (mut m, _) = machine(vec![]);
    let before = m.alloc().bytes();
    let out = m
        .eval(bin(BinaryOp::Add, Expr::string("go"), Expr::string("vm")))
        .unwrap();
    assert_eq!(out[0].get_str(), "govm");
    assert_eq!(m.alloc().bytes() - before, AllocCosts::default().string_size(4));
}

#[test]
fn defines_and_updates_package_variables() {
    let (mut m, pkg) = machine(vec![int_slot("x")]);
    let x = Expr::name("x", 1, 0);
    m.run_stmt(Stmt::define(vec![x.clone()], vec![Expr::int(40)]))
        .unwrap();
    m.run_stmt(Stmt::op_assign(AssignOp::Add, x.clone(), Expr::int(2)))
        .unwrap();
    assert_eq!(ints(&m.eval(x).unwrap()), vec![42]);
    assert_eq!(pkg.block.get(0).unwrap().get_int(), 42);
    m.check_empty().unwrap();
}

#[test]
fn calls_function_with_results() {
    let (mut m, pkg) = machine(vec![Slot::new("add", Type::func(vec![Type::Int; 2], vec![Type::Int]))]);
    let add = func_decl(
        "add",
        vec![int_slot("a"), int_slot("b")],
        vec![int_slot("r")],
        vec![],
        vec![Stmt::ret(vec![bin(
            BinaryOp::Add,
            Expr::name("a", 1, 0),
            Expr::name("b", 1, 1),
        )])],
    );
    declare(&mut m, &pkg, 0, add);

    let call = Expr::call(Expr::name("add", 1, 0), vec![Expr::int(2), Expr::int(3)]);
    assert_eq!(ints(&m.eval(call).unwrap()), vec![5]);

    let func = pkg.block.get(0).unwrap();
    let out = m.call(func, vec![TypedValue::int(10), TypedValue::int(-4)]).unwrap();
    assert_eq!(ints(&out), vec![6]);
    m.check_empty().unwrap();
}

#[test]
fn assigns_multiple_results() {
    let (mut m, pkg) = machine(vec![
        Slot::new("two", Type::func(vec![], vec![Type::Int; 2])),
        int_slot("a"),
        int_slot("b"),
    ]);
    let two = func_decl(
        "two",
        vec![],
        vec![int_slot("r0"), int_slot("r1")],
        vec![],
        vec![Stmt::ret(vec![Expr::int(1), Expr::int(2)])],
    );
    declare(&mut m, &pkg, 0, two);
    m.run_stmt(Stmt::define(
        vec![Expr::name("a", 1, 1), Expr::name("b", 1, 2)],
        vec![Expr::call(Expr::name("two", 1, 0), vec![])],
    ))
    .unwrap();
    assert_eq!(pkg.block.get(1).unwrap().get_int(), 1);
    assert_eq!(pkg.block.get(2).unwrap().get_int(), 2);
}

#[test]
fn runs_for_loop() {
    let (mut m, pkg) = machine(vec![Slot::new("sum", Type::func(vec![Type::Int], vec![Type::Int]))]);
    // s := 0; for i := 0; i < n; i++ { s += i }; return s
    let loop_body = body(vec![Stmt::op_assign(
        AssignOp::Add,
        Expr::name("s", 3, 2),
        Expr::name("i", 2, 0),
    )]);
    let sum = func_decl(
        "sum",
        vec![int_slot("n")],
        vec![int_slot("r")],
        vec![int_slot("s")],
        vec![
            Stmt::define(vec![Expr::name("s", 1, 2)], vec![Expr::int(0)]),
            counting_loop(Expr::name("n", 2, 0), loop_body),
            Stmt::ret(vec![Expr::name("s", 1, 2)]),
        ],
    );
    declare(&mut m, &pkg, 0, sum);
    let func = pkg.block.get(0).unwrap();
    assert_eq!(ints(&m.call(func.clone(), vec![TypedValue::int(5)]).unwrap()), vec![10]);
    assert_eq!(ints(&m.call(func, vec![TypedValue::int(0)]).unwrap()), vec![0]);
    m.check_empty().unwrap();
}

#[test]
fn break_and_continue() {
    let (mut m, pkg) = machine(vec![Slot::new("odds", Type::func(vec![], vec![Type::Int]))]);
    // for i := 0; i < 100; i++ { if i == 7 { break }; if i%2 == 0 { continue }; s += i }
    let i = Expr::name("i", 2, 0);
    let loop_body = body(vec![
        Stmt::if_else(
            bin(BinaryOp::Eql, i.clone(), Expr::int(7)),
            body(vec![Rc::new(Stmt::Break)]),
            None,
        ),
        Stmt::if_else(
            bin(
                BinaryOp::Eql,
                bin(BinaryOp::Rem, i.clone(), Expr::int(2)),
                Expr::int(0),
            ),
            body(vec![Rc::new(Stmt::Continue)]),
            None,
        ),
        Stmt::op_assign(AssignOp::Add, Expr::name("s", 3, 1), i),
    ]);
    let odds = func_decl(
        "odds",
        vec![],
        vec![int_slot("r")],
        vec![int_slot("s")],
        vec![
            counting_loop(Expr::int(100), loop_body),
            Stmt::ret(vec![Expr::name("s", 1, 1)]),
        ],
    );
    declare(&mut m, &pkg, 0, odds);
    let out = m.eval(Expr::call(Expr::name("odds", 1, 0), vec![])).unwrap();
    assert_eq!(ints(&out), vec![1 + 3 + 5]);
    m.check_empty().unwrap();
}

#[test]
fn if_else_picks_branch() {
    let (mut m, pkg) = machine(vec![int_slot("x")]);
    let x = Expr::name("x", 2, 0);
    let stmt = Stmt::if_else(
        Expr::boolean(false),
        body(vec![Stmt::assign(vec![x.clone()], vec![Expr::int(1)])]),
        Some(body(vec![Stmt::assign(vec![x], vec![Expr::int(2)])])),
    );
    m.run_stmt(stmt).unwrap();
    assert_eq!(pkg.block.get(0).unwrap().get_int(), 2);
    m.check_empty().unwrap();
}

#[test]
fn deferred_calls_run_last_in_first_out() {
    let (mut m, pkg) = machine(vec![Slot::new("f", Type::func(vec![], vec![Type::Int]))]);
    let step = |k: i64| {
        let r = Expr::name("r", 1, 0);
        let decl = closure_decl(
            "func1",
            vec![],
            vec![],
            vec![],
            vec![int_slot("r")],
            vec![Stmt::assign(
                vec![r.clone()],
                vec![bin(
                    BinaryOp::Add,
                    bin(BinaryOp::Mul, r, Expr::int(10)),
                    Expr::int(k),
                )],
            )],
        );
        Stmt::defer(Expr::func_lit(decl, vec![ValuePath::new(1, 0)]), vec![])
    };
    let f = func_decl(
        "f",
        vec![],
        vec![Slot::heap("r", Type::Int)],
        vec![],
        vec![step(1), step(2), Stmt::ret(vec![Expr::int(0)])],
    );
    declare(&mut m, &pkg, 0, f);
    let out = m.eval(Expr::call(Expr::name("f", 1, 0), vec![])).unwrap();
    assert_eq!(ints(&out), vec![21]);
    m.check_empty().unwrap();
}

#[test]
fn recover_in_deferred_call_stops_panic() {
    let (mut m, pkg) = machine(vec![Slot::new("safe", Type::func(vec![], vec![Type::Int]))]);
    let handler = closure_decl(
        "func1",
        vec![],
        vec![],
        vec![],
        vec![int_slot("r")],
        vec![
            Stmt::expr(Expr::call(builtin("recover", 4), vec![])),
            Stmt::assign(vec![Expr::name("r", 1, 0)], vec![Expr::int(7)]),
        ],
    );
    let safe = func_decl(
        "safe",
        vec![],
        vec![Slot::heap("r", Type::Int)],
        vec![],
        vec![
            Stmt::defer(Expr::func_lit(handler, vec![ValuePath::new(1, 0)]), vec![]),
            Stmt::expr(Expr::call(builtin("panic", 3), vec![Expr::string("boom")])),
        ],
    );
    declare(&mut m, &pkg, 0, safe);
    let out = m.eval(Expr::call(Expr::name("safe", 1, 0), vec![])).unwrap();
    assert_eq!(ints(&out), vec![7]);
    assert!(m.exceptions().is_empty());
    m.check_empty().unwrap();
}

#[test]
fn recover_outside_deferred_call_is_nil() {
    let (mut m, _) = machine(vec![]);
    let out = m.eval(Expr::call(builtin("recover", 2), vec![])).unwrap();
    assert!(out[0].is_nil());
}

#[test]
fn unhandled_panic_reports_value_and_stack() {
    let (mut m, pkg) = machine(vec![Slot::new("boom", Type::func(vec![], vec![]))]);
    let boom = func_decl(
        "boom",
        vec![],
        vec![],
        vec![],
        vec![Stmt::expr(Expr::call(builtin("panic", 3), vec![Expr::string("bad")]))],
    );
    declare(&mut m, &pkg, 0, boom);
    let err = m
        .eval(Expr::call(Expr::name("boom", 1, 0), vec![]))
        .unwrap_err();
    match err {
        VMError::UnhandledPanic {
            descriptor,
            stacktrace,
        } => {
            assert_eq!(descriptor, "panic: bad");
            assert_eq!(stacktrace, "main.boom");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn panic_in_deferred_call_chains_descriptors() {
    let (mut m, pkg) = machine(vec![Slot::new("f", Type::func(vec![], vec![]))]);
    let handler = func_decl(
        "func1",
        vec![],
        vec![],
        vec![],
        vec![
            Stmt::expr(Expr::call(builtin("recover", 4), vec![])),
            Stmt::expr(Expr::call(builtin("panic", 4), vec![Expr::string("second")])),
        ],
    );
    let f = func_decl(
        "f",
        vec![],
        vec![],
        vec![],
        vec![
            Stmt::defer(Expr::func_lit(handler, vec![]), vec![]),
            Stmt::expr(Expr::call(builtin("panic", 3), vec![Expr::string("first")])),
        ],
    );
    declare(&mut m, &pkg, 0, f);
    let err = m.eval(Expr::call(Expr::name("f", 1, 0), vec![])).unwrap_err();
    assert_eq!(
        panic_descriptor(err),
        "panic: first [recovered]\n\tpanic: second"
    );
}

#[test]
fn runtime_errors_become_panics() {
    let (mut m, _) = machine(vec![]);
    let err = m
        .eval(bin(BinaryOp::Quo, Expr::int(1), Expr::int(0)))
        .unwrap_err();
    assert_eq!(
        panic_descriptor(err),
        "panic: runtime error: integer divide by zero"
    );

    assert!(matches!(m.eval(Expr::int(1)), Err(VMError::MachineBusy(_))));

    m.reset();
    let err = m
        .eval(bin(BinaryOp::Shl, Expr::int(1), Expr::int(-1)))
        .unwrap_err();
    assert!(!err.is_exhaustion());
    assert_eq!(
        panic_descriptor(err),
        "panic: runtime error: negative shift amount"
    );
}

#[test]
fn index_out_of_range_panics() {
    let (mut m, _) = machine(vec![Slot::new("s", Type::slice(Type::Int))]);
    let s = Expr::name("s", 1, 0);
    let lit = Expr::composite(Type::slice(Type::Int), vec![Expr::int(1), Expr::int(2)]);
    m.run_stmt(Stmt::define(vec![s.clone()], vec![lit])).unwrap();
    let err = m.eval(Expr::index(s, Expr::int(5))).unwrap_err();
    assert_eq!(
        panic_descriptor(err),
        "panic: runtime error: index out of range [5] with length 2"
    );
}

#[test]
fn builtins_on_slices() {
    let (mut m, pkg) = machine(vec![Slot::new("s", Type::slice(Type::Int))]);
    let s = Expr::name("s", 1, 0);
    let lit = Expr::composite(Type::slice(Type::Int), vec![Expr::int(1), Expr::int(2)]);
    m.run_stmt(Stmt::define(vec![s.clone()], vec![lit])).unwrap();

    let append = |x: i64| Expr::call(builtin("append", 2), vec![Expr::name("s", 1, 0), Expr::int(x)]);
    m.run_stmt(Stmt::assign(vec![s.clone()], vec![append(3)])).unwrap();
    let len = m.eval(Expr::call(builtin("len", 2), vec![s.clone()])).unwrap();
    let cap = m.eval(Expr::call(builtin("cap", 2), vec![s.clone()])).unwrap();
    assert_eq!((ints(&len), ints(&cap)), (vec![3], vec![4]));

    m.run_stmt(Stmt::assign(vec![s.clone()], vec![append(4)])).unwrap();
    let Value::Slice(sv) = pkg.block.get(0).unwrap().v else {
        panic!("expected a slice");
    };
    assert_eq!((sv.len, sv.cap), (4, 4));
    assert_eq!(ints(&sv.to_vec()), vec![1, 2, 3, 4]);

    let third = m.eval(Expr::index(s, Expr::int(2))).unwrap();
    assert_eq!(ints(&third), vec![3]);
    m.check_empty().unwrap();
}

#[test]
fn map_assignment_lookup_and_delete() {
    let map_t = Type::map(Type::String, Type::Int);
    let (mut m, pkg) = machine(vec![
        Slot::new("m", map_t.clone()),
        int_slot("v"),
        Slot::new("ok", Type::Bool),
    ]);
    let mv = Expr::name("m", 1, 0);
    let lit = Expr::map_lit(map_t, vec![(Expr::string("a"), Expr::int(1))]);
    m.run_stmt(Stmt::define(vec![mv.clone()], vec![lit])).unwrap();
    m.run_stmt(Stmt::assign(
        vec![Expr::index(mv.clone(), Expr::string("b"))],
        vec![Expr::int(2)],
    ))
    .unwrap();
    m.run_stmt(Stmt::op_assign(
        AssignOp::Add,
        Expr::index(mv.clone(), Expr::string("b")),
        Expr::int(5),
    ))
    .unwrap();
    m.run_stmt(Stmt::define(
        vec![Expr::name("v", 1, 1), Expr::name("ok", 1, 2)],
        vec![Expr::index_ok(mv.clone(), Expr::string("c"))],
    ))
    .unwrap();
    assert_eq!(pkg.block.get(1).unwrap().get_int(), 0);
    assert!(!pkg.block.get(2).unwrap().get_bool());

    let len = |m: &mut Machine| ints(&m.eval(Expr::call(builtin("len", 2), vec![Expr::name("m", 1, 0)])).unwrap());
    assert_eq!(len(&mut m), vec![2]);
    let b = m.eval(Expr::index(mv.clone(), Expr::string("b"))).unwrap();
    assert_eq!(ints(&b), vec![7]);

    m.run_stmt(Stmt::expr(Expr::call(
        builtin("delete", 2),
        vec![mv, Expr::string("a")],
    )))
    .unwrap();
    assert_eq!(len(&mut m), vec![1]);
    m.check_empty().unwrap();
}

#[test]
fn assignment_to_nil_map_panics() {
    let (mut m, _) = machine(vec![Slot::new("n", Type::map(Type::String, Type::Int))]);
    let err = m
        .run_stmt(Stmt::assign(
            vec![Expr::index(Expr::name("n", 1, 0), Expr::string("x"))],
            vec![Expr::int(1)],
        ))
        .unwrap_err();
    assert_eq!(panic_descriptor(err), "panic: assignment to entry in nil map");
}

#[test]
fn struct_fields_and_bound_methods() {
    let point = Type::structure("Point", vec![("x", Type::Int), ("y", Type::Int)]);
    let (mut m, pkg) = machine(vec![
        Slot::new("p", point.clone()),
        Slot::new("Sum", Type::func(vec![point.clone()], vec![Type::Int])),
    ]);
    let recv = Expr::name("p", 1, 0);
    let sum = func_decl(
        "Sum",
        vec![Slot::new("p", point.clone())],
        vec![int_slot("r")],
        vec![],
        vec![Stmt::ret(vec![bin(
            BinaryOp::Add,
            Expr::field(recv.clone(), 0),
            Expr::field(recv, 1),
        )])],
    );
    declare(&mut m, &pkg, 1, sum);

    let p = Expr::name("p", 1, 0);
    let lit = Expr::composite(point, vec![Expr::int(1), Expr::int(2)]);
    m.run_stmt(Stmt::define(vec![p.clone()], vec![lit])).unwrap();
    m.run_stmt(Stmt::assign(vec![Expr::field(p.clone(), 0)], vec![Expr::int(10)]))
        .unwrap();
    let call = Expr::call(Expr::method(p, ValuePath::new(1, 1)), vec![]);
    assert_eq!(ints(&m.eval(call).unwrap()), vec![12]);
    m.check_empty().unwrap();
}

#[test]
fn taking_address_escapes_and_is_swept() {
    let (mut m, pkg) = machine(vec![Slot::new("f", Type::func(vec![], vec![Type::Int]))]);
    let x = Expr::name("x", 1, 1);
    let p = Expr::name("p", 1, 2);
    let f = func_decl(
        "f",
        vec![],
        vec![int_slot("r")],
        vec![Slot::heap("x", Type::Int), Slot::new("p", Type::pointer(Type::Int))],
        vec![
            Stmt::define(vec![x.clone()], vec![Expr::int(5)]),
            Stmt::define(vec![p.clone()], vec![Expr::reference(x.clone())]),
            Stmt::assign(vec![Expr::star(p)], vec![Expr::int(9)]),
            Stmt::ret(vec![x]),
        ],
    );
    declare(&mut m, &pkg, 0, f);
    let out = m.eval(Expr::call(Expr::name("f", 1, 0), vec![])).unwrap();
    assert_eq!(ints(&out), vec![9]);
    assert_eq!(m.escape_count(), 1);
    assert!(m.heap().is_empty());
    m.check_empty().unwrap();
}

/// Package `main` with `f`, which stores the address of its escaped local
/// `x` in the package variable `q` from a nested block, and an empty `g`.
fn escape_to_package() -> (Machine, Rc<PackageValue>) {
    let ptr_int = Type::pointer(Type::Int);
    let (mut m, pkg) = machine(vec![
        Slot::new("f", Type::func(vec![], vec![])),
        Slot::new("g", Type::func(vec![], vec![])),
        Slot::new("q", ptr_int.clone()),
    ]);
    let p = Expr::name("p", 1, 0);
    let inner = Body::new(
        BlockNode::new(vec![Slot::new("p", ptr_int)]),
        vec![
            Stmt::define(vec![p.clone()], vec![Expr::reference(Expr::name("x", 2, 0))]),
            Stmt::assign(vec![Expr::name("q", 3, 2)], vec![p]),
        ],
    );
    let f = func_decl(
        "f",
        vec![],
        vec![],
        vec![Slot::heap("x", Type::Int)],
        vec![Stmt::if_else(Expr::boolean(true), inner, None)],
    );
    declare(&mut m, &pkg, 0, f);
    declare(&mut m, &pkg, 1, func_decl("g", vec![], vec![], vec![], vec![]));
    (m, pkg)
}

/// Net bytes of calling `g`, whose return sweeps the root tracker.
fn charge_of_empty_call(m: &mut Machine) -> i64 {
    let before = m.alloc().bytes();
    m.eval(Expr::call(Expr::name("g", 1, 1), vec![])).unwrap();
    m.alloc().bytes() - before
}

fn clear_q() -> Rc<Stmt> {
    Stmt::assign(
        vec![Expr::name("q", 1, 2)],
        vec![Expr::constant(TypedValue::nil())],
    )
}

fn node_of_q(m: &Machine, pkg: &PackageValue) -> NodeId {
    let q = pkg.block.get(2).unwrap();
    let Value::Pointer(ptr) = &q.v else {
        panic!("q should hold a pointer, got {q:?}");
    };
    m.heap().find_by_item(ptr.heap_item().unwrap()).unwrap()
}

#[test]
fn copied_pointer_keeps_escaped_local_charged() {
    let (mut m, pkg) = escape_to_package();
    let idle = charge_of_empty_call(&mut m);

    m.eval(Expr::call(Expr::name("f", 1, 0), vec![])).unwrap();
    assert_eq!(m.escape_count(), 1);
    let id = node_of_q(&m, &pkg);
    assert!(m.heap().is_root(id));
    assert_eq!(m.heap().node(id).unwrap().pointers, 1);

    // `p` is gone but `q` still reaches the item.
    assert_eq!(charge_of_empty_call(&mut m), idle);
    assert_eq!(m.heap().len(), 1);

    m.run_stmt(clear_q()).unwrap();
    assert!(!m.heap().is_root(id));
    let freed = AllocCosts::default().heap_item_size();
    assert_eq!(charge_of_empty_call(&mut m), idle - freed);
    assert!(m.heap().is_empty());
    m.check_empty().unwrap();
}

#[test]
fn returned_pointer_survives_the_callee() {
    let ptr_int = Type::pointer(Type::Int);
    let (mut m, pkg) = machine(vec![
        Slot::new("h", Type::func(vec![], vec![ptr_int.clone()])),
        Slot::new("g", Type::func(vec![], vec![])),
        Slot::new("q", ptr_int.clone()),
    ]);
    let h = func_decl(
        "h",
        vec![],
        vec![Slot::new("r", ptr_int)],
        vec![Slot::heap("x", Type::Int)],
        vec![
            Stmt::assign(vec![Expr::name("x", 1, 1)], vec![Expr::int(4)]),
            Stmt::ret(vec![Expr::reference(Expr::name("x", 1, 1))]),
        ],
    );
    declare(&mut m, &pkg, 0, h);
    declare(&mut m, &pkg, 1, func_decl("g", vec![], vec![], vec![], vec![]));
    let idle = charge_of_empty_call(&mut m);

    let q = Expr::name("q", 1, 2);
    m.run_stmt(Stmt::assign(
        vec![q.clone()],
        vec![Expr::call(Expr::name("h", 1, 0), vec![])],
    ))
    .unwrap();
    let id = node_of_q(&m, &pkg);
    assert!(m.heap().is_root(id));
    assert_eq!(charge_of_empty_call(&mut m), idle);
    assert_eq!(ints(&m.eval(Expr::star(q)).unwrap()), vec![4]);

    m.run_stmt(clear_q()).unwrap();
    let freed = AllocCosts::default().heap_item_size();
    assert_eq!(charge_of_empty_call(&mut m), idle - freed);
    assert!(m.heap().is_empty());
}

#[test]
fn sweep_after_deep_collection_releases_nothing_older() {
    let (mut m, _) = escape_to_package();
    let idle = charge_of_empty_call(&mut m);
    m.eval(Expr::call(Expr::name("f", 1, 0), vec![])).unwrap();
    assert_eq!(m.heap().len(), 1);

    // The pass recounts the item; dropping it afterwards must not release
    // it a second time.
    m.garbage_collect().unwrap();
    assert_eq!(m.alloc().collections(), 1);
    m.run_stmt(clear_q()).unwrap();
    assert_eq!(charge_of_empty_call(&mut m), idle);
    assert!(m.heap().is_empty());
}

#[test]
fn sweep_refuses_to_release_more_than_charged() {
    let (mut m, _) = escape_to_package();
    let stray = Rc::new(HeapItemValue::new(TypedValue::int(0)));
    let size = m.alloc().bytes() + 1_000_000;
    let epoch = m.alloc().collections();
    m.heap.track(stray, size, epoch);

    let err = m
        .eval(Expr::call(Expr::name("g", 1, 1), vec![]))
        .unwrap_err();
    assert!(matches!(err, VMError::NegativeAllocation { .. }));
    assert!(err.is_internal());
}

#[test]
fn staging_package_survives_collection() {
    let (mut m, _) = machine(vec![]);
    let staged = m
        .new_package("lib", "gno.land/p/lib", BlockNode::new(vec![int_slot("n")]), None)
        .unwrap();
    m.set_staging_package(Some(staged.clone()));
    m.garbage_collect().unwrap();
    let with_staged = m.alloc().bytes();

    m.set_staging_package(None);
    m.garbage_collect().unwrap();
    let costs = AllocCosts::default();
    assert_eq!(
        with_staged - m.alloc().bytes(),
        costs.package_size() + costs.block_size(1)
    );
}

#[test]
fn slicing_strings_keeps_bytes() {
    let (mut m, _) = machine(vec![]);
    let half = |lo: i64, hi: i64| {
        Expr::slice(Expr::string("é"), Some(Expr::int(lo)), Some(Expr::int(hi)))
    };
    let before = m.alloc().bytes();
    let out = m.eval(half(0, 1)).unwrap();
    assert_eq!(out[0].get_bytes(), b"\xc3");
    assert_eq!(m.alloc().bytes() - before, AllocCosts::default().string_size(1));

    let len = m.eval(Expr::call(builtin("len", 2), vec![half(0, 1)])).unwrap();
    assert_eq!(ints(&len), vec![1]);

    let joined = m.eval(bin(BinaryOp::Add, half(0, 1), half(1, 2))).unwrap();
    assert_eq!(joined[0].get_str(), "é");
}

#[test]
fn oversized_big_integers_panic_before_they_are_built() {
    let inert = MachineOptions {
        max_alloc_bytes: 0,
        ..MachineOptions::default()
    };
    let one = || Expr::constant(TypedValue::bigint(BigInt::from(1)));

    let (mut m, _) = machine_with(inert.clone(), vec![]);
    let err = m
        .eval(bin(BinaryOp::Shl, one(), Expr::int(i64::MAX)))
        .unwrap_err();
    assert_eq!(panic_descriptor(err), "panic: runtime error: big integer overflow");

    let (mut m, _) = machine_with(inert, vec![]);
    let out = m.eval(bin(BinaryOp::Shl, one(), Expr::int(100))).unwrap();
    assert_eq!(out[0].get_bigint(), BigInt::from(1) << 100u32);

    let (mut m, _) = machine(vec![]);
    let wide = || Expr::constant(TypedValue::bigint(BigInt::from(1) << 40_000u32));
    let err = m.eval(bin(BinaryOp::Mul, wide(), wide())).unwrap_err();
    assert_eq!(panic_descriptor(err), "panic: runtime error: big integer overflow");
}

#[test]
fn cycle_limit_stops_runaway_loop() {
    let options = MachineOptions {
        max_cycles: 500,
        ..MachineOptions::default()
    };
    let (mut m, _) = machine_with(options, vec![]);
    let err = m.run_stmt(infinite_loop()).unwrap_err();
    assert!(matches!(err, VMError::CpuCycleOverrun { limit: 500, .. }));
    assert!(err.is_exhaustion());
}

#[test]
fn gas_limit_stops_runaway_loop() {
    let (mut m, _) = machine(vec![]);
    m.set_gas_meter(Box::new(BasicGasMeter::new(1_000)));
    let err = m.run_stmt(infinite_loop()).unwrap_err();
    assert!(matches!(err, VMError::OutOfGas { limit: 1_000, .. }));
    assert_eq!(m.gas_meter().unwrap().remaining(), 0);
}

#[test]
fn allocation_limit_stops_unbounded_growth() {
    let options = MachineOptions {
        max_alloc_bytes: 20_000,
        ..MachineOptions::default()
    };
    let (mut m, _) = machine_with(options, vec![Slot::new("xs", Type::slice(Type::Int))]);
    let grow = Stmt::assign(
        vec![Expr::name("xs", 3, 0)],
        vec![Expr::call(
            builtin("append", 4),
            vec![Expr::name("xs", 3, 0), Expr::int(1)],
        )],
    );
    let stmt = Rc::new(Stmt::For(Rc::new(ForStmt {
        block: BlockNode::empty(),
        init: None,
        cond: None,
        post: None,
        body: body(vec![grow]),
    })));
    let err = m.run_stmt(stmt).unwrap_err();
    assert!(matches!(err, VMError::AllocationLimitExceeded { limit: 20_000, .. }));
    assert!(m.alloc().collections() > 0);
}

#[test]
fn collections_reclaim_garbage_and_charge_gas() {
    let options = MachineOptions {
        max_alloc_bytes: 20_000,
        ..MachineOptions::default()
    };
    let (mut m, _) = machine_with(options, vec![]);
    let profile = Rc::new(RefCell::new(GasProfile::new()));
    m.set_gas_meter(Box::new(SharedMeter {
        used: 0,
        profile: profile.clone(),
    }));
    let array_t = Type::array(4, Type::Int);
    let lit = Expr::composite(array_t.clone(), (1..=4).map(Expr::int).collect());
    let loop_body = Body::new(
        BlockNode::new(vec![Slot::new("t", array_t)]),
        vec![Stmt::define(vec![Expr::name("t", 1, 0)], vec![lit])],
    );
    m.run_stmt(counting_loop(Expr::int(300), loop_body)).unwrap();

    assert!(m.alloc().collections() > 0);
    assert!(m.alloc().bytes() <= 20_000);
    assert!(profile.borrow().get(GasCategory::GarbageCollection) > 0);
    m.check_empty().unwrap();
}

#[test]
fn explicit_collection_is_paid() {
    let (mut m, _) = machine(vec![int_slot("x")]);
    let profile = Rc::new(RefCell::new(GasProfile::new()));
    m.set_gas_meter(Box::new(SharedMeter {
        used: 0,
        profile: profile.clone(),
    }));
    let before = m.cycles();
    m.garbage_collect().unwrap();
    assert_eq!(m.alloc().collections(), 1);
    let gc_gas = profile.borrow().get(GasCategory::GarbageCollection);
    assert!(gc_gas > 0);
    assert_eq!(m.cycles() - before, gc_gas);
}

#[test]
fn stored_parent_is_loaded_once_and_charged() {
    let (mut m, pkg) = machine(vec![int_slot("x")]);
    let stored = Rc::new(Block::new(
        BlockNode::new(vec![int_slot("y")]),
        vec![TypedValue::int(99)],
        BlockParent::None,
    ));
    let mut store = MemStore::new();
    store.insert(ObjectId(7), stored, 100);
    m.set_store(Rc::new(store));
    pkg.block.set_parent(BlockParent::Stored(ObjectId(7)));

    let before = m.alloc().bytes();
    let y = Expr::name("y", 2, 0);
    assert_eq!(ints(&m.eval(y.clone()).unwrap()), vec![99]);
    let charged = m.alloc().bytes() - before;
    assert_eq!(charged, AllocCosts::default().amino_size(100));

    assert_eq!(ints(&m.eval(y).unwrap()), vec![99]);
    assert_eq!(m.alloc().bytes() - before, charged);
}

#[test]
fn missing_stored_parent_fails() {
    let (mut m, pkg) = machine(vec![]);
    pkg.block.set_parent(BlockParent::Stored(ObjectId(8)));
    let err = m.eval(Expr::name("y", 2, 0)).unwrap_err();
    assert!(matches!(err, VMError::MissingBlock(8)));
}

fn current_realm(m: &mut Machine, _args: Vec<TypedValue>) -> Result<Vec<TypedValue>, VMError> {
    let path = m.realm().map(|r| r.path.to_string()).unwrap_or_default();
    Ok(vec![TypedValue::string(&path)])
}

#[test]
fn calls_switch_realm_and_restore_it() {
    let mut m = Machine::new(MachineOptions::default());
    let home = realm("gno.land/r/home", 1);
    let other = realm("gno.land/r/other", 2);
    let a = m
        .new_package(
            "home",
            "gno.land/r/home",
            BlockNode::new(vec![Slot::new("which", Type::func(vec![], vec![Type::String]))]),
            Some(home.clone()),
        )
        .unwrap();
    let b = m
        .new_package(
            "other",
            "gno.land/r/other",
            BlockNode::new(vec![
                Slot::new("where", Type::func(vec![], vec![Type::String])),
                Slot::new("which", Type::func(vec![], vec![Type::String])),
            ]),
            Some(other),
        )
        .unwrap();
    let native = FuncValue::new(
        "where".into(),
        b.path.clone(),
        Rc::new(FuncType {
            params: vec![],
            results: vec![Type::String],
        }),
        FuncBody::Native(current_realm),
        vec![],
        None,
        Weak::new(),
    );
    let native = m.alloc_mut().new_func(native).unwrap();
    assert!(b.block.set(0, native));
    let which = func_decl(
        "which",
        vec![],
        vec![Slot::new("r", Type::String)],
        vec![],
        vec![Stmt::ret(vec![Expr::call(Expr::name("where", 2, 0), vec![])])],
    );
    declare(&mut m, &b, 1, which);
    assert!(a.block.set(0, b.block.get(1).unwrap()));

    m.set_active_package(a.clone());
    let out = m
        .eval(Expr::call(Expr::name("which", 1, 0), vec![]))
        .unwrap();
    assert_eq!(out[0].get_str(), "gno.land/r/other");
    assert!(Rc::ptr_eq(m.realm().unwrap(), &home));
    assert!(Rc::ptr_eq(&m.active_package().unwrap(), &a));
}

#[test]
fn observer_sees_allocation_sites() {
    let (mut m, pkg) = machine(vec![Slot::new("f", Type::func(vec![], vec![Type::String]))]);
    let f = func_decl(
        "f",
        vec![],
        vec![Slot::new("r", Type::String)],
        vec![],
        vec![Stmt::ret(vec![bin(
            BinaryOp::Add,
            Expr::string("a"),
            Expr::string("b"),
        )])],
    );
    declare(&mut m, &pkg, 0, f);
    let events = Rc::new(RefCell::new(Vec::new()));
    m.set_alloc_observer(Box::new(Recorder(events.clone())));
    m.eval(Expr::call(Expr::name("f", 1, 0), vec![])).unwrap();

    let events = events.borrow();
    let concat = events.iter().find(|e| e.kind == "string").unwrap();
    assert_eq!(concat.stack, vec!["main.f".to_string()]);
    assert!(m.take_alloc_observer().is_some());
}

#[test]
fn reset_clears_a_failed_run() {
    let (mut m, _) = machine(vec![]);
    m.eval(bin(BinaryOp::Quo, Expr::int(1), Expr::int(0)))
        .unwrap_err();
    assert!(matches!(
        m.check_empty(),
        Err(VMError::MachineNotEmpty { .. })
    ));
    m.reset();
    m.check_empty().unwrap();
    assert_eq!(m.alloc().bytes(), 0);
    assert_eq!(m.cycles(), 0);
    assert!(m.active_package().is_none());
}

#[test]
fn goroutines_are_not_supported() {
    let (mut m, _) = machine(vec![]);
    let stmt = Rc::new(Stmt::Go {
        func: builtin("len", 2),
        args: vec![],
    });
    let err = m.run_stmt(stmt).unwrap_err();
    assert!(matches!(err, VMError::NotImplemented { op: "go" }));
}

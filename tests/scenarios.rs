//! End-to-end scenarios straight out of spec §8: hand-built ASTs (no parser
//! in this core's scope, per spec §1) driven through the resolver, compiler,
//! and VM, exercising the same literal inputs/outputs the spec calls out by
//! number.

use std::rc::Rc;
use svm_core::ast::*;
use svm_core::runtime::{Options, Runtime};
use svm_core::span::Span;
use svm_core::{BuiltinRegistry, Compiler, ExecutionContext, Resolver, Value, Vm, VmConfig};

fn sp() -> Span {
    Span::dummy()
}

fn ident(name: &str, id: NodeId) -> Expr {
    Expr { kind: ExprKind::Ident { name: name.to_string(), id }, span: sp() }
}

fn int(n: i64) -> Expr {
    Expr { kind: ExprKind::Int(n), span: sp() }
}

fn string(s: &str) -> Expr {
    Expr { kind: ExprKind::Str(s.to_string()), span: sp() }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, span: sp() }
}

fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr { kind: ExprKind::Call { callee: Box::new(callee), args }, span: sp() }
}

/// `print` isn't a core opcode reachable from source (spec §1: parsing is
/// out of scope, and this core's AST has no dedicated print statement) — it
/// is an ordinary call to a global the host binds to a builtin, exactly like
/// any other host service (spec §6's built-in call contract).
fn print_call(arg: Expr) -> Expr {
    call(ident("print", 9000), vec![arg])
}

fn expr_stmt(e: Expr) -> Stmt {
    Stmt { kind: StmtKind::Expr(e), span: sp() }
}

fn let_stmt(name: &str, id: NodeId, init: Expr) -> Stmt {
    Stmt { kind: StmtKind::Let { name: name.to_string(), id, is_const: false, init: Some(init) }, span: sp() }
}

fn return_stmt(e: Option<Expr>) -> Stmt {
    Stmt { kind: StmtKind::Return(e), span: sp() }
}

fn run(program: Program) -> Value {
    let runtime = Runtime::new(Options::default());
    let mut host: () = ();
    runtime.run_source(&program, "<test>", &mut host).expect("program runs without error")
}

/// Record every `print(...)` call into the host's `Vec<String>` instead of
/// stdout, so the scenario tests can assert on ordering directly.
fn record_print(args: &[Value], ctx: &mut ExecutionContext) -> Value {
    let text = args.first().map(Value::to_display_string).unwrap_or_default();
    if let Some(sink) = ctx.host.downcast_mut::<Vec<String>>() {
        sink.push(text);
    }
    Value::Null
}

/// Resolve and compile `program`, wiring a `print` global onto a builtin
/// that records into the `Vec<String>` host instead of printing to stdout,
/// then run it to completion.
fn run_capturing_prints(program: Program) -> (Value, Vec<String>) {
    let resolutions = Resolver::new().resolve_program(&program).expect("program resolves without error");
    let mut registry = BuiltinRegistry::new();
    let print_id = registry.register("print", record_print);
    let compiler = Compiler::new(&resolutions, "<test>", Some(&registry));
    let prototype = compiler.compile_program(&program).expect("program compiles without error");

    let mut host: Vec<String> = Vec::new();
    let mut vm = Vm::new(Some(&registry), &mut host, VmConfig::default());
    vm.set_global("print", Value::BuiltinFn(print_id));
    let result = vm.run_script(Rc::new(prototype)).expect("program runs without error");
    (result, host)
}

/// Scenario 1: `let x = (10 + 20) * 3 - 5;` -> x = 85 as I32, returned.
#[test]
fn arithmetic_mix_scenario() {
    let program = Program {
        statements: vec![
            let_stmt(
                "x",
                1,
                binary(
                    BinaryOp::Sub,
                    binary(BinaryOp::Mul, binary(BinaryOp::Add, int(10), int(20)), int(3)),
                    int(5),
                ),
            ),
            return_stmt(Some(ident("x", 1))),
        ],
    };
    assert_eq!(run(program), Value::I32(85));
}

/// Scenario 2: division always widens to F64, modulo always returns I64, and
/// integer division by zero is a `DivisionByZero` runtime error rather than
/// IEEE infinity (spec §8 scenario 2, resolved per §9's open question).
#[test]
fn division_scenario() {
    let program = Program {
        statements: vec![return_stmt(Some(binary(BinaryOp::Div, int(100), int(4))))],
    };
    assert_eq!(run(program), Value::F64(25.0));

    let modulo_program = Program {
        statements: vec![return_stmt(Some(binary(BinaryOp::Mod, int(17), int(5))))],
    };
    assert_eq!(run(modulo_program), Value::I64(2));

    let div_by_zero = Program {
        statements: vec![return_stmt(Some(binary(BinaryOp::Div, int(1), int(0))))],
    };
    let runtime = Runtime::new(Options::default());
    let mut host: () = ();
    let err = runtime.run_source(&div_by_zero, "<test>", &mut host).unwrap_err();
    match err {
        svm_core::CoreError::Runtime(e) => {
            assert_eq!(e.kind, svm_core::RuntimeErrorKind::DivisionByZero);
        }
        other => panic!("expected a runtime DivisionByZero error, got {other:?}"),
    }
}

/// Scenario 3: a closure capturing a local survives its enclosing frame's
/// return; each call mutates the shared, closed-over counter.
///
/// ```text
/// fn make() { let n = 0; return fn() { n = n + 1; return n } }
/// let c = make(); c(); c(); c()
/// ```
#[test]
fn closure_counter_scenario() {
    let inner = FunctionLit {
        name: None,
        params: vec![],
        is_variadic: false,
        is_async: false,
        body: vec![
            Stmt {
                kind: StmtKind::Expr(Expr {
                    kind: ExprKind::Assign {
                        target: Box::new(AssignTarget::Ident { name: "n".to_string(), id: 10 }),
                        value: Box::new(binary(BinaryOp::Add, ident("n", 10), int(1))),
                    },
                    span: sp(),
                }),
                span: sp(),
            },
            return_stmt(Some(ident("n", 10))),
        ],
        span: sp(),
    };

    let make_body = vec![
        let_stmt("n", 10, int(0)),
        return_stmt(Some(Expr { kind: ExprKind::FunctionLit(inner), span: sp() })),
    ];

    let make_decl = Stmt {
        kind: StmtKind::FunctionDecl {
            name: "make".to_string(),
            id: 11,
            function: FunctionLit {
                name: Some("make".to_string()),
                params: vec![],
                is_variadic: false,
                is_async: false,
                body: make_body,
                span: sp(),
            },
        },
        span: sp(),
    };

    let program = Program {
        statements: vec![
            make_decl,
            let_stmt("c", 12, call(ident("make", 11), vec![])),
            expr_stmt(call(ident("c", 12), vec![])),
            expr_stmt(call(ident("c", 12), vec![])),
            return_stmt(Some(call(ident("c", 12), vec![]))),
        ],
    };

    assert_eq!(run(program), Value::I64(3));
}

/// Scenario 4: defers run LIFO during exception unwinding, before the catch
/// handler body runs.
///
/// ```text
/// try { defer print("A"); defer print("B"); throw "oops" } catch (e) { print(e) }
/// ```
/// -> prints "B", "A", "oops"
#[test]
fn defer_on_exception_scenario() {
    let program = Program {
        statements: vec![Stmt {
            kind: StmtKind::Try {
                body: vec![
                    Stmt { kind: StmtKind::Defer(print_call(string("A"))), span: sp() },
                    Stmt { kind: StmtKind::Defer(print_call(string("B"))), span: sp() },
                    Stmt { kind: StmtKind::Throw(string("oops")), span: sp() },
                ],
                catch: Some(CatchClause {
                    binding: Some("e".to_string()),
                    binding_id: 20,
                    body: vec![expr_stmt(print_call(ident("e", 20)))],
                }),
                finally: None,
            },
            span: sp(),
        }],
    };

    let (_, prints) = run_capturing_prints(program);
    assert_eq!(prints, vec!["B".to_string(), "A".to_string(), "oops".to_string()]);
}

/// Scenario 5: `break` drains defers pushed up to that point, in LIFO order,
/// before leaving the loop.
///
/// ```text
/// for (let i=0; i<10; i=i+1) { defer print("d"+i); if (i == 2) break }
/// ```
/// -> prints "d0", "d1", "d2"
#[test]
fn break_with_defer_scenario() {
    let program = Program {
        statements: vec![Stmt {
            kind: StmtKind::For {
                init: Some(Box::new(let_stmt("i", 30, int(0)))),
                cond: Some(binary(BinaryOp::Lt, ident("i", 30), int(10))),
                step: Some(Expr {
                    kind: ExprKind::Assign {
                        target: Box::new(AssignTarget::Ident { name: "i".to_string(), id: 30 }),
                        value: Box::new(binary(BinaryOp::Add, ident("i", 30), int(1))),
                    },
                    span: sp(),
                }),
                body: vec![
                    Stmt {
                        kind: StmtKind::Defer(print_call(binary(BinaryOp::Concat, string("d"), ident("i", 30)))),
                        span: sp(),
                    },
                    Stmt {
                        kind: StmtKind::If {
                            cond: binary(BinaryOp::Eq, ident("i", 30), int(2)),
                            then_branch: vec![Stmt { kind: StmtKind::Break, span: sp() }],
                            else_branch: None,
                        },
                        span: sp(),
                    },
                ],
            },
            span: sp(),
        }],
    };

    let (_, prints) = run_capturing_prints(program);
    assert_eq!(prints, vec!["d0".to_string(), "d1".to_string(), "d2".to_string()]);
}

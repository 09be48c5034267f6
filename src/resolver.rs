//! Lexical-scope resolution pass (spec §4.1).
//!
//! Walks the whole AST once, before compilation starts, and records for
//! every identifier-bearing node whether it is a local of the function
//! being compiled, a variable captured from an enclosing function
//! (an upvalue, at some function-nesting depth), or a global resolved by
//! name at runtime. Conclusions are written into a [`ResolutionMap`] keyed
//! by [`NodeId`] (EXPANSION 4.7) rather than mutating the tree, so the
//! compiler can stay a pure consumer of `(AST, ResolutionMap)`.
//!
//! Top-level (script-level) bindings are never resolved to `Local` — per
//! spec §4.1, "top-level names remain Unresolved so they go through the
//! global-by-name path" — so a name declared outside any function scope is
//! always [`Resolution::Global`], and nested functions cannot capture it as
//! an upvalue (there is nothing to capture; it's a VM global).

use crate::ast::*;
use std::collections::HashMap;

/// What a name reference resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A local of the function currently being compiled.
    Local,
    /// Captured from an enclosing function `depth` function-nestings up
    /// (`depth >= 1`). The compiler resolves the exact upvalue chain via
    /// its own enclosing-compiler walk (spec §4.4); this only tells it
    /// "look outward," not which register.
    Upvalue(u32),
    /// Not found in any enclosing function scope: a global, resolved by
    /// name at runtime.
    Global,
}

/// Per-node resolver output, consumed read-only by the compiler.
#[derive(Debug, Clone, Default)]
pub struct ResolutionMap {
    entries: HashMap<NodeId, Resolution>,
}

impl ResolutionMap {
    pub fn get(&self, id: NodeId) -> Resolution {
        self.entries.get(&id).copied().unwrap_or(Resolution::Global)
    }

    fn insert(&mut self, id: NodeId, resolution: Resolution) {
        self.entries.insert(id, resolution);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One function's scope stack: a stack of blocks, each a list of names
/// declared directly in that block.
struct FunctionScope {
    blocks: Vec<Vec<String>>,
}

impl FunctionScope {
    fn new() -> Self {
        Self {
            blocks: vec![Vec::new()],
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.blocks.iter().rev().any(|block| block.iter().any(|n| n == name))
    }
}

/// A resolution-time error: a duplicate declaration in the same block
/// (spec §7 "variable already declared"), `break`/`continue` outside a
/// loop, or similar structural problems the resolver is positioned to
/// catch before the compiler ever runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverError {
    pub message: String,
}

pub struct Resolver {
    /// Empty while resolving top-level statements; one entry per
    /// currently-open function scope while inside nested function literals.
    functions: Vec<FunctionScope>,
    loop_depth: u32,
    map: ResolutionMap,
    errors: Vec<ResolverError>,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            loop_depth: 0,
            map: ResolutionMap::default(),
            errors: Vec::new(),
        }
    }

    pub fn resolve_program(mut self, program: &Program) -> Result<ResolutionMap, Vec<ResolverError>> {
        for stmt in &program.statements {
            self.resolve_stmt(stmt);
        }
        if self.errors.is_empty() {
            Ok(self.map)
        } else {
            Err(self.errors)
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(ResolverError {
            message: message.into(),
        });
    }

    fn enter_scope(&mut self) {
        if let Some(f) = self.functions.last_mut() {
            f.blocks.push(Vec::new());
        }
    }

    fn exit_scope(&mut self) {
        if let Some(f) = self.functions.last_mut() {
            f.blocks.pop();
        }
    }

    fn define(&mut self, name: &str) {
        if let Some(f) = self.functions.last_mut() {
            if f.blocks.last().unwrap().iter().any(|n| n == name) {
                self.error(format!("variable '{name}' already declared in this scope"));
                return;
            }
            f.blocks.last_mut().unwrap().push(name.to_string());
        }
    }

    fn lookup(&self, name: &str) -> Resolution {
        if self.functions.is_empty() {
            return Resolution::Global;
        }
        let current = self.functions.len() - 1;
        if self.functions[current].contains(name) {
            return Resolution::Local;
        }
        let mut depth = 1u32;
        let mut i = current;
        while i > 0 {
            i -= 1;
            if self.functions[i].contains(name) {
                return Resolution::Upvalue(depth);
            }
            depth += 1;
        }
        Resolution::Global
    }

    fn resolve_ident_use(&mut self, id: NodeId, name: &str) {
        let resolution = self.lookup(name);
        self.map.insert(id, resolution);
    }

    fn resolve_block(&mut self, stmts: &[Stmt]) {
        self.enter_scope();
        for stmt in stmts {
            self.resolve_stmt(stmt);
        }
        self.exit_scope();
    }

    fn resolve_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(e) => self.resolve_expr(e),
            StmtKind::Let { name, id, init, .. } => {
                if let Some(init) = init {
                    self.resolve_expr(init);
                }
                self.define(name);
                // The declaration site resolves to whatever scope it lands
                // in: Local inside a function, Global at top level.
                self.map.insert(*id, self.lookup(name));
            }
            StmtKind::Block(body) => self.resolve_block(body),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.resolve_expr(cond);
                self.resolve_block(then_branch);
                if let Some(else_branch) = else_branch {
                    self.resolve_block(else_branch);
                }
            }
            StmtKind::While { cond, body } => {
                self.resolve_expr(cond);
                self.loop_depth += 1;
                // `while` opens exactly one scope (spec §4.1).
                self.resolve_block(body);
                self.loop_depth -= 1;
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                // Outer scope holds the loop variable.
                self.enter_scope();
                if let Some(init) = init {
                    self.resolve_stmt(init);
                }
                if let Some(cond) = cond {
                    self.resolve_expr(cond);
                }
                if let Some(step) = step {
                    self.resolve_expr(step);
                }
                self.loop_depth += 1;
                // Inner scope is the body, cleared each iteration.
                self.resolve_block(body);
                self.loop_depth -= 1;
                self.exit_scope();
            }
            StmtKind::ForIn {
                binding,
                binding_id,
                iterable,
                body,
            } => {
                // Evaluated in the parent scope.
                self.resolve_expr(iterable);
                self.enter_scope();
                self.define(binding);
                self.map.insert(*binding_id, self.lookup(binding));
                self.loop_depth += 1;
                self.resolve_block(body);
                self.loop_depth -= 1;
                self.exit_scope();
            }
            StmtKind::FunctionDecl { name, id, function } => {
                self.define(name);
                self.map.insert(*id, self.lookup(name));
                self.resolve_function(function);
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.resolve_expr(value);
                }
            }
            StmtKind::Break => {
                if self.loop_depth == 0 {
                    self.error("'break' outside loop");
                }
            }
            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    self.error("'continue' outside loop");
                }
            }
            StmtKind::Throw(value) => self.resolve_expr(value),
            StmtKind::Try {
                body,
                catch,
                finally,
            } => {
                self.resolve_block(body);
                if let Some(clause) = catch {
                    // try opens a fresh scope for the catch binding only.
                    self.enter_scope();
                    if let Some(binding) = &clause.binding {
                        self.define(binding);
                        self.map.insert(clause.binding_id, self.lookup(binding));
                    }
                    for stmt in &clause.body {
                        self.resolve_stmt(stmt);
                    }
                    self.exit_scope();
                }
                if let Some(finally) = finally {
                    self.resolve_block(finally);
                }
            }
            StmtKind::Defer(call) => self.resolve_expr(call),
            StmtKind::Import {
                binding, binding_id, ..
            } => {
                self.define(binding);
                self.map.insert(*binding_id, self.lookup(binding));
            }
            StmtKind::Export { value, .. } => self.resolve_expr(value),
        }
    }

    fn resolve_function(&mut self, function: &FunctionLit) {
        self.functions.push(FunctionScope::new());
        let outer_loop_depth = self.loop_depth;
        self.loop_depth = 0;
        for param in &function.params {
            self.define(&param.name);
            self.map.insert(param.id, self.lookup(&param.name));
        }
        for stmt in &function.body {
            self.resolve_stmt(stmt);
        }
        self.loop_depth = outer_loop_depth;
        self.functions.pop();
    }

    fn resolve_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Null
            | ExprKind::Bool(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Rune(_)
            | ExprKind::Str(_) => {}
            ExprKind::Ident { name, id } => self.resolve_ident_use(*id, name),
            ExprKind::Assign { target, value } => {
                self.resolve_expr(value);
                match target.as_ref() {
                    AssignTarget::Ident { name, id } => self.resolve_ident_use(*id, name),
                    AssignTarget::Index { receiver, index } => {
                        self.resolve_expr(receiver);
                        self.resolve_expr(index);
                    }
                    AssignTarget::Field { receiver, .. } => self.resolve_expr(receiver),
                }
            }
            ExprKind::Binary { left, right, .. } => {
                self.resolve_expr(left);
                self.resolve_expr(right);
            }
            ExprKind::Logical { left, right, .. } => {
                self.resolve_expr(left);
                self.resolve_expr(right);
            }
            ExprKind::Unary { operand, .. } => self.resolve_expr(operand),
            ExprKind::Call { callee, args } => {
                self.resolve_expr(callee);
                for arg in args {
                    self.resolve_expr(arg);
                }
            }
            ExprKind::Index { receiver, index } => {
                self.resolve_expr(receiver);
                self.resolve_expr(index);
            }
            ExprKind::Field { receiver, .. } => self.resolve_expr(receiver),
            ExprKind::ArrayLit(items) => {
                for item in items {
                    self.resolve_expr(item);
                }
            }
            ExprKind::ObjectLit(fields) => {
                for (_, value) in fields {
                    self.resolve_expr(value);
                }
            }
            ExprKind::FunctionLit(function) => self.resolve_function(function),
            ExprKind::TypeOf(value) => self.resolve_expr(value),
            ExprKind::Cast { value, .. } => self.resolve_expr(value),
            ExprKind::InstanceOf { value, .. } => self.resolve_expr(value),
            ExprKind::Spawn { callee, args } => {
                self.resolve_expr(callee);
                for arg in args {
                    self.resolve_expr(arg);
                }
            }
            ExprKind::Await(value) => self.resolve_expr(value),
            ExprKind::Yield(value) => self.resolve_expr(value),
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;

    fn ident(name: &str, id: NodeId) -> Expr {
        Expr {
            kind: ExprKind::Ident {
                name: name.to_string(),
                id,
            },
            span: Span::dummy(),
        }
    }

    #[test]
    fn top_level_let_is_global_not_local() {
        let program = Program {
            statements: vec![Stmt {
                kind: StmtKind::Let {
                    name: "x".into(),
                    id: 1,
                    is_const: false,
                    init: Some(Expr {
                        kind: ExprKind::Int(1),
                        span: Span::dummy(),
                    }),
                },
                span: Span::dummy(),
            }],
        };
        let map = Resolver::new().resolve_program(&program).unwrap();
        assert_eq!(map.get(1), Resolution::Global);
    }

    #[test]
    fn local_inside_function_resolves_local() {
        let function = FunctionLit {
            name: None,
            params: vec![],
            is_variadic: false,
            is_async: false,
            body: vec![
                Stmt {
                    kind: StmtKind::Let {
                        name: "n".into(),
                        id: 10,
                        is_const: false,
                        init: None,
                    },
                    span: Span::dummy(),
                },
                Stmt {
                    kind: StmtKind::Expr(ident("n", 11)),
                    span: Span::dummy(),
                },
            ],
            span: Span::dummy(),
        };
        let program = Program {
            statements: vec![Stmt {
                kind: StmtKind::Expr(Expr {
                    kind: ExprKind::FunctionLit(function),
                    span: Span::dummy(),
                }),
                span: Span::dummy(),
            }],
        };
        let map = Resolver::new().resolve_program(&program).unwrap();
        assert_eq!(map.get(11), Resolution::Local);
    }

    #[test]
    fn closure_over_outer_local_is_upvalue() {
        let inner = FunctionLit {
            name: None,
            params: vec![],
            is_variadic: false,
            is_async: false,
            body: vec![Stmt {
                kind: StmtKind::Expr(ident("n", 20)),
                span: Span::dummy(),
            }],
            span: Span::dummy(),
        };
        let outer = FunctionLit {
            name: None,
            params: vec![],
            is_variadic: false,
            is_async: false,
            body: vec![
                Stmt {
                    kind: StmtKind::Let {
                        name: "n".into(),
                        id: 1,
                        is_const: false,
                        init: None,
                    },
                    span: Span::dummy(),
                },
                Stmt {
                    kind: StmtKind::Return(Some(Expr {
                        kind: ExprKind::FunctionLit(inner),
                        span: Span::dummy(),
                    })),
                    span: Span::dummy(),
                },
            ],
            span: Span::dummy(),
        };
        let program = Program {
            statements: vec![Stmt {
                kind: StmtKind::Expr(Expr {
                    kind: ExprKind::FunctionLit(outer),
                    span: Span::dummy(),
                }),
                span: Span::dummy(),
            }],
        };
        let map = Resolver::new().resolve_program(&program).unwrap();
        assert_eq!(map.get(20), Resolution::Upvalue(1));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let program = Program {
            statements: vec![Stmt {
                kind: StmtKind::Break,
                span: Span::dummy(),
            }],
        };
        let errors = Resolver::new().resolve_program(&program).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn duplicate_local_declaration_is_an_error() {
        let function = FunctionLit {
            name: None,
            params: vec![],
            is_variadic: false,
            is_async: false,
            body: vec![
                Stmt {
                    kind: StmtKind::Let {
                        name: "x".into(),
                        id: 1,
                        is_const: false,
                        init: None,
                    },
                    span: Span::dummy(),
                },
                Stmt {
                    kind: StmtKind::Let {
                        name: "x".into(),
                        id: 2,
                        is_const: false,
                        init: None,
                    },
                    span: Span::dummy(),
                },
            ],
            span: Span::dummy(),
        };
        let program = Program {
            statements: vec![Stmt {
                kind: StmtKind::Expr(Expr {
                    kind: ExprKind::FunctionLit(function),
                    span: Span::dummy(),
                }),
                span: Span::dummy(),
            }],
        };
        let errors = Resolver::new().resolve_program(&program).unwrap_err();
        assert!(!errors.is_empty());
    }
}

//! Statement compilation: scopes, control flow, loops, functions, and the
//! exception/defer machinery (spec §4.4).

use super::{FunctionState, LoopCtx};
use crate::ast::*;
use crate::chunk::Prototype;
use crate::opcode::{Instruction, Opcode};
use crate::span::Span;

impl<'a> super::Compiler<'a> {
    pub(super) fn compile_stmt(&mut self, stmt: &Stmt) {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Expr(e) => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(e, r);
                self.free_to(mark);
            }
            StmtKind::Let { name, id, is_const, init } => {
                self.compile_let(name, *id, *is_const, init.as_ref(), span);
            }
            StmtKind::Block(body) => {
                self.begin_scope();
                for s in body {
                    self.compile_stmt(s);
                }
                self.end_scope(span);
            }
            StmtKind::If { cond, then_branch, else_branch } => {
                self.compile_if(cond, then_branch, else_branch.as_deref(), span);
            }
            StmtKind::While { cond, body } => self.compile_while(cond, body, span),
            StmtKind::For { init, cond, step, body } => {
                self.compile_for(init.as_deref(), cond.as_ref(), step.as_ref(), body, span);
            }
            StmtKind::ForIn { binding, binding_id, iterable, body } => {
                self.compile_for_in(binding, *binding_id, iterable, body, span);
            }
            StmtKind::FunctionDecl { name, id, function } => {
                self.compile_function_decl(name, *id, function, span);
            }
            StmtKind::Return(value) => self.compile_return(value.as_ref(), span),
            StmtKind::Break => self.compile_break(span),
            StmtKind::Continue => self.compile_continue(span),
            StmtKind::Throw(value) => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(value, r);
                self.emit(Instruction::encode_a(Opcode::Throw, r), span);
                self.free_to(mark);
            }
            StmtKind::Try { body, catch, finally } => self.compile_try(body, catch.as_ref(), finally.as_deref(), span),
            StmtKind::Defer(call) => self.compile_defer(call, span),
            StmtKind::Import { path, binding, binding_id } => {
                self.compile_import(path, binding, *binding_id, span);
            }
            StmtKind::Export { name, value } => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(value, r);
                let k = self.add_string_constant(name);
                self.emit(Instruction::encode_abx(Opcode::Export, r, k), span);
                self.free_to(mark);
            }
        }
        self.end_statement();
    }

    fn compile_let(&mut self, name: &str, _id: NodeId, is_const: bool, init: Option<&Expr>, span: Span) {
        self.declare_binding(name, is_const, span, |c, r| match init {
            Some(init) => c.compile_expr(init, r),
            None => {
                c.emit(Instruction::encode_a(Opcode::LoadNull, r), span);
            }
        });
    }

    fn compile_if(&mut self, cond: &Expr, then_branch: &[Stmt], else_branch: Option<&[Stmt]>, span: Span) {
        let mark = self.register_mark();
        let r = self.alloc_reg(span);
        self.compile_expr(cond, r);
        self.free_to(mark);
        let else_jump = self.emit_jump(Opcode::JmpIfFalse, r, span);

        self.begin_scope();
        for s in then_branch {
            self.compile_stmt(s);
        }
        self.end_scope(span);

        if let Some(else_branch) = else_branch {
            let end_jump = self.emit_jump(Opcode::Jmp, 0, span);
            self.patch_jump(else_jump);
            self.begin_scope();
            for s in else_branch {
                self.compile_stmt(s);
            }
            self.end_scope(span);
            self.patch_jump(end_jump);
        } else {
            self.patch_jump(else_jump);
        }
    }

    /// `while` opens exactly one scope for its body (spec §4.1). The
    /// condition check, the body, and the `DeferExecAll; Loop` epilogue
    /// that both normal fallthrough and `continue` converge on.
    fn compile_while(&mut self, cond: &Expr, body: &[Stmt], span: Span) {
        let loop_start = self.current_offset();
        let mark = self.register_mark();
        let r = self.alloc_reg(span);
        self.compile_expr(cond, r);
        self.free_to(mark);
        let exit_jump = self.emit_jump(Opcode::JmpIfFalse, r, span);

        self.current_mut().loops.push(LoopCtx { continue_jumps: Vec::new(), break_jumps: Vec::new() });
        self.begin_scope();
        for s in body {
            self.compile_stmt(s);
        }
        self.end_scope(span);

        let loop_ctx = self.current_mut().loops.pop().unwrap();
        for jump in loop_ctx.continue_jumps {
            self.patch_jump(jump);
        }
        self.emit(Instruction::encode_a(Opcode::DeferExecAll, 0), span);
        self.emit_loop(loop_start, span);

        self.patch_jump(exit_jump);
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    /// Classic C-style `for`. Opens two nested scopes: the outer holds the
    /// loop variable, the inner is the body (re-entered each iteration).
    /// `continue` must still run the increment step, so its jump target is
    /// the increment's offset, patched after the increment is compiled.
    fn compile_for(&mut self, init: Option<&Stmt>, cond: Option<&Expr>, step: Option<&Expr>, body: &[Stmt], span: Span) {
        self.begin_scope();
        if let Some(init) = init {
            self.compile_stmt(init);
        }

        let cond_start = self.current_offset();
        let exit_jump = cond.map(|cond| {
            let mark = self.register_mark();
            let r = self.alloc_reg(span);
            self.compile_expr(cond, r);
            self.free_to(mark);
            self.emit_jump(Opcode::JmpIfFalse, r, span)
        });

        self.current_mut().loops.push(LoopCtx { continue_jumps: Vec::new(), break_jumps: Vec::new() });
        self.begin_scope();
        for s in body {
            self.compile_stmt(s);
        }
        self.end_scope(span);

        let loop_ctx = self.current_mut().loops.pop().unwrap();
        for jump in loop_ctx.continue_jumps {
            self.patch_jump(jump);
        }
        self.emit(Instruction::encode_a(Opcode::DeferExecAll, 0), span);
        if let Some(step) = step {
            let mark = self.register_mark();
            let r = self.alloc_reg(span);
            self.compile_expr(step, r);
            self.free_to(mark);
        }
        self.emit_loop(cond_start, span);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
        }
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope(span);
    }

    /// `for (binding in iterable)`. The iterable is evaluated once in the
    /// parent scope; iteration itself is lowered to the reserved-name
    /// iterator-protocol builtins (`__iter`/`__iter_has_next`/`__iter_next`)
    /// resolved through the host's [`crate::builtins::BuiltinRegistry`]
    /// (spec §1 places collection iteration out of the core's scope).
    fn compile_for_in(&mut self, binding: &str, _binding_id: NodeId, iterable: &Expr, body: &[Stmt], span: Span) {
        self.begin_scope();
        let iter_slot = self.declare_local("<iter>", true, span);
        self.compile_iter_call("__iter", iterable, iter_slot, span);
        let local_index = self.current().locals.len() - 1;
        self.define_local(local_index);

        let cond_start = self.current_offset();
        let mark = self.register_mark();
        let has_next = self.alloc_reg(span);
        self.compile_iter_call_from_reg("__iter_has_next", iter_slot, has_next, span);
        self.free_to(mark);
        let exit_jump = self.emit_jump(Opcode::JmpIfFalse, has_next, span);

        self.current_mut().loops.push(LoopCtx { continue_jumps: Vec::new(), break_jumps: Vec::new() });
        self.begin_scope();
        self.declare_binding(binding, false, span, |c, r| {
            c.compile_iter_call_from_reg("__iter_next", iter_slot, r, span);
        });
        for s in body {
            self.compile_stmt(s);
        }
        self.end_scope(span);

        let loop_ctx = self.current_mut().loops.pop().unwrap();
        for jump in loop_ctx.continue_jumps {
            self.patch_jump(jump);
        }
        self.emit(Instruction::encode_a(Opcode::DeferExecAll, 0), span);
        self.emit_loop(cond_start, span);

        self.patch_jump(exit_jump);
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope(span);
    }

    fn compile_iter_call(&mut self, builtin: &str, arg: &Expr, dest: u8, span: Span) {
        let Some(id) = self.resolve_builtin(builtin, span) else { return };
        let mark = self.register_mark();
        let base = self.alloc_reg(span);
        let arg_reg = self.alloc_reg(span);
        self.compile_expr(arg, arg_reg);
        self.emit(Instruction::encode_abc(Opcode::CallBuiltin, base, id.0 as u8, 1), span);
        if base != dest {
            self.emit(Instruction::encode_ab(Opcode::Move, dest, base), span);
        }
        self.free_to(mark.max(dest + 1));
    }

    fn compile_iter_call_from_reg(&mut self, builtin: &str, arg_slot: u8, dest: u8, span: Span) {
        let Some(id) = self.resolve_builtin(builtin, span) else { return };
        let mark = self.register_mark();
        let base = self.alloc_reg(span);
        let arg_reg = self.alloc_reg(span);
        self.emit(Instruction::encode_abx(Opcode::LoadLocal, arg_reg, arg_slot as u16), span);
        self.emit(Instruction::encode_abc(Opcode::CallBuiltin, base, id.0 as u8, 1), span);
        if base != dest {
            self.emit(Instruction::encode_ab(Opcode::Move, dest, base), span);
        }
        self.free_to(mark.max(dest + 1));
    }

    fn compile_function_decl(&mut self, name: &str, _id: NodeId, function: &FunctionLit, span: Span) {
        self.declare_binding(name, false, span, |c, r| c.compile_function_lit(function, r));
    }

    /// Compile a function literal into a child [`Prototype`] and emit
    /// `MakeClosure` to instantiate it into `dest` (spec §4.4 "Function
    /// literals").
    pub(super) fn compile_function_lit(&mut self, function: &FunctionLit, dest: u8) {
        let span = function.span;
        let name = function.name.clone().unwrap_or_else(|| "<anonymous>".to_string());
        self.functions.push(FunctionState::new(name, self.source_file.clone()));
        {
            let state = self.current_mut();
            state.proto.arity = function.params.len() as u8;
            state.proto.is_variadic = function.is_variadic;
            state.proto.is_async = function.is_async;
        }

        for param in &function.params {
            let slot = self.declare_local(&param.name, false, span);
            let local_index = self.current().locals.len() - 1;
            self.define_local(local_index);
            debug_assert_eq!(slot, local_index as u8);
        }

        for s in &function.body {
            self.compile_stmt(s);
        }

        // Implicit `return null` if the body falls through.
        let r = self.alloc_reg(span);
        self.emit(Instruction::encode_a(Opcode::LoadNull, r), span);
        self.emit(Instruction::encode_ab(Opcode::Return, r, 1), span);

        let mut state = self.functions.pop().expect("pushed function state above");
        state.proto.max_stack_size = state.max_register;
        let upvalue_count = state.proto.upvalues.len();
        let proto: Prototype = state.proto;
        let child_index = self.current_mut().proto.add_child(proto);

        self.emit(Instruction::encode_abx(Opcode::MakeClosure, dest, child_index), span);
        let _ = upvalue_count;
    }

    fn compile_return(&mut self, value: Option<&Expr>, span: Span) {
        // Tail-call optimization: `return f(...)` emits `TailCall` instead
        // of `Call` + `Return` when the returned expression is a direct
        // call (spec §4.4 "cooperative return/tail-call semantics").
        if let Some(Expr { kind: ExprKind::Call { callee, args }, .. }) = value {
            let mark = self.register_mark();
            let base = self.alloc_reg(span);
            self.compile_expr(callee, base);
            for arg in args {
                let r = self.alloc_reg(span);
                self.compile_expr(arg, r);
            }
            self.emit(Instruction::encode_abc(Opcode::TailCall, base, args.len() as u8, 1), span);
            self.free_to(mark);
            return;
        }

        let mark = self.register_mark();
        let r = self.alloc_reg(span);
        match value {
            Some(e) => self.compile_expr(e, r),
            None => {
                self.emit(Instruction::encode_a(Opcode::LoadNull, r), span);
            }
        }
        self.emit(Instruction::encode_ab(Opcode::Return, r, 1), span);
        self.free_to(mark);
    }

    fn compile_break(&mut self, span: Span) {
        if self.current().loops.is_empty() {
            self.error("'break' outside loop", span);
            return;
        }
        self.emit(Instruction::encode_a(Opcode::DeferExecAll, 0), span);
        let jump = self.emit_jump(Opcode::Jmp, 0, span);
        self.current_mut().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn compile_continue(&mut self, span: Span) {
        if self.current().loops.is_empty() {
            self.error("'continue' outside loop", span);
            return;
        }
        let jump = self.emit_jump(Opcode::Jmp, 0, span);
        self.current_mut().loops.last_mut().unwrap().continue_jumps.push(jump);
    }

    /// `try`/`catch`/`finally` (spec §4.4, §4.6). `TryBegin` carries the
    /// catch target; `Catch` (executed at the jump target) retrieves the
    /// pending exception into a register, implicitly clearing the VM's
    /// exception state. `finally` is compiled once, covering both normal
    /// completion and the caught-exception path; a `return`/`break`/
    /// `continue` that exits the try body early does not re-run it (a
    /// documented simplification, see DESIGN.md).
    fn compile_try(&mut self, body: &[Stmt], catch: Option<&CatchClause>, finally: Option<&[Stmt]>, span: Span) {
        let try_begin = self.emit(Instruction::encode_asbx(Opcode::TryBegin, 0, 0), span);

        self.begin_scope();
        for s in body {
            self.compile_stmt(s);
        }
        self.end_scope(span);
        self.emit(Instruction::encode_a(Opcode::TryEnd, 0), span);

        let end_jump = self.emit_jump(Opcode::Jmp, 0, span);
        self.patch_jump(try_begin);

        if let Some(clause) = catch {
            self.begin_scope();
            match &clause.binding {
                Some(name) => {
                    self.declare_binding(name, false, span, |c, r| {
                        c.emit(Instruction::encode_a(Opcode::Catch, r), span);
                    });
                }
                None => {
                    let r = self.alloc_reg(span);
                    self.emit(Instruction::encode_a(Opcode::Catch, r), span);
                }
            }
            for s in &clause.body {
                self.compile_stmt(s);
            }
            self.end_scope(span);
        }

        self.patch_jump(end_jump);

        if let Some(finally) = finally {
            self.begin_scope();
            for s in finally {
                self.compile_stmt(s);
            }
            self.end_scope(span);
        }
    }

    /// `defer <call-expr>;`. Arguments are evaluated eagerly (at the defer
    /// site); the callee and its arguments are bundled into an array
    /// `[callee, arg0, arg1, ...]` and pushed onto the frame's defer stack.
    /// The VM unpacks this convention when it drains the stack (spec §4.6).
    fn compile_defer(&mut self, call: &Expr, span: Span) {
        let ExprKind::Call { callee, args } = &call.kind else {
            self.error("'defer' requires a call expression", span);
            return;
        };
        let mark = self.register_mark();
        let bundle = self.alloc_reg(span);
        let callee_reg = self.alloc_reg(span);
        self.compile_expr(callee, callee_reg);
        for arg in args {
            let r = self.alloc_reg(span);
            self.compile_expr(arg, r);
        }
        self.emit(
            Instruction::encode_ab(Opcode::NewArray, bundle, (args.len() + 1) as u8),
            span,
        );
        self.emit(Instruction::encode_a(Opcode::DeferPush, bundle), span);
        self.free_to(mark);
    }

    fn compile_import(&mut self, path: &str, binding: &str, _binding_id: NodeId, span: Span) {
        self.declare_binding(binding, false, span, |c, r| {
            let k = c.add_string_constant(path);
            c.emit(Instruction::encode_abx(Opcode::Import, r, k), span);
        });
    }
}

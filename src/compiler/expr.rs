//! Expression compilation: the "expression-into-destination-register"
//! discipline (spec §4.4). Every `compile_expr` call writes its result into
//! the caller-supplied register and leaves the allocator's high-water mark
//! wherever it needs to be for nested temporaries — callers that don't need
//! those temporaries afterward are responsible for calling `free_to`.

use super::{Compiler, NameRef};
use crate::ast::*;
use crate::chunk::Constant;
use crate::opcode::{Instruction, Opcode};
use crate::span::Span;

impl<'a> Compiler<'a> {
    /// Compile `expr`, writing its value into register `dest`.
    pub(super) fn compile_expr(&mut self, expr: &Expr, dest: u8) {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Null => {
                self.emit(Instruction::encode_a(Opcode::LoadNull, dest), span);
            }
            ExprKind::Bool(true) => {
                self.emit(Instruction::encode_a(Opcode::LoadTrue, dest), span);
            }
            ExprKind::Bool(false) => {
                self.emit(Instruction::encode_a(Opcode::LoadFalse, dest), span);
            }
            ExprKind::Int(n) => self.load_int_constant(*n, dest, span),
            ExprKind::Float(f) => {
                let k = self.add_constant(Constant::F64(*f));
                self.emit(Instruction::encode_abx(Opcode::LoadConst, dest, k), span);
            }
            ExprKind::Rune(c) => {
                let k = self.add_constant(Constant::Rune(*c));
                self.emit(Instruction::encode_abx(Opcode::LoadConst, dest, k), span);
            }
            ExprKind::Str(s) => {
                let k = self.add_string_constant(s);
                self.emit(Instruction::encode_abx(Opcode::LoadConst, dest, k), span);
            }
            ExprKind::Ident { name, id } => self.compile_ident_load(name, *id, dest, span),
            ExprKind::Assign { target, value } => self.compile_assign(target, value, dest, span),
            ExprKind::Binary { op, left, right } => self.compile_binary(*op, left, right, dest, span),
            ExprKind::Logical { op, left, right } => self.compile_logical(*op, left, right, dest, span),
            ExprKind::Unary { op, operand } => self.compile_unary(*op, operand, dest, span),
            ExprKind::Call { callee, args } => {
                self.compile_call(callee, args, dest, span);
            }
            ExprKind::Index { receiver, index } => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(receiver, r);
                let i = self.alloc_reg(span);
                self.compile_expr(index, i);
                self.emit(Instruction::encode_abc(Opcode::GetIndex, dest, r, i), span);
                self.free_to(mark.max(dest + 1));
            }
            ExprKind::Field { receiver, name, optional } => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(receiver, r);
                let k = self.add_string_constant(name);
                let op = if *optional { Opcode::GetFieldOptional } else { Opcode::GetField };
                self.emit(Instruction::encode_abc(op, dest, r, k as u8), span);
                self.free_to(mark.max(dest + 1));
            }
            ExprKind::ArrayLit(items) => self.compile_array_lit(items, dest, span),
            ExprKind::ObjectLit(fields) => self.compile_object_lit(fields, dest, span),
            ExprKind::FunctionLit(function) => self.compile_function_lit(function, dest),
            ExprKind::TypeOf(value) => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(value, r);
                self.emit(Instruction::encode_ab(Opcode::TypeOf, dest, r), span);
                self.free_to(mark.max(dest + 1));
            }
            ExprKind::Cast { value, type_name } => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(value, r);
                let k = self.add_string_constant(type_name);
                self.emit(Instruction::encode_abc(Opcode::Cast, dest, r, k as u8), span);
                self.free_to(mark.max(dest + 1));
            }
            ExprKind::InstanceOf { value, type_name } => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(value, r);
                let k = self.add_string_constant(type_name);
                self.emit(Instruction::encode_abc(Opcode::InstanceOf, dest, r, k as u8), span);
                self.free_to(mark.max(dest + 1));
            }
            ExprKind::Spawn { callee, args } => self.compile_spawn(callee, args, dest, span),
            ExprKind::Await(value) => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(value, r);
                self.emit(Instruction::encode_ab(Opcode::Await, dest, r), span);
                self.free_to(mark.max(dest + 1));
            }
            ExprKind::Yield(value) => {
                self.compile_expr(value, dest);
                self.emit(Instruction::encode_a(Opcode::Yield, dest), span);
            }
        }
    }

    /// Compile `expr` into a freshly allocated register and return it.
    pub(super) fn compile_expr_new(&mut self, expr: &Expr) -> u8 {
        let r = self.alloc_reg(expr.span);
        self.compile_expr(expr, r);
        r
    }

    fn load_int_constant(&mut self, n: i64, dest: u8, span: Span) {
        // Narrowest representation that round-trips, matching the
        // constant-pool's I32/I64 split (spec §4.5 widening rules start
        // from the narrowest literal type the value actually needs).
        let constant = if let Ok(n32) = i32::try_from(n) {
            Constant::I32(n32)
        } else {
            Constant::I64(n)
        };
        let k = self.add_constant(constant);
        self.emit(Instruction::encode_abx(Opcode::LoadConst, dest, k), span);
    }

    fn compile_ident_load(&mut self, name: &str, id: NodeId, dest: u8, span: Span) {
        match self.resolve_name(name, id, span) {
            NameRef::Local(slot) => {
                self.emit(Instruction::encode_abx(Opcode::LoadLocal, dest, slot as u16), span);
            }
            NameRef::Upvalue(idx) => {
                self.emit(Instruction::encode_abx(Opcode::LoadUpvalue, dest, idx as u16), span);
            }
            NameRef::Global => {
                let k = self.add_string_constant(name);
                self.emit(Instruction::encode_abx(Opcode::LoadGlobal, dest, k), span);
            }
        }
    }

    /// Assignment writes the new value into `dest` too, so `x = y = 1` and
    /// using an assignment as a sub-expression both work.
    fn compile_assign(&mut self, target: &AssignTarget, value: &Expr, dest: u8, span: Span) {
        match target {
            AssignTarget::Ident { name, id } => {
                self.check_not_const(name, *id, span);
                self.compile_expr(value, dest);
                match self.resolve_name(name, *id, span) {
                    NameRef::Local(slot) => {
                        self.emit(Instruction::encode_abx(Opcode::StoreLocal, dest, slot as u16), span);
                    }
                    NameRef::Upvalue(idx) => {
                        self.emit(Instruction::encode_abx(Opcode::StoreUpvalue, dest, idx as u16), span);
                    }
                    NameRef::Global => {
                        let k = self.add_string_constant(name);
                        self.emit(Instruction::encode_abx(Opcode::StoreGlobal, dest, k), span);
                    }
                }
            }
            AssignTarget::Index { receiver, index } => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(receiver, r);
                let i = self.alloc_reg(span);
                self.compile_expr(index, i);
                self.compile_expr(value, dest);
                self.emit(Instruction::encode_abc(Opcode::SetIndex, r, i, dest), span);
                self.free_to(mark.max(dest + 1));
            }
            AssignTarget::Field { receiver, name } => {
                let mark = self.register_mark();
                let r = self.alloc_reg(span);
                self.compile_expr(receiver, r);
                let k = self.add_string_constant(name);
                self.compile_expr(value, dest);
                self.emit(Instruction::encode_abc(Opcode::SetField, r, k as u8, dest), span);
                self.free_to(mark.max(dest + 1));
            }
        }
    }

    fn check_not_const(&mut self, name: &str, id: NodeId, span: Span) {
        use crate::resolver::Resolution;
        match self.resolutions.get(id) {
            Resolution::Local => {
                if let Some(idx) = self.current().find_local(name) {
                    if self.current().locals[idx].is_const {
                        self.error(format!("cannot assign to const variable '{name}'"), span);
                    }
                }
            }
            Resolution::Upvalue(depth) => {
                let current = self.functions.len() - 1;
                if (depth as usize) <= current {
                    let target = current - depth as usize;
                    if let Some(idx) = self.functions[target].find_local(name) {
                        if self.functions[target].locals[idx].is_const {
                            self.error(format!("cannot assign to const variable '{name}'"), span);
                        }
                    }
                }
            }
            Resolution::Global => {
                if self.script_consts.contains(name) {
                    self.error(format!("cannot assign to const variable '{name}'"), span);
                }
            }
        }
    }

    fn compile_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, dest: u8, span: Span) {
        let mark = self.register_mark();
        let l = self.alloc_reg(span);
        self.compile_expr(left, l);
        let r = self.alloc_reg(span);
        self.compile_expr(right, r);
        let opcode = match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::Mul => Opcode::Mul,
            BinaryOp::Div => Opcode::Div,
            BinaryOp::Mod => Opcode::Mod,
            BinaryOp::Pow => Opcode::Pow,
            BinaryOp::BAnd => Opcode::BAnd,
            BinaryOp::BOr => Opcode::BOr,
            BinaryOp::BXor => Opcode::BXor,
            BinaryOp::Shl => Opcode::Shl,
            BinaryOp::Shr => Opcode::Shr,
            BinaryOp::Eq => Opcode::Eq,
            BinaryOp::Ne => Opcode::Ne,
            BinaryOp::Lt => Opcode::Lt,
            BinaryOp::Le => Opcode::Le,
            BinaryOp::Gt => Opcode::Gt,
            BinaryOp::Ge => Opcode::Ge,
            BinaryOp::Concat => Opcode::Concat,
        };
        self.emit(Instruction::encode_abc(opcode, dest, l, r), span);
        self.free_to(mark.max(dest + 1));
    }

    /// `&&`/`||` short-circuit: the right operand is only evaluated if the
    /// left one doesn't already decide the result (spec §4.4).
    fn compile_logical(&mut self, op: LogicalOp, left: &Expr, right: &Expr, dest: u8, span: Span) {
        self.compile_expr(left, dest);
        let skip_opcode = match op {
            LogicalOp::And => Opcode::JmpIfFalse,
            LogicalOp::Or => Opcode::JmpIfTrue,
        };
        let skip = self.emit_jump(skip_opcode, dest, span);
        let mark = self.register_mark();
        self.compile_expr(right, dest);
        self.free_to(mark.max(dest + 1));
        self.patch_jump(skip);
    }

    fn compile_unary(&mut self, op: UnaryOp, operand: &Expr, dest: u8, span: Span) {
        let mark = self.register_mark();
        let r = self.alloc_reg(span);
        self.compile_expr(operand, r);
        let opcode = match op {
            UnaryOp::Neg => Opcode::Neg,
            UnaryOp::Not => Opcode::Not,
            UnaryOp::BNot => Opcode::BNot,
        };
        self.emit(Instruction::encode_ab(opcode, dest, r), span);
        self.free_to(mark.max(dest + 1));
    }

    /// `Call A, B, C`: `A` is the callee register, args occupy `A+1..A+1+B`,
    /// `C` is the requested result count (always 1 here; multi-value
    /// returns are not part of this core). The result lands back in `A`.
    pub(super) fn compile_call(&mut self, callee: &Expr, args: &[Expr], dest: u8, span: Span) -> u8 {
        let mark = self.register_mark();
        let base = self.alloc_reg(span);
        self.compile_expr(callee, base);
        for arg in args {
            let r = self.alloc_reg(span);
            self.compile_expr(arg, r);
        }
        self.emit(
            Instruction::encode_abc(Opcode::Call, base, args.len() as u8, 1),
            span,
        );
        if base != dest {
            self.emit(Instruction::encode_ab(Opcode::Move, dest, base), span);
        }
        self.free_to(mark.max(dest + 1));
        dest
    }

    fn compile_spawn(&mut self, callee: &Expr, args: &[Expr], dest: u8, span: Span) {
        let mark = self.register_mark();
        let base = self.alloc_reg(span);
        self.compile_expr(callee, base);
        for arg in args {
            let r = self.alloc_reg(span);
            self.compile_expr(arg, r);
        }
        self.emit(
            Instruction::encode_abc(Opcode::Spawn, base, args.len() as u8, 1),
            span,
        );
        if base != dest {
            self.emit(Instruction::encode_ab(Opcode::Move, dest, base), span);
        }
        self.free_to(mark.max(dest + 1));
    }

    fn compile_array_lit(&mut self, items: &[Expr], dest: u8, span: Span) {
        let mark = self.register_mark();
        // Elements must sit contiguously right after `dest` for NewArray to
        // read them, so `dest` itself is the base register.
        self.free_to(mark.max(dest + 1));
        for item in items {
            let r = self.alloc_reg(span);
            self.compile_expr(item, r);
        }
        self.emit(
            Instruction::encode_ab(Opcode::NewArray, dest, items.len() as u8),
            span,
        );
        self.free_to(mark.max(dest + 1));
    }

    fn compile_object_lit(&mut self, fields: &[(String, Expr)], dest: u8, span: Span) {
        let mark = self.register_mark();
        self.free_to(mark.max(dest + 1));
        for (key, value) in fields {
            let key_reg = self.alloc_reg(span);
            let k = self.add_string_constant(key);
            self.emit(Instruction::encode_abx(Opcode::LoadConst, key_reg, k), span);
            let value_reg = self.alloc_reg(span);
            self.compile_expr(value, value_reg);
        }
        self.emit(
            Instruction::encode_ab(Opcode::NewObject, dest, fields.len() as u8),
            span,
        );
        self.free_to(mark.max(dest + 1));
    }
}

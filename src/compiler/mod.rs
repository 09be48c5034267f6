//! AST to bytecode compiler (spec §4.4).
//!
//! Consumes a resolved AST — the program plus the [`ResolutionMap`] the
//! resolver already computed — and produces a top-level [`Prototype`].
//! Register allocation is a scoped free-list with a high-water mark;
//! expressions follow an "expression-into-destination-register" discipline
//! (`compile_expr(e, dest)`); forward jumps are emitted with a zero
//! placeholder and patched once their target is known.

mod expr;
mod stmt;

use crate::ast::*;
use crate::builtins::{BuiltinId, BuiltinRegistry};
use crate::chunk::{Constant, Prototype, UpvalueDesc};
use crate::error::Diagnostic;
use crate::opcode::{Instruction, Opcode};
use crate::resolver::{Resolution, ResolutionMap};
use crate::span::Span;

/// One local variable tracked during compilation of a single function.
struct Local {
    name: String,
    /// `-1` marks "declared but not yet initialized" (spec §4.4
    /// `declare_local`/`define_local` split), guarding against a local's own
    /// initializer reading itself before it exists.
    depth: i32,
    slot: u8,
    is_const: bool,
    is_captured: bool,
    start_pc: u32,
}

/// Bookkeeping for one active loop, supporting `break`/`continue` (spec
/// §4.4). Both jump lists are forward references patched once the loop's
/// continue-target and exit point are known.
struct LoopCtx {
    continue_jumps: Vec<usize>,
    break_jumps: Vec<usize>,
}

/// Per-function compilation state. Pushed when entering a function literal,
/// popped once its body is compiled; the compiler itself holds a stack of
/// these so nested-function upvalue resolution can walk outward by index
/// (spec §4.4 "Upvalue resolution").
struct FunctionState {
    proto: Prototype,
    locals: Vec<Local>,
    scope_depth: u32,
    next_register: u8,
    max_register: u8,
    loops: Vec<LoopCtx>,
}

impl FunctionState {
    fn new(name: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            proto: Prototype::new(name, source_file),
            locals: Vec::new(),
            scope_depth: 0,
            next_register: 0,
            max_register: 0,
            loops: Vec::new(),
        }
    }

    /// Find a local's local-table index by name, most-recently-declared
    /// first (shadowing), only among locals that have finished
    /// initializing (`depth >= 0`).
    fn find_local(&self, name: &str) -> Option<usize> {
        self.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name && l.depth >= 0)
            .map(|(i, _)| i)
    }

    /// Register an upvalue descriptor, deduplicating on `(index, is_local)`
    /// (spec §4.4 "The inner compiler deduplicates descriptors").
    fn add_upvalue(&mut self, index: u8, is_local: bool) -> u8 {
        if let Some(pos) = self
            .proto
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local)
        {
            return pos as u8;
        }
        self.proto.upvalues.push(UpvalueDesc { index, is_local });
        (self.proto.upvalues.len() - 1) as u8
    }
}

/// Where a resolved name reference should be read from / written to.
enum NameRef {
    Local(u8),
    Upvalue(u8),
    Global,
}

pub struct Compiler<'a> {
    functions: Vec<FunctionState>,
    resolutions: &'a ResolutionMap,
    builtins: Option<&'a BuiltinRegistry>,
    source_file: String,
    diagnostics: Vec<Diagnostic>,
    had_error: bool,
    panic_mode: bool,
    /// Names declared `const` directly at script scope (spec §4.1: the
    /// resolver never resolves a top-level name to `Local`, so there is no
    /// per-function `Local.is_const` slot to check them against the way
    /// `check_not_const` does for real function locals).
    script_consts: std::collections::HashSet<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        resolutions: &'a ResolutionMap,
        source_file: impl Into<String>,
        builtins: Option<&'a BuiltinRegistry>,
    ) -> Self {
        Self {
            functions: Vec::new(),
            resolutions,
            builtins,
            source_file: source_file.into(),
            diagnostics: Vec::new(),
            had_error: false,
            panic_mode: false,
            script_consts: std::collections::HashSet::new(),
        }
    }

    /// Compile a whole program into its top-level [`Prototype`] (the
    /// "script" function the VM runs first).
    pub fn compile_program(mut self, program: &Program) -> Result<Prototype, Vec<Diagnostic>> {
        let source_file = self.source_file.clone();
        self.functions.push(FunctionState::new("<script>", source_file));

        for stmt in &program.statements {
            self.compile_stmt(stmt);
        }

        // Implicit `return null` if the script falls through (spec §4.4
        // "Function literals").
        let span = Span::dummy();
        let r = self.alloc_reg(span);
        self.emit(Instruction::encode_a(Opcode::LoadNull, r), span);
        self.emit(Instruction::encode_ab(Opcode::Return, r, 1), span);

        let mut state = self.functions.pop().expect("script function state");
        state.proto.max_stack_size = state.max_register;

        if self.had_error {
            Err(self.diagnostics)
        } else {
            Ok(state.proto)
        }
    }

    // --- error reporting (spec §4.4 "Error reporting") ---------------

    fn error(&mut self, message: impl Into<String>, span: Span) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.diagnostics.push(Diagnostic::error(message, span.line));
    }

    /// Called at each statement boundary to leave panic-mode recovery
    /// (spec §4.4: "enter panic mode to suppress cascaded errors until the
    /// next statement boundary").
    fn end_statement(&mut self) {
        self.panic_mode = false;
    }

    // --- function-state access ----------------------------------------

    fn current(&self) -> &FunctionState {
        self.functions.last().expect("no active function")
    }

    fn current_mut(&mut self) -> &mut FunctionState {
        self.functions.last_mut().expect("no active function")
    }

    fn emit(&mut self, instruction: Instruction, span: Span) -> usize {
        self.current_mut().proto.emit(instruction, span)
    }

    fn current_offset(&self) -> usize {
        self.current().proto.current_offset()
    }

    fn add_constant(&mut self, constant: Constant) -> u16 {
        self.current_mut().proto.add_constant(constant)
    }

    fn add_string_constant(&mut self, s: &str) -> u16 {
        self.add_constant(Constant::String(s.to_string()))
    }

    // --- registers ------------------------------------------------------

    fn alloc_reg(&mut self, span: Span) -> u8 {
        let f = self.current_mut();
        if f.next_register == u8::MAX {
            self.error("too many registers in function (limit 255)", span);
            return f.next_register;
        }
        let r = f.next_register;
        f.next_register += 1;
        if f.next_register > f.max_register {
            f.max_register = f.next_register;
        }
        r
    }

    fn free_to(&mut self, mark: u8) {
        self.current_mut().next_register = mark;
    }

    fn register_mark(&self) -> u8 {
        self.current().next_register
    }

    // --- scopes -----------------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_mut().scope_depth += 1;
    }

    /// Pop locals declared at the scope being exited, freeing their
    /// registers back to the allocator (spec §4.4 `end_scope`).
    fn end_scope(&mut self, span: Span) {
        let f = self.current_mut();
        f.scope_depth -= 1;
        let depth = f.scope_depth;
        let pc = f.proto.current_offset() as u32;
        while let Some(local) = f.locals.last() {
            if local.depth >= 0 && (local.depth as u32) <= depth {
                break;
            }
            let local = f.locals.pop().unwrap();
            f.proto.locals_debug.push(crate::chunk::LocalDebugInfo {
                name: local.name,
                depth: local.depth.max(0) as u32,
                slot: local.slot,
                start_pc: local.start_pc,
                end_pc: pc,
                is_const: local.is_const,
                is_captured: local.is_captured,
            });
        }
        let mark = f.locals.len() as u8;
        let _ = span;
        self.free_to(mark);
    }

    // --- locals -------------------------------------------------------

    /// `declare_local` (spec §4.4): fails if `name` is already declared at
    /// the current depth; otherwise reserves a register with `depth = -1`
    /// until `define_local` enables it for lookup.
    fn declare_local(&mut self, name: &str, is_const: bool, span: Span) -> u8 {
        let depth = self.current().scope_depth;
        if self
            .current()
            .locals
            .iter()
            .any(|l| l.depth == depth as i32 && l.name == name)
        {
            self.error(format!("variable '{name}' already declared in this scope"), span);
        }
        let slot = self.alloc_reg(span);
        let pc = self.current_offset() as u32;
        self.current_mut().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            slot,
            is_const,
            is_captured: false,
            start_pc: pc,
        });
        slot
    }

    fn define_local(&mut self, local_index: usize) {
        let depth = self.current().scope_depth as i32;
        self.current_mut().locals[local_index].depth = depth;
    }

    /// True while compiling directly in the top-level script, outside any
    /// function literal (spec §4.1: the resolver's `functions` stack is
    /// empty here, so every name — `let`, a named function, a `try`/`catch`
    /// binding, an `import` binding — resolves to `Global` rather than
    /// `Local`/`Upvalue`, no matter how many `{…}`/`for`/`while` blocks
    /// enclose it). The compiler's own `functions` stack always carries the
    /// implicit `<script>` `FunctionState`, so this is a length of 1 rather
    /// than 0.
    fn in_script_scope(&self) -> bool {
        self.functions.len() == 1
    }

    /// Declare a new binding for `name`, matching whichever storage the
    /// resolver will expect reads of that name to use: a function-local
    /// register inside any real function literal, or a named VM global at
    /// script scope (spec §4.1). `emit_value` receives the register to
    /// write the binding's initial value into — a local's own slot inside a
    /// function, or a scratch register immediately copied to the global.
    fn declare_binding(&mut self, name: &str, is_const: bool, span: Span, emit_value: impl FnOnce(&mut Self, u8)) {
        if self.in_script_scope() {
            if is_const {
                self.script_consts.insert(name.to_string());
            } else {
                self.script_consts.remove(name);
            }
            let mark = self.register_mark();
            let r = self.alloc_reg(span);
            emit_value(self, r);
            let k = self.add_string_constant(name);
            self.emit(Instruction::encode_abx(Opcode::StoreGlobal, r, k), span);
            self.free_to(mark);
        } else {
            let slot = self.declare_local(name, is_const, span);
            emit_value(self, slot);
            let idx = self.current().locals.len() - 1;
            self.define_local(idx);
        }
    }

    // --- name resolution (spec §4.4 "Upvalue resolution") ----------------

    fn resolve_name(&mut self, name: &str, id: NodeId, span: Span) -> NameRef {
        match self.resolutions.get(id) {
            Resolution::Local => match self.current().find_local(name) {
                Some(idx) => NameRef::Local(self.current().locals[idx].slot),
                None => {
                    self.error(format!("internal: resolver said '{name}' is local but no local found"), span);
                    NameRef::Global
                }
            },
            Resolution::Upvalue(depth) => {
                let current = self.functions.len() - 1;
                if (depth as usize) > current {
                    self.error(format!("internal: upvalue depth out of range for '{name}'"), span);
                    return NameRef::Global;
                }
                let target = current - depth as usize;
                match self.functions[target].find_local(name) {
                    Some(idx) => {
                        let slot = self.functions[target].locals[idx].slot;
                        self.functions[target].locals[idx].is_captured = true;
                        let up = self.capture_upvalue_chain(target, current, slot);
                        NameRef::Upvalue(up)
                    }
                    None => {
                        self.error(format!("internal: resolver said '{name}' is an upvalue but no local found"), span);
                        NameRef::Global
                    }
                }
            }
            Resolution::Global => NameRef::Global,
        }
    }

    /// Chain an upvalue descriptor `(local_slot in functions[target])`
    /// through every function level from `target+1` up to `current`
    /// (inclusive), so each intermediate closure's own upvalue array
    /// carries a link back to its immediate enclosing scope (spec §4.4:
    /// "otherwise recurse and, on success, add (index=outer_upvalue_index,
    /// is_local=false)").
    fn capture_upvalue_chain(&mut self, target: usize, current: usize, local_slot: u8) -> u8 {
        let mut carry_is_local = true;
        let mut carry_index = local_slot;
        let mut result = carry_index;
        for level in (target + 1)..=current {
            result = self.functions[level].add_upvalue(carry_index, carry_is_local);
            carry_is_local = false;
            carry_index = result;
        }
        result
    }

    fn resolve_builtin(&mut self, name: &str, span: Span) -> Option<BuiltinId> {
        match self.builtins.and_then(|b| b.resolve(name)) {
            Some(id) if id.0 <= u8::MAX as u32 => Some(id),
            Some(_) => {
                self.error(format!("builtin '{name}' index does not fit CallBuiltin's 8-bit operand"), span);
                None
            }
            None => {
                self.error(format!("unknown builtin '{name}' (host must register it)"), span);
                None
            }
        }
    }

    // --- jump patching (spec §4.4 "Control flow and patching") -----------

    /// Emit a forward jump with a zero placeholder, returning its offset
    /// for later patching.
    fn emit_jump(&mut self, opcode: Opcode, a: u8, span: Span) -> usize {
        match opcode {
            Opcode::Jmp => self.emit(Instruction::encode_sax(opcode, 0), span),
            Opcode::JmpIfFalse | Opcode::JmpIfTrue => {
                self.emit(Instruction::encode_asbx(opcode, a, 0), span)
            }
            _ => unreachable!("emit_jump only used for jump opcodes"),
        }
    }

    /// Patch a forward jump at `offset` to land on the current offset:
    /// `target - offset - 1` (spec §4.4).
    fn patch_jump(&mut self, offset: usize) {
        let target = self.current_offset() as i64;
        let delta = target - offset as i64 - 1;
        let proto = &mut self.current_mut().proto;
        let ins = proto.code[offset];
        let patched = match ins.opcode().expect("patched instruction must decode") {
            Opcode::Jmp => Instruction::encode_sax(Opcode::Jmp, delta as i32),
            Opcode::JmpIfFalse => Instruction::encode_asbx(Opcode::JmpIfFalse, ins.a(), delta as i32),
            Opcode::JmpIfTrue => Instruction::encode_asbx(Opcode::JmpIfTrue, ins.a(), delta as i32),
            Opcode::TryBegin => Instruction::encode_asbx(Opcode::TryBegin, ins.a(), delta as i32),
            other => unreachable!("patch_jump called on non-jump opcode {other:?}"),
        };
        proto.code[offset] = patched;
    }

    /// Emit a backward `Loop` jump to `loop_start` (spec §4.4: "Backward
    /// jumps (Loop) encode current_offset - loop_start").
    fn emit_loop(&mut self, loop_start: usize, span: Span) {
        let current = self.current_offset() as i64;
        let delta = loop_start as i64 - current - 1;
        self.emit(Instruction::encode_sax(Opcode::Loop, delta as i32), span);
    }
}

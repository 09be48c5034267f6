//! The bytecode interpreter: fetch/decode/dispatch over [`Prototype`] code,
//! register-window-per-frame addressing, closures and upvalues, exception
//! unwinding, defer draining, and arithmetic widening (spec §4.5, §4.6).

pub mod frame;

use crate::builtins::{BuiltinRegistry, ExecutionContext};
use crate::chunk::Prototype;
use crate::error::{RuntimeError, RuntimeErrorKind, TraceFrame};
use crate::opcode::{Instruction, Opcode};
use crate::scheduler::TaskState;
use crate::value::{Closure, Handle, ObjectMap, TaskMarker, Upvalue, Value};
use frame::CallFrame;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Tunable limits and feature toggles the embedder configures before
/// running anything (EXPANSION 2.1).
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_frame_depth: usize,
    pub initial_stack_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frame_depth: 256,
            initial_stack_capacity: 256,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NumKind {
    I32,
    I64,
    F64,
}

pub struct Vm<'a> {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<Rc<str>, Value>,
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    builtins: Option<&'a BuiltinRegistry>,
    registered_types: HashMap<String, Value>,
    modules: HashMap<String, Value>,
    exports: HashMap<String, Value>,
    task_results: HashMap<usize, TaskState>,
    host: &'a mut dyn Any,
    config: VmConfig,
    pending_exception: Option<Value>,
}

impl<'a> Vm<'a> {
    pub fn new(builtins: Option<&'a BuiltinRegistry>, host: &'a mut dyn Any, config: VmConfig) -> Self {
        let initial_stack_capacity = config.initial_stack_capacity;
        Self {
            stack: Vec::with_capacity(initial_stack_capacity),
            frames: Vec::new(),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            builtins,
            registered_types: HashMap::new(),
            modules: HashMap::new(),
            exports: HashMap::new(),
            task_results: HashMap::new(),
            host,
            config,
            pending_exception: None,
        }
    }

    pub fn set_global(&mut self, name: impl Into<Rc<str>>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn register_module(&mut self, path: impl Into<String>, value: Value) {
        self.modules.insert(path.into(), value);
    }

    pub fn exports(&self) -> &HashMap<String, Value> {
        &self.exports
    }

    /// Run a top-level script prototype (no enclosing closure) to
    /// completion (spec §6 "run_source"/"run_module" entry points).
    pub fn run_script(&mut self, prototype: Rc<Prototype>) -> Result<Value, RuntimeError> {
        let closure = Rc::new(Closure { prototype, upvalues: Vec::new() });
        self.run_closure(closure, Vec::new())
    }

    fn run_closure(&mut self, closure: Rc<Closure>, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let entry_depth = self.frames.len();
        // No bytecode caller register receives this frame's return value —
        // `execute` hands the value straight back to this Rust call site
        // once the frame pops back to `entry_depth` — so `return_dest` is
        // never read for it.
        self.push_frame(closure, args, 0)?;
        self.execute(entry_depth)
    }

    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match callee {
            Value::Function(closure) => self.run_closure(closure, args),
            Value::BuiltinFn(id) => {
                let f = self
                    .builtins
                    .and_then(|b| b.get(id))
                    .ok_or_else(|| self.err(RuntimeErrorKind::CallError(format!("unregistered builtin {id}"))))?;
                let mut ctx = ExecutionContext::new(&self.registered_types, self.host);
                let result = f(&args, &mut ctx);
                if ctx.exception_state.is_throwing {
                    let value = ctx.exception_state.exception_value.unwrap_or(Value::Null);
                    return Err(self.err(RuntimeErrorKind::UserException(value)));
                }
                Ok(result)
            }
            other => Err(self.err(RuntimeErrorKind::CallError(format!(
                "value of type '{}' is not callable",
                other.type_name()
            )))),
        }
    }

    fn err(&self, kind: RuntimeErrorKind) -> RuntimeError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|f| TraceFrame {
                function_name: f.prototype().name.clone(),
                line: f.prototype().span_for(f.ip.saturating_sub(1)).line,
            })
            .collect();
        let line = self
            .frames
            .last()
            .map(|f| f.prototype().span_for(f.ip.saturating_sub(1)).line)
            .unwrap_or(0);
        RuntimeError { kind, line, trace }
    }

    // --- frame / register plumbing -------------------------------------

    fn push_frame(
        &mut self,
        closure: Rc<Closure>,
        mut args: Vec<Value>,
        return_dest: u8,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.config.max_frame_depth {
            return Err(self.err(RuntimeErrorKind::StackOverflow));
        }
        let proto = closure.prototype.clone();
        let base = self.stack.len();
        let arity = proto.arity as usize;
        if proto.is_variadic {
            let rest = if args.len() > arity { args.split_off(arity) } else { Vec::new() };
            args.resize(arity, Value::Null);
            args.push(Value::array(rest));
        } else {
            args.truncate(arity);
            args.resize(arity, Value::Null);
        }
        self.stack.extend(args);
        let target_len = base + proto.max_stack_size as usize;
        if self.stack.len() < target_len {
            self.stack.resize(target_len, Value::Null);
        }
        self.frames.push(CallFrame::new(closure, base, return_dest));
        Ok(())
    }

    fn reg(&self, offset: u8) -> Value {
        let base = self.frames.last().unwrap().base;
        self.stack[base + offset as usize].clone()
    }

    fn set_reg(&mut self, offset: u8, v: Value) {
        let base = self.frames.last().unwrap().base;
        self.stack[base + offset as usize] = v;
    }

    /// Restore the stack to the currently-top frame's full register window
    /// after a nested frame below it was popped.
    fn repad_current_frame(&mut self) {
        if let Some(frame) = self.frames.last() {
            let target = frame.base + frame.prototype().max_stack_size as usize;
            if self.stack.len() < target {
                self.stack.resize(target, Value::Null);
            }
        }
    }

    // --- upvalues --------------------------------------------------------

    fn find_or_open_upvalue(&mut self, abs_index: usize) -> Rc<RefCell<Upvalue>> {
        for u in &self.open_upvalues {
            if let Upvalue::Open { stack_index } = &*u.borrow() {
                if *stack_index == abs_index {
                    return u.clone();
                }
            }
        }
        let u = Rc::new(RefCell::new(Upvalue::Open { stack_index: abs_index }));
        self.open_upvalues.push(u.clone());
        u
    }

    fn close_upvalues_from(&mut self, boundary: usize) {
        for u in &self.open_upvalues {
            let stack_index = match &*u.borrow() {
                Upvalue::Open { stack_index } => Some(*stack_index),
                Upvalue::Closed(_) => None,
            };
            if let Some(idx) = stack_index {
                if idx >= boundary {
                    let val = self.stack[idx].clone();
                    *u.borrow_mut() = Upvalue::Closed(val);
                }
            }
        }
        self.open_upvalues.retain(|u| matches!(&*u.borrow(), Upvalue::Open { .. }));
    }

    fn read_upvalue(&self, index: u8) -> Value {
        let cell = self.frames.last().unwrap().closure.upvalues[index as usize].clone();
        let borrowed = cell.borrow();
        match &*borrowed {
            Upvalue::Open { stack_index } => self.stack[*stack_index].clone(),
            Upvalue::Closed(v) => v.clone(),
        }
    }

    fn write_upvalue(&mut self, index: u8, value: Value) {
        let cell = self.frames.last().unwrap().closure.upvalues[index as usize].clone();
        let stack_index = match &*cell.borrow() {
            Upvalue::Open { stack_index } => Some(*stack_index),
            Upvalue::Closed(_) => None,
        };
        match stack_index {
            Some(idx) => self.stack[idx] = value,
            None => *cell.borrow_mut() = Upvalue::Closed(value),
        }
    }

    // --- defers ------------------------------------------------------

    fn drain_defers_current(&mut self) -> Result<(), RuntimeError> {
        loop {
            let bundle = self.frames.last_mut().unwrap().defers.pop();
            let Some(bundle) = bundle else { break };
            self.invoke_defer_bundle(bundle)?;
        }
        Ok(())
    }

    fn pop_one_defer(&mut self) -> Result<(), RuntimeError> {
        if let Some(bundle) = self.frames.last_mut().unwrap().defers.pop() {
            self.invoke_defer_bundle(bundle)?;
        }
        Ok(())
    }

    fn invoke_defer_bundle(&mut self, bundle: Value) -> Result<(), RuntimeError> {
        let Value::Array(items) = bundle else { return Ok(()) };
        let items = items.borrow().clone();
        if items.is_empty() {
            return Ok(());
        }
        let callee = items[0].clone();
        let args = items[1..].to_vec();
        self.call_value(callee, args)?;
        Ok(())
    }

    // --- exceptions ------------------------------------------------------

    fn kind_to_value(kind: RuntimeErrorKind) -> Value {
        if let RuntimeErrorKind::UserException(v) = kind {
            return v;
        }
        let mut map = ObjectMap::new();
        let tag: &str = match &kind {
            RuntimeErrorKind::TypeError(_) => "TypeError",
            RuntimeErrorKind::DivisionByZero => "DivisionByZero",
            RuntimeErrorKind::IndexError(_) => "IndexError",
            RuntimeErrorKind::KeyError(_) => "KeyError",
            RuntimeErrorKind::CallError(_) => "CallError",
            RuntimeErrorKind::StackOverflow => "StackOverflow",
            RuntimeErrorKind::AssertionFailed(_) => "AssertionFailed",
            RuntimeErrorKind::Panic(_) => "Panic",
            RuntimeErrorKind::Cancelled => "Cancelled",
            RuntimeErrorKind::UserException(_) => unreachable!(),
        };
        map.insert(Rc::from("kind"), Value::string(tag));
        map.insert(Rc::from("message"), Value::string(kind.to_string()));
        Value::object(map)
    }

    /// Throw/raise path shared by `Throw` and every internal runtime error
    /// (spec §4.6: a native `TypeError` is just as catchable as a
    /// user-thrown value). Drains defers, then looks for an active handler
    /// in this frame, unwinding to the caller otherwise.
    fn unwind(&mut self, value: Value) -> Result<(), RuntimeError> {
        loop {
            self.drain_defers_current()?;
            let handler = self.frames.last_mut().unwrap().handlers.pop();
            if let Some(handler) = handler {
                let frame = self.frames.last_mut().unwrap();
                frame.ip = handler.catch_target;
                self.pending_exception = Some(value);
                return Ok(());
            }
            let base = self.frames.last().unwrap().base;
            self.close_upvalues_from(base);
            self.stack.truncate(base);
            self.frames.pop();
            if self.frames.is_empty() {
                return Err(RuntimeError {
                    kind: RuntimeErrorKind::UserException(value),
                    line: 0,
                    trace: Vec::new(),
                });
            }
            self.repad_current_frame();
        }
    }

    fn raise(&mut self, kind: RuntimeErrorKind) -> Result<(), RuntimeError> {
        let value = Self::kind_to_value(kind);
        self.unwind(value)
    }

    // --- arithmetic (spec §4.5) ------------------------------------------

    fn widen(a: &Value, b: &Value) -> Option<NumKind> {
        if !(a.is_numeric() && b.is_numeric()) {
            return None;
        }
        if a.is_float() || b.is_float() {
            Some(NumKind::F64)
        } else if a.is_64_bit_int() || b.is_64_bit_int() {
            Some(NumKind::I64)
        } else {
            Some(NumKind::I32)
        }
    }

    fn as_i64(v: &Value) -> i64 {
        match v {
            Value::I8(n) => *n as i64,
            Value::I16(n) => *n as i64,
            Value::I32(n) => *n as i64,
            Value::I64(n) => *n,
            Value::U8(n) => *n as i64,
            Value::U16(n) => *n as i64,
            Value::U32(n) => *n as i64,
            Value::U64(n) => *n as i64,
            Value::F32(n) => *n as i64,
            Value::F64(n) => *n as i64,
            _ => 0,
        }
    }

    fn arith(op: Opcode, a: &Value, b: &Value) -> Result<Value, RuntimeErrorKind> {
        match op {
            Opcode::Div => {
                let (x, y) = (
                    a.as_f64().ok_or_else(|| RuntimeErrorKind::TypeError("division needs numeric operands".into()))?,
                    b.as_f64().ok_or_else(|| RuntimeErrorKind::TypeError("division needs numeric operands".into()))?,
                );
                if y == 0.0 {
                    return Err(RuntimeErrorKind::DivisionByZero);
                }
                Ok(Value::F64(x / y))
            }
            Opcode::Mod => {
                if a.is_float() || b.is_float() {
                    return Err(RuntimeErrorKind::TypeError("modulo requires integer operands".into()));
                }
                let (x, y) = (Self::as_i64(a), Self::as_i64(b));
                if y == 0 {
                    return Err(RuntimeErrorKind::DivisionByZero);
                }
                Ok(Value::I64(x % y))
            }
            _ => {
                let kind = Self::widen(a, b)
                    .ok_or_else(|| RuntimeErrorKind::TypeError("arithmetic needs numeric operands".into()))?;
                match kind {
                    NumKind::F64 => {
                        let (x, y) = (a.as_f64().unwrap(), b.as_f64().unwrap());
                        Ok(Value::F64(match op {
                            Opcode::Add => x + y,
                            Opcode::Sub => x - y,
                            Opcode::Mul => x * y,
                            Opcode::Pow => x.powf(y),
                            _ => unreachable!(),
                        }))
                    }
                    NumKind::I64 => {
                        let (x, y) = (Self::as_i64(a), Self::as_i64(b));
                        Ok(Value::I64(match op {
                            Opcode::Add => x.wrapping_add(y),
                            Opcode::Sub => x.wrapping_sub(y),
                            Opcode::Mul => x.wrapping_mul(y),
                            Opcode::Pow => (x as f64).powf(y as f64) as i64,
                            _ => unreachable!(),
                        }))
                    }
                    NumKind::I32 => {
                        let (x, y) = (Self::as_i64(a) as i32, Self::as_i64(b) as i32);
                        Ok(Value::I32(match op {
                            Opcode::Add => x.wrapping_add(y),
                            Opcode::Sub => x.wrapping_sub(y),
                            Opcode::Mul => x.wrapping_mul(y),
                            Opcode::Pow => (x as f64).powf(y as f64) as i32,
                            _ => unreachable!(),
                        }))
                    }
                }
            }
        }
    }

    fn bitwise(op: Opcode, a: &Value, b: &Value) -> Result<Value, RuntimeErrorKind> {
        let err = || RuntimeErrorKind::TypeError("bitwise operators require integer operands".into());
        if a.is_float() || b.is_float() || !a.is_numeric() || !b.is_numeric() {
            return Err(err());
        }
        let wide = Self::widen(a, b).ok_or_else(err)?;
        let (x, y) = (Self::as_i64(a), Self::as_i64(b));
        let result = match op {
            Opcode::BAnd => x & y,
            Opcode::BOr => x | y,
            Opcode::BXor => x ^ y,
            Opcode::Shl => x.wrapping_shl((y & 63) as u32),
            Opcode::Shr => x.wrapping_shr((y & 63) as u32),
            _ => unreachable!(),
        };
        Ok(match wide {
            NumKind::I32 => Value::I32(result as i32),
            _ => Value::I64(result),
        })
    }

    fn compare(op: Opcode, a: &Value, b: &Value) -> Result<bool, RuntimeErrorKind> {
        match op {
            Opcode::Eq => Ok(a == b),
            Opcode::Ne => Ok(a != b),
            _ => {
                let (x, y) = (
                    a.as_f64().ok_or_else(|| RuntimeErrorKind::TypeError("comparison needs numeric operands".into()))?,
                    b.as_f64().ok_or_else(|| RuntimeErrorKind::TypeError("comparison needs numeric operands".into()))?,
                );
                Ok(match op {
                    Opcode::Lt => x < y,
                    Opcode::Le => x <= y,
                    Opcode::Gt => x > y,
                    Opcode::Ge => x >= y,
                    _ => unreachable!(),
                })
            }
        }
    }

    fn negate(v: &Value) -> Result<Value, RuntimeErrorKind> {
        match v {
            Value::I8(n) => Ok(Value::I8(n.wrapping_neg())),
            Value::I16(n) => Ok(Value::I16(n.wrapping_neg())),
            Value::I32(n) => Ok(Value::I32(n.wrapping_neg())),
            Value::I64(n) => Ok(Value::I64(n.wrapping_neg())),
            Value::F32(n) => Ok(Value::F32(-n)),
            Value::F64(n) => Ok(Value::F64(-n)),
            other => Err(RuntimeErrorKind::TypeError(format!("cannot negate '{}'", other.type_name()))),
        }
    }

    // --- fetch/decode/dispatch ---------------------------------------

    /// Run until the frame stack depth returns to `stop_depth`, yielding
    /// the value the frame at that depth returned.
    fn execute(&mut self, stop_depth: usize) -> Result<Value, RuntimeError> {
        loop {
            if self.frames.len() <= stop_depth {
                return Ok(Value::Null);
            }
            let (opcode, ins) = {
                let frame = self.frames.last().unwrap();
                let ins = frame.prototype().code[frame.ip];
                (ins.opcode(), ins)
            };
            self.frames.last_mut().unwrap().ip += 1;
            let Some(op) = opcode else {
                return Err(self.err(RuntimeErrorKind::TypeError("unknown opcode".into())));
            };
            tracing::trace!(target: "svm_core::vm", ?op, "step");

            match op {
                Opcode::LoadConst => {
                    let idx = ins.bx() as usize;
                    let constant = self.frames.last().unwrap().prototype().constants[idx].clone();
                    self.set_reg(ins.a(), constant_to_value(&constant));
                }
                Opcode::LoadNull => self.set_reg(ins.a(), Value::Null),
                Opcode::LoadTrue => self.set_reg(ins.a(), Value::Bool(true)),
                Opcode::LoadFalse => self.set_reg(ins.a(), Value::Bool(false)),
                Opcode::Move => {
                    let v = self.reg(ins.b());
                    self.set_reg(ins.a(), v);
                }
                Opcode::LoadLocal => {
                    let v = self.reg(ins.bx() as u8);
                    self.set_reg(ins.a(), v);
                }
                Opcode::StoreLocal => {
                    let v = self.reg(ins.a());
                    self.set_reg(ins.bx() as u8, v);
                }
                Opcode::LoadUpvalue => {
                    let v = self.read_upvalue(ins.bx() as u8);
                    self.set_reg(ins.a(), v);
                }
                Opcode::StoreUpvalue => {
                    let v = self.reg(ins.a());
                    self.write_upvalue(ins.bx() as u8, v);
                }
                Opcode::LoadGlobal => {
                    let idx = ins.bx() as usize;
                    let name = self.frames.last().unwrap().prototype().constants[idx].clone();
                    let name = display_string_constant(&name);
                    let v = self.globals.get(name.as_str()).cloned().unwrap_or(Value::Null);
                    self.set_reg(ins.a(), v);
                }
                Opcode::StoreGlobal => {
                    let idx = ins.bx() as usize;
                    let name = self.frames.last().unwrap().prototype().constants[idx].clone();
                    let name = display_string_constant(&name);
                    let v = self.reg(ins.a());
                    self.globals.insert(Rc::from(name), v);
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
                    let (a, b) = (self.reg(ins.b()), self.reg(ins.c()));
                    match Self::arith(op, &a, &b) {
                        Ok(v) => self.set_reg(ins.a(), v),
                        Err(k) => self.raise(k)?,
                    }
                }
                Opcode::Neg => match Self::negate(&self.reg(ins.b())) {
                    Ok(v) => self.set_reg(ins.a(), v),
                    Err(k) => self.raise(k)?,
                },
                Opcode::BAnd | Opcode::BOr | Opcode::BXor | Opcode::Shl | Opcode::Shr => {
                    let (a, b) = (self.reg(ins.b()), self.reg(ins.c()));
                    match Self::bitwise(op, &a, &b) {
                        Ok(v) => self.set_reg(ins.a(), v),
                        Err(k) => self.raise(k)?,
                    }
                }
                Opcode::BNot => {
                    let v = self.reg(ins.b());
                    match &v {
                        Value::I32(n) => self.set_reg(ins.a(), Value::I32(!n)),
                        Value::I64(n) => self.set_reg(ins.a(), Value::I64(!n)),
                        other => {
                            let k = RuntimeErrorKind::TypeError(format!("cannot apply '~' to '{}'", other.type_name()));
                            self.raise(k)?;
                        }
                    }
                }
                Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let (a, b) = (self.reg(ins.b()), self.reg(ins.c()));
                    match Self::compare(op, &a, &b) {
                        Ok(result) => self.set_reg(ins.a(), Value::Bool(result)),
                        Err(k) => self.raise(k)?,
                    }
                }
                Opcode::Not => {
                    let v = self.reg(ins.b());
                    self.set_reg(ins.a(), Value::Bool(!v.is_truthy()));
                }

                Opcode::Jmp => {
                    let delta = ins.sax();
                    let frame = self.frames.last_mut().unwrap();
                    frame.ip = (frame.ip as i64 + delta as i64) as usize;
                }
                Opcode::JmpIfFalse => {
                    if !self.reg(ins.a()).is_truthy() {
                        let delta = ins.sbx();
                        let frame = self.frames.last_mut().unwrap();
                        frame.ip = (frame.ip as i64 + delta as i64) as usize;
                    }
                }
                Opcode::JmpIfTrue => {
                    if self.reg(ins.a()).is_truthy() {
                        let delta = ins.sbx();
                        let frame = self.frames.last_mut().unwrap();
                        frame.ip = (frame.ip as i64 + delta as i64) as usize;
                    }
                }
                Opcode::Loop => {
                    let delta = ins.sax();
                    let frame = self.frames.last_mut().unwrap();
                    frame.ip = (frame.ip as i64 + delta as i64) as usize;
                }

                Opcode::Call => {
                    self.dispatch_call(ins)?;
                }
                Opcode::TailCall => {
                    // Reuse the current frame's slot window instead of
                    // pushing a nested one (spec §4.6): pop the tail-calling
                    // frame first, then push the callee's frame inheriting
                    // its `return_dest`, so frame depth never grows across a
                    // chain of tail calls. This supersedes the function
                    // body's implicit `LoadNull; Return` epilogue, which
                    // this frame's `ip` never reaches.
                    let a = ins.a();
                    let argc = ins.b() as usize;
                    let callee = self.reg(a);
                    let frame_base = self.frames.last().unwrap().base;
                    let return_dest = self.frames.last().unwrap().return_dest;
                    let args: Vec<Value> =
                        (1..=argc).map(|i| self.stack[frame_base + a as usize + i].clone()).collect();
                    // The tail-calling frame is discarded here, not merely
                    // suspended, so its own pending defers must drain now
                    // (same obligation as `Return`'s), before control passes
                    // to the callee.
                    self.drain_defers_current()?;
                    match callee {
                        Value::Function(closure) => {
                            self.close_upvalues_from(frame_base);
                            self.stack.truncate(frame_base);
                            self.frames.pop();
                            self.push_frame(closure, args, return_dest)?;
                        }
                        other => {
                            let value = self.call_value(other, args)?;
                            self.close_upvalues_from(frame_base);
                            self.stack.truncate(frame_base);
                            self.frames.pop();
                            if self.frames.len() == stop_depth {
                                return Ok(value);
                            }
                            self.repad_current_frame();
                            let caller_base = self.frames.last().unwrap().base;
                            self.stack[caller_base + return_dest as usize] = value;
                        }
                    }
                }
                Opcode::Return => {
                    let value = self.reg(ins.a());
                    self.drain_defers_current()?;
                    let frame_base = self.frames.last().unwrap().base;
                    let return_dest = self.frames.last().unwrap().return_dest;
                    self.close_upvalues_from(frame_base);
                    self.stack.truncate(frame_base);
                    self.frames.pop();
                    if self.frames.len() == stop_depth {
                        return Ok(value);
                    }
                    self.repad_current_frame();
                    let caller_base = self.frames.last().unwrap().base;
                    self.stack[caller_base + return_dest as usize] = value;
                }
                Opcode::MakeClosure => self.dispatch_make_closure(ins),

                Opcode::NewArray => {
                    let dest = ins.a();
                    let count = ins.b();
                    let base = self.frames.last().unwrap().base;
                    let start = base + dest as usize + 1;
                    let items = self.stack[start..start + count as usize].to_vec();
                    self.set_reg(dest, Value::array(items));
                }
                Opcode::NewObject => {
                    let dest = ins.a();
                    let count = ins.b();
                    let base = self.frames.last().unwrap().base;
                    let start = base + dest as usize + 1;
                    let mut map = ObjectMap::new();
                    for i in 0..count as usize {
                        let key = self.stack[start + i * 2].clone();
                        let value = self.stack[start + i * 2 + 1].clone();
                        let key = Rc::from(key.to_display_string());
                        map.insert(key, value);
                    }
                    self.set_reg(dest, Value::object(map));
                }
                Opcode::GetIndex => {
                    let (recv, idx) = (self.reg(ins.b()), self.reg(ins.c()));
                    match self.get_index(&recv, &idx) {
                        Ok(v) => self.set_reg(ins.a(), v),
                        Err(k) => self.raise(k)?,
                    }
                }
                Opcode::SetIndex => {
                    let (recv, idx, value) = (self.reg(ins.a()), self.reg(ins.b()), self.reg(ins.c()));
                    if let Err(k) = Self::set_index(&recv, &idx, value) {
                        self.raise(k)?;
                    }
                }
                Opcode::GetField | Opcode::GetFieldOptional => {
                    let recv = self.reg(ins.b());
                    if matches!(op, Opcode::GetFieldOptional) && matches!(recv, Value::Null) {
                        self.set_reg(ins.a(), Value::Null);
                    } else {
                        let name = {
                            let c = self.frames.last().unwrap().prototype().constants[ins.c() as usize].clone();
                            display_string_constant(&c)
                        };
                        match Self::get_field(&recv, &name) {
                            Ok(v) => self.set_reg(ins.a(), v),
                            Err(k) => self.raise(k)?,
                        }
                    }
                }
                Opcode::SetField => {
                    let recv = self.reg(ins.a());
                    let name = {
                        let c = self.frames.last().unwrap().prototype().constants[ins.b() as usize].clone();
                        display_string_constant(&c)
                    };
                    let value = self.reg(ins.c());
                    if let Err(k) = Self::set_field(&recv, &name, value) {
                        self.raise(k)?;
                    }
                }

                Opcode::TypeOf => {
                    let v = self.reg(ins.b());
                    self.set_reg(ins.a(), Value::string(v.type_name()));
                }
                Opcode::Cast => {
                    let v = self.reg(ins.b());
                    let type_name = {
                        let c = self.frames.last().unwrap().prototype().constants[ins.c() as usize].clone();
                        display_string_constant(&c)
                    };
                    match Self::cast(&v, &type_name) {
                        Ok(result) => self.set_reg(ins.a(), result),
                        Err(k) => self.raise(k)?,
                    }
                }
                Opcode::InstanceOf => {
                    let v = self.reg(ins.b());
                    let type_name = {
                        let c = self.frames.last().unwrap().prototype().constants[ins.c() as usize].clone();
                        display_string_constant(&c)
                    };
                    self.set_reg(ins.a(), Value::Bool(v.type_name() == type_name));
                }

                Opcode::Throw => {
                    let v = self.reg(ins.a());
                    self.unwind(v)?;
                }
                Opcode::TryBegin => {
                    let target = (self.frames.last().unwrap().ip as i64 + ins.sbx() as i64) as usize;
                    self.frames.last_mut().unwrap().handlers.push(frame::TryHandler { catch_target: target });
                }
                Opcode::TryEnd => {
                    self.frames.last_mut().unwrap().handlers.pop();
                }
                Opcode::Catch => {
                    let v = self.pending_exception.take().unwrap_or(Value::Null);
                    self.set_reg(ins.a(), v);
                }
                Opcode::DeferPush => {
                    let v = self.reg(ins.a());
                    self.frames.last_mut().unwrap().defers.push(v);
                }
                Opcode::DeferPop => self.pop_one_defer()?,
                Opcode::DeferExecAll => self.drain_defers_current()?,

                Opcode::Spawn => self.dispatch_spawn(ins)?,
                Opcode::Await => {
                    let task = self.reg(ins.b());
                    let Value::Task(handle) = task else {
                        let k = RuntimeErrorKind::TypeError("await requires a task".into());
                        self.raise(k)?;
                        continue;
                    };
                    let key = Rc::as_ptr(&handle.inner) as usize;
                    let state = self.task_results.get(&key).cloned();
                    match state {
                        Some(TaskState::Resolved(v)) => self.set_reg(ins.a(), v),
                        Some(TaskState::Failed(kind)) => self.raise(kind)?,
                        Some(TaskState::Cancelled) => self.raise(RuntimeErrorKind::Cancelled)?,
                        None => {
                            let k = RuntimeErrorKind::CallError("task has no recorded result".into());
                            self.raise(k)?;
                        }
                    }
                }
                Opcode::Yield => {
                    // This core runs spawned tasks eagerly to completion
                    // (see `crate::scheduler`), so there is no live
                    // coroutine to suspend: `yield` passes its operand
                    // through unchanged.
                    tracing::debug!(target: "svm_core::vm", "yield is a pass-through in this scheduler");
                }

                Opcode::Nop => {}
                Opcode::Panic => {
                    let v = self.reg(ins.a());
                    return Err(self.err(RuntimeErrorKind::Panic(v.to_display_string())));
                }
                Opcode::Assert => {
                    if !self.reg(ins.a()).is_truthy() {
                        let message = self.reg(ins.b()).to_display_string();
                        self.raise(RuntimeErrorKind::AssertionFailed(message))?;
                    }
                }
                Opcode::Print => {
                    let text = self.reg(ins.a()).to_display_string();
                    // A host that hands in a `Vec<String>` wants prints captured
                    // (tests, an embedding REPL) rather than written to stdout.
                    if let Some(sink) = self.host.downcast_mut::<Vec<String>>() {
                        sink.push(text);
                    } else {
                        println!("{text}");
                    }
                }
                Opcode::Inc | Opcode::Dec => {
                    let v = self.reg(ins.a());
                    let delta = if matches!(op, Opcode::Inc) { 1 } else { -1 };
                    match Self::step_numeric(&v, delta) {
                        Ok(result) => self.set_reg(ins.a(), result),
                        Err(k) => self.raise(k)?,
                    }
                }
                Opcode::Concat => {
                    let (a, b) = (self.reg(ins.b()), self.reg(ins.c()));
                    let s = format!("{}{}", a.to_display_string(), b.to_display_string());
                    self.set_reg(ins.a(), Value::string(s));
                }
                Opcode::Import => {
                    let idx = ins.bx() as usize;
                    let path = {
                        let c = self.frames.last().unwrap().prototype().constants[idx].clone();
                        display_string_constant(&c)
                    };
                    match self.modules.get(&path).cloned() {
                        Some(v) => self.set_reg(ins.a(), v),
                        None => {
                            let k = RuntimeErrorKind::CallError(format!("module '{path}' not found"));
                            self.raise(k)?;
                        }
                    }
                }
                Opcode::Export => {
                    let idx = ins.bx() as usize;
                    let name = {
                        let c = self.frames.last().unwrap().prototype().constants[idx].clone();
                        display_string_constant(&c)
                    };
                    let v = self.reg(ins.a());
                    self.exports.insert(name, v);
                }
                Opcode::CallBuiltin => self.dispatch_call_builtin(ins)?,
            }
        }
    }

    fn dispatch_call(&mut self, ins: Instruction) -> Result<(), RuntimeError> {
        let a = ins.a();
        let argc = ins.b() as usize;
        let callee = self.reg(a);
        let base = self.frames.last().unwrap().base;
        let args: Vec<Value> = (1..=argc).map(|i| self.stack[base + a as usize + i].clone()).collect();
        match callee {
            Value::Function(closure) => {
                self.push_frame(closure, args, a)?;
            }
            other => {
                let result = self.call_value(other, args);
                match result {
                    Ok(v) => self.set_reg(a, v),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn dispatch_spawn(&mut self, ins: Instruction) -> Result<(), RuntimeError> {
        let a = ins.a();
        let argc = ins.b() as usize;
        let callee = self.reg(a);
        let base = self.frames.last().unwrap().base;
        let args: Vec<Value> = (1..=argc).map(|i| self.stack[base + a as usize + i].clone()).collect();
        let state = match self.call_value(callee, args) {
            Ok(v) => TaskState::Resolved(v),
            Err(e) => TaskState::Failed(e.kind),
        };
        let handle = Handle::new(TaskMarker);
        let key = Rc::as_ptr(&handle.inner) as usize;
        self.task_results.insert(key, state);
        self.set_reg(a, Value::Task(handle));
        Ok(())
    }

    fn dispatch_make_closure(&mut self, ins: Instruction) {
        let dest = ins.a();
        let child_index = ins.bx() as usize;
        let (child_proto, current_closure, base) = {
            let frame = self.frames.last().unwrap();
            (frame.prototype().children[child_index].clone(), frame.closure.clone(), frame.base)
        };
        let upvalues = child_proto
            .upvalues
            .iter()
            .map(|desc| {
                if desc.is_local {
                    self.find_or_open_upvalue(base + desc.index as usize)
                } else {
                    current_closure.upvalues[desc.index as usize].clone()
                }
            })
            .collect();
        let closure = Rc::new(Closure { prototype: child_proto, upvalues });
        self.set_reg(dest, Value::Function(closure));
    }

    fn dispatch_call_builtin(&mut self, ins: Instruction) -> Result<(), RuntimeError> {
        let dest = ins.a();
        let id = crate::builtins::BuiltinId(ins.b() as u32);
        let argc = ins.c() as usize;
        let base = self.frames.last().unwrap().base;
        let args: Vec<Value> = (1..=argc).map(|i| self.stack[base + dest as usize + i].clone()).collect();
        let Some(f) = self.builtins.and_then(|b| b.get(id)) else {
            let k = RuntimeErrorKind::CallError(format!("unregistered builtin {id}"));
            self.raise(k)?;
            return Ok(());
        };
        let mut ctx = ExecutionContext::new(&self.registered_types, self.host);
        let result = f(&args, &mut ctx);
        if ctx.exception_state.is_throwing {
            let value = ctx.exception_state.exception_value.unwrap_or(Value::Null);
            self.unwind(value)?;
        } else {
            self.set_reg(dest, result);
        }
        Ok(())
    }

    fn get_index(&self, recv: &Value, idx: &Value) -> Result<Value, RuntimeErrorKind> {
        match recv {
            Value::Array(items) => {
                let i = Self::as_i64(idx);
                let items = items.borrow();
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| RuntimeErrorKind::IndexError(format!("index {i} out of bounds")))
            }
            Value::Object(map) => {
                let key = idx.to_display_string();
                map.borrow()
                    .get(key.as_str())
                    .cloned()
                    .ok_or_else(|| RuntimeErrorKind::KeyError(key))
            }
            Value::Buffer(buf) => {
                let i = Self::as_i64(idx);
                usize::try_from(i)
                    .ok()
                    .and_then(|i| buf.get(i))
                    .map(Value::U8)
                    .ok_or_else(|| RuntimeErrorKind::IndexError(format!("index {i} out of bounds")))
            }
            Value::String(s) => {
                let i = Self::as_i64(idx);
                usize::try_from(i)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(Value::Rune)
                    .ok_or_else(|| RuntimeErrorKind::IndexError(format!("index {i} out of bounds")))
            }
            other => Err(RuntimeErrorKind::TypeError(format!("cannot index '{}'", other.type_name()))),
        }
    }

    fn set_index(recv: &Value, idx: &Value, value: Value) -> Result<(), RuntimeErrorKind> {
        match recv {
            Value::Array(items) => {
                let i = Self::as_i64(idx);
                let mut items = items.borrow_mut();
                let i = usize::try_from(i).map_err(|_| RuntimeErrorKind::IndexError(format!("index {i} out of bounds")))?;
                let slot = items
                    .get_mut(i)
                    .ok_or_else(|| RuntimeErrorKind::IndexError(format!("index {i} out of bounds")))?;
                *slot = value;
                Ok(())
            }
            Value::Object(map) => {
                map.borrow_mut().insert(Rc::from(idx.to_display_string()), value);
                Ok(())
            }
            Value::Buffer(buf) => {
                let i = Self::as_i64(idx);
                let byte = match value {
                    Value::U8(b) => b,
                    other => Self::as_i64(&other) as u8,
                };
                let i = usize::try_from(i).map_err(|_| RuntimeErrorKind::IndexError(format!("index {i} out of bounds")))?;
                if buf.set(i, byte) {
                    Ok(())
                } else {
                    Err(RuntimeErrorKind::IndexError(format!("index {i} out of bounds")))
                }
            }
            other => Err(RuntimeErrorKind::TypeError(format!("cannot index-assign '{}'", other.type_name()))),
        }
    }

    fn get_field(recv: &Value, name: &str) -> Result<Value, RuntimeErrorKind> {
        match recv {
            Value::Object(map) => map
                .borrow()
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeErrorKind::KeyError(name.to_string())),
            Value::Array(items) if name == "length" => Ok(Value::I64(items.borrow().len() as i64)),
            Value::String(s) if name == "length" => Ok(Value::I64(s.chars().count() as i64)),
            Value::Buffer(b) if name == "length" => Ok(Value::I64(b.len() as i64)),
            other => Err(RuntimeErrorKind::TypeError(format!("'{}' has no fields", other.type_name()))),
        }
    }

    fn set_field(recv: &Value, name: &str, value: Value) -> Result<(), RuntimeErrorKind> {
        match recv {
            Value::Object(map) => {
                map.borrow_mut().insert(Rc::from(name), value);
                Ok(())
            }
            other => Err(RuntimeErrorKind::TypeError(format!("cannot set a field on '{}'", other.type_name()))),
        }
    }

    fn cast(v: &Value, type_name: &str) -> Result<Value, RuntimeErrorKind> {
        let unsupported = || RuntimeErrorKind::TypeError(format!("cannot cast '{}' to '{type_name}'", v.type_name()));
        if type_name == "string" {
            return Ok(Value::string(v.to_display_string()));
        }
        if type_name == "bool" {
            return Ok(Value::Bool(v.is_truthy()));
        }
        if !v.is_numeric() && !matches!(v, Value::Rune(_)) {
            return Err(unsupported());
        }
        let n = match v {
            Value::Rune(c) => *c as i64,
            other => Self::as_i64(other),
        };
        let f = v.as_f64().unwrap_or(n as f64);
        Ok(match type_name {
            "i8" => Value::I8(n as i8),
            "i16" => Value::I16(n as i16),
            "i32" => Value::I32(n as i32),
            "i64" => Value::I64(n),
            "u8" => Value::U8(n as u8),
            "u16" => Value::U16(n as u16),
            "u32" => Value::U32(n as u32),
            "u64" => Value::U64(n as u64),
            "f32" => Value::F32(f as f32),
            "f64" => Value::F64(f),
            "rune" => Value::Rune(char::from_u32(n as u32).unwrap_or('\u{FFFD}')),
            _ => return Err(unsupported()),
        })
    }

    fn step_numeric(v: &Value, delta: i64) -> Result<Value, RuntimeErrorKind> {
        match v {
            Value::I8(n) => Ok(Value::I8(n.wrapping_add(delta as i8))),
            Value::I16(n) => Ok(Value::I16(n.wrapping_add(delta as i16))),
            Value::I32(n) => Ok(Value::I32(n.wrapping_add(delta as i32))),
            Value::I64(n) => Ok(Value::I64(n.wrapping_add(delta))),
            Value::U8(n) => Ok(Value::U8(n.wrapping_add(delta as u8))),
            Value::F32(n) => Ok(Value::F32(n + delta as f32)),
            Value::F64(n) => Ok(Value::F64(n + delta as f64)),
            other => Err(RuntimeErrorKind::TypeError(format!("cannot increment/decrement '{}'", other.type_name()))),
        }
    }
}

fn constant_to_value(c: &crate::chunk::Constant) -> Value {
    use crate::chunk::Constant;
    match c {
        Constant::Null => Value::Null,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::I32(n) => Value::I32(*n),
        Constant::I64(n) => Value::I64(*n),
        Constant::F64(n) => Value::F64(*n),
        Constant::Rune(c) => Value::Rune(*c),
        Constant::String(s) => Value::string(s.as_str()),
    }
}

fn display_string_constant(c: &crate::chunk::Constant) -> String {
    match c {
        crate::chunk::Constant::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Constant, Prototype};
    use crate::opcode::Instruction;
    use crate::span::Span;

    fn run(proto: Prototype) -> Result<Value, RuntimeError> {
        let mut host = ();
        let mut vm = Vm::new(None, &mut host, VmConfig::default());
        vm.run_script(Rc::new(proto))
    }

    #[test]
    fn returns_a_constant() {
        let mut p = Prototype::new("<script>", "<test>");
        p.max_stack_size = 1;
        let k = p.add_constant(Constant::I32(42));
        p.emit(Instruction::encode_abx(Opcode::LoadConst, 0, k), Span::dummy());
        p.emit(Instruction::encode_ab(Opcode::Return, 0, 1), Span::dummy());
        assert_eq!(run(p).unwrap(), Value::I32(42));
    }

    #[test]
    fn arithmetic_widens_to_f64_on_division() {
        let mut p = Prototype::new("<script>", "<test>");
        p.max_stack_size = 3;
        let k10 = p.add_constant(Constant::I64(25));
        let k2 = p.add_constant(Constant::I32(2));
        p.emit(Instruction::encode_abx(Opcode::LoadConst, 0, k10), Span::dummy());
        p.emit(Instruction::encode_abx(Opcode::LoadConst, 1, k2), Span::dummy());
        p.emit(Instruction::encode_abc(Opcode::Div, 2, 0, 1), Span::dummy());
        p.emit(Instruction::encode_ab(Opcode::Return, 2, 1), Span::dummy());
        assert_eq!(run(p).unwrap(), Value::F64(12.5));
    }

    #[test]
    fn division_by_zero_is_catchable() {
        let mut p = Prototype::new("<script>", "<test>");
        p.max_stack_size = 3;
        let k0 = p.add_constant(Constant::I32(1));
        let kz = p.add_constant(Constant::I32(0));
        // try { 1 / 0 } catch (e) { return e }
        let try_begin = p.emit(Instruction::encode_asbx(Opcode::TryBegin, 0, 0), Span::dummy());
        p.emit(Instruction::encode_abx(Opcode::LoadConst, 0, k0), Span::dummy());
        p.emit(Instruction::encode_abx(Opcode::LoadConst, 1, kz), Span::dummy());
        p.emit(Instruction::encode_abc(Opcode::Div, 2, 0, 1), Span::dummy());
        p.emit(Instruction::encode_a(Opcode::TryEnd, 0), Span::dummy());
        let end_jump = p.emit(Instruction::encode_sax(Opcode::Jmp, 0), Span::dummy());
        let catch_pc = p.current_offset();
        p.emit(Instruction::encode_a(Opcode::Catch, 2), Span::dummy());
        let after_catch = p.current_offset();
        p.emit(Instruction::encode_ab(Opcode::Return, 2, 1), Span::dummy());

        let delta_try = catch_pc as i64 - try_begin as i64 - 1;
        p.code[try_begin] = Instruction::encode_asbx(Opcode::TryBegin, 0, delta_try as i32);
        let delta_end = after_catch as i64 - end_jump as i64 - 1;
        p.code[end_jump] = Instruction::encode_sax(Opcode::Jmp, delta_end as i32);

        let result = run(p).unwrap();
        match result {
            Value::Object(map) => {
                assert_eq!(map.borrow().get("kind").cloned(), Some(Value::string("DivisionByZero")));
            }
            other => panic!("expected exception object, got {other:?}"),
        }
    }
}

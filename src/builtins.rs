//! The built-in call contract (spec §6) and the registry collaborator
//! modules use to plug host functionality into `CallBuiltin`.
//!
//! This core ships the calling convention only: no concrete built-ins
//! (printing is its own opcode, not a built-in; I/O, collections, and timers
//! are out of scope per spec §1). A host embedding this crate registers its
//! own functions with [`BuiltinRegistry::register`] and wires the resulting
//! [`BuiltinId`]s into whatever name-resolution step feeds the compiler.

use crate::value::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Index into a [`BuiltinRegistry`], stored directly in `Value::BuiltinFn`
/// and as the `CallBuiltin` instruction's builtin-id operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuiltinId(pub u32);

impl fmt::Display for BuiltinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutable state a built-in can affect besides its return value, per the
/// spec §6 built-in call contract: an exception slot, a return slot for
/// early returns, a registry of registered types, and a host-service escape
/// hatch for whatever the embedder needs to expose (no enclosing-VM type is
/// named at this layer, so it's reached through `Any`).
pub struct ExecutionContext<'a> {
    pub exception_state: ExceptionState,
    pub return_slot: Option<Value>,
    pub registered_types: &'a HashMap<String, Value>,
    pub host: &'a mut dyn Any,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(registered_types: &'a HashMap<String, Value>, host: &'a mut dyn Any) -> Self {
        Self {
            exception_state: ExceptionState::default(),
            return_slot: None,
            registered_types,
            host,
        }
    }

    /// Signal failure the way the spec's built-in contract requires: set the
    /// throwing flag and stash the exception value for the VM to pick up.
    pub fn throw(&mut self, value: Value) {
        self.exception_state.is_throwing = true;
        self.exception_state.exception_value = Some(value);
    }

    pub fn throw_string(&mut self, message: impl Into<std::rc::Rc<str>>) {
        self.throw(Value::String(message.into()));
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExceptionState {
    pub is_throwing: bool,
    pub exception_value: Option<Value>,
}

/// `(args, argc, ctx) -> Value` per spec §6. `argc` is redundant with
/// `args.len()` in a Rust slice, so it's dropped from the signature; callers
/// that need the distinction (e.g. a variadic built-in ignoring trailing
/// args) can still read `args.len()`.
pub type BuiltinFn = fn(args: &[Value], ctx: &mut ExecutionContext) -> Value;

/// Name/index -> function table a host embedder populates before running
/// any bytecode that references `CallBuiltin`.
#[derive(Default)]
pub struct BuiltinRegistry {
    functions: Vec<BuiltinFn>,
    names: Vec<String>,
    by_name: HashMap<String, BuiltinId>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, returning the stable [`BuiltinId`] the
    /// compiler should bake into `CallBuiltin` instructions. Re-registering
    /// the same name replaces the function but keeps its id stable.
    pub fn register(&mut self, name: impl Into<String>, f: BuiltinFn) -> BuiltinId {
        let name = name.into();
        if let Some(&id) = self.by_name.get(&name) {
            self.functions[id.0 as usize] = f;
            return id;
        }
        let id = BuiltinId(self.functions.len() as u32);
        self.functions.push(f);
        self.names.push(name.clone());
        self.by_name.insert(name, id);
        id
    }

    pub fn resolve(&self, name: &str) -> Option<BuiltinId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: BuiltinId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    pub fn get(&self, id: BuiltinId) -> Option<BuiltinFn> {
        self.functions.get(id.0 as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(args: &[Value], _ctx: &mut ExecutionContext) -> Value {
        args.first().cloned().unwrap_or(Value::Null)
    }

    fn always_throws(_args: &[Value], ctx: &mut ExecutionContext) -> Value {
        ctx.throw_string("boom");
        Value::Null
    }

    #[test]
    fn register_then_resolve_round_trips() {
        let mut reg = BuiltinRegistry::new();
        let id = reg.register("identity", identity);
        assert_eq!(reg.resolve("identity"), Some(id));
        assert_eq!(reg.name_of(id), Some("identity"));
        let f = reg.get(id).unwrap();
        let types = HashMap::new();
        let mut host = ();
        let mut ctx = ExecutionContext::new(&types, &mut host);
        assert_eq!(f(&[Value::I32(9)], &mut ctx), Value::I32(9));
    }

    #[test]
    fn re_registering_a_name_keeps_its_id() {
        let mut reg = BuiltinRegistry::new();
        let a = reg.register("f", identity);
        let b = reg.register("f", always_throws);
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn builtin_can_signal_failure_via_context() {
        let types = HashMap::new();
        let mut host = ();
        let mut ctx = ExecutionContext::new(&types, &mut host);
        let _ = always_throws(&[], &mut ctx);
        assert!(ctx.exception_state.is_throwing);
        assert_eq!(ctx.exception_state.exception_value, Some(Value::string("boom")));
    }
}

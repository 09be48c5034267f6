//! The crate's single top-level façade (spec §6, EXPANSION 6.1).
//!
//! Everything upstream of this core — lexing, parsing, FFI, CLI — lives in
//! collaborator crates; [`Runtime`] is where they hand in a parsed
//! [`Program`] (or a previously-serialized module) and get a result back,
//! without needing to know about [`Resolver`], [`Compiler`], or [`Vm`]
//! individually. Grounded on the teacher's `Atlas`/`RuntimeResult` façade
//! (`runtime.rs`), generalized past one source language's specific API.

use crate::ast::Program;
use crate::builtins::BuiltinRegistry;
use crate::chunk::{self, Prototype};
use crate::compiler::Compiler;
use crate::error::CoreError;
use crate::resolver::Resolver;
use crate::value::Value;
use crate::vm::{Vm, VmConfig};
use std::any::Any;
use std::rc::Rc;

/// Embedder-facing configuration for a single [`Runtime`] (EXPANSION 2.1).
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub vm: VmConfig,
}

/// Ties resolver → compiler → VM together behind one call.
///
/// A `Runtime` owns the global/module state that should persist across
/// multiple `run_*` calls against the same embedding (e.g. a REPL handing in
/// one top-level statement at a time); each call still gets a fresh `Vm`
/// frame stack, since `run_script` always starts a new script activation.
pub struct Runtime {
    options: Options,
    builtins: BuiltinRegistry,
}

impl Runtime {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            builtins: BuiltinRegistry::new(),
        }
    }

    pub fn builtins_mut(&mut self) -> &mut BuiltinRegistry {
        &mut self.builtins
    }

    /// Resolve, compile, and run an already-parsed program (spec §6
    /// `run_source`; lexing/parsing a file path into this `Program` is a
    /// collaborator's job, per spec §1).
    pub fn run_source(&self, program: &Program, source_file: impl Into<String>, host: &mut dyn Any) -> Result<Value, CoreError> {
        let prototype = self.compile(program, source_file)?;
        self.run_prototype(prototype, host)
    }

    /// Compile without running, for collaborators that want to serialize the
    /// result (e.g. a build tool producing a `.svmb` file) rather than
    /// execute it immediately.
    pub fn compile(&self, program: &Program, source_file: impl Into<String>) -> Result<Rc<Prototype>, CoreError> {
        let resolutions = Resolver::new()
            .resolve_program(program)
            .map_err(|errors| CoreError::Compile(errors.into_iter().map(|e| crate::error::Diagnostic::error(e.message, 0)).collect()))?;
        let compiler = Compiler::new(&resolutions, source_file, Some(&self.builtins));
        let proto = compiler.compile_program(program).map_err(CoreError::Compile)?;
        Ok(Rc::new(proto))
    }

    /// Deserialize and run a previously-compiled module (spec §6
    /// `run_module`).
    pub fn run_module(&self, bytes: &[u8], host: &mut dyn Any) -> Result<Value, CoreError> {
        let prototype = chunk::from_bytes(bytes)?;
        chunk::validate(&prototype).map_err(|errors| {
            CoreError::Compile(errors.into_iter().map(|e| crate::error::Diagnostic::error(e.to_string(), 0)).collect())
        })?;
        self.run_prototype(Rc::new(prototype), host)
    }

    fn run_prototype(&self, prototype: Rc<Prototype>, host: &mut dyn Any) -> Result<Value, CoreError> {
        let mut vm = Vm::new(Some(&self.builtins), host, self.options.vm.clone());
        tracing::debug!(target: "svm_core::runtime", "running script prototype");
        vm.run_script(prototype).map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::span::Span;

    fn dummy_program_returning(n: i64) -> Program {
        Program {
            statements: vec![Stmt {
                kind: StmtKind::Return(Some(Expr {
                    kind: ExprKind::Int(n),
                    span: Span::dummy(),
                })),
                span: Span::dummy(),
            }],
        }
    }

    #[test]
    fn run_source_executes_a_trivial_program() {
        let runtime = Runtime::new(Options::default());
        let program = dummy_program_returning(42);
        let mut host: () = ();
        let result = runtime.run_source(&program, "<test>", &mut host).unwrap();
        assert_eq!(result, Value::I32(42));
    }

    #[test]
    fn compiled_module_round_trips_through_bytes_and_runs() {
        let runtime = Runtime::new(Options::default());
        let program = dummy_program_returning(7);
        let prototype = runtime.compile(&program, "<test>").unwrap();
        let bytes = chunk::to_bytes(&prototype);
        let mut host: () = ();
        let result = runtime.run_module(&bytes, &mut host).unwrap();
        assert_eq!(result, Value::I32(7));
    }
}

//! A register-based bytecode virtual machine and AST-to-bytecode compiler
//! for a dynamic scripting language.
//!
//! This crate is the core of an interpreter, not a whole language
//! implementation: lexing, parsing, built-in functions beyond the call
//! contract, FFI shared-library loading, networking, and CLI/bundler
//! tooling are all collaborators that sit on top of what's here. What this
//! crate owns is the pipeline from an already-parsed AST down to running
//! bytecode:
//!
//! `ast::Program` → [`resolver::Resolver`] → [`compiler::Compiler`] →
//! [`chunk::Prototype`] → (optionally serialized to a `.svmb` module) →
//! [`vm::Vm`]
//!
//! [`runtime::Runtime`] wires all of that together behind one call for
//! embedders that don't need to touch the individual passes.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ast;
pub mod builtins;
pub mod chunk;
pub mod compiler;
pub mod error;
pub mod opcode;
pub mod report;
pub mod resolver;
pub mod runtime;
pub mod scheduler;
pub mod span;
pub mod value;
pub mod vm;

pub use builtins::{BuiltinFn, BuiltinId, BuiltinRegistry, ExecutionContext};
pub use chunk::{Constant, Prototype};
pub use compiler::Compiler;
pub use error::{CoreError, Diagnostic, DiagnosticLevel, RuntimeError, RuntimeErrorKind};
pub use opcode::{Instruction, Opcode};
pub use resolver::{Resolution, ResolutionMap, Resolver};
pub use runtime::{Options, Runtime};
pub use span::Span;
pub use value::Value;
pub use vm::{Vm, VmConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_cargo_package_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}

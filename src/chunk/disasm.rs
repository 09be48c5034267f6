//! Bytecode disassembler.
//!
//! Converts a compiled [`Prototype`] back into a human-readable listing for
//! debugging, golden-file tests, and any future `--disasm` tooling built on
//! top of this crate.
//!
//! ```text
//! === main (arity=1, max_stack=4) ===
//! -- constants --
//! 0: 42i64
//! -- code --
//! 0000  7  LOADCONST   A=0 Bx=0
//! 0001  7  RETURN      A=0 B=1
//! -- prototypes --
//! [0] inner (arity=0, max_stack=1)
//! ...
//! ```

use super::Prototype;
use crate::opcode::Format;
use std::fmt::Write;

/// Disassemble `proto` and all of its nested prototypes into one listing.
pub fn disassemble(proto: &Prototype) -> String {
    let mut out = String::new();
    disassemble_into(proto, &mut out, 0);
    out
}

fn disassemble_into(proto: &Prototype, out: &mut String, depth: usize) {
    let indent = "  ".repeat(depth);
    writeln!(
        out,
        "{indent}=== {} (arity={}, variadic={}, async={}, max_stack={}) ===",
        proto.name, proto.arity, proto.is_variadic, proto.is_async, proto.max_stack_size
    )
    .unwrap();

    if !proto.constants.is_empty() {
        writeln!(out, "{indent}-- constants --").unwrap();
        for (idx, constant) in proto.constants.iter().enumerate() {
            writeln!(out, "{indent}{idx}: {constant}").unwrap();
        }
    }

    if !proto.upvalues.is_empty() {
        writeln!(out, "{indent}-- upvalues --").unwrap();
        for (idx, uv) in proto.upvalues.iter().enumerate() {
            let source = if uv.is_local { "local" } else { "upvalue" };
            writeln!(out, "{indent}{idx}: {source} #{}", uv.index).unwrap();
        }
    }

    writeln!(out, "{indent}-- code --").unwrap();
    for (pc, ins) in proto.code.iter().enumerate() {
        let line = proto.lines.line_for(pc as u32);
        writeln!(out, "{indent}{}", format_instruction(pc, line, ins)).unwrap();
    }

    if !proto.children.is_empty() {
        writeln!(out, "{indent}-- prototypes --").unwrap();
        for (idx, child) in proto.children.iter().enumerate() {
            writeln!(out, "{indent}[{idx}]").unwrap();
            disassemble_into(child, out, depth + 1);
        }
    }
}

fn format_instruction(pc: usize, line: u32, ins: &crate::opcode::Instruction) -> String {
    let Some(op) = ins.opcode() else {
        return format!("{pc:04}  {line:>4}  <unknown opcode {:#04x}>", ins.0 >> 24);
    };
    let name = format!("{op:?}").to_uppercase();
    let operands = match op.format() {
        Format::Abc => format!("A={} B={} C={}", ins.a(), ins.b(), ins.c()),
        Format::Ab => format!("A={} B={}", ins.a(), ins.b()),
        Format::A => format!("A={}", ins.a()),
        Format::Abx => format!("A={} Bx={}", ins.a(), ins.bx()),
        Format::AsBx => {
            let target = pc as i64 + 1 + ins.sbx() as i64;
            format!("A={} sBx={} (-> {:04})", ins.a(), ins.sbx(), target.max(0))
        }
        Format::SAx => {
            let target = pc as i64 + 1 + ins.sax() as i64;
            format!("sAx={} (-> {:04})", ins.sax(), target.max(0))
        }
    };
    format!("{pc:04}  {line:>4}  {name:<16}{operands}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Constant;
    use crate::opcode::{Instruction, Opcode};
    use crate::span::Span;

    #[test]
    fn disassembly_lists_constants_and_code() {
        let mut proto = crate::chunk::Prototype::new("main", "<test>");
        let k = proto.add_constant(Constant::I64(7));
        proto.max_stack_size = 2;
        proto.emit(
            Instruction::encode_abx(Opcode::LoadConst, 0, k),
            Span::new(0, 1, 1),
        );
        proto.emit(Instruction::encode_ab(Opcode::Return, 0, 1), Span::new(1, 2, 2));

        let text = disassemble(&proto);
        assert!(text.contains("=== main"));
        assert!(text.contains("-- constants --"));
        assert!(text.contains("0: 7i64"));
        assert!(text.contains("LOADCONST"));
        assert!(text.contains("RETURN"));
    }

    #[test]
    fn unknown_opcode_byte_is_reported_not_panicked() {
        let ins = Instruction(0xFF00_0000);
        assert!(format_instruction(0, 1, &ins).contains("unknown opcode"));
    }
}

//! Bytecode validator — static analysis run before a [`Prototype`] is handed
//! to the VM.
//!
//! Performs four checks over every instruction:
//! 1. **Decode** — the opcode byte maps to a known [`Opcode`]
//! 2. **Register bounds** — every register operand falls within `[0, max_stack_size)`
//! 3. **Pool bounds** — constant/upvalue/child-prototype indices fall within
//!    their respective tables
//! 4. **Jump targets** — every relative jump lands within `[0, code.len()]`
//!
//! Call sites are free to ignore the result; the validator is advisory and
//! does not affect VM execution. It exists to turn a corrupt or
//! hand-assembled module into a diagnosable error instead of an out-of-bounds
//! panic deep in the dispatch loop.

use super::Prototype;
use crate::opcode::{Format, Instruction, Opcode};

/// A validation error with the instruction offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Instruction index (not byte offset — every instruction is one `u32`).
    pub pc: usize,
    pub kind: ValidationErrorKind,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pc {:04}: {}", self.pc, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    UnknownOpcode(u8),
    RegisterOutOfBounds { register: u16, max: u8 },
    ConstantIndexOutOfBounds { index: u16, pool_size: usize },
    UpvalueIndexOutOfBounds { index: u16, upvalue_count: usize },
    ChildIndexOutOfBounds { index: u16, child_count: usize },
    JumpOutOfBounds { target: i64, code_len: usize },
    MissingTerminator,
}

impl std::fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOpcode(b) => write!(f, "unknown opcode byte {b:#04x}"),
            Self::RegisterOutOfBounds { register, max } => {
                write!(f, "register {register} out of bounds (max_stack_size={max})")
            }
            Self::ConstantIndexOutOfBounds { index, pool_size } => {
                write!(f, "constant index {index} out of bounds (pool size={pool_size})")
            }
            Self::UpvalueIndexOutOfBounds {
                index,
                upvalue_count,
            } => write!(f, "upvalue index {index} out of bounds (count={upvalue_count})"),
            Self::ChildIndexOutOfBounds { index, child_count } => {
                write!(f, "child prototype index {index} out of bounds (count={child_count})")
            }
            Self::JumpOutOfBounds { target, code_len } => {
                write!(f, "jump target {target} out of bounds (code len={code_len})")
            }
            Self::MissingTerminator => write!(f, "prototype does not end with Return"),
        }
    }
}

/// Validate `proto` and every nested child prototype, collecting every
/// problem found rather than stopping at the first.
pub fn validate(proto: &Prototype) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    validate_one(proto, &mut errors);
    for child in &proto.children {
        if let Err(child_errors) = validate(child) {
            errors.extend(child_errors);
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_one(proto: &Prototype, errors: &mut Vec<ValidationError>) {
    let max = proto.max_stack_size;
    let const_len = proto.constants.len();
    let upvalue_len = proto.upvalues.len();
    let child_len = proto.children.len();
    let code_len = proto.code.len();

    let mut check_reg = |pc: usize, reg: u8, errors: &mut Vec<ValidationError>| {
        if reg >= max {
            errors.push(ValidationError {
                pc,
                kind: ValidationErrorKind::RegisterOutOfBounds {
                    register: reg as u16,
                    max,
                },
            });
        }
    };
    let check_const = |pc: usize, idx: u16, errors: &mut Vec<ValidationError>| {
        if idx as usize >= const_len {
            errors.push(ValidationError {
                pc,
                kind: ValidationErrorKind::ConstantIndexOutOfBounds {
                    index: idx,
                    pool_size: const_len,
                },
            });
        }
    };

    for (pc, ins) in proto.code.iter().enumerate() {
        let Some(op) = ins.opcode() else {
            errors.push(ValidationError {
                pc,
                kind: ValidationErrorKind::UnknownOpcode((ins.0 >> 24) as u8),
            });
            continue;
        };

        match op.format() {
            Format::Abc => {
                check_reg(pc, ins.a(), errors);
                match op {
                    Opcode::GetField | Opcode::SetField | Opcode::GetFieldOptional => {
                        check_reg(pc, ins.b(), errors);
                        check_const(pc, ins.c() as u16, errors);
                    }
                    Opcode::InstanceOf => {
                        check_reg(pc, ins.b(), errors);
                        check_const(pc, ins.c() as u16, errors);
                    }
                    Opcode::Cast | Opcode::Call | Opcode::TailCall | Opcode::Spawn | Opcode::CallBuiltin => {
                        // B/C carry type tags, arg/return counts, or a builtin id,
                        // not register indices — only A is checked.
                    }
                    _ => {
                        check_reg(pc, ins.b(), errors);
                        check_reg(pc, ins.c(), errors);
                    }
                }
            }
            Format::Ab => {
                check_reg(pc, ins.a(), errors);
                match op {
                    Opcode::NewArray | Opcode::NewObject | Opcode::Return => {
                        // B is a count, not a register.
                    }
                    _ => check_reg(pc, ins.b(), errors),
                }
            }
            Format::A => {
                check_reg(pc, ins.a(), errors);
            }
            Format::Abx => {
                check_reg(pc, ins.a(), errors);
                match op {
                    Opcode::LoadConst | Opcode::LoadGlobal | Opcode::StoreGlobal | Opcode::Import | Opcode::Export => {
                        check_const(pc, ins.bx(), errors);
                    }
                    Opcode::LoadUpvalue | Opcode::StoreUpvalue => {
                        if ins.bx() as usize >= upvalue_len {
                            errors.push(ValidationError {
                                pc,
                                kind: ValidationErrorKind::UpvalueIndexOutOfBounds {
                                    index: ins.bx(),
                                    upvalue_count: upvalue_len,
                                },
                            });
                        }
                    }
                    Opcode::MakeClosure => {
                        if ins.bx() as usize >= child_len {
                            errors.push(ValidationError {
                                pc,
                                kind: ValidationErrorKind::ChildIndexOutOfBounds {
                                    index: ins.bx(),
                                    child_count: child_len,
                                },
                            });
                        }
                    }
                    Opcode::LoadLocal | Opcode::StoreLocal => {
                        if ins.bx() >= max as u16 {
                            errors.push(ValidationError {
                                pc,
                                kind: ValidationErrorKind::RegisterOutOfBounds {
                                    register: ins.bx(),
                                    max,
                                },
                            });
                        }
                    }
                    _ => {}
                }
            }
            Format::AsBx => {
                if !matches!(op, Opcode::TryBegin) {
                    check_reg(pc, ins.a(), errors);
                }
                check_jump(pc, ins, code_len, errors);
            }
            Format::SAx => {
                check_jump(pc, ins, code_len, errors);
            }
        }
    }

    check_terminator(proto, errors);
}

fn check_jump(pc: usize, ins: &Instruction, code_len: usize, errors: &mut Vec<ValidationError>) {
    let offset = match ins.opcode().unwrap().format() {
        Format::AsBx => ins.sbx() as i64,
        Format::SAx => ins.sax() as i64,
        _ => unreachable!("check_jump only called for jump formats"),
    };
    let target = pc as i64 + 1 + offset;
    if target < 0 || target as usize > code_len {
        errors.push(ValidationError {
            pc,
            kind: ValidationErrorKind::JumpOutOfBounds { target, code_len },
        });
    }
}

fn check_terminator(proto: &Prototype, errors: &mut Vec<ValidationError>) {
    match proto.code.last().and_then(|ins| ins.opcode()) {
        Some(Opcode::Return) => {}
        _ => errors.push(ValidationError {
            pc: proto.code.len().saturating_sub(1),
            kind: ValidationErrorKind::MissingTerminator,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Constant;
    use crate::span::Span;

    fn base() -> Prototype {
        let mut p = Prototype::new("main", "<test>");
        p.max_stack_size = 2;
        p
    }

    #[test]
    fn valid_prototype_passes() {
        let mut p = base();
        let k = p.add_constant(Constant::I64(1));
        p.emit(Instruction::encode_abx(Opcode::LoadConst, 0, k), Span::dummy());
        p.emit(Instruction::encode_ab(Opcode::Return, 0, 1), Span::dummy());
        assert!(validate(&p).is_ok());
    }

    #[test]
    fn out_of_range_register_is_reported() {
        let mut p = base();
        p.emit(Instruction::encode_abc(Opcode::Add, 9, 0, 0), Span::dummy());
        p.emit(Instruction::encode_ab(Opcode::Return, 0, 0), Span::dummy());
        let errs = validate(&p).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, ValidationErrorKind::RegisterOutOfBounds { register: 9, .. })));
    }

    #[test]
    fn out_of_range_constant_is_reported() {
        let mut p = base();
        p.emit(Instruction::encode_abx(Opcode::LoadConst, 0, 5), Span::dummy());
        p.emit(Instruction::encode_ab(Opcode::Return, 0, 0), Span::dummy());
        let errs = validate(&p).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, ValidationErrorKind::ConstantIndexOutOfBounds { .. })));
    }

    #[test]
    fn missing_terminator_is_reported() {
        let mut p = base();
        p.emit(Instruction::encode_a(Opcode::Nop, 0), Span::dummy());
        let errs = validate(&p).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, ValidationErrorKind::MissingTerminator)));
    }

    #[test]
    fn jump_out_of_bounds_is_reported() {
        let mut p = base();
        p.emit(Instruction::encode_sax(Opcode::Jmp, 1000), Span::dummy());
        p.emit(Instruction::encode_ab(Opcode::Return, 0, 0), Span::dummy());
        let errs = validate(&p).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, ValidationErrorKind::JumpOutOfBounds { .. })));
    }
}

//! Table-driven opcode behavior tests (spec §4.5 arithmetic widening; spec
//! §8 scenario 2 "Division"). Placement mirrors the teacher's
//! `tests/vm/opcodes.rs`; `rstest` drives the table, `pretty_assertions`
//! gives a readable diff when a widening rule regresses.

use pretty_assertions::assert_eq;
use rstest::rstest;
use svm_core::chunk::Constant;
use svm_core::opcode::{Instruction, Opcode};
use svm_core::span::Span;
use svm_core::{Prototype, Value, Vm, VmConfig};

fn run_binary_op(op: Opcode, lhs: Constant, rhs: Constant) -> Result<Value, svm_core::RuntimeError> {
    let mut proto = Prototype::new("<script>", "<test>");
    proto.max_stack_size = 3;
    let kl = proto.add_constant(lhs);
    let kr = proto.add_constant(rhs);
    proto.emit(Instruction::encode_abx(Opcode::LoadConst, 0, kl), Span::dummy());
    proto.emit(Instruction::encode_abx(Opcode::LoadConst, 1, kr), Span::dummy());
    proto.emit(Instruction::encode_abc(op, 2, 0, 1), Span::dummy());
    proto.emit(Instruction::encode_ab(Opcode::Return, 2, 1), Span::dummy());

    let mut host: () = ();
    let mut vm = Vm::new(None, &mut host, VmConfig::default());
    vm.run_script(std::rc::Rc::new(proto))
}

#[rstest]
#[case::int_plus_int(Constant::I32(2), Constant::I32(3), Value::I32(5))]
#[case::int_plus_wide_int(Constant::I64(2), Constant::I32(3), Value::I64(5))]
#[case::int_plus_float(Constant::I32(2), Constant::F64(0.5), Value::F64(2.5))]
fn add_widens_per_spec_4_5(#[case] lhs: Constant, #[case] rhs: Constant, #[case] expected: Value) {
    let result = run_binary_op(Opcode::Add, lhs, rhs).unwrap();
    assert_eq!(result, expected);
}

#[rstest]
#[case::two_ints(Constant::I32(100), Constant::I32(4), Value::F64(25.0))]
#[case::two_floats(Constant::F64(7.5), Constant::F64(2.5), Value::F64(3.0))]
fn division_always_produces_f64(#[case] lhs: Constant, #[case] rhs: Constant, #[case] expected: Value) {
    let result = run_binary_op(Opcode::Div, lhs, rhs).unwrap();
    assert_eq!(result, expected);
}

#[test]
fn integer_division_by_zero_raises_division_by_zero() {
    let err = run_binary_op(Opcode::Div, Constant::I32(1), Constant::I32(0)).unwrap_err();
    assert_eq!(err.kind, svm_core::RuntimeErrorKind::DivisionByZero);
}

#[test]
fn modulo_of_two_integers_returns_i64() {
    let result = run_binary_op(Opcode::Mod, Constant::I32(17), Constant::I32(5)).unwrap();
    assert_eq!(result, Value::I64(2));
}

#[test]
fn modulo_rejects_float_operands() {
    let err = run_binary_op(Opcode::Mod, Constant::F64(1.0), Constant::I32(2)).unwrap_err();
    assert!(matches!(err.kind, svm_core::RuntimeErrorKind::TypeError(_)));
}

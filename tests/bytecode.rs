//! Property tests for the instruction encoding and constant pool (spec §8:
//! round-trip encoding, constant-pool dedup). Placement mirrors the
//! teacher's `tests/bytecode.rs`.

use proptest::prelude::*;
use svm_core::chunk::Constant;
use svm_core::opcode::{Instruction, Opcode};
use svm_core::Prototype;

proptest! {
    #[test]
    fn abc_instruction_round_trips(a: u8, b: u8, c: u8) {
        let ins = Instruction::encode_abc(Opcode::Add, a, b, c);
        prop_assert_eq!(ins.opcode(), Some(Opcode::Add));
        prop_assert_eq!(ins.a(), a);
        prop_assert_eq!(ins.b(), b);
        prop_assert_eq!(ins.c(), c);
    }

    #[test]
    fn abx_instruction_round_trips(a: u8, bx: u16) {
        let ins = Instruction::encode_abx(Opcode::LoadConst, a, bx);
        prop_assert_eq!(ins.opcode(), Some(Opcode::LoadConst));
        prop_assert_eq!(ins.a(), a);
        prop_assert_eq!(ins.bx(), bx);
    }

    #[test]
    fn asbx_instruction_round_trips(a: u8, sbx in -32768i32..=32767i32) {
        let ins = Instruction::encode_asbx(Opcode::JmpIfFalse, a, sbx);
        prop_assert_eq!(ins.opcode(), Some(Opcode::JmpIfFalse));
        prop_assert_eq!(ins.a(), a);
        prop_assert_eq!(ins.sbx(), sbx);
    }

    #[test]
    fn sax_instruction_round_trips(sax in -8_388_608i32..=8_388_607i32) {
        let ins = Instruction::encode_sax(Opcode::Jmp, sax);
        prop_assert_eq!(ins.opcode(), Some(Opcode::Jmp));
        prop_assert_eq!(ins.sax(), sax);
    }

    /// spec §8: "no two constants in a prototype's pool are byte-equal" —
    /// adding the same literal twice must return the same index, whatever
    /// order the other constants were added in.
    #[test]
    fn constant_pool_deduplicates_repeated_i64_literal(
        n in any::<i64>(),
        filler in prop::collection::vec(any::<i32>(), 0..8),
    ) {
        let mut proto = Prototype::new("<script>", "<test>");
        let first = proto.add_constant(Constant::I64(n));
        for f in filler {
            proto.add_constant(Constant::I32(f));
        }
        let second = proto.add_constant(Constant::I64(n));
        prop_assert_eq!(first, second);
    }

    #[test]
    fn distinct_string_constants_get_distinct_indices(a: String, b: String) {
        prop_assume!(a != b);
        let mut proto = Prototype::new("<script>", "<test>");
        let ia = proto.add_constant(Constant::String(a));
        let ib = proto.add_constant(Constant::String(b));
        prop_assert_ne!(ia, ib);
    }
}

#[test]
fn every_opcode_byte_decodes_back_to_itself() {
    for op in Opcode::ALL {
        assert_eq!(Opcode::from_u8(*op as u8), Some(*op));
    }
}

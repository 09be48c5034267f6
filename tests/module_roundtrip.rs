//! Binary module round-trip through an actual file (spec §8 "module
//! round-trip": `read(write(c))` yields a chunk identical in code/
//! constants/upvalues/prototype-tree/max-stack-size). Placement mirrors the
//! teacher's `tests/vm/` layout; `tempfile` stands in for a real `.svmb`
//! file on disk rather than round-tripping purely in memory.

use std::io::{Read, Write};
use svm_core::chunk::{self, Constant};
use svm_core::opcode::{Instruction, Opcode};
use svm_core::span::Span;
use svm_core::Prototype;

fn sample_prototype() -> Prototype {
    let mut child = Prototype::new("inner", "<test>");
    child.arity = 1;
    child.max_stack_size = 2;
    let k = child.add_constant(Constant::I32(9));
    child.emit(Instruction::encode_abx(Opcode::LoadConst, 0, k), Span::dummy());
    child.emit(Instruction::encode_ab(Opcode::Return, 0, 1), Span::dummy());

    let mut root = Prototype::new("<script>", "<test>");
    root.max_stack_size = 3;
    let greeting = root.add_constant(Constant::String("hello".into()));
    root.add_child(child);
    root.emit(Instruction::encode_abx(Opcode::LoadConst, 0, greeting), Span::dummy());
    root.emit(Instruction::encode_abx(Opcode::MakeClosure, 1, 0), Span::dummy());
    root.emit(Instruction::encode_ab(Opcode::Return, 1, 1), Span::dummy());
    root
}

#[test]
fn module_survives_a_round_trip_through_a_real_file() {
    let original = sample_prototype();
    let bytes = chunk::to_bytes(&original);

    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(&bytes).expect("write module bytes");

    let mut read_back = Vec::new();
    std::fs::File::open(file.path())
        .expect("reopen temp file")
        .read_to_end(&mut read_back)
        .expect("read module bytes back");

    let restored = chunk::from_bytes(&read_back).expect("deserialize module");

    assert_eq!(restored.name, original.name);
    assert_eq!(restored.max_stack_size, original.max_stack_size);
    assert_eq!(restored.code, original.code);
    assert_eq!(restored.constants, original.constants);
    assert_eq!(restored.children.len(), original.children.len());
    assert_eq!(restored.children[0].name, original.children[0].name);
    assert_eq!(restored.children[0].code, original.children[0].code);

    chunk::validate(&restored).expect("round-tripped module still passes validation");
}

#[test]
fn corrupted_file_bytes_are_rejected_not_panicked_on() {
    let original = sample_prototype();
    let mut bytes = chunk::to_bytes(&original);
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;

    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(&bytes).expect("write corrupted bytes");

    let mut read_back = Vec::new();
    std::fs::File::open(file.path())
        .expect("reopen temp file")
        .read_to_end(&mut read_back)
        .expect("read bytes back");

    assert!(chunk::from_bytes(&read_back).is_err());
}

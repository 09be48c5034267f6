//! Binary module format (spec §3.3 / §6), little-endian on the wire.
//!
//! Layout, in order:
//! ```text
//! u32  magic        = 0x4842_4300
//! u16  version      = 1
//! u16  name_len     ; [name_len] UTF-8 bytes
//! i32  arity
//! u8   is_async
//! i32  max_stack_size
//! i32  const_count  ; for each: u8 kind, then payload
//! i32  code_count   ; [code_count] u32 instructions
//! i32  line_count   ; [line_count] (i32 pc, i32 line)
//! i32  upvalue_count; [count] (u8 index, u8 is_local)
//! i32  proto_count  ; [count] <recursive module body, same layout>
//! ---- fields spec.md §3/§6 does not name, appended additively ----
//! u16  source_file_len; [source_file_len] UTF-8 bytes
//! u8   is_variadic
//! u32  local_debug_count; [count] local debug records
//! ---- trailer ----
//! u32  crc32        ; CRC32 (IEEE) over every byte above
//! ```
//!
//! The additive tail lets `read(write(c))` still reproduce every field
//! spec.md names, while not losing information the compiler actually
//! produces (source file, variadic flag, local debug records) when this
//! format is used for real interchange rather than just the documented
//! round-trip property.

use super::{Constant, LineTable, LocalDebugInfo, Prototype, UpvalueDesc};
use crate::opcode::Instruction;
use std::rc::Rc;

pub const MAGIC: u32 = 0x4842_4300;
pub const VERSION: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("truncated module: expected at least {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("bad magic number: expected {:#x}, found {found:#x}", MAGIC)]
    BadMagic { found: u32 },
    #[error("unsupported module version: {found} (this build supports {})", VERSION)]
    UnsupportedVersion { found: u16 },
    #[error("checksum mismatch: module data is corrupt")]
    ChecksumMismatch,
    #[error("invalid constant kind tag: {0}")]
    InvalidConstantKind(u8),
    #[error("invalid UTF-8 in module string field")]
    InvalidUtf8,
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }
    fn string(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }
    fn long_string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
    fn need(&self, n: usize) -> Result<(), ModuleError> {
        if self.pos + n > self.data.len() {
            Err(ModuleError::Truncated {
                offset: self.pos,
                needed: n,
            })
        } else {
            Ok(())
        }
    }
    fn u8(&mut self) -> Result<u8, ModuleError> {
        self.need(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }
    fn u16(&mut self) -> Result<u16, ModuleError> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.data[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }
    fn i32(&mut self) -> Result<i32, ModuleError> {
        self.need(4)?;
        let v = i32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }
    fn u32(&mut self) -> Result<u32, ModuleError> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }
    fn i64(&mut self) -> Result<i64, ModuleError> {
        self.need(8)?;
        let v = i64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }
    fn f64(&mut self) -> Result<f64, ModuleError> {
        self.need(8)?;
        let bits = u64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(f64::from_bits(bits))
    }
    fn string(&mut self) -> Result<String, ModuleError> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| ModuleError::InvalidUtf8)
    }
    fn long_string(&mut self) -> Result<String, ModuleError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| ModuleError::InvalidUtf8)
    }
}

fn write_constant(w: &mut Writer, c: &Constant) {
    match c {
        Constant::Null => w.u8(0),
        Constant::Bool(b) => {
            w.u8(1);
            w.u8(*b as u8);
        }
        Constant::I32(n) => {
            w.u8(2);
            w.i32(*n);
        }
        Constant::I64(n) => {
            w.u8(3);
            w.i64(*n);
        }
        Constant::F64(n) => {
            w.u8(4);
            w.f64(*n);
        }
        Constant::Rune(c) => {
            w.u8(5);
            w.u32(*c as u32);
        }
        Constant::String(s) => {
            w.u8(6);
            w.long_string(s);
        }
    }
}

fn read_constant(r: &mut Reader) -> Result<Constant, ModuleError> {
    let kind = r.u8()?;
    Ok(match kind {
        0 => Constant::Null,
        1 => Constant::Bool(r.u8()? != 0),
        2 => Constant::I32(r.i32()?),
        3 => Constant::I64(r.i64()?),
        4 => Constant::F64(r.f64()?),
        5 => Constant::Rune(char::from_u32(r.u32()?).unwrap_or('\u{FFFD}')),
        6 => Constant::String(r.long_string()?),
        other => return Err(ModuleError::InvalidConstantKind(other)),
    })
}

fn write_body(w: &mut Writer, proto: &Prototype) {
    w.string(&proto.name);
    w.i32(proto.arity as i32);
    w.u8(proto.is_async as u8);
    w.i32(proto.max_stack_size as i32);

    w.i32(proto.constants.len() as i32);
    for c in &proto.constants {
        write_constant(w, c);
    }

    w.i32(proto.code.len() as i32);
    for ins in &proto.code {
        w.u32(ins.0);
    }

    w.i32(proto.lines.entries().len() as i32);
    for (pc, line) in proto.lines.entries() {
        w.i32(*pc as i32);
        w.i32(*line as i32);
    }

    w.i32(proto.upvalues.len() as i32);
    for uv in &proto.upvalues {
        w.u8(uv.index);
        w.u8(uv.is_local as u8);
    }

    w.i32(proto.children.len() as i32);
    for child in &proto.children {
        write_body(w, child);
    }

    // Additive tail (EXPANSION 3.3): not named by spec.md §3/§6.
    w.string(&proto.source_file);
    w.u8(proto.is_variadic as u8);
    w.u32(proto.locals_debug.len() as u32);
    for local in &proto.locals_debug {
        w.long_string(&local.name);
        w.u32(local.depth);
        w.u8(local.slot);
        w.u32(local.start_pc);
        w.u32(local.end_pc);
        w.u8(local.is_const as u8);
        w.u8(local.is_captured as u8);
    }
}

fn read_body(r: &mut Reader) -> Result<Prototype, ModuleError> {
    let name = r.string()?;
    let arity = r.i32()? as u8;
    let is_async = r.u8()? != 0;
    let max_stack_size = r.i32()? as u8;

    let const_count = r.i32()? as usize;
    let mut constants = Vec::with_capacity(const_count);
    for _ in 0..const_count {
        constants.push(read_constant(r)?);
    }

    let code_count = r.i32()? as usize;
    let mut code = Vec::with_capacity(code_count);
    for _ in 0..code_count {
        code.push(Instruction(r.u32()?));
    }

    let line_count = r.i32()? as usize;
    let mut line_entries = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        let pc = r.i32()? as u32;
        let line = r.i32()? as u32;
        line_entries.push((pc, line));
    }

    let upvalue_count = r.i32()? as usize;
    let mut upvalues = Vec::with_capacity(upvalue_count);
    for _ in 0..upvalue_count {
        let index = r.u8()?;
        let is_local = r.u8()? != 0;
        upvalues.push(UpvalueDesc { index, is_local });
    }

    let proto_count = r.i32()? as usize;
    let mut children = Vec::with_capacity(proto_count);
    for _ in 0..proto_count {
        children.push(Rc::new(read_body(r)?));
    }

    let source_file = r.string()?;
    let is_variadic = r.u8()? != 0;
    let local_count = r.u32()? as usize;
    let mut locals_debug = Vec::with_capacity(local_count);
    for _ in 0..local_count {
        locals_debug.push(LocalDebugInfo {
            name: r.long_string()?,
            depth: r.u32()?,
            slot: r.u8()?,
            start_pc: r.u32()?,
            end_pc: r.u32()?,
            is_const: r.u8()? != 0,
            is_captured: r.u8()? != 0,
        });
    }

    Ok(Prototype {
        name,
        source_file,
        arity,
        is_variadic,
        is_async,
        max_stack_size,
        code,
        constants,
        upvalues,
        children,
        lines: LineTable::from_entries(line_entries),
        locals_debug,
    })
}

/// Serialize a top-level prototype to the `.svmb` binary module format.
pub fn to_bytes(proto: &Prototype) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(MAGIC);
    w.u16(VERSION);
    write_body(&mut w, proto);
    let crc = crc32fast::hash(&w.buf);
    w.u32(crc);
    w.buf
}

/// Deserialize a top-level prototype from the `.svmb` binary module format,
/// rejecting anything whose trailing CRC32 doesn't match (EXPANSION 3.3).
pub fn from_bytes(bytes: &[u8]) -> Result<Prototype, ModuleError> {
    if bytes.len() < 4 {
        return Err(ModuleError::Truncated {
            offset: 0,
            needed: 4 - bytes.len(),
        });
    }
    if bytes.len() < 4 {
        return Err(ModuleError::Truncated {
            offset: bytes.len(),
            needed: 4,
        });
    }
    let body_end = bytes.len() - 4;
    let expected_crc = u32::from_le_bytes(bytes[body_end..].try_into().unwrap());
    let actual_crc = crc32fast::hash(&bytes[..body_end]);
    if expected_crc != actual_crc {
        return Err(ModuleError::ChecksumMismatch);
    }

    let mut r = Reader::new(&bytes[..body_end]);
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(ModuleError::BadMagic { found: magic });
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(ModuleError::UnsupportedVersion { found: version });
    }
    read_body(&mut r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{Instruction, Opcode};

    fn sample_prototype() -> Prototype {
        let mut p = Prototype::new("main", "<test>");
        p.arity = 1;
        p.is_variadic = true;
        p.max_stack_size = 4;
        let k = p.add_constant(Constant::I64(42));
        p.emit(
            Instruction::encode_abx(Opcode::LoadConst, 0, k),
            crate::span::Span::new(0, 1, 7),
        );
        p.emit(
            Instruction::encode_ab(Opcode::Return, 0, 1),
            crate::span::Span::new(1, 2, 8),
        );
        p.upvalues.push(UpvalueDesc {
            index: 0,
            is_local: true,
        });
        p.locals_debug.push(LocalDebugInfo {
            name: "x".into(),
            depth: 0,
            slot: 0,
            start_pc: 0,
            end_pc: 2,
            is_const: false,
            is_captured: true,
        });
        let mut child = Prototype::new("inner", "<test>");
        child.max_stack_size = 1;
        p.add_child(child);
        p
    }

    #[test]
    fn module_round_trips_exactly() {
        let proto = sample_prototype();
        let bytes = to_bytes(&proto);
        assert_eq!(&bytes[0..4], &MAGIC.to_le_bytes());
        let back = from_bytes(&bytes).expect("valid module");
        assert_eq!(back.name, proto.name);
        assert_eq!(back.arity, proto.arity);
        assert_eq!(back.is_variadic, proto.is_variadic);
        assert_eq!(back.max_stack_size, proto.max_stack_size);
        assert_eq!(back.code, proto.code);
        assert_eq!(back.constants, proto.constants);
        assert_eq!(back.upvalues, proto.upvalues);
        assert_eq!(back.children.len(), proto.children.len());
        assert_eq!(back.lines.entries(), proto.lines.entries());
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let proto = sample_prototype();
        let mut bytes = to_bytes(&proto);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            from_bytes(&bytes),
            Err(ModuleError::ChecksumMismatch)
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = to_bytes(&sample_prototype());
        bytes[0] ^= 0xFF;
        // Recompute checksum over the tampered body so we hit magic check,
        // not checksum check, proving the two are independent guards.
        let body_end = bytes.len() - 4;
        let crc = crc32fast::hash(&bytes[..body_end]);
        bytes[body_end..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(from_bytes(&bytes), Err(ModuleError::BadMagic { .. })));
    }
}

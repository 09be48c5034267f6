//! Runtime value representation: the tagged union every register holds.
//!
//! Scalars are stored inline. Heap variants (`String`, `Buffer`, `Array`,
//! `Object`, `Function`) are `Rc`-backed: deterministic refcounting, no
//! tracing GC, matching the teacher's `Rc<String>` / `Rc<RefCell<Vec<Value>>>`
//! style in its own `value.rs`. `Buffer` is the one variant that can cross an
//! interpreter/OS-thread boundary (handed to an FFI callback running on
//! another thread), so its refcount and `freed` flag are atomic — see
//! `AtomicBuffer` below and spec §5 "shared resources".

use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::chunk::Prototype;

/// A 32-bit Unicode scalar value, stored distinctly from `Value::String` so
/// rune arithmetic (spec §4.5) doesn't have to go through UTF-8 decoding.
pub type Rune = char;

/// Atomically refcounted, atomically "freed"-flagged mutable byte buffer.
///
/// `Buffer` is the one heap type the spec calls out as explicitly
/// thread-shared (handed across an FFI callback boundary), so unlike every
/// other heap variant it cannot simply be `Rc`: shared refcount updates must
/// use sequentially-consistent atomics, and the one-way `freed` transition
/// (invariant I3) is a single atomic store.
pub struct AtomicBuffer {
    data: RefCell<Vec<u8>>,
    refcount: AtomicUsize,
    freed: AtomicBool,
}

impl AtomicBuffer {
    fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: RefCell::new(data),
            refcount: AtomicUsize::new(1),
            freed: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.borrow().capacity()
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }

    /// One-way 0 -> 1 transition (invariant I3). Returns `false` if already freed.
    pub fn mark_freed(&self) -> bool {
        self.freed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.data.borrow().get(index).copied()
    }

    pub fn set(&self, index: usize, byte: u8) -> bool {
        let mut data = self.data.borrow_mut();
        match data.get_mut(index) {
            Some(slot) => {
                *slot = byte;
                true
            }
            None => false,
        }
    }

    pub fn push(&self, byte: u8) {
        self.data.borrow_mut().push(byte);
    }

    pub fn bump(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the refcount after the decrement.
    pub fn release(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for AtomicBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicBuffer")
            .field("len", &self.len())
            .field("freed", &self.is_freed())
            .finish()
    }
}

/// Ordered string-keyed map backing `Value::Object`. Insertion order is
/// preserved (spec §3), backed by `indexmap` rather than a hand-rolled
/// parallel-vectors map.
pub type ObjectMap = IndexMap<Rc<str>, Value>;

/// A closure: a prototype plus its captured upvalue cells.
#[derive(Debug, Clone)]
pub struct Closure {
    pub prototype: Rc<Prototype>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

/// An upvalue cell: open while it aliases a still-live stack slot, closed
/// once that slot's frame has returned (spec §3 "Upvalue cell").
#[derive(Debug, Clone)]
pub enum Upvalue {
    /// Aliases `stack[index]` in the VM's shared value stack.
    Open { stack_index: usize },
    /// Owns its value inline; the originating frame has returned.
    Closed(Value),
}

/// A raw address + tag pair used for FFI return values. The core never
/// dereferences the address itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ptr {
    pub addr: usize,
    pub tag: u32,
}

/// Opaque domain handle. The core's job is to refcount and compare these by
/// identity; what they point at (a spawned coroutine, a bounded queue, a
/// socket, a loaded C function, a registered callback) is defined by
/// collaborator modules outside this crate, per spec §1.
#[derive(Debug, Clone)]
pub struct Handle<T> {
    pub inner: Rc<T>,
}

impl<T> Handle<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Rc::new(inner),
        }
    }

    pub fn ptr_eq(&self, other: &Handle<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Opaque marker types for the domain handles spec §3 lists but leaves to
/// collaborator modules to define the contents of.
#[derive(Debug)]
pub struct TaskMarker;
#[derive(Debug)]
pub struct ChannelMarker;
#[derive(Debug)]
pub struct WebSocketMarker;
#[derive(Debug)]
pub struct FfiFunctionMarker;
#[derive(Debug)]
pub struct FfiCallbackMarker;

/// The tagged value every register, local, upvalue cell, and constant-pool
/// slot holds.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Rune(Rune),
    String(Rc<str>),
    Buffer(Arc<AtomicBuffer>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<ObjectMap>>),
    Function(Rc<Closure>),
    BuiltinFn(crate::builtins::BuiltinId),
    Ptr(Ptr),
    Task(Handle<TaskMarker>),
    Channel(Handle<ChannelMarker>),
    WebSocket(Handle<WebSocketMarker>),
    FfiFunction(Handle<FfiFunctionMarker>),
    FfiCallback(Handle<FfiCallbackMarker>),
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(values)))
    }

    pub fn object(map: ObjectMap) -> Self {
        Value::Object(Rc::new(RefCell::new(map)))
    }

    pub fn buffer(bytes: Vec<u8>) -> Self {
        Value::Buffer(AtomicBuffer::new(bytes))
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(
            self,
            Value::Null | Value::Bool(false) | Value::I32(0) | Value::I64(0)
        )
    }

    /// The name the `TypeOf` opcode (and `InstanceOf`) should report.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Rune(_) => "rune",
            Value::String(_) => "string",
            Value::Buffer(_) => "buffer",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::BuiltinFn(_) => "builtin",
            Value::Ptr(_) => "ptr",
            Value::Task(_) => "task",
            Value::Channel(_) => "channel",
            Value::WebSocket(_) => "websocket",
            Value::FfiFunction(_) => "ffi_function",
            Value::FfiCallback(_) => "ffi_callback",
        }
    }

    /// Widened floating-point view used by ordering comparisons (spec §4.5):
    /// numeric variants coerce to `f64`, everything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I8(n) => Some(*n as f64),
            Value::I16(n) => Some(*n as f64),
            Value::I32(n) => Some(*n as f64),
            Value::I64(n) => Some(*n as f64),
            Value::U8(n) => Some(*n as f64),
            Value::U16(n) => Some(*n as f64),
            Value::U32(n) => Some(*n as f64),
            Value::U64(n) => Some(*n as f64),
            Value::F32(n) => Some(*n as f64),
            Value::F64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    pub fn is_64_bit_int(&self) -> bool {
        matches!(self, Value::I64(_) | Value::U64(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::F32(_) | Value::F64(_))
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::I8(n) => n.to_string(),
            Value::I16(n) => n.to_string(),
            Value::I32(n) => n.to_string(),
            Value::I64(n) => n.to_string(),
            Value::U8(n) => n.to_string(),
            Value::U16(n) => n.to_string(),
            Value::U32(n) => n.to_string(),
            Value::U64(n) => n.to_string(),
            Value::F32(n) => n.to_string(),
            Value::F64(n) => n.to_string(),
            Value::Rune(c) => c.to_string(),
            Value::String(s) => s.to_string(),
            Value::Buffer(b) => format!("<buffer:{} bytes>", b.len()),
            Value::Array(a) => {
                let items = a.borrow();
                let parts: Vec<String> = items.iter().map(Value::to_display_string).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Object(o) => {
                let map = o.borrow();
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.to_display_string()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Function(c) => format!("<function:{}>", c.prototype.name),
            Value::BuiltinFn(id) => format!("<builtin:{}>", id.0),
            Value::Ptr(p) => format!("<ptr:{:#x}:{}>", p.addr, p.tag),
            Value::Task(_) => "<task>".to_string(),
            Value::Channel(_) => "<channel>".to_string(),
            Value::WebSocket(_) => "<websocket>".to_string(),
            Value::FfiFunction(_) => "<ffi_function>".to_string(),
            Value::FfiCallback(_) => "<ffi_callback>".to_string(),
        }
    }
}

/// Equality rules from spec §4.5: `Null` only equals `Null`, `Bool` only
/// equals `Bool`; numerics compare by widened value; strings compare by
/// byte equality; every other heap variant compares by identity (Open
/// Question resolved in DESIGN.md / spec §9).
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Rune(a), Value::Rune(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_f64() == b.as_f64(),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Buffer(a), Value::Buffer(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::BuiltinFn(a), Value::BuiltinFn(b)) => a == b,
            (Value::Ptr(a), Value::Ptr(b)) => a == b,
            (Value::Task(a), Value::Task(b)) => a.ptr_eq(b),
            (Value::Channel(a), Value::Channel(b)) => a.ptr_eq(b),
            (Value::WebSocket(a), Value::WebSocket(b)) => a.ptr_eq(b),
            (Value::FfiFunction(a), Value::FfiFunction(b)) => a.ptr_eq(b),
            (Value::FfiCallback(a), Value::FfiCallback(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_only_equals_null() {
        assert_eq!(Value::Null, Value::Null);
        assert_ne!(Value::Null, Value::Bool(false));
    }

    #[test]
    fn numeric_equality_widens() {
        assert_eq!(Value::I32(2), Value::F64(2.0));
        assert_eq!(Value::I64(10), Value::I32(10));
    }

    #[test]
    fn arrays_compare_by_identity() {
        let a = Value::array(vec![Value::I32(1)]);
        let b = Value::array(vec![Value::I32(1)]);
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn strings_compare_by_bytes() {
        assert_eq!(Value::string("hi"), Value::string("hi"));
    }

    #[test]
    fn buffer_freed_flag_is_one_way() {
        let buf = AtomicBuffer::new(vec![1, 2, 3]);
        assert!(buf.mark_freed());
        assert!(buf.is_freed());
        assert!(!buf.mark_freed());
    }
}

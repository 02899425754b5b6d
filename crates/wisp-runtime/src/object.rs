//! Heap object model (spec §3 "Heap object kinds")
//!
//! spec §9 notes that a systems-language port should replace the original's
//! intrusive linked list of raw object pointers with "an allocator-owned
//! vector of owning handles; objects reference each other through stable
//! handles ... rather than raw pointers". `Heap` is that vector; `ObjRef` is
//! the handle. This removes the `next` field the spec's source carried on
//! every object and makes a dangling reference after sweep a compile error
//! instead of a runtime crash.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// A stable handle into a `Heap`. Opaque outside this module except for
/// equality (used for reference-equality semantics) and `Debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    #[cfg(test)]
    pub fn for_test(n: u32) -> Self {
        ObjRef(n)
    }
}

pub struct ObjString {
    pub content: String,
    pub hash: u32,
}

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Open while it still aliases a live stack slot; closed once the frame
/// that owned that slot has returned (spec §3 "Upvalue").
#[derive(Clone)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub type NativeFn = fn(&[Value]) -> Result<Value, crate::value::RuntimeError>;

pub struct ObjNative {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

pub enum ObjData {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(UpvalueState),
    Native(ObjNative),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl ObjData {
    fn approx_size(&self) -> usize {
        match self {
            ObjData::String(s) => std::mem::size_of::<ObjString>() + s.content.len(),
            ObjData::Function(f) => std::mem::size_of::<ObjFunction>() + f.chunk.code.len(),
            ObjData::Closure(c) => {
                std::mem::size_of::<ObjClosure>() + c.upvalues.len() * std::mem::size_of::<ObjRef>()
            }
            ObjData::Upvalue(_) => std::mem::size_of::<UpvalueState>(),
            ObjData::Native(_) => std::mem::size_of::<ObjNative>(),
            ObjData::Class(_) => std::mem::size_of::<ObjClass>(),
            ObjData::Instance(_) => std::mem::size_of::<ObjInstance>(),
            ObjData::BoundMethod(_) => std::mem::size_of::<ObjBoundMethod>(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjData::String(_) => "string",
            ObjData::Function(_) => "function",
            ObjData::Closure(_) => "closure",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Native(_) => "native",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "bound method",
        }
    }
}

struct HeapObject {
    marked: bool,
    data: ObjData,
}

/// Owns every heap-allocated value. Objects are addressed by `ObjRef`
/// (an index into `slots`), never by raw pointer.
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    free_list: Vec<u32>,
    /// The interned-string set (spec §3 "Interned strings"): a set keyed by
    /// string content/hash, used to guarantee string identity == content
    /// equality.
    pub strings: Table,
    pub bytes_allocated: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
        }
    }

    fn insert(&mut self, data: ObjData) -> ObjRef {
        self.bytes_allocated += data.approx_size();
        let obj = HeapObject {
            marked: false,
            data,
        };
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(obj);
            ObjRef(idx)
        } else {
            self.slots.push(Some(obj));
            ObjRef((self.slots.len() - 1) as u32)
        }
    }

    /// Allocate (or reuse) an interned string. Two calls with equal content
    /// always return the same `ObjRef` (spec §3 invariant).
    ///
    /// Implemented via an explicit field destructure (`slots`/`strings`
    /// borrowed disjointly) rather than `self.as_string(..)` inside the
    /// lookup closure, because a closure that calls a method needs the
    /// whole `&self` and that would collide with `self.strings`'s own
    /// `&mut self` receiver for the `set` call below.
    pub fn intern(&mut self, content: &str) -> ObjRef {
        let hash = fnv1a(content);
        let found = {
            let Heap { slots, strings, .. } = self;
            strings.find_string(hash, |r| string_matches(slots, r, content))
        };
        if let Some(existing) = found {
            return existing;
        }
        let key = self.insert(ObjData::String(ObjString {
            content: content.to_string(),
            hash,
        }));
        let Heap { slots, strings, .. } = self;
        strings.set(key, hash, Value::Nil, |r| string_matches(slots, r, content));
        key
    }

    pub fn alloc_function(&mut self, f: ObjFunction) -> ObjRef {
        self.insert(ObjData::Function(f))
    }

    pub fn alloc_closure(&mut self, c: ObjClosure) -> ObjRef {
        self.insert(ObjData::Closure(c))
    }

    pub fn alloc_upvalue(&mut self, state: UpvalueState) -> ObjRef {
        self.insert(ObjData::Upvalue(state))
    }

    pub fn alloc_native(&mut self, n: ObjNative) -> ObjRef {
        self.insert(ObjData::Native(n))
    }

    pub fn alloc_class(&mut self, c: ObjClass) -> ObjRef {
        self.insert(ObjData::Class(c))
    }

    pub fn alloc_instance(&mut self, i: ObjInstance) -> ObjRef {
        self.insert(ObjData::Instance(i))
    }

    pub fn alloc_bound_method(&mut self, b: ObjBoundMethod) -> ObjRef {
        self.insert(ObjData::BoundMethod(b))
    }

    fn object(&self, r: ObjRef) -> &HeapObject {
        self.slots[r.0 as usize]
            .as_ref()
            .expect("ObjRef referenced a freed heap slot")
    }

    fn object_mut(&mut self, r: ObjRef) -> &mut HeapObject {
        self.slots[r.0 as usize]
            .as_mut()
            .expect("ObjRef referenced a freed heap slot")
    }

    pub fn data(&self, r: ObjRef) -> &ObjData {
        &self.object(r).data
    }

    pub fn data_mut(&mut self, r: ObjRef) -> &mut ObjData {
        &mut self.object_mut(r).data
    }

    pub fn as_string(&self, r: ObjRef) -> &ObjString {
        match self.data(r) {
            ObjData::String(s) => s,
            other => panic!("expected string, found {}", other.kind_name()),
        }
    }

    pub fn as_function(&self, r: ObjRef) -> &ObjFunction {
        match self.data(r) {
            ObjData::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn as_function_mut(&mut self, r: ObjRef) -> &mut ObjFunction {
        match self.data_mut(r) {
            ObjData::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    /// Used by the disassembler, which only has a `Value` constant (not
    /// necessarily known to be a function) in hand.
    pub fn as_function_value(&self, value: Value) -> Option<&ObjFunction> {
        match value {
            Value::Obj(r) => match self.data(r) {
                ObjData::Function(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_closure(&self, r: ObjRef) -> &ObjClosure {
        match self.data(r) {
            ObjData::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn as_upvalue(&self, r: ObjRef) -> &UpvalueState {
        match self.data(r) {
            ObjData::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn as_upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueState {
        match self.data_mut(r) {
            ObjData::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn as_native(&self, r: ObjRef) -> &ObjNative {
        match self.data(r) {
            ObjData::Native(n) => n,
            other => panic!("expected native, found {}", other.kind_name()),
        }
    }

    pub fn as_class(&self, r: ObjRef) -> &ObjClass {
        match self.data(r) {
            ObjData::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn as_class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match self.data_mut(r) {
            ObjData::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn as_instance(&self, r: ObjRef) -> &ObjInstance {
        match self.data(r) {
            ObjData::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn as_instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match self.data_mut(r) {
            ObjData::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn as_bound_method(&self, r: ObjRef) -> &ObjBoundMethod {
        match self.data(r) {
            ObjData::BoundMethod(b) => b,
            other => panic!("expected bound method, found {}", other.kind_name()),
        }
    }

    pub fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Obj(r) if matches!(self.data(r), ObjData::String(_)))
    }

    pub fn str_content(&self, value: Value) -> Option<&str> {
        match value {
            Value::Obj(r) => match self.data(r) {
                ObjData::String(s) => Some(&s.content),
                _ => None,
            },
            _ => None,
        }
    }

    /// Printed forms, spec §6 "Host output".
    pub fn display(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => match self.data(r) {
                ObjData::String(s) => s.content.clone(),
                ObjData::Function(f) => match f.name {
                    Some(name_ref) => format!("<fn {}>", self.as_string(name_ref).content),
                    None => "<script>".to_string(),
                },
                ObjData::Closure(c) => self.display(Value::Obj(c.function)),
                ObjData::Upvalue(_) => "<upvalue>".to_string(),
                ObjData::Native(_) => "<native>".to_string(),
                ObjData::Class(c) => format!("<class '{}'>", self.as_string(c.name).content),
                ObjData::Instance(i) => {
                    let class_name = self.as_string(self.as_class(i.class).name).content.clone();
                    format!("<'{class_name}' object>")
                }
                ObjData::BoundMethod(b) => self.display(Value::Obj(b.method)),
            },
        }
    }

    // --- GC hooks -------------------------------------------------------

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.object(r).marked
    }

    /// Marks the object reachable. Returns `true` if this was the
    /// transition from white to gray (i.e. the caller should enqueue it on
    /// the gray worklist), `false` if it was already marked.
    pub fn mark(&mut self, r: ObjRef) -> bool {
        let obj = self.object_mut(r);
        if obj.marked {
            false
        } else {
            obj.marked = true;
            true
        }
    }

    pub fn all_refs(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| ObjRef(i as u32)))
    }

    /// Free every object not marked reachable this cycle; clears the
    /// `marked` flag on survivors for the next cycle (spec §4.5
    /// "Sweeping"). Returns the number of bytes freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for idx in 0..self.slots.len() {
            match &mut self.slots[idx] {
                Some(obj) if obj.marked => obj.marked = false,
                Some(obj) => {
                    freed += obj.data.approx_size();
                    self.slots[idx] = None;
                    self.free_list.push(idx as u32);
                }
                None => {}
            }
        }
        self.bytes_allocated -= freed;
        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

fn format_number(n: f64) -> String {
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n.is_nan() {
        return "nan".to_string();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn string_matches(slots: &[Option<HeapObject>], r: ObjRef, content: &str) -> bool {
    match &slots[r.0 as usize] {
        Some(obj) => matches!(&obj.data, ObjData::String(s) if s.content == content),
        None => false,
    }
}

/// 32-bit FNV-1a, matching the reference implementation's string hash.
pub fn fnv1a(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_two_equal_strings_yields_same_ref() {
        let mut heap = Heap::new();
        let a = heap.intern("foo");
        let b = heap.intern("foo");
        assert_eq!(a, b);
    }

    #[test]
    fn interning_distinct_strings_yields_distinct_refs() {
        let mut heap = Heap::new();
        let a = heap.intern("foo");
        let b = heap.intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn sweep_frees_unmarked_and_keeps_marked() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        let _drop = heap.intern("drop");
        heap.mark(keep);
        let freed = heap.sweep();
        assert!(freed > 0);
        assert!(heap.is_marked(keep) == false); // cleared after sweep
        assert_eq!(heap.as_string(keep).content, "keep");
    }

    #[test]
    fn display_formats_numbers_like_spec_examples() {
        let heap = Heap::new();
        assert_eq!(heap.display(Value::Number(7.0)), "7");
        assert_eq!(heap.display(Value::Nil), "nil");
        assert_eq!(heap.display(Value::Bool(true)), "true");
    }
}

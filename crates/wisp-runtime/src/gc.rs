//! Tri-colour mark-and-sweep collector (spec §4.5)
//!
//! The collector owns only the gray worklist and the triggering policy; the
//! heap itself (object storage, `marked` flags) lives in `Heap`. Roots are
//! supplied by the caller each cycle via `Roots`, since the VM is the only
//! thing that knows what's currently live (value stack, call frames, open
//! upvalues, globals).
//!
//! spec §9's open question about the gray-stack allocation growing
//! monotonically is carried forward unchanged: `gray` is reused across
//! cycles and never shrunk, matching the source's documented behaviour.

use crate::object::{Heap, ObjData, ObjRef};
use crate::table::Table;
use crate::value::Value;

/// Default heap growth factor applied to the next collection threshold
/// (spec §4.5: "After collection, next_threshold = bytes * 2"). Overridable
/// via `VmConfig::heap_growth_factor`.
pub const DEFAULT_GROWTH_FACTOR: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub next_threshold_bytes: usize,
}

/// Everything the collector needs to mark roots for one cycle (spec §4.5
/// "Roots", items 1-4 and 6; item 5, the compiler's nested function
/// contexts, does not apply here — see DESIGN.md).
pub struct Roots<'a> {
    pub stack: &'a [Value],
    pub frame_closures: &'a [ObjRef],
    pub open_upvalues: &'a [ObjRef],
    pub globals: &'a Table,
    /// Extra pinned objects, e.g. the interned `"init"` string.
    pub pinned: &'a [ObjRef],
}

pub struct Collector {
    gray: Vec<ObjRef>,
    stress: bool,
    growth_factor: usize,
    stats: GcStats,
}

impl Collector {
    pub fn new(initial_threshold: usize, stress: bool) -> Self {
        Self::with_growth_factor(initial_threshold, stress, DEFAULT_GROWTH_FACTOR)
    }

    pub fn with_growth_factor(initial_threshold: usize, stress: bool, growth_factor: usize) -> Self {
        Self {
            gray: Vec::new(),
            stress,
            growth_factor: growth_factor.max(1),
            stats: GcStats {
                next_threshold_bytes: initial_threshold,
                ..Default::default()
            },
        }
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn should_collect(&self, heap: &Heap) -> bool {
        self.stress || heap.bytes_allocated > self.stats.next_threshold_bytes
    }

    pub fn collect(&mut self, heap: &mut Heap, roots: Roots<'_>) {
        let before = heap.bytes_allocated;
        tracing::debug!(bytes_before = before, "gc cycle start");

        self.mark_roots(heap, &roots);
        self.trace_references(heap);

        // Before sweeping, scrub the intern table of any string that
        // didn't get marked this cycle, so the sweep below doesn't leave a
        // dangling key in it (spec §4.5).
        heap.strings.remove_white(|r| heap.is_marked(r));

        let freed = heap.sweep();
        let after = heap.bytes_allocated;

        self.stats.cycles += 1;
        self.stats.total_freed_bytes += freed;
        self.stats.last_freed_bytes = freed;
        self.stats.last_before_bytes = before;
        self.stats.last_after_bytes = after;
        self.stats.next_threshold_bytes = after * self.growth_factor;

        tracing::debug!(
            bytes_after = after,
            freed,
            next_threshold = self.stats.next_threshold_bytes,
            "gc cycle end"
        );
    }

    fn mark_value(&mut self, heap: &mut Heap, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(heap, r);
        }
    }

    fn mark_object(&mut self, heap: &mut Heap, r: ObjRef) {
        if heap.mark(r) {
            self.gray.push(r);
        }
    }

    fn mark_roots(&mut self, heap: &mut Heap, roots: &Roots<'_>) {
        for &value in roots.stack {
            self.mark_value(heap, value);
        }
        for &closure in roots.frame_closures {
            self.mark_object(heap, closure);
        }
        for &upvalue in roots.open_upvalues {
            self.mark_object(heap, upvalue);
        }
        for (key, value) in roots.globals.iter() {
            self.mark_object(heap, key);
            self.mark_value(heap, *value);
        }
        for &pinned in roots.pinned {
            self.mark_object(heap, pinned);
        }
    }

    fn trace_references(&mut self, heap: &mut Heap) {
        while let Some(r) = self.gray.pop() {
            self.blacken(heap, r);
        }
    }

    /// Marks every reference an already-gray object holds, per the
    /// per-kind child list in spec §4.5 "Tracing".
    fn blacken(&mut self, heap: &mut Heap, r: ObjRef) {
        // `data(r)` can't be held across the mutable `mark_*` calls below,
        // so each arm collects the handles/values it needs to mark first.
        match heap.data(r) {
            ObjData::String(_) | ObjData::Native(_) => {}
            ObjData::Function(f) => {
                let name = f.name;
                let constants: Vec<Value> = f.chunk.constants.clone();
                if let Some(name) = name {
                    self.mark_object(heap, name);
                }
                for c in constants {
                    self.mark_value(heap, c);
                }
            }
            ObjData::Closure(c) => {
                let function = c.function;
                let upvalues = c.upvalues.clone();
                self.mark_object(heap, function);
                for u in upvalues {
                    self.mark_object(heap, u);
                }
            }
            ObjData::Upvalue(state) => {
                if let crate::object::UpvalueState::Closed(v) = state {
                    let v = *v;
                    self.mark_value(heap, v);
                }
            }
            ObjData::Class(c) => {
                let name = c.name;
                let methods: Vec<(ObjRef, Value)> =
                    c.methods.iter().map(|(k, v)| (k, *v)).collect();
                self.mark_object(heap, name);
                for (k, v) in methods {
                    self.mark_object(heap, k);
                    self.mark_value(heap, v);
                }
            }
            ObjData::Instance(i) => {
                let class = i.class;
                let fields: Vec<(ObjRef, Value)> = i.fields.iter().map(|(k, v)| (k, *v)).collect();
                self.mark_object(heap, class);
                for (k, v) in fields {
                    self.mark_object(heap, k);
                    self.mark_value(heap, v);
                }
            }
            ObjData::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                self.mark_value(heap, receiver);
                self.mark_object(heap, method);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjFunction, UpvalueState};

    #[test]
    fn collects_unreachable_strings() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        heap.intern("drop");
        let mut gc = Collector::new(0, false);
        let globals = Table::new();
        let stack = [Value::Obj(keep)];
        gc.collect(
            &mut heap,
            Roots {
                stack: &stack,
                frame_closures: &[],
                open_upvalues: &[],
                globals: &globals,
                pinned: &[],
            },
        );
        assert_eq!(heap.as_string(keep).content, "keep");
        assert_eq!(gc.stats().cycles, 1);
        assert!(gc.stats().last_freed_bytes > 0);
    }

    #[test]
    fn closure_keeps_its_function_alive() {
        let mut heap = Heap::new();
        let func = heap.alloc_function(ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: crate::chunk::Chunk::new(),
            name: None,
        });
        let closure = heap.alloc_closure(crate::object::ObjClosure {
            function: func,
            upvalues: vec![],
        });
        let mut gc = Collector::new(0, false);
        let globals = Table::new();
        let stack = [Value::Obj(closure)];
        gc.collect(
            &mut heap,
            Roots {
                stack: &stack,
                frame_closures: &[],
                open_upvalues: &[],
                globals: &globals,
                pinned: &[],
            },
        );
        // Both the closure and its function must have survived; if the
        // function had been swept this would panic.
        let _ = heap.as_function(heap.as_closure(closure).function);
    }

    #[test]
    fn open_upvalue_root_keeps_stack_value_reachable_through_closed_state() {
        let mut heap = Heap::new();
        let s = heap.intern("captured");
        let upvalue = heap.alloc_upvalue(UpvalueState::Closed(Value::Obj(s)));
        let mut gc = Collector::new(0, false);
        let globals = Table::new();
        gc.collect(
            &mut heap,
            Roots {
                stack: &[],
                frame_closures: &[],
                open_upvalues: &[upvalue],
                globals: &globals,
                pinned: &[],
            },
        );
        assert_eq!(heap.as_string(s).content, "captured");
    }
}

//! Stack-based virtual machine (spec §4.3, §4.6)
//!
//! Owns the value stack, the call-frame stack, the global table, the heap
//! (which in turn owns the interned-string table), and the open-upvalue
//! list. `run` is the dispatch loop; everything else is a named operation
//! the loop calls into, grouped the way §4.6 groups them (calls, property
//! access, upvalue capture/closing).

use std::io::Write;
use std::time::Instant;

use crate::diagnostic::CompileError;
use crate::gc::{Collector, Roots};
use crate::object::{
    Heap, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjData, ObjInstance, ObjNative, ObjRef,
    UpvalueState,
};
use crate::table::Table;
use crate::value::{RuntimeError, Value};

/// Default call-depth limit (spec §3 "Value stack"), overridable via
/// `VmConfig::frames_max`.
pub const FRAMES_MAX: usize = 64;
/// Default value-stack slots per frame, used only to size the stack's
/// initial capacity; overridable via `VmConfig::stack_slots_per_frame`.
pub const STACK_SLOTS_PER_FRAME: usize = 256;

/// Initial GC threshold before the first collection, in approximate bytes.
const INITIAL_GC_THRESHOLD: usize = 1 << 20;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

pub type OutputSink = Box<dyn Write>;

pub fn stdout_sink() -> OutputSink {
    Box::new(std::io::stdout())
}

pub fn stderr_sink() -> OutputSink {
    Box::new(std::io::stderr())
}

#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile(e) => write!(f, "{e}"),
            InterpretError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    frames_max: usize,
    globals: Table,
    heap: Heap,
    /// Sorted strictly by descending stack-slot index (spec §3 invariant).
    open_upvalues: Vec<ObjRef>,
    gc: Collector,
    init_string: ObjRef,
    output: OutputSink,
    error_output: OutputSink,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(crate::config::VmConfig::new())
    }

    pub fn with_sinks(output: OutputSink, error_output: OutputSink, gc_stress: bool) -> Self {
        let config = crate::config::VmConfig::new()
            .with_output(output)
            .with_error_output(error_output)
            .with_gc_stress(gc_stress);
        Self::with_config(config)
    }

    /// Build a VM honoring every tunable in `config` (spec §8.3): call-depth
    /// limit, initial stack capacity, GC-stress mode, heap growth factor,
    /// and the `print`/error output sinks.
    pub fn with_config(config: crate::config::VmConfig) -> Self {
        let crate::config::VmConfig {
            frames_max,
            stack_slots_per_frame,
            gc_stress,
            heap_growth_factor,
            output,
            error_output,
        } = config;

        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(frames_max * stack_slots_per_frame),
            frames: Vec::with_capacity(frames_max),
            frames_max,
            globals: Table::new(),
            heap,
            open_upvalues: Vec::new(),
            gc: Collector::with_growth_factor(INITIAL_GC_THRESHOLD, gc_stress, heap_growth_factor),
            init_string,
            output,
            error_output,
        };
        vm.define_native("clock", 0, native_clock);
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn gc_stats(&self) -> &crate::gc::GcStats {
        self.gc.stats()
    }

    fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let name_ref = self.heap.intern(name);
        let native_ref = self.heap.alloc_native(ObjNative {
            name,
            arity,
            function,
        });
        let hash = self.heap.as_string(name_ref).hash;
        self.globals
            .set(name_ref, hash, Value::Obj(native_ref), |k| k == name_ref);
    }

    /// Compile `source` and run it to completion (spec §8 end-to-end
    /// scenarios; §7 "Runtime errors" for the reset-on-error behaviour).
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = crate::compiler::compile(source, &mut self.heap)
            .map_err(InterpretError::Compile)?;
        let closure = self.heap.alloc_closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        });
        self.stack.push(Value::Obj(closure));

        let result = self
            .call_closure(closure, 0)
            .and_then(|()| self.run());

        if let Err(ref err) = result {
            self.report_runtime_error(err);
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues.clear();
        }
        result.map_err(InterpretError::Runtime)
    }

    fn report_runtime_error(&mut self, err: &RuntimeError) {
        let _ = writeln!(self.error_output, "{err}");
        for frame in self.frames.iter().rev() {
            let closure = self.heap.as_closure(frame.closure);
            let function = self.heap.as_function(closure.function);
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(name_ref) => self.heap.as_string(name_ref).content.clone(),
                None => "script".to_string(),
            };
            let _ = writeln!(self.error_output, "[line {line}] in {name}");
        }
    }

    // --- dispatch loop ---------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        use crate::opcode::Opcode;

        while !self.frames.is_empty() {
            #[cfg(feature = "trace-exec")]
            self.trace_dispatch();

            let op = self.read_opcode()?;
            match op {
                Opcode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::GetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.push(self.stack[base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.stack[base + slot] = self.peek(0);
                }
                Opcode::GetGlobal => {
                    let name_ref = self.read_string_constant();
                    let hash = self.heap.as_string(name_ref).hash;
                    match self.globals.get(hash, |k| k == name_ref).copied() {
                        Some(v) => self.push(v),
                        None => {
                            let name = self.heap.as_string(name_ref).content.clone();
                            return Err(RuntimeError::UndefinedGlobal(name));
                        }
                    }
                }
                Opcode::DefineGlobal => {
                    let name_ref = self.read_string_constant();
                    let hash = self.heap.as_string(name_ref).hash;
                    let value = self.pop();
                    self.globals.set(name_ref, hash, value, |k| k == name_ref);
                }
                Opcode::SetGlobal => {
                    let name_ref = self.read_string_constant();
                    let hash = self.heap.as_string(name_ref).hash;
                    let value = self.peek(0);
                    if self.globals.set(name_ref, hash, value, |k| k == name_ref) {
                        self.globals.delete(hash, |k| k == name_ref);
                        let name = self.heap.as_string(name_ref).content.clone();
                        return Err(RuntimeError::UndefinedGlobal(name));
                    }
                }
                Opcode::GetUpvalue => {
                    let idx = self.read_u8() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_ref = self.heap.as_closure(closure).upvalues[idx];
                    let value = match self.heap.as_upvalue(upvalue_ref) {
                        UpvalueState::Open(slot) => self.stack[*slot],
                        UpvalueState::Closed(v) => *v,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let idx = self.read_u8() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_ref = self.heap.as_closure(closure).upvalues[idx];
                    let value = self.peek(0);
                    match self.heap.as_upvalue_mut(upvalue_ref) {
                        UpvalueState::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        UpvalueState::Closed(stored) => *stored = value,
                    }
                }
                Opcode::GetProperty => self.get_property()?,
                Opcode::SetProperty => self.set_property()?,
                Opcode::GetSuper => {
                    let name_ref = self.read_string_constant();
                    let superclass_ref = self.pop().as_obj().expect("superclass must be an object");
                    self.bind_method(superclass_ref, name_ref)?;
                }
                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(a, b)));
                }
                Opcode::Greater => self.binary_comparison(|a, b| a > b)?,
                Opcode::Less => self.binary_comparison(|a, b| a < b)?,
                Opcode::Add => self.add()?,
                Opcode::Subtract => self.binary_numeric(|a, b| a - b)?,
                Opcode::Multiply => self.binary_numeric(|a, b| a * b)?,
                Opcode::Divide => self.binary_numeric(|a, b| a / b)?,
                Opcode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()));
                }
                Opcode::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(RuntimeError::OperandMustBeNumber),
                    }
                }
                Opcode::Print => {
                    let v = self.pop();
                    let text = self.heap.display(v);
                    let _ = writeln!(self.output, "{text}");
                }
                Opcode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }
                Opcode::Call => {
                    let argc = self.read_u8();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                Opcode::Invoke => {
                    let name_ref = self.read_string_constant();
                    let argc = self.read_u8();
                    self.invoke(name_ref, argc)?;
                }
                Opcode::SuperInvoke => {
                    let name_ref = self.read_string_constant();
                    let argc = self.read_u8();
                    let superclass_ref = self.pop().as_obj().expect("superclass must be an object");
                    self.invoke_from_class(superclass_ref, name_ref, argc)?;
                }
                Opcode::Closure => self.make_closure(),
                Opcode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Opcode::Class => {
                    let name_ref = self.read_string_constant();
                    self.maybe_collect();
                    let class_ref = self.heap.alloc_class(ObjClass {
                        name: name_ref,
                        methods: Table::new(),
                    });
                    self.push(Value::Obj(class_ref));
                }
                Opcode::Inherit => self.inherit()?,
                Opcode::Method => self.define_method(),
                Opcode::Return => {
                    let value = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(value);
                }
            }
        }
        Ok(())
    }

    /// Logs the stack and the instruction about to dispatch (clox's
    /// `DEBUG_TRACE_EXECUTION`, gated behind the `trace-exec` feature
    /// instead of a compile-time `#define`; spec §9 "observability").
    #[cfg(feature = "trace-exec")]
    fn trace_dispatch(&self) {
        let frame = self.frames.last().expect("run loop checked frames is non-empty");
        let byte = self.current_function_chunk_byte(frame.ip);
        let op_name = crate::opcode::Opcode::try_from(byte)
            .map(|op| format!("{op:?}"))
            .unwrap_or_else(|_| format!("{byte:#04x}"));
        let stack: Vec<String> = self.stack.iter().map(|v| self.heap.display(*v)).collect();
        tracing::trace!(ip = frame.ip, op = %op_name, stack = ?stack, "dispatch");
    }

    // --- operand/instruction decoding ------------------------------------

    fn current_function_chunk_byte(&self, ip: usize) -> u8 {
        let frame = self.frames.last().unwrap();
        let closure = self.heap.as_closure(frame.closure);
        let function = self.heap.as_function(closure.function);
        function.chunk.code[ip]
    }

    fn read_u8(&mut self) -> u8 {
        let ip = self.frames.last().unwrap().ip;
        let byte = self.current_function_chunk_byte(ip);
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8() as u16;
        let lo = self.read_u8() as u16;
        (hi << 8) | lo
    }

    fn read_opcode(&mut self) -> Result<crate::opcode::Opcode, RuntimeError> {
        let byte = self.read_u8();
        crate::opcode::Opcode::try_from(byte)
            .map_err(|_| RuntimeError::Internal(format!("unknown opcode {byte:#04x}")))
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_u8();
        let frame = self.frames.last().unwrap();
        let closure = self.heap.as_closure(frame.closure);
        let function = self.heap.as_function(closure.function);
        function.chunk.constants[idx as usize]
    }

    fn read_string_constant(&mut self) -> ObjRef {
        self.read_constant()
            .as_obj()
            .expect("name constant must be a string object")
    }

    // --- stack helpers -----------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // --- arithmetic --------------------------------------------------------

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(op(x, y)));
                Ok(())
            }
            _ => Err(RuntimeError::OperandsMustBeNumbers),
        }
    }

    fn binary_comparison(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => Err(RuntimeError::OperandsMustBeNumbers),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(x + y));
                return Ok(());
            }
            _ => {}
        }
        if self.heap.is_string(a) && self.heap.is_string(b) {
            // Both operands stay on the stack (peeked, not popped) across
            // the pre-allocation collection check below, so they can't be
            // swept before the concatenated result is interned and pushed
            // (spec §4.5 allocator contract).
            let mut joined = self.heap.str_content(a).unwrap().to_string();
            joined.push_str(self.heap.str_content(b).unwrap());
            self.maybe_collect();
            let result_ref = self.heap.intern(&joined);
            self.pop();
            self.pop();
            self.push(Value::Obj(result_ref));
            return Ok(());
        }
        Err(RuntimeError::InvalidAddOperands)
    }

    // --- calls (spec §4.6) --------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Value::Obj(r) = callee else {
            return Err(RuntimeError::NotCallable);
        };
        match self.heap.data(r) {
            ObjData::Closure(_) => self.call_closure(r, argc),
            ObjData::Native(native) => {
                let function = native.function;
                let expected = native.arity;
                if argc != expected {
                    return Err(RuntimeError::ArityMismatch {
                        expected,
                        got: argc,
                    });
                }
                let start = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack[start..].to_vec();
                let result = function(&args)?;
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            ObjData::Class(_) => self.call_class(r, argc),
            ObjData::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method_ref = bound.method;
                let slot = self.stack.len() - 1 - argc as usize;
                self.stack[slot] = receiver;
                self.call_closure(method_ref, argc)
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_class(&mut self, class_ref: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        self.maybe_collect();
        let instance_ref = self.heap.alloc_instance(ObjInstance {
            class: class_ref,
            fields: Table::new(),
        });
        let slot = self.stack.len() - 1 - argc as usize;
        self.stack[slot] = Value::Obj(instance_ref);

        let init_string = self.init_string;
        let init_hash = self.heap.as_string(init_string).hash;
        let init_method = self
            .heap
            .as_class(class_ref)
            .methods
            .get(init_hash, |k| k == init_string)
            .copied();
        match init_method {
            Some(Value::Obj(init_closure)) => self.call_closure(init_closure, argc),
            _ if argc == 0 => Ok(()),
            _ => Err(RuntimeError::ArityMismatch {
                expected: 0,
                got: argc,
            }),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let function_ref = self.heap.as_closure(closure_ref).function;
        let arity = self.heap.as_function(function_ref).arity;
        if argc != arity {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: argc,
            });
        }
        if self.frames.len() >= self.frames_max {
            return Err(RuntimeError::StackOverflow);
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn invoke(&mut self, name_ref: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.data(r), ObjData::Instance(_)) => r,
            _ => return Err(RuntimeError::OnlyInstancesHaveProperties),
        };
        let hash = self.heap.as_string(name_ref).hash;
        let field = self
            .heap
            .as_instance(instance_ref)
            .fields
            .get(hash, |k| k == name_ref)
            .copied();
        if let Some(value) = field {
            let slot = self.stack.len() - 1 - argc as usize;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }
        let class_ref = self.heap.as_instance(instance_ref).class;
        self.invoke_from_class(class_ref, name_ref, argc)
    }

    fn invoke_from_class(
        &mut self,
        class_ref: ObjRef,
        name_ref: ObjRef,
        argc: u8,
    ) -> Result<(), RuntimeError> {
        let hash = self.heap.as_string(name_ref).hash;
        let method = self
            .heap
            .as_class(class_ref)
            .methods
            .get(hash, |k| k == name_ref)
            .copied();
        match method {
            Some(Value::Obj(closure_ref)) => self.call_closure(closure_ref, argc),
            _ => {
                let name = self.heap.as_string(name_ref).content.clone();
                Err(RuntimeError::UndefinedProperty(name))
            }
        }
    }

    // --- property access (spec §4.6) ----------------------------------------

    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let name_ref = self.read_string_constant();
        let receiver = self.peek(0);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.data(r), ObjData::Instance(_)) => r,
            _ => return Err(RuntimeError::OnlyInstancesHaveProperties),
        };
        let hash = self.heap.as_string(name_ref).hash;
        let field = self
            .heap
            .as_instance(instance_ref)
            .fields
            .get(hash, |k| k == name_ref)
            .copied();
        if let Some(value) = field {
            self.pop();
            self.push(value);
            return Ok(());
        }
        let class_ref = self.heap.as_instance(instance_ref).class;
        self.bind_method(class_ref, name_ref)
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let name_ref = self.read_string_constant();
        let value = self.peek(0);
        let receiver = self.peek(1);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.data(r), ObjData::Instance(_)) => r,
            _ => return Err(RuntimeError::OnlyInstancesHaveProperties),
        };
        let hash = self.heap.as_string(name_ref).hash;
        // Always writes, even over a same-named method (spec §9: load-bearing
        // for dynamic semantics, matching the reference implementation).
        self.heap
            .as_instance_mut(instance_ref)
            .fields
            .set(name_ref, hash, value, |k| k == name_ref);
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn bind_method(&mut self, class_ref: ObjRef, name_ref: ObjRef) -> Result<(), RuntimeError> {
        let hash = self.heap.as_string(name_ref).hash;
        let method = self
            .heap
            .as_class(class_ref)
            .methods
            .get(hash, |k| k == name_ref)
            .copied();
        match method {
            Some(Value::Obj(method_ref)) => {
                self.maybe_collect();
                let receiver = self.pop();
                let bound_ref = self.heap.alloc_bound_method(ObjBoundMethod {
                    receiver,
                    method: method_ref,
                });
                self.push(Value::Obj(bound_ref));
                Ok(())
            }
            _ => {
                let name = self.heap.as_string(name_ref).content.clone();
                Err(RuntimeError::UndefinedProperty(name))
            }
        }
    }

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let superclass_val = self.peek(1);
        let subclass_val = self.peek(0);
        let super_ref = match superclass_val {
            Value::Obj(r) if matches!(self.heap.data(r), ObjData::Class(_)) => r,
            _ => return Err(RuntimeError::SuperclassMustBeClass),
        };
        let sub_ref = subclass_val.as_obj().expect("subclass must be a class object");

        let methods: Vec<(ObjRef, Value)> = self
            .heap
            .as_class(super_ref)
            .methods
            .iter()
            .map(|(k, v)| (k, *v))
            .collect();
        for (name_ref, method) in methods {
            let hash = self.heap.as_string(name_ref).hash;
            self.heap
                .as_class_mut(sub_ref)
                .methods
                .set(name_ref, hash, method, |k| k == name_ref);
        }
        self.pop(); // the subclass; the superclass stays bound as local `super`.
        Ok(())
    }

    fn define_method(&mut self) {
        let name_ref = self.read_string_constant();
        let method = self.peek(0);
        let class_ref = self.peek(1).as_obj().expect("method target must be a class");
        let hash = self.heap.as_string(name_ref).hash;
        self.heap
            .as_class_mut(class_ref)
            .methods
            .set(name_ref, hash, method, |k| k == name_ref);
        self.pop();
    }

    fn make_closure(&mut self) {
        let value = self.read_constant();
        let function_ref = value.as_obj().expect("closure constant must be a function");
        let upvalue_count = self.heap.as_function(function_ref).upvalue_count;
        let current_closure = self.frames.last().unwrap().closure;

        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_u8() == 1;
            let index = self.read_u8() as usize;
            if is_local {
                let base = self.frames.last().unwrap().base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let parent = &self.heap.as_closure(current_closure).upvalues;
                upvalues.push(parent[index]);
            }
        }
        self.maybe_collect();
        let closure_ref = self.heap.alloc_closure(ObjClosure {
            function: function_ref,
            upvalues,
        });
        self.push(Value::Obj(closure_ref));
    }

    // --- upvalues (spec §4.6) -----------------------------------------------

    fn capture_upvalue(&mut self, location: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            let loc = match self.heap.as_upvalue(r) {
                UpvalueState::Open(loc) => *loc,
                UpvalueState::Closed(_) => continue,
            };
            if loc == location {
                return r;
            }
            if loc < location {
                insert_at = i;
                break;
            }
        }
        self.maybe_collect();
        let upvalue_ref = self.heap.alloc_upvalue(UpvalueState::Open(location));
        self.open_upvalues.insert(insert_at, upvalue_ref);
        upvalue_ref
    }

    /// Close every open upvalue whose slot is at or above `from` (spec §4.6
    /// "Upvalue closing"). `open_upvalues` is sorted descending, so these are
    /// always a prefix.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let loc = match self.heap.as_upvalue(first) {
                UpvalueState::Open(loc) => *loc,
                UpvalueState::Closed(_) => {
                    self.open_upvalues.remove(0);
                    continue;
                }
            };
            if loc < from {
                break;
            }
            let value = self.stack[loc];
            *self.heap.as_upvalue_mut(first) = UpvalueState::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // --- GC integration ------------------------------------------------------

    fn maybe_collect(&mut self) {
        if !self.gc.should_collect(&self.heap) {
            return;
        }
        let frame_closures: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
        let pinned = [self.init_string];
        let roots = Roots {
            stack: &self.stack,
            frame_closures: &frame_closures,
            open_upvalues: &self.open_upvalues,
            globals: &self.globals,
            pinned: &pinned,
        };
        self.gc.collect(&mut self.heap, roots);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn values_equal(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => x == y,
        _ => false,
    }
}

/// `clock()` native (spec §6 "Built-ins"): seconds since process start.
fn native_clock(_args: &[Value]) -> Result<Value, RuntimeError> {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Vec::new())))
        }

        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn vm_with_shared_output() -> (Vm, SharedBuf) {
        let output = SharedBuf::new();
        let vm = Vm::with_sinks(Box::new(output.clone()), Box::new(output.clone()), false);
        (vm, output)
    }

    #[test]
    fn arithmetic_and_precedence() {
        let (mut vm, output) = vm_with_shared_output();
        vm.interpret("print 1 + 2 * 3;").unwrap();
        assert_eq!(output.text(), "7\n");
    }

    #[test]
    fn scope_shadowing() {
        let (mut vm, output) = vm_with_shared_output();
        vm.interpret("var a = 1; { var a = 2; print a; } print a;")
            .unwrap();
        assert_eq!(output.text(), "2\n1\n");
    }

    #[test]
    fn closures_capture_by_reference() {
        let (mut vm, output) = vm_with_shared_output();
        vm.interpret(
            "fun makeCounter() { var i = 0; fun inc() { i = i + 1; return i; } return inc; } \
             var c = makeCounter(); print c(); print c(); print c();",
        )
        .unwrap();
        assert_eq!(output.text(), "1\n2\n3\n");
    }

    #[test]
    fn classes_inheritance_and_super() {
        let (mut vm, output) = vm_with_shared_output();
        vm.interpret(
            "class A { greet() { print \"hi from A\"; } } \
             class B < A { greet() { super.greet(); print \"hi from B\"; } } \
             B().greet();",
        )
        .unwrap();
        assert_eq!(output.text(), "hi from A\nhi from B\n");
    }

    #[test]
    fn string_interning_equality() {
        let (mut vm, output) = vm_with_shared_output();
        vm.interpret("var s = \"foo\"; var t = \"fo\" + \"o\"; print s == t;")
            .unwrap();
        assert_eq!(output.text(), "true\n");
    }

    #[rstest::rstest]
    #[case("print 1 + 2;", "3\n")]
    #[case("print 10 - 4;", "6\n")]
    #[case("print 3 * 4;", "12\n")]
    #[case("print 7 / 2;", "3.5\n")]
    #[case("print 1 < 2;", "true\n")]
    #[case("print 2 <= 2;", "true\n")]
    #[case("print 3 > 4;", "false\n")]
    #[case("print 3 >= 4;", "false\n")]
    #[case("print 1 == 1;", "true\n")]
    #[case("print 1 != 1;", "false\n")]
    #[case("print \"a\" + \"b\";", "ab\n")]
    #[case("print !false;", "true\n")]
    #[case("print -5;", "-5\n")]
    fn binary_and_unary_operators_evaluate_correctly(#[case] source: &str, #[case] expected: &str) {
        let (mut vm, output) = vm_with_shared_output();
        vm.interpret(source).unwrap();
        pretty_assertions::assert_eq!(output.text(), expected);
    }

    #[test]
    fn arity_mismatch_is_a_runtime_error() {
        let mut vm = Vm::with_sinks(Box::new(std::io::sink()), Box::new(std::io::sink()), false);
        let err = vm
            .interpret("fun f(a, b) { return a + b; } f(1);")
            .unwrap_err();
        match err {
            InterpretError::Runtime(RuntimeError::ArityMismatch { expected, got }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 1);
            }
            other => panic!("expected arity mismatch, got {other:?}"),
        }
    }
}

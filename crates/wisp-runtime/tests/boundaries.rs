//! Boundary behaviours from spec §8.
//!
//! Parameter/constant-pool boundaries are exercised as compiler unit tests
//! colocated with `compiler.rs`/`chunk/mod.rs`; this file covers the ones
//! that need a full `compile` + `Vm::interpret` round trip: local-variable
//! capacity and call-depth (recursion) limits.

use wisp_runtime::vm::FRAMES_MAX;
use wisp_runtime::{compile, Heap, Vm};

#[test]
fn exactly_the_local_capacity_compiles() {
    // One slot is reserved for the function's implicit receiver, so 255
    // explicit locals fills the 256-slot local array exactly (spec §8:
    // "A function with exactly 256 locals compiles").
    let decls: String = (0..255).map(|i| format!("var x{i} = {i};\n")).collect();
    let source = format!("fun f() {{ {decls} return x0; }}");
    let mut heap = Heap::new();
    assert!(compile(&source, &mut heap).is_ok());
}

#[test]
fn one_more_than_the_local_capacity_fails() {
    let decls: String = (0..256).map(|i| format!("var x{i} = {i};\n")).collect();
    let source = format!("fun f() {{ {decls} return x0; }}");
    let mut heap = Heap::new();
    let err = compile(&source, &mut heap).unwrap_err();
    assert!(err
        .diagnostics()
        .iter()
        .any(|d| d.message == "Too many local variables in function."));
}

#[test]
fn recursion_within_the_frame_cap_runs_to_completion() {
    let source = format!(
        "fun countdown(n) {{ if (n <= 0) return 0; return 1 + countdown(n - 1); }} \
         print countdown({});",
        FRAMES_MAX - 2
    );
    let mut vm = Vm::with_sinks(Box::new(std::io::sink()), Box::new(std::io::sink()), false);
    assert!(vm.interpret(&source).is_ok());
}

#[test]
fn recursion_past_the_frame_cap_raises_stack_overflow() {
    let source = format!(
        "fun countdown(n) {{ if (n <= 0) return 0; return 1 + countdown(n - 1); }} \
         print countdown({});",
        FRAMES_MAX * 4
    );
    let mut vm = Vm::with_sinks(Box::new(std::io::sink()), Box::new(std::io::sink()), false);
    let err = vm.interpret(&source).unwrap_err();
    match err {
        wisp_runtime::vm::InterpretError::Runtime(wisp_runtime::value::RuntimeError::StackOverflow) => {}
        other => panic!("expected stack overflow, got {other:?}"),
    }
}

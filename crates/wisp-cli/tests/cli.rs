//! End-to-end CLI tests (spec §6 "External interfaces").

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn wisp() -> Command {
    Command::cargo_bin("wisp").unwrap()
}

fn script(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{source}").unwrap();
    file
}

#[test]
fn runs_a_script_file_and_exits_zero() {
    let file = script("print 1 + 2 * 3;");
    wisp()
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("7"));
}

#[test]
fn too_many_arguments_is_a_usage_error() {
    wisp()
        .arg("a.wisp")
        .arg("b.wisp")
        .assert()
        .code(64)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn missing_file_is_an_io_error() {
    wisp().arg("does-not-exist.wisp").assert().code(74);
}

#[test]
fn compile_error_exits_65() {
    let file = script("var = ;");
    wisp().arg(file.path()).assert().code(65);
}

#[test]
fn runtime_error_exits_70_with_stack_trace() {
    let file = script("fun f(a, b) { return a + b; } f(1);");
    wisp()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("Expected 2 arguments but got 1."));
}

#[test]
fn classes_and_inheritance_print_expected_output() {
    let file = script(
        "class A { greet() { print \"hi from A\"; } } \
         class B < A { greet() { super.greet(); print \"hi from B\"; } } \
         B().greet();",
    );
    wisp()
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("hi from A\nhi from B"));
}

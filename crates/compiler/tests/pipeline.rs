//! End-to-end pipeline tests: source text through the VM.

use scatha_core::opcode::{code_size, OpCode};
use scatha_core::program::ProgramView;
use scatha_core::Builtin;
use scatha_vm::VirtualMachine;
use scathac::{compile_source, CompilerConfig};

fn compile(source: &str) -> Vec<u8> {
    compile_source(source, &CompilerConfig::default())
        .unwrap_or_else(|e| panic!("compilation failed:\n{}", e))
}

fn run(source: &str, args: &[u64]) -> u64 {
    let image = compile(source);
    let mut vm = VirtualMachine::default();
    vm.load_binary(&image).expect("image loads");
    vm.execute(args).expect("program runs")
}

/// Decode the text section into (offset, opcode, operand bytes).
fn decode(image: &[u8]) -> Vec<(usize, OpCode, Vec<u8>)> {
    let view = ProgramView::new(image).unwrap();
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < view.text.len() {
        let op = OpCode::try_from(view.text[offset]).expect("valid opcode");
        let size = code_size(op);
        out.push((offset, op, view.text[offset + 1..offset + size].to_vec()));
        offset += size;
    }
    out
}

#[test]
fn test_simple_arithmetic() {
    assert_eq!(run("fn main() -> int { return 2 * 3 + 1; }", &[]), 7);
}

#[test]
fn test_arithmetic_without_folding() {
    let source = "fn compute(a: int, b: int) -> int { return a * b + 1; } \
                  fn main() -> int { return compute(2, 3); }";
    assert_eq!(run(source, &[]), 7);
}

#[test]
fn test_overload_resolution_selects_by_type() {
    let source = "fn pick(n: int) -> int { return 1; } \
                  fn pick(d: double) -> int { return 2; } \
                  fn main() -> int { return pick(10) * 10 + pick(1.5); }";
    assert_eq!(run(source, &[]), 12);
}

#[test]
fn test_overload_no_match_is_rejected() {
    let err = compile_source(
        "fn f(n: int) -> int { return n; } \
         fn f(d: double) -> double { return d; } \
         fn main() { f(\"s\"); }",
        &CompilerConfig::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("NoMatch"), "{}", err);
}

#[test]
fn test_struct_def_cycle_detected() {
    let err = compile_source(
        "struct X { var y: Y; } struct Y { var x: X; }",
        &CompilerConfig::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("StructDefCycle"), "{}", err);
}

#[test]
fn test_lifetime_blocks_default_construction() {
    let err = compile_source(
        "struct S { var p: *unique int; } fn main() { var s: S; }",
        &CompilerConfig::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("CannotConstructType"), "{}", err);
}

#[test]
fn test_conditional_runs_both_arms() {
    let source = "fn sel(c: bool) -> int { return c ? 10 : 20; } \
                  fn main() -> int { return sel(true) + sel(false); }";
    assert_eq!(run(source, &[]), 30);
}

#[test]
fn test_ffi_call_targets_builtin_slot() {
    let image = compile(
        "extern \"C\" fn puts(s: *str) -> void; \
         fn main() { puts(\"hello\"); }",
    );
    let putstr: u16 = Builtin::Putstr.into();
    let call = decode(&image)
        .into_iter()
        .find(|(_, op, _)| *op == OpCode::CallExt)
        .expect("program contains a callExt");
    let (_, _, operands) = call;
    assert_eq!(operands[1], 0, "slot 0 holds the builtins");
    assert_eq!(u16::from_le_bytes([operands[2], operands[3]]), putstr);
    // And it runs, printing through the host's stdout.
    let mut vm = VirtualMachine::default();
    vm.load_binary(&image).unwrap();
    vm.execute(&[]).unwrap();
}

#[test]
fn test_loops_and_jumps() {
    let source = "fn main() -> int { \
                      var acc = 0; \
                      for i = 0; i < 10; ++i { \
                          if i == 7 { continue; } \
                          if i == 9 { break; } \
                          acc += i; \
                      } \
                      return acc; \
                  }";
    // 0+1+2+3+4+5+6+8 = 29
    assert_eq!(run(source, &[]), 29);
}

#[test]
fn test_while_loop() {
    let source = "fn main() -> int { \
                      var n = 1; \
                      while n < 100 { n = n * 2; } \
                      return n; \
                  }";
    assert_eq!(run(source, &[]), 128);
}

#[test]
fn test_recursion() {
    let source = "fn fact(n: int) -> int { \
                      if n <= 1 { return 1; } \
                      return n * fact(n - 1); \
                  } \
                  fn main() -> int { return fact(6); }";
    assert_eq!(run(source, &[]), 720);
}

#[test]
fn test_mutual_recursion_with_deduction() {
    let source = "fn is_even(n: int) -> bool { \
                      if n == 0 { return true; } \
                      return is_odd(n - 1); \
                  } \
                  fn is_odd(n: int) -> bool { \
                      if n == 0 { return false; } \
                      return is_even(n - 1); \
                  } \
                  fn main() -> int { \
                      if is_even(10) { return 1; } \
                      return 0; \
                  }";
    assert_eq!(run(source, &[]), 1);
}

#[test]
fn test_struct_field_access_and_methods() {
    let source = "struct Point { \
                      var x: int; \
                      var y: int; \
                      fn dot(&this, other: &Point) -> int { \
                          return this.x * other.x + this.y * other.y; \
                      } \
                  } \
                  fn main() -> int { \
                      var a = Point(3, 4); \
                      var b = Point(2, 5); \
                      a.x = a.x + 1; \
                      return a.dot(b); \
                  }";
    assert_eq!(run(source, &[]), 28);
}

#[test]
fn test_nested_struct_layout_at_runtime() {
    let source = "struct Inner { var a: int; var b: int; } \
                  struct Outer { var first: Inner; var tail: int; } \
                  fn main() -> int { \
                      var o = Outer(Inner(1, 2), 3); \
                      return o.first.a * 100 + o.first.b * 10 + o.tail; \
                  }";
    assert_eq!(run(source, &[]), 123);
}

#[test]
fn test_fixed_arrays() {
    let source = "fn main() -> int { \
                      var xs = [1, 2, 3, 4]; \
                      var sum = 0; \
                      for i = 0; i < xs.count; ++i { sum += xs[i]; } \
                      return sum; \
                  }";
    assert_eq!(run(source, &[]), 10);
}

#[test]
fn test_pointers_and_deref() {
    let source = "fn bump(p: *mut int) { *p += 1; } \
                  fn main() -> int { \
                      var x = 41; \
                      bump(&mut x); \
                      return x; \
                  }";
    assert_eq!(run(source, &[]), 42);
}

#[test]
fn test_unique_pointer_allocation() {
    let source = "fn main() -> int { \
                      var p = unique 21; \
                      return *p * 2; \
                  }";
    assert_eq!(run(source, &[]), 42);
}

#[test]
fn test_explicit_conversions() {
    let source = "fn main() -> int { \
                      let d = 3.9; \
                      let truncated = d as int; \
                      let back = truncated as double; \
                      return truncated + (back as int); \
                  }";
    assert_eq!(run(source, &[]), 6);
}

#[test]
fn test_float_arithmetic_end_to_end() {
    let source = "fn scale(x: double, by: double) -> double { return x * by; } \
                  fn main() -> int { return scale(1.5, 4.0) as int; }";
    assert_eq!(run(source, &[]), 6);
}

#[test]
fn test_math_builtin_through_extern() {
    let source = "extern \"C\" fn sqrt(x: double) -> double; \
                  fn main() -> int { return sqrt(81.0) as int; }";
    assert_eq!(run(source, &[]), 9);
}

#[test]
fn test_globals_initialize_before_main() {
    let source = "var base = 40; \
                  fn main() -> int { return base + 2; }";
    assert_eq!(run(source, &[]), 42);
}

#[test]
fn test_logical_operators_short_circuit() {
    let source = "var touched = 0; \
                  fn touch() -> bool { touched = 1; return true; } \
                  fn main() -> int { \
                      let a = false && touch(); \
                      if a { return 100; } \
                      return touched; \
                  }";
    assert_eq!(run(source, &[]), 0);
}

#[test]
fn test_fstring_builds_and_prints() {
    let source = "fn main() -> int { \
                      let s = \"2 + 2 = \\(2 + 2)!\"; \
                      __builtin_putstr(reinterpret<*str>(s)); \
                      return 0; \
                  }";
    assert_eq!(run(source, &[]), 0);
}

#[test]
fn test_empty_translation_unit_fails_only_at_start() {
    // An empty module analyzes cleanly; without `main` the image simply has
    // no meaningful entry, which the driver treats as the first function.
    let err = compile_source("", &CompilerConfig::default());
    // No functions at all: assembling has no entry point.
    assert!(err.is_err());
}

#[test]
fn test_main_exit_code_zero_for_void_main() {
    assert_eq!(run("fn main() { }", &[]), 0);
}

#[test]
fn test_tail_recursion_is_flattened() {
    let source = "fn count(n: int, acc: int) -> int { \
                      if n == 0 { return acc; } \
                      return count(n - 1, acc + 1); \
                  } \
                  fn main() -> int { return count(100000, 0); }";
    // Deep enough that, without the tail call rewrite, the register file
    // would overflow.
    assert_eq!(run(source, &[]), 100000);
    let image = compile(source);
    let calls = decode(&image)
        .into_iter()
        .filter(|(_, op, _)| *op == OpCode::Call)
        .count();
    assert_eq!(calls, 1, "only main's call to count survives");
}

#[test]
fn test_assembling_is_deterministic() {
    let source = "fn f(n: int) -> int { return n + 1; } \
                  fn main() -> int { return f(1); }";
    assert_eq!(compile(source), compile(source));
}

#[test]
fn test_library_import_installs_exports() {
    use scathac::library::{
        write_library, ExportedFunction, LibraryManifest, TypeDesc,
    };
    let dir = tempfile::tempdir().unwrap();
    let manifest = LibraryManifest {
        name: "mathx".to_string(),
        exports: vec![ExportedFunction {
            name: "triple".to_string(),
            params: vec![TypeDesc::Int { width: 64, signed: true }],
            ret: TypeDesc::Int { width: 64, signed: true },
        }],
    };
    write_library(&dir.path().join("mathx.scibin"), &manifest).unwrap();

    let config = CompilerConfig::new().with_library_path(dir.path());
    let image = compile_source(
        "use mathx; \
         fn main() -> int { return triple(14); }",
        &config,
    )
    .unwrap();
    // The import binds to the library's foreign slot; the host provides the
    // implementation.
    let mut vm = VirtualMachine::default();
    vm.set_foreign_function(2, 0, |vm, w| {
        let x = vm.register(w, 0);
        vm.set_register(w, 0, x * 3);
        Ok(())
    });
    vm.load_binary(&image).unwrap();
    assert_eq!(vm.execute(&[]).unwrap(), 42);
}

#[test]
fn test_scoped_import_requires_qualification() {
    use scathac::library::{
        write_library, ExportedFunction, LibraryManifest, TypeDesc,
    };
    let dir = tempfile::tempdir().unwrap();
    let manifest = LibraryManifest {
        name: "mathx".to_string(),
        exports: vec![ExportedFunction {
            name: "triple".to_string(),
            params: vec![TypeDesc::Int { width: 64, signed: true }],
            ret: TypeDesc::Int { width: 64, signed: true },
        }],
    };
    write_library(&dir.path().join("mathx.scibin"), &manifest).unwrap();
    let config = CompilerConfig::new().with_library_path(dir.path());

    // Unqualified use under `import` fails...
    assert!(compile_source(
        "import mathx; fn main() -> int { return triple(1); }",
        &config
    )
    .is_err());
    // ...the qualified form resolves.
    assert!(compile_source(
        "import mathx; fn main() -> int { return mathx.triple(1); }",
        &config
    )
    .is_ok());
}

mod common;

use common::*;

fn run_both(source: &str) -> (Vec<(String, Value)>, Vec<(String, Value)>, Backend) {
    let interpreted = run_interpreted(source);

    let mut vm = jit_vm();
    vm.compile(source).expect("compile should succeed");
    let backend = vm.execute().expect("execution should succeed");
    (interpreted.globals(), vm.globals(), backend)
}

fn assert_backends_agree(source: &str) {
    let (interpreted, native, backend) = run_both(source);
    assert_eq!(interpreted, native, "backends disagree on:\n{source}");
    if native_jit_supported() {
        assert_eq!(backend, Backend::Jit);
    } else {
        assert_eq!(backend, Backend::Interpreter);
    }
}

#[test]
fn int_and_float_arithmetic_agree() {
    assert_backends_agree(
        "int a, b, q; float x, y;\n\
         a = 17; b = -5;\n\
         q = a * b - a / b + 3;\n\
         x = 1.5; y = x * x / 0.5 - 2;",
    );
}

#[test]
fn loops_branches_and_calls_agree() {
    assert_backends_agree(
        "int i, evens, odds;\n\
         void classify() { if (i / 2 * 2 == i) evens += 1; else odds += 1; }\n\
         while (i < 25) { classify(); i += 1; }",
    );
}

#[test]
fn float_comparisons_agree() {
    assert_backends_agree(
        "float f; int lower, equal, notlower;\n\
         f = 0.25;\n\
         if (f < 0.5) lower = 1;\n\
         if (f == 0.25) equal = 1;\n\
         if (f >= 1.0) notlower = 1; else notlower = 2;",
    );
}

#[test]
fn struct_operations_agree() {
    assert_backends_agree(
        "struct V { float x, y; int n; ptr p; }\n\
         V a, b, c;\n\
         a.x = 1.0; a.y = 2.0; a.n = 3; a.p = 9;\n\
         b.x = 0.5; b.y = 0.25; b.n = 4;\n\
         c = a;\n\
         c = c * b;\n\
         c = c + a;\n\
         float cx, cy; int cn; ptr cp;\n\
         cx = c.x; cy = c.y; cn = c.n; cp = c.p;",
    );
}

#[test]
fn externals_run_from_native_code() {
    let mut vm = jit_vm();
    let log = bind_recorder(&mut vm, "emit");
    vm.compile("extern void emit(int v, float w); int i; while (i < 3) { emit(i, 0.5); i += 1; }")
        .expect("compile should succeed");
    vm.execute().expect("execution should succeed");
    assert_eq!(
        *log.borrow(),
        vec![
            Value::Int(0),
            Value::Float(0.5),
            Value::Int(1),
            Value::Float(0.5),
            Value::Int(2),
            Value::Float(0.5),
        ]
    );
}

#[test]
fn host_errors_surface_from_native_code() {
    let mut vm = jit_vm();
    vm.bind_external("fail", |_| Err(RuntimeFault::Host("nope".to_string())));
    vm.compile("int before, after; before = 1; fail(); after = 1;")
        .expect("compile should succeed");
    assert_eq!(
        vm.execute(),
        Err(RuntimeFault::Host("nope".to_string()))
    );
    assert_eq!(vm.global("before"), Some(Value::Int(1)));
    assert_eq!(vm.global("after"), Some(Value::Int(0)));
}

#[test]
fn native_faults_match_the_interpreter() {
    let mut vm = Vm::with_config(VmConfig {
        max_call_depth: 4,
        ..VmConfig::default()
    });
    vm.compile("int n; void f() { n += 1; f(); } f();")
        .expect("compile should succeed");
    assert_eq!(vm.execute(), Err(RuntimeFault::StackOverflow { depth: 4 }));
    assert_eq!(vm.global("n"), Some(Value::Int(4)));

    let mut vm = jit_vm();
    vm.compile("int a, z; a = 1; a = a / z;")
        .expect("compile should succeed");
    assert_eq!(vm.execute(), Err(RuntimeFault::DivisionByZero));
}

#[test]
fn oversized_structs_fall_back_to_the_interpreter() {
    let mut vm = Vm::with_config(VmConfig {
        jit: JitConfig {
            enabled: native_jit_supported(),
            max_struct_unroll: 2,
        },
        ..VmConfig::default()
    });
    vm.compile("struct T { int a, b, c; } T x, y; x = x + y;")
        .expect("compile should succeed");
    assert!(!vm.has_native_image());
    assert_eq!(vm.execute(), Ok(Backend::Interpreter));
    if native_jit_supported() {
        let snapshot = vm.jit_snapshot();
        assert!(matches!(
            snapshot.refusal,
            Some(goomsl::JitNyiReason::StructTooLarge { limit: 2, .. })
        ));
        assert!(vm.dump_jit_info().contains("unroll limit is 2"));
    }
}

#[test]
fn deep_call_budgets_stay_on_the_interpreter() {
    let mut vm = Vm::with_config(VmConfig {
        max_call_depth: 1 << 20,
        ..VmConfig::default()
    });
    vm.compile("int i; i = 1;").expect("compile should succeed");
    assert!(!vm.has_native_image());
    assert_eq!(vm.execute(), Ok(Backend::Interpreter));
}

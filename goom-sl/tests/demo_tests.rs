mod common;

use common::*;

fn run_demo(name: &str, mut vm: Vm) -> (Vm, Vec<Value>) {
    let source = demo_source(name);
    let ints = bind_recorder(&mut vm, "print_int");
    let floats = bind_recorder(&mut vm, "print_float");
    vm.compile(&source).expect("demo should compile");
    vm.execute().expect("demo should run");
    let mut printed = ints.borrow().clone();
    printed.extend(floats.borrow().iter().copied());
    (vm, printed)
}

#[test]
fn spiral_walks_sixteen_steps() {
    for vm in [interpreter_vm(), jit_vm()] {
        let (vm, printed) = run_demo("spiral.gsl", vm);
        assert_eq!(vm.global("steps"), Some(Value::Int(16)));
        assert_eq!(vm.global("radius"), Some(Value::Float(4.0)));
        assert_eq!(printed, vec![Value::Float(30.0)]);
    }
}

#[test]
fn fibonacci_prints_the_twentieth_number() {
    for vm in [interpreter_vm(), jit_vm()] {
        let (vm, printed) = run_demo("fibonacci.gsl", vm);
        assert_eq!(vm.global("result"), Some(Value::Int(6765)));
        assert_eq!(printed, vec![Value::Int(6765)]);
    }
}

#[test]
fn palette_blends_colours() {
    for vm in [interpreter_vm(), jit_vm()] {
        let (vm, _) = run_demo("palette.gsl", vm);
        assert_eq!(vm.global("bright"), Some(Value::Int(3)));
        assert_eq!(vm.global("i"), Some(Value::Int(3)));
    }
}

#![allow(dead_code, unused_imports)]

use std::cell::RefCell;
use std::rc::Rc;

pub use goomsl::{
    Backend, CompileError, JitConfig, RuntimeFault, Value, Vm, VmConfig, compile_source,
    native_jit_supported,
};

pub fn interpreter_vm() -> Vm {
    Vm::with_config(VmConfig {
        jit: JitConfig {
            enabled: false,
            ..JitConfig::default()
        },
        ..VmConfig::default()
    })
}

pub fn jit_vm() -> Vm {
    Vm::with_config(VmConfig {
        jit: JitConfig {
            enabled: native_jit_supported(),
            ..JitConfig::default()
        },
        ..VmConfig::default()
    })
}

/// Binds `name` to a native that appends its arguments to the returned log.
pub fn bind_recorder(vm: &mut Vm, name: &str) -> Rc<RefCell<Vec<Value>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    vm.bind_external(name, move |call| {
        sink.borrow_mut().extend(call.args()?);
        Ok(())
    });
    log
}

pub fn run_interpreted(source: &str) -> Vm {
    let mut vm = interpreter_vm();
    vm.compile(source).expect("compile should succeed");
    vm.execute().expect("execution should succeed");
    vm
}

pub fn global(vm: &Vm, name: &str) -> Value {
    vm.global(name)
        .unwrap_or_else(|| panic!("global '{name}' should exist"))
}

pub fn demo_source(name: &str) -> String {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("demos")
        .join(name);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|err| panic!("demo {} should be readable: {err}", path.display()))
}

use std::collections::HashMap;

use crate::compiler::{CompiledProgram, ExternalBinding};
use crate::symbols::SymbolTable;
use crate::vm::{RuntimeFault, Value, VmResult};

/// A native function callable from scripts through `extcall`.
pub trait ExternalFunction {
    fn call(&mut self, call: &mut ExternalCall<'_>) -> VmResult<()>;
}

impl<F> ExternalFunction for F
where
    F: FnMut(&mut ExternalCall<'_>) -> VmResult<()>,
{
    fn call(&mut self, call: &mut ExternalCall<'_>) -> VmResult<()> {
        self(call)
    }
}

/// Native functions by name. Scripts link against the registry at compile
/// time; the link stores the slot index, so rebinding a name after compiling
/// swaps the implementation without recompiling.
#[derive(Default)]
pub struct ExternalRegistry {
    functions: Vec<(String, Box<dyn ExternalFunction>)>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ExternalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalRegistry")
            .field("functions", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl ExternalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<F>(&mut self, name: &str, function: F)
    where
        F: FnMut(&mut ExternalCall<'_>) -> VmResult<()> + 'static,
    {
        self.bind_function(name, Box::new(function));
    }

    pub fn bind_function(&mut self, name: &str, function: Box<dyn ExternalFunction>) {
        if let Some(&slot) = self.index.get(name) {
            self.functions[slot].1 = function;
            return;
        }
        self.index.insert(name.to_string(), self.functions.len());
        self.functions.push((name.to_string(), function));
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Runs the native behind `program.externals()[link]`.
    pub fn invoke(&mut self, link: usize, program: &mut CompiledProgram) -> VmResult<()> {
        let binding = program
            .externals()
            .get(link)
            .ok_or_else(|| RuntimeFault::Host(format!("no external link #{link}")))?;
        let native = binding.native;
        let (_, function) = self.functions.get_mut(native).ok_or_else(|| {
            RuntimeFault::Host(format!("external '{}' is no longer bound", binding.name))
        })?;
        let mut call = ExternalCall {
            program,
            binding: link,
        };
        function.call(&mut call)
    }
}

/// What a native function sees of the running script: its own parameters,
/// its result slot and the program's globals.
pub struct ExternalCall<'a> {
    program: &'a mut CompiledProgram,
    binding: usize,
}

impl ExternalCall<'_> {
    fn binding(&self) -> VmResult<&ExternalBinding> {
        self.program
            .externals()
            .get(self.binding)
            .ok_or_else(|| RuntimeFault::Host(format!("no external link #{}", self.binding)))
    }

    pub fn name(&self) -> &str {
        self.binding().map_or("", |binding| binding.name.as_str())
    }

    /// Parameter values in declaration order.
    pub fn args(&self) -> VmResult<Vec<Value>> {
        let locals = self.binding()?.locals;
        let Some(namespace) = self.program.symbols().namespace(locals) else {
            return Ok(Vec::new());
        };
        namespace
            .iter()
            .filter(|symbol| !symbol.name.contains('.'))
            .map(|symbol| self.program.read_symbol(symbol))
            .collect()
    }

    pub fn arg(&self, name: &str) -> VmResult<Value> {
        let binding = self.binding()?;
        let symbol = self
            .program
            .symbols()
            .lookup_in(binding.locals, name)
            .ok_or_else(|| {
                RuntimeFault::Host(format!("'{}' has no parameter '{name}'", binding.name))
            })?;
        self.program.read_symbol(symbol)
    }

    /// Writes the value scripts read back as the call's result.
    pub fn set_result(&mut self, value: Value) -> VmResult<()> {
        let name = self.binding()?.name.clone();
        let symbol = self
            .program
            .symbols()
            .lookup_in(SymbolTable::GLOBAL, &name)
            .cloned()
            .ok_or_else(|| {
                RuntimeFault::Host(format!("'{name}' is declared without a return type"))
            })?;
        self.program.write_symbol(&symbol, value)
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        let symbol = self.program.symbols().globals().get(name)?;
        self.program.read_symbol(symbol).ok()
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> VmResult<()> {
        let symbol = self
            .program
            .symbols()
            .globals()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeFault::UnknownGlobal(name.to_string()))?;
        self.program.write_symbol(&symbol, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileOptions, Compiler};

    #[test]
    fn rebinding_keeps_the_slot() {
        let mut registry = ExternalRegistry::new();
        registry.bind("a", |_| Ok(()));
        registry.bind("b", |_| Ok(()));
        registry.bind("a", |_| Err(RuntimeFault::Host("replaced".to_string())));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("a"), Some(0));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    struct Accumulate {
        total: f32,
    }

    impl ExternalFunction for Accumulate {
        fn call(&mut self, call: &mut ExternalCall<'_>) -> VmResult<()> {
            if let Value::Float(value) = call.arg("amount")? {
                self.total += value;
            }
            call.set_result(Value::Float(self.total))
        }
    }

    #[test]
    fn invoke_exposes_params_and_result() {
        let mut registry = ExternalRegistry::new();
        registry.bind_function("accumulate", Box::new(Accumulate { total: 1.0 }));
        let mut program = Compiler::new(CompileOptions::default(), &registry)
            .compile("extern float accumulate(float amount); float r; r = accumulate(2);")
            .expect("compile should succeed");

        let link = program
            .externals()
            .iter()
            .position(|binding| binding.name == "accumulate")
            .expect("linked");
        let amount = program
            .symbols()
            .lookup_in(program.externals()[link].locals, "amount")
            .cloned()
            .expect("param");
        program
            .write_symbol(&amount, Value::Float(2.5))
            .expect("param should be writable");

        registry
            .invoke(link, &mut program)
            .expect("invoke should succeed");
        let result = program
            .symbols()
            .globals()
            .get("accumulate")
            .cloned()
            .expect("result global");
        assert_eq!(program.read_symbol(&result), Ok(Value::Float(3.5)));
    }

    #[test]
    fn set_result_without_return_type_is_a_host_error() {
        let mut registry = ExternalRegistry::new();
        registry.bind("ping", |call| call.set_result(Value::Int(1)));
        let mut program = Compiler::new(CompileOptions::default(), &registry)
            .compile("ping();")
            .expect("compile should succeed");
        let err = registry
            .invoke(0, &mut program)
            .expect_err("there is no result slot");
        assert!(matches!(err, RuntimeFault::Host(_)));
    }
}

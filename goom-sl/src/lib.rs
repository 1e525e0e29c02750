pub mod assembler;
pub mod compiler;
pub mod diagnostics;
pub mod externals;
pub mod heap;
pub mod jit;
#[cfg(feature = "cli")]
pub mod logging;
pub mod structs;
pub mod symbols;
pub mod vm;

pub use assembler::{InstructionFlow, ResolvedFlow};
pub use compiler::{
    CompileError, CompileOptions, CompiledProgram, Compiler, ParseError, compile_source,
    parse_source,
};
pub use diagnostics::{render_compile_error, render_runtime_fault};
pub use externals::{ExternalCall, ExternalFunction, ExternalRegistry};
pub use heap::{BumpHeap, HeapOffset};
pub use jit::{JitConfig, JitNyiDoc, JitNyiReason, JitSnapshot, native_jit_supported};
pub use structs::{LayoutAlignment, StructId, StructTable, StructType};
pub use symbols::{Namespace, NamespaceId, Symbol, SymbolTable};
pub use vm::{
    Backend, Instruction, OpCode, Operand, RuntimeFault, Value, ValueType, Vm, VmConfig,
    VmResult,
};

use tracing::{debug, info, warn};

use crate::compiler::{CompileError, CompileOptions, CompiledProgram, Compiler};
use crate::externals::{ExternalCall, ExternalRegistry};
use crate::heap::{DEFAULT_CHUNK_SIZE, HeapOffset};
use crate::jit::{JitConfig, JitImage, JitNyiReason, JitSnapshot};
use crate::structs::{LayoutAlignment, StructId};

mod interpreter;

#[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")))]
pub(crate) mod jit_native;

pub const DEFAULT_MAX_CALL_DEPTH: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int,
    Float,
    Ptr,
    Struct(StructId),
}

impl ValueType {
    pub fn suffix(self) -> &'static str {
        match self {
            ValueType::Int => "i",
            ValueType::Float => "f",
            ValueType::Ptr => "p",
            ValueType::Struct(_) => "s",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Int => write!(f, "int"),
            ValueType::Float => write!(f, "float"),
            ValueType::Ptr => write!(f, "ptr"),
            ValueType::Struct(id) => write!(f, "struct #{}", id.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Pointer(i32),
    Struct(StructId),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Pointer(_) => ValueType::Ptr,
            Value::Struct(id) => ValueType::Struct(*id),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value:?}"),
            Value::Pointer(value) => write!(f, "ptr({value})"),
            Value::Struct(id) => write!(f, "struct #{}", id.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Label = 0x00,
    Set = 0x01,
    Add = 0x02,
    Sub = 0x03,
    Mul = 0x04,
    Div = 0x05,
    IsLower = 0x06,
    IsEqual = 0x07,
    Not = 0x08,
    Call = 0x09,
    ExtCall = 0x0A,
    Jump = 0x0B,
    JumpZero = 0x0C,
    JumpNotZero = 0x0D,
    Ret = 0x0E,
}

impl OpCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Label => "label",
            OpCode::Set => "set",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::IsLower => "islower",
            OpCode::IsEqual => "isequal",
            OpCode::Not => "not",
            OpCode::Call => "call",
            OpCode::ExtCall => "extcall",
            OpCode::Jump => "jump",
            OpCode::JumpZero => "jzero",
            OpCode::JumpNotZero => "jnzero",
            OpCode::Ret => "ret",
        }
    }

    /// Opcodes whose destination is a label until resolution.
    pub fn takes_label(self) -> bool {
        matches!(
            self,
            OpCode::Call | OpCode::Jump | OpCode::JumpZero | OpCode::JumpNotZero
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, OpCode::Add | OpCode::Mul | OpCode::IsEqual)
    }

    /// Whether a struct-typed destination is legal.
    pub fn allows_struct(self) -> bool {
        matches!(
            self,
            OpCode::Set | OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    None,
    IntConst(i32),
    FloatConst(f32),
    PtrConst(i32),
    IntVar(HeapOffset),
    FloatVar(HeapOffset),
    PtrVar(HeapOffset),
    StructVar { at: HeapOffset, id: StructId },
    Label(String),
    Offset(i32),
    External(usize),
}

impl Operand {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Operand::IntConst(_) | Operand::IntVar(_) => Some(ValueType::Int),
            Operand::FloatConst(_) | Operand::FloatVar(_) => Some(ValueType::Float),
            Operand::PtrConst(_) | Operand::PtrVar(_) => Some(ValueType::Ptr),
            Operand::StructVar { id, .. } => Some(ValueType::Struct(*id)),
            _ => None,
        }
    }

    pub fn storage(&self) -> Option<HeapOffset> {
        match self {
            Operand::IntVar(at) | Operand::FloatVar(at) | Operand::PtrVar(at) => Some(*at),
            Operand::StructVar { at, .. } => Some(*at),
            _ => None,
        }
    }

    pub fn for_storage(ty: ValueType, at: HeapOffset) -> Self {
        match ty {
            ValueType::Int => Operand::IntVar(at),
            ValueType::Float => Operand::FloatVar(at),
            ValueType::Ptr => Operand::PtrVar(at),
            ValueType::Struct(id) => Operand::StructVar { at, id },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub dest: Operand,
    pub src: Operand,
    pub line: u32,
}

impl Instruction {
    pub fn new(opcode: OpCode, dest: Operand, src: Operand, line: u32) -> Self {
        Self {
            opcode,
            dest,
            src,
            line,
        }
    }

    /// Mnemonic with its operand-kind suffix, e.g. `add.f`.
    pub fn typed_mnemonic(&self) -> String {
        match self.dest.value_type().or_else(|| self.src.value_type()) {
            Some(ty) => format!("{}.{}", self.opcode.mnemonic(), ty.suffix()),
            None => self.opcode.mnemonic().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeFault {
    StackOverflow { depth: usize },
    InvalidHeapHandle(HeapOffset),
    DivisionByZero,
    MalformedInstruction { index: usize },
    Host(String),
    UnknownGlobal(String),
    GlobalTypeMismatch { name: String, expected: ValueType },
    NotCompiled,
    JitNative(String),
}

impl std::fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeFault::StackOverflow { depth } => {
                write!(f, "call stack overflow (depth limit {depth})")
            }
            RuntimeFault::InvalidHeapHandle(at) => write!(f, "invalid heap handle {at}"),
            RuntimeFault::DivisionByZero => write!(f, "division by zero"),
            RuntimeFault::MalformedInstruction { index } => {
                write!(f, "malformed instruction at index {index}")
            }
            RuntimeFault::Host(message) => write!(f, "host error: {message}"),
            RuntimeFault::UnknownGlobal(name) => write!(f, "unknown global '{name}'"),
            RuntimeFault::GlobalTypeMismatch { name, expected } => {
                write!(f, "global '{name}' expects a value of type {expected}")
            }
            RuntimeFault::NotCompiled => write!(f, "no program has been compiled"),
            RuntimeFault::JitNative(message) => write!(f, "jit native error: {message}"),
        }
    }
}

impl std::error::Error for RuntimeFault {}

pub type VmResult<T> = Result<T, RuntimeFault>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub heap_chunk_size: usize,
    pub layout: LayoutAlignment,
    pub jit: JitConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            heap_chunk_size: DEFAULT_CHUNK_SIZE,
            layout: LayoutAlignment::default(),
            jit: JitConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Interpreter,
    Jit,
}

/// One script engine instance: the registered natives plus the most
/// recently compiled program and its native image.
pub struct Vm {
    config: VmConfig,
    externals: ExternalRegistry,
    program: Option<CompiledProgram>,
    jit: Option<JitImage>,
    jit_refusal: Option<JitNyiReason>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            config,
            externals: ExternalRegistry::new(),
            program: None,
            jit: None,
            jit_refusal: None,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Takes effect on the next [`Vm::compile`].
    pub fn set_jit_config(&mut self, config: JitConfig) {
        self.config.jit = config;
    }

    /// Registers a native function. Scripts link against it by name at
    /// compile time, so bind before compiling.
    pub fn bind_external<F>(&mut self, name: &str, function: F)
    where
        F: FnMut(&mut ExternalCall<'_>) -> VmResult<()> + 'static,
    {
        self.externals.bind(name, function);
    }

    pub fn externals(&self) -> &ExternalRegistry {
        &self.externals
    }

    /// Replaces the current program. The previous program and its native
    /// image are dropped even when compilation fails.
    pub fn compile(&mut self, source: &str) -> Result<&CompiledProgram, CompileError> {
        self.jit = None;
        self.jit_refusal = None;
        self.program = None;

        let options = CompileOptions {
            heap_chunk_size: self.config.heap_chunk_size,
            layout: self.config.layout,
        };
        let mut program = Compiler::new(options, &self.externals).compile(source)?;

        match crate::jit::jit_compile(&mut program, &self.config.jit, self.config.max_call_depth) {
            Ok(image) => {
                info!(code_bytes = image.code_len(), "native image built");
                self.jit = Some(image);
            }
            Err(JitNyiReason::Disabled) => {
                self.jit_refusal = Some(JitNyiReason::Disabled);
            }
            Err(reason) => {
                warn!("jit refused, using interpreter: {}", reason.message());
                self.jit_refusal = Some(reason);
            }
        }

        Ok(&*self.program.insert(program))
    }

    pub fn program(&self) -> Option<&CompiledProgram> {
        self.program.as_ref()
    }

    pub fn has_native_image(&self) -> bool {
        self.jit.is_some()
    }

    /// Runs the compiled program to completion on the native image when one
    /// exists, on the interpreter otherwise. A fault leaves the program
    /// compiled and ready for another run.
    pub fn execute(&mut self) -> VmResult<Backend> {
        let backend = if self.jit.is_some() {
            self.execute_native()?;
            Backend::Jit
        } else {
            self.execute_interpreted()?;
            Backend::Interpreter
        };
        debug!(?backend, "execution finished");
        Ok(backend)
    }

    pub fn execute_interpreted(&mut self) -> VmResult<()> {
        let program = self.program.as_mut().ok_or(RuntimeFault::NotCompiled)?;
        debug!(instructions = program.flow().len(), "interpreting");
        interpreter::run(program, &mut self.externals, self.config.max_call_depth)
    }

    pub fn execute_native(&mut self) -> VmResult<()> {
        let program = self.program.as_mut().ok_or(RuntimeFault::NotCompiled)?;
        let image = self
            .jit
            .as_ref()
            .ok_or_else(|| RuntimeFault::JitNative("no native image".to_string()))?;
        debug!(code_bytes = image.code_len(), "running native image");
        image.run(program, &mut self.externals)
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        let program = self.program.as_ref()?;
        let symbol = program.symbols().globals().get(name)?;
        program.read_symbol(symbol).ok()
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> VmResult<()> {
        let program = self.program.as_mut().ok_or(RuntimeFault::NotCompiled)?;
        let symbol = program
            .symbols()
            .globals()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeFault::UnknownGlobal(name.to_string()))?;
        program.write_symbol(&symbol, value)
    }

    /// Every global, in declaration order.
    pub fn globals(&self) -> Vec<(String, Value)> {
        let Some(program) = self.program.as_ref() else {
            return Vec::new();
        };
        program
            .symbols()
            .globals()
            .iter()
            .filter_map(|symbol| {
                let value = program.read_symbol(symbol).ok()?;
                Some((symbol.name.clone(), value))
            })
            .collect()
    }

    pub fn jit_snapshot(&self) -> JitSnapshot {
        JitSnapshot {
            arch: std::env::consts::ARCH,
            config: self.config.jit.clone(),
            code_len: self.jit.as_ref().map(|image| image.code_len()),
            refusal: self.jit_refusal.clone(),
        }
    }

    pub fn dump_jit_info(&self) -> String {
        self.jit_snapshot().dump_text()
    }
}

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::debug;

use crate::assembler::ResolvedFlow;
use crate::externals::ExternalRegistry;
use crate::heap::{BumpHeap, DEFAULT_CHUNK_SIZE, HeapOffset};
use crate::structs::{LayoutAlignment, StructTable};
use crate::symbols::{NamespaceId, Symbol, SymbolTable};
use crate::vm::{Operand, RuntimeFault, Value, ValueType, VmResult};

mod lower;
mod parser;

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    Parse(ParseError),
    DuplicateSymbol { name: String, line: u32 },
    UnknownSymbol { name: String, line: u32 },
    UnresolvedLabel { label: String, line: u32 },
    DuplicateLabel { label: String, line: u32 },
    UnknownExternalFunction { name: String, line: u32 },
    TypeMismatch { message: String, line: u32 },
    DuplicateStruct { name: String, line: u32 },
}

impl CompileError {
    pub fn line(&self) -> u32 {
        match self {
            CompileError::Parse(err) => err.line,
            CompileError::DuplicateSymbol { line, .. }
            | CompileError::UnknownSymbol { line, .. }
            | CompileError::UnresolvedLabel { line, .. }
            | CompileError::DuplicateLabel { line, .. }
            | CompileError::UnknownExternalFunction { line, .. }
            | CompileError::TypeMismatch { line, .. }
            | CompileError::DuplicateStruct { line, .. } => *line,
        }
    }

    /// Attaches a source line to an error raised without one.
    pub fn at(mut self, at: u32) -> Self {
        match &mut self {
            CompileError::Parse(_) => {}
            CompileError::DuplicateSymbol { line, .. }
            | CompileError::UnknownSymbol { line, .. }
            | CompileError::UnresolvedLabel { line, .. }
            | CompileError::DuplicateLabel { line, .. }
            | CompileError::UnknownExternalFunction { line, .. }
            | CompileError::TypeMismatch { line, .. }
            | CompileError::DuplicateStruct { line, .. } => {
                if *line == 0 {
                    *line = at;
                }
            }
        }
        self
    }

    pub(crate) fn type_mismatch(message: impl Into<String>, line: u32) -> Self {
        CompileError::TypeMismatch {
            message: message.into(),
            line,
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Parse(err) => write!(f, "{err}"),
            CompileError::DuplicateSymbol { name, line } => {
                write!(f, "line {line}: '{name}' is already declared in this scope")
            }
            CompileError::UnknownSymbol { name, line } => {
                write!(f, "line {line}: unknown symbol '{name}'")
            }
            CompileError::UnresolvedLabel { label, line } => {
                write!(f, "line {line}: jump to undefined label '{label}'")
            }
            CompileError::DuplicateLabel { label, line } => {
                write!(f, "line {line}: label '{label}' is defined twice")
            }
            CompileError::UnknownExternalFunction { name, line } => {
                write!(f, "line {line}: no external function bound as '{name}'")
            }
            CompileError::TypeMismatch { message, line } => {
                write!(f, "line {line}: type mismatch: {message}")
            }
            CompileError::DuplicateStruct { name, line } => {
                write!(f, "line {line}: struct '{name}' is already defined")
            }
        }
    }
}

impl std::error::Error for CompileError {}

impl From<ParseError> for CompileError {
    fn from(err: ParseError) -> Self {
        CompileError::Parse(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeName {
    Int,
    Float,
    Ptr,
    Struct(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i32),
    Float(f32),
    Var(String),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Call(String, Vec<Arg>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Expr),
    Ref(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    Compare(CompareOp, Expr, Expr),
    Not(Box<Test>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: TypeName,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<Param>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub ret: Option<TypeName>,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternDecl {
    pub name: String,
    pub ret: Option<TypeName>,
    pub params: Vec<Param>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Struct(StructDecl),
    Extern(ExternDecl),
    Function(FunctionDecl),
    VarDecl {
        ty: TypeName,
        names: Vec<String>,
        init: Option<Expr>,
        line: u32,
    },
    Assign {
        target: String,
        op: AssignOp,
        value: Expr,
        line: u32,
    },
    If {
        test: Test,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
        line: u32,
    },
    While {
        test: Test,
        body: Box<Stmt>,
        line: u32,
    },
    Foreach {
        var: String,
        items: Vec<String>,
        body: Box<Stmt>,
        line: u32,
    },
    Block(Vec<Stmt>),
    Call {
        name: String,
        args: Vec<Arg>,
        line: u32,
    },
    Return {
        value: Option<Expr>,
        line: u32,
    },
}

pub fn parse_source(source: &str) -> Result<Vec<Stmt>, ParseError> {
    parser::Parser::new(source)?.parse_program()
}

/// Link between a script and one registered native function.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalBinding {
    pub name: String,
    pub native: usize,
    pub locals: NamespaceId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub label: String,
    pub namespace: NamespaceId,
    pub params: Vec<String>,
    pub ret: Option<ValueType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions {
    pub heap_chunk_size: usize,
    pub layout: LayoutAlignment,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            heap_chunk_size: DEFAULT_CHUNK_SIZE,
            layout: LayoutAlignment::default(),
        }
    }
}

/// Everything one compile produces. Variable storage lives in `heap`; the
/// flow refers to it by offset.
#[derive(Debug)]
pub struct CompiledProgram {
    flow: ResolvedFlow,
    heap: BumpHeap,
    symbols: SymbolTable,
    structs: StructTable,
    externals: Vec<ExternalBinding>,
    functions: Vec<FunctionInfo>,
    temps: usize,
}

impl CompiledProgram {
    pub fn flow(&self) -> &ResolvedFlow {
        &self.flow
    }

    pub fn heap(&self) -> &BumpHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut BumpHeap {
        &mut self.heap
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn structs(&self) -> &StructTable {
        &self.structs
    }

    pub fn externals(&self) -> &[ExternalBinding] {
        &self.externals
    }

    pub fn functions(&self) -> &[FunctionInfo] {
        &self.functions
    }

    pub fn temp_count(&self) -> usize {
        self.temps
    }

    /// The code and layouts alongside writable variable storage.
    pub(crate) fn split_for_execution(&mut self) -> (&ResolvedFlow, &StructTable, &mut BumpHeap) {
        (&self.flow, &self.structs, &mut self.heap)
    }

    pub fn read_symbol(&self, symbol: &Symbol) -> VmResult<Value> {
        let at = symbol.storage;
        let invalid = || RuntimeFault::InvalidHeapHandle(at);
        Ok(match symbol.ty {
            ValueType::Int => Value::Int(self.heap.read_i32(at).ok_or_else(invalid)?),
            ValueType::Float => Value::Float(self.heap.read_f32(at).ok_or_else(invalid)?),
            ValueType::Ptr => Value::Pointer(self.heap.read_i32(at).ok_or_else(invalid)?),
            ValueType::Struct(id) => {
                let size = self.structs.get(id).map_or(0, |layout| layout.size_bytes);
                if !self.heap.contains(at, size) {
                    return Err(invalid());
                }
                Value::Struct(id)
            }
        })
    }

    pub fn write_symbol(&mut self, symbol: &Symbol, value: Value) -> VmResult<()> {
        let at = symbol.storage;
        let written = match (symbol.ty, value) {
            (ValueType::Int, Value::Int(v)) | (ValueType::Ptr, Value::Pointer(v)) => {
                self.heap.write_i32(at, v)
            }
            (ValueType::Float, Value::Float(v)) => self.heap.write_f32(at, v),
            _ => {
                return Err(RuntimeFault::GlobalTypeMismatch {
                    name: symbol.name.clone(),
                    expected: symbol.ty,
                });
            }
        };
        written.ok_or(RuntimeFault::InvalidHeapHandle(at))
    }

    /// Human readable listing of the resolved flow.
    pub fn disassemble(&self) -> String {
        let mut names: HashMap<(HeapOffset, ValueType), &str> = HashMap::new();
        for namespace in self.symbols.namespaces() {
            for symbol in namespace.iter() {
                names
                    .entry((symbol.storage, symbol.ty))
                    .or_insert(symbol.name.as_str());
            }
        }
        let operand = |op: &Operand, index: usize| -> String {
            match op {
                Operand::None => String::new(),
                Operand::IntConst(v) => v.to_string(),
                Operand::FloatConst(v) => format!("{v:?}"),
                Operand::PtrConst(v) => format!("ptr({v})"),
                Operand::Label(name) => format!("|{name}|"),
                Operand::Offset(offset) => {
                    format!("{offset:+} (-> {})", index as i64 + *offset as i64)
                }
                Operand::External(slot) => self
                    .externals
                    .get(*slot)
                    .map_or_else(|| format!("extern#{slot}"), |binding| binding.name.clone()),
                var => match (var.storage(), var.value_type()) {
                    (Some(at), Some(ty)) => names
                        .get(&(at, ty))
                        .map_or_else(|| at.to_string(), |name| (*name).to_string()),
                    _ => "?".to_string(),
                },
            }
        };

        let mut out = String::new();
        for (index, instr) in self.flow.instructions().iter().enumerate() {
            let dest = operand(&instr.dest, index);
            let src = operand(&instr.src, index);
            let args = if src.is_empty() {
                dest
            } else {
                format!("{dest}, {src}")
            };
            let _ = writeln!(
                out,
                "{index:>5}  line {:<4} {:<10} {args}",
                instr.line,
                instr.typed_mnemonic()
            );
        }
        out
    }
}

pub struct Compiler<'a> {
    options: CompileOptions,
    externals: &'a ExternalRegistry,
}

impl<'a> Compiler<'a> {
    pub fn new(options: CompileOptions, externals: &'a ExternalRegistry) -> Self {
        Self { options, externals }
    }

    pub fn compile(&self, source: &str) -> Result<CompiledProgram, CompileError> {
        let stmts = parse_source(source)?;
        let lowered = lower::lower_program(&stmts, &self.options, self.externals)?;
        let flow = lowered.flow.resolve()?;
        debug!(
            instructions = flow.len(),
            temps = lowered.temps,
            structs = lowered.structs.len(),
            functions = lowered.functions.len(),
            "compiled script"
        );
        Ok(CompiledProgram {
            flow,
            heap: lowered.heap,
            symbols: lowered.symbols,
            structs: lowered.structs,
            externals: lowered.externals,
            functions: lowered.functions,
            temps: lowered.temps,
        })
    }
}

/// Compiles a script that uses no native functions.
pub fn compile_source(source: &str) -> Result<CompiledProgram, CompileError> {
    let externals = ExternalRegistry::new();
    Compiler::new(CompileOptions::default(), &externals).compile(source)
}


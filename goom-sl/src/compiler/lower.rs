use std::collections::HashMap;

use super::{
    Arg, AssignOp, BinaryOp, CompareOp, CompileError, CompileOptions, Expr, ExternDecl,
    ExternalBinding, FunctionDecl, FunctionInfo, Param, Stmt, StructDecl, Test, TypeName,
};
use crate::assembler::InstructionFlow;
use crate::externals::ExternalRegistry;
use crate::heap::BumpHeap;
use crate::structs::StructTable;
use crate::symbols::{NamespaceId, Symbol, SymbolTable};
use crate::vm::{Instruction, OpCode, Operand, ValueType};

/// Output of lowering, before label resolution.
pub(super) struct Lowered {
    pub(super) flow: InstructionFlow,
    pub(super) heap: BumpHeap,
    pub(super) symbols: SymbolTable,
    pub(super) structs: StructTable,
    pub(super) externals: Vec<ExternalBinding>,
    pub(super) functions: Vec<FunctionInfo>,
    pub(super) temps: usize,
}

/// An expression result. `temp` marks compiler temporaries, which may be
/// overwritten in place by the next operator.
#[derive(Clone, Debug)]
struct Slot {
    operand: Operand,
    temp: bool,
}

impl Slot {
    fn value(operand: Operand) -> Self {
        Self {
            operand,
            temp: false,
        }
    }

    fn ty(&self) -> Option<ValueType> {
        self.operand.value_type()
    }
}

#[derive(Clone, Copy)]
enum Callee {
    Script(usize),
    Native(usize),
}

struct CompileContext<'a> {
    flow: InstructionFlow,
    heap: BumpHeap,
    symbols: SymbolTable,
    structs: StructTable,
    externals: Vec<ExternalBinding>,
    extern_ret: Vec<Option<ValueType>>,
    functions: Vec<FunctionInfo>,
    callees: HashMap<String, Callee>,
    registry: &'a ExternalRegistry,
    current_function: Option<usize>,
    temps: usize,
    next_label: usize,
}

pub(super) fn lower_program(
    stmts: &[Stmt],
    options: &CompileOptions,
    registry: &ExternalRegistry,
) -> Result<Lowered, CompileError> {
    let mut ctx = CompileContext {
        flow: InstructionFlow::new(),
        heap: BumpHeap::new(options.heap_chunk_size),
        symbols: SymbolTable::new(),
        structs: StructTable::new(options.layout),
        externals: Vec::new(),
        extern_ret: Vec::new(),
        functions: Vec::new(),
        callees: HashMap::new(),
        registry,
        current_function: None,
        temps: 0,
        next_label: 0,
    };

    for stmt in stmts {
        match stmt {
            Stmt::Struct(decl) => ctx.declare_struct(decl)?,
            Stmt::Function(decl) => ctx.declare_function(decl)?,
            Stmt::Extern(decl) => ctx.declare_extern(decl)?,
            _ => {}
        }
    }

    let mut last_line = 1;
    for stmt in stmts {
        if !matches!(
            stmt,
            Stmt::Struct(_) | Stmt::Function(_) | Stmt::Extern(_)
        ) {
            ctx.lower_stmt(stmt)?;
        }
        last_line = stmt_line(stmt).unwrap_or(last_line);
    }
    ctx.emit(OpCode::Ret, Operand::None, Operand::None, last_line);

    let mut index = 0;
    for stmt in stmts {
        if let Stmt::Function(decl) = stmt {
            ctx.lower_function(index, decl)?;
            index += 1;
        }
    }

    Ok(Lowered {
        flow: ctx.flow,
        heap: ctx.heap,
        symbols: ctx.symbols,
        structs: ctx.structs,
        externals: ctx.externals,
        functions: ctx.functions,
        temps: ctx.temps,
    })
}

fn stmt_line(stmt: &Stmt) -> Option<u32> {
    match stmt {
        Stmt::Struct(decl) => Some(decl.line),
        Stmt::Extern(decl) => Some(decl.line),
        Stmt::Function(decl) => Some(decl.line),
        Stmt::VarDecl { line, .. }
        | Stmt::Assign { line, .. }
        | Stmt::If { line, .. }
        | Stmt::While { line, .. }
        | Stmt::Foreach { line, .. }
        | Stmt::Call { line, .. }
        | Stmt::Return { line, .. } => Some(*line),
        Stmt::Block(body) => body.last().and_then(stmt_line),
    }
}

impl CompileContext<'_> {
    fn emit(&mut self, opcode: OpCode, dest: Operand, src: Operand, line: u32) {
        self.flow.emit(Instruction::new(opcode, dest, src, line));
    }

    fn fresh_label(&mut self, prefix: &str) -> String {
        let id = self.next_label;
        self.next_label += 1;
        format!("{prefix}_{id}")
    }

    fn resolve_type(&self, ty: &TypeName, line: u32) -> Result<ValueType, CompileError> {
        Ok(match ty {
            TypeName::Int => ValueType::Int,
            TypeName::Float => ValueType::Float,
            TypeName::Ptr => ValueType::Ptr,
            TypeName::Struct(name) => {
                ValueType::Struct(self.structs.id(name).ok_or_else(|| {
                    CompileError::UnknownSymbol {
                        name: name.clone(),
                        line,
                    }
                })?)
            }
        })
    }

    fn declare(
        &mut self,
        ns: NamespaceId,
        name: &str,
        ty: ValueType,
        line: u32,
    ) -> Result<Symbol, CompileError> {
        self.symbols
            .declare(ns, name, ty, &mut self.heap, &self.structs)
            .map_err(|err| err.at(line))
    }

    fn declare_params(
        &mut self,
        ns: NamespaceId,
        params: &[Param],
        line: u32,
    ) -> Result<Vec<String>, CompileError> {
        let mut names = Vec::with_capacity(params.len());
        for param in params {
            let ty = self.resolve_type(&param.ty, line)?;
            self.declare(ns, &param.name, ty, line)?;
            names.push(param.name.clone());
        }
        Ok(names)
    }

    fn declare_struct(&mut self, decl: &StructDecl) -> Result<(), CompileError> {
        let mut fields = Vec::with_capacity(decl.fields.len());
        for field in &decl.fields {
            fields.push((field.name.clone(), self.resolve_type(&field.ty, decl.line)?));
        }
        self.structs
            .declare(&decl.name, &fields)
            .map_err(|err| err.at(decl.line))?;
        Ok(())
    }

    fn declare_function(&mut self, decl: &FunctionDecl) -> Result<(), CompileError> {
        if self.callees.contains_key(&decl.name) {
            return Err(CompileError::DuplicateSymbol {
                name: decl.name.clone(),
                line: decl.line,
            });
        }
        let namespace = self.symbols.function_namespace(&decl.name);
        let params = self.declare_params(namespace, &decl.params, decl.line)?;
        let ret = match &decl.ret {
            Some(ty) => {
                let ty = self.resolve_type(ty, decl.line)?;
                self.declare(SymbolTable::GLOBAL, &decl.name, ty, decl.line)?;
                Some(ty)
            }
            None => None,
        };
        self.callees
            .insert(decl.name.clone(), Callee::Script(self.functions.len()));
        self.functions.push(FunctionInfo {
            name: decl.name.clone(),
            label: format!("func_{}", decl.name),
            namespace,
            params,
            ret,
        });
        Ok(())
    }

    fn declare_extern(&mut self, decl: &ExternDecl) -> Result<(), CompileError> {
        if self.callees.contains_key(&decl.name) {
            return Err(CompileError::DuplicateSymbol {
                name: decl.name.clone(),
                line: decl.line,
            });
        }
        let native = self.registry.lookup(&decl.name).ok_or_else(|| {
            CompileError::UnknownExternalFunction {
                name: decl.name.clone(),
                line: decl.line,
            }
        })?;
        let locals = self.symbols.create_namespace();
        self.declare_params(locals, &decl.params, decl.line)?;
        let ret = match &decl.ret {
            Some(ty) => {
                let ty = self.resolve_type(ty, decl.line)?;
                self.declare(SymbolTable::GLOBAL, &decl.name, ty, decl.line)?;
                Some(ty)
            }
            None => None,
        };
        self.link_external(&decl.name, native, locals, ret);
        Ok(())
    }

    fn link_external(
        &mut self,
        name: &str,
        native: usize,
        locals: NamespaceId,
        ret: Option<ValueType>,
    ) -> usize {
        let index = self.externals.len();
        self.externals.push(ExternalBinding {
            name: name.to_string(),
            native,
            locals,
        });
        self.extern_ret.push(ret);
        self.callees.insert(name.to_string(), Callee::Native(index));
        index
    }

    fn lower_function(&mut self, index: usize, decl: &FunctionDecl) -> Result<(), CompileError> {
        let (label, namespace) = {
            let info = &self.functions[index];
            (info.label.clone(), info.namespace)
        };
        self.flow.label(&label, decl.line)?;
        self.symbols.enter_namespace(namespace);
        self.current_function = Some(index);
        let mut last_line = decl.line;
        for stmt in &decl.body {
            self.lower_stmt(stmt)?;
            last_line = stmt_line(stmt).unwrap_or(last_line);
        }
        self.emit(OpCode::Ret, Operand::None, Operand::None, last_line);
        self.current_function = None;
        self.symbols.leave_namespace();
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Struct(decl) => Err(CompileError::type_mismatch(
                format!("struct '{}' must be declared at top level", decl.name),
                decl.line,
            )),
            Stmt::Extern(decl) => Err(CompileError::type_mismatch(
                format!("extern '{}' must be declared at top level", decl.name),
                decl.line,
            )),
            Stmt::Function(decl) => Err(CompileError::type_mismatch(
                format!("function '{}' must be declared at top level", decl.name),
                decl.line,
            )),
            Stmt::VarDecl {
                ty,
                names,
                init,
                line,
            } => {
                let ty = self.resolve_type(ty, *line)?;
                let ns = self.symbols.current();
                for name in names {
                    self.declare(ns, name, ty, *line)?;
                }
                if let Some(init) = init {
                    let [name] = names.as_slice() else {
                        return Err(CompileError::type_mismatch(
                            "an initializer needs a single variable",
                            *line,
                        ));
                    };
                    self.lower_assign(name, AssignOp::Set, init, *line)?;
                }
                Ok(())
            }
            Stmt::Assign {
                target,
                op,
                value,
                line,
            } => self.lower_assign(target, *op, value, *line),
            Stmt::If {
                test,
                then,
                otherwise,
                line,
            } => {
                self.lower_test(test, *line)?;
                match otherwise {
                    None => {
                        let end = self.fresh_label("if_end");
                        self.emit(OpCode::JumpZero, Operand::Label(end.clone()), Operand::None, *line);
                        self.lower_stmt(then)?;
                        self.flow.label(&end, *line)
                    }
                    Some(otherwise) => {
                        let other = self.fresh_label("if_else");
                        let end = self.fresh_label("if_end");
                        self.emit(OpCode::JumpZero, Operand::Label(other.clone()), Operand::None, *line);
                        self.lower_stmt(then)?;
                        self.emit(OpCode::Jump, Operand::Label(end.clone()), Operand::None, *line);
                        self.flow.label(&other, *line)?;
                        self.lower_stmt(otherwise)?;
                        self.flow.label(&end, *line)
                    }
                }
            }
            Stmt::While { test, body, line } => {
                let start = self.fresh_label("while_start");
                let check = self.fresh_label("while_test");
                self.emit(OpCode::Jump, Operand::Label(check.clone()), Operand::None, *line);
                self.flow.label(&start, *line)?;
                self.lower_stmt(body)?;
                self.flow.label(&check, *line)?;
                self.lower_test(test, *line)?;
                self.emit(OpCode::JumpNotZero, Operand::Label(start), Operand::None, *line);
                Ok(())
            }
            Stmt::Foreach {
                var,
                items,
                body,
                line,
            } => self.lower_foreach(var, items, body, *line),
            Stmt::Block(body) => {
                for stmt in body {
                    self.lower_stmt(stmt)?;
                }
                Ok(())
            }
            Stmt::Call { name, args, line } => {
                self.lower_call(name, args, *line)?;
                Ok(())
            }
            Stmt::Return { value, line } => self.lower_return(value.as_ref(), *line),
        }
    }

    fn resolve(&self, path: &str, line: u32) -> Result<Symbol, CompileError> {
        self.symbols
            .resolve(path)
            .cloned()
            .map_err(|err| err.at(line))
    }

    fn var_operand(&self, path: &str, line: u32) -> Result<Operand, CompileError> {
        let symbol = self.resolve(path, line)?;
        Ok(Operand::for_storage(symbol.ty, symbol.storage))
    }

    fn lower_assign(
        &mut self,
        target: &str,
        op: AssignOp,
        value: &Expr,
        line: u32,
    ) -> Result<(), CompileError> {
        let dest = self.var_operand(target, line)?;
        let src = self.lower_expr(value, line)?;
        let src = coerce_to(&dest, src, line)?;
        let opcode = match op {
            AssignOp::Set => OpCode::Set,
            AssignOp::Add => OpCode::Add,
            AssignOp::Sub => OpCode::Sub,
            AssignOp::Mul => OpCode::Mul,
            AssignOp::Div => OpCode::Div,
        };
        self.emit(opcode, dest, src.operand, line);
        Ok(())
    }

    fn lower_return(&mut self, value: Option<&Expr>, line: u32) -> Result<(), CompileError> {
        let Some(value) = value else {
            self.emit(OpCode::Ret, Operand::None, Operand::None, line);
            return Ok(());
        };
        let Some(index) = self.current_function else {
            return Err(CompileError::type_mismatch(
                "return with a value outside of a function",
                line,
            ));
        };
        let name = self.functions[index].name.clone();
        if self.functions[index].ret.is_none() {
            return Err(CompileError::type_mismatch(
                format!("void function '{name}' cannot return a value"),
                line,
            ));
        }
        let global = self
            .symbols
            .lookup_in(SymbolTable::GLOBAL, &name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownSymbol {
                name: name.clone(),
                line,
            })?;
        let dest = Operand::for_storage(global.ty, global.storage);
        let src = self.lower_expr(value, line)?;
        let src = coerce_to(&dest, src, line)?;
        self.emit(OpCode::Set, dest, src.operand, line);
        self.emit(OpCode::Ret, Operand::None, Operand::None, line);
        Ok(())
    }

    fn lower_foreach(
        &mut self,
        var: &str,
        items: &[String],
        body: &Stmt,
        line: u32,
    ) -> Result<(), CompileError> {
        let var = self.var_operand(var, line)?;
        let mut slots = Vec::with_capacity(items.len());
        for item in items {
            let item = self.var_operand(item, line)?;
            if item.value_type() != var.value_type() {
                return Err(CompileError::type_mismatch(
                    "foreach items must have the loop variable's type",
                    line,
                ));
            }
            slots.push(item);
        }

        let func = self.fresh_label("foreach_body");
        let next = self.fresh_label("foreach_next");
        self.emit(OpCode::Jump, Operand::Label(next.clone()), Operand::None, line);
        self.flow.label(&func, line)?;
        self.lower_stmt(body)?;
        self.emit(OpCode::Ret, Operand::None, Operand::None, line);
        self.flow.label(&next, line)?;
        for item in slots {
            self.emit(OpCode::Set, var.clone(), item.clone(), line);
            self.emit(OpCode::Call, Operand::Label(func.clone()), Operand::None, line);
            self.emit(OpCode::Set, item, var.clone(), line);
        }
        Ok(())
    }

    fn lower_test(&mut self, test: &Test, line: u32) -> Result<(), CompileError> {
        let (op, lhs, rhs) = match test {
            Test::Not(inner) => {
                self.lower_test(inner, line)?;
                self.emit(OpCode::Not, Operand::None, Operand::None, line);
                return Ok(());
            }
            Test::Compare(op, lhs, rhs) => (op, lhs, rhs),
        };
        let lhs = self.lower_expr(lhs, line)?;
        let rhs = self.lower_expr(rhs, line)?;
        let (lhs, rhs) = unify(lhs, rhs, line)?;
        if matches!(lhs.ty(), Some(ValueType::Struct(_))) {
            return Err(CompileError::type_mismatch("structs cannot be compared", line));
        }
        let (opcode, swap, negate) = match op {
            CompareOp::Lt => (OpCode::IsLower, false, false),
            CompareOp::Gt => (OpCode::IsLower, true, false),
            CompareOp::Le => (OpCode::IsLower, true, true),
            CompareOp::Ge => (OpCode::IsLower, false, true),
            CompareOp::Eq => (OpCode::IsEqual, false, false),
            CompareOp::Ne => (OpCode::IsEqual, false, true),
        };
        let (dest, src) = if swap { (rhs, lhs) } else { (lhs, rhs) };
        self.emit(opcode, dest.operand, src.operand, line);
        if negate {
            self.emit(OpCode::Not, Operand::None, Operand::None, line);
        }
        Ok(())
    }

    fn lower_expr(&mut self, expr: &Expr, line: u32) -> Result<Slot, CompileError> {
        match expr {
            Expr::Int(value) => Ok(Slot::value(Operand::IntConst(*value))),
            Expr::Float(value) => Ok(Slot::value(Operand::FloatConst(*value))),
            Expr::Var(path) => Ok(Slot::value(self.var_operand(path, line)?)),
            Expr::Binary(op, lhs, rhs) => {
                // Right operand first; comparisons stay left to right.
                let rhs = self.lower_expr(rhs, line)?;
                let lhs = self.lower_expr(lhs, line)?;
                let opcode = match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                };
                self.lower_binary(opcode, lhs, rhs, line)
            }
            Expr::Neg(inner) => {
                let inner = self.lower_expr(inner, line)?;
                let zero = match inner.ty() {
                    Some(ValueType::Int) => Operand::IntConst(0),
                    Some(ValueType::Float) => Operand::FloatConst(0.0),
                    Some(ValueType::Ptr) => Operand::PtrConst(0),
                    _ => {
                        return Err(CompileError::type_mismatch(
                            "only scalars can be negated",
                            line,
                        ));
                    }
                };
                self.lower_binary(OpCode::Sub, Slot::value(zero), inner, line)
            }
            Expr::Call(name, args) => {
                let ret = self.lower_call(name, args, line)?.ok_or_else(|| {
                    CompileError::type_mismatch(
                        format!("'{name}' returns nothing and cannot be used as a value"),
                        line,
                    )
                })?;
                let tmp = self.new_temp(ret.ty(), line)?;
                self.emit(OpCode::Set, tmp.operand.clone(), ret.operand, line);
                Ok(tmp)
            }
        }
    }

    /// Emits `dest op= src` reusing a temporary operand when possible.
    fn lower_binary(
        &mut self,
        opcode: OpCode,
        lhs: Slot,
        rhs: Slot,
        line: u32,
    ) -> Result<Slot, CompileError> {
        let (lhs, rhs) = unify(lhs, rhs, line)?;
        if lhs.temp {
            self.emit(opcode, lhs.operand.clone(), rhs.operand, line);
            return Ok(lhs);
        }
        if opcode.is_commutative() && rhs.temp {
            self.emit(opcode, rhs.operand.clone(), lhs.operand, line);
            return Ok(rhs);
        }
        let tmp = self.new_temp(lhs.ty(), line)?;
        self.emit(OpCode::Set, tmp.operand.clone(), lhs.operand, line);
        self.emit(opcode, tmp.operand.clone(), rhs.operand, line);
        Ok(tmp)
    }

    fn new_temp(&mut self, ty: Option<ValueType>, line: u32) -> Result<Slot, CompileError> {
        let ty = ty.ok_or_else(|| CompileError::type_mismatch("operand has no value", line))?;
        let name = format!("_{}_tmp_{}", ty.suffix(), self.temps);
        self.temps += 1;
        let symbol = self.declare(SymbolTable::GLOBAL, &name, ty, line)?;
        Ok(Slot {
            operand: Operand::for_storage(ty, symbol.storage),
            temp: true,
        })
    }

    /// Lowers a call and returns the callee's result global, if any.
    fn lower_call(
        &mut self,
        name: &str,
        args: &[Arg],
        line: u32,
    ) -> Result<Option<Slot>, CompileError> {
        let callee = match self.callees.get(name) {
            Some(callee) => *callee,
            None => {
                let native = self.registry.lookup(name).ok_or_else(|| {
                    CompileError::UnknownExternalFunction {
                        name: name.to_string(),
                        line,
                    }
                })?;
                let locals = self.symbols.create_namespace();
                Callee::Native(self.link_external(name, native, locals, None))
            }
        };
        let (namespace, param_names, ret) = match callee {
            Callee::Script(index) => {
                let info = &self.functions[index];
                (info.namespace, info.params.clone(), info.ret)
            }
            Callee::Native(index) => {
                let locals = self.externals[index].locals;
                let names = self
                    .symbols
                    .namespace(locals)
                    .map(|ns| {
                        ns.iter()
                            .filter(|symbol| !symbol.name.contains('.'))
                            .map(|symbol| symbol.name.clone())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                (locals, names, self.extern_ret[index])
            }
        };
        if args.len() != param_names.len() {
            return Err(CompileError::type_mismatch(
                format!(
                    "'{name}' takes {} argument(s) but {} were given",
                    param_names.len(),
                    args.len()
                ),
                line,
            ));
        }

        let mut params = Vec::with_capacity(param_names.len());
        for param in &param_names {
            let symbol = self
                .symbols
                .lookup_in(namespace, param)
                .ok_or_else(|| CompileError::UnknownSymbol {
                    name: format!("{name}.{param}"),
                    line,
                })?;
            params.push(Operand::for_storage(symbol.ty, symbol.storage));
        }

        let mut values = Vec::with_capacity(args.len());
        let mut copy_back = Vec::new();
        for (arg, param) in args.iter().zip(&params) {
            let slot = match arg {
                Arg::Value(expr) => self.lower_expr(expr, line)?,
                Arg::Ref(path) => {
                    let operand = self.var_operand(path, line)?;
                    copy_back.push((operand.clone(), param.clone()));
                    Slot::value(operand)
                }
            };
            values.push(coerce_to(param, slot, line)?);
        }
        for (param, value) in params.iter().zip(values) {
            self.emit(OpCode::Set, param.clone(), value.operand, line);
        }

        match callee {
            Callee::Script(index) => {
                let label = self.functions[index].label.clone();
                self.emit(OpCode::Call, Operand::Label(label), Operand::None, line);
            }
            Callee::Native(index) => {
                self.emit(OpCode::ExtCall, Operand::External(index), Operand::None, line);
            }
        }
        for (var, param) in copy_back {
            self.emit(OpCode::Set, var, param, line);
        }

        let Some(ty) = ret else {
            return Ok(None);
        };
        let global = self
            .symbols
            .lookup_in(SymbolTable::GLOBAL, name)
            .ok_or_else(|| CompileError::UnknownSymbol {
                name: name.to_string(),
                line,
            })?;
        Ok(Some(Slot::value(Operand::for_storage(ty, global.storage))))
    }
}

/// Converts integer constants to the other side's float or pointer type,
/// then requires both sides to agree.
fn unify(lhs: Slot, rhs: Slot, line: u32) -> Result<(Slot, Slot), CompileError> {
    let lhs = match (lhs.ty(), rhs.ty()) {
        (Some(ValueType::Int), Some(ValueType::Float | ValueType::Ptr)) => {
            convert_const(lhs, rhs.ty())
        }
        _ => lhs,
    };
    let rhs = match (rhs.ty(), lhs.ty()) {
        (Some(ValueType::Int), Some(ValueType::Float | ValueType::Ptr)) => {
            convert_const(rhs, lhs.ty())
        }
        _ => rhs,
    };
    match (lhs.ty(), rhs.ty()) {
        (Some(a), Some(b)) if a == b => Ok((lhs, rhs)),
        (a, b) => Err(CompileError::type_mismatch(
            format!("{} and {} do not mix", describe(a), describe(b)),
            line,
        )),
    }
}

fn coerce_to(dest: &Operand, src: Slot, line: u32) -> Result<Slot, CompileError> {
    let src = convert_const(src, dest.value_type());
    if src.ty() == dest.value_type() && src.ty().is_some() {
        Ok(src)
    } else {
        Err(CompileError::type_mismatch(
            format!(
                "cannot assign {} to {}",
                describe(src.ty()),
                describe(dest.value_type())
            ),
            line,
        ))
    }
}

fn convert_const(slot: Slot, target: Option<ValueType>) -> Slot {
    match (&slot.operand, target) {
        (Operand::IntConst(value), Some(ValueType::Float)) => {
            Slot::value(Operand::FloatConst(*value as f32))
        }
        (Operand::IntConst(value), Some(ValueType::Ptr)) => Slot::value(Operand::PtrConst(*value)),
        _ => slot,
    }
}

fn describe(ty: Option<ValueType>) -> String {
    ty.map_or_else(|| "nothing".to_string(), |ty| ty.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parse_source;

    fn lower(source: &str) -> Lowered {
        lower_with(source, &ExternalRegistry::new())
    }

    fn lower_with(source: &str, registry: &ExternalRegistry) -> Lowered {
        let stmts = parse_source(source).expect("parse should succeed");
        lower_program(&stmts, &CompileOptions::default(), registry)
            .expect("lowering should succeed")
    }

    fn lower_err(source: &str) -> CompileError {
        let stmts = parse_source(source).expect("parse should succeed");
        match lower_program(&stmts, &CompileOptions::default(), &ExternalRegistry::new()) {
            Ok(_) => panic!("lowering should fail"),
            Err(err) => err,
        }
    }

    fn mnemonics(lowered: &Lowered) -> Vec<String> {
        lowered
            .flow
            .instructions()
            .iter()
            .map(|instr| instr.typed_mnemonic())
            .collect()
    }

    fn storage(lowered: &Lowered, name: &str) -> Operand {
        let symbol = lowered.symbols.globals().get(name).expect("global exists");
        Operand::for_storage(symbol.ty, symbol.storage)
    }

    #[test]
    fn plain_binary_allocates_one_temp() {
        let lowered = lower("int a, b, c; a = b + c;");
        assert_eq!(mnemonics(&lowered), ["set.i", "add.i", "set.i", "ret"]);
        assert_eq!(lowered.temps, 1);
        let code = lowered.flow.instructions();
        assert_eq!(code[0].dest, storage(&lowered, "_i_tmp_0"));
        assert_eq!(code[0].src, storage(&lowered, "b"));
        assert_eq!(code[2].dest, storage(&lowered, "a"));
    }

    #[test]
    fn left_temp_is_reused_in_place() {
        let lowered = lower("int a, b, c, d; a = b + c - d;");
        assert_eq!(mnemonics(&lowered), ["set.i", "add.i", "sub.i", "set.i", "ret"]);
        assert_eq!(lowered.temps, 1);
        let code = lowered.flow.instructions();
        assert_eq!(code[2].dest, storage(&lowered, "_i_tmp_0"));
        assert_eq!(code[2].src, storage(&lowered, "d"));
    }

    #[test]
    fn commutative_operator_swaps_onto_right_temp() {
        let lowered = lower("int a, b, c; a = b * (c + 1);");
        assert_eq!(mnemonics(&lowered), ["set.i", "add.i", "mul.i", "set.i", "ret"]);
        assert_eq!(lowered.temps, 1);
        let code = lowered.flow.instructions();
        assert_eq!(code[2].dest, storage(&lowered, "_i_tmp_0"));
        assert_eq!(code[2].src, storage(&lowered, "b"));
    }

    #[test]
    fn non_commutative_operator_needs_a_new_temp() {
        let lowered = lower("int a, b, c; a = b - (c + 1);");
        assert_eq!(
            mnemonics(&lowered),
            ["set.i", "add.i", "set.i", "sub.i", "set.i", "ret"]
        );
        assert_eq!(lowered.temps, 2);
        let code = lowered.flow.instructions();
        assert_eq!(code[3].dest, storage(&lowered, "_i_tmp_1"));
        assert_eq!(code[3].src, storage(&lowered, "_i_tmp_0"));
    }

    #[test]
    fn int_constants_follow_float_operands() {
        let lowered = lower("float f; f = f * 2; f += 1;");
        let code = lowered.flow.instructions();
        assert_eq!(code[1].src, Operand::FloatConst(2.0));
        assert_eq!(code[3].opcode, OpCode::Add);
        assert_eq!(code[3].src, Operand::FloatConst(1.0));
        assert_eq!(mnemonics(&lowered), ["set.f", "mul.f", "set.f", "add.f", "ret"]);
    }

    #[test]
    fn negation_is_zero_minus_value() {
        let lowered = lower("float f; f = -f;");
        let code = lowered.flow.instructions();
        assert_eq!(code[0].src, Operand::FloatConst(0.0));
        assert_eq!(code[1].opcode, OpCode::Sub);
        assert_eq!(code[1].src, storage(&lowered, "f"));
    }

    #[test]
    fn derived_comparisons() {
        let cases = [
            ("a < b", vec!["islower.i"], false),
            ("a > b", vec!["islower.i"], true),
            ("a <= b", vec!["islower.i", "not"], true),
            ("a >= b", vec!["islower.i", "not"], false),
            ("a == b", vec!["isequal.i"], false),
            ("a != b", vec!["isequal.i", "not"], false),
            ("!(a < b)", vec!["islower.i", "not"], false),
        ];
        for (test, expected, swapped) in cases {
            let lowered = lower(&format!("int a, b; if ({test}) a = 1;"));
            let names = mnemonics(&lowered);
            assert_eq!(&names[..expected.len()], expected.as_slice(), "{test}");
            assert_eq!(names[expected.len()], "jzero", "{test}");
            let first = &lowered.flow.instructions()[0];
            let lhs = if swapped { "b" } else { "a" };
            assert_eq!(first.dest, storage(&lowered, lhs), "{test}");
        }
    }

    #[test]
    fn while_loop_shape() {
        let lowered = lower("int i; while (i < 5) i += 1;");
        assert_eq!(
            mnemonics(&lowered),
            ["jump", "label", "add.i", "label", "islower.i", "jnzero", "ret"]
        );
    }

    #[test]
    fn if_else_shape() {
        let lowered = lower("int i; if (i == 0) i = 1; else i = 2;");
        assert_eq!(
            mnemonics(&lowered),
            ["isequal.i", "jzero", "set.i", "jump", "label", "set.i", "label", "ret"]
        );
    }

    #[test]
    fn foreach_calls_body_once_per_item() {
        let lowered = lower("int x, a, b; foreach x in (a b) x += 1;");
        assert_eq!(
            mnemonics(&lowered),
            [
                "jump", "label", "add.i", "ret", "label", "set.i", "call", "set.i", "set.i",
                "call", "set.i", "ret"
            ]
        );
    }

    #[test]
    fn foreach_item_type_must_match() {
        let err = lower_err("int x; float f; foreach x in (f) x += 1;");
        assert!(matches!(err, CompileError::TypeMismatch { line: 1, .. }), "{err}");
    }

    #[test]
    fn functions_follow_main_and_return_through_their_global() {
        let lowered = lower("int r; r = twice(4); int twice(int v) { return v * 2; }");
        assert_eq!(
            mnemonics(&lowered),
            [
                "set.i", "call", "set.i", "set.i", "ret", "label", "set.i", "mul.i", "set.i",
                "ret", "ret"
            ]
        );
        assert_eq!(lowered.functions.len(), 1);
        assert_eq!(lowered.functions[0].label, "func_twice");
        assert_eq!(
            lowered.flow.instructions()[2].src,
            storage(&lowered, "twice")
        );
    }

    #[test]
    fn reference_arguments_are_copied_back() {
        let lowered = lower("int n; void bump(int v) { v += 1; } bump(&n);");
        let code = lowered.flow.instructions();
        assert_eq!(mnemonics(&lowered)[..3], ["set.i", "call", "set.i"]);
        assert_eq!(code[2].dest, storage(&lowered, "n"));
        assert_eq!(code[0].src, storage(&lowered, "n"));
    }

    #[test]
    fn binary_operands_lower_right_to_left() {
        let lowered = lower(
            "int r; int first() { return 1; } int second() { return 2; } r = first() - second();",
        );
        let code = lowered.flow.instructions();
        let calls: Vec<&Operand> = code
            .iter()
            .filter(|instr| instr.opcode == OpCode::Call)
            .map(|instr| &instr.dest)
            .collect();
        assert_eq!(calls.len(), 2);
        let second = lowered
            .functions
            .iter()
            .find(|info| info.name == "second")
            .expect("second declared");
        assert_eq!(calls[0], &Operand::Label(second.label.clone()));
    }

    #[test]
    fn arguments_are_lowered_before_parameters_are_written() {
        let lowered = lower("int r; int add(int a, int b) { return a + b; } r = add(add(1, 2), 3);");
        let names = mnemonics(&lowered);
        assert_eq!(
            names[..8],
            ["set.i", "set.i", "call", "set.i", "set.i", "set.i", "call", "set.i"]
        );
    }

    #[test]
    fn argument_count_is_checked() {
        let err = lower_err("void f(int a) { } f(1, 2);");
        assert!(matches!(err, CompileError::TypeMismatch { .. }), "{err}");
    }

    #[test]
    fn void_call_cannot_be_a_value() {
        let err = lower_err("int r; void f() { } r = f();");
        assert!(matches!(err, CompileError::TypeMismatch { .. }), "{err}");
    }

    #[test]
    fn unbound_external_is_reported() {
        let err = lower_err("missing(1);");
        assert!(matches!(
            err,
            CompileError::UnknownExternalFunction { ref name, line: 1 } if name == "missing"
        ));
        let err = lower_err("extern void missing(int x);");
        assert!(matches!(err, CompileError::UnknownExternalFunction { .. }));
    }

    #[test]
    fn bound_external_links_without_declaration() {
        let mut registry = ExternalRegistry::new();
        registry.bind("tick", |_| Ok(()));
        let lowered = lower_with("tick();", &registry);
        assert_eq!(mnemonics(&lowered), ["extcall", "ret"]);
        assert_eq!(lowered.externals.len(), 1);
        assert_eq!(lowered.externals[0].name, "tick");
        assert_eq!(lowered.flow.instructions()[0].dest, Operand::External(0));
    }

    #[test]
    fn struct_compare_is_rejected() {
        let err = lower_err("struct P { int x; } P a, b; if (a == b) a = b;");
        assert!(matches!(err, CompileError::TypeMismatch { .. }), "{err}");
    }

    #[test]
    fn struct_arithmetic_uses_struct_temps() {
        let lowered = lower("struct P { int x; float y; } P a, b; a = a + b;");
        assert_eq!(mnemonics(&lowered), ["set.s", "add.s", "set.s", "ret"]);
        assert!(lowered.symbols.globals().contains("_s_tmp_0.y"));
    }

    #[test]
    fn unknown_variable_carries_line() {
        let err = lower_err("int a;\na = nope;");
        assert!(matches!(
            err,
            CompileError::UnknownSymbol { ref name, line: 2 } if name == "nope"
        ));
    }

    #[test]
    fn function_locals_live_in_the_function_namespace() {
        let lowered = lower("void f() { int local; local = 1; }");
        assert!(!lowered.symbols.globals().contains("local"));
        let ns = lowered.functions[0].namespace;
        assert!(lowered.symbols.lookup_in(ns, "local").is_some());
    }

    #[test]
    fn return_value_at_top_level_is_rejected() {
        let err = lower_err("return 1;");
        assert!(matches!(err, CompileError::TypeMismatch { .. }));
    }
}

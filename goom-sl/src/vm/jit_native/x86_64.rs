use super::super::{Instruction, OpCode, Operand, RuntimeFault, VmResult};
use super::{
    JitContext, STATUS_DIVISION_BY_ZERO, STATUS_ERROR, STATUS_RETURNED, STATUS_STACK_OVERFLOW,
};
use crate::assembler::ResolvedFlow;
use crate::compiler::CompiledProgram;
use crate::heap::{BumpHeap, HeapOffset};
use crate::jit::{JitConfig, JitNyiReason};
use crate::structs::{SCALAR_BYTES, StructTable};

pub(super) struct BackendExecutableMemory {
    pub(super) ptr: *mut u8,
    len: usize,
}

impl BackendExecutableMemory {
    pub(super) fn from_code(code: &[u8]) -> VmResult<Self> {
        let len = code.len();
        if len == 0 {
            return Err(RuntimeFault::JitNative(
                "cannot create executable region for empty code".to_string(),
            ));
        }
        let ptr = alloc_executable_region(len)?;
        let region = Self { ptr, len };
        write_machine_code(region.ptr, code);
        finalize_executable_region(region.ptr, len)?;
        Ok(region)
    }
}

impl Drop for BackendExecutableMemory {
    fn drop(&mut self) {
        let _ = free_executable_region(self.ptr, self.len);
    }
}

/// Jump and call destinations, patched once every offset is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Label {
    Instruction(usize),
    Body,
    Exit,
    StackOverflow,
    DivisionByZero,
}

struct Patch {
    label: Label,
    disp: usize,
    index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum IntSource {
    Imm(i32),
    Addr(u64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum FloatSource {
    Imm(f32),
    Addr(u64),
}

struct NativeEmitter<'a> {
    code: Vec<u8>,
    patches: Vec<Patch>,
    flow: &'a ResolvedFlow,
    structs: &'a StructTable,
    heap: &'a mut BumpHeap,
    config: &'a JitConfig,
    max_call_depth: usize,
}

/// Emits the entry stub, the fault stubs and one block per instruction.
///
/// Register roles: rbx holds the context pointer, r12d the compare flag,
/// r13 the script call depth, r14 the stack pointer at entry and r15 the
/// stack pointer around bridge calls.
pub(super) fn emit_program(
    program: &mut CompiledProgram,
    config: &JitConfig,
    max_call_depth: usize,
) -> Result<Vec<u8>, JitNyiReason> {
    let (flow, structs, heap) = program.split_for_execution();
    let mut emitter = NativeEmitter {
        code: Vec::new(),
        patches: Vec::new(),
        flow,
        structs,
        heap,
        config,
        max_call_depth,
    };

    emit_native_prologue(&mut emitter.code);
    emitter.code.push(0xE8); // call body
    emitter.record(Label::Body, 0);
    emitter.code.extend_from_slice(&[0x31, 0xC0]); // xor eax, eax

    let exit = emitter.code.len();
    emit_native_epilogue(&mut emitter.code);
    let overflow = emitter.emit_fault_stub(STATUS_STACK_OVERFLOW);
    let division = emitter.emit_fault_stub(STATUS_DIVISION_BY_ZERO);

    let body = emitter.code.len();
    let mut offsets = Vec::with_capacity(flow.len() + 1);
    for (index, instr) in flow.instructions().iter().enumerate() {
        offsets.push(emitter.code.len());
        emitter.emit_instruction(index, instr)?;
    }
    offsets.push(emitter.code.len());
    emitter.code.push(0xC3); // ret: running off the end returns

    let NativeEmitter {
        mut code, patches, ..
    } = emitter;
    for patch in patches {
        let target = match patch.label {
            Label::Instruction(target) => *offsets
                .get(target)
                .ok_or(JitNyiReason::InvalidJumpTarget { index: patch.index })?,
            Label::Body => body,
            Label::Exit => exit,
            Label::StackOverflow => overflow,
            Label::DivisionByZero => division,
        };
        patch_rel32(&mut code, patch.disp, target)
            .map_err(|_| JitNyiReason::InvalidJumpTarget { index: patch.index })?;
    }
    Ok(code)
}

impl NativeEmitter<'_> {
    /// Leaves a 4-byte hole for a rel32 to `label`.
    fn record(&mut self, label: Label, index: usize) {
        self.patches.push(Patch {
            label,
            disp: self.code.len(),
            index,
        });
        self.code.extend_from_slice(&[0, 0, 0, 0]);
    }

    fn emit_fault_stub(&mut self, status: i32) -> usize {
        let at = self.code.len();
        self.code.push(0xB8); // mov eax, imm32
        self.code.extend_from_slice(&status.to_le_bytes());
        self.code.push(0xE9); // jmp exit
        self.record(Label::Exit, 0);
        at
    }

    fn emit_instruction(&mut self, index: usize, instr: &Instruction) -> Result<(), JitNyiReason> {
        match instr.opcode {
            OpCode::Label => Ok(()),
            OpCode::Jump => {
                let target = self.target(index)?;
                self.code.push(0xE9); // jmp rel32
                self.record(Label::Instruction(target), index);
                Ok(())
            }
            OpCode::JumpZero | OpCode::JumpNotZero => {
                let target = self.target(index)?;
                self.code.extend_from_slice(&[0x45, 0x85, 0xE4]); // test r12d, r12d
                let jcc = if instr.opcode == OpCode::JumpZero {
                    0x84
                } else {
                    0x85
                };
                self.code.extend_from_slice(&[0x0F, jcc]);
                self.record(Label::Instruction(target), index);
                Ok(())
            }
            OpCode::Call => {
                let target = self.target(index)?;
                let depth = u32::try_from(self.max_call_depth).map_err(|_| {
                    JitNyiReason::CallDepthTooLarge {
                        depth: self.max_call_depth,
                        limit: super::MAX_NATIVE_CALL_DEPTH,
                    }
                })?;
                self.code.extend_from_slice(&[0x49, 0x81, 0xFD]); // cmp r13, imm32
                self.code.extend_from_slice(&depth.to_le_bytes());
                self.code.extend_from_slice(&[0x0F, 0x83]); // jae overflow
                self.record(Label::StackOverflow, index);
                self.code.extend_from_slice(&[0x49, 0xFF, 0xC5]); // inc r13
                self.code.push(0xE8); // call rel32
                self.record(Label::Instruction(target), index);
                self.code.extend_from_slice(&[0x49, 0xFF, 0xCD]); // dec r13
                Ok(())
            }
            OpCode::Ret => {
                self.code.push(0xC3);
                Ok(())
            }
            OpCode::ExtCall => {
                let Operand::External(link) = instr.dest else {
                    return Err(unsupported(index, instr));
                };
                let link = u32::try_from(link).map_err(|_| unsupported(index, instr))?;
                self.emit_extcall(index, link);
                Ok(())
            }
            OpCode::Not => {
                self.code.extend_from_slice(&[0x41, 0x83, 0xF4, 0x01]); // xor r12d, 1
                Ok(())
            }
            OpCode::IsLower | OpCode::IsEqual => self.emit_compare(index, instr),
            OpCode::Set | OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div => {
                self.emit_arithmetic(index, instr)
            }
        }
    }

    fn target(&self, index: usize) -> Result<usize, JitNyiReason> {
        self.flow
            .target_of(index)
            .filter(|target| *target <= self.flow.len())
            .ok_or(JitNyiReason::InvalidJumpTarget { index })
    }

    /// Absolute address of a 4-byte slot.
    fn address(&mut self, at: HeapOffset) -> Option<u64> {
        if !self.heap.contains(at, SCALAR_BYTES) {
            return None;
        }
        self.heap.address_of(at).map(|ptr| ptr as usize as u64)
    }

    fn int_source(&mut self, operand: &Operand) -> Option<IntSource> {
        match operand {
            Operand::IntConst(value) | Operand::PtrConst(value) => Some(IntSource::Imm(*value)),
            Operand::IntVar(at) | Operand::PtrVar(at) => self.address(*at).map(IntSource::Addr),
            _ => None,
        }
    }

    fn float_source(&mut self, operand: &Operand) -> Option<FloatSource> {
        match operand {
            Operand::FloatConst(value) => Some(FloatSource::Imm(*value)),
            Operand::FloatVar(at) => self.address(*at).map(FloatSource::Addr),
            _ => None,
        }
    }

    fn emit_compare(&mut self, index: usize, instr: &Instruction) -> Result<(), JitNyiReason> {
        let lower = instr.opcode == OpCode::IsLower;
        if let (Some(dest), Some(src)) = (self.int_source(&instr.dest), self.int_source(&instr.src))
        {
            emit_int_compare(&mut self.code, lower, dest, src);
            return Ok(());
        }
        if let (Some(dest), Some(src)) =
            (self.float_source(&instr.dest), self.float_source(&instr.src))
        {
            emit_float_compare(&mut self.code, lower, dest, src);
            return Ok(());
        }
        Err(unsupported(index, instr))
    }

    fn emit_arithmetic(&mut self, index: usize, instr: &Instruction) -> Result<(), JitNyiReason> {
        match &instr.dest {
            Operand::IntVar(at) | Operand::PtrVar(at) => {
                let dest = self.address(*at).ok_or_else(|| unsupported(index, instr))?;
                let src = self
                    .int_source(&instr.src)
                    .ok_or_else(|| unsupported(index, instr))?;
                self.emit_int_op(index, instr.opcode, dest, src);
                Ok(())
            }
            Operand::FloatVar(at) => {
                let dest = self.address(*at).ok_or_else(|| unsupported(index, instr))?;
                let src = self
                    .float_source(&instr.src)
                    .ok_or_else(|| unsupported(index, instr))?;
                emit_float_op(&mut self.code, instr.opcode, dest, src);
                Ok(())
            }
            Operand::StructVar { at, id } => {
                let Operand::StructVar {
                    at: src,
                    id: src_id,
                } = &instr.src
                else {
                    return Err(unsupported(index, instr));
                };
                if src_id != id {
                    return Err(unsupported(index, instr));
                }
                let structs = self.structs;
                let layout = structs
                    .get(*id)
                    .ok_or_else(|| unsupported(index, instr))?;
                let limit = self.config.max_struct_unroll;

                if instr.opcode == OpCode::Set {
                    if layout.size_bytes % SCALAR_BYTES != 0 {
                        return Err(unsupported(index, instr));
                    }
                    let words = layout.size_bytes / SCALAR_BYTES;
                    if words > limit {
                        return Err(JitNyiReason::StructTooLarge {
                            index,
                            elements: words,
                            limit,
                        });
                    }
                    for word in 0..words {
                        let offset = word * SCALAR_BYTES;
                        let (d, s) = self
                            .address_pair(at.add(offset), src.add(offset))
                            .ok_or_else(|| unsupported(index, instr))?;
                        self.emit_int_op(index, OpCode::Set, d, IntSource::Addr(s));
                    }
                    return Ok(());
                }

                let elements = layout.block_elements();
                if elements > limit {
                    return Err(JitNyiReason::StructTooLarge {
                        index,
                        elements,
                        limit,
                    });
                }
                let int_offsets = element_offsets(&layout.int_blocks);
                let float_offsets = element_offsets(&layout.float_blocks);
                for offset in int_offsets {
                    let (d, s) = self
                        .address_pair(at.add(offset), src.add(offset))
                        .ok_or_else(|| unsupported(index, instr))?;
                    self.emit_int_op(index, instr.opcode, d, IntSource::Addr(s));
                }
                for offset in float_offsets {
                    let (d, s) = self
                        .address_pair(at.add(offset), src.add(offset))
                        .ok_or_else(|| unsupported(index, instr))?;
                    emit_float_op(&mut self.code, instr.opcode, d, FloatSource::Addr(s));
                }
                Ok(())
            }
            _ => Err(unsupported(index, instr)),
        }
    }

    fn address_pair(&mut self, dest: HeapOffset, src: HeapOffset) -> Option<(u64, u64)> {
        Some((self.address(dest)?, self.address(src)?))
    }

    fn emit_int_op(&mut self, index: usize, opcode: OpCode, dest: u64, src: IntSource) {
        emit_load_ecx(&mut self.code, src);
        self.code.extend_from_slice(&[0x49, 0xB8]); // mov r8, imm64
        self.code.extend_from_slice(&dest.to_le_bytes());
        match opcode {
            OpCode::Set => self.code.extend_from_slice(&[0x41, 0x89, 0x08]), // mov [r8], ecx
            OpCode::Add => self.code.extend_from_slice(&[0x41, 0x01, 0x08]), // add [r8], ecx
            OpCode::Sub => self.code.extend_from_slice(&[0x41, 0x29, 0x08]), // sub [r8], ecx
            OpCode::Mul => {
                self.code.extend_from_slice(&[0x41, 0x8B, 0x00]); // mov eax, [r8]
                self.code.extend_from_slice(&[0x0F, 0xAF, 0xC1]); // imul eax, ecx
                self.code.extend_from_slice(&[0x41, 0x89, 0x00]); // mov [r8], eax
            }
            _ => {
                self.code.extend_from_slice(&[0x85, 0xC9]); // test ecx, ecx
                self.code.extend_from_slice(&[0x0F, 0x84]); // jz division fault
                self.record(Label::DivisionByZero, index);
                self.code.extend_from_slice(&[0x41, 0x8B, 0x00]); // mov eax, [r8]
                // x / -1 is a wrapping negation; idiv would trap on i32::MIN.
                self.code.extend_from_slice(&[0x83, 0xF9, 0xFF]); // cmp ecx, -1
                self.code.extend_from_slice(&[0x75, 0x04]); // jne idiv
                self.code.extend_from_slice(&[0xF7, 0xD8]); // neg eax
                self.code.extend_from_slice(&[0xEB, 0x03]); // jmp store
                self.code.push(0x99); // cdq
                self.code.extend_from_slice(&[0xF7, 0xF9]); // idiv ecx
                self.code.extend_from_slice(&[0x41, 0x89, 0x00]); // mov [r8], eax
            }
        }
    }

    fn emit_extcall(&mut self, index: usize, link: u32) {
        let bridge = jit_extcall_bridge as extern "C" fn(*mut JitContext, u32) -> i32;
        self.code.extend_from_slice(&[0x49, 0x89, 0xE7]); // mov r15, rsp
        self.code.extend_from_slice(&[0x48, 0x83, 0xE4, 0xF0]); // and rsp, -16
        #[cfg(target_os = "windows")]
        {
            self.code.extend_from_slice(&[0x48, 0x83, 0xEC, 0x20]); // sub rsp, 32
            self.code.extend_from_slice(&[0x48, 0x89, 0xD9]); // mov rcx, rbx
            self.code.push(0xBA); // mov edx, imm32
        }
        #[cfg(not(target_os = "windows"))]
        {
            self.code.extend_from_slice(&[0x48, 0x89, 0xDF]); // mov rdi, rbx
            self.code.push(0xBE); // mov esi, imm32
        }
        self.code.extend_from_slice(&link.to_le_bytes());
        self.code.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64
        self.code
            .extend_from_slice(&(bridge as usize as u64).to_le_bytes());
        self.code.extend_from_slice(&[0xFF, 0xD0]); // call rax
        self.code.extend_from_slice(&[0x4C, 0x89, 0xFC]); // mov rsp, r15
        self.code.extend_from_slice(&[0x85, 0xC0]); // test eax, eax
        self.code.extend_from_slice(&[0x0F, 0x85]); // jne exit
        self.record(Label::Exit, index);
    }
}

fn unsupported(index: usize, instr: &Instruction) -> JitNyiReason {
    JitNyiReason::UnsupportedOpcode {
        index,
        mnemonic: instr.typed_mnemonic(),
    }
}

fn element_offsets(blocks: &[crate::structs::StructBlock]) -> Vec<usize> {
    blocks
        .iter()
        .flat_map(|block| (0..block.count).map(move |element| block.offset + element * SCALAR_BYTES))
        .collect()
}

/// Frame: rbp chains to the caller's frame, callee-saved registers below it.
fn emit_native_prologue(code: &mut Vec<u8>) {
    code.push(0x55); // push rbp
    code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
    code.push(0x53); // push rbx
    code.extend_from_slice(&[0x41, 0x54]); // push r12
    code.extend_from_slice(&[0x41, 0x55]); // push r13
    code.extend_from_slice(&[0x41, 0x56]); // push r14
    code.extend_from_slice(&[0x41, 0x57]); // push r15
    #[cfg(target_os = "windows")]
    {
        code.push(0x56); // push rsi
        code.push(0x57); // push rdi
        code.extend_from_slice(&[0x48, 0x89, 0xCB]); // mov rbx, rcx
    }
    #[cfg(not(target_os = "windows"))]
    {
        code.extend_from_slice(&[0x48, 0x89, 0xFB]); // mov rbx, rdi
    }
    code.extend_from_slice(&[0x45, 0x31, 0xE4]); // xor r12d, r12d
    code.extend_from_slice(&[0x45, 0x31, 0xED]); // xor r13d, r13d
    code.extend_from_slice(&[0x49, 0x89, 0xE6]); // mov r14, rsp
}

fn emit_native_epilogue(code: &mut Vec<u8>) {
    code.extend_from_slice(&[0x4C, 0x89, 0xF4]); // mov rsp, r14
    #[cfg(target_os = "windows")]
    {
        code.push(0x5F); // pop rdi
        code.push(0x5E); // pop rsi
    }
    code.extend_from_slice(&[0x41, 0x5F]); // pop r15
    code.extend_from_slice(&[0x41, 0x5E]); // pop r14
    code.extend_from_slice(&[0x41, 0x5D]); // pop r13
    code.extend_from_slice(&[0x41, 0x5C]); // pop r12
    code.push(0x5B); // pop rbx
    code.push(0x5D); // pop rbp
    code.push(0xC3); // ret
}

fn emit_load_ecx(code: &mut Vec<u8>, src: IntSource) {
    match src {
        IntSource::Imm(value) => {
            code.push(0xB9); // mov ecx, imm32
            code.extend_from_slice(&value.to_le_bytes());
        }
        IntSource::Addr(addr) => {
            code.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64
            code.extend_from_slice(&addr.to_le_bytes());
            code.extend_from_slice(&[0x8B, 0x08]); // mov ecx, [rax]
        }
    }
}

fn emit_load_eax(code: &mut Vec<u8>, src: IntSource) {
    match src {
        IntSource::Imm(value) => {
            code.push(0xB8); // mov eax, imm32
            code.extend_from_slice(&value.to_le_bytes());
        }
        IntSource::Addr(addr) => {
            code.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64
            code.extend_from_slice(&addr.to_le_bytes());
            code.extend_from_slice(&[0x8B, 0x00]); // mov eax, [rax]
        }
    }
}

/// Loads into xmm1 (`second`) or xmm0.
fn emit_load_xmm(code: &mut Vec<u8>, src: FloatSource, second: bool) {
    match src {
        FloatSource::Imm(value) => {
            code.push(0xB8); // mov eax, imm32
            code.extend_from_slice(&value.to_bits().to_le_bytes());
            let modrm = if second { 0xC8 } else { 0xC0 };
            code.extend_from_slice(&[0x66, 0x0F, 0x6E, modrm]); // movd xmmN, eax
        }
        FloatSource::Addr(addr) => {
            code.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64
            code.extend_from_slice(&addr.to_le_bytes());
            let modrm = if second { 0x08 } else { 0x00 };
            code.extend_from_slice(&[0xF3, 0x0F, 0x10, modrm]); // movss xmmN, [rax]
        }
    }
}

fn emit_int_compare(code: &mut Vec<u8>, lower: bool, dest: IntSource, src: IntSource) {
    emit_load_ecx(code, src);
    emit_load_eax(code, dest);
    code.extend_from_slice(&[0x39, 0xC8]); // cmp eax, ecx
    if lower {
        code.extend_from_slice(&[0x0F, 0x9C, 0xC0]); // setl al
    } else {
        code.extend_from_slice(&[0x0F, 0x94, 0xC0]); // sete al
    }
    code.extend_from_slice(&[0x44, 0x0F, 0xB6, 0xE0]); // movzx r12d, al
}

fn emit_float_compare(code: &mut Vec<u8>, lower: bool, dest: FloatSource, src: FloatSource) {
    emit_load_xmm(code, src, true);
    emit_load_xmm(code, dest, false);
    if lower {
        code.extend_from_slice(&[0x0F, 0x2F, 0xC8]); // comiss xmm1, xmm0
        code.extend_from_slice(&[0x0F, 0x97, 0xC0]); // seta al
    } else {
        code.extend_from_slice(&[0x0F, 0x2F, 0xC1]); // comiss xmm0, xmm1
        code.extend_from_slice(&[0x0F, 0x94, 0xC0]); // sete al
        code.extend_from_slice(&[0x0F, 0x9B, 0xC1]); // setnp cl
        code.extend_from_slice(&[0x20, 0xC8]); // and al, cl
    }
    code.extend_from_slice(&[0x44, 0x0F, 0xB6, 0xE0]); // movzx r12d, al
}

fn emit_float_op(code: &mut Vec<u8>, opcode: OpCode, dest: u64, src: FloatSource) {
    emit_load_xmm(code, src, true);
    code.extend_from_slice(&[0x49, 0xB8]); // mov r8, imm64
    code.extend_from_slice(&dest.to_le_bytes());
    let op = match opcode {
        OpCode::Set => {
            code.extend_from_slice(&[0xF3, 0x41, 0x0F, 0x11, 0x08]); // movss [r8], xmm1
            return;
        }
        OpCode::Add => 0x58,
        OpCode::Sub => 0x5C,
        OpCode::Mul => 0x59,
        _ => 0x5E,
    };
    code.extend_from_slice(&[0xF3, 0x41, 0x0F, 0x10, 0x00]); // movss xmm0, [r8]
    code.extend_from_slice(&[0xF3, 0x0F, op, 0xC1]); // {add,sub,mul,div}ss xmm0, xmm1
    code.extend_from_slice(&[0xF3, 0x41, 0x0F, 0x11, 0x00]); // movss [r8], xmm0
}

fn patch_rel32(code: &mut [u8], disp_offset: usize, target: usize) -> VmResult<()> {
    let rel = (target as i64) - ((disp_offset + 4) as i64);
    let rel = i32::try_from(rel)
        .map_err(|_| RuntimeFault::JitNative("native patch displacement overflow".to_string()))?;
    code[disp_offset..disp_offset + 4].copy_from_slice(&rel.to_le_bytes());
    Ok(())
}

thread_local! {
    static JIT_BRIDGE_ERROR: std::cell::RefCell<Option<RuntimeFault>> = const { std::cell::RefCell::new(None) };
}

pub(super) fn clear_bridge_error() {
    JIT_BRIDGE_ERROR.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

pub(super) fn take_bridge_error() -> Option<RuntimeFault> {
    JIT_BRIDGE_ERROR.with(|slot| slot.borrow_mut().take())
}

fn set_bridge_error(error: RuntimeFault) {
    JIT_BRIDGE_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(error);
    });
}

extern "C" fn jit_extcall_bridge(context: *mut JitContext, link: u32) -> i32 {
    if context.is_null() {
        set_bridge_error(RuntimeFault::JitNative(
            "native extcall helper received null context".to_string(),
        ));
        return STATUS_ERROR;
    }

    let context = unsafe { &mut *context };
    let (program, externals) = unsafe { (&mut *context.program, &mut *context.externals) };
    match externals.invoke(link as usize, program) {
        Ok(()) => STATUS_RETURNED,
        Err(err) => {
            set_bridge_error(err);
            STATUS_ERROR
        }
    }
}

fn write_machine_code(ptr: *mut u8, code: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }
}

#[cfg(target_os = "windows")]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> VmResult<()> {
    use windows_sys::Win32::{
        Foundation::HANDLE,
        System::{
            Diagnostics::Debug::FlushInstructionCache,
            Memory::{PAGE_EXECUTE_READ, VirtualProtect},
            Threading::GetCurrentProcess,
        },
    };

    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_EXECUTE_READ, &mut old_protect) };
    if ok == 0 {
        return Err(RuntimeFault::JitNative(format!(
            "VirtualProtect(PAGE_EXECUTE_READ) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let process: HANDLE = unsafe { GetCurrentProcess() };
    let ok = unsafe { FlushInstructionCache(process, ptr as *const _, len) };
    if ok == 0 {
        return Err(RuntimeFault::JitNative(format!(
            "FlushInstructionCache failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> VmResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(RuntimeFault::JitNative(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn alloc_executable_region(len: usize) -> VmResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(RuntimeFault::JitNative(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(target_os = "windows")]
fn free_executable_region(ptr: *mut u8, _len: usize) -> VmResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(RuntimeFault::JitNative(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn alloc_executable_region(len: usize) -> VmResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(RuntimeFault::JitNative(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "linux")]
fn free_executable_region(ptr: *mut u8, len: usize) -> VmResult<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(RuntimeFault::JitNative(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::externals::ExternalRegistry;
    use crate::vm::Value;

    type NativeEntry = unsafe extern "C" fn(*mut JitContext) -> i32;

    fn run_native(program: &mut CompiledProgram, externals: &mut ExternalRegistry) -> i32 {
        let code = emit_program(program, &JitConfig::default(), 16).expect("emit should succeed");
        let memory = BackendExecutableMemory::from_code(&code).expect("executable memory");
        let mut context = JitContext {
            program: program as *mut CompiledProgram,
            externals: externals as *mut ExternalRegistry,
        };
        clear_bridge_error();
        let entry: NativeEntry = unsafe { std::mem::transmute(memory.ptr) };
        unsafe { entry(&mut context) }
    }

    fn global(program: &CompiledProgram, name: &str) -> Value {
        let symbol = program.symbols().globals().get(name).expect("global exists");
        program.read_symbol(symbol).expect("global is readable")
    }

    fn emitter_for<'a>(
        program: &'a mut CompiledProgram,
        config: &'a JitConfig,
    ) -> NativeEmitter<'a> {
        let (flow, structs, heap) = program.split_for_execution();
        NativeEmitter {
            code: Vec::new(),
            patches: Vec::new(),
            flow,
            structs,
            heap,
            config,
            max_call_depth: 16,
        }
    }

    #[test]
    fn int_add_with_immediate_encoding() {
        let mut program = compile_source("int i;").expect("compile should succeed");
        let config = JitConfig::default();
        let mut emitter = emitter_for(&mut program, &config);
        emitter.emit_int_op(0, OpCode::Add, 0x1122_3344_5566_7788, IntSource::Imm(5));
        let mut expected = vec![0xB9, 5, 0, 0, 0, 0x49, 0xB8];
        expected.extend_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        expected.extend_from_slice(&[0x41, 0x01, 0x08]);
        assert_eq!(emitter.code, expected);
        assert!(emitter.patches.is_empty());
    }

    #[test]
    fn int_div_guards_zero_and_minus_one() {
        let mut program = compile_source("int i;").expect("compile should succeed");
        let config = JitConfig::default();
        let mut emitter = emitter_for(&mut program, &config);
        emitter.emit_int_op(7, OpCode::Div, 0, IntSource::Imm(3));
        let tail = &emitter.code[15..];
        assert_eq!(&tail[..4], &[0x85, 0xC9, 0x0F, 0x84]);
        assert_eq!(
            &tail[8..],
            &[
                0x41, 0x8B, 0x00, 0x83, 0xF9, 0xFF, 0x75, 0x04, 0xF7, 0xD8, 0xEB, 0x03, 0x99,
                0xF7, 0xF9, 0x41, 0x89, 0x00
            ]
        );
        assert_eq!(emitter.patches.len(), 1);
        assert_eq!(emitter.patches[0].label, Label::DivisionByZero);
        assert_eq!(emitter.patches[0].index, 7);
    }

    #[test]
    fn float_compare_handles_unordered() {
        let mut code = Vec::new();
        emit_float_compare(&mut code, false, FloatSource::Imm(1.0), FloatSource::Imm(2.0));
        let bits = 2.0f32.to_bits().to_le_bytes();
        assert_eq!(&code[..5], &[0xB8, bits[0], bits[1], bits[2], bits[3]]);
        assert!(code.windows(3).any(|w| w == [0x0F, 0x9B, 0xC1]));
        assert!(code.ends_with(&[0x20, 0xC8, 0x44, 0x0F, 0xB6, 0xE0]));
    }

    #[test]
    fn prologue_and_epilogue_balance() {
        let mut prologue = Vec::new();
        emit_native_prologue(&mut prologue);
        let mut epilogue = Vec::new();
        emit_native_epilogue(&mut epilogue);
        assert!(prologue.ends_with(&[0x49, 0x89, 0xE6]));
        assert_eq!(&epilogue[..3], &[0x4C, 0x89, 0xF4]);
        assert!(epilogue.ends_with(&[0x5B, 0x5D, 0xC3]));
    }

    #[test]
    fn prologue_sets_up_a_frame_pointer() {
        let mut prologue = Vec::new();
        emit_native_prologue(&mut prologue);
        // push rbp; mov rbp, rsp; push rbx
        assert_eq!(&prologue[..5], &[0x55, 0x48, 0x89, 0xE5, 0x53]);
    }

    #[test]
    fn patch_rel32_is_relative_to_next_instruction() {
        let mut code = vec![0xE9, 0, 0, 0, 0, 0x90, 0x90];
        patch_rel32(&mut code, 1, 7).expect("patch should succeed");
        assert_eq!(&code[1..5], &2i32.to_le_bytes());
        patch_rel32(&mut code, 1, 0).expect("patch should succeed");
        assert_eq!(&code[1..5], &(-5i32).to_le_bytes());
    }

    #[test]
    fn oversized_struct_is_refused() {
        let mut program = compile_source(
            "struct V { float a, b, c, d, e; } V x, y; x = x + y;",
        )
        .expect("compile should succeed");
        let config = JitConfig {
            enabled: true,
            max_struct_unroll: 4,
        };
        let err = emit_program(&mut program, &config, 16).expect_err("emit should refuse");
        assert!(matches!(
            err,
            JitNyiReason::StructTooLarge {
                elements: 5,
                limit: 4,
                ..
            }
        ));
    }

    #[test]
    fn native_loop_and_calls_run() {
        let mut program = compile_source(
            "int i, total; float f;\n\
             void step() { total += i; f = f + 0.5; }\n\
             while (i < 5) { step(); i += 1; }",
        )
        .expect("compile should succeed");
        let mut externals = ExternalRegistry::new();
        assert_eq!(run_native(&mut program, &mut externals), STATUS_RETURNED);
        assert_eq!(global(&program, "i"), Value::Int(5));
        assert_eq!(global(&program, "total"), Value::Int(10));
        assert_eq!(global(&program, "f"), Value::Float(2.5));
    }

    #[test]
    fn native_division_by_zero_reports_status() {
        let mut program = compile_source("int a, z; a = 1; a = a / z;").expect("compile");
        let mut externals = ExternalRegistry::new();
        assert_eq!(
            run_native(&mut program, &mut externals),
            STATUS_DIVISION_BY_ZERO
        );
    }

    #[test]
    fn native_recursion_reports_overflow() {
        let mut program = compile_source("void f() { f(); } f();").expect("compile");
        let mut externals = ExternalRegistry::new();
        assert_eq!(
            run_native(&mut program, &mut externals),
            STATUS_STACK_OVERFLOW
        );
    }

    #[test]
    fn native_extcall_propagates_host_errors() {
        let mut externals = ExternalRegistry::new();
        externals.bind("boom", |_| Err(RuntimeFault::Host("boom".to_string())));
        let mut program = crate::compiler::Compiler::new(Default::default(), &externals)
            .compile("boom();")
            .expect("compile should succeed");
        assert_eq!(run_native(&mut program, &mut externals), STATUS_ERROR);
        assert_eq!(
            take_bridge_error(),
            Some(RuntimeFault::Host("boom".to_string()))
        );
    }
}

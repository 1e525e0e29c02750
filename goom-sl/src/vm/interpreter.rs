use crate::assembler::ResolvedFlow;
use crate::compiler::CompiledProgram;
use crate::externals::ExternalRegistry;
use crate::heap::{BumpHeap, HeapOffset};
use crate::structs::{SCALAR_BYTES, StructId, StructTable, StructType};

use super::{Instruction, OpCode, Operand, RuntimeFault, VmResult};

enum Control {
    Next,
    Jump(usize),
    Call(usize),
    Ret,
    External(usize),
}

/// Executes the flow from index 0 until the outermost `ret`.
pub(super) fn run(
    program: &mut CompiledProgram,
    externals: &mut ExternalRegistry,
    max_call_depth: usize,
) -> VmResult<()> {
    let mut ip = 0usize;
    let mut flag = false;
    let mut returns: Vec<usize> = Vec::new();

    loop {
        let control = {
            let (flow, structs, heap) = program.split_for_execution();
            if ip >= flow.len() {
                Control::Ret
            } else {
                step(flow, structs, heap, ip, &mut flag)?
            }
        };
        match control {
            Control::Next => ip += 1,
            Control::Jump(target) => ip = target,
            Control::Call(target) => {
                if returns.len() >= max_call_depth {
                    return Err(RuntimeFault::StackOverflow {
                        depth: max_call_depth,
                    });
                }
                returns.push(ip + 1);
                ip = target;
            }
            Control::Ret => match returns.pop() {
                Some(back) => ip = back,
                None => return Ok(()),
            },
            Control::External(link) => {
                externals.invoke(link, program)?;
                ip += 1;
            }
        }
    }
}

fn step(
    flow: &ResolvedFlow,
    structs: &StructTable,
    heap: &mut BumpHeap,
    ip: usize,
    flag: &mut bool,
) -> VmResult<Control> {
    let malformed = RuntimeFault::MalformedInstruction { index: ip };
    let instr = flow.get(ip).ok_or_else(|| malformed.clone())?;
    let target = || {
        flow.target_of(ip)
            .filter(|target| *target <= flow.len())
            .ok_or_else(|| malformed.clone())
    };

    match instr.opcode {
        OpCode::Label => Ok(Control::Next),
        OpCode::Jump => Ok(Control::Jump(target()?)),
        OpCode::JumpZero => Ok(if *flag {
            Control::Next
        } else {
            Control::Jump(target()?)
        }),
        OpCode::JumpNotZero => Ok(if *flag {
            Control::Jump(target()?)
        } else {
            Control::Next
        }),
        OpCode::Call => Ok(Control::Call(target()?)),
        OpCode::Ret => Ok(Control::Ret),
        OpCode::ExtCall => match instr.dest {
            Operand::External(link) => Ok(Control::External(link)),
            _ => Err(malformed),
        },
        OpCode::Not => {
            *flag = !*flag;
            Ok(Control::Next)
        }
        OpCode::IsLower | OpCode::IsEqual => {
            *flag = compare(instr, heap, ip)?;
            Ok(Control::Next)
        }
        OpCode::Set | OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div => {
            arithmetic(instr, structs, heap, ip)?;
            Ok(Control::Next)
        }
    }
}

fn read_int(heap: &BumpHeap, operand: &Operand, ip: usize) -> VmResult<i32> {
    match operand {
        Operand::IntConst(value) | Operand::PtrConst(value) => Ok(*value),
        Operand::IntVar(at) | Operand::PtrVar(at) => {
            heap.read_i32(*at).ok_or(RuntimeFault::InvalidHeapHandle(*at))
        }
        _ => Err(RuntimeFault::MalformedInstruction { index: ip }),
    }
}

fn read_float(heap: &BumpHeap, operand: &Operand, ip: usize) -> VmResult<f32> {
    match operand {
        Operand::FloatConst(value) => Ok(*value),
        Operand::FloatVar(at) => heap.read_f32(*at).ok_or(RuntimeFault::InvalidHeapHandle(*at)),
        _ => Err(RuntimeFault::MalformedInstruction { index: ip }),
    }
}

fn compare(instr: &Instruction, heap: &BumpHeap, ip: usize) -> VmResult<bool> {
    let lower = instr.opcode == OpCode::IsLower;
    match &instr.dest {
        Operand::IntConst(_) | Operand::IntVar(_) | Operand::PtrConst(_) | Operand::PtrVar(_) => {
            let lhs = read_int(heap, &instr.dest, ip)?;
            let rhs = read_int(heap, &instr.src, ip)?;
            Ok(if lower { lhs < rhs } else { lhs == rhs })
        }
        Operand::FloatConst(_) | Operand::FloatVar(_) => {
            let lhs = read_float(heap, &instr.dest, ip)?;
            let rhs = read_float(heap, &instr.src, ip)?;
            Ok(if lower { lhs < rhs } else { lhs == rhs })
        }
        _ => Err(RuntimeFault::MalformedInstruction { index: ip }),
    }
}

pub(crate) fn int_op(opcode: OpCode, lhs: i32, rhs: i32) -> VmResult<Option<i32>> {
    Ok(Some(match opcode {
        OpCode::Set => rhs,
        OpCode::Add => lhs.wrapping_add(rhs),
        OpCode::Sub => lhs.wrapping_sub(rhs),
        OpCode::Mul => lhs.wrapping_mul(rhs),
        OpCode::Div => {
            if rhs == 0 {
                return Err(RuntimeFault::DivisionByZero);
            }
            lhs.wrapping_div(rhs)
        }
        _ => return Ok(None),
    }))
}

pub(crate) fn float_op(opcode: OpCode, lhs: f32, rhs: f32) -> Option<f32> {
    Some(match opcode {
        OpCode::Set => rhs,
        OpCode::Add => lhs + rhs,
        OpCode::Sub => lhs - rhs,
        OpCode::Mul => lhs * rhs,
        OpCode::Div => lhs / rhs,
        _ => return None,
    })
}

fn arithmetic(
    instr: &Instruction,
    structs: &StructTable,
    heap: &mut BumpHeap,
    ip: usize,
) -> VmResult<()> {
    let malformed = || RuntimeFault::MalformedInstruction { index: ip };
    match &instr.dest {
        Operand::IntVar(at) | Operand::PtrVar(at) => {
            let rhs = read_int(heap, &instr.src, ip)?;
            let lhs = heap.read_i32(*at).ok_or(RuntimeFault::InvalidHeapHandle(*at))?;
            let value = int_op(instr.opcode, lhs, rhs)?.ok_or_else(malformed)?;
            heap.write_i32(*at, value)
                .ok_or(RuntimeFault::InvalidHeapHandle(*at))
        }
        Operand::FloatVar(at) => {
            let rhs = read_float(heap, &instr.src, ip)?;
            let lhs = heap.read_f32(*at).ok_or(RuntimeFault::InvalidHeapHandle(*at))?;
            let value = float_op(instr.opcode, lhs, rhs).ok_or_else(malformed)?;
            heap.write_f32(*at, value)
                .ok_or(RuntimeFault::InvalidHeapHandle(*at))
        }
        Operand::StructVar { at, .. } => {
            let Operand::StructVar { at: src, .. } = &instr.src else {
                return Err(malformed());
            };
            struct_op(instr.opcode, *at, *src, structs, heap, ip)
        }
        _ => Err(malformed()),
    }
}

/// Layout named by the tag stored in front of a struct variable.
fn tagged_layout<'a>(
    heap: &BumpHeap,
    structs: &'a StructTable,
    at: HeapOffset,
) -> VmResult<(StructId, &'a StructType)> {
    let invalid = RuntimeFault::InvalidHeapHandle(at);
    let tag = at
        .prefix()
        .and_then(|prefix| heap.read_i32(prefix))
        .ok_or_else(|| invalid.clone())?;
    let id = StructId::from_tag(tag).ok_or_else(|| invalid.clone())?;
    let layout = structs.get(id).ok_or_else(|| invalid.clone())?;
    if !heap.contains(at, layout.size_bytes) {
        return Err(invalid);
    }
    Ok((id, layout))
}

fn struct_op(
    opcode: OpCode,
    dest: HeapOffset,
    src: HeapOffset,
    structs: &StructTable,
    heap: &mut BumpHeap,
    ip: usize,
) -> VmResult<()> {
    let (dest_id, layout) = tagged_layout(heap, structs, dest)?;
    let (src_id, _) = tagged_layout(heap, structs, src)?;
    if dest_id != src_id {
        return Err(RuntimeFault::InvalidHeapHandle(src));
    }
    if opcode == OpCode::Set {
        return heap
            .copy(dest, src, layout.size_bytes)
            .ok_or(RuntimeFault::InvalidHeapHandle(dest));
    }

    for block in &layout.int_blocks {
        for element in 0..block.count {
            let offset = block.offset + element * SCALAR_BYTES;
            let (d, s) = (dest.add(offset), src.add(offset));
            let lhs = heap.read_i32(d).ok_or(RuntimeFault::InvalidHeapHandle(d))?;
            let rhs = heap.read_i32(s).ok_or(RuntimeFault::InvalidHeapHandle(s))?;
            let value = int_op(opcode, lhs, rhs)?
                .ok_or(RuntimeFault::MalformedInstruction { index: ip })?;
            heap.write_i32(d, value)
                .ok_or(RuntimeFault::InvalidHeapHandle(d))?;
        }
    }
    for block in &layout.float_blocks {
        for element in 0..block.count {
            let offset = block.offset + element * SCALAR_BYTES;
            let (d, s) = (dest.add(offset), src.add(offset));
            let lhs = heap.read_f32(d).ok_or(RuntimeFault::InvalidHeapHandle(d))?;
            let rhs = heap.read_f32(s).ok_or(RuntimeFault::InvalidHeapHandle(s))?;
            let value = float_op(opcode, lhs, rhs)
                .ok_or(RuntimeFault::MalformedInstruction { index: ip })?;
            heap.write_f32(d, value)
                .ok_or(RuntimeFault::InvalidHeapHandle(d))?;
        }
    }
    Ok(())
}

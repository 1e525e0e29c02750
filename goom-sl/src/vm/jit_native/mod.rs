use super::{RuntimeFault, VmResult};
use crate::compiler::CompiledProgram;
use crate::externals::ExternalRegistry;
use crate::heap::HeapOffset;
use crate::jit::{JitConfig, JitNyiReason};

mod x86_64;

pub(super) const STATUS_RETURNED: i32 = 0;
pub(super) const STATUS_STACK_OVERFLOW: i32 = 1;
pub(super) const STATUS_DIVISION_BY_ZERO: i32 = 2;
pub(super) const STATUS_ERROR: i32 = -1;

/// Script calls nest on the machine stack, one return address per frame.
pub(super) const MAX_NATIVE_CALL_DEPTH: usize = 1 << 16;

/// Handed to the entry point in the first argument register and passed on
/// to bridges unchanged.
#[repr(C)]
pub(super) struct JitContext {
    program: *mut CompiledProgram,
    externals: *mut ExternalRegistry,
}

type NativeEntry = unsafe extern "C" fn(*mut JitContext) -> i32;

pub(crate) struct NativeImage {
    memory: x86_64::BackendExecutableMemory,
    code_len: usize,
    max_call_depth: usize,
    chunk_bases: Vec<usize>,
}

pub(crate) fn compile(
    program: &mut CompiledProgram,
    config: &JitConfig,
    max_call_depth: usize,
) -> Result<NativeImage, JitNyiReason> {
    if max_call_depth > MAX_NATIVE_CALL_DEPTH {
        return Err(JitNyiReason::CallDepthTooLarge {
            depth: max_call_depth,
            limit: MAX_NATIVE_CALL_DEPTH,
        });
    }
    let code = x86_64::emit_program(program, config, max_call_depth)?;
    let memory = x86_64::BackendExecutableMemory::from_code(&code)
        .map_err(|err| JitNyiReason::ExecutableMemory(err.to_string()))?;
    Ok(NativeImage {
        memory,
        code_len: code.len(),
        max_call_depth,
        chunk_bases: chunk_bases(program),
    })
}

fn chunk_bases(program: &mut CompiledProgram) -> Vec<usize> {
    let chunks = program.heap().chunk_count();
    (0..chunks)
        .filter_map(|chunk| {
            program
                .heap_mut()
                .address_of(HeapOffset::new(chunk as u32, 0))
                .map(|ptr| ptr as usize)
        })
        .collect()
}

impl NativeImage {
    pub(crate) fn code_len(&self) -> usize {
        self.code_len
    }

    pub(crate) fn run(
        &self,
        program: &mut CompiledProgram,
        externals: &mut ExternalRegistry,
    ) -> VmResult<()> {
        if chunk_bases(program) != self.chunk_bases {
            return Err(RuntimeFault::JitNative(
                "native image was built for a different program".to_string(),
            ));
        }

        let mut context = JitContext {
            program: program as *mut CompiledProgram,
            externals: externals as *mut ExternalRegistry,
        };
        x86_64::clear_bridge_error();
        let entry: NativeEntry = unsafe { std::mem::transmute(self.memory.ptr) };
        let status = unsafe { entry(&mut context) };
        match status {
            STATUS_RETURNED => Ok(()),
            STATUS_STACK_OVERFLOW => Err(RuntimeFault::StackOverflow {
                depth: self.max_call_depth,
            }),
            STATUS_DIVISION_BY_ZERO => Err(RuntimeFault::DivisionByZero),
            _ => Err(x86_64::take_bridge_error().unwrap_or_else(|| {
                RuntimeFault::JitNative(format!("native image exited with status {status}"))
            })),
        }
    }
}

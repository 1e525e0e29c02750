use crate::compiler::CompiledProgram;
use crate::externals::ExternalRegistry;
use crate::vm::VmResult;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitConfig {
    pub enabled: bool,
    /// Struct-wide operations touching more scalars than this are not
    /// unrolled; the whole program then stays on the interpreter.
    pub max_struct_unroll: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: native_jit_supported(),
            max_struct_unroll: 64,
        }
    }
}

pub fn native_jit_supported() -> bool {
    cfg!(target_arch = "x86_64") && (cfg!(target_os = "linux") || cfg!(target_os = "windows"))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JitNyiReason {
    UnsupportedArch,
    Disabled,
    UnsupportedOpcode { index: usize, mnemonic: String },
    StructTooLarge { index: usize, elements: usize, limit: usize },
    InvalidJumpTarget { index: usize },
    CallDepthTooLarge { depth: usize, limit: usize },
    ExecutableMemory(String),
}

impl JitNyiReason {
    pub fn message(&self) -> String {
        match self {
            JitNyiReason::UnsupportedArch => {
                "target architecture is not x86_64-linux/x86_64-windows".to_string()
            }
            JitNyiReason::Disabled => "jit disabled by configuration".to_string(),
            JitNyiReason::UnsupportedOpcode { index, mnemonic } => {
                format!("instruction {index} ({mnemonic}) has no native encoding")
            }
            JitNyiReason::StructTooLarge {
                index,
                elements,
                limit,
            } => {
                format!(
                    "instruction {index} touches {elements} struct elements, unroll limit is {limit}"
                )
            }
            JitNyiReason::InvalidJumpTarget { index } => {
                format!("instruction {index} jumps outside the flow")
            }
            JitNyiReason::CallDepthTooLarge { depth, limit } => {
                format!("max call depth {depth} exceeds the native stack budget of {limit} frames")
            }
            JitNyiReason::ExecutableMemory(message) => {
                format!("executable memory unavailable: {message}")
            }
        }
    }
}

/// Machine code for one compiled program. Heap addresses are baked into the
/// code, so an image is only valid for the program it was built from.
pub struct JitImage {
    #[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")))]
    native: crate::vm::jit_native::NativeImage,
    code_len: usize,
}

impl JitImage {
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    #[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")))]
    pub fn run(
        &self,
        program: &mut CompiledProgram,
        externals: &mut ExternalRegistry,
    ) -> VmResult<()> {
        self.native.run(program, externals)
    }

    #[cfg(not(all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows"))))]
    pub fn run(
        &self,
        _program: &mut CompiledProgram,
        _externals: &mut ExternalRegistry,
    ) -> VmResult<()> {
        Err(crate::vm::RuntimeFault::JitNative(
            JitNyiReason::UnsupportedArch.message(),
        ))
    }
}

/// Translates the whole flow into native code, or explains why not.
pub fn jit_compile(
    program: &mut CompiledProgram,
    config: &JitConfig,
    max_call_depth: usize,
) -> Result<JitImage, JitNyiReason> {
    if !config.enabled {
        return Err(JitNyiReason::Disabled);
    }
    if !native_jit_supported() {
        return Err(JitNyiReason::UnsupportedArch);
    }

    #[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")))]
    {
        let native = crate::vm::jit_native::compile(program, config, max_call_depth)?;
        Ok(JitImage {
            code_len: native.code_len(),
            native,
        })
    }

    #[cfg(not(all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows"))))]
    {
        let _ = (program, max_call_depth);
        Err(JitNyiReason::UnsupportedArch)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitSnapshot {
    pub arch: &'static str,
    pub config: JitConfig,
    pub code_len: Option<usize>,
    pub refusal: Option<JitNyiReason>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitNyiDoc {
    pub item: &'static str,
    pub reason: &'static str,
}

impl JitSnapshot {
    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        out.push_str("native-jit:\n");
        out.push_str(&format!("  arch: {}\n", self.arch));
        out.push_str(&format!("  enabled: {}\n", self.config.enabled));
        out.push_str(&format!(
            "  max_struct_unroll: {}\n",
            self.config.max_struct_unroll
        ));
        match (self.code_len, &self.refusal) {
            (Some(len), _) => out.push_str(&format!("  image: {len} bytes\n")),
            (None, Some(reason)) => {
                out.push_str(&format!("  image: none ({})\n", reason.message()))
            }
            (None, None) => out.push_str("  image: none\n"),
        }
        out.push_str("  nyi reference:\n");
        for doc in nyi_reference() {
            out.push_str(&format!("    - {}: {}\n", doc.item, doc.reason));
        }
        out
    }
}

pub fn nyi_reference() -> Vec<JitNyiDoc> {
    vec![
        JitNyiDoc {
            item: "Unsupported native JIT targets",
            reason: "native emission supports x86_64 on linux/windows only",
        },
        JitNyiDoc {
            item: "Large struct-wide operations",
            reason: "struct set/arithmetic is unrolled up to max_struct_unroll elements",
        },
        JitNyiDoc {
            item: "Mixed operand kinds",
            reason: "operands whose kinds disagree with the destination are left to the interpreter",
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;

    #[test]
    fn disabled_config_refuses_first() {
        let mut program = compile_source("int i; i = 1;").expect("compile should succeed");
        let config = JitConfig {
            enabled: false,
            ..JitConfig::default()
        };
        assert!(matches!(
            jit_compile(&mut program, &config, 16),
            Err(JitNyiReason::Disabled)
        ));
    }

    #[test]
    fn snapshot_reports_refusal() {
        let snapshot = JitSnapshot {
            arch: "x86_64",
            config: JitConfig {
                enabled: true,
                max_struct_unroll: 4,
            },
            code_len: None,
            refusal: Some(JitNyiReason::StructTooLarge {
                index: 3,
                elements: 9,
                limit: 4,
            }),
        };
        let text = snapshot.dump_text();
        assert!(text.contains("max_struct_unroll: 4"));
        assert!(text.contains("instruction 3 touches 9 struct elements"));
    }
}

use std::collections::HashMap;

use crate::compiler::CompileError;
use crate::vm::{Instruction, OpCode, Operand};

/// Instructions under construction. Jump and call targets are still
/// symbolic; [`InstructionFlow::resolve`] turns them into relative offsets.
#[derive(Debug, Default)]
pub struct InstructionFlow {
    instructions: Vec<Instruction>,
    labels: HashMap<String, usize>,
}

impl InstructionFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Places `name` at the next instruction index.
    pub fn label(&mut self, name: &str, line: u32) -> Result<(), CompileError> {
        if self.labels.contains_key(name) {
            return Err(CompileError::DuplicateLabel {
                label: name.to_string(),
                line,
            });
        }
        self.labels.insert(name.to_string(), self.instructions.len());
        self.instructions.push(Instruction::new(
            OpCode::Label,
            Operand::Label(name.to_string()),
            Operand::None,
            line,
        ));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn label_index(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Rewrites every label reference into `target_index - this_index`.
    pub fn resolve(self) -> Result<ResolvedFlow, CompileError> {
        let InstructionFlow {
            mut instructions,
            labels,
        } = self;
        for (index, instruction) in instructions.iter_mut().enumerate() {
            if !instruction.opcode.takes_label() {
                continue;
            }
            let Operand::Label(name) = &instruction.dest else {
                continue;
            };
            let target = labels
                .get(name)
                .copied()
                .ok_or_else(|| CompileError::UnresolvedLabel {
                    label: name.clone(),
                    line: instruction.line,
                })?;
            let offset = target as i64 - index as i64;
            let offset = i32::try_from(offset).map_err(|_| CompileError::UnresolvedLabel {
                label: name.clone(),
                line: instruction.line,
            })?;
            instruction.dest = Operand::Offset(offset);
        }
        Ok(ResolvedFlow { instructions })
    }
}

/// Flow whose jumps and calls carry relative offsets. Label pseudo
/// instructions stay in place as no-ops so indices are unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedFlow {
    instructions: Vec<Instruction>,
}

impl ResolvedFlow {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Absolute index a jump at `index` lands on.
    pub fn target_of(&self, index: usize) -> Option<usize> {
        let Operand::Offset(offset) = self.instructions.get(index)?.dest else {
            return None;
        };
        usize::try_from(index as i64 + offset as i64).ok()
    }
}

impl From<Vec<Instruction>> for ResolvedFlow {
    fn from(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jump(op: OpCode, label: &str) -> Instruction {
        Instruction::new(op, Operand::Label(label.to_string()), Operand::None, 1)
    }

    fn ret() -> Instruction {
        Instruction::new(OpCode::Ret, Operand::None, Operand::None, 1)
    }

    #[test]
    fn resolves_forward_and_backward_targets() {
        let mut flow = InstructionFlow::new();
        flow.emit(jump(OpCode::Jump, "test"));
        flow.label("start", 1).expect("start label");
        flow.emit(ret());
        flow.label("test", 1).expect("test label");
        flow.emit(jump(OpCode::JumpNotZero, "start"));
        flow.emit(jump(OpCode::Call, "start"));

        let start = flow.label_index("start").expect("start");
        let test = flow.label_index("test").expect("test");
        let resolved = flow.resolve().expect("resolve should succeed");

        assert_eq!(resolved.get(0).map(|i| &i.dest), Some(&Operand::Offset(3)));
        assert_eq!(resolved.target_of(0), Some(test));
        assert_eq!(resolved.target_of(4), Some(start));
        assert_eq!(resolved.target_of(5), Some(start));
        assert_eq!(
            resolved.get(1).map(|i| &i.dest),
            Some(&Operand::Label("start".to_string()))
        );
    }

    #[test]
    fn every_jump_lands_on_its_label() {
        let mut flow = InstructionFlow::new();
        let names = ["a", "b", "c", "d"];
        for (round, name) in names.iter().enumerate() {
            flow.emit(jump(OpCode::JumpZero, names[(round + 2) % names.len()]));
            flow.label(name, 1).expect("label");
            flow.emit(ret());
        }
        let expected: Vec<(usize, usize)> = flow
            .instructions()
            .iter()
            .enumerate()
            .filter_map(|(index, instr)| match &instr.dest {
                Operand::Label(name) if instr.opcode.takes_label() => {
                    Some((index, flow.label_index(name).expect("defined")))
                }
                _ => None,
            })
            .collect();
        let resolved = flow.resolve().expect("resolve should succeed");
        for (index, target) in expected {
            assert_eq!(resolved.target_of(index), Some(target));
        }
    }

    #[test]
    fn dangling_label_is_an_error() {
        let mut flow = InstructionFlow::new();
        flow.emit(Instruction::new(
            OpCode::Jump,
            Operand::Label("nowhere".to_string()),
            Operand::None,
            7,
        ));
        let err = flow.resolve().expect_err("resolve should fail");
        assert!(matches!(
            err,
            CompileError::UnresolvedLabel { ref label, line: 7 } if label == "nowhere"
        ));
    }

    #[test]
    fn duplicate_label_is_an_error() {
        let mut flow = InstructionFlow::new();
        flow.label("x", 1).expect("first label");
        assert!(matches!(
            flow.label("x", 2),
            Err(CompileError::DuplicateLabel { line: 2, .. })
        ));
    }
}

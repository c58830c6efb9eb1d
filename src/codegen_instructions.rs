// Z-Machine Instruction Encoding
//
// One routine at a time: instructions are appended to a RoutineBuilder,
// labels and branches are resolved locally once the routine body is
// complete, and relocations stay routine-relative until the code
// generator shifts them into the final code stream.

use indexmap::IndexMap;

use crate::error::CompilerError;
use crate::opcodes::one_op;
use crate::relocation::{patch_word, Relocation, RelocationKind};

/// Operand-count families. The family picks the encoded form together
/// with the operand types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFamily {
    Op0,
    Op1,
    Op2,
    Var,
    /// VAR with two type bytes (call_vs2 / call_vn2)
    VarDouble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    LargeConstant(u16),
    SmallConstant(u8),
    Variable(u8),
}

impl Operand {
    pub fn type_bits(&self) -> u8 {
        match self {
            Operand::LargeConstant(_) => 0,
            Operand::SmallConstant(_) => 1,
            Operand::Variable(_) => 2,
        }
    }

    /// The stack, variable 0.
    pub fn stack() -> Operand {
        Operand::Variable(0)
    }

    /// Smallest constant encoding for a value.
    pub fn constant(value: i32) -> Operand {
        if (0..=255).contains(&value) {
            Operand::SmallConstant(value as u8)
        } else {
            Operand::LargeConstant(value as u16)
        }
    }
}

/// Where a conditional branch goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    /// Branch to a local label.
    Label(u32),
    /// The reserved offset-0 encoding: return false.
    ReturnFalse,
    /// The reserved offset-1 encoding: return true.
    ReturnTrue,
}

#[derive(Debug, Clone, Copy)]
pub struct Branch {
    pub target: BranchTarget,
    /// Branch when the test succeeds (true) or fails (false).
    pub on_true: bool,
}

struct BranchFixup {
    /// Offset of the first branch byte.
    at: usize,
    label: u32,
    on_true: bool,
}

struct JumpFixup {
    /// Offset of the 16-bit jump operand.
    at: usize,
    label: u32,
}

/// Builds the bytecode of a single routine.
pub struct RoutineBuilder {
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    labels: IndexMap<u32, usize>,
    branch_fixups: Vec<BranchFixup>,
    jump_fixups: Vec<JumpFixup>,
    next_label: u32,
}

impl RoutineBuilder {
    pub fn new() -> Self {
        RoutineBuilder {
            code: Vec::new(),
            relocations: Vec::new(),
            labels: IndexMap::new(),
            branch_fixups: Vec::new(),
            jump_fixups: Vec::new(),
            next_label: 0,
        }
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn new_label(&mut self) -> u32 {
        let id = self.next_label;
        self.next_label += 1;
        id
    }

    pub fn place_label(&mut self, label: u32) {
        self.labels.insert(label, self.code.len());
    }

    pub fn push_byte(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn push_word(&mut self, word: u16) {
        self.code.push((word >> 8) as u8);
        self.code.push((word & 0xFF) as u8);
    }

    /// Record a relocation for the 16-bit slot about to be written.
    pub fn relocate_here(&mut self, kind: RelocationKind) {
        self.relocations.push(Relocation::new(kind, self.code.len()));
    }

    /// Emit one instruction. The opcode is the raw number within its
    /// family; form selection and operand-type packing happen here.
    /// Returns the code offset of each operand so callers can attach
    /// relocations to placeholder operands.
    pub fn emit(
        &mut self,
        family: OpFamily,
        opcode: u8,
        operands: &[Operand],
        store: Option<u8>,
        branch: Option<Branch>,
    ) -> Result<Vec<usize>, CompilerError> {
        if opcode > 0x1F {
            return Err(CompilerError::CodeGenError(format!(
                "raw opcode 0x{:02x} out of range (encoded byte passed instead of raw number?)",
                opcode
            )));
        }

        let mut positions = Vec::with_capacity(operands.len());

        match family {
            OpFamily::Op0 => {
                if !operands.is_empty() {
                    return Err(CompilerError::CodeGenError(
                        "0OP instruction given operands".to_string(),
                    ));
                }
                self.push_byte(0xB0 | opcode);
            }
            OpFamily::Op1 => {
                let operand = operands.first().ok_or_else(|| {
                    CompilerError::CodeGenError("1OP instruction needs an operand".to_string())
                })?;
                self.push_byte(0x80 | (operand.type_bits() << 4) | opcode);
                positions.push(self.code.len());
                self.emit_operand(*operand);
            }
            OpFamily::Op2 => {
                // je accepts up to 4 operands through the variable form
                if operands.len() < 2 || operands.len() > 4 {
                    return Err(CompilerError::CodeGenError(format!(
                        "2OP instruction takes 2..4 operands, got {}",
                        operands.len()
                    )));
                }
                let long_ok = operands.len() == 2
                    && operands
                        .iter()
                        .all(|op| !matches!(op, Operand::LargeConstant(_)));
                if long_ok {
                    // Long form: bit 6/5 set for variable operands
                    let mut byte = opcode;
                    if matches!(operands[0], Operand::Variable(_)) {
                        byte |= 0x40;
                    }
                    if matches!(operands[1], Operand::Variable(_)) {
                        byte |= 0x20;
                    }
                    self.push_byte(byte);
                    positions.push(self.code.len());
                    self.emit_operand(operands[0]);
                    positions.push(self.code.len());
                    self.emit_operand(operands[1]);
                } else {
                    // Large constants or extra operands force the
                    // variable form (0xC0 family keeps 2OP semantics)
                    self.push_byte(0xC0 | opcode);
                    self.emit_type_byte(operands);
                    for op in operands {
                        positions.push(self.code.len());
                        self.emit_operand(*op);
                    }
                }
            }
            OpFamily::Var => {
                if operands.len() > 4 {
                    return Err(CompilerError::CodeGenError(format!(
                        "VAR instruction takes at most 4 operands, got {}",
                        operands.len()
                    )));
                }
                self.push_byte(0xE0 | opcode);
                self.emit_type_byte(operands);
                for op in operands {
                    positions.push(self.code.len());
                    self.emit_operand(*op);
                }
            }
            OpFamily::VarDouble => {
                if operands.len() > 8 {
                    return Err(CompilerError::CodeGenError(format!(
                        "double-VAR instruction takes at most 8 operands, got {}",
                        operands.len()
                    )));
                }
                self.push_byte(0xE0 | opcode);
                let mut types = [3u8; 8];
                for (i, op) in operands.iter().enumerate() {
                    types[i] = op.type_bits();
                }
                self.push_byte(types[0] << 6 | types[1] << 4 | types[2] << 2 | types[3]);
                self.push_byte(types[4] << 6 | types[5] << 4 | types[6] << 2 | types[7]);
                for op in operands {
                    positions.push(self.code.len());
                    self.emit_operand(*op);
                }
            }
        }

        if let Some(var) = store {
            self.push_byte(var);
        }
        if let Some(branch) = branch {
            self.emit_branch(branch);
        }
        Ok(positions)
    }

    fn emit_type_byte(&mut self, operands: &[Operand]) {
        let mut types = [3u8; 4];
        for (i, op) in operands.iter().enumerate() {
            types[i] = op.type_bits();
        }
        self.push_byte(types[0] << 6 | types[1] << 4 | types[2] << 2 | types[3]);
    }

    fn emit_operand(&mut self, operand: Operand) {
        match operand {
            Operand::LargeConstant(value) => self.push_word(value),
            Operand::SmallConstant(value) => self.push_byte(value),
            Operand::Variable(var) => self.push_byte(var),
        }
    }

    /// Branch data: bit 7 is the polarity, bit 6 selects the short
    /// (6-bit) or long (14-bit) offset form. Offsets 0 and 1 mean
    /// return-false / return-true. Label branches use the long form and
    /// are patched when the routine is finished.
    fn emit_branch(&mut self, branch: Branch) {
        let polarity = if branch.on_true { 0x80 } else { 0x00 };
        match branch.target {
            BranchTarget::ReturnFalse => self.push_byte(polarity | 0x40),
            BranchTarget::ReturnTrue => self.push_byte(polarity | 0x40 | 0x01),
            BranchTarget::Label(label) => {
                self.branch_fixups.push(BranchFixup {
                    at: self.code.len(),
                    label,
                    on_true: branch.on_true,
                });
                self.push_byte(polarity); // long form, placeholder offset
                self.push_byte(0);
            }
        }
    }

    /// Unconditional jump to a label (1OP jump with a signed offset).
    pub fn emit_jump(&mut self, label: u32) {
        self.push_byte(0x80 | (0 << 4) | one_op::JUMP);
        self.jump_fixups.push(JumpFixup {
            at: self.code.len(),
            label,
        });
        self.push_word(0);
    }

    /// Emit print_paddr with a placeholder operand resolved positionally
    /// by the assembler (TELL string lowering).
    pub fn emit_print_paddr_placeholder(&mut self, text: &str) {
        self.push_byte(0x80 | (0 << 4) | one_op::PRINT_PADDR);
        self.relocate_here(RelocationKind::PrintPaddr {
            text: text.to_string(),
        });
        self.push_word(crate::relocation::sentinel::STRING_OPERAND);
    }

    /// Resolve every label-relative branch and jump.
    pub fn finish(&mut self) -> Result<(), CompilerError> {
        for fixup in &self.branch_fixups {
            let target = *self.labels.get(&fixup.label).ok_or_else(|| {
                CompilerError::CodeGenError(format!("undefined branch label L{}", fixup.label))
            })?;
            // Offset counts from the byte after the branch data.
            let offset = target as i32 - (fixup.at as i32 + 2) + 2;
            if !(-8192..=8191).contains(&offset) {
                return Err(CompilerError::BranchOutOfRange(offset));
            }
            let polarity = if fixup.on_true { 0x80u16 } else { 0x0000 };
            let encoded = polarity | (offset as u16 & 0x3FFF);
            patch_word(&mut self.code, fixup.at, encoded);
        }

        for fixup in &self.jump_fixups {
            let target = *self.labels.get(&fixup.label).ok_or_else(|| {
                CompilerError::CodeGenError(format!("undefined jump label L{}", fixup.label))
            })?;
            let offset = target as i32 - (fixup.at as i32 + 2) + 2;
            if !(-32768..=32767).contains(&offset) {
                return Err(CompilerError::BranchOutOfRange(offset));
            }
            patch_word(&mut self.code, fixup.at, offset as u16);
        }

        self.branch_fixups.clear();
        self.jump_fixups.clear();
        Ok(())
    }
}

impl Default for RoutineBuilder {
    fn default() -> Self {
        RoutineBuilder::new()
    }
}

#[cfg(test)]
#[path = "codegen_instructions_tests.rs"]
mod tests;

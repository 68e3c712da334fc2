//! Assembly stream and the two-pass assembler.
//!
//! The stream is a linear sequence of labels and instructions with symbolic
//! label operands. Pass one discovers label positions from the fixed
//! per-opcode encodings; pass two emits bytes, replacing each label operand
//! with its signed distance from the instruction.

pub mod codegen;

use std::collections::HashMap;

use scatha_core::opcode::{code_size, OpCode, OpCodeClass, NO_INDEX_REG};
use scatha_core::program::ProgramHeader;

pub use codegen::generate_assembly;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: u8,
    /// `NO_INDEX_REG` encodes an absent index register.
    pub index: u8,
    pub scale: u8,
    pub offset: u8,
}

impl MemoryOperand {
    /// An absolute `[base + offset]` operand without an index register.
    pub fn plain(base: u8, offset: u8) -> Self {
        MemoryOperand { base, index: NO_INDEX_REG, scale: 0, offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(u8),
    Value8(u8),
    Value16(u16),
    Value64(u64),
    Memory(MemoryOperand),
    Label(LabelId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op: OpCode,
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Position marker; carries no bytes in the image.
    Label(LabelId),
    Inst(Instruction),
}

/// A whole program in symbolic form, plus its data section.
#[derive(Debug, Default)]
pub struct AssemblyStream {
    pub items: Vec<Item>,
    pub data: Vec<u8>,
    /// Entry point; execution starts here.
    pub start: Option<LabelId>,
    next_label: u32,
}

impl AssemblyStream {
    pub fn new() -> Self {
        AssemblyStream::default()
    }

    pub fn make_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    pub fn place_label(&mut self, label: LabelId) {
        self.items.push(Item::Label(label));
    }

    pub fn push(&mut self, op: OpCode, operands: Vec<Operand>) {
        self.items.push(Item::Inst(Instruction { op, operands }));
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AssembleError {
    /// A jump or call names a label that was never placed.
    UndefinedLabel(LabelId),
    /// Operand list does not match the opcode's encoding class.
    MalformedInstruction(OpCode),
    /// No entry point was set.
    MissingStart,
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::UndefinedLabel(label) => {
                write!(f, "undefined label L{}", label.0)
            }
            AssembleError::MalformedInstruction(op) => {
                write!(f, "malformed operands for '{}'", op)
            }
            AssembleError::MissingStart => write!(f, "no entry point"),
        }
    }
}

impl std::error::Error for AssembleError {}

/// Assemble the stream into a loadable program image.
pub fn assemble(stream: &AssemblyStream) -> Result<Vec<u8>, AssembleError> {
    // Pass 1: label discovery.
    let mut positions: HashMap<LabelId, usize> = HashMap::new();
    let mut offset = 0usize;
    for item in &stream.items {
        match item {
            Item::Label(label) => {
                positions.insert(*label, offset);
            }
            Item::Inst(inst) => offset += code_size(inst.op),
        }
    }
    let start = stream.start.ok_or(AssembleError::MissingStart)?;
    let start_address = *positions
        .get(&start)
        .ok_or(AssembleError::UndefinedLabel(start))?;

    // Pass 2: emission.
    let mut text = Vec::with_capacity(offset);
    for item in &stream.items {
        let Item::Inst(inst) = item else { continue };
        let position = text.len();
        text.push(u8::from(inst.op));
        emit_operands(inst, position, &positions, &mut text)?;
        debug_assert_eq!(text.len() - position, code_size(inst.op));
    }

    let header = ProgramHeader::new(
        start_address as u64,
        stream.data.len() as u64,
        text.len() as u64,
    );
    let mut image = Vec::with_capacity(header.size as usize);
    header.write_to(&mut image);
    image.extend_from_slice(&stream.data);
    image.extend_from_slice(&text);
    Ok(image)
}

fn label_offset(
    positions: &HashMap<LabelId, usize>,
    label: LabelId,
    position: usize,
) -> Result<i32, AssembleError> {
    let target = *positions
        .get(&label)
        .ok_or(AssembleError::UndefinedLabel(label))?;
    Ok(target as i32 - position as i32)
}

fn emit_operands(
    inst: &Instruction,
    position: usize,
    positions: &HashMap<LabelId, usize>,
    out: &mut Vec<u8>,
) -> Result<(), AssembleError> {
    use Operand::*;
    let malformed = || AssembleError::MalformedInstruction(inst.op);
    let emit_memory = |mem: &MemoryOperand, out: &mut Vec<u8>| {
        out.extend_from_slice(&[mem.base, mem.index, mem.scale, mem.offset]);
    };
    match inst.op {
        OpCode::Ret | OpCode::Terminate => Ok(()),
        OpCode::Call => match inst.operands.as_slice() {
            [Label(label), Reg(reg_offset)] => {
                let rel = label_offset(positions, *label, position)?;
                out.extend_from_slice(&rel.to_le_bytes());
                out.push(*reg_offset);
                Ok(())
            }
            _ => Err(malformed()),
        },
        OpCode::CallExt => match inst.operands.as_slice() {
            [Reg(reg_offset), Value8(slot), Value16(index)] => {
                out.push(*reg_offset);
                out.push(*slot);
                out.extend_from_slice(&index.to_le_bytes());
                Ok(())
            }
            _ => Err(malformed()),
        },
        OpCode::LIncSP => match inst.operands.as_slice() {
            [Reg(dest), Value16(count)] => {
                out.push(*dest);
                out.extend_from_slice(&count.to_le_bytes());
                Ok(())
            }
            _ => Err(malformed()),
        },
        op => match (scatha_core::opcode::classify(op), inst.operands.as_slice()) {
            (OpCodeClass::RR, [Reg(a), Reg(b)]) => {
                out.extend_from_slice(&[*a, *b]);
                Ok(())
            }
            (OpCodeClass::RV8, [Reg(a), Value8(v)]) => {
                out.extend_from_slice(&[*a, *v]);
                Ok(())
            }
            (OpCodeClass::RV64, [Reg(a), Value64(v)]) => {
                out.push(*a);
                out.extend_from_slice(&v.to_le_bytes());
                Ok(())
            }
            (OpCodeClass::RM, [Reg(a), Memory(mem)]) => {
                out.push(*a);
                emit_memory(mem, out);
                Ok(())
            }
            (OpCodeClass::MR, [Memory(mem), Reg(a)]) => {
                emit_memory(mem, out);
                out.push(*a);
                Ok(())
            }
            (OpCodeClass::R, [Reg(a)]) => {
                out.push(*a);
                Ok(())
            }
            (OpCodeClass::Jump, [Label(label)]) => {
                let rel = label_offset(positions, *label, position)?;
                out.extend_from_slice(&rel.to_le_bytes());
                Ok(())
            }
            _ => Err(malformed()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scatha_core::program::ProgramView;

    #[test]
    fn test_simple_program_roundtrips_through_view() {
        let mut stream = AssemblyStream::new();
        let main = stream.make_label();
        stream.start = Some(main);
        stream.data = vec![1, 2, 3];
        stream.place_label(main);
        stream.push(OpCode::Mov64RV, vec![Operand::Reg(0), Operand::Value64(7)]);
        stream.push(OpCode::Ret, vec![]);
        let image = assemble(&stream).unwrap();
        let view = ProgramView::new(&image).unwrap();
        assert_eq!(view.data, &[1, 2, 3]);
        assert_eq!(view.start_address, 0);
        assert_eq!(view.text[0], u8::from(OpCode::Mov64RV));
        assert_eq!(view.text.len(), 11);
    }

    #[test]
    fn test_backward_jump_offset_is_negative() {
        let mut stream = AssemblyStream::new();
        let top = stream.make_label();
        stream.start = Some(top);
        stream.place_label(top);
        stream.push(OpCode::Mov64RR, vec![Operand::Reg(0), Operand::Reg(1)]);
        stream.push(OpCode::Jmp, vec![Operand::Label(top)]);
        let image = assemble(&stream).unwrap();
        let view = ProgramView::new(&image).unwrap();
        // The jump sits at offset 3; its operand must be -3.
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&view.text[4..8]);
        assert_eq!(i32::from_le_bytes(bytes), -3);
    }

    #[test]
    fn test_labels_are_deterministic() {
        let build = || {
            let mut stream = AssemblyStream::new();
            let a = stream.make_label();
            let b = stream.make_label();
            stream.start = Some(a);
            stream.place_label(a);
            stream.push(OpCode::Jmp, vec![Operand::Label(b)]);
            stream.push(OpCode::Terminate, vec![]);
            stream.place_label(b);
            stream.push(OpCode::Ret, vec![]);
            assemble(&stream).unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_undefined_label_is_reported() {
        let mut stream = AssemblyStream::new();
        let main = stream.make_label();
        let missing = stream.make_label();
        stream.start = Some(main);
        stream.place_label(main);
        stream.push(OpCode::Jmp, vec![Operand::Label(missing)]);
        assert_eq!(
            assemble(&stream),
            Err(AssembleError::UndefinedLabel(missing))
        );
    }

    #[test]
    fn test_malformed_operands_rejected() {
        let mut stream = AssemblyStream::new();
        let main = stream.make_label();
        stream.start = Some(main);
        stream.place_label(main);
        stream.push(OpCode::Mov64RR, vec![Operand::Reg(0)]);
        assert_eq!(
            assemble(&stream),
            Err(AssembleError::MalformedInstruction(OpCode::Mov64RR))
        );
    }

    #[test]
    fn test_memory_operand_encoding() {
        let mut stream = AssemblyStream::new();
        let main = stream.make_label();
        stream.start = Some(main);
        stream.place_label(main);
        stream.push(
            OpCode::Mov64RM,
            vec![
                Operand::Reg(2),
                Operand::Memory(MemoryOperand { base: 1, index: 3, scale: 8, offset: 16 }),
            ],
        );
        stream.push(OpCode::Ret, vec![]);
        let image = assemble(&stream).unwrap();
        let view = ProgramView::new(&image).unwrap();
        assert_eq!(&view.text[..6], &[u8::from(OpCode::Mov64RM), 2, 1, 3, 8, 16]);
    }
}

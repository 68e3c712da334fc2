//! The execution engine: register file, frames, flags and dispatch loop.

use scatha_core::opcode::{classify, code_size, OpCode, OpCodeClass, NO_INDEX_REG};
use scatha_core::program::ProgramView;

use crate::external::{install_builtins, ExternalFunction};
use crate::memory::VirtualMemory;
use crate::VmError;

bitflags::bitflags! {
    /// Flag register written by the compare and test instructions and
    /// consulted by conditional jumps, sets and moves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmFlags: u8 {
        const LESS  = 0b01;
        const EQUAL = 0b10;
    }
}

/// Reserved register headroom per frame. `execute` pre-shifts the register
/// pointer by this amount because it cannot know how many registers the
/// interrupted frame actually uses.
pub const MAX_CALLFRAME_REGISTER_COUNT: usize = 256;

/// One activation of the dispatch loop. A fresh frame is pushed whenever the
/// host (or a foreign function running on behalf of the guest) enters the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionFrame {
    /// Index of register 0 of the current window.
    pub reg_idx: usize,
    /// Window base at entry; `ret` with `reg_idx == bottom_reg` ends the frame.
    pub bottom_reg: usize,
    /// Instruction pointer, an offset into the text section.
    pub iptr: usize,
    /// Current top of the stack region.
    pub stack_ptr: u64,
}

/// Tunables for constructing a [`VirtualMachine`].
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Number of 64-bit slots in the register file.
    pub register_count: usize,
    /// Size of the stack region in bytes.
    pub stack_size: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions { register_count: 1 << 20, stack_size: 1 << 20 }
    }
}

pub struct VirtualMachine {
    registers: Vec<u64>,
    memory: VirtualMemory,
    text: Vec<u8>,
    start_address: usize,
    flags: VmFlags,
    frame: ExecutionFrame,
    exec_frames: Vec<ExecutionFrame>,
    foreign: Vec<Vec<Option<ExternalFunction>>>,
    loaded: bool,
    stack_size: usize,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new(VmOptions::default())
    }
}

impl VirtualMachine {
    pub fn new(options: VmOptions) -> Self {
        let mut vm = VirtualMachine {
            registers: vec![0; options.register_count],
            memory: VirtualMemory::new(&[], options.stack_size),
            text: Vec::new(),
            start_address: 0,
            flags: VmFlags::default(),
            frame: ExecutionFrame { reg_idx: 0, bottom_reg: 0, iptr: 0, stack_ptr: 0 },
            exec_frames: Vec::new(),
            foreign: vec![Vec::new()],
            loaded: false,
            stack_size: options.stack_size,
        };
        install_builtins(&mut vm);
        vm
    }

    /// Validate and install a program image.
    pub fn load_binary(&mut self, image: &[u8]) -> Result<(), VmError> {
        let view = ProgramView::new(image)?;
        self.memory = VirtualMemory::new(view.data, self.stack_size);
        self.text = view.text.to_vec();
        self.start_address = view.start_address as usize;
        let stack_base = self.memory.stack_base();
        self.frame = ExecutionFrame { reg_idx: 0, bottom_reg: 0, iptr: 0, stack_ptr: stack_base };
        self.exec_frames.clear();
        self.loaded = true;
        Ok(())
    }

    /// Install a foreign function. Slot 0 is reserved for the builtins.
    pub fn set_foreign_function(&mut self, slot: u8, index: u16, func: ExternalFunction) {
        let slot = slot as usize;
        if self.foreign.len() <= slot {
            self.foreign.resize(slot + 1, Vec::new());
        }
        let table = &mut self.foreign[slot];
        if table.len() <= index as usize {
            table.resize(index as usize + 1, None);
        }
        table[index as usize] = Some(func);
    }

    pub fn memory(&self) -> &VirtualMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut VirtualMemory {
        &mut self.memory
    }

    /// Read a register of the current window, e.g. from a foreign function.
    pub fn register(&self, window_base: usize, index: usize) -> u64 {
        self.registers[window_base + index]
    }

    pub fn set_register(&mut self, window_base: usize, index: usize, value: u64) {
        self.registers[window_base + index] = value;
    }

    /// Run the loaded program from its start address.
    ///
    /// Pushes a fresh execution frame, places `args` in the new register
    /// window, runs to completion and restores the previous frame, so foreign
    /// functions may call this reentrantly.
    pub fn execute(&mut self, args: &[u64]) -> Result<u64, VmError> {
        self.execute_at(self.start_address, args)
    }

    /// Run from an explicit text offset; used by reentrant host callbacks.
    pub fn execute_at(&mut self, start: usize, args: &[u64]) -> Result<u64, VmError> {
        if !self.loaded {
            return Err(VmError::NoProgram);
        }
        let last = self.frame;
        let reg_idx = last.reg_idx + MAX_CALLFRAME_REGISTER_COUNT;
        if reg_idx + MAX_CALLFRAME_REGISTER_COUNT > self.registers.len() {
            return Err(VmError::RegisterFileExhausted);
        }
        self.exec_frames.push(last);
        self.frame = ExecutionFrame {
            reg_idx,
            bottom_reg: reg_idx,
            iptr: start,
            stack_ptr: last.stack_ptr,
        };
        self.registers[reg_idx..reg_idx + args.len()].copy_from_slice(args);

        let result = self.run();

        let finished = self.frame;
        self.frame = self.exec_frames.pop().expect("frame stack underflow");
        result?;
        Ok(self.registers[finished.bottom_reg])
    }

    /// The dispatch loop. Returns when the entry frame executes `ret` at its
    /// bottom register window or the program terminates.
    fn run(&mut self) -> Result<(), VmError> {
        loop {
            let iptr = self.frame.iptr;
            let Some(&byte) = self.text.get(iptr) else {
                return Err(VmError::InvalidOpcode { offset: iptr, byte: 0 });
            };
            let op = OpCode::try_from(byte)
                .map_err(|_| VmError::InvalidOpcode { offset: iptr, byte })?;
            tracing::trace!(iptr, %op, "dispatch");
            match op {
                OpCode::Terminate => return Ok(()),
                OpCode::Call => {
                    let offset = self.read_i32(iptr + 1);
                    let reg_offset = self.text[iptr + 5] as usize;
                    let reg_idx = self.frame.reg_idx + reg_offset;
                    if reg_idx + MAX_CALLFRAME_REGISTER_COUNT > self.registers.len() {
                        return Err(VmError::RegisterFileExhausted);
                    }
                    self.registers[reg_idx - 3] = self.frame.stack_ptr;
                    self.registers[reg_idx - 2] = reg_offset as u64;
                    self.registers[reg_idx - 1] = (iptr + code_size(OpCode::Call)) as u64;
                    self.frame.reg_idx = reg_idx;
                    self.frame.iptr = (iptr as i64 + offset as i64) as usize;
                }
                OpCode::Ret => {
                    if self.frame.reg_idx == self.frame.bottom_reg {
                        return Ok(());
                    }
                    let reg_idx = self.frame.reg_idx;
                    self.frame.iptr = self.registers[reg_idx - 1] as usize;
                    self.frame.reg_idx -= self.registers[reg_idx - 2] as usize;
                    self.frame.stack_ptr = self.registers[reg_idx - 3];
                }
                OpCode::CallExt => {
                    let reg_offset = self.text[iptr + 1] as usize;
                    let slot = self.text[iptr + 2];
                    let index = u16::from_le_bytes([self.text[iptr + 3], self.text[iptr + 4]]);
                    let func = self
                        .foreign
                        .get(slot as usize)
                        .and_then(|table| table.get(index as usize))
                        .copied()
                        .flatten()
                        .ok_or(VmError::UnknownForeignFunction { slot, index })?;
                    self.frame.iptr = iptr + code_size(OpCode::CallExt);
                    let window = self.frame.reg_idx + reg_offset;
                    func(self, window)?;
                }
                OpCode::LIncSP => {
                    let dest = self.text[iptr + 1] as usize;
                    let count = u16::from_le_bytes([self.text[iptr + 2], self.text[iptr + 3]]);
                    let addr = self.frame.stack_ptr;
                    if addr + count as u64 > self.memory.stack_end() {
                        return Err(VmError::StackOverflow);
                    }
                    self.frame.stack_ptr += count as u64;
                    self.write_reg(dest, addr);
                    self.frame.iptr = iptr + code_size(OpCode::LIncSP);
                }
                _ => self.step(op, iptr)?,
            }
        }
    }

    /// Execute one fixed-layout instruction and advance the pointer.
    fn step(&mut self, op: OpCode, iptr: usize) -> Result<(), VmError> {
        use OpCode::*;
        let next = iptr + code_size(op);
        match classify(op) {
            OpCodeClass::Jump => {
                let offset = self.read_i32(iptr + 1);
                let taken = match op {
                    Jmp => true,
                    Je => self.flags.contains(VmFlags::EQUAL),
                    Jne => !self.flags.contains(VmFlags::EQUAL),
                    Jl => self.flags.contains(VmFlags::LESS),
                    Jle => self.flags.intersects(VmFlags::LESS | VmFlags::EQUAL),
                    Jg => self.flags.is_empty(),
                    Jge => !self.flags.contains(VmFlags::LESS),
                    _ => unreachable!(),
                };
                self.frame.iptr =
                    if taken { (iptr as i64 + offset as i64) as usize } else { next };
                return Ok(());
            }
            OpCodeClass::RR => {
                let a = self.text[iptr + 1] as usize;
                let b = self.text[iptr + 2] as usize;
                let rhs = self.read_reg(b);
                self.binary_op(op, a, rhs);
            }
            OpCodeClass::RV64 => {
                let a = self.text[iptr + 1] as usize;
                let rhs = self.read_u64(iptr + 2);
                self.binary_op(op, a, rhs);
            }
            OpCodeClass::RV8 => {
                let a = self.text[iptr + 1] as usize;
                let rhs = self.text[iptr + 2] as u64;
                self.binary_op(op, a, rhs);
            }
            OpCodeClass::R => {
                let a = self.text[iptr + 1] as usize;
                self.unary_op(op, a);
            }
            OpCodeClass::RM => {
                let dest = self.text[iptr + 1] as usize;
                let addr = self.memory_operand(iptr + 2);
                match op {
                    Lea => self.write_reg(dest, addr),
                    Mov8RM => self.write_reg(dest, self.memory.load(addr, 1)?),
                    Mov16RM => self.write_reg(dest, self.memory.load(addr, 2)?),
                    Mov32RM => self.write_reg(dest, self.memory.load(addr, 4)?),
                    Mov64RM => self.write_reg(dest, self.memory.load(addr, 8)?),
                    _ => unreachable!(),
                }
            }
            OpCodeClass::MR => {
                let addr = self.memory_operand(iptr + 1);
                let source = self.text[iptr + 5] as usize;
                let value = self.read_reg(source);
                let size = match op {
                    Mov8MR => 1,
                    Mov16MR => 2,
                    Mov32MR => 4,
                    Mov64MR => 8,
                    _ => unreachable!(),
                };
                self.memory.store(addr, value, size)?;
            }
            OpCodeClass::RV32 | OpCodeClass::Other => unreachable!(),
        }
        self.frame.iptr = next;
        Ok(())
    }

    fn binary_op(&mut self, op: OpCode, dest: usize, rhs: u64) {
        use OpCode::*;
        let lhs = self.read_reg(dest);
        let result = match op {
            Mov64RR | Mov64RV => rhs,
            CMoveRR | CMoveRV => {
                if self.flags.contains(VmFlags::EQUAL) {
                    rhs
                } else {
                    lhs
                }
            }
            UCmpRR | UCmpRV => {
                self.set_flags(lhs < rhs, lhs == rhs);
                return;
            }
            ICmpRR | ICmpRV => {
                self.set_flags((lhs as i64) < rhs as i64, lhs == rhs);
                return;
            }
            FCmpRR | FCmpRV => {
                let (a, b) = (f64::from_bits(lhs), f64::from_bits(rhs));
                self.set_flags(a < b, a == b);
                return;
            }
            AddRR | AddRV => lhs.wrapping_add(rhs),
            SubRR | SubRV => lhs.wrapping_sub(rhs),
            MulRR | MulRV => lhs.wrapping_mul(rhs),
            UDivRR | UDivRV => lhs.checked_div(rhs).unwrap_or(0),
            IDivRR | IDivRV => {
                (lhs as i64).checked_div(rhs as i64).unwrap_or(0) as u64
            }
            URemRR | URemRV => lhs.checked_rem(rhs).unwrap_or(0),
            IRemRR | IRemRV => {
                (lhs as i64).checked_rem(rhs as i64).unwrap_or(0) as u64
            }
            FAddRR | FAddRV => (f64::from_bits(lhs) + f64::from_bits(rhs)).to_bits(),
            FSubRR | FSubRV => (f64::from_bits(lhs) - f64::from_bits(rhs)).to_bits(),
            FMulRR | FMulRV => (f64::from_bits(lhs) * f64::from_bits(rhs)).to_bits(),
            FDivRR | FDivRV => (f64::from_bits(lhs) / f64::from_bits(rhs)).to_bits(),
            LslRR | LslRV => lhs.wrapping_shl(rhs as u32),
            LsrRR | LsrRV => lhs.wrapping_shr(rhs as u32),
            AsrRR | AsrRV => ((lhs as i64).wrapping_shr(rhs as u32)) as u64,
            AndRR | AndRV => lhs & rhs,
            OrRR | OrRV => lhs | rhs,
            XorRR | XorRV => lhs ^ rhs,
            _ => unreachable!("{op} is not a binary operation"),
        };
        self.write_reg(dest, result);
    }

    fn unary_op(&mut self, op: OpCode, reg: usize) {
        use OpCode::*;
        let value = self.read_reg(reg);
        let result = match op {
            ITest => {
                self.set_flags((value as i64) < 0, value == 0);
                return;
            }
            UTest => {
                self.set_flags(false, value == 0);
                return;
            }
            SetE => self.flags.contains(VmFlags::EQUAL) as u64,
            SetNE => !self.flags.contains(VmFlags::EQUAL) as u64,
            SetL => self.flags.contains(VmFlags::LESS) as u64,
            SetLE => self.flags.intersects(VmFlags::LESS | VmFlags::EQUAL) as u64,
            SetG => self.flags.is_empty() as u64,
            SetGE => !self.flags.contains(VmFlags::LESS) as u64,
            LNt => (value == 0) as u64,
            BNt => !value,
            Neg => (value as i64).wrapping_neg() as u64,
            FNeg => (-f64::from_bits(value)).to_bits(),
            Sext8 => value as u8 as i8 as i64 as u64,
            Sext16 => value as u16 as i16 as i64 as u64,
            Sext32 => value as u32 as i32 as i64 as u64,
            Fext => f64::from(f32::from_bits(value as u32)).to_bits(),
            Ftrunc => (f64::from_bits(value) as f32).to_bits() as u64,
            S64ToF64 => (value as i64 as f64).to_bits(),
            U64ToF64 => (value as f64).to_bits(),
            F64ToS64 => f64::from_bits(value) as i64 as u64,
            F64ToU64 => f64::from_bits(value) as u64,
            S64ToF32 => (value as i64 as f32).to_bits() as u64,
            U64ToF32 => (value as f32).to_bits() as u64,
            F32ToS64 => f32::from_bits(value as u32) as i64 as u64,
            F32ToU64 => f32::from_bits(value as u32) as u64,
            _ => unreachable!("{op} is not a unary operation"),
        };
        self.write_reg(reg, result);
    }

    /// Evaluate a 4-byte memory operand starting at `pos`.
    fn memory_operand(&self, pos: usize) -> u64 {
        let base = self.text[pos] as usize;
        let index = self.text[pos + 1];
        let scale = self.text[pos + 2] as u64;
        let inner_offset = self.text[pos + 3] as u64;
        let addr = self.read_reg(base).wrapping_add(inner_offset);
        if index == NO_INDEX_REG {
            addr
        } else {
            addr.wrapping_add(self.read_reg(index as usize).wrapping_mul(scale))
        }
    }

    fn set_flags(&mut self, less: bool, equal: bool) {
        self.flags = VmFlags::empty();
        self.flags.set(VmFlags::LESS, less);
        self.flags.set(VmFlags::EQUAL, equal);
    }

    fn read_reg(&self, index: usize) -> u64 {
        self.registers[self.frame.reg_idx + index]
    }

    fn write_reg(&mut self, index: usize, value: u64) {
        self.registers[self.frame.reg_idx + index] = value;
    }

    fn read_i32(&self, pos: usize) -> i32 {
        let mut buf = [0; 4];
        buf.copy_from_slice(&self.text[pos..pos + 4]);
        i32::from_le_bytes(buf)
    }

    fn read_u64(&self, pos: usize) -> u64 {
        let mut buf = [0; 8];
        buf.copy_from_slice(&self.text[pos..pos + 8]);
        u64::from_le_bytes(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scatha_core::program::ProgramHeader;

    /// Hand-assemble a text stream into a loadable image.
    fn image(data: &[u8], text: &[u8]) -> Vec<u8> {
        let header = ProgramHeader::new(0, data.len() as u64, text.len() as u64);
        let mut out = Vec::new();
        header.write_to(&mut out);
        out.extend_from_slice(data);
        out.extend_from_slice(text);
        out
    }

    fn op(code: OpCode) -> u8 {
        code.into()
    }

    #[test]
    fn test_mov_and_add() {
        let mut text = vec![op(OpCode::Mov64RV), 0];
        text.extend_from_slice(&3u64.to_le_bytes());
        text.push(op(OpCode::AddRV));
        text.push(0);
        text.extend_from_slice(&4u64.to_le_bytes());
        text.push(op(OpCode::Ret));

        let mut vm = VirtualMachine::default();
        vm.load_binary(&image(&[], &text)).unwrap();
        assert_eq!(vm.execute(&[]).unwrap(), 7);
    }

    #[test]
    fn test_arguments_arrive_in_window() {
        let text = vec![op(OpCode::AddRR), 0, 1, op(OpCode::Ret)];
        let mut vm = VirtualMachine::default();
        vm.load_binary(&image(&[], &text)).unwrap();
        assert_eq!(vm.execute(&[40, 2]).unwrap(), 42);
    }

    #[test]
    fn test_signed_compare_and_jump() {
        // R0 = -1; icmp R0, 0; jl +taken: R0 = 1 else R0 = 2
        let mut text = vec![op(OpCode::Mov64RV), 0];
        text.extend_from_slice(&(-1i64 as u64).to_le_bytes());
        text.push(op(OpCode::ICmpRV));
        text.push(0);
        text.extend_from_slice(&0u64.to_le_bytes());
        // jl over the "else" mov (10 bytes) to the "then" mov
        let jl_pos = text.len();
        text.push(op(OpCode::Jl));
        let else_size = 10 + 1; // mov64RV + ret
        text.extend_from_slice(&((5 + else_size) as i32).to_le_bytes());
        text.push(op(OpCode::Mov64RV));
        text.push(0);
        text.extend_from_slice(&2u64.to_le_bytes());
        text.push(op(OpCode::Ret));
        let then_pos = text.len();
        assert_eq!(then_pos - jl_pos, 5 + else_size);
        text.push(op(OpCode::Mov64RV));
        text.push(0);
        text.extend_from_slice(&1u64.to_le_bytes());
        text.push(op(OpCode::Ret));

        let mut vm = VirtualMachine::default();
        vm.load_binary(&image(&[], &text)).unwrap();
        assert_eq!(vm.execute(&[]).unwrap(), 1);
    }

    #[test]
    fn test_call_and_ret_restore_window() {
        // main: R3 = 20, call callee with window at 6, R0 = R6, ret
        // callee: R0 (= caller R6) already holds argument? No: caller places
        // args at R[offset..]; here callee doubles its R0.
        let mut text = Vec::new();
        // R6 = 21 (argument for callee window at offset 6)
        text.push(op(OpCode::Mov64RV));
        text.push(6);
        text.extend_from_slice(&21u64.to_le_bytes());
        // call callee, regOffset 6
        let call_pos = text.len();
        text.push(op(OpCode::Call));
        let callee_offset_slot = text.len();
        text.extend_from_slice(&0i32.to_le_bytes());
        text.push(6);
        // R0 = R6 (return value), ret
        text.push(op(OpCode::Mov64RR));
        text.push(0);
        text.push(6);
        text.push(op(OpCode::Ret));
        // callee: R0 *= 2; ret
        let callee_pos = text.len();
        text.push(op(OpCode::MulRV));
        text.push(0);
        text.extend_from_slice(&2u64.to_le_bytes());
        text.push(op(OpCode::Ret));
        let rel = (callee_pos - call_pos) as i32;
        text[callee_offset_slot..callee_offset_slot + 4].copy_from_slice(&rel.to_le_bytes());

        let mut vm = VirtualMachine::default();
        vm.load_binary(&image(&[], &text)).unwrap();
        assert_eq!(vm.execute(&[]).unwrap(), 42);
    }

    #[test]
    fn test_lincsp_store_load() {
        let mut text = Vec::new();
        // R0 = stack slot of 8 bytes
        text.push(op(OpCode::LIncSP));
        text.push(0);
        text.extend_from_slice(&8u16.to_le_bytes());
        // R1 = 99; [R0] = R1; R2 = [R0]
        text.push(op(OpCode::Mov64RV));
        text.push(1);
        text.extend_from_slice(&99u64.to_le_bytes());
        text.push(op(OpCode::Mov64MR));
        text.extend_from_slice(&[0, NO_INDEX_REG, 0, 0]);
        text.push(1);
        text.push(op(OpCode::Mov64RM));
        text.push(2);
        text.extend_from_slice(&[0, NO_INDEX_REG, 0, 0]);
        // R0 = R2, ret
        text.push(op(OpCode::Mov64RR));
        text.push(0);
        text.push(2);
        text.push(op(OpCode::Ret));

        let mut vm = VirtualMachine::default();
        vm.load_binary(&image(&[], &text)).unwrap();
        assert_eq!(vm.execute(&[]).unwrap(), 99);
    }

    #[test]
    fn test_float_arithmetic() {
        let mut text = vec![op(OpCode::Mov64RV), 0];
        text.extend_from_slice(&1.5f64.to_bits().to_le_bytes());
        text.push(op(OpCode::FMulRV));
        text.push(0);
        text.extend_from_slice(&4.0f64.to_bits().to_le_bytes());
        text.push(op(OpCode::Ret));

        let mut vm = VirtualMachine::default();
        vm.load_binary(&image(&[], &text)).unwrap();
        let bits = vm.execute(&[]).unwrap();
        assert_eq!(f64::from_bits(bits), 6.0);
    }

    #[test]
    fn test_terminate_stops_program() {
        let text = vec![op(OpCode::Terminate), op(OpCode::Mov64RR), 0, 1];
        let mut vm = VirtualMachine::default();
        vm.load_binary(&image(&[], &text)).unwrap();
        assert_eq!(vm.execute(&[5]).unwrap(), 5);
    }

    #[test]
    fn test_invalid_opcode_reported() {
        let text = vec![0xFE];
        let mut vm = VirtualMachine::default();
        vm.load_binary(&image(&[], &text)).unwrap();
        assert_eq!(
            vm.execute(&[]),
            Err(VmError::InvalidOpcode { offset: 0, byte: 0xFE })
        );
    }

    #[test]
    fn test_execute_requires_program() {
        let mut vm = VirtualMachine::default();
        assert_eq!(vm.execute(&[]), Err(VmError::NoProgram));
    }
}

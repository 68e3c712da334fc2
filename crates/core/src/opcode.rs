//! The Scatha instruction set.
//!
//! A program is a flat byte stream of `u8 [opcode], u8... [operands]`.
//! Operand layouts are grouped into classes; every opcode of a class has the
//! same total encoded size, so both the assembler and the dispatch loop can
//! advance the instruction pointer with a table lookup.
//!
//! Memory operands (`RM`/`MR` classes) are encoded in four bytes:
//! `base_reg: u8, index_reg: u8 (0xFF = none), scale: u8, inner_offset: u8`
//! and evaluate to `reg[base] + inner_offset` when no index register is
//! present, else `reg[base] + inner_offset + reg[index] * scale`.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Register index that marks an absent index register in a memory operand.
pub const NO_INDEX_REG: u8 = 0xFF;

/// Calling convention (all register indices are relative to the callee):
///
/// Arguments are passed in consecutive registers starting at index 0; the
/// return value comes back the same way. `call` shifts the register pointer
/// by its `reg_offset` operand and stashes the saved stack pointer, the
/// offset, and the return address in `R[-3]`, `R[-2]`, `R[-1]` of the callee
/// window. `ret` undoes all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // Function call and return
    /// `call (i32 dest_offset, u8 reg_offset)`
    Call,
    /// `ret ()`
    Ret,
    /// `callExt (u8 reg_offset, u8 slot, u16 index)`
    CallExt,
    /// Immediately terminates the program. `terminate ()`
    Terminate,

    // Stack frame
    /// `lincsp (u8 dest_reg, u16 byte_count)` — writes the current stack
    /// pointer to `dest_reg`, then bumps it by `byte_count`.
    LIncSP,

    // Loads and stores
    /// `mov64RR (u8 dest, u8 source)`
    Mov64RR,
    /// `mov64RV (u8 dest, u64 value)`
    Mov64RV,
    /// `mov8MR (MEMORY, u8 source)`
    Mov8MR,
    /// `mov16MR (MEMORY, u8 source)`
    Mov16MR,
    /// `mov32MR (MEMORY, u8 source)`
    Mov32MR,
    /// `mov64MR (MEMORY, u8 source)`
    Mov64MR,
    /// `mov8RM (u8 dest, MEMORY)`
    Mov8RM,
    /// `mov16RM (u8 dest, MEMORY)`
    Mov16RM,
    /// `mov32RM (u8 dest, MEMORY)`
    Mov32RM,
    /// `mov64RM (u8 dest, MEMORY)`
    Mov64RM,
    /// `lea (u8 dest, MEMORY)` — stores the evaluated address, not the value.
    Lea,

    // Conditional moves (consume the flag register)
    /// `cmoveRR (u8 dest, u8 source)` — move if the equal flag is set.
    CMoveRR,
    /// `cmoveRV (u8 dest, u64 value)`
    CMoveRV,

    // Jumps: executed by adding the i32 offset to the position of the jump
    // instruction itself.
    Jmp,
    Je,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,

    // Comparison: set the `less` and `equal` flags simultaneously.
    UCmpRR,
    ICmpRR,
    FCmpRR,
    UCmpRV,
    ICmpRV,
    FCmpRV,
    /// Compare the register against zero (signed).
    ITest,
    /// Compare the register against zero (unsigned).
    UTest,

    // Read comparison results into a register as 0 or 1.
    SetE,
    SetNE,
    SetL,
    SetLE,
    SetG,
    SetGE,

    // Unary operations, in place on one register.
    /// Logical not: `reg = reg == 0`.
    LNt,
    /// Bitwise not.
    BNt,
    /// Two's complement negation.
    Neg,
    /// Floating point negation.
    FNeg,

    // Integer arithmetic. The RR forms read both operands from registers and
    // store into the first; RV forms take a 64-bit immediate.
    AddRR,
    AddRV,
    SubRR,
    SubRV,
    MulRR,
    MulRV,
    UDivRR,
    UDivRV,
    IDivRR,
    IDivRV,
    URemRR,
    URemRV,
    IRemRR,
    IRemRV,

    // Floating point arithmetic (f64).
    FAddRR,
    FAddRV,
    FSubRR,
    FSubRV,
    FMulRR,
    FMulRV,
    FDivRR,
    FDivRV,

    // Bitshift; shift amounts are 8 bit immediates or registers.
    LslRR,
    LslRV,
    LsrRR,
    LsrRV,
    AsrRR,
    AsrRV,

    // Bitwise AND/OR/XOR.
    AndRR,
    AndRV,
    OrRR,
    OrRV,
    XorRR,
    XorRV,

    // Conversions, in place on one register.
    /// Sign extend from 8 bits.
    Sext8,
    /// Sign extend from 16 bits.
    Sext16,
    /// Sign extend from 32 bits.
    Sext32,
    /// Extend f32 to f64.
    Fext,
    /// Truncate f64 to f32.
    Ftrunc,
    S64ToF64,
    U64ToF64,
    F64ToS64,
    F64ToU64,
    S64ToF32,
    U64ToF32,
    F32ToS64,
    F32ToU64,
}

/// Operand layout classes. Every opcode belongs to exactly one class and all
/// opcodes of a class except `Other` share an encoded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCodeClass {
    /// (u8 reg, u8 reg)
    RR,
    /// (u8 reg, u8 value)
    RV8,
    /// (u8 reg, u32 value)
    RV32,
    /// (u8 reg, u64 value)
    RV64,
    /// (u8 reg, 4-byte memory operand)
    RM,
    /// (4-byte memory operand, u8 reg)
    MR,
    /// (u8 reg)
    R,
    /// (i32 offset)
    Jump,
    /// Variable layout (`call`, `callExt`, `lincsp`, `ret`, `terminate`)
    Other,
}

/// Classify an opcode by its operand layout.
pub const fn classify(code: OpCode) -> OpCodeClass {
    use OpCode::*;
    use OpCodeClass::*;
    match code {
        Call | Ret | CallExt | Terminate | LIncSP => Other,
        Mov64RR | CMoveRR | UCmpRR | ICmpRR | FCmpRR | AddRR | SubRR | MulRR | UDivRR
        | IDivRR | URemRR | IRemRR | FAddRR | FSubRR | FMulRR | FDivRR | LslRR | LsrRR
        | AsrRR | AndRR | OrRR | XorRR => RR,
        LslRV | LsrRV | AsrRV => RV8,
        Mov64RV | CMoveRV | UCmpRV | ICmpRV | FCmpRV | AddRV | SubRV | MulRV | UDivRV
        | IDivRV | URemRV | IRemRV | FAddRV | FSubRV | FMulRV | FDivRV | AndRV | OrRV
        | XorRV => RV64,
        Mov8RM | Mov16RM | Mov32RM | Mov64RM | Lea => RM,
        Mov8MR | Mov16MR | Mov32MR | Mov64MR => MR,
        ITest | UTest | SetE | SetNE | SetL | SetLE | SetG | SetGE | LNt | BNt | Neg | FNeg
        | Sext8 | Sext16 | Sext32 | Fext | Ftrunc | S64ToF64 | U64ToF64 | F64ToS64
        | F64ToU64 | S64ToF32 | U64ToF32 | F32ToS64 | F32ToU64 => R,
        Jmp | Je | Jne | Jl | Jle | Jg | Jge => Jump,
    }
}

/// Total encoded size of an instruction in bytes, opcode byte included.
pub const fn code_size(code: OpCode) -> usize {
    use OpCodeClass::*;
    match code {
        OpCode::Call => 1 + 4 + 1,
        OpCode::Ret | OpCode::Terminate => 1,
        OpCode::CallExt => 1 + 1 + 1 + 2,
        OpCode::LIncSP => 1 + 1 + 2,
        _ => match classify(code) {
            RR => 1 + 1 + 1,
            RV8 => 1 + 1 + 1,
            RV32 => 1 + 1 + 4,
            RV64 => 1 + 1 + 8,
            RM => 1 + 1 + 4,
            MR => 1 + 4 + 1,
            R => 1 + 1,
            Jump => 1 + 4,
            Other => unreachable!(),
        },
    }
}

/// `true` for `jmp` and the conditional jumps, which take an i32 label
/// operand resolved by the assembler.
pub const fn is_jump(code: OpCode) -> bool {
    matches!(classify(code), OpCodeClass::Jump)
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Call => "call",
            OpCode::Ret => "ret",
            OpCode::CallExt => "callExt",
            OpCode::Terminate => "terminate",
            OpCode::LIncSP => "lincsp",
            OpCode::Mov64RR => "mov64RR",
            OpCode::Mov64RV => "mov64RV",
            OpCode::Mov8MR => "mov8MR",
            OpCode::Mov16MR => "mov16MR",
            OpCode::Mov32MR => "mov32MR",
            OpCode::Mov64MR => "mov64MR",
            OpCode::Mov8RM => "mov8RM",
            OpCode::Mov16RM => "mov16RM",
            OpCode::Mov32RM => "mov32RM",
            OpCode::Mov64RM => "mov64RM",
            OpCode::Lea => "lea",
            OpCode::CMoveRR => "cmoveRR",
            OpCode::CMoveRV => "cmoveRV",
            OpCode::Jmp => "jmp",
            OpCode::Je => "je",
            OpCode::Jne => "jne",
            OpCode::Jl => "jl",
            OpCode::Jle => "jle",
            OpCode::Jg => "jg",
            OpCode::Jge => "jge",
            OpCode::UCmpRR => "ucmpRR",
            OpCode::ICmpRR => "icmpRR",
            OpCode::FCmpRR => "fcmpRR",
            OpCode::UCmpRV => "ucmpRV",
            OpCode::ICmpRV => "icmpRV",
            OpCode::FCmpRV => "fcmpRV",
            OpCode::ITest => "itest",
            OpCode::UTest => "utest",
            OpCode::SetE => "sete",
            OpCode::SetNE => "setne",
            OpCode::SetL => "setl",
            OpCode::SetLE => "setle",
            OpCode::SetG => "setg",
            OpCode::SetGE => "setge",
            OpCode::LNt => "lnt",
            OpCode::BNt => "bnt",
            OpCode::Neg => "neg",
            OpCode::FNeg => "fneg",
            OpCode::AddRR => "addRR",
            OpCode::AddRV => "addRV",
            OpCode::SubRR => "subRR",
            OpCode::SubRV => "subRV",
            OpCode::MulRR => "mulRR",
            OpCode::MulRV => "mulRV",
            OpCode::UDivRR => "udivRR",
            OpCode::UDivRV => "udivRV",
            OpCode::IDivRR => "idivRR",
            OpCode::IDivRV => "idivRV",
            OpCode::URemRR => "uremRR",
            OpCode::URemRV => "uremRV",
            OpCode::IRemRR => "iremRR",
            OpCode::IRemRV => "iremRV",
            OpCode::FAddRR => "faddRR",
            OpCode::FAddRV => "faddRV",
            OpCode::FSubRR => "fsubRR",
            OpCode::FSubRV => "fsubRV",
            OpCode::FMulRR => "fmulRR",
            OpCode::FMulRV => "fmulRV",
            OpCode::FDivRR => "fdivRR",
            OpCode::FDivRV => "fdivRV",
            OpCode::LslRR => "lslRR",
            OpCode::LslRV => "lslRV",
            OpCode::LsrRR => "lsrRR",
            OpCode::LsrRV => "lsrRV",
            OpCode::AsrRR => "asrRR",
            OpCode::AsrRV => "asrRV",
            OpCode::AndRR => "andRR",
            OpCode::AndRV => "andRV",
            OpCode::OrRR => "orRR",
            OpCode::OrRV => "orRV",
            OpCode::XorRR => "xorRR",
            OpCode::XorRV => "xorRV",
            OpCode::Sext8 => "sext8",
            OpCode::Sext16 => "sext16",
            OpCode::Sext32 => "sext32",
            OpCode::Fext => "fext",
            OpCode::Ftrunc => "ftrunc",
            OpCode::S64ToF64 => "s64tof64",
            OpCode::U64ToF64 => "u64tof64",
            OpCode::F64ToS64 => "f64tos64",
            OpCode::F64ToU64 => "f64tou64",
            OpCode::S64ToF32 => "s64tof32",
            OpCode::U64ToF32 => "u64tof32",
            OpCode::F32ToS64 => "f32tos64",
            OpCode::F32ToU64 => "f32tou64",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_u8() {
        let code = OpCode::FAddRR;
        let raw: u8 = code.into();
        assert_eq!(OpCode::try_from(raw), Ok(OpCode::FAddRR));
    }

    #[test]
    fn test_invalid_opcode_byte_rejected() {
        assert!(OpCode::try_from(0xFE).is_err());
    }

    #[test]
    fn test_code_sizes() {
        assert_eq!(code_size(OpCode::Ret), 1);
        assert_eq!(code_size(OpCode::Terminate), 1);
        assert_eq!(code_size(OpCode::Call), 6);
        assert_eq!(code_size(OpCode::CallExt), 5);
        assert_eq!(code_size(OpCode::LIncSP), 4);
        assert_eq!(code_size(OpCode::Mov64RR), 3);
        assert_eq!(code_size(OpCode::Mov64RV), 10);
        assert_eq!(code_size(OpCode::Mov64RM), 6);
        assert_eq!(code_size(OpCode::Mov64MR), 6);
        assert_eq!(code_size(OpCode::Jmp), 5);
        assert_eq!(code_size(OpCode::SetE), 2);
        assert_eq!(code_size(OpCode::LslRV), 3);
    }

    #[test]
    fn test_jump_classification() {
        assert!(is_jump(OpCode::Jmp));
        assert!(is_jump(OpCode::Jge));
        assert!(!is_jump(OpCode::Call));
        assert!(!is_jump(OpCode::Mov64RR));
    }
}

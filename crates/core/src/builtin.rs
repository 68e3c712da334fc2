//! Builtin foreign functions.
//!
//! Slot 0 of the VM's foreign function table is reserved for these; code
//! reaches them via `callExt 0, N` where `N` is the enum value. The compiler
//! pre-declares one intrinsic function entity per builtin, so the indices
//! below are part of the compiler/VM contract and must never be reordered.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Foreign function table slot reserved for builtins.
pub const BUILTIN_SLOT: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Builtin {
    // Common math functions, f64 -> f64 unless noted.
    Abs,
    Exp,
    Exp2,
    Exp10,
    Log,
    Log2,
    Log10,
    /// (f64, f64) -> f64
    Pow,
    Sqrt,
    Cbrt,
    /// (f64, f64) -> f64
    Hypot,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,

    // Memory
    /// (dest: ptr, source: ptr, size: u64)
    Memcpy,
    /// (size: u64, align: u64) -> (ptr, size)
    Alloc,
    /// (ptr, align: u64)
    Dealloc,

    // Console output
    Putchar,
    Puti64,
    Putf64,
    /// (data: ptr, size: u64)
    Putstr,

    // Formatter helpers called by lowered format-string operands. Each takes
    // a (ptr, size) string buffer in registers 0/1, appends a formatted
    // value, and returns the possibly reallocated (ptr, size) pair.
    FstringWritestr,
    FstringWriteptr,
    FstringWrites64,
    FstringWriteu64,
    FstringWritef64,
    FstringWritechar,
    FstringWritebool,

    /// Abort execution.
    Trap,
}

impl Builtin {
    /// All builtins in table order.
    pub fn all() -> impl Iterator<Item = Builtin> {
        (0..=u16::from(Builtin::Trap)).map(|i| Builtin::try_from(i).unwrap())
    }

    /// The name under which the compiler pre-declares this builtin, e.g.
    /// `__builtin_sqrt`.
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Abs => "__builtin_abs",
            Builtin::Exp => "__builtin_exp",
            Builtin::Exp2 => "__builtin_exp2",
            Builtin::Exp10 => "__builtin_exp10",
            Builtin::Log => "__builtin_log",
            Builtin::Log2 => "__builtin_log2",
            Builtin::Log10 => "__builtin_log10",
            Builtin::Pow => "__builtin_pow",
            Builtin::Sqrt => "__builtin_sqrt",
            Builtin::Cbrt => "__builtin_cbrt",
            Builtin::Hypot => "__builtin_hypot",
            Builtin::Sin => "__builtin_sin",
            Builtin::Cos => "__builtin_cos",
            Builtin::Tan => "__builtin_tan",
            Builtin::Asin => "__builtin_asin",
            Builtin::Acos => "__builtin_acos",
            Builtin::Atan => "__builtin_atan",
            Builtin::Memcpy => "__builtin_memcpy",
            Builtin::Alloc => "__builtin_alloc",
            Builtin::Dealloc => "__builtin_dealloc",
            Builtin::Putchar => "__builtin_putchar",
            Builtin::Puti64 => "__builtin_puti64",
            Builtin::Putf64 => "__builtin_putf64",
            Builtin::Putstr => "__builtin_putstr",
            Builtin::FstringWritestr => "__builtin_fstring_writestr",
            Builtin::FstringWriteptr => "__builtin_fstring_writeptr",
            Builtin::FstringWrites64 => "__builtin_fstring_writes64",
            Builtin::FstringWriteu64 => "__builtin_fstring_writeu64",
            Builtin::FstringWritef64 => "__builtin_fstring_writef64",
            Builtin::FstringWritechar => "__builtin_fstring_writechar",
            Builtin::FstringWritebool => "__builtin_fstring_writebool",
            Builtin::Trap => "__builtin_trap",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_order_is_stable() {
        assert_eq!(u16::from(Builtin::Abs), 0);
        assert_eq!(u16::from(Builtin::Memcpy), 17);
        assert_eq!(u16::from(Builtin::Putstr), 23);
        assert_eq!(u16::from(Builtin::Trap), 31);
    }

    #[test]
    fn test_all_covers_every_index() {
        let all: Vec<_> = Builtin::all().collect();
        assert_eq!(all.len(), 32);
        for (i, b) in all.iter().enumerate() {
            assert_eq!(u16::from(*b) as usize, i);
        }
    }

    #[test]
    fn test_names_are_prefixed() {
        for b in Builtin::all() {
            assert!(b.name().starts_with("__builtin_"));
        }
    }
}

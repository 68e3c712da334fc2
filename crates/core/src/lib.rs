//! Shared bytecode substrate for the Scatha toolchain.
//!
//! Everything both ends of the pipeline must agree on lives here: the
//! instruction set and its operand encodings, the program image layout, and
//! the table of builtin foreign functions occupying slot 0 of the VM's
//! foreign function table.

pub mod builtin;
pub mod opcode;
pub mod program;

pub use builtin::{Builtin, BUILTIN_SLOT};
pub use opcode::{code_size, OpCode, OpCodeClass};
pub use program::{ProgramHeader, ProgramView, GLOBAL_PROG_ID};

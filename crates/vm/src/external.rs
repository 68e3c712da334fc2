//! Foreign function dispatch and the slot-0 builtin table.
//!
//! A foreign function receives the VM and the base index of its register
//! window; arguments start at window register 0 and results are written back
//! starting there, mirroring the guest calling convention.

use scatha_core::builtin::{Builtin, BUILTIN_SLOT};

use crate::machine::VirtualMachine;
use crate::VmError;

pub type ExternalFunction = fn(&mut VirtualMachine, usize) -> Result<(), VmError>;

/// Install the builtin table into slot 0 of `vm`'s foreign function table.
pub fn install_builtins(vm: &mut VirtualMachine) {
    for builtin in Builtin::all() {
        vm.set_foreign_function(BUILTIN_SLOT, builtin.into(), dispatch_for(builtin));
    }
}

fn dispatch_for(builtin: Builtin) -> ExternalFunction {
    match builtin {
        Builtin::Abs => |vm, w| math1(vm, w, f64::abs),
        Builtin::Exp => |vm, w| math1(vm, w, f64::exp),
        Builtin::Exp2 => |vm, w| math1(vm, w, f64::exp2),
        Builtin::Exp10 => |vm, w| math1(vm, w, |x| 10f64.powf(x)),
        Builtin::Log => |vm, w| math1(vm, w, f64::ln),
        Builtin::Log2 => |vm, w| math1(vm, w, f64::log2),
        Builtin::Log10 => |vm, w| math1(vm, w, f64::log10),
        Builtin::Pow => |vm, w| math2(vm, w, f64::powf),
        Builtin::Sqrt => |vm, w| math1(vm, w, f64::sqrt),
        Builtin::Cbrt => |vm, w| math1(vm, w, f64::cbrt),
        Builtin::Hypot => |vm, w| math2(vm, w, f64::hypot),
        Builtin::Sin => |vm, w| math1(vm, w, f64::sin),
        Builtin::Cos => |vm, w| math1(vm, w, f64::cos),
        Builtin::Tan => |vm, w| math1(vm, w, f64::tan),
        Builtin::Asin => |vm, w| math1(vm, w, f64::asin),
        Builtin::Acos => |vm, w| math1(vm, w, f64::acos),
        Builtin::Atan => |vm, w| math1(vm, w, f64::atan),
        Builtin::Memcpy => |vm, w| {
            let dest = vm.register(w, 0);
            let source = vm.register(w, 1);
            let size = vm.register(w, 2);
            vm.memory_mut().copy(dest, source, size)
        },
        Builtin::Alloc => |vm, w| {
            let size = vm.register(w, 0);
            let align = vm.register(w, 1);
            let addr = vm.memory_mut().allocate(size, align.max(1));
            vm.set_register(w, 0, addr);
            vm.set_register(w, 1, size);
            Ok(())
        },
        Builtin::Dealloc => |vm, w| {
            let addr = vm.register(w, 0);
            let align = vm.register(w, 1);
            vm.memory_mut().deallocate(addr, align);
            Ok(())
        },
        Builtin::Putchar => |vm, w| {
            print!("{}", vm.register(w, 0) as u8 as char);
            Ok(())
        },
        Builtin::Puti64 => |vm, w| {
            print!("{}", vm.register(w, 0) as i64);
            Ok(())
        },
        Builtin::Putf64 => |vm, w| {
            print!("{}", f64::from_bits(vm.register(w, 0)));
            Ok(())
        },
        Builtin::Putstr => |vm, w| {
            let data = vm.register(w, 0);
            let size = vm.register(w, 1);
            let bytes = vm.memory().read(data, size as usize)?;
            print!("{}", String::from_utf8_lossy(bytes));
            Ok(())
        },
        Builtin::FstringWritestr => |vm, w| {
            let data = vm.register(w, 2);
            let size = vm.register(w, 3) as usize;
            let piece = vm.memory().read(data, size)?.to_vec();
            fstring_append(vm, w, &piece)
        },
        Builtin::FstringWriteptr => |vm, w| {
            let value = vm.register(w, 2);
            fstring_append(vm, w, format!("0x{:X}", value).as_bytes())
        },
        Builtin::FstringWrites64 => |vm, w| {
            let value = vm.register(w, 2) as i64;
            fstring_append(vm, w, value.to_string().as_bytes())
        },
        Builtin::FstringWriteu64 => |vm, w| {
            let value = vm.register(w, 2);
            fstring_append(vm, w, value.to_string().as_bytes())
        },
        Builtin::FstringWritef64 => |vm, w| {
            let value = f64::from_bits(vm.register(w, 2));
            fstring_append(vm, w, value.to_string().as_bytes())
        },
        Builtin::FstringWritechar => |vm, w| {
            let value = vm.register(w, 2) as u8;
            fstring_append(vm, w, &[value])
        },
        Builtin::FstringWritebool => |vm, w| {
            let value = vm.register(w, 2) != 0;
            fstring_append(vm, w, if value { b"true" } else { b"false" })
        },
        Builtin::Trap => |_, _| Err(VmError::Trapped),
    }
}

fn math1(vm: &mut VirtualMachine, w: usize, f: impl Fn(f64) -> f64) -> Result<(), VmError> {
    let x = f64::from_bits(vm.register(w, 0));
    vm.set_register(w, 0, f(x).to_bits());
    Ok(())
}

fn math2(vm: &mut VirtualMachine, w: usize, f: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
    let x = f64::from_bits(vm.register(w, 0));
    let y = f64::from_bits(vm.register(w, 1));
    vm.set_register(w, 0, f(x, y).to_bits());
    Ok(())
}

/// Shared tail of the formatter builtins: the buffer is a `(ptr, size)` pair
/// in window registers 0/1; the appended copy is written back there.
fn fstring_append(vm: &mut VirtualMachine, w: usize, piece: &[u8]) -> Result<(), VmError> {
    let buf = vm.register(w, 0);
    let size = vm.register(w, 1);
    let new_size = size + piece.len() as u64;
    let new_buf = vm.memory_mut().allocate(new_size.max(1), 8);
    if size > 0 {
        vm.memory_mut().copy(new_buf, buf, size)?;
    }
    vm.memory_mut().write(new_buf + size, piece)?;
    vm.set_register(w, 0, new_buf);
    vm.set_register(w, 1, new_size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::VmOptions;

    fn vm_with_memory() -> VirtualMachine {
        let mut vm = VirtualMachine::new(VmOptions::default());
        // A loaded-but-empty program so memory helpers are exercised the way
        // builtins see them.
        use scatha_core::program::ProgramHeader;
        let header = ProgramHeader::new(0, 0, 1);
        let mut image = Vec::new();
        header.write_to(&mut image);
        image.push(scatha_core::OpCode::Ret.into());
        vm.load_binary(&image).unwrap();
        vm
    }

    #[test]
    fn test_math_builtin_sqrt() {
        let mut vm = vm_with_memory();
        vm.set_register(0, 0, 9.0f64.to_bits());
        dispatch_for(Builtin::Sqrt)(&mut vm, 0).unwrap();
        assert_eq!(f64::from_bits(vm.register(0, 0)), 3.0);
    }

    #[test]
    fn test_alloc_returns_pointer_and_size() {
        let mut vm = vm_with_memory();
        vm.set_register(0, 0, 32);
        vm.set_register(0, 1, 8);
        dispatch_for(Builtin::Alloc)(&mut vm, 0).unwrap();
        let ptr = vm.register(0, 0);
        assert_ne!(ptr, 0);
        assert_eq!(vm.register(0, 1), 32);
        vm.memory_mut().store(ptr, 11, 8).unwrap();
    }

    #[test]
    fn test_memcpy_moves_bytes() {
        let mut vm = vm_with_memory();
        let src = vm.memory_mut().allocate(8, 8);
        let dst = vm.memory_mut().allocate(8, 8);
        vm.memory_mut().store(src, 0xABCD, 8).unwrap();
        vm.set_register(0, 0, dst);
        vm.set_register(0, 1, src);
        vm.set_register(0, 2, 8);
        dispatch_for(Builtin::Memcpy)(&mut vm, 0).unwrap();
        assert_eq!(vm.memory().load(dst, 8).unwrap(), 0xABCD);
    }

    #[test]
    fn test_fstring_append_grows_buffer() {
        let mut vm = vm_with_memory();
        vm.set_register(0, 0, 0);
        vm.set_register(0, 1, 0);
        vm.set_register(0, 2, 42);
        dispatch_for(Builtin::FstringWrites64)(&mut vm, 0).unwrap();
        let (ptr, size) = (vm.register(0, 0), vm.register(0, 1));
        assert_eq!(vm.memory().read(ptr, size as usize).unwrap(), b"42");

        vm.set_register(0, 2, 1); // '\x01' -> bool true
        dispatch_for(Builtin::FstringWritebool)(&mut vm, 0).unwrap();
        let (ptr, size) = (vm.register(0, 0), vm.register(0, 1));
        assert_eq!(vm.memory().read(ptr, size as usize).unwrap(), b"42true");
    }

    #[test]
    fn test_trap_aborts() {
        let mut vm = vm_with_memory();
        assert_eq!(dispatch_for(Builtin::Trap)(&mut vm, 0), Err(VmError::Trapped));
    }
}

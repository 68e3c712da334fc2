//! Host / VM reentrancy and frame discipline.

use scatha_core::opcode::OpCode;
use scatha_core::program::ProgramHeader;
use scatha_vm::{VirtualMachine, VmError};

fn op(code: OpCode) -> u8 {
    code.into()
}

fn image(text: &[u8]) -> Vec<u8> {
    let header = ProgramHeader::new(0, 0, text.len() as u64);
    let mut out = Vec::new();
    header.write_to(&mut out);
    out.extend_from_slice(text);
    out
}

/// The guest calls a foreign function which re-enters the VM with new
/// arguments; the inner run's result flows back through the host.
#[test]
fn test_foreign_function_reenters_vm() {
    // Program: R0 holds n. If a marker in R1 is set, just double R0 and
    // return. Otherwise call foreign (1, 0) which re-enters with the marker.
    let mut text = Vec::new();
    // utest R1; jne +<to double>
    text.push(op(OpCode::UTest));
    text.push(1);
    let jne_pos = text.len();
    text.push(op(OpCode::Jne));
    text.extend_from_slice(&0i32.to_le_bytes());
    // callExt regOffset=8, slot=1, index=0; then ret (result in R8 -> R0)
    text.push(op(OpCode::CallExt));
    text.extend_from_slice(&[8, 1, 0, 0]);
    text.push(op(OpCode::Mov64RR));
    text.extend_from_slice(&[0, 8]);
    text.push(op(OpCode::Ret));
    // double: R0 *= 2; ret
    let double_pos = text.len();
    let rel = (double_pos - jne_pos) as i32;
    text[jne_pos + 1..jne_pos + 5].copy_from_slice(&rel.to_le_bytes());
    text.push(op(OpCode::MulRV));
    text.push(0);
    text.extend_from_slice(&2u64.to_le_bytes());
    text.push(op(OpCode::Ret));

    let mut vm = VirtualMachine::default();
    vm.set_foreign_function(1, 0, |vm, window| {
        // Re-enter the VM: run the program again with the marker set.
        let doubled = vm.execute_at(0, &[21, 1])?;
        vm.set_register(window, 0, doubled);
        Ok(())
    });
    vm.load_binary(&image(&text)).unwrap();
    assert_eq!(vm.execute(&[0, 0]).unwrap(), 42);
}

#[test]
fn test_stack_pointer_restored_after_execute() {
    // lincsp allocates; ret must restore the frame's stack pointer, so a
    // second run sees the same stack base.
    let mut text = Vec::new();
    text.push(op(OpCode::LIncSP));
    text.push(0);
    text.extend_from_slice(&64u16.to_le_bytes());
    text.push(op(OpCode::Ret));

    let mut vm = VirtualMachine::default();
    vm.load_binary(&image(&text)).unwrap();
    let first = vm.execute(&[]).unwrap();
    let second = vm.execute(&[]).unwrap();
    assert_eq!(first, second, "both runs allocate from the same stack base");
}

#[test]
fn test_unknown_foreign_function_reported() {
    let mut text = Vec::new();
    text.push(op(OpCode::CallExt));
    text.extend_from_slice(&[0, 7, 9, 0]);
    text.push(op(OpCode::Ret));
    let mut vm = VirtualMachine::default();
    vm.load_binary(&image(&text)).unwrap();
    assert_eq!(
        vm.execute(&[]),
        Err(VmError::UnknownForeignFunction { slot: 7, index: 9 })
    );
}

// Instruction encoding tests

use super::*;
use crate::opcodes::{one_op, two_op, var, zero_op};

#[test]
fn zero_op_short_form() {
    let mut rb = RoutineBuilder::new();
    rb.emit(OpFamily::Op0, zero_op::QUIT, &[], None, None).unwrap();
    assert_eq!(rb.code, vec![0xBA]);
}

#[test]
fn one_op_type_in_bits_4_5() {
    let mut rb = RoutineBuilder::new();
    rb.emit(
        OpFamily::Op1,
        one_op::JZ,
        &[Operand::Variable(5)],
        None,
        Some(Branch {
            target: BranchTarget::ReturnTrue,
            on_true: true,
        }),
    )
    .unwrap();
    // 0x80 | (variable type 2 << 4) | 0x00, operand, branch rtrue
    assert_eq!(rb.code, vec![0xA0, 0x05, 0xC1]);
}

#[test]
fn two_op_long_form_small_constants() {
    let mut rb = RoutineBuilder::new();
    rb.emit(
        OpFamily::Op2,
        two_op::ADD,
        &[Operand::SmallConstant(1), Operand::SmallConstant(2)],
        Some(0),
        None,
    )
    .unwrap();
    // long form: opcode 0x14, both small constants, store to stack
    assert_eq!(rb.code, vec![0x14, 0x01, 0x02, 0x00]);
}

#[test]
fn two_op_long_form_variable_bits() {
    let mut rb = RoutineBuilder::new();
    rb.emit(
        OpFamily::Op2,
        two_op::ADD,
        &[Operand::Variable(1), Operand::SmallConstant(2)],
        Some(0),
        None,
    )
    .unwrap();
    assert_eq!(rb.code, vec![0x54, 0x01, 0x02, 0x00]);
}

#[test]
fn two_op_large_constant_forces_variable_form() {
    let mut rb = RoutineBuilder::new();
    rb.emit(
        OpFamily::Op2,
        two_op::ADD,
        &[Operand::LargeConstant(1000), Operand::SmallConstant(2)],
        Some(0),
        None,
    )
    .unwrap();
    // 0xC0|0x14, type byte (large, small, omitted, omitted), operands
    assert_eq!(rb.code, vec![0xD4, 0x1F, 0x03, 0xE8, 0x02, 0x00]);
}

#[test]
fn je_with_three_operands_uses_var_form_of_2op() {
    let mut rb = RoutineBuilder::new();
    rb.emit(
        OpFamily::Op2,
        two_op::JE,
        &[
            Operand::Variable(1),
            Operand::SmallConstant(2),
            Operand::SmallConstant(3),
        ],
        None,
        Some(Branch {
            target: BranchTarget::ReturnFalse,
            on_true: false,
        }),
    )
    .unwrap();
    // 0xC1, types var/small/small/omitted = 0b10_01_01_11
    assert_eq!(rb.code, vec![0xC1, 0x97, 0x01, 0x02, 0x03, 0x40]);
}

#[test]
fn var_form_call() {
    let mut rb = RoutineBuilder::new();
    rb.emit(
        OpFamily::Var,
        var::CALL_VS,
        &[Operand::LargeConstant(0x1234)],
        Some(0),
        None,
    )
    .unwrap();
    // 0xE0, types large/omitted/omitted/omitted = 0b00_11_11_11
    assert_eq!(rb.code, vec![0xE0, 0x3F, 0x12, 0x34, 0x00]);
}

#[test]
fn double_var_uses_two_type_bytes() {
    let mut rb = RoutineBuilder::new();
    let operands: Vec<Operand> = (0..6).map(|i| Operand::SmallConstant(i as u8)).collect();
    rb.emit(OpFamily::VarDouble, var::CALL_VS2, &operands, Some(0), None)
        .unwrap();
    assert_eq!(rb.code[0], 0xEC);
    // 6 small constants then omitted: 01 01 01 01 / 01 01 11 11
    assert_eq!(rb.code[1], 0b01_01_01_01);
    assert_eq!(rb.code[2], 0b01_01_11_11);
    assert_eq!(rb.code.len(), 1 + 2 + 6 + 1);
}

#[test]
fn encoded_byte_rejected_as_opcode() {
    let mut rb = RoutineBuilder::new();
    assert!(rb
        .emit(OpFamily::Op1, 0x8D, &[Operand::LargeConstant(0)], None, None)
        .is_err());
}

#[test]
fn branch_to_label_backpatches_long_form() {
    let mut rb = RoutineBuilder::new();
    let label = rb.new_label();
    rb.emit(
        OpFamily::Op1,
        one_op::JZ,
        &[Operand::Variable(1)],
        None,
        Some(Branch {
            target: BranchTarget::Label(label),
            on_true: true,
        }),
    )
    .unwrap();
    rb.emit(OpFamily::Op0, zero_op::RTRUE, &[], None, None).unwrap();
    rb.place_label(label);
    rb.emit(OpFamily::Op0, zero_op::RFALSE, &[], None, None).unwrap();
    rb.finish().unwrap();

    // Branch data at offset 2: target is the rfalse at offset 5.
    // offset = 5 - (2 + 2) + 2 = 3
    assert_eq!(rb.code[2], 0x80);
    assert_eq!(rb.code[3], 3);
}

#[test]
fn backward_jump_offset_is_negative() {
    let mut rb = RoutineBuilder::new();
    let top = rb.new_label();
    rb.place_label(top);
    rb.emit(OpFamily::Op0, zero_op::NOP, &[], None, None).unwrap();
    rb.emit_jump(top);
    rb.finish().unwrap();

    // jump operand at offset 2; target 0; offset = 0 - 4 + 2 = -2
    assert_eq!(rb.code[1], 0x8C);
    let operand = ((rb.code[2] as u16) << 8) | rb.code[3] as u16;
    assert_eq!(operand as i16, -2);
}

#[test]
fn print_paddr_placeholder_records_relocation() {
    let mut rb = RoutineBuilder::new();
    rb.emit_print_paddr_placeholder("Hello");
    assert_eq!(rb.code[0], 0x8D);
    assert_eq!(rb.relocations.len(), 1);
    assert_eq!(rb.relocations[0].offset, 1);
}

#[test]
fn unplaced_label_is_an_error() {
    let mut rb = RoutineBuilder::new();
    let label = rb.new_label();
    rb.emit_jump(label);
    assert!(rb.finish().is_err());
}

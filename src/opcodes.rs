//! Z-Machine opcode constants.
//!
//! These are RAW opcode numbers, not encoded instruction bytes: the
//! emitter picks the instruction form (long, short, variable) and folds
//! the number into the encoding. The same raw number means different
//! instructions in different operand-count families, so the constants
//! are grouped by family.

/// 0OP opcodes (short form, encoded 0xB0-0xBF).
pub mod zero_op {
    pub const RTRUE: u8 = 0x00;
    pub const RFALSE: u8 = 0x01;
    /// print - literal Z-string follows the opcode
    pub const PRINT: u8 = 0x02;
    /// print_ret - literal string, newline, return true
    pub const PRINT_RET: u8 = 0x03;
    pub const NOP: u8 = 0x04;
    pub const SAVE: u8 = 0x05;
    pub const RESTORE: u8 = 0x06;
    pub const RESTART: u8 = 0x07;
    pub const RET_POPPED: u8 = 0x08;
    /// pop (V1-4) / catch (V5+)
    pub const POP: u8 = 0x09;
    pub const QUIT: u8 = 0x0A;
    pub const NEW_LINE: u8 = 0x0B;
    /// show_status (V3 only)
    pub const SHOW_STATUS: u8 = 0x0C;
    pub const VERIFY: u8 = 0x0D;
}

/// 1OP opcodes (short form, encoded 0x80-0xAF).
pub mod one_op {
    pub const JZ: u8 = 0x00;
    pub const GET_SIBLING: u8 = 0x01;
    pub const GET_CHILD: u8 = 0x02;
    pub const GET_PARENT: u8 = 0x03;
    pub const GET_PROP_LEN: u8 = 0x04;
    pub const INC: u8 = 0x05;
    pub const DEC: u8 = 0x06;
    pub const PRINT_ADDR: u8 = 0x07;
    /// call_1s (V4+)
    pub const CALL_1S: u8 = 0x08;
    pub const REMOVE_OBJ: u8 = 0x09;
    pub const PRINT_OBJ: u8 = 0x0A;
    pub const RET: u8 = 0x0B;
    pub const JUMP: u8 = 0x0C;
    pub const PRINT_PADDR: u8 = 0x0D;
    pub const LOAD: u8 = 0x0E;
    /// not (V1-4) / call_1n (V5+)
    pub const NOT: u8 = 0x0F;
    pub const CALL_1N: u8 = 0x0F;
}

/// 2OP opcodes (long form 0x00-0x7F or variable form 0xC0-0xDF).
pub mod two_op {
    pub const JE: u8 = 0x01;
    pub const JL: u8 = 0x02;
    pub const JG: u8 = 0x03;
    pub const DEC_CHK: u8 = 0x04;
    pub const INC_CHK: u8 = 0x05;
    pub const JIN: u8 = 0x06;
    pub const TEST: u8 = 0x07;
    pub const OR: u8 = 0x08;
    pub const AND: u8 = 0x09;
    pub const TEST_ATTR: u8 = 0x0A;
    pub const SET_ATTR: u8 = 0x0B;
    pub const CLEAR_ATTR: u8 = 0x0C;
    pub const STORE: u8 = 0x0D;
    pub const INSERT_OBJ: u8 = 0x0E;
    pub const LOADW: u8 = 0x0F;
    pub const LOADB: u8 = 0x10;
    pub const GET_PROP: u8 = 0x11;
    pub const GET_PROP_ADDR: u8 = 0x12;
    pub const GET_NEXT_PROP: u8 = 0x13;
    pub const ADD: u8 = 0x14;
    pub const SUB: u8 = 0x15;
    pub const MUL: u8 = 0x16;
    pub const DIV: u8 = 0x17;
    pub const MOD: u8 = 0x18;
    /// call_2s (V4+)
    pub const CALL_2S: u8 = 0x19;
    /// call_2n (V5+)
    pub const CALL_2N: u8 = 0x1A;
    pub const SET_COLOUR: u8 = 0x1B;
    pub const THROW: u8 = 0x1C;
}

/// VAR opcodes (variable form, encoded 0xE0-0xFF).
pub mod var {
    /// call (V1-3) / call_vs (V4+) - store
    pub const CALL_VS: u8 = 0x00;
    pub const STOREW: u8 = 0x01;
    pub const STOREB: u8 = 0x02;
    pub const PUT_PROP: u8 = 0x03;
    /// sread (V1-4) / aread (V5+)
    pub const SREAD: u8 = 0x04;
    pub const PRINT_CHAR: u8 = 0x05;
    pub const PRINT_NUM: u8 = 0x06;
    pub const RANDOM: u8 = 0x07;
    pub const PUSH: u8 = 0x08;
    pub const PULL: u8 = 0x09;
    pub const SPLIT_WINDOW: u8 = 0x0A;
    pub const SET_WINDOW: u8 = 0x0B;
    /// call_vs2 (V4+) - up to 7 arguments, two operand-type bytes
    pub const CALL_VS2: u8 = 0x0C;
    pub const ERASE_WINDOW: u8 = 0x0D;
    pub const ERASE_LINE: u8 = 0x0E;
    pub const SET_CURSOR: u8 = 0x0F;
    pub const GET_CURSOR: u8 = 0x10;
    pub const SET_TEXT_STYLE: u8 = 0x11;
    pub const BUFFER_MODE: u8 = 0x12;
    pub const OUTPUT_STREAM: u8 = 0x13;
    pub const INPUT_STREAM: u8 = 0x14;
    pub const SOUND_EFFECT: u8 = 0x15;
    /// read_char (V4+)
    pub const READ_CHAR: u8 = 0x16;
    /// scan_table (V4+)
    pub const SCAN_TABLE: u8 = 0x17;
    /// call_vn (V5+)
    pub const CALL_VN: u8 = 0x19;
    /// call_vn2 (V5+) - up to 7 arguments, no store
    pub const CALL_VN2: u8 = 0x1A;
    /// tokenise (V5+)
    pub const TOKENISE: u8 = 0x1B;
    /// check_arg_count (V5+)
    pub const CHECK_ARG_COUNT: u8 = 0x1F;
}

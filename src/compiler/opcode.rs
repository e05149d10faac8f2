// Quill Bytecode Instructions

use std::fmt;

/// Bytecode operation codes. The discriminants are part of the binary format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0,
    Data = 1, // Static variable table entry (not executable)
    PutAddr = 2,
    PutIndAddr = 3,    // u8 index count; pops indexes and an array address
    PutMemberAddr = 4, // Reserved, executes as a no-op
    PutInt = 5,
    PutFloat = 6,
    PutString = 7,
    PutBoolean = 8,

    // Assignment through an address
    Move = 9,
    MoveAdd = 10,
    MoveSubtr = 11,
    MoveMul = 12,
    MoveDiv = 13,

    // Comparison operations
    Equal = 14,
    NotEqual = 15,
    LessEqual = 16,
    GreaterEqual = 17,
    Less = 18,
    Greater = 19,

    // Control flow
    JumpIfFalse = 20,
    Jump = 21,

    // Arithmetic operations
    Mul = 22,
    Div = 23,
    Add = 24,
    Sub = 25,
    Neg = 26,

    End = 27,
    Call = 28,
    Fun = 29, // Function table entry (not executable)
    Syscall = 30,
    Return = 31,
    InitVar = 32,
    PutDAddr = 33,
    AllocVar = 34,
    DData = 35, // Dynamic variable table entry (not executable)
    AllocVars = 36,
}

impl OpCode {
    /// Get the number of fixed-width operand bytes following the opcode.
    /// `PutString` and `Syscall` additionally carry a zero-terminated name.
    pub fn operand_count(&self) -> usize {
        match self {
            OpCode::PutAddr
            | OpCode::PutDAddr
            | OpCode::Call
            | OpCode::AllocVar
            | OpCode::AllocVars
            | OpCode::InitVar
            | OpCode::Return
            | OpCode::PutMemberAddr
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::Syscall => 4,

            OpCode::PutInt => 8,
            OpCode::PutFloat => 12,
            OpCode::PutBoolean | OpCode::PutIndAddr => 1,

            _ => 0,
        }
    }

    /// Table entries share the opcode space but never appear in executable code
    pub fn is_table_entry(&self) -> bool {
        matches!(self, OpCode::Data | OpCode::DData | OpCode::Fun)
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Nop => "NOP",
            OpCode::Data => "DATA",
            OpCode::PutAddr => "PUTADDR",
            OpCode::PutIndAddr => "PUTINDADDR",
            OpCode::PutMemberAddr => "PUTMEMBERADDR",
            OpCode::PutInt => "PUTINT",
            OpCode::PutFloat => "PUTFLOAT",
            OpCode::PutString => "PUTSTRING",
            OpCode::PutBoolean => "PUTBOOLEAN",
            OpCode::Move => "MOVE",
            OpCode::MoveAdd => "MOVEADD",
            OpCode::MoveSubtr => "MOVESUBTR",
            OpCode::MoveMul => "MOVEMUL",
            OpCode::MoveDiv => "MOVEDIV",
            OpCode::Equal => "EQUAL",
            OpCode::NotEqual => "NOTEQUAL",
            OpCode::LessEqual => "LESSEQUAL",
            OpCode::GreaterEqual => "GREATEREQUAL",
            OpCode::Less => "LESS",
            OpCode::Greater => "GREATER",
            OpCode::JumpIfFalse => "JUMPIFFALSE",
            OpCode::Jump => "JUMP",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Neg => "NEG",
            OpCode::End => "END",
            OpCode::Call => "CALL",
            OpCode::Fun => "FUN",
            OpCode::Syscall => "SYSCALL",
            OpCode::Return => "RETURN",
            OpCode::InitVar => "INITVAR",
            OpCode::PutDAddr => "PUTDADDR",
            OpCode::AllocVar => "ALLOCVAR",
            OpCode::DData => "DDATA",
            OpCode::AllocVars => "ALLOCVARS",
        }
    }

    pub fn from_name(name: &str) -> Option<OpCode> {
        (0..=OpCode::AllocVars as u8)
            .filter_map(|byte| OpCode::try_from(byte).ok())
            .find(|op| op.name() == name)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        let op = match byte {
            0 => OpCode::Nop,
            1 => OpCode::Data,
            2 => OpCode::PutAddr,
            3 => OpCode::PutIndAddr,
            4 => OpCode::PutMemberAddr,
            5 => OpCode::PutInt,
            6 => OpCode::PutFloat,
            7 => OpCode::PutString,
            8 => OpCode::PutBoolean,
            9 => OpCode::Move,
            10 => OpCode::MoveAdd,
            11 => OpCode::MoveSubtr,
            12 => OpCode::MoveMul,
            13 => OpCode::MoveDiv,
            14 => OpCode::Equal,
            15 => OpCode::NotEqual,
            16 => OpCode::LessEqual,
            17 => OpCode::GreaterEqual,
            18 => OpCode::Less,
            19 => OpCode::Greater,
            20 => OpCode::JumpIfFalse,
            21 => OpCode::Jump,
            22 => OpCode::Mul,
            23 => OpCode::Div,
            24 => OpCode::Add,
            25 => OpCode::Sub,
            26 => OpCode::Neg,
            27 => OpCode::End,
            28 => OpCode::Call,
            29 => OpCode::Fun,
            30 => OpCode::Syscall,
            31 => OpCode::Return,
            32 => OpCode::InitVar,
            33 => OpCode::PutDAddr,
            34 => OpCode::AllocVar,
            35 => OpCode::DData,
            36 => OpCode::AllocVars,
            other => return Err(other),
        };
        Ok(op)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_byte_mapping() {
        for byte in 0..=36u8 {
            let op = OpCode::try_from(byte).unwrap();
            assert_eq!(u8::from(op), byte);
            assert_eq!(OpCode::from_name(op.name()), Some(op));
        }
        assert_eq!(OpCode::try_from(37), Err(37));
    }

    #[test]
    fn test_table_entries() {
        assert!(OpCode::Data.is_table_entry());
        assert!(OpCode::DData.is_table_entry());
        assert!(OpCode::Fun.is_table_entry());
        assert!(!OpCode::Call.is_table_entry());
    }
}

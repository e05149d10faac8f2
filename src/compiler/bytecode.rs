// Quill Bytecode Container
// Instruction encoders, relocatable concatenation, decoding and disassembly

use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use super::opcode::OpCode;
use super::types::{join_types, Type};
use crate::error::ExecError;

/// Kind of a variable-table entry, named after the table opcodes
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    /// `DATA`: static storage for the whole run
    Data,
    /// `DDATA`: a slot in the active call frame
    DData,
    /// `FUN`: a function; `code` is the entry offset
    Fun { params: Vec<Type>, code: u32 },
}

/// Runtime descriptor of one declared symbol
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    pub kind: EntryKind,
    pub name: String,
    pub scope: String,
    pub ty: Type,
}

impl TableEntry {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.scope, self.name)
    }
}

/// `(variable index, code offset)` pair patched into the function table after linking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionRef {
    pub variable: usize,
    pub offset: usize,
}

/// A relocatable unit of code plus the variable table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub variables: Vec<TableEntry>,
    pub code: Vec<u8>,
    /// Offsets of every embedded 4-byte code address
    jumps: Vec<usize>,
    function_refs: Vec<FunctionRef>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    pub fn jumps(&self) -> &[usize] {
        &self.jumps
    }

    pub fn function_refs(&self) -> &[FunctionRef] {
        &self.function_refs
    }

    pub fn add_jump(&mut self, operand_offset: usize) {
        self.jumps.push(operand_offset);
    }

    pub fn add_function(&mut self, variable: usize, offset: usize) {
        self.function_refs.push(FunctionRef { variable, offset });
    }

    /// Overwrite the 4-byte little-endian value at `pos`
    pub fn set_address(&mut self, pos: usize, value: u32) {
        self.code[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a 4-byte little-endian value at `pos`
    pub fn read_u32(&self, pos: usize) -> Option<u32> {
        let bytes = self.code.get(pos..pos + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn write_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn write_cstr(&mut self, s: &str) {
        self.code.extend_from_slice(s.as_bytes());
        self.code.push(0);
    }

    // ==================== Encoders ====================
    // Every encoder returns the offset of its opcode byte.

    /// Emit an operand-less instruction
    pub fn emit(&mut self, op: OpCode) -> usize {
        debug_assert_eq!(op.operand_count(), 0, "{} carries operands", op);
        let offset = self.code.len();
        self.code.push(op.into());
        offset
    }

    fn emit_index(&mut self, op: OpCode, idx: u32) -> usize {
        let offset = self.code.len();
        self.code.push(op.into());
        self.write_u32(idx);
        offset
    }

    pub fn put_addr(&mut self, idx: u32) -> usize {
        self.emit_index(OpCode::PutAddr, idx)
    }

    pub fn put_daddr(&mut self, idx: u32) -> usize {
        self.emit_index(OpCode::PutDAddr, idx)
    }

    pub fn put_member_addr(&mut self, idx: u32) -> usize {
        self.emit_index(OpCode::PutMemberAddr, idx)
    }

    pub fn call(&mut self, idx: u32) -> usize {
        self.emit_index(OpCode::Call, idx)
    }

    pub fn ret(&mut self, idx: u32) -> usize {
        self.emit_index(OpCode::Return, idx)
    }

    pub fn init_var(&mut self, idx: u32) -> usize {
        self.emit_index(OpCode::InitVar, idx)
    }

    pub fn alloc_var(&mut self, idx: u32) -> usize {
        self.emit_index(OpCode::AllocVar, idx)
    }

    pub fn alloc_vars(&mut self, idx: u32) -> usize {
        self.emit_index(OpCode::AllocVars, idx)
    }

    pub fn put_ind_addr(&mut self, count: u8) -> usize {
        let offset = self.code.len();
        self.code.push(OpCode::PutIndAddr.into());
        self.code.push(count);
        offset
    }

    pub fn put_int(&mut self, value: i64) -> usize {
        let offset = self.code.len();
        self.code.push(OpCode::PutInt.into());
        self.code.extend_from_slice(&value.to_le_bytes());
        offset
    }

    /// 12-byte payload: binary64 little-endian plus 4 bytes of zero padding
    pub fn put_float(&mut self, value: f64) -> usize {
        let offset = self.code.len();
        self.code.push(OpCode::PutFloat.into());
        self.code.extend_from_slice(&value.to_le_bytes());
        self.code.extend_from_slice(&[0; 4]);
        offset
    }

    pub fn put_string(&mut self, value: &str) -> usize {
        let offset = self.code.len();
        self.code.push(OpCode::PutString.into());
        self.write_cstr(value);
        offset
    }

    pub fn put_boolean(&mut self, value: bool) -> usize {
        let offset = self.code.len();
        self.code.push(OpCode::PutBoolean.into());
        self.code.push(value as u8);
        offset
    }

    /// Unconditional jump; the target operand is registered for relocation
    pub fn jump(&mut self, target: u32) -> usize {
        let offset = self.emit_index(OpCode::Jump, target);
        self.add_jump(offset + 1);
        offset
    }

    pub fn jump_if_false(&mut self, target: u32) -> usize {
        let offset = self.emit_index(OpCode::JumpIfFalse, target);
        self.add_jump(offset + 1);
        offset
    }

    pub fn syscall(&mut self, param_idx: u32, name: &str) -> usize {
        let offset = self.emit_index(OpCode::Syscall, param_idx);
        self.write_cstr(name);
        offset
    }

    /// Encode a decoded instruction again. Jump targets are registered for relocation.
    pub fn push_instruction(&mut self, instruction: &Instruction) -> usize {
        use Instruction as I;
        match instruction {
            I::PutAddr(idx) => self.put_addr(*idx),
            I::PutDAddr(idx) => self.put_daddr(*idx),
            I::PutMemberAddr(idx) => self.put_member_addr(*idx),
            I::Call(idx) => self.call(*idx),
            I::Return(idx) => self.ret(*idx),
            I::InitVar(idx) => self.init_var(*idx),
            I::AllocVar(idx) => self.alloc_var(*idx),
            I::AllocVars(idx) => self.alloc_vars(*idx),
            I::PutIndAddr(count) => self.put_ind_addr(*count),
            I::PutInt(v) => self.put_int(*v),
            I::PutFloat(v) => self.put_float(*v),
            I::PutString(s) => self.put_string(s),
            I::PutBoolean(b) => self.put_boolean(*b),
            I::Jump(target) => self.jump(*target),
            I::JumpIfFalse(target) => self.jump_if_false(*target),
            I::Syscall(idx, name) => self.syscall(*idx, name),
            other => self.emit(other.opcode()),
        }
    }

    // ==================== Variable table ====================

    pub fn data(&mut self, name: &str, scope: &str, ty: Type) -> usize {
        self.push_entry(EntryKind::Data, name, scope, ty)
    }

    pub fn ddata(&mut self, name: &str, scope: &str, ty: Type) -> usize {
        self.push_entry(EntryKind::DData, name, scope, ty)
    }

    pub fn fun(&mut self, name: &str, scope: &str, ty: Type, params: Vec<Type>, code: u32) -> usize {
        self.push_entry(EntryKind::Fun { params, code }, name, scope, ty)
    }

    fn push_entry(&mut self, kind: EntryKind, name: &str, scope: &str, ty: Type) -> usize {
        self.variables.push(TableEntry {
            kind,
            name: name.to_string(),
            scope: scope.to_string(),
            ty,
        });
        self.variables.len() - 1
    }

    // ==================== Decoding ====================

    /// Decode the instruction at `offset`, returning it with the offset of the next one
    pub fn decode(&self, offset: usize) -> Result<(Instruction, usize), ExecError> {
        let byte = *self.code.get(offset).ok_or(ExecError::InvalidInstruction)?;
        let op = OpCode::try_from(byte).map_err(|_| ExecError::InvalidInstruction)?;
        let operands = offset + 1;
        let mut next = operands + op.operand_count();
        let fixed = self
            .code
            .get(operands..next)
            .ok_or(ExecError::InvalidInstruction)?;
        let index = || u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);

        let instruction = match op {
            OpCode::Data | OpCode::DData | OpCode::Fun => {
                return Err(ExecError::InvalidInstruction)
            }
            OpCode::Nop => Instruction::Nop,
            OpCode::PutAddr => Instruction::PutAddr(index()),
            OpCode::PutDAddr => Instruction::PutDAddr(index()),
            OpCode::PutMemberAddr => Instruction::PutMemberAddr(index()),
            OpCode::Call => Instruction::Call(index()),
            OpCode::Return => Instruction::Return(index()),
            OpCode::InitVar => Instruction::InitVar(index()),
            OpCode::AllocVar => Instruction::AllocVar(index()),
            OpCode::AllocVars => Instruction::AllocVars(index()),
            OpCode::Jump => Instruction::Jump(index()),
            OpCode::JumpIfFalse => Instruction::JumpIfFalse(index()),
            OpCode::PutIndAddr => Instruction::PutIndAddr(fixed[0]),
            OpCode::PutBoolean => Instruction::PutBoolean(fixed[0] != 0),
            OpCode::PutInt => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(fixed);
                Instruction::PutInt(i64::from_le_bytes(bytes))
            }
            OpCode::PutFloat => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&fixed[..8]);
                Instruction::PutFloat(f64::from_le_bytes(bytes))
            }
            OpCode::PutString => {
                let (s, after) = self.read_cstr(operands)?;
                next = after;
                Instruction::PutString(s)
            }
            OpCode::Syscall => {
                let idx = index();
                let (name, after) = self.read_cstr(next)?;
                next = after;
                Instruction::Syscall(idx, name)
            }
            OpCode::Move => Instruction::Move,
            OpCode::MoveAdd => Instruction::MoveAdd,
            OpCode::MoveSubtr => Instruction::MoveSubtr,
            OpCode::MoveMul => Instruction::MoveMul,
            OpCode::MoveDiv => Instruction::MoveDiv,
            OpCode::Equal => Instruction::Equal,
            OpCode::NotEqual => Instruction::NotEqual,
            OpCode::LessEqual => Instruction::LessEqual,
            OpCode::GreaterEqual => Instruction::GreaterEqual,
            OpCode::Less => Instruction::Less,
            OpCode::Greater => Instruction::Greater,
            OpCode::Mul => Instruction::Mul,
            OpCode::Div => Instruction::Div,
            OpCode::Add => Instruction::Add,
            OpCode::Sub => Instruction::Sub,
            OpCode::Neg => Instruction::Neg,
            OpCode::End => Instruction::End,
        };

        Ok((instruction, next))
    }

    fn read_cstr(&self, start: usize) -> Result<(String, usize), ExecError> {
        let rest = self.code.get(start..).ok_or(ExecError::InvalidInstruction)?;
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ExecError::InvalidInstruction)?;
        let s = std::str::from_utf8(&rest[..len]).map_err(|_| ExecError::InvalidInstruction)?;
        Ok((s.to_string(), start + len + 1))
    }

    /// Decode the whole code section as `(offset, instruction)` pairs
    pub fn instructions(&self) -> Result<Vec<(usize, Instruction)>, ExecError> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.code.len() {
            let (instruction, next) = self.decode(offset)?;
            out.push((offset, instruction));
            offset = next;
        }
        Ok(out)
    }

    /// Render the variable table and the code section
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut entry_points: HashMap<usize, usize> = HashMap::new();

        for (i, entry) in self.variables.iter().enumerate() {
            match &entry.kind {
                EntryKind::Data => {
                    out.push_str(&format!("{} DATA {}\t\t; {}\n", i, entry.ty, entry.qualified_name()))
                }
                EntryKind::DData => out.push_str(&format!(
                    "{} DDATA {}\t\t; {}\n",
                    i,
                    entry.ty,
                    entry.qualified_name()
                )),
                EntryKind::Fun { params, code } => {
                    entry_points.insert(*code as usize, i);
                    out.push_str(&format!(
                        "{} FUN {} {}:{}\t\t; {}\n",
                        i,
                        code,
                        entry.ty,
                        join_types(params),
                        entry.qualified_name()
                    ));
                }
            }
        }

        let mut offset = 0;
        while offset < self.code.len() {
            if let Some(&fn_idx) = entry_points.get(&offset) {
                let entry = &self.variables[fn_idx];
                out.push_str(&format!("; {}({})\n", entry.qualified_name(), entry.ty));
            }

            match self.decode(offset) {
                Ok((instruction, next)) => {
                    out.push_str(&format!("{:04} {}\n", offset, instruction));
                    offset = next;
                }
                Err(_) => {
                    out.push_str(&format!("{:04} <invalid {:#04x}>\n", offset, self.code[offset]));
                    offset += 1;
                }
            }
        }

        out
    }
}

impl AddAssign for Bytecode {
    /// Append `other`'s code, relocating its jump targets and function entries by
    /// the current code length. The variable table is not merged.
    fn add_assign(&mut self, mut other: Bytecode) {
        let base = self.code.len();

        let jumps = std::mem::take(&mut other.jumps);
        for &j in &jumps {
            if let Some(addr) = other.read_u32(j) {
                other.set_address(j, addr + base as u32);
            }
            self.jumps.push(j + base);
        }

        self.function_refs
            .extend(other.function_refs.iter().map(|r| FunctionRef {
                variable: r.variable,
                offset: r.offset + base,
            }));

        self.code.append(&mut other.code);
    }
}

/// A decoded executable instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Nop,
    PutAddr(u32),
    PutIndAddr(u8),
    PutMemberAddr(u32),
    PutInt(i64),
    PutFloat(f64),
    PutString(String),
    PutBoolean(bool),
    Move,
    MoveAdd,
    MoveSubtr,
    MoveMul,
    MoveDiv,
    Equal,
    NotEqual,
    LessEqual,
    GreaterEqual,
    Less,
    Greater,
    JumpIfFalse(u32),
    Jump(u32),
    Mul,
    Div,
    Add,
    Sub,
    Neg,
    End,
    Call(u32),
    Syscall(u32, String),
    Return(u32),
    InitVar(u32),
    PutDAddr(u32),
    AllocVar(u32),
    AllocVars(u32),
}

impl Instruction {
    pub fn opcode(&self) -> OpCode {
        match self {
            Instruction::Nop => OpCode::Nop,
            Instruction::PutAddr(_) => OpCode::PutAddr,
            Instruction::PutIndAddr(_) => OpCode::PutIndAddr,
            Instruction::PutMemberAddr(_) => OpCode::PutMemberAddr,
            Instruction::PutInt(_) => OpCode::PutInt,
            Instruction::PutFloat(_) => OpCode::PutFloat,
            Instruction::PutString(_) => OpCode::PutString,
            Instruction::PutBoolean(_) => OpCode::PutBoolean,
            Instruction::Move => OpCode::Move,
            Instruction::MoveAdd => OpCode::MoveAdd,
            Instruction::MoveSubtr => OpCode::MoveSubtr,
            Instruction::MoveMul => OpCode::MoveMul,
            Instruction::MoveDiv => OpCode::MoveDiv,
            Instruction::Equal => OpCode::Equal,
            Instruction::NotEqual => OpCode::NotEqual,
            Instruction::LessEqual => OpCode::LessEqual,
            Instruction::GreaterEqual => OpCode::GreaterEqual,
            Instruction::Less => OpCode::Less,
            Instruction::Greater => OpCode::Greater,
            Instruction::JumpIfFalse(_) => OpCode::JumpIfFalse,
            Instruction::Jump(_) => OpCode::Jump,
            Instruction::Mul => OpCode::Mul,
            Instruction::Div => OpCode::Div,
            Instruction::Add => OpCode::Add,
            Instruction::Sub => OpCode::Sub,
            Instruction::Neg => OpCode::Neg,
            Instruction::End => OpCode::End,
            Instruction::Call(_) => OpCode::Call,
            Instruction::Syscall(_, _) => OpCode::Syscall,
            Instruction::Return(_) => OpCode::Return,
            Instruction::InitVar(_) => OpCode::InitVar,
            Instruction::PutDAddr(_) => OpCode::PutDAddr,
            Instruction::AllocVar(_) => OpCode::AllocVar,
            Instruction::AllocVars(_) => OpCode::AllocVars,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.opcode().name();
        match self {
            Instruction::PutAddr(v)
            | Instruction::PutMemberAddr(v)
            | Instruction::JumpIfFalse(v)
            | Instruction::Jump(v)
            | Instruction::Call(v)
            | Instruction::Return(v)
            | Instruction::InitVar(v)
            | Instruction::PutDAddr(v)
            | Instruction::AllocVar(v)
            | Instruction::AllocVars(v) => write!(f, "{} {}", name, v),
            Instruction::PutIndAddr(n) => write!(f, "{} {}", name, n),
            Instruction::PutInt(v) => write!(f, "{} {}", name, v),
            // `{:?}` keeps enough digits to parse back to the same bits
            Instruction::PutFloat(v) => write!(f, "{} {:?}", name, v),
            Instruction::PutString(s) => write!(f, "{} \"{}\"", name, escape_operand(s)),
            Instruction::PutBoolean(b) => write!(f, "{} {}", name, *b as u8),
            Instruction::Syscall(idx, fname) => write!(f, "{} {} {}", name, idx, fname),
            _ => f.write_str(name),
        }
    }
}

impl FromStr for Instruction {
    type Err = String;

    /// Parse one disassembly line (without the offset column)
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (name, rest) = match line.split_once(' ') {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let op = OpCode::from_name(name).ok_or_else(|| format!("Unknown instruction '{}'", name))?;
        let number = |s: &str| {
            s.parse::<u32>()
                .map_err(|e| format!("Invalid operand '{}' for {}: {}", s, name, e))
        };

        let instruction = match op {
            OpCode::PutAddr => Instruction::PutAddr(number(rest)?),
            OpCode::PutDAddr => Instruction::PutDAddr(number(rest)?),
            OpCode::PutMemberAddr => Instruction::PutMemberAddr(number(rest)?),
            OpCode::Call => Instruction::Call(number(rest)?),
            OpCode::Return => Instruction::Return(number(rest)?),
            OpCode::InitVar => Instruction::InitVar(number(rest)?),
            OpCode::AllocVar => Instruction::AllocVar(number(rest)?),
            OpCode::AllocVars => Instruction::AllocVars(number(rest)?),
            OpCode::Jump => Instruction::Jump(number(rest)?),
            OpCode::JumpIfFalse => Instruction::JumpIfFalse(number(rest)?),
            OpCode::PutIndAddr => Instruction::PutIndAddr(
                rest.parse()
                    .map_err(|e| format!("Invalid index count '{}': {}", rest, e))?,
            ),
            OpCode::PutInt => Instruction::PutInt(
                rest.parse()
                    .map_err(|e| format!("Invalid integer '{}': {}", rest, e))?,
            ),
            OpCode::PutFloat => Instruction::PutFloat(
                rest.parse()
                    .map_err(|e| format!("Invalid float '{}': {}", rest, e))?,
            ),
            OpCode::PutBoolean => Instruction::PutBoolean(rest != "0"),
            OpCode::PutString => {
                let inner = rest
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .ok_or_else(|| format!("Unquoted string operand '{}'", rest))?;
                Instruction::PutString(unescape_operand(inner)?)
            }
            OpCode::Syscall => {
                let (idx, fname) = rest
                    .split_once(' ')
                    .ok_or_else(|| format!("SYSCALL needs an index and a name: '{}'", rest))?;
                Instruction::Syscall(number(idx)?, fname.trim().to_string())
            }
            OpCode::Data | OpCode::DData | OpCode::Fun => {
                return Err(format!("{} is a table entry, not an instruction", name))
            }
            OpCode::Nop => Instruction::Nop,
            OpCode::Move => Instruction::Move,
            OpCode::MoveAdd => Instruction::MoveAdd,
            OpCode::MoveSubtr => Instruction::MoveSubtr,
            OpCode::MoveMul => Instruction::MoveMul,
            OpCode::MoveDiv => Instruction::MoveDiv,
            OpCode::Equal => Instruction::Equal,
            OpCode::NotEqual => Instruction::NotEqual,
            OpCode::LessEqual => Instruction::LessEqual,
            OpCode::GreaterEqual => Instruction::GreaterEqual,
            OpCode::Less => Instruction::Less,
            OpCode::Greater => Instruction::Greater,
            OpCode::Mul => Instruction::Mul,
            OpCode::Div => Instruction::Div,
            OpCode::Add => Instruction::Add,
            OpCode::Sub => Instruction::Sub,
            OpCode::Neg => Instruction::Neg,
            OpCode::End => Instruction::End,
        };
        Ok(instruction)
    }
}

/// Keep a string operand on one disassembly line
fn escape_operand(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_operand(s: &str) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(format!("Unknown escape '\\{}' in string operand", other)),
            None => return Err("Dangling '\\' in string operand".to_string()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instructions() -> Vec<Instruction> {
        vec![
            Instruction::Nop,
            Instruction::PutAddr(3),
            Instruction::PutIndAddr(2),
            Instruction::PutMemberAddr(9),
            Instruction::PutInt(-42),
            Instruction::PutFloat(0.1),
            Instruction::PutString("say \\\"hi\\\"".to_string()),
            Instruction::PutString("a\nb".to_string()),
            Instruction::PutString("c:\\tmp\r".to_string()),
            Instruction::PutBoolean(true),
            Instruction::MoveDiv,
            Instruction::GreaterEqual,
            Instruction::JumpIfFalse(17),
            Instruction::Jump(4),
            Instruction::Neg,
            Instruction::Call(6),
            Instruction::Syscall(7, "cos".to_string()),
            Instruction::Return(6),
            Instruction::InitVar(1),
            Instruction::PutDAddr(8),
            Instruction::AllocVar(6),
            Instruction::AllocVars(7),
            Instruction::End,
        ]
    }

    #[test]
    fn test_encode_decode_every_kind() {
        let mut bc = Bytecode::new();
        for instruction in sample_instructions() {
            bc.push_instruction(&instruction);
        }

        let decoded: Vec<Instruction> = bc
            .instructions()
            .unwrap()
            .into_iter()
            .map(|(_, i)| i)
            .collect();
        assert_eq!(decoded, sample_instructions());

        // Re-encoding the decoded stream reproduces the bytes
        let mut again = Bytecode::new();
        for instruction in &decoded {
            again.push_instruction(instruction);
        }
        assert_eq!(again.code, bc.code);
    }

    #[test]
    fn test_disassembly_parses_back() {
        let mut bc = Bytecode::new();
        for instruction in sample_instructions() {
            bc.push_instruction(&instruction);
        }

        let parsed: Vec<Instruction> = bc
            .disassemble()
            .lines()
            .map(|line| line.split_once(' ').unwrap().1.parse().unwrap())
            .collect();
        assert_eq!(parsed, sample_instructions());
    }

    #[test]
    fn test_operand_widths() {
        let mut bc = Bytecode::new();
        assert_eq!(bc.put_float(2.5), 0);
        assert_eq!(bc.current_offset(), 13);
        assert_eq!(bc.put_int(1), 13);
        assert_eq!(bc.put_string("ab"), 22);
        assert_eq!(bc.current_offset(), 26);
        assert_eq!(&bc.code[1..9], &2.5f64.to_le_bytes());
        assert_eq!(&bc.code[9..13], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_concatenation_relocates_jumps_and_functions() {
        let mut head = Bytecode::new();
        head.put_int(1);
        head.emit(OpCode::End);

        let mut tail = Bytecode::new();
        let entry = tail.alloc_var(0);
        tail.add_function(0, entry);
        let jump = tail.jump(0);
        tail.ret(0);

        let base = head.current_offset();
        head += tail;

        assert_eq!(head.function_refs(), &[FunctionRef { variable: 0, offset: base }]);
        assert_eq!(head.jumps(), &[base + jump + 1]);
        assert_eq!(head.read_u32(base + jump + 1), Some(base as u32));
        assert_eq!(head.decode(base + jump).unwrap().0, Instruction::Jump(base as u32));
    }

    #[test]
    fn test_nested_concatenation_shifts_every_jump_once() {
        let mut tail = Bytecode::new();
        tail.emit(OpCode::Nop);
        let inner = tail.jump(0);

        let mut mid = Bytecode::new();
        let outer = mid.jump_if_false(3);
        let mid_len = mid.current_offset();
        mid += tail;

        let mut head = Bytecode::new();
        head.put_boolean(true);
        let head_len = head.current_offset();
        head += mid;

        assert_eq!(
            head.jumps(),
            &[head_len + outer + 1, head_len + mid_len + inner + 1]
        );
        assert_eq!(
            head.decode(head_len + outer).unwrap().0,
            Instruction::JumpIfFalse(head_len as u32 + 3)
        );
        assert_eq!(
            head.decode(head_len + mid_len + inner).unwrap().0,
            Instruction::Jump((head_len + mid_len) as u32)
        );
    }

    #[test]
    fn test_string_operand_escapes_stay_on_one_line() {
        let text = Instruction::PutString("a\nb\\".to_string()).to_string();
        assert_eq!(text, "PUTSTRING \"a\\nb\\\\\"");
        assert_eq!(text.lines().count(), 1);
        assert!("PUTSTRING \"a\\tb\"".parse::<Instruction>().is_err());
        assert!("PUTSTRING \"a\\\"".parse::<Instruction>().is_err());
    }

    #[test]
    fn test_table_entries_are_rejected_as_code() {
        let bc = Bytecode {
            code: vec![OpCode::Data.into()],
            ..Bytecode::default()
        };
        assert_eq!(bc.decode(0), Err(ExecError::InvalidInstruction));
        assert!("FUN".parse::<Instruction>().is_err());
    }

    #[test]
    fn test_disassembly_labels_functions() {
        let mut bc = Bytecode::new();
        bc.emit(OpCode::End);
        let entry = bc.alloc_var(0);
        bc.ret(0);
        bc.fun("twice", "0", Type::Int, vec![Type::Int], entry as u32);

        let text = bc.disassemble();
        assert!(text.contains("0 FUN 1 i:i\t\t; 0.twice"));
        assert!(text.contains("; 0.twice(i)\n0001 ALLOCVAR 0"));
    }
}

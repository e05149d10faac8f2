// Quill Binary Format
// `.qlc` files: a linked program's variable table followed by its code

use crate::compiler::bytecode::{Bytecode, EntryKind};
use crate::compiler::opcode::OpCode;
use crate::compiler::types::Type;

const MAGIC: &[u8; 4] = b"QUIL";
const VERSION: u8 = 1;

/// Serialize a linked program. Relocation data is not kept; the result only runs.
pub fn serialize(bytecode: &Bytecode) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(MAGIC);
    out.push(VERSION);

    write_u32(&mut out, bytecode.variables.len() as u32);
    for entry in &bytecode.variables {
        let tag = match entry.kind {
            EntryKind::Data => OpCode::Data,
            EntryKind::DData => OpCode::DData,
            EntryKind::Fun { .. } => OpCode::Fun,
        };
        out.push(tag.into());
        write_string(&mut out, &entry.name);
        write_string(&mut out, &entry.scope);
        write_string(&mut out, &entry.ty.to_string());

        if let EntryKind::Fun { params, code } = &entry.kind {
            write_u32(&mut out, *code);
            write_u32(&mut out, params.len() as u32);
            for param in params {
                write_string(&mut out, &param.to_string());
            }
        }
    }

    write_u32(&mut out, bytecode.code.len() as u32);
    out.extend_from_slice(&bytecode.code);

    out
}

pub fn deserialize(data: &[u8]) -> Result<Bytecode, String> {
    let mut cursor = 0;

    if data.len() < 5 {
        return Err("Invalid file: too short".to_string());
    }
    if &data[0..4] != MAGIC {
        return Err("Invalid file: not a .qlc file".to_string());
    }
    cursor += 4;

    let version = data[cursor];
    if version != VERSION {
        return Err(format!("Unsupported version: {}", version));
    }
    cursor += 1;

    let mut bytecode = Bytecode::new();
    let entry_count = read_u32(data, &mut cursor)? as usize;
    for _ in 0..entry_count {
        let tag = *data
            .get(cursor)
            .ok_or_else(|| "Invalid file: truncated variable table".to_string())?;
        cursor += 1;

        let name = read_string(data, &mut cursor)?;
        let scope = read_string(data, &mut cursor)?;
        let ty = read_type(data, &mut cursor)?;

        match OpCode::try_from(tag) {
            Ok(OpCode::Data) => {
                bytecode.data(&name, &scope, ty);
            }
            Ok(OpCode::DData) => {
                bytecode.ddata(&name, &scope, ty);
            }
            Ok(OpCode::Fun) => {
                let code = read_u32(data, &mut cursor)?;
                let param_count = read_u32(data, &mut cursor)? as usize;
                let mut params = Vec::with_capacity(param_count.min(64));
                for _ in 0..param_count {
                    params.push(read_type(data, &mut cursor)?);
                }
                bytecode.fun(&name, &scope, ty, params, code);
            }
            _ => return Err(format!("Invalid variable table record tag: {}", tag)),
        }
    }

    let code_len = read_u32(data, &mut cursor)? as usize;
    if cursor + code_len > data.len() {
        return Err("Invalid file: truncated code".to_string());
    }
    bytecode.code = data[cursor..cursor + code_len].to_vec();

    Ok(bytecode)
}

/// Check whether data is a compiled Quill program
pub fn is_binary(data: &[u8]) -> bool {
    data.len() >= 4 && &data[0..4] == MAGIC
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32, String> {
    let bytes = data
        .get(*cursor..*cursor + 4)
        .ok_or_else(|| "Unexpected end of file".to_string())?;
    *cursor += 4;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn read_string(data: &[u8], cursor: &mut usize) -> Result<String, String> {
    let len = read_u32(data, cursor)? as usize;
    let bytes = data
        .get(*cursor..*cursor + len)
        .ok_or_else(|| "Unexpected end of file in string".to_string())?;
    *cursor += len;
    String::from_utf8(bytes.to_vec()).map_err(|e| format!("Invalid UTF-8: {}", e))
}

fn read_type(data: &[u8], cursor: &mut usize) -> Result<Type, String> {
    read_string(data, cursor)?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse;
    use crate::vm::{execute, Value};

    #[test]
    fn test_compiled_program_runs_after_reload() {
        let compilation = parse(
            "function sq(float x) of float { sq = x * x } array [string] of float t t[\"a\"] = sq(1.5)",
        );
        assert!(compilation.is_ok());

        let data = serialize(&compilation.bytecode);
        assert!(is_binary(&data));
        let loaded = deserialize(&data).unwrap();
        assert_eq!(loaded.variables, compilation.bytecode.variables);
        assert_eq!(loaded.code, compilation.bytecode.code);

        let execution = execute(&loaded);
        assert!(execution.status.is_ok());
        let Some(Value::Array(t)) = execution.value("0.t") else {
            panic!("t is not an array");
        };
        assert_eq!(t.get(&[Value::Str("a".into())]), Some(&Value::Float(2.25)));
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert_eq!(deserialize(b"QUI").unwrap_err(), "Invalid file: too short");
        assert_eq!(
            deserialize(b"QLC0\x01").unwrap_err(),
            "Invalid file: not a .qlc file"
        );
        assert_eq!(deserialize(b"QUIL\x09").unwrap_err(), "Unsupported version: 9");
    }

    #[test]
    fn test_rejects_truncation() {
        let compilation = parse("int a a = 1");
        let data = serialize(&compilation.bytecode);
        assert!(deserialize(&data[..data.len() - 1]).is_err());
        assert!(deserialize(&data[..12]).is_err());
    }
}

// Quill Compiler
// Scannerless recursive-descent parser emitting relocatable bytecode

pub mod bytecode;
pub mod opcode;
pub mod parser;
pub mod symbols;
pub mod trace;
pub mod types;

pub use bytecode::{Bytecode, EntryKind, FunctionRef, Instruction, TableEntry};
pub use opcode::OpCode;
pub use parser::{parse, Compilation};
pub use symbols::{Scope, Variables};
pub use trace::{ParseStatus, ParseTrace};
pub use types::Type;

// Quill Programming Language
// A statically typed scripting language compiled to bytecode for a stack VM

pub mod binary;
pub mod compiler;
pub mod error;
pub mod vm;

pub use compiler::{parse, Bytecode, Compilation, ParseStatus, ParseTrace};
pub use error::{ExecError, ExecStatus, QuillError, QuillResult};
pub use vm::{execute, Execution, Value};

/// Compile and run `source`. Compilation failures come back as a report
/// pointing at the most specific diagnostic.
pub fn run(source: &str, file: &str) -> QuillResult<Execution> {
    let compilation = parse(source);
    if !compilation.is_ok() {
        return Err(compilation.trace.to_error(file, source));
    }
    Ok(execute(&compilation.bytecode))
}

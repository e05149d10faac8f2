// Quill Runtime
// Values, sparse arrays, built-in functions and the interpreter loop

pub mod array;
pub mod syscall;
pub mod value;
pub mod vm;

pub use array::{Array, ArrayElement};
pub use syscall::Builtin;
pub use value::{Address, Element, Location, Value, ValueKind};
pub use vm::{execute, Execution, VariableState, VM};

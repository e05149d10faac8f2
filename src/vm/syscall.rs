// Quill System Calls
// Built-in math functions reachable through SYSCALL

use std::fmt;

use super::value::Value;
use crate::error::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Sin,
    Cos,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Builtin::Sin),
            "cos" => Some(Builtin::Cos),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
        }
    }

    /// Evaluate on the parameter cell. Ints are accepted and widened.
    pub fn call(&self, arg: &Value) -> Result<Value, ExecError> {
        let x = match arg {
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            Value::Str(_) | Value::Bool(_) => {
                return Err(ExecError::SyscallNotSupported {
                    function: *self,
                    kind: arg.kind(),
                })
            }
            Value::Array(_) => {
                return Err(ExecError::SyscallInconsistentDatatypes { function: *self })
            }
        };
        Ok(Value::Float(match self {
            Builtin::Sin => x.sin(),
            Builtin::Cos => x.cos(),
        }))
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

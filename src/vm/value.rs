// Quill Runtime Values
// Owned tagged values, operand stack elements and cell addresses

use serde::Serialize;
use smallvec::SmallVec;
use std::fmt;

use super::array::Array;
use crate::compiler::opcode::OpCode;
use crate::compiler::types::Type;
use crate::error::ExecError;

/// Runtime tag of a stack element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    String,
    Boolean,
    Address,
    Array,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Boolean => "boolean",
            ValueKind::Address => "address",
            ValueKind::Array => "array",
        };
        f.write_str(name)
    }
}

/// A stored value. Arrays are owned, so cloning a value deep-copies it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Array(Array),
}

/// Index tuple of one array access
pub type Indexes = SmallVec<[Value; 2]>;

impl Value {
    /// Default content of a fresh cell of type `ty`
    pub fn default_for(ty: &Type) -> Self {
        match ty {
            Type::Int => Value::Int(0),
            Type::Float => Value::Float(0.0),
            Type::Str => Value::Str(String::new()),
            Type::Bool => Value::Bool(false),
            Type::Array { index, element } => {
                Value::Array(Array::new(index.clone(), (**element).clone()))
            }
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::String,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Array(_) => ValueKind::Array,
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::Str(_) => Type::Str,
            Value::Bool(_) => Type::Bool,
            Value::Array(array) => array.ty(),
        }
    }

    /// Exact scalar match, used for array index checks
    pub fn matches(&self, ty: &Type) -> bool {
        match (self, ty) {
            (Value::Array(array), Type::Array { .. }) => array.ty() == *ty,
            (value, ty) => value.ty() == *ty,
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Widen this value into a cell of type `ty`: ints become floats, and
    /// arrays are rebuilt with the target's index and element types.
    pub fn coerce(self, ty: &Type) -> Self {
        match (self, ty) {
            (Value::Int(i), Type::Float) => Value::Float(i as f64),
            (Value::Array(array), Type::Array { index, element }) if array.ty() != *ty => {
                Value::Array(array.coerce(index, element))
            }
            (value, _) => value,
        }
    }

    // ==================== Operators ====================

    fn numeric(&self, rhs: &Value, int: fn(i64, i64) -> i64, float: fn(f64, f64) -> f64) -> Option<Value> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => Some(Value::Int(int(*a, *b))),
            _ => Some(Value::Float(float(self.as_float()?, rhs.as_float()?))),
        }
    }

    /// Numeric addition, string concatenation, boolean OR, array merge
    pub fn add(&self, rhs: &Value, op: OpCode) -> Result<Value, ExecError> {
        if let Some(value) = self.numeric(rhs, i64::wrapping_add, |a, b| a + b) {
            return Ok(value);
        }
        match (self, rhs) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a || *b)),
            (Value::Array(a), Value::Array(b)) => {
                let mut merged = a.clone();
                merged.merge(b, op)?;
                Ok(Value::Array(merged))
            }
            _ => Err(ExecError::InconsistentDatatypes { op }),
        }
    }

    /// Numeric subtraction, string remove-all, boolean XOR
    pub fn sub(&self, rhs: &Value, op: OpCode) -> Result<Value, ExecError> {
        if let Some(value) = self.numeric(rhs, i64::wrapping_sub, |a, b| a - b) {
            return Ok(value);
        }
        match (self, rhs) {
            (Value::Str(a), Value::Str(b)) if b.is_empty() => Ok(Value::Str(a.clone())),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a.replace(b.as_str(), ""))),
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a ^ b)),
            (Value::Array(_), Value::Array(_)) => Err(ExecError::NotSupported {
                op,
                kind: ValueKind::Array,
            }),
            _ => Err(ExecError::InconsistentDatatypes { op }),
        }
    }

    /// Numeric multiplication, boolean AND
    pub fn mul(&self, rhs: &Value, op: OpCode) -> Result<Value, ExecError> {
        if let Some(value) = self.numeric(rhs, i64::wrapping_mul, |a, b| a * b) {
            return Ok(value);
        }
        match (self, rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a && *b)),
            (Value::Str(_), Value::Str(_)) | (Value::Array(_), Value::Array(_)) => {
                Err(ExecError::NotSupported {
                    op,
                    kind: self.kind(),
                })
            }
            _ => Err(ExecError::InconsistentDatatypes { op }),
        }
    }

    /// Division always produces a float
    pub fn div(&self, rhs: &Value, op: OpCode) -> Result<Value, ExecError> {
        match (self.as_float(), rhs.as_float()) {
            (Some(_), Some(b)) if b == 0.0 => Err(ExecError::DivisionByZero { op }),
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ if self.kind() == rhs.kind() => Err(ExecError::NotSupported {
                op,
                kind: self.kind(),
            }),
            _ => Err(ExecError::InconsistentDatatypes { op }),
        }
    }

    /// Arithmetic negation, boolean NOT
    pub fn neg(&self) -> Result<Value, ExecError> {
        match self {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExecError::NotSupported {
                op: OpCode::Neg,
                kind: other.kind(),
            }),
        }
    }

    /// Evaluate a relational opcode
    pub fn compare(&self, rhs: &Value, op: OpCode) -> Result<bool, ExecError> {
        use std::cmp::Ordering;

        if let (Some(a), Some(b)) = (self.as_float(), rhs.as_float()) {
            let ordering = match (self, rhs) {
                (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
                _ => a.partial_cmp(&b),
            };
            return Ok(match op {
                OpCode::Equal => ordering == Some(Ordering::Equal),
                OpCode::NotEqual => ordering != Some(Ordering::Equal),
                OpCode::Less => ordering == Some(Ordering::Less),
                OpCode::LessEqual => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                OpCode::Greater => ordering == Some(Ordering::Greater),
                OpCode::GreaterEqual => {
                    matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
                }
                _ => return Err(ExecError::InvalidInstruction),
            });
        }

        if self.kind() != rhs.kind() {
            return Err(ExecError::InconsistentDatatypes { op });
        }

        let ordering = match (self, rhs) {
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                return match op {
                    OpCode::Equal => Ok(a == b),
                    OpCode::NotEqual => Ok(a != b),
                    _ => Err(ExecError::NotSupported {
                        op,
                        kind: ValueKind::Array,
                    }),
                }
            }
            _ => return Err(ExecError::InconsistentDatatypes { op }),
        };
        Ok(match op {
            OpCode::Equal => ordering == Ordering::Equal,
            OpCode::NotEqual => ordering != Ordering::Equal,
            OpCode::Less => ordering == Ordering::Less,
            OpCode::LessEqual => ordering != Ordering::Greater,
            OpCode::Greater => ordering == Ordering::Greater,
            OpCode::GreaterEqual => ordering != Ordering::Less,
            _ => return Err(ExecError::InvalidInstruction),
        })
    }

    /// Apply an assignment opcode to this cell in place
    pub fn assign(&mut self, op: OpCode, value: Value) -> Result<(), ExecError> {
        if op == OpCode::Move {
            return self.store(value);
        }
        if matches!((&*self, &value), (Value::Int(_), Value::Float(_))) {
            return Err(ExecError::InconsistentDatatypes { op });
        }

        let result = match op {
            OpCode::MoveAdd => match (&mut *self, &value) {
                (Value::Array(target), Value::Array(other)) => {
                    return target.merge(other, op);
                }
                _ => self.add(&value, op)?,
            },
            OpCode::MoveSubtr => self.sub(&value, op)?,
            OpCode::MoveMul => self.mul(&value, op)?,
            OpCode::MoveDiv => match self {
                Value::Int(_) if value.as_float().is_some() => {
                    return Err(ExecError::InconsistentDatatypes { op })
                }
                _ => self.div(&value, op)?,
            },
            _ => return Err(ExecError::InvalidInstruction),
        };
        *self = result;
        Ok(())
    }

    /// Plain `MOVE`: same kind, or an int widening into a float
    fn store(&mut self, value: Value) -> Result<(), ExecError> {
        let op = OpCode::Move;
        match (&*self, value) {
            (Value::Float(_), Value::Int(i)) => *self = Value::Float(i as f64),
            (Value::Array(target), Value::Array(array)) => {
                let ty = target.ty();
                if !ty.accepts(&array.ty()) {
                    return Err(ExecError::InconsistentArrayDatatypes { op });
                }
                *self = Value::Array(array).coerce(&ty);
            }
            (current, value) if current.kind() == value.kind() => *self = value,
            _ => return Err(ExecError::InconsistentDatatypes { op }),
        }
        Ok(())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Array(array) => write!(f, "{}", array),
        }
    }
}

/// Root of an address: a static cell or a slot of a live call frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Static(usize),
    Frame { frame: usize, slot: usize },
}

/// Non-owning reference to a cell, optionally descending into array elements
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub root: Location,
    pub path: Vec<Indexes>,
}

impl Address {
    pub fn new(root: Location) -> Self {
        Self {
            root,
            path: Vec::new(),
        }
    }

    pub fn index(mut self, indexes: Indexes) -> Self {
        self.path.push(indexes);
        self
    }
}

/// Operand stack entry
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Value(Value),
    Address(Address),
}

impl Element {
    pub fn kind(&self) -> ValueKind {
        match self {
            Element::Value(value) => value.kind(),
            Element::Address(_) => ValueKind::Address,
        }
    }
}

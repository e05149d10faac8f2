// Quill Sparse Arrays
// Typed associative storage, populated lazily on first access

use serde::Serialize;
use std::fmt;

use super::value::{Indexes, Value};
use crate::compiler::opcode::OpCode;
use crate::compiler::types::Type;
use crate::error::ExecError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayElement {
    pub indexes: Indexes,
    pub value: Value,
}

/// Elements keep their insertion order. All share the index arity and types
/// of the array and hold values of its element type.
#[derive(Debug, Clone, Serialize)]
pub struct Array {
    #[serde(rename = "index")]
    index_types: Vec<Type>,
    #[serde(rename = "element")]
    element_type: Type,
    elements: Vec<ArrayElement>,
}

impl Array {
    pub fn new(index_types: Vec<Type>, element_type: Type) -> Self {
        Self {
            index_types,
            element_type,
            elements: Vec::new(),
        }
    }

    pub fn ty(&self) -> Type {
        Type::array(self.index_types.clone(), self.element_type.clone())
    }

    pub fn elements(&self) -> &[ArrayElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn check_indexes(&self, indexes: &[Value]) -> Result<(), ExecError> {
        if indexes.len() != self.index_types.len()
            || !indexes
                .iter()
                .zip(&self.index_types)
                .all(|(value, ty)| value.matches(ty))
        {
            return Err(ExecError::InconsistentIndexDatatypes);
        }
        Ok(())
    }

    fn position(&self, indexes: &[Value]) -> Option<usize> {
        self.elements
            .iter()
            .position(|element| element.indexes.as_slice() == indexes)
    }

    pub fn get(&self, indexes: &[Value]) -> Option<&Value> {
        self.position(indexes).map(|pos| &self.elements[pos].value)
    }

    /// Position of the element at `indexes`, creating it with the default
    /// element value when it does not exist yet
    pub fn materialize(&mut self, indexes: &[Value]) -> Result<usize, ExecError> {
        self.check_indexes(indexes)?;
        if let Some(pos) = self.position(indexes) {
            return Ok(pos);
        }
        self.elements.push(ArrayElement {
            indexes: indexes.iter().cloned().collect(),
            value: Value::default_for(&self.element_type),
        });
        Ok(self.elements.len() - 1)
    }

    pub fn value_mut(&mut self, pos: usize) -> Option<&mut Value> {
        self.elements.get_mut(pos).map(|element| &mut element.value)
    }

    /// Element-wise `+=`: every element of `other` is added onto the element
    /// with the same indexes, which is created first when missing
    pub fn merge(&mut self, other: &Array, op: OpCode) -> Result<(), ExecError> {
        if !self.ty().accepts(&other.ty()) {
            return Err(ExecError::InconsistentArrayDatatypes { op });
        }
        let other = other.coerce(&self.index_types, &self.element_type);
        for element in &other.elements {
            let pos = self.materialize(&element.indexes)?;
            let target = &mut self.elements[pos].value;
            match (&mut *target, &element.value) {
                (Value::Array(nested), Value::Array(source)) => nested.merge(source, op)?,
                _ => *target = target.add(&element.value, op)?,
            }
        }
        Ok(())
    }

    /// Copy with indexes and values widened to the given types
    pub fn coerce(&self, index_types: &[Type], element_type: &Type) -> Array {
        Array {
            index_types: index_types.to_vec(),
            element_type: element_type.clone(),
            elements: self
                .elements
                .iter()
                .map(|element| ArrayElement {
                    indexes: element
                        .indexes
                        .iter()
                        .zip(index_types)
                        .map(|(value, ty)| value.clone().coerce(ty))
                        .collect(),
                    value: element.value.clone().coerce(element_type),
                })
                .collect(),
        }
    }
}

/// Structural equality: the same index tuples holding equal values, in any order
impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        self.elements.len() == other.elements.len()
            && self
                .elements
                .iter()
                .all(|element| other.get(&element.indexes) == Some(&element.value))
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let indexes = element
                .indexes
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "[{}]: {}", indexes, element.value)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Array {
        Array::new(vec![Type::Int, Type::Int], Type::Int)
    }

    #[test]
    fn test_materialize_is_lazy_and_stable() {
        let mut array = grid();
        assert!(array.is_empty());

        let first = array.materialize(&[Value::Int(3), Value::Int(4)]).unwrap();
        let again = array.materialize(&[Value::Int(3), Value::Int(4)]).unwrap();
        assert_eq!(first, again);
        assert_eq!(array.len(), 1);
        assert_eq!(array.get(&[Value::Int(3), Value::Int(4)]), Some(&Value::Int(0)));

        *array.value_mut(first).unwrap() = Value::Int(7);
        assert_eq!(array.get(&[Value::Int(3), Value::Int(4)]), Some(&Value::Int(7)));
    }

    #[test]
    fn test_index_types_must_match_exactly() {
        let mut array = grid();
        assert_eq!(
            array.materialize(&[Value::Int(1), Value::Float(1.0)]),
            Err(ExecError::InconsistentIndexDatatypes)
        );
        assert_eq!(
            array.materialize(&[Value::Int(1)]),
            Err(ExecError::InconsistentIndexDatatypes)
        );
    }

    #[test]
    fn test_structural_equality_ignores_order() {
        let mut a = grid();
        let mut b = grid();
        for (x, y) in [(1, 2), (3, 4)] {
            let pos = a.materialize(&[Value::Int(x), Value::Int(y)]).unwrap();
            *a.value_mut(pos).unwrap() = Value::Int(x * y);
        }
        for (x, y) in [(3, 4), (1, 2)] {
            let pos = b.materialize(&[Value::Int(x), Value::Int(y)]).unwrap();
            *b.value_mut(pos).unwrap() = Value::Int(x * y);
        }
        assert_eq!(a, b);

        let pos = b.materialize(&[Value::Int(1), Value::Int(2)]).unwrap();
        *b.value_mut(pos).unwrap() = Value::Int(0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_merge_adds_elementwise() {
        let mut target = Array::new(vec![Type::Str], Type::Float);
        let pos = target.materialize(&[Value::Str("a".into())]).unwrap();
        *target.value_mut(pos).unwrap() = Value::Float(1.5);

        let mut other = Array::new(vec![Type::Str], Type::Int);
        for (key, value) in [("a", 2), ("b", 5)] {
            let pos = other.materialize(&[Value::Str(key.into())]).unwrap();
            *other.value_mut(pos).unwrap() = Value::Int(value);
        }

        target.merge(&other, OpCode::MoveAdd).unwrap();
        assert_eq!(target.get(&[Value::Str("a".into())]), Some(&Value::Float(3.5)));
        assert_eq!(target.get(&[Value::Str("b".into())]), Some(&Value::Float(5.0)));

        let mismatched = Array::new(vec![Type::Int], Type::Float);
        assert_eq!(
            target.merge(&mismatched, OpCode::Add),
            Err(ExecError::InconsistentArrayDatatypes { op: OpCode::Add })
        );
    }
}

// Quill Type Descriptors
// Static types shared by the parser, the variable table and the VM

use std::fmt;
use std::str::FromStr;

/// A type descriptor. Renders as `i`, `f`, `s`, `b` or `a [<index types>] <element>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Float,
    Str,
    Bool,
    Array { index: Vec<Type>, element: Box<Type> },
}

impl Type {
    pub fn array(index: Vec<Type>, element: Type) -> Self {
        Type::Array {
            index,
            element: Box::new(element),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }

    /// Single-character tag used by the variable table and index lists
    pub fn tag(&self) -> char {
        match self {
            Type::Int => 'i',
            Type::Float => 'f',
            Type::Str => 's',
            Type::Bool => 'b',
            Type::Array { .. } => 'a',
        }
    }

    /// Whether a value of type `other` may be stored into a cell of this type.
    ///
    /// Identical types always fit; an int fits a float, also inside arrays
    /// (index slots and element types are compared pairwise).
    pub fn accepts(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Float, Type::Int) => true,
            (
                Type::Array { index: li, element: le },
                Type::Array { index: ri, element: re },
            ) => {
                li.len() == ri.len()
                    && li.iter().zip(ri.iter()).all(|(l, r)| l.accepts(r))
                    && le.accepts(re)
            }
            (l, r) => l == r,
        }
    }
}

/// Identical types, or both numeric
pub fn consistent(a: &Type, b: &Type) -> bool {
    a == b || (a.is_numeric() && b.is_numeric())
}

/// Int widens into float on assignment, never the other way round
pub fn consistent_assignment(lhs: &Type, rhs: &Type) -> bool {
    lhs == rhs || (*lhs == Type::Float && rhs.is_numeric())
}

pub fn consistent_call(params: &[Type], args: &[Type]) -> bool {
    params.len() == args.len()
        && params
            .iter()
            .zip(args.iter())
            .all(|(p, a)| consistent_assignment(p, a))
}

/// Result type of a numeric fold: `i∘i → i`, anything with a float → `f`
pub fn max_type(a: &Type, b: &Type) -> Option<Type> {
    match (a, b) {
        _ if a == b => Some(a.clone()),
        (Type::Int, Type::Float) | (Type::Float, Type::Int) => Some(Type::Float),
        _ => None,
    }
}

/// Render a comma-separated list of types, as used for parameter and index lists
pub fn join_types(types: &[Type]) -> String {
    types
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Array { index, element } => write!(f, "a [{}] {}", join_types(index), element),
            scalar => write!(f, "{}", scalar.tag()),
        }
    }
}

impl serde::Serialize for Type {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for Type {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, rest) = parse_descriptor(s.trim())?;
        if !rest.trim().is_empty() {
            return Err(format!("Trailing characters in type descriptor '{}'", s));
        }
        Ok(ty)
    }
}

fn parse_descriptor(s: &str) -> Result<(Type, &str), String> {
    let mut chars = s.chars();
    let ty = match chars.next() {
        Some('i') => Type::Int,
        Some('f') => Type::Float,
        Some('s') => Type::Str,
        Some('b') => Type::Bool,
        Some('a') => {
            let rest = s[1..].trim_start();
            let rest = rest
                .strip_prefix('[')
                .ok_or_else(|| format!("Expected '[' in array descriptor '{}'", s))?;
            let close = rest
                .find(']')
                .ok_or_else(|| format!("Missing ']' in array descriptor '{}'", s))?;
            let index = rest[..close]
                .split(',')
                .map(|part| part.trim().parse::<Type>())
                .collect::<Result<Vec<_>, _>>()?;
            let (element, rest) = parse_descriptor(rest[close + 1..].trim_start())?;
            return Ok((Type::array(index, element), rest));
        }
        _ => return Err(format!("Unknown type descriptor '{}'", s)),
    };
    Ok((ty, chars.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_rendering() {
        let nested = Type::array(
            vec![Type::Int, Type::Str],
            Type::array(vec![Type::Bool], Type::Float),
        );
        assert_eq!(nested.to_string(), "a [i,s] a [b] f");
        assert_eq!("a [i,s] a [b] f".parse::<Type>().unwrap(), nested);
        assert!("x".parse::<Type>().is_err());
        assert!("a [i f".parse::<Type>().is_err());
    }

    #[test]
    fn test_consistency_rules() {
        assert!(consistent(&Type::Int, &Type::Float));
        assert!(!consistent(&Type::Int, &Type::Str));
        assert!(consistent_assignment(&Type::Float, &Type::Int));
        assert!(!consistent_assignment(&Type::Int, &Type::Float));
        assert!(consistent_call(
            &[Type::Float, Type::Str],
            &[Type::Int, Type::Str]
        ));
        assert!(!consistent_call(&[Type::Float], &[]));
    }

    #[test]
    fn test_max_type() {
        assert_eq!(max_type(&Type::Int, &Type::Int), Some(Type::Int));
        assert_eq!(max_type(&Type::Int, &Type::Float), Some(Type::Float));
        assert_eq!(max_type(&Type::Str, &Type::Int), None);
    }

    #[test]
    fn test_array_acceptance() {
        let floats = Type::array(vec![Type::Float], Type::Float);
        let ints = Type::array(vec![Type::Int], Type::Int);
        assert!(floats.accepts(&ints));
        assert!(!ints.accepts(&floats));
    }
}

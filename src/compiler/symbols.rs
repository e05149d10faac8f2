// Quill Symbol Registry
// Compile-time declarations keyed by (scope, name)

use rustc_hash::FxHashMap;
use std::fmt;
use tracing::trace;

use super::types::Type;
use crate::error::Position;

/// Hierarchical lexical scope, e.g. `0.fact.1`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    segments: Vec<String>,
}

impl Scope {
    pub fn root() -> Self {
        Self {
            segments: vec!["0".to_string()],
        }
    }

    /// Child scope with one more segment
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Drop the innermost segment. The root scope stays as it is.
    pub fn reduce(&mut self) {
        if self.segments.len() > 1 {
            self.segments.pop();
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Prefix test: a declaration in `other` is visible from `self`
    pub fn starts_with(&self, other: &Scope) -> bool {
        self.segments.starts_with(&other.segments)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    BuiltinVar,
    Var,
    DynamicVar,
    BuiltinFn,
    Fn,
}

impl EntityKind {
    pub fn is_function(&self) -> bool {
        matches!(self, EntityKind::BuiltinFn | EntityKind::Fn)
    }
}

/// A declared symbol
#[derive(Debug, Clone)]
pub struct Variable {
    pub kind: EntityKind,
    pub scope: Scope,
    pub name: String,
    pub ty: Type,
    /// Parameter types, functions only
    pub params: Vec<Type>,
    pub declared_at: Position,
    /// Code offset of the function entry, patched after linking
    pub function_ref: Option<u32>,
}

impl Variable {
    pub fn new(kind: EntityKind, scope: Scope, name: impl Into<String>, ty: Type) -> Self {
        Self {
            kind,
            scope,
            name: name.into(),
            ty,
            params: Vec::new(),
            declared_at: Position::default(),
            function_ref: None,
        }
    }

    pub fn with_params(mut self, params: Vec<Type>) -> Self {
        self.params = params;
        self
    }

    pub fn declared_at(mut self, position: Position) -> Self {
        self.declared_at = position;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Declared in exactly this scope
    Exact,
    /// Visible from this scope, innermost declaration wins
    Inherited,
}

/// The registry. Indices are stable positions and become variable-table indices.
#[derive(Debug, Default)]
pub struct Variables {
    entries: Vec<Variable>,
    by_name: FxHashMap<String, Vec<usize>>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol. Returns `Err(existing index)` on a duplicate (scope, name).
    pub fn add(&mut self, variable: Variable) -> Result<usize, usize> {
        if let Some(existing) = self.find(&variable.name, &variable.scope, Lookup::Exact) {
            return Err(existing);
        }

        let idx = self.entries.len();
        trace!(name = %variable.name, scope = %variable.scope, ty = %variable.ty, idx, "declare");
        self.by_name
            .entry(variable.name.clone())
            .or_default()
            .push(idx);
        self.entries.push(variable);
        Ok(idx)
    }

    pub fn find(&self, name: &str, scope: &Scope, lookup: Lookup) -> Option<usize> {
        let candidates = self.by_name.get(name)?;
        match lookup {
            Lookup::Exact => candidates
                .iter()
                .copied()
                .find(|&idx| self.entries[idx].scope == *scope),
            Lookup::Inherited => candidates
                .iter()
                .copied()
                .filter(|&idx| scope.starts_with(&self.entries[idx].scope))
                .max_by_key(|&idx| self.entries[idx].scope.depth()),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Variable> {
        self.entries.get(idx)
    }

    pub fn set_function_ref(&mut self, idx: usize, code_offset: u32) {
        if let Some(variable) = self.entries.get_mut(idx) {
            variable.function_ref = Some(code_offset);
        }
    }

    /// Static and dynamic variables declared exactly in `scope`
    pub fn declared_in<'a>(&'a self, scope: &'a Scope) -> impl Iterator<Item = usize> + 'a {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, v)| {
                matches!(v.kind, EntityKind::Var | EntityKind::DynamicVar) && v.scope == *scope
            })
            .map(|(idx, _)| idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(path: &[&str]) -> Scope {
        let mut scope = Scope::root();
        for segment in path {
            scope = scope.child(*segment);
        }
        scope
    }

    #[test]
    fn test_innermost_declaration_wins() {
        let mut vars = Variables::new();
        let outer = vars
            .add(Variable::new(EntityKind::Var, scope(&[]), "x", Type::Int))
            .unwrap();
        vars.add(Variable::new(EntityKind::Var, scope(&["1"]), "x", Type::Int))
            .unwrap();
        let inner = vars
            .add(Variable::new(EntityKind::Var, scope(&["1", "2"]), "x", Type::Int))
            .unwrap();

        assert_eq!(
            vars.find("x", &scope(&["1", "2", "3"]), Lookup::Inherited),
            Some(inner)
        );
        assert_eq!(vars.find("x", &scope(&["3"]), Lookup::Inherited), Some(outer));
        assert_eq!(vars.find("x", &scope(&["3"]), Lookup::Exact), None);
        assert_eq!(vars.find("y", &scope(&[]), Lookup::Inherited), None);
    }

    #[test]
    fn test_duplicate_declaration() {
        let mut vars = Variables::new();
        let first = vars
            .add(Variable::new(EntityKind::Var, scope(&[]), "a", Type::Int))
            .unwrap();
        assert_eq!(
            vars.add(Variable::new(EntityKind::Var, scope(&[]), "a", Type::Str)),
            Err(first)
        );
        assert!(vars
            .add(Variable::new(EntityKind::Var, scope(&["0"]), "a", Type::Str))
            .is_ok());
    }

    #[test]
    fn test_scope_prefix_is_segment_based() {
        // `0.1` must not be treated as a prefix of `0.10`
        assert!(!scope(&["10"]).starts_with(&scope(&["1"])));
        assert!(scope(&["1", "0"]).starts_with(&scope(&["1"])));

        let mut reduced = scope(&["f", "0"]);
        reduced.reduce();
        assert_eq!(reduced.to_string(), "0.f");
    }
}

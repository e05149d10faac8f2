// Quill Parse Diagnostics
// Status taxonomy and the diagnostic tree built while backtracking

use std::fmt;

use crate::error::{ErrorKind, Position, QuillError, Span};

/// Compile-time status codes. `Ok` and `Error` are overall results; every other
/// variant names the rule or check that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseStatus {
    Ok,
    Error,
    CompilationUnit,
    AssignmentExpression,
    AssignmentOperator,
    ConditionalExpression,
    LogicalOrExpression,
    CondExpMissingColon,
    LogicalAndExpression,
    RelationalExpression,
    RelationOperator,
    AdditiveExpression,
    AdditiveOperator,
    MultExpression,
    MultOperator,
    UnaryExpression,
    UnaryOperator,
    PostfixExpression,
    ArrayIndex,
    ArgumentList,
    ArgumentListExpression,
    Identifier,
    PrimaryExpression,
    StringExpression,
    UnsignedInteger,
    UnsignedFloat,
    VariableDeclaration,
    DuplicateVariableDeclaration,
    TypeDeclaration,
    IndexTypeDeclaration,
    IdentifierReservedWord,
    AssignmentDatatype,
    UnknownIdentifier,
    ArrayDatatype,
    DatatypeMismatch,
    ConditionalExpressionStatementsDatatypes,
    ConditionalExpressionConditionDatatype,
    ExpectedBooleanDatatype,
    ConditionalExpressionFalse,
    ConditionalExpressionTrue,
    BooleanValue,
    Literals,
    MissingFunctionArgumentList,
    IncompatibleFunctionArguments,
    BlockStatement,
    ArgumentListDeclaration,
    FunctionTypeDeclaration,
    FunctionNameInUse,
    FunctionDefinition,
    FunctionParametersDeclaration,
    TypeDeclarationMissingOf,
    TypeDeclarationMissingClosingBracket,
    TypeDeclarationMissingOpeningBracket,
    PrimaryExpressionMissingClosingBracket,
    NestingTooDeep,
}

impl ParseStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ParseStatus::Ok => "PARSE_OK",
            ParseStatus::Error => "PARSE_ERROR",
            ParseStatus::CompilationUnit => "PARSE_ERROR_COMPILATION_UNIT",
            ParseStatus::AssignmentExpression => "PARSE_ERROR_ASSIGNMENT_EXPRESSION",
            ParseStatus::AssignmentOperator => "PARSE_ERROR_ASSIGNMENT_OPERATOR",
            ParseStatus::ConditionalExpression => "PARSE_ERROR_CONDITIONAL_EXPRESSION",
            ParseStatus::LogicalOrExpression => "PARSE_ERROR_LOGICAL_OR_EXPRESSION",
            ParseStatus::CondExpMissingColon => "PARSE_ERROR_COND_EXP_MISSING_COLON",
            ParseStatus::LogicalAndExpression => "PARSE_ERROR_LOGICAL_AND_EXPRESSION",
            ParseStatus::RelationalExpression => "PARSE_ERROR_RELATIONAL_EXPRESSION",
            ParseStatus::RelationOperator => "PARSE_ERROR_RELATION_OPERATOR",
            ParseStatus::AdditiveExpression => "PARSE_ERROR_ADDITIVE_EXPRESSION",
            ParseStatus::AdditiveOperator => "PARSE_ERROR_ADDITIVE_OPERATOR",
            ParseStatus::MultExpression => "PARSE_ERROR_MULT_EXPRESSION",
            ParseStatus::MultOperator => "PARSE_ERROR_MULT_OPERATOR",
            ParseStatus::UnaryExpression => "PARSE_ERROR_UNARY_EXPRESSION",
            ParseStatus::UnaryOperator => "PARSE_ERROR_UNARY_OPERATOR",
            ParseStatus::PostfixExpression => "PARSE_ERROR_POSTFIX_EXPRESSION",
            ParseStatus::ArrayIndex => "PARSE_ERROR_ARRAY_INDEX",
            ParseStatus::ArgumentList => "PARSE_ERROR_ARGUMENT_LIST",
            ParseStatus::ArgumentListExpression => "PARSE_ERROR_ARGUMENTLIST_EXPRESSION",
            ParseStatus::Identifier => "PARSE_ERROR_IDENTIFIER",
            ParseStatus::PrimaryExpression => "PARSE_ERROR_PRIMARY_EXPRESSION",
            ParseStatus::StringExpression => "PARSE_ERROR_STRING_EXPRESSION",
            ParseStatus::UnsignedInteger => "PARSE_ERROR_UNSIGNED_INTEGER",
            ParseStatus::UnsignedFloat => "PARSE_ERROR_UNSIGNED_FLOAT",
            ParseStatus::VariableDeclaration => "PARSE_ERROR_VARIABLE_DECLARATION",
            ParseStatus::DuplicateVariableDeclaration => {
                "PARSE_ERROR_DUPLICATE_VARIABLE_DECLARATION"
            }
            ParseStatus::TypeDeclaration => "PARSE_ERROR_TYPE_DECLARATION",
            ParseStatus::IndexTypeDeclaration => "PARSE_ERROR_INDEX_TYPE_DECLARATION",
            ParseStatus::IdentifierReservedWord => "PARSE_ERROR_IDENTIFIER_RESERVED_WORD",
            ParseStatus::AssignmentDatatype => "PARSE_ERROR_ASSIGNMENT_DATATYPE",
            ParseStatus::UnknownIdentifier => "PARSE_ERROR_UNKNOWN_IDENTIFIER",
            ParseStatus::ArrayDatatype => "PARSE_ERROR_ARRAY_DATATYPE",
            ParseStatus::DatatypeMismatch => "PARSE_ERROR_DATATYPE_MISMATCH",
            ParseStatus::ConditionalExpressionStatementsDatatypes => {
                "PARSE_ERROR_CONDITIONAL_EXPRESSION_STATEMENTS_DATATYPES"
            }
            ParseStatus::ConditionalExpressionConditionDatatype => {
                "PARSE_ERROR_CONDITIONAL_EXPRESSION_CONDITION_DATATYPE"
            }
            ParseStatus::ExpectedBooleanDatatype => "PARSE_ERROR_EXPECTED_BOOLEAN_DATATYPE",
            ParseStatus::ConditionalExpressionFalse => "PARSE_ERROR_CONDITIONAL_EXPRESSION_FALSE",
            ParseStatus::ConditionalExpressionTrue => "PARSE_ERROR_CONDITIONAL_EXPRESSION_TRUE",
            ParseStatus::BooleanValue => "PARSE_ERROR_BOOLEAN_VALUE",
            ParseStatus::Literals => "PARSE_ERROR_LITERALS",
            ParseStatus::MissingFunctionArgumentList => {
                "PARSE_ERROR_MISSING_FUNCTION_ARGUMENT_LIST"
            }
            ParseStatus::IncompatibleFunctionArguments => {
                "PARSE_ERROR_INCOMPATIBLE_FUNCTION_ARGUMENTS"
            }
            ParseStatus::BlockStatement => "PARSE_ERROR_BLOCK_STATEMENT",
            ParseStatus::ArgumentListDeclaration => "PARSE_ERROR_ARGUMENT_LIST_DECLARATION",
            ParseStatus::FunctionTypeDeclaration => "PARSE_ERROR_FUNCTION_TYPE_DECLARATION",
            ParseStatus::FunctionNameInUse => "PARSE_ERROR_FUNCTION_NAME_IN_USE",
            ParseStatus::FunctionDefinition => "PARSE_ERROR_FUNCTION_DEFINITION",
            ParseStatus::FunctionParametersDeclaration => {
                "PARSE_ERROR_FUNCTION_PARAMETERS_DECLARATION"
            }
            ParseStatus::TypeDeclarationMissingOf => "PARSE_ERROR_TYPE_DECLARATION_MISSING_OF",
            ParseStatus::TypeDeclarationMissingClosingBracket => {
                "PARSE_ERROR_TYPE_DECLARATION_MISSING_CLOSING_BRACKET"
            }
            ParseStatus::TypeDeclarationMissingOpeningBracket => {
                "PARSE_ERROR_TYPE_DECLARATION_MISSING_OPENING_BRACKET"
            }
            ParseStatus::PrimaryExpressionMissingClosingBracket => {
                "PARSE_ERROR_PRIMARY_EXPRESSION_MISSING_CLOSING_BRACKET"
            }
            ParseStatus::NestingTooDeep => "PARSE_ERROR_NESTING_TOO_DEEP",
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ParseStatus::Ok
    }

    /// Human-readable summary used in error reports
    pub fn describe(&self) -> &'static str {
        match self {
            ParseStatus::DuplicateVariableDeclaration => "Variable is already declared in this scope",
            ParseStatus::FunctionNameInUse => "Function name is already in use",
            ParseStatus::UnknownIdentifier => "Unknown identifier",
            ParseStatus::IdentifierReservedWord => "Reserved word used as an identifier",
            ParseStatus::DatatypeMismatch | ParseStatus::AssignmentDatatype => "Datatype mismatch",
            ParseStatus::ExpectedBooleanDatatype
            | ParseStatus::ConditionalExpressionConditionDatatype => "Expected a boolean expression",
            ParseStatus::ConditionalExpressionStatementsDatatypes => {
                "Conditional branches have inconsistent datatypes"
            }
            ParseStatus::IncompatibleFunctionArguments => "Arguments do not match the function parameters",
            ParseStatus::ArrayDatatype => "Index list does not match the array declaration",
            ParseStatus::MissingFunctionArgumentList => "Function call requires an argument list",
            ParseStatus::CondExpMissingColon => "Expected ':' in conditional expression",
            ParseStatus::TypeDeclarationMissingOf => "Expected 'of' in array type",
            ParseStatus::TypeDeclarationMissingOpeningBracket => "Expected '[' in array type",
            ParseStatus::TypeDeclarationMissingClosingBracket => "Expected ']' in array type",
            ParseStatus::PrimaryExpressionMissingClosingBracket => "Expected ']' after index list",
            ParseStatus::StringExpression => "Malformed string literal",
            ParseStatus::UnsignedFloat => "Malformed float literal",
            ParseStatus::NestingTooDeep => "Expression or block nested too deeply",
            ParseStatus::Ok => "Compiled successfully",
            _ => "Syntax error",
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ParseStatus::DuplicateVariableDeclaration
            | ParseStatus::FunctionNameInUse
            | ParseStatus::UnknownIdentifier
            | ParseStatus::IdentifierReservedWord => ErrorKind::NameError,
            ParseStatus::DatatypeMismatch
            | ParseStatus::AssignmentDatatype
            | ParseStatus::ExpectedBooleanDatatype
            | ParseStatus::ConditionalExpressionConditionDatatype
            | ParseStatus::ConditionalExpressionStatementsDatatypes
            | ParseStatus::IncompatibleFunctionArguments
            | ParseStatus::ArrayDatatype => ErrorKind::TypeError,
            _ => ErrorKind::SyntaxError,
        }
    }
}

impl fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One node of the diagnostic tree
#[derive(Debug, Clone, PartialEq)]
pub struct ParseTrace {
    pub pos: Position,
    pub status: ParseStatus,
    pub confidence: i32,
    pub children: Vec<ParseTrace>,
}

impl Default for ParseTrace {
    fn default() -> Self {
        Self {
            pos: Position::default(),
            status: ParseStatus::Ok,
            confidence: -1,
            children: Vec::new(),
        }
    }
}

impl ParseTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf(pos: Position, status: ParseStatus) -> Self {
        Self {
            pos,
            status,
            ..Self::default()
        }
    }

    /// Close this node as a failure of `status` at `pos` and attach it to `parent`
    pub fn fail_into(mut self, parent: &mut ParseTrace, pos: Position, status: ParseStatus) {
        self.pos = pos;
        self.status = status;
        parent.children.push(self);
    }

    pub fn push(&mut self, child: ParseTrace) {
        self.children.push(child);
    }

    /// Leaf of the most recently attached failure chain. Sibling alternatives
    /// that reported continue come first, so the last child is the one that
    /// stopped the parse.
    pub fn deepest(&self) -> &ParseTrace {
        let mut node = self;
        while let Some(last) = node.children.last() {
            node = last;
        }
        node
    }

    /// The furthest source position reached by any failure node
    pub fn furthest(&self) -> Position {
        self.children
            .iter()
            .map(|c| c.furthest())
            .fold(self.pos, |a, b| if b.offset > a.offset { b } else { a })
    }

    /// Indented text rendering: `[offset; (row, col), confidence] STATUS`, one space per level
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, level: usize) {
        out.push_str(&" ".repeat(level));
        out.push_str(&self.label());
        out.push('\n');
        for child in &self.children {
            child.render_into(out, level + 1);
        }
    }

    pub fn label(&self) -> String {
        format!(
            "[{}; ({}, {}), {}] {}",
            self.pos.offset,
            self.pos.line + 1,
            self.pos.column + 1,
            self.confidence,
            self.status
        )
    }

    /// Host report pointing at the most specific failure
    pub fn to_error(&self, file: &str, source: &str) -> QuillError {
        let node = self.deepest();
        let pos = node.furthest();
        QuillError::new(
            node.status.error_kind(),
            node.status.describe(),
            Span::single(pos.line + 1, pos.column + 1, pos.offset),
            file,
        )
        .with_help(node.status.name())
        .with_source(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_indents_children() {
        let mut root = ParseTrace::leaf(Position::new(0, 0, 0), ParseStatus::Error);
        let mut unit = ParseTrace::new();
        unit.push(ParseTrace::leaf(
            Position::new(1, 4, 9),
            ParseStatus::DatatypeMismatch,
        ));
        unit.fail_into(&mut root, Position::new(0, 0, 0), ParseStatus::CompilationUnit);

        assert_eq!(
            root.render(),
            "[0; (1, 1), -1] PARSE_ERROR\n \
             [0; (1, 1), -1] PARSE_ERROR_COMPILATION_UNIT\n  \
             [9; (2, 5), -1] PARSE_ERROR_DATATYPE_MISMATCH\n"
        );
        assert_eq!(root.deepest().status, ParseStatus::DatatypeMismatch);
    }

    #[test]
    fn test_status_names_are_stable() {
        assert_eq!(ParseStatus::Ok.to_string(), "PARSE_OK");
        assert_eq!(
            ParseStatus::ArgumentListExpression.name(),
            "PARSE_ERROR_ARGUMENTLIST_EXPRESSION"
        );
        assert_eq!(ParseStatus::DatatypeMismatch.error_kind(), ErrorKind::TypeError);
    }
}

// Quill Error Handling Module
// Source positions, host-facing error reports and the runtime fault taxonomy

use colored::*;
use std::fmt;
use thiserror::Error;

use crate::compiler::opcode::OpCode;
use crate::vm::syscall::Builtin;
use crate::vm::value::ValueKind;

/// A cursor position in the source code.
///
/// `line` and `column` are zero-based while parsing; reports add one when rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

/// Represents a span in the source code (start to end position)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn single(line: usize, column: usize, offset: usize) -> Self {
        let pos = Position::new(line, column, offset);
        Self {
            start: pos,
            end: pos,
        }
    }
}

/// Types of errors in Quill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SyntaxError,
    TypeError,
    NameError,
    RuntimeError,
    DivisionByZero,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SyntaxError => write!(f, "SyntaxError"),
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::NameError => write!(f, "NameError"),
            ErrorKind::RuntimeError => write!(f, "RuntimeError"),
            ErrorKind::DivisionByZero => write!(f, "DivisionByZero"),
        }
    }
}

/// Error report handed to hosts (the CLI, editors)
#[derive(Debug, Clone)]
pub struct QuillError {
    pub kind: ErrorKind,
    pub message: String,
    /// One-based span; a zero line means "no source location"
    pub span: Span,
    pub file: String,
    pub help: Option<String>,
    source_lines: Vec<String>,
}

impl QuillError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        span: Span,
        file: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            file: file.into(),
            help: None,
            source_lines: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_lines = source.lines().map(String::from).collect();
        self
    }

    fn header_location(&self) -> String {
        if self.span.start.line == 0 {
            self.file.clone()
        } else {
            format!(
                "{}:{}:{}",
                self.file, self.span.start.line, self.span.start.column
            )
        }
    }

    /// Format the error for display, coloured for terminals
    pub fn format(&self) -> String {
        let mut output = format!(
            "{}: {} at {}\n",
            self.kind.to_string().red().bold(),
            self.message.white().bold(),
            self.header_location()
        );

        let error_line = self.span.start.line;
        if error_line > 0 && error_line <= self.source_lines.len() {
            output.push('\n');

            let start_line = if error_line > 1 { error_line - 1 } else { 1 };
            let end_line = (error_line + 1).min(self.source_lines.len());

            for line_num in start_line..=end_line {
                let line_content = &self.source_lines[line_num - 1];
                let line_num_str = format!("{:>4} |", line_num);

                if line_num == error_line {
                    output.push_str(&format!("{} {}\n", line_num_str.red(), line_content));
                    let spaces = " ".repeat(6 + self.span.start.column);
                    output.push_str(&format!("{}{}\n", spaces, "^".red().bold()));
                } else {
                    output.push_str(&format!("{} {}\n", line_num_str.dimmed(), line_content));
                }
            }
        }

        if let Some(ref help) = self.help {
            output.push_str(&format!("\n      {}: {}\n", "Help".cyan().bold(), help));
        }

        output
    }
}

impl fmt::Display for QuillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl std::error::Error for QuillError {}

/// Result type for host-facing Quill operations
pub type QuillResult<T> = Result<T, QuillError>;

impl QuillError {
    pub fn division_by_zero(file: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DivisionByZero,
            "Division by zero",
            Span::default(),
            file,
        )
    }
}

/// Fatal VM faults. Every variant halts the interpreter loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("invalid instruction byte")]
    InvalidInstruction,
    #[error("{op} expected an address operand")]
    ExpectedAddress { op: OpCode },
    #[error("{op} got inconsistent operand datatypes")]
    InconsistentDatatypes { op: OpCode },
    #[error("{op} got incompatible array datatypes")]
    InconsistentArrayDatatypes { op: OpCode },
    #[error("{op} does not support {kind} operands")]
    NotSupported { op: OpCode, kind: ValueKind },
    #[error("{op} divided by zero")]
    DivisionByZero { op: OpCode },
    #[error("condition is not a boolean")]
    ConditionExpectedBoolean,
    #[error("indexed value is not an array")]
    ExpectedArray,
    #[error("index datatypes do not match the array declaration")]
    InconsistentIndexDatatypes,
    #[error("{function} does not support {kind} arguments")]
    SyscallNotSupported { function: Builtin, kind: ValueKind },
    #[error("{function} got an argument of an inconsistent datatype")]
    SyscallInconsistentDatatypes { function: Builtin },
    #[error("unknown system function")]
    UnknownSyscall,
    #[error("RETURN without an active call frame")]
    NoReturnPoint,
    #[error("dynamic variable {index} has no slot in the active frame")]
    UnboundDynamicVariable { index: u32 },
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("operand stack overflow")]
    StackOverflow,
    #[error("call stack overflow")]
    FrameOverflow,
}

impl ExecError {
    /// Stable upper-case status name, e.g. `EXEC_ERROR_MUL_STRING_NOT_SUPPORTED`
    pub fn name(&self) -> String {
        match self {
            ExecError::InvalidInstruction => "EXEC_ERROR_INVALID_INSTRUCTION".to_string(),
            ExecError::ExpectedAddress { op } => format!("EXEC_ERROR_{}_EXPECTED_ADDRESS", op),
            ExecError::InconsistentDatatypes { op } => {
                format!("EXEC_ERROR_{}_INCONSISTENT_DATATYPES", op)
            }
            ExecError::InconsistentArrayDatatypes { op } => {
                format!("EXEC_ERROR_{}_INCONSISTENT_ARRAY_DATATYPES", op)
            }
            ExecError::NotSupported { op, kind } => format!(
                "EXEC_ERROR_{}_{}_NOT_SUPPORTED",
                op,
                kind.to_string().to_uppercase()
            ),
            ExecError::DivisionByZero { op } => format!("EXEC_ERROR_{}_DIV_BY_0", op),
            ExecError::ConditionExpectedBoolean => {
                "EXEC_ERROR_JUMPIFFALSE_CONDITION_EXPECTED_BOOLEAN".to_string()
            }
            ExecError::ExpectedArray => "EXEC_ERROR_PUTINDADDR_EXPECTED_ARRAY".to_string(),
            ExecError::InconsistentIndexDatatypes => {
                "EXEC_ERROR_PUTINDADDR_INCONSISTENT_INDEX_DATATYPES".to_string()
            }
            ExecError::SyscallNotSupported { function, kind } => format!(
                "EXEC_ERROR_SYSCALL_{}_{}_NOT_SUPPORTED",
                function.to_string().to_uppercase(),
                kind.to_string().to_uppercase()
            ),
            ExecError::SyscallInconsistentDatatypes { function } => format!(
                "EXEC_ERROR_SYSCALL_{}_INCONSISTENT_DATATYPES",
                function.to_string().to_uppercase()
            ),
            ExecError::UnknownSyscall => "EXEC_ERROR_SYSCALL_UNKNOWN_FUNCTION".to_string(),
            ExecError::NoReturnPoint => "EXEC_ERROR_RETURN_NO_RETURN_POINT".to_string(),
            ExecError::UnboundDynamicVariable { .. } => {
                "EXEC_ERROR_UNBOUND_DYNAMIC_VARIABLE".to_string()
            }
            ExecError::StackUnderflow => "EXEC_ERROR_STACK_UNDERFLOW".to_string(),
            ExecError::StackOverflow => "EXEC_ERROR_STACK_OVERFLOW".to_string(),
            ExecError::FrameOverflow => "EXEC_ERROR_FRAME_OVERFLOW".to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::DivisionByZero { .. } => ErrorKind::DivisionByZero,
            ExecError::InconsistentDatatypes { .. }
            | ExecError::InconsistentArrayDatatypes { .. }
            | ExecError::NotSupported { .. }
            | ExecError::ConditionExpectedBoolean
            | ExecError::InconsistentIndexDatatypes
            | ExecError::SyscallNotSupported { .. }
            | ExecError::SyscallInconsistentDatatypes { .. } => ErrorKind::TypeError,
            _ => ErrorKind::RuntimeError,
        }
    }
}

/// Outcome of a VM run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    OkRun,
    OkStop,
    Failed(ExecError),
}

impl ExecStatus {
    pub fn is_ok(&self) -> bool {
        !matches!(self, ExecStatus::Failed(_))
    }

    pub fn name(&self) -> String {
        match self {
            ExecStatus::OkRun => "OK_RUN".to_string(),
            ExecStatus::OkStop => "OK_STOP".to_string(),
            ExecStatus::Failed(err) => err.name(),
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl serde::Serialize for ExecStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl QuillError {
    /// Build a host report for a VM fault
    pub fn from_exec(err: ExecError, file: impl Into<String>) -> Self {
        match err {
            ExecError::DivisionByZero { .. } => Self::division_by_zero(file).with_help(err.name()),
            _ => Self::new(err.kind(), err.to_string(), Span::default(), file).with_help(err.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_error_names() {
        let err = ExecError::NotSupported {
            op: OpCode::Mul,
            kind: ValueKind::String,
        };
        assert_eq!(err.name(), "EXEC_ERROR_MUL_STRING_NOT_SUPPORTED");

        let err = ExecError::DivisionByZero { op: OpCode::MoveDiv };
        assert_eq!(err.name(), "EXEC_ERROR_MOVEDIV_DIV_BY_0");
        assert_eq!(err.kind(), ErrorKind::DivisionByZero);

        let err = ExecError::SyscallNotSupported {
            function: Builtin::Sin,
            kind: ValueKind::Boolean,
        };
        assert_eq!(err.name(), "EXEC_ERROR_SYSCALL_SIN_BOOLEAN_NOT_SUPPORTED");
    }

    #[test]
    fn test_exec_status_names() {
        assert_eq!(ExecStatus::OkStop.name(), "OK_STOP");
        assert!(ExecStatus::OkStop.is_ok());
        assert!(!ExecStatus::Failed(ExecError::NoReturnPoint).is_ok());
        assert_eq!(
            ExecStatus::Failed(ExecError::NoReturnPoint).to_string(),
            "EXEC_ERROR_RETURN_NO_RETURN_POINT"
        );
    }

    #[test]
    fn test_report_points_at_line() {
        colored::control::set_override(false);
        let err = QuillError::new(ErrorKind::TypeError, "mismatch", Span::single(2, 3, 0), "main.ql")
            .with_source("int a\na = \"x\"\n");
        let text = err.format();
        assert!(text.starts_with("TypeError: mismatch at main.ql:2:3"));
        assert!(text.contains("   2 | a = \"x\""));
    }
}

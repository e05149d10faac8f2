// Quill Parser
// Single-pass recursive descent: resolves names, checks types and emits bytecode

use tracing::debug;

use super::bytecode::Bytecode;
use super::opcode::OpCode;
use super::symbols::{EntityKind, Lookup, Scope, Variable, Variables};
use super::trace::{ParseStatus, ParseTrace};
use super::types::{consistent, consistent_assignment, consistent_call, max_type, Type};
use crate::error::Position;
use crate::vm::syscall::Builtin;

const RESERVED: &[&str] = &[
    "and", "or", "not", "int", "float", "string", "boolean", "array", "of", "function", "true",
    "false",
];

/// Deepest allowed nesting of expressions and blocks
const MAX_NESTING: usize = 64;

/// Output of a compilation run
#[derive(Debug)]
pub struct Compilation {
    pub status: ParseStatus,
    pub trace: ParseTrace,
    pub bytecode: Bytecode,
}

impl Compilation {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Compile source text into a linked program
pub fn parse(source: &str) -> Compilation {
    Parser::new(source).compile()
}

/// Failure signal of a grammar rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fail {
    /// Not this alternative; a sibling production may still match
    Continue,
    /// The alternative was recognised and is broken
    Stop,
}

type Rule<T> = Result<T, Fail>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Storage class of declarations in the current translation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataMode {
    Static,
    Dynamic,
}

struct Parser<'src> {
    source: &'src str,
    bytes: &'src [u8],
    pos: Position,
    variables: Variables,
    depth: usize,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: Position::default(),
            variables: Variables::new(),
            depth: 0,
        }
    }

    fn compile(mut self) -> Compilation {
        debug!(bytes = self.source.len(), "compiling");
        let root = Scope::root();
        let mut functions = Bytecode::new();

        let (truth, falsity) = self.register_builtins(&root, &mut functions);

        let mut trace = ParseTrace::new();
        let mut unit = Bytecode::new();
        let mut locals = Vec::new();
        if self
            .translation_unit(&mut trace, &mut unit, &mut functions, &root, DataMode::Static, &mut locals)
            .is_err()
        {
            trace.pos = Position::default();
            trace.status = ParseStatus::Error;
            debug!(status = %trace.deepest().status, "compilation failed");
            return Compilation {
                status: ParseStatus::Error,
                trace,
                bytecode: Bytecode::new(),
            };
        }

        let mut bytecode = Bytecode::new();
        for idx in self.variables.declared_in(&root) {
            bytecode.init_var(idx as u32);
        }
        for (idx, value) in [(truth, true), (falsity, false)] {
            bytecode.put_addr(idx as u32);
            bytecode.put_boolean(value);
            bytecode.emit(OpCode::Move);
        }
        bytecode += unit;
        bytecode += functions;

        let refs = bytecode.function_refs().to_vec();
        for r in refs {
            self.variables.set_function_ref(r.variable, r.offset as u32);
        }

        for v in self.variables.iter() {
            let scope = v.scope.to_string();
            match v.kind {
                EntityKind::BuiltinVar | EntityKind::Var => {
                    bytecode.data(&v.name, &scope, v.ty.clone());
                }
                EntityKind::DynamicVar => {
                    bytecode.ddata(&v.name, &scope, v.ty.clone());
                }
                EntityKind::BuiltinFn | EntityKind::Fn => {
                    bytecode.fun(
                        &v.name,
                        &scope,
                        v.ty.clone(),
                        v.params.clone(),
                        v.function_ref.unwrap_or(0),
                    );
                }
            }
        }

        debug!(
            code = bytecode.code.len(),
            symbols = bytecode.variables.len(),
            "compiled"
        );
        Compilation {
            status: ParseStatus::Ok,
            trace,
            bytecode,
        }
    }

    /// `true`, `false` and the math builtins. Each builtin function takes one
    /// float parameter `x` and forwards it to a syscall.
    fn register_builtins(&mut self, root: &Scope, functions: &mut Bytecode) -> (usize, usize) {
        let mut booleans = [0usize; 2];
        for (slot, name) in booleans.iter_mut().zip(["true", "false"]) {
            *slot = self
                .variables
                .add(Variable::new(EntityKind::BuiltinVar, root.clone(), name, Type::Bool))
                .unwrap_or_else(|existing| existing);
        }
        let [truth, falsity] = booleans;

        for builtin in [Builtin::Sin, Builtin::Cos] {
            let name = builtin.to_string();
            let fn_idx = self
                .variables
                .add(
                    Variable::new(EntityKind::BuiltinFn, root.clone(), name.as_str(), Type::Float)
                        .with_params(vec![Type::Float]),
                )
                .unwrap_or_else(|existing| existing);
            let param = self
                .variables
                .add(Variable::new(
                    EntityKind::DynamicVar,
                    root.child(name.as_str()),
                    "x",
                    Type::Float,
                ))
                .unwrap_or_else(|existing| existing);

            let entry = functions.alloc_var(fn_idx as u32);
            functions.add_function(fn_idx, entry);
            functions.alloc_vars(param as u32);
            functions.put_daddr(fn_idx as u32);
            functions.syscall(param as u32, &name);
            functions.emit(OpCode::Move);
            functions.ret(fn_idx as u32);
        }

        (truth, falsity)
    }

    // ==================== Cursor ====================

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos.offset).copied()
    }

    fn peek_is(&self, c: u8) -> bool {
        self.peek() == Some(c)
    }

    /// Consume one byte, tracking rows and columns
    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos.offset += 1;
            if c == b'\n' {
                self.pos.line += 1;
                self.pos.column = 0;
            } else {
                self.pos.column += 1;
            }
        }
    }

    fn whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.advance();
        }
    }

    fn is_terminal_at(&self, offset: usize) -> bool {
        match self.bytes.get(offset) {
            None => true,
            Some(&c) => matches!(
                c,
                b',' | b'+'
                    | b'-'
                    | b'*'
                    | b'/'
                    | b'('
                    | b')'
                    | b'['
                    | b']'
                    | b'{'
                    | b'}'
                    | b'.'
                    | b'<'
                    | b'>'
                    | b'!'
                    | b'='
                    | b'?'
                    | b':'
                    | b' '
                    | b'\t'
                    | b'\r'
                    | b'\n'
            ),
        }
    }

    fn is_terminal(&self) -> bool {
        self.is_terminal_at(self.pos.offset)
    }

    /// Skip whitespace and consume `c` if it is next; otherwise leave the cursor alone
    fn eat_symbol(&mut self, c: u8) -> bool {
        let start = self.pos;
        self.whitespace();
        if self.peek_is(c) {
            self.advance();
            true
        } else {
            self.pos = start;
            false
        }
    }

    /// Skip whitespace and consume the exact operator text
    fn eat_operator(&mut self, op: &str) -> bool {
        let start = self.pos;
        self.whitespace();
        if self.bytes[self.pos.offset..].starts_with(op.as_bytes()) {
            for _ in 0..op.len() {
                self.advance();
            }
            true
        } else {
            self.pos = start;
            false
        }
    }

    /// Skip whitespace and consume a case-insensitive keyword followed by a terminal
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let start = self.pos;
        self.whitespace();
        let end = self.pos.offset + keyword.len();
        let matches = self
            .bytes
            .get(self.pos.offset..end)
            .is_some_and(|word| word.eq_ignore_ascii_case(keyword.as_bytes()));
        if matches && self.is_terminal_at(end) {
            for _ in 0..keyword.len() {
                self.advance();
            }
            true
        } else {
            self.pos = start;
            false
        }
    }

    /// Record a failed rule under `trace`, rewind and propagate the signal
    fn reject<T>(
        &mut self,
        trace: &mut ParseTrace,
        child: ParseTrace,
        start: Position,
        status: ParseStatus,
        fail: Fail,
    ) -> Rule<T> {
        child.fail_into(trace, start, status);
        self.pos = start;
        Err(fail)
    }

    /// Run a recursive rule one nesting level deeper
    fn nested<T>(
        &mut self,
        trace: &mut ParseTrace,
        rule: impl FnOnce(&mut Self, &mut ParseTrace) -> Rule<T>,
    ) -> Rule<T> {
        if self.depth >= MAX_NESTING {
            trace.push(ParseTrace::leaf(self.pos, ParseStatus::NestingTooDeep));
            return Err(Fail::Stop);
        }
        self.depth += 1;
        let result = rule(self, trace);
        self.depth -= 1;
        result
    }

    // ==================== Statements ====================

    fn translation_unit(
        &mut self,
        trace: &mut ParseTrace,
        bc: &mut Bytecode,
        functions: &mut Bytecode,
        scope: &Scope,
        mode: DataMode,
        locals: &mut Vec<usize>,
    ) -> Rule<()> {
        let nested = !scope.is_root();
        let mut subscope = 0usize;

        loop {
            self.whitespace();
            let start = self.pos;
            match self.peek() {
                None if nested => {
                    return self.reject(
                        trace,
                        ParseTrace::new(),
                        start,
                        ParseStatus::CompilationUnit,
                        Fail::Stop,
                    )
                }
                None => {
                    bc.emit(OpCode::End);
                    return Ok(());
                }
                Some(b'}') if nested => return Ok(()),
                _ => {}
            }

            let mut child = ParseTrace::new();
            if let Err(fail) =
                self.statement(&mut child, bc, functions, scope, mode, locals, &mut subscope)
            {
                return self.reject(trace, child, start, ParseStatus::CompilationUnit, fail);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn statement(
        &mut self,
        trace: &mut ParseTrace,
        bc: &mut Bytecode,
        functions: &mut Bytecode,
        scope: &Scope,
        mode: DataMode,
        locals: &mut Vec<usize>,
        subscope: &mut usize,
    ) -> Rule<()> {
        let mut code = Bytecode::new();
        match self.assignment(trace, &mut code, scope) {
            Ok(()) => {
                *bc += code;
                return Ok(());
            }
            Err(Fail::Stop) => return Err(Fail::Stop),
            Err(Fail::Continue) => {}
        }

        match self.variable_declaration(trace, scope, mode, locals) {
            Ok(_) => return Ok(()),
            Err(Fail::Stop) => return Err(Fail::Stop),
            Err(Fail::Continue) => {}
        }

        let block_scope = scope.child(subscope.to_string());
        let mut block = Bytecode::new();
        let mut block_functions = Bytecode::new();
        match self.block_statement(
            trace,
            &mut block,
            &mut block_functions,
            &block_scope,
            mode,
            locals,
        ) {
            Ok(()) => {
                for idx in self.variables.declared_in(&block_scope) {
                    bc.init_var(idx as u32);
                }
                *bc += block;
                *functions += block_functions;
                *subscope += 1;
                return Ok(());
            }
            Err(Fail::Stop) => return Err(Fail::Stop),
            Err(Fail::Continue) => {}
        }

        let code = self.function_definition(trace, scope)?;
        *functions += code;
        *subscope += 1;
        Ok(())
    }

    fn block_statement(
        &mut self,
        trace: &mut ParseTrace,
        bc: &mut Bytecode,
        functions: &mut Bytecode,
        scope: &Scope,
        mode: DataMode,
        locals: &mut Vec<usize>,
    ) -> Rule<()> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        if !self.eat_symbol(b'{') {
            return self.reject(trace, child, start, ParseStatus::BlockStatement, Fail::Continue);
        }

        if self
            .nested(&mut child, |p, t| p.translation_unit(t, bc, functions, scope, mode, locals))
            .is_err()
            || !self.eat_symbol(b'}')
        {
            return self.reject(trace, child, start, ParseStatus::BlockStatement, Fail::Stop);
        }
        Ok(())
    }

    fn function_definition(&mut self, trace: &mut ParseTrace, scope: &Scope) -> Rule<Bytecode> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        if !self.eat_keyword("function") {
            return self.reject(trace, child, start, ParseStatus::FunctionDefinition, Fail::Continue);
        }

        let (name, existing) = match self.identifier(&mut child, scope, Lookup::Exact) {
            Ok(found) => found,
            Err(_) => {
                return self.reject(trace, child, start, ParseStatus::FunctionDefinition, Fail::Stop)
            }
        };
        if existing.is_some() {
            return self.reject(trace, child, start, ParseStatus::FunctionNameInUse, Fail::Stop);
        }
        let fn_scope = scope.child(name.as_str());

        let mut params = Vec::new();
        let mut param_types = Vec::new();
        if self.eat_symbol(b'(') {
            if !self.eat_symbol(b')') {
                if self
                    .function_parameters(&mut child, &fn_scope, &mut params, &mut param_types)
                    .is_err()
                {
                    return self.reject(
                        trace,
                        child,
                        start,
                        ParseStatus::ArgumentListDeclaration,
                        Fail::Stop,
                    );
                }
                if !self.eat_symbol(b')') {
                    return self.reject(
                        trace,
                        child,
                        start,
                        ParseStatus::ArgumentListDeclaration,
                        Fail::Stop,
                    );
                }
            }
        }

        if !self.eat_keyword("of") {
            return self.reject(trace, child, start, ParseStatus::FunctionTypeDeclaration, Fail::Stop);
        }
        let ty = match self.type_declaration(&mut child) {
            Ok(ty) => ty,
            Err(_) => {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::FunctionTypeDeclaration,
                    Fail::Stop,
                )
            }
        };

        let variable = Variable::new(EntityKind::Fn, scope.clone(), name.as_str(), ty)
            .with_params(param_types)
            .declared_at(start);
        let fn_idx = match self.variables.add(variable) {
            Ok(idx) => idx,
            Err(_) => {
                return self.reject(trace, child, start, ParseStatus::FunctionNameInUse, Fail::Stop)
            }
        };
        debug!(function = %name, scope = %fn_scope, idx = fn_idx, "function");

        let mut locals = Vec::new();
        let mut body = Bytecode::new();
        let mut nested = Bytecode::new();
        if self
            .block_statement(
                &mut child,
                &mut body,
                &mut nested,
                &fn_scope,
                DataMode::Dynamic,
                &mut locals,
            )
            .is_err()
        {
            return self.reject(trace, child, start, ParseStatus::FunctionDefinition, Fail::Stop);
        }

        let mut code = Bytecode::new();
        let entry = code.alloc_var(fn_idx as u32);
        code.add_function(fn_idx, entry);
        for &param in params.iter().rev() {
            code.alloc_vars(param as u32);
        }
        for &local in &locals {
            code.alloc_var(local as u32);
        }
        code += body;
        code.ret(fn_idx as u32);
        code += nested;
        Ok(code)
    }

    fn function_parameters(
        &mut self,
        trace: &mut ParseTrace,
        scope: &Scope,
        params: &mut Vec<usize>,
        types: &mut Vec<Type>,
    ) -> Rule<()> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        loop {
            let mut unused = Vec::new();
            match self.variable_declaration(&mut child, scope, DataMode::Dynamic, &mut unused) {
                Ok(idx) => {
                    params.push(idx);
                    if let Some(v) = self.variables.get(idx) {
                        types.push(v.ty.clone());
                    }
                }
                Err(_) => {
                    return self.reject(
                        trace,
                        child,
                        start,
                        ParseStatus::FunctionParametersDeclaration,
                        Fail::Stop,
                    )
                }
            }
            if !self.eat_symbol(b',') {
                return Ok(());
            }
        }
    }

    fn variable_declaration(
        &mut self,
        trace: &mut ParseTrace,
        scope: &Scope,
        mode: DataMode,
        locals: &mut Vec<usize>,
    ) -> Rule<usize> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let ty = match self.type_declaration(&mut child) {
            Ok(ty) => ty,
            Err(fail) => {
                return self.reject(trace, child, start, ParseStatus::VariableDeclaration, fail)
            }
        };
        let name = match self.identifier(&mut child, scope, Lookup::Exact) {
            Ok((name, _)) => name,
            Err(_) => {
                return self.reject(trace, child, start, ParseStatus::VariableDeclaration, Fail::Stop)
            }
        };

        let kind = match mode {
            DataMode::Static => EntityKind::Var,
            DataMode::Dynamic => EntityKind::DynamicVar,
        };
        let variable = Variable::new(kind, scope.clone(), name, ty).declared_at(start);
        match self.variables.add(variable) {
            Ok(idx) => {
                if mode == DataMode::Dynamic {
                    locals.push(idx);
                }
                Ok(idx)
            }
            Err(_) => self.reject(
                trace,
                child,
                start,
                ParseStatus::DuplicateVariableDeclaration,
                Fail::Stop,
            ),
        }
    }

    fn type_declaration(&mut self, trace: &mut ParseTrace) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        for (keyword, ty) in [
            ("int", Type::Int),
            ("float", Type::Float),
            ("string", Type::Str),
            ("boolean", Type::Bool),
        ] {
            if self.eat_keyword(keyword) {
                return Ok(ty);
            }
        }

        if !self.eat_keyword("array") {
            return self.reject(trace, child, start, ParseStatus::TypeDeclaration, Fail::Continue);
        }
        if !self.eat_symbol(b'[') {
            return self.reject(
                trace,
                child,
                start,
                ParseStatus::TypeDeclarationMissingOpeningBracket,
                Fail::Stop,
            );
        }
        let index = match self.index_types(&mut child) {
            Ok(index) => index,
            Err(_) => {
                return self.reject(trace, child, start, ParseStatus::TypeDeclaration, Fail::Stop)
            }
        };
        if !self.eat_symbol(b']') {
            return self.reject(
                trace,
                child,
                start,
                ParseStatus::TypeDeclarationMissingClosingBracket,
                Fail::Stop,
            );
        }
        if !self.eat_keyword("of") {
            return self.reject(
                trace,
                child,
                start,
                ParseStatus::TypeDeclarationMissingOf,
                Fail::Stop,
            );
        }
        match self.type_declaration(&mut child) {
            Ok(element) => Ok(Type::array(index, element)),
            Err(_) => self.reject(trace, child, start, ParseStatus::TypeDeclaration, Fail::Stop),
        }
    }

    /// Comma-separated scalar types of an array index
    fn index_types(&mut self, trace: &mut ParseTrace) -> Rule<Vec<Type>> {
        let start = self.pos;
        let child = ParseTrace::new();
        let mut index = Vec::new();
        loop {
            let ty = [
                ("int", Type::Int),
                ("float", Type::Float),
                ("string", Type::Str),
                ("boolean", Type::Bool),
            ]
            .into_iter()
            .find_map(|(keyword, ty)| self.eat_keyword(keyword).then_some(ty));
            match ty {
                Some(ty) => index.push(ty),
                None => {
                    return self.reject(
                        trace,
                        child,
                        start,
                        ParseStatus::IndexTypeDeclaration,
                        Fail::Stop,
                    )
                }
            }
            if !self.eat_symbol(b',') {
                return Ok(index);
            }
        }
    }

    // ==================== Expressions ====================

    fn assignment(&mut self, trace: &mut ParseTrace, bc: &mut Bytecode, scope: &Scope) -> Rule<()> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let target = match self.postfix(&mut child, bc, Side::Left, scope) {
            Ok(ty) => ty,
            Err(fail) => {
                return self.reject(trace, child, start, ParseStatus::AssignmentExpression, fail)
            }
        };

        let op = if self.eat_operator("+=") {
            OpCode::MoveAdd
        } else if self.eat_operator("-=") {
            OpCode::MoveSubtr
        } else if self.eat_operator("*=") {
            OpCode::MoveMul
        } else if self.eat_operator("/=") {
            OpCode::MoveDiv
        } else if self.eat_operator("=") {
            OpCode::Move
        } else {
            child.push(ParseTrace::leaf(self.pos, ParseStatus::AssignmentOperator));
            return self.reject(trace, child, start, ParseStatus::AssignmentExpression, Fail::Stop);
        };

        let value = match self.conditional(&mut child, bc, scope) {
            Ok(ty) => ty,
            Err(_) => {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::AssignmentExpression,
                    Fail::Stop,
                )
            }
        };

        let accepted = consistent_assignment(&target, &value)
            && match op {
                OpCode::MoveAdd | OpCode::MoveSubtr => {
                    (target.is_numeric() && value.is_numeric())
                        || (target == Type::Str && value == Type::Str)
                        || (target.is_array() && value.is_array())
                }
                OpCode::MoveMul => target.is_numeric() && value.is_numeric(),
                OpCode::MoveDiv => target == Type::Float && value.is_numeric(),
                _ => true,
            };
        if !accepted {
            return self.reject(trace, child, start, ParseStatus::AssignmentDatatype, Fail::Stop);
        }

        bc.emit(op);
        Ok(())
    }

    fn conditional(&mut self, trace: &mut ParseTrace, bc: &mut Bytecode, scope: &Scope) -> Rule<Type> {
        self.nested(trace, |p, t| p.conditional_expression(t, bc, scope))
    }

    fn conditional_expression(
        &mut self,
        trace: &mut ParseTrace,
        bc: &mut Bytecode,
        scope: &Scope,
    ) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let condition = match self.logical_or(&mut child, bc, scope) {
            Ok(ty) => ty,
            Err(fail) => {
                return self.reject(trace, child, start, ParseStatus::ConditionalExpression, fail)
            }
        };
        if !self.eat_symbol(b'?') {
            return Ok(condition);
        }
        if condition != Type::Bool {
            return self.reject(
                trace,
                child,
                start,
                ParseStatus::ConditionalExpressionConditionDatatype,
                Fail::Stop,
            );
        }

        let branch = bc.jump_if_false(0);
        let when_true = match self.conditional(&mut child, bc, scope) {
            Ok(ty) => ty,
            Err(_) => {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::ConditionalExpressionTrue,
                    Fail::Stop,
                )
            }
        };
        let skip = bc.jump(0);

        if !self.eat_symbol(b':') {
            child.push(ParseTrace::leaf(self.pos, ParseStatus::CondExpMissingColon));
            return self.reject(trace, child, start, ParseStatus::ConditionalExpression, Fail::Stop);
        }
        let else_offset = bc.current_offset() as u32;
        bc.set_address(branch + 1, else_offset);

        let when_false = match self.conditional(&mut child, bc, scope) {
            Ok(ty) => ty,
            Err(_) => {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::ConditionalExpressionFalse,
                    Fail::Stop,
                )
            }
        };
        if !consistent(&when_true, &when_false) {
            return self.reject(
                trace,
                child,
                start,
                ParseStatus::ConditionalExpressionStatementsDatatypes,
                Fail::Stop,
            );
        }
        let end_offset = bc.current_offset() as u32;
        bc.set_address(skip + 1, end_offset);

        Ok(max_type(&when_true, &when_false).unwrap_or(when_true))
    }

    fn logical_or(&mut self, trace: &mut ParseTrace, bc: &mut Bytecode, scope: &Scope) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let mut ty = match self.logical_and(&mut child, bc, scope) {
            Ok(ty) => ty,
            Err(fail) => {
                return self.reject(trace, child, start, ParseStatus::LogicalOrExpression, fail)
            }
        };
        while self.eat_keyword("or") {
            let rhs = match self.logical_and(&mut child, bc, scope) {
                Ok(rhs) => rhs,
                Err(_) => {
                    return self.reject(
                        trace,
                        child,
                        start,
                        ParseStatus::LogicalOrExpression,
                        Fail::Stop,
                    )
                }
            };
            if ty != Type::Bool || rhs != Type::Bool {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::ExpectedBooleanDatatype,
                    Fail::Stop,
                );
            }
            bc.emit(OpCode::Add);
            ty = rhs;
        }
        Ok(ty)
    }

    fn logical_and(&mut self, trace: &mut ParseTrace, bc: &mut Bytecode, scope: &Scope) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let mut ty = match self.relational(&mut child, bc, scope) {
            Ok(ty) => ty,
            Err(fail) => {
                return self.reject(trace, child, start, ParseStatus::LogicalAndExpression, fail)
            }
        };
        while self.eat_keyword("and") {
            let rhs = match self.relational(&mut child, bc, scope) {
                Ok(rhs) => rhs,
                Err(_) => {
                    return self.reject(
                        trace,
                        child,
                        start,
                        ParseStatus::LogicalAndExpression,
                        Fail::Stop,
                    )
                }
            };
            if ty != Type::Bool || rhs != Type::Bool {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::ExpectedBooleanDatatype,
                    Fail::Stop,
                );
            }
            bc.emit(OpCode::Mul);
            ty = rhs;
        }
        Ok(ty)
    }

    fn relation_operator(&mut self) -> Option<OpCode> {
        [
            ("==", OpCode::Equal),
            ("!=", OpCode::NotEqual),
            ("<=", OpCode::LessEqual),
            (">=", OpCode::GreaterEqual),
            ("<", OpCode::Less),
            (">", OpCode::Greater),
        ]
        .into_iter()
        .find_map(|(text, op)| self.eat_operator(text).then_some(op))
    }

    fn relational(&mut self, trace: &mut ParseTrace, bc: &mut Bytecode, scope: &Scope) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let lhs = match self.additive(&mut child, bc, scope) {
            Ok(ty) => ty,
            Err(fail) => {
                return self.reject(trace, child, start, ParseStatus::RelationalExpression, fail)
            }
        };
        let Some(op) = self.relation_operator() else {
            return Ok(lhs);
        };
        let rhs = match self.additive(&mut child, bc, scope) {
            Ok(ty) => ty,
            Err(_) => {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::RelationalExpression,
                    Fail::Stop,
                )
            }
        };
        if !consistent(&lhs, &rhs) {
            return self.reject(trace, child, start, ParseStatus::DatatypeMismatch, Fail::Stop);
        }
        bc.emit(op);
        Ok(Type::Bool)
    }

    fn additive_operator(&mut self) -> Option<OpCode> {
        let start = self.pos;
        self.whitespace();
        // `+=` and `-=` belong to the assignment, never to the expression
        let op = match (self.peek(), self.bytes.get(self.pos.offset + 1)) {
            (Some(b'+'), next) if next != Some(&b'=') => Some(OpCode::Add),
            (Some(b'-'), next) if next != Some(&b'=') => Some(OpCode::Sub),
            _ => None,
        };
        match op {
            Some(_) => self.advance(),
            None => self.pos = start,
        }
        op
    }

    fn additive(&mut self, trace: &mut ParseTrace, bc: &mut Bytecode, scope: &Scope) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let mut ty = match self.mult(&mut child, bc, scope) {
            Ok(ty) => ty,
            Err(fail) => {
                return self.reject(trace, child, start, ParseStatus::AdditiveExpression, fail)
            }
        };
        while let Some(op) = self.additive_operator() {
            let rhs = match self.mult(&mut child, bc, scope) {
                Ok(rhs) => rhs,
                Err(_) => {
                    return self.reject(
                        trace,
                        child,
                        start,
                        ParseStatus::AdditiveExpression,
                        Fail::Stop,
                    )
                }
            };
            ty = if ty.is_numeric() && rhs.is_numeric() {
                max_type(&ty, &rhs).unwrap_or(Type::Float)
            } else if ty == Type::Str && rhs == Type::Str {
                Type::Str
            } else {
                return self.reject(trace, child, start, ParseStatus::DatatypeMismatch, Fail::Stop);
            };
            bc.emit(op);
        }
        Ok(ty)
    }

    fn mult_operator(&mut self) -> Option<OpCode> {
        let start = self.pos;
        self.whitespace();
        let op = match (self.peek(), self.bytes.get(self.pos.offset + 1)) {
            (Some(b'*'), next) if next != Some(&b'=') => Some(OpCode::Mul),
            (Some(b'/'), next) if next != Some(&b'=') => Some(OpCode::Div),
            _ => None,
        };
        match op {
            Some(_) => self.advance(),
            None => self.pos = start,
        }
        op
    }

    fn mult(&mut self, trace: &mut ParseTrace, bc: &mut Bytecode, scope: &Scope) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let mut ty = match self.unary(&mut child, bc, Side::Right, scope) {
            Ok(ty) => ty,
            Err(fail) => return self.reject(trace, child, start, ParseStatus::MultExpression, fail),
        };
        while let Some(op) = self.mult_operator() {
            let rhs = match self.unary(&mut child, bc, Side::Right, scope) {
                Ok(rhs) => rhs,
                Err(_) => {
                    return self.reject(trace, child, start, ParseStatus::MultExpression, Fail::Stop)
                }
            };
            if !ty.is_numeric() || !rhs.is_numeric() {
                return self.reject(trace, child, start, ParseStatus::DatatypeMismatch, Fail::Stop);
            }
            ty = match op {
                OpCode::Div => Type::Float,
                _ => max_type(&ty, &rhs).unwrap_or(Type::Float),
            };
            bc.emit(op);
        }
        Ok(ty)
    }

    fn unary(
        &mut self,
        trace: &mut ParseTrace,
        bc: &mut Bytecode,
        side: Side,
        scope: &Scope,
    ) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();

        let negate = side == Side::Right && self.eat_symbol(b'-');
        let invert = side == Side::Right && !negate && self.eat_keyword("not");
        if !negate && !invert {
            return match self.postfix(&mut child, bc, side, scope) {
                Ok(ty) => Ok(ty),
                Err(fail) => self.reject(trace, child, start, ParseStatus::UnaryExpression, fail),
            };
        }

        let ty = match self.nested(&mut child, |p, t| p.unary(t, bc, side, scope)) {
            Ok(ty) => ty,
            Err(_) => {
                return self.reject(trace, child, start, ParseStatus::UnaryExpression, Fail::Stop)
            }
        };
        let accepted = if negate {
            ty.is_numeric()
        } else {
            ty == Type::Bool
        };
        if !accepted {
            return self.reject(trace, child, start, ParseStatus::DatatypeMismatch, Fail::Stop);
        }
        bc.emit(OpCode::Neg);
        Ok(ty)
    }

    fn postfix(
        &mut self,
        trace: &mut ParseTrace,
        bc: &mut Bytecode,
        side: Side,
        scope: &Scope,
    ) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        self.whitespace();

        if side == Side::Right {
            match self.literals(&mut child, bc) {
                Ok(ty) => return Ok(ty),
                Err(Fail::Stop) => {
                    return self.reject(trace, child, start, ParseStatus::PostfixExpression, Fail::Stop)
                }
                Err(Fail::Continue) => {}
            }

            if self.eat_symbol(b'(') {
                let ty = self.conditional(&mut child, bc, scope);
                return match ty {
                    Ok(ty) if self.eat_symbol(b')') => Ok(ty),
                    _ => self.reject(trace, child, start, ParseStatus::PostfixExpression, Fail::Stop),
                };
            }
        }

        let mut lookup = scope.clone();
        let mut reduced = false;
        while self.peek_is(b'.') {
            self.advance();
            lookup.reduce();
            reduced = true;
        }

        match self.primary(&mut child, bc, side, &lookup) {
            Ok(_) if self.peek_is(b'.') => {
                child.push(ParseTrace::leaf(self.pos, ParseStatus::PostfixExpression));
                self.reject(trace, child, start, ParseStatus::PostfixExpression, Fail::Stop)
            }
            Ok(ty) => Ok(ty),
            Err(fail) => {
                let fail = if reduced { Fail::Stop } else { fail };
                self.reject(trace, child, start, ParseStatus::PostfixExpression, fail)
            }
        }
    }

    fn primary(
        &mut self,
        trace: &mut ParseTrace,
        bc: &mut Bytecode,
        side: Side,
        scope: &Scope,
    ) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let (name, found) = match self.identifier(&mut child, scope, Lookup::Inherited) {
            Ok(found) => found,
            Err(fail) => {
                return self.reject(trace, child, start, ParseStatus::PrimaryExpression, fail)
            }
        };
        let Some(variable) = found.and_then(|idx| self.variables.get(idx).cloned()) else {
            debug!(name = %name, scope = %scope, "unknown identifier");
            return self.reject(trace, child, start, ParseStatus::UnknownIdentifier, Fail::Stop);
        };
        let idx = found.unwrap_or_default() as u32;

        if variable.kind.is_function() {
            if side == Side::Left {
                bc.put_daddr(idx);
                return Ok(variable.ty);
            }
            if !self.peek_is(b'(') {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::MissingFunctionArgumentList,
                    Fail::Stop,
                );
            }
            self.advance();

            let args = if variable.params.is_empty() && self.eat_symbol(b')') {
                Vec::new()
            } else {
                let args = match self.argument_list(&mut child, bc, scope) {
                    Ok(args) => args,
                    Err(_) => {
                        return self.reject(trace, child, start, ParseStatus::ArgumentList, Fail::Stop)
                    }
                };
                if !self.eat_symbol(b')') {
                    return self.reject(trace, child, start, ParseStatus::ArgumentList, Fail::Stop);
                }
                args
            };
            if !consistent_call(&variable.params, &args) {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::IncompatibleFunctionArguments,
                    Fail::Stop,
                );
            }
            bc.call(idx);
            return Ok(variable.ty);
        }

        match variable.kind {
            EntityKind::DynamicVar => bc.put_daddr(idx),
            _ => bc.put_addr(idx),
        };

        let mut ty = variable.ty;
        while self.peek_is(b'[') {
            self.advance();
            let mut index_trace = ParseTrace::new();
            let index_start = self.pos;
            let args = match self.argument_list(&mut index_trace, bc, scope) {
                Ok(args) => args,
                Err(_) => {
                    index_trace.fail_into(&mut child, index_start, ParseStatus::ArrayIndex);
                    return self.reject(trace, child, start, ParseStatus::PrimaryExpression, Fail::Stop);
                }
            };
            if !self.eat_symbol(b']') {
                return self.reject(
                    trace,
                    child,
                    start,
                    ParseStatus::PrimaryExpressionMissingClosingBracket,
                    Fail::Stop,
                );
            }
            ty = match ty {
                Type::Array { index, element } if index == args => *element,
                _ => {
                    index_trace.fail_into(&mut child, index_start, ParseStatus::ArrayDatatype);
                    return self.reject(trace, child, start, ParseStatus::ArrayIndex, Fail::Stop);
                }
            };
            bc.put_ind_addr(args.len() as u8);
        }
        Ok(ty)
    }

    fn argument_list(&mut self, trace: &mut ParseTrace, bc: &mut Bytecode, scope: &Scope) -> Rule<Vec<Type>> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        let mut types = Vec::new();
        loop {
            match self.conditional(&mut child, bc, scope) {
                Ok(ty) => types.push(ty),
                Err(_) => {
                    return self.reject(
                        trace,
                        child,
                        start,
                        ParseStatus::ArgumentListExpression,
                        Fail::Stop,
                    )
                }
            }
            if !self.eat_symbol(b',') {
                return Ok(types);
            }
        }
    }

    // ==================== Terminals ====================

    /// Resolve an identifier. The name is returned even when lookup finds nothing.
    fn identifier(
        &mut self,
        trace: &mut ParseTrace,
        scope: &Scope,
        lookup: Lookup,
    ) -> Rule<(String, Option<usize>)> {
        let start = self.pos;
        let mut child = ParseTrace::new();
        self.whitespace();
        let begin = self.pos.offset;

        if !matches!(self.peek(), Some(c) if c.is_ascii_alphabetic() || c == b'_') {
            return self.reject(trace, child, start, ParseStatus::Identifier, Fail::Continue);
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.advance();
        }
        if !self.is_terminal() {
            return self.reject(trace, child, start, ParseStatus::Identifier, Fail::Continue);
        }

        let name = &self.source[begin..self.pos.offset];
        if RESERVED.iter().any(|word| word.eq_ignore_ascii_case(name)) {
            child.push(ParseTrace::leaf(start, ParseStatus::IdentifierReservedWord));
            return self.reject(trace, child, start, ParseStatus::Identifier, Fail::Continue);
        }
        Ok((name.to_string(), self.variables.find(name, scope, lookup)))
    }

    fn literals(&mut self, trace: &mut ParseTrace, bc: &mut Bytecode) -> Rule<Type> {
        let start = self.pos;
        let mut child = ParseTrace::new();

        match self.string_literal(&mut child) {
            Ok(value) => {
                bc.put_string(&value);
                return Ok(Type::Str);
            }
            Err(Fail::Stop) => {
                return self.reject(trace, child, start, ParseStatus::Literals, Fail::Stop)
            }
            Err(Fail::Continue) => {}
        }
        match self.unsigned_float(&mut child) {
            Ok(value) => {
                bc.put_float(value);
                return Ok(Type::Float);
            }
            Err(Fail::Stop) => {
                return self.reject(trace, child, start, ParseStatus::Literals, Fail::Stop)
            }
            Err(Fail::Continue) => {}
        }
        match self.unsigned_integer(&mut child) {
            Ok(value) => {
                bc.put_int(value);
                return Ok(Type::Int);
            }
            Err(Fail::Stop) => {
                return self.reject(trace, child, start, ParseStatus::Literals, Fail::Stop)
            }
            Err(Fail::Continue) => {}
        }
        if self.eat_keyword("true") {
            bc.put_boolean(true);
            return Ok(Type::Bool);
        }
        if self.eat_keyword("false") {
            bc.put_boolean(false);
            return Ok(Type::Bool);
        }
        child.push(ParseTrace::leaf(start, ParseStatus::BooleanValue));
        self.reject(trace, child, start, ParseStatus::Literals, Fail::Continue)
    }

    fn string_literal(&mut self, trace: &mut ParseTrace) -> Rule<String> {
        let start = self.pos;
        let child = ParseTrace::new();
        self.whitespace();
        if !self.peek_is(b'"') {
            return self.reject(trace, child, start, ParseStatus::StringExpression, Fail::Continue);
        }
        self.advance();

        let begin = self.pos.offset;
        loop {
            match self.peek() {
                None => {
                    return self.reject(trace, child, start, ParseStatus::StringExpression, Fail::Stop)
                }
                Some(b'"') => break,
                Some(b'\\') if matches!(self.bytes.get(self.pos.offset + 1), Some(b'"' | b'\\')) => {
                    self.advance();
                    self.advance();
                }
                Some(_) => self.advance(),
            }
        }
        let value = self.source[begin..self.pos.offset].to_string();
        self.advance();

        if !self.is_terminal() {
            return self.reject(trace, child, start, ParseStatus::StringExpression, Fail::Stop);
        }
        Ok(value)
    }

    fn digits(&mut self) -> usize {
        let begin = self.pos.offset;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        self.pos.offset - begin
    }

    fn unsigned_float(&mut self, trace: &mut ParseTrace) -> Rule<f64> {
        let start = self.pos;
        let child = ParseTrace::new();
        self.whitespace();
        let begin = self.pos.offset;

        if self.digits() == 0 || !self.peek_is(b'.') {
            return self.reject(trace, child, start, ParseStatus::UnsignedFloat, Fail::Continue);
        }
        self.advance();
        if self.digits() == 0 || !self.is_terminal() {
            return self.reject(trace, child, start, ParseStatus::UnsignedFloat, Fail::Stop);
        }
        match self.source[begin..self.pos.offset].parse::<f64>() {
            Ok(value) => Ok(value),
            Err(_) => self.reject(trace, child, start, ParseStatus::UnsignedFloat, Fail::Stop),
        }
    }

    fn unsigned_integer(&mut self, trace: &mut ParseTrace) -> Rule<i64> {
        let start = self.pos;
        let child = ParseTrace::new();
        self.whitespace();
        let begin = self.pos.offset;

        if self.digits() == 0 || !self.is_terminal() {
            return self.reject(trace, child, start, ParseStatus::UnsignedInteger, Fail::Continue);
        }
        match self.source[begin..self.pos.offset].parse::<i64>() {
            Ok(value) => Ok(value),
            Err(_) => self.reject(trace, child, start, ParseStatus::UnsignedInteger, Fail::Stop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::bytecode::{EntryKind, Instruction};

    fn compile_ok(source: &str) -> Bytecode {
        let compilation = parse(source);
        assert_eq!(
            compilation.status,
            ParseStatus::Ok,
            "{}",
            compilation.trace.render()
        );
        compilation.bytecode
    }

    fn failure(source: &str) -> ParseStatus {
        let compilation = parse(source);
        assert_eq!(compilation.status, ParseStatus::Error);
        compilation.trace.deepest().status
    }

    fn ops(bytecode: &Bytecode) -> Vec<Instruction> {
        bytecode
            .instructions()
            .unwrap()
            .into_iter()
            .map(|(_, i)| i)
            .collect()
    }

    fn index_of(bytecode: &Bytecode, name: &str) -> u32 {
        bytecode
            .variables
            .iter()
            .position(|entry| entry.name == name)
            .unwrap() as u32
    }

    #[test]
    fn test_empty_source_compiles_to_end() {
        let bytecode = compile_ok("   \n ");
        let main: Vec<_> = ops(&bytecode)
            .into_iter()
            .take_while(|i| *i != Instruction::End)
            .collect();
        // only the true/false initialisation precedes END
        assert_eq!(main.len(), 6);
        assert_eq!(main[1], Instruction::PutBoolean(true));
        assert_eq!(main[4], Instruction::PutBoolean(false));
    }

    #[test]
    fn test_declaration_and_assignment() {
        let bytecode = compile_ok("int a a = 5");
        let a = index_of(&bytecode, "a");
        let code = ops(&bytecode);
        assert_eq!(code[0], Instruction::InitVar(a));
        let end = code.iter().position(|i| *i == Instruction::End).unwrap();
        assert_eq!(
            &code[end - 3..end],
            &[Instruction::PutAddr(a), Instruction::PutInt(5), Instruction::Move]
        );
        assert!(matches!(
            bytecode.variables[a as usize].kind,
            EntryKind::Data
        ));
    }

    #[test]
    fn test_literal_kinds() {
        let bytecode = compile_ok("string s float f boolean b s = \"a\\\"b\" f = 2.5 b = not true");
        let code = ops(&bytecode);
        assert!(code.contains(&Instruction::PutString("a\\\"b".to_string())));
        assert!(code.contains(&Instruction::PutFloat(2.5)));
        assert!(code.contains(&Instruction::PutBoolean(true)));
        assert!(code.contains(&Instruction::Neg));
    }

    #[test]
    fn test_operator_precedence() {
        let bytecode = compile_ok("int a a = 1 + 2 * 3");
        let a = index_of(&bytecode, "a");
        let code = ops(&bytecode);
        let end = code.iter().position(|i| *i == Instruction::End).unwrap();
        assert_eq!(
            code[end - 7..end].to_vec(),
            vec![
                Instruction::PutAddr(a),
                Instruction::PutInt(1),
                Instruction::PutInt(2),
                Instruction::PutInt(3),
                Instruction::Mul,
                Instruction::Add,
                Instruction::Move,
            ]
        );
    }

    #[test]
    fn test_type_errors() {
        assert_eq!(failure("int a a = \"x\""), ParseStatus::AssignmentDatatype);
        assert_eq!(failure("int a a = 2.5"), ParseStatus::AssignmentDatatype);
        assert_eq!(failure("int a a = 4 / 2"), ParseStatus::AssignmentDatatype);
        assert_eq!(failure("boolean b b = 1 and true"), ParseStatus::ExpectedBooleanDatatype);
        assert_eq!(failure("int a a = 1 < \"x\" ? 1 : 2"), ParseStatus::DatatypeMismatch);
        assert_eq!(
            failure("int a a = 1 ? 1 : 2"),
            ParseStatus::ConditionalExpressionConditionDatatype
        );
        assert_eq!(
            failure("int a a = true ? 1 : \"s\""),
            ParseStatus::ConditionalExpressionStatementsDatatypes
        );
        assert_eq!(failure("int a a /= 2"), ParseStatus::AssignmentDatatype);
    }

    #[test]
    fn test_int_widens_to_float() {
        compile_ok("float f f = 1 f += 2 f /= 4 f = 1 + 2.5");
    }

    #[test]
    fn test_name_errors() {
        assert_eq!(failure("x = 1"), ParseStatus::UnknownIdentifier);
        assert_eq!(
            failure("int a int a"),
            ParseStatus::DuplicateVariableDeclaration
        );
        assert_eq!(
            failure("function f of int { } function f of int { }"),
            ParseStatus::FunctionNameInUse
        );
        assert_eq!(failure("function f { }"), ParseStatus::FunctionTypeDeclaration);
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("int a a = {}1{}", "(".repeat(2000), ")".repeat(2000));
        let compilation = parse(&deep);
        assert!(!compilation.is_ok());
        assert_eq!(compilation.trace.deepest().status, ParseStatus::NestingTooDeep);

        assert_eq!(
            failure(&format!("int a a = {}1", "-".repeat(2000))),
            ParseStatus::NestingTooDeep
        );
        assert_eq!(
            failure(&format!("{}{}", "{".repeat(2000), "}".repeat(2000))),
            ParseStatus::NestingTooDeep
        );

        compile_ok(&format!("int a a = {}1{}", "(".repeat(20), ")".repeat(20)));
        compile_ok(&format!("{}{}", "{".repeat(20), "}".repeat(20)));
    }

    #[test]
    fn test_shadowing_in_blocks() {
        let bytecode = compile_ok("int x { string x x = \"s\" } x = 1");
        let entries: Vec<_> = bytecode
            .variables
            .iter()
            .filter(|e| e.name == "x")
            .map(|e| e.qualified_name())
            .collect();
        // the builtin parameters `0.sin.x` and `0.cos.x` come first
        assert_eq!(
            entries[2..].to_vec(),
            vec!["0.x".to_string(), "0.0.x".to_string()]
        );
    }

    #[test]
    fn test_leading_dot_reduces_scope() {
        compile_ok("int x { string x .x = 1 x = \"s\" }");
        assert_eq!(failure("int x { x. = 1 }"), ParseStatus::PostfixExpression);
    }

    #[test]
    fn test_ternary_back_patching() {
        let bytecode = compile_ok("int a a = true ? 1 : 2");
        let code = bytecode.instructions().unwrap();
        let (jif_at, jif) = code
            .iter()
            .find(|(_, i)| matches!(i, Instruction::JumpIfFalse(_)))
            .cloned()
            .unwrap();
        let (_, jump) = code
            .iter()
            .find(|(_, i)| matches!(i, Instruction::Jump(_)))
            .cloned()
            .unwrap();
        let Instruction::JumpIfFalse(else_target) = jif else { unreachable!() };
        let Instruction::Jump(end_target) = jump else { unreachable!() };

        let at = |offset: u32| {
            code.iter()
                .find(|(o, _)| *o == offset as usize)
                .map(|(_, i)| i.clone())
        };
        assert!(else_target as usize > jif_at);
        assert_eq!(at(else_target), Some(Instruction::PutInt(2)));
        assert_eq!(at(end_target), Some(Instruction::Move));
    }

    #[test]
    fn test_function_layout() {
        let bytecode = compile_ok("function add(int a, int b) of int { int t t = a + b add = t } int r r = add(1, 2)");
        let add = index_of(&bytecode, "add");
        let a = index_of(&bytecode, "a");
        let b = index_of(&bytecode, "b");
        let t = index_of(&bytecode, "t");

        let EntryKind::Fun { params, code } = &bytecode.variables[add as usize].kind else {
            panic!("add is not a function entry");
        };
        assert_eq!(params, &vec![Type::Int, Type::Int]);

        let entry = bytecode.decode(*code as usize).unwrap();
        assert_eq!(entry.0, Instruction::AllocVar(add));
        let (second, next) = bytecode.decode(entry.1).unwrap();
        assert_eq!(second, Instruction::AllocVars(b));
        let (third, next) = bytecode.decode(next).unwrap();
        assert_eq!(third, Instruction::AllocVars(a));
        let (fourth, _) = bytecode.decode(next).unwrap();
        assert_eq!(fourth, Instruction::AllocVar(t));

        assert!(ops(&bytecode).contains(&Instruction::Call(add)));
        assert!(matches!(bytecode.variables[t as usize].kind, EntryKind::DData));
    }

    #[test]
    fn test_function_calls() {
        compile_ok("function seven of int { seven = 7 } int x x = seven()");
        compile_ok("float y y = sin(1) + cos(0.5)");
        assert_eq!(
            failure("function f(int a) of int { f = a } int x x = f"),
            ParseStatus::MissingFunctionArgumentList
        );
        assert_eq!(
            failure("function f(int a) of int { f = a } int x x = f(\"s\")"),
            ParseStatus::IncompatibleFunctionArguments
        );
    }

    #[test]
    fn test_recursion_resolves_own_name() {
        compile_ok(
            "function fact(int n) of int { fact = n <= 1 ? 1 : n * fact(n - 1) } int r r = fact(5)",
        );
    }

    #[test]
    fn test_array_indexing() {
        let bytecode = compile_ok("array [int, string] of float m m[1, \"k\"] = 2");
        assert!(ops(&bytecode).contains(&Instruction::PutIndAddr(2)));

        compile_ok("array [int] of array [int] of int x x[3][4] = 1");
        assert_eq!(
            failure("array [int] of int x x[\"s\"] = 1"),
            ParseStatus::ArrayDatatype
        );
        assert_eq!(
            failure("array [int] of int x x[1, 2] = 1"),
            ParseStatus::ArrayDatatype
        );
        assert_eq!(
            failure("array [int int x"),
            ParseStatus::TypeDeclarationMissingClosingBracket
        );
        assert_eq!(failure("array [int] int x"), ParseStatus::TypeDeclarationMissingOf);
    }

    #[test]
    fn test_reserved_words_and_keywords_are_case_insensitive() {
        compile_ok("INT a Int b a = 1 b = TRUE ? 2 : 3");
        assert_eq!(failure("int of"), ParseStatus::IdentifierReservedWord);
    }

    #[test]
    fn test_unterminated_string_is_confirmed() {
        assert_eq!(failure("string s s = \"abc"), ParseStatus::StringExpression);
    }

    #[test]
    fn test_missing_block_close() {
        let compilation = parse("{ int a");
        assert_eq!(compilation.status, ParseStatus::Error);
        assert_eq!(compilation.trace.pos, Position::default());
    }

    #[test]
    fn test_function_refs_link_table() {
        let bytecode = compile_ok("function g of int { g = 1 } int x x = g()");
        for entry in &bytecode.variables {
            if let EntryKind::Fun { code, .. } = entry.kind {
                let (first, _) = bytecode.decode(code as usize).unwrap();
                assert!(matches!(first, Instruction::AllocVar(_)));
            }
        }
    }
}

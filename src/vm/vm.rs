// Quill Virtual Machine
// Operand-stack interpreter with one frame of dynamic cells per active call

use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::syscall::Builtin;
use super::value::{Address, Element, Indexes, Location, Value};
use crate::compiler::bytecode::{Bytecode, EntryKind, Instruction, TableEntry};
use crate::compiler::opcode::OpCode;
use crate::compiler::types::Type;
use crate::error::{ExecError, ExecStatus};

const STACK_MAX: usize = 65536;
const FRAMES_MAX: usize = 4096;

/// A dynamic variable cell, tagged with the table entry that allocated it
#[derive(Debug)]
struct Cell {
    owner: u32,
    value: Value,
}

/// Call frame: the caller's resume offset plus the callee's cells, in the
/// order their ALLOCVAR / ALLOCVARS instructions ran
#[derive(Debug)]
struct CallFrame {
    return_ip: usize,
    cells: Vec<Cell>,
}

/// Post-run state of one variable-table entry
#[derive(Debug, Clone, Serialize)]
pub struct VariableState {
    pub index: usize,
    pub name: String,
    pub scope: String,
    pub kind: &'static str,
    #[serde(rename = "type")]
    pub ty: Type,
    /// Current value; only static entries keep one after the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl VariableState {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.scope, self.name)
    }
}

/// Result of `execute`
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub status: ExecStatus,
    pub variables: Vec<VariableState>,
}

impl Execution {
    /// Value of a static variable by qualified name, e.g. `0.a`
    pub fn value(&self, qualified_name: &str) -> Option<&Value> {
        self.variables
            .iter()
            .find(|v| v.qualified_name() == qualified_name)
            .and_then(|v| v.value.as_ref())
    }
}

/// Run a linked program to completion
pub fn execute(bytecode: &Bytecode) -> Execution {
    let mut vm = VM::new(bytecode);
    let status = vm.run();
    vm.finish(status)
}

/// The Quill Virtual Machine
pub struct VM<'a> {
    bytecode: &'a Bytecode,
    ip: usize,
    stack: Vec<Element>,
    frames: Vec<CallFrame>,
    /// One cell per table entry; only `DATA` entries are addressed through it
    statics: Vec<Value>,
    /// Frame slot most recently allocated for each dynamic entry
    slots: Vec<Option<usize>>,
}

impl<'a> VM<'a> {
    pub fn new(bytecode: &'a Bytecode) -> Self {
        Self {
            bytecode,
            ip: 0,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            statics: bytecode
                .variables
                .iter()
                .map(|entry| Value::default_for(&entry.ty))
                .collect(),
            slots: vec![None; bytecode.variables.len()],
        }
    }

    /// Execute until `END`, the end of the code, or a fault
    pub fn run(&mut self) -> ExecStatus {
        debug!(
            code = self.bytecode.code.len(),
            symbols = self.bytecode.variables.len(),
            "vm start"
        );
        let status = loop {
            match self.step() {
                Ok(ExecStatus::OkRun) => continue,
                Ok(status) => break status,
                Err(err) => {
                    debug!(ip = self.ip, error = %err.name(), "vm fault");
                    break ExecStatus::Failed(err);
                }
            }
        };
        debug!(status = %status, frames = self.frames.len(), "vm stop");
        status
    }

    /// Snapshot the variable table and release the VM
    pub fn finish(self, status: ExecStatus) -> Execution {
        let variables = self
            .bytecode
            .variables
            .iter()
            .zip(self.statics)
            .enumerate()
            .map(|(index, (entry, value))| VariableState {
                index,
                name: entry.name.clone(),
                scope: entry.scope.clone(),
                kind: match entry.kind {
                    EntryKind::Data => "DATA",
                    EntryKind::DData => "DDATA",
                    EntryKind::Fun { .. } => "FUN",
                },
                ty: entry.ty.clone(),
                value: matches!(entry.kind, EntryKind::Data).then_some(value),
            })
            .collect();
        Execution { status, variables }
    }

    /// Execute one instruction. `OkRun` means the program continues.
    pub fn step(&mut self) -> Result<ExecStatus, ExecError> {
        if self.ip >= self.bytecode.code.len() {
            return Ok(ExecStatus::OkStop);
        }
        let (instruction, next) = self.bytecode.decode(self.ip)?;
        trace!(ip = self.ip, depth = self.frames.len(), %instruction, "exec");
        self.ip = next;

        match instruction {
            Instruction::Nop => {}
            Instruction::PutAddr(idx) => {
                let root = match self.entry(idx)?.kind {
                    EntryKind::Data => Location::Static(idx as usize),
                    _ => self.dynamic_location(idx)?,
                };
                self.push(Element::Address(Address::new(root)))?;
            }
            Instruction::PutDAddr(idx) => {
                let root = self.dynamic_location(idx)?;
                self.push(Element::Address(Address::new(root)))?;
            }
            // Member access has no runtime effect beyond requiring an address
            Instruction::PutMemberAddr(_) => match self.stack.last() {
                Some(Element::Address(_)) => {}
                _ => {
                    return Err(ExecError::ExpectedAddress {
                        op: OpCode::PutMemberAddr,
                    })
                }
            },
            Instruction::PutIndAddr(count) => self.index_address(count)?,
            Instruction::PutInt(v) => self.push(Element::Value(Value::Int(v)))?,
            Instruction::PutFloat(v) => self.push(Element::Value(Value::Float(v)))?,
            Instruction::PutString(s) => self.push(Element::Value(Value::Str(s)))?,
            Instruction::PutBoolean(b) => self.push(Element::Value(Value::Bool(b)))?,

            Instruction::Move
            | Instruction::MoveAdd
            | Instruction::MoveSubtr
            | Instruction::MoveMul
            | Instruction::MoveDiv => self.assign(instruction.opcode())?,

            Instruction::Equal
            | Instruction::NotEqual
            | Instruction::LessEqual
            | Instruction::GreaterEqual
            | Instruction::Less
            | Instruction::Greater => {
                let op = instruction.opcode();
                let rhs = self.pop_value()?;
                let lhs = self.pop_value()?;
                let result = lhs.compare(&rhs, op)?;
                self.push(Element::Value(Value::Bool(result)))?;
            }

            Instruction::Mul | Instruction::Div | Instruction::Add | Instruction::Sub => {
                let op = instruction.opcode();
                let rhs = self.pop_value()?;
                let lhs = self.pop_value()?;
                let result = match op {
                    OpCode::Mul => lhs.mul(&rhs, op)?,
                    OpCode::Div => lhs.div(&rhs, op)?,
                    OpCode::Add => lhs.add(&rhs, op)?,
                    _ => lhs.sub(&rhs, op)?,
                };
                self.push(Element::Value(result))?;
            }
            Instruction::Neg => {
                let value = self.pop_value()?.neg()?;
                self.push(Element::Value(value))?;
            }

            Instruction::JumpIfFalse(target) => match self.pop_value()? {
                Value::Bool(true) => {}
                Value::Bool(false) => self.ip = target as usize,
                _ => return Err(ExecError::ConditionExpectedBoolean),
            },
            Instruction::Jump(target) => self.ip = target as usize,
            Instruction::End => return Ok(ExecStatus::OkStop),

            Instruction::Call(idx) => self.call(idx)?,
            Instruction::Return(idx) => self.ret(idx)?,
            Instruction::Syscall(idx, name) => {
                let builtin = Builtin::from_name(&name).ok_or(ExecError::UnknownSyscall)?;
                let root = self.dynamic_location(idx)?;
                let arg = self.cell_mut(&Address::new(root))?.clone();
                let result = builtin.call(&arg)?;
                self.push(Element::Value(result))?;
            }

            Instruction::InitVar(idx) => {
                let entry = self.entry(idx)?;
                let fresh = Value::default_for(&entry.ty);
                let root = match entry.kind {
                    EntryKind::Data => Location::Static(idx as usize),
                    EntryKind::DData => self.dynamic_location(idx)?,
                    EntryKind::Fun { .. } => return Err(ExecError::InvalidInstruction),
                };
                *self.cell_mut(&Address::new(root))? = fresh;
            }
            Instruction::AllocVar(idx) => {
                let fresh = Value::default_for(&self.entry(idx)?.ty);
                self.allocate(idx, fresh)?;
            }
            Instruction::AllocVars(idx) => {
                let ty = self.entry(idx)?.ty.clone();
                let arg = self.pop_value()?;
                if !ty.accepts(&arg.ty()) {
                    return Err(ExecError::InconsistentDatatypes {
                        op: OpCode::AllocVars,
                    });
                }
                self.allocate(idx, arg.coerce(&ty))?;
            }
        }

        Ok(ExecStatus::OkRun)
    }

    // ==================== Calls ====================

    fn call(&mut self, idx: u32) -> Result<(), ExecError> {
        let entry = self.entry(idx)?;
        let EntryKind::Fun { code, .. } = entry.kind else {
            return Err(ExecError::InvalidInstruction);
        };
        if self.frames.len() >= FRAMES_MAX {
            return Err(ExecError::FrameOverflow);
        }
        debug!(function = %entry.name, depth = self.frames.len() + 1, "call");
        self.frames.push(CallFrame {
            return_ip: self.ip,
            cells: Vec::new(),
        });
        self.ip = code as usize;
        Ok(())
    }

    fn ret(&mut self, idx: u32) -> Result<(), ExecError> {
        if self.frames.is_empty() {
            return Err(ExecError::NoReturnPoint);
        }
        let Location::Frame { slot, .. } = self.dynamic_location(idx)? else {
            return Err(ExecError::NoReturnPoint);
        };
        let mut frame = self.frames.pop().ok_or(ExecError::NoReturnPoint)?;
        let result = frame.cells.swap_remove(slot).value;
        debug!(depth = self.frames.len(), cells = frame.cells.len() + 1, "return");

        self.ip = frame.return_ip;
        self.push(Element::Value(result))
    }

    fn allocate(&mut self, idx: u32, value: Value) -> Result<(), ExecError> {
        let frame = self
            .frames
            .last_mut()
            .ok_or(ExecError::UnboundDynamicVariable { index: idx })?;
        frame.cells.push(Cell { owner: idx, value });
        let slot = frame.cells.len() - 1;
        match self.slots.get_mut(idx as usize) {
            Some(entry) => *entry = Some(slot),
            None => return Err(ExecError::InvalidInstruction),
        }
        Ok(())
    }

    // ==================== Addresses ====================

    fn entry(&self, idx: u32) -> Result<&'a TableEntry, ExecError> {
        self.bytecode
            .variables
            .get(idx as usize)
            .ok_or(ExecError::InvalidInstruction)
    }

    /// Slot of a dynamic entry in the top frame. The slot must have been
    /// allocated by that entry in that frame.
    fn dynamic_location(&self, idx: u32) -> Result<Location, ExecError> {
        let unbound = ExecError::UnboundDynamicVariable { index: idx };
        let frame = self.frames.len().checked_sub(1).ok_or(unbound)?;
        let slot = self
            .slots
            .get(idx as usize)
            .copied()
            .flatten()
            .ok_or(unbound)?;
        match self.frames[frame].cells.get(slot) {
            Some(cell) if cell.owner == idx => Ok(Location::Frame { frame, slot }),
            _ => Err(unbound),
        }
    }

    /// Resolve an address to its cell, materialising array elements on the way
    fn cell_mut(&mut self, address: &Address) -> Result<&mut Value, ExecError> {
        let mut cell = match address.root {
            Location::Static(idx) => self.statics.get_mut(idx),
            Location::Frame { frame, slot } => self
                .frames
                .get_mut(frame)
                .and_then(|f| f.cells.get_mut(slot))
                .map(|c| &mut c.value),
        }
        .ok_or(ExecError::InvalidInstruction)?;

        for indexes in &address.path {
            let Value::Array(array) = cell else {
                return Err(ExecError::ExpectedArray);
            };
            let pos = array.materialize(indexes)?;
            cell = array.value_mut(pos).ok_or(ExecError::ExpectedArray)?;
        }
        Ok(cell)
    }

    /// `PUTINDADDR n`: indexes come off the stack last-first
    fn index_address(&mut self, count: u8) -> Result<(), ExecError> {
        let mut indexes: Indexes = SmallVec::with_capacity(count as usize);
        for _ in 0..count {
            indexes.push(self.pop_value()?);
        }
        indexes.reverse();

        let Element::Address(address) = self.pop()? else {
            return Err(ExecError::ExpectedAddress {
                op: OpCode::PutIndAddr,
            });
        };
        let Value::Array(array) = self.cell_mut(&address)? else {
            return Err(ExecError::ExpectedArray);
        };
        array.materialize(&indexes)?;
        self.push(Element::Address(address.index(indexes)))
    }

    /// Pop the value, then the target address, and update the cell in place
    fn assign(&mut self, op: OpCode) -> Result<(), ExecError> {
        let value = self.pop_value()?;
        let Element::Address(address) = self.pop()? else {
            return Err(ExecError::ExpectedAddress { op });
        };
        self.cell_mut(&address)?.assign(op, value)
    }

    // ==================== Stack ====================

    fn push(&mut self, element: Element) -> Result<(), ExecError> {
        if self.stack.len() >= STACK_MAX {
            return Err(ExecError::StackOverflow);
        }
        self.stack.push(element);
        Ok(())
    }

    fn pop(&mut self) -> Result<Element, ExecError> {
        self.stack.pop().ok_or(ExecError::StackUnderflow)
    }

    /// Pop and dereference: addresses yield a copy of the cell they point to
    fn pop_value(&mut self) -> Result<Value, ExecError> {
        match self.pop()? {
            Element::Value(value) => Ok(value),
            Element::Address(address) => Ok(self.cell_mut(&address)?.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse;

    fn run(source: &str) -> Execution {
        let compilation = parse(source);
        assert!(compilation.is_ok(), "{}", compilation.trace.render());
        execute(&compilation.bytecode)
    }

    #[test]
    fn test_end_to_end_scalars() {
        let execution = run("int a a = 2 int b b = a + 3");
        assert_eq!(execution.status, ExecStatus::OkStop);
        assert_eq!(execution.value("0.a"), Some(&Value::Int(2)));
        assert_eq!(execution.value("0.b"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_division_is_float() {
        let execution = run("float q q = 4 / 2 float r r = 1 + 2.5");
        assert_eq!(execution.value("0.q"), Some(&Value::Float(2.0)));
        assert_eq!(execution.value("0.r"), Some(&Value::Float(3.5)));
    }

    #[test]
    fn test_division_by_zero_halts() {
        let execution = run("float q int z q = 1 / z q = 5");
        assert_eq!(
            execution.status,
            ExecStatus::Failed(ExecError::DivisionByZero { op: OpCode::Div })
        );
        assert_eq!(execution.value("0.q"), Some(&Value::Float(0.0)));
    }

    #[test]
    fn test_logical_operators_evaluate_both_sides() {
        let execution = run(
            "boolean a boolean b boolean c a = true and false b = false or true c = not (1 < 2)",
        );
        assert_eq!(execution.value("0.a"), Some(&Value::Bool(false)));
        assert_eq!(execution.value("0.b"), Some(&Value::Bool(true)));
        assert_eq!(execution.value("0.c"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_ternary_branches() {
        let execution = run("int a int b a = 1 > 2 ? 10 : 20 b = a == 20 ? 1 : 2");
        assert_eq!(execution.value("0.a"), Some(&Value::Int(20)));
        assert_eq!(execution.value("0.b"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_compound_assignment() {
        let execution = run(
            "string s s = \"banana\" s -= \"an\" s += \"!\" int n n = 3 n *= 4 n -= 2 float f f = 9 f /= 2",
        );
        assert_eq!(execution.value("0.s"), Some(&Value::Str("ba!".into())));
        assert_eq!(execution.value("0.n"), Some(&Value::Int(10)));
        assert_eq!(execution.value("0.f"), Some(&Value::Float(4.5)));
    }

    #[test]
    fn test_sparse_array_identity() {
        let execution = run(
            "array [int] of array [int] of int x int r r = x[3][4] x[3][4] = 7 r += x[3][4]",
        );
        assert_eq!(execution.value("0.r"), Some(&Value::Int(7)));
        let Some(Value::Array(outer)) = execution.value("0.x") else {
            panic!("x is not an array");
        };
        assert_eq!(outer.len(), 1);
        let Some(Value::Array(inner)) = outer.get(&[Value::Int(3)]) else {
            panic!("x[3] is not an array");
        };
        assert_eq!(inner.len(), 1);
        assert_eq!(inner.get(&[Value::Int(4)]), Some(&Value::Int(7)));
    }

    #[test]
    fn test_builtin_math() {
        let execution = run("float s float c s = sin(0) c = cos(0.0)");
        assert_eq!(execution.value("0.s"), Some(&Value::Float(0.0)));
        assert_eq!(execution.value("0.c"), Some(&Value::Float(1.0)));
    }

    #[test]
    fn test_dynamic_snapshot_has_no_value() {
        let execution = run("function f(int n) of int { f = n } int r r = f(4)");
        let n = execution
            .variables
            .iter()
            .find(|v| v.qualified_name() == "0.f.n")
            .unwrap();
        assert_eq!(n.kind, "DDATA");
        assert!(n.value.is_none());
        assert_eq!(execution.value("0.r"), Some(&Value::Int(4)));
    }

    #[test]
    fn test_return_without_frame() {
        let mut bytecode = Bytecode::new();
        bytecode.ret(0);
        bytecode.fun("f", "0", Type::Int, Vec::new(), 0);
        let execution = execute(&bytecode);
        assert_eq!(execution.status, ExecStatus::Failed(ExecError::NoReturnPoint));
    }

    #[test]
    fn test_unbound_dynamic_address() {
        let mut bytecode = Bytecode::new();
        bytecode.put_daddr(0);
        bytecode.ddata("x", "0.f", Type::Int);
        let execution = execute(&bytecode);
        assert_eq!(
            execution.status,
            ExecStatus::Failed(ExecError::UnboundDynamicVariable { index: 0 })
        );
    }

    #[test]
    fn test_stack_underflow_is_reported() {
        let mut bytecode = Bytecode::new();
        bytecode.emit(OpCode::Add);
        assert_eq!(
            execute(&bytecode).status,
            ExecStatus::Failed(ExecError::StackUnderflow)
        );
    }

    #[test]
    fn test_runaway_recursion_overflows() {
        let execution = run("function f(int n) of int { f = f(n + 1) } int r r = f(0)");
        assert!(matches!(
            execution.status,
            ExecStatus::Failed(ExecError::FrameOverflow | ExecError::StackOverflow)
        ));
    }
}

use crate::InterpreterError;
use crate::code::{Code, Instruction, Register};
use std::sync::Arc;
use tj_core::IValue;
use tj_ops::Stack;

/// Mutable execution state for one [`Code`]. The stack passed to
/// [`InterpreterState::run`] holds the inputs on entry and exactly the
/// outputs on normal completion.
#[derive(Debug)]
pub struct InterpreterState {
    code: Arc<Code>,
    registers: Vec<IValue>,
    pc: usize,
    failed: bool,
}

impl InterpreterState {
    #[must_use]
    pub fn new(code: Arc<Code>) -> Self {
        let registers = vec![IValue::None; code.register_count()];
        Self {
            code,
            registers,
            pc: 0,
            failed: false,
        }
    }

    #[must_use]
    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    /// Runs the code to completion. Any failure poisons the state so later
    /// runs are refused.
    pub fn run(&mut self, stack: &mut Stack) -> Result<(), InterpreterError> {
        if self.failed {
            return Err(InterpreterError::Poisoned);
        }
        if stack.len() != self.code.num_inputs() {
            return Err(InterpreterError::InputArity {
                expected: self.code.num_inputs(),
                actual: stack.len(),
            });
        }
        self.pc = 0;
        let result = self.execute(stack);
        self.registers.fill(IValue::None);
        if let Err(err) = &result {
            log::debug!("interpreter failed at pc {}: {err}", self.pc);
            self.failed = true;
        }
        result
    }

    fn execute(&mut self, stack: &mut Stack) -> Result<(), InterpreterError> {
        let code = Arc::clone(&self.code);
        let instructions = code.instructions();
        loop {
            let Some(instruction) = instructions.get(self.pc) else {
                return Ok(());
            };
            self.pc += 1;
            match instruction {
                Instruction::Op {
                    kind,
                    operation,
                    inputs,
                    outputs,
                } => {
                    let base = stack.len();
                    self.load(stack, inputs);
                    operation(stack)?;
                    let produced = stack.len().saturating_sub(base);
                    if stack.len() < base || produced != outputs.len() {
                        return Err(InterpreterError::UnexpectedOutputArity {
                            kind: *kind,
                            expected: outputs.len(),
                            actual: produced,
                        });
                    }
                    self.store(stack, outputs)?;
                }
                Instruction::Load(registers) => self.load(stack, registers),
                Instruction::Store(registers) => self.store(stack, registers)?,
                Instruction::JumpIfFalse { condition, target } => {
                    if !self.registers[*condition].to_bool()? {
                        self.pc = *target;
                    }
                }
                Instruction::Jump(target) => self.pc = *target,
                Instruction::LoopGuard {
                    counter,
                    max_trip_count,
                    condition,
                    exit,
                } => {
                    let trips = match &self.registers[*counter] {
                        IValue::None => 0,
                        value => value.to_int()?,
                    };
                    let max = self.registers[*max_trip_count].to_int()?;
                    if trips < max && self.registers[*condition].to_bool()? {
                        self.registers[*counter] = IValue::Int(trips);
                    } else {
                        self.registers[*counter] = IValue::None;
                        self.pc = *exit;
                    }
                }
                Instruction::Increment(counter) => {
                    let next = self.registers[*counter].to_int()? + 1;
                    self.registers[*counter] = IValue::Int(next);
                }
                Instruction::Ret => return Ok(()),
            }
        }
    }

    fn load(&self, stack: &mut Stack, registers: &[Register]) {
        stack.extend(registers.iter().map(|&r| self.registers[r].clone()));
    }

    fn store(&mut self, stack: &mut Stack, registers: &[Register]) -> Result<(), InterpreterError> {
        let start = stack
            .len()
            .checked_sub(registers.len())
            .ok_or(InterpreterError::StackUnderflow {
                needed: registers.len(),
                available: stack.len(),
            })?;
        for (&register, value) in registers.iter().zip(stack.drain(start..)) {
            self.registers[register] = value;
        }
        Ok(())
    }
}

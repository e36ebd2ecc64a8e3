use crate::InterpreterError;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tj_core::{BlockId, Graph, NodeId, Symbol, Type, ValueId, prim};
use tj_ops::{NodeLoweringContext, Operation, OperatorRegistry};

/// Index into the interpreter's register file.
pub type Register = usize;

/// One step of flattened code. Control flow is expressed with absolute
/// jump targets into [`Code::instructions`].
#[derive(Clone)]
pub enum Instruction {
    /// Pushes the contents of `inputs`, calls `operation`, and pops exactly
    /// `outputs.len()` results back into registers.
    Op {
        kind: Symbol,
        operation: Operation,
        inputs: Vec<Register>,
        outputs: Vec<Register>,
    },
    /// Pushes registers onto the stack, in order.
    Load(Vec<Register>),
    /// Pops the top `registers.len()` stack values into registers; the
    /// deepest value lands in the first register.
    Store(Vec<Register>),
    JumpIfFalse {
        condition: Register,
        target: usize,
    },
    Jump(usize),
    /// Continues into the loop body while the trip count is below the
    /// maximum and the condition holds; otherwise resets the counter and
    /// jumps to `exit`.
    LoopGuard {
        counter: Register,
        max_trip_count: Register,
        condition: Register,
        exit: usize,
    },
    Increment(Register),
    Ret,
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Op {
                kind,
                inputs,
                outputs,
                ..
            } => write!(f, "Op {kind} {inputs:?} -> {outputs:?}"),
            Self::Load(registers) => write!(f, "Load {registers:?}"),
            Self::Store(registers) => write!(f, "Store {registers:?}"),
            Self::JumpIfFalse { condition, target } => {
                write!(f, "JumpIfFalse r{condition} @{target}")
            }
            Self::Jump(target) => write!(f, "Jump @{target}"),
            Self::LoopGuard {
                counter,
                max_trip_count,
                condition,
                exit,
            } => write!(
                f,
                "LoopGuard r{counter} < r{max_trip_count} && r{condition} else @{exit}"
            ),
            Self::Increment(counter) => write!(f, "Increment r{counter}"),
            Self::Ret => f.write_str("Ret"),
        }
    }
}

/// Immutable flattened form of a graph. Operators are resolved once here;
/// running the code never consults the registry.
#[derive(Debug, Clone)]
pub struct Code {
    instructions: Vec<Instruction>,
    register_count: usize,
    num_inputs: usize,
    num_outputs: usize,
}

impl Code {
    pub fn new(graph: &Graph, registry: &Arc<OperatorRegistry>) -> Result<Self, InterpreterError> {
        let mut builder = CodeBuilder {
            graph,
            registry,
            instructions: Vec::new(),
            registers: FxHashMap::default(),
            register_count: 0,
        };
        let inputs = builder.define_all(graph.inputs());
        builder.emit(Instruction::Store(inputs));
        builder.emit_block(graph.block())?;
        let outputs = builder.lookup_all(graph.outputs());
        builder.emit(Instruction::Load(outputs));
        builder.emit(Instruction::Ret);
        log::debug!(
            "flattened graph into {} instruction(s) over {} register(s)",
            builder.instructions.len(),
            builder.register_count
        );
        Ok(Self {
            instructions: builder.instructions,
            register_count: builder.register_count,
            num_inputs: graph.inputs().len(),
            num_outputs: graph.outputs().len(),
        })
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[must_use]
    pub fn register_count(&self) -> usize {
        self.register_count
    }

    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pc, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "{pc:4}: {instruction:?}")?;
        }
        Ok(())
    }
}

struct CodeBuilder<'a> {
    graph: &'a Graph,
    registry: &'a Arc<OperatorRegistry>,
    instructions: Vec<Instruction>,
    registers: FxHashMap<ValueId, Register>,
    register_count: usize,
}

impl CodeBuilder<'_> {
    fn emit(&mut self, instruction: Instruction) -> usize {
        self.instructions.push(instruction);
        self.instructions.len() - 1
    }

    fn fresh(&mut self) -> Register {
        self.register_count += 1;
        self.register_count - 1
    }

    fn define(&mut self, value: ValueId) -> Register {
        let register = self.fresh();
        self.registers.insert(value, register);
        register
    }

    fn define_all(&mut self, values: &[ValueId]) -> Vec<Register> {
        values.iter().map(|&v| self.define(v)).collect()
    }

    // Graphs reaching here have been linted, so every use has a definition.
    fn lookup(&mut self, value: ValueId) -> Register {
        match self.registers.get(&value) {
            Some(&register) => register,
            None => self.define(value),
        }
    }

    fn lookup_all(&mut self, values: &[ValueId]) -> Vec<Register> {
        values.iter().map(|&v| self.lookup(v)).collect()
    }

    fn emit_block(&mut self, block: BlockId) -> Result<(), InterpreterError> {
        let graph = self.graph;
        for &node in graph.block_nodes(block) {
            self.emit_node(node)?;
        }
        Ok(())
    }

    fn emit_node(&mut self, node: NodeId) -> Result<(), InterpreterError> {
        let graph = self.graph;
        let kind = graph.kind(node);
        if kind == prim::IF {
            return self.emit_if(node);
        }
        if kind == prim::LOOP {
            return self.emit_loop(node);
        }
        if !graph.node(node).blocks().is_empty() {
            return Err(InterpreterError::UnsupportedBlockNode { kind });
        }
        let operation = self.resolve(node)?;
        let inputs = self.lookup_all(graph.node(node).inputs());
        let outputs = self.define_all(graph.node(node).outputs());
        self.emit(Instruction::Op {
            kind,
            operation,
            inputs,
            outputs,
        });
        Ok(())
    }

    fn resolve(&self, node: NodeId) -> Result<Operation, InterpreterError> {
        let kind = self.graph.kind(node);
        if let Some(lowering) = self.registry.lowering(kind) {
            let ctx = NodeLoweringContext {
                graph: self.graph,
                node,
                registry: self.registry,
            };
            return Ok(lowering(&ctx)?);
        }
        let types: Vec<Type> = self
            .graph
            .node(node)
            .inputs()
            .iter()
            .map(|&v| self.graph.ty(v).clone())
            .collect();
        Ok(self.registry.resolve(kind, &types)?)
    }

    /// Copies `block`'s outputs into `targets` through the stack.
    fn emit_block_exit(&mut self, block: BlockId, targets: Vec<Register>) {
        let graph = self.graph;
        let outputs = self.lookup_all(graph.block_outputs(block));
        self.emit(Instruction::Load(outputs));
        self.emit(Instruction::Store(targets));
    }

    fn emit_if(&mut self, node: NodeId) -> Result<(), InterpreterError> {
        let graph = self.graph;
        let blocks = graph.node(node).blocks();
        let (&[then_block, else_block], &[condition]) = (blocks, graph.node(node).inputs()) else {
            return Err(InterpreterError::MalformedControlFlow {
                kind: prim::IF,
                detail: format!(
                    "expected 2 blocks and 1 input, found {} and {}",
                    blocks.len(),
                    graph.node(node).inputs().len()
                ),
            });
        };
        let condition = self.lookup(condition);
        let outputs = self.define_all(graph.node(node).outputs());

        let branch = self.emit(Instruction::JumpIfFalse {
            condition,
            target: usize::MAX,
        });
        self.emit_block(then_block)?;
        self.emit_block_exit(then_block, outputs.clone());
        let skip_else = self.emit(Instruction::Jump(usize::MAX));
        let else_start = self.instructions.len();
        self.emit_block(else_block)?;
        self.emit_block_exit(else_block, outputs);
        let end = self.instructions.len();

        self.patch(branch, else_start);
        self.patch(skip_else, end);
        Ok(())
    }

    fn emit_loop(&mut self, node: NodeId) -> Result<(), InterpreterError> {
        let graph = self.graph;
        let inputs = graph.node(node).inputs();
        let (&[body], [max_trip_count, start_condition, carried @ ..]) =
            (graph.node(node).blocks(), inputs)
        else {
            return Err(InterpreterError::MalformedControlFlow {
                kind: prim::LOOP,
                detail: format!(
                    "expected 1 block and at least 2 inputs, found {} and {}",
                    graph.node(node).blocks().len(),
                    inputs.len()
                ),
            });
        };
        let max_trip_count = self.lookup(*max_trip_count);
        let start_condition = self.lookup(*start_condition);
        let carried = self.lookup_all(carried);
        let outputs = self.define_all(graph.node(node).outputs());
        let condition = self.fresh();
        let counter = self.fresh();

        let mut entry = vec![start_condition];
        entry.extend(carried);
        let mut state = vec![condition];
        state.extend(outputs.iter().copied());
        self.emit(Instruction::Load(entry));
        self.emit(Instruction::Store(state.clone()));

        let guard = self.emit(Instruction::LoopGuard {
            counter,
            max_trip_count,
            condition,
            exit: usize::MAX,
        });
        let body_inputs = self.define_all(graph.block_inputs(body));
        let mut iteration = vec![counter];
        iteration.extend(outputs);
        self.emit(Instruction::Load(iteration));
        self.emit(Instruction::Store(body_inputs));
        self.emit_block(body)?;
        self.emit_block_exit(body, state);
        self.emit(Instruction::Increment(counter));
        self.emit(Instruction::Jump(guard));
        let exit = self.instructions.len();
        self.patch(guard, exit);
        Ok(())
    }

    fn patch(&mut self, at: usize, to: usize) {
        match &mut self.instructions[at] {
            Instruction::JumpIfFalse { target, .. } => *target = to,
            Instruction::Jump(target) => *target = to,
            Instruction::LoopGuard { exit, .. } => *exit = to,
            _ => {}
        }
    }
}

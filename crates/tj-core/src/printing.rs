use crate::graph::{BlockId, Graph, NodeId, ValueId};
use std::fmt::{self, Write};

impl Graph {
    fn value_name(&self, value: ValueId) -> String {
        match self.value(value).debug_name() {
            Some(name) => format!("%{name}"),
            None => format!("%{}", value.index()),
        }
    }

    fn typed_list(&self, values: &[ValueId]) -> String {
        values
            .iter()
            .map(|&v| format!("{} : {}", self.value_name(v), self.ty(v)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn name_list(&self, values: &[ValueId]) -> String {
        values
            .iter()
            .map(|&v| self.value_name(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn write_node(&self, out: &mut String, node: NodeId, indent: usize) -> fmt::Result {
        let data = self.node(node);
        let pad = " ".repeat(indent);
        out.push_str(&pad);
        if !data.outputs().is_empty() {
            write!(out, "{} = ", self.typed_list(data.outputs()))?;
        }
        out.push_str(data.kind().to_qual_string());
        if !data.attributes().is_empty() {
            let attrs = data
                .attributes()
                .iter()
                .map(|(name, value)| format!("{}={value}", name.to_unqual_string()))
                .collect::<Vec<_>>()
                .join(", ");
            write!(out, "[{attrs}]")?;
        }
        writeln!(out, "({})", self.name_list(data.inputs()))?;
        for (i, &block) in data.blocks().iter().enumerate() {
            self.write_block(out, block, i, indent + 2)?;
        }
        Ok(())
    }

    fn write_block(
        &self,
        out: &mut String,
        block: BlockId,
        index: usize,
        indent: usize,
    ) -> fmt::Result {
        let pad = " ".repeat(indent);
        writeln!(out, "{pad}block{index}({}) {{", self.typed_list(self.block_inputs(block)))?;
        for &node in self.block_nodes(block) {
            self.write_node(out, node, indent + 2)?;
        }
        writeln!(out, "{pad}  -> ({})", self.name_list(self.block_outputs(block)))?;
        writeln!(out, "{pad}}}")
    }
}

/// Renders the graph in the form
/// `graph(%0 : Float(2, 3), ...) { ...; return (%n); }`.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let header = self
            .inputs()
            .iter()
            .map(|&v| format!("{} : {}", self.value_name(v), self.ty(v)))
            .collect::<Vec<_>>()
            .join(",\n      ");
        writeln!(out, "graph({header}) {{")?;
        for &node in self.block_nodes(self.block()) {
            self.write_node(&mut out, node, 2)?;
        }
        writeln!(out, "  return ({});", self.name_list(self.outputs()))?;
        out.push('}');
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::Graph;
    use crate::ivalue::IValue;
    use crate::symbol::{aten, prim};
    use crate::types::{DType, Device, TensorType, Type};

    #[test]
    fn straight_line_graph_prints() {
        let mut g = Graph::new();
        let a = g.add_named_input("a");
        g.set_type(
            a,
            Type::Tensor(TensorType::new(DType::F32, Device::Cpu).with_sizes(vec![2, 3])),
        );
        let b = g.add_input();
        let mul = g.insert(aten::MUL, &[a, b], 1).expect("mul");
        let out = g.node(mul).outputs()[0];
        g.register_output(out).expect("output");
        let expected = "graph(%a : Float(2, 3),\n      %1 : Dynamic) {\n  \
                        %2 : Dynamic = aten::mul(%a, %1)\n  return (%2);\n}";
        assert_eq!(g.to_string(), expected);
    }

    #[test]
    fn blocks_and_attributes_print_nested() {
        let mut g = Graph::new();
        let cond = g.add_input();
        let two = g.insert_constant(&IValue::Int(2)).expect("constant");
        let node = g.insert(prim::IF, &[cond], 1).expect("if");
        for _ in 0..2 {
            let block = g.add_block(node);
            g.register_block_output(block, two).expect("branch output");
        }
        let text = g.to_string();
        assert!(text.contains("%1 : int = prim::Constant[value=2]()"), "{text}");
        assert!(text.contains("    block1() {\n      -> (%1)\n    }"), "{text}");
    }
}

//! Graphviz rendering of a graph, for `--dump-graph`.

use std::collections::HashMap;

use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;

use crate::graph::Graph;

impl Graph {
    /// Render stages as nodes and connections as edges labelled with their
    /// ports and negotiated contract.
    pub fn to_dot(&self) -> String {
        let mut view: DiGraph<String, String> = DiGraph::new();
        let mut nodes = HashMap::new();
        for stage in self.stages() {
            let label = format!("{}\n{}", stage.name(), stage.kind());
            nodes.insert(stage.id(), view.add_node(label));
        }
        for conn in self.connections() {
            let (Some(up), Some(down)) = (self.port(conn.upstream), self.port(conn.downstream)) else {
                continue;
            };
            if let (Some(a), Some(b)) = (nodes.get(&up.stage()), nodes.get(&down.stage())) {
                let label = format!("{} -> {}\n{}", up.name(), down.name(), conn.contract);
                view.add_edge(*a, *b, label);
            }
        }

        let body = Dot::with_attr_getters(
            &view,
            &[Config::GraphContentOnly],
            &|_, _| "fontsize=9 ".to_string(),
            &|_, _| "shape=box ".to_string(),
        );
        format!(
            "digraph \"{}\" {{\n    rankdir=LR\n    label=\"{} [{}]\"\n{body}}}\n",
            escape(self.name()),
            escape(self.name()),
            self.state()
        )
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use crate::graph::Graph;
    use crate::stage::StageKind;
    use crate::test_support::{mock_provider, standard_contract};

    #[test]
    fn test_dot_lists_stages_and_contracts() {
        let mut g = Graph::new("livemix", mock_provider());
        let cap = g.add_stage(StageKind::Capture, "capture0", []).unwrap();
        let ov = g.add_stage(StageKind::Overlay, "overlay0", []).unwrap();
        g.link_stages_with_contract(cap, ov, standard_contract()).unwrap();

        let dot = g.to_dot();
        assert!(dot.starts_with("digraph \"livemix\""));
        assert!(dot.contains("capture0"));
        assert!(dot.contains("overlay0"));
        assert!(dot.contains("0 -> 1"));
        assert!(dot.contains("format=I420,width=640,height=360,framerate=30/1"));
        assert!(dot.trim_end().ends_with('}'));
    }
}

//! DOT (Graphviz) rendering.
//!
//! <https://en.wikipedia.org/wiki/DOT_(graph_description_language)>

use std::fmt::Write;

/// Visual attributes for one node stanza.
#[derive(Debug, Clone)]
pub struct DotNodeSpec {
    /// Node id, quoted into the stanza.
    pub name: String,
    /// Display text of the node.
    pub display_name: String,
    pub tooltip: String,
    pub shape: String,
    pub style: String,
    pub fill_color: String,
}

/// Visual attributes for one edge stanza.
#[derive(Debug, Clone)]
pub struct DotEdgeSpec {
    pub from: String,
    pub to: String,
    pub tooltip: String,
    pub style: String,
    pub color: String,
}

pub(crate) fn render(nodes: &[DotNodeSpec], edges: &[DotEdgeSpec]) -> String {
    let mut out = String::new();
    out.push_str("digraph {\n");
    out.push_str("\tcompound = \"true\"\n");
    out.push_str("\tnewrank = \"true\"\n");

    for node in nodes {
        let _ = writeln!(
            out,
            "\t\"{}\" [label=\"{}\" shape={} style={} fillcolor={} tooltip=\"{}\"]",
            node.name, node.display_name, node.shape, node.style, node.fill_color, node.tooltip,
        );
    }

    for edge in edges {
        let _ = writeln!(
            out,
            "\t\"{}\" -> \"{}\" [style={} color={} tooltip=\"{}\"]",
            edge.from, edge.to, edge.style, edge.color, edge.tooltip,
        );
    }

    out.push_str("}\n");
    out
}

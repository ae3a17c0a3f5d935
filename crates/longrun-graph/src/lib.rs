//! Graphviz DOT rendering for Longrun state machines
//!
//! Thin formatter over [`StateMachine::export`]: one node per state, one
//! labelled edge per transition branch, and a cluster per compound state.
//! Hidden states and transitions are omitted unless requested.

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use longrun_core::machine::{StateExport, StateKey, StateMachine};

/// Rendering options
pub struct DotOptions {
    /// Name of the emitted digraph
    pub graph_name: String,

    /// Include states and transitions marked hidden
    pub include_hidden: bool,
}

impl Default for DotOptions {
    fn default() -> Self {
        Self {
            graph_name: "workflow".to_string(),
            include_hidden: false,
        }
    }
}

/// Render a configured machine as DOT
pub fn render<S: StateKey, I: StateKey>(machine: &StateMachine<S, I>, options: &DotOptions) -> String {
    render_states(&machine.export(), options)
}

fn render_states(states: &[StateExport], options: &DotOptions) -> String {
    let visible: Vec<&StateExport> = states
        .iter()
        .filter(|s| options.include_hidden || !s.hidden)
        .collect();
    let visible_names: HashSet<&str> = visible.iter().map(|s| s.name.as_str()).collect();

    let mut children: HashMap<Option<&str>, Vec<&StateExport>> = HashMap::new();
    for state in &visible {
        let parent = state
            .parent
            .as_deref()
            .filter(|p| visible_names.contains(p));
        children.entry(parent).or_default().push(state);
    }

    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", escape(&options.graph_name));
    let _ = writeln!(out, "    compound=true;");

    let roots = children.get(&None).cloned().unwrap_or_default();
    for state in roots {
        emit_state(&mut out, state, &children, 1);
    }

    for state in &visible {
        for transition in &state.transitions {
            if transition.hidden && !options.include_hidden {
                continue;
            }
            if !visible_names.contains(transition.target.as_str()) {
                continue;
            }
            let _ = writeln!(
                out,
                "    \"{}\" -> \"{}\" [label=\"{}\"];",
                escape(&state.name),
                escape(&transition.target),
                escape(&transition.label)
            );
        }
    }

    out.push_str("}\n");
    out
}

fn emit_state(
    out: &mut String,
    state: &StateExport,
    children: &HashMap<Option<&str>, Vec<&StateExport>>,
    depth: usize,
) {
    let indent = "    ".repeat(depth);
    let label = state.description.as_deref().unwrap_or(&state.name);
    let nested = children.get(&Some(state.name.as_str()));

    match nested {
        Some(nested) if !nested.is_empty() => {
            let _ = writeln!(out, "{indent}subgraph \"cluster_{}\" {{", escape(&state.name));
            let _ = writeln!(out, "{indent}    label=\"{}\";", escape(label));
            let _ = writeln!(
                out,
                "{indent}    \"{}\" [label=\"{}\"];",
                escape(&state.name),
                escape(label)
            );
            for child in nested {
                emit_state(out, child, children, depth + 1);
            }
            let _ = writeln!(out, "{indent}}}");
        }
        _ => {
            let _ = writeln!(
                out,
                "{indent}\"{}\" [label=\"{}\"];",
                escape(&state.name),
                escape(label)
            );
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

use dashmap::DashMap;
use tracing::debug;

use nodal_protocol::VariableBinding;

use crate::value::{Context, Value};

/// Per-user mapping of node id to the context its last run produced.
#[derive(Debug, Default)]
pub struct ContextStore {
    nodes: DashMap<String, Context>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a fresh context from `bindings`.
    ///
    /// Every imported value is a deep copy, so the run that receives the
    /// context cannot reach back into the source node's stored state. A
    /// missing source node or variable binds `Nil`.
    pub fn resolve_context(&self, bindings: &[VariableBinding]) -> Context {
        let mut context = Context::with_capacity(bindings.len());
        for binding in bindings {
            let value = self
                .get_variable(&binding.source, &binding.name)
                .unwrap_or(Value::Nil);
            debug!(
                source = %binding.source,
                name = %binding.name,
                target = %binding.target,
                kind = value.type_name(),
                "resolved binding"
            );
            context.insert(binding.target.clone(), value);
        }
        context
    }

    /// Replaces whatever context `node_id` had before.
    pub fn save_context(&self, node_id: &str, context: Context) {
        self.nodes.insert(node_id.to_string(), context);
    }

    pub fn get_variable(&self, node_id: &str, name: &str) -> Option<Value> {
        self.nodes.get(node_id)?.get(name).cloned()
    }
}

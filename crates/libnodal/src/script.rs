use crate::output::OutputSink;
use crate::value::Context;

/// The capability of running a script against a mutable binding table.
///
/// Called on a dedicated worker thread. `globals` are read-only names made
/// visible to the script but not saved with its context. On return,
/// successful or not, `context` must hold the script's top-level bindings as
/// they stood when it stopped. Text output goes to `sink`.
pub trait ScriptEngine: Send + Sync {
    fn run(
        &self,
        source: &str,
        globals: &Context,
        context: &mut Context,
        sink: &OutputSink,
    ) -> Result<(), String>;
}

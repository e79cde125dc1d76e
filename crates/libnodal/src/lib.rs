pub mod codec;
pub mod context;
pub mod error;
pub mod lua;
pub mod output;
pub mod rate_limit;
pub mod registry;
pub mod script;
pub mod user;
pub mod value;
pub mod worker;

pub use codec::{Converted, convert};
pub use context::ContextStore;
pub use error::EngineError;
pub use lua::LuaEngine;
pub use output::{OutputLine, OutputSink};
pub use registry::UserRegistry;
pub use script::ScriptEngine;
pub use user::{RunGuard, RunOutcome, User};
pub use value::{Context, OUTPUT_KEY, Value};
pub use worker::{ExecutionReport, ExecutionWorker, Job};

//! Lua 5.4 implementation of [`ScriptEngine`].
//!
//! Each run gets a fresh state. Context entries are placed in a per-run
//! environment table that falls back to the standard globals, so top-level
//! assignments land in the environment and are read back as the node's new
//! bindings whether or not the chunk completed.

mod builtins;
mod convert;
mod userdata;

use mlua::{ChunkMode, Lua, LuaOptions, StdLib, Table};
use tracing::warn;

use crate::output::OutputSink;
use crate::script::ScriptEngine;
use crate::value::Context;

use convert::{Reader, ScriptEnv, to_lua};

/// Chunk name used in error positions, e.g. `node:3: attempt to call a nil value`.
const CHUNK_NAME: &str = "=node";

/// Script-facing loaders accept source text only.
const TEXT_ONLY_LOADERS: &str = r#"
local load, loadfile = load, loadfile
_G.load = function(chunk, name, _, ...) return load(chunk, name, "t", ...) end
_G.loadfile = function(file, _, ...) return loadfile(file, "t", ...) end
_G.dofile = function(file) return assert(loadfile(file, "t"))() end
_G.require, _G.package = nil, nil
"#;

#[derive(Debug, Default, Clone, Copy)]
pub struct LuaEngine;

impl LuaEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for LuaEngine {
    fn run(
        &self,
        source: &str,
        globals: &Context,
        context: &mut Context,
        sink: &OutputSink,
    ) -> Result<(), String> {
        let lua = new_state().map_err(|e| describe(&e))?;
        let env = prepare(&lua, globals, context, sink).map_err(|e| describe(&e))?;

        let result = lua
            .load(source)
            .set_name(CHUNK_NAME)
            .set_mode(ChunkMode::Text)
            .set_environment(env.clone())
            .exec();

        match collect_bindings(&env) {
            Ok(bindings) => *context = bindings,
            Err(e) => warn!(error = %e, "could not read bindings back from the script environment"),
        }
        result.map_err(|e| describe(&e))
    }
}

/// A state with the safe standard libraries that can also load function
/// bytecode carried over from an earlier run.
fn new_state() -> mlua::Result<Lua> {
    // SAFETY: only the safe libraries are opened and scripts are left with
    // text-only loaders. Binary chunks are loaded from Rust alone, from
    // bytecode dumped by this engine.
    let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE, LuaOptions::new()) };
    lua.load(TEXT_ONLY_LOADERS).set_name("=loaders").exec()?;
    Ok(lua)
}

fn prepare(
    lua: &Lua,
    globals: &Context,
    context: &Context,
    sink: &OutputSink,
) -> mlua::Result<Table> {
    builtins::install(lua, sink)?;
    let lua_globals = lua.globals();
    for (name, value) in globals {
        lua_globals.set(name.as_str(), to_lua(lua, value)?)?;
    }

    let env: Table = lua
        .load("return setmetatable({}, {__index = _G})")
        .set_name("=env")
        .eval()?;
    lua.set_app_data(ScriptEnv(env.clone()));
    for (name, value) in context {
        env.raw_set(name.as_str(), to_lua(lua, value)?)?;
    }
    Ok(env)
}

fn collect_bindings(env: &Table) -> mlua::Result<Context> {
    let mut bindings = Context::new();
    let mut reader = Reader::new();
    for pair in env.pairs::<mlua::Value, mlua::Value>() {
        let (key, value) = pair?;
        if let mlua::Value::String(name) = key {
            bindings.insert(name.to_string_lossy().to_string(), reader.read(&value));
        }
    }
    Ok(bindings)
}

/// Error text without the `stack traceback:` block mlua appends.
fn describe(err: &mlua::Error) -> String {
    let text = match err {
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => format!("syntax error: {message}"),
        mlua::Error::CallbackError { cause, .. } => return describe(cause),
        other => other.to_string(),
    };
    match text.find("\nstack traceback:") {
        Some(at) => text[..at].to_string(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Figure, OUTPUT_KEY, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn run_with(
        source: &str,
        context: Context,
        globals: Context,
    ) -> (Result<(), String>, Context, String) {
        let sink = OutputSink::detached("n1");
        let mut context = context;
        let result = LuaEngine::new().run(source, &globals, &mut context, &sink);
        sink.finish();
        (result, context, sink.transcript())
    }

    fn run(source: &str) -> (Result<(), String>, Context, String) {
        run_with(source, Context::new(), Context::new())
    }

    #[test]
    fn top_level_assignments_become_bindings() {
        let (result, ctx, _) = run("result = 5 + 7\nlocal hidden = 1\nratio = 1 / 4");
        assert_eq!(result, Ok(()));
        assert_eq!(ctx.get("result"), Some(&Value::Int(12)));
        assert_eq!(ctx.get("ratio"), Some(&Value::Float(0.25)));
        assert_eq!(ctx.get("hidden"), None);
        assert_eq!(ctx.get("print"), None);
    }

    #[test]
    fn context_entries_are_visible_and_replaceable() {
        let ctx = Context::from([
            ("x".to_string(), Value::Int(12)),
            ("gone".to_string(), Value::Bool(true)),
        ]);
        let (result, ctx, _) = run_with("y = x * 2\ngone = nil", ctx, Context::new());
        assert_eq!(result, Ok(()));
        assert_eq!(ctx.get("y"), Some(&Value::Int(24)));
        assert_eq!(ctx.get("x"), Some(&Value::Int(12)));
        assert_eq!(ctx.get("gone"), None);
    }

    #[test]
    fn globals_are_readable_but_not_collected() {
        let globals = Context::from([("STORAGE_DIR".to_string(), Value::Str("/srv/u".into()))]);
        let (result, ctx, _) = run_with("where = STORAGE_DIR", Context::new(), globals);
        assert_eq!(result, Ok(()));
        assert_eq!(ctx.get("where"), Some(&Value::Str("/srv/u".into())));
        assert_eq!(ctx.get("STORAGE_DIR"), None);
    }

    #[test]
    fn print_and_io_write_reach_the_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutputSink::new("n1", tx);
        let mut ctx = Context::new();
        let result = LuaEngine::new().run(
            "print('a', 1, true, nil)\nio.write('b', 2)\nio.write('\\n')\nio.write('tail')",
            &Context::new(),
            &mut ctx,
            &sink,
        );
        sink.finish();
        assert_eq!(result, Ok(()));
        assert_eq!(sink.transcript(), "a\t1\ttrue\tnil\nb2\ntail");

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line.text);
        }
        assert_eq!(lines, vec!["a\t1\ttrue\tnil\n", "b2\n", "tail"]);
    }

    #[test]
    fn runtime_error_keeps_partial_bindings() {
        let (result, ctx, out) = run("a = 1\nprint('before')\nerror('boom')\nb = 2");
        let message = result.expect_err("should fail");
        assert_eq!(message, "node:3: boom");
        assert_eq!(ctx.get("a"), Some(&Value::Int(1)));
        assert_eq!(ctx.get("b"), None);
        assert_eq!(out, "before\n");
    }

    #[test]
    fn syntax_error_is_reported() {
        let (result, _, _) = run("x = = 1");
        let message = result.expect_err("should fail");
        assert!(message.starts_with("syntax error"), "{message}");
        assert!(!message.contains("stack traceback"));
    }

    #[test]
    fn builtin_errors_surface_their_message() {
        let (result, _, _) = run("a = array({{1, 2}, {3}})");
        assert_eq!(result, Err("array: ragged nested sequences".to_string()));
    }

    #[test]
    fn tables_come_back_as_lists_and_maps() {
        let (result, ctx, _) = run(
            "xs = {1, 2, 3}\nm = {b = 2, a = 'x'}\nmixed = {1, 2, k = true}\nempty = {}\nsparse = {[1] = 'a', [3] = 'c'}",
        );
        assert_eq!(result, Ok(()));
        assert_eq!(
            ctx.get("xs"),
            Some(&Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
        );
        assert_eq!(
            ctx.get("m"),
            Some(&Value::Map(vec![
                (Value::Str("a".into()), Value::Str("x".into())),
                (Value::Str("b".into()), Value::Int(2)),
            ]))
        );
        assert!(matches!(ctx.get("mixed"), Some(Value::Map(entries)) if entries.len() == 3));
        assert_eq!(ctx.get("empty"), Some(&Value::Map(Vec::new())));
        assert_eq!(
            ctx.get("sparse"),
            Some(&Value::Map(vec![
                (Value::Int(1), Value::Str("a".into())),
                (Value::Int(3), Value::Str("c".into())),
            ]))
        );
    }

    /// Runs on its own thread so a conversion that never finishes fails the
    /// test instead of hanging it.
    fn run_bounded(source: &'static str) -> Context {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let (result, ctx, _) = run(source);
            let _ = tx.send((result, ctx));
        });
        let (result, ctx) = rx
            .recv_timeout(Duration::from_secs(20))
            .expect("bindings were not read back in time");
        assert_eq!(result, Ok(()));
        ctx
    }

    fn cycle() -> Value {
        Value::Opaque {
            type_name: "table".into(),
            repr: "<cycle>".into(),
        }
    }

    #[test]
    fn self_references_become_cycle_markers() {
        let ctx = run_bounded("t = {}\nt.a = t\nt.b = t\nu = {t}");
        assert_eq!(
            ctx.get("t"),
            Some(&Value::Map(vec![
                (Value::Str("a".into()), cycle()),
                (Value::Str("b".into()), cycle()),
            ]))
        );
        match ctx.get("u") {
            Some(Value::List(items)) => assert!(matches!(&items[0], Value::Map(m) if m.len() == 2)),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn heavily_shared_tables_are_read_in_bounded_time() {
        let ctx = run_bounded("x = {}\nfor i = 1, 40 do x = {a = x, b = x} end\nsmall = {1, 2}");
        assert!(matches!(ctx.get("x"), Some(Value::Map(entries)) if entries.len() == 2));
        assert_eq!(
            ctx.get("small"),
            Some(&Value::List(vec![Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn shared_arrays_are_rejected_instead_of_expanded() {
        let (result, _, _) = run("x = {1}\nfor i = 1, 60 do x = {x, x} end\na = array(x)");
        let message = result.expect_err("should fail");
        assert!(message.contains("elements"), "{message}");
    }

    #[test]
    fn functions_survive_unless_they_close_over_locals() {
        let (result, ctx, _) = run(
            "f = function(x) return x * 2 end\n\
             h = function(x) return math.floor(x) end\n\
             local k = 3\n\
             c = function() return k end",
        );
        assert_eq!(result, Ok(()));
        assert!(matches!(ctx.get("f"), Some(Value::Function(_))));
        assert!(matches!(ctx.get("h"), Some(Value::Function(_))));
        assert!(
            matches!(ctx.get("c"), Some(Value::Opaque { type_name, .. }) if type_name == "function")
        );
    }

    #[test]
    fn functions_from_upstream_are_callable() {
        let (first, upstream, _) = run(
            "f = function(x) return x * 2 end\nh = function(x) return math.floor(x) + offset end",
        );
        assert_eq!(first, Ok(()));
        let ctx = Context::from([
            ("g".to_string(), upstream["f"].clone()),
            ("m".to_string(), upstream["h"].clone()),
            ("offset".to_string(), Value::Int(10)),
        ]);
        let (result, ctx, _) = run_with("r = g(21)\nq = m(2.5)", ctx, Context::new());
        assert_eq!(result, Ok(()));
        assert_eq!(ctx.get("r"), Some(&Value::Int(42)));
        assert_eq!(ctx.get("q"), Some(&Value::Int(12)));
        assert!(matches!(ctx.get("g"), Some(Value::Function(_))));
    }

    #[test]
    fn scripts_cannot_load_bytecode() {
        let (result, ctx, _) = run(
            "fn, err = load(string.dump(function() end))\n\
             loaded = fn ~= nil\n\
             has_require = require ~= nil\n\
             text = load('return 7')()",
        );
        assert_eq!(result, Ok(()));
        assert_eq!(ctx.get("loaded"), Some(&Value::Bool(false)));
        assert!(matches!(ctx.get("err"), Some(Value::Str(e)) if e.contains("binary")));
        assert_eq!(ctx.get("has_require"), Some(&Value::Bool(false)));
        assert_eq!(ctx.get("text"), Some(&Value::Int(7)));
    }

    #[test]
    fn node_source_is_always_text() {
        let (result, ctx, _) = run("\u{1b}Lua\u{54}\u{0}");
        assert!(result.is_err());
        assert!(ctx.is_empty());
    }

    #[test]
    fn oversized_canvases_are_script_errors() {
        let (result, _, _) = run("img = image(200000, 200000)");
        let message = result.expect_err("should fail");
        assert!(message.starts_with("image:"), "{message}");

        let (result, _, _) = run("fig = figure(65535, 65535)");
        let message = result.expect_err("should fail");
        assert!(message.starts_with("figure:"), "{message}");
    }

    #[test]
    fn rich_values_round_trip_through_builtins() {
        let (result, ctx, _) = run(
            "t = tuple(1, 'two')\n\
             a = array({{1, 2}, {3, 4}})\n\
             total = a:sum()\n\
             corner = a:get(2, 2)\n\
             img = image(2, 1, {0, 0, 0})\n\
             img:set_pixel(1, 0, {255, 0, 0, 255})\n\
             fig = figure(100, 50)\n\
             fig:plot({0, 1, 2}, {0, 1, 4})\n\
             df = dataframe({'name', 'n'}, {{'a', 1}, {'b', 2}})\n\
             rows = #df",
        );
        assert_eq!(result, Ok(()));
        assert_eq!(
            ctx.get("t"),
            Some(&Value::Tuple(vec![Value::Int(1), Value::Str("two".into())]))
        );
        match ctx.get("a") {
            Some(Value::Array(a)) => {
                assert_eq!(a.shape(), &[2, 2]);
                assert!(a.is_integral());
            }
            other => panic!("expected array, got {other:?}"),
        }
        assert_eq!(ctx.get("total"), Some(&Value::Int(10)));
        assert_eq!(ctx.get("corner"), Some(&Value::Int(4)));
        match ctx.get("img") {
            Some(Value::Image(img)) => {
                assert_eq!(img.get_pixel(0, 0), Some([0, 0, 0, 255]));
                assert_eq!(img.get_pixel(1, 0), Some([255, 0, 0, 255]));
            }
            other => panic!("expected image, got {other:?}"),
        }
        match ctx.get("fig") {
            Some(Value::Figure(fig)) => {
                assert_eq!((fig.width, fig.height), (100, 50));
                assert_eq!(fig.background, Figure::WHITE);
                assert_eq!(fig.series.len(), 1);
            }
            other => panic!("expected figure, got {other:?}"),
        }
        match ctx.get("df") {
            Some(Value::Frame(df)) => {
                assert_eq!(df.columns, vec!["name".to_string(), "n".to_string()]);
                assert_eq!(df.column("n"), Some(vec![Value::Int(1), Value::Int(2)]));
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(ctx.get("rows"), Some(&Value::Int(2)));
    }

    #[test]
    fn rich_values_from_upstream_are_usable() {
        let (first, upstream, _) = run("t = tuple(3, 4)\nlocal k = 1\nf = function() return k end");
        assert_eq!(first, Ok(()));
        let ctx: Context = upstream
            .into_iter()
            .filter(|(k, _)| k != OUTPUT_KEY)
            .collect();
        let (result, ctx, out) = run_with(
            "s = t[1] + t[2]\nn = #t\nprint(t)\nprint(f)",
            ctx,
            Context::new(),
        );
        assert_eq!(result, Ok(()));
        assert_eq!(ctx.get("s"), Some(&Value::Int(7)));
        assert_eq!(ctx.get("n"), Some(&Value::Int(2)));
        assert!(out.starts_with("(3, 4)\nfunction: "), "{out}");
        assert!(
            matches!(ctx.get("f"), Some(Value::Opaque { type_name, .. }) if type_name == "function")
        );
    }

    #[test]
    fn inputs_global_exposes_json_payload() {
        let inputs = Value::from_json(&serde_json::json!({"rows": [1, 2], "name": "x"}));
        let globals = Context::from([("inputs".to_string(), inputs)]);
        let (result, ctx, _) = run_with(
            "first = inputs.rows[1]\nname = inputs.name",
            Context::new(),
            globals,
        );
        assert_eq!(result, Ok(()));
        assert_eq!(ctx.get("first"), Some(&Value::Int(1)));
        assert_eq!(ctx.get("name"), Some(&Value::Str("x".into())));
    }

    #[test]
    fn sleep_rejects_nonsense() {
        let (result, _, _) = run("sleep(0)\nsleep(-1)\nok = true");
        assert_eq!(result, Ok(()));
        let (result, _, _) = run("sleep(1/0)");
        assert!(result.is_err());
    }
}

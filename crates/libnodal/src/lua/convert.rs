//! Moves values between the Lua state and [`Value`].
//!
//! Going into Lua, plain data becomes tables and scalars and the rich
//! variants become userdata. Coming back, anything without a data form is
//! recorded as `Opaque` so a binding is never silently dropped.

use std::cmp::Ordering;
use std::collections::HashSet;

use mlua::{AnyUserData, ChunkMode, Function, Lua, Table};

use crate::value::{NdArray, Rgba, ScriptFunction, Value};

use super::userdata::{LuaArray, LuaFigure, LuaFrame, LuaImage, LuaOpaque, LuaTuple};

/// Nesting beyond this is not followed.
const MAX_DEPTH: usize = 64;
/// Values read back from one state before further tables are left opaque.
const MAX_VALUES: usize = 500_000;
/// Tables and numbers visited while building one array.
const MAX_ARRAY_VISITS: usize = 1 << 22;

const LUA_SIGNATURE: &[u8] = b"\x1bLua";

/// Environment that functions restored from a context resolve globals in.
pub(crate) struct ScriptEnv(pub(crate) Table);

pub(crate) fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    let converted = match value {
        Value::Nil => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Int(i) => mlua::Value::Integer(*i),
        Value::Float(x) => mlua::Value::Number(*x),
        Value::Str(s) => mlua::Value::String(lua.create_string(s)?),
        Value::List(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Map(entries) => {
            let table = lua.create_table_with_capacity(0, entries.len())?;
            for (key, item) in entries {
                // Lua tables cannot hold these keys.
                if matches!(key, Value::Nil) || matches!(key, Value::Float(x) if x.is_nan()) {
                    continue;
                }
                table.raw_set(to_lua(lua, key)?, to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Tuple(items) => userdata(lua, LuaTuple(items.clone()))?,
        Value::Array(array) => userdata(lua, LuaArray(array.clone()))?,
        Value::Frame(frame) => userdata(lua, LuaFrame(frame.clone()))?,
        Value::Image(image) => userdata(lua, LuaImage(image.clone()))?,
        Value::Figure(figure) => userdata(lua, LuaFigure(figure.clone()))?,
        Value::Function(function) => mlua::Value::Function(load_function(lua, function)?),
        Value::Opaque { type_name, repr } => userdata(
            lua,
            LuaOpaque {
                type_name: type_name.clone(),
                repr: repr.clone(),
            },
        )?,
    };
    Ok(converted)
}

fn userdata<T: mlua::UserData + 'static>(lua: &Lua, data: T) -> mlua::Result<mlua::Value> {
    lua.create_userdata(data).map(mlua::Value::UserData)
}

fn load_function(lua: &Lua, function: &ScriptFunction) -> mlua::Result<Function> {
    let env = lua.app_data_ref::<ScriptEnv>().map(|env| env.0.clone());
    let chunk = lua
        .load(function.bytecode.as_slice())
        .set_mode(ChunkMode::Binary);
    match env {
        Some(env) => chunk.set_environment(env).into_function(),
        None => chunk.into_function(),
    }
}

/// Converts a single value with a fresh [`Reader`].
pub(crate) fn from_lua(value: &mlua::Value) -> Value {
    Reader::new().read(value)
}

/// Reads values back out of a state.
///
/// Tables already on the current path come back as a `<cycle>` marker.
/// Shared tables are read once per reference, so the total number of values
/// one reader produces is capped; past the cap, tables are left opaque.
pub(crate) struct Reader {
    path: HashSet<usize>,
    remaining: usize,
}

impl Reader {
    pub(crate) fn new() -> Self {
        Self {
            path: HashSet::new(),
            remaining: MAX_VALUES,
        }
    }

    pub(crate) fn read(&mut self, value: &mlua::Value) -> Value {
        self.read_at(value, 0)
    }

    fn read_at(&mut self, value: &mlua::Value, depth: usize) -> Value {
        self.remaining = self.remaining.saturating_sub(1);
        match value {
            mlua::Value::Nil => Value::Nil,
            mlua::Value::Boolean(b) => Value::Bool(*b),
            mlua::Value::Integer(i) => Value::Int(*i),
            mlua::Value::Number(x) => Value::Float(*x),
            mlua::Value::String(s) => Value::Str(s.to_string_lossy().to_string()),
            mlua::Value::Table(table) => self.table(table, depth),
            mlua::Value::Function(function) => {
                function_from_lua(function).unwrap_or_else(|| opaque(value))
            }
            mlua::Value::UserData(ud) => userdata_from_lua(ud).unwrap_or_else(|| opaque(value)),
            mlua::Value::Error(err) => Value::Opaque {
                type_name: "error".to_string(),
                repr: err.to_string(),
            },
            other => opaque(other),
        }
    }

    /// A table whose keys are exactly `1..=n` is a list; anything else,
    /// including the empty table, is a map.
    fn table(&mut self, table: &Table, depth: usize) -> Value {
        let id = table.to_pointer() as usize;
        if self.path.contains(&id) {
            return Value::Opaque {
                type_name: "table".to_string(),
                repr: "<cycle>".to_string(),
            };
        }
        if depth >= MAX_DEPTH || self.remaining == 0 {
            return opaque(&mlua::Value::Table(table.clone()));
        }

        self.path.insert(id);
        let mut entries = Vec::new();
        for pair in table.pairs::<mlua::Value, mlua::Value>() {
            let Ok((key, item)) = pair else { continue };
            let key = self.read_at(&key, depth + 1);
            let item = self.read_at(&item, depth + 1);
            entries.push((key, item));
        }
        self.path.remove(&id);

        entries.sort_by(|a, b| key_order(&a.0, &b.0));
        let len = table.raw_len();
        let is_sequence = len > 0
            && entries.len() == len
            && entries
                .iter()
                .all(|(k, _)| matches!(k, Value::Int(i) if *i >= 1 && (*i as usize) <= len));
        if is_sequence {
            return Value::List(entries.into_iter().map(|(_, v)| v).collect());
        }
        Value::Map(entries)
    }
}

fn opaque(value: &mlua::Value) -> Value {
    Value::Opaque {
        type_name: value.type_name().to_string(),
        repr: format!("{}: {:p}", value.type_name(), value.to_pointer()),
    }
}

/// Bytecode for functions that can be rebuilt in another state.
///
/// That holds when the function has no upvalues or only `_ENV`. Closures
/// over locals would come back with those locals unset, and Rust builtins
/// have no bytecode, so both stay opaque.
fn function_from_lua(function: &Function) -> Option<Value> {
    let bytecode = function.dump(false);
    match upvalue_count(&bytecode)? {
        0 => {}
        1 if function.environment().is_some() => {}
        _ => return None,
    }
    Some(Value::Function(ScriptFunction {
        bytecode,
        repr: format!("function: {:p}", function.to_pointer()),
    }))
}

/// The main function's upvalue count, stored right after the Lua 5.4 binary
/// chunk header.
fn upvalue_count(bytecode: &[u8]) -> Option<u8> {
    if !bytecode.starts_with(LUA_SIGNATURE) || bytecode.get(4) != Some(&0x54) {
        return None;
    }
    let integer_size = usize::from(*bytecode.get(13)?);
    let number_size = usize::from(*bytecode.get(14)?);
    bytecode.get(15 + integer_size + number_size).copied()
}

/// Numbers first in numeric order, then strings, then everything else by
/// its string form.
fn key_order(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Int(_) | Value::Float(_) => 0,
            Value::Str(_) => 1,
            _ => 2,
        }
    }
    fn number(v: &Value) -> f64 {
        match v {
            Value::Int(i) => *i as f64,
            Value::Float(x) => *x,
            _ => 0.0,
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ if rank(a) == 0 => number(a).total_cmp(&number(b)),
        _ => a.to_string().cmp(&b.to_string()),
    })
}

fn userdata_from_lua(ud: &AnyUserData) -> Option<Value> {
    if ud.is::<LuaImage>() {
        return ud.borrow::<LuaImage>().ok().map(|i| Value::Image(i.0.clone()));
    }
    if ud.is::<LuaFigure>() {
        return ud.borrow::<LuaFigure>().ok().map(|f| Value::Figure(f.0.clone()));
    }
    if ud.is::<LuaArray>() {
        return ud.borrow::<LuaArray>().ok().map(|a| Value::Array(a.0.clone()));
    }
    if ud.is::<LuaFrame>() {
        return ud.borrow::<LuaFrame>().ok().map(|f| Value::Frame(f.0.clone()));
    }
    if ud.is::<LuaTuple>() {
        return ud.borrow::<LuaTuple>().ok().map(|t| Value::Tuple(t.0.clone()));
    }
    if ud.is::<LuaOpaque>() {
        return ud.borrow::<LuaOpaque>().ok().map(|o| Value::Opaque {
            type_name: o.type_name.clone(),
            repr: o.repr.clone(),
        });
    }
    None
}

/// Builds an n-d array from nested sequences of numbers.
pub(crate) fn array_from_lua(value: &mlua::Value) -> Result<NdArray, String> {
    let mut builder = ArrayBuilder {
        shape: Vec::new(),
        data: Vec::new(),
        integral: true,
        visits: 0,
    };
    builder.collect(value, 0)?;
    NdArray::new(builder.shape, builder.data, builder.integral)
}

struct ArrayBuilder {
    shape: Vec<usize>,
    data: Vec<f64>,
    integral: bool,
    visits: usize,
}

impl ArrayBuilder {
    fn collect(&mut self, value: &mlua::Value, depth: usize) -> Result<(), String> {
        if depth > MAX_DEPTH {
            return Err("array nesting is too deep".to_string());
        }
        self.visits += 1;
        if self.visits > MAX_ARRAY_VISITS {
            return Err(format!("array: more than {MAX_ARRAY_VISITS} elements"));
        }
        match value {
            mlua::Value::Integer(i) => self.scalar(depth, *i as f64),
            mlua::Value::Number(x) => {
                self.integral = false;
                self.scalar(depth, *x)
            }
            mlua::Value::Table(table) => {
                let len = table.raw_len();
                match self.shape.get(depth) {
                    Some(expected) if *expected != len => {
                        return Err("array: ragged nested sequences".to_string());
                    }
                    Some(_) => {}
                    None if depth == self.shape.len() && self.data.is_empty() => {
                        self.shape.push(len)
                    }
                    None => return Err("array: ragged nested sequences".to_string()),
                }
                for i in 1..=len {
                    let item: mlua::Value = table.raw_get(i).map_err(|e| e.to_string())?;
                    self.collect(&item, depth + 1)?;
                }
                Ok(())
            }
            other => Err(format!(
                "array elements must be numbers, got {}",
                other.type_name()
            )),
        }
    }

    fn scalar(&mut self, depth: usize, x: f64) -> Result<(), String> {
        if depth != self.shape.len() {
            return Err("array: ragged nested sequences".to_string());
        }
        self.data.push(x);
        Ok(())
    }
}

/// A flat list of numbers from a sequence table or a one-dimensional array.
pub(crate) fn numbers(value: &mlua::Value) -> mlua::Result<Vec<f64>> {
    match value {
        mlua::Value::Table(table) => {
            let mut out = Vec::with_capacity(table.raw_len());
            for i in 1..=table.raw_len() {
                let item: mlua::Value = table.raw_get(i)?;
                match item {
                    mlua::Value::Integer(n) => out.push(n as f64),
                    mlua::Value::Number(x) => out.push(x),
                    other => {
                        return Err(runtime(format!(
                            "expected a number at position {i}, got {}",
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(out)
        }
        mlua::Value::UserData(ud) if ud.is::<LuaArray>() => {
            let array = ud.borrow::<LuaArray>()?;
            if array.0.shape().len() != 1 {
                return Err(runtime("expected a one-dimensional array".to_string()));
            }
            Ok(array.0.data().to_vec())
        }
        other => Err(runtime(format!(
            "expected a sequence of numbers, got {}",
            other.type_name()
        ))),
    }
}

/// `{r, g, b}` or `{r, g, b, a}` with components in 0..=255.
pub(crate) fn color(table: Option<Table>, default: Rgba) -> mlua::Result<Rgba> {
    let Some(table) = table else {
        return Ok(default);
    };
    let mut rgba = [0, 0, 0, 255];
    let len = table.raw_len();
    if !(3..=4).contains(&len) {
        return Err(runtime(format!("color needs 3 or 4 components, got {len}")));
    }
    for (i, slot) in rgba.iter_mut().enumerate().take(len) {
        let component: i64 = table.raw_get(i + 1)?;
        *slot = u8::try_from(component)
            .map_err(|_| runtime(format!("color component {component} is out of range")))?;
    }
    Ok(rgba)
}

pub(crate) fn runtime(message: String) -> mlua::Error {
    mlua::Error::RuntimeError(message)
}

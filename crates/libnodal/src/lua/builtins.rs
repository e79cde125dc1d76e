use std::time::Duration;

use mlua::{Function, Lua, Table, Variadic};

use crate::output::OutputSink;
use crate::value::{Figure, Frame, Image};

use super::convert::{array_from_lua, color, from_lua, runtime};
use super::userdata::{LuaArray, LuaFigure, LuaFrame, LuaImage, LuaTuple};

/// Installs the node builtins into the state's global table.
pub(crate) fn install(lua: &Lua, sink: &OutputSink) -> mlua::Result<()> {
    let globals = lua.globals();
    let tostring: Function = globals.get("tostring")?;

    let print_sink = sink.clone();
    let print = lua.create_function(move |_, args: Variadic<mlua::Value>| {
        let mut line = String::new();
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                line.push('\t');
            }
            let text: mlua::String = tostring.call(arg.clone())?;
            line.push_str(&text.to_string_lossy());
        }
        line.push('\n');
        print_sink.write(&line);
        Ok(())
    })?;
    globals.set("print", print)?;

    let write_sink = sink.clone();
    let write = lua.create_function(move |_, args: Variadic<mlua::Value>| {
        for arg in args.iter() {
            match arg {
                mlua::Value::String(s) => write_sink.write(&s.to_string_lossy()),
                mlua::Value::Integer(i) => write_sink.write(&i.to_string()),
                mlua::Value::Number(x) => write_sink.write(&x.to_string()),
                other => {
                    return Err(runtime(format!(
                        "bad argument to 'write' (string expected, got {})",
                        other.type_name()
                    )));
                }
            }
        }
        Ok(())
    })?;
    let io: Table = globals.get("io")?;
    io.set("write", write)?;

    globals.set(
        "sleep",
        lua.create_function(|_, secs: f64| {
            if secs > 0.0 {
                let pause = Duration::try_from_secs_f64(secs)
                    .map_err(|e| runtime(format!("sleep: {e}")))?;
                std::thread::sleep(pause);
            }
            Ok(())
        })?,
    )?;

    globals.set(
        "tuple",
        lua.create_function(|_, args: Variadic<mlua::Value>| {
            Ok(LuaTuple(args.iter().map(from_lua).collect()))
        })?,
    )?;

    globals.set(
        "array",
        lua.create_function(|_, data: mlua::Value| {
            array_from_lua(&data).map(LuaArray).map_err(runtime)
        })?,
    )?;

    globals.set(
        "image",
        lua.create_function(|_, (width, height, fill): (u32, u32, Option<Table>)| {
            let fill = color(fill, Figure::WHITE)?;
            Image::new(width, height, fill)
                .map(LuaImage)
                .map_err(|e| runtime(format!("image: {e}")))
        })?,
    )?;

    globals.set(
        "figure",
        lua.create_function(|_, (width, height): (Option<u32>, Option<u32>)| {
            Figure::new(width.unwrap_or(640), height.unwrap_or(480))
                .map(LuaFigure)
                .map_err(|e| runtime(format!("figure: {e}")))
        })?,
    )?;

    globals.set(
        "dataframe",
        lua.create_function(|_, (columns, rows): (Vec<String>, Vec<Table>)| {
            let mut cells = Vec::with_capacity(rows.len());
            for row in rows {
                let mut values = Vec::with_capacity(row.raw_len());
                for i in 1..=row.raw_len() {
                    let cell: mlua::Value = row.raw_get(i)?;
                    values.push(from_lua(&cell));
                }
                cells.push(values);
            }
            Frame::new(columns, cells)
                .map(LuaFrame)
                .map_err(|e| runtime(format!("dataframe: {e}")))
        })?,
    )?;

    Ok(())
}

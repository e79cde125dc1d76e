use mlua::{MetaMethod, Table, UserData, UserDataMethods, Variadic};

use crate::value::{Figure, Frame, Image, NdArray, Rgba, Value};

use super::convert::{color, numbers, runtime, to_lua};

/// Line color used when `plot` gets none.
const DEFAULT_SERIES_COLOR: Rgba = [31, 119, 180, 255];

pub(crate) struct LuaTuple(pub(crate) Vec<Value>);

impl UserData for LuaTuple {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, index: mlua::Value| {
            match index.as_integer().and_then(|i| usize::try_from(i).ok()) {
                Some(i) if i >= 1 && i <= this.0.len() => to_lua(lua, &this.0[i - 1]),
                _ => Ok(mlua::Value::Nil),
            }
        });
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.0.len()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(Value::Tuple(this.0.clone()).to_string())
        });
    }
}

pub(crate) struct LuaArray(pub(crate) NdArray);

impl UserData for LuaArray {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("sum", |_, this, ()| {
            let sum = this.0.sum();
            Ok(if this.0.is_integral() {
                mlua::Value::Integer(sum as i64)
            } else {
                mlua::Value::Number(sum)
            })
        });
        methods.add_method("shape", |_, this, ()| Ok(this.0.shape().to_vec()));
        // One-based, like everything else in Lua.
        methods.add_method("get", |_, this, index: Variadic<usize>| {
            let zero_based: Option<Vec<usize>> =
                index.iter().map(|i| i.checked_sub(1)).collect();
            let value = zero_based.and_then(|idx| this.0.get(&idx));
            Ok(match value {
                Some(x) if this.0.is_integral() => mlua::Value::Integer(x as i64),
                Some(x) => mlua::Value::Number(x),
                None => mlua::Value::Nil,
            })
        });
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| {
            Ok(this.0.shape().first().copied().unwrap_or(0))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
    }
}

pub(crate) struct LuaFrame(pub(crate) Frame);

impl UserData for LuaFrame {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("column", |lua, this, name: String| {
            match this.0.column(&name) {
                Some(cells) => to_lua(lua, &Value::List(cells)),
                None => Err(runtime(format!("no column named {name:?}"))),
            }
        });
        methods.add_method("columns", |_, this, ()| Ok(this.0.columns.clone()));
        methods.add_method("nrows", |_, this, ()| Ok(this.0.rows.len()));
        methods.add_method("ncols", |_, this, ()| Ok(this.0.columns.len()));
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.0.rows.len()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(Value::Frame(this.0.clone()).to_string())
        });
    }
}

/// Pixel coordinates are zero-based with the origin at the top left.
pub(crate) struct LuaImage(pub(crate) Image);

impl UserData for LuaImage {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("width", |_, this, ()| Ok(this.0.width));
        methods.add_method("height", |_, this, ()| Ok(this.0.height));
        methods.add_method("get_pixel", |_, this, (x, y): (u32, u32)| {
            Ok(this.0.get_pixel(x, y).map(|px| px.to_vec()))
        });
        methods.add_method_mut(
            "set_pixel",
            |_, this, (x, y, rgba): (u32, u32, Option<Table>)| {
                let rgba = color(rgba, [0, 0, 0, 255])?;
                Ok(this.0.set_pixel(x, y, rgba))
            },
        );
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(Value::Image(this.0.clone()).to_string())
        });
    }
}

pub(crate) struct LuaFigure(pub(crate) Figure);

impl UserData for LuaFigure {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut(
            "plot",
            |_, this, (xs, ys, rgba): (mlua::Value, mlua::Value, Option<Table>)| {
                let xs = numbers(&xs)?;
                let ys = numbers(&ys)?;
                let rgba = color(rgba, DEFAULT_SERIES_COLOR)?;
                this.0.plot(xs, ys, rgba).map_err(runtime)
            },
        );
        methods.add_method("series", |_, this, ()| Ok(this.0.series.len()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(Value::Figure(this.0.clone()).to_string())
        });
    }
}

/// A value restored from a context that has no data form.
pub(crate) struct LuaOpaque {
    pub(crate) type_name: String,
    pub(crate) repr: String,
}

impl UserData for LuaOpaque {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.repr.clone()));
        methods.add_method("type", |_, this, ()| Ok(this.type_name.clone()));
    }
}

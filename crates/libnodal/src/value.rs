//! Owned runtime values stored in node contexts.
//!
//! Every variant owns its data outright, so `Clone` is a deep copy. Contexts
//! handed to a run are clones of the stored ones and can never alias another
//! node's state.

use std::collections::HashMap;
use std::fmt;

/// Variable bindings of one node, as produced by its last run.
pub type Context = HashMap<String, Value>;

/// Reserved context entry holding the complete captured output of a run.
pub const OUTPUT_KEY: &str = "__output__";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Key/value pairs in a stable order. Keys may be any value.
    Map(Vec<(Value, Value)>),
    Array(NdArray),
    Frame(Frame),
    Image(Image),
    Figure(Figure),
    Function(ScriptFunction),
    /// Something the interpreter could not hand back as data.
    Opaque { type_name: String, repr: String },
}

impl Value {
    pub fn type_name(&self) -> &str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Map(_) => "dict",
            Value::Array(_) => "array",
            Value::Frame(_) => "dataframe",
            Value::Image(_) => "image",
            Value::Figure(_) => "figure",
            Value::Function(_) => "function",
            Value::Opaque { type_name, .. } => type_name,
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (Value::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    fn write_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{other}"),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Value], open: &str, close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        item.write_nested(f)?;
    }
    f.write_str(close)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// String form, in Lua table-constructor style for containers.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{x:.1}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => write_seq(f, items, "{", "}"),
            Value::Tuple(items) => write_seq(f, items, "(", ")"),
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match key {
                        Value::Str(s) if is_identifier(s) => f.write_str(s)?,
                        other => {
                            f.write_str("[")?;
                            other.write_nested(f)?;
                            f.write_str("]")?;
                        }
                    }
                    f.write_str(" = ")?;
                    value.write_nested(f)?;
                }
                f.write_str("}")
            }
            Value::Array(array) => write!(f, "{array}"),
            Value::Frame(frame) => write!(
                f,
                "dataframe({} rows x {} columns)",
                frame.rows.len(),
                frame.columns.len()
            ),
            Value::Image(image) => write!(f, "image({}x{})", image.width, image.height),
            Value::Figure(figure) => write!(
                f,
                "figure({}x{}, {} series)",
                figure.width,
                figure.height,
                figure.series.len()
            ),
            Value::Function(function) => f.write_str(&function.repr),
            Value::Opaque { repr, .. } => f.write_str(repr),
        }
    }
}

/// Homogeneous numeric n-dimensional array stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
    integral: bool,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>, integral: bool) -> Result<Self, String> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(format!(
                "array shape {shape:?} needs {expected} elements, got {}",
                data.len()
            ));
        }
        Ok(Self {
            shape,
            data,
            integral,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// True when every element came from an integer.
    pub fn is_integral(&self) -> bool {
        self.integral
    }

    /// Element at a zero-based multi-index.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (i, dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        self.data.get(offset).copied()
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    fn write_level(&self, f: &mut fmt::Formatter<'_>, depth: usize, offset: usize) -> fmt::Result {
        if depth == self.shape.len() {
            let x = self.data[offset];
            return if self.integral {
                write!(f, "{}", x as i64)
            } else {
                write!(f, "{x}")
            };
        }
        let stride: usize = self.shape[depth + 1..].iter().product();
        f.write_str("[")?;
        for i in 0..self.shape[depth] {
            if i > 0 {
                f.write_str(", ")?;
            }
            self.write_level(f, depth + 1, offset + i * stride)?;
        }
        f.write_str("]")
    }
}

impl fmt::Display for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("array(")?;
        if self.data.is_empty() {
            f.write_str("[]")?;
        } else {
            self.write_level(f, 0, 0)?;
        }
        f.write_str(")")
    }
}

/// Two-dimensional labeled data: named columns over positional rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Frame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, String> {
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(format!(
                "row {} has {} cells, expected {}",
                i + 1,
                row.len(),
                columns.len()
            ));
        }
        Ok(Self { columns, rows })
    }

    pub fn column(&self, name: &str) -> Option<Vec<Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row[idx].clone()).collect())
    }
}

pub type Rgba = [u8; 4];

/// Largest raster an image or figure may cover, in pixels.
pub const MAX_PIXELS: u64 = 16 * 1024 * 1024;

/// Rejects canvases above [`MAX_PIXELS`].
pub fn check_canvas(width: u32, height: u32) -> Result<(), String> {
    let pixels = u64::from(width) * u64::from(height);
    if pixels > MAX_PIXELS {
        return Err(format!(
            "{width}x{height} is {pixels} pixels, more than the {MAX_PIXELS} allowed"
        ));
    }
    Ok(())
}

/// RGBA raster, row-major, four bytes per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32, fill: Rgba) -> Result<Self, String> {
        check_canvas(width, height)?;
        let count = width as usize * height as usize;
        Ok(Self {
            width,
            height,
            pixels: fill.repeat(count),
        })
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height)
            .then(|| (y as usize * self.width as usize + x as usize) * 4)
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        let at = self.offset(x, y)?;
        let px = self.pixels.get(at..at + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: Rgba) -> bool {
        match self.offset(x, y) {
            Some(at) if at + 4 <= self.pixels.len() => {
                self.pixels[at..at + 4].copy_from_slice(&color);
                true
            }
            _ => false,
        }
    }
}

/// A script function carried between runs as bytecode.
///
/// Only the script engine produces these, by dumping a function it can
/// load back.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFunction {
    pub bytecode: Vec<u8>,
    pub repr: String,
}

/// One polyline of a figure, in data coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
    pub color: Rgba,
}

/// A plot canvas; rasterized and cropped when encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    pub width: u32,
    pub height: u32,
    pub background: Rgba,
    pub series: Vec<Series>,
}

impl Figure {
    pub const WHITE: Rgba = [255, 255, 255, 255];

    pub fn new(width: u32, height: u32) -> Result<Self, String> {
        check_canvas(width, height)?;
        Ok(Self {
            width,
            height,
            background: Self::WHITE,
            series: Vec::new(),
        })
    }

    pub fn plot(&mut self, xs: Vec<f64>, ys: Vec<f64>, color: Rgba) -> Result<(), String> {
        if xs.len() != ys.len() {
            return Err(format!(
                "plot needs as many x as y values ({} vs {})",
                xs.len(),
                ys.len()
            ));
        }
        self.series.push(Series { xs, ys, color });
        Ok(())
    }
}

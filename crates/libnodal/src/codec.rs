//! Conversion of context values into transport-safe `{type, value}` pairs.
//!
//! `convert` is total: every failure is folded into an `error`-tagged result.
//! Shapes are checked in a fixed priority order: scalars, image, figure,
//! table, array, mapping, sequence, then the opaque fallback.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde::Serialize;
use serde_json::{Map, Number, json};

use crate::error::EngineError;
use crate::value::{Figure, Frame, Image, NdArray, Value, check_canvas};

/// Padding kept around figure content after cropping, in pixels.
const FIGURE_CROP_PAD: u32 = 4;
/// Fraction of the canvas left empty around plotted data.
const FIGURE_MARGIN: f32 = 0.08;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Converted {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

impl Converted {
    fn new(kind: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            value,
        }
    }
}

pub fn convert(value: &Value) -> Converted {
    match try_convert(value) {
        Ok(converted) => converted,
        Err(err) => Converted::new("error", json!(err.to_string())),
    }
}

fn try_convert(value: &Value) -> Result<Converted, EngineError> {
    let converted = match value {
        Value::Nil => Converted::new("nil", serde_json::Value::Null),
        Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {
            Converted::new(value.type_name(), scalar_json(value))
        }
        Value::Image(image) => Converted::new("image", json!(image_png_base64(image)?)),
        Value::Figure(figure) => Converted::new("image", json!(figure_png_base64(figure)?)),
        Value::Frame(frame) => Converted::new("table", json!(frame_to_html(frame))),
        Value::Array(array) => Converted::new("list", array_to_json(array)),
        Value::Map(_) => match strict_json(value) {
            Some(json) => Converted::new("dict", json),
            None => Converted::new("dict", json!(value.to_string())),
        },
        Value::List(items) => Converted::new("list", plain_seq(items)),
        Value::Tuple(items) => Converted::new("tuple", plain_seq(items)),
        Value::Function(function) => Converted::new("function", json!(function.repr)),
        Value::Opaque { type_name, repr } => Converted::new(type_name.as_str(), json!(repr)),
    };
    Ok(converted)
}

fn scalar_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(x) => Number::from_f64(*x).map_or(serde_json::Value::Null, Into::into),
        Value::Str(s) => json!(s),
        _ => serde_json::Value::Null,
    }
}

/// JSON form of a value if it survives a text round trip unchanged.
///
/// Only plain data qualifies: scalars with finite floats, sequences, and
/// mappings whose keys are all strings.
fn strict_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Nil => Some(serde_json::Value::Null),
        Value::Bool(_) | Value::Int(_) | Value::Str(_) => Some(scalar_json(value)),
        Value::Float(x) => Number::from_f64(*x).map(Into::into),
        Value::List(items) | Value::Tuple(items) => items
            .iter()
            .map(strict_json)
            .collect::<Option<Vec<_>>>()
            .map(serde_json::Value::Array),
        Value::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, item) in entries {
                let Value::Str(key) = key else {
                    return None;
                };
                map.insert(key.clone(), strict_json(item)?);
            }
            Some(serde_json::Value::Object(map))
        }
        _ => None,
    }
}

/// Sequence members as plain JSON; members that are not plain data fall back
/// to their string form.
fn plain_seq(items: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(items.iter().map(plain_json).collect())
}

fn plain_json(value: &Value) -> serde_json::Value {
    if let Some(json) = strict_json(value) {
        return json;
    }
    match value {
        Value::List(items) | Value::Tuple(items) => plain_seq(items),
        Value::Array(array) => array_to_json(array),
        other => json!(other.to_string()),
    }
}

fn array_to_json(array: &NdArray) -> serde_json::Value {
    fn level(array: &NdArray, depth: usize, offset: usize) -> serde_json::Value {
        let shape = array.shape();
        if depth == shape.len() {
            let x = array.data()[offset];
            return if array.is_integral() {
                json!(x as i64)
            } else {
                Number::from_f64(x).map_or(serde_json::Value::Null, Into::into)
            };
        }
        let stride: usize = shape[depth + 1..].iter().product();
        serde_json::Value::Array(
            (0..shape[depth])
                .map(|i| level(array, depth + 1, offset + i * stride))
                .collect(),
        )
    }

    if array.data().is_empty() {
        return json!([]);
    }
    level(array, 0, 0)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn frame_to_html(frame: &Frame) -> String {
    let mut html = String::from("<table border=\"1\" class=\"dataframe\">\n  <thead>\n");
    html.push_str("    <tr style=\"text-align: right;\">\n      <th></th>\n");
    for column in &frame.columns {
        html.push_str(&format!("      <th>{}</th>\n", escape_html(column)));
    }
    html.push_str("    </tr>\n  </thead>\n  <tbody>\n");
    for (i, row) in frame.rows.iter().enumerate() {
        html.push_str(&format!("    <tr>\n      <th>{i}</th>\n"));
        for cell in row {
            html.push_str(&format!("      <td>{}</td>\n", escape_html(&cell.to_string())));
        }
        html.push_str("    </tr>\n");
    }
    html.push_str("  </tbody>\n</table>");
    html
}

fn encode_png(buffer: RgbaImage) -> Result<String, EngineError> {
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(buffer)
        .write_to(&mut bytes, ImageFormat::Png)
        .map_err(|e| EngineError::Codec(e.to_string()))?;
    Ok(STANDARD.encode(bytes.into_inner()))
}

fn image_png_base64(image: &Image) -> Result<String, EngineError> {
    check_canvas(image.width, image.height).map_err(EngineError::Codec)?;
    let buffer = RgbaImage::from_raw(image.width, image.height, image.pixels.clone())
        .ok_or_else(|| {
            EngineError::Codec(format!(
                "pixel buffer of {} bytes does not fit a {}x{} image",
                image.pixels.len(),
                image.width,
                image.height
            ))
        })?;
    encode_png(buffer)
}

fn figure_png_base64(figure: &Figure) -> Result<String, EngineError> {
    if figure.width == 0 || figure.height == 0 {
        return Err(EngineError::Codec(format!(
            "figure size {}x{} is empty",
            figure.width, figure.height
        )));
    }
    check_canvas(figure.width, figure.height).map_err(EngineError::Codec)?;
    let canvas = render_figure(figure);
    encode_png(crop_to_content(&canvas, Rgba(figure.background)))
}

fn render_figure(figure: &Figure) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(figure.width, figure.height, Rgba(figure.background));

    let points = figure
        .series
        .iter()
        .flat_map(|s| s.xs.iter().zip(&s.ys))
        .filter(|(x, y)| x.is_finite() && y.is_finite());
    let mut bounds: Option<(f64, f64, f64, f64)> = None;
    for (&x, &y) in points {
        bounds = Some(match bounds {
            None => (x, x, y, y),
            Some((x0, x1, y0, y1)) => (x0.min(x), x1.max(x), y0.min(y), y1.max(y)),
        });
    }
    let Some((x_min, x_max, y_min, y_max)) = bounds else {
        return canvas;
    };

    let (w, h) = (figure.width as f32, figure.height as f32);
    let (mx, my) = (w * FIGURE_MARGIN, h * FIGURE_MARGIN);
    let project = |x: f64, y: f64| -> (f32, f32) {
        let fx = if x_max > x_min {
            ((x - x_min) / (x_max - x_min)) as f32
        } else {
            0.5
        };
        let fy = if y_max > y_min {
            ((y - y_min) / (y_max - y_min)) as f32
        } else {
            0.5
        };
        (mx + fx * (w - 1.0 - 2.0 * mx), h - 1.0 - my - fy * (h - 1.0 - 2.0 * my))
    };

    for series in &figure.series {
        let color = Rgba(series.color);
        let pts: Vec<(f32, f32)> = series
            .xs
            .iter()
            .zip(&series.ys)
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|(&x, &y)| project(x, y))
            .collect();
        if let [(x, y)] = pts.as_slice() {
            canvas.put_pixel(*x as u32, *y as u32, color);
        }
        for pair in pts.windows(2) {
            imageproc::drawing::draw_line_segment_mut(&mut canvas, pair[0], pair[1], color);
        }
    }
    canvas
}

/// Crops to the bounding box of pixels that differ from the background.
fn crop_to_content(canvas: &RgbaImage, background: Rgba<u8>) -> RgbaImage {
    let mut bbox: Option<(u32, u32, u32, u32)> = None;
    for (x, y, px) in canvas.enumerate_pixels() {
        if *px != background {
            bbox = Some(match bbox {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
    }
    let Some((x0, y0, x1, y1)) = bbox else {
        return canvas.clone();
    };
    let left = x0.saturating_sub(FIGURE_CROP_PAD);
    let top = y0.saturating_sub(FIGURE_CROP_PAD);
    let right = (x1 + FIGURE_CROP_PAD).min(canvas.width() - 1);
    let bottom = (y1 + FIGURE_CROP_PAD).min(canvas.height() - 1);
    image::imageops::crop_imm(canvas, left, top, right - left + 1, bottom - top + 1).to_image()
}

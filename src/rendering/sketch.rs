//! 声明式图形渲染
//!
//! 模型在 ```figure 代码块中输出 JSON，例如：
//!
//! ```json
//! {
//!   "points": {"A": [0, 0, 0], "B": [6, 0, 0], "C": [6, 6, 0], "E": [0, 0, 6]},
//!   "segments": [["A", "B"], ["B", "C"], {"from": "A", "to": "E", "dashed": true}],
//!   "polygons": [["A", "B", "C"]],
//!   "circles": [{"center": "A", "radius": 2}]
//! }
//! ```
//!
//! 三维坐标使用斜投影（纵深方向缩短一半、倾斜 45°），二维坐标直接使用。
//! 不绘制文字标签，点用小方块标出。

use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use serde::Deserialize;
use tracing::debug;

use super::{encode_png_base64, FigureRenderer, RenderContext, RenderOutcome};
use crate::error::RenderError;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const LINE: Rgb<u8> = Rgb([30, 60, 160]);
const POINT: Rgb<u8> = Rgb([200, 30, 30]);
const DASH_ON: usize = 8;
const CIRCLE_STEPS: usize = 96;

#[derive(Debug, Deserialize)]
struct Sketch {
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    points: HashMap<String, Vec<f64>>,
    #[serde(default)]
    segments: Vec<SegmentSpec>,
    #[serde(default)]
    polygons: Vec<Vec<String>>,
    #[serde(default)]
    circles: Vec<CircleSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SegmentSpec {
    Pair([String; 2]),
    Detailed {
        from: String,
        to: String,
        #[serde(default)]
        dashed: bool,
    },
}

#[derive(Debug, Deserialize)]
struct CircleSpec {
    center: String,
    radius: f64,
}

/// 投影后的平面图元
#[derive(Debug, Default)]
struct Scene {
    lines: Vec<((f64, f64), (f64, f64), bool)>,
    markers: Vec<(f64, f64)>,
}

impl Scene {
    fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        let mut xs = self
            .lines
            .iter()
            .flat_map(|(a, b, _)| [*a, *b])
            .chain(self.markers.iter().copied())
            .peekable();
        xs.peek()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) =
            (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for (x, y) in xs {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        Some((min_x, min_y, max_x, max_y))
    }
}

/// 斜投影
fn project(coords: &[f64]) -> Result<(f64, f64), RenderError> {
    const DEPTH: f64 = 0.5 * std::f64::consts::FRAC_1_SQRT_2;
    match coords {
        [x, y] => Ok((*x, *y)),
        [x, y, z] => Ok((x + DEPTH * y, z + DEPTH * y)),
        other => Err(RenderError::InvalidSketch(format!(
            "坐标必须是 2 或 3 个数，实际为 {} 个",
            other.len()
        ))),
    }
}

impl Sketch {
    fn point(&self, name: &str) -> Result<(f64, f64), RenderError> {
        let coords = self
            .points
            .get(name)
            .ok_or_else(|| RenderError::UnknownPoint(name.to_string()))?;
        project(coords)
    }

    fn scene(&self) -> Result<Scene, RenderError> {
        let mut scene = Scene::default();

        for coords in self.points.values() {
            scene.markers.push(project(coords)?);
        }

        for segment in &self.segments {
            let (from, to, dashed) = match segment {
                SegmentSpec::Pair([from, to]) => (from, to, false),
                SegmentSpec::Detailed { from, to, dashed } => (from, to, *dashed),
            };
            scene.lines.push((self.point(from)?, self.point(to)?, dashed));
        }

        for polygon in &self.polygons {
            let vertices = polygon
                .iter()
                .map(|name| self.point(name))
                .collect::<Result<Vec<_>, _>>()?;
            for (i, a) in vertices.iter().enumerate() {
                let b = vertices[(i + 1) % vertices.len()];
                scene.lines.push((*a, b, false));
            }
        }

        // 圆画在其中心所在的平面（投影后的二维平面）上
        for circle in &self.circles {
            let (cx, cy) = self.point(&circle.center)?;
            let step = std::f64::consts::TAU / CIRCLE_STEPS as f64;
            for i in 0..CIRCLE_STEPS {
                let (t0, t1) = (i as f64 * step, (i + 1) as f64 * step);
                scene.lines.push((
                    (cx + circle.radius * t0.cos(), cy + circle.radius * t0.sin()),
                    (cx + circle.radius * t1.cos(), cy + circle.radius * t1.sin()),
                    false,
                ));
            }
        }

        if scene.lines.is_empty() && scene.markers.is_empty() {
            return Err(RenderError::EmptyFigure);
        }
        Ok(scene)
    }
}

/// 声明式渲染器
#[derive(Debug, Clone)]
pub struct SketchRenderer {
    width: u32,
    height: u32,
    margin: u32,
}

impl Default for SketchRenderer {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            margin: 40,
        }
    }
}

impl SketchRenderer {
    /// 解析并绘制，返回 PNG 字节
    pub fn render_png(&self, code: &str) -> Result<Vec<u8>, RenderError> {
        let sketch: Sketch =
            serde_json::from_str(code).map_err(|e| RenderError::InvalidSketch(e.to_string()))?;
        let scene = sketch.scene()?;

        let width = sketch.width.unwrap_or(self.width).clamp(100, 2000);
        let height = sketch.height.unwrap_or(self.height).clamp(100, 2000);
        let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND);

        let (min_x, min_y, max_x, max_y) = scene.bounds().ok_or(RenderError::EmptyFigure)?;
        let margin = f64::from(self.margin);
        let span_x = (max_x - min_x).max(1e-9);
        let span_y = (max_y - min_y).max(1e-9);
        let scale = ((f64::from(width) - 2.0 * margin) / span_x)
            .min((f64::from(height) - 2.0 * margin) / span_y);
        // 居中，y 轴向上
        let offset_x = (f64::from(width) - span_x * scale) / 2.0;
        let offset_y = (f64::from(height) - span_y * scale) / 2.0;
        let to_pixel = |(x, y): (f64, f64)| -> (i64, i64) {
            (
                (offset_x + (x - min_x) * scale).round() as i64,
                (f64::from(height) - offset_y - (y - min_y) * scale).round() as i64,
            )
        };

        for (a, b, dashed) in &scene.lines {
            draw_line(&mut canvas, to_pixel(*a), to_pixel(*b), *dashed);
        }
        for marker in &scene.markers {
            draw_marker(&mut canvas, to_pixel(*marker));
        }

        let mut png = Cursor::new(Vec::new());
        canvas
            .write_to(&mut png, ImageFormat::Png)
            .map_err(|e| RenderError::Encode(e.to_string()))?;
        Ok(png.into_inner())
    }
}

fn put(canvas: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham 直线，线宽 2 像素
fn draw_line(canvas: &mut RgbImage, (x0, y0): (i64, i64), (x1, y1): (i64, i64), dashed: bool) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let (mut x, mut y, mut err) = (x0, y0, dx + dy);
    let mut step = 0usize;

    loop {
        if !dashed || (step / DASH_ON) % 2 == 0 {
            put(canvas, x, y, LINE);
            put(canvas, x + 1, y, LINE);
            put(canvas, x, y + 1, LINE);
        }
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
        step += 1;
    }
}

fn draw_marker(canvas: &mut RgbImage, (x, y): (i64, i64)) {
    for ox in -2..=2 {
        for oy in -2..=2 {
            put(canvas, x + ox, y + oy, POINT);
        }
    }
}

#[async_trait]
impl FigureRenderer for SketchRenderer {
    fn name(&self) -> &'static str {
        "sketch"
    }

    async fn render_from_code(&self, code: &str, context: &RenderContext) -> RenderOutcome {
        debug!("[{}] 声明式渲染，描述长度 {} 字符", context.label, code.len());
        self.render_png(code).map(|png| encode_png_base64(&png)).into()
    }
}

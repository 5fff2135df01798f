//! In-memory canvas standing in for a real image editor.
//!
//! Owned by the mutation thread; nothing else touches it. The methods here are
//! the host's "native API": handlers and `execute` steps both call into it.

use pixbridge::HandlerError;
use serde::Deserialize;
use serde_json::{json, Value};

pub type Rgba = [u8; 4];

pub const WHITE: Rgba = [255, 255, 255, 255];
pub const BLACK: Rgba = [0, 0, 0, 255];
pub const TRANSPARENT: Rgba = [0, 0, 0, 0];

/// Largest canvas the host will allocate, in pixels per layer.
pub const MAX_PIXELS: usize = 8192 * 8192;

/// Parse `#rrggbb` or `#rrggbbaa`.
pub fn parse_color(text: &str) -> Result<Rgba, HandlerError> {
    let hex = text.trim().trim_start_matches('#');
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        return Err(HandlerError::invalid(format!(
            "color must be #rrggbb or #rrggbbaa, got '{}'",
            text
        )));
    }
    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| HandlerError::invalid(format!("invalid hex in color '{}'", text)))
    };
    let alpha = if hex.len() == 8 { channel(6)? } else { 255 };
    Ok([channel(0)?, channel(2)?, channel(4)?, alpha])
}

pub fn format_color(color: Rgba) -> String {
    format!("#{:02x}{:02x}{:02x}", color[0], color[1], color[2])
}

/// Rectangle in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Rect {
    #[serde(alias = "origin_x")]
    pub x: u32,
    #[serde(alias = "origin_y")]
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fill {
    #[default]
    Transparent,
    Foreground,
    Background,
    White,
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub visible: bool,
    /// Percent, 0 to 100.
    pub opacity: f64,
    pixels: Vec<Rgba>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    pub foreground: Rgba,
    pub background: Rgba,
    pub brush_size: f64,
    /// Percent, 0 to 100.
    pub opacity: f64,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            foreground: BLACK,
            background: WHITE,
            brush_size: 10.0,
            opacity: 100.0,
        }
    }
}

/// A rendered RGB image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl Rendered {
    /// Binary PPM (`P6`).
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.rgb);
        out
    }
}

#[derive(Debug, Clone)]
pub struct Canvas {
    pub name: String,
    width: u32,
    height: u32,
    /// Bottom to top.
    layers: Vec<Layer>,
    pub context: Context,
}

impl Canvas {
    /// New canvas with a single white "Background" layer.
    pub fn new(width: u32, height: u32) -> Result<Self, HandlerError> {
        let width = width.max(1);
        let height = height.max(1);
        let pixels = (width as usize)
            .checked_mul(height as usize)
            .filter(|&n| n <= MAX_PIXELS)
            .ok_or_else(|| {
                HandlerError::invalid(format!(
                    "a {}x{} canvas exceeds the {}-pixel limit",
                    width, height, MAX_PIXELS
                ))
            })?;
        Ok(Self {
            name: "Untitled".to_string(),
            width,
            height,
            layers: vec![Layer {
                name: "Background".to_string(),
                visible: true,
                opacity: 100.0,
                pixels: vec![WHITE; pixels],
            }],
            context: Context::default(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    fn layer_index(&self, name: &str) -> Result<usize, HandlerError> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| HandlerError::execution(format!("no layer named '{}'", name)))
    }

    /// Add a layer on top of the stack. Returns its index.
    pub fn create_layer(
        &mut self,
        name: &str,
        fill: Fill,
        opacity: f64,
    ) -> Result<usize, HandlerError> {
        if name.trim().is_empty() {
            return Err(HandlerError::invalid("layer name must not be empty"));
        }
        if self.layers.iter().any(|l| l.name == name) {
            return Err(HandlerError::execution(format!("layer '{}' already exists", name)));
        }
        if !(0.0..=100.0).contains(&opacity) {
            return Err(HandlerError::invalid("opacity must be between 0 and 100"));
        }

        let color = match fill {
            Fill::Transparent => TRANSPARENT,
            Fill::Foreground => self.context.foreground,
            Fill::Background => self.context.background,
            Fill::White => WHITE,
        };
        self.layers.push(Layer {
            name: name.to_string(),
            visible: true,
            opacity,
            pixels: vec![color; self.layers[0].pixels.len()],
        });
        Ok(self.layers.len() - 1)
    }

    fn check_rect(&self, rect: Rect) -> Result<(), HandlerError> {
        let fits = rect.width > 0
            && rect.height > 0
            && u64::from(rect.x) + u64::from(rect.width) <= u64::from(self.width)
            && u64::from(rect.y) + u64::from(rect.height) <= u64::from(self.height);
        if fits {
            Ok(())
        } else {
            Err(HandlerError::invalid(format!(
                "rectangle {}x{}+{}+{} does not fit the {}x{} canvas",
                rect.width, rect.height, rect.x, rect.y, self.width, self.height
            )))
        }
    }

    /// Paint a rectangle. Returns the number of pixels painted.
    pub fn fill_rect(&mut self, layer: &str, rect: Rect, color: Rgba) -> Result<u64, HandlerError> {
        self.check_rect(rect)?;
        let index = self.layer_index(layer)?;
        let width = self.width as usize;
        let pixels = &mut self.layers[index].pixels;

        for row in rect.y..rect.y + rect.height {
            let start = row as usize * width + rect.x as usize;
            pixels[start..start + rect.width as usize].fill(color);
        }
        Ok(u64::from(rect.width) * u64::from(rect.height))
    }

    pub fn clear_layer(&mut self, layer: &str) -> Result<(), HandlerError> {
        let index = self.layer_index(layer)?;
        self.layers[index].pixels.fill(TRANSPARENT);
        Ok(())
    }

    pub fn set_visible(&mut self, layer: &str, visible: bool) -> Result<(), HandlerError> {
        let index = self.layer_index(layer)?;
        self.layers[index].visible = visible;
        Ok(())
    }

    /// Merge all visible layers into one opaque "Background" layer.
    pub fn flatten(&mut self) -> usize {
        let merged = self.layers.len();
        let pixels = self
            .composite_pixels()
            .into_iter()
            .map(|[r, g, b]| [r, g, b, 255])
            .collect();
        self.layers = vec![Layer {
            name: "Background".to_string(),
            visible: true,
            opacity: 100.0,
            pixels,
        }];
        merged
    }

    /// Visible layers composited bottom to top over the background color.
    fn composite_pixels(&self) -> Vec<[u8; 3]> {
        let bg = self.context.background;
        let base = [f64::from(bg[0]), f64::from(bg[1]), f64::from(bg[2])];
        let mut out: Vec<[f64; 3]> = vec![base; self.layers[0].pixels.len()];

        for layer in self.layers.iter().filter(|l| l.visible && l.opacity > 0.0) {
            let layer_alpha = layer.opacity / 100.0;
            for (dst, src) in out.iter_mut().zip(&layer.pixels) {
                let alpha = f64::from(src[3]) / 255.0 * layer_alpha;
                if alpha == 0.0 {
                    continue;
                }
                for c in 0..3 {
                    dst[c] = f64::from(src[c]) * alpha + dst[c] * (1.0 - alpha);
                }
            }
        }

        out.into_iter()
            .map(|px| px.map(|c| c.round().clamp(0.0, 255.0) as u8))
            .collect()
    }

    /// Render the visible image, optionally cropped to `region` and scaled
    /// down (never up) to fit `max_width` x `max_height`, keeping aspect.
    pub fn render(
        &self,
        region: Option<Rect>,
        max_width: Option<u32>,
        max_height: Option<u32>,
    ) -> Result<Rendered, HandlerError> {
        let area = region.unwrap_or(Rect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        });
        self.check_rect(area)?;

        let full = self.composite_pixels();
        let (target_w, target_h) = fit(area.width, area.height, max_width, max_height);

        let mut rgb = Vec::with_capacity(target_w as usize * target_h as usize * 3);
        for ty in 0..target_h {
            let sy = area.y + scale_index(ty, area.height, target_h);
            for tx in 0..target_w {
                let sx = area.x + scale_index(tx, area.width, target_w);
                rgb.extend_from_slice(&full[sy as usize * self.width as usize + sx as usize]);
            }
        }

        Ok(Rendered {
            width: target_w,
            height: target_h,
            rgb,
        })
    }

    pub fn metadata(&self) -> Value {
        let layers: Vec<Value> = self
            .layers
            .iter()
            .enumerate()
            .map(|(position, layer)| {
                json!({
                    "name": layer.name,
                    "position": position,
                    "visible": layer.visible,
                    "opacity": layer.opacity,
                    "width": self.width,
                    "height": self.height,
                    "has_alpha": true,
                })
            })
            .collect();

        json!({
            "basic": {
                "name": self.name,
                "width": self.width,
                "height": self.height,
                "base_type": "RGB",
            },
            "structure": {
                "num_layers": layers.len(),
                "layers": layers,
            },
        })
    }

    pub fn context_state(&self) -> Value {
        let ctx = &self.context;
        json!({
            "foreground_color": format_color(ctx.foreground),
            "foreground_rgba": ctx.foreground,
            "background_color": format_color(ctx.background),
            "background_rgba": ctx.background,
            "brush_size": ctx.brush_size,
            "opacity": ctx.opacity,
        })
    }
}

/// Source offset for output pixel `index` when `source` pixels map onto `target`.
fn scale_index(index: u32, source: u32, target: u32) -> u32 {
    (u64::from(index) * u64::from(source) / u64::from(target)) as u32
}

/// Largest size within the limits that keeps the aspect ratio; never upscales.
fn fit(width: u32, height: u32, max_width: Option<u32>, max_height: Option<u32>) -> (u32, u32) {
    let scale_w = max_width.map_or(1.0, |m| f64::from(m) / f64::from(width));
    let scale_h = max_height.map_or(1.0, |m| f64::from(m) / f64::from(height));
    let scale = scale_w.min(scale_h).min(1.0);
    if scale >= 1.0 {
        return (width, height);
    }
    let scaled = |n: u32| ((f64::from(n) * scale).floor() as u32).max(1);
    (scaled(width), scaled(height))
}

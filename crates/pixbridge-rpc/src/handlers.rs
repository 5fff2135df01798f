//! Command handlers for the reference canvas host, one per operation.
//!
//! All of them run on the mutation thread with exclusive access to the
//! [`Canvas`].

use crate::canvas::{parse_color, Canvas, Fill, Rect};
use pixbridge::{HandlerError, HandlerRegistry, ImagePayload};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

/// Operations the reference host serves.
pub const OPERATIONS: &[&str] = &[
    "create_layer",
    "execute",
    "fill_rect",
    "get_context_state",
    "get_host_info",
    "get_image_bitmap",
    "get_image_metadata",
    "set_context",
];

fn parse<T: DeserializeOwned>(arguments: Map<String, Value>) -> Result<T, HandlerError> {
    Ok(serde_json::from_value(Value::Object(arguments))?)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BitmapArgs {
    max_width: Option<u32>,
    max_height: Option<u32>,
    region: Option<Rect>,
}

fn get_image_bitmap(
    canvas: &mut Canvas,
    arguments: Map<String, Value>,
) -> Result<Value, HandlerError> {
    let args: BitmapArgs = parse(arguments)?;
    let area = args.region.map_or((canvas.width(), canvas.height()), |r| (r.width, r.height));
    let rendered = canvas.render(args.region, args.max_width, args.max_height)?;
    debug!(
        "Rendered {}x{} from a {}x{} area",
        rendered.width, rendered.height, area.0, area.1
    );

    let payload = ImagePayload::new(
        &rendered.to_ppm(),
        "ppm",
        (rendered.width, rendered.height),
        area,
    );
    Ok(serde_json::to_value(payload)?)
}

fn get_host_info(
    canvas: &mut Canvas,
    arguments: Map<String, Value>,
) -> Result<Value, HandlerError> {
    parse::<Empty>(arguments)?;
    Ok(json!({
        "host": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "session": {
            "num_open_images": 1,
            "active_image": canvas.name,
        },
        "system": {
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "capabilities": {
            "length_prefix_framing": true,
            "persistent_connections": true,
            "operations": OPERATIONS,
        },
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Empty {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateLayerArgs {
    name: String,
    #[serde(default)]
    fill: Fill,
    #[serde(default = "full_opacity")]
    opacity: f64,
}

fn full_opacity() -> f64 {
    100.0
}

fn create_layer(canvas: &mut Canvas, arguments: Map<String, Value>) -> Result<Value, HandlerError> {
    let args: CreateLayerArgs = parse(arguments)?;
    let index = canvas.create_layer(&args.name, args.fill, args.opacity)?;
    Ok(json!({ "name": args.name, "position": index }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FillRectArgs {
    layer: String,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    /// Defaults to the context foreground.
    color: Option<String>,
}

fn fill_rect(canvas: &mut Canvas, arguments: Map<String, Value>) -> Result<Value, HandlerError> {
    let args: FillRectArgs = parse(arguments)?;
    let color = match &args.color {
        Some(text) => parse_color(text)?,
        None => canvas.context.foreground,
    };
    let rect = Rect {
        x: args.x,
        y: args.y,
        width: args.width,
        height: args.height,
    };
    let painted = canvas.fill_rect(&args.layer, rect, color)?;
    Ok(json!({ "layer": args.layer, "painted": painted }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetContextArgs {
    foreground: Option<String>,
    background: Option<String>,
    brush_size: Option<f64>,
    opacity: Option<f64>,
}

fn set_context(canvas: &mut Canvas, arguments: Map<String, Value>) -> Result<Value, HandlerError> {
    let args: SetContextArgs = parse(arguments)?;

    // Validate everything before touching the context.
    let foreground = args.foreground.as_deref().map(parse_color).transpose()?;
    let background = args.background.as_deref().map(parse_color).transpose()?;
    if let Some(size) = args.brush_size {
        if !(size > 0.0 && size.is_finite()) {
            return Err(HandlerError::invalid("brush_size must be positive"));
        }
    }
    if let Some(opacity) = args.opacity {
        if !(0.0..=100.0).contains(&opacity) {
            return Err(HandlerError::invalid("opacity must be between 0 and 100"));
        }
    }

    let ctx = &mut canvas.context;
    if let Some(color) = foreground {
        ctx.foreground = color;
    }
    if let Some(color) = background {
        ctx.background = color;
    }
    if let Some(size) = args.brush_size {
        ctx.brush_size = size;
    }
    if let Some(opacity) = args.opacity {
        ctx.opacity = opacity;
    }
    Ok(canvas.context_state())
}

#[derive(Debug, Deserialize)]
struct Step {
    operation: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct LayerArgs {
    layer: String,
}

#[derive(Debug, Deserialize)]
struct VisibilityArgs {
    layer: String,
    visible: bool,
}

/// Run one step against the canvas's native API.
///
/// Covers more than the registered handlers (`flatten`, `clear_layer`,
/// `set_visible`).
fn run_step(canvas: &mut Canvas, step: Step) -> Result<Value, HandlerError> {
    match step.operation.as_str() {
        "create_layer" => create_layer(canvas, step.arguments),
        "fill_rect" => fill_rect(canvas, step.arguments),
        "set_context" => set_context(canvas, step.arguments),
        "clear_layer" => {
            let args: LayerArgs = parse(step.arguments)?;
            canvas.clear_layer(&args.layer)?;
            Ok(json!({ "cleared": args.layer }))
        }
        "set_visible" => {
            let args: VisibilityArgs = parse(step.arguments)?;
            canvas.set_visible(&args.layer, args.visible)?;
            Ok(json!({ "layer": args.layer, "visible": args.visible }))
        }
        "flatten" => Ok(json!({ "merged": canvas.flatten() })),
        "get_image_metadata" => Ok(canvas.metadata()),
        "get_context_state" => Ok(canvas.context_state()),
        other => Err(HandlerError::execution(format!(
            "native API has no call named '{}'",
            other
        ))),
    }
}

/// Steps run in order; the first failure stops the run and earlier steps stay applied.
fn execute(canvas: &mut Canvas, mut arguments: Map<String, Value>) -> Result<Value, HandlerError> {
    let steps: Vec<Step> = match arguments.remove("steps") {
        Some(steps) => serde_json::from_value(steps)?,
        None => return Err(HandlerError::invalid("'steps' is required")),
    };

    let mut outputs = Vec::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        let operation = step.operation.clone();
        let output = run_step(canvas, step).map_err(|e| HandlerError {
            kind: e.kind,
            message: format!("step {} ('{}') failed: {}", index, operation, e.message),
        })?;
        outputs.push(output);
    }
    Ok(json!({ "steps": outputs }))
}

pub fn registry() -> HandlerRegistry<Canvas> {
    let mut registry = HandlerRegistry::new();
    registry
        .register("get_image_bitmap", get_image_bitmap)
        .register("get_image_metadata", |canvas: &mut Canvas, args| {
            parse::<Empty>(args)?;
            Ok(canvas.metadata())
        })
        .register("get_context_state", |canvas: &mut Canvas, args| {
            parse::<Empty>(args)?;
            Ok(canvas.context_state())
        })
        .register("get_host_info", get_host_info)
        .register("create_layer", create_layer)
        .register("fill_rect", fill_rect)
        .register("set_context", set_context)
        .register("execute", execute);
    registry
}

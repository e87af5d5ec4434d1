//! Pure coordinate-frame conversions between the display, content, page, and
//! normalized spaces.
//!
//! Contract for full-screen sessions: the captured frame covers the whole
//! display, so content coordinates are identical to display coordinates. The
//! page frame only exists for current-tab sessions.

use crate::error::{GazecapError, Result};
use crate::session::RecordingMode;
use serde::{Deserialize, Serialize};

/// A point in one of the spatial frames, in pixels unless noted otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Width/height of a display or viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub width: f64,
    pub height: f64,
}

impl Extent {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Position and extents of the browsing surface at a point in time.
///
/// `screen_x`/`screen_y` locate the surface's content origin on the display;
/// `scroll_x`/`scroll_y` are the surface's scroll offsets; `inner_*` is the
/// viewport extent and `outer_*` the window extent including chrome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceGeometry {
    pub screen_x: f64,
    pub screen_y: f64,
    #[serde(default)]
    pub scroll_x: f64,
    #[serde(default)]
    pub scroll_y: f64,
    pub inner_width: f64,
    pub inner_height: f64,
    #[serde(default)]
    pub outer_width: f64,
    #[serde(default)]
    pub outer_height: f64,
}

impl SurfaceGeometry {
    pub fn viewport(&self) -> Extent {
        Extent::new(self.inner_width, self.inner_height)
    }
}

/// Raw positional input as delivered by a gaze source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPosition {
    pub x: f64,
    pub y: f64,
    /// Set when `x`/`y` are pre-normalized to 0-1 instead of display pixels
    pub normalized: bool,
}

impl RawPosition {
    pub fn pixels(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            normalized: false,
        }
    }

    pub fn normalized(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            normalized: true,
        }
    }
}

/// Spatial reference data a transform runs against: the session's recording
/// mode, the display extent, and (for current-tab sessions) a surface
/// geometry snapshot.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub mode: RecordingMode,
    pub display: Option<Extent>,
    pub geometry: Option<&'a SurfaceGeometry>,
}

impl<'a> TransformContext<'a> {
    pub fn new(
        mode: RecordingMode,
        display: Option<Extent>,
        geometry: Option<&'a SurfaceGeometry>,
    ) -> Self {
        Self {
            mode,
            display,
            geometry,
        }
    }

    fn require_geometry(&self) -> Result<&'a SurfaceGeometry> {
        self.geometry.ok_or_else(|| {
            GazecapError::config("surface geometry is required for current-tab transforms")
        })
    }

    fn require_display(&self) -> Result<Extent> {
        self.display
            .ok_or_else(|| GazecapError::config("display extent is required for this transform"))
    }
}

/// All derived frames for one raw position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformedPoint {
    pub display: Point,
    pub content: Point,
    /// Only present for current-tab sessions
    pub page: Option<Point>,
    pub normalized: Point,
    pub within_bounds: bool,
}

/// Resolve a raw position to absolute display pixels.
///
/// Fails with a configuration error when the input is normalized but no
/// display extent was supplied.
pub fn to_display(raw: RawPosition, ctx: &TransformContext<'_>) -> Result<Point> {
    if raw.normalized {
        let display = ctx.display.ok_or_else(|| {
            GazecapError::config("normalized input requires display extents to scale by")
        })?;
        Ok(Point::new(raw.x * display.width, raw.y * display.height))
    } else {
        Ok(Point::new(raw.x, raw.y))
    }
}

/// Convert a raw position into the content frame of the captured video.
///
/// Full-screen: content equals display. Current-tab: content is display minus
/// the surface's position, and requires a geometry snapshot.
pub fn to_content(raw: RawPosition, ctx: &TransformContext<'_>) -> Result<Point> {
    let display = to_display(raw, ctx)?;
    match ctx.mode {
        RecordingMode::FullScreen => Ok(display),
        RecordingMode::CurrentTab => {
            let geometry = ctx.require_geometry()?;
            Ok(Point::new(
                display.x - geometry.screen_x,
                display.y - geometry.screen_y,
            ))
        }
    }
}

/// Convert a raw position into page coordinates (content plus scroll offsets).
///
/// The page frame is only defined for current-tab sessions; full-screen
/// returns `None`.
pub fn to_page(raw: RawPosition, ctx: &TransformContext<'_>) -> Result<Option<Point>> {
    match ctx.mode {
        RecordingMode::FullScreen => Ok(None),
        RecordingMode::CurrentTab => {
            let content = to_content(raw, ctx)?;
            let geometry = ctx.require_geometry()?;
            Ok(Some(Point::new(
                content.x + geometry.scroll_x,
                content.y + geometry.scroll_y,
            )))
        }
    }
}

/// Convert a raw position into the normalized 0-1 frame of the active
/// viewport (current-tab) or display (full-screen), clamped to [0, 1].
pub fn to_normalized(raw: RawPosition, ctx: &TransformContext<'_>) -> Result<Point> {
    let content = to_content(raw, ctx)?;
    let extent = match ctx.mode {
        RecordingMode::FullScreen => ctx.require_display()?,
        RecordingMode::CurrentTab => ctx.require_geometry()?.viewport(),
    };
    Ok(Point::new(
        clamp_unit(content.x / extent.width),
        clamp_unit(content.y / extent.height),
    ))
}

/// Whether the content-frame position falls inside the captured region.
/// Always true for full-screen sessions.
pub fn is_within_bounds(raw: RawPosition, ctx: &TransformContext<'_>) -> Result<bool> {
    match ctx.mode {
        RecordingMode::FullScreen => Ok(true),
        RecordingMode::CurrentTab => {
            let content = to_content(raw, ctx)?;
            let viewport = ctx.require_geometry()?.viewport();
            Ok(content.x >= 0.0
                && content.x <= viewport.width
                && content.y >= 0.0
                && content.y <= viewport.height)
        }
    }
}

/// Compute every derived frame plus the bounds flag in one pass. Applied once
/// per ingested sample and once per eye sub-record.
pub fn transform_all(raw: RawPosition, ctx: &TransformContext<'_>) -> Result<TransformedPoint> {
    let display = to_display(raw, ctx)?;
    let content = to_content(raw, ctx)?;
    let page = to_page(raw, ctx)?;
    let normalized = to_normalized(raw, ctx)?;
    let within_bounds = is_within_bounds(raw, ctx)?;

    Ok(TransformedPoint {
        display,
        content,
        page,
        normalized,
        within_bounds,
    })
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

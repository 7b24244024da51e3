//! Desktop automation — the abstraction over OS input and screen capture.
//!
//! Take-control sessions decide actions in image space (the coordinate
//! system of the capture the model saw) and remap them to native screen
//! space before calling the input primitives. The scale factors for that
//! remapping travel with each [`Capture`] and are re-derived from the
//! capture immediately preceding each action.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AutomationError;
use crate::message::ImageBlock;

/// A screen capture plus the geometry needed for coordinate remapping.
#[derive(Debug, Clone)]
pub struct Capture {
    /// The captured (possibly downscaled) image
    pub image: ImageBlock,

    /// Width of the image the model sees
    pub width: u32,

    /// Height of the image the model sees
    pub height: u32,

    /// Native screen width
    pub native_width: u32,

    /// Native screen height
    pub native_height: u32,

    /// Horizontal image-space → native-space scale factor
    pub scale_x: f64,

    /// Vertical image-space → native-space scale factor
    pub scale_y: f64,
}

impl Capture {
    /// Remap an image-space coordinate to native screen space using this
    /// capture's scale factors, clamped to the native bounds.
    pub fn to_native(&self, x: f64, y: f64) -> (i32, i32) {
        let nx = (x * self.scale_x).round();
        let ny = (y * self.scale_y).round();
        (
            nx.clamp(0.0, self.native_width.saturating_sub(1) as f64) as i32,
            ny.clamp(0.0, self.native_height.saturating_sub(1) as f64) as i32,
        )
    }
}

/// Pointer buttons for click actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerButton {
    Left,
    Right,
    Middle,
}

/// The kinds of physical action a take-control decision can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlActionKind {
    Click,
    DoubleClick,
    RightClick,
    MoveMouse,
    Type,
    Key,
    Scroll,
    /// No-op: just take a fresh capture (short settle delay).
    Screenshot,
    Wait,
}

/// One desktop action as the model requested it, in image space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlAction {
    /// What to do
    pub kind: ControlActionKind,

    /// Image-space coordinate, where the kind needs one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinate: Option<(f64, f64)>,

    /// Text payload for Type/Key actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Duration for Wait actions, milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Scroll deltas for Scroll actions (positive = down/right)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll: Option<(i32, i32)>,
}

impl ControlAction {
    /// Short human-readable description for logs and observers.
    pub fn describe(&self) -> String {
        let at = self
            .coordinate
            .map(|(x, y)| format!(" at ({x:.0}, {y:.0})"))
            .unwrap_or_default();
        match self.kind {
            ControlActionKind::Type => {
                format!("type {:?}", self.text.as_deref().unwrap_or(""))
            }
            ControlActionKind::Key => {
                format!("press {}", self.text.as_deref().unwrap_or("?"))
            }
            ControlActionKind::Wait => {
                format!("wait {}ms", self.duration_ms.unwrap_or(0))
            }
            ControlActionKind::Scroll => {
                let (dx, dy) = self.scroll.unwrap_or((0, 0));
                format!("scroll ({dx}, {dy}){at}")
            }
            kind => format!("{kind:?}{at}").to_lowercase(),
        }
    }
}

/// One step of a structured take-control decision.
#[derive(Debug, Clone)]
pub enum ControlStep {
    /// Narration for the user; appended to the session log.
    Note(String),

    /// A physical action to execute.
    Act(ControlAction),
}

/// The desktop-automation collaborator contract.
///
/// All coordinates here are **native** screen space; remapping from image
/// space is the session engine's job.
#[async_trait]
pub trait DesktopAutomation: Send + Sync {
    /// Capture the screen.
    async fn capture(&self) -> Result<Capture, AutomationError>;

    /// Move the pointer.
    async fn move_pointer(&self, x: i32, y: i32) -> Result<(), AutomationError>;

    /// Click at a position.
    async fn click(&self, x: i32, y: i32, button: PointerButton) -> Result<(), AutomationError>;

    /// Double-click at a position.
    async fn double_click(&self, x: i32, y: i32) -> Result<(), AutomationError>;

    /// Type literal text.
    async fn type_text(&self, text: &str) -> Result<(), AutomationError>;

    /// Press a key or key combination (e.g. "Return", "ctrl+c").
    async fn press_key(&self, key: &str) -> Result<(), AutomationError>;

    /// Scroll at a position by the given deltas.
    async fn scroll(&self, x: i32, y: i32, dx: i32, dy: i32) -> Result<(), AutomationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(w: u32, h: u32, nw: u32, nh: u32) -> Capture {
        Capture {
            image: ImageBlock::from_bytes("image/png", &[0], w, h),
            width: w,
            height: h,
            native_width: nw,
            native_height: nh,
            scale_x: nw as f64 / w as f64,
            scale_y: nh as f64 / h as f64,
        }
    }

    #[test]
    fn remap_scales_to_native() {
        let cap = capture(1280, 800, 2560, 1600);
        assert_eq!(cap.to_native(640.0, 400.0), (1280, 800));
    }

    #[test]
    fn remap_clamps_to_bounds() {
        let cap = capture(1280, 800, 2560, 1600);
        assert_eq!(cap.to_native(99999.0, -50.0), (2559, 0));
    }

    #[test]
    fn action_describe_is_readable() {
        let action = ControlAction {
            kind: ControlActionKind::Click,
            coordinate: Some((412.0, 300.0)),
            text: None,
            duration_ms: None,
            scroll: None,
        };
        assert_eq!(action.describe(), "click at (412, 300)");

        let typed = ControlAction {
            kind: ControlActionKind::Type,
            coordinate: None,
            text: Some("hello".into()),
            duration_ms: None,
            scroll: None,
        };
        assert!(typed.describe().contains("hello"));
    }
}

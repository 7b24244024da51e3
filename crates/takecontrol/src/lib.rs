//! Take-control session engine — driving the desktop from model decisions.
//!
//! A take-control session alternates screen capture, a model decision step,
//! coordinate remapping from image space to native screen space, physical
//! input execution, and a settle delay before the next capture:
//!
//! ```text
//! CAPTURE → DECIDE → (no action) → DONE
//! CAPTURE → DECIDE → EXECUTE → SETTLE → CAPTURE → …
//! ```
//!
//! Two decision protocols exist, selected by model capability: the
//! structured-action protocol (the client returns typed action steps) and a
//! vision fallback (the client answers a strict single-action prompt in
//! plain text). A hard action budget bounds every session; image history is
//! pruned before each decision so the conversation stays payable.

pub mod prune;
pub mod session;
pub mod vision;

pub use prune::{PRUNED_PLACEHOLDER, prune_images};
pub use session::{SessionEnd, SessionOptions, SessionOutcome, TakeControlEngine};
pub use vision::VisionCommand;

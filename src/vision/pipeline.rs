//! Detection pipeline seam.
//!
//! The pipeline is a black box to the runtime: it consumes a frame plus
//! options, and the newest result is read back separately, matching the
//! process-then-fetch shape of the underlying vision engines.

use anyhow::bail;

use crate::detect::{Detection, Roi};
use crate::vision::camera::Frame;

/// Per-invocation processing options.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Restrict inference to this region when set.
    pub roi: Option<Roi>,
    pub return_overlay: bool,
}

pub trait Pipeline: Send + Sync {
    fn process(&self, frame: &Frame, opts: &ProcessOptions) -> anyhow::Result<()>;

    /// Result of the most recent successful `process` call.
    fn last_result(&self) -> Option<Detection>;

    /// Runtime-tunable processing parameters (`blur`, `edges`, `contours`,
    /// `ref_size`). Unsupported keys are ignored.
    fn set_processing(&self, _params: serde_json::Value) {}

    fn load_profile(&self, which: &str, _path: &str) -> anyhow::Result<()> {
        bail!("pipeline has no profile support (requested {which:?})")
    }

    fn set_dynamic(&self, which: &str, _params: &serde_json::Value) -> anyhow::Result<()> {
        bail!("pipeline has no dynamic tuning (requested {which:?})")
    }
}

/// Pipeline that never detects anything; the stand-in when no vision model
/// is installed.
#[derive(Debug, Default)]
pub struct NullPipeline {
    pub frame_space: (f32, f32),
}

impl Pipeline for NullPipeline {
    fn process(&self, _frame: &Frame, _opts: &ProcessOptions) -> anyhow::Result<()> {
        Ok(())
    }

    fn last_result(&self) -> Option<Detection> {
        Some(Detection::miss(self.frame_space))
    }
}

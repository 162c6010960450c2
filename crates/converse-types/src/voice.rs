//! Voice options for speech synthesis.
//!
//! A `VoiceOptions` value selects the synthesis voice and the relative rate
//! and volume adjustments, expressed the way the synthesis engine expects
//! them (`+10%`, `-5%`).

use serde::{Deserialize, Serialize};

/// Default synthesis voice (Mandarin, female).
pub const DEFAULT_VOICE: &str = "zh-CN-XiaoxiaoNeural";

/// Neutral rate/volume adjustment.
pub const NEUTRAL_ADJUSTMENT: &str = "+0%";

/// Synthesis parameters for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceOptions {
    /// Voice identifier understood by the synthesis engine.
    pub voice: String,
    /// Speaking rate adjustment, e.g. `+10%`.
    #[serde(default = "neutral")]
    pub rate: String,
    /// Volume adjustment, e.g. `-5%`.
    #[serde(default = "neutral")]
    pub volume: String,
}

fn neutral() -> String {
    NEUTRAL_ADJUSTMENT.to_string()
}

impl VoiceOptions {
    /// Options for `voice` with neutral rate and volume.
    pub fn with_voice(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            ..Self::default()
        }
    }
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_string(),
            rate: neutral(),
            volume: neutral(),
        }
    }
}

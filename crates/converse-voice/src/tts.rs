use crate::error::VoiceError;
use crate::SpeechSynthesizer;
use async_trait::async_trait;
use converse_types::VoiceOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Timeout for TTS process execution.
const TTS_TIMEOUT: Duration = Duration::from_secs(60);

/// Synthesizer that shells out to the `edge-tts` command line tool.
#[derive(Debug, Clone)]
pub struct EdgeTtsSynthesizer {
    binary: PathBuf,
}

impl EdgeTtsSynthesizer {
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
        }
    }
}

impl Default for EdgeTtsSynthesizer {
    fn default() -> Self {
        Self::new("edge-tts")
    }
}

/// Checks a relative adjustment of the form `+10%` / `-5%`.
fn is_valid_adjustment(value: &str) -> bool {
    let Some(rest) = value.strip_prefix(['+', '-']) else {
        return false;
    };
    let Some(digits) = rest.strip_suffix('%') else {
        return false;
    };
    !digits.is_empty() && digits.len() <= 3 && digits.bytes().all(|b| b.is_ascii_digit())
}

pub(crate) fn validate_request(text: &str, options: &VoiceOptions) -> Result<(), VoiceError> {
    if text.trim().is_empty() {
        return Err(VoiceError::Synthesis("text is empty".to_string()));
    }
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::Synthesis(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    if options.voice.trim().is_empty() {
        return Err(VoiceError::Synthesis("voice is empty".to_string()));
    }
    for (name, value) in [("rate", &options.rate), ("volume", &options.volume)] {
        if !is_valid_adjustment(value) {
            return Err(VoiceError::Synthesis(format!(
                "{} must look like +N% or -N%, got {:?}",
                name, value
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl SpeechSynthesizer for EdgeTtsSynthesizer {
    async fn synthesize(&self, text: &str, options: &VoiceOptions) -> Result<Vec<u8>, VoiceError> {
        validate_request(text, options)?;

        // Removed on drop, so every early return below cleans up.
        let media = tempfile::Builder::new()
            .prefix("converse-tts-")
            .suffix(".mp3")
            .tempfile()
            .map_err(|e| VoiceError::Synthesis(format!("Failed to create temp file: {}", e)))?;

        let mut command = Command::new(&self.binary);
        command
            .arg(format!("--voice={}", options.voice))
            .arg(format!("--rate={}", options.rate))
            .arg(format!("--volume={}", options.volume))
            .arg(format!("--text={}", text))
            .arg("--write-media")
            .arg(media.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| VoiceError::Synthesis(format!("Failed to spawn edge-tts: {}", e)))?;

        let output = tokio::time::timeout(TTS_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Synthesis(format!(
                    "TTS process timed out after {} seconds",
                    TTS_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Synthesis(format!("Failed to wait for edge-tts: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Synthesis(format!("edge-tts failed: {}", stderr.trim())));
        }

        let audio = tokio::fs::read(media.path())
            .await
            .map_err(|e| VoiceError::Synthesis(format!("Failed to read synthesized audio: {}", e)))?;
        if audio.is_empty() {
            return Err(VoiceError::Synthesis("edge-tts produced no audio".to_string()));
        }
        tracing::debug!(bytes = audio.len(), voice = %options.voice, "synthesized speech");
        Ok(audio)
    }
}

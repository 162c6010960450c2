use crate::error::VoiceError;
use crate::Transcriber;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum audio input size for STT (10 MiB). Prevents OOM from oversized payloads.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Timeout for STT process execution.
const STT_TIMEOUT: Duration = Duration::from_secs(120);

/// Transcriber that pipes audio into a whisper.cpp style binary and reads
/// the transcript from stdout.
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    model_path: PathBuf,
    binary_path: PathBuf,
}

impl WhisperTranscriber {
    pub fn new(model_path: impl Into<PathBuf>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            binary_path: binary_path.into(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String, VoiceError> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        if audio.len() > MAX_STT_INPUT_BYTES {
            return Err(VoiceError::Transcription(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                audio.len(),
                MAX_STT_INPUT_BYTES
            )));
        }
        if self.model_path.as_os_str().is_empty() {
            return Err(VoiceError::Config("no transcription model configured".to_string()));
        }

        // -m model, -l language, -nt no timestamps, -f - read from stdin.
        let mut command = Command::new(&self.binary_path);
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-l")
            .arg(language)
            .arg("-nt")
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            VoiceError::Transcription(format!("Failed to spawn STT binary: {}", e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Transcription("Failed to open stdin".to_string()))?;
        let audio_owned = audio.to_vec();

        // Written from a task so a full stdout pipe cannot deadlock the write.
        let write_task = tokio::spawn(async move {
            stdin.write_all(&audio_owned).await?;
            stdin.shutdown().await
        });

        let output = tokio::time::timeout(STT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Transcription(format!(
                    "STT process timed out after {} seconds",
                    STT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Transcription(format!("Failed to read stdout: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Transcription(format!(
                "STT binary failed: {}",
                stderr.trim()
            )));
        }

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Transcription(format!(
                    "Failed to write to STT stdin: {}",
                    e
                )))
            }
            Err(e) => {
                return Err(VoiceError::Transcription(format!("Stdin task failed: {}", e)))
            }
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

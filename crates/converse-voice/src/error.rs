use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("invalid voice configuration: {0}")]
    Config(String),
}

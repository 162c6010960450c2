use converse_types::VoiceOptions;
use converse_voice::{EdgeTtsSynthesizer, SpeechSynthesizer, VoiceError};

#[tokio::test]
async fn test_tts_rejects_blank_text() {
    let synth = EdgeTtsSynthesizer::new("edge-tts");
    for text in ["", "   ", "\n\t"] {
        let result = synth.synthesize(text, &VoiceOptions::default()).await;
        match result {
            Err(VoiceError::Synthesis(msg)) => assert!(msg.contains("empty"), "got: {}", msg),
            _ => panic!("Expected Synthesis error for blank text, got {:?}", result),
        }
    }
}

#[tokio::test]
async fn test_tts_rejects_oversized_text() {
    let synth = EdgeTtsSynthesizer::new("edge-tts");
    let text = "字".repeat(30 * 1024);
    let result = synth.synthesize(&text, &VoiceOptions::default()).await;
    match result {
        Err(VoiceError::Synthesis(msg)) => assert!(msg.contains("maximum size"), "got: {}", msg),
        _ => panic!("Expected Synthesis error about size, got {:?}", result),
    }
}

#[tokio::test]
async fn test_tts_rejects_malformed_rate() {
    let synth = EdgeTtsSynthesizer::new("edge-tts");
    let options = VoiceOptions {
        rate: "fast".to_string(),
        ..VoiceOptions::default()
    };
    let result = synth.synthesize("你好", &options).await;
    match result {
        Err(VoiceError::Synthesis(msg)) => assert!(msg.contains("rate"), "got: {}", msg),
        _ => panic!("Expected Synthesis error about rate, got {:?}", result),
    }
}

#[tokio::test]
async fn test_tts_missing_binary() {
    let synth = EdgeTtsSynthesizer::new("/nonexistent/edge-tts");
    let result = synth.synthesize("你好", &VoiceOptions::default()).await;
    match result {
        Err(VoiceError::Synthesis(msg)) => assert!(msg.contains("spawn"), "got: {}", msg),
        _ => panic!("Expected spawn failure, got {:?}", result),
    }
}

#[cfg(unix)]
mod with_fake_binary {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_tts_reads_back_written_media() {
        let dir = tempfile::tempdir().unwrap();
        // Writes its arguments into the media file so the test can check them.
        let script = write_script(
            dir.path(),
            "fake-edge-tts",
            r#"out=""
args=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--write-media" ]; then out="$2"; shift; else args="$args $1"; fi
  shift
done
printf '%s' "$args" > "$out""#,
        );

        let synth = EdgeTtsSynthesizer::new(&script);
        let audio = synth
            .synthesize("床前明月光", &VoiceOptions::with_voice("zh-CN-YunxiNeural"))
            .await
            .unwrap();
        let args = String::from_utf8(audio).unwrap();
        assert!(args.contains("--voice=zh-CN-YunxiNeural"));
        assert!(args.contains("--rate=+0%"));
        assert!(args.contains("--text=床前明月光"));
    }

    #[tokio::test]
    async fn test_tts_empty_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "silent-edge-tts", "exit 0");

        let result = EdgeTtsSynthesizer::new(&script)
            .synthesize("你好", &VoiceOptions::default())
            .await;
        match result {
            Err(VoiceError::Synthesis(msg)) => assert!(msg.contains("no audio"), "got: {}", msg),
            _ => panic!("Expected Synthesis error for empty output, got {:?}", result),
        }
    }

    #[tokio::test]
    async fn test_tts_nonzero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "failing-edge-tts", "echo 'no network' >&2; exit 3");

        let result = EdgeTtsSynthesizer::new(&script)
            .synthesize("你好", &VoiceOptions::default())
            .await;
        match result {
            Err(VoiceError::Synthesis(msg)) => assert!(msg.contains("no network"), "got: {}", msg),
            _ => panic!("Expected Synthesis error, got {:?}", result),
        }
    }
}

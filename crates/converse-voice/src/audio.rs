//! Audio payload encodings used on the wire.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Decodes one inbound audio fragment. Accepts bare base64 or a base64
/// `data:` URL, whose prefix up to the first comma is stripped.
pub fn decode_fragment(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match encoded.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
        None => encoded,
    };
    STANDARD.decode(payload.trim())
}

/// Encodes MP3 bytes as a `data:audio/mp3;base64,` URL.
pub fn mp3_data_url(audio: &[u8]) -> String {
    format!("data:audio/mp3;base64,{}", STANDARD.encode(audio))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_prefix_is_stripped() {
        assert_eq!(decode_fragment("data:audio/webm;base64,AAEC").unwrap(), vec![0, 1, 2]);
        assert_eq!(decode_fragment("AAEC").unwrap(), vec![0, 1, 2]);
        assert!(decode_fragment("data:audio/webm;base64,***").is_err());
    }

    #[test]
    fn mp3_url_shape() {
        assert_eq!(mp3_data_url(&[0, 1, 2]), "data:audio/mp3;base64,AAEC");
    }
}

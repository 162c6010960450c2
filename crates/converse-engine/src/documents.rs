//! Plain-text document loading and splitting.

use crate::error::EngineError;
use crate::knowledge::Chunk;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Extensions read as UTF-8 text. Other uploads are kept on disk but not
/// indexed.
const TEXT_EXTENSIONS: &[&str] = &["txt", "md"];

/// Characters a chunk prefers to end on.
const BOUNDARIES: &[char] = &['\n', '。', '！', '？', '.', '!', '?', '；', ';'];

/// One loaded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub content: String,
    /// File name, without directories.
    pub source: String,
}

/// Reads every text document directly inside `dir`, sorted by file name.
/// A missing directory yields no documents. Files that are not valid UTF-8
/// are skipped with a warning.
pub fn load_documents(dir: &Path) -> Result<Vec<Document>, EngineError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::Knowledge(e.to_string())),
    };

    let mut documents = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| EngineError::Knowledge(e.to_string()))?.path();
        let is_text = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_text || !path.is_file() {
            continue;
        }
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match fs::read_to_string(&path) {
            Ok(content) => documents.push(Document { content, source }),
            Err(e) => tracing::warn!(file = %source, "skipping unreadable document: {}", e),
        }
    }
    documents.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(documents)
}

/// Splits documents into overlapping character windows of at most
/// `chunk_size` characters. A window is shortened to end on a paragraph or
/// sentence boundary when one falls in its second half.
pub fn split_documents(documents: &[Document], chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);
    let mut chunks = Vec::new();

    for doc in documents {
        let chars: Vec<char> = doc.content.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let mut end = (start + chunk_size).min(chars.len());
            if end < chars.len() {
                let floor = start + chunk_size / 2;
                if let Some(pos) = (floor..end).rev().find(|&i| BOUNDARIES.contains(&chars[i])) {
                    end = pos + 1;
                }
            }

            let text: String = chars[start..end].iter().collect();
            let text = text.trim();
            if !text.is_empty() {
                chunks.push(Chunk {
                    text: text.to_string(),
                    source: doc.source.clone(),
                });
            }

            if end == chars.len() {
                break;
            }
            start = end.saturating_sub(overlap).max(start + 1);
        }
    }
    chunks
}

//! Lexical knowledge index.
//!
//! Chunks are indexed as sparse TF-IDF term vectors and ranked by cosine
//! similarity. Latin text contributes lowercase alphanumeric words; CJK text
//! contributes character unigrams and bigrams, which is enough to match
//! Chinese phrases without a segmenter.
//!
//! Indexes are persisted per agent as `<root>/<agent_id>/index.json`.

use crate::documents::{load_documents, split_documents};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "index.json";

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 500;
/// Default overlap between consecutive chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// A passage of source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// File name the passage was taken from.
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedChunk {
    chunk: Chunk,
    weights: BTreeMap<String, f32>,
    norm: f32,
}

/// Searchable set of chunks. An empty index is valid and answers every
/// query with no passages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeIndex {
    idf: BTreeMap<String, f32>,
    entries: Vec<IndexedChunk>,
}

impl KnowledgeIndex {
    /// The placeholder index for agents without documents.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(chunks: Vec<Chunk>) -> Self {
        let term_counts: Vec<HashMap<String, u32>> =
            chunks.iter().map(|c| term_frequencies(&c.text)).collect();

        let mut doc_freq: HashMap<&str, u32> = HashMap::new();
        for counts in &term_counts {
            for term in counts.keys() {
                *doc_freq.entry(term.as_str()).or_default() += 1;
            }
        }
        let n = chunks.len() as f32;
        let idf: BTreeMap<String, f32> = doc_freq
            .into_iter()
            .map(|(term, df)| (term.to_string(), ((n + 1.0) / (df as f32 + 1.0)).ln() + 1.0))
            .collect();

        let entries = chunks
            .into_iter()
            .zip(term_counts.iter())
            .map(|(chunk, counts)| {
                let weights = weigh(counts, &idf);
                let norm = norm(&weights);
                IndexedChunk {
                    chunk,
                    weights,
                    norm,
                }
            })
            .collect();

        Self { idf, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns up to `k` chunks most similar to `query`, best first. Chunks
    /// sharing no term with the query are never returned.
    pub fn search(&self, query: &str, k: usize) -> Vec<&Chunk> {
        if k == 0 || self.entries.is_empty() {
            return Vec::new();
        }
        let query_weights = weigh(&term_frequencies(query), &self.idf);
        let query_norm = norm(&query_weights);
        if query_norm == 0.0 {
            return Vec::new();
        }

        let mut scored: Vec<(f32, &IndexedChunk)> = self
            .entries
            .iter()
            .filter(|entry| entry.norm > 0.0)
            .filter_map(|entry| {
                let dot: f32 = query_weights
                    .iter()
                    .filter_map(|(term, w)| entry.weights.get(term).map(|v| v * w))
                    .sum();
                (dot > 0.0).then(|| (dot / (entry.norm * query_norm), entry))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(k)
            .map(|(_, entry)| &entry.chunk)
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Knowledge(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| EngineError::Knowledge(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let contents =
            serde_json::to_string(self).map_err(|e| EngineError::Knowledge(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::Knowledge(e.to_string()))?;
        }
        fs::write(path, contents)
            .map_err(|e| EngineError::Knowledge(format!("{}: {}", path.display(), e)))
    }
}

/// Per-agent index storage rooted at the `vector_stores` directory.
///
/// All methods do blocking file IO; async callers should go through
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct KnowledgeLibrary {
    root: PathBuf,
}

impl KnowledgeLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn index_path(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id).join(INDEX_FILE)
    }

    /// Loads the agent's index, or the empty index when none was built.
    /// A present but unreadable index is a binding error: silently
    /// answering without the agent's documents would be worse.
    pub fn load_or_empty(&self, agent_id: &str) -> Result<KnowledgeIndex, EngineError> {
        let path = self.index_path(agent_id);
        if !path.exists() {
            return Ok(KnowledgeIndex::empty());
        }
        KnowledgeIndex::load(&path).map_err(|e| EngineError::Binding(e.to_string()))
    }

    /// Builds and saves the agent's index from the documents in `dir`.
    /// Returns the number of indexed chunks; nothing is written when the
    /// documents yield no chunks.
    pub fn build_from_uploads(&self, agent_id: &str, dir: &Path) -> Result<usize, EngineError> {
        let documents = load_documents(dir)?;
        let chunks = split_documents(&documents, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP);
        if chunks.is_empty() {
            tracing::info!(agent_id, "no indexable text in uploaded documents");
            return Ok(0);
        }
        let index = KnowledgeIndex::build(chunks);
        index.save(&self.index_path(agent_id))?;
        tracing::info!(agent_id, chunks = index.len(), "knowledge index built");
        Ok(index.len())
    }

    /// Deletes the agent's index directory. Missing directories are fine.
    pub fn remove(&self, agent_id: &str) -> Result<(), EngineError> {
        match fs::remove_dir_all(self.root.join(agent_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Knowledge(e.to_string())),
        }
    }
}

fn weigh(counts: &HashMap<String, u32>, idf: &BTreeMap<String, f32>) -> BTreeMap<String, f32> {
    counts
        .iter()
        .filter_map(|(term, &tf)| idf.get(term).map(|w| (term.clone(), tf as f32 * w)))
        .collect()
}

fn norm(weights: &BTreeMap<String, f32>) -> f32 {
    weights.values().map(|w| w * w).sum::<f32>().sqrt()
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}'
        | '\u{20000}'..='\u{2A6DF}')
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut prev_cjk: Option<char> = None;

    for c in text.chars() {
        if is_cjk(c) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            tokens.push(c.to_string());
            if let Some(prev) = prev_cjk {
                tokens.push(format!("{prev}{c}"));
            }
            prev_cjk = Some(c);
            continue;
        }
        prev_cjk = None;
        if c.is_alphanumeric() {
            word.extend(c.to_lowercase());
        } else if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

fn term_frequencies(text: &str) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_default() += 1;
    }
    counts
}

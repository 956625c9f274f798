use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingOptions {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 100,
        }
    }
}

const PLAIN_TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst", "csv", "json", "log", "html", "xml", "yaml", "yml", "toml"];

/// Reads the text content of an uploaded file.
///
/// PDF files go through `pdftotext`; when that binary is missing the caller
/// gets [`EngineError::MissingCapability`] instead of a generic failure.
pub async fn extract_text(path: &Path) -> Result<String, EngineError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => extract_pdf(path).await,
        e if e.is_empty() || PLAIN_TEXT_EXTENSIONS.contains(&e) => {
            let bytes = tokio::fs::read(path).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        other => Err(EngineError::Generation(format!("unsupported file type: .{other}"))),
    }
}

async fn extract_pdf(path: &Path) -> Result<String, EngineError> {
    let output = tokio::process::Command::new("pdftotext")
        .arg("-layout")
        .arg(path)
        .arg("-")
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => Ok(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => Err(EngineError::Generation(format!(
            "pdftotext failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::MissingCapability {
            capability: "PDF text extraction".into(),
            hint: "install poppler-utils (pdftotext) to process PDF files".into(),
        }),
        Err(e) => Err(EngineError::Io(e)),
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

const BREAKS: &[&str] = &["\n\n", "\n", ". ", "? ", "! ", " "];

// Prefer paragraph, then line, sentence and word breaks in the back half of the window.
fn find_break(text: &str, start: usize, hard_end: usize, size: usize) -> usize {
    let window = &text[start..hard_end];
    let min = size / 2;
    for sep in BREAKS {
        if let Some(pos) = window.rfind(sep) {
            if pos >= min && pos > 0 {
                return start + pos + sep.len();
            }
        }
    }
    hard_end
}

/// Splits `text` into overlapping chunks of roughly `chunk_size` bytes.
pub fn split_text(text: &str, opts: &ChunkingOptions) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let size = opts.chunk_size.max(1);
    let overlap = opts.overlap.min(size / 2);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut hard_end = floor_char_boundary(text, start + size);
        if hard_end <= start {
            hard_end = ceil_char_boundary(text, start + 1);
        }
        let end = if hard_end >= text.len() {
            text.len()
        } else {
            find_break(text, start, hard_end, size)
        };
        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        if end >= text.len() {
            break;
        }
        let mut next = floor_char_boundary(text, end.saturating_sub(overlap));
        if let Some(ws) = text[next..end].find(char::is_whitespace) {
            next += ws;
        }
        if next <= start {
            next = end;
        }
        start = next;
    }
    chunks
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexedChunk {
    pub source: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub source: String,
    pub text: String,
    pub score: f32,
}

/// Similarity index over one conversation's uploaded files.
pub struct RetrievalStore {
    chunks: Vec<IndexedChunk>,
    scratch: Option<TempDir>,
}

impl RetrievalStore {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            chunks: Vec::new(),
            scratch: None,
        }
    }

    /// Store that also spills chunk text into a scratch directory removed on release.
    pub fn scratch() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("parley-index-").tempdir()?;
        Ok(Self {
            chunks: Vec::new(),
            scratch: Some(dir),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[cfg(test)]
    pub fn scratch_path(&self) -> Option<std::path::PathBuf> {
        self.scratch.as_ref().map(|d| d.path().to_path_buf())
    }

    pub fn sources(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in &self.chunks {
            if !out.contains(&c.source) {
                out.push(c.source.clone());
            }
        }
        out
    }

    pub fn add(&mut self, source: &str, texts: Vec<String>, embeddings: Vec<Vec<f32>>) -> std::io::Result<usize> {
        let added: Vec<IndexedChunk> = texts
            .into_iter()
            .zip(embeddings)
            .map(|(text, embedding)| IndexedChunk {
                source: source.to_string(),
                text,
                embedding,
            })
            .collect();
        if let Some(dir) = &self.scratch {
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.path().join("chunks.jsonl"))?;
            for c in &added {
                serde_json::to_writer(&mut f, c)?;
                f.write_all(b"\n")?;
            }
        }
        let n = added.len();
        self.chunks.extend(added);
        debug!(source, chunks = n, total = self.chunks.len(), "indexed file chunks");
        Ok(n)
    }

    pub fn query(&self, embedding: &[f32], k: usize) -> Vec<RetrievedChunk> {
        let mut scored: Vec<RetrievedChunk> = self
            .chunks
            .iter()
            .map(|c| RetrievedChunk {
                source: c.source.clone(),
                text: c.text.clone(),
                score: cosine_similarity(embedding, &c.embedding),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Drops the index and removes any scratch directory.
    pub fn release(mut self) {
        self.chunks.clear();
        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "failed to remove retrieval scratch dir");
            }
        }
    }
}

/// Model-facing prompt for a user turn augmented with retrieved snippets.
pub fn augment_prompt(message: &str, hits: &[RetrievedChunk]) -> String {
    if hits.is_empty() {
        return message.to_string();
    }
    let mut out = String::from("Relevant context from the uploaded files:\n\n");
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!("[{}] (source: {})\n{}\n\n", i + 1, hit.source, hit.text));
    }
    out.push_str("Use the context above when it helps, and cite the source file names you rely on.\n\n");
    out.push_str("Question: ");
    out.push_str(message);
    out
}

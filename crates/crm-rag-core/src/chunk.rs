//! Recursive separator-based text chunker with boundary overlap.
//!
//! Splits content into [`DocumentChunk`]s sized for embedding and for the
//! generation context window.
//!
//! # Algorithm
//!
//! 1. Normalize line endings, collapse horizontal whitespace runs, collapse
//!    three or more newlines to two, trim.
//! 2. If the whole text fits in `chunk_size` tokens, return it as one chunk.
//! 3. Otherwise split on the coarsest separator that actually splits the
//!    text, accumulate parts until the next one would overflow `chunk_size`,
//!    and recurse into any single part that is itself too large using the
//!    remaining, finer separators.
//! 4. Fold an undersized trailing remainder into the previous chunk when the
//!    merge stays within `max_chunk_size`.
//! 5. Inject overlap: prepend the tail of the previous chunk and append the
//!    head of the next one, separated by [`OVERLAP_MARKER`]. Each side is
//!    capped so the final chunk never exceeds `max_chunk_size`.
//! 6. Drop chunks whose final token count falls outside
//!    `[min_chunk_size, max_chunk_size]`; a sole chunk always survives.
//!
//! Token counts use [`TokenEstimator::CHUNKER`] (3.5 chars per token).
//!
//! # Example
//!
//! ```rust
//! use crm_rag_core::chunk::{Chunker, ChunkConfig};
//!
//! let chunker = Chunker::new(ChunkConfig::default()).unwrap();
//! let chunks = chunker.chunk("Hello world.\n\nSecond paragraph.").unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::RagError;
use crate::models::{DocumentChunk, Metadata};
use crate::tokens::TokenEstimator;

/// Separates borrowed boundary text from a chunk's own content.
pub const OVERLAP_MARKER: &str = " [...] ";

/// Words of overlap per token of `chunk_overlap`.
const WORDS_PER_OVERLAP_TOKEN: f64 = 0.75;

/// Chunker settings. All fields have defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Target tokens per chunk.
    pub chunk_size: usize,
    /// Target tokens shared with each neighbour.
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Ordered coarsest first.
    pub separators: Vec<String>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 100,
            max_chunk_size: 1500,
            separators: default_separators(),
        }
    }
}

impl ChunkConfig {
    /// Smaller defaults used for structured product records.
    pub fn for_products() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 100,
            ..Self::default()
        }
    }

    /// Apply optional `chunk_size` / `chunk_overlap` overrides.
    pub fn with_overrides(mut self, chunk_size: Option<usize>, chunk_overlap: Option<usize>) -> Self {
        if let Some(size) = chunk_size {
            self.chunk_size = size;
        }
        if let Some(overlap) = chunk_overlap {
            self.chunk_overlap = overlap;
        }
        self
    }

    pub fn validate(&self) -> Result<(), RagError> {
        if self.chunk_size == 0 {
            return Err(RagError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(RagError::InvalidConfig(
                "min_chunk_size must be <= max_chunk_size".into(),
            ));
        }
        if self.chunk_size > self.max_chunk_size {
            return Err(RagError::InvalidConfig(
                "chunk_size must be <= max_chunk_size".into(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::InvalidConfig(
                "chunk_overlap must be < chunk_size".into(),
            ));
        }
        Ok(())
    }
}

fn default_separators() -> Vec<String> {
    ["\n\n", "\n", ". ", "! ", "? ", "; ", ", ", " "]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Structured product-like record, rendered by [`format_product`] and
/// chunked with [`ChunkConfig::for_products`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub name: String,
    pub sku: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    /// Ordered `(name, value)` pairs.
    pub specifications: Vec<(String, String)>,
    pub attributes: Metadata,
}

pub struct Chunker {
    config: ChunkConfig,
    estimator: TokenEstimator,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Result<Self, RagError> {
        config.validate()?;
        Ok(Self {
            config,
            estimator: TokenEstimator::CHUNKER,
        })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Chunk `content` with no inherited metadata.
    pub fn chunk(&self, content: &str) -> Result<Vec<DocumentChunk>, RagError> {
        self.chunk_with_metadata(content, &Metadata::new())
    }

    /// Chunk `content`; every chunk inherits `metadata` plus chunk-local keys
    /// (`chunk_index`, `chunk_count`).
    pub fn chunk_with_metadata(
        &self,
        content: &str,
        metadata: &Metadata,
    ) -> Result<Vec<DocumentChunk>, RagError> {
        if content.trim().is_empty() {
            return Err(RagError::EmptyContent);
        }

        let text = preprocess(content);
        if self.estimator.estimate(&text) <= self.config.chunk_size {
            return Ok(vec![self.make_chunk(text, 0, 1, 0, 0, metadata)]);
        }

        let mut cores = self.split_recursive(&text, &self.config.separators);
        self.merge_small_remainder(&mut cores);

        let with_overlap = self.inject_overlap(&cores);
        let sole = with_overlap.len() == 1;

        let kept: Vec<(String, usize, usize)> = with_overlap
            .into_iter()
            .enumerate()
            .filter_map(|(i, (text, prev, next))| {
                let tokens = self.estimator.estimate(&text);
                let in_range =
                    tokens >= self.config.min_chunk_size && tokens <= self.config.max_chunk_size;
                if in_range || sole {
                    Some((text, prev, next))
                } else {
                    tracing::warn!(
                        position = i,
                        tokens,
                        min = self.config.min_chunk_size,
                        max = self.config.max_chunk_size,
                        "dropping chunk outside size bounds"
                    );
                    None
                }
            })
            .collect();

        let count = kept.len();
        Ok(kept
            .into_iter()
            .enumerate()
            .map(|(i, (text, prev, next))| self.make_chunk(text, i, count, prev, next, metadata))
            .collect())
    }

    fn make_chunk(
        &self,
        content: String,
        index: usize,
        count: usize,
        overlap_with_previous: usize,
        overlap_with_next: usize,
        metadata: &Metadata,
    ) -> DocumentChunk {
        let mut meta = metadata.clone();
        meta.insert("chunk_index", index as i64);
        meta.insert("chunk_count", count as i64);
        DocumentChunk {
            token_count: self.estimator.estimate(&content),
            content,
            index,
            overlap_with_previous,
            overlap_with_next,
            metadata: meta,
        }
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        if self.estimator.estimate(text) <= self.config.chunk_size {
            let trimmed = text.trim();
            return if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            };
        }

        let found = separators.iter().enumerate().find_map(|(i, sep)| {
            let parts: Vec<&str> = text
                .split_inclusive(sep.as_str())
                .filter(|p| !p.trim().is_empty())
                .collect();
            (parts.len() > 1).then_some((i, parts))
        });

        let (sep_index, parts) = match found {
            Some(f) => f,
            None => return self.hard_split(text),
        };
        let finer = &separators[sep_index + 1..];

        let mut out = Vec::new();
        let mut current = String::new();
        for part in parts {
            if self.estimator.estimate(part) > self.config.chunk_size {
                flush(&mut current, &mut out);
                out.extend(self.split_recursive(part, finer));
                continue;
            }
            let combined = self.estimator.estimate(&current) + self.estimator.estimate(part);
            if !current.is_empty() && combined > self.config.chunk_size {
                flush(&mut current, &mut out);
            }
            current.push_str(part);
        }
        flush(&mut current, &mut out);
        out
    }

    /// Last resort for text with no usable separator.
    fn hard_split(&self, text: &str) -> Vec<String> {
        let width = self.estimator.chars_for(self.config.chunk_size).max(1);
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(width)
            .map(|c| c.iter().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn merge_small_remainder(&self, cores: &mut Vec<String>) {
        if cores.len() < 2 {
            return;
        }
        let last = cores.len() - 1;
        if self.estimator.estimate(&cores[last]) >= self.config.min_chunk_size {
            return;
        }
        let merged = format!("{} {}", cores[last - 1], cores[last]);
        if self.estimator.estimate(&merged) <= self.config.max_chunk_size {
            cores.pop();
            cores[last - 1] = merged;
        }
    }

    /// Returns `(text, overlap_prev_tokens, overlap_next_tokens)` per chunk.
    fn inject_overlap(&self, cores: &[String]) -> Vec<(String, usize, usize)> {
        if self.config.chunk_overlap == 0 || cores.len() < 2 {
            return cores.iter().map(|c| (c.clone(), 0, 0)).collect();
        }

        let words = ((self.config.chunk_overlap as f64) * WORDS_PER_OVERLAP_TOKEN).floor() as usize;
        let marker_tokens = self.estimator.estimate(OVERLAP_MARKER);

        cores
            .iter()
            .enumerate()
            .map(|(i, core)| {
                let has_prev = i > 0;
                let has_next = i + 1 < cores.len();
                let sides = has_prev as usize + has_next as usize;

                let core_tokens = self.estimator.estimate(core);
                let room = self
                    .config
                    .max_chunk_size
                    .saturating_sub(core_tokens + sides * marker_tokens);
                let per_side_chars = self.estimator.chars_for(room / sides.max(1));

                let prefix = if has_prev {
                    tail_words(&cores[i - 1], words, per_side_chars)
                } else {
                    String::new()
                };
                let suffix = if has_next {
                    head_words(&cores[i + 1], words, per_side_chars)
                } else {
                    String::new()
                };

                let mut text = String::new();
                if !prefix.is_empty() {
                    text.push_str(&prefix);
                    text.push_str(OVERLAP_MARKER);
                }
                text.push_str(core);
                if !suffix.is_empty() {
                    text.push_str(OVERLAP_MARKER);
                    text.push_str(&suffix);
                }

                (
                    text,
                    self.estimator.estimate(&prefix),
                    self.estimator.estimate(&suffix),
                )
            })
            .collect()
    }
}

fn flush(current: &mut String, out: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    current.clear();
}

/// Up to `max_words` trailing words whose joined length fits `max_chars`.
fn tail_words(text: &str, max_words: usize, max_chars: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut taken: Vec<&str> = Vec::new();
    let mut len = 0usize;
    for w in words.iter().rev().take(max_words) {
        let add = w.chars().count() + usize::from(!taken.is_empty());
        if len + add > max_chars {
            break;
        }
        len += add;
        taken.push(w);
    }
    taken.reverse();
    taken.join(" ")
}

/// Up to `max_words` leading words whose joined length fits `max_chars`.
fn head_words(text: &str, max_words: usize, max_chars: usize) -> String {
    let mut taken: Vec<&str> = Vec::new();
    let mut len = 0usize;
    for w in text.split_whitespace().take(max_words) {
        let add = w.chars().count() + usize::from(!taken.is_empty());
        if len + add > max_chars {
            break;
        }
        len += add;
        taken.push(w);
    }
    taken.join(" ")
}

/// Normalize whitespace before splitting.
pub fn preprocess(content: &str) -> String {
    let unified = content.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut newlines = 0usize;
    let mut pending_space = false;
    for ch in unified.chars() {
        if ch == '\n' {
            newlines += 1;
            pending_space = false;
            continue;
        }
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if newlines > 0 {
            out.push_str(if newlines >= 2 { "\n\n" } else { "\n" });
            newlines = 0;
        } else if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }
    out.trim().to_string()
}

/// Remove injected overlap, returning the chunk's own text.
pub fn core_text(chunk: &DocumentChunk) -> &str {
    let mut text = chunk.content.as_str();
    if chunk.overlap_with_previous > 0 {
        if let Some(pos) = text.find(OVERLAP_MARKER) {
            text = &text[pos + OVERLAP_MARKER.len()..];
        }
    }
    if chunk.overlap_with_next > 0 {
        if let Some(pos) = text.rfind(OVERLAP_MARKER) {
            text = &text[..pos];
        }
    }
    text
}

/// Render a product record as ordered text sections.
pub fn format_product(product: &ProductRecord) -> String {
    let mut sections = vec![format!("Product: {}", product.name)];
    if let Some(sku) = &product.sku {
        sections.push(format!("SKU: {sku}"));
    }
    if let Some(category) = &product.category {
        sections.push(format!("Category: {category}"));
    }
    if let Some(desc) = product.description.as_deref().filter(|d| !d.trim().is_empty()) {
        sections.push(format!("\nDescription:\n{}", desc.trim()));
    }
    if !product.specifications.is_empty() {
        let specs: Vec<String> = product
            .specifications
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect();
        sections.push(format!("\nSpecifications:\n{}", specs.join("\n")));
    }
    if !product.attributes.is_empty() {
        let attrs: Vec<String> = product
            .attributes
            .iter()
            .map(|(k, v)| format!("- {k}: {}", v.display()))
            .collect();
        sections.push(format!("\nAttributes:\n{}", attrs.join("\n")));
    }
    sections.join("\n")
}

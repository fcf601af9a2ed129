use crate::error::{RagError, Result};
use crate::models::{ChunkStrategy, SourceDocument};

pub const MIN_CHUNK_SIZE: usize = 100;
pub const MAX_CHUNK_SIZE: usize = 10_000;

/// Fallback chunk geometry used when a fixed strategy omits size or overlap.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingDefaults {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkingDefaults {
    fn default() -> Self {
        Self {
            size: 512,
            overlap: 51,
        }
    }
}

/// Apply a chunking strategy to a batch of source documents. Dispatch is by
/// strategy tag and exhaustive; every handler is stateless.
pub fn chunk_documents(
    documents: Vec<SourceDocument>,
    strategy: ChunkStrategy,
    defaults: ChunkingDefaults,
) -> Result<Vec<SourceDocument>> {
    match strategy {
        ChunkStrategy::Fixed { size, overlap } => {
            let size = size.unwrap_or(defaults.size);
            let overlap = overlap.unwrap_or(defaults.overlap);
            validate_fixed(size, overlap)?;

            let mut chunked = Vec::new();
            for document in documents {
                chunked.extend(split_fixed(&document, size, overlap));
            }
            Ok(chunked)
        }
        // Identity: same content, same metadata, same order.
        ChunkStrategy::None => Ok(documents),
    }
}

fn validate_fixed(size: usize, overlap: usize) -> Result<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
        return Err(RagError::validation(
            "chunk_size",
            format!("must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE}, got {size}"),
        ));
    }
    if overlap >= size {
        return Err(RagError::validation(
            "chunk_overlap",
            format!("must be smaller than chunk size {size}, got {overlap}"),
        ));
    }
    Ok(())
}

fn split_fixed(document: &SourceDocument, size: usize, overlap: usize) -> Vec<SourceDocument> {
    let chars: Vec<char> = document.text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let stride = size - overlap;
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let text: String = chars[start..end].iter().collect();
        pieces.push(SourceDocument {
            source: document.source.clone(),
            text,
            metadata: document.metadata.clone(),
        });
        if end == chars.len() {
            break;
        }
        start += stride;
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(text: &str) -> SourceDocument {
        let mut metadata = serde_json::Map::new();
        metadata.insert("origin".to_string(), json!("upload"));
        SourceDocument {
            source: "s3://bucket/file.txt".to_string(),
            text: text.to_string(),
            metadata,
        }
    }

    #[test]
    fn none_strategy_is_the_identity() {
        let documents = vec![doc("alpha"), doc("beta")];
        let result =
            chunk_documents(documents.clone(), ChunkStrategy::None, ChunkingDefaults::default())
                .unwrap();
        assert_eq!(result, documents);

        let empty = chunk_documents(Vec::new(), ChunkStrategy::None, ChunkingDefaults::default())
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn fixed_strategy_rejects_out_of_range_size() {
        let error = chunk_documents(
            vec![doc("text")],
            ChunkStrategy::Fixed {
                size: Some(50),
                overlap: Some(0),
            },
            ChunkingDefaults::default(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("chunk_size"));

        let error = chunk_documents(
            vec![doc("text")],
            ChunkStrategy::Fixed {
                size: Some(20_000),
                overlap: Some(0),
            },
            ChunkingDefaults::default(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("chunk_size"));
    }

    #[test]
    fn fixed_strategy_rejects_overlap_at_or_above_size() {
        let error = chunk_documents(
            vec![doc("text")],
            ChunkStrategy::Fixed {
                size: Some(100),
                overlap: Some(100),
            },
            ChunkingDefaults::default(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn fixed_strategy_falls_back_to_defaults() {
        let text = "x".repeat(1200);
        let result = chunk_documents(
            vec![doc(&text)],
            ChunkStrategy::Fixed {
                size: None,
                overlap: None,
            },
            ChunkingDefaults::default(),
        )
        .unwrap();
        // stride 461 over 1200 chars
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].text.len(), 512);
    }

    #[test]
    fn fixed_strategy_overlaps_adjacent_chunks_and_keeps_metadata() {
        let text: String = ('a'..='z').cycle().take(2500).collect();
        let result = chunk_documents(
            vec![doc(&text)],
            ChunkStrategy::Fixed {
                size: Some(1000),
                overlap: Some(100),
            },
            ChunkingDefaults::default(),
        )
        .unwrap();

        assert!(result.len() >= 3);
        let first: Vec<char> = result[0].text.chars().collect();
        let second: Vec<char> = result[1].text.chars().collect();
        assert_eq!(&first[900..], &second[..100]);
        for piece in &result {
            assert_eq!(piece.metadata["origin"], json!("upload"));
            assert_eq!(piece.source, "s3://bucket/file.txt");
        }
    }
}

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{PosmapError, Result};
use crate::remote::embeddings::Embedder;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub header: String,
    pub score: f64,
}

/// Cosine similarity; a zero vector scores near zero instead of dividing by
/// zero, and a vector with non-finite components scores zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let num: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let na = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb = b.iter().map(|y| (*y as f64).powi(2)).sum::<f64>().sqrt();
    let score = num / (na * nb + EPSILON);
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Embedding-based candidate ranking. Header vectors are cached for the life
/// of the ranker, which is one discovery run.
pub struct SimilarityRanker<'a> {
    embedder: &'a dyn Embedder,
    batch_size: usize,
    cache: HashMap<String, Vec<f32>>,
}

impl<'a> SimilarityRanker<'a> {
    pub fn new(embedder: &'a dyn Embedder, batch_size: usize) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
            cache: HashMap::new(),
        }
    }

    /// Candidates ordered by descending similarity to `source_label`; equal
    /// scores keep their input order.
    pub fn rank(&mut self, source_label: &str, candidates: &[String]) -> Result<Vec<RankedCandidate>> {
        let source = self.embed_one(source_label)?;
        self.warm(candidates)?;

        let mut ranked: Vec<RankedCandidate> = candidates
            .iter()
            .map(|c| RankedCandidate {
                header: c.clone(),
                score: self.cache.get(c).map(|v| cosine(&source, v)).unwrap_or(0.0),
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        debug!(source_label, top = ?ranked.first().map(|r| &r.header), "ranked candidates");
        Ok(ranked)
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder
            .embed(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| PosmapError::Remote(format!("no embedding returned for '{text}'")))
    }

    /// Embed uncached candidates in bounded batches. Results are matched by
    /// position, never by completion order.
    fn warm(&mut self, candidates: &[String]) -> Result<()> {
        let mut missing: Vec<String> = Vec::new();
        for c in candidates {
            if !self.cache.contains_key(c) && !missing.contains(c) {
                missing.push(c.clone());
            }
        }
        for chunk in missing.chunks(self.batch_size) {
            let vectors = self.embedder.embed(chunk)?;
            if vectors.len() != chunk.len() {
                return Err(PosmapError::Remote(format!(
                    "expected {} embeddings, got {}",
                    chunk.len(),
                    vectors.len()
                )));
            }
            for (text, vector) in chunk.iter().zip(vectors) {
                self.cache.insert(text.clone(), vector);
            }
        }
        Ok(())
    }
}

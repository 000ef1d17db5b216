use serde::{Deserialize, Serialize};

use super::JsonClient;
use crate::error::{PosmapError, Result};
use crate::settings::RemoteSettings;

/// Text embedding service: one fixed-length vector per input string, in input
/// order.
pub trait Embedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub struct HttpEmbedder {
    client: JsonClient,
    model: String,
}

impl HttpEmbedder {
    pub fn new(settings: &RemoteSettings) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(settings)?,
            model: settings.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl Embedder for HttpEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp: EmbeddingResponse = self.client.post(
            "embeddings",
            &EmbeddingRequest {
                model: &self.model,
                input: texts,
            },
        )?;
        order_embeddings(resp.data, texts.len())
    }
}

/// Put vectors back in request order; services may return them shuffled.
fn order_embeddings(data: Vec<EmbeddingDatum>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if data.len() != expected {
        return Err(PosmapError::Remote(format!(
            "embedding service returned {} vectors for {expected} inputs",
            data.len()
        )));
    }
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for (pos, datum) in data.into_iter().enumerate() {
        let idx = datum.index.unwrap_or(pos);
        match slots.get_mut(idx) {
            Some(slot) if slot.is_none() => *slot = Some(datum.embedding),
            _ => {
                return Err(PosmapError::Remote(format!(
                    "embedding service returned a bad index {idx}"
                )))
            }
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

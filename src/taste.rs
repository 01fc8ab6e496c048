//! Running per-session preference vector.
//!
//! A weighted online average of the embeddings of tracks the listener
//! reacted to. Positive weights pull the taste toward a track, negative
//! weights push it away. The accumulated weight never goes negative.

use log::trace;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TasteAccumulator {
    embedding: Option<Vec<f32>>,
    weight: f32,
}

impl TasteAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Whether the taste can drive a similarity search. A taste whose weight
    /// was driven to zero is kept but stale until reinforced again.
    pub fn is_active(&self) -> bool {
        self.embedding.is_some() && self.weight > 0.0
    }

    /// Blend `embedding` into the taste with `weight`.
    pub fn reinforce(&mut self, embedding: &[f32], weight: f32) {
        if !weight.is_finite() {
            trace!("Ignoring non-finite taste weight {weight}");
            return;
        }

        let current = match self.embedding.as_mut() {
            None => {
                // Negative-only feedback never seeds a taste.
                if weight > 0.0 {
                    self.embedding = Some(sanitized(embedding));
                    self.weight = weight;
                }
                return;
            }
            Some(current) => current,
        };

        if current.len() != embedding.len() {
            // Embedding generation changed under the session.
            if weight > 0.0 {
                *current = sanitized(embedding);
                self.weight = weight;
            }
            return;
        }

        let total = self.weight + weight;
        if total <= 0.0 {
            self.weight = 0.0;
            return;
        }

        for (value, incoming) in current.iter_mut().zip(embedding) {
            let blended = (*value * self.weight + incoming * weight) / total;
            *value = if blended.is_finite() { blended } else { 0.0 };
        }
        self.weight = total;
    }
}

fn sanitized(embedding: &[f32]) -> Vec<f32> {
    embedding
        .iter()
        .map(|v| if v.is_finite() { *v } else { 0.0 })
        .collect()
}

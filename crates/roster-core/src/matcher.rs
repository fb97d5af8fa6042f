//! Similarity scoring and best-match selection.

use crate::gallery::Gallery;
use crate::types::{FeatureVector, MatchResult};

/// Rescaled cosine similarity between two feature slices, in [0, 1].
///
/// Both slices are truncated to the shorter length. Returns 0 when either
/// truncated slice has zero norm. Otherwise `(cos + 1) / 2`, which keeps the
/// acceptance threshold on a probability-like scale; it is not a probability.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    // f64 sums: squares of finite f32 values cannot overflow.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32;
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Strategy for comparing a probe vector against the registered gallery.
pub trait Matcher {
    fn compare(&self, probe: &FeatureVector, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Exhaustive rescaled-cosine matcher.
///
/// Each identity scores the maximum over its reference vectors; the best
/// identity wins with strict `>`, so ties keep the identity that comes
/// first in gallery order. A match requires `best > threshold`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &FeatureVector, gallery: &Gallery, threshold: f32) -> MatchResult {
        if gallery.feature_count() == 0 {
            return MatchResult::no_match(0.0);
        }
        if probe.degraded {
            tracing::debug!(len = probe.len(), "matching degraded probe vector");
        }

        let mut best_sim = 0.0f32;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let identity_best = entry
                .features
                .iter()
                .filter(|f| !f.is_empty())
                .map(|f| probe.similarity(f))
                .fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.max(s))));

            if let Some(sim) = identity_best {
                if sim > best_sim {
                    best_sim = sim;
                    best_idx = Some(i);
                }
            }
        }

        match best_idx {
            Some(idx) if best_sim > threshold => MatchResult {
                identity: Some(gallery.entries()[idx].identity.clone()),
                similarity: best_sim,
            },
            _ => MatchResult::no_match(best_sim),
        }
    }
}

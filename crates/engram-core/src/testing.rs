//! Test Doubles
//!
//! Deterministic stand-ins for the external embedder and validator. Used by
//! unit tests here and by the e2e harness crate; kept out of `#[cfg(test)]`
//! so downstream test crates can build against them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::consolidation::{ValidationRequest, Validator, Verdict, VerdictDecision};
use crate::embed::{Embedder, Embedding, EMBEDDING_DIMENSIONS};
use crate::error::{Error, Result};

// ============================================================================
// VECTOR HELPERS
// ============================================================================

/// Deterministic unit vector derived from a seed string
///
/// Unrelated seeds produce near-orthogonal vectors in 768 dimensions, which
/// is what clustering and ranking tests rely on.
pub fn unit_vector(seed: &str) -> Vec<f32> {
    let mut out = Vec::with_capacity(EMBEDDING_DIMENSIONS);
    let mut counter = 0u32;
    while out.len() < EMBEDDING_DIMENSIONS {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        for chunk in digest.chunks_exact(4) {
            if out.len() == EMBEDDING_DIMENSIONS {
                break;
            }
            let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // Map to [-1, 1]
            out.push((bits as f32 / u32::MAX as f32) * 2.0 - 1.0);
        }
        counter += 1;
    }
    let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut out {
            *x /= norm;
        }
    }
    out
}

/// Interpolate between two vectors and renormalize
///
/// `t = 0` returns `a`; small `t` values produce vectors highly similar to
/// `a`, which is how tests build tight clusters.
pub fn blend(a: &[f32], b: &[f32], t: f32) -> Vec<f32> {
    let mut out: Vec<f32> = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| x * (1.0 - t) + y * t)
        .collect();
    let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut out {
            *x /= norm;
        }
    }
    out
}

// ============================================================================
// STUB EMBEDDER
// ============================================================================

/// Deterministic embedder: fixed mappings first, hash-seeded vectors otherwise
pub struct StubEmbedder {
    mappings: Vec<(String, Vec<f32>)>,
    offline: bool,
    calls: AtomicUsize,
}

impl Default for StubEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl StubEmbedder {
    /// Online stub with no fixed mappings
    pub fn new() -> Self {
        Self {
            mappings: Vec::new(),
            offline: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Stub that reports unavailable and fails every call with `Degraded`
    pub fn offline() -> Self {
        Self {
            mappings: Vec::new(),
            offline: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Texts containing `needle` embed to `vector`
    pub fn with_mapping(mut self, needle: impl Into<String>, vector: Vec<f32>) -> Self {
        self.mappings.push((needle.into(), vector));
        self
    }

    /// Number of embed_batch calls made
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        for (needle, vector) in &self.mappings {
            if text.contains(needle.as_str()) {
                return vector.clone();
            }
        }
        unit_vector(text)
    }
}

#[async_trait::async_trait]
impl Embedder for StubEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline {
            return Err(Error::degraded("stub embedder offline"));
        }
        Ok(texts
            .iter()
            .map(|t| Embedding::new(self.vector_for(t)))
            .collect())
    }

    fn is_available(&self) -> bool {
        !self.offline
    }
}

// ============================================================================
// STUB VALIDATOR
// ============================================================================

/// Scripted validator behavior
#[derive(Debug, Clone)]
pub enum ValidatorScript {
    /// Confirm every candidate at the given confidence
    Confirm(f64),
    /// Refute every candidate
    Refute,
    /// Refine every candidate to the given text
    Refine(String, f64),
    /// Fail every call with `Degraded`
    Fail,
}

/// Deterministic validator following one scripted behavior
pub struct StubValidator {
    script: Mutex<ValidatorScript>,
    enabled: bool,
    calls: AtomicUsize,
}

impl StubValidator {
    /// Validator that always confirms at confidence 0.9
    pub fn confirming() -> Self {
        Self::with_script(ValidatorScript::Confirm(0.9))
    }

    /// Validator that always fails
    pub fn failing() -> Self {
        Self::with_script(ValidatorScript::Fail)
    }

    /// Validator following a script
    pub fn with_script(script: ValidatorScript) -> Self {
        Self {
            script: Mutex::new(script),
            enabled: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Disabled validator; consolidation never escalates to it
    pub fn disabled() -> Self {
        Self {
            script: Mutex::new(ValidatorScript::Confirm(0.9)),
            enabled: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Swap the script mid-test
    pub fn set_script(&self, script: ValidatorScript) {
        *self.script.lock().expect("script lock") = script;
    }

    /// Number of validate calls made
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Validator for StubValidator {
    async fn validate(&self, _request: &ValidationRequest) -> Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().expect("script lock").clone();
        match script {
            ValidatorScript::Confirm(confidence) => Ok(Verdict {
                decision: VerdictDecision::Confirm,
                confidence,
            }),
            ValidatorScript::Refute => Ok(Verdict {
                decision: VerdictDecision::Refute,
                confidence: 0.9,
            }),
            ValidatorScript::Refine(text, confidence) => Ok(Verdict {
                decision: VerdictDecision::Refine(text),
                confidence,
            }),
            ValidatorScript::Fail => Err(Error::degraded("stub validator failing")),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::cosine_similarity;

    #[test]
    fn test_unit_vector_deterministic_and_normalized() {
        let a = unit_vector("pytest failures");
        let b = unit_vector("pytest failures");
        assert_eq!(a, b);
        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_unrelated_seeds_near_orthogonal() {
        let a = unit_vector("database tuning");
        let b = unit_vector("completely different topic");
        assert!(cosine_similarity(&a, &b).abs() < 0.2);
    }

    #[test]
    fn test_blend_controls_similarity() {
        let a = unit_vector("anchor");
        let b = unit_vector("far away");
        let near = blend(&a, &b, 0.05);
        let far = blend(&a, &b, 0.95);
        assert!(cosine_similarity(&a, &near) > 0.9);
        assert!(cosine_similarity(&a, &far) < cosine_similarity(&a, &near));
    }

    #[tokio::test]
    async fn test_stub_embedder_mappings() {
        let fixed = unit_vector("fixed");
        let stub = StubEmbedder::new().with_mapping("pool", fixed.clone());
        let result = stub
            .embed_batch(&["tuning the pool".to_string(), "unrelated".to_string()])
            .await
            .unwrap();
        assert_eq!(result[0].vector, fixed);
        assert_ne!(result[1].vector, fixed);
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_embedder_degraded() {
        let stub = StubEmbedder::offline();
        assert!(!stub.is_available());
        let err = stub.embed_batch(&["x".to_string()]).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Degraded);
    }
}

//! Deep Validator Client
//!
//! System 2 of the dual-process consolidation engine: an external text
//! model asked whether a cluster supports a proposed artifact. Verdicts are
//! explicit result values; a timeout or failure degrades to the System 1
//! decision at reduced confidence, decided by the engine, not here.

use std::time::Duration;

use crate::config::ValidatorConfig;
use crate::error::{Error, Result};

// ============================================================================
// REQUEST / VERDICT
// ============================================================================

/// What the validator is asked to judge
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    /// "fact" or "procedure"
    pub candidate_kind: String,
    /// The proposed statement or workflow summary
    pub proposal: String,
    /// Representative event contents from the cluster
    pub cluster_samples: Vec<String>,
    /// High-confidence statement the proposal may contradict, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_statement: Option<String>,
}

/// The validator's decision
#[derive(Debug, Clone, PartialEq)]
pub enum VerdictDecision {
    /// The cluster supports the proposal
    Confirm,
    /// The cluster does not support the proposal
    Refute,
    /// The proposal should be replaced with this text
    Refine(String),
}

/// Decision plus the validator's own confidence
#[derive(Debug, Clone)]
pub struct Verdict {
    /// What to do with the candidate
    pub decision: VerdictDecision,
    /// Validator confidence in [0, 1]
    pub confidence: f64,
}

// ============================================================================
// TRAIT
// ============================================================================

/// External deep validation
#[async_trait::async_trait]
pub trait Validator: Send + Sync {
    /// Judge one candidate; errors and timeouts degrade to System 1
    async fn validate(&self, request: &ValidationRequest) -> Result<Verdict>;

    /// When false, consolidation never escalates to System 2
    fn is_enabled(&self) -> bool {
        true
    }
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(serde::Deserialize)]
struct ValidateResponse {
    /// "confirm" | "refute" | "refine"
    verdict: String,
    #[serde(default)]
    text: Option<String>,
    confidence: f64,
}

// ============================================================================
// HTTP VALIDATOR
// ============================================================================

/// Production validator backed by an HTTP text-completion service
pub struct HttpValidator {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    enabled: bool,
}

impl HttpValidator {
    /// Build from configuration
    pub fn new(config: &ValidatorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            enabled: config.enabled,
        })
    }
}

#[async_trait::async_trait]
impl Validator for HttpValidator {
    async fn validate(&self, request: &ValidationRequest) -> Result<Verdict> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::cancelled(format!("validator deadline exceeded: {e}"))
                } else {
                    Error::degraded(format!("validator request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::degraded(format!("validator returned {status}")));
        }

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| Error::degraded(format!("validator response decode: {e}")))?;

        let decision = match body.verdict.as_str() {
            "confirm" => VerdictDecision::Confirm,
            "refute" => VerdictDecision::Refute,
            "refine" => {
                let text = body.text.unwrap_or_default();
                if text.trim().is_empty() {
                    return Err(Error::degraded("validator refined to empty text"));
                }
                VerdictDecision::Refine(text)
            }
            other => {
                return Err(Error::degraded(format!(
                    "validator returned unknown verdict '{other}'"
                )))
            }
        };

        Ok(Verdict {
            decision,
            confidence: body.confidence.clamp(0.0, 1.0),
        })
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

    #[test]
    fn test_request_serializes_camel_case() {
        let request = ValidationRequest {
            candidate_kind: "fact".to_string(),
            proposal: "pytest failures concentrate in module X".to_string(),
            cluster_samples: vec!["pytest failed in X".to_string()],
            conflicting_statement: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["candidateKind"], "fact");
        assert!(json.get("conflictingStatement").is_none());
    }

    #[test]
    fn test_response_decodes_verdicts() {
        let body: ValidateResponse =
            serde_json::from_str(r#"{"verdict": "confirm", "confidence": 0.85}"#).unwrap();
        assert_eq!(body.verdict, "confirm");
        assert!((body.confidence - 0.85).abs() < 1e-9);

        let body: ValidateResponse =
            serde_json::from_str(r#"{"verdict": "refine", "text": "better", "confidence": 0.7}"#)
                .unwrap();
        assert_eq!(body.text.as_deref(), Some("better"));
    }

    #[test]
    fn test_disabled_flag_respected() {
        let config = ValidatorConfig {
            enabled: false,
            ..Default::default()
        };
        let validator = HttpValidator::new(&config).unwrap();
        assert!(!validator.is_enabled());
    }
}

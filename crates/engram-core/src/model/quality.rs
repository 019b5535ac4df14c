//! Meta Layer Types - quality records, alerts, execution metrics
//!
//! The meta layer observes the others passively. Samples accumulate in a
//! bounded ring buffer per (project, layer); the summary is the latest
//! sample plus rolling statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Outcome;

// ============================================================================
// LAYER KINDS
// ============================================================================

/// Which memory layer a quality record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Episodic event log
    Episodic,
    /// Semantic fact store
    Semantic,
    /// Procedural workflow store
    Procedural,
    /// Prospective task DAG
    Prospective,
    /// Knowledge graph
    Graph,
}

impl LayerKind {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Episodic => "episodic",
            LayerKind::Semantic => "semantic",
            LayerKind::Procedural => "procedural",
            LayerKind::Prospective => "prospective",
            LayerKind::Graph => "graph",
        }
    }

    /// All layers, for iteration
    pub fn all() -> [LayerKind; 5] {
        [
            LayerKind::Episodic,
            LayerKind::Semantic,
            LayerKind::Procedural,
            LayerKind::Prospective,
            LayerKind::Graph,
        ]
    }
}

// ============================================================================
// QUALITY RECORDS
// ============================================================================

/// One quality sample for a (project, layer) pair; all values in [0, 1]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySample {
    /// facts/events ratio through a log squash
    pub density: f64,
    /// Fraction of active domains with a recent fact
    pub coverage: f64,
    /// Average knowledge-graph relation weight
    pub coherence: f64,
    /// Mean retrieval score over the recent query window
    pub recall_proxy: f64,
    /// Active working-set size divided by the Miller cap of 7
    pub saturation: f64,
    /// When the sample was taken
    pub sampled_at: DateTime<Utc>,
}

/// Quality summary for a (project, layer) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityRecord {
    /// Layer described
    pub layer: LayerKind,
    /// Most recent sample
    pub latest: QualitySample,
    /// Rolling mean saturation over the buffer
    pub mean_saturation: f64,
    /// Rolling mean recall proxy over the buffer
    pub mean_recall_proxy: f64,
    /// 90th-percentile saturation over the buffer
    pub p90_saturation: f64,
    /// 90th-percentile recall proxy over the buffer
    pub p90_recall_proxy: f64,
    /// Number of samples backing the rolling stats
    pub sample_count: usize,
}

/// An issue the meta layer wants surfaced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityAlert {
    /// Machine-readable code, e.g. "saturation_high", "ingest_overflow"
    pub code: String,
    /// Layer the alert concerns, if layer-specific
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<LayerKind>,
    /// Human-readable detail
    pub detail: String,
    /// When the condition was first observed
    pub since: DateTime<Utc>,
}

// ============================================================================
// EXECUTION METRICS
// ============================================================================

/// Emitted on task completion; feeds procedural learning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetric {
    /// The completed task
    pub task_id: i64,
    /// Wall-clock duration
    pub duration_ms: i64,
    /// How the task finished
    pub outcome: Outcome,
    /// Time per phase label, milliseconds
    #[serde(default)]
    pub phase_breakdown: std::collections::BTreeMap<String, i64>,
    /// Free-form properties
    #[serde(default)]
    pub properties: serde_json::Value,
}

// ============================================================================
// RING BUFFER
// ============================================================================

/// Fixed-capacity ring buffer for rolling quality samples
#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: std::collections::VecDeque<QualitySample>,
    capacity: usize,
}

impl SampleRing {
    /// New ring holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Push a sample, evicting the oldest at capacity
    pub fn push(&mut self, sample: QualitySample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<&QualitySample> {
        self.samples.back()
    }

    /// Number of retained samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no samples retained
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of an extracted field over the buffer
    pub fn mean_of(&self, f: impl Fn(&QualitySample) -> f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(&f).sum::<f64>() / self.samples.len() as f64
    }

    /// Nearest-rank percentile of an extracted field over the buffer
    ///
    /// `p` is in (0, 100]; an empty buffer reports 0.0.
    pub fn percentile_of(&self, p: f64, f: impl Fn(&QualitySample) -> f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut values: Vec<f64> = self.samples.iter().map(&f).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((p / 100.0) * values.len() as f64).ceil() as usize;
        values[rank.clamp(1, values.len()) - 1]
    }

    /// Samples where `pred` holds, scanning from the newest backwards, that
    /// form an unbroken run ending at the latest sample
    pub fn trailing_run(&self, pred: impl Fn(&QualitySample) -> bool) -> usize {
        self.samples.iter().rev().take_while(|s| pred(s)).count()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(saturation: f64) -> QualitySample {
        QualitySample {
            density: 0.5,
            coverage: 0.5,
            coherence: 0.5,
            recall_proxy: 0.5,
            saturation,
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = SampleRing::new(3);
        for s in [0.1, 0.2, 0.3, 0.4] {
            ring.push(sample(s));
        }
        assert_eq!(ring.len(), 3);
        assert!((ring.latest().unwrap().saturation - 0.4).abs() < 1e-9);
        assert!((ring.mean_of(|s| s.saturation) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let mut ring = SampleRing::new(10);
        for s in [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0] {
            ring.push(sample(s));
        }
        assert!((ring.percentile_of(50.0, |s| s.saturation) - 0.5).abs() < 1e-9);
        assert!((ring.percentile_of(90.0, |s| s.saturation) - 0.9).abs() < 1e-9);
        assert!((ring.percentile_of(100.0, |s| s.saturation) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_small_buffers() {
        let empty = SampleRing::new(4);
        assert_eq!(empty.percentile_of(90.0, |s| s.saturation), 0.0);

        let mut single = SampleRing::new(4);
        single.push(sample(0.7));
        assert!((single.percentile_of(50.0, |s| s.saturation) - 0.7).abs() < 1e-9);
        assert!((single.percentile_of(99.0, |s| s.saturation) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_run() {
        let mut ring = SampleRing::new(10);
        for s in [0.5, 0.9, 0.85, 0.95] {
            ring.push(sample(s));
        }
        assert_eq!(ring.trailing_run(|s| s.saturation > 0.8), 3);
        ring.push(sample(0.2));
        assert_eq!(ring.trailing_run(|s| s.saturation > 0.8), 0);
    }
}

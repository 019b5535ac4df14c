//! System 1 Clustering
//!
//! Online density-based clustering over event embeddings: an event joins an
//! existing cluster when its cosine similarity to the centroid exceeds the
//! strategy threshold, otherwise it seeds a new cluster. Centroids are
//! running means; each cluster carries an uncertainty score derived from
//! intra-cluster variance.

use crate::embed::cosine_similarity;
use crate::model::Event;

// ============================================================================
// CLUSTER
// ============================================================================

/// A cluster of related events with its running centroid
#[derive(Debug, Clone)]
pub struct Cluster {
    /// Member events, in arrival (time) order
    pub events: Vec<Event>,
    /// Running mean of member embeddings
    pub centroid: Vec<f32>,
    /// Mean member-to-centroid similarity accumulator
    similarity_sum: f64,
}

impl Cluster {
    fn seed(event: Event, embedding: Vec<f32>) -> Self {
        Self {
            events: vec![event],
            centroid: embedding,
            similarity_sum: 1.0,
        }
    }

    fn absorb(&mut self, event: Event, embedding: &[f32], similarity: f32) {
        let n = self.events.len() as f32;
        for (c, x) in self.centroid.iter_mut().zip(embedding.iter()) {
            *c = (*c * n + x) / (n + 1.0);
        }
        self.similarity_sum += f64::from(similarity);
        self.events.push(event);
    }

    /// Member count
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when the cluster has no members
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Uncertainty in [0, 1] from intra-cluster spread
    ///
    /// Mean member-to-centroid similarity near 1 means a tight cluster and
    /// low uncertainty; singleton clusters are maximally uncertain since one
    /// sample says nothing about a recurring pattern.
    pub fn uncertainty(&self) -> f64 {
        if self.events.len() <= 1 {
            return 1.0;
        }
        let mean_similarity = self.similarity_sum / self.events.len() as f64;
        (1.0 - mean_similarity).clamp(0.0, 1.0)
    }
}

// ============================================================================
// CLUSTERING PASS
// ============================================================================

/// Result of one clustering pass
#[derive(Debug)]
pub struct ClusterOutcome {
    /// Clusters with at least one embedded member
    pub clusters: Vec<Cluster>,
    /// Events skipped for lack of an embedding
    pub skipped: usize,
}

/// Cluster events online against running centroids
///
/// `threshold` is the cosine similarity an event needs against the closest
/// centroid to join that cluster. `max_clusters` bounds memory on
/// pathological windows; past the bound, events join their nearest cluster
/// regardless of threshold.
pub fn cluster_events(
    events: Vec<(Event, Option<Vec<f32>>)>,
    threshold: f32,
    max_clusters: usize,
) -> ClusterOutcome {
    let mut clusters: Vec<Cluster> = Vec::new();
    let mut skipped = 0;

    for (event, embedding) in events {
        let Some(embedding) = embedding else {
            skipped += 1;
            continue;
        };

        let best = clusters
            .iter()
            .enumerate()
            .map(|(idx, cluster)| (idx, cosine_similarity(&cluster.centroid, &embedding)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((idx, similarity))
                if similarity >= threshold || clusters.len() >= max_clusters =>
            {
                clusters[idx].absorb(event, &embedding, similarity);
            }
            _ => clusters.push(Cluster::seed(event, embedding)),
        }
    }

    ClusterOutcome { clusters, skipped }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, Outcome};
    use crate::testing::{blend, unit_vector};

    fn event(id: i64, content: &str) -> Event {
        Event {
            id,
            project_id: 1,
            content: content.to_string(),
            kind: EventKind::ToolUse,
            outcome: Outcome::Unknown,
            context: Default::default(),
            content_hash: format!("hash-{id}"),
            has_embedding: true,
            importance: 0.5,
            consolidation_state: Default::default(),
            consolidation_run_id: None,
            created_at: chrono::Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn test_similar_events_share_a_cluster() {
        let anchor = unit_vector("pytest failures");
        let far = unit_vector("deployment pipeline");
        let events = vec![
            (event(1, "pytest failed a"), Some(anchor.clone())),
            (event(2, "pytest failed b"), Some(blend(&anchor, &far, 0.02))),
            (event(3, "pytest failed c"), Some(blend(&anchor, &far, 0.04))),
            (event(4, "deploy went out"), Some(far.clone())),
        ];
        let outcome = cluster_events(events, 0.75, 64);
        assert_eq!(outcome.clusters.len(), 2);
        assert_eq!(outcome.skipped, 0);

        let sizes: Vec<usize> = outcome.clusters.iter().map(Cluster::len).collect();
        assert!(sizes.contains(&3));
        assert!(sizes.contains(&1));
    }

    #[test]
    fn test_missing_embeddings_skipped() {
        let events = vec![
            (event(1, "a"), Some(unit_vector("a"))),
            (event(2, "b"), None),
        ];
        let outcome = cluster_events(events, 0.75, 64);
        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_tight_cluster_low_uncertainty() {
        let anchor = unit_vector("tight");
        let far = unit_vector("elsewhere");
        let tight = vec![
            (event(1, "a"), Some(anchor.clone())),
            (event(2, "b"), Some(blend(&anchor, &far, 0.01))),
            (event(3, "c"), Some(blend(&anchor, &far, 0.02))),
        ];
        let outcome = cluster_events(tight, 0.75, 64);
        assert_eq!(outcome.clusters.len(), 1);
        assert!(outcome.clusters[0].uncertainty() < 0.2);
    }

    #[test]
    fn test_singleton_maximally_uncertain() {
        let events = vec![(event(1, "alone"), Some(unit_vector("alone")))];
        let outcome = cluster_events(events, 0.75, 64);
        assert!((outcome.clusters[0].uncertainty() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cluster_cap_forces_absorption() {
        let events: Vec<_> = (0..5)
            .map(|i| {
                (
                    event(i, &format!("topic {i}")),
                    Some(unit_vector(&format!("topic {i}"))),
                )
            })
            .collect();
        let outcome = cluster_events(events, 0.99, 2);
        assert_eq!(outcome.clusters.len(), 2);
        let total: usize = outcome.clusters.iter().map(Cluster::len).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_empty_window_no_clusters() {
        let outcome = cluster_events(vec![], 0.75, 64);
        assert!(outcome.clusters.is_empty());
        assert_eq!(outcome.skipped, 0);
    }
}

//! Document-to-topic relevance.
//!
//! A document's relevance to a topic is the mean cosine similarity of all
//! its fragment embeddings to the topic centroid, clamped to `[0, 1]`.
//! Each (document, topic) pair is classified on its own, so a document can
//! be primary for several topics.

use crate::config::DiscoveryConfig;
use crate::models::{Classification, DocumentTopicDraft};
use crate::similarity::cosine_similarity;

pub fn relevance_score(fragment_vectors: &[&[f32]], centroid: &[f32]) -> f32 {
    if fragment_vectors.is_empty() {
        return 0.0;
    }
    let total: f32 = fragment_vectors
        .iter()
        .map(|v| cosine_similarity(v, centroid))
        .sum();
    (total / fragment_vectors.len() as f32).clamp(0.0, 1.0)
}

/// `score >= primary` is primary, `secondary <= score < primary` is
/// secondary, anything lower is not recorded.
pub fn classify(score: f32, primary: f32, secondary: f32) -> Option<Classification> {
    if score >= primary {
        Some(Classification::Primary)
    } else if score >= secondary {
        Some(Classification::Secondary)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelevanceScorer {
    pub primary_threshold: f32,
    pub secondary_threshold: f32,
}

impl RelevanceScorer {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            primary_threshold: config.primary_threshold,
            secondary_threshold: config.secondary_threshold,
        }
    }

    /// Score every document against every centroid.
    ///
    /// `documents` pairs a document id with its fragment vectors. Output is
    /// ordered by document, then topic index.
    pub fn score(
        &self,
        documents: &[(i64, Vec<&[f32]>)],
        centroids: &[Vec<f32>],
    ) -> Vec<DocumentTopicDraft> {
        let mut edges = Vec::new();
        for (document_id, vectors) in documents {
            for (topic_index, centroid) in centroids.iter().enumerate() {
                let score = relevance_score(vectors, centroid);
                if let Some(classification) =
                    classify(score, self.primary_threshold, self.secondary_threshold)
                {
                    edges.push(DocumentTopicDraft {
                        document_id: *document_id,
                        topic_index,
                        relevance_score: score,
                        classification,
                    });
                }
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(classify(0.72, 0.70, 0.60), Some(Classification::Primary));
        assert_eq!(classify(0.70, 0.70, 0.60), Some(Classification::Primary));
        assert_eq!(classify(0.65, 0.70, 0.60), Some(Classification::Secondary));
        assert_eq!(classify(0.60, 0.70, 0.60), Some(Classification::Secondary));
        assert_eq!(classify(0.40, 0.70, 0.60), None);
    }

    #[test]
    fn test_classification_monotonic() {
        let rank = |c: Option<Classification>| match c {
            None => 0,
            Some(Classification::Secondary) => 1,
            Some(Classification::Primary) => 2,
        };
        let mut last = 0;
        for i in 0..=100 {
            let r = rank(classify(i as f32 / 100.0, 0.70, 0.60));
            assert!(r >= last);
            last = r;
        }
    }

    #[test]
    fn test_score_is_mean_over_all_fragments() {
        let centroid = [1.0, 0.0];
        let aligned = [1.0f32, 0.0];
        let orthogonal = [0.0f32, 1.0];
        let score = relevance_score(&[&aligned, &orthogonal], &centroid);
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_score_clamped_to_unit_range() {
        let centroid = [1.0, 0.0];
        let opposite = [-1.0f32, 0.0];
        assert_eq!(relevance_score(&[&opposite], &centroid), 0.0);
        assert_eq!(relevance_score(&[], &centroid), 0.0);
    }

    #[test]
    fn test_scorer_records_only_classified_pairs() {
        let scorer = RelevanceScorer::from_config(&DiscoveryConfig::default());
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let documents = vec![(10, vec![&a[..]]), (11, vec![&b[..]])];
        let centroids = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let edges = scorer.score(&documents, &centroids);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].document_id, 10);
        assert_eq!(edges[0].topic_index, 0);
        assert_eq!(edges[1].document_id, 11);
        assert_eq!(edges[1].topic_index, 1);
        assert!(edges
            .iter()
            .all(|e| e.classification == Classification::Primary));
    }
}

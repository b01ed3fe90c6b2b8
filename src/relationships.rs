//! Topic relationship graph.
//!
//! Every pair of topic centroids is compared by cosine similarity; pairs at
//! or above the threshold become one undirected `SIMILAR` edge, stored with
//! the lower topic index as source.

use crate::models::{RelationshipDraft, TopicRelationship};
use crate::similarity::cosine_similarity;

pub const RELATIONSHIP_TYPE: &str = "SIMILAR";

pub fn build_relationships(centroids: &[Vec<f32>], threshold: f32) -> Vec<RelationshipDraft> {
    let mut edges = Vec::new();
    for i in 0..centroids.len() {
        for j in (i + 1)..centroids.len() {
            let similarity = cosine_similarity(&centroids[i], &centroids[j]);
            if similarity >= threshold {
                edges.push(RelationshipDraft {
                    source_index: i,
                    target_index: j,
                    similarity,
                });
            }
        }
    }
    edges
}

/// Topics linked to `topic_id`, strongest first.
pub fn neighbors(relationships: &[TopicRelationship], topic_id: i64) -> Vec<(i64, f64)> {
    let mut linked: Vec<(i64, f64)> = relationships
        .iter()
        .filter_map(|r| r.other(topic_id).map(|other| (other, r.similarity_score)))
        .collect();
    linked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    linked
}

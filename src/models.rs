//! Core data models used throughout the discovery pipeline.
//!
//! Persisted records (`Collection`, `Document`, `Topic`, ...) mirror the
//! SQLite schema in [`crate::migrate`]. The `*Draft` types and [`TopicSet`]
//! describe a freshly computed topic generation before it is committed and
//! before the store has assigned row ids.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::citation::FragmentRef;

#[derive(Debug, Clone, Serialize)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Documents changed since the last successful discovery run.
    pub is_stale: bool,
    /// Job whose topic generation is currently visible.
    pub active_job_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A document waiting to be added to a collection.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub body: String,
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub collection_id: i64,
    pub title: String,
    pub body: String,
    pub source_path: Option<String>,
    pub created_at: i64,
}

/// A bounded, overlapping excerpt of a document's text.
///
/// Fragments are addressed by `(document_id, fragment_index)`, which is
/// also their citation key (see [`FragmentRef`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub document_id: i64,
    pub fragment_index: i64,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

impl Fragment {
    pub fn reference(&self) -> FragmentRef {
        FragmentRef {
            document_id: self.document_id,
            fragment_index: self.fragment_index,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Topic {
    pub id: i64,
    pub collection_id: i64,
    pub job_id: i64,
    pub name: String,
    pub summary: String,
    pub keywords: Vec<String>,
    #[serde(skip)]
    pub centroid: Vec<f32>,
    pub document_count: i64,
    pub size_score: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct TopicInsight {
    pub summary: String,
    pub themes: Vec<String>,
    pub questions: Vec<String>,
    pub related_concepts: Vec<String>,
}

/// Strength of a document's association with a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Primary,
    Secondary,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Primary => "primary",
            Classification::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Classification::Primary),
            "secondary" => Ok(Classification::Secondary),
            other => anyhow::bail!("Unknown classification: '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentTopic {
    pub document_id: i64,
    pub document_title: String,
    pub topic_id: i64,
    pub relevance_score: f64,
    pub classification: Classification,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicRelationship {
    pub source_topic_id: i64,
    pub target_topic_id: i64,
    pub similarity_score: f64,
    pub relationship_type: String,
}

impl TopicRelationship {
    /// The endpoint opposite `topic_id`, if this edge touches it.
    pub fn other(&self, topic_id: i64) -> Option<i64> {
        if self.source_topic_id == topic_id {
            Some(self.target_topic_id)
        } else if self.target_topic_id == topic_id {
            Some(self.source_topic_id)
        } else {
            None
        }
    }
}

/// A topic computed by a discovery run, not yet persisted.
#[derive(Debug, Clone)]
pub struct TopicDraft {
    pub name: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub insight: TopicInsight,
    pub centroid: Vec<f32>,
    pub document_count: i64,
    pub size_score: f64,
}

/// Document-topic edge referencing a topic by its index in [`TopicSet::topics`].
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentTopicDraft {
    pub document_id: i64,
    pub topic_index: usize,
    pub relevance_score: f32,
    pub classification: Classification,
}

/// Undirected topic edge by topic index, stored with `source_index < target_index`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDraft {
    pub source_index: usize,
    pub target_index: usize,
    pub similarity: f32,
}

/// One complete topic generation for a collection, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct TopicSet {
    /// Highest document id the run read; newer documents keep the
    /// collection stale after the commit.
    pub max_document_id: i64,
    pub fragments: Vec<Fragment>,
    pub topics: Vec<TopicDraft>,
    pub document_topics: Vec<DocumentTopicDraft>,
    pub relationships: Vec<RelationshipDraft>,
}

/// A topic with everything a reader needs to display it.
#[derive(Debug, Clone, Serialize)]
pub struct TopicDetail {
    #[serde(flatten)]
    pub topic: Topic,
    pub insight: Option<TopicInsight>,
    pub documents: Vec<DocumentTopic>,
    pub related: Vec<TopicRelationship>,
}

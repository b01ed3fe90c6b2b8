//! SQLite persistence for collections, documents, jobs and topic generations.
//!
//! Job status changes are compare-and-set updates (`WHERE status = ?`), so
//! a job can never move backwards or be picked up twice. A finished run is
//! published by [`commit_topic_set`], which swaps the collection's whole
//! topic generation inside one transaction: readers see either the
//! previous generation or the new one.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::citation::FragmentRef;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::job::{self, DiscoveryError, DiscoveryJob, JobStatus, Stage};
use crate::models::{
    Collection, Document, DocumentTopic, Fragment, NewDocument, Topic, TopicDetail,
    TopicInsight, TopicRelationship, TopicSet,
};
use crate::relationships::RELATIONSHIP_TYPE;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============ Collections ============

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    #[serde(flatten)]
    pub collection: Collection,
    pub document_count: i64,
}

pub async fn create_collection(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
) -> Result<i64> {
    let ts = now();
    let result = sqlx::query(
        "INSERT INTO collections (name, description, is_stale, created_at, updated_at) VALUES (?, ?, 0, ?, ?)",
    )
    .bind(name)
    .bind(description)
    .bind(ts)
    .bind(ts)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

fn collection_from_row(row: &SqliteRow) -> Collection {
    Collection {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        is_stale: row.get::<i64, _>("is_stale") != 0,
        active_job_id: row.get("active_job_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn get_collection(pool: &SqlitePool, collection_id: i64) -> Result<Collection> {
    let row = sqlx::query(
        "SELECT id, name, description, is_stale, active_job_id, created_at, updated_at FROM collections WHERE id = ?",
    )
    .bind(collection_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(collection_from_row(&row)),
        None => Err(DiscoveryError::CollectionNotFound(collection_id).into()),
    }
}

pub async fn list_collections(pool: &SqlitePool) -> Result<Vec<CollectionSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.name, c.description, c.is_stale, c.active_job_id, c.created_at, c.updated_at,
               (SELECT COUNT(*) FROM documents d WHERE d.collection_id = c.id) AS document_count
        FROM collections c
        ORDER BY c.id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| CollectionSummary {
            collection: collection_from_row(row),
            document_count: row.get("document_count"),
        })
        .collect())
}

// ============ Documents ============

/// Add documents to a collection and mark it stale. Returns the new ids.
pub async fn add_documents(
    pool: &SqlitePool,
    collection_id: i64,
    documents: &[NewDocument],
) -> Result<Vec<i64>> {
    get_collection(pool, collection_id).await?;

    let ts = now();
    let mut tx = pool.begin().await?;
    let mut ids = Vec::with_capacity(documents.len());

    for doc in documents {
        let result = sqlx::query(
            "INSERT INTO documents (collection_id, title, body, source_path, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(collection_id)
        .bind(&doc.title)
        .bind(&doc.body)
        .bind(&doc.source_path)
        .bind(ts)
        .execute(&mut *tx)
        .await?;
        ids.push(result.last_insert_rowid());
    }

    if !documents.is_empty() {
        sqlx::query("UPDATE collections SET is_stale = 1, updated_at = ? WHERE id = ?")
            .bind(ts)
            .bind(collection_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(ids)
}

pub async fn list_documents(pool: &SqlitePool, collection_id: i64) -> Result<Vec<Document>> {
    let rows = sqlx::query(
        "SELECT id, collection_id, title, body, source_path, created_at FROM documents WHERE collection_id = ? ORDER BY id ASC",
    )
    .bind(collection_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Document {
            id: row.get("id"),
            collection_id: row.get("collection_id"),
            title: row.get("title"),
            body: row.get("body"),
            source_path: row.get("source_path"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Fragments of the collection's current generation, in document order.
pub async fn list_fragments(pool: &SqlitePool, collection_id: i64) -> Result<Vec<Fragment>> {
    let rows = sqlx::query(
        r#"
        SELECT f.document_id, f.fragment_index, f.text, f.embedding
        FROM fragments f
        JOIN documents d ON d.id = f.document_id
        WHERE d.collection_id = ?
        ORDER BY f.document_id ASC, f.fragment_index ASC
        "#,
    )
    .bind(collection_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Fragment {
            document_id: row.get("document_id"),
            fragment_index: row.get("fragment_index"),
            text: row.get("text"),
            embedding: row
                .get::<Option<Vec<u8>>, _>("embedding")
                .map(|blob| blob_to_vec(&blob)),
        })
        .collect())
}

/// A citation marker resolved to its stored fragment.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedCitation {
    pub reference: FragmentRef,
    pub document_title: String,
    pub text: String,
}

pub async fn resolve_citation(
    pool: &SqlitePool,
    reference: FragmentRef,
) -> Result<Option<ResolvedCitation>> {
    let row = sqlx::query(
        r#"
        SELECT d.title, f.text
        FROM fragments f
        JOIN documents d ON d.id = f.document_id
        WHERE f.document_id = ? AND f.fragment_index = ?
        "#,
    )
    .bind(reference.document_id)
    .bind(reference.fragment_index)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| ResolvedCitation {
        reference,
        document_title: row.get("title"),
        text: row.get("text"),
    }))
}

// ============ Jobs ============

/// Enqueue a PENDING job. Fails with [`DiscoveryError::ActiveJobExists`]
/// while another job for the collection is PENDING or RUNNING.
pub async fn create_job(pool: &SqlitePool, collection_id: i64) -> Result<i64> {
    get_collection(pool, collection_id).await?;

    let result = sqlx::query(
        "INSERT INTO discovery_jobs (collection_id, status, progress_step, progress_total, created_at) VALUES (?, 'PENDING', 0, ?, ?)",
    )
    .bind(collection_id)
    .bind(job::TOTAL_STEPS)
    .bind(now())
    .execute(pool)
    .await;

    match result {
        Ok(r) => Ok(r.last_insert_rowid()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            let job_id = active_job_id(pool, collection_id).await?.unwrap_or_default();
            Err(DiscoveryError::ActiveJobExists {
                collection_id,
                job_id,
            }
            .into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn active_job_id(pool: &SqlitePool, collection_id: i64) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM discovery_jobs WHERE collection_id = ? AND status IN ('PENDING', 'RUNNING')",
    )
    .bind(collection_id)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

pub async fn get_job(pool: &SqlitePool, job_id: i64) -> Result<DiscoveryJob> {
    let row = sqlx::query(
        r#"
        SELECT id, collection_id, status, progress_step, progress_total, progress_label,
               error_message, created_at, started_at, finished_at
        FROM discovery_jobs WHERE id = ?
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    let row = row.ok_or(DiscoveryError::JobNotFound(job_id))?;
    let status: String = row.get("status");

    Ok(DiscoveryJob {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        status: status.parse()?,
        progress_step: row.get("progress_step"),
        progress_total: row.get("progress_total"),
        progress_label: row.get("progress_label"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

async fn invalid_transition(pool: &SqlitePool, job_id: i64, to: JobStatus) -> anyhow::Error {
    match get_job(pool, job_id).await {
        Ok(job) => DiscoveryError::InvalidTransition {
            from: job.status,
            to,
        }
        .into(),
        Err(e) => e,
    }
}

/// PENDING -> RUNNING.
pub async fn mark_running(pool: &SqlitePool, job_id: i64) -> Result<()> {
    let result = sqlx::query(
        "UPDATE discovery_jobs SET status = 'RUNNING', started_at = ?, heartbeat_at = ?, error_message = NULL WHERE id = ? AND status = 'PENDING'",
    )
    .bind(now())
    .bind(now())
    .bind(job_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(invalid_transition(pool, job_id, JobStatus::Running).await);
    }
    Ok(())
}

/// Record the stage a RUNNING job has reached and renew its lease. Never
/// changes status.
pub async fn update_progress(pool: &SqlitePool, job_id: i64, stage: Stage) -> Result<()> {
    sqlx::query(
        "UPDATE discovery_jobs SET progress_step = ?, progress_label = ?, heartbeat_at = ?, error_message = NULL WHERE id = ? AND status = 'RUNNING'",
    )
    .bind(stage.step)
    .bind(stage.label)
    .bind(now())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// RUNNING -> FAILED, storing the message truncated to 500 chars.
pub async fn mark_failed(pool: &SqlitePool, job_id: i64, message: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE discovery_jobs SET status = 'FAILED', error_message = ?, finished_at = ? WHERE id = ? AND status = 'RUNNING'",
    )
    .bind(job::truncate_error(message))
    .bind(now())
    .bind(job_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(invalid_transition(pool, job_id, JobStatus::Failed).await);
    }
    Ok(())
}

/// Fail every RUNNING job of the collection whose last progress write is
/// at least `lease_secs` old. Returns the ids of the expired jobs.
///
/// A worker that died after [`mark_running`] never finishes its job; this
/// releases the collection's single active-job slot.
pub async fn expire_stale_jobs(
    pool: &SqlitePool,
    collection_id: i64,
    lease_secs: u64,
) -> Result<Vec<i64>> {
    let ts = now();
    let lease = i64::try_from(lease_secs).unwrap_or(i64::MAX);
    let cutoff = ts.saturating_sub(lease);

    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        UPDATE discovery_jobs
        SET status = 'FAILED', error_message = ?, finished_at = ?
        WHERE collection_id = ? AND status = 'RUNNING'
          AND COALESCE(heartbeat_at, started_at, created_at) <= ?
        RETURNING id
        "#,
    )
    .bind(format!("job lease expired after {}s without progress", lease_secs))
    .bind(ts)
    .bind(collection_id)
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

// ============ Topic generations ============

/// Replace the collection's topic generation with `set` and mark the job
/// SUCCEEDED, all in one transaction.
///
/// Old topics, insights, document-topic edges, relationships and fragments
/// are deleted; the new ones are inserted; the collection's
/// `active_job_id` points at `job_id`. The stale flag is cleared only when
/// no document newer than `set.max_document_id` was added during the run.
/// If any statement fails, or the job is no longer RUNNING, nothing changes.
pub async fn commit_topic_set(
    pool: &SqlitePool,
    collection_id: i64,
    job_id: i64,
    set: &TopicSet,
) -> Result<()> {
    let ts = now();
    let mut tx = pool.begin().await?;

    let finished = sqlx::query(
        "UPDATE discovery_jobs SET status = 'SUCCEEDED', progress_step = ?, progress_label = ?, error_message = NULL, finished_at = ? WHERE id = ? AND status = 'RUNNING'",
    )
    .bind(job::DONE.step)
    .bind(job::DONE.label)
    .bind(ts)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    if finished.rows_affected() == 0 {
        drop(tx);
        return Err(invalid_transition(pool, job_id, JobStatus::Succeeded).await);
    }

    // Retire the previous generation
    sqlx::query("DELETE FROM topic_relationships WHERE collection_id = ?")
        .bind(collection_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM document_topics WHERE topic_id IN (SELECT id FROM topics WHERE collection_id = ?)",
    )
    .bind(collection_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "DELETE FROM topic_insights WHERE topic_id IN (SELECT id FROM topics WHERE collection_id = ?)",
    )
    .bind(collection_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM topics WHERE collection_id = ?")
        .bind(collection_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM fragments WHERE document_id IN (SELECT id FROM documents WHERE collection_id = ?)",
    )
    .bind(collection_id)
    .execute(&mut *tx)
    .await?;

    for fragment in &set.fragments {
        sqlx::query(
            "INSERT INTO fragments (document_id, fragment_index, text, embedding) VALUES (?, ?, ?, ?)",
        )
        .bind(fragment.document_id)
        .bind(fragment.fragment_index)
        .bind(&fragment.text)
        .bind(fragment.embedding.as_deref().map(vec_to_blob))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to store fragment {}", fragment.reference()))?;
    }

    let mut topic_ids = Vec::with_capacity(set.topics.len());
    for topic in &set.topics {
        let result = sqlx::query(
            r#"
            INSERT INTO topics (collection_id, job_id, name, summary, keywords_json, centroid,
                                document_count, size_score, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(collection_id)
        .bind(job_id)
        .bind(&topic.name)
        .bind(&topic.summary)
        .bind(serde_json::to_string(&topic.keywords)?)
        .bind(vec_to_blob(&topic.centroid))
        .bind(topic.document_count)
        .bind(topic.size_score)
        .bind(ts)
        .execute(&mut *tx)
        .await?;
        let topic_id = result.last_insert_rowid();

        sqlx::query(
            r#"
            INSERT INTO topic_insights (topic_id, summary, themes_json, questions_json, related_concepts_json)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(topic_id)
        .bind(&topic.insight.summary)
        .bind(serde_json::to_string(&topic.insight.themes)?)
        .bind(serde_json::to_string(&topic.insight.questions)?)
        .bind(serde_json::to_string(&topic.insight.related_concepts)?)
        .execute(&mut *tx)
        .await?;

        topic_ids.push(topic_id);
    }

    let topic_id = |index: usize| {
        topic_ids
            .get(index)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("topic index {} out of range", index))
    };

    for edge in &set.document_topics {
        sqlx::query(
            "INSERT INTO document_topics (document_id, topic_id, relevance_score, classification) VALUES (?, ?, ?, ?)",
        )
        .bind(edge.document_id)
        .bind(topic_id(edge.topic_index)?)
        .bind(edge.relevance_score as f64)
        .bind(edge.classification.as_str())
        .execute(&mut *tx)
        .await?;
    }

    for rel in &set.relationships {
        let a = topic_id(rel.source_index)?;
        let b = topic_id(rel.target_index)?;
        sqlx::query(
            r#"
            INSERT INTO topic_relationships (collection_id, source_topic_id, target_topic_id,
                                             similarity_score, relationship_type)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(collection_id)
        .bind(a.min(b))
        .bind(a.max(b))
        .bind(rel.similarity as f64)
        .bind(RELATIONSHIP_TYPE)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        UPDATE collections
        SET active_job_id = ?,
            is_stale = EXISTS (SELECT 1 FROM documents WHERE collection_id = ? AND id > ?),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(job_id)
    .bind(collection_id)
    .bind(set.max_document_id)
    .bind(ts)
    .bind(collection_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

fn json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn topic_from_row(row: &SqliteRow) -> Topic {
    let keywords: String = row.get("keywords_json");
    let centroid: Vec<u8> = row.get("centroid");
    Topic {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        job_id: row.get("job_id"),
        name: row.get("name"),
        summary: row.get("summary"),
        keywords: json_list(&keywords),
        centroid: blob_to_vec(&centroid),
        document_count: row.get("document_count"),
        size_score: row.get("size_score"),
        created_at: row.get("created_at"),
    }
}

async fn fetch_topics(conn: &mut SqliteConnection, collection_id: i64) -> Result<Vec<Topic>> {
    let rows = sqlx::query(
        r#"
        SELECT id, collection_id, job_id, name, summary, keywords_json, centroid,
               document_count, size_score, created_at
        FROM topics WHERE collection_id = ?
        ORDER BY document_count DESC, id ASC
        "#,
    )
    .bind(collection_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(topic_from_row).collect())
}

async fn fetch_insight(conn: &mut SqliteConnection, topic_id: i64) -> Result<Option<TopicInsight>> {
    let row = sqlx::query(
        "SELECT summary, themes_json, questions_json, related_concepts_json FROM topic_insights WHERE topic_id = ?",
    )
    .bind(topic_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| {
        let themes: String = row.get("themes_json");
        let questions: String = row.get("questions_json");
        let related: String = row.get("related_concepts_json");
        TopicInsight {
            summary: row.get("summary"),
            themes: json_list(&themes),
            questions: json_list(&questions),
            related_concepts: json_list(&related),
        }
    }))
}

async fn fetch_topic_documents(
    conn: &mut SqliteConnection,
    topic_id: i64,
) -> Result<Vec<DocumentTopic>> {
    let rows = sqlx::query(
        r#"
        SELECT dt.document_id, d.title, dt.topic_id, dt.relevance_score, dt.classification
        FROM document_topics dt
        JOIN documents d ON d.id = dt.document_id
        WHERE dt.topic_id = ?
        ORDER BY dt.relevance_score DESC, dt.document_id ASC
        "#,
    )
    .bind(topic_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<DocumentTopic> {
            let classification: String = row.get("classification");
            Ok(DocumentTopic {
                document_id: row.get("document_id"),
                document_title: row.get("title"),
                topic_id: row.get("topic_id"),
                relevance_score: row.get("relevance_score"),
                classification: classification.parse()?,
            })
        })
        .collect()
}

async fn fetch_relationships(
    conn: &mut SqliteConnection,
    collection_id: i64,
) -> Result<Vec<TopicRelationship>> {
    let rows = sqlx::query(
        r#"
        SELECT source_topic_id, target_topic_id, similarity_score, relationship_type
        FROM topic_relationships WHERE collection_id = ?
        ORDER BY similarity_score DESC, source_topic_id ASC, target_topic_id ASC
        "#,
    )
    .bind(collection_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| TopicRelationship {
            source_topic_id: row.get("source_topic_id"),
            target_topic_id: row.get("target_topic_id"),
            similarity_score: row.get("similarity_score"),
            relationship_type: row.get("relationship_type"),
        })
        .collect())
}

/// Topics of the collection's current generation, largest first.
pub async fn list_topics(pool: &SqlitePool, collection_id: i64) -> Result<Vec<Topic>> {
    let mut conn = pool.acquire().await?;
    fetch_topics(&mut conn, collection_id).await
}

pub async fn get_insight(pool: &SqlitePool, topic_id: i64) -> Result<Option<TopicInsight>> {
    let mut conn = pool.acquire().await?;
    fetch_insight(&mut conn, topic_id).await
}

/// Documents attached to a topic, most relevant first.
pub async fn topic_documents(pool: &SqlitePool, topic_id: i64) -> Result<Vec<DocumentTopic>> {
    let mut conn = pool.acquire().await?;
    fetch_topic_documents(&mut conn, topic_id).await
}

/// Relationship edges of the current generation, strongest first.
pub async fn list_relationships(
    pool: &SqlitePool,
    collection_id: i64,
) -> Result<Vec<TopicRelationship>> {
    let mut conn = pool.acquire().await?;
    fetch_relationships(&mut conn, collection_id).await
}

/// Every topic of the current generation with its insight, documents and
/// relationships.
///
/// Reads run in one transaction so a concurrent commit cannot mix two
/// generations into the result.
pub async fn topic_details(pool: &SqlitePool, collection_id: i64) -> Result<Vec<TopicDetail>> {
    let mut tx = pool.begin().await?;

    let topics = fetch_topics(&mut tx, collection_id).await?;
    let relationships = fetch_relationships(&mut tx, collection_id).await?;

    let mut details = Vec::with_capacity(topics.len());
    for topic in topics {
        let insight = fetch_insight(&mut tx, topic.id).await?;
        let documents = fetch_topic_documents(&mut tx, topic.id).await?;
        let related = relationships
            .iter()
            .filter(|r| r.other(topic.id).is_some())
            .cloned()
            .collect();

        details.push(TopicDetail {
            topic,
            insight,
            documents,
            related,
        });
    }

    tx.commit().await?;
    Ok(details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use crate::models::{
        Classification, DocumentTopicDraft, RelationshipDraft, TopicDraft,
    };
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        pool
    }

    fn doc(title: &str, body: &str) -> NewDocument {
        NewDocument {
            title: title.to_string(),
            body: body.to_string(),
            source_path: None,
        }
    }

    fn draft(name: &str, centroid: Vec<f32>) -> TopicDraft {
        TopicDraft {
            name: name.to_string(),
            summary: format!("{} summary", name),
            keywords: vec![name.to_lowercase()],
            insight: TopicInsight {
                summary: format!("About {}", name),
                themes: vec!["t".to_string()],
                questions: vec![],
                related_concepts: vec![],
            },
            centroid,
            document_count: 1,
            size_score: 1.0,
        }
    }

    fn set_for(doc_id: i64, names: &[&str]) -> TopicSet {
        TopicSet {
            max_document_id: doc_id,
            fragments: vec![Fragment {
                document_id: doc_id,
                fragment_index: 0,
                text: "fragment text".to_string(),
                embedding: Some(vec![1.0, 0.0]),
            }],
            topics: names
                .iter()
                .map(|n| draft(n, vec![1.0, 0.0]))
                .collect(),
            document_topics: vec![DocumentTopicDraft {
                document_id: doc_id,
                topic_index: 0,
                relevance_score: 0.9,
                classification: Classification::Primary,
            }],
            relationships: if names.len() > 1 {
                vec![RelationshipDraft {
                    source_index: 0,
                    target_index: 1,
                    similarity: 0.5,
                }]
            } else {
                vec![]
            },
        }
    }

    #[tokio::test]
    async fn test_adding_documents_marks_collection_stale() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        assert!(!get_collection(&pool, cid).await.unwrap().is_stale);
        add_documents(&pool, cid, &[doc("a", "alpha")]).await.unwrap();
        assert!(get_collection(&pool, cid).await.unwrap().is_stale);
        let summaries = list_collections(&pool).await.unwrap();
        assert_eq!(summaries[0].document_count, 1);
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let pool = memory_pool().await;
        let err = create_job(&pool, 99).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DiscoveryError>(),
            Some(DiscoveryError::CollectionNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_second_active_job_rejected() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let first = create_job(&pool, cid).await.unwrap();
        let err = create_job(&pool, cid).await.unwrap_err();
        match err.downcast_ref::<DiscoveryError>() {
            Some(DiscoveryError::ActiveJobExists { job_id, .. }) => assert_eq!(*job_id, first),
            other => panic!("unexpected error: {:?}", other),
        }

        mark_running(&pool, first).await.unwrap();
        mark_failed(&pool, first, "boom").await.unwrap();
        assert!(create_job(&pool, cid).await.is_ok());
    }

    #[tokio::test]
    async fn test_transitions_are_monotonic() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let job_id = create_job(&pool, cid).await.unwrap();

        assert!(mark_failed(&pool, job_id, "early").await.is_err());
        mark_running(&pool, job_id).await.unwrap();
        assert!(mark_running(&pool, job_id).await.is_err());
        mark_failed(&pool, job_id, &"x".repeat(900)).await.unwrap();

        let err = mark_running(&pool, job_id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DiscoveryError>(),
            Some(DiscoveryError::InvalidTransition {
                from: JobStatus::Failed,
                to: JobStatus::Running
            })
        ));

        let job = get_job(&pool, job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.unwrap().len(), job::MAX_ERROR_CHARS);
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_progress_does_not_change_status() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let job_id = create_job(&pool, cid).await.unwrap();
        mark_running(&pool, job_id).await.unwrap();
        update_progress(&pool, job_id, job::CLUSTERING).await.unwrap();
        let job = get_job(&pool, job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress_step, 3);
        assert_eq!(job.progress_label.as_deref(), Some("clustering"));
    }

    #[tokio::test]
    async fn test_commit_replaces_previous_generation() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let ids = add_documents(&pool, cid, &[doc("a", "alpha")]).await.unwrap();

        let first = create_job(&pool, cid).await.unwrap();
        mark_running(&pool, first).await.unwrap();
        commit_topic_set(&pool, cid, first, &set_for(ids[0], &["Old A", "Old B"]))
            .await
            .unwrap();
        assert_eq!(list_topics(&pool, cid).await.unwrap().len(), 2);
        assert_eq!(list_relationships(&pool, cid).await.unwrap().len(), 1);

        let second = create_job(&pool, cid).await.unwrap();
        mark_running(&pool, second).await.unwrap();
        commit_topic_set(&pool, cid, second, &set_for(ids[0], &["New"]))
            .await
            .unwrap();

        let details = topic_details(&pool, cid).await.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].topic.name, "New");
        assert_eq!(details[0].topic.job_id, second);
        assert_eq!(details[0].insight.as_ref().unwrap().summary, "About New");
        assert_eq!(details[0].documents.len(), 1);
        assert_eq!(details[0].documents[0].document_title, "a");
        assert!(details[0].related.is_empty());
        assert!(list_relationships(&pool, cid).await.unwrap().is_empty());

        let collection = get_collection(&pool, cid).await.unwrap();
        assert_eq!(collection.active_job_id, Some(second));
        assert!(!collection.is_stale);
        assert_eq!(get_job(&pool, second).await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_previous_generation() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let ids = add_documents(&pool, cid, &[doc("a", "alpha")]).await.unwrap();

        let first = create_job(&pool, cid).await.unwrap();
        mark_running(&pool, first).await.unwrap();
        commit_topic_set(&pool, cid, first, &set_for(ids[0], &["Kept"]))
            .await
            .unwrap();

        let second = create_job(&pool, cid).await.unwrap();
        mark_running(&pool, second).await.unwrap();
        let mut broken = set_for(ids[0], &["Lost"]);
        broken.document_topics[0].topic_index = 7;
        assert!(commit_topic_set(&pool, cid, second, &broken).await.is_err());

        let topics = list_topics(&pool, cid).await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].name, "Kept");
        assert_eq!(get_job(&pool, second).await.unwrap().status, JobStatus::Running);
        assert_eq!(list_fragments(&pool, cid).await.unwrap().len(), 1);
    }

    /// Push a job's progress timestamps `secs` into the past.
    async fn age_job(pool: &SqlitePool, job_id: i64, secs: i64) {
        sqlx::query(
            "UPDATE discovery_jobs SET started_at = started_at - ?, heartbeat_at = heartbeat_at - ? WHERE id = ?",
        )
        .bind(secs)
        .bind(secs)
        .bind(job_id)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_expire_stale_jobs_frees_the_active_slot() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let other = create_collection(&pool, "other", None).await.unwrap();

        let stuck = create_job(&pool, cid).await.unwrap();
        mark_running(&pool, stuck).await.unwrap();
        let pending = create_job(&pool, other).await.unwrap();

        assert!(expire_stale_jobs(&pool, cid, 60).await.unwrap().is_empty());
        assert!(create_job(&pool, cid).await.is_err());

        age_job(&pool, stuck, 120).await;
        assert_eq!(expire_stale_jobs(&pool, cid, 60).await.unwrap(), vec![stuck]);
        assert!(expire_stale_jobs(&pool, other, 60).await.unwrap().is_empty());

        let job = get_job(&pool, stuck).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("lease expired"));
        assert!(job.finished_at.is_some());
        assert_eq!(get_job(&pool, pending).await.unwrap().status, JobStatus::Pending);

        assert!(create_job(&pool, cid).await.is_ok());
    }

    #[tokio::test]
    async fn test_progress_renews_the_lease() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let job_id = create_job(&pool, cid).await.unwrap();
        mark_running(&pool, job_id).await.unwrap();

        age_job(&pool, job_id, 120).await;
        update_progress(&pool, job_id, job::EMBEDDING).await.unwrap();

        assert!(expire_stale_jobs(&pool, cid, 60).await.unwrap().is_empty());
        assert_eq!(get_job(&pool, job_id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_documents_added_during_run_keep_collection_stale() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let ids = add_documents(&pool, cid, &[doc("a", "alpha")]).await.unwrap();

        let job_id = create_job(&pool, cid).await.unwrap();
        mark_running(&pool, job_id).await.unwrap();
        let set = set_for(ids[0], &["Only"]);
        add_documents(&pool, cid, &[doc("late", "arrived mid-run")])
            .await
            .unwrap();
        commit_topic_set(&pool, cid, job_id, &set).await.unwrap();

        let collection = get_collection(&pool, cid).await.unwrap();
        assert_eq!(collection.active_job_id, Some(job_id));
        assert!(collection.is_stale);
    }

    #[tokio::test]
    async fn test_commit_requires_running_job() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let job_id = create_job(&pool, cid).await.unwrap();
        assert!(commit_topic_set(&pool, cid, job_id, &TopicSet::default())
            .await
            .is_err());
        assert_eq!(get_job(&pool, job_id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_resolve_citation() {
        let pool = memory_pool().await;
        let cid = create_collection(&pool, "c", None).await.unwrap();
        let ids = add_documents(&pool, cid, &[doc("Guide", "alpha")]).await.unwrap();
        let job_id = create_job(&pool, cid).await.unwrap();
        mark_running(&pool, job_id).await.unwrap();
        commit_topic_set(&pool, cid, job_id, &set_for(ids[0], &["T"]))
            .await
            .unwrap();

        let reference = FragmentRef {
            document_id: ids[0],
            fragment_index: 0,
        };
        let resolved = resolve_citation(&pool, reference).await.unwrap().unwrap();
        assert_eq!(resolved.document_title, "Guide");
        assert_eq!(resolved.text, "fragment text");

        let missing = FragmentRef {
            document_id: ids[0],
            fragment_index: 5,
        };
        assert!(resolve_citation(&pool, missing).await.unwrap().is_none());

        let fragments = list_fragments(&pool, cid).await.unwrap();
        assert_eq!(fragments[0].embedding, Some(vec![1.0, 0.0]));
    }
}
